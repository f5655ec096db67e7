use crate::source::{MetricSource, Observation, SourceError};
use std::sync::Mutex;
use sysinfo::System;
use tracing::debug;

/// 系统指标来源（CPU、内存）
pub struct SystemSource {
    system: Mutex<System>,
}

impl SystemSource {
    pub fn new() -> Self {
        let mut system = System::new();
        // CPU 使用率需要两次刷新之间的差值，先刷新一次作为基准
        system.refresh_cpu();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SystemSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricSource for SystemSource {
    fn name(&self) -> &str {
        "system"
    }

    fn sample(&self) -> Result<Vec<Observation>, SourceError> {
        let mut system = self
            .system
            .lock()
            .map_err(|_| SourceError::Unavailable("system info lock poisoned".to_string()))?;

        system.refresh_cpu();
        system.refresh_memory();

        let cpu_percent = system.global_cpu_info().cpu_usage() as f64;
        let memory_used = system.used_memory();
        let memory_total = system.total_memory();
        let memory_percent = if memory_total > 0 {
            memory_used as f64 / memory_total as f64 * 100.0
        } else {
            0.0
        };

        debug!(
            cpu_percent,
            memory_used_mb = memory_used / 1024 / 1024,
            "System metrics sampled"
        );

        Ok(vec![
            Observation::new("system_cpu_percent", cpu_percent),
            Observation::new("system_memory_used_bytes", memory_used as f64),
            Observation::new("system_memory_percent", memory_percent),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_source_sample() {
        let source = SystemSource::new();
        let readings = source.sample().unwrap();

        let names: Vec<&str> = readings.iter().map(|o| o.metric.as_str()).collect();
        assert!(names.contains(&"system_cpu_percent"));
        assert!(names.contains(&"system_memory_used_bytes"));

        let memory_percent = readings
            .iter()
            .find(|o| o.metric == "system_memory_percent")
            .unwrap();
        assert!((0.0..=100.0).contains(&memory_percent.value));
    }
}
