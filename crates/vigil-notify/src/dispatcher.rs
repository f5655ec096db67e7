use crate::breaker::{CircuitBreaker, CircuitState};
use crate::message::NotifyMessage;
use crate::notifier::{DeliveryError, Notifier};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use vigil_alert::AlertTransition;
use vigil_core::{Result, VigilError};
use vigil_metrics::InternalMetrics;

/// 分发器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// 单次发送超时（毫秒）
    pub send_timeout_ms: u64,
    /// 连续失败多少次后熔断
    pub failure_threshold: u32,
    /// 熔断持续时间（毫秒）
    pub open_cooldown_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: 10_000,
            failure_threshold: 5,
            open_cooldown_ms: 60_000,
            retry: RetryPolicy::default(),
        }
    }
}

impl DispatcherConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn open_cooldown(&self) -> Duration {
        Duration::from_millis(self.open_cooldown_ms)
    }
}

struct Channel {
    name: String,
    notifier: Arc<dyn Notifier>,
    breaker: CircuitBreaker,
}

/// 渠道状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelState {
    pub name: String,
    pub kind: String,
    pub circuit: CircuitState,
    pub consecutive_failures: u32,
}

/// 单个渠道的投递结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Delivered,
    Failed,
    CircuitOpen,
    UnknownChannel,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::CircuitOpen => "circuit_open",
            DeliveryStatus::UnknownChannel => "unknown_channel",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelOutcome {
    pub channel: String,
    pub status: DeliveryStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 一次分发的结果，每个渠道一条
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub outcomes: Vec<ChannelOutcome>,
}

impl DeliveryReport {
    pub fn outcome(&self, channel: &str) -> Option<&ChannelOutcome> {
        self.outcomes.iter().find(|o| o.channel == channel)
    }

    pub fn delivered(&self) -> usize {
        self.count(DeliveryStatus::Delivered)
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.delivered()
    }

    fn count(&self, status: DeliveryStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }
}

/// 通知分发器
///
/// 每个渠道独立、并发投递，带熔断和重试；一个渠道失败不影响其他渠道。
pub struct NotificationDispatcher {
    config: DispatcherConfig,
    channels: RwLock<BTreeMap<String, Arc<Channel>>>,
    internal: Arc<InternalMetrics>,
}

impl NotificationDispatcher {
    pub fn new(config: DispatcherConfig, internal: Arc<InternalMetrics>) -> Self {
        Self {
            config,
            channels: RwLock::new(BTreeMap::new()),
            internal,
        }
    }

    pub async fn register_channel(&self, name: &str, notifier: Arc<dyn Notifier>) -> Result<()> {
        let mut channels = self.channels.write().await;
        if channels.contains_key(name) {
            return Err(VigilError::DuplicateChannel(name.to_string()));
        }

        info!(channel = %name, kind = notifier.kind(), "Notification channel registered");
        channels.insert(
            name.to_string(),
            Arc::new(Channel {
                name: name.to_string(),
                notifier,
                breaker: CircuitBreaker::new(
                    self.config.failure_threshold,
                    self.config.open_cooldown(),
                ),
            }),
        );
        Ok(())
    }

    pub async fn remove_channel(&self, name: &str) -> Result<()> {
        if self.channels.write().await.remove(name).is_none() {
            return Err(VigilError::NotFound(format!("channel '{}'", name)));
        }
        info!(channel = %name, "Notification channel removed");
        Ok(())
    }

    pub async fn channel_names(&self) -> Vec<String> {
        self.channels.read().await.keys().cloned().collect()
    }

    pub async fn channel_states(&self) -> Vec<ChannelState> {
        let channels: Vec<Arc<Channel>> = self.channels.read().await.values().cloned().collect();

        let mut states = Vec::with_capacity(channels.len());
        for channel in channels {
            states.push(ChannelState {
                name: channel.name.clone(),
                kind: channel.notifier.kind().to_string(),
                circuit: channel.breaker.state().await,
                consecutive_failures: channel.breaker.consecutive_failures().await,
            });
        }
        states
    }

    /// 分发告警状态变化；`channels` 为空时发送到所有渠道
    pub async fn deliver(&self, transition: &AlertTransition, channels: &[String]) -> DeliveryReport {
        self.deliver_message(NotifyMessage::from_transition(transition), channels)
            .await
    }

    /// 分发消息；从不返回错误，失败体现在报告中
    pub async fn deliver_message(&self, message: NotifyMessage, channels: &[String]) -> DeliveryReport {
        let registered = self.channels.read().await;

        let mut report = DeliveryReport::default();
        let mut targets = Vec::new();

        if channels.is_empty() {
            targets.extend(registered.values().cloned());
        } else {
            for name in channels {
                match registered.get(name) {
                    Some(channel) => targets.push(Arc::clone(channel)),
                    None => {
                        warn!(channel = %name, "Unknown notification channel");
                        self.internal
                            .record_notification(name, DeliveryStatus::UnknownChannel.as_str());
                        report.outcomes.push(ChannelOutcome {
                            channel: name.clone(),
                            status: DeliveryStatus::UnknownChannel,
                            attempts: 0,
                            error: None,
                        });
                    }
                }
            }
        }
        drop(registered);

        let message = Arc::new(message);
        let mut pending = BTreeSet::new();
        let mut sends = JoinSet::new();
        for channel in targets {
            pending.insert(channel.name.clone());
            let message = Arc::clone(&message);
            let config = self.config.clone();
            let internal = Arc::clone(&self.internal);
            sends.spawn(async move { deliver_to(channel, message, config, internal).await });
        }

        while let Some(joined) = sends.join_next().await {
            match joined {
                Ok(outcome) => {
                    pending.remove(&outcome.channel);
                    report.outcomes.push(outcome);
                }
                Err(e) => {
                    warn!(error = %e, "Notification task failed");
                    self.internal.record_suppressed("notify", "join");
                }
            }
        }

        // 任务异常结束的渠道同样记为失败
        for channel in pending {
            self.internal
                .record_notification(&channel, DeliveryStatus::Failed.as_str());
            report.outcomes.push(ChannelOutcome {
                channel,
                status: DeliveryStatus::Failed,
                attempts: 0,
                error: Some("delivery task aborted".to_string()),
            });
        }

        report.outcomes.sort_by(|a, b| a.channel.cmp(&b.channel));
        debug!(
            rule = %message.rule_name,
            delivered = report.delivered(),
            failed = report.failed(),
            "Notification dispatched"
        );
        report
    }

    /// 通过正常投递路径向单个渠道发送测试消息
    pub async fn send_test(&self, channel: &str) -> Result<ChannelOutcome> {
        if !self.channels.read().await.contains_key(channel) {
            return Err(VigilError::NotFound(format!("channel '{}'", channel)));
        }

        let report = self
            .deliver_message(NotifyMessage::test(channel), &[channel.to_string()])
            .await;
        report
            .outcomes
            .into_iter()
            .next()
            .ok_or_else(|| VigilError::NotFound(format!("channel '{}'", channel)))
    }
}

/// 向单个渠道投递：熔断检查、超时、可重试错误的指数退避重试
///
/// 熔断许可在函数内持有；调用方被取消时许可随之释放。
async fn deliver_to(
    channel: Arc<Channel>,
    message: Arc<NotifyMessage>,
    config: DispatcherConfig,
    internal: Arc<InternalMetrics>,
) -> ChannelOutcome {
    let Some(permit) = channel.breaker.try_acquire().await else {
        debug!(channel = %channel.name, "Circuit open, delivery short-circuited");
        internal.record_notification(&channel.name, DeliveryStatus::CircuitOpen.as_str());
        return ChannelOutcome {
            channel: channel.name.clone(),
            status: DeliveryStatus::CircuitOpen,
            attempts: 0,
            error: None,
        };
    };

    let max_attempts = config.retry.max_attempts();
    let send_timeout = config.send_timeout();
    let mut attempts = 0;

    let last_error = loop {
        attempts += 1;

        match send_once(&channel, &message, send_timeout).await {
            Ok(()) => {
                channel.breaker.on_success(permit).await;
                internal.record_notification(&channel.name, DeliveryStatus::Delivered.as_str());
                debug!(channel = %channel.name, attempts, "Notification delivered");
                return ChannelOutcome {
                    channel: channel.name.clone(),
                    status: DeliveryStatus::Delivered,
                    attempts,
                    error: None,
                };
            }
            Err(e) if e.is_transient() && attempts < max_attempts => {
                let delay = config.retry.delay_for(attempts);
                debug!(
                    channel = %channel.name,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient delivery failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => break e,
        }
    };

    channel.breaker.on_failure(permit).await;
    internal.record_notification(&channel.name, DeliveryStatus::Failed.as_str());
    internal.record_suppressed("notify", last_error.kind());
    warn!(
        channel = %channel.name,
        attempts,
        error = %last_error,
        "Notification delivery failed"
    );

    ChannelOutcome {
        channel: channel.name.clone(),
        status: DeliveryStatus::Failed,
        attempts,
        error: Some(last_error.to_string()),
    }
}

/// 单次发送在派生任务中执行，超时在任务内部施加；notifier panic 转为投递错误
async fn send_once(
    channel: &Channel,
    message: &Arc<NotifyMessage>,
    send_timeout: Duration,
) -> std::result::Result<(), DeliveryError> {
    let notifier = Arc::clone(&channel.notifier);
    let message = Arc::clone(message);

    let handle = tokio::spawn(async move {
        tokio::time::timeout(send_timeout, notifier.send(&message)).await
    });

    match handle.await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(DeliveryError::Timeout(send_timeout)),
        Err(e) => Err(DeliveryError::Panicked(e.to_string())),
    }
}
