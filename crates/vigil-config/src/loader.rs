use anyhow::{anyhow, Result};
use config::{Config, Environment, File, FileFormat};
use std::path::{Path, PathBuf};

use crate::EngineConfig;

const DEFAULT_ENV_PREFIX: &str = "VIGIL";

/// 配置加载器
///
/// 文件为 TOML，环境变量覆盖文件中的值，例如 `VIGIL__SERVER__PORT=8080`。
pub struct ConfigLoader {
    path: PathBuf,
    env_prefix: String,
}

impl ConfigLoader {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            env_prefix: DEFAULT_ENV_PREFIX.to_string(),
        }
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// 加载并校验配置；文件不存在时使用默认配置
    pub fn load(&self) -> Result<EngineConfig> {
        let mut builder = Config::builder();

        if self.path.exists() {
            builder = builder.add_source(File::new(
                self.path
                    .to_str()
                    .ok_or_else(|| anyhow!("Invalid config path"))?,
                FileFormat::Toml,
            ));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(&self.env_prefix)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let engine: EngineConfig = config.try_deserialize()?;
        engine
            .validate()
            .map_err(|e| anyhow!("Invalid configuration: {}", e))?;
        Ok(engine)
    }
}
