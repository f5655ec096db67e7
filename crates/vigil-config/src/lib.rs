pub mod engine;
pub mod loader;

pub use engine::{ChannelConfig, EngineConfig, HttpCheckConfig, LogFormat, LoggingConfig, ServerConfig};
pub use loader::ConfigLoader;
