pub mod breaker;
pub mod dispatcher;
pub mod message;
pub mod notifier;
pub mod providers;
pub mod retry;

pub use breaker::{BreakerPermit, CircuitBreaker, CircuitState};
pub use dispatcher::{
    ChannelOutcome, ChannelState, DeliveryReport, DeliveryStatus, DispatcherConfig,
    NotificationDispatcher,
};
pub use message::{NotifyKind, NotifyMessage};
pub use notifier::{DeliveryError, Notifier};
pub use providers::{
    ChannelSettings, ChatConfig, ChatNotifier, EmailConfig, EmailNotifier, WebhookConfig,
    WebhookNotifier,
};
pub use retry::RetryPolicy;
