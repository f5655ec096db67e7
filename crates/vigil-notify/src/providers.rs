use crate::message::NotifyMessage;
use crate::notifier::{DeliveryError, Notifier};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// 渠道配置（配置文件中以 `type` 区分）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChannelSettings {
    Webhook(WebhookConfig),
    Chat(ChatConfig),
    Email(EmailConfig),
}

impl ChannelSettings {
    pub fn build(&self) -> Result<Arc<dyn Notifier>, DeliveryError> {
        Ok(match self {
            ChannelSettings::Webhook(config) => Arc::new(WebhookNotifier::new(config.clone())),
            ChannelSettings::Chat(config) => Arc::new(ChatNotifier::new(config.clone())),
            ChannelSettings::Email(config) => Arc::new(EmailNotifier::new(config.clone())?),
        })
    }
}

// ============================================================================
// Webhook 通知
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// 通用 Webhook：POST 完整的 JSON 消息
pub struct WebhookNotifier {
    config: WebhookConfig,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(config: WebhookConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn kind(&self) -> &'static str {
        "webhook"
    }

    async fn send(&self, message: &NotifyMessage) -> Result<(), DeliveryError> {
        let mut request = self.client.post(&self.config.url);
        for (key, value) in &self.config.headers {
            request = request.header(key, value);
        }

        let response = request.json(message).send().await?;
        DeliveryError::check_status(response.status())
    }
}

// ============================================================================
// 聊天机器人通知（markdown webhook）
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatConfig {
    pub webhook_url: String,
}

pub struct ChatNotifier {
    config: ChatConfig,
    client: reqwest::Client,
}

impl ChatNotifier {
    pub fn new(config: ChatConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn build_message(&self, message: &NotifyMessage) -> serde_json::Value {
        serde_json::json!({
            "msgtype": "markdown",
            "markdown": {
                "title": message.title,
                "text": message.render_markdown(),
            },
            "severity": message.severity,
            "rule": message.rule_name,
            "current_value": message.current_value,
            "threshold_value": message.threshold_value,
            "timestamp": message.timestamp,
        })
    }
}

#[async_trait]
impl Notifier for ChatNotifier {
    fn kind(&self) -> &'static str {
        "chat"
    }

    async fn send(&self, message: &NotifyMessage) -> Result<(), DeliveryError> {
        let body = self.build_message(message);

        let response = self
            .client
            .post(&self.config.webhook_url)
            .json(&body)
            .send()
            .await?;

        DeliveryError::check_status(response.status())
    }
}

// ============================================================================
// 邮件通知
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailConfig {
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub from: String,
    pub to: Vec<String>,
    /// 使用 TLS 连接
    #[serde(default = "default_tls")]
    pub tls: bool,
}

fn default_smtp_port() -> u16 {
    587
}

fn default_tls() -> bool {
    true
}

pub struct EmailNotifier {
    from: Mailbox,
    to: Vec<Mailbox>,
    mailer: AsyncSmtpTransport<Tokio1Executor>,
}

impl EmailNotifier {
    /// 创建邮件通知器；地址或服务器配置错误属于不可重试错误
    pub fn new(config: EmailConfig) -> Result<Self, DeliveryError> {
        let from: Mailbox = config
            .from
            .parse()
            .map_err(|e| DeliveryError::Permanent(format!("invalid from address: {}", e)))?;

        if config.to.is_empty() {
            return Err(DeliveryError::Permanent("no recipients configured".to_string()));
        }
        let to = config
            .to
            .iter()
            .map(|addr| {
                addr.parse::<Mailbox>().map_err(|e| {
                    DeliveryError::Permanent(format!("invalid recipient {}: {}", addr, e))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let builder = if config.tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)
                .map_err(|e| DeliveryError::Permanent(format!("invalid SMTP relay: {}", e)))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.smtp_host)
        };

        let mut builder = builder.port(config.smtp_port);
        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ));
        }

        Ok(Self {
            from,
            to,
            mailer: builder.build(),
        })
    }

    fn build_email(&self, message: &NotifyMessage) -> Result<Message, DeliveryError> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(&message.title)
            .header(ContentType::TEXT_PLAIN);
        for recipient in &self.to {
            builder = builder.to(recipient.clone());
        }

        builder
            .body(message.render_text())
            .map_err(|e| DeliveryError::Permanent(format!("failed to build email: {}", e)))
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    fn kind(&self) -> &'static str {
        "email"
    }

    async fn send(&self, message: &NotifyMessage) -> Result<(), DeliveryError> {
        let email = self.build_email(message)?;

        match self.mailer.send(email).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_permanent() => Err(DeliveryError::Permanent(e.to_string())),
            Err(e) => Err(DeliveryError::Transient(e.to_string())),
        }
    }
}
