use crate::status::HealthStatus;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 探针返回的结果（延迟由编排器测量）
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub status: HealthStatus,
    pub message: String,
}

impl ProbeOutcome {
    pub fn healthy(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Healthy,
            message: message.into(),
        }
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Degraded,
            message: message.into(),
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            message: message.into(),
        }
    }
}

/// 健康探针
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// 探针类型，用于展示
    fn kind(&self) -> &'static str;

    async fn run(&self) -> anyhow::Result<ProbeOutcome>;
}

/// HTTP 探针
///
/// GET 请求返回 2xx 为 Healthy，响应慢于 `degraded_after` 为 Degraded，
/// 其他状态码为 Unhealthy；连接失败作为错误返回。
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
    degraded_after: Duration,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>, degraded_after: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            degraded_after,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    fn kind(&self) -> &'static str {
        "http"
    }

    async fn run(&self) -> anyhow::Result<ProbeOutcome> {
        let started = Instant::now();
        let response = self.client.get(&self.url).send().await?;
        let elapsed = started.elapsed();
        let status = response.status();

        if !status.is_success() {
            return Ok(ProbeOutcome::unhealthy(format!("HTTP {}", status)));
        }

        if elapsed > self.degraded_after {
            Ok(ProbeOutcome::degraded(format!(
                "HTTP {} in {}ms (slow)",
                status,
                elapsed.as_millis()
            )))
        } else {
            Ok(ProbeOutcome::healthy(format!("HTTP {}", status)))
        }
    }
}

type BlockingFn = dyn Fn() -> anyhow::Result<ProbeOutcome> + Send + Sync;

/// 包装同步的协作方检查，在阻塞线程池中执行
pub struct BlockingProbe {
    check: Arc<BlockingFn>,
}

impl BlockingProbe {
    pub fn new<F>(check: F) -> Self
    where
        F: Fn() -> anyhow::Result<ProbeOutcome> + Send + Sync + 'static,
    {
        Self {
            check: Arc::new(check),
        }
    }
}

#[async_trait]
impl HealthProbe for BlockingProbe {
    fn kind(&self) -> &'static str {
        "blocking"
    }

    async fn run(&self) -> anyhow::Result<ProbeOutcome> {
        let check = Arc::clone(&self.check);
        tokio::task::spawn_blocking(move || check()).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::get, Router};
    use std::net::SocketAddr;

    async fn serve(app: Router) -> SocketAddr {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = axum::Server::from_tcp(listener)
            .unwrap()
            .serve(app.into_make_service());
        tokio::spawn(server);
        addr
    }

    #[tokio::test]
    async fn test_http_probe_healthy() {
        let addr = serve(Router::new().route("/ping", get(|| async { "pong" }))).await;
        let probe = HttpProbe::new(format!("http://{}/ping", addr), Duration::from_secs(5));

        let outcome = probe.run().await.unwrap();
        assert_eq!(outcome.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_http_probe_error_status() {
        let app = Router::new().route(
            "/ping",
            get(|| async { StatusCode::SERVICE_UNAVAILABLE }),
        );
        let addr = serve(app).await;
        let probe = HttpProbe::new(format!("http://{}/ping", addr), Duration::from_secs(5));

        let outcome = probe.run().await.unwrap();
        assert_eq!(outcome.status, HealthStatus::Unhealthy);
        assert!(outcome.message.contains("503"));
    }

    #[tokio::test]
    async fn test_http_probe_slow_response_degraded() {
        let app = Router::new().route(
            "/ping",
            get(|| async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                "pong"
            }),
        );
        let addr = serve(app).await;
        let probe = HttpProbe::new(format!("http://{}/ping", addr), Duration::from_millis(1));

        let outcome = probe.run().await.unwrap();
        assert_eq!(outcome.status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_http_probe_connection_refused() {
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let probe = HttpProbe::new(format!("http://{}/ping", addr), Duration::from_secs(1));
        assert!(probe.run().await.is_err());
    }

    #[tokio::test]
    async fn test_blocking_probe() {
        let probe = BlockingProbe::new(|| Ok(ProbeOutcome::degraded("replica lag")));
        let outcome = probe.run().await.unwrap();
        assert_eq!(outcome.status, HealthStatus::Degraded);
        assert_eq!(outcome.message, "replica lag");

        let failing = BlockingProbe::new(|| Err(anyhow::anyhow!("connection refused")));
        assert!(failing.run().await.is_err());
    }
}
