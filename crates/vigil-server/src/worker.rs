use std::sync::Arc;
use tokio::sync::broadcast::{error::RecvError, Receiver};
use tokio::task::JoinSet;
use vigil_alert::AlertTransition;
use vigil_metrics::InternalMetrics;
use vigil_notify::NotificationDispatcher;

/// 同时在途的投递上限
const MAX_IN_FLIGHT: usize = 64;

/// 从告警总线读取状态变化并交给分发器
///
/// 每个状态变化在独立任务中投递，慢渠道不会拖住后续告警；在途任务达到上限时
/// 暂停读取总线，积压由总线容量吸收。
pub async fn run_notification_worker(
    mut rx: Receiver<AlertTransition>,
    dispatcher: Arc<NotificationDispatcher>,
    internal: Arc<InternalMetrics>,
) {
    tracing::info!("Notification worker started");
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    tracing::warn!(error = %e, "Notification task failed");
                    internal.record_suppressed("notify", "join");
                }
            }
            received = rx.recv(), if in_flight.len() < MAX_IN_FLIGHT => match received {
                Ok(transition) => {
                    let dispatcher = Arc::clone(&dispatcher);
                    in_flight.spawn(async move { dispatch(&dispatcher, transition).await });
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Notification worker lagged, transitions dropped");
                    internal.record_suppressed("notify", "lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            tracing::warn!(error = %e, "Notification task failed");
            internal.record_suppressed("notify", "join");
        }
    }
    tracing::info!("Notification worker stopped");
}

async fn dispatch(dispatcher: &NotificationDispatcher, transition: AlertTransition) {
    let report = dispatcher
        .deliver(&transition, &transition.event.channels)
        .await;

    if report.failed() > 0 {
        tracing::warn!(
            rule = %transition.event.rule_name,
            kind = transition.kind.as_str(),
            delivered = report.delivered(),
            failed = report.failed(),
            "Notification partially failed"
        );
    } else {
        tracing::debug!(
            rule = %transition.event.rule_name,
            kind = transition.kind.as_str(),
            delivered = report.delivered(),
            "Notification handled"
        );
    }
}
