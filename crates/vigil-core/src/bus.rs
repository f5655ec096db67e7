use std::sync::Arc;
use tokio::sync::broadcast;

/// 进程内广播总线
///
/// 上游阶段发布不可变的事件，下游阶段各自订阅；发布方不会被慢订阅者阻塞，
/// 订阅者落后超过容量时收到 `Lagged`。
#[derive(Clone)]
pub struct EventBus<T: Clone> {
    sender: broadcast::Sender<T>,
}

impl<T: Clone> EventBus<T> {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }

    /// 发布事件，返回收到事件的订阅者数量（无订阅者时返回 0）
    pub fn publish(&self, event: T) -> usize {
        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                tracing::debug!("Event published with no active subscribers");
                0
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

pub type SharedEventBus<T> = Arc<EventBus<T>>;

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_eventbus_publish_subscribe() {
        let bus = EventBus::new(10);
        let mut rx = bus.subscribe();

        assert_eq!(bus.publish("raised".to_string()), 1);

        let received = timeout(Duration::from_millis(100), rx.recv())
            .await
            .expect("Timeout waiting for event")
            .expect("Failed to receive event");
        assert_eq!(received, "raised");
    }

    #[tokio::test]
    async fn test_eventbus_multiple_subscribers() {
        let bus = EventBus::new(10);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        assert_eq!(bus.publish(7u32), 2);
        assert_eq!(rx1.recv().await.unwrap(), 7);
        assert_eq!(rx2.recv().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_eventbus_no_subscribers() {
        let bus: EventBus<u32> = EventBus::new(10);
        let rx = bus.subscribe();
        drop(rx);

        // 没有订阅者时发布不会报错
        assert_eq!(bus.publish(1), 0);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_eventbus_capacity_overflow() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();

        bus.publish(1u32);
        bus.publish(2u32);
        bus.publish(3u32);

        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert_eq!(n, 1),
            other => panic!("Expected Lagged error, got {:?}", other),
        }
        assert_eq!(rx.recv().await.unwrap(), 2);
        assert_eq!(rx.recv().await.unwrap(), 3);
    }
}
