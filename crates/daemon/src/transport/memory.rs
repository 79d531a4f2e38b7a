//! In-process broker.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::{Delivery, Envelope, Subscription, Transport, TransportError};

#[derive(Default)]
struct QueueState {
    messages: Mutex<VecDeque<Envelope>>,
    ready: Notify,
}

/// Named FIFO queues shared by every handle cloned from one broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    queues: Arc<Mutex<HashMap<String, Arc<QueueState>>>>,
    closed: CancellationToken,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, name: &str) -> Arc<QueueState> {
        self.queues
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Messages waiting on `queue`.
    pub fn depth(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .get(queue)
            .map(|state| state.messages.lock().len())
            .unwrap_or(0)
    }

    /// Refuse further publishes and end subscriptions once drained.
    pub fn close(&self) {
        self.closed.cancel();
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn publish(&self, queue: &str, envelope: Envelope) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let state = self.queue(queue);
        state.messages.lock().push_back(envelope);
        state.ready.notify_one();
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Box<dyn Subscription>, TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        Ok(Box::new(MemorySubscription {
            name: queue.to_string(),
            state: self.queue(queue),
            closed: self.closed.clone(),
        }))
    }
}

struct MemorySubscription {
    name: String,
    state: Arc<QueueState>,
    closed: CancellationToken,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn recv(&mut self) -> Option<Delivery> {
        loop {
            let notified = self.state.ready.notified();
            tokio::pin!(notified);
            // Register before checking so a publish in between is not missed
            notified.as_mut().enable();

            let next = self.state.messages.lock().pop_front();
            if let Some(envelope) = next {
                return Some(Delivery {
                    queue: self.name.clone(),
                    envelope,
                });
            }
            if self.closed.is_cancelled() {
                return None;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.closed.cancelled() => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::publish_json;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    #[tokio::test]
    async fn test_messages_arrive_in_order() {
        let broker = MemoryBroker::new();
        let mut sub = broker.consume("q").await.unwrap();
        for n in 0..3 {
            publish_json(&broker, "q", &Ping { n }, None).await.unwrap();
        }
        for n in 0..3 {
            let msg: Ping = sub.recv().await.unwrap().decode().unwrap();
            assert_eq!(msg, Ping { n });
        }
    }

    #[tokio::test]
    async fn test_reply_to_is_carried() {
        let broker = MemoryBroker::new();
        let mut sub = broker.consume("q").await.unwrap();
        publish_json(&broker, "q", &Ping { n: 1 }, Some("replies"))
            .await
            .unwrap();
        let delivery = sub.recv().await.unwrap();
        assert_eq!(delivery.reply_to(), Some("replies"));
        assert_eq!(delivery.queue, "q");
    }

    #[tokio::test]
    async fn test_competing_consumers_each_get_one() {
        let broker = MemoryBroker::new();
        let mut a = broker.consume("q").await.unwrap();
        let mut b = broker.consume("q").await.unwrap();

        publish_json(&broker, "q", &Ping { n: 1 }, None).await.unwrap();
        publish_json(&broker, "q", &Ping { n: 2 }, None).await.unwrap();

        let first: Ping = a.recv().await.unwrap().decode().unwrap();
        let second: Ping = b.recv().await.unwrap().decode().unwrap();
        assert_ne!(first, second);
        assert_eq!(broker.depth("q"), 0);
    }

    #[tokio::test]
    async fn test_waiting_consumer_is_woken() {
        let broker = MemoryBroker::new();
        let mut sub = broker.consume("q").await.unwrap();
        let waiter = tokio::spawn(async move { sub.recv().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        publish_json(&broker, "q", &Ping { n: 7 }, None).await.unwrap();

        let delivery = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(delivery.decode::<Ping>().unwrap(), Ping { n: 7 });
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let broker = MemoryBroker::new();
        let mut sub = broker.consume("q").await.unwrap();
        publish_json(&broker, "q", &Ping { n: 1 }, None).await.unwrap();
        broker.close();

        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());
        assert!(matches!(
            publish_json(&broker, "q", &Ping { n: 2 }, None).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_malformed_body_reports_queue() {
        let broker = MemoryBroker::new();
        let mut sub = broker.consume("q").await.unwrap();
        broker
            .publish("q", Envelope::new(b"not json".to_vec()))
            .await
            .unwrap();
        let err = sub.recv().await.unwrap().decode::<Ping>().unwrap_err();
        assert!(matches!(err, TransportError::Decode { ref queue, .. } if queue == "q"));
    }
}
