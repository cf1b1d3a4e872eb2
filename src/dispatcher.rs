//! The subscription table and per-message dispatch to user handlers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::warn;

use crate::error::BusResult;
use crate::metrics::BusMetrics;
use crate::seq::{Seq, SeqRange};
use crate::topic::{self, TopicFilter};

/// One delivered DATA message, payload already decrypted.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Delivery {
    pub topic: String,
    pub payload: Vec<u8>,
    pub peer_id: u32,
    pub session_id: u16,
    pub sequence: Seq,
}

/// Notification that a range of sequences from one peer is permanently
/// unrecoverable. Subsequent deliveries from that peer skip these sequences.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Loss {
    pub peer_id: u32,
    pub session_id: u16,
    pub ranges: Vec<SeqRange>,
}

/// Subscriber callback interface. Handlers run on the receive task: a
/// handler that suspends stalls ordered delivery for every peer, so handlers
/// must hand long work off to their own tasks. A returned error is logged
/// and delivery continues.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn on_message(&self, delivery: Delivery) -> anyhow::Result<()>;

    /// Loss events go to every subscription regardless of topic - the topics
    /// of the lost messages are unknown by definition.
    async fn on_loss(&self, _loss: Loss) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    filter: TopicFilter,
    handler: Arc<dyn MessageHandler>,
}

/// The subscription table. Writes come from user tasks, reads from the
/// receive task; the mutex is held only to snapshot matching handlers, never
/// across a handler invocation.
pub struct Dispatcher {
    subscriptions: Mutex<Vec<Subscription>>,
    next_id: AtomicU64,
    metrics: Arc<BusMetrics>,
}

impl Dispatcher {
    pub fn new(metrics: Arc<BusMetrics>) -> Dispatcher {
        Dispatcher {
            subscriptions: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            metrics,
        }
    }

    pub fn subscribe(&self, pattern: &str, handler: Arc<dyn MessageHandler>) -> BusResult<SubscriptionId> {
        let filter = TopicFilter::parse(pattern)?;
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions.lock().expect("subscription table lock poisoned")
            .push(Subscription { id, filter, handler });
        Ok(id)
    }

    /// Remove a subscription. Dispatches already snapshotted may still fire.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.lock().expect("subscription table lock poisoned");
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        subscriptions.len() < before
    }

    /// Invoke every matching subscription, in subscription order. Topic
    /// segments are computed once; matching runs on a snapshot of the table.
    pub async fn dispatch(&self, delivery: Delivery) {
        let matching: Vec<Arc<dyn MessageHandler>> = {
            let subject = match topic::segments(&delivery.topic) {
                Ok(subject) => subject,
                // decoded packets always carry valid topics
                Err(e) => {
                    warn!("dropping delivery with invalid topic: {}", e);
                    return;
                }
            };
            self.subscriptions.lock().expect("subscription table lock poisoned")
                .iter()
                .filter(|s| s.filter.matches(&subject))
                .map(|s| s.handler.clone())
                .collect()
        };

        if matching.is_empty() {
            return;
        }
        BusMetrics::bump(&self.metrics.messages_delivered);

        for handler in matching {
            if let Err(e) = handler.on_message(delivery.clone()).await {
                warn!("subscriber failed handling message on {:?}: {}", delivery.topic, e);
            }
        }
    }

    pub async fn dispatch_loss(&self, loss: Loss) {
        BusMetrics::bump(&self.metrics.losses_declared);

        let handlers: Vec<Arc<dyn MessageHandler>> = self.subscriptions
            .lock().expect("subscription table lock poisoned")
            .iter()
            .map(|s| s.handler.clone())
            .collect();

        for handler in handlers {
            if let Err(e) = handler.on_loss(loss.clone()).await {
                warn!("subscriber failed handling loss event from peer {}: {}", loss.peer_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;

    fn delivery(topic: &str) -> Delivery {
        Delivery {
            topic: topic.to_owned(),
            payload: vec![1],
            peer_id: 7,
            session_id: 1,
            sequence: Seq::from_raw(3),
        }
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(Arc::new(BusMetrics::default()))
    }

    #[tokio::test]
    async fn test_dispatch_to_matching_subscription() {
        let dispatcher = dispatcher();

        let mut handler = MockMessageHandler::new();
        handler.expect_on_message()
            .once()
            .with(eq(delivery("a.b.c")))
            .returning(|_| Ok(()));
        dispatcher.subscribe("a.*.c", Arc::new(handler)).unwrap();

        let mut unmatched = MockMessageHandler::new();
        unmatched.expect_on_message().never();
        dispatcher.subscribe("a.*.d", Arc::new(unmatched)).unwrap();

        dispatcher.dispatch(delivery("a.b.c")).await;
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_dispatch() {
        let dispatcher = dispatcher();

        let mut handler = MockMessageHandler::new();
        handler.expect_on_message().never();
        let id = dispatcher.subscribe(">", Arc::new(handler)).unwrap();

        assert!(dispatcher.unsubscribe(id));
        assert!(!dispatcher.unsubscribe(id));

        dispatcher.dispatch(delivery("a.b.c")).await;
    }

    #[tokio::test]
    async fn test_handler_error_does_not_stop_others() {
        let dispatcher = dispatcher();

        let mut failing = MockMessageHandler::new();
        failing.expect_on_message()
            .once()
            .returning(|_| anyhow::bail!("subscriber bug"));
        dispatcher.subscribe(">", Arc::new(failing)).unwrap();

        let mut second = MockMessageHandler::new();
        second.expect_on_message().once().returning(|_| Ok(()));
        dispatcher.subscribe(">", Arc::new(second)).unwrap();

        dispatcher.dispatch(delivery("a.b.c")).await;
    }

    #[tokio::test]
    async fn test_loss_goes_to_all_subscriptions() {
        let dispatcher = dispatcher();

        let loss = Loss {
            peer_id: 7,
            session_id: 1,
            ranges: vec![SeqRange::single(Seq::from_raw(5))],
        };

        for _ in 0..2 {
            let mut handler = MockMessageHandler::new();
            let expected = loss.clone();
            handler.expect_on_loss()
                .once()
                .withf(move |l| *l == expected)
                .returning(|_| Ok(()));
            dispatcher.subscribe("some.topic", Arc::new(handler)).unwrap();
        }

        dispatcher.dispatch_loss(loss).await;
    }

    #[tokio::test]
    async fn test_subscribe_rejects_malformed_pattern() {
        let dispatcher = dispatcher();
        let handler = Arc::new(MockMessageHandler::new());
        assert!(dispatcher.subscribe("a.b*c", handler).is_err());
    }
}
