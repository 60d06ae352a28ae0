//! Signaling transport adapter.
//!
//! Topics are shared by both call participants. Delivery is best effort and
//! ordered per publisher; nothing is persisted, so a message published before
//! a subscription exists is simply gone.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};

use crate::error::RelayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Pending readiness confirmation for a subscription.
#[derive(Debug)]
pub struct SubscriptionReady {
    rx: Option<oneshot::Receiver<Result<(), RelayError>>>,
}

impl SubscriptionReady {
    pub fn new(rx: oneshot::Receiver<Result<(), RelayError>>) -> Self {
        Self { rx: Some(rx) }
    }

    /// Already confirmed; `wait` returns immediately.
    pub fn confirmed() -> Self {
        Self { rx: None }
    }

    pub async fn wait(self, timeout: Duration) -> Result<(), RelayError> {
        let Some(rx) = self.rx else {
            return Ok(());
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(res)) => res,
            Ok(Err(_)) => Err(RelayError::NotConnected),
            Err(_) => Err(RelayError::Timeout(
                "timed out waiting for signaling subscription ready".to_string(),
            )),
        }
    }
}

/// Receiving half of a topic subscription.
///
/// Dropping it does not detach it from the transport; call
/// [`SignalingTransport::unsubscribe`] with its id.
#[derive(Debug)]
pub struct SignalSubscription {
    id: SubscriptionId,
    topic: String,
    rx: mpsc::UnboundedReceiver<String>,
    ready: SubscriptionReady,
}

impl SignalSubscription {
    pub fn new(
        id: SubscriptionId,
        topic: impl Into<String>,
        rx: mpsc::UnboundedReceiver<String>,
        ready: SubscriptionReady,
    ) -> Self {
        Self {
            id,
            topic: topic.into(),
            rx,
            ready,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Detaches the readiness confirmation so it can be awaited elsewhere.
    /// Later calls get an already-confirmed handle.
    pub fn take_ready(&mut self) -> SubscriptionReady {
        std::mem::replace(&mut self.ready, SubscriptionReady::confirmed())
    }

    pub async fn wait_ready(&mut self, timeout: Duration) -> Result<(), RelayError> {
        self.take_ready().wait(timeout).await
    }

    /// `None` once the transport dropped the subscription.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Result<String, TryRecvError> {
        self.rx.try_recv()
    }
}

#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Publishes `message` on `topic` and returns how many subscribers other
    /// than `from` received it. Zero is not an error.
    async fn publish(&self, topic: &str, from: &str, message: String)
        -> Result<usize, RelayError>;

    async fn subscribe(&self, topic: &str, owner: &str)
        -> Result<SignalSubscription, RelayError>;

    /// Idempotent.
    fn unsubscribe(&self, id: SubscriptionId);
}

/// Builds the topic key for a chat, e.g. `call-<chat_id>`.
pub fn topic_key(prefix: &str, chat_id: &str) -> Result<String, RelayError> {
    let chat_id = chat_id.trim();
    if chat_id.is_empty() {
        return Err(RelayError::InvalidTopic("chat id is empty".to_string()));
    }
    if prefix.is_empty() {
        return Ok(chat_id.to_string());
    }
    Ok(format!("{prefix}-{chat_id}"))
}

#[derive(Debug)]
struct Subscriber {
    id: SubscriptionId,
    owner: String,
    tx: mpsc::UnboundedSender<String>,
}

#[derive(Debug)]
struct RelayState {
    online: bool,
    next_id: u64,
    topics: HashMap<String, Vec<Subscriber>>,
}

impl Default for RelayState {
    fn default() -> Self {
        Self {
            online: true,
            next_id: 1,
            topics: HashMap::new(),
        }
    }
}

/// Process-local topic hub.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl InMemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every publish and subscribe fails with `NotConnected`.
    pub fn set_online(&self, online: bool) {
        self.lock().online = online;
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.lock().topics.get(topic).map(Vec::len).unwrap_or(0)
    }

    /// Drops every subscription on `topic`, as a network interruption would.
    pub fn drop_subscribers(&self, topic: &str) {
        self.lock().topics.remove(topic);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RelayState> {
        self.state.lock().expect("relay state poisoned")
    }
}

#[async_trait]
impl SignalingTransport for InMemoryRelay {
    async fn publish(
        &self,
        topic: &str,
        from: &str,
        message: String,
    ) -> Result<usize, RelayError> {
        let mut state = self.lock();
        if !state.online {
            return Err(RelayError::NotConnected);
        }
        let Some(subscribers) = state.topics.get_mut(topic) else {
            return Ok(0);
        };

        let mut delivered = 0usize;
        subscribers.retain(|sub| {
            if sub.owner == from {
                return !sub.tx.is_closed();
            }
            match sub.tx.send(message.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            }
        });
        if subscribers.is_empty() {
            state.topics.remove(topic);
        }
        Ok(delivered)
    }

    async fn subscribe(
        &self,
        topic: &str,
        owner: &str,
    ) -> Result<SignalSubscription, RelayError> {
        if topic.is_empty() {
            return Err(RelayError::InvalidTopic("topic is empty".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let mut state = self.lock();
        if !state.online {
            return Err(RelayError::NotConnected);
        }
        let id = SubscriptionId(state.next_id);
        state.next_id += 1;
        state
            .topics
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber {
                id,
                owner: owner.to_string(),
                tx,
            });
        let _ = ready_tx.send(Ok(()));
        Ok(SignalSubscription::new(
            id,
            topic,
            rx,
            SubscriptionReady::new(ready_rx),
        ))
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        let mut state = self.lock();
        state.topics.retain(|_, subs| {
            subs.retain(|sub| sub.id != id);
            !subs.is_empty()
        });
    }
}
