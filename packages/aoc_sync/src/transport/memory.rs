//! In-process broker.
//!
//! Routes messages between clients that connected with the same
//! [`ConnectionKey`], the way a workspace-scoped broker would. Credentials can
//! be told to refuse or stall, and responders can answer published requests,
//! which is enough to drive the whole sync layer without a network.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use tokio::sync::{Notify, mpsc};
use tracing::debug;

use super::{
    ConnectOptions, Connector, EVENT_CHANNEL_CAPACITY, QoS, TransportCommand, TransportEvent,
    TransportLink,
};
use crate::error::SyncError;
use crate::token::ConnectionKey;

/// How the broker treats a session presenting a given credential.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientBehavior {
    Accept,
    /// `connect` fails outright.
    Refuse(String),
    /// The session opens but is never acknowledged until released.
    Hold,
}

/// A message some client published, as recorded by the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishedMessage {
    pub key: ConnectionKey,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
}

type Responder = Arc<dyn Fn(&PublishedMessage) -> Option<(String, Vec<u8>)> + Send + Sync>;

struct Client {
    key: ConnectionKey,
    password: String,
    events: mpsc::Sender<TransportEvent>,
    subscriptions: HashSet<String>,
    acknowledged: bool,
}

#[derive(Default)]
struct BrokerState {
    clients: HashMap<u64, Client>,
    behaviors: HashMap<String, ClientBehavior>,
    responders: Vec<Responder>,
    published: Vec<PublishedMessage>,
    next_client: u64,
    sessions_opened: usize,
}

impl BrokerState {
    fn deliver(&self, key: &ConnectionKey, topic: &str, payload: &[u8]) -> usize {
        let mut delivered = 0;
        for client in self.clients.values() {
            if client.acknowledged && client.key == *key && client.subscriptions.contains(topic) {
                let event = TransportEvent::Message {
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                };
                if client.events.try_send(event).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }
}

#[derive(Default)]
struct Inner {
    state: Mutex<BrokerState>,
    changed: Notify,
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Sessions presenting `password` get `behavior` from now on.
    pub fn set_behavior(&self, password: impl Into<String>, behavior: ClientBehavior) {
        self.lock().behaviors.insert(password.into(), behavior);
    }

    /// Acknowledge every held session presenting `password`.
    pub fn release(&self, password: &str) {
        let mut state = self.lock();
        state
            .behaviors
            .insert(password.to_string(), ClientBehavior::Accept);
        for client in state.clients.values_mut() {
            if client.password == password && !client.acknowledged {
                client.acknowledged = true;
                let _ = client.events.try_send(TransportEvent::Connected);
            }
        }
        drop(state);
        self.inner.changed.notify_waiters();
    }

    /// Answer published messages. The first responder returning a reply wins;
    /// the reply goes back through the publisher's key.
    pub fn on_publish<F>(&self, responder: F)
    where
        F: Fn(&PublishedMessage) -> Option<(String, Vec<u8>)> + Send + Sync + 'static,
    {
        self.lock().responders.push(Arc::new(responder));
    }

    /// Publish as the broker side of `key`. Returns how many subscribers got it.
    pub fn publish(&self, key: &ConnectionKey, topic: &str, payload: impl AsRef<[u8]>) -> usize {
        self.lock().deliver(key, topic, payload.as_ref())
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        self.lock()
            .published
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Topics currently subscribed by acknowledged sessions of `key`, sorted.
    pub fn subscriptions(&self, key: &ConnectionKey) -> Vec<String> {
        let state = self.lock();
        let mut topics: Vec<String> = state
            .clients
            .values()
            .filter(|c| c.key == *key && c.acknowledged)
            .flat_map(|c| c.subscriptions.iter().cloned())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        topics.sort();
        topics
    }

    pub fn is_subscribed(&self, key: &ConnectionKey, topic: &str) -> bool {
        self.lock()
            .clients
            .values()
            .any(|c| c.key == *key && c.subscriptions.contains(topic))
    }

    /// Sessions currently attached, acknowledged or not.
    pub fn client_count(&self) -> usize {
        self.lock().clients.len()
    }

    /// Sessions ever opened, including refused ones.
    pub fn sessions_opened(&self) -> usize {
        self.lock().sessions_opened
    }

    /// Drop and immediately restore every session of `key`. Subscriptions are
    /// lost, as with a clean-session reconnect.
    pub fn bounce(&self, key: &ConnectionKey) {
        let mut state = self.lock();
        for client in state.clients.values_mut() {
            if client.key == *key && client.acknowledged {
                client.subscriptions.clear();
                let _ = client.events.try_send(TransportEvent::Disconnected {
                    reason: "bounced by broker".into(),
                });
                let _ = client.events.try_send(TransportEvent::Connected);
            }
        }
        drop(state);
        self.inner.changed.notify_waiters();
    }

    /// End every session of `key` for good.
    pub fn close(&self, key: &ConnectionKey) {
        let mut state = self.lock();
        state.clients.retain(|_, client| {
            if client.key == *key {
                let _ = client.events.try_send(TransportEvent::Closed {
                    reason: Some("closed by broker".into()),
                });
                false
            } else {
                true
            }
        });
        drop(state);
        self.inner.changed.notify_waiters();
    }

    /// Resolve once `condition` holds. Re-checked after every broker change.
    pub async fn wait_until<F>(&self, condition: F)
    where
        F: Fn(&MemoryBroker) -> bool,
    {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if condition(self) {
                return;
            }
            notified.await;
        }
    }

    fn apply(&self, client_id: u64, command: TransportCommand) -> bool {
        let mut state = self.lock();
        let keep_going = match command {
            TransportCommand::Subscribe { topic, .. } => {
                if let Some(client) = state.clients.get_mut(&client_id) {
                    client.subscriptions.insert(topic);
                }
                true
            }
            TransportCommand::Unsubscribe { topic } => {
                if let Some(client) = state.clients.get_mut(&client_id) {
                    client.subscriptions.remove(&topic);
                }
                true
            }
            TransportCommand::Publish {
                topic,
                payload,
                qos,
            } => {
                let Some(key) = state.clients.get(&client_id).map(|c| c.key.clone()) else {
                    return false;
                };
                let message = PublishedMessage {
                    key: key.clone(),
                    topic,
                    payload,
                    qos,
                };
                state.deliver(&key, &message.topic, &message.payload);
                let reply = state.responders.iter().find_map(|r| r(&message));
                state.published.push(message);
                if let Some((topic, payload)) = reply {
                    state.deliver(&key, &topic, &payload);
                }
                true
            }
            TransportCommand::Disconnect => {
                state.clients.remove(&client_id);
                false
            }
        };
        drop(state);
        self.inner.changed.notify_waiters();
        keep_going
    }
}

impl Connector for MemoryBroker {
    fn connect(&self, options: ConnectOptions) -> BoxFuture<'static, Result<TransportLink, SyncError>> {
        let broker = self.clone();
        Box::pin(async move {
            let (command_tx, mut command_rx) = mpsc::unbounded_channel();
            let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

            let client_id = {
                let mut state = broker.lock();
                state.sessions_opened += 1;
                let behavior = state
                    .behaviors
                    .get(&options.password)
                    .cloned()
                    .unwrap_or(ClientBehavior::Accept);

                if let ClientBehavior::Refuse(reason) = behavior {
                    return Err(SyncError::Connection {
                        key: options.key,
                        reason,
                    });
                }

                let acknowledged = behavior == ClientBehavior::Accept;
                if acknowledged {
                    let _ = event_tx.try_send(TransportEvent::Connected);
                }

                let id = state.next_client;
                state.next_client += 1;
                state.clients.insert(
                    id,
                    Client {
                        key: options.key.clone(),
                        password: options.password.clone(),
                        events: event_tx,
                        subscriptions: HashSet::new(),
                        acknowledged,
                    },
                );
                id
            };
            broker.inner.changed.notify_waiters();

            let session = broker.clone();
            tokio::spawn(async move {
                while let Some(command) = command_rx.recv().await {
                    if !session.apply(client_id, command) {
                        break;
                    }
                }
                // Link dropped without a disconnect.
                session.lock().clients.remove(&client_id);
                session.inner.changed.notify_waiters();
                debug!(client_id, "memory session ended");
            });

            Ok(TransportLink {
                commands: command_tx,
                events: event_rx,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn options(key: &ConnectionKey, password: &str) -> ConnectOptions {
        ConnectOptions {
            key: key.clone(),
            broker_url: "memory://".into(),
            client_id: "test".into(),
            username: "user".into(),
            password: password.into(),
            clean_session: true,
            keep_alive: Duration::from_secs(60),
            reconnect_delay: Duration::from_millis(10),
            max_packet_bytes: 1024,
        }
    }

    async fn next_event(link: &mut TransportLink) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(1), link.events.recv())
            .await
            .expect("event in time")
            .expect("link open")
    }

    #[tokio::test]
    async fn routes_by_key_and_subscription() {
        let broker = MemoryBroker::new();
        let a = ConnectionKey::new("s", "a");
        let b = ConnectionKey::new("s", "b");
        let mut link_a = broker.connect(options(&a, "ta")).await.unwrap();
        let mut link_b = broker.connect(options(&b, "tb")).await.unwrap();
        assert_eq!(next_event(&mut link_a).await, TransportEvent::Connected);
        assert_eq!(next_event(&mut link_b).await, TransportEvent::Connected);

        for link in [&link_a, &link_b] {
            link.commands
                .send(TransportCommand::Subscribe {
                    topic: "/topology".into(),
                    qos: QoS::AtMostOnce,
                })
                .unwrap();
        }
        broker
            .wait_until(|broker| {
                broker.is_subscribed(&a, "/topology") && broker.is_subscribed(&b, "/topology")
            })
            .await;

        assert_eq!(broker.publish(&a, "/topology", b"{}"), 1);
        assert_eq!(
            next_event(&mut link_a).await,
            TransportEvent::Message {
                topic: "/topology".into(),
                payload: b"{}".to_vec(),
            }
        );
        assert!(link_b.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn refused_credentials_fail_connect() {
        let broker = MemoryBroker::new();
        broker.set_behavior("bad", ClientBehavior::Refuse("not authorized".into()));
        let key = ConnectionKey::new("s", "w");
        let err = broker.connect(options(&key, "bad")).await.err().unwrap();
        assert_eq!(err.error_code(), "connection");
        assert_eq!(broker.sessions_opened(), 1);
        assert_eq!(broker.client_count(), 0);
    }

    #[tokio::test]
    async fn held_sessions_wait_for_release() {
        let broker = MemoryBroker::new();
        broker.set_behavior("slow", ClientBehavior::Hold);
        let key = ConnectionKey::new("s", "w");
        let mut link = broker.connect(options(&key, "slow")).await.unwrap();
        assert!(link.events.try_recv().is_err());

        broker.release("slow");
        assert_eq!(next_event(&mut link).await, TransportEvent::Connected);
    }

    #[tokio::test]
    async fn responders_reply_to_publisher() {
        let broker = MemoryBroker::new();
        broker.on_publish(|m| (m.topic == "/ping").then(|| ("/pong".to_string(), m.payload.clone())));
        let key = ConnectionKey::new("s", "w");
        let mut link = broker.connect(options(&key, "t")).await.unwrap();
        next_event(&mut link).await;

        link.commands
            .send(TransportCommand::Subscribe {
                topic: "/pong".into(),
                qos: QoS::AtLeastOnce,
            })
            .unwrap();
        link.commands
            .send(TransportCommand::Publish {
                topic: "/ping".into(),
                payload: b"42".to_vec(),
                qos: QoS::AtLeastOnce,
            })
            .unwrap();

        assert_eq!(
            next_event(&mut link).await,
            TransportEvent::Message {
                topic: "/pong".into(),
                payload: b"42".to_vec(),
            }
        );
        assert_eq!(broker.published_to("/ping").len(), 1);
    }

    #[tokio::test]
    async fn bounce_clears_subscriptions() {
        let broker = MemoryBroker::new();
        let key = ConnectionKey::new("s", "w");
        let mut link = broker.connect(options(&key, "t")).await.unwrap();
        next_event(&mut link).await;
        link.commands
            .send(TransportCommand::Subscribe {
                topic: "/topology".into(),
                qos: QoS::AtMostOnce,
            })
            .unwrap();
        broker.wait_until(|b| b.is_subscribed(&key, "/topology")).await;

        broker.bounce(&key);
        assert!(matches!(
            next_event(&mut link).await,
            TransportEvent::Disconnected { .. }
        ));
        assert_eq!(next_event(&mut link).await, TransportEvent::Connected);
        assert!(broker.subscriptions(&key).is_empty());
    }
}
