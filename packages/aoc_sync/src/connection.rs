//! One broker connection per workspace, run as an actor task.
//!
//! The actor owns the transport link. Callers hold a [`ConnectionHandle`]
//! and submit operations over a channel; while the connection is not
//! `Ready` those operations wait in an explicit queue and are flushed, in
//! order, on the transition to `Ready`.
//!
//! Inbound messages on a topic with registered response waiters resolve
//! those waiters. Everything else is decoded into an [`Inbound`] snapshot
//! and forwarded to the aggregation loop.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::metrics::SyncMetrics;
use crate::protocol::{self, Inbound, TopologyRequest};
use crate::token::ConnectionKey;
use crate::topics;
use crate::transport::{
    ConnectOptions, Connector, QoS, TransportCommand, TransportEvent, TransportLink,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Ready,
    /// Closed on request.
    Closed,
    /// Could not be established, or ended by the broker.
    Failed { reason: String },
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed { .. })
    }
}

/// A decoded snapshot and the connection it arrived on.
#[derive(Clone, Debug, PartialEq)]
pub struct InboundEvent {
    pub key: ConnectionKey,
    pub message: Inbound,
}

enum Op {
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
    },
    /// Bring the subscription for a response topic in line with its waiters.
    SyncTopic(String),
}

struct TopicWaiters {
    qos: QoS,
    waiters: Vec<(u64, oneshot::Sender<Vec<u8>>)>,
}

#[derive(Default)]
struct WaiterRegistry {
    next_id: u64,
    topics: HashMap<String, TopicWaiters>,
}

impl WaiterRegistry {
    fn wanted(&self, topic: &str) -> Option<QoS> {
        self.topics
            .get(topic)
            .filter(|t| !t.waiters.is_empty())
            .map(|t| t.qos)
    }
}

type Waiters = Arc<Mutex<WaiterRegistry>>;

fn lock(waiters: &Waiters) -> MutexGuard<'_, WaiterRegistry> {
    waiters.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
pub struct ConnectionHandle {
    key: ConnectionKey,
    ops: mpsc::UnboundedSender<Op>,
    state: watch::Receiver<ConnectionState>,
    waiters: Waiters,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Wait until the connection is `Ready` or has ended.
    pub async fn ready(&self) -> Result<(), SyncError> {
        let mut state = self.state.clone();
        let settled = state
            .wait_for(|s| *s == ConnectionState::Ready || s.is_terminal())
            .await
            .map(|s| (*s).clone())
            .unwrap_or(ConnectionState::Closed);
        self.check(&settled)
    }

    fn check(&self, state: &ConnectionState) -> Result<(), SyncError> {
        match state {
            ConnectionState::Closed => Err(SyncError::Closed(self.key.clone())),
            ConnectionState::Failed { reason } => Err(SyncError::Connection {
                key: self.key.clone(),
                reason: reason.clone(),
            }),
            ConnectionState::Connecting | ConnectionState::Ready => Ok(()),
        }
    }

    /// Queue a publish. Accepted while connecting; sent once `Ready`.
    pub fn publish(
        &self,
        topic: impl Into<String>,
        payload: Vec<u8>,
        qos: QoS,
    ) -> Result<(), SyncError> {
        self.check(&self.state())?;
        self.ops
            .send(Op::Publish {
                topic: topic.into(),
                payload,
                qos,
            })
            .map_err(|_| SyncError::Closed(self.key.clone()))
    }

    /// Register a one-shot waiter for the next message on `topic`. The topic
    /// is subscribed for as long as it has waiters.
    pub(crate) fn register_waiter(
        &self,
        topic: &str,
        qos: QoS,
    ) -> Result<(u64, oneshot::Receiver<Vec<u8>>), SyncError> {
        let (tx, rx) = oneshot::channel();
        let mut registry = lock(&self.waiters);
        // Checked under the registry lock: the actor marks itself terminal
        // before it drains the registry.
        self.check(&self.state())?;

        registry.next_id += 1;
        let id = registry.next_id;
        let entry = registry
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicWaiters {
                qos,
                waiters: Vec::new(),
            });
        let first = entry.waiters.is_empty();
        entry.waiters.push((id, tx));
        if first {
            entry.qos = qos;
            let _ = self.ops.send(Op::SyncTopic(topic.to_string()));
        }
        Ok((id, rx))
    }

    /// Drop a waiter. Unknown ids are ignored, so this is safe to call after
    /// the waiter was already resolved.
    pub(crate) fn remove_waiter(&self, topic: &str, id: u64) {
        let mut registry = lock(&self.waiters);
        let Some(entry) = registry.topics.get_mut(topic) else {
            return;
        };
        let before = entry.waiters.len();
        entry.waiters.retain(|(waiter, _)| *waiter != id);
        if entry.waiters.len() == before {
            return;
        }
        if entry.waiters.is_empty() {
            registry.topics.remove(topic);
            let _ = self.ops.send(Op::SyncTopic(topic.to_string()));
        }
    }

    #[cfg(test)]
    pub(crate) fn waiter_count(&self) -> usize {
        lock(&self.waiters)
            .topics
            .values()
            .map(|t| t.waiters.len())
            .sum()
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Resolve once the actor has stopped.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(ConnectionState::is_terminal).await;
    }
}

enum Exit {
    Cancelled,
    Failed(String),
}

struct ConnectionActor {
    key: ConnectionKey,
    ops: mpsc::UnboundedReceiver<Op>,
    state: watch::Sender<ConnectionState>,
    waiters: Waiters,
    inbound: mpsc::UnboundedSender<InboundEvent>,
    metrics: Arc<SyncMetrics>,
    cancel: CancellationToken,
    pending: VecDeque<Op>,
    /// Response topics subscribed in the current session.
    subscribed: HashSet<String>,
    sessions: u32,
}

/// Start the actor for one workspace connection.
pub(crate) fn spawn(
    options: ConnectOptions,
    connect_timeout: Duration,
    connector: Arc<dyn Connector>,
    inbound: mpsc::UnboundedSender<InboundEvent>,
    metrics: Arc<SyncMetrics>,
) -> ConnectionHandle {
    let (ops_tx, ops_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
    let waiters = Waiters::default();
    let cancel = CancellationToken::new();

    let handle = ConnectionHandle {
        key: options.key.clone(),
        ops: ops_tx,
        state: state_rx,
        waiters: waiters.clone(),
        cancel: cancel.clone(),
    };

    let actor = ConnectionActor {
        key: options.key.clone(),
        ops: ops_rx,
        state: state_tx,
        waiters,
        inbound,
        metrics,
        cancel,
        pending: VecDeque::new(),
        subscribed: HashSet::new(),
        sessions: 0,
    };
    tokio::spawn(actor.run(connector, options, connect_timeout));

    handle
}

impl ConnectionActor {
    async fn run(mut self, connector: Arc<dyn Connector>, options: ConnectOptions, timeout: Duration) {
        debug!(server = %self.key.server_id, workspace = %self.key.workspace_id, "connecting");

        let exit = match self.establish(connector.as_ref(), options, timeout).await {
            Ok(link) => self.serve(link).await,
            Err(exit) => exit,
        };

        let final_state = match exit {
            Exit::Cancelled => {
                info!(server = %self.key.server_id, workspace = %self.key.workspace_id, "connection closed");
                ConnectionState::Closed
            }
            Exit::Failed(reason) => {
                warn!(
                    server = %self.key.server_id,
                    workspace = %self.key.workspace_id,
                    reason = %reason,
                    "connection failed"
                );
                self.metrics.connection_failed();
                ConnectionState::Failed { reason }
            }
        };

        self.state.send_replace(final_state);
        // Dropping the senders fails every outstanding waiter with `Closed`.
        lock(&self.waiters).topics.clear();
    }

    async fn establish(
        &mut self,
        connector: &dyn Connector,
        options: ConnectOptions,
        timeout: Duration,
    ) -> Result<TransportLink, Exit> {
        let deadline = Instant::now() + timeout;
        let timed_out = || Exit::Failed(format!("not acknowledged within {timeout:?}"));

        let mut link = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Exit::Cancelled),
            connected = tokio::time::timeout_at(deadline, connector.connect(options)) => match connected {
                Ok(Ok(link)) => link,
                Ok(Err(e)) => return Err(Exit::Failed(e.to_string())),
                Err(_) => return Err(timed_out()),
            },
        };

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = link.commands.send(TransportCommand::Disconnect);
                    return Err(Exit::Cancelled);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let _ = link.commands.send(TransportCommand::Disconnect);
                    return Err(timed_out());
                }
                Some(op) = self.ops.recv() => self.pending.push_back(op),
                event = link.events.recv() => match event {
                    Some(TransportEvent::Connected) => return Ok(link),
                    Some(TransportEvent::Message { topic, .. }) => {
                        debug!(topic = %topic, "message before acknowledgement ignored");
                    }
                    Some(TransportEvent::Disconnected { reason }) => {
                        let _ = link.commands.send(TransportCommand::Disconnect);
                        return Err(Exit::Failed(reason));
                    }
                    Some(TransportEvent::Closed { reason }) => {
                        return Err(Exit::Failed(reason.unwrap_or_else(|| "closed by broker".into())));
                    }
                    None => return Err(Exit::Failed("transport went away".into())),
                },
            }
        }
    }

    async fn serve(&mut self, mut link: TransportLink) -> Exit {
        self.on_ready(&link);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    let _ = link.commands.send(TransportCommand::Disconnect);
                    return Exit::Cancelled;
                }
                Some(op) = self.ops.recv() => {
                    if *self.state.borrow() == ConnectionState::Ready {
                        self.apply(&link, op);
                    } else {
                        self.pending.push_back(op);
                    }
                }
                event = link.events.recv() => match event {
                    Some(TransportEvent::Connected) => {
                        info!(server = %self.key.server_id, workspace = %self.key.workspace_id, "reconnected");
                        self.metrics.reconnected();
                        self.on_ready(&link);
                    }
                    Some(TransportEvent::Message { topic, payload }) => self.route(&link, topic, payload),
                    Some(TransportEvent::Disconnected { reason }) => {
                        warn!(
                            server = %self.key.server_id,
                            workspace = %self.key.workspace_id,
                            reason = %reason,
                            "connection lost, waiting for transport to reconnect"
                        );
                        self.subscribed.clear();
                        self.state.send_replace(ConnectionState::Connecting);
                    }
                    Some(TransportEvent::Closed { reason }) => {
                        return Exit::Failed(reason.unwrap_or_else(|| "closed by broker".into()));
                    }
                    None => return Exit::Failed("transport went away".into()),
                },
            }
        }
    }

    /// Session accepted: subscribe the snapshot topics, ask for topology,
    /// restore response subscriptions, then flush queued operations.
    fn on_ready(&mut self, link: &TransportLink) {
        self.sessions += 1;
        self.subscribed.clear();

        for topic in [topics::TOPOLOGY, topics::PROCESS_LIST] {
            let _ = link.commands.send(TransportCommand::Subscribe {
                topic: topic.to_string(),
                qos: QoS::AtMostOnce,
            });
        }
        match protocol::encode(topics::TOPOLOGY_SUBSCRIBE, &TopologyRequest { count: 1 }) {
            Ok(payload) => self.send_publish(link, topics::TOPOLOGY_SUBSCRIBE.to_string(), payload, QoS::AtMostOnce),
            Err(e) => warn!(error = %e, "could not encode topology request"),
        }

        let waiting: Vec<String> = lock(&self.waiters).topics.keys().cloned().collect();
        for topic in waiting {
            self.sync_topic(link, &topic);
        }

        if self.sessions == 1 {
            info!(server = %self.key.server_id, workspace = %self.key.workspace_id, "connection ready");
        }
        self.state.send_replace(ConnectionState::Ready);

        while let Some(op) = self.pending.pop_front() {
            self.apply(link, op);
        }
    }

    fn apply(&mut self, link: &TransportLink, op: Op) {
        match op {
            Op::Publish {
                topic,
                payload,
                qos,
            } => self.send_publish(link, topic, payload, qos),
            Op::SyncTopic(topic) => self.sync_topic(link, &topic),
        }
    }

    fn send_publish(&self, link: &TransportLink, topic: String, payload: Vec<u8>, qos: QoS) {
        self.metrics.message_published();
        let _ = link.commands.send(TransportCommand::Publish {
            topic,
            payload,
            qos,
        });
    }

    fn sync_topic(&mut self, link: &TransportLink, topic: &str) {
        let wanted = lock(&self.waiters).wanted(topic);
        match wanted {
            Some(qos) if !self.subscribed.contains(topic) => {
                self.subscribed.insert(topic.to_string());
                let _ = link.commands.send(TransportCommand::Subscribe {
                    topic: topic.to_string(),
                    qos,
                });
            }
            None if self.subscribed.remove(topic) => {
                let _ = link.commands.send(TransportCommand::Unsubscribe {
                    topic: topic.to_string(),
                });
            }
            _ => {}
        }
    }

    fn route(&mut self, link: &TransportLink, topic: String, payload: Vec<u8>) {
        self.metrics.message_received();

        let resolved = lock(&self.waiters).topics.remove(&topic);
        if let Some(entry) = resolved {
            for (_, waiter) in entry.waiters {
                let _ = waiter.send(payload.clone());
            }
            self.sync_topic(link, &topic);
            return;
        }

        match protocol::decode(&topic, &payload) {
            Ok(Some(message)) => {
                let _ = self.inbound.send(InboundEvent {
                    key: self.key.clone(),
                    message,
                });
            }
            Ok(None) => debug!(topic = %topic, "no consumer for message"),
            Err(e) => {
                self.metrics.protocol_error();
                warn!(
                    server = %self.key.server_id,
                    workspace = %self.key.workspace_id,
                    error = %e,
                    "dropping malformed message"
                );
            }
        }
    }
}
