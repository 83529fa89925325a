//! ConnectionPool: one broker connection per automation server workspace.
//!
//! `reconcile` only ever adds. Keys already in the pool are left alone, so
//! repeated or overlapping token sets never reconnect anything; an empty set
//! is the log-out path and tears everything down.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rand::Rng;
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::connection::{self, ConnectionHandle, ConnectionState, InboundEvent};
use crate::metrics::SyncMetrics;
use crate::token::{ConnectionKey, TokenData};
use crate::transport::{ConnectOptions, Connector};

/// A pooled connection as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub key: ConnectionKey,
    #[serde(flatten)]
    pub state: ConnectionState,
}

pub struct ConnectionPool {
    connections: Mutex<HashMap<ConnectionKey, ConnectionHandle>>,
    connector: Arc<dyn Connector>,
    broker: BrokerConfig,
    inbound: mpsc::UnboundedSender<InboundEvent>,
    metrics: Arc<SyncMetrics>,
    /// Set by `shutdown`, only while the connection map is locked.
    shut_down: AtomicBool,
}

impl ConnectionPool {
    pub fn new(
        connector: Arc<dyn Connector>,
        broker: BrokerConfig,
        inbound: mpsc::UnboundedSender<InboundEvent>,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            connector,
            broker,
            inbound,
            metrics,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Open connections for keys not yet in the pool. Returns how many were
    /// opened. An empty token set closes and forgets every connection.
    ///
    /// A key whose connection failed stays in the pool, so a later reconcile
    /// does not retry it; only an empty set clears it.
    pub async fn reconcile(&self, tokens: &[TokenData]) -> usize {
        if tokens.is_empty() {
            self.clear().await;
            return 0;
        }

        let mut connections = self.connections.lock().await;
        if self.shut_down.load(Ordering::Acquire) {
            debug!("connection pool shut down, ignoring tokens");
            return 0;
        }
        let mut opened = 0;

        for token in tokens {
            if !token.is_valid() {
                warn!(?token, "skipping incomplete broker token");
                continue;
            }
            let key = token.key();
            if connections.contains_key(&key) {
                continue;
            }

            let handle = connection::spawn(
                self.connect_options(token),
                self.broker.connect_timeout,
                self.connector.clone(),
                self.inbound.clone(),
                self.metrics.clone(),
            );
            self.metrics.connection_opened();
            connections.insert(key, handle);
            opened += 1;
        }

        if opened > 0 {
            info!(opened, total = connections.len(), "connection pool reconciled");
        } else {
            debug!(total = connections.len(), "connection pool already up to date");
        }
        opened
    }

    fn connect_options(&self, token: &TokenData) -> ConnectOptions {
        ConnectOptions {
            key: token.key(),
            broker_url: self.broker.url.clone(),
            client_id: client_id(&self.broker.client_id_prefix),
            username: self.broker.username.clone(),
            password: token.token.clone(),
            clean_session: true,
            keep_alive: self.broker.keep_alive,
            reconnect_delay: self.broker.reconnect_delay,
            max_packet_bytes: self.broker.max_packet_bytes,
        }
    }

    /// Close every connection and empty the pool.
    pub async fn clear(&self) {
        self.drain(false).await;
    }

    /// Close every connection and refuse any later `reconcile`.
    pub async fn shutdown(&self) {
        self.drain(true).await;
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    async fn drain(&self, shut_down: bool) {
        let drained: Vec<ConnectionHandle> = {
            let mut connections = self.connections.lock().await;
            if shut_down {
                self.shut_down.store(true, Ordering::Release);
            }
            connections.drain().map(|(_, handle)| handle).collect()
        };
        if drained.is_empty() {
            return;
        }

        for handle in &drained {
            handle.close();
        }
        // Once every actor has stopped, no snapshot from these connections
        // can still be in flight.
        for handle in &drained {
            handle.closed().await;
        }
        self.metrics.connections_closed(drained.len() as u64);
        info!(closed = drained.len(), "connection pool cleared");
    }

    pub async fn handle(&self, key: &ConnectionKey) -> Option<ConnectionHandle> {
        self.connections.lock().await.get(key).cloned()
    }

    /// Every pooled connection with its current state, ordered by key.
    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        let connections = self.connections.lock().await;
        let mut list: Vec<ConnectionInfo> = connections
            .iter()
            .map(|(key, handle)| ConnectionInfo {
                key: key.clone(),
                state: handle.state(),
            })
            .collect();
        list.sort_by(|a, b| a.key.cmp(&b.key));
        list
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.lock().await.is_empty()
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        for handle in self.connections.get_mut().values() {
            handle.close();
        }
    }
}

/// Randomized per connection so two consoles never evict each other.
fn client_id(prefix: &str) -> String {
    let suffix: u32 = rand::rng().random_range(0..0x100_0000);
    format!("{prefix}{suffix:06x}")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::SyncConfig;
    use crate::transport::memory::{ClientBehavior, MemoryBroker};

    fn pool(broker: &MemoryBroker) -> (ConnectionPool, mpsc::UnboundedReceiver<InboundEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut config = SyncConfig::default().broker;
        config.connect_timeout = Duration::from_millis(200);
        let pool = ConnectionPool::new(
            Arc::new(broker.clone()),
            config,
            tx,
            Arc::new(SyncMetrics::new()),
        );
        (pool, rx)
    }

    fn tokens(pairs: &[(&str, &str)]) -> Vec<TokenData> {
        pairs
            .iter()
            .map(|(s, w)| TokenData::new(*s, *w, format!("tok-{s}-{w}")))
            .collect()
    }

    #[test]
    fn client_ids_are_prefixed_and_randomized() {
        let id = client_id("aoc-console-");
        assert!(id.starts_with("aoc-console-"));
        assert_eq!(id.len(), "aoc-console-".len() + 6);
        assert!(id["aoc-console-".len()..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let broker = MemoryBroker::new();
        let (pool, _rx) = pool(&broker);
        let set = tokens(&[("s1", "w1"), ("s1", "w2")]);

        assert_eq!(pool.reconcile(&set).await, 2);
        assert_eq!(pool.reconcile(&set).await, 0);
        assert_eq!(pool.len().await, 2);

        tokio::time::timeout(Duration::from_secs(1), broker.wait_until(|b| b.client_count() == 2))
            .await
            .unwrap();
        assert_eq!(broker.sessions_opened(), 2);
    }

    #[tokio::test]
    async fn superset_only_adds_new_keys() {
        let broker = MemoryBroker::new();
        let (pool, _rx) = pool(&broker);

        pool.reconcile(&tokens(&[("s1", "w1")])).await;
        let opened = pool
            .reconcile(&tokens(&[("s1", "w1"), ("s2", "w1")]))
            .await;
        assert_eq!(opened, 1);

        // A subset does not tear anything down.
        assert_eq!(pool.reconcile(&tokens(&[("s2", "w1")])).await, 0);
        assert_eq!(pool.len().await, 2);
    }

    #[tokio::test]
    async fn duplicate_keys_in_one_set_open_once() {
        let broker = MemoryBroker::new();
        let (pool, _rx) = pool(&broker);
        let mut set = tokens(&[("s1", "w1")]);
        set.push(TokenData::new("s1", "w1", "rotated"));

        assert_eq!(pool.reconcile(&set).await, 1);
    }

    #[tokio::test]
    async fn invalid_tokens_are_skipped() {
        let broker = MemoryBroker::new();
        let (pool, _rx) = pool(&broker);
        let set = vec![
            TokenData::new("s1", "w1", ""),
            TokenData::new("", "w1", "tok"),
            TokenData::new("s1", "w2", "tok"),
        ];

        assert_eq!(pool.reconcile(&set).await, 1);
        assert!(pool.handle(&ConnectionKey::new("s1", "w2")).await.is_some());
        assert!(pool.handle(&ConnectionKey::new("s1", "w1")).await.is_none());
    }

    #[tokio::test]
    async fn empty_set_clears_everything() {
        let broker = MemoryBroker::new();
        let (pool, _rx) = pool(&broker);
        pool.reconcile(&tokens(&[("s1", "w1"), ("s1", "w2")])).await;
        tokio::time::timeout(Duration::from_secs(1), broker.wait_until(|b| b.client_count() == 2))
            .await
            .unwrap();

        assert_eq!(pool.reconcile(&[]).await, 0);
        assert!(pool.is_empty().await);
        tokio::time::timeout(Duration::from_secs(1), broker.wait_until(|b| b.client_count() == 0))
            .await
            .unwrap();

        // Logging back in connects again.
        assert_eq!(pool.reconcile(&tokens(&[("s1", "w1")])).await, 1);
    }

    #[tokio::test]
    async fn shut_down_pool_opens_nothing() {
        let broker = MemoryBroker::new();
        let (pool, _rx) = pool(&broker);
        pool.reconcile(&tokens(&[("s1", "w1")])).await;

        pool.shutdown().await;
        assert!(pool.is_shut_down());
        assert!(pool.is_empty().await);

        assert_eq!(pool.reconcile(&tokens(&[("s1", "w1"), ("s2", "w1")])).await, 0);
        assert!(pool.is_empty().await);
        tokio::time::timeout(Duration::from_secs(1), broker.wait_until(|b| b.client_count() == 0))
            .await
            .unwrap();
        assert_eq!(broker.sessions_opened(), 1);
    }

    #[tokio::test]
    async fn failed_connection_is_isolated_and_not_retried() {
        let broker = MemoryBroker::new();
        broker.set_behavior("tok-s1-w1", ClientBehavior::Refuse("denied".into()));
        let (pool, _rx) = pool(&broker);
        let set = tokens(&[("s1", "w1"), ("s1", "w2")]);
        pool.reconcile(&set).await;

        let failed = pool.handle(&ConnectionKey::new("s1", "w1")).await.unwrap();
        let healthy = pool.handle(&ConnectionKey::new("s1", "w2")).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), failed.closed())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), healthy.ready())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(pool.reconcile(&set).await, 0);
        assert_eq!(broker.sessions_opened(), 2);

        let listed = pool.connections().await;
        assert_eq!(listed.len(), 2);
        assert!(matches!(listed[0].state, ConnectionState::Failed { .. }));
        assert_eq!(listed[1].state, ConnectionState::Ready);
    }

    mod properties {
        use std::collections::BTreeSet;

        use proptest::prelude::*;

        use super::*;

        fn key_sets() -> impl Strategy<Value = Vec<BTreeSet<(u8, u8)>>> {
            prop::collection::vec(prop::collection::btree_set((0..3u8, 0..3u8), 0..5), 1..6)
        }

        fn tokens(keys: &BTreeSet<(u8, u8)>) -> Vec<TokenData> {
            keys.iter()
                .map(|(s, w)| TokenData::new(format!("srv-{s}"), format!("ws-{w}"), format!("tok-{s}-{w}")))
                .collect()
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(32))]

            #[test]
            fn pool_never_exceeds_distinct_keys(sets in key_sets()) {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .unwrap();

                runtime.block_on(async {
                    let broker = MemoryBroker::new();
                    let (pool, _rx) = pool(&broker);

                    let mut ever = BTreeSet::new();
                    let mut since_logout = BTreeSet::new();
                    for set in &sets {
                        let tokens = tokens(set);
                        pool.reconcile(&tokens).await;
                        if set.is_empty() {
                            since_logout.clear();
                        }
                        ever.extend(set.iter().copied());
                        since_logout.extend(set.iter().copied());

                        let live = pool.len().await;
                        assert!(live <= ever.len());
                        assert_eq!(live, since_logout.len());

                        if !set.is_empty() {
                            assert_eq!(pool.reconcile(&tokens).await, 0);
                        }
                    }
                });
            }
        }
    }
}
