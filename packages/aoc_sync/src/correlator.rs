//! Request/response over publish/subscribe.
//!
//! A call registers a waiter on its response topic, publishes the request,
//! and waits for the first message on that topic or the deadline, whichever
//! comes first. The waiter is removed on every exit path by a drop guard, so
//! a response arriving after the deadline finds nothing to resolve.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::connection::ConnectionHandle;
use crate::error::SyncError;
use crate::metrics::SyncMetrics;
use crate::pool::ConnectionPool;
use crate::token::ConnectionKey;
use crate::transport::QoS;

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug)]
pub struct CallOptions {
    pub timeout: Duration,
    pub qos: QoS,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_CALL_TIMEOUT,
            qos: QoS::AtLeastOnce,
        }
    }
}

impl CallOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }
}

/// A registered waiter. Dropping it removes the waiter.
struct PendingCall {
    handle: ConnectionHandle,
    topic: String,
    id: u64,
    created_at: Instant,
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.handle.remove_waiter(&self.topic, self.id);
        debug!(
            topic = %self.topic,
            elapsed_ms = self.created_at.elapsed().as_millis() as u64,
            "call finished"
        );
    }
}

pub struct Correlator {
    pool: Arc<ConnectionPool>,
    metrics: Arc<SyncMetrics>,
}

impl Correlator {
    pub fn new(pool: Arc<ConnectionPool>, metrics: Arc<SyncMetrics>) -> Self {
        Self { pool, metrics }
    }

    async fn handle(&self, key: &ConnectionKey) -> Result<ConnectionHandle, SyncError> {
        self.pool
            .handle(key)
            .await
            .ok_or_else(|| SyncError::NotConnected(key.clone()))
    }

    /// Publish `payload` on `request_topic` and return the raw payload of the
    /// first message on `response_topic`.
    pub async fn call(
        &self,
        key: &ConnectionKey,
        request_topic: &str,
        response_topic: &str,
        payload: Vec<u8>,
        options: CallOptions,
    ) -> Result<Vec<u8>, SyncError> {
        let deadline = Instant::now() + options.timeout;
        let handle = self.handle(key).await?;

        let result = self
            .exchange(&handle, request_topic, response_topic, payload, options, deadline)
            .await;
        match &result {
            Ok(_) => self.metrics.call_completed(),
            Err(e) if e.is_timeout() => self.metrics.call_timed_out(),
            Err(_) => self.metrics.call_failed(),
        }
        result
    }

    async fn exchange(
        &self,
        handle: &ConnectionHandle,
        request_topic: &str,
        response_topic: &str,
        payload: Vec<u8>,
        options: CallOptions,
        deadline: Instant,
    ) -> Result<Vec<u8>, SyncError> {
        let (id, mut response) = handle.register_waiter(response_topic, options.qos)?;
        let _pending = PendingCall {
            handle: handle.clone(),
            topic: response_topic.to_string(),
            id,
            created_at: Instant::now(),
        };

        handle.publish(request_topic, payload, options.qos)?;

        match tokio::time::timeout_at(deadline, &mut response).await {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(_)) => Err(SyncError::Closed(handle.key().clone())),
            Err(_) => Err(SyncError::Timeout {
                topic: response_topic.to_string(),
                timeout: options.timeout,
            }),
        }
    }

    /// Publish without waiting for a reply. The effect shows up in a later
    /// snapshot.
    pub async fn fire(
        &self,
        key: &ConnectionKey,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
    ) -> Result<(), SyncError> {
        self.handle(key).await?.publish(topic, payload, qos)
    }
}
