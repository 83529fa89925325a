//! Runtime counters for the sync layer.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug, Default)]
pub struct SyncMetrics {
    // Connection metrics
    /// Connections currently held by the pool
    pub active_connections: AtomicU64,
    /// Connections opened since start
    pub total_connections: AtomicU64,
    /// Connections that ended in the failed state
    pub connections_failed: AtomicU64,
    /// Sessions re-established after a drop
    pub reconnects: AtomicU64,

    // Message metrics
    pub messages_received: AtomicU64,
    pub messages_published: AtomicU64,
    /// Inbound payloads rejected by the decoder
    pub protocol_errors: AtomicU64,

    // Call metrics
    pub calls_completed: AtomicU64,
    pub calls_timed_out: AtomicU64,
    pub calls_failed: AtomicU64,

    /// Aggregate rebuilds published to the store
    pub state_rebuilds: AtomicU64,

    start_time: Option<Instant>,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connections_closed(&self, count: u64) {
        self.active_connections.fetch_sub(count, Ordering::Relaxed);
    }

    pub fn connection_failed(&self) {
        self.connections_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnected(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn call_completed(&self) {
        self.calls_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn call_timed_out(&self) {
        self.calls_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn call_failed(&self) {
        self.calls_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn state_rebuilt(&self) {
        self.state_rebuilds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
                failed: self.connections_failed.load(Ordering::Relaxed),
                reconnects: self.reconnects.load(Ordering::Relaxed),
            },
            messages: MessageMetrics {
                received: self.messages_received.load(Ordering::Relaxed),
                published: self.messages_published.load(Ordering::Relaxed),
                protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            },
            calls: CallMetrics {
                completed: self.calls_completed.load(Ordering::Relaxed),
                timed_out: self.calls_timed_out.load(Ordering::Relaxed),
                failed: self.calls_failed.load(Ordering::Relaxed),
            },
            state_rebuilds: self.state_rebuilds.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub messages: MessageMetrics,
    pub calls: CallMetrics,
    pub state_rebuilds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
    pub failed: u64,
    pub reconnects: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetrics {
    pub received: u64,
    pub published: u64,
    pub protocol_errors: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallMetrics {
    pub completed: u64,
    pub timed_out: u64,
    pub failed: u64,
}
