//! Realtime state sync and RPC over MQTT for the automation operations
//! console.
//!
//! One broker connection is kept per automation server workspace. Topology
//! and process snapshots from every workspace are merged into a single
//! read-only [`AggregateState`]; content and attachment transfers are
//! request/response calls correlated by topic.
//!
//! ```text
//!   tokens ──► ConnectionPool ──► connection actors ──► event loop ──► StateStore
//!                                        ▲                  │
//!                 Correlator ────────────┘                  └──► ListenerHub
//! ```
//!
//! [`SyncService`] ties these together and is the only type most hosts need.

pub mod aggregate;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod directory;
pub mod error;
pub mod hub;
pub mod metrics;
pub mod pool;
pub mod protocol;
pub mod service;
pub mod store;
pub mod token;
pub mod topics;
pub mod transport;

pub use aggregate::{
    AggregateState, Pipeline, PipelineStat, Process, ServerGroup, UNASSIGNED_PROCESS_ID,
    WorkspaceSnapshot,
};
pub use config::SyncConfig;
pub use connection::ConnectionState;
pub use correlator::CallOptions;
pub use directory::{AutomationServer, Workspace};
pub use error::SyncError;
pub use hub::{ListenerHub, Subscription};
pub use metrics::MetricsSnapshot;
pub use pool::ConnectionInfo;
pub use service::{Attachment, SyncService};
pub use token::{ConnectionKey, TokenData};
pub use transport::QoS;
#[cfg(any(test, feature = "test-util"))]
pub use transport::memory::MemoryBroker;
pub use transport::mqtt::MqttConnector;
