//! Publish/subscribe transport seam.
//!
//! A [`Connector`] opens one broker session and hands back a
//! [`TransportLink`]: a command sender and an event receiver. Everything
//! above this module talks to the broker only through those two channels.
//!
//! - `mqtt`: MQTT over websocket/TCP via rumqttc
//! - `memory`: in-process broker with the same link shape, for tests
//!   (`test-util` feature)

#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod mqtt;

use std::fmt;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::SyncError;
use crate::token::ConnectionKey;

/// Delivery guarantee requested for one publish or subscription.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QoS {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

#[derive(Clone)]
pub struct ConnectOptions {
    pub key: ConnectionKey,
    pub broker_url: String,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub clean_session: bool,
    pub keep_alive: Duration,
    pub reconnect_delay: Duration,
    pub max_packet_bytes: usize,
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("key", &self.key)
            .field("broker_url", &self.broker_url)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("clean_session", &self.clean_session)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportCommand {
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
    },
    Subscribe {
        topic: String,
        qos: QoS,
    },
    Unsubscribe {
        topic: String,
    },
    Disconnect,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// Session (re)established. Subscriptions do not survive a reconnect.
    Connected,
    Message {
        topic: String,
        payload: Vec<u8>,
    },
    /// Session lost; the transport keeps retrying.
    Disconnected { reason: String },
    /// Session over for good. No further events follow.
    Closed { reason: Option<String> },
}

pub struct TransportLink {
    pub commands: mpsc::UnboundedSender<TransportCommand>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Capacity of the event channel from a transport to its connection.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

pub trait Connector: Send + Sync + 'static {
    /// Start a session. Returning `Ok` does not mean the broker accepted the
    /// session yet; that is signalled by [`TransportEvent::Connected`].
    fn connect(&self, options: ConnectOptions) -> BoxFuture<'static, Result<TransportLink, SyncError>>;
}
