//! Error taxonomy for the sync layer, with stable codes for callers that
//! surface failures to operators.

use std::time::Duration;

use crate::token::ConnectionKey;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The transport could not be established or was lost for good.
    #[error("connection {key} failed: {reason}")]
    Connection { key: ConnectionKey, reason: String },

    /// A correlated call saw no matching response before its deadline.
    #[error("no response on {topic} within {timeout:?}")]
    Timeout { topic: String, timeout: Duration },

    /// An inbound payload did not match the shape expected for its topic.
    #[error("malformed payload on {topic}: {reason}")]
    Protocol { topic: String, reason: String },

    #[error("no connection for {0}")]
    NotConnected(ConnectionKey),

    #[error("connection {0} closed before the call completed")]
    Closed(ConnectionKey),

    /// A caller-supplied name cannot be used as a topic segment.
    #[error("invalid topic segment {0:?}")]
    InvalidSegment(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SyncError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::Timeout { .. } => "timeout",
            Self::Protocol { .. } => "protocol",
            Self::NotConnected(_) => "not_connected",
            Self::Closed(_) => "closed",
            Self::InvalidSegment(_) => "invalid_segment",
            Self::Io(_) => "io",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub(crate) fn protocol(topic: &str, reason: impl ToString) -> Self {
        Self::Protocol {
            topic: topic.to_string(),
            reason: reason.to_string(),
        }
    }
}
