//! Credentials handed in by the host and the connection identity derived
//! from them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of one pooled connection: one automation server workspace.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionKey {
    pub server_id: String,
    pub workspace_id: String,
}

impl ConnectionKey {
    pub fn new(server_id: impl Into<String>, workspace_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            workspace_id: workspace_id.into(),
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.server_id, self.workspace_id)
    }
}

/// One broker credential, scoped to a single workspace.
///
/// Field names follow the backend's token endpoint so a token list can be
/// deserialized straight from it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenData {
    pub automation_server_id: String,
    pub workspace_id: String,
    pub token: String,
}

impl TokenData {
    pub fn new(
        automation_server_id: impl Into<String>,
        workspace_id: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            automation_server_id: automation_server_id.into(),
            workspace_id: workspace_id.into(),
            token: token.into(),
        }
    }

    pub fn key(&self) -> ConnectionKey {
        ConnectionKey::new(&self.automation_server_id, &self.workspace_id)
    }

    /// Entries missing any of the three fields cannot be connected.
    pub fn is_valid(&self) -> bool {
        !self.token.is_empty()
            && !self.automation_server_id.is_empty()
            && !self.workspace_id.is_empty()
    }
}

// Credentials never reach the logs.
impl fmt::Debug for TokenData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenData")
            .field("automation_server_id", &self.automation_server_id)
            .field("workspace_id", &self.workspace_id)
            .field(
                "token",
                &if self.token.is_empty() { "missing" } else { "present" },
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_display() {
        let token = TokenData::new("srv-1", "ws-a", "secret");
        assert_eq!(token.key().to_string(), "srv-1/ws-a");
    }

    #[test]
    fn validity_requires_all_fields() {
        assert!(TokenData::new("s", "w", "t").is_valid());
        assert!(!TokenData::new("", "w", "t").is_valid());
        assert!(!TokenData::new("s", "", "t").is_valid());
        assert!(!TokenData::new("s", "w", "").is_valid());
    }

    #[test]
    fn debug_redacts_credential() {
        let rendered = format!("{:?}", TokenData::new("s", "w", "hunter2"));
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("present"));
    }

    #[test]
    fn deserializes_backend_shape() {
        let tokens: Vec<TokenData> = serde_json::from_str(
            r#"[{"automation_server_id":"srv","workspace_id":"ws","token":"abc"}]"#,
        )
        .unwrap();
        assert_eq!(tokens[0].key(), ConnectionKey::new("srv", "ws"));
    }

    #[test]
    fn keys_order_by_server_then_workspace() {
        let mut keys = vec![
            ConnectionKey::new("b", "1"),
            ConnectionKey::new("a", "2"),
            ConnectionKey::new("a", "1"),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                ConnectionKey::new("a", "1"),
                ConnectionKey::new("a", "2"),
                ConnectionKey::new("b", "1"),
            ]
        );
    }
}
