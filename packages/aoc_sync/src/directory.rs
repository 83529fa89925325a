//! Automation server and workspace metadata supplied by the host.
//!
//! Topology projection joins against this directory for display names and
//! editor links. Missing entries are never an error: the raw ids are used
//! instead.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub editor_url: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutomationServer {
    pub automation_server_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub workspaces: Vec<Workspace>,
}

impl AutomationServer {
    pub fn workspace(&self, workspace_id: &str) -> Option<&Workspace> {
        self.workspaces.iter().find(|w| w.id == workspace_id)
    }
}

#[derive(Clone, Debug, Default)]
pub struct ServerDirectory {
    servers: HashMap<String, AutomationServer>,
}

impl ServerDirectory {
    pub fn new(servers: impl IntoIterator<Item = AutomationServer>) -> Self {
        Self {
            servers: servers
                .into_iter()
                .map(|s| (s.automation_server_id.clone(), s))
                .collect(),
        }
    }

    pub fn server(&self, server_id: &str) -> Option<&AutomationServer> {
        self.servers.get(server_id)
    }

    pub fn workspace(&self, server_id: &str, workspace_id: &str) -> Option<&Workspace> {
        self.server(server_id)?.workspace(workspace_id)
    }

    pub fn server_name<'a>(&'a self, server_id: &'a str) -> &'a str {
        self.server(server_id)
            .map(|s| s.name.as_str())
            .filter(|name| !name.is_empty())
            .unwrap_or(server_id)
    }

    pub fn workspace_name<'a>(&'a self, server_id: &str, workspace_id: &'a str) -> &'a str {
        self.workspace(server_id, workspace_id)
            .map(|w| w.name.as_str())
            .filter(|name| !name.is_empty())
            .unwrap_or(workspace_id)
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> ServerDirectory {
        ServerDirectory::new([AutomationServer {
            automation_server_id: "srv".into(),
            name: "Plant Floor".into(),
            workspaces: vec![Workspace {
                id: "ws".into(),
                name: "Line 4".into(),
                editor_url: Some("https://editor.example.com".into()),
            }],
        }])
    }

    #[test]
    fn names_resolve_from_metadata() {
        let dir = directory();
        assert_eq!(dir.server_name("srv"), "Plant Floor");
        assert_eq!(dir.workspace_name("srv", "ws"), "Line 4");
    }

    #[test]
    fn unknown_ids_fall_back_to_raw_id() {
        let dir = directory();
        assert_eq!(dir.server_name("other"), "other");
        assert_eq!(dir.workspace_name("srv", "missing"), "missing");
        assert_eq!(dir.workspace_name("other", "ws"), "ws");
    }

    #[test]
    fn blank_names_fall_back_to_raw_id() {
        let dir = ServerDirectory::new([AutomationServer {
            automation_server_id: "srv".into(),
            name: String::new(),
            workspaces: vec![],
        }]);
        assert_eq!(dir.server_name("srv"), "srv");
    }

    #[test]
    fn deserializes_backend_listing() {
        let servers: Vec<AutomationServer> = serde_json::from_str(
            r#"[{"automation_server_id":"srv","name":"A","is_connected":true,
                 "workspaces":[{"id":"ws","name":"W","editor_url":null}]}]"#,
        )
        .unwrap();
        let dir = ServerDirectory::new(servers);
        assert_eq!(dir.len(), 1);
        assert_eq!(dir.workspace("srv", "ws").unwrap().editor_url, None);
    }
}
