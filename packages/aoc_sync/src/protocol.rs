//! Wire payloads.
//!
//! Inbound messages are decoded per topic into a typed [`Inbound`] before
//! anything else looks at them; a payload that does not fit its topic's
//! schema is rejected here as a [`SyncError::Protocol`] and never reaches
//! the aggregators.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;
use crate::topics;

/// Topology snapshot for one workspace.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceTopology {
    #[serde(default)]
    pub topology: BTreeMap<String, PipelineTopology>,
    #[serde(rename = "display-style", default, skip_serializing_if = "Option::is_none")]
    pub display_style: Option<String>,
    #[serde(rename = "display-priority", default, skip_serializing_if = "Option::is_none")]
    pub display_priority: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineTopology {
    #[serde(default)]
    pub wires: Vec<Value>,
    pub properties: PipelineProperties,
    #[serde(default)]
    pub metrics: Vec<Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PipelineProperties {
    /// Stable identity of the pipeline across topology snapshots.
    pub container_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relative_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automation_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// One process as published by a workspace. The owning server and
/// workspace are implied by the connection it arrived on.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub automation_sources: Vec<String>,
    #[serde(default)]
    pub attachments: Vec<String>,
}

/// Process lists arrive either keyed by process id or as a plain array.
#[derive(Deserialize)]
#[serde(untagged)]
enum ProcessListWire {
    Keyed(BTreeMap<String, ProcessRecord>),
    Listed(Vec<ProcessRecord>),
}

/// Typed inbound message, one variant per snapshot topic.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    Topology(WorkspaceTopology),
    Processes(Vec<ProcessRecord>),
}

/// Decode a message by topic. `Ok(None)` means the topic carries no
/// snapshot data.
pub fn decode(topic: &str, payload: &[u8]) -> Result<Option<Inbound>, SyncError> {
    match topic {
        topics::TOPOLOGY => serde_json::from_slice::<WorkspaceTopology>(payload)
            .map(|t| Some(Inbound::Topology(t)))
            .map_err(|e| SyncError::protocol(topic, e)),
        topics::PROCESS_LIST => decode_process_list(topic, payload).map(|p| Some(Inbound::Processes(p))),
        _ => Ok(None),
    }
}

fn decode_process_list(topic: &str, payload: &[u8]) -> Result<Vec<ProcessRecord>, SyncError> {
    let wire: ProcessListWire =
        serde_json::from_slice(payload).map_err(|e| SyncError::protocol(topic, e))?;

    match wire {
        ProcessListWire::Keyed(map) => Ok(map
            .into_iter()
            .map(|(id, mut record)| {
                record.id = id;
                record
            })
            .collect()),
        ProcessListWire::Listed(records) => {
            if records.iter().any(|r| r.id.is_empty()) {
                return Err(SyncError::protocol(topic, "process entry without id"));
            }
            Ok(records)
        }
    }
}

/// Body of the topology subscription request.
#[derive(Debug, Serialize)]
pub struct TopologyRequest {
    pub count: u32,
}

/// Request published on a `gitops-req` topic.
#[derive(Debug, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum GitopsRequest {
    Get,
    Set {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        /// Base64 of binary content.
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<String>,
    },
    Delete,
}

impl GitopsRequest {
    pub fn set_content(content: impl Into<String>) -> Self {
        Self::Set {
            content: Some(content.into()),
            data: None,
        }
    }

    pub fn set_data(encoded: String) -> Self {
        Self::Set {
            content: None,
            data: Some(encoded),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CreateProcess<'a> {
    pub name: &'a str,
}

/// Fire-and-forget mutation published on a process's `set` topic.
#[derive(Debug, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ProcessMutation {
    Delete,
}

pub(crate) fn encode<T: Serialize>(topic: &str, body: &T) -> Result<Vec<u8>, SyncError> {
    serde_json::to_vec(body).map_err(|e| SyncError::protocol(topic, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPOLOGY_PAYLOAD: &str = r#"{
        "topology": {
            "a": {
                "wires": [],
                "properties": {
                    "container-id": "c-a",
                    "deployment-id": "dep-a",
                    "endpoint-id": 3,
                    "relative-path": "flows/a",
                    "name": "Ingest",
                    "state": "running",
                    "status": "Up 2 hours"
                },
                "metrics": []
            }
        },
        "display-style": "graph",
        "display-priority": "high"
    }"#;

    #[test]
    fn decodes_topology() {
        let Some(Inbound::Topology(topology)) =
            decode(topics::TOPOLOGY, TOPOLOGY_PAYLOAD.as_bytes()).unwrap()
        else {
            panic!("expected topology");
        };
        let entry = &topology.topology["a"];
        assert_eq!(entry.properties.container_id, "c-a");
        assert_eq!(entry.properties.deployment_id.as_deref(), Some("dep-a"));
        assert_eq!(entry.properties.relative_path.as_deref(), Some("flows/a"));
        // Unmodelled keys survive in `extra`.
        assert_eq!(entry.properties.extra["endpoint-id"], 3);
        assert_eq!(topology.display_style.as_deref(), Some("graph"));
    }

    #[test]
    fn topology_without_container_id_is_rejected() {
        let err = decode(
            topics::TOPOLOGY,
            br#"{"topology":{"a":{"properties":{"name":"x"}}}}"#,
        )
        .unwrap_err();
        assert_eq!(err.error_code(), "protocol");
    }

    #[test]
    fn decodes_keyed_process_list() {
        let payload = br#"{"p1":{"name":"Billing","automation_sources":["dep-a"]}}"#;
        let Some(Inbound::Processes(records)) = decode(topics::PROCESS_LIST, payload).unwrap()
        else {
            panic!("expected processes");
        };
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "p1");
        assert_eq!(records[0].automation_sources, vec!["dep-a"]);
        assert!(records[0].attachments.is_empty());
    }

    #[test]
    fn decodes_listed_process_list() {
        let payload = br#"[{"id":"p1","name":"Billing","attachments":["a.pdf"]}]"#;
        let Some(Inbound::Processes(records)) = decode(topics::PROCESS_LIST, payload).unwrap()
        else {
            panic!("expected processes");
        };
        assert_eq!(records[0].attachments, vec!["a.pdf"]);
    }

    #[test]
    fn listed_process_without_id_is_rejected() {
        let err = decode(topics::PROCESS_LIST, br#"[{"name":"nameless"}]"#).unwrap_err();
        assert!(matches!(err, SyncError::Protocol { .. }));
    }

    #[test]
    fn garbage_is_a_protocol_error() {
        assert!(decode(topics::TOPOLOGY, b"not json").is_err());
        assert!(decode(topics::PROCESS_LIST, b"42").is_err());
    }

    #[test]
    fn other_topics_are_not_snapshots() {
        assert_eq!(decode("/processes/c/p1/contents", b"hello").unwrap(), None);
    }

    #[test]
    fn request_bodies() {
        let get = serde_json::to_value(GitopsRequest::Get).unwrap();
        assert_eq!(get, serde_json::json!({"action": "get"}));

        let set = serde_json::to_value(GitopsRequest::set_content("# Notes")).unwrap();
        assert_eq!(set, serde_json::json!({"action": "set", "content": "# Notes"}));

        let upload = serde_json::to_value(GitopsRequest::set_data("AAEC".into())).unwrap();
        assert_eq!(upload, serde_json::json!({"action": "set", "data": "AAEC"}));

        let delete = serde_json::to_value(ProcessMutation::Delete).unwrap();
        assert_eq!(delete, serde_json::json!({"action": "delete"}));
    }
}
