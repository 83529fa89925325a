//! The merged read model.
//!
//! The [`Aggregator`] keeps one [`WorkspaceSnapshot`] per connection and
//! derives an [`AggregateState`] from them on demand. Derivation is a pure
//! function of the snapshots, the server directory and the pipeline
//! statistics: snapshots are visited in key order, so the result does not
//! depend on the order messages arrived in.

pub mod processes;
pub mod topology;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

pub use processes::{Process, UNASSIGNED_PROCESS_ID, UNASSIGNED_PROCESS_NAME};
pub use topology::Pipeline;

use crate::connection::InboundEvent;
use crate::directory::{AutomationServer, ServerDirectory};
use crate::protocol::{Inbound, ProcessRecord, WorkspaceTopology};
use crate::token::ConnectionKey;

/// Externally supplied statistics for pipelines whose deployment id starts
/// with `deployment_id`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineStat {
    pub deployment_id: String,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, Value>,
}

/// Everything known about one workspace.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WorkspaceSnapshot {
    pub server_id: String,
    pub workspace_id: String,
    pub pipelines: Vec<Pipeline>,
    pub processes: BTreeMap<String, Process>,
    /// Last raw topology, kept so metadata changes can re-project it.
    #[serde(skip)]
    topology: Option<WorkspaceTopology>,
}

impl WorkspaceSnapshot {
    pub fn new(key: &ConnectionKey) -> Self {
        Self {
            server_id: key.server_id.clone(),
            workspace_id: key.workspace_id.clone(),
            pipelines: Vec::new(),
            processes: BTreeMap::new(),
            topology: None,
        }
    }

    pub fn key(&self) -> ConnectionKey {
        ConnectionKey::new(&self.server_id, &self.workspace_id)
    }

    /// Whether a topology message has arrived for this workspace yet.
    pub fn has_topology(&self) -> bool {
        self.topology.is_some()
    }
}

/// Per-server view of the aggregate.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ServerGroup {
    pub automation_server_id: String,
    pub name: String,
    pub workspaces: BTreeMap<String, WorkspaceSnapshot>,
    pub pipelines: Vec<Pipeline>,
}

/// Immutable snapshot handed to consumers.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AggregateState {
    pub all_pipelines: Vec<Pipeline>,
    pub processes_by_id: BTreeMap<String, Process>,
    pub servers_by_id: BTreeMap<String, ServerGroup>,
    pub is_loading: bool,
}

impl Default for AggregateState {
    fn default() -> Self {
        Self {
            all_pipelines: Vec::new(),
            processes_by_id: BTreeMap::new(),
            servers_by_id: BTreeMap::new(),
            is_loading: true,
        }
    }
}

impl AggregateState {
    pub fn workspace(&self, key: &ConnectionKey) -> Option<&WorkspaceSnapshot> {
        self.servers_by_id
            .get(&key.server_id)?
            .workspaces
            .get(&key.workspace_id)
    }

    pub fn unassigned(&self) -> Option<&Process> {
        self.processes_by_id.get(UNASSIGNED_PROCESS_ID)
    }

    /// Real processes, without the pseudo-process.
    pub fn processes(&self) -> impl Iterator<Item = &Process> {
        self.processes_by_id.values().filter(|p| !p.is_unassigned())
    }
}

pub struct Aggregator {
    workspaces: BTreeMap<ConnectionKey, WorkspaceSnapshot>,
    directory: ServerDirectory,
    stats: Vec<PipelineStat>,
    loading: bool,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl Aggregator {
    pub fn new() -> Self {
        Self {
            workspaces: BTreeMap::new(),
            directory: ServerDirectory::default(),
            stats: Vec::new(),
            loading: true,
        }
    }

    pub fn apply(&mut self, event: InboundEvent) {
        match event.message {
            Inbound::Topology(topology) => self.on_topology_message(&event.key, topology),
            Inbound::Processes(records) => self.on_process_message(&event.key, records),
        }
    }

    /// Replace a workspace's pipelines with the projection of `topology`.
    pub fn on_topology_message(&mut self, key: &ConnectionKey, topology: WorkspaceTopology) {
        let pipelines = topology::project(key, &topology, &self.directory, &self.stats);
        debug!(workspace = %key, pipelines = pipelines.len(), "topology snapshot");

        let snapshot = self.workspace_mut(key);
        snapshot.pipelines = pipelines;
        snapshot.topology = Some(topology);
    }

    /// Replace a workspace's processes. A workspace seen here first gets a
    /// placeholder snapshot with no pipelines.
    pub fn on_process_message(&mut self, key: &ConnectionKey, records: Vec<ProcessRecord>) {
        if !self.workspaces.contains_key(key) {
            debug!(workspace = %key, "process list arrived before topology, adding placeholder");
        }
        processes::replace_processes(self.workspace_mut(key), records);

        if let Some(snapshot) = self.workspaces.get(key) {
            let collisions = processes::colliding_ids(key, snapshot, self.workspaces.values());
            if !collisions.is_empty() {
                warn!(
                    workspace = %key,
                    ids = ?collisions,
                    "process ids published by more than one workspace"
                );
            }
        }
    }

    fn workspace_mut(&mut self, key: &ConnectionKey) -> &mut WorkspaceSnapshot {
        self.loading = false;
        self.workspaces
            .entry(key.clone())
            .or_insert_with(|| WorkspaceSnapshot::new(key))
    }

    pub fn set_directory(&mut self, servers: Vec<AutomationServer>) {
        self.directory = ServerDirectory::new(servers);
        self.reproject();
    }

    pub fn set_pipeline_stats(&mut self, stats: Vec<PipelineStat>) {
        self.stats = stats;
        self.reproject();
    }

    fn reproject(&mut self) {
        for (key, snapshot) in &mut self.workspaces {
            if let Some(topology) = &snapshot.topology {
                snapshot.pipelines = topology::project(key, topology, &self.directory, &self.stats);
            }
        }
    }

    /// The grace period ran out. Returns whether this changed anything.
    pub fn loading_grace_elapsed(&mut self) -> bool {
        std::mem::replace(&mut self.loading, false)
    }

    /// Forget every workspace. Loading does not start over.
    pub fn clear(&mut self) {
        self.workspaces.clear();
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn workspace_count(&self) -> usize {
        self.workspaces.len()
    }

    pub fn state(&self) -> AggregateState {
        let mut servers_by_id: BTreeMap<String, ServerGroup> = BTreeMap::new();
        let mut all_pipelines = Vec::new();

        for (key, snapshot) in &self.workspaces {
            let group = servers_by_id
                .entry(key.server_id.clone())
                .or_insert_with(|| ServerGroup {
                    automation_server_id: key.server_id.clone(),
                    name: self.directory.server_name(&key.server_id).to_string(),
                    workspaces: BTreeMap::new(),
                    pipelines: Vec::new(),
                });
            group.pipelines.extend(snapshot.pipelines.iter().cloned());
            group
                .workspaces
                .insert(key.workspace_id.clone(), snapshot.clone());
            all_pipelines.extend(snapshot.pipelines.iter().cloned());
        }

        let mut processes_by_id = processes::merge_processes(self.workspaces.values());
        let every_process = self.workspaces.values().flat_map(|s| s.processes.values());
        if let Some(unassigned) = processes::unassigned_process(&all_pipelines, every_process) {
            processes_by_id.insert(unassigned.id.clone(), unassigned);
        }

        AggregateState {
            all_pipelines,
            processes_by_id,
            servers_by_id,
            is_loading: self.loading,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::Workspace;

    fn topology(entries: &[(&str, &str)]) -> WorkspaceTopology {
        let map: serde_json::Map<String, Value> = entries
            .iter()
            .map(|(name, deployment)| {
                (
                    name.to_string(),
                    serde_json::json!({"properties": {"container-id": format!("c-{name}"), "deployment-id": deployment}}),
                )
            })
            .collect();
        serde_json::from_value(serde_json::json!({ "topology": map })).unwrap()
    }

    fn process(id: &str, sources: &[&str]) -> ProcessRecord {
        ProcessRecord {
            id: id.into(),
            name: id.to_uppercase(),
            automation_sources: sources.iter().map(|s| s.to_string()).collect(),
            attachments: Vec::new(),
        }
    }

    #[test]
    fn starts_loading_and_empty() {
        let aggregator = Aggregator::new();
        let state = aggregator.state();
        assert!(state.is_loading);
        assert!(state.all_pipelines.is_empty());
        assert!(state.processes_by_id.is_empty());
        assert_eq!(state, AggregateState::default());
    }

    #[test]
    fn topology_then_processes_scenario() {
        let key = ConnectionKey::new("s1", "w1");
        let mut aggregator = Aggregator::new();
        aggregator.on_topology_message(&key, topology(&[("a", "dep-a"), ("b", "dep-b")]));
        aggregator.on_process_message(&key, vec![process("p1", &["dep-a"])]);

        let state = aggregator.state();
        assert!(!state.is_loading);
        assert_eq!(state.all_pipelines.len(), 2);
        assert_eq!(state.processes_by_id.len(), 2);
        assert_eq!(state.processes_by_id["p1"].workspace_id, "w1");
        assert_eq!(state.unassigned().unwrap().automation_sources, vec!["dep-b"]);
        assert_eq!(state.processes().count(), 1);
    }

    #[test]
    fn process_message_before_topology_creates_placeholder() {
        let key = ConnectionKey::new("s1", "w1");
        let mut aggregator = Aggregator::new();
        aggregator.on_process_message(&key, vec![process("p1", &[])]);

        let state = aggregator.state();
        let workspace = state.workspace(&key).unwrap();
        assert!(workspace.pipelines.is_empty());
        assert!(!workspace.has_topology());
        assert_eq!(workspace.processes["p1"].name, "P1");
        assert!(!state.is_loading);
    }

    #[test]
    fn latest_topology_supersedes() {
        let key = ConnectionKey::new("s1", "w1");
        let mut aggregator = Aggregator::new();
        aggregator.on_topology_message(&key, topology(&[("a", "dep-a"), ("b", "dep-b")]));
        aggregator.on_topology_message(&key, topology(&[("c", "dep-c")]));

        let keys: Vec<String> = aggregator.state().all_pipelines.into_iter().map(|p| p.key).collect();
        assert_eq!(keys, vec!["c"]);
    }

    #[test]
    fn servers_group_their_workspaces() {
        let mut aggregator = Aggregator::new();
        aggregator.on_topology_message(&ConnectionKey::new("s1", "w1"), topology(&[("a", "dep-a")]));
        aggregator.on_topology_message(&ConnectionKey::new("s1", "w2"), topology(&[("b", "dep-b")]));
        aggregator.on_topology_message(&ConnectionKey::new("s2", "w1"), topology(&[("c", "dep-c")]));

        let state = aggregator.state();
        assert_eq!(state.servers_by_id.len(), 2);
        let s1 = &state.servers_by_id["s1"];
        assert_eq!(s1.workspaces.len(), 2);
        assert_eq!(s1.pipelines.len(), 2);
        assert_eq!(state.all_pipelines.len(), 3);
    }

    #[test]
    fn directory_update_reprojects_names() {
        let key = ConnectionKey::new("s1", "w1");
        let mut aggregator = Aggregator::new();
        aggregator.on_topology_message(&key, topology(&[("a", "dep-a")]));
        assert_eq!(aggregator.state().all_pipelines[0].workspace_name, "w1");

        aggregator.set_directory(vec![AutomationServer {
            automation_server_id: "s1".into(),
            name: "Edge".into(),
            workspaces: vec![Workspace {
                id: "w1".into(),
                name: "Lab".into(),
                editor_url: None,
            }],
        }]);

        let state = aggregator.state();
        assert_eq!(state.all_pipelines[0].workspace_name, "Lab");
        assert_eq!(state.servers_by_id["s1"].name, "Edge");
    }

    #[test]
    fn stats_update_reprojects() {
        let key = ConnectionKey::new("s1", "w1");
        let mut aggregator = Aggregator::new();
        aggregator.on_topology_message(&key, topology(&[("a", "dep-a-123")]));

        aggregator.set_pipeline_stats(vec![PipelineStat {
            deployment_id: "dep-a".into(),
            fields: serde_json::Map::new(),
        }]);
        assert_eq!(aggregator.state().all_pipelines[0].stats.len(), 1);
    }

    #[test]
    fn grace_period_ends_loading_once() {
        let mut aggregator = Aggregator::new();
        assert!(aggregator.loading_grace_elapsed());
        assert!(!aggregator.loading_grace_elapsed());
        assert!(!aggregator.state().is_loading);
    }

    #[test]
    fn clear_keeps_loading_off() {
        let key = ConnectionKey::new("s1", "w1");
        let mut aggregator = Aggregator::new();
        aggregator.on_topology_message(&key, topology(&[("a", "dep-a")]));
        aggregator.clear();

        let state = aggregator.state();
        assert!(state.all_pipelines.is_empty());
        assert!(!state.is_loading);
        assert_eq!(aggregator.workspace_count(), 0);
    }
}
