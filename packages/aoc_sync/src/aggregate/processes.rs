//! Process side of the aggregate.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use super::WorkspaceSnapshot;
use super::topology::Pipeline;
use crate::protocol::ProcessRecord;
use crate::token::ConnectionKey;

/// Id of the pseudo-process that collects pipelines no process claims.
pub const UNASSIGNED_PROCESS_ID: &str = "__other__";
pub const UNASSIGNED_PROCESS_NAME: &str = "Other";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    pub id: String,
    pub name: String,
    pub automation_server_id: String,
    pub workspace_id: String,
    pub automation_sources: Vec<String>,
    pub attachments: Vec<String>,
}

impl Process {
    /// Stamp a wire record with the workspace it arrived from.
    pub fn from_record(key: &ConnectionKey, record: ProcessRecord) -> Self {
        Self {
            id: record.id,
            name: record.name,
            automation_server_id: key.server_id.clone(),
            workspace_id: key.workspace_id.clone(),
            automation_sources: record.automation_sources,
            attachments: record.attachments,
        }
    }

    pub fn connection_key(&self) -> ConnectionKey {
        ConnectionKey::new(&self.automation_server_id, &self.workspace_id)
    }

    pub fn is_unassigned(&self) -> bool {
        self.id == UNASSIGNED_PROCESS_ID
    }
}

/// Replace a workspace's processes with the contents of one snapshot.
/// Within a snapshot a repeated id keeps the later record.
pub fn replace_processes(snapshot: &mut WorkspaceSnapshot, records: Vec<ProcessRecord>) {
    let key = snapshot.key();
    snapshot.processes = records
        .into_iter()
        .map(|record| {
            let process = Process::from_record(&key, record);
            (process.id.clone(), process)
        })
        .collect();
}

/// Union of every workspace's processes. Snapshots are visited in key
/// order, so when two workspaces publish the same id the later key wins.
pub fn merge_processes<'a>(
    snapshots: impl IntoIterator<Item = &'a WorkspaceSnapshot>,
) -> BTreeMap<String, Process> {
    let mut merged = BTreeMap::new();
    for snapshot in snapshots {
        for (id, process) in &snapshot.processes {
            merged.insert(id.clone(), process.clone());
        }
    }
    merged
}

/// Ids in `snapshot` that some other workspace also publishes.
pub fn colliding_ids<'a>(
    key: &ConnectionKey,
    snapshot: &WorkspaceSnapshot,
    others: impl IntoIterator<Item = &'a WorkspaceSnapshot>,
) -> Vec<String> {
    let mut collisions = Vec::new();
    for other in others {
        if other.key() == *key {
            continue;
        }
        collisions.extend(
            snapshot
                .processes
                .keys()
                .filter(|id| other.processes.contains_key(*id))
                .cloned(),
        );
    }
    collisions.sort();
    collisions.dedup();
    collisions
}

/// The pseudo-process holding every pipeline no real process lists in its
/// sources, or `None` when every pipeline is claimed. It takes its server
/// and workspace from the first unclaimed pipeline. Each source id is listed
/// once, even when several workspaces run the same deployment.
pub fn unassigned_process<'a>(
    pipelines: &[Pipeline],
    processes: impl IntoIterator<Item = &'a Process>,
) -> Option<Process> {
    let claimed: HashSet<&str> = processes
        .into_iter()
        .filter(|p| !p.is_unassigned())
        .flat_map(|p| p.automation_sources.iter().map(String::as_str))
        .collect();

    let orphans: Vec<&Pipeline> = pipelines
        .iter()
        .filter(|p| !claimed.contains(p.source_id()))
        .collect();
    let first = orphans.first()?;

    let mut seen = HashSet::new();
    let automation_sources = orphans
        .iter()
        .map(|p| p.source_id())
        .filter(|id| seen.insert(*id))
        .map(str::to_string)
        .collect();

    Some(Process {
        id: UNASSIGNED_PROCESS_ID.to_string(),
        name: UNASSIGNED_PROCESS_NAME.to_string(),
        automation_server_id: first.automation_server_id.clone(),
        workspace_id: first.workspace_id.clone(),
        automation_sources,
        attachments: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::ServerDirectory;
    use crate::protocol::WorkspaceTopology;

    fn record(id: &str, sources: &[&str]) -> ProcessRecord {
        ProcessRecord {
            id: id.into(),
            name: format!("process {id}"),
            automation_sources: sources.iter().map(|s| s.to_string()).collect(),
            attachments: Vec::new(),
        }
    }

    fn pipelines(key: &ConnectionKey, deployments: &[&str]) -> Vec<Pipeline> {
        let entries: serde_json::Map<String, serde_json::Value> = deployments
            .iter()
            .map(|d| {
                (
                    d.to_string(),
                    serde_json::json!({"properties": {"container-id": format!("c-{d}"), "deployment-id": d}}),
                )
            })
            .collect();
        let raw: WorkspaceTopology =
            serde_json::from_value(serde_json::json!({ "topology": entries })).unwrap();
        crate::aggregate::topology::project(key, &raw, &ServerDirectory::default(), &[])
    }

    #[test]
    fn records_are_stamped_with_their_workspace() {
        let key = ConnectionKey::new("srv", "ws");
        let mut snapshot = WorkspaceSnapshot::new(&key);
        replace_processes(&mut snapshot, vec![record("p1", &["dep-a"])]);

        let process = &snapshot.processes["p1"];
        assert_eq!(process.automation_server_id, "srv");
        assert_eq!(process.workspace_id, "ws");
        assert_eq!(process.connection_key(), key);
    }

    #[test]
    fn snapshot_replaces_previous_processes() {
        let key = ConnectionKey::new("srv", "ws");
        let mut snapshot = WorkspaceSnapshot::new(&key);
        replace_processes(&mut snapshot, vec![record("p1", &[]), record("p2", &[])]);
        replace_processes(&mut snapshot, vec![record("p3", &[])]);

        assert_eq!(snapshot.processes.keys().collect::<Vec<_>>(), vec!["p3"]);
    }

    #[test]
    fn unassigned_collects_unclaimed_pipelines() {
        let key = ConnectionKey::new("srv", "ws");
        let all = pipelines(&key, &["dep-a", "dep-b", "dep-c"]);
        let claimed = Process::from_record(&key, record("p1", &["dep-b"]));

        let other = unassigned_process(&all, [&claimed]).unwrap();
        assert_eq!(other.id, UNASSIGNED_PROCESS_ID);
        assert_eq!(other.name, "Other");
        assert_eq!(other.automation_sources, vec!["dep-a", "dep-c"]);
        assert_eq!(other.connection_key(), key);
        assert!(other.attachments.is_empty());
    }

    #[test]
    fn no_unassigned_when_everything_is_claimed() {
        let key = ConnectionKey::new("srv", "ws");
        let all = pipelines(&key, &["dep-a"]);
        let claimed = Process::from_record(&key, record("p1", &["dep-a"]));

        assert_eq!(unassigned_process(&all, [&claimed]), None);
        assert_eq!(unassigned_process(&[], Vec::<&Process>::new()), None);
    }

    #[test]
    fn unassigned_takes_first_orphan_location() {
        let first = ConnectionKey::new("s1", "w1");
        let second = ConnectionKey::new("s2", "w9");
        let mut all = pipelines(&first, &["dep-a"]);
        all.extend(pipelines(&second, &["dep-z"]));

        let other = unassigned_process(&all, Vec::<&Process>::new()).unwrap();
        assert_eq!(other.connection_key(), first);
        assert_eq!(other.automation_sources, vec!["dep-a", "dep-z"]);
    }

    #[test]
    fn shared_deployment_is_unassigned_once() {
        let first = ConnectionKey::new("s1", "w1");
        let second = ConnectionKey::new("s2", "w2");
        let mut all = pipelines(&first, &["dep-a", "dep-shared"]);
        all.extend(pipelines(&second, &["dep-shared"]));

        let other = unassigned_process(&all, Vec::<&Process>::new()).unwrap();
        assert_eq!(other.automation_sources, vec!["dep-a", "dep-shared"]);
    }

    #[test]
    fn collisions_are_reported_and_later_key_wins() {
        let a = ConnectionKey::new("s", "a");
        let b = ConnectionKey::new("s", "b");
        let mut snap_a = WorkspaceSnapshot::new(&a);
        let mut snap_b = WorkspaceSnapshot::new(&b);
        replace_processes(&mut snap_a, vec![record("shared", &[]), record("only-a", &[])]);
        replace_processes(&mut snap_b, vec![record("shared", &[])]);

        assert_eq!(colliding_ids(&a, &snap_a, [&snap_a, &snap_b]), vec!["shared"]);

        let merged = merge_processes([&snap_a, &snap_b]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged["shared"].workspace_id, "b");
    }
}
