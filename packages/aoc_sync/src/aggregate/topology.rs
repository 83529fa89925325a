//! Topology side of the aggregate: raw workspace topology in, ordered
//! [`Pipeline`] projections out.

use std::collections::HashMap;

use serde::Serialize;
use tracing::debug;

use super::PipelineStat;
use crate::directory::ServerDirectory;
use crate::protocol::{PipelineTopology, WorkspaceTopology};
use crate::token::ConnectionKey;

const EDITOR_WORKSPACE: &str = "/home/coder/workspace";

/// One pipeline of one workspace, joined with directory metadata and
/// statistics. Rebuilt wholesale on every topology message.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Pipeline {
    /// Key of the entry in the workspace topology.
    pub key: String,
    #[serde(flatten)]
    pub topology: PipelineTopology,
    pub automation_server_id: String,
    pub automation_server_name: String,
    pub workspace_id: String,
    pub workspace_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub editor_link: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stats: Vec<PipelineStat>,
}

impl Pipeline {
    pub fn container_id(&self) -> &str {
        &self.topology.properties.container_id
    }

    pub fn deployment_id(&self) -> Option<&str> {
        self.topology.properties.deployment_id.as_deref()
    }

    /// The id processes use to claim this pipeline in `automation_sources`.
    pub fn source_id(&self) -> &str {
        self.deployment_id().unwrap_or(&self.key)
    }

    pub fn connection_key(&self) -> ConnectionKey {
        ConnectionKey::new(&self.automation_server_id, &self.workspace_id)
    }
}

/// Project a workspace topology into pipelines, ordered by topology key.
/// Entries sharing a container id collapse into one; the later entry wins
/// and keeps the earlier one's position.
pub fn project(
    key: &ConnectionKey,
    topology: &WorkspaceTopology,
    directory: &ServerDirectory,
    stats: &[PipelineStat],
) -> Vec<Pipeline> {
    let server_name = directory.server_name(&key.server_id);
    let workspace_name = directory.workspace_name(&key.server_id, &key.workspace_id);
    let editor_url = directory
        .workspace(&key.server_id, &key.workspace_id)
        .and_then(|w| w.editor_url.as_deref())
        .filter(|url| !url.is_empty());

    let mut pipelines: Vec<Pipeline> = Vec::with_capacity(topology.topology.len());
    let mut by_container: HashMap<String, usize> = HashMap::new();

    for (entry_key, entry) in &topology.topology {
        let pipeline = Pipeline {
            key: entry_key.clone(),
            topology: entry.clone(),
            automation_server_id: key.server_id.clone(),
            automation_server_name: server_name.to_string(),
            workspace_id: key.workspace_id.clone(),
            workspace_name: workspace_name.to_string(),
            editor_link: editor_url.and_then(|url| {
                entry
                    .properties
                    .relative_path
                    .as_deref()
                    .map(|path| editor_link(url, path))
            }),
            stats: matching_stats(entry.properties.deployment_id.as_deref(), stats),
        };

        match by_container.get(pipeline.container_id()) {
            Some(&index) => {
                debug!(
                    workspace = %key,
                    container = %pipeline.container_id(),
                    "duplicate container id in topology, keeping the later entry"
                );
                pipelines[index] = pipeline;
            }
            None => {
                by_container.insert(pipeline.container_id().to_string(), pipelines.len());
                pipelines.push(pipeline);
            }
        }
    }

    pipelines
}

/// Deep link that opens a pipeline's notebook in the workspace editor.
pub fn editor_link(editor_url: &str, relative_path: &str) -> String {
    let path = relative_path.trim_matches('/');
    format!(
        "{editor_url}?folder={EDITOR_WORKSPACE}&payload=[[\"openFile\",\"vscode-remote://{EDITOR_WORKSPACE}/{path}/main.ipynb\"]]"
    )
}

/// Statistics whose deployment id is a prefix of the pipeline's.
fn matching_stats(deployment_id: Option<&str>, stats: &[PipelineStat]) -> Vec<PipelineStat> {
    let Some(deployment_id) = deployment_id else {
        return Vec::new();
    };
    stats
        .iter()
        .filter(|s| !s.deployment_id.is_empty() && deployment_id.starts_with(&s.deployment_id))
        .cloned()
        .collect()
}
