//! Topic layout of a workspace broker.
//!
//! Every connection is scoped to one workspace by its credential, so topics
//! are relative to that workspace and carry no workspace id themselves.

use crate::error::SyncError;

/// Publishing here asks the workspace to push its topology.
pub const TOPOLOGY_SUBSCRIBE: &str = "/topology/subscribe";
/// Topology snapshots.
pub const TOPOLOGY: &str = "/topology";
/// Process list snapshots.
pub const PROCESS_LIST: &str = "/processes/list";

pub fn process_request(process_id: &str) -> String {
    format!("/processes/c/{process_id}/gitops-req")
}

pub fn process_contents(process_id: &str) -> String {
    format!("/processes/c/{process_id}/contents")
}

pub fn attachment_request(process_id: &str, file_name: &str) -> String {
    format!("/processes/c/{process_id}/attachments/c/{file_name}/gitops-req")
}

pub fn attachment_contents(process_id: &str, file_name: &str) -> String {
    format!("/processes/c/{process_id}/attachments/c/{file_name}/contents")
}

pub fn process_create(process_id: &str) -> String {
    format!("/processes/c/{process_id}/create")
}

pub fn process_set(process_id: &str) -> String {
    format!("/processes/c/{process_id}/set")
}

/// Rejects names that would change the topic's shape: level separators,
/// MQTT wildcards, and empty segments.
pub fn validate_segment(segment: &str) -> Result<(), SyncError> {
    if segment.is_empty() || segment.contains(['/', '+', '#', '\0']) {
        return Err(SyncError::InvalidSegment(segment.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_topics_pair_up() {
        assert_eq!(process_request("p1"), "/processes/c/p1/gitops-req");
        assert_eq!(process_contents("p1"), "/processes/c/p1/contents");
    }

    #[test]
    fn attachment_topics_pair_up() {
        assert_eq!(
            attachment_request("p1", "manual.pdf"),
            "/processes/c/p1/attachments/c/manual.pdf/gitops-req"
        );
        assert_eq!(
            attachment_contents("p1", "manual.pdf"),
            "/processes/c/p1/attachments/c/manual.pdf/contents"
        );
    }

    #[test]
    fn segment_validation() {
        assert!(validate_segment("report-2024.csv").is_ok());
        assert!(validate_segment("").is_err());
        assert!(validate_segment("a/b").is_err());
        assert!(validate_segment("+").is_err());
        assert!(validate_segment("#").is_err());
    }
}
