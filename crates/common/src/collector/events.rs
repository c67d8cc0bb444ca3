//! Progress events streamed to the upload's client

use crate::models::Channel;
use serde::Serialize;

/// One event on a session's progress stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// A well-formed reply was accepted
    Progress {
        id: u64,
        channel: Channel,
        received: u64,
        expected: u64,
    },
    /// Every expected reply arrived and the bundle is ready
    Completed { bundle: String, received: u64 },
    /// No reply within the stall timeout; a partial bundle was written
    Stalled {
        received: u64,
        expected: u64,
        malformed: u64,
        bundle: Option<String>,
    },
    Failed { message: String },
}

impl ProgressEvent {
    /// SSE event name
    pub fn name(&self) -> &'static str {
        match self {
            ProgressEvent::Progress { .. } => "progress",
            ProgressEvent::Completed { .. } => "completed",
            ProgressEvent::Stalled { .. } => "stalled",
            ProgressEvent::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProgressEvent::Progress { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_json() {
        let event = ProgressEvent::Progress {
            id: 2,
            channel: Channel::Author,
            received: 3,
            expected: 4,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "progress");
        assert_eq!(value["channel"], "author");
        assert_eq!(value["id"], 2);
        assert_eq!(event.name(), "progress");
        assert!(!event.is_terminal());
    }

    #[test]
    fn test_terminal_events() {
        let completed = ProgressEvent::Completed {
            bundle: "x.tar.gz".into(),
            received: 4,
        };
        assert!(completed.is_terminal());
        assert_eq!(serde_json::to_value(&completed).unwrap()["event"], "completed");
        assert_eq!(
            ProgressEvent::Failed { message: "boom".into() }.name(),
            "failed"
        );
    }
}
