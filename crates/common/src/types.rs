use serde::{Deserialize, Serialize};

/// Identifies where a command applies and under what concurrency precondition.
///
/// A target names the stream a command is executed against, the party acting,
/// and optionally the stream version the caller last observed. When
/// `expected_version` is set, the commit fails unless the stream is still at
/// exactly that version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// The stream the command applies to.
    pub stream: String,

    /// The acting party, as recorded in event causation metadata and passed
    /// to invariant checks.
    pub actor: String,

    /// Optimistic-concurrency precondition. `None` skips the version check.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<i64>,
}

impl Target {
    /// Creates a target with no version precondition.
    pub fn new(stream: impl Into<String>, actor: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            actor: actor.into(),
            expected_version: None,
        }
    }

    /// Sets the expected stream version for optimistic concurrency.
    pub fn expect_version(mut self, version: i64) -> Self {
        self.expected_version = Some(version);
        self
    }

    /// Expects the stream to have no events yet.
    pub fn expect_new(self) -> Self {
        self.expect_version(-1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_new_has_no_precondition() {
        let target = Target::new("ticket-1", "alice");
        assert_eq!(target.stream, "ticket-1");
        assert_eq!(target.actor, "alice");
        assert!(target.expected_version.is_none());
    }

    #[test]
    fn target_expect_version() {
        let target = Target::new("ticket-1", "alice").expect_version(4);
        assert_eq!(target.expected_version, Some(4));
    }

    #[test]
    fn target_expect_new_means_empty_stream() {
        let target = Target::new("ticket-1", "alice").expect_new();
        assert_eq!(target.expected_version, Some(-1));
    }

    #[test]
    fn target_serialization_omits_missing_version() {
        let target = Target::new("ticket-1", "alice");
        let json = serde_json::to_value(&target).unwrap();
        assert!(json.get("expected_version").is_none());

        let with_version = target.expect_version(2);
        let json = serde_json::to_value(&with_version).unwrap();
        assert_eq!(json["expected_version"], 2);
    }
}
