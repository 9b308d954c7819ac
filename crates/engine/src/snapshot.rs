use event_store::CommittedEvent;
use serde::{Deserialize, Serialize};

/// A folded projection of a stream at a point in time.
///
/// `state` is the projection as of `event`; `patches` counts patch
/// applications since the last snapshot marker; `snaps` counts snapshot
/// markers encountered during the fold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// The folded state.
    pub state: serde_json::Value,

    /// The last event folded into `state`, if any.
    pub event: Option<CommittedEvent>,

    /// Patch applications since the last snapshot marker.
    pub patches: u64,

    /// Snapshot markers encountered.
    pub snaps: u64,
}

impl Snapshot {
    /// Creates a fresh snapshot over an initial state.
    pub fn new(state: serde_json::Value) -> Self {
        Self {
            state,
            event: None,
            patches: 0,
            snaps: 0,
        }
    }

    /// The stream version of the last folded event, if any.
    pub fn version(&self) -> Option<i64> {
        self.event.as_ref().map(|event| event.version)
    }

    /// Deserializes the state into a concrete type.
    pub fn state_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.state.clone())
    }

    /// Consumes the snapshot and deserializes the state.
    pub fn into_state<T: for<'de> Deserialize<'de>>(self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Counter {
        total: i64,
    }

    #[test]
    fn new_snapshot_has_no_event() {
        let snapshot = Snapshot::new(serde_json::json!({"total": 0}));
        assert!(snapshot.event.is_none());
        assert_eq!(snapshot.version(), None);
        assert_eq!(snapshot.patches, 0);
        assert_eq!(snapshot.snaps, 0);
    }

    #[test]
    fn state_roundtrips_through_typed_views() {
        let snapshot = Snapshot::new(serde_json::json!({"total": 4}));
        let typed: Counter = snapshot.state_as().unwrap();
        assert_eq!(typed, Counter { total: 4 });

        let consumed: Counter = snapshot.into_state().unwrap();
        assert_eq!(consumed, Counter { total: 4 });
    }
}
