use chrono::{DateTime, Utc};
use common::Target;
use serde::{Deserialize, Serialize};

/// Reserved name for snapshot-marker events.
///
/// A snapshot marker carries a full state value in its `data` field and lets
/// replay fast-forward past everything before it. Queries exclude markers
/// unless explicitly asked for them.
pub const SNAP_EVENT: &str = "__snapshot__";

/// Channel on which commit wake-up notices are published, named after the
/// events table.
pub const COMMIT_CHANNEL: &str = "events";

/// An uncommitted event: a name and a payload, before the store has assigned
/// an id, version, or timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub name: String,
    pub data: serde_json::Value,
}

impl Message {
    /// Creates a message from a name and raw JSON payload.
    pub fn new(name: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    /// Creates a message from a serializable payload.
    pub fn from_payload<T: Serialize>(
        name: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            name: name.into(),
            data: serde_json::to_value(payload)?,
        })
    }
}

/// The action that caused an event to be committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionCause {
    pub name: String,
    pub target: Target,
}

/// The upstream event a reaction was responding to when it committed an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventCause {
    pub id: i64,
    pub name: String,
    pub stream: String,
}

impl From<&CommittedEvent> for EventCause {
    fn from(event: &CommittedEvent) -> Self {
        Self {
            id: event.id,
            name: event.name.clone(),
            stream: event.stream.clone(),
        }
    }
}

/// Why an event exists: the originating action and, for reactions, the
/// upstream event that triggered it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Causation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<ActionCause>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<EventCause>,
}

/// Metadata attached to every committed event.
///
/// `correlation` groups all events causally descending from one originating
/// command; `causation` records the immediate cause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMeta {
    pub correlation: String,

    #[serde(default)]
    pub causation: Causation,
}

impl EventMeta {
    /// Creates metadata with the given correlation id and no causation.
    pub fn new(correlation: impl Into<String>) -> Self {
        Self {
            correlation: correlation.into(),
            causation: Causation::default(),
        }
    }

    /// Records the action that produced the commit.
    pub fn caused_by_action(mut self, name: impl Into<String>, target: Target) -> Self {
        self.causation.action = Some(ActionCause {
            name: name.into(),
            target,
        });
        self
    }

    /// Records the upstream event a reaction was responding to.
    pub fn caused_by_event(mut self, event: &CommittedEvent) -> Self {
        self.causation.event = Some(EventCause::from(event));
        self
    }
}

/// An event as persisted: immutable once committed.
///
/// `id` is store-assigned and totally ordered across all streams; `version`
/// is the per-stream sequence starting at 0, gapless and strictly increasing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedEvent {
    pub id: i64,
    pub stream: String,
    pub version: i64,
    pub name: String,
    pub data: serde_json::Value,
    pub created: DateTime<Utc>,
    pub meta: EventMeta,
}

impl CommittedEvent {
    /// Whether this event is a snapshot marker.
    pub fn is_snapshot(&self) -> bool {
        self.name == SNAP_EVENT
    }

    /// Deserializes the payload into a concrete type.
    pub fn payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }
}

/// Advisory wake-up notice published when a commit lands.
///
/// Carries the name and store id of the first event in the commit. Consumers
/// must not rely on delivery; the drain loop is correct on polling alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitNotice {
    pub operation: String,
    pub name: String,
    pub id: i64,
}

impl CommitNotice {
    pub(crate) fn insert(first: &CommittedEvent) -> Self {
        Self {
            operation: "INSERT".to_string(),
            name: first.name.clone(),
            id: first.id,
        }
    }
}
