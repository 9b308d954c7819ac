use chrono::{DateTime, Utc};

/// Builder for event queries.
///
/// All criteria are conjunctive. Id bounds are exclusive; creation-time
/// bounds are inclusive. Results arrive in ascending id order unless
/// `backward` is set. Snapshot-marker events are excluded unless
/// `with_snaps` is set.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Exact stream match.
    pub stream: Option<String>,

    /// Any of these event names.
    pub names: Option<Vec<String>>,

    /// Only events with id strictly below this.
    pub before: Option<i64>,

    /// Only events with id strictly above this.
    pub after: Option<i64>,

    /// Maximum number of events to deliver.
    pub limit: Option<usize>,

    /// Only events created at or before this instant.
    pub created_before: Option<DateTime<Utc>>,

    /// Only events created at or after this instant.
    pub created_after: Option<DateTime<Utc>>,

    /// Deliver in descending id order.
    pub backward: bool,

    /// Exact correlation-id match.
    pub correlation: Option<String>,

    /// Include snapshot-marker events.
    pub with_snaps: bool,
}

impl EventFilter {
    /// Creates an empty filter matching every non-snapshot event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a filter for a single stream.
    pub fn for_stream(stream: impl Into<String>) -> Self {
        Self {
            stream: Some(stream.into()),
            ..Default::default()
        }
    }

    /// Filters by exact stream name.
    pub fn stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = Some(stream.into());
        self
    }

    /// Filters by a single event name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.names = Some(vec![name.into()]);
        self
    }

    /// Filters by multiple event names (any of these).
    pub fn names(mut self, names: Vec<String>) -> Self {
        self.names = Some(names);
        self
    }

    /// Only events with id strictly below the given id.
    pub fn before(mut self, id: i64) -> Self {
        self.before = Some(id);
        self
    }

    /// Only events with id strictly above the given id.
    pub fn after(mut self, id: i64) -> Self {
        self.after = Some(id);
        self
    }

    /// Limits the number of events delivered.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Only events created at or before the given instant.
    pub fn created_before(mut self, instant: DateTime<Utc>) -> Self {
        self.created_before = Some(instant);
        self
    }

    /// Only events created at or after the given instant.
    pub fn created_after(mut self, instant: DateTime<Utc>) -> Self {
        self.created_after = Some(instant);
        self
    }

    /// Delivers events in descending id order.
    pub fn backward(mut self) -> Self {
        self.backward = true;
        self
    }

    /// Filters by correlation id.
    pub fn correlation(mut self, correlation: impl Into<String>) -> Self {
        self.correlation = Some(correlation.into());
        self
    }

    /// Includes snapshot-marker events in the results.
    pub fn with_snaps(mut self, with_snaps: bool) -> Self {
        self.with_snaps = with_snaps;
        self
    }
}
