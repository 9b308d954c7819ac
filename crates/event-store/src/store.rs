use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{CommittedEvent, EventFilter, EventMeta, Message, Result};

/// Callback receiving events one at a time from [`Store::query`].
pub type EventSink<'a> = &'a mut (dyn FnMut(CommittedEvent) + Send);

/// A stream eligible for reaction processing, as returned by [`Store::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolledStream {
    /// The reaction stream.
    pub stream: String,

    /// Durable watermark: id of the last event this stream has processed.
    pub at: i64,

    /// Upstream stream whose events feed this one, when correlated from a
    /// specific source. `None` means the whole log is scanned.
    pub source: Option<String>,
}

/// A request to claim a stream for processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRequest {
    pub stream: String,

    /// Holder id of the requesting worker.
    pub by: String,

    /// Watermark the holder intends to advance to.
    pub at: i64,

    /// Source stream recorded for newly inserted streams.
    pub source: Option<String>,
}

/// A granted, time-bounded exclusive claim on a stream.
///
/// `at` starts as the requested watermark and is wound back to the last
/// successfully processed event before acknowledging. `retry` counts claims
/// since the last ack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub stream: String,
    pub by: String,
    pub at: i64,
    pub retry: i32,
    pub block: bool,
    pub error: Option<String>,
}

impl Lease {
    /// Records a handler failure on this lease.
    pub fn fail(&mut self, error: impl Into<String>, block: bool) {
        self.error = Some(error.into());
        self.block = block;
    }
}

/// Append-only event persistence with optimistic concurrency, plus the
/// stream-lease bookkeeping that backs reaction distribution.
///
/// All implementations must be thread-safe; cross-process coordination
/// happens entirely through `lease`'s compare-and-swap semantics and
/// `commit`'s version check.
#[async_trait]
pub trait Store: Send + Sync {
    /// Appends messages to a stream atomically, assigning sequential
    /// versions. Fails with [`StoreError::Concurrency`] when
    /// `expected_version` is given and does not equal the stream's current
    /// highest version (-1 for an empty stream).
    ///
    /// [`StoreError::Concurrency`]: crate::StoreError::Concurrency
    async fn commit(
        &self,
        stream: &str,
        messages: &[Message],
        meta: EventMeta,
        expected_version: Option<i64>,
    ) -> Result<Vec<CommittedEvent>>;

    /// Streams matching events to `sink` in ascending id order (descending
    /// when the filter says `backward`). Returns the number delivered.
    async fn query(&self, filter: &EventFilter, sink: EventSink<'_>) -> Result<usize>;

    /// Creates the underlying schema. Idempotent.
    async fn seed(&self) -> Result<()>;

    /// Destroys the underlying schema and all data.
    async fn drop_store(&self) -> Result<()>;

    /// Returns up to `lagging` unblocked, unleased streams ordered by
    /// ascending watermark and up to `leading` ordered by descending
    /// watermark. Scanning both ends keeps old backlogged streams from
    /// starving newly active ones.
    async fn poll(&self, lagging: usize, leading: usize) -> Result<Vec<PolledStream>>;

    /// Atomically claims streams: inserts unseen streams, then claims only
    /// those whose lease is absent or expired. Returns the subset actually
    /// claimed; concurrent callers never both win a stream. The retry
    /// counter is incremented only when `ttl_ms` is positive (a zero ttl
    /// tags a stream without reserving processing time).
    async fn lease(&self, requests: &[LeaseRequest], ttl_ms: i64) -> Result<Vec<Lease>>;

    /// Advances each claimed stream's durable watermark to its lease's `at`,
    /// clears the lease, and resets the retry counter. Ignores leases whose
    /// holder no longer owns the stream.
    async fn ack(&self, leases: &[Lease]) -> Result<Vec<Lease>>;

    /// Marks streams blocked with their recorded error, but only for leases
    /// whose holder still owns the stream: a late or expired holder cannot
    /// block a stream another worker has already resumed.
    async fn block(&self, leases: &[Lease]) -> Result<Vec<Lease>>;
}

/// Extension trait providing convenience methods for stores.
#[async_trait]
pub trait StoreExt: Store {
    /// Collects a filtered query into a vector.
    async fn fetch(&self, filter: &EventFilter) -> Result<Vec<CommittedEvent>> {
        let mut events = Vec::new();
        self.query(filter, &mut |event| events.push(event)).await?;
        Ok(events)
    }

    /// Returns the current highest version of a stream, or `None` when the
    /// stream has no events.
    async fn last_version(&self, stream: &str) -> Result<Option<i64>> {
        let filter = EventFilter::for_stream(stream)
            .backward()
            .limit(1)
            .with_snaps(true);
        Ok(self.fetch(&filter).await?.first().map(|event| event.version))
    }
}

impl<T: Store + ?Sized> StoreExt for T {}
