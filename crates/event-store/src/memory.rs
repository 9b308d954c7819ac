use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tokio::sync::broadcast;

use crate::{
    CommitNotice, CommittedEvent, EventFilter, EventMeta, Message, Result, SNAP_EVENT, StoreError,
    store::{EventSink, Lease, LeaseRequest, PolledStream, Store},
};

/// Per-stream watermark and lease state.
#[derive(Debug, Clone)]
struct StreamRow {
    source: Option<String>,
    at: i64,
    retry: i32,
    blocked: bool,
    error: Option<String>,
    leased_at: Option<i64>,
    leased_by: Option<String>,
    leased_until: Option<DateTime<Utc>>,
}

impl StreamRow {
    fn new(source: Option<String>) -> Self {
        Self {
            source,
            at: -1,
            retry: 0,
            blocked: false,
            error: None,
            leased_at: None,
            leased_by: None,
            leased_until: None,
        }
    }

    fn claimable(&self, now: DateTime<Utc>) -> bool {
        !self.blocked && self.leased_until.is_none_or(|until| until <= now)
    }

    fn clear_lease(&mut self) {
        self.leased_at = None;
        self.leased_by = None;
        self.leased_until = None;
    }
}

#[derive(Default)]
struct Inner {
    events: Vec<CommittedEvent>,
    streams: HashMap<String, StreamRow>,
    next_id: i64,
}

/// In-memory reference store for tests and single-process use.
///
/// Provides the same contract as the PostgreSQL implementation, including
/// lease bookkeeping, with exact stream matching. Commit notices are
/// published on a broadcast channel instead of a database channel.
#[derive(Clone)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
    notices: broadcast::Sender<CommitNotice>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        let (notices, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            notices,
        }
    }

    /// Subscribes to commit wake-up notices.
    pub fn subscribe(&self) -> broadcast::Receiver<CommitNotice> {
        self.notices.subscribe()
    }

    /// Returns the total number of events stored.
    pub async fn event_count(&self) -> usize {
        self.inner.read().await.events.len()
    }

    /// Clears all events and stream state.
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.events.clear();
        inner.streams.clear();
        inner.next_id = 0;
    }

    /// Lifts a blocked stream so it can be leased again (ops escape hatch).
    pub async fn unblock(&self, stream: &str) {
        let mut inner = self.inner.write().await;
        if let Some(row) = inner.streams.get_mut(stream) {
            row.blocked = false;
            row.error = None;
            row.retry = 0;
        }
    }

    fn matches(filter: &EventFilter, event: &CommittedEvent) -> bool {
        if !filter.with_snaps && event.name == SNAP_EVENT {
            return false;
        }
        if let Some(stream) = &filter.stream
            && &event.stream != stream
        {
            return false;
        }
        if let Some(names) = &filter.names
            && !names.contains(&event.name)
        {
            return false;
        }
        if let Some(before) = filter.before
            && event.id >= before
        {
            return false;
        }
        if let Some(after) = filter.after
            && event.id <= after
        {
            return false;
        }
        if let Some(created_before) = filter.created_before
            && event.created > created_before
        {
            return false;
        }
        if let Some(created_after) = filter.created_after
            && event.created < created_after
        {
            return false;
        }
        if let Some(correlation) = &filter.correlation
            && &event.meta.correlation != correlation
        {
            return false;
        }
        true
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn commit(
        &self,
        stream: &str,
        messages: &[Message],
        meta: EventMeta,
        expected_version: Option<i64>,
    ) -> Result<Vec<CommittedEvent>> {
        if messages.is_empty() {
            return Err(StoreError::InvalidCommit("no messages".to_string()));
        }

        let mut inner = self.inner.write().await;
        let current = inner
            .events
            .iter()
            .filter(|event| event.stream == stream)
            .map(|event| event.version)
            .max()
            .unwrap_or(-1);

        if let Some(expected) = expected_version
            && expected != current
        {
            return Err(StoreError::Concurrency {
                stream: stream.to_string(),
                expected,
                actual: current,
            });
        }

        let created = Utc::now();
        let mut committed = Vec::with_capacity(messages.len());
        for (offset, message) in messages.iter().enumerate() {
            inner.next_id += 1;
            committed.push(CommittedEvent {
                id: inner.next_id,
                stream: stream.to_string(),
                version: current + 1 + offset as i64,
                name: message.name.clone(),
                data: message.data.clone(),
                created,
                meta: meta.clone(),
            });
        }
        inner.events.extend(committed.iter().cloned());

        // Advisory only; nobody listening is fine.
        let _ = self.notices.send(CommitNotice::insert(&committed[0]));

        Ok(committed)
    }

    async fn query(&self, filter: &EventFilter, sink: EventSink<'_>) -> Result<usize> {
        let inner = self.inner.read().await;
        let mut matched: Vec<&CommittedEvent> = inner
            .events
            .iter()
            .filter(|event| Self::matches(filter, event))
            .collect();

        // Events are appended in id order; only a backward scan reorders.
        if filter.backward {
            matched.reverse();
        }
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }

        let count = matched.len();
        for event in matched {
            sink(event.clone());
        }
        Ok(count)
    }

    async fn seed(&self) -> Result<()> {
        Ok(())
    }

    async fn drop_store(&self) -> Result<()> {
        self.clear().await;
        Ok(())
    }

    async fn poll(&self, lagging: usize, leading: usize) -> Result<Vec<PolledStream>> {
        let inner = self.inner.read().await;
        let now = Utc::now();
        let mut candidates: Vec<(&String, &StreamRow)> = inner
            .streams
            .iter()
            .filter(|(_, row)| row.claimable(now))
            .collect();
        candidates.sort_by(|a, b| a.1.at.cmp(&b.1.at).then_with(|| a.0.cmp(b.0)));

        let mut polled: Vec<PolledStream> = Vec::new();
        let mut push = |stream: &String, row: &StreamRow| {
            if !polled.iter().any(|p| &p.stream == stream) {
                polled.push(PolledStream {
                    stream: stream.clone(),
                    at: row.at,
                    source: row.source.clone(),
                });
            }
        };
        for (stream, row) in candidates.iter().take(lagging).copied() {
            push(stream, row);
        }
        for (stream, row) in candidates.iter().rev().take(leading).copied() {
            push(stream, row);
        }
        Ok(polled)
    }

    async fn lease(&self, requests: &[LeaseRequest], ttl_ms: i64) -> Result<Vec<Lease>> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let mut granted = Vec::new();

        for request in requests {
            let row = inner
                .streams
                .entry(request.stream.clone())
                .or_insert_with(|| StreamRow::new(request.source.clone()));

            if !row.claimable(now) {
                continue;
            }
            if row.source.is_none() {
                row.source = request.source.clone();
            }
            row.leased_by = Some(request.by.clone());
            row.leased_at = Some(request.at);
            row.leased_until = Some(now + Duration::milliseconds(ttl_ms));
            if ttl_ms > 0 {
                row.retry += 1;
            }
            granted.push(Lease {
                stream: request.stream.clone(),
                by: request.by.clone(),
                at: request.at,
                retry: row.retry,
                block: false,
                error: None,
            });
        }
        Ok(granted)
    }

    async fn ack(&self, leases: &[Lease]) -> Result<Vec<Lease>> {
        let mut inner = self.inner.write().await;
        let mut acked = Vec::new();
        for lease in leases {
            if let Some(row) = inner.streams.get_mut(&lease.stream)
                && row.leased_by.as_deref() == Some(lease.by.as_str())
            {
                row.at = lease.at;
                row.retry = 0;
                row.error = None;
                row.clear_lease();
                acked.push(lease.clone());
            }
        }
        Ok(acked)
    }

    async fn block(&self, leases: &[Lease]) -> Result<Vec<Lease>> {
        let mut inner = self.inner.write().await;
        let mut blocked = Vec::new();
        for lease in leases {
            if let Some(row) = inner.streams.get_mut(&lease.stream)
                && row.leased_by.as_deref() == Some(lease.by.as_str())
            {
                row.blocked = true;
                row.error = lease.error.clone();
                row.at = lease.at;
                row.clear_lease();
                blocked.push(lease.clone());
            }
        }
        Ok(blocked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreExt;

    fn message(name: &str) -> Message {
        Message::new(name, serde_json::json!({"ok": true}))
    }

    fn meta() -> EventMeta {
        EventMeta::new("corr-1")
    }

    fn request(stream: &str, by: &str, at: i64) -> LeaseRequest {
        LeaseRequest {
            stream: stream.to_string(),
            by: by.to_string(),
            at,
            source: None,
        }
    }

    #[tokio::test]
    async fn commit_assigns_gapless_versions_from_zero() {
        let store = InMemoryStore::new();

        store
            .commit("ticket-1", &[message("A"), message("B")], meta(), None)
            .await
            .unwrap();
        let committed = store
            .commit("ticket-1", &[message("C")], meta(), None)
            .await
            .unwrap();
        assert_eq!(committed[0].version, 2);

        let events = store
            .fetch(&EventFilter::for_stream("ticket-1"))
            .await
            .unwrap();
        let versions: Vec<i64> = events.iter().map(|event| event.version).collect();
        assert_eq!(versions, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn commit_ids_are_monotonic_across_streams() {
        let store = InMemoryStore::new();
        let a = store
            .commit("ticket-1", &[message("A")], meta(), None)
            .await
            .unwrap();
        let b = store
            .commit("ticket-2", &[message("B")], meta(), None)
            .await
            .unwrap();
        assert!(b[0].id > a[0].id);
    }

    #[tokio::test]
    async fn commit_with_stale_expected_version_fails_without_writes() {
        let store = InMemoryStore::new();
        store
            .commit("ticket-1", &[message("A")], meta(), Some(-1))
            .await
            .unwrap();

        let result = store
            .commit("ticket-1", &[message("B")], meta(), Some(-1))
            .await;
        assert!(matches!(result, Err(StoreError::Concurrency { .. })));
        assert_eq!(store.event_count().await, 1);
    }

    #[tokio::test]
    async fn commit_rejects_empty_message_list() {
        let store = InMemoryStore::new();
        let result = store.commit("ticket-1", &[], meta(), None).await;
        assert!(matches!(result, Err(StoreError::InvalidCommit(_))));
    }

    #[tokio::test]
    async fn commit_publishes_wakeup_notice() {
        let store = InMemoryStore::new();
        let mut notices = store.subscribe();

        store
            .commit("ticket-1", &[message("TicketOpened")], meta(), None)
            .await
            .unwrap();

        let notice = notices.recv().await.unwrap();
        assert_eq!(notice.operation, "INSERT");
        assert_eq!(notice.name, "TicketOpened");
        assert_eq!(notice.id, 1);
    }

    #[tokio::test]
    async fn query_filters_by_name_and_id_range() {
        let store = InMemoryStore::new();
        store
            .commit(
                "ticket-1",
                &[message("A"), message("B"), message("A")],
                meta(),
                None,
            )
            .await
            .unwrap();

        let only_a = store
            .fetch(&EventFilter::new().name("A"))
            .await
            .unwrap();
        assert_eq!(only_a.len(), 2);

        let after_first = store
            .fetch(&EventFilter::for_stream("ticket-1").after(1))
            .await
            .unwrap();
        assert_eq!(after_first.len(), 2);
        assert_eq!(after_first[0].id, 2);

        let before_last = store
            .fetch(&EventFilter::for_stream("ticket-1").before(3))
            .await
            .unwrap();
        assert_eq!(before_last.len(), 2);
    }

    #[tokio::test]
    async fn query_backward_with_limit_returns_latest() {
        let store = InMemoryStore::new();
        store
            .commit(
                "ticket-1",
                &[message("A"), message("B"), message("C")],
                meta(),
                None,
            )
            .await
            .unwrap();

        let latest = store
            .fetch(&EventFilter::for_stream("ticket-1").backward().limit(1))
            .await
            .unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].name, "C");
    }

    #[tokio::test]
    async fn query_by_correlation() {
        let store = InMemoryStore::new();
        store
            .commit("ticket-1", &[message("A")], EventMeta::new("corr-a"), None)
            .await
            .unwrap();
        store
            .commit("ticket-2", &[message("B")], EventMeta::new("corr-b"), None)
            .await
            .unwrap();

        let matched = store
            .fetch(&EventFilter::new().correlation("corr-b"))
            .await
            .unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].stream, "ticket-2");
    }

    #[tokio::test]
    async fn query_excludes_snapshots_unless_asked() {
        let store = InMemoryStore::new();
        store
            .commit("ticket-1", &[message("A")], meta(), None)
            .await
            .unwrap();
        store
            .commit(
                "ticket-1",
                &[Message::new(SNAP_EVENT, serde_json::json!({"total": 3}))],
                meta(),
                None,
            )
            .await
            .unwrap();

        let plain = store
            .fetch(&EventFilter::for_stream("ticket-1"))
            .await
            .unwrap();
        assert_eq!(plain.len(), 1);

        let all = store
            .fetch(&EventFilter::for_stream("ticket-1").with_snaps(true))
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn query_stream_match_is_exact() {
        let store = InMemoryStore::new();
        store
            .commit("ticket-1", &[message("A")], meta(), None)
            .await
            .unwrap();
        store
            .commit("ticket-10", &[message("B")], meta(), None)
            .await
            .unwrap();

        let matched = store
            .fetch(&EventFilter::for_stream("ticket-1"))
            .await
            .unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].stream, "ticket-1");
    }

    #[tokio::test]
    async fn last_version_tracks_stream_head() {
        let store = InMemoryStore::new();
        assert_eq!(store.last_version("ticket-1").await.unwrap(), None);

        store
            .commit("ticket-1", &[message("A"), message("B")], meta(), None)
            .await
            .unwrap();
        assert_eq!(store.last_version("ticket-1").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn lease_claims_and_excludes_until_expiry() {
        let store = InMemoryStore::new();
        let granted = store
            .lease(&[request("totals", "worker-1", 5)], 60_000)
            .await
            .unwrap();
        assert_eq!(granted.len(), 1);
        assert_eq!(granted[0].at, 5);
        assert_eq!(granted[0].retry, 1);

        // Second holder cannot claim a held stream.
        let denied = store
            .lease(&[request("totals", "worker-2", 5)], 60_000)
            .await
            .unwrap();
        assert!(denied.is_empty());

        // Held streams are not polled.
        let polled = store.poll(10, 10).await.unwrap();
        assert!(polled.is_empty());
    }

    #[tokio::test]
    async fn lease_expiry_allows_reclaim_and_increments_retry() {
        let store = InMemoryStore::new();
        store
            .lease(&[request("totals", "worker-1", 5)], 1)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let reclaimed = store
            .lease(&[request("totals", "worker-2", 5)], 60_000)
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].retry, 2);
    }

    #[tokio::test]
    async fn zero_ttl_lease_tags_without_retry_increment() {
        let store = InMemoryStore::new();
        let tagged = store
            .lease(
                &[LeaseRequest {
                    stream: "totals".to_string(),
                    by: "correlator".to_string(),
                    at: -1,
                    source: Some("ticket-1".to_string()),
                }],
                0,
            )
            .await
            .unwrap();
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0].retry, 0);

        // The tag expires immediately: the stream is pollable and claimable.
        let polled = store.poll(10, 0).await.unwrap();
        assert_eq!(polled.len(), 1);
        assert_eq!(polled[0].stream, "totals");
        assert_eq!(polled[0].at, -1);
        assert_eq!(polled[0].source.as_deref(), Some("ticket-1"));

        let claimed = store
            .lease(&[request("totals", "worker-1", 3)], 60_000)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].retry, 1);
    }

    #[tokio::test]
    async fn ack_advances_watermark_and_resets_retry() {
        let store = InMemoryStore::new();
        let granted = store
            .lease(&[request("totals", "worker-1", 7)], 60_000)
            .await
            .unwrap();

        let acked = store.ack(&granted).await.unwrap();
        assert_eq!(acked.len(), 1);

        let polled = store.poll(10, 0).await.unwrap();
        assert_eq!(polled[0].at, 7);

        let again = store
            .lease(&[request("totals", "worker-1", 9)], 60_000)
            .await
            .unwrap();
        assert_eq!(again[0].retry, 1);
    }

    #[tokio::test]
    async fn ack_ignores_dispossessed_holder() {
        let store = InMemoryStore::new();
        store
            .lease(&[request("totals", "worker-1", 5)], 1)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        // worker-2 takes over after expiry.
        store
            .lease(&[request("totals", "worker-2", 5)], 60_000)
            .await
            .unwrap();

        let stale = Lease {
            stream: "totals".to_string(),
            by: "worker-1".to_string(),
            at: 5,
            retry: 1,
            block: false,
            error: None,
        };
        let acked = store.ack(&[stale]).await.unwrap();
        assert!(acked.is_empty());
    }

    #[tokio::test]
    async fn block_requires_current_holder_and_stops_leasing() {
        let store = InMemoryStore::new();
        let granted = store
            .lease(&[request("totals", "worker-1", 5)], 60_000)
            .await
            .unwrap();

        let mut lease = granted[0].clone();
        lease.fail("boom", true);
        let blocked = store.block(&[lease]).await.unwrap();
        assert_eq!(blocked.len(), 1);

        // Blocked streams are neither polled nor claimable.
        assert!(store.poll(10, 10).await.unwrap().is_empty());
        assert!(
            store
                .lease(&[request("totals", "worker-2", 5)], 60_000)
                .await
                .unwrap()
                .is_empty()
        );

        // Until unblocked externally.
        store.unblock("totals").await;
        assert_eq!(store.poll(10, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn block_from_stale_holder_is_ignored() {
        let store = InMemoryStore::new();
        store
            .lease(&[request("totals", "worker-1", 5)], 1)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        store
            .lease(&[request("totals", "worker-2", 6)], 60_000)
            .await
            .unwrap();

        let mut stale = Lease {
            stream: "totals".to_string(),
            by: "worker-1".to_string(),
            at: 5,
            retry: 1,
            block: false,
            error: None,
        };
        stale.fail("late failure", true);

        assert!(store.block(&[stale]).await.unwrap().is_empty());

        // worker-2 can still finish normally.
        let current = Lease {
            stream: "totals".to_string(),
            by: "worker-2".to_string(),
            at: 6,
            retry: 2,
            block: false,
            error: None,
        };
        assert_eq!(store.ack(&[current]).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn poll_scans_both_ends_of_the_watermark_order() {
        let store = InMemoryStore::new();
        for (stream, at) in [("s-old", 1), ("s-mid", 50), ("s-new", 99)] {
            store
                .lease(&[request(stream, "setup", at)], 60_000)
                .await
                .unwrap();
            let lease = Lease {
                stream: stream.to_string(),
                by: "setup".to_string(),
                at,
                retry: 1,
                block: false,
                error: None,
            };
            store.ack(&[lease]).await.unwrap();
        }

        let polled = store.poll(1, 1).await.unwrap();
        let names: Vec<&str> = polled.iter().map(|p| p.stream.as_str()).collect();
        assert_eq!(names, vec!["s-old", "s-new"]);
    }
}
