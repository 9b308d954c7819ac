//! The reaction-distribution protocol: poll, lease, handle, ack or block.

use std::sync::atomic::Ordering;

use engine::Reaction;
use event_store::{
    CommittedEvent, EventFilter, Lease, LeaseRequest, PolledStream, Store, StoreExt,
};

use crate::Result;
use crate::lifecycle::Lifecycle;
use crate::orchestrator::Orchestrator;

/// Tuning knobs for one drain cycle.
#[derive(Debug, Clone, Copy)]
pub struct DrainOptions {
    /// Maximum streams considered per cycle, split between lagging and
    /// leading streams by the orchestrator's lag ratio.
    pub stream_limit: usize,

    /// Maximum events fetched per stream.
    pub event_limit: usize,

    /// Lease duration. A lease that is neither acked nor blocked within this
    /// window becomes reclaimable, which is also the retry pacing for
    /// failing streams.
    pub lease_ms: i64,
}

impl Default for DrainOptions {
    fn default() -> Self {
        Self {
            stream_limit: 10,
            event_limit: 100,
            lease_ms: 30_000,
        }
    }
}

/// Outcome of one drain cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    /// Events fetched across all polled streams.
    pub fetched: usize,

    /// Leases granted to this worker.
    pub leased: usize,

    /// Streams acknowledged (watermark advanced durably).
    pub acked: usize,

    /// Streams blocked after exhausting their retry budget.
    pub blocked: usize,
}

/// One unit of reaction work: a matched reaction and the event it reacts to.
struct Job {
    reaction: Reaction,
    event: CommittedEvent,
}

/// Everything gathered for one polled stream before leasing.
struct StreamWork {
    cursor: PolledStream,
    jobs: Vec<Job>,
    request_at: i64,
}

impl Orchestrator {
    /// Runs one drain cycle: discovers pending reaction work, leases the
    /// affected streams, processes each leased stream's payloads strictly in
    /// event order, then acknowledges or blocks.
    ///
    /// Reentrancy-guarded per instance: a cycle already in flight makes a
    /// concurrent call return an empty summary immediately. Overlapping
    /// calls are dropped, not queued.
    pub async fn drain(&self, options: DrainOptions) -> Result<DrainSummary> {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(DrainSummary::default());
        }

        let result = self.drain_cycle(&options).await;
        self.draining.store(false, Ordering::Release);
        result
    }

    #[tracing::instrument(skip(self, options), fields(node = %self.node))]
    async fn drain_cycle(&self, options: &DrainOptions) -> Result<DrainSummary> {
        let started = std::time::Instant::now();
        let mut summary = DrainSummary::default();

        let lagging = ((options.stream_limit as f64) * self.lag_ratio).ceil() as usize;
        let lagging = lagging.min(options.stream_limit);
        let leading = options.stream_limit - lagging;

        let cursors = self.store.poll(lagging, leading).await?;

        let mut work: Vec<StreamWork> = Vec::new();
        for cursor in cursors {
            let mut filter = EventFilter::new()
                .after(cursor.at)
                .limit(options.event_limit);
            if let Some(source) = &cursor.source {
                filter = filter.stream(source.clone());
            }
            let events = self.store.fetch(&filter).await?;
            if events.is_empty() {
                continue;
            }
            summary.fetched += events.len();

            let mut jobs = Vec::new();
            for event in &events {
                for (_, reaction) in self.registry.reactions_for(&event.name) {
                    if reaction.resolver.resolve(event).as_deref() == Some(cursor.stream.as_str()) {
                        jobs.push(Job {
                            reaction: reaction.clone(),
                            event: event.clone(),
                        });
                    }
                }
            }

            // Streams with nothing to react to still advance past what was
            // fetched, so they are not re-scanned forever.
            let request_at = jobs
                .last()
                .map(|job| job.event.id)
                .unwrap_or_else(|| events.last().map(|event| event.id).unwrap_or(cursor.at));

            work.push(StreamWork {
                cursor,
                jobs,
                request_at,
            });
        }

        if work.is_empty() {
            return Ok(summary);
        }

        let requests: Vec<LeaseRequest> = work
            .iter()
            .map(|unit| LeaseRequest {
                stream: unit.cursor.stream.clone(),
                by: self.node.clone(),
                at: unit.request_at,
                source: unit.cursor.source.clone(),
            })
            .collect();

        let leases = self.store.lease(&requests, options.lease_ms).await?;
        summary.leased = leases.len();

        let mut to_ack: Vec<Lease> = Vec::new();
        let mut to_block: Vec<Lease> = Vec::new();
        for lease in leases {
            let Some(unit) = work.iter().find(|unit| unit.cursor.stream == lease.stream) else {
                continue;
            };
            let handled = self.handle(lease, unit).await;
            if handled.block {
                to_block.push(handled);
            } else if handled.error.is_none() {
                to_ack.push(handled);
            }
            // A failed lease below its retry ceiling is left to expire; the
            // stream is retried from its durable watermark after the TTL.
        }

        for lease in self.store.ack(&to_ack).await? {
            summary.acked += 1;
            self.emit(&Lifecycle::Acked(lease));
        }
        for lease in self.store.block(&to_block).await? {
            summary.blocked += 1;
            tracing::warn!(stream = %lease.stream, error = ?lease.error, "stream blocked");
            self.emit(&Lifecycle::Blocked(lease));
        }

        metrics::counter!("drain_cycles_total").increment(1);
        metrics::histogram!("drain_duration_seconds").record(started.elapsed().as_secs_f64());

        Ok(summary)
    }

    /// Processes one leased stream's payloads in event order.
    ///
    /// On success the lease watermark advances to that event's id; the first
    /// failure stops the stream, records the error, and decides blocking.
    /// Partial progress is never rolled back.
    async fn handle(&self, mut lease: Lease, unit: &StreamWork) -> Lease {
        if unit.jobs.is_empty() {
            // Trivially satisfied at the requested watermark.
            return lease;
        }

        let mut at = unit.cursor.at;
        for job in &unit.jobs {
            match job.reaction.handler.react(&job.event).await {
                Ok(()) => {
                    at = job.event.id;
                }
                Err(error) => {
                    tracing::warn!(
                        stream = %lease.stream,
                        event = job.event.id,
                        retry = lease.retry,
                        %error,
                        "reaction failed"
                    );
                    metrics::counter!("drain_reaction_failures_total").increment(1);
                    let block = job.reaction.options.block_on_error
                        && lease.retry > job.reaction.options.max_retries;
                    lease.fail(error.to_string(), block);
                    break;
                }
            }
        }
        lease.at = at;
        lease
    }
}
