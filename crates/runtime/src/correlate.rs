//! Stream discovery: sweep committed events through every resolver and tag
//! newly referenced streams so the next drain picks them up.

use std::collections::HashSet;

use event_store::{EventFilter, LeaseRequest, Store, StoreExt};

use crate::Result;
use crate::orchestrator::Orchestrator;

/// Cursor and batch size for one correlation sweep.
///
/// The caller owns the cursor: persist `last_id` between sweeps and feed it
/// back as `after`.
#[derive(Debug, Clone, Copy)]
pub struct CorrelateOptions {
    /// Only events with id strictly above this are scanned.
    pub after: i64,

    /// Maximum events scanned per sweep.
    pub limit: usize,
}

impl Default for CorrelateOptions {
    fn default() -> Self {
        Self {
            after: -1,
            limit: 500,
        }
    }
}

/// Outcome of one correlation sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorrelateSummary {
    /// Streams tagged with a zero-duration lease this sweep.
    pub leased: Vec<String>,

    /// Highest event id scanned; the cursor for the next sweep.
    pub last_id: i64,
}

impl Orchestrator {
    /// Sweeps a batch of events through every registered resolver and tags
    /// each resolved target stream with a zero-TTL lease pointing at its
    /// source stream. Tagged streams are immediately reclaimable, so the
    /// next ordinary drain discovers and processes them.
    #[tracing::instrument(skip(self, options), fields(node = %self.node, after = options.after))]
    pub async fn correlate(&self, options: CorrelateOptions) -> Result<CorrelateSummary> {
        let filter = EventFilter::new().after(options.after).limit(options.limit);
        let events = self.store.fetch(&filter).await?;
        let last_id = events.last().map(|event| event.id).unwrap_or(options.after);

        let mut seen: HashSet<String> = HashSet::new();
        let mut requests: Vec<LeaseRequest> = Vec::new();
        for event in &events {
            for (_, reaction) in self.registry.reactions_for(&event.name) {
                if let Some(target) = reaction.resolver.resolve(event)
                    && seen.insert(target.clone())
                {
                    requests.push(LeaseRequest {
                        stream: target,
                        by: self.node.clone(),
                        at: -1,
                        source: Some(event.stream.clone()),
                    });
                }
            }
        }

        if requests.is_empty() {
            return Ok(CorrelateSummary {
                leased: Vec::new(),
                last_id,
            });
        }

        let leases = self.store.lease(&requests, 0).await?;
        metrics::counter!("correlate_streams_tagged_total").increment(leases.len() as u64);

        Ok(CorrelateSummary {
            leased: leases.into_iter().map(|lease| lease.stream).collect(),
            last_id,
        })
    }
}
