//! The pure algorithms: stream folding, action execution, snapshotting.

use std::sync::Arc;

use common::Target;
use event_store::{CommittedEvent, EventFilter, EventMeta, Message, SNAP_EVENT, Store};
use serde_json::Value;
use uuid::Uuid;

use crate::machine::StateMachineDef;
use crate::patch::patch;
use crate::registry::Registry;
use crate::snapshot::Snapshot;
use crate::{EngineError, Result};

/// Folds a stream into a snapshot.
///
/// State starts from the machine's initial value. Snapshot markers replace
/// the state wholesale and reset the patch counter; events with a declared
/// patch function are deep-merged into the state. `on_event` is invoked with
/// the running snapshot after every event, enabling mid-replay inspection
/// without re-querying.
#[tracing::instrument(skip(store, machine, on_event), fields(machine = machine.name()))]
pub async fn load(
    store: &dyn Store,
    machine: &StateMachineDef,
    stream: &str,
    mut on_event: Option<&mut (dyn FnMut(&Snapshot) + Send)>,
) -> Result<Snapshot> {
    let mut snapshot = Snapshot::new(machine.init_state());
    let filter = EventFilter::for_stream(stream).with_snaps(true);

    store
        .query(&filter, &mut |event| {
            if event.is_snapshot() {
                snapshot.state = event.data.clone();
                snapshot.snaps += 1;
                snapshot.patches = 0;
            } else if let Some(apply) = machine.patch_for(&event.name) {
                let partial = apply(&snapshot.state, &event);
                snapshot.state = patch(&snapshot.state, &partial);
                snapshot.patches += 1;
            }
            snapshot.event = Some(event);
            if let Some(callback) = on_event.as_deref_mut() {
                callback(&snapshot);
            }
        })
        .await?;

    Ok(snapshot)
}

/// Executes an action end to end: validate, check invariants, run the
/// handler, commit, fold, and optionally schedule a snapshot.
///
/// Returns one snapshot per committed event; an empty result means the
/// handler chose not to emit (the stream is unchanged). When `reacting_to`
/// is given, the commit inherits its correlation, records it as causation,
/// and skips the optimistic-concurrency check; reactions do not contend
/// with the original command's version.
#[tracing::instrument(
    skip(store, registry, payload, reacting_to),
    fields(action = name, stream = %target.stream)
)]
pub async fn action(
    store: &Arc<dyn Store>,
    registry: &Registry,
    name: &str,
    target: &Target,
    payload: &Value,
    reacting_to: Option<&CommittedEvent>,
    skip_validation: bool,
) -> Result<Vec<Snapshot>> {
    if target.stream.is_empty() {
        return Err(EngineError::MissingTarget);
    }

    let machine = registry.machine_for_action(name).ok_or_else(|| {
        EngineError::Registration(format!("no state machine registered for action '{name}'"))
    })?;
    let def = machine
        .action_def(name)
        .ok_or_else(|| EngineError::Registration(format!("no handler for action '{name}'")))?;

    if !skip_validation {
        def.schema.validate(name, payload)?;
    }

    let mut snapshot = load(store.as_ref(), machine, &target.stream, None).await?;

    for invariant in &def.invariants {
        if !(invariant.check)(&snapshot.state, &target.actor) {
            return Err(EngineError::Invariant {
                action: name.to_string(),
                description: invariant.description.clone(),
            });
        }
    }

    let messages = (def.handler)(payload, &snapshot, target)?;
    if messages.is_empty() {
        return Ok(Vec::new());
    }

    if !skip_validation {
        for message in &messages {
            registry.validate_event(&message.name, &message.data)?;
        }
    }

    let correlation = reacting_to
        .map(|event| event.meta.correlation.clone())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let mut meta = EventMeta::new(correlation).caused_by_action(name, target.clone());
    if let Some(event) = reacting_to {
        meta = meta.caused_by_event(event);
    }

    let expected_version = if reacting_to.is_some() {
        None
    } else {
        target.expected_version
    };

    let committed = store
        .commit(&target.stream, &messages, meta, expected_version)
        .await?;

    let mut snapshots = Vec::with_capacity(committed.len());
    for event in committed {
        if let Some(apply) = machine.patch_for(&event.name) {
            let partial = apply(&snapshot.state, &event);
            snapshot.state = patch(&snapshot.state, &partial);
            snapshot.patches += 1;
        }
        snapshot.event = Some(event);
        snapshots.push(snapshot.clone());
    }

    if machine.wants_snapshot(&snapshot) {
        spawn_snap(Arc::clone(store), snapshot.clone());
    }

    metrics::counter!("engine_actions_total").increment(1);
    metrics::counter!("engine_events_committed_total").increment(snapshots.len() as u64);

    Ok(snapshots)
}

/// Persists a snapshot marker for the snapshot's stream.
///
/// The marker is committed with an expected version equal to the snapshot's
/// last event, so it lands at the immediately following version or not at
/// all; a stream that moved on simply rejects the marker.
pub async fn snap(store: &dyn Store, snapshot: &Snapshot) -> Result<Option<CommittedEvent>> {
    let Some(event) = &snapshot.event else {
        return Ok(None);
    };

    let message = Message::new(SNAP_EVENT, snapshot.state.clone());
    let meta = EventMeta::new(event.meta.correlation.clone());
    let committed = store
        .commit(&event.stream, &[message], meta, Some(event.version))
        .await?;

    metrics::counter!("engine_snapshots_total").increment(1);
    Ok(committed.into_iter().next())
}

/// Best-effort background snapshot persistence: failures are logged, never
/// propagated to the triggering action.
fn spawn_snap(store: Arc<dyn Store>, snapshot: Snapshot) {
    tokio::spawn(async move {
        if let Err(error) = snap(store.as_ref(), &snapshot).await {
            let stream = snapshot
                .event
                .as_ref()
                .map(|event| event.stream.as_str())
                .unwrap_or_default();
            tracing::warn!(%error, stream, "snapshot persistence failed");
        }
    });
}
