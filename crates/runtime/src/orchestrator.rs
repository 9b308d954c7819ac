use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use common::Target;
use engine::{Registry, Snapshot};
use event_store::{CommittedEvent, EventFilter, Store};
use serde_json::Value;
use uuid::Uuid;

use crate::lifecycle::{Lifecycle, LifecycleObserver};
use crate::{Result, RuntimeError};

/// Result of an orchestrator query: the first and last matching events plus
/// the total delivered count.
#[derive(Debug, Clone, Default)]
pub struct QuerySummary {
    pub first: Option<CommittedEvent>,
    pub last: Option<CommittedEvent>,
    pub count: usize,
}

/// The runtime object coordinating store, engine, and reaction registry.
///
/// Constructed via [`OrchestratorBuilder`] with explicit dependencies; holds
/// no global state. One orchestrator instance is one drain worker: its node
/// id is the lease holder id used against the store.
pub struct Orchestrator {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) registry: Arc<Registry>,
    pub(crate) node: String,
    pub(crate) lag_ratio: f64,
    pub(crate) draining: AtomicBool,
    pub(crate) observers: Vec<Arc<dyn LifecycleObserver>>,
}

impl Orchestrator {
    /// Starts building an orchestrator over a store and registry.
    pub fn builder(store: Arc<dyn Store>, registry: Registry) -> OrchestratorBuilder {
        OrchestratorBuilder {
            store,
            registry,
            lag_ratio: 2.0 / 3.0,
            observers: Vec::new(),
        }
    }

    /// This worker's lease holder id.
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Executes an action against a target stream.
    ///
    /// Returns one snapshot per committed event (empty when the handler
    /// declined to emit). Pass `reacting_to` when this call is itself a
    /// reaction to a committed event.
    #[tracing::instrument(skip(self, payload, reacting_to), fields(action = action, stream = %target.stream))]
    pub async fn execute(
        &self,
        action: &str,
        target: &Target,
        payload: Value,
        reacting_to: Option<&CommittedEvent>,
    ) -> Result<Vec<Snapshot>> {
        let snapshots = engine::action(
            &self.store,
            &self.registry,
            action,
            target,
            &payload,
            reacting_to,
            false,
        )
        .await?;

        for snapshot in &snapshots {
            if let Some(event) = &snapshot.event {
                self.emit(&Lifecycle::Committed {
                    stream: event.stream.clone(),
                    name: event.name.clone(),
                    id: event.id,
                });
            }
        }

        Ok(snapshots)
    }

    /// Loads the current snapshot of a stream through a named machine.
    pub async fn load(&self, machine: &str, stream: &str) -> Result<Snapshot> {
        let def = self.machine(machine)?;
        Ok(engine::load(self.store.as_ref(), def, stream, None).await?)
    }

    /// Loads a stream, invoking `callback` with the running snapshot after
    /// every folded event.
    pub async fn load_with(
        &self,
        machine: &str,
        stream: &str,
        callback: &mut (dyn FnMut(&Snapshot) + Send),
    ) -> Result<Snapshot> {
        let def = self.machine(machine)?;
        Ok(engine::load(self.store.as_ref(), def, stream, Some(callback)).await?)
    }

    /// Queries events, returning the first/last matches and the count.
    pub async fn query(&self, filter: &EventFilter) -> Result<QuerySummary> {
        self.query_with(filter, None).await
    }

    /// Queries events, additionally delivering each one to `callback`.
    pub async fn query_with(
        &self,
        filter: &EventFilter,
        mut callback: Option<&mut (dyn FnMut(&CommittedEvent) + Send)>,
    ) -> Result<QuerySummary> {
        let mut first: Option<CommittedEvent> = None;
        let mut last: Option<CommittedEvent> = None;
        let count = self
            .store
            .query(filter, &mut |event| {
                if let Some(callback) = callback.as_deref_mut() {
                    callback(&event);
                }
                if first.is_none() {
                    first = Some(event.clone());
                }
                last = Some(event);
            })
            .await?;

        Ok(QuerySummary { first, last, count })
    }

    pub(crate) fn machine(&self, name: &str) -> Result<&engine::StateMachineDef> {
        self.registry.machine(name).ok_or_else(|| {
            RuntimeError::Engine(engine::EngineError::Registration(format!(
                "no state machine named '{name}'"
            )))
        })
    }

    pub(crate) fn emit(&self, event: &Lifecycle) {
        for observer in &self.observers {
            observer.notify(event);
        }
    }
}

/// Builder wiring an orchestrator's dependencies.
pub struct OrchestratorBuilder {
    store: Arc<dyn Store>,
    registry: Registry,
    lag_ratio: f64,
    observers: Vec<Arc<dyn LifecycleObserver>>,
}

impl OrchestratorBuilder {
    /// Sets the share of each drain's stream budget spent on lagging
    /// streams (the rest scans leading streams). Clamped to (0, 1].
    pub fn lag_ratio(mut self, ratio: f64) -> Self {
        self.lag_ratio = ratio.clamp(f64::MIN_POSITIVE, 1.0);
        self
    }

    /// Registers a lifecycle observer.
    pub fn observer(mut self, observer: Arc<dyn LifecycleObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Builds the orchestrator with a fresh node id.
    pub fn build(self) -> Orchestrator {
        Orchestrator {
            store: self.store,
            registry: Arc::new(self.registry),
            node: Uuid::new_v4().to_string(),
            lag_ratio: self.lag_ratio,
            draining: AtomicBool::new(false),
            observers: self.observers,
        }
    }
}
