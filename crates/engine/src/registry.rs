use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use event_store::CommittedEvent;
use serde_json::Value;

use crate::{EngineError, Result, Schema, StateMachineDef};

/// Error type returned by reaction handlers.
pub type ReactionError = Box<dyn std::error::Error + Send + Sync>;

/// Processes one event delivered to a reaction stream.
///
/// Handlers run sequentially per stream, in event order, and may be retried:
/// they must tolerate at-least-once delivery.
#[async_trait]
pub trait ReactionHandler: Send + Sync {
    async fn react(&self, event: &CommittedEvent) -> std::result::Result<(), ReactionError>;
}

/// Maps a committed event to the stream that should react to it, or `None`
/// for "do not react".
pub trait StreamResolver: Send + Sync {
    fn resolve(&self, event: &CommittedEvent) -> Option<String>;
}

impl<F> StreamResolver for F
where
    F: Fn(&CommittedEvent) -> Option<String> + Send + Sync,
{
    fn resolve(&self, event: &CommittedEvent) -> Option<String> {
        self(event)
    }
}

/// Retry and blocking policy for a reaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReactionOptions {
    /// Block the stream once the retry ceiling is exceeded.
    pub block_on_error: bool,

    /// Lease claims tolerated since the last ack before blocking kicks in.
    pub max_retries: i32,

    /// Minimum delay before a failed stream should be retried. Enforced
    /// through lease expiry.
    pub retry_delay_ms: u64,
}

impl Default for ReactionOptions {
    fn default() -> Self {
        Self {
            block_on_error: false,
            max_retries: 3,
            retry_delay_ms: 5_000,
        }
    }
}

/// A registered reaction: handler, stream resolver, and policy.
#[derive(Clone)]
pub struct Reaction {
    pub handler: Arc<dyn ReactionHandler>,
    pub resolver: Arc<dyn StreamResolver>,
    pub options: ReactionOptions,
}

impl Reaction {
    /// Creates a reaction with default options.
    pub fn new(handler: Arc<dyn ReactionHandler>, resolver: impl StreamResolver + 'static) -> Self {
        Self {
            handler,
            resolver: Arc::new(resolver),
            options: ReactionOptions::default(),
        }
    }

    /// Sets whether the stream blocks once retries are exhausted.
    pub fn block_on_error(mut self, block: bool) -> Self {
        self.options.block_on_error = block;
        self
    }

    /// Sets the retry ceiling.
    pub fn max_retries(mut self, retries: i32) -> Self {
        self.options.max_retries = retries;
        self
    }

    /// Sets the minimum retry delay.
    pub fn retry_delay_ms(mut self, delay: u64) -> Self {
        self.options.retry_delay_ms = delay;
        self
    }
}

/// A registered event: its payload schema and the reactions subscribed to it.
pub struct EventDef {
    pub schema: Schema,
    pub reactions: BTreeMap<String, Reaction>,
}

/// The immutable registry consumed by the engine and orchestrator.
///
/// Machines are owned in an arena and addressed by name or by the actions
/// they declare; events map to their schema and subscribed reactions. Built
/// once at process start and never mutated afterwards.
pub struct Registry {
    machines: Vec<StateMachineDef>,
    actions: HashMap<String, usize>,
    events: HashMap<String, EventDef>,
}

impl Registry {
    /// Starts building a registry.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Looks up a machine by name.
    pub fn machine(&self, name: &str) -> Option<&StateMachineDef> {
        self.machines.iter().find(|machine| machine.name() == name)
    }

    /// Looks up the machine declaring the given action.
    pub fn machine_for_action(&self, action: &str) -> Option<&StateMachineDef> {
        self.actions.get(action).map(|index| &self.machines[*index])
    }

    /// Looks up an event definition by name.
    pub fn event(&self, name: &str) -> Option<&EventDef> {
        self.events.get(name)
    }

    /// Iterates the reactions registered for an event name, in registration
    /// name order. Empty for unknown events.
    pub fn reactions_for(&self, event: &str) -> impl Iterator<Item = (&String, &Reaction)> {
        self.events
            .get(event)
            .into_iter()
            .flat_map(|def| def.reactions.iter())
    }

    /// Validates an event payload against its registered schema.
    pub fn validate_event(&self, name: &str, data: &Value) -> Result<()> {
        let def = self
            .events
            .get(name)
            .ok_or_else(|| EngineError::Registration(format!("no schema for event '{name}'")))?;
        def.schema.validate(name, data)
    }
}

/// Imperative registration API over plain data structures.
///
/// All duplicate-name and dangling-reference defects are collected and
/// reported together from [`RegistryBuilder::build`].
#[derive(Default)]
pub struct RegistryBuilder {
    machines: Vec<StateMachineDef>,
    events: HashMap<String, EventDef>,
    errors: Vec<String>,
}

impl RegistryBuilder {
    /// Registers a state machine.
    pub fn machine(mut self, machine: StateMachineDef) -> Self {
        if self.machines.iter().any(|m| m.name() == machine.name()) {
            self.errors
                .push(format!("duplicate machine '{}'", machine.name()));
        }
        self.machines.push(machine);
        self
    }

    /// Registers an event schema.
    pub fn event(mut self, name: impl Into<String>, schema: Schema) -> Self {
        let name = name.into();
        if self.events.contains_key(&name) {
            self.errors.push(format!("duplicate event '{name}'"));
        }
        self.events.insert(
            name,
            EventDef {
                schema,
                reactions: BTreeMap::new(),
            },
        );
        self
    }

    /// Subscribes a named reaction to an event. The event must already be
    /// registered.
    pub fn reaction(
        mut self,
        event: impl Into<String>,
        name: impl Into<String>,
        reaction: Reaction,
    ) -> Self {
        let event = event.into();
        let name = name.into();
        match self.events.get_mut(&event) {
            Some(def) => {
                if def.reactions.insert(name.clone(), reaction).is_some() {
                    self.errors
                        .push(format!("duplicate reaction '{name}' on event '{event}'"));
                }
            }
            None => {
                self.errors.push(format!(
                    "reaction '{name}' subscribes to unregistered event '{event}'"
                ));
            }
        }
        self
    }

    /// Finishes the registry, failing on any registration defect.
    pub fn build(self) -> Result<Registry> {
        let mut errors = self.errors;
        let mut actions: HashMap<String, usize> = HashMap::new();

        for (index, machine) in self.machines.iter().enumerate() {
            errors.extend(machine.duplicates().iter().cloned());
            for action in machine.action_names() {
                if actions.insert(action.clone(), index).is_some() {
                    errors.push(format!("action '{action}' declared by multiple machines"));
                }
            }
        }

        if errors.is_empty() {
            Ok(Registry {
                machines: self.machines,
                actions,
                events: self.events,
            })
        } else {
            Err(EngineError::Registration(errors.join("; ")))
        }
    }
}
