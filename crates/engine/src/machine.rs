use std::collections::HashMap;
use std::sync::Arc;

use common::Target;
use event_store::{CommittedEvent, Message};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{EngineError, Result, Snapshot};

/// Produces a machine's initial state.
pub type Init = Arc<dyn Fn() -> Value + Send + Sync>;

/// Derives a partial state update from the current state and a committed
/// event. The engine deep-merges the partial into the running state.
pub type PatchFn = Arc<dyn Fn(&Value, &CommittedEvent) -> Value + Send + Sync>;

/// Executes an action: given the validated payload, the loaded snapshot, and
/// the target, returns the events to commit. An empty vector is a no-op.
pub type Handler = Arc<dyn Fn(&Value, &Snapshot, &Target) -> Result<Vec<Message>> + Send + Sync>;

/// Decides whether a state snapshot should be persisted after a commit.
pub type SnapPredicate = Arc<dyn Fn(&Snapshot) -> bool + Send + Sync>;

/// Checks a precondition against the loaded state and the acting party.
pub type InvariantCheck = Arc<dyn Fn(&Value, &str) -> bool + Send + Sync>;

/// Structural validation for a named payload, backed by serde.
///
/// `Schema::of::<T>()` accepts exactly the values that deserialize into `T`;
/// `Schema::any()` accepts everything.
#[derive(Clone)]
pub struct Schema {
    check: Arc<dyn Fn(&Value) -> std::result::Result<(), String> + Send + Sync>,
}

impl Schema {
    /// A schema accepting values that deserialize into `T`.
    pub fn of<T: DeserializeOwned>() -> Self {
        Self {
            check: Arc::new(|value| {
                serde_json::from_value::<T>(value.clone())
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            }),
        }
    }

    /// A schema accepting any value.
    pub fn any() -> Self {
        Self {
            check: Arc::new(|_| Ok(())),
        }
    }

    /// Validates a payload, reporting the offending name on failure.
    pub fn validate(&self, name: &str, value: &Value) -> Result<()> {
        (self.check)(value).map_err(|reason| EngineError::Validation {
            name: name.to_string(),
            reason,
        })
    }
}

impl std::fmt::Debug for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Schema")
    }
}

/// A declared precondition on an action.
pub struct Invariant {
    pub description: String,
    pub check: InvariantCheck,
}

/// An action registered on a state machine: schema, handler, invariants.
pub struct ActionDef {
    pub(crate) schema: Schema,
    pub(crate) handler: Handler,
    pub(crate) invariants: Vec<Invariant>,
}

impl ActionDef {
    /// Creates an action with the given handler and a permissive schema.
    pub fn new(
        handler: impl Fn(&Value, &Snapshot, &Target) -> Result<Vec<Message>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            schema: Schema::any(),
            handler: Arc::new(handler),
            invariants: Vec::new(),
        }
    }

    /// Sets the payload schema.
    pub fn schema(mut self, schema: Schema) -> Self {
        self.schema = schema;
        self
    }

    /// Declares a precondition. Invariants are checked in declaration order
    /// and the first failure fails the whole action.
    pub fn invariant(
        mut self,
        description: impl Into<String>,
        check: impl Fn(&Value, &str) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.invariants.push(Invariant {
            description: description.into(),
            check: Arc::new(check),
        });
        self
    }
}

/// Descriptor for one state machine: initial state, per-event patch
/// functions, per-action definitions, and an optional snapshot predicate.
pub struct StateMachineDef {
    name: String,
    init: Init,
    patches: HashMap<String, PatchFn>,
    actions: HashMap<String, ActionDef>,
    snap_when: Option<SnapPredicate>,
    duplicates: Vec<String>,
}

impl StateMachineDef {
    /// Creates a machine with the given name and initial-state function.
    pub fn new(name: impl Into<String>, init: impl Fn() -> Value + Send + Sync + 'static) -> Self {
        Self {
            name: name.into(),
            init: Arc::new(init),
            patches: HashMap::new(),
            actions: HashMap::new(),
            snap_when: None,
            duplicates: Vec::new(),
        }
    }

    /// Declares how an event patches this machine's state.
    pub fn patch(
        mut self,
        event: impl Into<String>,
        apply: impl Fn(&Value, &CommittedEvent) -> Value + Send + Sync + 'static,
    ) -> Self {
        let event = event.into();
        if self
            .patches
            .insert(event.clone(), Arc::new(apply))
            .is_some()
        {
            self.duplicates
                .push(format!("patch '{event}' on machine '{}'", self.name));
        }
        self
    }

    /// Registers an action on this machine.
    pub fn action(mut self, name: impl Into<String>, def: ActionDef) -> Self {
        let name = name.into();
        if self.actions.insert(name.clone(), def).is_some() {
            self.duplicates
                .push(format!("action '{name}' on machine '{}'", self.name));
        }
        self
    }

    /// Sets the snapshot predicate, evaluated after every commit.
    pub fn snap_when(mut self, predicate: impl Fn(&Snapshot) -> bool + Send + Sync + 'static) -> Self {
        self.snap_when = Some(Arc::new(predicate));
        self
    }

    /// The machine's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn init_state(&self) -> Value {
        (self.init)()
    }

    pub(crate) fn patch_for(&self, event: &str) -> Option<&PatchFn> {
        self.patches.get(event)
    }

    pub(crate) fn action_def(&self, name: &str) -> Option<&ActionDef> {
        self.actions.get(name)
    }

    pub(crate) fn action_names(&self) -> impl Iterator<Item = &String> {
        self.actions.keys()
    }

    pub(crate) fn wants_snapshot(&self, snapshot: &Snapshot) -> bool {
        self.snap_when
            .as_ref()
            .is_some_and(|predicate| predicate(snapshot))
    }

    pub(crate) fn duplicates(&self) -> &[String] {
        &self.duplicates
    }
}

impl std::fmt::Debug for StateMachineDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachineDef")
            .field("name", &self.name)
            .field("patches", &self.patches.len())
            .field("actions", &self.actions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct Increment {
        #[allow(dead_code)]
        by: i64,
    }

    #[test]
    fn schema_of_accepts_matching_payloads() {
        let schema = Schema::of::<Increment>();
        assert!(schema.validate("Increment", &json!({"by": 2})).is_ok());
    }

    #[test]
    fn schema_of_rejects_mismatched_payloads() {
        let schema = Schema::of::<Increment>();
        let result = schema.validate("Increment", &json!({"by": "two"}));
        assert!(matches!(
            result,
            Err(EngineError::Validation { name, .. }) if name == "Increment"
        ));
    }

    #[test]
    fn schema_any_accepts_everything() {
        let schema = Schema::any();
        assert!(schema.validate("anything", &json!([1, "mixed", null])).is_ok());
    }

    #[test]
    fn machine_records_duplicate_registrations() {
        let machine = StateMachineDef::new("Counter", || json!({"total": 0}))
            .patch("Incremented", |_, _| json!({}))
            .patch("Incremented", |_, _| json!({}))
            .action("Increment", ActionDef::new(|_, _, _| Ok(vec![])))
            .action("Increment", ActionDef::new(|_, _, _| Ok(vec![])));

        assert_eq!(machine.duplicates().len(), 2);
        assert!(machine.duplicates()[0].contains("Incremented"));
        assert!(machine.duplicates()[1].contains("Increment"));
    }

    #[test]
    fn wants_snapshot_defaults_to_never() {
        let plain = StateMachineDef::new("Counter", || json!({}));
        let snapshot = Snapshot::new(json!({}));
        assert!(!plain.wants_snapshot(&snapshot));

        let eager = StateMachineDef::new("Counter", || json!({})).snap_when(|s| s.patches >= 1);
        let mut snapshot = Snapshot::new(json!({}));
        assert!(!eager.wants_snapshot(&snapshot));
        snapshot.patches = 1;
        assert!(eager.wants_snapshot(&snapshot));
    }
}
