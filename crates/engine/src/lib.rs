pub mod engine;
pub mod error;
pub mod machine;
pub mod patch;
pub mod registry;
pub mod snapshot;

pub use engine::{action, load, snap};
pub use error::{EngineError, Result};
pub use machine::{ActionDef, Invariant, Schema, StateMachineDef};
pub use patch::patch;
pub use registry::{
    EventDef, Reaction, ReactionError, ReactionHandler, ReactionOptions, Registry,
    RegistryBuilder, StreamResolver,
};
pub use snapshot::Snapshot;
