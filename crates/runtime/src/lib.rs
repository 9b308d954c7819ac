pub mod correlate;
pub mod drain;
pub mod error;
pub mod lifecycle;
pub mod orchestrator;

pub use correlate::{CorrelateOptions, CorrelateSummary};
pub use drain::{DrainOptions, DrainSummary};
pub use error::{Result, RuntimeError};
pub use lifecycle::{Lifecycle, LifecycleObserver};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, QuerySummary};
