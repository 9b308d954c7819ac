pub mod error;
pub mod event;
pub mod filter;
pub mod memory;
pub mod postgres;
pub mod store;

pub use common::Target;
pub use error::{Result, StoreError};
pub use event::{
    ActionCause, Causation, CommitNotice, CommittedEvent, EventCause, EventMeta, Message,
    SNAP_EVENT,
};
pub use filter::EventFilter;
pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use store::{Lease, LeaseRequest, PolledStream, Store, StoreExt};
