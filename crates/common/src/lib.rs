pub mod types;

pub use types::Target;
