// Public contracts for the Tradeloop orchestration core
// This crate defines the task model, event protocol, error taxonomy,
// workflow descriptors, and collaborator client traits.

pub mod clients;
pub mod error;
pub mod events;
pub mod task;
pub mod workflow;

pub use clients::*;
pub use error::*;
pub use events::*;
pub use task::*;
pub use workflow::*;
