//! Durable task persistence: the store trait, its SQLite implementation,
//! an in-memory twin for tests, and the store-level retry policy

mod memory;
mod retry;
mod sqlite;
mod store;

pub use memory::InMemoryTaskStore;
pub use retry::with_store_retry;
pub use sqlite::SqliteTaskStore;
pub use store::{StoreError, TaskStore, TransitionPatch, WorkflowRecord};
