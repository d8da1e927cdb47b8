//! Durable Store Adapters
//!
//! Implementations of the [`DurableStore`](crate::domain::ports::DurableStore) port.

mod json_file;
mod memory;

pub use json_file::{JsonFileStore, DATABASE_FILE};
pub use memory::MemoryStore;
