//! FieldSync Store Interface
//!
//! The node-store seam between the synchronization engine and whatever
//! hierarchical object store hosts the live tree:
//!
//! - [`node`] - Typed node values, write origins, and the [`NodeStore`] trait
//! - [`memory`] - HashMap-backed in-memory store for tests and demos
//! - [`events`] - Change notifications the engine publishes outward
//! - [`error`] - Error types

mod error;
mod events;
mod memory;
mod node;

pub use error::{Result, StoreError};
pub use events::{Change, EngineEvent};
pub use memory::MemoryStore;
pub use node::{ChangeEvent, NodeStore, NodeValue, Origin};
