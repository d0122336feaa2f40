//! Runway-State: persistence layer for the Runway CI orchestrator
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: record types, id allocation and the write-side invariants
//! (unique names, idempotent child creation, one expansion per build step,
//! legal lifecycle transitions).
//!
//! ## Key Components
//!
//! - `schema`: versions, bundles, triggers, configs, steps, builds, batches
//! - `storage_traits`: async `VersionStore`, `BundleStore`, `ConfigStore`,
//!   `BuildStore`, `BatchStore`, combined as `CiStore`
//! - `MemoryStore`: in-memory backend
//! - `SurrealStore`: SurrealDB backend (`mem://`, `surrealkv://`, `ws://`)

pub mod connection;
mod error;
pub mod fakes;
pub mod migrations;
pub mod schema;
pub mod storage_traits;
pub mod surreal_store;

pub use connection::{ServerAuth, StoreSettings};
pub use error::{StateError, StorageError};
pub use fakes::MemoryStore;
pub use schema::*;
pub use storage_traits::{
    BatchStore, BuildStore, BundleStore, CiStore, ConfigStore, CreatedBuild, StorageResult,
    VersionStore,
};
pub use surreal_store::SurrealStore;

/// Result type for runway-state connection and schema operations
pub type Result<T> = std::result::Result<T, StateError>;
