//! Error types for runway-state

use thiserror::Error;

/// Errors raised while connecting to or initialising a backend.
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

/// Errors returned by the storage traits.
///
/// Write-side invariants (unique names, one expansion per build step, legal
/// lifecycle transitions) surface here rather than in the callers.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("version not found: {version}")]
    VersionNotFound { version: String },

    #[error("bundle not found: {bundle}")]
    BundleNotFound { bundle: String },

    #[error("trigger not found: {trigger}")]
    TriggerNotFound { trigger: String },

    #[error("config not found: {config}")]
    ConfigNotFound { config: String },

    #[error("config step not found: {step}")]
    StepNotFound { step: String },

    #[error("batch not found: {batch}")]
    BatchNotFound { batch: String },

    #[error("build not found: {build}")]
    BuildNotFound { build: String },

    #[error("{kind} named '{name}' already exists")]
    DuplicateName { kind: &'static str, name: String },

    #[error("batch {batch} already has a slot for trigger {trigger}")]
    DuplicateSlot { batch: String, trigger: String },

    #[error("build {build} already expanded step {step}")]
    AlreadyExpanded { build: String, step: String },

    #[error("invalid transition for {entity} {id}: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_expanded_displays_build_and_step() {
        let err = StorageError::AlreadyExpanded {
            build: "42".to_string(),
            step: "7".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("42"));
        assert!(msg.contains("7"));
    }

    #[test]
    fn test_invalid_transition_names_both_states() {
        let err = StorageError::InvalidTransition {
            entity: "build",
            id: "3".to_string(),
            from: "done".to_string(),
            to: "running".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid transition for build 3: done -> running"
        );
    }
}
