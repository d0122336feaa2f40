//! Error taxonomy for Runway orchestration.

use runway_state::StorageError;

/// Malformed static configuration, raised synchronously when a step, config
/// or trigger is authored.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("step '{step}': configure_upgrade requires upgrade_config")]
    MissingUpgradeConfig { step: String },

    #[error("step '{step}': configure_upgrade requires at least one upgrade target")]
    MissingUpgradeTarget { step: String },

    #[error("step '{step}': configure_upgrade requires at least one upgrade source")]
    MissingUpgradeSource { step: String },

    #[error("step '{step}': configure_upgrade requires at least one upgrade_dbs entry")]
    MissingUpgradeDbs { step: String },

    #[error("step '{step}': upgrade fields are not allowed on a {job_type} step")]
    UpgradeFieldsOnJobType { step: String, job_type: String },

    #[error("step '{step}': cannot change job type to {job_type} while upgrade fields are set")]
    UpgradeStepRetyped { step: String, job_type: String },

    #[error("step '{step}': create_build requires at least one config")]
    MissingChildConfigs { step: String },

    #[error("step '{step}': {job_type} requires a command")]
    MissingCommand { step: String, job_type: String },

    #[error("trigger '{trigger}': config has a configure_upgrade step but no upgrade_dumps_trigger")]
    MissingDumpsTrigger { trigger: String },

    #[error("unknown {kind} '{name}'")]
    UnknownReference { kind: &'static str, name: String },

    #[error("invalid base bundle pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// Runway domain errors.
#[derive(Debug, thiserror::Error)]
pub enum RunwayError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("no reference build for version {version} and trigger {trigger}")]
    ReferenceUnavailable { version: String, trigger: String },

    #[error("reference build {reference} has no done descendant with config {config}")]
    DumpMismatch { reference: String, config: String },

    #[error("build {build} failed at step '{step}': {diagnostic}")]
    ExecutionFailure {
        build: String,
        step: String,
        diagnostic: String,
    },

    #[error("invalid transition for build {build}: {from} -> {to}")]
    InvalidTransition {
        build: String,
        from: String,
        to: String,
    },

    #[error("host '{host}' does not own build {build} (owner: {owner})")]
    NotOwner {
        build: String,
        host: String,
        owner: String,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(StorageError),
}

impl From<StorageError> for RunwayError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::InvalidTransition {
                entity: "build",
                id,
                from,
                to,
            } => RunwayError::InvalidTransition {
                build: id,
                from,
                to,
            },
            other => RunwayError::Storage(other),
        }
    }
}

/// Result type for Runway domain operations.
pub type Result<T> = std::result::Result<T, RunwayError>;
