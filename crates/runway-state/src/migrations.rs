//! SurrealDB schema initialization
//!
//! Every table shares one row shape (see `surreal_store::DocRow`): an integer
//! `key`, optional lookup columns and a JSON `body`. The lookup columns are
//! indexed here; uniqueness of names is enforced by the store before insert.
//! Keys come from the shared `counters:keys` record so every handle on the
//! database draws from one sequence.

use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Tables created by [`init_schema`].
pub const TABLES: &[&str] = &[
    "versions",
    "bundles",
    "configs",
    "steps",
    "triggers",
    "builds",
    "databases",
    "batches",
];

/// Initialize all Runway tables.
///
/// Safe to call multiple times (idempotent).
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing Runway SurrealDB schema");

    for table in TABLES {
        init_table(db, table).await?;
    }
    db.query("DEFINE TABLE IF NOT EXISTS counters SCHEMALESS;")
        .await?;

    info!("Runway schema initialization complete");
    Ok(())
}

/// Schema:
/// ```text
/// TABLE <name> {
///   key:     INT (unique, allocated by the store)
///   name:    STRING? (version/config/step name, build fingerprint, category)
///   scope:   STRING? (project for bundles and triggers)
///   parent:  INT? (parent build, owning build of a database, bundle of a batch)
///   body:    STRING (JSON encoding of the record)
/// }
/// ```
async fn init_table(db: &Surreal<Any>, table: &str) -> Result<()> {
    debug!(table, "Initializing table");

    let sql = format!(
        r#"
        DEFINE TABLE IF NOT EXISTS {table} SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_{table}_key ON TABLE {table} COLUMNS key UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_{table}_name ON TABLE {table} COLUMNS scope, name;
        DEFINE INDEX IF NOT EXISTS idx_{table}_parent ON TABLE {table} COLUMNS parent;
    "#
    );

    db.query(sql).await?;
    Ok(())
}
