//! SurrealDB connection settings
//!
//! Resolution order used by [`crate::SurrealStore::from_env`]:
//! 1. `SURREALDB_ENDPOINT` + `SURREALDB_USERNAME` + `SURREALDB_PASSWORD`
//!    (authenticated server, `SURREALDB_ROOT=true` for a root user)
//! 2. `SURREALDB_URL` (any engine URL, e.g. `mem://` or `surrealkv://path`)
//! 3. local `surrealkv://.runway/db`

use std::path::PathBuf;

use surrealdb::engine::any::Any;
use surrealdb::opt::auth::{Database, Root};
use surrealdb::Surreal;
use tracing::info;

use crate::error::StateError;

pub const DEFAULT_NAMESPACE: &str = "runway";
pub const DEFAULT_DATABASE: &str = "main";
pub const DEFAULT_LOCAL_PATH: &str = ".runway/db";

/// Credentials for an authenticated server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAuth {
    pub username: String,
    pub password: String,
    /// Sign in as a root user instead of a database user.
    pub root: bool,
}

/// Where the store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreSettings {
    Server {
        endpoint: String,
        auth: ServerAuth,
        namespace: String,
        database: String,
    },
    Url(String),
    Local(PathBuf),
}

impl StoreSettings {
    /// Resolve from the process environment.
    pub fn from_env() -> Self {
        Self::resolve(|key| std::env::var(key).ok())
    }

    /// Resolve with `lookup` standing in for the environment.
    pub fn resolve(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let server = (
            lookup("SURREALDB_ENDPOINT"),
            lookup("SURREALDB_USERNAME"),
            lookup("SURREALDB_PASSWORD"),
        );
        if let (Some(endpoint), Some(username), Some(password)) = server {
            return StoreSettings::Server {
                endpoint,
                auth: ServerAuth {
                    username,
                    password,
                    root: lookup("SURREALDB_ROOT").is_some_and(|v| v.eq_ignore_ascii_case("true")),
                },
                namespace: lookup("SURREALDB_NAMESPACE")
                    .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
                database: lookup("SURREALDB_DATABASE")
                    .unwrap_or_else(|| DEFAULT_DATABASE.to_string()),
            };
        }
        if let Some(url) = lookup("SURREALDB_URL") {
            return StoreSettings::Url(url);
        }
        StoreSettings::Local(PathBuf::from(DEFAULT_LOCAL_PATH))
    }

    /// Connect and select the namespace and database.
    pub async fn connect(&self) -> crate::Result<Surreal<Any>> {
        match self {
            StoreSettings::Server {
                endpoint,
                auth,
                namespace,
                database,
            } => connect_server(endpoint, auth, namespace, database).await,
            StoreSettings::Url(url) => {
                info!(url = %url, "connecting to SurrealDB");
                connect_url(url).await
            }
            StoreSettings::Local(path) => {
                std::fs::create_dir_all(path).map_err(|e| {
                    StateError::Connection(format!(
                        "cannot create database directory {}: {e}",
                        path.display()
                    ))
                })?;
                let url = format!("surrealkv://{}", path.display());
                info!(url = %url, "no server configured, using local persistence");
                connect_url(&url).await
            }
        }
    }
}

async fn connect_server(
    endpoint: &str,
    auth: &ServerAuth,
    namespace: &str,
    database: &str,
) -> crate::Result<Surreal<Any>> {
    let db = surrealdb::engine::any::connect(endpoint)
        .await
        .map_err(|e| StateError::Connection(format!("cannot reach {endpoint}: {e}")))?;

    let signin = if auth.root {
        db.signin(Root {
            username: &auth.username,
            password: &auth.password,
        })
        .await
    } else {
        db.signin(Database {
            namespace,
            database,
            username: &auth.username,
            password: &auth.password,
        })
        .await
    };
    signin.map_err(|e| StateError::Connection(format!("sign-in as {} failed: {e}", auth.username)))?;

    db.use_ns(namespace)
        .use_db(database)
        .await
        .map_err(|e| StateError::Connection(e.to_string()))?;

    info!(endpoint = %endpoint, namespace = %namespace, "connected to SurrealDB server");
    Ok(db)
}

/// Connect to an unauthenticated engine URL and select the default
/// namespace/database.
pub async fn connect_url(url: &str) -> crate::Result<Surreal<Any>> {
    let db = surrealdb::engine::any::connect(url)
        .await
        .map_err(|e| StateError::Connection(format!("cannot connect to {url}: {e}")))?;

    db.use_ns(DEFAULT_NAMESPACE)
        .use_db(DEFAULT_DATABASE)
        .await
        .map_err(|e| StateError::Connection(e.to_string()))?;

    Ok(db)
}
