//! Bundle registration and base-bundle resolution.
//!
//! A bundle whose name matches the project's base pattern is a *base*
//! bundle and gets its own version. Any other bundle hangs off the base
//! bundle with the longest name prefixing it (falling back to `master`) and
//! inherits that bundle's version.

use std::collections::BTreeMap;
use std::sync::Arc;

use regex::Regex;
use runway_state::{Bundle, BundleId, CiStore, NewBundle};
use tracing::{debug, info};

use crate::error::{Result, RunwayError, ValidationError};
use crate::lineage::{VersionCatalog, MASTER};

/// Base bundle names: `master`, `13.0`, `saas-13.1`, ...
pub const DEFAULT_BASE_PATTERN: &str = r"^((master)|(saas-)?\d+\.\d+)$";

pub struct BundleRegistry {
    store: Arc<dyn CiStore>,
    catalog: Arc<VersionCatalog>,
    base_pattern: Regex,
}

impl BundleRegistry {
    pub fn new(
        store: Arc<dyn CiStore>,
        catalog: Arc<VersionCatalog>,
        base_pattern: &str,
    ) -> Result<Self> {
        let base_pattern =
            Regex::new(base_pattern).map_err(|e| ValidationError::InvalidPattern {
                pattern: base_pattern.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            store,
            catalog,
            base_pattern,
        })
    }

    pub fn is_base_name(&self, name: &str) -> bool {
        self.base_pattern.is_match(name)
    }

    /// Register a bundle, or refresh the commit heads of an existing one.
    pub async fn register(
        &self,
        project: &str,
        name: &str,
        commits: BTreeMap<String, String>,
    ) -> Result<Bundle> {
        if let Some(existing) = self.store.find_bundle(project, name).await? {
            if existing.commits == commits {
                return Ok(existing);
            }
            debug!(bundle = %name, "updating commit heads");
            return Ok(self
                .store
                .set_bundle_commits(existing.bundle_id, commits)
                .await?);
        }

        let bundle = if self.is_base_name(name) {
            let version = self.catalog.get_or_create(name).await?;
            NewBundle {
                project: project.to_string(),
                name: name.to_string(),
                is_base: true,
                base_id: None,
                version_id: version.version_id,
                commits,
            }
        } else {
            let base = self.base_for(project, name).await?;
            NewBundle {
                project: project.to_string(),
                name: name.to_string(),
                is_base: false,
                base_id: Some(base.bundle_id),
                version_id: base.version_id,
                commits,
            }
        };

        let bundle = self.store.insert_bundle(bundle).await?;
        info!(
            bundle = %bundle.name,
            project = %project,
            is_base = bundle.is_base,
            "bundle registered"
        );
        Ok(bundle)
    }

    /// Base bundle whose name is the longest prefix of `name`, else `master`.
    pub async fn base_for(&self, project: &str, name: &str) -> Result<Bundle> {
        let bases: Vec<Bundle> = self
            .store
            .list_bundles(project)
            .await?
            .into_iter()
            .filter(|b| b.is_base)
            .collect();

        let prefixed = bases
            .iter()
            .filter(|b| name.starts_with(b.name.as_str()))
            .max_by_key(|b| b.name.len());
        if let Some(base) = prefixed {
            return Ok(base.clone());
        }

        bases
            .into_iter()
            .find(|b| b.name == MASTER)
            .ok_or_else(|| {
                RunwayError::Config(format!(
                    "bundle '{name}' has no base bundle and project '{project}' has no master bundle"
                ))
            })
    }

    /// Base bundle of `bundle`: itself when it is a base bundle.
    pub async fn base_of(&self, bundle: &Bundle) -> Result<Bundle> {
        match bundle.base_id {
            Some(base) if !bundle.is_base => Ok(self.store.get_bundle(base).await?),
            _ => Ok(bundle.clone()),
        }
    }

    /// Base bundle carrying `version` in `project`, if any.
    pub async fn base_bundle_for_version(
        &self,
        project: &str,
        version: runway_state::VersionId,
    ) -> Result<Option<Bundle>> {
        Ok(self
            .store
            .list_bundles(project)
            .await?
            .into_iter()
            .find(|b| b.is_base && b.version_id == version))
    }

    pub async fn get(&self, id: BundleId) -> Result<Bundle> {
        Ok(self.store.get_bundle(id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runway_state::MemoryStore;

    async fn registry() -> BundleRegistry {
        let store: Arc<dyn CiStore> = Arc::new(MemoryStore::new());
        let catalog = Arc::new(VersionCatalog::load(store.clone()).await.unwrap());
        BundleRegistry::new(store, catalog, DEFAULT_BASE_PATTERN).unwrap()
    }

    #[tokio::test]
    async fn test_base_names() {
        let r = registry().await;
        assert!(r.is_base_name("master"));
        assert!(r.is_base_name("13.0"));
        assert!(r.is_base_name("saas-13.1"));
        assert!(!r.is_base_name("13.0-fix-invoice"));
        assert!(!r.is_base_name("master-fix-invoice"));
    }

    #[tokio::test]
    async fn test_dev_bundle_inherits_longest_base() {
        let r = registry().await;
        let master = r.register("tests", "master", BTreeMap::new()).await.unwrap();
        let v13 = r.register("tests", "13.0", BTreeMap::new()).await.unwrap();
        let saas = r.register("tests", "saas-13.1", BTreeMap::new()).await.unwrap();

        let fix = r
            .register("tests", "saas-13.1-fix-taxes", BTreeMap::new())
            .await
            .unwrap();
        assert!(!fix.is_base);
        assert_eq!(fix.base_id, Some(saas.bundle_id));
        assert_eq!(fix.version_id, saas.version_id);

        let fix13 = r
            .register("tests", "13.0-fix-invoice", BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(fix13.base_id, Some(v13.bundle_id));

        let feature = r
            .register("tests", "master-new-widget", BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(feature.base_id, Some(master.bundle_id));

        let other = r.register("tests", "dev-thing", BTreeMap::new()).await.unwrap();
        assert_eq!(other.base_id, Some(master.bundle_id));
        assert_eq!(other.version_id, master.version_id);
    }

    #[tokio::test]
    async fn test_register_again_updates_commits() {
        let r = registry().await;
        let first = r.register("tests", "master", BTreeMap::new()).await.unwrap();
        let commits = BTreeMap::from([("server".to_string(), "abc".to_string())]);
        let second = r.register("tests", "master", commits.clone()).await.unwrap();
        assert_eq!(first.bundle_id, second.bundle_id);
        assert_eq!(second.commits, commits);
    }

    #[tokio::test]
    async fn test_invalid_pattern_is_rejected() {
        let store: Arc<dyn CiStore> = Arc::new(MemoryStore::new());
        let catalog = Arc::new(VersionCatalog::load(store.clone()).await.unwrap());
        let err = BundleRegistry::new(store, catalog, "(unclosed").err().unwrap();
        assert!(matches!(
            err,
            RunwayError::Validation(ValidationError::InvalidPattern { .. })
        ));
    }
}
