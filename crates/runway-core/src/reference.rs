//! Reference build resolution.
//!
//! A reference build is the most recent completed root build that represents
//! the nightly (or weekly) state of a version for a given trigger. Two
//! resolvers answer the question:
//! - [`LatestDoneResolver`] walks the done batches of the version's base
//!   bundle, newest first. Used when planning a batch.
//! - [`PinnedResolver`] answers only from a fixed set of builds, normally the
//!   planned `builds_reference_ids` of the build being expanded.

use std::sync::Arc;

use async_trait::async_trait;
use runway_state::{BatchState, Build, BuildId, BuildState, CiStore, TriggerId, Version};
use tracing::debug;

use crate::error::Result;

#[async_trait]
pub trait ReferenceResolver: Send + Sync {
    /// Completed root build of `trigger` for `version`, if any.
    async fn resolve(&self, version: &Version, trigger: TriggerId) -> Result<Option<Build>>;
}

/// Store-backed resolver over the done batches of base bundles.
pub struct LatestDoneResolver {
    store: Arc<dyn CiStore>,
    project: String,
}

impl LatestDoneResolver {
    pub fn new(store: Arc<dyn CiStore>, project: impl Into<String>) -> Self {
        Self {
            store,
            project: project.into(),
        }
    }
}

#[async_trait]
impl ReferenceResolver for LatestDoneResolver {
    async fn resolve(&self, version: &Version, trigger: TriggerId) -> Result<Option<Build>> {
        let bundles = self.store.list_bundles(&self.project).await?;
        let Some(base) = bundles
            .into_iter()
            .find(|b| b.is_base && b.version_id == version.version_id)
        else {
            debug!(version = %version.name, "no base bundle for version");
            return Ok(None);
        };

        for batch in self.store.list_batches(base.bundle_id, None).await? {
            if batch.state != BatchState::Done {
                continue;
            }
            let Some(slot) = batch.slot_for(trigger) else {
                continue;
            };
            let build = self.store.get_build(slot.build_id).await?;
            if build.state == BuildState::Done {
                return Ok(Some(build));
            }
        }
        Ok(None)
    }
}

/// Resolver restricted to a fixed set of builds.
#[derive(Debug, Clone, Default)]
pub struct PinnedResolver {
    builds: Vec<Build>,
}

impl PinnedResolver {
    /// Load the given ids from the store.
    pub async fn load(
        store: &dyn CiStore,
        ids: impl IntoIterator<Item = BuildId>,
    ) -> Result<Self> {
        let mut builds = Vec::new();
        for id in ids {
            builds.push(store.get_build(id).await?);
        }
        Ok(Self { builds })
    }
}

#[async_trait]
impl ReferenceResolver for PinnedResolver {
    async fn resolve(&self, version: &Version, trigger: TriggerId) -> Result<Option<Build>> {
        Ok(self
            .builds
            .iter()
            .filter(|b| b.state == BuildState::Done)
            .filter(|b| b.params.version_id == version.version_id && b.params.trigger_id == trigger)
            .max_by_key(|b| b.build_id)
            .cloned())
    }
}
