//! Build lifecycle: host claims, completion and the transitive terminal check
//! used to close batches.
//!
//! Every transition goes through the per-build lock and then the store, which
//! rejects illegal edges. Running builds can only be completed or failed by
//! the host that claimed them.

use std::collections::VecDeque;
use std::sync::Arc;

use runway_state::{Build, BuildId, BuildState, BuildTransition, CiStore};
use tracing::debug;

use crate::error::{Result, RunwayError};
use crate::locks::BuildLocks;
use crate::obs;

/// Outcome of a claim attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The build is now running on the claiming host.
    Claimed(Build),
    /// The build restores a dump that is not done yet.
    Waiting,
    /// The dump the build restores ended in error or was skipped; the build
    /// was moved to `error` without running.
    Failed(Build),
}

pub struct BuildLifecycle {
    store: Arc<dyn CiStore>,
    locks: Arc<BuildLocks>,
}

impl BuildLifecycle {
    pub fn new(store: Arc<dyn CiStore>, locks: Arc<BuildLocks>) -> Self {
        Self { store, locks }
    }

    /// `draft -> pending`.
    pub async fn promote(&self, id: BuildId) -> Result<Build> {
        let _guard = self.locks.lock(id).await;
        self.transition(id, BuildTransition::to(BuildState::Pending))
            .await
    }

    /// `pending -> running` on `host`, once the build's dump (if any) is done.
    pub async fn claim(&self, id: BuildId, host: &str) -> Result<Claim> {
        let _guard = self.locks.lock(id).await;
        let build = self.store.get_build(id).await?;
        if build.state != BuildState::Pending {
            return Err(RunwayError::InvalidTransition {
                build: id.to_string(),
                from: build.state.to_string(),
                to: BuildState::Running.to_string(),
            });
        }

        if let Some(dump_id) = build.params.dump_build {
            let dump = self.store.get_build(dump_id).await?;
            match dump.state {
                BuildState::Done => {}
                BuildState::Error | BuildState::Skipped => {
                    let diagnostic = format!("dump build {dump_id} ended in {}", dump.state);
                    let failed = self
                        .transition(
                            id,
                            BuildTransition::to(BuildState::Error).with_diagnostic(diagnostic),
                        )
                        .await?;
                    return Ok(Claim::Failed(failed));
                }
                other => {
                    debug!(build = %id, dump = %dump_id, dump_state = %other, "waiting for dump build");
                    return Ok(Claim::Waiting);
                }
            }
        }

        let claimed = self
            .transition(id, BuildTransition::to(BuildState::Running).with_host(host))
            .await?;
        Ok(Claim::Claimed(claimed))
    }

    /// `running -> done`, by the owning host.
    pub async fn complete(&self, id: BuildId, host: &str) -> Result<Build> {
        let _guard = self.locks.lock(id).await;
        self.check_owner(id, host).await?;
        self.transition(id, BuildTransition::to(BuildState::Done))
            .await
    }

    /// `running -> error` with a diagnostic, by the owning host.
    pub async fn fail(&self, id: BuildId, host: &str, diagnostic: &str) -> Result<Build> {
        let _guard = self.locks.lock(id).await;
        self.check_owner(id, host).await?;
        self.transition(
            id,
            BuildTransition::to(BuildState::Error).with_diagnostic(diagnostic),
        )
        .await
    }

    /// `draft | pending -> skipped`.
    pub async fn skip(&self, id: BuildId) -> Result<Build> {
        let _guard = self.locks.lock(id).await;
        self.transition(id, BuildTransition::to(BuildState::Skipped))
            .await
    }

    /// Whether the build and every build below it are terminal.
    pub async fn is_transitively_terminal(&self, id: BuildId) -> Result<bool> {
        let mut queue = VecDeque::from([self.store.get_build(id).await?]);
        while let Some(build) = queue.pop_front() {
            if !build.state.is_terminal() {
                return Ok(false);
            }
            queue.extend(self.store.children_of(build.build_id).await?);
        }
        Ok(true)
    }

    async fn check_owner(&self, id: BuildId, host: &str) -> Result<()> {
        let build = self.store.get_build(id).await?;
        match build.host.as_deref() {
            Some(owner) if build.state == BuildState::Running && owner != host => {
                Err(RunwayError::NotOwner {
                    build: id.to_string(),
                    host: host.to_string(),
                    owner: owner.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    async fn transition(&self, id: BuildId, transition: BuildTransition) -> Result<Build> {
        let before = self.store.get_build(id).await?.state;
        let to = transition.to;
        let build = self.store.set_build_state(id, transition).await?;
        obs::emit_build_transition(id, before, to, build.host.as_deref());
        Ok(build)
    }
}
