//! Build runner: claim a pending build, run its configuration's steps in
//! order, and record the outcome.

use std::sync::Arc;

use runway_state::{Build, BuildId, BuildState, CiStore};
use tracing::{debug, info, warn, Instrument};

use crate::error::{Result, RunwayError};
use crate::expansion::ExpansionEngine;
use crate::lifecycle::{BuildLifecycle, Claim};
use crate::lineage::VersionCatalog;
use crate::obs;
use crate::steps::{ExecuteStep, ExecutionHost, StepContext};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Done(Build),
    Failed(Build),
    /// Not claimable yet (its dump build is still running).
    Waiting(BuildId),
}

impl RunOutcome {
    pub fn is_waiting(&self) -> bool {
        matches!(self, RunOutcome::Waiting(_))
    }
}

pub struct BuildRunner {
    store: Arc<dyn CiStore>,
    lifecycle: Arc<BuildLifecycle>,
    catalog: Arc<VersionCatalog>,
    engine: Arc<ExpansionEngine>,
    host: Arc<dyn ExecutionHost>,
}

impl BuildRunner {
    pub fn new(
        store: Arc<dyn CiStore>,
        lifecycle: Arc<BuildLifecycle>,
        catalog: Arc<VersionCatalog>,
        engine: Arc<ExpansionEngine>,
        host: Arc<dyn ExecutionHost>,
    ) -> Self {
        Self {
            store,
            lifecycle,
            catalog,
            engine,
            host,
        }
    }

    /// Claim and run one build to a terminal state.
    ///
    /// Step failures end the build in `error` and are reported through
    /// [`RunOutcome::Failed`]; only lifecycle and storage problems surface as
    /// `Err`.
    pub async fn execute(&self, id: BuildId) -> Result<RunOutcome> {
        self.execute_inner(id).instrument(obs::build_span(id)).await
    }

    async fn execute_inner(&self, id: BuildId) -> Result<RunOutcome> {
        let host = self.host.name();
        let build = match self.lifecycle.claim(id, host).await? {
            Claim::Claimed(build) => build,
            Claim::Waiting => return Ok(RunOutcome::Waiting(id)),
            Claim::Failed(build) => return Ok(RunOutcome::Failed(build)),
        };

        match self.run_steps(&build).await {
            Ok(()) => {
                let done = self.lifecycle.complete(id, host).await?;
                info!(children = done.children.len(), "build done");
                Ok(RunOutcome::Done(done))
            }
            Err(err) => {
                warn!(error = %err, "build failed");
                let failed = self.lifecycle.fail(id, host, &err.to_string()).await?;
                Ok(RunOutcome::Failed(failed))
            }
        }
    }

    async fn run_steps(&self, build: &Build) -> Result<()> {
        let config = self.store.get_config(build.params.config_id).await?;
        let version = self.store.get_version(build.params.version_id).await?;
        let ctx = StepContext {
            store: &self.store,
            catalog: &self.catalog,
            engine: &self.engine,
            host: self.host.as_ref(),
            build,
            version: &version,
        };
        for step_id in &config.steps {
            let step = self.store.get_step(*step_id).await?;
            info!(step = %step.name, job_type = %step.job.job_type(), "running step");
            step.execute(&ctx).await?;
        }
        Ok(())
    }

    /// Run up to `limit` pending builds, oldest first. Builds still waiting on
    /// their dump are left pending and do not count toward the limit. Builds
    /// another host claimed after the pending list was read are skipped.
    pub async fn run_pending(&self, limit: usize) -> Result<Vec<RunOutcome>> {
        let mut outcomes = Vec::new();
        let mut finished = 0;
        for build in self.store.list_builds(BuildState::Pending).await? {
            if finished >= limit {
                break;
            }
            let outcome = match self.execute(build.build_id).await {
                Ok(outcome) => outcome,
                Err(RunwayError::InvalidTransition { from, .. }) => {
                    debug!(build = %build.build_id, state = %from, "claimed elsewhere, skipping");
                    continue;
                }
                Err(err) => return Err(err),
            };
            if !outcome.is_waiting() {
                finished += 1;
            }
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Run pending builds until none can make progress.
    pub async fn drain(&self) -> Result<Vec<RunOutcome>> {
        let mut all = Vec::new();
        loop {
            let outcomes = self.run_pending(usize::MAX).await?;
            let progressed = outcomes.iter().any(|o| !o.is_waiting());
            all.extend(outcomes.into_iter().filter(|o| !o.is_waiting()));
            if !progressed {
                return Ok(all);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{OrchestratorConfig, Runway, StepRequest, DEFAULT_BASE_PATTERN};
    use runway_state::{BuildParams, MemoryStore};
    use std::sync::Mutex;

    const CONFIG: &str = r#"
[scheduler]
project = "tests"

[[configs]]
name = "Install"
steps = ["install"]

[[steps]]
name = "install"
job_type = "install"
command = ["server", "install"]
databases = ["all"]

[[triggers]]
name = "Server"
config = "Install"
repos = ["server"]

[[bundles]]
name = "master"
commits = { server = "abc123" }
"#;

    /// Host that hands control back to the scheduler mid-step.
    struct YieldingHost {
        name: &'static str,
        ran: Mutex<Vec<BuildId>>,
    }

    impl YieldingHost {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                ran: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl ExecutionHost for YieldingHost {
        fn name(&self) -> &str {
            self.name
        }

        async fn run_step(&self, request: &StepRequest<'_>) -> std::result::Result<(), String> {
            tokio::task::yield_now().await;
            self.ran.lock().unwrap().push(request.build.build_id);
            tokio::task::yield_now().await;
            Ok(())
        }
    }

    async fn runway_with_pending(count: usize) -> Runway {
        let store: Arc<dyn CiStore> = Arc::new(MemoryStore::new());
        let runway = Runway::new(store.clone(), DEFAULT_BASE_PATTERN).await.unwrap();
        let config = OrchestratorConfig::from_toml_str(CONFIG).unwrap();
        let applied = runway.apply(&config).await.unwrap();
        let version = store.find_version("master").await.unwrap().unwrap();

        for i in 0..count {
            let mut params = BuildParams::new(
                "tests",
                applied.configs["Install"],
                version.version_id,
                applied.triggers["Server"],
            );
            params.commits.insert("server".into(), format!("commit{i}"));
            store
                .create_build(params, None, BuildState::Pending)
                .await
                .unwrap();
        }
        runway
    }

    #[tokio::test]
    async fn test_two_hosts_share_one_queue() {
        let runway = runway_with_pending(4).await;
        let host_a = YieldingHost::new("a");
        let host_b = YieldingHost::new("b");
        let a = runway.runner(host_a.clone());
        let b = runway.runner(host_b.clone());

        let (from_a, from_b) = tokio::join!(a.run_pending(10), b.run_pending(10));
        let from_a = from_a.unwrap();
        let from_b = from_b.unwrap();

        assert_eq!(from_a.len() + from_b.len(), 4);
        assert!(from_a
            .iter()
            .chain(&from_b)
            .all(|o| matches!(o, RunOutcome::Done(_))));

        let mut ran: Vec<BuildId> = host_a.ran.lock().unwrap().clone();
        ran.extend(host_b.ran.lock().unwrap().iter().copied());
        ran.sort();
        ran.dedup();
        assert_eq!(ran.len(), 4);
        assert!(runway
            .store
            .list_builds(BuildState::Pending)
            .await
            .unwrap()
            .is_empty());
    }

    /// Host whose first step claims `target` for another host, as if a
    /// second runner had taken it after the pending list was read.
    struct RacingHost {
        lifecycle: Arc<BuildLifecycle>,
        target: BuildId,
        ran: Mutex<Vec<BuildId>>,
    }

    #[async_trait::async_trait]
    impl ExecutionHost for RacingHost {
        fn name(&self) -> &str {
            "local"
        }

        async fn run_step(&self, request: &StepRequest<'_>) -> std::result::Result<(), String> {
            let first = {
                let mut ran = self.ran.lock().unwrap();
                ran.push(request.build.build_id);
                ran.len() == 1
            };
            if first {
                self.lifecycle
                    .claim(self.target, "elsewhere")
                    .await
                    .map_err(|e| e.to_string())?;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_build_claimed_elsewhere_is_skipped() {
        let runway = runway_with_pending(3).await;
        let pending = runway.store.list_builds(BuildState::Pending).await.unwrap();
        let host = Arc::new(RacingHost {
            lifecycle: runway.lifecycle.clone(),
            target: pending[1].build_id,
            ran: Mutex::new(Vec::new()),
        });

        let outcomes = runway.runner(host.clone()).run_pending(10).await.unwrap();

        assert_eq!(outcomes.len(), 2);
        assert_eq!(
            *host.ran.lock().unwrap(),
            vec![pending[0].build_id, pending[2].build_id]
        );
        let taken = runway.store.get_build(pending[1].build_id).await.unwrap();
        assert_eq!(taken.state, BuildState::Running);
        assert_eq!(taken.host.as_deref(), Some("elsewhere"));
    }
}
