//! Per-build async lock table.
//!
//! Every mutation of a build (claim, transition, child expansion) takes the
//! build's lock first. Locks are created on demand and never removed; the
//! table holds one small `Arc<Mutex<()>>` per build touched by this process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use runway_state::BuildId;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug, Default)]
pub struct BuildLocks {
    table: Mutex<HashMap<BuildId, Arc<AsyncMutex<()>>>>,
}

impl BuildLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `build`.
    pub async fn lock(&self, build: BuildId) -> OwnedMutexGuard<()> {
        let entry = {
            let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            table.entry(build).or_default().clone()
        };
        entry.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_build_is_exclusive() {
        let locks = Arc::new(BuildLocks::new());
        let guard = locks.lock(BuildId(1)).await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock(BuildId(1)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn test_different_builds_do_not_block() {
        let locks = BuildLocks::new();
        let _a = locks.lock(BuildId(1)).await;
        let _b = locks.lock(BuildId(2)).await;
    }
}
