//! Structured events for batch preparation, build transitions and upgrade
//! expansion.
//!
//! Events are emitted at `info!` (or `warn!` for degraded outcomes) with an
//! `event` field naming them, so they can be filtered with `RUNWAY_LOG` and
//! picked out of JSON logs.

use runway_state::{BatchId, BuildId, BuildState, BundleId, Category, TriggerId};
use tracing::{info, warn};

/// Span wrapping everything done on behalf of one build. Attach it with
/// `tracing::Instrument::instrument` so it survives across awaits.
pub fn build_span(build: BuildId) -> tracing::Span {
    tracing::info_span!("runway.build", build = %build)
}

pub fn emit_batch_prepared(
    batch: BatchId,
    bundle: BundleId,
    category: Category,
    slots: usize,
    created: usize,
) {
    info!(
        event = "batch.prepared",
        batch = %batch,
        bundle = %bundle,
        category = %category,
        slots,
        created,
    );
}

pub fn emit_build_transition(build: BuildId, from: BuildState, to: BuildState, host: Option<&str>) {
    info!(
        event = "build.transition",
        build = %build,
        from = %from,
        to = %to,
        host = host.unwrap_or("-"),
    );
}

pub fn emit_upgrade_expanded(parent: BuildId, pairs: usize, created: usize, skipped: usize) {
    info!(
        event = "upgrade.expanded",
        parent = %parent,
        pairs,
        created,
        skipped,
    );
}

pub fn emit_reference_missing(version: &str, trigger: TriggerId) {
    warn!(event = "upgrade.reference_missing", version = %version, trigger = %trigger);
}

pub fn emit_dump_mismatch(reference: BuildId, db_name: &str, from: &str, to: &str) {
    warn!(
        event = "upgrade.dump_mismatch",
        reference = %reference,
        db_name = %db_name,
        from = %from,
        to = %to,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_span_create() {
        let _entered = build_span(BuildId(12)).entered();
    }
}
