//! Refresh orchestration for the call desk: duplicate cleanup, field
//! normalization, dashboard statistics and the trigger loop that keeps them
//! current.

use std::sync::Arc;

use anyhow::{Context, Result};
use leadline_core::{DashboardBundle, SystemClock};
use leadline_ledger::PgLedger;

pub mod config;
pub mod coordinator;
pub mod dedup;
pub mod normalize;
pub mod pipeline;
pub mod session;
pub mod snapshot;
pub mod stats;

pub use config::RefreshConfig;
pub use coordinator::{
    CoordinatorConfig, RefreshCoordinator, RefreshCycle, TriggerSource, TriggerStats,
};
pub use dedup::{DedupOutcome, DedupPlan, DedupReconciler};
pub use normalize::{AskKind, FieldNormalizer, NormalizeOutcome, NormalizerRules};
pub use pipeline::{DisplayQuery, RefreshPipeline, SessionContext, StatusUpdateError};
pub use session::DashboardSession;
pub use snapshot::{Snapshot, SnapshotFetcher};
pub use stats::StatsAggregator;

pub const CRATE_NAME: &str = "leadline-sync";

pub async fn connect_ledger(config: &RefreshConfig) -> Result<PgLedger> {
    let url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL is not set")?;
    PgLedger::connect(url)
        .await
        .context("connecting to the contact ledger")
}

/// Runs a single refresh cycle against the configured database and returns
/// its bundle.
pub async fn run_refresh_once_from_env() -> Result<DashboardBundle> {
    let config = RefreshConfig::from_env();
    let rules = NormalizerRules::from_workspace_root(&config.workspace_root)?;
    let ledger = connect_ledger(&config).await?;
    let session = SessionContext::new(config.operator.clone(), Arc::new(SystemClock));
    let pipeline = RefreshPipeline::new(Arc::new(ledger), session, rules, &config);
    Ok(pipeline.run(1).await)
}

/// Starts a live session against the configured database.
pub async fn start_session_from_env() -> Result<DashboardSession> {
    let config = RefreshConfig::from_env();
    let rules = NormalizerRules::from_workspace_root(&config.workspace_root)?;
    let ledger = connect_ledger(&config).await?;
    let session = SessionContext::new(config.operator.clone(), Arc::new(SystemClock));
    Ok(DashboardSession::start(Arc::new(ledger), session, rules, &config).await)
}
