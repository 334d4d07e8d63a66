use std::sync::Arc;

use leadline_core::{CallStatus, DashboardBundle, Operator, RecordId};
use leadline_ledger::{EventMask, LedgerAccessor};
use tokio::sync::watch;
use tracing::warn;

use crate::config::RefreshConfig;
use crate::coordinator::{RefreshCoordinator, RefreshCycle, TriggerStats};
use crate::normalize::NormalizerRules;
use crate::pipeline::{DisplayQuery, RefreshPipeline, SessionContext, StatusUpdateError};

/// One operator's live dashboard: the refresh loop plus the write path.
pub struct DashboardSession {
    pipeline: Arc<RefreshPipeline>,
    coordinator: RefreshCoordinator,
}

impl DashboardSession {
    /// Subscribes to ledger changes and starts the refresh loop. A failed
    /// subscription leaves the session running on poll ticks alone.
    pub async fn start(
        ledger: Arc<dyn LedgerAccessor>,
        session: SessionContext,
        rules: NormalizerRules,
        config: &RefreshConfig,
    ) -> Self {
        let subscription = match ledger.subscribe(EventMask::ALL).await {
            Ok(subscription) => Some(subscription),
            Err(err) => {
                warn!(error = %err, "change subscription unavailable; polling only");
                None
            }
        };
        let pipeline = Arc::new(RefreshPipeline::new(ledger, session, rules, config));
        let cycle: Arc<dyn RefreshCycle> = pipeline.clone();
        let coordinator = RefreshCoordinator::spawn(cycle, subscription, config.coordinator());
        Self {
            pipeline,
            coordinator,
        }
    }

    pub fn operator(&self) -> Option<&Operator> {
        self.pipeline.session().operator.as_ref()
    }

    pub fn latest(&self) -> Option<Arc<DashboardBundle>> {
        self.coordinator.latest()
    }

    pub fn watch(&self) -> watch::Receiver<Option<Arc<DashboardBundle>>> {
        self.coordinator.watch()
    }

    pub fn trigger_stats(&self) -> TriggerStats {
        self.coordinator.stats()
    }

    pub fn request_refresh(&self) -> bool {
        self.coordinator.request_refresh()
    }

    /// Persists the new status, shows it in the current bundle right away and
    /// queues a refresh so the aggregates catch up.
    pub async fn update_status(
        &self,
        id: RecordId,
        status: CallStatus,
    ) -> Result<(), StatusUpdateError> {
        let patch = self.pipeline.update_status(id, status).await?;
        self.coordinator.amend_latest(|bundle| {
            for record in bundle.records.iter_mut().filter(|r| r.id == id) {
                record.apply_patch(&patch);
            }
        });
        self.coordinator.request_refresh();
        Ok(())
    }

    pub async fn display_query(&self) -> DisplayQuery {
        self.pipeline.display_query().await
    }

    pub async fn set_display_query(&self, query: DisplayQuery) {
        self.pipeline.set_display_query(query).await;
        self.coordinator.request_refresh();
    }

    pub async fn shutdown(&self) {
        self.coordinator.shutdown().await;
    }
}
