use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use leadline_core::{
    CallStatus, Clock, ContactRecord, CycleReport, DashboardBundle, Operator, RecordId,
    RecordPatch,
};
use leadline_ledger::{
    LedgerAccessor, LedgerError, LedgerFilter, LedgerQuery, LedgerRange, LedgerSort,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, info_span, warn, Instrument};

use crate::config::RefreshConfig;
use crate::coordinator::RefreshCycle;
use crate::dedup::{without_deleted, DedupReconciler};
use crate::normalize::{FieldNormalizer, NormalizerRules};
use crate::snapshot::SnapshotFetcher;
use crate::stats::StatsAggregator;

/// Who is acting and what time it is, passed into every operation instead of
/// being read from globals.
#[derive(Clone)]
pub struct SessionContext {
    pub operator: Option<Operator>,
    pub clock: Arc<dyn Clock>,
}

impl SessionContext {
    pub fn new(operator: Option<Operator>, clock: Arc<dyn Clock>) -> Self {
        Self { operator, clock }
    }
}

/// Which slice of the ledger the presentation layer is looking at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DisplayQuery {
    pub phone_contains: Option<String>,
    pub status: Option<CallStatus>,
    /// 1-based.
    pub page: usize,
}

impl Default for DisplayQuery {
    fn default() -> Self {
        Self {
            phone_contains: None,
            status: None,
            page: 1,
        }
    }
}

impl DisplayQuery {
    pub fn to_ledger_query(&self, page_size: usize) -> LedgerQuery {
        LedgerQuery {
            filter: LedgerFilter {
                phone_contains: self
                    .phone_contains
                    .as_deref()
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string),
                status: self.status,
            },
            sort: LedgerSort::StatusDescCreatedAtDesc,
            range: LedgerRange::page(self.page, page_size),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StatusUpdateError {
    #[error("no operator is signed in")]
    NoOperator,
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

pub fn total_pages(total_count: usize, page_size: usize) -> usize {
    total_count.div_ceil(page_size.max(1))
}

/// One refresh cycle: snapshot, dedup, display page, normalize, aggregate.
pub struct RefreshPipeline {
    ledger: Arc<dyn LedgerAccessor>,
    session: SessionContext,
    snapshot: SnapshotFetcher,
    dedup: DedupReconciler,
    normalizer: FieldNormalizer,
    aggregator: StatsAggregator,
    page_size: usize,
    display: RwLock<DisplayQuery>,
}

impl RefreshPipeline {
    pub fn new(
        ledger: Arc<dyn LedgerAccessor>,
        session: SessionContext,
        rules: NormalizerRules,
        config: &RefreshConfig,
    ) -> Self {
        let rules = Arc::new(rules);
        Self {
            ledger,
            session,
            snapshot: config.snapshot_fetcher(),
            dedup: DedupReconciler::new(config.delete_chunk),
            normalizer: FieldNormalizer::new(Arc::clone(&rules), config.normalize_concurrency),
            aggregator: StatsAggregator::new(rules),
            page_size: config.page_size.max(1),
            display: RwLock::new(DisplayQuery::default()),
        }
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerAccessor> {
        &self.ledger
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub async fn display_query(&self) -> DisplayQuery {
        self.display.read().await.clone()
    }

    pub async fn set_display_query(&self, query: DisplayQuery) {
        *self.display.write().await = query;
    }

    /// Writes the status together with who changed it and when. Returns the
    /// patch so callers can reflect it locally.
    pub async fn update_status(
        &self,
        id: RecordId,
        status: CallStatus,
    ) -> Result<RecordPatch, StatusUpdateError> {
        let operator = self
            .session
            .operator
            .as_ref()
            .ok_or(StatusUpdateError::NoOperator)?;
        let patch = RecordPatch::status_stamp(status, operator, self.session.clock.now());
        self.ledger.update(id, &patch).await?;
        info!(record_id = id, status = %status, operator = %operator.id, "call status updated");
        Ok(patch)
    }

    async fn display_page(&self, report: &mut CycleReport) -> (Vec<ContactRecord>, usize) {
        let query = self.display_query().await.to_ledger_query(self.page_size);
        match self.ledger.query(&query).await {
            Ok(page) => (page.records, page.total_count),
            Err(err) => {
                warn!(error = %err, "display page query failed; showing an empty page");
                report.fetch_failures += 1;
                (Vec::new(), 0)
            }
        }
    }

    pub async fn run(&self, generation: u64) -> DashboardBundle {
        let started_at = self.session.clock.now();
        let mut report = CycleReport::new(generation, started_at);
        let span = info_span!("refresh_cycle", cycle_id = %report.cycle_id, generation);

        async move {
            let fetched = self.snapshot.fetch(self.ledger.as_ref()).await;
            report.batches = fetched.batches;
            report.snapshot_complete = fetched.complete;
            report.fetch_failures += fetched.failures;
            let mut records = fetched.records;

            let dedup = self.dedup.reconcile(self.ledger.as_ref(), &records).await;
            report.duplicates_found = dedup.plan.delete_ids.len();
            report.duplicates_deleted = dedup.deleted.len();
            report.delete_failures = dedup.failed.len();
            without_deleted(&mut records, &dedup.deleted);

            let (mut page, total_count) = self.display_page(&mut report).await;
            let normalized = self
                .normalizer
                .normalize(Arc::clone(&self.ledger), &mut page)
                .await;
            report.normalizer_writes = normalized.applied.len();
            report.normalizer_failures = normalized.failed.len();
            if !normalized.applied.is_empty() {
                let patches = normalized.applied.into_iter().collect::<HashMap<_, _>>();
                for record in records.iter_mut() {
                    if let Some(patch) = patches.get(&record.id) {
                        record.apply_patch(patch);
                    }
                }
            }

            let stats = self
                .aggregator
                .aggregate(&records, self.session.clock.today());
            report.snapshot_rows = records.len();
            report.finished_at = self.session.clock.now();

            info!(
                rows = report.snapshot_rows,
                deleted = report.duplicates_deleted,
                normalized = report.normalizer_writes,
                failures = report.fetch_failures + report.delete_failures + report.normalizer_failures,
                "refresh cycle finished"
            );

            DashboardBundle {
                generation,
                records: page,
                total_count,
                total_pages: total_pages(total_count, self.page_size),
                stats,
                report,
            }
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl RefreshCycle for RefreshPipeline {
    async fn run_cycle(&self, generation: u64) -> DashboardBundle {
        self.run(generation).await
    }
}
