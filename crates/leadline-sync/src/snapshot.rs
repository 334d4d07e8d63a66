use std::collections::HashSet;

use leadline_core::ContactRecord;
use leadline_ledger::{LedgerAccessor, LedgerQuery, SNAPSHOT_BATCH_SIZE};
use tracing::{debug, warn};

/// Stops a runaway fetch against a table that keeps growing under us.
pub const DEFAULT_MAX_BATCHES: usize = 100;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub records: Vec<ContactRecord>,
    pub batches: usize,
    /// The last batch came back short, so nothing was left unread.
    pub complete: bool,
    pub failures: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotFetcher {
    batch_size: usize,
    max_batches: usize,
}

impl Default for SnapshotFetcher {
    fn default() -> Self {
        Self::new(SNAPSHOT_BATCH_SIZE, DEFAULT_MAX_BATCHES)
    }
}

impl SnapshotFetcher {
    /// `batch_size` must not exceed the ledger's per-request row ceiling,
    /// otherwise the first capped batch reads as the last one.
    pub fn new(batch_size: usize, max_batches: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            max_batches: max_batches.max(1),
        }
    }

    /// Pulls the table newest-first in fixed-size batches. A failed batch ends
    /// the fetch; whatever was read before it is kept.
    pub async fn fetch(&self, ledger: &dyn LedgerAccessor) -> Snapshot {
        let mut snapshot = Snapshot::default();
        let mut seen = HashSet::new();
        let mut offset = 0usize;

        loop {
            if snapshot.batches >= self.max_batches {
                warn!(
                    batches = snapshot.batches,
                    rows = snapshot.records.len(),
                    "snapshot safety cap reached; aggregating partial data"
                );
                break;
            }

            let query = LedgerQuery::snapshot_batch(offset, self.batch_size);
            let page = match ledger.query(&query).await {
                Ok(page) => page,
                Err(err) => {
                    warn!(error = %err, offset, "snapshot batch failed; keeping rows read so far");
                    snapshot.failures += 1;
                    break;
                }
            };

            snapshot.batches += 1;
            let fetched = page.records.len();
            offset += fetched;
            // Offsets shift when rows are inserted mid-fetch; skip repeats.
            snapshot
                .records
                .extend(page.records.into_iter().filter(|r| seen.insert(r.id)));

            if fetched < self.batch_size {
                snapshot.complete = true;
                break;
            }
        }

        debug!(
            rows = snapshot.records.len(),
            batches = snapshot.batches,
            complete = snapshot.complete,
            "snapshot fetched"
        );
        snapshot
    }
}
