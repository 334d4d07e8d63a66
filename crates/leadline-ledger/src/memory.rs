use std::cmp::Reverse;
use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use leadline_core::{ChangeEvent, ChangeKind, ContactRecord, RecordId, RecordPatch};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    ChangeSubscription, EventMask, LedgerAccessor, LedgerError, LedgerFilter, LedgerPage,
    LedgerQuery, LedgerSort,
};

/// Same per-request row ceiling the hosted ledger enforces.
const DEFAULT_MAX_ROWS_PER_REQUEST: usize = 1000;

/// Process-local ledger used by tests and offline demos. Mirrors the hosted
/// ledger's contract, including its per-request row ceiling, and can be told
/// to fail queries or reject writes for specific ids.
#[derive(Debug)]
pub struct InMemoryLedger {
    state: Mutex<MemoryState>,
    changes: broadcast::Sender<ChangeEvent>,
    max_rows_per_request: usize,
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: BTreeMap<RecordId, ContactRecord>,
    failing_queries: usize,
    rejected_ids: HashSet<RecordId>,
    calls: CallCounts,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub queries: usize,
    pub updates: usize,
    pub deletes: usize,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedger {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(1024);
        Self {
            state: Mutex::new(MemoryState::default()),
            changes,
            max_rows_per_request: DEFAULT_MAX_ROWS_PER_REQUEST,
        }
    }

    pub fn with_max_rows_per_request(mut self, max_rows: usize) -> Self {
        self.max_rows_per_request = max_rows.max(1);
        self
    }

    pub async fn with_records(self, records: impl IntoIterator<Item = ContactRecord>) -> Self {
        {
            let mut state = self.state.lock().await;
            for record in records {
                state.rows.insert(record.id, record);
            }
        }
        self
    }

    /// Ingestion path: stores the row and announces it to subscribers.
    pub async fn insert(&self, record: ContactRecord) {
        let id = record.id;
        self.state.lock().await.rows.insert(id, record);
        self.announce(ChangeKind::Insert, id);
    }

    pub async fn get(&self, id: RecordId) -> Option<ContactRecord> {
        self.state.lock().await.rows.get(&id).cloned()
    }

    pub async fn ids(&self) -> Vec<RecordId> {
        self.state.lock().await.rows.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn fail_next_queries(&self, count: usize) {
        self.state.lock().await.failing_queries = count;
    }

    pub async fn reject_writes_for(&self, ids: impl IntoIterator<Item = RecordId>) {
        self.state.lock().await.rejected_ids.extend(ids);
    }

    pub async fn calls(&self) -> CallCounts {
        self.state.lock().await.calls
    }

    pub fn subscriber_count(&self) -> usize {
        self.changes.receiver_count()
    }

    fn announce(&self, kind: ChangeKind, id: RecordId) {
        // No receivers is fine.
        let _ = self.changes.send(ChangeEvent {
            kind,
            record_id: Some(id),
        });
    }
}

fn matches_filter(record: &ContactRecord, filter: &LedgerFilter) -> bool {
    if let Some(needle) = &filter.phone_contains {
        if !record
            .phone
            .to_lowercase()
            .contains(&needle.to_lowercase())
        {
            return false;
        }
    }
    filter.status.map_or(true, |status| record.status == status)
}

fn sort_rows(rows: &mut [ContactRecord], sort: LedgerSort) {
    match sort {
        LedgerSort::CreatedAtDesc => rows.sort_by_key(|r| Reverse(r.created_at)),
        LedgerSort::StatusDescCreatedAtDesc => {
            rows.sort_by_key(|r| (Reverse(r.status.as_str()), Reverse(r.created_at)))
        }
    }
}

#[async_trait]
impl LedgerAccessor for InMemoryLedger {
    async fn query(&self, query: &LedgerQuery) -> Result<LedgerPage, LedgerError> {
        let mut state = self.state.lock().await;
        state.calls.queries += 1;
        if state.failing_queries > 0 {
            state.failing_queries -= 1;
            return Err(LedgerError::Connection("injected query failure".into()));
        }

        let mut rows = state
            .rows
            .values()
            .filter(|r| matches_filter(r, &query.filter))
            .cloned()
            .collect::<Vec<_>>();
        let total_count = rows.len();
        sort_rows(&mut rows, query.sort);

        let limit = query.range.limit.min(self.max_rows_per_request);
        let records = rows
            .into_iter()
            .skip(query.range.offset)
            .take(limit)
            .collect::<Vec<_>>();
        Ok(LedgerPage {
            records,
            total_count,
        })
    }

    async fn update(&self, id: RecordId, patch: &RecordPatch) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        state.calls.updates += 1;
        if state.rejected_ids.contains(&id) {
            return Err(LedgerError::Rejected {
                id,
                reason: "write rejected".into(),
            });
        }
        let Some(row) = state.rows.get_mut(&id) else {
            debug!(record_id = id, "update matched no row");
            return Ok(());
        };
        row.apply_patch(patch);
        drop(state);
        self.announce(ChangeKind::Update, id);
        Ok(())
    }

    async fn delete(&self, ids: &[RecordId]) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        state.calls.deletes += 1;
        if let Some(id) = ids.iter().find(|id| state.rejected_ids.contains(*id)) {
            return Err(LedgerError::Rejected {
                id: *id,
                reason: "delete rejected".into(),
            });
        }
        let removed = ids
            .iter()
            .filter(|id| state.rows.remove(*id).is_some())
            .copied()
            .collect::<Vec<_>>();
        drop(state);
        for id in removed {
            self.announce(ChangeKind::Delete, id);
        }
        Ok(())
    }

    async fn subscribe(&self, mask: EventMask) -> Result<ChangeSubscription, LedgerError> {
        let mut feed = self.changes.subscribe();
        let (tx, rx) = mpsc::channel(256);
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    received = feed.recv() => match received {
                        Ok(event) => {
                            if mask.accepts(event.kind) && tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(skipped, "in-memory change feed lagged");
                            let resync = ChangeEvent { kind: ChangeKind::Update, record_id: None };
                            if tx.send(resync).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });

        Ok(ChangeSubscription::new(rx, cancel))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{LedgerRange, SNAPSHOT_BATCH_SIZE};
    use chrono::{TimeZone, Utc};
    use leadline_core::CallStatus;

    fn rec(id: RecordId, phone: &str, minute: u32, status: CallStatus) -> ContactRecord {
        ContactRecord {
            id,
            phone: phone.into(),
            hotel_name: "Sahil Otel".into(),
            message: None,
            classification: None,
            status,
            created_at: Utc
                .with_ymd_and_hms(2026, 3, 1, 9, minute, 0)
                .single()
                .expect("ts"),
            updated_by: None,
            updated_at: None,
        }
    }

    #[tokio::test]
    async fn query_applies_filter_sort_and_range() {
        let ledger = InMemoryLedger::new()
            .with_records(vec![
                rec(1, "5551", 1, CallStatus::Called),
                rec(2, "5552", 2, CallStatus::NotCalled),
                rec(3, "6661", 3, CallStatus::NotCalled),
                rec(4, "5553", 4, CallStatus::Called),
            ])
            .await;

        let page = ledger
            .query(&LedgerQuery {
                filter: LedgerFilter {
                    phone_contains: Some("555".into()),
                    status: None,
                },
                sort: LedgerSort::StatusDescCreatedAtDesc,
                range: LedgerRange::new(0, 2),
            })
            .await
            .expect("query");

        assert_eq!(page.total_count, 3);
        let ids = page.records.iter().map(|r| r.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![2, 4]);
    }

    #[tokio::test]
    async fn row_ceiling_caps_large_requests() {
        let ledger = InMemoryLedger::new()
            .with_max_rows_per_request(3)
            .with_records((1..=5).map(|i| rec(i, "555", i as u32, CallStatus::NotCalled)))
            .await;
        let page = ledger
            .query(&LedgerQuery::snapshot_batch(0, SNAPSHOT_BATCH_SIZE))
            .await
            .expect("query");
        assert_eq!(page.records.len(), 3);
        assert_eq!(page.total_count, 5);
        assert_eq!(page.records[0].id, 5);
    }

    #[tokio::test]
    async fn deleting_missing_ids_is_a_noop() {
        let ledger = InMemoryLedger::new()
            .with_records(vec![rec(1, "555", 1, CallStatus::NotCalled)])
            .await;
        ledger.delete(&[1, 99]).await.expect("first delete");
        ledger.delete(&[1]).await.expect("repeat delete");
        assert!(ledger.is_empty().await);
    }

    #[tokio::test]
    async fn rejected_ids_fail_the_whole_delete_call() {
        let ledger = InMemoryLedger::new()
            .with_records(vec![
                rec(1, "555", 1, CallStatus::NotCalled),
                rec(2, "555", 2, CallStatus::NotCalled),
            ])
            .await;
        ledger.reject_writes_for([2]).await;
        let err = ledger.delete(&[1, 2]).await.expect_err("rejected");
        assert!(matches!(err, LedgerError::Rejected { id: 2, .. }));
        assert_eq!(ledger.len().await, 2);
    }

    #[tokio::test]
    async fn subscription_receives_masked_events_until_released() {
        let ledger = InMemoryLedger::new();
        let mut sub = ledger
            .subscribe(EventMask {
                insert: true,
                update: false,
                delete: true,
            })
            .await
            .expect("subscribe");

        ledger.insert(rec(7, "555", 1, CallStatus::NotCalled)).await;
        ledger
            .update(7, &RecordPatch { message: Some("x".into()), ..RecordPatch::default() })
            .await
            .expect("update");
        ledger.delete(&[7]).await.expect("delete");

        let first = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("first event")
            .expect("open");
        let second = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("second event")
            .expect("open");
        assert_eq!(first.kind, ChangeKind::Insert);
        assert_eq!(second.kind, ChangeKind::Delete);

        sub.unsubscribe();
        assert!(sub.recv().await.is_none());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ledger.subscriber_count(), 0);
    }
}
