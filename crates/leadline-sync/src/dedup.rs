//! Duplicate removal per logical lead identity `(phone, hotel_name)`.
//!
//! Within each group of two or more rows exactly one survives:
//! - if any row has a classification, the newest classified row survives;
//! - otherwise the newest row survives.
//!
//! Rows with equal `created_at` keep the one met first in snapshot order, so
//! the outcome depends on the order the ledger returned the snapshot in
//! (newest first by default).

use std::collections::{BTreeMap, HashSet};

use leadline_core::{ContactRecord, RecordId};
use leadline_ledger::LedgerAccessor;
use tracing::{info, warn};

pub const DEFAULT_DELETE_CHUNK: usize = 200;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupPlan {
    pub delete_ids: Vec<RecordId>,
    pub duplicate_groups: usize,
}

impl DedupPlan {
    pub fn is_empty(&self) -> bool {
        self.delete_ids.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupOutcome {
    pub plan: DedupPlan,
    pub deleted: Vec<RecordId>,
    pub failed: Vec<RecordId>,
}

#[derive(Debug, Clone, Copy)]
pub struct DedupReconciler {
    delete_chunk: usize,
}

impl Default for DedupReconciler {
    fn default() -> Self {
        Self::new(DEFAULT_DELETE_CHUNK)
    }
}

/// Newest row; on equal timestamps the earlier row in `rows` wins.
fn newest_first_encountered<'a>(rows: &[&'a ContactRecord]) -> Option<&'a ContactRecord> {
    rows.iter().copied().fold(None, |best, row| match best {
        Some(kept) if kept.created_at >= row.created_at => Some(kept),
        _ => Some(row),
    })
}

impl DedupReconciler {
    pub fn new(delete_chunk: usize) -> Self {
        Self {
            delete_chunk: delete_chunk.max(1),
        }
    }

    pub fn plan(&self, snapshot: &[ContactRecord]) -> DedupPlan {
        let mut by_phone: BTreeMap<&str, BTreeMap<&str, Vec<&ContactRecord>>> = BTreeMap::new();
        for record in snapshot {
            by_phone
                .entry(record.phone.as_str())
                .or_default()
                .entry(record.hotel_name.as_str())
                .or_default()
                .push(record);
        }

        let mut plan = DedupPlan::default();
        for hotels in by_phone.values() {
            for group in hotels.values().filter(|g| g.len() > 1) {
                let (classified, unclassified): (Vec<&ContactRecord>, Vec<&ContactRecord>) =
                    group.iter().copied().partition(|r| r.has_classification());
                let keeper = if classified.is_empty() {
                    newest_first_encountered(&unclassified)
                } else {
                    newest_first_encountered(&classified)
                };
                let Some(keeper) = keeper else {
                    continue;
                };

                plan.duplicate_groups += 1;
                plan.delete_ids.extend(
                    group
                        .iter()
                        .filter(|r| r.id != keeper.id)
                        .map(|r| r.id),
                );
            }
        }
        plan
    }

    /// Plans against `snapshot` and issues the deletes in chunks. A rejected
    /// chunk is logged and skipped; the remaining chunks still go out.
    pub async fn reconcile(
        &self,
        ledger: &dyn LedgerAccessor,
        snapshot: &[ContactRecord],
    ) -> DedupOutcome {
        let plan = self.plan(snapshot);
        let mut outcome = DedupOutcome::default();
        if plan.is_empty() {
            outcome.plan = plan;
            return outcome;
        }

        for chunk in plan.delete_ids.chunks(self.delete_chunk) {
            match ledger.delete(chunk).await {
                Ok(()) => outcome.deleted.extend_from_slice(chunk),
                Err(err) => {
                    warn!(error = %err, ids = chunk.len(), "duplicate delete rejected; continuing");
                    outcome.failed.extend_from_slice(chunk);
                }
            }
        }

        info!(
            groups = plan.duplicate_groups,
            deleted = outcome.deleted.len(),
            failed = outcome.failed.len(),
            "duplicate records removed"
        );
        outcome.plan = plan;
        outcome
    }
}

/// Drops the rows the ledger confirmed deleted.
pub fn without_deleted(snapshot: &mut Vec<ContactRecord>, deleted: &[RecordId]) {
    if deleted.is_empty() {
        return;
    }
    let deleted = deleted.iter().copied().collect::<HashSet<_>>();
    snapshot.retain(|r| !deleted.contains(&r.id));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use leadline_core::CallStatus;
    use leadline_ledger::InMemoryLedger;

    fn rec(id: RecordId, phone: &str, hotel: &str, classification: &str, t: u32) -> ContactRecord {
        ContactRecord {
            id,
            phone: phone.into(),
            hotel_name: hotel.into(),
            message: None,
            classification: Some(classification.to_string()).filter(|c| !c.is_empty()),
            status: CallStatus::NotCalled,
            created_at: Utc
                .with_ymd_and_hms(2026, 3, 1, 9, 0, t)
                .single()
                .expect("ts"),
            updated_by: None,
            updated_at: None,
        }
    }

    #[test]
    fn classified_row_beats_newer_unclassified_rows() {
        let snapshot = vec![
            rec(1, "555", "X", "", 1),
            rec(2, "555", "X", "oda 2 kişilik", 2),
        ];
        let plan = DedupReconciler::default().plan(&snapshot);
        assert_eq!(plan.delete_ids, vec![1]);
        assert_eq!(plan.duplicate_groups, 1);

        let snapshot = vec![
            rec(1, "555", "X", "oda", 1),
            rec(2, "555", "X", "", 5),
        ];
        assert_eq!(DedupReconciler::default().plan(&snapshot).delete_ids, vec![2]);
    }

    #[test]
    fn newest_unclassified_row_survives() {
        let snapshot = vec![rec(1, "555", "X", "", 1), rec(2, "555", "X", "", 2)];
        let plan = DedupReconciler::default().plan(&snapshot);
        assert_eq!(plan.delete_ids, vec![1]);
    }

    #[test]
    fn newest_classified_row_survives_among_several() {
        let snapshot = vec![
            rec(1, "555", "X", "oda fiyatı", 3),
            rec(2, "555", "X", "genel bilgi", 9),
            rec(3, "555", "X", "", 12),
            rec(4, "555", "X", "oda", 4),
        ];
        let mut deleted = DedupReconciler::default().plan(&snapshot).delete_ids;
        deleted.sort_unstable();
        assert_eq!(deleted, vec![1, 3, 4]);
    }

    #[test]
    fn equal_timestamps_keep_first_encountered() {
        let snapshot = vec![
            rec(7, "555", "X", "", 1),
            rec(3, "555", "X", "", 1),
            rec(5, "555", "X", "", 1),
        ];
        let plan = DedupReconciler::default().plan(&snapshot);
        assert_eq!(plan.delete_ids, vec![3, 5]);
    }

    #[test]
    fn same_phone_at_different_hotels_is_not_a_duplicate() {
        let snapshot = vec![
            rec(1, "555", "X", "", 1),
            rec(2, "555", "Y", "", 2),
            rec(3, "556", "X", "", 3),
        ];
        assert!(DedupReconciler::default().plan(&snapshot).is_empty());
    }

    #[test]
    fn one_classified_survivor_per_group_and_second_pass_is_empty() {
        let mut snapshot = vec![
            rec(1, "555", "X", "", 1),
            rec(2, "555", "X", "oda", 2),
            rec(3, "555", "X", "genel", 3),
            rec(4, "777", "Y", "", 4),
            rec(5, "777", "Y", "  ", 5),
            rec(6, "888", "Z", "oda", 6),
        ];
        let reconciler = DedupReconciler::default();
        let plan = reconciler.plan(&snapshot);
        without_deleted(&mut snapshot, &plan.delete_ids);

        let survivors_x = snapshot
            .iter()
            .filter(|r| r.phone == "555" && r.hotel_name == "X")
            .collect::<Vec<_>>();
        assert_eq!(survivors_x.len(), 1);
        assert!(survivors_x[0].has_classification());
        assert_eq!(survivors_x[0].id, 3);

        let survivors_y = snapshot.iter().filter(|r| r.phone == "777").count();
        assert_eq!(survivors_y, 1);

        assert!(reconciler.plan(&snapshot).is_empty());
    }

    #[tokio::test]
    async fn rejected_chunk_does_not_stop_other_chunks() {
        let snapshot = vec![
            rec(1, "555", "X", "", 1),
            rec(2, "555", "X", "", 2),
            rec(3, "666", "X", "", 1),
            rec(4, "666", "X", "", 2),
        ];
        let ledger = InMemoryLedger::new().with_records(snapshot.clone()).await;
        ledger.reject_writes_for([1]).await;

        let outcome = DedupReconciler::new(1).reconcile(&ledger, &snapshot).await;
        assert_eq!(outcome.failed, vec![1]);
        assert_eq!(outcome.deleted, vec![3]);
        assert!(ledger.get(1).await.is_some());
        assert!(ledger.get(3).await.is_none());
        assert_eq!(ledger.len().await, 3);
    }
}
