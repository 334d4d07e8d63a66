//! Ledger accessor contract for the contact-record table, plus the in-memory
//! and PostgreSQL implementations.

use std::time::Duration;

use async_trait::async_trait;
use leadline_core::{CallStatus, ChangeEvent, ChangeKind, ContactRecord, RecordId, RecordPatch};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

mod memory;
mod postgres;

pub use memory::{CallCounts, InMemoryLedger};
pub use postgres::{PgLedger, CHANGE_CHANNEL, TABLE_NAME};

pub const CRATE_NAME: &str = "leadline-ledger";

/// Largest page a display query asks for.
pub const DISPLAY_PAGE_SIZE: usize = 50;
/// Page size used when pulling the whole table for aggregation.
pub const SNAPSHOT_BATCH_SIZE: usize = 1000;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger unreachable: {0}")]
    Connection(String),
    #[error("ledger query failed: {0}")]
    Query(#[from] sqlx::Error),
    #[error("ledger rejected write for record {id}: {reason}")]
    Rejected { id: RecordId, reason: String },
    #[error("malformed ledger row: {0}")]
    Decode(String),
    #[error("ledger migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerFilter {
    pub phone_contains: Option<String>,
    pub status: Option<CallStatus>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LedgerSort {
    #[default]
    CreatedAtDesc,
    /// Not-called rows first, newest first within each status.
    StatusDescCreatedAtDesc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerRange {
    pub offset: usize,
    pub limit: usize,
}

impl LedgerRange {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }

    /// 1-based display page.
    pub fn page(page: usize, page_size: usize) -> Self {
        let page_size = page_size.max(1);
        Self {
            offset: page.saturating_sub(1) * page_size,
            limit: page_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerQuery {
    pub filter: LedgerFilter,
    pub sort: LedgerSort,
    pub range: LedgerRange,
}

impl LedgerQuery {
    pub fn snapshot_batch(offset: usize, batch_size: usize) -> Self {
        Self {
            filter: LedgerFilter::default(),
            sort: LedgerSort::CreatedAtDesc,
            range: LedgerRange::new(offset, batch_size),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerPage {
    pub records: Vec<ContactRecord>,
    /// Rows matching the filter, ignoring the range.
    pub total_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventMask {
    pub insert: bool,
    pub update: bool,
    pub delete: bool,
}

impl EventMask {
    pub const ALL: EventMask = EventMask {
        insert: true,
        update: true,
        delete: true,
    };

    pub fn accepts(&self, kind: ChangeKind) -> bool {
        match kind {
            ChangeKind::Insert => self.insert,
            ChangeKind::Update => self.update,
            ChangeKind::Delete => self.delete,
        }
    }
}

impl Default for EventMask {
    fn default() -> Self {
        Self::ALL
    }
}

/// Cancellable stream of change events. Dropping it releases the subscription.
#[derive(Debug)]
pub struct ChangeSubscription {
    rx: mpsc::Receiver<ChangeEvent>,
    cancel: CancellationToken,
}

impl ChangeSubscription {
    pub fn new(rx: mpsc::Receiver<ChangeEvent>, cancel: CancellationToken) -> Self {
        Self { rx, cancel }
    }

    /// `None` once the subscription is released or the feed ends.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            event = self.rx.recv() => event,
        }
    }

    pub fn unsubscribe(&mut self) {
        self.cancel.cancel();
        self.rx.close();
    }

    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled()
    }
}

impl Drop for ChangeSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
pub trait LedgerAccessor: Send + Sync {
    async fn query(&self, query: &LedgerQuery) -> Result<LedgerPage, LedgerError>;

    async fn update(&self, id: RecordId, patch: &RecordPatch) -> Result<(), LedgerError>;

    /// Deleting an id that no longer exists is not an error.
    async fn delete(&self, ids: &[RecordId]) -> Result<(), LedgerError>;

    async fn subscribe(&self, mask: EventMask) -> Result<ChangeSubscription, LedgerError>;
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn display_pages_are_one_based() {
        assert_eq!(LedgerRange::page(1, 50), LedgerRange::new(0, 50));
        assert_eq!(LedgerRange::page(3, 50), LedgerRange::new(100, 50));
        assert_eq!(LedgerRange::page(0, 50), LedgerRange::new(0, 50));
    }

    #[test]
    fn event_mask_filters_kinds() {
        let inserts_only = EventMask {
            insert: true,
            update: false,
            delete: false,
        };
        assert!(inserts_only.accepts(ChangeKind::Insert));
        assert!(!inserts_only.accepts(ChangeKind::Delete));
        assert!(EventMask::ALL.accepts(ChangeKind::Update));
    }

    #[tokio::test]
    async fn unsubscribed_stream_yields_nothing() {
        let (tx, rx) = mpsc::channel(4);
        let mut sub = ChangeSubscription::new(rx, CancellationToken::new());
        tx.send(ChangeEvent {
            kind: ChangeKind::Insert,
            record_id: Some(1),
        })
        .await
        .expect("send");
        assert!(sub.recv().await.is_some());

        sub.unsubscribe();
        assert!(!sub.is_active());
        assert!(sub.recv().await.is_none());
    }
}
