use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leadline_core::{CallStatus, ChangeEvent, ChangeKind, ContactRecord, RecordId, RecordPatch};
use sqlx::postgres::{PgListener, PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    BackoffPolicy, ChangeSubscription, EventMask, LedgerAccessor, LedgerError, LedgerFilter,
    LedgerPage, LedgerQuery, LedgerSort,
};

pub const TABLE_NAME: &str = "contact_records";
/// NOTIFY channel fed by the `contact_records_changes` trigger.
pub const CHANGE_CHANNEL: &str = "contact_records_changes";

const SELECT_COLUMNS: &str =
    "SELECT id, phone, hotel_name, message, classification, status, created_at, updated_by, updated_at FROM contact_records";

#[derive(Debug, Clone)]
pub struct PgLedger {
    pool: PgPool,
    backoff: BackoffPolicy,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            backoff: BackoffPolicy::default(),
        }
    }

    pub async fn connect(database_url: &str) -> Result<Self, LedgerError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .map_err(|err| LedgerError::Connection(err.to_string()))?;
        Ok(Self::new(pool))
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), LedgerError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

/// Legacy rows may still carry the original status spelling.
fn status_wire_values(status: CallStatus) -> Vec<String> {
    let legacy = match status {
        CallStatus::Called => "ARANDI",
        CallStatus::NotCalled => "ARANMADI",
    };
    vec![status.as_str().to_string(), legacy.to_string()]
}

fn escape_like(input: &str) -> String {
    input
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn push_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: &LedgerFilter) {
    builder.push(" WHERE TRUE");
    if let Some(needle) = &filter.phone_contains {
        builder
            .push(" AND phone ILIKE ")
            .push_bind(format!("%{}%", escape_like(needle)));
    }
    if let Some(status) = filter.status {
        builder
            .push(" AND status = ANY(")
            .push_bind(status_wire_values(status))
            .push(")");
    }
}

fn order_clause(sort: LedgerSort) -> &'static str {
    match sort {
        LedgerSort::CreatedAtDesc => " ORDER BY created_at DESC, id DESC",
        LedgerSort::StatusDescCreatedAtDesc => " ORDER BY status DESC, created_at DESC, id DESC",
    }
}

fn decode_row(row: &PgRow) -> Result<ContactRecord, LedgerError> {
    let status_text: String = row.try_get("status")?;
    let status = status_text
        .parse::<CallStatus>()
        .map_err(|err| LedgerError::Decode(err.to_string()))?;
    Ok(ContactRecord {
        id: row.try_get("id")?,
        phone: row.try_get("phone")?,
        hotel_name: row.try_get("hotel_name")?,
        message: row.try_get("message")?,
        classification: row.try_get("classification")?,
        status,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_by: row.try_get("updated_by")?,
        updated_at: row.try_get::<Option<DateTime<Utc>>, _>("updated_at")?,
    })
}

#[async_trait]
impl LedgerAccessor for PgLedger {
    async fn query(&self, query: &LedgerQuery) -> Result<LedgerPage, LedgerError> {
        let mut select = QueryBuilder::<Postgres>::new(SELECT_COLUMNS);
        push_filter(&mut select, &query.filter);
        select
            .push(order_clause(query.sort))
            .push(" LIMIT ")
            .push_bind(query.range.limit as i64)
            .push(" OFFSET ")
            .push_bind(query.range.offset as i64);
        let rows = select.build().fetch_all(&self.pool).await?;
        let records = rows.iter().map(decode_row).collect::<Result<Vec<_>, _>>()?;

        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM contact_records");
        push_filter(&mut count, &query.filter);
        let total = count.build_query_scalar::<i64>().fetch_one(&self.pool).await?;

        Ok(LedgerPage {
            records,
            total_count: total.max(0) as usize,
        })
    }

    async fn update(&self, id: RecordId, patch: &RecordPatch) -> Result<(), LedgerError> {
        if patch.is_empty() {
            return Ok(());
        }

        let mut builder = QueryBuilder::<Postgres>::new("UPDATE contact_records SET ");
        let mut set = builder.separated(", ");
        if let Some(message) = &patch.message {
            set.push("message = ").push_bind_unseparated(message.clone());
        }
        if let Some(classification) = &patch.classification {
            set.push("classification = ")
                .push_bind_unseparated(classification.clone());
        }
        if let Some(status) = patch.status {
            set.push("status = ").push_bind_unseparated(status.as_str());
        }
        if let Some(updated_by) = &patch.updated_by {
            set.push("updated_by = ").push_bind_unseparated(updated_by.clone());
        }
        if let Some(updated_at) = patch.updated_at {
            set.push("updated_at = ").push_bind_unseparated(updated_at);
        }
        builder.push(" WHERE id = ").push_bind(id);

        let result = builder.build().execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            debug!(record_id = id, "update matched no row");
        }
        Ok(())
    }

    async fn delete(&self, ids: &[RecordId]) -> Result<(), LedgerError> {
        if ids.is_empty() {
            return Ok(());
        }
        let result = sqlx::query("DELETE FROM contact_records WHERE id = ANY($1)")
            .bind(ids.to_vec())
            .execute(&self.pool)
            .await?;
        debug!(
            requested = ids.len(),
            deleted = result.rows_affected(),
            "deleted contact records"
        );
        Ok(())
    }

    async fn subscribe(&self, mask: EventMask) -> Result<ChangeSubscription, LedgerError> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(CHANGE_CHANNEL).await?;
        info!(channel = CHANGE_CHANNEL, "listening for ledger changes");

        let (tx, rx) = mpsc::channel(256);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let backoff = self.backoff;

        tokio::spawn(async move {
            let mut consecutive_failures = 0usize;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    received = listener.try_recv() => match received {
                        Ok(Some(notification)) => {
                            consecutive_failures = 0;
                            let event = match serde_json::from_str::<ChangeEvent>(notification.payload()) {
                                Ok(event) => event,
                                Err(err) => {
                                    warn!(error = %err, payload = notification.payload(), "unreadable change payload");
                                    ChangeEvent { kind: ChangeKind::Update, record_id: None }
                                }
                            };
                            if mask.accepts(event.kind) && tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => {
                            // Notifications sent while disconnected are gone; ask for a resync.
                            warn!("change listener lost its connection; reconnecting");
                            let resync = ChangeEvent { kind: ChangeKind::Update, record_id: None };
                            if tx.send(resync).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            if consecutive_failures >= backoff.max_retries {
                                warn!(error = %err, "change listener giving up after repeated failures");
                                break;
                            }
                            let delay = backoff.delay_for_attempt(consecutive_failures);
                            consecutive_failures += 1;
                            warn!(error = %err, delay_ms = delay.as_millis() as u64, "change listener failed; retrying");
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
            if let Err(err) = listener.unlisten_all().await {
                debug!(error = %err, "unlisten on shutdown failed");
            }
        });

        Ok(ChangeSubscription::new(rx, cancel))
    }
}
