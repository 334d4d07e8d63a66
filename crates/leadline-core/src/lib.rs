//! Core domain model for the hotel-lead call desk.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "leadline-core";

pub type RecordId = i64;

/// Whether an operator has already phoned the lead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallStatus {
    #[serde(alias = "ARANDI")]
    Called,
    #[serde(alias = "ARANMADI")]
    NotCalled,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Called => "CALLED",
            CallStatus::NotCalled => "NOT_CALLED",
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown call status `{}`", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for CallStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "CALLED" | "ARANDI" => Ok(CallStatus::Called),
            "NOT_CALLED" | "ARANMADI" => Ok(CallStatus::NotCalled),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// One stored lead row. Logical identity is `(phone, hotel_name)`; several rows
/// may share it when ingestion ran twice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactRecord {
    pub id: RecordId,
    pub phone: String,
    pub hotel_name: String,
    pub message: Option<String>,
    pub classification: Option<String>,
    pub status: CallStatus,
    pub created_at: DateTime<Utc>,
    pub updated_by: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ContactRecord {
    /// Blank or whitespace-only classification counts as missing.
    pub fn has_classification(&self) -> bool {
        self.classification
            .as_deref()
            .is_some_and(|c| !c.trim().is_empty())
    }

    pub fn message_text(&self) -> &str {
        self.message.as_deref().unwrap_or_default()
    }

    pub fn classification_text(&self) -> &str {
        self.classification.as_deref().unwrap_or_default()
    }

    pub fn apply_patch(&mut self, patch: &RecordPatch) {
        if let Some(message) = &patch.message {
            self.message = Some(message.clone());
        }
        if let Some(classification) = &patch.classification {
            self.classification = Some(classification.clone());
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(updated_by) = &patch.updated_by {
            self.updated_by = Some(updated_by.clone());
        }
        if let Some(updated_at) = patch.updated_at {
            self.updated_at = Some(updated_at);
        }
    }
}

/// Partial update sent to the ledger; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<CallStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl RecordPatch {
    /// Operator action: new status stamped with who made it and when.
    pub fn status_stamp(status: CallStatus, operator: &Operator, at: DateTime<Utc>) -> Self {
        Self {
            status: Some(status),
            updated_by: Some(operator.id.clone()),
            updated_at: Some(at),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.message.is_none()
            && self.classification.is_none()
            && self.status.is_none()
            && self.updated_by.is_none()
            && self.updated_at.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatorRole {
    Admin,
    #[serde(alias = "user")]
    Agent,
}

impl FromStr for OperatorRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(OperatorRole::Admin),
            "agent" | "user" => Ok(OperatorRole::Agent),
            other => Err(format!("unknown operator role `{other}`")),
        }
    }
}

/// Identity of the signed-in operator, supplied by the session provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operator {
    pub id: String,
    pub display_name: String,
    pub role: OperatorRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Push notification about a row of the ledger table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    #[serde(default)]
    pub record_id: Option<RecordId>,
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// `numerator / denominator * 100` rounded to one decimal; 0 for an empty denominator.
pub fn percentage(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        return 0.0;
    }
    let raw = numerator as f64 / denominator as f64 * 100.0;
    (raw * 10.0).round() / 10.0
}

/// Price vs general-information askers, derived from the classification field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseBreakdown {
    pub price_askers: usize,
    pub info_askers: usize,
    pub today_price_askers: usize,
    pub today_info_askers: usize,
    pub price_rate: f64,
    pub price_rate_today: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalStat {
    pub total_count: usize,
    pub today_count: usize,
    pub total_called: usize,
    pub today_called: usize,
    pub call_rate_total: f64,
    pub call_rate_today: f64,
    pub responses: ResponseBreakdown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HotelStat {
    pub hotel_name: String,
    pub total_count: usize,
    pub today_count: usize,
    pub total_called: usize,
    pub today_called: usize,
    pub call_rate_total: f64,
    pub call_rate_today: f64,
    pub responses: ResponseBreakdown,
}

/// Calls attributed to one operator. `hotels` only counts today's calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorStat {
    pub operator: String,
    pub total_calls: usize,
    pub today_calls: usize,
    pub hotels: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStats {
    pub today: Option<NaiveDate>,
    pub global: GlobalStat,
    pub hotels: Vec<HotelStat>,
    pub operators: Vec<OperatorStat>,
}

/// What one refresh cycle did, including the failures it swallowed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub generation: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub snapshot_rows: usize,
    pub batches: usize,
    pub snapshot_complete: bool,
    pub fetch_failures: usize,
    pub duplicates_found: usize,
    pub duplicates_deleted: usize,
    pub delete_failures: usize,
    pub normalizer_writes: usize,
    pub normalizer_failures: usize,
}

impl CycleReport {
    pub fn new(generation: u64, started_at: DateTime<Utc>) -> Self {
        Self {
            cycle_id: Uuid::new_v4(),
            generation,
            started_at,
            finished_at: started_at,
            snapshot_rows: 0,
            batches: 0,
            snapshot_complete: false,
            fetch_failures: 0,
            duplicates_found: 0,
            duplicates_deleted: 0,
            delete_failures: 0,
            normalizer_writes: 0,
            normalizer_failures: 0,
        }
    }
}

/// Everything the presentation layer needs after a completed refresh cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardBundle {
    pub generation: u64,
    pub records: Vec<ContactRecord>,
    pub total_count: usize,
    pub total_pages: usize,
    pub stats: DashboardStats,
    pub report: CycleReport,
}
