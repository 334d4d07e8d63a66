use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use leadline_core::{Operator, OperatorRole};
use leadline_ledger::{DISPLAY_PAGE_SIZE, SNAPSHOT_BATCH_SIZE};
use tracing::warn;

use crate::coordinator::CoordinatorConfig;
use crate::dedup::DEFAULT_DELETE_CHUNK;
use crate::normalize::DEFAULT_NORMALIZE_CONCURRENCY;
use crate::snapshot::{SnapshotFetcher, DEFAULT_MAX_BATCHES};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshConfig {
    pub database_url: Option<String>,
    pub poll_interval: Duration,
    pub debounce: Duration,
    pub batch_size: usize,
    pub max_batches: usize,
    pub page_size: usize,
    pub delete_chunk: usize,
    pub normalize_concurrency: usize,
    pub workspace_root: PathBuf,
    pub operator: Option<Operator>,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            poll_interval: Duration::from_millis(5000),
            debounce: Duration::from_millis(100),
            batch_size: SNAPSHOT_BATCH_SIZE,
            max_batches: DEFAULT_MAX_BATCHES,
            page_size: DISPLAY_PAGE_SIZE,
            delete_chunk: DEFAULT_DELETE_CHUNK,
            normalize_concurrency: DEFAULT_NORMALIZE_CONCURRENCY,
            workspace_root: PathBuf::from("."),
            operator: None,
        }
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "ignoring unparsable setting");
            default
        }),
        None => default,
    }
}

impl RefreshConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let operator = lookup("LEADLINE_OPERATOR_ID")
            .filter(|id| !id.trim().is_empty())
            .map(|id| Operator {
                display_name: lookup("LEADLINE_OPERATOR_NAME").unwrap_or_else(|| id.clone()),
                role: parse_or(&lookup, "LEADLINE_OPERATOR_ROLE", OperatorRole::Agent),
                id,
            });

        Self {
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            poll_interval: Duration::from_millis(parse_or(
                &lookup,
                "LEADLINE_POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )),
            debounce: Duration::from_millis(parse_or(
                &lookup,
                "LEADLINE_DEBOUNCE_MS",
                defaults.debounce.as_millis() as u64,
            )),
            batch_size: parse_or(&lookup, "LEADLINE_BATCH_SIZE", defaults.batch_size),
            max_batches: parse_or(&lookup, "LEADLINE_MAX_BATCHES", defaults.max_batches),
            page_size: parse_or(&lookup, "LEADLINE_PAGE_SIZE", defaults.page_size),
            delete_chunk: parse_or(&lookup, "LEADLINE_DELETE_CHUNK", defaults.delete_chunk),
            normalize_concurrency: parse_or(
                &lookup,
                "LEADLINE_NORMALIZE_CONCURRENCY",
                defaults.normalize_concurrency,
            ),
            workspace_root: lookup("LEADLINE_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            operator,
        }
    }

    pub fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            poll_interval: self.poll_interval.max(Duration::from_millis(1)),
            debounce: self.debounce,
        }
    }

    pub fn snapshot_fetcher(&self) -> SnapshotFetcher {
        SnapshotFetcher::new(self.batch_size, self.max_batches)
    }
}
