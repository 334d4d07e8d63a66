//! Rewrites stale free-text fields to their canonical values.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use leadline_core::{ContactRecord, RecordId, RecordPatch};
use leadline_ledger::LedgerAccessor;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

pub const RULES_FILE: &str = "rules/normalizer.yaml";
pub const DEFAULT_NORMALIZE_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MessageRules {
    /// Case-sensitive substring marking an outdated message.
    pub stale_marker: String,
    pub awaiting_call: String,
}

impl Default for MessageRules {
    fn default() -> Self {
        Self {
            stale_marker: "cuf".into(),
            awaiting_call: "Arama bekliyor".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClassificationRules {
    /// Case-insensitive substring meaning "asked about room price".
    pub price_marker: String,
    /// Case-insensitive substring meaning "asked for general information".
    pub info_marker: String,
    pub general_info: String,
}

impl Default for ClassificationRules {
    fn default() -> Self {
        Self {
            price_marker: "oda".into(),
            info_marker: "genel bilgi".into(),
            general_info: "Genel bilgi aldı".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AskKind {
    Price,
    Info,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct NormalizerRules {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub message: MessageRules,
    #[serde(default)]
    pub classification: ClassificationRules,
}

impl NormalizerRules {
    /// Built-in defaults when the rules file is absent.
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let path = root.join(RULES_FILE);
        if !path.exists() {
            debug!(path = %path.display(), "no normalizer rules file; using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let rules: Self = serde_yaml::from_str(text)?;
        if rules.classification.price_marker.trim().is_empty() {
            anyhow::bail!("classification.price_marker must not be empty");
        }
        Ok(rules)
    }

    /// Price wins when a classification carries both markers.
    pub fn classify(&self, classification: &str) -> Option<AskKind> {
        if classification.trim().is_empty() {
            return None;
        }
        let lowered = classification.to_lowercase();
        let rules = &self.classification;
        if lowered.contains(&rules.price_marker.to_lowercase()) {
            Some(AskKind::Price)
        } else if !rules.info_marker.is_empty()
            && lowered.contains(&rules.info_marker.to_lowercase())
        {
            Some(AskKind::Info)
        } else {
            None
        }
    }

    /// The rewrite a record needs, if any. Idempotent: a record carrying the
    /// returned patch needs nothing further.
    pub fn plan(&self, record: &ContactRecord) -> Option<RecordPatch> {
        let mut patch = RecordPatch::default();

        let message = record.message_text();
        let message_rules = &self.message;
        if !message_rules.stale_marker.is_empty()
            && message.contains(&message_rules.stale_marker)
            && message != message_rules.awaiting_call
        {
            patch.message = Some(message_rules.awaiting_call.clone());
        }

        let classification = record.classification_text();
        let rules = &self.classification;
        if record.has_classification()
            && classification != rules.general_info
            && !classification
                .to_lowercase()
                .contains(&rules.price_marker.to_lowercase())
        {
            patch.classification = Some(rules.general_info.clone());
        }

        (!patch.is_empty()).then_some(patch)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizeOutcome {
    pub applied: Vec<(RecordId, RecordPatch)>,
    pub failed: Vec<RecordId>,
}

/// Persists normalizer rewrites with a bounded number of concurrent writes.
#[derive(Debug, Clone)]
pub struct FieldNormalizer {
    rules: Arc<NormalizerRules>,
    concurrency: usize,
}

impl FieldNormalizer {
    pub fn new(rules: Arc<NormalizerRules>, concurrency: usize) -> Self {
        Self {
            rules,
            concurrency: concurrency.max(1),
        }
    }

    pub fn rules(&self) -> &NormalizerRules {
        &self.rules
    }

    /// Writes each needed rewrite and patches `records` in place for the
    /// writes the ledger accepted. Failed writes are logged and left as-is.
    pub async fn normalize(
        &self,
        ledger: Arc<dyn LedgerAccessor>,
        records: &mut [ContactRecord],
    ) -> NormalizeOutcome {
        let pending = records
            .iter()
            .enumerate()
            .filter_map(|(idx, r)| self.rules.plan(r).map(|patch| (idx, r.id, patch)))
            .collect::<Vec<_>>();
        let mut outcome = NormalizeOutcome::default();
        if pending.is_empty() {
            return outcome;
        }

        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut writes = JoinSet::new();
        for (idx, id, patch) in pending {
            let ledger = Arc::clone(&ledger);
            let permits = Arc::clone(&permits);
            writes.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let result = ledger.update(id, &patch).await;
                (idx, id, patch, result)
            });
        }

        while let Some(joined) = writes.join_next().await {
            match joined {
                Ok((idx, id, patch, Ok(()))) => {
                    records[idx].apply_patch(&patch);
                    outcome.applied.push((id, patch));
                }
                Ok((_, id, _, Err(err))) => {
                    warn!(record_id = id, error = %err, "normalizer write failed; skipping");
                    outcome.failed.push(id);
                }
                Err(err) => warn!(error = %err, "normalizer write task aborted"),
            }
        }
        outcome.applied.sort_by_key(|(id, _)| *id);
        outcome.failed.sort_unstable();
        outcome
    }
}
