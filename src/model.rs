use serde::{Deserialize, Serialize};

/// One PPPoE secret as read from the router.
///
/// Missing fields default to the empty string; an empty (trimmed) `name`
/// marks the entry as skippable rather than malformed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObservedRecord {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub profile: String,
}

impl ObservedRecord {
    pub fn new(name: &str, password: &str, profile: &str) -> Self {
        Self {
            name: name.to_string(),
            password: password.to_string(),
            profile: profile.to_string(),
        }
    }

    /// Username as stored: trimmed, `None` when nothing is left.
    pub fn username(&self) -> Option<&str> {
        let trimmed = self.name.trim();
        (!trimmed.is_empty()).then_some(trimmed)
    }
}

/// What happened to a single observed record during a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Added,
    Updated,
    Skipped,
    Failed(String),
}

/// Counts returned by a reconciliation pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncReport {
    pub added: u64,
    pub updated: u64,
    pub skipped: u64,
    pub pruned: u64,
    pub total_processed: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl SyncReport {
    pub fn record(&mut self, outcome: RecordOutcome) {
        self.total_processed += 1;
        match outcome {
            RecordOutcome::Added => self.added += 1,
            RecordOutcome::Updated => self.updated += 1,
            RecordOutcome::Skipped => self.skipped += 1,
            RecordOutcome::Failed(reason) => self.warnings.push(reason),
        }
    }
}
