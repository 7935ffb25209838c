#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_GROUP_KEY_DELIMITER: &str = ":";
pub const DEFAULT_VALUE_FIELD: &str = "value";
pub const DEFAULT_ARGUMENT_CONCURRENCY: usize = 16;
pub const DEFAULT_LEDGER_CAPACITY: usize = 4096;

/// How aggregations treat values that are not numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeMode {
    /// Text and missing values fail numeric aggregations.
    Strict,
    /// Text is coerced (NaN when unreadable) and missing values become NaN.
    Lenient,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimePolicy {
    pub mode: RuntimeMode,
    pub group_key_delimiter: String,
    pub value_field: String,
    pub max_argument_concurrency: usize,
    pub record_ledger: bool,
    /// Most recent ledger records kept; older ones are evicted.
    pub ledger_capacity: usize,
}

impl RuntimePolicy {
    #[must_use]
    pub fn strict() -> Self {
        Self {
            mode: RuntimeMode::Strict,
            group_key_delimiter: DEFAULT_GROUP_KEY_DELIMITER.to_owned(),
            value_field: DEFAULT_VALUE_FIELD.to_owned(),
            max_argument_concurrency: DEFAULT_ARGUMENT_CONCURRENCY,
            record_ledger: true,
            ledger_capacity: DEFAULT_LEDGER_CAPACITY,
        }
    }

    #[must_use]
    pub fn lenient() -> Self {
        Self {
            mode: RuntimeMode::Lenient,
            ..Self::strict()
        }
    }

    /// Parse a policy from JSON; absent fields take their strict defaults.
    pub fn from_json_str(body: &str) -> Result<Self, RuntimeError> {
        Ok(serde_json::from_str(body)?)
    }

    #[must_use]
    pub fn is_lenient(&self) -> bool {
        matches!(self.mode, RuntimeMode::Lenient)
    }

    #[must_use]
    pub fn argument_concurrency(&self) -> usize {
        self.max_argument_concurrency.max(1)
    }
}

impl Default for RuntimePolicy {
    fn default() -> Self {
        Self::strict()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationOutcome {
    CacheHit,
    Computed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub ts_unix_ms: u64,
    pub expression_id: String,
    pub kind: String,
    pub outcome: EvaluationOutcome,
    pub detail: Option<String>,
}

impl EvaluationRecord {
    #[must_use]
    pub fn now(
        expression_id: impl Into<String>,
        kind: impl Into<String>,
        outcome: EvaluationOutcome,
        detail: Option<String>,
    ) -> Self {
        Self {
            ts_unix_ms: now_unix_ms().unwrap_or_default(),
            expression_id: expression_id.into(),
            kind: kind.into(),
            outcome,
            detail,
        }
    }
}

/// Bounded log of evaluations, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationLedger {
    records: VecDeque<EvaluationRecord>,
    capacity: usize,
}

impl EvaluationLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_LEDGER_CAPACITY)
    }

    /// A ledger holding at most `capacity` records (at least one).
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, record: EvaluationRecord) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    #[must_use]
    pub fn records(&self) -> &VecDeque<EvaluationRecord> {
        &self.records
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn count(&self, outcome: EvaluationOutcome) -> usize {
        self.records
            .iter()
            .filter(|record| record.outcome == outcome)
            .count()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

impl Default for EvaluationLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("system clock is before UNIX_EPOCH")]
    ClockSkew,
    #[error("invalid runtime policy: {0}")]
    InvalidPolicy(#[from] serde_json::Error),
}

fn now_unix_ms() -> Result<u64, RuntimeError> {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| RuntimeError::ClockSkew)?
        .as_millis();
    Ok(ms as u64)
}
