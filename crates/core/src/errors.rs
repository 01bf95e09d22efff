use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Pipeline or scoring configuration that downstream stages cannot trust.
/// Fatal: a run aborts before any aggregation.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ConfigurationError {
    #[error("pipeline must define at least one stage")]
    EmptyPipeline,
    #[error("pipeline stage ids cannot be blank")]
    BlankStage,
    #[error("duplicate pipeline stage `{stage}`")]
    DuplicateStage { stage: String },
    #[error("pipeline must define at least one terminal-won stage")]
    MissingWonStage,
    #[error("terminal stage `{stage}` is not part of the pipeline")]
    UnknownTerminalStage { stage: String },
    #[error("stage `{stage}` cannot be both terminal-won and terminal-lost")]
    ConflictingTerminalStage { stage: String },
    #[error("{context} references unknown stage `{stage}`")]
    UnknownStageReference { context: String, stage: String },
    #[error("{context} cannot reference terminal stage `{stage}`")]
    TerminalStageReference { context: String, stage: String },
    #[error("scoring weight `{name}` must be finite and non-negative, got {value}")]
    InvalidWeight { name: &'static str, value: f64 },
    #[error("at least one scoring weight must be greater than zero")]
    ZeroWeights,
    #[error("stale threshold for {scope} must be greater than zero days, got {days}")]
    InvalidThreshold { scope: String, days: f64 },
    #[error("dwell percentile must be in (0, 100], got {value}")]
    InvalidPercentile { value: f64 },
    #[error("{name} must be greater than zero")]
    ZeroLimit { name: &'static str },
    #[error("forecast quota cannot be negative")]
    NegativeQuota,
    #[error("forecast period start must be before its cutoff")]
    InvalidPeriod,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Deal,
    StageEvent,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deal => write!(f, "deal"),
            Self::StageEvent => write!(f, "stage_event"),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationErrorKind {
    #[error("missing required field `{field}`")]
    MissingField { field: String },
    #[error("field `{field}` has unusable value `{value}`")]
    InvalidField { field: String, value: String },
    #[error("amount `{value}` exceeds the supported maximum of {max}")]
    AmountOutOfRange { value: String, max: String },
    #[error("stage `{stage}` is not in the pipeline")]
    UnknownStage { stage: String },
    #[error("event references unknown or skipped deal `{deal_id}`")]
    UnknownDeal { deal_id: String },
    #[error("status `{status}` contradicts terminal stage `{stage}`")]
    StatusStageConflict { status: String, stage: String },
    #[error("duplicate deal id `{deal_id}`")]
    DuplicateDeal { deal_id: String },
}

/// A raw record the normalizer skipped. Collected and reported, never fatal.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{record_kind} record #{record_index}: {kind}")]
pub struct ValidationError {
    pub record_kind: RecordKind,
    pub record_index: usize,
    pub record_id: Option<String>,
    pub kind: ValidationErrorKind,
}

impl ValidationError {
    pub fn new(
        record_kind: RecordKind,
        record_index: usize,
        record_id: Option<String>,
        kind: ValidationErrorKind,
    ) -> Self {
        Self { record_kind, record_index, record_id, kind }
    }
}

/// Not an error: annotates otherwise-valid output built on thin data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InsufficientDataWarning {
    MissingLossReason { deal_id: String },
    LowConfidenceEstimate { stage: String, sample_size: usize, required: usize },
}

impl fmt::Display for InsufficientDataWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingLossReason { deal_id } => {
                write!(f, "lost deal `{deal_id}` has no loss reason; counted as unspecified")
            }
            Self::LowConfidenceEstimate { stage, sample_size, required } => write!(
                f,
                "stage `{stage}` probability backed by {sample_size} closed deals (< {required})"
            ),
        }
    }
}
