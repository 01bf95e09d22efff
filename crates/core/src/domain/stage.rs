use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::deal::{days_between, DealId};
use crate::errors::ConfigurationError;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StageId(pub String);

impl StageId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canonical funnel order plus the terminal stages.
///
/// A pipeline may carry several terminal-won stages. The first of them in
/// pipeline order is the primary won stage; the progress path is every
/// non-terminal stage followed by the primary won stage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PipelineDefinition {
    stages: Vec<StageId>,
    won_stages: Vec<StageId>,
    lost_stages: Vec<StageId>,
}

impl PipelineDefinition {
    pub fn new(
        stages: Vec<StageId>,
        won_stages: Vec<StageId>,
        lost_stages: Vec<StageId>,
    ) -> Result<Self, ConfigurationError> {
        if stages.is_empty() {
            return Err(ConfigurationError::EmptyPipeline);
        }

        let mut seen = HashSet::new();
        for stage in &stages {
            if stage.as_str().trim().is_empty() {
                return Err(ConfigurationError::BlankStage);
            }
            if !seen.insert(normalize_key(stage.as_str())) {
                return Err(ConfigurationError::DuplicateStage { stage: stage.0.clone() });
            }
        }

        if won_stages.is_empty() {
            return Err(ConfigurationError::MissingWonStage);
        }

        let mut won_seen = HashSet::new();
        for won in &won_stages {
            if !stages.contains(won) {
                return Err(ConfigurationError::UnknownTerminalStage { stage: won.0.clone() });
            }
            if !won_seen.insert(won.clone()) {
                return Err(ConfigurationError::DuplicateStage { stage: won.0.clone() });
            }
        }

        let mut lost_seen = HashSet::new();
        for lost in &lost_stages {
            if !stages.contains(lost) {
                return Err(ConfigurationError::UnknownTerminalStage { stage: lost.0.clone() });
            }
            if won_seen.contains(lost) {
                return Err(ConfigurationError::ConflictingTerminalStage {
                    stage: lost.0.clone(),
                });
            }
            if !lost_seen.insert(lost.clone()) {
                return Err(ConfigurationError::DuplicateStage { stage: lost.0.clone() });
            }
        }

        let won_stages = stages.iter().filter(|stage| won_seen.contains(*stage)).cloned().collect();

        Ok(Self { stages, won_stages, lost_stages })
    }

    pub fn stages(&self) -> &[StageId] {
        &self.stages
    }

    /// The primary won stage: the first won stage in pipeline order.
    pub fn won_stage(&self) -> &StageId {
        &self.won_stages[0]
    }

    /// Every terminal-won stage, in pipeline order.
    pub fn won_stages(&self) -> &[StageId] {
        &self.won_stages
    }

    pub fn lost_stages(&self) -> &[StageId] {
        &self.lost_stages
    }

    pub fn first_stage(&self) -> &StageId {
        &self.stages[0]
    }

    pub fn position(&self, stage: &StageId) -> Option<usize> {
        self.stages.iter().position(|candidate| candidate == stage)
    }

    /// Case-insensitive lookup returning the canonical stage id.
    pub fn resolve(&self, raw: &str) -> Option<&StageId> {
        let key = normalize_key(raw);
        self.stages.iter().find(|stage| normalize_key(stage.as_str()) == key)
    }

    pub fn is_won(&self, stage: &StageId) -> bool {
        self.won_stages.contains(stage)
    }

    pub fn is_lost(&self, stage: &StageId) -> bool {
        self.lost_stages.contains(stage)
    }

    pub fn is_terminal(&self, stage: &StageId) -> bool {
        self.is_won(stage) || self.is_lost(stage)
    }

    /// Whether occupying `stage` counts as reaching `milestone`. Any won stage
    /// satisfies a won milestone.
    pub fn matches_milestone(&self, milestone: &StageId, stage: &StageId) -> bool {
        milestone == stage || (self.is_won(milestone) && self.is_won(stage))
    }

    pub fn progress_path(&self) -> Vec<&StageId> {
        self.stages
            .iter()
            .filter(|stage| !self.is_terminal(stage))
            .chain(std::iter::once(self.won_stage()))
            .collect()
    }

    /// Position on the progress path. Every won stage sits at the end.
    pub fn progress_position(&self, stage: &StageId) -> Option<usize> {
        let path = self.progress_path();
        if self.is_won(stage) {
            return Some(path.len() - 1);
        }
        path.iter().position(|candidate| *candidate == stage)
    }

    /// Sort key used to break timestamp ties between events.
    pub fn order_key(&self, stage: &StageId) -> usize {
        self.position(stage).unwrap_or(usize::MAX)
    }
}

impl Default for PipelineDefinition {
    fn default() -> Self {
        let stages = [
            "Lead",
            "Meeting Booked",
            "Meeting Done",
            "Contract Sent",
            "Closed Won",
            "Contract Signed",
            "Payment Complete",
            "Closed Lost",
            "Dropped",
        ]
        .into_iter()
        .map(StageId::new)
        .collect();

        Self {
            stages,
            won_stages: vec![
                StageId::new("Closed Won"),
                StageId::new("Contract Signed"),
                StageId::new("Payment Complete"),
            ],
            lost_stages: vec![StageId::new("Closed Lost"), StageId::new("Dropped")],
        }
    }
}

fn normalize_key(value: &str) -> String {
    value.trim().to_lowercase()
}

/// A deal entered `stage` at `entered_at`. Never edited; corrections arrive
/// as new events.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageEvent {
    pub deal_id: DealId,
    pub stage: StageId,
    pub entered_at: DateTime<Utc>,
    pub previous_stage: Option<StageId>,
    pub sequence: Option<u64>,
}

/// Derived `[entered_at, exited_at)` occupancy span. `exited_at` is `None`
/// while the deal still sits in the stage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageInterval {
    pub stage: StageId,
    pub entered_at: DateTime<Utc>,
    pub exited_at: Option<DateTime<Utc>>,
    pub synthetic: bool,
}

impl StageInterval {
    pub fn is_open(&self) -> bool {
        self.exited_at.is_none()
    }

    pub fn closed_days(&self) -> Option<f64> {
        self.exited_at.map(|exited_at| days_between(self.entered_at, exited_at))
    }

    /// Elapsed days, measuring open intervals against `as_of`. Never negative.
    pub fn elapsed_days(&self, as_of: DateTime<Utc>) -> f64 {
        let end = self.exited_at.unwrap_or(as_of);
        days_between(self.entered_at, end).max(0.0)
    }
}
