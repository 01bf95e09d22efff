//! Open-deal ranking, stale detection and the focus lists: deals closing soon
//! and deals that passed the awaiting-close milestone without closing.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::deal::{days_between, Deal, DealId};
use crate::domain::stage::{PipelineDefinition, StageId};
use crate::errors::ConfigurationError;
use crate::history::DealHistory;
use crate::stats::{decimal_to_f64, round_days, round_ratio};

pub const DEFAULT_TOP_N: usize = 10;
pub const DEFAULT_STALE_THRESHOLD_DAYS: f64 = 30.0;
pub const DEFAULT_CLOSING_SOON_DAYS: i64 = 90;

/// Weights and thresholds for open-deal prioritization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Weight for recent stage movement (default: 0.30)
    pub recency_weight: f64,
    /// Weight for deal size relative to the largest open deal (default: 0.50)
    pub amount_weight: f64,
    /// Weight for progress along the pipeline (default: 0.20)
    pub stage_weight: f64,
    /// Days in the current stage after which a deal is stale (default: 30)
    pub stale_threshold_days: f64,
    /// Per-stage overrides of `stale_threshold_days`, keyed by stage id
    #[serde(default)]
    pub stale_thresholds: BTreeMap<String, f64>,
    pub top_n: usize,
    pub closing_soon_days: i64,
    /// Milestone for the awaiting-close list; defaults to the last
    /// non-terminal stage of the progress path
    #[serde(default)]
    pub awaiting_close_stage: Option<String>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            recency_weight: 0.3,
            amount_weight: 0.5,
            stage_weight: 0.2,
            stale_threshold_days: DEFAULT_STALE_THRESHOLD_DAYS,
            stale_thresholds: BTreeMap::new(),
            top_n: DEFAULT_TOP_N,
            closing_soon_days: DEFAULT_CLOSING_SOON_DAYS,
            awaiting_close_stage: None,
        }
    }
}

impl ScoringConfig {
    pub fn validate(&self, pipeline: &PipelineDefinition) -> Result<(), ConfigurationError> {
        let weights = [
            ("recency_weight", self.recency_weight),
            ("amount_weight", self.amount_weight),
            ("stage_weight", self.stage_weight),
        ];
        for (name, value) in weights {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigurationError::InvalidWeight { name, value });
            }
        }
        if weights.iter().all(|(_, value)| *value == 0.0) {
            return Err(ConfigurationError::ZeroWeights);
        }

        if !(self.stale_threshold_days.is_finite() && self.stale_threshold_days > 0.0) {
            return Err(ConfigurationError::InvalidThreshold {
                scope: "all stages".to_string(),
                days: self.stale_threshold_days,
            });
        }
        for (stage, days) in &self.stale_thresholds {
            if pipeline.resolve(stage).is_none() {
                return Err(ConfigurationError::UnknownStageReference {
                    context: "scoring.stale_thresholds".to_string(),
                    stage: stage.clone(),
                });
            }
            if !(days.is_finite() && *days > 0.0) {
                return Err(ConfigurationError::InvalidThreshold {
                    scope: format!("stage `{stage}`"),
                    days: *days,
                });
            }
        }

        if self.top_n == 0 {
            return Err(ConfigurationError::ZeroLimit { name: "scoring.top_n" });
        }
        if self.closing_soon_days <= 0 {
            return Err(ConfigurationError::ZeroLimit { name: "scoring.closing_soon_days" });
        }
        if let Some(raw) = &self.awaiting_close_stage {
            let context = "scoring.awaiting_close_stage";
            match pipeline.resolve(raw) {
                None => {
                    return Err(ConfigurationError::UnknownStageReference {
                        context: context.to_string(),
                        stage: raw.clone(),
                    })
                }
                Some(stage) if pipeline.is_terminal(stage) => {
                    return Err(ConfigurationError::TerminalStageReference {
                        context: context.to_string(),
                        stage: stage.0.clone(),
                    })
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// The configured awaiting-close milestone, or the last non-terminal
    /// stage of the progress path.
    pub fn awaiting_close_milestone<'p>(
        &self,
        pipeline: &'p PipelineDefinition,
    ) -> Option<&'p StageId> {
        match &self.awaiting_close_stage {
            Some(raw) => pipeline.resolve(raw),
            None => {
                let path = pipeline.progress_path();
                path.len().checked_sub(2).and_then(|index| path.get(index).copied())
            }
        }
    }

    /// Per-stage override when configured, else the global threshold.
    pub fn threshold_for(&self, stage: &StageId) -> f64 {
        let key = stage.as_str().trim().to_lowercase();
        self.stale_thresholds
            .iter()
            .find(|(candidate, _)| candidate.trim().to_lowercase() == key)
            .map(|(_, days)| *days)
            .unwrap_or(self.stale_threshold_days)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub amount: f64,
    pub stage: f64,
    pub recency: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedDeal {
    pub rank: usize,
    pub deal_id: String,
    pub name: Option<String>,
    pub owner: String,
    pub stage: String,
    pub amount: Decimal,
    pub score: f64,
    pub components: ScoreBreakdown,
    pub days_since_stage_change: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaleDeal {
    pub deal_id: String,
    pub owner: String,
    pub stage: String,
    pub amount: Decimal,
    pub elapsed_days: f64,
    pub threshold_days: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosingSoonDeal {
    pub deal_id: String,
    pub name: Option<String>,
    pub owner: String,
    pub stage: String,
    pub amount: Decimal,
    pub expected_close_at: DateTime<Utc>,
    pub days_to_close: f64,
}

/// An open deal that reached the awaiting-close milestone and has not closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwaitingCloseDeal {
    pub deal_id: String,
    pub name: Option<String>,
    pub owner: String,
    pub stage: String,
    pub amount: Decimal,
    pub milestone_stage: String,
    pub milestone_entered_at: DateTime<Utc>,
    pub days_since_milestone: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrioritizationReport {
    pub top_deals: Vec<RankedDeal>,
    pub stale_deals: Vec<StaleDeal>,
    pub closing_soon: Vec<ClosingSoonDeal>,
    #[serde(default)]
    pub awaiting_close: Vec<AwaitingCloseDeal>,
}

/// Internal scoring row before truncation to `top_n`.
struct Candidate<'d> {
    deal: &'d Deal,
    score: f64,
    components: ScoreBreakdown,
    days_since_stage_change: f64,
}

pub struct PrioritizationEngine<'a> {
    pipeline: &'a PipelineDefinition,
    config: &'a ScoringConfig,
}

impl<'a> PrioritizationEngine<'a> {
    pub fn new(pipeline: &'a PipelineDefinition, config: &'a ScoringConfig) -> Self {
        Self { pipeline, config }
    }

    pub fn prioritize(
        &self,
        deals: &[Deal],
        histories: &[DealHistory],
        as_of: DateTime<Utc>,
    ) -> PrioritizationReport {
        let by_deal: HashMap<&DealId, &DealHistory> =
            histories.iter().map(|history| (&history.deal_id, history)).collect();
        let open: Vec<&Deal> = deals.iter().filter(|deal| deal.is_open()).collect();

        let report = PrioritizationReport {
            top_deals: self.rank(&open, &by_deal, as_of),
            stale_deals: self.stale(&open, &by_deal, as_of),
            closing_soon: self.closing_soon(&open, as_of),
            awaiting_close: self.awaiting_close(&open, &by_deal, as_of),
        };

        debug!(
            event_name = "prioritization.completed",
            open_deals = open.len(),
            ranked = report.top_deals.len(),
            stale = report.stale_deals.len(),
            closing_soon = report.closing_soon.len(),
            awaiting_close = report.awaiting_close.len(),
            "prioritization finished"
        );
        report
    }

    fn rank(
        &self,
        open: &[&Deal],
        by_deal: &HashMap<&DealId, &DealHistory>,
        as_of: DateTime<Utc>,
    ) -> Vec<RankedDeal> {
        let max_amount = open.iter().map(|deal| deal.amount).max().unwrap_or(Decimal::ZERO);
        let path_len = self.pipeline.progress_path().len().max(1) as f64;

        let mut candidates: Vec<Candidate<'_>> = open
            .iter()
            .map(|&deal| {
                let last_change = by_deal
                    .get(&deal.id)
                    .and_then(|history| history.last_stage_change())
                    .or(deal.stage_entered_at)
                    .unwrap_or(deal.created_at);
                let days_since_stage_change = days_between(last_change, as_of).max(0.0);

                let amount = if max_amount.is_zero() {
                    0.0
                } else {
                    decimal_to_f64(deal.amount) / decimal_to_f64(max_amount)
                };
                let stage =
                    self.pipeline.progress_position(&deal.stage).unwrap_or(0) as f64 / path_len;
                let recency = 1.0 / (1.0 + days_since_stage_change);

                let score = self.config.amount_weight * amount
                    + self.config.stage_weight * stage
                    + self.config.recency_weight * recency;

                Candidate {
                    deal,
                    score: round_ratio(score),
                    components: ScoreBreakdown {
                        amount: round_ratio(amount),
                        stage: round_ratio(stage),
                        recency: round_ratio(recency),
                    },
                    days_since_stage_change: round_days(days_since_stage_change),
                }
            })
            .collect();

        candidates.sort_by(compare_candidates);

        candidates
            .into_iter()
            .take(self.config.top_n)
            .enumerate()
            .map(|(index, candidate)| RankedDeal {
                rank: index + 1,
                deal_id: candidate.deal.id.0.clone(),
                name: candidate.deal.name.clone(),
                owner: candidate.deal.owner.0.clone(),
                stage: candidate.deal.stage.0.clone(),
                amount: candidate.deal.amount,
                score: candidate.score,
                components: candidate.components,
                days_since_stage_change: candidate.days_since_stage_change,
            })
            .collect()
    }

    fn stale(
        &self,
        open: &[&Deal],
        by_deal: &HashMap<&DealId, &DealHistory>,
        as_of: DateTime<Utc>,
    ) -> Vec<StaleDeal> {
        let mut stale: Vec<StaleDeal> = open
            .iter()
            .filter_map(|deal| {
                let elapsed = match by_deal.get(&deal.id).and_then(|history| history.current()) {
                    Some(interval) => interval.elapsed_days(as_of),
                    None => {
                        let entered = deal.stage_entered_at.unwrap_or(deal.created_at);
                        days_between(entered, as_of).max(0.0)
                    }
                };
                let threshold = self.config.threshold_for(&deal.stage);
                (elapsed > threshold).then(|| StaleDeal {
                    deal_id: deal.id.0.clone(),
                    owner: deal.owner.0.clone(),
                    stage: deal.stage.0.clone(),
                    amount: deal.amount,
                    elapsed_days: round_days(elapsed),
                    threshold_days: threshold,
                })
            })
            .collect();

        stale.sort_by(|left, right| {
            right
                .elapsed_days
                .total_cmp(&left.elapsed_days)
                .then_with(|| left.deal_id.cmp(&right.deal_id))
        });
        stale
    }

    fn closing_soon(&self, open: &[&Deal], as_of: DateTime<Utc>) -> Vec<ClosingSoonDeal> {
        let horizon = as_of + Duration::days(self.config.closing_soon_days);
        let mut focus: Vec<ClosingSoonDeal> = open
            .iter()
            .filter_map(|deal| {
                let expected = deal.expected_close_at?;
                (expected >= as_of && expected <= horizon).then(|| ClosingSoonDeal {
                    deal_id: deal.id.0.clone(),
                    name: deal.name.clone(),
                    owner: deal.owner.0.clone(),
                    stage: deal.stage.0.clone(),
                    amount: deal.amount,
                    expected_close_at: expected,
                    days_to_close: round_days(days_between(as_of, expected)),
                })
            })
            .collect();

        focus.sort_by(|left, right| {
            right
                .amount
                .cmp(&left.amount)
                .then_with(|| left.expected_close_at.cmp(&right.expected_close_at))
                .then_with(|| left.deal_id.cmp(&right.deal_id))
        });
        focus
    }

    fn awaiting_close(
        &self,
        open: &[&Deal],
        by_deal: &HashMap<&DealId, &DealHistory>,
        as_of: DateTime<Utc>,
    ) -> Vec<AwaitingCloseDeal> {
        let Some(milestone) = self.config.awaiting_close_milestone(self.pipeline) else {
            return Vec::new();
        };

        let mut waiting: Vec<AwaitingCloseDeal> = open
            .iter()
            .filter_map(|deal| {
                let history = by_deal.get(&deal.id)?;
                let entered = history.first_entry(self.pipeline, milestone)?;
                Some(AwaitingCloseDeal {
                    deal_id: deal.id.0.clone(),
                    name: deal.name.clone(),
                    owner: deal.owner.0.clone(),
                    stage: deal.stage.0.clone(),
                    amount: deal.amount,
                    milestone_stage: milestone.0.clone(),
                    milestone_entered_at: entered,
                    days_since_milestone: round_days(days_between(entered, as_of).max(0.0)),
                })
            })
            .collect();

        waiting.sort_by(|left, right| {
            right
                .amount
                .cmp(&left.amount)
                .then_with(|| right.days_since_milestone.total_cmp(&left.days_since_milestone))
                .then_with(|| left.deal_id.cmp(&right.deal_id))
        });
        waiting
    }
}

fn compare_candidates(left: &Candidate<'_>, right: &Candidate<'_>) -> Ordering {
    right
        .score
        .total_cmp(&left.score)
        .then_with(|| right.deal.amount.cmp(&left.deal.amount))
        .then_with(|| left.deal.created_at.cmp(&right.deal.created_at))
        .then_with(|| left.deal.id.cmp(&right.deal.id))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{DateTime, Duration, TimeZone, Utc};
    use rust_decimal::Decimal;

    use super::{PrioritizationEngine, PrioritizationReport, ScoringConfig};
    use crate::domain::deal::{Deal, DealId, DealStatus, OwnerId, TeamId};
    use crate::domain::stage::{PipelineDefinition, StageEvent, StageId};
    use crate::errors::ConfigurationError;
    use crate::history::StageHistoryBuilder;

    fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::days(n)
    }

    fn open_deal(id: &str, stage: &str, amount: i64, created: i64) -> Deal {
        Deal {
            id: DealId(id.to_string()),
            name: None,
            owner: OwnerId("rep-1".to_string()),
            team: TeamId("team-1".to_string()),
            bdr: None,
            amount: Decimal::new(amount, 0),
            stage: StageId::new(stage),
            status: DealStatus::Open,
            created_at: day(created),
            closed_at: None,
            expected_close_at: None,
            last_modified_at: None,
            stage_entered_at: None,
            loss_reason: None,
            metadata: BTreeMap::new(),
        }
    }

    fn ids<T>(rows: &[T], id: impl Fn(&T) -> &str) -> Vec<String> {
        rows.iter().map(|row| id(row).to_string()).collect()
    }

    fn event(id: &str, stage: &str, at: i64) -> StageEvent {
        StageEvent {
            deal_id: DealId(id.to_string()),
            stage: StageId::new(stage),
            entered_at: day(at),
            previous_stage: None,
            sequence: None,
        }
    }

    fn prioritize(
        pipeline: &PipelineDefinition,
        config: &ScoringConfig,
        deals: &[Deal],
        events: &[StageEvent],
        as_of: DateTime<Utc>,
    ) -> PrioritizationReport {
        let histories = StageHistoryBuilder::new(pipeline).build_all(deals, events);
        PrioritizationEngine::new(pipeline, config).prioritize(deals, &histories, as_of)
    }

    #[test]
    fn ranking_uses_weighted_score_then_tie_breaks() {
        let pipeline = PipelineDefinition::default();
        let config = ScoringConfig { top_n: 3, ..ScoringConfig::default() };
        let deals = vec![
            open_deal("D-small", "Lead", 100, 0),
            open_deal("D-big", "Lead", 1000, 0),
            open_deal("D-twin-b", "Lead", 500, 0),
            open_deal("D-twin-a", "Lead", 500, 0),
        ];
        let report = prioritize(&pipeline, &config, &deals, &[], day(10));

        assert_eq!(
            ids(&report.top_deals, |row| &row.deal_id),
            vec!["D-big", "D-twin-a", "D-twin-b"]
        );
        assert_eq!(report.top_deals[0].rank, 1);
        assert_eq!(report.top_deals[0].components.amount, 1.0);
        assert!(report.top_deals[0].score > report.top_deals[1].score);
    }

    #[test]
    fn later_stage_and_recent_movement_raise_the_score() {
        let pipeline = PipelineDefinition::default();
        let config = ScoringConfig::default();
        let mut fresh = open_deal("D-fresh", "Contract Sent", 100, 0);
        fresh.stage_entered_at = Some(day(9));
        let deals = vec![open_deal("D-early", "Lead", 100, 0), fresh];

        let report = prioritize(&pipeline, &config, &deals, &[], day(10));

        assert_eq!(report.top_deals[0].deal_id, "D-fresh");
        assert_eq!(report.top_deals[0].components.stage, 0.6);
    }

    #[test]
    fn ranking_is_deterministic_across_input_order() {
        let pipeline = PipelineDefinition::default();
        let config = ScoringConfig::default();
        let mut deals = vec![
            open_deal("D-3", "Meeting Booked", 300, 2),
            open_deal("D-1", "Meeting Booked", 300, 1),
            open_deal("D-2", "Meeting Booked", 300, 1),
        ];
        let builder = StageHistoryBuilder::new(&pipeline);
        let engine = PrioritizationEngine::new(&pipeline, &config);

        let first = engine.prioritize(&deals, &builder.build_all(&deals, &[]), day(5));
        deals.reverse();
        let second = engine.prioritize(&deals, &builder.build_all(&deals, &[]), day(5));

        assert_eq!(first, second);
    }

    #[test]
    fn stale_deals_respect_stage_overrides() {
        let pipeline = PipelineDefinition::default();
        let mut config = ScoringConfig::default();
        config.stale_thresholds.insert("Meeting Booked".to_string(), 5.0);
        let deals = vec![
            open_deal("D-lead", "Lead", 100, 0),
            open_deal("D-booked", "Meeting Booked", 100, 0),
            open_deal("D-old", "Lead", 100, -40),
        ];

        let report = prioritize(&pipeline, &config, &deals, &[], day(10));

        assert_eq!(ids(&report.stale_deals, |row| &row.deal_id), vec!["D-old", "D-booked"]);
        assert_eq!(report.stale_deals[1].threshold_days, 5.0);
        assert_eq!(report.stale_deals[0].elapsed_days, 50.0);
    }

    #[test]
    fn closing_soon_lists_open_deals_inside_the_window_by_amount() {
        let pipeline = PipelineDefinition::default();
        let config = ScoringConfig { closing_soon_days: 30, ..ScoringConfig::default() };
        let mut near = open_deal("D-near", "Lead", 100, 0);
        near.expected_close_at = Some(day(20));
        let mut large = open_deal("D-large", "Lead", 900, 0);
        large.expected_close_at = Some(day(35));
        let mut far = open_deal("D-far", "Lead", 5000, 0);
        far.expected_close_at = Some(day(90));
        let mut past = open_deal("D-past", "Lead", 5000, 0);
        past.expected_close_at = Some(day(5));
        let deals = vec![near, large, far, past];

        let report = prioritize(&pipeline, &config, &deals, &[], day(10));

        assert_eq!(ids(&report.closing_soon, |row| &row.deal_id), vec!["D-large", "D-near"]);
        assert_eq!(report.closing_soon[1].days_to_close, 10.0);
    }

    #[test]
    fn awaiting_close_lists_open_deals_past_the_milestone() {
        let pipeline = PipelineDefinition::default();
        let config = ScoringConfig::default();
        let mut won = open_deal("D-won", "Closed Won", 9000, 0);
        won.status = DealStatus::Won;
        won.closed_at = Some(day(8));
        let deals = vec![
            open_deal("D-sent", "Contract Sent", 500, 0),
            open_deal("D-back", "Meeting Done", 500, 0),
            open_deal("D-early", "Meeting Done", 800, 0),
            won,
        ];
        let events = vec![
            event("D-sent", "Contract Sent", 6),
            event("D-back", "Contract Sent", 2),
            event("D-back", "Meeting Done", 4),
            event("D-won", "Contract Sent", 3),
            event("D-won", "Closed Won", 8),
        ];

        let report = prioritize(&pipeline, &config, &deals, &events, day(10));

        assert_eq!(ids(&report.awaiting_close, |row| &row.deal_id), vec!["D-back", "D-sent"]);
        let back = &report.awaiting_close[0];
        assert_eq!(back.milestone_stage, "Contract Sent");
        assert_eq!(back.stage, "Meeting Done");
        assert_eq!(back.milestone_entered_at, day(2));
        assert_eq!(back.days_since_milestone, 8.0);
    }

    #[test]
    fn awaiting_close_milestone_is_configurable() {
        let pipeline = PipelineDefinition::default();
        let config = ScoringConfig {
            awaiting_close_stage: Some("meeting booked".to_string()),
            ..ScoringConfig::default()
        };
        assert_eq!(
            config.awaiting_close_milestone(&pipeline),
            Some(&StageId::new("Meeting Booked"))
        );
        assert_eq!(
            ScoringConfig::default().awaiting_close_milestone(&pipeline),
            Some(&StageId::new("Contract Sent"))
        );

        let deals = vec![open_deal("D-1", "Meeting Done", 100, 0)];
        let events = vec![event("D-1", "Meeting Booked", 1), event("D-1", "Meeting Done", 3)];
        let report = prioritize(&pipeline, &config, &deals, &events, day(10));
        assert_eq!(report.awaiting_close[0].days_since_milestone, 9.0);
    }

    #[test]
    fn empty_population_yields_empty_lists() {
        let pipeline = PipelineDefinition::default();
        let config = ScoringConfig::default();
        let report = PrioritizationEngine::new(&pipeline, &config).prioritize(&[], &[], day(0));
        assert!(report.top_deals.is_empty() && report.stale_deals.is_empty());
        assert!(report.closing_soon.is_empty() && report.awaiting_close.is_empty());
    }

    #[test]
    fn validation_rejects_inconsistent_scoring() {
        let pipeline = PipelineDefinition::default();

        let negative = ScoringConfig { amount_weight: -0.1, ..ScoringConfig::default() };
        assert_eq!(
            negative.validate(&pipeline),
            Err(ConfigurationError::InvalidWeight { name: "amount_weight", value: -0.1 })
        );

        let zero = ScoringConfig {
            recency_weight: 0.0,
            amount_weight: 0.0,
            stage_weight: 0.0,
            ..ScoringConfig::default()
        };
        assert_eq!(zero.validate(&pipeline), Err(ConfigurationError::ZeroWeights));

        let mut unknown = ScoringConfig::default();
        unknown.stale_thresholds.insert("Negotiation".to_string(), 10.0);
        assert!(matches!(
            unknown.validate(&pipeline),
            Err(ConfigurationError::UnknownStageReference { .. })
        ));

        let threshold = ScoringConfig { stale_threshold_days: 0.0, ..ScoringConfig::default() };
        assert!(matches!(
            threshold.validate(&pipeline),
            Err(ConfigurationError::InvalidThreshold { .. })
        ));

        let terminal = ScoringConfig {
            awaiting_close_stage: Some("Dropped".to_string()),
            ..ScoringConfig::default()
        };
        assert_eq!(
            terminal.validate(&pipeline),
            Err(ConfigurationError::TerminalStageReference {
                context: "scoring.awaiting_close_stage".to_string(),
                stage: "Dropped".to_string(),
            })
        );
    }
}
