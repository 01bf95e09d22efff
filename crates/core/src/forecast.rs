//! Period forecast from the open pipeline.
//!
//! A stage's win probability is the product of the sequential conversion
//! rates from that stage to the won stage. Estimates backed by fewer closed
//! deals than `min_sample_size` are flagged, never suppressed.

use std::collections::HashMap;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::deal::{days_between, Deal, DealId, DealStatus};
use crate::domain::stage::{PipelineDefinition, StageId};
use crate::errors::{ConfigurationError, InsufficientDataWarning};
use crate::funnel::FunnelReport;
use crate::history::DealHistory;
use crate::stats::{
    self, add_money, decimal_ratio, round_days, round_ratio, sum_money, weighted_money,
};

pub const MIN_SAMPLES: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastConfig {
    pub min_sample_size: usize,
    pub quota: Option<Decimal>,
    /// Defaults to the start of the calendar quarter containing `as_of`
    pub period_start: Option<DateTime<Utc>>,
    /// Inclusive cutoff; defaults to the last second of that quarter
    pub period_end: Option<DateTime<Utc>>,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self { min_sample_size: MIN_SAMPLES, quota: None, period_start: None, period_end: None }
    }
}

impl ForecastConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.min_sample_size == 0 {
            return Err(ConfigurationError::ZeroLimit { name: "forecast.min_sample_size" });
        }
        if self.quota.map(|quota| quota.is_sign_negative() && !quota.is_zero()).unwrap_or(false) {
            return Err(ConfigurationError::NegativeQuota);
        }
        if let (Some(start), Some(end)) = (self.period_start, self.period_end) {
            if start >= end {
                return Err(ConfigurationError::InvalidPeriod);
            }
        }
        Ok(())
    }

    pub fn period(&self, as_of: DateTime<Utc>) -> ForecastPeriod {
        let start = self.period_start.unwrap_or_else(|| quarter_start(as_of));
        let end = self
            .period_end
            .unwrap_or_else(|| next_quarter_start(start) - Duration::seconds(1));
        ForecastPeriod { start: start.min(end), end }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForecastPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ForecastPeriod {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at <= self.end
    }

    pub fn remaining_days(&self, as_of: DateTime<Utc>) -> f64 {
        days_between(as_of, self.end).max(0.0)
    }
}

fn midnight(year: i32, month: u32) -> Option<DateTime<Utc>> {
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn quarter_start(at: DateTime<Utc>) -> DateTime<Utc> {
    let month = at.month0() / 3 * 3 + 1;
    midnight(at.year(), month).unwrap_or(at)
}

fn next_quarter_start(start: DateTime<Utc>) -> DateTime<Utc> {
    let quarter = quarter_start(start);
    let (year, month) = match quarter.month() + 3 {
        month if month > 12 => (quarter.year() + 1, month - 12),
        month => (quarter.year(), month),
    };
    midnight(year, month).unwrap_or(start + Duration::days(92))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageProbability {
    pub stage: String,
    pub probability: f64,
    /// Closed deals that reached the stage.
    pub sample_size: usize,
    pub low_confidence: bool,
    /// Mean days from first entering the stage to closing, over won deals.
    pub average_days_to_close: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastLine {
    pub deal_id: String,
    pub owner: String,
    pub stage: String,
    pub amount: Decimal,
    pub probability: f64,
    pub weighted_amount: Decimal,
    pub expected_close_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnlikelyReason {
    ExpectedCloseAfterCutoff,
    StageCycleExceedsWindow,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnlikelyDeal {
    pub deal_id: String,
    pub stage: String,
    pub amount: Decimal,
    pub reason: UnlikelyReason,
    pub expected_close_at: Option<DateTime<Utc>>,
    pub average_days_to_close: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaAttainment {
    pub quota: Option<Decimal>,
    pub closed_won_in_period: Decimal,
    pub projected_total: Decimal,
    pub open_pipeline_amount: Decimal,
    /// projected / quota; 0 without a positive quota
    pub attainment: f64,
    /// open pipeline / quota; 0 without a positive quota
    pub coverage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastReport {
    pub period: ForecastPeriod,
    pub remaining_days: f64,
    pub stage_probabilities: Vec<StageProbability>,
    pub in_period: Vec<ForecastLine>,
    pub unlikely_this_period: Vec<UnlikelyDeal>,
    pub weighted_pipeline: Decimal,
    pub best_case: Decimal,
    pub quota: QuotaAttainment,
    pub warnings: Vec<InsufficientDataWarning>,
}

pub struct ForecastEngine<'a> {
    pipeline: &'a PipelineDefinition,
    config: &'a ForecastConfig,
}

impl<'a> ForecastEngine<'a> {
    pub fn new(pipeline: &'a PipelineDefinition, config: &'a ForecastConfig) -> Self {
        Self { pipeline, config }
    }

    pub fn forecast(
        &self,
        deals: &[Deal],
        histories: &[DealHistory],
        funnel: &FunnelReport,
        as_of: DateTime<Utc>,
    ) -> ForecastReport {
        let period = self.config.period(as_of);
        let remaining_days = period.remaining_days(as_of);
        let stage_probabilities = self.stage_probabilities(deals, histories, funnel);
        let by_stage: HashMap<&str, &StageProbability> =
            stage_probabilities.iter().map(|row| (row.stage.as_str(), row)).collect();

        let mut in_period = Vec::new();
        let mut unlikely_this_period = Vec::new();
        for deal in deals.iter().filter(|deal| deal.is_open()) {
            let estimate = by_stage.get(deal.stage.as_str());
            let average_days_to_close = estimate.and_then(|row| row.average_days_to_close);

            let reason = match deal.expected_close_at {
                Some(expected) if expected > period.end => {
                    Some(UnlikelyReason::ExpectedCloseAfterCutoff)
                }
                Some(_) => None,
                None => average_days_to_close
                    .filter(|days| *days > remaining_days)
                    .map(|_| UnlikelyReason::StageCycleExceedsWindow),
            };

            if let Some(reason) = reason {
                unlikely_this_period.push(UnlikelyDeal {
                    deal_id: deal.id.0.clone(),
                    stage: deal.stage.0.clone(),
                    amount: deal.amount,
                    reason,
                    expected_close_at: deal.expected_close_at,
                    average_days_to_close,
                });
                continue;
            }

            let probability = estimate.map(|row| row.probability).unwrap_or(0.0);
            in_period.push(ForecastLine {
                deal_id: deal.id.0.clone(),
                owner: deal.owner.0.clone(),
                stage: deal.stage.0.clone(),
                amount: deal.amount,
                probability,
                weighted_amount: weighted_money(deal.amount, probability),
                expected_close_at: deal.expected_close_at,
            });
        }

        in_period.sort_by(|left, right| {
            right
                .weighted_amount
                .cmp(&left.weighted_amount)
                .then_with(|| left.deal_id.cmp(&right.deal_id))
        });
        unlikely_this_period.sort_by(|left, right| {
            right.amount.cmp(&left.amount).then_with(|| left.deal_id.cmp(&right.deal_id))
        });

        let weighted_pipeline = sum_money(in_period.iter().map(|line| line.weighted_amount));
        let best_case = sum_money(in_period.iter().map(|line| line.amount));
        let quota = self.quota_attainment(deals, &period, weighted_pipeline);

        let warnings: Vec<InsufficientDataWarning> = stage_probabilities
            .iter()
            .filter(|row| row.low_confidence)
            .map(|row| InsufficientDataWarning::LowConfidenceEstimate {
                stage: row.stage.clone(),
                sample_size: row.sample_size,
                required: self.config.min_sample_size,
            })
            .collect();
        for warning in &warnings {
            warn!(
                event_name = "forecast.estimate.low_confidence",
                detail = %warning,
                "low-confidence stage estimate"
            );
        }

        debug!(
            event_name = "forecast.completed",
            in_period = in_period.len(),
            unlikely = unlikely_this_period.len(),
            weighted_pipeline = %weighted_pipeline,
            best_case = %best_case,
            "forecast finished"
        );

        ForecastReport {
            period,
            remaining_days: round_days(remaining_days),
            stage_probabilities,
            in_period,
            unlikely_this_period,
            weighted_pipeline,
            best_case,
            quota,
            warnings,
        }
    }

    fn stage_probabilities(
        &self,
        deals: &[Deal],
        histories: &[DealHistory],
        funnel: &FunnelReport,
    ) -> Vec<StageProbability> {
        let pipeline = self.pipeline;
        let status: HashMap<&DealId, &Deal> = deals.iter().map(|deal| (&deal.id, deal)).collect();
        let closed_histories: Vec<(&DealHistory, &Deal)> = histories
            .iter()
            .filter_map(|history| {
                let deal = status.get(&history.deal_id).filter(|deal| deal.is_closed())?;
                Some((history, *deal))
            })
            .collect();

        let path = pipeline.progress_path();
        path.iter()
            .enumerate()
            .map(|(index, stage)| {
                let probability = if pipeline.is_won(stage) {
                    1.0
                } else {
                    path[index..]
                        .windows(2)
                        .map(|pair| funnel.rate(pair[0], pair[1]).unwrap_or(0.0))
                        .product::<f64>()
                };
                let sample_size = closed_histories
                    .iter()
                    .filter(|(history, _)| history.reached(pipeline, stage))
                    .count();

                StageProbability {
                    stage: stage.0.clone(),
                    probability: round_ratio(probability.clamp(0.0, 1.0)),
                    sample_size,
                    low_confidence: !pipeline.is_won(stage)
                        && sample_size < self.config.min_sample_size,
                    average_days_to_close: average_days_to_close(
                        pipeline,
                        stage,
                        &closed_histories,
                    ),
                }
            })
            .collect()
    }

    fn quota_attainment(
        &self,
        deals: &[Deal],
        period: &ForecastPeriod,
        weighted_pipeline: Decimal,
    ) -> QuotaAttainment {
        let closed_won_in_period = sum_money(
            deals
                .iter()
                .filter(|deal| deal.status == DealStatus::Won)
                .filter(|deal| deal.closed_at.is_some_and(|closed_at| period.contains(closed_at)))
                .map(|deal| deal.amount),
        );
        let open_pipeline_amount =
            sum_money(deals.iter().filter(|deal| deal.is_open()).map(|deal| deal.amount));
        let projected_total = add_money(closed_won_in_period, weighted_pipeline);

        let positive_quota = self.config.quota.filter(|quota| *quota > Decimal::ZERO);
        let (attainment, coverage) = match positive_quota {
            Some(quota) => (
                decimal_ratio(projected_total, quota),
                decimal_ratio(open_pipeline_amount, quota),
            ),
            None => (0.0, 0.0),
        };

        QuotaAttainment {
            quota: self.config.quota,
            closed_won_in_period,
            projected_total,
            open_pipeline_amount,
            attainment,
            coverage,
        }
    }
}

fn average_days_to_close(
    pipeline: &PipelineDefinition,
    stage: &StageId,
    closed: &[(&DealHistory, &Deal)],
) -> Option<f64> {
    let durations: Vec<f64> = closed
        .iter()
        .filter(|(_, deal)| deal.status == DealStatus::Won)
        .filter_map(|(history, deal)| {
            let entered = history.first_entry(pipeline, stage)?;
            let closed_at = deal.closed_at?;
            Some(days_between(entered, closed_at).max(0.0))
        })
        .collect();
    stats::mean(&durations).map(round_days)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{DateTime, Duration, TimeZone, Utc};
    use rust_decimal::Decimal;

    use super::{ForecastConfig, ForecastEngine, ForecastReport, UnlikelyReason};
    use crate::domain::deal::{Deal, DealId, DealStatus, OwnerId, TeamId};
    use crate::domain::stage::{PipelineDefinition, StageEvent, StageId};
    use crate::errors::{ConfigurationError, InsufficientDataWarning};
    use crate::funnel::{FunnelAggregator, FunnelConfig, FunnelReport};
    use crate::history::StageHistoryBuilder;

    fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::days(n)
    }

    fn pipeline() -> PipelineDefinition {
        PipelineDefinition::new(
            ["A", "B", "Won", "Paid", "Lost"].into_iter().map(StageId::new).collect(),
            vec![StageId::new("Won"), StageId::new("Paid")],
            vec![StageId::new("Lost")],
        )
        .expect("valid pipeline")
    }

    fn deal(id: &str, stage: &str, status: DealStatus, amount: i64, closed: Option<i64>) -> Deal {
        Deal {
            id: DealId(id.to_string()),
            name: None,
            owner: OwnerId("rep-1".to_string()),
            team: TeamId("team-1".to_string()),
            bdr: None,
            amount: Decimal::new(amount, 0),
            stage: StageId::new(stage),
            status,
            created_at: day(0),
            closed_at: closed.map(day),
            expected_close_at: None,
            last_modified_at: None,
            stage_entered_at: None,
            loss_reason: None,
            metadata: BTreeMap::new(),
        }
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

    /// A→B converts 1 of 2, B→Won converts 1 of 1 closed path plus one open B.
    fn scenario() -> (Vec<Deal>, Vec<StageEvent>) {
        let deals = vec![
            deal("W-1", "Won", DealStatus::Won, 300, Some(10)),
            deal("L-1", "Lost", DealStatus::Lost, 50, Some(5)),
            deal("O-A", "A", DealStatus::Open, 100, None),
            deal("O-B", "B", DealStatus::Open, 200, None),
        ];
        let events = vec![
            event("W-1", "A", 0),
            event("W-1", "B", 4),
            event("W-1", "Won", 10),
            event("L-1", "A", 0),
            event("L-1", "Lost", 5),
            event("O-A", "A", 0),
            event("O-B", "A", 0),
            event("O-B", "B", 2),
        ];
        (deals, events)
    }

    fn run(
        pipeline: &PipelineDefinition,
        deals: &[Deal],
        events: &[StageEvent],
        config: &ForecastConfig,
    ) -> (FunnelReport, ForecastReport) {
        let histories = StageHistoryBuilder::new(pipeline).build_all(deals, events);
        let funnel =
            FunnelAggregator::new(pipeline, FunnelConfig::default()).aggregate(&histories, day(20));
        let report =
            ForecastEngine::new(pipeline, config).forecast(deals, &histories, &funnel, day(20));
        (funnel, report)
    }

    fn probability(report: &ForecastReport, stage: &str) -> Option<f64> {
        report.stage_probabilities.iter().find(|row| row.stage == stage).map(|row| row.probability)
    }

    #[test]
    fn chained_probabilities_weight_the_open_pipeline() {
        let pipeline = pipeline();
        let (deals, events) = scenario();
        let config = ForecastConfig { period_end: Some(day(200)), ..ForecastConfig::default() };

        let (funnel, report) = run(&pipeline, &deals, &events, &config);

        let a_to_b = funnel.rate(&StageId::new("A"), &StageId::new("B")).expect("A->B");
        let b_to_won = funnel.rate(&StageId::new("B"), &StageId::new("Won")).expect("B->Won");
        assert_eq!(a_to_b, 0.5);
        assert_eq!(probability(&report, "A"), Some(a_to_b * b_to_won));
        assert_eq!(probability(&report, "B"), Some(b_to_won));
        assert_eq!(probability(&report, "Won"), Some(1.0));
        assert_eq!(probability(&report, "Paid"), None, "secondary won stages are not on the path");

        assert_eq!(report.best_case, Decimal::new(300, 0));
        assert!(report.weighted_pipeline <= report.best_case);
        assert_eq!(
            report.weighted_pipeline,
            Decimal::new(100, 0) * Decimal::new(25, 2) + Decimal::new(100, 0)
        );
    }

    #[test]
    fn secondary_won_stage_closes_the_chain() {
        let pipeline = pipeline();
        let (mut deals, mut events) = scenario();
        deals[0].stage = StageId::new("Paid");
        events[2] = event("W-1", "Paid", 10);
        let config = ForecastConfig { period_end: Some(day(200)), ..ForecastConfig::default() };

        let (_, report) = run(&pipeline, &deals, &events, &config);

        assert_eq!(probability(&report, "B"), Some(0.5));
        let b = report.stage_probabilities.iter().find(|row| row.stage == "B").expect("B row");
        assert_eq!(b.average_days_to_close, Some(6.0));
        assert_eq!(report.quota.closed_won_in_period, Decimal::new(300, 0));
    }

    #[test]
    fn thin_samples_are_flagged_not_suppressed() {
        let pipeline = pipeline();
        let (deals, events) = scenario();
        let config = ForecastConfig { period_end: Some(day(200)), ..ForecastConfig::default() };

        let (_, report) = run(&pipeline, &deals, &events, &config);

        let a = report.stage_probabilities.iter().find(|row| row.stage == "A").expect("A row");
        assert!(a.low_confidence);
        assert_eq!(a.sample_size, 2);
        assert!(report.warnings.contains(&InsufficientDataWarning::LowConfidenceEstimate {
            stage: "A".to_string(),
            sample_size: 2,
            required: 5,
        }));
        assert_eq!(report.in_period.len(), 2);
    }

    #[test]
    fn deals_beyond_the_cutoff_are_bucketed_as_unlikely() {
        let pipeline = pipeline();
        let (mut deals, events) = scenario();
        deals[2].expected_close_at = Some(day(400));
        // B has a 6-day historical close time; only 3 days remain.
        let config = ForecastConfig {
            period_start: Some(day(0)),
            period_end: Some(day(23)),
            ..ForecastConfig::default()
        };

        let (_, report) = run(&pipeline, &deals, &events, &config);

        assert!(report.in_period.is_empty());
        let reasons: Vec<(&str, UnlikelyReason)> = report
            .unlikely_this_period
            .iter()
            .map(|row| (row.deal_id.as_str(), row.reason))
            .collect();
        assert_eq!(
            reasons,
            vec![
                ("O-B", UnlikelyReason::StageCycleExceedsWindow),
                ("O-A", UnlikelyReason::ExpectedCloseAfterCutoff),
            ]
        );
        assert_eq!(report.weighted_pipeline, Decimal::ZERO);
    }

    #[test]
    fn quota_attainment_and_coverage() {
        let pipeline = pipeline();
        let (deals, events) = scenario();
        let config = ForecastConfig {
            quota: Some(Decimal::new(1000, 0)),
            period_start: Some(day(0)),
            period_end: Some(day(200)),
            ..ForecastConfig::default()
        };

        let (_, report) = run(&pipeline, &deals, &events, &config);

        assert_eq!(report.quota.closed_won_in_period, Decimal::new(300, 0));
        assert_eq!(report.quota.projected_total, Decimal::new(425, 0));
        assert_eq!(report.quota.attainment, 0.425);
        assert_eq!(report.quota.coverage, 0.3);

        let without_quota =
            ForecastConfig { period_end: Some(day(200)), ..ForecastConfig::default() };
        let (_, report) = run(&pipeline, &deals, &events, &without_quota);
        assert_eq!((report.quota.attainment, report.quota.coverage), (0.0, 0.0));
    }

    #[test]
    fn huge_amounts_saturate_instead_of_panicking() {
        let pipeline = pipeline();
        let (mut deals, events) = scenario();
        let huge = Decimal::from_str_exact("50000000000000000000000000000").expect("decimal");
        for deal in &mut deals {
            deal.amount = huge;
        }
        let config = ForecastConfig {
            quota: Some(Decimal::ONE),
            period_start: Some(day(0)),
            period_end: Some(day(200)),
            ..ForecastConfig::default()
        };

        let (_, report) = run(&pipeline, &deals, &events, &config);

        assert_eq!(report.best_case, Decimal::MAX);
        assert_eq!(report.quota.open_pipeline_amount, Decimal::MAX);
        assert_eq!(report.quota.projected_total, Decimal::MAX);
        assert!(report.weighted_pipeline <= report.best_case);
        assert!(report.quota.attainment.is_finite());
    }

    #[test]
    fn default_period_is_the_calendar_quarter() {
        let config = ForecastConfig::default();
        let as_of = Utc.with_ymd_and_hms(2024, 11, 15, 12, 0, 0).unwrap();

        let period = config.period(as_of);

        assert_eq!(period.start, Utc.with_ymd_and_hms(2024, 10, 1, 0, 0, 0).unwrap());
        assert_eq!(period.end, Utc.with_ymd_and_hms(2024, 12, 31, 23, 59, 59).unwrap());
        assert!(period.contains(as_of));
    }

    #[test]
    fn validation_rejects_bad_forecast_settings() {
        assert_eq!(
            ForecastConfig { min_sample_size: 0, ..ForecastConfig::default() }.validate(),
            Err(ConfigurationError::ZeroLimit { name: "forecast.min_sample_size" })
        );
        assert_eq!(
            ForecastConfig { quota: Some(Decimal::new(-1, 0)), ..ForecastConfig::default() }
                .validate(),
            Err(ConfigurationError::NegativeQuota)
        );
        assert_eq!(
            ForecastConfig {
                period_start: Some(day(10)),
                period_end: Some(day(5)),
                ..ForecastConfig::default()
            }
            .validate(),
            Err(ConfigurationError::InvalidPeriod)
        );
    }

    #[test]
    fn empty_pipeline_forecasts_zero() {
        let pipeline = pipeline();
        let config = ForecastConfig::default();

        let (_, report) = run(&pipeline, &[], &[], &config);

        assert_eq!(report.weighted_pipeline, Decimal::ZERO);
        assert_eq!(report.best_case, Decimal::ZERO);
        assert!(report.stage_probabilities.iter().all(|row| row.sample_size == 0));
    }
}
