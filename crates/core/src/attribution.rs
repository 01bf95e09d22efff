//! Win/loss attribution over closed deals plus the revenue KPIs, rep and BDR
//! leaderboards, and the lost-deal review list built from the same partition.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::deal::{Deal, DealId, DealStatus};
use crate::domain::stage::{PipelineDefinition, StageId};
use crate::errors::{ConfigurationError, InsufficientDataWarning};
use crate::history::DealHistory;
use crate::stats::{self, add_money, ratio, round_days, round_ratio, sum_money, truncate_money};

/// Reserved bucket for lost deals that carry no loss reason.
pub const UNSPECIFIED_REASON: &str = "unspecified";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Team,
    Rep,
    /// Last non-terminal stage a closed deal occupied.
    StageOfLoss,
}

impl Dimension {
    pub const ALL: [Dimension; 3] = [Dimension::Team, Dimension::Rep, Dimension::StageOfLoss];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Team => "team",
            Self::Rep => "rep",
            Self::StageOfLoss => "stage_of_loss",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "team" => Some(Self::Team),
            "rep" | "owner" => Some(Self::Rep),
            "stage_of_loss" | "stage" => Some(Self::StageOfLoss),
            _ => None,
        }
    }
}

/// Breakdowns and leaderboard milestones for attribution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributionConfig {
    /// Win/loss breakdowns to compute, in output order (default: all)
    pub dimensions: Vec<Dimension>,
    /// Milestone counted as a booked meeting on the BDR leaderboard; defaults
    /// to the second stage of the progress path
    #[serde(default)]
    pub booked_stage: Option<String>,
    /// Milestone counted as a held meeting on the rep leaderboard; defaults to
    /// the third stage of the progress path
    #[serde(default)]
    pub meeting_done_stage: Option<String>,
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self { dimensions: Dimension::ALL.to_vec(), booked_stage: None, meeting_done_stage: None }
    }
}

impl AttributionConfig {
    pub fn validate(&self, pipeline: &PipelineDefinition) -> Result<(), ConfigurationError> {
        let milestones = [
            ("attribution.booked_stage", &self.booked_stage),
            ("attribution.meeting_done_stage", &self.meeting_done_stage),
        ];
        for (context, raw) in milestones {
            let Some(raw) = raw else {
                continue;
            };
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

    pub fn booked_milestone<'p>(&self, pipeline: &'p PipelineDefinition) -> Option<&'p StageId> {
        milestone(pipeline, self.booked_stage.as_deref(), 1)
    }

    pub fn meeting_done_milestone<'p>(
        &self,
        pipeline: &'p PipelineDefinition,
    ) -> Option<&'p StageId> {
        milestone(pipeline, self.meeting_done_stage.as_deref(), 2)
    }
}

/// Configured stage, else the non-terminal progress stage at `default_index`.
fn milestone<'p>(
    pipeline: &'p PipelineDefinition,
    configured: Option<&str>,
    default_index: usize,
) -> Option<&'p StageId> {
    match configured {
        Some(raw) => pipeline.resolve(raw),
        None => pipeline
            .progress_path()
            .get(default_index)
            .copied()
            .filter(|stage| !pipeline.is_terminal(stage)),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WinRateRow {
    pub key: String,
    pub won: usize,
    pub lost: usize,
    pub win_rate: f64,
    pub loss_rate: f64,
    pub won_amount: Decimal,
    pub lost_amount: Decimal,
}

impl WinRateRow {
    fn empty(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            won: 0,
            lost: 0,
            win_rate: 0.0,
            loss_rate: 0.0,
            won_amount: Decimal::ZERO,
            lost_amount: Decimal::ZERO,
        }
    }

    fn record(&mut self, deal: &Deal) {
        match deal.status {
            DealStatus::Won => {
                self.won += 1;
                self.won_amount = add_money(self.won_amount, deal.amount);
            }
            DealStatus::Lost => {
                self.lost += 1;
                self.lost_amount = add_money(self.lost_amount, deal.amount);
            }
            DealStatus::Open => {}
        }
    }

    fn finish(mut self) -> Self {
        let closed = self.won + self.lost;
        if closed > 0 {
            self.win_rate = ratio(self.won, closed);
            self.loss_rate = round_ratio(1.0 - self.win_rate);
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WinRateTable {
    pub dimension: Dimension,
    pub rows: Vec<WinRateRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossReasonRow {
    pub reason: String,
    pub count: usize,
    pub lost_amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevenueKpis {
    pub open_deals: usize,
    pub won_deals: usize,
    pub lost_deals: usize,
    pub total_won_revenue: Decimal,
    pub total_lost_amount: Decimal,
    pub open_pipeline_amount: Decimal,
    pub average_won_value: Decimal,
    pub average_sales_cycle_days: Option<f64>,
    pub win_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepPerformance {
    pub owner: String,
    pub team: String,
    pub open_deals: usize,
    pub deals_won: usize,
    pub deals_lost: usize,
    /// Deals that passed the meeting-done milestone.
    pub meetings_done: usize,
    pub revenue: Decimal,
    pub open_pipeline_amount: Decimal,
    pub win_rate: f64,
    /// deals won / meetings done; 0 without meetings
    pub meeting_to_won_rate: f64,
    pub average_sales_cycle_days: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BdrPerformance {
    pub bdr: String,
    pub deals_created: usize,
    pub meetings_booked: usize,
    /// meetings booked / deals created
    pub booking_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LostDealReview {
    pub deal_id: String,
    pub name: Option<String>,
    pub owner: String,
    pub stage: String,
    pub amount: Decimal,
    pub loss_reason: String,
    pub closed_at: Option<DateTime<Utc>>,
    pub last_modified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionReport {
    pub overall: WinRateRow,
    pub by_dimension: Vec<WinRateTable>,
    pub loss_reasons: Vec<LossReasonRow>,
    pub kpis: RevenueKpis,
    pub leaderboard: Vec<RepPerformance>,
    pub bdr_leaderboard: Vec<BdrPerformance>,
    /// Lost deals, most recently touched first.
    pub lost_deals: Vec<LostDealReview>,
    pub warnings: Vec<InsufficientDataWarning>,
}

pub struct WinLossAnalyzer<'a> {
    pipeline: &'a PipelineDefinition,
    config: &'a AttributionConfig,
}

impl<'a> WinLossAnalyzer<'a> {
    pub fn new(pipeline: &'a PipelineDefinition, config: &'a AttributionConfig) -> Self {
        Self { pipeline, config }
    }

    pub fn analyze(&self, deals: &[Deal], histories: &[DealHistory]) -> AttributionReport {
        let by_deal: HashMap<&DealId, &DealHistory> =
            histories.iter().map(|history| (&history.deal_id, history)).collect();
        let closed: Vec<&Deal> = deals.iter().filter(|deal| deal.is_closed()).collect();

        let mut overall = WinRateRow::empty("all");
        for deal in &closed {
            overall.record(deal);
        }
        let overall = overall.finish();

        let by_dimension = self
            .config
            .dimensions
            .iter()
            .map(|dimension| WinRateTable {
                dimension: *dimension,
                rows: self.segment(&closed, &by_deal, *dimension),
            })
            .collect();

        let (loss_reasons, warnings) = loss_reasons(&closed);
        if !warnings.is_empty() {
            warn!(
                event_name = "attribution.loss_reason.missing",
                count = warnings.len(),
                "lost deals without a loss reason counted as unspecified"
            );
        }

        let report = AttributionReport {
            kpis: revenue_kpis(deals, &overall),
            leaderboard: self.leaderboard(deals, &by_deal),
            bdr_leaderboard: self.bdr_leaderboard(deals, &by_deal),
            lost_deals: lost_deals(deals),
            overall,
            by_dimension,
            loss_reasons,
            warnings,
        };

        debug!(
            event_name = "attribution.completed",
            closed = closed.len(),
            reps = report.leaderboard.len(),
            bdrs = report.bdr_leaderboard.len(),
            "attribution finished"
        );
        report
    }

    fn segment(
        &self,
        closed: &[&Deal],
        by_deal: &HashMap<&DealId, &DealHistory>,
        dimension: Dimension,
    ) -> Vec<WinRateRow> {
        let mut groups: BTreeMap<String, WinRateRow> = BTreeMap::new();
        for deal in closed {
            let key = match dimension {
                Dimension::Team => deal.team.0.clone(),
                Dimension::Rep => deal.owner.0.clone(),
                Dimension::StageOfLoss => by_deal
                    .get(&deal.id)
                    .and_then(|history| history.closing_stage(self.pipeline))
                    .unwrap_or(&deal.stage)
                    .0
                    .clone(),
            };
            groups.entry(key.clone()).or_insert_with(|| WinRateRow::empty(key)).record(deal);
        }

        groups.into_values().map(WinRateRow::finish).collect()
    }

    fn leaderboard(
        &self,
        deals: &[Deal],
        by_deal: &HashMap<&DealId, &DealHistory>,
    ) -> Vec<RepPerformance> {
        let meeting_done = self.config.meeting_done_milestone(self.pipeline);
        let mut by_owner: BTreeMap<&str, Vec<&Deal>> = BTreeMap::new();
        for deal in deals {
            by_owner.entry(deal.owner.0.as_str()).or_default().push(deal);
        }

        let mut rows: Vec<RepPerformance> = by_owner
            .into_iter()
            .map(|(owner, owned)| {
                let mut row = WinRateRow::empty(owner);
                for deal in &owned {
                    row.record(deal);
                }
                let row = row.finish();
                let open: Vec<&&Deal> = owned.iter().filter(|deal| deal.is_open()).collect();
                let meetings_done = match meeting_done {
                    Some(milestone) => owned
                        .iter()
                        .filter(|deal| self.passed(by_deal, deal, milestone))
                        .count(),
                    None => 0,
                };

                RepPerformance {
                    owner: owner.to_string(),
                    team: owned.first().map(|deal| deal.team.0.clone()).unwrap_or_default(),
                    open_deals: open.len(),
                    deals_won: row.won,
                    deals_lost: row.lost,
                    meetings_done,
                    revenue: row.won_amount,
                    open_pipeline_amount: sum_money(open.iter().map(|deal| deal.amount)),
                    win_rate: row.win_rate,
                    meeting_to_won_rate: ratio(row.won.min(meetings_done), meetings_done),
                    average_sales_cycle_days: average_sales_cycle(owned.iter().copied()),
                }
            })
            .collect();

        rows.sort_by(|left, right| {
            right.revenue.cmp(&left.revenue).then_with(|| left.owner.cmp(&right.owner))
        });
        rows
    }

    /// Deals without a recorded BDR are left off the board.
    fn bdr_leaderboard(
        &self,
        deals: &[Deal],
        by_deal: &HashMap<&DealId, &DealHistory>,
    ) -> Vec<BdrPerformance> {
        let booked = self.config.booked_milestone(self.pipeline);
        let mut by_bdr: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
        for deal in deals {
            let Some(bdr) = &deal.bdr else {
                continue;
            };
            let counts = by_bdr.entry(bdr.0.as_str()).or_default();
            counts.0 += 1;
            if booked.is_some_and(|milestone| self.passed(by_deal, deal, milestone)) {
                counts.1 += 1;
            }
        }

        let mut rows: Vec<BdrPerformance> = by_bdr
            .into_iter()
            .map(|(bdr, (deals_created, meetings_booked))| BdrPerformance {
                bdr: bdr.to_string(),
                deals_created,
                meetings_booked,
                booking_rate: ratio(meetings_booked, deals_created),
            })
            .collect();

        rows.sort_by(|left, right| {
            right.meetings_booked.cmp(&left.meetings_booked).then_with(|| left.bdr.cmp(&right.bdr))
        });
        rows
    }

    /// Falls back to the recorded stage when the deal has no history.
    fn passed(
        &self,
        by_deal: &HashMap<&DealId, &DealHistory>,
        deal: &Deal,
        milestone: &StageId,
    ) -> bool {
        match by_deal.get(&deal.id) {
            Some(history) => history.passed(self.pipeline, milestone),
            None => {
                let target = self.pipeline.progress_position(milestone);
                let current = self.pipeline.progress_position(&deal.stage);
                matches!((current, target), (Some(current), Some(target)) if current >= target)
                    || self.pipeline.matches_milestone(milestone, &deal.stage)
            }
        }
    }
}

fn loss_reasons(closed: &[&Deal]) -> (Vec<LossReasonRow>, Vec<InsufficientDataWarning>) {
    let mut buckets: HashMap<String, LossReasonRow> = HashMap::new();
    let mut warnings = Vec::new();

    for deal in closed.iter().filter(|deal| deal.status == DealStatus::Lost) {
        let reason = match recorded_reason(deal) {
            Some(reason) => reason.to_string(),
            None => {
                warnings.push(InsufficientDataWarning::MissingLossReason {
                    deal_id: deal.id.0.clone(),
                });
                UNSPECIFIED_REASON.to_string()
            }
        };
        let row = buckets.entry(reason.clone()).or_insert_with(|| LossReasonRow {
            reason,
            count: 0,
            lost_amount: Decimal::ZERO,
        });
        row.count += 1;
        row.lost_amount = add_money(row.lost_amount, deal.amount);
    }

    let mut rows: Vec<LossReasonRow> = buckets.into_values().collect();
    rows.sort_by(|left, right| {
        right
            .count
            .cmp(&left.count)
            .then_with(|| right.lost_amount.cmp(&left.lost_amount))
            .then_with(|| left.reason.cmp(&right.reason))
    });
    (rows, warnings)
}

fn recorded_reason(deal: &Deal) -> Option<&str> {
    deal.loss_reason.as_deref().map(str::trim).filter(|reason| !reason.is_empty())
}

fn lost_deals(deals: &[Deal]) -> Vec<LostDealReview> {
    let mut rows: Vec<LostDealReview> = deals
        .iter()
        .filter(|deal| deal.status == DealStatus::Lost)
        .map(|deal| LostDealReview {
            deal_id: deal.id.0.clone(),
            name: deal.name.clone(),
            owner: deal.owner.0.clone(),
            stage: deal.stage.0.clone(),
            amount: deal.amount,
            loss_reason: recorded_reason(deal).unwrap_or(UNSPECIFIED_REASON).to_string(),
            closed_at: deal.closed_at,
            last_modified_at: deal.last_modified_at,
        })
        .collect();

    rows.sort_by(|left, right| {
        let touched = |row: &LostDealReview| row.last_modified_at.or(row.closed_at);
        touched(right).cmp(&touched(left)).then_with(|| left.deal_id.cmp(&right.deal_id))
    });
    rows
}

fn revenue_kpis(deals: &[Deal], overall: &WinRateRow) -> RevenueKpis {
    let open: Vec<&Deal> = deals.iter().filter(|deal| deal.is_open()).collect();
    let average_won_value = if overall.won == 0 {
        Decimal::ZERO
    } else {
        truncate_money(overall.won_amount / Decimal::from(overall.won))
    };

    RevenueKpis {
        open_deals: open.len(),
        won_deals: overall.won,
        lost_deals: overall.lost,
        total_won_revenue: overall.won_amount,
        total_lost_amount: overall.lost_amount,
        open_pipeline_amount: sum_money(open.iter().map(|deal| deal.amount)),
        average_won_value,
        average_sales_cycle_days: average_sales_cycle(deals.iter()),
        win_rate: overall.win_rate,
    }
}

fn average_sales_cycle<'d>(deals: impl Iterator<Item = &'d Deal>) -> Option<f64> {
    let cycles: Vec<f64> = deals
        .filter(|deal| deal.status == DealStatus::Won)
        .filter_map(Deal::sales_cycle_days)
        .collect();
    stats::mean(&cycles).map(round_days)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{DateTime, Duration, TimeZone, Utc};
    use rust_decimal::Decimal;

    use super::{
        AttributionConfig, AttributionReport, Dimension, WinLossAnalyzer, UNSPECIFIED_REASON,
    };
    use crate::domain::deal::{Deal, DealId, DealStatus, OwnerId, TeamId};
    use crate::domain::stage::{PipelineDefinition, StageEvent, StageId};
    use crate::errors::{ConfigurationError, InsufficientDataWarning};
    use crate::history::StageHistoryBuilder;

    fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::days(n)
    }

    fn deal(
        id: &str,
        owner: &str,
        team: &str,
        stage: &str,
        status: DealStatus,
        amount: i64,
    ) -> Deal {
        Deal {
            id: DealId(id.to_string()),
            name: None,
            owner: OwnerId(owner.to_string()),
            team: TeamId(team.to_string()),
            bdr: None,
            amount: Decimal::new(amount, 0),
            stage: StageId::new(stage),
            status,
            created_at: day(0),
            closed_at: status.is_terminal().then(|| day(20)),
            expected_close_at: None,
            last_modified_at: None,
            stage_entered_at: None,
            loss_reason: None,
            metadata: BTreeMap::new(),
        }
    }

    fn lost(id: &str, owner: &str, amount: i64, reason: Option<&str>) -> Deal {
        let mut deal = deal(id, owner, "east", "Closed Lost", DealStatus::Lost, amount);
        deal.loss_reason = reason.map(str::to_string);
        deal
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

    fn analyze(
        pipeline: &PipelineDefinition,
        deals: &[Deal],
        events: &[StageEvent],
        dimensions: &[Dimension],
    ) -> AttributionReport {
        let config = AttributionConfig { dimensions: dimensions.to_vec(), ..Default::default() };
        let histories = StageHistoryBuilder::new(pipeline).build_all(deals, events);
        WinLossAnalyzer::new(pipeline, &config).analyze(deals, &histories)
    }

    fn sample() -> Vec<Deal> {
        vec![
            deal("W-1", "ana", "east", "Closed Won", DealStatus::Won, 300),
            deal("W-2", "ben", "west", "Closed Won", DealStatus::Won, 500),
            lost("L-1", "ana", 100, Some("Price")),
            lost("L-2", "ana", 200, Some("Timing")),
            lost("L-3", "ben", 50, None),
            deal("O-1", "ben", "west", "Lead", DealStatus::Open, 1000),
        ]
    }

    #[test]
    fn win_and_loss_rates_partition_every_group() {
        let pipeline = PipelineDefinition::default();
        let deals = sample();

        let report = analyze(&pipeline, &deals, &[], &Dimension::ALL);

        assert_eq!((report.overall.won, report.overall.lost), (2, 3));
        assert_eq!(report.overall.win_rate, 0.4);
        for table in &report.by_dimension {
            for row in &table.rows {
                assert!((row.win_rate + row.loss_rate - 1.0).abs() < 1e-9, "{row:?}");
            }
        }

        let reps = &report.by_dimension[1];
        assert_eq!(reps.dimension, Dimension::Rep);
        let ana = reps.rows.iter().find(|row| row.key == "ana").expect("ana row");
        assert_eq!((ana.won, ana.lost), (1, 2));
    }

    #[test]
    fn stage_of_loss_uses_last_non_terminal_stage() {
        let pipeline = PipelineDefinition::default();
        let deals =
            vec![lost("L-1", "ana", 100, Some("Price")), lost("L-2", "ana", 100, Some("Price"))];
        let events = vec![
            event("L-1", "Lead", 0),
            event("L-1", "Contract Sent", 5),
            event("L-1", "Closed Lost", 20),
            event("L-2", "Lead", 0),
            event("L-2", "Closed Lost", 20),
        ];

        let report = analyze(&pipeline, &deals, &events, &[Dimension::StageOfLoss]);

        let keys: Vec<&str> =
            report.by_dimension[0].rows.iter().map(|row| row.key.as_str()).collect();
        assert_eq!(keys, vec!["Contract Sent", "Lead"]);
        assert!(report.by_dimension[0].rows.iter().all(|row| row.loss_rate == 1.0));
    }

    #[test]
    fn missing_loss_reason_is_counted_as_unspecified_with_warning() {
        let pipeline = PipelineDefinition::default();
        let deals = sample();

        let report = analyze(&pipeline, &deals, &[], &[]);

        let unspecified = report
            .loss_reasons
            .iter()
            .find(|row| row.reason == UNSPECIFIED_REASON)
            .expect("unspecified bucket");
        assert_eq!((unspecified.count, unspecified.lost_amount), (1, Decimal::new(50, 0)));
        assert_eq!(
            report.warnings,
            vec![InsufficientDataWarning::MissingLossReason { deal_id: "L-3".to_string() }]
        );
        assert_eq!(report.kpis.total_lost_amount, Decimal::new(350, 0));
    }

    #[test]
    fn loss_reasons_sort_by_count_then_amount_then_name() {
        let pipeline = PipelineDefinition::default();
        let deals = vec![
            lost("L-1", "ana", 100, Some("Timing")),
            lost("L-2", "ana", 300, Some("Price")),
            lost("L-3", "ana", 100, Some("Budget")),
            lost("L-4", "ana", 100, Some("Authority")),
            lost("L-5", "ana", 100, Some("Timing")),
        ];

        let report = analyze(&pipeline, &deals, &[], &[]);

        let reasons: Vec<&str> =
            report.loss_reasons.iter().map(|row| row.reason.as_str()).collect();
        assert_eq!(reasons, vec!["Timing", "Price", "Authority", "Budget"]);
    }

    #[test]
    fn kpis_and_leaderboard_summarize_revenue() {
        let pipeline = PipelineDefinition::default();
        let deals = sample();

        let report = analyze(&pipeline, &deals, &[], &[]);

        assert_eq!(report.kpis.total_won_revenue, Decimal::new(800, 0));
        assert_eq!(report.kpis.average_won_value, Decimal::new(400, 0));
        assert_eq!(report.kpis.average_sales_cycle_days, Some(20.0));
        assert_eq!(report.kpis.open_pipeline_amount, Decimal::new(1000, 0));

        let owners: Vec<&str> = report.leaderboard.iter().map(|row| row.owner.as_str()).collect();
        assert_eq!(owners, vec!["ben", "ana"]);
        assert_eq!(report.leaderboard[0].win_rate, 0.5);
        assert_eq!(report.leaderboard[0].open_deals, 1);
    }

    #[test]
    fn empty_population_yields_zero_aggregates() {
        let pipeline = PipelineDefinition::default();
        let report = analyze(&pipeline, &[], &[], &Dimension::ALL);

        assert_eq!(report.overall.win_rate, 0.0);
        assert_eq!(report.overall.loss_rate, 0.0);
        assert!(report.by_dimension.iter().all(|table| table.rows.is_empty()));
        assert_eq!(report.kpis.average_sales_cycle_days, None);
        assert!(report.leaderboard.is_empty());
        assert!(report.bdr_leaderboard.is_empty());
        assert!(report.lost_deals.is_empty());
    }

    #[test]
    fn configured_dimensions_control_breakdowns() {
        let pipeline = PipelineDefinition::default();
        let deals = sample();

        let report = analyze(&pipeline, &deals, &[], &[Dimension::StageOfLoss, Dimension::Team]);

        let dimensions: Vec<Dimension> =
            report.by_dimension.iter().map(|table| table.dimension).collect();
        assert_eq!(dimensions, vec![Dimension::StageOfLoss, Dimension::Team]);
        assert_eq!(Dimension::parse("Stage-Of-Loss"), Some(Dimension::StageOfLoss));
        assert_eq!(Dimension::parse("owner"), Some(Dimension::Rep));
        assert_eq!(Dimension::parse("region"), None);
    }

    #[test]
    fn bdr_leaderboard_counts_booked_meetings() {
        let pipeline = PipelineDefinition::default();
        let mut deals = vec![
            deal("D-1", "ana", "east", "Lead", DealStatus::Open, 100),
            deal("D-2", "ana", "east", "Meeting Done", DealStatus::Open, 100),
            deal("D-3", "ana", "east", "Closed Won", DealStatus::Won, 100),
            deal("D-4", "ben", "west", "Meeting Booked", DealStatus::Open, 100),
            deal("D-5", "ben", "west", "Lead", DealStatus::Open, 100),
        ];
        for (deal, bdr) in deals.iter_mut().zip(["sam", "sam", "sam", "kim", ""]) {
            deal.bdr = (!bdr.is_empty()).then(|| OwnerId(bdr.to_string()));
        }
        let events = vec![
            event("D-1", "Lead", 0),
            event("D-2", "Lead", 0),
            event("D-2", "Meeting Done", 4),
            event("D-3", "Lead", 0),
            event("D-3", "Meeting Booked", 2),
            event("D-3", "Closed Won", 20),
            event("D-4", "Meeting Booked", 3),
        ];

        let report = analyze(&pipeline, &deals, &events, &[]);

        let board: Vec<(&str, usize, usize)> = report
            .bdr_leaderboard
            .iter()
            .map(|row| (row.bdr.as_str(), row.deals_created, row.meetings_booked))
            .collect();
        assert_eq!(board, vec![("sam", 3, 2), ("kim", 1, 1)]);
        assert_eq!(report.bdr_leaderboard[0].booking_rate, 0.666667);
        assert_eq!(report.bdr_leaderboard[1].booking_rate, 1.0);
    }

    #[test]
    fn leaderboard_reports_meetings_done_and_meeting_to_won() {
        let pipeline = PipelineDefinition::default();
        let deals = vec![
            deal("D-1", "ana", "east", "Meeting Done", DealStatus::Open, 100),
            deal("D-2", "ana", "east", "Contract Sent", DealStatus::Open, 100),
            deal("D-3", "ana", "east", "Payment Complete", DealStatus::Won, 400),
            deal("D-4", "ana", "east", "Meeting Booked", DealStatus::Open, 100),
            deal("D-5", "ben", "west", "Lead", DealStatus::Open, 100),
        ];
        let events = vec![
            event("D-1", "Meeting Done", 2),
            event("D-2", "Contract Sent", 5),
            event("D-3", "Meeting Done", 3),
            event("D-3", "Payment Complete", 20),
            event("D-4", "Meeting Booked", 1),
        ];

        let report = analyze(&pipeline, &deals, &events, &[]);

        let ana = &report.leaderboard[0];
        assert_eq!(ana.owner, "ana");
        assert_eq!((ana.deals_won, ana.meetings_done), (1, 3));
        assert_eq!(ana.meeting_to_won_rate, 0.333333);
        let ben = &report.leaderboard[1];
        assert_eq!((ben.meetings_done, ben.meeting_to_won_rate), (0, 0.0));
    }

    #[test]
    fn lost_deal_review_lists_most_recently_modified_first() {
        let pipeline = PipelineDefinition::default();
        let mut deals = vec![
            lost("L-1", "ana", 100, Some("Price")),
            lost("L-2", "ben", 200, None),
            lost("L-3", "ana", 300, Some("Timing")),
            deal("W-1", "ana", "east", "Closed Won", DealStatus::Won, 500),
        ];
        deals[0].last_modified_at = Some(day(25));
        deals[1].last_modified_at = Some(day(30));
        deals[2].stage = StageId::new("Dropped");

        let report = analyze(&pipeline, &deals, &[], &[]);

        let ids: Vec<&str> = report.lost_deals.iter().map(|row| row.deal_id.as_str()).collect();
        assert_eq!(ids, vec!["L-2", "L-1", "L-3"]);
        assert_eq!(report.lost_deals[0].loss_reason, UNSPECIFIED_REASON);
        assert_eq!(report.lost_deals[2].stage, "Dropped");
    }

    #[test]
    fn huge_amounts_saturate_instead_of_panicking() {
        let pipeline = PipelineDefinition::default();
        let huge = Decimal::from_i128_with_scale(50_000_000_000_000_000_000_000_000_000, 0);
        let mut deals = vec![
            deal("W-1", "ana", "east", "Closed Won", DealStatus::Won, 0),
            deal("W-2", "ana", "east", "Closed Won", DealStatus::Won, 0),
            deal("O-1", "ana", "east", "Lead", DealStatus::Open, 0),
            deal("O-2", "ana", "east", "Lead", DealStatus::Open, 0),
        ];
        for deal in &mut deals {
            deal.amount = huge;
        }

        let report = analyze(&pipeline, &deals, &[], &Dimension::ALL);

        assert_eq!(report.kpis.total_won_revenue, Decimal::MAX);
        assert_eq!(report.kpis.open_pipeline_amount, Decimal::MAX);
        assert_eq!(report.leaderboard[0].revenue, Decimal::MAX);
    }

    #[test]
    fn milestones_default_to_progress_path_and_reject_terminal_stages() {
        let pipeline = PipelineDefinition::default();
        let config = AttributionConfig::default();
        assert_eq!(
            config.booked_milestone(&pipeline).map(StageId::as_str),
            Some("Meeting Booked")
        );
        assert_eq!(
            config.meeting_done_milestone(&pipeline).map(StageId::as_str),
            Some("Meeting Done")
        );

        let terminal = AttributionConfig {
            meeting_done_stage: Some("closed won".to_string()),
            ..AttributionConfig::default()
        };
        assert!(matches!(
            terminal.validate(&pipeline),
            Err(ConfigurationError::TerminalStageReference { .. })
        ));
        let unknown = AttributionConfig {
            booked_stage: Some("Demo".to_string()),
            ..AttributionConfig::default()
        };
        assert!(matches!(
            unknown.validate(&pipeline),
            Err(ConfigurationError::UnknownStageReference { .. })
        ));
    }
}
