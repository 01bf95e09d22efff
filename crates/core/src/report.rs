//! End-to-end analysis run and its serializable result bundle.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::attribution::{AttributionConfig, AttributionReport, WinLossAnalyzer};
use crate::config::AppConfig;
use crate::domain::deal::{Deal, DealId};
use crate::domain::stage::{PipelineDefinition, StageEvent};
use crate::errors::{ConfigurationError, InsufficientDataWarning, ValidationError};
use crate::forecast::{ForecastConfig, ForecastEngine, ForecastReport};
use crate::funnel::{FunnelAggregator, FunnelConfig, FunnelReport};
use crate::history::{DealHistory, StageHistoryBuilder};
use crate::normalizer::{DealNormalizer, IdentityDirectory, RawRecord, SnapshotWindow};
use crate::prioritization::{PrioritizationEngine, PrioritizationReport, ScoringConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub stages: Vec<String>,
    /// Primary won stage, the end of the progress path.
    pub won_stage: String,
    pub won_stages: Vec<String>,
    pub lost_stages: Vec<String>,
}

impl From<&PipelineDefinition> for PipelineSummary {
    fn from(pipeline: &PipelineDefinition) -> Self {
        Self {
            stages: pipeline.stages().iter().map(|stage| stage.0.clone()).collect(),
            won_stage: pipeline.won_stage().0.clone(),
            won_stages: pipeline.won_stages().iter().map(|stage| stage.0.clone()).collect(),
            lost_stages: pipeline.lost_stages().iter().map(|stage| stage.0.clone()).collect(),
        }
    }
}

/// Everything a dashboard renders for one snapshot. Plain data only, so a
/// serialize/parse round trip yields an identical value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultBundle {
    pub as_of: DateTime<Utc>,
    pub pipeline: PipelineSummary,
    pub snapshot_checksum: String,
    pub deals_analyzed: usize,
    pub events_analyzed: usize,
    pub skipped_records: Vec<ValidationError>,
    pub warnings: Vec<InsufficientDataWarning>,
    pub funnel: FunnelReport,
    pub prioritization: PrioritizationReport,
    pub attribution: AttributionReport,
    pub forecast: ForecastReport,
}

/// Normalized, window-filtered input for one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub deals: Vec<Deal>,
    pub events: Vec<StageEvent>,
    pub skipped: Vec<ValidationError>,
}

#[derive(Debug, Clone)]
pub struct PipelineAnalyzer {
    pipeline: PipelineDefinition,
    identity: IdentityDirectory,
    scoring: ScoringConfig,
    funnel: FunnelConfig,
    forecast: ForecastConfig,
    attribution: AttributionConfig,
}

impl PipelineAnalyzer {
    pub fn new(
        pipeline: PipelineDefinition,
        scoring: ScoringConfig,
        funnel: FunnelConfig,
        forecast: ForecastConfig,
    ) -> Result<Self, ConfigurationError> {
        scoring.validate(&pipeline)?;
        funnel.validate()?;
        forecast.validate()?;

        Ok(Self {
            pipeline,
            identity: IdentityDirectory::default(),
            scoring,
            funnel,
            forecast,
            attribution: AttributionConfig::default(),
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, ConfigurationError> {
        let analyzer = Self::new(
            config.pipeline.definition()?,
            config.scoring.clone(),
            config.funnel,
            config.forecast.clone(),
        )?;
        Ok(analyzer
            .with_attribution(config.attribution.clone())?
            .with_identity(config.identity.clone()))
    }

    pub fn with_identity(mut self, identity: IdentityDirectory) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_attribution(
        mut self,
        attribution: AttributionConfig,
    ) -> Result<Self, ConfigurationError> {
        attribution.validate(&self.pipeline)?;
        self.attribution = attribution;
        Ok(self)
    }

    pub fn pipeline(&self) -> &PipelineDefinition {
        &self.pipeline
    }

    pub fn history_builder(&self) -> StageHistoryBuilder<'_> {
        StageHistoryBuilder::new(&self.pipeline)
    }

    /// Normalizes raw records and applies the optional window. Events of deals
    /// outside the window are dropped without a diagnostic.
    pub fn normalize(
        &self,
        deal_records: &[RawRecord],
        event_records: &[RawRecord],
        window: Option<&SnapshotWindow>,
    ) -> Snapshot {
        let normalizer = DealNormalizer::new(&self.pipeline, &self.identity);
        let normalized_deals = normalizer.normalize_deals(deal_records);
        let known: HashSet<DealId> =
            normalized_deals.deals.iter().map(|deal| deal.id.clone()).collect();
        let normalized_events = normalizer.normalize_events(event_records, &known);

        let deals: Vec<Deal> = match window {
            Some(window) => {
                normalized_deals.deals.into_iter().filter(|deal| window.contains(deal)).collect()
            }
            None => normalized_deals.deals,
        };
        let in_scope: HashSet<&DealId> = deals.iter().map(|deal| &deal.id).collect();
        let events: Vec<StageEvent> = normalized_events
            .events
            .into_iter()
            .filter(|event| in_scope.contains(&event.deal_id))
            .collect();

        let mut skipped = normalized_deals.skipped;
        skipped.extend(normalized_events.skipped);

        Snapshot { deals, events, skipped }
    }

    pub fn analyze(
        &self,
        deal_records: &[RawRecord],
        event_records: &[RawRecord],
        as_of: DateTime<Utc>,
        window: Option<&SnapshotWindow>,
    ) -> ResultBundle {
        let snapshot = self.normalize(deal_records, event_records, window);
        let histories = self.history_builder().build_all(&snapshot.deals, &snapshot.events);
        self.analyze_with_histories(&snapshot, &histories, as_of)
    }

    /// Aggregation over histories built elsewhere, e.g. on parallel workers.
    /// `histories` must cover the snapshot's deals.
    pub fn analyze_with_histories(
        &self,
        snapshot: &Snapshot,
        histories: &[DealHistory],
        as_of: DateTime<Utc>,
    ) -> ResultBundle {
        let funnel =
            FunnelAggregator::new(&self.pipeline, self.funnel).aggregate(histories, as_of);
        let prioritization = PrioritizationEngine::new(&self.pipeline, &self.scoring).prioritize(
            &snapshot.deals,
            histories,
            as_of,
        );
        let attribution = WinLossAnalyzer::new(&self.pipeline, &self.attribution)
            .analyze(&snapshot.deals, histories);
        let forecast = ForecastEngine::new(&self.pipeline, &self.forecast).forecast(
            &snapshot.deals,
            histories,
            &funnel,
            as_of,
        );

        let mut warnings = attribution.warnings.clone();
        warnings.extend(forecast.warnings.iter().cloned());

        let bundle = ResultBundle {
            as_of,
            pipeline: PipelineSummary::from(&self.pipeline),
            snapshot_checksum: snapshot_checksum(&snapshot.deals, &snapshot.events),
            deals_analyzed: snapshot.deals.len(),
            events_analyzed: snapshot.events.len(),
            skipped_records: snapshot.skipped.clone(),
            warnings,
            funnel,
            prioritization,
            attribution,
            forecast,
        };

        info!(
            event_name = "analysis.run.completed",
            deals = bundle.deals_analyzed,
            events = bundle.events_analyzed,
            skipped = bundle.skipped_records.len(),
            warnings = bundle.warnings.len(),
            checksum = %bundle.snapshot_checksum,
            "pipeline analysis completed"
        );
        bundle
    }
}

/// Order-independent digest of the analyzed population.
pub fn snapshot_checksum(deals: &[Deal], events: &[StageEvent]) -> String {
    let mut deal_lines: Vec<String> = deals
        .iter()
        .map(|deal| {
            format!(
                "deal|{}|{}|{}|{}",
                deal.id,
                deal.amount.normalize(),
                deal.stage,
                deal.status.as_str()
            )
        })
        .collect();
    deal_lines.sort();

    let mut event_lines: Vec<String> = events
        .iter()
        .map(|event| {
            format!(
                "event|{}|{}|{}|{}",
                event.deal_id,
                event.stage,
                event.entered_at.to_rfc3339(),
                event.sequence.map(|sequence| sequence.to_string()).unwrap_or_default()
            )
        })
        .collect();
    event_lines.sort();

    let mut hasher = Sha256::new();
    for line in deal_lines.iter().chain(event_lines.iter()) {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    format!("sha256:{:x}", hasher.finalize())
}
