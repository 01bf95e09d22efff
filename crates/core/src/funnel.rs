//! Funnel conversion and stage dwell-time aggregation.
//!
//! Conversion is measured between adjacent stages of the progress path. Dwell
//! statistics cover closed time only; deals still sitting in a stage are
//! reported separately as stuck, with elapsed time measured against `as_of`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::stage::{PipelineDefinition, StageId};
use crate::errors::ConfigurationError;
use crate::history::DealHistory;
use crate::stats::{self, median, percentile, ratio, round_days};

pub const DEFAULT_DWELL_PERCENTILE: f64 = 90.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FunnelConfig {
    /// Upper percentile reported next to the median (default: 90)
    pub dwell_percentile: f64,
}

impl Default for FunnelConfig {
    fn default() -> Self {
        Self { dwell_percentile: DEFAULT_DWELL_PERCENTILE }
    }
}

impl FunnelConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let value = self.dwell_percentile;
        if !value.is_finite() || value <= 0.0 || value > 100.0 {
            return Err(ConfigurationError::InvalidPercentile { value });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConversion {
    pub from_stage: String,
    pub to_stage: String,
    pub reached_from: usize,
    pub converted: usize,
    pub rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DwellStats {
    pub stage: String,
    pub sample_count: usize,
    pub median_days: Option<f64>,
    pub percentile: f64,
    pub percentile_days: Option<f64>,
    pub mean_days: Option<f64>,
    pub total_days: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StuckStats {
    pub stage: String,
    pub open_count: usize,
    pub median_elapsed_days: Option<f64>,
    pub max_elapsed_days: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionBottleneck {
    pub from_stage: String,
    pub to_stage: String,
    pub rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DwellBottleneck {
    pub stage: String,
    pub median_days: f64,
}

/// Low conversion and slow dwell are independent signals and may name
/// different stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bottlenecks {
    pub lowest_conversion: Option<ConversionBottleneck>,
    pub slowest_stage: Option<DwellBottleneck>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunnelReport {
    pub conversions: Vec<StageConversion>,
    pub dwell: Vec<DwellStats>,
    pub stuck: Vec<StuckStats>,
    pub bottlenecks: Bottlenecks,
}

impl FunnelReport {
    pub fn rate(&self, from: &StageId, to: &StageId) -> Option<f64> {
        self.conversions
            .iter()
            .find(|row| row.from_stage == from.0 && row.to_stage == to.0)
            .map(|row| row.rate)
    }
}

pub struct FunnelAggregator<'a> {
    pipeline: &'a PipelineDefinition,
    config: FunnelConfig,
}

impl<'a> FunnelAggregator<'a> {
    pub fn new(pipeline: &'a PipelineDefinition, config: FunnelConfig) -> Self {
        Self { pipeline, config }
    }

    pub fn aggregate(&self, histories: &[DealHistory], as_of: DateTime<Utc>) -> FunnelReport {
        let conversions = self.conversions(histories);
        let dwell = self.dwell(histories);
        let stuck = self.stuck(histories, as_of);
        let bottlenecks = Bottlenecks {
            lowest_conversion: lowest_conversion(&conversions),
            slowest_stage: slowest_stage(&dwell),
        };

        FunnelReport { conversions, dwell, stuck, bottlenecks }
    }

    fn conversions(&self, histories: &[DealHistory]) -> Vec<StageConversion> {
        let pipeline = self.pipeline;
        pipeline
            .progress_path()
            .windows(2)
            .map(|pair| {
                let (from, to) = (pair[0], pair[1]);
                let reached_from =
                    histories.iter().filter(|history| history.reached(pipeline, from)).count();
                let converted = histories
                    .iter()
                    .filter(|history| history.reached_after(pipeline, from, to))
                    .count();

                StageConversion {
                    from_stage: from.0.clone(),
                    to_stage: to.0.clone(),
                    reached_from,
                    converted,
                    rate: ratio(converted, reached_from),
                }
            })
            .collect()
    }

    fn dwell(&self, histories: &[DealHistory]) -> Vec<DwellStats> {
        self.non_terminal_stages()
            .map(|stage| {
                // One sample per deal: re-entries accumulate.
                let mut samples: Vec<f64> = histories
                    .iter()
                    .filter_map(|history| {
                        let closed: Vec<f64> = history
                            .intervals
                            .iter()
                            .filter(|interval| interval.stage == *stage)
                            .filter_map(|interval| interval.closed_days())
                            .collect();
                        (!closed.is_empty()).then(|| closed.iter().sum::<f64>().max(0.0))
                    })
                    .collect();
                stats::sort_ascending(&mut samples);

                DwellStats {
                    stage: stage.0.clone(),
                    sample_count: samples.len(),
                    median_days: median(&samples).map(round_days),
                    percentile: self.config.dwell_percentile,
                    percentile_days: percentile(&samples, self.config.dwell_percentile)
                        .map(round_days),
                    mean_days: stats::mean(&samples).map(round_days),
                    total_days: round_days(samples.iter().sum()),
                }
            })
            .collect()
    }

    fn stuck(&self, histories: &[DealHistory], as_of: DateTime<Utc>) -> Vec<StuckStats> {
        self.non_terminal_stages()
            .map(|stage| {
                let mut elapsed: Vec<f64> = histories
                    .iter()
                    .filter_map(|history| history.current())
                    .filter(|interval| interval.stage == *stage)
                    .map(|interval| interval.elapsed_days(as_of))
                    .collect();
                stats::sort_ascending(&mut elapsed);

                StuckStats {
                    stage: stage.0.clone(),
                    open_count: elapsed.len(),
                    median_elapsed_days: median(&elapsed).map(round_days),
                    max_elapsed_days: elapsed.last().copied().map(round_days),
                }
            })
            .collect()
    }

    fn non_terminal_stages(&self) -> impl Iterator<Item = &'a StageId> + 'a {
        let pipeline = self.pipeline;
        pipeline.stages().iter().filter(move |stage| !pipeline.is_terminal(stage))
    }
}

fn lowest_conversion(conversions: &[StageConversion]) -> Option<ConversionBottleneck> {
    let mut lowest: Option<&StageConversion> = None;
    for row in conversions.iter().filter(|row| row.reached_from > 0) {
        if lowest.map(|current| row.rate < current.rate).unwrap_or(true) {
            lowest = Some(row);
        }
    }

    lowest.map(|row| ConversionBottleneck {
        from_stage: row.from_stage.clone(),
        to_stage: row.to_stage.clone(),
        rate: row.rate,
    })
}

fn slowest_stage(dwell: &[DwellStats]) -> Option<DwellBottleneck> {
    let mut slowest: Option<(&DwellStats, f64)> = None;
    for row in dwell {
        let Some(median_days) = row.median_days else {
            continue;
        };
        if slowest.map(|(_, current)| median_days > current).unwrap_or(true) {
            slowest = Some((row, median_days));
        }
    }

    slowest.map(|(row, median_days)| DwellBottleneck { stage: row.stage.clone(), median_days })
}
