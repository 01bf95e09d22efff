use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use dealflow_core::config::{parse_dimension_list, AppConfig, ConfigOverrides, LoadOptions};
use dealflow_core::history::group_events_by_deal;
use dealflow_core::normalizer::{parse_timestamp, RawRecord, SnapshotWindow, WindowBasis};
use dealflow_core::{Deal, DealHistory, DealId, PipelineAnalyzer, StageEvent};
use serde::Deserialize;
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{debug, info};
use uuid::Uuid;

use crate::commands::CommandResult;

const COMMAND: &str = "analyze";

#[derive(Debug, Clone, Default)]
pub struct AnalyzeArgs {
    pub config_path: Option<PathBuf>,
    /// Combined `{ "deals": [...], "events": [...] }` file.
    pub snapshot: Option<PathBuf>,
    /// Separate JSON arrays, used when no combined snapshot is given.
    pub deals: Option<PathBuf>,
    pub events: Option<PathBuf>,
    pub as_of: Option<String>,
    pub workers: usize,
    pub window_basis: Option<String>,
    pub window_start: Option<String>,
    pub window_end: Option<String>,
    /// Comma-separated win/loss breakdowns, overriding the config.
    pub dimensions: Option<String>,
    pub pretty: bool,
}

#[derive(Debug, Default, Deserialize)]
struct SnapshotFile {
    #[serde(default)]
    deals: Vec<RawRecord>,
    #[serde(default)]
    events: Vec<RawRecord>,
}

pub fn run(args: AnalyzeArgs) -> CommandResult {
    let overrides = match parse_overrides(&args) {
        Ok(overrides) => overrides,
        Err(error) => return invalid_argument(error),
    };
    let options = LoadOptions {
        require_file: args.config_path.is_some(),
        config_path: args.config_path.clone(),
        overrides,
    };
    let config = match AppConfig::load(options) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                COMMAND,
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };
    let analyzer = match PipelineAnalyzer::from_config(&config) {
        Ok(analyzer) => analyzer,
        Err(error) => {
            return CommandResult::failure(
                COMMAND,
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };

    let (as_of, window) = match parse_run_arguments(&args) {
        Ok(parsed) => parsed,
        Err(error) => return invalid_argument(error),
    };

    let raw = match read_snapshot(&args) {
        Ok(raw) => raw,
        Err(error) => {
            return CommandResult::failure(COMMAND, "snapshot_read", format!("{error:#}"), 3)
        }
    };
    let snapshot_file = match parse_snapshot(&raw) {
        Ok(snapshot) => snapshot,
        Err(error) => {
            return CommandResult::failure(COMMAND, "snapshot_parse", format!("{error:#}"), 4)
        }
    };

    let run_id = Uuid::new_v4().to_string();
    info!(
        event_name = "analysis.run.started",
        correlation_id = %run_id,
        deal_records = snapshot_file.deals.len(),
        event_records = snapshot_file.events.len(),
        workers = args.workers,
        "starting pipeline analysis"
    );

    let analyzer = Arc::new(analyzer);
    let snapshot =
        analyzer.normalize(&snapshot_file.deals, &snapshot_file.events, window.as_ref());
    let histories = match build_histories(
        Arc::clone(&analyzer),
        &snapshot.deals,
        &snapshot.events,
        args.workers,
    ) {
        Ok(histories) => histories,
        Err(error) => {
            return CommandResult::failure(COMMAND, "history_worker", format!("{error:#}"), 6)
        }
    };

    let bundle = analyzer.analyze_with_histories(&snapshot, &histories, as_of);
    let message = format!(
        "analyzed {} deals and {} stage events ({} records skipped)",
        bundle.deals_analyzed,
        bundle.events_analyzed,
        bundle.skipped_records.len()
    );
    let result = match serde_json::to_value(&bundle) {
        Ok(result) => result,
        Err(error) => return CommandResult::failure(COMMAND, "serialization", error.to_string(), 7),
    };

    info!(event_name = "analysis.run.finished", correlation_id = %run_id, "{message}");
    CommandResult::success_with_result(COMMAND, message, &run_id, result, args.pretty)
}

fn invalid_argument(error: anyhow::Error) -> CommandResult {
    CommandResult::failure(COMMAND, "invalid_argument", format!("{error:#}"), 5)
}

fn parse_overrides(args: &AnalyzeArgs) -> Result<ConfigOverrides> {
    let dimensions = match args.dimensions.as_deref() {
        Some(raw) => Some(parse_dimension_list(raw).with_context(|| {
            format!("unsupported --dimensions `{raw}` (expected team, rep or stage_of_loss)")
        })?),
        None => None,
    };
    Ok(ConfigOverrides { dimensions, ..ConfigOverrides::default() })
}

fn parse_run_arguments(args: &AnalyzeArgs) -> Result<(DateTime<Utc>, Option<SnapshotWindow>)> {
    let as_of = match args.as_of.as_deref() {
        Some(raw) => parse_instant("--as-of", raw)?,
        None => Utc::now(),
    };

    let window = match (&args.window_basis, &args.window_start, &args.window_end) {
        (None, None, None) => None,
        (basis, Some(start), Some(end)) => {
            let basis = match basis.as_deref() {
                Some(raw) => WindowBasis::parse(raw)
                    .with_context(|| format!("unsupported --window-basis `{raw}`"))?,
                None => WindowBasis::Created,
            };
            let start = parse_instant("--window-start", start)?;
            let end = parse_window_end(end)?;
            if start > end {
                bail!("--window-start must not be after --window-end");
            }
            Some(SnapshotWindow { basis, start, end })
        }
        _ => bail!("--window-start and --window-end must be given together"),
    };

    Ok((as_of, window))
}

fn parse_instant(flag: &str, raw: &str) -> Result<DateTime<Utc>> {
    parse_timestamp(&Value::String(raw.to_string())).with_context(|| {
        format!("{flag} expects an RFC 3339 timestamp or YYYY-MM-DD date, got `{raw}`")
    })
}

/// A bare date covers the whole day, so it ends at 23:59:59.
fn parse_window_end(raw: &str) -> Result<DateTime<Utc>> {
    match NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d") {
        Ok(date) => date
            .and_hms_opt(23, 59, 59)
            .map(|end| Utc.from_utc_datetime(&end))
            .with_context(|| format!("--window-end `{raw}` has no end of day")),
        Err(_) => parse_instant("--window-end", raw),
    }
}

enum RawSnapshot {
    Combined(String),
    Split { deals: String, events: Option<String> },
}

fn read_snapshot(args: &AnalyzeArgs) -> Result<RawSnapshot> {
    if let Some(path) = &args.snapshot {
        return Ok(RawSnapshot::Combined(read_file(path)?));
    }

    let Some(deals) = &args.deals else {
        bail!("either --snapshot or --deals is required");
    };
    let events = args.events.as_deref().map(read_file).transpose()?;
    Ok(RawSnapshot::Split { deals: read_file(deals)?, events })
}

fn read_file(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("failed to read `{}`", path.display()))
}

fn parse_snapshot(raw: &RawSnapshot) -> Result<SnapshotFile> {
    match raw {
        RawSnapshot::Combined(body) => serde_json::from_str(body)
            .context("snapshot must be a JSON object with `deals` and `events` arrays"),
        RawSnapshot::Split { deals, events } => {
            let deals: Vec<RawRecord> =
                serde_json::from_str(deals).context("deals file must be a JSON array of objects")?;
            let events: Vec<RawRecord> = match events {
                Some(body) => serde_json::from_str(body)
                    .context("events file must be a JSON array of objects")?,
                None => Vec::new(),
            };
            Ok(SnapshotFile { deals, events })
        }
    }
}

/// Fans per-deal history reconstruction out over blocking worker tasks and
/// joins on every chunk. Output order matches `deals`.
fn build_histories(
    analyzer: Arc<PipelineAnalyzer>,
    deals: &[Deal],
    events: &[StageEvent],
    workers: usize,
) -> Result<Vec<DealHistory>> {
    let workers = workers.max(1);
    if deals.is_empty() {
        return Ok(Vec::new());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .max_blocking_threads(workers)
        .build()
        .context("failed to initialize worker runtime")?;

    let grouped: Arc<HashMap<DealId, Vec<StageEvent>>> = Arc::new(group_events_by_deal(events));
    let chunk_size = deals.len().div_ceil(workers);
    let chunks: Vec<Vec<Deal>> = deals.chunks(chunk_size).map(<[Deal]>::to_vec).collect();

    runtime.block_on(async move {
        let mut tasks = JoinSet::new();
        for (index, chunk) in chunks.into_iter().enumerate() {
            let analyzer = Arc::clone(&analyzer);
            let grouped = Arc::clone(&grouped);
            tasks.spawn_blocking(move || {
                let builder = analyzer.history_builder();
                let histories: Vec<DealHistory> = chunk
                    .iter()
                    .map(|deal| {
                        let deal_events =
                            grouped.get(&deal.id).map(Vec::as_slice).unwrap_or(&[]);
                        builder.build(deal, deal_events)
                    })
                    .collect();
                (index, histories)
            });
        }

        let mut completed = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            let (index, histories) = joined.context("history worker panicked")?;
            debug!(
                event_name = "analysis.history.chunk_completed",
                chunk = index,
                deals = histories.len()
            );
            completed.push((index, histories));
        }
        completed.sort_by_key(|(index, _)| *index);
        Ok::<Vec<DealHistory>, anyhow::Error>(
            completed.into_iter().flat_map(|(_, histories)| histories).collect(),
        )
    })
}
