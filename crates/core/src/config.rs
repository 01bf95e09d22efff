use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::attribution::{AttributionConfig, Dimension};
use crate::domain::stage::{PipelineDefinition, StageId};
use crate::errors::ConfigurationError;
use crate::forecast::ForecastConfig;
use crate::funnel::FunnelConfig;
use crate::normalizer::IdentityDirectory;
use crate::prioritization::ScoringConfig;

pub const CONFIG_FILE_NAME: &str = "dealflow.toml";

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AppConfig {
    pub pipeline: PipelineConfig,
    pub scoring: ScoringConfig,
    pub funnel: FunnelConfig,
    pub forecast: ForecastConfig,
    pub attribution: AttributionConfig,
    pub identity: IdentityDirectory,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub stages: Vec<String>,
    /// Every stage that closes a deal as won; the first in pipeline order is
    /// the end of the progress path.
    pub won_stages: Vec<String>,
    pub lost_stages: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
    pub top_n: Option<usize>,
    pub stale_threshold_days: Option<f64>,
    pub quota: Option<Decimal>,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub dimensions: Option<Vec<Dimension>>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
    #[error(transparent)]
    Inconsistent(#[from] ConfigurationError),
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let pipeline = PipelineDefinition::default();
        Self {
            stages: pipeline.stages().iter().map(|stage| stage.0.clone()).collect(),
            won_stages: pipeline.won_stages().iter().map(|stage| stage.0.clone()).collect(),
            lost_stages: pipeline.lost_stages().iter().map(|stage| stage.0.clone()).collect(),
        }
    }
}

impl PipelineConfig {
    pub fn definition(&self) -> Result<PipelineDefinition, ConfigurationError> {
        PipelineDefinition::new(
            self.stages.iter().map(StageId::new).collect(),
            self.won_stages.iter().map(StageId::new).collect(),
            self.lost_stages.iter().map(StageId::new).collect(),
        )
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            scoring: ScoringConfig::default(),
            funnel: FunnelConfig::default(),
            forecast: ForecastConfig::default(),
            attribution: AttributionConfig::default(),
            identity: IdentityDirectory::default(),
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected =
                options.config_path.unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(pipeline) = patch.pipeline {
            if let Some(stages) = pipeline.stages {
                self.pipeline.stages = stages;
            }
            if let Some(won_stages) = pipeline.won_stages {
                self.pipeline.won_stages = won_stages;
            }
            if let Some(lost_stages) = pipeline.lost_stages {
                self.pipeline.lost_stages = lost_stages;
            }
        }

        if let Some(scoring) = patch.scoring {
            if let Some(recency_weight) = scoring.recency_weight {
                self.scoring.recency_weight = recency_weight;
            }
            if let Some(amount_weight) = scoring.amount_weight {
                self.scoring.amount_weight = amount_weight;
            }
            if let Some(stage_weight) = scoring.stage_weight {
                self.scoring.stage_weight = stage_weight;
            }
            if let Some(stale_threshold_days) = scoring.stale_threshold_days {
                self.scoring.stale_threshold_days = stale_threshold_days;
            }
            if let Some(stale_thresholds) = scoring.stale_thresholds {
                self.scoring.stale_thresholds = stale_thresholds;
            }
            if let Some(top_n) = scoring.top_n {
                self.scoring.top_n = top_n;
            }
            if let Some(closing_soon_days) = scoring.closing_soon_days {
                self.scoring.closing_soon_days = closing_soon_days;
            }
        }

        if let Some(funnel) = patch.funnel {
            if let Some(dwell_percentile) = funnel.dwell_percentile {
                self.funnel.dwell_percentile = dwell_percentile;
            }
        }

        if let Some(forecast) = patch.forecast {
            if let Some(min_sample_size) = forecast.min_sample_size {
                self.forecast.min_sample_size = min_sample_size;
            }
            if forecast.quota.is_some() {
                self.forecast.quota = forecast.quota;
            }
            if forecast.period_start.is_some() {
                self.forecast.period_start = forecast.period_start;
            }
            if forecast.period_end.is_some() {
                self.forecast.period_end = forecast.period_end;
            }
        }

        if let Some(attribution) = patch.attribution {
            if let Some(dimensions) = attribution.dimensions {
                self.attribution.dimensions = dimensions;
            }
            if attribution.booked_stage.is_some() {
                self.attribution.booked_stage = attribution.booked_stage;
            }
            if attribution.meeting_done_stage.is_some() {
                self.attribution.meeting_done_stage = attribution.meeting_done_stage;
            }
        }

        if let Some(identity) = patch.identity {
            if let Some(owners) = identity.owners {
                self.identity.owners = owners;
            }
            if let Some(teams) = identity.teams {
                self.identity.teams = teams;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(level) = read_env("DEALFLOW_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = read_env("DEALFLOW_LOG_FORMAT") {
            self.logging.format = format.parse()?;
        }
        if let Some(value) = read_env("DEALFLOW_TOP_N") {
            self.scoring.top_n = parse_usize("DEALFLOW_TOP_N", &value)?;
        }
        if let Some(value) = read_env("DEALFLOW_STALE_THRESHOLD_DAYS") {
            self.scoring.stale_threshold_days =
                parse_f64("DEALFLOW_STALE_THRESHOLD_DAYS", &value)?;
        }
        if let Some(value) = read_env("DEALFLOW_CLOSING_SOON_DAYS") {
            self.scoring.closing_soon_days = parse_i64("DEALFLOW_CLOSING_SOON_DAYS", &value)?;
        }
        if let Some(value) = read_env("DEALFLOW_DWELL_PERCENTILE") {
            self.funnel.dwell_percentile = parse_f64("DEALFLOW_DWELL_PERCENTILE", &value)?;
        }
        if let Some(value) = read_env("DEALFLOW_MIN_SAMPLE_SIZE") {
            self.forecast.min_sample_size = parse_usize("DEALFLOW_MIN_SAMPLE_SIZE", &value)?;
        }
        if let Some(value) = read_env("DEALFLOW_QUOTA") {
            self.forecast.quota = Some(parse_decimal("DEALFLOW_QUOTA", &value)?);
        }
        if let Some(value) = read_env("DEALFLOW_DIMENSIONS") {
            self.attribution.dimensions = parse_dimensions("DEALFLOW_DIMENSIONS", &value)?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(level) = overrides.log_level {
            self.logging.level = level;
        }
        if let Some(format) = overrides.log_format {
            self.logging.format = format;
        }
        if let Some(top_n) = overrides.top_n {
            self.scoring.top_n = top_n;
        }
        if let Some(stale_threshold_days) = overrides.stale_threshold_days {
            self.scoring.stale_threshold_days = stale_threshold_days;
        }
        if overrides.quota.is_some() {
            self.forecast.quota = overrides.quota;
        }
        if overrides.period_start.is_some() {
            self.forecast.period_start = overrides.period_start;
        }
        if overrides.period_end.is_some() {
            self.forecast.period_end = overrides.period_end;
        }
        if let Some(dimensions) = overrides.dimensions {
            self.attribution.dimensions = dimensions;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let pipeline = self.pipeline.definition()?;
        self.scoring.validate(&pipeline)?;
        self.funnel.validate()?;
        self.forecast.validate()?;
        self.attribution.validate(&pipeline)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from(CONFIG_FILE_NAME), PathBuf::from("config").join(CONFIG_FILE_NAME)]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn invalid_override(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.trim().parse::<usize>().map_err(|_| invalid_override(key, value))
}

fn parse_i64(key: &str, value: &str) -> Result<i64, ConfigError> {
    value.trim().parse::<i64>().map_err(|_| invalid_override(key, value))
}

fn parse_f64(key: &str, value: &str) -> Result<f64, ConfigError> {
    value.trim().parse::<f64>().map_err(|_| invalid_override(key, value))
}

fn parse_decimal(key: &str, value: &str) -> Result<Decimal, ConfigError> {
    value.trim().parse::<Decimal>().map_err(|_| invalid_override(key, value))
}

/// Comma-separated dimension names; an empty list is allowed.
pub fn parse_dimension_list(value: &str) -> Option<Vec<Dimension>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(Dimension::parse)
        .collect()
}

fn parse_dimensions(key: &str, value: &str) -> Result<Vec<Dimension>, ConfigError> {
    parse_dimension_list(value).ok_or_else(|| invalid_override(key, value))
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    pipeline: Option<PipelinePatch>,
    scoring: Option<ScoringPatch>,
    funnel: Option<FunnelPatch>,
    forecast: Option<ForecastPatch>,
    attribution: Option<AttributionPatch>,
    identity: Option<IdentityPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct PipelinePatch {
    stages: Option<Vec<String>>,
    won_stages: Option<Vec<String>>,
    lost_stages: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct ScoringPatch {
    recency_weight: Option<f64>,
    amount_weight: Option<f64>,
    stage_weight: Option<f64>,
    stale_threshold_days: Option<f64>,
    stale_thresholds: Option<BTreeMap<String, f64>>,
    top_n: Option<usize>,
    closing_soon_days: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct FunnelPatch {
    dwell_percentile: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct ForecastPatch {
    min_sample_size: Option<usize>,
    quota: Option<Decimal>,
    period_start: Option<DateTime<Utc>>,
    period_end: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
struct AttributionPatch {
    dimensions: Option<Vec<Dimension>>,
    booked_stage: Option<String>,
    meeting_done_stage: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct IdentityPatch {
    owners: Option<BTreeMap<String, String>>,
    teams: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
