use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use dealflow_core::config::{AppConfig, LoadOptions, CONFIG_FILE_NAME};
use toml::Value;

pub fn run(config_path: Option<PathBuf>) -> String {
    let options = LoadOptions {
        require_file: config_path.is_some(),
        config_path: config_path.clone(),
        ..LoadOptions::default()
    };
    let config = match AppConfig::load(options) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = config_path.filter(|path| path.exists()).or_else(detect_config_path);
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());
    let source = |key_path: &str, env_key: Option<&str>| {
        field_source(key_path, env_key, config_file_doc.as_ref(), config_file_path.as_deref())
    };

    let mut lines =
        vec!["effective config (source precedence: override > env > file > default):".to_string()];

    lines.push(render_line(
        "pipeline.stages",
        &config.pipeline.stages.join(", "),
        source("pipeline.stages", None),
    ));
    lines.push(render_line(
        "pipeline.won_stages",
        &config.pipeline.won_stages.join(", "),
        source("pipeline.won_stages", None),
    ));
    lines.push(render_line(
        "pipeline.lost_stages",
        &config.pipeline.lost_stages.join(", "),
        source("pipeline.lost_stages", None),
    ));

    let scoring = &config.scoring;
    lines.push(render_line(
        "scoring.recency_weight",
        &scoring.recency_weight.to_string(),
        source("scoring.recency_weight", None),
    ));
    lines.push(render_line(
        "scoring.amount_weight",
        &scoring.amount_weight.to_string(),
        source("scoring.amount_weight", None),
    ));
    lines.push(render_line(
        "scoring.stage_weight",
        &scoring.stage_weight.to_string(),
        source("scoring.stage_weight", None),
    ));
    lines.push(render_line(
        "scoring.stale_threshold_days",
        &scoring.stale_threshold_days.to_string(),
        source("scoring.stale_threshold_days", Some("DEALFLOW_STALE_THRESHOLD_DAYS")),
    ));
    let stage_thresholds = if scoring.stale_thresholds.is_empty() {
        "<none>".to_string()
    } else {
        scoring
            .stale_thresholds
            .iter()
            .map(|(stage, days)| format!("{stage}={days}"))
            .collect::<Vec<_>>()
            .join(", ")
    };
    lines.push(render_line(
        "scoring.stale_thresholds",
        &stage_thresholds,
        source("scoring.stale_thresholds", None),
    ));
    lines.push(render_line(
        "scoring.top_n",
        &scoring.top_n.to_string(),
        source("scoring.top_n", Some("DEALFLOW_TOP_N")),
    ));
    lines.push(render_line(
        "scoring.closing_soon_days",
        &scoring.closing_soon_days.to_string(),
        source("scoring.closing_soon_days", Some("DEALFLOW_CLOSING_SOON_DAYS")),
    ));

    lines.push(render_line(
        "funnel.dwell_percentile",
        &config.funnel.dwell_percentile.to_string(),
        source("funnel.dwell_percentile", Some("DEALFLOW_DWELL_PERCENTILE")),
    ));

    let forecast = &config.forecast;
    lines.push(render_line(
        "forecast.min_sample_size",
        &forecast.min_sample_size.to_string(),
        source("forecast.min_sample_size", Some("DEALFLOW_MIN_SAMPLE_SIZE")),
    ));
    lines.push(render_line(
        "forecast.quota",
        &forecast.quota.map(|quota| quota.to_string()).unwrap_or_else(|| "<unset>".to_string()),
        source("forecast.quota", Some("DEALFLOW_QUOTA")),
    ));
    lines.push(render_line(
        "forecast.period_start",
        &forecast
            .period_start
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "<current quarter>".to_string()),
        source("forecast.period_start", None),
    ));
    lines.push(render_line(
        "forecast.period_end",
        &forecast
            .period_end
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "<current quarter>".to_string()),
        source("forecast.period_end", None),
    ));

    let attribution = &config.attribution;
    let dimensions: Vec<&str> =
        attribution.dimensions.iter().map(|dimension| dimension.as_str()).collect();
    lines.push(render_line(
        "attribution.dimensions",
        &dimensions.join(", "),
        source("attribution.dimensions", Some("DEALFLOW_DIMENSIONS")),
    ));
    lines.push(render_line(
        "attribution.booked_stage",
        attribution.booked_stage.as_deref().unwrap_or("<second progress stage>"),
        source("attribution.booked_stage", None),
    ));
    lines.push(render_line(
        "attribution.meeting_done_stage",
        attribution.meeting_done_stage.as_deref().unwrap_or("<third progress stage>"),
        source("attribution.meeting_done_stage", None),
    ));

    lines.push(render_line(
        "identity.owners",
        &format!("{} aliases", config.identity.owners.len()),
        source("identity.owners", None),
    ));
    lines.push(render_line(
        "identity.teams",
        &format!("{} assignments", config.identity.teams.len()),
        source("identity.teams", None),
    ));

    lines.push(render_line(
        "logging.level",
        &config.logging.level,
        source("logging.level", Some("DEALFLOW_LOG_LEVEL")),
    ));
    lines.push(render_line(
        "logging.format",
        &format!("{:?}", config.logging.format),
        source("logging.format", Some("DEALFLOW_LOG_FORMAT")),
    ));

    lines.join("\n")
}

fn detect_config_path() -> Option<PathBuf> {
    let root = PathBuf::from(CONFIG_FILE_NAME);
    if root.exists() {
        return Some(root);
    }

    let nested = PathBuf::from("config").join(CONFIG_FILE_NAME);
    if nested.exists() {
        return Some(nested);
    }

    None
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: Option<&str>,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_key {
        if env::var(env_key).map(|value| !value.trim().is_empty()).unwrap_or(false) {
            return format!("env ({env_key})");
        }
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}
