use std::fs;
use std::path::{Path, PathBuf};

use dealflow_core::config::{AppConfig, LoadOptions};
use dealflow_core::PipelineAnalyzer;
use serde::Serialize;
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool, config_path: Option<PathBuf>, snapshot: Option<PathBuf>) -> String {
    let report = build_report(config_path, snapshot.as_deref());

    if json_output {
        return serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\
                 \"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        });
    }

    render_human(&report)
}

fn build_report(config_path: Option<PathBuf>, snapshot: Option<&Path>) -> DoctorReport {
    let mut checks = Vec::new();
    let options = LoadOptions {
        require_file: config_path.is_some(),
        config_path,
        ..LoadOptions::default()
    };

    match AppConfig::load(options) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.push(check_pipeline(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            checks.push(DoctorCheck {
                name: "pipeline_definition",
                status: CheckStatus::Skipped,
                details: "skipped because configuration did not load".to_string(),
            });
        }
    }

    checks.push(check_snapshot(snapshot));

    let all_pass = checks.iter().all(|check| check.status != CheckStatus::Fail);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_pipeline(config: &AppConfig) -> DoctorCheck {
    match PipelineAnalyzer::from_config(config) {
        Ok(analyzer) => {
            let pipeline = analyzer.pipeline();
            let path: Vec<&str> =
                pipeline.progress_path().iter().map(|stage| stage.as_str()).collect();
            let won: Vec<&str> = pipeline.won_stages().iter().map(|stage| stage.as_str()).collect();
            DoctorCheck {
                name: "pipeline_definition",
                status: CheckStatus::Pass,
                details: format!(
                    "{} stages, won stages {}, progress path {}",
                    pipeline.stages().len(),
                    won.join(", "),
                    path.join(" -> ")
                ),
            }
        }
        Err(error) => DoctorCheck {
            name: "pipeline_definition",
            status: CheckStatus::Fail,
            details: error.to_string(),
        },
    }
}

fn check_snapshot(snapshot: Option<&Path>) -> DoctorCheck {
    let Some(path) = snapshot else {
        return DoctorCheck {
            name: "snapshot_readability",
            status: CheckStatus::Skipped,
            details: "no --snapshot given".to_string(),
        };
    };

    let parsed = fs::read_to_string(path)
        .map_err(|error| format!("failed to read `{}`: {error}", path.display()))
        .and_then(|raw| {
            serde_json::from_str::<Value>(&raw)
                .map_err(|error| format!("`{}` is not valid JSON: {error}", path.display()))
        });

    match parsed {
        Ok(document) => {
            let count = |key: &str| {
                document.get(key).and_then(Value::as_array).map(Vec::len).unwrap_or(0)
            };
            DoctorCheck {
                name: "snapshot_readability",
                status: CheckStatus::Pass,
                details: format!(
                    "{} deal records, {} event records",
                    count("deals"),
                    count("events")
                ),
            }
        }
        Err(details) => {
            DoctorCheck { name: "snapshot_readability", status: CheckStatus::Fail, details }
        }
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
