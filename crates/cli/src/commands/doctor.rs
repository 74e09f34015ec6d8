use frontdesk_core::config::{AppConfig, LoadOptions};
use frontdesk_db::{connect_with_config, migrations};
use serde::Serialize;

use crate::commands::CommandResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Warn,
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

pub fn run(json_output: bool) -> CommandResult {
    let report = build_report();
    let exit_code = if report.overall_status == CheckStatus::Fail { 1 } else { 0 };

    let output = if json_output {
        serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        })
    } else {
        render_human(&report)
    };

    CommandResult { exit_code, output }
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.push(check_messaging(&config));
            checks.extend(check_database(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            for name in ["messaging_readiness", "database_connectivity", "schema_migrations"] {
                checks.push(DoctorCheck {
                    name,
                    status: CheckStatus::Skipped,
                    details: "skipped because configuration did not load".to_string(),
                });
            }
        }
    }

    summarize(checks)
}

fn summarize(checks: Vec<DoctorCheck>) -> DoctorReport {
    let failed = checks
        .iter()
        .any(|check| matches!(check.status, CheckStatus::Fail | CheckStatus::Skipped));
    let warned = checks.iter().any(|check| check.status == CheckStatus::Warn);

    let (overall_status, summary) = match (failed, warned) {
        (true, _) => (CheckStatus::Fail, "doctor: one or more readiness checks failed"),
        (false, true) => (CheckStatus::Warn, "doctor: ready with warnings"),
        (false, false) => (CheckStatus::Pass, "doctor: all readiness checks passed"),
    };

    DoctorReport { overall_status, summary: summary.to_string(), checks }
}

/// A relay url means email and sms leave the process; config validation has
/// already required its api key.
fn check_messaging(config: &AppConfig) -> DoctorCheck {
    match &config.messaging.relay_url {
        Some(relay_url) => DoctorCheck {
            name: "messaging_readiness",
            status: CheckStatus::Pass,
            details: format!("email and sms delivered through `{relay_url}`"),
        },
        None => DoctorCheck {
            name: "messaging_readiness",
            status: CheckStatus::Warn,
            details: "no relay configured; email and sms are logged only".to_string(),
        },
    }
}

fn check_database(config: &AppConfig) -> Vec<DoctorCheck> {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return vec![DoctorCheck {
                name: "database_connectivity",
                status: CheckStatus::Fail,
                details: format!("failed to initialize async runtime: {error}"),
            }];
        }
    };

    runtime.block_on(async {
        let pool = match connect_with_config(&config.database).await {
            Ok(pool) => pool,
            Err(error) => {
                return vec![
                    DoctorCheck {
                        name: "database_connectivity",
                        status: CheckStatus::Fail,
                        details: format!("failed to connect to database: {error}"),
                    },
                    DoctorCheck {
                        name: "schema_migrations",
                        status: CheckStatus::Skipped,
                        details: "skipped because the database is unreachable".to_string(),
                    },
                ];
            }
        };

        let connectivity = DoctorCheck {
            name: "database_connectivity",
            status: CheckStatus::Pass,
            details: format!("connected using `{}`", config.database.url),
        };
        let schema = match migrations::pending_versions(&pool).await {
            Ok(pending) if pending.is_empty() => DoctorCheck {
                name: "schema_migrations",
                status: CheckStatus::Pass,
                details: "schema is up to date".to_string(),
            },
            Ok(pending) => DoctorCheck {
                name: "schema_migrations",
                status: CheckStatus::Warn,
                details: format!(
                    "{} pending migration(s); run `frontdesk migrate`",
                    pending.len()
                ),
            },
            Err(error) => DoctorCheck {
                name: "schema_migrations",
                status: CheckStatus::Fail,
                details: format!("could not read migration state: {error}"),
            },
        };

        pool.close().await;
        vec![connectivity, schema]
    })
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Warn => "warn",
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
