use std::path::PathBuf;

use askops_agent::prompt::PromptBuilder;
use askops_agent::sandbox::{ExecutionKind, Sandbox};
use askops_core::config::AppConfig;
use askops_db::{connect_with_settings, migrations};
use serde::Serialize;

use crate::commands::load_options;

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

const DEPENDENT_CHECKS: [&str; 3] = ["session_store", "prompt_template", "sandbox_environment"];

/// Exit code 0 when every check passes, 1 otherwise.
pub fn run(config_path: Option<PathBuf>, json_output: bool) -> (u8, String) {
    let report = build_report(config_path);
    let exit_code = if report.overall_status == CheckStatus::Pass { 0 } else { 1 };

    if json_output {
        let output = serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        });
        return (exit_code, output);
    }

    (exit_code, render_human(&report))
}

fn build_report(config_path: Option<PathBuf>) -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(load_options(config_path)) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.extend(run_dependent_checks(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            checks.extend(DEPENDENT_CHECKS.into_iter().map(|name| DoctorCheck {
                name,
                status: CheckStatus::Skipped,
                details: "skipped because configuration did not load".to_string(),
            }));
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn run_dependent_checks(config: &AppConfig) -> Vec<DoctorCheck> {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return DEPENDENT_CHECKS
                .into_iter()
                .map(|name| DoctorCheck {
                    name,
                    status: CheckStatus::Fail,
                    details: format!("failed to initialize async runtime: {error}"),
                })
                .collect();
        }
    };

    runtime.block_on(async {
        vec![
            check_session_store(config).await,
            check_prompt_template(config),
            check_sandbox(config).await,
        ]
    })
}

async fn check_session_store(config: &AppConfig) -> DoctorCheck {
    let result = async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| format!("failed to connect to database: {error}"))?;
        migrations::run_pending(&pool)
            .await
            .map_err(|error| format!("failed to apply migrations: {error}"))?;
        pool.close().await;
        Ok::<(), String>(())
    }
    .await;

    match result {
        Ok(()) => DoctorCheck {
            name: "session_store",
            status: CheckStatus::Pass,
            details: format!("connected and migrated `{}`", config.database.url),
        },
        Err(error) => DoctorCheck { name: "session_store", status: CheckStatus::Fail, details: error },
    }
}

fn check_prompt_template(config: &AppConfig) -> DoctorCheck {
    let rendered = PromptBuilder::new(config.agent.custom_prompt_path.as_deref())
        .and_then(|builder| builder.system_prompt(&[]));
    match rendered {
        Ok(prompt) => DoctorCheck {
            name: "prompt_template",
            status: CheckStatus::Pass,
            details: format!("system prompt rendered ({} chars)", prompt.len()),
        },
        Err(error) => DoctorCheck {
            name: "prompt_template",
            status: CheckStatus::Fail,
            details: error.to_string(),
        },
    }
}

/// Must run inside a tokio runtime; the sandbox refuses to start without one.
async fn check_sandbox(config: &AppConfig) -> DoctorCheck {
    if !config.agent.code_tool_enabled {
        return DoctorCheck {
            name: "sandbox_environment",
            status: CheckStatus::Pass,
            details: "code tool disabled by agent.code_tool_enabled".to_string(),
        };
    }

    match Sandbox::from_config(&config.sandbox) {
        Ok(sandbox) => {
            let probe = sandbox.run("result = str(6 * 7)").await;
            let status =
                if probe.kind == ExecutionKind::Value { CheckStatus::Pass } else { CheckStatus::Fail };
            DoctorCheck {
                name: "sandbox_environment",
                status,
                details: format!(
                    "probe returned {:?} `{}` (timeout {}ms, {} built-ins)",
                    probe.kind,
                    probe.text,
                    sandbox.timeout().as_millis(),
                    sandbox.allowlist().names().count()
                ),
            }
        }
        Err(error) => DoctorCheck {
            name: "sandbox_environment",
            status: CheckStatus::Fail,
            details: error.to_string(),
        },
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
