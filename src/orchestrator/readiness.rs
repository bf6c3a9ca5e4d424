//! Waiting for cloud-init inside a freshly launched container.

use crate::engine::executor::CommandExecutor;
use crate::orchestrator::plan::LxcCli;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

const RESULT_PATH: &str = "/run/cloud-init/result.json";

#[derive(Debug, Clone, Copy)]
pub struct ReadinessPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            attempts: 20,
            interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReadinessError {
    #[error("cloud-init in {container} reported errors: {errors}")]
    CloudInit {
        container: String,
        errors: serde_json::Value,
    },
}

/// Poll until cloud-init has written its result file. Returns whether it
/// finished within the policy; reported cloud-init errors are fatal.
pub async fn wait_for_cloud_init<E: CommandExecutor>(
    executor: &E,
    cli: &LxcCli,
    container: &str,
    policy: ReadinessPolicy,
) -> Result<bool, ReadinessError> {
    info!(container, "waiting for cloud-init");
    let cmd = cli.exec_cat(container, RESULT_PATH);
    for attempt in 1..=policy.attempts {
        tokio::time::sleep(policy.interval).await;
        let out = match executor.execute(&cmd).await {
            Ok(out) => out,
            Err(e) => {
                debug!(container, attempt, "result not readable yet: {e}");
                continue;
            }
        };
        if out.trim().is_empty() {
            continue;
        }
        let parsed: serde_json::Value = match serde_json::from_str(&out) {
            Ok(v) => v,
            Err(e) => {
                debug!(container, attempt, "result not parseable yet: {e}");
                continue;
            }
        };
        let errors = parsed
            .pointer("/v1/errors")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        if errors.as_array().is_some_and(|a| !a.is_empty()) {
            return Err(ReadinessError::CloudInit {
                container: container.to_string(),
                errors,
            });
        }
        info!(container, attempt, "cloud-init done");
        return Ok(true);
    }
    warn!(
        container,
        attempts = policy.attempts,
        "cloud-init did not finish, continuing anyway"
    );
    Ok(false)
}
