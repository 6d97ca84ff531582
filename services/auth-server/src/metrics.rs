//! Prometheus metrics exposition
//!
//! - `auth_tokens_issued_total` (counter): label `type` (`access`, `refresh`)
//! - `auth_verifications_total` (counter): label `result` (`ok` or an error kind)
//! - `auth_key_rotations_total` (counter): label `outcome`
//! - `auth_cli_logins_total` (counter): label `outcome`

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the global Prometheus recorder and return a handle for rendering.
pub fn install_recorder() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus recorder")
}

pub fn record_token_issued(token_type: &str) {
    metrics::counter!("auth_tokens_issued_total", "type" => token_type.to_string()).increment(1);
}

/// `result` is `"ok"` or the error kind of the failed verification.
pub fn record_verification(result: &str) {
    metrics::counter!("auth_verifications_total", "result" => result.to_string()).increment(1);
}

/// `outcome` is `success`, `skipped` (lost a concurrent rotation) or `failure`.
pub fn record_key_rotation(outcome: &str) {
    metrics::counter!("auth_key_rotations_total", "outcome" => outcome.to_string()).increment(1);
}

/// `outcome` is one of `started`, `confirmed`, `completed`, `expired`, `cancelled`.
pub fn record_cli_login(outcome: &str) {
    metrics::counter!("auth_cli_logins_total", "outcome" => outcome.to_string()).increment(1);
}
