//! Operator configuration
//!
//! Every flag falls back to a `CIRRUS_*` environment variable so the
//! deployment manifest can configure the operator without arguments.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use cirrus_backend::{BackendConfig, TokenSource};
use cirrus_common::retry::RetryConfig;
use cirrus_common::telemetry::{LogFormat, TelemetryConfig};
use cirrus_compute::ReconcileSettings;

/// Cirrus compute operator
#[derive(Parser, Debug, Clone)]
#[command(name = "cirrus-operator", version, about, long_about = None)]
pub struct OperatorConfig {
    /// Print CRD manifests and exit
    #[arg(long)]
    pub crd: bool,

    /// Apply CRD manifests to the cluster on startup
    #[arg(long, env = "CIRRUS_INSTALL_CRDS", default_value_t = true, action = clap::ArgAction::Set)]
    pub install_crds: bool,

    /// Region service base URL
    #[arg(long, env = "CIRRUS_REGION_URL", default_value = "http://region.cirrus-system:8080")]
    pub region_url: String,

    /// Identity service base URL
    #[arg(long, env = "CIRRUS_IDENTITY_URL", default_value = "http://identity.cirrus-system:8080")]
    pub identity_url: String,

    /// Bearer token for both services
    #[arg(long, env = "CIRRUS_TOKEN", hide_env_values = true, conflicts_with = "token_file")]
    pub token: Option<String>,

    /// File holding the bearer token, re-read before every pass
    #[arg(long, env = "CIRRUS_TOKEN_FILE")]
    pub token_file: Option<PathBuf>,

    /// Objects of each kind reconciled in parallel
    #[arg(long, env = "CIRRUS_WORKERS", default_value_t = 8)]
    pub workers: u16,

    /// Deadline for one reconcile pass, in seconds
    #[arg(long, env = "CIRRUS_PASS_TIMEOUT_SECS", default_value_t = 120)]
    pub pass_timeout_secs: u64,

    /// Per-request timeout for backend calls, in seconds
    #[arg(long, env = "CIRRUS_REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    pub request_timeout_secs: u64,

    /// First requeue delay after a yield, in milliseconds
    #[arg(long, env = "CIRRUS_YIELD_INITIAL_MS", default_value_t = 2000)]
    pub yield_initial_ms: u64,

    /// Upper bound on the requeue delay after a yield, in milliseconds
    #[arg(long, env = "CIRRUS_YIELD_MAX_MS", default_value_t = 60_000)]
    pub yield_max_ms: u64,

    /// Log format: json or text
    #[arg(long, env = "CIRRUS_LOG_FORMAT", default_value = "json")]
    pub log_format: LogFormat,
}

impl OperatorConfig {
    /// Backend connection settings
    pub fn backend(&self) -> anyhow::Result<BackendConfig> {
        let token = match (&self.token, &self.token_file) {
            (Some(token), _) => TokenSource::Static(token.clone()),
            (None, Some(path)) => TokenSource::File(path.clone()),
            (None, None) => anyhow::bail!("one of --token or --token-file is required"),
        };

        Ok(BackendConfig {
            region_url: self.region_url.clone(),
            identity_url: self.identity_url.clone(),
            token,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        })
    }

    /// Reconcile pass timing
    pub fn settings(&self) -> anyhow::Result<ReconcileSettings> {
        if self.yield_initial_ms == 0 || self.yield_initial_ms > self.yield_max_ms {
            anyhow::bail!(
                "yield backoff must satisfy 0 < initial ({}ms) <= max ({}ms)",
                self.yield_initial_ms,
                self.yield_max_ms
            );
        }

        Ok(ReconcileSettings {
            pass_timeout: Duration::from_secs(self.pass_timeout_secs),
            yield_backoff: RetryConfig::for_yield(
                Duration::from_millis(self.yield_initial_ms),
                Duration::from_millis(self.yield_max_ms),
            ),
            ..ReconcileSettings::default()
        })
    }

    /// Worker count, at least one
    pub fn concurrency(&self) -> u16 {
        self.workers.max(1)
    }

    /// Subscriber settings
    pub fn telemetry(&self) -> TelemetryConfig {
        TelemetryConfig {
            service_name: "cirrus-operator".to_string(),
            format: self.log_format,
        }
    }
}
