//! Runtime configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// The mounted service account file identifying the namespace this instance runs in.
const SERVICE_ACCOUNT_NAMESPACE_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The name of the spawner deployment whose projects are to be reaped.
    #[serde(default)]
    pub application_name: Option<String>,
    /// Fallback identity used when no application name is configured.
    #[serde(default)]
    pub workshop_name: Option<String>,
    /// The port used for HTTP healthchecks and metrics.
    #[serde(default = "Config::default_http_port")]
    pub http_port: u16,
    /// The duration in seconds without proof of life after which a resource is reaped.
    ///
    /// Deployments with named users typically want a longer grace period than
    /// anonymous ones, so this is configuration rather than a constant.
    #[serde(default = "Config::default_grace_period_seconds")]
    pub grace_period_seconds: u64,
    /// The pause in seconds between reconciliation cycles.
    #[serde(default = "Config::default_reconcile_interval_seconds")]
    pub reconcile_interval_seconds: u64,

    /// The Kubernetes namespace this instance is running in.
    ///
    /// This value is read from the mounted service account, not from the environment.
    #[serde(skip, default)]
    pub namespace: String,
    /// The effective deployment identity used for resource filtering.
    ///
    /// Derived from `application_name`, falling back to `workshop_name`.
    #[serde(skip, default)]
    pub deployment_name: String,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Parses the runtime environment, then resolves the fields which do not
    /// come from the environment: the control namespace from the mounted
    /// service account, and the effective deployment identity.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let mut config: Config = envy::from_env().context("error building config from env")?;
        config.namespace = std::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE_FILE)
            .context("error reading service account namespace file")?
            .trim()
            .to_string();
        config.deployment_name = Self::deployment_identity(config.application_name.as_deref(), config.workshop_name.as_deref())?;
        Ok(config)
    }

    /// Resolve the effective deployment identity from the configured names.
    pub fn deployment_identity(application_name: Option<&str>, workshop_name: Option<&str>) -> Result<String> {
        application_name
            .filter(|name| !name.is_empty())
            .or_else(|| workshop_name.filter(|name| !name.is_empty()))
            .map(String::from)
            .context("APPLICATION_NAME or WORKSHOP_NAME must be set")
    }

    /// The name of the spawner service account which creates projects.
    pub fn spawner_account(&self) -> String {
        format!("{}-spawner", self.deployment_name)
    }

    /// The fully qualified requestor identity recorded on spawned projects.
    pub fn requestor(&self) -> String {
        format!("system:serviceaccount:{}:{}", self.namespace, self.spawner_account())
    }

    /// The grace period applied before reaping idle resources.
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_seconds)
    }

    /// The pause between reconciliation cycles.
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_seconds)
    }

    fn default_http_port() -> u16 {
        8080
    }

    fn default_grace_period_seconds() -> u64 {
        90
    }

    fn default_reconcile_interval_seconds() -> u64 {
        60
    }
}
