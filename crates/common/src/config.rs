//! Suite configuration.
//!
//! Configuration is loaded from environment variables so the same test
//! binaries can run against kind, kubeadm and cloud clusters without
//! rebuilding. Every value has a default suitable for a local kind cluster.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default kubectl binary.
pub const DEFAULT_KUBECTL: &str = "kubectl";

/// Default policy CLI binary.
pub const DEFAULT_CALICOCTL: &str = "calicoctl";

/// Default Linux probe image. Must ship `sh` plus `wget` or `curl`.
pub const DEFAULT_PROBE_IMAGE: &str = "busybox:1.36";

/// Default Windows probe image. Must ship PowerShell.
pub const DEFAULT_WINDOWS_PROBE_IMAGE: &str = "mcr.microsoft.com/windows/servercore:ltsc2022";

/// Default echo server image used as a probe target.
pub const DEFAULT_ECHO_IMAGE: &str = "registry.k8s.io/echoserver:1.10";

/// Default retry budget for one connectivity assertion.
pub const DEFAULT_PROBE_BUDGET_SECONDS: u64 = 30;

/// Upper bound on the retry budget.
pub const MAX_PROBE_BUDGET_SECONDS: u64 = 600;

/// Default sleep between connectivity attempts.
pub const DEFAULT_PROBE_INTERVAL_MS: u64 = 1000;

/// Default time allowed for a canary pod to become Ready.
pub const DEFAULT_POD_READY_TIMEOUT_SECONDS: u64 = 120;

/// Default prefix for test namespaces.
pub const DEFAULT_NAMESPACE_PREFIX: &str = "netpol-e2e";

/// Default Felix Prometheus metrics port.
pub const DEFAULT_FELIX_METRICS_PORT: u16 = 9091;

/// Longest namespace prefix that still leaves room for a unique suffix
/// inside the 63 character DNS label limit.
const MAX_NAMESPACE_PREFIX_LEN: usize = 40;

/// HTTP client used inside Linux probe pods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeClient {
    Wget,
    Curl,
}

impl fmt::Display for ProbeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeClient::Wget => write!(f, "wget"),
            ProbeClient::Curl => write!(f, "curl"),
        }
    }
}

/// Configuration for one run of the suite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteConfig {
    /// kubectl binary (default: "kubectl").
    pub kubectl: String,

    /// Policy CLI binary (default: "calicoctl").
    pub calicoctl: String,

    /// Image for Linux canary pods.
    pub probe_image: String,

    /// Image for Windows canary pods.
    pub windows_probe_image: String,

    /// Image for echo server targets.
    pub echo_image: String,

    /// Retry budget in seconds for one connectivity assertion.
    pub probe_budget_seconds: u64,

    /// Sleep between attempts in milliseconds.
    pub probe_interval_ms: u64,

    /// Time allowed for a canary pod to become Ready.
    pub pod_ready_timeout_seconds: u64,

    /// Prefix for generated test namespaces.
    pub namespace_prefix: String,

    /// Port Felix serves Prometheus metrics on.
    pub felix_metrics_port: u16,

    /// Client used by Linux probe pods.
    pub probe_client: ProbeClient,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid probe budget configuration: {0}")]
    InvalidProbeBudget(String),

    #[error("Invalid probe interval configuration: {0}")]
    InvalidProbeInterval(String),

    #[error("Invalid pod ready timeout configuration: {0}")]
    InvalidPodReadyTimeout(String),

    #[error("Invalid namespace prefix: {0}")]
    InvalidNamespacePrefix(String),

    #[error("Invalid Felix metrics port: {0}")]
    InvalidMetricsPort(String),

    #[error("Invalid probe client: {0}")]
    InvalidProbeClient(String),
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            kubectl: DEFAULT_KUBECTL.to_string(),
            calicoctl: DEFAULT_CALICOCTL.to_string(),
            probe_image: DEFAULT_PROBE_IMAGE.to_string(),
            windows_probe_image: DEFAULT_WINDOWS_PROBE_IMAGE.to_string(),
            echo_image: DEFAULT_ECHO_IMAGE.to_string(),
            probe_budget_seconds: DEFAULT_PROBE_BUDGET_SECONDS,
            probe_interval_ms: DEFAULT_PROBE_INTERVAL_MS,
            pod_ready_timeout_seconds: DEFAULT_POD_READY_TIMEOUT_SECONDS,
            namespace_prefix: DEFAULT_NAMESPACE_PREFIX.to_string(),
            felix_metrics_port: DEFAULT_FELIX_METRICS_PORT,
            probe_client: ProbeClient::Wget,
        }
    }
}

impl SuiteConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let string_or = |key: &str, default: String| vars.get(key).cloned().unwrap_or(default);

        let probe_budget_seconds = match vars.get("PROBE_BUDGET_SECONDS") {
            Some(value_str) => {
                let value: u64 = value_str.parse().map_err(|e| {
                    ConfigError::InvalidProbeBudget(format!(
                        "PROBE_BUDGET_SECONDS must be a valid positive integer, got '{value_str}': {e}"
                    ))
                })?;

                if value == 0 {
                    return Err(ConfigError::InvalidProbeBudget(
                        "PROBE_BUDGET_SECONDS must be greater than 0".to_string(),
                    ));
                }

                if value > MAX_PROBE_BUDGET_SECONDS {
                    return Err(ConfigError::InvalidProbeBudget(format!(
                        "PROBE_BUDGET_SECONDS must not exceed {MAX_PROBE_BUDGET_SECONDS} seconds, got {value}"
                    )));
                }

                value
            }
            None => defaults.probe_budget_seconds,
        };

        let probe_interval_ms = match vars.get("PROBE_INTERVAL_MS") {
            Some(value_str) => {
                let value: u64 = value_str.parse().map_err(|e| {
                    ConfigError::InvalidProbeInterval(format!(
                        "PROBE_INTERVAL_MS must be a valid positive integer, got '{value_str}': {e}"
                    ))
                })?;

                if value == 0 {
                    return Err(ConfigError::InvalidProbeInterval(
                        "PROBE_INTERVAL_MS must be greater than 0".to_string(),
                    ));
                }

                value
            }
            None => defaults.probe_interval_ms,
        };

        let pod_ready_timeout_seconds = match vars.get("POD_READY_TIMEOUT_SECONDS") {
            Some(value_str) => {
                let value: u64 = value_str.parse().map_err(|e| {
                    ConfigError::InvalidPodReadyTimeout(format!(
                        "POD_READY_TIMEOUT_SECONDS must be a valid positive integer, got '{value_str}': {e}"
                    ))
                })?;

                if value == 0 {
                    return Err(ConfigError::InvalidPodReadyTimeout(
                        "POD_READY_TIMEOUT_SECONDS must be greater than 0".to_string(),
                    ));
                }

                value
            }
            None => defaults.pod_ready_timeout_seconds,
        };

        let namespace_prefix = string_or("TEST_NAMESPACE_PREFIX", defaults.namespace_prefix);
        validate_namespace_prefix(&namespace_prefix)?;

        let felix_metrics_port = match vars.get("FELIX_METRICS_PORT") {
            Some(value_str) => {
                let value: u16 = value_str.parse().map_err(|e| {
                    ConfigError::InvalidMetricsPort(format!(
                        "FELIX_METRICS_PORT must be a valid port number, got '{value_str}': {e}"
                    ))
                })?;

                if value == 0 {
                    return Err(ConfigError::InvalidMetricsPort(
                        "FELIX_METRICS_PORT must be greater than 0".to_string(),
                    ));
                }

                value
            }
            None => defaults.felix_metrics_port,
        };

        let probe_client = match vars.get("PROBE_CLIENT").map(String::as_str) {
            None | Some("wget") => ProbeClient::Wget,
            Some("curl") => ProbeClient::Curl,
            Some(other) => {
                return Err(ConfigError::InvalidProbeClient(format!(
                    "PROBE_CLIENT must be 'wget' or 'curl', got '{other}'"
                )))
            }
        };

        Ok(Self {
            kubectl: string_or("KUBECTL", defaults.kubectl),
            calicoctl: string_or("CALICOCTL", defaults.calicoctl),
            probe_image: string_or("PROBE_IMAGE", defaults.probe_image),
            windows_probe_image: string_or("WINDOWS_PROBE_IMAGE", defaults.windows_probe_image),
            echo_image: string_or("ECHO_IMAGE", defaults.echo_image),
            probe_budget_seconds,
            probe_interval_ms,
            pod_ready_timeout_seconds,
            namespace_prefix,
            felix_metrics_port,
            probe_client,
        })
    }

    /// Retry budget for one connectivity assertion.
    #[must_use]
    pub fn probe_budget(&self) -> Duration {
        Duration::from_secs(self.probe_budget_seconds)
    }

    /// Sleep between connectivity attempts.
    #[must_use]
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    /// Time allowed for a canary pod to become Ready.
    #[must_use]
    pub fn pod_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.pod_ready_timeout_seconds)
    }
}

/// Namespace prefixes become part of a DNS-1123 label.
fn validate_namespace_prefix(prefix: &str) -> Result<(), ConfigError> {
    if prefix.is_empty() {
        return Err(ConfigError::InvalidNamespacePrefix(
            "TEST_NAMESPACE_PREFIX must not be empty".to_string(),
        ));
    }

    if prefix.len() > MAX_NAMESPACE_PREFIX_LEN {
        return Err(ConfigError::InvalidNamespacePrefix(format!(
            "TEST_NAMESPACE_PREFIX must be at most {MAX_NAMESPACE_PREFIX_LEN} characters, got {}",
            prefix.len()
        )));
    }

    let valid_chars = prefix
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let valid_edges = prefix.starts_with(|c: char| c.is_ascii_lowercase())
        && !prefix.ends_with('-');

    if !valid_chars || !valid_edges {
        return Err(ConfigError::InvalidNamespacePrefix(format!(
            "TEST_NAMESPACE_PREFIX must be a lowercase DNS label prefix, got '{prefix}'"
        )));
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vars_success_with_defaults() {
        let vars = HashMap::new();

        let config = SuiteConfig::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.kubectl, "kubectl");
        assert_eq!(config.calicoctl, "calicoctl");
        assert_eq!(config.probe_image, DEFAULT_PROBE_IMAGE);
        assert_eq!(config.echo_image, DEFAULT_ECHO_IMAGE);
        assert_eq!(config.probe_budget(), Duration::from_secs(30));
        assert_eq!(config.probe_interval(), Duration::from_secs(1));
        assert_eq!(config.pod_ready_timeout(), Duration::from_secs(120));
        assert_eq!(config.namespace_prefix, "netpol-e2e");
        assert_eq!(config.felix_metrics_port, 9091);
        assert_eq!(config.probe_client, ProbeClient::Wget);
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let vars = HashMap::from([
            ("KUBECTL".to_string(), "/usr/local/bin/kubectl".to_string()),
            ("CALICOCTL".to_string(), "/opt/calicoctl".to_string()),
            ("PROBE_IMAGE".to_string(), "curlimages/curl:8.5.0".to_string()),
            ("PROBE_BUDGET_SECONDS".to_string(), "45".to_string()),
            ("PROBE_INTERVAL_MS".to_string(), "250".to_string()),
            ("POD_READY_TIMEOUT_SECONDS".to_string(), "30".to_string()),
            ("TEST_NAMESPACE_PREFIX".to_string(), "calico-e2e".to_string()),
            ("FELIX_METRICS_PORT".to_string(), "9099".to_string()),
            ("PROBE_CLIENT".to_string(), "curl".to_string()),
        ]);

        let config = SuiteConfig::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.kubectl, "/usr/local/bin/kubectl");
        assert_eq!(config.calicoctl, "/opt/calicoctl");
        assert_eq!(config.probe_image, "curlimages/curl:8.5.0");
        assert_eq!(config.probe_budget(), Duration::from_secs(45));
        assert_eq!(config.probe_interval(), Duration::from_millis(250));
        assert_eq!(config.pod_ready_timeout(), Duration::from_secs(30));
        assert_eq!(config.namespace_prefix, "calico-e2e");
        assert_eq!(config.felix_metrics_port, 9099);
        assert_eq!(config.probe_client, ProbeClient::Curl);
    }

    #[test]
    fn test_probe_budget_rejects_zero() {
        let vars = HashMap::from([("PROBE_BUDGET_SECONDS".to_string(), "0".to_string())]);

        let result = SuiteConfig::from_vars(&vars);
        assert!(
            matches!(result, Err(ConfigError::InvalidProbeBudget(msg)) if msg.contains("greater than 0"))
        );
    }

    #[test]
    fn test_probe_budget_rejects_too_large() {
        let vars = HashMap::from([("PROBE_BUDGET_SECONDS".to_string(), "601".to_string())]);

        let result = SuiteConfig::from_vars(&vars);
        assert!(
            matches!(result, Err(ConfigError::InvalidProbeBudget(msg)) if msg.contains("must not exceed"))
        );
    }

    #[test]
    fn test_probe_interval_rejects_garbage() {
        let vars = HashMap::from([("PROBE_INTERVAL_MS".to_string(), "fast".to_string())]);

        let result = SuiteConfig::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidProbeInterval(_))));
    }

    #[test]
    fn test_namespace_prefix_rejects_uppercase() {
        let vars = HashMap::from([(
            "TEST_NAMESPACE_PREFIX".to_string(),
            "NetPol".to_string(),
        )]);

        let result = SuiteConfig::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidNamespacePrefix(_))));
    }

    #[test]
    fn test_namespace_prefix_rejects_trailing_dash() {
        let vars = HashMap::from([(
            "TEST_NAMESPACE_PREFIX".to_string(),
            "netpol-".to_string(),
        )]);

        let result = SuiteConfig::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidNamespacePrefix(_))));
    }

    #[test]
    fn test_metrics_port_rejects_zero() {
        let vars = HashMap::from([("FELIX_METRICS_PORT".to_string(), "0".to_string())]);

        let result = SuiteConfig::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidMetricsPort(_))));
    }

    #[test]
    fn test_unknown_probe_client_rejected() {
        let vars = HashMap::from([("PROBE_CLIENT".to_string(), "nc".to_string())]);

        let result = SuiteConfig::from_vars(&vars);
        assert!(
            matches!(result, Err(ConfigError::InvalidProbeClient(msg)) if msg.contains("'nc'"))
        );
    }

    #[test]
    fn test_probe_client_serializes_lowercase() {
        let json = serde_json::to_string(&ProbeClient::Curl).unwrap();
        assert_eq!(json, "\"curl\"");
    }
}
