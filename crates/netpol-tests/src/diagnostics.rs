//! Failure context gathered when a probe gives up.

use crate::cluster::ClusterOps;
use crate::policy::PolicyCli;
use crate::source::PodRef;
use chrono::{DateTime, Utc};
use std::fmt;
use tracing::debug;

/// Lines of sidecar log to keep.
pub const SIDECAR_LOG_TAIL: u32 = 50;

/// Snapshot of cluster state around a failed probe.
///
/// Collection failures are recorded in place of the section they prevented;
/// they never replace the probe's own verdict.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    pub collected_at: DateTime<Utc>,
    pub pod_summary: String,
    pub sidecar_logs: Option<String>,
    pub policy_snapshot: Option<String>,
}

impl Diagnostics {
    /// Gather diagnostics for a probe sourced from `source`.
    ///
    /// Sidecar logs are only fetched when the source has a sidecar; the
    /// policy snapshot only when a policy CLI is available.
    pub async fn collect(
        cluster: &dyn ClusterOps,
        policy: Option<&dyn PolicyCli>,
        source: &PodRef,
    ) -> Self {
        debug!(
            target: "netpol.probe",
            namespace = %source.namespace,
            pod = %source.name,
            "Collecting failure diagnostics"
        );

        let pod_summary = cluster
            .pod_summary(&source.namespace)
            .await
            .unwrap_or_else(|e| format!("<unavailable: {}>", e));

        let sidecar_logs = match &source.sidecar {
            Some(sidecar) => Some(
                cluster
                    .pod_logs(
                        &source.namespace,
                        &source.name,
                        Some(sidecar.as_str()),
                        SIDECAR_LOG_TAIL,
                    )
                    .await
                    .unwrap_or_else(|e| format!("<unavailable: {}>", e)),
            ),
            None => None,
        };

        let policy_snapshot = match policy {
            Some(cli) => Some(
                cli.snapshot()
                    .await
                    .unwrap_or_else(|e| format!("<unavailable: {}>", e)),
            ),
            None => None,
        };

        Self {
            collected_at: Utc::now(),
            pod_summary,
            sidecar_logs,
            policy_snapshot,
        }
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- diagnostics collected at {} ---", self.collected_at.to_rfc3339())?;
        writeln!(f, "pods:")?;
        writeln!(f, "{}", self.pod_summary.trim_end())?;
        if let Some(logs) = &self.sidecar_logs {
            writeln!(f, "sidecar logs (last {} lines):", SIDECAR_LOG_TAIL)?;
            writeln!(f, "{}", logs.trim_end())?;
        }
        if let Some(snapshot) = &self.policy_snapshot {
            writeln!(f, "policies:")?;
            writeln!(f, "{}", snapshot.trim_end())?;
        }
        Ok(())
    }
}
