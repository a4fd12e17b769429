//! Per-run suite state.
//!
//! One-time cluster setup (such as turning on Felix's Prometheus endpoint)
//! is latched here rather than in process-wide flags, so each test decides
//! explicitly which context it shares.

use crate::cluster::{ClusterError, ClusterOps, Kubectl};
use crate::echo::EchoServer;
use crate::policy::{Calicoctl, PolicyCli, PolicyError};
use crate::probe::{ConnectivityProbe, ProbeOptions};
use common::config::{ConfigError, SuiteConfig};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Invalid suite configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Policy(#[from] PolicyError),
}

/// Shared handles for one suite run.
pub struct SuiteContext {
    config: SuiteConfig,
    cluster: Arc<dyn ClusterOps>,
    policy: Arc<dyn PolicyCli>,
    felix_metrics: OnceCell<()>,
}

impl SuiteContext {
    pub fn new(config: SuiteConfig, cluster: Arc<dyn ClusterOps>, policy: Arc<dyn PolicyCli>) -> Self {
        Self {
            config,
            cluster,
            policy,
            felix_metrics: OnceCell::new(),
        }
    }

    /// Build a context driving the configured kubectl and calicoctl.
    pub fn from_env() -> Result<Self, ContextError> {
        let config = SuiteConfig::from_env()?;
        let cluster = Arc::new(Kubectl::from_config(&config));
        let policy = Arc::new(Calicoctl::from_config(&config));
        Ok(Self::new(config, cluster, policy))
    }

    pub fn config(&self) -> &SuiteConfig {
        &self.config
    }

    pub fn cluster(&self) -> &dyn ClusterOps {
        self.cluster.as_ref()
    }

    pub fn cluster_handle(&self) -> Arc<dyn ClusterOps> {
        self.cluster.clone()
    }

    pub fn policy(&self) -> &dyn PolicyCli {
        self.policy.as_ref()
    }

    /// A probe runner with configured defaults and policy snapshots in its
    /// failure diagnostics.
    pub fn probe(&self) -> ConnectivityProbe {
        ConnectivityProbe::new(self.cluster.clone(), ProbeOptions::from_config(&self.config))
            .with_policy_cli(self.policy.clone())
    }

    /// Create a namespace with a unique name under the configured prefix.
    pub async fn create_namespace(&self) -> Result<TestNamespace, ContextError> {
        let suffix: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
        let name = format!("{}-{}", self.config.namespace_prefix, suffix);
        self.cluster.ensure_namespace(&name).await?;
        info!(target: "netpol.cluster", namespace = %name, "Created test namespace");
        Ok(TestNamespace { name })
    }

    /// Deploy an echo server carrying `labels` in `namespace`.
    pub async fn deploy_echo_server(
        &self,
        namespace: &str,
        labels: &[(&str, &str)],
    ) -> Result<EchoServer, ContextError> {
        let labels: BTreeMap<String, String> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Ok(EchoServer::deploy(
            self.cluster.as_ref(),
            namespace,
            &labels,
            &self.config.echo_image,
            self.config.pod_ready_timeout(),
        )
        .await?)
    }

    /// Enable Felix's Prometheus endpoint once per context.
    pub async fn ensure_felix_metrics(&self) -> Result<(), ContextError> {
        self.felix_metrics
            .get_or_try_init(|| async {
                self.policy
                    .patch(
                        "felixconfiguration",
                        "default",
                        &json!({
                            "spec": {
                                "prometheusMetricsEnabled": true,
                                "prometheusMetricsPort": self.config.felix_metrics_port,
                            }
                        }),
                    )
                    .await?;
                info!(
                    target: "netpol.policy",
                    port = self.config.felix_metrics_port,
                    "Enabled Felix Prometheus metrics"
                );
                Ok::<(), ContextError>(())
            })
            .await?;
        Ok(())
    }
}

/// A namespace owned by one test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestNamespace {
    pub name: String,
}

impl TestNamespace {
    /// Delete the namespace and everything in it. Failures are logged.
    pub async fn teardown(self, ctx: &SuiteContext) {
        if let Err(e) = ctx.cluster.delete_namespace(&self.name).await {
            warn!(
                target: "netpol.cluster",
                namespace = %self.name,
                error = %e,
                "Failed to delete test namespace"
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::mock::{MockCluster, MockPolicyCli};

    fn context() -> (SuiteContext, Arc<MockCluster>, Arc<MockPolicyCli>) {
        let cluster = Arc::new(MockCluster::new());
        let policy = Arc::new(MockPolicyCli::new());
        let ctx = SuiteContext::new(SuiteConfig::default(), cluster.clone(), policy.clone());
        (ctx, cluster, policy)
    }

    #[tokio::test]
    async fn test_felix_metrics_enabled_once() {
        let (ctx, _cluster, policy) = context();

        ctx.ensure_felix_metrics().await.unwrap();
        ctx.ensure_felix_metrics().await.unwrap();

        let patches = policy.patches();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].0, "felixconfiguration");
        assert_eq!(patches[0].2["spec"]["prometheusMetricsEnabled"], true);
        assert_eq!(patches[0].2["spec"]["prometheusMetricsPort"], 9091);
    }

    #[tokio::test]
    async fn test_namespaces_are_unique_and_torn_down() {
        let (ctx, cluster, _policy) = context();

        let a = ctx.create_namespace().await.unwrap();
        let b = ctx.create_namespace().await.unwrap();
        assert_ne!(a.name, b.name);
        assert!(a.name.starts_with("netpol-e2e-"));
        assert_eq!(cluster.namespaces().len(), 2);

        a.teardown(&ctx).await;
        b.teardown(&ctx).await;
        assert!(cluster.namespaces().is_empty());
    }

    #[tokio::test]
    async fn test_probe_uses_configured_options() {
        let (ctx, _cluster, _policy) = context();
        let probe = ctx.probe();
        assert_eq!(probe.options().budget, ctx.config().probe_budget());
    }
}
