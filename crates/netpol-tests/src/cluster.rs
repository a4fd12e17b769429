//! Cluster access for the probe harness.
//!
//! [`ClusterOps`] is the seam between the harness and the Kubernetes API:
//! pod provisioning, remote exec and log retrieval. [`Kubectl`] implements it
//! by shelling out to `kubectl`, which keeps the suite independent of the
//! cluster's auth plugin setup. Tests substitute [`crate::mock::MockCluster`].

use crate::process::{self, CommandOutput, ProcessError};
use crate::shell::PodOs;
use async_trait::async_trait;
use common::config::SuiteConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Output of a command executed inside a pod.
pub type ExecOutput = CommandOutput;

/// Cluster access errors.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("kubectl invocation failed: {0}")]
    Kubectl(#[from] ProcessError),

    #[error("Failed to parse kubectl output for {what}: {source}")]
    Parse {
        what: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Pod {namespace}/{name} did not become ready: {message}")]
    PodNotReady {
        namespace: String,
        name: String,
        message: String,
    },

    #[error("Pod {namespace}/{name} has no IP assigned")]
    NoPodIp { namespace: String, name: String },

    #[error("Invalid pod manifest: {0}")]
    InvalidManifest(String),

    #[error("API server health check failed: {0}")]
    HealthCheckFailed(String),
}

/// Pod facts the harness needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodInfo {
    pub namespace: String,
    pub name: String,
    pub phase: String,
    pub pod_ip: Option<String>,
    pub host_ip: Option<String>,
    pub node_name: Option<String>,
    pub host_network: bool,
    pub containers: Vec<String>,
    /// OS pinned by the pod's `kubernetes.io/os` node selector.
    pub os: Option<PodOs>,
}

/// Node label naming the node's operating system.
pub const OS_LABEL: &str = "kubernetes.io/os";

impl PodInfo {
    pub fn is_running(&self) -> bool {
        self.phase == "Running"
    }
}

/// Operations the harness performs against a cluster.
#[async_trait]
pub trait ClusterOps: Send + Sync {
    /// Create a namespace, succeeding if it already exists.
    async fn ensure_namespace(&self, namespace: &str) -> Result<(), ClusterError>;

    /// Delete a namespace without waiting for finalizers.
    async fn delete_namespace(&self, namespace: &str) -> Result<(), ClusterError>;

    /// Create a pod. Fails if a pod with the same name already exists.
    async fn create_pod(&self, manifest: &serde_json::Value) -> Result<(), ClusterError>;

    /// Block until the pod reports Ready or the timeout expires.
    async fn wait_pod_ready(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<(), ClusterError>;

    async fn pod_info(&self, namespace: &str, name: &str) -> Result<PodInfo, ClusterError>;

    /// Operating system from the node's `kubernetes.io/os` label.
    async fn node_os(&self, node: &str) -> Result<Option<PodOs>, ClusterError>;

    /// List pods matching a label selector.
    async fn list_pods(&self, namespace: &str, selector: &str)
        -> Result<Vec<PodInfo>, ClusterError>;

    /// Execute `argv` inside a pod.
    ///
    /// A non-zero exit of `argv` is returned as data. Errors mean the exec
    /// itself could not be attempted.
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        argv: &[String],
    ) -> Result<ExecOutput, ClusterError>;

    /// Delete a pod and wait until its name is free.
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        tail: u32,
    ) -> Result<String, ClusterError>;

    /// Logs of every pod matching a label selector, one prefix per line.
    async fn logs_by_label(
        &self,
        namespace: &str,
        selector: &str,
        tail: u32,
    ) -> Result<String, ClusterError>;

    /// Human-readable pod table for diagnostics.
    async fn pod_summary(&self, namespace: &str) -> Result<String, ClusterError>;
}

/// `kubectl`-backed cluster access.
#[derive(Debug, Clone)]
pub struct Kubectl {
    binary: String,
}

impl Kubectl {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn from_config(config: &SuiteConfig) -> Self {
        Self::new(config.kubectl.clone())
    }

    /// Check that the API server answers `/readyz`.
    pub async fn check_api_server(&self) -> Result<(), ClusterError> {
        let output = self.run_unchecked(&["get", "--raw", "/readyz"], None).await?;

        if !output.success() || output.stdout.trim() != "ok" {
            return Err(ClusterError::HealthCheckFailed(format!(
                "/readyz returned '{}' (exit {}): {}",
                output.stdout.trim(),
                output.exit_code,
                output.stderr.trim()
            )));
        }

        Ok(())
    }

    async fn run(&self, args: &[&str], stdin: Option<&str>) -> Result<CommandOutput, ClusterError> {
        Ok(process::run(&self.binary, args, stdin).await?)
    }

    async fn run_unchecked(
        &self,
        args: &[&str],
        stdin: Option<&str>,
    ) -> Result<CommandOutput, ClusterError> {
        Ok(process::run_unchecked(&self.binary, args, stdin).await?)
    }
}

#[async_trait]
impl ClusterOps for Kubectl {
    async fn ensure_namespace(&self, namespace: &str) -> Result<(), ClusterError> {
        let output = self
            .run_unchecked(&["create", "namespace", namespace], None)
            .await?;

        if output.success() || output.stderr.contains("AlreadyExists") {
            return Ok(());
        }

        Err(ClusterError::Kubectl(ProcessError::Failed {
            command: format!("{} create namespace {}", self.binary, namespace),
            exit_code: output.exit_code,
            stderr: output.stderr.trim().to_string(),
        }))
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<(), ClusterError> {
        self.run(
            &[
                "delete",
                "namespace",
                namespace,
                "--ignore-not-found=true",
                "--wait=false",
            ],
            None,
        )
        .await?;
        Ok(())
    }

    async fn create_pod(&self, manifest: &serde_json::Value) -> Result<(), ClusterError> {
        let body = serde_json::to_string(manifest)
            .map_err(|e| ClusterError::InvalidManifest(e.to_string()))?;
        self.run(&["create", "-f", "-"], Some(&body)).await?;
        Ok(())
    }

    async fn wait_pod_ready(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<(), ClusterError> {
        let pod_ref = format!("pod/{}", name);
        let timeout_arg = format!("--timeout={}s", timeout.as_secs().max(1));

        let output = self
            .run_unchecked(
                &[
                    "wait",
                    "--for=condition=Ready",
                    pod_ref.as_str(),
                    "-n",
                    namespace,
                    timeout_arg.as_str(),
                ],
                None,
            )
            .await?;

        if !output.success() {
            return Err(ClusterError::PodNotReady {
                namespace: namespace.to_string(),
                name: name.to_string(),
                message: output.stderr.trim().to_string(),
            });
        }

        Ok(())
    }

    async fn pod_info(&self, namespace: &str, name: &str) -> Result<PodInfo, ClusterError> {
        let output = self
            .run(&["get", "pod", name, "-n", namespace, "-o", "json"], None)
            .await?;
        parse_pod(&output.stdout)
    }

    async fn node_os(&self, node: &str) -> Result<Option<PodOs>, ClusterError> {
        let output = self
            .run(
                &[
                    "get",
                    "node",
                    node,
                    "-o",
                    r"jsonpath={.metadata.labels.kubernetes\.io/os}",
                ],
                None,
            )
            .await?;
        Ok(PodOs::from_node_label(output.stdout.trim()))
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<PodInfo>, ClusterError> {
        let output = self
            .run(
                &["get", "pods", "-n", namespace, "-l", selector, "-o", "json"],
                None,
            )
            .await?;
        parse_pod_list(&output.stdout)
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        argv: &[String],
    ) -> Result<ExecOutput, ClusterError> {
        let mut args: Vec<&str> = vec!["exec", "-n", namespace, pod];
        if let Some(container) = container {
            args.push("-c");
            args.push(container);
        }
        args.push("--");
        args.extend(argv.iter().map(String::as_str));

        debug!(
            target: "netpol.cluster",
            namespace = %namespace,
            pod = %pod,
            container = ?container,
            "Executing in pod"
        );

        self.run_unchecked(&args, None).await
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.run(
            &[
                "delete",
                "pod",
                name,
                "-n",
                namespace,
                "--ignore-not-found=true",
                "--wait=true",
                "--timeout=120s",
            ],
            None,
        )
        .await?;
        Ok(())
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        tail: u32,
    ) -> Result<String, ClusterError> {
        let tail_arg = format!("--tail={}", tail);
        let mut args: Vec<&str> = vec!["logs", "-n", namespace, pod, tail_arg.as_str()];
        if let Some(container) = container {
            args.push("-c");
            args.push(container);
        }
        Ok(self.run(&args, None).await?.stdout)
    }

    async fn logs_by_label(
        &self,
        namespace: &str,
        selector: &str,
        tail: u32,
    ) -> Result<String, ClusterError> {
        let tail_arg = format!("--tail={}", tail);
        let output = self
            .run(
                &[
                    "logs",
                    "-n",
                    namespace,
                    "-l",
                    selector,
                    tail_arg.as_str(),
                    "--prefix=true",
                    "--max-log-requests=20",
                ],
                None,
            )
            .await?;
        Ok(output.stdout)
    }

    async fn pod_summary(&self, namespace: &str) -> Result<String, ClusterError> {
        let output = self
            .run(&["get", "pods", "-n", namespace, "-o", "wide"], None)
            .await?;
        Ok(output.stdout)
    }
}

#[derive(Debug, Deserialize)]
struct PodJson {
    metadata: PodMetadata,
    #[serde(default)]
    spec: PodSpecJson,
    #[serde(default)]
    status: PodStatusJson,
}

#[derive(Debug, Deserialize)]
struct PodMetadata {
    name: String,
    #[serde(default)]
    namespace: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodSpecJson {
    node_name: Option<String>,
    #[serde(default)]
    host_network: bool,
    #[serde(default)]
    containers: Vec<ContainerJson>,
    #[serde(default)]
    node_selector: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ContainerJson {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodStatusJson {
    #[serde(default)]
    phase: String,
    #[serde(rename = "podIP")]
    pod_ip: Option<String>,
    #[serde(rename = "hostIP")]
    host_ip: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PodListJson {
    #[serde(default)]
    items: Vec<PodJson>,
}

impl From<PodJson> for PodInfo {
    fn from(pod: PodJson) -> Self {
        Self {
            namespace: pod.metadata.namespace,
            name: pod.metadata.name,
            phase: pod.status.phase,
            pod_ip: pod.status.pod_ip.filter(|ip| !ip.is_empty()),
            host_ip: pod.status.host_ip.filter(|ip| !ip.is_empty()),
            node_name: pod.spec.node_name,
            host_network: pod.spec.host_network,
            containers: pod.spec.containers.into_iter().map(|c| c.name).collect(),
            os: pod
                .spec
                .node_selector
                .get(OS_LABEL)
                .and_then(|label| PodOs::from_node_label(label)),
        }
    }
}

fn parse_pod(json: &str) -> Result<PodInfo, ClusterError> {
    let pod: PodJson = serde_json::from_str(json).map_err(|source| ClusterError::Parse {
        what: "pod".to_string(),
        source,
    })?;
    Ok(pod.into())
}

fn parse_pod_list(json: &str) -> Result<Vec<PodInfo>, ClusterError> {
    let list: PodListJson = serde_json::from_str(json).map_err(|source| ClusterError::Parse {
        what: "pod list".to_string(),
        source,
    })?;
    Ok(list.items.into_iter().map(PodInfo::from).collect())
}
