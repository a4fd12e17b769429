//! Scripted cluster and policy CLI for testing the harness without a cluster.
//!
//! # Example
//!
//! ```rust,ignore
//! use netpol_tests::mock::{exec_echo, exec_refused, MockCluster};
//!
//! // Two refused connections, then the echo server answers.
//! let cluster = MockCluster::new()
//!     .with_pod_ip("10.0.1.7")
//!     .with_exec_script(vec![exec_refused(), exec_refused(), exec_echo("10.0.1.7")]);
//! ```

use crate::cluster::{ClusterError, ClusterOps, ExecOutput, PodInfo};
use crate::policy::{PolicyCli, PolicyError};
use crate::process::ProcessError;
use crate::shell::PodOs;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Exec output of an echo server that saw `client_ip`.
pub fn exec_echo(client_ip: &str) -> ExecOutput {
    ExecOutput {
        stdout: format!(
            "Hostname: echo-0\n\nRequest Information:\n\tclient_address={}\n\tmethod=GET\n",
            client_ip
        ),
        stderr: String::new(),
        exit_code: 0,
    }
}

/// Exec output of a connection that timed out.
pub fn exec_refused() -> ExecOutput {
    ExecOutput {
        stdout: String::new(),
        stderr: "wget: download timed out".to_string(),
        exit_code: 1,
    }
}

/// Exec output of a successful command with arbitrary stdout.
pub fn exec_raw(stdout: &str) -> ExecOutput {
    ExecOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code: 0,
    }
}

/// One recorded exec call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecCall {
    pub namespace: String,
    pub pod: String,
    pub container: Option<String>,
    pub argv: Vec<String>,
}

/// Scripted [`ClusterOps`] implementation.
///
/// Exec responses are served in order; the last one repeats forever.
pub struct MockCluster {
    pod_ip: Option<String>,
    host_ip: String,
    containers: Vec<String>,
    pod_os: Option<PodOs>,
    node_os: Option<PodOs>,
    ready: bool,
    fail_create: bool,
    fail_delete: bool,
    exec_script: Vec<ExecOutput>,
    exec_delay: Duration,
    exec_count: AtomicUsize,
    logs: String,
    listed_pods: Vec<PodInfo>,
    created: Mutex<Vec<Value>>,
    deleted: Mutex<Vec<String>>,
    exec_calls: Mutex<Vec<ExecCall>>,
    namespaces: Mutex<Vec<String>>,
}

impl Default for MockCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCluster {
    /// A cluster where pods become ready with IP 10.0.1.7 and every
    /// connection is refused.
    pub fn new() -> Self {
        Self {
            pod_ip: Some("10.0.1.7".to_string()),
            host_ip: "172.18.0.2".to_string(),
            containers: vec!["probe".to_string()],
            pod_os: None,
            node_os: None,
            ready: true,
            fail_create: false,
            fail_delete: false,
            exec_script: vec![exec_refused()],
            exec_delay: Duration::ZERO,
            exec_count: AtomicUsize::new(0),
            logs: String::new(),
            listed_pods: Vec::new(),
            created: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            exec_calls: Mutex::new(Vec::new()),
            namespaces: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn with_pod_ip(mut self, ip: &str) -> Self {
        self.pod_ip = Some(ip.to_string());
        self
    }

    /// Pods never get an IP.
    #[must_use]
    pub fn without_pod_ip(mut self) -> Self {
        self.pod_ip = None;
        self
    }

    #[must_use]
    pub fn with_containers(mut self, containers: &[&str]) -> Self {
        self.containers = containers.iter().map(|c| c.to_string()).collect();
        self
    }

    /// OS selected by existing pods' node selector.
    #[must_use]
    pub fn with_pod_os(mut self, os: PodOs) -> Self {
        self.pod_os = Some(os);
        self
    }

    /// OS label carried by every node.
    #[must_use]
    pub fn with_node_os(mut self, os: PodOs) -> Self {
        self.node_os = Some(os);
        self
    }

    /// Serve these exec results in order, repeating the last.
    #[must_use]
    pub fn with_exec_script(mut self, script: Vec<ExecOutput>) -> Self {
        self.exec_script = script;
        self
    }

    /// Make every exec take this long.
    #[must_use]
    pub fn with_exec_delay(mut self, delay: Duration) -> Self {
        self.exec_delay = delay;
        self
    }

    #[must_use]
    pub fn with_logs(mut self, logs: &str) -> Self {
        self.logs = logs.to_string();
        self
    }

    #[must_use]
    pub fn with_listed_pods(mut self, pods: Vec<PodInfo>) -> Self {
        self.listed_pods = pods;
        self
    }

    #[must_use]
    pub fn failing_readiness(mut self) -> Self {
        self.ready = false;
        self
    }

    #[must_use]
    pub fn failing_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    #[must_use]
    pub fn failing_delete(mut self) -> Self {
        self.fail_delete = true;
        self
    }

    pub fn exec_count(&self) -> usize {
        self.exec_count.load(Ordering::SeqCst)
    }

    pub fn exec_calls(&self) -> Vec<ExecCall> {
        lock(&self.exec_calls).clone()
    }

    pub fn created_pods(&self) -> Vec<Value> {
        lock(&self.created).clone()
    }

    /// Deleted pods as `namespace/name`.
    pub fn deleted_pods(&self) -> Vec<String> {
        lock(&self.deleted).clone()
    }

    pub fn namespaces(&self) -> Vec<String> {
        lock(&self.namespaces).clone()
    }

    fn scripted_failure(command: &str) -> ClusterError {
        ClusterError::Kubectl(ProcessError::Failed {
            command: command.to_string(),
            exit_code: 1,
            stderr: "scripted failure".to_string(),
        })
    }
}

#[async_trait]
impl ClusterOps for MockCluster {
    async fn ensure_namespace(&self, namespace: &str) -> Result<(), ClusterError> {
        let mut namespaces = lock(&self.namespaces);
        if !namespaces.iter().any(|n| n == namespace) {
            namespaces.push(namespace.to_string());
        }
        Ok(())
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<(), ClusterError> {
        lock(&self.namespaces).retain(|n| n != namespace);
        Ok(())
    }

    async fn create_pod(&self, manifest: &Value) -> Result<(), ClusterError> {
        if self.fail_create {
            return Err(Self::scripted_failure("kubectl create -f -"));
        }
        lock(&self.created).push(manifest.clone());
        Ok(())
    }

    async fn wait_pod_ready(
        &self,
        namespace: &str,
        name: &str,
        _timeout: Duration,
    ) -> Result<(), ClusterError> {
        if self.ready {
            Ok(())
        } else {
            Err(ClusterError::PodNotReady {
                namespace: namespace.to_string(),
                name: name.to_string(),
                message: "timed out waiting for the condition".to_string(),
            })
        }
    }

    async fn pod_info(&self, namespace: &str, name: &str) -> Result<PodInfo, ClusterError> {
        let manifest = lock(&self.created)
            .iter()
            .find(|m| m["metadata"]["name"] == name)
            .cloned();
        let host_network = manifest
            .as_ref()
            .and_then(|m| m["spec"]["hostNetwork"].as_bool())
            .unwrap_or(false);
        let os = manifest
            .as_ref()
            .and_then(|m| m["spec"]["nodeSelector"]["kubernetes.io/os"].as_str())
            .and_then(PodOs::from_node_label)
            .or(self.pod_os);

        let pod_ip = if host_network {
            Some(self.host_ip.clone())
        } else {
            self.pod_ip.clone()
        };

        Ok(PodInfo {
            namespace: namespace.to_string(),
            name: name.to_string(),
            phase: "Running".to_string(),
            pod_ip,
            host_ip: Some(self.host_ip.clone()),
            node_name: Some("worker-1".to_string()),
            host_network,
            containers: self.containers.clone(),
            os,
        })
    }

    async fn node_os(&self, _node: &str) -> Result<Option<PodOs>, ClusterError> {
        Ok(self.node_os)
    }

    async fn list_pods(
        &self,
        _namespace: &str,
        _selector: &str,
    ) -> Result<Vec<PodInfo>, ClusterError> {
        Ok(self.listed_pods.clone())
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        argv: &[String],
    ) -> Result<ExecOutput, ClusterError> {
        let idx = self.exec_count.fetch_add(1, Ordering::SeqCst);
        lock(&self.exec_calls).push(ExecCall {
            namespace: namespace.to_string(),
            pod: pod.to_string(),
            container: container.map(str::to_string),
            argv: argv.to_vec(),
        });

        if !self.exec_delay.is_zero() {
            tokio::time::sleep(self.exec_delay).await;
        }

        let output = self
            .exec_script
            .get(idx)
            .or_else(|| self.exec_script.last())
            .cloned()
            .unwrap_or_else(exec_refused);
        Ok(output)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        lock(&self.deleted).push(format!("{}/{}", namespace, name));
        if self.fail_delete {
            return Err(Self::scripted_failure("kubectl delete pod"));
        }
        Ok(())
    }

    async fn pod_logs(
        &self,
        _namespace: &str,
        _pod: &str,
        _container: Option<&str>,
        _tail: u32,
    ) -> Result<String, ClusterError> {
        Ok(self.logs.clone())
    }

    async fn logs_by_label(
        &self,
        _namespace: &str,
        _selector: &str,
        _tail: u32,
    ) -> Result<String, ClusterError> {
        Ok(self.logs.clone())
    }

    async fn pod_summary(&self, namespace: &str) -> Result<String, ClusterError> {
        let mut summary = "NAME READY STATUS RESTARTS AGE IP\n".to_string();
        for manifest in lock(&self.created).iter() {
            if manifest["metadata"]["namespace"] == namespace {
                let name = manifest["metadata"]["name"].as_str().unwrap_or("?");
                summary.push_str(&format!(
                    "{} 1/1 Running 0 1s {}\n",
                    name,
                    self.pod_ip.as_deref().unwrap_or("<none>")
                ));
            }
        }
        Ok(summary)
    }
}

/// In-memory [`PolicyCli`] recording applied documents.
#[derive(Default)]
pub struct MockPolicyCli {
    applied: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
    patches: Mutex<Vec<(String, String, Value)>>,
    objects: Mutex<Vec<(String, String, Map<String, Value>)>>,
}

impl MockPolicyCli {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `object` for `get(kind, name, _)`.
    #[must_use]
    pub fn with_object(self, kind: &str, name: &str, object: Map<String, Value>) -> Self {
        lock(&self.objects).push((kind.to_string(), name.to_string(), object));
        self
    }

    pub fn applied(&self) -> Vec<String> {
        lock(&self.applied).clone()
    }

    /// Deleted resources as `kind/name`.
    pub fn deleted(&self) -> Vec<String> {
        lock(&self.deleted).clone()
    }

    pub fn patches(&self) -> Vec<(String, String, Value)> {
        lock(&self.patches).clone()
    }
}

#[async_trait]
impl PolicyCli for MockPolicyCli {
    async fn apply(&self, document: &str) -> Result<(), PolicyError> {
        lock(&self.applied).push(document.to_string());
        Ok(())
    }

    async fn delete(
        &self,
        kind: &str,
        name: &str,
        _namespace: Option<&str>,
    ) -> Result<(), PolicyError> {
        lock(&self.deleted).push(format!("{}/{}", kind, name));
        Ok(())
    }

    async fn get(
        &self,
        kind: &str,
        name: &str,
        _namespace: Option<&str>,
    ) -> Result<Map<String, Value>, PolicyError> {
        lock(&self.objects)
            .iter()
            .find(|(k, n, _)| k == kind && n == name)
            .map(|(_, _, object)| object.clone())
            .ok_or_else(|| {
                PolicyError::Cli(ProcessError::Failed {
                    command: format!("calicoctl get {} {}", kind, name),
                    exit_code: 1,
                    stderr: "resource does not exist".to_string(),
                })
            })
    }

    async fn patch(&self, kind: &str, name: &str, patch: &Value) -> Result<(), PolicyError> {
        lock(&self.patches).push((kind.to_string(), name.to_string(), patch.clone()));
        Ok(())
    }

    async fn snapshot(&self) -> Result<String, PolicyError> {
        Ok(lock(&self.applied).join("---\n"))
    }
}
