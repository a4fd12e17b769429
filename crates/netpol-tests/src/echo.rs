//! Echo server pods used as probe targets.
//!
//! The server answers every HTTP request with a `key=value` description of
//! the request, including the `client_address` line probes use to check the
//! source IP.

use crate::cluster::{ClusterError, ClusterOps};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// Port the echo server listens on.
pub const ECHO_PORT: u16 = 8080;

/// A running echo server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoServer {
    pub namespace: String,
    pub name: String,
    pub ip: String,
    pub node_name: Option<String>,
}

impl EchoServer {
    /// Create an echo server pod carrying `labels`, wait for Ready and
    /// resolve its IP.
    pub async fn deploy(
        cluster: &dyn ClusterOps,
        namespace: &str,
        labels: &BTreeMap<String, String>,
        image: &str,
        ready_timeout: Duration,
    ) -> Result<Self, ClusterError> {
        let suffix: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
        let name = format!("echo-{}", suffix);

        info!(
            target: "netpol.cluster",
            namespace = %namespace,
            pod = %name,
            "Deploying echo server"
        );

        cluster
            .create_pod(&manifest(namespace, &name, labels, image))
            .await?;
        cluster.wait_pod_ready(namespace, &name, ready_timeout).await?;

        let info = cluster.pod_info(namespace, &name).await?;
        let ip = info.pod_ip.ok_or_else(|| ClusterError::NoPodIp {
            namespace: namespace.to_string(),
            name: name.clone(),
        })?;

        Ok(Self {
            namespace: namespace.to_string(),
            name,
            ip,
            node_name: info.node_name,
        })
    }

    /// `host:port` to probe.
    pub fn target(&self) -> String {
        if self.ip.contains(':') {
            format!("[{}]:{}", self.ip, ECHO_PORT)
        } else {
            format!("{}:{}", self.ip, ECHO_PORT)
        }
    }

    pub async fn cleanup(self, cluster: &dyn ClusterOps) -> Result<(), ClusterError> {
        cluster.delete_pod(&self.namespace, &self.name).await
    }
}

fn manifest(namespace: &str, name: &str, labels: &BTreeMap<String, String>, image: &str) -> Value {
    let labels: Map<String, Value> = labels
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();

    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "labels": labels,
        },
        "spec": {
            "terminationGracePeriodSeconds": 1,
            "nodeSelector": { "kubernetes.io/os": "linux" },
            "containers": [{
                "name": "echo",
                "image": image,
                "ports": [{ "containerPort": ECHO_PORT }],
                "readinessProbe": {
                    "httpGet": { "path": "/", "port": ECHO_PORT },
                    "periodSeconds": 2,
                },
            }],
        },
    })
}
