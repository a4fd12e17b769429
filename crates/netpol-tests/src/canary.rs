//! Ephemeral canary pods used as probe sources.
//!
//! A canary is created for a single connectivity assertion and deleted
//! afterwards. Labels and annotations on the spec are what network policies
//! select on, so every canary gets a fresh, unique name: reusing a name
//! while the previous pod is still terminating would let one test's pod
//! answer for another's.

use crate::cluster::{ClusterError, ClusterOps};
use crate::shell::PodOs;
use crate::source::{PodRef, ISTIO_PROXY_CONTAINER};
use common::config::SuiteConfig;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Name of the container that runs the connectivity client.
pub const PROBE_CONTAINER: &str = "probe";

/// Label put on every canary so leftovers can be found by selector.
pub const CANARY_ROLE_LABEL: &str = "netpol-e2e/role";

/// Annotation controlling Istio sidecar injection.
pub const ISTIO_INJECT_ANNOTATION: &str = "sidecar.istio.io/inject";

const DEFAULT_NAME_PREFIX: &str = "probe";

/// Kubernetes object names are limited to 63 characters; leave room for
/// the `-xxxxxxxx` suffix.
const MAX_NAME_PREFIX_LEN: usize = 54;

/// Description of a canary pod to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanarySpec {
    pub namespace: String,
    pub name_prefix: String,
    pub node: Option<String>,
    pub host_network: bool,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub service_account: Option<String>,
    pub os: PodOs,
    pub image: Option<String>,
    pub istio_sidecar: bool,
}

impl CanarySpec {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            node: None,
            host_network: false,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            service_account: None,
            os: PodOs::Linux,
            image: None,
            istio_sidecar: false,
        }
    }

    #[must_use]
    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Pin the canary to a node.
    #[must_use]
    pub fn on_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    #[must_use]
    pub fn host_networked(mut self) -> Self {
        self.host_network = true;
        self
    }

    #[must_use]
    pub fn with_service_account(mut self, service_account: impl Into<String>) -> Self {
        self.service_account = Some(service_account.into());
        self
    }

    #[must_use]
    pub fn with_os(mut self, os: PodOs) -> Self {
        self.os = os;
        self
    }

    #[must_use]
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Request an Istio sidecar. Probes then exec in the probe container and
    /// diagnostics include the sidecar's logs.
    #[must_use]
    pub fn with_istio_sidecar(mut self) -> Self {
        self.istio_sidecar = true;
        self
    }

    /// Generate a fresh pod name from the prefix.
    pub fn generate_name(&self) -> String {
        let prefix: String = self.name_prefix.chars().take(MAX_NAME_PREFIX_LEN).collect();
        let prefix = prefix.trim_end_matches('-');
        let suffix: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
        format!("{}-{}", prefix, suffix)
    }

    /// Render the pod manifest.
    pub fn manifest(&self, name: &str, image: &str) -> Value {
        let mut labels: Map<String, Value> = self
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        labels.insert(CANARY_ROLE_LABEL.to_string(), json!("probe"));

        let mut annotations: Map<String, Value> = self
            .annotations
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        annotations.insert(
            ISTIO_INJECT_ANNOTATION.to_string(),
            json!(if self.istio_sidecar { "true" } else { "false" }),
        );

        let mut spec = json!({
            "restartPolicy": "Never",
            "terminationGracePeriodSeconds": 1,
            "nodeSelector": { "kubernetes.io/os": self.os.node_label() },
            "containers": [{
                "name": PROBE_CONTAINER,
                "image": image,
                "command": self.os.idle_command(),
            }],
        });

        if let Some(obj) = spec.as_object_mut() {
            if let Some(node) = &self.node {
                obj.insert("nodeName".to_string(), json!(node));
            }
            if self.host_network {
                obj.insert("hostNetwork".to_string(), json!(true));
                obj.insert("dnsPolicy".to_string(), json!("ClusterFirstWithHostNet"));
            }
            if let Some(sa) = &self.service_account {
                obj.insert("serviceAccountName".to_string(), json!(sa));
            }
        }

        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": name,
                "namespace": self.namespace,
                "labels": labels,
                "annotations": annotations,
            },
            "spec": spec,
        })
    }
}

/// Images and timeouts applied to every canary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanaryDefaults {
    pub linux_image: String,
    pub windows_image: String,
    pub ready_timeout: Duration,
}

impl CanaryDefaults {
    pub fn from_config(config: &SuiteConfig) -> Self {
        Self {
            linux_image: config.probe_image.clone(),
            windows_image: config.windows_probe_image.clone(),
            ready_timeout: config.pod_ready_timeout(),
        }
    }

    fn image_for<'a>(&'a self, spec: &'a CanarySpec) -> &'a str {
        match (&spec.image, spec.os) {
            (Some(image), _) => image,
            (None, PodOs::Linux) => &self.linux_image,
            (None, PodOs::Windows) => &self.windows_image,
        }
    }
}

impl Default for CanaryDefaults {
    fn default() -> Self {
        Self::from_config(&SuiteConfig::default())
    }
}

/// A running canary pod owned by the caller.
#[derive(Debug)]
pub struct CanaryPod {
    pod: PodRef,
}

impl CanaryPod {
    /// Create the pod, wait for Ready and resolve its IP.
    ///
    /// If the pod never becomes usable it is deleted before the error is
    /// returned.
    pub async fn deploy(
        cluster: &dyn ClusterOps,
        spec: &CanarySpec,
        defaults: &CanaryDefaults,
    ) -> Result<Self, ClusterError> {
        let name = spec.generate_name();
        let manifest = spec.manifest(&name, defaults.image_for(spec));

        info!(
            target: "netpol.canary",
            namespace = %spec.namespace,
            pod = %name,
            node = ?spec.node,
            host_network = spec.host_network,
            "Deploying canary pod"
        );

        cluster.create_pod(&manifest).await?;

        match Self::resolve(cluster, spec, &name, defaults.ready_timeout).await {
            Ok(pod) => Ok(Self { pod }),
            Err(e) => {
                if let Err(cleanup_err) = cluster.delete_pod(&spec.namespace, &name).await {
                    warn!(
                        target: "netpol.canary",
                        namespace = %spec.namespace,
                        pod = %name,
                        error = %cleanup_err,
                        "Failed to delete canary after setup error"
                    );
                }
                Err(e)
            }
        }
    }

    async fn resolve(
        cluster: &dyn ClusterOps,
        spec: &CanarySpec,
        name: &str,
        ready_timeout: Duration,
    ) -> Result<PodRef, ClusterError> {
        cluster
            .wait_pod_ready(&spec.namespace, name, ready_timeout)
            .await?;

        let info = cluster.pod_info(&spec.namespace, name).await?;
        let ip = info.pod_ip.ok_or_else(|| ClusterError::NoPodIp {
            namespace: spec.namespace.clone(),
            name: name.to_string(),
        })?;

        Ok(PodRef {
            namespace: spec.namespace.clone(),
            name: name.to_string(),
            container: Some(PROBE_CONTAINER.to_string()),
            ip,
            host_network: spec.host_network,
            os: spec.os,
            sidecar: spec
                .istio_sidecar
                .then(|| ISTIO_PROXY_CONTAINER.to_string()),
        })
    }

    pub fn pod(&self) -> &PodRef {
        &self.pod
    }

    /// Delete the pod.
    pub async fn cleanup(self, cluster: &dyn ClusterOps) -> Result<(), ClusterError> {
        info!(
            target: "netpol.canary",
            namespace = %self.pod.namespace,
            pod = %self.pod.name,
            "Deleting canary pod"
        );
        cluster
            .delete_pod(&self.pod.namespace, &self.pod.name)
            .await
    }
}
