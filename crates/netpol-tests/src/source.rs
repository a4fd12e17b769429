//! Where probe traffic originates.

use crate::canary::{CanaryDefaults, CanaryPod, CanarySpec};
use crate::cluster::{ClusterError, ClusterOps};
use crate::reachability::SourceIdentity;
use crate::shell::PodOs;

/// Container name Istio injects for its sidecar proxy.
pub const ISTIO_PROXY_CONTAINER: &str = "istio-proxy";

/// Handle to a running pod the probe can exec into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
    /// Container to exec in. `None` lets kubectl pick the default.
    pub container: Option<String>,
    pub ip: String,
    pub host_network: bool,
    pub os: PodOs,
    /// Sidecar container whose logs are worth collecting on failure.
    pub sidecar: Option<String>,
}

impl PodRef {
    /// Build a handle for an existing pod from its live state.
    ///
    /// When the pod carries an Istio sidecar the first other container is
    /// chosen for exec so traffic goes through the sidecar instead of
    /// originating from it. The OS comes from the pod's node selector, then
    /// from its node's labels, so Windows pods get a PowerShell client.
    pub async fn lookup(
        cluster: &dyn ClusterOps,
        namespace: &str,
        name: &str,
    ) -> Result<Self, ClusterError> {
        let info = cluster.pod_info(namespace, name).await?;
        let ip = info.pod_ip.clone().ok_or_else(|| ClusterError::NoPodIp {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })?;

        let has_sidecar = info.containers.iter().any(|c| c == ISTIO_PROXY_CONTAINER);
        let container = if has_sidecar {
            info.containers
                .iter()
                .find(|c| *c != ISTIO_PROXY_CONTAINER)
                .cloned()
        } else {
            None
        };

        let os = match (info.os, info.node_name.as_deref()) {
            (Some(os), _) => Some(os),
            (None, Some(node)) => cluster.node_os(node).await?,
            (None, None) => None,
        };

        Ok(Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            container,
            ip,
            host_network: info.host_network,
            os: os.unwrap_or_default(),
            sidecar: has_sidecar.then(|| ISTIO_PROXY_CONTAINER.to_string()),
        })
    }

    #[must_use]
    pub fn with_os(mut self, os: PodOs) -> Self {
        self.os = os;
        self
    }

    #[must_use]
    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    pub fn identity(&self) -> SourceIdentity {
        SourceIdentity {
            pod_ip: self.ip.clone(),
            host_networked: self.host_network,
        }
    }
}

/// Whether traffic leaves from the node's network namespace.
pub trait HostNetworked {
    fn host_networked(&self) -> bool;
}

impl HostNetworked for PodRef {
    fn host_networked(&self) -> bool {
        self.host_network
    }
}

impl HostNetworked for CanarySpec {
    fn host_networked(&self) -> bool {
        self.host_network
    }
}

/// Source of a probe: an existing pod, or a canary to create for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeSource {
    Existing(PodRef),
    New(CanarySpec),
}

impl ProbeSource {
    pub fn namespace(&self) -> &str {
        match self {
            ProbeSource::Existing(pod) => &pod.namespace,
            ProbeSource::New(spec) => &spec.namespace,
        }
    }

    /// Resolve to a running pod, creating a canary when needed.
    pub async fn ensure(
        &self,
        cluster: &dyn ClusterOps,
        defaults: &CanaryDefaults,
    ) -> Result<ResolvedSource, ClusterError> {
        match self {
            ProbeSource::Existing(pod) => Ok(ResolvedSource {
                pod: pod.clone(),
                canary: None,
            }),
            ProbeSource::New(spec) => {
                let canary = CanaryPod::deploy(cluster, spec, defaults).await?;
                Ok(ResolvedSource {
                    pod: canary.pod().clone(),
                    canary: Some(canary),
                })
            }
        }
    }
}

impl HostNetworked for ProbeSource {
    fn host_networked(&self) -> bool {
        match self {
            ProbeSource::Existing(pod) => pod.host_networked(),
            ProbeSource::New(spec) => spec.host_networked(),
        }
    }
}

impl From<PodRef> for ProbeSource {
    fn from(pod: PodRef) -> Self {
        ProbeSource::Existing(pod)
    }
}

impl From<CanarySpec> for ProbeSource {
    fn from(spec: CanarySpec) -> Self {
        ProbeSource::New(spec)
    }
}

/// A probe source ready to exec into.
#[derive(Debug)]
pub struct ResolvedSource {
    pub pod: PodRef,
    /// Present when the pod was created for this probe and must be deleted.
    pub canary: Option<CanaryPod>,
}

impl ResolvedSource {
    /// Delete the canary if one was created.
    pub async fn release(self, cluster: &dyn ClusterOps) -> Result<(), ClusterError> {
        match self.canary {
            Some(canary) => canary.cleanup(cluster).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::mock::MockCluster;

    #[tokio::test]
    async fn test_lookup_picks_app_container_next_to_sidecar() {
        let cluster = MockCluster::new()
            .with_pod_ip("10.0.3.4")
            .with_containers(&["istio-proxy", "app"]);

        let pod = PodRef::lookup(&cluster, "mesh", "client-0").await.unwrap();

        assert_eq!(pod.ip, "10.0.3.4");
        assert_eq!(pod.container.as_deref(), Some("app"));
        assert_eq!(pod.sidecar.as_deref(), Some(ISTIO_PROXY_CONTAINER));
    }

    #[tokio::test]
    async fn test_lookup_plain_pod_uses_default_container() {
        let cluster = MockCluster::new()
            .with_pod_ip("10.0.3.5")
            .with_containers(&["app"]);

        let pod = PodRef::lookup(&cluster, "ns", "client-0").await.unwrap();

        assert_eq!(pod.container, None);
        assert_eq!(pod.sidecar, None);
    }

    #[tokio::test]
    async fn test_lookup_reads_os_from_node_selector() {
        let cluster = MockCluster::new().with_pod_os(PodOs::Windows);

        let pod = PodRef::lookup(&cluster, "ns", "iis-0").await.unwrap();

        assert_eq!(pod.os, PodOs::Windows);
    }

    #[tokio::test]
    async fn test_lookup_falls_back_to_node_label() {
        let cluster = MockCluster::new().with_node_os(PodOs::Windows);

        let pod = PodRef::lookup(&cluster, "ns", "iis-0").await.unwrap();

        assert_eq!(pod.os, PodOs::Windows);
    }

    #[tokio::test]
    async fn test_lookup_defaults_to_linux() {
        let pod = PodRef::lookup(&MockCluster::new(), "ns", "client-0")
            .await
            .unwrap();

        assert_eq!(pod.os, PodOs::Linux);
    }

    #[tokio::test]
    async fn test_existing_source_is_not_released() {
        let cluster = MockCluster::new();
        let pod = PodRef {
            namespace: "ns".to_string(),
            name: "client".to_string(),
            container: None,
            ip: "10.0.1.7".to_string(),
            host_network: false,
            os: PodOs::Linux,
            sidecar: None,
        };

        let resolved = ProbeSource::from(pod)
            .ensure(&cluster, &CanaryDefaults::default())
            .await
            .unwrap();
        assert!(resolved.canary.is_none());
        resolved.release(&cluster).await.unwrap();

        assert!(cluster.created_pods().is_empty());
        assert!(cluster.deleted_pods().is_empty());
    }

    #[test]
    fn test_host_networked_dispatch() {
        let spec = CanarySpec::new("ns").host_networked();
        assert!(ProbeSource::from(spec).host_networked());
        assert!(!ProbeSource::from(CanarySpec::new("ns")).host_networked());
    }
}
