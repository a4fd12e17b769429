//! calico-node log corroboration.

use crate::cluster::{ClusterError, ClusterOps};
use crate::eventual::{assert_eventually, ConsistencyCategory, NotConverged};
use regex::Regex;
use thiserror::Error;

/// Namespace calico-node runs in on operator-managed installs.
pub const CALICO_NAMESPACE: &str = "calico-system";

/// Selector matching every calico-node pod.
pub const CALICO_NODE_SELECTOR: &str = "k8s-app=calico-node";

#[derive(Debug, Error)]
pub enum LogsError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    NotConverged(#[from] NotConverged),
}

/// Count lines of `text` matching `pattern`.
pub fn count_matching(text: &str, pattern: &Regex) -> usize {
    text.lines().filter(|line| pattern.is_match(line)).count()
}

/// Reads calico-node (Felix) logs across all nodes.
pub struct FelixLogs<'a> {
    cluster: &'a dyn ClusterOps,
    namespace: String,
}

impl<'a> FelixLogs<'a> {
    pub fn new(cluster: &'a dyn ClusterOps) -> Self {
        Self {
            cluster,
            namespace: CALICO_NAMESPACE.to_string(),
        }
    }

    /// Use a different namespace, e.g. `kube-system` on manifest installs.
    #[must_use]
    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// The last `lines` lines from every calico-node pod.
    pub async fn tail(&self, lines: u32) -> Result<String, ClusterError> {
        self.cluster
            .logs_by_label(&self.namespace, CALICO_NODE_SELECTOR, lines)
            .await
    }

    /// Wait until at least `min` of the last `lines` lines match `pattern`.
    pub async fn wait_for_match(
        &self,
        pattern: &Regex,
        min: usize,
        lines: u32,
    ) -> Result<(), LogsError> {
        assert_eventually(ConsistencyCategory::LogAggregation, move || async move {
            match self.tail(lines).await {
                Ok(text) => count_matching(&text, pattern) >= min,
                Err(_) => false,
            }
        })
        .await?;
        Ok(())
    }
}
