//! Background traffic for tests that watch counters move.
//!
//! A policy that has just been applied may not be enforced yet when the first
//! probe runs. Tests that assert on drop counters therefore keep traffic
//! flowing in the background while they poll the metric, then stop the
//! generator before continuing.
//!
//! # Shutdown
//!
//! [`TrafficGenerator::stop`] cancels the worker and waits for it to exit.
//! The attempt in flight when cancellation arrives is abandoned.

use crate::cluster::ClusterOps;
use crate::shell::connect_argv;
use crate::source::PodRef;
use common::config::ProbeClient;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum TrafficError {
    #[error("Traffic worker panicked or was aborted: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Counts reported by a stopped generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrafficStats {
    pub attempts: u64,
    /// Attempts whose client command exited zero.
    pub connected: u64,
}

#[derive(Debug, Default)]
struct Counters {
    attempts: AtomicU64,
    connected: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> TrafficStats {
        TrafficStats {
            attempts: self.attempts.load(Ordering::SeqCst),
            connected: self.connected.load(Ordering::SeqCst),
        }
    }
}

/// Handle to a running background traffic worker.
pub struct TrafficGenerator {
    cancel_token: CancellationToken,
    counters: Arc<Counters>,
    handle: JoinHandle<()>,
}

impl TrafficGenerator {
    /// Start repeatedly connecting from `source` to `target`, pausing
    /// `interval` between attempts.
    pub fn start(
        cluster: Arc<dyn ClusterOps>,
        source: PodRef,
        target: &str,
        client: ProbeClient,
        interval: Duration,
    ) -> Self {
        let cancel_token = CancellationToken::new();
        let counters = Arc::new(Counters::default());
        let argv = connect_argv(source.os, client, target);

        info!(
            target: "netpol.traffic",
            source = %source.name,
            target_addr = %target,
            "Starting background traffic"
        );

        let handle = tokio::spawn(run_traffic(
            cluster,
            source,
            argv,
            interval,
            counters.clone(),
            cancel_token.clone(),
        ));

        Self {
            cancel_token,
            counters,
            handle,
        }
    }

    /// Counts so far, without stopping.
    pub fn stats(&self) -> TrafficStats {
        self.counters.snapshot()
    }

    /// Cancel the worker and wait for it to finish.
    pub async fn stop(self) -> Result<TrafficStats, TrafficError> {
        self.cancel_token.cancel();
        self.handle.await?;
        let stats = self.counters.snapshot();
        info!(
            target: "netpol.traffic",
            attempts = stats.attempts,
            connected = stats.connected,
            "Background traffic stopped"
        );
        Ok(stats)
    }
}

async fn run_traffic(
    cluster: Arc<dyn ClusterOps>,
    source: PodRef,
    argv: Vec<String>,
    interval: Duration,
    counters: Arc<Counters>,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            result = cluster.exec(&source.namespace, &source.name, source.container.as_deref(), &argv) => {
                counters.attempts.fetch_add(1, Ordering::SeqCst);
                match result {
                    Ok(output) if output.success() => {
                        counters.connected.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(output) => {
                        debug!(target: "netpol.traffic", exit_code = output.exit_code, "Traffic attempt failed");
                    }
                    Err(e) => {
                        debug!(target: "netpol.traffic", error = %e, "Traffic attempt could not exec");
                    }
                }
            }
            _ = cancel_token.cancelled() => break,
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel_token.cancelled() => break,
        }
    }
}
