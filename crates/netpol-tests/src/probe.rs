//! Connectivity probe: retry a connection until it behaves as expected.
//!
//! A probe resolves its source (creating a canary pod when asked to), then
//! repeatedly execs the platform's HTTP client against the target and judges
//! each attempt. Attempts continue until one satisfies the expectation or
//! the time budget runs out. At least two attempts run before the budget can
//! end the probe, and a refused connection only passes an `Unreachable`
//! expectation from the second attempt on, so a single transient hiccup
//! cannot decide the verdict. Canary pods are deleted whatever the outcome.

use crate::canary::CanaryDefaults;
use crate::cluster::{ClusterError, ClusterOps, ExecOutput};
use crate::diagnostics::Diagnostics;
use crate::policy::PolicyCli;
use crate::reachability::{
    accepts, judge, FailureReason, Judgement, Observation, Reachability,
};
use crate::shell::connect_argv;
use crate::source::{PodRef, ProbeSource};
use common::config::{ProbeClient, SuiteConfig};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Knobs shared by every probe a [`ConnectivityProbe`] runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOptions {
    pub budget: Duration,
    pub interval: Duration,
    pub client: ProbeClient,
    pub canary: CanaryDefaults,
    pub collect_diagnostics: bool,
}

impl ProbeOptions {
    pub fn from_config(config: &SuiteConfig) -> Self {
        Self {
            budget: config.probe_budget(),
            interval: config.probe_interval(),
            client: config.probe_client,
            canary: CanaryDefaults::from_config(config),
            collect_diagnostics: true,
        }
    }

    #[must_use]
    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub fn with_client(mut self, client: ProbeClient) -> Self {
        self.client = client;
        self
    }

    #[must_use]
    pub fn with_diagnostics(mut self, enabled: bool) -> Self {
        self.collect_diagnostics = enabled;
        self
    }
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self::from_config(&SuiteConfig::default())
    }
}

/// One connectivity assertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    pub source: ProbeSource,
    pub target: String,
    pub expect: Reachability,
    /// Overrides [`ProbeOptions::budget`] for this probe.
    pub budget: Option<Duration>,
}

impl Probe {
    pub fn new(
        source: impl Into<ProbeSource>,
        target: impl Into<String>,
        expect: Reachability,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            expect,
            budget: None,
        }
    }

    #[must_use]
    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = Some(budget);
        self
    }
}

/// Result of a single connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReachabilityVerdict {
    /// The client command exited zero.
    pub success: bool,
    pub observed_source_ip: Option<String>,
    pub raw_output: String,
    pub error: Option<String>,
    observation: Observation,
}

impl ReachabilityVerdict {
    /// Interpret the outcome of exec'ing the client command.
    ///
    /// A failure to exec at all counts as a failed connection.
    pub fn from_exec(result: Result<ExecOutput, ClusterError>) -> Self {
        match result {
            Ok(output) => {
                let success = output.success();
                let observation = Observation::from_output(success, &output.stdout, &output.stderr);
                let error = match &observation {
                    Observation::NotConnected { error } => Some(error.clone()),
                    _ => None,
                };
                Self {
                    success,
                    observed_source_ip: observation.source_ip().map(str::to_string),
                    raw_output: raw_output(&output),
                    error,
                    observation,
                }
            }
            Err(e) => {
                let error = e.to_string();
                Self {
                    success: false,
                    observed_source_ip: None,
                    raw_output: String::new(),
                    error: Some(error.clone()),
                    observation: Observation::NotConnected { error },
                }
            }
        }
    }

    pub fn observation(&self) -> &Observation {
        &self.observation
    }
}

fn raw_output(output: &ExecOutput) -> String {
    match (output.stdout.trim().is_empty(), output.stderr.trim().is_empty()) {
        (_, true) => output.stdout.clone(),
        (true, false) => output.stderr.clone(),
        (false, false) => format!("{}\n[stderr] {}", output.stdout.trim_end(), output.stderr),
    }
}

/// A probe that reached its expectation.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub target: String,
    pub expect: Reachability,
    pub source_pod: String,
    pub attempts: u32,
    pub elapsed: Duration,
    /// The satisfying attempt.
    pub verdict: ReachabilityVerdict,
    /// Why the most recent earlier attempt fell short, if any did.
    pub last_mismatch: Option<FailureReason>,
    /// Canary deletion failure, if any. Does not affect the verdict.
    pub teardown_error: Option<String>,
}

/// Everything known about a probe that never reached its expectation.
#[derive(Debug, Clone)]
pub struct ProbeFailure {
    pub target: String,
    pub expect: Reachability,
    pub source_pod: String,
    pub attempts: u32,
    pub elapsed: Duration,
    pub last: ReachabilityVerdict,
    pub reason: FailureReason,
    pub teardown_error: Option<String>,
    pub diagnostics: Option<Diagnostics>,
}

impl fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.reason)?;
        writeln!(f, "  target:     {}", self.target)?;
        writeln!(f, "  source:     {}", self.source_pod)?;
        writeln!(f, "  expected:   {}", self.expect)?;
        writeln!(f, "  observed:   {}", self.last.observation())?;
        writeln!(
            f,
            "  attempts:   {} in {:.1}s",
            self.attempts,
            self.elapsed.as_secs_f64()
        )?;
        writeln!(f, "  last output: {:?}", self.last.raw_output)?;
        if let Some(err) = &self.teardown_error {
            writeln!(f, "  teardown:   {}", err)?;
        }
        if let Some(diagnostics) = &self.diagnostics {
            write!(f, "{}", diagnostics)?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    /// The source could not be prepared; no connectivity verdict exists.
    #[error("Probe setup failed: {0}")]
    Setup(#[from] ClusterError),

    #[error("{0}")]
    Unsatisfied(Box<ProbeFailure>),
}

impl ProbeError {
    pub fn failure(&self) -> Option<&ProbeFailure> {
        match self {
            ProbeError::Unsatisfied(failure) => Some(failure),
            ProbeError::Setup(_) => None,
        }
    }
}

/// Runs [`Probe`]s against a cluster.
#[derive(Clone)]
pub struct ConnectivityProbe {
    cluster: Arc<dyn ClusterOps>,
    policy: Option<Arc<dyn PolicyCli>>,
    options: ProbeOptions,
}

impl ConnectivityProbe {
    pub fn new(cluster: Arc<dyn ClusterOps>, options: ProbeOptions) -> Self {
        Self {
            cluster,
            policy: None,
            options,
        }
    }

    /// Include a policy snapshot in failure diagnostics.
    #[must_use]
    pub fn with_policy_cli(mut self, policy: Arc<dyn PolicyCli>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn options(&self) -> &ProbeOptions {
        &self.options
    }

    pub fn cluster(&self) -> &Arc<dyn ClusterOps> {
        &self.cluster
    }

    /// Shorthand for [`check`](Self::check) on a freshly built [`Probe`].
    pub async fn expect(
        &self,
        source: impl Into<ProbeSource>,
        target: &str,
        expect: Reachability,
    ) -> Result<ProbeReport, ProbeError> {
        self.check(&Probe::new(source, target, expect)).await
    }

    /// Run one probe to a verdict.
    pub async fn check(&self, probe: &Probe) -> Result<ProbeReport, ProbeError> {
        let cluster = self.cluster.as_ref();
        let resolved = probe.source.ensure(cluster, &self.options.canary).await?;
        let pod = resolved.pod.clone();

        let budget = probe.budget.unwrap_or(self.options.budget);
        let outcome = self.retry(&pod, &probe.target, probe.expect, budget).await;

        let diagnostics = match &outcome.result {
            Err(_) if self.options.collect_diagnostics => Some(
                Diagnostics::collect(cluster, self.policy.as_deref(), &pod).await,
            ),
            _ => None,
        };

        let teardown_error = match resolved.release(cluster).await {
            Ok(()) => None,
            Err(e) => {
                warn!(
                    target: "netpol.probe",
                    namespace = %pod.namespace,
                    pod = %pod.name,
                    error = %e,
                    "Failed to delete probe pod"
                );
                Some(e.to_string())
            }
        };

        match outcome.result {
            Ok(()) => {
                info!(
                    target: "netpol.probe",
                    target_addr = %probe.target,
                    expect = %probe.expect,
                    attempts = outcome.attempts,
                    elapsed = ?outcome.elapsed,
                    "Probe satisfied"
                );
                Ok(ProbeReport {
                    target: probe.target.clone(),
                    expect: probe.expect,
                    source_pod: qualified_name(&pod),
                    attempts: outcome.attempts,
                    elapsed: outcome.elapsed,
                    verdict: outcome.last,
                    last_mismatch: outcome.last_mismatch,
                    teardown_error,
                })
            }
            Err(reason) => {
                info!(
                    target: "netpol.probe",
                    target_addr = %probe.target,
                    expect = %probe.expect,
                    attempts = outcome.attempts,
                    reason = %reason,
                    "Probe budget exhausted"
                );
                Err(ProbeError::Unsatisfied(Box::new(ProbeFailure {
                    target: probe.target.clone(),
                    expect: probe.expect,
                    source_pod: qualified_name(&pod),
                    attempts: outcome.attempts,
                    elapsed: outcome.elapsed,
                    last: outcome.last,
                    reason,
                    teardown_error,
                    diagnostics,
                })))
            }
        }
    }

    async fn retry(
        &self,
        pod: &PodRef,
        target: &str,
        expect: Reachability,
        budget: Duration,
    ) -> RetryOutcome {
        let identity = pod.identity();
        let argv = connect_argv(pod.os, self.options.client, target);
        let start = Instant::now();
        let mut attempts = 0u32;
        let mut last_mismatch: Option<FailureReason> = None;

        loop {
            attempts += 1;
            let verdict = ReachabilityVerdict::from_exec(
                self.cluster
                    .exec(&pod.namespace, &pod.name, pod.container.as_deref(), &argv)
                    .await,
            );

            let judgement = judge(expect, verdict.observation(), &identity);
            let elapsed = start.elapsed();
            let satisfied = judgement == Judgement::Satisfied;

            debug!(
                target: "netpol.probe",
                target_addr = %target,
                attempt = attempts,
                observed = %verdict.observation(),
                satisfied,
                "Probe attempt"
            );

            match judgement {
                Judgement::Satisfied if accepts(expect, attempts) => {
                    return RetryOutcome {
                        result: Ok(()),
                        attempts,
                        elapsed,
                        last: verdict,
                        last_mismatch,
                    };
                }
                Judgement::Satisfied => {
                    debug!(
                        target: "netpol.probe",
                        target_addr = %target,
                        attempt = attempts,
                        "Refusal needs confirming by another attempt"
                    );
                }
                Judgement::Mismatch(reason) => {
                    if let FailureReason::UnexpectedStdoutFormat { .. } = reason {
                        warn!(
                            target: "netpol.probe",
                            target_addr = %target,
                            attempt = attempts,
                            "Unexpected response format from echo server"
                        );
                    }

                    if attempts > 1 && elapsed >= budget {
                        return RetryOutcome {
                            result: Err(reason),
                            attempts,
                            elapsed,
                            last: verdict,
                            last_mismatch,
                        };
                    }
                    last_mismatch = Some(reason);
                }
            }

            let pause = if attempts >= 2 {
                self.options.interval.min(budget.saturating_sub(elapsed))
            } else {
                self.options.interval
            };
            sleep(pause).await;
        }
    }
}

struct RetryOutcome {
    result: Result<(), FailureReason>,
    attempts: u32,
    elapsed: Duration,
    last: ReachabilityVerdict,
    last_mismatch: Option<FailureReason>,
}

fn qualified_name(pod: &PodRef) -> String {
    format!("{}/{}", pod.namespace, pod.name)
}
