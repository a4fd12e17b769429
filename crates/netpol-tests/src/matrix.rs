//! Table-driven connectivity scenarios.
//!
//! A policy test usually asserts the same thing for many source/target
//! pairs. Scenarios run one after another through the same
//! [`ConnectivityProbe`] and every outcome is kept, so one failing row does
//! not hide the others.

use crate::probe::{ConnectivityProbe, Probe, ProbeError, ProbeReport};
use crate::reachability::Reachability;
use crate::source::ProbeSource;
use std::fmt;
use tracing::info;

/// One row of a connectivity matrix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scenario {
    pub name: String,
    pub source: ProbeSource,
    pub target: String,
    pub expect: Reachability,
}

impl Scenario {
    pub fn new(
        name: impl Into<String>,
        source: impl Into<ProbeSource>,
        target: impl Into<String>,
        expect: Reachability,
    ) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            target: target.into(),
            expect,
        }
    }

    fn probe(&self) -> Probe {
        Probe::new(self.source.clone(), self.target.clone(), self.expect)
    }
}

/// Outcome of one scenario.
#[derive(Debug)]
pub struct ScenarioOutcome {
    pub name: String,
    pub result: Result<ProbeReport, ProbeError>,
}

/// Outcomes of a whole matrix, in scenario order.
#[derive(Debug, Default)]
pub struct MatrixReport {
    pub outcomes: Vec<ScenarioOutcome>,
}

impl MatrixReport {
    pub fn passed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failed(&self) -> impl Iterator<Item = &ScenarioOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_err())
    }

    /// Succeed only if every scenario passed.
    pub fn into_result(self) -> Result<Vec<ProbeReport>, MatrixFailure> {
        let total = self.outcomes.len();
        let mut reports = Vec::with_capacity(total);
        let mut failures = Vec::new();

        for outcome in self.outcomes {
            match outcome.result {
                Ok(report) => reports.push(report),
                Err(e) => failures.push((outcome.name, e)),
            }
        }

        if failures.is_empty() {
            Ok(reports)
        } else {
            Err(MatrixFailure { total, failures })
        }
    }
}

/// The scenarios of a matrix that did not pass.
#[derive(Debug)]
pub struct MatrixFailure {
    pub total: usize,
    pub failures: Vec<(String, ProbeError)>,
}

impl MatrixFailure {
    pub fn names(&self) -> Vec<&str> {
        self.failures.iter().map(|(name, _)| name.as_str()).collect()
    }
}

impl fmt::Display for MatrixFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} of {} connectivity scenarios failed:",
            self.failures.len(),
            self.total
        )?;
        for (name, err) in &self.failures {
            writeln!(f, "=== {} ===", name)?;
            writeln!(f, "{}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for MatrixFailure {}

/// Run every scenario sequentially and collect the outcomes.
pub async fn run_matrix(probe: &ConnectivityProbe, scenarios: &[Scenario]) -> MatrixReport {
    let mut report = MatrixReport::default();

    for scenario in scenarios {
        info!(
            target: "netpol.probe",
            scenario = %scenario.name,
            target_addr = %scenario.target,
            expect = %scenario.expect,
            "Running connectivity scenario"
        );
        let result = probe.check(&scenario.probe()).await;
        report.outcomes.push(ScenarioOutcome {
            name: scenario.name.clone(),
            result,
        });
    }

    report
}
