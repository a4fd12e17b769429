//! Network Policy End-to-End Test Suite
//!
//! This crate drives a live Kubernetes cluster running Calico and asserts
//! that traffic between pods is allowed or denied as the applied network
//! policies say it should be. The core is [`probe::ConnectivityProbe`],
//! which retries a connection from a source pod until it behaves as
//! expected or a time budget runs out.
//!
//! # Features
//!
//! - `smoke`: Cluster and tooling health checks (30s)
//! - `policy`: Policy enforcement and SNAT matrices (3-5min)
//! - `observability`: Felix denied-packet metrics and logs
//! - `all`: Enable all test categories
//!
//! Probe semantics are covered by mock-backed tests that run without any
//! feature.
//!
//! # Prerequisites
//!
//! 1. A cluster with Calico installed, reachable through `kubectl`
//! 2. `calicoctl` in PATH, configured for the same cluster
//! 3. Node IPs reachable from the test host on the Felix metrics port
//!    (observability only)
//!
//! # Usage
//!
//! ```bash
//! # Probe semantics only, no cluster needed
//! cargo test -p netpol-tests
//!
//! # Smoke tests only
//! cargo test -p netpol-tests --features smoke
//!
//! # Full suite
//! cargo test -p netpol-tests --features all
//! ```

pub mod canary;
pub mod cluster;
pub mod context;
pub mod diagnostics;
pub mod echo;
pub mod eventual;
pub mod fixtures;
pub mod matrix;
pub mod mock;
pub mod policy;
pub mod probe;
pub mod process;
pub mod reachability;
pub mod shell;
pub mod source;
pub mod traffic;

pub use probe::{ConnectivityProbe, Probe, ProbeError, ProbeOptions, ProbeReport};
pub use reachability::Reachability;
pub use source::{PodRef, ProbeSource};
