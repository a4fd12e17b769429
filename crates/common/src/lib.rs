//! Shared configuration and telemetry for the network-policy e2e suite.

#![warn(clippy::pedantic)]

/// Suite configuration loaded from environment variables
pub mod config;

/// Tracing initialisation for test binaries
pub mod telemetry;
