//! Reachability expectations and per-attempt classification.
//!
//! Every connectivity attempt produces an [`Observation`]. Whether that
//! observation satisfies an expected [`Reachability`] is decided in exactly
//! one place, [`judge`], so call sites never encode their own notion of
//! which mismatches are worth retrying.

use std::fmt;
use std::net::IpAddr;

/// Key of the echo server response line carrying the peer address.
pub const CLIENT_ADDRESS_KEY: &str = "client_address";

/// Expected behaviour of a network path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reachability {
    /// The connection must fail.
    Unreachable,

    /// The connection must succeed and the server must see the source pod IP.
    ReachableNoTranslation,

    /// The connection must succeed; the server may see any source address.
    ReachableWithTranslation,
}

impl Reachability {
    pub fn expects_connection(self) -> bool {
        !matches!(self, Reachability::Unreachable)
    }
}

impl fmt::Display for Reachability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reachability::Unreachable => write!(f, "unreachable"),
            Reachability::ReachableNoTranslation => write!(f, "reachable without SNAT"),
            Reachability::ReachableWithTranslation => write!(f, "reachable with SNAT"),
        }
    }
}

/// What a single connectivity attempt saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// The client got an echo response reporting this peer address.
    Connected { source_ip: String },

    /// The client command failed or timed out.
    NotConnected { error: String },

    /// The client command succeeded but the response was not echo output.
    Malformed { stdout: String },
}

impl Observation {
    /// Classify raw client output.
    ///
    /// A non-zero exit is a failed connection. A zero exit must carry a
    /// `client_address=<ip>` line; anything else is a protocol problem rather
    /// than a policy verdict.
    pub fn from_output(exit_ok: bool, stdout: &str, stderr: &str) -> Self {
        if !exit_ok {
            let error = if stderr.trim().is_empty() {
                "connection command exited non-zero".to_string()
            } else {
                stderr.trim().to_string()
            };
            return Observation::NotConnected { error };
        }

        match parse_client_address(stdout) {
            Some(source_ip) => Observation::Connected { source_ip },
            None => Observation::Malformed {
                stdout: stdout.to_string(),
            },
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Observation::Connected { .. })
    }

    pub fn source_ip(&self) -> Option<&str> {
        match self {
            Observation::Connected { source_ip } => Some(source_ip),
            _ => None,
        }
    }
}

impl fmt::Display for Observation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Observation::Connected { source_ip } => {
                write!(f, "connected (server saw {})", source_ip)
            }
            Observation::NotConnected { error } => write!(f, "not connected ({})", error),
            Observation::Malformed { .. } => write!(f, "connected with malformed response"),
        }
    }
}

/// Extract the peer address from echo server output.
///
/// The echo server prints a block of `key=value` lines; only the
/// `client_address` line matters here. A trailing `:port` is stripped and
/// IPv4-mapped IPv6 addresses are reduced to their IPv4 form.
pub fn parse_client_address(stdout: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        let (key, value) = line.trim().split_once('=')?;
        if key.trim() != CLIENT_ADDRESS_KEY {
            return None;
        }
        let value = value.trim();
        if value.is_empty() {
            return None;
        }
        Some(normalize_ip(value))
    })
}

fn normalize_ip(raw: &str) -> String {
    let candidate = raw.trim_start_matches('[');
    let candidate = match candidate.split_once(']') {
        Some((host, _port)) => host,
        None => candidate,
    };

    let candidate = match candidate.parse::<IpAddr>() {
        Ok(_) => candidate,
        // "10.0.1.7:4431"
        Err(_) => candidate
            .rsplit_once(':')
            .map(|(host, _)| host)
            .filter(|host| host.parse::<IpAddr>().is_ok())
            .unwrap_or(candidate),
    };

    match candidate.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
        Ok(IpAddr::V4(v4)) => v4.to_string(),
        Err(_) => candidate.to_string(),
    }
}

/// What the probe knows about where its traffic originates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceIdentity {
    pub pod_ip: String,
    pub host_networked: bool,
}

/// Why an attempt did not satisfy the expectation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    UnexpectedlySucceeded,
    UnexpectedlyFailed,
    IncorrectSourceIp { observed: String, expected: String },
    UnexpectedStdoutFormat { stdout: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::UnexpectedlySucceeded => {
                write!(f, "Failure: Connection unexpectedly succeeded")
            }
            FailureReason::UnexpectedlyFailed => write!(f, "Failure: Connection unexpectedly failed"),
            FailureReason::IncorrectSourceIp { observed, expected } => write!(
                f,
                "Failure: the server saw incorrect source IP {} (expected {})",
                observed, expected
            ),
            FailureReason::UnexpectedStdoutFormat { stdout } => {
                write!(f, "Failure: unexpected stdout format: {:?}", truncate(stdout))
            }
        }
    }
}

fn truncate(s: &str) -> String {
    const MAX: usize = 200;
    match s.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...[truncated]", s.get(..idx).unwrap_or(s)),
        None => s.to_string(),
    }
}

/// Outcome of judging one observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Judgement {
    Satisfied,
    /// Not yet satisfied. Always retryable while budget remains.
    Mismatch(FailureReason),
}

/// Attempts every probe makes before it may pass on a refused connection.
pub const MIN_UNREACHABLE_ATTEMPTS: u32 = 2;

/// Whether a satisfying attempt can end the probe.
///
/// A connection succeeding proves the path is open on its own. A refusal
/// may be one timed-out request against an open path, so `Unreachable` is
/// only accepted once [`MIN_UNREACHABLE_ATTEMPTS`] attempts have run; the
/// earlier attempts must not have connected for the probe to pass that soon.
pub fn accepts(expect: Reachability, attempts: u32) -> bool {
    expect.expects_connection() || attempts >= MIN_UNREACHABLE_ATTEMPTS
}

/// Decide whether an observation satisfies the expectation.
///
/// The source IP is only checked for [`Reachability::ReachableNoTranslation`]
/// from a pod-networked source. A malformed response satisfies nothing.
pub fn judge(expect: Reachability, observation: &Observation, source: &SourceIdentity) -> Judgement {
    match (expect, observation) {
        (_, Observation::Malformed { stdout }) => {
            Judgement::Mismatch(FailureReason::UnexpectedStdoutFormat {
                stdout: stdout.clone(),
            })
        }

        (Reachability::Unreachable, Observation::NotConnected { .. }) => Judgement::Satisfied,
        (Reachability::Unreachable, Observation::Connected { .. }) => {
            Judgement::Mismatch(FailureReason::UnexpectedlySucceeded)
        }

        (_, Observation::NotConnected { .. }) => {
            Judgement::Mismatch(FailureReason::UnexpectedlyFailed)
        }

        (Reachability::ReachableWithTranslation, Observation::Connected { .. }) => {
            Judgement::Satisfied
        }

        (Reachability::ReachableNoTranslation, Observation::Connected { source_ip }) => {
            if source.host_networked || *source_ip == source.pod_ip {
                Judgement::Satisfied
            } else {
                Judgement::Mismatch(FailureReason::IncorrectSourceIp {
                    observed: source_ip.clone(),
                    expected: source.pod_ip.clone(),
                })
            }
        }
    }
}
