//! Connectivity commands executed inside probe pods.

use common::config::ProbeClient;
use serde::{Deserialize, Serialize};

/// Per-attempt connect timeout passed to the in-pod client, in seconds.
pub const CONNECT_TIMEOUT_SECONDS: u32 = 2;

/// Per-attempt total timeout passed to the in-pod client, in seconds.
pub const REQUEST_TIMEOUT_SECONDS: u32 = 5;

/// Operating system of the node a probe pod runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PodOs {
    #[default]
    Linux,
    Windows,
}

impl PodOs {
    /// Value of the `kubernetes.io/os` node label.
    pub fn node_label(self) -> &'static str {
        match self {
            PodOs::Linux => "linux",
            PodOs::Windows => "windows",
        }
    }

    /// Parse a `kubernetes.io/os` label value.
    pub fn from_node_label(label: &str) -> Option<Self> {
        match label {
            "linux" => Some(PodOs::Linux),
            "windows" => Some(PodOs::Windows),
            _ => None,
        }
    }

    /// Command keeping an otherwise idle probe container alive.
    pub fn idle_command(self) -> Vec<String> {
        match self {
            PodOs::Linux => vec![
                "sh".to_string(),
                "-c".to_string(),
                "trap 'exit 0' TERM; while true; do sleep 1; done".to_string(),
            ],
            PodOs::Windows => vec![
                "powershell.exe".to_string(),
                "-Command".to_string(),
                "while ($true) { Start-Sleep -Seconds 1 }".to_string(),
            ],
        }
    }
}

/// Prefix `http://` when the target is a bare `host:port`.
pub fn target_url(target: &str) -> String {
    if target.contains("://") {
        target.to_string()
    } else {
        format!("http://{}", target)
    }
}

/// Build the argv that fetches `target` once and prints the response body.
///
/// The argv exits non-zero when the connection fails or times out.
pub fn connect_argv(os: PodOs, client: ProbeClient, target: &str) -> Vec<String> {
    let url = target_url(target);
    match os {
        PodOs::Linux => {
            let script = match client {
                ProbeClient::Wget => format!(
                    "wget -qO- -T {} {}",
                    CONNECT_TIMEOUT_SECONDS,
                    shell_quote(&url)
                ),
                ProbeClient::Curl => format!(
                    "curl -sS --fail --connect-timeout {} -m {} {}",
                    CONNECT_TIMEOUT_SECONDS,
                    REQUEST_TIMEOUT_SECONDS,
                    shell_quote(&url)
                ),
            };
            vec!["sh".to_string(), "-c".to_string(), script]
        }
        PodOs::Windows => {
            let script = format!(
                "$ErrorActionPreference = 'Stop'; \
                 $r = Invoke-WebRequest -UseBasicParsing -TimeoutSec {} -Uri {}; \
                 Write-Output $r.Content",
                REQUEST_TIMEOUT_SECONDS,
                powershell_quote(&url)
            );
            vec![
                "powershell.exe".to_string(),
                "-NoProfile".to_string(),
                "-Command".to_string(),
                script,
            ]
        }
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn powershell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}
