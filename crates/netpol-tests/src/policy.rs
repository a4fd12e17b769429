//! Policy CLI access.
//!
//! Policy documents are opaque to the harness: they are handed to the CLI
//! as text and their effect is observed through connectivity probes only.

use crate::process::{self, ProcessError};
use async_trait::async_trait;
use common::config::SuiteConfig;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::info;

/// Policy CLI errors.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Policy CLI invocation failed: {0}")]
    Cli(#[from] ProcessError),

    #[error("Policy CLI returned invalid JSON for {kind}/{name}: {source}")]
    InvalidJson {
        kind: String,
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Policy CLI returned a non-object for {kind}/{name}")]
    NotAnObject { kind: String, name: String },
}

/// Operations on the cluster's policy engine.
#[async_trait]
pub trait PolicyCli: Send + Sync {
    /// Create or update every resource in a policy document.
    async fn apply(&self, document: &str) -> Result<(), PolicyError>;

    async fn delete(
        &self,
        kind: &str,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<(), PolicyError>;

    /// Fetch one resource as a JSON object.
    async fn get(
        &self,
        kind: &str,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<Map<String, Value>, PolicyError>;

    /// Merge-patch a resource.
    async fn patch(&self, kind: &str, name: &str, patch: &Value) -> Result<(), PolicyError>;

    /// Text dump of every applied policy, for failure diagnostics.
    async fn snapshot(&self) -> Result<String, PolicyError>;
}

/// `calicoctl`-backed policy CLI.
#[derive(Debug, Clone)]
pub struct Calicoctl {
    binary: String,
}

impl Calicoctl {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn from_config(config: &SuiteConfig) -> Self {
        Self::new(config.calicoctl.clone())
    }

    /// Return the CLI's version banner. Fails if the CLI cannot reach the
    /// datastore.
    pub async fn version(&self) -> Result<String, PolicyError> {
        let output = process::run(&self.binary, &["version"], None).await?;
        Ok(output.stdout)
    }
}

fn scoped_args<'a>(base: &[&'a str], namespace: Option<&'a str>) -> Vec<&'a str> {
    let mut args = base.to_vec();
    if let Some(ns) = namespace {
        args.push("-n");
        args.push(ns);
    }
    args
}

#[async_trait]
impl PolicyCli for Calicoctl {
    async fn apply(&self, document: &str) -> Result<(), PolicyError> {
        process::run(&self.binary, &["apply", "-f", "-"], Some(document)).await?;
        info!(target: "netpol.policy", bytes = document.len(), "Applied policy document");
        Ok(())
    }

    async fn delete(
        &self,
        kind: &str,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<(), PolicyError> {
        let args = scoped_args(&["delete", kind, name], namespace);
        process::run(&self.binary, &args, None).await?;
        info!(
            target: "netpol.policy",
            kind = %kind,
            name = %name,
            namespace = ?namespace,
            "Deleted policy resource"
        );
        Ok(())
    }

    async fn get(
        &self,
        kind: &str,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<Map<String, Value>, PolicyError> {
        let args = scoped_args(&["get", kind, name, "-o", "json"], namespace);
        let output = process::run(&self.binary, &args, None).await?;
        parse_object(kind, name, &output.stdout)
    }

    async fn patch(&self, kind: &str, name: &str, patch: &Value) -> Result<(), PolicyError> {
        let body = patch.to_string();
        process::run(&self.binary, &["patch", kind, name, "-p", body.as_str()], None).await?;
        Ok(())
    }

    async fn snapshot(&self) -> Result<String, PolicyError> {
        let queries: [&[&str]; 2] = [
            &["get", "globalnetworkpolicy", "-o", "yaml"],
            &["get", "networkpolicy", "--all-namespaces", "-o", "yaml"],
        ];

        let mut out = String::new();
        for args in queries {
            out.push_str(&format!("# {} {}\n", self.binary, args.join(" ")));
            match process::run(&self.binary, args, None).await {
                Ok(output) => out.push_str(&output.stdout),
                Err(e) => out.push_str(&format!("<unavailable: {}>\n", e)),
            }
        }
        Ok(out)
    }
}

fn parse_object(kind: &str, name: &str, json: &str) -> Result<Map<String, Value>, PolicyError> {
    let value: Value = serde_json::from_str(json).map_err(|source| PolicyError::InvalidJson {
        kind: kind.to_string(),
        name: name.to_string(),
        source,
    })?;

    match value {
        Value::Object(map) => Ok(map),
        _ => Err(PolicyError::NotAnObject {
            kind: kind.to_string(),
            name: name.to_string(),
        }),
    }
}
