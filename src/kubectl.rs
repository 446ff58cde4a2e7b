//! Typed wrapper around the `kubectl` CLI.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::exec::{CommandRunner, Invocation};
use crate::readiness::{
    evaluate_conditions, ConditionQuery, ConditionStatus, QueryError, ReadinessCondition, Subject,
};

/// Issues kubectl commands through a [`CommandRunner`].
#[derive(Clone)]
pub struct Kubectl {
    runner: Arc<dyn CommandRunner>,
    binary: String,
}

impl Kubectl {
    pub fn new(runner: Arc<dyn CommandRunner>, binary: impl Into<String>) -> Self {
        Self {
            runner,
            binary: binary.into(),
        }
    }

    fn command(&self) -> Invocation {
        Invocation::new(&self.binary)
    }

    async fn run(&self, invocation: Invocation) -> Result<String> {
        Ok(self.runner.run_checked(&invocation).await?.stdout)
    }

    /// Applies a manifest file verbatim.
    pub async fn apply_file(&self, path: &Path, namespace: Option<&str>) -> Result<()> {
        if !path.exists() {
            return Err(Error::ManifestNotFound(path.to_path_buf()));
        }

        let mut invocation = self
            .command()
            .args(["apply", "-f"])
            .arg(path.to_string_lossy());
        if let Some(ns) = namespace {
            invocation = invocation.args(["-n", ns]);
        }

        let output = self.run(invocation).await?;
        tracing::info!(manifest = %path.display(), "applied manifest");
        for line in output.lines().filter(|l| !l.trim().is_empty()) {
            tracing::debug!(line, "kubectl apply");
        }
        Ok(())
    }

    /// Applies a manifest passed on stdin.
    pub async fn apply_stdin(&self, manifest: String) -> Result<()> {
        self.run(self.command().args(["apply", "-f", "-"]).stdin(manifest))
            .await
            .map(|_| ())
    }

    /// Creates a namespace, succeeding if it already exists.
    pub async fn ensure_namespace(&self, namespace: &str) -> Result<()> {
        let manifest = self
            .run(self.command().args([
                "create",
                "namespace",
                namespace,
                "--dry-run=client",
                "-o",
                "yaml",
            ]))
            .await?;
        self.apply_stdin(manifest).await
    }

    /// Creates or replaces a `kubernetes.io/tls` secret.
    pub async fn apply_tls_secret(
        &self,
        name: &str,
        namespace: &str,
        cert: &Path,
        key: &Path,
    ) -> Result<()> {
        let manifest = self
            .run(
                self.command()
                    .args(["create", "secret", "tls", name])
                    .arg(format!("--cert={}", cert.display()))
                    .arg(format!("--key={}", key.display()))
                    .args(["-n", namespace, "--dry-run=client", "-o", "yaml"]),
            )
            .await?;
        self.apply_stdin(manifest).await
    }

    /// Fetches a subject as JSON.
    pub async fn get_json(&self, subject: &Subject) -> Result<Value> {
        let stdout = self
            .run(
                self.command()
                    .arg("get")
                    .args(subject.kubectl_args())
                    .args(["-o", "json"]),
            )
            .await?;
        Ok(serde_json::from_str(&stdout)?)
    }

    /// Returns the still-encoded `data` map of a secret.
    pub async fn secret_data(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<BTreeMap<String, String>> {
        let secret = self
            .get_json(&Subject::Resource {
                kind: "secret".to_string(),
                name: name.to_string(),
                namespace: namespace.to_string(),
            })
            .await?;

        match secret.get("data") {
            Some(data) => Ok(serde_json::from_value(data.clone())?),
            None => Ok(BTreeMap::new()),
        }
    }

    pub async fn describe(&self, subject: &Subject) -> Result<String> {
        self.run(self.command().arg("describe").args(subject.kubectl_args()))
            .await
    }

    /// Full resource YAML.
    pub async fn get_yaml(&self, subject: &Subject) -> Result<String> {
        self.run(
            self.command()
                .arg("get")
                .args(subject.kubectl_args())
                .args(["-o", "yaml"]),
        )
        .await
    }

    /// Pod listing for a namespace.
    pub async fn pods(&self, namespace: &str) -> Result<String> {
        self.run(self.command().args(["get", "pods", "-n", namespace, "-o", "wide"]))
            .await
    }

    /// Recent container logs. Nodes have no logs and yield an empty string.
    pub async fn logs(&self, subject: &Subject, tail: u32) -> Result<String> {
        let tail = format!("--tail={}", tail);
        let invocation = match subject {
            Subject::Nodes => return Ok(String::new()),
            Subject::Resource { .. } => self
                .command()
                .arg("logs")
                .args(subject.kubectl_args())
                .args(["--all-containers", tail.as_str()]),
            Subject::Selector {
                selector,
                namespace,
                ..
            } => self.command().args([
                "logs",
                "-l",
                selector.as_str(),
                "-n",
                namespace.as_str(),
                "--all-containers",
                "--prefix",
                tail.as_str(),
            ]),
        };
        self.run(invocation).await
    }

    /// Command line for a port-forward to a service.
    pub fn port_forward(
        &self,
        service: &str,
        namespace: &str,
        local_port: u16,
        remote_port: u16,
    ) -> Invocation {
        self.command()
            .arg("port-forward")
            .arg(format!("service/{}", service))
            .arg(format!("{}:{}", local_port, remote_port))
            .args(["-n", namespace])
    }
}

#[async_trait]
impl ConditionQuery for Kubectl {
    async fn query(
        &self,
        condition: &ReadinessCondition,
    ) -> std::result::Result<ConditionStatus, QueryError> {
        match self.get_json(&condition.subject).await {
            Ok(document) => Ok(evaluate_conditions(&document, &condition.condition)),
            Err(e @ Error::Spawn { .. }) => Err(QueryError::Fatal(e.to_string())),
            Err(e) => Err(QueryError::Transient(e.to_string())),
        }
    }
}
