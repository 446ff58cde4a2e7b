//! Cluster lifecycle and scoped teardown.
//!
//! [`ClusterGuard`] is armed before the cluster-creation call and deletes the
//! cluster exactly once: explicitly through [`ClusterGuard::release`], or from
//! `Drop` when the run is abandoned (interrupt, panic, dropped future).

use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::exec::{CommandRunner, Invocation};

/// Creates and deletes clusters by name.
#[async_trait]
pub trait ClusterProvider: Send + Sync {
    /// Creates the cluster and waits for the tool to return.
    async fn create(&self, name: &str) -> Result<()>;

    /// Deletes the cluster. Synchronous so it can run from `Drop`.
    fn delete(&self, name: &str) -> Result<()>;
}

/// Provider backed by the `kind` CLI.
pub struct KindProvider {
    runner: Arc<dyn CommandRunner>,
    binary: String,
}

impl KindProvider {
    pub fn new(runner: Arc<dyn CommandRunner>, binary: impl Into<String>) -> Self {
        Self {
            runner,
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl ClusterProvider for KindProvider {
    async fn create(&self, name: &str) -> Result<()> {
        let invocation = Invocation::new(&self.binary).args(["create", "cluster", "--name", name]);

        let output = self.runner.run(&invocation).await?;
        if !output.success() {
            return Err(Error::Provisioning {
                cluster: name.to_string(),
                reason: output.stderr.trim().to_string(),
            });
        }

        tracing::info!(cluster = name, "cluster created");
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        let output = Command::new(&self.binary)
            .args(["delete", "cluster", "--name", name])
            .output()
            .map_err(|source| Error::Spawn {
                program: self.binary.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(Error::CommandFailed {
                command: format!("{} delete cluster --name {}", self.binary, name),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Owns the obligation to delete one cluster.
pub struct ClusterGuard {
    provider: Arc<dyn ClusterProvider>,
    cluster: String,
    keep_cluster: bool,
    released: bool,
}

impl ClusterGuard {
    /// Arms the guard. Nothing is created yet.
    pub fn arm(
        provider: Arc<dyn ClusterProvider>,
        cluster: impl Into<String>,
        keep_cluster: bool,
    ) -> Self {
        let cluster = cluster.into();
        tracing::debug!(cluster = %cluster, keep_cluster, "cleanup guard armed");
        Self {
            provider,
            cluster,
            keep_cluster,
            released: false,
        }
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Creates the guarded cluster.
    pub async fn provision(&self) -> Result<()> {
        tracing::info!(cluster = %self.cluster, "creating cluster");
        self.provider.create(&self.cluster).await
    }

    /// Releases the guard, waiting `keep_for` before deleting.
    ///
    /// Later calls are no-ops. If this future is dropped during the grace
    /// delay, `Drop` deletes immediately instead.
    pub async fn release(&mut self, keep_for: Option<Duration>) {
        if self.released {
            return;
        }

        if !self.keep_cluster {
            if let Some(delay) = keep_for.filter(|d| !d.is_zero()) {
                tracing::info!(
                    cluster = %self.cluster,
                    keep_for_secs = delay.as_secs(),
                    "keeping cluster before deletion"
                );
                tokio::time::sleep(delay).await;
            }
        }

        self.teardown();
    }

    fn teardown(&mut self) {
        self.released = true;

        if self.keep_cluster {
            tracing::warn!(
                cluster = %self.cluster,
                "keeping cluster; delete it with `kind delete cluster --name {}`",
                self.cluster
            );
            return;
        }

        tracing::info!(cluster = %self.cluster, "deleting cluster");
        match self.provider.delete(&self.cluster) {
            Ok(()) => tracing::info!(cluster = %self.cluster, "cluster deleted"),
            Err(e) => {
                tracing::warn!(cluster = %self.cluster, error = %e, "cluster deletion failed")
            }
        }
    }
}

impl Drop for ClusterGuard {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!(cluster = %self.cluster, "run abandoned, tearing down cluster");
            self.teardown();
        }
    }
}
