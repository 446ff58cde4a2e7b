//! Diagnostic dumps for conditions that never became ready.

use async_trait::async_trait;

use crate::kubectl::Kubectl;
use crate::readiness::{Diagnostics, ReadinessCondition, Subject};

/// Kinds `kubectl logs` resolves to pods on its own.
const LOGGABLE_KINDS: &[&str] = &[
    "pod",
    "po",
    "deployment",
    "deploy",
    "statefulset",
    "sts",
    "daemonset",
    "ds",
    "replicaset",
    "rs",
    "job",
    "service",
    "svc",
];

fn resolves_to_pods(kind: &str) -> bool {
    let base = kind.split('.').next().unwrap_or(kind).to_ascii_lowercase();
    let singular = base.strip_suffix('s').unwrap_or(&base);
    LOGGABLE_KINDS.contains(&base.as_str()) || LOGGABLE_KINDS.contains(&singular)
}

/// How much state to dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpDepth {
    /// `describe` plus recent logs.
    Basic,
    /// Full resource YAML, pod listing and recent logs.
    Full,
}

/// Dumps cluster state through kubectl into the log.
pub struct ClusterDiagnostics {
    kubectl: Kubectl,
    depth: DumpDepth,
    tail: u32,
    log_selector: Option<String>,
}

impl ClusterDiagnostics {
    pub fn new(kubectl: Kubectl, depth: DumpDepth) -> Self {
        Self {
            kubectl,
            depth,
            tail: 100,
            log_selector: None,
        }
    }

    pub fn with_tail(mut self, tail: u32) -> Self {
        self.tail = tail;
        self
    }

    /// Tails pods matching `selector` instead of the subject itself.
    pub fn with_log_selector(mut self, selector: Option<impl Into<String>>) -> Self {
        self.log_selector = selector.map(Into::into);
        self
    }

    /// Where recent logs come from, if anywhere.
    fn log_source(&self, subject: &Subject) -> Option<Subject> {
        let namespace = subject.namespace()?;

        if let Some(selector) = &self.log_selector {
            return Some(Subject::Selector {
                kind: "pod".to_string(),
                selector: selector.clone(),
                namespace: namespace.to_string(),
            });
        }

        match subject {
            Subject::Resource { kind, .. } if !resolves_to_pods(kind) => {
                tracing::debug!(%kind, "no log selector for custom kind; skipping logs");
                None
            }
            _ => Some(subject.clone()),
        }
    }
}

fn emit(condition: &ReadinessCondition, section: &str, result: crate::error::Result<String>) {
    match result {
        Ok(text) if text.trim().is_empty() => {}
        Ok(text) => tracing::error!(%condition, section, "diagnostics:\n{}", text.trim_end()),
        Err(e) => tracing::warn!(%condition, section, error = %e, "could not collect diagnostics"),
    }
}

#[async_trait]
impl Diagnostics for ClusterDiagnostics {
    async fn collect(&self, condition: &ReadinessCondition) {
        let subject = &condition.subject;

        match self.depth {
            DumpDepth::Basic => {
                emit(condition, "describe", self.kubectl.describe(subject).await);
            }
            DumpDepth::Full => {
                emit(condition, "resource", self.kubectl.get_yaml(subject).await);
                if let Some(namespace) = subject.namespace() {
                    emit(condition, "pods", self.kubectl.pods(namespace).await);
                }
            }
        }

        if let Some(source) = self.log_source(subject) {
            emit(condition, "logs", self.kubectl.logs(&source, self.tail).await);
        }
    }
}
