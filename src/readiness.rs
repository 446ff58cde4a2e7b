//! Readiness barriers.
//!
//! A barrier turns an eventually-consistent observation ("this resource has
//! condition `Ready=True`") into a deterministic [`BarrierOutcome`]. The
//! condition is polled at a fixed interval until it reports `True`, a fatal
//! query error occurs, or the deadline passes. The first `True` wins; there is
//! no debounce.
//!
//! The barrier itself does no I/O: the query, the diagnostic dump and the
//! logging are all injected, so the state machine can be driven by a scripted
//! sequence of statuses under a paused clock.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::{sleep, Instant};

use crate::error::Error;

/// The thing a barrier waits on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subject {
    /// Every node in the cluster.
    Nodes,
    /// A single named resource, e.g. `deployment/keycloak-operator`.
    Resource {
        kind: String,
        name: String,
        namespace: String,
    },
    /// All resources of a kind matching a label selector.
    Selector {
        kind: String,
        selector: String,
        namespace: String,
    },
}

impl Subject {
    /// Namespace of namespaced subjects.
    pub fn namespace(&self) -> Option<&str> {
        match self {
            Subject::Nodes => None,
            Subject::Resource { namespace, .. } | Subject::Selector { namespace, .. } => {
                Some(namespace.as_str())
            }
        }
    }

    /// kubectl arguments that address this subject (after the verb).
    pub fn kubectl_args(&self) -> Vec<String> {
        match self {
            Subject::Nodes => vec!["nodes".to_string()],
            Subject::Resource {
                kind,
                name,
                namespace,
            } => vec![
                format!("{}/{}", kind, name),
                "-n".to_string(),
                namespace.clone(),
            ],
            Subject::Selector {
                kind,
                selector,
                namespace,
            } => vec![
                kind.clone(),
                "-l".to_string(),
                selector.clone(),
                "-n".to_string(),
                namespace.clone(),
            ],
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::Nodes => write!(f, "nodes"),
            Subject::Resource { kind, name, .. } => write!(f, "{}/{}", kind, name),
            Subject::Selector { kind, selector, .. } => write!(f, "{} -l {}", kind, selector),
        }
    }
}

/// A condition to wait for, with its timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessCondition {
    pub subject: Subject,
    /// Condition type, e.g. `Ready` or `Available`.
    pub condition: String,
    pub interval: Duration,
    pub deadline: Duration,
}

impl ReadinessCondition {
    /// Creates a condition with a 10s interval and a 600s deadline.
    pub fn new(subject: Subject, condition: impl Into<String>) -> Self {
        Self {
            subject,
            condition: condition.into(),
            interval: Duration::from_secs(10),
            deadline: Duration::from_secs(600),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }
}

impl fmt::Display for ReadinessCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.subject, self.condition)
    }
}

/// Tri-state answer of a condition query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    /// Reported `False`, possibly with a human-readable reason.
    False(Option<String>),
    /// Absent, not yet reported, or not observable.
    Unknown,
}

/// Why a query produced no status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// Worth retrying: the resource may not exist yet.
    Transient(String),
    /// Retrying cannot help, e.g. the API client cannot be executed.
    Fatal(String),
}

/// Final state of a barrier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BarrierOutcome {
    Ready,
    Failed(String),
    TimedOut,
}

impl BarrierOutcome {
    /// Maps non-ready outcomes to errors naming the condition.
    pub fn into_result(self, condition: &ReadinessCondition) -> crate::error::Result<()> {
        match self {
            BarrierOutcome::Ready => Ok(()),
            BarrierOutcome::Failed(reason) => Err(Error::BarrierFailed {
                subject: condition.subject.to_string(),
                reason,
            }),
            BarrierOutcome::TimedOut => Err(Error::BarrierTimedOut {
                subject: condition.subject.to_string(),
                condition: condition.condition.clone(),
                deadline: condition.deadline,
            }),
        }
    }
}

/// Reads the current status of a condition.
#[async_trait]
pub trait ConditionQuery: Send + Sync {
    async fn query(&self, condition: &ReadinessCondition) -> Result<ConditionStatus, QueryError>;
}

/// Dumps state for a condition that never became ready.
#[async_trait]
pub trait Diagnostics: Send + Sync {
    async fn collect(&self, condition: &ReadinessCondition);
}

/// Receives barrier progress. All methods default to no-ops.
pub trait BarrierObserver: Send + Sync {
    fn on_poll(&self, _condition: &ReadinessCondition, _attempt: u32, _status: &ConditionStatus) {}

    fn on_warning(&self, _condition: &ReadinessCondition, _message: &str) {}

    fn on_query_error(&self, _condition: &ReadinessCondition, _error: &str) {}

    fn on_resolved(
        &self,
        _condition: &ReadinessCondition,
        _outcome: &BarrierOutcome,
        _elapsed: Duration,
    ) {
    }
}

/// Logs barrier progress through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl BarrierObserver for TracingObserver {
    fn on_poll(&self, condition: &ReadinessCondition, attempt: u32, status: &ConditionStatus) {
        tracing::debug!(%condition, attempt, ?status, "polled condition");
    }

    fn on_warning(&self, condition: &ReadinessCondition, message: &str) {
        tracing::warn!(%condition, detail = message, "condition reported False, still waiting");
    }

    fn on_query_error(&self, condition: &ReadinessCondition, error: &str) {
        tracing::debug!(%condition, error, "condition not observable yet");
    }

    fn on_resolved(
        &self,
        condition: &ReadinessCondition,
        outcome: &BarrierOutcome,
        elapsed: Duration,
    ) {
        match outcome {
            BarrierOutcome::Ready => {
                tracing::info!(%condition, elapsed_secs = elapsed.as_secs(), "condition met")
            }
            BarrierOutcome::Failed(reason) => {
                tracing::error!(%condition, reason = %reason, "condition failed")
            }
            BarrierOutcome::TimedOut => tracing::error!(
                %condition,
                deadline_secs = condition.deadline.as_secs(),
                "timed out waiting for condition"
            ),
        }
    }
}

/// A barrier wired to its collaborators. Each wait is independent.
pub struct Barrier<'a> {
    query: &'a dyn ConditionQuery,
    diagnostics: &'a dyn Diagnostics,
    observer: &'a dyn BarrierObserver,
}

impl<'a> Barrier<'a> {
    pub fn new(
        query: &'a dyn ConditionQuery,
        diagnostics: &'a dyn Diagnostics,
        observer: &'a dyn BarrierObserver,
    ) -> Self {
        Self {
            query,
            diagnostics,
            observer,
        }
    }

    /// Polls `condition` until it is met, fails, or times out.
    ///
    /// Diagnostics are collected exactly once on any non-ready outcome.
    pub async fn wait(&self, condition: &ReadinessCondition) -> BarrierOutcome {
        let start = Instant::now();
        let mut attempt = 0u32;

        let outcome = loop {
            attempt += 1;

            let status = match self.query.query(condition).await {
                Ok(status) => status,
                Err(QueryError::Transient(error)) => {
                    self.observer.on_query_error(condition, &error);
                    ConditionStatus::Unknown
                }
                Err(QueryError::Fatal(reason)) => break BarrierOutcome::Failed(reason),
            };

            self.observer.on_poll(condition, attempt, &status);

            match &status {
                ConditionStatus::True => break BarrierOutcome::Ready,
                ConditionStatus::False(Some(message)) => {
                    self.observer.on_warning(condition, message)
                }
                ConditionStatus::False(None) | ConditionStatus::Unknown => {}
            }

            let elapsed = start.elapsed();
            if elapsed >= condition.deadline {
                break BarrierOutcome::TimedOut;
            }

            sleep(condition.interval.min(condition.deadline - elapsed)).await;
        };

        if outcome != BarrierOutcome::Ready {
            self.diagnostics.collect(condition).await;
        }

        self.observer.on_resolved(condition, &outcome, start.elapsed());
        outcome
    }
}

/// Evaluates a condition over `kubectl get -o json` output.
///
/// Accepts a single object or a list. Every item `True` gives `True`; any
/// item `False` gives `False` with that item's message; anything else,
/// including an empty list, is `Unknown`.
pub fn evaluate_conditions(document: &Value, condition_type: &str) -> ConditionStatus {
    let items: Vec<&Value> = match document.get("items").and_then(Value::as_array) {
        Some(items) => items.iter().collect(),
        None => vec![document],
    };

    if items.is_empty() {
        return ConditionStatus::Unknown;
    }

    let mut all_true = true;

    for item in items {
        let name = item
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or("<unnamed>");

        let condition = item
            .pointer("/status/conditions")
            .and_then(Value::as_array)
            .and_then(|conditions| {
                conditions
                    .iter()
                    .find(|c| c.get("type").and_then(Value::as_str) == Some(condition_type))
            });

        match condition.and_then(|c| c.get("status")).and_then(Value::as_str) {
            Some("True") => {}
            Some("False") => {
                let message = condition
                    .and_then(|c| {
                        c.get("message")
                            .or_else(|| c.get("reason"))
                            .and_then(Value::as_str)
                    })
                    .filter(|m| !m.is_empty())
                    .map(|m| format!("{}: {}", name, m));
                return ConditionStatus::False(message);
            }
            _ => all_true = false,
        }
    }

    if all_true {
        ConditionStatus::True
    } else {
        ConditionStatus::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Replays a fixed sequence of answers, then repeats `fallback`.
    struct ScriptedQuery {
        answers: Mutex<VecDeque<Result<ConditionStatus, QueryError>>>,
        fallback: ConditionStatus,
        calls: AtomicUsize,
    }

    impl ScriptedQuery {
        fn new(
            answers: Vec<Result<ConditionStatus, QueryError>>,
            fallback: ConditionStatus,
        ) -> Self {
            Self {
                answers: Mutex::new(answers.into()),
                fallback,
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ConditionQuery for ScriptedQuery {
        async fn query(&self, _: &ReadinessCondition) -> Result<ConditionStatus, QueryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answers
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(self.fallback.clone()))
        }
    }

    #[derive(Default)]
    struct CountingDiagnostics {
        dumps: AtomicUsize,
    }

    #[async_trait]
    impl Diagnostics for CountingDiagnostics {
        async fn collect(&self, _: &ReadinessCondition) {
            self.dumps.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        warnings: Mutex<Vec<String>>,
        query_errors: AtomicUsize,
    }

    impl BarrierObserver for RecordingObserver {
        fn on_warning(&self, _: &ReadinessCondition, message: &str) {
            self.warnings.lock().unwrap().push(message.to_string());
        }

        fn on_query_error(&self, _: &ReadinessCondition, _: &str) {
            self.query_errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn app_condition() -> ReadinessCondition {
        ReadinessCondition::new(
            Subject::Resource {
                kind: "keycloak".to_string(),
                name: "example-kc".to_string(),
                namespace: "keycloak".to_string(),
            },
            "Ready",
        )
        .with_interval(Duration::from_secs(10))
        .with_deadline(Duration::from_secs(600))
    }

    #[tokio::test(start_paused = true)]
    async fn resolves_immediately_when_first_poll_is_true() {
        let query = ScriptedQuery::new(vec![], ConditionStatus::True);
        let diagnostics = CountingDiagnostics::default();
        let barrier = Barrier::new(&query, &diagnostics, &TracingObserver);

        let start = Instant::now();
        let outcome = barrier.wait(&app_condition()).await;

        assert_eq!(outcome, BarrierOutcome::Ready);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(query.calls(), 1);
        assert_eq!(diagnostics.dumps.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn becomes_ready_after_two_false_polls() {
        let query = ScriptedQuery::new(
            vec![
                Ok(ConditionStatus::False(Some("example-kc: starting".into()))),
                Ok(ConditionStatus::False(None)),
            ],
            ConditionStatus::True,
        );
        let diagnostics = CountingDiagnostics::default();
        let observer = RecordingObserver::default();
        let barrier = Barrier::new(&query, &diagnostics, &observer);

        let start = Instant::now();
        let outcome = barrier.wait(&app_condition()).await;
        let elapsed = start.elapsed();

        assert_eq!(outcome, BarrierOutcome::Ready);
        assert!(elapsed >= Duration::from_secs(20) && elapsed <= Duration::from_secs(30));
        assert_eq!(query.calls(), 3);
        assert_eq!(
            *observer.warnings.lock().unwrap(),
            vec!["example-kc: starting".to_string()]
        );
        assert_eq!(diagnostics.dumps.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_and_dumps_diagnostics_once() {
        let query = ScriptedQuery::new(vec![], ConditionStatus::False(None));
        let diagnostics = CountingDiagnostics::default();
        let barrier = Barrier::new(&query, &diagnostics, &TracingObserver);

        let start = Instant::now();
        let condition = app_condition();
        let outcome = barrier.wait(&condition).await;

        assert_eq!(outcome, BarrierOutcome::TimedOut);
        assert_eq!(start.elapsed(), Duration::from_secs(600));
        // Polls at 0, 10, ..., 600.
        assert_eq!(query.calls(), 61);
        assert_eq!(diagnostics.dumps.load(Ordering::SeqCst), 1);

        let err = outcome.into_result(&condition).unwrap_err();
        assert!(matches!(err, Error::BarrierTimedOut { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn last_sleep_is_clamped_to_deadline() {
        let query = ScriptedQuery::new(vec![], ConditionStatus::Unknown);
        let diagnostics = CountingDiagnostics::default();
        let barrier = Barrier::new(&query, &diagnostics, &TracingObserver);

        let condition = app_condition().with_deadline(Duration::from_secs(25));
        let start = Instant::now();
        let outcome = barrier.wait(&condition).await;

        assert_eq!(outcome, BarrierOutcome::TimedOut);
        assert_eq!(start.elapsed(), Duration::from_secs(25));
        assert_eq!(query.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_query_errors_are_retried() {
        let query = ScriptedQuery::new(
            vec![
                Err(QueryError::Transient("NotFound".into())),
                Err(QueryError::Transient("NotFound".into())),
            ],
            ConditionStatus::True,
        );
        let diagnostics = CountingDiagnostics::default();
        let observer = RecordingObserver::default();
        let barrier = Barrier::new(&query, &diagnostics, &observer);

        let outcome = barrier.wait(&app_condition()).await;

        assert_eq!(outcome, BarrierOutcome::Ready);
        assert_eq!(observer.query_errors.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_query_error_fails_without_waiting() {
        let query = ScriptedQuery::new(
            vec![Err(QueryError::Fatal("kubectl missing".into()))],
            ConditionStatus::True,
        );
        let diagnostics = CountingDiagnostics::default();
        let barrier = Barrier::new(&query, &diagnostics, &TracingObserver);

        let start = Instant::now();
        let outcome = barrier.wait(&app_condition()).await;

        assert_eq!(outcome, BarrierOutcome::Failed("kubectl missing".into()));
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(diagnostics.dumps.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn flapping_condition_accepts_first_true() {
        let query = ScriptedQuery::new(
            vec![
                Ok(ConditionStatus::False(None)),
                Ok(ConditionStatus::True),
                Ok(ConditionStatus::False(None)),
            ],
            ConditionStatus::False(None),
        );
        let diagnostics = CountingDiagnostics::default();
        let barrier = Barrier::new(&query, &diagnostics, &TracingObserver);

        let outcome = barrier.wait(&app_condition()).await;

        assert_eq!(outcome, BarrierOutcome::Ready);
        assert_eq!(query.calls(), 2);
    }

    #[test]
    fn subject_kubectl_args() {
        assert_eq!(Subject::Nodes.kubectl_args(), vec!["nodes"]);
        assert_eq!(
            app_condition().subject.kubectl_args(),
            vec!["keycloak/example-kc", "-n", "keycloak"]
        );
        let selector = Subject::Selector {
            kind: "pod".into(),
            selector: "app=postgresql-db".into(),
            namespace: "keycloak".into(),
        };
        assert_eq!(
            selector.kubectl_args(),
            vec!["pod", "-l", "app=postgresql-db", "-n", "keycloak"]
        );
        assert_eq!(selector.to_string(), "pod -l app=postgresql-db");
    }

    #[test]
    fn evaluates_single_resource() {
        let doc = json!({
            "metadata": {"name": "example-kc"},
            "status": {"conditions": [
                {"type": "HasErrors", "status": "False"},
                {"type": "Ready", "status": "True"}
            ]}
        });
        assert_eq!(evaluate_conditions(&doc, "Ready"), ConditionStatus::True);
    }

    #[test]
    fn evaluates_false_with_message() {
        let doc = json!({
            "metadata": {"name": "example-kc"},
            "status": {"conditions": [
                {"type": "Ready", "status": "False", "message": "Waiting for more replicas"}
            ]}
        });
        assert_eq!(
            evaluate_conditions(&doc, "Ready"),
            ConditionStatus::False(Some("example-kc: Waiting for more replicas".into()))
        );
    }

    #[test]
    fn evaluates_false_falls_back_to_reason() {
        let doc = json!({
            "metadata": {"name": "op"},
            "status": {"conditions": [
                {"type": "Available", "status": "False", "reason": "MinimumReplicasUnavailable"}
            ]}
        });
        assert_eq!(
            evaluate_conditions(&doc, "Available"),
            ConditionStatus::False(Some("op: MinimumReplicasUnavailable".into()))
        );
    }

    #[test]
    fn evaluates_missing_condition_as_unknown() {
        let doc = json!({"metadata": {"name": "example-kc"}, "status": {}});
        assert_eq!(evaluate_conditions(&doc, "Ready"), ConditionStatus::Unknown);
    }

    #[test]
    fn evaluates_lists_requiring_all_true() {
        let ready = |name: &str| {
            json!({"metadata": {"name": name},
                   "status": {"conditions": [{"type": "Ready", "status": "True"}]}})
        };
        let pending = json!({"metadata": {"name": "node-b"}, "status": {"conditions": []}});

        let all_ready = json!({"kind": "List", "items": [ready("node-a"), ready("node-b")]});
        assert_eq!(evaluate_conditions(&all_ready, "Ready"), ConditionStatus::True);

        let partial = json!({"kind": "List", "items": [ready("node-a"), pending]});
        assert_eq!(evaluate_conditions(&partial, "Ready"), ConditionStatus::Unknown);
    }

    #[test]
    fn evaluates_empty_list_as_unknown() {
        let doc = json!({"kind": "List", "items": []});
        assert_eq!(evaluate_conditions(&doc, "Ready"), ConditionStatus::Unknown);
    }
}
