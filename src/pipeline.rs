//! The verification pipeline.
//!
//! [`Orchestrator::run_until`] runs the stages in order, stops at the first
//! fatal error, and always finishes with teardown. The cluster guard is
//! armed after the prerequisite check, so a missing tool never leads to a
//! creation or deletion call.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

use crate::certs::{inject_tls_secret, CertificateIssuer};
use crate::cluster::{ClusterGuard, ClusterProvider, KindProvider};
use crate::config::{BarrierTarget, RunConfig};
use crate::credentials::{fetch_admin_credentials, Credentials};
use crate::diagnostics::{ClusterDiagnostics, DumpDepth};
use crate::error::{Error, Result};
use crate::exec::{CommandRunner, SystemRunner};
use crate::kubectl::Kubectl;
use crate::prerequisites::ToolLocator;
use crate::probe::{EndpointVerifier, HealthVerdict, TunnelVerifier};
use crate::readiness::{Barrier, BarrierObserver, ReadinessCondition, Subject, TracingObserver};
use crate::tunnel::Tunnel;

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Prerequisites,
    Provisioning,
    NodesReady,
    Dependencies,
    OperatorReady,
    Certificates,
    Application,
    DatabaseReady,
    ApplicationReady,
    Credentials,
    Tunnel,
    Verification,
    Teardown,
}

impl Stage {
    pub const ALL: [Stage; 13] = [
        Stage::Prerequisites,
        Stage::Provisioning,
        Stage::NodesReady,
        Stage::Dependencies,
        Stage::OperatorReady,
        Stage::Certificates,
        Stage::Application,
        Stage::DatabaseReady,
        Stage::ApplicationReady,
        Stage::Credentials,
        Stage::Tunnel,
        Stage::Verification,
        Stage::Teardown,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Prerequisites => "prerequisites",
            Stage::Provisioning => "provisioning",
            Stage::NodesReady => "nodes_ready",
            Stage::Dependencies => "dependencies",
            Stage::OperatorReady => "operator_ready",
            Stage::Certificates => "certificates",
            Stage::Application => "application",
            Stage::DatabaseReady => "database_ready",
            Stage::ApplicationReady => "application_ready",
            Stage::Credentials => "credentials",
            Stage::Tunnel => "tunnel",
            Stage::Verification => "verification",
            Stage::Teardown => "teardown",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-stage result flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pass,
    Fail,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub status: StepStatus,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Failed { stage: Stage, reason: String },
    Interrupted { stage: Option<Stage> },
}

impl RunOutcome {
    /// Process exit code for this outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Succeeded => 0,
            RunOutcome::Failed { .. } => 1,
            RunOutcome::Interrupted { .. } => 130,
        }
    }
}

/// Serializable summary of a run. Never contains the admin password.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub cluster: String,
    pub namespace: String,
    pub started_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub stages: Vec<StageRecord>,
    pub outcome: RunOutcome,
    pub health: Option<HealthVerdict>,
    pub username: Option<String>,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }

    pub fn status(&self, stage: Stage) -> StepStatus {
        self.stages
            .iter()
            .find(|r| r.stage == stage)
            .map(|r| r.status)
            .unwrap_or_default()
    }

    /// Writes the report as pretty JSON.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Mutable state of one run.
pub struct TestRun {
    pub id: Uuid,
    pub cluster: String,
    pub namespace: String,
    /// Worst-case time spent in readiness barriers.
    pub budget: Duration,
    /// Background port-forward, if one is open.
    pub tunnel: Option<Tunnel>,
    started_at: DateTime<Utc>,
    started: Instant,
    current: Option<Stage>,
    steps: BTreeMap<Stage, StepStatus>,
    health: Option<HealthVerdict>,
    credentials: Option<Credentials>,
}

impl TestRun {
    pub fn new(config: &RunConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            cluster: config.cluster_name.clone(),
            namespace: config.namespace.clone(),
            budget: config.timeouts.budget(),
            tunnel: None,
            started_at: Utc::now(),
            started: Instant::now(),
            current: None,
            steps: BTreeMap::new(),
            health: None,
            credentials: None,
        }
    }

    pub fn current_stage(&self) -> Option<Stage> {
        self.current
    }

    pub fn status(&self, stage: Stage) -> StepStatus {
        self.steps.get(&stage).copied().unwrap_or_default()
    }

    fn begin(&mut self, stage: Stage) {
        self.current = Some(stage);
        tracing::info!(run_id = %self.id, stage = %stage, "stage started");
    }

    fn record(&mut self, stage: Stage, status: StepStatus) {
        self.steps.insert(stage, status);
    }

    /// Records the stage result and passes it through.
    fn finish<T>(&mut self, stage: Stage, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.record(stage, StepStatus::Pass),
            Err(e) => {
                tracing::error!(run_id = %self.id, stage = %stage, error = %e, "stage failed");
                self.record(stage, StepStatus::Fail);
            }
        }
        result
    }

    /// Stops the tunnel if one is open. Safe to call repeatedly.
    pub async fn stop_tunnel(&mut self) {
        if let Some(tunnel) = self.tunnel.as_mut() {
            tunnel.stop().await;
        }
    }

    fn report(&self, outcome: RunOutcome) -> RunReport {
        RunReport {
            run_id: self.id,
            cluster: self.cluster.clone(),
            namespace: self.namespace.clone(),
            started_at: self.started_at,
            duration_secs: self.started.elapsed().as_secs_f64(),
            stages: Stage::ALL
                .iter()
                .map(|&stage| StageRecord {
                    stage,
                    status: self.status(stage),
                })
                .collect(),
            outcome,
            health: self.health.clone(),
            username: self.credentials.as_ref().map(|c| c.username.clone()),
        }
    }
}

/// Report plus the secret material that must not be serialized.
#[derive(Debug)]
pub struct RunResult {
    pub report: RunReport,
    pub credentials: Option<Credentials>,
}

/// Sequences the pipeline against its collaborators.
pub struct Orchestrator {
    config: RunConfig,
    runner: Arc<dyn CommandRunner>,
    provider: Arc<dyn ClusterProvider>,
    verifier: Arc<dyn EndpointVerifier>,
    locator: ToolLocator,
    observer: Arc<dyn BarrierObserver>,
}

impl Orchestrator {
    /// Wires the real tools named in `config`.
    pub fn new(config: RunConfig) -> Result<Self> {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
        let provider = Arc::new(KindProvider::new(runner.clone(), &config.tools.kind));
        let verifier = Arc::new(TunnelVerifier::new(
            Kubectl::new(runner.clone(), &config.tools.kubectl),
            &config.resources.service,
            &config.namespace,
            config.endpoint.clone(),
            Duration::from_secs(config.timeouts.tunnel),
        )?);

        Ok(Self::from_parts(config, runner, provider, verifier))
    }

    pub fn from_parts(
        config: RunConfig,
        runner: Arc<dyn CommandRunner>,
        provider: Arc<dyn ClusterProvider>,
        verifier: Arc<dyn EndpointVerifier>,
    ) -> Self {
        Self {
            config,
            runner,
            provider,
            verifier,
            locator: ToolLocator::from_env(),
            observer: Arc::new(TracingObserver),
        }
    }

    pub fn with_locator(mut self, locator: ToolLocator) -> Self {
        self.locator = locator;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn BarrierObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Runs to completion.
    pub async fn run(&self) -> RunResult {
        self.run_until(std::future::pending()).await
    }

    /// Runs until completion or until `shutdown` resolves.
    ///
    /// On shutdown the current stage is abandoned and the cluster deleted
    /// without the grace delay.
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) -> RunResult {
        tokio::pin!(shutdown);

        let mut run = TestRun::new(&self.config);
        tracing::info!(
            run_id = %run.id,
            cluster = %run.cluster,
            namespace = %run.namespace,
            budget_secs = run.budget.as_secs(),
            "starting verification run"
        );

        run.begin(Stage::Prerequisites);
        let checked = self.locator.check(self.config.tools.required());
        if let Err(e) = run.finish(Stage::Prerequisites, checked) {
            let outcome = RunOutcome::Failed {
                stage: Stage::Prerequisites,
                reason: e.to_string(),
            };
            return self.conclude(run, outcome);
        }

        let mut guard = ClusterGuard::arm(
            self.provider.clone(),
            &self.config.cluster_name,
            self.config.cleanup.keep_cluster,
        );

        let result = tokio::select! {
            result = self.stages(&mut run, &guard) => Some(result),
            _ = &mut shutdown => None,
        };

        let interrupted = result.is_none();
        let outcome = match result {
            Some(Ok(())) => RunOutcome::Succeeded,
            Some(Err(e)) => RunOutcome::Failed {
                stage: run.current_stage().unwrap_or(Stage::Prerequisites),
                reason: e.to_string(),
            },
            None => {
                tracing::warn!(run_id = %run.id, stage = ?run.current_stage(), "run interrupted");
                RunOutcome::Interrupted {
                    stage: run.current_stage(),
                }
            }
        };

        run.stop_tunnel().await;

        run.begin(Stage::Teardown);
        let grace = if interrupted {
            None
        } else {
            self.config.keep_for()
        };
        tokio::select! {
            _ = guard.release(grace) => {}
            _ = &mut shutdown, if !interrupted => {
                tracing::warn!(cluster = %run.cluster, "interrupted during grace period");
            }
        }
        // No-op unless the grace period was cut short.
        guard.release(None).await;
        run.record(Stage::Teardown, StepStatus::Pass);

        self.conclude(run, outcome)
    }

    fn conclude(&self, mut run: TestRun, outcome: RunOutcome) -> RunResult {
        let report = run.report(outcome);
        match &report.outcome {
            RunOutcome::Succeeded => tracing::info!(
                run_id = %report.run_id,
                duration_secs = report.duration_secs,
                "verification succeeded"
            ),
            RunOutcome::Failed { stage, reason } => tracing::error!(
                run_id = %report.run_id,
                stage = %stage,
                reason = %reason,
                "verification failed"
            ),
            RunOutcome::Interrupted { .. } => {
                tracing::warn!(run_id = %report.run_id, "verification interrupted")
            }
        }

        RunResult {
            report,
            credentials: run.credentials.take(),
        }
    }

    fn condition(&self, target: &BarrierTarget, deadline_secs: u64) -> Result<ReadinessCondition> {
        Ok(self.timed(
            ReadinessCondition::new(target.subject(&self.config.namespace)?, &target.condition),
            deadline_secs,
        ))
    }

    fn timed(&self, condition: ReadinessCondition, deadline_secs: u64) -> ReadinessCondition {
        condition
            .with_interval(self.config.timeouts.poll_interval())
            .with_deadline(Duration::from_secs(deadline_secs))
    }

    async fn barrier(
        &self,
        kubectl: &Kubectl,
        condition: Result<ReadinessCondition>,
        depth: DumpDepth,
        logs: Option<&str>,
    ) -> Result<()> {
        let condition = condition?;
        let diagnostics = ClusterDiagnostics::new(kubectl.clone(), depth).with_log_selector(logs);
        tracing::info!(
            %condition,
            deadline_secs = condition.deadline.as_secs(),
            "waiting for condition"
        );

        Barrier::new(kubectl, &diagnostics, self.observer.as_ref())
            .wait(&condition)
            .await
            .into_result(&condition)
    }

    async fn install_dependencies(&self, kubectl: &Kubectl) -> Result<()> {
        for crd in &self.config.manifests.crds {
            kubectl.apply_file(crd, None).await?;
        }
        kubectl.ensure_namespace(&self.config.namespace).await?;
        kubectl
            .apply_file(&self.config.manifests.operator, Some(&self.config.namespace))
            .await
    }

    async fn install_certificate(&self, kubectl: &Kubectl) -> Result<()> {
        let issuer = CertificateIssuer::new(
            self.runner.clone(),
            &self.config.tools.openssl,
            self.config.certificate.clone(),
        );
        let material = issuer.generate().await?;
        inject_tls_secret(
            kubectl,
            &material,
            &self.config.resources.tls_secret,
            &self.config.namespace,
        )
        .await
    }

    async fn stages(&self, run: &mut TestRun, guard: &ClusterGuard) -> Result<()> {
        let config = &self.config;
        let timeouts = &config.timeouts;
        let resources = &config.resources;
        let kubectl = Kubectl::new(self.runner.clone(), &config.tools.kubectl);

        run.begin(Stage::Provisioning);
        let result = guard.provision().await;
        run.finish(Stage::Provisioning, result)?;

        run.begin(Stage::NodesReady);
        let nodes = self.timed(ReadinessCondition::new(Subject::Nodes, "Ready"), timeouts.nodes);
        let result = self.barrier(&kubectl, Ok(nodes), DumpDepth::Basic, None).await;
        run.finish(Stage::NodesReady, result)?;

        run.begin(Stage::Dependencies);
        let result = self.install_dependencies(&kubectl).await;
        run.finish(Stage::Dependencies, result)?;

        run.begin(Stage::OperatorReady);
        let operator = self.condition(&resources.operator, timeouts.operator);
        let result = self
            .barrier(
                &kubectl,
                operator,
                DumpDepth::Basic,
                resources.operator.logs.as_deref(),
            )
            .await;
        run.finish(Stage::OperatorReady, result)?;

        run.begin(Stage::Certificates);
        let result = self.install_certificate(&kubectl).await;
        run.finish(Stage::Certificates, result)?;

        run.begin(Stage::Application);
        let result = kubectl
            .apply_file(&config.manifests.application, Some(&config.namespace))
            .await;
        run.finish(Stage::Application, result)?;

        run.begin(Stage::DatabaseReady);
        let database = self.condition(&resources.database, timeouts.database);
        let result = self
            .barrier(
                &kubectl,
                database,
                DumpDepth::Full,
                resources.database.logs.as_deref(),
            )
            .await;
        run.finish(Stage::DatabaseReady, result)?;

        run.begin(Stage::ApplicationReady);
        let application = self.condition(&resources.application, timeouts.application);
        let result = self
            .barrier(
                &kubectl,
                application,
                DumpDepth::Full,
                resources.application.logs.as_deref(),
            )
            .await;
        run.finish(Stage::ApplicationReady, result)?;

        run.begin(Stage::Credentials);
        let result =
            fetch_admin_credentials(&kubectl, &resources.admin_secret, &config.namespace).await;
        run.credentials = Some(run.finish(Stage::Credentials, result)?);

        run.begin(Stage::Tunnel);
        match self.verifier.verify(&mut run.tunnel).await {
            Ok(report) => {
                run.record(Stage::Tunnel, StepStatus::Pass);
                run.begin(Stage::Verification);
                if !report.health.is_up() {
                    tracing::warn!(
                        health = ?report.health,
                        "health check did not pass; continuing"
                    );
                }
                run.health = Some(report.health);
                run.record(Stage::Verification, StepStatus::Pass);
                Ok(())
            }
            Err(e @ (Error::Tunnel(_) | Error::Spawn { .. })) => run.finish(Stage::Tunnel, Err(e)),
            Err(e) => {
                run.record(Stage::Tunnel, StepStatus::Pass);
                run.begin(Stage::Verification);
                run.finish(Stage::Verification, Err(e))
            }
        }
    }
}
