//! Every run outcome deletes the cluster exactly once.
//!
//! The collaborators are in-process fakes, so these tests need no cluster.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use deploy_verifier::{
    ClusterProvider, CommandOutput, CommandRunner, EndpointReport, EndpointVerifier, Error,
    HealthVerdict, Invocation, Orchestrator, Result, RunConfig, RunOutcome, Stage, ToolLocator,
    Tunnel,
};

#[derive(Default)]
struct Provider {
    creates: AtomicUsize,
    deletes: AtomicUsize,
}

#[async_trait]
impl ClusterProvider for Provider {
    async fn create(&self, _name: &str) -> Result<()> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn delete(&self, _name: &str) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Err(Error::Io(std::io::Error::other("kind: cluster not found")))
    }
}

/// Fails the first command line containing `poison`; everything else is a
/// healthy cluster.
struct Cluster {
    poison: Option<&'static str>,
}

#[async_trait]
impl CommandRunner for Cluster {
    async fn run(&self, inv: &Invocation) -> Result<CommandOutput> {
        if let Some(poison) = self.poison {
            if inv.to_string().contains(poison) {
                return Ok(CommandOutput::failed(1, format!("{} failed", poison)));
            }
        }
        if inv.program == "openssl" {
            for flag in ["-keyout", "-out"] {
                if let Some(pos) = inv.args.iter().position(|a| a == flag) {
                    std::fs::write(&inv.args[pos + 1], "PEM")?;
                }
            }
            return Ok(CommandOutput::ok(""));
        }
        if inv.has_arg("secret/example-kc-initial-admin") {
            return Ok(CommandOutput::ok(
                r#"{"data":{"username":"YWRtaW4=","password":"cGFzcw=="}}"#,
            ));
        }
        if inv.has_arg("json") {
            return Ok(CommandOutput::ok(
                r#"{"status":{"conditions":[{"type":"Ready","status":"True"},{"type":"Available","status":"True"}]}}"#,
            ));
        }
        Ok(CommandOutput::ok("kind: Object\n"))
    }
}

struct Verifier {
    unreachable: bool,
}

#[async_trait]
impl EndpointVerifier for Verifier {
    async fn verify(&self, _slot: &mut Option<Tunnel>) -> Result<EndpointReport> {
        if self.unreachable {
            return Err(Error::Unreachable {
                url: "https://localhost:8443/".into(),
                reason: "connection reset".into(),
            });
        }
        Ok(EndpointReport {
            status: 200,
            health: HealthVerdict::Unavailable("timed out".into()),
        })
    }
}

fn workspace() -> (TempDir, RunConfig, PathBuf) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let bin = dir.path().join("bin");
    std::fs::create_dir(&bin).expect("failed to create bin dir");
    for tool in ["kind", "kubectl", "openssl"] {
        let path = bin.join(tool);
        std::fs::write(&path, "#!/bin/sh\n").expect("failed to write tool");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                .expect("failed to chmod tool");
        }
    }

    let mut config = RunConfig::default();
    let manifest = |name: &str| {
        let path = dir.path().join(name);
        std::fs::write(&path, "kind: List\n").expect("failed to write manifest");
        path
    };
    config.manifests.crds = vec![
        manifest("keycloaks.k8s.keycloak.org-v1.yml"),
        manifest("keycloakrealmimports.k8s.keycloak.org-v1.yml"),
    ];
    config.manifests.operator = manifest("kubernetes.yml");
    config.manifests.application = manifest("keycloak.yml");

    (dir, config, bin)
}

async fn run(poison: Option<&'static str>, unreachable: bool) -> (RunOutcome, Arc<Provider>) {
    let (_dir, config, bin) = workspace();
    let provider = Arc::new(Provider::default());

    let result = Orchestrator::from_parts(
        config,
        Arc::new(Cluster { poison }),
        provider.clone(),
        Arc::new(Verifier { unreachable }),
    )
    .with_locator(ToolLocator::with_search_path(&bin))
    .run()
    .await;

    (result.report.outcome, provider)
}

fn failed_stage(outcome: &RunOutcome) -> Option<Stage> {
    match outcome {
        RunOutcome::Failed { stage, .. } => Some(*stage),
        _ => None,
    }
}

#[tokio::test]
async fn success_with_unavailable_health_deletes_once() {
    let (outcome, provider) = run(None, false).await;

    assert_eq!(outcome, RunOutcome::Succeeded);
    assert_eq!(provider.creates.load(Ordering::SeqCst), 1);
    assert_eq!(provider.deletes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn each_failing_stage_deletes_once() {
    let cases = [
        ("apply -f", Stage::Dependencies),
        ("create namespace", Stage::Dependencies),
        ("openssl", Stage::Certificates),
        ("create secret tls", Stage::Certificates),
        ("secret/example-kc-initial-admin", Stage::Credentials),
    ];

    for (poison, stage) in cases {
        let (outcome, provider) = run(Some(poison), false).await;

        assert_eq!(failed_stage(&outcome), Some(stage), "poison: {}", poison);
        assert_eq!(outcome.exit_code(), 1);
        assert_eq!(
            provider.deletes.load(Ordering::SeqCst),
            1,
            "poison: {}",
            poison
        );
    }
}

#[tokio::test]
async fn unreachable_endpoint_deletes_once() {
    let (outcome, provider) = run(None, true).await;

    assert_eq!(failed_stage(&outcome), Some(Stage::Verification));
    assert_eq!(provider.deletes.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn interrupted_run_deletes_once() {
    let (_dir, config, bin) = workspace();
    let provider = Arc::new(Provider::default());
    let orchestrator = Orchestrator::from_parts(
        config,
        // Nodes are never observable, so the run parks in the first barrier.
        Arc::new(Cluster { poison: Some("get nodes") }),
        provider.clone(),
        Arc::new(Verifier { unreachable: false }),
    )
    .with_locator(ToolLocator::with_search_path(&bin));

    let result = orchestrator
        .run_until(tokio::time::sleep(Duration::from_secs(90)))
        .await;

    assert_eq!(
        result.report.outcome,
        RunOutcome::Interrupted {
            stage: Some(Stage::NodesReady)
        }
    );
    assert_eq!(result.report.exit_code(), 130);
    assert!(result.credentials.is_none());
    assert_eq!(provider.deletes.load(Ordering::SeqCst), 1);
}
