//! Run configuration and validation.
//!
//! A [`RunConfig`] is loaded once at startup (from a TOML or YAML file, or
//! from defaults), adjusted by CLI overrides, validated, and then passed by
//! reference to every pipeline stage. Nothing mutates it after that.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::readiness::Subject;

/// External tool binaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Cluster lifecycle tool.
    pub kind: String,
    /// Kubernetes API client.
    pub kubectl: String,
    /// Certificate generator.
    pub openssl: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            kind: "kind".to_string(),
            kubectl: "kubectl".to_string(),
            openssl: "openssl".to_string(),
        }
    }
}

impl ToolsConfig {
    /// Returns every binary that must be present on PATH.
    pub fn required(&self) -> Vec<&str> {
        vec![
            self.kind.as_str(),
            self.kubectl.as_str(),
            self.openssl.as_str(),
        ]
    }
}

/// Manifest documents applied verbatim to the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestsConfig {
    /// Custom resource definitions, applied cluster-wide before the operator.
    pub crds: Vec<PathBuf>,
    /// Operator deployment document.
    pub operator: PathBuf,
    /// Application deployment document (database + application CR).
    pub application: PathBuf,
}

impl Default for ManifestsConfig {
    fn default() -> Self {
        Self {
            crds: vec![
                PathBuf::from("manifests/keycloaks.k8s.keycloak.org-v1.yml"),
                PathBuf::from("manifests/keycloakrealmimports.k8s.keycloak.org-v1.yml"),
            ],
            operator: PathBuf::from("manifests/operator.yml"),
            application: PathBuf::from("manifests/keycloak.yml"),
        }
    }
}

impl ManifestsConfig {
    /// Returns all manifest paths in application order.
    pub fn all(&self) -> impl Iterator<Item = &PathBuf> {
        self.crds
            .iter()
            .chain(std::iter::once(&self.operator))
            .chain(std::iter::once(&self.application))
    }
}

/// A resource whose condition gates a readiness barrier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrierTarget {
    /// `kind/name` for a single resource, or a bare `kind` with a selector.
    pub resource: String,
    /// Label selector, used when `resource` is a bare kind.
    #[serde(default)]
    pub selector: Option<String>,
    /// Condition type that must report `True`.
    pub condition: String,
    /// Pod label selector whose logs go into the failure dump. Needed when
    /// `resource` is a custom kind `kubectl logs` cannot resolve to pods.
    #[serde(default)]
    pub logs: Option<String>,
}

impl BarrierTarget {
    fn new(resource: &str, selector: Option<&str>, condition: &str) -> Self {
        Self {
            resource: resource.to_string(),
            selector: selector.map(str::to_string),
            condition: condition.to_string(),
            logs: None,
        }
    }

    fn with_logs(mut self, selector: &str) -> Self {
        self.logs = Some(selector.to_string());
        self
    }

    /// Resolves the target into a namespaced subject.
    pub fn subject(&self, namespace: &str) -> Result<Subject> {
        match (self.resource.split_once('/'), &self.selector) {
            (Some((kind, name)), None) if !kind.is_empty() && !name.is_empty() => {
                Ok(Subject::Resource {
                    kind: kind.to_string(),
                    name: name.to_string(),
                    namespace: namespace.to_string(),
                })
            }
            (None, Some(selector)) if !self.resource.is_empty() => Ok(Subject::Selector {
                kind: self.resource.clone(),
                selector: selector.clone(),
                namespace: namespace.to_string(),
            }),
            _ => Err(Error::Config(format!(
                "barrier target '{}' must be 'kind/name' or a kind with a selector",
                self.resource
            ))),
        }
    }
}

/// Names of resources the pipeline observes or creates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcesConfig {
    /// Operator readiness gate.
    pub operator: BarrierTarget,
    /// Database readiness gate.
    pub database: BarrierTarget,
    /// Application readiness gate.
    pub application: BarrierTarget,
    /// TLS secret created from the generated certificate.
    pub tls_secret: String,
    /// Secret holding the generated admin credentials.
    pub admin_secret: String,
    /// Service the tunnel forwards to.
    pub service: String,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            operator: BarrierTarget::new("deployment/keycloak-operator", None, "Available"),
            database: BarrierTarget::new("pod", Some("app=postgresql-db"), "Ready"),
            application: BarrierTarget::new("keycloak/example-kc", None, "Ready")
                .with_logs("app.kubernetes.io/instance=example-kc"),
            tls_secret: "example-tls-secret".to_string(),
            admin_secret: "example-kc-initial-admin".to_string(),
            service: "example-kc-service".to_string(),
        }
    }
}

/// Poll interval and per-barrier deadlines, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub poll_interval: u64,
    pub nodes: u64,
    pub operator: u64,
    pub database: u64,
    pub application: u64,
    /// Bound on the tunnel connect-retry loop.
    pub tunnel: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            poll_interval: 10,
            nodes: 300,
            operator: 300,
            database: 300,
            application: 600,
            tunnel: 30,
        }
    }
}

impl TimeoutsConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    /// Sum of all barrier deadlines; the worst-case time spent waiting.
    pub fn budget(&self) -> Duration {
        let total = [self.nodes, self.operator, self.database, self.application]
            .into_iter()
            .fold(0u64, u64::saturating_add);
        Duration::from_secs(total)
    }
}

/// Tunnel ports and probe expectations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub local_port: u16,
    pub remote_port: u16,
    /// Path of the readiness probe.
    pub readiness_path: String,
    /// Expected value of the `status` field in the readiness body.
    pub health_marker: String,
    /// Per-request timeout in seconds.
    pub request_timeout: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            local_port: 8443,
            remote_port: 8443,
            readiness_path: "/health/ready".to_string(),
            health_marker: "UP".to_string(),
            request_timeout: 10,
        }
    }
}

impl EndpointConfig {
    /// Base URL of the forwarded service.
    pub fn base_url(&self) -> String {
        format!("https://localhost:{}", self.local_port)
    }
}

/// Self-signed certificate parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CertificateConfig {
    pub common_name: String,
    pub organization: String,
    pub days: u32,
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            common_name: "example-kc".to_string(),
            organization: "Test".to_string(),
            days: 365,
        }
    }
}

/// Teardown behaviour.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Grace window in seconds before the cluster is deleted.
    pub keep_for: u64,
    /// Never delete the cluster.
    pub keep_cluster: bool,
}

/// Immutable configuration for one verification run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Cluster name; the run owns this cluster exclusively.
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,

    /// Namespace the operator and application are installed into.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default)]
    pub tools: ToolsConfig,

    #[serde(default)]
    pub manifests: ManifestsConfig,

    #[serde(default)]
    pub resources: ResourcesConfig,

    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    #[serde(default)]
    pub endpoint: EndpointConfig,

    #[serde(default)]
    pub certificate: CertificateConfig,

    #[serde(default)]
    pub cleanup: CleanupConfig,
}

fn default_cluster_name() -> String {
    "keycloak-e2e".to_string()
}

fn default_namespace() -> String {
    "keycloak".to_string()
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            cluster_name: default_cluster_name(),
            namespace: default_namespace(),
            tools: ToolsConfig::default(),
            manifests: ManifestsConfig::default(),
            resources: ResourcesConfig::default(),
            timeouts: TimeoutsConfig::default(),
            endpoint: EndpointConfig::default(),
            certificate: CertificateConfig::default(),
            cleanup: CleanupConfig::default(),
        }
    }
}

impl RunConfig {
    /// Loads a configuration file. `.yaml`/`.yml` files are parsed as YAML,
    /// anything else as TOML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;

        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );

        if is_yaml {
            serde_yaml::from_str(&content).map_err(|e| {
                Error::Config(format!("failed to parse {}: {}", path.display(), e))
            })
        } else {
            toml::from_str(&content).map_err(|e| {
                Error::Config(format!("failed to parse {}: {}", path.display(), e))
            })
        }
    }

    /// Sets the cluster name.
    pub fn with_cluster_name(mut self, name: impl Into<String>) -> Self {
        self.cluster_name = name.into();
        self
    }

    /// Sets the target namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Sets the grace window before cluster deletion.
    pub fn with_keep_for(mut self, keep_for: Duration) -> Self {
        self.cleanup.keep_for = keep_for.as_secs();
        self
    }

    /// Keeps the cluster after the run.
    pub fn with_keep_cluster(mut self, keep: bool) -> Self {
        self.cleanup.keep_cluster = keep;
        self
    }

    /// Grace window before cluster deletion, if any.
    pub fn keep_for(&self) -> Option<Duration> {
        (self.cleanup.keep_for > 0).then(|| Duration::from_secs(self.cleanup.keep_for))
    }
}

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// Fatal problems.
    pub errors: Vec<String>,
    /// Non-fatal problems.
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Merges another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

fn is_dns_label(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 63
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !value.starts_with('-')
        && !value.ends_with('-')
}

impl Validate for ManifestsConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.crds.is_empty() {
            result.add_warning("no CRD manifests configured; the operator may not start");
        }

        for path in self.all() {
            if !path.exists() {
                result.add_error(format!("manifest not found: {}", path.display()));
            }
        }

        result
    }
}

impl Validate for TimeoutsConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.poll_interval == 0 {
            result.add_error("timeouts.poll_interval must be at least 1 second");
        }

        for (name, deadline) in [
            ("nodes", self.nodes),
            ("operator", self.operator),
            ("database", self.database),
            ("application", self.application),
        ] {
            if deadline == 0 {
                result.add_error(format!("timeouts.{} must be greater than zero", name));
            } else if deadline < self.poll_interval {
                result.add_warning(format!(
                    "timeouts.{} ({}s) is shorter than the poll interval ({}s); only one poll will run",
                    name, deadline, self.poll_interval
                ));
            }
        }

        if self.tunnel == 0 {
            result.add_error("timeouts.tunnel must be greater than zero");
        }

        result
    }
}

impl Validate for EndpointConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.local_port == 0 || self.remote_port == 0 {
            result.add_error("endpoint ports must be non-zero");
        }

        if !self.readiness_path.starts_with('/') {
            result.add_error(format!(
                "endpoint.readiness_path '{}' must start with '/'",
                self.readiness_path
            ));
        }

        if self.health_marker.trim().is_empty() {
            result.add_warning("endpoint.health_marker is empty; health checks will always warn");
        }

        if self.request_timeout == 0 {
            result.add_error("endpoint.request_timeout must be greater than zero");
        }

        result
    }
}

impl Validate for RunConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if !is_dns_label(&self.cluster_name) {
            result.add_error(format!(
                "cluster_name '{}' must be a lowercase DNS label",
                self.cluster_name
            ));
        }

        if !is_dns_label(&self.namespace) {
            result.add_error(format!(
                "namespace '{}' must be a lowercase DNS label",
                self.namespace
            ));
        }

        for (name, target) in [
            ("operator", &self.resources.operator),
            ("database", &self.resources.database),
            ("application", &self.resources.application),
        ] {
            if let Err(e) = target.subject(&self.namespace) {
                result.add_error(format!("resources.{}: {}", name, e));
            }
            if target.logs.as_deref().is_some_and(|s| s.trim().is_empty()) {
                result.add_error(format!("resources.{}.logs must not be empty", name));
            }
        }

        if self.certificate.days == 0 {
            result.add_error("certificate.days must be greater than zero");
        }

        if self.cleanup.keep_cluster && self.cleanup.keep_for > 0 {
            result.add_warning("cleanup.keep_for is ignored when keep_cluster is set");
        }

        result.merge(self.manifests.validate());
        result.merge(self.timeouts.validate());
        result.merge(self.endpoint.validate());
        result
    }
}
