//! Deploy Verifier - end-to-end verification of an operator-managed application
//!
//! This library provisions an ephemeral kind cluster, installs an operator and the
//! application it manages, waits on readiness barriers, and probes the running
//! service over a port-forward tunnel. The cluster is torn down exactly once per
//! run, whether the run succeeds, fails, or is interrupted.

pub mod backoff;
pub mod certs;
pub mod cluster;
pub mod config;
pub mod credentials;
pub mod diagnostics;
pub mod error;
pub mod exec;
pub mod kubectl;
pub mod pipeline;
pub mod prerequisites;
pub mod probe;
pub mod readiness;
pub mod tunnel;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Error, Result};

pub use cluster::{ClusterGuard, ClusterProvider, KindProvider};
pub use config::{RunConfig, Validate, ValidationResult};
pub use credentials::Credentials;
pub use exec::{CommandOutput, CommandRunner, Invocation, SystemRunner};
pub use kubectl::Kubectl;
pub use pipeline::{Orchestrator, RunOutcome, RunReport, RunResult, Stage, StepStatus, TestRun};
pub use prerequisites::ToolLocator;
pub use probe::{EndpointReport, EndpointVerifier, HealthVerdict, Prober};
pub use readiness::{
    Barrier, BarrierObserver, BarrierOutcome, ConditionQuery, ConditionStatus, Diagnostics,
    QueryError, ReadinessCondition, Subject, TracingObserver,
};
pub use tunnel::Tunnel;
