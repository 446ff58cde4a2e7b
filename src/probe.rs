//! Reachability and health probes over the port-forward tunnel.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::config::EndpointConfig;
use crate::error::{Error, Result};
use crate::kubectl::Kubectl;
use crate::tunnel::Tunnel;

/// Result of the health probe. Advisory only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", content = "detail", rename_all = "snake_case")]
pub enum HealthVerdict {
    /// The expected marker was reported.
    Up,
    /// A body was returned without the expected marker.
    Mismatch(String),
    /// No usable answer.
    Unavailable(String),
}

impl HealthVerdict {
    pub fn is_up(&self) -> bool {
        matches!(self, HealthVerdict::Up)
    }
}

/// What endpoint verification observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointReport {
    /// Status code of the reachability probe.
    pub status: u16,
    pub health: HealthVerdict,
}

/// Judges a readiness body against the expected `status` marker.
pub fn health_verdict(body: &str, marker: &str) -> HealthVerdict {
    let document: Value = match serde_json::from_str(body) {
        Ok(document) => document,
        Err(_) => return HealthVerdict::Mismatch("body is not JSON".to_string()),
    };

    match document.get("status").and_then(Value::as_str) {
        Some(status) if status == marker => HealthVerdict::Up,
        Some(status) => HealthVerdict::Mismatch(format!("status is {}", status)),
        None => HealthVerdict::Mismatch("no status field".to_string()),
    }
}

/// HTTPS prober that ignores certificate trust.
#[derive(Debug, Clone)]
pub struct Prober {
    client: reqwest::Client,
    base_url: String,
    readiness_path: String,
    marker: String,
}

impl Prober {
    pub fn new(
        base_url: impl Into<String>,
        readiness_path: impl Into<String>,
        marker: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            readiness_path: readiness_path.into(),
            marker: marker.into(),
        })
    }

    pub fn from_config(endpoint: &EndpointConfig) -> Result<Self> {
        Self::new(
            endpoint.base_url(),
            &endpoint.readiness_path,
            &endpoint.health_marker,
            Duration::from_secs(endpoint.request_timeout),
        )
    }

    /// GET `/`. Any answer that is not a 4xx or 5xx counts as reachable.
    pub async fn check_reachable(&self) -> Result<u16> {
        let url = format!("{}/", self.base_url);
        let unreachable = |reason: String| Error::Unreachable {
            url: url.clone(),
            reason,
        };

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| unreachable(e.to_string()))?;

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(unreachable(format!("HTTP {}", status)));
        }

        tracing::info!(url = %url, status = status.as_u16(), "endpoint reachable");
        Ok(status.as_u16())
    }

    /// GET the readiness path and look for the marker.
    pub async fn check_health(&self) -> HealthVerdict {
        let url = format!("{}{}", self.base_url, self.readiness_path);

        let verdict = match self.client.get(&url).send().await {
            Ok(response) => match response.text().await {
                Ok(body) => health_verdict(&body, &self.marker),
                Err(e) => HealthVerdict::Unavailable(e.to_string()),
            },
            Err(e) => HealthVerdict::Unavailable(e.to_string()),
        };

        match &verdict {
            HealthVerdict::Up => {
                tracing::info!(url = %url, marker = %self.marker, "health check passed")
            }
            HealthVerdict::Mismatch(detail) | HealthVerdict::Unavailable(detail) => tracing::warn!(
                url = %url,
                marker = %self.marker,
                detail = %detail,
                "health marker not found"
            ),
        }
        verdict
    }
}

/// Verifies the running application from outside the cluster.
#[async_trait]
pub trait EndpointVerifier: Send + Sync {
    /// Opens a tunnel into `slot`, probes through it, and stops the tunnel
    /// before returning on every path.
    async fn verify(&self, slot: &mut Option<Tunnel>) -> Result<EndpointReport>;
}

/// Verifier that port-forwards the application service.
pub struct TunnelVerifier {
    kubectl: Kubectl,
    service: String,
    namespace: String,
    endpoint: EndpointConfig,
    tunnel_deadline: Duration,
    prober: Prober,
}

impl TunnelVerifier {
    pub fn new(
        kubectl: Kubectl,
        service: impl Into<String>,
        namespace: impl Into<String>,
        endpoint: EndpointConfig,
        tunnel_deadline: Duration,
    ) -> Result<Self> {
        let prober = Prober::from_config(&endpoint)?;
        Ok(Self {
            kubectl,
            service: service.into(),
            namespace: namespace.into(),
            endpoint,
            tunnel_deadline,
            prober,
        })
    }

    async fn probe_through(&self, tunnel: &mut Tunnel) -> Result<EndpointReport> {
        tunnel.wait_until_usable(self.tunnel_deadline).await?;
        let status = self.prober.check_reachable().await?;
        let health = self.prober.check_health().await;
        Ok(EndpointReport { status, health })
    }
}

#[async_trait]
impl EndpointVerifier for TunnelVerifier {
    async fn verify(&self, slot: &mut Option<Tunnel>) -> Result<EndpointReport> {
        let invocation = self.kubectl.port_forward(
            &self.service,
            &self.namespace,
            self.endpoint.local_port,
            self.endpoint.remote_port,
        );
        let tunnel = slot.insert(Tunnel::spawn(&invocation, self.endpoint.local_port)?);

        let result = self.probe_through(tunnel).await;
        tunnel.stop().await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use crate::testing::FakeRunner;

    /// Serves one canned HTTP response per connection.
    async fn serve(status_line: &'static str, body: &'static str) -> String {
        format!("http://{}", serve_addr(status_line, body).await)
    }

    async fn serve_addr(status_line: &'static str, body: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    status_line,
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });

        addr
    }

    /// Writes an executable stand-in for kubectl that runs `body`.
    #[cfg(unix)]
    fn fake_kubectl(dir: &TempDir, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.path().join("kubectl");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn tunnel_verifier(kubectl: String, local_port: u16) -> TunnelVerifier {
        let endpoint = EndpointConfig {
            local_port,
            request_timeout: 5,
            ..EndpointConfig::default()
        };
        TunnelVerifier::new(
            Kubectl::new(FakeRunner::succeeding(), kubectl),
            "example-kc-service",
            "keycloak",
            endpoint,
            Duration::from_secs(10),
        )
        .unwrap()
    }

    fn prober(base_url: &str) -> Prober {
        Prober::new(base_url, "/health/ready", "UP", Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn verdict_matches_marker() {
        assert_eq!(health_verdict(r#"{"status":"UP","checks":[]}"#, "UP"), HealthVerdict::Up);
        assert_eq!(
            health_verdict(r#"{"status":"DOWN"}"#, "UP"),
            HealthVerdict::Mismatch("status is DOWN".to_string())
        );
        assert!(matches!(health_verdict("{}", "UP"), HealthVerdict::Mismatch(_)));
        assert!(matches!(health_verdict("<html>", "UP"), HealthVerdict::Mismatch(_)));
    }

    #[tokio::test]
    async fn success_and_redirect_are_reachable() {
        let ok = serve("200 OK", "{}").await;
        assert_eq!(prober(&ok).check_reachable().await.unwrap(), 200);

        let redirect = serve("302 Found", "").await;
        assert_eq!(prober(&redirect).check_reachable().await.unwrap(), 302);
    }

    #[tokio::test]
    async fn error_statuses_are_unreachable() {
        let base = serve("503 Service Unavailable", "").await;
        let err = prober(&base).check_reachable().await.unwrap_err();

        assert!(matches!(err, Error::Unreachable { ref reason, .. } if reason.contains("503")));
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = prober(&format!("http://{}", addr))
            .check_reachable()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unreachable { .. }));
    }

    #[tokio::test]
    async fn health_reports_marker() {
        let up = serve("200 OK", r#"{"status":"UP"}"#).await;
        assert_eq!(prober(&up).check_health().await, HealthVerdict::Up);

        let down = serve("503 Service Unavailable", r#"{"status":"DOWN"}"#).await;
        assert!(matches!(
            prober(&down).check_health().await,
            HealthVerdict::Mismatch(_)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn verify_stops_tunnel_when_endpoint_unreachable() {
        let dir = TempDir::new().unwrap();
        let kubectl = fake_kubectl(&dir, "exec sleep 30");
        let addr = serve_addr("503 Service Unavailable", "").await;
        let verifier = tunnel_verifier(kubectl, addr.port());

        let mut slot = None;
        let err = verifier.verify(&mut slot).await.unwrap_err();

        assert!(matches!(err, Error::Unreachable { .. }), "{}", err);
        assert!(!slot.expect("tunnel was started").is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn verify_stops_tunnel_that_exits_early() {
        let dir = TempDir::new().unwrap();
        let kubectl = fake_kubectl(&dir, "echo 'unable to listen on any port' >&2; exit 1");
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let verifier = tunnel_verifier(kubectl, port);

        let mut slot = None;
        let err = verifier.verify(&mut slot).await.unwrap_err();

        assert!(
            matches!(err, Error::Tunnel(ref msg) if msg.contains("unable to listen")),
            "{}",
            err
        );
        assert!(!slot.expect("tunnel was started").is_running());
    }
}
