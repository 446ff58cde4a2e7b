//! Self-signed certificate generation and TLS secret injection.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use crate::config::CertificateConfig;
use crate::error::{Error, Result};
use crate::exec::{CommandRunner, Invocation};
use crate::kubectl::Kubectl;

/// A generated key pair. Files are removed when this is dropped.
pub struct CertificateMaterial {
    _dir: TempDir,
    cert: PathBuf,
    key: PathBuf,
}

impl CertificateMaterial {
    pub fn cert(&self) -> &Path {
        &self.cert
    }

    pub fn key(&self) -> &Path {
        &self.key
    }
}

/// Issues self-signed certificates with `openssl`.
pub struct CertificateIssuer {
    runner: Arc<dyn CommandRunner>,
    openssl: String,
    config: CertificateConfig,
}

impl CertificateIssuer {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        openssl: impl Into<String>,
        config: CertificateConfig,
    ) -> Self {
        Self {
            runner,
            openssl: openssl.into(),
            config,
        }
    }

    /// Subject line passed to `openssl -subj`.
    pub fn subject(&self) -> String {
        format!("/CN={}/O={}", self.config.common_name, self.config.organization)
    }

    fn invocation(&self, cert: &Path, key: &Path) -> Invocation {
        Invocation::new(&self.openssl)
            .args(["req", "-x509", "-newkey", "rsa:2048", "-nodes"])
            .arg("-subj")
            .arg(self.subject())
            .arg("-days")
            .arg(self.config.days.to_string())
            .arg("-keyout")
            .arg(key.to_string_lossy())
            .arg("-out")
            .arg(cert.to_string_lossy())
    }

    /// Generates a fresh key pair in a private temporary directory.
    pub async fn generate(&self) -> Result<CertificateMaterial> {
        let dir = TempDir::new()?;
        let cert = dir.path().join("certificate.pem");
        let key = dir.path().join("key.pem");

        let invocation = self.invocation(&cert, &key);
        let output = self.runner.run(&invocation).await?;
        if !output.success() {
            return Err(Error::Certificate(output.stderr.trim().to_string()));
        }

        for path in [&cert, &key] {
            if !path.is_file() {
                return Err(Error::Certificate(format!(
                    "{} was not written",
                    path.display()
                )));
            }
        }

        tracing::info!(subject = %self.subject(), days = self.config.days, "generated certificate");
        Ok(CertificateMaterial {
            _dir: dir,
            cert,
            key,
        })
    }
}

/// Stores the material as a TLS secret in `namespace`.
pub async fn inject_tls_secret(
    kubectl: &Kubectl,
    material: &CertificateMaterial,
    name: &str,
    namespace: &str,
) -> Result<()> {
    kubectl
        .apply_tls_secret(name, namespace, material.cert(), material.key())
        .await?;
    tracing::info!(secret = name, namespace, "TLS secret created");
    Ok(())
}
