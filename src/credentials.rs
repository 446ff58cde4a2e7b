//! Admin credential retrieval.

use std::collections::BTreeMap;
use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::{Error, Result};
use crate::kubectl::Kubectl;

/// Decoded admin credentials. Never written to disk or logged.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

fn decode_field(data: &BTreeMap<String, String>, key: &str) -> Result<String> {
    let encoded = data
        .get(key)
        .ok_or_else(|| Error::Credentials(format!("secret has no `{}` key", key)))?;

    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::Credentials(format!("`{}` is not valid base64: {}", key, e)))?;

    String::from_utf8(bytes)
        .map_err(|_| Error::Credentials(format!("`{}` is not valid UTF-8", key)))
}

/// Decodes `username` and `password` from a secret's data map.
pub fn decode_credentials(data: &BTreeMap<String, String>) -> Result<Credentials> {
    Ok(Credentials {
        username: decode_field(data, "username")?,
        password: decode_field(data, "password")?,
    })
}

/// Reads and decodes the admin secret.
pub async fn fetch_admin_credentials(
    kubectl: &Kubectl,
    secret: &str,
    namespace: &str,
) -> Result<Credentials> {
    let data = kubectl.secret_data(secret, namespace).await?;
    let credentials = decode_credentials(&data)?;
    tracing::info!(secret, username = %credentials.username, "retrieved admin credentials");
    Ok(credentials)
}
