//! Managed port-forward process.
//!
//! A [`Tunnel`] owns one background child process. It is killed on drop,
//! and [`Tunnel::stop`] kills and reaps it; stopping twice is a no-op.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::{sleep, Instant};

use crate::backoff::ExponentialBackoff;
use crate::error::{Error, Result};
use crate::exec::Invocation;

pub struct Tunnel {
    child: Option<Child>,
    command: String,
    local_port: u16,
}

impl Tunnel {
    /// Starts `invocation` in the background, forwarding to `local_port`.
    pub fn spawn(invocation: &Invocation, local_port: u16) -> Result<Self> {
        let child = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::Spawn {
                program: invocation.program.clone(),
                source,
            })?;

        tracing::info!(command = %invocation, pid = ?child.id(), "tunnel started");
        Ok(Self {
            child: Some(child),
            command: invocation.to_string(),
            local_port,
        })
    }

    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    /// Waits until the local port accepts connections.
    ///
    /// Fails early if the process exits, or once `deadline` passes.
    pub async fn wait_until_usable(&mut self, deadline: Duration) -> Result<()> {
        let start = Instant::now();
        let mut backoff = ExponentialBackoff::default();

        loop {
            let child = self
                .child
                .as_mut()
                .ok_or_else(|| Error::Tunnel("tunnel already stopped".to_string()))?;

            if let Some(status) = child.try_wait()? {
                let mut stderr = String::new();
                if let Some(mut pipe) = child.stderr.take() {
                    let _ = pipe.read_to_string(&mut stderr).await;
                }
                self.child = None;
                return Err(Error::Tunnel(format!(
                    "`{}` exited with {}: {}",
                    self.command,
                    status,
                    stderr.trim()
                )));
            }

            let last_error = match TcpStream::connect(("127.0.0.1", self.local_port)).await {
                Ok(_) => {
                    tracing::info!(
                        local_port = self.local_port,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "tunnel accepting connections"
                    );
                    return Ok(());
                }
                Err(e) => e,
            };

            let elapsed = start.elapsed();
            if elapsed >= deadline {
                return Err(Error::Tunnel(format!(
                    "port {} not usable within {:?}: {}",
                    self.local_port, deadline, last_error
                )));
            }

            tracing::debug!(
                local_port = self.local_port,
                error = %last_error,
                "tunnel not ready yet"
            );
            sleep(backoff.next_delay(deadline - elapsed)).await;
        }
    }

    /// Kills the process and waits for it to exit. Idempotent.
    pub async fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        if let Err(e) = child.start_kill() {
            tracing::debug!(error = %e, "tunnel process already gone");
        }
        match child.wait().await {
            Ok(status) => tracing::info!(%status, "tunnel stopped"),
            Err(e) => tracing::warn!(error = %e, "failed to reap tunnel process"),
        }
    }
}
