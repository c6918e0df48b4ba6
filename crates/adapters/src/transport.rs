// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Connecting to a remote builder machine (§4.4 step 2: "if `sshName ==
//! "localhost"` it spawns the build helper directly; otherwise it spawns
//! SSH with a forced command `nix-store --serve --write` and a pinned
//! host key").

use async_trait::async_trait;
use qr_core::Machine;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("spawn failed for machine {machine}: {source}")]
    SpawnFailed {
        machine: String,
        #[source]
        source: std::io::Error,
    },
    #[error("child process for {machine} exited before handshake")]
    ChildExited { machine: String },
}

/// A live duplex connection to a builder's `nix-store --serve` endpoint,
/// whether that's a local subprocess's stdio or an SSH session's stdio.
pub struct BuilderConnection {
    child: Child,
}

impl BuilderConnection {
    fn from_child(child: Child) -> Self {
        Self { child }
    }

    pub fn stdio(&mut self) -> (impl AsyncRead + Unpin + '_, impl AsyncWrite + Unpin + '_) {
        let stdout = self.child.stdout.as_mut().expect("piped stdout");
        let stdin = self.child.stdin.as_mut().expect("piped stdin");
        (stdout, stdin)
    }

    pub async fn wait(mut self) -> std::io::Result<std::process::ExitStatus> {
        self.child.wait().await
    }
}

/// Spawns the process that speaks the remote build wire protocol for a
/// given machine.
#[async_trait]
pub trait BuilderTransport: Send + Sync + 'static {
    async fn connect(&self, machine: &Machine) -> Result<BuilderConnection, TransportError>;
}

/// SSH-over-subprocess transport for non-`localhost` machines, direct
/// subprocess spawn for `localhost` (§4.4 step 2).
#[derive(Clone, Copy, Default)]
pub struct SubprocessTransport;

impl SubprocessTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BuilderTransport for SubprocessTransport {
    async fn connect(&self, machine: &Machine) -> Result<BuilderConnection, TransportError> {
        let name = machine.name.as_str();
        let mut cmd = if name == "localhost" {
            let mut cmd = Command::new("nix-store");
            cmd.args(["--serve", "--write"]);
            cmd
        } else {
            let mut cmd = Command::new("ssh");
            cmd.arg(name);
            if let Some(key) = &machine.ssh_key {
                cmd.args(["-i", key]);
            }
            cmd.args(["-oBatchMode=yes", "-oConnectTimeout=30"]);
            if let Some(host_key) = &machine.public_host_key {
                // Pinned host key (§4.4 step 2): written to a throwaway
                // known_hosts-style entry rather than trusting TOFU.
                cmd.arg(format!("-oKnownHostsCommand=echo {name} ssh-ed25519 {host_key}"));
            }
            cmd.args(["--", "nix-store", "--serve", "--write"]);
            cmd
        };

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let child = cmd.spawn().map_err(|e| TransportError::SpawnFailed {
            machine: name.to_string(),
            source: e,
        })?;
        Ok(BuilderConnection::from_child(child))
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod fake {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Records connect attempts without spawning a process, for dispatcher
    /// and worker tests that don't need a real `nix-store --serve`.
    #[derive(Clone, Default)]
    pub struct FakeBuilderTransport {
        pub connect_attempts: Arc<Mutex<Vec<String>>>,
        pub fail_machines: Arc<Mutex<std::collections::HashSet<String>>>,
    }

    impl FakeBuilderTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail_for(&self, machine_name: &str) {
            self.fail_machines.lock().insert(machine_name.to_string());
        }
    }

    #[async_trait]
    impl BuilderTransport for FakeBuilderTransport {
        async fn connect(&self, machine: &Machine) -> Result<BuilderConnection, TransportError> {
            let name = machine.name.as_str().to_string();
            self.connect_attempts.lock().push(name.clone());
            if self.fail_machines.lock().contains(&name) {
                return Err(TransportError::ChildExited { machine: name });
            }
            // A real `Child` is still required for the stdio types to line
            // up; spawn the cheapest possible no-op process.
            let child = Command::new("true")
                .stdin(std::process::Stdio::piped())
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::piped())
                .spawn()
                .map_err(|e| TransportError::SpawnFailed { machine: name, source: e })?;
            Ok(BuilderConnection::from_child(child))
        }
    }
}

#[cfg(test)]
#[path = "transport_tests.rs"]
mod tests;
