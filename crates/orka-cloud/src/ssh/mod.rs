//! SSH access to deployed VMs: readiness polling, file upload and remote commands.

pub mod agent;
pub mod readiness;

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

pub use agent::RemoteAgent;
pub use readiness::wait_for_ssh;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("SSH on {host}:{port} unreachable after {attempts} attempts: {last_error}")]
    Unreachable {
        host: String,
        port: u16,
        attempts: u32,
        last_error: String,
    },
    #[error("Remote command failed (exit {status:?}): {stderr}")]
    CommandFailed { status: Option<i32>, stderr: String },
    #[error("SSH command timed out after {0:?}")]
    Timeout(Duration),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, PartialEq, Eq)]
pub struct SshCredentials {
    pub user: String,
    pub password: String,
}

impl SshCredentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for SshCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshCredentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Password-authenticated remote operations on a VM.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    async fn upload(
        &self,
        host: &str,
        port: u16,
        credentials: &SshCredentials,
        local: &Path,
        remote: &str,
    ) -> Result<(), SshError>;

    async fn exec(
        &self,
        host: &str,
        port: u16,
        credentials: &SshCredentials,
        command: &str,
    ) -> Result<String, SshError>;
}

const SSH_OPTIONS: &[&str] = &[
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
    "-o",
    "PreferredAuthentications=password",
    "-o",
    "PubkeyAuthentication=no",
    "-o",
    "ConnectTimeout=30",
];

/// [`RemoteShell`] backed by the `ssh`/`scp` binaries through `sshpass`.
///
/// The password is passed in the `SSHPASS` environment variable, never on the command line.
#[derive(Debug, Clone)]
pub struct SshCommandRunner {
    timeout: Duration,
}

impl SshCommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn run(&self, mut cmd: Command) -> Result<String, SshError> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| SshError::Timeout(self.timeout))??;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(SshError::CommandFailed {
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

impl Default for SshCommandRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[async_trait]
impl RemoteShell for SshCommandRunner {
    async fn upload(
        &self,
        host: &str,
        port: u16,
        credentials: &SshCredentials,
        local: &Path,
        remote: &str,
    ) -> Result<(), SshError> {
        debug!(%host, port, remote, "Uploading file over SCP");
        let mut cmd = Command::new("sshpass");
        cmd.env("SSHPASS", &credentials.password)
            .arg("-e")
            .arg("scp")
            .arg("-P")
            .arg(port.to_string())
            .args(SSH_OPTIONS)
            .arg(local)
            .arg(format!("{}@{}:{}", credentials.user, host, remote));
        self.run(cmd).await.map(|_| ())
    }

    async fn exec(
        &self,
        host: &str,
        port: u16,
        credentials: &SshCredentials,
        command: &str,
    ) -> Result<String, SshError> {
        debug!(%host, port, command, "Running remote command");
        let mut cmd = Command::new("sshpass");
        cmd.env("SSHPASS", &credentials.password)
            .arg("-e")
            .arg("ssh")
            .arg("-p")
            .arg(port.to_string())
            .args(SSH_OPTIONS)
            .arg(format!("{}@{}", credentials.user, host))
            .arg(command);
        self.run(cmd).await
    }
}
