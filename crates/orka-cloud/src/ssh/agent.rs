use std::io::Write;
use std::sync::Arc;

use orka_common::{AgentMetadata, METADATA_REMOTE_PATH};
use tracing::{info, instrument, warn};

use super::{RemoteShell, SshCredentials, SshError};

/// Talks to the build agent installed on a VM.
#[derive(Clone)]
pub struct RemoteAgent {
    shell: Arc<dyn RemoteShell>,
    agent_directory: String,
}

impl RemoteAgent {
    pub fn new(shell: Arc<dyn RemoteShell>, agent_directory: impl Into<String>) -> Self {
        Self {
            shell,
            agent_directory: agent_directory.into(),
        }
    }

    pub fn stop_command(&self) -> String {
        format!(
            "{}/bin/agent.sh stop",
            self.agent_directory.trim_end_matches('/')
        )
    }

    /// Writes the identity metadata to a temp file and copies it to the VM.
    #[instrument(skip(self, credentials, metadata), fields(instance_id = %metadata.instance_id))]
    pub async fn upload_metadata(
        &self,
        host: &str,
        port: u16,
        credentials: &SshCredentials,
        metadata: &AgentMetadata,
    ) -> Result<(), SshError> {
        let mut file = tempfile::Builder::new()
            .prefix("orka_metadata_file")
            .tempfile()?;
        file.write_all(metadata.to_string().as_bytes())?;
        file.flush()?;

        self.shell
            .upload(host, port, credentials, file.path(), METADATA_REMOTE_PATH)
            .await?;
        info!(%host, "Uploaded agent metadata");
        Ok(())
    }

    /// Asks the agent to stop. Failures are logged and swallowed.
    pub async fn stop_agent(&self, host: &str, port: u16, credentials: &SshCredentials) {
        match self
            .shell
            .exec(host, port, credentials, &self.stop_command())
            .await
        {
            Ok(_) => info!(%host, "Stopped build agent"),
            Err(e) => warn!(%host, error = %e, "Could not stop build agent, continuing"),
        }
    }
}
