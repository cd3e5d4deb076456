// Types shared between the cloud controller and the build agent running inside a VM.

use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;

pub use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Agent parameter carrying the image id the agent was started for.
pub const IMAGE_ID_PARAM_NAME: &str = "cloud.orka.image.id";
/// Agent parameter carrying the instance id the agent was started for.
pub const INSTANCE_ID_PARAM_NAME: &str = "cloud.orka.instance.id";
/// Agent parameter carrying the id the instance had when it was first scheduled.
pub const STARTING_INSTANCE_ID_PARAM_NAME: &str = "cloud.orka.starting.instance.id";

/// Remote path the identity metadata is uploaded to.
pub const METADATA_REMOTE_PATH: &str = "/tmp/orka_metadata_file";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MetadataError {
    #[error("Metadata file is empty")]
    Empty,

    #[error("Metadata file is missing the {0} line")]
    MissingField(&'static str),
}

/// Identity metadata written to a freshly deployed VM.
///
/// Line-oriented: `instanceId`, `imageId` and an optional `startingInstanceId`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMetadata {
    pub instance_id: String,
    pub image_id: String,
    pub starting_instance_id: Option<String>,
}

impl AgentMetadata {
    pub fn new(instance_id: impl Into<String>, image_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            image_id: image_id.into(),
            starting_instance_id: None,
        }
    }

    pub fn with_starting_instance_id(mut self, starting: impl Into<String>) -> Self {
        self.starting_instance_id = Some(starting.into());
        self
    }

    /// Converts the metadata into the agent parameters the agent reports back.
    pub fn to_agent_parameters(&self) -> HashMap<String, String> {
        let mut params = HashMap::new();
        params.insert(INSTANCE_ID_PARAM_NAME.to_string(), self.instance_id.clone());
        params.insert(IMAGE_ID_PARAM_NAME.to_string(), self.image_id.clone());
        if let Some(starting) = &self.starting_instance_id {
            params.insert(STARTING_INSTANCE_ID_PARAM_NAME.to_string(), starting.clone());
        }
        params
    }
}

impl Display for AgentMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\n{}", self.instance_id, self.image_id)?;
        if let Some(starting) = &self.starting_instance_id {
            write!(f, "\n{starting}")?;
        }
        Ok(())
    }
}

impl FromStr for AgentMetadata {
    type Err = MetadataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(MetadataError::Empty);
        }
        let mut lines = s.lines().map(str::trim);
        let instance_id = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or(MetadataError::MissingField("instanceId"))?;
        let image_id = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or(MetadataError::MissingField("imageId"))?;
        let starting_instance_id = lines.next().filter(|l| !l.is_empty()).map(str::to_string);

        Ok(Self {
            instance_id: instance_id.to_string(),
            image_id: image_id.to_string(),
            starting_instance_id,
        })
    }
}

/// What a connecting agent tells the orchestrator about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDescription {
    pub parameters: HashMap<String, String>,
}

impl AgentDescription {
    pub fn new(instance_id: &str, image_id: &str) -> Self {
        Self {
            parameters: AgentMetadata::new(instance_id, image_id).to_agent_parameters(),
        }
    }

    pub fn instance_id(&self) -> Option<&str> {
        self.parameters.get(INSTANCE_ID_PARAM_NAME).map(String::as_str)
    }

    pub fn image_id(&self) -> Option<&str> {
        self.parameters.get(IMAGE_ID_PARAM_NAME).map(String::as_str)
    }
}
