use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::memory::parse_memory_gb;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub message: String,
}

/// Joins the `message` and `errors[]` of a response into one line.
pub(crate) fn describe(message: Option<&str>, errors: &[ApiError]) -> String {
    let mut parts: Vec<&str> = errors.iter().map(|e| e.message.as_str()).collect();
    if let Some(message) = message {
        if !message.is_empty() && !parts.contains(&message) {
            parts.insert(0, message);
        }
    }
    parts.join("; ")
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct DeploymentRequest<'a> {
    pub name: &'a str,
    #[serde(rename = "vmConfig")]
    pub vm_config: &'a str,
    #[serde(rename = "customMetadata", skip_serializing_if = "HashMap::is_empty")]
    pub custom_metadata: &'a HashMap<String, String>,
}

/// Result of `deploy(template)`. `name` is the server-assigned VM id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentResponse {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default, rename = "ssh_port")]
    pub ssh_port: u16,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub errors: Vec<ApiError>,
}

impl DeploymentResponse {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty() && !self.name.is_empty()
    }

    pub fn error_message(&self) -> String {
        let described = describe(self.message.as_deref(), &self.errors);
        if described.is_empty() {
            "Deployment returned no VM id".to_string()
        } else {
            described
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VmInstance {
    /// VM id.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default, rename = "ssh_port")]
    pub ssh_port: u16,
    #[serde(default, rename = "vmConfig")]
    pub vm_config: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Result of `get(name)`: the VMs currently deployed from a template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VmResponse {
    #[serde(default, alias = "items")]
    pub instances: Vec<VmInstance>,
    #[serde(default)]
    pub errors: Vec<ApiError>,
}

impl VmResponse {
    pub fn instance_ids(&self) -> Vec<&str> {
        self.instances.iter().map(|i| i.name.as_str()).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeletionResponse {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub errors: Vec<ApiError>,
}

impl DeletionResponse {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn error_message(&self) -> String {
        describe(self.message.as_deref(), &self.errors)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrkaNode {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub allocatable_cpu: u32,
    #[serde(default)]
    pub available_cpu: u32,
    #[serde(default)]
    pub allocatable_memory: String,
    #[serde(default)]
    pub available_memory: String,
    #[serde(default)]
    pub phase: String,
    #[serde(default, rename = "orkaTags")]
    pub tags: Vec<String>,
}

impl OrkaNode {
    pub fn is_ready(&self) -> bool {
        self.phase.eq_ignore_ascii_case("ready")
    }

    pub fn available_memory_gb(&self) -> f64 {
        parse_memory_gb(&self.available_memory).unwrap_or(0.0)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodesResponse {
    #[serde(default, alias = "nodes")]
    pub items: Vec<OrkaNode>,
    #[serde(default)]
    pub errors: Vec<ApiError>,
}

/// A VM template definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrkaVmConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub cpu: u32,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub memory: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub tag_required: bool,
    #[serde(default)]
    pub node_name: Option<String>,
}

impl OrkaVmConfig {
    pub fn memory_gb(&self) -> f64 {
        self.memory.as_deref().and_then(parse_memory_gb).unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VmConfigResponse {
    #[serde(default)]
    pub items: Vec<OrkaVmConfig>,
    #[serde(default)]
    pub errors: Vec<ApiError>,
}
