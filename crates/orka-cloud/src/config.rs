//! Cloud profile configuration.
//!
//! Profiles arrive as a flat map of parameters keyed by the constants below.
//! The binary reads the same keys from `ORKA_*` environment variables.

use std::collections::HashMap;
use std::time::Duration;

use crate::ssh::SshCredentials;
use crate::{CloudError, Result};

pub const ENDPOINT: &str = "cloud.orka.endpoint";
pub const NAMESPACE: &str = "cloud.orka.namespace";
pub const TOKEN: &str = "secure:cloud.orka.token";
pub const AWS_IAM: &str = "cloud.orka.aws.iam";
pub const AWS_EKS_CLUSTER: &str = "cloud.orka.aws.eks.cluster";
pub const AWS_REGION: &str = "cloud.orka.aws.region";
pub const VM_NAME: &str = "cloud.orka.vm.name";
pub const VM_USER: &str = "cloud.orka.vm.user";
pub const VM_PASSWORD: &str = "secure:cloud.orka.vm.password";
pub const VM_METADATA: &str = "cloud.orka.vm.metadata";
pub const AGENT_DIRECTORY: &str = "cloud.orka.vm.agent.directory";
pub const INSTANCE_LIMIT: &str = "cloud.orka.vm.limit";
pub const NODE_MAPPINGS: &str = "cloud.orka.node.mappings";
pub const AGENT_POOL_ID: &str = "agent_pool_id";

pub const DEFAULT_NAMESPACE: &str = "orka-default";

const ENV_KEYS: &[(&str, &str)] = &[
    ("ORKA_ENDPOINT", ENDPOINT),
    ("ORKA_NAMESPACE", NAMESPACE),
    ("ORKA_TOKEN", TOKEN),
    ("ORKA_AWS_IAM", AWS_IAM),
    ("ORKA_AWS_EKS_CLUSTER", AWS_EKS_CLUSTER),
    ("ORKA_AWS_REGION", AWS_REGION),
    ("ORKA_VM_NAME", VM_NAME),
    ("ORKA_VM_USER", VM_USER),
    ("ORKA_VM_PASSWORD", VM_PASSWORD),
    ("ORKA_VM_METADATA", VM_METADATA),
    ("ORKA_AGENT_DIRECTORY", AGENT_DIRECTORY),
    ("ORKA_INSTANCE_LIMIT", INSTANCE_LIMIT),
    ("ORKA_NODE_MAPPINGS", NODE_MAPPINGS),
    ("ORKA_AGENT_POOL_ID", AGENT_POOL_ID),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceLimit {
    Unlimited,
    Max(usize),
}

impl InstanceLimit {
    /// Empty and `-1` mean unlimited.
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.is_empty() {
            return Ok(InstanceLimit::Unlimited);
        }
        match value.parse::<i64>() {
            Ok(-1) => Ok(InstanceLimit::Unlimited),
            Ok(n) if n >= 0 => Ok(InstanceLimit::Max(n as usize)),
            _ => Err(CloudError::Config(format!("Invalid instance limit: {value}"))),
        }
    }

    pub fn admits(self, live: usize) -> bool {
        match self {
            InstanceLimit::Unlimited => true,
            InstanceLimit::Max(max) => live < max,
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub enum TokenSource {
    Static(String),
    AwsIam { cluster: String, region: String },
}

impl std::fmt::Debug for TokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenSource::Static(_) => f.write_str("Static(<redacted>)"),
            TokenSource::AwsIam { cluster, region } => f
                .debug_struct("AwsIam")
                .field("cluster", cluster)
                .field("region", region)
                .finish(),
        }
    }
}

/// Timing knobs. Defaults match production behavior.
#[derive(Debug, Clone)]
pub struct Tuning {
    pub executor_threads: usize,
    pub ssh_retries: u32,
    pub ssh_retry_interval: Duration,
    pub ssh_command_timeout: Duration,
    pub capacity_ttl: Duration,
    pub capacity_backoff: Duration,
    pub reconcile_initial_delay: Duration,
    pub reconcile_interval: Duration,
    pub graceful_initial_delay: Duration,
    pub graceful_interval: Duration,
    pub http_timeout: Duration,
    pub max_delete_attempts: u32,
    pub shutdown_drain: Duration,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            executor_threads: 2,
            ssh_retries: 12,
            ssh_retry_interval: Duration::from_secs(10),
            ssh_command_timeout: Duration::from_secs(60),
            capacity_ttl: Duration::from_secs(30),
            capacity_backoff: Duration::from_secs(30),
            reconcile_initial_delay: Duration::from_secs(60),
            reconcile_interval: Duration::from_secs(300),
            graceful_initial_delay: Duration::from_secs(30),
            graceful_interval: Duration::from_secs(60),
            http_timeout: Duration::from_secs(60),
            max_delete_attempts: 10,
            shutdown_drain: Duration::from_secs(5),
        }
    }
}

/// One VM template offered by a profile.
#[derive(Debug, Clone)]
pub struct ImageConfig {
    pub template: String,
    pub credentials: SshCredentials,
    pub agent_directory: String,
    pub instance_limit: InstanceLimit,
    pub vm_metadata: HashMap<String, String>,
    pub agent_pool_id: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct ProfileConfig {
    pub profile_id: String,
    pub profile_name: String,
    pub endpoint: String,
    pub namespace: String,
    pub token_source: TokenSource,
    pub node_mappings: HashMap<String, String>,
    pub images: Vec<ImageConfig>,
    pub tuning: Tuning,
}

fn required<'a>(params: &'a HashMap<String, String>, key: &str) -> Result<&'a str> {
    params
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| CloudError::Config(format!("Missing required parameter {key}")))
}

fn optional<'a>(params: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    params.get(key).map(|v| v.trim()).filter(|v| !v.is_empty())
}

impl ProfileConfig {
    pub fn from_parameters(
        profile_id: &str,
        profile_description: &str,
        params: &HashMap<String, String>,
    ) -> Result<Self> {
        let endpoint = required(params, ENDPOINT)?.to_string();
        let namespace = optional(params, NAMESPACE)
            .unwrap_or(DEFAULT_NAMESPACE)
            .to_string();

        let use_iam = optional(params, AWS_IAM)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let token_source = if use_iam {
            TokenSource::AwsIam {
                cluster: required(params, AWS_EKS_CLUSTER)?.to_string(),
                region: required(params, AWS_REGION)?.to_string(),
            }
        } else {
            TokenSource::Static(required(params, TOKEN)?.to_string())
        };

        let image = ImageConfig {
            template: required(params, VM_NAME)?.to_string(),
            credentials: SshCredentials::new(
                required(params, VM_USER)?,
                required(params, VM_PASSWORD)?,
            ),
            agent_directory: required(params, AGENT_DIRECTORY)?.to_string(),
            instance_limit: InstanceLimit::parse(
                params.get(INSTANCE_LIMIT).map(String::as_str).unwrap_or(""),
            )?,
            vm_metadata: parse_vm_metadata(optional(params, VM_METADATA).unwrap_or(""))?,
            agent_pool_id: optional(params, AGENT_POOL_ID)
                .map(|v| {
                    v.parse::<i32>()
                        .map_err(|_| CloudError::Config(format!("Invalid agent pool id: {v}")))
                })
                .transpose()?,
        };

        Ok(Self {
            profile_id: profile_id.to_string(),
            profile_name: extract_profile_name(profile_description)
                .unwrap_or_else(|| profile_id.to_string()),
            endpoint,
            namespace,
            token_source,
            node_mappings: parse_node_mappings(optional(params, NODE_MAPPINGS).unwrap_or(""))?,
            images: vec![image],
            tuning: Tuning::default(),
        })
    }

    /// Reads the profile from `ORKA_*` variables.
    pub fn from_env() -> Result<Self> {
        let params: HashMap<String, String> = ENV_KEYS
            .iter()
            .filter_map(|(var, key)| std::env::var(var).ok().map(|v| (key.to_string(), v)))
            .collect();
        let profile_id = std::env::var("ORKA_PROFILE_ID").unwrap_or_else(|_| "orka".to_string());
        let description = std::env::var("ORKA_PROFILE_DESCRIPTION").unwrap_or_default();
        Self::from_parameters(&profile_id, &description, &params)
    }
}

/// Finds `name` in a description such as `Cloud profile 'name'` or `profile 'name'`.
pub fn extract_profile_name(description: &str) -> Option<String> {
    let start = description.find("profile '")? + "profile '".len();
    let rest = &description[start..];
    let end = rest.find('\'')?;
    let name = &rest[..end];
    (!name.is_empty()).then(|| name.to_string())
}

/// Parses `private;public` lines into a case-insensitive host map.
pub fn parse_node_mappings(text: &str) -> Result<HashMap<String, String>> {
    let mut mappings = HashMap::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match line.split_once(';') {
            Some((private, public)) if !private.trim().is_empty() && !public.trim().is_empty() => {
                mappings.insert(private.trim().to_lowercase(), public.trim().to_string());
            }
            _ => {
                return Err(CloudError::Config(format!(
                    "Invalid node mapping '{line}', expected private;public"
                )))
            }
        }
    }
    Ok(mappings)
}

/// Parses `key=value[,key=value]*`.
pub fn parse_vm_metadata(text: &str) -> Result<HashMap<String, String>> {
    let mut metadata = HashMap::new();
    let text = text.trim();
    if text.is_empty() {
        return Ok(metadata);
    }
    for pair in text.split(',') {
        match pair.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() && !value.trim().is_empty() => {
                metadata.insert(key.trim().to_string(), value.trim().to_string());
            }
            _ => {
                return Err(CloudError::Config(format!(
                    "Invalid VM metadata '{text}', expected key=value[,key=value]"
                )))
            }
        }
    }
    Ok(metadata)
}
