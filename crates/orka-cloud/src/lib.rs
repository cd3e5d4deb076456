//! Controller for ephemeral Orka VMs used as CI build agents.
//!
//! A [`CloudClient`] owns the [`Image`]s of one cloud profile. Starting an
//! instance admits it synchronously against the image limit and the cached
//! cluster capacity, then deploys and bootstraps the VM on the
//! [`AsyncExecutor`]. Terminating stops the agent best-effort and deletes the
//! VM. Instances still running when a client is disposed are handed to its
//! replacement through the [`LegacyInstanceStore`] and retired gracefully.

pub mod capacity;
pub mod client;
pub mod config;
pub mod executor;
pub mod image;
pub mod instance;
pub mod jobs;
pub mod legacy;
pub mod persisted;
pub mod ssh;
pub mod status;
pub mod vm_name;

pub use capacity::{CapacityCacheEntry, CapacityGate, CapacityInfo};
pub use client::CloudClient;
pub use config::{InstanceLimit, ProfileConfig, TokenSource};
pub use executor::AsyncExecutor;
pub use image::Image;
pub use instance::{Instance, LegacyMeta};
pub use legacy::LegacyInstanceStore;
pub use persisted::PersistedInstanceData;
pub use ssh::{RemoteShell, SshCommandRunner, SshCredentials, SshError};
pub use status::InstanceStatus;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CloudError {
    #[error("Quota exceeded: {0}")]
    Quota(String),

    #[error("No capacity: {0}")]
    Capacity(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Orka API Error: {0}")]
    Api(#[from] orka_client::ClientError),

    #[error("Deployment failed: {0}")]
    Deployment(String),

    #[error("Deletion failed: {0}")]
    Deletion(String),

    #[error("SSH Error: {0}")]
    Ssh(#[from] SshError),

    #[error("Resource Not Found: {0}")]
    NotFound(String),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("Internal Error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CloudError>;

/// Error descriptor shown next to an image or instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    pub details: Option<String>,
}

impl ErrorInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl From<&CloudError> for ErrorInfo {
    fn from(err: &CloudError) -> Self {
        let message = match err {
            CloudError::Quota(_) | CloudError::Capacity(_) => "Capacity unavailable",
            CloudError::Config(_) => "Invalid configuration",
            CloudError::Api(_) => "Orka API request failed",
            CloudError::Deployment(_) => "VM deployment failed",
            CloudError::Deletion(_) => "VM deletion failed",
            CloudError::Ssh(_) => "SSH bootstrap failed",
            CloudError::NotFound(_) => "Not found",
            CloudError::LockPoisoned(_) | CloudError::Internal(_) => "Internal error",
        };
        ErrorInfo::new(message).with_details(err.to_string())
    }
}
