//! # Orka VM API client
//!
//! Typed access to the deploy / get / delete / list-nodes endpoints of an Orka
//! cluster, authenticated with a bearer token from a [`TokenProvider`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use orka_client::{OrkaClient, StaticTokenProvider, VmApi};
//!
//! # async fn run() -> orka_client::Result<()> {
//! let tokens = Arc::new(StaticTokenProvider::new("secret"));
//! let client = OrkaClient::new("https://orka.example.com", "orka-default", tokens)?;
//! let deployed = client.deploy("ios-tc-ab12c", "build-mac", &Default::default()).await?;
//! println!("{} at {}:{}", deployed.name, deployed.ip, deployed.ssh_port);
//! # Ok(())
//! # }
//! ```
//!
//! A `401 Unauthorized` answer invalidates the token and the request is sent
//! once more with a fresh one. A second `401` is returned as
//! [`ClientError::Unauthorized`].

pub mod client;
pub mod memory;
pub mod models;
pub mod token;

pub use client::{OrkaClient, VmApi};
pub use models::{
    ApiError, DeletionResponse, DeploymentResponse, NodesResponse, OrkaNode, OrkaVmConfig,
    VmConfigResponse, VmInstance, VmResponse,
};
pub use token::eks::EksTokenProvider;
pub use token::{StaticTokenProvider, TokenError, TokenProvider};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Serialization failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("Request was rejected as unauthorized after a token refresh")]
    Unauthorized,
    #[error("Token unavailable: {0}")]
    Token(#[from] TokenError),
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;
