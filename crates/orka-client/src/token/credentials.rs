use std::path::{Path, PathBuf};

use async_trait::async_trait;
use aws_config::default_provider::credentials::DefaultCredentialsChain;
use aws_config::provider_config::ProviderConfig;
use aws_config::web_identity_token::{StaticConfiguration, WebIdentityTokenCredentialsProvider};
use aws_config::Region;
use aws_credential_types::provider::{ProvideCredentials, SharedCredentialsProvider};
use tokio::sync::OnceCell;
use tracing::info;

use super::sigv4::AwsCredentials;
use super::TokenError;

pub const WEB_IDENTITY_TOKEN_FILE_ENV: &str = "AWS_WEB_IDENTITY_TOKEN_FILE";
pub const ROLE_ARN_ENV: &str = "AWS_ROLE_ARN";
const SESSION_NAME: &str = "orka-cloud";

/// Where IAM credentials come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialStrategy {
    WebIdentity { token_file: PathBuf, role_arn: String },
    DefaultChain,
}

impl CredentialStrategy {
    pub fn from_env() -> Self {
        Self::select(
            std::env::var(WEB_IDENTITY_TOKEN_FILE_ENV).ok(),
            std::env::var(ROLE_ARN_ENV).ok(),
        )
    }

    /// Web identity wins when both settings are present and the token file exists.
    pub fn select(token_file: Option<String>, role_arn: Option<String>) -> Self {
        match (token_file, role_arn) {
            (Some(file), Some(role))
                if !file.is_empty() && !role.is_empty() && Path::new(&file).exists() =>
            {
                CredentialStrategy::WebIdentity {
                    token_file: PathBuf::from(file),
                    role_arn: role,
                }
            }
            _ => CredentialStrategy::DefaultChain,
        }
    }
}

#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn resolve(&self) -> Result<AwsCredentials, TokenError>;
}

/// Resolves credentials through the AWS SDK, building the provider on first use.
pub struct AwsCredentialChain {
    region: String,
    strategy: CredentialStrategy,
    provider: OnceCell<SharedCredentialsProvider>,
}

impl AwsCredentialChain {
    pub fn new(region: impl Into<String>, strategy: CredentialStrategy) -> Self {
        Self {
            region: region.into(),
            strategy,
            provider: OnceCell::new(),
        }
    }

    pub fn from_env(region: impl Into<String>) -> Self {
        Self::new(region, CredentialStrategy::from_env())
    }

    async fn provider(&self) -> &SharedCredentialsProvider {
        self.provider
            .get_or_init(|| async {
                let region = Region::new(self.region.clone());
                match &self.strategy {
                    CredentialStrategy::WebIdentity {
                        token_file,
                        role_arn,
                    } => {
                        info!(%role_arn, "Using web identity credentials for EKS token");
                        let conf = ProviderConfig::without_region().with_region(Some(region));
                        let provider = WebIdentityTokenCredentialsProvider::builder()
                            .static_configuration(StaticConfiguration {
                                web_identity_token_file: token_file.clone(),
                                role_arn: role_arn.clone(),
                                session_name: SESSION_NAME.to_string(),
                            })
                            .configure(&conf)
                            .build();
                        SharedCredentialsProvider::new(provider)
                    }
                    CredentialStrategy::DefaultChain => {
                        info!("Using default AWS credential chain for EKS token");
                        let chain = DefaultCredentialsChain::builder()
                            .region(region)
                            .build()
                            .await;
                        SharedCredentialsProvider::new(chain)
                    }
                }
            })
            .await
    }
}

#[async_trait]
impl CredentialSource for AwsCredentialChain {
    async fn resolve(&self) -> Result<AwsCredentials, TokenError> {
        let creds = self
            .provider()
            .await
            .provide_credentials()
            .await
            .map_err(|e| TokenError::Credentials(e.to_string()))?;

        Ok(AwsCredentials {
            access_key_id: creds.access_key_id().to_string(),
            secret_access_key: creds.secret_access_key().to_string(),
            session_token: creds.session_token().map(str::to_string),
        })
    }
}
