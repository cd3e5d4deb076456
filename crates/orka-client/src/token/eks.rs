use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, instrument};

use super::credentials::{AwsCredentialChain, CredentialSource};
use super::sigv4::{encode_token, presign_get_caller_identity};
use super::{TokenError, TokenProvider};

/// Cached tokens are refreshed before the presigned URL itself expires.
pub const REFRESH_AFTER: Duration = Duration::from_secs(14 * 60);

struct CachedToken {
    token: String,
    refresh_at: Instant,
}

/// Produces EKS IAM tokens (`k8s-aws-v1.<presigned STS url>`), cached per provider.
///
/// `get_token` holds an async refresh gate for its whole duration, so at most
/// one refresh runs and concurrent callers reuse its result.
pub struct EksTokenProvider {
    cluster: String,
    region: String,
    credentials: Arc<dyn CredentialSource>,
    cache: Mutex<Option<CachedToken>>,
    refresh: tokio::sync::Mutex<()>,
    refresh_after: Duration,
}

impl EksTokenProvider {
    pub fn new(cluster: impl Into<String>, region: impl Into<String>) -> Self {
        let region = region.into();
        let chain = AwsCredentialChain::from_env(region.clone());
        Self::with_credentials(cluster, region, Arc::new(chain))
    }

    pub fn with_credentials(
        cluster: impl Into<String>,
        region: impl Into<String>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            region: region.into(),
            credentials,
            cache: Mutex::new(None),
            refresh: tokio::sync::Mutex::new(()),
            refresh_after: REFRESH_AFTER,
        }
    }

    pub fn with_refresh_after(mut self, refresh_after: Duration) -> Self {
        self.refresh_after = refresh_after;
        self
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    fn cached(&self) -> Option<String> {
        let cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        cache
            .as_ref()
            .filter(|c| Instant::now() < c.refresh_at)
            .map(|c| c.token.clone())
    }
}

#[async_trait]
impl TokenProvider for EksTokenProvider {
    #[instrument(skip(self), fields(cluster = %self.cluster, region = %self.region))]
    async fn get_token(&self) -> Result<String, TokenError> {
        if !self.is_valid() {
            return Err(TokenError::Config(
                "EKS cluster name and region are required".to_string(),
            ));
        }

        let _gate = self.refresh.lock().await;
        if let Some(token) = self.cached() {
            debug!("Using cached EKS token");
            return Ok(token);
        }

        let credentials = self.credentials.resolve().await?;
        let url = presign_get_caller_identity(&credentials, &self.region, &self.cluster, Utc::now())?;
        let token = encode_token(&url);

        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        *cache = Some(CachedToken {
            token: token.clone(),
            refresh_at: Instant::now() + self.refresh_after,
        });
        info!("Refreshed EKS token");
        Ok(token)
    }

    fn is_valid(&self) -> bool {
        !self.cluster.trim().is_empty() && !self.region.trim().is_empty()
    }

    fn invalidate_token(&self) {
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        *cache = None;
        debug!(cluster = %self.cluster, "EKS token invalidated");
    }
}
