use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::models::{
    describe, ApiError, DeletionResponse, DeploymentRequest, DeploymentResponse, NodesResponse,
    OrkaVmConfig, VmConfigResponse, VmResponse,
};
use crate::token::TokenProvider;
use crate::{ClientError, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Operations the cloud controller needs from the VM API.
#[async_trait]
pub trait VmApi: Send + Sync {
    /// Deploys a VM called `name` from `template`, attaching `metadata` to it.
    async fn deploy(
        &self,
        name: &str,
        template: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<DeploymentResponse>;

    /// Lists the VMs currently deployed from `name`.
    async fn get_vm(&self, name: &str) -> Result<VmResponse>;

    async fn delete_vm(&self, id: &str) -> Result<DeletionResponse>;

    async fn list_nodes(&self) -> Result<NodesResponse>;

    /// Looks up the template definition, `None` when it does not exist.
    async fn vm_config(&self, template: &str) -> Result<Option<OrkaVmConfig>>;
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    errors: Vec<ApiError>,
}

/// reqwest-backed [`VmApi`] scoped to one namespace.
#[derive(Clone)]
pub struct OrkaClient {
    http: Client,
    endpoint: String,
    namespace: String,
    tokens: Arc<dyn TokenProvider>,
}

impl OrkaClient {
    pub fn new(
        endpoint: &str,
        namespace: &str,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self> {
        Self::with_timeout(endpoint, namespace, tokens, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        endpoint: &str,
        namespace: &str,
        tokens: Arc<dyn TokenProvider>,
        timeout: Duration,
    ) -> Result<Self> {
        Url::parse(endpoint).map_err(|e| ClientError::InvalidEndpoint(format!("{endpoint}: {e}")))?;

        let http = Client::builder()
            .timeout(timeout)
            .connect_timeout(CONNECT_TIMEOUT.min(timeout))
            .build()?;

        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            namespace: namespace.to_string(),
            tokens,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn url(&self, path: &str) -> Result<Url> {
        let raw = format!("{}/{}", self.endpoint, path.trim_start_matches('/'));
        Url::parse(&raw).map_err(|e| ClientError::InvalidEndpoint(format!("{raw}: {e}")))
    }

    fn vms_url(&self) -> Result<Url> {
        self.url(&format!("api/v1/namespaces/{}/vms", self.namespace))
    }

    async fn send_once(
        &self,
        method: &Method,
        url: &Url,
        body: Option<&serde_json::Value>,
    ) -> Result<reqwest::Response> {
        let token = self.tokens.get_token().await?;
        let mut request = self
            .http
            .request(method.clone(), url.clone())
            .bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }
        Ok(request.send().await?)
    }

    /// Sends a request, retrying exactly once after a 401 with a fresh token.
    async fn send<T>(&self, method: Method, url: Url, body: Option<serde_json::Value>) -> Result<T>
    where
        T: DeserializeOwned + Default,
    {
        debug!(%method, %url, "Sending Orka API request");
        let mut response = self.send_once(&method, &url, body.as_ref()).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            warn!(%url, "Orka API returned 401, refreshing token and retrying once");
            self.tokens.invalidate_token();
            response = self.send_once(&method, &url, body.as_ref()).await?;
            if response.status() == StatusCode::UNAUTHORIZED {
                return Err(ClientError::Unauthorized);
            }
        }

        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            let parsed: ErrorBody = serde_json::from_str(&text).unwrap_or_default();
            let mut message = describe(parsed.message.as_deref(), &parsed.errors);
            if message.is_empty() {
                message = if text.trim().is_empty() {
                    status.canonical_reason().unwrap_or("request failed").to_string()
                } else {
                    text
                };
            }
            return Err(ClientError::Api {
                status: status.as_u16(),
                message,
            });
        }

        if text.trim().is_empty() {
            return Ok(T::default());
        }
        Ok(serde_json::from_str(&text)?)
    }
}

#[async_trait]
impl VmApi for OrkaClient {
    #[instrument(skip(self, metadata), fields(namespace = %self.namespace))]
    async fn deploy(
        &self,
        name: &str,
        template: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<DeploymentResponse> {
        let request = DeploymentRequest {
            name,
            vm_config: template,
            custom_metadata: metadata,
        };
        let body = serde_json::to_value(&request)?;
        self.send(Method::POST, self.vms_url()?, Some(body)).await
    }

    async fn get_vm(&self, name: &str) -> Result<VmResponse> {
        let mut url = self.vms_url()?;
        url.query_pairs_mut().append_pair("vmConfig", name);
        self.send(Method::GET, url, None).await
    }

    #[instrument(skip(self), fields(namespace = %self.namespace))]
    async fn delete_vm(&self, id: &str) -> Result<DeletionResponse> {
        let url = self.url(&format!("api/v1/namespaces/{}/vms/{}", self.namespace, id))?;
        self.send(Method::DELETE, url, None).await
    }

    async fn list_nodes(&self) -> Result<NodesResponse> {
        let url = self.url(&format!("api/v1/namespaces/{}/nodes", self.namespace))?;
        self.send(Method::GET, url, None).await
    }

    async fn vm_config(&self, template: &str) -> Result<Option<OrkaVmConfig>> {
        let url = self.url(&format!("api/v1/vmconfigs/{template}"))?;
        match self.send::<VmConfigResponse>(Method::GET, url, None).await {
            Ok(resp) => {
                let mut items = resp.items;
                let position = items.iter().position(|c| c.name == template).unwrap_or(0);
                Ok((position < items.len()).then(|| items.swap_remove(position)))
            }
            Err(ClientError::Api { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
