use std::time::Duration;

use anyhow::{Context, Result, anyhow};

use crate::model::{CompileMeta, Cluster, Tenant};

/// User agent for Lieutenant requests.
pub const USER_AGENT: &str = concat!("commodore/", env!("CARGO_PKG_VERSION"));

/// Lieutenant cluster/tenant metadata client.
#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: String,
    token: Option<String>,
    client: reqwest::blocking::Client,
}

impl ApiClient {
    /// Create a client for the given base URL. All requests honor
    /// `timeout` (the configured Lieutenant request timeout, default 5s).
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            client,
        })
    }

    fn get(&self, path: &str) -> reqwest::blocking::RequestBuilder {
        let mut req = self.client.get(format!("{}{}", self.base_url, path));
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        req
    }

    /// Fetch one cluster's descriptor.
    pub fn cluster(&self, cluster_id: &str) -> Result<Cluster> {
        let response = self
            .get(&format!("/clusters/{cluster_id}"))
            .send()
            .context("failed to query Lieutenant for the cluster")?;
        match response.status() {
            reqwest::StatusCode::OK => response
                .json::<Cluster>()
                .context("failed to parse cluster response"),
            reqwest::StatusCode::NOT_FOUND => {
                Err(anyhow!("cluster `{cluster_id}` not found on Lieutenant"))
            }
            status => Err(anyhow!("unexpected status code from Lieutenant: {status}")),
        }
    }

    /// Fetch one tenant's metadata.
    pub fn tenant(&self, tenant_id: &str) -> Result<Tenant> {
        let response = self
            .get(&format!("/tenants/{tenant_id}"))
            .send()
            .context("failed to query Lieutenant for the tenant")?;
        match response.status() {
            reqwest::StatusCode::OK => response
                .json::<Tenant>()
                .context("failed to parse tenant response"),
            reqwest::StatusCode::NOT_FOUND => {
                Err(anyhow!("tenant `{tenant_id}` not found on Lieutenant"))
            }
            status => Err(anyhow!("unexpected status code from Lieutenant: {status}")),
        }
    }

    /// List all clusters (`catalog list`).
    pub fn clusters(&self) -> Result<Vec<Cluster>> {
        let response = self
            .get("/clusters")
            .send()
            .context("failed to query Lieutenant for clusters")?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "unexpected status code from Lieutenant: {}",
                response.status()
            ));
        }
        response
            .json::<Vec<Cluster>>()
            .context("failed to parse clusters response")
    }

    /// Report compile metadata after a successful push. The endpoint is
    /// optional; a 404 means this Lieutenant does not record it.
    pub fn report_compile_meta(&self, cluster_id: &str, meta: &CompileMeta) -> Result<bool> {
        let mut req = self
            .client
            .post(format!("{}/clusters/{cluster_id}/compile-meta", self.base_url))
            .json(meta);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let response = req.send().context("failed to report compile metadata")?;
        match response.status() {
            reqwest::StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(anyhow!(
                "unexpected status code reporting compile metadata: {status}"
            )),
        }
    }
}
