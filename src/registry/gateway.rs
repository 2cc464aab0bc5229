//! HTTP/JSON gateway implementation of the registry traits.
//!
//! Routes, relative to `registry.gateway_url`:
//! - `GET /registry/{process_id}/records`   - apex name -> record
//! - `GET /processes/{process_id}/records`  - undername -> record
//! - `GET /processes/{process_id}/owner`    - `{ "owner": "..." }`
//!
//! Every call is bounded by the client's request timeout so a hung upstream
//! eventually fails and frees its executor slot.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::warn;

use crate::config::RegistryConfig;

use super::{
    ApexRecord, ProcessClientFactory, ProcessRecordClient, RegistryClient, UndernameRecord,
};

/// Build the shared HTTP client used by every gateway call.
pub fn build_http_client(config: &RegistryConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("namecache/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .build()
        .context("failed to build reqwest client")
}

async fn get_json<T: DeserializeOwned>(http_client: &reqwest::Client, url: &str) -> Result<T> {
    let resp = http_client
        .get(url)
        .header("Accept", "application/json")
        .send()
        .await
        .with_context(|| format!("gateway request failed: {url}"))?;

    if !resp.status().is_success() {
        let status = resp.status();
        warn!(%url, %status, "gateway returned non-success status");
        anyhow::bail!("gateway returned {status} for {url}");
    }

    resp.json()
        .await
        .with_context(|| format!("failed to parse gateway response from {url}"))
}

fn trim_base(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct GatewayRegistryClient {
    http_client: reqwest::Client,
    base_url: String,
    process_id: String,
}

impl GatewayRegistryClient {
    pub fn new(http_client: reqwest::Client, config: &RegistryConfig) -> Self {
        Self {
            http_client,
            base_url: trim_base(&config.gateway_url),
            process_id: config.process_id.clone(),
        }
    }

    fn records_url(&self) -> String {
        format!("{}/registry/{}/records", self.base_url, self.process_id)
    }
}

#[async_trait::async_trait]
impl RegistryClient for GatewayRegistryClient {
    async fn apex_records(&self) -> Result<HashMap<String, ApexRecord>> {
        get_json(&self.http_client, &self.records_url()).await
    }
}

// ---------------------------------------------------------------------------
// Processes
// ---------------------------------------------------------------------------

pub struct GatewayProcessClient {
    http_client: reqwest::Client,
    base_url: String,
    process_id: String,
}

impl GatewayProcessClient {
    fn url(&self, leaf: &str) -> String {
        format!("{}/processes/{}/{leaf}", self.base_url, self.process_id)
    }
}

#[derive(Debug, Deserialize)]
struct OwnerResponse {
    owner: String,
}

#[async_trait::async_trait]
impl ProcessRecordClient for GatewayProcessClient {
    async fn records(&self) -> Result<HashMap<String, UndernameRecord>> {
        get_json(&self.http_client, &self.url("records")).await
    }

    async fn owner(&self) -> Result<String> {
        let body: OwnerResponse = get_json(&self.http_client, &self.url("owner")).await?;
        Ok(body.owner)
    }
}

/// Hands out [`GatewayProcessClient`]s sharing one connection pool.
pub struct GatewayProcessFactory {
    http_client: reqwest::Client,
    base_url: String,
}

impl GatewayProcessFactory {
    pub fn new(http_client: reqwest::Client, config: &RegistryConfig) -> Self {
        Self {
            http_client,
            base_url: trim_base(&config.gateway_url),
        }
    }
}

impl ProcessClientFactory for GatewayProcessFactory {
    fn client_for(&self, process_id: &str) -> Box<dyn ProcessRecordClient> {
        Box::new(GatewayProcessClient {
            http_client: self.http_client.clone(),
            base_url: self.base_url.clone(),
            process_id: process_id.to_string(),
        })
    }
}
