//! frps admin-API client
//!
//! Thin wrapper over the daemon's web server with Basic auth. Byte-level
//! traffic accounting lives behind this API, the control plane only proxies
//! queries through.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use crate::config::FrpsConfig;

const ADMIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Subset of `GET /api/serverinfo` the bot surfaces.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonInfo {
    #[serde(default)]
    pub version: String,
    #[serde(rename = "curConns", default)]
    pub current_connections: i64,
    #[serde(rename = "clientCounts", default)]
    pub client_counts: i64,
    #[serde(rename = "proxyTypeCount", default)]
    pub proxy_type_count: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyTraffic {
    #[serde(rename = "trafficIn", default)]
    pub traffic_in: Vec<i64>,
    #[serde(rename = "trafficOut", default)]
    pub traffic_out: Vec<i64>,
}

pub struct FrpsAdminClient {
    base_url: String,
    user: String,
    password: String,
    client: reqwest::Client,
}

impl FrpsAdminClient {
    pub fn new(frps: &FrpsConfig) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(ADMIN_TIMEOUT).build()?;
        Ok(Self {
            base_url: format!("http://{}:{}", frps.admin_addr, frps.admin_port),
            user: frps.admin_user.clone(),
            password: frps.admin_password.clone(),
            client,
        })
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(anyhow!("admin API {} returned {}", path, response.status()));
        }
        Ok(response)
    }

    /// `GET /api/serverinfo`
    pub async fn server_info(&self) -> Result<DaemonInfo> {
        Ok(self.get("/api/serverinfo").await?.json().await?)
    }

    /// `GET /api/serverinfo`, reachable at all — used as the readiness probe.
    pub async fn is_ready(&self) -> bool {
        self.get("/api/serverinfo").await.is_ok()
    }

    /// `GET /api/proxy/tcp`
    pub async fn list_tcp_proxies(&self) -> Result<Value> {
        Ok(self.get("/api/proxy/tcp").await?.json().await?)
    }

    /// `GET /api/proxy/tcp/:name`
    pub async fn tcp_proxy(&self, name: &str) -> Result<Value> {
        Ok(self
            .get(&format!("/api/proxy/tcp/{}", name))
            .await?
            .json()
            .await?)
    }

    /// `GET /api/traffic/:name`
    pub async fn proxy_traffic(&self, name: &str) -> Result<ProxyTraffic> {
        Ok(self
            .get(&format!("/api/traffic/{}", name))
            .await?
            .json()
            .await?)
    }
}
