use crate::types::SyncKind;
use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Remote storage-node API used by probing, convergence syncs, and sync
/// monitoring. Object-safe so tests can substitute in-process fakes.
#[async_trait]
pub trait NodeApi: Send + Sync {
    /// Health probe. Any transport failure or non-2xx is an error; the caller
    /// downgrades it to "unhealthy for this iteration".
    async fn check_health(&self, endpoint: &str) -> Result<()>;

    /// The peer's clock for one wallet.
    async fn clock_status(&self, endpoint: &str, wallet: &str) -> Result<u64>;

    /// The peer's clocks for a batch of wallets. Wallets the peer has never
    /// seen are simply absent from the result.
    async fn batch_clock_status(
        &self,
        endpoint: &str,
        wallets: &[String],
    ) -> Result<HashMap<String, u64>>;

    /// Ask `target` to sync one wallet from `source`.
    async fn request_sync(
        &self,
        target: &str,
        wallet: &str,
        source: &str,
        kind: SyncKind,
        immediate: bool,
    ) -> Result<()>;
}

#[derive(Serialize)]
struct SyncBody<'a> {
    wallet: [&'a str; 1],
    creator_node_endpoint: &'a str,
    sync_type: &'a str,
    immediate: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchClockBody<'a> {
    wallet_public_keys: &'a [String],
}

#[derive(Deserialize)]
struct BatchClockResponse {
    data: BatchClockData,
}

#[derive(Deserialize)]
struct BatchClockData {
    users: Vec<WalletClock>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WalletClock {
    wallet_public_key: String,
    clock: u64,
}

#[derive(Deserialize)]
struct ClockStatusResponse {
    data: ClockStatusData,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClockStatusData {
    clock_value: u64,
}

/// Production `NodeApi` over one shared HTTP client.
#[derive(Debug, Clone)]
pub struct HttpNodeApi {
    http: reqwest::Client,
}

impl HttpNodeApi {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .wrap_err("failed to build http client")?;
        Ok(Self { http })
    }
}

fn join(base: &str, path: &str) -> String {
    format!("{}{path}", base.trim_end_matches('/'))
}

#[async_trait]
impl NodeApi for HttpNodeApi {
    async fn check_health(&self, endpoint: &str) -> Result<()> {
        let url = join(endpoint, "/health_check");
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .wrap_err_with(|| format!("GET {url} failed"))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(eyre!("health check {url} returned HTTP {status}"));
        }
        Ok(())
    }

    async fn clock_status(&self, endpoint: &str, wallet: &str) -> Result<u64> {
        let url = join(endpoint, &format!("/users/clock_status/{wallet}"));
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .wrap_err_with(|| format!("GET {url} failed"))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(eyre!("clock status {url} returned HTTP {status}"));
        }
        let body: ClockStatusResponse = resp
            .json()
            .await
            .wrap_err_with(|| format!("failed to decode clock status from {url}"))?;
        Ok(body.data.clock_value)
    }

    async fn batch_clock_status(
        &self,
        endpoint: &str,
        wallets: &[String],
    ) -> Result<HashMap<String, u64>> {
        let url = join(endpoint, "/users/batch_clock_status");
        let resp = self
            .http
            .post(&url)
            .json(&BatchClockBody {
                wallet_public_keys: wallets,
            })
            .send()
            .await
            .wrap_err_with(|| format!("POST {url} failed"))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(eyre!("batch clock status {url} returned HTTP {status}"));
        }
        let body: BatchClockResponse = resp
            .json()
            .await
            .wrap_err_with(|| format!("failed to decode batch clock status from {url}"))?;
        Ok(body
            .data
            .users
            .into_iter()
            .map(|u| (u.wallet_public_key, u.clock))
            .collect())
    }

    async fn request_sync(
        &self,
        target: &str,
        wallet: &str,
        source: &str,
        kind: SyncKind,
        immediate: bool,
    ) -> Result<()> {
        let url = join(target, "/sync");
        let resp = self
            .http
            .post(&url)
            .json(&SyncBody {
                wallet: [wallet],
                creator_node_endpoint: source,
                sync_type: kind.as_str(),
                immediate,
            })
            .send()
            .await
            .wrap_err_with(|| format!("POST {url} failed"))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(eyre!("sync request {url} returned HTTP {status}"));
        }
        Ok(())
    }
}
