//! Collaborator seams and their production implementations.
//!
//! The engine only ever sees the traits; production wiring plugs in the
//! HTTP-backed clients built from the fleet artifact, tests plug in fakes.

use crate::artifact::FleetArtifact;
use crate::client::NodeApi;
use crate::types::{Endpoint, UserRecord};
use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Lists the users whose replica set contains a given node.
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn users_for(&self, endpoint: &str) -> Result<Vec<UserRecord>>;
}

/// A fresh replica-set candidate: one primary and (normally two) secondaries.
#[derive(Debug, Clone)]
pub struct CandidateSet {
    pub primary: Endpoint,
    pub secondaries: Vec<Endpoint>,
}

/// Picks replacement nodes for a degraded replica set. Geographic spread and
/// tie-breaking live behind this seam.
#[async_trait]
pub trait Selection: Send + Sync {
    async fn auto_select(&self, blacklist: &[Endpoint]) -> Result<CandidateSet>;
}

/// Writes the authoritative replica-set assignment for a user.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn update_replica_set(
        &self,
        user_id: u64,
        primary_sp_id: u64,
        secondary_sp_ids: &[u64],
    ) -> Result<()>;
}

/// This node's own clock records.
#[async_trait]
pub trait LocalClockStore: Send + Sync {
    async fn clock_for(&self, wallet: &str) -> Result<u64>;
    async fn clocks_for(&self, wallets: &[String]) -> Result<HashMap<String, u64>>;
}

/// Endpoint-to-service-provider-id map. Populated once at startup from the
/// fleet artifact and read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct SpIdMap {
    inner: HashMap<Endpoint, u64>,
}

impl SpIdMap {
    pub fn from_artifact(artifact: &FleetArtifact) -> Self {
        Self {
            inner: artifact
                .content_nodes
                .iter()
                .map(|n| (n.endpoint.trim_end_matches('/').to_string(), n.sp_id))
                .collect(),
        }
    }

    pub fn sp_id(&self, endpoint: &str) -> Option<u64> {
        self.inner.get(endpoint.trim_end_matches('/')).copied()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[derive(Deserialize)]
struct UsersResponse {
    data: UsersData,
}

#[derive(Deserialize)]
struct UsersData {
    users: Vec<UserRecord>,
}

/// Discovery over the discovery provider's HTTP API.
#[derive(Debug, Clone)]
pub struct HttpDiscovery {
    base: String,
    http: reqwest::Client,
}

impl HttpDiscovery {
    pub fn new(base: String, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .wrap_err("failed to build discovery http client")?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            http,
        })
    }
}

#[async_trait]
impl Discovery for HttpDiscovery {
    async fn users_for(&self, endpoint: &str) -> Result<Vec<UserRecord>> {
        let url = format!("{}/users/assigned", self.base);
        let resp = self
            .http
            .get(&url)
            .query(&[("creator_node_endpoint", endpoint)])
            .send()
            .await
            .wrap_err_with(|| format!("GET {url} failed"))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(eyre!("discovery {url} returned HTTP {status}"));
        }
        let body: UsersResponse = resp
            .json()
            .await
            .wrap_err_with(|| format!("failed to decode user list from {url}"))?;
        Ok(body.data.users)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReplicaSetUpdateBody<'a> {
    user_id: u64,
    primary_sp_id: u64,
    secondary_sp_ids: &'a [u64],
}

/// Registry writes via the relay service that holds the signing keys.
#[derive(Debug, Clone)]
pub struct HttpRegistryRelay {
    base: String,
    http: reqwest::Client,
}

impl HttpRegistryRelay {
    pub fn new(base: String, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .wrap_err("failed to build registry relay http client")?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            http,
        })
    }
}

#[async_trait]
impl Registry for HttpRegistryRelay {
    async fn update_replica_set(
        &self,
        user_id: u64,
        primary_sp_id: u64,
        secondary_sp_ids: &[u64],
    ) -> Result<()> {
        let url = format!("{}/replica_set/update", self.base);
        let resp = self
            .http
            .post(&url)
            .json(&ReplicaSetUpdateBody {
                user_id,
                primary_sp_id,
                secondary_sp_ids,
            })
            .send()
            .await
            .wrap_err_with(|| format!("POST {url} failed"))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(eyre!("registry relay {url} returned HTTP {status}"));
        }
        Ok(())
    }
}

/// Selection over the artifact's node table: drop blacklisted endpoints,
/// shuffle the rest, take three.
#[derive(Debug, Clone)]
pub struct ShuffleSelection {
    nodes: Vec<Endpoint>,
}

impl ShuffleSelection {
    pub fn new(nodes: Vec<Endpoint>) -> Self {
        Self {
            nodes: nodes
                .into_iter()
                .map(|n| n.trim_end_matches('/').to_string())
                .collect(),
        }
    }
}

#[async_trait]
impl Selection for ShuffleSelection {
    async fn auto_select(&self, blacklist: &[Endpoint]) -> Result<CandidateSet> {
        let mut pool: Vec<Endpoint> = self
            .nodes
            .iter()
            .filter(|n| !blacklist.iter().any(|b| b.trim_end_matches('/') == n.as_str()))
            .cloned()
            .collect();
        if pool.len() < 3 {
            return Err(eyre!(
                "only {} candidate nodes outside the blacklist; need 3",
                pool.len()
            ));
        }
        pool.shuffle(&mut rand::thread_rng());
        let mut picked = pool.into_iter();
        let primary = picked.next().ok_or_else(|| eyre!("empty candidate pool"))?;
        let secondaries: Vec<Endpoint> = picked.take(2).collect();
        Ok(CandidateSet { primary, secondaries })
    }
}

/// Local clock store backed by this node's own clock endpoints. The engine
/// runs beside the storage server, so "local" reads go over loopback HTTP.
pub struct SelfClockStore {
    api: Arc<dyn NodeApi>,
    endpoint: String,
}

impl SelfClockStore {
    pub fn new(api: Arc<dyn NodeApi>, endpoint: String) -> Self {
        Self { api, endpoint }
    }
}

#[async_trait]
impl LocalClockStore for SelfClockStore {
    async fn clock_for(&self, wallet: &str) -> Result<u64> {
        self.api.clock_status(&self.endpoint, wallet).await
    }

    async fn clocks_for(&self, wallets: &[String]) -> Result<HashMap<String, u64>> {
        self.api.batch_clock_status(&self.endpoint, wallets).await
    }
}
