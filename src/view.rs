use crate::client::NodeApi;
use crate::providers::Discovery;
use crate::types::{Endpoint, UserRecord};
use eyre::{Result, WrapErr};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// This node's view of its assigned users and their peers.
pub struct PeerSetView {
    discovery: Arc<dyn Discovery>,
    api: Arc<dyn NodeApi>,
    self_endpoint: Endpoint,
    probe_concurrency: usize,
}

impl PeerSetView {
    pub fn new(
        discovery: Arc<dyn Discovery>,
        api: Arc<dyn NodeApi>,
        self_endpoint: Endpoint,
        probe_concurrency: usize,
    ) -> Self {
        Self {
            discovery,
            api,
            self_endpoint,
            probe_concurrency,
        }
    }

    /// Every user whose replica set contains this node. A discovery failure
    /// is fatal for the iteration; there is nothing sound to plan from.
    pub async fn list_users(&self) -> Result<Vec<UserRecord>> {
        self.discovery
            .users_for(&self.self_endpoint)
            .await
            .wrap_err("failed to list users from discovery")
    }

    /// Probe every replica endpoint appearing in `users` (excluding self) and
    /// return the subset that failed. Any transport error or non-2xx counts
    /// as unhealthy for this iteration only.
    pub async fn unhealthy_peers(&self, users: &[UserRecord]) -> HashSet<Endpoint> {
        // BTreeSet for a deterministic probe order.
        let peers: BTreeSet<Endpoint> = users
            .iter()
            .flat_map(|u| u.replicas())
            .filter(|ep| ep.as_str() != self.self_endpoint)
            .cloned()
            .collect();

        let api = &self.api;
        let results: Vec<(Endpoint, bool)> = stream::iter(peers)
            .map(|endpoint| async move {
                match api.check_health(&endpoint).await {
                    Ok(()) => (endpoint, true),
                    Err(err) => {
                        tracing::warn!(peer = %endpoint, error = %err, "peer failed health probe");
                        (endpoint, false)
                    }
                }
            })
            .buffer_unordered(self.probe_concurrency)
            .collect()
            .await;

        results
            .into_iter()
            .filter_map(|(endpoint, healthy)| (!healthy).then_some(endpoint))
            .collect()
    }

    /// One batched clock-status request per target secondary, in parallel.
    /// A single failed batch fails the whole call: planning convergence with
    /// partial clock data risks writing against stale state.
    pub async fn fetch_clock_maps(
        &self,
        wallets_by_secondary: &HashMap<Endpoint, Vec<String>>,
    ) -> Result<HashMap<Endpoint, HashMap<String, u64>>> {
        let api = &self.api;
        let fetches = wallets_by_secondary.iter().map(|(endpoint, wallets)| {
            let endpoint = endpoint.clone();
            async move {
                let clocks = api
                    .batch_clock_status(&endpoint, wallets)
                    .await
                    .wrap_err_with(|| format!("batch clock fetch from {endpoint} failed"))?;
                Ok::<_, eyre::Report>((endpoint, clocks))
            }
        });

        let results = futures::future::try_join_all(fetches).await?;
        Ok(results.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SyncKind;
    use async_trait::async_trait;
    use eyre::eyre;
    use std::sync::Mutex;

    struct ProbeFake {
        down: HashSet<String>,
        probed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl NodeApi for ProbeFake {
        async fn check_health(&self, endpoint: &str) -> Result<()> {
            self.probed.lock().unwrap().push(endpoint.to_string());
            if self.down.contains(endpoint) {
                return Err(eyre!("connection refused"));
            }
            Ok(())
        }

        async fn clock_status(&self, _endpoint: &str, _wallet: &str) -> Result<u64> {
            unimplemented!("not used by these tests")
        }

        async fn batch_clock_status(
            &self,
            endpoint: &str,
            wallets: &[String],
        ) -> Result<HashMap<String, u64>> {
            if self.down.contains(endpoint) {
                return Err(eyre!("connection refused"));
            }
            Ok(wallets.iter().map(|w| (w.clone(), 1)).collect())
        }

        async fn request_sync(
            &self,
            _target: &str,
            _wallet: &str,
            _source: &str,
            _kind: SyncKind,
            _immediate: bool,
        ) -> Result<()> {
            Ok(())
        }
    }

    struct NoDiscovery;

    #[async_trait]
    impl Discovery for NoDiscovery {
        async fn users_for(&self, _endpoint: &str) -> Result<Vec<UserRecord>> {
            Ok(Vec::new())
        }
    }

    fn user(id: u64, p: &str, s1: Option<&str>, s2: Option<&str>) -> UserRecord {
        UserRecord {
            user_id: id,
            wallet: format!("0x{id}"),
            primary: p.to_string(),
            secondary1: s1.map(str::to_string),
            secondary2: s2.map(str::to_string),
        }
    }

    fn view(api: Arc<ProbeFake>) -> PeerSetView {
        PeerSetView::new(Arc::new(NoDiscovery), api, "https://self".to_string(), 4)
    }

    #[tokio::test]
    async fn probes_union_of_peers_excluding_self() {
        let api = Arc::new(ProbeFake {
            down: HashSet::new(),
            probed: Mutex::new(Vec::new()),
        });
        let users = vec![
            user(1, "https://self", Some("https://s1"), Some("https://s2")),
            user(2, "https://p2", Some("https://self"), Some("https://s1")),
        ];
        let unhealthy = view(api.clone()).unhealthy_peers(&users).await;
        assert!(unhealthy.is_empty());

        let mut probed = api.probed.lock().unwrap().clone();
        probed.sort();
        assert_eq!(probed, vec!["https://p2", "https://s1", "https://s2"]);
    }

    #[tokio::test]
    async fn failed_probe_marks_peer_unhealthy() {
        let api = Arc::new(ProbeFake {
            down: HashSet::from(["https://s1".to_string()]),
            probed: Mutex::new(Vec::new()),
        });
        let users = vec![user(1, "https://self", Some("https://s1"), Some("https://s2"))];
        let unhealthy = view(api).unhealthy_peers(&users).await;
        assert_eq!(unhealthy, HashSet::from(["https://s1".to_string()]));
    }

    #[tokio::test]
    async fn one_failed_batch_fails_the_fetch() {
        let api = Arc::new(ProbeFake {
            down: HashSet::from(["https://s2".to_string()]),
            probed: Mutex::new(Vec::new()),
        });
        let mut wanted = HashMap::new();
        wanted.insert("https://s1".to_string(), vec!["0x1".to_string()]);
        wanted.insert("https://s2".to_string(), vec!["0x2".to_string()]);
        assert!(view(api).fetch_clock_maps(&wanted).await.is_err());
    }
}
