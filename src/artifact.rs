use eyre::{eyre, Result};
use serde::Deserialize;
use std::{fs, path::Path};

/// Fleet artifact: the startup snapshot of the provider registry plus the
/// collaborator base URLs this node talks to.
///
/// We intentionally keep this loose: extra fields are ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetArtifact {
    /// Discovery service that knows which users live on which nodes.
    pub discovery_provider: String,
    /// Relay that signs and submits replica-set updates to the registry.
    pub registry_relay: String,
    /// Every registered storage node, with its service-provider id.
    pub content_nodes: Vec<ContentNodeEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentNodeEntry {
    pub sp_id: u64,
    pub endpoint: String,
}

impl FleetArtifact {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|e| eyre!("failed to read fleet artifact {}: {e}", path.display()))?;
        let art: FleetArtifact = serde_json::from_str(&raw)
            .map_err(|e| eyre!("failed to parse fleet artifact {}: {e}", path.display()))?;

        if art.discovery_provider.trim().is_empty() {
            return Err(eyre!("fleet artifact discoveryProvider is empty"));
        }
        if art.registry_relay.trim().is_empty() {
            return Err(eyre!("fleet artifact registryRelay is empty"));
        }
        if art.content_nodes.is_empty() {
            // Not strictly invalid, but reconfiguration can never pick a
            // replacement node from an empty table.
            tracing::warn!(
                "fleet artifact lists no content nodes; replica-set repair will have no candidates"
            );
        }

        Ok(art)
    }
}
