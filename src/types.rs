use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Absolute base URL of a storage node, e.g. `https://cn1.example.com`.
///
/// Endpoints compare byte-for-byte; callers normalize trailing slashes at the
/// configuration boundary.
pub type Endpoint = String;

/// Which queue a sync job belongs to.
///
/// Serializes as the wire-level `sync_type` values (`"MANUAL"` / `"RECURRING"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncKind {
    /// Urgent push, typically seeding a freshly chosen replica.
    Manual,
    /// Periodic convergence push from the hourly scan.
    Recurring,
}

impl SyncKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncKind::Manual => "MANUAL",
            SyncKind::Recurring => "RECURRING",
        }
    }
}

impl std::fmt::Display for SyncKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One user as reported by discovery: wallet plus assigned replica set.
///
/// Secondaries may be absent while a replica set is still being filled in;
/// an absent slot is "not a peer", never "an unhealthy peer".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub user_id: u64,
    pub wallet: String,
    pub primary: Endpoint,
    #[serde(default)]
    pub secondary1: Option<Endpoint>,
    #[serde(default)]
    pub secondary2: Option<Endpoint>,
}

impl UserRecord {
    /// Present secondaries, in slot order.
    pub fn secondaries(&self) -> impl Iterator<Item = &Endpoint> {
        self.secondary1.iter().chain(self.secondary2.iter())
    }

    /// Present replicas in `(primary, secondary1, secondary2)` order.
    pub fn replicas(&self) -> impl Iterator<Item = &Endpoint> {
        std::iter::once(&self.primary).chain(self.secondaries())
    }
}

/// De-duplication key: at most one *pending* job may exist per fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub kind: SyncKind,
    pub wallet: String,
    pub target: Endpoint,
}

/// A queued sync request. Concrete and typed; the HTTP layer turns it into
/// the wire body when the job runs.
#[derive(Debug, Clone)]
pub struct SyncJob {
    pub kind: SyncKind,
    pub wallet: String,
    /// Node the target should pull from (the authoritative copy).
    pub source: Endpoint,
    pub target: Endpoint,
    pub immediate: bool,
    pub enqueued_at: Instant,
}

impl SyncJob {
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            kind: self.kind,
            wallet: self.wallet.clone(),
            target: self.target.clone(),
        }
    }
}

/// Handle to a pending sync job.
///
/// Handles are cheap to clone; two handles compare equal iff they denote the
/// same pending job, so re-enqueueing a still-pending fingerprint hands the
/// caller back the original.
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub id: u64,
    pub job: Arc<SyncJob>,
}

impl PartialEq for JobHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for JobHandle {}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: u64, wallet: &str, p: &str, s1: Option<&str>, s2: Option<&str>) -> UserRecord {
        UserRecord {
            user_id: id,
            wallet: wallet.to_string(),
            primary: p.to_string(),
            secondary1: s1.map(str::to_string),
            secondary2: s2.map(str::to_string),
        }
    }

    #[test]
    fn replicas_skip_absent_slots() {
        let u = user(7, "0xabc", "https://p", None, Some("https://s2"));
        let reps: Vec<&str> = u.replicas().map(String::as_str).collect();
        assert_eq!(reps, vec!["https://p", "https://s2"]);
    }

    #[test]
    fn sync_kind_wire_names() {
        assert_eq!(SyncKind::Manual.as_str(), "MANUAL");
        assert_eq!(SyncKind::Recurring.as_str(), "RECURRING");
        let json = serde_json::to_string(&SyncKind::Recurring).unwrap();
        assert_eq!(json, "\"RECURRING\"");
    }

    #[test]
    fn user_record_wire_shape_is_camel_case() {
        let raw = r#"{"userId":3,"wallet":"0xw","primary":"https://p","secondary1":"https://s1"}"#;
        let u: UserRecord = serde_json::from_str(raw).unwrap();
        assert_eq!(u.user_id, 3);
        assert_eq!(u.secondary1.as_deref(), Some("https://s1"));
        assert!(u.secondary2.is_none());
    }
}
