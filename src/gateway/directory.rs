use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;

use crate::model::{TierKind, TierSnapshot};

use super::GatewayError;

/// Active plan of a member as reported by the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct MemberTier {
    pub kind: TierKind,
    pub hourly_rate: u64,
    #[serde(default)]
    pub free_hours_per_month: u32,
}

impl MemberTier {
    /// Freeze into the form stored on a reservation.
    pub fn snapshot(&self) -> TierSnapshot {
        let free_minutes_per_month = match self.kind {
            TierKind::Quota => self.free_hours_per_month.saturating_mul(60),
            TierKind::NonMember | TierKind::Standard => 0,
        };
        TierSnapshot {
            kind: self.kind,
            hourly_rate: self.hourly_rate,
            free_minutes_per_month,
        }
    }
}

#[async_trait]
pub trait MembershipDirectory: Send + Sync {
    /// `None` means the payer holds no active membership.
    async fn get_active_tier(&self, payer_id: &str) -> Result<Option<MemberTier>, GatewayError>;
}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryLoadError {
    #[error("reading members file: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing members file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("member {0} listed as non_member")]
    NonMemberEntry(String),
}

#[derive(Deserialize)]
struct MembersFile {
    members: Vec<MemberEntry>,
}

#[derive(Deserialize)]
struct MemberEntry {
    payer_id: String,
    #[serde(flatten)]
    tier: MemberTier,
}

/// Directory backed by a fixed member table, optionally loaded from JSON:
///
/// ```json
/// {"members": [{"payer_id": "acme", "kind": "quota", "hourly_rate": 800, "free_hours_per_month": 4}]}
/// ```
#[derive(Default)]
pub struct StaticDirectory {
    members: DashMap<String, MemberTier>,
    unavailable: AtomicBool,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_file(path: &Path) -> Result<Self, DirectoryLoadError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, DirectoryLoadError> {
        let file: MembersFile = serde_json::from_str(raw)?;
        let dir = Self::new();
        for entry in file.members {
            if entry.tier.kind == TierKind::NonMember {
                return Err(DirectoryLoadError::NonMemberEntry(entry.payer_id));
            }
            dir.insert(entry.payer_id, entry.tier);
        }
        Ok(dir)
    }

    pub fn insert(&self, payer_id: impl Into<String>, tier: MemberTier) {
        self.members.insert(payer_id.into(), tier);
    }

    pub fn remove(&self, payer_id: &str) {
        self.members.remove(payer_id);
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }
}

#[async_trait]
impl MembershipDirectory for StaticDirectory {
    async fn get_active_tier(&self, payer_id: &str) -> Result<Option<MemberTier>, GatewayError> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(GatewayError::Unavailable("membership directory offline".into()));
        }
        Ok(self.members.get(payer_id).map(|t| *t))
    }
}
