//! Pending approvals awaiting an operator decision.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

/// Identifier of one unknown-face event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingId(Uuid);

impl PendingId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for PendingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for PendingId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingApproval {
    pub id: PendingId,
    pub image_path: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// In-memory map of pending approvals.
///
/// `remove` is the only way an entry leaves the cache, whether by decision,
/// delivery failure or expiry, so exactly one caller ever owns a resolution.
#[derive(Default)]
pub struct PendingCache {
    entries: Mutex<HashMap<PendingId, PendingApproval>>,
}

impl PendingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, id: PendingId, image_path: PathBuf) {
        let approval = PendingApproval {
            id,
            image_path,
            created_at: Utc::now(),
        };
        self.entries().insert(id, approval);
    }

    pub fn get(&self, id: &PendingId) -> Option<PendingApproval> {
        self.entries().get(id).cloned()
    }

    pub fn remove(&self, id: &PendingId) -> Option<PendingApproval> {
        self.entries().remove(id)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Remove `id` once `retention` has elapsed, unless a decision claimed it first.
    pub fn schedule_expiry(
        self: &Arc<Self>,
        id: PendingId,
        retention: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            if let Some(expired) = cache.remove(&id) {
                tracing::info!(
                    id = %id,
                    created_at = %expired.created_at,
                    "pending approval expired"
                );
            }
        })
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<PendingId, PendingApproval>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}
