use crate::types::AgentId;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use weft_core::WeftError;

/// How long a released lock stays queryable before the sweep drops it.
pub const RELEASED_RETENTION_SECS: i64 = 3600;

/// Source of "now" for expiry checks.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Lifecycle of a resource lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockStatus {
    Active,
    Released,
}

/// Ownership of one external resource by one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLock {
    pub lock_uuid: Uuid,
    pub resource_type: String,
    pub resource_id: String,
    pub owner_agent_id: AgentId,
    /// Starts at 1, incremented by every renewal.
    pub version: u64,
    pub content_hash: Option<String>,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: LockStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released_at: Option<DateTime<Utc>>,
}

impl ResourceLock {
    /// Active and not yet past its expiry.
    pub fn is_held(&self, now: DateTime<Utc>) -> bool {
        self.status == LockStatus::Active && now < self.expires_at
    }
}

/// Parameters of an acquire call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRequest {
    pub resource_type: String,
    pub resource_id: String,
    pub owner_agent_id: AgentId,
    pub ttl_secs: u64,
    #[serde(default)]
    pub content_hash: Option<String>,
}

impl LockRequest {
    pub fn new(
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        owner: impl Into<String>,
        ttl_secs: u64,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            owner_agent_id: owner.into(),
            ttl_secs,
            content_hash: None,
        }
    }

    pub fn with_content_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }
}

/// Structured lock failures. Never retried by the manager itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    #[error("resource {resource_type}/{resource_id} is locked by {holder} until {expires_at}")]
    Conflict {
        resource_type: String,
        resource_id: String,
        holder: AgentId,
        lock_uuid: Uuid,
        expires_at: DateTime<Utc>,
    },
    #[error("lock {lock_uuid} is owned by {owner}, not {requester}")]
    NotOwner {
        lock_uuid: Uuid,
        owner: AgentId,
        requester: AgentId,
    },
    #[error("lock {0} not found")]
    NotFound(Uuid),
    #[error("invalid lock request: {0}")]
    Invalid(String),
}

impl From<LockError> for WeftError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Conflict { .. } => WeftError::Conflict(err.to_string()),
            LockError::NotOwner { .. } => WeftError::Forbidden(err.to_string()),
            LockError::NotFound(_) => WeftError::NotFound(err.to_string()),
            LockError::Invalid(_) => WeftError::Validation(err.to_string()),
        }
    }
}

/// SHA-256 hex digest of a resource's content, for drift detection.
pub fn content_hash(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

#[derive(Default)]
struct LockTable {
    locks: HashMap<Uuid, ResourceLock>,
    active: HashMap<(String, String), Uuid>,
}

/// Grants exclusive, expiring ownership of named external resources.
///
/// Acquisition never blocks: a held resource yields [`LockError::Conflict`]
/// and the caller decides when to try again.
pub struct LockManager {
    table: Mutex<LockTable>,
    clock: Clock,
}

impl LockManager {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(Utc::now))
    }

    /// Use a custom clock (tests drive expiry this way).
    pub fn with_clock(clock: Clock) -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            clock,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Acquire or renew a lock.
    ///
    /// - free resource (or only an expired lock): new lock at version 1
    /// - held by the requester: version bumped, expiry refreshed
    /// - held by someone else: conflict
    pub fn acquire(&self, request: LockRequest) -> Result<ResourceLock, LockError> {
        if request.resource_type.is_empty() || request.resource_id.is_empty() {
            return Err(LockError::Invalid(
                "resource_type and resource_id are required".to_string(),
            ));
        }
        if request.owner_agent_id.is_empty() {
            return Err(LockError::Invalid("owner_agent_id is required".to_string()));
        }
        let ttl_secs = i64::try_from(request.ttl_secs)
            .map_err(|_| LockError::Invalid(format!("ttl {} is too large", request.ttl_secs)))?;
        if ttl_secs == 0 {
            return Err(LockError::Invalid("ttl must be positive".to_string()));
        }

        let now = self.now();
        let expires_at = Duration::try_seconds(ttl_secs)
            .and_then(|ttl| now.checked_add_signed(ttl))
            .ok_or_else(|| LockError::Invalid(format!("ttl {ttl_secs} is out of range")))?;
        let key = (request.resource_type.clone(), request.resource_id.clone());
        let mut table = self.table.lock();

        if let Some(existing_id) = table.active.get(&key).copied() {
            let existing = table
                .locks
                .get_mut(&existing_id)
                .ok_or(LockError::NotFound(existing_id))?;

            if existing.is_held(now) {
                if existing.owner_agent_id != request.owner_agent_id {
                    warn!(
                        resource_type = %existing.resource_type,
                        resource_id = %existing.resource_id,
                        holder = %existing.owner_agent_id,
                        requester = %request.owner_agent_id,
                        "Lock conflict"
                    );
                    return Err(LockError::Conflict {
                        resource_type: existing.resource_type.clone(),
                        resource_id: existing.resource_id.clone(),
                        holder: existing.owner_agent_id.clone(),
                        lock_uuid: existing.lock_uuid,
                        expires_at: existing.expires_at,
                    });
                }

                existing.version += 1;
                existing.expires_at = expires_at;
                if request.content_hash.is_some() {
                    existing.content_hash = request.content_hash;
                }
                debug!(
                    lock_uuid = %existing.lock_uuid,
                    version = existing.version,
                    "Lock renewed"
                );
                return Ok(existing.clone());
            }

            // Expired but never swept: retire it before granting a new lock.
            existing.status = LockStatus::Released;
            existing.released_at = Some(now);
            table.active.remove(&key);
        }

        let lock = ResourceLock {
            lock_uuid: Uuid::new_v4(),
            resource_type: request.resource_type,
            resource_id: request.resource_id,
            owner_agent_id: request.owner_agent_id,
            version: 1,
            content_hash: request.content_hash,
            acquired_at: now,
            expires_at,
            status: LockStatus::Active,
            released_at: None,
        };
        info!(
            lock_uuid = %lock.lock_uuid,
            resource_type = %lock.resource_type,
            resource_id = %lock.resource_id,
            owner = %lock.owner_agent_id,
            "Lock acquired"
        );
        table.active.insert(key, lock.lock_uuid);
        table.locks.insert(lock.lock_uuid, lock.clone());
        Ok(lock)
    }

    /// Release a lock. Only the owner may release; releasing twice is a no-op.
    pub fn release(&self, lock_uuid: Uuid, owner: &str) -> Result<ResourceLock, LockError> {
        let now = self.now();
        let mut table = self.table.lock();
        let lock = table
            .locks
            .get_mut(&lock_uuid)
            .ok_or(LockError::NotFound(lock_uuid))?;

        if lock.owner_agent_id != owner {
            return Err(LockError::NotOwner {
                lock_uuid,
                owner: lock.owner_agent_id.clone(),
                requester: owner.to_string(),
            });
        }
        if lock.status == LockStatus::Released {
            return Ok(lock.clone());
        }

        lock.status = LockStatus::Released;
        lock.released_at = Some(now);
        let released = lock.clone();
        let key = (released.resource_type.clone(), released.resource_id.clone());
        if table.active.get(&key) == Some(&lock_uuid) {
            table.active.remove(&key);
        }
        info!(lock_uuid = %lock_uuid, owner = %owner, "Lock released");
        Ok(released)
    }

    /// Whether the resource content changed since the lock last recorded a hash.
    ///
    /// Ownership is irrelevant here. A lock without a stored hash never reports
    /// a conflict.
    pub fn detect_conflict(&self, lock_uuid: Uuid, current_hash: &str) -> Result<bool, LockError> {
        let table = self.table.lock();
        let lock = table
            .locks
            .get(&lock_uuid)
            .ok_or(LockError::NotFound(lock_uuid))?;
        Ok(lock
            .content_hash
            .as_deref()
            .is_some_and(|stored| stored != current_hash))
    }

    pub fn get(&self, lock_uuid: Uuid) -> Option<ResourceLock> {
        self.table.lock().locks.get(&lock_uuid).cloned()
    }

    /// The lock currently holding a resource, ignoring expired ones.
    pub fn active_lock(&self, resource_type: &str, resource_id: &str) -> Option<ResourceLock> {
        let now = self.now();
        let table = self.table.lock();
        let id = table
            .active
            .get(&(resource_type.to_string(), resource_id.to_string()))?;
        table.locks.get(id).filter(|l| l.is_held(now)).cloned()
    }

    /// Mark every expired active lock released and drop locks released more
    /// than [`RELEASED_RETENTION_SECS`] ago. Returns how many were swept.
    pub fn sweep_expired(&self) -> usize {
        let now = self.now();
        let mut table = self.table.lock();
        let LockTable { locks, active } = &mut *table;
        let mut swept = 0;
        active.retain(|_, id| match locks.get_mut(id) {
            Some(lock) if lock.status == LockStatus::Active && now >= lock.expires_at => {
                lock.status = LockStatus::Released;
                lock.released_at = Some(now);
                swept += 1;
                false
            }
            Some(_) => true,
            None => false,
        });

        let retention = Duration::seconds(RELEASED_RETENTION_SECS);
        let before = locks.len();
        locks.retain(|_, lock| {
            lock.status == LockStatus::Active
                || lock.released_at.map_or(true, |at| now - at < retention)
        });
        let pruned = before - locks.len();

        if swept > 0 {
            info!(swept, "Expired locks swept");
        }
        if pruned > 0 {
            debug!(pruned, "Released locks pruned");
        }
        swept
    }

    /// Locks currently held by an agent.
    pub fn held_by(&self, owner: &str) -> Vec<ResourceLock> {
        let now = self.now();
        let table = self.table.lock();
        table
            .locks
            .values()
            .filter(|l| l.owner_agent_id == owner && l.is_held(now))
            .cloned()
            .collect()
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    /// Clock that only moves when told to.
    fn manual_clock() -> (Clock, Arc<AtomicI64>) {
        let offset = Arc::new(AtomicI64::new(0));
        let base = Utc::now();
        let handle = offset.clone();
        let clock: Clock =
            Arc::new(move || base + Duration::seconds(handle.load(Ordering::SeqCst)));
        (clock, offset)
    }

    #[test]
    fn test_acquire_free_resource() {
        let locks = LockManager::new();
        let lock = locks
            .acquire(LockRequest::new("file", "src/main.rs", "agent-a", 60))
            .unwrap();
        assert_eq!(lock.version, 1);
        assert_eq!(lock.status, LockStatus::Active);
        assert_eq!(
            locks.active_lock("file", "src/main.rs").unwrap().lock_uuid,
            lock.lock_uuid
        );
    }

    #[test]
    fn test_conflict_for_different_owner() {
        let locks = LockManager::new();
        let held = locks
            .acquire(LockRequest::new("file", "a.txt", "agent-a", 60))
            .unwrap();
        let err = locks
            .acquire(LockRequest::new("file", "a.txt", "agent-b", 60))
            .unwrap_err();
        match err {
            LockError::Conflict {
                holder, lock_uuid, ..
            } => {
                assert_eq!(holder, "agent-a");
                assert_eq!(lock_uuid, held.lock_uuid);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn test_reacquire_by_owner_bumps_version() {
        let (clock, offset) = manual_clock();
        let locks = LockManager::with_clock(clock);
        let first = locks
            .acquire(LockRequest::new("row", "users/1", "agent-a", 30))
            .unwrap();
        offset.store(10, Ordering::SeqCst);
        let second = locks
            .acquire(LockRequest::new("row", "users/1", "agent-a", 30))
            .unwrap();
        assert_eq!(second.lock_uuid, first.lock_uuid);
        assert_eq!(second.version, 2);
        assert!(second.expires_at > first.expires_at);
        let third = locks
            .acquire(LockRequest::new("row", "users/1", "agent-a", 30))
            .unwrap();
        assert_eq!(third.version, 3);
    }

    #[test]
    fn test_expired_lock_is_inactive_before_sweep() {
        let (clock, offset) = manual_clock();
        let locks = LockManager::with_clock(clock);
        let old = locks
            .acquire(LockRequest::new("api", "billing", "agent-a", 5))
            .unwrap();
        offset.store(6, Ordering::SeqCst);
        assert!(locks.active_lock("api", "billing").is_none());

        let fresh = locks
            .acquire(LockRequest::new("api", "billing", "agent-b", 5))
            .unwrap();
        assert_ne!(fresh.lock_uuid, old.lock_uuid);
        assert_eq!(fresh.version, 1);
        assert_eq!(locks.get(old.lock_uuid).unwrap().status, LockStatus::Released);
    }

    #[test]
    fn test_release_requires_owner() {
        let locks = LockManager::new();
        let lock = locks
            .acquire(LockRequest::new("file", "b.txt", "agent-a", 60))
            .unwrap();
        let err = locks.release(lock.lock_uuid, "agent-b").unwrap_err();
        assert!(matches!(err, LockError::NotOwner { .. }));

        let released = locks.release(lock.lock_uuid, "agent-a").unwrap();
        assert_eq!(released.status, LockStatus::Released);
        assert!(locks.active_lock("file", "b.txt").is_none());

        // Idempotent.
        assert!(locks.release(lock.lock_uuid, "agent-a").is_ok());

        // Resource is free again.
        let next = locks
            .acquire(LockRequest::new("file", "b.txt", "agent-b", 60))
            .unwrap();
        assert_eq!(next.version, 1);
    }

    #[test]
    fn test_release_unknown_lock() {
        let locks = LockManager::new();
        let err = locks.release(Uuid::new_v4(), "agent-a").unwrap_err();
        assert!(matches!(err, LockError::NotFound(_)));
    }

    #[test]
    fn test_detect_conflict_on_hash_drift() {
        let locks = LockManager::new();
        let original = content_hash(b"version one");
        let lock = locks
            .acquire(
                LockRequest::new("file", "c.txt", "agent-a", 60).with_content_hash(&original),
            )
            .unwrap();
        assert!(!locks.detect_conflict(lock.lock_uuid, &original).unwrap());
        assert!(locks
            .detect_conflict(lock.lock_uuid, &content_hash(b"version two"))
            .unwrap());
    }

    #[test]
    fn test_renewal_replaces_hash() {
        let locks = LockManager::new();
        let lock = locks
            .acquire(LockRequest::new("file", "d.txt", "agent-a", 60).with_content_hash("aaa"))
            .unwrap();
        locks
            .acquire(LockRequest::new("file", "d.txt", "agent-a", 60).with_content_hash("bbb"))
            .unwrap();
        assert!(!locks.detect_conflict(lock.lock_uuid, "bbb").unwrap());
        assert!(locks.detect_conflict(lock.lock_uuid, "aaa").unwrap());

        // Renewal without a hash keeps the stored one.
        locks
            .acquire(LockRequest::new("file", "d.txt", "agent-a", 60))
            .unwrap();
        assert!(!locks.detect_conflict(lock.lock_uuid, "bbb").unwrap());
    }

    #[test]
    fn test_no_stored_hash_never_conflicts() {
        let locks = LockManager::new();
        let lock = locks
            .acquire(LockRequest::new("file", "e.txt", "agent-a", 60))
            .unwrap();
        assert!(!locks.detect_conflict(lock.lock_uuid, "anything").unwrap());
    }

    #[test]
    fn test_sweep_expired() {
        let (clock, offset) = manual_clock();
        let locks = LockManager::with_clock(clock);
        locks
            .acquire(LockRequest::new("file", "short", "agent-a", 1))
            .unwrap();
        locks
            .acquire(LockRequest::new("file", "long", "agent-a", 100))
            .unwrap();
        offset.store(2, Ordering::SeqCst);
        assert_eq!(locks.sweep_expired(), 1);
        assert_eq!(locks.held_by("agent-a").len(), 1);
        assert_eq!(locks.sweep_expired(), 0);
    }

    #[test]
    fn test_sweep_prunes_old_released_locks() {
        let (clock, offset) = manual_clock();
        let locks = LockManager::with_clock(clock);
        let released = locks
            .acquire(LockRequest::new("file", "done", "agent-a", 60))
            .unwrap();
        locks.release(released.lock_uuid, "agent-a").unwrap();
        let expired = locks
            .acquire(LockRequest::new("file", "stale", "agent-a", 1))
            .unwrap();
        let held = locks
            .acquire(LockRequest::new("file", "kept", "agent-b", 100_000))
            .unwrap();

        offset.store(2, Ordering::SeqCst);
        assert_eq!(locks.sweep_expired(), 1);
        assert!(locks.get(released.lock_uuid).is_some());
        assert_eq!(locks.get(expired.lock_uuid).unwrap().status, LockStatus::Released);

        offset.store(RELEASED_RETENTION_SECS + 1, Ordering::SeqCst);
        locks.sweep_expired();
        assert!(locks.get(released.lock_uuid).is_none());
        assert!(locks.get(expired.lock_uuid).is_some());

        offset.store(RELEASED_RETENTION_SECS + 3, Ordering::SeqCst);
        locks.sweep_expired();
        assert!(locks.get(expired.lock_uuid).is_none());
        assert_eq!(locks.get(held.lock_uuid).unwrap().status, LockStatus::Active);
    }

    #[test]
    fn test_invalid_requests() {
        let locks = LockManager::new();
        assert!(matches!(
            locks.acquire(LockRequest::new("", "x", "a", 10)),
            Err(LockError::Invalid(_))
        ));
        assert!(matches!(
            locks.acquire(LockRequest::new("file", "x", "a", 0)),
            Err(LockError::Invalid(_))
        ));
        assert!(matches!(
            locks.acquire(LockRequest::new("file", "x", "agent-a", i64::MAX as u64)),
            Err(LockError::Invalid(_))
        ));
        assert!(matches!(
            locks.acquire(LockRequest::new("file", "x", "agent-a", u64::MAX)),
            Err(LockError::Invalid(_))
        ));
        assert!(locks.active_lock("file", "x").is_none());
    }

    #[test]
    fn test_lock_error_maps_to_weft_error() {
        let err: WeftError = LockError::NotFound(Uuid::nil()).into();
        assert_eq!(err.kind(), "not_found");
    }
}
