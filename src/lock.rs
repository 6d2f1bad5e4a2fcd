//! Distributed transfer lock.
//!
//! One writer per key: the lock is a backend string claimed with a
//! conditional set and owned by a random token. Long transfers renew
//! the claim with doubling grants instead of holding a long TTL from
//! the start, so an abandoned writer frees the key quickly.

use std::sync::Arc;
use std::time::Instant;

use tracing::debug;
use uuid::Uuid;

use crate::backend::Backend;
use crate::error::CacheError;
use crate::keys;

const SOURCE: &str = "lock";

/// Renew once remaining life drops below this fraction of the default.
const RENEW_DENOMINATOR: u64 = 4;

pub struct DistributedLock {
    backend: Arc<dyn Backend>,
    key: String,
    lock_key: String,
    token: String,
    default_ttl_ms: u64,
    granted_ms: u64,
    renewals: u32,
    renewed_at: Instant,
}

impl DistributedLock {
    /// Claim the lock for `key`, or fail with [`CacheError::LockHeld`]
    /// when another writer owns it.
    pub async fn acquire(
        backend: Arc<dyn Backend>,
        prefix: &str,
        key: &str,
        default_ttl_ms: u64,
    ) -> Result<Self, CacheError> {
        let lock_key = keys::lock_key(prefix, key);
        let token = Uuid::new_v4().simple().to_string();
        let claimed = backend
            .set_if_absent_ms(&lock_key, &token, default_ttl_ms)
            .await?;
        if !claimed {
            return Err(CacheError::lock_held(key));
        }
        debug!(source = SOURCE, key, ttl_ms = default_ttl_ms, "acquired transfer lock");
        Ok(Self {
            backend,
            key: key.to_string(),
            lock_key,
            token,
            default_ttl_ms,
            granted_ms: default_ttl_ms,
            renewals: 0,
            renewed_at: Instant::now(),
        })
    }

    /// Milliseconds left on the current grant, by local clock.
    pub fn remaining_ms(&self) -> u64 {
        self.granted_ms
            .saturating_sub(self.renewed_at.elapsed().as_millis() as u64)
    }

    /// Renew the claim if the current grant is running low.
    ///
    /// Called once per written chunk; cheap when no renewal is due.
    pub async fn maintain(&mut self) -> Result<(), CacheError> {
        let Some(grant) = next_grant_ms(self.remaining_ms(), self.default_ttl_ms, self.renewals)
        else {
            return Ok(());
        };
        self.renew(grant).await
    }

    async fn renew(&mut self, grant_ms: u64) -> Result<(), CacheError> {
        let holder = self.backend.get_string(&self.lock_key).await?;
        if holder.as_deref() != Some(self.token.as_str()) {
            return Err(CacheError::lock_lost(&self.key));
        }
        if !self.backend.expire_ms(&self.lock_key, grant_ms).await? {
            return Err(CacheError::lock_lost(&self.key));
        }
        self.renewals += 1;
        self.granted_ms = grant_ms;
        self.renewed_at = Instant::now();
        debug!(
            source = SOURCE,
            key = %self.key,
            grant_ms,
            renewals = self.renewals,
            "renewed transfer lock"
        );
        Ok(())
    }

    /// Give the lock back.
    ///
    /// Ownership is checked by token before deleting. The check and the
    /// delete are separate commands, so a grant that lapses exactly
    /// between them can drop a successor's claim; grants renew well
    /// before expiry to keep that window out of normal operation.
    pub async fn release(self) -> Result<(), CacheError> {
        let holder = self.backend.get_string(&self.lock_key).await?;
        if holder.as_deref() != Some(self.token.as_str()) {
            debug!(source = SOURCE, key = %self.key, "lock already lapsed at release");
            return Ok(());
        }
        self.backend.delete(&[self.lock_key.clone()]).await?;
        Ok(())
    }
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("key", &self.key)
            .field("granted_ms", &self.granted_ms)
            .field("renewals", &self.renewals)
            .finish()
    }
}

/// Next grant to request, or `None` while the current one is healthy.
///
/// Each renewal doubles the grant relative to the last, so a transfer
/// that keeps outliving its lease asks for exponentially more headroom
/// instead of renewing in a tight loop.
fn next_grant_ms(remaining_ms: u64, default_ttl_ms: u64, renewals: u32) -> Option<u64> {
    if remaining_ms >= default_ttl_ms / RENEW_DENOMINATOR {
        return None;
    }
    let factor = 2u64.saturating_pow(renewals.saturating_add(1));
    Some(default_ttl_ms.saturating_mul(factor))
}
