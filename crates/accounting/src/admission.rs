use std::{sync::Arc, time::Duration};

use tracing::debug;

use crate::{
    error::{Error, Result},
    store::AccountingStore,
};

/// Bounded counter that rejects work at capacity instead of queueing it.
#[derive(Clone)]
pub struct AdmissionGate {
    store: Arc<dyn AccountingStore>,
    key: String,
    limit: Option<u32>,
    lease: Option<Duration>,
}

impl AdmissionGate {
    /// Gate on `key` admitting at most `limit` concurrent holders.
    pub fn new(store: Arc<dyn AccountingStore>, key: impl Into<String>, limit: u32) -> Self {
        Self {
            store,
            key: key.into(),
            limit: Some(limit),
            lease: None,
        }
    }

    /// Gate that counts holders but never rejects.
    pub fn unbounded(store: Arc<dyn AccountingStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
            limit: None,
            lease: None,
        }
    }

    /// Let the counter expire `lease` after the first holder arrives.
    ///
    /// With a store shared between processes, a holder killed before its
    /// permit drops would otherwise keep its slot forever. The count resets
    /// once the lease runs out while busy, so pick a lease longer than any
    /// holder can legitimately live.
    #[must_use]
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = Some(lease);
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    /// Current number of holders.
    pub fn in_flight(&self) -> i64 {
        self.store.get(&self.key)
    }

    /// Non-reserving check. A later [`try_acquire`](Self::try_acquire) may
    /// still fail if another caller takes the last slot in between.
    pub fn has_capacity(&self) -> bool {
        self.limit
            .is_none_or(|limit| self.in_flight() < i64::from(limit))
    }

    /// Atomically take a slot. The slot is returned when the permit drops.
    pub fn try_acquire(&self) -> Result<AdmissionPermit> {
        let held = match self.limit {
            Some(limit) => self
                .store
                .try_incr_below(&self.key, i64::from(limit), self.lease)
                .ok_or_else(|| {
                    debug!(key = %self.key, limit, "admission rejected");
                    Error::at_capacity(&self.key, limit)
                })?,
            None => self.store.incr(&self.key, 1, self.lease),
        };
        debug!(key = %self.key, held, "admission granted");
        Ok(AdmissionPermit {
            store: Arc::clone(&self.store),
            key: self.key.clone(),
        })
    }
}

/// One held slot of an [`AdmissionGate`].
///
/// Dropping the permit releases the slot exactly once, on every exit path
/// including panics and cancelled futures.
#[must_use = "dropping the permit releases the slot immediately"]
pub struct AdmissionPermit {
    store: Arc<dyn AccountingStore>,
    key: String,
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("key", &self.key)
            .finish()
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        let left = self.store.decr(&self.key, 1);
        debug!(key = %self.key, left, "admission released");
    }
}
