// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Short-lived named locks guarding background fetches.
//!
//! A lock is an entry in a shared map with an expiry. Acquisition is an
//! atomic add-if-absent; an expired entry counts as absent so a crashed
//! worker can never wedge a key for longer than the TTL.

use chrono::NaiveDate;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long a fetch lock is held at most.
pub const LOCK_EXPIRE: Duration = Duration::from_secs(5 * 60);

const KEY_PREFIX: &str = "fitlink.tasks-lock";

#[derive(Debug, Clone, Copy)]
struct Holder {
    id: u64,
    expires: Instant,
}

/// Process-wide lock table, cheap to clone.
#[derive(Clone, Default)]
pub struct LockCache {
    entries: Arc<DashMap<String, Holder>>,
    next_id: Arc<AtomicU64>,
}

impl LockCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key for one (Fitbit user, resource, date) unit of work.
    pub fn fetch_key(fitbit_user: &str, resource_path: &str, date: Option<NaiveDate>) -> String {
        let date = date
            .map(crate::time_utils::format_date)
            .unwrap_or_else(|| "ALL".to_string());
        format!("{}-{}-{}-{}", KEY_PREFIX, fitbit_user, resource_path, date)
    }

    /// Take the lock if nobody holds it. The lock is released when the
    /// returned guard is dropped, or when `ttl` elapses.
    pub fn try_acquire(&self, key: &str, ttl: Duration) -> Option<LockGuard> {
        let now = Instant::now();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let holder = Holder {
            id,
            expires: now + ttl,
        };

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires > now {
                    return None;
                }
                occupied.insert(holder);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(holder);
            }
        }

        Some(LockGuard {
            entries: Arc::clone(&self.entries),
            key: key.to_string(),
            id,
        })
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .is_some_and(|holder| holder.expires > Instant::now())
    }
}

/// Held lock; releases on drop.
#[derive(Debug)]
pub struct LockGuard {
    entries: Arc<DashMap<String, Holder>>,
    key: String,
    id: u64,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Only remove our own entry; after expiry someone else may own the key.
        self.entries
            .remove_if(&self.key, |_, holder| holder.id == self.id);
    }
}
