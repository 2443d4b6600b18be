//! Per-key reader/writer locks.
//!
//! One lock per possible key value, sized to the whole key domain rather
//! than the table capacity, so unrelated keys sharing a bucket never
//! contend. Guards are held across the full operation, replication
//! included, which is why these are async locks.

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::table::{Key, KEY_SPACE};

pub struct KeyLocks {
    locks: Vec<RwLock<()>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        let locks = (0..KEY_SPACE).map(|_| RwLock::new(())).collect();
        Self { locks }
    }

    /// Exclusive lock for a PUT.
    pub async fn write(&self, key: Key) -> RwLockWriteGuard<'_, ()> {
        self.locks[key as usize].write().await
    }

    /// Shared lock for a GET.
    pub async fn read(&self, key: Key) -> RwLockReadGuard<'_, ()> {
        self.locks[key as usize].read().await
    }
}

impl Default for KeyLocks {
    fn default() -> Self {
        Self::new()
    }
}
