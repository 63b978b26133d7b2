use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per key. Slots nobody holds are pruned on the next access.
pub struct KeyedLocks<K> {
    slots: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, key: &K) -> Arc<Mutex<()>> {
        let mut slots = self.slots.lock().await;
        slots.retain(|k, slot| k == key || Arc::strong_count(slot) > 1);
        slots.entry(key.clone()).or_default().clone()
    }

    /// Wait until `key` is free.
    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        self.slot(key).await.lock_owned().await
    }

    /// `None` when someone else holds `key`.
    pub async fn try_lock(&self, key: &K) -> Option<OwnedMutexGuard<()>> {
        self.slot(key).await.try_lock_owned().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn try_lock_fails_while_key_is_held() {
        let locks = KeyedLocks::new();
        let guard = locks.lock(&1u32).await;
        assert!(locks.try_lock(&1).await.is_none());
        assert!(locks.try_lock(&2).await.is_some());
        drop(guard);
        assert!(locks.try_lock(&1).await.is_some());
    }

    #[tokio::test]
    async fn released_slots_are_pruned() {
        let locks = KeyedLocks::new();
        for key in 0..16u32 {
            drop(locks.lock(&key).await);
        }
        let _held = locks.lock(&99).await;
        assert_eq!(locks.slots.lock().await.len(), 1);
    }
}
