// src/lifecycle/locks.rs

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async mutex per key, created on first use.
///
/// Entries are kept for the life of the process; there is one per base image.
#[derive(Default)]
pub struct KeyedMutex {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedMutex {
    /// Creates an empty lock table
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `key`
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(key.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_is_exclusive_other_keys_are_not() {
        let locks = Arc::new(KeyedMutex::new());
        let held = locks.lock("img-1").await;

        let other = tokio::time::timeout(Duration::from_millis(50), locks.lock("img-2")).await;
        assert!(other.is_ok());

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock("img-1").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        drop(held);
        tokio::time::timeout(Duration::from_secs(1), contender).await.unwrap().unwrap();
    }
}
