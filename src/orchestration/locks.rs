use crate::domain::{Asset, UserId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Key = (UserId, Asset);

/// One async mutex per (user, asset): a single writer per ledger.
#[derive(Debug, Clone, Default)]
pub struct KeyedLocks {
    slots: Arc<Mutex<HashMap<Key, Arc<AsyncMutex<()>>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to the (user, asset) ledger.
    ///
    /// Slots nobody holds or waits on are dropped on the way in, so the map
    /// only tracks ledgers in use.
    pub async fn lock(&self, user_id: &UserId, asset: &Asset) -> OwnedMutexGuard<()> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            // Guards and waiters each own a clone; the map's is the only other.
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            slots
                .entry((user_id.clone(), asset.clone()))
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        slot.lock_owned().await
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let locks = KeyedLocks::new();
        let user = UserId::new("u1");
        let btc = Asset::new("BTC").unwrap();

        let guard = locks.lock(&user, &btc).await;
        let contended =
            tokio::time::timeout(Duration::from_millis(20), locks.lock(&user, &btc)).await;
        assert!(contended.is_err());

        drop(guard);
        let reacquired =
            tokio::time::timeout(Duration::from_millis(20), locks.lock(&user, &btc)).await;
        assert!(reacquired.is_ok());
    }

    #[tokio::test]
    async fn test_different_keys_do_not_contend() {
        let locks = KeyedLocks::new();
        let user = UserId::new("u1");

        let _btc = locks.lock(&user, &Asset::new("BTC").unwrap()).await;
        let eth = tokio::time::timeout(
            Duration::from_millis(20),
            locks.lock(&user, &Asset::new("ETH").unwrap()),
        )
        .await;
        assert!(eth.is_ok());
    }

    #[tokio::test]
    async fn test_idle_slots_are_pruned() {
        let locks = KeyedLocks::new();
        let user = UserId::new("u1");

        for symbol in ["BTC", "ETH", "SOL"] {
            let _guard = locks.lock(&user, &Asset::new(symbol).unwrap()).await;
        }
        let held = locks.lock(&user, &Asset::new("ADA").unwrap()).await;
        assert_eq!(locks.tracked(), 1);

        let _other = locks.lock(&user, &Asset::new("DOT").unwrap()).await;
        assert_eq!(locks.tracked(), 2, "held slot must survive pruning");

        drop(held);
        let contended = tokio::time::timeout(
            Duration::from_millis(20),
            locks.lock(&user, &Asset::new("DOT").unwrap()),
        )
        .await;
        assert!(contended.is_err());
        assert_eq!(locks.tracked(), 1);
    }
}
