//! In-memory durable store for tests, with switchable connectivity.

use super::{DurableStore, StoreError, StoreEvent};
use crate::domain::{Asset, Position, PositionId, Transaction, TransactionId, UserId};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Debug, Default)]
struct Inner {
    transactions: BTreeMap<TransactionId, Transaction>,
    positions: BTreeMap<PositionId, Position>,
    subscribers: HashSet<UserId>,
}

/// In-memory store that can be taken offline or slowed down.
///
/// Writes are dispatched onto a spawned task, so a caller that stops waiting
/// (timeout) does not retract a write already in flight.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    online: Arc<AtomicBool>,
    latency_ms: Arc<AtomicU64>,
    next_id: Arc<AtomicU64>,
    events: broadcast::Sender<StoreEvent>,
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("online", &self.online.load(Ordering::SeqCst))
            .field("latency_ms", &self.latency_ms.load(Ordering::SeqCst))
            .finish()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            online: Arc::new(AtomicBool::new(true)),
            latency_ms: Arc::new(AtomicU64::new(0)),
            next_id: Arc::new(AtomicU64::new(1)),
            events,
        }
    }

    /// Toggle connectivity. Going offline emits `Disconnected`; coming back
    /// emits a snapshot for every subscribed user.
    pub fn set_online(&self, online: bool) {
        let was = self.online.swap(online, Ordering::SeqCst);
        if was == online {
            return;
        }
        if !online {
            let _ = self.events.send(StoreEvent::Disconnected);
            return;
        }
        let users: Vec<UserId> = self.lock().subscribers.iter().cloned().collect();
        for user_id in users {
            self.publish_snapshot(&user_id);
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Delay applied before every operation settles.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of stored transactions across all users.
    pub fn transaction_count(&self) -> usize {
        self.lock().transactions.len()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.is_online() {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store is offline".to_string()))
        }
    }

    async fn settle(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    fn user_transactions(inner: &Inner, user_id: &UserId) -> Vec<Transaction> {
        inner
            .transactions
            .values()
            .filter(|t| &t.user_id == user_id)
            .cloned()
            .collect()
    }

    fn publish_snapshot(&self, user_id: &UserId) {
        let inner = self.lock();
        if !inner.subscribers.contains(user_id) {
            return;
        }
        let transactions = Self::user_transactions(&inner, user_id);
        drop(inner);
        let _ = self.events.send(StoreEvent::Snapshot {
            user_id: user_id.clone(),
            transactions,
        });
    }

    /// Run `op` on a detached task after the configured latency.
    async fn dispatch<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&MemoryStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.clone();
        let handle = tokio::spawn(async move {
            store.settle().await;
            store.check_online()?;
            op(&store)
        });
        handle
            .await
            .map_err(|e| StoreError::Other(format!("store task failed: {}", e)))?
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn insert_transaction(&self, tx: &Transaction) -> Result<TransactionId, StoreError> {
        let mut record = tx.clone();
        self.dispatch(move |store| {
            let n = store.next_id.fetch_add(1, Ordering::SeqCst);
            let id = TransactionId::durable(format!("tx-{:06}", n))
                .ok_or_else(|| StoreError::InvalidId(n.to_string()))?;
            record.id = id.clone();
            let user_id = record.user_id.clone();
            store.lock().transactions.insert(id.clone(), record);
            store.publish_snapshot(&user_id);
            Ok(id)
        })
        .await
    }

    async fn update_transaction(&self, tx: &Transaction) -> Result<(), StoreError> {
        let record = tx.clone();
        self.dispatch(move |store| {
            let user_id = record.user_id.clone();
            {
                let mut inner = store.lock();
                match inner.transactions.get_mut(&record.id) {
                    Some(slot) => *slot = record,
                    None => return Err(StoreError::NotFound(record.id.to_string())),
                }
            }
            store.publish_snapshot(&user_id);
            Ok(())
        })
        .await
    }

    async fn delete_transaction(
        &self,
        user_id: &UserId,
        id: &TransactionId,
    ) -> Result<(), StoreError> {
        let user_id = user_id.clone();
        let id = id.clone();
        self.dispatch(move |store| {
            let removed = {
                let mut inner = store.lock();
                let owned = inner
                    .transactions
                    .get(&id)
                    .map(|t| t.user_id == user_id)
                    .unwrap_or(false);
                owned && inner.transactions.remove(&id).is_some()
            };
            if removed {
                store.publish_snapshot(&user_id);
            }
            Ok(())
        })
        .await
    }

    async fn query_transactions(
        &self,
        user_id: &UserId,
        asset: &Asset,
    ) -> Result<Vec<Transaction>, StoreError> {
        self.settle().await;
        self.check_online()?;
        Ok(self
            .lock()
            .transactions
            .values()
            .filter(|t| &t.user_id == user_id && &t.asset == asset)
            .cloned()
            .collect())
    }

    async fn query_user_transactions(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<Transaction>, StoreError> {
        self.settle().await;
        self.check_online()?;
        Ok(Self::user_transactions(&self.lock(), user_id))
    }

    async fn get_position(&self, id: &PositionId) -> Result<Option<Position>, StoreError> {
        self.settle().await;
        self.check_online()?;
        Ok(self.lock().positions.get(id).cloned())
    }

    async fn query_positions(
        &self,
        user_id: &UserId,
        asset: Option<&Asset>,
    ) -> Result<Vec<Position>, StoreError> {
        self.settle().await;
        self.check_online()?;
        Ok(self
            .lock()
            .positions
            .values()
            .filter(|p| &p.user_id == user_id && asset.map_or(true, |a| &p.asset == a))
            .cloned()
            .collect())
    }

    async fn upsert_position(&self, position: &Position) -> Result<(), StoreError> {
        let record = position.clone();
        self.dispatch(move |store| {
            store.lock().positions.insert(record.id.clone(), record);
            Ok(())
        })
        .await
    }

    async fn delete_position(&self, id: &PositionId) -> Result<(), StoreError> {
        let id = id.clone();
        self.dispatch(move |store| {
            store.lock().positions.remove(&id);
            Ok(())
        })
        .await
    }

    fn subscribe(&self, user_id: &UserId) -> broadcast::Receiver<StoreEvent> {
        self.lock().subscribers.insert(user_id.clone());
        self.events.subscribe()
    }
}
