//! Typed view over the local fallback cache.
//!
//! Three documents are kept per user:
//! - `transactions`: the last known transaction set, including pending records
//! - `pending_sync`: writes not yet acknowledged by the durable store
//! - `positions`: mirror of every position written by this process

use crate::cache::{CacheError, LocalCache};
use crate::domain::{sort_transactions_deterministic, Asset, Position, Transaction, TransactionId, UserId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

const VIEW_KEY: &str = "transactions";
const PENDING_KEY: &str = "pending_sync";
const POSITIONS_KEY: &str = "positions";

/// A write waiting for the durable store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum PendingOp {
    /// `origin_key` is the content key the record had when first written.
    /// Folded edits change the transaction but never the origin, so a late
    /// durable write of the original content is still recognised.
    Insert {
        transaction: Transaction,
        #[serde(rename = "originKey")]
        origin_key: String,
    },
    Update {
        transaction: Transaction,
    },
    /// With an `origin_key` this is the tombstone of a cancelled pending
    /// insert: any durable record with that content must go.
    Delete {
        id: TransactionId,
        asset: Asset,
        #[serde(rename = "originKey", default, skip_serializing_if = "Option::is_none")]
        origin_key: Option<String>,
    },
}

impl PendingOp {
    /// First write of a new record.
    pub fn insert(transaction: Transaction) -> Self {
        let origin_key = transaction.content_key();
        PendingOp::Insert {
            transaction,
            origin_key,
        }
    }

    pub fn delete(id: TransactionId, asset: Asset) -> Self {
        PendingOp::Delete {
            id,
            asset,
            origin_key: None,
        }
    }

    pub fn target(&self) -> &TransactionId {
        match self {
            PendingOp::Insert { transaction, .. } | PendingOp::Update { transaction } => {
                &transaction.id
            }
            PendingOp::Delete { id, .. } => id,
        }
    }

    pub fn asset(&self) -> &Asset {
        match self {
            PendingOp::Insert { transaction, .. } | PendingOp::Update { transaction } => {
                &transaction.asset
            }
            PendingOp::Delete { asset, .. } => asset,
        }
    }
}

/// True if `pending` carries user edits its durable `twin` lacks.
pub(super) fn edited_since(twin: &Transaction, pending: &Transaction) -> bool {
    twin.price != pending.price || twin.date != pending.date || twin.notes != pending.notes
}

/// Overlay still-pending writes on a durable result set.
///
/// A pending insert whose durable twin already exists (same id, same origin
/// content or same current content) is shown once: as the twin, or as the
/// pending record if it was edited since. Pending edits replace their durable
/// target; pending deletes hide it, and tombstones hide the twin too.
pub fn merge_pending(
    durable: Vec<Transaction>,
    pending: &[PendingOp],
    asset: Option<&Asset>,
) -> Vec<Transaction> {
    let mut merged = durable;
    let ids: HashSet<TransactionId> = merged.iter().map(|t| t.id.clone()).collect();

    for op in pending {
        if asset.map_or(false, |a| op.asset() != a) {
            continue;
        }
        match op {
            PendingOp::Insert {
                transaction,
                origin_key,
            } => {
                if ids.contains(&transaction.id) {
                    continue;
                }
                let current = transaction.content_key();
                let twin = merged.iter().position(|t| {
                    !t.id.is_pending() && {
                        let key = t.content_key();
                        key == *origin_key || key == current
                    }
                });
                match twin {
                    Some(slot) if edited_since(&merged[slot], transaction) => {
                        merged[slot] = transaction.clone();
                    }
                    Some(_) => {}
                    None => merged.push(transaction.clone()),
                }
            }
            PendingOp::Update { transaction } => {
                if let Some(slot) = merged.iter_mut().find(|t| t.id == transaction.id) {
                    *slot = transaction.clone();
                }
            }
            PendingOp::Delete { id, origin_key, .. } => {
                merged.retain(|t| &t.id != id);
                if let Some(key) = origin_key {
                    if let Some(slot) = merged
                        .iter()
                        .position(|t| !t.id.is_pending() && t.content_key() == *key)
                    {
                        merged.remove(slot);
                    }
                }
            }
        }
    }

    sort_transactions_deterministic(&mut merged);
    merged
}

/// Typed accessors over an injected `LocalCache`.
#[derive(Clone)]
pub struct LocalLedger {
    cache: Arc<dyn LocalCache>,
    // Serializes read-modify-write cycles on the per-user documents.
    rmw: Arc<Mutex<()>>,
}

impl fmt::Debug for LocalLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalLedger")
            .field("cache", &self.cache)
            .finish()
    }
}

impl LocalLedger {
    pub fn new(cache: Arc<dyn LocalCache>) -> Self {
        Self {
            cache,
            rmw: Arc::new(Mutex::new(())),
        }
    }

    fn load<T: DeserializeOwned + Default>(&self, user_id: &UserId, key: &str) -> Result<T, CacheError> {
        match self.cache.get(user_id, key)? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(T::default()),
        }
    }

    fn store<T: Serialize + ?Sized>(&self, user_id: &UserId, key: &str, value: &T) -> Result<(), CacheError> {
        let raw = serde_json::to_string(value)?;
        self.cache.set(user_id, key, &raw)
    }

    fn modify<T, F>(&self, user_id: &UserId, key: &str, f: F) -> Result<(), CacheError>
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnOnce(&mut T),
    {
        let _guard = self.rmw.lock().unwrap_or_else(|e| e.into_inner());
        let mut value: T = self.load(user_id, key)?;
        f(&mut value);
        self.store(user_id, key, &value)
    }

    // --- cached transaction view ---

    pub fn load_view(&self, user_id: &UserId) -> Result<Vec<Transaction>, CacheError> {
        self.load(user_id, VIEW_KEY)
    }

    pub fn load_view_for(&self, user_id: &UserId, asset: &Asset) -> Result<Vec<Transaction>, CacheError> {
        let mut view: Vec<Transaction> = self
            .load_view(user_id)?
            .into_iter()
            .filter(|t| &t.asset == asset)
            .collect();
        sort_transactions_deterministic(&mut view);
        Ok(view)
    }

    /// Replace the whole cached view of a user.
    pub fn save_view(&self, user_id: &UserId, transactions: &[Transaction]) -> Result<(), CacheError> {
        let _guard = self.rmw.lock().unwrap_or_else(|e| e.into_inner());
        self.store(user_id, VIEW_KEY, transactions)
    }

    /// Replace the cached records of one asset, keeping the others.
    pub fn save_view_for(
        &self,
        user_id: &UserId,
        asset: &Asset,
        transactions: &[Transaction],
    ) -> Result<(), CacheError> {
        self.modify(user_id, VIEW_KEY, |view: &mut Vec<Transaction>| {
            view.retain(|t| &t.asset != asset);
            view.extend(transactions.iter().cloned());
        })
    }

    /// Insert or replace one record, matched by id or content key.
    pub fn upsert_view_transaction(&self, tx: &Transaction) -> Result<(), CacheError> {
        let key = tx.content_key();
        self.modify(&tx.user_id, VIEW_KEY, |view: &mut Vec<Transaction>| {
            match view
                .iter_mut()
                .find(|t| t.id == tx.id || t.content_key() == key)
            {
                Some(slot) => *slot = tx.clone(),
                None => view.push(tx.clone()),
            }
        })
    }

    pub fn remove_view_transaction(&self, user_id: &UserId, id: &TransactionId) -> Result<(), CacheError> {
        self.modify(user_id, VIEW_KEY, |view: &mut Vec<Transaction>| {
            view.retain(|t| &t.id != id)
        })
    }

    // --- pending queue ---

    pub fn load_pending(&self, user_id: &UserId) -> Result<Vec<PendingOp>, CacheError> {
        self.load(user_id, PENDING_KEY)
    }

    pub fn pending_op(&self, user_id: &UserId, target: &TransactionId) -> Result<Option<PendingOp>, CacheError> {
        Ok(self
            .load_pending(user_id)?
            .into_iter()
            .find(|op| op.target() == target))
    }

    /// Queue a write, folding it into whatever is already queued for the same
    /// record. Edits of a pending insert rewrite the insert and keep its
    /// origin; a delete of a pending insert becomes a tombstone for the origin
    /// content, in case the insert reached the durable store after all.
    pub fn enqueue(&self, user_id: &UserId, op: PendingOp) -> Result<(), CacheError> {
        self.modify(user_id, PENDING_KEY, |queue: &mut Vec<PendingOp>| {
            let target = op.target().clone();
            let Some(i) = queue.iter().position(|queued| *queued.target() == target) else {
                queue.push(op);
                return;
            };
            let origin = match &queue[i] {
                PendingOp::Insert { origin_key, .. } => Some(origin_key.clone()),
                _ => None,
            };
            queue[i] = match (op, origin) {
                (PendingOp::Update { transaction }, Some(origin_key))
                | (PendingOp::Insert { transaction, .. }, Some(origin_key)) => PendingOp::Insert {
                    transaction,
                    origin_key,
                },
                (PendingOp::Delete { id, asset, .. }, Some(origin_key)) => PendingOp::Delete {
                    id,
                    asset,
                    origin_key: Some(origin_key),
                },
                (op, None) => op,
            };
        })
    }

    /// Drop the queued op for `target`, if any.
    pub fn dequeue(&self, user_id: &UserId, target: &TransactionId) -> Result<(), CacheError> {
        self.modify(user_id, PENDING_KEY, |queue: &mut Vec<PendingOp>| {
            queue.retain(|op| op.target() != target)
        })
    }

    // --- position mirror ---

    pub fn load_positions(&self, user_id: &UserId, asset: &Asset) -> Result<Vec<Position>, CacheError> {
        let mut positions: Vec<Position> = self
            .load::<Vec<Position>>(user_id, POSITIONS_KEY)?
            .into_iter()
            .filter(|p| &p.asset == asset)
            .collect();
        positions.sort_by(|a, b| a.opened_at.cmp(&b.opened_at).then_with(|| a.id.cmp(&b.id)));
        Ok(positions)
    }

    /// Assets the user has mirrored positions for.
    pub fn position_assets(&self, user_id: &UserId) -> Result<Vec<Asset>, CacheError> {
        let positions: Vec<Position> = self.load(user_id, POSITIONS_KEY)?;
        Ok(positions.into_iter().map(|p| p.asset).collect())
    }

    pub fn upsert_position(&self, position: &Position) -> Result<(), CacheError> {
        self.modify(&position.user_id, POSITIONS_KEY, |all: &mut Vec<Position>| {
            match all.iter_mut().find(|p| p.id == position.id) {
                Some(slot) => *slot = position.clone(),
                None => all.push(position.clone()),
            }
        })
    }

    pub fn save_positions_for(
        &self,
        user_id: &UserId,
        asset: &Asset,
        positions: &[Position],
    ) -> Result<(), CacheError> {
        self.modify(user_id, POSITIONS_KEY, |all: &mut Vec<Position>| {
            all.retain(|p| &p.asset != asset);
            all.extend(positions.iter().cloned());
        })
    }

    /// Rewrite a pending id to its durable id in the view and position mirror.
    pub fn adopt_durable_id(
        &self,
        user_id: &UserId,
        pending: &TransactionId,
        durable: &TransactionId,
    ) -> Result<(), CacheError> {
        self.modify(user_id, VIEW_KEY, |view: &mut Vec<Transaction>| {
            // The durable twin may already be in the view from a fresh read.
            if view.iter().any(|t| &t.id == durable) {
                view.retain(|t| &t.id != pending);
            } else if let Some(slot) = view.iter_mut().find(|t| &t.id == pending) {
                slot.id = durable.clone();
            }
        })?;
        self.modify(user_id, POSITIONS_KEY, |all: &mut Vec<Position>| {
            for position in all.iter_mut() {
                position.replace_transaction_id(pending, durable);
            }
        })
    }
}
