//! Transaction store façade: durable-first writes with a local fallback.
//!
//! Every write is raced against the configured budget. When the durable store
//! fails or is too slow the façade goes degraded: the record gets a local
//! pending id, lands in the cache's pending queue and the caller still sees
//! success. Reads merge durable results with whatever is still pending.

use super::local::{merge_pending, LocalLedger, PendingOp};
use super::locks::KeyedLocks;
use super::positions::{Linkage, PositionManager};
use super::within_budget;
use crate::cache::LocalCache;
use crate::domain::{
    sort_transactions_deterministic, Asset, NewTransaction, Position, PositionId, TimeMs,
    Transaction, TransactionEdit, TransactionId, UserId,
};
use crate::engine::replay_episodes;
use crate::error::LedgerError;
use crate::store::{DurableStore, StoreError, StoreEvent};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How far a write got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// Acknowledged by the durable store.
    Durable,
    /// Held locally under a pending id until the next resync.
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub transaction: Transaction,
    pub durability: Durability,
}

/// Result of a background recalculation.
#[derive(Debug)]
pub struct RepairReport {
    pub user_id: UserId,
    pub asset: Asset,
    pub result: Result<Vec<Position>, LedgerError>,
}

#[derive(Clone)]
pub struct TransactionStore {
    pub(super) durable: Arc<dyn DurableStore>,
    pub(super) local: LocalLedger,
    pub(super) positions: PositionManager,
    pub(super) locks: KeyedLocks,
    degraded: Arc<AtomicBool>,
    pub(super) resync_guard: Arc<AsyncMutex<()>>,
    reports: mpsc::UnboundedSender<RepairReport>,
    pub(super) write_timeout: Duration,
}

impl std::fmt::Debug for TransactionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionStore")
            .field("durable", &self.durable)
            .field("degraded", &self.is_degraded())
            .field("write_timeout", &self.write_timeout)
            .finish()
    }
}

impl TransactionStore {
    /// Build a façade over `durable` with `cache` as the local fallback.
    ///
    /// The returned receiver yields one report per background recalculation.
    pub fn new(
        durable: Arc<dyn DurableStore>,
        cache: Arc<dyn LocalCache>,
        write_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<RepairReport>) {
        let local = LocalLedger::new(cache);
        let positions = PositionManager::new(durable.clone(), local.clone(), write_timeout);
        let (reports, rx) = mpsc::unbounded_channel();
        let store = Self {
            durable,
            local,
            positions,
            locks: KeyedLocks::new(),
            degraded: Arc::new(AtomicBool::new(false)),
            resync_guard: Arc::new(AsyncMutex::new(())),
            reports,
            write_timeout,
        };
        (store, rx)
    }

    pub fn position_manager(&self) -> &PositionManager {
        &self.positions
    }

    /// True while the durable store is believed unreachable.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub(super) fn mark_degraded(&self, cause: &StoreError) {
        if !self.degraded.swap(true, Ordering::SeqCst) {
            warn!(error = %cause, "Durable store unreachable, switching to local fallback");
        }
    }

    pub(super) fn mark_healthy(&self) {
        if self.degraded.swap(false, Ordering::SeqCst) {
            info!("Durable store reachable again");
        }
    }

    /// Validate and persist a new transaction, then link it to its position.
    ///
    /// # Errors
    /// `LedgerError::Validation` for invalid input. Store failures are absorbed
    /// into a deferred write; only a failing local cache surfaces.
    pub async fn add_transaction(
        &self,
        user_id: &UserId,
        input: NewTransaction,
    ) -> Result<WriteOutcome, LedgerError> {
        let mut tx = input.validate(user_id, TimeMs::now())?;
        let _guard = self.locks.lock(user_id, &tx.asset).await;

        let durability =
            match within_budget(self.write_timeout, self.durable.insert_transaction(&tx)).await {
                Ok(id) => {
                    self.mark_healthy();
                    tx.id = id;
                    Durability::Durable
                }
                Err(e) => {
                    self.mark_degraded(&e);
                    self.local.enqueue(user_id, PendingOp::insert(tx.clone()))?;
                    Durability::Deferred
                }
            };
        debug!(user = %user_id, asset = %tx.asset, tx = %tx.id, ?durability, "Transaction written");

        if let Some(Linkage {
            position_id,
            entry_index,
        }) = self.positions.link_new_transaction(&tx).await
        {
            tx.position_id = Some(position_id);
            tx.entry_index = Some(entry_index);
            self.write_back_linkage(&tx).await;
        }

        match durability {
            Durability::Deferred => self.local.upsert_view_transaction(&tx)?,
            Durability::Durable => {
                if let Err(e) = self.local.upsert_view_transaction(&tx) {
                    warn!(tx = %tx.id, error = %e, "Failed to mirror transaction locally");
                }
            }
        }

        Ok(WriteOutcome {
            transaction: tx,
            durability,
        })
    }

    /// Edit the price, date or notes of a transaction and schedule a replay.
    ///
    /// # Errors
    /// `LedgerError::NotFound` if the user has no such transaction.
    pub async fn update_transaction(
        &self,
        user_id: &UserId,
        id: &TransactionId,
        edit: TransactionEdit,
    ) -> Result<Transaction, LedgerError> {
        let asset = self.find_transaction(user_id, id).await?.asset;
        let guard = self.locks.lock(user_id, &asset).await;

        // Re-read under the lock; a concurrent edit may have landed.
        let mut tx = self.find_transaction(user_id, id).await?;
        if !tx.apply_edit(&edit)? {
            return Ok(tx);
        }

        if tx.id.is_pending() {
            self.local
                .enqueue(user_id, PendingOp::Update { transaction: tx.clone() })?;
        } else {
            match within_budget(self.write_timeout, self.durable.update_transaction(&tx)).await {
                Ok(()) => self.mark_healthy(),
                Err(e) if e.is_transient() => {
                    self.mark_degraded(&e);
                    self.local
                        .enqueue(user_id, PendingOp::Update { transaction: tx.clone() })?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.local.upsert_view_transaction(&tx)?;
        drop(guard);

        self.spawn_recalculation(user_id.clone(), asset);
        Ok(tx)
    }

    /// Remove a transaction and schedule a replay. Deleting an unknown id
    /// succeeds.
    pub async fn delete_transaction(
        &self,
        user_id: &UserId,
        id: &TransactionId,
    ) -> Result<(), LedgerError> {
        let asset = match self.find_transaction(user_id, id).await {
            Ok(tx) => tx.asset,
            Err(LedgerError::NotFound(_)) => {
                debug!(user = %user_id, tx = %id, "Delete of unknown transaction ignored");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let guard = self.locks.lock(user_id, &asset).await;

        let queued = PendingOp::delete(id.clone(), asset.clone());
        if id.is_pending() {
            self.local.enqueue(user_id, queued)?;
        } else {
            match within_budget(self.write_timeout, self.durable.delete_transaction(user_id, id))
                .await
            {
                Ok(()) => {
                    self.mark_healthy();
                    // Drop any edit still queued for the deleted record.
                    self.local.dequeue(user_id, id)?;
                }
                Err(e) if e.is_transient() => {
                    self.mark_degraded(&e);
                    self.local.enqueue(user_id, queued)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.local.remove_view_transaction(user_id, id)?;
        drop(guard);

        self.spawn_recalculation(user_id.clone(), asset);
        Ok(())
    }

    /// One (user, asset) ledger in ledger order, pending writes included.
    pub async fn transactions(
        &self,
        user_id: &UserId,
        asset: &Asset,
    ) -> Result<Vec<Transaction>, LedgerError> {
        let (transactions, reachable) = self.read_asset(user_id, asset).await?;
        if reachable && self.resync_if_pending(user_id).await? {
            return Ok(self.read_asset(user_id, asset).await?.0);
        }
        Ok(transactions)
    }

    /// Every transaction of a user, pending writes included.
    pub async fn all_transactions(&self, user_id: &UserId) -> Result<Vec<Transaction>, LedgerError> {
        let (transactions, reachable) = self.read_user(user_id).await?;
        if reachable && self.resync_if_pending(user_id).await? {
            return Ok(self.read_user(user_id).await?.0);
        }
        Ok(transactions)
    }

    /// Runs a resync when writes are queued. Returns true if anything moved.
    async fn resync_if_pending(&self, user_id: &UserId) -> Result<bool, LedgerError> {
        if self.local.load_pending(user_id)?.is_empty() {
            return Ok(false);
        }
        let report = self.resync(user_id).await?;
        Ok(report.synced + report.deduplicated > 0)
    }

    /// Merged read of one asset. The flag is false when the cached view was
    /// served because the durable store is unreachable.
    pub(super) async fn read_asset(
        &self,
        user_id: &UserId,
        asset: &Asset,
    ) -> Result<(Vec<Transaction>, bool), LedgerError> {
        match within_budget(
            self.write_timeout,
            self.durable.query_transactions(user_id, asset),
        )
        .await
        {
            Ok(durable) => {
                self.mark_healthy();
                let pending = self.local.load_pending(user_id)?;
                let merged = merge_pending(durable, &pending, Some(asset));
                if let Err(e) = self.local.save_view_for(user_id, asset, &merged) {
                    warn!(user = %user_id, asset = %asset, error = %e, "Failed to refresh cached view");
                }
                Ok((merged, true))
            }
            Err(e) if e.is_transient() => {
                self.mark_degraded(&e);
                Ok((self.local.load_view_for(user_id, asset)?, false))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read_user(&self, user_id: &UserId) -> Result<(Vec<Transaction>, bool), LedgerError> {
        match within_budget(self.write_timeout, self.durable.query_user_transactions(user_id)).await
        {
            Ok(durable) => {
                self.mark_healthy();
                let pending = self.local.load_pending(user_id)?;
                let merged = merge_pending(durable, &pending, None);
                if let Err(e) = self.local.save_view(user_id, &merged) {
                    warn!(user = %user_id, error = %e, "Failed to refresh cached view");
                }
                Ok((merged, true))
            }
            Err(e) if e.is_transient() => {
                self.mark_degraded(&e);
                let mut view = self.local.load_view(user_id)?;
                sort_transactions_deterministic(&mut view);
                Ok((view, false))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn find_transaction(
        &self,
        user_id: &UserId,
        id: &TransactionId,
    ) -> Result<Transaction, LedgerError> {
        let (transactions, _) = self.read_user(user_id).await?;
        transactions
            .into_iter()
            .find(|t| &t.id == id)
            .ok_or_else(|| LedgerError::NotFound(format!("transaction {}", id)))
    }

    /// Persist `position_id`/`entry_index` of an already written transaction.
    async fn write_back_linkage(&self, tx: &Transaction) {
        let result = if tx.id.is_pending() {
            self.local
                .enqueue(&tx.user_id, PendingOp::insert(tx.clone()))
                .map_err(LedgerError::from)
        } else {
            within_budget(self.write_timeout, self.durable.update_transaction(tx))
                .await
                .map_err(LedgerError::from)
        };
        if let Err(e) = result {
            warn!(tx = %tx.id, error = %e, "Failed to record transaction linkage");
        }
    }

    /// Replay every transaction of a (user, asset) into position episodes.
    ///
    /// Existing position ids are reused in opening order, surplus positions
    /// are deleted and drifted transaction linkage is rewritten best-effort.
    ///
    /// # Errors
    /// Fails when neither the durable store nor the cache can be read.
    pub async fn recalculate(
        &self,
        user_id: &UserId,
        asset: &Asset,
    ) -> Result<Vec<Position>, LedgerError> {
        let _guard = self.locks.lock(user_id, asset).await;

        let (transactions, _) = self.read_asset(user_id, asset).await?;
        let existing = self.positions.positions(user_id, asset).await?;
        let reusable: Vec<PositionId> = existing.iter().map(|p| p.id.clone()).collect();

        let (episodes, links) = replay_episodes(&transactions, reusable)?;
        self.positions
            .store_episodes(user_id, asset, &episodes, &existing)
            .await?;

        let mut drifted = 0usize;
        for link in links {
            let Some(tx) = transactions.iter().find(|t| t.id == link.transaction_id) else {
                continue;
            };
            if tx.position_id == link.position_id && tx.entry_index == link.entry_index {
                continue;
            }
            let mut relinked = tx.clone();
            relinked.position_id = link.position_id;
            relinked.entry_index = link.entry_index;
            self.write_back_linkage(&relinked).await;
            if let Err(e) = self.local.upsert_view_transaction(&relinked) {
                warn!(tx = %relinked.id, error = %e, "Failed to mirror relinked transaction");
            }
            drifted += 1;
        }

        info!(
            user = %user_id,
            asset = %asset,
            transactions = transactions.len(),
            episodes = episodes.len(),
            relinked = drifted,
            "Positions recalculated"
        );
        Ok(episodes)
    }

    /// Replay the ledger owning `position_id` and return its rebuilt episode.
    ///
    /// # Errors
    /// `LedgerError::NotFound` if the position is unknown or the replay no
    /// longer produces it.
    pub async fn recalculate_position(&self, position_id: &PositionId) -> Result<Position, LedgerError> {
        let position = self
            .positions
            .get_position(position_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("position {}", position_id)))?;

        self.recalculate(&position.user_id, &position.asset)
            .await?
            .into_iter()
            .find(|p| &p.id == position_id)
            .ok_or_else(|| LedgerError::NotFound(format!("position {}", position_id)))
    }

    /// Replay every asset the user has transactions or positions for.
    pub async fn recalculate_all_positions(&self, user_id: &UserId) -> Result<Vec<Position>, LedgerError> {
        let (transactions, _) = self.read_user(user_id).await?;
        let mut assets: BTreeSet<Asset> = transactions.into_iter().map(|t| t.asset).collect();
        assets.extend(self.positions.position_assets(user_id).await?);

        let per_asset = futures::future::try_join_all(
            assets.iter().map(|asset| self.recalculate(user_id, asset)),
        )
        .await?;
        Ok(per_asset.into_iter().flatten().collect())
    }

    /// Run `recalculate` on a background task; the outcome goes to the
    /// repair report channel.
    pub fn spawn_recalculation(&self, user_id: UserId, asset: Asset) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let result = store.recalculate(&user_id, &asset).await;
            if let Err(e) = &result {
                warn!(user = %user_id, asset = %asset, error = %e, "Background recalculation failed");
            }
            let report = RepairReport {
                user_id,
                asset,
                result,
            };
            if store.reports.send(report).is_err() {
                debug!("Repair report receiver dropped");
            }
        })
    }

    /// Follow the durable store's live feed for `user_id`: snapshots refresh
    /// the cached view and trigger a resync, disconnects mark the façade
    /// degraded.
    pub fn spawn_subscription_watcher(&self, user_id: UserId) -> JoinHandle<()> {
        let store = self.clone();
        let mut events = self.durable.subscribe(&user_id);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(StoreEvent::Snapshot {
                        user_id: snapshot_user,
                        transactions,
                    }) if snapshot_user == user_id => {
                        store.mark_healthy();
                        store.absorb_snapshot(&user_id, transactions);
                        if let Err(e) = store.resync_if_pending(&user_id).await {
                            warn!(user = %user_id, error = %e, "Resync after snapshot failed");
                        }
                    }
                    Ok(StoreEvent::Snapshot { .. }) => {}
                    Ok(StoreEvent::Disconnected) => {
                        store.mark_degraded(&StoreError::Unavailable(
                            "subscription disconnected".to_string(),
                        ));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(user = %user_id, skipped, "Subscription lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn absorb_snapshot(&self, user_id: &UserId, durable: Vec<Transaction>) {
        let merged = self
            .local
            .load_pending(user_id)
            .map(|pending| merge_pending(durable, &pending, None));
        match merged.and_then(|view| self.local.save_view(user_id, &view)) {
            Ok(()) => {}
            Err(e) => warn!(user = %user_id, error = %e, "Failed to absorb snapshot"),
        }
    }
}
