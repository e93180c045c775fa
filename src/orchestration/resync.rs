//! Pushes queued local writes to the durable store once it is reachable.

use super::facade::TransactionStore;
use super::local::{edited_since, PendingOp};
use super::within_budget;
use crate::domain::{Asset, Transaction, TransactionId, UserId};
use crate::error::LedgerError;
use crate::store::StoreError;
use std::collections::{BTreeSet, HashMap};
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResyncReport {
    /// Ops acknowledged by the durable store.
    pub synced: usize,
    /// Pending inserts whose durable twin already existed, and tombstones
    /// that removed one.
    pub deduplicated: usize,
    /// Ops still queued for the next attempt.
    pub remaining: usize,
}

enum Settled {
    Synced,
    Deduplicated,
}

impl TransactionStore {
    /// Push every queued write of `user_id` individually.
    ///
    /// Each acknowledged op leaves the queue on its own, so an interrupted
    /// scan never pushes the same record twice. A transient failure stops the
    /// scan; the rest waits for the next transition to healthy.
    pub async fn resync(&self, user_id: &UserId) -> Result<ResyncReport, LedgerError> {
        let _scan = self.resync_guard.lock().await;

        let queued = self.local.load_pending(user_id)?;
        if queued.is_empty() {
            return Ok(ResyncReport::default());
        }

        let durable = match within_budget(
            self.write_timeout,
            self.durable.query_user_transactions(user_id),
        )
        .await
        {
            Ok(durable) => durable,
            Err(e) if e.is_transient() => {
                self.mark_degraded(&e);
                return Ok(ResyncReport {
                    remaining: queued.len(),
                    ..Default::default()
                });
            }
            Err(e) => return Err(e.into()),
        };
        self.mark_healthy();

        // Late durable writes: content already stored under a durable id.
        let durable_keys: HashMap<String, Transaction> = durable
            .into_iter()
            .map(|t| (t.content_key(), t))
            .collect();

        let mut report = ResyncReport::default();
        let mut affected: BTreeSet<Asset> = BTreeSet::new();

        for scanned in &queued {
            let target = scanned.target().clone();
            let asset = scanned.asset().clone();
            let _guard = self.locks.lock(user_id, &asset).await;

            // The op may have been edited or cancelled since the scan started.
            let Some(op) = self.local.pending_op(user_id, &target)? else {
                continue;
            };

            match self.push(user_id, &op, &durable_keys).await {
                Ok(settled) => {
                    self.local.dequeue(user_id, &target)?;
                    affected.insert(asset);
                    match settled {
                        Settled::Synced => report.synced += 1,
                        Settled::Deduplicated => report.deduplicated += 1,
                    }
                }
                Err(e) if e.is_transient() => {
                    self.mark_degraded(&e);
                    warn!(user = %user_id, tx = %target, error = %e, "Resync interrupted");
                    break;
                }
                Err(StoreError::NotFound(_)) => {
                    warn!(user = %user_id, tx = %target, "Queued edit targets a missing record, dropping it");
                    self.local.dequeue(user_id, &target)?;
                    affected.insert(asset);
                }
                Err(e) => {
                    warn!(user = %user_id, tx = %target, error = %e, "Queued write rejected, keeping it");
                }
            }
        }

        report.remaining = self.local.load_pending(user_id)?.len();
        info!(
            user = %user_id,
            synced = report.synced,
            deduplicated = report.deduplicated,
            remaining = report.remaining,
            "Resync finished"
        );

        for asset in affected {
            self.spawn_recalculation(user_id.clone(), asset);
        }
        Ok(report)
    }

    async fn push(
        &self,
        user_id: &UserId,
        op: &PendingOp,
        durable_keys: &HashMap<String, Transaction>,
    ) -> Result<Settled, StoreError> {
        match op {
            PendingOp::Insert {
                transaction,
                origin_key,
            } => {
                let twin = durable_keys
                    .get(origin_key)
                    .or_else(|| durable_keys.get(&transaction.content_key()));
                if let Some(twin) = twin {
                    // Edits made while the insert was pending go onto the twin.
                    if edited_since(twin, transaction) {
                        let mut edited = transaction.clone();
                        edited.id = twin.id.clone();
                        within_budget(self.write_timeout, self.durable.update_transaction(&edited))
                            .await?;
                    }
                    self.adopt(transaction, &twin.id).await;
                    return Ok(Settled::Deduplicated);
                }
                let durable_id =
                    within_budget(self.write_timeout, self.durable.insert_transaction(transaction))
                        .await?;
                self.adopt(transaction, &durable_id).await;
                Ok(Settled::Synced)
            }
            PendingOp::Update { transaction } => {
                within_budget(self.write_timeout, self.durable.update_transaction(transaction))
                    .await?;
                Ok(Settled::Synced)
            }
            PendingOp::Delete { id, origin_key, .. } if id.is_pending() => {
                // Cancelled insert: only a late durable twin needs removing.
                let Some(twin) = origin_key.as_ref().and_then(|key| durable_keys.get(key)) else {
                    return Ok(Settled::Synced);
                };
                within_budget(
                    self.write_timeout,
                    self.durable.delete_transaction(user_id, &twin.id),
                )
                .await?;
                if let Err(e) = self.local.remove_view_transaction(user_id, &twin.id) {
                    warn!(tx = %twin.id, error = %e, "Failed to drop deleted twin from cache");
                }
                Ok(Settled::Deduplicated)
            }
            PendingOp::Delete { id, .. } => {
                within_budget(self.write_timeout, self.durable.delete_transaction(user_id, id))
                    .await?;
                Ok(Settled::Synced)
            }
        }
    }

    /// Rewrite a pending id to its durable id locally and in positions.
    async fn adopt(&self, pending: &Transaction, durable_id: &TransactionId) {
        if let Err(e) = self
            .local
            .adopt_durable_id(&pending.user_id, &pending.id, durable_id)
        {
            warn!(tx = %pending.id, error = %e, "Failed to rewrite pending id in cache");
        }
        if let Err(e) = self
            .positions
            .replace_transaction_id(&pending.user_id, &pending.asset, &pending.id, durable_id)
            .await
        {
            warn!(tx = %pending.id, error = %e, "Failed to rewrite pending id in positions");
        }
    }
}
