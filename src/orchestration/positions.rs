//! Store-backed position lifecycle: incremental linking and episode persistence.

use super::local::LocalLedger;
use super::within_budget;
use crate::domain::{Asset, Position, PositionId, Side, Transaction, TransactionId, UserId};
use crate::engine::{apply_new_transaction, ApplyOutcome};
use crate::error::LedgerError;
use crate::store::DurableStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Where a transaction landed inside its position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Linkage {
    pub position_id: PositionId,
    pub entry_index: u32,
}

#[derive(Debug, Clone)]
pub struct PositionManager {
    durable: Arc<dyn DurableStore>,
    local: LocalLedger,
    write_timeout: Duration,
}

impl PositionManager {
    pub fn new(durable: Arc<dyn DurableStore>, local: LocalLedger, write_timeout: Duration) -> Self {
        Self {
            durable,
            local,
            write_timeout,
        }
    }

    /// Attach a freshly written transaction to the open position of its
    /// (user, asset), opening one on a buy.
    ///
    /// Never fails the caller: lookup or persistence errors are logged and
    /// the transaction stays unlinked.
    pub async fn link_new_transaction(&self, tx: &Transaction) -> Option<Linkage> {
        match self.try_link(tx).await {
            Ok(linkage) => linkage,
            Err(e) => {
                warn!(
                    user = %tx.user_id,
                    asset = %tx.asset,
                    tx = %tx.id,
                    error = %e,
                    "Position linkage failed, transaction left unlinked"
                );
                None
            }
        }
    }

    async fn try_link(&self, tx: &Transaction) -> Result<Option<Linkage>, LedgerError> {
        let mut position = match self.open_position(&tx.user_id, &tx.asset).await? {
            Some(open) => open,
            None if tx.side == Side::Buy => Position::open(
                PositionId::generate(),
                tx.user_id.clone(),
                tx.asset.clone(),
                tx.date,
            ),
            None => {
                warn!(
                    user = %tx.user_id,
                    asset = %tx.asset,
                    tx = %tx.id,
                    "Sell without an open position, recording unlinked"
                );
                return Ok(None);
            }
        };

        let outcome = apply_new_transaction(&mut position, tx)?;
        match outcome {
            ApplyOutcome::Unchanged { .. } => {}
            ApplyOutcome::Applied { closed, .. } => {
                if closed {
                    info!(position = %position.id, asset = %position.asset, "Position closed");
                }
                self.persist(&position).await?;
            }
            ApplyOutcome::Relinked { .. } => self.persist(&position).await?,
        }

        Ok(Some(Linkage {
            position_id: position.id,
            entry_index: outcome.entry_index(),
        }))
    }

    /// Write a position durably (best-effort) and to the local mirror.
    async fn persist(&self, position: &Position) -> Result<(), LedgerError> {
        if let Err(e) = within_budget(self.write_timeout, self.durable.upsert_position(position)).await {
            warn!(position = %position.id, error = %e, "Durable position write failed, kept locally");
        }
        self.local.upsert_position(position)?;
        Ok(())
    }

    /// Positions of one (user, asset) in opening order.
    ///
    /// Durable records are overlaid with local copies that carry more members,
    /// so positions written while degraded stay visible.
    pub async fn positions(&self, user_id: &UserId, asset: &Asset) -> Result<Vec<Position>, LedgerError> {
        let cached = self.local.load_positions(user_id, asset)?;
        let durable = match within_budget(
            self.write_timeout,
            self.durable.query_positions(user_id, Some(asset)),
        )
        .await
        {
            Ok(durable) => durable,
            Err(e) if e.is_transient() => {
                debug!(user = %user_id, asset = %asset, error = %e, "Reading positions from local mirror");
                return Ok(cached);
            }
            Err(e) => return Err(e.into()),
        };

        let mut by_id: HashMap<PositionId, Position> =
            durable.into_iter().map(|p| (p.id.clone(), p)).collect();
        for local in cached {
            match by_id.get(&local.id) {
                Some(remote) if remote.transaction_ids.len() >= local.transaction_ids.len() => {}
                _ => {
                    by_id.insert(local.id.clone(), local);
                }
            }
        }

        let mut merged: Vec<Position> = by_id.into_values().collect();
        merged.sort_by(|a, b| a.opened_at.cmp(&b.opened_at).then_with(|| a.id.cmp(&b.id)));
        Ok(merged)
    }

    /// The single open position of a (user, asset), if any.
    pub async fn open_position(&self, user_id: &UserId, asset: &Asset) -> Result<Option<Position>, LedgerError> {
        let positions = self.positions(user_id, asset).await?;
        let mut open = positions.into_iter().filter(Position::is_open);
        let first = open.next();
        if open.next().is_some() {
            warn!(user = %user_id, asset = %asset, "More than one open position, using the earliest");
        }
        Ok(first)
    }

    pub async fn get_position(&self, id: &PositionId) -> Result<Option<Position>, LedgerError> {
        Ok(within_budget(self.write_timeout, self.durable.get_position(id)).await?)
    }

    /// Assets the user holds positions for, durable and mirrored.
    pub async fn position_assets(&self, user_id: &UserId) -> Result<Vec<Asset>, LedgerError> {
        let mut assets = self.local.position_assets(user_id)?;
        match within_budget(self.write_timeout, self.durable.query_positions(user_id, None)).await {
            Ok(durable) => assets.extend(durable.into_iter().map(|p| p.asset)),
            Err(e) if e.is_transient() => {}
            Err(e) => return Err(e.into()),
        }
        assets.sort();
        assets.dedup();
        Ok(assets)
    }

    /// Swap a pending member id for its durable id in every position of the
    /// (user, asset). Best-effort on the durable side.
    pub async fn replace_transaction_id(
        &self,
        user_id: &UserId,
        asset: &Asset,
        old: &TransactionId,
        new: &TransactionId,
    ) -> Result<(), LedgerError> {
        for mut position in self.positions(user_id, asset).await? {
            if position.replace_transaction_id(old, new) {
                self.persist(&position).await?;
            }
        }
        Ok(())
    }

    /// Persist a full replay: `episodes` overwrite their stored counterparts and
    /// positions in `existing` without an episode are deleted.
    pub async fn store_episodes(
        &self,
        user_id: &UserId,
        asset: &Asset,
        episodes: &[Position],
        existing: &[Position],
    ) -> Result<(), LedgerError> {
        for episode in episodes {
            if let Err(e) =
                within_budget(self.write_timeout, self.durable.upsert_position(episode)).await
            {
                warn!(position = %episode.id, error = %e, "Durable position write failed during replay");
            }
        }

        for surplus in existing.iter().filter(|p| !episodes.iter().any(|e| e.id == p.id)) {
            debug!(position = %surplus.id, "Deleting surplus position");
            if let Err(e) =
                within_budget(self.write_timeout, self.durable.delete_position(&surplus.id)).await
            {
                warn!(position = %surplus.id, error = %e, "Durable position delete failed during replay");
            }
        }

        self.local.save_positions_for(user_id, asset, episodes)?;
        Ok(())
    }
}
