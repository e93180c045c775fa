use crate::domain::ordering::sorted_refs;
use crate::domain::{Decimal, Position, PositionId, PositionStatus, Side, Transaction, TransactionId};
use std::collections::VecDeque;
use thiserror::Error;

use super::{ArithmeticOverflow, WacState};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackerError {
    #[error("position {0} is closed")]
    PositionClosed(PositionId),
    #[error("transaction {tx} does not belong to position {position}")]
    Mismatch {
        tx: TransactionId,
        position: PositionId,
    },
    #[error(transparent)]
    Overflow(#[from] ArithmeticOverflow),
}

/// What an incremental apply did to the position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Arithmetic applied; the transaction is the `entry_index`-th member.
    Applied { entry_index: u32, closed: bool },
    /// Same content already applied under another id; only the id was swapped.
    Relinked { entry_index: u32 },
    /// Same content and id already applied; nothing changed.
    Unchanged { entry_index: u32 },
}

impl ApplyOutcome {
    pub fn entry_index(&self) -> u32 {
        match self {
            ApplyOutcome::Applied { entry_index, .. }
            | ApplyOutcome::Relinked { entry_index }
            | ApplyOutcome::Unchanged { entry_index } => *entry_index,
        }
    }
}

/// Apply a single new transaction to an open position.
///
/// Keyed by content: re-applying a transaction whose pending id has since been
/// replaced by a durable one only swaps the stored id.
pub fn apply_new_transaction(
    position: &mut Position,
    tx: &Transaction,
) -> Result<ApplyOutcome, TrackerError> {
    if tx.user_id != position.user_id || tx.asset != position.asset {
        return Err(TrackerError::Mismatch {
            tx: tx.id.clone(),
            position: position.id.clone(),
        });
    }

    let content_key = tx.content_key();
    if let Some(slot) = position.content_keys.iter().position(|k| *k == content_key) {
        let entry_index = slot as u32 + 1;
        if position.transaction_ids[slot] == tx.id {
            return Ok(ApplyOutcome::Unchanged { entry_index });
        }
        position.transaction_ids[slot] = tx.id.clone();
        return Ok(ApplyOutcome::Relinked { entry_index });
    }

    if !position.is_open() {
        return Err(TrackerError::PositionClosed(position.id.clone()));
    }

    let closed = step(position, tx)?;
    position.transaction_ids.push(tx.id.clone());
    position.content_keys.push(content_key);
    position.updated_at = position.updated_at.max(tx.created_at);

    Ok(ApplyOutcome::Applied {
        entry_index: position.transaction_ids.len() as u32,
        closed,
    })
}

/// Run the WAC step against the position's numeric fields and re-evaluate
/// its status. Returns true if the step closed the position.
fn step(position: &mut Position, tx: &Transaction) -> Result<bool, ArithmeticOverflow> {
    let mut state = WacState {
        qty: position.current_size,
        cost: position.total_cost,
        avg_cost: position.avg_entry_price,
        realized: position.realized_pnl_abs,
    };
    state.apply_transaction(tx)?;

    if state.qty.is_negative() && !state.qty.is_dust() {
        tracing::warn!(
            position = %position.id,
            tx = %tx.id,
            oversold = %state.qty.abs(),
            "Sell exceeds position size, closing at zero"
        );
    }

    // Positions never hold a negative size.
    let flat = state.qty.is_negative() || state.snap_dust();
    if flat {
        state.qty = Decimal::zero();
        state.cost = Decimal::zero();
        state.avg_cost = Decimal::zero();
    }

    position.current_size = state.qty;
    position.total_cost = state.cost;
    position.avg_entry_price = state.avg_cost;
    position.realized_pnl_abs = state.realized;

    if flat {
        position.status = PositionStatus::Closed;
        position.closed_at = Some(tx.date);
    }
    Ok(flat)
}

/// Linkage of one transaction after replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionLink {
    pub transaction_id: TransactionId,
    /// `None` for orphan sells.
    pub position_id: Option<PositionId>,
    pub entry_index: Option<u32>,
}

/// Replays a full transaction history into position episodes.
pub struct PositionTracker {
    reusable_ids: VecDeque<PositionId>,
    current: Option<Position>,

    // Outputs accumulated during processing.
    episodes: Vec<Position>,
    links: Vec<TransactionLink>,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self::with_reusable_ids(Vec::new())
    }

    /// Episodes take ids from `ids` in order before minting new ones.
    pub fn with_reusable_ids(ids: Vec<PositionId>) -> Self {
        Self {
            reusable_ids: ids.into(),
            current: None,
            episodes: Vec::new(),
            links: Vec::new(),
        }
    }

    /// Process one transaction. Callers must feed transactions in ledger order.
    ///
    /// # Errors
    /// `TrackerError::Overflow` if the WAC step overflows.
    pub fn process_transaction(&mut self, tx: &Transaction) -> Result<(), TrackerError> {
        if self.current.is_none() {
            if tx.side == Side::Sell {
                self.links.push(TransactionLink {
                    transaction_id: tx.id.clone(),
                    position_id: None,
                    entry_index: None,
                });
                return Ok(());
            }
            let id = self
                .reusable_ids
                .pop_front()
                .unwrap_or_else(PositionId::generate);
            self.current = Some(Position::open(
                id,
                tx.user_id.clone(),
                tx.asset.clone(),
                tx.date,
            ));
        }

        let Some(position) = self.current.as_mut() else {
            return Ok(());
        };
        let closed = step(position, tx)?;
        position.transaction_ids.push(tx.id.clone());
        position.content_keys.push(tx.content_key());
        position.updated_at = position.updated_at.max(tx.created_at);

        self.links.push(TransactionLink {
            transaction_id: tx.id.clone(),
            position_id: Some(position.id.clone()),
            entry_index: Some(position.transaction_ids.len() as u32),
        });

        if closed {
            if let Some(done) = self.current.take() {
                self.episodes.push(done);
            }
        }
        Ok(())
    }

    /// Get the accumulated outputs: episodes in opening order and one link per
    /// processed transaction.
    pub fn into_outputs(mut self) -> (Vec<Position>, Vec<TransactionLink>) {
        if let Some(open) = self.current.take() {
            self.episodes.push(open);
        }
        (self.episodes, self.links)
    }
}

impl Default for PositionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Sort `transactions` and replay them into episodes.
pub fn replay_episodes(
    transactions: &[Transaction],
    reusable_ids: Vec<PositionId>,
) -> Result<(Vec<Position>, Vec<TransactionLink>), TrackerError> {
    let mut tracker = PositionTracker::with_reusable_ids(reusable_ids);
    for tx in sorted_refs(transactions) {
        tracker.process_transaction(tx)?;
    }
    Ok(tracker.into_outputs())
}
