//! Weighted-average-cost valuation.

use crate::domain::ordering::sorted_refs;
use crate::domain::{Decimal, Side, Transaction};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A WAC quantity left the representable decimal range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("decimal overflow computing {0}")]
pub struct ArithmeticOverflow(pub &'static str);

fn checked(value: Option<Decimal>, what: &'static str) -> Result<Decimal, ArithmeticOverflow> {
    value.ok_or(ArithmeticOverflow(what))
}

/// Running WAC accumulator shared by valuation and position tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WacState {
    pub qty: Decimal,
    pub cost: Decimal,
    pub avg_cost: Decimal,
    pub realized: Decimal,
}

impl WacState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one transaction.
    ///
    /// Buys re-blend the average; sells realize against it and leave it
    /// untouched. On overflow the state is left as it was.
    pub fn apply(&mut self, side: Side, amount: Decimal, price: Decimal) -> Result<(), ArithmeticOverflow> {
        match side {
            Side::Buy => {
                let notional = checked(amount.checked_mul(price), "buy notional")?;
                let cost = checked(self.cost.checked_add(notional), "cost basis")?;
                let qty = checked(self.qty.checked_add(amount), "holdings")?;
                // No long inventory to average over (orphan sells drove qty
                // to or below zero).
                let avg_cost = if qty.is_positive() {
                    checked(cost.checked_div(qty), "average cost")?
                } else {
                    Decimal::zero()
                };
                self.cost = cost;
                self.qty = qty;
                self.avg_cost = avg_cost;
            }
            Side::Sell => {
                let pnl = price
                    .checked_sub(self.avg_cost)
                    .and_then(|margin| margin.checked_mul(amount))
                    .and_then(|pnl| self.realized.checked_add(pnl));
                let realized = checked(pnl, "realized PnL")?;
                let released = self
                    .avg_cost
                    .checked_mul(amount)
                    .and_then(|basis| self.cost.checked_sub(basis));
                let cost = checked(released, "cost basis")?;
                let qty = checked(self.qty.checked_sub(amount), "holdings")?;
                self.realized = realized;
                self.cost = cost;
                self.qty = qty;
            }
        }
        Ok(())
    }

    pub fn apply_transaction(&mut self, tx: &Transaction) -> Result<(), ArithmeticOverflow> {
        self.apply(tx.side, tx.amount, tx.unit_price())
    }

    /// Snap to exact zero when the held quantity is dust.
    ///
    /// Returns true if the state is flat afterwards.
    pub fn snap_dust(&mut self) -> bool {
        if self.qty.is_dust() {
            self.qty = Decimal::zero();
            self.cost = Decimal::zero();
            self.avg_cost = Decimal::zero();
            true
        } else {
            false
        }
    }
}

/// Derived valuation of one asset at a market price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValuationResult {
    pub holdings: Decimal,
    pub avg_buy_price: Decimal,
    pub total_cost: Decimal,
    #[serde(rename = "realizedPnL")]
    pub realized_pnl: Decimal,
    #[serde(rename = "unrealizedPnL")]
    pub unrealized_pnl: Decimal,
    #[serde(rename = "totalPnL")]
    pub total_pnl: Decimal,
    /// Total PnL over total buy notional, in percent.
    pub pnl_percent: Decimal,
}

/// Value a set of transactions for one asset at `current_price`.
///
/// Input order is irrelevant; transactions are sorted first.
///
/// # Errors
/// `ArithmeticOverflow` if an intermediate leaves the decimal range.
pub fn valuate(
    transactions: &[Transaction],
    current_price: Decimal,
) -> Result<ValuationResult, ArithmeticOverflow> {
    let mut state = WacState::new();
    let mut invested = Decimal::zero();

    for tx in sorted_refs(transactions) {
        state.apply_transaction(tx)?;
        if tx.side == Side::Buy {
            let notional = tx.amount.checked_mul(tx.unit_price());
            invested = checked(notional.and_then(|n| invested.checked_add(n)), "invested")?;
        }
    }
    state.snap_dust();

    let market = state
        .qty
        .checked_mul(current_price)
        .and_then(|value| value.checked_sub(state.cost));
    let unrealized = checked(market, "unrealized PnL")?;
    let total = checked(state.realized.checked_add(unrealized), "total PnL")?;
    let pnl_percent = if invested.is_positive() {
        let ratio = total
            .checked_div(invested)
            .and_then(|r| r.checked_mul(Decimal::hundred()));
        checked(ratio, "PnL percent")?
    } else {
        Decimal::zero()
    };

    Ok(ValuationResult {
        holdings: state.qty,
        avg_buy_price: state.avg_cost,
        total_cost: state.cost,
        realized_pnl: state.realized,
        unrealized_pnl: unrealized,
        total_pnl: total,
        pnl_percent,
    })
}
