//! Multi-asset valuation on top of the WAC engine.
//!
//! The engine itself takes prices as parameters; this layer is the caller
//! that looks them up through a [`PriceSource`].

use crate::domain::{Asset, Decimal, Transaction};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use super::{valuate, ArithmeticOverflow, ValuationResult};

/// Current market quote for an asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub price: Decimal,
    pub change_24h: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PriceError {
    #[error("no quote for {0}")]
    Unavailable(Asset),
    #[error("price provider error: {0}")]
    Provider(String),
}

/// Current-price lookup.
#[async_trait]
pub trait PriceSource: Send + Sync + fmt::Debug {
    async fn price_of(&self, asset: &Asset) -> Result<Quote, PriceError>;
}

/// Fixed quotes, for tests and offline runs.
#[derive(Debug, Clone, Default)]
pub struct StaticPriceSource {
    quotes: HashMap<Asset, Quote>,
}

impl StaticPriceSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quote(mut self, asset: Asset, price: Decimal, change_24h: Decimal) -> Self {
        self.quotes.insert(asset, Quote { price, change_24h });
        self
    }
}

#[async_trait]
impl PriceSource for StaticPriceSource {
    async fn price_of(&self, asset: &Asset) -> Result<Quote, PriceError> {
        self.quotes
            .get(asset)
            .copied()
            .ok_or_else(|| PriceError::Unavailable(asset.clone()))
    }
}

/// Valuation of one asset together with the quote used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetValuation {
    pub asset: Asset,
    /// `None` when the price lookup failed; unrealized PnL then assumes zero.
    pub quote: Option<Quote>,
    pub market_value: Decimal,
    pub valuation: ValuationResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioSummary {
    pub assets: Vec<AssetValuation>,
    pub total_value: Decimal,
    pub total_cost: Decimal,
    #[serde(rename = "realizedPnL")]
    pub realized_pnl: Decimal,
    #[serde(rename = "unrealizedPnL")]
    pub unrealized_pnl: Decimal,
    #[serde(rename = "totalPnL")]
    pub total_pnl: Decimal,
}

#[derive(Clone)]
pub struct PortfolioValuator {
    prices: Arc<dyn PriceSource>,
}

impl PortfolioValuator {
    pub fn new(prices: Arc<dyn PriceSource>) -> Self {
        Self { prices }
    }

    /// Group `transactions` by asset and value each at its current quote.
    pub async fn summarize(
        &self,
        transactions: &[Transaction],
    ) -> Result<PortfolioSummary, ArithmeticOverflow> {
        let mut by_asset: BTreeMap<&Asset, Vec<Transaction>> = BTreeMap::new();
        for tx in transactions {
            by_asset.entry(&tx.asset).or_default().push(tx.clone());
        }

        let mut summary = PortfolioSummary::default();
        for (asset, txs) in by_asset {
            let quote = match self.prices.price_of(asset).await {
                Ok(quote) => Some(quote),
                Err(e) => {
                    tracing::warn!(asset = %asset, error = %e, "Price lookup failed, valuing at zero");
                    None
                }
            };
            let price = quote.map(|q| q.price).unwrap_or_default();
            let valuation = valuate(&txs, price)?;
            let market_value = valuation
                .holdings
                .checked_mul(price)
                .ok_or(ArithmeticOverflow("market value"))?;

            accumulate(&mut summary.total_value, market_value, "total value")?;
            accumulate(&mut summary.total_cost, valuation.total_cost, "total cost")?;
            accumulate(&mut summary.realized_pnl, valuation.realized_pnl, "realized PnL")?;
            accumulate(&mut summary.unrealized_pnl, valuation.unrealized_pnl, "unrealized PnL")?;
            accumulate(&mut summary.total_pnl, valuation.total_pnl, "total PnL")?;
            summary.assets.push(AssetValuation {
                asset: asset.clone(),
                quote,
                market_value,
                valuation,
            });
        }
        Ok(summary)
    }
}

fn accumulate(total: &mut Decimal, value: Decimal, what: &'static str) -> Result<(), ArithmeticOverflow> {
    *total = total.checked_add(value).ok_or(ArithmeticOverflow(what))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewTransaction, Side, TimeMs, UserId};

    fn d(s: &str) -> Decimal {
        Decimal::from_str_canonical(s).unwrap()
    }

    fn tx(asset: &str, side: Side, amount: &str, price: &str, date: i64) -> Transaction {
        NewTransaction::new(asset, side, d(amount), d(price), TimeMs::new(date))
            .validate(&UserId::new("u1"), TimeMs::new(date))
            .unwrap()
    }

    #[tokio::test]
    async fn test_summarize_groups_by_asset() {
        let prices = StaticPriceSource::new()
            .with_quote(Asset::new("BTC").unwrap(), d("30000"), d("2.5"))
            .with_quote(Asset::new("ETH").unwrap(), d("2000"), d("-1"));
        let valuator = PortfolioValuator::new(Arc::new(prices));

        let txs = vec![
            tx("btc", Side::Buy, "1", "20000", 1),
            tx("eth", Side::Buy, "2", "1500", 2),
            tx("eth", Side::Sell, "1", "1800", 3),
        ];
        let summary = valuator.summarize(&txs).await.unwrap();

        assert_eq!(summary.assets.len(), 2);
        assert_eq!(summary.assets[0].asset.as_str(), "BTC");
        assert_eq!(summary.assets[0].market_value, d("30000"));
        assert_eq!(summary.assets[1].valuation.holdings, d("1"));
        assert_eq!(summary.total_value, d("32000"));
        assert_eq!(summary.total_cost, d("21500"));
        assert_eq!(summary.realized_pnl, d("300"));
        assert_eq!(summary.unrealized_pnl, d("10500"));
        assert_eq!(summary.total_pnl, d("10800"));
    }

    #[tokio::test]
    async fn test_missing_quote_values_at_zero() {
        let valuator = PortfolioValuator::new(Arc::new(StaticPriceSource::new()));
        let summary = valuator
            .summarize(&[tx("sol", Side::Buy, "10", "20", 1)])
            .await
            .unwrap();

        assert_eq!(summary.assets[0].quote, None);
        assert_eq!(summary.total_value, Decimal::zero());
        assert_eq!(summary.unrealized_pnl, d("-200"));
    }
}
