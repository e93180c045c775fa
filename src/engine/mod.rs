//! Pure computation engine(s) for deterministic ledger logic.

pub mod portfolio;
pub mod position_tracker;
pub mod wac;

pub use portfolio::{
    AssetValuation, PortfolioSummary, PortfolioValuator, PriceError, PriceSource, Quote,
    StaticPriceSource,
};
pub use position_tracker::{
    apply_new_transaction, replay_episodes, ApplyOutcome, PositionTracker, TrackerError,
    TransactionLink,
};
pub use wac::{valuate, ArithmeticOverflow, ValuationResult, WacState};
