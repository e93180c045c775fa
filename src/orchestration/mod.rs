//! Store-backed coordination: the transaction façade, the position manager,
//! degraded-mode bookkeeping and resync.

pub mod facade;
pub mod local;
pub mod locks;
pub mod positions;
pub mod resync;

pub use facade::{Durability, RepairReport, TransactionStore, WriteOutcome};
pub use local::{merge_pending, LocalLedger, PendingOp};
pub use locks::KeyedLocks;
pub use positions::{Linkage, PositionManager};
pub use resync::ResyncReport;

use crate::store::StoreError;
use std::future::Future;
use std::time::Duration;

/// Race a durable store call against `budget`.
///
/// The inner future is dropped on expiry; whatever it already dispatched may
/// still land.
pub(crate) async fn within_budget<T, F>(budget: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(budget, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(budget.as_millis() as u64)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_within_budget_reports_timeout() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, StoreError>(1)
        };
        let err = within_budget(Duration::from_millis(5), slow).await.unwrap_err();
        assert_eq!(err, StoreError::Timeout(5));

        let fast = async { Ok::<_, StoreError>(2) };
        assert_eq!(within_budget(Duration::from_millis(5), fast).await, Ok(2));
    }
}
