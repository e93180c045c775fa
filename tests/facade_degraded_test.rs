use async_trait::async_trait;
use position_ledger::domain::ValidationError;
use position_ledger::orchestration::ResyncReport;
use position_ledger::{
    Asset, Decimal, Durability, DurableStore, FileCache, LedgerError, MemoryCache, MemoryStore,
    NewTransaction, Position, PositionId, PositionStatus, RepairReport, Side, StoreError,
    StoreEvent, TimeMs, Transaction, TransactionEdit, TransactionId, TransactionStore, UserId,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc};
use tokio_test::{assert_err, assert_ok};

fn d(s: &str) -> Decimal {
    Decimal::from_str_canonical(s).unwrap()
}

fn user() -> UserId {
    UserId::new("user-1")
}

fn btc() -> Asset {
    Asset::new("BTC").unwrap()
}

fn trade(side: Side, amount: &str, price: &str, date: i64) -> NewTransaction {
    NewTransaction::new("btc", side, d(amount), d(price), TimeMs::new(date))
}

fn ledger(
    store: &MemoryStore,
    timeout_ms: u64,
) -> (TransactionStore, mpsc::UnboundedReceiver<RepairReport>) {
    TransactionStore::new(
        Arc::new(store.clone()),
        Arc::new(MemoryCache::new()),
        Duration::from_millis(timeout_ms),
    )
}

async fn next_report(reports: &mut mpsc::UnboundedReceiver<RepairReport>) -> RepairReport {
    tokio::time::timeout(Duration::from_secs(2), reports.recv())
        .await
        .expect("no repair report")
        .expect("report channel closed")
}

#[tokio::test]
async fn test_offline_add_is_replaced_by_durable_id_on_resync() {
    let store = MemoryStore::new();
    let (ledger, mut reports) = ledger(&store, 200);
    store.set_online(false);

    let outcome = assert_ok!(ledger.add_transaction(&user(), trade(Side::Buy, "1", "100", 1_000)).await);
    assert_eq!(outcome.durability, Durability::Deferred);
    assert!(outcome.transaction.id.is_pending());
    assert!(outcome.transaction.position_id.is_some());
    assert!(ledger.is_degraded());

    let offline = ledger.transactions(&user(), &btc()).await.unwrap();
    assert_eq!(offline, vec![outcome.transaction.clone()]);

    store.set_online(true);
    let merged = ledger.transactions(&user(), &btc()).await.unwrap();
    assert_eq!(merged.len(), 1);
    assert!(!merged[0].id.is_pending());
    assert_eq!(merged[0].content_key(), outcome.transaction.content_key());
    assert!(!ledger.is_degraded());
    assert_eq!(store.transaction_count(), 1);

    let report = next_report(&mut reports).await;
    let positions = report.result.unwrap();
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].transaction_ids, vec![merged[0].id.clone()]);
    assert_eq!(Some(positions[0].id.clone()), outcome.transaction.position_id);
}

#[tokio::test]
async fn test_late_durable_write_is_not_duplicated() {
    let store = MemoryStore::new();
    let (ledger, _reports) = ledger(&store, 20);
    store.set_latency(Duration::from_millis(100));

    let outcome = ledger
        .add_transaction(&user(), trade(Side::Buy, "2", "50", 1_000))
        .await
        .unwrap();
    assert_eq!(outcome.durability, Durability::Deferred);

    // The timed-out insert still lands.
    store.set_latency(Duration::ZERO);
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(store.transaction_count(), 1);

    let merged = ledger.all_transactions(&user()).await.unwrap();
    assert_eq!(merged.len(), 1);
    assert!(!merged[0].id.is_pending());

    let report = ledger.resync(&user()).await.unwrap();
    assert_eq!(report, ResyncReport::default());
    assert_eq!(store.transaction_count(), 1);
}

#[tokio::test]
async fn test_explicit_resync_deduplicates_late_write() {
    let store = MemoryStore::new();
    let (ledger, _reports) = ledger(&store, 20);
    store.set_latency(Duration::from_millis(100));

    ledger
        .add_transaction(&user(), trade(Side::Buy, "2", "50", 1_000))
        .await
        .unwrap();
    store.set_latency(Duration::ZERO);
    tokio::time::sleep(Duration::from_millis(250)).await;

    let report = ledger.resync(&user()).await.unwrap();
    assert_eq!(
        report,
        ResyncReport {
            synced: 0,
            deduplicated: 1,
            remaining: 0
        }
    );
    assert_eq!(store.transaction_count(), 1);
}

#[tokio::test]
async fn test_edit_of_late_written_insert_is_not_duplicated() {
    let store = MemoryStore::new();
    let (ledger, _reports) = ledger(&store, 20);
    store.set_latency(Duration::from_millis(100));

    let pending = ledger
        .add_transaction(&user(), trade(Side::Buy, "1", "100", 1_000))
        .await
        .unwrap()
        .transaction;
    assert!(pending.id.is_pending());
    let edited = ledger
        .update_transaction(
            &user(),
            &pending.id,
            TransactionEdit {
                price: Some(d("120")),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(edited.price, Some(d("120")));

    // The timed-out insert lands with the original price.
    store.set_latency(Duration::ZERO);
    tokio::time::sleep(Duration::from_millis(250)).await;

    let merged = ledger.all_transactions(&user()).await.unwrap();
    assert_eq!(merged.len(), 1);
    assert!(!merged[0].id.is_pending());
    assert_eq!(merged[0].price, Some(d("120")));

    assert_eq!(store.transaction_count(), 1);
    let durable = store.query_user_transactions(&user()).await.unwrap();
    assert_eq!(durable[0].price, Some(d("120")));
}

#[tokio::test]
async fn test_delete_of_late_written_insert_stays_deleted() {
    let store = MemoryStore::new();
    let (ledger, _reports) = ledger(&store, 20);
    store.set_latency(Duration::from_millis(100));

    let pending = ledger
        .add_transaction(&user(), trade(Side::Buy, "1", "100", 1_000))
        .await
        .unwrap()
        .transaction;
    ledger.delete_transaction(&user(), &pending.id).await.unwrap();

    store.set_latency(Duration::ZERO);
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(store.transaction_count(), 1, "the timed-out insert landed");

    assert!(ledger.all_transactions(&user()).await.unwrap().is_empty());
    assert_eq!(store.transaction_count(), 0);
    assert!(ledger.all_transactions(&user()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_degraded_edit_and_delete_are_queued() {
    let store = MemoryStore::new();
    let (ledger, _reports) = ledger(&store, 200);

    let first = ledger
        .add_transaction(&user(), trade(Side::Buy, "2", "100", 1_000))
        .await
        .unwrap()
        .transaction;
    let second = ledger
        .add_transaction(&user(), trade(Side::Buy, "1", "200", 2_000))
        .await
        .unwrap()
        .transaction;
    assert_eq!(store.transaction_count(), 2);

    store.set_online(false);
    let edit = TransactionEdit {
        price: Some(d("150")),
        ..Default::default()
    };
    let edited = ledger
        .update_transaction(&user(), &first.id, edit)
        .await
        .unwrap();
    assert_eq!(edited.price, Some(d("150")));
    ledger.delete_transaction(&user(), &second.id).await.unwrap();

    let offline = ledger.transactions(&user(), &btc()).await.unwrap();
    assert_eq!(offline.len(), 1);
    assert_eq!(offline[0].price, Some(d("150")));

    store.set_online(true);
    let online = ledger.transactions(&user(), &btc()).await.unwrap();
    assert_eq!(online.len(), 1);
    assert_eq!(online[0].id, first.id);
    assert_eq!(online[0].price, Some(d("150")));
    assert_eq!(store.transaction_count(), 1);

    let durable = store.query_transactions(&user(), &btc()).await.unwrap();
    assert_eq!(durable[0].price, Some(d("150")));
}

#[tokio::test]
async fn test_pending_insert_deleted_before_sync_never_reaches_store() {
    let store = MemoryStore::new();
    let (ledger, _reports) = ledger(&store, 200);
    store.set_online(false);

    let pending = ledger
        .add_transaction(&user(), trade(Side::Buy, "1", "100", 1_000))
        .await
        .unwrap()
        .transaction;
    ledger.delete_transaction(&user(), &pending.id).await.unwrap();

    store.set_online(true);
    assert!(ledger.all_transactions(&user()).await.unwrap().is_empty());
    assert_eq!(store.transaction_count(), 0);
}

#[tokio::test]
async fn test_invalid_input_is_rejected_before_any_write() {
    let store = MemoryStore::new();
    let (ledger, _reports) = ledger(&store, 200);

    let err = assert_err!(ledger.add_transaction(&user(), trade(Side::Buy, "0", "100", 1)).await);
    assert!(matches!(
        err,
        LedgerError::Validation(ValidationError::NonPositiveAmount(_))
    ));

    let mut unknown = trade(Side::Buy, "1", "100", 1);
    unknown.side = "airdrop".to_string();
    let err = assert_err!(ledger.add_transaction(&user(), unknown).await);
    assert!(matches!(err, LedgerError::Validation(ValidationError::UnknownType(_))));

    assert_eq!(store.transaction_count(), 0);
}

#[tokio::test]
async fn test_update_of_unknown_transaction_is_not_found() {
    let store = MemoryStore::new();
    let (ledger, _reports) = ledger(&store, 200);
    let missing = TransactionId::durable("nope").unwrap();

    let err = ledger
        .update_transaction(&user(), &missing, TransactionEdit::default())
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::NotFound(_)));
    assert_ok!(ledger.delete_transaction(&user(), &missing).await);
}

#[tokio::test]
async fn test_backdated_buy_is_relinked_by_replay() {
    let store = MemoryStore::new();
    let (ledger, mut reports) = ledger(&store, 200);

    let later = ledger
        .add_transaction(&user(), trade(Side::Buy, "1", "100", 2_000))
        .await
        .unwrap()
        .transaction;
    let backdated = ledger
        .add_transaction(&user(), trade(Side::Buy, "1", "200", 1_000))
        .await
        .unwrap()
        .transaction;
    assert_eq!(backdated.entry_index, Some(2));

    let positions = ledger.recalculate_all_positions(&user()).await.unwrap();
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].transaction_ids, vec![backdated.id.clone(), later.id.clone()]);
    assert_eq!(positions[0].avg_entry_price, d("150"));

    let relinked = ledger.transactions(&user(), &btc()).await.unwrap();
    assert_eq!(relinked[0].id, backdated.id);
    assert_eq!(relinked[0].entry_index, Some(1));
    assert_eq!(relinked[1].entry_index, Some(2));

    let position_id = positions[0].id.clone();
    let rebuilt = ledger.recalculate_position(&position_id).await.unwrap();
    assert_eq!(rebuilt.id, position_id);
    assert!(reports.try_recv().is_err());

    let unknown = ledger
        .recalculate_position(&PositionId::new("missing"))
        .await
        .unwrap_err();
    assert!(matches!(unknown, LedgerError::NotFound(_)));
}

#[tokio::test]
async fn test_recalculate_twice_is_stable() {
    let store = MemoryStore::new();
    let (ledger, _reports) = ledger(&store, 200);

    for (side, amount, price, date) in [
        (Side::Buy, "1", "100", 2_000),
        (Side::Buy, "1", "200", 1_000),
        (Side::Sell, "2", "150", 3_000),
        (Side::Buy, "1", "300", 4_000),
    ] {
        ledger
            .add_transaction(&user(), trade(side, amount, price, date))
            .await
            .unwrap();
    }

    let first = ledger.recalculate(&user(), &btc()).await.unwrap();
    let stored_first = ledger
        .position_manager()
        .positions(&user(), &btc())
        .await
        .unwrap();
    let linked_first = ledger.transactions(&user(), &btc()).await.unwrap();

    assert_eq!(first.len(), 2);
    assert_eq!(first[0].status, PositionStatus::Closed);
    assert_eq!(first[0].realized_pnl_abs, Decimal::zero());
    assert_eq!(stored_first, first);
    assert_eq!(linked_first[0].price, Some(d("200")));
    assert_eq!(linked_first[0].entry_index, Some(1));

    let second = ledger.recalculate(&user(), &btc()).await.unwrap();
    let stored_second = ledger
        .position_manager()
        .positions(&user(), &btc())
        .await
        .unwrap();
    let linked_second = ledger.transactions(&user(), &btc()).await.unwrap();

    assert_eq!(second, first);
    assert_eq!(stored_second, stored_first);
    assert_eq!(linked_second, linked_first);
    assert_eq!(
        store.query_positions(&user(), Some(&btc())).await.unwrap().len(),
        2
    );
}

#[tokio::test]
async fn test_edit_schedules_replay() {
    let store = MemoryStore::new();
    let (ledger, mut reports) = ledger(&store, 200);

    let buy = ledger
        .add_transaction(&user(), trade(Side::Buy, "2", "100", 1_000))
        .await
        .unwrap()
        .transaction;
    ledger
        .add_transaction(&user(), trade(Side::Sell, "2", "150", 2_000))
        .await
        .unwrap();

    ledger
        .update_transaction(
            &user(),
            &buy.id,
            TransactionEdit {
                price: Some(d("120")),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let report = next_report(&mut reports).await;
    assert_eq!(report.asset, btc());
    let positions = report.result.unwrap();
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].status, PositionStatus::Closed);
    assert_eq!(positions[0].realized_pnl_abs, d("60"));
}

#[tokio::test]
async fn test_concurrent_adds_share_one_position() {
    let store = MemoryStore::new();
    let (ledger, _reports) = ledger(&store, 500);

    let adds = (0..8).map(|i| {
        let ledger = ledger.clone();
        async move {
            ledger
                .add_transaction(&user(), trade(Side::Buy, "1", "100", 1_000 + i))
                .await
                .unwrap()
        }
    });
    let outcomes = futures::future::join_all(adds).await;

    let mut indexes: Vec<u32> = outcomes
        .iter()
        .map(|o| o.transaction.entry_index.unwrap())
        .collect();
    indexes.sort_unstable();
    assert_eq!(indexes, (1..=8).collect::<Vec<u32>>());

    let positions = ledger
        .position_manager()
        .positions(&user(), &btc())
        .await
        .unwrap();
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].current_size, d("8"));
    assert_eq!(positions[0].transaction_ids.len(), 8);
}

#[tokio::test]
async fn test_subscription_snapshot_triggers_resync() {
    let store = MemoryStore::new();
    let (ledger, _reports) = ledger(&store, 200);
    store.set_online(false);
    ledger
        .add_transaction(&user(), trade(Side::Buy, "1", "100", 1_000))
        .await
        .unwrap();

    let _watcher = ledger.spawn_subscription_watcher(user());
    tokio::task::yield_now().await;
    store.set_online(true);

    let synced = tokio::time::timeout(Duration::from_secs(2), async {
        while store.transaction_count() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(synced.is_ok(), "watcher never resynced");
    assert!(!ledger.is_degraded());
}

#[tokio::test]
async fn test_pending_queue_survives_restart() {
    let temp_dir = TempDir::new().unwrap();
    let store = MemoryStore::new();
    store.set_online(false);

    {
        let (ledger, _reports) = TransactionStore::new(
            Arc::new(store.clone()),
            Arc::new(FileCache::open(temp_dir.path()).unwrap()),
            Duration::from_millis(200),
        );
        let outcome = ledger
            .add_transaction(&user(), trade(Side::Buy, "1", "100", 1_000))
            .await
            .unwrap();
        assert_eq!(outcome.durability, Durability::Deferred);
    }

    store.set_online(true);
    let (ledger, _reports) = TransactionStore::new(
        Arc::new(store.clone()),
        Arc::new(FileCache::open(temp_dir.path()).unwrap()),
        Duration::from_millis(200),
    );
    let merged = ledger.all_transactions(&user()).await.unwrap();
    assert_eq!(merged.len(), 1);
    assert!(!merged[0].id.is_pending());
    assert_eq!(store.transaction_count(), 1);
}

/// Delegates to a `MemoryStore` but cannot read positions.
#[derive(Debug, Clone)]
struct BrokenPositions(MemoryStore);

#[async_trait]
impl DurableStore for BrokenPositions {
    async fn insert_transaction(&self, tx: &Transaction) -> Result<TransactionId, StoreError> {
        self.0.insert_transaction(tx).await
    }

    async fn update_transaction(&self, tx: &Transaction) -> Result<(), StoreError> {
        self.0.update_transaction(tx).await
    }

    async fn delete_transaction(
        &self,
        user_id: &UserId,
        id: &TransactionId,
    ) -> Result<(), StoreError> {
        self.0.delete_transaction(user_id, id).await
    }

    async fn query_transactions(
        &self,
        user_id: &UserId,
        asset: &Asset,
    ) -> Result<Vec<Transaction>, StoreError> {
        self.0.query_transactions(user_id, asset).await
    }

    async fn query_user_transactions(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<Transaction>, StoreError> {
        self.0.query_user_transactions(user_id).await
    }

    async fn get_position(&self, _id: &PositionId) -> Result<Option<Position>, StoreError> {
        Err(StoreError::Corrupt("positions table".to_string()))
    }

    async fn query_positions(
        &self,
        _user_id: &UserId,
        _asset: Option<&Asset>,
    ) -> Result<Vec<Position>, StoreError> {
        Err(StoreError::Corrupt("positions table".to_string()))
    }

    async fn upsert_position(&self, position: &Position) -> Result<(), StoreError> {
        self.0.upsert_position(position).await
    }

    async fn delete_position(&self, id: &PositionId) -> Result<(), StoreError> {
        self.0.delete_position(id).await
    }

    fn subscribe(&self, user_id: &UserId) -> broadcast::Receiver<StoreEvent> {
        self.0.subscribe(user_id)
    }
}

#[tokio::test]
async fn test_linkage_failure_does_not_fail_the_write() {
    let inner = MemoryStore::new();
    let (ledger, mut reports) = TransactionStore::new(
        Arc::new(BrokenPositions(inner.clone())),
        Arc::new(MemoryCache::new()),
        Duration::from_millis(200),
    );

    let outcome = ledger
        .add_transaction(&user(), trade(Side::Buy, "1", "100", 1_000))
        .await
        .unwrap();
    assert_eq!(outcome.durability, Durability::Durable);
    assert_eq!(outcome.transaction.position_id, None);
    assert_eq!(inner.transaction_count(), 1);

    // The follow-up replay fails and says so on the report channel.
    ledger
        .update_transaction(
            &user(),
            &outcome.transaction.id,
            TransactionEdit {
                notes: Some("retry".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let report = next_report(&mut reports).await;
    assert!(matches!(
        report.result,
        Err(LedgerError::Store(StoreError::Corrupt(_)))
    ));
}
