use position_ledger::engine::{
    apply_new_transaction, replay_episodes, ApplyOutcome, PositionTracker, TrackerError,
};
use position_ledger::{
    Asset, Decimal, NewTransaction, Position, PositionId, PositionStatus, Side, TimeMs,
    Transaction, TransactionId, UserId,
};

fn d(s: &str) -> Decimal {
    Decimal::from_str_canonical(s).unwrap()
}

fn tx(id: &str, side: Side, amount: &str, price: &str, date: i64) -> Transaction {
    let mut tx = NewTransaction::new("ETH", side, d(amount), d(price), TimeMs::new(date))
        .validate(&UserId::new("user-1"), TimeMs::new(date + 1))
        .unwrap();
    tx.id = TransactionId::durable(id).unwrap();
    tx
}

fn history() -> Vec<Transaction> {
    vec![
        tx("t0", Side::Sell, "1", "90", 500),
        tx("t1", Side::Buy, "2", "100", 1_000),
        tx("t2", Side::Sell, "1", "150", 2_000),
        tx("t3", Side::Sell, "1", "120", 3_000),
        tx("t4", Side::Buy, "1", "200", 4_000),
    ]
}

fn open_for(first: &Transaction, id: &str) -> Position {
    Position::open(
        PositionId::new(id),
        first.user_id.clone(),
        first.asset.clone(),
        first.date,
    )
}

#[test]
fn test_replay_segments_episodes() {
    let (episodes, links) = replay_episodes(&history(), Vec::new()).unwrap();
    assert_eq!(episodes.len(), 2);

    let first = &episodes[0];
    assert_eq!(first.status, PositionStatus::Closed);
    assert_eq!(first.current_size, Decimal::zero());
    assert_eq!(first.total_cost, Decimal::zero());
    assert_eq!(first.avg_entry_price, Decimal::zero());
    assert_eq!(first.realized_pnl_abs, d("70"));
    assert_eq!(first.closed_at, Some(TimeMs::new(3_000)));
    assert_eq!(first.opened_at, TimeMs::new(1_000));

    let second = &episodes[1];
    assert_eq!(second.status, PositionStatus::Open);
    assert_eq!(second.current_size, d("1"));
    assert_eq!(second.avg_entry_price, d("200"));
    assert_ne!(second.id, first.id);

    assert_eq!(links.len(), 5);
    assert_eq!(links[0].position_id, None, "orphan sell stays unlinked");
    assert_eq!(links[1].entry_index, Some(1));
    assert_eq!(links[3].entry_index, Some(3));
    assert_eq!(links[4].position_id, Some(second.id.clone()));
    assert_eq!(links[4].entry_index, Some(1));
}

#[test]
fn test_replay_is_idempotent() {
    let (first, first_links) = replay_episodes(&history(), Vec::new()).unwrap();
    let ids: Vec<PositionId> = first.iter().map(|p| p.id.clone()).collect();

    let mut shuffled = history();
    shuffled.reverse();
    let (second, second_links) = replay_episodes(&shuffled, ids).unwrap();
    assert_eq!(first, second);
    assert_eq!(first_links, second_links);
}

#[test]
fn test_incremental_matches_replay() {
    let txs = history();
    let ids = vec![PositionId::new("p-1"), PositionId::new("p-2")];

    let mut incremental: Vec<Position> = Vec::new();
    let mut next_id = ids.iter();
    for t in &txs {
        let slot = match incremental.iter().position(|p| p.is_open()) {
            Some(slot) => slot,
            None if t.side == Side::Buy => {
                let id = next_id.next().unwrap();
                incremental.push(open_for(t, id.as_str()));
                incremental.len() - 1
            }
            None => continue,
        };
        apply_new_transaction(&mut incremental[slot], t).unwrap();
    }

    let (replayed, _) = replay_episodes(&txs, ids).unwrap();
    assert_eq!(incremental, replayed);
}

#[test]
fn test_relink_swaps_id_without_reapplying() {
    let buy = tx("t1", Side::Buy, "2", "100", 1_000);
    let mut pending = buy.clone();
    pending.id = TransactionId::pending();

    let mut position = open_for(&buy, "p-1");
    let applied = apply_new_transaction(&mut position, &pending).unwrap();
    assert_eq!(
        applied,
        ApplyOutcome::Applied {
            entry_index: 1,
            closed: false
        }
    );
    let snapshot = position.clone();

    let relinked = apply_new_transaction(&mut position, &buy).unwrap();
    assert_eq!(relinked, ApplyOutcome::Relinked { entry_index: 1 });
    assert_eq!(position.transaction_ids, vec![buy.id.clone()]);
    assert_eq!(position.current_size, snapshot.current_size);
    assert_eq!(position.total_cost, snapshot.total_cost);

    let again = apply_new_transaction(&mut position, &buy).unwrap();
    assert_eq!(again, ApplyOutcome::Unchanged { entry_index: 1 });
}

#[test]
fn test_oversell_closes_at_zero() {
    let buy = tx("t1", Side::Buy, "1", "100", 1_000);
    let mut position = open_for(&buy, "p-1");
    apply_new_transaction(&mut position, &buy).unwrap();

    let outcome = apply_new_transaction(&mut position, &tx("t2", Side::Sell, "3", "150", 2_000))
        .unwrap();
    assert_eq!(
        outcome,
        ApplyOutcome::Applied {
            entry_index: 2,
            closed: true
        }
    );
    assert_eq!(position.status, PositionStatus::Closed);
    assert_eq!(position.current_size, Decimal::zero());
    assert_eq!(position.total_cost, Decimal::zero());
    assert_eq!(position.realized_pnl_abs, d("150"));
}

#[test]
fn test_closed_position_rejects_new_members() {
    let buy = tx("t1", Side::Buy, "1", "100", 1_000);
    let mut position = open_for(&buy, "p-1");
    apply_new_transaction(&mut position, &buy).unwrap();
    apply_new_transaction(&mut position, &tx("t2", Side::Sell, "1", "100", 2_000)).unwrap();

    let err = apply_new_transaction(&mut position, &tx("t3", Side::Buy, "1", "100", 3_000))
        .unwrap_err();
    assert_eq!(err, TrackerError::PositionClosed(PositionId::new("p-1")));
}

#[test]
fn test_mismatched_asset_is_rejected() {
    let buy = tx("t1", Side::Buy, "1", "100", 1_000);
    let mut position = open_for(&buy, "p-1");
    position.asset = Asset::new("BTC").unwrap();
    assert!(matches!(
        apply_new_transaction(&mut position, &buy),
        Err(TrackerError::Mismatch { .. })
    ));
}

#[test]
fn test_tracker_reuses_ids_in_order() {
    let mut tracker =
        PositionTracker::with_reusable_ids(vec![PositionId::new("old-1"), PositionId::new("old-2")]);
    for t in history() {
        tracker.process_transaction(&t).unwrap();
    }
    let (episodes, _) = tracker.into_outputs();
    let ids: Vec<&str> = episodes.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, vec!["old-1", "old-2"]);
}
