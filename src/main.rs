use anyhow::Context;
use position_ledger::{
    config::Config, db::init_db, FileCache, Repository, TransactionStore, UserId,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into()),
        )
        .init();

    let config = Config::from_env().context("loading configuration")?;

    let pool = init_db(&config.database_path)
        .await
        .with_context(|| format!("opening database at {}", config.database_path))?;
    let cache = FileCache::open(&config.cache_dir)
        .with_context(|| format!("opening cache at {}", config.cache_dir))?;

    let (store, mut reports) = TransactionStore::new(
        Arc::new(Repository::new(pool)),
        Arc::new(cache),
        config.write_timeout(),
    );

    tokio::spawn(async move {
        while let Some(report) = reports.recv().await {
            match report.result {
                Ok(positions) => tracing::debug!(
                    user = %report.user_id,
                    asset = %report.asset,
                    positions = positions.len(),
                    "Background recalculation done"
                ),
                Err(e) => tracing::warn!(
                    user = %report.user_id,
                    asset = %report.asset,
                    error = %e,
                    "Background recalculation failed"
                ),
            }
        }
    });

    let users: Vec<UserId> = config.repair_users.iter().map(UserId::new).collect();
    for user in &users {
        let positions = store
            .recalculate_all_positions(user)
            .await
            .with_context(|| format!("recalculating positions of {}", user))?;
        for position in positions {
            tracing::info!(
                user = %user,
                asset = %position.asset,
                position = %position.id,
                status = %position.status,
                size = %position.current_size,
                avg_entry = %position.avg_entry_price,
                realized = %position.realized_pnl_abs,
                "Position"
            );
        }
    }

    let Some(interval) = config.resync_interval() else {
        tracing::info!("Repair pass complete");
        return Ok(());
    };

    for user in &users {
        store.spawn_subscription_watcher(user.clone());
    }

    tracing::info!(every_ms = interval.as_millis() as u64, "Resync loop started");
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for user in &users {
                    if let Err(e) = store.resync(user).await {
                        tracing::warn!(user = %user, error = %e, "Resync failed");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                return Ok(());
            }
        }
    }
}
