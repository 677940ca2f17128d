mod config;

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use tally_store::{
    LocalMessageStore, LocalSettlementStore, MembershipSnapshotStore, StorageTier, open_first,
};
use tally_sync::{
    EventBus, GroupTimeline, GroupWatcher, PendingBuffer, RestBackend, Session, SyncContext, SyncPolicy,
};
use tally_types::events::SyncEvent;

use crate::config::ClientConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tally=debug,tally_sync=debug,tally_store=info".into()),
        )
        .init();

    let cfg = ClientConfig::from_env()?;
    if cfg.token.is_none() {
        warn!("TALLY_TOKEN is not set, group checks will be skipped");
    }

    // Storage tiers are picked once for the life of the process
    let (message_kv, message_tier) = open_first(&[
        StorageTier::Sqlite(cfg.db_path.clone()),
        StorageTier::Files(cfg.fallback_dir.clone()),
        StorageTier::Memory,
    ]);
    let (settlement_kv, settlement_tier) =
        open_first(&[StorageTier::Sqlite(cfg.db_path.clone()), StorageTier::Memory]);
    info!("Messages on {:?}, settlements on {:?}", message_tier, settlement_tier);

    let events = EventBus::default();
    let session = Session::new(cfg.token.clone());
    let policy = SyncPolicy {
        watch_interval: cfg.watch_interval,
        ..SyncPolicy::default()
    };
    let backend = RestBackend::new(&cfg.api_url, session.clone(), policy.clone(), cfg.http_timeout)?;

    let ctx = SyncContext {
        backend: Arc::new(backend),
        messages: Arc::new(LocalMessageStore::new(message_kv.clone())),
        settlements: Arc::new(LocalSettlementStore::new(settlement_kv)),
        snapshots: Arc::new(MembershipSnapshotStore::new(message_kv)),
        pending: Arc::new(PendingBuffer::new(events.clone())),
        session,
        events: events.clone(),
        policy,
    };

    tokio::spawn(log_events(events.clone()));

    let watcher = Arc::new(GroupWatcher::new(&ctx, cfg.user_id));
    watcher.start();

    let timeline = cfg.group_id.map(|group_id| {
        let timeline = Arc::new(GroupTimeline::open(&ctx, group_id));
        tokio::spawn(keep_loaded(timeline.clone(), events.clone(), cfg.watch_interval));
        timeline
    });

    info!("Tally client syncing against {}", cfg.api_url);
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    watcher.stop();
    if let Some(timeline) = timeline {
        timeline.close();
    }
    Ok(())
}

/// Reload one group on an interval, and drain hand-offs as they arrive.
/// Each load also redelivers any echoes left over.
async fn keep_loaded(timeline: Arc<GroupTimeline>, events: EventBus, every: std::time::Duration) {
    let mut rx = events.subscribe();
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                timeline.load().await;
            }
            event = rx.recv() => match event {
                Ok(SyncEvent::PendingReady { group_id }) if group_id == timeline.group_id() => {
                    timeline.drain_pending().await;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!("Timeline listener lagged by {} events", n),
                Err(RecvError::Closed) => break,
            },
        }
    }
}

async fn log_events(events: EventBus) {
    let mut rx = events.subscribe();
    loop {
        match rx.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => info!("event {}", json),
                Err(e) => warn!("Unprintable event {:?}: {}", event, e),
            },
            Err(RecvError::Lagged(n)) => warn!("Event log lagged by {} events", n),
            Err(RecvError::Closed) => break,
        }
    }
}
