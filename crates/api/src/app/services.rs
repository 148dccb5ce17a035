//! Service wiring: stores, ledger engine, queue, coordinator, bus and workers.

use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;

use wager_events::{EventBus, LifecycleEvent};
use wager_infra::account_store::{AccountStore, InMemoryAccountStore};
use wager_infra::config::ServiceConfig;
use wager_infra::coordinator::MatchCoordinator;
use wager_infra::event_bus::AnyLifecycleBus;
use wager_infra::lane_store::{InMemoryLaneStore, LaneStore};
use wager_infra::ledger_engine::LedgerEngine;
use wager_infra::match_lock::{InMemoryMatchLock, MatchLock};
use wager_infra::match_store::{InMemoryMatchStore, MatchStore};
use wager_infra::matchmaker::MatchmakingQueue;
use wager_infra::workers::{MatcherWorker, WorkerHandle, spawn_coordinator_worker};

pub type Coordinator = MatchCoordinator<AnyLifecycleBus>;

/// Lifecycle event fanned out to SSE clients.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RealtimeMessage {
    pub topic: String,
    pub event_type: String,
    pub payload: LifecycleEvent,
}

pub struct AppServices {
    config: ServiceConfig,
    coordinator: Arc<Coordinator>,
    realtime_tx: broadcast::Sender<RealtimeMessage>,
    workers: Mutex<Vec<WorkerHandle>>,
}

impl AppServices {
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn ledger(&self) -> &Arc<LedgerEngine> {
        self.coordinator.ledger()
    }

    pub fn queue(&self) -> &Arc<MatchmakingQueue> {
        self.coordinator.queue()
    }

    pub fn realtime_tx(&self) -> &broadcast::Sender<RealtimeMessage> {
        &self.realtime_tx
    }

    /// Stop background workers and wait for them to exit.
    pub fn shutdown_workers(&self) {
        let handles = match self.workers.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => return,
        };
        for handle in handles {
            handle.shutdown();
        }
    }
}

struct Stores {
    accounts: Arc<dyn AccountStore>,
    lanes: Arc<dyn LaneStore>,
    locks: Arc<dyn MatchLock>,
    matches: Arc<dyn MatchStore>,
    bus: AnyLifecycleBus,
}

pub async fn build_services(config: ServiceConfig) -> anyhow::Result<AppServices> {
    let stores = if config.use_persistent_stores {
        #[cfg(feature = "redis")]
        {
            persistent_stores(&config).await?
        }
        #[cfg(not(feature = "redis"))]
        {
            tracing::warn!(
                "USE_PERSISTENT_STORES=true but redis feature not enabled, falling back to in-memory"
            );
            in_memory_stores()
        }
    } else {
        in_memory_stores()
    };

    assemble(config, stores)
}

fn in_memory_stores() -> Stores {
    Stores {
        accounts: Arc::new(InMemoryAccountStore::new()),
        lanes: Arc::new(InMemoryLaneStore::new()),
        locks: Arc::new(InMemoryMatchLock::new()),
        matches: Arc::new(InMemoryMatchStore::new()),
        bus: AnyLifecycleBus::in_memory(),
    }
}

#[cfg(feature = "redis")]
async fn persistent_stores(config: &ServiceConfig) -> anyhow::Result<Stores> {
    use anyhow::Context;
    use sqlx::PgPool;
    use wager_infra::account_store::PostgresAccountStore;
    use wager_infra::event_bus::RedisPubSubEventBus;
    use wager_infra::lane_store::RedisLaneStore;
    use wager_infra::match_lock::RedisMatchLock;
    use wager_infra::match_store::PostgresMatchStore;

    let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set when USE_PERSISTENT_STORES=true")?;
    let pool = PgPool::connect(database_url)
        .await
        .context("failed to connect to Postgres")?;
    wager_infra::schema::apply(&pool).await?;

    let redis_url = config.redis_url.as_str();
    let bus = RedisPubSubEventBus::new(redis_url, config.topics.clone())
        .map_err(|e| anyhow::anyhow!("redis bus: {e}"))?;

    Ok(Stores {
        accounts: Arc::new(PostgresAccountStore::new(pool.clone())?),
        lanes: Arc::new(RedisLaneStore::new(redis_url)?),
        locks: Arc::new(RedisMatchLock::new(redis_url)?),
        matches: Arc::new(PostgresMatchStore::new(pool)?),
        bus: AnyLifecycleBus::Redis(Arc::new(bus)),
    })
}

fn assemble(config: ServiceConfig, stores: Stores) -> anyhow::Result<AppServices> {
    let ledger = Arc::new(LedgerEngine::new(stores.accounts, config.ledger.clone()));
    let queue = Arc::new(MatchmakingQueue::new(
        stores.lanes,
        stores.locks,
        Arc::clone(&stores.matches),
        config.queue.clone(),
    ));
    let coordinator = Arc::new(MatchCoordinator::new(
        ledger,
        queue,
        stores.matches,
        stores.bus.clone(),
        config.topics.clone(),
    ));

    // Realtime fan-out: bus subscription -> broadcast channel -> SSE clients.
    let (realtime_tx, _realtime_rx) = broadcast::channel::<RealtimeMessage>(256);
    {
        let sub = stores.bus.subscribe();
        let realtime_tx = realtime_tx.clone();
        std::thread::Builder::new()
            .name("realtime-fanout".to_string())
            .spawn(move || {
                while let Ok(envelope) = sub.recv() {
                    // Lossy: no backpressure on the bus.
                    let _ = realtime_tx.send(RealtimeMessage {
                        topic: envelope.topic().to_string(),
                        event_type: envelope.event_type().to_string(),
                        payload: envelope.into_payload(),
                    });
                }
            })?;
    }

    let workers = vec![
        spawn_coordinator_worker(Arc::clone(&coordinator))?,
        MatcherWorker::spawn("matcher", Arc::clone(&coordinator), config.matcher_interval)?,
    ];

    tracing::info!(
        transport = stores.bus.transport(),
        currency = config.ledger.currency.as_str(),
        fee_bps = config.ledger.fee_bps.get(),
        "services ready"
    );

    Ok(AppServices {
        config,
        coordinator,
        realtime_tx,
        workers: Mutex::new(workers),
    })
}

/// SSE stream of lifecycle events, optionally restricted to one match.
pub fn lifecycle_sse_stream(
    services: Arc<AppServices>,
    match_id: Option<wager_core::MatchId>,
) -> Sse<impl tokio_stream::Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = services.realtime_tx().subscribe();
    let stream = BroadcastStream::new(rx).filter_map(move |msg| match msg {
        Ok(m) if match_id.is_none_or(|id| m.payload.match_id() == id) => {
            let data = serde_json::to_string(&m).unwrap_or_else(|_| "{}".to_string());
            Some(Ok(SseEvent::default().event(m.event_type).data(data)))
        }
        _ => None,
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
