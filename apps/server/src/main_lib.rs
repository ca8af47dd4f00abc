//! Application state and engine wiring shared by the HTTP handlers and the
//! background loops.

use std::collections::HashSet;
use std::sync::Arc;

use axum::Router;
use tokio::sync::Mutex;
use tracing::{info, warn};

use salla_mirror_client::SallaListingSource;
use salla_mirror_core::entities::EntityKind;
use salla_mirror_core::errors::Result;
use salla_mirror_core::settings::SyncSettings;
use salla_mirror_core::sync::{
    CancelFlag, DispatcherContext, PullMode, PullOptions, PullScheduler, PullSummary,
    RateLimiter, Reconciler, RetryManager, RetryPolicy, StoreListingSourceTrait, SyncDispatcher,
    SyncLogRepositoryTrait, WebhookIngest,
};
use salla_mirror_storage_sqlite::{
    create_pool, init, run_migrations, spawn_writer, MirrorRepository, RetryQueueRepository,
    SyncLogRepository,
};

use crate::config::ServerConfig;

pub struct AppState {
    pub settings: Arc<SyncSettings>,
    pub ingest: WebhookIngest,
    pub dispatcher: SyncDispatcher,
    pub retries: Arc<RetryManager>,
    pub scheduler: Arc<PullScheduler>,
    pub sync_log: Arc<SyncLogRepository>,
    pub mirror: Arc<MirrorRepository>,
    pub retry_queue: Arc<RetryQueueRepository>,
    /// (store, kind) pairs with a pull running; at most one per pair.
    pulls_in_flight: Mutex<HashSet<(String, EntityKind)>>,
    pub shutdown: CancelFlag,
}

impl AppState {
    pub fn is_known_store(&self, store_id: &str) -> bool {
        self.settings.store(store_id).is_some()
    }

    /// Reserves the (store, kind) slot. False when a pull already holds it.
    pub async fn claim_pull(&self, store_id: &str, kind: EntityKind) -> bool {
        self.pulls_in_flight
            .lock()
            .await
            .insert((store_id.to_string(), kind))
    }

    async fn release_pull(&self, store_id: &str, kind: EntityKind) {
        self.pulls_in_flight
            .lock()
            .await
            .remove(&(store_id.to_string(), kind));
    }

    /// Runs a pull whose slot was claimed with [`AppState::claim_pull`] and
    /// releases the slot afterwards.
    pub async fn run_claimed_pull(
        &self,
        store_id: &str,
        kind: EntityKind,
        mode: PullMode,
    ) -> Result<PullSummary> {
        let result = self
            .scheduler
            .run_pull(store_id, kind, mode, &self.shutdown)
            .await;
        self.release_pull(store_id, kind).await;
        if let Err(err) = &result {
            warn!("Pull of {}/{} failed: {}", store_id, kind, err);
        }
        result
    }

    /// Incremental when a completed pull left a watermark, full otherwise.
    pub fn default_pull_mode(&self, store_id: &str, kind: EntityKind) -> Result<PullMode> {
        Ok(match self.sync_log.get_watermark(store_id, kind)? {
            Some(_) => PullMode::Incremental,
            None => PullMode::Full,
        })
    }
}

pub fn build_state(config: &ServerConfig) -> anyhow::Result<Arc<AppState>> {
    let source = Arc::new(SallaListingSource::from_settings(&config.settings)?);
    build_state_with_source(config, source)
}

pub fn build_state_with_source(
    config: &ServerConfig,
    source: Arc<dyn StoreListingSourceTrait>,
) -> anyhow::Result<Arc<AppState>> {
    let settings = Arc::new(config.settings.clone());

    let db_path = init(&config.data_dir)?;
    run_migrations(&db_path)?;
    let pool = create_pool(&db_path)?;
    let writer = spawn_writer(pool.as_ref().clone());
    info!("Database ready at {}", db_path);

    let mirror = Arc::new(MirrorRepository::new(pool.clone(), writer.clone()));
    let sync_log = Arc::new(SyncLogRepository::new(pool.clone(), writer.clone()));
    let retry_queue = Arc::new(RetryQueueRepository::new(pool, writer));

    let reconciler = Arc::new(Reconciler::new(mirror.clone(), settings.storage_timeout()));
    let retries = Arc::new(RetryManager::new(
        retry_queue.clone(),
        RetryPolicy::from_settings(&settings),
    ));
    let dispatcher = SyncDispatcher::spawn(
        DispatcherContext {
            reconciler,
            retries: retries.clone(),
            sync_log: sync_log.clone(),
            window_secs: settings.webhook_window_secs,
        },
        settings.reconciler_shards,
        settings.shard_queue_depth,
    );
    let scheduler = Arc::new(PullScheduler::new(
        source,
        dispatcher.clone(),
        sync_log.clone(),
        sync_log.clone(),
        Arc::new(RateLimiter::new(
            settings.requests_per_minute,
            settings.rate_limit_pause_ceiling(),
        )),
        PullOptions::from_settings(&settings),
    ));

    Ok(Arc::new(AppState {
        ingest: WebhookIngest::from_settings(&settings),
        settings,
        dispatcher,
        retries,
        scheduler,
        sync_log,
        mirror,
        retry_queue,
        pulls_in_flight: Mutex::new(HashSet::new()),
        shutdown: CancelFlag::new(),
    }))
}

pub fn app_router(state: Arc<AppState>) -> Router {
    crate::api::router().with_state(state)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use async_trait::async_trait;
    use salla_mirror_core::settings::StoreCredentials;
    use salla_mirror_core::sync::{ListingPage, ListingRequest};
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    pub const STORE_ID: &str = "s1";
    pub const WEBHOOK_SECRET: &str = "whsec-test";

    /// Serves every kind as a single page of fixed records.
    #[derive(Default)]
    pub struct StaticListing {
        records: StdMutex<HashMap<EntityKind, Vec<Value>>>,
        stalled_stores: StdMutex<HashSet<String>>,
    }

    impl StaticListing {
        pub fn set_records(&self, kind: EntityKind, records: Vec<Value>) {
            self.records.lock().unwrap().insert(kind, records);
        }

        /// Page fetches for `store_id` never answer.
        pub fn stall_store(&self, store_id: &str) {
            self.stalled_stores.lock().unwrap().insert(store_id.to_string());
        }
    }

    #[async_trait]
    impl StoreListingSourceTrait for StaticListing {
        async fn fetch_page(&self, request: ListingRequest) -> Result<ListingPage> {
            let stalled = self.stalled_stores.lock().unwrap().contains(&request.store_id);
            if stalled {
                std::future::pending::<()>().await;
            }
            let records = self
                .records
                .lock()
                .unwrap()
                .get(&request.kind)
                .cloned()
                .unwrap_or_default();
            Ok(ListingPage {
                total: records.len() as u64,
                records,
                current_page: request.page,
                total_pages: 1,
                per_page: request.per_page,
            })
        }
    }

    pub fn test_config() -> ServerConfig {
        test_config_for(&[STORE_ID])
    }

    pub fn test_config_for(store_ids: &[&str]) -> ServerConfig {
        ServerConfig {
            settings: SyncSettings {
                stores: store_ids
                    .iter()
                    .map(|store_id| StoreCredentials {
                        store_id: store_id.to_string(),
                        access_token: "tok".to_string(),
                        webhook_secret: WEBHOOK_SECRET.to_string(),
                    })
                    .collect(),
                ..SyncSettings::default()
            },
            data_dir: tempfile::tempdir()
                .expect("tempdir")
                .keep()
                .to_string_lossy()
                .to_string(),
            listen_addr: "127.0.0.1:0".to_string(),
        }
    }

    pub fn test_state() -> (Arc<AppState>, Arc<StaticListing>) {
        test_state_for(&[STORE_ID])
    }

    pub fn test_state_for(store_ids: &[&str]) -> (Arc<AppState>, Arc<StaticListing>) {
        let listing = Arc::new(StaticListing::default());
        let state =
            build_state_with_source(&test_config_for(store_ids), listing.clone()).expect("state");
        (state, listing)
    }
}
