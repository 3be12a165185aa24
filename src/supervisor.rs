//! Component lifecycle.
//!
//! The supervisor owns every component handle; cross-component interaction
//! happens through explicitly injected handles or through Redis. One signal
//! starts a graceful shutdown: pipelines get a drain grace period, then
//! anything still running is aborted. Two conditions are fatal: Redis
//! unreachable past its threshold, and no acquirable credential past its.

use crate::config::Config;
use crate::constants::{REDIS_FATAL_SECS, SHUTDOWN_GRACE_SECS, TOKEN_FATAL_SECS};
use crate::graph::{MetadataCache, PlannerApi, PlannerClient};
use crate::health::{HealthReporter, HealthState, Housekeeper};
use crate::redis::{LogStore, MappingStore, OpQueue, PubSubHandle, RedisClient, StateStore};
use crate::subscriptions::{FamilyTracker, SubscriptionManager};
use crate::sync::{DownloadPipeline, TaskLocks, UploadPipeline};
use crate::token::TokenService;
use crate::webhook::{ClientStateRegistry, WebhookReceiver};
use crate::{BridgeError, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub struct Supervisor {
    config: Config,
}

impl Supervisor {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run one reconciliation pass and exit. Used by `--reconcile-once` and
    /// as the startup pass before the event-driven loops begin.
    pub async fn reconcile_once(&self) -> Result<()> {
        let (upload, _) = self.build_upload_only().await?;
        upload.reconcile_once().await
    }

    async fn build_upload_only(&self) -> Result<(Arc<UploadPipeline>, RedisClient)> {
        let redis = RedisClient::new(&self.config.redis).await?;
        let tokens = TokenService::new(self.config.planner.clone(), redis.clone())?;
        let planner_client =
            PlannerClient::new(&self.config.planner.base_url, Arc::new(tokens))?;
        let planner: Arc<dyn PlannerApi> = Arc::new(planner_client);

        let upload = Arc::new(UploadPipeline::new(
            self.config.sync.clone(),
            StateStore::new(redis.clone()),
            MappingStore::new(redis.clone()),
            OpQueue::new(redis.clone()),
            LogStore::new(redis.clone()),
            planner,
            PubSubHandle::new(redis.clone()),
            TaskLocks::new(),
            HealthState::new(),
        ));
        Ok((upload, redis))
    }

    pub async fn run(&self) -> Result<()> {
        info!("Starting Spiral Bridge");

        let redis = RedisClient::new(&self.config.redis).await?;
        redis.enable_keyspace_events().await?;

        let state = StateStore::new(redis.clone());
        let mappings = MappingStore::new(redis.clone());
        let ops = OpQueue::new(redis.clone());
        let logs = LogStore::new(redis.clone());
        let pubsub = PubSubHandle::new(redis.clone());
        let locks = TaskLocks::new();
        let health_state = HealthState::new();

        let tokens = TokenService::new(self.config.planner.clone(), redis.clone())?;
        let planner_client = PlannerClient::new(
            &self.config.planner.base_url,
            Arc::new(tokens.clone()),
        )?;
        let planner: Arc<dyn PlannerApi> = Arc::new(planner_client.clone());
        let metadata = MetadataCache::new(redis.clone(), planner_client.clone());

        let registry = ClientStateRegistry::new();
        let tracker = FamilyTracker::new();
        let (receiver, webhook_queue, lifecycle_rx, webhook_counters) =
            WebhookReceiver::new(self.config.webhook.clone(), redis.clone(), registry.clone());

        let upload = Arc::new(UploadPipeline::new(
            self.config.sync.clone(),
            state.clone(),
            mappings.clone(),
            ops.clone(),
            logs.clone(),
            planner.clone(),
            pubsub.clone(),
            locks.clone(),
            health_state.clone(),
        ));

        let download = Arc::new(DownloadPipeline::new(
            self.config.sync.clone(),
            state.clone(),
            mappings.clone(),
            logs.clone(),
            planner.clone(),
            pubsub.clone(),
            locks.clone(),
            health_state.clone(),
            tracker.clone(),
            webhook_queue.clone(),
            metadata.clone(),
        ));

        let manager = SubscriptionManager::new(
            planner_client,
            redis.clone(),
            registry,
            tracker.clone(),
            self.config.webhook.clone(),
            &self.config.subscriptions,
        );

        let reporter = HealthReporter::new(
            redis.clone(),
            ops,
            tracker,
            tokens.clone(),
            webhook_queue,
            webhook_counters,
            health_state,
            self.config.sync.health_ttl_secs,
        );

        let housekeeper = Housekeeper::new(
            mappings,
            planner,
            metadata,
            logs,
            locks,
        );

        // Startup reconciliation: a restart converges before any event
        // arrives. Failure here is logged, not fatal; the drift timer will
        // get another chance shortly.
        if let Err(e) = upload.reconcile_once().await {
            warn!("Startup reconciliation failed: {e}");
        }

        pubsub.start_listener();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        {
            let receiver_shutdown = shutdown_rx.clone();
            handles.push((
                "webhook",
                tokio::spawn(async move {
                    if let Err(e) = receiver.run(receiver_shutdown).await {
                        error!("Webhook receiver failed: {e}");
                    }
                }),
            ));
        }
        {
            let tokens = tokens.clone();
            let refresher_shutdown = shutdown_rx.clone();
            handles.push((
                "token-refresher",
                tokio::spawn(async move {
                    tokens.run_refresher(refresher_shutdown).await;
                }),
            ));
        }
        {
            let upload = upload.clone();
            let upload_shutdown = shutdown_rx.clone();
            handles.push((
                "upload",
                tokio::spawn(async move {
                    upload.run(upload_shutdown).await;
                }),
            ));
        }
        {
            let download = download.clone();
            let download_shutdown = shutdown_rx.clone();
            handles.push((
                "download",
                tokio::spawn(async move {
                    download.run(download_shutdown).await;
                }),
            ));
        }
        {
            let manager_shutdown = shutdown_rx.clone();
            handles.push((
                "subscriptions",
                tokio::spawn(async move {
                    manager.run(lifecycle_rx, manager_shutdown).await;
                }),
            ));
        }
        {
            let reporter_shutdown = shutdown_rx.clone();
            handles.push((
                "health",
                tokio::spawn(async move {
                    reporter.run(reporter_shutdown).await;
                }),
            ));
        }
        {
            let housekeeper_shutdown = shutdown_rx.clone();
            handles.push((
                "housekeeper",
                tokio::spawn(async move {
                    housekeeper.run(housekeeper_shutdown).await;
                }),
            ));
        }

        info!("All components started");

        let fatal = self.watch_fatal_conditions(redis, tokens);
        tokio::pin!(fatal);

        let outcome = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                Ok(())
            }
            fatal_error = &mut fatal => {
                error!("Fatal condition: {fatal_error}");
                Err(fatal_error)
            }
        };

        // Drain: everything gets the grace period, then is aborted.
        let _ = shutdown_tx.send(true);
        let drained = {
            let drain = async {
                for (name, handle) in &mut handles {
                    if let Err(e) = handle.await {
                        warn!("Component '{name}' ended abnormally: {e}");
                    }
                }
            };
            tokio::select! {
                result = tokio::time::timeout(Duration::from_secs(SHUTDOWN_GRACE_SECS), drain) => {
                    if result.is_err() {
                        warn!("Drain grace period elapsed; aborting remaining components");
                    }
                    result.is_ok()
                }
                _ = tokio::signal::ctrl_c() => {
                    warn!("Second signal; aborting immediately");
                    false
                }
            }
        };

        if drained {
            info!("All components drained");
        } else {
            for (_, handle) in &handles {
                handle.abort();
            }
        }

        info!("Spiral Bridge stopped");
        outcome
    }

    /// Resolves only when a fatal condition holds: Redis unreachable for
    /// longer than its threshold, or no token kind acquirable for longer
    /// than its.
    async fn watch_fatal_conditions(
        &self,
        redis: RedisClient,
        tokens: TokenService,
    ) -> BridgeError {
        let mut redis_down_since: Option<Instant> = None;

        loop {
            tokio::time::sleep(Duration::from_secs(10)).await;

            let redis_ok = match redis.get_conn().await {
                Ok(mut conn) => redis::cmd("PING")
                    .query_async::<String>(&mut conn)
                    .await
                    .is_ok(),
                Err(_) => false,
            };

            if redis_ok {
                redis_down_since = None;
            } else {
                let since = *redis_down_since.get_or_insert_with(Instant::now);
                warn!(
                    "Redis unreachable for {}s",
                    since.elapsed().as_secs()
                );
                if since.elapsed() >= Duration::from_secs(REDIS_FATAL_SECS) {
                    return BridgeError::Transient {
                        message: format!("Redis unreachable for over {REDIS_FATAL_SECS}s"),
                    };
                }
            }

            if let Some(staleness) = tokens.worst_staleness_secs().await {
                if staleness >= TOKEN_FATAL_SECS as i64 {
                    return BridgeError::TokenAcquisition {
                        kind: "any".to_string(),
                        message: format!("no valid credential for over {TOKEN_FATAL_SECS}s"),
                    };
                }
            }
        }
    }
}
