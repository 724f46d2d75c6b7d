// Copyright 2023 Timberline Project Authors. Licensed under Apache-2.0.

//! The compactor service: wiring, ring registration and the leader loop.
//!
//! Wiring order matters because retention and deletion reference each other:
//! the delete requests manager is built first, then the retention checker,
//! and both are composed into one expiration checker handed to the tables
//! manager (see [CompositeExpirationChecker]).

use std::{collections::HashMap, fs, sync::Arc, time::Duration};

use common_util::{
    define_result,
    time::{ClockRef, TimeRange, Timestamp},
};
use log::{error, info, warn};
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    deletion::{manager::DeleteRequestsManager, store::DeleteRequestsStore},
    index::IndexCompactorRef,
    labels::Labels,
    limits::LimitsRef,
    metrics,
    retention::{
        marker::{copy_markers, MarkerStorage, MARKERS_DIR},
        sweeper::Sweeper,
        ChunkEntry, ExpirationChecker, ExpirationCheckerRef, ExpiredVerdict,
        NeverExpiringChecker, RetentionChecker,
    },
    ring::{
        kv::RingKvStoreRef, lifecycler::Lifecycler, InstanceState, Ring, RING_KEY,
        RING_NUM_TOKENS,
    },
    scheduler::{StoreContainer, TablesManager},
    schema::SchemaConfig,
    storage::{ChunkClient, IndexStorageClient, ObjectStoreRef},
    table::COMPACTOR_WORKDIR,
};

/// How often the ring is asked who should run the compactor.
pub const RING_POLL_PERIOD: Duration = Duration::from_secs(5);

/// Subdirectory of the working directory for retention state.
pub const RETENTION_WORKDIR: &str = "retention";

/// Subdirectory of the working directory for the delete requests DB.
pub const DELETION_WORKDIR: &str = "deletion";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Invalid config, err:{}", source))]
    InvalidConfig { source: crate::config::Error },

    #[snafu(display("Failed to prepare working directory, path:{}, err:{}", path, source))]
    PrepareWorkdir {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display(
        "Delete store client not set while retention is enabled.\nBacktrace:\n{}",
        backtrace
    ))]
    DeleteStoreClientUnset { backtrace: Backtrace },

    #[snafu(display("Failed to resolve schema for store period, err:{}", source))]
    ResolvePeriod { source: crate::schema::Error },

    #[snafu(display("Failed to create storage client, err:{}", source))]
    CreateStorageClient { source: crate::storage::Error },

    #[snafu(display("Failed to init delete requests store, err:{}", source))]
    InitDeleteStore { source: crate::deletion::store::Error },

    #[snafu(display("Failed to init retention, err:{}", source))]
    InitRetention { source: crate::retention::marker::Error },

    #[snafu(display("Failed to init sweeper, err:{}", source))]
    InitSweeper { source: crate::retention::sweeper::Error },

    #[snafu(display("Ring failure, err:{}", source))]
    RingAccess { source: crate::ring::Error },
}

define_result!(Error);

/// Retention OR deletion decide expiration; skipping needs both to agree.
pub struct CompositeExpirationChecker {
    retention: ExpirationCheckerRef,
    deletion: ExpirationCheckerRef,
}

impl CompositeExpirationChecker {
    pub fn new(retention: ExpirationCheckerRef, deletion: ExpirationCheckerRef) -> Self {
        Self { retention, deletion }
    }
}

impl ExpirationChecker for CompositeExpirationChecker {
    fn expired(
        &self,
        tenant: &str,
        chunk: &ChunkEntry,
        labels: &Labels,
        series_id: &[u8],
        table_name: &str,
        now: Timestamp,
    ) -> ExpiredVerdict {
        let (expired, retained) =
            self.retention
                .expired(tenant, chunk, labels, series_id, table_name, now);
        if expired {
            return (expired, retained);
        }

        self.deletion
            .expired(tenant, chunk, labels, series_id, table_name, now)
    }

    fn interval_may_have_expired_chunks(&self, interval: TimeRange, tenant: Option<&str>) -> bool {
        self.retention
            .interval_may_have_expired_chunks(interval, tenant)
            || self
                .deletion
                .interval_may_have_expired_chunks(interval, tenant)
    }

    fn can_skip_series(
        &self,
        tenant: &str,
        labels: &Labels,
        series_id: &[u8],
        series_start: Timestamp,
        table_name: &str,
        now: Timestamp,
    ) -> bool {
        // Conservative AND: skipping for one checker would hide the series
        // from the other.
        self.retention
            .can_skip_series(tenant, labels, series_id, series_start, table_name, now)
            && self
                .deletion
                .can_skip_series(tenant, labels, series_id, series_start, table_name, now)
    }

    fn mark_series_as_processed(
        &self,
        tenant: &str,
        series_id: &[u8],
        labels: &Labels,
        table_name: &str,
    ) -> std::result::Result<(), String> {
        self.retention
            .mark_series_as_processed(tenant, series_id, labels, table_name)?;
        self.deletion
            .mark_series_as_processed(tenant, series_id, labels, table_name)
    }

    fn mark_phase_started(&self) {
        self.retention.mark_phase_started();
        self.deletion.mark_phase_started();
    }

    fn mark_phase_finished(&self) {
        self.retention.mark_phase_finished();
        self.deletion.mark_phase_finished();
    }

    fn mark_phase_failed(&self) {
        self.retention.mark_phase_failed();
        self.deletion.mark_phase_failed();
    }

    fn mark_phase_timed_out(&self) {
        self.retention.mark_phase_timed_out();
        self.deletion.mark_phase_timed_out();
    }
}

/// The cluster-singleton compactor service.
pub struct Compactor {
    cfg: Config,
    tables_manager: Arc<TablesManager>,
    sweepers: Vec<Arc<Sweeper>>,
    delete_requests_store: Option<Arc<DeleteRequestsStore>>,
    delete_requests_manager: Option<Arc<DeleteRequestsManager>>,
    lifecycler: Arc<Lifecycler>,
    ring: Ring,
}

impl Compactor {
    /// Build the service. `object_stores` maps every schema period start to
    /// its object store; `delete_store_client` is required when retention is
    /// enabled.
    pub async fn new(
        mut cfg: Config,
        object_stores: HashMap<Timestamp, ObjectStoreRef>,
        delete_store_client: Option<ObjectStoreRef>,
        schema: SchemaConfig,
        limits: LimitsRef,
        ring_kv: RingKvStoreRef,
        index_compactors: HashMap<String, IndexCompactorRef>,
        clock: ClockRef,
    ) -> Result<Arc<Self>> {
        cfg.validate().context(InvalidConfig)?;

        fs::create_dir_all(&cfg.working_directory).context(PrepareWorkdir {
            path: cfg.working_directory.display().to_string(),
        })?;
        // Per-table scratch dirs from a crashed run are garbage, reclaim.
        let scratch = cfg.working_directory.join(COMPACTOR_WORKDIR);
        if scratch.exists() {
            let _ = fs::remove_dir_all(&scratch);
        }

        // Deletion first, the retention checker composition depends on it.
        let mut delete_requests_store = None;
        let mut delete_requests_manager = None;
        let expiration_checker: ExpirationCheckerRef = if cfg.retention_enabled {
            let delete_client = delete_store_client.context(DeleteStoreClientUnset)?;
            let delete_storage =
                IndexStorageClient::new(delete_client, &cfg.delete_request_store_key_prefix)
                    .context(CreateStorageClient)?;
            let store = DeleteRequestsStore::load(
                cfg.delete_request_store_db_type,
                cfg.backup_delete_request_store_db_type,
                &cfg.working_directory.join(DELETION_WORKDIR),
                delete_storage,
            )
            .await
            .context(InitDeleteStore)?;
            let manager = DeleteRequestsManager::new(
                store.clone(),
                cfg.delete_request_cancel_period.into(),
                cfg.delete_batch_size,
                clock.clone(),
            );

            delete_requests_store = Some(store);
            let checker = CompositeExpirationChecker::new(
                Arc::new(RetentionChecker::new(limits.clone(), clock.clone())),
                manager.clone(),
            );
            delete_requests_manager = Some(manager);
            Arc::new(checker)
        } else {
            Arc::new(NeverExpiringChecker)
        };

        // One store container (and sweeper) per schema period.
        let mut containers = Vec::new();
        let mut sweepers = Vec::new();
        let mut legacy_object_types = Vec::new();
        let mut period_starts: Vec<Timestamp> = object_stores.keys().copied().collect();
        period_starts.sort();
        for from in period_starts {
            let object_store = object_stores[&from].clone();
            let period = schema.schema_for_time(from).context(ResolvePeriod)?.clone();
            let index_storage = IndexStorageClient::new(object_store.clone(), &period.index_prefix)
                .context(CreateStorageClient)?;

            let marker_storage = if cfg.retention_enabled {
                let retention_root = cfg.working_directory.join(RETENTION_WORKDIR);
                let period_workdir =
                    retention_root.join(format!("{}_{}", period.object_type, from.as_i64()));

                // Markers written by older versions live in shared dirs; pull
                // them into the period specific one, the originals are
                // removed below.
                copy_markers(&retention_root, &period_workdir).context(InitRetention)?;
                copy_markers(&retention_root.join(&period.object_type), &period_workdir)
                    .context(InitRetention)?;
                legacy_object_types.push(period.object_type.clone());

                let sweeper = Arc::new(
                    Sweeper::new(
                        &period_workdir,
                        ChunkClient::new(object_store),
                        cfg.retention_delete_worker_count,
                        cfg.retention_delete_delay.into(),
                        cfg.retention_backoff_config,
                        clock.clone(),
                    )
                    .context(InitSweeper)?,
                );
                sweepers.push(sweeper);

                Some(MarkerStorage::new(&period_workdir).context(InitRetention)?)
            } else {
                None
            };

            containers.push(StoreContainer {
                period,
                index_storage,
                marker_storage,
            });
        }

        if cfg.retention_enabled {
            let retention_root = cfg.working_directory.join(RETENTION_WORKDIR);
            for object_type in legacy_object_types {
                let _ = fs::remove_dir_all(retention_root.join(object_type).join(MARKERS_DIR));
            }
            let _ = fs::remove_dir_all(retention_root.join(MARKERS_DIR));
        }

        let tables_manager = Arc::new(TablesManager::new(
            cfg.clone(),
            containers,
            index_compactors,
            schema,
            expiration_checker,
            clock.clone(),
        ));

        let lifecycler = Arc::new(Lifecycler::new(
            ring_kv.clone(),
            RING_KEY,
            &cfg.ring.instance_id,
            &cfg.ring.instance_addr,
            cfg.ring.heartbeat_period.into(),
            cfg.ring.heartbeat_timeout.into(),
            RING_NUM_TOKENS,
            cfg.ring.tokens_file_path.clone(),
            clock.clone(),
        ));
        let ring = Ring::new(ring_kv, cfg.ring.heartbeat_timeout.into(), clock);

        Ok(Arc::new(Self {
            cfg,
            tables_manager,
            sweepers,
            delete_requests_store,
            delete_requests_manager,
            lifecycler,
            ring,
        }))
    }

    pub fn tables_manager(&self) -> &Arc<TablesManager> {
        &self.tables_manager
    }

    pub fn sweepers(&self) -> &[Arc<Sweeper>] {
        &self.sweepers
    }

    pub fn delete_requests_store(&self) -> Option<&Arc<DeleteRequestsStore>> {
        self.delete_requests_store.as_ref()
    }

    /// Run the service until `shutdown` fires: join the ring, poll for
    /// leadership, own the worker tasks while leading.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        self.starting(&shutdown).await?;

        if self.cfg.run_once {
            info!("Running single compaction");
            if let Err(e) = self
                .tables_manager
                .run_compaction(&shutdown, false)
                .await
            {
                error!("Single compaction failed, err:{}", e);
            }
            info!("Single compaction finished, waiting for shutdown");
            shutdown.cancelled().await;
            return Ok(());
        }

        self.leader_loop(&shutdown).await;
        info!("Compactor exiting");
        Ok(())
    }

    /// Join the ring: publish JOINING, wait to observe it, flip to ACTIVE,
    /// wait again so the first leader check sees a settled view.
    async fn starting(&self, shutdown: &CancellationToken) -> Result<()> {
        self.lifecycler.register().await.context(RingAccess)?;
        self.lifecycler.spawn_heartbeat_loop(shutdown.clone());

        let wait = Duration::from_secs(60);
        info!("Waiting until compactor is JOINING in the ring");
        self.ring
            .wait_instance_state(self.lifecycler.instance_id(), InstanceState::Joining, wait)
            .await
            .context(RingAccess)?;
        self.lifecycler
            .change_state(InstanceState::Active)
            .await
            .context(RingAccess)?;
        info!("Waiting until compactor is ACTIVE in the ring");
        self.ring
            .wait_instance_state(self.lifecycler.instance_id(), InstanceState::Active, wait)
            .await
            .context(RingAccess)?;
        info!("Compactor is ACTIVE in the ring");

        Ok(())
    }

    async fn leader_loop(&self, shutdown: &CancellationToken) {
        let mut running: Option<(CancellationToken, Vec<JoinHandle<()>>)> = None;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(RING_POLL_PERIOD) => {}
            }

            let leader = match self.ring.leader_addr().await {
                Ok(Some(addr)) => addr,
                Ok(None) => {
                    warn!("Ring has no healthy owner for the compactor key, will check again");
                    continue;
                }
                Err(e) => {
                    error!("Failed to ask the ring who runs the compactor, err:{}", e);
                    continue;
                }
            };

            let is_leader = leader == self.lifecycler.instance_addr();
            match (&mut running, is_leader) {
                (None, true) => {
                    info!("This instance was elected to run the compactor, starting");
                    running = Some(self.start_leader_tasks(shutdown));
                    metrics::COMPACTOR_RUNNING.set(1);
                }
                (Some(_), false) => {
                    info!("This instance should no longer run the compactor, stopping");
                    let (token, handles) = running.take().unwrap();
                    Self::stop_leader_tasks(token, handles).await;
                    metrics::COMPACTOR_RUNNING.set(0);
                    info!("Compactor stopped");
                }
                _ => {}
            }
        }

        if let Some((token, handles)) = running.take() {
            Self::stop_leader_tasks(token, handles).await;
            metrics::COMPACTOR_RUNNING.set(0);
        }
    }

    fn start_leader_tasks(
        &self,
        shutdown: &CancellationToken,
    ) -> (CancellationToken, Vec<JoinHandle<()>>) {
        let token = shutdown.child_token();
        let mut handles = Vec::new();

        let tables_manager = self.tables_manager.clone();
        let tm_token = token.clone();
        handles.push(tokio::spawn(async move {
            tables_manager.start(tm_token).await;
        }));

        for sweeper in &self.sweepers {
            handles.push(sweeper.spawn(token.clone()));
        }
        if let Some(manager) = &self.delete_requests_manager {
            handles.push(manager.spawn_reconcile_loop(token.clone()));
        }
        if let Some(store) = &self.delete_requests_store {
            handles.push(store.spawn_shipper(token.clone()));
        }

        (token, handles)
    }

    async fn stop_leader_tasks(token: CancellationToken, handles: Vec<JoinHandle<()>>) {
        token.cancel();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Leader task ended abnormally, err:{}", e);
            }
        }
    }
}
