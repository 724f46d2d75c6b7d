// Copyright 2023 Timberline Project Authors. Licensed under Apache-2.0.

//! Tables manager: the top level compaction loop of the leader replica.

use std::{
    cmp::Reverse,
    collections::{HashMap, HashSet},
    sync::Mutex,
    time::Instant,
};

use common_util::{
    define_result,
    time::{ClockRef, Timestamp},
};
use futures::{stream, StreamExt};
use log::{debug, error, info, warn};
use snafu::{ensure, Backtrace, Snafu};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    index::IndexCompactorRef,
    metrics,
    retention::{marker::MarkerStorage, ExpirationChecker, ExpirationCheckerRef},
    schema::{extract_interval_from_table_name, SchemaConfig},
    storage::IndexStorageClient,
    table::TableCompactionRequest,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to list tables, err:{}", source))]
    ListTables { source: crate::storage::Error },

    #[snafu(display("{} tables failed to compact.\nBacktrace:\n{}", count, backtrace))]
    TablesFailed { count: usize, backtrace: Backtrace },
}

define_result!(Error);

/// Per schema period stores the manager compacts.
pub struct StoreContainer {
    pub period: crate::schema::PeriodConfig,
    pub index_storage: IndexStorageClient,
    /// Present when retention is enabled.
    pub marker_storage: Option<MarkerStorage>,
}

enum TableOutcome {
    Done,
    Skipped,
    Failed,
    TimedOut,
    Cancelled,
}

/// Runs compaction passes over all tables of all schema periods.
pub struct TablesManager {
    cfg: Config,
    containers: Vec<StoreContainer>,
    index_compactors: HashMap<String, IndexCompactorRef>,
    schema: SchemaConfig,
    checker: ExpirationCheckerRef,
    clock: ClockRef,
    last_retention_run: Mutex<Option<Timestamp>>,
}

impl TablesManager {
    pub fn new(
        cfg: Config,
        containers: Vec<StoreContainer>,
        index_compactors: HashMap<String, IndexCompactorRef>,
        schema: SchemaConfig,
        checker: ExpirationCheckerRef,
        clock: ClockRef,
    ) -> Self {
        Self {
            cfg,
            containers,
            index_compactors,
            schema,
            checker,
            clock,
            last_retention_run: Mutex::new(None),
        }
    }

    /// Leader loop: run one pass immediately, then on every tick until
    /// cancelled. Retention rides along whenever its interval elapsed.
    pub async fn start(&self, shutdown: CancellationToken) {
        loop {
            let apply_retention = self.cfg.retention_enabled && self.retention_due();
            if let Err(e) = self.run_compaction(&shutdown, apply_retention).await {
                error!("Compaction pass failed, err:{}", e);
            }
            if apply_retention {
                *self.last_retention_run.lock().unwrap() = Some(self.clock.now());
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.cfg.compaction_interval.0) => {}
            }
        }
        info!("Tables manager stopped");
    }

    fn retention_due(&self) -> bool {
        let last = *self.last_retention_run.lock().unwrap();
        match last {
            None => true,
            Some(last) => {
                self.clock.now().millis_since(last) >= self.cfg.apply_retention_interval.as_millis()
            }
        }
    }

    /// One full pass over the selected tables. Returns once every table is
    /// processed or the pass is cancelled.
    pub async fn run_compaction(
        &self,
        shutdown: &CancellationToken,
        apply_retention: bool,
    ) -> Result<()> {
        let started_at = Instant::now();
        let tables = self.select_tables().await?;
        info!(
            "Starting compaction pass, tables:{}, apply_retention:{}",
            tables.len(),
            apply_retention
        );

        if apply_retention {
            self.checker.mark_phase_started();
        }

        let outcomes: Vec<TableOutcome> = stream::iter(tables)
            .map(|(table, container_idx)| self.process_table(shutdown, table, container_idx, apply_retention))
            .buffer_unordered(self.cfg.max_compaction_parallelism.max(1))
            .collect()
            .await;

        let failed = outcomes
            .iter()
            .filter(|o| matches!(o, TableOutcome::Failed))
            .count();
        let timed_out = outcomes
            .iter()
            .filter(|o| matches!(o, TableOutcome::TimedOut))
            .count();
        let cancelled = outcomes
            .iter()
            .any(|o| matches!(o, TableOutcome::Cancelled));

        if apply_retention {
            if failed > 0 || cancelled {
                self.checker.mark_phase_failed();
            } else if timed_out > 0 {
                self.checker.mark_phase_timed_out();
            } else {
                self.checker.mark_phase_finished();
            }
        }

        metrics::COMPACT_TABLES_OPERATION_DURATION_SECONDS.set(started_at.elapsed().as_secs_f64());
        let status = if failed > 0 { "failure" } else { "success" };
        metrics::COMPACT_TABLES_OPERATION_TOTAL
            .with_label_values(&[status])
            .inc();

        ensure!(failed == 0, TablesFailed { count: failed });
        Ok(())
    }

    /// Union of the tables of every store, newest first, minus the freshest
    /// `skip_latest_n_tables`, truncated to `tables_to_compact`.
    async fn select_tables(&self) -> Result<Vec<(String, usize)>> {
        let mut tables: Vec<(String, usize)> = Vec::new();
        let mut seen = HashSet::new();
        for (idx, container) in self.containers.iter().enumerate() {
            let names = container
                .index_storage
                .list_tables()
                .await
                .map_err(|source| Error::ListTables { source })?;
            for name in names {
                if seen.insert(name.clone()) {
                    tables.push((name, idx));
                }
            }
        }

        tables.sort_by_key(|(name, _)| {
            Reverse(extract_interval_from_table_name(name).start())
        });

        let skip = self.cfg.skip_latest_n_tables.min(tables.len());
        let mut tables: Vec<_> = tables.split_off(skip);
        if self.cfg.tables_to_compact > 0 {
            tables.truncate(self.cfg.tables_to_compact);
        }
        Ok(tables)
    }

    async fn process_table(
        &self,
        shutdown: &CancellationToken,
        table: String,
        container_idx: usize,
        apply_retention: bool,
    ) -> TableOutcome {
        let container = &self.containers[container_idx];
        let period = match self.schema.schema_period_for_table(&table) {
            Some(period) => period.clone(),
            None => {
                warn!("Schema for table not found, skipping, table:{}", table);
                return TableOutcome::Skipped;
            }
        };
        let plugin = match self.index_compactors.get(&period.index_type) {
            Some(plugin) => plugin.clone(),
            None => {
                warn!(
                    "No index compactor registered, skipping, table:{}, index_type:{}",
                    table, period.index_type
                );
                return TableOutcome::Skipped;
            }
        };

        let request = TableCompactionRequest {
            cfg: &self.cfg,
            table_name: &table,
            period: &period,
            storage: &container.index_storage,
            marker_storage: container.marker_storage.as_ref(),
            plugin: &plugin,
            checker: &self.checker,
            clock: &self.clock,
        };

        let table_timeout = self.cfg.retention_table_timeout.0;
        let run = async {
            if table_timeout.is_zero() {
                Some(request.run(apply_retention).await)
            } else {
                match tokio::time::timeout(table_timeout, request.run(apply_retention)).await {
                    Ok(result) => Some(result),
                    Err(_) => None,
                }
            }
        };

        let outcome = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Table run cancelled, table:{}", table);
                TableOutcome::Cancelled
            }
            result = run => match result {
                Some(Ok(summary)) => {
                    if summary.compacted {
                        debug!(
                            "Table processed, table:{}, marked_chunks:{}",
                            table, summary.stats.chunks_marked
                        );
                        TableOutcome::Done
                    } else {
                        TableOutcome::Skipped
                    }
                }
                Some(Err(e)) => {
                    error!("Failed to compact table, table:{}, err:{}", table, e);
                    TableOutcome::Failed
                }
                None => {
                    warn!(
                        "Table run exceeded retention_table_timeout, discarded, table:{}",
                        table
                    );
                    TableOutcome::TimedOut
                }
            },
        };

        if matches!(outcome, TableOutcome::Cancelled | TableOutcome::TimedOut) {
            // The run future was dropped mid-flight; reclaim its scratch dir.
            let _ = std::fs::remove_dir_all(request.workdir());
        }

        outcome
    }
}
