// Copyright 2023 Timberline Project Authors. Licensed under Apache-2.0.

//! The per-table compaction pipeline.
//!
//! Order matters: markers are fsynced before anything is uploaded, every new
//! index object is uploaded before any original fragment is deleted, and the
//! marker file becomes visible to the sweeper only after the whole run
//! succeeded. A crash at any point leaves either the originals, or originals
//! plus the new compacted file, both of which the next cycle re-merges
//! idempotently.

use std::{
    collections::{HashMap, HashSet},
    fs,
    path::PathBuf,
};

use common_util::{define_result, time::ClockRef};
use futures::{stream, TryStreamExt};
use log::{debug, info};
use snafu::{ResultExt, Snafu};

use crate::{
    config::Config,
    index::{is_compacted_file, IndexCompactorRef},
    metrics,
    retention::{
        marker::{self, MarkerStorage, MarkerWriter},
        ExpirationChecker, ExpirationCheckerRef, MarkStats, TableMarker,
    },
    schema::{extract_interval_from_table_name, PeriodConfig},
    storage::{FileMeta, IndexStorageClient},
};

/// Subdirectory of the working directory holding per-table scratch space.
pub const COMPACTOR_WORKDIR: &str = "compactor";

const PENDING_MARKERS_FILE: &str = "pending-markers";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to prepare table workdir, path:{}, err:{}", path, source))]
    PrepareWorkdir {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("Failed to list table files, table:{}, err:{}", table, source))]
    ListFiles {
        table: String,
        source: crate::storage::Error,
    },

    #[snafu(display("Index plug-in failed to compact table, table:{}, err:{}", table, source))]
    CompactTable {
        table: String,
        source: crate::index::Error,
    },

    #[snafu(display("Failed to apply retention, table:{}, err:{}", table, source))]
    MarkTable {
        table: String,
        source: crate::retention::Error,
    },

    #[snafu(display("Failed to finish marker file, table:{}, err:{}", table, source))]
    FinishMarkers {
        table: String,
        source: marker::Error,
    },

    #[snafu(display("Failed to publish marker file, table:{}, err:{}", table, source))]
    PublishMarkers {
        table: String,
        source: marker::Error,
    },

    #[snafu(display("Failed to serialize compacted index, table:{}, err:{}", table, source))]
    SerializeIndex {
        table: String,
        source: crate::index::Error,
    },

    #[snafu(display("Failed to read local index file, path:{}, err:{}", path, source))]
    ReadLocalIndex {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("Failed to upload compacted index, table:{}, err:{}", table, source))]
    Upload {
        table: String,
        source: crate::storage::Error,
    },

    #[snafu(display("Failed to delete original index file, table:{}, err:{}", table, source))]
    DeleteOriginal {
        table: String,
        source: crate::storage::Error,
    },
}

define_result!(Error);

/// Everything one table run needs, borrowed from the tables manager.
pub(crate) struct TableCompactionRequest<'a> {
    pub cfg: &'a Config,
    pub table_name: &'a str,
    pub period: &'a PeriodConfig,
    pub storage: &'a IndexStorageClient,
    pub marker_storage: Option<&'a MarkerStorage>,
    pub plugin: &'a IndexCompactorRef,
    pub checker: &'a ExpirationCheckerRef,
    pub clock: &'a ClockRef,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct TableSummary {
    /// Whether the table was actually rewritten.
    pub compacted: bool,
    pub stats: MarkStats,
}

impl TableCompactionRequest<'_> {
    pub(crate) fn workdir(&self) -> PathBuf {
        self.cfg
            .working_directory
            .join(COMPACTOR_WORKDIR)
            .join(self.table_name)
    }

    /// Run the full pipeline. The scratch dir is removed whatever happens.
    pub(crate) async fn run(&self, apply_retention: bool) -> Result<TableSummary> {
        let workdir = self.workdir();
        fs::create_dir_all(&workdir).context(PrepareWorkdir {
            path: workdir.display().to_string(),
        })?;

        let result = self.run_inner(&workdir, apply_retention).await;
        let _ = fs::remove_dir_all(&workdir);
        result
    }

    async fn run_inner(&self, workdir: &std::path::Path, apply_retention: bool) -> Result<TableSummary> {
        let table = self.table_name;
        let files = self.storage.list_table_files(table).await.context(ListFiles { table })?;
        if files.is_empty() {
            return Ok(TableSummary::default());
        }

        let interval = extract_interval_from_table_name(table);
        let apply_retention = apply_retention
            && self.marker_storage.is_some()
            && self.checker.interval_may_have_expired_chunks(interval, None);

        if !needs_compaction(&files) && !apply_retention {
            debug!("Table already compacted, nothing to do, table:{}", table);
            return Ok(TableSummary::default());
        }

        // 1. Merge all fragments through the format plug-in.
        let mut compactor =
            self.plugin
                .new_table_compactor(table, self.storage.clone(), workdir.to_path_buf(), self.period);
        let mut indexes = compactor.compact().await.context(CompactTable { table })?;

        // 2. Apply retention; markers are fsynced before anything else is
        // touched, and only published once the run is through.
        let mut stats = MarkStats::default();
        let mut pending_marker: Option<(PathBuf, usize)> = None;
        if apply_retention {
            let table_marker = TableMarker::new(self.checker.clone(), self.clock.clone());
            let mut writer = MarkerWriter::create(&workdir.join(PENDING_MARKERS_FILE))
                .context(FinishMarkers { table })?;
            for index in indexes.values_mut() {
                let s = table_marker
                    .mark_index(index.as_mut(), table, &mut writer)
                    .context(MarkTable { table })?;
                stats.series_visited += s.series_visited;
                stats.chunks_marked += s.chunks_marked;
                stats.chunks_partially_retained += s.chunks_partially_retained;
            }

            let (path, count) = writer.finish().context(FinishMarkers { table })?;
            if count > 0 {
                pending_marker = Some((path, count));
            }
        }

        // 3. Serialize the per-tenant indexes. Tenants emptied by retention
        // upload nothing; deleting their fragments removes the data.
        let mut uploads = Vec::with_capacity(indexes.len());
        for (tenant, index) in &indexes {
            if index.is_empty() {
                continue;
            }
            let local = index
                .to_index_file(workdir)
                .context(SerializeIndex { table })?;
            let file_name = local
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            uploads.push((format!("{tenant}/{file_name}"), local));
        }
        let uploaded: HashSet<String> = uploads.iter().map(|(name, _)| name.clone()).collect();

        // 4. Upload everything new...
        stream::iter(uploads.into_iter().map(Ok::<_, Error>))
            .try_for_each_concurrent(self.cfg.upload_parallelism.max(1), |(name, local)| async move {
                let data = tokio::fs::read(&local).await.context(ReadLocalIndex {
                    path: local.display().to_string(),
                })?;
                self.storage
                    .put_file(table, &name, data.into())
                    .await
                    .context(Upload { table })
            })
            .await?;

        // 5. ...and only then drop the originals. The freshly uploaded names
        // are excluded so an idempotent re-run never deletes its own output.
        let originals: Vec<String> = files
            .iter()
            .map(|f| f.name.clone())
            .filter(|name| !uploaded.contains(name))
            .collect();
        stream::iter(originals.into_iter().map(Ok::<_, Error>))
            .try_for_each_concurrent(self.cfg.upload_parallelism.max(1), |name| async move {
                self.storage
                    .delete_file(table, &name)
                    .await
                    .context(DeleteOriginal { table })
            })
            .await?;

        // 6. The run can no longer fail: hand the markers to the sweeper.
        if let Some((path, count)) = pending_marker {
            let marker_storage = self.marker_storage.unwrap();
            marker_storage
                .publish(&path, self.clock.now())
                .context(PublishMarkers { table })?;
            metrics::RETENTION_MARKED_CHUNKS_TOTAL.inc_by(count as u64);
        }

        metrics::TABLES_COMPACTED_TOTAL.inc();
        info!(
            "Compacted table, table:{}, files:{}, marked_chunks:{}",
            table,
            files.len(),
            stats.chunks_marked
        );
        Ok(TableSummary {
            compacted: true,
            stats,
        })
    }
}

/// A table needs merging unless it holds nothing but one compacted index per
/// tenant.
fn needs_compaction(files: &[FileMeta]) -> bool {
    let mut compacted_per_dir: HashMap<&str, usize> = HashMap::new();
    for file in files {
        if !is_compacted_file(&file.name) {
            return true;
        }
        let dir = file.name.split('/').next().unwrap_or_default();
        *compacted_per_dir.entry(dir).or_default() += 1;
    }
    compacted_per_dir.values().any(|count| *count > 1)
}
