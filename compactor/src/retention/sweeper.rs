// Copyright 2023 Timberline Project Authors. Licensed under Apache-2.0.

//! Sweeper: consumes marker files and deletes the chunk objects.

use std::{
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use common_util::{
    define_result,
    retry::{retry_with_backoff, BackoffConfig},
    time::ClockRef,
};
use futures::{stream, StreamExt};
use log::{debug, info, warn};
use snafu::{ResultExt, Snafu};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    metrics,
    retention::marker::{self, read_marker_keys, MarkerFile, MarkerStorage},
    storage::ChunkClient,
};

/// How often the sweeper looks for consumable marker files.
pub const MARKER_CHECK_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to access marker storage, err:{}", source))]
    AccessMarkers { source: marker::Error },
}

define_result!(Error);

/// Deletes marked chunks once their delete delay elapsed.
pub struct Sweeper {
    marker_storage: MarkerStorage,
    chunk_client: ChunkClient,
    delete_worker_count: usize,
    delete_delay: Duration,
    backoff: BackoffConfig,
    clock: ClockRef,
}

impl Sweeper {
    pub fn new(
        retention_workdir: &Path,
        chunk_client: ChunkClient,
        delete_worker_count: usize,
        delete_delay: Duration,
        backoff: BackoffConfig,
        clock: ClockRef,
    ) -> Result<Self> {
        let marker_storage = MarkerStorage::new(retention_workdir).context(AccessMarkers)?;
        Ok(Self {
            marker_storage,
            chunk_client,
            delete_worker_count: delete_worker_count.max(1),
            delete_delay,
            backoff,
            clock,
        })
    }

    /// Run until cancelled.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let sweeper = self.clone();
        tokio::spawn(async move {
            info!(
                "Sweeper started, markers:{}, delay:{:?}",
                sweeper.marker_storage.dir().display(),
                sweeper.delete_delay
            );
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(MARKER_CHECK_PERIOD) => {
                        if let Err(e) = sweeper.sweep_once().await {
                            warn!("Sweep pass failed, will retry, err:{}", e);
                        }
                    }
                }
            }
            info!("Sweeper stopped");
        })
    }

    /// One pass over every consumable marker file.
    pub async fn sweep_once(&self) -> Result<()> {
        let eligible = self
            .marker_storage
            .eligible_files(self.clock.now(), self.delete_delay)
            .context(AccessMarkers)?;

        for file in eligible {
            if let Err(e) = self.consume_marker_file(&file).await {
                warn!(
                    "Failed to consume marker file, path:{}, err:{}",
                    file.path.display(),
                    e
                );
            }
        }

        Ok(())
    }

    async fn consume_marker_file(&self, file: &MarkerFile) -> Result<()> {
        let keys = read_marker_keys(&file.path).context(AccessMarkers)?;
        let total = keys.len();
        let failed: Mutex<Vec<String>> = Mutex::new(Vec::new());

        stream::iter(keys)
            .for_each_concurrent(self.delete_worker_count, |key| {
                let failed = &failed;
                async move {
                    let res =
                        retry_with_backoff(&self.backoff, || self.chunk_client.delete_chunk(&key))
                            .await;
                    match res {
                        Ok(()) => {
                            metrics::SWEEPER_CHUNKS_DELETED_TOTAL
                                .with_label_values(&["success"])
                                .inc();
                        }
                        Err(e) => {
                            metrics::SWEEPER_CHUNKS_DELETED_TOTAL
                                .with_label_values(&["failure"])
                                .inc();
                            warn!("Failed to delete chunk, key:{}, err:{}", key, e);
                            failed.lock().unwrap().push(key);
                        }
                    }
                }
            })
            .await;

        let mut remaining = failed.into_inner().unwrap();
        remaining.sort_unstable();
        debug!(
            "Consumed marker file, path:{}, chunks:{}, failed:{}",
            file.path.display(),
            total,
            remaining.len()
        );
        self.marker_storage
            .rewrite(&file.path, &remaining)
            .context(AccessMarkers)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use common_util::time::{Clock, ManualClock, Timestamp};
    use object_store::{path::Path as ObjectPath, ObjectStore};
    use tempfile::tempdir;

    use super::*;
    use crate::{
        retention::marker::MarkerWriter,
        storage::LocalFileSystem,
    };

    async fn put_chunk(store: &dyn ObjectStore, key: &str) {
        store
            .put(&ObjectPath::from(key), Bytes::from_static(b"chunk"))
            .await
            .unwrap();
    }

    async fn chunk_exists(store: &dyn ObjectStore, key: &str) -> bool {
        store.head(&ObjectPath::from(key)).await.is_ok()
    }

    #[tokio::test]
    async fn test_sweep_honors_delete_delay() {
        let store_dir = tempdir().unwrap();
        let work_dir = tempdir().unwrap();
        let store = Arc::new(LocalFileSystem::new_with_prefix(store_dir.path()).unwrap());
        put_chunk(store.as_ref(), "tenant-a/c1").await;
        put_chunk(store.as_ref(), "tenant-a/c2").await;

        let clock = Arc::new(ManualClock::new(Timestamp::new(1_000_000)));
        let sweeper = Sweeper::new(
            work_dir.path(),
            ChunkClient::new(store.clone()),
            4,
            Duration::from_secs(2 * 60 * 60),
            BackoffConfig {
                max_retries: 0,
                ..Default::default()
            },
            clock.clone(),
        )
        .unwrap();

        // Publish a marker file stamped with the current clock.
        let scratch = work_dir.path().join("scratch");
        let mut writer = MarkerWriter::create(&scratch).unwrap();
        writer.mark("tenant-a/c1").unwrap();
        writer.mark("tenant-a/c2").unwrap();
        let (path, _) = writer.finish().unwrap();
        sweeper
            .marker_storage
            .publish(&path, clock.now())
            .unwrap();

        // Inside the delete delay: nothing happens.
        sweeper.sweep_once().await.unwrap();
        assert!(chunk_exists(store.as_ref(), "tenant-a/c1").await);
        assert_eq!(1, sweeper.marker_storage.marker_files().unwrap().len());

        // Past the delay the chunks and the marker file are gone.
        clock.advance(Duration::from_secs(3 * 60 * 60));
        sweeper.sweep_once().await.unwrap();
        assert!(!chunk_exists(store.as_ref(), "tenant-a/c1").await);
        assert!(!chunk_exists(store.as_ref(), "tenant-a/c2").await);
        assert!(sweeper.marker_storage.marker_files().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_chunk_counts_as_deleted() {
        let store_dir = tempdir().unwrap();
        let work_dir = tempdir().unwrap();
        let store = Arc::new(LocalFileSystem::new_with_prefix(store_dir.path()).unwrap());

        let clock = Arc::new(ManualClock::new(Timestamp::new(1_000_000)));
        let sweeper = Sweeper::new(
            work_dir.path(),
            ChunkClient::new(store),
            2,
            Duration::from_secs(0),
            BackoffConfig {
                max_retries: 0,
                ..Default::default()
            },
            clock,
        )
        .unwrap();

        let scratch = work_dir.path().join("scratch");
        let mut writer = MarkerWriter::create(&scratch).unwrap();
        writer.mark("tenant-a/never-existed").unwrap();
        let (path, _) = writer.finish().unwrap();
        sweeper
            .marker_storage
            .publish(&path, Timestamp::new(0))
            .unwrap();

        sweeper.sweep_once().await.unwrap();
        assert!(sweeper.marker_storage.marker_files().unwrap().is_empty());
    }
}
