// Copyright 2023 Timberline Project Authors. Licensed under Apache-2.0.

//! Durable storage for delete requests.
//!
//! Requests live in an embedded single file DB in the deletion workdir. The
//! store is single-writer; after every mutation the DB file is handed to the
//! shipper task, which uploads it to object storage so a replacement
//! compactor can pick the state up. A backup DB type can be written
//! alongside the primary during migrations; only the primary is ever read.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use common_util::{
    define_result,
    time::{TimeRange, Timestamp},
};
use log::{info, warn};
use redb::ReadableTable;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    deletion::{aggregate_status, shard_delete_request, DeleteRequest, DeleteRequestStatus},
    labels::Matcher,
    storage::IndexStorageClient,
};

/// Object storage directory (below the delete store prefix) the DB ships to.
pub const DELETE_REQUESTS_OBJECT_DIR: &str = "delete_requests";

const REQUESTS_TABLE: redb::TableDefinition<&str, &[u8]> =
    redb::TableDefinition::new("delete_requests");

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Unsupported delete requests db type, value:{}.\nBacktrace:\n{}", value, backtrace))]
    UnsupportedDbType { value: String, backtrace: Backtrace },

    #[snafu(display("Failed to open delete requests db, path:{}, msg:{}", path, msg))]
    OpenDb { path: String, msg: String },

    #[snafu(display("Failed to read delete requests db, msg:{}", msg))]
    ReadDb { msg: String },

    #[snafu(display("Failed to write delete requests db, msg:{}", msg))]
    WriteDb { msg: String },

    #[snafu(display("Failed to encode delete request, err:{}", source))]
    EncodeRequest { source: serde_json::Error },

    #[snafu(display("Failed to decode delete request, key:{}, err:{}", key, source))]
    DecodeRequest {
        key: String,
        source: serde_json::Error,
    },

    #[snafu(display("Failed to prepare deletion workdir, path:{}, err:{}", path, source))]
    PrepareWorkdir {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("Failed to ship delete requests db, err:{}", source))]
    ShipDb { source: crate::storage::Error },

    #[snafu(display("Failed to fetch shipped delete requests db, err:{}", source))]
    FetchDb { source: crate::storage::Error },

    #[snafu(display(
        "Delete request not found, tenant:{}, request_id:{}.\nBacktrace:\n{}",
        tenant,
        request_id,
        backtrace
    ))]
    RequestNotFound {
        tenant: String,
        request_id: String,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "Illegal delete request transition, key:{}, from:{:?}, to:{:?}.\nBacktrace:\n{}",
        key,
        from,
        to,
        backtrace
    ))]
    IllegalTransition {
        key: String,
        from: DeleteRequestStatus,
        to: DeleteRequestStatus,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "Delete request can no longer be cancelled, request_id:{}.\nBacktrace:\n{}",
        request_id,
        backtrace
    ))]
    TooLateToCancel {
        request_id: String,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "Delete request is still active, request_id:{}.\nBacktrace:\n{}",
        request_id,
        backtrace
    ))]
    RequestStillActive {
        request_id: String,
        backtrace: Backtrace,
    },
}

define_result!(Error);

/// Supported embedded DB flavors for the requests store.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeleteRequestsDbType {
    Redb,
    Json,
}

impl DeleteRequestsDbType {
    pub const SUPPORTED: [DeleteRequestsDbType; 2] = [Self::Redb, Self::Json];

    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Redb => "delete_requests.redb",
            Self::Json => "delete_requests.json",
        }
    }

    fn open(&self, workdir: &Path) -> Result<Box<dyn RequestsDb>> {
        let path = workdir.join(self.file_name());
        Ok(match self {
            Self::Redb => Box::new(RedbRequestsDb::open(&path)?),
            Self::Json => Box::new(JsonRequestsDb::open(&path)?),
        })
    }
}

impl FromStr for DeleteRequestsDbType {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "redb" => Ok(Self::Redb),
            "json" => Ok(Self::Json),
            _ => UnsupportedDbType { value }.fail(),
        }
    }
}

impl std::fmt::Display for DeleteRequestsDbType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Redb => write!(f, "redb"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Minimal KV surface the request records are stored through.
trait RequestsDb: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
    fn list(&self) -> Result<Vec<(String, Vec<u8>)>>;
    fn file_path(&self) -> &Path;
}

struct RedbRequestsDb {
    db: redb::Database,
    path: PathBuf,
}

impl RedbRequestsDb {
    fn open(path: &Path) -> Result<Self> {
        let db = redb::Database::create(path).map_err(|e| Error::OpenDb {
            path: path.display().to_string(),
            msg: e.to_string(),
        })?;

        // Make sure the table exists so list() on a fresh db succeeds.
        let txn = db
            .begin_write()
            .map_err(|e| Error::WriteDb { msg: e.to_string() })?;
        txn.open_table(REQUESTS_TABLE)
            .map_err(|e| Error::WriteDb { msg: e.to_string() })?;
        txn.commit()
            .map_err(|e| Error::WriteDb { msg: e.to_string() })?;

        Ok(Self {
            db,
            path: path.to_path_buf(),
        })
    }
}

impl RequestsDb for RedbRequestsDb {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| Error::ReadDb { msg: e.to_string() })?;
        let table = txn
            .open_table(REQUESTS_TABLE)
            .map_err(|e| Error::ReadDb { msg: e.to_string() })?;
        let value = table
            .get(key)
            .map_err(|e| Error::ReadDb { msg: e.to_string() })?;
        Ok(value.map(|v| v.value().to_vec()))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let txn = self
            .db
            .begin_write()
            .map_err(|e| Error::WriteDb { msg: e.to_string() })?;
        {
            let mut table = txn
                .open_table(REQUESTS_TABLE)
                .map_err(|e| Error::WriteDb { msg: e.to_string() })?;
            table
                .insert(key, value)
                .map_err(|e| Error::WriteDb { msg: e.to_string() })?;
        }
        txn.commit()
            .map_err(|e| Error::WriteDb { msg: e.to_string() })
    }

    fn delete(&self, key: &str) -> Result<()> {
        let txn = self
            .db
            .begin_write()
            .map_err(|e| Error::WriteDb { msg: e.to_string() })?;
        {
            let mut table = txn
                .open_table(REQUESTS_TABLE)
                .map_err(|e| Error::WriteDb { msg: e.to_string() })?;
            table
                .remove(key)
                .map_err(|e| Error::WriteDb { msg: e.to_string() })?;
        }
        txn.commit()
            .map_err(|e| Error::WriteDb { msg: e.to_string() })
    }

    fn list(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| Error::ReadDb { msg: e.to_string() })?;
        let table = txn
            .open_table(REQUESTS_TABLE)
            .map_err(|e| Error::ReadDb { msg: e.to_string() })?;

        let mut entries = Vec::new();
        let iter = table
            .iter()
            .map_err(|e| Error::ReadDb { msg: e.to_string() })?;
        for item in iter {
            let (key, value) = item.map_err(|e| Error::ReadDb { msg: e.to_string() })?;
            entries.push((key.value().to_string(), value.value().to_vec()));
        }
        Ok(entries)
    }

    fn file_path(&self) -> &Path {
        &self.path
    }
}

/// Plain JSON snapshot DB, the migration/backup format.
struct JsonRequestsDb {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, serde_json::Value>>,
}

impl JsonRequestsDb {
    fn open(path: &Path) -> Result<Self> {
        let entries = if path.is_file() {
            let data = fs::read(path).map_err(|e| Error::OpenDb {
                path: path.display().to_string(),
                msg: e.to_string(),
            })?;
            serde_json::from_slice(&data).map_err(|e| Error::OpenDb {
                path: path.display().to_string(),
                msg: e.to_string(),
            })?
        } else {
            BTreeMap::new()
        };

        let db = Self {
            path: path.to_path_buf(),
            entries: Mutex::new(entries),
        };
        // Materialize the file so shipping a fresh db works.
        db.persist(&db.entries.lock().unwrap())?;
        Ok(db)
    }

    fn persist(&self, entries: &BTreeMap<String, serde_json::Value>) -> Result<()> {
        let data = serde_json::to_vec(entries).context(EncodeRequest)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, data).map_err(|e| Error::WriteDb { msg: e.to_string() })?;
        fs::rename(&tmp, &self.path).map_err(|e| Error::WriteDb { msg: e.to_string() })
    }
}

impl RequestsDb for JsonRequestsDb {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.lock().unwrap();
        entries
            .get(key)
            .map(|v| serde_json::to_vec(v).context(EncodeRequest))
            .transpose()
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let parsed: serde_json::Value =
            serde_json::from_slice(value).context(DecodeRequest { key })?;
        let mut entries = self.entries.lock().unwrap();
        entries.insert(key.to_string(), parsed);
        self.persist(&entries)
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        entries.remove(key);
        self.persist(&entries)
    }

    fn list(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .map(|(k, v)| {
                Ok((
                    k.clone(),
                    serde_json::to_vec(v).context(EncodeRequest)?,
                ))
            })
            .collect()
    }

    fn file_path(&self) -> &Path {
        &self.path
    }
}

/// The authoritative delete requests table.
pub struct DeleteRequestsStore {
    primary: Box<dyn RequestsDb>,
    backup: Option<Box<dyn RequestsDb>>,
    storage: IndexStorageClient,
    primary_object: String,
    backup_object: Option<String>,
    /// Serializes read-modify-write mutations; the store is single-writer.
    write_lock: Mutex<()>,
    ship_tx: mpsc::UnboundedSender<()>,
    ship_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
}

impl DeleteRequestsStore {
    /// Open the store in `workdir`, seeding the local DB from the shipped
    /// copy in object storage when there is no local file yet.
    pub async fn load(
        db_type: DeleteRequestsDbType,
        backup_db_type: Option<DeleteRequestsDbType>,
        workdir: &Path,
        storage: IndexStorageClient,
    ) -> Result<Arc<Self>> {
        fs::create_dir_all(workdir).context(PrepareWorkdir {
            path: workdir.display().to_string(),
        })?;

        let primary_object = format!("{}/{}", DELETE_REQUESTS_OBJECT_DIR, db_type.file_name());
        let local_path = workdir.join(db_type.file_name());
        if !local_path.exists() {
            if let Some(data) = storage.get_object(&primary_object).await.context(FetchDb)? {
                info!(
                    "Seeding delete requests db from object storage, object:{}",
                    primary_object
                );
                fs::write(&local_path, data).context(PrepareWorkdir {
                    path: local_path.display().to_string(),
                })?;
            }
        }

        let primary = db_type.open(workdir)?;
        let (backup, backup_object) = match backup_db_type {
            Some(backup_type) if backup_type != db_type => (
                Some(backup_type.open(workdir)?),
                Some(format!(
                    "{}/{}",
                    DELETE_REQUESTS_OBJECT_DIR,
                    backup_type.file_name()
                )),
            ),
            _ => (None, None),
        };

        let (ship_tx, ship_rx) = mpsc::unbounded_channel();
        Ok(Arc::new(Self {
            primary,
            backup,
            storage,
            primary_object,
            backup_object,
            write_lock: Mutex::new(()),
            ship_tx,
            ship_rx: Mutex::new(Some(ship_rx)),
        }))
    }

    /// Background task uploading the DB after mutations. The receiver is
    /// handed back on shutdown so a regained leadership can restart it.
    pub fn spawn_shipper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let store = self.clone();
        let Some(mut rx) = store.ship_rx.lock().unwrap().take() else {
            warn!("Delete requests db shipper is already running");
            return tokio::spawn(async {});
        };

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    signal = rx.recv() => {
                        if signal.is_none() {
                            break;
                        }
                        // Collapse bursts of mutations into one upload.
                        while rx.try_recv().is_ok() {}
                        if let Err(e) = store.ship().await {
                            warn!("Failed to ship delete requests db, err:{}", e);
                        }
                    }
                }
            }
            *store.ship_rx.lock().unwrap() = Some(rx);
        })
    }

    /// Upload the current DB file(s) to object storage.
    pub async fn ship(&self) -> Result<()> {
        let (primary_data, backup_data) = {
            let _guard = self.write_lock.lock().unwrap();
            let primary = fs::read(self.primary.file_path())
                .map_err(|e| Error::ReadDb { msg: e.to_string() })?;
            let backup = match &self.backup {
                Some(db) => Some(
                    fs::read(db.file_path())
                        .map_err(|e| Error::ReadDb { msg: e.to_string() })?,
                ),
                None => None,
            };
            (primary, backup)
        };

        self.storage
            .put_object(&self.primary_object, Bytes::from(primary_data))
            .await
            .context(ShipDb)?;
        if let (Some(data), Some(object)) = (backup_data, &self.backup_object) {
            self.storage
                .put_object(object, Bytes::from(data))
                .await
                .context(ShipDb)?;
        }
        Ok(())
    }

    fn notify_ship(&self) {
        // The shipper may already be gone during shutdown; fine.
        let _ = self.ship_tx.send(());
    }

    fn write_request(&self, request: &DeleteRequest) -> Result<()> {
        let data = serde_json::to_vec(request).context(EncodeRequest)?;
        let key = request.store_key();
        self.primary.put(&key, &data)?;
        if let Some(backup) = &self.backup {
            backup.put(&key, &data)?;
        }
        Ok(())
    }

    /// Accept a new delete request, sharding it by `max_interval`. Returns
    /// the stored shards.
    pub fn add_delete_request(
        &self,
        tenant: &str,
        matchers: Vec<Matcher>,
        line_filters: Vec<String>,
        range: TimeRange,
        max_interval: Duration,
        now: Timestamp,
    ) -> Result<Vec<DeleteRequest>> {
        let shards = shard_delete_request(tenant, matchers, line_filters, range, max_interval, now);
        {
            let _guard = self.write_lock.lock().unwrap();
            for shard in &shards {
                self.write_request(shard)?;
            }
        }

        info!(
            "Accepted delete request, tenant:{}, request_id:{}, shards:{}",
            tenant,
            shards[0].request_id,
            shards.len()
        );
        crate::metrics::DELETE_REQUESTS_RECEIVED_TOTAL.inc();
        self.notify_ship();
        Ok(shards)
    }

    /// Every stored shard, unordered.
    pub fn get_all_requests(&self) -> Result<Vec<DeleteRequest>> {
        self.primary
            .list()?
            .into_iter()
            .map(|(key, value)| {
                serde_json::from_slice(&value).context(DecodeRequest { key })
            })
            .collect()
    }

    /// All shards of one request, ordered by sequence number.
    pub fn get_request_group(&self, tenant: &str, request_id: &str) -> Result<Vec<DeleteRequest>> {
        let mut shards: Vec<DeleteRequest> = self
            .get_all_requests()?
            .into_iter()
            .filter(|r| r.tenant == tenant && r.request_id == request_id)
            .collect();
        shards.sort_by_key(|r| r.seq_num);
        Ok(shards)
    }

    /// User visible status of a request.
    pub fn get_request_status(
        &self,
        tenant: &str,
        request_id: &str,
    ) -> Result<DeleteRequestStatus> {
        let shards = self.get_request_group(tenant, request_id)?;
        aggregate_status(&shards).context(RequestNotFound { tenant, request_id })
    }

    /// Move one shard to `to`, enforcing the forward-only state machine.
    pub fn update_status(
        &self,
        request: &DeleteRequest,
        to: DeleteRequestStatus,
    ) -> Result<DeleteRequest> {
        let _guard = self.write_lock.lock().unwrap();

        let key = request.store_key();
        let current = match self.primary.get(&key)? {
            Some(data) => serde_json::from_slice::<DeleteRequest>(&data)
                .context(DecodeRequest { key: &key })?,
            None => {
                return RequestNotFound {
                    tenant: &request.tenant,
                    request_id: &request.request_id,
                }
                .fail()
            }
        };

        snafu::ensure!(
            current.status.can_transition(to),
            IllegalTransition {
                key: &key,
                from: current.status,
                to,
            }
        );

        let updated = DeleteRequest {
            status: to,
            ..current
        };
        self.write_request(&updated)?;
        drop(_guard);

        self.notify_ship();
        Ok(updated)
    }

    /// Cancel every shard of a request. Only allowed while no shard started
    /// processing.
    pub fn cancel_request(&self, tenant: &str, request_id: &str) -> Result<()> {
        let shards = {
            let _guard = self.write_lock.lock().unwrap();

            let shards = self.get_request_group(tenant, request_id)?;
            snafu::ensure!(!shards.is_empty(), RequestNotFound { tenant, request_id });
            let cancellable = shards.iter().all(|s| {
                matches!(
                    s.status,
                    DeleteRequestStatus::Received | DeleteRequestStatus::BuildingPlan
                )
            });
            snafu::ensure!(cancellable, TooLateToCancel { request_id });

            for shard in &shards {
                let cancelled = DeleteRequest {
                    status: DeleteRequestStatus::Cancelled,
                    ..shard.clone()
                };
                self.write_request(&cancelled)?;
            }
            shards
        };

        info!(
            "Cancelled delete request, tenant:{}, request_id:{}, shards:{}",
            tenant,
            request_id,
            shards.len()
        );
        self.notify_ship();
        Ok(())
    }

    /// Drop every shard of a terminal request from the store.
    pub fn purge_request_group(&self, tenant: &str, request_id: &str) -> Result<()> {
        let removed = {
            let _guard = self.write_lock.lock().unwrap();

            let shards = self.get_request_group(tenant, request_id)?;
            snafu::ensure!(!shards.is_empty(), RequestNotFound { tenant, request_id });
            snafu::ensure!(
                shards.iter().all(|s| s.status.is_terminal()),
                RequestStillActive { request_id }
            );

            for shard in &shards {
                let key = shard.store_key();
                self.primary.delete(&key)?;
                if let Some(backup) = &self.backup {
                    backup.delete(&key)?;
                }
            }
            shards.len()
        };

        info!(
            "Purged delete request, tenant:{}, request_id:{}, shards:{}",
            tenant, request_id, removed
        );
        self.notify_ship();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::tempdir;

    use super::*;
    use crate::storage::LocalFileSystem;

    const HOUR_MS: i64 = 60 * 60 * 1_000;

    fn range(start_h: i64, end_h: i64) -> TimeRange {
        TimeRange::new_unchecked(
            Timestamp::new(start_h * HOUR_MS),
            Timestamp::new(end_h * HOUR_MS),
        )
    }

    async fn new_store(
        db_type: DeleteRequestsDbType,
        store_root: &Path,
        workdir: &Path,
    ) -> Arc<DeleteRequestsStore> {
        let store = Arc::new(LocalFileSystem::new_with_prefix(store_root).unwrap());
        let storage = IndexStorageClient::new(store, "index/").unwrap();
        DeleteRequestsStore::load(db_type, None, workdir, storage)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_add_and_reload() {
        let store_root = tempdir().unwrap();
        let workdir = tempdir().unwrap();

        let store = new_store(
            DeleteRequestsDbType::Redb,
            store_root.path(),
            workdir.path(),
        )
        .await;
        let shards = store
            .add_delete_request(
                "tenant-a",
                vec![Matcher::eq("app", "x")],
                Vec::new(),
                range(0, 48),
                Duration::from_millis(24 * HOUR_MS as u64),
                Timestamp::new(1),
            )
            .unwrap();
        assert_eq!(2, shards.len());
        store.ship().await.unwrap();
        drop(store);

        // A different workdir has no local db and seeds from object storage.
        let other_workdir = tempdir().unwrap();
        let store = new_store(
            DeleteRequestsDbType::Redb,
            store_root.path(),
            other_workdir.path(),
        )
        .await;
        let reloaded = store
            .get_request_group("tenant-a", &shards[0].request_id)
            .unwrap();
        assert_eq!(shards, reloaded);
        assert_eq!(
            DeleteRequestStatus::Received,
            store
                .get_request_status("tenant-a", &shards[0].request_id)
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_status_transitions_enforced() {
        let store_root = tempdir().unwrap();
        let workdir = tempdir().unwrap();
        let store = new_store(
            DeleteRequestsDbType::Json,
            store_root.path(),
            workdir.path(),
        )
        .await;

        let shards = store
            .add_delete_request(
                "tenant-a",
                Vec::new(),
                Vec::new(),
                range(0, 4),
                Duration::from_millis(24 * HOUR_MS as u64),
                Timestamp::new(1),
            )
            .unwrap();
        let shard = &shards[0];

        // Jumping straight to processing is rejected.
        assert!(store
            .update_status(shard, DeleteRequestStatus::Processing)
            .is_err());

        let shard = store
            .update_status(shard, DeleteRequestStatus::BuildingPlan)
            .unwrap();
        let shard = store
            .update_status(&shard, DeleteRequestStatus::Processing)
            .unwrap();
        store
            .update_status(&shard, DeleteRequestStatus::Processed)
            .unwrap();

        assert_eq!(
            DeleteRequestStatus::Processed,
            store
                .get_request_status("tenant-a", &shard.request_id)
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_cancel_window() {
        let store_root = tempdir().unwrap();
        let workdir = tempdir().unwrap();
        let store = new_store(
            DeleteRequestsDbType::Redb,
            store_root.path(),
            workdir.path(),
        )
        .await;

        let shards = store
            .add_delete_request(
                "tenant-a",
                Vec::new(),
                Vec::new(),
                range(0, 48),
                Duration::from_millis(24 * HOUR_MS as u64),
                Timestamp::new(1),
            )
            .unwrap();
        store
            .cancel_request("tenant-a", &shards[0].request_id)
            .unwrap();
        assert_eq!(
            DeleteRequestStatus::Cancelled,
            store
                .get_request_status("tenant-a", &shards[0].request_id)
                .unwrap()
        );

        // A processing shard blocks cancellation.
        let shards = store
            .add_delete_request(
                "tenant-a",
                Vec::new(),
                Vec::new(),
                range(0, 4),
                Duration::from_millis(24 * HOUR_MS as u64),
                Timestamp::new(1),
            )
            .unwrap();
        let shard = store
            .update_status(&shards[0], DeleteRequestStatus::BuildingPlan)
            .unwrap();
        store
            .update_status(&shard, DeleteRequestStatus::Processing)
            .unwrap();
        assert!(store
            .cancel_request("tenant-a", &shard.request_id)
            .is_err());
    }

    #[tokio::test]
    async fn test_purge_terminal_request() {
        let store_root = tempdir().unwrap();
        let workdir = tempdir().unwrap();
        let store = new_store(
            DeleteRequestsDbType::Redb,
            store_root.path(),
            workdir.path(),
        )
        .await;

        let shards = store
            .add_delete_request(
                "tenant-a",
                Vec::new(),
                Vec::new(),
                range(0, 4),
                Duration::from_millis(24 * HOUR_MS as u64),
                Timestamp::new(1),
            )
            .unwrap();
        let request_id = shards[0].request_id.clone();

        // Still active: purge refuses.
        assert!(store.purge_request_group("tenant-a", &request_id).is_err());

        store.cancel_request("tenant-a", &request_id).unwrap();
        store.purge_request_group("tenant-a", &request_id).unwrap();
        assert!(store
            .get_request_group("tenant-a", &request_id)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_backup_db_written_alongside() {
        let store_root = tempdir().unwrap();
        let workdir = tempdir().unwrap();
        let object_store = Arc::new(LocalFileSystem::new_with_prefix(store_root.path()).unwrap());
        let storage = IndexStorageClient::new(object_store, "index/").unwrap();
        let store = DeleteRequestsStore::load(
            DeleteRequestsDbType::Redb,
            Some(DeleteRequestsDbType::Json),
            workdir.path(),
            storage.clone(),
        )
        .await
        .unwrap();

        store
            .add_delete_request(
                "tenant-a",
                Vec::new(),
                Vec::new(),
                range(0, 4),
                Duration::from_millis(24 * HOUR_MS as u64),
                Timestamp::new(1),
            )
            .unwrap();
        store.ship().await.unwrap();

        // Both flavors shipped, primary and backup.
        for file in ["delete_requests.redb", "delete_requests.json"] {
            let object = format!("{DELETE_REQUESTS_OBJECT_DIR}/{file}");
            assert!(storage.get_object(&object).await.unwrap().is_some(), "{object}");
        }
    }
}
