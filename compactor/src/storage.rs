// Copyright 2023 Timberline Project Authors. Licensed under Apache-2.0.

//! Object storage clients scoped to the compactor's needs.
//!
//! [IndexStorageClient] hides the schema index prefix: callers deal in table
//! names and table relative file names only, prefixed paths never leak out.

use std::sync::Arc;

use bytes::Bytes;
use common_util::{define_result, time::Timestamp};
use futures::TryStreamExt;
use object_store::{path::Path, ObjectStore};
use snafu::{ResultExt, Snafu};

pub use object_store::local::LocalFileSystem;

pub type ObjectStoreRef = Arc<dyn ObjectStore>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Invalid storage prefix, prefix:{}, err:{}", prefix, source))]
    InvalidPrefix {
        prefix: String,
        source: object_store::path::Error,
    },

    #[snafu(display("Failed to list objects, prefix:{}, err:{}", prefix, source))]
    List {
        prefix: String,
        source: object_store::Error,
    },

    #[snafu(display("Failed to get object, path:{}, err:{}", path, source))]
    Get {
        path: String,
        source: object_store::Error,
    },

    #[snafu(display("Failed to put object, path:{}, err:{}", path, source))]
    Put {
        path: String,
        source: object_store::Error,
    },

    #[snafu(display("Failed to delete object, path:{}, err:{}", path, source))]
    Delete {
        path: String,
        source: object_store::Error,
    },
}

define_result!(Error);

/// Listing entry for a file inside a table, named relative to the table.
#[derive(Clone, Debug, PartialEq)]
pub struct FileMeta {
    pub name: String,
    pub size: usize,
    pub modified_at: Timestamp,
}

/// Lists tables and manages files below one index prefix of an object store.
#[derive(Clone)]
pub struct IndexStorageClient {
    store: ObjectStoreRef,
    prefix: Path,
}

impl IndexStorageClient {
    pub fn new(store: ObjectStoreRef, prefix: &str) -> Result<Self> {
        let prefix = Path::parse(prefix.trim_end_matches('/')).context(InvalidPrefix { prefix })?;
        Ok(Self { store, prefix })
    }

    fn table_path(&self, table: &str) -> Path {
        Path::from_iter(self.prefix.parts().chain(Path::from(table).parts()))
    }

    fn file_path(&self, table: &str, name: &str) -> Path {
        Path::from_iter(
            self.prefix
                .parts()
                .chain(Path::from(table).parts())
                .chain(Path::from(name).parts()),
        )
    }

    /// All table names below the index prefix.
    pub async fn list_tables(&self) -> Result<Vec<String>> {
        let listing = self
            .store
            .list_with_delimiter(Some(&self.prefix))
            .await
            .context(List {
                prefix: self.prefix.to_string(),
            })?;

        Ok(listing
            .common_prefixes
            .iter()
            .filter_map(|p| p.parts().last().map(|part| part.as_ref().to_string()))
            .collect())
    }

    /// All files of a table, recursively, named relative to the table dir.
    pub async fn list_table_files(&self, table: &str) -> Result<Vec<FileMeta>> {
        let table_path = self.table_path(table);
        let objects: Vec<_> = self
            .store
            .list(Some(&table_path))
            .await
            .context(List {
                prefix: table_path.to_string(),
            })?
            .try_collect()
            .await
            .context(List {
                prefix: table_path.to_string(),
            })?;

        let dir_prefix = format!("{}/", table_path);
        Ok(objects
            .into_iter()
            .filter_map(|meta| {
                let name = meta.location.as_ref().strip_prefix(&dir_prefix)?.to_string();
                Some(FileMeta {
                    name,
                    size: meta.size,
                    modified_at: Timestamp::new(meta.last_modified.timestamp_millis()),
                })
            })
            .collect())
    }

    pub async fn get_file(&self, table: &str, name: &str) -> Result<Bytes> {
        let path = self.file_path(table, name);
        self.store
            .get(&path)
            .await
            .context(Get {
                path: path.to_string(),
            })?
            .bytes()
            .await
            .context(Get {
                path: path.to_string(),
            })
    }

    pub async fn put_file(&self, table: &str, name: &str, data: Bytes) -> Result<()> {
        let path = self.file_path(table, name);
        self.store.put(&path, data).await.context(Put {
            path: path.to_string(),
        })
    }

    /// Delete a table file. A missing object counts as success.
    pub async fn delete_file(&self, table: &str, name: &str) -> Result<()> {
        let path = self.file_path(table, name);
        match self.store.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(source) => Err(source).context(Delete {
                path: path.to_string(),
            }),
        }
    }

    /// Fetch an object below the prefix, `None` when it does not exist.
    pub async fn get_object(&self, name: &str) -> Result<Option<Bytes>> {
        let path = Path::from_iter(self.prefix.parts().chain(Path::from(name).parts()));
        match self.store.get(&path).await {
            Ok(result) => Ok(Some(result.bytes().await.context(Get {
                path: path.to_string(),
            })?)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(source) => Err(source).context(Get {
                path: path.to_string(),
            }),
        }
    }

    pub async fn put_object(&self, name: &str, data: Bytes) -> Result<()> {
        let path = Path::from_iter(self.prefix.parts().chain(Path::from(name).parts()));
        self.store.put(&path, data).await.context(Put {
            path: path.to_string(),
        })
    }
}

/// Deletes chunk objects by their storage key on the root object store.
#[derive(Clone)]
pub struct ChunkClient {
    store: ObjectStoreRef,
}

impl ChunkClient {
    pub fn new(store: ObjectStoreRef) -> Self {
        Self { store }
    }

    /// Delete the chunk object at `key`. NotFound counts as success so
    /// repeated deletes of the same key stay idempotent.
    pub async fn delete_chunk(&self, key: &str) -> Result<()> {
        let path = Path::from(key);
        match self.store.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(source) => Err(source).context(Delete {
                path: path.to_string(),
            }),
        }
    }
}
