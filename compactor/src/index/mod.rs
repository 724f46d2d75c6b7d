// Copyright 2023 Timberline Project Authors. Licensed under Apache-2.0.

//! Index format plug-ins.
//!
//! The compactor treats index files as opaque: a format plug-in, registered
//! under the `index_type` string of a schema period, merges the fragments of
//! one table and hands back per-tenant compacted indexes the retention code
//! can walk.

pub mod plain;

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use common_util::define_result;
use snafu::{Backtrace, Snafu};

use crate::{
    retention::SeriesEntry,
    schema::PeriodConfig,
    storage::IndexStorageClient,
};

/// Suffix marking an uploaded compacted index object.
pub const COMPACTED_FILE_SUFFIX: &str = ".compacted";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to read index fragment, table:{}, file:{}, err:{}", table, file, source))]
    ReadFragment {
        table: String,
        file: String,
        source: crate::storage::Error,
    },

    #[snafu(display(
        "Failed to parse index line, table:{}, file:{}, line:{}, err:{}",
        table,
        file,
        line,
        source
    ))]
    ParseLine {
        table: String,
        file: String,
        line: usize,
        source: serde_json::Error,
    },

    #[snafu(display("Failed to write index file, path:{}, err:{}", path, source))]
    WriteIndexFile {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("Index plug-in failure, msg:{}.\nBacktrace:\n{}", msg, backtrace))]
    Plugin { msg: String, backtrace: Backtrace },
}

define_result!(Error);

/// Whether a table file name (relative to the table dir) denotes a compacted
/// index published by an earlier cycle.
pub fn is_compacted_file(name: &str) -> bool {
    name.ends_with(COMPACTED_FILE_SUFFIX)
}

/// The merged index of one tenant in one table.
///
/// Doubles as the retention processing surface: the table marker walks the
/// series, removes expired chunks, and the remainder is serialized for
/// upload.
pub trait CompactedIndex: Send {
    /// Snapshot of all series currently in the index.
    fn list_series(&self) -> Vec<SeriesEntry>;

    /// Drop one chunk, returns whether it was present. An emptied series is
    /// dropped with its last chunk.
    fn remove_chunk(&mut self, series_id: &[u8], chunk_key: &str) -> bool;

    fn is_empty(&self) -> bool;

    /// Serialize into `dir` and return the file path. The file name must be
    /// deterministic in the index contents and carry
    /// [COMPACTED_FILE_SUFFIX].
    fn to_index_file(&self, dir: &Path) -> Result<PathBuf>;
}

/// Merges all fragments of one table.
#[async_trait]
pub trait TableCompactor: Send {
    /// Download and merge the table's fragments, yielding one compacted
    /// index per tenant.
    async fn compact(&mut self) -> Result<HashMap<String, Box<dyn CompactedIndex>>>;
}

/// Factory for [TableCompactor]s, one per index format.
pub trait IndexCompactor: Send + Sync {
    fn new_table_compactor(
        &self,
        table_name: &str,
        storage: IndexStorageClient,
        workdir: PathBuf,
        period: &PeriodConfig,
    ) -> Box<dyn TableCompactor>;
}

pub type IndexCompactorRef = Arc<dyn IndexCompactor>;

/// The built-in plug-ins, keyed by index type.
pub fn default_index_compactors() -> HashMap<String, IndexCompactorRef> {
    let mut compactors: HashMap<String, IndexCompactorRef> = HashMap::new();
    compactors.insert(
        plain::PLAIN_INDEX_TYPE.to_string(),
        Arc::new(plain::PlainIndexCompactor),
    );
    compactors
}
