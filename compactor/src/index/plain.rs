// Copyright 2023 Timberline Project Authors. Licensed under Apache-2.0.

//! Plain JSON-lines index format.
//!
//! Every line is one chunk reference together with its tenant and stream
//! labels. Merging is concatenation plus dedup, which keeps the format
//! trivially re-mergeable: a compacted file is just another fragment to the
//! next cycle.

use std::{
    collections::{hash_map::DefaultHasher, BTreeMap, HashMap},
    fs,
    hash::Hasher,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::{
    index::{
        CompactedIndex, IndexCompactor, ParseLine, ReadFragment, Result, TableCompactor,
        WriteIndexFile, COMPACTED_FILE_SUFFIX,
    },
    labels::Labels,
    retention::{ChunkEntry, SeriesEntry},
    schema::PeriodConfig,
    storage::IndexStorageClient,
};

pub const PLAIN_INDEX_TYPE: &str = "plain";

/// One line of a plain index file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexLine {
    pub tenant: String,
    pub labels: Labels,
    pub chunk: ChunkEntry,
}

/// Encode lines the way fragments and compacted files store them. Used by
/// ingester-side writers and tests.
pub fn encode_index_lines(lines: &[IndexLine]) -> Vec<u8> {
    let mut buf = Vec::new();
    for line in lines {
        buf.extend_from_slice(&serde_json::to_vec(line).expect("index line serialize"));
        buf.push(b'\n');
    }
    buf
}

pub struct PlainIndexCompactor;

impl IndexCompactor for PlainIndexCompactor {
    fn new_table_compactor(
        &self,
        table_name: &str,
        storage: IndexStorageClient,
        _workdir: PathBuf,
        _period: &PeriodConfig,
    ) -> Box<dyn TableCompactor> {
        Box::new(PlainTableCompactor {
            table_name: table_name.to_string(),
            storage,
        })
    }
}

struct PlainTableCompactor {
    table_name: String,
    storage: IndexStorageClient,
}

#[async_trait]
impl TableCompactor for PlainTableCompactor {
    async fn compact(&mut self) -> Result<HashMap<String, Box<dyn CompactedIndex>>> {
        let files = self
            .storage
            .list_table_files(&self.table_name)
            .await
            .context(ReadFragment {
                table: &self.table_name,
                file: "",
            })?;

        let mut per_tenant: HashMap<String, PlainCompactedIndex> = HashMap::new();
        for file in files {
            let data = self
                .storage
                .get_file(&self.table_name, &file.name)
                .await
                .context(ReadFragment {
                    table: &self.table_name,
                    file: &file.name,
                })?;

            for (line_no, raw) in data.split(|b| *b == b'\n').enumerate() {
                if raw.is_empty() {
                    continue;
                }
                let line: IndexLine =
                    serde_json::from_slice(raw).context(ParseLine {
                        table: &self.table_name,
                        file: &file.name,
                        line: line_no + 1,
                    })?;

                per_tenant
                    .entry(line.tenant.clone())
                    .or_insert_with(|| PlainCompactedIndex::new(&self.table_name, &line.tenant))
                    .insert(line.labels, line.chunk);
            }
        }

        Ok(per_tenant
            .into_iter()
            .map(|(tenant, index)| (tenant, Box::new(index) as Box<dyn CompactedIndex>))
            .collect())
    }
}

#[derive(Clone, Debug)]
struct PlainSeries {
    labels: Labels,
    /// Chunks keyed by chunk key, deduped across fragments.
    chunks: BTreeMap<String, ChunkEntry>,
}

/// In-memory merged index of one tenant.
pub struct PlainCompactedIndex {
    table_name: String,
    tenant: String,
    /// Series keyed by the label fingerprint, big-endian so iteration order
    /// is stable.
    series: BTreeMap<[u8; 8], PlainSeries>,
}

impl PlainCompactedIndex {
    fn new(table_name: &str, tenant: &str) -> Self {
        Self {
            table_name: table_name.to_string(),
            tenant: tenant.to_string(),
            series: BTreeMap::new(),
        }
    }

    fn insert(&mut self, labels: Labels, chunk: ChunkEntry) {
        let series_id = labels.fingerprint().to_be_bytes();
        self.series
            .entry(series_id)
            .or_insert_with(|| PlainSeries {
                labels,
                chunks: BTreeMap::new(),
            })
            .chunks
            .insert(chunk.key.clone(), chunk);
    }

    fn lines(&self) -> Vec<IndexLine> {
        self.series
            .values()
            .flat_map(|series| {
                series.chunks.values().map(|chunk| IndexLine {
                    tenant: self.tenant.clone(),
                    labels: series.labels.clone(),
                    chunk: chunk.clone(),
                })
            })
            .collect()
    }
}

impl CompactedIndex for PlainCompactedIndex {
    fn list_series(&self) -> Vec<SeriesEntry> {
        self.series
            .iter()
            .map(|(series_id, series)| SeriesEntry {
                tenant: self.tenant.clone(),
                series_id: series_id.to_vec(),
                labels: series.labels.clone(),
                chunks: series.chunks.values().cloned().collect(),
            })
            .collect()
    }

    fn remove_chunk(&mut self, series_id: &[u8], chunk_key: &str) -> bool {
        let Ok(series_id) = <[u8; 8]>::try_from(series_id) else {
            return false;
        };
        let Some(series) = self.series.get_mut(&series_id) else {
            return false;
        };

        let removed = series.chunks.remove(chunk_key).is_some();
        if series.chunks.is_empty() {
            self.series.remove(&series_id);
        }
        removed
    }

    fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    fn to_index_file(&self, dir: &Path) -> Result<PathBuf> {
        let data = encode_index_lines(&self.lines());

        // Content addressed name: re-running compaction over identical input
        // produces an identical object set.
        let mut hasher = DefaultHasher::new();
        hasher.write(&data);
        let name = format!(
            "{}-{:016x}{}",
            self.table_name,
            hasher.finish(),
            COMPACTED_FILE_SUFFIX
        );

        let path = dir.join(name);
        fs::write(&path, data).context(WriteIndexFile {
            path: path.display().to_string(),
        })?;
        Ok(path)
    }
}
