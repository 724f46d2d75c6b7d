// Copyright 2023 Timberline Project Authors. Licensed under Apache-2.0.

//! Retention: deciding which chunks are expired and recording them for the
//! sweeper.

pub mod marker;
pub mod sweeper;

use std::sync::Arc;

use common_util::{
    define_result,
    time::{ClockRef, TimeRange, Timestamp},
};
use log::debug;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::{
    index::CompactedIndex,
    labels::Labels,
    limits::LimitsRef,
    retention::marker::MarkerWriter,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to write chunk marker, table:{}, err:{}", table, source))]
    WriteMarker {
        table: String,
        source: marker::Error,
    },

    #[snafu(display("Failed to finish series, table:{}, tenant:{}, msg:{}", table, tenant, msg))]
    FinishSeries {
        table: String,
        tenant: String,
        msg: String,
    },
}

define_result!(Error);

/// One chunk reference carried by the index, range `[from, through)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChunkEntry {
    pub key: String,
    pub from: Timestamp,
    pub through: Timestamp,
}

impl ChunkEntry {
    pub fn time_range(&self) -> TimeRange {
        TimeRange::new_unchecked(self.from, self.through)
    }
}

/// One stream of one tenant with its chunks, as exposed by a compacted
/// index.
#[derive(Clone, Debug)]
pub struct SeriesEntry {
    pub tenant: String,
    pub series_id: Vec<u8>,
    pub labels: Labels,
    pub chunks: Vec<ChunkEntry>,
}

impl SeriesEntry {
    /// Earliest chunk start, [Timestamp::MAX] for a chunkless series.
    pub fn start(&self) -> Timestamp {
        self.chunks
            .iter()
            .map(|c| c.from)
            .min()
            .unwrap_or(Timestamp::MAX)
    }
}

/// Verdict on whether a chunk must go away.
///
/// `retained` lists the sub-ranges of the chunk that must survive; it is
/// empty when the whole chunk is expired.
pub type ExpiredVerdict = (bool, Vec<TimeRange>);

/// Decides expiration of chunks, composed out of retention and deletion
/// checkers by the service.
pub trait ExpirationChecker: Send + Sync {
    fn expired(
        &self,
        tenant: &str,
        chunk: &ChunkEntry,
        labels: &Labels,
        series_id: &[u8],
        table_name: &str,
        now: Timestamp,
    ) -> ExpiredVerdict;

    /// Cheap gate: can `interval` possibly hold expired chunks? `tenant` is
    /// `None` for table level checks spanning all tenants.
    fn interval_may_have_expired_chunks(&self, interval: TimeRange, tenant: Option<&str>) -> bool;

    /// Whether a whole series can be skipped without looking at its chunks.
    fn can_skip_series(
        &self,
        tenant: &str,
        labels: &Labels,
        series_id: &[u8],
        series_start: Timestamp,
        table_name: &str,
        now: Timestamp,
    ) -> bool;

    /// Called once per series after all its chunks were visited.
    fn mark_series_as_processed(
        &self,
        tenant: &str,
        series_id: &[u8],
        labels: &Labels,
        table_name: &str,
    ) -> std::result::Result<(), String>;

    // Phase hooks bracketing one retention pass over all tables.
    fn mark_phase_started(&self);
    fn mark_phase_finished(&self);
    fn mark_phase_failed(&self);
    fn mark_phase_timed_out(&self);
}

pub type ExpirationCheckerRef = Arc<dyn ExpirationChecker>;

/// Checker used while retention is disabled.
pub struct NeverExpiringChecker;

impl ExpirationChecker for NeverExpiringChecker {
    fn expired(
        &self,
        _tenant: &str,
        _chunk: &ChunkEntry,
        _labels: &Labels,
        _series_id: &[u8],
        _table_name: &str,
        _now: Timestamp,
    ) -> ExpiredVerdict {
        (false, Vec::new())
    }

    fn interval_may_have_expired_chunks(&self, _interval: TimeRange, _tenant: Option<&str>) -> bool {
        false
    }

    fn can_skip_series(
        &self,
        _tenant: &str,
        _labels: &Labels,
        _series_id: &[u8],
        _series_start: Timestamp,
        _table_name: &str,
        _now: Timestamp,
    ) -> bool {
        true
    }

    fn mark_series_as_processed(
        &self,
        _tenant: &str,
        _series_id: &[u8],
        _labels: &Labels,
        _table_name: &str,
    ) -> std::result::Result<(), String> {
        Ok(())
    }

    fn mark_phase_started(&self) {}
    fn mark_phase_finished(&self) {}
    fn mark_phase_failed(&self) {}
    fn mark_phase_timed_out(&self) {}
}

/// Limits driven retention checker: a chunk is expired once it ended a full
/// retention period ago. The applicable period is the matching stream
/// override with the highest priority, else the tenant default.
pub struct RetentionChecker {
    limits: LimitsRef,
    clock: ClockRef,
}

impl RetentionChecker {
    pub fn new(limits: LimitsRef, clock: ClockRef) -> Self {
        Self { limits, clock }
    }

    fn period_for(&self, tenant: &str, labels: &Labels) -> std::time::Duration {
        let mut rules = self.limits.stream_retention(tenant);
        rules.sort_by_key(|r| std::cmp::Reverse(r.priority));
        for rule in rules {
            let matched = rule.matchers.iter().all(|m| match m.compile() {
                Ok(compiled) => compiled.matches(labels),
                Err(e) => {
                    debug!("Skipping unparseable stream retention matcher, err:{}", e);
                    false
                }
            });
            if matched && !rule.matchers.is_empty() {
                return rule.period.into();
            }
        }

        self.limits.retention_period(tenant)
    }

    fn smallest_period_for(&self, tenant: Option<&str>) -> std::time::Duration {
        match tenant {
            None => self.limits.smallest_retention_period(),
            Some(tenant) => {
                let mut smallest = self.limits.retention_period(tenant);
                for rule in self.limits.stream_retention(tenant) {
                    smallest = smallest.min(rule.period.into());
                }
                smallest
            }
        }
    }
}

impl ExpirationChecker for RetentionChecker {
    fn expired(
        &self,
        tenant: &str,
        chunk: &ChunkEntry,
        labels: &Labels,
        _series_id: &[u8],
        _table_name: &str,
        now: Timestamp,
    ) -> ExpiredVerdict {
        let cutoff = now.sub_duration_or_min(self.period_for(tenant, labels));
        // Whole chunk granularity: a chunk straddling the cutoff stays.
        (chunk.through <= cutoff, Vec::new())
    }

    fn interval_may_have_expired_chunks(&self, interval: TimeRange, tenant: Option<&str>) -> bool {
        let cutoff = self
            .clock
            .now()
            .sub_duration_or_min(self.smallest_period_for(tenant));
        interval.start() < cutoff
    }

    fn can_skip_series(
        &self,
        tenant: &str,
        labels: &Labels,
        _series_id: &[u8],
        series_start: Timestamp,
        _table_name: &str,
        now: Timestamp,
    ) -> bool {
        // Even the oldest chunk is younger than the retention cutoff.
        let cutoff = now.sub_duration_or_min(self.period_for(tenant, labels));
        series_start > cutoff
    }

    fn mark_series_as_processed(
        &self,
        _tenant: &str,
        _series_id: &[u8],
        _labels: &Labels,
        _table_name: &str,
    ) -> std::result::Result<(), String> {
        Ok(())
    }

    fn mark_phase_started(&self) {}
    fn mark_phase_finished(&self) {}
    fn mark_phase_failed(&self) {}
    fn mark_phase_timed_out(&self) {}
}

/// Outcome of marking one compacted index.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MarkStats {
    pub series_visited: usize,
    pub chunks_marked: usize,
    /// Chunks a delete request covers only partially; left in the index.
    pub chunks_partially_retained: usize,
}

/// Walks a compacted index, removes expired chunks and records them in the
/// marker writer.
pub struct TableMarker {
    checker: ExpirationCheckerRef,
    clock: ClockRef,
}

impl TableMarker {
    pub fn new(checker: ExpirationCheckerRef, clock: ClockRef) -> Self {
        Self { checker, clock }
    }

    pub fn mark_index(
        &self,
        index: &mut dyn CompactedIndex,
        table_name: &str,
        writer: &mut MarkerWriter,
    ) -> Result<MarkStats> {
        let now = self.clock.now();
        let mut stats = MarkStats::default();

        for series in index.list_series() {
            if self.checker.can_skip_series(
                &series.tenant,
                &series.labels,
                &series.series_id,
                series.start(),
                table_name,
                now,
            ) {
                continue;
            }
            stats.series_visited += 1;

            for chunk in &series.chunks {
                let (expired, retained) = self.checker.expired(
                    &series.tenant,
                    chunk,
                    &series.labels,
                    &series.series_id,
                    table_name,
                    now,
                );
                if !expired {
                    continue;
                }
                if !retained.is_empty() {
                    // Partially covered chunks are kept whole; rewriting
                    // chunk objects is not this component's business.
                    stats.chunks_partially_retained += 1;
                    continue;
                }

                writer.mark(&chunk.key).context(WriteMarker { table: table_name })?;
                index.remove_chunk(&series.series_id, &chunk.key);
                stats.chunks_marked += 1;
            }

            self.checker
                .mark_series_as_processed(
                    &series.tenant,
                    &series.series_id,
                    &series.labels,
                    table_name,
                )
                .map_err(|msg| Error::FinishSeries {
                    table: table_name.to_string(),
                    tenant: series.tenant.clone(),
                    msg,
                })?;
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use common_util::{
        config::ReadableDuration,
        time::{ManualClock, Timestamp},
    };

    use super::*;
    use crate::{
        labels::Matcher,
        limits::{StaticLimits, StreamRetention, TenantLimits},
    };

    const DAY_MS: i64 = 24 * 60 * 60 * 1_000;

    fn limits_with_override() -> StaticLimits {
        let mut limits = StaticLimits {
            retention_period: ReadableDuration::days(31),
            ..Default::default()
        };
        limits.tenants.insert(
            "tenant-a".to_string(),
            TenantLimits {
                retention_period: Some(ReadableDuration::days(7)),
                stream_retention: vec![StreamRetention {
                    priority: 1,
                    period: ReadableDuration::days(1),
                    matchers: vec![Matcher::eq("app", "noisy")],
                }],
            },
        );
        limits
    }

    fn chunk(key: &str, from: i64, through: i64) -> ChunkEntry {
        ChunkEntry {
            key: key.to_string(),
            from: Timestamp::new(from),
            through: Timestamp::new(through),
        }
    }

    #[test]
    fn test_retention_checker_periods() {
        let clock: ClockRef = Arc::new(ManualClock::new(Timestamp::new(40 * DAY_MS)));
        let checker = RetentionChecker::new(Arc::new(limits_with_override()), clock);
        let now = Timestamp::new(40 * DAY_MS);

        let quiet = Labels::from_pairs(&[("app", "quiet")]);
        let noisy = Labels::from_pairs(&[("app", "noisy")]);

        // Tenant default: 7d. A chunk that ended 8 days ago is gone, one that
        // ended 6 days ago stays.
        let old = chunk("c-old", 30 * DAY_MS, 32 * DAY_MS);
        let fresh = chunk("c-new", 33 * DAY_MS, 34 * DAY_MS);
        assert!(checker.expired("tenant-a", &old, &quiet, b"s", "t", now).0);
        assert!(!checker.expired("tenant-a", &fresh, &quiet, b"s", "t", now).0);

        // Stream override: 1d beats the tenant default.
        assert!(checker.expired("tenant-a", &fresh, &noisy, b"s", "t", now).0);

        // Other tenants use the global 31d default.
        assert!(!checker.expired("other", &old, &quiet, b"s", "t", now).0);
    }

    #[test]
    fn test_can_skip_series() {
        let clock: ClockRef = Arc::new(ManualClock::new(Timestamp::new(40 * DAY_MS)));
        let checker = RetentionChecker::new(Arc::new(limits_with_override()), clock);
        let now = Timestamp::new(40 * DAY_MS);
        let labels = Labels::from_pairs(&[("app", "quiet")]);

        // Series whose oldest chunk is 2 days old: nothing can be expired
        // under a 7d retention.
        assert!(checker.can_skip_series(
            "tenant-a",
            &labels,
            b"s",
            Timestamp::new(38 * DAY_MS),
            "t",
            now
        ));
        assert!(!checker.can_skip_series(
            "tenant-a",
            &labels,
            b"s",
            Timestamp::new(30 * DAY_MS),
            "t",
            now
        ));
    }

    #[test]
    fn test_mark_index_removes_expired_chunks() {
        use tempfile::tempdir;

        use crate::index::{plain::PlainIndexCompactor, IndexCompactor};
        use crate::{schema::PeriodConfig, storage::IndexStorageClient};

        let clock: ClockRef = Arc::new(ManualClock::new(Timestamp::new(40 * DAY_MS)));
        let checker: ExpirationCheckerRef = Arc::new(RetentionChecker::new(
            Arc::new(limits_with_override()),
            clock.clone(),
        ));
        let marker = TableMarker::new(checker, clock);

        // Build a plain index with one expired and one fresh chunk.
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let dir = tempdir().unwrap();
        let mut index = rt.block_on(async {
            use bytes::Bytes;

            use crate::index::plain::{encode_index_lines, IndexLine};

            let store =
                std::sync::Arc::new(crate::storage::LocalFileSystem::new_with_prefix(dir.path()).unwrap());
            let storage = IndexStorageClient::new(store, "index/").unwrap();
            let lines = vec![
                IndexLine {
                    tenant: "tenant-a".to_string(),
                    labels: Labels::from_pairs(&[("app", "quiet")]),
                    chunk: chunk("a/expired", 30 * DAY_MS, 31 * DAY_MS),
                },
                IndexLine {
                    tenant: "tenant-a".to_string(),
                    labels: Labels::from_pairs(&[("app", "quiet")]),
                    chunk: chunk("a/fresh", 39 * DAY_MS, 40 * DAY_MS),
                },
            ];
            storage
                .put_file("index_1", "frag", Bytes::from(encode_index_lines(&lines)))
                .await
                .unwrap();
            let mut compactor = PlainIndexCompactor.new_table_compactor(
                "index_1",
                storage,
                std::path::PathBuf::new(),
                &PeriodConfig::default(),
            );
            compactor.compact().await.unwrap().remove("tenant-a").unwrap()
        });

        let scratch = dir.path().join("marks");
        let mut writer = MarkerWriter::create(&scratch).unwrap();
        let stats = marker
            .mark_index(index.as_mut(), "index_1", &mut writer)
            .unwrap();
        let (path, count) = writer.finish().unwrap();

        assert_eq!(1, stats.chunks_marked);
        assert_eq!(1, count);
        assert_eq!(
            vec!["a/expired".to_string()],
            marker::read_marker_keys(&path).unwrap()
        );
        assert!(!index.is_empty());
        assert_eq!(1, index.list_series()[0].chunks.len());
    }
}
