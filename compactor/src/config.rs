// Copyright 2023 Timberline Project Authors. Licensed under Apache-2.0.

//! Compactor configuration.

use std::path::PathBuf;

use common_util::{config::ReadableDuration, define_result, retry::BackoffConfig};
use serde::{Deserialize, Serialize};
use snafu::{ensure, Backtrace, Snafu};

use crate::{
    deletion::store::DeleteRequestsDbType,
    ring::{RING_NUM_TOKENS, RING_REPLICATION_FACTOR},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("max_compaction_parallelism must be >= 1.\nBacktrace:\n{}", backtrace))]
    InvalidParallelism { backtrace: Backtrace },

    #[snafu(display(
        "Ring num_tokens is fixed to {} and must not be changed.\nBacktrace:\n{}",
        RING_NUM_TOKENS,
        backtrace
    ))]
    NumTokensOverridden { backtrace: Backtrace },

    #[snafu(display(
        "Ring replication_factor is fixed to {} and must not be changed.\nBacktrace:\n{}",
        RING_REPLICATION_FACTOR,
        backtrace
    ))]
    ReplicationFactorOverridden { backtrace: Backtrace },

    #[snafu(display(
        "delete_request_store must be configured when retention is enabled.\nBacktrace:\n{}",
        backtrace
    ))]
    DeleteStoreUnset { backtrace: Backtrace },

    #[snafu(display(
        "apply_retention_interval must be a multiple of compaction_interval.\nBacktrace:\n{}",
        backtrace
    ))]
    RetentionIntervalNotAligned { backtrace: Backtrace },

    #[snafu(display("Invalid key prefix, prefix:{}, msg:{}.\nBacktrace:\n{}", prefix, msg, backtrace))]
    InvalidKeyPrefix {
        prefix: String,
        msg: String,
        backtrace: Backtrace,
    },
}

define_result!(Error);

/// Ring membership settings of this replica. Token count and replication
/// factor exist only to be validated: leader election needs exactly one
/// token and one owner per key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    pub instance_id: String,
    pub instance_addr: String,
    pub heartbeat_period: ReadableDuration,
    pub heartbeat_timeout: ReadableDuration,
    pub tokens_file_path: Option<PathBuf>,
    pub num_tokens: usize,
    pub replication_factor: usize,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            instance_id: format!("compactor-{}", std::process::id()),
            instance_addr: "127.0.0.1".to_string(),
            heartbeat_period: ReadableDuration::secs(15),
            heartbeat_timeout: ReadableDuration::minutes(1),
            tokens_file_path: None,
            num_tokens: RING_NUM_TOKENS,
            replication_factor: RING_REPLICATION_FACTOR,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of transient working state.
    pub working_directory: PathBuf,
    pub compaction_interval: ReadableDuration,
    /// 0 means "same as compaction_interval" (plus jitter); otherwise it must
    /// be a multiple of the compaction interval.
    pub apply_retention_interval: ReadableDuration,
    pub retention_enabled: bool,
    /// Grace period before marked chunks are physically deleted.
    pub retention_delete_delay: ReadableDuration,
    pub retention_delete_worker_count: usize,
    /// Max wallclock time spent on any single table during retention,
    /// 0 = unbounded.
    pub retention_table_timeout: ReadableDuration,
    pub retention_backoff_config: BackoffConfig,
    pub delete_request_store: String,
    pub delete_request_store_key_prefix: String,
    pub delete_request_store_db_type: DeleteRequestsDbType,
    pub backup_delete_request_store_db_type: Option<DeleteRequestsDbType>,
    pub delete_batch_size: usize,
    pub delete_request_cancel_period: ReadableDuration,
    pub delete_max_interval: ReadableDuration,
    pub max_compaction_parallelism: usize,
    pub upload_parallelism: usize,
    /// Run one compaction pass, then block until shutdown.
    pub run_once: bool,
    /// 0 = compact all tables.
    pub tables_to_compact: usize,
    pub skip_latest_n_tables: usize,
    pub ring: RingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            working_directory: PathBuf::from("/var/timberline/compactor"),
            compaction_interval: ReadableDuration::minutes(10),
            apply_retention_interval: ReadableDuration::secs(0),
            retention_enabled: false,
            retention_delete_delay: ReadableDuration::hours(2),
            retention_delete_worker_count: 150,
            retention_table_timeout: ReadableDuration::secs(0),
            retention_backoff_config: BackoffConfig::default(),
            delete_request_store: String::new(),
            delete_request_store_key_prefix: "index/".to_string(),
            delete_request_store_db_type: DeleteRequestsDbType::Redb,
            backup_delete_request_store_db_type: None,
            delete_batch_size: 70,
            delete_request_cancel_period: ReadableDuration::hours(24),
            delete_max_interval: ReadableDuration::hours(24),
            max_compaction_parallelism: 1,
            upload_parallelism: 10,
            run_once: false,
            tables_to_compact: 0,
            skip_latest_n_tables: 0,
            ring: RingConfig::default(),
        }
    }
}

impl Config {
    /// Fail fast on inappropriate values. May rewrite
    /// `apply_retention_interval` to its effective value.
    pub fn validate(&mut self) -> Result<()> {
        ensure!(self.max_compaction_parallelism >= 1, InvalidParallelism);
        ensure!(self.ring.num_tokens == RING_NUM_TOKENS, NumTokensOverridden);
        ensure!(
            self.ring.replication_factor == RING_REPLICATION_FACTOR,
            ReplicationFactorOverridden
        );

        if self.retention_enabled {
            ensure!(!self.delete_request_store.is_empty(), DeleteStoreUnset);
            validate_path_prefix(&self.delete_request_store_key_prefix)?;

            if self.apply_retention_interval.is_zero() {
                self.apply_retention_interval = self.compaction_interval;
            }
            if self.apply_retention_interval == self.compaction_interval {
                // Jitter so retention does not always coincide with a plain
                // compaction tick.
                let jitter = ReadableDuration::minutes(10).min(self.apply_retention_interval / 2);
                self.apply_retention_interval = ReadableDuration::millis(
                    self.apply_retention_interval.as_millis() + jitter.as_millis(),
                );
            } else {
                ensure!(
                    self.apply_retention_interval.as_millis()
                        % self.compaction_interval.as_millis().max(1)
                        == 0,
                    RetentionIntervalNotAligned
                );
            }
        }

        Ok(())
    }
}

/// A key prefix must be relative, slash-terminated, and free of empty or
/// parent segments.
pub fn validate_path_prefix(prefix: &str) -> Result<()> {
    let fail = |msg: &str| {
        InvalidKeyPrefix {
            prefix: prefix.to_string(),
            msg: msg.to_string(),
        }
        .fail()
    };

    if prefix.is_empty() {
        return fail("prefix must not be empty");
    }
    if !prefix.ends_with('/') {
        return fail("prefix must end with /");
    }
    if prefix.starts_with('/') {
        return fail("prefix must be relative");
    }
    for segment in prefix.trim_end_matches('/').split('/') {
        if segment.is_empty() {
            return fail("prefix must not contain empty segments");
        }
        if segment == ".." || segment == "." {
            return fail("prefix must not contain relative segments");
        }
    }

    Ok(())
}
