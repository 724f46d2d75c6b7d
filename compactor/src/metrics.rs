// Copyright 2023 Timberline Project Authors. Licensed under Apache-2.0.

//! Metrics of the compactor.

use lazy_static::lazy_static;
use prometheus::{
    register_gauge, register_int_counter, register_int_counter_vec, register_int_gauge, Gauge,
    IntCounter, IntCounterVec, IntGauge,
};

lazy_static! {
    /// 1 while this replica is the elected compactor runner.
    pub static ref COMPACTOR_RUNNING: IntGauge = register_int_gauge!(
        "compactor_running",
        "Whether this instance currently runs the compactor"
    )
    .unwrap();

    pub static ref COMPACT_TABLES_OPERATION_TOTAL: IntCounterVec = register_int_counter_vec!(
        "compactor_compact_tables_operation_total",
        "Number of compaction passes, partitioned by outcome",
        &["status"]
    )
    .unwrap();

    pub static ref COMPACT_TABLES_OPERATION_DURATION_SECONDS: Gauge = register_gauge!(
        "compactor_compact_tables_operation_duration_seconds",
        "Duration of the last compaction pass in seconds"
    )
    .unwrap();

    pub static ref TABLES_COMPACTED_TOTAL: IntCounter = register_int_counter!(
        "compactor_tables_compacted_total",
        "Number of tables whose fragments were merged"
    )
    .unwrap();

    pub static ref RETENTION_MARKED_CHUNKS_TOTAL: IntCounter = register_int_counter!(
        "compactor_retention_marked_chunks_total",
        "Chunks written to marker files for deferred deletion"
    )
    .unwrap();

    pub static ref SWEEPER_CHUNKS_DELETED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "compactor_sweeper_chunks_deleted_total",
        "Chunk delete attempts by the sweeper, partitioned by outcome",
        &["status"]
    )
    .unwrap();

    pub static ref DELETE_REQUESTS_RECEIVED_TOTAL: IntCounter = register_int_counter!(
        "compactor_delete_requests_received_total",
        "Delete requests accepted into the store"
    )
    .unwrap();

    pub static ref DELETE_REQUESTS_PROCESSED_TOTAL: IntCounter = register_int_counter!(
        "compactor_delete_requests_processed_total",
        "Delete request shards fully applied to the index"
    )
    .unwrap();

    pub static ref PENDING_DELETE_REQUESTS: IntGauge = register_int_gauge!(
        "compactor_pending_delete_requests",
        "Delete request shards not yet processed or cancelled"
    )
    .unwrap();

    pub static ref OLDEST_PENDING_DELETE_REQUEST_AGE_SECONDS: IntGauge = register_int_gauge!(
        "compactor_oldest_pending_delete_request_age_seconds",
        "Age of the oldest unprocessed delete request"
    )
    .unwrap();
}
