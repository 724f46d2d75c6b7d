// Copyright 2023 Timberline Project Authors. Licensed under Apache-2.0.

//! Index compactor and retention engine.
//!
//! Ingesters write many small index fragments into object storage, one daily
//! table per schema period. This crate folds those fragments into a single
//! compacted index per table, applies per-tenant and per-stream retention by
//! marking expired chunks for deferred deletion, and drives user submitted
//! delete requests through their lifecycle.
//!
//! How a compaction pass works:
//! 1. Find the index type of a table from its name via the schema config.
//! 2. Look up the registered [index::IndexCompactor] for that index type.
//! 3. Build a table compactor and merge every fragment of the table into a
//!    per-tenant [index::CompactedIndex].
//! 4. If retention applies, walk the compacted index with the expiration
//!    checker and append every expired chunk to the marker store.
//! 5. Upload the compacted indexes, and only then delete the old fragments.
//!
//! Only one replica runs the pass at a time: replicas register in a hash ring
//! and the owner of a fixed sentinel key acts as the leader.

pub mod config;
pub mod deletion;
pub mod index;
pub mod labels;
pub mod limits;
mod metrics;
pub mod retention;
pub mod ring;
pub mod schema;
pub mod scheduler;
pub mod service;
pub mod storage;
mod table;

pub use crate::{
    config::Config,
    service::{Compactor, CompositeExpirationChecker},
};
