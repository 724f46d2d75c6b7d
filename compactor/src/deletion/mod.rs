// Copyright 2023 Timberline Project Authors. Licensed under Apache-2.0.

//! User submitted delete requests.

pub mod manager;
pub mod store;

use std::time::Duration;

use common_util::time::{TimeRange, Timestamp};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::labels::Matcher;

/// Lifecycle of a delete request. Transitions only move forward, with the
/// single exception that an unprocessed request can be cancelled.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteRequestStatus {
    Received,
    BuildingPlan,
    Processing,
    Processed,
    Cancelled,
}

impl DeleteRequestStatus {
    fn rank(&self) -> u8 {
        match self {
            Self::Received => 0,
            Self::BuildingPlan => 1,
            Self::Processing => 2,
            Self::Processed => 3,
            Self::Cancelled => 4,
        }
    }

    /// Whether moving from `self` to `to` is a legal transition.
    pub fn can_transition(&self, to: DeleteRequestStatus) -> bool {
        match (self, to) {
            (Self::Received, Self::Cancelled) | (Self::BuildingPlan, Self::Cancelled) => true,
            (_, Self::Cancelled) => false,
            (from, to) => to.rank() == from.rank() + 1,
        }
    }

    /// Terminal states need no further processing.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Processed | Self::Cancelled)
    }
}

/// One shard of a user delete request. Requests wider than the configured
/// max interval are sharded on ingest; shards share `request_id` and are
/// processed independently.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub request_id: String,
    pub seq_num: u32,
    pub tenant: String,
    pub matchers: Vec<Matcher>,
    pub line_filters: Vec<String>,
    pub range: TimeRange,
    pub created_at: Timestamp,
    pub status: DeleteRequestStatus,
}

impl DeleteRequest {
    /// Key of this shard in the requests store.
    pub fn store_key(&self) -> String {
        format!("{}/{}/{:06}", self.tenant, self.request_id, self.seq_num)
    }

    /// Whether the shard's hold window has elapsed and it may be processed.
    pub fn is_past_cancel_period(&self, cancel_period: Duration, now: Timestamp) -> bool {
        self.created_at.add_duration_or_max(cancel_period) <= now
    }
}

/// Shard a new delete request into contiguous sub-requests no wider than
/// `max_interval`, all sharing one freshly generated request id.
pub fn shard_delete_request(
    tenant: &str,
    matchers: Vec<Matcher>,
    line_filters: Vec<String>,
    range: TimeRange,
    max_interval: Duration,
    created_at: Timestamp,
) -> Vec<DeleteRequest> {
    let request_id = Uuid::new_v4().to_string();
    let max_ms = (max_interval.as_millis() as i64).max(1);

    let mut shards = Vec::new();
    let mut start = range.start();
    let mut seq_num = 0u32;
    while start < range.end() {
        let end = range.end().min(Timestamp::new(
            start.as_i64().saturating_add(max_ms),
        ));
        shards.push(DeleteRequest {
            request_id: request_id.clone(),
            seq_num,
            tenant: tenant.to_string(),
            matchers: matchers.clone(),
            line_filters: line_filters.clone(),
            range: TimeRange::new_unchecked(start, end),
            created_at,
            status: DeleteRequestStatus::Received,
        });
        start = end;
        seq_num += 1;
    }

    // A degenerate empty range still yields one (empty) shard so the request
    // is visible and cancellable.
    if shards.is_empty() {
        shards.push(DeleteRequest {
            request_id,
            seq_num: 0,
            tenant: tenant.to_string(),
            matchers,
            line_filters,
            range,
            created_at,
            status: DeleteRequestStatus::Received,
        });
    }

    shards
}

/// Status shown to users for a sharded request: the least progressed shard
/// wins, and one cancelled shard cancels the whole request.
pub fn aggregate_status(shards: &[DeleteRequest]) -> Option<DeleteRequestStatus> {
    if shards.is_empty() {
        return None;
    }
    if shards
        .iter()
        .any(|s| s.status == DeleteRequestStatus::Cancelled)
    {
        return Some(DeleteRequestStatus::Cancelled);
    }
    shards.iter().map(|s| s.status).min_by_key(|s| s.rank())
}
