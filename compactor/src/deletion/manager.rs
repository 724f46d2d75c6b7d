// Copyright 2023 Timberline Project Authors. Licensed under Apache-2.0.

//! Delete requests manager: batches requests into retention cycles.
//!
//! At the start of every retention cycle the manager picks up to the batch
//! size of shards whose hold window elapsed, compiles their matchers into
//! plans and exposes them per tenant; the deletion expiration checker
//! consults exactly this batch for the whole cycle. Requests move to
//! processed only when the cycle finishes cleanly, so a failed or timed out
//! cycle simply retries the same batch.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use common_util::time::{ClockRef, TimeRange, Timestamp};
use log::{info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    deletion::{store::DeleteRequestsStore, DeleteRequest, DeleteRequestStatus},
    labels::{CompiledMatcher, Labels},
    metrics,
    retention::{ChunkEntry, ExpirationChecker, ExpiredVerdict},
};

/// Cadence of the reconcile loop updating delete request metrics.
pub const RECONCILE_PERIOD: Duration = Duration::from_secs(5 * 60);

/// One shard of the active batch with its materialized plan.
struct ActiveRequest {
    request: DeleteRequest,
    plan: Vec<CompiledMatcher>,
}

impl ActiveRequest {
    fn matches(&self, labels: &Labels, range: &TimeRange) -> bool {
        self.request.range.overlaps(range) && self.plan.iter().all(|m| m.matches(labels))
    }

    fn matches_labels(&self, labels: &Labels) -> bool {
        self.plan.iter().all(|m| m.matches(labels))
    }
}

/// Drives the delete request lifecycle and doubles as the deletion side of
/// the expiration checker.
pub struct DeleteRequestsManager {
    store: Arc<DeleteRequestsStore>,
    cancel_period: Duration,
    batch_size: usize,
    clock: ClockRef,
    /// The batch of the running retention cycle, grouped by tenant.
    batch: Mutex<HashMap<String, Vec<ActiveRequest>>>,
}

impl DeleteRequestsManager {
    pub fn new(
        store: Arc<DeleteRequestsStore>,
        cancel_period: Duration,
        batch_size: usize,
        clock: ClockRef,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            cancel_period,
            batch_size,
            clock,
            batch: Mutex::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> &Arc<DeleteRequestsStore> {
        &self.store
    }

    /// Periodically refresh delete request metrics.
    pub fn spawn_reconcile_loop(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(RECONCILE_PERIOD) => manager.reconcile(),
                }
            }
        })
    }

    fn reconcile(&self) {
        let requests = match self.store.get_all_requests() {
            Ok(requests) => requests,
            Err(e) => {
                warn!("Failed to read delete requests for reconcile, err:{}", e);
                return;
            }
        };

        let now = self.clock.now();
        let pending: Vec<_> = requests
            .iter()
            .filter(|r| !r.status.is_terminal())
            .collect();
        let oldest_age_secs = pending
            .iter()
            .map(|r| now.millis_since(r.created_at) / 1_000)
            .max()
            .unwrap_or(0);

        metrics::PENDING_DELETE_REQUESTS.set(pending.len() as i64);
        metrics::OLDEST_PENDING_DELETE_REQUEST_AGE_SECONDS.set(oldest_age_secs as i64);
    }

    /// Select the batch for this cycle, advancing picked shards through
    /// `building_plan` into `processing`.
    fn build_batch(&self) -> HashMap<String, Vec<ActiveRequest>> {
        let mut requests = match self.store.get_all_requests() {
            Ok(requests) => requests,
            Err(e) => {
                warn!("Failed to load delete requests, skipping this cycle, err:{}", e);
                return HashMap::new();
            }
        };

        let now = self.clock.now();
        requests.retain(|r| {
            !r.status.is_terminal() && r.is_past_cancel_period(self.cancel_period, now)
        });
        // Oldest first, stable across shards of one request.
        requests.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.store_key().cmp(&b.store_key()))
        });
        requests.truncate(self.batch_size);

        let mut batch: HashMap<String, Vec<ActiveRequest>> = HashMap::new();
        for request in requests {
            let request = match self.advance_to_processing(request) {
                Some(request) => request,
                None => continue,
            };

            let plan = match crate::labels::compile_all(&request.matchers) {
                Ok(plan) => plan,
                Err(e) => {
                    warn!(
                        "Skipping delete request with invalid matchers, request_id:{}, err:{}",
                        request.request_id, e
                    );
                    continue;
                }
            };

            batch
                .entry(request.tenant.clone())
                .or_default()
                .push(ActiveRequest { request, plan });
        }

        batch
    }

    fn advance_to_processing(&self, request: DeleteRequest) -> Option<DeleteRequest> {
        let mut request = request;
        if request.status == DeleteRequestStatus::Received {
            request = match self
                .store
                .update_status(&request, DeleteRequestStatus::BuildingPlan)
            {
                Ok(request) => request,
                Err(e) => {
                    warn!(
                        "Failed to move delete request to building_plan, request_id:{}, err:{}",
                        request.request_id, e
                    );
                    return None;
                }
            };
        }
        if request.status == DeleteRequestStatus::BuildingPlan {
            request = match self
                .store
                .update_status(&request, DeleteRequestStatus::Processing)
            {
                Ok(request) => request,
                Err(e) => {
                    warn!(
                        "Failed to move delete request to processing, request_id:{}, err:{}",
                        request.request_id, e
                    );
                    return None;
                }
            };
        }

        (request.status == DeleteRequestStatus::Processing).then_some(request)
    }

    fn take_batch(&self) -> HashMap<String, Vec<ActiveRequest>> {
        std::mem::take(&mut *self.batch.lock().unwrap())
    }
}

impl ExpirationChecker for DeleteRequestsManager {
    fn expired(
        &self,
        tenant: &str,
        chunk: &ChunkEntry,
        labels: &Labels,
        _series_id: &[u8],
        _table_name: &str,
        _now: Timestamp,
    ) -> ExpiredVerdict {
        let chunk_range = chunk.time_range();
        let batch = self.batch.lock().unwrap();
        let Some(requests) = batch.get(tenant) else {
            return (false, Vec::new());
        };

        let covering: Vec<TimeRange> = requests
            .iter()
            .filter(|r| r.matches(labels, &chunk_range))
            .map(|r| r.request.range)
            .collect();
        if covering.is_empty() {
            return (false, Vec::new());
        }

        (true, chunk_range.subtract_all(&covering))
    }

    fn interval_may_have_expired_chunks(&self, interval: TimeRange, tenant: Option<&str>) -> bool {
        let batch = self.batch.lock().unwrap();
        match tenant {
            Some(tenant) => batch
                .get(tenant)
                .map(|requests| {
                    requests
                        .iter()
                        .any(|r| r.request.range.overlaps(&interval))
                })
                .unwrap_or(false),
            None => batch
                .values()
                .flatten()
                .any(|r| r.request.range.overlaps(&interval)),
        }
    }

    fn can_skip_series(
        &self,
        tenant: &str,
        labels: &Labels,
        _series_id: &[u8],
        _series_start: Timestamp,
        _table_name: &str,
        _now: Timestamp,
    ) -> bool {
        let batch = self.batch.lock().unwrap();
        match batch.get(tenant) {
            Some(requests) => !requests.iter().any(|r| r.matches_labels(labels)),
            None => true,
        }
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

    fn mark_phase_started(&self) {
        let batch = self.build_batch();
        let shards: usize = batch.values().map(|v| v.len()).sum();
        if shards > 0 {
            info!(
                "Delete batch assembled, tenants:{}, shards:{}",
                batch.len(),
                shards
            );
        }
        *self.batch.lock().unwrap() = batch;
    }

    fn mark_phase_finished(&self) {
        let batch = self.take_batch();
        for active in batch.into_values().flatten() {
            match self
                .store
                .update_status(&active.request, DeleteRequestStatus::Processed)
            {
                Ok(_) => {
                    metrics::DELETE_REQUESTS_PROCESSED_TOTAL.inc();
                    info!(
                        "Delete request shard processed, tenant:{}, request_id:{}, seq:{}",
                        active.request.tenant, active.request.request_id, active.request.seq_num
                    );
                }
                Err(e) => warn!(
                    "Failed to mark delete request processed, request_id:{}, err:{}",
                    active.request.request_id, e
                ),
            }
        }
        self.reconcile();
    }

    fn mark_phase_failed(&self) {
        let dropped: usize = self.take_batch().values().map(|v| v.len()).sum();
        if dropped > 0 {
            warn!(
                "Retention cycle failed, delete batch will be retried, shards:{}",
                dropped
            );
        }
    }

    fn mark_phase_timed_out(&self) {
        let dropped: usize = self.take_batch().values().map(|v| v.len()).sum();
        if dropped > 0 {
            warn!(
                "Retention cycle timed out, delete batch will be retried, shards:{}",
                dropped
            );
        }
    }
}
