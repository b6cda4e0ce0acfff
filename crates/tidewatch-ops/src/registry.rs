//! In-flight operation registry.
//!
//! Holds at most one [`OperationRecord`] per workload. Claiming is a
//! single check-and-insert under one mutex, so two cycles can never both
//! observe "absent" and both start an operation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tidewatch_core::OperationKind;

/// One lifecycle operation in flight.
#[derive(Debug)]
struct OperationRecord {
    id: u64,
    kind: OperationKind,
    started_at: Instant,
    cancel: CancellationToken,
}

/// Read-only view of an in-flight operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlight {
    pub workload_id: String,
    pub kind: OperationKind,
    pub id: u64,
    pub age: Duration,
}

#[derive(Debug, Default)]
struct Inner {
    records: Mutex<HashMap<String, OperationRecord>>,
    next_id: AtomicU64,
    /// Parent of every operation token; cancelled on shutdown.
    root: CancellationToken,
}

/// Concurrency-safe set of in-flight operations keyed by workload.
///
/// Cloning yields another handle to the same registry.
#[derive(Debug, Clone, Default)]
pub struct OperationRegistry {
    inner: Arc<Inner>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, OperationRecord>> {
        self.inner
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Atomically claim `workload_id` for a new operation.
    ///
    /// Returns `None` if an operation is already in flight for it. The
    /// returned guard releases the record when dropped.
    pub fn claim(&self, workload_id: &str, kind: OperationKind) -> Option<OperationClaim> {
        let mut records = self.records();
        if let Some(existing) = records.get(workload_id) {
            debug!(
                workload = %workload_id,
                in_flight = %existing.kind,
                requested = %kind,
                age_secs = existing.started_at.elapsed().as_secs(),
                "operation already in flight"
            );
            return None;
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = self.inner.root.child_token();
        records.insert(
            workload_id.to_string(),
            OperationRecord {
                id,
                kind,
                started_at: Instant::now(),
                cancel: cancel.clone(),
            },
        );

        Some(OperationClaim {
            registry: self.clone(),
            workload_id: workload_id.to_string(),
            kind,
            id,
            cancel,
            released: false,
        })
    }

    /// Remove the record for `workload_id` if it is still generation `id`.
    ///
    /// Returns whether a record was removed.
    pub fn release(&self, workload_id: &str, id: u64) -> bool {
        let mut records = self.records();
        match records.get(workload_id) {
            Some(record) if record.id == id => {
                records.remove(workload_id);
                true
            }
            _ => false,
        }
    }

    /// Cancel and remove every record older than `threshold`.
    ///
    /// Returns the workloads whose records were swept.
    pub fn sweep_stuck(&self, threshold: Duration) -> Vec<InFlight> {
        let now = Instant::now();
        let mut records = self.records();

        let stuck: Vec<String> = records
            .iter()
            .filter(|(_, r)| now.saturating_duration_since(r.started_at) > threshold)
            .map(|(w, _)| w.clone())
            .collect();

        let mut swept = Vec::with_capacity(stuck.len());
        for workload_id in stuck {
            if let Some(record) = records.remove(&workload_id) {
                let age = now.saturating_duration_since(record.started_at);
                record.cancel.cancel();
                warn!(
                    workload = %workload_id,
                    operation = %record.kind,
                    age_secs = age.as_secs(),
                    threshold_secs = threshold.as_secs(),
                    "force-removed stuck operation"
                );
                swept.push(InFlight {
                    workload_id,
                    kind: record.kind,
                    id: record.id,
                    age,
                });
            }
        }

        swept
    }

    /// Signal cancellation to every operation, including swept ones.
    pub fn cancel_all(&self) {
        self.inner.root.cancel();
    }

    pub fn is_claimed(&self, workload_id: &str) -> bool {
        self.records().contains_key(workload_id)
    }

    pub fn in_flight(&self) -> Vec<InFlight> {
        let now = Instant::now();
        let mut list: Vec<InFlight> = self
            .records()
            .iter()
            .map(|(workload_id, r)| InFlight {
                workload_id: workload_id.clone(),
                kind: r.kind,
                id: r.id,
                age: now.saturating_duration_since(r.started_at),
            })
            .collect();
        list.sort_by(|a, b| a.workload_id.cmp(&b.workload_id));
        list
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }
}

/// Exclusive ownership of one workload's in-flight slot.
///
/// Dropping the claim releases the record, whatever path the owning
/// task exits through.
#[derive(Debug)]
pub struct OperationClaim {
    registry: OperationRegistry,
    workload_id: String,
    kind: OperationKind,
    id: u64,
    cancel: CancellationToken,
    released: bool,
}

impl OperationClaim {
    pub fn workload_id(&self) -> &str {
        &self.workload_id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Cooperative cancellation signal for this operation.
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Release now instead of on drop.
    pub fn release(mut self) -> bool {
        self.released = true;
        self.registry.release(&self.workload_id, self.id)
    }
}

impl Drop for OperationClaim {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if self.registry.release(&self.workload_id, self.id) {
            debug!(workload = %self.workload_id, operation = %self.kind, "operation released");
        } else {
            debug!(
                workload = %self.workload_id,
                operation = %self.kind,
                "operation record already removed"
            );
        }
    }
}
