//! Decision engine: evaluates each workload's queues once per cycle.
//!
//! The engine groups the cycle's observations by owning workload and
//! applies the ordered rules described in the crate docs. It never
//! performs side effects beyond maintaining idle markers.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use tidewatch_core::{QueueObservation, Verdict, WorkloadMapping};

use crate::idle::IdleTracker;

/// Produces one verdict per observed workload each polling cycle.
pub struct DecisionEngine {
    mapping: Arc<WorkloadMapping>,
    idle_timeout: Duration,
    idle: IdleTracker,
}

impl DecisionEngine {
    pub fn new(mapping: Arc<WorkloadMapping>, idle_timeout: Duration) -> Self {
        Self::with_tracker(mapping, idle_timeout, IdleTracker::new())
    }

    /// Build an engine around an existing idle tracker.
    pub fn with_tracker(
        mapping: Arc<WorkloadMapping>,
        idle_timeout: Duration,
        idle: IdleTracker,
    ) -> Self {
        Self {
            mapping,
            idle_timeout,
            idle,
        }
    }

    /// Handle to the idle markers, for clearing at operation start.
    pub fn idle_tracker(&self) -> IdleTracker {
        self.idle.clone()
    }

    pub fn mapping(&self) -> &Arc<WorkloadMapping> {
        &self.mapping
    }

    /// Decide every workload using the current instant.
    pub fn decide(&self, observations: &[QueueObservation]) -> BTreeMap<String, Verdict> {
        self.decide_at(observations, Instant::now())
    }

    /// Decide every workload as of `now`.
    ///
    /// Observations of unmapped queues are ignored. Workloads with no
    /// owned queue among the observations are absent from the result.
    pub fn decide_at(
        &self,
        observations: &[QueueObservation],
        now: Instant,
    ) -> BTreeMap<String, Verdict> {
        let mut by_workload: HashMap<&str, Vec<&QueueObservation>> = HashMap::new();
        for obs in observations {
            match self.mapping.owner_of(&obs.name) {
                Some(workload) => by_workload.entry(workload).or_default().push(obs),
                None => trace!(queue = %obs.name, "ignoring unmapped queue"),
            }
        }

        let mut verdicts = BTreeMap::new();
        for (workload, queues) in self.mapping.workloads() {
            if queues.is_empty() {
                continue;
            }
            let Some(observed) = by_workload.get(workload) else {
                continue;
            };

            let verdict = self.evaluate(workload, observed, now);
            verdicts.insert(workload.to_string(), verdict);
        }

        verdicts
    }

    /// Apply the ordered rules to one workload's observed queues.
    pub fn evaluate(
        &self,
        workload: &str,
        observed: &[&QueueObservation],
        now: Instant,
    ) -> Verdict {
        // Never interrupt a queue that is being drained.
        if let Some(busy) = observed.iter().find(|q| q.is_draining()) {
            debug!(
                %workload,
                queue = %busy.name,
                pending = busy.pending_count,
                consumers = busy.consumer_count,
                "queue actively draining, leaving workload alone"
            );
            return Verdict::NoAction;
        }

        if let Some(stuck) = observed.iter().find(|q| q.is_stuck()) {
            debug!(
                %workload,
                queue = %stuck.name,
                pending = stuck.pending_count,
                "messages waiting with no consumer"
            );
            return Verdict::Restart;
        }

        // Every observed queue is empty from here on.
        let idle: Vec<&str> = observed
            .iter()
            .filter(|q| q.is_idle())
            .map(|q| q.name.as_str())
            .collect();
        let consumer_queues = idle.len();
        let mut all_expired = true;

        for (queue, since) in self.idle.mark_idle(idle, now) {
            let idle_for = now.saturating_duration_since(since);
            if idle_for < self.idle_timeout {
                all_expired = false;
                trace!(
                    %workload,
                    %queue,
                    idle_secs = idle_for.as_secs(),
                    timeout_secs = self.idle_timeout.as_secs(),
                    "queue idle, waiting for timeout"
                );
            }
        }

        if consumer_queues > 0 && all_expired {
            debug!(
                %workload,
                queues = consumer_queues,
                timeout_secs = self.idle_timeout.as_secs(),
                "all queues idle past timeout"
            );
            return Verdict::Stop;
        }

        Verdict::NoAction
    }
}
