//! Core domain types shared by all tidewatch crates.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// One queue's state as reported by the broker in a single poll cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueObservation {
    pub name: String,
    /// Messages waiting to be consumed.
    pub pending_count: u32,
    /// Consumers currently attached to the queue.
    pub consumer_count: u32,
    pub observed_at: SystemTime,
}

impl QueueObservation {
    pub fn new(name: impl Into<String>, pending_count: u32, consumer_count: u32) -> Self {
        Self {
            name: name.into(),
            pending_count,
            consumer_count,
            observed_at: SystemTime::now(),
        }
    }

    /// Messages are waiting and something is draining them.
    pub fn is_draining(&self) -> bool {
        self.pending_count > 0 && self.consumer_count > 0
    }

    /// Messages are waiting and nothing is consuming them.
    pub fn is_stuck(&self) -> bool {
        self.pending_count > 0 && self.consumer_count == 0
    }

    /// Empty queue with at least one consumer attached.
    pub fn is_idle(&self) -> bool {
        self.pending_count == 0 && self.consumer_count > 0
    }
}

/// Per-cycle outcome of the decision engine for one workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    /// Leave the workload alone this cycle.
    NoAction,
    /// Messages are stuck with no consumer: restart the workload.
    Restart,
    /// Every queue has sat idle past the timeout: stop the workload.
    Stop,
}

impl Verdict {
    /// The lifecycle operation this verdict asks for, if any.
    pub fn operation(self) -> Option<OperationKind> {
        match self {
            Verdict::NoAction => None,
            Verdict::Restart => Some(OperationKind::Restart),
            Verdict::Stop => Some(OperationKind::Stop),
        }
    }
}

/// A lifecycle operation that can be in flight for a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Restart,
    Stop,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Restart => f.write_str("Restart"),
            OperationKind::Stop => f.write_str("Stop"),
        }
    }
}

/// Static workload → queues mapping.
///
/// A workload may own many queues; a queue belongs to exactly one
/// workload. Built once at startup and never mutated afterwards.
#[derive(Debug, Clone, Default)]
pub struct WorkloadMapping {
    workloads: BTreeMap<String, Vec<String>>,
    owners: HashMap<String, String>,
}

impl WorkloadMapping {
    /// Build a mapping, rejecting queues that appear twice.
    ///
    /// Workloads with no queues are accepted; they simply never receive
    /// a verdict.
    pub fn new<I, W, Q>(entries: I) -> ConfigResult<Self>
    where
        I: IntoIterator<Item = (W, Vec<Q>)>,
        W: Into<String>,
        Q: Into<String>,
    {
        let mut workloads = BTreeMap::new();
        let mut owners: HashMap<String, String> = HashMap::new();

        for (workload, queues) in entries {
            let workload = workload.into();
            let mut owned: Vec<String> = Vec::with_capacity(queues.len());

            for queue in queues {
                let queue = queue.into();
                if owned.contains(&queue) {
                    return Err(ConfigError::DuplicateQueue { workload, queue });
                }
                if let Some(first) = owners.get(&queue) {
                    return Err(ConfigError::QueueOwnedTwice {
                        queue,
                        first: first.clone(),
                        second: workload,
                    });
                }
                owners.insert(queue.clone(), workload.clone());
                owned.push(queue);
            }

            workloads.insert(workload, owned);
        }

        Ok(Self { workloads, owners })
    }

    /// The workload that owns `queue`, if the queue is mapped.
    pub fn owner_of(&self, queue: &str) -> Option<&str> {
        self.owners.get(queue).map(String::as_str)
    }

    /// Queues owned by `workload`, in configuration order.
    pub fn queues_of(&self, workload: &str) -> &[String] {
        self.workloads
            .get(workload)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn workloads(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.workloads
            .iter()
            .map(|(w, q)| (w.as_str(), q.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.workloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workloads.is_empty()
    }
}
