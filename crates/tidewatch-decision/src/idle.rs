//! Per-queue idle markers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// Shared map of queue name → the instant it was first seen idle.
///
/// Cloning yields another handle to the same map. The decision engine
/// writes markers while evaluating a cycle; lifecycle operations clear
/// them concurrently, so every access goes through one mutex.
#[derive(Debug, Clone, Default)]
pub struct IdleTracker {
    entries: Arc<Mutex<HashMap<String, Instant>>>,
}

impl IdleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record each queue as idle at `now` unless it already has a marker.
    ///
    /// All queues are marked under one lock. Returns every queue paired
    /// with its marker's timestamp, which is the earliest sighting.
    pub fn mark_idle<'a, I>(&self, queues: I, now: Instant) -> Vec<(&'a str, Instant)>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut entries = self.lock();
        queues
            .into_iter()
            .map(|q| (q, *entries.entry(q.to_string()).or_insert(now)))
            .collect()
    }

    pub fn idle_since(&self, queue: &str) -> Option<Instant> {
        self.lock().get(queue).copied()
    }

    /// Remove the markers of the given queues; returns how many existed.
    pub fn clear<'a, I>(&self, queues: I) -> usize
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut entries = self.lock();
        queues
            .into_iter()
            .filter(|q| entries.remove(*q).is_some())
            .count()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
