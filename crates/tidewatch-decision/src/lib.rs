//! tidewatch-decision: turns queue observations into per-workload verdicts.
//!
//! # Rules
//!
//! Evaluated per workload over the queues it owns; the first rule that
//! matches wins:
//!
//! ```text
//! any queue pending > 0 && consumers > 0   → NoAction   (protect active work)
//! any queue pending > 0 && consumers == 0  → Restart    (stuck)
//! all queues pending == 0:
//!     mark every consumer-bearing queue idle (first sighting wins)
//!     every such queue idle ≥ idle_timeout → Stop
//! otherwise                                → NoAction
//! ```
//!
//! Idle markers live in an [`IdleTracker`] shared with the operation
//! manager, which clears a workload's markers when an operation starts.
//! A marker is not cleared when its queue becomes busy again.

pub mod engine;
pub mod idle;

pub use engine::DecisionEngine;
pub use idle::IdleTracker;
