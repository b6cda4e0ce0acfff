//! tidewatch-ops: the operation lifecycle manager.
//!
//! Drives the polling loop and turns verdicts into tracked background
//! operations.
//!
//! # Architecture
//!
//! ```text
//! OperationManager (one cycle per polling interval)
//!   ├── OperationRegistry::sweep_stuck()   force-remove leaked records
//!   ├── Broker::list_queues()              observations
//!   ├── DecisionEngine::decide()           verdict per workload
//!   └── per Restart/Stop verdict:
//!       ├── OperationRegistry::claim()     atomic check-and-insert
//!       └── Launcher::launch(run_operation)
//!             ├── execute() raced against the operation timeout
//!             ├── Notifier::notify()
//!             └── OperationClaim dropped   → record released
//! ```
//!
//! # Cleanup
//!
//! A record is removed by whichever of these runs first, and only once:
//! the claim guard dropped when the operation task ends (normally or
//! after a timeout-triggered cancellation), the explicit release after a
//! rejected launch, or the per-cycle sweep of records older than the
//! stuck threshold. Removal is keyed by the record's generation id, so a
//! late release never removes a newer claim for the same workload.

pub mod action;
pub mod error;
pub mod launcher;
pub mod manager;
pub mod registry;

pub use action::{OperationContext, OperationOutcome};
pub use error::LaunchError;
pub use launcher::{Launcher, OperationFuture, TrackedLauncher};
pub use manager::{Collaborators, CycleReport, DispatchResult, ManagerConfig, OperationManager};
pub use registry::{InFlight, OperationClaim, OperationRegistry};
