//! Operation lifecycle tests.
//!
//! Drives `OperationManager` against in-memory collaborators and checks
//! that every claimed record is released: on normal completion, on a
//! forced timeout, on launch failure, and through the stuck sweep.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use tidewatch_clients::{
    Broker, BrokerError, ComputeLifecycle, LifecycleError, Notification, Notifier, NotifyError,
    Outcome,
};
use tidewatch_core::{OperationKind, QueueObservation, TimeoutConfig, Verdict, WorkloadMapping};
use tidewatch_ops::{
    Collaborators, DispatchResult, LaunchError, Launcher, ManagerConfig, OperationFuture,
    OperationManager,
};

// ── Fakes ──────────────────────────────────────────────────────

struct FakeBroker {
    queues: Mutex<Vec<QueueObservation>>,
    consumers: Mutex<HashMap<String, u32>>,
    connected: AtomicBool,
    reconnect_ok: AtomicBool,
}

impl FakeBroker {
    fn new(queues: &[(&str, u32, u32)]) -> Arc<Self> {
        let broker = Arc::new(Self {
            queues: Mutex::new(Vec::new()),
            consumers: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(true),
            reconnect_ok: AtomicBool::new(true),
        });
        broker.set_queues(queues);
        broker
    }

    fn set_queues(&self, queues: &[(&str, u32, u32)]) {
        *self.queues.lock().unwrap() = queues
            .iter()
            .map(|(name, pending, consumers)| QueueObservation::new(*name, *pending, *consumers))
            .collect();
    }
}

#[async_trait]
impl Broker for FakeBroker {
    async fn list_queues(&self) -> Result<Vec<QueueObservation>, BrokerError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BrokerError::NotConnected);
        }
        Ok(self.queues.lock().unwrap().clone())
    }

    async fn consumer_count(&self, queue: &str) -> Result<u32, BrokerError> {
        Ok(self.consumers.lock().unwrap().get(queue).copied().unwrap_or(1))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn reconnect(&self) -> Result<(), BrokerError> {
        if self.reconnect_ok.load(Ordering::SeqCst) {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        } else {
            Err(BrokerError::Request("connection refused".into()))
        }
    }
}

#[derive(Clone, Copy)]
enum Mode {
    Succeed,
    /// Block until cancelled, then report cancellation.
    WaitForCancel,
    /// Block forever and ignore the cancellation token.
    IgnoreCancel,
}

struct FakeLifecycle {
    mode: Mode,
    fail_for: Vec<String>,
    calls: AtomicUsize,
    saw_cancel: AtomicBool,
}

impl FakeLifecycle {
    fn new(mode: Mode) -> Arc<Self> {
        Self::failing_for(mode, &[])
    }

    fn failing_for(mode: Mode, workloads: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            mode,
            fail_for: workloads.iter().map(|w| w.to_string()).collect(),
            calls: AtomicUsize::new(0),
            saw_cancel: AtomicBool::new(false),
        })
    }

    async fn call(&self, workload: &str, cancel: &CancellationToken) -> Result<(), LifecycleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_for.iter().any(|w| w == workload) {
            return Err(LifecycleError::Failed {
                program: "fake".into(),
                status: "exit status: 1".into(),
                stderr: "platform error".into(),
            });
        }
        match self.mode {
            Mode::Succeed => Ok(()),
            Mode::WaitForCancel => {
                cancel.cancelled().await;
                self.saw_cancel.store(true, Ordering::SeqCst);
                Err(LifecycleError::Cancelled)
            }
            Mode::IgnoreCancel => std::future::pending().await,
        }
    }
}

#[async_trait]
impl ComputeLifecycle for FakeLifecycle {
    async fn restart(&self, workload: &str, cancel: &CancellationToken) -> Result<(), LifecycleError> {
        self.call(workload, cancel).await
    }

    async fn stop(&self, workload: &str, cancel: &CancellationToken) -> Result<(), LifecycleError> {
        self.call(workload, cancel).await
    }
}

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

/// Refuses every task, dropping it immediately.
struct RejectingLauncher;

#[async_trait]
impl Launcher for RejectingLauncher {
    fn launch(&self, _task: OperationFuture) -> Result<(), LaunchError> {
        Err(LaunchError::Rejected("out of capacity".into()))
    }

    fn close(&self) {}

    async fn wait(&self) {}

    fn active(&self) -> usize {
        0
    }
}

/// Accepts tasks but never polls them: a launched operation that hangs
/// before it can even start its timeout race.
#[derive(Default)]
struct HoardingLauncher {
    tasks: Mutex<Vec<OperationFuture>>,
}

#[async_trait]
impl Launcher for HoardingLauncher {
    fn launch(&self, task: OperationFuture) -> Result<(), LaunchError> {
        self.tasks.lock().unwrap().push(task);
        Ok(())
    }

    fn close(&self) {}

    async fn wait(&self) {
        std::future::pending::<()>().await
    }

    fn active(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }
}

// ── Helpers ────────────────────────────────────────────────────

fn timeouts() -> TimeoutConfig {
    TimeoutConfig {
        idle: Duration::from_secs(600),
        restart_verification: Duration::from_secs(30),
        verification_poll: Duration::from_secs(5),
        stop_start_delay: Duration::from_secs(1),
        operation: Duration::from_secs(60),
        stuck_operation: Duration::from_secs(120),
        cancel_grace: Duration::from_secs(10),
        shutdown_grace: Duration::from_secs(30),
    }
}

fn manager(
    broker: Arc<FakeBroker>,
    lifecycle: Arc<FakeLifecycle>,
    notifier: Arc<RecordingNotifier>,
) -> OperationManager {
    let mapping = WorkloadMapping::new([("A", vec!["q1", "q2"]), ("B", vec!["q3"])]).unwrap();
    OperationManager::new(
        Arc::new(mapping),
        ManagerConfig {
            polling_interval: Duration::from_secs(30),
            timeouts: timeouts(),
            recipient: "ops".to_string(),
        },
        Collaborators {
            broker,
            lifecycle,
            notifier,
        },
    )
}

/// Let launched tasks run until the registry drains (or give up).
async fn settle(manager: &OperationManager) {
    for _ in 0..1000 {
        if manager.registry().is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

// ── Normal completion ──────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn stuck_queue_restart_completes_and_releases() {
    let broker = FakeBroker::new(&[("q1", 5, 0), ("q2", 0, 2)]);
    let lifecycle = FakeLifecycle::new(Mode::Succeed);
    let notifier = Arc::new(RecordingNotifier::default());
    let manager = manager(broker, lifecycle.clone(), notifier.clone());

    let report = manager.run_cycle().await;
    assert_eq!(report.verdicts["A"], Verdict::Restart);
    assert_eq!(report.dispatched["A"], DispatchResult::Launched);

    settle(&manager).await;
    assert!(manager.registry().is_empty());
    assert_eq!(lifecycle.calls.load(Ordering::SeqCst), 1);

    let sent = notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subject, "[tidewatch] Restart SUCCESS: A");
    assert_eq!(sent[0].recipient, "ops");
}

#[tokio::test(start_paused = true)]
async fn restart_without_consumers_warns() {
    let broker = FakeBroker::new(&[("q3", 4, 0)]);
    broker.consumers.lock().unwrap().insert("q3".to_string(), 0);
    let notifier = Arc::new(RecordingNotifier::default());
    let manager = manager(broker, FakeLifecycle::new(Mode::Succeed), notifier.clone());

    manager.run_cycle().await;
    tokio::time::sleep(Duration::from_secs(31)).await;
    settle(&manager).await;

    let sent = notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].outcome, Outcome::Warning);
    assert!(sent[0].body.contains("q3"));
    assert!(manager.registry().is_empty());
}

#[tokio::test(start_paused = true)]
async fn idle_workload_stops_after_timeout() {
    let broker = FakeBroker::new(&[("q1", 0, 2), ("q2", 0, 3)]);
    let notifier = Arc::new(RecordingNotifier::default());
    let manager = manager(broker, FakeLifecycle::new(Mode::Succeed), notifier.clone());

    let first = manager.run_cycle().await;
    assert_eq!(first.verdicts["A"], Verdict::NoAction);
    assert!(first.dispatched.is_empty());

    tokio::time::advance(Duration::from_secs(600)).await;
    let second = manager.run_cycle().await;
    assert_eq!(second.verdicts["A"], Verdict::Stop);
    assert_eq!(second.dispatched["A"], DispatchResult::Launched);

    settle(&manager).await;
    assert_eq!(notifier.sent()[0].subject, "[tidewatch] Stop SUCCESS: A");
    assert!(manager.engine().idle_tracker().is_empty());
}

#[tokio::test(start_paused = true)]
async fn in_flight_workload_is_skipped() {
    let broker = FakeBroker::new(&[("q3", 2, 0)]);
    let lifecycle = FakeLifecycle::new(Mode::WaitForCancel);
    let manager = manager(broker, lifecycle.clone(), Arc::new(RecordingNotifier::default()));

    assert_eq!(manager.run_cycle().await.dispatched["B"], DispatchResult::Launched);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(manager.run_cycle().await.dispatched["B"], DispatchResult::AlreadyInFlight);

    assert_eq!(lifecycle.calls.load(Ordering::SeqCst), 1);
    assert_eq!(manager.in_flight().len(), 1);
    assert_eq!(manager.in_flight()[0].kind, OperationKind::Restart);
}

#[tokio::test(start_paused = true)]
async fn failure_in_one_workload_does_not_block_others() {
    let broker = FakeBroker::new(&[("q1", 5, 0), ("q3", 5, 0)]);
    let lifecycle = FakeLifecycle::failing_for(Mode::Succeed, &["A"]);
    let notifier = Arc::new(RecordingNotifier::default());
    let manager = manager(broker, lifecycle, notifier.clone());

    let report = manager.run_cycle().await;
    assert_eq!(report.dispatched["A"], DispatchResult::Launched);
    assert_eq!(report.dispatched["B"], DispatchResult::Launched);

    settle(&manager).await;
    let mut subjects: Vec<String> = notifier.sent().into_iter().map(|n| n.subject).collect();
    subjects.sort();
    assert_eq!(
        subjects,
        [
            "[tidewatch] Restart FAILURE: A",
            "[tidewatch] Restart SUCCESS: B"
        ]
    );
}

// ── Timeout enforcement ────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn timeout_cancels_cooperative_operation() {
    let broker = FakeBroker::new(&[("q3", 2, 0)]);
    let lifecycle = FakeLifecycle::new(Mode::WaitForCancel);
    let notifier = Arc::new(RecordingNotifier::default());
    let manager = manager(broker, lifecycle.clone(), notifier.clone());

    manager.run_cycle().await;
    tokio::time::sleep(Duration::from_secs(59)).await;
    assert!(manager.registry().is_claimed("B"));

    tokio::time::sleep(Duration::from_secs(2)).await;
    settle(&manager).await;

    assert!(manager.registry().is_empty());
    assert!(lifecycle.saw_cancel.load(Ordering::SeqCst));
    let sent = notifier.sent();
    assert_eq!(sent[0].subject, "[tidewatch] Restart FAILURE: B");
    assert!(sent[0].body.contains("timed out"));
}

#[tokio::test(start_paused = true)]
async fn uncooperative_operation_abandoned_after_grace() {
    let broker = FakeBroker::new(&[("q3", 2, 0)]);
    let notifier = Arc::new(RecordingNotifier::default());
    let manager = manager(broker, FakeLifecycle::new(Mode::IgnoreCancel), notifier.clone());

    manager.run_cycle().await;

    // Timed out at 60s, still inside the 10s cancellation grace.
    tokio::time::sleep(Duration::from_secs(65)).await;
    assert!(manager.registry().is_claimed("B"));

    tokio::time::sleep(Duration::from_secs(6)).await;
    settle(&manager).await;
    assert!(manager.registry().is_empty());
    assert_eq!(notifier.sent()[0].outcome, Outcome::Failure);
}

#[tokio::test(start_paused = true)]
async fn claim_held_through_cancel_grace_blocks_relaunch() {
    let broker = FakeBroker::new(&[("q3", 2, 0)]);
    let lifecycle = FakeLifecycle::new(Mode::IgnoreCancel);
    let manager = manager(broker, lifecycle.clone(), Arc::new(RecordingNotifier::default()));

    manager.run_cycle().await;

    // Timed out at 60s and still draining; the sweep must leave it alone.
    tokio::time::sleep(Duration::from_secs(65)).await;
    let report = manager.run_cycle().await;
    assert!(report.swept.is_empty());
    assert_eq!(report.dispatched["B"], DispatchResult::AlreadyInFlight);
    assert_eq!(lifecycle.calls.load(Ordering::SeqCst), 1);
}

// ── Launch failure and stuck sweep ─────────────────────────────

#[tokio::test]
async fn launch_failure_releases_claim_immediately() {
    let broker = FakeBroker::new(&[("q1", 5, 0)]);
    let lifecycle = FakeLifecycle::new(Mode::Succeed);
    let manager = manager(broker, lifecycle.clone(), Arc::new(RecordingNotifier::default()))
        .with_launcher(Arc::new(RejectingLauncher));

    let report = manager.run_cycle().await;
    assert_eq!(report.dispatched["A"], DispatchResult::LaunchFailed);
    assert!(manager.registry().is_empty());

    // Nothing lingers, so the next cycle tries again rather than skipping.
    let report = manager.run_cycle().await;
    assert_eq!(report.dispatched["A"], DispatchResult::LaunchFailed);
    assert_eq!(lifecycle.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn stuck_record_is_swept_and_workload_reclaimed() {
    let broker = FakeBroker::new(&[("q1", 5, 0)]);
    let launcher = Arc::new(HoardingLauncher::default());
    let manager = manager(broker, FakeLifecycle::new(Mode::Succeed), Arc::new(RecordingNotifier::default()))
        .with_launcher(launcher.clone());

    assert_eq!(manager.run_cycle().await.dispatched["A"], DispatchResult::Launched);
    let first_id = manager.in_flight()[0].id;

    // Below the stuck threshold: left alone.
    tokio::time::advance(Duration::from_secs(100)).await;
    let report = manager.run_cycle().await;
    assert!(report.swept.is_empty());
    assert_eq!(report.dispatched["A"], DispatchResult::AlreadyInFlight);

    tokio::time::advance(Duration::from_secs(30)).await;
    let report = manager.run_cycle().await;
    assert_eq!(report.swept.len(), 1);
    assert_eq!(report.swept[0].workload_id, "A");
    assert_eq!(report.dispatched["A"], DispatchResult::Launched);

    let second_id = manager.in_flight()[0].id;
    assert_ne!(first_id, second_id);

    // Dropping the hoarded tasks runs their guards; the newer claim
    // belongs to someone else and must survive the first one.
    let mut tasks = launcher.tasks.lock().unwrap();
    let first = tasks.remove(0);
    drop(first);
    assert_eq!(manager.in_flight()[0].id, second_id);
    tasks.clear();
    drop(tasks);
    assert!(manager.registry().is_empty());
}

// ── Broker failures ────────────────────────────────────────────

#[tokio::test]
async fn broker_outage_skips_cycle_until_reconnected() {
    let broker = FakeBroker::new(&[("q1", 5, 0)]);
    broker.connected.store(false, Ordering::SeqCst);
    broker.reconnect_ok.store(false, Ordering::SeqCst);
    let lifecycle = FakeLifecycle::new(Mode::Succeed);
    let manager = manager(broker.clone(), lifecycle, Arc::new(RecordingNotifier::default()));

    let report = manager.run_cycle().await;
    assert!(report.broker_error.is_some());
    assert!(report.verdicts.is_empty());

    broker.reconnect_ok.store(true, Ordering::SeqCst);
    let report = manager.run_cycle().await;
    assert!(report.broker_error.is_none());
    assert_eq!(report.dispatched["A"], DispatchResult::Launched);
}

// ── Concurrency and shutdown ───────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_dispatch_launches_once() {
    let broker = FakeBroker::new(&[]);
    let lifecycle = FakeLifecycle::new(Mode::WaitForCancel);
    let manager = Arc::new(manager(broker, lifecycle.clone(), Arc::new(RecordingNotifier::default())));

    let mut handles = Vec::new();
    for _ in 0..32 {
        let manager = Arc::clone(&manager);
        handles.push(tokio::spawn(async move {
            manager.dispatch("A", OperationKind::Restart)
        }));
    }

    let mut launched = 0;
    for handle in handles {
        match handle.await.unwrap() {
            DispatchResult::Launched => launched += 1,
            DispatchResult::AlreadyInFlight => {}
            DispatchResult::LaunchFailed => panic!("unexpected launch failure"),
        }
    }

    assert_eq!(launched, 1);
    assert_eq!(manager.registry().len(), 1);

    manager.shutdown().await;
    assert!(manager.registry().is_empty());
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_in_flight_operations() {
    let broker = FakeBroker::new(&[("q1", 5, 0), ("q3", 1, 0)]);
    let notifier = Arc::new(RecordingNotifier::default());
    let manager = manager(broker, FakeLifecycle::new(Mode::WaitForCancel), notifier.clone());

    manager.run_cycle().await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(manager.registry().len(), 2);

    manager.shutdown().await;
    assert!(manager.registry().is_empty());
    assert!(
        notifier
            .sent()
            .iter()
            .all(|n| n.outcome == Outcome::Failure && n.body.contains("cancelled"))
    );

    // No new operations once shut down.
    assert_eq!(manager.dispatch("A", OperationKind::Stop), DispatchResult::LaunchFailed);
    assert!(manager.registry().is_empty());
}

#[tokio::test(start_paused = true)]
async fn shutdown_gives_up_after_grace_period() {
    let broker = FakeBroker::new(&[("q3", 1, 0)]);
    let manager = manager(broker, FakeLifecycle::new(Mode::IgnoreCancel), Arc::new(RecordingNotifier::default()));

    manager.run_cycle().await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let started = tokio::time::Instant::now();
    manager.shutdown().await;
    let waited = started.elapsed();

    assert!(waited >= Duration::from_secs(30));
    assert!(waited < Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn run_loop_stops_on_shutdown_signal() {
    let broker = FakeBroker::new(&[("q1", 0, 1)]);
    let manager = Arc::new(manager(broker, FakeLifecycle::new(Mode::Succeed), Arc::new(RecordingNotifier::default())));
    let (tx, rx) = tokio::sync::watch::channel(false);

    let runner = Arc::clone(&manager);
    let handle = tokio::spawn(async move { runner.run(rx).await });

    tokio::time::sleep(Duration::from_secs(95)).await;
    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(60), handle)
        .await
        .unwrap()
        .unwrap();

    // Cycles ran and marked q1 idle.
    assert!(manager.engine().idle_tracker().idle_since("q1").is_some());
}
