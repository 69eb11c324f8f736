//! Device controller state machine.
//!
//! A [`DeviceController`] serializes every request touching one hardware
//! device. Its public operations are thin sugar over [`StateQueue::put`]:
//! each carries a declared [`StatePolicy`] (priority band, allowed modes,
//! queue-indefinitely and delete-stale flags), and a dedicated execution loop
//! pops them one at a time via the mode-gated queue, delegating blocking
//! sub-steps to the controller's workers as plain sequential round trips.
//!
//! Observable state discipline: the loop is the only writer of this
//! controller's front-panel entries in the [`SharedState`] store, and all
//! cross-controller mutation funnels through that store's single lock, so no
//! two operations belonging to one controller ever mutate its observable
//! state concurrently.
//!
//! Failure containment: a worker-reported failure leaves the controller
//! usable (the error is surfaced in [`ControllerStatus`]); a protocol
//! double-timeout is fatal for this controller only. A fatal controller stops
//! processing operations entirely and must be replaced by a fresh
//! controller/worker pair.

use crate::config::WorkerSettings;
use crate::error::{AppResult, EngineError};
use crate::mode::{Mode, ModeSet};
use crate::queue::{QueueConsumer, StatePolicy, StateQueue};
use crate::worker::{WorkerHandle, WorkerMethods};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Priority bands for queued operations. Lower values execute first.
pub mod priority {
    /// The quit sentinel outranks everything else in the queue.
    pub const QUIT: i8 = -1;
    /// Worker bootstrap; guaranteed to run before any user-initiated
    /// operation regardless of what else is queued at construction time.
    pub const BOOTSTRAP: i8 = 0;
    /// Pipeline-driven lifecycle transitions.
    pub const TRANSITION: i8 = 5;
    /// Front-panel value programming.
    pub const MANUAL: i8 = 10;
}

/// Shared store of externally observable front-panel state.
///
/// One instance is shared by every controller; its single lock is the global
/// critical section through which all observable-state mutation passes.
#[derive(Clone, Default)]
pub struct SharedState {
    values: Arc<Mutex<HashMap<String, Value>>>,
}

impl SharedState {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets one observable value.
    pub async fn set(&self, key: impl Into<String>, value: Value) {
        self.values.lock().await.insert(key.into(), value);
    }

    /// Reads one observable value.
    pub async fn get(&self, key: &str) -> Option<Value> {
        self.values.lock().await.get(key).cloned()
    }

    /// Copies the full store contents.
    pub async fn snapshot(&self) -> HashMap<String, Value> {
        self.values.lock().await.clone()
    }
}

/// Published state of one controller.
#[derive(Clone, Debug)]
pub struct ControllerStatus {
    /// Current lifecycle mode.
    pub mode: Mode,
    /// Last surfaced error message, if any.
    pub error: Option<String>,
    /// Terminal flag: the execution loop has stopped on an unrecoverable
    /// error and no further operations will be processed.
    pub fatal: bool,
    /// Set once `shutdown_workers` has finished or abandoned every worker.
    pub shutdown_complete: bool,
}

impl Default for ControllerStatus {
    fn default() -> Self {
        Self {
            mode: Mode::Manual,
            error: None,
            fatal: false,
            shutdown_complete: false,
        }
    }
}

/// Completion reports controllers post to the pipeline's shared channel.
#[derive(Clone, Debug)]
pub enum DeviceEvent {
    /// Outcome of a `transition_to_buffered` request.
    TransitionedToBuffered {
        /// Reporting device.
        device: String,
        /// Whether programming succeeded.
        success: bool,
        /// Failure detail when `success` is false.
        message: String,
    },
    /// Outcome of a `transition_to_manual` request.
    TransitionedToManual {
        /// Reporting device.
        device: String,
        /// Whether the return to manual succeeded.
        success: bool,
        /// Failure detail when `success` is false.
        message: String,
    },
    /// The timing master's run finished (or failed to).
    RunFinished {
        /// Reporting device.
        device: String,
        /// Whether the run completed.
        success: bool,
        /// Failure detail when `success` is false.
        message: String,
    },
    /// An error surfaced outside any pipeline-requested transition.
    ErrorState {
        /// Reporting device.
        device: String,
        /// The error detail.
        message: String,
    },
}

impl DeviceEvent {
    /// Name of the device that produced the event.
    pub fn device(&self) -> &str {
        match self {
            DeviceEvent::TransitionedToBuffered { device, .. }
            | DeviceEvent::TransitionedToManual { device, .. }
            | DeviceEvent::RunFinished { device, .. }
            | DeviceEvent::ErrorState { device, .. } => device,
        }
    }
}

/// Operations a controller's execution loop understands.
///
/// Constructed only by the enqueue sugar on [`DeviceController`]; the
/// delete-stale scan treats entries as "the same operation" when their
/// variants match.
pub enum Operation {
    /// Bootstrap: spawn a worker and run its `init` step.
    CreateWorker {
        /// Worker name, for logs and errors.
        name: String,
        /// The worker implementation to spawn.
        worker: Box<dyn WorkerMethods>,
        /// Instance data passed to the worker's `init` method.
        init_kwargs: Map<String, Value>,
    },
    /// Program the device for a buffered run of the given shot.
    TransitionToBuffered {
        /// Path identifying the shot.
        shot_path: PathBuf,
    },
    /// Abandon an in-progress transition to buffered mode.
    AbortTransitionToBuffered,
    /// Leave buffered mode without completing the cycle.
    AbortBuffered,
    /// Return to manual mode, applying final output values.
    TransitionToManual,
    /// Trigger the hardware-timed run (timing master only).
    StartRun,
    /// Program a single front-panel value.
    ManualSet {
        /// Front-panel channel name.
        name: String,
        /// Requested value.
        value: Value,
    },
    /// Best-effort shutdown of all workers.
    ShutdownWorkers,
    /// Stop the execution loop.
    Quit,
}

impl Operation {
    /// Stable name of the operation, for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Operation::CreateWorker { .. } => "create_worker",
            Operation::TransitionToBuffered { .. } => "transition_to_buffered",
            Operation::AbortTransitionToBuffered => "abort_transition_to_buffered",
            Operation::AbortBuffered => "abort_buffered",
            Operation::TransitionToManual => "transition_to_manual",
            Operation::StartRun => "start_run",
            Operation::ManualSet { .. } => "manual_set",
            Operation::ShutdownWorkers => "shutdown_workers",
            Operation::Quit => "quit",
        }
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// The contract the shot pipeline depends on: the five transition operations
/// plus mode and error queries. Implemented by [`DeviceController`];
/// test doubles implement it directly.
pub trait Device: Send + Sync {
    /// Device name.
    fn device_name(&self) -> &str;

    /// Current lifecycle mode.
    fn mode(&self) -> Mode;

    /// Pending error message, if the device is in an error state.
    fn error_state(&self) -> Option<String>;

    /// Requests programming for a buffered run of `shot_path`.
    fn transition_to_buffered(&self, shot_path: &Path);

    /// Requests abandonment of an in-progress buffered transition.
    fn abort_transition_to_buffered(&self);

    /// Requests an exit from buffered mode back to manual.
    fn abort_buffered(&self);

    /// Requests the normal return to manual mode.
    fn transition_to_manual(&self);

    /// Requests the hardware-timed run trigger.
    fn start_run(&self);
}

/// Handle to one device's state machine.
///
/// Cheap to share by reference; all methods enqueue and return immediately.
/// Progress is observed through [`DeviceController::status_watch`] and the
/// pipeline's shared [`DeviceEvent`] channel.
pub struct DeviceController {
    name: String,
    queue: Arc<StateQueue<Operation>>,
    status_rx: watch::Receiver<ControllerStatus>,
    join: JoinHandle<()>,
}

impl DeviceController {
    /// Spawns a controller with one initial worker.
    ///
    /// The worker bootstrap is enqueued at [`priority::BOOTSTRAP`], so it
    /// runs before any user-initiated operation regardless of construction
    /// order.
    pub fn spawn(
        name: impl Into<String>,
        worker: Box<dyn WorkerMethods>,
        shared: SharedState,
        event_tx: mpsc::Sender<DeviceEvent>,
        settings: WorkerSettings,
    ) -> AppResult<Self> {
        let name = name.into();
        let queue = StateQueue::new();
        let consumer = queue.take_consumer()?;
        let (status_tx, status_rx) = watch::channel(ControllerStatus::default());

        let looper = ControllerLoop {
            name: name.clone(),
            mode: Mode::Manual,
            workers: Vec::new(),
            status_tx,
            event_tx,
            shared,
            settings,
            error: None,
            shutdown_complete: false,
        };
        let join = tokio::spawn(looper.run(consumer));

        let controller = Self {
            name: name.clone(),
            queue,
            status_rx,
            join,
        };
        controller.create_worker(format!("{name}_main"), worker, Map::new());
        Ok(controller)
    }

    /// Current published status.
    pub fn status(&self) -> ControllerStatus {
        self.status_rx.borrow().clone()
    }

    /// A watch receiver over the controller's status.
    pub fn status_watch(&self) -> watch::Receiver<ControllerStatus> {
        self.status_rx.clone()
    }

    /// Number of operations waiting in the state queue.
    pub fn pending_operations(&self) -> usize {
        self.queue.len()
    }

    /// Enqueues a bootstrap for an additional named worker.
    pub fn create_worker(
        &self,
        worker_name: impl Into<String>,
        worker: Box<dyn WorkerMethods>,
        init_kwargs: Map<String, Value>,
    ) {
        self.queue.put(
            StatePolicy {
                priority: priority::BOOTSTRAP,
                allowed_modes: ModeSet::ALL,
                queue_indefinitely: true,
                delete_stale: false,
            },
            Operation::CreateWorker {
                name: worker_name.into(),
                worker,
                init_kwargs,
            },
        );
    }

    /// Enqueues programming of a single front-panel value.
    ///
    /// Bursts of these coalesce: only the oldest of a run of consecutive
    /// requests executes.
    pub fn manual_set(&self, channel: impl Into<String>, value: Value) {
        self.queue.put(
            StatePolicy {
                priority: priority::MANUAL,
                allowed_modes: ModeSet::only(Mode::Manual),
                queue_indefinitely: false,
                delete_stale: true,
            },
            Operation::ManualSet {
                name: channel.into(),
                value,
            },
        );
    }

    /// Enqueues best-effort shutdown of every worker.
    pub fn shutdown_workers(&self) {
        self.queue.put(
            StatePolicy {
                priority: priority::TRANSITION,
                allowed_modes: ModeSet::ALL,
                queue_indefinitely: true,
                delete_stale: false,
            },
            Operation::ShutdownWorkers,
        );
    }

    /// Enqueues the quit sentinel at top priority.
    pub fn quit(&self) {
        self.queue.put(
            StatePolicy {
                priority: priority::QUIT,
                allowed_modes: ModeSet::ALL,
                queue_indefinitely: true,
                delete_stale: false,
            },
            Operation::Quit,
        );
    }

    /// Shuts workers down, quits the loop and waits for it to finish.
    pub async fn shutdown(self, grace: Duration) {
        self.shutdown_workers();
        self.quit();
        if tokio::time::timeout(grace, self.join).await.is_err() {
            warn!(device = %self.name, "controller loop did not quit within grace period");
        }
    }

    fn put_transition(&self, allowed_modes: ModeSet, op: Operation) {
        self.queue.put(
            StatePolicy {
                priority: priority::TRANSITION,
                allowed_modes,
                queue_indefinitely: false,
                delete_stale: false,
            },
            op,
        );
    }
}

impl Device for DeviceController {
    fn device_name(&self) -> &str {
        &self.name
    }

    fn mode(&self) -> Mode {
        self.status_rx.borrow().mode
    }

    fn error_state(&self) -> Option<String> {
        let status = self.status_rx.borrow();
        if status.fatal {
            return Some(
                status
                    .error
                    .clone()
                    .unwrap_or_else(|| "fatal controller error".to_string()),
            );
        }
        status.error.clone()
    }

    fn transition_to_buffered(&self, shot_path: &Path) {
        self.put_transition(
            ModeSet::only(Mode::Manual),
            Operation::TransitionToBuffered {
                shot_path: shot_path.to_path_buf(),
            },
        );
    }

    fn abort_transition_to_buffered(&self) {
        // Also allowed in Buffered: the transition may complete in the gap
        // between the orchestrator's mode read and this enqueue, and the
        // abort must still win.
        self.put_transition(
            Mode::TransitioningToBuffered | Mode::Buffered,
            Operation::AbortTransitionToBuffered,
        );
    }

    fn abort_buffered(&self) {
        self.put_transition(
            Mode::Buffered | Mode::TransitioningToManual,
            Operation::AbortBuffered,
        );
    }

    fn transition_to_manual(&self) {
        self.put_transition(ModeSet::only(Mode::Buffered), Operation::TransitionToManual);
    }

    fn start_run(&self) {
        self.put_transition(ModeSet::only(Mode::Buffered), Operation::StartRun);
    }
}

enum LoopControl {
    Continue,
    Quit,
}

/// State owned by the execution loop task.
struct ControllerLoop {
    name: String,
    mode: Mode,
    workers: Vec<WorkerHandle>,
    status_tx: watch::Sender<ControllerStatus>,
    event_tx: mpsc::Sender<DeviceEvent>,
    shared: SharedState,
    settings: WorkerSettings,
    error: Option<String>,
    shutdown_complete: bool,
}

impl ControllerLoop {
    async fn run(mut self, mut consumer: QueueConsumer<Operation>) {
        info!(device = %self.name, "controller loop started");
        loop {
            let queued = consumer.get(self.mode).await;
            let label = queued.op.label();
            debug!(device = %self.name, op = label, mode = %self.mode, "executing operation");

            match self.execute(queued.op).await {
                Ok(LoopControl::Continue) => {}
                Ok(LoopControl::Quit) => break,
                Err(e) if matches!(e, EngineError::FatalCommunication { .. }) => {
                    error!(
                        device = %self.name,
                        op = label,
                        error = %e,
                        "fatal controller error, no further operations will be processed"
                    );
                    self.error = Some(e.to_string());
                    self.publish_fatal();
                    break;
                }
                Err(e) => {
                    warn!(device = %self.name, op = label, error = %e, "operation failed");
                    self.error = Some(e.to_string());
                    self.publish_status();
                }
            }
        }
        info!(device = %self.name, "controller loop finished");
    }

    async fn execute(&mut self, op: Operation) -> AppResult<LoopControl> {
        match op {
            Operation::CreateWorker {
                name,
                worker,
                init_kwargs,
            } => self.create_worker(name, worker, init_kwargs).await,
            Operation::TransitionToBuffered { shot_path } => {
                self.transition_to_buffered(&shot_path).await
            }
            Operation::AbortTransitionToBuffered => {
                self.abort("abort_transition_to_buffered").await
            }
            Operation::AbortBuffered => self.abort("abort_buffered").await,
            Operation::TransitionToManual => self.transition_to_manual().await,
            Operation::StartRun => self.start_run().await,
            Operation::ManualSet { name, value } => self.manual_set(name, value).await,
            Operation::ShutdownWorkers => self.shutdown_workers().await,
            Operation::Quit => Ok(LoopControl::Quit),
        }
    }

    async fn create_worker(
        &mut self,
        name: String,
        worker: Box<dyn WorkerMethods>,
        init_kwargs: Map<String, Value>,
    ) -> AppResult<LoopControl> {
        let mut handle = WorkerHandle::spawn(name.clone(), worker, &self.settings);
        match handle.request("init", Vec::new(), init_kwargs).await {
            Ok(_) => {
                info!(device = %self.name, worker = %name, "worker initialized");
                self.workers.push(handle);
                Ok(LoopControl::Continue)
            }
            // Workers without an explicit init step are acceptable.
            Err(EngineError::WorkerMethodMissing { .. }) => {
                debug!(device = %self.name, worker = %name, "worker has no init method");
                self.workers.push(handle);
                Ok(LoopControl::Continue)
            }
            Err(e) => {
                let _ = handle.shutdown(self.settings.shutdown_grace).await;
                Err(e)
            }
        }
    }

    async fn transition_to_buffered(&mut self, shot_path: &Path) -> AppResult<LoopControl> {
        self.set_mode(Mode::TransitioningToBuffered);
        let path_arg = Value::String(shot_path.display().to_string());

        for idx in 0..self.workers.len() {
            let result = self.workers[idx]
                .request("program_buffered", vec![path_arg.clone()], Map::new())
                .await;
            if let Err(e) = result {
                // Mode stays at TransitioningToBuffered; the pipeline reacts
                // to the failure report with abort_transition_to_buffered.
                self.report(DeviceEvent::TransitionedToBuffered {
                    device: self.name.clone(),
                    success: false,
                    message: e.to_string(),
                })
                .await;
                return Err(e);
            }
        }

        self.set_mode(Mode::Buffered);
        self.report(DeviceEvent::TransitionedToBuffered {
            device: self.name.clone(),
            success: true,
            message: String::new(),
        })
        .await;
        Ok(LoopControl::Continue)
    }

    async fn abort(&mut self, method: &'static str) -> AppResult<LoopControl> {
        for idx in 0..self.workers.len() {
            match self.workers[idx].request(method, Vec::new(), Map::new()).await {
                Ok(_) => {}
                Err(e @ EngineError::FatalCommunication { .. }) => return Err(e),
                Err(e) => {
                    // The device still returns to manual; an abort step that
                    // failed is surfaced but not allowed to wedge recovery.
                    warn!(device = %self.name, method, error = %e, "abort step failed");
                    self.error = Some(e.to_string());
                }
            }
        }
        self.set_mode(Mode::Manual);
        Ok(LoopControl::Continue)
    }

    async fn transition_to_manual(&mut self) -> AppResult<LoopControl> {
        self.set_mode(Mode::TransitioningToManual);

        for idx in 0..self.workers.len() {
            match self.workers[idx]
                .request("transition_to_manual", Vec::new(), Map::new())
                .await
            {
                Ok(Value::Object(final_values)) => {
                    // Final output values reported by the worker become the
                    // observable front-panel state.
                    for (channel, value) in final_values {
                        self.shared
                            .set(format!("{}.{}", self.name, channel), value)
                            .await;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    self.report(DeviceEvent::TransitionedToManual {
                        device: self.name.clone(),
                        success: false,
                        message: e.to_string(),
                    })
                    .await;
                    return Err(e);
                }
            }
        }

        self.error = None;
        self.set_mode(Mode::Manual);
        self.report(DeviceEvent::TransitionedToManual {
            device: self.name.clone(),
            success: true,
            message: String::new(),
        })
        .await;
        Ok(LoopControl::Continue)
    }

    async fn start_run(&mut self) -> AppResult<LoopControl> {
        // The run lasts as long as the hardware says it does; its result
        // wait gets the dedicated run bound, not the protocol timeout.
        let run_timeout = self.settings.run_timeout;
        for idx in 0..self.workers.len() {
            if let Err(e) = self.workers[idx]
                .request_bounded("start_run", Vec::new(), Map::new(), run_timeout)
                .await
            {
                self.report(DeviceEvent::RunFinished {
                    device: self.name.clone(),
                    success: false,
                    message: e.to_string(),
                })
                .await;
                return Err(e);
            }
        }
        self.report(DeviceEvent::RunFinished {
            device: self.name.clone(),
            success: true,
            message: String::new(),
        })
        .await;
        Ok(LoopControl::Continue)
    }

    async fn manual_set(&mut self, channel: String, value: Value) -> AppResult<LoopControl> {
        for idx in 0..self.workers.len() {
            let result = self.workers[idx]
                .request(
                    "program_manual",
                    vec![Value::String(channel.clone()), value.clone()],
                    Map::new(),
                )
                .await;
            if let Err(e) = result {
                self.report(DeviceEvent::ErrorState {
                    device: self.name.clone(),
                    message: e.to_string(),
                })
                .await;
                return Err(e);
            }
        }
        self.shared
            .set(format!("{}.{}", self.name, channel), value)
            .await;
        Ok(LoopControl::Continue)
    }

    async fn shutdown_workers(&mut self) -> AppResult<LoopControl> {
        for handle in self.workers.drain(..) {
            handle.shutdown(self.settings.shutdown_grace).await;
        }
        self.shutdown_complete = true;
        self.publish_status();
        Ok(LoopControl::Continue)
    }

    fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
        self.publish_status();
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(ControllerStatus {
            mode: self.mode,
            error: self.error.clone(),
            fatal: false,
            shutdown_complete: self.shutdown_complete,
        });
    }

    fn publish_fatal(&self) {
        self.status_tx.send_replace(ControllerStatus {
            mode: self.mode,
            error: self.error.clone(),
            fatal: true,
            shutdown_complete: self.shutdown_complete,
        });
    }

    async fn report(&self, event: DeviceEvent) {
        if self.event_tx.send(event).await.is_err() {
            debug!(device = %self.name, "no pipeline listening for device events");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimWorker;
    use serde_json::json;
    use tokio::time::timeout;

    fn test_settings() -> WorkerSettings {
        WorkerSettings {
            response_timeout: Duration::from_millis(500),
            run_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_millis(200),
            channel_capacity: 8,
        }
    }

    async fn wait_for(
        controller: &DeviceController,
        what: &str,
        pred: impl Fn(&ControllerStatus) -> bool,
    ) {
        let mut rx = controller.status_watch();
        let result = timeout(Duration::from_secs(2), async {
            loop {
                {
                    let status = rx.borrow();
                    if pred(&status) {
                        return;
                    }
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await;
        assert!(result.is_ok(), "timed out waiting for {what}");
    }

    #[tokio::test]
    async fn full_cycle_through_all_four_modes() {
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let shared = SharedState::new();
        let controller = DeviceController::spawn(
            "pulse_gen",
            Box::new(SimWorker::new("pulse_gen")),
            shared.clone(),
            event_tx,
            test_settings(),
        )
        .unwrap();

        controller.transition_to_buffered(Path::new("/tmp/shot_000.json"));
        wait_for(&controller, "buffered mode", |s| s.mode == Mode::Buffered).await;
        assert!(matches!(
            event_rx.recv().await,
            Some(DeviceEvent::TransitionedToBuffered { success: true, .. })
        ));

        controller.start_run();
        assert!(matches!(
            timeout(Duration::from_secs(2), event_rx.recv()).await.unwrap(),
            Some(DeviceEvent::RunFinished { success: true, .. })
        ));

        controller.transition_to_manual();
        wait_for(&controller, "manual mode", |s| s.mode == Mode::Manual).await;
        assert!(matches!(
            event_rx.recv().await,
            Some(DeviceEvent::TransitionedToManual { success: true, .. })
        ));

        // The worker's final values were applied to the observable state.
        assert_eq!(shared.get("pulse_gen.armed").await, Some(json!(false)));

        controller.shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn failed_programming_reports_and_waits_for_abort() {
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let controller = DeviceController::spawn(
            "acq",
            Box::new(SimWorker::new("acq").failing_on("program_buffered")),
            SharedState::new(),
            event_tx,
            test_settings(),
        )
        .unwrap();

        controller.transition_to_buffered(Path::new("/tmp/shot_000.json"));
        assert!(matches!(
            timeout(Duration::from_secs(2), event_rx.recv()).await.unwrap(),
            Some(DeviceEvent::TransitionedToBuffered { success: false, .. })
        ));
        wait_for(&controller, "stuck in transition", |s| {
            s.mode == Mode::TransitioningToBuffered && s.error.is_some()
        })
        .await;

        // The pipeline is responsible for issuing the abort.
        controller.abort_transition_to_buffered();
        wait_for(&controller, "manual after abort", |s| s.mode == Mode::Manual).await;

        controller.shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn double_timeout_is_fatal_for_this_controller_only() {
        let (event_tx, _event_rx) = mpsc::channel(16);
        let settings = WorkerSettings {
            response_timeout: Duration::from_millis(50),
            ..test_settings()
        };
        let controller = DeviceController::spawn(
            "slow",
            Box::new(SimWorker::new("slow").hanging_on("program_buffered")),
            SharedState::new(),
            event_tx,
            settings,
        )
        .unwrap();

        controller.transition_to_buffered(Path::new("/tmp/shot_000.json"));
        wait_for(&controller, "fatal status", |s| s.fatal).await;

        // No further operations are processed after a fatal error.
        controller.manual_set("gate", json!(1.0));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(controller.pending_operations(), 1);
        assert!(controller.error_state().is_some());
    }

    #[tokio::test]
    async fn run_longer_than_protocol_timeout_is_not_fatal() {
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let settings = WorkerSettings {
            response_timeout: Duration::from_millis(100),
            run_timeout: Duration::from_secs(5),
            ..test_settings()
        };
        let controller = DeviceController::spawn(
            "pulse_gen",
            Box::new(SimWorker::new("pulse_gen").with_run_duration(Duration::from_millis(400))),
            SharedState::new(),
            event_tx,
            settings,
        )
        .unwrap();

        controller.transition_to_buffered(Path::new("/tmp/shot_000.json"));
        wait_for(&controller, "buffered mode", |s| s.mode == Mode::Buffered).await;
        assert!(matches!(
            event_rx.recv().await,
            Some(DeviceEvent::TransitionedToBuffered { success: true, .. })
        ));

        // Four protocol windows pass before the run completes; the run
        // bound keeps that from being treated as a hung worker.
        controller.start_run();
        assert!(matches!(
            timeout(Duration::from_secs(2), event_rx.recv()).await.unwrap(),
            Some(DeviceEvent::RunFinished { success: true, .. })
        ));
        assert!(!controller.status().fatal);

        controller.shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn manual_set_applies_front_panel_value() {
        let (event_tx, _event_rx) = mpsc::channel(16);
        let shared = SharedState::new();
        let controller = DeviceController::spawn(
            "dds",
            Box::new(SimWorker::new("dds")),
            shared.clone(),
            event_tx,
            test_settings(),
        )
        .unwrap();

        controller.manual_set("freq", json!(80.5));
        let mut tries = 0;
        while shared.get("dds.freq").await.is_none() && tries < 40 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            tries += 1;
        }
        assert_eq!(shared.get("dds.freq").await, Some(json!(80.5)));

        controller.shutdown(Duration::from_secs(2)).await;
    }
}
