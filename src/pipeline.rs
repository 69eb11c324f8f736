//! Shot pipeline orchestrator.
//!
//! One dedicated loop drives every shot through the cycle
//! `Preparing -> TransitioningToBuffered -> Running -> TransitioningToManual
//! -> AnalysisHandoff`, then derives a repeat or goes idle. Shots are taken
//! one at a time from a FIFO whose pause/resume is controlled externally
//! through the [`PipelineHandle`].
//!
//! Fan-out phases enqueue transitions on every relevant device at once and
//! fan in through a barrier over the shared [`DeviceEvent`] channel, polled
//! on a short interval so abort signals, device failures and the wall-clock
//! deadline are all observed promptly. The return-to-manual phase is the
//! exception: device workers may write results into the shot file there, so
//! it runs one device at a time.
//!
//! Recovery always prefers pause-and-requeue over data loss. A phase abort
//! (explicit signal, device failure, barrier timeout) pauses the queue and
//! puts the shot back at its head untouched; an unexpected error or a
//! failure while returning to manual additionally strips volatile run data
//! from the shot file and forces every non-manual device back to `Manual`.

use crate::callbacks::{CallbackRegistry, ANALYSIS_CANCEL_SEND, SHOT_COMPLETE, SHOT_IGNORE_REPEAT};
use crate::config::{PipelineSettings, RepeatMode};
use crate::controller::{Device, DeviceEvent};
use crate::error::{AppResult, EngineError};
use crate::mode::Mode;
use crate::shot::{self, Shot};
use chrono::Utc;
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Phase the orchestrator is currently executing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    /// No shot in flight.
    Idle,
    /// Reading the shot's device list.
    Preparing,
    /// Fanning out buffered transitions and waiting on the barrier.
    TransitioningToBuffered,
    /// Waiting for the timing master's run to finish.
    Running,
    /// Returning devices to manual, one at a time.
    TransitioningToManual,
    /// Handing the finished shot to the analysis collaborator.
    AnalysisHandoff,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PipelineState::Idle => "idle",
            PipelineState::Preparing => "preparing",
            PipelineState::TransitioningToBuffered => "transitioning_to_buffered",
            PipelineState::Running => "running",
            PipelineState::TransitioningToManual => "transitioning_to_manual",
            PipelineState::AnalysisHandoff => "analysis_handoff",
        };
        f.write_str(s)
    }
}

/// Published snapshot of the orchestrator.
#[derive(Clone, Debug)]
pub struct PipelineStatus {
    /// Current phase.
    pub state: PipelineState,
    /// Whether the pending queue is paused.
    pub paused: bool,
    /// Path of the shot in flight, if any.
    pub current_shot: Option<PathBuf>,
    /// Number of shots waiting in the queue.
    pub pending: usize,
    /// Most recent noteworthy message (abort reasons, recovery notes).
    pub last_message: Option<String>,
}

impl Default for PipelineStatus {
    fn default() -> Self {
        Self {
            state: PipelineState::Idle,
            paused: false,
            current_shot: None,
            pending: 0,
            last_message: None,
        }
    }
}

/// Control messages posted to the orchestrator's signal channel.
///
/// A signal does not interrupt an in-flight worker call; the current phase's
/// poll loop observes it at the next wakeup.
#[derive(Clone, Debug)]
pub enum Signal {
    /// Abort the shot in flight.
    Abort,
    /// A device was externally restarted; treated like an abort.
    DeviceRestart(String),
    /// Stop the orchestrator loop.
    Shutdown,
}

struct PendingInner {
    shots: VecDeque<Shot>,
    paused: bool,
    current: Option<PathBuf>,
}

struct PendingQueue {
    inner: Mutex<PendingInner>,
    notify: Notify,
}

impl PendingQueue {
    fn lock(&self) -> MutexGuard<'_, PendingInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PendingInner {
    fn is_taken(&self, path: &Path) -> bool {
        self.current.as_deref() == Some(path) || self.shots.iter().any(|s| s.path() == path)
    }
}

/// Derives the first repeat name of `path` that `taken` does not claim.
fn derive_repeat_target(path: &Path, taken: impl Fn(&Path) -> bool) -> PathBuf {
    let mut candidate = shot::repeat_path(path);
    while taken(&candidate) {
        candidate = shot::repeat_path(&candidate);
    }
    candidate
}

/// Handle to a spawned [`ShotPipeline`].
pub struct PipelineHandle {
    queue: Arc<PendingQueue>,
    signal_tx: mpsc::UnboundedSender<Signal>,
    status_rx: watch::Receiver<PipelineStatus>,
    event_tx: mpsc::Sender<DeviceEvent>,
    join: JoinHandle<()>,
}

impl PipelineHandle {
    /// Appends a shot to the pending queue.
    ///
    /// If the same path is already pending (or in flight), the content is
    /// cleaned into the next free repeat-derived name and that derivative is
    /// submitted instead. Returns the shot actually queued.
    pub fn submit(&self, shot: Shot) -> AppResult<Shot> {
        // Derive under the lock, but keep the file I/O of the clean outside
        // it; the orchestrator loop contends on this mutex.
        let target = {
            let inner = self.queue.lock();
            if inner.is_taken(shot.path()) {
                Some(derive_repeat_target(shot.path(), |p| {
                    p.exists() || inner.is_taken(p)
                }))
            } else {
                None
            }
        };
        let shot = match target {
            Some(target) => {
                shot::clean_into(shot.path(), &target, shot::repeat_index(&target))?;
                info!(
                    original = %shot.path().display(),
                    derived = %target.display(),
                    "shot already pending, submitting repeat derivative"
                );
                Shot::new(target)
            }
            None => shot,
        };
        self.queue.lock().shots.push_back(shot.clone());
        self.queue.notify.notify_one();
        Ok(shot)
    }

    /// Number of shots waiting in the queue.
    pub fn pending(&self) -> usize {
        self.queue.lock().shots.len()
    }

    /// Pauses the queue; the shot in flight finishes its current phase
    /// handling but no new shot starts.
    pub fn pause(&self) {
        self.queue.lock().paused = true;
    }

    /// Resumes a paused queue.
    pub fn resume(&self) {
        self.queue.lock().paused = false;
        self.queue.notify.notify_one();
    }

    /// Posts an abort for the shot in flight.
    pub fn abort(&self) {
        let _ = self.signal_tx.send(Signal::Abort);
    }

    /// Reports an external device restart; aborts the shot in flight.
    pub fn device_restart(&self, device: impl Into<String>) {
        let _ = self.signal_tx.send(Signal::DeviceRestart(device.into()));
    }

    /// Current published status.
    pub fn status(&self) -> PipelineStatus {
        self.status_rx.borrow().clone()
    }

    /// A watch receiver over the pipeline's status.
    pub fn status_watch(&self) -> watch::Receiver<PipelineStatus> {
        self.status_rx.clone()
    }

    /// A sender for the shared device event channel, one clone per
    /// controller.
    pub fn event_sender(&self) -> mpsc::Sender<DeviceEvent> {
        self.event_tx.clone()
    }

    /// Stops the orchestrator loop and waits for it to finish.
    pub async fn shutdown(self) {
        let _ = self.signal_tx.send(Signal::Shutdown);
        if self.join.await.is_err() {
            warn!("pipeline loop ended abnormally");
        }
    }
}

/// The orchestrator; constructed through [`ShotPipeline::spawn`].
pub struct ShotPipeline;

impl ShotPipeline {
    /// Spawns the orchestrator loop over the given devices.
    ///
    /// `timing_master` names the device whose `start_run` triggers the
    /// hardware-timed run; it must be one of `devices`. `events` is the
    /// shared device event channel, created by the caller so that controller
    /// construction can precede the pipeline's. Returns the handle and the
    /// receiving end of the analysis handoff queue.
    pub fn spawn(
        devices: Vec<Arc<dyn Device>>,
        timing_master: impl Into<String>,
        callbacks: CallbackRegistry,
        settings: PipelineSettings,
        events: (mpsc::Sender<DeviceEvent>, mpsc::Receiver<DeviceEvent>),
    ) -> AppResult<(PipelineHandle, mpsc::UnboundedReceiver<PathBuf>)> {
        let timing_master = timing_master.into();
        let devices: HashMap<String, Arc<dyn Device>> = devices
            .into_iter()
            .map(|d| (d.device_name().to_string(), d))
            .collect();
        if !devices.contains_key(&timing_master) {
            return Err(EngineError::UnknownDevice(timing_master));
        }

        let queue = Arc::new(PendingQueue {
            inner: Mutex::new(PendingInner {
                shots: VecDeque::new(),
                paused: false,
                current: None,
            }),
            notify: Notify::new(),
        });
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = events;
        let (status_tx, status_rx) = watch::channel(PipelineStatus::default());
        let (analysis_tx, analysis_rx) = mpsc::unbounded_channel();

        let looper = PipelineLoop {
            devices,
            timing_master,
            callbacks,
            settings,
            queue: Arc::clone(&queue),
            status_tx,
            signal_rx,
            event_rx,
            analysis_tx,
            last_message: None,
        };
        let join = tokio::spawn(looper.run());

        Ok((
            PipelineHandle {
                queue,
                signal_tx,
                status_rx,
                event_tx,
                join,
            },
            analysis_rx,
        ))
    }
}

enum ShotRun {
    Completed,
    Recover {
        clean: bool,
        force_manual: bool,
        message: String,
    },
    Shutdown,
}

enum Wakeup {
    Signal(Signal),
    Event(DeviceEvent),
    Tick,
}

struct PipelineLoop {
    devices: HashMap<String, Arc<dyn Device>>,
    timing_master: String,
    callbacks: CallbackRegistry,
    settings: PipelineSettings,
    queue: Arc<PendingQueue>,
    status_tx: watch::Sender<PipelineStatus>,
    signal_rx: mpsc::UnboundedReceiver<Signal>,
    event_rx: mpsc::Receiver<DeviceEvent>,
    analysis_tx: mpsc::UnboundedSender<PathBuf>,
    last_message: Option<String>,
}

impl PipelineLoop {
    async fn run(mut self) {
        info!(timing_master = %self.timing_master, devices = self.devices.len(), "shot pipeline started");
        while let Some(shot) = self.next_shot().await {
            info!(shot = %shot.path().display(), repeat = shot.repeat_count(), "shot dequeued");
            match self.run_shot(&shot).await {
                ShotRun::Completed => {
                    self.queue.lock().current = None;
                    self.last_message = None;
                    self.publish(PipelineState::Idle);
                }
                ShotRun::Recover {
                    clean,
                    force_manual,
                    message,
                } => self.recover(shot, clean, force_manual, message),
                ShotRun::Shutdown => break,
            }
        }
        self.queue.lock().current = None;
        self.last_message = Some("shut down".to_string());
        self.publish(PipelineState::Idle);
        info!("shot pipeline finished");
    }

    /// Blocks until a shot can be dequeued; `None` means shutdown.
    async fn next_shot(&mut self) -> Option<Shot> {
        loop {
            {
                let mut inner = self.queue.lock();
                if !inner.paused {
                    if let Some(shot) = inner.shots.pop_front() {
                        inner.current = Some(shot.path().to_path_buf());
                        return Some(shot);
                    }
                }
            }
            tokio::select! {
                biased;
                signal = self.signal_rx.recv() => match signal {
                    Some(Signal::Shutdown) | None => return None,
                    // Nothing in flight; abort and restart signals are moot.
                    Some(other) => debug!(signal = ?other, "signal ignored while idle"),
                },
                _ = self.queue.notify.notified() => {}
            }
        }
    }

    async fn run_shot(&mut self, shot: &Shot) -> ShotRun {
        match self.try_run_shot(shot).await {
            Ok(run) => run,
            Err(e) => {
                error!(shot = %shot.path().display(), error = %e, "unhandled pipeline error");
                ShotRun::Recover {
                    clean: true,
                    force_manual: true,
                    message: e.to_string(),
                }
            }
        }
    }

    async fn try_run_shot(&mut self, shot: &Shot) -> AppResult<ShotRun> {
        // Preparing
        self.publish(PipelineState::Preparing);
        self.drain_stale_events();
        let devices = self.resolve_devices(shot)?;
        shot.stamp_attribute("run_started", json!(Utc::now().to_rfc3339()))?;

        // TransitioningToBuffered
        self.publish(PipelineState::TransitioningToBuffered);
        let mut barrier: HashSet<String> = devices
            .iter()
            .map(|d| d.device_name().to_string())
            .collect();
        for device in &devices {
            device.transition_to_buffered(shot.path());
        }
        let deadline = Instant::now() + self.settings.buffered_deadline;

        while !barrier.is_empty() {
            if Instant::now() >= deadline {
                self.abort_barrier(&devices, &barrier);
                return Ok(ShotRun::Recover {
                    clean: false,
                    force_manual: false,
                    message: format!(
                        "timed out waiting for buffered transitions ({} device(s) outstanding)",
                        barrier.len()
                    ),
                });
            }
            match self.next_wakeup().await {
                Wakeup::Signal(Signal::Shutdown) => {
                    self.abort_barrier(&devices, &barrier);
                    return Ok(ShotRun::Shutdown);
                }
                Wakeup::Signal(Signal::Abort) => {
                    self.abort_barrier(&devices, &barrier);
                    return Ok(ShotRun::Recover {
                        clean: false,
                        force_manual: false,
                        message: "aborted during transition to buffered".to_string(),
                    });
                }
                Wakeup::Signal(Signal::DeviceRestart(device)) => {
                    self.abort_barrier(&devices, &barrier);
                    return Ok(ShotRun::Recover {
                        clean: false,
                        force_manual: false,
                        message: format!("device {device} restarted during transition to buffered"),
                    });
                }
                Wakeup::Event(DeviceEvent::TransitionedToBuffered {
                    device,
                    success: true,
                    ..
                }) => {
                    barrier.remove(&device);
                }
                Wakeup::Event(DeviceEvent::TransitionedToBuffered {
                    device,
                    success: false,
                    message,
                })
                | Wakeup::Event(DeviceEvent::ErrorState { device, message }) => {
                    self.abort_barrier(&devices, &barrier);
                    return Ok(ShotRun::Recover {
                        clean: false,
                        force_manual: false,
                        message: format!("{device} failed to reach buffered mode: {message}"),
                    });
                }
                Wakeup::Event(stale) => {
                    debug!(event = ?stale, "stale device event during fan-in");
                }
                Wakeup::Tick => {}
            }
        }

        // Running
        self.publish(PipelineState::Running);
        match self.devices.get(&self.timing_master) {
            Some(master) => master.start_run(),
            None => return Err(EngineError::UnknownDevice(self.timing_master.clone())),
        }
        loop {
            match self.next_wakeup().await {
                Wakeup::Signal(Signal::Shutdown) => {
                    self.abort_in_flight(&devices);
                    return Ok(ShotRun::Shutdown);
                }
                Wakeup::Signal(Signal::Abort) => {
                    self.abort_in_flight(&devices);
                    return Ok(ShotRun::Recover {
                        clean: false,
                        force_manual: false,
                        message: "aborted during run".to_string(),
                    });
                }
                Wakeup::Signal(Signal::DeviceRestart(device)) => {
                    self.abort_in_flight(&devices);
                    return Ok(ShotRun::Recover {
                        clean: false,
                        force_manual: false,
                        message: format!("device {device} restarted during run"),
                    });
                }
                Wakeup::Event(DeviceEvent::RunFinished { success: true, .. }) => break,
                Wakeup::Event(DeviceEvent::RunFinished {
                    device,
                    success: false,
                    message,
                })
                | Wakeup::Event(DeviceEvent::ErrorState { device, message }) => {
                    self.abort_in_flight(&devices);
                    return Ok(ShotRun::Recover {
                        clean: false,
                        force_manual: false,
                        message: format!("{device} failed during run: {message}"),
                    });
                }
                Wakeup::Event(stale) => {
                    debug!(event = ?stale, "stale device event during run");
                }
                Wakeup::Tick => {}
            }
        }

        // TransitioningToManual: workers may write results into the shot
        // file here, so devices are processed strictly one at a time.
        self.publish(PipelineState::TransitioningToManual);
        for device in &devices {
            let name = device.device_name().to_string();
            device.transition_to_manual();
            let phase_deadline = Instant::now() + self.settings.buffered_deadline;
            loop {
                if Instant::now() >= phase_deadline {
                    return Ok(ShotRun::Recover {
                        clean: true,
                        force_manual: true,
                        message: format!("{name} timed out returning to manual"),
                    });
                }
                match self.next_wakeup().await {
                    Wakeup::Signal(Signal::Shutdown) => return Ok(ShotRun::Shutdown),
                    Wakeup::Event(DeviceEvent::TransitionedToManual {
                        device,
                        success: true,
                        ..
                    }) if device == name => break,
                    Wakeup::Event(DeviceEvent::TransitionedToManual {
                        device,
                        success: false,
                        message,
                    })
                    | Wakeup::Event(DeviceEvent::ErrorState { device, message }) => {
                        return Ok(ShotRun::Recover {
                            clean: true,
                            force_manual: true,
                            message: format!("{device} failed returning to manual: {message}"),
                        });
                    }
                    // Already committed to returning to manual; an abort
                    // changes nothing at this point.
                    Wakeup::Signal(_) => {}
                    Wakeup::Event(stale) => {
                        debug!(event = ?stale, "stale device event during return to manual");
                    }
                    Wakeup::Tick => {}
                }
            }
        }

        // AnalysisHandoff
        self.publish(PipelineState::AnalysisHandoff);
        if self.callbacks.any_true(ANALYSIS_CANCEL_SEND, shot) {
            info!(shot = %shot.path().display(), "analysis handoff vetoed");
        } else if self.analysis_tx.send(shot.path().to_path_buf()).is_err() {
            warn!(shot = %shot.path().display(), "analysis queue receiver is gone");
        }
        self.callbacks.notify(SHOT_COMPLETE, shot);

        self.maybe_repeat(shot);
        Ok(ShotRun::Completed)
    }

    fn resolve_devices(&self, shot: &Shot) -> AppResult<Vec<Arc<dyn Device>>> {
        let names = shot.device_list()?;
        if !names.iter().any(|n| *n == self.timing_master) {
            return Err(EngineError::ShotFile(format!(
                "{}: shot does not program timing master {}",
                shot.path().display(),
                self.timing_master
            )));
        }
        let mut devices = Vec::with_capacity(names.len());
        for name in names {
            let device = self
                .devices
                .get(&name)
                .ok_or_else(|| EngineError::UnknownDevice(name.clone()))?;
            if let Some(message) = device.error_state() {
                return Err(EngineError::DeviceFailure {
                    device: name,
                    message,
                });
            }
            devices.push(Arc::clone(device));
        }
        Ok(devices)
    }

    /// Aborts a failed buffered-transition fan-out.
    ///
    /// Every device still in the barrier gets `abort_transition_to_buffered`
    /// regardless of its observed mode: its transition may be queued but not
    /// started yet (worker bootstrap, an earlier op), and the abort must
    /// already be waiting behind it when it runs. Devices past the barrier
    /// are aborted per their current mode.
    fn abort_barrier(&self, devices: &[Arc<dyn Device>], barrier: &HashSet<String>) {
        for device in devices {
            if barrier.contains(device.device_name()) {
                device.abort_transition_to_buffered();
            } else {
                match device.mode() {
                    Mode::TransitioningToBuffered => device.abort_transition_to_buffered(),
                    Mode::Buffered | Mode::TransitioningToManual => device.abort_buffered(),
                    Mode::Manual => {}
                }
            }
        }
    }

    /// Aborts every listed device that is not already in manual mode, using
    /// whichever abort matches its current mode.
    fn abort_in_flight(&self, devices: &[Arc<dyn Device>]) {
        for device in devices {
            match device.mode() {
                Mode::TransitioningToBuffered => device.abort_transition_to_buffered(),
                Mode::Buffered | Mode::TransitioningToManual => device.abort_buffered(),
                Mode::Manual => {}
            }
        }
    }

    fn recover(&mut self, shot: Shot, clean: bool, force_manual: bool, message: String) {
        warn!(
            shot = %shot.path().display(),
            clean,
            force_manual,
            %message,
            "pausing pipeline and requeueing shot at head"
        );
        let shot = if clean {
            match shot::clean_for_requeue(&shot) {
                Ok(cleaned) => cleaned,
                Err(e) => {
                    // Requeue the raw file rather than lose it.
                    error!(shot = %shot.path().display(), error = %e, "could not clean shot for requeue");
                    shot
                }
            }
        } else {
            shot
        };

        {
            let mut inner = self.queue.lock();
            inner.paused = true;
            inner.current = None;
            inner.shots.push_front(shot);
        }

        if force_manual {
            let devices: Vec<Arc<dyn Device>> = self.devices.values().cloned().collect();
            self.abort_in_flight(&devices);
        }

        self.last_message = Some(message);
        self.publish(PipelineState::Idle);
    }

    fn maybe_repeat(&self, shot: &Shot) {
        let wants_repeat = match self.settings.repeat_mode {
            RepeatMode::Off => false,
            RepeatMode::All => true,
            RepeatMode::WhenQueueEmpty => self.queue.lock().shots.is_empty(),
        };
        if !wants_repeat || self.callbacks.any_true(SHOT_IGNORE_REPEAT, shot) {
            return;
        }

        // Always cleaned rather than renamed: the analysis collaborator
        // still owns the original file, and the derivative must not carry
        // volatile run data into its own execution.
        let target = {
            let inner = self.queue.lock();
            derive_repeat_target(shot.path(), |p| p.exists() || inner.is_taken(p))
        };
        match shot::clean_into(shot.path(), &target, shot::repeat_index(&target)) {
            Ok(()) => {
                info!(shot = %target.display(), "repeat shot queued");
                self.queue.lock().shots.push_back(Shot::new(target));
                self.queue.notify.notify_one();
            }
            Err(e) => {
                warn!(shot = %shot.path().display(), error = %e, "could not derive repeat shot");
            }
        }
    }

    async fn next_wakeup(&mut self) -> Wakeup {
        tokio::select! {
            biased;
            signal = self.signal_rx.recv() => Wakeup::Signal(signal.unwrap_or(Signal::Shutdown)),
            event = self.event_rx.recv() => match event {
                Some(event) => Wakeup::Event(event),
                None => Wakeup::Tick,
            },
            _ = tokio::time::sleep(self.settings.poll_interval) => Wakeup::Tick,
        }
    }

    /// Discards events left over from a previous (aborted) shot.
    fn drain_stale_events(&mut self) {
        while let Ok(event) = self.event_rx.try_recv() {
            debug!(event = ?event, "discarding stale device event");
        }
    }

    fn publish(&self, state: PipelineState) {
        let (paused, pending, current_shot) = {
            let inner = self.queue.lock();
            (inner.paused, inner.shots.len(), inner.current.clone())
        };
        self.status_tx.send_replace(PipelineStatus {
            state,
            paused,
            current_shot,
            pending,
            last_message: self.last_message.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::fs;

    struct IdleDevice {
        name: String,
    }

    impl Device for IdleDevice {
        fn device_name(&self) -> &str {
            &self.name
        }
        fn mode(&self) -> Mode {
            Mode::Manual
        }
        fn error_state(&self) -> Option<String> {
            None
        }
        fn transition_to_buffered(&self, _shot_path: &Path) {}
        fn abort_transition_to_buffered(&self) {}
        fn abort_buffered(&self) {}
        fn transition_to_manual(&self) {}
        fn start_run(&self) {}
    }

    fn shot_file(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        let doc = serde_json::json!({
            "devices": {"master": {}},
            "attributes": {}
        });
        fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();
        path
    }

    #[test]
    fn repeat_target_skips_taken_names() {
        let taken: Vec<PathBuf> = vec![
            PathBuf::from("/data/shot_003_rep00001.json"),
            PathBuf::from("/data/shot_003_rep00002.json"),
        ];
        let target = derive_repeat_target(Path::new("/data/shot_003.json"), |p| {
            taken.iter().any(|t| t == p)
        });
        assert_eq!(target, Path::new("/data/shot_003_rep00003.json"));
    }

    #[tokio::test]
    async fn resubmitting_a_pending_shot_derives_repeat_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = shot_file(dir.path(), "shot_003.json");

        let (handle, _analysis_rx) = ShotPipeline::spawn(
            vec![Arc::new(IdleDevice {
                name: "master".to_string(),
            })],
            "master",
            CallbackRegistry::new(),
            PipelineSettings::default(),
            mpsc::channel(16),
        )
        .unwrap();
        // Keep the loop from dequeueing while submissions pile up.
        handle.pause();

        let first = handle.submit(Shot::new(&path)).unwrap();
        assert_eq!(first.path(), path);

        let second = handle.submit(Shot::new(&path)).unwrap();
        assert_eq!(
            second.path().file_name().unwrap(),
            "shot_003_rep00001.json"
        );
        assert!(second.path().exists());
        assert_eq!(second.repeat_count(), 1);

        let third = handle.submit(Shot::new(&path)).unwrap();
        assert_eq!(third.path().file_name().unwrap(), "shot_003_rep00002.json");
        assert_eq!(handle.pending(), 3);

        // Derivatives are clean copies with the repeat count stamped.
        let doc: Value =
            serde_json::from_slice(&fs::read(second.path()).unwrap()).unwrap();
        assert_eq!(doc["attributes"]["repeat_count"], serde_json::json!(1));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_timing_master_is_rejected_at_spawn() {
        let result = ShotPipeline::spawn(
            vec![Arc::new(IdleDevice {
                name: "acq".to_string(),
            })],
            "master",
            CallbackRegistry::new(),
            PipelineSettings::default(),
            mpsc::channel(16),
        );
        assert!(matches!(result, Err(EngineError::UnknownDevice(ref name)) if name == "master"));
    }
}
