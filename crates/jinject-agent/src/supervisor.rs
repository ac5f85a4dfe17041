//! Hot reload: a background thread that polls the artifact's modification
//! time and re-drives the bridge when it changes.

use crate::bridge::RuntimeBridge;
use crate::runtime::ManagedRuntime;
use jinject_config::logging::Component;
use jinject_config::{log_reload_debug, log_reload_error, log_reload_info, log_reload_warn};
use jinject_gate::{IdentifierKind, ARCHIVE_EXTENSIONS};
use jinject_ipc::{ErrorCode, ErrorRecord, LastError};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

const THREAD_NAME: &str = "jinject-reload";

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub poll_interval: Duration,
    /// Pause between seeing a change and reloading
    pub settle_delay: Duration,
    /// Bound on waiting for the thread to exit before abandoning it
    pub shutdown_timeout: Duration,
    /// Bound on waiting for the thread to report it started
    pub start_timeout: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from(&jinject_config::ReloadConfig::default())
    }
}

impl From<&jinject_config::ReloadConfig> for SupervisorSettings {
    fn from(config: &jinject_config::ReloadConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            settle_delay: config.settle_delay(),
            shutdown_timeout: config.shutdown_timeout(),
            start_timeout: config.start_timeout(),
        }
    }
}

/// What the supervisor watches and the modification time it last acted on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorState {
    pub artifact: PathBuf,
    pub class_name: String,
    pub method_name: String,
    pub last_modified: SystemTime,
}

struct Worker {
    handle: JoinHandle<()>,
    running: Arc<AtomicBool>,
    monitor: Arc<Mutex<MonitorState>>,
    // Dropping the sender wakes the loop.
    shutdown_tx: Sender<()>,
    // Disconnects when the thread exits.
    done_rx: Receiver<()>,
}

/// Owns at most one polling thread. Holds the bridge weakly; the owning
/// context decides when the bridge goes away.
pub struct ReloadSupervisor<R: ManagedRuntime> {
    bridge: Weak<RuntimeBridge<R>>,
    settings: SupervisorSettings,
    worker: Mutex<Option<Worker>>,
    // Set while a start is between its running check and publishing.
    starting: AtomicBool,
    reloads: Arc<AtomicU64>,
    last_error: LastError,
}

/// Clears the starting flag however a start ends.
struct StartingGuard<'a>(&'a AtomicBool);

impl Drop for StartingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn modified(path: &Path) -> std::io::Result<SystemTime> {
    std::fs::metadata(path)?.modified()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

impl<R: ManagedRuntime> ReloadSupervisor<R> {
    pub fn new(bridge: Weak<RuntimeBridge<R>>, settings: SupervisorSettings) -> Self {
        Self {
            bridge,
            settings,
            worker: Mutex::new(None),
            starting: AtomicBool::new(false),
            reloads: Arc::new(AtomicU64::new(0)),
            last_error: LastError::new(),
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    pub fn last_error(&self) -> Option<ErrorRecord> {
        self.last_error.get()
    }

    /// Reload cycles attempted since construction, failed ones included.
    pub fn reload_count(&self) -> u64 {
        self.reloads.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        lock(&self.worker)
            .as_ref()
            .is_some_and(|w| w.running.load(Ordering::Acquire) && !w.handle.is_finished())
    }

    /// Snapshot of the watched artifact and its baseline.
    pub fn monitor(&self) -> Option<MonitorState> {
        lock(&self.worker)
            .as_ref()
            .map(|w| lock(&w.monitor).clone())
    }

    /// Start watching `path`. Succeeds without a second thread when already
    /// running or while another start is in progress.
    pub fn start(&self, path: &Path, class_name: &str, method_name: &str) -> Result<(), ErrorRecord> {
        let result = self
            .start_inner(path, class_name, method_name)
            .map_err(|e| e.with_origin(Component::RELOAD));
        self.last_error.track(result)
    }

    fn start_inner(&self, path: &Path, class_name: &str, method_name: &str) -> Result<(), ErrorRecord> {
        if self.starting.swap(true, Ordering::AcqRel) {
            log_reload_debug!("Supervisor start already in progress");
            return Ok(());
        }
        let _starting = StartingGuard(&self.starting);
        if self.is_running() {
            log_reload_debug!("Supervisor already running");
            return Ok(());
        }

        let artifact = jinject_gate::validate_path(path, ARCHIVE_EXTENSIONS)?;
        jinject_gate::validate_identifier(class_name, IdentifierKind::Class, IdentifierKind::Class.max_len())?;
        jinject_gate::validate_identifier(method_name, IdentifierKind::Method, IdentifierKind::Method.max_len())?;
        let last_modified = modified(&artifact)
            .map_err(|e| ErrorRecord::from(e).with_context("artifact modification time"))?;

        let monitor = Arc::new(Mutex::new(MonitorState {
            artifact: artifact.clone(),
            class_name: class_name.to_string(),
            method_name: method_name.to_string(),
            last_modified,
        }));
        let running = Arc::new(AtomicBool::new(true));
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel::<()>();

        let poll = PollLoop {
            bridge: self.bridge.clone(),
            settings: self.settings.clone(),
            running: Arc::clone(&running),
            monitor: Arc::clone(&monitor),
            reloads: Arc::clone(&self.reloads),
        };
        let handle = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || {
                let _done = done_tx;
                let _ = started_tx.send(());
                poll.run(shutdown_rx);
            })
            .map_err(|e| {
                ErrorRecord::new(ErrorCode::ThreadCreationFailed, e.to_string())
                    .with_context("spawn supervisor thread")
            })?;

        if started_rx.recv_timeout(self.settings.start_timeout).is_err() {
            running.store(false, Ordering::Release);
            drop(shutdown_tx);
            return Err(ErrorRecord::new(
                ErrorCode::ThreadCreationFailed,
                format!(
                    "supervisor thread did not start within {:?}",
                    self.settings.start_timeout
                ),
            ));
        }

        // Published after the handshake; the worker lock is never held
        // across it. A finished worker from an earlier run has nothing left
        // to join.
        *lock(&self.worker) = Some(Worker {
            handle,
            running,
            monitor,
            shutdown_tx,
            done_rx,
        });
        log_reload_info!(
            "Hot reload started",
            artifact = artifact.display().to_string(),
            class = class_name,
            method = method_name
        );
        Ok(())
    }

    /// Stop the polling thread. A no-op when nothing is running.
    ///
    /// Waits up to the shutdown timeout; an in-flight reload cycle is not
    /// interrupted, and a thread that outlives the timeout is abandoned.
    /// Returns `false` only when a thread was abandoned.
    pub fn stop(&self) -> bool {
        let Some(worker) = lock(&self.worker).take() else {
            return true;
        };
        worker.running.store(false, Ordering::Release);
        drop(worker.shutdown_tx);

        match worker.done_rx.recv_timeout(self.settings.shutdown_timeout) {
            Err(RecvTimeoutError::Timeout) => {
                log_reload_warn!(
                    "Supervisor thread did not stop in time, abandoning it",
                    timeout_ms = self.settings.shutdown_timeout.as_millis() as u64
                );
                false
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.handle.join().is_err() {
                    log_reload_error!("Supervisor thread panicked");
                }
                log_reload_info!("Hot reload stopped");
                true
            }
        }
    }
}

impl<R: ManagedRuntime> Drop for ReloadSupervisor<R> {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Everything the polling thread owns. Nothing here points back at the
/// supervisor, so an abandoned thread stays memory safe.
struct PollLoop<R: ManagedRuntime> {
    bridge: Weak<RuntimeBridge<R>>,
    settings: SupervisorSettings,
    running: Arc<AtomicBool>,
    monitor: Arc<Mutex<MonitorState>>,
    reloads: Arc<AtomicU64>,
}

impl<R: ManagedRuntime> PollLoop<R> {
    fn run(self, shutdown: Receiver<()>) {
        log_reload_debug!("Poll loop running", interval_ms = self.settings.poll_interval.as_millis() as u64);
        loop {
            if !self.sleep(&shutdown, self.settings.poll_interval) {
                break;
            }
            if self.bridge.strong_count() == 0 {
                log_reload_warn!("Runtime bridge dropped, ending poll loop");
                break;
            }
            match panic::catch_unwind(AssertUnwindSafe(|| self.poll_once(&shutdown))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log_reload_error!("Reload cycle failed", error = e.to_string()),
                Err(payload) => {
                    log_reload_error!("Poll iteration panicked", panic = panic_message(payload.as_ref()))
                }
            }
        }
        log_reload_debug!("Poll loop exited");
    }

    /// Wait `duration` unless stop is requested. `false` means stop.
    fn sleep(&self, shutdown: &Receiver<()>, duration: Duration) -> bool {
        match shutdown.recv_timeout(duration) {
            Err(RecvTimeoutError::Timeout) => self.running.load(Ordering::Acquire),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    fn poll_once(&self, shutdown: &Receiver<()>) -> Result<(), ErrorRecord> {
        let state = lock(&self.monitor).clone();
        let current = match modified(&state.artifact) {
            Ok(time) => time,
            Err(e) => {
                log_reload_warn!(
                    "Artifact unavailable, skipping poll",
                    artifact = state.artifact.display().to_string(),
                    error = e.to_string()
                );
                return Ok(());
            }
        };
        if current <= state.last_modified {
            return Ok(());
        }

        log_reload_info!("Artifact changed", artifact = state.artifact.display().to_string());
        if !self.sleep(shutdown, self.settings.settle_delay) {
            return Ok(());
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.reload(&state)))
            .unwrap_or_else(|payload| {
                Err(ErrorRecord::new(
                    ErrorCode::UnknownError,
                    format!("reload cycle panicked: {}", panic_message(payload.as_ref())),
                ))
            });

        // New baseline whatever the outcome, so a failed reload does not
        // re-trigger on the same change.
        let baseline = modified(&state.artifact).unwrap_or(current);
        lock(&self.monitor).last_modified = baseline;
        self.reloads.fetch_add(1, Ordering::AcqRel);

        if outcome.is_ok() {
            log_reload_info!("Reload cycle complete", artifact = state.artifact.display().to_string());
        }
        outcome.map_err(|e| e.with_origin(Component::RELOAD))
    }

    fn reload(&self, state: &MonitorState) -> Result<(), ErrorRecord> {
        let bridge = self.bridge.upgrade().ok_or_else(|| {
            ErrorRecord::new(ErrorCode::JvmNotInitialized, "runtime bridge is gone")
        })?;
        bridge.unload()?;
        bridge.load_artifact(&state.artifact)?;
        bridge.invoke(&state.class_name, &state.method_name, &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRuntime;
    use jinject_config::testing::TestEnvironment;

    fn fast() -> SupervisorSettings {
        SupervisorSettings {
            poll_interval: Duration::from_millis(20),
            settle_delay: Duration::from_millis(10),
            shutdown_timeout: Duration::from_secs(2),
            start_timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn test_default_timings() {
        let settings = SupervisorSettings::default();
        assert_eq!(settings.poll_interval, Duration::from_millis(1000));
        assert_eq!(settings.settle_delay, Duration::from_millis(500));
        assert_eq!(settings.shutdown_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_stop_when_idle_is_noop() {
        let bridge = Arc::new(RuntimeBridge::new(FakeRuntime::new()));
        let supervisor = ReloadSupervisor::new(Arc::downgrade(&bridge), fast());
        assert!(supervisor.stop());
        assert!(supervisor.stop());
        assert!(!supervisor.is_running());
        assert!(supervisor.monitor().is_none());
    }

    #[test]
    fn test_start_twice_keeps_one_thread() {
        let env = TestEnvironment::new().unwrap();
        let jar = env.create_archive("app.jar").unwrap();
        let bridge = Arc::new(RuntimeBridge::new(FakeRuntime::new()));
        let supervisor = ReloadSupervisor::new(Arc::downgrade(&bridge), fast());

        supervisor.start(&jar, "Main", "main").unwrap();
        let first = supervisor.monitor().unwrap();
        supervisor.start(&jar, "Other", "run").unwrap();
        assert!(supervisor.is_running());
        // The second start changed nothing.
        assert_eq!(supervisor.monitor().unwrap(), first);

        assert!(supervisor.stop());
        assert!(!supervisor.is_running());
        supervisor.start(&jar, "Main", "main").unwrap();
        assert!(supervisor.is_running());
    }

    #[test]
    fn test_concurrent_starts_keep_one_thread() {
        let env = TestEnvironment::new().unwrap();
        let jar = env.create_archive("app.jar").unwrap();
        let fake = FakeRuntime::new();
        fake.define_class("Main", &["main"], &[]);
        let bridge = Arc::new(RuntimeBridge::new(fake.clone()));
        bridge.attach().unwrap();
        bridge.load_artifact(&jar).unwrap();
        let supervisor = ReloadSupervisor::new(Arc::downgrade(&bridge), fast());

        thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    supervisor.start(&jar, "Main", "main").unwrap();
                    // Status queries run alongside other starts.
                    let _ = supervisor.is_running();
                    let _ = supervisor.monitor();
                });
            }
        });
        assert!(supervisor.is_running());

        // Two polling threads would each run a cycle for one change.
        env.bump_mtime(&jar, 10).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        while supervisor.reload_count() == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        thread::sleep(Duration::from_millis(200));
        assert_eq!(supervisor.reload_count(), 1);
        assert_eq!(fake.calls().len(), 1);
        assert!(supervisor.stop());
    }

    #[test]
    fn test_start_validates_inputs() {
        let env = TestEnvironment::new().unwrap();
        let jar = env.create_archive("app.jar").unwrap();
        let bridge = Arc::new(RuntimeBridge::new(FakeRuntime::new()));
        let supervisor = ReloadSupervisor::new(Arc::downgrade(&bridge), fast());

        let err = supervisor.start(&jar, "Main", "ma in").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParameter);
        assert_eq!(err.origin(), Component::RELOAD);
        let err = supervisor
            .start(&env.artifacts_dir.join("gone.jar"), "Main", "main")
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::FileNotFound);
        assert!(!supervisor.is_running());
        assert_eq!(supervisor.last_error().map(|e| e.code()), Some(ErrorCode::FileNotFound));
    }

    #[test]
    fn test_loop_ends_when_bridge_dropped() {
        let env = TestEnvironment::new().unwrap();
        let jar = env.create_archive("app.jar").unwrap();
        let bridge = Arc::new(RuntimeBridge::new(FakeRuntime::new()));
        let supervisor = ReloadSupervisor::new(Arc::downgrade(&bridge), fast());
        supervisor.start(&jar, "Main", "main").unwrap();
        drop(bridge);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while supervisor.is_running() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!supervisor.is_running());
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
    }
}
