//! End-to-end hot reload: modification time changes drive reload cycles.

use jinject_agent::testing::FakeRuntime;
use jinject_agent::{AgentContext, ReloadSupervisor, RuntimeBridge, SupervisorSettings};
use jinject_config::testing::TestEnvironment;
use jinject_ipc::{ErrorCode, InjectionPayload};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const POLL: Duration = Duration::from_millis(50);
const SETTLE: Duration = Duration::from_millis(20);
/// Slack for scheduling, the reload itself and `wait_until`'s own polling.
const LATENCY_MARGIN: Duration = Duration::from_millis(400);

struct Harness {
    env: TestEnvironment,
    jar: PathBuf,
    fake: FakeRuntime,
    bridge: Arc<RuntimeBridge<FakeRuntime>>,
    supervisor: ReloadSupervisor<FakeRuntime>,
}

fn harness(shutdown_timeout: Duration) -> Harness {
    let env = TestEnvironment::new().unwrap();
    let jar = env.create_archive("app.jar").unwrap();
    let fake = FakeRuntime::new();
    fake.define_class("Main", &["main"], &[]);

    let bridge = Arc::new(RuntimeBridge::new(fake.clone()));
    bridge.attach().unwrap();
    bridge.load_artifact(&jar).unwrap();

    let supervisor = ReloadSupervisor::new(
        Arc::downgrade(&bridge),
        SupervisorSettings {
            poll_interval: POLL,
            settle_delay: SETTLE,
            shutdown_timeout,
            start_timeout: Duration::from_secs(2),
        },
    );
    supervisor.start(&jar, "Main", "main").unwrap();
    Harness {
        env,
        jar,
        fake,
        bridge,
        supervisor,
    }
}

fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[test]
fn test_change_triggers_exactly_one_cycle() {
    let h = harness(Duration::from_secs(2));
    let baseline = h.supervisor.monitor().unwrap().last_modified;

    let bumped = h.env.bump_mtime(&h.jar, 10).unwrap();
    let touched = Instant::now();
    assert!(bumped > baseline);
    assert!(wait_until(Duration::from_secs(3), || h.supervisor.reload_count() == 1));
    // At most one poll interval to notice, then the settle delay.
    let latency = touched.elapsed();
    assert!(
        latency <= POLL + SETTLE + LATENCY_MARGIN,
        "cycle finished {latency:?} after the change"
    );

    // Several more polls over the same timestamp change nothing.
    thread::sleep(POLL * 5);
    assert_eq!(h.supervisor.reload_count(), 1);
    assert_eq!(h.supervisor.monitor().unwrap().last_modified, bumped);

    assert_eq!(h.fake.calls().len(), 1);
    assert_eq!(h.fake.loaders_created(), 2);
    assert_eq!(h.fake.open_loaders(), 1);
    assert_eq!(h.bridge.cached_classes(), 1);

    assert!(h.supervisor.stop());
    assert!(!h.supervisor.is_running());
}

#[test]
fn test_failed_invoke_still_advances_baseline() {
    let h = harness(Duration::from_secs(2));
    h.fake
        .throw_from("Main", "main", "java.lang.NullPointerException");

    let bumped = h.env.bump_mtime(&h.jar, 10).unwrap();
    assert!(wait_until(Duration::from_secs(3), || h.supervisor.reload_count() == 1));
    thread::sleep(POLL * 5);

    assert_eq!(h.supervisor.reload_count(), 1);
    assert_eq!(h.supervisor.monitor().unwrap().last_modified, bumped);
    assert_eq!(
        h.bridge.last_error().map(|e| e.code()),
        Some(ErrorCode::InvokeFailed)
    );
    assert_eq!(h.fake.pending_exception(), None);
    assert!(h.supervisor.is_running());

    // A later change is still picked up.
    h.env.bump_mtime(&h.jar, 10).unwrap();
    assert!(wait_until(Duration::from_secs(3), || h.supervisor.reload_count() == 2));
}

#[test]
fn test_missing_artifact_is_skipped() {
    let h = harness(Duration::from_secs(2));
    std::fs::remove_file(&h.jar).unwrap();
    thread::sleep(POLL * 4);
    assert!(h.supervisor.is_running());
    assert_eq!(h.supervisor.reload_count(), 0);

    std::fs::write(&h.jar, b"PK\x03\x04").unwrap();
    let restored = h.env.bump_mtime(&h.jar, 30).unwrap();
    assert!(wait_until(Duration::from_secs(3), || h.supervisor.reload_count() == 1));
    assert_eq!(h.supervisor.monitor().unwrap().last_modified, restored);
}

#[test]
fn test_stop_abandons_a_stuck_cycle() {
    let h = harness(Duration::from_millis(100));
    h.fake.slow_calls(Duration::from_millis(1500));
    h.env.bump_mtime(&h.jar, 10).unwrap();

    // Let the cycle get into the slow call.
    thread::sleep(POLL * 2 + SETTLE + Duration::from_millis(200));
    let started = Instant::now();
    assert!(!h.supervisor.stop(), "a thread stuck in a cycle is reported");
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!h.supervisor.is_running());

    // The abandoned thread finishes its cycle and exits on its own.
    assert!(wait_until(Duration::from_secs(5), || h.supervisor.reload_count() == 1));
}

#[test]
fn test_context_shutdown_fails_while_cycle_is_stuck() {
    let env = TestEnvironment::new().unwrap();
    let jar = env.create_archive("app.jar").unwrap();
    let fake = FakeRuntime::new();
    fake.define_class("Main", &["main"], &[]);
    let payload = InjectionPayload::new(&jar.to_string_lossy(), "Main", "main", true).unwrap();
    let settings = SupervisorSettings {
        poll_interval: POLL,
        settle_delay: SETTLE,
        shutdown_timeout: Duration::from_millis(100),
        start_timeout: Duration::from_secs(2),
    };
    let context = AgentContext::initialize(fake.clone(), &payload, settings).unwrap();

    fake.slow_calls(Duration::from_millis(1500));
    env.bump_mtime(&jar, 10).unwrap();
    thread::sleep(POLL * 2 + SETTLE + Duration::from_millis(200));

    let err = context.shutdown().unwrap_err();
    assert_eq!(err.code(), ErrorCode::ThreadTimeout);
}
