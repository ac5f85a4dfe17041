//! Bridge and context behavior against the scripted runtime.

use jinject_agent::runtime::{MAIN_SIGNATURE, NO_ARG_SIGNATURE};
use jinject_agent::testing::FakeRuntime;
use jinject_agent::{AgentContext, BridgeState, RuntimeBridge, SupervisorSettings};
use jinject_config::testing::TestEnvironment;
use jinject_ipc::{ErrorCode, InjectionPayload};
use std::time::Duration;

fn loaded(env: &TestEnvironment) -> RuntimeBridge<FakeRuntime> {
    let jar = env.create_archive("app.jar").unwrap();
    let fake = FakeRuntime::new();
    fake.define_class("com.example.Main", &["main", "run"], &[]);
    fake.define_class("com.example.Plugin", &[], &["start"]);
    let bridge = RuntimeBridge::new(fake);
    bridge.attach().unwrap();
    bridge.load_artifact(&jar).unwrap();
    bridge
}

fn settings() -> SupervisorSettings {
    SupervisorSettings {
        poll_interval: Duration::from_millis(20),
        settle_delay: Duration::from_millis(10),
        shutdown_timeout: Duration::from_secs(2),
        start_timeout: Duration::from_secs(2),
    }
}

#[test]
fn test_main_receives_string_array() {
    let env = TestEnvironment::new().unwrap();
    let bridge = loaded(&env);
    let args = vec!["--port".to_string(), "8080".to_string()];
    bridge.invoke("com.example.Main", "main", &args).unwrap();

    let calls = bridge.runtime().calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].is_static);
    assert_eq!(calls[0].signature, MAIN_SIGNATURE);
    assert_eq!(calls[0].args, Some(args));
    assert!(bridge.runtime().has_context_loader());
}

#[test]
fn test_other_methods_take_no_arguments() {
    let env = TestEnvironment::new().unwrap();
    let bridge = loaded(&env);
    bridge
        .invoke("com.example.Main", "run", &["ignored".to_string()])
        .unwrap();
    let call = &bridge.runtime().calls()[0];
    assert_eq!(call.signature, NO_ARG_SIGNATURE);
    assert_eq!(call.args, None);
}

#[test]
fn test_instance_method_fallback() {
    let env = TestEnvironment::new().unwrap();
    let bridge = loaded(&env);
    bridge.invoke("com.example.Plugin", "start", &[]).unwrap();
    let call = &bridge.runtime().calls()[0];
    assert!(!call.is_static);
    assert_eq!(call.class, "com.example.Plugin");
}

#[test]
fn test_exception_becomes_invoke_failed_and_is_cleared() {
    let env = TestEnvironment::new().unwrap();
    let bridge = loaded(&env);
    bridge.runtime().throw_from(
        "com.example.Main",
        "main",
        "java.lang.IllegalStateException: boom",
    );

    let err = bridge.invoke("com.example.Main", "main", &[]).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvokeFailed);
    assert!(err.message().contains("IllegalStateException"));
    assert_eq!(bridge.runtime().pending_exception(), None);
    assert_eq!(bridge.state(), BridgeState::Loaded);

    // The bridge stays usable after a foreign exception.
    bridge.invoke("com.example.Main", "run", &[]).unwrap();
    assert!(bridge.last_error().is_none());
}

#[test]
fn test_constructor_exception() {
    let env = TestEnvironment::new().unwrap();
    let bridge = loaded(&env);
    bridge
        .runtime()
        .throw_from("com.example.Plugin", "<init>", "java.lang.RuntimeException: ctor");
    let err = bridge.invoke("com.example.Plugin", "start", &[]).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvokeFailed);
    assert_eq!(bridge.runtime().pending_exception(), None);
}

#[test]
fn test_missing_class_and_method() {
    let env = TestEnvironment::new().unwrap();
    let bridge = loaded(&env);

    let err = bridge.invoke("com.example.Absent", "main", &[]).unwrap_err();
    assert_eq!(err.code(), ErrorCode::ClassNotFound);
    assert!(err.message().contains("ClassNotFoundException"));
    assert_eq!(bridge.runtime().pending_exception(), None);

    let err = bridge.invoke("com.example.Main", "stop", &[]).unwrap_err();
    assert_eq!(err.code(), ErrorCode::MethodNotFound);
}

#[test]
fn test_load_unload_load_leaves_one_scope() {
    let env = TestEnvironment::new().unwrap();
    let bridge = loaded(&env);
    let jar = bridge.active_artifact().unwrap();
    bridge.invoke("com.example.Main", "main", &[]).unwrap();

    bridge.unload().unwrap();
    assert_eq!(bridge.active_artifact(), None);
    bridge.load_artifact(&jar).unwrap();

    assert_eq!(bridge.active_artifact(), Some(jar));
    assert_eq!(bridge.cached_classes(), 0);
    assert_eq!(bridge.runtime().open_loaders(), 1);
    assert_eq!(bridge.runtime().loaders_created(), 2);
}

#[test]
fn test_failed_load_keeps_previous_scope() {
    let env = TestEnvironment::new().unwrap();
    let bridge = loaded(&env);
    let jar = bridge.active_artifact().unwrap();

    bridge
        .runtime()
        .fail_loaders(Some("java.lang.SecurityException: denied"));
    let err = bridge.load_artifact(&jar).unwrap_err();
    assert_eq!(err.code(), ErrorCode::ArtifactLoadFailed);
    assert!(err.to_string().contains("SecurityException"), "{err}");
    assert!(err.to_string().contains("class loader for file:"), "{err}");
    assert_eq!(bridge.runtime().pending_exception(), None);

    assert_eq!(bridge.active_artifact(), Some(jar));
    assert_eq!(bridge.state(), BridgeState::Loaded);
    bridge.invoke("com.example.Main", "main", &[]).unwrap();
}

#[test]
fn test_context_without_hot_reload() {
    let env = TestEnvironment::new().unwrap();
    let jar = env.create_archive("app.jar").unwrap();
    let fake = FakeRuntime::new();
    fake.define_class("Main", &["main"], &[]);
    let payload = InjectionPayload::new(&jar.to_string_lossy(), "Main", "main", false).unwrap();

    let context = AgentContext::initialize(fake.clone(), &payload, settings()).unwrap();
    assert!(!context.supervisor().is_running());
    assert_eq!(context.bridge().state(), BridgeState::Loaded);
    assert_eq!(fake.calls().len(), 1);

    context.shutdown().unwrap();
    assert_eq!(fake.open_loaders(), 0);
    assert_eq!(fake.detach_calls(), 1);
}

#[test]
fn test_context_failing_entry_point() {
    let env = TestEnvironment::new().unwrap();
    let jar = env.create_archive("app.jar").unwrap();
    let fake = FakeRuntime::new();
    fake.define_class("Main", &["main"], &[]);
    fake.throw_from("Main", "main", "java.lang.Error: broken build");

    let once = InjectionPayload::new(&jar.to_string_lossy(), "Main", "main", false).unwrap();
    let err = AgentContext::initialize(fake.clone(), &once, settings())
        .err()
        .unwrap();
    assert_eq!(err.code(), ErrorCode::InvokeFailed);
    assert_eq!(fake.open_loaders(), 0);

    // With hot reload the context survives, waiting for a fixed artifact.
    let watched = InjectionPayload::new(&jar.to_string_lossy(), "Main", "main", true).unwrap();
    let context = AgentContext::initialize(fake.clone(), &watched, settings()).unwrap();
    assert!(context.supervisor().is_running());
    context.shutdown().unwrap();
}

#[test]
fn test_context_without_vm() {
    let env = TestEnvironment::new().unwrap();
    let jar = env.create_archive("app.jar").unwrap();
    let payload = InjectionPayload::new(&jar.to_string_lossy(), "Main", "main", true).unwrap();
    let err = AgentContext::initialize(FakeRuntime::new().without_vm(), &payload, settings())
        .err()
        .unwrap();
    assert_eq!(err.code(), ErrorCode::JvmInitFailed);
}
