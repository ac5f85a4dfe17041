//! Attach, class-loading scope and invocation on top of a [`ManagedRuntime`].

use crate::runtime::{ManagedRuntime, RuntimeFault, ENTRY_POINT, MAIN_SIGNATURE, NO_ARG_SIGNATURE};
use jinject_config::logging::Component;
use jinject_config::{log_bridge_debug, log_bridge_info, log_bridge_warn};
use jinject_gate::{IdentifierKind, ARCHIVE_EXTENSIONS};
use jinject_ipc::{ErrorCode, ErrorRecord, LastError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Unattached,
    Attached,
    Loaded,
    Invoking,
}

#[derive(Debug, Default)]
struct Lifecycle {
    attached: bool,
    attached_here: bool,
    loaded: bool,
    invocations: usize,
}

impl Lifecycle {
    fn state(&self) -> BridgeState {
        match (self.attached, self.loaded, self.invocations) {
            (false, _, _) => BridgeState::Unattached,
            (true, false, _) => BridgeState::Attached,
            (true, true, 0) => BridgeState::Loaded,
            (true, true, _) => BridgeState::Invoking,
        }
    }
}

/// The loader for one artifact. `generation` tells cache fills which scope
/// they were resolved against.
struct ClassScope<O> {
    artifact: PathBuf,
    loader: O,
    generation: u64,
}

struct ScopeSlot<O> {
    active: Option<ClassScope<O>>,
    generation: u64,
}

/// Owns the attachment to the runtime and the active class-loading scope.
///
/// State, scope and class cache each sit behind their own lock. Only attach
/// and detach call into the runtime with a lock held.
pub struct RuntimeBridge<R: ManagedRuntime> {
    runtime: R,
    lifecycle: Mutex<Lifecycle>,
    scope: Mutex<ScopeSlot<R::Object>>,
    cache: Mutex<HashMap<String, R::Object>>,
    last_error: LastError,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<R: ManagedRuntime> RuntimeBridge<R> {
    pub fn new(runtime: R) -> Self {
        Self {
            runtime,
            lifecycle: Mutex::new(Lifecycle::default()),
            scope: Mutex::new(ScopeSlot {
                active: None,
                generation: 0,
            }),
            cache: Mutex::new(HashMap::new()),
            last_error: LastError::new(),
        }
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn state(&self) -> BridgeState {
        lock(&self.lifecycle).state()
    }

    pub fn last_error(&self) -> Option<ErrorRecord> {
        self.last_error.get()
    }

    /// Artifact of the active scope, if any.
    pub fn active_artifact(&self) -> Option<PathBuf> {
        lock(&self.scope).active.as_ref().map(|s| s.artifact.clone())
    }

    pub fn cached_classes(&self) -> usize {
        lock(&self.cache).len()
    }

    /// Attach the calling thread. A no-op when already attached.
    pub fn attach(&self) -> Result<(), ErrorRecord> {
        let result = self.attach_inner();
        self.finish(result)
    }

    fn attach_inner(&self) -> Result<(), ErrorRecord> {
        let mut life = lock(&self.lifecycle);
        if life.attached {
            return Ok(());
        }
        let kind = self
            .checked(ErrorCode::JvmInitFailed, |rt| rt.attach())
            .map_err(|e| e.with_context("attach"))?;
        life.attached = true;
        life.attached_here = kind.attached_here();
        log_bridge_info!("Attached to Java VM", kind = format!("{kind:?}"));
        Ok(())
    }

    /// Load `path` into a fresh class loader and make it the active scope.
    ///
    /// The previous scope stays installed until the new one is ready; it is
    /// released afterwards, so lookups never see a window without a scope.
    pub fn load_artifact(&self, path: &Path) -> Result<(), ErrorRecord> {
        let result = self.load_inner(path);
        self.finish(result)
    }

    fn load_inner(&self, path: &Path) -> Result<(), ErrorRecord> {
        if !lock(&self.lifecycle).attached {
            return Err(not_attached());
        }
        let artifact = jinject_gate::validate_path(path, ARCHIVE_EXTENSIONS)?;
        let url = file_url(&artifact);

        let loader = self
            .checked(ErrorCode::ArtifactLoadFailed, |rt| rt.new_class_loader(&url))
            .map_err(|e| e.with_context(format!("class loader for {url}")))?;
        if let Err(e) = self.checked(ErrorCode::JvmException, |rt| {
            rt.set_context_class_loader(&loader)
        }) {
            self.close_loader(&loader);
            return Err(e.with_context("set context class loader"));
        }

        let previous = {
            let mut slot = lock(&self.scope);
            slot.generation += 1;
            let generation = slot.generation;
            let previous = slot.active.replace(ClassScope {
                artifact: artifact.clone(),
                loader,
                generation,
            });
            lock(&self.cache).clear();
            previous
        };
        lock(&self.lifecycle).loaded = true;

        if let Some(old) = previous {
            self.close_loader(&old.loader);
            log_bridge_debug!("Released previous scope", artifact = old.artifact.display().to_string());
        }
        log_bridge_info!("Artifact loaded", artifact = artifact.display().to_string());
        Ok(())
    }

    /// Call `method` on `class` from the active scope.
    ///
    /// `main` receives `args` as a `String[]`; any other method takes no
    /// arguments. A static method is preferred; otherwise the class is
    /// constructed with its zero-argument constructor.
    pub fn invoke(&self, class: &str, method: &str, args: &[String]) -> Result<(), ErrorRecord> {
        let result = self.invoke_inner(class, method, args);
        self.finish(result)
    }

    fn invoke_inner(&self, class: &str, method: &str, args: &[String]) -> Result<(), ErrorRecord> {
        jinject_gate::validate_identifier(class, IdentifierKind::Class, IdentifierKind::Class.max_len())?;
        jinject_gate::validate_identifier(method, IdentifierKind::Method, IdentifierKind::Method.max_len())?;

        {
            let mut life = lock(&self.lifecycle);
            match life.state() {
                BridgeState::Unattached => return Err(not_attached()),
                BridgeState::Attached => {
                    return Err(ErrorRecord::new(
                        ErrorCode::ArtifactNotLoaded,
                        "no artifact is loaded",
                    ))
                }
                BridgeState::Loaded | BridgeState::Invoking => life.invocations += 1,
            }
        }
        let result = self.call_entry(class, method, args);
        let mut life = lock(&self.lifecycle);
        life.invocations = life.invocations.saturating_sub(1);
        drop(life);

        match &result {
            Ok(()) => log_bridge_info!("Invocation finished", class = class, method = method),
            Err(e) => log_bridge_warn!("Invocation failed", class = class, method = method, error = e.to_string()),
        }
        result
    }

    fn call_entry(&self, class: &str, method: &str, args: &[String]) -> Result<(), ErrorRecord> {
        let class_ref = self.resolve_class(class)?;
        let args = (method == ENTRY_POINT).then_some(args);
        let signature = if args.is_some() {
            MAIN_SIGNATURE
        } else {
            NO_ARG_SIGNATURE
        };

        if let Some(id) = self.checked(ErrorCode::MethodNotFound, |rt| {
            rt.static_method(&class_ref, method, signature)
        })? {
            return self.checked(ErrorCode::InvokeFailed, |rt| rt.call_static(&class_ref, id, args));
        }

        let id = self
            .checked(ErrorCode::MethodNotFound, |rt| {
                rt.instance_method(&class_ref, method, signature)
            })?
            .ok_or_else(|| {
                ErrorRecord::new(
                    ErrorCode::MethodNotFound,
                    format!("{class} has no method {method}{signature}"),
                )
            })?;
        let instance = self
            .checked(ErrorCode::InvokeFailed, |rt| rt.new_instance(&class_ref))
            .map_err(|e| e.with_context(format!("construct {class}")))?;
        self.checked(ErrorCode::InvokeFailed, |rt| rt.call_instance(&instance, id, args))
    }

    /// Class from the cache, loading through the active scope on a miss.
    fn resolve_class(&self, name: &str) -> Result<R::Object, ErrorRecord> {
        let (loader, generation) = {
            let slot = lock(&self.scope);
            let scope = slot.active.as_ref().ok_or_else(|| {
                ErrorRecord::new(ErrorCode::ArtifactNotLoaded, "no artifact is loaded")
            })?;
            (scope.loader.clone(), scope.generation)
        };
        if let Some(class) = lock(&self.cache).get(name) {
            return Ok(class.clone());
        }

        let class = self.checked(ErrorCode::ClassNotFound, |rt| rt.load_class(&loader, name))?;
        // Only cache against the scope it was loaded from.
        let slot = lock(&self.scope);
        if slot.active.as_ref().map(|s| s.generation) == Some(generation) {
            lock(&self.cache).insert(name.to_string(), class.clone());
        }
        Ok(class)
    }

    /// Release cached classes and the active scope.
    pub fn unload(&self) -> Result<(), ErrorRecord> {
        let previous = {
            let mut slot = lock(&self.scope);
            lock(&self.cache).clear();
            slot.active.take()
        };
        lock(&self.lifecycle).loaded = false;
        if let Some(old) = previous {
            self.close_loader(&old.loader);
            log_bridge_info!("Artifact unloaded", artifact = old.artifact.display().to_string());
        }
        self.finish(Ok(()))
    }

    /// Unload, then detach the calling thread if this bridge attached it.
    pub fn detach(&self) -> Result<(), ErrorRecord> {
        let result = self.detach_inner();
        self.finish(result)
    }

    fn detach_inner(&self) -> Result<(), ErrorRecord> {
        self.unload()?;
        let mut life = lock(&self.lifecycle);
        if !life.attached {
            return Ok(());
        }
        if life.attached_here {
            self.checked(ErrorCode::UnknownError, |rt| rt.detach())
                .map_err(|e| e.with_context("detach"))?;
        }
        *life = Lifecycle::default();
        log_bridge_info!("Detached from Java VM");
        Ok(())
    }

    /// Run one runtime call, then probe and clear any pending exception.
    fn checked<T>(
        &self,
        code: ErrorCode,
        call: impl FnOnce(&R) -> Result<T, RuntimeFault>,
    ) -> Result<T, ErrorRecord> {
        let result = call(&self.runtime);
        if let Some(exception) = self.runtime.take_pending_exception() {
            return Err(ErrorRecord::new(code, exception).with_context("java exception"));
        }
        result.map_err(|fault| fault.into_record(code))
    }

    fn close_loader(&self, loader: &R::Object) {
        if let Err(e) = self.checked(ErrorCode::JvmException, |rt| rt.close_class_loader(loader)) {
            log_bridge_warn!("Closing class loader failed", error = e.to_string());
        }
    }

    fn finish<T>(&self, result: Result<T, ErrorRecord>) -> Result<T, ErrorRecord> {
        self.last_error
            .track(result.map_err(|e| e.with_origin(Component::BRIDGE)))
    }
}

fn not_attached() -> ErrorRecord {
    ErrorRecord::new(ErrorCode::JvmNotInitialized, "not attached to a Java VM")
}

/// `file:` URL for a local path, as `URLClassLoader` expects it.
pub(crate) fn file_url(path: &Path) -> String {
    let text = path.to_string_lossy().replace('\\', "/");
    let mut url = String::with_capacity(text.len() + 8);
    url.push_str("file://");
    if !text.starts_with('/') {
        url.push('/');
    }
    for c in text.chars() {
        match c {
            ' ' => url.push_str("%20"),
            '%' => url.push_str("%25"),
            '#' => url.push_str("%23"),
            c => url.push(c),
        }
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRuntime;
    use jinject_config::testing::TestEnvironment;

    fn loaded_bridge(env: &TestEnvironment) -> (RuntimeBridge<FakeRuntime>, PathBuf) {
        let jar = env.create_archive("app.jar").unwrap();
        let bridge = RuntimeBridge::new(FakeRuntime::new());
        bridge.attach().unwrap();
        bridge.load_artifact(&jar).unwrap();
        (bridge, jar)
    }

    #[test]
    fn test_file_url() {
        assert_eq!(
            file_url(Path::new(r"C:\apps\my app.jar")),
            "file:///C:/apps/my%20app.jar"
        );
        assert_eq!(file_url(Path::new("/opt/a#1.jar")), "file:///opt/a%231.jar");
    }

    #[test]
    fn test_state_transitions() {
        let env = TestEnvironment::new().unwrap();
        let jar = env.create_archive("app.jar").unwrap();
        let bridge = RuntimeBridge::new(FakeRuntime::new());
        assert_eq!(bridge.state(), BridgeState::Unattached);

        bridge.attach().unwrap();
        bridge.attach().unwrap();
        assert_eq!(bridge.state(), BridgeState::Attached);
        assert_eq!(bridge.runtime().attach_calls(), 1);

        bridge.load_artifact(&jar).unwrap();
        assert_eq!(bridge.state(), BridgeState::Loaded);

        bridge.unload().unwrap();
        assert_eq!(bridge.state(), BridgeState::Attached);

        bridge.detach().unwrap();
        assert_eq!(bridge.state(), BridgeState::Unattached);
        assert_eq!(bridge.runtime().detach_calls(), 1);
    }

    #[test]
    fn test_operations_require_attach_and_load() {
        let env = TestEnvironment::new().unwrap();
        let jar = env.create_archive("app.jar").unwrap();
        let bridge = RuntimeBridge::new(FakeRuntime::new());

        let err = bridge.load_artifact(&jar).unwrap_err();
        assert_eq!(err.code(), ErrorCode::JvmNotInitialized);
        assert_eq!(err.origin(), Component::BRIDGE);

        bridge.attach().unwrap();
        let err = bridge.invoke("Main", "main", &[]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ArtifactNotLoaded);
        assert_eq!(bridge.state(), BridgeState::Attached);
    }

    #[test]
    fn test_attach_failure_leaves_state_unchanged() {
        let bridge = RuntimeBridge::new(FakeRuntime::new().without_vm());
        let err = bridge.attach().unwrap_err();
        assert_eq!(err.code(), ErrorCode::JvmInitFailed);
        assert_eq!(bridge.state(), BridgeState::Unattached);
        assert_eq!(bridge.last_error().map(|e| e.code()), Some(ErrorCode::JvmInitFailed));
    }

    #[test]
    fn test_reload_same_path_gives_fresh_scope() {
        let env = TestEnvironment::new().unwrap();
        let (bridge, jar) = loaded_bridge(&env);
        bridge.runtime().define_class("Main", &["main"], &[]);
        bridge.invoke("Main", "main", &[]).unwrap();
        assert_eq!(bridge.cached_classes(), 1);

        bridge.load_artifact(&jar).unwrap();
        assert_eq!(bridge.cached_classes(), 0);
        assert_eq!(bridge.runtime().loaders_created(), 2);
        assert_eq!(bridge.runtime().open_loaders(), 1);
    }

    #[test]
    fn test_load_rejects_non_archive() {
        let env = TestEnvironment::new().unwrap();
        let bridge = RuntimeBridge::new(FakeRuntime::new());
        bridge.attach().unwrap();
        let txt = env.create_file("notes.txt", b"hi").unwrap();
        let err = bridge.load_artifact(&txt).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParameter);
        let missing = env.artifacts_dir.join("missing.jar");
        let err = bridge.load_artifact(&missing).unwrap_err();
        assert_eq!(err.code(), ErrorCode::FileNotFound);
        assert_eq!(bridge.runtime().loaders_created(), 0);
    }

    #[test]
    fn test_class_cache_hits() {
        let env = TestEnvironment::new().unwrap();
        let (bridge, _jar) = loaded_bridge(&env);
        bridge.runtime().define_class("com.example.Main", &["main"], &[]);
        bridge.invoke("com.example.Main", "main", &[]).unwrap();
        bridge.invoke("com.example.Main", "main", &[]).unwrap();
        assert_eq!(bridge.runtime().class_loads(), 1);
    }

    #[test]
    fn test_invalid_names_rejected_before_runtime() {
        let env = TestEnvironment::new().unwrap();
        let (bridge, _jar) = loaded_bridge(&env);
        let err = bridge.invoke("com..Main", "main", &[]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParameter);
        let err = bridge.invoke("Main", "run;rm", &[]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParameter);
        assert_eq!(bridge.runtime().class_loads(), 0);
    }
}
