//! Scripted [`ManagedRuntime`] for exercising the bridge and supervisor
//! without a Java VM.
//!
//! # Usage
//!
//! ```ignore
//! use jinject_agent::testing::FakeRuntime;
//!
//! let fake = FakeRuntime::new();
//! fake.define_class("com.example.Main", &["main"], &[]);
//! let bridge = RuntimeBridge::new(fake.clone());
//! ```
//!
//! Like JNI, a Java exception leaves the fake "pending" until
//! [`ManagedRuntime::take_pending_exception`] clears it.

use crate::runtime::{AttachKind, ManagedRuntime, RuntimeFault};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Handle to a fake loader, class or instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeObject {
    id: u64,
    class: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FakeMethod(usize);

/// One call that reached the fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeCall {
    pub class: String,
    pub method: String,
    pub signature: String,
    pub is_static: bool,
    pub args: Option<Vec<String>>,
}

#[derive(Debug, Default)]
struct ClassDef {
    static_methods: Vec<String>,
    instance_methods: Vec<String>,
}

#[derive(Debug, Default)]
struct FakeState {
    vm_missing: bool,
    attached: bool,
    attach_calls: usize,
    detach_calls: usize,
    next_id: u64,
    loaders: HashMap<u64, bool>,
    context_loader: Option<u64>,
    fail_loader: Option<String>,
    classes: HashMap<String, ClassDef>,
    class_loads: usize,
    methods: Vec<(String, String, String, bool)>,
    throws: HashMap<(String, String), String>,
    pending: Option<String>,
    calls: Vec<FakeCall>,
    call_delay: Duration,
}

impl FakeState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn throw(&mut self, exception: impl Into<String>) -> RuntimeFault {
        self.pending = Some(exception.into());
        RuntimeFault::Jni("java exception pending".into())
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeRuntime {
    state: Arc<Mutex<FakeState>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// No VM can be discovered or created.
    pub fn without_vm(self) -> Self {
        self.lock().vm_missing = true;
        self
    }

    /// Every new class loader throws `exception` until cleared with `None`.
    pub fn fail_loaders(&self, exception: Option<&str>) {
        self.lock().fail_loader = exception.map(str::to_string);
    }

    /// Make `class` resolvable with the given methods.
    pub fn define_class(&self, class: &str, static_methods: &[&str], instance_methods: &[&str]) {
        self.lock().classes.insert(
            class.to_string(),
            ClassDef {
                static_methods: static_methods.iter().map(|m| m.to_string()).collect(),
                instance_methods: instance_methods.iter().map(|m| m.to_string()).collect(),
            },
        );
    }

    /// Calls to `class.method` throw `exception`.
    pub fn throw_from(&self, class: &str, method: &str, exception: &str) {
        self.lock().throws.insert(
            (class.to_string(), method.to_string()),
            exception.to_string(),
        );
    }

    /// Every entry-point call blocks for `delay` first.
    pub fn slow_calls(&self, delay: Duration) {
        self.lock().call_delay = delay;
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn attach_calls(&self) -> usize {
        self.lock().attach_calls
    }

    pub fn detach_calls(&self) -> usize {
        self.lock().detach_calls
    }

    pub fn loaders_created(&self) -> usize {
        self.lock().loaders.len()
    }

    /// Loaders created and not yet closed.
    pub fn open_loaders(&self) -> usize {
        self.lock().loaders.values().filter(|closed| !**closed).count()
    }

    pub fn class_loads(&self) -> usize {
        self.lock().class_loads
    }

    pub fn calls(&self) -> Vec<FakeCall> {
        self.lock().calls.clone()
    }

    /// Exception still pending, i.e. nobody cleared it.
    pub fn pending_exception(&self) -> Option<String> {
        self.lock().pending.clone()
    }

    pub fn has_context_loader(&self) -> bool {
        self.lock().context_loader.is_some()
    }

    fn call(
        &self,
        target: &FakeObject,
        method: usize,
        is_static: bool,
        args: Option<&[String]>,
    ) -> Result<(), RuntimeFault> {
        let delay = self.lock().call_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let mut state = self.lock();
        let Some((class, name, signature, _)) = state.methods.get(method).cloned() else {
            return Err(RuntimeFault::Jni(format!("unknown method id {method}")));
        };
        if target.class.as_deref() != Some(class.as_str()) {
            return Err(RuntimeFault::Jni("method called on the wrong class".into()));
        }
        state.calls.push(FakeCall {
            class: class.clone(),
            method: name.clone(),
            signature,
            is_static,
            args: args.map(<[String]>::to_vec),
        });
        if let Some(exception) = state.throws.get(&(class, name)).cloned() {
            return Err(state.throw(exception));
        }
        Ok(())
    }

    fn lookup(
        &self,
        class: &FakeObject,
        name: &str,
        signature: &str,
        is_static: bool,
    ) -> Result<Option<usize>, RuntimeFault> {
        let mut state = self.lock();
        let Some(class_name) = class.class.clone() else {
            return Err(RuntimeFault::Jni("not a class".into()));
        };
        let found = state.classes.get(&class_name).is_some_and(|def| {
            let methods = if is_static {
                &def.static_methods
            } else {
                &def.instance_methods
            };
            methods.iter().any(|m| m == name)
        });
        if !found {
            return Ok(None);
        }
        state.methods.push((
            class_name,
            name.to_string(),
            signature.to_string(),
            is_static,
        ));
        Ok(Some(state.methods.len() - 1))
    }
}

impl ManagedRuntime for FakeRuntime {
    type Object = FakeObject;
    type StaticMethod = FakeMethod;
    type Method = FakeMethod;

    fn attach(&self) -> Result<AttachKind, RuntimeFault> {
        let mut state = self.lock();
        if state.vm_missing {
            return Err(RuntimeFault::VmUnavailable("no JVM in fake process".into()));
        }
        state.attach_calls += 1;
        if state.attached {
            return Ok(AttachKind::AlreadyAttached);
        }
        state.attached = true;
        Ok(AttachKind::AttachedThread)
    }

    fn detach(&self) -> Result<(), RuntimeFault> {
        let mut state = self.lock();
        state.detach_calls += 1;
        state.attached = false;
        Ok(())
    }

    fn new_class_loader(&self, url: &str) -> Result<FakeObject, RuntimeFault> {
        let mut state = self.lock();
        if let Some(exception) = state.fail_loader.clone() {
            return Err(state.throw(exception));
        }
        if !url.starts_with("file:///") {
            return Err(state.throw(format!("java.net.MalformedURLException: {url}")));
        }
        let id = state.next_id();
        state.loaders.insert(id, false);
        Ok(FakeObject { id, class: None })
    }

    fn set_context_class_loader(&self, loader: &FakeObject) -> Result<(), RuntimeFault> {
        self.lock().context_loader = Some(loader.id);
        Ok(())
    }

    fn close_class_loader(&self, loader: &FakeObject) -> Result<(), RuntimeFault> {
        match self.lock().loaders.get_mut(&loader.id) {
            Some(closed) => {
                *closed = true;
                Ok(())
            }
            None => Err(RuntimeFault::Jni("not a class loader".into())),
        }
    }

    fn load_class(&self, loader: &FakeObject, name: &str) -> Result<FakeObject, RuntimeFault> {
        let mut state = self.lock();
        if state.loaders.get(&loader.id) != Some(&false) {
            return Err(state.throw("java.lang.IllegalStateException: loader closed"));
        }
        state.class_loads += 1;
        if !state.classes.contains_key(name) {
            return Err(state.throw(format!("java.lang.ClassNotFoundException: {name}")));
        }
        let id = state.next_id();
        Ok(FakeObject {
            id,
            class: Some(name.to_string()),
        })
    }

    fn static_method(
        &self,
        class: &FakeObject,
        name: &str,
        signature: &str,
    ) -> Result<Option<FakeMethod>, RuntimeFault> {
        Ok(self.lookup(class, name, signature, true)?.map(FakeMethod))
    }

    fn instance_method(
        &self,
        class: &FakeObject,
        name: &str,
        signature: &str,
    ) -> Result<Option<FakeMethod>, RuntimeFault> {
        Ok(self.lookup(class, name, signature, false)?.map(FakeMethod))
    }

    fn new_instance(&self, class: &FakeObject) -> Result<FakeObject, RuntimeFault> {
        let mut state = self.lock();
        let Some(name) = class.class.clone() else {
            return Err(RuntimeFault::Jni("not a class".into()));
        };
        if let Some(exception) = state.throws.get(&(name.clone(), "<init>".to_string())).cloned() {
            return Err(state.throw(exception));
        }
        let id = state.next_id();
        Ok(FakeObject {
            id,
            class: Some(name),
        })
    }

    fn call_static(
        &self,
        class: &FakeObject,
        method: FakeMethod,
        args: Option<&[String]>,
    ) -> Result<(), RuntimeFault> {
        self.call(class, method.0, true, args)
    }

    fn call_instance(
        &self,
        instance: &FakeObject,
        method: FakeMethod,
        args: Option<&[String]>,
    ) -> Result<(), RuntimeFault> {
        self.call(instance, method.0, false, args)
    }

    fn take_pending_exception(&self) -> Option<String> {
        self.lock().pending.take()
    }
}
