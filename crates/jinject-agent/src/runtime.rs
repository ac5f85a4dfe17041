//! The managed-runtime seam.
//!
//! [`ManagedRuntime`] is the narrow set of native-interface operations the
//! bridge needs. Implementations may leave a Java exception pending after any
//! call; the bridge probes and clears it through
//! [`ManagedRuntime::take_pending_exception`] immediately afterwards.

use jinject_ipc::{ErrorCode, ErrorRecord};
use thiserror::Error;

/// Signature of the conventional `main(String[])` entry point.
pub const MAIN_SIGNATURE: &str = "([Ljava/lang/String;)V";

/// Signature used for every other entry point.
pub const NO_ARG_SIGNATURE: &str = "()V";

/// Name of the entry point that receives a `String[]`.
pub const ENTRY_POINT: &str = "main";

/// How the calling thread ended up attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachKind {
    /// Thread was already attached before we asked
    AlreadyAttached,
    /// We attached the thread to an existing VM
    AttachedThread,
    /// No VM existed; we created one (the creating thread is attached)
    CreatedVm,
}

impl AttachKind {
    /// Whether detaching later is our responsibility.
    pub fn attached_here(self) -> bool {
        !matches!(self, AttachKind::AlreadyAttached)
    }
}

#[derive(Debug, Error)]
pub enum RuntimeFault {
    #[error("no Java VM available: {0}")]
    VmUnavailable(String),

    #[error("JNI_CreateJavaVM returned {0}")]
    CreateFailed(i32),

    #[error("JNI call failed: {0}")]
    Jni(String),
}

impl RuntimeFault {
    /// Classify as `code`, unless the VM itself is missing.
    #[track_caller]
    pub fn into_record(self, code: ErrorCode) -> ErrorRecord {
        let code = match self {
            RuntimeFault::VmUnavailable(_) | RuntimeFault::CreateFailed(_) => {
                ErrorCode::JvmInitFailed
            }
            RuntimeFault::Jni(_) => code,
        };
        ErrorRecord::new(code, self.to_string())
    }
}

/// Native-interface operations on the process's managed runtime.
///
/// Every method acts on behalf of the calling thread. Object handles are
/// global references and may be moved between threads.
pub trait ManagedRuntime: Send + Sync + 'static {
    type Object: Clone + Send + Sync;
    type StaticMethod: Copy;
    type Method: Copy;

    /// Attach the calling thread, discovering or creating the VM.
    fn attach(&self) -> Result<AttachKind, RuntimeFault>;

    fn detach(&self) -> Result<(), RuntimeFault>;

    /// New `URLClassLoader` over exactly one `file:` URL.
    fn new_class_loader(&self, url: &str) -> Result<Self::Object, RuntimeFault>;

    fn set_context_class_loader(&self, loader: &Self::Object) -> Result<(), RuntimeFault>;

    /// Close the loader so the archive's file handle is released.
    fn close_class_loader(&self, loader: &Self::Object) -> Result<(), RuntimeFault>;

    fn load_class(&self, loader: &Self::Object, name: &str) -> Result<Self::Object, RuntimeFault>;

    /// `None` when the class has no such static method.
    fn static_method(
        &self,
        class: &Self::Object,
        name: &str,
        signature: &str,
    ) -> Result<Option<Self::StaticMethod>, RuntimeFault>;

    /// `None` when the class has no such instance method.
    fn instance_method(
        &self,
        class: &Self::Object,
        name: &str,
        signature: &str,
    ) -> Result<Option<Self::Method>, RuntimeFault>;

    /// Construct through the zero-argument constructor.
    fn new_instance(&self, class: &Self::Object) -> Result<Self::Object, RuntimeFault>;

    /// `args` is marshalled into a `String[]` when present.
    fn call_static(
        &self,
        class: &Self::Object,
        method: Self::StaticMethod,
        args: Option<&[String]>,
    ) -> Result<(), RuntimeFault>;

    fn call_instance(
        &self,
        instance: &Self::Object,
        method: Self::Method,
        args: Option<&[String]>,
    ) -> Result<(), RuntimeFault>;

    /// Probe for a pending exception; if present, clear it and describe it.
    fn take_pending_exception(&self) -> Option<String>;
}
