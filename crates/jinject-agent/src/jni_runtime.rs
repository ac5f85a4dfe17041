//! [`ManagedRuntime`] over the real JVM, through the `jni` crate.
//!
//! The VM is found in the host process with `JNI_GetCreatedJavaVMs`, looked
//! up in the already-loaded JVM library. When the process has no VM, one is
//! created with `JNI_CreateJavaVM` using the configured class path.

use crate::runtime::{AttachKind, ManagedRuntime, RuntimeFault};
use jinject_config::{log_bridge_debug, log_bridge_info, RuntimeConfig};
use jni::errors::Error as JniError;
use jni::objects::{GlobalRef, JClass, JMethodID, JObject, JObjectArray, JStaticMethodID, JString, JThrowable, JValue};
use jni::signature::{Primitive, ReturnType};
use jni::{sys, JNIEnv, JavaVM};
use libloading::Library;
use once_cell::sync::OnceCell;
use std::ffi::{c_char, c_void, CString};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

type GetCreatedJavaVms =
    unsafe extern "system" fn(*mut *mut sys::JavaVM, sys::jsize, *mut sys::jsize) -> sys::jint;
type CreateJavaVm =
    unsafe extern "system" fn(*mut *mut sys::JavaVM, *mut *mut c_void, *mut c_void) -> sys::jint;

const GET_CREATED_VMS: &[u8] = b"JNI_GetCreatedJavaVMs\0";
const CREATE_VM: &[u8] = b"JNI_CreateJavaVM\0";

impl From<JniError> for RuntimeFault {
    fn from(e: JniError) -> Self {
        RuntimeFault::Jni(e.to_string())
    }
}

pub struct JniRuntime {
    config: RuntimeConfig,
    vm: OnceCell<JavaVM>,
    // Keeps the JVM library mapped for as long as `vm` is used.
    library: Mutex<Option<Library>>,
}

impl JniRuntime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            vm: OnceCell::new(),
            library: Mutex::new(None),
        }
    }

    /// The process's VM, and whether we just created it.
    fn ensure_vm(&self) -> Result<(&JavaVM, bool), RuntimeFault> {
        if let Some(vm) = self.vm.get() {
            return Ok((vm, false));
        }
        let mut library = self.library.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(vm) = self.vm.get() {
            return Ok((vm, false));
        }

        let lib = open_jvm_library(&self.config)?;
        let (vm, created) = match unsafe { discover_vm(&lib)? } {
            Some(vm) => {
                log_bridge_info!("Found running Java VM");
                (vm, false)
            }
            None => {
                let vm = unsafe { create_vm(&lib, &self.config)? };
                log_bridge_info!("Created Java VM", class_path = self.config.class_path.len());
                (vm, true)
            }
        };
        *library = Some(lib);
        Ok((self.vm.get_or_init(|| vm), created))
    }

    /// Env for the calling thread, attaching it as a daemon if needed.
    fn env(&self) -> Result<JNIEnv<'_>, RuntimeFault> {
        let vm = self
            .vm
            .get()
            .ok_or_else(|| RuntimeFault::VmUnavailable("not attached".into()))?;
        match vm.get_env() {
            Ok(env) => Ok(env),
            Err(_) => Ok(vm.attach_current_thread_as_daemon()?),
        }
    }
}

fn open_jvm_library(config: &RuntimeConfig) -> Result<Library, RuntimeFault> {
    let unavailable = |path: &std::path::Path, e: libloading::Error| {
        RuntimeFault::VmUnavailable(format!("{}: {e}", path.display()))
    };
    if let Some(path) = &config.jvm_library {
        return unsafe { Library::new(path) }.map_err(|e| unavailable(path, e));
    }
    if let Some(lib) = loaded_jvm_library() {
        return Ok(lib);
    }
    let path = java_home_library().ok_or_else(|| {
        RuntimeFault::VmUnavailable("no JVM library is loaded and JAVA_HOME has none".into())
    })?;
    log_bridge_debug!("Loading JVM library", path = path.display().to_string());
    unsafe { Library::new(&path) }.map_err(|e| unavailable(&path, e))
}

#[cfg(windows)]
fn loaded_jvm_library() -> Option<Library> {
    libloading::os::windows::Library::open_already_loaded("jvm.dll")
        .ok()
        .map(Library::from)
}

#[cfg(unix)]
fn loaded_jvm_library() -> Option<Library> {
    let this = Library::from(libloading::os::unix::Library::this());
    let exported = unsafe { this.get::<GetCreatedJavaVms>(GET_CREATED_VMS) }.is_ok();
    exported.then_some(this)
}

fn java_home_library() -> Option<PathBuf> {
    let home = PathBuf::from(std::env::var_os("JAVA_HOME")?);
    let candidates: &[&str] = if cfg!(windows) {
        &["bin/server/jvm.dll", "jre/bin/server/jvm.dll", "bin/client/jvm.dll"]
    } else if cfg!(target_os = "macos") {
        &["lib/server/libjvm.dylib", "jre/lib/server/libjvm.dylib"]
    } else {
        &["lib/server/libjvm.so", "jre/lib/amd64/server/libjvm.so"]
    };
    candidates.iter().map(|c| home.join(c)).find(|p| p.is_file())
}

unsafe fn discover_vm(lib: &Library) -> Result<Option<JavaVM>, RuntimeFault> {
    let get_created = lib
        .get::<GetCreatedJavaVms>(GET_CREATED_VMS)
        .map_err(|e| RuntimeFault::VmUnavailable(e.to_string()))?;
    let mut vm: *mut sys::JavaVM = std::ptr::null_mut();
    let mut count: sys::jsize = 0;
    let status = get_created(&mut vm, 1, &mut count);
    if status != sys::JNI_OK {
        return Err(RuntimeFault::VmUnavailable(format!(
            "JNI_GetCreatedJavaVMs returned {status}"
        )));
    }
    if count == 0 || vm.is_null() {
        return Ok(None);
    }
    Ok(Some(JavaVM::from_raw(vm)?))
}

unsafe fn create_vm(lib: &Library, config: &RuntimeConfig) -> Result<JavaVM, RuntimeFault> {
    let create = lib
        .get::<CreateJavaVm>(CREATE_VM)
        .map_err(|e| RuntimeFault::VmUnavailable(e.to_string()))?;

    let options = vm_options(config)?;
    let mut raw: Vec<sys::JavaVMOption> = options
        .iter()
        .map(|o| sys::JavaVMOption {
            optionString: o.as_ptr() as *mut c_char,
            extraInfo: std::ptr::null_mut(),
        })
        .collect();
    let mut args = sys::JavaVMInitArgs {
        version: sys::JNI_VERSION_1_8,
        nOptions: raw.len() as sys::jint,
        options: raw.as_mut_ptr(),
        ignoreUnrecognized: sys::JNI_TRUE,
    };

    let mut vm: *mut sys::JavaVM = std::ptr::null_mut();
    let mut env: *mut c_void = std::ptr::null_mut();
    let status = create(&mut vm, &mut env, &mut args as *mut sys::JavaVMInitArgs as *mut c_void);
    if status != sys::JNI_OK || vm.is_null() {
        return Err(RuntimeFault::CreateFailed(status));
    }
    Ok(JavaVM::from_raw(vm)?)
}

fn vm_options(config: &RuntimeConfig) -> Result<Vec<CString>, RuntimeFault> {
    let mut options = Vec::new();
    if !config.class_path.is_empty() {
        let joined = std::env::join_paths(&config.class_path)
            .map_err(|e| RuntimeFault::VmUnavailable(format!("class path: {e}")))?;
        options.push(format!("-Djava.class.path={}", joined.to_string_lossy()));
    }
    options.extend(config.vm_options.iter().cloned());
    options
        .into_iter()
        .map(|o| {
            CString::new(o).map_err(|_| RuntimeFault::VmUnavailable("VM option contains NUL".into()))
        })
        .collect()
}

/// `main`'s `String[]`.
fn string_array<'local>(
    env: &mut JNIEnv<'local>,
    args: &[String],
) -> Result<JObjectArray<'local>, JniError> {
    let array = env.new_object_array(args.len() as sys::jsize, "java/lang/String", JObject::null())?;
    for (i, arg) in args.iter().enumerate() {
        let value = env.new_string(arg)?;
        env.set_object_array_element(&array, i as sys::jsize, &value)?;
        env.delete_local_ref(value)?;
    }
    Ok(array)
}

/// Clear a pending `NoSuchMethodError`; any other exception is rethrown.
fn absorb_no_such_method(env: &mut JNIEnv) -> Result<bool, JniError> {
    if !env.exception_check()? {
        return Ok(false);
    }
    let throwable = env.exception_occurred()?;
    env.exception_clear()?;
    if env.is_instance_of(&throwable, "java/lang/NoSuchMethodError")? {
        return Ok(true);
    }
    env.throw(throwable)?;
    Ok(false)
}

/// A missing method is `None`, not an error.
fn find_method<T>(
    env: &mut JNIEnv,
    lookup: impl FnOnce(&mut JNIEnv) -> Result<T, JniError>,
) -> Result<Option<T>, RuntimeFault> {
    match lookup(env) {
        Ok(id) => Ok(Some(id)),
        Err(e @ (JniError::MethodNotFound { .. } | JniError::JavaException)) => {
            if absorb_no_such_method(env)? || matches!(e, JniError::MethodNotFound { .. }) {
                Ok(None)
            } else {
                Err(e.into())
            }
        }
        Err(e) => Err(e.into()),
    }
}

fn describe_throwable(env: &mut JNIEnv, throwable: &JThrowable) -> Option<String> {
    let text = env
        .call_method(throwable, "toString", "()Ljava/lang/String;", &[])
        .and_then(|v| v.l());
    match text {
        Ok(obj) => {
            let text = JString::from(obj);
            env.get_string(&text).ok().map(String::from)
        }
        Err(_) => {
            let _ = env.exception_clear();
            None
        }
    }
}

impl ManagedRuntime for JniRuntime {
    type Object = GlobalRef;
    type StaticMethod = JStaticMethodID;
    type Method = JMethodID;

    fn attach(&self) -> Result<AttachKind, RuntimeFault> {
        let (vm, created) = self.ensure_vm()?;
        if created {
            return Ok(AttachKind::CreatedVm);
        }
        if vm.get_env().is_ok() {
            return Ok(AttachKind::AlreadyAttached);
        }
        vm.attach_current_thread_permanently()?;
        Ok(AttachKind::AttachedThread)
    }

    fn detach(&self) -> Result<(), RuntimeFault> {
        let vm = self
            .vm
            .get()
            .ok_or_else(|| RuntimeFault::VmUnavailable("not attached".into()))?;
        unsafe { vm.detach_current_thread() };
        Ok(())
    }

    fn new_class_loader(&self, url: &str) -> Result<GlobalRef, RuntimeFault> {
        let mut env = self.env()?;
        env.with_local_frame(16, |env| -> Result<GlobalRef, RuntimeFault> {
            let spec = env.new_string(url)?;
            let url = env.new_object("java/net/URL", "(Ljava/lang/String;)V", &[JValue::Object(&spec)])?;
            let urls = env.new_object_array(1, "java/net/URL", &url)?;
            let parent = env
                .call_static_method(
                    "java/lang/ClassLoader",
                    "getSystemClassLoader",
                    "()Ljava/lang/ClassLoader;",
                    &[],
                )?
                .l()?;
            let loader = env.new_object(
                "java/net/URLClassLoader",
                "([Ljava/net/URL;Ljava/lang/ClassLoader;)V",
                &[JValue::Object(&urls), JValue::Object(&parent)],
            )?;
            Ok(env.new_global_ref(loader)?)
        })
    }

    fn set_context_class_loader(&self, loader: &GlobalRef) -> Result<(), RuntimeFault> {
        let mut env = self.env()?;
        env.with_local_frame(4, |env| -> Result<(), RuntimeFault> {
            let thread = env
                .call_static_method("java/lang/Thread", "currentThread", "()Ljava/lang/Thread;", &[])?
                .l()?;
            env.call_method(
                &thread,
                "setContextClassLoader",
                "(Ljava/lang/ClassLoader;)V",
                &[JValue::Object(loader.as_obj())],
            )?;
            Ok(())
        })
    }

    fn close_class_loader(&self, loader: &GlobalRef) -> Result<(), RuntimeFault> {
        let mut env = self.env()?;
        env.call_method(loader.as_obj(), "close", "()V", &[])?;
        Ok(())
    }

    fn load_class(&self, loader: &GlobalRef, name: &str) -> Result<GlobalRef, RuntimeFault> {
        let mut env = self.env()?;
        env.with_local_frame(4, |env| -> Result<GlobalRef, RuntimeFault> {
            let binary_name = env.new_string(name)?;
            let class = env
                .call_method(
                    loader.as_obj(),
                    "loadClass",
                    "(Ljava/lang/String;)Ljava/lang/Class;",
                    &[JValue::Object(&binary_name)],
                )?
                .l()?;
            Ok(env.new_global_ref(class)?)
        })
    }

    fn static_method(
        &self,
        class: &GlobalRef,
        name: &str,
        signature: &str,
    ) -> Result<Option<JStaticMethodID>, RuntimeFault> {
        let mut env = self.env()?;
        let class = <&JClass>::from(class.as_obj());
        find_method(&mut env, |env| env.get_static_method_id(class, name, signature))
    }

    fn instance_method(
        &self,
        class: &GlobalRef,
        name: &str,
        signature: &str,
    ) -> Result<Option<JMethodID>, RuntimeFault> {
        let mut env = self.env()?;
        let class = <&JClass>::from(class.as_obj());
        find_method(&mut env, |env| env.get_method_id(class, name, signature))
    }

    fn new_instance(&self, class: &GlobalRef) -> Result<GlobalRef, RuntimeFault> {
        let mut env = self.env()?;
        env.with_local_frame(4, |env| -> Result<GlobalRef, RuntimeFault> {
            let class = <&JClass>::from(class.as_obj());
            let instance = env.new_object(class, "()V", &[])?;
            Ok(env.new_global_ref(instance)?)
        })
    }

    fn call_static(
        &self,
        class: &GlobalRef,
        method: JStaticMethodID,
        args: Option<&[String]>,
    ) -> Result<(), RuntimeFault> {
        let mut env = self.env()?;
        env.with_local_frame(8, |env| -> Result<(), RuntimeFault> {
            let array = args.map(|a| string_array(env, a)).transpose()?;
            let jargs: Vec<sys::jvalue> = array.iter().map(|a| JValue::Object(a).as_jni()).collect();
            let class = <&JClass>::from(class.as_obj());
            // Signature was checked when the id was resolved.
            unsafe {
                env.call_static_method_unchecked(
                    class,
                    method,
                    ReturnType::Primitive(Primitive::Void),
                    &jargs,
                )
            }?;
            Ok(())
        })
    }

    fn call_instance(
        &self,
        instance: &GlobalRef,
        method: JMethodID,
        args: Option<&[String]>,
    ) -> Result<(), RuntimeFault> {
        let mut env = self.env()?;
        env.with_local_frame(8, |env| -> Result<(), RuntimeFault> {
            let array = args.map(|a| string_array(env, a)).transpose()?;
            let jargs: Vec<sys::jvalue> = array.iter().map(|a| JValue::Object(a).as_jni()).collect();
            unsafe {
                env.call_method_unchecked(
                    instance.as_obj(),
                    method,
                    ReturnType::Primitive(Primitive::Void),
                    &jargs,
                )
            }?;
            Ok(())
        })
    }

    fn take_pending_exception(&self) -> Option<String> {
        let mut env = self.env().ok()?;
        if !env.exception_check().unwrap_or(false) {
            return None;
        }
        let throwable = env.exception_occurred().ok();
        let _ = env.exception_clear();
        let description = throwable
            .and_then(|t| describe_throwable(&mut env, &t))
            .unwrap_or_else(|| "java exception".to_string());
        Some(description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_options() {
        let config = RuntimeConfig {
            jvm_library: None,
            class_path: vec![PathBuf::from("a.jar")],
            vm_options: vec!["-Xmx64m".to_string()],
        };
        let options = vm_options(&config).unwrap();
        assert_eq!(options.len(), 2);
        assert!(options[0].to_str().unwrap().starts_with("-Djava.class.path="));
        assert_eq!(options[1].to_str().unwrap(), "-Xmx64m");
    }

    #[test]
    fn test_vm_option_with_nul_rejected() {
        let config = RuntimeConfig {
            vm_options: vec!["-Dx=\0".to_string()],
            ..RuntimeConfig::default()
        };
        assert!(matches!(vm_options(&config), Err(RuntimeFault::VmUnavailable(_))));
    }

    #[test]
    fn test_unattached_runtime_reports_no_vm() {
        let runtime = JniRuntime::new(RuntimeConfig::default());
        assert!(matches!(runtime.detach(), Err(RuntimeFault::VmUnavailable(_))));
        assert!(runtime.take_pending_exception().is_none());
    }
}
