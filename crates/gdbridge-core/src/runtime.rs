//! The loaded-library runtime: engine API, linked tables and the object tracker.
//!
//! A [`Runtime`] is created once per library load and shared by reference
//! counting. Tables link in stages as the engine raises its initialization
//! level; using a table before its level has linked is a programming error
//! and panics.

use std::ffi::{CString, c_void};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use log::{debug, info};

use crate::api::NativeApi;
use crate::error::ResolutionError;
use crate::frame::{CallFrame, EntryPoint};
use crate::lifetime::{HandleKind, RawHandle};
use crate::methods::{CoreClasses, MethodBind};
use crate::object::{NativeAction, ObjectKey, ObjectTracker};
use crate::sys::{ClassLibraryPtr, ObjectPtr, RawInstanceBindingCallbacks, TRUE};
use crate::tables::VariantTables;
use crate::types::InitializationLevel;

/// Library token handed to the engine with every registration call.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct LibraryToken(ClassLibraryPtr);

// SAFETY: the token is an opaque engine identifier that is never dereferenced.
unsafe impl Send for LibraryToken {}
unsafe impl Sync for LibraryToken {}

impl LibraryToken {
    pub fn new(ptr: ClassLibraryPtr) -> Self {
        Self(ptr)
    }

    pub fn as_ptr(&self) -> ClassLibraryPtr {
        self.0
    }
}

impl fmt::Debug for LibraryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LibraryToken({:p})", self.0)
    }
}

pub struct Runtime {
    api: Box<dyn NativeApi>,
    library: LibraryToken,
    level: Mutex<Option<InitializationLevel>>,
    variants: OnceLock<VariantTables>,
    classes: OnceLock<CoreClasses>,
    tracker: Mutex<ObjectTracker>,
}

impl Runtime {
    pub fn new(api: impl NativeApi + 'static, library: LibraryToken) -> Arc<Self> {
        Arc::new(Self {
            api: Box::new(api),
            library,
            level: Mutex::new(None),
            variants: OnceLock::new(),
            classes: OnceLock::new(),
            tracker: Mutex::new(ObjectTracker::new()),
        })
    }

    #[inline]
    pub fn api(&self) -> &dyn NativeApi {
        self.api.as_ref()
    }

    #[inline]
    pub fn library(&self) -> LibraryToken {
        self.library
    }

    /// Resolves the tables belonging to `level`.
    ///
    /// Core links the Variant tables; scene links the class tables. Linking a
    /// level twice is a no-op.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn link(&self, level: InitializationLevel) -> Result<(), ResolutionError> {
        match level {
            InitializationLevel::Core if self.variants.get().is_none() => {
                let tables = VariantTables::link(self.api())?;
                let _ = self.variants.set(tables);
            }
            InitializationLevel::Scene if self.classes.get().is_none() => {
                let classes = CoreClasses::link(self.api())?;
                let _ = self.classes.set(classes);
            }
            _ => {}
        }
        *self.level.lock().unwrap_or_else(PoisonError::into_inner) = Some(level);
        info!("linked {level} level");
        Ok(())
    }

    /// Steps the recorded level back below `level`. Tables stay resolved.
    pub fn unlink(&self, level: InitializationLevel) {
        let below = match level {
            InitializationLevel::Core => None,
            other => InitializationLevel::try_from(u32::from(other) - 1).ok(),
        };
        *self.level.lock().unwrap_or_else(PoisonError::into_inner) = below;
        debug!("left {level} level");
    }

    /// Highest level linked so far.
    pub fn level(&self) -> Option<InitializationLevel> {
        *self.level.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// # Panics
    ///
    /// Before the core level has linked.
    pub fn variants(&self) -> &VariantTables {
        match self.variants.get() {
            Some(tables) => tables,
            None => panic!("Variant tables used before the core initialization level"),
        }
    }

    /// # Panics
    ///
    /// Before the scene level has linked.
    pub fn classes(&self) -> &CoreClasses {
        match self.classes.get() {
            Some(classes) => classes,
            None => panic!("class tables used before the scene initialization level"),
        }
    }

    pub fn tracker(&self) -> MutexGuard<'_, ObjectTracker> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_ref_counted(&self, object: ObjectPtr) -> bool {
        let tag = self.classes().ref_counted_tag;
        !unsafe { self.api.object_cast_to(object, tag.as_ptr()) }.is_null()
    }

    /// Runs the per-kind destructor of a handle whose scope ended.
    pub(crate) fn release_handle(&self, mut raw: RawHandle) {
        match raw.kind() {
            HandleKind::Variant => unsafe { self.api.variant_destroy(raw.as_mut_ptr()) },
            HandleKind::Builtin(ty) => unsafe { (self.variants().destructor(ty))(raw.as_mut_ptr()) },
            HandleKind::Object => self.release_object(ObjectKey::unpack(raw.words()[2])),
        }
    }

    pub(crate) fn release_object(&self, key: ObjectKey) {
        let action = self.tracker().release(key);
        self.apply(action);
    }

    /// Performs the engine side of a tracker transition.
    pub(crate) fn apply(&self, action: NativeAction) {
        match action {
            NativeAction::None => {}
            NativeAction::InitRef(ptr) => {
                self.ref_counted_call(self.classes().ref_counted.init_ref, ptr);
            }
            NativeAction::Reference(ptr) => {
                self.ref_counted_call(self.classes().ref_counted.reference, ptr);
            }
            NativeAction::Unreference(ptr) => {
                if self.ref_counted_call(self.classes().ref_counted.unreference, ptr) {
                    unsafe { self.api.object_destroy(ptr as ObjectPtr) };
                }
            }
            NativeAction::Destroy(ptr) => unsafe { self.api.object_destroy(ptr as ObjectPtr) },
        }
    }

    fn ref_counted_call(&self, bind: MethodBind, ptr: usize) -> bool {
        let mut frame = CallFrame::open(self);
        let returned = unsafe {
            frame.invoke(EntryPoint::Method(bind), ptr as ObjectPtr);
            frame.plain_result::<u8>() != 0
        };
        frame.close();
        returned
    }

    /// Watches `object` so that engine-side deletion reaches the tracker.
    pub(crate) fn watch(&self, object: ObjectPtr) {
        let token = self as *const Runtime as *mut c_void;
        unsafe { self.api.object_get_instance_binding(object, token, &BINDING_CALLBACKS) };
    }

    /// Engine-side deletion notice for a watched object.
    pub fn on_predelete(&self, object: ObjectPtr) {
        if let Some(key) = self.tracker().destroyed(object as usize) {
            debug!("{key} deleted by the engine");
        }
    }

    pub fn print_error(&self, message: &str, function: &str, file: &str, line: u32) {
        let (message, function, file) = (lossy_c(message), lossy_c(function), lossy_c(file));
        self.api.print_error(&message, &function, &file, line as i32, false);
    }

    pub fn print_warning(&self, message: &str, function: &str, file: &str, line: u32) {
        let (message, function, file) = (lossy_c(message), lossy_c(function), lossy_c(file));
        self.api.print_warning(&message, &function, &file, line as i32, false);
    }

    pub fn print_script_error(&self, message: &str, function: &str, file: &str, line: u32) {
        let (message, function, file) = (lossy_c(message), lossy_c(function), lossy_c(file));
        self.api.print_script_error(&message, &function, &file, line as i32, false);
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("library", &self.library)
            .field("level", &self.level())
            .field("tracked_objects", &self.tracker().len())
            .finish_non_exhaustive()
    }
}

/// Strips interior nul bytes so any message can reach the engine.
fn lossy_c(text: &str) -> CString {
    CString::new(text.replace('\0', "")).unwrap_or_default()
}

static BINDING_CALLBACKS: RawInstanceBindingCallbacks = RawInstanceBindingCallbacks {
    create_callback: Some(binding_create),
    free_callback: Some(binding_free),
    reference_callback: Some(binding_reference),
};

unsafe extern "C" fn binding_create(token: *mut c_void, _instance: *mut c_void) -> *mut c_void {
    token
}

unsafe extern "C" fn binding_free(token: *mut c_void, instance: *mut c_void, _binding: *mut c_void) {
    if token.is_null() {
        return;
    }
    // SAFETY: the token is the address of the Runtime that installed the binding,
    // and the library's Runtime outlives every object it watches.
    let runtime = unsafe { &*(token as *const Runtime) };
    runtime.on_predelete(instance);
}

unsafe extern "C" fn binding_reference(_token: *mut c_void, _binding: *mut c_void, _reference: u8) -> u8 {
    TRUE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifetime::Context;
    use crate::object::{Object, ObjectState};
    use crate::testing::FakeEngine;

    #[test]
    fn tables_panic_before_linking() {
        let engine = FakeEngine::new();
        let runtime = engine.unlinked_runtime();
        assert!(runtime.level().is_none());
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            runtime.variants();
        }));
        assert!(result.is_err());
    }

    #[test]
    fn staged_linking_records_level() {
        let engine = FakeEngine::new();
        let runtime = engine.unlinked_runtime();
        runtime.link(InitializationLevel::Core).unwrap();
        runtime.variants();
        assert!(runtime.classes.get().is_none());
        runtime.link(InitializationLevel::Servers).unwrap();
        runtime.link(InitializationLevel::Scene).unwrap();
        runtime.classes();
        assert_eq!(runtime.level(), Some(InitializationLevel::Scene));
        runtime.unlink(InitializationLevel::Scene);
        assert_eq!(runtime.level(), Some(InitializationLevel::Servers));
        runtime.unlink(InitializationLevel::Core);
        assert_eq!(runtime.level(), None);
    }

    #[test]
    fn missing_method_bind_fails_scene_link() {
        let engine = FakeEngine::new();
        engine.remove_method("RefCounted", "unreference");
        let runtime = engine.unlinked_runtime();
        runtime.link(InitializationLevel::Core).unwrap();
        let err = runtime.link(InitializationLevel::Scene).unwrap_err();
        assert!(matches!(err, ResolutionError::MissingMethodBind { ref method, .. } if method == "unreference"));
    }

    #[test]
    fn engine_deletion_marks_tracked_object_freed() {
        let engine = FakeEngine::new();
        let runtime = engine.runtime();
        let ctx = Context::new(runtime.clone());
        let life = ctx.scope();
        let node = Object::construct(&life, "Node");
        node.give();
        engine.destroy_object(node.ptr());
        assert!(node.is_freed());
        assert_eq!(node.state(), Some(ObjectState::Freed));
        life.end();
        assert!(runtime.tracker().is_empty());
    }

    #[test]
    fn errors_reach_the_engine_log() {
        let engine = FakeEngine::new();
        let runtime = engine.runtime();
        runtime.print_error("bad\0thing", "f", "file.rs", 3);
        runtime.print_warning("careful", "f", "file.rs", 4);
        assert_eq!(engine.messages(), vec!["error: badthing".to_string(), "warning: careful".to_string()]);
    }
}
