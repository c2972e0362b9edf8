//! Registration of extension classes with the engine.

use std::ffi::{CString, c_char};
use std::fmt;
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock};

use log::{debug, info, warn};
use rustc_hash::FxHashMap;

use gdbridge_core::runtime::Runtime;
use gdbridge_core::sys::{ConstTypePtr, RawClassCreationInfo, RawMethodInfo, RawPropertyInfo, FALSE, TRUE, TypePtr};
use gdbridge_core::types::{InitializationLevel, PropertyUsage, VariantType};

use crate::callbacks;
use crate::class::{ClassBuilder, ClassEntry, c_string};
use crate::error::RegistrationError;
use crate::handle::{ClassId, InstanceHandle};
use crate::instance::InstanceState;

type Directory = RwLock<FxHashMap<ClassId, Arc<ClassEntry>>>;

/// Every registered class in the process, keyed by the id the engine hands back.
static DIRECTORY: OnceLock<Directory> = OnceLock::new();

fn directory() -> &'static Directory {
    DIRECTORY.get_or_init(|| RwLock::new(FxHashMap::default()))
}

pub(crate) fn lookup(id: ClassId) -> Option<Arc<ClassEntry>> {
    directory().read().unwrap_or_else(PoisonError::into_inner).get(&id).cloned()
}

fn publish(entry: Arc<ClassEntry>) {
    directory().write().unwrap_or_else(PoisonError::into_inner).insert(entry.id, entry);
}

fn withdraw(id: ClassId) -> Option<Arc<ClassEntry>> {
    directory().write().unwrap_or_else(PoisonError::into_inner).remove(&id)
}

/// Property record plus the strings it points into.
struct PropertyRecord {
    info: RawPropertyInfo,
    _name: CString,
}

impl PropertyRecord {
    fn new(name: &str, ty: VariantType, usage: PropertyUsage) -> Result<Self, RegistrationError> {
        let name = c_string(name)?;
        let info = RawPropertyInfo {
            ty: ty.into(),
            name: name.as_ptr(),
            class_name: c"".as_ptr(),
            hint: 0,
            hint_string: c"".as_ptr(),
            usage: usage.bits(),
        };
        Ok(Self { info, _name: name })
    }
}

/// Classes registered by one extension library.
///
/// ```ignore
/// let registry = ClassRegistry::new(runtime);
/// registry.register(ClassBuilder::new("Player", "Node2D", |_| Player::default()))?;
/// // ... on scene deinitialization
/// registry.unregister_level(InitializationLevel::Scene);
/// ```
pub struct ClassRegistry {
    runtime: Arc<Runtime>,
    classes: Mutex<Vec<(ClassId, String, InitializationLevel)>>,
}

impl ClassRegistry {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime, classes: Mutex::new(Vec::new()) }
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    fn classes(&self) -> MutexGuard<'_, Vec<(ClassId, String, InitializationLevel)>> {
        self.classes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a class, its methods, properties and signals with the engine.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn register<T: Send + 'static>(&self, builder: ClassBuilder<T>) -> Result<ClassId, RegistrationError> {
        let entry = builder.build(ClassId::next(), Arc::clone(&self.runtime))?;
        if self.class_id(&entry.name).is_some() {
            return Err(RegistrationError::DuplicateClass { name: entry.name });
        }
        let entry = Arc::new(entry);
        publish(Arc::clone(&entry));
        if let Err(err) = unsafe { self.announce(&entry) } {
            withdraw(entry.id);
            return Err(err);
        }
        self.classes().push((entry.id, entry.name.clone(), entry.level));
        info!(
            "registered {} extends {} ({} methods, {} virtuals, {} properties, {} signals)",
            entry.name,
            entry.parent,
            entry.methods.len(),
            entry.virtuals.len(),
            entry.properties.len(),
            entry.signals.len()
        );
        Ok(entry.id)
    }

    /// Hands the class description to the engine.
    unsafe fn announce(&self, entry: &ClassEntry) -> Result<(), RegistrationError> {
        let api = self.runtime.api();
        let library = self.runtime.library().as_ptr();
        let creation = RawClassCreationInfo {
            is_virtual: if entry.is_virtual { TRUE } else { FALSE },
            is_abstract: if entry.is_abstract { TRUE } else { FALSE },
            class_userdata: entry.id.as_userdata(),
            create_instance_func: Some(callbacks::create_instance),
            free_instance_func: Some(callbacks::free_instance),
            get_virtual_func: Some(callbacks::get_virtual),
        };
        unsafe { api.classdb_register_extension_class(library, &entry.c_name, &entry.c_parent, &creation) };

        for (index, method) in entry.methods.iter().enumerate() {
            let name = c_string(&method.name)?;
            let args = method
                .signature
                .params
                .iter()
                .enumerate()
                .map(|(i, ty)| PropertyRecord::new(&format!("arg{i}"), *ty, PropertyUsage::DEFAULT))
                .collect::<Result<Vec<_>, _>>()?;
            let arg_infos: Vec<RawPropertyInfo> = args.iter().map(|record| record.info).collect();
            let ret = method.signature.ret.map(|ty| PropertyRecord::new("return", ty, PropertyUsage::DEFAULT)).transpose()?;
            let info = RawMethodInfo {
                name: name.as_ptr() as *const c_char,
                method_userdata: callbacks::method_userdata(entry.id, index),
                call_func: Some(callbacks::method_call),
                ptrcall_func: Some(callbacks::method_ptrcall),
                method_flags: method.flags.bits(),
                hash: method.hash.as_u32(),
                has_return_value: if ret.is_some() { TRUE } else { FALSE },
                return_value_info: ret.as_ref().map_or(ptr::null(), |record| &record.info as *const RawPropertyInfo),
                argument_count: arg_infos.len() as u32,
                arguments_info: if arg_infos.is_empty() { ptr::null() } else { arg_infos.as_ptr() },
            };
            unsafe { api.classdb_register_extension_class_method(library, &entry.c_name, &info) };
            debug!("registered method {}.{} {}", entry.name, method.name, method.hash);
        }

        for property in &entry.properties {
            let record = PropertyRecord::new(&property.name, property.ty, property.usage)?;
            let setter = c_string_or_empty(&property.setter)?;
            let getter = c_string_or_empty(&property.getter)?;
            unsafe { api.classdb_register_extension_class_property(library, &entry.c_name, &record.info, &setter, &getter) };
        }

        for signal in &entry.signals {
            let name = c_string(&signal.name)?;
            let args = signal
                .args
                .iter()
                .map(|(arg, ty)| PropertyRecord::new(arg, *ty, PropertyUsage::DEFAULT))
                .collect::<Result<Vec<_>, _>>()?;
            let infos: Vec<RawPropertyInfo> = args.iter().map(|record| record.info).collect();
            unsafe { api.classdb_register_extension_class_signal(library, &entry.c_name, &name, &infos) };
        }
        Ok(())
    }

    /// Unregisters every class registered at `level`, newest first.
    pub fn unregister_level(&self, level: InitializationLevel) {
        let removed: Vec<_> = {
            let mut classes = self.classes();
            let (removed, kept): (Vec<_>, Vec<_>) = classes.drain(..).partition(|(_, _, at)| *at == level);
            *classes = kept;
            removed
        };
        for (id, name, _) in removed.into_iter().rev() {
            self.unregister(id, &name);
        }
    }

    /// Unregisters everything, newest first.
    pub fn unregister_all(&self) {
        let removed = std::mem::take(&mut *self.classes());
        for (id, name, _) in removed.into_iter().rev() {
            self.unregister(id, &name);
        }
    }

    fn unregister(&self, id: ClassId, name: &str) {
        if let Some(entry) = withdraw(id) {
            let live = entry.instances().len();
            if live > 0 {
                warn!("unregistering {name} with {live} live instances");
            }
            unsafe {
                self.runtime.api().classdb_unregister_extension_class(self.runtime.library().as_ptr(), &entry.c_name)
            };
            info!("unregistered {name}");
        }
    }

    pub fn class_id(&self, name: &str) -> Option<ClassId> {
        self.classes().iter().find(|(_, class, _)| class == name).map(|(id, _, _)| *id)
    }

    pub fn class_names(&self) -> Vec<String> {
        self.classes().iter().map(|(_, name, _)| name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.classes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live instances of a class, or 0 for an unknown class.
    pub fn instance_count(&self, class: ClassId) -> usize {
        lookup(class).map_or(0, |entry| entry.instances().len())
    }

    /// Handles of every active instance of a class.
    pub fn instances(&self, class: ClassId) -> Vec<InstanceHandle> {
        lookup(class).map_or_else(Vec::new, |entry| entry.instances().active())
    }

    /// Index the engine would receive for virtual `name`, 0 if not overridden.
    pub fn virtual_index(&self, class: ClassId, name: &str) -> u8 {
        lookup(class).map_or(0, |entry| entry.virtuals.index_of(name))
    }

    pub fn instance_state(&self, handle: InstanceHandle) -> Option<InstanceState> {
        handle.class().and_then(lookup).and_then(|entry| entry.state(handle))
    }

    /// Runs `f` against the managed state of an active instance.
    ///
    /// # Panics
    ///
    /// If the handle is stale or the instance is not a `T`.
    pub fn with_instance<T: 'static, R>(&self, handle: InstanceHandle, f: impl FnOnce(&mut T) -> R) -> R {
        match handle.class().and_then(lookup) {
            Some(entry) => entry.with_instance(handle, f),
            None => panic!("{handle} belongs to no registered class"),
        }
    }

    /// Dispatches virtual `index` the way its trampoline would.
    ///
    /// # Safety
    ///
    /// `args` and `ret` must match the override's declared signature.
    ///
    /// # Panics
    ///
    /// If the handle is stale or `index` is not an override of the class.
    pub unsafe fn call_virtual(&self, handle: InstanceHandle, index: u8, args: *const ConstTypePtr, ret: TypePtr) {
        match handle.class().and_then(lookup) {
            Some(entry) => unsafe { entry.call_virtual(handle, index, args, ret) },
            None => panic!("{handle} belongs to no registered class"),
        }
    }
}

fn c_string_or_empty(name: &str) -> Result<CString, RegistrationError> {
    if name.is_empty() { Ok(CString::default()) } else { c_string(name) }
}

impl fmt::Debug for ClassRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassRegistry").field("classes", &self.class_names()).finish()
    }
}

impl Drop for ClassRegistry {
    fn drop(&mut self) {
        let remaining = std::mem::take(&mut *self.classes());
        for (id, _, _) in remaining {
            withdraw(id);
        }
    }
}
