//! Class declarations and the per-class runtime record.

use std::any::Any;
use std::ffi::CString;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use log::{error, trace};

use gdbridge_core::error::CallError;
use gdbridge_core::hash::MethodHash;
use gdbridge_core::lifetime::Context;
use gdbridge_core::runtime::Runtime;
use gdbridge_core::sys::{ConstTypePtr, ObjectPtr, TypePtr};
use gdbridge_core::types::{InitializationLevel, MethodFlags, PropertyUsage, VariantType};

use crate::error::RegistrationError;
use crate::handle::{ClassId, InstanceHandle};
use crate::instance::{Base, InstanceCell, InstanceState, InstanceTable};
use crate::method::{Arguments, ErasedMethod, IntoMethod, ReturnSlot, Signature};
use crate::virtuals::{VirtualMethod, VirtualTable};

/// Exposed methods per class; method userdata carries the index in 16 bits.
pub const MAX_METHODS: usize = u16::MAX as usize;

type Init = Box<dyn Fn(Base) -> Box<dyn Any + Send> + Send + Sync>;

/// An exposed property backed by registered getter and setter methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyDef {
    pub name: String,
    pub ty: VariantType,
    pub getter: String,
    pub setter: String,
    pub usage: PropertyUsage,
}

/// A signal and its typed arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalDef {
    pub name: String,
    pub args: Vec<(String, VariantType)>,
}

pub(crate) struct MethodDef {
    pub(crate) name: String,
    pub(crate) flags: MethodFlags,
    pub(crate) signature: Signature,
    pub(crate) hash: MethodHash,
    pub(crate) call: ErasedMethod,
}

/// Declarative description of an extension class `T`.
///
/// ```ignore
/// let player = ClassBuilder::new("Player", "Node2D", |_base| Player { hp: 10 })
///     .method("damage", |p: &mut Player, amount: i64| p.hp -= amount)
///     .method("hp", |p: &mut Player| p.hp)
///     .virtual_method("_ready", |p: &mut Player| p.hp = 100)
///     .signal("died", &[]);
/// registry.register(player)?;
/// ```
pub struct ClassBuilder<T> {
    name: String,
    parent: String,
    level: InitializationLevel,
    is_virtual: bool,
    is_abstract: bool,
    init: Box<dyn Fn(Base) -> T + Send + Sync>,
    methods: Vec<MethodDef>,
    virtuals: VirtualTable,
    properties: Vec<PropertyDef>,
    signals: Vec<SignalDef>,
}

impl<T: Send + 'static> ClassBuilder<T> {
    /// Starts a class `name` extending the engine class `parent`.
    ///
    /// `init` builds the managed state whenever the engine instantiates the class.
    pub fn new(name: &str, parent: &str, init: impl Fn(Base) -> T + Send + Sync + 'static) -> Self {
        Self {
            name: name.to_string(),
            parent: parent.to_string(),
            level: InitializationLevel::Scene,
            is_virtual: false,
            is_abstract: false,
            init: Box::new(init),
            methods: Vec::new(),
            virtuals: VirtualTable::default(),
            properties: Vec::new(),
            signals: Vec::new(),
        }
    }

    /// Level whose deinitialization unregisters the class. Defaults to scene.
    pub fn level(mut self, level: InitializationLevel) -> Self {
        self.level = level;
        self
    }

    pub fn virtual_class(mut self) -> Self {
        self.is_virtual = true;
        self
    }

    pub fn abstract_class(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    /// Exposes a method to the engine.
    pub fn method<M, F: IntoMethod<T, M>>(self, name: &str, f: F) -> Self {
        self.method_with_flags(name, MethodFlags::DEFAULT, f)
    }

    pub fn method_with_flags<M, F: IntoMethod<T, M>>(mut self, name: &str, flags: MethodFlags, f: F) -> Self {
        let signature = F::signature();
        let hash = MethodHash::of_method(&self.name, name, &signature.params, signature.ret);
        let call = f.into_erased(&format!("{}.{name}", self.name));
        self.methods.push(MethodDef { name: name.to_string(), flags, signature, hash, call });
        self
    }

    /// Overrides an engine virtual such as `_ready`.
    ///
    /// # Panics
    ///
    /// On a duplicate override or more than 255 overrides in one class.
    pub fn virtual_method<M, F: IntoMethod<T, M>>(mut self, name: &str, f: F) -> Self {
        let method = VirtualMethod {
            name: name.to_string(),
            signature: F::signature(),
            call: f.into_erased(&format!("{}.{name}", self.name)),
        };
        self.virtuals.insert(&self.name, method);
        self
    }

    pub fn property(mut self, name: &str, ty: VariantType, getter: &str, setter: &str) -> Self {
        self.properties.push(PropertyDef {
            name: name.to_string(),
            ty,
            getter: getter.to_string(),
            setter: setter.to_string(),
            usage: PropertyUsage::DEFAULT,
        });
        self
    }

    pub fn signal(mut self, name: &str, args: &[(&str, VariantType)]) -> Self {
        let args = args.iter().map(|(name, ty)| (name.to_string(), *ty)).collect();
        self.signals.push(SignalDef { name: name.to_string(), args });
        self
    }

    /// Checks names and accessors and produces the runtime record.
    pub(crate) fn build(self, id: ClassId, runtime: Arc<Runtime>) -> Result<ClassEntry, RegistrationError> {
        let c_name = c_string(&self.name)?;
        let c_parent = c_string(&self.parent)?;
        if self.methods.len() > MAX_METHODS {
            return Err(RegistrationError::TooManyMethods { class: self.name.clone(), count: self.methods.len() });
        }
        for (i, method) in self.methods.iter().enumerate() {
            c_string(&method.name)?;
            if self.methods[..i].iter().any(|other| other.name == method.name) {
                return Err(RegistrationError::DuplicateMethod { class: self.name.clone(), method: method.name.clone() });
            }
        }
        for property in &self.properties {
            c_string(&property.name)?;
            for accessor in [&property.getter, &property.setter] {
                if !accessor.is_empty() && !self.methods.iter().any(|method| &method.name == accessor) {
                    return Err(RegistrationError::UnknownAccessor {
                        class: self.name.clone(),
                        property: property.name.clone(),
                        accessor: accessor.clone(),
                    });
                }
            }
        }
        for signal in &self.signals {
            c_string(&signal.name)?;
        }

        let init = self.init;
        Ok(ClassEntry {
            id,
            name: self.name,
            c_name,
            parent: self.parent,
            c_parent,
            level: self.level,
            is_virtual: self.is_virtual,
            is_abstract: self.is_abstract,
            runtime,
            init: Box::new(move |base: Base| Box::new(init(base)) as Box<dyn Any + Send>),
            methods: self.methods,
            virtuals: self.virtuals,
            properties: self.properties,
            signals: self.signals,
            instances: Mutex::new(InstanceTable::new(id)),
        })
    }
}

pub(crate) fn c_string(name: &str) -> Result<CString, RegistrationError> {
    if name.is_empty() {
        return Err(RegistrationError::InvalidName { name: name.to_string() });
    }
    CString::new(name).map_err(|_| RegistrationError::InvalidName { name: name.to_string() })
}

/// A registered class as the engine callbacks see it.
pub(crate) struct ClassEntry {
    pub(crate) id: ClassId,
    pub(crate) name: String,
    pub(crate) c_name: CString,
    pub(crate) parent: String,
    pub(crate) c_parent: CString,
    pub(crate) level: InitializationLevel,
    pub(crate) is_virtual: bool,
    pub(crate) is_abstract: bool,
    pub(crate) runtime: Arc<Runtime>,
    init: Init,
    pub(crate) methods: Vec<MethodDef>,
    pub(crate) virtuals: VirtualTable,
    pub(crate) properties: Vec<PropertyDef>,
    pub(crate) signals: Vec<SignalDef>,
    instances: Mutex<InstanceTable>,
}

impl ClassEntry {
    pub(crate) fn instances(&self) -> MutexGuard<'_, InstanceTable> {
        self.instances.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Builds a base object and binds a new managed instance to it.
    ///
    /// # Panics
    ///
    /// If the engine cannot construct the parent class.
    pub(crate) fn create(&self) -> ObjectPtr {
        let api = self.runtime.api();
        let object = api.classdb_construct_object(&self.c_parent);
        if object.is_null() {
            panic!("engine could not construct {} as the base of {}", self.parent, self.name);
        }
        let base = Base::new(object, unsafe { api.object_get_instance_id(object) });
        let value = (self.init)(base);
        let handle = self.instances().insert(value);
        unsafe { api.object_set_instance(object, &self.c_name, handle.as_ptr()) };
        self.instances().activate(handle, base);
        trace!("created {handle} of {}", self.name);
        object
    }

    /// Releases an instance slot; the managed value drops once no call holds it.
    pub(crate) fn free(&self, handle: InstanceHandle) {
        let value = self.instances().remove(handle);
        trace!("freed {handle} of {}", self.name);
        drop(value);
    }

    pub(crate) fn state(&self, handle: InstanceHandle) -> Option<InstanceState> {
        self.instances().state(handle)
    }

    /// # Panics
    ///
    /// If `handle` does not address an active instance of this class.
    fn resolve(&self, handle: InstanceHandle) -> (InstanceCell, Base) {
        let found = self.instances().get(handle);
        match found {
            Some(found) => found,
            None => panic!("call dispatched to stale or inactive {handle} of {}", self.name),
        }
    }

    /// Runs a method against an instance inside a fresh dispatch scope.
    fn invoke(
        &self,
        handle: InstanceHandle,
        method: &str,
        call: &ErasedMethod,
        args: Arguments<'_>,
        ret: ReturnSlot,
    ) -> Result<(), CallError> {
        let (cell, _) = self.resolve(handle);
        let ctx = Context::new(Arc::clone(&self.runtime));
        let life = ctx.scope();
        let result = {
            let mut guard = match cell.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => {
                    panic!("{}.{method} re-entered {handle} while a call on it is running", self.name)
                }
            };
            call(&mut **guard, &life, args, ret)
        };
        life.end();
        result
    }

    /// Dispatches virtual `index` with pointer-call arguments.
    ///
    /// # Safety
    ///
    /// `args` must hold one valid pointer per declared parameter and `ret`
    /// must be null or writable storage for the declared return type.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub(crate) unsafe fn call_virtual(&self, handle: InstanceHandle, index: u8, args: *const ConstTypePtr, ret: TypePtr) {
        let Some(method) = self.virtuals.get(index) else {
            panic!("{} has no virtual at index {index}", self.name);
        };
        let args = unsafe { native_args(args, method.signature.arity()) };
        if let Err(err) = self.invoke(handle, &method.name, &method.call, Arguments::Native(args), ReturnSlot::Native(ret)) {
            error!("{}.{}: {err}", self.name, method.name);
        }
    }

    /// Dispatches exposed method `index`.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub(crate) fn call_method(
        &self,
        index: usize,
        handle: InstanceHandle,
        args: Arguments<'_>,
        ret: ReturnSlot,
    ) -> Result<(), CallError> {
        let Some(method) = self.methods.get(index) else {
            panic!("{} has no method at index {index}", self.name);
        };
        self.invoke(handle, &method.name, &method.call, args, ret)
    }

    pub(crate) fn with_instance<U: 'static, R>(&self, handle: InstanceHandle, f: impl FnOnce(&mut U) -> R) -> R {
        let (cell, _) = self.resolve(handle);
        let mut guard = cell.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.downcast_mut::<U>() {
            Some(instance) => f(instance),
            None => panic!("{handle} of {} is not a {}", self.name, std::any::type_name::<U>()),
        }
    }
}

impl fmt::Debug for ClassEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassEntry")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("parent", &self.parent)
            .field("level", &self.level)
            .field("methods", &self.methods.iter().map(|m| m.name.as_str()).collect::<Vec<_>>())
            .field("virtuals", &self.virtuals.names().collect::<Vec<_>>())
            .field("instances", &self.instances().len())
            .finish()
    }
}

/// # Safety
///
/// `args` must point to `len` pointers when `len` is non-zero.
pub(crate) unsafe fn native_args<'a, P>(args: *const P, len: usize) -> &'a [P] {
    if len == 0 || args.is_null() { &[] } else { unsafe { std::slice::from_raw_parts(args, len) } }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gdbridge_core::testing::FakeEngine;

    struct Probe;

    #[test]
    fn duplicate_methods_are_rejected() {
        let engine = FakeEngine::new();
        let builder = ClassBuilder::new("Probe", "Node", |_| Probe)
            .method("ping", |_: &mut Probe| {})
            .method("ping", |_: &mut Probe| 1i64);
        let err = builder.build(ClassId::next(), engine.runtime()).unwrap_err();
        assert_eq!(err, RegistrationError::DuplicateMethod { class: "Probe".into(), method: "ping".into() });
    }

    #[test]
    fn method_count_is_bounded_by_the_userdata_index() {
        let engine = FakeEngine::new();
        let mut builder = ClassBuilder::new("Probe", "Node", |_| Probe);
        for i in 0..=MAX_METHODS {
            builder = builder.method(&format!("m{i}"), |_: &mut Probe| {});
        }
        let err = builder.build(ClassId::next(), engine.runtime()).unwrap_err();
        assert_eq!(err, RegistrationError::TooManyMethods { class: "Probe".into(), count: MAX_METHODS + 1 });
    }

    #[test]
    fn properties_need_registered_accessors() {
        let engine = FakeEngine::new();
        let builder = ClassBuilder::new("Probe", "Node", |_| Probe)
            .method("get_speed", |_: &mut Probe| 1.0f64)
            .property("speed", VariantType::Float, "get_speed", "set_speed");
        let err = builder.build(ClassId::next(), engine.runtime()).unwrap_err();
        assert!(matches!(err, RegistrationError::UnknownAccessor { ref accessor, .. } if accessor == "set_speed"));
    }

    #[test]
    fn names_must_be_c_strings() {
        let engine = FakeEngine::new();
        let err = ClassBuilder::new("Pro\0be", "Node", |_| Probe).build(ClassId::next(), engine.runtime()).unwrap_err();
        assert!(matches!(err, RegistrationError::InvalidName { .. }));
        let err = ClassBuilder::new("", "Node", |_| Probe).build(ClassId::next(), engine.runtime()).unwrap_err();
        assert!(matches!(err, RegistrationError::InvalidName { .. }));
    }

    #[test]
    fn method_hashes_follow_signatures() {
        let engine = FakeEngine::new();
        let entry = ClassBuilder::new("Probe", "Node", |_| Probe)
            .method("a", |_: &mut Probe, _x: i64| {})
            .method("b", |_: &mut Probe, _x: f64| {})
            .build(ClassId::next(), engine.runtime())
            .unwrap();
        assert_eq!(entry.methods[0].hash, MethodHash::of_method("Probe", "a", &[VariantType::Int], None));
        assert_ne!(entry.methods[0].hash, entry.methods[1].hash);
        assert_eq!(entry.methods[1].flags, MethodFlags::DEFAULT);
    }
}
