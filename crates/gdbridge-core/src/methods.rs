//! Resolved engine functions: class method binds, builtin-type methods and
//! utility functions, plus the tables resolved during staged linking.

use std::ffi::c_void;
use std::fmt;

use log::trace;

use crate::api::NativeApi;
use crate::error::{CallError, ResolutionError, c_name};
use crate::lifetime::{HandleKind, Lifetime, RawHandle};
use crate::object::Object;
use crate::sys::{MethodBindPtr, PtrBuiltInMethod, PtrUtilityFunction};
use crate::types::VariantType;
use crate::variant::Variant;

/// An engine class method.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MethodBind {
    ptr: MethodBindPtr,
}

// SAFETY: method binds are immutable engine-global descriptors valid for the
// process lifetime; the pointer is only ever passed back to the engine.
unsafe impl Send for MethodBind {}
unsafe impl Sync for MethodBind {}

impl MethodBind {
    /// Looks up `class.method` with the signature hash the engine expects.
    pub fn resolve(api: &dyn NativeApi, class: &str, method: &str, hash: i64) -> Result<Self, ResolutionError> {
        let ptr = api.classdb_get_method_bind(&c_name(class)?, &c_name(method)?, hash);
        if ptr.is_null() {
            return Err(ResolutionError::MissingMethodBind { class: class.to_owned(), method: method.to_owned(), hash });
        }
        trace!("resolved method bind {class}.{method}");
        Ok(Self { ptr })
    }

    #[inline]
    pub fn as_ptr(&self) -> MethodBindPtr {
        self.ptr
    }

    /// Checked dynamic call with Variant arguments.
    ///
    /// Argument count and types are validated by the engine; a mismatch is
    /// returned as a [`CallError`] rather than invoking the method.
    pub fn call(&self, life: &Lifetime, object: &Object, args: &[&Variant]) -> Result<Variant, CallError> {
        let runtime = life.runtime();
        let pointers: Vec<_> = args.iter().map(|arg| arg.handle().raw().as_ptr()).collect();
        let mut ret = RawHandle::empty(HandleKind::Variant);
        let error = unsafe { runtime.api().object_method_bind_call(self.ptr, object.ptr(), &pointers, ret.as_mut_ptr()) };
        // The engine initializes the return Variant even on failure.
        let ret = Variant::from_handle(life.register(ret));
        CallError::check(&error)?;
        Ok(ret)
    }
}

impl fmt::Debug for MethodBind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MethodBind({:p})", self.ptr)
    }
}

/// A method on a builtin Variant type, called with the receiver as target.
#[derive(Clone, Copy)]
pub struct BuiltinMethod {
    function: PtrBuiltInMethod,
}

impl BuiltinMethod {
    pub fn resolve(api: &dyn NativeApi, ty: VariantType, method: &str, hash: i64) -> Result<Self, ResolutionError> {
        api.ptr_builtin_method(ty, &c_name(method)?, hash)
            .map(|function| Self { function })
            .ok_or_else(|| ResolutionError::MissingBuiltinMethod { ty, method: method.to_owned(), hash })
    }

    #[inline]
    pub fn as_fn(&self) -> PtrBuiltInMethod {
        self.function
    }
}

impl fmt::Debug for BuiltinMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BuiltinMethod")
    }
}

/// A global utility function such as `absi` or `print`.
#[derive(Clone, Copy)]
pub struct UtilityFunction {
    function: PtrUtilityFunction,
}

impl UtilityFunction {
    /// Resolves on demand; utility functions are not part of any linked table.
    pub fn resolve(api: &dyn NativeApi, name: &str, hash: i64) -> Result<Self, ResolutionError> {
        api.ptr_utility_function(&c_name(name)?, hash)
            .map(|function| Self { function })
            .ok_or_else(|| ResolutionError::MissingUtility { name: name.to_owned(), hash })
    }

    #[inline]
    pub fn as_fn(&self) -> PtrUtilityFunction {
        self.function
    }
}

impl fmt::Debug for UtilityFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UtilityFunction")
    }
}

/// Opaque engine class identity, used for checked downcasts.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ClassTag {
    ptr: *mut c_void,
}

// SAFETY: class tags are engine-global identifiers that are never dereferenced.
unsafe impl Send for ClassTag {}
unsafe impl Sync for ClassTag {}

impl ClassTag {
    pub fn resolve(api: &dyn NativeApi, class: &str) -> Result<Self, ResolutionError> {
        let ptr = api.classdb_get_class_tag(&c_name(class)?);
        if ptr.is_null() {
            return Err(ResolutionError::MissingClassTag { class: class.to_owned() });
        }
        Ok(Self { ptr })
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut c_void {
        self.ptr
    }
}

impl fmt::Debug for ClassTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClassTag({:p})", self.ptr)
    }
}

/// Declares a struct of method binds resolved from one engine class.
///
/// ```ignore
/// method_table! {
///     pub struct NodeMethods for "Node" {
///         get_name = ("get_name", 2002593661),
///     }
/// }
/// ```
#[macro_export]
macro_rules! method_table {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident for $class:literal {
            $($field:ident = ($method:literal, $hash:literal)),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy)]
        $vis struct $name {
            $(pub $field: $crate::methods::MethodBind,)*
        }

        impl $name {
            pub const CLASS: &'static str = $class;

            pub fn resolve(api: &dyn $crate::api::NativeApi) -> ::std::result::Result<Self, $crate::error::ResolutionError> {
                Ok(Self {
                    $($field: $crate::methods::MethodBind::resolve(api, $class, $method, $hash)?,)*
                })
            }
        }
    };
}

method_table! {
    /// `RefCounted` methods the ownership tracker drives.
    pub struct RefCountedMethods for "RefCounted" {
        init_ref = ("init_ref", 2240911060),
        reference = ("reference", 2240911060),
        unreference = ("unreference", 2240911060),
        get_reference_count = ("get_reference_count", 3905245786),
    }
}

/// Class-level table linked at the scene level.
#[derive(Debug, Clone, Copy)]
pub struct CoreClasses {
    pub ref_counted: RefCountedMethods,
    pub ref_counted_tag: ClassTag,
}

impl CoreClasses {
    pub fn link(api: &dyn NativeApi) -> Result<Self, ResolutionError> {
        Ok(Self { ref_counted: RefCountedMethods::resolve(api)?, ref_counted_tag: ClassTag::resolve(api, "RefCounted")? })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifetime::Context;
    use crate::testing::{self, FakeEngine};
    use crate::variant::ToVariant;

    #[test]
    fn wrong_hash_is_a_resolution_error() {
        let engine = FakeEngine::new();
        let err = MethodBind::resolve(&engine, "RefCounted", "reference", 1).unwrap_err();
        assert!(matches!(err, ResolutionError::MissingMethodBind { ref method, hash: 1, .. } if method == "reference"));
    }

    #[test]
    fn unknown_utility_is_a_resolution_error() {
        let engine = FakeEngine::new();
        let err = UtilityFunction::resolve(&engine, "no_such_fn", 0).unwrap_err();
        assert_eq!(err, ResolutionError::MissingUtility { name: "no_such_fn".into(), hash: 0 });
    }

    #[test]
    fn core_classes_link_against_fake() {
        let engine = FakeEngine::new();
        let classes = CoreClasses::link(&engine).unwrap();
        assert_eq!(RefCountedMethods::CLASS, "RefCounted");
        assert_ne!(classes.ref_counted.reference, classes.ref_counted.unreference);
    }

    #[test]
    fn checked_call_reports_too_few_arguments() {
        let engine = FakeEngine::new();
        engine.define_method("Node", "set_pair", testing::PAIR_HASH, &[VariantType::Int, VariantType::Int], None, |_, _| {
            None
        });
        let runtime = engine.runtime();
        let ctx = Context::new(runtime.clone());
        let life = ctx.scope();
        let node = Object::construct(&life, "Node");
        let bind = MethodBind::resolve(runtime.api(), "Node", "set_pair", testing::PAIR_HASH).unwrap();

        let one = 1i64.to_variant(&life);
        let err = bind.call(&life, &node, &[&one]).unwrap_err();
        assert_eq!(err, CallError::TooFewArguments { expected: 2 });

        let two = 2i64.to_variant(&life);
        assert!(bind.call(&life, &node, &[&one, &two]).is_ok());
        node.free();
        life.end();
    }

    #[test]
    fn checked_call_reports_argument_type() {
        let engine = FakeEngine::new();
        engine.define_method("Node", "set_pair", testing::PAIR_HASH, &[VariantType::Int, VariantType::Int], None, |_, _| {
            None
        });
        let runtime = engine.runtime();
        let ctx = Context::new(runtime.clone());
        let life = ctx.scope();
        let node = Object::construct(&life, "Node");
        let bind = MethodBind::resolve(runtime.api(), "Node", "set_pair", testing::PAIR_HASH).unwrap();

        let int = 1i64.to_variant(&life);
        let text = "x".to_variant(&life);
        let err = bind.call(&life, &node, &[&int, &text]).unwrap_err();
        assert_eq!(err, CallError::InvalidArgument { argument: 1, expected: VariantType::Int });
        node.free();
        life.end();
    }
}
