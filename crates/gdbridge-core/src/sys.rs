//! Raw ABI surface.
//!
//! Pointer aliases, `#[repr(C)]` records and the function-pointer table the
//! engine hands over at load time. Nothing in this module has policy; the safe
//! seam over it is [`NativeApi`](crate::api::NativeApi).

use std::ffi::{c_char, c_void};
use std::fmt;
use std::ptr;

use crate::error::ResolutionError;

pub type Bool = u8;
pub type Int = i64;
pub type InstanceId = u64;

pub type VariantPtr = *mut c_void;
pub type ConstVariantPtr = *const c_void;
pub type TypePtr = *mut c_void;
pub type ConstTypePtr = *const c_void;
pub type ObjectPtr = *mut c_void;
pub type MethodBindPtr = *const c_void;
pub type ClassLibraryPtr = *mut c_void;
pub type ClassInstancePtr = *mut c_void;

pub const TRUE: Bool = 1;
pub const FALSE: Bool = 0;

/// Interface major version this crate speaks.
pub const SUPPORTED_MAJOR_VERSION: u32 = 4;

// ============================================================================
// Resolved function types
// ============================================================================

pub type VariantFromTypeFn = unsafe extern "C" fn(r_variant: VariantPtr, native: TypePtr);
pub type TypeFromVariantFn = unsafe extern "C" fn(r_native: TypePtr, variant: VariantPtr);
pub type PtrOperatorEvaluator = unsafe extern "C" fn(left: ConstTypePtr, right: ConstTypePtr, r_result: TypePtr);
pub type PtrConstructor = unsafe extern "C" fn(r_base: TypePtr, args: *const ConstTypePtr);
pub type PtrDestructor = unsafe extern "C" fn(base: TypePtr);
pub type PtrBuiltInMethod = unsafe extern "C" fn(base: TypePtr, args: *const ConstTypePtr, r_return: TypePtr, argc: i32);
pub type PtrUtilityFunction = unsafe extern "C" fn(r_return: TypePtr, args: *const ConstTypePtr, argc: i32);

// ============================================================================
// Callbacks exposed to the engine
// ============================================================================

pub type InitializeFn = unsafe extern "C" fn(userdata: *mut c_void, level: u32);
pub type CreateInstanceFn = unsafe extern "C" fn(class_userdata: *mut c_void) -> ObjectPtr;
pub type FreeInstanceFn = unsafe extern "C" fn(class_userdata: *mut c_void, instance: ClassInstancePtr);
pub type CallVirtualFn = unsafe extern "C" fn(instance: ClassInstancePtr, args: *const ConstTypePtr, r_ret: TypePtr);
pub type GetVirtualFn = unsafe extern "C" fn(class_userdata: *mut c_void, name: *const c_char) -> Option<CallVirtualFn>;
pub type MethodCallFn = unsafe extern "C" fn(
    method_userdata: *mut c_void,
    instance: ClassInstancePtr,
    args: *const ConstVariantPtr,
    argc: Int,
    r_return: VariantPtr,
    r_error: *mut RawCallError,
);
pub type MethodPtrCallFn =
    unsafe extern "C" fn(method_userdata: *mut c_void, instance: ClassInstancePtr, args: *const ConstTypePtr, r_ret: TypePtr);
pub type InstanceBindingCreateFn = unsafe extern "C" fn(token: *mut c_void, instance: *mut c_void) -> *mut c_void;
pub type InstanceBindingFreeFn = unsafe extern "C" fn(token: *mut c_void, instance: *mut c_void, binding: *mut c_void);
pub type InstanceBindingReferenceFn = unsafe extern "C" fn(token: *mut c_void, binding: *mut c_void, reference: Bool) -> Bool;

/// Signature of the single exported entry function.
pub type EntryFn =
    unsafe extern "C" fn(interface: *const RawInterface, library: ClassLibraryPtr, init: *mut RawInitialization) -> Bool;

// ============================================================================
// Records
// ============================================================================

/// Call-error record written by checked calls.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawCallError {
    pub error: i32,
    pub argument: i32,
    pub expected: i32,
}

/// Filled in by the entry function.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawInitialization {
    pub minimum_initialization_level: u32,
    pub userdata: *mut c_void,
    pub initialize: Option<InitializeFn>,
    pub deinitialize: Option<InitializeFn>,
}

impl Default for RawInitialization {
    fn default() -> Self {
        Self {
            minimum_initialization_level: 0,
            userdata: ptr::null_mut(),
            initialize: None,
            deinitialize: None,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawInstanceBindingCallbacks {
    pub create_callback: Option<InstanceBindingCreateFn>,
    pub free_callback: Option<InstanceBindingFreeFn>,
    pub reference_callback: Option<InstanceBindingReferenceFn>,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawPropertyInfo {
    pub ty: u32,
    pub name: *const c_char,
    pub class_name: *const c_char,
    pub hint: u32,
    pub hint_string: *const c_char,
    pub usage: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawMethodInfo {
    pub name: *const c_char,
    pub method_userdata: *mut c_void,
    pub call_func: Option<MethodCallFn>,
    pub ptrcall_func: Option<MethodPtrCallFn>,
    pub method_flags: u32,
    pub hash: u32,
    pub has_return_value: Bool,
    pub return_value_info: *const RawPropertyInfo,
    pub argument_count: u32,
    pub arguments_info: *const RawPropertyInfo,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawClassCreationInfo {
    pub is_virtual: Bool,
    pub is_abstract: Bool,
    pub class_userdata: *mut c_void,
    pub create_instance_func: Option<CreateInstanceFn>,
    pub free_instance_func: Option<FreeInstanceFn>,
    pub get_virtual_func: Option<GetVirtualFn>,
}

// ============================================================================
// Interface table
// ============================================================================

macro_rules! native_interface {
    ($( fn $name:ident($($arg:ident: $ty:ty),* $(,)?) $(-> $ret:ty)?; )*) => {
        /// Function table supplied by the engine at load time.
        ///
        /// Entries are nullable until resolved into a [`ResolvedInterface`].
        #[repr(C)]
        #[derive(Clone, Copy)]
        pub struct RawInterface {
            pub version_major: u32,
            pub version_minor: u32,
            pub version_patch: u32,
            pub version_string: *const c_char,
            $( pub $name: Option<unsafe extern "C" fn($($arg: $ty),*) $(-> $ret)?>, )*
        }

        /// [`RawInterface`] with every entry point present.
        #[derive(Clone, Copy)]
        pub struct ResolvedInterface {
            $( pub $name: unsafe extern "C" fn($($arg: $ty),*) $(-> $ret)?, )*
        }

        impl RawInterface {
            /// A table of the given version with no entry points filled in.
            pub const fn empty(version_major: u32, version_minor: u32) -> Self {
                Self {
                    version_major,
                    version_minor,
                    version_patch: 0,
                    version_string: ptr::null(),
                    $( $name: None, )*
                }
            }
        }

        impl ResolvedInterface {
            /// Checks the version and that no entry point is null.
            pub fn resolve(raw: &RawInterface) -> Result<Self, ResolutionError> {
                if raw.version_major != SUPPORTED_MAJOR_VERSION {
                    return Err(ResolutionError::IncompatibleVersion {
                        major: raw.version_major,
                        minor: raw.version_minor,
                    });
                }
                Ok(Self {
                    $( $name: raw.$name.ok_or(ResolutionError::MissingSymbol { symbol: stringify!($name) })?, )*
                })
            }
        }
    };
}

native_interface! {
    fn mem_alloc(bytes: usize) -> *mut c_void;
    fn mem_realloc(ptr: *mut c_void, bytes: usize) -> *mut c_void;
    fn mem_free(ptr: *mut c_void);

    fn print_error(description: *const c_char, function: *const c_char, file: *const c_char, line: i32, editor_notify: Bool);
    fn print_warning(description: *const c_char, function: *const c_char, file: *const c_char, line: i32, editor_notify: Bool);
    fn print_script_error(description: *const c_char, function: *const c_char, file: *const c_char, line: i32, editor_notify: Bool);
    fn get_native_struct_size(name: *const c_char) -> u64;

    fn variant_new_copy(r_dest: VariantPtr, src: ConstVariantPtr);
    fn variant_new_nil(r_dest: VariantPtr);
    fn variant_destroy(variant: VariantPtr);
    fn variant_call(variant: VariantPtr, method: *const c_char, args: *const ConstVariantPtr, argc: Int, r_return: VariantPtr, r_error: *mut RawCallError);
    fn variant_evaluate(op: u32, left: ConstVariantPtr, right: ConstVariantPtr, r_return: VariantPtr, r_valid: *mut Bool);
    fn variant_get(variant: ConstVariantPtr, key: ConstVariantPtr, r_return: VariantPtr, r_valid: *mut Bool);
    fn variant_set(variant: VariantPtr, key: ConstVariantPtr, value: ConstVariantPtr, r_valid: *mut Bool);
    fn variant_hash(variant: ConstVariantPtr) -> Int;
    fn variant_stringify(variant: ConstVariantPtr, r_string: TypePtr);
    fn variant_get_type(variant: ConstVariantPtr) -> u32;
    fn variant_booleanize(variant: ConstVariantPtr) -> Bool;

    fn get_variant_from_type_constructor(ty: u32) -> Option<VariantFromTypeFn>;
    fn get_variant_to_type_constructor(ty: u32) -> Option<TypeFromVariantFn>;
    fn variant_get_ptr_operator_evaluator(op: u32, left: u32, right: u32) -> Option<PtrOperatorEvaluator>;
    fn variant_get_ptr_constructor(ty: u32, index: i32) -> Option<PtrConstructor>;
    fn variant_get_ptr_destructor(ty: u32) -> Option<PtrDestructor>;
    fn variant_get_ptr_builtin_method(ty: u32, method: *const c_char, hash: Int) -> Option<PtrBuiltInMethod>;
    fn variant_get_ptr_utility_function(name: *const c_char, hash: Int) -> Option<PtrUtilityFunction>;

    fn string_new_with_utf8_chars_and_len(r_dest: TypePtr, contents: *const c_char, len: Int);
    fn string_to_utf8_chars(string: ConstTypePtr, r_text: *mut c_char, max_len: Int) -> Int;
    fn array_operator_index(array: TypePtr, index: Int) -> VariantPtr;
    fn dictionary_operator_index(dictionary: TypePtr, key: ConstVariantPtr) -> VariantPtr;

    fn object_method_bind_call(bind: MethodBindPtr, object: ObjectPtr, args: *const ConstVariantPtr, argc: Int, r_return: VariantPtr, r_error: *mut RawCallError);
    fn object_method_bind_ptrcall(bind: MethodBindPtr, object: ObjectPtr, args: *const ConstTypePtr, r_ret: TypePtr);
    fn object_destroy(object: ObjectPtr);
    fn global_get_singleton(name: *const c_char) -> ObjectPtr;
    fn object_get_instance_binding(object: ObjectPtr, token: *mut c_void, callbacks: *const RawInstanceBindingCallbacks) -> *mut c_void;
    fn object_set_instance(object: ObjectPtr, class_name: *const c_char, instance: ClassInstancePtr);
    fn object_cast_to(object: ObjectPtr, class_tag: *mut c_void) -> ObjectPtr;
    fn object_get_instance_from_id(id: InstanceId) -> ObjectPtr;
    fn object_get_instance_id(object: ObjectPtr) -> InstanceId;

    fn classdb_construct_object(class_name: *const c_char) -> ObjectPtr;
    fn classdb_get_method_bind(class_name: *const c_char, method: *const c_char, hash: Int) -> MethodBindPtr;
    fn classdb_get_class_tag(class_name: *const c_char) -> *mut c_void;
    fn classdb_register_extension_class(library: ClassLibraryPtr, class_name: *const c_char, parent_name: *const c_char, info: *const RawClassCreationInfo);
    fn classdb_register_extension_class_method(library: ClassLibraryPtr, class_name: *const c_char, info: *const RawMethodInfo);
    fn classdb_register_extension_class_property(library: ClassLibraryPtr, class_name: *const c_char, info: *const RawPropertyInfo, setter: *const c_char, getter: *const c_char);
    fn classdb_register_extension_class_signal(library: ClassLibraryPtr, class_name: *const c_char, signal: *const c_char, args: *const RawPropertyInfo, argc: Int);
    fn classdb_unregister_extension_class(library: ClassLibraryPtr, class_name: *const c_char);
}

impl fmt::Debug for RawInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawInterface")
            .field("version_major", &self.version_major)
            .field("version_minor", &self.version_minor)
            .field("version_patch", &self.version_patch)
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for ResolvedInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedInterface").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe extern "C" fn fake_alloc(_bytes: usize) -> *mut c_void {
        ptr::null_mut()
    }

    #[test]
    fn empty_table_reports_first_missing_symbol() {
        let raw = RawInterface::empty(4, 3);
        let err = ResolvedInterface::resolve(&raw).unwrap_err();
        assert_eq!(err, ResolutionError::MissingSymbol { symbol: "mem_alloc" });
    }

    #[test]
    fn later_symbols_are_checked_in_order() {
        let mut raw = RawInterface::empty(4, 3);
        raw.mem_alloc = Some(fake_alloc);
        let err = ResolvedInterface::resolve(&raw).unwrap_err();
        assert_eq!(err, ResolutionError::MissingSymbol { symbol: "mem_realloc" });
    }

    #[test]
    fn wrong_major_version_is_rejected() {
        let raw = RawInterface::empty(3, 5);
        let err = ResolvedInterface::resolve(&raw).unwrap_err();
        assert_eq!(err, ResolutionError::IncompatibleVersion { major: 3, minor: 5 });
    }

    #[test]
    fn call_error_record_defaults_to_ok() {
        assert_eq!(RawCallError::default().error, 0);
    }
}
