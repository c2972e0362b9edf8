//! Safe seam over the engine's function table.
//!
//! [`NativeApi`] has one method per consumed entry point. [`RawApi`] forwards
//! to a resolved [`RawInterface`]; tests substitute an in-process fake. The
//! active implementation travels inside [`Runtime`](crate::runtime::Runtime)
//! so that no code reaches for a process global.

use std::ffi::{CStr, c_char, c_void};
use std::fmt;
use std::ptr;

use crate::error::ResolutionError;
use crate::sys::*;
use crate::types::{Operator, VariantType};

/// Engine entry points used by the binding layer.
///
/// Methods taking raw pointers are `unsafe`: callers guarantee the pointers
/// reference live storage of the layout the engine expects for the call.
pub trait NativeApi: Send + Sync {
    fn print_error(&self, description: &CStr, function: &CStr, file: &CStr, line: i32, notify_editor: bool);
    fn print_warning(&self, description: &CStr, function: &CStr, file: &CStr, line: i32, notify_editor: bool);
    fn print_script_error(&self, description: &CStr, function: &CStr, file: &CStr, line: i32, notify_editor: bool);

    unsafe fn variant_new_copy(&self, dest: VariantPtr, src: ConstVariantPtr);
    unsafe fn variant_new_nil(&self, dest: VariantPtr);
    unsafe fn variant_destroy(&self, variant: VariantPtr);
    unsafe fn variant_call(&self, variant: VariantPtr, method: &CStr, args: &[ConstVariantPtr], ret: VariantPtr) -> RawCallError;
    unsafe fn variant_evaluate(&self, op: Operator, left: ConstVariantPtr, right: ConstVariantPtr, ret: VariantPtr) -> bool;
    unsafe fn variant_get(&self, variant: ConstVariantPtr, key: ConstVariantPtr, ret: VariantPtr) -> bool;
    unsafe fn variant_set(&self, variant: VariantPtr, key: ConstVariantPtr, value: ConstVariantPtr) -> bool;
    unsafe fn variant_hash(&self, variant: ConstVariantPtr) -> i64;
    unsafe fn variant_stringify(&self, variant: ConstVariantPtr, r_string: TypePtr);
    unsafe fn variant_get_type(&self, variant: ConstVariantPtr) -> VariantType;
    unsafe fn variant_booleanize(&self, variant: ConstVariantPtr) -> bool;

    fn variant_from_type_constructor(&self, ty: VariantType) -> Option<VariantFromTypeFn>;
    fn variant_to_type_constructor(&self, ty: VariantType) -> Option<TypeFromVariantFn>;
    fn ptr_operator_evaluator(&self, op: Operator, left: VariantType, right: VariantType) -> Option<PtrOperatorEvaluator>;
    fn ptr_constructor(&self, ty: VariantType, index: i32) -> Option<PtrConstructor>;
    fn ptr_destructor(&self, ty: VariantType) -> Option<PtrDestructor>;
    fn ptr_builtin_method(&self, ty: VariantType, method: &CStr, hash: i64) -> Option<PtrBuiltInMethod>;
    fn ptr_utility_function(&self, name: &CStr, hash: i64) -> Option<PtrUtilityFunction>;

    /// Constructs a native string from UTF-8 text into uninitialized `dest`.
    unsafe fn string_new_with_utf8(&self, dest: TypePtr, text: &str);
    /// Copies up to `buf.len()` bytes of UTF-8 and returns the full length.
    unsafe fn string_to_utf8(&self, string: ConstTypePtr, buf: &mut [u8]) -> usize;
    unsafe fn array_operator_index(&self, array: TypePtr, index: i64) -> VariantPtr;
    unsafe fn dictionary_operator_index(&self, dictionary: TypePtr, key: ConstVariantPtr) -> VariantPtr;

    unsafe fn object_method_bind_call(
        &self,
        bind: MethodBindPtr,
        object: ObjectPtr,
        args: &[ConstVariantPtr],
        ret: VariantPtr,
    ) -> RawCallError;
    unsafe fn object_method_bind_ptrcall(&self, bind: MethodBindPtr, object: ObjectPtr, args: *const ConstTypePtr, ret: TypePtr);
    unsafe fn object_destroy(&self, object: ObjectPtr);
    fn global_get_singleton(&self, name: &CStr) -> ObjectPtr;
    unsafe fn object_get_instance_binding(
        &self,
        object: ObjectPtr,
        token: *mut c_void,
        callbacks: &'static RawInstanceBindingCallbacks,
    ) -> *mut c_void;
    unsafe fn object_set_instance(&self, object: ObjectPtr, class_name: &CStr, instance: ClassInstancePtr);
    unsafe fn object_cast_to(&self, object: ObjectPtr, class_tag: *mut c_void) -> ObjectPtr;
    fn object_get_instance_from_id(&self, id: InstanceId) -> ObjectPtr;
    unsafe fn object_get_instance_id(&self, object: ObjectPtr) -> InstanceId;

    fn classdb_construct_object(&self, class_name: &CStr) -> ObjectPtr;
    fn classdb_get_method_bind(&self, class_name: &CStr, method: &CStr, hash: i64) -> MethodBindPtr;
    fn classdb_get_class_tag(&self, class_name: &CStr) -> *mut c_void;
    unsafe fn classdb_register_extension_class(
        &self,
        library: ClassLibraryPtr,
        class_name: &CStr,
        parent_name: &CStr,
        info: &RawClassCreationInfo,
    );
    unsafe fn classdb_register_extension_class_method(&self, library: ClassLibraryPtr, class_name: &CStr, info: &RawMethodInfo);
    unsafe fn classdb_register_extension_class_property(
        &self,
        library: ClassLibraryPtr,
        class_name: &CStr,
        info: &RawPropertyInfo,
        setter: &CStr,
        getter: &CStr,
    );
    unsafe fn classdb_register_extension_class_signal(
        &self,
        library: ClassLibraryPtr,
        class_name: &CStr,
        signal: &CStr,
        args: &[RawPropertyInfo],
    );
    unsafe fn classdb_unregister_extension_class(&self, library: ClassLibraryPtr, class_name: &CStr);
}

/// [`NativeApi`] backed by the table the engine passed to the entry function.
#[derive(Clone, Copy)]
pub struct RawApi {
    table: ResolvedInterface,
}

impl RawApi {
    /// Resolves the engine's table.
    ///
    /// # Safety
    ///
    /// `interface` must be null or point to a valid [`RawInterface`].
    pub unsafe fn load(interface: *const RawInterface) -> Result<Self, ResolutionError> {
        let raw = unsafe { interface.as_ref() }.ok_or(ResolutionError::MissingSymbol { symbol: "interface" })?;
        Ok(Self { table: ResolvedInterface::resolve(raw)? })
    }

    /// The resolved table, for entry points without a safe wrapper.
    pub fn interface(&self) -> &ResolvedInterface {
        &self.table
    }
}

impl fmt::Debug for RawApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawApi").finish_non_exhaustive()
    }
}

fn arg_count(args: &[ConstVariantPtr]) -> Int {
    args.len() as Int
}

fn args_ptr(args: &[ConstVariantPtr]) -> *const ConstVariantPtr {
    if args.is_empty() { ptr::null() } else { args.as_ptr() }
}

impl NativeApi for RawApi {
    fn print_error(&self, description: &CStr, function: &CStr, file: &CStr, line: i32, notify_editor: bool) {
        unsafe {
            (self.table.print_error)(description.as_ptr(), function.as_ptr(), file.as_ptr(), line, notify_editor as Bool)
        }
    }

    fn print_warning(&self, description: &CStr, function: &CStr, file: &CStr, line: i32, notify_editor: bool) {
        unsafe {
            (self.table.print_warning)(description.as_ptr(), function.as_ptr(), file.as_ptr(), line, notify_editor as Bool)
        }
    }

    fn print_script_error(&self, description: &CStr, function: &CStr, file: &CStr, line: i32, notify_editor: bool) {
        unsafe {
            (self.table.print_script_error)(
                description.as_ptr(),
                function.as_ptr(),
                file.as_ptr(),
                line,
                notify_editor as Bool,
            )
        }
    }

    unsafe fn variant_new_copy(&self, dest: VariantPtr, src: ConstVariantPtr) {
        unsafe { (self.table.variant_new_copy)(dest, src) }
    }

    unsafe fn variant_new_nil(&self, dest: VariantPtr) {
        unsafe { (self.table.variant_new_nil)(dest) }
    }

    unsafe fn variant_destroy(&self, variant: VariantPtr) {
        unsafe { (self.table.variant_destroy)(variant) }
    }

    unsafe fn variant_call(&self, variant: VariantPtr, method: &CStr, args: &[ConstVariantPtr], ret: VariantPtr) -> RawCallError {
        let mut error = RawCallError::default();
        unsafe { (self.table.variant_call)(variant, method.as_ptr(), args_ptr(args), arg_count(args), ret, &mut error) };
        error
    }

    unsafe fn variant_evaluate(&self, op: Operator, left: ConstVariantPtr, right: ConstVariantPtr, ret: VariantPtr) -> bool {
        let mut valid = FALSE;
        unsafe { (self.table.variant_evaluate)(op.into(), left, right, ret, &mut valid) };
        valid != FALSE
    }

    unsafe fn variant_get(&self, variant: ConstVariantPtr, key: ConstVariantPtr, ret: VariantPtr) -> bool {
        let mut valid = FALSE;
        unsafe { (self.table.variant_get)(variant, key, ret, &mut valid) };
        valid != FALSE
    }

    unsafe fn variant_set(&self, variant: VariantPtr, key: ConstVariantPtr, value: ConstVariantPtr) -> bool {
        let mut valid = FALSE;
        unsafe { (self.table.variant_set)(variant, key, value, &mut valid) };
        valid != FALSE
    }

    unsafe fn variant_hash(&self, variant: ConstVariantPtr) -> i64 {
        unsafe { (self.table.variant_hash)(variant) }
    }

    unsafe fn variant_stringify(&self, variant: ConstVariantPtr, r_string: TypePtr) {
        unsafe { (self.table.variant_stringify)(variant, r_string) }
    }

    unsafe fn variant_get_type(&self, variant: ConstVariantPtr) -> VariantType {
        let code = unsafe { (self.table.variant_get_type)(variant) };
        VariantType::try_from(code).unwrap_or(VariantType::Nil)
    }

    unsafe fn variant_booleanize(&self, variant: ConstVariantPtr) -> bool {
        unsafe { (self.table.variant_booleanize)(variant) != FALSE }
    }

    fn variant_from_type_constructor(&self, ty: VariantType) -> Option<VariantFromTypeFn> {
        unsafe { (self.table.get_variant_from_type_constructor)(ty.into()) }
    }

    fn variant_to_type_constructor(&self, ty: VariantType) -> Option<TypeFromVariantFn> {
        unsafe { (self.table.get_variant_to_type_constructor)(ty.into()) }
    }

    fn ptr_operator_evaluator(&self, op: Operator, left: VariantType, right: VariantType) -> Option<PtrOperatorEvaluator> {
        unsafe { (self.table.variant_get_ptr_operator_evaluator)(op.into(), left.into(), right.into()) }
    }

    fn ptr_constructor(&self, ty: VariantType, index: i32) -> Option<PtrConstructor> {
        unsafe { (self.table.variant_get_ptr_constructor)(ty.into(), index) }
    }

    fn ptr_destructor(&self, ty: VariantType) -> Option<PtrDestructor> {
        unsafe { (self.table.variant_get_ptr_destructor)(ty.into()) }
    }

    fn ptr_builtin_method(&self, ty: VariantType, method: &CStr, hash: i64) -> Option<PtrBuiltInMethod> {
        unsafe { (self.table.variant_get_ptr_builtin_method)(ty.into(), method.as_ptr(), hash) }
    }

    fn ptr_utility_function(&self, name: &CStr, hash: i64) -> Option<PtrUtilityFunction> {
        unsafe { (self.table.variant_get_ptr_utility_function)(name.as_ptr(), hash) }
    }

    unsafe fn string_new_with_utf8(&self, dest: TypePtr, text: &str) {
        unsafe {
            (self.table.string_new_with_utf8_chars_and_len)(dest, text.as_ptr() as *const c_char, text.len() as Int)
        }
    }

    unsafe fn string_to_utf8(&self, string: ConstTypePtr, buf: &mut [u8]) -> usize {
        let len = unsafe { (self.table.string_to_utf8_chars)(string, buf.as_mut_ptr() as *mut c_char, buf.len() as Int) };
        len.max(0) as usize
    }

    unsafe fn array_operator_index(&self, array: TypePtr, index: i64) -> VariantPtr {
        unsafe { (self.table.array_operator_index)(array, index) }
    }

    unsafe fn dictionary_operator_index(&self, dictionary: TypePtr, key: ConstVariantPtr) -> VariantPtr {
        unsafe { (self.table.dictionary_operator_index)(dictionary, key) }
    }

    unsafe fn object_method_bind_call(
        &self,
        bind: MethodBindPtr,
        object: ObjectPtr,
        args: &[ConstVariantPtr],
        ret: VariantPtr,
    ) -> RawCallError {
        let mut error = RawCallError::default();
        unsafe { (self.table.object_method_bind_call)(bind, object, args_ptr(args), arg_count(args), ret, &mut error) };
        error
    }

    unsafe fn object_method_bind_ptrcall(&self, bind: MethodBindPtr, object: ObjectPtr, args: *const ConstTypePtr, ret: TypePtr) {
        unsafe { (self.table.object_method_bind_ptrcall)(bind, object, args, ret) }
    }

    unsafe fn object_destroy(&self, object: ObjectPtr) {
        unsafe { (self.table.object_destroy)(object) }
    }

    fn global_get_singleton(&self, name: &CStr) -> ObjectPtr {
        unsafe { (self.table.global_get_singleton)(name.as_ptr()) }
    }

    unsafe fn object_get_instance_binding(
        &self,
        object: ObjectPtr,
        token: *mut c_void,
        callbacks: &'static RawInstanceBindingCallbacks,
    ) -> *mut c_void {
        unsafe { (self.table.object_get_instance_binding)(object, token, callbacks) }
    }

    unsafe fn object_set_instance(&self, object: ObjectPtr, class_name: &CStr, instance: ClassInstancePtr) {
        unsafe { (self.table.object_set_instance)(object, class_name.as_ptr(), instance) }
    }

    unsafe fn object_cast_to(&self, object: ObjectPtr, class_tag: *mut c_void) -> ObjectPtr {
        unsafe { (self.table.object_cast_to)(object, class_tag) }
    }

    fn object_get_instance_from_id(&self, id: InstanceId) -> ObjectPtr {
        unsafe { (self.table.object_get_instance_from_id)(id) }
    }

    unsafe fn object_get_instance_id(&self, object: ObjectPtr) -> InstanceId {
        unsafe { (self.table.object_get_instance_id)(object) }
    }

    fn classdb_construct_object(&self, class_name: &CStr) -> ObjectPtr {
        unsafe { (self.table.classdb_construct_object)(class_name.as_ptr()) }
    }

    fn classdb_get_method_bind(&self, class_name: &CStr, method: &CStr, hash: i64) -> MethodBindPtr {
        unsafe { (self.table.classdb_get_method_bind)(class_name.as_ptr(), method.as_ptr(), hash) }
    }

    fn classdb_get_class_tag(&self, class_name: &CStr) -> *mut c_void {
        unsafe { (self.table.classdb_get_class_tag)(class_name.as_ptr()) }
    }

    unsafe fn classdb_register_extension_class(
        &self,
        library: ClassLibraryPtr,
        class_name: &CStr,
        parent_name: &CStr,
        info: &RawClassCreationInfo,
    ) {
        unsafe { (self.table.classdb_register_extension_class)(library, class_name.as_ptr(), parent_name.as_ptr(), info) }
    }

    unsafe fn classdb_register_extension_class_method(&self, library: ClassLibraryPtr, class_name: &CStr, info: &RawMethodInfo) {
        unsafe { (self.table.classdb_register_extension_class_method)(library, class_name.as_ptr(), info) }
    }

    unsafe fn classdb_register_extension_class_property(
        &self,
        library: ClassLibraryPtr,
        class_name: &CStr,
        info: &RawPropertyInfo,
        setter: &CStr,
        getter: &CStr,
    ) {
        unsafe {
            (self.table.classdb_register_extension_class_property)(
                library,
                class_name.as_ptr(),
                info,
                setter.as_ptr(),
                getter.as_ptr(),
            )
        }
    }

    unsafe fn classdb_register_extension_class_signal(
        &self,
        library: ClassLibraryPtr,
        class_name: &CStr,
        signal: &CStr,
        args: &[RawPropertyInfo],
    ) {
        let args_ptr = if args.is_empty() { ptr::null() } else { args.as_ptr() };
        unsafe {
            (self.table.classdb_register_extension_class_signal)(
                library,
                class_name.as_ptr(),
                signal.as_ptr(),
                args_ptr,
                args.len() as Int,
            )
        }
    }

    unsafe fn classdb_unregister_extension_class(&self, library: ClassLibraryPtr, class_name: &CStr) {
        unsafe { (self.table.classdb_unregister_extension_class)(library, class_name.as_ptr()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_interface_is_a_resolution_error() {
        let err = unsafe { RawApi::load(ptr::null()) }.unwrap_err();
        assert_eq!(err, ResolutionError::MissingSymbol { symbol: "interface" });
    }

    #[test]
    fn incomplete_interface_is_rejected() {
        let raw = RawInterface::empty(4, 2);
        assert!(matches!(unsafe { RawApi::load(&raw) }, Err(ResolutionError::MissingSymbol { .. })));
    }

    #[test]
    fn empty_argument_lists_pass_null() {
        assert!(args_ptr(&[]).is_null());
        assert_eq!(arg_count(&[ptr::null()]), 1);
    }
}
