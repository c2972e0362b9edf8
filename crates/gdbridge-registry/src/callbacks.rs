//! `extern "C"` entry points the engine calls for registered classes.
//!
//! Class userdata is a [`ClassId`]; method userdata packs the class id above
//! the method index; instance pointers are [`InstanceHandle`]s. Everything
//! resolves through the process-wide class directory.

use std::ffi::{CStr, c_char, c_void};
use std::sync::Arc;

use log::warn;

use gdbridge_core::error::CallError;
use gdbridge_core::sys::{
    CallVirtualFn, ClassInstancePtr, ConstTypePtr, ConstVariantPtr, Int, ObjectPtr, RawCallError, TypePtr, VariantPtr,
};

use crate::class::{ClassEntry, native_args};
use crate::handle::{ClassId, InstanceHandle};
use crate::method::{Arguments, ReturnSlot};
use crate::registry;
use crate::trampoline::trampoline;

const METHOD_INDEX_BITS: u32 = u16::BITS;

/// Userdata identifying method `index` of `class`.
pub(crate) fn method_userdata(class: ClassId, index: usize) -> *mut c_void {
    ((usize::from(class.get()) << METHOD_INDEX_BITS) | index) as *mut c_void
}

fn split_method_userdata(userdata: *mut c_void) -> (Option<ClassId>, usize) {
    let bits = userdata as usize;
    let class = ClassId::from_userdata((bits >> METHOD_INDEX_BITS) as *mut c_void);
    (class, bits & ((1 << METHOD_INDEX_BITS) - 1))
}

fn class_of(userdata: *mut c_void) -> Arc<ClassEntry> {
    match ClassId::from_userdata(userdata).and_then(registry::lookup) {
        Some(entry) => entry,
        None => panic!("engine passed unknown class userdata {userdata:p}"),
    }
}

fn class_of_instance(handle: InstanceHandle) -> Arc<ClassEntry> {
    match handle.class().and_then(registry::lookup) {
        Some(entry) => entry,
        None => panic!("{handle} belongs to no registered class"),
    }
}

pub(crate) unsafe extern "C" fn create_instance(class_userdata: *mut c_void) -> ObjectPtr {
    class_of(class_userdata).create()
}

pub(crate) unsafe extern "C" fn free_instance(class_userdata: *mut c_void, instance: ClassInstancePtr) {
    let handle = InstanceHandle::from_ptr(instance);
    class_of(class_userdata).free(handle);
}

pub(crate) unsafe extern "C" fn get_virtual(class_userdata: *mut c_void, name: *const c_char) -> Option<CallVirtualFn> {
    if name.is_null() {
        return None;
    }
    let name = unsafe { CStr::from_ptr(name) };
    let entry = class_of(class_userdata);
    let index = match name.to_str() {
        Ok(name) => entry.virtuals.index_of(name),
        Err(_) => 0,
    };
    trampoline(index)
}

/// Shared target of every virtual trampoline.
///
/// # Safety
///
/// `instance` must be a handle this crate issued and `args`/`ret` must match
/// the override's declared signature.
pub(crate) unsafe fn dispatch_virtual(instance: ClassInstancePtr, index: u8, args: *const ConstTypePtr, ret: TypePtr) {
    let handle = InstanceHandle::from_ptr(instance);
    let entry = class_of_instance(handle);
    unsafe { entry.call_virtual(handle, index, args, ret) }
}

pub(crate) unsafe extern "C" fn method_call(
    method_userdata: *mut c_void,
    instance: ClassInstancePtr,
    args: *const ConstVariantPtr,
    argc: Int,
    r_return: VariantPtr,
    r_error: *mut RawCallError,
) {
    let (class, index) = split_method_userdata(method_userdata);
    let result = if instance.is_null() {
        Err(CallError::InstanceIsNull)
    } else {
        let handle = InstanceHandle::from_ptr(instance);
        let entry = match class.and_then(registry::lookup) {
            Some(entry) => entry,
            None => panic!("engine passed unknown method userdata {method_userdata:p}"),
        };
        let args = unsafe { native_args(args, usize::try_from(argc).unwrap_or(0)) };
        entry.call_method(index, handle, Arguments::Variant(args), ReturnSlot::Variant(r_return))
    };

    let raw = match result {
        Ok(()) => RawCallError::default(),
        Err(err) => {
            warn!("checked call failed: {err}");
            if let Some(entry) = class.and_then(registry::lookup) {
                let api = entry.runtime.api();
                unsafe { api.variant_new_nil(r_return) };
            }
            err.to_raw()
        }
    };
    if !r_error.is_null() {
        unsafe { r_error.write(raw) };
    }
}

pub(crate) unsafe extern "C" fn method_ptrcall(
    method_userdata: *mut c_void,
    instance: ClassInstancePtr,
    args: *const ConstTypePtr,
    r_ret: TypePtr,
) {
    let (class, index) = split_method_userdata(method_userdata);
    let handle = InstanceHandle::from_ptr(instance);
    let Some(entry) = class.and_then(registry::lookup) else {
        panic!("engine passed unknown method userdata {method_userdata:p}");
    };
    let arity = match entry.methods.get(index) {
        Some(method) => method.signature.arity(),
        None => panic!("{} has no method at index {index}", entry.name),
    };
    let args = unsafe { native_args(args, arity) };
    if let Err(err) = entry.call_method(index, handle, Arguments::Native(args), ReturnSlot::Native(r_ret)) {
        warn!("{}.{}: {err}", entry.name, entry.methods[index].name);
    }
}
