//! Stack-allocated call frames.
//!
//! A [`CallFrame`] marshals exactly one native call: arguments are written into
//! consecutive [`Slot`]s, one entry point is invoked with a pointer to the slot
//! pointer array and a pointer to the result slot, and the result is read back.
//! The frame never owns what is written into it or read out of it; handle
//! results become owned only when [`CallFrame::result`] registers them.

use std::fmt;
use std::mem::size_of;
use std::ptr;

use crate::lifetime::Lifetime;
use crate::marshal::{FromNative, ToNative};
use crate::methods::{BuiltinMethod, MethodBind, UtilityFunction};
use crate::runtime::Runtime;
use crate::sys::{ConstTypePtr, PtrConstructor, TypePtr};

/// Fixed argument capacity. Wider calls go through the Variant call path.
pub const MAX_ARGS: usize = 13;

/// Bytes per slot; fits the largest value type (`Projection`).
pub const SLOT_SIZE: usize = 64;

/// One argument or result cell.
#[repr(C, align(16))]
#[derive(Clone, Copy)]
pub struct Slot([u8; SLOT_SIZE]);

impl Slot {
    pub const fn zeroed() -> Self {
        Slot([0; SLOT_SIZE])
    }

    #[inline]
    pub fn as_ptr(&self) -> ConstTypePtr {
        self.0.as_ptr() as ConstTypePtr
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> TypePtr {
        self.0.as_mut_ptr() as TypePtr
    }

    /// Writes the bytes of `value` at the start of the slot.
    #[inline]
    pub fn write<T: Copy>(&mut self, value: T) {
        const { assert!(size_of::<T>() <= SLOT_SIZE) };
        unsafe { ptr::write_unaligned(self.0.as_mut_ptr() as *mut T, value) }
    }

    /// Copies `len` raw bytes into the slot.
    ///
    /// # Safety
    ///
    /// `src` must be readable for `len` bytes and `len <= SLOT_SIZE`.
    #[inline]
    pub unsafe fn write_bytes(&mut self, src: ConstTypePtr, len: usize) {
        debug_assert!(len <= SLOT_SIZE);
        unsafe { ptr::copy_nonoverlapping(src as *const u8, self.0.as_mut_ptr(), len) }
    }

    /// Reads a `T` from the start of the slot.
    ///
    /// # Safety
    ///
    /// The slot must hold a valid bit pattern for `T`.
    #[inline]
    pub unsafe fn read<T: Copy>(&self) -> T {
        const { assert!(size_of::<T>() <= SLOT_SIZE) };
        unsafe { ptr::read_unaligned(self.0.as_ptr() as *const T) }
    }
}

impl Default for Slot {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Slot").field(&&self.0[..16]).finish()
    }
}

/// The native function a frame invokes.
#[derive(Debug, Clone, Copy)]
pub enum EntryPoint {
    /// Engine class method; the target is the object pointer.
    Method(MethodBind),
    /// Builtin-type method; the target points at the receiver value.
    Builtin(BuiltinMethod),
    /// Global utility function; the target is ignored.
    Utility(UtilityFunction),
    /// Builtin-type constructor writing into the result slot; the target is ignored.
    Constructor(PtrConstructor),
}

/// Staging buffer for one native call.
pub struct CallFrame<'rt> {
    runtime: &'rt Runtime,
    args: [Slot; MAX_ARGS],
    len: usize,
    result: Slot,
}

impl<'rt> CallFrame<'rt> {
    pub fn open(runtime: &'rt Runtime) -> Self {
        Self { runtime, args: [Slot::zeroed(); MAX_ARGS], len: 0, result: Slot::zeroed() }
    }

    /// Writes a borrowed view of `value` into argument slot `index`.
    ///
    /// # Panics
    ///
    /// If `index` is beyond [`MAX_ARGS`].
    pub fn set_arg<T: ToNative + ?Sized>(&mut self, index: usize, value: &T) -> &mut Self {
        assert!(index < MAX_ARGS, "call frame argument {index} exceeds the {MAX_ARGS} slot capacity");
        value.write_borrowed(&mut self.args[index]);
        self.len = self.len.max(index + 1);
        self
    }

    /// Writes the next argument.
    pub fn push<T: ToNative + ?Sized>(&mut self, value: &T) -> &mut Self {
        self.set_arg(self.len, value)
    }

    pub fn arg_count(&self) -> usize {
        self.len
    }

    /// Performs the call.
    ///
    /// # Safety
    ///
    /// The arguments written must match the entry point's native signature in
    /// count and type, and `target` must be what the entry point expects
    /// (see [`EntryPoint`]).
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub unsafe fn invoke(&mut self, entry: EntryPoint, target: TypePtr) {
        let mut pointers: [ConstTypePtr; MAX_ARGS] = [ptr::null(); MAX_ARGS];
        for (pointer, slot) in pointers.iter_mut().zip(&self.args[..self.len]) {
            *pointer = slot.as_ptr();
        }
        let args = pointers.as_ptr();
        let ret = self.result.as_mut_ptr();
        match entry {
            EntryPoint::Method(bind) => unsafe {
                self.runtime.api().object_method_bind_ptrcall(bind.as_ptr(), target, args, ret)
            },
            EntryPoint::Builtin(method) => unsafe { (method.as_fn())(target, args, ret, self.len as i32) },
            EntryPoint::Utility(function) => unsafe { (function.as_fn())(ret, args, self.len as i32) },
            EntryPoint::Constructor(constructor) => unsafe { constructor(ret, args) },
        }
    }

    /// Reads the result, registering handle-backed values into `life`.
    ///
    /// # Safety
    ///
    /// The invoked entry point must have written a `T` into the result slot.
    pub unsafe fn result<T: FromNative>(&self, life: &Lifetime) -> T {
        unsafe { T::adopt(self.result.as_ptr(), life) }
    }

    /// Reads a plain result that owns nothing, without a scope.
    ///
    /// # Safety
    ///
    /// The invoked entry point must have written a `T` into the result slot.
    pub unsafe fn plain_result<T: Copy>(&self) -> T {
        unsafe { self.result.read() }
    }

    /// Releases the frame's storage. Handles written into it are unaffected.
    pub fn close(self) {}
}

impl fmt::Debug for CallFrame<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallFrame").field("arg_count", &self.len).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeEngine;
    use crate::values::{Projection, Vector3};

    #[test]
    fn slot_round_trips_plain_values() {
        let mut slot = Slot::zeroed();
        slot.write(Vector3::new(1.0, 2.0, 3.0));
        assert_eq!(unsafe { slot.read::<Vector3>() }, Vector3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn slot_fits_largest_value() {
        let mut slot = Slot::zeroed();
        let mut projection = Projection::default();
        projection.columns[3].w = 7.0;
        slot.write(projection);
        assert_eq!(unsafe { slot.read::<Projection>() }.columns[3].w, 7.0);
    }

    #[test]
    fn slots_are_sixteen_byte_aligned() {
        assert_eq!(std::mem::align_of::<Slot>(), 16);
        assert_eq!(size_of::<Slot>(), SLOT_SIZE);
    }

    #[test]
    fn set_arg_tracks_highest_index() {
        let engine = FakeEngine::new();
        let runtime = engine.runtime();
        let mut frame = CallFrame::open(&runtime);
        frame.set_arg(2, &5i64);
        assert_eq!(frame.arg_count(), 3);
        frame.push(&1i64);
        assert_eq!(frame.arg_count(), 4);
        frame.close();
    }

    #[test]
    #[should_panic(expected = "exceeds")]
    fn argument_past_capacity_panics() {
        let engine = FakeEngine::new();
        let runtime = engine.runtime();
        let mut frame = CallFrame::open(&runtime);
        frame.set_arg(MAX_ARGS, &0i64);
    }

    #[test]
    fn utility_call_through_frame() {
        let engine = FakeEngine::new();
        let runtime = engine.runtime();
        let ctx = crate::lifetime::Context::new(runtime.clone());
        let life = ctx.scope();
        let absi = UtilityFunction::resolve(runtime.api(), "absi", crate::testing::ABSI_HASH).unwrap();

        let mut frame = CallFrame::open(&runtime);
        frame.push(&-42i64);
        unsafe { frame.invoke(EntryPoint::Utility(absi), ptr::null_mut()) };
        let value: i64 = unsafe { frame.result(&life) };
        frame.close();
        assert_eq!(value, 42);
        life.end();
    }
}
