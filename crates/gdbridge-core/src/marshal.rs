//! Conversions between managed values and their native (pointer-call) form.
//!
//! Plain values are bit copies. Integers travel as 64-bit and floats as
//! double precision, matching the engine's argument encoding. Handle-backed
//! values (strings, containers, Variants, objects) implement the traits in
//! their own modules.
//!
//! Two directions exist for each side of a call:
//!
//! | Direction | Trait method | Ownership |
//! |-----------|--------------|-----------|
//! | argument out | [`ToNative::write_borrowed`] | engine borrows the bits |
//! | return out | [`ToNative::write_owned`] | engine takes a fresh copy |
//! | result in | [`FromNative::adopt`] | caller takes what the engine produced |
//! | argument in | [`FromNative::copy_from`] | caller copies what the engine lends |

use std::ptr;

use crate::frame::Slot;
use crate::lifetime::Lifetime;
use crate::runtime::Runtime;
use crate::sys::{ConstTypePtr, TypePtr, VariantPtr};
use crate::types::VariantType;
use crate::values::*;

/// A type with a native representation.
pub trait NativeType {
    /// The Variant type tag describing the native layout. `Nil` stands for a
    /// full Variant.
    const VARIANT_TYPE: VariantType;
}

/// Values that can be written into native storage.
pub trait ToNative: NativeType {
    /// Writes the value's bits for the engine to read during a call.
    fn write_borrowed(&self, slot: &mut Slot);

    /// Constructs an independent copy into uninitialized storage the engine owns.
    ///
    /// # Safety
    ///
    /// `dst` must be writable storage sized for this type.
    unsafe fn write_owned(&self, dst: TypePtr);
}

/// Values that can be read from native storage.
pub trait FromNative: NativeType + Sized {
    /// Takes ownership of a value the engine produced as a call result.
    ///
    /// # Safety
    ///
    /// `src` must hold an initialized value of this type that nothing else owns.
    unsafe fn adopt(src: ConstTypePtr, life: &Lifetime) -> Self;

    /// Copies a value the engine lends for the duration of a callback.
    ///
    /// # Safety
    ///
    /// `src` must hold an initialized value of this type.
    unsafe fn copy_from(src: ConstTypePtr, life: &Lifetime) -> Self {
        unsafe { Self::adopt(src, life) }
    }

    /// Takes a value produced by a Variant-to-type converter.
    ///
    /// # Safety
    ///
    /// Same as [`FromNative::adopt`].
    unsafe fn take_converted(src: ConstTypePtr, life: &Lifetime) -> Self {
        unsafe { Self::adopt(src, life) }
    }
}

/// Shape of a callback's return value.
pub trait ReturnValue {
    const RETURN_TYPE: Option<VariantType>;

    /// Writes the value into the engine's return slot.
    ///
    /// # Safety
    ///
    /// `dst` must be writable storage for the return type; ignored for `()`.
    unsafe fn write_return(self, dst: TypePtr);

    /// Writes the value into an engine-owned Variant; `()` writes `Nil`.
    ///
    /// # Safety
    ///
    /// `dst` must be writable, uninitialized Variant storage.
    unsafe fn write_variant(self, dst: VariantPtr, runtime: &Runtime);
}

impl ReturnValue for () {
    const RETURN_TYPE: Option<VariantType> = None;

    unsafe fn write_return(self, _dst: TypePtr) {}

    unsafe fn write_variant(self, dst: VariantPtr, runtime: &Runtime) {
        unsafe { runtime.api().variant_new_nil(dst) }
    }
}

impl<T: ToNative> ReturnValue for T {
    const RETURN_TYPE: Option<VariantType> = Some(T::VARIANT_TYPE);

    unsafe fn write_return(self, dst: TypePtr) {
        unsafe { self.write_owned(dst) }
    }

    unsafe fn write_variant(self, dst: VariantPtr, runtime: &Runtime) {
        let mut slot = Slot::zeroed();
        self.write_borrowed(&mut slot);
        match T::VARIANT_TYPE {
            VariantType::Nil => unsafe { runtime.api().variant_new_copy(dst, slot.as_ptr()) },
            ty => unsafe { (runtime.variants().from_type(ty))(dst, slot.as_mut_ptr()) },
        }
    }
}

macro_rules! impl_plain_native {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl NativeType for $ty {
                const VARIANT_TYPE: VariantType = VariantType::$variant;
            }

            impl ToNative for $ty {
                #[inline]
                fn write_borrowed(&self, slot: &mut Slot) {
                    slot.write(*self);
                }

                #[inline]
                unsafe fn write_owned(&self, dst: TypePtr) {
                    unsafe { ptr::write_unaligned(dst as *mut $ty, *self) }
                }
            }

            impl FromNative for $ty {
                #[inline]
                unsafe fn adopt(src: ConstTypePtr, _life: &Lifetime) -> Self {
                    unsafe { ptr::read_unaligned(src as *const $ty) }
                }
            }
        )*
    };
}

impl_plain_native! {
    i64 => Int,
    f64 => Float,
    Vector2 => Vector2,
    Vector2i => Vector2i,
    Rect2 => Rect2,
    Rect2i => Rect2i,
    Vector3 => Vector3,
    Vector3i => Vector3i,
    Transform2D => Transform2D,
    Vector4 => Vector4,
    Vector4i => Vector4i,
    Plane => Plane,
    Quaternion => Quaternion,
    Aabb => Aabb,
    Basis => Basis,
    Transform3D => Transform3D,
    Projection => Projection,
    Color => Color,
    Rid => Rid,
}

/// Narrow numbers travel in their widened form and are cast back on read.
/// Out-of-range integers wrap; the checked path is `FromVariant`.
macro_rules! impl_widened_native {
    ($($ty:ty as $wide:ty => $variant:ident),* $(,)?) => {
        $(
            impl NativeType for $ty {
                const VARIANT_TYPE: VariantType = VariantType::$variant;
            }

            impl ToNative for $ty {
                #[inline]
                fn write_borrowed(&self, slot: &mut Slot) {
                    slot.write(*self as $wide);
                }

                #[inline]
                unsafe fn write_owned(&self, dst: TypePtr) {
                    unsafe { ptr::write_unaligned(dst as *mut $wide, *self as $wide) }
                }
            }

            impl FromNative for $ty {
                #[inline]
                unsafe fn adopt(src: ConstTypePtr, _life: &Lifetime) -> Self {
                    unsafe { ptr::read_unaligned(src as *const $wide) as $ty }
                }
            }
        )*
    };
}

impl_widened_native! {
    i8 as i64 => Int,
    i16 as i64 => Int,
    i32 as i64 => Int,
    u8 as i64 => Int,
    u16 as i64 => Int,
    u32 as i64 => Int,
    f32 as f64 => Float,
}

impl NativeType for bool {
    const VARIANT_TYPE: VariantType = VariantType::Bool;
}

impl ToNative for bool {
    #[inline]
    fn write_borrowed(&self, slot: &mut Slot) {
        slot.write(u8::from(*self));
    }

    #[inline]
    unsafe fn write_owned(&self, dst: TypePtr) {
        unsafe { ptr::write(dst as *mut u8, u8::from(*self)) }
    }
}

impl FromNative for bool {
    #[inline]
    unsafe fn adopt(src: ConstTypePtr, _life: &Lifetime) -> Self {
        unsafe { ptr::read(src as *const u8) != 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifetime::Context;
    use crate::testing::FakeEngine;

    fn through_slot<T: ToNative + FromNative>(value: T, life: &Lifetime) -> T {
        let mut slot = Slot::zeroed();
        value.write_borrowed(&mut slot);
        unsafe { T::adopt(slot.as_ptr(), life) }
    }

    #[test]
    fn return_values_fill_variant_storage() {
        use crate::lifetime::{HandleKind, RawHandle};
        use crate::variant::Variant;

        let engine = FakeEngine::new();
        let ctx = Context::new(engine.runtime());
        let life = ctx.scope();
        let mut raw = RawHandle::empty(HandleKind::Variant);
        unsafe { 5i64.write_variant(raw.as_mut_ptr(), life.runtime()) };
        let value = unsafe { Variant::adopt(raw.as_ptr(), &life) };
        assert_eq!(value.to::<i64>(&life).unwrap(), 5);

        let mut raw = RawHandle::empty(HandleKind::Variant);
        unsafe { ().write_variant(raw.as_mut_ptr(), life.runtime()) };
        assert!(unsafe { Variant::adopt(raw.as_ptr(), &life) }.is_nil());
        life.end();
    }

    #[test]
    fn narrow_integers_are_widened() {
        let mut slot = Slot::zeroed();
        (-3i32).write_borrowed(&mut slot);
        assert_eq!(unsafe { slot.read::<i64>() }, -3);

        7u8.write_borrowed(&mut slot);
        assert_eq!(unsafe { slot.read::<i64>() }, 7);
    }

    #[test]
    fn single_precision_travels_as_double() {
        let mut slot = Slot::zeroed();
        1.5f32.write_borrowed(&mut slot);
        assert_eq!(unsafe { slot.read::<f64>() }, 1.5);
    }

    #[test]
    fn bool_is_one_byte() {
        let mut slot = Slot::zeroed();
        true.write_borrowed(&mut slot);
        assert_eq!(unsafe { slot.read::<u8>() }, 1);
    }

    #[test]
    fn plain_values_survive_a_slot() {
        let engine = FakeEngine::new();
        let ctx = Context::new(engine.runtime());
        let life = ctx.scope();
        assert_eq!(through_slot(Color::rgba(0.1, 0.2, 0.3, 1.0), &life), Color::rgba(0.1, 0.2, 0.3, 1.0));
        assert_eq!(through_slot(Basis::IDENTITY, &life), Basis::IDENTITY);
        assert_eq!(through_slot(Rid(99), &life), Rid(99));
        assert!(through_slot(true, &life));
        life.end();
    }

    #[test]
    fn return_shapes() {
        assert_eq!(<() as ReturnValue>::RETURN_TYPE, None);
        assert_eq!(<i32 as ReturnValue>::RETURN_TYPE, Some(VariantType::Int));
        assert_eq!(<Vector3 as ReturnValue>::RETURN_TYPE, Some(VariantType::Vector3));
    }

    #[test]
    fn owned_return_writes_widened_value() {
        let mut out = 0i64;
        unsafe { 12i16.write_return(&mut out as *mut i64 as TypePtr) };
        assert_eq!(out, 12);
    }
}
