//! The dynamically typed engine value and conversions into and out of it.
//!
//! A [`Variant`] is a scope-owned handle; the engine's variant destructor runs
//! when its scope ends. Conversions go through the per-type converters linked
//! into [`VariantTables`](crate::tables::VariantTables):
//!
//! - [`ToVariant`] never fails.
//! - [`FromVariant`] reports a [`ConversionError`] for a wrong type tag or an
//!   integer that does not fit the requested width.

use crate::builtins::GString;
use crate::error::{CallError, ConversionError, c_name};
use crate::frame::Slot;
use crate::lifetime::{Handle, HandleKind, Lifetime, RawHandle};
use crate::marshal::{FromNative, NativeType, ToNative};
use crate::sys::{ConstTypePtr, TypePtr};
use crate::types::{Operator, VariantType};
use crate::values::*;

/// Native size of a Variant.
pub const VARIANT_SIZE: usize = 24;

/// A scope-owned engine Variant.
#[derive(Debug)]
pub struct Variant {
    handle: Handle,
}

impl Variant {
    pub(crate) fn from_handle(handle: Handle) -> Self {
        Self { handle }
    }

    /// A new `Nil` Variant.
    pub fn nil(life: &Lifetime) -> Self {
        let mut raw = RawHandle::empty(HandleKind::Variant);
        unsafe { life.runtime().api().variant_new_nil(raw.as_mut_ptr()) };
        Self::from_handle(life.register(raw))
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Copies the Variant into `life`.
    pub fn clone_in(&self, life: &Lifetime) -> Self {
        let src = self.handle.raw();
        let mut raw = RawHandle::empty(HandleKind::Variant);
        unsafe { life.runtime().api().variant_new_copy(raw.as_mut_ptr(), src.as_ptr()) };
        Self::from_handle(life.register(raw))
    }

    pub fn move_to(&self, life: &Lifetime) {
        self.handle.move_to(life);
    }

    pub fn get_type(&self) -> VariantType {
        unsafe { self.handle.runtime().api().variant_get_type(self.handle.raw().as_ptr()) }
    }

    pub fn is_nil(&self) -> bool {
        self.get_type() == VariantType::Nil
    }

    /// Truthiness as the engine defines it.
    pub fn booleanize(&self) -> bool {
        unsafe { self.handle.runtime().api().variant_booleanize(self.handle.raw().as_ptr()) }
    }

    pub fn hash(&self) -> i64 {
        unsafe { self.handle.runtime().api().variant_hash(self.handle.raw().as_ptr()) }
    }

    /// The engine's string form of the value.
    pub fn stringify(&self, life: &Lifetime) -> GString {
        let mut raw = RawHandle::empty(HandleKind::Builtin(VariantType::String));
        unsafe { life.runtime().api().variant_stringify(self.handle.raw().as_ptr(), raw.as_mut_ptr()) };
        GString::from_handle(life.register(raw))
    }

    /// Applies a binary operator. `None` if the operator is not defined for the operands.
    pub fn evaluate(&self, op: Operator, rhs: &Variant, life: &Lifetime) -> Option<Variant> {
        let mut raw = RawHandle::empty(HandleKind::Variant);
        let valid = unsafe {
            life.runtime().api().variant_evaluate(op, self.handle.raw().as_ptr(), rhs.handle.raw().as_ptr(), raw.as_mut_ptr())
        };
        valid.then(|| Self::from_handle(life.register(raw)))
    }

    /// Keyed or indexed read. `None` if the key is invalid for this value.
    pub fn get(&self, key: &Variant, life: &Lifetime) -> Option<Variant> {
        let mut raw = RawHandle::empty(HandleKind::Variant);
        let valid =
            unsafe { life.runtime().api().variant_get(self.handle.raw().as_ptr(), key.handle.raw().as_ptr(), raw.as_mut_ptr()) };
        valid.then(|| Self::from_handle(life.register(raw)))
    }

    /// Keyed or indexed write. Returns whether the key was valid.
    pub fn set(&self, key: &Variant, value: &Variant) -> bool {
        let key = key.handle.raw();
        let value = value.handle.raw();
        self.handle
            .with_mut(|ptr| unsafe { self.handle.runtime().api().variant_set(ptr, key.as_ptr(), value.as_ptr()) })
    }

    /// Calls a method on the value by name.
    pub fn call(&self, method: &str, args: &[&Variant], life: &Lifetime) -> Result<Variant, CallError> {
        let method = c_name(method).map_err(|_| CallError::InvalidMethod)?;
        let raws: Vec<RawHandle> = args.iter().map(|arg| arg.handle.raw()).collect();
        let pointers: Vec<_> = raws.iter().map(RawHandle::as_ptr).collect();
        let mut ret = RawHandle::empty(HandleKind::Variant);
        let error = self
            .handle
            .with_mut(|ptr| unsafe { life.runtime().api().variant_call(ptr, &method, &pointers, ret.as_mut_ptr()) });
        let ret = Self::from_handle(life.register(ret));
        CallError::check(&error)?;
        Ok(ret)
    }

    /// Decodes into `T`.
    pub fn to<T: FromVariant>(&self, life: &Lifetime) -> Result<T, ConversionError> {
        T::try_from_variant(self, life)
    }
}

impl NativeType for Variant {
    const VARIANT_TYPE: VariantType = VariantType::Nil;
}

impl ToNative for Variant {
    fn write_borrowed(&self, slot: &mut Slot) {
        unsafe { slot.write_bytes(self.handle.raw().as_ptr(), VARIANT_SIZE) }
    }

    unsafe fn write_owned(&self, dst: TypePtr) {
        unsafe { self.handle.runtime().api().variant_new_copy(dst, self.handle.raw().as_ptr()) }
    }
}

impl FromNative for Variant {
    unsafe fn adopt(src: ConstTypePtr, life: &Lifetime) -> Self {
        let raw = unsafe { RawHandle::from_native(HandleKind::Variant, src, VARIANT_SIZE) };
        Self::from_handle(life.register(raw))
    }

    unsafe fn copy_from(src: ConstTypePtr, life: &Lifetime) -> Self {
        let mut raw = RawHandle::empty(HandleKind::Variant);
        unsafe { life.runtime().api().variant_new_copy(raw.as_mut_ptr(), src) };
        Self::from_handle(life.register(raw))
    }
}

// ============================================================================
// Conversions
// ============================================================================

/// Encodes a value into a new Variant.
pub trait ToVariant {
    fn to_variant(&self, life: &Lifetime) -> Variant;
}

/// Decodes a value out of a Variant.
pub trait FromVariant: Sized {
    fn try_from_variant(variant: &Variant, life: &Lifetime) -> Result<Self, ConversionError>;
}

/// Encodes any native value through its linked converter.
pub fn encode<T: ToNative + ?Sized>(value: &T, life: &Lifetime) -> Variant {
    let from_type = life.runtime().variants().from_type(T::VARIANT_TYPE);
    let mut slot = Slot::zeroed();
    value.write_borrowed(&mut slot);
    let mut raw = RawHandle::empty(HandleKind::Variant);
    unsafe { from_type(raw.as_mut_ptr(), slot.as_mut_ptr()) };
    Variant::from_handle(life.register(raw))
}

/// Decodes a native value through its linked converter after checking the type tag.
pub fn decode<T: FromNative>(variant: &Variant, life: &Lifetime) -> Result<T, ConversionError> {
    let actual = variant.get_type();
    if actual != T::VARIANT_TYPE {
        return Err(ConversionError::TypeMismatch { expected: T::VARIANT_TYPE, actual });
    }
    let to_type = life.runtime().variants().to_type(T::VARIANT_TYPE);
    let mut slot = Slot::zeroed();
    variant.handle.with_mut(|ptr| unsafe { to_type(slot.as_mut_ptr(), ptr) });
    Ok(unsafe { T::take_converted(slot.as_ptr(), life) })
}

/// Applies a same-type operator through the linked evaluator.
///
/// `None` when the engine defines no evaluator for `op` on `T`; the caller
/// chooses `R` to match the operator's result type.
pub fn evaluate_typed<T, R>(life: &Lifetime, op: Operator, left: &T, right: &T) -> Option<R>
where
    T: ToNative,
    R: FromNative,
{
    let evaluator = life.runtime().variants().operator(op, T::VARIANT_TYPE)?;
    let mut lhs = Slot::zeroed();
    let mut rhs = Slot::zeroed();
    let mut out = Slot::zeroed();
    left.write_borrowed(&mut lhs);
    right.write_borrowed(&mut rhs);
    unsafe {
        evaluator(lhs.as_ptr(), rhs.as_ptr(), out.as_mut_ptr());
        Some(R::adopt(out.as_ptr(), life))
    }
}

macro_rules! impl_variant_native {
    ($($ty:ty),* $(,)?) => {
        $(
            impl ToVariant for $ty {
                fn to_variant(&self, life: &Lifetime) -> Variant {
                    encode(self, life)
                }
            }

            impl FromVariant for $ty {
                fn try_from_variant(variant: &Variant, life: &Lifetime) -> Result<Self, ConversionError> {
                    decode(variant, life)
                }
            }
        )*
    };
}

impl_variant_native! {
    bool, i64, f64,
    Vector2, Vector2i, Rect2, Rect2i, Vector3, Vector3i, Transform2D, Vector4, Vector4i,
    Plane, Quaternion, Aabb, Basis, Transform3D, Projection, Color, Rid,
}

macro_rules! impl_variant_narrow_int {
    ($($ty:ty),* $(,)?) => {
        $(
            impl ToVariant for $ty {
                fn to_variant(&self, life: &Lifetime) -> Variant {
                    encode(&i64::from(*self), life)
                }
            }

            impl FromVariant for $ty {
                fn try_from_variant(variant: &Variant, life: &Lifetime) -> Result<Self, ConversionError> {
                    let value: i64 = decode(variant, life)?;
                    <$ty>::try_from(value).map_err(|_| ConversionError::IntegerOverflow {
                        value,
                        target_type: stringify!($ty),
                    })
                }
            }
        )*
    };
}

impl_variant_narrow_int!(i8, i16, i32, u8, u16, u32);

impl ToVariant for u64 {
    fn to_variant(&self, life: &Lifetime) -> Variant {
        encode(&(*self as i64), life)
    }
}

impl FromVariant for u64 {
    fn try_from_variant(variant: &Variant, life: &Lifetime) -> Result<Self, ConversionError> {
        let value: i64 = decode(variant, life)?;
        u64::try_from(value).map_err(|_| ConversionError::IntegerOverflow { value, target_type: "u64" })
    }
}

impl ToVariant for f32 {
    fn to_variant(&self, life: &Lifetime) -> Variant {
        encode(&f64::from(*self), life)
    }
}

impl FromVariant for f32 {
    fn try_from_variant(variant: &Variant, life: &Lifetime) -> Result<Self, ConversionError> {
        decode::<f64>(variant, life).map(|value| value as f32)
    }
}

impl ToVariant for Variant {
    fn to_variant(&self, life: &Lifetime) -> Variant {
        self.clone_in(life)
    }
}

impl FromVariant for Variant {
    fn try_from_variant(variant: &Variant, life: &Lifetime) -> Result<Self, ConversionError> {
        Ok(variant.clone_in(life))
    }
}

impl ToVariant for str {
    fn to_variant(&self, life: &Lifetime) -> Variant {
        let text = GString::new(life, self);
        let variant = text.to_variant(life);
        text.release();
        variant
    }
}

impl ToVariant for String {
    fn to_variant(&self, life: &Lifetime) -> Variant {
        self.as_str().to_variant(life)
    }
}

impl FromVariant for String {
    fn try_from_variant(variant: &Variant, life: &Lifetime) -> Result<Self, ConversionError> {
        let text: GString = decode(variant, life)?;
        let result = text.try_to_string();
        text.release();
        result
    }
}

impl<T: ToVariant + ?Sized> ToVariant for &T {
    fn to_variant(&self, life: &Lifetime) -> Variant {
        (**self).to_variant(life)
    }
}

impl<T: ToVariant> ToVariant for Option<T> {
    fn to_variant(&self, life: &Lifetime) -> Variant {
        match self {
            Some(value) => value.to_variant(life),
            None => Variant::nil(life),
        }
    }
}

impl<T: FromVariant> FromVariant for Option<T> {
    fn try_from_variant(variant: &Variant, life: &Lifetime) -> Result<Self, ConversionError> {
        if variant.is_nil() { Ok(None) } else { T::try_from_variant(variant, life).map(Some) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifetime::Context;
    use crate::testing::FakeEngine;

    fn setup() -> (FakeEngine, Context) {
        let engine = FakeEngine::new();
        let ctx = Context::new(engine.runtime());
        (engine, ctx)
    }

    #[test]
    fn nil_is_nil() {
        let (_engine, ctx) = setup();
        let life = ctx.scope();
        let nil = Variant::nil(&life);
        assert!(nil.is_nil());
        assert!(!nil.booleanize());
        life.end();
    }

    #[test]
    fn int_round_trip() {
        let (_engine, ctx) = setup();
        let life = ctx.scope();
        let variant = 42i64.to_variant(&life);
        assert_eq!(variant.get_type(), VariantType::Int);
        assert_eq!(variant.to::<i64>(&life), Ok(42));
        life.end();
    }

    #[test]
    fn wrong_type_is_a_mismatch() {
        let (_engine, ctx) = setup();
        let life = ctx.scope();
        let variant = 1.5f64.to_variant(&life);
        assert_eq!(
            variant.to::<i64>(&life),
            Err(ConversionError::TypeMismatch { expected: VariantType::Int, actual: VariantType::Float })
        );
        life.end();
    }

    #[test]
    fn narrow_integer_overflow_is_reported() {
        let (_engine, ctx) = setup();
        let life = ctx.scope();
        let variant = 300i64.to_variant(&life);
        assert_eq!(variant.to::<u8>(&life), Err(ConversionError::IntegerOverflow { value: 300, target_type: "u8" }));
        assert_eq!(variant.to::<i16>(&life), Ok(300));
        life.end();
    }

    #[test]
    fn large_value_types_round_trip() {
        let (_engine, ctx) = setup();
        let life = ctx.scope();
        let mut transform = Transform3D::default();
        transform.basis = Basis::IDENTITY;
        transform.origin = Vector3::new(1.0, 2.0, 3.0);
        let variant = transform.to_variant(&life);
        assert_eq!(variant.to::<Transform3D>(&life), Ok(transform));
        life.end();
    }

    #[test]
    fn strings_round_trip() {
        let (_engine, ctx) = setup();
        let life = ctx.scope();
        let variant = "héllo".to_variant(&life);
        assert_eq!(variant.get_type(), VariantType::String);
        assert_eq!(variant.to::<String>(&life).as_deref(), Ok("héllo"));
        life.end();
    }

    #[test]
    fn option_maps_to_nil() {
        let (_engine, ctx) = setup();
        let life = ctx.scope();
        let none: Option<i64> = None;
        let variant = none.to_variant(&life);
        assert_eq!(variant.to::<Option<i64>>(&life), Ok(None));
        let some = Some(5i64).to_variant(&life);
        assert_eq!(some.to::<Option<i64>>(&life), Ok(Some(5)));
        life.end();
    }

    #[test]
    fn generic_evaluate_and_typed_fast_path_agree() {
        let (_engine, ctx) = setup();
        let life = ctx.scope();
        let a = 2i64.to_variant(&life);
        let b = 40i64.to_variant(&life);
        let sum = a.evaluate(Operator::Add, &b, &life).unwrap();
        assert_eq!(sum.to::<i64>(&life), Ok(42));
        assert_eq!(evaluate_typed::<i64, i64>(&life, Operator::Add, &2, &40), Some(42));
        assert_eq!(evaluate_typed::<i64, bool>(&life, Operator::Less, &2, &40), Some(true));
        life.end();
    }

    #[test]
    fn undefined_operator_is_none() {
        let (_engine, ctx) = setup();
        let life = ctx.scope();
        let a = 2i64.to_variant(&life);
        let b = "x".to_variant(&life);
        assert!(a.evaluate(Operator::Subtract, &b, &life).is_none());
        life.end();
    }

    #[test]
    fn call_by_name() {
        let (_engine, ctx) = setup();
        let life = ctx.scope();
        let text = "four".to_variant(&life);
        let len = text.call("length", &[], &life).unwrap();
        assert_eq!(len.to::<i64>(&life), Ok(4));
        assert_eq!(text.call("nope", &[], &life).unwrap_err(), CallError::InvalidMethod);
        life.end();
    }

    #[test]
    fn stringify_uses_engine_format() {
        let (_engine, ctx) = setup();
        let life = ctx.scope();
        let variant = 17i64.to_variant(&life);
        assert_eq!(variant.stringify(&life).to_string(), "17");
        life.end();
    }

    #[test]
    fn scope_end_destroys_variant_payload() {
        let (engine, ctx) = setup();
        let life = ctx.scope();
        let before = engine.live_values();
        let _text = "owned".to_variant(&life);
        assert!(engine.live_values() > before);
        life.end();
        assert_eq!(engine.live_values(), before);
    }
}
