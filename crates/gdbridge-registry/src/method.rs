//! Typed method descriptors erased into engine-callable form.
//!
//! Any `Fn(&mut T, A0, .., An) -> R` with up to eight arguments becomes a
//! method of class `T` through [`IntoMethod`]. Arguments decode from either
//! argument form the engine uses:
//!
//! - pointer-call arguments are native values the engine lends; they are
//!   copied into the dispatch scope with [`FromNative::copy_from`].
//! - Variant arguments are checked: a count mismatch is `TooFewArguments` or
//!   `TooManyArguments`, a value that does not decode is `InvalidArgument`.

use std::any::Any;

use gdbridge_core::error::CallError;
use gdbridge_core::lifetime::Lifetime;
use gdbridge_core::marshal::{FromNative, NativeType, ReturnValue};
use gdbridge_core::runtime::Runtime;
use gdbridge_core::sys::{ConstTypePtr, ConstVariantPtr, TypePtr, VariantPtr};
use gdbridge_core::types::VariantType;
use gdbridge_core::variant::{FromVariant, Variant};

/// Arguments as the engine passed them.
#[derive(Debug, Clone, Copy)]
pub enum Arguments<'a> {
    /// Pointer-call form, one native value per declared parameter.
    Native(&'a [ConstTypePtr]),
    /// Checked-call form, one Variant per argument the caller supplied.
    Variant(&'a [ConstVariantPtr]),
}

impl Arguments<'_> {
    pub fn len(&self) -> usize {
        match self {
            Arguments::Native(args) => args.len(),
            Arguments::Variant(args) => args.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks a Variant argument list against the declared arity.
    pub fn check_count(&self, expected: usize) -> Result<(), CallError> {
        let Arguments::Variant(args) = self else {
            return Ok(());
        };
        let declared = expected as i32;
        if args.len() < expected {
            Err(CallError::TooFewArguments { expected: declared })
        } else if args.len() > expected {
            Err(CallError::TooManyArguments { expected: declared })
        } else {
            Ok(())
        }
    }

    /// Decodes argument `index` into the dispatch scope.
    ///
    /// # Safety
    ///
    /// Every pointer in the list must reference an initialized value of the
    /// form the variant names, and `index` must be in bounds.
    pub unsafe fn decode<A>(&self, index: usize, life: &Lifetime) -> Result<A, CallError>
    where
        A: FromNative + FromVariant,
    {
        match self {
            Arguments::Native(args) => Ok(unsafe { A::copy_from(args[index], life) }),
            Arguments::Variant(args) => {
                let variant = unsafe { <Variant as FromNative>::copy_from(args[index], life) };
                A::try_from_variant(&variant, life).map_err(|_| CallError::InvalidArgument {
                    argument: index as i32,
                    expected: A::VARIANT_TYPE,
                })
            }
        }
    }
}

/// Where the engine wants the return value.
#[derive(Debug, Clone, Copy)]
pub enum ReturnSlot {
    /// Native storage; null when the engine expects no value.
    Native(TypePtr),
    /// An uninitialized Variant.
    Variant(VariantPtr),
}

impl ReturnSlot {
    /// Writes a method's result.
    ///
    /// # Safety
    ///
    /// The slot must be writable storage of the shape the engine declared.
    ///
    /// # Panics
    ///
    /// If the method and the engine disagree on whether a value is returned.
    pub unsafe fn write<R: ReturnValue>(self, value: R, runtime: &Runtime, method: &str) {
        match self {
            ReturnSlot::Native(dst) => match (R::RETURN_TYPE, dst.is_null()) {
                (Some(ty), true) => panic!("{method} returns {ty} but the engine expects no return value"),
                (None, false) => panic!("{method} returns nothing but the engine expects a return value"),
                (Some(_), false) => unsafe { value.write_return(dst) },
                (None, true) => {}
            },
            ReturnSlot::Variant(dst) => unsafe { value.write_variant(dst, runtime) },
        }
    }
}

/// Declared parameter and return types of a method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub params: Vec<VariantType>,
    pub ret: Option<VariantType>,
}

impl Signature {
    #[inline]
    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

pub(crate) type ErasedMethod =
    Box<dyn Fn(&mut dyn Any, &Lifetime, Arguments<'_>, ReturnSlot) -> Result<(), CallError> + Send + Sync>;

/// Functions usable as methods of `T`. `Marker` is `fn(A0, ..) -> R`.
pub trait IntoMethod<T, Marker>: Send + Sync + 'static {
    fn signature() -> Signature;

    #[doc(hidden)]
    fn into_erased(self, name: &str) -> ErasedMethod;
}

macro_rules! count {
    () => { 0usize };
    ($head:ident $($tail:ident)*) => { 1usize + count!($($tail)*) };
}

macro_rules! impl_into_method {
    ($($arg:ident $idx:tt),*) => {
        impl<T, F, R, $($arg,)*> IntoMethod<T, fn($($arg),*) -> R> for F
        where
            T: 'static,
            F: Fn(&mut T, $($arg),*) -> R + Send + Sync + 'static,
            R: ReturnValue,
            $($arg: FromNative + FromVariant,)*
        {
            fn signature() -> Signature {
                Signature {
                    params: vec![$(<$arg as NativeType>::VARIANT_TYPE),*],
                    ret: R::RETURN_TYPE,
                }
            }

            #[allow(unused_variables, unused_unsafe, clippy::unused_unit)]
            fn into_erased(self, name: &str) -> ErasedMethod {
                let name = name.to_string();
                Box::new(move |instance: &mut dyn Any, life: &Lifetime, args: Arguments<'_>, ret: ReturnSlot| -> Result<(), CallError> {
                    args.check_count(count!($($arg)*))?;
                    let Some(instance) = instance.downcast_mut::<T>() else {
                        panic!("{name} dispatched to an instance of another class");
                    };
                    let decoded = unsafe { ($(args.decode::<$arg>($idx, life)?,)*) };
                    let value = (self)(instance, $(decoded.$idx),*);
                    unsafe { ret.write(value, life.runtime(), &name) };
                    Ok(())
                })
            }
        }
    };
}

impl_into_method!();
impl_into_method!(A0 0);
impl_into_method!(A0 0, A1 1);
impl_into_method!(A0 0, A1 1, A2 2);
impl_into_method!(A0 0, A1 1, A2 2, A3 3);
impl_into_method!(A0 0, A1 1, A2 2, A3 3, A4 4);
impl_into_method!(A0 0, A1 1, A2 2, A3 3, A4 4, A5 5);
impl_into_method!(A0 0, A1 1, A2 2, A3 3, A4 4, A5 5, A6 6);
impl_into_method!(A0 0, A1 1, A2 2, A3 3, A4 4, A5 5, A6 6, A7 7);

#[cfg(test)]
mod tests {
    use super::*;
    use gdbridge_core::lifetime::Context;
    use gdbridge_core::testing::FakeEngine;
    use gdbridge_core::variant::ToVariant;

    struct Counter {
        total: i64,
    }

    fn signature_of<M: IntoMethod<Counter, Marker>, Marker>(_: &M) -> Signature {
        M::signature()
    }

    #[test]
    fn signature_reflects_parameters_and_return() {
        let add = |c: &mut Counter, by: i64, _scale: f64| -> i64 {
            c.total += by;
            c.total
        };
        let sig = signature_of(&add);
        assert_eq!(sig.params, vec![VariantType::Int, VariantType::Float]);
        assert_eq!(sig.ret, Some(VariantType::Int));

        let reset = |c: &mut Counter| c.total = 0;
        assert_eq!(signature_of(&reset).ret, None);
        assert_eq!(signature_of(&reset).arity(), 0);
    }

    #[test]
    fn variant_calls_check_arity_and_types() {
        let engine = FakeEngine::new();
        let ctx = Context::new(engine.runtime());
        let life = ctx.scope();
        let method = IntoMethod::<Counter, fn(i64) -> i64>::into_erased(
            |c: &mut Counter, by: i64| {
                c.total += by;
                c.total
            },
            "Counter.add",
        );
        let mut counter = Counter { total: 1 };
        let mut ret = gdbridge_core::lifetime::RawHandle::empty(gdbridge_core::lifetime::HandleKind::Variant);

        let err = method(&mut counter, &life, Arguments::Variant(&[]), ReturnSlot::Variant(ret.as_mut_ptr()));
        assert_eq!(err, Err(CallError::TooFewArguments { expected: 1 }));

        let text = "x".to_variant(&life);
        let raw_text = text.handle().raw();
        let args = [raw_text.as_ptr()];
        let err = method(&mut counter, &life, Arguments::Variant(&args), ReturnSlot::Variant(ret.as_mut_ptr()));
        assert_eq!(err, Err(CallError::InvalidArgument { argument: 0, expected: VariantType::Int }));

        let two = 2i64.to_variant(&life);
        let raw_two = two.handle().raw();
        let args = [raw_two.as_ptr()];
        method(&mut counter, &life, Arguments::Variant(&args), ReturnSlot::Variant(ret.as_mut_ptr())).unwrap();
        assert_eq!(counter.total, 3);
        let result = unsafe { <Variant as FromNative>::adopt(ret.as_ptr(), &life) };
        assert_eq!(result.to::<i64>(&life).unwrap(), 3);
        life.end();
        assert_eq!(engine.live_values(), 0);
    }

    #[test]
    fn native_calls_write_native_results() {
        let engine = FakeEngine::new();
        let ctx = Context::new(engine.runtime());
        let life = ctx.scope();
        let method = IntoMethod::<Counter, fn(i64) -> i64>::into_erased(|c: &mut Counter, by: i64| c.total * by, "Counter.scale");
        let mut counter = Counter { total: 7 };
        let by = 3i64;
        let args = [&by as *const i64 as ConstTypePtr];
        let mut out = 0i64;
        method(&mut counter, &life, Arguments::Native(&args), ReturnSlot::Native(&mut out as *mut i64 as TypePtr)).unwrap();
        assert_eq!(out, 21);
    }

    #[test]
    #[should_panic(expected = "engine expects no return value")]
    fn missing_return_slot_is_fatal() {
        let engine = FakeEngine::new();
        let ctx = Context::new(engine.runtime());
        let life = ctx.scope();
        let method = IntoMethod::<Counter, fn() -> i64>::into_erased(|c: &mut Counter| c.total, "Counter.get");
        let mut counter = Counter { total: 0 };
        let _ = method(&mut counter, &life, Arguments::Native(&[]), ReturnSlot::Native(std::ptr::null_mut()));
    }
}
