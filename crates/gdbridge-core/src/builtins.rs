//! Handle-backed builtin types: strings, containers, callables and packed arrays.
//!
//! Each wrapper owns a scope-registered [`Handle`]; the type's engine
//! destructor runs when the scope ends or on [`release`](GString::release).
//! Copies made with `clone_in` use the engine's copy constructor, so container
//! copies share storage exactly as the engine defines.

use std::fmt;
use std::ptr;

use crate::error::ConversionError;
use crate::frame::{CallFrame, EntryPoint, Slot};
use crate::lifetime::{Handle, HandleKind, Lifetime, RawHandle};
use crate::marshal::{FromNative, NativeType, ToNative};
use crate::sys::{ConstTypePtr, TypePtr};
use crate::tables::{CONSTRUCT_COPY, CONSTRUCT_DEFAULT, CONSTRUCT_FROM_STRING};
use crate::types::VariantType;
use crate::variant::{FromVariant, ToVariant, Variant, decode, encode};

/// Runs a constructor of `ty` into fresh storage registered to `life`.
fn construct(life: &Lifetime, ty: VariantType, index: i32, args: &[ConstTypePtr]) -> Handle {
    let constructor = life.runtime().variants().constructor(ty, index);
    let mut raw = RawHandle::empty(HandleKind::Builtin(ty));
    unsafe { constructor(raw.as_mut_ptr(), if args.is_empty() { ptr::null() } else { args.as_ptr() }) };
    life.register(raw)
}

macro_rules! builtin_handle {
    ($($(#[$meta:meta])* $name:ident => $variant:ident;)*) => {
        $(
            $(#[$meta])*
            pub struct $name {
                handle: Handle,
            }

            impl $name {
                /// An empty value registered to `life`.
                pub fn new_in(life: &Lifetime) -> Self {
                    Self { handle: construct(life, VariantType::$variant, CONSTRUCT_DEFAULT, &[]) }
                }

                pub(crate) fn from_handle(handle: Handle) -> Self {
                    Self { handle }
                }

                pub fn handle(&self) -> &Handle {
                    &self.handle
                }

                /// Copy-constructs into `life`.
                pub fn clone_in(&self, life: &Lifetime) -> Self {
                    let src = self.handle.raw();
                    Self { handle: construct(life, VariantType::$variant, CONSTRUCT_COPY, &[src.as_ptr()]) }
                }

                pub fn move_to(&self, life: &Lifetime) {
                    self.handle.move_to(life);
                }

                /// Destroys the value before its scope ends.
                pub fn release(self) {
                    self.handle.release();
                }
            }

            impl NativeType for $name {
                const VARIANT_TYPE: VariantType = VariantType::$variant;
            }

            impl ToNative for $name {
                fn write_borrowed(&self, slot: &mut Slot) {
                    unsafe { slot.write_bytes(self.handle.raw().as_ptr(), VariantType::$variant.native_size()) }
                }

                unsafe fn write_owned(&self, dst: TypePtr) {
                    let constructor = self.handle.runtime().variants().constructor(VariantType::$variant, CONSTRUCT_COPY);
                    let src = self.handle.raw();
                    let args = [src.as_ptr()];
                    unsafe { constructor(dst, args.as_ptr()) }
                }
            }

            impl FromNative for $name {
                unsafe fn adopt(src: ConstTypePtr, life: &Lifetime) -> Self {
                    let kind = HandleKind::Builtin(VariantType::$variant);
                    let raw = unsafe { RawHandle::from_native(kind, src, VariantType::$variant.native_size()) };
                    Self { handle: life.register(raw) }
                }

                unsafe fn copy_from(src: ConstTypePtr, life: &Lifetime) -> Self {
                    Self { handle: construct(life, VariantType::$variant, CONSTRUCT_COPY, &[src]) }
                }
            }

            impl ToVariant for $name {
                fn to_variant(&self, life: &Lifetime) -> Variant {
                    encode(self, life)
                }
            }

            impl FromVariant for $name {
                fn try_from_variant(variant: &Variant, life: &Lifetime) -> Result<Self, ConversionError> {
                    decode(variant, life)
                }
            }

            impl fmt::Debug for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.debug_struct(stringify!($name)).field("handle", &self.handle.key()).finish()
                }
            }
        )*
    };
}

builtin_handle! {
    /// Engine string.
    GString => String;
    /// Interned engine string.
    StringName => StringName;
    NodePath => NodePath;
    /// Shared Variant array.
    Array => Array;
    /// Shared Variant-keyed map.
    Dictionary => Dictionary;
    Callable => Callable;
    Signal => Signal;
    PackedByteArray => PackedByteArray;
    PackedInt32Array => PackedInt32Array;
    PackedInt64Array => PackedInt64Array;
    PackedFloat32Array => PackedFloat32Array;
    PackedFloat64Array => PackedFloat64Array;
    PackedStringArray => PackedStringArray;
    PackedVector2Array => PackedVector2Array;
    PackedVector3Array => PackedVector3Array;
    PackedColorArray => PackedColorArray;
}

/// Calls an argumentless builtin method returning `int`.
fn call_int(life: &Lifetime, receiver: &Handle, entry: EntryPoint) -> i64 {
    let mut frame = CallFrame::open(life.runtime());
    let value = receiver.with_mut(|target| unsafe {
        frame.invoke(entry, target);
        frame.result::<i64>(life)
    });
    frame.close();
    value
}

impl GString {
    pub fn new(life: &Lifetime, text: &str) -> Self {
        let mut raw = RawHandle::empty(HandleKind::Builtin(VariantType::String));
        unsafe { life.runtime().api().string_new_with_utf8(raw.as_mut_ptr(), text) };
        Self { handle: life.register(raw) }
    }

    /// Length in characters.
    pub fn len(&self, life: &Lifetime) -> i64 {
        let method = life.runtime().variants().builtins.string_length;
        call_int(life, &self.handle, EntryPoint::Builtin(method))
    }

    pub fn is_empty(&self, life: &Lifetime) -> bool {
        self.len(life) == 0
    }

    /// Decodes the UTF-8 contents.
    pub fn try_to_string(&self) -> Result<String, ConversionError> {
        let runtime = self.handle.runtime();
        let raw = self.handle.raw();
        let len = unsafe { runtime.api().string_to_utf8(raw.as_ptr(), &mut []) };
        let mut buf = vec![0u8; len];
        unsafe { runtime.api().string_to_utf8(raw.as_ptr(), &mut buf) };
        String::from_utf8(buf).map_err(|_| ConversionError::InvalidUtf8)
    }
}

impl fmt::Display for GString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_to_string() {
            Ok(text) => f.write_str(&text),
            Err(_) => f.write_str("<invalid utf-8>"),
        }
    }
}

impl StringName {
    pub fn new(life: &Lifetime, text: &str) -> Self {
        let text = GString::new(life, text);
        let src = text.handle.raw();
        let name = Self { handle: construct(life, VariantType::StringName, CONSTRUCT_FROM_STRING, &[src.as_ptr()]) };
        text.release();
        name
    }
}

impl NodePath {
    pub fn new(life: &Lifetime, path: &str) -> Self {
        let text = GString::new(life, path);
        let src = text.handle.raw();
        let node_path = Self { handle: construct(life, VariantType::NodePath, CONSTRUCT_FROM_STRING, &[src.as_ptr()]) };
        text.release();
        node_path
    }
}

impl Array {
    pub fn len(&self, life: &Lifetime) -> i64 {
        let method = life.runtime().variants().builtins.array_size;
        call_int(life, &self.handle, EntryPoint::Builtin(method))
    }

    pub fn is_empty(&self, life: &Lifetime) -> bool {
        self.len(life) == 0
    }

    /// Appends a copy of `value`.
    pub fn push(&self, life: &Lifetime, value: &Variant) {
        let method = life.runtime().variants().builtins.array_append;
        let mut frame = CallFrame::open(life.runtime());
        frame.push(value);
        self.handle.with_mut(|target| unsafe { frame.invoke(EntryPoint::Builtin(method), target) });
        frame.close();
    }

    /// A copy of the element at `index`, or `None` out of range.
    pub fn get(&self, life: &Lifetime, index: i64) -> Option<Variant> {
        let runtime = life.runtime();
        let element = self.handle.with_mut(|target| unsafe { runtime.api().array_operator_index(target, index) });
        if element.is_null() {
            return None;
        }
        Some(unsafe { Variant::copy_from(element, life) })
    }
}

impl Dictionary {
    pub fn len(&self, life: &Lifetime) -> i64 {
        let method = life.runtime().variants().builtins.dictionary_size;
        call_int(life, &self.handle, EntryPoint::Builtin(method))
    }

    pub fn is_empty(&self, life: &Lifetime) -> bool {
        self.len(life) == 0
    }

    pub fn contains_key(&self, life: &Lifetime, key: &Variant) -> bool {
        let method = life.runtime().variants().builtins.dictionary_has;
        let mut frame = CallFrame::open(life.runtime());
        frame.push(key);
        let found = self.handle.with_mut(|target| unsafe {
            frame.invoke(EntryPoint::Builtin(method), target);
            frame.result::<bool>(life)
        });
        frame.close();
        found
    }

    /// Stores a copy of `value` under `key`, replacing any previous entry.
    pub fn insert(&self, life: &Lifetime, key: &Variant, value: &Variant) {
        let api = life.runtime().api();
        let key = key.handle().raw();
        let value = value.handle().raw();
        self.handle.with_mut(|target| unsafe {
            let entry = api.dictionary_operator_index(target, key.as_ptr());
            if !entry.is_null() {
                api.variant_destroy(entry);
                api.variant_new_copy(entry, value.as_ptr());
            }
        });
    }

    /// A copy of the value under `key`.
    pub fn get(&self, life: &Lifetime, key: &Variant) -> Option<Variant> {
        if !self.contains_key(life, key) {
            return None;
        }
        let runtime = life.runtime();
        let key = key.handle().raw();
        let entry = self.handle.with_mut(|target| unsafe { runtime.api().dictionary_operator_index(target, key.as_ptr()) });
        if entry.is_null() {
            return None;
        }
        Some(unsafe { Variant::copy_from(entry, life) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifetime::Context;
    use crate::testing::FakeEngine;

    #[test]
    fn string_length_and_text() {
        let engine = FakeEngine::new();
        let ctx = Context::new(engine.runtime());
        let life = ctx.scope();
        let text = GString::new(&life, "gdbridge");
        assert_eq!(text.len(&life), 8);
        assert_eq!(text.to_string(), "gdbridge");
        assert!(GString::new_in(&life).is_empty(&life));
        life.end();
    }

    #[test]
    fn string_released_at_scope_end() {
        let engine = FakeEngine::new();
        let ctx = Context::new(engine.runtime());
        let life = ctx.scope();
        let text = GString::new(&life, "bye");
        let raw = text.handle().raw();
        assert!(!engine.is_destroyed(&raw));
        life.end();
        assert!(engine.is_destroyed(&raw));
    }

    #[test]
    fn early_release_is_not_repeated() {
        let engine = FakeEngine::new();
        let ctx = Context::new(engine.runtime());
        let life = ctx.scope();
        let text = GString::new(&life, "once");
        let raw = text.handle().raw();
        text.release();
        assert!(engine.is_destroyed(&raw));
        // The fake engine panics on a second destroy.
        life.end();
    }

    #[test]
    fn array_push_get_len() {
        let engine = FakeEngine::new();
        let ctx = Context::new(engine.runtime());
        let life = ctx.scope();
        let array = Array::new_in(&life);
        array.push(&life, &1i64.to_variant(&life));
        array.push(&life, &"two".to_variant(&life));
        assert_eq!(array.len(&life), 2);
        assert_eq!(array.get(&life, 1).unwrap().to::<String>(&life).as_deref(), Ok("two"));
        assert!(array.get(&life, 5).is_none());
        life.end();
    }

    #[test]
    fn array_copies_share_storage() {
        let engine = FakeEngine::new();
        let ctx = Context::new(engine.runtime());
        let life = ctx.scope();
        let array = Array::new_in(&life);
        let alias = array.clone_in(&life);
        alias.push(&life, &3i64.to_variant(&life));
        assert_eq!(array.len(&life), 1);
        life.end();
    }

    #[test]
    fn dictionary_insert_get_has() {
        let engine = FakeEngine::new();
        let ctx = Context::new(engine.runtime());
        let life = ctx.scope();
        let map = Dictionary::new_in(&life);
        let key = "hp".to_variant(&life);
        map.insert(&life, &key, &10i64.to_variant(&life));
        map.insert(&life, &key, &12i64.to_variant(&life));
        assert_eq!(map.len(&life), 1);
        assert!(map.contains_key(&life, &key));
        assert_eq!(map.get(&life, &key).unwrap().to::<i64>(&life), Ok(12));
        assert!(map.get(&life, &"mp".to_variant(&life)).is_none());
        life.end();
    }

    #[test]
    fn string_name_and_node_path_from_text() {
        let engine = FakeEngine::new();
        let ctx = Context::new(engine.runtime());
        let life = ctx.scope();
        let name = StringName::new(&life, "ready");
        let path = NodePath::new(&life, "Root/Child");
        assert_eq!(name.to_variant(&life).get_type(), VariantType::StringName);
        assert_eq!(path.to_variant(&life).stringify(&life).to_string(), "Root/Child");
        life.end();
    }

    #[test]
    fn builtin_variant_round_trip() {
        let engine = FakeEngine::new();
        let ctx = Context::new(engine.runtime());
        let life = ctx.scope();
        let array = Array::new_in(&life);
        array.push(&life, &7i64.to_variant(&life));
        let variant = array.to_variant(&life);
        let back = variant.to::<Array>(&life).unwrap();
        assert_eq!(back.len(&life), 1);
        assert!(variant.to::<Dictionary>(&life).is_err());
        life.end();
    }
}
