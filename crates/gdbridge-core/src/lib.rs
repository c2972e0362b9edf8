//! Core of the gdbridge engine binding layer.
//!
//! Everything a loaded library needs to talk to the engine through its C
//! interface without a registry of its own classes:
//!
//! - [`sys`] and [`api`]: the raw function table and the [`NativeApi`] seam over it.
//! - [`lifetime`]: scopes that own engine handles and destroy them when they end.
//! - [`frame`] and [`marshal`]: fixed-capacity call frames and native conversions.
//! - [`variant`] and [`builtins`]: the Variant bridge and handle-backed builtin types.
//! - [`object`]: engine objects and the ownership tracker.
//! - [`runtime`]: staged linking of the engine tables and object bookkeeping.

pub mod api;
pub mod builtins;
pub mod error;
pub mod frame;
pub mod hash;
pub mod lifetime;
pub mod logging;
pub mod marshal;
pub mod methods;
pub mod object;
pub mod runtime;
pub mod sys;
pub mod tables;
pub mod types;
pub mod values;
pub mod variant;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use api::{NativeApi, RawApi};
pub use builtins::{
    Array, Callable, Dictionary, GString, NodePath, PackedByteArray, PackedColorArray, PackedFloat32Array,
    PackedFloat64Array, PackedInt32Array, PackedInt64Array, PackedStringArray, PackedVector2Array, PackedVector3Array,
    Signal, StringName,
};
pub use error::{CallError, ConversionError, Error, ResolutionError, Result};
pub use frame::{CallFrame, EntryPoint, MAX_ARGS};
pub use hash::MethodHash;
pub use lifetime::{Context, Handle, Lifetime, RawHandle};
pub use logging::EngineLogger;
pub use marshal::{FromNative, NativeType, ReturnValue, ToNative};
pub use methods::{BuiltinMethod, ClassTag, MethodBind, UtilityFunction};
pub use object::{Object, ObjectKey, ObjectState};
pub use runtime::{LibraryToken, Runtime};
pub use types::{InitializationLevel, MethodFlags, Operator, PropertyUsage, VariantType};
pub use values::*;
pub use variant::{FromVariant, ToVariant, Variant};
