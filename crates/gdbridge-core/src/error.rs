//! Error types for the binding layer.
//!
//! ## Error Hierarchy
//!
//! ```text
//! Error (top-level wrapper)
//! ├── CallError        - native call-error record from a checked call
//! ├── ResolutionError  - a required entry point resolved to null at link time
//! └── ConversionError  - a Variant did not hold the requested type
//! ```
//!
//! Usage errors (double free, ended scope, double wrap, stale instance) are not
//! represented here. They panic at the point of misuse.

use std::ffi::CString;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

use crate::sys::RawCallError;
use crate::types::VariantType;

// ============================================================================
// Call Errors
// ============================================================================

/// Raw call-error codes as written by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum CallErrorKind {
    Ok = 0,
    InvalidMethod = 1,
    InvalidArgument = 2,
    TooManyArguments = 3,
    TooFewArguments = 4,
    InstanceIsNull = 5,
    MethodNotConst = 6,
}

/// A failed checked call.
///
/// Messages follow the engine's own wording so that they match what the engine
/// documentation and console report for the same failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("invalid call: nonexistent function")]
    InvalidMethod,

    #[error("invalid type in argument {argument}, should be {expected}")]
    InvalidArgument { argument: i32, expected: VariantType },

    #[error("invalid call to function: expected {expected} arguments")]
    TooManyArguments { expected: i32 },

    #[error("invalid call to function: expected {expected} arguments")]
    TooFewArguments { expected: i32 },

    #[error("attempt to call function on a null instance")]
    InstanceIsNull,

    #[error("method not const in a const instance")]
    MethodNotConst,
}

impl CallError {
    /// Translates a raw record filled by the engine.
    ///
    /// Unknown codes are reported as [`CallError::InvalidMethod`].
    pub fn check(raw: &RawCallError) -> std::result::Result<(), CallError> {
        let kind = CallErrorKind::try_from(raw.error).unwrap_or(CallErrorKind::InvalidMethod);
        let error = match kind {
            CallErrorKind::Ok => return Ok(()),
            CallErrorKind::InvalidMethod => CallError::InvalidMethod,
            CallErrorKind::InvalidArgument => CallError::InvalidArgument {
                argument: raw.argument,
                expected: VariantType::try_from(raw.expected as u32).unwrap_or(VariantType::Nil),
            },
            CallErrorKind::TooManyArguments => CallError::TooManyArguments { expected: raw.expected },
            CallErrorKind::TooFewArguments => CallError::TooFewArguments { expected: raw.expected },
            CallErrorKind::InstanceIsNull => CallError::InstanceIsNull,
            CallErrorKind::MethodNotConst => CallError::MethodNotConst,
        };
        Err(error)
    }

    /// Raw code for this error.
    pub fn kind(&self) -> CallErrorKind {
        match self {
            CallError::InvalidMethod => CallErrorKind::InvalidMethod,
            CallError::InvalidArgument { .. } => CallErrorKind::InvalidArgument,
            CallError::TooManyArguments { .. } => CallErrorKind::TooManyArguments,
            CallError::TooFewArguments { .. } => CallErrorKind::TooFewArguments,
            CallError::InstanceIsNull => CallErrorKind::InstanceIsNull,
            CallError::MethodNotConst => CallErrorKind::MethodNotConst,
        }
    }

    /// Record to hand back to the engine from a callback.
    pub fn to_raw(&self) -> RawCallError {
        let (argument, expected) = match *self {
            CallError::InvalidArgument { argument, expected } => (argument, u32::from(expected) as i32),
            CallError::TooManyArguments { expected } | CallError::TooFewArguments { expected } => (0, expected),
            _ => (0, 0),
        };
        RawCallError { error: self.kind().into(), argument, expected }
    }
}

// ============================================================================
// Resolution Errors
// ============================================================================

/// A required engine entry point could not be resolved.
///
/// These only occur while linking and abort initialization.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("engine interface is missing `{symbol}`")]
    MissingSymbol { symbol: &'static str },

    #[error("engine interface version {major}.{minor} is not supported")]
    IncompatibleVersion { major: u32, minor: u32 },

    #[error("no constructor #{index} for {ty}")]
    MissingConstructor { ty: VariantType, index: i32 },

    #[error("no destructor for {ty}")]
    MissingDestructor { ty: VariantType },

    #[error("no Variant conversion for {ty}")]
    MissingConversion { ty: VariantType },

    #[error("no operator evaluator for {ty}")]
    MissingOperator { ty: VariantType },

    #[error("no builtin method {ty}.{method} with hash {hash}")]
    MissingBuiltinMethod { ty: VariantType, method: String, hash: i64 },

    #[error("no utility function {name} with hash {hash}")]
    MissingUtility { name: String, hash: i64 },

    #[error("no method bind {class}.{method} with hash {hash}")]
    MissingMethodBind { class: String, method: String, hash: i64 },

    #[error("no class tag for {class}")]
    MissingClassTag { class: String },

    #[error("name `{name}` contains an interior nul byte")]
    InvalidName { name: String },
}

/// Builds a C string for a name passed to the engine's lookup functions.
pub(crate) fn c_name(name: &str) -> std::result::Result<CString, ResolutionError> {
    CString::new(name).map_err(|_| ResolutionError::InvalidName { name: name.to_string() })
}

// ============================================================================
// Conversion Errors
// ============================================================================

/// A value could not be decoded into the requested type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversionError {
    #[error("type mismatch: expected {expected}, found {actual}")]
    TypeMismatch { expected: VariantType, actual: VariantType },

    #[error("integer overflow: {value} does not fit in {target_type}")]
    IntegerOverflow { value: i64, target_type: &'static str },

    #[error("string is not valid UTF-8")]
    InvalidUtf8,
}

// ============================================================================
// Unified Error
// ============================================================================

/// Any recoverable error produced by the binding layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error(transparent)]
    Call(#[from] CallError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Conversion(#[from] ConversionError),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_record_is_not_an_error() {
        let raw = RawCallError::default();
        assert!(CallError::check(&raw).is_ok());
    }

    #[test]
    fn too_few_arguments_keeps_expected_count() {
        let raw = RawCallError { error: 4, argument: 0, expected: 3 };
        assert_eq!(CallError::check(&raw), Err(CallError::TooFewArguments { expected: 3 }));
    }

    #[test]
    fn invalid_argument_decodes_expected_type() {
        let raw = RawCallError { error: 2, argument: 1, expected: 4 };
        let err = CallError::check(&raw).unwrap_err();
        assert!(matches!(err, CallError::InvalidArgument { argument: 1, expected: VariantType::String }));
        assert_eq!(err.to_string(), "invalid type in argument 1, should be String");
    }

    #[test]
    fn raw_round_trip_preserves_fields() {
        let err = CallError::InvalidArgument { argument: 2, expected: VariantType::Int };
        assert_eq!(CallError::check(&err.to_raw()), Err(err));
        assert_eq!(CallError::MethodNotConst.to_raw().error, 6);
    }

    #[test]
    fn unknown_code_maps_to_invalid_method() {
        let raw = RawCallError { error: 99, argument: 0, expected: 0 };
        assert_eq!(CallError::check(&raw), Err(CallError::InvalidMethod));
    }

    #[test]
    fn resolution_error_names_the_symbol() {
        let err = ResolutionError::MissingSymbol { symbol: "variant_destroy" };
        assert_eq!(err.to_string(), "engine interface is missing `variant_destroy`");
    }

    #[test]
    fn interior_nul_is_rejected() {
        assert!(matches!(c_name("bad\0name"), Err(ResolutionError::InvalidName { .. })));
        assert!(c_name("good").is_ok());
    }

    #[test]
    fn call_errors_propagate_into_the_unified_result() {
        fn checked(raw: &RawCallError) -> Result<u8> {
            CallError::check(raw)?;
            Ok(1)
        }
        assert_eq!(checked(&RawCallError::default()), Ok(1));
        let raw = RawCallError { error: 5, argument: 0, expected: 0 };
        assert_eq!(checked(&raw), Err(Error::Call(CallError::InstanceIsNull)));
    }

    #[test]
    fn unified_error_wraps_each_kind() {
        let err: Error = ConversionError::InvalidUtf8.into();
        assert!(matches!(err, Error::Conversion(ConversionError::InvalidUtf8)));
        let err: Error = CallError::InstanceIsNull.into();
        assert!(matches!(err, Error::Call(CallError::InstanceIsNull)));
    }
}
