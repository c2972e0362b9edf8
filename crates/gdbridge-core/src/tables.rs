//! Variant-level function tables, resolved once at the core level.

use log::debug;
use rustc_hash::FxHashMap;

use crate::api::NativeApi;
use crate::error::ResolutionError;
use crate::methods::BuiltinMethod;
use crate::sys::{PtrConstructor, PtrDestructor, PtrOperatorEvaluator, TypeFromVariantFn, VariantFromTypeFn};
use crate::types::{Operator, VARIANT_TYPE_COUNT, VariantType};

/// Constructor index of the default constructor.
pub const CONSTRUCT_DEFAULT: i32 = 0;
/// Constructor index of the copy constructor.
pub const CONSTRUCT_COPY: i32 = 1;
/// Constructor index taking a `String`, for `StringName` and `NodePath`.
pub const CONSTRUCT_FROM_STRING: i32 = 2;

/// Builtin methods the wrappers in [`crate::builtins`] call.
#[derive(Debug, Clone, Copy)]
pub struct BuiltinMethods {
    pub string_length: BuiltinMethod,
    pub array_size: BuiltinMethod,
    pub array_append: BuiltinMethod,
    pub dictionary_size: BuiltinMethod,
    pub dictionary_has: BuiltinMethod,
}

impl BuiltinMethods {
    fn link(api: &dyn NativeApi) -> Result<Self, ResolutionError> {
        Ok(Self {
            string_length: BuiltinMethod::resolve(api, VariantType::String, "length", 3173160232)?,
            array_size: BuiltinMethod::resolve(api, VariantType::Array, "size", 3173160232)?,
            array_append: BuiltinMethod::resolve(api, VariantType::Array, "append", 3316032543)?,
            dictionary_size: BuiltinMethod::resolve(api, VariantType::Dictionary, "size", 3173160232)?,
            dictionary_has: BuiltinMethod::resolve(api, VariantType::Dictionary, "has", 3680194679)?,
        })
    }
}

/// Conversion, construction, destruction and operator functions per Variant type.
///
/// Every entry is checked while linking, so lookups after a successful
/// [`VariantTables::link`] only fail for combinations that never exist
/// (such as a destructor for `int`), which is a programming error.
pub struct VariantTables {
    from_type: [Option<VariantFromTypeFn>; VARIANT_TYPE_COUNT],
    to_type: [Option<TypeFromVariantFn>; VARIANT_TYPE_COUNT],
    destructors: [Option<PtrDestructor>; VARIANT_TYPE_COUNT],
    constructors: FxHashMap<(VariantType, i32), PtrConstructor>,
    operators: FxHashMap<(Operator, VariantType), PtrOperatorEvaluator>,
    pub builtins: BuiltinMethods,
}

impl VariantTables {
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn link(api: &dyn NativeApi) -> Result<Self, ResolutionError> {
        let mut from_type = [None; VARIANT_TYPE_COUNT];
        let mut to_type = [None; VARIANT_TYPE_COUNT];
        let mut destructors = [None; VARIANT_TYPE_COUNT];
        let mut constructors = FxHashMap::default();

        for ty in VariantType::ALL.into_iter().filter(|ty| *ty != VariantType::Nil) {
            from_type[ty.index()] = Some(api.variant_from_type_constructor(ty).ok_or(ResolutionError::MissingConversion { ty })?);
            to_type[ty.index()] = Some(api.variant_to_type_constructor(ty).ok_or(ResolutionError::MissingConversion { ty })?);

            if !ty.needs_destructor() {
                continue;
            }
            destructors[ty.index()] = Some(api.ptr_destructor(ty).ok_or(ResolutionError::MissingDestructor { ty })?);
            let mut indices = vec![CONSTRUCT_DEFAULT, CONSTRUCT_COPY];
            if matches!(ty, VariantType::StringName | VariantType::NodePath) {
                indices.push(CONSTRUCT_FROM_STRING);
            }
            for index in indices {
                let constructor = api.ptr_constructor(ty, index).ok_or(ResolutionError::MissingConstructor { ty, index })?;
                constructors.insert((ty, index), constructor);
            }
        }

        // Not every type defines every operator; missing ones fall back to
        // the generic evaluator.
        let mut operators = FxHashMap::default();
        for op in Operator::LINKED {
            for ty in VariantType::ALL {
                if let Some(evaluator) = api.ptr_operator_evaluator(op, ty, ty) {
                    operators.insert((op, ty), evaluator);
                }
            }
        }

        let builtins = BuiltinMethods::link(api)?;
        debug!("linked variant tables: {} constructors, {} operator evaluators", constructors.len(), operators.len());
        Ok(Self { from_type, to_type, destructors, constructors, operators, builtins })
    }

    /// Converter writing a Variant from a native value of `ty`.
    pub fn from_type(&self, ty: VariantType) -> VariantFromTypeFn {
        match self.from_type[ty.index()] {
            Some(function) => function,
            None => panic!("no Variant conversion from {ty}"),
        }
    }

    /// Converter writing a native value of `ty` from a Variant.
    pub fn to_type(&self, ty: VariantType) -> TypeFromVariantFn {
        match self.to_type[ty.index()] {
            Some(function) => function,
            None => panic!("no Variant conversion to {ty}"),
        }
    }

    pub fn destructor(&self, ty: VariantType) -> PtrDestructor {
        match self.destructors[ty.index()] {
            Some(function) => function,
            None => panic!("{ty} has no destructor"),
        }
    }

    pub fn constructor(&self, ty: VariantType, index: i32) -> PtrConstructor {
        match self.constructors.get(&(ty, index)) {
            Some(function) => *function,
            None => panic!("constructor #{index} of {ty} was not linked"),
        }
    }

    /// Same-type evaluator for `op`, if the engine provides one.
    pub fn operator(&self, op: Operator, ty: VariantType) -> Option<PtrOperatorEvaluator> {
        self.operators.get(&(op, ty)).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeEngine;

    #[test]
    fn links_every_handle_type() {
        let engine = FakeEngine::new();
        let tables = VariantTables::link(&engine).unwrap();
        for ty in VariantType::ALL.into_iter().filter(|ty| ty.needs_destructor()) {
            tables.destructor(ty);
            tables.constructor(ty, CONSTRUCT_COPY);
        }
        tables.constructor(VariantType::NodePath, CONSTRUCT_FROM_STRING);
    }

    #[test]
    fn operators_are_optional() {
        let engine = FakeEngine::new();
        let tables = VariantTables::link(&engine).unwrap();
        assert!(tables.operator(Operator::Add, VariantType::Int).is_some());
        assert!(tables.operator(Operator::Divide, VariantType::Callable).is_none());
    }

    #[test]
    fn missing_conversion_fails_linking() {
        let engine = FakeEngine::new();
        engine.withhold_conversion(VariantType::Color);
        let err = VariantTables::link(&engine).err();
        assert_eq!(err, Some(ResolutionError::MissingConversion { ty: VariantType::Color }));
    }

    #[test]
    #[should_panic(expected = "has no destructor")]
    fn plain_types_have_no_destructor() {
        let engine = FakeEngine::new();
        let tables = VariantTables::link(&engine).unwrap();
        tables.destructor(VariantType::Int);
    }
}
