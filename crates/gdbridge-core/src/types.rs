//! Enumerations shared with the engine ABI.
//!
//! Every enum here travels across the boundary as a plain integer, so each one
//! is `#[repr(..)]` with explicit discriminants and converts back from raw codes
//! through `num_enum`.

use std::fmt;

use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Number of distinct [`VariantType`] kinds.
pub const VARIANT_TYPE_COUNT: usize = 38;

/// Tag of the engine's Variant union.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum VariantType {
    Nil = 0,
    Bool = 1,
    Int = 2,
    Float = 3,
    String = 4,
    Vector2 = 5,
    Vector2i = 6,
    Rect2 = 7,
    Rect2i = 8,
    Vector3 = 9,
    Vector3i = 10,
    Transform2D = 11,
    Vector4 = 12,
    Vector4i = 13,
    Plane = 14,
    Quaternion = 15,
    Aabb = 16,
    Basis = 17,
    Transform3D = 18,
    Projection = 19,
    Color = 20,
    StringName = 21,
    NodePath = 22,
    Rid = 23,
    Object = 24,
    Callable = 25,
    Signal = 26,
    Dictionary = 27,
    Array = 28,
    PackedByteArray = 29,
    PackedInt32Array = 30,
    PackedInt64Array = 31,
    PackedFloat32Array = 32,
    PackedFloat64Array = 33,
    PackedStringArray = 34,
    PackedVector2Array = 35,
    PackedVector3Array = 36,
    PackedColorArray = 37,
}

impl VariantType {
    /// All kinds in discriminant order.
    pub const ALL: [VariantType; VARIANT_TYPE_COUNT] = [
        VariantType::Nil,
        VariantType::Bool,
        VariantType::Int,
        VariantType::Float,
        VariantType::String,
        VariantType::Vector2,
        VariantType::Vector2i,
        VariantType::Rect2,
        VariantType::Rect2i,
        VariantType::Vector3,
        VariantType::Vector3i,
        VariantType::Transform2D,
        VariantType::Vector4,
        VariantType::Vector4i,
        VariantType::Plane,
        VariantType::Quaternion,
        VariantType::Aabb,
        VariantType::Basis,
        VariantType::Transform3D,
        VariantType::Projection,
        VariantType::Color,
        VariantType::StringName,
        VariantType::NodePath,
        VariantType::Rid,
        VariantType::Object,
        VariantType::Callable,
        VariantType::Signal,
        VariantType::Dictionary,
        VariantType::Array,
        VariantType::PackedByteArray,
        VariantType::PackedInt32Array,
        VariantType::PackedInt64Array,
        VariantType::PackedFloat32Array,
        VariantType::PackedFloat64Array,
        VariantType::PackedStringArray,
        VariantType::PackedVector2Array,
        VariantType::PackedVector3Array,
        VariantType::PackedColorArray,
    ];

    /// Index into per-type tables.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Size in bytes of the type's native (ptrcall) representation.
    pub const fn native_size(self) -> usize {
        match self {
            VariantType::Nil => 0,
            VariantType::Bool => 1,
            VariantType::Int | VariantType::Float => 8,
            VariantType::Vector2 | VariantType::Vector2i => 8,
            VariantType::Vector3 | VariantType::Vector3i => 12,
            VariantType::Rect2
            | VariantType::Rect2i
            | VariantType::Vector4
            | VariantType::Vector4i
            | VariantType::Plane
            | VariantType::Quaternion
            | VariantType::Color => 16,
            VariantType::Transform2D | VariantType::Aabb => 24,
            VariantType::Basis => 36,
            VariantType::Transform3D => 48,
            VariantType::Projection => 64,
            VariantType::String
            | VariantType::StringName
            | VariantType::NodePath
            | VariantType::Rid
            | VariantType::Object
            | VariantType::Dictionary
            | VariantType::Array => 8,
            VariantType::Callable
            | VariantType::Signal
            | VariantType::PackedByteArray
            | VariantType::PackedInt32Array
            | VariantType::PackedInt64Array
            | VariantType::PackedFloat32Array
            | VariantType::PackedFloat64Array
            | VariantType::PackedStringArray
            | VariantType::PackedVector2Array
            | VariantType::PackedVector3Array
            | VariantType::PackedColorArray => 16,
        }
    }

    /// Whether values of this type own native memory and need a destructor.
    pub const fn needs_destructor(self) -> bool {
        matches!(
            self,
            VariantType::String
                | VariantType::StringName
                | VariantType::NodePath
                | VariantType::Callable
                | VariantType::Signal
                | VariantType::Dictionary
                | VariantType::Array
                | VariantType::PackedByteArray
                | VariantType::PackedInt32Array
                | VariantType::PackedInt64Array
                | VariantType::PackedFloat32Array
                | VariantType::PackedFloat64Array
                | VariantType::PackedStringArray
                | VariantType::PackedVector2Array
                | VariantType::PackedVector3Array
                | VariantType::PackedColorArray
        )
    }

    /// Engine-facing type name.
    pub const fn name(self) -> &'static str {
        match self {
            VariantType::Nil => "Nil",
            VariantType::Bool => "bool",
            VariantType::Int => "int",
            VariantType::Float => "float",
            VariantType::String => "String",
            VariantType::Vector2 => "Vector2",
            VariantType::Vector2i => "Vector2i",
            VariantType::Rect2 => "Rect2",
            VariantType::Rect2i => "Rect2i",
            VariantType::Vector3 => "Vector3",
            VariantType::Vector3i => "Vector3i",
            VariantType::Transform2D => "Transform2D",
            VariantType::Vector4 => "Vector4",
            VariantType::Vector4i => "Vector4i",
            VariantType::Plane => "Plane",
            VariantType::Quaternion => "Quaternion",
            VariantType::Aabb => "AABB",
            VariantType::Basis => "Basis",
            VariantType::Transform3D => "Transform3D",
            VariantType::Projection => "Projection",
            VariantType::Color => "Color",
            VariantType::StringName => "StringName",
            VariantType::NodePath => "NodePath",
            VariantType::Rid => "RID",
            VariantType::Object => "Object",
            VariantType::Callable => "Callable",
            VariantType::Signal => "Signal",
            VariantType::Dictionary => "Dictionary",
            VariantType::Array => "Array",
            VariantType::PackedByteArray => "PackedByteArray",
            VariantType::PackedInt32Array => "PackedInt32Array",
            VariantType::PackedInt64Array => "PackedInt64Array",
            VariantType::PackedFloat32Array => "PackedFloat32Array",
            VariantType::PackedFloat64Array => "PackedFloat64Array",
            VariantType::PackedStringArray => "PackedStringArray",
            VariantType::PackedVector2Array => "PackedVector2Array",
            VariantType::PackedVector3Array => "PackedVector3Array",
            VariantType::PackedColorArray => "PackedColorArray",
        }
    }
}

impl fmt::Display for VariantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Variant-level operators understood by the engine's evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum Operator {
    Equal = 0,
    NotEqual = 1,
    Less = 2,
    LessEqual = 3,
    Greater = 4,
    GreaterEqual = 5,
    Add = 6,
    Subtract = 7,
    Multiply = 8,
    Divide = 9,
    Negate = 10,
    Positive = 11,
    Module = 12,
    Power = 13,
    ShiftLeft = 14,
    ShiftRight = 15,
    BitAnd = 16,
    BitOr = 17,
    BitXor = 18,
    BitNegate = 19,
    And = 20,
    Or = 21,
    Xor = 22,
    Not = 23,
    In = 24,
}

impl Operator {
    /// Operators whose same-type evaluators are resolved when the variant tables link.
    pub const LINKED: [Operator; 10] = [
        Operator::Equal,
        Operator::NotEqual,
        Operator::Less,
        Operator::LessEqual,
        Operator::Greater,
        Operator::GreaterEqual,
        Operator::Add,
        Operator::Subtract,
        Operator::Multiply,
        Operator::Divide,
    ];
}

/// Engine initialization stage. Callbacks fire once per stage, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum InitializationLevel {
    Core = 0,
    Servers = 1,
    #[default]
    Scene = 2,
    Editor = 3,
}

impl fmt::Display for InitializationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InitializationLevel::Core => "core",
            InitializationLevel::Servers => "servers",
            InitializationLevel::Scene => "scene",
            InitializationLevel::Editor => "editor",
        };
        f.write_str(name)
    }
}

bitflags! {
    /// Flags attached to a method exposed to the engine.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MethodFlags: u32 {
        const NORMAL = 1;
        const EDITOR = 2;
        const CONST = 4;
        const VIRTUAL = 8;
        const VARARG = 16;
        const STATIC = 32;
        const DEFAULT = Self::NORMAL.bits();
    }
}

bitflags! {
    /// Usage flags for a registered property.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PropertyUsage: u32 {
        const NONE = 0;
        const STORAGE = 2;
        const EDITOR = 4;
        const INTERNAL = 8;
        const DEFAULT = Self::STORAGE.bits() | Self::EDITOR.bits();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_type_table_is_in_discriminant_order() {
        for (i, ty) in VariantType::ALL.iter().enumerate() {
            assert_eq!(ty.index(), i);
        }
    }

    #[test]
    fn variant_type_from_raw_code() {
        assert_eq!(VariantType::try_from(24u32).ok(), Some(VariantType::Object));
        assert!(VariantType::try_from(VARIANT_TYPE_COUNT as u32).is_err());
    }

    #[test]
    fn handle_types_need_destructors() {
        assert!(VariantType::String.needs_destructor());
        assert!(VariantType::PackedColorArray.needs_destructor());
        assert!(!VariantType::Vector3.needs_destructor());
        assert!(!VariantType::Object.needs_destructor());
    }

    #[test]
    fn largest_value_type_is_projection() {
        let largest = VariantType::ALL.iter().map(|ty| ty.native_size()).max();
        assert_eq!(largest, Some(VariantType::Projection.native_size()));
    }

    #[test]
    fn initialization_levels_are_ordered() {
        assert!(InitializationLevel::Core < InitializationLevel::Servers);
        assert!(InitializationLevel::Scene < InitializationLevel::Editor);
        assert_eq!(InitializationLevel::default(), InitializationLevel::Scene);
    }

    #[test]
    fn method_flags_default_is_normal() {
        assert_eq!(MethodFlags::DEFAULT, MethodFlags::NORMAL);
        assert!((MethodFlags::CONST | MethodFlags::VIRTUAL).contains(MethodFlags::VIRTUAL));
    }
}
