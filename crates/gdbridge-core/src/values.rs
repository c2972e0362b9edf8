//! Plain value types with the engine's memory layout.
//!
//! These carry no ownership and no math; they exist so that values can be
//! copied bit-for-bit into call frames and Variants.

pub type Real = f32;

macro_rules! value_types {
    ($( $(#[$meta:meta])* $name:ident { $($field:ident: $ty:ty),* $(,)? } )*) => {
        $(
            $(#[$meta])*
            #[repr(C)]
            #[derive(Debug, Clone, Copy, Default, PartialEq)]
            pub struct $name {
                $( pub $field: $ty, )*
            }
        )*
    };
}

value_types! {
    Vector2 { x: Real, y: Real }
    Vector2i { x: i32, y: i32 }
    Vector3 { x: Real, y: Real, z: Real }
    Vector3i { x: i32, y: i32, z: i32 }
    Vector4 { x: Real, y: Real, z: Real, w: Real }
    Vector4i { x: i32, y: i32, z: i32, w: i32 }
    Rect2 { position: Vector2, size: Vector2 }
    Rect2i { position: Vector2i, size: Vector2i }
    /// Columns `x`, `y` and the origin.
    Transform2D { x: Vector2, y: Vector2, origin: Vector2 }
    Plane { normal: Vector3, d: Real }
    Quaternion { x: Real, y: Real, z: Real, w: Real }
    Aabb { position: Vector3, size: Vector3 }
    /// Row-major 3x3 matrix.
    Basis { rows: [Vector3; 3] }
    Transform3D { basis: Basis, origin: Vector3 }
    /// Column-major 4x4 matrix.
    Projection { columns: [Vector4; 4] }
    Color { r: f32, g: f32, b: f32, a: f32 }
}

/// Opaque server resource id.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Rid(pub u64);

impl Vector2 {
    pub const fn new(x: Real, y: Real) -> Self {
        Self { x, y }
    }
}

impl Vector3 {
    pub const fn new(x: Real, y: Real, z: Real) -> Self {
        Self { x, y, z }
    }
}

impl Color {
    pub const fn rgba(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }
}

impl Basis {
    pub const IDENTITY: Basis = Basis {
        rows: [Vector3::new(1.0, 0.0, 0.0), Vector3::new(0.0, 1.0, 0.0), Vector3::new(0.0, 0.0, 1.0)],
    };
}
