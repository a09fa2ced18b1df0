//! Math type aliases and floating-origin helpers.

pub use nalgebra;

/// 2D vector (f32).
pub type Vec2 = nalgebra::Vector2<f32>;

/// 3D vector (f32).
pub type Vec3 = nalgebra::Vector3<f32>;

/// 4D vector (f32).
pub type Vec4 = nalgebra::Vector4<f32>;

/// 3D vector (f64), used for world positions.
pub type DVec3 = nalgebra::Vector3<f64>;

/// 3x3 matrix (f32).
pub type Mat3 = nalgebra::Matrix3<f32>;

/// 4x4 matrix (f32).
pub type Mat4 = nalgebra::Matrix4<f32>;

/// 3 rows by 4 columns (f32), an affine transform without the projective row.
pub type Mat3x4 = nalgebra::Matrix3x4<f32>;

/// Position of `position` relative to the floating `origin`, narrowed to f32.
pub fn relative_to_origin(position: &DVec3, origin: &DVec3) -> Vec3 {
    (position - origin).cast::<f32>()
}
