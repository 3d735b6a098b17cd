//! Linear algebra aliases and small manifold helpers shared by the solver and
//! the graph engine.
//!
//! Every state vector in the engine is a run of `f64`s inside one contiguous
//! pool, so all helpers here operate on plain slices. Quaternions are stored
//! in `[x, y, z, w]` order, matching the pose layout
//! `[x, y, z, qx, qy, qz, qw]`.

use nalgebra::{Quaternion, UnitQuaternion};

pub mod pretty_print;

/// The floating point type used for all state, residual and Jacobian values.
pub type Float = f64;

/// Dynamically sized column vector of [`Float`]s.
pub type Vector = nalgebra::DVector<Float>;
/// Dynamically sized matrix of [`Float`]s.
pub type Matrix = nalgebra::DMatrix<Float>;

/// A 3D vector of [`Float`]s.
pub type Vector3 = nalgebra::Vector3<Float>;
/// A 3x3 matrix of [`Float`]s.
pub type Matrix3 = nalgebra::Matrix3<Float>;

pub mod prelude {
    pub use super::{Float, Matrix, Matrix3, Vector, Vector3};
}

/// Wrap an angle to the interval `(-pi, pi]`.
#[must_use]
pub fn wrap_angle(theta: Float) -> Float {
    let mut wrapped = theta % std::f64::consts::TAU;
    if wrapped > std::f64::consts::PI {
        wrapped -= std::f64::consts::TAU;
    } else if wrapped <= -std::f64::consts::PI {
        wrapped += std::f64::consts::TAU;
    }
    wrapped
}

/// Skew-symmetric (cross-product) matrix of `v`.
#[must_use]
pub fn skew(v: &Vector3) -> Matrix3 {
    Matrix3::new(0.0, -v[2], v[1], v[2], 0.0, -v[0], -v[1], v[0], 0.0)
}

/// Build a unit quaternion from an `[x, y, z, w]` slice.
///
/// # Panics
///
/// Panics if `xyzw` has fewer than four elements.
#[must_use]
pub fn quat_from_xyzw(xyzw: &[Float]) -> UnitQuaternion<Float> {
    UnitQuaternion::from_quaternion(Quaternion::new(xyzw[3], xyzw[0], xyzw[1], xyzw[2]))
}

/// Write a unit quaternion into an `[x, y, z, w]` slice.
///
/// # Panics
///
/// Panics if `out` has fewer than four elements.
pub fn quat_to_xyzw(q: &UnitQuaternion<Float>, out: &mut [Float]) {
    out[0] = q.i;
    out[1] = q.j;
    out[2] = q.k;
    out[3] = q.w;
}

/// Exponential map of so(3): rotation vector (full angle) to unit quaternion.
#[must_use]
pub fn so3_exp(omega: &Vector3) -> UnitQuaternion<Float> {
    let angle = omega.norm();
    if angle < 1e-12 {
        // First order expansion keeps the map smooth through zero.
        UnitQuaternion::from_quaternion(Quaternion::new(
            1.0,
            0.5 * omega[0],
            0.5 * omega[1],
            0.5 * omega[2],
        ))
    } else {
        let axis = nalgebra::Unit::new_normalize(*omega);
        UnitQuaternion::from_axis_angle(&axis, angle)
    }
}

/// Logarithmic map of SO(3): unit quaternion to rotation vector (full angle).
#[must_use]
pub fn so3_log(q: &UnitQuaternion<Float>) -> Vector3 {
    q.scaled_axis()
}

/// On-manifold orientation difference `2 * vec(q0^-1 * q)`.
///
/// The small-angle convention used by the marginal factor: the delta
/// quaternion's scalar part is kept non-negative, and twice its vector part
/// approximates the rotation vector between the two orientations.
#[must_use]
pub fn quat_boxminus_approx(q: &UnitQuaternion<Float>, q0: &UnitQuaternion<Float>) -> Vector3 {
    let mut delta = q0.inverse() * q;
    if delta.w < 0.0 {
        delta = UnitQuaternion::from_quaternion(Quaternion::new(
            -delta.w, -delta.i, -delta.j, -delta.k,
        ));
    }
    2.0 * Vector3::new(delta.i, delta.j, delta.k)
}
