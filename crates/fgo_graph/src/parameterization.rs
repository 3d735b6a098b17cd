//! Manifold update rules for the non-Euclidean variable types.
//!
//! One parameterization object serves every variable of the same type within
//! a single optimization call; the optimizer creates them lazily through
//! [`manifold_for`] and drops them when the call returns.

use std::sync::Arc;

use fgo_linalg::{quat_from_xyzw, quat_to_xyzw, so3_exp, Float, Matrix, Vector3};
use fgo_solver::{EuclideanManifold, Manifold};

use crate::variable::VariableType;

/// Unit quaternion in `[x, y, z, w]` storage, updated as `q <- q * exp(delta/2)`
/// with `delta` a full-angle rotation vector.
#[derive(Debug, Clone, Copy)]
pub struct QuaternionParameterization;

/// SE(3) pose `[t, q]`: translation is additive, orientation follows
/// [`QuaternionParameterization`].
#[derive(Debug, Clone, Copy)]
pub struct PoseSe3Parameterization;

/// SIM(3) pose `[t, q, s]`: as SE(3) with a log-scale update `s <- s * exp(ds)`.
#[derive(Debug, Clone, Copy)]
pub struct PoseSim3Parameterization;

fn quat_plus(x: &[Float], delta: &[Float], out: &mut [Float]) {
    let q = quat_from_xyzw(x);
    let updated = q * so3_exp(&Vector3::new(delta[0], delta[1], delta[2]));
    quat_to_xyzw(&updated, out);
}

/// Jacobian of `q * exp(delta/2)` with respect to `delta` at zero: for a unit
/// quaternion `q = (v, w)` the column for axis `e_k` is
/// `(w e_k + v x e_k, -v . e_k) / 2`.
fn quat_plus_jacobian(x: &[Float]) -> Matrix {
    let (qx, qy, qz, qw) = (x[0], x[1], x[2], x[3]);
    0.5 * Matrix::from_row_slice(4, 3, &[
        qw, -qz, qy, //
        qz, qw, -qx, //
        -qy, qx, qw, //
        -qx, -qy, -qz,
    ])
}

impl Manifold for QuaternionParameterization {
    fn global_size(&self) -> usize {
        4
    }

    fn local_size(&self) -> usize {
        3
    }

    fn plus(&self, x: &[Float], delta: &[Float], out: &mut [Float]) {
        quat_plus(x, delta, out);
    }

    fn plus_jacobian(&self, x: &[Float]) -> Matrix {
        quat_plus_jacobian(x)
    }
}

impl Manifold for PoseSe3Parameterization {
    fn global_size(&self) -> usize {
        7
    }

    fn local_size(&self) -> usize {
        6
    }

    fn plus(&self, x: &[Float], delta: &[Float], out: &mut [Float]) {
        for i in 0..3 {
            out[i] = x[i] + delta[i];
        }
        quat_plus(&x[3..7], &delta[3..6], &mut out[3..7]);
    }

    fn plus_jacobian(&self, x: &[Float]) -> Matrix {
        let mut jacobian = Matrix::zeros(7, 6);
        jacobian.view_mut((0, 0), (3, 3)).fill_with_identity();
        jacobian
            .view_mut((3, 3), (4, 3))
            .copy_from(&quat_plus_jacobian(&x[3..7]));
        jacobian
    }
}

impl Manifold for PoseSim3Parameterization {
    fn global_size(&self) -> usize {
        8
    }

    fn local_size(&self) -> usize {
        7
    }

    fn plus(&self, x: &[Float], delta: &[Float], out: &mut [Float]) {
        for i in 0..3 {
            out[i] = x[i] + delta[i];
        }
        quat_plus(&x[3..7], &delta[3..6], &mut out[3..7]);
        out[7] = x[7] * delta[6].exp();
    }

    fn plus_jacobian(&self, x: &[Float]) -> Matrix {
        let mut jacobian = Matrix::zeros(8, 7);
        jacobian.view_mut((0, 0), (3, 3)).fill_with_identity();
        jacobian
            .view_mut((3, 3), (4, 3))
            .copy_from(&quat_plus_jacobian(&x[3..7]));
        jacobian[(7, 6)] = x[7];
        jacobian
    }
}

/// The shared manifold for a variable type. Euclidean types share a manifold
/// per dimension; manifold-valued types get their dedicated update rule.
#[must_use]
pub fn manifold_for(var_type: VariableType) -> Arc<dyn Manifold> {
    match var_type {
        VariableType::PoseSe3 | VariableType::TransformSe3 => Arc::new(PoseSe3Parameterization),
        VariableType::PoseSe3Scale => Arc::new(PoseSim3Parameterization),
        VariableType::Gravity => Arc::new(QuaternionParameterization),
        other => Arc::new(EuclideanManifold(other.dim())),
    }
}
