//! Between-pose factors: relative-pose constraints on SE(2), SE(3) and
//! SIM(3) pose pairs.

use fgo_linalg::{
    quat_boxminus_approx, quat_from_xyzw, wrap_angle, Float, Matrix, Vector, Vector3,
};
use fgo_solver::CostFunction;

use super::{Factor, FactorBase};
use crate::variable::{NodeId, VariableType};

/// Relative-pose constraint between two SE(2) poses.
///
/// Measurement `[dx, dy, dtheta]` is the pose of the second node in the first
/// node's frame; the information matrix is 3x3.
#[derive(Debug, Clone)]
pub struct BetweenPoseSe2Factor {
    base: FactorBase,
}

impl BetweenPoseSe2Factor {
    #[must_use]
    pub fn new(ids: Vec<NodeId>) -> Self {
        Self {
            base: FactorBase::new(
                ids,
                vec![VariableType::PoseSe2, VariableType::PoseSe2],
                vec![0.0; 3],
                3,
            ),
        }
    }
}

impl Factor for BetweenPoseSe2Factor {
    super::delegate_to_factor_base!();

    fn create_cost_function(&self) -> Box<dyn CostFunction> {
        Box::new(BetweenPoseSe2Cost {
            measurement: [
                self.base.measurement()[0],
                self.base.measurement()[1],
                self.base.measurement()[2],
            ],
            sqrt_information: self.base.sqrt_information(),
        })
    }
}

struct BetweenPoseSe2Cost {
    measurement: [Float; 3],
    sqrt_information: Matrix,
}

impl CostFunction for BetweenPoseSe2Cost {
    fn num_residuals(&self) -> usize {
        3
    }

    fn parameter_sizes(&self) -> &[usize] {
        &[3, 3]
    }

    fn residual(&self, params: &[&[Float]]) -> Vector {
        let (a, b) = (params[0], params[1]);
        let (sin_a, cos_a) = a[2].sin_cos();
        let dx = b[0] - a[0];
        let dy = b[1] - a[1];
        // Relative pose of b in a's frame.
        let pred_x = cos_a * dx + sin_a * dy;
        let pred_y = -sin_a * dx + cos_a * dy;
        let pred_theta = b[2] - a[2];
        let raw = Vector::from_vec(vec![
            pred_x - self.measurement[0],
            pred_y - self.measurement[1],
            wrap_angle(pred_theta - self.measurement[2]),
        ]);
        &self.sqrt_information * raw
    }
}

/// Relative-pose constraint between two SE(3) poses.
///
/// Measurement `[x, y, z, qx, qy, qz, qw]` is the pose of the second node in
/// the first node's frame; the information matrix is 6x6 ordered
/// `[translation, rotation]`.
#[derive(Debug, Clone)]
pub struct BetweenPoseSe3Factor {
    base: FactorBase,
}

impl BetweenPoseSe3Factor {
    #[must_use]
    pub fn new(ids: Vec<NodeId>) -> Self {
        let mut measurement = vec![0.0; 7];
        measurement[6] = 1.0;
        Self {
            base: FactorBase::new(
                ids,
                vec![VariableType::PoseSe3, VariableType::PoseSe3],
                measurement,
                6,
            ),
        }
    }
}

impl Factor for BetweenPoseSe3Factor {
    super::delegate_to_factor_base!();

    fn create_cost_function(&self) -> Box<dyn CostFunction> {
        Box::new(BetweenPoseSe3Cost {
            measurement: self.base.measurement().to_vec(),
            sqrt_information: self.base.sqrt_information(),
        })
    }
}

struct BetweenPoseSe3Cost {
    measurement: Vec<Float>,
    sqrt_information: Matrix,
}

impl CostFunction for BetweenPoseSe3Cost {
    fn num_residuals(&self) -> usize {
        6
    }

    fn parameter_sizes(&self) -> &[usize] {
        &[7, 7]
    }

    fn residual(&self, params: &[&[Float]]) -> Vector {
        let (a, b) = (params[0], params[1]);
        let q_a = quat_from_xyzw(&a[3..7]);
        let q_b = quat_from_xyzw(&b[3..7]);
        let t_a = Vector3::new(a[0], a[1], a[2]);
        let t_b = Vector3::new(b[0], b[1], b[2]);

        let pred_t = q_a.inverse() * (t_b - t_a);
        let pred_q = q_a.inverse() * q_b;

        let meas_t = Vector3::new(self.measurement[0], self.measurement[1], self.measurement[2]);
        let meas_q = quat_from_xyzw(&self.measurement[3..7]);

        let e_t = pred_t - meas_t;
        let e_r = quat_boxminus_approx(&pred_q, &meas_q);
        let raw = Vector::from_vec(vec![e_t[0], e_t[1], e_t[2], e_r[0], e_r[1], e_r[2]]);
        &self.sqrt_information * raw
    }
}

/// Relative-similarity constraint between two SIM(3) poses.
///
/// Measurement `[x, y, z, qx, qy, qz, qw, s]` is the similarity of the second
/// node in the first node's frame; the information matrix is 7x7 ordered
/// `[translation, rotation, log-scale]`.
#[derive(Debug, Clone)]
pub struct BetweenPoseSim3Factor {
    base: FactorBase,
}

impl BetweenPoseSim3Factor {
    #[must_use]
    pub fn new(ids: Vec<NodeId>) -> Self {
        let mut measurement = vec![0.0; 8];
        measurement[6] = 1.0;
        measurement[7] = 1.0;
        Self {
            base: FactorBase::new(
                ids,
                vec![VariableType::PoseSe3Scale, VariableType::PoseSe3Scale],
                measurement,
                7,
            ),
        }
    }
}

impl Factor for BetweenPoseSim3Factor {
    super::delegate_to_factor_base!();

    fn create_cost_function(&self) -> Box<dyn CostFunction> {
        Box::new(BetweenPoseSim3Cost {
            measurement: self.base.measurement().to_vec(),
            sqrt_information: self.base.sqrt_information(),
        })
    }
}

struct BetweenPoseSim3Cost {
    measurement: Vec<Float>,
    sqrt_information: Matrix,
}

impl CostFunction for BetweenPoseSim3Cost {
    fn num_residuals(&self) -> usize {
        7
    }

    fn parameter_sizes(&self) -> &[usize] {
        &[8, 8]
    }

    fn residual(&self, params: &[&[Float]]) -> Vector {
        let (a, b) = (params[0], params[1]);
        let q_a = quat_from_xyzw(&a[3..7]);
        let q_b = quat_from_xyzw(&b[3..7]);
        let t_a = Vector3::new(a[0], a[1], a[2]);
        let t_b = Vector3::new(b[0], b[1], b[2]);
        let (s_a, s_b) = (a[7], b[7]);

        // Sim(3) composition: inv(Sa) * Sb.
        let pred_t = (q_a.inverse() * (t_b - t_a)) / s_a;
        let pred_q = q_a.inverse() * q_b;
        let pred_s = s_b / s_a;

        let meas_t = Vector3::new(self.measurement[0], self.measurement[1], self.measurement[2]);
        let meas_q = quat_from_xyzw(&self.measurement[3..7]);
        let meas_s = self.measurement[7];

        let e_t = pred_t - meas_t;
        let e_r = quat_boxminus_approx(&pred_q, &meas_q);
        let e_s = (pred_s / meas_s).ln();
        let raw = Vector::from_vec(vec![e_t[0], e_t[1], e_t[2], e_r[0], e_r[1], e_r[2], e_s]);
        &self.sqrt_information * raw
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn se2_residual_zero_at_consistent_states() {
        let mut factor = BetweenPoseSe2Factor::new(vec![1, 2]);
        factor.set_measurement(&[1.0, 0.0, std::f64::consts::FRAC_PI_2]);
        let cost = factor.create_cost_function();
        let a = [0.0, 0.0, 0.0];
        let b = [1.0, 0.0, std::f64::consts::FRAC_PI_2];
        let r = cost.residual(&[&a, &b]);
        assert_relative_eq!(r.norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn se2_residual_wraps_angle() {
        let mut factor = BetweenPoseSe2Factor::new(vec![1, 2]);
        factor.set_measurement(&[0.0, 0.0, 0.0]);
        let cost = factor.create_cost_function();
        let a = [0.0, 0.0, std::f64::consts::PI - 0.1];
        let b = [0.0, 0.0, -std::f64::consts::PI + 0.1];
        let r = cost.residual(&[&a, &b]);
        // The short way around is 0.2 rad, not 2*pi - 0.2.
        assert_relative_eq!(r[2].abs(), 0.2, epsilon = 1e-12);
    }

    #[test]
    fn se3_residual_zero_at_consistent_states() {
        let mut factor = BetweenPoseSe3Factor::new(vec![1, 2]);
        // b is one meter ahead of a along x, no rotation.
        factor.set_measurement(&[1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0]);
        let cost = factor.create_cost_function();
        let a = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0];
        let b = [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0];
        let r = cost.residual(&[&a, &b]);
        assert_relative_eq!(r.norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn se3_residual_sees_rotation_error() {
        let mut factor = BetweenPoseSe3Factor::new(vec![1, 2]);
        factor.set_measurement(&[0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0]);
        let cost = factor.create_cost_function();
        let a = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0];
        let q = fgo_linalg::so3_exp(&Vector3::new(0.1, 0.0, 0.0));
        let b = [0.0, 0.0, 0.0, q.i, q.j, q.k, q.w];
        let r = cost.residual(&[&a, &b]);
        assert_relative_eq!(r[3], 0.1, epsilon = 1e-3);
        assert_relative_eq!(r.rows(0, 3).norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn sim3_residual_zero_at_consistent_states() {
        let mut factor = BetweenPoseSim3Factor::new(vec![1, 2]);
        factor.set_measurement(&[0.5, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 2.0]);
        let cost = factor.create_cost_function();
        let a = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0];
        let b = [0.5, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 2.0];
        let r = cost.residual(&[&a, &b]);
        assert_relative_eq!(r.norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn sim3_scale_error_is_logarithmic() {
        let mut factor = BetweenPoseSim3Factor::new(vec![1, 2]);
        factor.set_measurement(&[0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0]);
        let cost = factor.create_cost_function();
        let a = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0];
        let b = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, std::f64::consts::E];
        let r = cost.residual(&[&a, &b]);
        assert_relative_eq!(r[6], 1.0, epsilon = 1e-12);
    }
}
