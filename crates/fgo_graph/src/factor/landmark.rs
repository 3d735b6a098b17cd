//! Pose-landmark factors: a point observed in a pose's body frame.

use fgo_linalg::{quat_from_xyzw, Float, Matrix, Vector, Vector3};
use fgo_solver::CostFunction;

use super::{Factor, FactorBase};
use crate::variable::{NodeId, VariableType};

/// SE(2) pose observing a 2D point; measurement is the point in the pose's
/// frame.
#[derive(Debug, Clone)]
pub struct PoseSe2Point2Factor {
    base: FactorBase,
}

impl PoseSe2Point2Factor {
    #[must_use]
    pub fn new(ids: Vec<NodeId>) -> Self {
        Self {
            base: FactorBase::new(
                ids,
                vec![VariableType::PoseSe2, VariableType::PointXy],
                vec![0.0; 2],
                2,
            ),
        }
    }
}

impl Factor for PoseSe2Point2Factor {
    super::delegate_to_factor_base!();

    fn create_cost_function(&self) -> Box<dyn CostFunction> {
        Box::new(PoseSe2Point2Cost {
            measurement: [self.base.measurement()[0], self.base.measurement()[1]],
            sqrt_information: self.base.sqrt_information(),
        })
    }
}

struct PoseSe2Point2Cost {
    measurement: [Float; 2],
    sqrt_information: Matrix,
}

impl CostFunction for PoseSe2Point2Cost {
    fn num_residuals(&self) -> usize {
        2
    }

    fn parameter_sizes(&self) -> &[usize] {
        &[3, 2]
    }

    fn residual(&self, params: &[&[Float]]) -> Vector {
        let (pose, point) = (params[0], params[1]);
        let (sin_t, cos_t) = pose[2].sin_cos();
        let dx = point[0] - pose[0];
        let dy = point[1] - pose[1];
        let raw = Vector::from_vec(vec![
            cos_t * dx + sin_t * dy - self.measurement[0],
            -sin_t * dx + cos_t * dy - self.measurement[1],
        ]);
        &self.sqrt_information * raw
    }
}

/// SE(3) pose observing a 3D point; measurement is the point in the pose's
/// frame.
#[derive(Debug, Clone)]
pub struct PoseSe3Point3Factor {
    base: FactorBase,
}

impl PoseSe3Point3Factor {
    #[must_use]
    pub fn new(ids: Vec<NodeId>) -> Self {
        Self {
            base: FactorBase::new(
                ids,
                vec![VariableType::PoseSe3, VariableType::PointXyz],
                vec![0.0; 3],
                3,
            ),
        }
    }
}

impl Factor for PoseSe3Point3Factor {
    super::delegate_to_factor_base!();

    fn create_cost_function(&self) -> Box<dyn CostFunction> {
        Box::new(PoseSe3Point3Cost {
            measurement: [
                self.base.measurement()[0],
                self.base.measurement()[1],
                self.base.measurement()[2],
            ],
            sqrt_information: self.base.sqrt_information(),
        })
    }
}

struct PoseSe3Point3Cost {
    measurement: [Float; 3],
    sqrt_information: Matrix,
}

impl CostFunction for PoseSe3Point3Cost {
    fn num_residuals(&self) -> usize {
        3
    }

    fn parameter_sizes(&self) -> &[usize] {
        &[7, 3]
    }

    fn residual(&self, params: &[&[Float]]) -> Vector {
        let (pose, point) = (params[0], params[1]);
        let q = quat_from_xyzw(&pose[3..7]);
        let t = Vector3::new(pose[0], pose[1], pose[2]);
        let p = Vector3::new(point[0], point[1], point[2]);
        let in_body = q.inverse() * (p - t);
        let raw = Vector::from_vec(vec![
            in_body[0] - self.measurement[0],
            in_body[1] - self.measurement[1],
            in_body[2] - self.measurement[2],
        ]);
        &self.sqrt_information * raw
    }
}
