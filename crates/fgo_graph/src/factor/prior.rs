//! Unary prior factors: absolute constraints on a single node from prior
//! knowledge or an absolute sensor (GPS).

use fgo_linalg::{quat_boxminus_approx, quat_from_xyzw, wrap_angle, Float, Matrix, Vector};
use fgo_solver::CostFunction;

use super::{Factor, FactorBase};
use crate::variable::{NodeId, VariableType};

/// Absolute position measurement on an SE(3) pose node.
#[derive(Debug, Clone)]
pub struct GpsFactor {
    base: FactorBase,
}

impl GpsFactor {
    #[must_use]
    pub fn new(ids: Vec<NodeId>) -> Self {
        Self {
            base: FactorBase::new(ids, vec![VariableType::PoseSe3], vec![0.0; 3], 3),
        }
    }
}

impl Factor for GpsFactor {
    super::delegate_to_factor_base!();

    fn create_cost_function(&self) -> Box<dyn CostFunction> {
        Box::new(EuclideanPriorCost {
            start: 0,
            global_size: 7,
            measurement: self.base.measurement().to_vec(),
            sqrt_information: self.base.sqrt_information(),
        })
    }
}

/// Prior on an SE(2) pose.
#[derive(Debug, Clone)]
pub struct PoseSe2PriorFactor {
    base: FactorBase,
}

impl PoseSe2PriorFactor {
    #[must_use]
    pub fn new(ids: Vec<NodeId>) -> Self {
        Self {
            base: FactorBase::new(ids, vec![VariableType::PoseSe2], vec![0.0; 3], 3),
        }
    }
}

impl Factor for PoseSe2PriorFactor {
    super::delegate_to_factor_base!();

    fn create_cost_function(&self) -> Box<dyn CostFunction> {
        Box::new(PoseSe2PriorCost {
            measurement: self.base.measurement().to_vec(),
            sqrt_information: self.base.sqrt_information(),
        })
    }
}

/// Prior on an SE(3) pose.
#[derive(Debug, Clone)]
pub struct PoseSe3PriorFactor {
    base: FactorBase,
}

impl PoseSe3PriorFactor {
    #[must_use]
    pub fn new(ids: Vec<NodeId>) -> Self {
        let mut measurement = vec![0.0; 7];
        measurement[6] = 1.0;
        Self {
            base: FactorBase::new(ids, vec![VariableType::PoseSe3], measurement, 6),
        }
    }
}

impl Factor for PoseSe3PriorFactor {
    super::delegate_to_factor_base!();

    fn create_cost_function(&self) -> Box<dyn CostFunction> {
        Box::new(PoseSe3PriorCost {
            measurement: self.base.measurement().to_vec(),
            sqrt_information: self.base.sqrt_information(),
        })
    }
}

/// Prior on an IMU bias node.
#[derive(Debug, Clone)]
pub struct ImuBiasPriorFactor {
    base: FactorBase,
}

impl ImuBiasPriorFactor {
    #[must_use]
    pub fn new(ids: Vec<NodeId>) -> Self {
        Self {
            base: FactorBase::new(ids, vec![VariableType::ImuBias], vec![0.0; 6], 6),
        }
    }
}

impl Factor for ImuBiasPriorFactor {
    super::delegate_to_factor_base!();

    fn create_cost_function(&self) -> Box<dyn CostFunction> {
        Box::new(EuclideanPriorCost {
            start: 0,
            global_size: 6,
            measurement: self.base.measurement().to_vec(),
            sqrt_information: self.base.sqrt_information(),
        })
    }
}

/// Prior on a velocity node.
#[derive(Debug, Clone)]
pub struct Vel3PriorFactor {
    base: FactorBase,
}

impl Vel3PriorFactor {
    #[must_use]
    pub fn new(ids: Vec<NodeId>) -> Self {
        Self {
            base: FactorBase::new(ids, vec![VariableType::Vel3], vec![0.0; 3], 3),
        }
    }
}

impl Factor for Vel3PriorFactor {
    super::delegate_to_factor_base!();

    fn create_cost_function(&self) -> Box<dyn CostFunction> {
        Box::new(EuclideanPriorCost {
            start: 0,
            global_size: 3,
            measurement: self.base.measurement().to_vec(),
            sqrt_information: self.base.sqrt_information(),
        })
    }
}

/// `r = L^T * (x[start..start+m] - measurement)`: shared by the purely
/// Euclidean priors (GPS position, bias, velocity).
struct EuclideanPriorCost {
    start: usize,
    global_size: usize,
    measurement: Vec<Float>,
    sqrt_information: Matrix,
}

impl CostFunction for EuclideanPriorCost {
    fn num_residuals(&self) -> usize {
        self.measurement.len()
    }

    fn parameter_sizes(&self) -> &[usize] {
        match self.global_size {
            3 => &[3],
            6 => &[6],
            7 => &[7],
            _ => unreachable!("euclidean priors cover sizes 3, 6 and 7"),
        }
    }

    fn residual(&self, params: &[&[Float]]) -> Vector {
        let x = params[0];
        let raw = Vector::from_iterator(
            self.measurement.len(),
            self.measurement
                .iter()
                .enumerate()
                .map(|(i, m)| x[self.start + i] - m),
        );
        &self.sqrt_information * raw
    }
}

struct PoseSe2PriorCost {
    measurement: Vec<Float>,
    sqrt_information: Matrix,
}

impl CostFunction for PoseSe2PriorCost {
    fn num_residuals(&self) -> usize {
        3
    }

    fn parameter_sizes(&self) -> &[usize] {
        &[3]
    }

    fn residual(&self, params: &[&[Float]]) -> Vector {
        let x = params[0];
        let raw = Vector::from_vec(vec![
            x[0] - self.measurement[0],
            x[1] - self.measurement[1],
            wrap_angle(x[2] - self.measurement[2]),
        ]);
        &self.sqrt_information * raw
    }
}

struct PoseSe3PriorCost {
    measurement: Vec<Float>,
    sqrt_information: Matrix,
}

impl CostFunction for PoseSe3PriorCost {
    fn num_residuals(&self) -> usize {
        6
    }

    fn parameter_sizes(&self) -> &[usize] {
        &[7]
    }

    fn residual(&self, params: &[&[Float]]) -> Vector {
        let x = params[0];
        let q = quat_from_xyzw(&x[3..7]);
        let meas_q = quat_from_xyzw(&self.measurement[3..7]);
        let e_r = quat_boxminus_approx(&q, &meas_q);
        let raw = Vector::from_vec(vec![
            x[0] - self.measurement[0],
            x[1] - self.measurement[1],
            x[2] - self.measurement[2],
            e_r[0],
            e_r[1],
            e_r[2],
        ]);
        &self.sqrt_information * raw
    }
}
