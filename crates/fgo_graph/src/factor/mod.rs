//! The factor contract and the closed catalog of factor families.
//!
//! Every factor family implements [`Factor`]; the graph owns factors as trait
//! objects and dispatches purely through the trait, which keeps the optimizer
//! and the marginalization engine decoupled from the family catalog.

use std::str::FromStr;

use fgo_linalg::{Float, Matrix, Vector};
use fgo_solver::{CostFunction, HuberLoss, Loss};

use crate::{
    parameterization::manifold_for,
    variable::{NodeId, VariableType},
};

pub mod between;
pub mod camera;
pub mod imu;
pub mod landmark;
pub mod marginal;
pub mod prior;

/// Engine-assigned monotonic factor identifier.
pub type FactorId = i32;

/// The closed catalog of factor types.
///
/// Numeric values are stable; they key the factor-type indices and appear on
/// the wire. The distorted-pinhole variants are constructed under their own
/// names but indexed under [`FactorType::CameraSe3Point3`], and the IMU
/// gravity/scale variants are indexed under [`FactorType::Imu`].
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::EnumIter,
)]
#[repr(i32)]
pub enum FactorType {
    #[strum(serialize = "Two_SE2_F")]
    TwoPoseSe2 = 0,
    #[strum(serialize = "Two_SE3_F")]
    TwoPoseSe3 = 1,
    #[strum(serialize = "SE2_Point2_F")]
    PoseSe2Point2 = 2,
    #[strum(serialize = "SE3_Point3_F")]
    PoseSe3Point3 = 3,
    #[strum(serialize = "IMU_F")]
    Imu = 4,
    #[strum(serialize = "GPS_F")]
    Gps = 5,
    #[strum(serialize = "SE2_Prior_F")]
    PoseSe2Prior = 6,
    #[strum(serialize = "SE3_Prior_F")]
    PoseSe3Prior = 7,
    #[strum(serialize = "IMU_Bias_Prior_F")]
    ImuBiasPrior = 8,
    #[strum(serialize = "Vel3_Prior_F")]
    Vel3Prior = 9,
    #[strum(serialize = "Camera_SE3_Point3_F")]
    CameraSe3Point3 = 10,
    #[strum(serialize = "Two_SIM3_F")]
    TwoPoseSim3 = 11,
    #[strum(serialize = "Marginal_F")]
    Marginal = 12,
    #[strum(serialize = "Distorted_Pinhole_Camera_Projection_With_Variable_Intrinsics_F")]
    DistortedPinholeVariableIntrinsics = 13,
    #[strum(
        serialize = "Distorted_Pinhole_Camera_Projection_With_Aspect_Ratio_And_Variable_Intrinsics_F"
    )]
    DistortedPinholeAspectRatioVariableIntrinsics = 14,
    #[strum(serialize = "Distorted_Pinhole_Camera_Projection_With_Fixed_Intrinsics_F")]
    DistortedPinholeFixedIntrinsics = 15,
    #[strum(
        serialize = "Distorted_Pinhole_Camera_Projection_With_Fixed_Intrinsics_And_Sensor_Transform_F"
    )]
    DistortedPinholeFixedIntrinsicsAndSensorTransform = 16,
}

impl FactorType {
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::from_str(name).ok()
    }

    #[must_use]
    pub fn from_wire(code: i32) -> Option<Self> {
        use strum::IntoEnumIterator;
        Self::iter().find(|t| *t as i32 == code)
    }

    /// Whether this is a between-poses factor whose every node is a pose.
    #[must_use]
    pub const fn is_between_poses(self) -> bool {
        matches!(self, Self::TwoPoseSe2 | Self::TwoPoseSe3 | Self::TwoPoseSim3)
    }
}

/// Linearization of one factor around a state: the (whitened) residual and
/// one Jacobian per connected variable, taken with respect to that variable's
/// local coordinates.
#[derive(Debug, Clone)]
pub struct Linearization {
    pub jacobians: Vec<Matrix>,
    pub residual: Vector,
}

/// The uniform capability set of a factor.
pub trait Factor: Send + Sync {
    /// Connected node ids, in slot order.
    fn variable_ids(&self) -> &[NodeId];

    /// Type of the connected variable `id`.
    fn variable_type(&self, id: NodeId) -> VariableType;

    /// Stored state dimension of the connected variable `id`.
    fn variable_dim(&self, id: NodeId) -> usize {
        self.variable_type(id).dim()
    }

    /// State a newly created variable starts from.
    fn default_state(&self, id: NodeId) -> Vec<Float> {
        self.variable_type(id).default_state()
    }

    /// Build the residual functor bound to this factor's immutable state.
    fn create_cost_function(&self) -> Box<dyn CostFunction>;

    /// A robustifier when the factor's loss parameter is positive.
    fn create_loss_function(&self) -> Option<Box<dyn Loss>> {
        None
    }

    fn measurement_len(&self) -> usize;

    fn information_len(&self) -> usize;

    fn set_measurement(&mut self, measurement: &[Float]);

    fn set_information(&mut self, information: &[Float]);

    fn set_loss_parameter(&mut self, _loss: Float) -> bool {
        false
    }

    fn set_sensor_transform(&mut self, _tform: &[Float]) -> bool {
        false
    }

    fn set_intrinsics(&mut self, _intrinsics: &[Float]) -> bool {
        false
    }

    /// Hook invoked with the current parameter blocks right before the solver
    /// consumes the factor. Factors whose cached terms depend on the current
    /// linearization point (IMU preintegration bias correction) refresh here.
    fn pre_optimization_update(&mut self, _params: &[&[Float]]) {}

    /// Linearize at the given parameter blocks: whitened residual plus one
    /// local-coordinate Jacobian per variable slot. Used by marginalization.
    fn linearize(&self, params: &[&[Float]]) -> Linearization {
        let cost = self.create_cost_function();
        let residual = cost.residual(params);
        let jacobians = self
            .variable_ids()
            .iter()
            .enumerate()
            .map(|(slot, &id)| {
                cost.jacobian(params, slot).unwrap_or_else(|| {
                    numeric_local_jacobian(cost.as_ref(), params, slot, self.variable_type(id))
                })
            })
            .collect();
        Linearization {
            jacobians,
            residual,
        }
    }
}

/// Implements the [`Factor`] methods that delegate straight to an embedded
/// `base: FactorBase` field.
macro_rules! delegate_to_factor_base {
    () => {
        fn variable_ids(&self) -> &[NodeId] {
            self.base.ids()
        }

        fn variable_type(&self, id: NodeId) -> VariableType {
            self.base.type_of(id)
        }

        fn measurement_len(&self) -> usize {
            self.base.measurement_len()
        }

        fn information_len(&self) -> usize {
            self.base.information_len()
        }

        fn set_measurement(&mut self, measurement: &[fgo_linalg::Float]) {
            self.base.set_measurement(measurement);
        }

        fn set_information(&mut self, information: &[fgo_linalg::Float]) {
            self.base.set_information(information);
        }
    };
}
pub(crate) use delegate_to_factor_base;

/// Central-difference Jacobian of `cost` with respect to slot `slot`, taken
/// along the local coordinates of the slot's variable type.
fn numeric_local_jacobian(
    cost: &dyn CostFunction,
    params: &[&[Float]],
    slot: usize,
    var_type: VariableType,
) -> Matrix {
    const STEP: Float = 1e-6;
    let manifold = manifold_for(var_type);
    let local = manifold.local_size();
    let dim = cost.num_residuals();
    let mut jacobian = Matrix::zeros(dim, local);
    let x0 = params[slot].to_vec();
    let mut delta = vec![0.0; local];

    let residual_at = |state: &[Float]| {
        let mut perturbed_params = params.to_vec();
        perturbed_params[slot] = state;
        cost.residual(&perturbed_params)
    };

    for k in 0..local {
        delta[k] = STEP;
        let mut plus = x0.clone();
        manifold.plus(&x0, &delta, &mut plus);
        let r_plus = residual_at(&plus);

        delta[k] = -STEP;
        let mut minus = x0.clone();
        manifold.plus(&x0, &delta, &mut minus);
        let r_minus = residual_at(&minus);

        jacobian
            .column_mut(k)
            .copy_from(&((r_plus - r_minus) / (2.0 * STEP)));
        delta[k] = 0.0;
    }
    jacobian
}

/// Build the Huber robustifier a factor family advertises when its loss
/// parameter is non-negative.
pub(crate) fn loss_from_parameter(loss_parameter: Float) -> Option<Box<dyn Loss>> {
    (loss_parameter >= 0.0).then(|| Box::new(HuberLoss::new(loss_parameter.max(Float::MIN_POSITIVE))) as Box<dyn Loss>)
}

/// Lower-triangular square root `L^T` applied to whiten residuals: for an
/// information matrix `I = L L^T`, residuals are premultiplied by `L^T`.
pub(crate) fn sqrt_information(information: &[Float], n: usize) -> Matrix {
    let info = Matrix::from_row_slice(n, n, information);
    match info.clone().cholesky() {
        Some(chol) => chol.l().transpose(),
        // Non positive definite information: fall back to the symmetric
        // square root through the eigendecomposition, clipping negatives.
        None => {
            let eigen = info.symmetric_eigen();
            let sqrt_vals = eigen.eigenvalues.map(|v| v.max(0.0).sqrt());
            &eigen.eigenvectors * Matrix::from_diagonal(&sqrt_vals) * eigen.eigenvectors.transpose()
        }
    }
}

/// The family registry: construct a Gaussian-noise-model factor from its
/// user-facing type name and connected node ids. Camera and IMU families have
/// richer constructors and are built through their own entry points.
#[must_use]
pub fn make_gaussian_factor(factor_type: FactorType, ids: Vec<NodeId>) -> Option<Box<dyn Factor>> {
    Some(match factor_type {
        FactorType::TwoPoseSe2 => Box::new(between::BetweenPoseSe2Factor::new(ids)),
        FactorType::TwoPoseSe3 => Box::new(between::BetweenPoseSe3Factor::new(ids)),
        FactorType::TwoPoseSim3 => Box::new(between::BetweenPoseSim3Factor::new(ids)),
        FactorType::Gps => Box::new(prior::GpsFactor::new(ids)),
        FactorType::PoseSe2Prior => Box::new(prior::PoseSe2PriorFactor::new(ids)),
        FactorType::PoseSe3Prior => Box::new(prior::PoseSe3PriorFactor::new(ids)),
        FactorType::ImuBiasPrior => Box::new(prior::ImuBiasPriorFactor::new(ids)),
        FactorType::Vel3Prior => Box::new(prior::Vel3PriorFactor::new(ids)),
        FactorType::PoseSe2Point2 => Box::new(landmark::PoseSe2Point2Factor::new(ids)),
        FactorType::PoseSe3Point3 => Box::new(landmark::PoseSe3Point3Factor::new(ids)),
        _ => return None,
    })
}

/// Shared plumbing of the Gaussian-noise-model families: connected ids with
/// their per-slot schema, a measurement vector and a row-major information
/// matrix.
#[derive(Debug, Clone)]
pub(crate) struct FactorBase {
    ids: Vec<NodeId>,
    types: Vec<VariableType>,
    measurement: Vec<Float>,
    information: Vec<Float>,
}

impl FactorBase {
    pub(crate) fn new(
        ids: Vec<NodeId>,
        types: Vec<VariableType>,
        measurement: Vec<Float>,
        information_rows: usize,
    ) -> Self {
        debug_assert_eq!(ids.len(), types.len());
        let mut information = vec![0.0; information_rows * information_rows];
        for i in 0..information_rows {
            information[i * information_rows + i] = 1.0;
        }
        Self {
            ids,
            types,
            measurement,
            information,
        }
    }

    pub(crate) fn ids(&self) -> &[NodeId] {
        &self.ids
    }

    pub(crate) fn type_of(&self, id: NodeId) -> VariableType {
        let slot = self
            .ids
            .iter()
            .position(|&other| other == id)
            .expect("queried id is connected to this factor");
        self.types[slot]
    }

    pub(crate) fn measurement(&self) -> &[Float] {
        &self.measurement
    }

    pub(crate) fn measurement_len(&self) -> usize {
        self.measurement.len()
    }

    pub(crate) fn information_len(&self) -> usize {
        self.information.len()
    }

    pub(crate) fn set_measurement(&mut self, measurement: &[Float]) {
        let len = self.measurement.len();
        self.measurement[..].copy_from_slice(&measurement[..len]);
    }

    pub(crate) fn set_information(&mut self, information: &[Float]) {
        let len = self.information.len();
        self.information[..].copy_from_slice(&information[..len]);
    }

    /// Whitening matrix `L^T` for the stored information.
    pub(crate) fn sqrt_information(&self) -> Matrix {
        let n = (self.information.len() as f64).sqrt() as usize;
        sqrt_information(&self.information, n)
    }
}
