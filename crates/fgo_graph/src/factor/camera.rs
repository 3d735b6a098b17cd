//! Camera projection factors: a pinhole camera (optionally with
//! radial-tangential distortion) observing a 3D landmark.
//!
//! The sensor transform is the camera pose in the body frame, supplied either
//! as a fixed 4x4 row-major homogeneous matrix or, for the variants that
//! refine extrinsics, as a connected `TRANSFORM_SE3` node.

use fgo_linalg::{quat_from_xyzw, Float, Matrix, Matrix3, Vector, Vector3};
use fgo_solver::{CostFunction, Loss};

use super::{loss_from_parameter, Factor, FactorBase};
use crate::variable::{NodeId, VariableType};

/// Intrinsic vector layout used by the distorted models:
/// `[fx, fy, cx, cy, s, k1, k2, k3, k4, k5, k6, p1, p2]`.
pub const INTRINSIC_LEN: usize = 13;

fn identity_transform() -> Vec<Float> {
    let mut tform = vec![0.0; 16];
    for i in 0..4 {
        tform[i * 4 + i] = 1.0;
    }
    tform
}

fn rotation_of(tform: &[Float]) -> Matrix3 {
    Matrix3::new(
        tform[0], tform[1], tform[2], //
        tform[4], tform[5], tform[6], //
        tform[8], tform[9], tform[10],
    )
}

fn translation_of(tform: &[Float]) -> Vector3 {
    Vector3::new(tform[3], tform[7], tform[11])
}

/// Bring a world point into the camera frame through a body pose and a
/// camera-in-body transform.
fn point_in_camera(pose: &[Float], point: &[Float], r_s: &Matrix3, t_s: &Vector3) -> Vector3 {
    let q = quat_from_xyzw(&pose[3..7]);
    let t = Vector3::new(pose[0], pose[1], pose[2]);
    let p = Vector3::new(point[0], point[1], point[2]);
    let in_body = q.inverse() * (p - t);
    r_s.transpose() * (in_body - t_s)
}

/// Undistorted pinhole projection factor between an SE(3) camera pose and a
/// 3D point.
///
/// Measurement is `[u, v, fx, fy]`; the information matrix is 2x2 stored as
/// `[Ixx, 0, 0, Iyy]`.
#[derive(Debug, Clone)]
pub struct CameraSe3Point3Factor {
    base: FactorBase,
    sensor_transform: Vec<Float>,
    loss_parameter: Float,
}

impl CameraSe3Point3Factor {
    #[must_use]
    pub fn new(ids: Vec<NodeId>) -> Self {
        Self {
            base: FactorBase::new(
                ids,
                vec![VariableType::PoseSe3, VariableType::PointXyz],
                vec![0.0; 4],
                2,
            ),
            sensor_transform: identity_transform(),
            loss_parameter: -1.0,
        }
    }
}

impl Factor for CameraSe3Point3Factor {
    super::delegate_to_factor_base!();

    fn create_cost_function(&self) -> Box<dyn CostFunction> {
        Box::new(PinholeReprojectionCost {
            observed: [self.base.measurement()[0], self.base.measurement()[1]],
            focal: [self.base.measurement()[2], self.base.measurement()[3]],
            sqrt_information: self.base.sqrt_information(),
            rotation: rotation_of(&self.sensor_transform),
            translation: translation_of(&self.sensor_transform),
        })
    }

    fn create_loss_function(&self) -> Option<Box<dyn Loss>> {
        loss_from_parameter(self.loss_parameter)
    }

    fn set_loss_parameter(&mut self, loss: Float) -> bool {
        self.loss_parameter = loss;
        true
    }

    fn set_sensor_transform(&mut self, tform: &[Float]) -> bool {
        if tform.len() != 16 {
            return false;
        }
        self.sensor_transform.copy_from_slice(tform);
        true
    }
}

struct PinholeReprojectionCost {
    observed: [Float; 2],
    focal: [Float; 2],
    sqrt_information: Matrix,
    rotation: Matrix3,
    translation: Vector3,
}

impl CostFunction for PinholeReprojectionCost {
    fn num_residuals(&self) -> usize {
        2
    }

    fn parameter_sizes(&self) -> &[usize] {
        &[7, 3]
    }

    fn residual(&self, params: &[&[Float]]) -> Vector {
        let p = point_in_camera(params[0], params[1], &self.rotation, &self.translation);
        let predicted_u = p[0] / p[2] * self.focal[0];
        let predicted_v = p[1] / p[2] * self.focal[1];
        let raw = Vector::from_vec(vec![
            predicted_u - self.observed[0],
            predicted_v - self.observed[1],
        ]);
        &self.sqrt_information * raw
    }
}

/// Which distorted-pinhole projection family a factor instantiates.
///
/// The variants differ in which quantities are connected nodes versus fixed
/// parameters; all are indexed under the user-facing camera factor type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistortedVariant {
    /// `[pose, fx, r, cx, cy, k1..k6, p1, p2, point, tform]` (15 nodes);
    /// single focal with aspect ratio.
    AspectRatioVariableIntrinsics,
    /// `[pose, fx, fy, cx, cy, s, k1..k6, p1, p2, point, tform]` (16 nodes).
    VariableIntrinsics,
    /// `[pose, point, tform]`; the 13 intrinsics are fixed.
    FixedIntrinsics,
    /// `[pose, point]`; intrinsics and sensor transform are fixed.
    FixedIntrinsicsAndSensorTransform,
}

impl DistortedVariant {
    #[must_use]
    pub const fn num_nodes(self) -> usize {
        match self {
            Self::AspectRatioVariableIntrinsics => 15,
            Self::VariableIntrinsics => 16,
            Self::FixedIntrinsics => 3,
            Self::FixedIntrinsicsAndSensorTransform => 2,
        }
    }

    /// Length of the intrinsic vector held fixed during optimization; zero
    /// when the intrinsics are connected nodes.
    #[must_use]
    pub const fn fixed_intrinsic_len(self) -> usize {
        match self {
            Self::AspectRatioVariableIntrinsics | Self::VariableIntrinsics => 0,
            Self::FixedIntrinsics | Self::FixedIntrinsicsAndSensorTransform => INTRINSIC_LEN,
        }
    }

    fn node_types(self) -> Vec<VariableType> {
        match self {
            Self::AspectRatioVariableIntrinsics => {
                let mut types = vec![VariableType::PoseSe3];
                types.extend(std::iter::repeat(VariableType::CameraIntrinsics).take(12));
                types.push(VariableType::PointXyz);
                types.push(VariableType::TransformSe3);
                types
            }
            Self::VariableIntrinsics => {
                let mut types = vec![VariableType::PoseSe3];
                types.extend(std::iter::repeat(VariableType::CameraIntrinsics).take(13));
                types.push(VariableType::PointXyz);
                types.push(VariableType::TransformSe3);
                types
            }
            Self::FixedIntrinsics => vec![
                VariableType::PoseSe3,
                VariableType::PointXyz,
                VariableType::TransformSe3,
            ],
            Self::FixedIntrinsicsAndSensorTransform => {
                vec![VariableType::PoseSe3, VariableType::PointXyz]
            }
        }
    }

    fn parameter_sizes(self) -> &'static [usize] {
        match self {
            Self::AspectRatioVariableIntrinsics => {
                &[7, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 3, 7]
            }
            Self::VariableIntrinsics => &[7, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 3, 7],
            Self::FixedIntrinsics => &[7, 3, 7],
            Self::FixedIntrinsicsAndSensorTransform => &[7, 3],
        }
    }
}

/// Distorted-pinhole projection factor.
///
/// Measurement is the observed image point `[u, v]`; the information matrix
/// is 2x2 stored as `[Ixx, 0, 0, Iyy]`.
#[derive(Debug, Clone)]
pub struct DistortedCameraProjectionFactor {
    variant: DistortedVariant,
    base: FactorBase,
    intrinsics: Vec<Float>,
    sensor_transform: Vec<Float>,
    loss_parameter: Float,
}

impl DistortedCameraProjectionFactor {
    #[must_use]
    pub fn new(variant: DistortedVariant, ids: Vec<NodeId>) -> Self {
        Self {
            variant,
            base: FactorBase::new(ids, variant.node_types(), vec![0.0; 2], 2),
            intrinsics: vec![0.0; INTRINSIC_LEN],
            sensor_transform: identity_transform(),
            loss_parameter: -1.0,
        }
    }

    #[must_use]
    pub fn variant(&self) -> DistortedVariant {
        self.variant
    }
}

impl Factor for DistortedCameraProjectionFactor {
    super::delegate_to_factor_base!();

    fn create_cost_function(&self) -> Box<dyn CostFunction> {
        Box::new(DistortedReprojectionCost {
            variant: self.variant,
            observed: [self.base.measurement()[0], self.base.measurement()[1]],
            sqrt_information: self.base.sqrt_information(),
            intrinsics: self.intrinsics.clone(),
            rotation: rotation_of(&self.sensor_transform),
            translation: translation_of(&self.sensor_transform),
        })
    }

    fn create_loss_function(&self) -> Option<Box<dyn Loss>> {
        loss_from_parameter(self.loss_parameter)
    }

    fn set_loss_parameter(&mut self, loss: Float) -> bool {
        self.loss_parameter = loss;
        true
    }

    fn set_intrinsics(&mut self, intrinsics: &[Float]) -> bool {
        if intrinsics.len() != INTRINSIC_LEN {
            return false;
        }
        self.intrinsics.copy_from_slice(intrinsics);
        true
    }

    fn set_sensor_transform(&mut self, tform: &[Float]) -> bool {
        if tform.len() != 16 {
            return false;
        }
        self.sensor_transform.copy_from_slice(tform);
        true
    }
}

struct DistortedReprojectionCost {
    variant: DistortedVariant,
    observed: [Float; 2],
    sqrt_information: Matrix,
    intrinsics: Vec<Float>,
    rotation: Matrix3,
    translation: Vector3,
}

/// Apply the 8-parameter radial-tangential distortion to normalized image
/// coordinates, then the affine intrinsics.
#[allow(clippy::too_many_arguments)]
fn distort_and_project(
    u: Float,
    v: Float,
    fx: Float,
    fy: Float,
    cx: Float,
    cy: Float,
    skew: Float,
    k: &[Float; 6],
    p: &[Float; 2],
) -> (Float, Float) {
    let u2 = u * u;
    let uv = u * v;
    let v2 = v * v;
    let r2 = u2 + v2;
    let r4 = r2 * r2;
    let r6 = r4 * r2;
    let radial = (1.0 + k[0] * r2 + k[1] * r4 + k[2] * r6)
        / (1.0 + k[3] * r2 + k[4] * r4 + k[5] * r6);
    let du = u * radial + 2.0 * p[0] * uv + p[1] * (r2 + 2.0 * u2);
    let dv = v * radial + 2.0 * p[1] * uv + p[0] * (r2 + 2.0 * v2);
    (fx * du + skew * dv + cx, fy * dv + cy)
}

impl CostFunction for DistortedReprojectionCost {
    fn num_residuals(&self) -> usize {
        2
    }

    fn parameter_sizes(&self) -> &[usize] {
        self.variant.parameter_sizes()
    }

    fn residual(&self, params: &[&[Float]]) -> Vector {
        let pose = params[0];
        let (point, rotation, translation, intr): (&[Float], Matrix3, Vector3, Vec<Float>) =
            match self.variant {
                DistortedVariant::AspectRatioVariableIntrinsics => {
                    let tform = params[14];
                    let q = quat_from_xyzw(&tform[3..7]);
                    // [fx, r, cx, cy, k1..k6, p1, p2] nodes: expand the aspect
                    // ratio into fy and zero skew.
                    let fx = params[1][0];
                    let intr = vec![
                        fx,
                        fx * params[2][0],
                        params[3][0],
                        params[4][0],
                        0.0,
                        params[5][0],
                        params[6][0],
                        params[7][0],
                        params[8][0],
                        params[9][0],
                        params[10][0],
                        params[11][0],
                        params[12][0],
                    ];
                    (
                        params[13],
                        q.to_rotation_matrix().into_inner(),
                        Vector3::new(tform[0], tform[1], tform[2]),
                        intr,
                    )
                }
                DistortedVariant::VariableIntrinsics => {
                    let tform = params[15];
                    let q = quat_from_xyzw(&tform[3..7]);
                    let intr = (1..=13).map(|i| params[i][0]).collect();
                    (
                        params[14],
                        q.to_rotation_matrix().into_inner(),
                        Vector3::new(tform[0], tform[1], tform[2]),
                        intr,
                    )
                }
                DistortedVariant::FixedIntrinsics => {
                    let tform = params[2];
                    let q = quat_from_xyzw(&tform[3..7]);
                    (
                        params[1],
                        q.to_rotation_matrix().into_inner(),
                        Vector3::new(tform[0], tform[1], tform[2]),
                        self.intrinsics.clone(),
                    )
                }
                DistortedVariant::FixedIntrinsicsAndSensorTransform => (
                    params[1],
                    self.rotation,
                    self.translation,
                    self.intrinsics.clone(),
                ),
            };

        let p = point_in_camera(pose, point, &rotation, &translation);
        let (u, v) = (p[0] / p[2], p[1] / p[2]);
        let (pred_u, pred_v) = distort_and_project(
            u,
            v,
            intr[0],
            intr[1],
            intr[2],
            intr[3],
            intr[4],
            &[intr[5], intr[6], intr[7], intr[8], intr[9], intr[10]],
            &[intr[11], intr[12]],
        );
        let raw = Vector::from_vec(vec![pred_u - self.observed[0], pred_v - self.observed[1]]);
        &self.sqrt_information * raw
    }
}
