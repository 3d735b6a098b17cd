//! IMU preintegration factors.
//!
//! A batch of gyroscope/accelerometer samples between two keyframes is
//! aggregated into a single between-poses constraint following the
//! on-manifold preintegration scheme, with first-order bias-correction
//! Jacobians. Three variants exist: the basic factor, one that additionally
//! estimates a gravity rotation and a pose scale, and one that also refines
//! the IMU-to-body sensor transform. All are indexed under the IMU factor
//! type.
//!
//! The IMU bias node layout is `[gyro_bias, accel_bias]`.

use fgo_linalg::{
    quat_boxminus_approx, quat_from_xyzw, quat_to_xyzw, skew, so3_exp, Float, Matrix, Matrix3,
    Vector, Vector3,
};
use fgo_solver::CostFunction;
use nalgebra::UnitQuaternion;

use super::Factor;
use crate::variable::{NodeId, VariableType};

/// Residual dimension: `[dp, dtheta, dv, dbg, dba]`.
const RESIDUAL_DIM: usize = 15;

/// Bias change (norm) above which the cached preintegration is repropagated
/// instead of relying on the first-order correction.
const REPROPAGATION_THRESHOLD: Float = 1e-2;

/// Which IMU factor family a factor instantiates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImuVariant {
    /// `[pose_i, vel_i, bias_i, pose_j, vel_j, bias_j]`.
    Basic,
    /// Appends `[gravity, scale]` nodes for visual-inertial alignment.
    GravityScale,
    /// Appends `[gravity, scale, transform]` nodes.
    GravityScaleTransform,
}

impl ImuVariant {
    #[must_use]
    pub const fn num_nodes(self) -> usize {
        match self {
            Self::Basic => 6,
            Self::GravityScale => 8,
            Self::GravityScaleTransform => 9,
        }
    }

    fn node_types(self) -> Vec<VariableType> {
        let mut types = vec![
            VariableType::PoseSe3,
            VariableType::Vel3,
            VariableType::ImuBias,
            VariableType::PoseSe3,
            VariableType::Vel3,
            VariableType::ImuBias,
        ];
        match self {
            Self::Basic => {}
            Self::GravityScale => {
                types.push(VariableType::Gravity);
                types.push(VariableType::Scale);
            }
            Self::GravityScaleTransform => {
                types.push(VariableType::Gravity);
                types.push(VariableType::Scale);
                types.push(VariableType::TransformSe3);
            }
        }
        types
    }

    fn parameter_sizes(self) -> &'static [usize] {
        match self {
            Self::Basic => &[7, 3, 6, 7, 3, 6],
            Self::GravityScale => &[7, 3, 6, 7, 3, 6, 4, 1],
            Self::GravityScaleTransform => &[7, 3, 6, 7, 3, 6, 4, 1, 7],
        }
    }
}

/// IMU noise parameters and sample rate.
///
/// The four covariance matrices arrive row-major 3x3, matching the flat-array
/// entry points. `gravity` is the gravity acceleration in the pose reference
/// frame, e.g. `[0, 0, -9.81]` for ENU.
#[derive(Debug, Clone)]
pub struct ImuParameters {
    pub sample_rate: Float,
    pub gravity: Vector3,
    pub gyro_bias_noise: Matrix3,
    pub accel_bias_noise: Matrix3,
    pub gyro_noise: Matrix3,
    pub accel_noise: Matrix3,
}

impl ImuParameters {
    #[must_use]
    pub fn from_flat(
        sample_rate: Float,
        gravity: &[Float],
        gyro_bias_noise: &[Float],
        accel_bias_noise: &[Float],
        gyro_noise: &[Float],
        accel_noise: &[Float],
    ) -> Self {
        Self {
            sample_rate,
            gravity: Vector3::new(gravity[0], gravity[1], gravity[2]),
            gyro_bias_noise: Matrix3::from_row_slice(gyro_bias_noise),
            accel_bias_noise: Matrix3::from_row_slice(accel_bias_noise),
            gyro_noise: Matrix3::from_row_slice(gyro_noise),
            accel_noise: Matrix3::from_row_slice(accel_noise),
        }
    }
}

/// Accumulated preintegrated deltas with their bias-correction Jacobians and
/// propagated covariance.
#[derive(Debug, Clone)]
pub(crate) struct Preintegration {
    delta_p: Vector3,
    delta_v: Vector3,
    delta_q: UnitQuaternion<Float>,
    sum_dt: Float,
    nominal_gyro_bias: Vector3,
    nominal_accel_bias: Vector3,
    dp_dbg: Matrix3,
    dp_dba: Matrix3,
    dv_dbg: Matrix3,
    dv_dba: Matrix3,
    dq_dbg: Matrix3,
    covariance: Matrix,
}

impl Preintegration {
    fn new() -> Self {
        Self {
            delta_p: Vector3::zeros(),
            delta_v: Vector3::zeros(),
            delta_q: UnitQuaternion::identity(),
            sum_dt: 0.0,
            nominal_gyro_bias: Vector3::zeros(),
            nominal_accel_bias: Vector3::zeros(),
            dp_dbg: Matrix3::zeros(),
            dp_dba: Matrix3::zeros(),
            dv_dbg: Matrix3::zeros(),
            dv_dba: Matrix3::zeros(),
            dq_dbg: Matrix3::zeros(),
            covariance: Matrix::zeros(RESIDUAL_DIM, RESIDUAL_DIM),
        }
    }

    /// Integrate the full reading set at the given nominal bias.
    fn propagate(
        params: &ImuParameters,
        gyro: &[Vector3],
        accel: &[Vector3],
        gyro_bias: Vector3,
        accel_bias: Vector3,
    ) -> Self {
        let mut preint = Self::new();
        preint.nominal_gyro_bias = gyro_bias;
        preint.nominal_accel_bias = accel_bias;
        let dt = 1.0 / params.sample_rate;
        let dt2 = dt * dt;

        for (w_raw, a_raw) in gyro.iter().zip(accel) {
            let w = w_raw - gyro_bias;
            let a = a_raw - accel_bias;
            let rot = preint.delta_q.to_rotation_matrix().into_inner();
            let a_skew = skew(&a);

            // Covariance and bias Jacobians use the pre-update orientation.
            let mut f = Matrix::identity(RESIDUAL_DIM, RESIDUAL_DIM);
            f.view_mut((0, 3), (3, 3)).copy_from(&(-0.5 * rot * a_skew * dt2));
            f.view_mut((0, 6), (3, 3)).copy_from(&(Matrix3::identity() * dt));
            f.view_mut((0, 12), (3, 3)).copy_from(&(-0.5 * rot * dt2));
            f.view_mut((3, 3), (3, 3))
                .copy_from(&(Matrix3::identity() - skew(&(w * dt))));
            f.view_mut((3, 9), (3, 3)).copy_from(&(-Matrix3::identity() * dt));
            f.view_mut((6, 3), (3, 3)).copy_from(&(-rot * a_skew * dt));
            f.view_mut((6, 12), (3, 3)).copy_from(&(-rot * dt));

            let mut g = Matrix::zeros(RESIDUAL_DIM, 12);
            g.view_mut((0, 3), (3, 3)).copy_from(&(0.5 * rot * dt));
            g.view_mut((3, 0), (3, 3)).copy_from(&Matrix3::identity());
            g.view_mut((6, 3), (3, 3)).copy_from(&rot);
            g.view_mut((9, 6), (3, 3)).copy_from(&Matrix3::identity());
            g.view_mut((12, 9), (3, 3)).copy_from(&Matrix3::identity());

            let mut q = Matrix::zeros(12, 12);
            q.view_mut((0, 0), (3, 3)).copy_from(&(params.gyro_noise * dt));
            q.view_mut((3, 3), (3, 3)).copy_from(&(params.accel_noise * dt));
            q.view_mut((6, 6), (3, 3))
                .copy_from(&(params.gyro_bias_noise * dt));
            q.view_mut((9, 9), (3, 3))
                .copy_from(&(params.accel_bias_noise * dt));

            preint.covariance = &f * &preint.covariance * f.transpose() + &g * q * g.transpose();

            // Bias Jacobians; position uses the pre-update velocity terms.
            preint.dp_dbg += preint.dv_dbg * dt - 0.5 * rot * a_skew * preint.dq_dbg * dt2;
            preint.dp_dba += preint.dv_dba * dt - 0.5 * rot * dt2;
            preint.dv_dbg += -rot * a_skew * preint.dq_dbg * dt;
            preint.dv_dba += -rot * dt;
            preint.dq_dbg = so3_exp(&(-w * dt)).to_rotation_matrix().into_inner()
                * preint.dq_dbg
                - Matrix3::identity() * dt;

            // State deltas.
            preint.delta_p += preint.delta_v * dt + 0.5 * rot * a * dt2;
            preint.delta_v += rot * a * dt;
            preint.delta_q *= so3_exp(&(w * dt));
            preint.sum_dt += dt;
        }
        preint
    }

    /// First-order corrected deltas at the given bias.
    fn corrected(
        &self,
        gyro_bias: &Vector3,
        accel_bias: &Vector3,
    ) -> (Vector3, Vector3, UnitQuaternion<Float>) {
        let dbg = gyro_bias - self.nominal_gyro_bias;
        let dba = accel_bias - self.nominal_accel_bias;
        let dp = self.delta_p + self.dp_dbg * dbg + self.dp_dba * dba;
        let dv = self.delta_v + self.dv_dbg * dbg + self.dv_dba * dba;
        let dq = self.delta_q * so3_exp(&(self.dq_dbg * dbg));
        (dp, dv, dq)
    }

    /// `L^T` of the information `P^-1`, with an eigenvalue fallback for the
    /// zero-reading case.
    fn sqrt_information(&self) -> Matrix {
        let info = self
            .covariance
            .clone()
            .try_inverse()
            .unwrap_or_else(|| Matrix::identity(RESIDUAL_DIM, RESIDUAL_DIM));
        match info.clone().cholesky() {
            Some(chol) => chol.l().transpose(),
            None => {
                let eigen = info.symmetric_eigen();
                let sqrt_vals = eigen.eigenvalues.map(|v| v.max(0.0).sqrt());
                &eigen.eigenvectors
                    * Matrix::from_diagonal(&sqrt_vals)
                    * eigen.eigenvectors.transpose()
            }
        }
    }
}

/// IMU preintegration factor.
#[derive(Debug, Clone)]
pub struct ImuFactor {
    variant: ImuVariant,
    ids: Vec<NodeId>,
    types: Vec<VariableType>,
    params: ImuParameters,
    gyro_readings: Vec<Vector3>,
    accel_readings: Vec<Vector3>,
    sensor_transform: Vec<Float>,
    preint: Preintegration,
}

impl ImuFactor {
    /// Build the factor and preintegrate the readings at zero bias.
    ///
    /// `gyro_readings`/`accel_readings` are flat `[x, y, z]` triples;
    /// `sensor_transform` is a 4x4 row-major matrix (IMU in the body frame).
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        variant: ImuVariant,
        ids: Vec<NodeId>,
        params: ImuParameters,
        gyro_readings: &[Float],
        accel_readings: &[Float],
        sensor_transform: &[Float],
    ) -> Self {
        let gyro: Vec<Vector3> = gyro_readings
            .chunks_exact(3)
            .map(|c| Vector3::new(c[0], c[1], c[2]))
            .collect();
        let accel: Vec<Vector3> = accel_readings
            .chunks_exact(3)
            .map(|c| Vector3::new(c[0], c[1], c[2]))
            .collect();
        let preint =
            Preintegration::propagate(&params, &gyro, &accel, Vector3::zeros(), Vector3::zeros());
        Self {
            variant,
            ids,
            types: variant.node_types(),
            params,
            gyro_readings: gyro,
            accel_readings: accel,
            sensor_transform: sensor_transform.to_vec(),
            preint,
        }
    }

    #[must_use]
    pub fn variant(&self) -> ImuVariant {
        self.variant
    }

    /// Predict the pose and velocity at the end of the preintegration window
    /// from the state at its start.
    #[must_use]
    pub fn predict(
        &self,
        prev_pose: &[Float],
        prev_vel: &[Float],
        prev_bias: &[Float],
    ) -> (Vec<Float>, Vec<Float>) {
        let (dp, dv, dq) = self.preint.corrected(
            &Vector3::new(prev_bias[0], prev_bias[1], prev_bias[2]),
            &Vector3::new(prev_bias[3], prev_bias[4], prev_bias[5]),
        );
        let q_i = quat_from_xyzw(&prev_pose[3..7]);
        let p_i = Vector3::new(prev_pose[0], prev_pose[1], prev_pose[2]);
        let v_i = Vector3::new(prev_vel[0], prev_vel[1], prev_vel[2]);
        let dt = self.preint.sum_dt;
        let g = self.params.gravity;

        let p_j = p_i + v_i * dt + 0.5 * g * dt * dt + q_i * dp;
        let v_j = v_i + g * dt + q_i * dv;
        let q_j = q_i * dq;

        let mut pose = vec![p_j[0], p_j[1], p_j[2], 0.0, 0.0, 0.0, 1.0];
        quat_to_xyzw(&q_j, &mut pose[3..7]);
        (pose, vec![v_j[0], v_j[1], v_j[2]])
    }

    /// As [`Self::predict`] for visually aligned states: `gravity_rotation`
    /// (`[qx, qy, qz, qw]`) rotates the nominal gravity into the pose
    /// reference frame, `scale` maps pose positions to metric units, and
    /// `sensor_transform` (`[x, y, z, qx, qy, qz, qw]`) is the IMU pose in
    /// the body frame.
    #[must_use]
    pub fn predict_with_alignment(
        &self,
        prev_pose: &[Float],
        prev_vel: &[Float],
        prev_bias: &[Float],
        gravity_rotation: &[Float],
        scale: Float,
        sensor_transform: &[Float],
    ) -> (Vec<Float>, Vec<Float>) {
        let (dp, dv, dq) = self.preint.corrected(
            &Vector3::new(prev_bias[0], prev_bias[1], prev_bias[2]),
            &Vector3::new(prev_bias[3], prev_bias[4], prev_bias[5]),
        );
        let q_s = quat_from_xyzw(&sensor_transform[3..7]);
        let t_s = Vector3::new(sensor_transform[0], sensor_transform[1], sensor_transform[2]);
        let g = quat_from_xyzw(gravity_rotation) * self.params.gravity;

        let q_body_i = quat_from_xyzw(&prev_pose[3..7]);
        let q_i = q_body_i * q_s;
        let p_i = scale * Vector3::new(prev_pose[0], prev_pose[1], prev_pose[2]) + q_body_i * t_s;
        let v_i = Vector3::new(prev_vel[0], prev_vel[1], prev_vel[2]);
        let dt = self.preint.sum_dt;

        // Propagate in the IMU frame, then map back to a body pose.
        let p_imu_j = p_i + v_i * dt + 0.5 * g * dt * dt + q_i * dp;
        let v_j = v_i + g * dt + q_i * dv;
        let q_imu_j = q_i * dq;
        let q_body_j = q_imu_j * q_s.inverse();
        let p_j = (p_imu_j - q_body_j * t_s) / scale;

        let mut pose = vec![p_j[0], p_j[1], p_j[2], 0.0, 0.0, 0.0, 1.0];
        quat_to_xyzw(&q_body_j, &mut pose[3..7]);
        (pose, vec![v_j[0], v_j[1], v_j[2]])
    }
}

impl Factor for ImuFactor {
    fn variable_ids(&self) -> &[NodeId] {
        &self.ids
    }

    fn variable_type(&self, id: NodeId) -> VariableType {
        let slot = self
            .ids
            .iter()
            .position(|&other| other == id)
            .expect("queried id is connected to this factor");
        self.types[slot]
    }

    fn create_cost_function(&self) -> Box<dyn CostFunction> {
        Box::new(ImuCost {
            variant: self.variant,
            preint: self.preint.clone(),
            gravity: self.params.gravity,
            sqrt_information: self.preint.sqrt_information(),
        })
    }

    fn measurement_len(&self) -> usize {
        0
    }

    fn information_len(&self) -> usize {
        0
    }

    fn set_measurement(&mut self, _measurement: &[Float]) {}

    fn set_information(&mut self, _information: &[Float]) {}

    fn set_sensor_transform(&mut self, tform: &[Float]) -> bool {
        if tform.len() != 16 {
            return false;
        }
        self.sensor_transform.copy_from_slice(tform);
        true
    }

    /// Repropagate the cached deltas when the linearized bias has drifted far
    /// enough from the nominal bias that the first-order correction is no
    /// longer trustworthy.
    fn pre_optimization_update(&mut self, params: &[&[Float]]) {
        let bias = params[2];
        let gyro_bias = Vector3::new(bias[0], bias[1], bias[2]);
        let accel_bias = Vector3::new(bias[3], bias[4], bias[5]);
        let drift = (gyro_bias - self.preint.nominal_gyro_bias).norm()
            + (accel_bias - self.preint.nominal_accel_bias).norm();
        if drift > REPROPAGATION_THRESHOLD {
            self.preint = Preintegration::propagate(
                &self.params,
                &self.gyro_readings,
                &self.accel_readings,
                gyro_bias,
                accel_bias,
            );
        }
    }
}

struct ImuCost {
    variant: ImuVariant,
    preint: Preintegration,
    gravity: Vector3,
    sqrt_information: Matrix,
}

impl CostFunction for ImuCost {
    fn num_residuals(&self) -> usize {
        RESIDUAL_DIM
    }

    fn parameter_sizes(&self) -> &[usize] {
        self.variant.parameter_sizes()
    }

    fn residual(&self, params: &[&[Float]]) -> Vector {
        let (pose_i, vel_i, bias_i) = (params[0], params[1], params[2]);
        let (pose_j, vel_j, bias_j) = (params[3], params[4], params[5]);

        // Gravity rotation, scale and sensor transform default to identity
        // for the basic variant.
        let (gravity_rot, scale) = match self.variant {
            ImuVariant::Basic => (UnitQuaternion::identity(), 1.0),
            _ => (quat_from_xyzw(params[6]), params[7][0]),
        };
        let (t_s, q_s) = match self.variant {
            ImuVariant::GravityScaleTransform => {
                let tform = params[8];
                (
                    Vector3::new(tform[0], tform[1], tform[2]),
                    quat_from_xyzw(&tform[3..7]),
                )
            }
            _ => (Vector3::zeros(), UnitQuaternion::identity()),
        };

        let gyro_bias_i = Vector3::new(bias_i[0], bias_i[1], bias_i[2]);
        let accel_bias_i = Vector3::new(bias_i[3], bias_i[4], bias_i[5]);
        let (dp, dv, dq) = self.preint.corrected(&gyro_bias_i, &accel_bias_i);
        let dt = self.preint.sum_dt;
        let g = gravity_rot * self.gravity;

        // Map body poses to the IMU frame: scale positions, append the
        // sensor transform.
        let q_body_i = quat_from_xyzw(&pose_i[3..7]);
        let q_body_j = quat_from_xyzw(&pose_j[3..7]);
        let q_i = q_body_i * q_s;
        let q_j = q_body_j * q_s;
        let p_i = scale * Vector3::new(pose_i[0], pose_i[1], pose_i[2]) + q_body_i * t_s;
        let p_j = scale * Vector3::new(pose_j[0], pose_j[1], pose_j[2]) + q_body_j * t_s;
        let v_i = Vector3::new(vel_i[0], vel_i[1], vel_i[2]);
        let v_j = Vector3::new(vel_j[0], vel_j[1], vel_j[2]);

        let r_p = q_i.inverse() * (p_j - p_i - v_i * dt - 0.5 * g * dt * dt) - dp;
        let r_theta = quat_boxminus_approx(&(q_i.inverse() * q_j), &dq);
        let r_v = q_i.inverse() * (v_j - v_i - g * dt) - dv;

        let mut raw = Vector::zeros(RESIDUAL_DIM);
        raw.rows_mut(0, 3).copy_from(&r_p);
        raw.rows_mut(3, 3).copy_from(&r_theta);
        raw.rows_mut(6, 3).copy_from(&r_v);
        for k in 0..6 {
            raw[9 + k] = bias_j[k] - bias_i[k];
        }
        &self.sqrt_information * raw
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    const GRAVITY: [Float; 3] = [0.0, 0.0, -9.81];

    fn unit_noise_params(sample_rate: Float) -> ImuParameters {
        let eye: Vec<Float> = vec![
            1e-4, 0.0, 0.0, //
            0.0, 1e-4, 0.0, //
            0.0, 0.0, 1e-4,
        ];
        ImuParameters::from_flat(sample_rate, &GRAVITY, &eye, &eye, &eye, &eye)
    }

    /// One second of stationary readings: the accelerometer measures the
    /// specific force countering gravity.
    fn stationary_factor(ids: Vec<NodeId>) -> ImuFactor {
        let n = 100;
        let gyro = vec![0.0; 3 * n];
        let mut accel = Vec::with_capacity(3 * n);
        for _ in 0..n {
            accel.extend_from_slice(&[0.0, 0.0, 9.81]);
        }
        let mut tform = vec![0.0; 16];
        for i in 0..4 {
            tform[i * 4 + i] = 1.0;
        }
        ImuFactor::new(
            ImuVariant::Basic,
            ids,
            unit_noise_params(100.0),
            &gyro,
            &accel,
            &tform,
        )
    }

    #[test]
    fn stationary_residual_is_small() {
        let factor = stationary_factor(vec![1, 2, 3, 4, 5, 6]);
        let pose = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0];
        let vel = [0.0, 0.0, 0.0];
        let bias = [0.0; 6];
        let cost = factor.create_cost_function();
        let unweighted_norm = {
            // Verify against the raw residual by removing the whitening.
            let r = cost.residual(&[&pose, &vel, &bias, &pose, &vel, &bias]);
            let info_sqrt = factor.preint.sqrt_information();
            (info_sqrt
                .try_inverse()
                .map(|inv| inv * r.clone())
                .unwrap_or(r))
            .norm()
        };
        assert!(unweighted_norm < 1e-6, "norm was {unweighted_norm}");
    }

    #[test]
    fn predict_stationary_holds_still() {
        let factor = stationary_factor(vec![1, 2, 3, 4, 5, 6]);
        let pose = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0];
        let vel = [0.0, 0.0, 0.0];
        let bias = [0.0; 6];
        let (pose_j, vel_j) = factor.predict(&pose, &vel, &bias);
        // Stationary: the integrated specific force cancels gravity.
        assert_relative_eq!(pose_j[2], 0.0, epsilon = 1e-6);
        assert_relative_eq!(vel_j[2], 0.0, epsilon = 1e-6);
    }

    #[test]
    fn rotation_integration_accumulates_yaw() {
        let n = 100;
        let mut gyro = Vec::with_capacity(3 * n);
        for _ in 0..n {
            gyro.extend_from_slice(&[0.0, 0.0, 0.5]);
        }
        let accel = vec![0.0; 3 * n];
        let mut tform = vec![0.0; 16];
        for i in 0..4 {
            tform[i * 4 + i] = 1.0;
        }
        let factor = ImuFactor::new(
            ImuVariant::Basic,
            vec![1, 2, 3, 4, 5, 6],
            unit_noise_params(100.0),
            &gyro,
            &accel,
            &tform,
        );
        // 0.5 rad/s for 1 s.
        let yaw = fgo_linalg::so3_log(&factor.preint.delta_q);
        assert_relative_eq!(yaw[2], 0.5, epsilon = 1e-9);
    }

    #[test]
    fn bias_correction_tracks_repropagation() {
        let n = 50;
        let mut gyro = Vec::with_capacity(3 * n);
        let mut accel = Vec::with_capacity(3 * n);
        for _ in 0..n {
            gyro.extend_from_slice(&[0.01, -0.02, 0.03]);
            accel.extend_from_slice(&[0.1, 0.2, 9.6]);
        }
        let mut tform = vec![0.0; 16];
        for i in 0..4 {
            tform[i * 4 + i] = 1.0;
        }
        let factor = ImuFactor::new(
            ImuVariant::Basic,
            vec![1, 2, 3, 4, 5, 6],
            unit_noise_params(50.0),
            &gyro,
            &accel,
            &tform,
        );
        let small_bias = Vector3::new(1e-4, -2e-4, 5e-5);
        let (dp_corr, _, _) = factor.preint.corrected(&small_bias, &Vector3::zeros());
        let repropagated = Preintegration::propagate(
            &factor.params,
            &factor.gyro_readings,
            &factor.accel_readings,
            small_bias,
            Vector3::zeros(),
        );
        // First-order correction approximates full repropagation.
        assert_relative_eq!(dp_corr[0], repropagated.delta_p[0], epsilon = 1e-5);
        assert_relative_eq!(dp_corr[1], repropagated.delta_p[1], epsilon = 1e-5);
        assert_relative_eq!(dp_corr[2], repropagated.delta_p[2], epsilon = 1e-5);
    }

    #[test]
    fn pre_optimization_update_repropagates_on_large_drift() {
        let mut factor = stationary_factor(vec![1, 2, 3, 4, 5, 6]);
        let pose = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0];
        let vel = [0.0, 0.0, 0.0];
        let bias = [0.1, 0.0, 0.0, 0.0, 0.0, 0.0];
        let params: Vec<&[Float]> = vec![&pose, &vel, &bias, &pose, &vel, &bias];
        factor.pre_optimization_update(&params);
        assert_relative_eq!(factor.preint.nominal_gyro_bias[0], 0.1);
    }

    #[test]
    fn aligned_predict_matches_plain_predict_at_identity_alignment() {
        let factor = stationary_factor(vec![1, 2, 3, 4, 5, 6]);
        let pose = [0.2, -0.1, 0.3, 0.0, 0.0, 0.0, 1.0];
        let vel = [0.1, 0.0, 0.0];
        let bias = [0.0; 6];
        let (plain_pose, plain_vel) = factor.predict(&pose, &vel, &bias);
        let identity_tform = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0];
        let identity_rot = [0.0, 0.0, 0.0, 1.0];
        let (aligned_pose, aligned_vel) =
            factor.predict_with_alignment(&pose, &vel, &bias, &identity_rot, 1.0, &identity_tform);
        for (a, b) in aligned_pose.iter().zip(&plain_pose) {
            assert_relative_eq!(a, b, epsilon = 1e-12);
        }
        for (a, b) in aligned_vel.iter().zip(&plain_vel) {
            assert_relative_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn aligned_predict_rescales_positions() {
        let factor = stationary_factor(vec![1, 2, 3, 4, 5, 6]);
        // Poses live at half metric scale; a constant velocity moves the IMU
        // one meter, so the predicted pose moves two pose units.
        let pose = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0];
        let vel = [1.0, 0.0, 0.0];
        let bias = [0.0; 6];
        let identity_tform = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0];
        let identity_rot = [0.0, 0.0, 0.0, 1.0];
        let (pose_j, _) =
            factor.predict_with_alignment(&pose, &vel, &bias, &identity_rot, 0.5, &identity_tform);
        assert_relative_eq!(pose_j[0], 2.0, epsilon = 1e-6);
    }

    #[test]
    fn gravity_scale_variant_schema() {
        let ids: Vec<NodeId> = (1..=8).collect();
        let mut tform = vec![0.0; 16];
        for i in 0..4 {
            tform[i * 4 + i] = 1.0;
        }
        let factor = ImuFactor::new(
            ImuVariant::GravityScale,
            ids,
            unit_noise_params(100.0),
            &[],
            &[],
            &tform,
        );
        assert_eq!(factor.variable_ids().len(), 8);
        assert_eq!(factor.variable_type(7), VariableType::Gravity);
        assert_eq!(factor.variable_type(8), VariableType::Scale);
    }
}
