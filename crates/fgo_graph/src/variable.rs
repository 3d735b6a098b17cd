use fgo_linalg::Float;

/// Caller-chosen identifier of a variable node, unique within a graph.
pub type NodeId = i32;

/// Caller-supplied opaque partition label (e.g. a trajectory segment in
/// multi-session SLAM).
pub type GroupId = i32;

/// The closed catalog of variable (node) types.
///
/// The numeric values are stable: they double as covariance-request type
/// codes on the flat wire format, and order the node-type indices.
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
pub enum VariableType {
    /// SE(3) pose stored as `[x, y, z, qx, qy, qz, qw]`.
    #[strum(serialize = "POSE_SE3")]
    PoseSe3 = 0,
    /// SE(2) pose stored as `[x, y, theta]`.
    #[strum(serialize = "POSE_SE2")]
    PoseSe2 = 1,
    /// 3D velocity.
    #[strum(serialize = "VEL3")]
    Vel3 = 2,
    /// 2D landmark point.
    #[strum(serialize = "POINT_XY")]
    PointXy = 3,
    /// 3D landmark point.
    #[strum(serialize = "POINT_XYZ")]
    PointXyz = 4,
    /// IMU bias `[gyro_bias, accel_bias]`.
    #[strum(serialize = "IMU_BIAS")]
    ImuBias = 5,
    /// Scalar camera intrinsic parameter.
    #[strum(serialize = "CAMERA_INTRINSICS")]
    CameraIntrinsics = 6,
    /// SE(3) sensor transform, same layout as a pose.
    #[strum(serialize = "TRANSFORM_SE3")]
    TransformSe3 = 7,
    /// SIM(3) pose stored as `[x, y, z, qx, qy, qz, qw, s]`.
    #[strum(serialize = "POSE_SE3_SCALE")]
    PoseSe3Scale = 8,
    /// Gravity direction as a unit quaternion `[qx, qy, qz, qw]`.
    #[strum(serialize = "GRAVITY")]
    Gravity = 9,
    /// Scalar scale.
    #[strum(serialize = "SCALE")]
    Scale = 10,
}

impl VariableType {
    /// Length of the stored state vector.
    #[must_use]
    pub const fn dim(self) -> usize {
        match self {
            Self::PoseSe3 | Self::TransformSe3 => 7,
            Self::PoseSe2 | Self::Vel3 | Self::PointXyz => 3,
            Self::PointXy => 2,
            Self::ImuBias => 6,
            Self::CameraIntrinsics | Self::Scale => 1,
            Self::PoseSe3Scale => 8,
            Self::Gravity => 4,
        }
    }

    /// Degrees of freedom of the local (tangent) parameterization.
    #[must_use]
    pub const fn local_size(self) -> usize {
        match self {
            Self::PoseSe3 | Self::TransformSe3 => 6,
            Self::PoseSe3Scale => 7,
            Self::Gravity => 3,
            other => other.dim(),
        }
    }

    /// The state a variable of this type is born with when a factor first
    /// references its id.
    #[must_use]
    pub fn default_state(self) -> Vec<Float> {
        match self {
            Self::PoseSe3 | Self::TransformSe3 => vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0],
            Self::PoseSe3Scale => vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0],
            Self::Gravity => vec![0.0, 0.0, 0.0, 1.0],
            Self::Scale => vec![1.0],
            other => vec![0.0; other.dim()],
        }
    }

    /// Whether this type is a pose node (seeds for partial optimization,
    /// marginal-factor gating, `is_pose_node` queries).
    #[must_use]
    pub const fn is_pose(self) -> bool {
        matches!(self, Self::PoseSe3 | Self::PoseSe2)
    }

    /// Decode a numeric wire code.
    #[must_use]
    pub fn from_wire(code: i32) -> Option<Self> {
        use strum::IntoEnumIterator;
        Self::iter().find(|t| *t as i32 == code)
    }
}
