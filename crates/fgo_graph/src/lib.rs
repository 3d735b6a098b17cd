//! A nonlinear-least-squares factor graph engine for pose and landmark
//! estimation (visual-inertial SLAM, sensor calibration, bundle adjustment).
//!
//! A factor graph is a bipartite graph of variable nodes (the unknowns:
//! poses, points, velocities, biases, intrinsics) and factor nodes
//! (probabilistic constraints from measurements or priors). The engine
//! supports incremental construction, state fixing, full or pose-seeded
//! partial optimization, Schur-complement marginalization and covariance
//! recovery.
//!
//! # Example
//! ```
//! use fgo_graph::prelude::*;
//!
//! let mut graph = FactorGraph::new();
//! // A prior pinning pose 1 at the origin and an odometry measurement
//! // placing pose 2 one meter ahead.
//! graph.add_gaussian_factors(
//!     FactorType::PoseSe2Prior,
//!     &[1],
//!     &[0.0, 0.0, 0.0],
//!     &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
//!     1,
//!     &[-1],
//! );
//! graph.add_gaussian_factors(
//!     FactorType::TwoPoseSe2,
//!     &[1, 2],
//!     &[1.0, 0.0, 0.0],
//!     &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
//!     1,
//!     &[-1],
//! );
//!
//! let mut options = OptimizeOptions::default();
//! options.solver.verbosity_level = 0;
//! let info = graph.optimize(&options, None).unwrap();
//! assert!(info.is_solution_usable);
//! ```

pub mod factor;
pub mod graph;
pub mod parameterization;
pub mod registry;
pub mod variable;

pub use factor::{Factor, FactorId, FactorType, Linearization};
pub use graph::{FactorGraph, GraphError, OptimizeOptions, SolutionInfo};
pub use registry::{EnsureOutcome, VariableRegistry};
pub use variable::{GroupId, NodeId, VariableType};

/// Convenience glob import for typical graph construction and optimization.
pub mod prelude {
    pub use crate::{
        factor::{
            camera::DistortedVariant,
            imu::{ImuParameters, ImuVariant},
            FactorType,
        },
        graph::{FactorGraph, OptimizeOptions, SolutionInfo},
        variable::{GroupId, NodeId, VariableType},
    };
    pub use fgo_solver::TerminationType;
}
