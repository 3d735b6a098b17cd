//! End-to-end scenarios: graph construction, optimization, marginalization
//! and covariance recovery working together.
#![allow(clippy::unwrap_used)]

use std::sync::{atomic::AtomicBool, Arc};

use approx::assert_relative_eq;
use fgo_graph::prelude::*;
use pretty_assertions::assert_eq;

fn eye(n: usize) -> Vec<f64> {
    let mut m = vec![0.0; n * n];
    for i in 0..n {
        m[i * n + i] = 1.0;
    }
    m
}

fn quiet_options() -> OptimizeOptions {
    let mut options = OptimizeOptions::default();
    options.solver.verbosity_level = 0;
    options
}

fn se2_triangle() -> FactorGraph {
    let mut graph = FactorGraph::new();
    let add = |graph: &mut FactorGraph, a: i32, b: i32, meas: [f64; 3]| {
        graph.add_gaussian_factors(FactorType::TwoPoseSe2, &[a, b], &meas, &eye(3), 1, &[-1]);
    };
    add(&mut graph, 1, 2, [1.0, 0.0, 0.0]);
    add(&mut graph, 2, 3, [0.0, 1.0, std::f64::consts::FRAC_PI_2]);
    // The loop-closing measurement consistent with the two above.
    add(&mut graph, 3, 1, [-1.0, 1.0, -std::f64::consts::FRAC_PI_2]);
    graph
}

#[test]
fn pose_graph_se2_triangle_converges() {
    let mut graph = se2_triangle();
    graph.fix_nodes(&[1]);

    let info = graph.optimize(&quiet_options(), None).unwrap();
    assert!(info.is_solution_usable);
    assert_eq!(info.termination_type, TerminationType::Convergence);
    assert!(info.final_cost < 1e-10, "final cost {}", info.final_cost);
    assert_eq!(info.fixed_node_ids, vec![1]);
    assert_eq!(info.optimized_node_ids, vec![2, 3]);

    let x1 = graph.node_state(1).unwrap();
    assert_relative_eq!(x1[0], 0.0, epsilon = 1e-12);

    let x2 = graph.node_state(2).unwrap();
    assert_relative_eq!(x2[0], 1.0, epsilon = 1e-6);
    assert_relative_eq!(x2[1], 0.0, epsilon = 1e-6);
    assert_relative_eq!(x2[2], 0.0, epsilon = 1e-6);

    let x3 = graph.node_state(3).unwrap();
    assert_relative_eq!(x3[0], 1.0, epsilon = 1e-6);
    assert_relative_eq!(x3[1], 1.0, epsilon = 1e-6);
    assert_relative_eq!(x3[2], std::f64::consts::FRAC_PI_2, epsilon = 1e-6);
}

#[test]
fn optimize_is_idempotent_at_a_fixed_point() {
    let mut graph = se2_triangle();
    graph.fix_nodes(&[1]);

    let first = graph.optimize(&quiet_options(), None).unwrap();
    assert_eq!(first.termination_type, TerminationType::Convergence);
    let second = graph.optimize(&quiet_options(), None).unwrap();
    assert!(second.final_cost <= first.final_cost + 1e-12);
    assert!(second.num_successful_steps <= 1);
}

#[test]
fn unreached_variables_are_bitwise_unchanged_by_partial_optimize() {
    let mut graph = se2_triangle();
    graph.fix_nodes(&[1]);
    // A disconnected second chain.
    graph.add_gaussian_factors(
        FactorType::TwoPoseSe2,
        &[10, 11],
        &[1.0, 0.0, 0.0],
        &eye(3),
        1,
        &[-1],
    );
    graph.set_node_states(&[10, 11], &[0.1, 0.2, 0.3, 0.4, 0.5, 0.6], 3);

    let info = graph
        .optimize(&quiet_options(), Some(&[1, 2, 3]))
        .unwrap();
    assert!(info.is_solution_usable);
    assert!(!info.optimized_node_ids.contains(&10));

    // Bitwise unchanged.
    assert_eq!(graph.node_state(10).unwrap(), &[0.1, 0.2, 0.3]);
    assert_eq!(graph.node_state(11).unwrap(), &[0.4, 0.5, 0.6]);
}

#[test]
fn partial_optimize_excludes_between_factors_with_unselected_poses() {
    let mut graph = se2_triangle();
    graph.fix_nodes(&[1]);
    graph.set_node_states(&[3], &[5.0, 5.0, 0.2], 3);

    // Seeds {1, 2}: the 2-3 and 3-1 factors have a non-seed pose and stay
    // out, so node 3 keeps its state.
    let info = graph.optimize(&quiet_options(), Some(&[1, 2])).unwrap();
    assert!(info.is_solution_usable);
    assert_eq!(graph.node_state(3).unwrap(), &[5.0, 5.0, 0.2]);
    let x2 = graph.node_state(2).unwrap();
    assert_relative_eq!(x2[0], 1.0, epsilon = 1e-6);
}

#[test]
fn velocity_and_bias_priors_ride_along_with_partial_windows() {
    let mut graph = FactorGraph::new();
    let noise: Vec<f64> = eye(3).iter().map(|v| v * 1e-4).collect();
    let params = ImuParameters::from_flat(
        100.0,
        &[0.0, 0.0, -9.81],
        &noise,
        &noise,
        &noise,
        &noise,
    );
    let mut tform = vec![0.0; 16];
    for i in 0..4 {
        tform[i * 4 + i] = 1.0;
    }
    let n = 10;
    let gyro = vec![0.0; 3 * n];
    let accel: Vec<f64> = (0..n).flat_map(|_| [0.0, 0.0, 9.81]).collect();
    graph.add_imu_factor(
        ImuVariant::Basic,
        &[1, 2, 3, 4, 5, 6],
        params,
        &gyro,
        &accel,
        &tform,
        &[-1],
    );
    // A velocity prior on node 2 and a bias prior on node 3.
    graph.add_gaussian_factors(FactorType::Vel3Prior, &[2], &[0.0; 3], &eye(3), 1, &[-1]);
    graph.add_gaussian_factors(FactorType::ImuBiasPrior, &[3], &[0.0; 6], &eye(6), 1, &[-1]);
    graph.fix_nodes(&[1]);

    let info = graph.optimize(&quiet_options(), Some(&[1, 4])).unwrap();
    assert!(info.is_solution_usable);
    // The priors' nodes were already in the window, so the priors joined the
    // problem and their nodes took part.
    assert!(info.optimized_node_ids.contains(&2));
    assert!(info.optimized_node_ids.contains(&3));
}

/// A chain 1-2-...-n of unit-x SE(3) odometry factors, anchored by a prior
/// on node 1. The prior both fixes the gauge and keeps node 1 connected to
/// something outside any marginalized window.
fn anchored_se3_chain(n: usize) -> FactorGraph {
    let mut graph = FactorGraph::new();
    let origin = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0];
    graph.add_gaussian_factors(FactorType::PoseSe3Prior, &[1], &origin, &eye(6), 1, &[-1]);
    let meas = [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0];
    for k in 1..n {
        graph.add_gaussian_factors(
            FactorType::TwoPoseSe3,
            &[k as i32, (k + 1) as i32],
            &meas,
            &eye(6),
            1,
            &[-1],
        );
    }
    graph
}

#[test]
fn marginalize_node_in_se3_chain_matches_reference() {
    // Reference: optimize the original 4-chain with node 1 fixed.
    let mut reference = anchored_se3_chain(4);
    reference.fix_nodes(&[1]);
    reference.optimize(&quiet_options(), None).unwrap();
    let reference_x3 = reference.node_state(3).unwrap().to_vec();

    // Marginalize node 2; the new factor must connect {1, 3}.
    let mut graph = anchored_se3_chain(4);
    graph.fix_nodes(&[1]);
    let before = graph.num_factors();
    let output = graph.marginalize_node(2);
    let marginal_id = output[0];
    assert!(marginal_id >= 0);
    // Layout: [marginal id, eliminated nodes, removed factors, count].
    assert_eq!(output[1], 2);
    assert_eq!(*output.last().unwrap(), 1);
    assert!(!graph.has_node(2));
    // Two between factors went away, one marginal factor arrived.
    assert_eq!(graph.num_factors(), before - 1);

    let mut edge = graph.get_edges(FactorType::Marginal);
    edge.sort_unstable();
    assert_eq!(edge, vec![1, 3]);

    graph.optimize(&quiet_options(), None).unwrap();
    let x3 = graph.node_state(3).unwrap();
    for (a, b) in x3.iter().zip(&reference_x3) {
        assert_relative_eq!(a, b, epsilon = 1e-8);
    }
}

#[test]
fn marginal_factor_preserves_residual_at_linearization_point() {
    let mut graph = anchored_se3_chain(4);
    graph.fix_nodes(&[1]);
    // Move the chain to its optimum before marginalizing.
    graph.optimize(&quiet_options(), None).unwrap();

    let output = graph.marginalize_node(2);
    let marginal_id = output[0];
    assert!(marginal_id >= 0);

    // States have not moved since marginalization and the chain was at its
    // optimum, so the marginal residual norm stays at the Schur constant.
    let residual = graph.factor_residual(marginal_id).unwrap();
    assert!(residual.norm() < 1e-6, "residual norm {}", residual.norm());
}

#[test]
fn marginalize_rejects_sets_with_no_retained_variable() {
    let mut graph = FactorGraph::new();
    let meas = [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0];
    graph.add_gaussian_factors(FactorType::TwoPoseSe3, &[1, 2], &meas, &eye(6), 1, &[-1]);
    // The single factor's variables all become isolated: nothing retained.
    assert_eq!(graph.marginalize_factors(&[0]), vec![-2]);
    // The graph is untouched.
    assert_eq!(graph.num_factors(), 1);
    assert_eq!(graph.num_nodes(), 2);
}

#[test]
fn marginalize_rejects_fixed_marginalized_variables() {
    let mut graph = anchored_se3_chain(4);
    graph.fix_nodes(&[2]);
    // Marginalizing node 2 would eliminate a fixed variable.
    let output = graph.marginalize_node(2);
    assert_eq!(output, vec![2, -3]);
    assert!(graph.has_node(2));
}

#[test]
fn marginalize_missing_factor_is_flagged() {
    let mut graph = anchored_se3_chain(3);
    assert_eq!(graph.marginalize_factors(&[42]), vec![-1, -1]);
}

#[test]
fn covariance_of_a_pose_prior_reflects_the_information() {
    let mut graph = FactorGraph::new();
    let meas = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0];
    graph.add_gaussian_factors(FactorType::PoseSe3Prior, &[1], &meas, &eye(6), 1, &[-1]);

    let mut options = quiet_options();
    options.covariance_type = vec![VariableType::PoseSe3 as i32];
    let info = graph.optimize(&options, None).unwrap();
    assert!(info.is_solution_usable);

    let cov = graph.node_covariance(1).expect("covariance stored");
    assert_eq!(cov.nrows(), 7);
    // Position block: the prior's information is the identity.
    for i in 0..3 {
        assert_relative_eq!(cov[(i, i)], 1.0, epsilon = 1e-6);
    }
    // Quaternion block: the unit identity covariance lifted through the
    // parameterization Jacobian picks up a factor 1/4.
    for i in 3..6 {
        assert_relative_eq!(cov[(i, i)], 0.25, epsilon = 1e-6);
    }

    let flat = graph.get_node_covariances(&[1]);
    assert_eq!(flat.len(), 49);
    assert_relative_eq!(flat[0], cov[(0, 0)], epsilon = 1e-12);
}

#[test]
fn covariance_is_not_stored_unless_requested() {
    let mut graph = se2_triangle();
    graph.fix_nodes(&[1]);
    graph.optimize(&quiet_options(), None).unwrap();
    assert!(graph.node_covariance(2).is_none());
    let out = graph.get_node_covariances(&[2]);
    assert!(out.last().unwrap().is_nan());
}

#[test]
fn cancellation_terminates_gracefully() {
    let mut graph = se2_triangle();
    graph.fix_nodes(&[1]);

    let mut options = quiet_options();
    let flag = Arc::new(AtomicBool::new(true));
    options.solver.abort = Some(Arc::clone(&flag));

    let info = graph.optimize(&options, None).unwrap();
    assert_eq!(info.termination_type, TerminationType::UserSuccess);
    assert!(info.is_solution_usable);
    assert!(info.num_successful_steps <= 1);
}

#[test]
fn line_search_minimizer_also_solves_the_triangle() {
    use fgo_solver::MinimizerType;

    let mut graph = se2_triangle();
    graph.fix_nodes(&[1]);
    let mut options = quiet_options();
    options.solver.minimizer_type = MinimizerType::LineSearch;
    options.solver.max_num_iterations = 500;
    let info = graph.optimize(&options, None).unwrap();
    assert!(info.is_solution_usable);
    let x2 = graph.node_state(2).unwrap();
    assert_relative_eq!(x2[0], 1.0, epsilon = 1e-4);
}

#[test]
fn landmark_observations_triangulate_a_point() {
    let mut graph = FactorGraph::new();
    // Two fixed SE(2) poses observing one landmark.
    graph.add_gaussian_factors(
        FactorType::TwoPoseSe2,
        &[1, 2],
        &[2.0, 0.0, 0.0],
        &eye(3),
        1,
        &[-1],
    );
    // Landmark at (1, 1): seen at (1, 1) from pose 1 and (-1, 1) from pose 2.
    graph.add_gaussian_factors(
        FactorType::PoseSe2Point2,
        &[1, 50, 2, 50],
        &[1.0, 1.0, -1.0, 1.0],
        &eye(2),
        2,
        &[-1],
    );
    graph.fix_nodes(&[1, 2]);
    graph.set_node_states(&[2], &[2.0, 0.0, 0.0], 3);

    let info = graph.optimize(&quiet_options(), None).unwrap();
    assert!(info.is_solution_usable);
    let landmark = graph.node_state(50).unwrap();
    assert_relative_eq!(landmark[0], 1.0, epsilon = 1e-6);
    assert_relative_eq!(landmark[1], 1.0, epsilon = 1e-6);
}

#[test]
fn gps_and_prior_pull_a_pose_to_agreement() {
    let mut graph = FactorGraph::new();
    let prior = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0];
    graph.add_gaussian_factors(FactorType::PoseSe3Prior, &[1], &prior, &eye(6), 1, &[-1]);
    graph.add_gaussian_factors(
        FactorType::Gps,
        &[1],
        &[1.0, 0.0, 0.0],
        &eye(3),
        1,
        &[-1],
    );

    let info = graph.optimize(&quiet_options(), None).unwrap();
    assert!(info.is_solution_usable);
    // Equal weights: the pose settles halfway.
    let x = graph.node_state(1).unwrap();
    assert_relative_eq!(x[0], 0.5, epsilon = 1e-6);
}

#[test]
fn projection_factor_pulls_the_point_onto_the_ray() {
    let mut graph = FactorGraph::new();
    let mut tform = vec![0.0; 16];
    for i in 0..4 {
        tform[i * 4 + i] = 1.0;
    }
    // Two consistent observations and priors pinning the pose.
    let prior = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0];
    graph.add_gaussian_factors(FactorType::PoseSe3Prior, &[1], &prior, &eye(6), 1, &[-1]);
    graph.add_camera_projection_factors(
        &[1, 60],
        &[0.0, 0.0, 100.0, 100.0],
        &eye(2),
        1,
        &[-1],
        &tform,
    );
    graph.fix_nodes(&[1]);
    graph.set_variable(60, &[0.1, 0.1, 5.0], VariableType::PointXyz);

    let info = graph.optimize(&quiet_options(), None).unwrap();
    assert!(info.is_solution_usable);
    let point = graph.node_state(60).unwrap();
    // The point is pulled onto the optical axis (up to depth gauge freedom).
    assert_relative_eq!(point[0] / point[2], 0.0, epsilon = 1e-4);
    assert_relative_eq!(point[1] / point[2], 0.0, epsilon = 1e-4);
}
