//! A small SE(2) pose graph: drive a square, close the loop, optimize.
//!
//! Run with `cargo run --example pose_graph_se2`.

use std::f64::consts::FRAC_PI_2;

use fgo_graph::prelude::*;

fn identity_information(n: usize) -> Vec<f64> {
    let mut info = vec![0.0; n * n];
    for i in 0..n {
        info[i * n + i] = 1.0;
    }
    info
}

fn main() {
    let mut graph = FactorGraph::new();
    let info = identity_information(3);

    // A prior pins the first pose at the origin.
    graph.add_gaussian_factors(
        FactorType::PoseSe2Prior,
        &[0],
        &[0.0, 0.0, 0.0],
        &info,
        1,
        &[-1],
    );

    // Odometry around a unit square: forward one meter, turn left.
    for k in 0..4 {
        graph.add_gaussian_factors(
            FactorType::TwoPoseSe2,
            &[k, k + 1],
            &[1.0, 0.0, FRAC_PI_2],
            &info,
            1,
            &[-1],
        );
    }
    // Loop closure: pose 4 should coincide with pose 0.
    graph.add_gaussian_factors(
        FactorType::TwoPoseSe2,
        &[4, 0],
        &[0.0, 0.0, 0.0],
        &info,
        1,
        &[-1],
    );

    // Seed the odometry chain with drifted guesses.
    for k in 1..=4 {
        let drift = 0.1 * f64::from(k);
        graph.set_node_states(&[k], &[drift, drift, 0.0], 3);
    }

    let mut options = OptimizeOptions::default();
    options.solver.verbosity_level = 0;
    let info = graph
        .optimize(&options, None)
        .expect("optimization runs to completion");

    println!(
        "terminated after {} accepted steps: cost {:.3e} -> {:.3e}",
        info.num_successful_steps, info.initial_cost, info.final_cost
    );
    for k in 0..=4 {
        let state = graph.node_state(k).expect("node exists");
        println!(
            "pose {k}: ({:7.3}, {:7.3}, {:6.3} rad)",
            state[0], state[1], state[2]
        );
    }
}
