//! Sliding-window odometry: marginalize poses that leave the window instead
//! of throwing their information away, then recover the newest pose's
//! covariance.
//!
//! Run with `cargo run --example sliding_window`.

use fgo_graph::prelude::*;

const WINDOW: usize = 4;

fn identity_information(n: usize) -> Vec<f64> {
    let mut info = vec![0.0; n * n];
    for i in 0..n {
        info[i * n + i] = 1.0;
    }
    info
}

fn main() {
    let mut graph = FactorGraph::new();
    let info6 = identity_information(6);
    let origin = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0];
    let forward = [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0];

    graph.add_gaussian_factors(FactorType::PoseSe3Prior, &[0], &origin, &info6, 1, &[-1]);

    let mut options = OptimizeOptions::default();
    options.solver.verbosity_level = 0;
    options.covariance_type = vec![VariableType::PoseSe3 as i32];

    let mut oldest = 0;
    for k in 0..10 {
        graph.add_gaussian_factors(
            FactorType::TwoPoseSe3,
            &[k, k + 1],
            &forward,
            &info6,
            1,
            &[-1],
        );

        // Fold poses that fell out of the window into a marginal factor.
        while graph.num_nodes() > WINDOW {
            let result = graph.marginalize_node(oldest);
            assert!(result[0] >= 0, "marginalization failed: {result:?}");
            oldest += 1;
        }

        let solution = graph
            .optimize(&options, None)
            .expect("optimization runs to completion");
        let newest = graph.node_state(k + 1).expect("node exists");
        let sigma_x = graph
            .node_covariance(k + 1)
            .map_or(f64::NAN, |cov| cov[(0, 0)].sqrt());
        println!(
            "step {k}: {} nodes, {} factors, newest x = {:6.3} (sigma {:5.3}), cost {:.2e}",
            graph.num_nodes(),
            graph.num_factors(),
            newest[0],
            sigma_x,
            solution.final_cost,
        );
    }
}
