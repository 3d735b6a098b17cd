#![allow(clippy::unwrap_used)]

use approx::assert_relative_eq;
use pretty_assertions::assert_eq;

use crate::{
    factor::FactorType,
    variable::VariableType,
};

use super::FactorGraph;

fn eye(n: usize) -> Vec<f64> {
    let mut m = vec![0.0; n * n];
    for i in 0..n {
        m[i * n + i] = 1.0;
    }
    m
}

fn add_se2_between(graph: &mut FactorGraph, a: i32, b: i32, meas: [f64; 3]) -> i32 {
    let ids = graph.add_gaussian_factors(FactorType::TwoPoseSe2, &[a, b], &meas, &eye(3), 1, &[-1]);
    assert_eq!(ids.len(), 1);
    ids[0]
}

#[test]
fn adding_a_factor_creates_default_variables() {
    let mut graph = FactorGraph::new();
    add_se2_between(&mut graph, 1, 2, [1.0, 0.0, 0.0]);
    assert_eq!(graph.num_nodes(), 2);
    assert_eq!(graph.num_factors(), 1);
    assert_eq!(graph.node_type(1), Some(VariableType::PoseSe2));
    assert_eq!(graph.node_state(1).unwrap(), &[0.0, 0.0, 0.0]);
    assert_eq!(graph.is_fixed(1), Some(false));
}

#[test]
fn factor_ids_are_monotonic() {
    let mut graph = FactorGraph::new();
    let f0 = add_se2_between(&mut graph, 1, 2, [1.0, 0.0, 0.0]);
    let f1 = add_se2_between(&mut graph, 2, 3, [1.0, 0.0, 0.0]);
    assert_eq!(f0, 0);
    assert_eq!(f1, 1);
    // Ids are not reused after removal.
    graph.remove_factors(&[f1]);
    let f2 = add_se2_between(&mut graph, 2, 3, [1.0, 0.0, 0.0]);
    assert_eq!(f2, 2);
}

#[test]
fn type_mismatch_rejects_add_without_mutation() {
    let mut graph = FactorGraph::new();
    let ids = graph.add_gaussian_factors(
        FactorType::PoseSe3Prior,
        &[7],
        &[0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0],
        &eye(6),
        1,
        &[-1],
    );
    assert_eq!(ids.len(), 1);
    let before = graph.num_factors();

    // An SE(2) prior on the same id must fail without touching the graph.
    let result = graph.add_gaussian_factors(
        FactorType::PoseSe2Prior,
        &[7],
        &[0.0, 0.0, 0.0],
        &eye(3),
        1,
        &[-1],
    );
    assert_eq!(result, vec![7, -1]);
    assert_eq!(graph.num_factors(), before);
    assert_eq!(graph.node_type_string(7), "POSE_SE3");
}

#[test]
fn remove_factor_collects_dangling_nodes() {
    let mut graph = FactorGraph::new();
    let f01 = add_se2_between(&mut graph, 1, 2, [1.0, 0.0, 0.0]);
    add_se2_between(&mut graph, 2, 3, [1.0, 0.0, 0.0]);

    // Node 1 only touches f01; it must be garbage collected.
    let removed = graph.remove_factors(&[f01]);
    assert_eq!(removed, vec![1]);
    assert!(!graph.has_node(1));
    assert!(graph.has_node(2));
    assert_eq!(graph.num_factors(), 1);
    // The indices no longer know node 1.
    assert_eq!(graph.get_node_ids(None, Some(VariableType::PoseSe2), None), vec![2, 3]);
}

#[test]
fn remove_missing_factor_returns_validation_sequence() {
    let mut graph = FactorGraph::new();
    add_se2_between(&mut graph, 1, 2, [1.0, 0.0, 0.0]);
    assert_eq!(graph.remove_factors(&[0, 17]), vec![1, -1, -1]);
    // Nothing was removed.
    assert_eq!(graph.num_factors(), 1);
}

#[test]
fn remove_node_cascades_to_incident_factors() {
    // Triangle 1-2-3; removing node 2 removes its two factors.
    let mut graph = FactorGraph::new();
    let f12 = add_se2_between(&mut graph, 1, 2, [1.0, 0.0, 0.0]);
    let f23 = add_se2_between(&mut graph, 2, 3, [0.0, 1.0, 0.0]);
    let f31 = add_se2_between(&mut graph, 3, 1, [-1.0, -1.0, 0.0]);

    let output = graph.remove_nodes(&[2]);
    // Layout: removed node ids, removed factor ids (sorted), node count.
    assert_eq!(output, vec![2, f12, f23, 1]);
    assert!(graph.has_node(1));
    assert!(graph.has_node(3));
    assert_eq!(graph.num_factors(), 1);
    assert!(graph.factor_type_of(f31).is_some());
}

#[test]
fn add_then_remove_restores_node_level_state() {
    let mut graph = FactorGraph::new();
    add_se2_between(&mut graph, 1, 2, [1.0, 0.0, 0.0]);
    let before: Vec<i32> = graph.get_node_ids(None, None, None);

    let f = add_se2_between(&mut graph, 2, 9, [1.0, 0.0, 0.0]);
    graph.remove_factors(&[f]);

    assert_eq!(graph.get_node_ids(None, None, None), before);
    assert!(!graph.has_node(9));
}

#[test]
fn get_edges_lists_connected_ids_in_factor_order() {
    let mut graph = FactorGraph::new();
    add_se2_between(&mut graph, 1, 2, [1.0, 0.0, 0.0]);
    add_se2_between(&mut graph, 2, 3, [1.0, 0.0, 0.0]);
    assert_eq!(graph.get_edges(FactorType::TwoPoseSe2), vec![1, 2, 2, 3]);
    assert!(graph.get_edges(FactorType::TwoPoseSe3).is_empty());
}

#[test]
fn is_pose_node_checks_one_flavour() {
    let mut graph = FactorGraph::new();
    add_se2_between(&mut graph, 1, 2, [1.0, 0.0, 0.0]);
    graph.add_gaussian_factors(
        FactorType::Gps,
        &[10],
        &[0.0, 0.0, 0.0],
        &eye(3),
        1,
        &[-1],
    );
    assert!(graph.is_pose_node(&[1, 2]));
    assert!(graph.is_pose_node(&[10]));
    // Mixed SE(2)/SE(3) ids are not one pose flavour.
    assert!(!graph.is_pose_node(&[1, 10]));
    assert!(!graph.is_pose_node(&[42]));
}

#[test]
fn is_connected_over_the_full_graph() {
    let mut graph = FactorGraph::new();
    add_se2_between(&mut graph, 1, 2, [1.0, 0.0, 0.0]);
    add_se2_between(&mut graph, 3, 4, [1.0, 0.0, 0.0]);
    assert!(!graph.is_connected(None));
    add_se2_between(&mut graph, 2, 3, [1.0, 0.0, 0.0]);
    assert!(graph.is_connected(None));
}

#[test]
fn is_connected_with_seeds_uses_partial_graph_rules() {
    let mut graph = FactorGraph::new();
    add_se2_between(&mut graph, 1, 2, [1.0, 0.0, 0.0]);
    add_se2_between(&mut graph, 2, 3, [1.0, 0.0, 0.0]);
    // Seeds {1, 2} induce the 1-2 factor only: connected.
    assert!(graph.is_connected(Some(&[1, 2])));
    // Seeds {1, 3} exclude both between factors (each has a non-seed pose):
    // two isolated seeds.
    assert!(!graph.is_connected(Some(&[1, 3])));
}

#[test]
fn group_index_answers_get_node_ids() {
    let mut graph = FactorGraph::new();
    // Two chains in separate groups.
    graph.add_gaussian_factors(
        FactorType::TwoPoseSe2,
        &[1, 2],
        &[1.0, 0.0, 0.0],
        &eye(3),
        1,
        &[100, 100],
    );
    graph.add_gaussian_factors(
        FactorType::TwoPoseSe2,
        &[11, 12],
        &[1.0, 0.0, 0.0],
        &eye(3),
        1,
        &[200, 200],
    );

    assert_eq!(graph.get_node_ids(Some(&[100]), None, None), vec![1, 2]);
    assert_eq!(graph.get_node_ids(Some(&[200]), None, None), vec![11, 12]);
    assert_eq!(
        graph.get_node_ids(Some(&[100, 200]), Some(VariableType::PoseSe2), None),
        vec![1, 2, 11, 12]
    );
    assert_eq!(
        graph.get_node_ids(Some(&[100]), None, Some(FactorType::TwoPoseSe3)),
        Vec::<i32>::new()
    );
    assert!(graph.get_node_ids(Some(&[999]), None, None).is_empty());
}

#[test]
fn group_index_is_scrubbed_by_gc() {
    let mut graph = FactorGraph::new();
    let ids = graph.add_gaussian_factors(
        FactorType::TwoPoseSe2,
        &[1, 2],
        &[1.0, 0.0, 0.0],
        &eye(3),
        1,
        &[100, 100],
    );
    graph.remove_factors(&[ids[0]]);
    assert!(graph.get_node_ids(Some(&[100]), None, None).is_empty());
}

#[test]
fn shared_information_is_disambiguated_by_length() {
    let mut graph = FactorGraph::new();
    // Two factors, a single 3x3 information: shared.
    let ids = graph.add_gaussian_factors(
        FactorType::TwoPoseSe2,
        &[1, 2, 2, 3],
        &[1.0, 0.0, 0.0, 1.0, 0.0, 0.0],
        &eye(3),
        2,
        &[-1],
    );
    assert_eq!(ids.len(), 2);

    // Two factors, two stacked information matrices: per-factor.
    let mut stacked = eye(3);
    stacked.extend(eye(3).iter().map(|v| v * 4.0));
    let ids = graph.add_gaussian_factors(
        FactorType::TwoPoseSe2,
        &[3, 4, 4, 5],
        &[1.0, 0.0, 0.0, 1.0, 0.0, 0.0],
        &stacked,
        2,
        &[-1],
    );
    assert_eq!(ids.len(), 2);
    // The second factor's residual is scaled by sqrt(4) = 2 relative to the
    // first at the same displacement.
    let r_first = graph.factor_residual(ids[0]).unwrap();
    let r_second = graph.factor_residual(ids[1]).unwrap();
    assert_relative_eq!(r_second[0], 2.0 * r_first[0], epsilon = 1e-12);
}

#[test]
fn set_and_get_node_states_roundtrip() {
    let mut graph = FactorGraph::new();
    add_se2_between(&mut graph, 1, 2, [1.0, 0.0, 0.0]);
    let out = graph.set_node_states(&[1, 2], &[0.1, 0.2, 0.3, 0.4, 0.5, 0.6], 3);
    assert_eq!(out, vec![1, 1]);
    let states = graph.get_node_states(&[1, 2]);
    assert_eq!(states, vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6]);
}

#[test]
fn set_node_states_flags_wrong_dimension() {
    let mut graph = FactorGraph::new();
    add_se2_between(&mut graph, 1, 2, [1.0, 0.0, 0.0]);
    assert_eq!(graph.set_node_states(&[1], &[0.0, 0.0], 2), vec![-3]);
}

#[test]
fn get_node_states_flags_missing_and_mixed_ids() {
    let mut graph = FactorGraph::new();
    add_se2_between(&mut graph, 1, 2, [1.0, 0.0, 0.0]);
    graph.add_gaussian_factors(
        FactorType::Gps,
        &[10],
        &[0.0; 3],
        &eye(3),
        1,
        &[-1],
    );

    let missing = graph.get_node_states(&[1, 99]);
    assert_eq!(missing[..3], [1.0, -1.0, -1.0]);
    assert!(missing[3].is_nan());

    let mixed = graph.get_node_states(&[1, 10]);
    assert_eq!(mixed[..3], [1.0, -2.0, -2.0]);
    assert!(mixed[3].is_nan());
}

#[test]
fn fix_free_roundtrip_preserves_state() {
    let mut graph = FactorGraph::new();
    add_se2_between(&mut graph, 1, 2, [1.0, 0.0, 0.0]);
    graph.set_node_states(&[1], &[0.5, 0.25, 0.1], 3);

    assert_eq!(graph.fix_nodes(&[1]), vec![1, 1]);
    assert_eq!(graph.are_nodes_fixed(&[1, 2]), vec![1, 0]);
    assert_eq!(graph.free_nodes(&[1]), vec![1, 1]);
    assert_eq!(graph.are_nodes_fixed(&[1, 2]), vec![0, 0]);
    assert_eq!(graph.node_state(1).unwrap(), &[0.5, 0.25, 0.1]);
}

#[test]
fn fix_unknown_node_fixes_nothing() {
    let mut graph = FactorGraph::new();
    add_se2_between(&mut graph, 1, 2, [1.0, 0.0, 0.0]);
    assert_eq!(graph.fix_nodes(&[1, 99]), vec![1, -1, -1]);
    assert_eq!(graph.are_nodes_fixed(&[1]), vec![0]);
}

#[test]
fn set_variable_creates_then_checks_schema() {
    let mut graph = FactorGraph::new();
    assert!(graph.set_variable(5, &[1.0, 2.0, 3.0], VariableType::PointXyz));
    assert!(graph.has_node(5));
    // Same id, same schema: state set.
    assert!(graph.set_variable(5, &[4.0, 5.0, 6.0], VariableType::PointXyz));
    assert_eq!(graph.node_state(5).unwrap(), &[4.0, 5.0, 6.0]);
    // Same id, different type: rejected.
    assert!(!graph.set_variable(5, &[0.0, 0.0], VariableType::PointXy));
}

#[test]
fn covariance_queries_before_any_optimize_are_flagged() {
    let mut graph = FactorGraph::new();
    add_se2_between(&mut graph, 1, 2, [1.0, 0.0, 0.0]);
    let out = graph.get_node_covariances(&[1]);
    // Per-id -1 then -3 flag, then the NaN marker.
    assert_eq!(out[..2], [-1.0, -3.0]);
    assert!(out[2].is_nan());
}

#[test]
fn imu_factor_creates_all_six_variables() {
    use crate::factor::imu::{ImuParameters, ImuVariant};

    let mut graph = FactorGraph::new();
    let noise = eye(3);
    let params =
        ImuParameters::from_flat(100.0, &[0.0, 0.0, -9.81], &noise, &noise, &noise, &noise);
    let mut tform = vec![0.0; 16];
    for i in 0..4 {
        tform[i * 4 + i] = 1.0;
    }
    let fid = graph.add_imu_factor(
        ImuVariant::Basic,
        &[1, 2, 3, 4, 5, 6],
        params,
        &[0.0; 30],
        &[0.0; 30],
        &tform,
        &[-1],
    );
    assert!(fid >= 0);
    assert_eq!(graph.num_nodes(), 6);
    assert_eq!(graph.node_type(1), Some(VariableType::PoseSe3));
    assert_eq!(graph.node_type(2), Some(VariableType::Vel3));
    assert_eq!(graph.node_type(3), Some(VariableType::ImuBias));
    assert_eq!(
        graph.get_node_ids(None, Some(VariableType::Vel3), Some(FactorType::Imu)),
        vec![2, 5]
    );
}
