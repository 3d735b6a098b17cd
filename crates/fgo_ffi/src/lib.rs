//! Flat-array C ABI over the factor graph engine.
//!
//! The ABI is the integration surface for array-marshalling callers: every
//! operation takes caller-allocated input/output buffers, and per-id results
//! are interleaved with the sentinel codes of the core validation sequences.
//! Output arrays are paired with a length slot telling the caller how many
//! values to interpret.
//!
//! # Safety
//!
//! All functions dereference raw pointers supplied by the caller. Pointers
//! must be valid for the documented lengths, and output buffers must be large
//! enough for the documented worst case (`num ids + 2` slots for validation
//! sequences, `sum of state dims + num ids + 2` for state reads).

use std::os::raw::c_char;
use std::str::FromStr;

use fgo_graph::{
    factor::imu::{ImuParameters, ImuVariant},
    FactorGraph, FactorType, NodeId, OptimizeOptions, VariableType,
};
use fgo_solver::TrustRegionStrategyType;

/// Wire code for "no covariance" in a covariance-type list.
const COVARIANCE_NONE: i32 = -1;

unsafe fn slice_or_empty<'a, T>(ptr: *const T, len: usize) -> &'a [T] {
    if ptr.is_null() || len == 0 {
        &[]
    } else {
        // SAFETY: non-null pointer valid for `len` elements per the ABI
        // contract.
        unsafe { std::slice::from_raw_parts(ptr, len) }
    }
}

unsafe fn write_values(values: &[f64], out: *mut f64, out_len: *mut f64) {
    // SAFETY: caller provides buffers large enough for the documented output.
    unsafe {
        for (k, &v) in values.iter().enumerate() {
            *out.add(k) = v;
        }
        *out_len = values.len() as f64;
    }
}

unsafe fn write_i32_values(values: &[i32], out: *mut f64, out_len: *mut f64) {
    let as_f64: Vec<f64> = values.iter().map(|&v| f64::from(v)).collect();
    // SAFETY: forwarded caller contract.
    unsafe { write_values(&as_f64, out, out_len) }
}

unsafe fn parse_str<'a>(ptr: *const c_char, len: usize) -> &'a str {
    // SAFETY: non-null pointer valid for `len` bytes per the ABI contract.
    let bytes = unsafe { slice_or_empty(ptr.cast::<u8>(), len) };
    std::str::from_utf8(bytes).unwrap_or("")
}

/// Construct a factor graph and return its opaque handle.
#[no_mangle]
pub extern "C" fn fgo_construct_factor_graph() -> *mut FactorGraph {
    Box::into_raw(Box::new(FactorGraph::new()))
}

/// Destroy a factor graph previously returned by
/// [`fgo_construct_factor_graph`].
///
/// # Safety
///
/// `graph` must be a handle from [`fgo_construct_factor_graph`] that has not
/// been destroyed yet.
#[no_mangle]
pub unsafe extern "C" fn fgo_destruct_factor_graph(graph: *mut FactorGraph) {
    if !graph.is_null() {
        // SAFETY: ownership returns to Rust exactly once per the contract.
        drop(unsafe { Box::from_raw(graph) });
    }
}

/// Number of variable nodes in the graph.
///
/// # Safety
///
/// `graph` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn fgo_get_num_nodes(graph: *const FactorGraph) -> f64 {
    // SAFETY: live handle per the contract.
    unsafe { &*graph }.num_nodes() as f64
}

/// Number of factors in the graph.
///
/// # Safety
///
/// `graph` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn fgo_get_num_factors(graph: *const FactorGraph) -> f64 {
    // SAFETY: live handle per the contract.
    unsafe { &*graph }.num_factors() as f64
}

/// Whether a node with the given id exists.
///
/// # Safety
///
/// `graph` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn fgo_has_node(graph: *const FactorGraph, id: f64) -> bool {
    // SAFETY: live handle per the contract.
    unsafe { &*graph }.has_node(id as NodeId)
}

/// Write the node's type string into `type_buf` (not null-terminated) and its
/// byte length into `type_len`. Unknown ids yield an empty string.
///
/// # Safety
///
/// `graph` must be a live handle; `type_buf` must hold at least 80 bytes.
#[no_mangle]
pub unsafe extern "C" fn fgo_get_node_type(
    graph: *const FactorGraph,
    id: f64,
    type_buf: *mut c_char,
    type_len: *mut f64,
) {
    // SAFETY: live handle per the contract.
    let name = unsafe { &*graph }.node_type_string(id as NodeId);
    // SAFETY: caller provides a large-enough buffer.
    unsafe {
        for (k, byte) in name.bytes().enumerate() {
            *type_buf.add(k) = byte as c_char;
        }
        *type_len = name.len() as f64;
    }
}

/// States of the given nodes, concatenated, or the validation sequence with a
/// trailing NaN marker.
///
/// # Safety
///
/// Pointer arguments follow the crate-level ABI contract.
#[no_mangle]
pub unsafe extern "C" fn fgo_get_node_state(
    graph: *const FactorGraph,
    ids: *const i32,
    num_ids: i32,
    out_state: *mut f64,
    out_len: *mut f64,
) {
    // SAFETY: forwarded caller contract.
    unsafe {
        let ids = slice_or_empty(ids, num_ids as usize);
        let values = (*graph).get_node_states(ids);
        write_values(&values, out_state, out_len);
    }
}

/// Set the given nodes' states from a concatenated buffer of
/// `per_state_len`-value states. Writes the validation sequence.
///
/// # Safety
///
/// Pointer arguments follow the crate-level ABI contract.
#[no_mangle]
pub unsafe extern "C" fn fgo_set_node_state(
    graph: *mut FactorGraph,
    ids: *const i32,
    num_ids: i32,
    state: *const f64,
    per_state_len: i32,
    out: *mut f64,
    out_len: *mut f64,
) {
    // SAFETY: forwarded caller contract.
    unsafe {
        let ids = slice_or_empty(ids, num_ids as usize);
        let values = slice_or_empty(state, (num_ids * per_state_len) as usize);
        let result = (*graph).set_node_states(ids, values, per_state_len as usize);
        write_i32_values(&result, out, out_len);
    }
}

/// Fix the given nodes; writes the existence validation sequence.
///
/// # Safety
///
/// Pointer arguments follow the crate-level ABI contract.
#[no_mangle]
pub unsafe extern "C" fn fgo_fix_node(
    graph: *mut FactorGraph,
    ids: *const i32,
    num_ids: i32,
    out: *mut f64,
    out_len: *mut f64,
) {
    // SAFETY: forwarded caller contract.
    unsafe {
        let ids = slice_or_empty(ids, num_ids as usize);
        let result = (*graph).fix_nodes(ids);
        write_i32_values(&result, out, out_len);
    }
}

/// Free the given nodes; writes the existence validation sequence.
///
/// # Safety
///
/// Pointer arguments follow the crate-level ABI contract.
#[no_mangle]
pub unsafe extern "C" fn fgo_free_node(
    graph: *mut FactorGraph,
    ids: *const i32,
    num_ids: i32,
    out: *mut f64,
    out_len: *mut f64,
) {
    // SAFETY: forwarded caller contract.
    unsafe {
        let ids = slice_or_empty(ids, num_ids as usize);
        let result = (*graph).free_nodes(ids);
        write_i32_values(&result, out, out_len);
    }
}

/// `1`/`0` per node for fixed/free, or the existence validation sequence.
///
/// # Safety
///
/// Pointer arguments follow the crate-level ABI contract.
#[no_mangle]
pub unsafe extern "C" fn fgo_is_node_fixed(
    graph: *const FactorGraph,
    ids: *const i32,
    num_ids: i32,
    out: *mut f64,
    out_len: *mut f64,
) {
    // SAFETY: forwarded caller contract.
    unsafe {
        let ids = slice_or_empty(ids, num_ids as usize);
        let result = (*graph).are_nodes_fixed(ids);
        write_i32_values(&result, out, out_len);
    }
}

/// Covariance blocks of the given nodes, concatenated row-major, or the first
/// failing validation sequence with a trailing NaN marker.
///
/// # Safety
///
/// Pointer arguments follow the crate-level ABI contract.
#[no_mangle]
pub unsafe extern "C" fn fgo_get_node_covariance(
    graph: *const FactorGraph,
    ids: *const i32,
    num_ids: i32,
    out_covariance: *mut f64,
    out_len: *mut f64,
) {
    // SAFETY: forwarded caller contract.
    unsafe {
        let ids = slice_or_empty(ids, num_ids as usize);
        let values = (*graph).get_node_covariances(ids);
        write_values(&values, out_covariance, out_len);
    }
}

/// Node ids matching the group/node-type/factor-type filters, ascending. The
/// literal string `"None"` (or an empty string) means "no filter"; a leading
/// group id of `-1` means all groups.
///
/// # Safety
///
/// Pointer arguments follow the crate-level ABI contract.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn fgo_get_node_ids(
    graph: *const FactorGraph,
    out: *mut f64,
    out_len: *mut f64,
    group_ids: *const i32,
    num_group_ids: i32,
    node_type: *const c_char,
    node_type_len: i32,
    factor_type: *const c_char,
    factor_type_len: i32,
) {
    // SAFETY: forwarded caller contract.
    unsafe {
        let groups = slice_or_empty(group_ids, num_group_ids as usize);
        let node_type_str = parse_str(node_type, node_type_len as usize);
        let factor_type_str = parse_str(factor_type, factor_type_len as usize);

        let groups = match groups.first() {
            Some(&-1) | None => None,
            _ => Some(groups),
        };
        let node_filter = VariableType::from_str(node_type_str).ok();
        let factor_filter = FactorType::from_name(factor_type_str);
        let ids = (*graph).get_node_ids(groups, node_filter, factor_filter);
        write_i32_values(&ids, out, out_len);
    }
}

/// Whether the (sub)graph is one connected component. A leading id of `-1`
/// examines the whole graph; otherwise the ids are pose-node seeds.
///
/// # Safety
///
/// Pointer arguments follow the crate-level ABI contract.
#[no_mangle]
pub unsafe extern "C" fn fgo_is_connected(
    graph: *const FactorGraph,
    ids: *const i32,
    num_ids: i32,
) -> bool {
    // SAFETY: forwarded caller contract.
    unsafe {
        let ids = slice_or_empty(ids, num_ids as usize);
        let seeds = match ids.first() {
            Some(&-1) | None => None,
            _ => Some(ids),
        };
        (*graph).is_connected(seeds)
    }
}

/// Whether the given ids are all pose nodes of one flavour.
///
/// # Safety
///
/// Pointer arguments follow the crate-level ABI contract.
#[no_mangle]
pub unsafe extern "C" fn fgo_is_pose_node(
    graph: *const FactorGraph,
    ids: *const i32,
    num_ids: i32,
) -> bool {
    // SAFETY: forwarded caller contract.
    unsafe {
        let ids = slice_or_empty(ids, num_ids as usize);
        (*graph).is_pose_node(ids)
    }
}

/// Bulk-add Gaussian noise model factors. Writes the new factor ids, or the
/// validation sequence (offending ids then `-1`).
///
/// # Safety
///
/// Pointer arguments follow the crate-level ABI contract.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn fgo_add_gaussian_factor(
    graph: *mut FactorGraph,
    factor_type: *const c_char,
    factor_type_len: i32,
    ids: *const i32,
    num_ids: i32,
    measurement: *const f64,
    num_measurement: i32,
    information: *const f64,
    num_information: i32,
    num_factors: i32,
    group_ids: *const i32,
    num_group_ids: i32,
    out: *mut f64,
    out_len: *mut f64,
) {
    // SAFETY: forwarded caller contract.
    unsafe {
        let name = parse_str(factor_type, factor_type_len as usize);
        let Some(factor_type) = FactorType::from_name(name) else {
            write_i32_values(&[-1], out, out_len);
            return;
        };
        let result = (*graph).add_gaussian_factors(
            factor_type,
            slice_or_empty(ids, num_ids as usize),
            slice_or_empty(measurement, num_measurement as usize),
            slice_or_empty(information, num_information as usize),
            num_factors as usize,
            slice_or_empty(group_ids, num_group_ids as usize),
        );
        write_i32_values(&result, out, out_len);
    }
}

/// Bulk-add pinhole camera projection factors with a shared 4x4 row-major
/// sensor transform.
///
/// # Safety
///
/// Pointer arguments follow the crate-level ABI contract; `sensor_transform`
/// must hold 16 values.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn fgo_add_camera_projection_factor(
    graph: *mut FactorGraph,
    ids: *const i32,
    num_ids: i32,
    measurement: *const f64,
    num_measurement: i32,
    information: *const f64,
    num_information: i32,
    num_factors: i32,
    group_ids: *const i32,
    num_group_ids: i32,
    sensor_transform: *const f64,
    out: *mut f64,
    out_len: *mut f64,
) {
    // SAFETY: forwarded caller contract.
    unsafe {
        let result = (*graph).add_camera_projection_factors(
            slice_or_empty(ids, num_ids as usize),
            slice_or_empty(measurement, num_measurement as usize),
            slice_or_empty(information, num_information as usize),
            num_factors as usize,
            slice_or_empty(group_ids, num_group_ids as usize),
            slice_or_empty(sensor_transform, 16),
        );
        write_i32_values(&result, out, out_len);
    }
}

/// Bulk-add distorted pinhole camera projection factors of the named variant.
///
/// # Safety
///
/// Pointer arguments follow the crate-level ABI contract.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn fgo_add_distorted_camera_projection_factor(
    graph: *mut FactorGraph,
    factor_type: *const c_char,
    factor_type_len: i32,
    ids: *const i32,
    num_ids: i32,
    measurement: *const f64,
    num_measurement: i32,
    information: *const f64,
    num_information: i32,
    num_factors: i32,
    intrinsics: *const f64,
    num_intrinsics: i32,
    sensor_transform: *const f64,
    num_sensor_transform: i32,
    group_ids: *const i32,
    num_group_ids: i32,
    out: *mut f64,
    out_len: *mut f64,
) {
    // SAFETY: forwarded caller contract.
    unsafe {
        let name = parse_str(factor_type, factor_type_len as usize);
        let Some(factor_type) = FactorType::from_name(name) else {
            write_i32_values(&[-1], out, out_len);
            return;
        };
        let result = (*graph).add_distorted_camera_projection_factors(
            factor_type,
            slice_or_empty(ids, num_ids as usize),
            slice_or_empty(measurement, num_measurement as usize),
            slice_or_empty(information, num_information as usize),
            num_factors as usize,
            slice_or_empty(intrinsics, num_intrinsics as usize),
            slice_or_empty(sensor_transform, num_sensor_transform as usize),
            slice_or_empty(group_ids, num_group_ids as usize),
        );
        write_i32_values(&result, out, out_len);
    }
}

unsafe fn add_imu_variant(
    graph: *mut FactorGraph,
    variant: ImuVariant,
    ids: *const i32,
    sample_rate: f64,
    gravity: *const f64,
    gyro_bias_noise: *const f64,
    accel_bias_noise: *const f64,
    gyro_noise: *const f64,
    accel_noise: *const f64,
    gyro_readings: *const f64,
    accel_readings: *const f64,
    num_readings: f64,
    group_ids: *const i32,
    num_group_ids: i32,
    sensor_transform: *const f64,
) -> f64 {
    // SAFETY: forwarded caller contract.
    unsafe {
        let params = ImuParameters::from_flat(
            sample_rate,
            slice_or_empty(gravity, 3),
            slice_or_empty(gyro_bias_noise, 9),
            slice_or_empty(accel_bias_noise, 9),
            slice_or_empty(gyro_noise, 9),
            slice_or_empty(accel_noise, 9),
        );
        let readings = num_readings as usize;
        let fid = (*graph).add_imu_factor(
            variant,
            slice_or_empty(ids, variant.num_nodes()),
            params,
            slice_or_empty(gyro_readings, 3 * readings),
            slice_or_empty(accel_readings, 3 * readings),
            slice_or_empty(sensor_transform, 16),
            slice_or_empty(group_ids, num_group_ids as usize),
        );
        f64::from(fid)
    }
}

/// Add one IMU preintegration factor over
/// `[pose_i, vel_i, bias_i, pose_j, vel_j, bias_j]`. Returns the new factor
/// id, or `-1` on a schema mismatch.
///
/// # Safety
///
/// Pointer arguments follow the crate-level ABI contract: `gravity` holds 3
/// values, the four noise matrices 9 each, the reading buffers
/// `3 * num_readings`, `sensor_transform` 16.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn fgo_add_imu_factor(
    graph: *mut FactorGraph,
    ids: *const i32,
    sample_rate: f64,
    gravity: *const f64,
    gyro_bias_noise: *const f64,
    accel_bias_noise: *const f64,
    gyro_noise: *const f64,
    accel_noise: *const f64,
    gyro_readings: *const f64,
    accel_readings: *const f64,
    num_readings: f64,
    group_ids: *const i32,
    num_group_ids: i32,
    sensor_transform: *const f64,
) -> f64 {
    // SAFETY: forwarded caller contract.
    unsafe {
        add_imu_variant(
            graph,
            ImuVariant::Basic,
            ids,
            sample_rate,
            gravity,
            gyro_bias_noise,
            accel_bias_noise,
            gyro_noise,
            accel_noise,
            gyro_readings,
            accel_readings,
            num_readings,
            group_ids,
            num_group_ids,
            sensor_transform,
        )
    }
}

/// As [`fgo_add_imu_factor`] with trailing `[gravity, scale]` nodes.
///
/// # Safety
///
/// See [`fgo_add_imu_factor`].
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn fgo_add_imu_gs_factor(
    graph: *mut FactorGraph,
    ids: *const i32,
    sample_rate: f64,
    gravity: *const f64,
    gyro_bias_noise: *const f64,
    accel_bias_noise: *const f64,
    gyro_noise: *const f64,
    accel_noise: *const f64,
    gyro_readings: *const f64,
    accel_readings: *const f64,
    num_readings: f64,
    group_ids: *const i32,
    num_group_ids: i32,
    sensor_transform: *const f64,
) -> f64 {
    // SAFETY: forwarded caller contract.
    unsafe {
        add_imu_variant(
            graph,
            ImuVariant::GravityScale,
            ids,
            sample_rate,
            gravity,
            gyro_bias_noise,
            accel_bias_noise,
            gyro_noise,
            accel_noise,
            gyro_readings,
            accel_readings,
            num_readings,
            group_ids,
            num_group_ids,
            sensor_transform,
        )
    }
}

/// As [`fgo_add_imu_factor`] with trailing `[gravity, scale, transform]`
/// nodes.
///
/// # Safety
///
/// See [`fgo_add_imu_factor`].
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn fgo_add_imu_gst_factor(
    graph: *mut FactorGraph,
    ids: *const i32,
    sample_rate: f64,
    gravity: *const f64,
    gyro_bias_noise: *const f64,
    accel_bias_noise: *const f64,
    gyro_noise: *const f64,
    accel_noise: *const f64,
    gyro_readings: *const f64,
    accel_readings: *const f64,
    num_readings: f64,
    group_ids: *const i32,
    num_group_ids: i32,
    sensor_transform: *const f64,
) -> f64 {
    // SAFETY: forwarded caller contract.
    unsafe {
        add_imu_variant(
            graph,
            ImuVariant::GravityScaleTransform,
            ids,
            sample_rate,
            gravity,
            gyro_bias_noise,
            accel_bias_noise,
            gyro_noise,
            accel_noise,
            gyro_readings,
            accel_readings,
            num_readings,
            group_ids,
            num_group_ids,
            sensor_transform,
        )
    }
}

/// Remove factors by id; writes the ids of garbage-collected nodes (sorted),
/// or the existence validation sequence.
///
/// # Safety
///
/// Pointer arguments follow the crate-level ABI contract.
#[no_mangle]
pub unsafe extern "C" fn fgo_remove_factor(
    graph: *mut FactorGraph,
    ids: *const i32,
    num_ids: i32,
    out: *mut f64,
    out_len: *mut f64,
) {
    // SAFETY: forwarded caller contract.
    unsafe {
        let ids = slice_or_empty(ids, num_ids as usize);
        let result = (*graph).remove_factors(ids);
        write_i32_values(&result, out, out_len);
    }
}

/// Remove nodes by id; writes `[removed node ids, removed factor ids,
/// removed node count]`, or the existence validation sequence.
///
/// # Safety
///
/// Pointer arguments follow the crate-level ABI contract.
#[no_mangle]
pub unsafe extern "C" fn fgo_remove_node(
    graph: *mut FactorGraph,
    ids: *const i32,
    num_ids: i32,
    out: *mut f64,
    out_len: *mut f64,
) {
    // SAFETY: forwarded caller contract.
    unsafe {
        let ids = slice_or_empty(ids, num_ids as usize);
        let result = (*graph).remove_nodes(ids);
        write_i32_values(&result, out, out_len);
    }
}

/// Marginalize a factor set; writes `[marginal factor id, eliminated node
/// ids]`, or the failure sentinels (`-1` sequence, `[-2]`, `[fixed, -3]`).
///
/// # Safety
///
/// Pointer arguments follow the crate-level ABI contract.
#[no_mangle]
pub unsafe extern "C" fn fgo_marginalize_factor(
    graph: *mut FactorGraph,
    ids: *const i32,
    num_ids: i32,
    out: *mut f64,
    out_len: *mut f64,
) {
    // SAFETY: forwarded caller contract.
    unsafe {
        let ids = slice_or_empty(ids, num_ids as usize);
        let result = (*graph).marginalize_factors(ids);
        write_i32_values(&result, out, out_len);
    }
}

/// Marginalize one node; writes `[marginal factor id, eliminated node ids,
/// removed factor ids, eliminated node count]`, or the failure sentinels.
///
/// # Safety
///
/// Pointer arguments follow the crate-level ABI contract.
#[no_mangle]
pub unsafe extern "C" fn fgo_marginalize_node(
    graph: *mut FactorGraph,
    id: i32,
    out: *mut f64,
    out_len: *mut f64,
) {
    // SAFETY: forwarded caller contract.
    unsafe {
        let result = (*graph).marginalize_node(id);
        write_i32_values(&result, out, out_len);
    }
}

/// Decode the flat solver-options vector:
/// `[max_iters, fn_tol, grad_tol, step_tol, verbosity, trust_region_strategy,
/// covariance_type_count, covariance_type_ids..., initial_trust_region_radius]`.
fn decode_options(opts: &[f64]) -> OptimizeOptions {
    let mut options = OptimizeOptions::default();
    options.solver.max_num_iterations = opts[0] as usize;
    options.solver.function_tolerance = opts[1];
    options.solver.gradient_tolerance = opts[2];
    options.solver.step_tolerance = opts[3];
    options.solver.verbosity_level = opts[4] as u8;
    options.solver.trust_region_strategy_type =
        TrustRegionStrategyType::from_wire(opts[5] as i32);
    let covariance_count = opts[6] as usize;
    options.covariance_type = opts[7..7 + covariance_count]
        .iter()
        .map(|&v| v as i32)
        .collect();
    if options.covariance_type.is_empty() {
        options.covariance_type.push(COVARIANCE_NONE);
    }
    options.solver.initial_trust_region_radius = opts[7 + covariance_count];
    options
}

/// Optimize the graph.
///
/// `opts` is the flat options vector documented at [`decode_options`]; a
/// leading seed id of `-1` optimizes the full graph. `info` receives
/// `[initial_cost, final_cost, successful_steps, unsuccessful_steps,
/// total_time_seconds, termination_type, is_solution_usable]`; the optimized
/// and fixed node id lists are written to their own buffers.
///
/// # Safety
///
/// Pointer arguments follow the crate-level ABI contract; `info` must hold 7
/// values and the id outputs as many values as nodes in the graph.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn fgo_optimize(
    graph: *mut FactorGraph,
    opts: *const f64,
    num_opts: i32,
    info: *mut f64,
    ids: *const i32,
    num_ids: i32,
    optimized_ids: *mut f64,
    optimized_ids_len: *mut f64,
    fixed_ids: *mut f64,
    fixed_ids_len: *mut f64,
) {
    // SAFETY: forwarded caller contract.
    unsafe {
        let opts = slice_or_empty(opts, num_opts as usize);
        let options = decode_options(opts);
        let ids = slice_or_empty(ids, num_ids as usize);
        let seeds = match ids.first() {
            Some(&-1) | None => None,
            _ => Some(ids),
        };

        match (*graph).optimize(&options, seeds) {
            Ok(solution) => {
                let info_values = [
                    solution.initial_cost,
                    solution.final_cost,
                    solution.num_successful_steps as f64,
                    solution.num_unsuccessful_steps as f64,
                    solution.total_time_in_seconds,
                    f64::from(solution.termination_type.as_wire()),
                    f64::from(u8::from(solution.is_solution_usable)),
                ];
                for (k, v) in info_values.iter().enumerate() {
                    *info.add(k) = *v;
                }
                write_i32_values(&solution.optimized_node_ids, optimized_ids, optimized_ids_len);
                write_i32_values(&solution.fixed_node_ids, fixed_ids, fixed_ids_len);
            }
            Err(_) => {
                // Engine-internal failure: report an unusable solution.
                for k in 0..7 {
                    *info.add(k) = if k == 5 { 2.0 } else { 0.0 };
                }
                write_i32_values(&[], optimized_ids, optimized_ids_len);
                write_i32_values(&[], fixed_ids, fixed_ids_len);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;

    use super::*;

    fn eye(n: usize) -> Vec<f64> {
        let mut m = vec![0.0; n * n];
        for i in 0..n {
            m[i * n + i] = 1.0;
        }
        m
    }

    unsafe fn add_between(graph: *mut FactorGraph, a: i32, b: i32, meas: [f64; 3]) -> Vec<f64> {
        let name = "Two_SE2_F";
        let ids = [a, b];
        let info = eye(3);
        let groups = [-1];
        let mut out = [0.0; 4];
        let mut out_len = 0.0;
        fgo_add_gaussian_factor(
            graph,
            name.as_ptr().cast(),
            name.len() as i32,
            ids.as_ptr(),
            2,
            meas.as_ptr(),
            3,
            info.as_ptr(),
            9,
            1,
            groups.as_ptr(),
            1,
            out.as_mut_ptr(),
            &mut out_len,
        );
        out[..out_len as usize].to_vec()
    }

    #[test]
    fn construct_add_query_destroy() {
        unsafe {
            let graph = fgo_construct_factor_graph();
            let fids = add_between(graph, 1, 2, [1.0, 0.0, 0.0]);
            assert_eq!(fids, vec![0.0]);
            assert_relative_eq!(fgo_get_num_nodes(graph), 2.0);
            assert_relative_eq!(fgo_get_num_factors(graph), 1.0);
            assert!(fgo_has_node(graph, 1.0));
            assert!(!fgo_has_node(graph, 9.0));

            let mut type_buf = [0 as c_char; 80];
            let mut type_len = 0.0;
            fgo_get_node_type(graph, 1.0, type_buf.as_mut_ptr(), &mut type_len);
            let name: Vec<u8> = type_buf[..type_len as usize]
                .iter()
                .map(|&c| c as u8)
                .collect();
            assert_eq!(std::str::from_utf8(&name).unwrap(), "POSE_SE2");

            fgo_destruct_factor_graph(graph);
        }
    }

    #[test]
    fn state_roundtrip_through_the_wire() {
        unsafe {
            let graph = fgo_construct_factor_graph();
            add_between(graph, 1, 2, [1.0, 0.0, 0.0]);

            let ids = [1i32, 2];
            let state = [0.1, 0.2, 0.3, 0.4, 0.5, 0.6];
            let mut out = [0.0; 8];
            let mut out_len = 0.0;
            fgo_set_node_state(
                graph,
                ids.as_ptr(),
                2,
                state.as_ptr(),
                3,
                out.as_mut_ptr(),
                &mut out_len,
            );
            assert_eq!(&out[..out_len as usize], &[1.0, 1.0]);

            let mut read = [0.0; 8];
            let mut read_len = 0.0;
            fgo_get_node_state(graph, ids.as_ptr(), 2, read.as_mut_ptr(), &mut read_len);
            assert_relative_eq!(read_len, 6.0);
            assert_eq!(&read[..6], &state);

            fgo_destruct_factor_graph(graph);
        }
    }

    #[test]
    fn optimize_through_the_wire() {
        unsafe {
            let graph = fgo_construct_factor_graph();
            // Prior + odometry.
            let name = "SE2_Prior_F";
            let prior_ids = [1i32];
            let prior_meas = [0.0, 0.0, 0.0];
            let info3 = eye(3);
            let groups = [-1];
            let mut out = [0.0; 4];
            let mut out_len = 0.0;
            fgo_add_gaussian_factor(
                graph,
                name.as_ptr().cast(),
                name.len() as i32,
                prior_ids.as_ptr(),
                1,
                prior_meas.as_ptr(),
                3,
                info3.as_ptr(),
                9,
                1,
                groups.as_ptr(),
                1,
                out.as_mut_ptr(),
                &mut out_len,
            );
            add_between(graph, 1, 2, [1.0, 0.0, 0.0]);

            // [max_iters, f_tol, g_tol, s_tol, verbosity, strategy,
            //  cov_count, cov_ids..., radius]
            let opts = [200.0, 1e-6, 1e-10, 1e-8, 0.0, 1.0, 1.0, -1.0, 1e4];
            let seeds = [-1i32];
            let mut info = [0.0; 7];
            let mut optimized = [0.0; 8];
            let mut optimized_len = 0.0;
            let mut fixed = [0.0; 8];
            let mut fixed_len = 0.0;
            fgo_optimize(
                graph,
                opts.as_ptr(),
                opts.len() as i32,
                info.as_mut_ptr(),
                seeds.as_ptr(),
                1,
                optimized.as_mut_ptr(),
                &mut optimized_len,
                fixed.as_mut_ptr(),
                &mut fixed_len,
            );

            // Converged, usable, both nodes optimized.
            assert_relative_eq!(info[5], 0.0);
            assert_relative_eq!(info[6], 1.0);
            assert!(info[1] < 1e-10);
            assert_relative_eq!(optimized_len, 2.0);
            assert_relative_eq!(fixed_len, 0.0);

            let ids = [2i32];
            let mut read = [0.0; 4];
            let mut read_len = 0.0;
            fgo_get_node_state(graph, ids.as_ptr(), 1, read.as_mut_ptr(), &mut read_len);
            assert_relative_eq!(read[0], 1.0, epsilon = 1e-6);

            fgo_destruct_factor_graph(graph);
        }
    }

    #[test]
    fn marginalize_through_the_wire() {
        unsafe {
            let graph = fgo_construct_factor_graph();
            let name = "SE2_Prior_F";
            let prior_ids = [1i32];
            let prior_meas = [0.0, 0.0, 0.0];
            let info3 = eye(3);
            let groups = [-1];
            let mut out = [0.0; 4];
            let mut out_len = 0.0;
            fgo_add_gaussian_factor(
                graph,
                name.as_ptr().cast(),
                name.len() as i32,
                prior_ids.as_ptr(),
                1,
                prior_meas.as_ptr(),
                3,
                info3.as_ptr(),
                9,
                1,
                groups.as_ptr(),
                1,
                out.as_mut_ptr(),
                &mut out_len,
            );
            add_between(graph, 1, 2, [1.0, 0.0, 0.0]);
            add_between(graph, 2, 3, [1.0, 0.0, 0.0]);
            add_between(graph, 3, 4, [1.0, 0.0, 0.0]);

            let mut result = [0.0; 8];
            let mut result_len = 0.0;
            fgo_marginalize_node(graph, 2, result.as_mut_ptr(), &mut result_len);
            // [marginal id, eliminated node 2, removed factors 1 and 2,
            //  eliminated count 1]
            assert_relative_eq!(result_len, 5.0);
            assert_relative_eq!(result[1], 2.0);
            assert_relative_eq!(*result[..result_len as usize].last().unwrap(), 1.0);
            assert_relative_eq!(fgo_get_num_factors(graph), 3.0);

            fgo_destruct_factor_graph(graph);
        }
    }
}
