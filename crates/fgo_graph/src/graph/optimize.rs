//! Problem assembly and the optimization driver.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::Arc,
};

use fgo_linalg::Float;
use fgo_solver::{Covariance, Manifold, Problem, SolverOptions, TerminationType};
use tracing::debug;

use crate::{
    factor::{FactorId, FactorType},
    parameterization::manifold_for,
    variable::{NodeId, VariableType},
};

use super::{FactorGraph, GraphError};

/// Covariance request code meaning "no covariance".
pub const COVARIANCE_NONE: i32 = -1;
/// Covariance request code meaning "every node the request reaches".
pub const COVARIANCE_ALL: i32 = -2;

/// Options for one `optimize` call: the solver configuration plus the
/// covariance request (`[-1]` none, `[-2]` everything reachable, otherwise
/// node-type codes).
#[derive(Debug, Clone)]
pub struct OptimizeOptions {
    pub solver: SolverOptions,
    pub covariance_type: Vec<i32>,
}

impl Default for OptimizeOptions {
    fn default() -> Self {
        Self {
            solver: SolverOptions::new(),
            covariance_type: vec![COVARIANCE_NONE],
        }
    }
}

/// A brief summary of the state of the solver after optimization, plus which
/// nodes took part.
#[derive(Debug, Clone)]
pub struct SolutionInfo {
    pub initial_cost: Float,
    pub final_cost: Float,
    pub num_successful_steps: usize,
    pub num_unsuccessful_steps: usize,
    pub total_time_in_seconds: Float,
    pub termination_type: TerminationType,
    pub message: String,
    /// Whether the state written back by the solver is numerically sane.
    pub is_solution_usable: bool,
    /// Node ids optimized by this call, ascending.
    pub optimized_node_ids: Vec<NodeId>,
    /// Node ids held fixed by this call, ascending.
    pub fixed_node_ids: Vec<NodeId>,
}

impl FactorGraph {
    /// Optimize the graph, using the current variable states as the initial
    /// guess and writing the optimized result back in place.
    ///
    /// `seeds` of `None` optimizes the full graph. A list of pose-node seed
    /// ids optimizes the partial graph they induce: between-pose factors and
    /// IMU factors join only when all their pose endpoints are seeds,
    /// marginal factors only when all their retained pose nodes are seeds,
    /// any other factor when it touches a seed. Velocity and bias priors
    /// whose node was pulled in by the first pass are then added to preserve
    /// their regularisation.
    pub fn optimize(
        &mut self,
        options: &OptimizeOptions,
        seeds: Option<&[NodeId]>,
    ) -> Result<SolutionInfo, GraphError> {
        let included: Vec<FactorId> = match seeds {
            None => self.factors.keys().copied().collect(),
            Some(seed_ids) => self.partial_factor_ids(seed_ids),
        };
        if included.is_empty() {
            // Nothing to optimize; report a trivially converged solution.
            return Ok(SolutionInfo {
                initial_cost: 0.0,
                final_cost: 0.0,
                num_successful_steps: 0,
                num_unsuccessful_steps: 0,
                total_time_in_seconds: 0.0,
                termination_type: TerminationType::Convergence,
                message: "No factors selected; nothing to optimize.".to_owned(),
                is_solution_usable: true,
                optimized_node_ids: Vec::new(),
                fixed_node_ids: Vec::new(),
            });
        }

        // Give bias-sensitive factors a chance to refresh their cached
        // linearization before the solver consumes them.
        for &fid in &included {
            let params = {
                let factor = self.factors[&fid].as_ref();
                self.gather_factor_params(factor)
            };
            let views: Vec<&[Float]> = params.iter().map(Vec::as_slice).collect();
            if let Some(factor) = self.factors.get_mut(&fid) {
                factor.pre_optimization_update(&views);
            }
        }

        let mut problem = Problem::new();
        // One parameterization object per variable type, shared by all
        // parameter blocks of that type and dropped when this call returns.
        let mut manifolds: HashMap<VariableType, Arc<dyn Manifold>> = HashMap::new();
        let mut optimized_ids: BTreeSet<NodeId> = BTreeSet::new();
        let mut fixed_ids: BTreeSet<NodeId> = BTreeSet::new();

        for &fid in &included {
            let factor = self.factors[&fid].as_ref();
            let mut blocks = Vec::with_capacity(factor.variable_ids().len());
            for &id in factor.variable_ids() {
                let var_type = self
                    .variables
                    .var_type(id)
                    .expect("factor variables exist in the registry");
                let manifold = Arc::clone(
                    manifolds
                        .entry(var_type)
                        .or_insert_with(|| manifold_for(var_type)),
                );
                let offset = self
                    .variables
                    .offset(id)
                    .expect("factor variables exist in the registry");
                let block =
                    problem.add_parameter_block(offset, var_type.dim(), Some(manifold))?;
                if self.variables.is_fixed(id) == Some(true) {
                    problem.set_parameter_block_constant(block);
                    fixed_ids.insert(id);
                } else {
                    problem.set_parameter_block_variable(block);
                    optimized_ids.insert(id);
                }
                blocks.push(block);
            }
            problem.add_residual_block(
                factor.create_cost_function(),
                factor.create_loss_function(),
                &blocks,
            )?;
        }

        let mut solver_options = options.solver.clone();
        // The ordering hint arrives keyed by node id; the solver speaks pool
        // offsets.
        let ordering = std::mem::take(&mut solver_options.linear_solver_ordering);
        solver_options.linear_solver_ordering = ordering
            .into_iter()
            .filter_map(|(id, group)| {
                let id = NodeId::try_from(id).ok()?;
                self.variables.offset(id).map(|offset| (offset, group))
            })
            .collect();

        let summary = fgo_solver::solve(&solver_options, &problem, self.variables.pool_mut())?;
        if options.solver.verbosity_level >= 1 {
            println!(
                "solver terminated: {} (initial cost {:.6e}, final cost {:.6e}, {} successful / {} unsuccessful steps, {:.3}s)",
                summary.message,
                summary.initial_cost,
                summary.final_cost,
                summary.num_successful_steps,
                summary.num_unsuccessful_steps,
                summary.total_time_in_seconds,
            );
        }

        if summary.termination_type != TerminationType::Failure
            && options.covariance_type.first() != Some(&COVARIANCE_NONE)
            && !options.covariance_type.is_empty()
        {
            self.recover_covariances(&mut problem, &options.covariance_type, seeds)?;
        }

        Ok(SolutionInfo {
            initial_cost: summary.initial_cost,
            final_cost: summary.final_cost,
            num_successful_steps: summary.num_successful_steps,
            num_unsuccessful_steps: summary.num_unsuccessful_steps,
            total_time_in_seconds: summary.total_time_in_seconds,
            is_solution_usable: summary.is_solution_usable(),
            termination_type: summary.termination_type,
            message: summary.message,
            optimized_node_ids: optimized_ids.into_iter().collect(),
            fixed_node_ids: fixed_ids.into_iter().collect(),
        })
    }

    /// Whether a factor stays out of the pose-seeded partial graph.
    pub(crate) fn excluded_from_partial_graph(&self, fid: FactorId, seeds: &[NodeId]) -> bool {
        let factor_type = self.factor_types[&fid];
        let var_ids = self.factors[&fid].variable_ids();
        if factor_type.is_between_poses() {
            return var_ids.iter().any(|id| !seeds.contains(id));
        }
        match factor_type {
            FactorType::Imu => {
                !seeds.contains(&var_ids[0]) || !seeds.contains(&var_ids[3])
            }
            FactorType::Marginal => var_ids.iter().any(|id| {
                self.variables
                    .var_type(*id)
                    .is_some_and(VariableType::is_pose)
                    && !seeds.contains(id)
            }),
            _ => false,
        }
    }

    /// First pass of partial-graph selection: walk the seeds' incident
    /// factors, applying the exclusion rules; second pass: pull in velocity
    /// and IMU-bias priors whose node is already included.
    pub(crate) fn partial_factor_ids(&self, seeds: &[NodeId]) -> Vec<FactorId> {
        let mut included = Vec::new();
        let mut seen: HashSet<FactorId> = HashSet::new();
        for &seed in seeds {
            let Some(incident) = self.node_to_factors.get(&seed) else {
                continue;
            };
            for &fid in incident {
                if !seen.insert(fid) {
                    continue;
                }
                if self.excluded_from_partial_graph(fid, seeds) {
                    continue;
                }
                included.push(fid);
            }
        }

        let included_nodes: HashSet<NodeId> = included
            .iter()
            .flat_map(|fid| self.factors[fid].variable_ids().iter().copied())
            .collect();
        for (prior_type, node_type) in [
            (FactorType::Vel3Prior, VariableType::Vel3),
            (FactorType::ImuBiasPrior, VariableType::ImuBias),
        ] {
            let Some(nodes) = self
                .factor_type_index
                .get(&prior_type)
                .and_then(|node_map| node_map.get(&node_type))
            else {
                continue;
            };
            for &node in nodes {
                if !included_nodes.contains(&node) {
                    continue;
                }
                let Some(incident) = self.node_to_factors.get(&node) else {
                    continue;
                };
                for &fid in incident {
                    if self.factor_types[&fid] == prior_type && seen.insert(fid) {
                        included.push(fid);
                    }
                }
            }
        }
        included
    }

    /// All node ids in the partial graph induced by pose-node seeds (the
    /// seeds plus every variable of every included factor). Empty when any
    /// seed is not a pose node.
    pub(crate) fn partial_graph_node_set(&self, seeds: &[NodeId]) -> BTreeSet<NodeId> {
        let mut nodes = BTreeSet::new();
        if !self.is_pose_node(seeds) {
            return nodes;
        }
        nodes.extend(seeds.iter().copied());
        let mut seen: HashSet<FactorId> = HashSet::new();
        for &seed in seeds {
            let Some(incident) = self.node_to_factors.get(&seed) else {
                continue;
            };
            for &fid in incident {
                if !seen.insert(fid) || self.excluded_from_partial_graph(fid, seeds) {
                    continue;
                }
                nodes.extend(self.factors[&fid].variable_ids().iter().copied());
            }
        }
        nodes
    }

    /// Expand a covariance request into concrete node ids.
    pub(crate) fn covariance_node_ids(
        &self,
        covariance_type: &[i32],
        seeds: Option<&[NodeId]>,
    ) -> BTreeSet<NodeId> {
        let mut out = BTreeSet::new();
        match seeds {
            None => {
                for &code in covariance_type {
                    if code == COVARIANCE_NONE {
                        return BTreeSet::new();
                    }
                    if code == COVARIANCE_ALL {
                        out.extend(self.variables.ids());
                    } else if let Some(var_type) = VariableType::from_wire(code) {
                        out.extend(self.get_node_ids(None, Some(var_type), None));
                    }
                }
            }
            Some(seed_ids) => {
                if covariance_type.first() == Some(&COVARIANCE_NONE) {
                    return BTreeSet::new();
                }
                let reachable = self.partial_graph_node_set(seed_ids);
                for &code in covariance_type {
                    if code == COVARIANCE_ALL {
                        return reachable;
                    }
                    if let Some(var_type) = VariableType::from_wire(code) {
                        out.extend(
                            self.get_node_ids(None, Some(var_type), None)
                                .into_iter()
                                .filter(|id| reachable.contains(id)),
                        );
                    }
                }
            }
        }
        out
    }

    fn recover_covariances(
        &mut self,
        problem: &mut Problem,
        covariance_type: &[i32],
        seeds: Option<&[NodeId]>,
    ) -> Result<(), GraphError> {
        let node_ids = self.covariance_node_ids(covariance_type, seeds);
        if node_ids.is_empty() {
            return Ok(());
        }
        if node_ids.len() > 100 {
            println!(
                "Optimization completed. Estimating node state covariance for {} nodes may take additional time.",
                node_ids.len()
            );
        }

        let mut blocks = Vec::with_capacity(node_ids.len());
        let mut block_nodes = Vec::with_capacity(node_ids.len());
        for &id in &node_ids {
            let (Some(offset), Some(dim)) = (self.variables.offset(id), self.variables.dim(id))
            else {
                continue;
            };
            blocks.push(problem.add_parameter_block(offset, dim, None)?);
            block_nodes.push(id);
        }

        let computed = Covariance::new().compute(problem, self.variables.pool(), &blocks)?;
        for (block, id) in blocks.iter().zip(block_nodes) {
            if let Some(matrix) = computed.get(block) {
                self.covariances.insert(id, matrix.clone());
            }
        }
        debug!(count = blocks.len(), "stored node covariances");
        Ok(())
    }
}
