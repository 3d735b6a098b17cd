use std::{sync::atomic::Ordering, time::Instant};

use fgo_linalg::{Float, Matrix, Vector};
use tracing::debug;

use crate::{
    problem::ActiveLayout, DoglegType, LineSearchDirectionType, LineSearchType, MinimizerType,
    Problem, Result, SolverError, SolverOptions, Summary, TerminationType,
    TrustRegionStrategyType,
};

const MIN_TRUST_REGION_RADIUS: Float = 1e-32;
const MAX_TRUST_REGION_RADIUS: Float = 1e16;
const MIN_RELATIVE_DECREASE: Float = 1e-4;
const MIN_LM_DIAGONAL: Float = 1e-6;
const MAX_LM_DIAGONAL: Float = 1e32;
const ARMIJO_C1: Float = 1e-4;
const WOLFE_C2: Float = 0.9;
const LBFGS_MEMORY: usize = 20;

/// Minimize the problem's objective, reading the initial state from `pool`
/// and writing the final iterate back into it.
///
/// The returned [`Summary`] always reflects what happened; recoverable
/// outcomes (non-convergence, cooperative aborts) are reported there rather
/// than as errors.
pub fn solve(options: &SolverOptions, problem: &Problem, pool: &mut [Float]) -> Result<Summary> {
    if problem.num_residual_blocks() == 0 {
        return Err(SolverError::EmptyProblem);
    }
    problem.check_pool(pool)?;

    let start = Instant::now();
    let layout = problem.active_layout();
    let mut driver = Driver {
        options,
        problem,
        layout: &layout,
        num_successful_steps: 0,
        num_unsuccessful_steps: 0,
    };

    let outcome = if layout.num_cols == 0 {
        // Every block is held constant; report the current cost.
        let cost = problem.cost(pool)?;
        Outcome {
            x: pool.to_vec(),
            initial_cost: cost,
            final_cost: cost,
            termination_type: TerminationType::Convergence,
            message: "No free parameter blocks; nothing to optimize.".to_owned(),
        }
    } else {
        match options.minimizer_type {
            MinimizerType::TrustRegion => driver.trust_region(pool)?,
            MinimizerType::LineSearch => driver.line_search(pool)?,
        }
    };

    pool.copy_from_slice(&outcome.x);
    let summary = Summary {
        initial_cost: outcome.initial_cost,
        final_cost: outcome.final_cost,
        num_successful_steps: driver.num_successful_steps,
        num_unsuccessful_steps: driver.num_unsuccessful_steps,
        total_time_in_seconds: start.elapsed().as_secs_f64(),
        termination_type: outcome.termination_type,
        message: outcome.message,
    };
    debug!(
        initial_cost = summary.initial_cost,
        final_cost = summary.final_cost,
        termination = ?summary.termination_type,
        "solver finished"
    );
    Ok(summary)
}

struct Outcome {
    x: Vec<Float>,
    initial_cost: Float,
    final_cost: Float,
    termination_type: TerminationType,
    message: String,
}

struct Driver<'a> {
    options: &'a SolverOptions,
    problem: &'a Problem,
    layout: &'a ActiveLayout,
    num_successful_steps: usize,
    num_unsuccessful_steps: usize,
}

impl Driver<'_> {
    fn aborted(&self) -> bool {
        self.options
            .abort
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    fn log_iteration(&self, iteration: usize, cost: Float, gradient_max: Float, radius: Float) {
        if self.options.verbosity_level >= 2 {
            println!(
                "iter {iteration:>3}  cost {cost:.6e}  |g| {gradient_max:.3e}  tr_radius {radius:.3e}"
            );
        }
    }

    fn trust_region(&mut self, pool: &[Float]) -> Result<Outcome> {
        let problem = self.problem;
        let layout = self.layout;
        let options = self.options;

        let mut x = pool.to_vec();
        let mut eval = problem.evaluate(&x, layout)?;
        let initial_cost = eval.cost;
        let mut cost = initial_cost;
        let mut radius = options.initial_trust_region_radius;

        let finish = |x: Vec<Float>, cost, tt, message: String| Outcome {
            x,
            initial_cost,
            final_cost: cost,
            termination_type: tt,
            message,
        };

        for iteration in 0..options.max_num_iterations {
            if self.aborted() {
                return Ok(finish(
                    x,
                    cost,
                    TerminationType::UserSuccess,
                    "Terminated by user callback.".to_owned(),
                ));
            }
            let gradient_max = eval.gradient.amax();
            self.log_iteration(iteration, cost, gradient_max, radius);
            if gradient_max <= options.gradient_tolerance {
                return Ok(finish(
                    x,
                    cost,
                    TerminationType::Convergence,
                    format!("Gradient tolerance reached: {gradient_max:.3e}"),
                ));
            }

            let hessian = eval.jacobian.transpose() * &eval.jacobian;
            let step = match options.trust_region_strategy_type {
                TrustRegionStrategyType::LevenbergMarquardt => {
                    levenberg_marquardt_step(&hessian, &eval.gradient, radius)
                }
                TrustRegionStrategyType::Dogleg => {
                    dogleg_step(&hessian, &eval.gradient, radius, options.dogleg_type)
                }
            };
            let Some(step) = step else {
                return Ok(finish(
                    x,
                    cost,
                    TerminationType::Failure,
                    "Linear solver failure while computing trust region step.".to_owned(),
                ));
            };

            let candidate = problem.plus(&x, &step, layout);
            let new_cost = problem.cost(&candidate)?;
            let model_decrease =
                -(eval.gradient.dot(&step) + 0.5 * (&hessian * &step).dot(&step));
            let relative_decrease = if model_decrease > 0.0 {
                (cost - new_cost) / model_decrease
            } else {
                -1.0
            };

            if new_cost.is_finite() && relative_decrease > MIN_RELATIVE_DECREASE {
                self.num_successful_steps += 1;
                let step_norm = step.norm();
                let x_norm = problem.state_norm(&candidate, layout);
                let cost_change = cost - new_cost;

                x = candidate;
                cost = new_cost;

                radius /= (1.0 - (2.0 * relative_decrease - 1.0).powi(3)).max(1.0 / 3.0);
                radius = radius.min(MAX_TRUST_REGION_RADIUS);

                if cost_change.abs() <= options.function_tolerance * cost.max(Float::MIN_POSITIVE) {
                    return Ok(finish(
                        x,
                        cost,
                        TerminationType::Convergence,
                        format!("Function tolerance reached: |dcost| = {:.3e}", cost_change.abs()),
                    ));
                }
                if step_norm <= (x_norm + options.step_tolerance) * options.step_tolerance {
                    return Ok(finish(
                        x,
                        cost,
                        TerminationType::Convergence,
                        format!("Step tolerance reached: |step| = {step_norm:.3e}"),
                    ));
                }

                eval = problem.evaluate(&x, layout)?;
            } else {
                self.num_unsuccessful_steps += 1;
                radius *= 0.5;
                if radius < MIN_TRUST_REGION_RADIUS {
                    return Ok(finish(
                        x,
                        cost,
                        TerminationType::Convergence,
                        "Trust region radius fell below its minimum.".to_owned(),
                    ));
                }
            }
        }

        Ok(finish(
            x,
            cost,
            TerminationType::NoConvergence,
            "Maximum number of iterations reached.".to_owned(),
        ))
    }

    fn line_search(&mut self, pool: &[Float]) -> Result<Outcome> {
        let problem = self.problem;
        let layout = self.layout;
        let options = self.options;

        let mut x = pool.to_vec();
        let mut eval = problem.evaluate(&x, layout)?;
        let initial_cost = eval.cost;
        let mut cost = initial_cost;

        let n = layout.num_cols;
        let mut prev_gradient: Option<Vector> = None;
        let mut prev_direction: Option<Vector> = None;
        let mut bfgs_inverse = Matrix::identity(n, n);
        let mut lbfgs_history: Vec<(Vector, Vector)> = Vec::new();

        let finish = |x: Vec<Float>, cost, tt, message: String| Outcome {
            x,
            initial_cost,
            final_cost: cost,
            termination_type: tt,
            message,
        };

        for iteration in 0..options.max_num_iterations {
            if self.aborted() {
                return Ok(finish(
                    x,
                    cost,
                    TerminationType::UserSuccess,
                    "Terminated by user callback.".to_owned(),
                ));
            }
            let gradient_max = eval.gradient.amax();
            self.log_iteration(iteration, cost, gradient_max, 0.0);
            if gradient_max <= options.gradient_tolerance {
                return Ok(finish(
                    x,
                    cost,
                    TerminationType::Convergence,
                    format!("Gradient tolerance reached: {gradient_max:.3e}"),
                ));
            }

            let mut direction = match options.line_search_direction_type {
                LineSearchDirectionType::SteepestDescent => -&eval.gradient,
                LineSearchDirectionType::NonlinearConjugateGradient => {
                    match (&prev_gradient, &prev_direction) {
                        (Some(g_prev), Some(d_prev)) => {
                            // Polak-Ribiere with automatic restart.
                            let beta = eval.gradient.dot(&(&eval.gradient - g_prev))
                                / g_prev.norm_squared().max(Float::MIN_POSITIVE);
                            -&eval.gradient + d_prev * beta.max(0.0)
                        }
                        _ => -&eval.gradient,
                    }
                }
                LineSearchDirectionType::Bfgs => -(&bfgs_inverse * &eval.gradient),
                LineSearchDirectionType::Lbfgs => {
                    lbfgs_direction(&eval.gradient, &lbfgs_history)
                }
            };
            if direction.dot(&eval.gradient) >= 0.0 {
                direction = -&eval.gradient;
            }

            let slope = eval.gradient.dot(&direction);
            let initial_step = if iteration == 0 {
                (1.0 / eval.gradient.amax().max(Float::MIN_POSITIVE)).min(1.0)
            } else {
                1.0
            };
            let Some((step_size, candidate, new_cost)) = self.search_step(
                &x, cost, slope, &direction, initial_step,
            )?
            else {
                self.num_unsuccessful_steps += 1;
                return Ok(finish(
                    x,
                    cost,
                    TerminationType::NoConvergence,
                    "Line search failed to find a decreasing step.".to_owned(),
                ));
            };
            self.num_successful_steps += 1;

            let step = &direction * step_size;
            let step_norm = step.norm();
            let x_norm = problem.state_norm(&candidate, layout);
            let cost_change = cost - new_cost;

            x = candidate;
            cost = new_cost;
            let new_eval = problem.evaluate(&x, layout)?;

            // Curvature pair for the quasi-Newton directions.
            let y = &new_eval.gradient - &eval.gradient;
            let sy = step.dot(&y);
            if sy > 1e-10 {
                match options.line_search_direction_type {
                    LineSearchDirectionType::Bfgs => {
                        let rho = 1.0 / sy;
                        let identity = Matrix::identity(n, n);
                        let left = &identity - (&step * y.transpose()) * rho;
                        let right = &identity - (&y * step.transpose()) * rho;
                        bfgs_inverse =
                            &left * bfgs_inverse * &right + (&step * step.transpose()) * rho;
                    }
                    LineSearchDirectionType::Lbfgs => {
                        lbfgs_history.push((step.clone(), y));
                        if lbfgs_history.len() > LBFGS_MEMORY {
                            lbfgs_history.remove(0);
                        }
                    }
                    _ => {}
                }
            }
            prev_gradient = Some(eval.gradient.clone());
            prev_direction = Some(direction);
            eval = new_eval;

            if cost_change.abs() <= options.function_tolerance * cost.max(Float::MIN_POSITIVE) {
                return Ok(finish(
                    x,
                    cost,
                    TerminationType::Convergence,
                    format!("Function tolerance reached: |dcost| = {:.3e}", cost_change.abs()),
                ));
            }
            if step_norm <= (x_norm + options.step_tolerance) * options.step_tolerance {
                return Ok(finish(
                    x,
                    cost,
                    TerminationType::Convergence,
                    format!("Step tolerance reached: |step| = {step_norm:.3e}"),
                ));
            }
        }

        Ok(finish(
            x,
            cost,
            TerminationType::NoConvergence,
            "Maximum number of iterations reached.".to_owned(),
        ))
    }

    /// Find a step size along `direction` satisfying the configured
    /// sufficient-decrease condition. Returns the step size, the accepted
    /// state and its cost, or `None` when no acceptable step exists.
    fn search_step(
        &self,
        x: &[Float],
        cost: Float,
        slope: Float,
        direction: &Vector,
        initial_step: Float,
    ) -> Result<Option<(Float, Vec<Float>, Float)>> {
        let problem = self.problem;
        let layout = self.layout;
        let mut step = initial_step;
        let mut lo = 0.0;
        let mut hi = Float::INFINITY;

        for _ in 0..40 {
            let candidate = problem.plus(x, &(direction * step), layout);
            let new_cost = problem.cost(&candidate)?;
            let armijo_ok = new_cost.is_finite() && new_cost <= cost + ARMIJO_C1 * step * slope;
            if !armijo_ok {
                hi = step;
                step = 0.5 * (lo + hi);
                continue;
            }
            if matches!(self.options.line_search_type, LineSearchType::Wolfe) {
                let trial_eval = problem.evaluate(&candidate, layout)?;
                let curvature = trial_eval.gradient.dot(direction);
                if curvature < WOLFE_C2 * slope {
                    // Step too short; move the lower bracket up.
                    lo = step;
                    step = if hi.is_finite() { 0.5 * (lo + hi) } else { 2.0 * step };
                    continue;
                }
            }
            return Ok(Some((step, candidate, new_cost)));
        }
        Ok(None)
    }
}

/// Solve `(H + D(radius)) step = -g` with the Levenberg-Marquardt diagonal
/// regularizer `D = diag(H) / radius`, clamped elementwise.
fn levenberg_marquardt_step(hessian: &Matrix, gradient: &Vector, radius: Float) -> Option<Vector> {
    let n = hessian.nrows();
    let mut damped = hessian.clone();
    for i in 0..n {
        let d = hessian[(i, i)].clamp(MIN_LM_DIAGONAL, MAX_LM_DIAGONAL);
        damped[(i, i)] += d / radius;
    }
    solve_spd(&damped, &(-gradient))
}

/// Traditional dogleg: interpolate between the Cauchy point and the
/// Gauss-Newton point inside the trust region. The subspace variant shares
/// the same step; the two-dimensional refinement is not implemented by this
/// backend.
fn dogleg_step(
    hessian: &Matrix,
    gradient: &Vector,
    radius: Float,
    _dogleg_type: DoglegType,
) -> Option<Vector> {
    let g_norm_squared = gradient.norm_squared();
    if g_norm_squared == 0.0 {
        return Some(Vector::zeros(gradient.len()));
    }
    let h_g = hessian * gradient;
    let g_h_g = gradient.dot(&h_g);

    // Cauchy point: minimizer of the model along the steepest descent ray.
    let cauchy = if g_h_g > 0.0 {
        gradient * (-g_norm_squared / g_h_g)
    } else {
        gradient * (-radius / g_norm_squared.sqrt())
    };

    let gauss_newton = regularized_spd_solve(hessian, &(-gradient))?;
    if gauss_newton.norm() <= radius {
        return Some(gauss_newton);
    }
    let cauchy_norm = cauchy.norm();
    if cauchy_norm >= radius {
        return Some(&cauchy * (radius / cauchy_norm));
    }

    // Walk the second dogleg segment until it crosses the boundary.
    let diff = &gauss_newton - &cauchy;
    let a = diff.norm_squared();
    let b = 2.0 * cauchy.dot(&diff);
    let c = cauchy.norm_squared() - radius * radius;
    let discriminant = (b * b - 4.0 * a * c).max(0.0).sqrt();
    let tau = (-b + discriminant) / (2.0 * a);
    Some(&cauchy + diff * tau.clamp(0.0, 1.0))
}

fn solve_spd(matrix: &Matrix, rhs: &Vector) -> Option<Vector> {
    matrix
        .clone()
        .cholesky()
        .map(|chol| chol.solve(rhs))
        .filter(|step| step.iter().all(|v| v.is_finite()))
}

/// Cholesky with escalating diagonal regularization, for (near) rank
/// deficient Gauss-Newton systems.
fn regularized_spd_solve(matrix: &Matrix, rhs: &Vector) -> Option<Vector> {
    if let Some(step) = solve_spd(matrix, rhs) {
        return Some(step);
    }
    let n = matrix.nrows();
    let mut mu = 1e-10 * matrix.diagonal().amax().max(1.0);
    for _ in 0..12 {
        let regularized = matrix + Matrix::identity(n, n) * mu;
        if let Some(step) = solve_spd(&regularized, rhs) {
            return Some(step);
        }
        mu *= 10.0;
    }
    None
}

/// Two-loop L-BFGS recursion.
fn lbfgs_direction(gradient: &Vector, history: &[(Vector, Vector)]) -> Vector {
    let mut q = gradient.clone();
    let mut alphas = Vec::with_capacity(history.len());
    for (s, y) in history.iter().rev() {
        let rho = 1.0 / s.dot(y);
        let alpha = rho * s.dot(&q);
        q -= y * alpha;
        alphas.push(alpha);
    }
    if let Some((s, y)) = history.last() {
        q *= s.dot(y) / y.norm_squared();
    }
    for ((s, y), alpha) in history.iter().zip(alphas.into_iter().rev()) {
        let rho = 1.0 / s.dot(y);
        let beta = rho * y.dot(&q);
        q += s * (alpha - beta);
    }
    -q
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::sync::{atomic::AtomicBool, Arc};

    use approx::assert_relative_eq;
    use fgo_linalg::Float;

    use super::*;
    use crate::{CostFunction, EuclideanManifold};

    /// r = x - target, one block of size 2.
    struct Offset {
        target: [Float; 2],
    }

    impl CostFunction for Offset {
        fn num_residuals(&self) -> usize {
            2
        }

        fn parameter_sizes(&self) -> &[usize] {
            &[2]
        }

        fn residual(&self, params: &[&[Float]]) -> Vector {
            Vector::from_vec(vec![
                params[0][0] - self.target[0],
                params[0][1] - self.target[1],
            ])
        }
    }

    /// Rosenbrock in residual form: r = [10(y - x^2), 1 - x].
    struct Rosenbrock;

    impl CostFunction for Rosenbrock {
        fn num_residuals(&self) -> usize {
            2
        }

        fn parameter_sizes(&self) -> &[usize] {
            &[2]
        }

        fn residual(&self, params: &[&[Float]]) -> Vector {
            let (x, y) = (params[0][0], params[0][1]);
            Vector::from_vec(vec![10.0 * (y - x * x), 1.0 - x])
        }
    }

    fn offset_problem(target: [Float; 2]) -> Problem {
        let mut problem = Problem::new();
        let block = problem
            .add_parameter_block(0, 2, Some(Arc::new(EuclideanManifold(2))))
            .unwrap();
        problem
            .add_residual_block(Box::new(Offset { target }), None, &[block])
            .unwrap();
        problem
    }

    fn quiet_options() -> SolverOptions {
        let mut options = SolverOptions::new();
        options.verbosity_level = 0;
        options
    }

    #[test]
    fn linear_problem_converges_in_one_step() {
        let problem = offset_problem([3.0, -2.0]);
        let mut pool = vec![0.0, 0.0];
        let summary = solve(&quiet_options(), &problem, &mut pool).unwrap();
        assert!(summary.is_solution_usable());
        assert_eq!(summary.termination_type, TerminationType::Convergence);
        assert_relative_eq!(pool[0], 3.0, epsilon = 1e-8);
        assert_relative_eq!(pool[1], -2.0, epsilon = 1e-8);
        assert!(summary.final_cost < 1e-12);
    }

    #[test]
    fn rosenbrock_converges_with_levenberg_marquardt() {
        let mut problem = Problem::new();
        let block = problem.add_parameter_block(0, 2, None).unwrap();
        problem
            .add_residual_block(Box::new(Rosenbrock), None, &[block])
            .unwrap();
        let mut options = quiet_options();
        options.trust_region_strategy_type = TrustRegionStrategyType::LevenbergMarquardt;
        let mut pool = vec![-1.2, 1.0];
        let summary = solve(&options, &problem, &mut pool).unwrap();
        assert_eq!(summary.termination_type, TerminationType::Convergence);
        assert_relative_eq!(pool[0], 1.0, epsilon = 1e-5);
        assert_relative_eq!(pool[1], 1.0, epsilon = 1e-5);
    }

    #[test]
    fn rosenbrock_converges_with_dogleg() {
        let mut problem = Problem::new();
        let block = problem.add_parameter_block(0, 2, None).unwrap();
        problem
            .add_residual_block(Box::new(Rosenbrock), None, &[block])
            .unwrap();
        let mut pool = vec![-1.2, 1.0];
        let summary = solve(&quiet_options(), &problem, &mut pool).unwrap();
        assert_eq!(summary.termination_type, TerminationType::Convergence);
        assert_relative_eq!(pool[0], 1.0, epsilon = 1e-5);
    }

    #[test]
    fn rosenbrock_converges_with_lbfgs_line_search() {
        let mut problem = Problem::new();
        let block = problem.add_parameter_block(0, 2, None).unwrap();
        problem
            .add_residual_block(Box::new(Rosenbrock), None, &[block])
            .unwrap();
        let mut options = quiet_options();
        options.minimizer_type = MinimizerType::LineSearch;
        options.max_num_iterations = 500;
        let mut pool = vec![-1.2, 1.0];
        let summary = solve(&options, &problem, &mut pool).unwrap();
        assert!(summary.is_solution_usable());
        assert_relative_eq!(pool[0], 1.0, epsilon = 1e-3);
        assert_relative_eq!(pool[1], 1.0, epsilon = 1e-3);
    }

    #[test]
    fn abort_flag_terminates_with_user_success() {
        let problem = offset_problem([5.0, 5.0]);
        let mut options = quiet_options();
        let flag = Arc::new(AtomicBool::new(true));
        options.abort = Some(Arc::clone(&flag));
        let mut pool = vec![0.0, 0.0];
        let summary = solve(&options, &problem, &mut pool).unwrap();
        assert_eq!(summary.termination_type, TerminationType::UserSuccess);
        assert!(summary.is_solution_usable());
        assert!(summary.num_successful_steps <= 1);
        // The iterate is untouched.
        assert_relative_eq!(pool[0], 0.0);
    }

    #[test]
    fn constant_blocks_do_not_move() {
        let mut problem = Problem::new();
        let block = problem.add_parameter_block(0, 2, None).unwrap();
        problem
            .add_residual_block(Box::new(Offset { target: [1.0, 1.0] }), None, &[block])
            .unwrap();
        problem.set_parameter_block_constant(block);
        let mut pool = vec![0.5, 0.5];
        let summary = solve(&quiet_options(), &problem, &mut pool).unwrap();
        assert_eq!(summary.termination_type, TerminationType::Convergence);
        assert_relative_eq!(pool[0], 0.5);
        assert_relative_eq!(pool[1], 0.5);
    }

    #[test]
    fn iteration_cap_reports_no_convergence() {
        let mut problem = Problem::new();
        let block = problem.add_parameter_block(0, 2, None).unwrap();
        problem
            .add_residual_block(Box::new(Rosenbrock), None, &[block])
            .unwrap();
        let mut options = quiet_options();
        options.max_num_iterations = 1;
        let mut pool = vec![-1.2, 1.0];
        let summary = solve(&options, &problem, &mut pool).unwrap();
        assert_eq!(summary.termination_type, TerminationType::NoConvergence);
        assert!(summary.is_solution_usable());
    }
}
