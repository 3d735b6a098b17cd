use fgo_linalg::Float;

/// Why the minimizer stopped.
///
/// The numeric values are stable and used on the flat wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationType {
    /// One of the convergence tolerances was satisfied.
    Convergence = 0,
    /// The iteration cap was reached without satisfying a tolerance.
    NoConvergence = 1,
    /// The solver encountered an unrecoverable numerical failure.
    Failure = 2,
    /// An iteration callback (the abort flag) requested successful
    /// termination on the current iterate.
    UserSuccess = 3,
    /// An iteration callback requested abortive termination.
    UserFailure = 4,
}

impl TerminationType {
    #[must_use]
    pub fn as_wire(self) -> i32 {
        self as i32
    }
}

/// A brief summary of the state of the solver after optimization.
#[derive(Debug, Clone)]
pub struct Summary {
    /// Cost of the objective before optimization.
    pub initial_cost: Float,
    /// Cost of the objective after optimization.
    pub final_cost: Float,
    /// Number of iterations in which the step was accepted.
    pub num_successful_steps: usize,
    /// Number of iterations in which the step was rejected.
    pub num_unsuccessful_steps: usize,
    /// Wall clock time spent in the solver, in seconds.
    pub total_time_in_seconds: Float,
    pub termination_type: TerminationType,
    /// Human readable reason the solver terminated.
    pub message: String,
}

impl Summary {
    /// Whether the returned iterate is numerically sane. True unless the
    /// solver failed outright.
    #[must_use]
    pub fn is_solution_usable(&self) -> bool {
        matches!(
            self.termination_type,
            TerminationType::Convergence
                | TerminationType::NoConvergence
                | TerminationType::UserSuccess
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_are_stable() {
        assert_eq!(TerminationType::Convergence.as_wire(), 0);
        assert_eq!(TerminationType::NoConvergence.as_wire(), 1);
        assert_eq!(TerminationType::Failure.as_wire(), 2);
        assert_eq!(TerminationType::UserSuccess.as_wire(), 3);
        assert_eq!(TerminationType::UserFailure.as_wire(), 4);
    }

    #[test]
    fn usable_solutions() {
        let mut summary = Summary {
            initial_cost: 1.0,
            final_cost: 0.5,
            num_successful_steps: 1,
            num_unsuccessful_steps: 0,
            total_time_in_seconds: 0.0,
            termination_type: TerminationType::Convergence,
            message: String::new(),
        };
        assert!(summary.is_solution_usable());
        summary.termination_type = TerminationType::UserSuccess;
        assert!(summary.is_solution_usable());
        summary.termination_type = TerminationType::Failure;
        assert!(!summary.is_solution_usable());
    }
}
