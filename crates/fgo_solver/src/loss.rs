use fgo_linalg::Float;

/// Robust loss applied to a residual block's squared norm.
///
/// `evaluate(s)` returns `[rho(s), rho'(s)]` for `s = ||r||^2`. The minimizer
/// rescales the whitened residual and Jacobian rows by `sqrt(rho'(s))`, the
/// usual first-order robustification.
pub trait Loss: Send + Sync + std::fmt::Debug {
    fn evaluate(&self, s: Float) -> [Float; 2];
}

/// Huber loss: quadratic for `s <= delta^2`, linear beyond.
#[derive(Debug, Clone, Copy)]
pub struct HuberLoss {
    delta: Float,
    delta_squared: Float,
}

impl HuberLoss {
    /// # Panics
    ///
    /// Panics if `delta` is not strictly positive.
    #[must_use]
    pub fn new(delta: Float) -> Self {
        assert!(delta > 0.0, "Huber loss parameter must be positive");
        Self {
            delta,
            delta_squared: delta * delta,
        }
    }
}

impl Loss for HuberLoss {
    fn evaluate(&self, s: Float) -> [Float; 2] {
        if s > self.delta_squared {
            let sqrt_s = s.sqrt();
            [2.0 * self.delta * sqrt_s - self.delta_squared, self.delta / sqrt_s]
        } else {
            [s, 1.0]
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn huber_is_identity_for_small_residuals() {
        let loss = HuberLoss::new(2.0);
        let [rho, rho_prime] = loss.evaluate(1.0);
        assert_relative_eq!(rho, 1.0);
        assert_relative_eq!(rho_prime, 1.0);
    }

    #[test]
    fn huber_grows_linearly_for_large_residuals() {
        let loss = HuberLoss::new(1.0);
        let [rho, rho_prime] = loss.evaluate(16.0);
        assert_relative_eq!(rho, 2.0 * 4.0 - 1.0);
        assert_relative_eq!(rho_prime, 0.25);
    }

    #[test]
    fn huber_is_continuous_at_the_knee() {
        let loss = HuberLoss::new(1.5);
        let below = loss.evaluate(1.5 * 1.5 - 1e-12)[0];
        let above = loss.evaluate(1.5 * 1.5 + 1e-12)[0];
        assert_relative_eq!(below, above, epsilon = 1e-9);
    }
}
