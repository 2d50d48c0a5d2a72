//! SQUAREM acceleration of the EM fixed-point iteration.
//!
//! One accelerated cycle takes three consecutive EM iterates, extrapolates
//! along the squared iterate difference and runs one further EM iteration
//! on the extrapolated model. An infeasible extrapolation is pulled back by
//! halving the step toward `-1`, which recovers the plain third iterate.

use crate::em::{run_em_iteration, EmChunk};
use crate::error::{Error, Result};
use crate::hmm::Hmm;
use tracing::{debug, info};

/// Snapshots of three consecutive EM iterates and the steepest-descent step
/// length derived from them.
pub struct SquareAccelerator {
    theta0: Vec<f64>,
    theta1: Vec<f64>,
    theta2: Vec<f64>,
    alpha_rate: f64,
}

impl SquareAccelerator {
    /// Creates an empty accelerator.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            theta0: Vec::new(),
            theta1: Vec::new(),
            theta2: Vec::new(),
            alpha_rate: 0.0,
        }
    }

    /// Captures the first iterate.
    pub fn set_model0(&mut self, model: &Hmm) {
        self.theta0 = model.flatten_parameters();
    }

    /// Captures the second iterate.
    pub fn set_model1(&mut self, model: &Hmm) {
        self.theta1 = model.flatten_parameters();
    }

    /// Captures the third iterate.
    pub fn set_model2(&mut self, model: &Hmm) {
        self.theta2 = model.flatten_parameters();
    }

    /// Computes the step length `-|r| / |v|` over the flattened vector,
    /// where `r` and `v` are the first and second iterate differences.
    pub fn compute_rate(&mut self) {
        let r_norm: f64 = self
            .theta0
            .iter()
            .zip(&self.theta1)
            .map(|(t0, t1)| (t1 - t0).powi(2))
            .sum::<f64>()
            .sqrt();
        let v_norm: f64 = self
            .theta0
            .iter()
            .zip(&self.theta1)
            .zip(&self.theta2)
            .map(|((t0, t1), t2)| (t2 - 2.0 * t1 + t0).powi(2))
            .sum::<f64>()
            .sqrt();
        self.alpha_rate = if v_norm > 0.0 { -(r_norm / v_norm) } else { -1.0 };
    }

    /// Returns the current step length.
    #[must_use]
    pub const fn alpha_rate(&self) -> f64 {
        self.alpha_rate
    }

    fn extrapolated(&self, alpha: f64) -> Vec<f64> {
        self.theta0
            .iter()
            .zip(&self.theta1)
            .zip(&self.theta2)
            .map(|((t0, t1), t2)| {
                let r = t1 - t0;
                let v = t2 - 2.0 * t1 + t0;
                alpha.powi(2).mul_add(v, (-2.0 * alpha).mul_add(r, *t0))
            })
            .collect()
    }

    /// Writes the extrapolated parameters into `model`, halving the step
    /// toward `-1` while the result is infeasible. At `-1` the third
    /// iterate is recovered unchanged.
    pub fn apply_to(&mut self, model: &mut Hmm) -> Result<()> {
        loop {
            let theta_prime = self.extrapolated(self.alpha_rate);
            model.set_flattened_parameters(&theta_prime)?;
            if model.is_feasible() {
                break;
            }
            if (self.alpha_rate + 1.0).abs() < 1e-9 {
                model.set_flattened_parameters(&self.theta2)?;
                break;
            }
            self.alpha_rate = (self.alpha_rate - 1.0) / 2.0;
            debug!(alpha_rate = self.alpha_rate, "extrapolation infeasible, halving step");
        }
        model.normalize_weights_and_rows()?;
        model.refresh_derived_parameters();
        if !model.is_feasible() {
            return Err(Error::Infeasible(
                "model is infeasible after the accelerator retry chain".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for SquareAccelerator {
    fn default() -> Self {
        Self::new()
    }
}

/// One accelerated cycle: three EM iterations, an extrapolation, then one
/// EM iteration on the extrapolated model. Returns whether the final
/// iteration converged.
pub fn run_accelerated_cycle(model: &mut Hmm, chunks: &mut [EmChunk]) -> Result<bool> {
    let mut accelerator = SquareAccelerator::new();
    accelerator.set_model0(model);
    run_em_iteration(model, chunks)?;
    accelerator.set_model1(model);
    run_em_iteration(model, chunks)?;
    accelerator.set_model2(model);
    accelerator.compute_rate();
    accelerator.apply_to(model)?;
    let converged = run_em_iteration(model, chunks)?;
    info!(
        alpha_rate = accelerator.alpha_rate(),
        log_likelihood = model.log_likelihood(),
        converged,
        "accelerated cycle finished"
    );
    Ok(converged)
}

/// Runs accelerated cycles until convergence or `max_cycles`. Returns
/// whether the model converged.
pub fn fit_accelerated(model: &mut Hmm, chunks: &mut [EmChunk], max_cycles: usize) -> Result<bool> {
    for _ in 0..max_cycles {
        if run_accelerated_cycle(model, chunks)? {
            return Ok(true);
        }
    }
    Ok(false)
}
