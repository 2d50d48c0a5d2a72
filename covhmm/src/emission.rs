//! Emission distributions and their per-parameter estimators.
//!
//! Every state of a model emits coverage values from one of three
//! distribution families. The families share a common interface through
//! [`EmissionDist`], dispatched over [`EmissionDistEnum`], so the M-step
//! driver can walk parameters uniformly without knowing the family.
//!
//! Two modifiers adjust every probability evaluation: `alpha` blends the
//! component mean toward the previous observation (auto-regressive
//! coupling) and `beta` rescales the distribution to model degraded
//! coverage near contig ends.

use crate::error::{Error, Result};
use crate::estimator::ParameterEstimator;
use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};
use statrs::function::gamma::{digamma, ln_gamma};
use std::f64::consts::PI;
use tracing::warn;

/// Probabilities below this value are clamped to it to prevent underflow in
/// the forward/backward recursions.
pub const PROB_FLOOR: f64 = 1e-40;

/// The distribution family of an emission.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum DistKind {
    /// Gaussian mixture.
    Gaussian,
    /// Negative-binomial mixture.
    NegativeBinomial,
    /// Truncated exponential.
    TruncExponential,
}

/// An estimable (or settable) parameter of an emission distribution.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ParamKind {
    /// Gaussian component mean.
    GaussianMean,
    /// Gaussian component variance.
    GaussianVar,
    /// Gaussian mixture weight.
    GaussianWeight,
    /// Negative-binomial success probability.
    NbTheta,
    /// Negative-binomial rate, `lambda = -r ln(theta)`.
    NbLambda,
    /// Negative-binomial mixture weight.
    NbWeight,
    /// Truncated-exponential rate.
    TruncExpLambda,
    /// Truncated-exponential truncation point; re-tied after each round
    /// rather than estimated.
    TruncExpPoint,
}

impl ParamKind {
    /// Row of this parameter in the binding table of its distribution.
    #[must_use]
    pub const fn binding_row(self) -> usize {
        match self {
            Self::GaussianMean | Self::NbTheta | Self::TruncExpLambda | Self::TruncExpPoint => 0,
            Self::GaussianVar | Self::NbLambda => 1,
            Self::GaussianWeight | Self::NbWeight => 2,
        }
    }

    /// Name used in parameter dumps.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::GaussianMean => "mean",
            Self::GaussianVar => "var",
            Self::GaussianWeight | Self::NbWeight => "weight",
            Self::NbTheta => "theta",
            Self::NbLambda => "lambda",
            Self::TruncExpLambda => "rate",
            Self::TruncExpPoint => "trunc_point",
        }
    }
}

/// Interface shared by all emission distribution families.
#[enum_dispatch]
pub trait EmissionDist {
    /// Returns the distribution family.
    fn kind(&self) -> DistKind;

    /// Returns the number of mixture components.
    fn num_comps(&self) -> usize;

    /// Returns `P(x)` given the previous observation and the `alpha`/`beta`
    /// modifiers, clamped from below at [`PROB_FLOOR`] for mixture
    /// families.
    fn prob(&self, x: usize, pre_x: usize, alpha: f64, beta: f64) -> f64;

    /// Adds the weighted sufficient statistics of one observation to the
    /// per-parameter estimators.
    fn update_estimator(&mut self, x: usize, pre_x: usize, alpha: f64, beta: f64, weight: f64);

    /// Zeroes all per-parameter estimators.
    fn reset_estimators(&mut self);

    /// Rescales mixture weights to sum to one.
    fn normalize_weights(&mut self) -> Result<()>;

    /// Returns whether every parameter lies in its domain.
    fn is_feasible(&self) -> bool;

    /// Returns the parameter kinds updated by the M-step, in update order.
    fn estimable_kinds(&self) -> &'static [ParamKind];

    /// Returns the current value of a parameter.
    fn parameter(&self, kind: ParamKind, comp: usize) -> f64;

    /// Overwrites a parameter without convergence bookkeeping.
    fn set_parameter(&mut self, kind: ParamKind, comp: usize, value: f64);

    /// Overwrites a parameter and reports whether the relative change was
    /// below `tol`.
    fn update_parameter(&mut self, kind: ParamKind, comp: usize, value: f64, tol: f64) -> bool;

    /// Returns `(estimate, count)` for a parameter from its accumulated
    /// statistics.
    fn estimate(&self, kind: ParamKind, comp: usize) -> (f64, f64);

    /// Returns the estimator backing a parameter kind.
    fn estimator(&self, kind: ParamKind) -> &ParameterEstimator;

    /// Returns named parameter vectors for reporting.
    fn display_parameters(&self) -> Vec<(&'static str, Vec<f64>)>;

    /// Returns the family name used in parameter dumps.
    fn name(&self) -> &'static str;
}

/// Tagged union over the distribution families.
#[enum_dispatch(EmissionDist)]
#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum EmissionDistEnum {
    /// See [`Gaussian`].
    Gaussian,
    /// See [`NegativeBinomial`].
    NegativeBinomial,
    /// See [`TruncExponential`].
    TruncExponential,
}

impl EmissionDistEnum {
    /// Folds the estimators of `other` into this distribution's estimators
    /// under the destination locks. Both sides must be the same family.
    pub fn merge_estimators_from(&self, other: &Self) {
        match (self, other) {
            (Self::Gaussian(dst), Self::Gaussian(src)) => {
                dst.mean_estimator.merge_from(&src.mean_estimator);
                dst.var_estimator.merge_from(&src.var_estimator);
                dst.weights_estimator.merge_from(&src.weights_estimator);
            }
            (Self::NegativeBinomial(dst), Self::NegativeBinomial(src)) => {
                dst.theta_estimator.merge_from(&src.theta_estimator);
                dst.lambda_estimator.merge_from(&src.lambda_estimator);
                dst.weights_estimator.merge_from(&src.weights_estimator);
            }
            (Self::TruncExponential(dst), Self::TruncExponential(src)) => {
                dst.lambda_estimator.merge_from(&src.lambda_estimator);
            }
            _ => debug_assert!(false, "merging estimators across families"),
        }
    }
}

fn converged(old_value: f64, new_value: f64, tol: f64) -> bool {
    // tiny previous values make the ratio meaningless
    let diff_ratio = if old_value > 1e-4 {
        (new_value / old_value - 1.0).abs()
    } else {
        0.0
    };
    diff_ratio < tol
}

fn normalize(weights: &mut [f64]) -> Result<()> {
    let sum: f64 = weights.iter().sum();
    if sum <= 0.0 {
        return Err(Error::Numeric(format!(
            "sum of mixture weights is not positive: {sum:e}"
        )));
    }
    for w in weights {
        *w /= sum;
    }
    Ok(())
}

/// Gaussian mixture over coverage values.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Gaussian {
    mean: Vec<f64>,
    var: Vec<f64>,
    weights: Vec<f64>,
    mean_estimator: ParameterEstimator,
    var_estimator: ParameterEstimator,
    weights_estimator: ParameterEstimator,
}

impl Gaussian {
    /// Creates a mixture from per-component means and variances, with
    /// uniform weights.
    #[must_use]
    pub fn new(mean: &[f64], var: &[f64]) -> Self {
        debug_assert_eq!(mean.len(), var.len());
        let num_comps = mean.len();
        Self {
            mean: mean.to_vec(),
            var: var.to_vec(),
            weights: vec![1.0 / num_comps as f64; num_comps],
            mean_estimator: ParameterEstimator::new(num_comps),
            var_estimator: ParameterEstimator::new(num_comps),
            weights_estimator: ParameterEstimator::new(num_comps),
        }
    }

    /// Creates a mixture whose variances are the means times `factor`.
    #[must_use]
    pub fn by_mean(mean: &[f64], factor: f64) -> Self {
        let var: Vec<f64> = mean.iter().map(|m| m * factor).collect();
        Self::new(mean, &var)
    }

    fn comp_probs(&self, x: usize, pre_x: usize, alpha: f64, beta: f64) -> Vec<f64> {
        let x = x as f64;
        let pre_x = pre_x as f64;
        (0..self.num_comps())
            .map(|comp| {
                let mean = beta * alpha.mul_add(pre_x, (1.0 - alpha) * self.mean[comp]);
                let var = beta * self.var[comp];
                let w = self.weights[comp];
                let prob = w / (var * 2.0 * PI).sqrt() * (-0.5 * (x - mean).powi(2) / var).exp();
                prob.max(PROB_FLOOR)
            })
            .collect()
    }
}

impl EmissionDist for Gaussian {
    fn kind(&self) -> DistKind {
        DistKind::Gaussian
    }

    fn num_comps(&self) -> usize {
        self.mean.len()
    }

    fn prob(&self, x: usize, pre_x: usize, alpha: f64, beta: f64) -> f64 {
        self.comp_probs(x, pre_x, alpha, beta).iter().sum()
    }

    fn update_estimator(&mut self, x: usize, pre_x: usize, alpha: f64, beta: f64, weight: f64) {
        let x_adjusted = (x as f64 - alpha * pre_x as f64) / (1.0 - alpha);
        let comp_probs = self.comp_probs(x, pre_x, alpha, beta);
        let tot_prob: f64 = comp_probs.iter().sum();
        for comp in 0..self.num_comps() {
            let w = weight * comp_probs[comp] / tot_prob;
            self.mean_estimator.increment(w * x_adjusted, w, comp);
            let z = (x_adjusted - self.mean[comp]) * (1.0 - alpha);
            self.var_estimator.increment(w * z * z, w, comp);
            self.weights_estimator
                .increment_denominator_for_all_comps(w, w, comp);
        }
    }

    fn reset_estimators(&mut self) {
        self.mean_estimator.reset();
        self.var_estimator.reset();
        self.weights_estimator.reset();
    }

    fn normalize_weights(&mut self) -> Result<()> {
        normalize(&mut self.weights)
    }

    fn is_feasible(&self) -> bool {
        !self.mean.is_empty()
            && self.mean.iter().all(|&m| m > 0.0)
            && self.var.iter().all(|&v| v > 0.0)
            && self.weights.iter().all(|&w| (0.0..=1.0).contains(&w))
    }

    fn estimable_kinds(&self) -> &'static [ParamKind] {
        &[
            ParamKind::GaussianMean,
            ParamKind::GaussianVar,
            ParamKind::GaussianWeight,
        ]
    }

    fn parameter(&self, kind: ParamKind, comp: usize) -> f64 {
        match kind {
            ParamKind::GaussianMean => self.mean[comp],
            ParamKind::GaussianVar => self.var[comp],
            ParamKind::GaussianWeight => self.weights[comp],
            _ => unreachable!("not a Gaussian parameter: {kind:?}"),
        }
    }

    fn set_parameter(&mut self, kind: ParamKind, comp: usize, value: f64) {
        match kind {
            ParamKind::GaussianMean => self.mean[comp] = value,
            ParamKind::GaussianVar => self.var[comp] = value,
            ParamKind::GaussianWeight => self.weights[comp] = value,
            _ => unreachable!("not a Gaussian parameter: {kind:?}"),
        }
    }

    fn update_parameter(&mut self, kind: ParamKind, comp: usize, value: f64, tol: f64) -> bool {
        let old_value = self.parameter(kind, comp);
        self.set_parameter(kind, comp, value);
        converged(old_value, value, tol)
    }

    fn estimate(&self, kind: ParamKind, comp: usize) -> (f64, f64) {
        self.estimator(kind).estimate(comp)
    }

    fn estimator(&self, kind: ParamKind) -> &ParameterEstimator {
        match kind {
            ParamKind::GaussianMean => &self.mean_estimator,
            ParamKind::GaussianVar => &self.var_estimator,
            ParamKind::GaussianWeight => &self.weights_estimator,
            _ => unreachable!("not a Gaussian parameter: {kind:?}"),
        }
    }

    fn display_parameters(&self) -> Vec<(&'static str, Vec<f64>)> {
        vec![
            ("mean", self.mean.clone()),
            ("var", self.var.clone()),
            ("weight", self.weights.clone()),
        ]
    }

    fn name(&self) -> &'static str {
        "gaussian"
    }
}

/// Negative-binomial mixture parameterized by `(theta, lambda)` with the
/// dispersion `r = -lambda / ln(theta)`.
///
/// The mixture keeps a precomputed table of `psi(r + x)` values for every
/// representable coverage so the M-step statistics avoid per-observation
/// digamma evaluations. The table must be rebuilt whenever `theta` or
/// `lambda` changes.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NegativeBinomial {
    theta: Vec<f64>,
    lambda: Vec<f64>,
    weights: Vec<f64>,
    digamma_table: Vec<Vec<f64>>,
    max_coverage: usize,
    theta_estimator: ParameterEstimator,
    lambda_estimator: ParameterEstimator,
    weights_estimator: ParameterEstimator,
}

impl NegativeBinomial {
    /// Creates a mixture from per-component means and variances, with
    /// uniform weights.
    #[must_use]
    pub fn new(mean: &[f64], var: &[f64], max_coverage: usize) -> Self {
        debug_assert_eq!(mean.len(), var.len());
        let num_comps = mean.len();
        let theta: Vec<f64> = mean.iter().zip(var).map(|(&m, &v)| Self::theta_from(m, v)).collect();
        let lambda: Vec<f64> = mean
            .iter()
            .zip(var)
            .map(|(&m, &v)| Self::lambda_from(m, v))
            .collect();
        let mut nb = Self {
            theta,
            lambda,
            weights: vec![1.0 / num_comps as f64; num_comps],
            digamma_table: Vec::new(),
            max_coverage,
            theta_estimator: ParameterEstimator::new(num_comps),
            lambda_estimator: ParameterEstimator::new(num_comps),
            weights_estimator: ParameterEstimator::new(num_comps),
        };
        nb.fill_digamma_table();
        nb
    }

    /// Creates a mixture whose variances are the means times `factor`;
    /// `factor` must be greater than one for the dispersion to be defined.
    #[must_use]
    pub fn by_mean(mean: &[f64], factor: f64, max_coverage: usize) -> Self {
        let var: Vec<f64> = mean.iter().map(|m| m * factor).collect();
        Self::new(mean, &var, max_coverage)
    }

    fn theta_from(mean: f64, var: f64) -> f64 {
        mean / var
    }

    fn lambda_from(mean: f64, var: f64) -> f64 {
        let r = mean.powi(2) / (var - mean);
        -r * Self::theta_from(mean, var).ln()
    }

    fn r(theta: f64, lambda: f64) -> f64 {
        -lambda / theta.ln()
    }

    /// Mean implied by one component's `(theta, lambda)`.
    #[must_use]
    pub fn comp_mean(&self, comp: usize) -> f64 {
        let r = Self::r(self.theta[comp], self.lambda[comp]);
        r * (1.0 - self.theta[comp]) / self.theta[comp]
    }

    /// Variance implied by one component's `(theta, lambda)`.
    #[must_use]
    pub fn comp_var(&self, comp: usize) -> f64 {
        self.comp_mean(comp) / self.theta[comp]
    }

    /// Rebuilds the digamma table from the current `(theta, lambda)`.
    ///
    /// Uses the recurrence `psi(z + 1) = psi(z) + 1/z`, anchored at
    /// `psi(r)`.
    pub fn fill_digamma_table(&mut self) {
        let len = self.max_coverage + 1;
        self.digamma_table = (0..self.num_comps())
            .map(|comp| {
                let r = Self::r(self.theta[comp], self.lambda[comp]);
                let mut table = Vec::with_capacity(len);
                table.push(digamma(r));
                for x in 1..len {
                    let prev = table[x - 1];
                    table.push(prev + 1.0 / (r + (x - 1) as f64));
                }
                table
            })
            .collect();
    }

    fn comp_probs(&self, x: usize) -> Vec<f64> {
        (0..self.num_comps())
            .map(|comp| {
                let theta = self.theta[comp];
                let r = Self::r(theta, self.lambda[comp]);
                let w = self.weights[comp];
                let log_prob = ln_gamma(r + x as f64) - ln_gamma(r) - ln_gamma(x as f64 + 1.0)
                    + r * theta.ln()
                    + x as f64 * (1.0 - theta).ln();
                (w * log_prob.exp()).max(PROB_FLOOR)
            })
            .collect()
    }
}

impl EmissionDist for NegativeBinomial {
    fn kind(&self) -> DistKind {
        DistKind::NegativeBinomial
    }

    fn num_comps(&self) -> usize {
        self.theta.len()
    }

    fn prob(&self, x: usize, _pre_x: usize, _alpha: f64, _beta: f64) -> f64 {
        self.comp_probs(x).iter().sum()
    }

    fn update_estimator(&mut self, x: usize, _pre_x: usize, _alpha: f64, _beta: f64, weight: f64) {
        let comp_probs = self.comp_probs(x);
        let tot_prob: f64 = comp_probs.iter().sum();
        for comp in 0..self.num_comps() {
            let theta = self.theta[comp];
            let r = Self::r(theta, self.lambda[comp]);
            let beta_theta = -theta / (1.0 - theta) - 1.0 / theta.ln();
            let w = weight * comp_probs[comp] / tot_prob;
            let delta = r * (self.digamma_table[comp][x] - self.digamma_table[comp][0]);
            self.lambda_estimator.increment(w * delta, w, comp);
            self.theta_estimator.increment(
                w * delta * beta_theta,
                w * delta * beta_theta + w * (x as f64 - delta),
                comp,
            );
            self.weights_estimator
                .increment_denominator_for_all_comps(w, w, comp);
        }
    }

    fn reset_estimators(&mut self) {
        self.theta_estimator.reset();
        self.lambda_estimator.reset();
        self.weights_estimator.reset();
    }

    fn normalize_weights(&mut self) -> Result<()> {
        normalize(&mut self.weights)
    }

    fn is_feasible(&self) -> bool {
        !self.theta.is_empty()
            && self.theta.iter().all(|&t| t > 0.0 && t < 1.0)
            && self.lambda.iter().all(|&l| l > 0.0)
            && self.weights.iter().all(|&w| (0.0..=1.0).contains(&w))
    }

    fn estimable_kinds(&self) -> &'static [ParamKind] {
        &[ParamKind::NbTheta, ParamKind::NbLambda, ParamKind::NbWeight]
    }

    fn parameter(&self, kind: ParamKind, comp: usize) -> f64 {
        match kind {
            ParamKind::NbTheta => self.theta[comp],
            ParamKind::NbLambda => self.lambda[comp],
            ParamKind::NbWeight => self.weights[comp],
            _ => unreachable!("not a negative-binomial parameter: {kind:?}"),
        }
    }

    fn set_parameter(&mut self, kind: ParamKind, comp: usize, value: f64) {
        match kind {
            ParamKind::NbTheta => self.theta[comp] = value,
            ParamKind::NbLambda => self.lambda[comp] = value,
            ParamKind::NbWeight => self.weights[comp] = value,
            _ => unreachable!("not a negative-binomial parameter: {kind:?}"),
        }
    }

    fn update_parameter(&mut self, kind: ParamKind, comp: usize, value: f64, tol: f64) -> bool {
        let old_value = self.parameter(kind, comp);
        self.set_parameter(kind, comp, value);
        converged(old_value, value, tol)
    }

    fn estimate(&self, kind: ParamKind, comp: usize) -> (f64, f64) {
        self.estimator(kind).estimate(comp)
    }

    fn estimator(&self, kind: ParamKind) -> &ParameterEstimator {
        match kind {
            ParamKind::NbTheta => &self.theta_estimator,
            ParamKind::NbLambda => &self.lambda_estimator,
            ParamKind::NbWeight => &self.weights_estimator,
            _ => unreachable!("not a negative-binomial parameter: {kind:?}"),
        }
    }

    fn display_parameters(&self) -> Vec<(&'static str, Vec<f64>)> {
        vec![
            ("mean", (0..self.num_comps()).map(|c| self.comp_mean(c)).collect()),
            ("var", (0..self.num_comps()).map(|c| self.comp_var(c)).collect()),
            ("weight", self.weights.clone()),
        ]
    }

    fn name(&self) -> &'static str {
        "negative_binomial"
    }
}

/// Exponential distribution truncated at `trunc_point`, used for the
/// erroneous state in the mixed model.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TruncExponential {
    lambda: f64,
    trunc_point: f64,
    lambda_estimator: ParameterEstimator,
}

impl TruncExponential {
    /// Creates a truncated exponential with the given rate and truncation
    /// point.
    #[must_use]
    pub fn new(lambda: f64, trunc_point: f64) -> Self {
        Self {
            lambda,
            trunc_point,
            lambda_estimator: ParameterEstimator::new(1),
        }
    }

    /// Returns the truncation point.
    #[must_use]
    pub const fn trunc_point(&self) -> f64 {
        self.trunc_point
    }

    fn log_likelihood_by_params(lambda: f64, trunc_point: f64, num: f64, den: f64) -> f64 {
        den * lambda.ln() - den * (1.0 - (-lambda * trunc_point).exp()).ln() - num * lambda
    }

    /// Maximizes the weighted log-likelihood over the rate by golden-section
    /// search on `[0, trunc_point]`.
    #[must_use]
    pub fn estimate_lambda(&self, tol: f64) -> f64 {
        let num = self.lambda_estimator.numerator(0);
        let den = self.lambda_estimator.denominator(0);

        let mut a = 0.0_f64;
        let mut b = self.trunc_point;

        let invphi = (5.0_f64.sqrt() - 1.0) / 2.0;
        let invphi2 = (3.0 - 5.0_f64.sqrt()) / 2.0;

        let mut h = b - a;
        if h <= tol {
            return (b + a) / 2.0;
        }

        let n = ((tol / h).ln() / invphi.ln()).ceil() as usize;

        let mut c = invphi2.mul_add(h, a);
        let mut d = invphi.mul_add(h, a);
        let mut yc = Self::log_likelihood_by_params(c, self.trunc_point, num, den);
        let mut yd = Self::log_likelihood_by_params(d, self.trunc_point, num, den);
        for _ in 0..n.saturating_sub(1) {
            if yc > yd {
                b = d;
                d = c;
                yd = yc;
                h *= invphi;
                c = invphi2.mul_add(h, a);
                yc = Self::log_likelihood_by_params(c, self.trunc_point, num, den);
            } else {
                a = c;
                c = d;
                yc = yd;
                h *= invphi;
                d = invphi.mul_add(h, a);
                yd = Self::log_likelihood_by_params(d, self.trunc_point, num, den);
            }
        }

        if yc > yd {
            (a + d) / 2.0
        } else {
            (c + b) / 2.0
        }
    }
}

impl EmissionDist for TruncExponential {
    fn kind(&self) -> DistKind {
        DistKind::TruncExponential
    }

    fn num_comps(&self) -> usize {
        1
    }

    fn prob(&self, x: usize, _pre_x: usize, _alpha: f64, beta: f64) -> f64 {
        let x = x as f64;
        if x > self.trunc_point {
            return 0.0;
        }
        let lam = self.lambda / beta;
        let b = beta * self.trunc_point;
        lam * (-lam * x).exp() / (1.0 - (-lam * b).exp())
    }

    fn update_estimator(&mut self, x: usize, _pre_x: usize, _alpha: f64, _beta: f64, weight: f64) {
        self.lambda_estimator.increment(weight * x as f64, weight, 0);
    }

    fn reset_estimators(&mut self) {
        self.lambda_estimator.reset();
    }

    fn normalize_weights(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_feasible(&self) -> bool {
        self.lambda > 0.0 && self.trunc_point > 0.0
    }

    fn estimable_kinds(&self) -> &'static [ParamKind] {
        &[ParamKind::TruncExpLambda]
    }

    fn parameter(&self, kind: ParamKind, _comp: usize) -> f64 {
        match kind {
            ParamKind::TruncExpLambda => self.lambda,
            ParamKind::TruncExpPoint => self.trunc_point,
            _ => unreachable!("not a truncated-exponential parameter: {kind:?}"),
        }
    }

    fn set_parameter(&mut self, kind: ParamKind, _comp: usize, value: f64) {
        match kind {
            ParamKind::TruncExpLambda => self.lambda = value,
            ParamKind::TruncExpPoint => self.trunc_point = value,
            _ => unreachable!("not a truncated-exponential parameter: {kind:?}"),
        }
    }

    fn update_parameter(&mut self, kind: ParamKind, _comp: usize, value: f64, tol: f64) -> bool {
        match kind {
            ParamKind::TruncExpLambda => {
                let old_value = self.lambda;
                self.lambda = value;
                converged(old_value, value, tol)
            }
            ParamKind::TruncExpPoint => {
                self.trunc_point = value;
                true
            }
            _ => unreachable!("not a truncated-exponential parameter: {kind:?}"),
        }
    }

    fn estimate(&self, kind: ParamKind, comp: usize) -> (f64, f64) {
        debug_assert_eq!(kind, ParamKind::TruncExpLambda);
        let count = self.lambda_estimator.denominator(comp);
        if count == 0.0 {
            warn!("rate estimator denominator is zero, returning 0");
            return (0.0, count);
        }
        (self.estimate_lambda(1e-6), count)
    }

    fn estimator(&self, kind: ParamKind) -> &ParameterEstimator {
        debug_assert_eq!(kind, ParamKind::TruncExpLambda);
        &self.lambda_estimator
    }

    fn display_parameters(&self) -> Vec<(&'static str, Vec<f64>)> {
        vec![
            ("mean", vec![1.0 / self.lambda]),
            ("trunc_point", vec![self.trunc_point]),
        ]
    }

    fn name(&self) -> &'static str {
        "trunc_exponential"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;
    use rand::distributions::Distribution;
    use rand::SeedableRng;

    #[test]
    fn gaussian_prob_peaks_at_mean() {
        let gaussian = Gaussian::new(&[30.0], &[9.0]);
        let at_mean = gaussian.prob(30, 0, 0.0, 1.0);
        let off_mean = gaussian.prob(40, 0, 0.0, 1.0);
        assert!(at_mean > off_mean);
        assert_approx_eq!(
            f64,
            at_mean,
            1.0 / (9.0 * 2.0 * PI).sqrt(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn gaussian_alpha_blends_toward_previous_observation() {
        let gaussian = Gaussian::new(&[30.0], &[9.0]);
        // with alpha = 0.5 and pre_x = 50 the effective mean is 40
        let blended = gaussian.prob(40, 50, 0.5, 1.0);
        assert_approx_eq!(
            f64,
            blended,
            1.0 / (9.0 * 2.0 * PI).sqrt(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn gaussian_prob_is_floored() {
        let gaussian = Gaussian::new(&[1.0], &[0.01]);
        assert!(gaussian.prob(250, 0, 0.0, 1.0) >= PROB_FLOOR);
    }

    #[test]
    fn nb_mean_var_round_trip() {
        let nb = NegativeBinomial::new(&[20.0], &[30.0], 250);
        assert_approx_eq!(f64, nb.comp_mean(0), 20.0, epsilon = 1e-9);
        assert_approx_eq!(f64, nb.comp_var(0), 30.0, epsilon = 1e-9);
    }

    #[test]
    fn nb_probs_sum_close_to_one() {
        let nb = NegativeBinomial::new(&[20.0], &[30.0], 250);
        let total: f64 = (0..=250).map(|x| nb.prob(x, 0, 0.0, 1.0)).sum();
        assert_approx_eq!(f64, total, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn digamma_table_matches_direct_evaluation() {
        let nb = NegativeBinomial::new(&[20.0], &[30.0], 250);
        let r = NegativeBinomial::r(nb.theta[0], nb.lambda[0]);
        for x in [0_usize, 1, 17, 250] {
            assert_approx_eq!(
                f64,
                nb.digamma_table[0][x],
                digamma(r + x as f64),
                epsilon = 1e-9
            );
        }
    }

    #[test]
    fn trunc_exp_integrates_to_one() {
        let dist = TruncExponential::new(0.7, 9.5);
        // trapezoid over a fine grid of the pdf on [0, b]
        let steps = 100_000;
        let h = dist.trunc_point() / steps as f64;
        let pdf = |x: f64| {
            dist.lambda * (-dist.lambda * x).exp() / (1.0 - (-dist.lambda * dist.trunc_point).exp())
        };
        let mut integral = (pdf(0.0) + pdf(dist.trunc_point())) / 2.0;
        for i in 1..steps {
            integral += pdf(i as f64 * h);
        }
        integral *= h;
        assert_approx_eq!(f64, integral, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn trunc_exp_lambda_estimate_for_uniform_samples() {
        // uniform samples on [0, 10] are the lambda -> 0 limit; antithetic
        // pairs pin the sample mean so the boundary estimate is exact
        let mut dist = TruncExponential::new(1.0, 10.0);
        let mut rng = rand_pcg::Pcg64::seed_from_u64(42);
        let uniform = rand::distributions::Uniform::new(0.0_f64, 10.0);
        for _ in 0..5_000 {
            let x = uniform.sample(&mut rng);
            dist.lambda_estimator.increment(x, 1.0, 0);
            dist.lambda_estimator.increment(10.0 - x, 1.0, 0);
        }
        let lambda_hat = dist.estimate_lambda(1e-6);
        assert!(lambda_hat < 1e-4, "lambda_hat = {lambda_hat:e}");
    }

    #[test]
    fn nb_m_step_recovers_the_mean() {
        // feed the expected sufficient statistics of 1e5 draws; the update
        // equations must reproduce the generating mean
        let truth = NegativeBinomial::new(&[20.0], &[30.0], 250);
        let mut nb = NegativeBinomial::new(&[20.0], &[30.0], 250);
        for x in 0..=250_usize {
            let weight = 100_000.0 * truth.prob(x, 0, 0.0, 1.0);
            nb.update_estimator(x, 0, 0.0, 1.0, weight);
        }
        let (lambda_hat, _) = nb.lambda_estimator.estimate(0);
        let (theta_hat, _) = nb.theta_estimator.estimate(0);
        nb.set_parameter(ParamKind::NbLambda, 0, lambda_hat);
        nb.set_parameter(ParamKind::NbTheta, 0, theta_hat);
        let mean = nb.comp_mean(0);
        assert!(
            (mean / 20.0 - 1.0).abs() < 0.02,
            "recovered mean {mean} is off by more than 2%"
        );
    }

    #[test]
    fn nb_estimator_statistics_follow_digamma_delta() {
        let mut nb = NegativeBinomial::new(&[20.0], &[30.0], 250);
        let x = 25_usize;
        nb.update_estimator(x, 0, 0.0, 1.0, 1.0);
        let r = NegativeBinomial::r(nb.theta[0], nb.lambda[0]);
        let delta = r * (digamma(r + x as f64) - digamma(r));
        let (lambda_est, count) = nb.lambda_estimator.estimate(0);
        assert_approx_eq!(f64, count, 1.0, ulps = 2);
        assert_approx_eq!(f64, lambda_est, delta, epsilon = 1e-9);
    }

    #[test]
    fn weight_normalization_rejects_zero_sum() {
        let mut gaussian = Gaussian::new(&[10.0, 20.0], &[10.0, 20.0]);
        gaussian.weights = vec![0.0, 0.0];
        assert!(gaussian.normalize_weights().is_err());
    }
}
