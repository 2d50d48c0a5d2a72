//! Immutable run configuration shared by model construction and fitting.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::str::FromStr;

/// The emission-distribution family used by a model.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    /// Gaussian mixtures for every state.
    Gaussian,
    /// Negative-binomial mixtures for every state.
    NegativeBinomial,
    /// A truncated exponential for the erroneous state, Gaussian mixtures
    /// for the remaining states.
    TruncExpGaussian,
}

impl FromStr for ModelType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gaussian" => Ok(Self::Gaussian),
            "nb" | "negative_binomial" => Ok(Self::NegativeBinomial),
            "trunc_exp_gaussian" | "truncated_exponential_gaussian" => Ok(Self::TruncExpGaussian),
            _ => Err(Error::Config(format!("unknown model type `{s}`"))),
        }
    }
}

/// Immutable knobs consumed by the model constructor and the EM driver.
///
/// Construct with [`ModelConfig::default`] and adjust through the setters,
/// or load from a JSON file.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ModelConfig {
    max_coverage: usize,
    min_count_for_parameter_update: f64,
    err_binding_coef: f64,
    trunc_point_cov_fraction: f64,
    termination_prob: f64,
    convergence_tol: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            max_coverage: 250,
            min_count_for_parameter_update: 0.0,
            err_binding_coef: 0.1,
            trunc_point_cov_fraction: 0.25,
            termination_prob: 1e-4,
            convergence_tol: 1e-3,
        }
    }
}

impl ModelConfig {
    /// Loads a configuration from a JSON file. Missing fields fall back to
    /// their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|err| Error::Config(format!("{}: {err}", path.display())))
    }

    /// Returns the largest representable coverage value; observations above
    /// it are clamped.
    #[must_use]
    pub const fn max_coverage(&self) -> usize {
        self.max_coverage
    }

    /// Returns the minimum accumulated denominator a parameter needs before
    /// its M-step update is applied.
    #[must_use]
    pub const fn min_count_for_parameter_update(&self) -> f64 {
        self.min_count_for_parameter_update
    }

    /// Returns the binding coefficient tying the erroneous state to the
    /// haploid state.
    #[must_use]
    pub const fn err_binding_coef(&self) -> f64 {
        self.err_binding_coef
    }

    /// Returns the fraction of the haploid mean used as the truncation
    /// point of the truncated exponential.
    #[must_use]
    pub const fn trunc_point_cov_fraction(&self) -> f64 {
        self.trunc_point_cov_fraction
    }

    /// Returns the per-state probability of terminating the sequence.
    #[must_use]
    pub const fn termination_prob(&self) -> f64 {
        self.termination_prob
    }

    /// Returns the relative tolerance below which a parameter update counts
    /// as converged.
    #[must_use]
    pub const fn convergence_tol(&self) -> f64 {
        self.convergence_tol
    }

    /// Sets the largest representable coverage value.
    pub fn set_max_coverage(&mut self, max_coverage: usize) {
        self.max_coverage = max_coverage;
    }

    /// Sets the minimum denominator required for a parameter update.
    pub fn set_min_count_for_parameter_update(&mut self, min_count: f64) {
        self.min_count_for_parameter_update = min_count;
    }

    /// Sets the binding coefficient of the erroneous state.
    pub fn set_err_binding_coef(&mut self, coef: f64) {
        self.err_binding_coef = coef;
    }

    /// Sets the truncation-point fraction of the haploid mean.
    pub fn set_trunc_point_cov_fraction(&mut self, fraction: f64) {
        self.trunc_point_cov_fraction = fraction;
    }

    /// Sets the termination probability.
    pub fn set_termination_prob(&mut self, prob: f64) {
        self.termination_prob = prob;
    }

    /// Sets the convergence tolerance.
    pub fn set_convergence_tol(&mut self, tol: f64) {
        self.convergence_tol = tol;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_type_from_str() {
        assert_eq!("gaussian".parse::<ModelType>().unwrap(), ModelType::Gaussian);
        assert_eq!("nb".parse::<ModelType>().unwrap(), ModelType::NegativeBinomial);
        assert_eq!(
            "negative_binomial".parse::<ModelType>().unwrap(),
            ModelType::NegativeBinomial
        );
        assert_eq!(
            "trunc_exp_gaussian".parse::<ModelType>().unwrap(),
            ModelType::TruncExpGaussian
        );
        assert!("poisson".parse::<ModelType>().is_err());
    }

    #[test]
    fn default_config() {
        let config = ModelConfig::default();
        assert_eq!(config.max_coverage(), 250);
        assert_eq!(config.termination_prob(), 1e-4);
        assert_eq!(config.err_binding_coef(), 0.1);
    }
}
