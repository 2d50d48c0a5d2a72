//! Per-region collections of emission distributions.

use crate::binding::{default_bindings, ParameterBinding};
use crate::config::{ModelConfig, ModelType};
use crate::emission::{
    DistKind, EmissionDist, EmissionDistEnum, Gaussian, NegativeBinomial, ParamKind,
    TruncExponential,
};
use crate::error::Result;
use crate::estimator::ParameterEstimator;
use crate::state::{State, StateSpace};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};

const GAUSSIAN_KINDS: [ParamKind; 3] = [
    ParamKind::GaussianMean,
    ParamKind::GaussianVar,
    ParamKind::GaussianWeight,
];
const NB_KINDS: [ParamKind; 3] = [ParamKind::NbTheta, ParamKind::NbLambda, ParamKind::NbWeight];

/// One emission distribution per state, the binding table coupling their
/// parameters, and per-state count histograms for the fast E-step path.
///
/// The histograms sit behind a mutex so that chunk tasks can merge their
/// private copies into the shared model's series concurrently; the
/// exclusive increment path does not take the lock.
#[derive(Debug, Deserialize, Serialize)]
pub struct EmissionDistSeries {
    dists: Vec<EmissionDistEnum>,
    bindings: Vec<ParameterBinding>,
    count_data: Mutex<Vec<Vec<f64>>>,
    model_type: ModelType,
    state_space: StateSpace,
    max_coverage: usize,
}

impl Clone for EmissionDistSeries {
    fn clone(&self) -> Self {
        Self {
            dists: self.dists.clone(),
            bindings: self.bindings.clone(),
            count_data: Mutex::new(
                self.count_data
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone(),
            ),
            model_type: self.model_type,
            state_space: self.state_space,
            max_coverage: self.max_coverage,
        }
    }
}

impl EmissionDistSeries {
    /// Builds the distributions of one region from initial per-state means.
    ///
    /// `means[s]` holds the initial component means of state `s`; the number
    /// of components per state follows the length of each row. For the
    /// mixed model the erroneous state becomes a truncated exponential whose
    /// truncation point is tied to the haploid mean.
    #[must_use]
    pub fn for_model(
        model_type: ModelType,
        means: &[Vec<f64>],
        state_space: StateSpace,
        config: &ModelConfig,
    ) -> Self {
        let max_coverage = config.max_coverage();
        let hap_index = state_space.index(State::Haploid);
        let dists: Vec<EmissionDistEnum> = match model_type {
            ModelType::Gaussian => means
                .iter()
                .map(|m| Gaussian::by_mean(m, 1.0).into())
                .collect(),
            ModelType::NegativeBinomial => means
                .iter()
                .map(|m| NegativeBinomial::by_mean(m, 1.5, max_coverage).into())
                .collect(),
            ModelType::TruncExpGaussian => {
                let trunc_point = means[hap_index][0] * config.trunc_point_cov_fraction();
                means
                    .iter()
                    .enumerate()
                    .map(|(s, m)| {
                        if s == 0 {
                            TruncExponential::new(1.0, trunc_point).into()
                        } else {
                            Gaussian::by_mean(m, 1.0).into()
                        }
                    })
                    .collect()
            }
        };
        let collapsed_comps = means[state_space.index(State::Collapsed)].len();
        let bindings = default_bindings(
            model_type,
            collapsed_comps,
            state_space,
            config.err_binding_coef(),
        );
        let num_dists = dists.len();
        Self {
            dists,
            bindings,
            count_data: Mutex::new(vec![vec![0.0; max_coverage + 1]; num_dists]),
            model_type,
            state_space,
            max_coverage,
        }
    }

    /// Returns the number of states.
    #[must_use]
    pub fn num_dists(&self) -> usize {
        self.dists.len()
    }

    /// Returns the state space of this series.
    #[must_use]
    pub const fn state_space(&self) -> StateSpace {
        self.state_space
    }

    /// Returns the distribution of one state.
    #[must_use]
    pub fn dist(&self, state: usize) -> &EmissionDistEnum {
        &self.dists[state]
    }

    /// Overwrites one parameter without convergence bookkeeping.
    pub fn set_parameter(&mut self, state: usize, kind: ParamKind, comp: usize, value: f64) {
        self.dists[state].set_parameter(kind, comp, value);
    }

    /// Applies `f` to every distribution.
    pub fn for_each_dist_mut(&mut self, mut f: impl FnMut(&mut EmissionDistEnum)) {
        for dist in &mut self.dists {
            f(dist);
        }
    }

    /// Returns the emission probability of `x` under one state.
    #[must_use]
    pub fn prob(&self, state: usize, x: usize, pre_x: usize, alpha: f64, beta: f64) -> f64 {
        self.dists[state].prob(x, pre_x, alpha, beta)
    }

    /// Adds one observation's weighted statistics to the estimators of one
    /// state.
    pub fn update_estimator(
        &mut self,
        state: usize,
        x: usize,
        pre_x: usize,
        alpha: f64,
        beta: f64,
        weight: f64,
    ) {
        self.dists[state].update_estimator(x, pre_x, alpha, beta, weight);
    }

    fn count_data_mut(&mut self) -> &mut Vec<Vec<f64>> {
        self.count_data
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds `weight` to the count histogram of one state at coverage `x`.
    pub fn increment_count_data(&mut self, state: usize, x: usize, weight: f64) {
        let max_coverage = self.max_coverage;
        self.count_data_mut()[state][x.min(max_coverage)] += weight;
    }

    /// Drains the count histograms into the per-parameter estimators.
    ///
    /// Equivalent to the per-observation E-step when the auto-regressive
    /// coupling is zero and no contig-end adjustment is applied.
    pub fn update_estimators_from_count_data(&mut self) {
        let histograms = self.count_data_mut().clone();
        for (state, hist) in histograms.iter().enumerate() {
            for (x, &count) in hist.iter().enumerate() {
                if count > 0.0 {
                    self.dists[state].update_estimator(x, 0, 0.0, 1.0, count);
                }
            }
        }
    }

    /// Folds another series' estimators and count histograms into this one
    /// under the destination locks.
    pub fn merge_estimators_from(&self, other: &Self) {
        for (dst, src) in self.dists.iter().zip(&other.dists) {
            dst.merge_estimators_from(src);
        }
        let src = other
            .count_data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut dst = self.count_data.lock().unwrap_or_else(PoisonError::into_inner);
        for (d_hist, s_hist) in dst.iter_mut().zip(&src) {
            for (d, s) in d_hist.iter_mut().zip(s_hist) {
                *d += s;
            }
        }
    }

    /// Zeroes estimators and count histograms.
    pub fn reset_estimators(&mut self) {
        for dist in &mut self.dists {
            dist.reset_estimators();
        }
        for hist in self.count_data_mut() {
            hist.fill(0.0);
        }
    }

    /// Rescales every state's mixture weights to sum to one.
    pub fn normalize_weights(&mut self) -> Result<()> {
        for dist in &mut self.dists {
            dist.normalize_weights()?;
        }
        Ok(())
    }

    /// Returns whether every distribution is feasible.
    #[must_use]
    pub fn is_feasible(&self) -> bool {
        self.dists.iter().all(EmissionDist::is_feasible)
    }

    /// Accumulates the bound sufficient statistics for one parameter kind
    /// over all participating (state, component) cells.
    fn bound_estimator(&self, dist_kind: DistKind, kind: ParamKind) -> ParameterEstimator {
        let row = kind.binding_row();
        let mut bound = ParameterEstimator::new(1);
        for (dist, binding) in self.dists.iter().zip(&self.bindings) {
            if dist.kind() != dist_kind {
                continue;
            }
            let estimator = dist.estimator(kind);
            for comp in 0..binding.num_comps() {
                let coef = binding.coef(row, comp);
                if coef > 0.0 {
                    bound.increment(
                        estimator.numerator(comp) / coef,
                        estimator.denominator(comp),
                        0,
                    );
                }
            }
        }
        bound
    }

    /// M-step for a single parameter kind: solve the bound estimate once,
    /// redistribute it through the coefficients, and estimate unbound cells
    /// independently. Returns whether every applied update converged.
    fn estimate_one_kind(&mut self, dist_kind: DistKind, kind: ParamKind, config: &ModelConfig) -> bool {
        let mut all_converged = true;
        let bound = self.bound_estimator(dist_kind, kind);
        let (bound_value, bound_count) = if bound.denominator(0) > 0.0 {
            bound.estimate(0)
        } else {
            (0.0, 0.0)
        };
        let row = kind.binding_row();
        for state in 0..self.dists.len() {
            if self.dists[state].kind() != dist_kind {
                continue;
            }
            for comp in 0..self.bindings[state].num_comps() {
                let coef = self.bindings[state].coef(row, comp);
                let (value, count) = if coef > 0.0 {
                    (bound_value * coef, bound_count)
                } else {
                    self.dists[state].estimate(kind, comp)
                };
                if count > config.min_count_for_parameter_update() {
                    all_converged &= self.dists[state].update_parameter(
                        kind,
                        comp,
                        value,
                        config.convergence_tol(),
                    );
                }
            }
        }
        all_converged
    }

    /// Runs the M-step for every parameter of the series.
    ///
    /// After the updates, negative-binomial digamma tables are rebuilt and
    /// the truncation point of the mixed model is re-tied to the haploid
    /// mean. Returns whether every applied update converged.
    pub fn estimate_parameters(&mut self, config: &ModelConfig) -> bool {
        let mut all_converged = true;
        match self.model_type {
            ModelType::Gaussian | ModelType::TruncExpGaussian => {
                for kind in GAUSSIAN_KINDS {
                    all_converged &= self.estimate_one_kind(DistKind::Gaussian, kind, config);
                }
                if self.model_type == ModelType::TruncExpGaussian {
                    all_converged &= self.estimate_one_kind(
                        DistKind::TruncExponential,
                        ParamKind::TruncExpLambda,
                        config,
                    );
                    let hap = self.state_space.index(State::Haploid);
                    let new_point = self.dists[hap].parameter(ParamKind::GaussianMean, 0)
                        * config.trunc_point_cov_fraction();
                    self.dists[0].update_parameter(
                        ParamKind::TruncExpPoint,
                        0,
                        new_point,
                        config.convergence_tol(),
                    );
                }
            }
            ModelType::NegativeBinomial => {
                for kind in NB_KINDS {
                    all_converged &= self.estimate_one_kind(DistKind::NegativeBinomial, kind, config);
                }
                for dist in &mut self.dists {
                    if let EmissionDistEnum::NegativeBinomial(nb) = dist {
                        nb.fill_digamma_table();
                    }
                }
            }
        }
        all_converged
    }

    /// Returns `(state name, family name, parameter name, values)` rows for
    /// reporting.
    #[must_use]
    pub fn parameter_rows(&self) -> Vec<(&'static str, &'static str, &'static str, Vec<f64>)> {
        self.state_space
            .states()
            .iter()
            .zip(&self.dists)
            .flat_map(|(state, dist)| {
                dist.display_parameters()
                    .into_iter()
                    .map(|(param, values)| (state.short_name(), dist.name(), param, values))
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}
