//! The multi-region hidden Markov model.

use crate::config::{ModelConfig, ModelType};
use crate::emission::EmissionDist;
use crate::error::{Error, Result};
use crate::series::EmissionDistSeries;
use crate::state::{State, StateSpace};
use crate::transition::{Transition, TransitionRequirements};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;

/// A hidden Markov model with one emission series and one transition matrix
/// per region, coupled through a shared auto-regressive matrix.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Hmm {
    series_per_region: Vec<EmissionDistSeries>,
    transition_per_region: Vec<Transition>,
    alpha: Array2<f64>,
    model_type: ModelType,
    state_space: StateSpace,
    config: ModelConfig,
    log_likelihood: f64,
    generation: u64,
}

impl Hmm {
    /// Builds a model from initial per-state means.
    ///
    /// `means[s]` holds the component means of state `s` for a region with
    /// unit scale; each region scales the whole shape by its entry in
    /// `mean_scale_per_region`. `alpha` must be `(N+1) x (N+1)` where `N`
    /// is the number of states; `diagonal_prob` selects a symmetric-biased
    /// transition start point, `None` a uniform one.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        model_type: ModelType,
        means: &[Vec<f64>],
        mean_scale_per_region: &[f64],
        requirements: TransitionRequirements,
        diagonal_prob: Option<f64>,
        alpha: Array2<f64>,
        state_space: StateSpace,
        config: ModelConfig,
    ) -> Result<Self> {
        let num_states = state_space.len();
        if means.len() != num_states {
            return Err(Error::Config(format!(
                "expected {num_states} mean rows, found {}",
                means.len()
            )));
        }
        if alpha.dim() != (num_states + 1, num_states + 1) {
            return Err(Error::Config(format!(
                "alpha matrix must be {0}x{0}",
                num_states + 1
            )));
        }
        if mean_scale_per_region.is_empty() {
            return Err(Error::Config("at least one region is required".to_string()));
        }
        let series_per_region = mean_scale_per_region
            .iter()
            .map(|&scale| {
                let scaled: Vec<Vec<f64>> = means
                    .iter()
                    .map(|row| row.iter().map(|m| m * scale).collect())
                    .collect();
                EmissionDistSeries::for_model(model_type, &scaled, state_space, &config)
            })
            .collect();
        let transition_per_region = mean_scale_per_region
            .iter()
            .map(|_| {
                let mut transition = diagonal_prob.map_or_else(
                    || Transition::uniform(state_space, requirements, config.termination_prob()),
                    |d| {
                        Transition::symmetric_biased(
                            state_space,
                            requirements,
                            d,
                            config.termination_prob(),
                        )
                    },
                );
                transition.add_default_checks();
                transition
            })
            .collect();
        Ok(Self {
            series_per_region,
            transition_per_region,
            alpha,
            model_type,
            state_space,
            config,
            log_likelihood: f64::NEG_INFINITY,
            generation: 0,
        })
    }

    /// Returns the number of regions.
    #[must_use]
    pub fn num_regions(&self) -> usize {
        self.series_per_region.len()
    }

    /// Returns the number of states.
    #[must_use]
    pub fn num_states(&self) -> usize {
        self.state_space.len()
    }

    /// Returns the state space.
    #[must_use]
    pub const fn state_space(&self) -> StateSpace {
        self.state_space
    }

    /// Returns the model type.
    #[must_use]
    pub const fn model_type(&self) -> ModelType {
        self.model_type
    }

    /// Returns the run configuration.
    #[must_use]
    pub const fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Returns the auto-regressive coupling matrix.
    #[must_use]
    pub const fn alpha(&self) -> &Array2<f64> {
        &self.alpha
    }

    /// Returns whether every coupling coefficient is zero, which enables
    /// the histogram E-step.
    #[must_use]
    pub fn alpha_is_zero(&self) -> bool {
        self.alpha.iter().all(|&a| a == 0.0)
    }

    /// Returns one region's emission series.
    #[must_use]
    pub fn series(&self, region: usize) -> &EmissionDistSeries {
        &self.series_per_region[region]
    }

    /// Returns one region's transition matrix.
    #[must_use]
    pub fn transition(&self, region: usize) -> &Transition {
        &self.transition_per_region[region]
    }

    /// Returns all emission series.
    #[must_use]
    pub fn series_per_region(&self) -> &[EmissionDistSeries] {
        &self.series_per_region
    }

    /// Returns all transitions.
    #[must_use]
    pub fn transitions_per_region(&self) -> &[Transition] {
        &self.transition_per_region
    }

    /// Loads a pseudo-count matrix into every region's transition counts.
    pub fn parse_pseudo_counts_from_file(&mut self, path: &Path) -> Result<()> {
        for transition in &mut self.transition_per_region {
            transition.count_data_mut().parse_pseudo_counts_from_file(path)?;
        }
        Ok(())
    }

    /// Fills every region's pseudo-count matrix with `value`.
    pub fn fill_pseudo_counts(&mut self, value: f64) {
        for transition in &mut self.transition_per_region {
            transition.count_data_mut().fill_pseudo_counts(value);
        }
    }

    /// Returns the global log-likelihood of the last iteration.
    #[must_use]
    pub const fn log_likelihood(&self) -> f64 {
        self.log_likelihood
    }

    /// Sets the global log-likelihood.
    pub fn set_log_likelihood(&mut self, value: f64) {
        self.log_likelihood = value;
    }

    /// Returns the iteration generation; per-chunk tasks capture it when
    /// they are renewed and drop their work if it moved on.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns whether every emission and transition parameter lies in its
    /// domain.
    #[must_use]
    pub fn is_feasible(&self) -> bool {
        self.series_per_region
            .iter()
            .all(EmissionDistSeries::is_feasible)
            && self.transition_per_region.iter().all(Transition::is_feasible)
    }

    /// Starts a new EM iteration: bumps the generation and zeroes every
    /// estimator and transition count.
    pub fn reset_estimators(&mut self) {
        self.generation += 1;
        for series in &mut self.series_per_region {
            series.reset_estimators();
        }
        for transition in &mut self.transition_per_region {
            transition.reset_counts();
        }
    }

    /// M-step over every region. When the histogram E-step was used the
    /// count data must be drained first through `drain_count_data`.
    /// Returns whether every applied update converged.
    pub fn estimate_parameters(&mut self) -> bool {
        let mut all_converged = true;
        for series in &mut self.series_per_region {
            all_converged &= series.estimate_parameters(&self.config);
        }
        for transition in &mut self.transition_per_region {
            all_converged &= transition.estimate_matrix(self.config.convergence_tol());
        }
        all_converged
    }

    /// Drains the per-state count histograms into the estimators; part of
    /// the histogram E-step.
    pub fn drain_count_data(&mut self) {
        for series in &mut self.series_per_region {
            series.update_estimators_from_count_data();
        }
    }

    /// Renormalizes mixture weights and transition rows, used after the
    /// accelerator overwrites parameters.
    pub fn normalize_weights_and_rows(&mut self) -> Result<()> {
        for series in &mut self.series_per_region {
            series.normalize_weights()?;
        }
        for transition in &mut self.transition_per_region {
            transition.normalize_rows();
        }
        Ok(())
    }

    /// Re-derives values that depend on other parameters after a bulk
    /// overwrite: negative-binomial digamma tables and the truncation point
    /// of the mixed model.
    pub fn refresh_derived_parameters(&mut self) {
        use crate::emission::{EmissionDistEnum, ParamKind};
        let hap = self.state_space.index(State::Haploid);
        for series in &mut self.series_per_region {
            if self.model_type == ModelType::TruncExpGaussian {
                let new_point = series.dist(hap).parameter(ParamKind::GaussianMean, 0)
                    * self.config.trunc_point_cov_fraction();
                series.set_parameter(0, ParamKind::TruncExpPoint, 0, new_point);
            }
            if self.model_type == ModelType::NegativeBinomial {
                series.for_each_dist_mut(|dist| {
                    if let EmissionDistEnum::NegativeBinomial(nb) = dist {
                        nb.fill_digamma_table();
                    }
                });
            }
        }
    }

    /// Flattens every free parameter into one vector with a fixed order:
    /// per region, per state, per parameter kind, per component; then each
    /// region's transition state rows followed by its start row.
    #[must_use]
    pub fn flatten_parameters(&self) -> Vec<f64> {
        let n = self.num_states();
        let mut values = Vec::new();
        for series in &self.series_per_region {
            for state in 0..series.num_dists() {
                let dist = series.dist(state);
                for &kind in dist.estimable_kinds() {
                    for comp in 0..dist.num_comps() {
                        values.push(dist.parameter(kind, comp));
                    }
                }
            }
        }
        for transition in &self.transition_per_region {
            for pre in 0..n {
                for state in 0..n {
                    values.push(transition.prob(pre, state));
                }
            }
            for state in 0..n {
                values.push(transition.start_prob(state));
            }
        }
        values
    }

    /// Writes a flattened vector back into the model; inverse of
    /// [`Hmm::flatten_parameters`].
    pub fn set_flattened_parameters(&mut self, values: &[f64]) -> Result<()> {
        let n = self.num_states();
        let mut iter = values.iter().copied();
        let mut next = || {
            iter.next()
                .ok_or_else(|| Error::Numeric("flattened parameter vector too short".to_string()))
        };
        for series in &mut self.series_per_region {
            for state in 0..series.num_dists() {
                let kinds = series.dist(state).estimable_kinds();
                let comps = series.dist(state).num_comps();
                for &kind in kinds {
                    for comp in 0..comps {
                        let value = next()?;
                        series.set_parameter(state, kind, comp, value);
                    }
                }
            }
        }
        for transition in &mut self.transition_per_region {
            for pre in 0..n {
                for state in 0..n {
                    let value = next()?;
                    transition.set_prob(pre, state, value);
                }
            }
            for state in 0..n {
                let value = next()?;
                transition.set_prob(n, state, value);
            }
        }
        if iter.next().is_some() {
            return Err(Error::Numeric(
                "flattened parameter vector too long".to_string(),
            ));
        }
        Ok(())
    }

    /// Writes the per-state emission parameters of every region as TSV.
    pub fn write_emission_tsv(&self, writer: &mut impl Write) -> Result<()> {
        writeln!(writer, "#region\tstate\tdistribution\tparameter\tvalues")?;
        for (region, series) in self.series_per_region.iter().enumerate() {
            for (state, dist_name, param, values) in series.parameter_rows() {
                let joined: Vec<String> = values.iter().map(|v| format!("{v:.4}")).collect();
                writeln!(
                    writer,
                    "{region}\t{state}\t{dist_name}\t{param}\t{}",
                    joined.join("\t")
                )?;
            }
        }
        Ok(())
    }

    /// Writes the transition matrix of every region as TSV.
    pub fn write_transition_tsv(&self, writer: &mut impl Write) -> Result<()> {
        for (region, transition) in self.transition_per_region.iter().enumerate() {
            writeln!(writer, "#region:{region}")?;
            transition.write_tsv(writer)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    fn test_model(regions: usize) -> Hmm {
        let space = StateSpace::new(false);
        let means = vec![
            vec![3.0],
            vec![15.0],
            vec![30.0],
            vec![60.0, 90.0],
            vec![30.0],
        ];
        let requirements = TransitionRequirements {
            min_highly_clipped_ratio: 0.9,
            max_high_mapq_ratio: 0.25,
            min_high_mapq_ratio: 0.75,
        };
        Hmm::new(
            ModelType::Gaussian,
            &means,
            &vec![1.0; regions],
            requirements,
            Some(0.99),
            Array2::zeros((6, 6)),
            space,
            ModelConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn construction_scales_means_per_region() {
        let space = StateSpace::new(false);
        let means = vec![
            vec![3.0],
            vec![15.0],
            vec![30.0],
            vec![60.0, 90.0],
            vec![30.0],
        ];
        let requirements = TransitionRequirements {
            min_highly_clipped_ratio: 0.9,
            max_high_mapq_ratio: 0.25,
            min_high_mapq_ratio: 0.75,
        };
        let model = Hmm::new(
            ModelType::Gaussian,
            &means,
            &[1.0, 2.0],
            requirements,
            Some(0.9),
            Array2::zeros((6, 6)),
            space,
            ModelConfig::default(),
        )
        .unwrap();
        use crate::emission::ParamKind;
        let hap = space.index(State::Haploid);
        assert_approx_eq!(
            f64,
            model.series(0).dist(hap).parameter(ParamKind::GaussianMean, 0),
            30.0,
            ulps = 2
        );
        assert_approx_eq!(
            f64,
            model.series(1).dist(hap).parameter(ParamKind::GaussianMean, 0),
            60.0,
            ulps = 2
        );
    }

    #[test]
    fn flatten_round_trip() {
        let mut model = test_model(2);
        let flattened = model.flatten_parameters();
        assert!(!flattened.is_empty());
        model.set_flattened_parameters(&flattened).unwrap();
        let again = model.flatten_parameters();
        for (a, b) in flattened.iter().zip(&again) {
            assert_approx_eq!(f64, *a, *b, ulps = 2);
        }
    }

    #[test]
    fn fresh_model_is_feasible() {
        let model = test_model(1);
        assert!(model.is_feasible());
    }

    #[test]
    fn infeasible_after_bad_overwrite() {
        let mut model = test_model(1);
        let mut flattened = model.flatten_parameters();
        flattened[0] = -5.0;
        model.set_flattened_parameters(&flattened).unwrap();
        assert!(!model.is_feasible());
    }

    #[test]
    fn reset_bumps_generation() {
        let mut model = test_model(1);
        let before = model.generation();
        model.reset_estimators();
        assert_eq!(model.generation(), before + 1);
    }
}
