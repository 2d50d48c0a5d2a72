//! Forward-backward expectation step for one observation chunk, and the
//! parallel per-iteration driver.
//!
//! The recursions are scaled per column to prevent underflow: after the
//! forward pass `log P(x) = -sum(ln s_t)` where `s_t` is the column scale,
//! and the backward pass reuses the same scales so that
//! `sum_s f_t(s) b_t(s) = 1` holds at every column. The start row of the
//! transition matrix is consumed at the first column and the termination
//! column is folded into the last one.

use crate::error::{Error, Result};
use crate::hmm::Hmm;
use crate::series::EmissionDistSeries;
use crate::track::Chunk;
use crate::transition::Transition;
use ndarray::Array2;
use rayon::prelude::*;
use std::io::Write;
use tracing::info;

/// Forward/backward scratch and per-chunk private estimators for one chunk.
///
/// Each chunk task owns copies of the model's emission series and
/// transitions; their estimators collect this chunk's E-step contributions
/// without locking, and the task folds them into the shared model's
/// accumulators under the accumulator locks once its chunk is done. The
/// parameter copies are renewed at the start of every iteration, freezing a
/// snapshot that the whole E-step of that iteration uses.
pub struct EmChunk {
    chunk: Chunk,
    series: Vec<EmissionDistSeries>,
    transitions: Vec<Transition>,
    alpha: Array2<f64>,
    max_coverage: usize,
    forward: Array2<f64>,
    backward: Array2<f64>,
    scales: Vec<f64>,
    log_px: f64,
    mean_read_length: u32,
    min_read_fraction_at_ends: f64,
    adjust_contig_ends: bool,
    use_histogram: bool,
    generation: u64,
}

impl EmChunk {
    /// Creates the scratch for one chunk from the current model.
    #[must_use]
    pub fn new(chunk: Chunk, model: &Hmm, mean_read_length: u32) -> Self {
        let num_states = model.num_states();
        let len = chunk.len();
        let mut em = Self {
            chunk,
            series: Vec::new(),
            transitions: Vec::new(),
            alpha: model.alpha().clone(),
            max_coverage: model.config().max_coverage(),
            forward: Array2::zeros((len, num_states)),
            backward: Array2::zeros((len, num_states)),
            scales: vec![0.0; len],
            log_px: f64::NEG_INFINITY,
            mean_read_length,
            min_read_fraction_at_ends: 0.0,
            adjust_contig_ends: false,
            use_histogram: false,
            generation: 0,
        };
        em.renew_from_model(model);
        em
    }

    /// Enables the contig-end coverage adjustment with the given read
    /// fraction.
    pub fn set_min_read_fraction_at_ends(&mut self, fraction: f64) {
        self.min_read_fraction_at_ends = fraction;
        self.adjust_contig_ends = fraction > 0.0;
    }

    /// Returns the chunk this scratch operates on.
    #[must_use]
    pub const fn chunk(&self) -> &Chunk {
        &self.chunk
    }

    /// Returns this chunk's log-likelihood contribution.
    #[must_use]
    pub const fn log_px(&self) -> f64 {
        self.log_px
    }

    /// Returns the per-chunk private emission series.
    #[must_use]
    pub fn series(&self) -> &[EmissionDistSeries] {
        &self.series
    }

    /// Returns the per-chunk private transitions.
    #[must_use]
    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    /// Copies the model parameters into the private series/transitions,
    /// zeroes the private estimators and captures the iteration generation.
    pub fn renew_from_model(&mut self, model: &Hmm) {
        self.series = model.series_per_region().to_vec();
        self.transitions = model.transitions_per_region().to_vec();
        self.alpha.assign(model.alpha());
        for series in &mut self.series {
            series.reset_estimators();
        }
        for transition in &mut self.transitions {
            transition.reset_counts();
        }
        self.use_histogram = model.alpha_is_zero() && !self.adjust_contig_ends;
        self.generation = model.generation();
    }

    fn num_states(&self) -> usize {
        self.forward.ncols()
    }

    fn x(&self, column: usize) -> usize {
        (self.chunk.infos()[column].coverage as usize).min(self.max_coverage)
    }

    fn region(&self, column: usize) -> usize {
        self.chunk.infos()[column].region_index
    }

    /// Edge-coverage adjustment for one column: 1 in the interior, a linear
    /// ramp over the first and last `mean_read_length *
    /// min_read_fraction_at_ends` observations.
    #[must_use]
    pub fn adjustment_beta(&self, column: usize) -> f64 {
        if !self.adjust_contig_ends {
            return 1.0;
        }
        let window_len = f64::from(self.chunk.window_len().max(1));
        let ramp = (f64::from(self.mean_read_length) * self.min_read_fraction_at_ends / window_len)
            .round() as usize;
        if ramp == 0 {
            return 1.0;
        }
        let distance = column.min(self.chunk.len() - 1 - column);
        if distance >= ramp {
            1.0
        } else {
            (distance + 1) as f64 / (ramp + 1) as f64
        }
    }

    /// Emission probability of `state` at `column` given the previous
    /// column's state for the auto-regressive coupling. The termination
    /// probability is folded in at the last column.
    fn emission_prob(&self, column: usize, state: usize, pre: usize) -> f64 {
        let region = self.region(column);
        let pre_x = if column == 0 { 0 } else { self.x(column - 1) };
        let alpha = self.alpha[[pre, state]];
        let beta = self.adjustment_beta(column);
        let mut prob = self
            .series[region]
            .prob(state, self.x(column), pre_x, alpha, beta);
        if column == self.chunk.len() - 1 {
            prob *= self.transitions[region].termination_prob_of(state);
        }
        prob
    }

    /// Forward pass with per-column scaling; computes `log P(x)`.
    pub fn run_forward(&mut self) -> Result<()> {
        let n = self.num_states();
        let len = self.chunk.len();
        let start_index = n;
        if let Some(info) = self
            .chunk
            .infos()
            .iter()
            .find(|info| info.region_index >= self.series.len())
        {
            return Err(Error::Config(format!(
                "region index {} out of range for a model with {} regions",
                info.region_index,
                self.series.len()
            )));
        }
        self.log_px = 0.0;
        for column in 0..len {
            let region = self.region(column);
            let info = &self.chunk.infos()[column];
            for state in 0..n {
                let value = if column == 0 {
                    self.transitions[region].prob_conditional(start_index, state, info)
                        * self.emission_prob(column, state, start_index)
                } else {
                    (0..n)
                        .map(|pre| {
                            self.forward[[column - 1, pre]]
                                * self.transitions[region].prob_conditional(pre, state, info)
                                * self.emission_prob(column, state, pre)
                        })
                        .sum()
                };
                self.forward[[column, state]] = value;
            }
            let column_sum: f64 = (0..n).map(|s| self.forward[[column, s]]).sum();
            if !(column_sum.is_finite() && column_sum > 0.0) {
                return Err(Error::Numeric(format!(
                    "forward column {column} of contig {} sums to {column_sum:e}",
                    self.chunk.contig()
                )));
            }
            let scale = 1.0 / column_sum;
            for state in 0..n {
                self.forward[[column, state]] *= scale;
            }
            self.scales[column] = scale;
            self.log_px -= scale.ln();
        }
        Ok(())
    }

    /// Backward pass reusing the forward scales.
    pub fn run_backward(&mut self) {
        let n = self.num_states();
        let len = self.chunk.len();
        for state in 0..n {
            self.backward[[len - 1, state]] = 1.0;
        }
        for column in (0..len.saturating_sub(1)).rev() {
            let next_region = self.region(column + 1);
            let next_info = &self.chunk.infos()[column + 1];
            for state in 0..n {
                let value: f64 = (0..n)
                    .map(|next| {
                        self.transitions[next_region].prob_conditional(state, next, next_info)
                            * self.emission_prob(column + 1, next, state)
                            * self.backward[[column + 1, next]]
                    })
                    .sum();
                self.backward[[column, state]] = value * self.scales[column + 1];
            }
        }
    }

    /// Posterior state distribution at one column; forward and backward
    /// must have run.
    #[must_use]
    pub fn posterior(&self, column: usize) -> Vec<f64> {
        (0..self.num_states())
            .map(|state| self.forward[[column, state]] * self.backward[[column, state]])
            .collect()
    }

    /// Index of the most probable state at one column.
    #[must_use]
    pub fn most_probable_state(&self, column: usize) -> usize {
        let gamma = self.posterior(column);
        gamma
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map_or(0, |(state, _)| state)
    }

    /// E-step: adds the posterior-weighted statistics of every column to
    /// the private estimators, histograms and transition counts.
    ///
    /// The auto-regressive coupling is indexed by the `(pre, state)` pair,
    /// so the emission statistics are decomposed by the joint posterior
    /// `xi` of each pair rather than the marginal `gamma`: posterior mass
    /// that arrived through a state change must not be adjusted with the
    /// self-loop coupling coefficient.
    pub fn update_estimators(&mut self) {
        let n = self.num_states();
        let len = self.chunk.len();
        if self.use_histogram {
            for column in 0..len {
                let region = self.region(column);
                let x = self.x(column);
                let gamma = self.posterior(column);
                for (state, &weight) in gamma.iter().enumerate() {
                    self.series[region].increment_count_data(state, x, weight);
                }
            }
        } else {
            // the first column's only predecessor is the start state
            let region = self.region(0);
            let x = self.x(0);
            let beta = self.adjustment_beta(0);
            let gamma = self.posterior(0);
            for (state, &weight) in gamma.iter().enumerate() {
                let alpha = self.alpha[[n, state]];
                self.series[region].update_estimator(state, x, 0, alpha, beta, weight);
            }
        }
        for column in 0..len.saturating_sub(1) {
            let next_region = self.region(column + 1);
            let next_info = self.chunk.infos()[column + 1];
            let x = self.x(column + 1);
            let pre_x = self.x(column);
            let beta = self.adjustment_beta(column + 1);
            for pre in 0..n {
                for state in 0..n {
                    let xi = self.forward[[column, pre]]
                        * self.transitions[next_region].prob_conditional(pre, state, &next_info)
                        * self.emission_prob(column + 1, state, pre)
                        * self.backward[[column + 1, state]]
                        * self.scales[column + 1];
                    self.transitions[next_region]
                        .count_data_mut()
                        .increment(pre, state, xi);
                    if !self.use_histogram {
                        let alpha = self.alpha[[pre, state]];
                        self.series[next_region].update_estimator(state, x, pre_x, alpha, beta, xi);
                    }
                }
            }
        }
    }

    /// Folds this chunk's private statistics into the shared model under
    /// the model accumulators' locks.
    fn commit_to_model(&self, model: &Hmm) {
        for (dst, src) in model.series_per_region().iter().zip(&self.series) {
            dst.merge_estimators_from(src);
        }
        for (dst, src) in model.transitions_per_region().iter().zip(&self.transitions) {
            dst.merge_counts_from(src);
        }
    }

    /// Runs forward, backward and the E-step for this chunk, then commits
    /// the contributions into the shared model. Returns without committing
    /// anything when the model's generation moved on.
    pub fn run_one_iteration(&mut self, model: &Hmm) -> Result<()> {
        if self.generation != model.generation() {
            return Ok(());
        }
        self.run_forward()?;
        self.run_backward();
        self.update_estimators();
        self.commit_to_model(model);
        Ok(())
    }

    /// Writes the per-window posterior and most probable state as TSV.
    pub fn write_posterior_tsv(&self, writer: &mut impl Write) -> Result<()> {
        let space = self.series[0].state_space();
        for column in 0..self.chunk.len() {
            let (start, end) = self.chunk.window_span(column);
            let gamma = self.posterior(column);
            let best = space
                .get(self.most_probable_state(column))
                .map_or("Unk", |s| s.short_name());
            let formatted: Vec<String> = gamma.iter().map(|g| format!("{g:.4e}")).collect();
            writeln!(
                writer,
                "{}\t{start}\t{end}\t{best}\t{}",
                self.chunk.contig(),
                formatted.join("\t")
            )?;
        }
        Ok(())
    }
}

/// One full EM iteration: parallel E-step over every chunk with each task
/// merging its contributions into the shared model under the accumulator
/// locks, then the M-step. Task failures are recorded per task and drained
/// only after the whole batch has finished. Returns whether every applied
/// parameter update converged.
pub fn run_em_iteration(model: &mut Hmm, chunks: &mut [EmChunk]) -> Result<bool> {
    model.reset_estimators();
    for em in chunks.iter_mut() {
        em.renew_from_model(model);
    }
    {
        let model_ref: &Hmm = model;
        let statuses: Vec<Result<()>> = chunks
            .par_iter_mut()
            .map(|em| {
                em.run_one_iteration(model_ref).map_err(|err| Error::Worker {
                    contig: em.chunk().contig().to_string(),
                    source: Box::new(err),
                })
            })
            .collect();
        for status in statuses {
            status?;
        }
    }

    let log_likelihood: f64 = chunks.iter().map(EmChunk::log_px).sum();
    let use_histogram = chunks.iter().any(|em| em.use_histogram);
    if use_histogram {
        model.drain_count_data();
    }
    let converged = model.estimate_parameters();
    model.set_log_likelihood(log_likelihood);
    Ok(converged)
}

/// Runs EM until convergence or `max_iterations`, logging one line per
/// iteration. Returns whether the model converged.
pub fn fit(model: &mut Hmm, chunks: &mut [EmChunk], max_iterations: usize) -> Result<bool> {
    for iteration in 0..max_iterations {
        let converged = run_em_iteration(model, chunks)?;
        info!(
            iteration,
            log_likelihood = model.log_likelihood(),
            converged,
            "EM iteration finished"
        );
        if converged {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Runs the forward and backward passes of every chunk in parallel against
/// the current model, refreshing posteriors without changing parameters.
/// Task failures are drained after the whole batch has finished.
pub fn run_forward_backward_all(model: &mut Hmm, chunks: &mut [EmChunk]) -> Result<()> {
    model.reset_estimators();
    for em in chunks.iter_mut() {
        em.renew_from_model(model);
    }
    let statuses: Vec<Result<()>> = chunks
        .par_iter_mut()
        .map(|em| {
            let outcome = em.run_forward().map(|()| em.run_backward());
            outcome.map_err(|err| Error::Worker {
                contig: em.chunk().contig().to_string(),
                source: Box::new(err),
            })
        })
        .collect();
    for status in statuses {
        status?;
    }
    Ok(())
}
