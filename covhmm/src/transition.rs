//! Row-stochastic transition model with validity-gated state admissibility.

use crate::error::{Error, Result};
use crate::state::{State, StateSpace};
use crate::track::CoverageInfo;
use itertools::Itertools;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Coverage-ratio thresholds consumed by the validity predicates.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct TransitionRequirements {
    /// Minimum highly-clipped ratio required for the misjoin state.
    pub min_highly_clipped_ratio: f64,
    /// Maximum high-MAPQ ratio allowed for the duplicated state.
    pub max_high_mapq_ratio: f64,
    /// Minimum high-MAPQ ratio required for the collapsed state.
    pub min_high_mapq_ratio: f64,
}

/// A predicate that can veto a state at a position based on its coverage
/// measurements.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ValidityCheck {
    /// Duplicated sequence should not be dominated by high-MAPQ alignments.
    DupByMapq,
    /// Collapsed sequence must retain enough high-MAPQ alignments.
    ColByMapq,
    /// Misjoins must show highly clipped alignments.
    MsjByClipping,
}

impl ValidityCheck {
    /// Returns `false` when the predicate vetoes `state` at a position with
    /// the given measurements.
    #[must_use]
    pub fn is_valid(
        self,
        state: State,
        info: &CoverageInfo,
        requirements: &TransitionRequirements,
    ) -> bool {
        match self {
            Self::DupByMapq => {
                state != State::Duplicated
                    || info.high_mapq_ratio() <= requirements.max_high_mapq_ratio
            }
            Self::ColByMapq => {
                state != State::Collapsed
                    || info.high_mapq_ratio() >= requirements.min_high_mapq_ratio
            }
            Self::MsjByClipping => {
                state != State::Misjoin
                    || info.high_clip_ratio() >= requirements.min_highly_clipped_ratio
            }
        }
    }
}

/// Raw and pseudo transition counts feeding the M-step.
///
/// The raw counts sit behind a mutex so that chunk tasks can merge their
/// private counts into the shared model concurrently; the exclusive
/// increment path does not take the lock.
#[derive(Debug, Deserialize, Serialize)]
pub struct TransitionCountData {
    counts: Mutex<Array2<f64>>,
    pseudo_counts: Array2<f64>,
}

impl Clone for TransitionCountData {
    fn clone(&self) -> Self {
        Self {
            counts: Mutex::new(self.counts_lock().clone()),
            pseudo_counts: self.pseudo_counts.clone(),
        }
    }
}

impl TransitionCountData {
    fn new(num_states: usize) -> Self {
        let dim = num_states + 1;
        Self {
            counts: Mutex::new(Array2::zeros((dim, dim))),
            pseudo_counts: Array2::zeros((dim, dim)),
        }
    }

    fn counts_lock(&self) -> MutexGuard<'_, Array2<f64>> {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn counts_mut(&mut self) -> &mut Array2<f64> {
        self.counts.get_mut().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds `count` to the `(pre, state)` cell.
    pub fn increment(&mut self, pre: usize, state: usize, count: f64) {
        self.counts_mut()[[pre, state]] += count;
    }

    /// Folds another count matrix into this one under this matrix's lock.
    pub fn merge_from(&self, other: &Self) {
        let src = other.counts_lock().clone();
        let mut dst = self.counts_lock();
        *dst += &src;
    }

    /// Zeroes the raw counts, keeping pseudo-counts.
    pub fn reset(&mut self) {
        self.counts_mut().fill(0.0);
    }

    /// Sets every pseudo-count cell to `value`.
    pub fn fill_pseudo_counts(&mut self, value: f64) {
        self.pseudo_counts.fill(value);
    }

    /// Parses a pseudo-count matrix from a tab-delimited file with one row
    /// per line; the matrix must be `(N+1) x (N+1)`.
    pub fn parse_pseudo_counts_from_file(&mut self, path: &Path) -> Result<()> {
        let dim = self.pseudo_counts.nrows();
        let reader = BufReader::new(File::open(path)?);
        let mut rows = 0;
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let values: Vec<f64> = line
                .split('\t')
                .map(|field| {
                    field.trim().parse().map_err(|_| Error::Parse {
                        path: path.display().to_string(),
                        line: line_no + 1,
                        reason: format!("bad matrix entry `{field}`"),
                    })
                })
                .collect::<Result<_>>()?;
            if values.len() != dim || rows >= dim {
                return Err(Error::Parse {
                    path: path.display().to_string(),
                    line: line_no + 1,
                    reason: format!("expected a {dim}x{dim} matrix"),
                });
            }
            for (column, value) in values.into_iter().enumerate() {
                self.pseudo_counts[[rows, column]] = value;
            }
            rows += 1;
        }
        if rows != dim {
            return Err(Error::Parse {
                path: path.display().to_string(),
                line: rows,
                reason: format!("expected {dim} rows, found {rows}"),
            });
        }
        Ok(())
    }
}

/// Transition probabilities between states, with the extra row/column `N`
/// holding the start distribution and the termination probabilities.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Transition {
    matrix: Array2<f64>,
    count_data: TransitionCountData,
    checks: Vec<ValidityCheck>,
    requirements: TransitionRequirements,
    state_space: StateSpace,
    termination_prob: f64,
}

impl Transition {
    /// Creates a transition matrix with uniform probabilities everywhere,
    /// then row-normalized to the termination probability.
    #[must_use]
    pub fn uniform(
        state_space: StateSpace,
        requirements: TransitionRequirements,
        termination_prob: f64,
    ) -> Self {
        let num_states = state_space.len();
        let dim = num_states + 1;
        let mut transition = Self {
            matrix: Array2::from_elem((dim, dim), 1.0 / dim as f64),
            count_data: TransitionCountData::new(num_states),
            checks: Vec::new(),
            requirements,
            state_space,
            termination_prob,
        };
        transition.normalize_rows();
        for state in 0..num_states {
            transition.matrix[[num_states, state]] = 1.0 / num_states as f64;
        }
        transition
    }

    /// Creates a transition matrix biased toward staying in the same state.
    #[must_use]
    pub fn symmetric_biased(
        state_space: StateSpace,
        requirements: TransitionRequirements,
        diagonal_prob: f64,
        termination_prob: f64,
    ) -> Self {
        let num_states = state_space.len();
        let dim = num_states + 1;
        let off_diagonal =
            (1.0 - diagonal_prob) / (num_states - 1) as f64 * (1.0 - termination_prob);
        let mut matrix = Array2::from_elem((dim, dim), off_diagonal);
        for state in 0..num_states {
            matrix[[state, state]] = diagonal_prob * (1.0 - termination_prob);
            matrix[[num_states, state]] = 1.0 / num_states as f64;
            matrix[[state, num_states]] = termination_prob;
        }
        matrix[[num_states, num_states]] = 0.0;
        Self {
            matrix,
            count_data: TransitionCountData::new(num_states),
            checks: Vec::new(),
            requirements,
            state_space,
            termination_prob,
        }
    }

    /// Returns the number of states (excluding the start/termination index).
    #[must_use]
    pub fn num_states(&self) -> usize {
        self.state_space.len()
    }

    /// Returns the state space.
    #[must_use]
    pub const fn state_space(&self) -> StateSpace {
        self.state_space
    }

    /// Returns the per-state termination probability.
    #[must_use]
    pub const fn termination_prob(&self) -> f64 {
        self.termination_prob
    }

    /// Registers a validity predicate.
    pub fn add_check(&mut self, check: ValidityCheck) {
        self.checks.push(check);
    }

    /// Registers the three default predicates.
    pub fn add_default_checks(&mut self) {
        self.add_check(ValidityCheck::DupByMapq);
        self.add_check(ValidityCheck::ColByMapq);
        if !self.state_space.excludes_misjoin() {
            self.add_check(ValidityCheck::MsjByClipping);
        }
    }

    /// Returns whether every cell lies in `[0, 1]`.
    #[must_use]
    pub fn is_feasible(&self) -> bool {
        let n = self.num_states();
        self.matrix
            .slice(ndarray::s![..n, ..n])
            .iter()
            .all(|&p| (0.0..=1.0).contains(&p))
    }

    /// Returns `P(state | pre)` without validity gating.
    #[must_use]
    pub fn prob(&self, pre: usize, state: usize) -> f64 {
        self.matrix[[pre, state]]
    }

    /// Overwrites one matrix cell; used when a flattened parameter vector
    /// is written back.
    pub fn set_prob(&mut self, pre: usize, state: usize, value: f64) {
        self.matrix[[pre, state]] = value;
    }

    /// Returns the start probability of `state`.
    #[must_use]
    pub fn start_prob(&self, state: usize) -> f64 {
        self.matrix[[self.num_states(), state]]
    }

    /// Returns the termination probability of `state`.
    #[must_use]
    pub fn termination_prob_of(&self, state: usize) -> f64 {
        self.matrix[[state, self.num_states()]]
    }

    /// Returns whether `state` survives every predicate at a position.
    #[must_use]
    pub fn is_state_valid(&self, state: usize, info: &CoverageInfo) -> bool {
        // the start/termination index is never vetoed
        let Some(state) = self.state_space.get(state) else {
            return true;
        };
        self.checks
            .iter()
            .all(|check| check.is_valid(state, info, &self.requirements))
    }

    /// Returns `P(state | pre)` renormalized over the states that are valid
    /// at the position; vetoed targets get zero.
    #[must_use]
    pub fn prob_conditional(&self, pre: usize, state: usize, info: &CoverageInfo) -> f64 {
        if !self.is_state_valid(state, info) {
            return 0.0;
        }
        let total_valid: f64 = (0..=self.num_states())
            .filter(|&s| self.is_state_valid(s, info))
            .map(|s| self.prob(pre, s))
            .sum();
        self.prob(pre, state) / total_valid
    }

    /// Returns mutable access to the count data.
    pub fn count_data_mut(&mut self) -> &mut TransitionCountData {
        &mut self.count_data
    }

    /// Folds another transition's raw counts into this one under the count
    /// matrix's lock.
    pub fn merge_counts_from(&self, other: &Self) {
        self.count_data.merge_from(&other.count_data);
    }

    /// Zeroes the raw counts.
    pub fn reset_counts(&mut self) {
        self.count_data.reset();
    }

    /// Rescales each state row to sum to `1 - termination_prob` and
    /// restores the fixed termination column and empty-sequence cell.
    pub fn normalize_rows(&mut self) {
        let n = self.num_states();
        for pre in 0..n {
            let row_sum: f64 = (0..n).map(|s| self.matrix[[pre, s]]).sum();
            for s in 0..n {
                self.matrix[[pre, s]] =
                    self.matrix[[pre, s]] / row_sum * (1.0 - self.termination_prob);
            }
            self.matrix[[pre, n]] = self.termination_prob;
        }
        self.matrix[[n, n]] = 0.0;
    }

    /// M-step: re-estimates the state rows from raw plus pseudo counts,
    /// resets the start row to uniform, and reports whether every cell
    /// moved less than `tol` in relative terms.
    pub fn estimate_matrix(&mut self, tol: f64) -> bool {
        let mut all_converged = true;
        let n = self.num_states();
        let counts = self.count_data.counts_mut().clone();
        for pre in 0..n {
            let row_sum: f64 = (0..n)
                .map(|s| counts[[pre, s]] + self.count_data.pseudo_counts[[pre, s]])
                .sum();
            for s in 0..n {
                let old_value = self.matrix[[pre, s]];
                let new_value = (counts[[pre, s]] + self.count_data.pseudo_counts[[pre, s]])
                    / row_sum
                    * (1.0 - self.termination_prob);
                self.matrix[[pre, s]] = new_value;
                let diff_ratio = if old_value > 1e-6 {
                    (new_value / old_value - 1.0).abs()
                } else {
                    0.0
                };
                all_converged &= diff_ratio < tol;
            }
        }
        for pre in 0..n {
            self.matrix[[pre, n]] = self.termination_prob;
        }
        for s in 0..n {
            self.matrix[[n, s]] = 1.0 / n as f64;
        }
        self.matrix[[n, n]] = 0.0;
        all_converged
    }

    /// Writes the matrix as TSV with state-name row/column headers.
    pub fn write_tsv(&self, writer: &mut impl Write) -> Result<()> {
        let names: Vec<&str> = self
            .state_space
            .states()
            .iter()
            .map(|s| s.short_name())
            .chain(std::iter::once("Start/End"))
            .collect();
        writeln!(writer, "#state\t{}", names.join("\t"))?;
        for (pre, name) in names.iter().enumerate() {
            let row = (0..=self.num_states())
                .map(|s| format!("{:.4e}", self.matrix[[pre, s]]))
                .join("\t");
            writeln!(writer, "{name}\t{row}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    fn test_requirements() -> TransitionRequirements {
        TransitionRequirements {
            min_highly_clipped_ratio: 0.9,
            max_high_mapq_ratio: 0.25,
            min_high_mapq_ratio: 0.75,
        }
    }

    fn row_sums_hold(transition: &Transition) {
        let n = transition.num_states();
        for pre in 0..n {
            let row_sum: f64 = (0..n).map(|s| transition.prob(pre, s)).sum();
            assert_approx_eq!(
                f64,
                row_sum,
                1.0 - transition.termination_prob(),
                epsilon = 1e-9
            );
            assert_approx_eq!(
                f64,
                transition.termination_prob_of(pre),
                transition.termination_prob(),
                epsilon = 1e-12
            );
        }
        let start_sum: f64 = (0..=n).map(|s| transition.prob(n, s)).sum();
        assert_approx_eq!(f64, start_sum, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn symmetric_biased_rows_are_normalized() {
        let space = StateSpace::new(false);
        let transition = Transition::symmetric_biased(space, test_requirements(), 0.99, 1e-4);
        row_sums_hold(&transition);
        assert!(transition.prob(0, 0) > transition.prob(0, 1));
    }

    #[test]
    fn m_step_preserves_row_invariants() {
        let space = StateSpace::new(false);
        let mut transition = Transition::symmetric_biased(space, test_requirements(), 0.9, 1e-4);
        transition.count_data_mut().fill_pseudo_counts(1.0);
        transition.count_data_mut().increment(0, 2, 50.0);
        transition.count_data_mut().increment(2, 2, 950.0);
        transition.estimate_matrix(1e-3);
        row_sums_hold(&transition);
        assert!(transition.prob(2, 2) > transition.prob(2, 0));
    }

    #[test]
    fn validity_checks_gate_states() {
        let requirements = test_requirements();
        let info = CoverageInfo {
            coverage: 100,
            high_mapq_coverage: 100,
            high_clip_coverage: 0,
            ..CoverageInfo::default()
        };
        // almost all coverage is high-MAPQ: duplication is ruled out,
        // collapse is allowed
        assert!(!ValidityCheck::DupByMapq.is_valid(State::Duplicated, &info, &requirements));
        assert!(ValidityCheck::ColByMapq.is_valid(State::Collapsed, &info, &requirements));
        assert!(!ValidityCheck::MsjByClipping.is_valid(State::Misjoin, &info, &requirements));
        // predicates never veto other states
        assert!(ValidityCheck::DupByMapq.is_valid(State::Haploid, &info, &requirements));
    }

    #[test]
    fn conditional_probs_renormalize_over_valid_states() {
        let space = StateSpace::new(false);
        let mut transition = Transition::uniform(space, test_requirements(), 1e-4);
        transition.add_default_checks();
        let info = CoverageInfo {
            coverage: 100,
            high_mapq_coverage: 100,
            high_clip_coverage: 0,
            ..CoverageInfo::default()
        };
        // duplicated and misjoin are vetoed at this position
        assert_eq!(transition.prob_conditional(2, 1, &info), 0.0);
        assert_eq!(transition.prob_conditional(2, 4, &info), 0.0);
        let total: f64 = (0..=space.len())
            .map(|s| transition.prob_conditional(2, s, &info))
            .sum();
        assert_approx_eq!(f64, total, 1.0, epsilon = 1e-9);
    }
}
