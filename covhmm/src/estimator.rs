//! Weighted sufficient-statistic accumulators for the M-step.

use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::warn;

#[derive(Clone, Debug, Deserialize, Serialize)]
struct Stats {
    numerator: Vec<f64>,
    denominator: Vec<f64>,
}

/// Per-component numerator/denominator accumulator for one parameter.
///
/// During the E-step every observation contributes a weighted increment
/// through the exclusive fast path, which touches the statistics without
/// taking the lock. Merging goes through the destination's mutex so that
/// finished chunk tasks can fold their private statistics into the shared
/// model's accumulators concurrently; the merge is associative and
/// commutative, so the arrival order of tasks does not matter.
#[derive(Debug, Deserialize, Serialize)]
pub struct ParameterEstimator {
    stats: Mutex<Stats>,
    num_comps: usize,
}

impl Clone for ParameterEstimator {
    fn clone(&self) -> Self {
        Self {
            stats: Mutex::new(self.lock().clone()),
            num_comps: self.num_comps,
        }
    }
}

impl ParameterEstimator {
    /// Creates a zeroed estimator for `num_comps` mixture components.
    #[must_use]
    pub fn new(num_comps: usize) -> Self {
        Self {
            stats: Mutex::new(Stats {
                numerator: vec![0.0; num_comps],
                denominator: vec![0.0; num_comps],
            }),
            num_comps,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Stats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stats_mut(&mut self) -> &mut Stats {
        self.stats.get_mut().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the number of components this estimator tracks.
    #[must_use]
    pub const fn num_comps(&self) -> usize {
        self.num_comps
    }

    /// Adds to the statistics of component `comp`.
    pub fn increment(&mut self, numerator: f64, denominator: f64, comp: usize) {
        let stats = self.stats_mut();
        stats.numerator[comp] += numerator;
        stats.denominator[comp] += denominator;
    }

    /// Adds `denominator` to every component and `numerator` only to
    /// component `comp`.
    ///
    /// This is the shape of the mixture-weight sufficient statistics, where
    /// each component's weight is its share of the total posterior mass.
    pub fn increment_denominator_for_all_comps(
        &mut self,
        numerator: f64,
        denominator: f64,
        comp: usize,
    ) {
        let stats = self.stats_mut();
        stats.numerator[comp] += numerator;
        for den in &mut stats.denominator {
            *den += denominator;
        }
    }

    /// Folds another estimator's statistics into this one under this
    /// estimator's lock.
    pub fn merge_from(&self, other: &Self) {
        debug_assert_eq!(self.num_comps, other.num_comps);
        let src = other.lock().clone();
        let mut dst = self.lock();
        for (d, s) in dst.numerator.iter_mut().zip(&src.numerator) {
            *d += s;
        }
        for (d, s) in dst.denominator.iter_mut().zip(&src.denominator) {
            *d += s;
        }
    }

    /// Returns the accumulated numerator of component `comp`.
    #[must_use]
    pub fn numerator(&self, comp: usize) -> f64 {
        self.lock().numerator[comp]
    }

    /// Returns the accumulated denominator of component `comp`.
    #[must_use]
    pub fn denominator(&self, comp: usize) -> f64 {
        self.lock().denominator[comp]
    }

    /// Returns `(estimate, count)` for component `comp`, where `count` is
    /// the accumulated denominator.
    ///
    /// A starved component (zero denominator) yields an estimate of zero and
    /// a warning; the caller keeps the previous parameter value in that case
    /// because the count gate fails.
    #[must_use]
    pub fn estimate(&self, comp: usize) -> (f64, f64) {
        let stats = self.lock();
        let count = stats.denominator[comp];
        if count == 0.0 {
            warn!(comp, "estimator denominator is zero, returning 0");
            return (0.0, count);
        }
        (stats.numerator[comp] / count, count)
    }

    /// Zeroes all accumulated statistics.
    pub fn reset(&mut self) {
        let stats = self.stats_mut();
        stats.numerator.fill(0.0);
        stats.denominator.fill(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    #[test]
    fn increment_and_estimate() {
        let mut estimator = ParameterEstimator::new(2);
        estimator.increment(3.0, 1.0, 0);
        estimator.increment(5.0, 1.0, 0);
        estimator.increment(7.0, 2.0, 1);

        let (value, count) = estimator.estimate(0);
        assert_approx_eq!(f64, value, 4.0, ulps = 2);
        assert_approx_eq!(f64, count, 2.0, ulps = 2);
        let (value, count) = estimator.estimate(1);
        assert_approx_eq!(f64, value, 3.5, ulps = 2);
        assert_approx_eq!(f64, count, 2.0, ulps = 2);
    }

    #[test]
    fn starved_component_returns_zero() {
        let estimator = ParameterEstimator::new(1);
        let (value, count) = estimator.estimate(0);
        assert_eq!(value, 0.0);
        assert_eq!(count, 0.0);
    }

    #[test]
    fn weight_increment_touches_all_denominators() {
        let mut estimator = ParameterEstimator::new(3);
        estimator.increment_denominator_for_all_comps(0.25, 0.25, 1);
        assert_approx_eq!(f64, estimator.numerator(1), 0.25, ulps = 2);
        for comp in 0..3 {
            assert_approx_eq!(f64, estimator.denominator(comp), 0.25, ulps = 2);
        }
    }

    #[test]
    fn merge_is_commutative() {
        let mut a = ParameterEstimator::new(2);
        a.increment(1.0, 2.0, 0);
        let mut b = ParameterEstimator::new(2);
        b.increment(3.0, 4.0, 1);

        let ab = a.clone();
        ab.merge_from(&b);
        let ba = b.clone();
        ba.merge_from(&a);

        for comp in 0..2 {
            assert_approx_eq!(f64, ab.numerator(comp), ba.numerator(comp), ulps = 2);
            assert_approx_eq!(f64, ab.denominator(comp), ba.denominator(comp), ulps = 2);
        }
    }

    #[test]
    fn concurrent_merges_are_all_applied() {
        use std::sync::Arc;
        let shared = Arc::new(ParameterEstimator::new(1));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || {
                    let mut private = ParameterEstimator::new(1);
                    for _ in 0..1000 {
                        private.increment(1.0, 1.0, 0);
                    }
                    shared.merge_from(&private);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_approx_eq!(f64, shared.numerator(0), 8000.0, ulps = 2);
        assert_approx_eq!(f64, shared.denominator(0), 8000.0, ulps = 2);
    }

    #[test]
    fn reset_zeroes_everything() {
        let mut estimator = ParameterEstimator::new(2);
        estimator.increment(1.0, 1.0, 0);
        estimator.reset();
        assert_eq!(estimator.numerator(0), 0.0);
        assert_eq!(estimator.denominator(0), 0.0);
    }
}
