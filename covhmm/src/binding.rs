//! Linear coefficients that tie emission parameters across states.

use crate::config::ModelType;
use crate::state::StateSpace;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Binding coefficients for one state's emission distribution.
///
/// `coefs[[p, c]]` couples parameter `p` of component `c` to a shared
/// quantity: a zero coefficient means the component is estimated
/// independently, a positive coefficient `f` means the component's value is
/// `f` times the shared bound estimate. All states whose coefficient for a
/// parameter kind is positive contribute to, and are updated from, the same
/// bound estimator.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ParameterBinding {
    coefs: Array2<f64>,
}

impl ParameterBinding {
    /// Creates a binding for a single-component distribution with one
    /// coefficient per parameter.
    #[must_use]
    pub fn for_single_comp(coefs_per_param: &[f64]) -> Self {
        Self {
            coefs: Array2::from_shape_fn((coefs_per_param.len(), 1), |(p, _)| coefs_per_param[p]),
        }
    }

    /// Creates a binding whose coefficient for parameter `p` of component
    /// `c` is `firsts[p] + c * steps[p]`.
    ///
    /// This is how collapse multiplicities are expressed: the mean
    /// coefficient of the k-th collapsed component is `2 + k`.
    #[must_use]
    pub fn sequence_by_step(firsts: &[f64], steps: &[f64], num_comps: usize) -> Self {
        debug_assert_eq!(firsts.len(), steps.len());
        Self {
            coefs: Array2::from_shape_fn((firsts.len(), num_comps), |(p, c)| {
                (c as f64).mul_add(steps[p], firsts[p])
            }),
        }
    }

    /// Returns the coefficient for parameter index `param` of component
    /// `comp`.
    #[must_use]
    pub fn coef(&self, param: usize, comp: usize) -> f64 {
        self.coefs[[param, comp]]
    }

    /// Returns the number of parameters covered by this binding.
    #[must_use]
    pub fn num_params(&self) -> usize {
        self.coefs.nrows()
    }

    /// Returns the number of components covered by this binding.
    #[must_use]
    pub fn num_comps(&self) -> usize {
        self.coefs.ncols()
    }
}

fn gaussian_bindings(
    collapsed_comps: usize,
    state_space: StateSpace,
    err_coef: f64,
) -> Vec<ParameterBinding> {
    // rows: mean, var, weight; weights are never bound
    let mut bindings = vec![
        ParameterBinding::for_single_comp(&[err_coef, err_coef, 0.0]),
        ParameterBinding::for_single_comp(&[0.5, 0.5, 0.0]),
        ParameterBinding::for_single_comp(&[1.0, 1.0, 0.0]),
        ParameterBinding::sequence_by_step(&[2.0, 2.0, 0.0], &[1.0, 1.0, 0.0], collapsed_comps),
    ];
    if !state_space.excludes_misjoin() {
        bindings.push(ParameterBinding::for_single_comp(&[1.0, 1.0, 0.0]));
    }
    bindings
}

fn negative_binomial_bindings(
    collapsed_comps: usize,
    state_space: StateSpace,
    err_coef: f64,
) -> Vec<ParameterBinding> {
    // rows: theta, lambda, weight; theta is shared across every state except
    // misjoin, which keeps an independent dispersion
    let mut bindings = vec![
        ParameterBinding::for_single_comp(&[1.0, err_coef, 0.0]),
        ParameterBinding::for_single_comp(&[1.0, 0.5, 0.0]),
        ParameterBinding::for_single_comp(&[1.0, 1.0, 0.0]),
        ParameterBinding::sequence_by_step(&[1.0, 2.0, 0.0], &[0.0, 1.0, 0.0], collapsed_comps),
    ];
    if !state_space.excludes_misjoin() {
        bindings.push(ParameterBinding::for_single_comp(&[0.0, 1.0, 0.0]));
    }
    bindings
}

fn trunc_exp_gaussian_bindings(
    collapsed_comps: usize,
    state_space: StateSpace,
    err_coef: f64,
) -> Vec<ParameterBinding> {
    let mut bindings = gaussian_bindings(collapsed_comps, state_space, err_coef);
    // the erroneous state is a truncated exponential with a free rate
    bindings[0] = ParameterBinding::for_single_comp(&[0.0]);
    bindings
}

/// Returns the default binding table for a model, one entry per state in
/// state-space order.
#[must_use]
pub fn default_bindings(
    model_type: ModelType,
    collapsed_comps: usize,
    state_space: StateSpace,
    err_coef: f64,
) -> Vec<ParameterBinding> {
    match model_type {
        ModelType::Gaussian => gaussian_bindings(collapsed_comps, state_space, err_coef),
        ModelType::NegativeBinomial => {
            negative_binomial_bindings(collapsed_comps, state_space, err_coef)
        }
        ModelType::TruncExpGaussian => {
            trunc_exp_gaussian_bindings(collapsed_comps, state_space, err_coef)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    #[test]
    fn collapsed_components_step_by_multiplicity() {
        let binding = ParameterBinding::sequence_by_step(&[2.0, 2.0, 0.0], &[1.0, 1.0, 0.0], 4);
        assert_eq!(binding.num_comps(), 4);
        for comp in 0..4 {
            assert_approx_eq!(f64, binding.coef(0, comp), 2.0 + comp as f64, ulps = 2);
            assert_approx_eq!(f64, binding.coef(2, comp), 0.0, ulps = 2);
        }
    }

    #[test]
    fn gaussian_defaults() {
        let space = StateSpace::new(false);
        let bindings = default_bindings(ModelType::Gaussian, 3, space, 0.1);
        assert_eq!(bindings.len(), 5);
        assert_approx_eq!(f64, bindings[0].coef(0, 0), 0.1, ulps = 2);
        assert_approx_eq!(f64, bindings[1].coef(0, 0), 0.5, ulps = 2);
        assert_approx_eq!(f64, bindings[2].coef(0, 0), 1.0, ulps = 2);
        assert_approx_eq!(f64, bindings[3].coef(0, 2), 4.0, ulps = 2);
        assert_approx_eq!(f64, bindings[4].coef(0, 0), 1.0, ulps = 2);
    }

    #[test]
    fn trunc_exp_err_state_is_unbound() {
        let space = StateSpace::new(true);
        let bindings = default_bindings(ModelType::TruncExpGaussian, 2, space, 0.1);
        assert_eq!(bindings.len(), 4);
        assert_eq!(bindings[0].num_params(), 1);
        assert_approx_eq!(f64, bindings[0].coef(0, 0), 0.0, ulps = 2);
    }

    #[test]
    fn nb_theta_is_shared_except_misjoin() {
        let space = StateSpace::new(false);
        let bindings = default_bindings(ModelType::NegativeBinomial, 2, space, 0.1);
        for state in 0..4 {
            assert_approx_eq!(f64, bindings[state].coef(0, 0), 1.0, ulps = 2);
        }
        assert_approx_eq!(f64, bindings[4].coef(0, 0), 0.0, ulps = 2);
    }
}
