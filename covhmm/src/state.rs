//! Assembly-state labels and the ordered state space of a model.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A categorical assembly-state label.
///
/// The collapsed state carries several mixture components, one per collapse
/// multiplicity; the multiplicities are expressed through parameter bindings
/// rather than through extra states.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum State {
    /// Erroneous sequence with close to zero read support.
    Erroneous,
    /// Falsely duplicated sequence at roughly half coverage.
    Duplicated,
    /// Correctly assembled haploid sequence.
    Haploid,
    /// Collapsed repeats at integer multiples of the haploid coverage.
    Collapsed,
    /// Misjoined sequence flagged by clipped alignments.
    Misjoin,
}

impl State {
    /// Short name used in TSV outputs.
    #[must_use]
    pub const fn short_name(self) -> &'static str {
        match self {
            Self::Erroneous => "Err",
            Self::Duplicated => "Dup",
            Self::Haploid => "Hap",
            Self::Collapsed => "Col",
            Self::Misjoin => "Msj",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

const ALL_STATES: [State; 5] = [
    State::Erroneous,
    State::Duplicated,
    State::Haploid,
    State::Collapsed,
    State::Misjoin,
];

/// The ordered set of states a model distinguishes.
///
/// The misjoin state can be excluded by configuration; every other state is
/// always present and keeps its position in the ordering.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct StateSpace {
    exclude_misjoin: bool,
}

impl StateSpace {
    /// Creates a state space, optionally without the misjoin state.
    #[must_use]
    pub const fn new(exclude_misjoin: bool) -> Self {
        Self { exclude_misjoin }
    }

    /// Returns whether the misjoin state is excluded.
    #[must_use]
    pub const fn excludes_misjoin(&self) -> bool {
        self.exclude_misjoin
    }

    /// Returns the number of states.
    #[must_use]
    pub const fn len(&self) -> usize {
        if self.exclude_misjoin {
            ALL_STATES.len() - 1
        } else {
            ALL_STATES.len()
        }
    }

    /// Returns `true` if the state space is empty; it never is.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// Returns the states in their fixed order.
    #[must_use]
    pub fn states(&self) -> &'static [State] {
        &ALL_STATES[..self.len()]
    }

    /// Returns the position of `state` in the ordering.
    #[must_use]
    pub fn index(&self, state: State) -> usize {
        ALL_STATES
            .iter()
            .position(|&s| s == state)
            .expect("state is always one of the five labels")
    }

    /// Returns the state at position `index`, or `None` past the end.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<State> {
        self.states().get(index).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_stable() {
        let space = StateSpace::new(false);
        assert_eq!(space.len(), 5);
        assert_eq!(space.index(State::Erroneous), 0);
        assert_eq!(space.index(State::Duplicated), 1);
        assert_eq!(space.index(State::Haploid), 2);
        assert_eq!(space.index(State::Collapsed), 3);
        assert_eq!(space.index(State::Misjoin), 4);
    }

    #[test]
    fn misjoin_can_be_excluded() {
        let space = StateSpace::new(true);
        assert_eq!(space.len(), 4);
        assert_eq!(space.get(3), Some(State::Collapsed));
        assert_eq!(space.get(4), None);
    }
}
