//! Random variables of the stag-hunt factor graph.
//!
//! A variable's identity is the value itself: `(time, kind, agent)`. There is
//! no allocation step, so two independently built models agree on every
//! variable they share and variables can be used directly as map keys.
//!
//! The derived ordering (time first, then kind, then agent) is the canonical
//! order for edge orientation: an undirected edge is stored once, from the
//! smaller variable to the larger one.

use std::fmt;

/// Kind of random variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum VarKind {
    /// An agent's grid position (`x`).
    Position,
    /// Auxiliary joint-capture variable (`q`) shared by `agent` and `partner`
    /// at the terminal step of the decomposed model.
    Capture { partner: usize },
}

/// A random variable identified by `(time, kind, agent)`.
///
/// Times are 1-based and agent ids are 0-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Variable {
    pub time: usize,
    pub kind: VarKind,
    pub agent: usize,
}

impl Variable {
    /// Position variable of `agent` at `time`.
    pub const fn position(time: usize, agent: usize) -> Self {
        Self {
            time,
            kind: VarKind::Position,
            agent,
        }
    }

    /// Capture variable of the agent pair `{a, b}` at `time`.
    ///
    /// The pair is unordered: the lower id is stored as `agent`.
    pub fn capture(time: usize, a: usize, b: usize) -> Self {
        let (agent, partner) = if a <= b { (a, b) } else { (b, a) };
        Self {
            time,
            kind: VarKind::Capture { partner },
            agent,
        }
    }

    pub fn is_position(&self) -> bool {
        matches!(self.kind, VarKind::Position)
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            VarKind::Position => write!(f, "x[t={}, a={}]", self.time, self.agent),
            VarKind::Capture { partner } => {
                write!(f, "q[t={}, a={}, b={}]", self.time, self.agent, partner)
            }
        }
    }
}

/// Orientation of a requested edge relative to its stored orientation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    /// The request matches the stored `(smaller, larger)` order.
    Forward,
    /// The request is the reverse of the stored order; the potential is the
    /// transpose of the stored slice.
    Reversed,
}

/// Returns the canonical `(smaller, larger)` ordering of a pair together with
/// the orientation of the input relative to it.
pub fn canonical_pair(a: Variable, b: Variable) -> ((Variable, Variable), Orientation) {
    if a <= b {
        ((a, b), Orientation::Forward)
    } else {
        ((b, a), Orientation::Reversed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_time_major() {
        let early = Variable::position(1, 5);
        let late = Variable::position(2, 0);
        assert!(early < late);
        assert!(Variable::position(3, 0) < Variable::position(3, 1));
    }

    #[test]
    fn positions_precede_captures_at_same_time() {
        let x = Variable::position(4, 1);
        let q = Variable::capture(4, 0, 1);
        assert!(x < q);
    }

    #[test]
    fn capture_pair_is_unordered() {
        assert_eq!(Variable::capture(2, 3, 1), Variable::capture(2, 1, 3));
    }

    #[test]
    fn canonical_pair_reports_orientation() {
        let a = Variable::position(1, 0);
        let b = Variable::position(2, 0);
        assert_eq!(canonical_pair(a, b), ((a, b), Orientation::Forward));
        assert_eq!(canonical_pair(b, a), ((a, b), Orientation::Reversed));
    }
}
