//! Error types for factor graph construction, inference and model orchestration.

use thiserror::Error;

use crate::engine::variables::Variable;

#[cfg(feature = "autodiff")]
impl From<candle_core::Error> for ExecError {
    fn from(err: candle_core::Error) -> Self {
        ExecError::Tensor(err.to_string())
    }
}

/// Errors that can occur while building potentials, populating a factor graph,
/// running belief propagation, or driving the stag-hunt model.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in the future without breaking changes.
///
/// Structural problems (shape mismatches, unknown variables, self loops) are
/// reported before any inference runs. Non-convergence of message passing is
/// *not* an error: it is reported through
/// [`BeliefPropagationDiagnostics`](crate::engine::belief_propagation::BeliefPropagationDiagnostics).
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ExecError {
    /// A potential's shape disagrees with the registered domain of a variable.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A variable was referenced before being registered.
    #[error("unknown variable: {0}")]
    UnknownVariable(Variable),

    /// No edge exists between the two variables in either orientation.
    #[error("unknown edge: {0} -- {1}")]
    UnknownEdge(Variable, Variable),

    /// An edge was requested from a variable to itself.
    #[error("self loop on {0}")]
    SelfLoop(Variable),

    /// Invalid configuration or scenario (e.g. a non-positive payoff scale).
    #[error("validation error: {0}")]
    ValidationError(String),

    /// An operation was called out of order (e.g. `move_next` before
    /// `compute_probabilities`).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Every action of an agent's decision distribution is infeasible.
    #[error("no feasible action for {0}")]
    NoFeasibleAction(Variable),

    /// A log potential holds NaN or `+inf`.
    #[error("numerical error: {0}")]
    Numerical(String),

    /// Error raised by the differentiable tensor backend.
    #[error("tensor backend error: {0}")]
    Tensor(String),

    /// Internal error (programmer error, not user error).
    #[error("internal error: {0}")]
    Internal(String),
}
