//! Sum-product belief propagation contract shared by the inference backends.
//!
//! Every backend runs the same log-space loopy BP:
//!
//! - Messages live on directed edges `a -> b` and are vectors over `b`'s
//!   domain, initialized uniform.
//! - `m_{a->b}(y) = logsumexp_x [ psi_ab(x, y) + u_a(x) + sum_{c in N(a), c != b} m_{c->a}(x) ]`,
//!   then shifted so that it sums to one in probability space.
//! - Rounds are synchronous: every message of round `k + 1` is computed from
//!   the messages of round `k`.
//! - The run stops when the largest probability-space change of any message
//!   entry drops below `convergence_tolerance`, or after `max_iterations`
//!   rounds. Graphs with cycles may not converge; that is reported through
//!   [`BeliefPropagationDiagnostics`], never as an error.
//!
//! After a run, [`InferenceBackend::compute_probabilities`] produces the
//! normalized marginals and the per-edge conditionals `P(b | a)` in a
//! [`Beliefs`] store.

use std::fmt;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rustc_hash::FxHashMap;

use crate::engine::errors::ExecError;
use crate::engine::factor_graph::FactorGraph;
use crate::engine::numeric_kernels::allclose;
use crate::engine::variables::Variable;

/// Configuration for loopy belief propagation.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BeliefPropagationConfig {
    /// Maximum synchronous message-passing iterations.
    pub max_iterations: usize,
    /// Damping factor in [0, 1). Higher values slow updates and improve stability.
    pub damping: f64,
    /// Convergence threshold on max absolute message delta (probability space).
    pub convergence_tolerance: f64,
}

impl Default for BeliefPropagationConfig {
    fn default() -> Self {
        Self {
            max_iterations: 300,
            damping: 0.0,
            convergence_tolerance: 1e-10,
        }
    }
}

impl BeliefPropagationConfig {
    pub fn validate(self) -> Result<Self, ExecError> {
        if self.max_iterations == 0 {
            return Err(ExecError::ValidationError(
                "infer: max_iterations must be > 0".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.damping) {
            return Err(ExecError::ValidationError(
                "infer: damping must be in [0, 1)".into(),
            ));
        }
        if self.convergence_tolerance <= 0.0 || !self.convergence_tolerance.is_finite() {
            return Err(ExecError::ValidationError(
                "infer: convergence_tolerance must be finite and > 0".into(),
            ));
        }
        Ok(self)
    }
}

/// Terminal state of a message-passing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Converged,
    MaxIterExceeded,
}

/// Runtime diagnostics emitted by a belief propagation run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeliefPropagationDiagnostics {
    /// Iteration limit configured for this run.
    pub max_iterations: usize,
    /// Number of synchronous iterations actually executed.
    pub iterations_run: usize,
    /// Whether convergence tolerance was reached before the iteration limit.
    pub converged: bool,
    /// Final max absolute message delta after the last iteration.
    pub final_max_message_delta: f64,
    /// Number of variables in the factor graph.
    pub variable_count: usize,
    /// Number of undirected edges in the factor graph.
    pub edge_count: usize,
}

impl BeliefPropagationDiagnostics {
    pub fn status(&self) -> RunStatus {
        if self.converged {
            RunStatus::Converged
        } else {
            RunStatus::MaxIterExceeded
        }
    }
}

/// Capability interface implemented by the three numeric backends.
///
/// A backend owns the message state of its last run; `compute_probabilities`
/// reads it back for the same graph.
pub trait InferenceBackend: fmt::Debug {
    /// Short human-readable backend name.
    fn name(&self) -> &'static str;

    /// Runs message passing on `graph` until convergence or the iteration cap.
    fn infer(
        &mut self,
        graph: &FactorGraph,
        config: &BeliefPropagationConfig,
    ) -> Result<BeliefPropagationDiagnostics, ExecError>;

    /// Computes marginals and conditionals from the messages of the last run.
    fn compute_probabilities(&self, graph: &FactorGraph) -> Result<Beliefs, ExecError>;
}

/// One synchronous round of message updates.
pub(crate) trait MessageSweep {
    /// Replaces every message with its update from the previous round and
    /// returns the largest probability-space change.
    fn sweep(&mut self, graph: &FactorGraph, damping: f64) -> Result<f64, ExecError>;
}

/// Structure of the graph a backend ran on. Messages are only meaningful
/// for a graph with the same variables, domains and edges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct GraphFingerprint {
    variables: Vec<Variable>,
    domains: Vec<usize>,
    edges: Vec<(Variable, Variable)>,
}

impl GraphFingerprint {
    pub(crate) fn of(graph: &FactorGraph) -> Self {
        Self {
            variables: graph.variables().to_vec(),
            domains: graph.domains().to_vec(),
            edges: graph.edges().to_vec(),
        }
    }

    /// Fails with `InvalidState` when `graph` is not the graph that was inferred.
    pub(crate) fn check(&self, graph: &FactorGraph) -> Result<(), ExecError> {
        if self.variables == graph.variables()
            && self.domains == graph.domains()
            && self.edges == graph.edges()
        {
            Ok(())
        } else {
            Err(ExecError::InvalidState(
                "compute_probabilities called with a different graph than the last inference"
                    .into(),
            ))
        }
    }
}

/// Drives `state` through synchronous rounds until convergence or the cap.
pub(crate) fn run_sweeps<S: MessageSweep>(
    state: &mut S,
    graph: &FactorGraph,
    config: &BeliefPropagationConfig,
    backend: &'static str,
) -> Result<BeliefPropagationDiagnostics, ExecError> {
    let config = config.validate()?;
    let mut diagnostics = BeliefPropagationDiagnostics {
        max_iterations: config.max_iterations,
        iterations_run: 0,
        converged: true,
        final_max_message_delta: 0.0,
        variable_count: graph.num_variables(),
        edge_count: graph.num_edges(),
    };
    if graph.num_edges() == 0 {
        return Ok(diagnostics);
    }

    diagnostics.converged = false;
    for iteration in 0..config.max_iterations {
        let max_delta = state.sweep(graph, config.damping)?;
        diagnostics.iterations_run = iteration + 1;
        diagnostics.final_max_message_delta = max_delta;
        if max_delta < config.convergence_tolerance {
            diagnostics.converged = true;
            break;
        }
    }

    #[cfg(feature = "tracing")]
    {
        tracing::debug!(
            backend,
            iterations = diagnostics.iterations_run,
            converged = diagnostics.converged,
            delta = diagnostics.final_max_message_delta,
            "belief propagation finished"
        );
        if !diagnostics.converged {
            tracing::warn!(
                backend,
                max_iterations = config.max_iterations,
                "belief propagation hit the iteration cap before converging"
            );
        }
    }
    #[cfg(not(feature = "tracing"))]
    let _ = backend;

    Ok(diagnostics)
}

/// Normalized beliefs produced by [`InferenceBackend::compute_probabilities`].
///
/// Marginals are keyed by variable. Conditionals are keyed by ordered pair
/// `(a, b)` and hold `P(b | a)` with rows over `a`'s domain; both
/// orientations of every edge are present. Rows or vectors whose states are
/// all infeasible are NaN.
///
/// A store is *stale* once the graph it was computed from is rebuilt,
/// clamped or re-inferred; only a fresh `compute_probabilities` clears it.
#[derive(Debug, Clone)]
pub struct Beliefs {
    var_probabilities: FxHashMap<Variable, Array1<f64>>,
    conditional_probabilities: FxHashMap<(Variable, Variable), Array2<f64>>,
    stale: bool,
}

impl Default for Beliefs {
    fn default() -> Self {
        Self {
            var_probabilities: FxHashMap::default(),
            conditional_probabilities: FxHashMap::default(),
            stale: true,
        }
    }
}

impl Beliefs {
    /// Creates an empty, fresh store for a backend to fill.
    pub(crate) fn fresh() -> Self {
        Self {
            stale: false,
            ..Self::default()
        }
    }

    pub(crate) fn insert_marginal(&mut self, var: Variable, probabilities: Array1<f64>) {
        self.var_probabilities.insert(var, probabilities);
    }

    pub(crate) fn insert_conditional(
        &mut self,
        given: Variable,
        target: Variable,
        probabilities: Array2<f64>,
    ) {
        self.conditional_probabilities
            .insert((given, target), probabilities);
    }

    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn var_probabilities(&self) -> &FxHashMap<Variable, Array1<f64>> {
        &self.var_probabilities
    }

    pub fn conditional_probabilities(&self) -> &FxHashMap<(Variable, Variable), Array2<f64>> {
        &self.conditional_probabilities
    }

    pub fn marginal(&self, var: Variable) -> Option<ArrayView1<'_, f64>> {
        self.var_probabilities.get(&var).map(|p| p.view())
    }

    /// `P(target | given)` with rows over `given`'s domain.
    pub fn conditional(&self, given: Variable, target: Variable) -> Option<ArrayView2<'_, f64>> {
        self.conditional_probabilities
            .get(&(given, target))
            .map(|p| p.view())
    }

    /// Checks every marginal and conditional of `self` against `other`
    /// with [`allclose`]. Keys missing from `other` count as mismatches.
    pub fn allclose(&self, other: &Beliefs, rtol: f64, atol: f64) -> bool {
        let marginals = self.var_probabilities.iter().all(|(var, p)| {
            other
                .var_probabilities
                .get(var)
                .is_some_and(|q| allclose(&p.view(), &q.view(), rtol, atol))
        });
        let conditionals = self.conditional_probabilities.iter().all(|(key, p)| {
            other
                .conditional_probabilities
                .get(key)
                .is_some_and(|q| allclose(&p.view(), &q.view(), rtol, atol))
        });
        marginals && conditionals
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(BeliefPropagationConfig::default().validate().is_ok());
    }

    #[test]
    fn config_rejects_bad_values() {
        let zero_iters = BeliefPropagationConfig {
            max_iterations: 0,
            ..Default::default()
        };
        assert!(zero_iters.validate().is_err());

        let bad_damping = BeliefPropagationConfig {
            damping: 1.0,
            ..Default::default()
        };
        assert!(bad_damping.validate().is_err());

        let bad_tol = BeliefPropagationConfig {
            convergence_tolerance: f64::NAN,
            ..Default::default()
        };
        assert!(bad_tol.validate().is_err());
    }

    #[test]
    fn default_beliefs_are_stale() {
        let beliefs = Beliefs::default();
        assert!(beliefs.is_stale());
        assert!(!Beliefs::fresh().is_stale());
    }

    #[test]
    fn allclose_requires_matching_keys() {
        let var = Variable::position(1, 0);
        let mut lhs = Beliefs::fresh();
        lhs.insert_marginal(var, Array1::from(vec![0.25, 0.75]));
        let rhs = Beliefs::fresh();
        assert!(!lhs.allclose(&rhs, 1e-5, 1e-8));
        assert!(rhs.allclose(&lhs, 1e-5, 1e-8));
    }

    struct Countdown(usize);

    impl MessageSweep for Countdown {
        fn sweep(&mut self, _graph: &FactorGraph, _damping: f64) -> Result<f64, ExecError> {
            self.0 = self.0.saturating_sub(1);
            Ok(if self.0 == 0 { 0.0 } else { 1.0 })
        }
    }

    fn graph_with_edge() -> FactorGraph {
        let mut graph = FactorGraph::new(f64::NEG_INFINITY);
        let a = Variable::position(1, 0);
        let b = Variable::position(2, 0);
        graph.add_variables([a, b], 2).unwrap();
        graph.set_edge(a, b, Array2::zeros((2, 2))).unwrap();
        graph
    }

    #[test]
    fn run_sweeps_reports_convergence() {
        let graph = graph_with_edge();
        let diagnostics = run_sweeps(
            &mut Countdown(3),
            &graph,
            &BeliefPropagationConfig::default(),
            "test",
        )
        .unwrap();
        assert_eq!(diagnostics.iterations_run, 3);
        assert_eq!(diagnostics.status(), RunStatus::Converged);
    }

    #[test]
    fn run_sweeps_caps_iterations() {
        let graph = graph_with_edge();
        let config = BeliefPropagationConfig {
            max_iterations: 5,
            ..Default::default()
        };
        let diagnostics = run_sweeps(&mut Countdown(100), &graph, &config, "test").unwrap();
        assert_eq!(diagnostics.iterations_run, 5);
        assert_eq!(diagnostics.status(), RunStatus::MaxIterExceeded);
        assert_eq!(diagnostics.final_max_message_delta, 1.0);
    }
}
