//! Explicit reference backend.
//!
//! Computes every message entry with nested per-element loops over the
//! logical domains of the factor graph, forming the sum-product exclusion
//! term directly (sum of every incoming message except the one travelling
//! along the same edge). Asymptotically the slowest backend and the ground
//! truth the vectorized and tensor backends are checked against.
//!
//! With the `parallel` feature, the directed messages of one synchronous
//! round are computed data-parallel; the round boundary is the barrier.

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use ndarray::{Array1, Array2};

use crate::engine::belief_propagation::{
    run_sweeps, BeliefPropagationConfig, BeliefPropagationDiagnostics, Beliefs, GraphFingerprint,
    InferenceBackend, MessageSweep,
};
use crate::engine::errors::ExecError;
use crate::engine::factor_graph::FactorGraph;
use crate::engine::numeric_kernels::{
    damp_log, log_sum_exp, normalize_log, probabilities_from_log, probability_delta,
};

/// A message slot: directed edge `from -> to` along undirected edge `edge`.
#[derive(Debug, Clone, Copy)]
struct Directed {
    from: usize,
    to: usize,
    edge: usize,
    /// `from` is the column variable of the stored potential.
    reversed: bool,
}

#[derive(Debug, Clone)]
struct ExplicitState {
    fingerprint: GraphFingerprint,
    directed: Vec<Directed>,
    /// `incoming[v]` lists the directed slots whose target is `v`.
    incoming: Vec<Vec<usize>>,
    messages: Vec<Vec<f64>>,
}

impl ExplicitState {
    fn new(graph: &FactorGraph) -> Self {
        let mut directed = Vec::with_capacity(2 * graph.num_edges());
        let mut incoming = vec![Vec::new(); graph.num_variables()];
        let var_index = graph.var_index();

        for (edge, (a, b)) in graph.edges().iter().enumerate() {
            let a_idx = var_index[a];
            let b_idx = var_index[b];
            for (from, to, reversed) in [(a_idx, b_idx, false), (b_idx, a_idx, true)] {
                incoming[to].push(directed.len());
                directed.push(Directed {
                    from,
                    to,
                    edge,
                    reversed,
                });
            }
        }

        let domains = graph.domains();
        let messages = directed
            .iter()
            .map(|d| {
                let size = domains[d.to];
                vec![-(size as f64).ln(); size]
            })
            .collect();

        Self {
            fingerprint: GraphFingerprint::of(graph),
            directed,
            incoming,
            messages,
        }
    }

    /// Unary of `var` plus every incoming message except those along
    /// `skip_edge`.
    fn excluded_belief(&self, graph: &FactorGraph, var: usize, skip_edge: Option<usize>) -> Vec<f64> {
        let unary = graph.unary_at(var);
        let mut belief = Vec::with_capacity(unary.len());
        for x in 0..unary.len() {
            let mut total = unary[x];
            for &slot in &self.incoming[var] {
                if Some(self.directed[slot].edge) == skip_edge {
                    continue;
                }
                total += self.messages[slot][x];
            }
            belief.push(total);
        }
        belief
    }

    fn fresh_message(&self, graph: &FactorGraph, slot: usize) -> Vec<f64> {
        let d = self.directed[slot];
        let potential = graph.edge_potential(d.edge);
        let excluded = self.excluded_belief(graph, d.from, Some(d.edge));
        let to_size = graph.domains()[d.to];

        let mut message = Vec::with_capacity(to_size);
        let mut terms = vec![0.0; excluded.len()];
        for y in 0..to_size {
            for (x, term) in terms.iter_mut().enumerate() {
                let psi = if d.reversed {
                    potential[[y, x]]
                } else {
                    potential[[x, y]]
                };
                *term = psi + excluded[x];
            }
            message.push(log_sum_exp(&terms));
        }
        normalize_log(&mut message);
        message
    }
}

impl MessageSweep for ExplicitState {
    fn sweep(&mut self, graph: &FactorGraph, damping: f64) -> Result<f64, ExecError> {
        #[cfg(feature = "parallel")]
        let fresh: Vec<Vec<f64>> = (0..self.directed.len())
            .into_par_iter()
            .map(|slot| self.fresh_message(graph, slot))
            .collect();
        #[cfg(not(feature = "parallel"))]
        let fresh: Vec<Vec<f64>> = (0..self.directed.len())
            .map(|slot| self.fresh_message(graph, slot))
            .collect();

        let mut max_delta = 0.0_f64;
        for (current, mut next) in self.messages.iter_mut().zip(fresh) {
            for (prev, value) in current.iter().zip(next.iter_mut()) {
                *value = damp_log(*prev, *value, damping);
                max_delta = max_delta.max(probability_delta(*prev, *value));
            }
            *current = next;
        }
        Ok(max_delta)
    }
}

/// Per-element reference implementation of loopy BP.
#[derive(Debug, Clone, Default)]
pub struct ExplicitBackend {
    state: Option<ExplicitState>,
}

impl ExplicitBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InferenceBackend for ExplicitBackend {
    fn name(&self) -> &'static str {
        "explicit"
    }

    fn infer(
        &mut self,
        graph: &FactorGraph,
        config: &BeliefPropagationConfig,
    ) -> Result<BeliefPropagationDiagnostics, ExecError> {
        let mut state = ExplicitState::new(graph);
        let diagnostics = run_sweeps(&mut state, graph, config, self.name())?;
        self.state = Some(state);
        Ok(diagnostics)
    }

    fn compute_probabilities(&self, graph: &FactorGraph) -> Result<Beliefs, ExecError> {
        let state = self.state.as_ref().ok_or_else(|| {
            ExecError::InvalidState("compute_probabilities called before infer".into())
        })?;
        state.fingerprint.check(graph)?;

        let mut beliefs = Beliefs::fresh();
        for (idx, &var) in graph.variables().iter().enumerate() {
            let belief = state.excluded_belief(graph, idx, None);
            beliefs.insert_marginal(var, Array1::from(probabilities_from_log(&belief)));
        }

        let var_index = graph.var_index();
        for (edge, &(a, b)) in graph.edges().iter().enumerate() {
            let a_idx = var_index[&a];
            let b_idx = var_index[&b];
            let excluded_a = state.excluded_belief(graph, a_idx, Some(edge));
            let excluded_b = state.excluded_belief(graph, b_idx, Some(edge));
            let potential = graph.edge_potential(edge);
            let (rows, cols) = potential.dim();

            let mut b_given_a = Array2::zeros((rows, cols));
            let mut row = vec![0.0; cols];
            for x in 0..rows {
                for (y, value) in row.iter_mut().enumerate() {
                    *value = potential[[x, y]] + excluded_a[x] + excluded_b[y];
                }
                for (y, p) in probabilities_from_log(&row).into_iter().enumerate() {
                    b_given_a[[x, y]] = p;
                }
            }

            let mut a_given_b = Array2::zeros((cols, rows));
            let mut column = vec![0.0; rows];
            for y in 0..cols {
                for (x, value) in column.iter_mut().enumerate() {
                    *value = potential[[x, y]] + excluded_a[x] + excluded_b[y];
                }
                for (x, p) in probabilities_from_log(&column).into_iter().enumerate() {
                    a_given_b[[y, x]] = p;
                }
            }

            beliefs.insert_conditional(a, b, b_given_a);
            beliefs.insert_conditional(b, a, a_given_b);
        }
        Ok(beliefs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::variables::Variable;
    use ndarray::array;

    /// Brute-force marginals of a two-variable model.
    fn exact_pair_marginals(
        ua: &[f64],
        ub: &[f64],
        psi: &Array2<f64>,
    ) -> (Vec<f64>, Vec<f64>) {
        let mut pa = vec![0.0; ua.len()];
        let mut pb = vec![0.0; ub.len()];
        let mut total = 0.0;
        for x in 0..ua.len() {
            for y in 0..ub.len() {
                let w = (ua[x] + ub[y] + psi[[x, y]]).exp();
                pa[x] += w;
                pb[y] += w;
                total += w;
            }
        }
        pa.iter_mut().for_each(|p| *p /= total);
        pb.iter_mut().for_each(|p| *p /= total);
        (pa, pb)
    }

    #[test]
    fn two_variable_tree_is_exact() {
        let a = Variable::position(1, 0);
        let b = Variable::position(2, 0);
        let ua = [0.3, -0.2];
        let ub = [0.0, 1.0, -1.0];
        let psi = array![[0.5, -1.0, 0.0], [f64::NEG_INFINITY, 0.2, 0.7]];

        let mut graph = FactorGraph::new(f64::NEG_INFINITY);
        graph.add_variable(a, 2).unwrap();
        graph.add_variable(b, 3).unwrap();
        graph.set_unary(a, Array1::from(ua.to_vec())).unwrap();
        graph.set_unary(b, Array1::from(ub.to_vec())).unwrap();
        graph.set_edge(a, b, psi.clone()).unwrap();

        let mut backend = ExplicitBackend::new();
        let diagnostics = backend
            .infer(&graph, &BeliefPropagationConfig::default())
            .unwrap();
        assert!(diagnostics.converged);

        let beliefs = backend.compute_probabilities(&graph).unwrap();
        let (pa, pb) = exact_pair_marginals(&ua, &ub, &psi);
        for (got, want) in beliefs.marginal(a).unwrap().iter().zip(pa.iter()) {
            assert!((got - want).abs() < 1e-12);
        }
        for (got, want) in beliefs.marginal(b).unwrap().iter().zip(pb.iter()) {
            assert!((got - want).abs() < 1e-12);
        }

        let b_given_a = beliefs.conditional(a, b).unwrap();
        assert_eq!(b_given_a.dim(), (2, 3));
        assert_eq!(b_given_a[[1, 0]], 0.0);
        let a_given_b = beliefs.conditional(b, a).unwrap();
        assert_eq!(a_given_b.dim(), (3, 2));
        for row in a_given_b.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn infeasible_variable_yields_nan_marginal() {
        let a = Variable::position(1, 0);
        let b = Variable::position(2, 0);
        let mut graph = FactorGraph::new(f64::NEG_INFINITY);
        graph.add_variables([a, b], 2).unwrap();
        graph
            .set_unary(a, array![f64::NEG_INFINITY, f64::NEG_INFINITY])
            .unwrap();
        graph.set_edge(a, b, Array2::zeros((2, 2))).unwrap();

        let mut backend = ExplicitBackend::new();
        backend
            .infer(&graph, &BeliefPropagationConfig::default())
            .unwrap();
        let beliefs = backend.compute_probabilities(&graph).unwrap();
        assert!(beliefs.marginal(a).unwrap().iter().all(|p| p.is_nan()));
    }

    #[test]
    fn compute_probabilities_requires_inference() {
        let graph = FactorGraph::new(f64::NEG_INFINITY);
        let backend = ExplicitBackend::new();
        assert!(matches!(
            backend.compute_probabilities(&graph),
            Err(ExecError::InvalidState(_))
        ));
    }

    #[test]
    fn isolated_variables_keep_their_unary() {
        let a = Variable::position(1, 0);
        let mut graph = FactorGraph::new(f64::NEG_INFINITY);
        graph.add_variable(a, 2).unwrap();
        graph.set_unary(a, array![0.0, 2.0_f64.ln()]).unwrap();

        let mut backend = ExplicitBackend::new();
        let diagnostics = backend
            .infer(&graph, &BeliefPropagationConfig::default())
            .unwrap();
        assert_eq!(diagnostics.iterations_run, 0);
        let beliefs = backend.compute_probabilities(&graph).unwrap();
        let marginal = beliefs.marginal(a).unwrap();
        assert!((marginal[1] - 2.0 / 3.0).abs() < 1e-12);
    }
}
