//! Pairwise Markov random field container.
//!
//! Holds the registered variables with their domain sizes, one log-space
//! unary potential per variable and one log-space pairwise potential per
//! undirected edge. Edges are stored once in canonical orientation
//! (smaller variable first, see [`canonical_pair`]); [`FactorGraph::get_edge`]
//! transposes internally so callers never branch on orientation.
//!
//! The stacked views used by the vectorized and tensor backends are built
//! lazily and cached until the next mutation:
//!
//! - `unary_matrix()`: shape `(D, V)`, column `var_index[v]` is `v`'s unary.
//! - `edge_tensor()`: shape `(D, D, E)`, slice `message_index[(a, b)]` is the
//!   potential from `a` (rows) to `b` (columns).
//!
//! `D` is the largest registered domain; padding entries hold the graph's
//! `min` value so that padded states are impossible.

use std::sync::OnceLock;

use ndarray::{s, Array1, Array2, Array3, ArrayView1, ArrayView2, Axis};
use rustc_hash::FxHashMap;

use crate::engine::errors::ExecError;
use crate::engine::variables::{canonical_pair, Orientation, Variable};

/// Neighbor entry: `(neighbor variable index, edge index)`.
pub type Neighbor = (usize, usize);

/// An edge potential oriented as requested.
#[derive(Debug, Clone)]
pub struct EdgeView<'a> {
    /// Potential with rows over the first requested variable's domain.
    pub potential: ArrayView2<'a, f64>,
    /// Orientation of the request relative to storage.
    pub orientation: Orientation,
    /// Slice offset of the edge in the edge tensor.
    pub index: usize,
}

#[derive(Debug, Clone)]
struct Stacked {
    unary: Array2<f64>,
    edges: Array3<f64>,
}

/// Factor graph with unary and pairwise log potentials.
#[derive(Debug, Clone)]
pub struct FactorGraph {
    min: f64,
    variables: Vec<Variable>,
    domains: Vec<usize>,
    var_index: FxHashMap<Variable, usize>,
    unary: Vec<Array1<f64>>,
    edges: Vec<(Variable, Variable)>,
    message_index: FxHashMap<(Variable, Variable), usize>,
    edge_potentials: Vec<Array2<f64>>,
    neighbors: Vec<Vec<Neighbor>>,
    stacked: OnceLock<Stacked>,
}

/// Log potentials are finite or `-inf`.
fn check_log_potential<'a, I>(values: I, what: impl FnOnce() -> String) -> Result<(), ExecError>
where
    I: IntoIterator<Item = &'a f64>,
{
    match values
        .into_iter()
        .find(|v| v.is_nan() || **v == f64::INFINITY)
    {
        Some(bad) => Err(ExecError::Numerical(format!("{} contains {}", what(), bad))),
        None => Ok(()),
    }
}

impl FactorGraph {
    /// Creates an empty graph whose padding entries hold `min`.
    pub fn new(min: f64) -> Self {
        Self {
            min,
            variables: Vec::new(),
            domains: Vec::new(),
            var_index: FxHashMap::default(),
            unary: Vec::new(),
            edges: Vec::new(),
            message_index: FxHashMap::default(),
            edge_potentials: Vec::new(),
            neighbors: Vec::new(),
            stacked: OnceLock::new(),
        }
    }

    /// Registers a variable with a zero unary potential over `domain` states.
    ///
    /// Re-registering a variable with the same domain is a no-op; a different
    /// domain is a shape mismatch.
    pub fn add_variable(&mut self, var: Variable, domain: usize) -> Result<usize, ExecError> {
        if domain == 0 {
            return Err(ExecError::ShapeMismatch(format!(
                "{} registered with an empty domain",
                var
            )));
        }
        if let Some(&idx) = self.var_index.get(&var) {
            if self.domains[idx] != domain {
                return Err(ExecError::ShapeMismatch(format!(
                    "{} already registered with domain {}, got {}",
                    var, self.domains[idx], domain
                )));
            }
            return Ok(idx);
        }

        let idx = self.variables.len();
        self.variables.push(var);
        self.domains.push(domain);
        self.var_index.insert(var, idx);
        self.unary.push(Array1::zeros(domain));
        self.neighbors.push(Vec::new());
        self.stacked.take();
        Ok(idx)
    }

    /// Registers several variables sharing one domain size.
    pub fn add_variables<I>(&mut self, variables: I, domain: usize) -> Result<(), ExecError>
    where
        I: IntoIterator<Item = Variable>,
    {
        for var in variables {
            self.add_variable(var, domain)?;
        }
        Ok(())
    }

    /// Sets the unary log potential of a registered variable.
    pub fn set_unary(&mut self, var: Variable, potential: Array1<f64>) -> Result<(), ExecError> {
        let idx = self.index_of(var)?;
        if potential.len() != self.domains[idx] {
            return Err(ExecError::ShapeMismatch(format!(
                "unary for {} has length {}, domain is {}",
                var,
                potential.len(),
                self.domains[idx]
            )));
        }
        check_log_potential(&potential, || format!("unary for {}", var))?;
        self.unary[idx] = potential;
        self.stacked.take();
        Ok(())
    }

    /// Sets the pairwise log potential between `a` (rows) and `b` (columns).
    ///
    /// The potential is transposed when `(a, b)` is not in canonical order.
    /// Setting an existing edge replaces its potential.
    pub fn set_edge(
        &mut self,
        a: Variable,
        b: Variable,
        potential: Array2<f64>,
    ) -> Result<(), ExecError> {
        if a == b {
            return Err(ExecError::SelfLoop(a));
        }
        let a_idx = self.index_of(a)?;
        let b_idx = self.index_of(b)?;
        let expected = (self.domains[a_idx], self.domains[b_idx]);
        if potential.dim() != expected {
            return Err(ExecError::ShapeMismatch(format!(
                "edge {} -- {} has shape {:?}, domains are {:?}",
                a,
                b,
                potential.dim(),
                expected
            )));
        }

        check_log_potential(&potential, || format!("edge {} -- {}", a, b))?;

        let (key, orientation) = canonical_pair(a, b);
        let potential = match orientation {
            Orientation::Forward => potential,
            Orientation::Reversed => potential.reversed_axes().as_standard_layout().to_owned(),
        };

        match self.message_index.get(&key) {
            Some(&edge) => self.edge_potentials[edge] = potential,
            None => {
                let edge = self.edges.len();
                self.edges.push(key);
                self.message_index.insert(key, edge);
                self.edge_potentials.push(potential);
                self.neighbors[a_idx].push((b_idx, edge));
                self.neighbors[b_idx].push((a_idx, edge));
            }
        }
        self.stacked.take();
        Ok(())
    }

    /// Restricts a variable to an observed state by setting every other
    /// state of its unary to `min`.
    pub fn clamp(&mut self, var: Variable, state: usize) -> Result<(), ExecError> {
        let idx = self.index_of(var)?;
        if state >= self.domains[idx] {
            return Err(ExecError::ShapeMismatch(format!(
                "cannot clamp {} to state {} of a {}-state domain",
                var, state, self.domains[idx]
            )));
        }
        let min = self.min;
        for (s, value) in self.unary[idx].iter_mut().enumerate() {
            if s != state {
                *value = min;
            }
        }
        self.stacked.take();
        Ok(())
    }

    /// Builds a graph directly from stacked potentials.
    ///
    /// `variables[i]` owns column `i` of `unary` and `edges[k]` (which must be
    /// in canonical order) owns slice `k` of `edge_tensor`. Every column and
    /// slice must be padded with `min` beyond the logical domains.
    pub fn from_stacked(
        min: f64,
        variables: &[(Variable, usize)],
        unary: Array2<f64>,
        edges: &[(Variable, Variable)],
        edge_tensor: Array3<f64>,
    ) -> Result<Self, ExecError> {
        let max_domain = variables.iter().map(|&(_, d)| d).max().unwrap_or(0);
        if unary.dim() != (max_domain, variables.len()) {
            return Err(ExecError::ShapeMismatch(format!(
                "unary matrix has shape {:?}, expected {:?}",
                unary.dim(),
                (max_domain, variables.len())
            )));
        }
        if edge_tensor.dim() != (max_domain, max_domain, edges.len()) {
            return Err(ExecError::ShapeMismatch(format!(
                "edge tensor has shape {:?}, expected {:?}",
                edge_tensor.dim(),
                (max_domain, max_domain, edges.len())
            )));
        }

        let mut graph = Self::new(min);
        for (col, &(var, domain)) in variables.iter().enumerate() {
            graph.add_variable(var, domain)?;
            graph.set_unary(var, unary.slice(s![..domain, col]).to_owned())?;
        }
        for (k, &(a, b)) in edges.iter().enumerate() {
            if b < a {
                return Err(ExecError::Internal(format!(
                    "stacked edge {} -- {} is not in canonical order",
                    a, b
                )));
            }
            let rows = graph.domain(a)?;
            let cols = graph.domain(b)?;
            let slice = edge_tensor.slice(s![..rows, ..cols, k]).to_owned();
            graph.set_edge(a, b, slice)?;
        }
        let _ = graph.stacked.set(Stacked {
            unary,
            edges: edge_tensor,
        });
        Ok(graph)
    }

    fn index_of(&self, var: Variable) -> Result<usize, ExecError> {
        self.var_index
            .get(&var)
            .copied()
            .ok_or(ExecError::UnknownVariable(var))
    }

    /// Value used for impossible states and padding.
    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn num_variables(&self) -> usize {
        self.variables.len()
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    /// Registered variables in insertion order (column order).
    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    /// Canonical edges in insertion order (slice order).
    pub fn edges(&self) -> &[(Variable, Variable)] {
        &self.edges
    }

    pub fn domains(&self) -> &[usize] {
        &self.domains
    }

    pub fn domain(&self, var: Variable) -> Result<usize, ExecError> {
        self.index_of(var).map(|idx| self.domains[idx])
    }

    /// Largest registered domain (the padded size of stacked views).
    pub fn max_domain(&self) -> usize {
        self.domains.iter().copied().max().unwrap_or(0)
    }

    /// Mapping from variable to its column in the unary matrix.
    pub fn var_index(&self) -> &FxHashMap<Variable, usize> {
        &self.var_index
    }

    /// Mapping from canonical variable pair to its slice in the edge tensor.
    pub fn message_index(&self) -> &FxHashMap<(Variable, Variable), usize> {
        &self.message_index
    }

    pub fn neighbors(&self, var_idx: usize) -> &[Neighbor] {
        &self.neighbors[var_idx]
    }

    pub fn unary(&self, var: Variable) -> Result<ArrayView1<'_, f64>, ExecError> {
        self.index_of(var).map(|idx| self.unary[idx].view())
    }

    pub fn unary_at(&self, var_idx: usize) -> ArrayView1<'_, f64> {
        self.unary[var_idx].view()
    }

    /// Stored (canonical) potential of edge `edge`.
    pub fn edge_potential(&self, edge: usize) -> ArrayView2<'_, f64> {
        self.edge_potentials[edge].view()
    }

    /// Returns the potential between `a` (rows) and `b` (columns), whichever
    /// orientation it is stored in.
    pub fn get_edge(&self, a: Variable, b: Variable) -> Result<EdgeView<'_>, ExecError> {
        let (key, orientation) = canonical_pair(a, b);
        let index = *self
            .message_index
            .get(&key)
            .ok_or(ExecError::UnknownEdge(a, b))?;
        let stored = self.edge_potentials[index].view();
        let potential = match orientation {
            Orientation::Forward => stored,
            Orientation::Reversed => stored.reversed_axes(),
        };
        Ok(EdgeView {
            potential,
            orientation,
            index,
        })
    }

    /// Stacked unary matrix of shape `(D, V)`.
    pub fn unary_matrix(&self) -> &Array2<f64> {
        &self.stacked().unary
    }

    /// Stacked edge tensor of shape `(D, D, E)`.
    pub fn edge_tensor(&self) -> &Array3<f64> {
        &self.stacked().edges
    }

    fn stacked(&self) -> &Stacked {
        self.stacked.get_or_init(|| {
            let d = self.max_domain();
            let mut unary = Array2::from_elem((d, self.variables.len()), self.min);
            for (col, potential) in self.unary.iter().enumerate() {
                unary
                    .slice_mut(s![..potential.len(), col])
                    .assign(potential);
            }
            let mut edges = Array3::from_elem((d, d, self.edges.len()), self.min);
            for (k, potential) in self.edge_potentials.iter().enumerate() {
                let (rows, cols) = potential.dim();
                edges
                    .index_axis_mut(Axis(2), k)
                    .slice_mut(s![..rows, ..cols])
                    .assign(potential);
            }
            Stacked { unary, edges }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn two_step_chain() -> FactorGraph {
        let mut graph = FactorGraph::new(f64::NEG_INFINITY);
        graph
            .add_variables([Variable::position(1, 0), Variable::position(2, 0)], 2)
            .unwrap();
        graph
    }

    #[test]
    fn set_unary_rejects_wrong_length() {
        let mut graph = two_step_chain();
        let err = graph
            .set_unary(Variable::position(1, 0), array![0.0, 0.0, 0.0])
            .unwrap_err();
        assert!(matches!(err, ExecError::ShapeMismatch(_)));
    }

    #[test]
    fn set_unary_rejects_unknown_variable() {
        let mut graph = two_step_chain();
        let err = graph
            .set_unary(Variable::position(9, 0), array![0.0, 0.0])
            .unwrap_err();
        assert!(matches!(err, ExecError::UnknownVariable(_)));
    }

    #[test]
    fn re_registering_with_other_domain_fails() {
        let mut graph = two_step_chain();
        assert!(graph.add_variable(Variable::position(1, 0), 2).is_ok());
        assert!(matches!(
            graph.add_variable(Variable::position(1, 0), 3),
            Err(ExecError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn set_edge_rejects_shape_and_self_loop() {
        let mut graph = two_step_chain();
        let a = Variable::position(1, 0);
        let b = Variable::position(2, 0);
        assert!(matches!(
            graph.set_edge(a, b, Array2::zeros((2, 3))),
            Err(ExecError::ShapeMismatch(_))
        ));
        assert!(matches!(
            graph.set_edge(a, a, Array2::zeros((2, 2))),
            Err(ExecError::SelfLoop(_))
        ));
    }

    #[test]
    fn non_log_values_are_numerical_errors() {
        let mut graph = two_step_chain();
        let a = Variable::position(1, 0);
        let b = Variable::position(2, 0);
        assert!(matches!(
            graph.set_unary(a, array![f64::NAN, 0.0]),
            Err(ExecError::Numerical(_))
        ));
        assert!(matches!(
            graph.set_edge(a, b, array![[0.0, f64::INFINITY], [0.0, 0.0]]),
            Err(ExecError::Numerical(_))
        ));
        // Impossible states are fine.
        assert!(graph
            .set_edge(a, b, array![[0.0, f64::NEG_INFINITY], [0.0, 0.0]])
            .is_ok());
        assert_eq!(graph.num_edges(), 1);
    }

    #[test]
    fn reversed_edge_is_stored_once_in_canonical_orientation() {
        let mut graph = two_step_chain();
        let a = Variable::position(1, 0);
        let b = Variable::position(2, 0);
        graph.set_edge(b, a, array![[1.0, 2.0], [3.0, 4.0]]).unwrap();

        assert_eq!(graph.num_edges(), 1);
        assert!(graph.message_index().contains_key(&(a, b)));
        assert!(!graph.message_index().contains_key(&(b, a)));

        let forward = graph.get_edge(a, b).unwrap();
        assert_eq!(forward.orientation, Orientation::Forward);
        assert_eq!(forward.potential, array![[1.0, 3.0], [2.0, 4.0]]);

        let reversed = graph.get_edge(b, a).unwrap();
        assert_eq!(reversed.orientation, Orientation::Reversed);
        assert_eq!(reversed.potential, array![[1.0, 2.0], [3.0, 4.0]]);
    }

    #[test]
    fn missing_edge_is_reported() {
        let graph = two_step_chain();
        assert!(matches!(
            graph.get_edge(Variable::position(1, 0), Variable::position(2, 0)),
            Err(ExecError::UnknownEdge(_, _))
        ));
    }

    #[test]
    fn stacked_views_are_padded_with_min() {
        let mut graph = FactorGraph::new(-1e9);
        let x = Variable::position(1, 0);
        let q = Variable::capture(1, 0, 1);
        graph.add_variable(x, 2).unwrap();
        graph.add_variable(q, 3).unwrap();
        graph.set_unary(x, array![0.5, 1.5]).unwrap();
        graph.set_edge(x, q, Array2::zeros((2, 3))).unwrap();

        let unary = graph.unary_matrix();
        assert_eq!(unary.dim(), (3, 2));
        assert_eq!(unary[[1, 0]], 1.5);
        assert_eq!(unary[[2, 0]], -1e9);

        let tensor = graph.edge_tensor();
        assert_eq!(tensor.dim(), (3, 3, 1));
        assert_eq!(tensor[[1, 2, 0]], 0.0);
        assert_eq!(tensor[[2, 0, 0]], -1e9);
    }

    #[test]
    fn mutation_invalidates_stacked_cache() {
        let mut graph = two_step_chain();
        let x = Variable::position(1, 0);
        assert_eq!(graph.unary_matrix()[[1, 0]], 0.0);
        graph.clamp(x, 0).unwrap();
        assert_eq!(graph.unary_matrix()[[1, 0]], f64::NEG_INFINITY);
    }

    #[test]
    fn from_stacked_round_trips_views() {
        let mut graph = two_step_chain();
        let a = Variable::position(1, 0);
        let b = Variable::position(2, 0);
        graph.set_unary(a, array![0.0, -1.0]).unwrap();
        graph.set_edge(a, b, array![[0.0, f64::NEG_INFINITY], [0.0, 0.0]]).unwrap();

        let vars: Vec<(Variable, usize)> = graph
            .variables()
            .iter()
            .map(|&v| (v, graph.domain(v).unwrap()))
            .collect();
        let rebuilt = FactorGraph::from_stacked(
            graph.min(),
            &vars,
            graph.unary_matrix().clone(),
            graph.edges(),
            graph.edge_tensor().clone(),
        )
        .unwrap();
        assert_eq!(rebuilt.unary(a).unwrap(), graph.unary(a).unwrap());
        assert_eq!(
            rebuilt.get_edge(b, a).unwrap().potential,
            graph.get_edge(b, a).unwrap().potential
        );
    }
}
