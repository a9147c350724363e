//! Potential builders for the stag-hunt MRF.
//!
//! All potentials are natural logs; `min` stands for log 0. The stag payoff
//! couples agents only at the terminal step. The ground model scores a pair
//! of terminal positions directly; the decomposed model routes the same
//! payoff through one capture variable `q` per agent pair:
//!
//! ```text
//! q = 0       no joint capture            (unary 0)
//! q = c + 1   joint capture at cell c     (unary ln(e^R - 1) if c holds a stag)
//! phi_q(q, a) = 0 if q = 0 or a = c, min otherwise
//! ```
//!
//! Summing `q` out of `phi_q(q, a) + u(q) + phi_q(q, b)` gives `e^R` when
//! `a = b` is a stag cell and `1` otherwise, which is exactly the ground
//! interaction. `phi_q` depends only on the grid, so it is built once per
//! model and shared by every pair.
//!
//! [`ExplicitPotentials`] evaluates every predicate per element (the joint
//! capture predicate by enumerating the partner's position);
//! [`MatrixPotentials`] assembles the same arrays from identities, shifted
//! diagonals and indicator vectors. Both must agree element for element.

use std::fmt;

use ndarray::{s, Array1, Array2, Array3};

use crate::engine::variables::{VarKind, Variable};
use crate::game::config::{GameConfig, ModelParams};
use crate::game::grid::{Grid, Position};

/// `ln(e^x - 1)` for `x >= 0`, `-inf` at `x = 0`.
pub fn log_expm1(x: f64) -> f64 {
    x + (-(-x).exp()).ln_1p()
}

/// Log unary of a capture state that pays the stag reward.
fn capture_weight(params: &ModelParams) -> f64 {
    let w = log_expm1(params.stag_reward());
    if w == f64::NEG_INFINITY {
        params.min
    } else {
        w
    }
}

/// Sets every state other than `state` to `min`.
pub fn clamp_unary(unary: &mut Array1<f64>, state: usize, min: f64) {
    for (s, value) in unary.iter_mut().enumerate() {
        if s != state {
            *value = min;
        }
    }
}

/// Role of an edge in the decomposed model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeFactor {
    /// `x[t, i] -- x[t + 1, i]`.
    Transition,
    /// `x[T, i] -- q[T, i, j]`, stored as `phi_q` transposed.
    Capture,
}

/// An edge of the decomposed layout in canonical orientation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutEdge {
    pub pair: (Variable, Variable),
    pub factor: EdgeFactor,
}

/// Variable and edge order of the stacked decomposed model.
///
/// Variables are agent-major: all positions of agent 0 in time order, then
/// agent 1, and so on, followed by the capture variables of every pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecomposedLayout {
    pub grid: Grid,
    /// Terminal time step `T`; times run `1..=T`.
    pub terminal: usize,
    /// `observed[t - 1][i]` is the cell of agent `i` at time `t`.
    pub observed: Vec<Vec<usize>>,
    pub num_agents: usize,
}

impl DecomposedLayout {
    pub fn new(grid: Grid, terminal: usize, num_agents: usize, observed: Vec<Vec<usize>>) -> Self {
        Self {
            grid,
            terminal,
            observed,
            num_agents,
        }
    }

    fn pairs(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        (0..self.num_agents).flat_map(move |i| (i + 1..self.num_agents).map(move |j| (i, j)))
    }

    pub fn variables(&self) -> Vec<(Variable, usize)> {
        let d = self.grid.cells();
        let mut out = Vec::new();
        for agent in 0..self.num_agents {
            for t in 1..=self.terminal {
                out.push((Variable::position(t, agent), d));
            }
        }
        for (i, j) in self.pairs() {
            out.push((Variable::capture(self.terminal, i, j), d + 1));
        }
        out
    }

    pub fn edges(&self) -> Vec<LayoutEdge> {
        let mut out = Vec::new();
        for agent in 0..self.num_agents {
            for t in 1..self.terminal {
                out.push(LayoutEdge {
                    pair: (Variable::position(t, agent), Variable::position(t + 1, agent)),
                    factor: EdgeFactor::Transition,
                });
            }
        }
        for (i, j) in self.pairs() {
            let q = Variable::capture(self.terminal, i, j);
            for agent in [i, j] {
                out.push(LayoutEdge {
                    pair: (Variable::position(self.terminal, agent), q),
                    factor: EdgeFactor::Capture,
                });
            }
        }
        out
    }

    /// Padded domain of the stacked views.
    pub fn max_domain(&self) -> usize {
        if self.num_agents > 1 {
            self.grid.cells() + 1
        } else {
            self.grid.cells()
        }
    }
}

/// Builds the unary and pairwise potentials of a stag-hunt model.
pub trait PotentialBuilder: fmt::Debug {
    fn name(&self) -> &'static str;

    /// `d x d` one-step reachability: 0 if reachable, `min` otherwise.
    fn build_transition(&self, grid: Grid, min: f64) -> Array2<f64>;

    /// `(d + 1) x d` joint capture factor between a capture variable and
    /// one of its agents' terminal positions.
    fn build_phi_q(&self, grid: Grid, min: f64) -> Array2<f64>;

    /// `d x d` ground interaction between two agents' terminal positions.
    fn build_interaction(&self, config: &GameConfig, params: &ModelParams) -> Array2<f64>;

    /// Terminal position unary: the hare reward on hare cells.
    fn build_hare_unary(&self, config: &GameConfig, params: &ModelParams) -> Array1<f64>;

    /// Unary of a capture variable, `d + 1` states.
    fn build_capture_unary(&self, config: &GameConfig, params: &ModelParams) -> Array1<f64>;

    /// Stacked unary matrix `(D, V)` of the decomposed model in `layout`
    /// order, padded with `min`.
    fn build_unary(
        &self,
        layout: &DecomposedLayout,
        config: &GameConfig,
        params: &ModelParams,
    ) -> Array2<f64> {
        let variables = layout.variables();
        let mut unary = Array2::from_elem((layout.max_domain(), variables.len()), params.min);
        let hare = self.build_hare_unary(config, params);
        let capture = self.build_capture_unary(config, params);

        for (col, &(var, domain)) in variables.iter().enumerate() {
            let column = match var.kind {
                VarKind::Capture { .. } => capture.clone(),
                VarKind::Position => {
                    let mut column = if var.time == layout.terminal {
                        hare.clone()
                    } else {
                        Array1::zeros(domain)
                    };
                    if let Some(cells) = layout.observed.get(var.time - 1) {
                        clamp_unary(&mut column, cells[var.agent], params.min);
                    }
                    column
                }
            };
            unary.slice_mut(s![..domain, col]).assign(&column);
        }
        unary
    }

    /// Stacked pairwise tensor `(D, D, E)` of the decomposed model in
    /// `layout` edge order, padded with `min`.
    fn build_pairwise(&self, layout: &DecomposedLayout, params: &ModelParams) -> Array3<f64> {
        let edges = layout.edges();
        let d = layout.grid.cells();
        let dim = layout.max_domain();
        let transition = self.build_transition(layout.grid, params.min);
        let phi_q = self.build_phi_q(layout.grid, params.min);

        let mut tensor = Array3::from_elem((dim, dim, edges.len()), params.min);
        for (k, edge) in edges.iter().enumerate() {
            match edge.factor {
                EdgeFactor::Transition => tensor.slice_mut(s![..d, ..d, k]).assign(&transition),
                EdgeFactor::Capture => tensor.slice_mut(s![..d, ..d + 1, k]).assign(&phi_q.t()),
            }
        }
        tensor
    }
}

/// Per-element construction, the reference for [`MatrixPotentials`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ExplicitPotentials;

impl ExplicitPotentials {
    /// Joint capture predicate: agents at `a` and `b` catch the stag at
    /// `target` when both stand on it.
    fn captures(a: usize, b: usize, target: usize) -> bool {
        a == target && b == target
    }

    fn holds(cells: &[Position], grid: Grid, index: usize) -> bool {
        cells.iter().any(|pos| grid.index(*pos) == index)
    }
}

impl PotentialBuilder for ExplicitPotentials {
    fn name(&self) -> &'static str {
        "explicit"
    }

    fn build_transition(&self, grid: Grid, min: f64) -> Array2<f64> {
        let d = grid.cells();
        let mut out = Array2::zeros((d, d));
        for from in 0..d {
            for to in 0..d {
                let dist = grid.position(from).manhattan(&grid.position(to));
                out[[from, to]] = if dist <= 1 { 0.0 } else { min };
            }
        }
        out
    }

    fn build_phi_q(&self, grid: Grid, min: f64) -> Array2<f64> {
        let d = grid.cells();
        let mut out = Array2::zeros((d + 1, d));
        for q in 0..=d {
            for a in 0..d {
                out[[q, a]] = if q == 0 {
                    0.0
                } else {
                    let target = q - 1;
                    let consistent = (0..d).any(|b| Self::captures(a, b, target));
                    if consistent {
                        0.0
                    } else {
                        min
                    }
                };
            }
        }
        out
    }

    fn build_interaction(&self, config: &GameConfig, params: &ModelParams) -> Array2<f64> {
        let grid = config.grid();
        let d = grid.cells();
        let reward = params.stag_reward();
        let mut out = Array2::zeros((d, d));
        for a in 0..d {
            for b in 0..d {
                let paid = (0..d)
                    .any(|c| Self::holds(&config.stags, grid, c) && Self::captures(a, b, c));
                if paid {
                    out[[a, b]] = reward;
                }
            }
        }
        out
    }

    fn build_hare_unary(&self, config: &GameConfig, params: &ModelParams) -> Array1<f64> {
        let grid = config.grid();
        let reward = params.hare_reward();
        Array1::from_iter((0..grid.cells()).map(|c| {
            if Self::holds(&config.hares, grid, c) {
                reward
            } else {
                0.0
            }
        }))
    }

    fn build_capture_unary(&self, config: &GameConfig, params: &ModelParams) -> Array1<f64> {
        let grid = config.grid();
        let weight = capture_weight(params);
        let mut out = Array1::zeros(grid.cells() + 1);
        for c in 0..grid.cells() {
            out[c + 1] = if Self::holds(&config.stags, grid, c) {
                weight
            } else {
                params.min
            };
        }
        out
    }
}

/// Closed-form array construction.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatrixPotentials;

impl MatrixPotentials {
    /// `1.0` on the cells in `cells`, `0.0` elsewhere.
    fn indicator(cells: &[Position], grid: Grid) -> Array1<f64> {
        let mut out = Array1::zeros(grid.cells());
        for pos in cells {
            out[grid.index(*pos)] = 1.0;
        }
        out
    }
}

impl PotentialBuilder for MatrixPotentials {
    fn name(&self) -> &'static str {
        "matrix"
    }

    fn build_transition(&self, grid: Grid, min: f64) -> Array2<f64> {
        let d = grid.cells();
        let cols = grid.cols;
        let mut adjacency = Array2::<f64>::eye(d);
        if d > cols {
            adjacency.slice_mut(s![..d - cols, cols..]).diag_mut().fill(1.0);
            adjacency.slice_mut(s![cols.., ..d - cols]).diag_mut().fill(1.0);
        }
        if d > 1 {
            // (i, i + 1) is a move unless i ends a row.
            let same_row = Array1::from_iter((0..d - 1).map(|i| {
                if (i + 1) % cols != 0 {
                    1.0
                } else {
                    0.0
                }
            }));
            // OR into the existing diagonals: with one column they are also
            // the vertical moves.
            let or = |cell: &mut f64, &step: &f64| *cell = cell.max(step);
            adjacency
                .slice_mut(s![..d - 1, 1..])
                .diag_mut()
                .zip_mut_with(&same_row, or);
            adjacency
                .slice_mut(s![1.., ..d - 1])
                .diag_mut()
                .zip_mut_with(&same_row, or);
        }
        adjacency.mapv(|v| if v > 0.0 { 0.0 } else { min })
    }

    fn build_phi_q(&self, grid: Grid, min: f64) -> Array2<f64> {
        let d = grid.cells();
        let mut out = Array2::from_elem((d + 1, d), min);
        out.row_mut(0).fill(0.0);
        out.slice_mut(s![1.., ..]).diag_mut().fill(0.0);
        out
    }

    fn build_interaction(&self, config: &GameConfig, params: &ModelParams) -> Array2<f64> {
        let grid = config.grid();
        let stags = Self::indicator(&config.stags, grid);
        let reward = params.stag_reward();
        let mut out = Array2::zeros((grid.cells(), grid.cells()));
        out.diag_mut()
            .assign(&stags.mapv(|s| if s > 0.0 { reward } else { 0.0 }));
        out
    }

    fn build_hare_unary(&self, config: &GameConfig, params: &ModelParams) -> Array1<f64> {
        let reward = params.hare_reward();
        Self::indicator(&config.hares, config.grid()).mapv(|h| if h > 0.0 { reward } else { 0.0 })
    }

    fn build_capture_unary(&self, config: &GameConfig, params: &ModelParams) -> Array1<f64> {
        let weight = capture_weight(params);
        let stags = Self::indicator(&config.stags, config.grid());
        let mut out = Array1::zeros(stags.len() + 1);
        out.slice_mut(s![1..])
            .assign(&stags.mapv(|s| if s > 0.0 { weight } else { params.min }));
        out
    }
}
