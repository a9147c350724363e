//! Grid geometry: cells, canonical cell order and one-step reachability.

use std::fmt;

/// A grid cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Position {
    pub row: usize,
    pub col: usize,
}

impl Position {
    pub const fn new(row: usize, col: usize) -> Self {
        Self { row, col }
    }

    pub fn manhattan(&self, other: &Position) -> usize {
        self.row.abs_diff(other.row) + self.col.abs_diff(other.col)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.row, self.col)
    }
}

/// A `rows x cols` grid. Cells are indexed row-major: `row * cols + col`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grid {
    pub rows: usize,
    pub cols: usize,
}

impl Grid {
    pub const fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    /// Number of cells, the domain size of a position variable.
    pub const fn cells(&self) -> usize {
        self.rows * self.cols
    }

    pub fn contains(&self, pos: Position) -> bool {
        pos.row < self.rows && pos.col < self.cols
    }

    pub fn index(&self, pos: Position) -> usize {
        pos.row * self.cols + pos.col
    }

    pub fn position(&self, index: usize) -> Position {
        Position::new(index / self.cols, index % self.cols)
    }

    /// Whether an agent can go from `from` to `to` in one step (stay or
    /// move to a 4-neighbour).
    pub fn reachable(&self, from: usize, to: usize) -> bool {
        self.position(from).manhattan(&self.position(to)) <= 1
    }

    /// Cells reachable from `index` in one step, in ascending order.
    pub fn moves(&self, index: usize) -> Vec<usize> {
        let pos = self.position(index);
        let mut out = Vec::with_capacity(5);
        if pos.row > 0 {
            out.push(index - self.cols);
        }
        if pos.col > 0 {
            out.push(index - 1);
        }
        out.push(index);
        if pos.col + 1 < self.cols {
            out.push(index + 1);
        }
        if pos.row + 1 < self.rows {
            out.push(index + self.cols);
        }
        out
    }
}
