//! Dense and sparse matrices.
//!
//! Connections driven by a sparse matrix iterate its nonzero coordinates
//! through [`IteratorNonzero`]; each coordinate is visited exactly once.

use indexmap::IndexMap;
use tracing::warn;

use crate::types::Real;

/// Dense row-major matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix<T: Real> {
    rows: usize,
    cols: usize,
    data: Vec<T>,
}

impl<T: Real> Matrix<T> {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![T::zero(); rows * cols],
        }
    }

    pub fn from_rows(rows: Vec<Vec<T>>) -> Self {
        let height = rows.len();
        let width = rows.first().map(|r| r.len()).unwrap_or(0);
        let mut data = Vec::with_capacity(height * width);
        for row in rows {
            data.extend(row);
        }
        Self {
            rows: height,
            cols: width,
            data,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Out-of-range reads return zero rather than trapping, matching the
    /// forgiving semantics of model matrix access.
    pub fn get(&self, row: usize, col: usize) -> T {
        if row < self.rows && col < self.cols {
            self.data[row * self.cols + col]
        } else {
            T::zero()
        }
    }

    pub fn set(&mut self, row: usize, col: usize, value: T) {
        if row < self.rows && col < self.cols {
            self.data[row * self.cols + col] = value;
        }
    }

    pub fn nonzero_count(&self) -> usize {
        self.data.iter().filter(|v| !v.is_zero()).count()
    }
}

/// Sparse matrix preserving insertion order of its entries.
#[derive(Debug, Clone, Default)]
pub struct MatrixSparse<T: Real> {
    rows: usize,
    cols: usize,
    entries: IndexMap<(usize, usize), T>,
}

impl<T: Real> MatrixSparse<T> {
    pub fn new() -> Self {
        Self {
            rows: 0,
            cols: 0,
            entries: IndexMap::new(),
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn get(&self, row: usize, col: usize) -> T {
        self.entries
            .get(&(row, col))
            .copied()
            .unwrap_or_else(T::zero)
    }

    pub fn set(&mut self, row: usize, col: usize, value: T) {
        self.rows = self.rows.max(row + 1);
        self.cols = self.cols.max(col + 1);
        if value.is_zero() {
            self.entries.shift_remove(&(row, col));
        } else {
            self.entries.insert((row, col), value);
        }
    }

    pub fn nonzero_count(&self) -> usize {
        self.entries.len()
    }

    pub fn iter_nonzero(&self) -> IteratorNonzero<'_, T> {
        IteratorNonzero {
            inner: self.entries.iter(),
        }
    }
}

/// Iterator over `(row, col, value)` of a sparse matrix.
pub struct IteratorNonzero<'a, T: Real> {
    inner: indexmap::map::Iter<'a, (usize, usize), T>,
}

impl<'a, T: Real> Iterator for IteratorNonzero<'a, T> {
    type Item = (usize, usize, T);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(&(r, c), &v)| (r, c, v))
    }
}

/// Parse whitespace/comma-delimited matrix text.
///
/// An ill-formed body degrades to a 1x1 zero with a warning, per the
/// stream-error policy.
pub fn parse_matrix_text<T: Real>(name: &str, text: &str) -> Matrix<T> {
    let mut rows: Vec<Vec<T>> = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut row = Vec::new();
        for field in line.split(|c: char| c == ',' || c.is_whitespace()) {
            if field.is_empty() {
                continue;
            }
            match field.parse::<f64>() {
                Ok(v) => row.push(T::from_f64(v)),
                Err(_) => {
                    warn!(file = name, field, "ill-formed matrix; using 1x1 zero");
                    return Matrix::new(1, 1);
                }
            }
        }
        rows.push(row);
    }
    if rows.is_empty() || rows.iter().any(|r| r.len() != rows[0].len()) {
        warn!(file = name, "ill-formed matrix; using 1x1 zero");
        return Matrix::new(1, 1);
    }
    Matrix::from_rows(rows)
}
