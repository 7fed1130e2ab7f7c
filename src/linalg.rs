/// Sparsely Packed Matrix with a lockable sparsity pattern
pub mod sparse_matrix;
/// Dense residual/solution Vector
pub mod vector;

use crate::error::Result;

/// The kind of write a sink has received since it was last assembled
///
/// Insert (overwrite) and add (accumulate) writes cannot be mixed: a sink holding inserted values
/// must be assembled before it accepts added ones, and vice versa.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertMode {
    NotSet,
    Insert,
    Add,
}

impl InsertMode {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::NotSet => "no",
            Self::Insert => "insert",
            Self::Add => "add",
        }
    }
}

/// Row operations a boundary condition requests before it writes its own rows
///
/// Every `(src, dst)` move adds row `src` into row `dst`; afterwards every `clear` row is zeroed.
/// Cleared matrix rows keep their sparsity pattern.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RowPlan {
    pub moves: Vec<(usize, usize)>,
    pub clear: Vec<usize>,
}

impl RowPlan {
    pub fn is_empty(&self) -> bool {
        self.moves.is_empty() && self.clear.is_empty()
    }

    pub fn extend(&mut self, other: RowPlan) {
        self.moves.extend(other.moves);
        self.clear.extend(other.clear);
    }
}

/// A (distributed) vector addressed by global offsets
pub trait VectorSink {
    fn dimension(&self) -> usize;

    fn mode(&self) -> InsertMode;

    fn add_value(&mut self, row: usize, value: f64) -> Result<()>;

    fn add_values(&mut self, rows: &[usize], values: &[f64]) -> Result<()> {
        assert_eq!(rows.len(), values.len(), "Mismatched rows and values!");
        rows.iter()
            .zip(values)
            .try_for_each(|(row, value)| self.add_value(*row, *value))
    }

    fn insert_value(&mut self, row: usize, value: f64) -> Result<()>;

    /// Flush pending writes; the next write may use either mode
    fn assemble(&mut self);

    /// Flush the sink if it holds inserted values so that it accepts added ones
    fn prepare_add(&mut self) {
        if self.mode() == InsertMode::Insert {
            self.assemble();
        }
    }

    fn apply_row_plan(&mut self, plan: &RowPlan) -> Result<()>;
}

/// A (distributed) sparse matrix addressed by global `(row, column)` offsets
pub trait MatrixSink {
    fn dimension(&self) -> usize;

    fn mode(&self) -> InsertMode;

    fn add_value(&mut self, row: usize, col: usize, value: f64) -> Result<()>;

    /// Add a row segment (`values[k]` goes to `(row, cols[k])`)
    fn add_row(&mut self, row: usize, cols: &[usize], values: &[f64]) -> Result<()> {
        assert_eq!(cols.len(), values.len(), "Mismatched columns and values!");
        cols.iter()
            .zip(values)
            .try_for_each(|(col, value)| self.add_value(row, *col, *value))
    }

    fn insert_value(&mut self, row: usize, col: usize, value: f64) -> Result<()>;

    fn assemble(&mut self);

    fn prepare_add(&mut self) {
        if self.mode() == InsertMode::Insert {
            self.assemble();
        }
    }

    fn apply_row_plan(&mut self, plan: &RowPlan) -> Result<()>;
}
