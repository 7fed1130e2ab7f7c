use super::{InsertMode, MatrixSink, RowPlan};
use crate::error::{Error, Result};

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufWriter, Write};

use bytes::{BufMut, BytesMut};
use nalgebra::DMatrix;

/// PETSc's class id for matrices in its binary format
const MAT_FILE_CLASSID: i32 = 1211216;

/// Wrapper around a BTreeMap to store a square Jacobian in a sparse data structure
///
/// Entries come into existence when first written (a zero written during the reservation pass is
/// an entry). Once [`lock_pattern`](SparseMatrix::lock_pattern) is called, writes to positions
/// which are not yet entries fail with [`Error::PatternViolation`], the way a preallocated
/// distributed matrix refuses new non-zeros.
#[derive(Clone, Debug)]
pub struct SparseMatrix {
    /// Size of the square matrix
    pub dimension: usize,
    /// Matrix Entries, sorted by row then column
    entries: BTreeMap<[u32; 2], f64>,
    locked: bool,
    mode: InsertMode,
}

impl SparseMatrix {
    pub fn new(dimension: usize) -> Self {
        assert!(
            dimension <= (std::u32::MAX as usize),
            "Matrix Dimension cannot exceed the size of a u32!"
        );

        Self {
            dimension,
            entries: BTreeMap::new(),
            locked: false,
            mode: InsertMode::NotSet,
        }
    }

    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        self.entries.get(&[row as u32, col as u32]).copied()
    }

    /// Freeze the sparsity pattern: only existing entries accept values from now on
    pub fn lock_pattern(&mut self) {
        self.locked = true;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Positions of every entry
    pub fn pattern(&self) -> BTreeSet<[usize; 2]> {
        self.entries
            .keys()
            .map(|[r, c]| [*r as usize, *c as usize])
            .collect()
    }

    /// Positions of the entries holding a non-zero value
    pub fn nonzero_pattern(&self) -> BTreeSet<[usize; 2]> {
        self.entries
            .iter()
            .filter(|(_, v)| **v != 0.0)
            .map(|([r, c], _)| [*r as usize, *c as usize])
            .collect()
    }

    /// Zero every value, keeping the pattern
    pub fn zero_entries(&mut self) {
        self.entries.values_mut().for_each(|v| *v = 0.0);
        self.mode = InsertMode::NotSet;
    }

    /// Iterate over the entries of one row
    pub fn row(&self, row: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let r = row as u32;
        self.entries
            .range([r, 0]..=[r, u32::MAX])
            .map(|([_, c], v)| (*c as usize, *v))
    }

    /// Iterate over all entries
    pub fn iter(&self) -> impl Iterator<Item = ([usize; 2], f64)> + '_ {
        self.entries
            .iter()
            .map(|([r, c], v)| ([*r as usize, *c as usize], *v))
    }

    /// Consume the entries of another sparse matrix (e.g. the part assembled by another process), leaving it empty
    pub fn consume_matrix(&mut self, other: &mut Self) {
        assert!(
            self.dimension == other.dimension,
            "Sparse Matrices have different dimensions; cannot consume matrix!"
        );

        for (coordinates, value) in std::mem::take(&mut other.entries) {
            *self.entries.entry(coordinates).or_insert(0.0) += value;
        }
    }

    fn coordinates(&self, row: usize, col: usize) -> Result<[u32; 2]> {
        for index in [row, col] {
            if index >= self.dimension {
                return Err(Error::OutOfBounds {
                    index,
                    dimension: self.dimension,
                });
            }
        }
        let coordinates = [row as u32, col as u32];
        if self.locked && !self.entries.contains_key(&coordinates) {
            return Err(Error::PatternViolation { row, col });
        }
        Ok(coordinates)
    }

    fn set_mode(&mut self, mode: InsertMode) -> Result<()> {
        match self.mode {
            InsertMode::NotSet => self.mode = mode,
            current if current != mode => {
                return Err(Error::ModeConflict {
                    attempted: mode.name(),
                    pending: current.name(),
                })
            }
            _ => {}
        }
        Ok(())
    }

    #[cfg(feature = "petsc_export")]
    pub fn write_to_petsc_binary_format(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        AIJMatrixBinary::from(self).print_to_petsc_binary_file(path)
    }
}

impl MatrixSink for SparseMatrix {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn mode(&self) -> InsertMode {
        self.mode
    }

    fn add_value(&mut self, row: usize, col: usize, value: f64) -> Result<()> {
        let coordinates = self.coordinates(row, col)?;
        self.set_mode(InsertMode::Add)?;
        *self.entries.entry(coordinates).or_insert(0.0) += value;
        Ok(())
    }

    fn insert_value(&mut self, row: usize, col: usize, value: f64) -> Result<()> {
        let coordinates = self.coordinates(row, col)?;
        self.set_mode(InsertMode::Insert)?;
        self.entries.insert(coordinates, value);
        Ok(())
    }

    fn assemble(&mut self) {
        self.mode = InsertMode::NotSet;
    }

    fn apply_row_plan(&mut self, plan: &RowPlan) -> Result<()> {
        for &(src, dst) in plan.moves.iter() {
            let moved: Vec<(usize, f64)> = self.row(src).collect();
            for (col, value) in moved {
                let coordinates = self.coordinates(dst, col)?;
                *self.entries.entry(coordinates).or_insert(0.0) += value;
            }
        }

        for &row in plan.clear.iter() {
            if row >= self.dimension {
                return Err(Error::OutOfBounds {
                    index: row,
                    dimension: self.dimension,
                });
            }
            let r = row as u32;
            self.entries
                .range_mut([r, 0]..=[r, u32::MAX])
                .for_each(|(_, v)| *v = 0.0);
        }
        Ok(())
    }
}

impl From<&SparseMatrix> for DMatrix<f64> {
    fn from(sm: &SparseMatrix) -> Self {
        let mut dense = DMatrix::zeros(sm.dimension, sm.dimension);
        for ([r, c], v) in sm.iter() {
            dense[(r, c)] = v;
        }
        dense
    }
}

impl From<&SparseMatrix> for AIJMatrixBinary {
    fn from(sm: &SparseMatrix) -> Self {
        // number of entries in each row
        let mut i = vec![0; sm.dimension];
        for [r, _] in sm.entries.keys() {
            i[*r as usize] += 1;
        }

        // entries are already sorted by row then column
        let (j, a) = sm.entries.iter().map(|([_, c], v)| (*c as i32, *v)).unzip();

        AIJMatrixBinary {
            a,
            i,
            j,
            dim: sm.dimension,
        }
    }
}

/// Petsc Sparse Matrix Format
pub struct AIJMatrixBinary {
    pub a: Vec<f64>,
    pub i: Vec<i32>, // Number of entries on each row (compute a prefix sum to get canonical form)
    pub j: Vec<i32>,
    pub dim: usize,
}

impl AIJMatrixBinary {
    pub fn print_to_petsc_binary_file(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        let file = File::create(path.as_ref())?;
        let mut writer = BufWriter::new(file);

        // header
        let mut header_buf = BytesMut::with_capacity(16);
        header_buf.put_i32(MAT_FILE_CLASSID);
        header_buf.put_i32(self.dim as i32);
        header_buf.put_i32(self.dim as i32);
        header_buf.put_i32(self.a.len() as i32);
        writer.write_all(header_buf.as_ref())?;

        // num-non-zero entries on each row
        let mut rnnz_buf = BytesMut::with_capacity(self.i.len() * 4);
        for &rnz in self.i.iter() {
            rnnz_buf.put_i32(rnz);
        }
        writer.write_all(rnnz_buf.as_ref())?;

        // column indices of non-zero entries
        let mut j_buf = BytesMut::with_capacity(self.j.len() * 4);
        for &j in self.j.iter() {
            j_buf.put_i32(j);
        }
        writer.write_all(j_buf.as_ref())?;

        // non-zero entries
        let mut a_buf = BytesMut::with_capacity(self.a.len() * 8);
        for &a in self.a.iter() {
            a_buf.put_f64(a);
        }
        writer.write_all(a_buf.as_ref())?;

        writer.flush()?;
        Ok(())
    }
}
