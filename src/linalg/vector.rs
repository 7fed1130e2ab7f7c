use super::{InsertMode, RowPlan, VectorSink};
use crate::error::{Error, Result};

use std::ops::Index;

/// Serial stand-in for a distributed vector: every global entry is stored locally
#[derive(Clone, Debug)]
pub struct Vector {
    values: Vec<f64>,
    mode: InsertMode,
}

impl Vector {
    pub fn zeros(dimension: usize) -> Self {
        Self {
            values: vec![0.0; dimension],
            mode: InsertMode::NotSet,
        }
    }

    pub fn from_values(values: Vec<f64>) -> Self {
        Self {
            values,
            mode: InsertMode::NotSet,
        }
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn into_values(self) -> Vec<f64> {
        self.values
    }

    pub fn set_zero(&mut self) {
        self.values.iter_mut().for_each(|v| *v = 0.0);
        self.mode = InsertMode::NotSet;
    }

    /// Add another vector of the same dimension (the partial vectors of several processors)
    pub fn accumulate(&mut self, other: &Self) {
        assert_eq!(
            self.values.len(),
            other.values.len(),
            "Vectors have different dimensions; cannot accumulate!"
        );
        self.values
            .iter_mut()
            .zip(other.values.iter())
            .for_each(|(a, b)| *a += b);
    }

    fn check(&mut self, row: usize, mode: InsertMode) -> Result<()> {
        if row >= self.values.len() {
            return Err(Error::OutOfBounds {
                index: row,
                dimension: self.values.len(),
            });
        }
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
}

impl Index<usize> for Vector {
    type Output = f64;

    fn index(&self, index: usize) -> &f64 {
        &self.values[index]
    }
}

impl VectorSink for Vector {
    fn dimension(&self) -> usize {
        self.values.len()
    }

    fn mode(&self) -> InsertMode {
        self.mode
    }

    fn add_value(&mut self, row: usize, value: f64) -> Result<()> {
        self.check(row, InsertMode::Add)?;
        self.values[row] += value;
        Ok(())
    }

    fn insert_value(&mut self, row: usize, value: f64) -> Result<()> {
        self.check(row, InsertMode::Insert)?;
        self.values[row] = value;
        Ok(())
    }

    fn assemble(&mut self) {
        self.mode = InsertMode::NotSet;
    }

    fn apply_row_plan(&mut self, plan: &RowPlan) -> Result<()> {
        let dimension = self.values.len();
        let bounds = |index: usize| {
            if index < dimension {
                Ok(())
            } else {
                Err(Error::OutOfBounds { index, dimension })
            }
        };

        for &(src, dst) in plan.moves.iter() {
            bounds(src)?;
            bounds(dst)?;
            self.values[dst] += self.values[src];
        }
        for &row in plan.clear.iter() {
            bounds(row)?;
            self.values[row] = 0.0;
        }
        Ok(())
    }
}
