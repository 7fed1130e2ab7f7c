use nalgebra::{Dyn, U1};
use num_dual::{Derivative, DualDVec64, DualNum};

/// The derivative directions of one expression
///
/// Every independent expression creates its own `Directions`, so the number of derivative
/// components is fixed when the operands are seeded and cannot leak into the next expression.
///
/// ```ignore
/// let dirs = Directions::new(2);
/// let v = dirs.seed(0, x[psi]);
/// let ve = dirs.seed(1, x[gate]);
/// let f = v + work_function - ve;
/// jac.add_row(row, &[psi_col, gate_col], &dirs.partials(&f))?;
/// ```
#[derive(Clone, Copy, Debug)]
pub struct Directions(usize);

impl Directions {
    pub fn new(n: usize) -> Self {
        assert!(n > 0, "An expression needs at least one derivative direction!");
        Self(n)
    }

    pub fn len(&self) -> usize {
        self.0
    }

    /// An independent variable: unit derivative along direction `k`
    pub fn seed(&self, k: usize, value: f64) -> DualDVec64 {
        assert!(k < self.0, "Derivative direction out of range!");
        DualDVec64::new(value, Derivative::derivative_generic(Dyn(self.0), U1, k))
    }

    /// Derivative components of an expression built from this set's seeds
    pub fn partials(&self, value: &DualDVec64) -> Vec<f64> {
        value
            .eps
            .clone()
            .unwrap_generic(Dyn(self.0), U1)
            .iter()
            .copied()
            .collect()
    }
}

/// Primal part of a value (identity for `f64`)
pub fn primal<T: DualNum<f64>>(value: &T) -> f64 {
    value.re()
}
