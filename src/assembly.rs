/// Dual-number helpers for exact Jacobian entries
pub mod autodiff;
/// Gate contact: insulator/electrode boundary rows and the electrode circuit equation
pub mod gate;
/// Flux balance rows of the insulator and electrode bulk
pub mod region;

use crate::domain::Domain;
use crate::error::Result;
use crate::linalg::{MatrixSink, RowPlan, VectorSink};
use crate::parallel::Communicator;

use std::sync::Arc;

/// Time integration scheme of a transient run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeScheme {
    Bdf1,
    Bdf2,
}

/// Solver state the outer driver owns and the equations read
#[derive(Clone, Copy, Debug)]
pub struct Clock {
    pub time_dependent: bool,
    pub time: f64,
    pub dt: f64,
    /// Previous timestep (used by BDF2)
    pub dt_last: f64,
    pub scheme: TimeScheme,
    /// Fall back to BDF1 (e.g. on the first step of a BDF2 run)
    pub bdf2_lower_order: bool,
}

impl Clock {
    pub fn steady_state() -> Self {
        Self {
            time_dependent: false,
            time: 0.0,
            dt: 0.0,
            dt_last: 0.0,
            scheme: TimeScheme::Bdf1,
            bdf2_lower_order: false,
        }
    }

    pub fn transient(dt: f64, scheme: TimeScheme) -> Self {
        assert!(dt > 0.0, "Timestep must be positive!");
        Self {
            time_dependent: true,
            time: 0.0,
            dt,
            dt_last: dt,
            scheme,
            bdf2_lower_order: scheme == TimeScheme::Bdf2,
        }
    }

    /// `1/dt`, or 0 in a steady state run
    pub fn inv_dt(&self) -> f64 {
        if self.time_dependent {
            1.0 / self.dt
        } else {
            0.0
        }
    }

    pub fn second_order(&self) -> bool {
        self.time_dependent && self.scheme == TimeScheme::Bdf2 && !self.bdf2_lower_order
    }

    /// Move to the next step after the current one was accepted
    pub fn advance(&mut self, next_dt: f64) {
        self.time += self.dt;
        self.dt_last = self.dt;
        self.dt = next_dt;
        self.bdf2_lower_order = false;
    }
}

/// Everything an assembly call needs beyond the Domain and the iterate
#[derive(Clone)]
pub struct SimulationContext {
    pub clock: Clock,
    pub comm: Arc<dyn Communicator>,
}

impl SimulationContext {
    pub fn new(clock: Clock, comm: Arc<dyn Communicator>) -> Self {
        Self { clock, comm }
    }
}

/// Write the initial electrode potentials and row scalings (last processor only)
pub fn fill_value(
    domain: &mut Domain,
    x: &mut impl VectorSink,
    scaling: &mut impl VectorSink,
    ctx: &SimulationContext,
) -> Result<()> {
    let (_, gates) = domain.split()?;
    for gate in gates.iter() {
        gate::fill_value(gate, x, scaling, ctx)?;
    }
    Ok(())
}

/// Assemble the residual of every region and gate at the local iterate `x` (collective)
///
/// Bulk rows are written first; the gates' row plans then redistribute them before the gate rows
/// are added.
pub fn function(
    domain: &mut Domain,
    x: &[f64],
    f: &mut impl VectorSink,
    ctx: &SimulationContext,
) -> Result<()> {
    let (topo, gates) = domain.split()?;

    for r in 0..topo.regions.len() {
        region::function(r, &topo, x, f, ctx)?;
    }

    let mut plan = RowPlan::default();
    for gate in gates.iter() {
        plan.extend(gate::function_preprocess(gate, &topo, ctx)?);
    }
    f.assemble();
    f.apply_row_plan(&plan)?;

    for gate in gates.iter_mut() {
        gate::function(gate, &topo, x, f, ctx)?;
    }

    log::debug!(
        "processor {}: residual assembled ({} row operations)",
        ctx.comm.rank(),
        plan.moves.len() + plan.clear.len()
    );
    Ok(())
}

/// Declare the sparsity pattern of the Jacobian (collective)
pub fn jacobian_reserve(
    domain: &mut Domain,
    jac: &mut impl MatrixSink,
    ctx: &SimulationContext,
) -> Result<()> {
    let (topo, gates) = domain.split()?;

    for r in 0..topo.regions.len() {
        region::jacobian_reserve(r, &topo, jac, ctx)?;
    }
    for gate in gates.iter() {
        gate::jacobian_reserve(gate, &topo, jac, ctx)?;
    }
    jac.assemble();
    Ok(())
}

/// Assemble the Jacobian of every region and gate at the local iterate `x`
pub fn jacobian(
    domain: &mut Domain,
    x: &[f64],
    jac: &mut impl MatrixSink,
    ctx: &SimulationContext,
) -> Result<()> {
    let (topo, gates) = domain.split()?;

    for r in 0..topo.regions.len() {
        region::jacobian(r, &topo, x, jac, ctx)?;
    }

    let mut plan = RowPlan::default();
    for gate in gates.iter() {
        plan.extend(gate::jacobian_preprocess(gate, &topo, ctx)?);
    }
    jac.assemble();
    jac.apply_row_plan(&plan)?;

    for gate in gates.iter() {
        gate::jacobian(gate, &topo, x, jac, ctx)?;
    }
    Ok(())
}

/// Accept the last solution: electrode currents are summed over the processors (collective)
pub fn update_solution(domain: &mut Domain, ctx: &SimulationContext) -> Result<()> {
    let (_, gates) = domain.split()?;
    for gate in gates.iter_mut() {
        gate::update_solution(gate, ctx);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_orders() {
        let steady = Clock::steady_state();
        assert_eq!(steady.inv_dt(), 0.0);
        assert!(!steady.second_order());

        let mut clock = Clock::transient(0.5, TimeScheme::Bdf2);
        assert_eq!(clock.inv_dt(), 2.0);
        // the first BDF2 step has no history
        assert!(!clock.second_order());

        clock.advance(0.25);
        assert!(clock.second_order());
        assert_eq!(clock.time, 0.5);
        assert_eq!(clock.dt_last, 0.5);
        assert_eq!(clock.inv_dt(), 4.0);
    }
}
