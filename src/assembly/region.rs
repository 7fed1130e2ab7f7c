use super::autodiff::Directions;
use super::SimulationContext;
use crate::domain::node_graph::Neighbor;
use crate::domain::region::{Region, RegionKind, Variable};
use crate::domain::Topology;
use crate::error::{Error, Result};
use crate::linalg::{MatrixSink, VectorSink};

use num_dual::DualNum;

/// Flux from a neighbour into a node's control volume: `k * A / d * (u_nb - u)`
fn edge_flux<T: DualNum<f64>>(here: T, there: T, coefficient: f64, nb: &Neighbor) -> T {
    (there - here) * (coefficient * nb.cv_surface_area / nb.distance)
}

/// Variables with a flux balance row, paired with the coefficient of their flux
fn balanced_variables(region: &Region, equation: &str) -> Result<Vec<(Variable, Option<f64>)>> {
    match region.kind() {
        RegionKind::Insulator | RegionKind::Electrode => {
            let mut vars = vec![(Variable::Potential, None)];
            if region.advanced_model().enable_tl {
                vars.push((Variable::Temperature, Some(region.thermal_conductivity())));
            }
            Ok(vars)
        }
        RegionKind::Vacuum | RegionKind::Pml => Ok(Vec::new()),
        RegionKind::Semiconductor => Err(Error::UnexpectedRegion {
            equation: equation.to_string(),
            region: region.name.clone(),
            kind: region.kind().to_string(),
        }),
    }
}

/// Add the flux balance of every owned node of region `r`
///
/// The potential row uses the permittivity cached on each node (`None` above), the temperature row the
/// region's thermal conductivity.
pub fn function(
    r: usize,
    topo: &Topology,
    x: &[f64],
    f: &mut impl VectorSink,
    ctx: &SimulationContext,
) -> Result<()> {
    let region = &topo.regions[r];
    let vars = balanced_variables(region, "bulk flux balance")?;
    if vars.is_empty() {
        return Ok(());
    }
    f.prepare_add();

    let rank = ctx.comm.rank();
    let mut rows = Vec::new();
    let mut values = Vec::new();

    for &id in topo.graph.region_nodes(r) {
        let node = topo.graph.node(id);
        if !node.on_processor(rank) {
            continue;
        }
        let (local, global) = (node.local_offset()?, node.global_offset()?);

        for &(var, coefficient) in vars.iter() {
            let v = region.variable_offset(var)?;
            let k = coefficient.unwrap_or(node.data.eps);

            let mut balance = 0.0;
            for nb in node.neighbors.iter() {
                let there = x[topo.graph.node(nb.node).local_offset()? + v];
                balance += edge_flux(x[local + v], there, k, nb);
            }
            rows.push(global + v);
            values.push(balance);
        }
    }

    f.add_values(&rows, &values)
}

/// Add the derivatives of the flux balances of region `r`
pub fn jacobian(
    r: usize,
    topo: &Topology,
    x: &[f64],
    jac: &mut impl MatrixSink,
    ctx: &SimulationContext,
) -> Result<()> {
    let region = &topo.regions[r];
    let vars = balanced_variables(region, "bulk flux balance")?;
    if vars.is_empty() {
        return Ok(());
    }
    jac.prepare_add();

    let rank = ctx.comm.rank();
    for &id in topo.graph.region_nodes(r) {
        let node = topo.graph.node(id);
        if !node.on_processor(rank) {
            continue;
        }
        let (local, global) = (node.local_offset()?, node.global_offset()?);

        for &(var, coefficient) in vars.iter() {
            let v = region.variable_offset(var)?;
            let k = coefficient.unwrap_or(node.data.eps);

            for nb in node.neighbors.iter() {
                let other = topo.graph.node(nb.node);
                let dirs = Directions::new(2);
                let flux = edge_flux(
                    dirs.seed(0, x[local + v]),
                    dirs.seed(1, x[other.local_offset()? + v]),
                    k,
                    nb,
                );
                jac.add_row(
                    global + v,
                    &[global + v, other.global_offset()? + v],
                    &dirs.partials(&flux),
                )?;
            }
        }
    }
    Ok(())
}

/// Reserve the diagonal and neighbour couplings of every flux balance row of region `r`
pub fn jacobian_reserve(
    r: usize,
    topo: &Topology,
    jac: &mut impl MatrixSink,
    ctx: &SimulationContext,
) -> Result<()> {
    let region = &topo.regions[r];
    let vars = balanced_variables(region, "bulk flux balance")?;
    if vars.is_empty() {
        return Ok(());
    }
    jac.prepare_add();

    let rank = ctx.comm.rank();
    for &id in topo.graph.region_nodes(r) {
        let node = topo.graph.node(id);
        if !node.on_processor(rank) {
            continue;
        }
        let global = node.global_offset()?;

        for &(var, _) in vars.iter() {
            let v = region.variable_offset(var)?;
            jac.add_value(global + v, global + v, 0.0)?;
            for nb in node.neighbors.iter() {
                jac.add_value(global + v, topo.graph.node(nb.node).global_offset()? + v, 0.0)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::Clock;
    use crate::circuit::ExternalCircuit;
    use crate::domain::region::AdvancedModel;
    use crate::domain::tests::gate_stack;
    use crate::linalg::{sparse_matrix::SparseMatrix, vector::Vector};
    use crate::parallel::{NoComm, Partition};
    use std::sync::Arc;

    fn context() -> SimulationContext {
        SimulationContext::new(Clock::steady_state(), Arc::new(NoComm))
    }

    #[test]
    fn uniform_potential_has_no_flux() {
        let mut domain = gate_stack(
            Partition::serial(12),
            AdvancedModel::default(),
            ExternalCircuit::voltage_driven(0.0, 0.0, 0.0),
        );
        domain.number(0).unwrap();
        let (topo, _) = domain.split().unwrap();

        let x = vec![1.25; 17];
        let mut f = Vector::zeros(17);
        for r in 0..2 {
            function(r, &topo, &x, &mut f, &context()).unwrap();
        }
        assert!(f.values().iter().all(|v| v.abs() < 1e-14));
    }

    #[test]
    fn linear_potential_is_balanced_inside() {
        let mut domain = gate_stack(
            Partition::serial(12),
            AdvancedModel::default(),
            ExternalCircuit::voltage_driven(0.0, 0.0, 0.0),
        );
        domain.number(0).unwrap();
        let points = domain.mesh.points.clone();
        let (topo, _) = domain.split().unwrap();

        // psi = x: interior nodes of a uniform right-triangle mesh see no net flux
        let mut x = vec![0.0; 17];
        for node in topo.graph.nodes() {
            x[node.local_offset().unwrap()] = points[node.root].x;
        }

        let mut f = Vector::zeros(17);
        function(0, &topo, &x, &mut f, &context()).unwrap();

        let row = |root: usize| f[topo.graph.node(topo.graph.nodes_at(root)[0]).global_offset().unwrap()];
        assert!(row(1).abs() < 1e-12);
        assert!(row(2).abs() < 1e-12);
        // the right wall only receives flux from the left
        assert!(row(3) < 0.0);
    }

    #[test]
    fn jacobian_rows_sum_to_zero() {
        let hot = AdvancedModel {
            enable_tl: true,
            ..Default::default()
        };
        let mut domain = gate_stack(
            Partition::serial(12),
            hot,
            ExternalCircuit::voltage_driven(0.0, 0.0, 0.0),
        );
        domain.number(0).unwrap();
        let (topo, _) = domain.split().unwrap();

        let x = vec![0.0; 33];
        let mut jac = SparseMatrix::new(33);
        for r in 0..2 {
            jacobian_reserve(r, &topo, &mut jac, &context()).unwrap();
        }
        jac.lock_pattern();
        for r in 0..2 {
            jacobian(r, &topo, &x, &mut jac, &context()).unwrap();
        }

        // a pure flux balance conserves: each row's derivatives cancel
        for row in 0..32 {
            let sum: f64 = jac.row(row).map(|(_, v)| v).sum();
            assert!(sum.abs() < 1e-12, "row {} sums to {}", row, sum);
            assert!(jac.row(row).count() > 1);
        }
    }

    #[test]
    fn semiconductor_bulk_is_not_provided() {
        let region = Region::new(0, "si", RegionKind::Semiconductor, AdvancedModel::default());
        assert!(matches!(
            balanced_variables(&region, "bulk flux balance"),
            Err(Error::UnexpectedRegion { .. })
        ));
    }
}
