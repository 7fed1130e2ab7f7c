use super::autodiff::Directions;
use super::{Clock, SimulationContext};
use crate::circuit::CircuitMode;
use crate::domain::boundary::GateContact;
use crate::domain::node_graph::{FvmNode, NodeData, NodeId};
use crate::domain::region::{Region, RegionKind, Variable};
use crate::domain::Topology;
use crate::error::{Error, Result};
use crate::linalg::{MatrixSink, RowPlan, VectorSink};

use num_dual::{DualDVec64, DualNum};

// Expressions shared by the residual (f64) and the Jacobian (dual numbers)

/// The insulator side of the gate sits at the electrode potential shifted by the work function
fn insulator_potential<T: DualNum<f64>>(v: T, ve: T, work_function: f64) -> T {
    v + work_function - ve
}

/// Heat lost to the environment through the node's outer surface
fn heat_loss<T: DualNum<f64>>(t: T, heat_transfer: f64, t_external: f64, surface: f64) -> T {
    (t - t_external) * (-heat_transfer * surface)
}

/// An electrode node follows its insulator reference
fn continuity<T: DualNum<f64>>(value: T, reference: T) -> T {
    value - reference
}

/// Time derivative of the field along the edge from `here` to `there`
fn field_rate<T: DualNum<f64>>(
    v: T,
    v_nb: T,
    here: &NodeData,
    there: &NodeData,
    distance: f64,
    clock: &Clock,
) -> T {
    if clock.second_order() {
        let r = clock.dt_last / (clock.dt_last + clock.dt);
        let history = -(here.psi - there.psi) / (r * (1.0 - r))
            + (1.0 - r) / r * (here.psi_last - there.psi_last);
        ((v - v_nb) * ((2.0 - r) / (1.0 - r)) + history) / (distance * (clock.dt_last + clock.dt))
    } else {
        (v - v_nb - (here.psi - there.psi)) / (distance * clock.dt)
    }
}

fn site<'a>(topo: &Topology<'a>, id: NodeId) -> (&'a FvmNode, &'a Region) {
    let node = topo.graph.node(id);
    (node, &topo.regions[node.region])
}

fn unexpected(gate: &GateContact, region: &Region) -> Error {
    Error::UnexpectedRegion {
        equation: format!("gate '{}'", gate.name),
        region: region.name.clone(),
        kind: region.kind().to_string(),
    }
}

/// Insulator nodes exchange heat with the environment on the device's outer boundary or next to vacuum
fn loses_heat(node: &FvmNode, region: &Region, topo: &Topology) -> bool {
    region.advanced_model().enable_tl
        && (node.on_outer_boundary
            || topo
                .graph
                .has_region_kind(node.root, RegionKind::Vacuum, topo.regions))
}

fn hub_potential(gate: &GateContact, topo: &Topology, x: &[f64]) -> Result<f64> {
    match gate.circuit.inter_connect_hub() {
        Some(hub) => Ok(x[topo.hubs[hub].local_offset()?]),
        None => Ok(0.0),
    }
}

/// Write the electrode potential and the row scaling of the gate's circuit equation
///
/// Only the last processor owns the electrode unknown, the others leave both vectors untouched.
pub fn fill_value(
    gate: &GateContact,
    x: &mut impl VectorSink,
    scaling: &mut impl VectorSink,
    ctx: &SimulationContext,
) -> Result<()> {
    if !ctx.comm.is_last() {
        return Ok(());
    }

    let bc = gate.global_offset()?;
    let z_width = gate.params.z_width;
    let scale = match gate.circuit.mode {
        CircuitMode::InterConnect { .. } => 1.0,
        CircuitMode::VoltageDriven => 1.0 / ((1.0 + gate.circuit.r) * z_width),
        CircuitMode::CurrentDriven => 1.0 / z_width,
    };

    x.insert_value(bc, gate.circuit.potential())?;
    scaling.insert_value(bc, scale)
}

/// Rows the gate replaces: insulator and electrode potentials are cleared, the electrode's heat
/// balance is folded into its insulator reference before being cleared
fn row_plan(gate: &GateContact, topo: &Topology, rank: usize) -> Result<RowPlan> {
    let mut plan = RowPlan::default();

    for bnode in gate.local_nodes(rank) {
        let (reference, ref_region) = site(topo, bnode.fvm_nodes[0]);

        for &id in bnode.fvm_nodes.iter() {
            let (node, region) = site(topo, id);
            match region.kind() {
                RegionKind::Insulator => {
                    let psi = region.variable_offset(Variable::Potential)?;
                    plan.clear.push(node.global_offset()? + psi);
                }
                RegionKind::Electrode => {
                    let global = node.global_offset()?;
                    plan.clear
                        .push(global + region.variable_offset(Variable::Potential)?);

                    if region.advanced_model().enable_tl {
                        let t = global + region.variable_offset(Variable::Temperature)?;
                        let ref_t = reference.global_offset()?
                            + ref_region.variable_offset(Variable::Temperature)?;
                        plan.moves.push((t, ref_t));
                        plan.clear.push(t);
                    }
                }
                RegionKind::Vacuum => {}
                _ => return Err(unexpected(gate, region)),
            }
        }
    }
    Ok(plan)
}

/// Row operations to apply to the residual before [`function`] adds the gate rows
pub fn function_preprocess(
    gate: &GateContact,
    topo: &Topology,
    ctx: &SimulationContext,
) -> Result<RowPlan> {
    row_plan(gate, topo, ctx.comm.rank())
}

/// Row operations to apply to the Jacobian before [`jacobian`] adds the gate rows
pub fn jacobian_preprocess(
    gate: &GateContact,
    topo: &Topology,
    ctx: &SimulationContext,
) -> Result<RowPlan> {
    row_plan(gate, topo, ctx.comm.rank())
}

/// Add the gate rows and this processor's share of the electrode equation to the residual
///
/// The displacement current through the gate's owned insulator nodes is recorded on the circuit;
/// [`update_solution`] sums the shares of all processors.
pub fn function(
    gate: &mut GateContact,
    topo: &Topology,
    x: &[f64],
    f: &mut impl VectorSink,
    ctx: &SimulationContext,
) -> Result<()> {
    f.prepare_add();

    let rank = ctx.comm.rank();
    let clock = &ctx.clock;
    let params = gate.params;
    let ve = x[gate.local_offset()?];

    let mut rows = Vec::new();
    let mut values = Vec::new();
    let mut displacement = Vec::new();

    for bnode in gate.local_nodes(rank) {
        let (reference, ref_region) = site(topo, bnode.fvm_nodes[0]);
        let ref_local = reference.local_offset()?;

        for &id in bnode.fvm_nodes.iter() {
            let (node, region) = site(topo, id);
            match region.kind() {
                RegionKind::Insulator => {
                    let (local, global) = (node.local_offset()?, node.global_offset()?);
                    let psi = region.variable_offset(Variable::Potential)?;
                    rows.push(global + psi);
                    values.push(insulator_potential(x[local + psi], ve, params.work_function));

                    if loses_heat(node, region, topo) {
                        let t = region.variable_offset(Variable::Temperature)?;
                        rows.push(global + t);
                        values.push(heat_loss(
                            x[local + t],
                            params.heat_transfer,
                            params.t_external,
                            node.outside_boundary_surface_area,
                        ));
                    }

                    if clock.time_dependent {
                        for nb in node.neighbors.iter() {
                            let other = topo.graph.node(nb.node);
                            let rate = field_rate(
                                x[local + psi],
                                x[other.local_offset()? + psi],
                                &node.data,
                                &other.data,
                                nb.distance,
                                clock,
                            );
                            displacement.push(nb.cv_surface_area * node.data.eps * rate);
                        }
                    }
                }
                RegionKind::Electrode => {
                    let (local, global) = (node.local_offset()?, node.global_offset()?);
                    let psi = region.variable_offset(Variable::Potential)?;
                    let ref_psi = ref_region.variable_offset(Variable::Potential)?;
                    rows.push(global + psi);
                    values.push(continuity(x[local + psi], x[ref_local + ref_psi]));

                    if region.advanced_model().enable_tl {
                        let t = region.variable_offset(Variable::Temperature)?;
                        let ref_t = ref_region.variable_offset(Variable::Temperature)?;
                        rows.push(global + t);
                        values.push(continuity(x[local + t], x[ref_local + ref_t]));
                    }
                }
                RegionKind::Vacuum => {}
                _ => return Err(unexpected(gate, region)),
            }
        }
    }
    f.add_values(&rows, &values)?;

    let current = params.z_width * displacement.iter().sum::<f64>();
    let bc = gate.global_offset()?;
    f.add_value(bc, gate.circuit.current_factor(clock.inv_dt()) * current)?;

    if ctx.comm.is_last() {
        let hub = hub_potential(gate, topo, x)?;
        f.add_value(bc, gate.circuit.residual(ve, hub, clock.inv_dt()))?;
    }

    gate.circuit.record_iteration(ve, current);
    log::trace!(
        "gate '{}' on processor {}: Ve = {:.6e}, partial current = {:.6e}",
        gate.name,
        rank,
        ve,
        current
    );
    Ok(())
}

/// Reserve every entry [`jacobian`] writes, including the electrode row's couplings to the
/// insulator unknowns of all processors (collective)
pub fn jacobian_reserve(
    gate: &GateContact,
    topo: &Topology,
    jac: &mut impl MatrixSink,
    ctx: &SimulationContext,
) -> Result<()> {
    jac.prepare_add();

    let rank = ctx.comm.rank();
    let bc = gate.global_offset()?;
    let mut coupled = Vec::new();

    for bnode in gate.local_nodes(rank) {
        let (reference, ref_region) = site(topo, bnode.fvm_nodes[0]);
        let ref_global = reference.global_offset()?;

        for &id in bnode.fvm_nodes.iter() {
            let (node, region) = site(topo, id);
            let global = node.global_offset()?;
            match region.kind() {
                RegionKind::Insulator => {
                    let n_vars = region.n_variables();
                    for v in 0..n_vars {
                        jac.add_value(global + v, bc, 0.0)?;
                    }
                    let psi = region.variable_offset(Variable::Potential)?;
                    jac.add_value(global + psi, global + psi, 0.0)?;

                    coupled.extend(global..global + n_vars);
                    for nb in node.neighbors.iter() {
                        let first = topo.graph.node(nb.node).global_offset()?;
                        coupled.extend(first..first + n_vars);
                    }

                    if !region.advanced_model().enable_tl {
                        continue;
                    }
                    let t = global + region.variable_offset(Variable::Temperature)?;
                    if loses_heat(node, region, topo) {
                        jac.add_value(t, t, 0.0)?;
                    }
                    // the heat balances of the other regions at this root are moved into this row
                    for &g in node.ghosts.iter() {
                        let (ghost, ghost_region) = site(topo, g);
                        if let Ok(ghost_t) = ghost_region.variable_offset(Variable::Temperature) {
                            jac.add_value(t, ghost.global_offset()? + ghost_t, 0.0)?;
                            for nb in ghost.neighbors.iter() {
                                let col = topo.graph.node(nb.node).global_offset()? + ghost_t;
                                jac.add_value(t, col, 0.0)?;
                            }
                        }
                    }
                }
                RegionKind::Electrode => {
                    let psi = region.variable_offset(Variable::Potential)?;
                    let ref_psi = ref_region.variable_offset(Variable::Potential)?;
                    jac.add_row(global + psi, &[global + psi, ref_global + ref_psi], &[0.0; 2])?;

                    if region.advanced_model().enable_tl {
                        let t = region.variable_offset(Variable::Temperature)?;
                        let ref_t = ref_region.variable_offset(Variable::Temperature)?;
                        jac.add_row(global + t, &[global + t, ref_global + ref_t], &[0.0; 2])?;
                    }
                }
                RegionKind::Vacuum => {}
                _ => return Err(unexpected(gate, region)),
            }
        }
    }

    let coupled = ctx.comm.all_gather(&coupled);

    if ctx.comm.is_last() {
        jac.add_value(bc, bc, 0.0)?;
        if let Some(hub) = gate.circuit.inter_connect_hub() {
            jac.add_value(bc, topo.hubs[hub].global_offset()?, 0.0)?;
        }
        jac.add_row(bc, &coupled, &vec![0.0; coupled.len()])?;
    }
    Ok(())
}

/// Add the derivatives of the gate rows and of this processor's share of the electrode equation
pub fn jacobian(
    gate: &GateContact,
    topo: &Topology,
    x: &[f64],
    jac: &mut impl MatrixSink,
    ctx: &SimulationContext,
) -> Result<()> {
    jac.prepare_add();

    let rank = ctx.comm.rank();
    let clock = &ctx.clock;
    let params = gate.params;
    let bc = gate.global_offset()?;
    let ve = x[gate.local_offset()?];
    let current_scale = params.z_width * gate.circuit.current_factor(clock.inv_dt());

    for bnode in gate.local_nodes(rank) {
        let (reference, ref_region) = site(topo, bnode.fvm_nodes[0]);
        let (ref_local, ref_global) = (reference.local_offset()?, reference.global_offset()?);

        for &id in bnode.fvm_nodes.iter() {
            let (node, region) = site(topo, id);
            match region.kind() {
                RegionKind::Insulator => {
                    let (local, global) = (node.local_offset()?, node.global_offset()?);
                    let psi = region.variable_offset(Variable::Potential)?;

                    let dirs = Directions::new(2);
                    let row = insulator_potential(
                        dirs.seed(0, x[local + psi]),
                        dirs.seed(1, ve),
                        params.work_function,
                    );
                    jac.add_row(global + psi, &[global + psi, bc], &dirs.partials(&row))?;

                    if loses_heat(node, region, topo) {
                        let t = region.variable_offset(Variable::Temperature)?;
                        let dirs = Directions::new(1);
                        let row = heat_loss(
                            dirs.seed(0, x[local + t]),
                            params.heat_transfer,
                            params.t_external,
                            node.outside_boundary_surface_area,
                        );
                        jac.add_value(global + t, global + t, dirs.partials(&row)[0])?;
                    }

                    if clock.time_dependent {
                        for nb in node.neighbors.iter() {
                            let other = topo.graph.node(nb.node);
                            let dirs = Directions::new(2);
                            let rate = field_rate(
                                dirs.seed(0, x[local + psi]),
                                dirs.seed(1, x[other.local_offset()? + psi]),
                                &node.data,
                                &other.data,
                                nb.distance,
                                clock,
                            );
                            let current = rate * (nb.cv_surface_area * node.data.eps * current_scale);
                            jac.add_row(
                                bc,
                                &[global + psi, other.global_offset()? + psi],
                                &dirs.partials(&current),
                            )?;
                        }
                    }
                }
                RegionKind::Electrode => {
                    let (local, global) = (node.local_offset()?, node.global_offset()?);
                    let psi = region.variable_offset(Variable::Potential)?;
                    let ref_psi = ref_region.variable_offset(Variable::Potential)?;

                    let dirs = Directions::new(2);
                    let row = continuity(
                        dirs.seed(0, x[local + psi]),
                        dirs.seed(1, x[ref_local + ref_psi]),
                    );
                    jac.add_row(
                        global + psi,
                        &[global + psi, ref_global + ref_psi],
                        &dirs.partials(&row),
                    )?;

                    if region.advanced_model().enable_tl {
                        let t = region.variable_offset(Variable::Temperature)?;
                        let ref_t = ref_region.variable_offset(Variable::Temperature)?;
                        let row = continuity(
                            dirs.seed(0, x[local + t]),
                            dirs.seed(1, x[ref_local + ref_t]),
                        );
                        jac.add_row(
                            global + t,
                            &[global + t, ref_global + ref_t],
                            &dirs.partials(&row),
                        )?;
                    }
                }
                RegionKind::Vacuum => {}
                _ => return Err(unexpected(gate, region)),
            }
        }
    }

    if ctx.comm.is_last() {
        let inv_dt = clock.inv_dt();
        match gate.circuit.inter_connect_hub() {
            Some(hub) => {
                let hub = &topo.hubs[hub];
                let dirs = Directions::new(2);
                let row = gate.circuit.residual(
                    dirs.seed(0, ve),
                    dirs.seed(1, x[hub.local_offset()?]),
                    inv_dt,
                );
                jac.add_row(bc, &[bc, hub.global_offset()?], &dirs.partials(&row))?;
            }
            None => {
                let dirs = Directions::new(1);
                let row = gate
                    .circuit
                    .residual(dirs.seed(0, ve), DualDVec64::from_re(0.0), inv_dt);
                jac.add_value(bc, bc, dirs.partials(&row)[0])?;
            }
        }
    }
    Ok(())
}

/// Accept the iteration: sum the processors' current shares and step the circuit (collective)
pub fn update_solution(gate: &mut GateContact, ctx: &SimulationContext) {
    let total = ctx.comm.sum(gate.circuit.current_itering());
    gate.circuit.set_current_itering(total);
    gate.circuit.update(ctx.clock.inv_dt());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::{self, TimeScheme};
    use crate::circuit::ExternalCircuit;
    use crate::domain::mesh::{space::Symmetry, tests::stacked_mesh};
    use crate::domain::boundary::GateParameters;
    use crate::domain::region::AdvancedModel;
    use crate::domain::tests::gate_stack;
    use crate::domain::Domain;
    use crate::linalg::{sparse_matrix::SparseMatrix, vector::Vector, InsertMode};
    use crate::parallel::{Communicator, NoComm, Partition, ThreadComm};

    use nalgebra::DMatrix;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Arc;

    const HOT: AdvancedModel = AdvancedModel {
        enable_tl: true,
        enable_tn: false,
        enable_tp: false,
    };

    fn serial(clock: Clock) -> SimulationContext {
        SimulationContext::new(clock, Arc::new(NoComm))
    }

    /// Offsets of the oxide and poly nodes at a mesh node
    fn offsets(domain: &Domain, root: usize) -> (usize, usize) {
        let at = domain.graph.nodes_at(root);
        (
            domain.graph.node(at[0]).global_offset().unwrap(),
            domain.graph.node(at[1]).global_offset().unwrap(),
        )
    }

    #[test]
    fn insulator_row_follows_the_electrode() {
        let mut domain = gate_stack(
            Partition::serial(12),
            AdvancedModel::default(),
            ExternalCircuit::voltage_driven(1.0, 0.0, 0.0),
        );
        domain.number(0).unwrap();
        let ctx = serial(Clock::steady_state());

        let mut x: Vec<f64> = (0..17).map(|i| 0.01 * i as f64).collect();
        x[16] = 1.2;

        let mut f = Vector::zeros(17);
        assembly::function(&mut domain, &x, &mut f, &ctx).unwrap();
        let mut jac = SparseMatrix::new(17);
        assembly::jacobian_reserve(&mut domain, &mut jac, &ctx).unwrap();
        assembly::jacobian(&mut domain, &x, &mut jac, &ctx).unwrap();

        let (oxide, poly) = offsets(&domain, 5);
        assert!((f[oxide] - (x[oxide] + 0.55 - 1.2)).abs() < 1e-14);
        assert!((f[poly] - (x[poly] - x[oxide])).abs() < 1e-14);

        // the cleared bulk couplings stay in the pattern as zeros
        let row: Vec<_> = jac.row(oxide).filter(|(_, v)| *v != 0.0).collect();
        assert_eq!(row, vec![(oxide, 1.0), (16, -1.0)]);
        let row: Vec<_> = jac.row(poly).filter(|(_, v)| *v != 0.0).collect();
        assert_eq!(row, vec![(oxide, -1.0), (poly, 1.0)]);
    }

    #[test]
    fn voltage_driven_electrode_equation() {
        let (r, c, dt) = (50.0, 1e-3, 1e-2);
        let circuit = ExternalCircuit::voltage_driven(r, 0.0, c)
            .with_voltage_source(crate::circuit::Waveform::constant(1.0))
            .with_potential(0.2);
        let mut domain = gate_stack(Partition::serial(12), AdvancedModel::default(), circuit);
        domain.number(0).unwrap();
        let ctx = serial(Clock::transient(dt, TimeScheme::Bdf1));

        // no field change since the last step: no displacement current
        let mut x = vec![0.0; 17];
        x[16] = 0.7;

        let mut f = Vector::zeros(17);
        assembly::function(&mut domain, &x, &mut f, &ctx).unwrap();
        let expected = (0.7 - 1.0) + r * c / dt * 0.7 - r * c / dt * 0.2;
        assert!((f[16] - expected).abs() < 1e-12);
        assert_eq!(domain.gates[0].circuit.potential_itering(), 0.7);
        assert_eq!(domain.gates[0].circuit.current_itering(), 0.0);

        let mut jac = SparseMatrix::new(17);
        assembly::jacobian(&mut domain, &x, &mut jac, &ctx).unwrap();
        assert!((jac.get(16, 16).unwrap() - (1.0 + r * c / dt)).abs() < 1e-12);
    }

    #[test]
    fn displacement_current_through_the_oxide() {
        let r = 3.0;
        let mut domain = gate_stack(
            Partition::serial(12),
            AdvancedModel::default(),
            ExternalCircuit::voltage_driven(r, 0.0, 0.0),
        );
        domain.number(0).unwrap();
        let dt = 0.5;
        let ctx = serial(Clock::transient(dt, TimeScheme::Bdf1));

        // the oxide below the gate rose by 1 V since the last step, the bottom row is unchanged
        let mut x = vec![0.0; 17];
        for root in 4..8 {
            x[offsets(&domain, root).0] = 1.0;
        }

        let mut f = Vector::zeros(17);
        assembly::function(&mut domain, &x, &mut f, &ctx).unwrap();

        // per column of the mesh: dE/dt = 1 / dt across the unit vertical edge, face 1 (0.5 at the walls)
        let eps = domain.regions[0].permittivity();
        let current = 1.5 * eps * (0.5 + 1.0 + 1.0 + 0.5) / dt;
        assert!((domain.gates[0].circuit.current_itering() - current).abs() < 1e-10);
        assert!((f[16] - (r * current + 0.0)).abs() < 1e-10);

        assembly::update_solution(&mut domain, &ctx).unwrap();
        assert!((domain.gates[0].circuit.current() - current).abs() < 1e-10);
        assert_eq!(domain.gates[0].circuit.potential(), 0.0);
    }

    #[test]
    fn heat_flows_into_the_insulator() {
        let mut domain = gate_stack(
            Partition::serial(12),
            HOT,
            ExternalCircuit::voltage_driven(1.0, 0.0, 0.0),
        );
        domain.number(0).unwrap();
        let ctx = serial(Clock::steady_state());
        let (topo, gates) = domain.split().unwrap();

        let plan = function_preprocess(&gates[0], &topo, &ctx).unwrap();
        assert_eq!(plan.moves.len(), 4);
        assert_eq!(plan.clear.len(), 12);
        for root in 4..8 {
            let at = topo.graph.nodes_at(root);
            let oxide = topo.graph.node(at[0]).global_offset().unwrap();
            let poly = topo.graph.node(at[1]).global_offset().unwrap();
            assert!(plan.moves.contains(&(poly + 1, oxide + 1)));
            assert!(plan.clear.contains(&oxide));
            assert!(plan.clear.contains(&poly) && plan.clear.contains(&(poly + 1)));
            assert!(!plan.clear.contains(&(oxide + 1)));
        }

        // the walls of the device lose heat, the interior does not
        let mut x = vec![0.0; 33];
        let (oxide4, _) = offsets(&domain, 4);
        let (oxide5, _) = offsets(&domain, 5);
        x[oxide4 + 1] = 310.0;
        x[oxide5 + 1] = 310.0;
        let (topo, gates) = domain.split().unwrap();
        let mut f = Vector::zeros(33);
        function(&mut gates[0], &topo, &x, &mut f, &ctx).unwrap();

        let surface = topo.graph.node(topo.graph.nodes_at(4)[0]).outside_boundary_surface_area;
        assert!(surface > 0.0);
        assert!((f[oxide4 + 1] - 2.0 * (300.0 - 310.0) * surface).abs() < 1e-12);
        assert_eq!(f[oxide5 + 1], 0.0);
    }

    #[test]
    fn heat_leaves_through_a_vacuum_interface() {
        let regions = vec![
            Region::new(0, "oxide", RegionKind::Insulator, HOT)
                .with_property("permittivity", 3.9)
                .with_property("thermal_conductivity", 0.014),
            Region::new(1, "air", RegionKind::Vacuum, AdvancedModel::default()),
        ];
        let mut domain = Domain::new(stacked_mesh(Symmetry::Planar), regions, Partition::serial(12)).unwrap();
        let params = GateParameters {
            work_function: 0.55,
            heat_transfer: 2.0,
            t_external: 300.0,
            z_width: 1.5,
        };
        domain
            .add_gate("gate", "interface", params, ExternalCircuit::voltage_driven(1.0, 0.0, 0.0))
            .unwrap();
        let n = domain.number(0).unwrap().n_global;
        assert_eq!(n, 17);
        let ctx = serial(Clock::steady_state());

        // node 5 is inside the device but faces the vacuum along half of edges 4-5 and 5-6
        let oxide5 = domain.graph.node(domain.graph.nodes_at(5)[0]);
        assert!(!oxide5.on_outer_boundary);
        let t5 = oxide5.global_offset().unwrap() + 1;

        let mut x = vec![0.0; n];
        x[t5] = 310.0;
        let (topo, gates) = domain.split().unwrap();

        let mut f = Vector::zeros(n);
        function(&mut gates[0], &topo, &x, &mut f, &ctx).unwrap();
        assert!((f[t5] - 2.0 * (300.0 - 310.0) * 1.0).abs() < 1e-12);

        let mut jac = SparseMatrix::new(n);
        jacobian_reserve(&gates[0], &topo, &mut jac, &ctx).unwrap();
        jac.lock_pattern();
        jacobian(&gates[0], &topo, &x, &mut jac, &ctx).unwrap();
        assert!((jac.get(t5, t5).unwrap() + 2.0).abs() < 1e-12);
    }

    #[test]
    fn second_order_displacement_current() {
        let r = 3.0;
        let mut domain = gate_stack(
            Partition::serial(12),
            AdvancedModel::default(),
            ExternalCircuit::voltage_driven(r, 0.0, 0.0),
        );
        domain.number(0).unwrap();

        // the oxide below the gate went 0.2 V, then 0.5 V, and is now iterated at 1 V
        let under_gate: Vec<usize> = (4..8).map(|root| offsets(&domain, root).0).collect();
        let oxide_at = |value: f64| {
            let mut x = vec![0.0; 17];
            for &offset in under_gate.iter() {
                x[offset] = value;
            }
            x
        };
        domain.commit_step(&oxide_at(0.2)).unwrap();
        domain.commit_step(&oxide_at(0.5)).unwrap();
        let x = oxide_at(1.0);

        let (dt_last, dt) = (0.4, 0.2);
        let mut clock = Clock::transient(dt_last, TimeScheme::Bdf2);
        clock.advance(dt);
        let ctx = serial(clock);

        let mut f = Vector::zeros(17);
        assembly::function(&mut domain, &x, &mut f, &ctx).unwrap();

        // variable step BDF2 with w = dt / dt_last
        let w = dt / dt_last;
        let rate = ((1.0 + 2.0 * w) / (1.0 + w) * 1.0 - (1.0 + w) * 0.5 + w * w / (1.0 + w) * 0.2) / dt;
        assert!((rate - 1.85 / 0.6).abs() < 1e-12);

        let eps = domain.regions[0].permittivity();
        let current = 1.5 * eps * (0.5 + 1.0 + 1.0 + 0.5) * rate;
        assert!((domain.gates[0].circuit.current_itering() - current).abs() < 1e-10);
        assert!((f[16] - r * current).abs() < 1e-9);

        // the first step of a BDF2 run falls back to BDF1
        let ctx = serial(Clock::transient(dt, TimeScheme::Bdf2));
        let mut f = Vector::zeros(17);
        assembly::function(&mut domain, &x, &mut f, &ctx).unwrap();
        let current = 1.5 * eps * 3.0 * (1.0 - 0.5) / dt;
        assert!((domain.gates[0].circuit.current_itering() - current).abs() < 1e-10);
    }

    #[test]
    fn initial_values_are_inserted() {
        let circuit = ExternalCircuit::voltage_driven(3.0, 0.0, 0.0).with_potential(0.4);
        let mut domain = gate_stack(Partition::serial(12), AdvancedModel::default(), circuit);
        domain.number(0).unwrap();
        let ctx = serial(Clock::steady_state());

        let mut x = Vector::zeros(17);
        let mut scaling = Vector::from_values(vec![1.0; 17]);
        assembly::fill_value(&mut domain, &mut x, &mut scaling, &ctx).unwrap();

        assert_eq!(x[16], 0.4);
        assert!((scaling[16] - 1.0 / (4.0 * 1.5)).abs() < 1e-15);
        assert_eq!(x.mode(), InsertMode::Insert);

        // adding to a vector holding inserted values needs an assembly first
        assert!(matches!(
            x.add_value(16, 1.0),
            Err(Error::ModeConflict { .. })
        ));
        // the assembly routines flush on their own
        let mut f = scaling;
        assembly::function(&mut domain, x.values(), &mut f, &ctx).unwrap();
    }

    #[test]
    fn gate_over_a_semiconductor_is_rejected() {
        let regions = vec![
            Region::new(0, "oxide", RegionKind::Insulator, AdvancedModel::default()),
            Region::new(1, "si", RegionKind::Semiconductor, AdvancedModel::default()),
        ];
        let mut domain = Domain::new(stacked_mesh(Symmetry::Planar), regions, Partition::serial(12)).unwrap();
        domain
            .add_gate(
                "gate",
                "interface",
                GateParameters::default(),
                ExternalCircuit::voltage_driven(0.0, 0.0, 0.0),
            )
            .unwrap();
        domain.number(0).unwrap();
        let ctx = serial(Clock::steady_state());
        let (topo, gates) = domain.split().unwrap();

        let x = vec![0.0; domain_dimension(&topo)];
        let mut f = Vector::zeros(x.len());
        assert!(matches!(
            function(&mut gates[0], &topo, &x, &mut f, &ctx),
            Err(Error::UnexpectedRegion { .. })
        ));
        let mut jac = SparseMatrix::new(x.len());
        assert!(matches!(
            jacobian_reserve(&gates[0], &topo, &mut jac, &ctx),
            Err(Error::UnexpectedRegion { .. })
        ));
    }

    fn domain_dimension(topo: &Topology) -> usize {
        topo.dofs.n_global
    }

    /// Every written entry was reserved, for every circuit and model combination
    #[test]
    fn reserved_pattern_covers_the_jacobian() {
        let circuits = [
            ExternalCircuit::voltage_driven(2.0, 1e-2, 0.5),
            ExternalCircuit::current_driven(0.5),
            ExternalCircuit::inter_connect(0, 4.0),
        ];
        let clocks = [
            Clock::steady_state(),
            Clock::transient(0.1, TimeScheme::Bdf1),
        ];

        for advanced in [AdvancedModel::default(), HOT] {
            for circuit in circuits.iter() {
                for clock in clocks.iter() {
                    let mut domain = gate_stack(Partition::serial(12), advanced, circuit.clone());
                    let n = domain.number(0).unwrap().n_global;
                    let ctx = serial(*clock);
                    let x: Vec<f64> = (0..n).map(|i| 0.1 * i as f64).collect();

                    let mut jac = SparseMatrix::new(n);
                    assembly::jacobian_reserve(&mut domain, &mut jac, &ctx).unwrap();
                    jac.lock_pattern();
                    assembly::jacobian(&mut domain, &x, &mut jac, &ctx).unwrap();

                    let mut f = Vector::zeros(n);
                    assembly::function(&mut domain, &x, &mut f, &ctx).unwrap();
                }
            }
        }
    }

    /// The Jacobian is the derivative of the residual (BDF2 with history, lattice temperature)
    #[test]
    fn jacobian_matches_finite_differences() {
        let circuit = ExternalCircuit::voltage_driven(2.0, 1e-2, 0.5).with_potential(0.1);
        let mut domain = gate_stack(Partition::serial(12), HOT, circuit);
        let n = domain.number(0).unwrap().n_global;

        let history = |scale: f64| -> Vec<f64> {
            (0..n).map(|i| scale * ((i * 7) % 5) as f64).collect()
        };
        domain.commit_step(&history(0.1)).unwrap();
        domain.commit_step(&history(0.3)).unwrap();

        let mut clock = Clock::transient(0.1, TimeScheme::Bdf2);
        clock.advance(0.05);
        let ctx = serial(clock);

        let x: Vec<f64> = (0..n)
            .map(|i| 0.2 * ((i * 3) % 7) as f64 + if i % 2 == 1 { 300.0 } else { 0.0 })
            .collect();

        let residual = |domain: &mut Domain, x: &[f64]| -> Vec<f64> {
            let mut f = Vector::zeros(n);
            assembly::function(domain, x, &mut f, &ctx).unwrap();
            f.into_values()
        };

        let mut jac = SparseMatrix::new(n);
        assembly::jacobian_reserve(&mut domain, &mut jac, &ctx).unwrap();
        jac.lock_pattern();
        assembly::jacobian(&mut domain, &x, &mut jac, &ctx).unwrap();
        let jac = DMatrix::from(&jac);

        let f0 = residual(&mut domain, &x);
        let h = 1e-6;
        for j in 0..n {
            let mut xh = x.clone();
            xh[j] += h;
            let fh = residual(&mut domain, &xh);
            for i in 0..n {
                let fd = (fh[i] - f0[i]) / h;
                let tol = 1e-4 * (1.0 + jac[(i, j)].abs());
                assert!(
                    (fd - jac[(i, j)]).abs() < tol,
                    "d f[{}] / d x[{}]: {} (finite difference) vs {}",
                    i,
                    j,
                    fd,
                    jac[(i, j)]
                );
            }
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
    enum Unknown {
        Node(NodeId, usize),
        Gate,
        Hub,
    }

    /// Unknowns by global offset
    fn unknowns(domain: &Domain) -> BTreeMap<usize, Unknown> {
        let mut map = BTreeMap::new();
        for node in domain.graph.nodes() {
            let first = node.global_offset().unwrap();
            for v in 0..domain.regions[node.region].n_variables() {
                map.insert(first + v, Unknown::Node(node.id, v));
            }
        }
        map.insert(domain.gates[0].global_offset().unwrap(), Unknown::Gate);
        if let Some(hub) = domain.hubs.first() {
            map.insert(hub.global_offset().unwrap(), Unknown::Hub);
        }
        map
    }

    fn iterate(domain: &Domain, unknown: Unknown) -> f64 {
        match unknown {
            Unknown::Node(id, 0) => {
                let node = domain.graph.node(id);
                0.1 * node.root as f64 + 0.03 * node.region as f64
            }
            Unknown::Node(id, _) => 300.0 + domain.graph.node(id).root as f64,
            Unknown::Gate => 0.35,
            Unknown::Hub => -0.1,
        }
    }

    struct Assembled {
        f: BTreeMap<Unknown, f64>,
        jac: BTreeMap<(Unknown, Unknown), f64>,
        reserved: BTreeSet<(Unknown, Unknown)>,
        current: f64,
    }

    /// Assemble one processor's share, keyed by unknown rather than by offset
    fn assemble_share(mut domain: Domain, comm: Arc<dyn Communicator>) -> Assembled {
        let ctx = SimulationContext::new(Clock::transient(0.2, TimeScheme::Bdf1), comm);
        let n = domain.number(ctx.comm.rank()).unwrap().n_global;
        let keys = unknowns(&domain);

        let global: Vec<f64> = (0..n).map(|g| iterate(&domain, keys[&g])).collect();
        let x = domain.dofs().unwrap().scatter_to_local(&global).unwrap();

        let mut f = Vector::zeros(n);
        assembly::function(&mut domain, &x, &mut f, &ctx).unwrap();

        let mut jac = SparseMatrix::new(n);
        assembly::jacobian_reserve(&mut domain, &mut jac, &ctx).unwrap();
        let reserved = jac
            .pattern()
            .into_iter()
            .map(|[r, c]| (keys[&r], keys[&c]))
            .collect();
        assembly::jacobian(&mut domain, &x, &mut jac, &ctx).unwrap();

        assembly::update_solution(&mut domain, &ctx).unwrap();

        Assembled {
            f: f
                .values()
                .iter()
                .enumerate()
                .map(|(g, v)| (keys[&g], *v))
                .collect(),
            jac: jac.iter().map(|([r, c], v)| ((keys[&r], keys[&c]), v)).collect(),
            reserved,
            current: domain.gates[0].circuit.current(),
        }
    }

    fn merge(shares: Vec<Assembled>) -> Assembled {
        let mut merged = Assembled {
            f: BTreeMap::new(),
            jac: BTreeMap::new(),
            reserved: BTreeSet::new(),
            current: shares[0].current,
        };
        for share in shares {
            for (k, v) in share.f {
                *merged.f.entry(k).or_insert(0.0) += v;
            }
            for (k, v) in share.jac {
                *merged.jac.entry(k).or_insert(0.0) += v;
            }
            merged.reserved.extend(share.reserved);
            assert_eq!(share.current, merged.current);
        }
        merged
    }

    #[test]
    fn distributed_assembly_matches_serial() {
        let circuits = [
            ExternalCircuit::voltage_driven(2.0, 1e-2, 0.5),
            ExternalCircuit::inter_connect(0, 4.0),
        ];

        for circuit in circuits {
            let serial = assemble_share(
                gate_stack(Partition::serial(12), HOT, circuit.clone()),
                Arc::new(NoComm),
            );

            let shares = std::thread::scope(|s| {
                let handles: Vec<_> = ThreadComm::group(2)
                    .into_iter()
                    .map(|comm| {
                        let domain = gate_stack(Partition::blocks(12, 2), HOT, circuit.clone());
                        s.spawn(move || assemble_share(domain, Arc::new(comm)))
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|h| h.join().unwrap())
                    .collect::<Vec<_>>()
            });
            let distributed = merge(shares);

            assert!(serial.current != 0.0);
            assert!((serial.current - distributed.current).abs() < 1e-10 * serial.current.abs());

            for (k, v) in serial.f.iter() {
                assert!((v - distributed.f[k]).abs() < 1e-9, "residual of {:?}", k);
            }
            let entries: BTreeSet<_> = serial.jac.keys().chain(distributed.jac.keys()).collect();
            for k in entries {
                let a = serial.jac.get(k).copied().unwrap_or(0.0);
                let b = distributed.jac.get(k).copied().unwrap_or(0.0);
                assert!((a - b).abs() < 1e-9, "jacobian entry {:?}: {} vs {}", k, a, b);
            }

            // the union of the reservations covers every entry any processor wrote
            for (k, v) in distributed.jac.iter() {
                assert!(*v == 0.0 || distributed.reserved.contains(k), "{:?} not reserved", k);
            }
            assert_eq!(serial.reserved, distributed.reserved);
        }
    }
}
