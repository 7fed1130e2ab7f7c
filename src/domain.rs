/// Boundary conditions (gate contacts) and inter-connect hubs
pub mod boundary;
/// The internal geometric structure of a Domain
pub mod mesh;
/// Per-region node instances, their adjacency and unknown offsets
pub mod node_graph;
/// Material regions and the variables they solve for
pub mod region;

use crate::circuit::{CircuitMode, ExternalCircuit};
use crate::config::{CircuitModeConfig, SimulationConfig};
use crate::error::{Error, Result};
use crate::parallel::Partition;
use boundary::{GateContact, GateParameters, InterConnectHub};
use mesh::{control_volume::ControlVolume, Mesh};
use node_graph::{DofMap, FvmGraph};
use region::{Region, Variable};

use std::collections::BTreeSet;

/// Read-only view of a numbered Domain, handed to the assembly routines next to the mutable gates
#[derive(Clone, Copy)]
pub struct Topology<'a> {
    pub graph: &'a FvmGraph,
    pub regions: &'a [Region],
    pub hubs: &'a [InterConnectHub],
    pub dofs: &'a DofMap,
}

/// High Level Description of a device: mesh, regions, node graph and boundary conditions
pub struct Domain {
    pub mesh: Mesh,
    pub regions: Vec<Region>,
    /// Control volume of each mesh element
    pub control_volumes: Vec<ControlVolume>,
    pub graph: FvmGraph,
    pub gates: Vec<GateContact>,
    pub hubs: Vec<InterConnectHub>,
    partition: Partition,
    dofs: Option<DofMap>,
}

impl Domain {
    /// Build the control volumes and the node graph of a mesh
    pub fn new(mesh: Mesh, regions: Vec<Region>, partition: Partition) -> Result<Self> {
        let control_volumes = mesh.control_volumes()?;
        let truncated = control_volumes
            .iter()
            .filter(|cv| cv.obtuse_edge.is_some())
            .count();
        log::debug!(
            "{} of {} elements have truncated control volumes",
            truncated,
            control_volumes.len()
        );

        let graph = FvmGraph::build(&mesh, &regions, &control_volumes, &partition)?;

        Ok(Self {
            mesh,
            regions,
            control_volumes,
            graph,
            gates: Vec::new(),
            hubs: Vec::new(),
            partition,
            dofs: None,
        })
    }

    /// Build a Domain from a mesh and a device description
    pub fn from_config(mesh: Mesh, config: &SimulationConfig, partition: Partition) -> Result<Self> {
        let mut domain = Self::new(mesh, config.build_regions(), partition)?;

        for hub in config.hubs.iter() {
            domain.add_hub(hub.clone());
        }

        for gate in config.gates.iter() {
            let cc = &gate.circuit;
            let circuit = match &cc.mode {
                CircuitModeConfig::Voltage => ExternalCircuit::voltage_driven(cc.r, cc.l, cc.c)
                    .with_voltage_source(cc.source.clone()),
                CircuitModeConfig::Current => ExternalCircuit::new(CircuitMode::CurrentDriven, cc.r, cc.l, cc.c)
                    .with_current_source(cc.source.clone()),
                CircuitModeConfig::InterConnect { hub } => {
                    let index = domain
                        .hubs
                        .iter()
                        .position(|h| &h.name == hub)
                        .ok_or_else(|| Error::Config(format!("unknown hub '{}'", hub)))?;
                    ExternalCircuit::inter_connect(index, cc.r)
                }
            };
            domain.add_gate(gate.name.clone(), &gate.label, gate.params, circuit)?;
        }

        Ok(domain)
    }

    /// Attach a gate contact to the nodes carrying `label`
    pub fn add_gate(
        &mut self,
        name: impl Into<String>,
        label: &str,
        params: GateParameters,
        circuit: ExternalCircuit,
    ) -> Result<usize> {
        let roots = self
            .mesh
            .labeled_nodes(label)
            .ok_or_else(|| Error::Config(format!("the mesh has no nodes labeled '{}'", label)))?;

        if let Some(hub) = circuit.inter_connect_hub() {
            if hub >= self.hubs.len() {
                return Err(Error::Config(format!("gate references missing hub {}", hub)));
            }
        }

        let gate = GateContact::new(name, roots, &self.graph, &self.regions, params, circuit)?;
        self.gates.push(gate);
        self.dofs = None;
        Ok(self.gates.len() - 1)
    }

    pub fn add_hub(&mut self, name: impl Into<String>) -> usize {
        self.hubs.push(InterConnectHub::new(name));
        self.dofs = None;
        self.hubs.len() - 1
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Assign the global and local offsets of every unknown as seen from processor `rank`
    ///
    /// Global offsets run processor by processor, then region by region, then node by node in
    /// ascending mesh order. Gate and hub unknowns close the last processor's block. Every
    /// processor computes the same global numbering.
    pub fn number(&mut self, rank: usize) -> Result<&DofMap> {
        let n_processors = self.partition.n_processors();
        assert!(rank < n_processors, "Rank exceeds the size of the partition!");

        let mut next = 0;
        let mut owned = 0..0;

        for p in 0..n_processors {
            let start = next;
            for (r, region) in self.regions.iter().enumerate() {
                let n_vars = region.n_variables();
                for id in self.graph.region_nodes(r).to_vec() {
                    if self.graph.node(id).owner == p {
                        self.graph.set_offsets(id, Some(next), None);
                        next += n_vars;
                    }
                }
            }

            if p + 1 == n_processors {
                for gate in self.gates.iter_mut() {
                    gate.set_offsets(Some(next), None);
                    next += 1;
                }
                for hub in self.hubs.iter_mut() {
                    hub.set_offsets(Some(next), None);
                    next += 1;
                }
            }

            if p == rank {
                owned = start..next;
            }
        }

        // unknowns of off-processor neighbours and the extra unknowns of the last processor
        let mut ghosts = BTreeSet::new();
        for node in self.graph.nodes().filter(|n| n.owner == rank) {
            for id in node.neighbors.iter().map(|nb| nb.node).chain(node.ghosts.iter().copied()) {
                let other = self.graph.node(id);
                if other.owner != rank {
                    let first = other.global_offset()?;
                    let n_vars = self.regions[other.region].n_variables();
                    ghosts.extend(first..first + n_vars);
                }
            }
        }
        for gate in self.gates.iter() {
            ghosts.insert(gate.global_offset()?);
        }
        for hub in self.hubs.iter() {
            ghosts.insert(hub.global_offset()?);
        }
        let ghosts: Vec<usize> = ghosts.into_iter().filter(|g| !owned.contains(g)).collect();

        let dofs = DofMap {
            rank,
            owned_start: owned.start,
            n_owned: owned.len(),
            n_global: next,
            ghosts,
        };

        for id in 0..self.graph.len() {
            let node = self.graph.node(id);
            let global = node.global_offset()?;
            let local = if node.owner == rank {
                Some(global - dofs.owned_start)
            } else if self.regions[node.region].n_variables() > 0 {
                dofs.local(global)
            } else {
                None
            };
            self.graph.set_local_offset(id, local);
        }
        for gate in self.gates.iter_mut() {
            let global = gate.global_offset()?;
            gate.set_offsets(Some(global), dofs.local(global));
        }
        for hub in self.hubs.iter_mut() {
            let global = hub.global_offset()?;
            hub.set_offsets(Some(global), dofs.local(global));
        }

        log::info!(
            "processor {} of {}: {} unknowns in total, {} owned, {} ghosts",
            rank,
            n_processors,
            dofs.n_global,
            dofs.n_owned,
            dofs.ghosts.len()
        );

        Ok(&*self.dofs.insert(dofs))
    }

    /// The numbering computed by [`number`](Domain::number)
    pub fn dofs(&self) -> Result<&DofMap> {
        self.dofs
            .as_ref()
            .ok_or_else(|| Error::UnassignedOffset("the domain's numbering".into()))
    }

    /// Split into a read-only [`Topology`] and the mutable gate contacts
    pub fn split(&mut self) -> Result<(Topology<'_>, &mut [GateContact])> {
        let dofs = self
            .dofs
            .as_ref()
            .ok_or_else(|| Error::UnassignedOffset("the domain's numbering".into()))?;

        Ok((
            Topology {
                graph: &self.graph,
                regions: &self.regions,
                hubs: &self.hubs,
                dofs,
            },
            &mut self.gates,
        ))
    }

    /// Shift the cached potentials after a timestep was accepted
    ///
    /// `x` is the processor-local solution; nodes invisible to this processor are skipped.
    pub fn commit_step(&mut self, x: &[f64]) -> Result<()> {
        for id in 0..self.graph.len() {
            let node = self.graph.node(id);
            let region = &self.regions[node.region];
            let local = match node.local_offset() {
                Ok(local) if region.n_variables() > 0 => local,
                _ => continue,
            };

            let psi = region
                .variable_offset(Variable::Potential)
                .ok()
                .map(|offset| x[local + offset]);

            if let Some(psi) = psi {
                let data = &mut self.graph.node_mut(id).data;
                data.psi_last = data.psi;
                data.psi = psi;
            }
        }
        Ok(())
    }
}
