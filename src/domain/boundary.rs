use super::node_graph::{FvmGraph, NodeId};
use super::region::{Region, RegionKind};
use crate::circuit::ExternalCircuit;
use crate::error::{Error, Result};

use smallvec::SmallVec;

/// A mesh node of a boundary with the FvmNodes sitting on it
///
/// `fvm_nodes` is sorted by [`RegionKind::reference_priority`] (then region id), so index 0 is the
/// reference region of the node.
#[derive(Clone, Debug)]
pub struct BoundaryNode {
    pub root: usize,
    pub owner: usize,
    pub fvm_nodes: SmallVec<[NodeId; 3]>,
}

/// Physical parameters of a gate contact
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GateParameters {
    /// Work function of the gate material
    pub work_function: f64,
    /// Heat transfer coefficient to the environment
    pub heat_transfer: f64,
    /// Temperature of the environment
    pub t_external: f64,
    /// Device depth of a 2D cross section (1 for a revolved device)
    pub z_width: f64,
}

impl Default for GateParameters {
    fn default() -> Self {
        Self {
            work_function: 0.0,
            heat_transfer: 0.0,
            t_external: 300.0,
            z_width: 1.0,
        }
    }
}

/// A gate electrode in contact with an insulator
///
/// ```text
///       electrode  (potential and temperature follow the insulator)
///   ==o=====o=====o==   <- gate nodes: one FvmNode per region
///       insulator  (psi + work_function = Ve)
/// ```
///
/// The gate owns one extra unknown, the electrode potential `Ve`, whose equation couples the
/// displacement current through the insulator to an [`ExternalCircuit`].
#[derive(Clone, Debug)]
pub struct GateContact {
    pub name: String,
    pub nodes: Vec<BoundaryNode>,
    pub params: GateParameters,
    pub circuit: ExternalCircuit,
    global_offset: Option<usize>,
    local_offset: Option<usize>,
}

impl GateContact {
    /// Collect the FvmNodes at each of the `roots` and check that every node can reference an insulator
    pub fn new(
        name: impl Into<String>,
        roots: &[usize],
        graph: &FvmGraph,
        regions: &[Region],
        params: GateParameters,
        circuit: ExternalCircuit,
    ) -> Result<Self> {
        let name = name.into();
        let mut nodes = Vec::with_capacity(roots.len());

        for &root in roots {
            let mut fvm_nodes: SmallVec<[NodeId; 3]> = graph.nodes_at(root).iter().copied().collect();
            fvm_nodes.sort_by_key(|id| {
                let region = &regions[graph.node(*id).region];
                (region.kind().reference_priority(), region.id)
            });

            let insulators = fvm_nodes
                .iter()
                .filter(|id| regions[graph.node(**id).region].kind() == RegionKind::Insulator)
                .count();
            match insulators {
                0 => {
                    return Err(Error::MissingReferenceRegion {
                        boundary: name,
                        node: root,
                    })
                }
                1 => {}
                n => {
                    return Err(Error::Config(format!(
                        "gate '{}' node {} touches {} insulator regions",
                        name, root, n
                    )))
                }
            }

            let owner = graph.node(fvm_nodes[0]).owner;
            nodes.push(BoundaryNode {
                root,
                owner,
                fvm_nodes,
            });
        }

        if nodes.is_empty() {
            log::warn!("gate '{}' has no nodes", name);
        }

        Ok(Self {
            name,
            nodes,
            params,
            circuit,
            global_offset: None,
            local_offset: None,
        })
    }

    /// Global offset of the electrode potential unknown
    pub fn global_offset(&self) -> Result<usize> {
        self.global_offset
            .ok_or_else(|| Error::UnassignedOffset(format!("global offset of gate '{}'", self.name)))
    }

    pub fn local_offset(&self) -> Result<usize> {
        self.local_offset
            .ok_or_else(|| Error::UnassignedOffset(format!("local offset of gate '{}'", self.name)))
    }

    pub(crate) fn set_offsets(&mut self, global: Option<usize>, local: Option<usize>) {
        self.global_offset = global;
        self.local_offset = local;
    }

    pub fn is_inter_connect(&self) -> bool {
        self.circuit.inter_connect_hub().is_some()
    }

    /// Gate nodes owned by a processor
    pub fn local_nodes(&self, rank: usize) -> impl Iterator<Item = &BoundaryNode> + '_ {
        self.nodes.iter().filter(move |n| n.owner == rank)
    }
}

/// A node of the external circuit joining several inter-connected electrodes
///
/// The hub's potential is an unknown of the system; the equation for it (Kirchhoff's current law
/// over the attached electrodes) is assembled by the outer driver.
#[derive(Clone, Debug)]
pub struct InterConnectHub {
    pub name: String,
    global_offset: Option<usize>,
    local_offset: Option<usize>,
}

impl InterConnectHub {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            global_offset: None,
            local_offset: None,
        }
    }

    pub fn global_offset(&self) -> Result<usize> {
        self.global_offset
            .ok_or_else(|| Error::UnassignedOffset(format!("global offset of hub '{}'", self.name)))
    }

    pub fn local_offset(&self) -> Result<usize> {
        self.local_offset
            .ok_or_else(|| Error::UnassignedOffset(format!("local offset of hub '{}'", self.name)))
    }

    pub(crate) fn set_offsets(&mut self, global: Option<usize>, local: Option<usize>) {
        self.global_offset = global;
        self.local_offset = local;
    }
}
