use super::mesh::{control_volume::ControlVolume, Mesh};
use super::region::{Region, RegionKind};
use crate::error::{Error, Result};
use crate::parallel::Partition;

use smallvec::SmallVec;
use std::collections::BTreeMap;

/// Index of an [`FvmNode`] in the [`FvmGraph`] arena
pub type NodeId = usize;

/// A same-region neighbour joined to a node by a mesh edge
#[derive(Clone, Copy, Debug)]
pub struct Neighbor {
    pub node: NodeId,
    /// Area of the dual face crossed by the flux between the two nodes
    pub cv_surface_area: f64,
    /// Length of the mesh edge
    pub distance: f64,
}

/// Solution dependent data cached on a node between timesteps
#[derive(Clone, Copy, Debug, Default)]
pub struct NodeData {
    /// Potential at the last accepted timestep
    pub psi: f64,
    /// Potential one timestep before `psi`
    pub psi_last: f64,
    /// Permittivity of the node's region
    pub eps: f64,
}

/// The instance of a mesh node inside one region
///
/// A mesh node shared by `k` regions has `k` FvmNodes; the others are listed in `ghosts`.
#[derive(Clone, Debug)]
pub struct FvmNode {
    pub id: NodeId,
    /// Mesh node this FvmNode sits on
    pub root: usize,
    pub region: usize,
    /// Processor owning the root node
    pub owner: usize,
    global_offset: Option<usize>,
    local_offset: Option<usize>,
    /// Control volume accumulated from the region's elements
    pub volume: f64,
    /// Surface of the control volume on the outer boundary of the device
    pub outside_boundary_surface_area: f64,
    pub on_outer_boundary: bool,
    /// Same-region neighbours in ascending root order
    pub neighbors: SmallVec<[Neighbor; 8]>,
    /// FvmNodes of other regions sharing the root, in ascending region order
    pub ghosts: SmallVec<[NodeId; 2]>,
    pub data: NodeData,
}

impl FvmNode {
    /// Global offset of the first unknown of this node
    pub fn global_offset(&self) -> Result<usize> {
        self.global_offset.ok_or_else(|| {
            Error::UnassignedOffset(format!(
                "global offset of node {} in region {}",
                self.root, self.region
            ))
        })
    }

    /// Processor-local offset of the first unknown of this node
    pub fn local_offset(&self) -> Result<usize> {
        self.local_offset.ok_or_else(|| {
            Error::UnassignedOffset(format!(
                "local offset of node {} in region {}",
                self.root, self.region
            ))
        })
    }

    pub fn on_processor(&self, rank: usize) -> bool {
        self.owner == rank
    }

    /// Flux area shared with a neighbour (0 if the nodes are not neighbours)
    pub fn cv_surface_area(&self, neighbor: NodeId) -> f64 {
        self.neighbors
            .iter()
            .find(|nb| nb.node == neighbor)
            .map_or(0.0, |nb| nb.cv_surface_area)
    }
}

/// The arena of every [`FvmNode`] in the device
///
/// Lookups by mesh node (`nodes_at`) always iterate in ascending region order, so every
/// processor visits the same FvmNodes in the same order.
#[derive(Clone, Debug)]
pub struct FvmGraph {
    nodes: Vec<FvmNode>,
    by_root: Vec<SmallVec<[NodeId; 2]>>,
    by_region: Vec<Vec<NodeId>>,
}

impl FvmGraph {
    /// Build the graph from a mesh, its regions and its control volumes
    ///
    /// `control_volumes[e]` must belong to `mesh.elements[e]`.
    pub fn build(
        mesh: &Mesh,
        regions: &[Region],
        control_volumes: &[ControlVolume],
        partition: &Partition,
    ) -> Result<Self> {
        if partition.num_nodes() != mesh.num_nodes() {
            return Err(Error::Mesh(format!(
                "partition covers {} nodes but the mesh has {}",
                partition.num_nodes(),
                mesh.num_nodes()
            )));
        }
        if let Some(elem) = mesh.elements.iter().find(|e| e.region >= regions.len()) {
            return Err(Error::Mesh(format!(
                "element {} references region {} but only {} regions exist",
                elem.id,
                elem.region,
                regions.len()
            )));
        }

        // mesh node => region => node id; BTreeMaps fix the iteration order
        let mut lookup: Vec<BTreeMap<usize, NodeId>> = vec![BTreeMap::new(); mesh.num_nodes()];
        let mut nodes: Vec<FvmNode> = Vec::new();
        let on_boundary = mesh.outer_boundary_nodes();

        for elem in mesh.elements.iter() {
            for &root in elem.nodes.iter() {
                lookup[root].entry(elem.region).or_insert(usize::MAX);
            }
        }

        let mut by_region = vec![Vec::new(); regions.len()];
        for (root, regions_here) in lookup.iter_mut().enumerate() {
            for (&region, id) in regions_here.iter_mut() {
                *id = nodes.len();
                by_region[region].push(nodes.len());
                nodes.push(FvmNode {
                    id: nodes.len(),
                    root,
                    region,
                    owner: partition.owner(root),
                    global_offset: None,
                    local_offset: None,
                    volume: 0.0,
                    outside_boundary_surface_area: 0.0,
                    on_outer_boundary: on_boundary[root],
                    neighbors: SmallVec::new(),
                    ghosts: SmallVec::new(),
                    data: NodeData {
                        eps: regions[region].permittivity(),
                        ..Default::default()
                    },
                });
            }
        }

        // neighbours: {(node, neighbour) => (face area, distance)}
        let mut faces: BTreeMap<(NodeId, NodeId), (f64, f64)> = BTreeMap::new();
        for (elem, cv) in mesh.elements.iter().zip(control_volumes) {
            assert_eq!(elem.id, cv.elem_id, "Control volumes are out of order!");
            let ids = elem.nodes.map(|root| lookup[root][&elem.region]);

            for (local, id) in ids.iter().enumerate() {
                nodes[*id].volume += cv.partial_volumes[local];
            }

            for e in 0..3 {
                let [a, b] = cv.edge_nodes(e);
                for (from, to) in [(ids[a], ids[b]), (ids[b], ids[a])] {
                    let face = faces.entry((from, to)).or_insert((0.0, cv.edge_lengths[e]));
                    face.0 += cv.flux_weights[e];
                }
            }
        }

        for ((from, to), (cv_surface_area, distance)) in faces {
            nodes[from].neighbors.push(Neighbor {
                node: to,
                cv_surface_area,
                distance,
            });
        }
        for node in nodes.iter_mut() {
            node.neighbors.sort_by_key(|nb| nb.node);
        }

        // half of each outer edge belongs to each of its nodes
        for ([a, b], elem_id) in mesh.outer_edges() {
            let region = mesh.elements[elem_id].region;
            let center = mesh.points[a].midpoint(&mesh.points[b]);
            for root in [a, b] {
                let surface = mesh.symmetry.segment_surface(mesh.points[root], center);
                nodes[lookup[root][&region]].outside_boundary_surface_area += surface;
            }
        }

        // an edge against Vacuum is outer surface of the regions on its other side
        let is_vacuum = |elem: usize| regions[mesh.elements[elem].region].kind() == RegionKind::Vacuum;
        for ([a, b], elems) in mesh.edges() {
            if !elems.iter().any(|&elem| is_vacuum(elem)) {
                continue;
            }
            let center = mesh.points[a].midpoint(&mesh.points[b]);
            let mut facing: SmallVec<[usize; 2]> = elems
                .iter()
                .filter(|&&elem| !is_vacuum(elem))
                .map(|&elem| mesh.elements[elem].region)
                .collect();
            facing.sort_unstable();
            facing.dedup();

            for region in facing {
                for root in [a, b] {
                    let surface = mesh.symmetry.segment_surface(mesh.points[root], center);
                    nodes[lookup[root][&region]].outside_boundary_surface_area += surface;
                }
            }
        }

        let by_root: Vec<SmallVec<[NodeId; 2]>> = lookup
            .iter()
            .map(|regions_here| regions_here.values().copied().collect())
            .collect();

        for ids in by_root.iter() {
            for &id in ids.iter() {
                nodes[id].ghosts = ids.iter().copied().filter(|other| *other != id).collect();
            }
        }

        for (region, ids) in by_region.iter().enumerate() {
            if ids.is_empty() {
                log::warn!("region '{}' has no elements", regions[region].name);
            }
        }

        log::info!(
            "built node graph: {} nodes over {} mesh nodes and {} regions",
            nodes.len(),
            mesh.num_nodes(),
            regions.len()
        );

        Ok(Self {
            nodes,
            by_root,
            by_region,
        })
    }

    pub fn node(&self, id: NodeId) -> &FvmNode {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut FvmNode {
        &mut self.nodes[id]
    }

    pub fn nodes(&self) -> impl Iterator<Item = &FvmNode> + '_ {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// FvmNodes sitting on a mesh node, in ascending region order
    pub fn nodes_at(&self, root: usize) -> &[NodeId] {
        &self.by_root[root]
    }

    /// FvmNodes of a region, in ascending root order
    pub fn region_nodes(&self, region: usize) -> &[NodeId] {
        &self.by_region[region]
    }

    /// Is any region of the given kind present at a mesh node
    pub fn has_region_kind(&self, root: usize, kind: RegionKind, regions: &[Region]) -> bool {
        self.nodes_at(root)
            .iter()
            .any(|id| regions[self.nodes[*id].region].kind() == kind)
    }

    /// Assign offsets; `None` clears them
    pub(crate) fn set_offsets(&mut self, id: NodeId, global: Option<usize>, local: Option<usize>) {
        self.nodes[id].global_offset = global;
        self.nodes[id].local_offset = local;
    }

    pub(crate) fn set_local_offset(&mut self, id: NodeId, local: Option<usize>) {
        self.nodes[id].local_offset = local;
    }
}

/// Map between global unknown offsets and the offsets of one processor's local vector
///
/// Local vectors hold the processor's own block of unknowns first, followed by ghost unknowns in
/// ascending global order:
///
/// ```text
///  global:  | p0 ......... | p1 ......... | p2 ....... gates hubs |
///  local(p1):              | p1 ......... | ghosts  |
/// ```
#[derive(Clone, Debug)]
pub struct DofMap {
    pub rank: usize,
    /// First global offset owned by this processor
    pub owned_start: usize,
    /// Number of unknowns owned by this processor
    pub n_owned: usize,
    /// Total number of unknowns over all processors
    pub n_global: usize,
    /// Global offsets of the ghost unknowns, ascending
    pub ghosts: Vec<usize>,
}

impl DofMap {
    pub fn n_local(&self) -> usize {
        self.n_owned + self.ghosts.len()
    }

    pub fn owns(&self, global: usize) -> bool {
        global >= self.owned_start && global < self.owned_start + self.n_owned
    }

    /// Local offset of a global unknown (`None` if this processor never sees it)
    pub fn local(&self, global: usize) -> Option<usize> {
        if self.owns(global) {
            Some(global - self.owned_start)
        } else {
            self.ghosts
                .binary_search(&global)
                .ok()
                .map(|g| self.n_owned + g)
        }
    }

    /// Gather the entries of a global vector into this processor's local layout
    pub fn scatter_to_local(&self, global: &[f64]) -> Result<Vec<f64>> {
        if global.len() != self.n_global {
            return Err(Error::OutOfBounds {
                index: global.len(),
                dimension: self.n_global,
            });
        }

        let mut local = Vec::with_capacity(self.n_local());
        local.extend_from_slice(&global[self.owned_start..self.owned_start + self.n_owned]);
        local.extend(self.ghosts.iter().map(|g| global[*g]));
        Ok(local)
    }
}
