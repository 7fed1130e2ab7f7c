/// Dual-mesh metrics (partial volumes, flux weights, vector reconstruction) of a triangle
pub mod control_volume;
/// Points, triangle helpers and the planar/cylindrical sweep
pub mod space;

use crate::error::{Error, Result};
use control_volume::ControlVolume;
use space::{Point, Symmetry};

use rayon::prelude::*;
use std::collections::BTreeMap;

/// Local node pairs of the three edges of a triangle
pub const EDGE_NODES: [[usize; 2]; 3] = [[0, 1], [1, 2], [2, 0]];

/// A triangle of the Mesh, tagged with the region it belongs to
#[derive(Clone, Debug)]
pub struct Element {
    pub id: usize,
    pub nodes: [usize; 3],
    pub region: usize,
}

/// An immutable triangular mesh
///
/// ```text
///     3               4               5
/// 0.5 *---------------*---------------*
///     | \             | \             |
///     |   \  oxide    |   \  oxide    |
///     |     \         |     \         |
/// 0.0 *---------------*---------------*
///     0               1               2
/// ```
///
/// Each node may carry any number of labels (`"gate"`, `"substrate"`, ...) which boundary
/// conditions use to find their nodes.
#[derive(Clone, Debug)]
pub struct Mesh {
    pub points: Vec<Point>,
    pub elements: Vec<Element>,
    pub symmetry: Symmetry,
    labels: BTreeMap<String, Vec<usize>>,
    /// {[node_a, node_b] (a < b) => adjacent element ids}
    edges: BTreeMap<[usize; 2], Vec<usize>>,
}

impl Mesh {
    /// Build a Mesh from its points and `(node ids, region)` triangles
    pub fn new(
        points: Vec<Point>,
        triangles: Vec<([usize; 3], usize)>,
        symmetry: Symmetry,
    ) -> Result<Self> {
        let mut elements = Vec::with_capacity(triangles.len());
        let mut edges: BTreeMap<[usize; 2], Vec<usize>> = BTreeMap::new();

        for (id, (nodes, region)) in triangles.into_iter().enumerate() {
            if let Some(bad) = nodes.iter().find(|n| **n >= points.len()) {
                return Err(Error::Mesh(format!(
                    "element {} references node {} but the mesh only has {} points",
                    id,
                    bad,
                    points.len()
                )));
            }

            for [a, b] in EDGE_NODES {
                let key = ordered(nodes[a], nodes[b]);
                let adjacent = edges.entry(key).or_default();
                if adjacent.len() == 2 {
                    return Err(Error::Mesh(format!(
                        "edge {:?} is shared by more than two elements",
                        key
                    )));
                }
                adjacent.push(id);
            }

            elements.push(Element { id, nodes, region });
        }

        Ok(Self {
            points,
            elements,
            symmetry,
            labels: BTreeMap::new(),
            edges,
        })
    }

    /// Attach a label to a set of nodes
    pub fn label_nodes(&mut self, label: impl Into<String>, mut nodes: Vec<usize>) -> Result<()> {
        if let Some(bad) = nodes.iter().find(|n| **n >= self.points.len()) {
            return Err(Error::Mesh(format!("cannot label node {}; it does not exist", bad)));
        }
        nodes.sort_unstable();
        nodes.dedup();
        self.labels.insert(label.into(), nodes);
        Ok(())
    }

    /// Nodes carrying a label, in ascending order
    pub fn labeled_nodes(&self, label: &str) -> Option<&[usize]> {
        self.labels.get(label).map(|nodes| nodes.as_slice())
    }

    pub fn num_nodes(&self) -> usize {
        self.points.len()
    }

    pub fn element_points(&self, elem: &Element) -> [Point; 3] {
        elem.nodes.map(|n| self.points[n])
    }

    /// Iterate over all unique edges with their adjacent elements
    pub fn edges(&self) -> impl Iterator<Item = ([usize; 2], &[usize])> + '_ {
        self.edges.iter().map(|(nodes, elems)| (*nodes, elems.as_slice()))
    }

    /// Edges used by a single element (the outer boundary of the device)
    pub fn outer_edges(&self) -> impl Iterator<Item = ([usize; 2], usize)> + '_ {
        self.edges
            .iter()
            .filter(|(_, elems)| elems.len() == 1)
            .map(|(nodes, elems)| (*nodes, elems[0]))
    }

    /// Flags for the nodes which lie on the outer boundary
    pub fn outer_boundary_nodes(&self) -> Vec<bool> {
        let mut on_boundary = vec![false; self.points.len()];
        for ([a, b], _) in self.outer_edges() {
            on_boundary[a] = true;
            on_boundary[b] = true;
        }
        on_boundary
    }

    /// Build the control volume of every element (in parallel on the Rayon Global ThreadPool)
    pub fn control_volumes(&self) -> Result<Vec<ControlVolume>> {
        self.elements
            .par_iter()
            .map(|elem| ControlVolume::build(elem.id, self.element_points(elem), self.symmetry))
            .collect()
    }
}

fn ordered(a: usize, b: usize) -> [usize; 2] {
    if a < b {
        [a, b]
    } else {
        [b, a]
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Two rows of squares split into triangles; region 0 below y = 1, region 1 above
    ///
    /// ```text
    ///  8 --- 9 --- 10 --- 11    y = 2   (region 1)
    ///  |  \  |  \  |   \  |
    ///  4 --- 5 --- 6 ---- 7     y = 1
    ///  |  \  |  \  |   \  |
    ///  0 --- 1 --- 2 ---- 3     y = 0   (region 0)
    /// ```
    pub(crate) fn stacked_mesh(symmetry: Symmetry) -> Mesh {
        let mut points = Vec::new();
        for j in 0..3 {
            for i in 0..4 {
                points.push(Point::at(0.5 + i as f64, j as f64));
            }
        }

        let mut triangles = Vec::new();
        for j in 0..2 {
            for i in 0..3 {
                let n0 = j * 4 + i;
                triangles.push(([n0, n0 + 1, n0 + 4], j));
                triangles.push(([n0 + 1, n0 + 5, n0 + 4], j));
            }
        }

        let mut mesh = Mesh::new(points, triangles, symmetry).unwrap();
        mesh.label_nodes("interface", vec![4, 5, 6, 7]).unwrap();
        mesh
    }

    #[test]
    fn edge_topology() {
        let mesh = stacked_mesh(Symmetry::Planar);

        // 3 horizontal * 3 rows + 4 vertical * 2 rows + 6 diagonals
        assert_eq!(mesh.edges().count(), 23);
        assert_eq!(mesh.outer_edges().count(), 10);

        let on_boundary = mesh.outer_boundary_nodes();
        assert!(on_boundary[0] && on_boundary[4] && on_boundary[11]);
        assert!(!on_boundary[5] && !on_boundary[6]);
    }

    #[test]
    fn control_volumes_cover_the_mesh() {
        let mesh = stacked_mesh(Symmetry::Planar);
        let cvs = mesh.control_volumes().unwrap();
        let total: f64 = cvs.iter().flat_map(|cv| cv.partial_volumes).sum();
        assert!((total - 6.0).abs() < 1e-12);
    }

    #[test]
    fn rejects_dangling_nodes() {
        let result = Mesh::new(
            vec![Point::at(0.0, 0.0), Point::at(1.0, 0.0)],
            vec![([0, 1, 2], 0)],
            Symmetry::Planar,
        );
        assert!(matches!(result, Err(Error::Mesh(_))));
    }
}
