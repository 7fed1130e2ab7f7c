use super::space::{triangle_centroid, Point, Symmetry};
use super::EDGE_NODES;
use crate::error::{Error, Result};

use nalgebra::{Matrix2x3, Matrix3x2};
use std::ops::{Add, Div, Mul};

/// Absolute tolerance on the partial volume sum of tiny elements
const TINY_VOLUME_TOLERANCE: f64 = 1e-13;

/// Elements smaller than this are checked against an absolute tolerance
const TINY_VOLUME: f64 = 1e-10;

/// Dual-mesh metrics of one triangular element
///
/// ```text
///          2
///          o
///         / \
///        /   \
///    e2 /     \ e1
///      /       \
///     /    e0   \
///    o-----------o
///    0           1
/// ```
///
/// Edge `e` joins the local nodes `EDGE_NODES[e]`; the node opposite edge `e` is `(e + 2) % 3`.
///
/// The circumcenter based (Voronoi) decomposition is kept in `voronoi_volumes` and
/// `edge_distances`. When an angle is obtuse (or right) the circumcenter leaves the element and
/// the Voronoi pieces beside the opposite edge turn negative; `partial_volumes` and
/// `flux_weights` hold the truncated decomposition that replaces it:
///
/// ```text
///                          p3 (apex)
///                          o
///                       *  .  *
///                    *     .    *
///                 * c1     .     c2 *
///              *   \       .       /   *
///           *       \      .      /       *
///        o-----------o-----------o-----------o
///        p1          m1          m2          p2
/// ```
///
/// `m1`/`m2` are the points where the perpendicular bisectors of `p1 p3`/`p2 p3` cross the obtuse
/// edge. No flux crosses between `p1` and `p2`; the wedge `p3 m1 m2` belongs to the apex.
#[derive(Clone, Debug)]
pub struct ControlVolume {
    pub elem_id: usize,
    pub symmetry: Symmetry,
    /// Vertex positions
    pub points: [Point; 3],
    pub circumcenter: Point,
    /// Area of the element, swept according to `symmetry`
    pub volume: f64,
    /// Length of each edge
    pub edge_lengths: [f64; 3],
    /// Signed distance from each edge midpoint to the circumcenter (negative when the opposite angle is obtuse)
    pub edge_distances: [f64; 3],
    /// Signed Voronoi partial volume of each node
    pub voronoi_volumes: [f64; 3],
    /// Truncated (non-negative) partial volume of each node
    pub partial_volumes: [f64; 3],
    /// Dual face area crossed by the flux along each edge (`d[e] * L_e` after truncation)
    pub flux_weights: [f64; 3],
    /// The edge opposite a non-acute angle, if any
    pub obtuse_edge: Option<usize>,
    reconstruction: Matrix2x3<f64>,
}

impl ControlVolume {
    /// Build the dual-mesh metrics of a triangle
    ///
    /// Fails if the triangle is degenerate, if more than one of its angles tests as non-acute, or if
    /// the truncated partial volumes do not add up to the element volume.
    pub fn build(elem_id: usize, points: [Point; 3], symmetry: Symmetry) -> Result<Self> {
        let circumcenter = circumcenter(elem_id, &points)?;
        let volume = symmetry.triangle_volume(points[0], points[1], points[2]);

        let mut edge_lengths = [0.0; 3];
        let mut edge_distances = [0.0; 3];
        let mut voronoi_volumes = [0.0; 3];
        let mut flux_weights = [0.0; 3];
        let mut obtuse_edges = Vec::with_capacity(1);

        for (e, &[n1, n2]) in EDGE_NODES.iter().enumerate() {
            let p1 = points[n1];
            let p2 = points[n2];
            let p3 = points[(e + 2) % 3];

            let edge_center = p1.midpoint(&p2);
            edge_lengths[e] = p1.distance_to(&p2);

            let d = edge_center.distance_to(&circumcenter);
            edge_distances[e] = if (p1 - p3).cos_angle(&(p2 - p3)) <= 0.0 {
                obtuse_edges.push(e);
                -d
            } else {
                d
            };

            // each half edge spans a right triangle (node, edge center, circumcenter)
            let half_area = 0.5 * 0.5 * edge_lengths[e] * edge_distances[e];
            voronoi_volumes[n1] +=
                half_area * symmetry.sweep(triangle_centroid(p1, edge_center, circumcenter));
            voronoi_volumes[n2] +=
                half_area * symmetry.sweep(triangle_centroid(p2, edge_center, circumcenter));

            flux_weights[e] = edge_distances[e] * symmetry.sweep(edge_center.midpoint(&circumcenter));
        }

        let mut partial_volumes = voronoi_volumes;
        let obtuse_edge = match obtuse_edges.len() {
            0 => None,
            1 => {
                let e = obtuse_edges[0];
                truncate(&points, e, symmetry, &mut partial_volumes, &mut flux_weights);
                log::debug!(
                    "element {}: truncated control volume across obtuse edge {}",
                    elem_id,
                    e
                );
                Some(e)
            }
            count => return Err(Error::MultipleObtuseEdges { elem: elem_id, count }),
        };

        let sum: f64 = partial_volumes.iter().sum();
        let conserved = if volume > TINY_VOLUME {
            (sum - volume).abs() < 1e-3 * volume
        } else {
            (sum - volume).abs() < TINY_VOLUME_TOLERANCE.max(1e-2 * volume)
        };
        if !conserved {
            return Err(Error::VolumeMismatch {
                elem: elem_id,
                sum,
                volume,
            });
        }

        let reconstruction = reconstruction_operator(elem_id, &points)?;

        Ok(Self {
            elem_id,
            symmetry,
            points,
            circumcenter,
            volume,
            edge_lengths,
            edge_distances,
            voronoi_volumes,
            partial_volumes,
            flux_weights,
            obtuse_edge,
            reconstruction,
        })
    }

    /// Local node indices joined by edge `e`
    pub fn edge_nodes(&self, e: usize) -> [usize; 2] {
        EDGE_NODES[e]
    }

    /// Unit direction of edge `e` (from its first to its second node)
    pub fn edge_direction(&self, e: usize) -> Point {
        let [n1, n2] = EDGE_NODES[e];
        (self.points[n2] - self.points[n1]).unit()
    }

    /// Least-squares estimate of a vector from its projections onto the three edge directions
    ///
    /// The operator `(AᵀA)⁻¹Aᵀ` is built once with real coefficients; the projections may be real,
    /// complex or dual numbers.
    pub fn reconstruct_vector<T>(&self, projections: &[T; 3]) -> [T; 2]
    where
        T: Clone + Add<Output = T> + Mul<f64, Output = T>,
    {
        let m = &self.reconstruction;
        let row = |r: usize| {
            projections[0].clone() * m[(r, 0)]
                + projections[1].clone() * m[(r, 1)]
                + projections[2].clone() * m[(r, 2)]
        };
        [row(0), row(1)]
    }

    /// Green-Gauss gradient of a linear nodal field over the element
    pub fn gradient<T>(&self, values: &[T; 3]) -> [T; 2]
    where
        T: Clone + Add<Output = T> + Mul<f64, Output = T> + Div<f64, Output = T>,
    {
        let [a, b, c] = self.points;
        let twice_area = (b - a).cross(&(c - a));

        let dx = (values[0].clone() * (b.y - c.y)
            + values[1].clone() * (c.y - a.y)
            + values[2].clone() * (a.y - b.y))
            / twice_area;
        let dy = (values[0].clone() * (c.x - b.x)
            + values[1].clone() * (a.x - c.x)
            + values[2].clone() * (b.x - a.x))
            / twice_area;

        [dx, dy]
    }
}

fn circumcenter(elem_id: usize, points: &[Point; 3]) -> Result<Point> {
    let v12 = points[0] - points[1];
    let v23 = points[1] - points[2];
    let v13 = points[0] - points[2];

    let det = v12.cross(&v23).powi(2);
    if det <= f64::EPSILON * v12.size_sq() * v23.size_sq() {
        return Err(Error::DegenerateElement { elem: elem_id, det });
    }

    let alpha = v23.size_sq() * v12.dot(&v13) / 2.0 / det;
    let beta = -v13.size_sq() * v12.dot(&v23) / 2.0 / det;
    let gamma = v12.size_sq() * v13.dot(&v23) / 2.0 / det;

    Ok(points[0] * alpha + points[1] * beta + points[2] * gamma)
}

// replace the Voronoi pieces around a non-acute angle with the truncated decomposition
fn truncate(
    points: &[Point; 3],
    obtuse_edge: usize,
    symmetry: Symmetry,
    volumes: &mut [f64; 3],
    weights: &mut [f64; 3],
) {
    let [node1, node2] = EDGE_NODES[obtuse_edge];
    let apex = (obtuse_edge + 2) % 3;
    let pre_edge = (obtuse_edge + 2) % 3;
    let pos_edge = (obtuse_edge + 1) % 3;

    let p1 = points[node1];
    let p2 = points[node2];
    let p3 = points[apex];

    let a1 = (p2 - p1).angle(&(p3 - p1));
    let a2 = (p1 - p2).angle(&(p3 - p2));

    let c1 = p1.midpoint(&p3);
    let c2 = p2.midpoint(&p3);
    let m1 = p1 + (p2 - p1).unit() * (c1.distance_to(&p1) / a1.cos());
    let m2 = p2 + (p1 - p2).unit() * (c2.distance_to(&p2) / a2.cos());

    weights[obtuse_edge] = 0.0;
    weights[pre_edge] = c1.distance_to(&m1) * symmetry.sweep(c1.midpoint(&m1));
    weights[pos_edge] = c2.distance_to(&m2) * symmetry.sweep(c2.midpoint(&m2));

    volumes[node1] = symmetry.triangle_volume(p1, c1, m1);
    volumes[node2] = symmetry.triangle_volume(p2, c2, m2);
    volumes[apex] = symmetry.triangle_volume(p3, c1, m1)
        + symmetry.triangle_volume(p3, c2, m2)
        + symmetry.triangle_volume(p3, m1, m2);
}

// (AᵀA)⁻¹Aᵀ where the rows of A are the unit edge directions
fn reconstruction_operator(elem_id: usize, points: &[Point; 3]) -> Result<Matrix2x3<f64>> {
    let mut a = Matrix3x2::zeros();
    for (e, &[n1, n2]) in EDGE_NODES.iter().enumerate() {
        let dir = (points[n2] - points[n1]).unit();
        a[(e, 0)] = dir.x;
        a[(e, 1)] = dir.y;
    }

    let at = a.transpose();
    let ata = at * a;
    let ata_inv = ata.lu().try_inverse().ok_or_else(|| Error::DegenerateElement {
        elem: elem_id,
        det: ata.determinant(),
    })?;

    Ok(ata_inv * at)
}
