use std::f64::consts::PI;
use std::fmt;
use std::ops::{Add, Div, Index, Mul, Neg, Sub};

/// A Point (or vector) in the 2D real space of the Mesh
///
/// For cylindrical meshes `x` is the radius and `y` the axial coordinate.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn at(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub const fn from([x, y]: [f64; 2]) -> Self {
        Self { x, y }
    }

    pub fn dot(&self, other: &Self) -> f64 {
        self.x * other.x + self.y * other.y
    }

    /// z-component of the 3D cross product
    pub fn cross(&self, other: &Self) -> f64 {
        self.x * other.y - self.y * other.x
    }

    pub fn size_sq(&self) -> f64 {
        self.dot(self)
    }

    pub fn size(&self) -> f64 {
        self.size_sq().sqrt()
    }

    pub fn unit(&self) -> Self {
        *self / self.size()
    }

    /// Cosine of the angle between two vectors
    pub fn cos_angle(&self, other: &Self) -> f64 {
        self.dot(other) / (self.size() * other.size())
    }

    /// Angle between two vectors in [0, π]
    pub fn angle(&self, other: &Self) -> f64 {
        self.cos_angle(other).clamp(-1.0, 1.0).acos()
    }

    pub fn midpoint(&self, other: &Self) -> Self {
        (*self + *other) * 0.5
    }

    pub fn distance_to(&self, other: &Self) -> f64 {
        (*self - *other).size()
    }
}

impl Default for Point {
    fn default() -> Self {
        Self { x: 0.0, y: 0.0 }
    }
}

impl Index<usize> for Point {
    type Output = f64;
    fn index(&self, index: usize) -> &Self::Output {
        match index {
            0 => &self.x,
            1 => &self.y,
            _ => panic!("Point index {} out of range; Points are 2D!", index),
        }
    }
}

impl Add for Point {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self::at(self.x + other.x, self.y + other.y)
    }
}

impl Sub for Point {
    type Output = Self;
    fn sub(self, other: Self) -> Self {
        Self::at(self.x - other.x, self.y - other.y)
    }
}

impl Neg for Point {
    type Output = Self;
    fn neg(self) -> Self {
        Self::at(-self.x, -self.y)
    }
}

impl Mul<f64> for Point {
    type Output = Self;
    fn mul(self, coefficient: f64) -> Self {
        Self::at(self.x * coefficient, self.y * coefficient)
    }
}

impl Mul<Point> for f64 {
    type Output = Point;
    fn mul(self, p: Point) -> Point {
        p * self
    }
}

impl Div<f64> for Point {
    type Output = Self;
    fn div(self, divisor: f64) -> Self {
        Self::at(self.x / divisor, self.y / divisor)
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({:.5}, {:.5})", self.x, self.y)
    }
}

/// Unsigned area of the triangle `abc`
pub fn triangle_area(a: Point, b: Point, c: Point) -> f64 {
    0.5 * (b - a).cross(&(c - a)).abs()
}

pub fn triangle_centroid(a: Point, b: Point, c: Point) -> Point {
    (a + b + c) / 3.0
}

/// How 2D areas and lengths are turned into volumes and surfaces
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Symmetry {
    /// Cross section of unit depth
    Planar,
    /// Revolved about the y-axis; `x` is the radius
    Cylindrical,
}

impl Symmetry {
    /// Length swept by a point when the cross section is extruded/revolved (Pappus's centroid theorem)
    #[inline]
    pub fn sweep(&self, centroid: Point) -> f64 {
        match self {
            Self::Planar => 1.0,
            Self::Cylindrical => 2.0 * PI * centroid.x,
        }
    }

    /// Volume generated by the triangle `abc`
    pub fn triangle_volume(&self, a: Point, b: Point, c: Point) -> f64 {
        triangle_area(a, b, c) * self.sweep(triangle_centroid(a, b, c))
    }

    /// Surface generated by the segment `ab`
    pub fn segment_surface(&self, a: Point, b: Point) -> f64 {
        a.distance_to(&b) * self.sweep(a.midpoint(&b))
    }
}
