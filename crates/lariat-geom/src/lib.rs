//! Planar geometry primitives shared across the Lariat workspace.

use serde::{Deserialize, Serialize};

/// Tolerance applied to the unit-interval bounds when classifying segment
/// intersections. Guards against floating-point noise promoting a shared
/// vertex into a crossing.
pub const INTERSECTION_EPSILON: f32 = 0.001;

/// Axis-aligned 2D point.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Point2 {
    pub x: f32,
    pub y: f32,
}

impl Point2 {
    /// Construct a new point.
    #[must_use]
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to `other`.
    #[must_use]
    pub fn distance(self, other: Self) -> f32 {
        (other.x - self.x).hypot(other.y - self.y)
    }
}

/// Tests whether segment `a1..a2` intersects segment `b1..b2` using the
/// classic parametric line-line solution.
///
/// A zero denominator means the segments are parallel or collinear and is
/// never reported as an intersection. `include_endpoints` widens acceptance
/// to the (epsilon-adjusted) boundary of the unit interval; `false` demands a
/// strict interior crossing, so segments that merely share a vertex do not
/// register.
#[must_use]
pub fn segments_intersect(
    a1: Point2,
    a2: Point2,
    b1: Point2,
    b2: Point2,
    include_endpoints: bool,
) -> bool {
    let denominator = (b2.y - b1.y) * (a2.x - a1.x) - (b2.x - b1.x) * (a2.y - a1.y);
    if denominator == 0.0 {
        return false;
    }

    let u_a = ((b2.x - b1.x) * (a1.y - b1.y) - (b2.y - b1.y) * (a1.x - b1.x)) / denominator;
    let u_b = ((a2.x - a1.x) * (a1.y - b1.y) - (a2.y - a1.y) * (a1.x - b1.x)) / denominator;

    let lo = INTERSECTION_EPSILON;
    let hi = 1.0 - INTERSECTION_EPSILON;
    if include_endpoints {
        u_a >= lo && u_a <= hi && u_b >= lo && u_b <= hi
    } else {
        u_a > lo && u_a < hi && u_b > lo && u_b < hi
    }
}

/// Even-odd ray-cast test for containment of `point` in the closed polygon
/// described by `polygon` (implicitly closed from last vertex to first).
///
/// Polygons with fewer than three vertices contain nothing.
#[must_use]
pub fn point_in_polygon(point: Point2, polygon: &[Point2]) -> bool {
    if polygon.len() < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = polygon.len() - 1;
    for i in 0..polygon.len() {
        let pi = polygon[i];
        let pj = polygon[j];
        if (pi.y > point.y) != (pj.y > point.y)
            && point.x < (pj.x - pi.x) * (point.y - pi.y) / (pj.y - pi.y) + pi.x
        {
            inside = !inside;
        }
        j = i;
    }
    inside
}
