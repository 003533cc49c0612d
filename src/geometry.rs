//! Planar polyline geometry.
//!
//! Road edges are polylines in a planar projection (meters). This module
//! provides the arc-length indexing used by the road/ground projections:
//! locating the segment containing a given arc length, orthogonally
//! projecting a point onto a polyline, extracting sub-lines, and merging two
//! polylines that share an endpoint.

use nalgebra::Vector2;

use crate::error::{Result, TrackingError};

/// A 2D coordinate in the planar projection of the road graph.
pub type Coord = Vector2<f64>;

/// Coordinate equality tolerance for shared endpoints (meters).
pub const COORD_EPS: f64 = 1e-6;

fn coords_equal(a: &Coord, b: &Coord) -> bool {
    (a - b).norm() <= COORD_EPS
}

/// A directed straight segment between two coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LineSegment {
    pub p0: Coord,
    pub p1: Coord,
}

impl LineSegment {
    pub fn new(p0: Coord, p1: Coord) -> Self {
        Self { p0, p1 }
    }

    pub fn length(&self) -> f64 {
        (self.p1 - self.p0).norm()
    }

    /// Unit tangent from `p0` to `p1`. Callers must not pass degenerate
    /// segments; the polyline constructors reject them.
    pub fn tangent(&self) -> Coord {
        (self.p1 - self.p0) / self.length()
    }

    /// Point at distance `d` from `p0` along the segment.
    pub fn point_at(&self, d: f64) -> Coord {
        self.p0 + self.tangent() * d
    }

    /// Distance along the segment of the orthogonal foot of `p`, clamped to
    /// the segment's extent.
    pub fn project(&self, p: &Coord) -> f64 {
        let t = self.tangent();
        t.dot(&(p - self.p0)).clamp(0.0, self.length())
    }
}

/// An immutable polyline with cached cumulative arc lengths.
#[derive(Clone, Debug, PartialEq)]
pub struct Polyline {
    coords: Vec<Coord>,
    cumulative: Vec<f64>,
}

impl Polyline {
    /// Build a polyline from at least two coordinates with nonzero total
    /// length. Repeated consecutive points are removed.
    pub fn new(coords: Vec<Coord>) -> Result<Self> {
        let mut cleaned: Vec<Coord> = Vec::with_capacity(coords.len());
        for c in coords {
            if cleaned.last().map_or(true, |last| !coords_equal(last, &c)) {
                cleaned.push(c);
            }
        }
        if cleaned.len() < 2 {
            return Err(TrackingError::Geometry(
                "polyline requires at least two distinct coordinates".into(),
            ));
        }
        let mut cumulative = Vec::with_capacity(cleaned.len());
        let mut total = 0.0;
        cumulative.push(0.0);
        for w in cleaned.windows(2) {
            total += (w[1] - w[0]).norm();
            cumulative.push(total);
        }
        Ok(Self { coords: cleaned, cumulative })
    }

    /// The empty polyline used by the null edge.
    pub fn empty() -> Self {
        Self { coords: Vec::new(), cumulative: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }

    pub fn coords(&self) -> &[Coord] {
        &self.coords
    }

    pub fn length(&self) -> f64 {
        self.cumulative.last().copied().unwrap_or(0.0)
    }

    pub fn start(&self) -> Coord {
        self.coords[0]
    }

    pub fn end(&self) -> Coord {
        *self.coords.last().expect("non-empty polyline")
    }

    /// The segment containing arc length `s` (clamped to the polyline), and
    /// the arc distance to that segment's start. The shared vertex between
    /// two segments belongs to the later one; the polyline end belongs to
    /// the last segment.
    pub fn segment_at(&self, s: f64) -> (LineSegment, f64) {
        let s = s.clamp(0.0, self.length());
        let n = self.coords.len();
        let mut idx = n - 2;
        for i in 0..n - 1 {
            if s < self.cumulative[i + 1] {
                idx = i;
                break;
            }
        }
        (
            LineSegment::new(self.coords[idx], self.coords[idx + 1]),
            self.cumulative[idx],
        )
    }

    /// Coordinate at arc length `s` (clamped).
    pub fn point_at(&self, s: f64) -> Coord {
        let s = s.clamp(0.0, self.length());
        let (seg, d0) = self.segment_at(s);
        seg.point_at(s - d0)
    }

    /// Arc length of the closest point on the polyline to `p`.
    pub fn project(&self, p: &Coord) -> f64 {
        let mut best_s = 0.0;
        let mut best_dist = f64::INFINITY;
        for i in 0..self.coords.len() - 1 {
            let seg = LineSegment::new(self.coords[i], self.coords[i + 1]);
            let along = seg.project(p);
            let foot = seg.point_at(along);
            let dist = (p - foot).norm();
            if dist < best_dist {
                best_dist = dist;
                best_s = self.cumulative[i] + along;
            }
        }
        best_s
    }

    /// Distance from `p` to the polyline.
    pub fn distance_to(&self, p: &Coord) -> f64 {
        let foot = self.point_at(self.project(p));
        (p - foot).norm()
    }

    pub fn reversed(&self) -> Polyline {
        let mut coords = self.coords.clone();
        coords.reverse();
        Polyline::new(coords).expect("reversal preserves validity")
    }

    /// Sub-line between arc lengths `s0 < s1` (both clamped).
    pub fn extract(&self, s0: f64, s1: f64) -> Result<Polyline> {
        let s0 = s0.clamp(0.0, self.length());
        let s1 = s1.clamp(0.0, self.length());
        if s1 - s0 <= COORD_EPS {
            return Err(TrackingError::Geometry(format!(
                "degenerate extraction [{s0}, {s1}]"
            )));
        }
        let mut coords = vec![self.point_at(s0)];
        for (i, c) in self.coords.iter().enumerate() {
            if self.cumulative[i] > s0 && self.cumulative[i] < s1 {
                coords.push(*c);
            }
        }
        coords.push(self.point_at(s1));
        Polyline::new(coords)
    }

    /// Concatenate with a polyline that starts where this one ends.
    pub fn concat(&self, other: &Polyline) -> Result<Polyline> {
        if !coords_equal(&self.end(), &other.start()) {
            return Err(TrackingError::Geometry(
                "concatenation requires a shared endpoint".into(),
            ));
        }
        let mut coords = self.coords.clone();
        coords.extend_from_slice(&other.coords[1..]);
        Polyline::new(coords)
    }
}

/// Result of merging two polylines that overlap at one end.
#[derive(Clone, Debug)]
pub struct PolylineMerge {
    pub geometry: Polyline,
    pub to_reversed: bool,
}

/// Join two polylines sharing an endpoint, reporting whether the second was
/// reversed to make the join. Returns `None` when no endpoint pairing
/// connects them (the caller treats them as disjoint paths).
pub fn merge_polylines(from: &Polyline, to: &Polyline) -> Option<PolylineMerge> {
    if from.is_empty() || to.is_empty() {
        return None;
    }
    if coords_equal(&from.end(), &to.start()) {
        return Some(PolylineMerge {
            geometry: from.concat(to).ok()?,
            to_reversed: false,
        });
    }
    if coords_equal(&from.end(), &to.end()) {
        return Some(PolylineMerge {
            geometry: from.concat(&to.reversed()).ok()?,
            to_reversed: true,
        });
    }
    if coords_equal(&to.end(), &from.start()) {
        return Some(PolylineMerge {
            geometry: to.concat(from).ok()?,
            to_reversed: false,
        });
    }
    if coords_equal(&from.start(), &to.start()) {
        return Some(PolylineMerge {
            geometry: to.reversed().concat(from).ok()?,
            to_reversed: true,
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn line(points: &[(f64, f64)]) -> Polyline {
        Polyline::new(points.iter().map(|&(x, y)| Coord::new(x, y)).collect()).unwrap()
    }

    #[test]
    fn cumulative_lengths() {
        let l = line(&[(0.0, 0.0), (1.0, 0.0), (1.0, 2.0)]);
        assert_approx_eq!(l.length(), 3.0, 1e-12);
        let (seg, d0) = l.segment_at(1.5);
        assert_approx_eq!(d0, 1.0, 1e-12);
        assert_approx_eq!(seg.p0.x, 1.0, 1e-12);
    }

    #[test]
    fn vertex_belongs_to_later_segment() {
        let l = line(&[(0.0, 0.0), (1.0, 0.0), (2.0, 0.0)]);
        let (seg, d0) = l.segment_at(1.0);
        assert_approx_eq!(d0, 1.0, 1e-12);
        assert_approx_eq!(seg.p0.x, 1.0, 1e-12);
        // End of the line stays on the last segment.
        let (seg, d0) = l.segment_at(2.0);
        assert_approx_eq!(d0, 1.0, 1e-12);
        assert_approx_eq!(seg.p1.x, 2.0, 1e-12);
    }

    #[test]
    fn projection_snaps_to_closest_segment() {
        let l = line(&[(0.0, 0.0), (2.0, 0.0), (2.0, 2.0)]);
        assert_approx_eq!(l.project(&Coord::new(1.0, 0.5)), 1.0, 1e-12);
        assert_approx_eq!(l.project(&Coord::new(2.5, 1.0)), 3.0, 1e-12);
        // Beyond the end the projection clamps to the final vertex.
        assert_approx_eq!(l.project(&Coord::new(2.0, 5.0)), 4.0, 1e-12);
    }

    #[test]
    fn extraction_preserves_interior_vertices() {
        let l = line(&[(0.0, 0.0), (1.0, 0.0), (1.0, 1.0)]);
        let sub = l.extract(0.5, 1.5).unwrap();
        assert_approx_eq!(sub.length(), 1.0, 1e-12);
        assert_eq!(sub.coords().len(), 3);
    }

    #[test]
    fn merge_head_to_tail() {
        let a = line(&[(0.0, 0.0), (1.0, 0.0)]);
        let b = line(&[(1.0, 0.0), (2.0, 0.0)]);
        let merged = merge_polylines(&a, &b).unwrap();
        assert!(!merged.to_reversed);
        assert_approx_eq!(merged.geometry.length(), 2.0, 1e-12);
    }

    #[test]
    fn merge_detects_reversal() {
        let a = line(&[(0.0, 0.0), (1.0, 0.0)]);
        let b = line(&[(2.0, 0.0), (1.0, 0.0)]);
        let merged = merge_polylines(&a, &b).unwrap();
        assert!(merged.to_reversed);
        assert_approx_eq!(merged.geometry.end().x, 2.0, 1e-12);
    }

    #[test]
    fn merge_disjoint_is_none() {
        let a = line(&[(0.0, 0.0), (1.0, 0.0)]);
        let b = line(&[(5.0, 5.0), (6.0, 5.0)]);
        assert!(merge_polylines(&a, &b).is_none());
    }
}
