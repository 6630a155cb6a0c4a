//! Planar geometry types.
//!
//! Only the operations the query engine needs are provided: bounding boxes,
//! rectangle intersection for spatial filters, area/length for expression
//! functions, and Douglas-Peucker simplification.

use alloc::vec::Vec;

/// A 2D coordinate.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Coord {
    pub x: f64,
    pub y: f64,
}

impl Coord {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

impl From<(f64, f64)> for Coord {
    fn from((x, y): (f64, f64)) -> Self {
        Coord { x, y }
    }
}

/// Axis-aligned rectangle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Rect {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
}

impl Rect {
    /// Creates a rectangle, normalizing so that min <= max on each axis.
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self {
            xmin: x1.min(x2),
            ymin: y1.min(y2),
            xmax: x1.max(x2),
            ymax: y1.max(y2),
        }
    }

    #[inline]
    pub fn width(&self) -> f64 {
        self.xmax - self.xmin
    }

    #[inline]
    pub fn height(&self) -> f64 {
        self.ymax - self.ymin
    }

    /// Closed containment test.
    #[inline]
    pub fn contains(&self, c: Coord) -> bool {
        c.x >= self.xmin && c.x <= self.xmax && c.y >= self.ymin && c.y <= self.ymax
    }

    /// Returns true if the two rectangles share at least one point.
    pub fn intersects(&self, other: &Rect) -> bool {
        self.xmin <= other.xmax
            && other.xmin <= self.xmax
            && self.ymin <= other.ymax
            && other.ymin <= self.ymax
    }

    /// Smallest rectangle containing both.
    pub fn union(&self, other: &Rect) -> Rect {
        Rect {
            xmin: self.xmin.min(other.xmin),
            ymin: self.ymin.min(other.ymin),
            xmax: self.xmax.max(other.xmax),
            ymax: self.ymax.max(other.ymax),
        }
    }

    fn corners(&self) -> [Coord; 4] {
        [
            Coord::new(self.xmin, self.ymin),
            Coord::new(self.xmax, self.ymin),
            Coord::new(self.xmax, self.ymax),
            Coord::new(self.xmin, self.ymax),
        ]
    }

    fn edges(&self) -> [(Coord, Coord); 4] {
        let c = self.corners();
        [(c[0], c[1]), (c[1], c[2]), (c[2], c[3]), (c[3], c[0])]
    }
}

/// A planar geometry.
#[derive(Clone, Debug, PartialEq)]
pub enum Geometry {
    Point(Coord),
    LineString(Vec<Coord>),
    /// Polygon outer ring. The ring is closed: first and last coordinates match.
    Polygon(Vec<Coord>),
}

impl Geometry {
    pub fn point(x: f64, y: f64) -> Self {
        Geometry::Point(Coord::new(x, y))
    }

    pub fn line_string(coords: impl IntoIterator<Item = (f64, f64)>) -> Self {
        Geometry::LineString(coords.into_iter().map(Coord::from).collect())
    }

    /// Creates a polygon, closing the ring if needed.
    pub fn polygon(coords: impl IntoIterator<Item = (f64, f64)>) -> Self {
        let mut ring: Vec<Coord> = coords.into_iter().map(Coord::from).collect();
        if let (Some(first), Some(last)) = (ring.first().copied(), ring.last().copied()) {
            if first != last {
                ring.push(first);
            }
        }
        Geometry::Polygon(ring)
    }

    fn coords(&self) -> &[Coord] {
        match self {
            Geometry::Point(c) => core::slice::from_ref(c),
            Geometry::LineString(cs) | Geometry::Polygon(cs) => cs,
        }
    }

    /// Bounding box, or None for an empty geometry.
    pub fn bounding_box(&self) -> Option<Rect> {
        let mut iter = self.coords().iter();
        let first = iter.next()?;
        let mut rect = Rect::new(first.x, first.y, first.x, first.y);
        for c in iter {
            rect.xmin = rect.xmin.min(c.x);
            rect.ymin = rect.ymin.min(c.y);
            rect.xmax = rect.xmax.max(c.x);
            rect.ymax = rect.ymax.max(c.y);
        }
        Some(rect)
    }

    /// Exact intersection test against a rectangle.
    pub fn intersects_rect(&self, rect: &Rect) -> bool {
        let bbox = match self.bounding_box() {
            Some(b) => b,
            None => return false,
        };
        if !bbox.intersects(rect) {
            return false;
        }
        match self {
            Geometry::Point(c) => rect.contains(*c),
            Geometry::LineString(cs) => path_intersects_rect(cs, rect),
            Geometry::Polygon(ring) => {
                path_intersects_rect(ring, rect)
                    || rect.corners().iter().any(|c| ring_contains(ring, *c))
            }
        }
    }

    /// Planar area. Zero for points and lines.
    pub fn area(&self) -> f64 {
        match self {
            Geometry::Polygon(ring) if ring.len() >= 3 => {
                let mut sum = 0.0;
                for w in ring.windows(2) {
                    sum += w[0].x * w[1].y - w[1].x * w[0].y;
                }
                libm::fabs(sum) / 2.0
            }
            _ => 0.0,
        }
    }

    /// Length of a line. Zero for points and polygons.
    pub fn length(&self) -> f64 {
        match self {
            Geometry::LineString(cs) => path_length(cs),
            _ => 0.0,
        }
    }

    /// Perimeter of a polygon. Zero for points and lines.
    pub fn perimeter(&self) -> f64 {
        match self {
            Geometry::Polygon(ring) => path_length(ring),
            _ => 0.0,
        }
    }

    /// Point coordinate, for point geometries only.
    pub fn as_point(&self) -> Option<Coord> {
        match self {
            Geometry::Point(c) => Some(*c),
            _ => None,
        }
    }

    /// Douglas-Peucker simplification.
    ///
    /// Lines keep at least their end points; polygon rings that would
    /// collapse below a triangle are returned unchanged.
    pub fn simplify(&self, tolerance: f64) -> Geometry {
        if tolerance <= 0.0 {
            return self.clone();
        }
        match self {
            Geometry::Point(_) => self.clone(),
            Geometry::LineString(cs) => Geometry::LineString(douglas_peucker(cs, tolerance)),
            Geometry::Polygon(ring) => {
                let simplified = douglas_peucker(ring, tolerance);
                if simplified.len() < 4 {
                    self.clone()
                } else {
                    Geometry::Polygon(simplified)
                }
            }
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.coords().len()
    }
}

fn path_length(cs: &[Coord]) -> f64 {
    cs.windows(2)
        .map(|w| libm::hypot(w[1].x - w[0].x, w[1].y - w[0].y))
        .sum()
}

fn path_intersects_rect(cs: &[Coord], rect: &Rect) -> bool {
    if cs.iter().any(|c| rect.contains(*c)) {
        return true;
    }
    let edges = rect.edges();
    cs.windows(2).any(|w| {
        edges
            .iter()
            .any(|(a, b)| segments_intersect(w[0], w[1], *a, *b))
    })
}

fn orientation(a: Coord, b: Coord, c: Coord) -> f64 {
    (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x)
}

fn on_segment(a: Coord, b: Coord, p: Coord) -> bool {
    p.x >= a.x.min(b.x) && p.x <= a.x.max(b.x) && p.y >= a.y.min(b.y) && p.y <= a.y.max(b.y)
}

fn segments_intersect(p1: Coord, p2: Coord, q1: Coord, q2: Coord) -> bool {
    let d1 = orientation(q1, q2, p1);
    let d2 = orientation(q1, q2, p2);
    let d3 = orientation(p1, p2, q1);
    let d4 = orientation(p1, p2, q2);

    if ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
    {
        return true;
    }
    (d1 == 0.0 && on_segment(q1, q2, p1))
        || (d2 == 0.0 && on_segment(q1, q2, p2))
        || (d3 == 0.0 && on_segment(p1, p2, q1))
        || (d4 == 0.0 && on_segment(p1, p2, q2))
}

/// Even-odd ray casting.
fn ring_contains(ring: &[Coord], p: Coord) -> bool {
    let mut inside = false;
    for w in ring.windows(2) {
        let (a, b) = (w[0], w[1]);
        if (a.y > p.y) != (b.y > p.y) {
            let x = a.x + (p.y - a.y) * (b.x - a.x) / (b.y - a.y);
            if p.x < x {
                inside = !inside;
            }
        }
    }
    inside
}

fn perpendicular_distance(p: Coord, a: Coord, b: Coord) -> f64 {
    let dx = b.x - a.x;
    let dy = b.y - a.y;
    let len = libm::hypot(dx, dy);
    if len == 0.0 {
        return libm::hypot(p.x - a.x, p.y - a.y);
    }
    libm::fabs(dy * p.x - dx * p.y + b.x * a.y - b.y * a.x) / len
}

fn douglas_peucker(cs: &[Coord], tolerance: f64) -> Vec<Coord> {
    if cs.len() < 3 {
        return cs.to_vec();
    }
    let mut keep = alloc::vec![false; cs.len()];
    keep[0] = true;
    keep[cs.len() - 1] = true;

    let mut stack = alloc::vec![(0usize, cs.len() - 1)];
    while let Some((start, end)) = stack.pop() {
        if end <= start + 1 {
            continue;
        }
        let mut max_dist = 0.0;
        let mut index = start;
        for i in start + 1..end {
            let d = perpendicular_distance(cs[i], cs[start], cs[end]);
            if d > max_dist {
                max_dist = d;
                index = i;
            }
        }
        if max_dist > tolerance {
            keep[index] = true;
            stack.push((start, index));
            stack.push((index, end));
        }
    }

    cs.iter()
        .zip(keep)
        .filter_map(|(c, k)| if k { Some(*c) } else { None })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Geometry {
        Geometry::polygon([(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)])
    }

    #[test]
    fn test_rect_normalizes() {
        let r = Rect::new(5.0, 6.0, 1.0, 2.0);
        assert_eq!(r, Rect { xmin: 1.0, ymin: 2.0, xmax: 5.0, ymax: 6.0 });
        assert_eq!(r.width(), 4.0);
    }

    #[test]
    fn test_polygon_closes_ring() {
        assert_eq!(square().vertex_count(), 5);
    }

    #[test]
    fn test_bounding_box() {
        let line = Geometry::line_string([(1.0, 5.0), (3.0, -2.0), (2.0, 0.0)]);
        assert_eq!(line.bounding_box(), Some(Rect::new(1.0, -2.0, 3.0, 5.0)));
        assert_eq!(Geometry::LineString(Vec::new()).bounding_box(), None);
    }

    #[test]
    fn test_point_intersects() {
        let r = Rect::new(0.0, 0.0, 1.0, 1.0);
        assert!(Geometry::point(0.5, 0.5).intersects_rect(&r));
        assert!(Geometry::point(1.0, 1.0).intersects_rect(&r));
        assert!(!Geometry::point(1.5, 0.5).intersects_rect(&r));
    }

    #[test]
    fn test_line_crossing_rect() {
        // Crosses the rect with no vertex inside it
        let line = Geometry::line_string([(-5.0, 0.5), (5.0, 0.5)]);
        assert!(line.intersects_rect(&Rect::new(0.0, 0.0, 1.0, 1.0)));

        // Bounding boxes overlap but the line misses the rect
        let line = Geometry::line_string([(0.0, 3.0), (3.0, 0.0)]);
        assert!(!line.intersects_rect(&Rect::new(0.0, 0.0, 1.0, 1.0)));
    }

    #[test]
    fn test_rect_inside_polygon() {
        assert!(square().intersects_rect(&Rect::new(4.0, 4.0, 5.0, 5.0)));
        assert!(!square().intersects_rect(&Rect::new(11.0, 11.0, 12.0, 12.0)));
    }

    #[test]
    fn test_area_and_length() {
        assert_eq!(square().area(), 100.0);
        assert_eq!(square().perimeter(), 40.0);
        assert_eq!(square().length(), 0.0);
        let line = Geometry::line_string([(0.0, 0.0), (3.0, 4.0)]);
        assert_eq!(line.length(), 5.0);
        assert_eq!(line.area(), 0.0);
    }

    #[test]
    fn test_simplify_line() {
        let line = Geometry::line_string([(0.0, 0.0), (1.0, 0.1), (2.0, -0.1), (3.0, 5.0), (4.0, 6.0)]);
        let simplified = line.simplify(0.5);
        assert_eq!(
            simplified,
            Geometry::line_string([(0.0, 0.0), (2.0, -0.1), (3.0, 5.0), (4.0, 6.0)])
        );
        assert_eq!(line.simplify(0.0), line);
    }

    #[test]
    fn test_simplify_keeps_small_ring() {
        let tri = Geometry::polygon([(0.0, 0.0), (1.0, 0.0), (0.0, 1.0)]);
        assert_eq!(tri.simplify(100.0), tri);
    }
}
