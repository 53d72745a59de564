use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
/// A point in some 2D coordinate space (image pixels, embedding pixels, canvas units).
pub struct Point2D {
    pub x: f64,
    pub y: f64,
}

impl Point2D {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

impl From<[f64; 2]> for Point2D {
    fn from([x, y]: [f64; 2]) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// Pixel dimensions of a raster.
///
/// The size endpoint answers with stringified integers, so deserialization
/// accepts both `"640"` and `640`.
pub struct Size {
    #[serde(deserialize_with = "lenient_u32")]
    pub width: u32,
    #[serde(deserialize_with = "lenient_u32")]
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Scales the size so that its longest edge equals `long_edge`.
    pub fn fit_long_edge(&self, long_edge: u32) -> Size {
        let longest = self.width.max(self.height).max(1) as f64;
        let factor = long_edge as f64 / longest;
        Size {
            width: ((self.width as f64 * factor).round() as u32).max(1),
            height: ((self.height as f64 * factor).round() as u32).max(1),
        }
    }
}

fn lenient_u32<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(u64),
        Float(f64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Int(v) => u32::try_from(v).map_err(serde::de::Error::custom),
        Raw::Float(v) if v >= 0.0 && v <= u32::MAX as f64 => Ok(v as u32),
        Raw::Float(v) => Err(serde::de::Error::custom(format!("size out of range: {v}"))),
        Raw::Text(s) => s
            .trim()
            .parse::<u32>()
            .map_err(|e| serde::de::Error::custom(format!("invalid size {s:?}: {e}"))),
    }
}

/// Orders two opposite rectangle corners into `[min, max]`.
pub fn sort_rectangle_points(p0: Point2D, p1: Point2D) -> [Point2D; 2] {
    [
        Point2D::new(p0.x.min(p1.x), p0.y.min(p1.y)),
        Point2D::new(p0.x.max(p1.x), p0.y.max(p1.y)),
    ]
}

/// Componentwise min/max over `points`. Returns `None` for an empty slice.
pub fn bounding_box(points: &[Point2D]) -> Option<[Point2D; 2]> {
    let first = *points.first()?;
    Some(points.iter().skip(1).fold([first, first], |[min, max], p| {
        [
            Point2D::new(min.x.min(p.x), min.y.min(p.y)),
            Point2D::new(max.x.max(p.x), max.y.max(p.y)),
        ]
    }))
}

/// Ray-casting point-in-polygon test.
///
/// An edge counts as crossed when `min(y) < p.y <= max(y)` and `p.x <= max(x)`.
/// The half-open y range decides what happens on vertices and horizontal edges,
/// so keep it exactly as is.
pub fn point_in_polygon(p: Point2D, polygon: &[Point2D]) -> bool {
    let Some(&first) = polygon.first() else {
        return false;
    };

    let mut inside = false;
    let mut a = first;
    for i in 1..=polygon.len() {
        let b = polygon[i % polygon.len()];

        if p.y > a.y.min(b.y) && p.y <= a.y.max(b.y) && p.x <= a.x.max(b.x) {
            // b.y != a.y here: the strict lower bound rules out horizontal edges.
            let x_intersection = (p.y - a.y) * (b.x - a.x) / (b.y - a.y) + a.x;
            if a.x == b.x || p.x <= x_intersection {
                inside = !inside;
            }
        }

        a = b;
    }

    inside
}

/// Half-open rectangle test: `min <= p < max` on both axes.
pub fn point_in_rectangle(p: Point2D, rect: &[Point2D; 2]) -> bool {
    let [min, max] = rect;
    min.x <= p.x && p.x < max.x && min.y <= p.y && p.y < max.y
}

/// Row-major index to pixel coordinates.
pub fn index_to_coordinates(index: usize, width: usize) -> Point2D {
    Point2D::new((index % width) as f64, (index / width) as f64)
}

/// Pixel coordinates to row-major index.
pub fn coordinates_to_index(x: usize, y: usize, width: usize) -> usize {
    y * width + x
}
