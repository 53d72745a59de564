use anyhow::bail;
use serde::{Deserialize, Serialize};

use crate::geometry::{
    Point2D, bounding_box, point_in_polygon, point_in_rectangle, sort_rectangle_points,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionKind {
    Rectangle,
    #[serde(alias = "lasso")]
    Polygon,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Coordinate space a selection was drawn in.
pub enum SelectionSpace {
    /// Pixel space of the base image, top-left origin.
    ImageViewer,
    /// Pixel space of the dimensionality-reduction embedding, top-left origin.
    Embedding,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A raw selection as it arrives from user interaction. Not yet validated.
pub struct SelectionEvent {
    pub space: SelectionSpace,
    pub kind: SelectionKind,
    #[serde(default)]
    pub points: Vec<Point2D>,
}

#[derive(Debug, Clone, PartialEq)]
/// A validated selection.
///
/// Rectangles always hold `[min, max]`. Polygons hold at least three vertices.
pub enum SelectionArea {
    Rectangle([Point2D; 2]),
    Polygon(Vec<Point2D>),
}

impl SelectionArea {
    /// The scan region: the rectangle itself, or the polygon's bounding box.
    pub fn bounds(&self) -> [Point2D; 2] {
        match self {
            SelectionArea::Rectangle(rect) => *rect,
            // Polygons have >= 3 points by construction.
            SelectionArea::Polygon(points) => bounding_box(points).unwrap_or_default(),
        }
    }

    pub fn contains(&self, p: Point2D) -> bool {
        match self {
            SelectionArea::Rectangle(rect) => point_in_rectangle(p, rect),
            SelectionArea::Polygon(points) => point_in_polygon(p, points),
        }
    }
}

impl TryFrom<&SelectionEvent> for SelectionArea {
    type Error = anyhow::Error;

    fn try_from(event: &SelectionEvent) -> anyhow::Result<Self> {
        match event.kind {
            SelectionKind::Rectangle => {
                let &[p0, p1] = event.points.as_slice() else {
                    bail!(
                        "rectangle selection needs exactly 2 points, got {}",
                        event.points.len()
                    );
                };
                Ok(SelectionArea::Rectangle(sort_rectangle_points(p0, p1)))
            }
            SelectionKind::Polygon => {
                if event.points.len() < 3 {
                    bail!(
                        "polygon selection needs at least 3 points, got {}",
                        event.points.len()
                    );
                }
                Ok(SelectionArea::Polygon(event.points.clone()))
            }
        }
    }
}

/// Mirrors a selection vertically inside a raster of the given height (`y -> height - y`).
pub fn flip_selection(area: &SelectionArea, height: f64) -> SelectionArea {
    let flip = |p: &Point2D| Point2D::new(p.x, height - p.y);
    match area {
        SelectionArea::Rectangle([a, b]) => {
            SelectionArea::Rectangle(sort_rectangle_points(flip(a), flip(b)))
        }
        SelectionArea::Polygon(points) => SelectionArea::Polygon(points.iter().map(flip).collect()),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Per-element channel selection for the elemental modality.
pub struct ElementSelection {
    pub channel: usize,
    pub selected: bool,
    pub color: String,
    #[serde(default = "default_thresholds")]
    pub thresholds: [f32; 2],
}

fn default_thresholds() -> [f32; 2] {
    [0.0, 1.0]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// One cluster of one element's color segmentation.
///
/// `element` indexes the element column; the image-wide clustering uses
/// [`crate::workspace::IMAGE_CLUSTER_SLOT`].
pub struct ColorSegmentationSelection {
    pub element: usize,
    pub cluster: usize,
    pub selected: bool,
    pub color: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pt(x: f64, y: f64) -> Point2D {
        Point2D::new(x, y)
    }

    fn event(kind: SelectionKind, points: Vec<Point2D>) -> SelectionEvent {
        SelectionEvent {
            space: SelectionSpace::ImageViewer,
            kind,
            points,
        }
    }

    #[test]
    fn rectangle_events_are_normalized() {
        let area =
            SelectionArea::try_from(&event(SelectionKind::Rectangle, vec![pt(30.0, 40.0), pt(10.0, 20.0)]))
                .unwrap();
        assert_eq!(area, SelectionArea::Rectangle([pt(10.0, 20.0), pt(30.0, 40.0)]));
        assert_eq!(area.bounds(), [pt(10.0, 20.0), pt(30.0, 40.0)]);
    }

    #[test]
    fn malformed_events_are_rejected() {
        assert!(SelectionArea::try_from(&event(SelectionKind::Rectangle, vec![pt(0.0, 0.0)])).is_err());
        assert!(
            SelectionArea::try_from(&event(
                SelectionKind::Rectangle,
                vec![pt(0.0, 0.0), pt(1.0, 1.0), pt(2.0, 2.0)]
            ))
            .is_err()
        );
        assert!(
            SelectionArea::try_from(&event(SelectionKind::Polygon, vec![pt(0.0, 0.0), pt(1.0, 1.0)]))
                .is_err()
        );
    }

    #[test]
    fn flips_polygon() {
        let area = SelectionArea::Polygon(vec![pt(10.0, 20.0), pt(30.0, 40.0), pt(50.0, 60.0)]);
        assert_eq!(
            flip_selection(&area, 100.0),
            SelectionArea::Polygon(vec![pt(10.0, 80.0), pt(30.0, 60.0), pt(50.0, 40.0)])
        );
    }

    #[test]
    fn flips_rectangle_and_keeps_it_sorted() {
        let area = SelectionArea::Rectangle([pt(10.0, 20.0), pt(30.0, 40.0)]);
        assert_eq!(
            flip_selection(&area, 100.0),
            SelectionArea::Rectangle([pt(10.0, 60.0), pt(30.0, 80.0)])
        );
    }

    #[test]
    fn flipping_twice_is_identity() {
        let area = SelectionArea::Polygon(vec![pt(1.0, 2.0), pt(3.0, 9.0), pt(7.0, 4.0)]);
        assert_eq!(flip_selection(&flip_selection(&area, 50.0), 50.0), area);
    }

    #[test]
    fn lasso_is_an_alias_for_polygon() {
        let json = r#"{"space":"embedding","kind":"lasso","points":[{"x":0,"y":0},{"x":4,"y":0},{"x":2,"y":3}]}"#;
        let ev: SelectionEvent = serde_json::from_str(json).unwrap();
        assert_eq!(ev.kind, SelectionKind::Polygon);
        assert_eq!(ev.space, SelectionSpace::Embedding);
        let area = SelectionArea::try_from(&ev).unwrap();
        assert!(area.contains(pt(2.0, 1.0)));
        assert_eq!(area.bounds(), [pt(0.0, 0.0), pt(4.0, 3.0)]);
    }

    #[test]
    fn element_selection_defaults_thresholds() {
        let sel: ElementSelection =
            serde_json::from_str(r##"{"channel":3,"selected":true,"color":"#ff0000"}"##).unwrap();
        assert_eq!(sel.thresholds, [0.0, 1.0]);
    }
}
