use anyhow::{Context, anyhow};
use image::RgbaImage;

use crate::geometry::{Point2D, Size, coordinates_to_index};
use crate::selection::{SelectionArea, SelectionEvent, SelectionSpace};

/// Compact RGBA membership buffer, `size × size`, rows counted from the
/// bottom of the image.
#[derive(Debug, Clone, PartialEq)]
pub struct Bitmask {
    size: u32,
    data: Vec<u8>,
}

impl Bitmask {
    pub fn new(size: u32) -> Self {
        Self {
            size,
            data: vec![0; size as usize * size as usize * 4],
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    fn offset(&self, x: u32, y: u32) -> Option<usize> {
        (x < self.size && y < self.size)
            .then(|| coordinates_to_index(x as usize, y as usize, self.size as usize) * 4)
    }

    /// Alpha of one compact slot; 0 outside the mask.
    pub fn alpha(&self, x: u32, y: u32) -> u8 {
        self.offset(x, y).map_or(0, |o| self.data[o + 3])
    }

    pub fn selected_count(&self) -> usize {
        self.data.chunks_exact(4).filter(|px| px[3] != 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.selected_count() == 0
    }

    fn clear(&mut self) {
        self.data.fill(0);
    }

    /// Marks one compact slot. A slot that is already selected keeps its value.
    fn mark(&mut self, x: u32, y: u32, fill: [u8; 3]) {
        let Some(o) = self.offset(x, y) else {
            return;
        };
        if self.data[o + 3] != 0 {
            return;
        }
        self.data[o..o + 3].copy_from_slice(&fill);
        self.data[o + 3] = 255;
    }

    /// Marks the slot covering image pixel `(x, y)` (top-left origin) of an
    /// image with the given size.
    fn mark_image_pixel(&mut self, x: u32, y: u32, image: Size, fill: [u8; 3]) {
        if x >= image.width || y >= image.height {
            return;
        }
        let flipped = image.height - 1 - y;
        let c = self.size as u64;
        let cx = (x as u64 * c / image.width as u64) as u32;
        let cy = (flipped as u64 * c / image.height as u64) as u32;
        self.mark(cx, cy, fill);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingEntry {
    pub image: (u32, u32),
    pub embedding: (u32, u32),
}

#[derive(Debug, Clone, PartialEq)]
/// Correspondence between image pixels and embedding pixels.
pub struct EmbeddingMapping {
    image_size: Size,
    entries: Vec<MappingEntry>,
}

impl EmbeddingMapping {
    /// Decodes the mapping raster: a pixel with blue 255 at `(x, y)` sits at
    /// embedding point `(red, green)`.
    pub fn from_middle_image(img: &RgbaImage) -> Self {
        let entries = img
            .enumerate_pixels()
            .filter(|(_, _, px)| px[2] == 255)
            .map(|(x, y, px)| MappingEntry {
                image: (x, y),
                embedding: (px[0] as u32, px[1] as u32),
            })
            .collect();
        Self {
            image_size: Size::new(img.width(), img.height()),
            entries,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        let img = image::load_from_memory(bytes).context("failed to decode embedding mapping")?;
        Ok(Self::from_middle_image(&img.into_rgba8()))
    }

    pub fn image_size(&self) -> Size {
        self.image_size
    }

    pub fn entries(&self) -> &[MappingEntry] {
        &self.entries
    }
}

/// Integer pixel window `[x0, x1] × [y0, y1]` covering a selection's bounds,
/// clipped to `limit`.
struct ScanWindow {
    x0: u32,
    y0: u32,
    x1: u32,
    y1: u32,
}

impl ScanWindow {
    fn new([min, max]: [Point2D; 2], limit: Size) -> Option<Self> {
        if limit.is_empty() || max.x < 0.0 || max.y < 0.0 {
            return None;
        }
        let x0 = min.x.ceil().max(0.0) as u32;
        let y0 = min.y.ceil().max(0.0) as u32;
        let x1 = (max.x.floor() as u32).min(limit.width - 1);
        let y1 = (max.y.floor() as u32).min(limit.height - 1);
        (x0 <= x1 && y0 <= y1).then_some(Self { x0, y0, x1, y1 })
    }

    fn width(&self) -> usize {
        (self.x1 - self.x0 + 1) as usize
    }

    fn contains(&self, x: u32, y: u32) -> bool {
        (self.x0..=self.x1).contains(&x) && (self.y0..=self.y1).contains(&y)
    }

    fn pixels(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        (self.y0..=self.y1).flat_map(move |y| (self.x0..=self.x1).map(move |x| (x, y)))
    }
}

/// Turns selections into compact bitmasks over the base image.
pub struct SelectionMapper {
    compact_size: u32,
    fill: [u8; 3],
    canvas: Option<Size>,
    embedding_limit: Size,
    mapping: Option<EmbeddingMapping>,
    dr: Bitmask,
    image: Bitmask,
}

impl SelectionMapper {
    pub fn new(compact_size: u32, fill: [u8; 3]) -> Self {
        Self {
            compact_size,
            fill,
            canvas: None,
            // Mapping stores embedding coordinates as bytes.
            embedding_limit: Size::new(256, 256),
            mapping: None,
            dr: Bitmask::new(compact_size),
            image: Bitmask::new(compact_size),
        }
    }

    pub fn compact_size(&self) -> u32 {
        self.compact_size
    }

    pub fn fill(&self) -> [u8; 3] {
        self.fill
    }

    pub fn set_canvas(&mut self, canvas: Size) {
        self.canvas = Some(canvas);
    }

    pub fn set_mapping(&mut self, mapping: EmbeddingMapping) {
        tracing::info!(entries = mapping.entries().len(), "loaded embedding mapping");
        self.mapping = Some(mapping);
    }

    pub fn has_mapping(&self) -> bool {
        self.mapping.is_some()
    }

    pub fn bitmask(&self, space: SelectionSpace) -> &Bitmask {
        match space {
            SelectionSpace::Embedding => &self.dr,
            SelectionSpace::ImageViewer => &self.image,
        }
    }

    /// Drops the current selection in `space`.
    pub fn clear(&mut self, space: SelectionSpace) -> &Bitmask {
        let mask = self.bitmask_mut(space);
        mask.clear();
        mask
    }

    fn bitmask_mut(&mut self, space: SelectionSpace) -> &mut Bitmask {
        match space {
            SelectionSpace::Embedding => &mut self.dr,
            SelectionSpace::ImageViewer => &mut self.image,
        }
    }

    /// Replaces the selection for the event's space and rebuilds its bitmask.
    ///
    /// Malformed selections and missing inputs are rejected and leave the
    /// previous bitmask untouched.
    pub fn rebuild(&mut self, event: &SelectionEvent) -> anyhow::Result<&Bitmask> {
        let area = SelectionArea::try_from(event)?;
        let fill = self.fill;

        match event.space {
            SelectionSpace::ImageViewer => {
                let canvas = self
                    .canvas
                    .ok_or_else(|| anyhow!("image size unknown, cannot map selection"))?;
                let window = ScanWindow::new(area.bounds(), canvas);
                let mask = &mut self.image;
                mask.clear();
                if let Some(window) = window {
                    for (x, y) in window.pixels() {
                        if area.contains(Point2D::new(x as f64, y as f64)) {
                            mask.mark_image_pixel(x, y, canvas, fill);
                        }
                    }
                }
                Ok(&self.image)
            }
            SelectionSpace::Embedding => {
                let mapping = self
                    .mapping
                    .as_ref()
                    .ok_or_else(|| anyhow!("embedding mapping not loaded"))?;
                let mask = &mut self.dr;
                mask.clear();
                if let Some(window) = ScanWindow::new(area.bounds(), self.embedding_limit) {
                    let inside: Vec<bool> = window
                        .pixels()
                        .map(|(x, y)| area.contains(Point2D::new(x as f64, y as f64)))
                        .collect();
                    for entry in mapping.entries() {
                        let (ex, ey) = entry.embedding;
                        if !window.contains(ex, ey) {
                            continue;
                        }
                        let i = coordinates_to_index(
                            (ex - window.x0) as usize,
                            (ey - window.y0) as usize,
                            window.width(),
                        );
                        if inside[i] {
                            let (ix, iy) = entry.image;
                            mask.mark_image_pixel(ix, iy, mapping.image_size(), fill);
                        }
                    }
                }
                Ok(&self.dr)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selection::SelectionKind;
    use image::Rgba;

    const FILL: [u8; 3] = [255, 239, 0];

    fn pt(x: f64, y: f64) -> Point2D {
        Point2D::new(x, y)
    }

    fn event(space: SelectionSpace, kind: SelectionKind, points: Vec<Point2D>) -> SelectionEvent {
        SelectionEvent {
            space,
            kind,
            points,
        }
    }

    #[test]
    fn rectangle_in_image_space_marks_flipped_region() {
        let mut mapper = SelectionMapper::new(4, FILL);
        mapper.set_canvas(Size::new(4, 4));
        let mask = mapper
            .rebuild(&event(
                SelectionSpace::ImageViewer,
                SelectionKind::Rectangle,
                vec![pt(0.0, 0.0), pt(2.0, 1.0)],
            ))
            .unwrap();
        // Half-open: pixels (0,0) and (1,0) of the top row.
        assert_eq!(mask.selected_count(), 2);
        // Top image row is the last bitmask row.
        assert_eq!(mask.alpha(0, 3), 255);
        assert_eq!(mask.alpha(1, 3), 255);
        assert_eq!(mask.alpha(0, 0), 0);
        assert_eq!(&mask.data()[(3 * 4) * 4..(3 * 4) * 4 + 3], &FILL);
    }

    #[test]
    fn compact_downscale_merges_pixels() {
        let mut mapper = SelectionMapper::new(2, FILL);
        mapper.set_canvas(Size::new(8, 8));
        let mask = mapper
            .rebuild(&event(
                SelectionSpace::ImageViewer,
                SelectionKind::Rectangle,
                vec![pt(0.0, 0.0), pt(8.0, 8.0)],
            ))
            .unwrap();
        assert_eq!(mask.selected_count(), 4);
    }

    #[test]
    fn invalid_selection_keeps_previous_bitmask() {
        let mut mapper = SelectionMapper::new(4, FILL);
        mapper.set_canvas(Size::new(4, 4));
        mapper
            .rebuild(&event(
                SelectionSpace::ImageViewer,
                SelectionKind::Rectangle,
                vec![pt(0.0, 0.0), pt(4.0, 4.0)],
            ))
            .unwrap();
        let before = mapper.bitmask(SelectionSpace::ImageViewer).clone();

        let err = mapper.rebuild(&event(
            SelectionSpace::ImageViewer,
            SelectionKind::Polygon,
            vec![pt(0.0, 0.0), pt(1.0, 1.0)],
        ));
        assert!(err.is_err());
        assert_eq!(mapper.bitmask(SelectionSpace::ImageViewer), &before);
        assert_eq!(before.selected_count(), 16);
    }

    #[test]
    fn selection_outside_canvas_is_empty() {
        let mut mapper = SelectionMapper::new(4, FILL);
        mapper.set_canvas(Size::new(4, 4));
        let mask = mapper
            .rebuild(&event(
                SelectionSpace::ImageViewer,
                SelectionKind::Rectangle,
                vec![pt(10.0, 10.0), pt(20.0, 20.0)],
            ))
            .unwrap();
        assert!(mask.is_empty());
    }

    #[test]
    fn scan_window_covers_integer_pixels_inside_bounds() {
        let window = ScanWindow::new([pt(1.5, 2.0), pt(3.2, 5.9)], Size::new(16, 16)).unwrap();
        assert_eq!((window.x0, window.y0, window.x1, window.y1), (2, 2, 3, 5));
        assert_eq!(window.pixels().count(), 8);
        assert!(window.pixels().all(|(x, y)| window.contains(x, y)));

        let clipped = ScanWindow::new([pt(-4.0, -4.0), pt(40.0, 2.0)], Size::new(16, 16)).unwrap();
        assert_eq!(clipped.pixels().count(), 16 * 3);
        assert!(ScanWindow::new([pt(-4.0, -4.0), pt(-1.0, -1.0)], Size::new(16, 16)).is_none());
    }

    #[test]
    fn corner_selection_leaves_rest_of_mask_untouched() {
        let mut mapper = SelectionMapper::new(16, FILL);
        mapper.set_canvas(Size::new(16, 16));
        let mask = mapper
            .rebuild(&event(
                SelectionSpace::ImageViewer,
                SelectionKind::Polygon,
                vec![pt(12.0, 12.0), pt(15.5, 12.0), pt(15.5, 15.5)],
            ))
            .unwrap();
        assert!(!mask.is_empty());
        // Image rows 12..=15 are compact rows 0..=3.
        for y in 0..16 {
            for x in 0..16 {
                if mask.alpha(x, y) != 0 {
                    assert!(x >= 12 && y <= 3, "({x}, {y}) outside the selection window");
                }
            }
        }
    }

    #[test]
    fn bitmask_reads_outside_the_mask_are_empty() {
        let mut mask = Bitmask::new(2);
        mask.mark(1, 1, FILL);
        assert_eq!(mask.alpha(1, 1), 255);
        assert_eq!(mask.alpha(2, 0), 0);
        assert_eq!(mask.alpha(0, 9), 0);

        let mut empty = Bitmask::new(0);
        empty.mark_image_pixel(0, 0, Size::new(4, 4), FILL);
        assert!(empty.is_empty());
    }

    fn mapping() -> EmbeddingMapping {
        // 4×4 image; pixel (x, y) sits at embedding (10 * x, 10 * y) except the
        // bottom row, which is not part of the embedding.
        let img = RgbaImage::from_fn(4, 4, |x, y| {
            if y == 3 {
                Rgba([0, 0, 0, 255])
            } else {
                Rgba([(10 * x) as u8, (10 * y) as u8, 255, 255])
            }
        });
        EmbeddingMapping::from_middle_image(&img)
    }

    #[test]
    fn middle_image_decodes_blue_marked_pixels() {
        let m = mapping();
        assert_eq!(m.image_size(), Size::new(4, 4));
        assert_eq!(m.entries().len(), 12);
        assert!(m.entries().contains(&MappingEntry {
            image: (2, 1),
            embedding: (20, 10),
        }));
    }

    #[test]
    fn embedding_polygon_maps_into_image_space() {
        let mut mapper = SelectionMapper::new(4, FILL);
        mapper.set_mapping(mapping());
        // Covers embedding points (10, 10) and (20, 10) only.
        let mask = mapper
            .rebuild(&event(
                SelectionSpace::Embedding,
                SelectionKind::Polygon,
                vec![pt(5.0, 5.0), pt(28.0, 5.0), pt(16.0, 20.0)],
            ))
            .unwrap();
        // Image pixels (1,1) and (2,1); flipped row = 2.
        assert_eq!(mask.selected_count(), 2);
        assert_eq!(mask.alpha(1, 2), 255);
        assert_eq!(mask.alpha(2, 2), 255);
        assert_eq!(mask.alpha(0, 3), 0);
    }

    #[test]
    fn embedding_selection_without_mapping_is_rejected() {
        let mut mapper = SelectionMapper::new(4, FILL);
        assert!(
            mapper
                .rebuild(&event(
                    SelectionSpace::Embedding,
                    SelectionKind::Rectangle,
                    vec![pt(0.0, 0.0), pt(1.0, 1.0)],
                ))
                .is_err()
        );
        assert!(mapper.bitmask(SelectionSpace::Embedding).is_empty());
    }

    #[test]
    fn rebuild_replaces_previous_selection() {
        let mut mapper = SelectionMapper::new(4, FILL);
        mapper.set_canvas(Size::new(4, 4));
        let rect = |a: Point2D, b: Point2D| {
            event(SelectionSpace::ImageViewer, SelectionKind::Rectangle, vec![a, b])
        };
        mapper.rebuild(&rect(pt(0.0, 0.0), pt(1.0, 1.0))).unwrap();
        let mask = mapper.rebuild(&rect(pt(3.0, 3.0), pt(4.0, 4.0))).unwrap();
        assert_eq!(mask.selected_count(), 1);
        assert_eq!(mask.alpha(3, 0), 255);
        assert!(mapper.clear(SelectionSpace::ImageViewer).is_empty());
    }
}
