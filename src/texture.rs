use serde::{Deserialize, Serialize};

/// Columns of the elemental and color-segmentation lookup tables.
pub const LOOKUP_WIDTH: u32 = 256;
/// Row 0 holds channel colors, row 1 holds threshold pairs.
pub const ELEMENTAL_ROWS: u32 = 2;
/// One row per cluster index.
pub const COLOR_SEGMENTATION_ROWS: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuxTextureId {
    Elemental,
    ColorSegmentation,
    DrSelection,
    ImageSelection,
}

#[derive(Debug, Clone)]
/// Fixed-size RGBA byte grid used as a shader lookup table.
///
/// Never resized after creation. Every mutation bumps `revision` so renderers
/// know to re-upload on their next frame.
pub struct AuxiliaryDataTexture {
    width: u32,
    height: u32,
    data: Vec<u8>,
    revision: u64,
}

impl AuxiliaryDataTexture {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; width as usize * height as usize * 4],
            revision: 0,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    fn offset(&self, x: u32, y: u32) -> Option<usize> {
        (x < self.width && y < self.height)
            .then(|| (y as usize * self.width as usize + x as usize) * 4)
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        match self.offset(x, y) {
            Some(o) => [self.data[o], self.data[o + 1], self.data[o + 2], self.data[o + 3]],
            None => [0; 4],
        }
    }

    /// Writes a full texel. Out-of-range slots are ignored with a warning.
    pub fn set_pixel(&mut self, x: u32, y: u32, rgba: [u8; 4]) {
        let Some(o) = self.offset(x, y) else {
            tracing::warn!(x, y, width = self.width, height = self.height, "aux slot out of range");
            return;
        };
        self.data[o..o + 4].copy_from_slice(&rgba);
        self.mark_dirty();
    }

    /// Zeroes the alpha byte only; RGB stays as it was.
    pub fn clear_alpha(&mut self, x: u32, y: u32) {
        let Some(o) = self.offset(x, y) else {
            tracing::warn!(x, y, "aux slot out of range");
            return;
        };
        self.data[o + 3] = 0;
        self.mark_dirty();
    }

    pub fn alpha(&self, x: u32, y: u32) -> u8 {
        self.pixel(x, y)[3]
    }

    /// Replaces the whole buffer. Length must match; mismatches are dropped.
    pub fn replace(&mut self, data: &[u8]) {
        if data.len() != self.data.len() {
            tracing::error!(
                expected = self.data.len(),
                got = data.len(),
                "aux texture size mismatch"
            );
            return;
        }
        self.data.copy_from_slice(data);
        self.mark_dirty();
    }

    pub fn clear(&mut self) {
        self.data.fill(0);
        self.mark_dirty();
    }

    pub fn mark_dirty(&mut self) {
        self.revision = self.revision.wrapping_add(1);
    }

    /// Texel lookup by normalized coordinates, rows counted from the first row of `data`.
    pub fn sample_nearest(&self, u: f32, v: f32) -> [u8; 4] {
        if self.width == 0 || self.height == 0 {
            return [0; 4];
        }
        let x = ((u * self.width as f32).floor() as i64).clamp(0, self.width as i64 - 1);
        let y = ((v * self.height as f32).floor() as i64).clamp(0, self.height as i64 - 1);
        self.pixel(x as u32, y as u32)
    }
}

#[derive(Debug, Clone)]
/// The lookup tables owned by the compositor, one per modality.
pub struct AuxTextures {
    pub elemental: AuxiliaryDataTexture,
    pub color_segmentation: AuxiliaryDataTexture,
    pub dr_selection: AuxiliaryDataTexture,
    pub image_selection: AuxiliaryDataTexture,
}

impl AuxTextures {
    pub fn new(bitmask_size: u32) -> Self {
        Self {
            elemental: AuxiliaryDataTexture::new(LOOKUP_WIDTH, ELEMENTAL_ROWS),
            color_segmentation: AuxiliaryDataTexture::new(LOOKUP_WIDTH, COLOR_SEGMENTATION_ROWS),
            dr_selection: AuxiliaryDataTexture::new(bitmask_size, bitmask_size),
            image_selection: AuxiliaryDataTexture::new(bitmask_size, bitmask_size),
        }
    }

    pub fn get(&self, id: AuxTextureId) -> &AuxiliaryDataTexture {
        match id {
            AuxTextureId::Elemental => &self.elemental,
            AuxTextureId::ColorSegmentation => &self.color_segmentation,
            AuxTextureId::DrSelection => &self.dr_selection,
            AuxTextureId::ImageSelection => &self.image_selection,
        }
    }

    pub fn get_mut(&mut self, id: AuxTextureId) -> &mut AuxiliaryDataTexture {
        match id {
            AuxTextureId::Elemental => &mut self.elemental,
            AuxTextureId::ColorSegmentation => &mut self.color_segmentation,
            AuxTextureId::DrSelection => &mut self.dr_selection,
            AuxTextureId::ImageSelection => &mut self.image_selection,
        }
    }

    pub fn clear(&mut self) {
        for tex in [
            &mut self.elemental,
            &mut self.color_segmentation,
            &mut self.dr_selection,
            &mut self.image_selection,
        ] {
            tex.clear();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (AuxTextureId, &AuxiliaryDataTexture)> {
        [
            AuxTextureId::Elemental,
            AuxTextureId::ColorSegmentation,
            AuxTextureId::DrSelection,
            AuxTextureId::ImageSelection,
        ]
        .into_iter()
        .map(|id| (id, self.get(id)))
    }
}
