use std::collections::HashMap;

use image::RgbaImage;
use rayon::prelude::*;

use super::shading::{self, Rgba};
use super::{DrawItem, Frame, LayerDraw, RenderBackend};
use crate::geometry::Point2D;
use crate::layer::{DisplayParams, LayerType, LayerVisibility, ResourceHandle};
use crate::texture::AuxTextureId;

struct CpuTexture {
    image: RgbaImage,
    interpolated: bool,
}

/// Software renderer. Also the reference the GPU path is tested against.
#[derive(Default)]
pub struct CpuRenderer {
    textures: HashMap<ResourceHandle, CpuTexture>,
    next_handle: u64,
}

impl CpuRenderer {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Read-only per-frame view handed to the row workers.
struct Pass<'a> {
    frame: &'a Frame<'a>,
    textures: &'a HashMap<ResourceHandle, CpuTexture>,
}

impl Pass<'_> {
    fn point(&self, col: u32, row: u32) -> Point2D {
        shading::canvas_point(col, row, self.frame.canvas, self.frame.output)
    }

    fn visible(&self, visibility: LayerVisibility, p: Point2D) -> bool {
        shading::lens_allows(visibility, self.frame.lens.as_ref(), p)
    }

    fn texture(&self, draw: &LayerDraw) -> Option<&CpuTexture> {
        let tex = self.textures.get(&draw.handle);
        if tex.is_none() {
            tracing::warn!(layer = %draw.id, handle = draw.handle.0, "draw references a released texture");
        }
        tex
    }

    /// Shaded color of a non-elemental layer at canvas point `p`.
    fn shade_layer(&self, draw: &LayerDraw, tex: &CpuTexture, p: Point2D) -> Option<Rgba> {
        if !self.visible(draw.params.visibility, p) {
            return None;
        }
        let (u, v) = shading::layer_uv(&draw.inverse, self.frame.canvas, p)?;
        let aux = self.frame.aux;
        match draw.kind {
            LayerType::Image => {
                let t = shading::sample(&tex.image, u, v, tex.interpolated && draw.interpolated);
                Some(shading::apply_display([t[0], t[1], t[2]], t[3], &draw.params))
            }
            LayerType::ColorSegmentation => {
                let binding = draw.auxiliary?;
                let green = shading::to_rgba8(shading::sample_nearest(&tex.image, u, v))[1];
                let rgb = shading::color_segmentation_color(
                    aux.get(AuxTextureId::ColorSegmentation),
                    binding.channel as u32,
                    green,
                )?;
                Some(shading::apply_display(rgb, 1.0, &draw.params))
            }
            LayerType::Selection => {
                let binding = draw.auxiliary?;
                let rgb = shading::selection_color(aux.get(binding.texture), u, v)?;
                Some(shading::apply_display(rgb, 1.0, &draw.params))
            }
            LayerType::Elemental => None,
        }
    }

    fn elemental(&self, draw: &LayerDraw, tex: &CpuTexture, p: Point2D) -> Option<Rgba> {
        let (u, v) = shading::layer_uv(&draw.inverse, self.frame.canvas, p)?;
        let raw = shading::sample(&tex.image, u, v, tex.interpolated && draw.interpolated)[0];
        let channel = draw.auxiliary?.channel as u32;
        shading::elemental_contribution(&self.frame.aux.elemental, channel, raw)
    }
}

fn width_of(frame: &Frame<'_>) -> usize {
    frame.output.width as usize
}

impl CpuRenderer {
    fn draw_layer(pass: &Pass<'_>, draw: &LayerDraw, target: &mut [Rgba]) {
        let Some(tex) = pass.texture(draw) else {
            return;
        };
        target
            .par_chunks_mut(width_of(pass.frame))
            .enumerate()
            .for_each(|(row, pixels)| {
                for (col, dst) in pixels.iter_mut().enumerate() {
                    let p = pass.point(col as u32, row as u32);
                    if let Some(src) = pass.shade_layer(draw, tex, p) {
                        *dst = shading::blend_over(*dst, src);
                    }
                }
            });
    }

    /// Additive pass into `accum`, max pass into `max`, then a normalize
    /// pass blended over `target`.
    fn draw_stack(pass: &Pass<'_>, layers: &[LayerDraw], params: &DisplayParams, target: &mut [Rgba]) {
        let width = width_of(pass.frame);
        let bound: Vec<(&LayerDraw, &CpuTexture)> = layers
            .iter()
            .filter_map(|d| pass.texture(d).map(|t| (d, t)))
            .collect();

        let mut accum = vec![[0.0f32; 4]; target.len()];
        accum.par_chunks_mut(width).enumerate().for_each(|(row, pixels)| {
            for (col, dst) in pixels.iter_mut().enumerate() {
                let p = pass.point(col as u32, row as u32);
                for (draw, tex) in &bound {
                    if let Some(c) = pass.elemental(draw, tex, p) {
                        for (d, c) in dst.iter_mut().zip(c) {
                            *d += c;
                        }
                    }
                }
            }
        });

        let mut max = vec![0.0f32; target.len()];
        max.par_chunks_mut(width).enumerate().for_each(|(row, pixels)| {
            for (col, dst) in pixels.iter_mut().enumerate() {
                let p = pass.point(col as u32, row as u32);
                for (draw, tex) in &bound {
                    if let Some(c) = pass.elemental(draw, tex, p) {
                        *dst = dst.max(c[3]);
                    }
                }
            }
        });

        target
            .par_chunks_mut(width)
            .zip(accum.par_chunks(width).zip(max.par_chunks(width)))
            .enumerate()
            .for_each(|(row, (pixels, (acc, mx)))| {
                for (col, dst) in pixels.iter_mut().enumerate() {
                    let p = pass.point(col as u32, row as u32);
                    if !pass.visible(params.visibility, p) {
                        continue;
                    }
                    if let Some((rgb, a)) = shading::normalize_elemental(acc[col], mx[col]) {
                        *dst = shading::blend_over(*dst, shading::apply_display(rgb, a, params));
                    }
                }
            });
    }
}

impl RenderBackend for CpuRenderer {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn upload(&mut self, image: &RgbaImage, interpolated: bool) -> anyhow::Result<ResourceHandle> {
        if image.width() == 0 || image.height() == 0 {
            anyhow::bail!("cannot upload an empty image");
        }
        self.next_handle += 1;
        let handle = ResourceHandle(self.next_handle);
        self.textures.insert(
            handle,
            CpuTexture {
                image: image.clone(),
                interpolated,
            },
        );
        Ok(handle)
    }

    fn release(&mut self, handle: ResourceHandle) {
        self.textures.remove(&handle);
    }

    fn resident_count(&self) -> usize {
        self.textures.len()
    }

    fn render(&mut self, frame: &Frame<'_>) -> anyhow::Result<RgbaImage> {
        let (w, h) = (frame.output.width, frame.output.height);
        let mut target = vec![[0.0f32; 4]; frame.output.pixel_count()];
        let pass = Pass {
            frame,
            textures: &self.textures,
        };
        for item in &frame.items {
            match item {
                DrawItem::Layer(draw) => Self::draw_layer(&pass, draw, &mut target),
                DrawItem::ElementalStack { layers, params } => {
                    Self::draw_stack(&pass, layers, params, &mut target)
                }
            }
        }

        let bytes: Vec<u8> = target.iter().flat_map(|px| shading::to_rgba8(*px)).collect();
        RgbaImage::from_raw(w, h, bytes)
            .ok_or_else(|| anyhow::anyhow!("output buffer does not match {w}x{h}"))
    }
}
