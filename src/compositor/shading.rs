//! Per-pixel math shared by the CPU renderer. The WGSL in `gpu.rs` mirrors
//! these functions one to one; keep them in sync.

use image::RgbaImage;

use crate::geometry::{Point2D, Size};
use crate::layer::{DisplayParams, Lens, LayerVisibility};
use crate::registering::Matrix3;
use crate::texture::AuxiliaryDataTexture;

/// Below this the max-intensity target counts as empty.
pub const INTENSITY_EPS: f32 = 1.0 / 1024.0;
const MIN_GAMMA: f32 = 1e-3;
const LUMA: [f32; 3] = [0.2126, 0.7152, 0.0722];

pub type Rgba = [f32; 4];

/// Contrast, saturation, gamma and brightness in that order, then opacity on alpha.
pub fn apply_display(rgb: [f32; 3], alpha: f32, p: &DisplayParams) -> Rgba {
    let mut c = rgb.map(|v| (v - 0.5) * p.contrast + 0.5);
    let luma = c[0] * LUMA[0] + c[1] * LUMA[1] + c[2] * LUMA[2];
    c = c.map(|v| luma + (v - luma) * p.saturation);
    let inv_gamma = 1.0 / p.gamma.max(MIN_GAMMA);
    c = c.map(|v| (v.max(0.0).powf(inv_gamma) + p.brightness).clamp(0.0, 1.0));
    [c[0], c[1], c[2], (alpha * p.opacity).clamp(0.0, 1.0)]
}

pub fn lens_allows(visibility: LayerVisibility, lens: Option<&Lens>, point: Point2D) -> bool {
    match visibility {
        LayerVisibility::Invisible => false,
        LayerVisibility::Visible => true,
        LayerVisibility::InsideLens => lens.is_some_and(|l| l.contains(point)),
        LayerVisibility::OutsideLens => !lens.is_some_and(|l| l.contains(point)),
    }
}

/// Remaps an intensity between the channel's lower and upper threshold.
pub fn threshold(intensity: f32, lo: f32, hi: f32) -> f32 {
    if hi <= lo {
        return intensity;
    }
    ((intensity - lo) / (hi - lo)).clamp(0.0, 1.0)
}

/// Canvas position (bottom-left origin) of the center of output pixel `(col, row)`.
pub fn canvas_point(col: u32, row: u32, canvas: Size, output: Size) -> Point2D {
    let sx = canvas.width as f64 / output.width as f64;
    let sy = canvas.height as f64 / output.height as f64;
    Point2D::new(
        (col as f64 + 0.5) * sx,
        canvas.height as f64 - (row as f64 + 0.5) * sy,
    )
}

/// Quad coordinates of a canvas point, or `None` outside the layer's quad.
pub fn layer_uv(inverse: &Matrix3, canvas: Size, point: Point2D) -> Option<(f32, f32)> {
    let (x, y) = inverse.transform_point(point.x, point.y)?;
    let u = x / canvas.width as f64;
    let v = y / canvas.height as f64;
    ((0.0..=1.0).contains(&u) && (0.0..=1.0).contains(&v)).then_some((u as f32, v as f32))
}

/// Normal alpha blending: `SrcAlpha, OneMinusSrcAlpha` on color, `One, OneMinusSrcAlpha` on alpha.
pub fn blend_over(dst: Rgba, src: Rgba) -> Rgba {
    let a = src[3];
    [
        src[0] * a + dst[0] * (1.0 - a),
        src[1] * a + dst[1] * (1.0 - a),
        src[2] * a + dst[2] * (1.0 - a),
        a + dst[3] * (1.0 - a),
    ]
}

fn texel(img: &RgbaImage, x: u32, y: u32) -> Rgba {
    let p = img.get_pixel(x, y).0;
    p.map(|c| c as f32 / 255.0)
}

/// Nearest-texel lookup. `v` counts from the bottom of the image.
pub fn sample_nearest(img: &RgbaImage, u: f32, v: f32) -> Rgba {
    texel(img, nearest_index(u, img.width()), nearest_index(1.0 - v, img.height()))
}

fn nearest_index(t: f32, n: u32) -> u32 {
    ((t * n as f32).floor().max(0.0) as u32).min(n.saturating_sub(1))
}

/// Clamp-to-edge bilinear lookup with texel-center alignment. `v` counts from the bottom.
pub fn sample_bilinear(img: &RgbaImage, u: f32, v: f32) -> Rgba {
    let (w, h) = img.dimensions();
    let x = u * w as f32 - 0.5;
    let y = (1.0 - v) * h as f32 - 0.5;
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;
    let clamp_x = |i: f32| (i.max(0.0) as u32).min(w - 1);
    let clamp_y = |i: f32| (i.max(0.0) as u32).min(h - 1);
    let (xa, xb) = (clamp_x(x0), clamp_x(x0 + 1.0));
    let (ya, yb) = (clamp_y(y0), clamp_y(y0 + 1.0));

    let tl = texel(img, xa, ya);
    let tr = texel(img, xb, ya);
    let bl = texel(img, xa, yb);
    let br = texel(img, xb, yb);
    std::array::from_fn(|i| {
        let top = tl[i] + (tr[i] - tl[i]) * fx;
        let bottom = bl[i] + (br[i] - bl[i]) * fx;
        top + (bottom - top) * fy
    })
}

pub fn sample(img: &RgbaImage, u: f32, v: f32, interpolated: bool) -> Rgba {
    if interpolated {
        sample_bilinear(img, u, v)
    } else {
        sample_nearest(img, u, v)
    }
}

fn aux_texel(aux: &AuxiliaryDataTexture, x: u32, y: u32) -> Rgba {
    aux.pixel(x, y).map(|c| c as f32 / 255.0)
}

/// Contribution of one elemental layer: `(intensity * color, intensity)`, or
/// nothing when its channel is disabled.
pub fn elemental_contribution(aux: &AuxiliaryDataTexture, channel: u32, raw: f32) -> Option<Rgba> {
    let color = aux_texel(aux, channel, 0);
    if color[3] == 0.0 {
        return None;
    }
    let bounds = aux_texel(aux, channel, 1);
    let i = threshold(raw, bounds[0], bounds[1]);
    Some([color[0] * i, color[1] * i, color[2] * i, i])
}

/// Divides accumulated color by the per-pixel maximum intensity.
pub fn normalize_elemental(accum: Rgba, max_intensity: f32) -> Option<([f32; 3], f32)> {
    if max_intensity <= INTENSITY_EPS {
        return None;
    }
    let rgb = [accum[0], accum[1], accum[2]].map(|c| (c / max_intensity).clamp(0.0, 1.0));
    Some((rgb, max_intensity.min(1.0)))
}

/// Cluster color for a segmentation texel. Green stores `cluster + 1`; 0 is unclustered.
pub fn color_segmentation_color(aux: &AuxiliaryDataTexture, element: u32, green: u8) -> Option<[f32; 3]> {
    let cluster = u32::from(green.checked_sub(1)?);
    let c = aux_texel(aux, element, cluster);
    (c[3] > 0.0).then_some([c[0], c[1], c[2]])
}

/// Highlight color at quad coordinates `(u, v)` of a selection bitmask.
pub fn selection_color(aux: &AuxiliaryDataTexture, u: f32, v: f32) -> Option<[f32; 3]> {
    let c = aux.sample_nearest(u, v);
    (c[3] > 0).then(|| [c[0], c[1], c[2]].map(|b| b as f32 / 255.0))
}

pub fn to_rgba8(px: Rgba) -> [u8; 4] {
    px.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8)
}
