use serde::{Deserialize, Serialize};

use crate::compositor::RenderBackend;
use crate::geometry::{Point2D, Size};
use crate::registering::Matrix3;
use crate::texture::AuxTextureId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerType {
    Image,
    Elemental,
    ColorSegmentation,
    Selection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Where a layer is drawn relative to the lens.
pub enum LayerVisibility {
    #[default]
    Invisible,
    Visible,
    InsideLens,
    OutsideLens,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
/// Circular magnifier in canvas coordinates (bottom-left origin).
pub struct Lens {
    pub center: Point2D,
    pub radius: f64,
}

impl Lens {
    pub fn contains(&self, p: Point2D) -> bool {
        let dx = p.x - self.center.x;
        let dy = p.y - self.center.y;
        dx * dx + dy * dy <= self.radius * self.radius
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
/// Per-layer copy of the owning group's shared parameters.
pub struct DisplayParams {
    pub index: i32,
    pub visibility: LayerVisibility,
    pub opacity: f32,
    pub contrast: f32,
    pub saturation: f32,
    pub gamma: f32,
    pub brightness: f32,
}

impl Default for DisplayParams {
    fn default() -> Self {
        Self {
            index: 0,
            visibility: LayerVisibility::Invisible,
            opacity: 1.0,
            contrast: 1.0,
            saturation: 1.0,
            gamma: 1.0,
            brightness: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Ties a data layer to its lookup table slot.
pub struct AuxiliaryBinding {
    pub texture: AuxTextureId,
    pub channel: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// Fetched through the resource fetcher.
    Remote(String),
    /// Pixels come entirely from an auxiliary texture; a 1×1 placeholder is bound.
    Auxiliary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// Opaque backend texture id.
pub struct ResourceHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderResource {
    pub handle: ResourceHandle,
    pub render_order: i32,
    /// Quad size; always the target canvas, never the source image.
    pub quad: Size,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderState {
    #[default]
    Unloaded,
    /// A background load is in flight. Results carrying another ticket are stale.
    Pending { ticket: u64 },
    Loaded(RenderResource),
}

#[derive(Debug, Clone)]
pub struct Layer {
    pub id: String,
    pub source: ImageSource,
    pub kind: LayerType,
    pub auxiliary: Option<AuxiliaryBinding>,
    pub transform: Matrix3,
    pub params: DisplayParams,
    pub interpolated: bool,
    pub render: RenderState,
}

impl Layer {
    pub fn new(id: impl Into<String>, source: ImageSource, kind: LayerType) -> Self {
        Self {
            id: id.into(),
            source,
            kind,
            auxiliary: None,
            transform: Matrix3::IDENTITY,
            params: DisplayParams::default(),
            interpolated: true,
            render: RenderState::Unloaded,
        }
    }

    pub fn with_auxiliary(mut self, texture: AuxTextureId, channel: usize) -> Self {
        self.auxiliary = Some(AuxiliaryBinding { texture, channel });
        self
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.render, RenderState::Loaded(_))
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.render, RenderState::Pending { .. })
    }

    pub fn resource(&self) -> Option<&RenderResource> {
        match &self.render {
            RenderState::Loaded(res) => Some(res),
            _ => None,
        }
    }

    /// Releases the render resource, if any. Safe to call repeatedly.
    ///
    /// Id, transform and display parameters survive so the layer can be
    /// reloaded later. Returns whether a resource was actually freed.
    pub fn dispose(&mut self, backend: &mut dyn RenderBackend) -> bool {
        match std::mem::take(&mut self.render) {
            RenderState::Loaded(res) => {
                backend.release(res.handle);
                tracing::debug!(layer = %self.id, handle = res.handle.0, "disposed layer");
                true
            }
            RenderState::Pending { .. } => {
                tracing::debug!(layer = %self.id, "cancelled pending load");
                false
            }
            RenderState::Unloaded => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupParameter {
    Opacity,
    Contrast,
    Saturation,
    Gamma,
    Brightness,
}

impl GroupParameter {
    pub const ALL: [GroupParameter; 5] = [
        GroupParameter::Opacity,
        GroupParameter::Contrast,
        GroupParameter::Saturation,
        GroupParameter::Gamma,
        GroupParameter::Brightness,
    ];

    /// Parses a parameter name from external input. Unknown names return `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "opacity" => Some(GroupParameter::Opacity),
            "contrast" => Some(GroupParameter::Contrast),
            "saturation" => Some(GroupParameter::Saturation),
            "gamma" => Some(GroupParameter::Gamma),
            "brightness" => Some(GroupParameter::Brightness),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
/// Layers of one modality sharing display parameters and draw order.
pub struct LayerGroup {
    pub key: String,
    pub name: String,
    pub description: String,
    pub layers: Vec<Layer>,
    pub index: i32,
    pub visible: bool,
    pub visibility: LayerVisibility,
    pub opacity: f32,
    pub contrast: f32,
    pub saturation: f32,
    pub gamma: f32,
    pub brightness: f32,
}

impl LayerGroup {
    /// A group with the shared defaults: visible scope, neutral look.
    pub fn new(key: impl Into<String>, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            description: description.into(),
            layers: Vec::new(),
            index: 0,
            visible: true,
            visibility: LayerVisibility::Visible,
            opacity: 1.0,
            contrast: 1.0,
            saturation: 1.0,
            gamma: 1.0,
            brightness: 0.0,
        }
    }

    pub fn parameter(&self, param: GroupParameter) -> f32 {
        match param {
            GroupParameter::Opacity => self.opacity,
            GroupParameter::Contrast => self.contrast,
            GroupParameter::Saturation => self.saturation,
            GroupParameter::Gamma => self.gamma,
            GroupParameter::Brightness => self.brightness,
        }
    }

    pub fn set_parameter(&mut self, param: GroupParameter, value: f32) {
        let slot = match param {
            GroupParameter::Opacity => &mut self.opacity,
            GroupParameter::Contrast => &mut self.contrast,
            GroupParameter::Saturation => &mut self.saturation,
            GroupParameter::Gamma => &mut self.gamma,
            GroupParameter::Brightness => &mut self.brightness,
        };
        *slot = value;
    }

    pub fn effective_visibility(&self) -> LayerVisibility {
        if self.visible {
            self.visibility
        } else {
            LayerVisibility::Invisible
        }
    }

    pub fn layer(&self, id: &str) -> Option<&Layer> {
        self.layers.iter().find(|l| l.id == id)
    }

    pub fn layer_mut(&mut self, id: &str) -> Option<&mut Layer> {
        self.layers.iter_mut().find(|l| l.id == id)
    }
}

/// Pushes one shared value from the group to every member layer.
pub fn update_group_parameter(group: &mut LayerGroup, param: GroupParameter) {
    let value = group.parameter(param);
    for layer in &mut group.layers {
        let slot = match param {
            GroupParameter::Opacity => &mut layer.params.opacity,
            GroupParameter::Contrast => &mut layer.params.contrast,
            GroupParameter::Saturation => &mut layer.params.saturation,
            GroupParameter::Gamma => &mut layer.params.gamma,
            GroupParameter::Brightness => &mut layer.params.brightness,
        };
        *slot = value;
    }
}

pub fn update_group_visibility(group: &mut LayerGroup) {
    let visibility = group.effective_visibility();
    for layer in &mut group.layers {
        layer.params.visibility = visibility;
    }
}

/// Pushes the z-index and recomputes render order (`-index`) of resident layers.
pub fn update_group_index(group: &mut LayerGroup) {
    let index = group.index;
    for layer in &mut group.layers {
        layer.params.index = index;
        if let RenderState::Loaded(res) = &mut layer.render {
            res.render_order = render_order_for(index);
        }
    }
}

/// Pushes every shared value; used after creating or replacing a group.
pub fn update_group_layers(group: &mut LayerGroup) {
    update_group_index(group);
    update_group_visibility(group);
    for param in GroupParameter::ALL {
        update_group_parameter(group, param);
    }
}

pub fn render_order_for(index: i32) -> i32 {
    -index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compositor::cpu::CpuRenderer;
    use image::RgbaImage;

    fn loaded_layer(backend: &mut CpuRenderer, id: &str) -> Layer {
        let mut layer = Layer::new(id, ImageSource::Remote(format!("{id}.png")), LayerType::Image);
        let handle = backend
            .upload(&RgbaImage::new(2, 2), true)
            .expect("cpu upload");
        layer.render = RenderState::Loaded(RenderResource {
            handle,
            render_order: 0,
            quad: Size::new(2, 2),
        });
        layer
    }

    #[test]
    fn dispose_is_idempotent_and_keeps_identity() {
        let mut backend = CpuRenderer::new();
        let mut layer = loaded_layer(&mut backend, "base");
        layer.transform = Matrix3([2.0, 0.0, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 1.0]);
        layer.params.opacity = 0.3;
        assert_eq!(backend.resident_count(), 1);

        assert!(layer.dispose(&mut backend));
        assert!(!layer.dispose(&mut backend));
        assert_eq!(backend.resident_count(), 0);
        assert_eq!(layer.render, RenderState::Unloaded);
        assert_eq!(layer.id, "base");
        assert_eq!(layer.params.opacity, 0.3);
        assert_eq!(layer.transform.0[0], 2.0);
    }

    #[test]
    fn dispose_cancels_pending_load() {
        let mut backend = CpuRenderer::new();
        let mut layer = Layer::new("x", ImageSource::Auxiliary, LayerType::Selection);
        layer.render = RenderState::Pending { ticket: 4 };
        assert!(!layer.dispose(&mut backend));
        assert_eq!(layer.render, RenderState::Unloaded);
    }

    #[test]
    fn group_parameters_propagate_to_all_layers() {
        let mut group = LayerGroup::new("g", "G", "test");
        group.layers.push(Layer::new("a", ImageSource::Auxiliary, LayerType::Image));
        group.layers.push(Layer::new("b", ImageSource::Auxiliary, LayerType::Image));
        group.set_parameter(GroupParameter::Gamma, 2.2);
        update_group_parameter(&mut group, GroupParameter::Gamma);
        assert!(group.layers.iter().all(|l| l.params.gamma == 2.2));
        // Untouched parameters keep their defaults.
        assert!(group.layers.iter().all(|l| l.params.contrast == 1.0));
    }

    #[test]
    fn hidden_group_forces_invisible() {
        let mut group = LayerGroup::new("g", "G", "test");
        group.layers.push(Layer::new("a", ImageSource::Auxiliary, LayerType::Image));
        group.visibility = LayerVisibility::InsideLens;
        update_group_visibility(&mut group);
        assert_eq!(group.layers[0].params.visibility, LayerVisibility::InsideLens);

        group.visible = false;
        update_group_visibility(&mut group);
        assert_eq!(group.layers[0].params.visibility, LayerVisibility::Invisible);
    }

    #[test]
    fn index_updates_render_order_of_loaded_layers() {
        let mut backend = CpuRenderer::new();
        let mut group = LayerGroup::new("g", "G", "test");
        group.layers.push(loaded_layer(&mut backend, "a"));
        group.layers.push(Layer::new("b", ImageSource::Auxiliary, LayerType::Image));
        group.index = -2;
        update_group_index(&mut group);
        assert_eq!(group.layers[0].resource().map(|r| r.render_order), Some(2));
        assert!(group.layers.iter().all(|l| l.params.index == -2));
    }

    #[test]
    fn parameter_names_parse_case_insensitively() {
        assert_eq!(GroupParameter::from_name("Opacity"), Some(GroupParameter::Opacity));
        assert_eq!(GroupParameter::from_name(" gamma "), Some(GroupParameter::Gamma));
        assert_eq!(GroupParameter::from_name("hue"), None);
    }

    #[test]
    fn lens_contains_boundary() {
        let lens = Lens {
            center: Point2D::new(10.0, 10.0),
            radius: 5.0,
        };
        assert!(lens.contains(Point2D::new(15.0, 10.0)));
        assert!(!lens.contains(Point2D::new(15.1, 10.0)));
    }
}
