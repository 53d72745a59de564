pub mod cpu;
pub mod gpu;
pub mod shading;

use image::RgbaImage;

use crate::color::hex_or;
use crate::geometry::Size;
use crate::layer::{
    AuxiliaryBinding, DisplayParams, LayerType, LayerVisibility, Lens, ResourceHandle,
};
use crate::registering::Matrix3;
use crate::scene::Scene;
use crate::selection::{ColorSegmentationSelection, ElementSelection, SelectionSpace};
use crate::selection_mapper::Bitmask;
use crate::texture::{AuxTextureId, AuxTextures, COLOR_SEGMENTATION_ROWS};

/// Where layer textures live and how a [`Frame`] becomes pixels.
pub trait RenderBackend: Send {
    fn name(&self) -> &'static str;

    fn upload(&mut self, image: &RgbaImage, interpolated: bool) -> anyhow::Result<ResourceHandle>;

    /// Frees a texture. Unknown handles are ignored.
    fn release(&mut self, handle: ResourceHandle);

    fn resident_count(&self) -> usize;

    fn render(&mut self, frame: &Frame<'_>) -> anyhow::Result<RgbaImage>;
}

/// Everything a backend needs to draw one resident layer.
#[derive(Debug, Clone)]
pub struct LayerDraw {
    pub id: String,
    pub handle: ResourceHandle,
    pub kind: LayerType,
    pub transform: Matrix3,
    /// Inverse of `transform`, mapping canvas points back into the quad.
    pub inverse: Matrix3,
    pub params: DisplayParams,
    pub auxiliary: Option<AuxiliaryBinding>,
    pub interpolated: bool,
    pub render_order: i32,
}

#[derive(Debug, Clone)]
pub enum DrawItem {
    Layer(LayerDraw),
    /// Consecutive elemental layers, accumulated order-independently and
    /// drawn as one with the stack's display parameters.
    ElementalStack {
        layers: Vec<LayerDraw>,
        params: DisplayParams,
    },
}

/// Snapshot of the scene for one render.
#[derive(Debug, Clone)]
pub struct Frame<'a> {
    pub canvas: Size,
    pub output: Size,
    pub lens: Option<Lens>,
    pub aux: &'a AuxTextures,
    pub items: Vec<DrawItem>,
}

impl Frame<'_> {
    pub fn layer_count(&self) -> usize {
        self.items
            .iter()
            .map(|item| match item {
                DrawItem::Layer(_) => 1,
                DrawItem::ElementalStack { layers, .. } => layers.len(),
            })
            .sum()
    }
}

/// Owns the per-modality lookup tables and turns selection state into
/// table writes plus lazy layer loads.
pub struct Compositor {
    aux: AuxTextures,
}

impl Compositor {
    pub fn new(bitmask_size: u32) -> Self {
        Self {
            aux: AuxTextures::new(bitmask_size),
        }
    }

    pub fn aux(&self) -> &AuxTextures {
        &self.aux
    }

    /// Forgets every channel, cluster and selection.
    pub fn reset(&mut self) {
        self.aux.clear();
    }

    /// Writes channel colors and thresholds, then loads newly enabled
    /// channel layers and disposes disabled ones.
    pub fn update_element_selection(&mut self, scene: &mut Scene, selections: &[ElementSelection]) {
        for sel in selections {
            let Ok(x) = u32::try_from(sel.channel) else {
                tracing::warn!(channel = sel.channel, "element channel out of range");
                continue;
            };
            if sel.selected {
                let [r, g, b] = hex_or(&sel.color, [255, 255, 255]);
                let [lo, hi] = sel.thresholds.map(|t| (t.clamp(0.0, 1.0) * 255.0).round() as u8);
                self.aux.elemental.set_pixel(x, 0, [r, g, b, 255]);
                self.aux.elemental.set_pixel(x, 1, [lo, hi, 0, 255]);
            } else {
                self.aux.elemental.clear_alpha(x, 0);
            }
            set_resident(scene, AuxTextureId::Elemental, sel.channel, sel.selected, true);
        }
    }

    /// Writes cluster colors; an element's layer stays resident while any
    /// of its clusters is enabled.
    pub fn update_color_segmentation_selection(
        &mut self,
        scene: &mut Scene,
        selections: &[ColorSegmentationSelection],
    ) {
        let mut touched = Vec::new();
        for sel in selections {
            let (Ok(x), Ok(y)) = (u32::try_from(sel.element), u32::try_from(sel.cluster)) else {
                tracing::warn!(element = sel.element, cluster = sel.cluster, "color cluster slot out of range");
                continue;
            };
            if sel.selected {
                let [r, g, b] = hex_or(&sel.color, [255, 255, 255]);
                self.aux.color_segmentation.set_pixel(x, y, [r, g, b, 255]);
            } else {
                self.aux.color_segmentation.clear_alpha(x, y);
            }
            if !touched.contains(&(sel.element, x)) {
                touched.push((sel.element, x));
            }
        }
        for (element, x) in touched {
            let any = (0..COLOR_SEGMENTATION_ROWS).any(|y| self.aux.color_segmentation.alpha(x, y) > 0);
            set_resident(scene, AuxTextureId::ColorSegmentation, element, any, false);
        }
    }

    /// Copies a rebuilt bitmask into its lookup table and shows the matching
    /// selection layer only while something is selected.
    pub fn publish_selection(&mut self, scene: &mut Scene, space: SelectionSpace, bitmask: &Bitmask) {
        let id = selection_texture(space);
        self.aux.get_mut(id).replace(bitmask.data());
        set_resident(scene, id, 0, !bitmask.is_empty(), false);
        tracing::debug!(?space, selected = bitmask.selected_count(), "selection published");
    }

    /// Builds the draw list from resident, visible layers. `None` until the
    /// canvas size is known.
    pub fn frame<'a>(&'a self, scene: &Scene, lens: Option<Lens>, output: Size) -> Option<Frame<'a>> {
        let canvas = scene.canvas()?;
        let mut draws: Vec<LayerDraw> = scene
            .layers()
            .filter(|l| l.params.visibility != LayerVisibility::Invisible)
            .filter_map(|l| {
                let res = l.resource()?;
                let Some(inverse) = l.transform.inverse() else {
                    tracing::warn!(layer = %l.id, "skipping layer with singular transform");
                    return None;
                };
                Some(LayerDraw {
                    id: l.id.clone(),
                    handle: res.handle,
                    kind: l.kind,
                    transform: l.transform,
                    inverse,
                    params: l.params,
                    auxiliary: l.auxiliary,
                    interpolated: l.interpolated,
                    render_order: res.render_order,
                })
            })
            .collect();
        // Stable: equal orders keep insertion order.
        draws.sort_by_key(|d| d.render_order);

        let mut items: Vec<DrawItem> = Vec::new();
        for draw in draws {
            if draw.kind == LayerType::Elemental {
                if let Some(DrawItem::ElementalStack { layers, .. }) = items.last_mut() {
                    layers.push(draw);
                    continue;
                }
                items.push(DrawItem::ElementalStack {
                    params: draw.params,
                    layers: vec![draw],
                });
            } else {
                items.push(DrawItem::Layer(draw));
            }
        }

        Some(Frame {
            canvas,
            output,
            lens,
            aux: &self.aux,
            items,
        })
    }

    pub fn render(&self, scene: &mut Scene, lens: Option<Lens>, output: Size) -> anyhow::Result<RgbaImage> {
        if output.is_empty() {
            anyhow::bail!("output size must be non-zero");
        }
        let Some(frame) = self.frame(scene, lens, output) else {
            anyhow::bail!("canvas size unknown; is the base image loaded?");
        };
        tracing::debug!(
            backend = scene.backend().name(),
            layers = frame.layer_count(),
            width = output.width,
            height = output.height,
            "rendering frame"
        );
        scene.backend_mut().render(&frame)
    }
}

fn selection_texture(space: SelectionSpace) -> AuxTextureId {
    match space {
        SelectionSpace::ImageViewer => AuxTextureId::ImageSelection,
        SelectionSpace::Embedding => AuxTextureId::DrSelection,
    }
}

/// Loads or disposes every layer bound to `(texture, channel)`.
fn set_resident(scene: &mut Scene, texture: AuxTextureId, channel: usize, resident: bool, interpolated: bool) {
    let binding = Some(AuxiliaryBinding { texture, channel });
    let ids: Vec<String> = scene
        .layers()
        .filter(|l| l.auxiliary == binding)
        .map(|l| l.id.clone())
        .collect();
    for id in ids {
        if resident {
            scene.load_layer(&id, interpolated);
        } else {
            scene.dispose_layer(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::compositor::cpu::CpuRenderer;
    use crate::layer::{ImageSource, Layer, LayerGroup};
    use crate::resources::{MemoryFetcher, ResourceCache};

    fn scene_with(fetcher: MemoryFetcher) -> Scene {
        Scene::new(
            Box::new(CpuRenderer::new()),
            Arc::new(ResourceCache::new(Arc::new(fetcher))),
        )
    }

    fn elemental_scene(channels: usize) -> Scene {
        let mut fetcher = MemoryFetcher::default();
        for k in 0..channels {
            fetcher = fetcher.with_png(&format!("elemental/element_{k}.png"), &RgbaImage::new(4, 4));
        }
        let mut scene = scene_with(fetcher);
        scene.set_canvas(Size::new(4, 4));
        let mut group = LayerGroup::new("elemental", "Elemental", "channels");
        group.index = -2;
        for k in 0..channels {
            group.layers.push(
                Layer::new(
                    format!("elemental_{k}"),
                    ImageSource::Remote(format!("elemental/element_{k}.png")),
                    LayerType::Elemental,
                )
                .with_auxiliary(AuxTextureId::Elemental, k),
            );
        }
        scene.insert_group(group);
        scene
    }

    fn element(channel: usize, selected: bool, color: &str) -> ElementSelection {
        ElementSelection {
            channel,
            selected,
            color: color.to_string(),
            thresholds: [0.0, 1.0],
        }
    }

    #[test]
    fn enabling_channel_writes_color_and_full_alpha() {
        let mut scene = elemental_scene(4);
        let mut compositor = Compositor::new(8);
        compositor.update_element_selection(&mut scene, &[element(2, true, "#4db827")]);
        assert_eq!(compositor.aux().elemental.pixel(2, 0), [77, 184, 39, 255]);
        assert_eq!(compositor.aux().elemental.pixel(2, 1), [0, 255, 0, 255]);
        assert_eq!(compositor.aux().elemental.alpha(1, 0), 0);
    }

    #[test]
    fn disabling_channel_zeroes_alpha_only() {
        let mut scene = elemental_scene(4);
        let mut compositor = Compositor::new(8);
        compositor.update_element_selection(&mut scene, &[element(2, true, "#4db827")]);
        let before = compositor.aux().elemental.revision();
        compositor.update_element_selection(&mut scene, &[element(2, false, "#000000")]);
        assert_eq!(compositor.aux().elemental.pixel(2, 0), [77, 184, 39, 0]);
        assert!(compositor.aux().elemental.revision() > before);
    }

    #[test]
    fn oversized_slots_are_skipped_not_wrapped() {
        let mut scene = elemental_scene(4);
        let mut compositor = Compositor::new(8);
        // Would alias channel 2 if narrowed to u32.
        if let Ok(channel) = usize::try_from(u64::from(u32::MAX) + 3) {
            compositor.update_element_selection(&mut scene, &[element(channel, true, "#ffffff")]);
            assert_eq!(compositor.aux().elemental.pixel(2, 0), [0; 4]);
            assert_eq!(compositor.aux().elemental.revision(), 0);

            compositor.update_color_segmentation_selection(
                &mut scene,
                &[ColorSegmentationSelection {
                    element: 2,
                    cluster: channel,
                    selected: true,
                    color: "#ffffff".into(),
                }],
            );
            assert_eq!(compositor.aux().color_segmentation.revision(), 0);
        }
    }

    #[test]
    fn thresholds_are_scaled_to_bytes() {
        let mut scene = elemental_scene(1);
        let mut compositor = Compositor::new(8);
        let mut sel = element(0, true, "#ffffff");
        sel.thresholds = [0.2, 0.8];
        compositor.update_element_selection(&mut scene, &[sel]);
        assert_eq!(compositor.aux().elemental.pixel(0, 1)[..2], [51, 204]);
    }

    #[test]
    fn channel_layers_load_and_dispose_lazily() {
        let mut scene = elemental_scene(3);
        let mut compositor = Compositor::new(8);
        compositor.update_element_selection(
            &mut scene,
            &[element(0, true, "#ff0000"), element(1, true, "#00ff00")],
        );
        assert!(scene.wait_idle(Duration::from_secs(5)));
        assert_eq!(scene.backend().resident_count(), 2);
        assert!(scene.find_layer("elemental_0").is_some_and(|l| l.is_loaded()));
        assert!(scene.find_layer("elemental_2").is_some_and(|l| !l.is_loaded()));

        compositor.update_element_selection(&mut scene, &[element(0, false, "#ff0000")]);
        assert_eq!(scene.backend().resident_count(), 1);
        assert!(scene.find_layer("elemental_0").is_some_and(|l| !l.is_loaded()));
    }

    #[test]
    fn color_segmentation_layer_tracks_any_enabled_cluster() {
        let fetcher = MemoryFetcher::default()
            .with_png("color_segmentation/elementCluster_3.png", &RgbaImage::new(4, 4));
        let mut scene = scene_with(fetcher);
        let mut group = LayerGroup::new("clusters", "Color clusters", "segmentation");
        group.layers.push(
            Layer::new(
                "cluster_3",
                ImageSource::Remote("color_segmentation/elementCluster_3.png".into()),
                LayerType::ColorSegmentation,
            )
            .with_auxiliary(AuxTextureId::ColorSegmentation, 3),
        );
        scene.insert_group(group);
        let mut compositor = Compositor::new(8);

        let cluster = |cluster, selected| ColorSegmentationSelection {
            element: 3,
            cluster,
            selected,
            color: "#0000ff".into(),
        };
        compositor.update_color_segmentation_selection(&mut scene, &[cluster(0, true), cluster(4, true)]);
        assert!(scene.wait_idle(Duration::from_secs(5)));
        assert_eq!(compositor.aux().color_segmentation.pixel(3, 4), [0, 0, 255, 255]);
        assert!(scene.find_layer("cluster_3").is_some_and(|l| l.is_loaded()));

        compositor.update_color_segmentation_selection(&mut scene, &[cluster(0, false)]);
        assert!(scene.find_layer("cluster_3").is_some_and(|l| l.is_loaded()));

        compositor.update_color_segmentation_selection(&mut scene, &[cluster(4, false)]);
        assert!(scene.find_layer("cluster_3").is_some_and(|l| !l.is_loaded()));
    }

    #[test]
    fn frame_orders_layers_and_stacks_elementals() {
        let fetcher = MemoryFetcher::default()
            .with_png("base.png", &RgbaImage::new(4, 4))
            .with_png("elemental/element_0.png", &RgbaImage::new(4, 4))
            .with_png("elemental/element_1.png", &RgbaImage::new(4, 4));
        let mut scene = scene_with(fetcher);
        scene.set_canvas_location("base.png");

        let mut base = LayerGroup::new("base", "Base", "photo");
        base.layers.push(Layer::new("base", ImageSource::Remote("base.png".into()), LayerType::Image));
        scene.insert_group(base);
        let mut hidden = LayerGroup::new("ctx", "Context", "hidden");
        hidden.index = -1;
        hidden.visible = false;
        hidden.layers.push(Layer::new("ctx", ImageSource::Remote("base.png".into()), LayerType::Image));
        scene.insert_group(hidden);
        let mut elemental = LayerGroup::new("elemental", "Elemental", "channels");
        elemental.index = -2;
        for k in 0..2 {
            elemental.layers.push(
                Layer::new(
                    format!("e{k}"),
                    ImageSource::Remote(format!("elemental/element_{k}.png")),
                    LayerType::Elemental,
                )
                .with_auxiliary(AuxTextureId::Elemental, k),
            );
        }
        scene.insert_group(elemental);
        for id in ["base", "ctx", "e0", "e1"] {
            scene.load_layer(id, true);
        }
        assert!(scene.wait_idle(Duration::from_secs(5)));

        let compositor = Compositor::new(8);
        let frame = compositor
            .frame(&scene, None, Size::new(2, 2))
            .expect("canvas known after base load");
        assert_eq!(frame.canvas, Size::new(4, 4));
        assert_eq!(frame.items.len(), 2);
        assert!(matches!(&frame.items[0], DrawItem::Layer(d) if d.id == "base"));
        match &frame.items[1] {
            DrawItem::ElementalStack { layers, .. } => {
                let ids: Vec<_> = layers.iter().map(|d| d.id.as_str()).collect();
                assert_eq!(ids, ["e0", "e1"]);
            }
            other => panic!("expected elemental stack, got {other:?}"),
        }
        assert_eq!(frame.layer_count(), 3);
    }

    #[test]
    fn frame_needs_a_canvas() {
        let scene = scene_with(MemoryFetcher::default());
        let compositor = Compositor::new(8);
        assert!(compositor.frame(&scene, None, Size::new(2, 2)).is_none());
    }

    #[test]
    fn published_selection_toggles_selection_layer() {
        let mut scene = scene_with(MemoryFetcher::default());
        let mut group = LayerGroup::new("selection", "Selection", "highlights");
        group.layers.push(
            Layer::new("selection_image_viewer", ImageSource::Auxiliary, LayerType::Selection)
                .with_auxiliary(AuxTextureId::ImageSelection, 0),
        );
        scene.insert_group(group);
        let mut compositor = Compositor::new(4);

        let mut mapper = crate::selection_mapper::SelectionMapper::new(4, [255, 239, 0]);
        mapper.set_canvas(Size::new(4, 4));
        let event = crate::selection::SelectionEvent {
            space: SelectionSpace::ImageViewer,
            kind: crate::selection::SelectionKind::Rectangle,
            points: vec![[0.0, 0.0].into(), [2.0, 2.0].into()],
        };
        let mask = mapper.rebuild(&event).unwrap().clone();
        compositor.publish_selection(&mut scene, SelectionSpace::ImageViewer, &mask);
        scene.drain();
        assert_eq!(compositor.aux().image_selection.data(), mask.data());
        assert!(scene.find_layer("selection_image_viewer").is_some_and(|l| l.is_loaded()));

        compositor.publish_selection(&mut scene, SelectionSpace::ImageViewer, &Bitmask::new(4));
        assert!(scene.find_layer("selection_image_viewer").is_some_and(|l| !l.is_loaded()));
    }
}
