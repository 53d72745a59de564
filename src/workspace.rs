use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::layer::{ImageSource, Layer, LayerGroup, LayerType};
use crate::scene::Scene;
use crate::texture::AuxTextureId;

/// Element columns available for per-element data.
pub const ELEMENT_SLOTS: usize = 26;
/// Lookup column of the image-wide color clustering.
pub const IMAGE_CLUSTER_SLOT: usize = 26;
/// Image whose blue-marked pixels map image points into the embedding.
pub const EMBEDDING_MAPPING_LOCATION: &str = "dr/embedding/mapping.png";

pub const BASE_GROUP: &str = "base";
pub const ELEMENTAL_GROUP: &str = "elemental";
pub const COLOR_CLUSTER_GROUP: &str = "color_clusters";
pub const SELECTION_GROUP: &str = "selection";
pub const DR_SELECTION_LAYER: &str = "selection_dr";
pub const IMAGE_SELECTION_LAYER: &str = "selection_image_viewer";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextualImage {
    pub name: String,
    pub image_location: String,
    /// Empty when the image needs no registration.
    #[serde(default)]
    pub recipe_location: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementalCube {
    pub name: String,
    #[serde(default)]
    pub file_type: Option<String>,
    #[serde(default)]
    pub data_location: String,
    pub recipe_location: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementalChannel {
    pub name: String,
    pub channel: usize,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Image-wide color clusters.
pub struct ColorCluster {
    #[serde(default)]
    pub name: String,
    #[serde(alias = "enable")]
    pub enabled: bool,
    #[serde(default)]
    pub chosen_cluster: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementColorCluster {
    pub name: String,
    pub channel: usize,
    pub enabled: bool,
    #[serde(default)]
    pub chosen_cluster: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// The images, cubes and channels that seed the layer system.
pub struct WorkspaceConfig {
    pub name: String,
    pub base_image: ContextualImage,
    #[serde(default)]
    pub contextual_images: Vec<ContextualImage>,
    #[serde(default)]
    pub elemental_cubes: Vec<ElementalCube>,
    #[serde(default)]
    pub elemental_channels: Vec<ElementalChannel>,
    #[serde(default)]
    pub color_clusters: Option<ColorCluster>,
    #[serde(default)]
    pub element_color_clusters: Vec<ElementColorCluster>,
}

impl WorkspaceConfig {
    pub fn from_json(bytes: &[u8]) -> anyhow::Result<Self> {
        serde_json::from_slice(bytes).context("invalid workspace document")
    }

    pub fn read(path: &Path) -> anyhow::Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read workspace {}", path.display()))?;
        Self::from_json(&bytes).with_context(|| format!("in {}", path.display()))
    }

    /// Data layers only make sense with an elemental cube.
    pub fn has_data(&self) -> bool {
        !self.elemental_cubes.is_empty()
    }
}

pub fn elemental_location(channel: usize) -> String {
    format!("elemental/element_{channel}.png")
}

pub fn color_cluster_location(slot: usize) -> String {
    if slot == IMAGE_CLUSTER_SLOT {
        "color_segmentation/imageClusters.png".to_string()
    } else {
        format!("color_segmentation/elementCluster_{slot}.png")
    }
}

/// Lowercase with runs of anything non-alphanumeric collapsed to `_`.
fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
        } else if !out.is_empty() && !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_end_matches('_').to_string()
}

/// Appends `_2`, `_3`, ... when `key` is already taken by another group.
fn unique_group_key(scene: &Scene, key: String) -> String {
    if scene.group(&key).is_none() {
        return key;
    }
    let mut suffix = 2;
    while scene.group(&format!("{key}_{suffix}")).is_some() {
        suffix += 1;
    }
    let unique = format!("{key}_{suffix}");
    tracing::warn!(key = %key, renamed = %unique, "duplicate contextual image name");
    unique
}

fn group(key: &str, name: &str, description: &str, index: i32, visible: bool) -> LayerGroup {
    let mut g = LayerGroup::new(key, name, description);
    g.index = index;
    g.visible = visible;
    g
}

/// Replaces the scene contents with the layers of `workspace`.
///
/// Every previous layer is disposed first. Image layers start loading
/// immediately; data layers load lazily once selected.
pub fn load_workspace(scene: &mut Scene, workspace: &WorkspaceConfig, selection_opacity: f32) {
    scene.clear();
    tracing::info!(workspace = %workspace.name, "loading workspace into layer system");

    let base = &workspace.base_image;
    scene.set_canvas_location(base.image_location.clone());
    scene.insert_group(group(BASE_GROUP, &base.name, "Base image", 0, true));
    scene.create_layer(
        BASE_GROUP,
        Layer::new(
            format!("base_{}", snake_case(&base.name)),
            ImageSource::Remote(base.image_location.clone()),
            LayerType::Image,
        ),
        true,
    );

    for image in &workspace.contextual_images {
        let id = unique_group_key(scene, format!("contextual_{}", snake_case(&image.name)));
        scene.insert_group(group(&id, &image.name, "Contextual image", -1, false));
        scene.create_layer(
            &id,
            Layer::new(id.clone(), ImageSource::Remote(image.image_location.clone()), LayerType::Image),
            true,
        );
        if !image.recipe_location.is_empty() {
            scene.request_registration(
                vec![id],
                image.recipe_location.clone(),
                image.image_location.clone(),
            );
        }
    }

    let Some(cube) = workspace.elemental_cubes.first() else {
        return;
    };
    if workspace.elemental_cubes.len() > 1 {
        tracing::warn!(cubes = workspace.elemental_cubes.len(), "only the first elemental cube is used");
    }

    let mut data_layers = Vec::new();

    scene.insert_group(group(ELEMENTAL_GROUP, "Elemental maps", "Per-element intensity maps", -2, true));
    for channel in workspace.elemental_channels.iter().filter(|c| c.enabled) {
        if channel.channel >= ELEMENT_SLOTS {
            tracing::warn!(channel = channel.channel, name = %channel.name, "elemental channel out of range");
            continue;
        }
        let layer = Layer::new(
            format!("elemental_{}", channel.channel),
            ImageSource::Remote(elemental_location(channel.channel)),
            LayerType::Elemental,
        )
        .with_auxiliary(AuxTextureId::Elemental, channel.channel);
        data_layers.push(layer.id.clone());
        scene.create_layer(ELEMENTAL_GROUP, layer, false);
    }

    scene.insert_group(group(COLOR_CLUSTER_GROUP, "Color clusters", "Color segmentation", -2, true));
    let element_slots = workspace
        .element_color_clusters
        .iter()
        .filter(|c| c.enabled)
        .filter_map(|c| {
            if c.channel >= ELEMENT_SLOTS {
                tracing::warn!(channel = c.channel, "element color cluster out of range");
                return None;
            }
            Some((format!("color_segmentation_{}", c.channel), c.channel))
        });
    let image_slot = workspace
        .color_clusters
        .as_ref()
        .filter(|c| c.enabled)
        .map(|_| ("color_segmentation_image".to_string(), IMAGE_CLUSTER_SLOT));
    for (id, slot) in element_slots.chain(image_slot) {
        let mut layer = Layer::new(
            id.clone(),
            ImageSource::Remote(color_cluster_location(slot)),
            LayerType::ColorSegmentation,
        )
        .with_auxiliary(AuxTextureId::ColorSegmentation, slot);
        layer.interpolated = false;
        data_layers.push(id);
        scene.create_layer(COLOR_CLUSTER_GROUP, layer, false);
    }

    let mut selection = group(SELECTION_GROUP, "Selections", "Highlighted selections", -2, true);
    selection.opacity = selection_opacity;
    scene.insert_group(selection);
    for (id, texture) in [
        (DR_SELECTION_LAYER, AuxTextureId::DrSelection),
        (IMAGE_SELECTION_LAYER, AuxTextureId::ImageSelection),
    ] {
        let mut layer = Layer::new(id, ImageSource::Auxiliary, LayerType::Selection).with_auxiliary(texture, 0);
        layer.interpolated = false;
        scene.create_layer(SELECTION_GROUP, layer, false);
    }
    // The embedding mapping lives in data space; image-viewer selections are already in canvas space.
    data_layers.push(DR_SELECTION_LAYER.to_string());

    let moving = data_moving_location(workspace);
    scene.request_registration(data_layers, cube.recipe_location.clone(), moving);
}

/// Any generated data image; they all share the cube's dimensions.
fn data_moving_location(workspace: &WorkspaceConfig) -> String {
    match workspace.elemental_channels.iter().find(|c| c.channel < ELEMENT_SLOTS) {
        Some(c) => elemental_location(c.channel),
        None => color_cluster_location(IMAGE_CLUSTER_SLOT),
    }
}
