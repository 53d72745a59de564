use std::{
    collections::BTreeMap,
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context;
use image::RgbaImage;
use serde::{Deserialize, Serialize};

use crate::compositor::{Compositor, RenderBackend};
use crate::config::AppConfig;
use crate::layer::{
    GroupParameter, LayerVisibility, Lens, update_group_index, update_group_parameter,
    update_group_visibility,
};
use crate::resources::ResourceCache;
use crate::scene::{BgResult, Scene};
use crate::selection::{
    ColorSegmentationSelection, ElementSelection, SelectionEvent, SelectionSpace,
};
use crate::selection_mapper::{EmbeddingMapping, SelectionMapper};
use crate::workspace::{self, EMBEDDING_MAPPING_LOCATION, WorkspaceConfig};

#[derive(Debug, Clone, Copy, PartialEq)]
/// One edit to a layer group's shared state.
pub enum GroupEdit {
    Parameter(GroupParameter, f32),
    Visible(bool),
    Visibility(LayerVisibility),
    Index(i32),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
/// Overrides for one group. Parameters are keyed by name so unknown ones can be reported.
pub struct GroupOverride {
    pub key: String,
    pub visible: Option<bool>,
    pub visibility: Option<LayerVisibility>,
    pub index: Option<i32>,
    pub parameters: BTreeMap<String, f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
/// Serialized viewer interaction state, applied on top of a loaded workspace.
pub struct ViewerState {
    pub lens: Option<Lens>,
    pub groups: Vec<GroupOverride>,
    pub element_selections: Vec<ElementSelection>,
    pub color_segmentation_selections: Vec<ColorSegmentationSelection>,
    pub selections: Vec<SelectionEvent>,
}

impl ViewerState {
    pub fn from_json(bytes: &[u8]) -> anyhow::Result<Self> {
        serde_json::from_slice(bytes).context("invalid viewer state document")
    }

    pub fn read(path: &Path) -> anyhow::Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read viewer state {}", path.display()))?;
        Self::from_json(&bytes).with_context(|| format!("in {}", path.display()))
    }
}

/// Owns the scene and everything that feeds it: lookup tables, selection
/// bitmasks and the lens. Single-threaded; background results are applied
/// in [`Viewer::tick`].
pub struct Viewer {
    scene: Scene,
    compositor: Compositor,
    mapper: SelectionMapper,
    lens: Option<Lens>,
    selection_opacity: f32,
    /// Embedding selection waiting for the mapping to arrive.
    parked: Option<SelectionEvent>,
}

impl Viewer {
    pub fn new(config: &AppConfig, cache: Arc<ResourceCache>, backend: Box<dyn RenderBackend>) -> Self {
        let bitmask_size = config.bitmask_size();
        Self {
            scene: Scene::new(backend, cache),
            compositor: Compositor::new(bitmask_size),
            mapper: SelectionMapper::new(bitmask_size, config.selection_fill()),
            lens: None,
            selection_opacity: config.selection_opacity(),
            parked: None,
        }
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    pub fn compositor(&self) -> &Compositor {
        &self.compositor
    }

    pub fn lens(&self) -> Option<Lens> {
        self.lens
    }

    pub fn has_embedding_mapping(&self) -> bool {
        self.mapper.has_mapping()
    }

    /// Replaces the whole layer system with `workspace` and starts fetching
    /// the embedding mapping when the workspace carries data.
    pub fn load_workspace(&mut self, workspace: &WorkspaceConfig) {
        workspace::load_workspace(&mut self.scene, workspace, self.selection_opacity);
        self.compositor.reset();
        self.mapper = SelectionMapper::new(self.mapper.compact_size(), self.mapper.fill());
        self.parked = None;

        if workspace.has_data() {
            let cache = Arc::clone(self.scene.cache());
            let generation = self.scene.generation();
            self.scene.spawn(move || BgResult::Mapping {
                generation,
                result: cache
                    .fetch(EMBEDDING_MAPPING_LOCATION)
                    .and_then(|bytes| EmbeddingMapping::from_bytes(&bytes)),
            });
        }
    }

    pub fn set_element_selection(&mut self, selections: &[ElementSelection]) {
        self.compositor.update_element_selection(&mut self.scene, selections);
    }

    pub fn set_color_segmentation_selection(&mut self, selections: &[ColorSegmentationSelection]) {
        self.compositor
            .update_color_segmentation_selection(&mut self.scene, selections);
    }

    /// Rebuilds the bitmask for the event's space and publishes it.
    ///
    /// Returns whether the selection took effect. Rejected selections leave
    /// the previous bitmask in place; embedding selections made before the
    /// mapping is known are parked and applied once it arrives.
    pub fn apply_selection_event(&mut self, event: SelectionEvent) -> bool {
        if event.space == SelectionSpace::Embedding && !self.mapper.has_mapping() {
            tracing::debug!("embedding mapping not loaded yet, parking selection");
            self.parked = Some(event);
            return false;
        }
        self.sync_mapper_canvas();
        match self.mapper.rebuild(&event) {
            Ok(bitmask) => {
                self.compositor
                    .publish_selection(&mut self.scene, event.space, bitmask);
                true
            }
            Err(err) => {
                tracing::warn!(space = ?event.space, error = %format!("{err:#}"), "selection rejected");
                false
            }
        }
    }

    pub fn clear_selection(&mut self, space: SelectionSpace) {
        if space == SelectionSpace::Embedding {
            self.parked = None;
        }
        let bitmask = self.mapper.clear(space);
        self.compositor.publish_selection(&mut self.scene, space, bitmask);
    }

    pub fn set_lens(&mut self, lens: Option<Lens>) {
        self.lens = lens;
    }

    /// Applies `edit` to group `key` and pushes it to the member layers.
    /// Returns `false` for an unknown group.
    pub fn update_group(&mut self, key: &str, edit: GroupEdit) -> bool {
        let Some(group) = self.scene.group_mut(key) else {
            tracing::warn!(group = key, "no such group");
            return false;
        };
        match edit {
            GroupEdit::Parameter(param, value) => {
                group.set_parameter(param, value);
                update_group_parameter(group, param);
            }
            GroupEdit::Visible(visible) => {
                group.visible = visible;
                update_group_visibility(group);
            }
            GroupEdit::Visibility(visibility) => {
                group.visibility = visibility;
                update_group_visibility(group);
            }
            GroupEdit::Index(index) => {
                group.index = index;
                update_group_index(group);
            }
        }
        true
    }

    pub fn apply_state(&mut self, state: &ViewerState) {
        for o in &state.groups {
            if self.scene.group(&o.key).is_none() {
                tracing::warn!(group = %o.key, "state refers to unknown group");
                continue;
            }
            if let Some(visible) = o.visible {
                self.update_group(&o.key, GroupEdit::Visible(visible));
            }
            if let Some(visibility) = o.visibility {
                self.update_group(&o.key, GroupEdit::Visibility(visibility));
            }
            if let Some(index) = o.index {
                self.update_group(&o.key, GroupEdit::Index(index));
            }
            for (name, &value) in &o.parameters {
                match GroupParameter::from_name(name) {
                    Some(param) => {
                        self.update_group(&o.key, GroupEdit::Parameter(param, value));
                    }
                    None => tracing::warn!(group = %o.key, parameter = %name, "unknown group parameter"),
                }
            }
        }
        if state.lens.is_some() {
            self.set_lens(state.lens);
        }
        if !state.element_selections.is_empty() {
            self.set_element_selection(&state.element_selections);
        }
        if !state.color_segmentation_selections.is_empty() {
            self.set_color_segmentation_selection(&state.color_segmentation_selections);
        }
        for event in &state.selections {
            self.apply_selection_event(event.clone());
        }
    }

    /// Applies finished background work. Returns how many results were handled.
    pub fn tick(&mut self) -> usize {
        let handled = self.scene.drain();
        self.absorb();
        handled
    }

    /// Ticks until no background work is left or `timeout` elapses.
    pub fn wait_idle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let settled = self.scene.wait_idle(remaining);
            self.absorb();
            if !settled {
                return false;
            }
            // Absorbing can queue more work (a parked selection loads its layer).
            if self.scene.in_flight() == 0 {
                return true;
            }
        }
    }

    /// Composites the scene. `long_edge` scales the output; `None` renders at canvas size.
    pub fn render(&mut self, long_edge: Option<u32>) -> anyhow::Result<RgbaImage> {
        let canvas = self
            .scene
            .canvas()
            .context("nothing to render: base image not loaded")?;
        let output = long_edge.map_or(canvas, |edge| canvas.fit_long_edge(edge));
        self.compositor.render(&mut self.scene, self.lens, output)
    }

    fn absorb(&mut self) {
        for msg in self.scene.take_unclaimed() {
            let BgResult::Mapping { generation, result } = msg else {
                continue;
            };
            if generation != self.scene.generation() {
                tracing::debug!(generation, "dropping mapping from a previous workspace");
                continue;
            }
            match result {
                Ok(mapping) => self.mapper.set_mapping(mapping),
                Err(err) => {
                    tracing::warn!(error = %format!("{err:#}"), "embedding mapping unavailable");
                }
            }
        }
        self.sync_mapper_canvas();
        if self.mapper.has_mapping()
            && let Some(event) = self.parked.take()
        {
            self.apply_selection_event(event);
        }
    }

    fn sync_mapper_canvas(&mut self) {
        if let Some(canvas) = self.scene.canvas() {
            self.mapper.set_canvas(canvas);
        }
    }
}
