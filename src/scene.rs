use std::{
    sync::{Arc, mpsc},
    time::{Duration, Instant},
};

use anyhow::Context;
use image::RgbaImage;

use crate::compositor::RenderBackend;
use crate::geometry::Size;
use crate::layer::{
    ImageSource, Layer, LayerGroup, RenderResource, RenderState, render_order_for,
    update_group_layers,
};
use crate::registering::{RegisteringRecipe, register_layer};
use crate::resources::ResourceCache;
use crate::selection_mapper::EmbeddingMapping;

/// Messages sent from loader threads back to the owning thread.
pub enum BgResult {
    LayerLoaded {
        generation: u64,
        layer_id: String,
        ticket: u64,
        image: RgbaImage,
        canvas: Option<Size>,
    },
    LayerFailed {
        generation: u64,
        layer_id: String,
        ticket: u64,
        error: anyhow::Error,
    },
    RecipeResolved {
        generation: u64,
        layer_ids: Vec<String>,
        recipe: RegisteringRecipe,
    },
    Mapping {
        generation: u64,
        result: anyhow::Result<EmbeddingMapping>,
    },
}

/// The layered scene: groups of layers plus the backend holding their textures.
///
/// All mutation happens on the owning thread. Loader threads only fetch and
/// decode, then report through the channel; uploads happen in [`Scene::drain`].
pub struct Scene {
    groups: Vec<LayerGroup>,
    backend: Box<dyn RenderBackend>,
    cache: Arc<ResourceCache>,
    canvas_location: Option<String>,
    canvas: Option<Size>,
    next_ticket: u64,
    generation: u64,
    in_flight: usize,
    local: Vec<BgResult>,
    unclaimed: Vec<BgResult>,
    tx: mpsc::SyncSender<BgResult>,
    rx: mpsc::Receiver<BgResult>,
}

impl Scene {
    pub fn new(backend: Box<dyn RenderBackend>, cache: Arc<ResourceCache>) -> Self {
        let (tx, rx) = mpsc::sync_channel(32);
        Self {
            groups: Vec::new(),
            backend,
            cache,
            canvas_location: None,
            canvas: None,
            next_ticket: 1,
            generation: 0,
            in_flight: 0,
            local: Vec::new(),
            unclaimed: Vec::new(),
            tx,
            rx,
        }
    }

    pub fn cache(&self) -> &Arc<ResourceCache> {
        &self.cache
    }

    pub fn backend(&self) -> &dyn RenderBackend {
        self.backend.as_ref()
    }

    pub fn backend_mut(&mut self) -> &mut dyn RenderBackend {
        self.backend.as_mut()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Image whose size defines the shared canvas (the base image).
    pub fn set_canvas_location(&mut self, location: impl Into<String>) {
        self.canvas_location = Some(location.into());
    }

    pub fn canvas_location(&self) -> Option<&str> {
        self.canvas_location.as_deref()
    }

    pub fn canvas(&self) -> Option<Size> {
        self.canvas
    }

    pub fn set_canvas(&mut self, size: Size) {
        self.canvas = Some(size);
    }

    pub fn groups(&self) -> &[LayerGroup] {
        &self.groups
    }

    pub fn group(&self, key: &str) -> Option<&LayerGroup> {
        self.groups.iter().find(|g| g.key == key)
    }

    pub fn group_mut(&mut self, key: &str) -> Option<&mut LayerGroup> {
        self.groups.iter_mut().find(|g| g.key == key)
    }

    /// Adds a group and pushes its shared values to the member layers.
    /// A group with the same key is disposed and replaced.
    pub fn insert_group(&mut self, mut group: LayerGroup) {
        update_group_layers(&mut group);
        if let Some(pos) = self.groups.iter().position(|g| g.key == group.key) {
            let mut old = std::mem::replace(&mut self.groups[pos], group);
            for layer in &mut old.layers {
                layer.dispose(self.backend.as_mut());
            }
        } else {
            self.groups.push(group);
        }
    }

    pub fn layers(&self) -> impl Iterator<Item = &Layer> {
        self.groups.iter().flat_map(|g| g.layers.iter())
    }

    pub fn find_layer(&self, id: &str) -> Option<&Layer> {
        self.layers().find(|l| l.id == id)
    }

    pub fn find_layer_mut(&mut self, id: &str) -> Option<&mut Layer> {
        self.groups
            .iter_mut()
            .flat_map(|g| g.layers.iter_mut())
            .find(|l| l.id == id)
    }

    /// Appends `layer` to group `group_key`, inheriting its shared values.
    pub fn create_layer(&mut self, group_key: &str, layer: Layer, auto_load: bool) -> bool {
        let id = layer.id.clone();
        let interpolated = layer.interpolated;
        let Some(group) = self.group_mut(group_key) else {
            tracing::warn!(group = group_key, layer = %id, "no such group");
            return false;
        };
        group.layers.push(layer);
        update_group_layers(group);
        if auto_load {
            self.load_layer(&id, interpolated);
        }
        true
    }

    /// Starts loading a layer's image in the background. No-op when the
    /// layer is already resident or loading.
    pub fn load_layer(&mut self, id: &str, interpolated: bool) {
        let ticket = self.next_ticket;
        let Some(layer) = self.find_layer_mut(id) else {
            tracing::warn!(layer = id, "load requested for unknown layer");
            return;
        };
        if !matches!(layer.render, RenderState::Unloaded) {
            return;
        }
        layer.interpolated = interpolated;
        layer.render = RenderState::Pending { ticket };
        let source = layer.source.clone();
        self.next_ticket += 1;
        self.in_flight += 1;

        let layer_id = id.to_string();
        let generation = self.generation;
        match source {
            ImageSource::Auxiliary => {
                self.local.push(BgResult::LayerLoaded {
                    generation,
                    layer_id,
                    ticket,
                    image: RgbaImage::new(1, 1),
                    canvas: None,
                });
            }
            ImageSource::Remote(location) => {
                let cache = Arc::clone(&self.cache);
                let canvas_location = self.canvas_location.clone();
                let tx = self.tx.clone();
                std::thread::spawn(move || {
                    let msg = match fetch_image(&cache, &location) {
                        Ok(image) => BgResult::LayerLoaded {
                            generation,
                            layer_id,
                            ticket,
                            image,
                            canvas: canvas_location.and_then(|loc| cache.image_size(&loc).ok()),
                        },
                        Err(error) => BgResult::LayerFailed {
                            generation,
                            layer_id,
                            ticket,
                            error,
                        },
                    };
                    let _ = tx.send(msg);
                });
            }
        }
    }

    /// Releases a layer's render resource. Idempotent.
    pub fn dispose_layer(&mut self, id: &str) {
        let backend = self.backend.as_mut();
        if let Some(layer) = self
            .groups
            .iter_mut()
            .flat_map(|g| g.layers.iter_mut())
            .find(|l| l.id == id)
        {
            layer.dispose(backend);
        }
    }

    /// Resolves a recipe (and any sizes it lacks) in the background, then
    /// registers every listed layer with it.
    pub fn request_registration(
        &mut self,
        layer_ids: Vec<String>,
        recipe_location: String,
        moving_location: String,
    ) {
        let cache = Arc::clone(&self.cache);
        let canvas_location = self.canvas_location.clone();
        let generation = self.generation;
        self.spawn(move || {
            let recipe = resolve_recipe(&cache, &recipe_location, canvas_location.as_deref(), &moving_location);
            BgResult::RecipeResolved {
                generation,
                layer_ids,
                recipe,
            }
        });
    }

    /// Runs `job` on a worker thread; its result is delivered through [`Scene::drain`].
    pub fn spawn<F>(&mut self, job: F)
    where
        F: FnOnce() -> BgResult + Send + 'static,
    {
        self.in_flight += 1;
        let tx = self.tx.clone();
        std::thread::spawn(move || {
            let _ = tx.send(job());
        });
    }

    /// Applies every finished background result. Returns how many were handled.
    pub fn drain(&mut self) -> usize {
        let mut handled = 0;
        for msg in std::mem::take(&mut self.local) {
            self.apply(msg);
            handled += 1;
        }
        while let Ok(msg) = self.rx.try_recv() {
            self.apply(msg);
            handled += 1;
        }
        handled
    }

    /// Blocks until no background work is outstanding or `timeout` elapses.
    /// Returns whether the scene settled.
    pub fn wait_idle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        self.drain();
        while self.in_flight > 0 {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                break;
            };
            match self.rx.recv_timeout(remaining) {
                Ok(msg) => {
                    self.apply(msg);
                    self.drain();
                }
                Err(_) => break,
            }
        }
        if self.in_flight > 0 {
            tracing::warn!(in_flight = self.in_flight, "background work did not settle in time");
            return false;
        }
        true
    }

    /// Results the scene does not consume itself (e.g. embedding mappings).
    pub fn take_unclaimed(&mut self) -> Vec<BgResult> {
        std::mem::take(&mut self.unclaimed)
    }

    fn apply(&mut self, msg: BgResult) {
        self.in_flight = self.in_flight.saturating_sub(1);
        match msg {
            BgResult::LayerLoaded { generation, .. } | BgResult::LayerFailed { generation, .. }
                if generation != self.generation =>
            {
                tracing::debug!(generation, "dropping load result from an unloaded scene");
            }
            BgResult::LayerLoaded {
                layer_id,
                ticket,
                image,
                canvas,
                ..
            } => self.finish_load(&layer_id, ticket, image, canvas),
            BgResult::LayerFailed {
                layer_id,
                ticket,
                error,
                ..
            } => {
                if let Some(layer) = self.find_layer_mut(&layer_id)
                    && layer.render == (RenderState::Pending { ticket })
                {
                    layer.render = RenderState::Unloaded;
                    tracing::warn!(layer = %layer_id, error = %format!("{error:#}"), "failed to load layer");
                }
            }
            BgResult::RecipeResolved {
                generation,
                layer_ids,
                recipe,
            } => {
                if generation != self.generation {
                    return;
                }
                for id in &layer_ids {
                    match self.find_layer_mut(id) {
                        Some(layer) => register_layer(layer, &recipe),
                        None => tracing::debug!(layer = %id, "registration for missing layer"),
                    }
                }
            }
            other @ BgResult::Mapping { .. } => self.unclaimed.push(other),
        }
    }

    fn finish_load(&mut self, layer_id: &str, ticket: u64, image: RgbaImage, canvas: Option<Size>) {
        let Some((group_index, layer)) = self
            .groups
            .iter_mut()
            .flat_map(|g| {
                let index = g.index;
                g.layers.iter_mut().map(move |l| (index, l))
            })
            .find(|(_, l)| l.id == layer_id)
        else {
            return;
        };
        // Disposed or reloaded in the meantime.
        if layer.render != (RenderState::Pending { ticket }) {
            return;
        }

        if self.canvas.is_none() {
            self.canvas = canvas;
        }
        let quad = self
            .canvas
            .unwrap_or_else(|| Size::new(image.width(), image.height()));

        match self.backend.upload(&image, layer.interpolated) {
            Ok(handle) => {
                layer.render = RenderState::Loaded(RenderResource {
                    handle,
                    render_order: render_order_for(group_index),
                    quad,
                });
                tracing::debug!(layer = layer_id, handle = handle.0, "layer resident");
            }
            Err(err) => {
                layer.render = RenderState::Unloaded;
                tracing::warn!(layer = layer_id, error = %format!("{err:#}"), "failed to upload layer");
            }
        }
    }

    /// Disposes every layer and drops all groups. Pending results from
    /// before the call are ignored.
    pub fn clear(&mut self) {
        tracing::info!(groups = self.groups.len(), "unloading scene");
        for group in &mut self.groups {
            for layer in &mut group.layers {
                layer.dispose(self.backend.as_mut());
            }
        }
        self.groups.clear();
        self.canvas = None;
        self.canvas_location = None;
        self.generation += 1;
    }
}

fn fetch_image(cache: &ResourceCache, location: &str) -> anyhow::Result<RgbaImage> {
    let bytes = cache.fetch(location)?;
    let img = image::load_from_memory(&bytes)
        .with_context(|| format!("failed to decode {location}"))?;
    Ok(img.into_rgba8())
}

fn resolve_recipe(
    cache: &ResourceCache,
    recipe_location: &str,
    canvas_location: Option<&str>,
    moving_location: &str,
) -> RegisteringRecipe {
    let mut recipe = cache.recipe(recipe_location);
    if recipe.target_size.is_none() {
        recipe.target_size = canvas_location.and_then(|loc| match cache.image_size(loc) {
            Ok(size) => Some(size),
            Err(err) => {
                tracing::warn!(location = loc, error = %format!("{err:#}"), "failed to get target size");
                None
            }
        });
    }
    if recipe.moving_size.is_none() {
        recipe.moving_size = match cache.image_size(moving_location) {
            Ok(size) => Some(size),
            Err(err) => {
                tracing::warn!(location = moving_location, error = %format!("{err:#}"), "failed to get moving size");
                None
            }
        };
    }
    recipe
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compositor::cpu::CpuRenderer;
    use crate::layer::LayerType;
    use crate::registering::Matrix3;
    use crate::resources::MemoryFetcher;

    const WAIT: Duration = Duration::from_secs(5);

    fn scene_with(fetcher: MemoryFetcher) -> Scene {
        let cache = Arc::new(ResourceCache::new(Arc::new(fetcher)));
        Scene::new(Box::new(CpuRenderer::new()), cache)
    }

    fn image_layer(id: &str, location: &str) -> Layer {
        Layer::new(id, ImageSource::Remote(location.into()), LayerType::Image)
    }

    #[test]
    fn loaded_layer_uses_canvas_size_and_group_order() {
        let fetcher = MemoryFetcher::default()
            .with_png("base.png", &RgbaImage::new(8, 4))
            .with_png("ctx.png", &RgbaImage::new(2, 2));
        let mut scene = scene_with(fetcher);
        scene.set_canvas_location("base.png");

        let mut group = LayerGroup::new("ctx", "ctx", "Contextual image");
        group.index = -1;
        scene.insert_group(group);
        assert!(scene.create_layer("ctx", image_layer("contextual_a", "ctx.png"), true));
        assert!(scene.find_layer("contextual_a").unwrap().is_pending());

        assert!(scene.wait_idle(WAIT));
        let res = *scene.find_layer("contextual_a").unwrap().resource().unwrap();
        assert_eq!(res.quad, Size::new(8, 4));
        assert_eq!(res.render_order, 1);
        assert_eq!(scene.canvas(), Some(Size::new(8, 4)));
        assert_eq!(scene.backend().resident_count(), 1);
    }

    #[test]
    fn failed_load_leaves_layer_unloaded() {
        let mut scene = scene_with(MemoryFetcher::default());
        scene.insert_group(LayerGroup::new("base", "base", "Base image"));
        scene.create_layer("base", image_layer("base_x", "missing.png"), true);
        assert!(scene.wait_idle(WAIT));
        assert_eq!(scene.find_layer("base_x").unwrap().render, RenderState::Unloaded);
        assert_eq!(scene.backend().resident_count(), 0);
    }

    #[test]
    fn dispose_while_pending_drops_late_result() {
        let fetcher = MemoryFetcher::default().with_png("a.png", &RgbaImage::new(2, 2));
        let mut scene = scene_with(fetcher);
        scene.insert_group(LayerGroup::new("g", "g", ""));
        scene.create_layer("g", image_layer("a", "a.png"), true);
        scene.dispose_layer("a");
        assert!(scene.wait_idle(WAIT));
        assert_eq!(scene.find_layer("a").unwrap().render, RenderState::Unloaded);
        assert_eq!(scene.backend().resident_count(), 0);
    }

    #[test]
    fn reload_after_dispose_recreates_resource() {
        let fetcher = MemoryFetcher::default().with_png("a.png", &RgbaImage::new(2, 2));
        let mut scene = scene_with(fetcher);
        scene.insert_group(LayerGroup::new("g", "g", ""));
        scene.create_layer("g", image_layer("a", "a.png"), true);
        assert!(scene.wait_idle(WAIT));
        let first = scene.find_layer("a").unwrap().resource().unwrap().handle;

        scene.dispose_layer("a");
        scene.dispose_layer("a");
        assert_eq!(scene.backend().resident_count(), 0);

        scene.load_layer("a", false);
        assert!(scene.wait_idle(WAIT));
        let layer = scene.find_layer("a").unwrap();
        assert!(layer.is_loaded());
        assert!(!layer.interpolated);
        assert_ne!(layer.resource().unwrap().handle, first);
        assert_eq!(scene.backend().resident_count(), 1);
    }

    #[test]
    fn auxiliary_layers_load_without_fetching() {
        let mut scene = scene_with(MemoryFetcher::default());
        scene.insert_group(LayerGroup::new("selection", "Selection", ""));
        let layer = Layer::new("selection_dr", ImageSource::Auxiliary, LayerType::Selection);
        scene.create_layer("selection", layer, true);
        assert_eq!(scene.drain(), 1);
        assert!(scene.find_layer("selection_dr").unwrap().is_loaded());
    }

    #[test]
    fn registration_applies_recipe_with_fetched_sizes() {
        let recipe = r#"{"target":[[10,10],[10,90],[90,90],[90,10]],"moving":[[10,10],[10,90],[90,90],[90,10]]}"#;
        let fetcher = MemoryFetcher::default()
            .with_png("base.png", &RgbaImage::new(100, 100))
            .with_png("ctx.png", &RgbaImage::new(100, 100))
            .with("ctx.json", recipe);
        let mut scene = scene_with(fetcher);
        scene.set_canvas_location("base.png");
        scene.insert_group(LayerGroup::new("ctx", "ctx", ""));
        let mut layer = image_layer("ctx", "ctx.png");
        layer.transform = Matrix3([3.0, 0.0, 0.0, 0.0, 3.0, 0.0, 0.0, 0.0, 1.0]);
        scene.create_layer("ctx", layer, false);
        scene.request_registration(vec!["ctx".into()], "ctx.json".into(), "ctx.png".into());
        assert!(scene.wait_idle(WAIT));
        assert!(scene.find_layer("ctx").unwrap().transform.is_identity(1e-9));
    }

    #[test]
    fn clear_disposes_everything_and_ignores_stale_registrations() {
        let fetcher = MemoryFetcher::default().with_png("a.png", &RgbaImage::new(2, 2));
        let mut scene = scene_with(fetcher);
        scene.insert_group(LayerGroup::new("g", "g", ""));
        scene.create_layer("g", image_layer("a", "a.png"), true);
        assert!(scene.wait_idle(WAIT));
        assert_eq!(scene.backend().resident_count(), 1);

        scene.request_registration(vec!["a".into()], "none.json".into(), "a.png".into());
        scene.clear();
        assert_eq!(scene.backend().resident_count(), 0);
        assert!(scene.groups().is_empty());
        assert!(scene.wait_idle(WAIT));
    }

    #[test]
    fn reload_takes_canvas_from_new_workspace() {
        let fetcher = MemoryFetcher::default().with_png("old.png", &RgbaImage::new(8, 8));
        let mut scene = scene_with(fetcher);
        scene.set_canvas_location("old.png");
        scene.insert_group(LayerGroup::new("base", "base", ""));
        scene.create_layer("base", image_layer("base_x", "old.png"), true);
        scene.clear();

        // The new base image is missing, so nothing may size the canvas.
        scene.set_canvas_location("new.png");
        scene.insert_group(LayerGroup::new("base", "base", ""));
        scene.create_layer("base", image_layer("base_y", "new.png"), true);
        assert!(scene.wait_idle(WAIT));
        assert_eq!(scene.canvas(), None);
        assert_eq!(scene.find_layer("base_y").unwrap().render, RenderState::Unloaded);
        assert_eq!(scene.backend().resident_count(), 0);
    }

    #[test]
    fn load_results_from_before_clear_are_dropped() {
        let mut scene = scene_with(MemoryFetcher::default());
        let stale = scene.generation();
        scene.clear();

        scene.insert_group(LayerGroup::new("g", "g", ""));
        scene.create_layer("g", image_layer("a", "a.png"), false);
        scene.find_layer_mut("a").unwrap().render = RenderState::Pending { ticket: 7 };
        scene.local.push(BgResult::LayerLoaded {
            generation: stale,
            layer_id: "a".into(),
            ticket: 7,
            image: RgbaImage::new(8, 8),
            canvas: Some(Size::new(8, 8)),
        });
        assert_eq!(scene.drain(), 1);
        assert_eq!(scene.canvas(), None);
        assert_eq!(scene.find_layer("a").unwrap().render, RenderState::Pending { ticket: 7 });
        assert_eq!(scene.backend().resident_count(), 0);

        let current = scene.generation();
        scene.local.push(BgResult::LayerLoaded {
            generation: current,
            layer_id: "a".into(),
            ticket: 7,
            image: RgbaImage::new(2, 2),
            canvas: Some(Size::new(4, 2)),
        });
        scene.drain();
        assert_eq!(scene.canvas(), Some(Size::new(4, 2)));
        assert_eq!(scene.find_layer("a").unwrap().resource().unwrap().quad, Size::new(4, 2));
    }

    #[test]
    fn result_for_missing_layer_does_not_size_canvas() {
        let mut scene = scene_with(MemoryFetcher::default());
        let current = scene.generation();
        scene.local.push(BgResult::LayerLoaded {
            generation: current,
            layer_id: "gone".into(),
            ticket: 1,
            image: RgbaImage::new(8, 8),
            canvas: Some(Size::new(8, 8)),
        });
        scene.drain();
        assert_eq!(scene.canvas(), None);
    }

    #[test]
    fn replacing_a_group_disposes_old_layers() {
        let fetcher = MemoryFetcher::default().with_png("a.png", &RgbaImage::new(2, 2));
        let mut scene = scene_with(fetcher);
        scene.insert_group(LayerGroup::new("g", "g", ""));
        scene.create_layer("g", image_layer("a", "a.png"), true);
        assert!(scene.wait_idle(WAIT));
        scene.insert_group(LayerGroup::new("g", "g2", ""));
        assert_eq!(scene.backend().resident_count(), 0);
        assert_eq!(scene.groups().len(), 1);
        assert_eq!(scene.group("g").unwrap().name, "g2");
    }
}
