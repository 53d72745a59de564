use std::{
    collections::HashMap,
    path::{Component, Path, PathBuf},
    sync::{Arc, Mutex, OnceLock},
};

use anyhow::{Context, bail};

use crate::geometry::Size;
use crate::registering::RegisteringRecipe;

/// Transport for recipes, rasters and size documents, addressed by location string.
pub trait ResourceFetcher: Send + Sync {
    fn fetch(&self, location: &str) -> anyhow::Result<Vec<u8>>;
}

/// Companion location answering `{width, height}` for an image.
pub fn size_location(image_location: &str) -> String {
    format!("{}/size", image_location.trim_end_matches('/'))
}

/// Serves locations as paths relative to a data root.
///
/// `<image>/size` is answered from the image header, with stringified
/// dimensions like the HTTP endpoint.
pub struct DirectoryFetcher {
    root: PathBuf,
}

impl DirectoryFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, location: &str) -> anyhow::Result<PathBuf> {
        let relative = Path::new(location.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            bail!("location escapes data root: {location}");
        }
        Ok(self.root.join(relative))
    }
}

impl ResourceFetcher for DirectoryFetcher {
    fn fetch(&self, location: &str) -> anyhow::Result<Vec<u8>> {
        if let Some(image) = location.strip_suffix("/size") {
            let path = self.resolve(image)?;
            let (width, height) = image::image_dimensions(&path)
                .with_context(|| format!("failed to read dimensions of {}", path.display()))?;
            let doc = serde_json::json!({
                "width": width.to_string(),
                "height": height.to_string(),
            });
            return Ok(serde_json::to_vec(&doc)?);
        }
        let path = self.resolve(location)?;
        std::fs::read(&path).with_context(|| format!("failed to read {}", path.display()))
    }
}

type Slot<T> = Arc<Mutex<Option<T>>>;

/// Process-lifetime cache of recipes and image sizes, keyed by location.
///
/// Concurrent requests for the same key wait on one shared slot, so each
/// location is fetched at most once. Entries are never invalidated.
pub struct ResourceCache {
    fetcher: Arc<dyn ResourceFetcher>,
    recipes: Mutex<HashMap<String, Arc<OnceLock<RegisteringRecipe>>>>,
    sizes: Mutex<HashMap<String, Slot<Size>>>,
}

impl ResourceCache {
    pub fn new(fetcher: Arc<dyn ResourceFetcher>) -> Self {
        Self {
            fetcher,
            recipes: Mutex::new(HashMap::new()),
            sizes: Mutex::new(HashMap::new()),
        }
    }

    /// Uncached passthrough for large payloads (rasters).
    pub fn fetch(&self, location: &str) -> anyhow::Result<Vec<u8>> {
        self.fetcher.fetch(location)
    }

    /// Resolves a recipe. Fetch or parse failures resolve to
    /// [`RegisteringRecipe::fallback`], which is cached like a real recipe.
    pub fn recipe(&self, location: &str) -> RegisteringRecipe {
        let slot = {
            let mut recipes = self.recipes.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(recipes.entry(location.to_string()).or_default())
        };
        slot.get_or_init(|| match self.load_recipe(location) {
            Ok(recipe) => recipe,
            Err(err) => {
                tracing::warn!(location, error = %err, "failed to gather registering recipe");
                RegisteringRecipe::fallback()
            }
        })
        .clone()
    }

    fn load_recipe(&self, location: &str) -> anyhow::Result<RegisteringRecipe> {
        let bytes = self.fetcher.fetch(location)?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("invalid registering recipe at {location}"))
    }

    /// Resolves `{width, height}` for an image location. Only successes are cached.
    pub fn image_size(&self, image_location: &str) -> anyhow::Result<Size> {
        let location = size_location(image_location);
        let slot = {
            let mut sizes = self.sizes.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(sizes.entry(location.clone()).or_default())
        };
        let mut cached = slot.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(size) = *cached {
            return Ok(size);
        }
        let bytes = self.fetcher.fetch(&location)?;
        let size: Size = serde_json::from_slice(&bytes)
            .with_context(|| format!("invalid size document at {location}"))?;
        *cached = Some(size);
        Ok(size)
    }
}

#[cfg(test)]
/// In-memory fetcher that counts requests per location.
#[derive(Default)]
pub(crate) struct MemoryFetcher {
    entries: HashMap<String, Vec<u8>>,
    calls: Mutex<HashMap<String, usize>>,
}

#[cfg(test)]
impl MemoryFetcher {
    pub(crate) fn with(self, location: &str, body: &str) -> Self {
        self.with_bytes(location, body.as_bytes().to_vec())
    }

    pub(crate) fn with_bytes(mut self, location: &str, body: Vec<u8>) -> Self {
        self.entries.insert(location.to_string(), body);
        self
    }

    /// Adds a PNG plus its `/size` document.
    pub(crate) fn with_png(self, location: &str, img: &image::RgbaImage) -> Self {
        let mut png = std::io::Cursor::new(Vec::new());
        img.write_to(&mut png, image::ImageFormat::Png)
            .expect("png encode");
        let size = format!(r#"{{"width":"{}","height":"{}"}}"#, img.width(), img.height());
        self.with_bytes(location, png.into_inner())
            .with(&size_location(location), &size)
    }

    pub(crate) fn calls(&self, location: &str) -> usize {
        self.calls.lock().unwrap().get(location).copied().unwrap_or(0)
    }
}

#[cfg(test)]
impl ResourceFetcher for MemoryFetcher {
    fn fetch(&self, location: &str) -> anyhow::Result<Vec<u8>> {
        *self.calls.lock().unwrap().entry(location.to_string()).or_default() += 1;
        // Widens the race window for dedup tests.
        std::thread::sleep(std::time::Duration::from_millis(2));
        self.entries
            .get(location)
            .cloned()
            .with_context(|| format!("404 {location}"))
    }
}
