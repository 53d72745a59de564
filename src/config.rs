use std::{path::PathBuf, time::Duration};

use serde::Deserialize;

use crate::color::hex_or;

pub const DEFAULT_SELECTION_FILL: [u8; 3] = [0xFF, 0xEF, 0x00];
pub const DEFAULT_SELECTION_OPACITY: f32 = 0.5;
pub const DEFAULT_BITMASK_SIZE: u32 = 256;
pub const DEFAULT_LOAD_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
/// Persisted settings for the compositor.
pub struct AppConfig {
    pub data_root: Option<PathBuf>,
    /// `auto`, `cpu` or `gpu`.
    pub render_backend: Option<String>,
    pub selection_fill_color: Option<String>,
    pub selection_opacity: Option<f32>,
    pub bitmask_size: Option<u32>,
    pub output_long_edge: Option<u32>,
    pub load_timeout_secs: Option<u64>,
}

impl AppConfig {
    /// Returns the user config file path, if a config directory is available.
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("xrf-compositor").join("config.toml"))
    }

    /// Loads config from disk, falling back to defaults on any error.
    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };
        let Ok(contents) = std::fs::read_to_string(&path) else {
            return Self::default();
        };
        Self::parse(&contents)
    }

    fn parse(contents: &str) -> Self {
        toml::from_str(contents).unwrap_or_else(|err| {
            tracing::warn!(error = %err, "ignoring malformed config");
            Self::default()
        })
    }

    pub fn selection_fill(&self) -> [u8; 3] {
        self.selection_fill_color
            .as_deref()
            .map_or(DEFAULT_SELECTION_FILL, |hex| hex_or(hex, DEFAULT_SELECTION_FILL))
    }

    pub fn selection_opacity(&self) -> f32 {
        self.selection_opacity
            .filter(|o| o.is_finite())
            .map_or(DEFAULT_SELECTION_OPACITY, |o| o.clamp(0.0, 1.0))
    }

    /// Side length of the compact selection bitmasks. Zero falls back to the default.
    pub fn bitmask_size(&self) -> u32 {
        self.bitmask_size
            .filter(|&s| s > 0)
            .unwrap_or(DEFAULT_BITMASK_SIZE)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.load_timeout_secs.unwrap_or(DEFAULT_LOAD_TIMEOUT_SECS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_use_defaults() {
        let config = AppConfig::parse("");
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.selection_fill(), [255, 239, 0]);
        assert_eq!(config.selection_opacity(), 0.5);
        assert_eq!(config.bitmask_size(), 256);
        assert_eq!(config.load_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn parses_every_field() {
        let config = AppConfig::parse(
            r##"
            data_root = "/data/painting"
            render_backend = "cpu"
            selection_fill_color = "#00ff00"
            selection_opacity = 0.25
            bitmask_size = 128
            output_long_edge = 1024
            load_timeout_secs = 5
            "##,
        );
        assert_eq!(config.data_root, Some(PathBuf::from("/data/painting")));
        assert_eq!(config.render_backend.as_deref(), Some("cpu"));
        assert_eq!(config.selection_fill(), [0, 255, 0]);
        assert_eq!(config.selection_opacity(), 0.25);
        assert_eq!(config.bitmask_size(), 128);
        assert_eq!(config.output_long_edge, Some(1024));
        assert_eq!(config.load_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn malformed_config_falls_back_to_defaults() {
        assert_eq!(AppConfig::parse("bitmask_size = \"big\""), AppConfig::default());
    }

    #[test]
    fn out_of_range_values_are_sanitized() {
        let config = AppConfig {
            selection_fill_color: Some("yellow".into()),
            selection_opacity: Some(3.0),
            bitmask_size: Some(0),
            ..Default::default()
        };
        assert_eq!(config.selection_fill(), DEFAULT_SELECTION_FILL);
        assert_eq!(config.selection_opacity(), 1.0);
        assert_eq!(config.bitmask_size(), DEFAULT_BITMASK_SIZE);
    }

    #[test]
    fn config_lives_in_its_own_directory() {
        if let Some(path) = AppConfig::config_path() {
            assert!(path.ends_with("xrf-compositor/config.toml"), "{}", path.display());
        }
    }
}
