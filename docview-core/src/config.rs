use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::layout::{Margins, PageLayout, ZoomMode};

pub const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path:?}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub render: RenderConfig,
    pub search: SearchConfig,
    pub view: ViewConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Render jobs allowed to run at once; extra requests wait in FIFO order.
    pub request_limit: usize,
    /// Pages kept in the bitmap cache.
    pub cache_limit: usize,
    /// Threads in the render pool.
    pub render_threads: usize,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            request_limit: 5,
            cache_limit: 10,
            render_threads: 4,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Needles are case-folded unless this is set.
    pub case_sensitive: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewConfig {
    pub page_layout: PageLayout,
    pub zoom_mode: ZoomMode,
    pub zoom_factor: f64,
    pub continuous: bool,
    pub page_spacing: i32,
    pub margins: Margins,
    /// Screen pixels per point; 96 dpi screens use 96/72.
    pub screen_resolution: f64,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            page_layout: PageLayout::SinglePage,
            zoom_mode: ZoomMode::CustomZoom,
            zoom_factor: 1.0,
            continuous: true,
            page_spacing: 3,
            margins: Margins::uniform(6),
            screen_resolution: 96.0 / 72.0,
        }
    }
}

impl ViewerConfig {
    pub fn from_toml_str(source: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: ViewerConfig = toml::from_str(source).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let source = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source, path)
    }

    /// Reads `config.toml` from `dir`, falling back to defaults when absent.
    pub fn load_or_default(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join(CONFIG_FILE_NAME);
        if !path.exists() {
            debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    pub fn to_toml_string(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.render.request_limit == 0 {
            return Err(ConfigError::Invalid(
                "render.request_limit must be at least 1".into(),
            ));
        }
        if self.render.cache_limit == 0 {
            return Err(ConfigError::Invalid(
                "render.cache_limit must be at least 1".into(),
            ));
        }
        if self.render.render_threads == 0 {
            return Err(ConfigError::Invalid(
                "render.render_threads must be at least 1".into(),
            ));
        }
        if !(self.view.zoom_factor.is_finite() && self.view.zoom_factor > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "view.zoom_factor must be positive, got {}",
                self.view.zoom_factor
            )));
        }
        Ok(())
    }
}
