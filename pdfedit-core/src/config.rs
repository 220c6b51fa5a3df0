use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::engine::PageSize;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZoomConfig {
    pub min: f32,
    pub max: f32,
    pub step: f32,
}

impl Default for ZoomConfig {
    fn default() -> Self {
        Self {
            min: 0.25,
            max: 4.0,
            step: 0.25,
        }
    }
}

impl ZoomConfig {
    pub fn clamp(&self, scale: f32) -> f32 {
        if scale.is_nan() {
            return 1.0_f32.clamp(self.min, self.max);
        }
        scale.clamp(self.min, self.max)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EditorConfig {
    pub zoom: ZoomConfig,
    /// Horizontal space kept free around the page by fit-to-width.
    pub fit_padding: f32,
    /// Width in pixels a thumbnail is scaled to fit.
    pub thumbnail_width: f32,
    /// Size of a blank page inserted with no reference page.
    pub default_page_size: PageSize,
    /// `tracing_subscriber::EnvFilter` directive used when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            zoom: ZoomConfig::default(),
            fit_padding: 40.0,
            thumbnail_width: 120.0,
            default_page_size: PageSize::US_LETTER,
            log_filter: "info".to_owned(),
        }
    }
}

impl EditorConfig {
    pub fn project_dirs() -> Result<ProjectDirs> {
        ProjectDirs::from("net", "pdfedit", "pdfedit")
            .ok_or_else(|| anyhow!("unable to resolve platform config directories"))
    }

    pub fn default_path() -> Result<PathBuf> {
        Ok(Self::project_dirs()?.config_dir().join("config.toml"))
    }

    /// Reads `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        let config: EditorConfig = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create config directory {:?}", parent))?;
        }
        let payload = toml::to_string_pretty(self)?;
        let tmp = path.with_extension("toml.tmp");
        fs::write(&tmp, payload).with_context(|| format!("failed to write {:?}", tmp))?;
        fs::rename(tmp, path)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let zoom = &self.zoom;
        if !(zoom.min > 0.0 && zoom.min <= zoom.max) {
            return Err(anyhow!(
                "zoom range {}..={} is invalid",
                zoom.min,
                zoom.max
            ));
        }
        if zoom.step <= 0.0 {
            return Err(anyhow!("zoom step must be positive"));
        }
        if !(self.thumbnail_width > 0.0) {
            return Err(anyhow!("thumbnail width must be positive"));
        }
        if self.default_page_size.width <= 0.0 || self.default_page_size.height <= 0.0 {
            return Err(anyhow!("default page size must be positive"));
        }
        Ok(())
    }
}
