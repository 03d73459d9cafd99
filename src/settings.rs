use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::data::model::BgType;
use crate::data::peak::DEFAULT_PEAK_MODEL;
use crate::data::processing::ShirleyParams;
use crate::data::region::RegionOptions;
use crate::data::spectrum::DEFAULT_VISIBILITY;

/// Environment variable naming the settings file.
pub const CONFIG_ENV: &str = "RUSTY_XPS_CONFIG";
/// Settings file used when [`CONFIG_ENV`] is unset.
pub const DEFAULT_CONFIG_FILE: &str = "rusty-xps.json";

/// User defaults for new regions and peaks. Missing keys take their
/// default, so older files keep loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub shirley: ShirleyParams,
    pub default_bgtype: BgType,
    pub default_peak_model: String,
    pub default_visibility: String,
    /// Project opened on start when no files are given.
    pub project_file: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            shirley: ShirleyParams::default(),
            default_bgtype: BgType::default(),
            default_peak_model: DEFAULT_PEAK_MODEL.to_string(),
            default_visibility: DEFAULT_VISIBILITY.to_string(),
            project_file: None,
        }
    }
}

impl Settings {
    /// Path from [`CONFIG_ENV`], or [`DEFAULT_CONFIG_FILE`].
    pub fn config_path() -> PathBuf {
        std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    /// Read settings; a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("no settings at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading settings {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing settings {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self).context("serializing settings")?;
        std::fs::write(path, text).with_context(|| format!("writing settings {}", path.display()))
    }

    pub fn region_options(&self) -> RegionOptions {
        RegionOptions {
            bgtype: self.default_bgtype,
            shirley: self.shirley,
        }
    }
}
