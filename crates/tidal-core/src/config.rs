use directories::{BaseDirs, ProjectDirs};
use eyre::{eyre, Context, Result};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::chunk::StoreLimits;
use crate::profile::{ConnectionClass, Profile, ProfileOverrides};

pub const CONFIG_FILE: &str = "config.toml";
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

static CONFIG_DIR_OVERRIDE: Lazy<RwLock<Option<PathBuf>>> = Lazy::new(|| RwLock::new(None));

/// Override the configuration directory for the current process.
/// Subsequent calls replace the previous override.
pub fn set_config_dir<P: AsRef<Path>>(path: P) {
    *CONFIG_DIR_OVERRIDE.write() = Some(path.as_ref().to_path_buf());
}

/// Clear any previously configured override.
pub fn clear_config_dir_override() {
    CONFIG_DIR_OVERRIDE.write().take();
}

/// Return the current override path, if one has been set.
pub fn config_dir_override() -> Option<PathBuf> {
    CONFIG_DIR_OVERRIDE.read().clone()
}

/// Resolve the configuration directory.
/// Priority: explicit override -> platform standard -> ~/.config/tidal
pub fn config_dir() -> Result<PathBuf> {
    if let Some(path) = CONFIG_DIR_OVERRIDE.read().clone() {
        return Ok(path);
    }

    if let Some(proj) = ProjectDirs::from("com", "Tidal", "Tidal") {
        return Ok(proj.config_dir().to_path_buf());
    }

    if let Some(base) = BaseDirs::new() {
        return Ok(base.home_dir().join(".config").join("tidal"));
    }

    Err(eyre!(
        "unable to determine configuration directory for tidal (no override and no platform default)"
    ))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistorySettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn default_true() -> bool {
    true
}

/// Contents of `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TidalConfig {
    /// Base URL of the signing service.
    pub endpoint: Option<String>,
    /// Connection class used when no estimate is available.
    pub default_profile: Option<ConnectionClass>,
    pub content_type: Option<String>,
    /// Per-class overrides keyed by class name.
    #[serde(default)]
    pub profiles: BTreeMap<ConnectionClass, ProfileOverrides>,
    #[serde(default)]
    pub history: HistorySettings,
}

impl TidalConfig {
    /// Load `config.toml` from `dir`. A missing file yields the defaults.
    pub fn load_from(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)
            .wrap_err_with(|| format!("failed to read config file: {}", path.display()))?;
        let config: TidalConfig = toml::from_str(&content)
            .wrap_err_with(|| format!("failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the resolved configuration directory.
    pub fn load() -> Result<Self> {
        Self::load_from(&config_dir()?)
    }

    pub fn save_to(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)
            .wrap_err_with(|| format!("failed to create config directory {}", dir.display()))?;
        let path = dir.join(CONFIG_FILE);
        let content = toml::to_string_pretty(self).wrap_err("serialize configuration")?;
        fs::write(&path, content)
            .wrap_err_with(|| format!("failed to write config file: {}", path.display()))
    }

    /// Reject overrides that would produce an inconsistent profile.
    pub fn validate(&self) -> Result<()> {
        let limits = StoreLimits::default();
        for class in self.profiles.keys() {
            self.profile(*class, &limits)
                .wrap_err_with(|| format!("invalid [profiles.{}] section", class))?;
        }
        Ok(())
    }

    /// The built-in profile for `class` with any configured overrides applied.
    pub fn profile(&self, class: ConnectionClass, limits: &StoreLimits) -> Result<Profile> {
        let base = Profile::for_class(class);
        match self.profiles.get(&class) {
            Some(overrides) => base.with_overrides(overrides, limits),
            None => Ok(base),
        }
    }

    pub fn content_type(&self) -> &str {
        self.content_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE)
    }
}
