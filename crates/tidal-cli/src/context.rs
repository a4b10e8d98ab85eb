use eyre::{Context, Result};
use std::path::Path;
use tidal_core::config::{self, TidalConfig};
use tidal_core::perf_history;

#[derive(Debug, Clone)]
pub struct AppContext {
    pub config: TidalConfig,
    pub perf_history_enabled: bool,
}

impl AppContext {
    pub fn load() -> Result<Self> {
        Self::load_from(&config::config_dir()?)
    }

    pub fn load_from(dir: &Path) -> Result<Self> {
        let config = TidalConfig::load_from(dir)
            .with_context(|| format!("failed to load configuration from {}", dir.display()))?;
        let perf_history_enabled = config.history.enabled && !perf_history::perf_history_disabled();
        Ok(Self {
            config,
            perf_history_enabled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;
    use tidal_core::profile::ConnectionClass;

    #[test]
    fn missing_config_uses_defaults() {
        let dir = tempdir().unwrap();
        let ctx = AppContext::load_from(dir.path()).unwrap();
        assert_eq!(ctx.config, TidalConfig::default());
        assert_eq!(ctx.perf_history_enabled, !perf_history::perf_history_disabled());
    }

    #[test]
    fn config_can_switch_history_off() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(config::CONFIG_FILE),
            "endpoint = \"https://sign.example.com\"\ndefault_profile = \"fiber\"\n\n[history]\nenabled = false\n",
        )
        .unwrap();
        let ctx = AppContext::load_from(dir.path()).unwrap();
        assert!(!ctx.perf_history_enabled);
        assert_eq!(ctx.config.endpoint.as_deref(), Some("https://sign.example.com"));
        assert_eq!(ctx.config.default_profile, Some(ConnectionClass::Fiber));
    }

    #[test]
    fn invalid_overrides_name_the_config_dir() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(config::CONFIG_FILE),
            "[profiles.dsl]\nparallel = 9\n",
        )
        .unwrap();
        let err = AppContext::load_from(dir.path()).unwrap_err();
        assert!(format!("{:#}", err).contains(&dir.path().display().to_string()));
    }
}
