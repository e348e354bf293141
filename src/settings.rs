//! Host settings with persistence
//!
//! Settings are saved to `~/.config/cadence/settings.toml`

use std::fs;
use std::path::PathBuf;

use cadence_core::TimeConfig;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// All host settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub runtime: RuntimeSettings,
    pub time: TimeConfig,
    pub demo: DemoSettings,
}

impl Settings {
    /// Get the config directory path
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("cadence"))
    }

    /// Get the settings file path
    pub fn settings_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("settings.toml"))
    }

    /// Load settings from disk, or return defaults if not found
    pub fn load() -> Self {
        let Some(path) = Self::settings_path() else {
            warn!("Could not determine config directory");
            return Self::default();
        };

        if !path.exists() {
            info!("No settings file found, using defaults");
            return Self::default();
        }

        match fs::read_to_string(&path) {
            Ok(content) => match Self::parse(&content) {
                Ok(settings) => {
                    info!("Loaded settings from {:?}", path);
                    settings
                }
                Err(e) => {
                    warn!("Invalid settings: {:#}, using defaults", e);
                    Self::default()
                }
            },
            Err(e) => {
                warn!("Failed to read settings file: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Parse and validate a settings document
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let settings: Self = toml::from_str(content)?;
        settings.time.validate()?;
        if !settings.runtime.fixed_delta.is_finite() || settings.runtime.fixed_delta <= 0.0 {
            anyhow::bail!("fixed_delta must be positive, got {}", settings.runtime.fixed_delta);
        }
        Ok(settings)
    }

    /// Save settings to disk
    pub fn save(&self) -> anyhow::Result<()> {
        let Some(dir) = Self::config_dir() else {
            anyhow::bail!("Could not determine config directory");
        };

        let path = dir.join("settings.toml");

        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content)?;
        info!("Saved settings to {:?}", path);
        Ok(())
    }
}

/// How the host drives the frame loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Number of frames to run
    pub frames: u64,
    /// Seconds fed to the clock every frame
    pub fixed_delta: f32,
    /// Default log filter, overridden by `RUST_LOG`
    pub log_level: String,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            frames: 600,
            fixed_delta: 1.0 / 60.0,
            log_level: "info".to_string(),
        }
    }
}

/// Parameters of the demo scene
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoSettings {
    /// Game seconds between spawns
    pub spawn_interval: f32,
    /// Game seconds a spawned entity lives
    pub lifetime: f32,
    /// Stop spawning after this many entities
    pub max_spawned: usize,
    /// Seed for drift velocities
    pub seed: u64,
}

impl Default for DemoSettings {
    fn default() -> Self {
        Self {
            spawn_interval: 0.5,
            lifetime: 2.0,
            max_spawned: 32,
            seed: 7,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let settings = Settings::parse(
            r#"
            [runtime]
            frames = 120

            [demo]
            lifetime = 0.5
            "#,
        )
        .unwrap();

        assert_eq!(settings.runtime.frames, 120);
        assert_eq!(settings.runtime.log_level, "info");
        assert_eq!(settings.demo.lifetime, 0.5);
        assert_eq!(settings.demo.max_spawned, 32);
        assert_eq!(settings.time, TimeConfig::default());
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(Settings::parse("[time]\ntime_scale = -2.0").is_err());
        assert!(Settings::parse("[runtime]\nfixed_delta = 0.0").is_err());
        assert!(Settings::parse("runtime = 3").is_err());
    }

    #[test]
    fn written_settings_parse_back() {
        let mut settings = Settings::default();
        settings.demo.seed = 99;
        let text = toml::to_string_pretty(&settings).unwrap();
        assert_eq!(Settings::parse(&text).unwrap(), settings);
    }
}
