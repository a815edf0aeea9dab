//! Configuration loading

use anyhow::{Context, Result};
use indicam_camera::{ControllerConfig, ErrorPolicy};
use indicam_core::{CapabilityProfile, ProfileIndex};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub profiles: ProfilesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Property server host
    #[serde(default = "default_host")]
    pub host: String,
    /// Property server port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    7624
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Camera model, built-in or from the profile index
    #[serde(default = "default_model")]
    pub model: String,
    /// Seconds to wait for a write to be confirmed
    #[serde(default = "default_confirm_timeout")]
    pub confirm_timeout_secs: f64,
    /// Seconds to wait past the exposure time for the image
    #[serde(default = "default_grace")]
    pub grace_secs: f64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// End an exposure on the first server error message
    #[serde(default)]
    pub fail_on_server_error: bool,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            confirm_timeout_secs: default_confirm_timeout(),
            grace_secs: default_grace(),
            poll_interval_ms: default_poll_interval(),
            fail_on_server_error: false,
        }
    }
}

fn default_model() -> String {
    "sim".to_string()
}

fn default_confirm_timeout() -> f64 {
    5.0
}

fn default_grace() -> f64 {
    10.0
}

fn default_poll_interval() -> u64 {
    100
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfilesConfig {
    /// Optional TOML profile index consulted before the built-in models
    #[serde(default)]
    pub index: Option<PathBuf>,
}

impl Config {
    pub fn to_controller_config(&self) -> Result<ControllerConfig> {
        Ok(ControllerConfig {
            confirm_timeout: seconds(
                "camera.confirm_timeout_secs",
                self.camera.confirm_timeout_secs,
            )?,
            grace: seconds("camera.grace_secs", self.camera.grace_secs)?,
            poll_interval: Duration::from_millis(self.camera.poll_interval_ms.max(1)),
            error_policy: if self.camera.fail_on_server_error {
                ErrorPolicy::FailFast
            } else {
                ErrorPolicy::KeepWaiting
            },
        })
    }

    /// Profile index from the configured path, or an empty one
    pub fn profile_index(&self) -> Result<ProfileIndex> {
        match &self.profiles.index {
            Some(path) => {
                let index = ProfileIndex::from_file(path)
                    .with_context(|| format!("loading profile index {}", path.display()))?;
                info!(path = %path.display(), profiles = index.profile.len(), "Loaded profile index");
                Ok(index)
            }
            None => Ok(ProfileIndex::default()),
        }
    }

    /// Resolve the configured camera model
    pub fn profile(&self) -> Result<CapabilityProfile> {
        Ok(self.profile_index()?.resolve(&self.camera.model)?)
    }
}

fn seconds(key: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| {
        format!(
            "{} must be a finite, non-negative number of seconds, got {}",
            key, value
        )
    })
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}

/// Save default configuration to file
pub fn save_default_config(path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(&Config::default())?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.server.host, "localhost");
        assert_eq!(config.server.port, 7624);
        assert_eq!(config.camera.model, "sim");
    }

    #[test]
    fn test_partial_file() {
        let config: Config = toml::from_str(
            r#"
[camera]
model = "f9wfs"
grace_secs = 20.0
fail_on_server_error = true
"#,
        )
        .unwrap();
        assert_eq!(config.server.port, 7624);

        let controller = config.to_controller_config().unwrap();
        assert_eq!(controller.grace, Duration::from_secs(20));
        assert_eq!(controller.confirm_timeout, Duration::from_secs(5));
        assert_eq!(controller.error_policy, ErrorPolicy::FailFast);
        assert_eq!(config.profile().unwrap().camera_name, "F/9 WFS");
    }

    #[test]
    fn test_unrepresentable_timeouts_are_errors() {
        for text in [
            "[camera]\ngrace_secs = inf",
            "[camera]\nconfirm_timeout_secs = nan",
            "[camera]\ngrace_secs = -1.0",
        ] {
            let config: Config = toml::from_str(text).unwrap();
            assert!(config.to_controller_config().is_err(), "accepted {:?}", text);
        }
    }

    #[test]
    fn test_default_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("indicam.toml");
        save_default_config(&path).unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.camera.poll_interval_ms, 100);
        assert!(config.profiles.index.is_none());
    }

    #[test]
    fn test_profile_index_overrides_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let index_path = dir.path().join("profiles.toml");
        let mut index = ProfileIndex::default();
        let mut profile = CapabilityProfile::builtin("sim").unwrap();
        profile.camera_name = "Bench Camera".to_string();
        index.add(profile);
        index.to_file(&index_path).unwrap();

        let mut config = Config::default();
        config.profiles.index = Some(index_path);
        assert_eq!(config.profile().unwrap().camera_name, "Bench Camera");

        config.camera.model = "unknown".to_string();
        assert!(config.profile().is_err());
    }
}
