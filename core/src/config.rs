//! Persisted agent configuration (§6 ambient config section).
//!
//! Carries the teacher's load/save/env-override/atomic-write pattern from
//! `config.rs`, replacing the CLI-specific field set with the persisted
//! state §6 actually names. The JWT itself is not serialized here; it lives
//! in [`crate::keyring::Credentials`].

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::{fs, path::PathBuf};

use crate::keyring::Credentials;

fn default_version() -> u32 {
    2
}

/// Agent-side persisted configuration (§6's key list).
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    pub server_ip: String,
    pub server_port: u16,
    pub api_url: String,
    pub api_username: String,
    /// Directory JWT. Not serialized; stored in the OS keyring instead.
    #[serde(skip)]
    pub api_token: String,
    pub save_dir: PathBuf,
    pub auto_start: bool,
    pub clipboard_sync: bool,
    pub screen_quality: u32,
    pub screen_fps: u32,
    pub thumbnail_quality: u32,
    pub thumbnail_width: u32,
    pub heartbeat_interval: u64,
    pub ws_port: u16,
    pub ws_max_connections: usize,
}

impl Default for Config {
    fn default() -> Self {
        let save_dir = if crate::env::is_any_test() {
            PathBuf::from(env!("CARGO_MANIFEST_DIR"))
                .parent()
                .map(|p| p.join("tmp/wellcom-transfers"))
                .unwrap_or_else(|| PathBuf::from("tmp/wellcom-transfers"))
        } else {
            dirs::home_dir()
                .map(|h| h.join("wellcom-transfers"))
                .unwrap_or_else(|| PathBuf::from("wellcom-transfers"))
        };

        Self {
            version: default_version(),
            server_ip: String::new(),
            server_port: 21350,
            api_url: crate::env::DEFAULT_SERVER_URL.to_string(),
            api_username: String::new(),
            api_token: String::new(),
            save_dir,
            auto_start: false,
            clipboard_sync: true,
            screen_quality: 75,
            screen_fps: 30,
            thumbnail_quality: 40,
            thumbnail_width: 320,
            heartbeat_interval: 30,
            ws_port: 21350,
            ws_max_connections: 8,
        }
    }
}

impl Config {
    /// Directory selection priority mirrors the teacher's `config_dir`:
    /// test build ⇒ repo-local `tmp/`; `WELLCOM_CONFIG_DIR` override;
    /// `WELLCOM_ENV=test` ⇒ repo-local `tmp/`; otherwise the platform
    /// config directory.
    pub fn config_dir() -> Result<PathBuf> {
        let dir = {
            #[cfg(test)]
            {
                PathBuf::from(env!("CARGO_MANIFEST_DIR"))
                    .parent()
                    .context("core/ has no parent directory")?
                    .join("tmp/wellcom-test")
            }

            #[cfg(not(test))]
            {
                if let Ok(dir) = std::env::var("WELLCOM_CONFIG_DIR") {
                    PathBuf::from(dir)
                } else if crate::env::should_skip_keyring() {
                    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
                        .parent()
                        .context("core/ has no parent directory")?
                        .join("tmp/wellcom-test")
                } else {
                    dirs::config_dir()
                        .context("could not determine config directory")?
                        .join(crate::env::APP_NAME)
                }
            }
        };
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Load the config file, apply env overrides, then fill the token from
    /// the keyring (or the `WELLCOM_TOKEN` env var for CI).
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file().unwrap_or_else(|_| Self::default());
        config.migrate();
        config.apply_env_overrides();

        if config.api_token.is_empty() {
            if let Ok(creds) = Credentials::load() {
                if let Some(token) = creds.api_token() {
                    config.api_token = token.to_string();
                }
            }
        }

        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let path = Self::config_dir()?.join("config.json");
        if path.exists() {
            let content = fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            anyhow::bail!("config file not found")
        }
    }

    /// Bring values written by an older schema version up to the current
    /// bounds. Version 1 configs predate FPS/quality clamping; re-clamp
    /// them here rather than trusting whatever a hand-edited file says.
    fn migrate(&mut self) {
        if self.version < 2 {
            self.screen_fps = self.screen_fps.clamp(1, 60);
            self.screen_quality = self.screen_quality.clamp(1, 100);
            self.thumbnail_quality = self.thumbnail_quality.clamp(1, 100);
            self.version = default_version();
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("WELLCOM_API_URL") {
            self.api_url = v;
        }
        if let Ok(v) = std::env::var("WELLCOM_TOKEN") {
            self.api_token = v;
        }
        if let Ok(v) = std::env::var("WELLCOM_SERVER_IP") {
            self.server_ip = v;
        }
        if let Ok(v) = std::env::var("WELLCOM_SERVER_PORT") {
            if let Ok(port) = v.parse() {
                self.server_port = port;
            }
        }
        if let Ok(v) = std::env::var("WELLCOM_WS_PORT") {
            if let Ok(port) = v.parse() {
                self.ws_port = port;
            }
        }
    }

    /// Write atomically: serialize to a temp file in the same directory,
    /// then rename over the target, so a crash mid-write never leaves a
    /// truncated config on disk.
    pub fn save(&self) -> Result<()> {
        let dir = Self::config_dir()?;
        let path = dir.join("config.json");
        let tmp_path = dir.join("config.json.tmp");

        fs::write(&tmp_path, serde_json::to_string_pretty(self)?)?;
        #[cfg(unix)]
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))?;
        fs::rename(&tmp_path, &path)?;

        Ok(())
    }

    pub fn save_token(&mut self, token: &str) -> Result<()> {
        self.api_token = token.to_string();
        let mut creds = Credentials::load().unwrap_or_default();
        creds.set_api_token(token.to_string());
        creds.save()
    }

    pub fn clear_token(&mut self) -> Result<()> {
        self.api_token.clear();
        let mut creds = Credentials::load().unwrap_or_default();
        creds.clear_api_token();
        creds.save()
    }

    pub fn has_token(&self) -> bool {
        !self.api_token.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_defaults() {
        let config = Config::default();
        assert_eq!(config.ws_port, 21350);
        assert_eq!(config.screen_fps, 30);
        assert_eq!(config.screen_quality, 75);
        assert!(config.clipboard_sync);
    }

    #[test]
    fn serialization_excludes_token() {
        let mut config = Config::default();
        config.api_token = "super-secret-jwt".to_string();
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("super-secret-jwt"));
    }

    #[test]
    fn migrate_clamps_out_of_range_v1_values() {
        let mut config = Config::default();
        config.version = 1;
        config.screen_fps = 500;
        config.screen_quality = 0;
        config.migrate();
        assert_eq!(config.version, 2);
        assert_eq!(config.screen_fps, 60);
        assert_eq!(config.screen_quality, 1);
    }

    #[test]
    fn has_token_reflects_presence() {
        let mut config = Config::default();
        assert!(!config.has_token());
        config.api_token = "jwt".to_string();
        assert!(config.has_token());
    }
}
