//! Persisted-secret storage for the directory service JWT (§6, ambient).
//!
//! Production: a single OS keyring entry `wellcom/credentials` containing
//! JSON. Test mode: a file at `{config_dir}/credentials.json`. Pattern and
//! fallback rule carried over from the teacher's consolidated keyring
//! entry, trimmed to the one secret this system actually has — no signing
//! keys or Signal Protocol session keys, since there is no E2E encryption
//! layer beyond TLS/JWT here.

use anyhow::{Context, Result};
use keyring::Entry;
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::fs;
use std::path::PathBuf;

const KEYRING_SERVICE: &str = "wellcom";
const KEYRING_CREDENTIALS: &str = "credentials";

fn should_skip_keyring() -> bool {
    #[cfg(test)]
    {
        return true;
    }

    #[cfg(not(test))]
    {
        if let Ok(env_val) = std::env::var("WELLCOM_ENV") {
            if env_val == "test" || env_val == "system_test" {
                return true;
            }
        }
        crate::env::should_skip_keyring()
    }
}

fn credentials_file_path() -> Result<PathBuf> {
    crate::config::Config::config_dir().map(|d| d.join("credentials.json"))
}

/// The directory service JWT, persisted outside the plain config file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Credentials {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
}

impl Credentials {
    pub fn load() -> Result<Self> {
        if should_skip_keyring() {
            return Self::load_from_file();
        }

        let entry = Entry::new(KEYRING_SERVICE, KEYRING_CREDENTIALS)
            .map_err(|e| anyhow::anyhow!("failed to create keyring entry: {e:?}"))?;

        match entry.get_password() {
            Ok(json) => {
                let creds: Credentials =
                    serde_json::from_str(&json).context("failed to parse credentials from keyring")?;
                Ok(creds)
            }
            Err(_) => Ok(Credentials::default()),
        }
    }

    fn load_from_file() -> Result<Self> {
        let path = credentials_file_path()?;
        if path.exists() {
            let content = fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            Ok(Credentials::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        if should_skip_keyring() {
            return self.save_to_file();
        }

        let entry = Entry::new(KEYRING_SERVICE, KEYRING_CREDENTIALS)
            .map_err(|e| anyhow::anyhow!("failed to create keyring entry: {e:?}"))?;
        let json = serde_json::to_string(self)?;
        entry
            .set_password(&json)
            .map_err(|e| anyhow::anyhow!("failed to store credentials in keyring: {e:?}"))?;
        Ok(())
    }

    fn save_to_file(&self) -> Result<()> {
        let path = credentials_file_path()?;
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json)?;

        #[cfg(unix)]
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    pub fn delete() -> Result<()> {
        if should_skip_keyring() {
            let path = credentials_file_path()?;
            if path.exists() {
                fs::remove_file(&path)?;
            }
            return Ok(());
        }

        let entry = Entry::new(KEYRING_SERVICE, KEYRING_CREDENTIALS)
            .map_err(|e| anyhow::anyhow!("failed to create keyring entry: {e:?}"))?;
        let _ = entry.delete_credential();
        Ok(())
    }

    pub fn api_token(&self) -> Option<&str> {
        self.api_token.as_deref()
    }

    pub fn set_api_token(&mut self, token: String) {
        self.api_token = Some(token);
    }

    pub fn clear_api_token(&mut self) {
        self.api_token = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_roundtrip_through_json() {
        let mut creds = Credentials::default();
        creds.set_api_token("jwt-abc".to_string());

        let json = serde_json::to_string(&creds).unwrap();
        let loaded: Credentials = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.api_token(), Some("jwt-abc"));
    }

    #[test]
    fn empty_token_skipped_in_json() {
        let creds = Credentials::default();
        let json = serde_json::to_string(&creds).unwrap();
        assert!(!json.contains("api_token"));
    }

    #[test]
    fn clear_api_token_removes_value() {
        let mut creds = Credentials::default();
        creds.set_api_token("jwt-abc".to_string());
        creds.clear_api_token();
        assert_eq!(creds.api_token(), None);
    }
}
