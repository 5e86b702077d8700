//! Credential store
//!
//! Maps a PiControl service URL to the secrets obtained when logging in to
//! it. The MQTT layer only reads the broker username/password pair at
//! connect time.

use crate::transport::BrokerCredentials;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Failed to access credential store: {0}")]
    Io(#[from] io::Error),
    #[error("Credential store is corrupt: {0}")]
    Format(#[from] serde_json::Error),
    #[error("No credentials stored for {0}")]
    NotFound(String),
    #[error("Credentials for {0} carry no broker login")]
    NoBrokerLogin(String),
}

/// Secrets for one PiControl service
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceCredentials {
    pub password: String,
    pub token: String,
    pub mqtt_username: String,
    pub mqtt_password: String,
}

impl ServiceCredentials {
    /// Broker login, if the service handed one out
    pub fn broker_credentials(&self) -> Option<BrokerCredentials> {
        if self.mqtt_username.is_empty() {
            return None;
        }
        Some(BrokerCredentials::new(
            self.mqtt_username.clone(),
            self.mqtt_password.clone(),
        ))
    }
}

impl fmt::Debug for ServiceCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceCredentials")
            .field("password", &"***")
            .field("token", &"***")
            .field("mqtt_username", &self.mqtt_username)
            .field("mqtt_password", &"***")
            .finish()
    }
}

/// Service URL to credentials
pub type CredentialMap = BTreeMap<String, ServiceCredentials>;

pub trait CredentialStore: Send + Sync {
    fn load(&self) -> Result<CredentialMap, CredentialError>;

    fn save(&self, credentials: &CredentialMap) -> Result<(), CredentialError>;

    /// Broker login stored for `service_url`
    fn broker_credentials(&self, service_url: &str) -> Result<BrokerCredentials, CredentialError> {
        let credentials = self.load()?;
        let service = credentials
            .get(service_url)
            .ok_or_else(|| CredentialError::NotFound(service_url.to_string()))?;
        service
            .broker_credentials()
            .ok_or_else(|| CredentialError::NoBrokerLogin(service_url.to_string()))
    }
}

/// JSON file backed store
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for FileCredentialStore {
    /// A missing file is an empty store
    fn load(&self) -> Result<CredentialMap, CredentialError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No credential store yet");
                Ok(CredentialMap::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, credentials: &CredentialMap) -> Result<(), CredentialError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write next to the target and rename over it so readers never see
        // a half-written store
        let staging = self.path.with_extension("tmp");
        fs::write(&staging, serde_json::to_vec_pretty(credentials)?)?;
        fs::rename(&staging, &self.path)?;
        Ok(())
    }
}
