//! Stable per-installation device identity
//!
//! The id doubles as MQTT client id, so it must survive restarts for the
//! broker to resume the persistent session. It is generated once and kept
//! in a small file.

use crate::protocol::topics::{TopicBuilder, TopicError};
use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Failed to access identity file: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid device id: {0}")]
    Invalid(#[from] TopicError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    topics: TopicBuilder,
}

impl DeviceIdentity {
    pub fn new<S: Into<String>>(id: S) -> Result<Self, IdentityError> {
        Ok(Self {
            topics: TopicBuilder::new(id)?,
        })
    }

    /// Fresh random identity in upper-case UUID form
    pub fn generate() -> Result<Self, IdentityError> {
        Self::new(Uuid::new_v4().to_string().to_uppercase())
    }

    /// Read the identity stored at `path`, creating it on first use
    pub fn load_or_create(path: &Path) -> Result<Self, IdentityError> {
        match fs::read_to_string(path) {
            Ok(content) => Self::new(content.trim()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let identity = Self::generate()?;
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(path, format!("{}\n", identity.id()))?;
                info!(device_id = %identity.id(), path = %path.display(), "Created device identity");
                Ok(identity)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn id(&self) -> &str {
        self.topics.device_id()
    }

    /// Header source for messages sent by this device
    pub fn source(&self) -> String {
        self.topics.source()
    }

    pub fn topics(&self) -> &TopicBuilder {
        &self.topics
    }
}
