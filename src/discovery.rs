//! Directory of discovered PiControl services
//!
//! Browsing the network is done elsewhere; this type only holds what was
//! resolved and tells observers when that set changes. The MQTT layer picks
//! a resolved broker host/port from it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::debug;

const UPDATE_BUFFER: usize = 32;

/// Kind of advertised service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ServiceType {
    /// PiControl REST service (`_pictrl._tcp.`)
    #[serde(rename = "_pictrl._tcp.")]
    PiControl,
    /// MQTT broker (`_mqtt._tcp.`)
    #[serde(rename = "_mqtt._tcp.")]
    Mqtt,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::PiControl => "_pictrl._tcp.",
            ServiceType::Mqtt => "_mqtt._tcp.",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "_pictrl._tcp." | "_pictrl._tcp" => Some(ServiceType::PiControl),
            "_mqtt._tcp." | "_mqtt._tcp" => Some(ServiceType::Mqtt),
            _ => None,
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved network service; identified by hostname within its type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredService {
    pub name: String,
    pub hostname: String,
    pub port: u16,
    pub service_type: ServiceType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryUpdate {
    Resolved(DiscoveredService),
    Removed(DiscoveredService),
}

type DirectoryKey = (ServiceType, String);

#[derive(Debug)]
pub struct ServiceDirectory {
    services: Mutex<BTreeMap<DirectoryKey, DiscoveredService>>,
    updates: broadcast::Sender<DirectoryUpdate>,
}

impl ServiceDirectory {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);
        Self {
            services: Mutex::new(BTreeMap::new()),
            updates,
        }
    }

    /// Record a resolved service, replacing any entry for the same host
    pub fn resolved(&self, service: DiscoveredService) {
        let key = (service.service_type, service.hostname.clone());
        let mut services = self.services.lock().unwrap_or_else(PoisonError::into_inner);
        if services.get(&key) == Some(&service) {
            return;
        }
        debug!(
            name = %service.name,
            host = %service.hostname,
            port = service.port,
            service_type = %service.service_type,
            "Service resolved"
        );
        services.insert(key, service.clone());
        let _ = self.updates.send(DirectoryUpdate::Resolved(service));
    }

    /// Forget a service. Returns false if it was not known.
    pub fn removed(&self, service_type: ServiceType, hostname: &str) -> bool {
        let mut services = self.services.lock().unwrap_or_else(PoisonError::into_inner);
        match services.remove(&(service_type, hostname.to_string())) {
            Some(service) => {
                debug!(host = %hostname, service_type = %service_type, "Service removed");
                let _ = self.updates.send(DirectoryUpdate::Removed(service));
                true
            }
            None => false,
        }
    }

    /// Snapshot of all services of `service_type`, ordered by hostname
    pub fn services(&self, service_type: ServiceType) -> Vec<DiscoveredService> {
        self.services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|service| service.service_type == service_type)
            .cloned()
            .collect()
    }

    pub fn pictrl_services(&self) -> Vec<DiscoveredService> {
        self.services(ServiceType::PiControl)
    }

    pub fn mqtt_services(&self) -> Vec<DiscoveredService> {
        self.services(ServiceType::Mqtt)
    }

    /// Receive every later change to the directory
    pub fn watch(&self) -> broadcast::Receiver<DirectoryUpdate> {
        self.updates.subscribe()
    }
}

impl Default for ServiceDirectory {
    fn default() -> Self {
        Self::new()
    }
}
