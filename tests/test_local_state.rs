//! Device identity, credential store and service directory working together
//! to produce the inputs of a broker connection.

use picontrol_mqtt::credentials::{
    CredentialMap, CredentialStore, FileCredentialStore, ServiceCredentials,
};
use picontrol_mqtt::discovery::{DiscoveredService, ServiceDirectory, ServiceType};
use picontrol_mqtt::identity::DeviceIdentity;
use picontrol_mqtt::manager::ClientSettings;
use picontrol_mqtt::service::MqttClientService;
use picontrol_mqtt::state::ConnectionState;
use picontrol_mqtt::testing::MockBroker;
use std::sync::Arc;
use tempfile::TempDir;

const SERVICE_URL: &str = "http://pi.local:8080";

#[test]
fn test_stored_login_and_discovered_broker_connect() {
    let dir = TempDir::new().unwrap();

    let identity = DeviceIdentity::load_or_create(&dir.path().join("device-id")).unwrap();
    let store = FileCredentialStore::new(dir.path().join("credentials.json"));
    let mut credentials = CredentialMap::new();
    credentials.insert(
        SERVICE_URL.to_string(),
        ServiceCredentials {
            password: "user-pw".to_string(),
            token: "session-token".to_string(),
            mqtt_username: "controller".to_string(),
            mqtt_password: "broker-pw".to_string(),
        },
    );
    store.save(&credentials).unwrap();

    let directory = ServiceDirectory::new();
    directory.resolved(DiscoveredService {
        name: "Living room".to_string(),
        hostname: "pi.local".to_string(),
        port: 1883,
        service_type: ServiceType::Mqtt,
    });
    let broker_service = directory.mqtt_services().remove(0);

    let broker = MockBroker::new().require_credentials("controller", "broker-pw");
    let client = MqttClientService::with_transport(
        ClientSettings::new(identity.id()),
        Arc::new(broker.clone()),
    )
    .unwrap();

    client
        .connect(
            &broker_service.hostname,
            broker_service.port,
            Some(store.broker_credentials(SERVICE_URL).unwrap()),
        )
        .unwrap();

    assert_eq!(client.connection_state(), ConnectionState::Connected);
    assert_eq!(broker.open_sessions(), 1);
}

#[test]
fn test_identity_is_stable_across_restarts() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state").join("device-id");

    let first = DeviceIdentity::load_or_create(&path).unwrap();
    let second = DeviceIdentity::load_or_create(&path).unwrap();

    assert_eq!(first.id(), second.id());
    assert_eq!(second.source(), format!("controller/{}", first.id()));
}

#[test]
fn test_updating_one_service_keeps_the_others() {
    let dir = TempDir::new().unwrap();
    let store = FileCredentialStore::new(dir.path().join("credentials.json"));

    let mut credentials = store.load().unwrap();
    credentials.insert("http://a".to_string(), ServiceCredentials::default());
    credentials.insert("http://b".to_string(), ServiceCredentials::default());
    store.save(&credentials).unwrap();

    let mut credentials = store.load().unwrap();
    credentials.get_mut("http://b").unwrap().token = "fresh".to_string();
    store.save(&credentials).unwrap();

    let reloaded = store.load().unwrap();
    assert_eq!(reloaded.len(), 2);
    assert_eq!(reloaded["http://b"].token, "fresh");
    assert!(reloaded["http://a"].token.is_empty());
}
