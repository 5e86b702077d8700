//! End-to-end tests of the blocking client service against the in-memory
//! broker.
//!
//! These drive the public API exactly as an application would: connect,
//! register handlers, publish, and observe handler invocations on the
//! dispatcher thread.

use picontrol_mqtt::dispatcher::DispatchStatsSnapshot;
use picontrol_mqtt::error::{HandlerError, MqttError};
use picontrol_mqtt::manager::ClientSettings;
use picontrol_mqtt::protocol::{Device, Devices, DevicesRequest, MessageHeader, TopicBuilder};
use picontrol_mqtt::service::MqttClientService;
use picontrol_mqtt::state::ConnectionState;
use picontrol_mqtt::testing::MockBroker;
use picontrol_mqtt::transport::BrokerCredentials;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

fn client(broker: &MockBroker) -> MqttClientService {
    MqttClientService::with_transport(ClientSettings::new("ABC"), Arc::new(broker.clone()))
        .unwrap()
}

fn connected(broker: &MockBroker) -> MqttClientService {
    let client = client(broker);
    client.connect("broker.local", 1883, None).unwrap();
    client
}

fn topics() -> TopicBuilder {
    TopicBuilder::new("ABC").unwrap()
}

fn devices(ids: &[&str]) -> Devices {
    Devices {
        header: MessageHeader::new("coordinator"),
        devices: ids.iter().map(|id| Device::new(*id)).collect(),
    }
}

/// Poll dispatcher counters until `done` holds
fn wait_for_stats(client: &MqttClientService, done: impl Fn(&DispatchStatsSnapshot) -> bool) {
    let deadline = Instant::now() + WAIT;
    while !done(&client.dispatch_stats()) {
        assert!(Instant::now() < deadline, "dispatcher stalled");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_handler_receives_devices_reply() {
    let broker = MockBroker::new();
    let client = connected(&broker);
    let (tx, rx) = mpsc::channel();

    client
        .add_handler(&topics().devices_reply(), move |devices: Devices| {
            tx.send(devices).map_err(|e| HandlerError::new(e.to_string()))
        })
        .unwrap();

    client
        .publish(&topics().devices_reply(), &devices(&["d1"]))
        .unwrap();

    let received = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(received.devices.len(), 1);
    assert_eq!(received.devices[0].id, "d1");
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn test_rejected_credentials_leave_client_disconnected() {
    let broker = MockBroker::new().require_credentials("controller", "right");
    let client = client(&broker);

    let result = client.connect(
        "broker.local",
        1883,
        Some(BrokerCredentials::new("controller", "wrong")),
    );

    assert!(matches!(result, Err(MqttError::ConnectionFailed(_))));
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    assert_eq!(broker.open_sessions(), 0);
}

#[test]
fn test_handlers_run_in_registration_order() {
    let broker = MockBroker::new();
    let client = connected(&broker);
    let calls = Arc::new(Mutex::new(Vec::new()));

    for name in ["H1", "H2"] {
        let calls = calls.clone();
        client
            .add_handler(&topics().devices_reply(), move |_: Devices| {
                calls.lock().unwrap().push(name);
                Ok(())
            })
            .unwrap();
    }

    broker.inject_message(&topics().devices_reply(), &devices(&["d1"]));
    wait_for_stats(&client, |stats| stats.delivered == 2);

    assert_eq!(*calls.lock().unwrap(), vec!["H1", "H2"]);
}

#[test]
fn test_each_handler_gets_its_own_copy() {
    let broker = MockBroker::new();
    let client = connected(&broker);
    let (tx, rx) = mpsc::channel();

    for _ in 0..3 {
        let tx = tx.clone();
        client
            .add_handler(&topics().devices_reply(), move |mut devices: Devices| {
                devices.devices.push(Device::new("local"));
                let _ = tx.send(devices.devices.len());
                Ok(())
            })
            .unwrap();
    }

    broker.inject_message(&topics().devices_reply(), &devices(&["d1"]));

    let lengths: Vec<usize> = (0..3).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
    assert_eq!(lengths, vec![2, 2, 2]);
}

#[test]
fn test_second_handler_does_not_resubscribe() {
    let broker = MockBroker::new();
    let client = connected(&broker);
    let topic = topics().devices_reply();

    client.add_handler(&topic, |_: Devices| Ok(())).unwrap();
    client.add_handler(&topic, |_: Devices| Ok(())).unwrap();

    assert_eq!(broker.subscribe_calls(&topic), 1);
    assert_eq!(client.handler_count(&topic), 2);
}

#[test]
fn test_cancel_twice_is_noop() {
    let broker = MockBroker::new();
    let client = connected(&broker);
    let (tx, rx) = mpsc::channel();
    let topic = topics().devices_reply();

    let handle = client
        .add_handler(&topic, move |_: Devices| {
            let _ = tx.send(());
            Ok(())
        })
        .unwrap();

    assert!(client.remove_handler(&handle));
    assert!(!client.remove_handler(&handle));
    assert_eq!(client.handler_count(&topic), 0);

    broker.inject_message(&topic, &devices(&["d1"]));
    wait_for_stats(&client, |stats| stats.dropped == 1);
    assert!(rx.try_recv().is_err());
    assert_eq!(client.dispatch_stats().delivered, 0);
}

#[test]
fn test_decode_failure_does_not_block_other_handlers() {
    let broker = MockBroker::new();
    let client = connected(&broker);
    let topic = topics().devices_reply();
    let (tx, rx) = mpsc::channel();

    // Expects a different message type, so decoding fails for it
    client
        .add_handler(&topic, |_: DevicesRequest| Ok(()))
        .unwrap();
    client
        .add_handler(&topic, move |devices: Devices| {
            let _ = tx.send(devices.devices[0].id.clone());
            Ok(())
        })
        .unwrap();

    broker.inject_message(&topic, &devices(&["d1"]));

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "d1");
    wait_for_stats(&client, |stats| stats.delivered == 1);
    assert_eq!(client.dispatch_stats().decode_failures, 1);
}

#[test]
fn test_panicking_handler_is_isolated() {
    let broker = MockBroker::new();
    let client = connected(&broker);
    let topic = topics().devices_reply();
    let (tx, rx) = mpsc::channel();

    client
        .add_handler(&topic, |_: Devices| -> Result<(), HandlerError> {
            panic!("handler bug")
        })
        .unwrap();
    client
        .add_handler(&topic, move |_: Devices| {
            let _ = tx.send(());
            Ok(())
        })
        .unwrap();

    broker.inject_message(&topic, &devices(&["d1"]));
    broker.inject_message(&topic, &devices(&["d2"]));

    rx.recv_timeout(WAIT).unwrap();
    rx.recv_timeout(WAIT).unwrap();
    wait_for_stats(&client, |stats| stats.delivered == 2);
    assert_eq!(client.dispatch_stats().handler_failures, 2);
}

#[test]
fn test_publish_during_connect_waits_for_handshake() {
    let broker = MockBroker::new().stall_handshakes();
    let client = client(&broker);
    let mut watcher = client.watch_state();

    thread::scope(|scope| {
        let connecting = scope.spawn(|| client.connect("broker.local", 1883, None));
        assert_eq!(watcher.blocking_next(), Some(ConnectionState::Connecting));

        let publishing = scope.spawn(|| {
            client.publish(
                &TopicBuilder::devices_request(),
                &DevicesRequest {
                    header: MessageHeader::now(topics().source()),
                },
            )
        });

        thread::sleep(Duration::from_millis(50));
        assert!(broker.published().is_empty());
        broker.release_handshakes(1);

        connecting.join().unwrap().unwrap();
        publishing.join().unwrap().unwrap();
    });

    assert_eq!(broker.published_to("coordinator/devices").len(), 1);
}

#[test]
fn test_handler_on_wildcard_topic_is_rejected() {
    let broker = MockBroker::new();
    let client = connected(&broker);

    let result = client.add_handler("controller/+/devices", |_: Devices| Ok(()));

    assert!(matches!(result, Err(MqttError::InvalidTopic { .. })));
    assert_eq!(broker.subscribe_calls("controller/+/devices"), 0);
}

#[test]
fn test_failed_subscribe_rolls_back_handler() {
    let topic = topics().devices_reply();
    let broker = MockBroker::new().reject_subscription(&topic);
    let client = connected(&broker);

    let result = client.add_handler(&topic, |_: Devices| Ok(()));

    assert!(matches!(result, Err(MqttError::SubscriptionFailed { .. })));
    assert_eq!(client.handler_count(&topic), 0);
}

/// Register a second handler once the first registrant's subscribe is in
/// flight, and return both results
fn register_during_pending_subscribe(
    client: &MqttClientService,
    topic: &str,
) -> (Result<(), MqttError>, Result<(), MqttError>) {
    thread::scope(|scope| {
        let first = scope.spawn(|| client.add_handler(topic, |_: Devices| Ok(())).map(|_| ()));

        let deadline = Instant::now() + WAIT;
        while client.handler_count(topic) == 0 {
            assert!(Instant::now() < deadline, "first registration never started");
            thread::sleep(Duration::from_millis(1));
        }
        let second = client.add_handler(topic, |_: Devices| Ok(())).map(|_| ());

        (first.join().unwrap(), second)
    })
}

#[test]
fn test_handler_joining_rejected_subscribe_rolls_back_too() {
    let topic = topics().devices_reply();
    let broker = MockBroker::new()
        .reject_subscription(&topic)
        .delay_subscriptions(Duration::from_millis(300));
    let client = connected(&broker);

    let (first, second) = register_during_pending_subscribe(&client, &topic);

    assert!(matches!(first, Err(MqttError::SubscriptionFailed { .. })));
    assert!(matches!(
        second,
        Err(MqttError::SubscriptionFailed { ref topic, .. }) if topic == "controller/ABC/devices"
    ));
    assert_eq!(client.handler_count(&topic), 0);
}

#[test]
fn test_handler_joining_pending_subscribe_waits_for_ack() {
    let topic = topics().devices_reply();
    let broker = MockBroker::new().delay_subscriptions(Duration::from_millis(300));
    let client = connected(&broker);

    let (first, second) = register_during_pending_subscribe(&client, &topic);

    first.unwrap();
    second.unwrap();
    assert_eq!(broker.subscribe_calls(&topic), 1);
    assert_eq!(client.handler_count(&topic), 2);
}

#[test]
fn test_rejected_publish_names_topic_and_keeps_session() {
    let broker = MockBroker::new().reject_publish("coordinator/devices");
    let client = connected(&broker);

    let result = client.publish(
        &TopicBuilder::devices_request(),
        &DevicesRequest {
            header: MessageHeader::now(topics().source()),
        },
    );

    match result {
        Err(MqttError::PublishFailed { topic, reason }) => {
            assert_eq!(topic, "coordinator/devices");
            assert!(reason.contains("NotAuthorized"), "reason: {reason}");
        }
        other => panic!("expected PublishFailed, got {other:?}"),
    }
    assert_eq!(client.connection_state(), ConnectionState::Connected);
    assert!(broker.published().is_empty());
}

#[test]
fn test_add_handler_while_disconnected_fails() {
    let broker = MockBroker::new();
    let client = client(&broker);
    let topic = topics().devices_reply();

    let result = client.add_handler(&topic, |_: Devices| Ok(()));

    assert!(matches!(
        result,
        Err(MqttError::NotConnected {
            state: ConnectionState::Disconnected
        })
    ));
    assert_eq!(client.handler_count(&topic), 0);
}

#[test]
fn test_connection_loss_is_observable() {
    let broker = MockBroker::new();
    let client = connected(&broker);
    let mut watcher = client.watch_state();

    broker.drop_connection("network unreachable");

    assert_eq!(watcher.blocking_next(), Some(ConnectionState::Disconnected));
    assert!(matches!(
        client.publish(
            &TopicBuilder::devices_request(),
            &DevicesRequest {
                header: MessageHeader::new(topics().source()),
            },
        ),
        Err(MqttError::NotConnected { .. })
    ));
}

#[test]
fn test_handlers_survive_reconnect() {
    let broker = MockBroker::new();
    let client = connected(&broker);
    let topic = topics().devices_reply();
    let (tx, rx) = mpsc::channel();

    client
        .add_handler(&topic, move |devices: Devices| {
            let _ = tx.send(devices.devices.len());
            Ok(())
        })
        .unwrap();

    client.disconnect().unwrap();
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    client.connect("broker.local", 1883, None).unwrap();

    broker.inject_message(&topic, &devices(&["d1", "d2"]));
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 2);
}

#[test]
fn test_request_reply_round_trip_through_broker() {
    let broker = MockBroker::new();
    let client = connected(&broker);
    let (tx, rx) = mpsc::channel();

    client
        .add_handler(&TopicBuilder::devices_request(), move |request: DevicesRequest| {
            let _ = tx.send(request.header.source);
            Ok(())
        })
        .unwrap();
    client
        .publish(
            &TopicBuilder::devices_request(),
            &DevicesRequest {
                header: MessageHeader::now(topics().source()),
            },
        )
        .unwrap();

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "controller/ABC");
}
