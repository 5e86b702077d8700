//! Pure routing of rumqttc events
//!
//! The session's event loop classifies every event here and only acts on
//! the resulting [`EventRoute`], which keeps the decisions testable without
//! a broker.

use crate::transport::InboundMessage;
use rumqttc::v5::mqttbytes::v5::{
    ConnectReturnCode, Packet, PubAckReason, PubCompReason, PubRecReason, SubscribeReasonCode,
};
use rumqttc::v5::Event;
use rumqttc::Outgoing;

/// Pure routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route an MQTT v5 event
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(connack) => EventRoute::ConnectionAcknowledged {
                    session_present: connack.session_present,
                    result: match connack.code {
                        ConnectReturnCode::Success => Ok(()),
                        code => Err(format!("{code:?}")),
                    },
                },
                Packet::Publish(publish) => EventRoute::MessageReceived(InboundMessage {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.clone(),
                    qos: publish.qos,
                    retain: publish.retain,
                }),
                Packet::SubAck(suback) => EventRoute::SubscriptionAcknowledged {
                    pkid: suback.pkid,
                    result: Self::validate_subscription_success(&suback.return_codes),
                },
                Packet::PubAck(puback) => EventRoute::PublishAcknowledged {
                    pkid: puback.pkid,
                    result: match puback.reason {
                        PubAckReason::Success | PubAckReason::NoMatchingSubscribers => Ok(()),
                        reason => Err(format!("{reason:?}")),
                    },
                },
                Packet::PubRec(pubrec) => match pubrec.reason {
                    PubRecReason::Success | PubRecReason::NoMatchingSubscribers => {
                        EventRoute::Infrastructure(format!("PubRec({})", pubrec.pkid))
                    }
                    reason => EventRoute::PublishAcknowledged {
                        pkid: pubrec.pkid,
                        result: Err(format!("{reason:?}")),
                    },
                },
                Packet::PubComp(pubcomp) => EventRoute::PublishAcknowledged {
                    pkid: pubcomp.pkid,
                    result: match pubcomp.reason {
                        PubCompReason::Success => Ok(()),
                        reason => Err(format!("{reason:?}")),
                    },
                },
                Packet::Disconnect(disconnect) => {
                    EventRoute::Disconnected(format!("{:?}", disconnect.reason_code))
                }
                other => EventRoute::Infrastructure(format!("{other:?}")),
            },
            Event::Outgoing(outgoing) => match outgoing {
                Outgoing::Subscribe(pkid) => EventRoute::SubscribeSent(*pkid),
                Outgoing::Publish(pkid) => EventRoute::PublishSent(*pkid),
                Outgoing::Disconnect => EventRoute::ClosedLocally,
                other => EventRoute::Infrastructure(format!("{other:?}")),
            },
        }
    }

    /// Every granted filter must report success
    pub fn validate_subscription_success(
        return_codes: &[SubscribeReasonCode],
    ) -> Result<(), String> {
        match return_codes
            .iter()
            .find(|code| !matches!(code, SubscribeReasonCode::Success(_)))
        {
            Some(code) => Err(format!("{code:?}")),
            None if return_codes.is_empty() => Err("empty SubAck".to_string()),
            None => Ok(()),
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// ConnAck received, with the broker's verdict
    ConnectionAcknowledged {
        session_present: bool,
        result: Result<(), String>,
    },
    /// Application message for the dispatcher
    MessageReceived(InboundMessage),
    /// Subscribe request written with this packet id
    SubscribeSent(u16),
    /// Publish written with this packet id (0 for QoS 0)
    PublishSent(u16),
    SubscriptionAcknowledged {
        pkid: u16,
        result: Result<(), String>,
    },
    /// Final acknowledgement for a QoS 1/2 publish, or a QoS 2 rejection
    PublishAcknowledged {
        pkid: u16,
        result: Result<(), String>,
    },
    /// Broker sent Disconnect
    Disconnected(String),
    /// Our own Disconnect went out
    ClosedLocally,
    /// PingResp, PubRel and the like
    Infrastructure(String),
}
