//! Typed control-plane envelope.
//!
//! The wire format is a tagged `ControlMessage` with an opaque JSON payload;
//! inside the process every variant has a statically defined schema. This
//! module is the single place where the two meet: [`ControlEvent`] is the
//! typed sum, and the conversions below pin the payload schema per tag.

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::proto::v1 as pb;

/// Application heartbeat period for connectors and tunnelers.
pub const HEARTBEAT_PERIOD: std::time::Duration = std::time::Duration::from_secs(10);

/// Presence classification derived from `last_seen`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceStatus {
    #[serde(rename = "ONLINE")]
    Online,
    #[serde(rename = "OFFLINE")]
    Offline,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Online => "ONLINE",
            PresenceStatus::Offline => "OFFLINE",
        }
    }
}

impl std::fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One allowlisted tunneler identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowlistEntry {
    pub tunneler_id: String,
    pub spiffe_id: String,
}

/// Payload of a tunneler hello/heartbeat. `status` and `connector_id` are
/// absent on the tunneler→connector hop and filled in by the relaying
/// connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelerBeat {
    pub tunneler_id: String,
    pub spiffe_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connector_id: Option<String>,
}

/// The typed control-plane message set.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    ConnectorHello { connector_id: String, private_ip: String },
    Heartbeat { connector_id: String, private_ip: String, status: PresenceStatus },
    TunnelerHello(TunnelerBeat),
    TunnelerHeartbeat(TunnelerBeat),
    Ping,
    Pong,
    /// Full authoritative allowlist, pushed when a connector (re)connects.
    AllowlistSnapshot(Vec<AllowlistEntry>),
    /// Single-entry delta, pushed when a tunneler enrolls. Additive and
    /// unordered; receivers must not rely on delivery order.
    AllowlistAdd(AllowlistEntry),
}

impl ControlEvent {
    /// Encode into the wire envelope.
    pub fn into_message(self) -> Result<pb::ControlMessage> {
        let mut msg = pb::ControlMessage::default();
        match self {
            ControlEvent::ConnectorHello { connector_id, private_ip } => {
                msg.set_type(pb::ControlMessageType::ConnectorHello);
                msg.connector_id = connector_id;
                msg.private_ip = private_ip;
            }
            ControlEvent::Heartbeat { connector_id, private_ip, status } => {
                msg.set_type(pb::ControlMessageType::Heartbeat);
                msg.connector_id = connector_id;
                msg.private_ip = private_ip;
                msg.status = status.as_str().to_string();
            }
            ControlEvent::TunnelerHello(beat) => {
                msg.set_type(pb::ControlMessageType::TunnelerHello);
                msg.payload = serde_json::to_vec(&beat)?;
            }
            ControlEvent::TunnelerHeartbeat(beat) => {
                msg.set_type(pb::ControlMessageType::TunnelerHeartbeat);
                if let Some(connector_id) = &beat.connector_id {
                    msg.connector_id = connector_id.clone();
                }
                msg.payload = serde_json::to_vec(&beat)?;
            }
            ControlEvent::Ping => msg.set_type(pb::ControlMessageType::Ping),
            ControlEvent::Pong => msg.set_type(pb::ControlMessageType::Pong),
            ControlEvent::AllowlistSnapshot(entries) => {
                msg.set_type(pb::ControlMessageType::TunnelerAllowlist);
                msg.payload = serde_json::to_vec(&entries)?;
            }
            ControlEvent::AllowlistAdd(entry) => {
                msg.set_type(pb::ControlMessageType::TunnelerAllow);
                msg.payload = serde_json::to_vec(&entry)?;
            }
        }
        Ok(msg)
    }

    /// Decode the wire envelope, enforcing each variant's payload schema.
    pub fn from_message(msg: pb::ControlMessage) -> Result<Self> {
        match msg.r#type() {
            pb::ControlMessageType::ConnectorHello => Ok(ControlEvent::ConnectorHello {
                connector_id: msg.connector_id,
                private_ip: msg.private_ip,
            }),
            pb::ControlMessageType::Heartbeat => {
                let status = match msg.status.as_str() {
                    "OFFLINE" => PresenceStatus::Offline,
                    _ => PresenceStatus::Online,
                };
                Ok(ControlEvent::Heartbeat {
                    connector_id: msg.connector_id,
                    private_ip: msg.private_ip,
                    status,
                })
            }
            pb::ControlMessageType::TunnelerHello => {
                Ok(ControlEvent::TunnelerHello(decode_payload(&msg.payload, "tunneler_hello")?))
            }
            pb::ControlMessageType::TunnelerHeartbeat => Ok(ControlEvent::TunnelerHeartbeat(
                decode_payload(&msg.payload, "tunneler_heartbeat")?,
            )),
            pb::ControlMessageType::Ping => Ok(ControlEvent::Ping),
            pb::ControlMessageType::Pong => Ok(ControlEvent::Pong),
            pb::ControlMessageType::TunnelerAllowlist => Ok(ControlEvent::AllowlistSnapshot(
                decode_payload(&msg.payload, "tunneler_allowlist")?,
            )),
            pb::ControlMessageType::TunnelerAllow => {
                Ok(ControlEvent::AllowlistAdd(decode_payload(&msg.payload, "tunneler_allow")?))
            }
            pb::ControlMessageType::Unspecified => {
                Err(Error::validation("control message carries no type tag"))
            }
        }
    }
}

fn decode_payload<T: serde::de::DeserializeOwned>(payload: &[u8], tag: &str) -> Result<T> {
    serde_json::from_slice(payload).map_err(|e| {
        Error::validation(format!("malformed {} payload: {}", tag, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_uses_envelope_fields() {
        let event = ControlEvent::Heartbeat {
            connector_id: "c1".into(),
            private_ip: "10.0.0.5".into(),
            status: PresenceStatus::Online,
        };
        let msg = event.clone().into_message().unwrap();
        assert_eq!(msg.status, "ONLINE");
        assert!(msg.payload.is_empty());
        assert_eq!(ControlEvent::from_message(msg).unwrap(), event);
    }

    #[test]
    fn relayed_tunneler_heartbeat_keeps_connector_context() {
        let event = ControlEvent::TunnelerHeartbeat(TunnelerBeat {
            tunneler_id: "t1".into(),
            spiffe_id: "spiffe://mycorp.internal/tunneler/t1".into(),
            status: Some("ONLINE".into()),
            connector_id: Some("c1".into()),
        });
        let msg = event.clone().into_message().unwrap();
        assert_eq!(msg.connector_id, "c1");
        assert_eq!(ControlEvent::from_message(msg).unwrap(), event);
    }

    #[test]
    fn allowlist_payloads_are_json_arrays() {
        let entries = vec![
            AllowlistEntry {
                tunneler_id: "t1".into(),
                spiffe_id: "spiffe://mycorp.internal/tunneler/t1".into(),
            },
            AllowlistEntry {
                tunneler_id: "t2".into(),
                spiffe_id: "spiffe://mycorp.internal/tunneler/t2".into(),
            },
        ];
        let msg = ControlEvent::AllowlistSnapshot(entries.clone()).into_message().unwrap();
        let raw: serde_json::Value = serde_json::from_slice(&msg.payload).unwrap();
        assert!(raw.is_array());
        assert_eq!(ControlEvent::from_message(msg).unwrap(), ControlEvent::AllowlistSnapshot(entries));
    }

    #[test]
    fn malformed_payload_is_rejected() {
        let mut msg = pb::ControlMessage::default();
        msg.set_type(pb::ControlMessageType::TunnelerHeartbeat);
        msg.payload = b"not json".to_vec();
        assert!(ControlEvent::from_message(msg).is_err());
    }

    #[test]
    fn untyped_message_is_rejected() {
        let msg = pb::ControlMessage::default();
        assert!(ControlEvent::from_message(msg).is_err());
    }
}
