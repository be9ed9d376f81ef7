use crate::error::{ProtocolError, TransportError};
use crate::{Broker, Metrics, Project, Service, SharedState};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const MAX_ENVELOPE_BYTES: usize = 256 * 1024;
pub const WS_PATH: &str = "/ws";
pub const CLIENT_ID_HEADER: &str = "x-client-id";
pub const HUB_SENDER_ID: &str = "topo-hub";
/// Silence on a connection for this long counts as abnormal closure.
pub const READ_DEADLINE: Duration = Duration::from_secs(60);
pub const PONG_WAIT: Duration = Duration::from_secs(10);

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    State,
    Broadcast,
    ListServices,
    RegisterService,
    RemoveService,
    ListBrokers,
    RegisterBroker,
    RemoveBroker,
    ListProjects,
    RegisterProjects,
    RemoveProjects,
    Metrics,
    Connected,
}

impl MessageType {
    pub const ALL: [MessageType; 13] = [
        MessageType::State,
        MessageType::Broadcast,
        MessageType::ListServices,
        MessageType::RegisterService,
        MessageType::RemoveService,
        MessageType::ListBrokers,
        MessageType::RegisterBroker,
        MessageType::RemoveBroker,
        MessageType::ListProjects,
        MessageType::RegisterProjects,
        MessageType::RemoveProjects,
        MessageType::Metrics,
        MessageType::Connected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::State => "state",
            MessageType::Broadcast => "broadcast",
            MessageType::ListServices => "list-services",
            MessageType::RegisterService => "register-service",
            MessageType::RemoveService => "remove-service",
            MessageType::ListBrokers => "list-brokers",
            MessageType::RegisterBroker => "register-broker",
            MessageType::RemoveBroker => "remove-broker",
            MessageType::ListProjects => "list-projects",
            MessageType::RegisterProjects => "register-projects",
            MessageType::RemoveProjects => "remove-projects",
            MessageType::Metrics => "metrics",
            MessageType::Connected => "connected",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = ProtocolError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        MessageType::ALL
            .into_iter()
            .find(|kind| kind.as_str() == input)
            .ok_or_else(|| ProtocolError::UnknownType(input.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum Message {
    State(SharedState),
    Broadcast(Value),
    ListServices(Option<Vec<Service>>),
    RegisterService(Service),
    RemoveService(String),
    ListBrokers(Option<Vec<Broker>>),
    RegisterBroker(Broker),
    RemoveBroker(String),
    ListProjects(Option<Vec<Project>>),
    RegisterProjects(Project),
    RemoveProjects(String),
    Metrics(Metrics),
    Connected(Value),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::State(_) => MessageType::State,
            Message::Broadcast(_) => MessageType::Broadcast,
            Message::ListServices(_) => MessageType::ListServices,
            Message::RegisterService(_) => MessageType::RegisterService,
            Message::RemoveService(_) => MessageType::RemoveService,
            Message::ListBrokers(_) => MessageType::ListBrokers,
            Message::RegisterBroker(_) => MessageType::RegisterBroker,
            Message::RemoveBroker(_) => MessageType::RemoveBroker,
            Message::ListProjects(_) => MessageType::ListProjects,
            Message::RegisterProjects(_) => MessageType::RegisterProjects,
            Message::RemoveProjects(_) => MessageType::RemoveProjects,
            Message::Metrics(_) => MessageType::Metrics,
            Message::Connected(_) => MessageType::Connected,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(flatten)]
    pub message: Message,
    #[serde(default)]
    pub sender: String,
}

impl Envelope {
    pub fn new(sender: impl Into<String>, message: Message) -> Self {
        Self {
            message,
            sender: sender.into(),
        }
    }

    pub fn from_hub(message: Message) -> Self {
        Self::new(HUB_SENDER_ID, message)
    }

    pub fn message_type(&self) -> MessageType {
        self.message.message_type()
    }
}

pub fn encode(envelope: &Envelope) -> Result<String, ProtocolError> {
    let encoded =
        serde_json::to_string(envelope).map_err(|err| ProtocolError::Encode(err.to_string()))?;
    if encoded.len() > MAX_ENVELOPE_BYTES {
        return Err(ProtocolError::Oversized {
            size: encoded.len(),
            max: MAX_ENVELOPE_BYTES,
        });
    }
    Ok(encoded)
}

pub fn decode(bytes: &[u8]) -> Result<Envelope, ProtocolError> {
    if bytes.len() > MAX_ENVELOPE_BYTES {
        return Err(ProtocolError::Oversized {
            size: bytes.len(),
            max: MAX_ENVELOPE_BYTES,
        });
    }
    let mut value: Value =
        serde_json::from_slice(bytes).map_err(|err| ProtocolError::Malformed(err.to_string()))?;
    let Some(object) = value.as_object_mut() else {
        return Err(ProtocolError::Malformed("expected a JSON object".to_string()));
    };
    match object.get("type") {
        Some(Value::String(kind)) => {
            kind.parse::<MessageType>()?;
        }
        Some(_) => {
            return Err(ProtocolError::Malformed("type must be a string".to_string()));
        }
        None => return Err(ProtocolError::MissingType),
    }
    object.entry("payload").or_insert(Value::Null);
    serde_json::from_value(value).map_err(|err| ProtocolError::Malformed(err.to_string()))
}

pub fn classify_close(code: Option<u16>, reason: &str) -> TransportError {
    match code {
        Some(CLOSE_NORMAL) | Some(CLOSE_GOING_AWAY) => TransportError::NormalClosure,
        Some(other) => TransportError::AbnormalClosure(format!("close code {other}: {reason}")),
        None => TransportError::AbnormalClosure("closed without close frame".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Actor;

    #[test]
    fn wire_names_match_message_type() {
        let envelope = Envelope::new("client-a", Message::RegisterProjects(Project::new("atlas")));
        let encoded = encode(&envelope).expect("encode");
        let raw: Value = serde_json::from_str(&encoded).expect("json");
        assert_eq!(raw["type"], "register-projects");
        assert_eq!(raw["sender"], "client-a");
        assert_eq!(raw["payload"]["name"], "atlas");

        for kind in MessageType::ALL {
            assert_eq!(kind.as_str().parse::<MessageType>(), Ok(kind));
        }
    }

    #[test]
    fn state_envelope_survives_codec() {
        let state = SharedState {
            servers: vec![crate::Server::new("edge", "http://edge:8080")],
            brokers: vec![Broker::new("queue", "amqp://queue")],
            projects: vec![Project::new("atlas")],
            actor: Actor::generate(),
        };
        let envelope = Envelope::new("client-a", Message::State(state));
        let encoded = encode(&envelope).expect("encode");
        let decoded = decode(encoded.as_bytes()).expect("decode");
        assert_eq!(decoded, envelope);
        assert_eq!(decoded.message_type(), MessageType::State);
    }

    #[test]
    fn list_request_without_payload_decodes_as_none() {
        let decoded = decode(br#"{"type":"list-services","sender":"client-a"}"#).expect("decode");
        assert_eq!(decoded.message, Message::ListServices(None));

        let explicit_null =
            decode(br#"{"type":"list-brokers","payload":null}"#).expect("decode null");
        assert_eq!(explicit_null.message, Message::ListBrokers(None));
        assert_eq!(explicit_null.sender, "");
    }

    #[test]
    fn service_defaults_optional_fields() {
        let decoded = decode(
            br#"{"type":"register-service","payload":{"id":"s1","name":"api","endpoint":"http://x"}}"#,
        )
        .expect("decode");
        let Message::RegisterService(service) = decoded.message else {
            panic!("expected register-service")
        };
        assert_eq!(service.id, "s1");
        assert!(service.description.is_empty());
        assert!(service.metadata.is_empty());
    }

    #[test]
    fn decode_distinguishes_failure_kinds() {
        assert_eq!(
            decode(br#"{"type":"teleport","payload":1}"#),
            Err(ProtocolError::UnknownType("teleport".to_string()))
        );
        assert_eq!(decode(br#"{"payload":1}"#), Err(ProtocolError::MissingType));
        assert!(matches!(
            decode(br#"{"type":"remove-service","payload":{"id":1}}"#),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            decode(b"not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(decode(b"[1,2]"), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let blob = "x".repeat(MAX_ENVELOPE_BYTES);
        let envelope = Envelope::new("client-a", Message::Broadcast(Value::String(blob)));
        assert!(matches!(
            encode(&envelope),
            Err(ProtocolError::Oversized { .. })
        ));

        let raw = vec![b' '; MAX_ENVELOPE_BYTES + 1];
        assert!(matches!(decode(&raw), Err(ProtocolError::Oversized { .. })));
    }

    #[test]
    fn close_codes_split_normal_from_abnormal() {
        assert_eq!(
            classify_close(Some(CLOSE_NORMAL), ""),
            TransportError::NormalClosure
        );
        assert_eq!(
            classify_close(Some(CLOSE_GOING_AWAY), "bye"),
            TransportError::NormalClosure
        );
        assert!(classify_close(Some(1011), "internal").is_abnormal());
        assert!(classify_close(None, "").is_abnormal());
    }
}
