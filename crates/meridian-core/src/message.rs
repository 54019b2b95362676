use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CodecError;

/// Identifier of a space server in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerId(pub u32);

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a simulated object connected to a space server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub Uuid);

impl ObjectId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical service a server-to-server message belongs to. The forwarder
/// shares each outbound link fairly across these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceTag(pub u16);

impl ServiceTag {
    pub const LOCATION: ServiceTag = ServiceTag(1);
    pub const PROXIMITY: ServiceTag = ServiceTag(2);
    pub const OBJECT_ROUTING: ServiceTag = ServiceTag(3);
}

impl fmt::Display for ServiceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ServiceTag::LOCATION => f.write_str("location"),
            ServiceTag::PROXIMITY => f.write_str("proximity"),
            ServiceTag::OBJECT_ROUTING => f.write_str("object-routing"),
            ServiceTag(other) => write!(f, "service-{other}"),
        }
    }
}

/// Anything a fair queue can schedule. The size drives rate accounting and
/// virtual finish times, so it must stay constant for the message's lifetime.
pub trait QueueMessage {
    fn size(&self) -> usize;
}

/// Per-message overhead charged on top of the payload: id, endpoints,
/// service tag and length prefix.
pub const SERVER_MESSAGE_HEADER_BYTES: usize = 26;

/// Overhead of an object message: id, two object ids and length prefix.
pub const OBJECT_MESSAGE_HEADER_BYTES: usize = 48;

/// A message travelling between two space servers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMessage {
    pub id: u64,
    pub source: ServerId,
    pub destination: ServerId,
    pub service: ServiceTag,
    pub payload: Vec<u8>,
}

impl ServerMessage {
    pub fn new(
        id: u64,
        source: ServerId,
        destination: ServerId,
        service: ServiceTag,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            id,
            source,
            destination,
            service,
            payload,
        }
    }

    pub fn destination(&self) -> ServerId {
        self.destination
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(self).map_err(CodecError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        bincode::deserialize(bytes).map_err(CodecError::Decode)
    }

    /// Unwrap an object message carried on the object routing service.
    pub fn object_message(&self) -> Result<ObjectMessage, CodecError> {
        bincode::deserialize(&self.payload).map_err(CodecError::Decode)
    }
}

impl QueueMessage for ServerMessage {
    fn size(&self) -> usize {
        SERVER_MESSAGE_HEADER_BYTES + self.payload.len()
    }
}

/// A message sent by an object, destined for another object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMessage {
    pub id: u64,
    pub source: ObjectId,
    pub destination: ObjectId,
    pub payload: Vec<u8>,
}

impl ObjectMessage {
    pub fn new(id: u64, source: ObjectId, destination: ObjectId, payload: Vec<u8>) -> Self {
        Self {
            id,
            source,
            destination,
            payload,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(self).map_err(CodecError::Encode)
    }
}

impl QueueMessage for ObjectMessage {
    fn size(&self) -> usize {
        OBJECT_MESSAGE_HEADER_BYTES + self.payload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_message_wire_format_round_trips() {
        let msg = ServerMessage::new(7, ServerId(1), ServerId(2), ServiceTag::PROXIMITY, vec![9; 40]);
        let bytes = msg.encode().unwrap();
        assert_eq!(ServerMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn size_includes_header_overhead() {
        let msg = ServerMessage::new(1, ServerId(1), ServerId(2), ServiceTag::LOCATION, vec![0; 100]);
        assert_eq!(msg.size(), SERVER_MESSAGE_HEADER_BYTES + 100);

        let obj = ObjectMessage::new(1, ObjectId::random(), ObjectId::random(), vec![]);
        assert_eq!(obj.size(), OBJECT_MESSAGE_HEADER_BYTES);
    }

    #[test]
    fn decode_rejects_truncated_bytes() {
        let msg = ServerMessage::new(1, ServerId(1), ServerId(2), ServiceTag::LOCATION, vec![1, 2, 3]);
        let bytes = msg.encode().unwrap();
        assert!(ServerMessage::decode(&bytes[..bytes.len() - 2]).is_err());
    }

    #[test]
    fn service_tags_display_by_name() {
        assert_eq!(ServiceTag::LOCATION.to_string(), "location");
        assert_eq!(ServiceTag::OBJECT_ROUTING.to_string(), "object-routing");
        assert_eq!(ServiceTag(42).to_string(), "service-42");
    }
}
