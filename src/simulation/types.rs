//! Type definitions for the datalink simulation.
//!
//! Contains the data model shared by every component:
//! - Priority levels and per-priority probability tables
//! - Message types, identifiers and the immutable message envelope
//! - Acknowledgement payloads
//! - Inbound listener queues filled by channel broadcasts

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_time::Instant;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Depth of each agent's inbound queue. A broadcast that finds the queue full
/// is dropped for that listener only.
pub const INBOUND_QUEUE_SIZE: usize = 64;
/// Bounded queue a channel pushes delivered messages into.
pub type InboundQueue = embassy_sync::channel::Channel<CriticalSectionRawMutex, Message, INBOUND_QUEUE_SIZE>;

/// Access probability used when a channel has no entry for a priority.
pub const DEFAULT_P_VALUE: f64 = 0.1;

/// Status string carried by acknowledgements of received messages.
pub const ACK_STATUS_RECEIVED: &str = "RECEIVED";

/// Ordered message priority. Declaration order gives `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub const ALL: [Priority; 4] = [Priority::Critical, Priority::High, Priority::Medium, Priority::Low];

    /// Numeric weight used for queue ordering.
    pub fn weight(self) -> u8 {
        match self {
            Priority::Critical => 4,
            Priority::High => 3,
            Priority::Medium => 2,
            Priority::Low => 1,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Critical => write!(f, "CRITICAL"),
            Priority::High => write!(f, "HIGH"),
            Priority::Medium => write!(f, "MEDIUM"),
            Priority::Low => write!(f, "LOW"),
        }
    }
}

/// Per-priority probability table (access p-values or switchover probabilities).
/// Missing entries fall back to a caller-defined default.
pub type PriorityMap = BTreeMap<Priority, f64>;

/// Build a complete table from the four per-priority values.
pub fn priority_map(critical: f64, high: f64, medium: f64, low: f64) -> PriorityMap {
    PriorityMap::from([
        (Priority::Critical, critical),
        (Priority::High, high),
        (Priority::Medium, medium),
        (Priority::Low, low),
    ])
}

/// ACARS message categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    AircraftFault,
    AtcMessage,
    OooiReport,
    PositionReport,
    FuelReport,
    EngineReport,
    WeatherReport,
    Pdc,
    DAtis,
    FreeText,
    LinkTest,
    Acknowledgement,
}

impl MessageType {
    /// Priority a message of this type gets unless the producer overrides it.
    pub fn default_priority(self) -> Priority {
        match self {
            MessageType::AircraftFault | MessageType::AtcMessage | MessageType::Acknowledgement => Priority::Critical,
            MessageType::OooiReport | MessageType::PositionReport | MessageType::FuelReport => Priority::High,
            MessageType::EngineReport | MessageType::WeatherReport | MessageType::Pdc | MessageType::DAtis => Priority::Medium,
            MessageType::FreeText | MessageType::LinkTest => Priority::Low,
        }
    }
}

/// Run-unique message identifier; the only key used for acknowledgement matching.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Header fields common to every message.
#[derive(Debug, Clone)]
pub struct MessageHeader {
    /// Entity that puts the message on the air (aircraft ICAO address or station id).
    pub sender_id: String,
    /// Flight or station the message belongs to.
    pub origin_id: String,
    pub message_id: MessageId,
    /// Simulation time the message was created.
    pub timestamp: Instant,
    pub message_type: MessageType,
}

/// Payload of an acknowledgement message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckData {
    #[serde(rename = "originalMessageID")]
    pub original_message_id: MessageId,
    pub status: String,
}

/// Error raised while building a message.
#[derive(Debug)]
pub enum MessageError {
    /// The payload could not be encoded.
    PayloadEncoding(String),
}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageError::PayloadEncoding(msg) => write!(f, "Failed to encode message payload: {}", msg),
        }
    }
}

impl std::error::Error for MessageError {}

#[derive(Debug)]
struct MessageInner {
    header: MessageHeader,
    priority: Priority,
    payload: Box<[u8]>,
}

/// Immutable message envelope. Cloning is cheap; every listener of a broadcast
/// receives a handle to the same envelope.
#[derive(Debug, Clone)]
pub struct Message {
    inner: Arc<MessageInner>,
}

impl Message {
    /// Build a message whose payload is `data` encoded as JSON.
    ///
    /// Encoding failures are returned before the message exists, so a partially
    /// built message can never reach a queue.
    pub fn new<T: Serialize + ?Sized>(header: MessageHeader, priority: Priority, data: &T) -> Result<Self, MessageError> {
        let payload = serde_json::to_vec(data).map_err(|e| MessageError::PayloadEncoding(e.to_string()))?;
        Ok(Self::from_raw(header, priority, payload))
    }

    /// Build a message with the default priority of its type.
    pub fn with_default_priority<T: Serialize + ?Sized>(header: MessageHeader, data: &T) -> Result<Self, MessageError> {
        let priority = header.message_type.default_priority();
        Self::new(header, priority, data)
    }

    /// Wrap an already-encoded payload. The core never looks inside it.
    pub fn from_raw(header: MessageHeader, priority: Priority, payload: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(MessageInner {
                header,
                priority,
                payload: payload.into_boxed_slice(),
            }),
        }
    }

    /// Build the acknowledgement for `original`. The acknowledgement inherits the
    /// original's priority so urgent traffic gets urgent acknowledgements.
    pub fn acknowledgement(original: &Message, message_id: MessageId, sender_id: &str, origin_id: &str, timestamp: Instant) -> Result<Self, MessageError> {
        let header = MessageHeader {
            sender_id: sender_id.to_string(),
            origin_id: origin_id.to_string(),
            message_id,
            timestamp,
            message_type: MessageType::Acknowledgement,
        };
        let data = AckData {
            original_message_id: original.id().clone(),
            status: ACK_STATUS_RECEIVED.to_string(),
        };
        Self::new(header, original.priority(), &data)
    }

    pub fn header(&self) -> &MessageHeader {
        &self.inner.header
    }

    pub fn id(&self) -> &MessageId {
        &self.inner.header.message_id
    }

    pub fn sender_id(&self) -> &str {
        &self.inner.header.sender_id
    }

    pub fn origin_id(&self) -> &str {
        &self.inner.header.origin_id
    }

    pub fn message_type(&self) -> MessageType {
        self.inner.header.message_type
    }

    pub fn timestamp(&self) -> Instant {
        self.inner.header.timestamp
    }

    pub fn priority(&self) -> Priority {
        self.inner.priority
    }

    pub fn payload(&self) -> &[u8] {
        &self.inner.payload
    }

    /// Acknowledgements are retired when they go on the air; everything else
    /// waits for one.
    pub fn requires_ack(&self) -> bool {
        self.message_type() != MessageType::Acknowledgement
    }

    /// Decode the acknowledgement payload. Returns `None` for non-acknowledgement
    /// messages and for malformed payloads.
    pub fn ack_data(&self) -> Option<AckData> {
        if self.message_type() != MessageType::Acknowledgement {
            return None;
        }
        serde_json::from_slice(self.payload()).ok()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub(crate) fn header(id: &str, sender: &str, message_type: MessageType, timestamp: Instant) -> MessageHeader {
        MessageHeader {
            sender_id: sender.to_string(),
            origin_id: format!("{sender}-FLT"),
            message_id: MessageId::new(id),
            timestamp,
            message_type,
        }
    }

    pub(crate) fn message(id: &str, sender: &str, priority: Priority) -> Message {
        Message::from_raw(header(id, sender, MessageType::PositionReport, Instant::from_ticks(0)), priority, b"{}".to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn priority_order_and_weights_agree() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
        let weights: Vec<u8> = Priority::ALL.iter().map(|p| p.weight()).collect();
        assert_eq!(weights, vec![4, 3, 2, 1]);
    }

    #[test]
    fn default_priorities_follow_message_catalogue() {
        assert_eq!(MessageType::AircraftFault.default_priority(), Priority::Critical);
        assert_eq!(MessageType::OooiReport.default_priority(), Priority::High);
        assert_eq!(MessageType::WeatherReport.default_priority(), Priority::Medium);
        assert_eq!(MessageType::LinkTest.default_priority(), Priority::Low);
    }

    #[test]
    fn acknowledgement_inherits_priority_and_references_original() {
        let original = message("CES-1001-1", "A70000", Priority::Medium);
        let ack = Message::acknowledgement(&original, MessageId::new("ACK-CES-1001-1"), "GND", "GND", Instant::from_ticks(5)).unwrap();

        assert_eq!(ack.priority(), Priority::Medium);
        assert!(!ack.requires_ack());
        let data = ack.ack_data().unwrap();
        assert_eq!(data.original_message_id, MessageId::new("CES-1001-1"));
        assert_eq!(data.status, ACK_STATUS_RECEIVED);
    }

    #[test]
    fn malformed_ack_payload_decodes_to_none() {
        let h = header("ACK-X", "GND", MessageType::Acknowledgement, Instant::from_ticks(0));
        let broken = Message::from_raw(h, Priority::High, b"not json".to_vec());
        assert!(broken.ack_data().is_none());

        let data_message = message("X", "A1", Priority::High);
        assert!(data_message.ack_data().is_none());
    }

    #[test]
    fn payload_encoding_failure_is_reported_before_construction() {
        // JSON object keys must be strings; a map keyed by tuples cannot be encoded.
        let mut bad: HashMap<(u8, u8), u8> = HashMap::new();
        bad.insert((1, 2), 3);
        let h = header("BAD-1", "A1", MessageType::FreeText, Instant::from_ticks(0));
        let result = Message::with_default_priority(h, &bad);
        assert!(matches!(result, Err(MessageError::PayloadEncoding(_))));
    }

    #[test]
    fn message_type_serializes_with_wire_names() {
        assert_eq!(serde_json::to_string(&MessageType::DAtis).unwrap(), "\"D_ATIS\"");
        assert_eq!(serde_json::to_string(&MessageType::OooiReport).unwrap(), "\"OOOI_REPORT\"");
        assert_eq!(serde_json::to_string(&Priority::Critical).unwrap(), "\"CRITICAL\"");
    }
}
