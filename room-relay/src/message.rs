use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A message relayed to every connection in a room. Opaque to the relay.
pub type Payload = Map<String, Value>;

/// Body of `POST /publish/{room_id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishRequest {
    pub payload: Payload,
}

/// Response to a publish; `clients` counts local members only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublishReceipt {
    pub room_id: String,
    pub clients: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomStatus {
    pub room_id: String,
    pub clients: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomList {
    pub rooms: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Health {
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
}

pub fn encode_payload(payload: &Payload) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(payload)
}

/// Decodes a bus message body. Anything other than a JSON object is rejected.
pub fn decode_payload(bytes: &[u8]) -> serde_json::Result<Payload> {
    serde_json::from_slice(bytes)
}
