use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;

/// Identifies one live document: a name within a domain
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    pub domain: String,
    pub name: String,
}

impl SubscriptionKey {
    pub fn new(domain: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.domain, self.name)
    }
}

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Start receiving updates for the listed documents of a domain
    SubscribeDocs {
        domain: String,
        docs: Vec<String>,
        #[serde(rename = "clientId")]
        client_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth: Option<String>,
    },
    /// Stop receiving updates for the listed documents of a domain
    UnsubscribeDocs { domain: String, docs: Vec<String> },
}

/// A pushed value of a subscribed document
///
/// `fields` holds every member of the wire object except `type`, `domain` and `name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocUpdate {
    pub domain: String,
    pub name: String,
    #[serde(flatten)]
    pub fields: Map<String, JsonValue>,
}

impl DocUpdate {
    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey::new(self.domain.clone(), self.name.clone())
    }

    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.fields.get(field)
    }
}

/// Messages sent from server to client, after decoding
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Identity assignment; gates all subscription traffic on a connection
    ClientId { client_id: String },
    /// New value of a subscribed document
    DocUpdate(DocUpdate),
    /// Any other well-formed message, passed through untouched
    Other(JsonValue),
}

/// Encode a message as a JSON text frame
pub fn encode_message<T: Serialize>(message: &T) -> crate::SyncResult<String> {
    Ok(serde_json::to_string(message)?)
}

/// Decode a JSON text frame from the server
///
/// Fails only when the frame is not JSON. Any JSON that is not a well-formed
/// `ClientId` or `DocUpdate` comes back as [`ServerMessage::Other`].
pub fn decode_message(data: &str) -> crate::SyncResult<ServerMessage> {
    let value: JsonValue = serde_json::from_str(data)?;

    let kind = value.get("type").and_then(JsonValue::as_str);
    let message = match kind {
        Some("ClientId") => match value.get("clientId").and_then(JsonValue::as_str) {
            Some(client_id) => ServerMessage::ClientId {
                client_id: client_id.to_string(),
            },
            None => ServerMessage::Other(value),
        },
        Some("DocUpdate") => {
            let mut fields = match &value {
                JsonValue::Object(object) => object.clone(),
                _ => return Ok(ServerMessage::Other(value)),
            };
            fields.remove("type");
            match serde_json::from_value::<DocUpdate>(JsonValue::Object(fields)) {
                Ok(update) => ServerMessage::DocUpdate(update),
                Err(_) => ServerMessage::Other(value),
            }
        }
        _ => ServerMessage::Other(value),
    };

    Ok(message)
}
