//! Wire format of an outbound webhook call.

use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};

use streamhook_events::{Event, Payload};

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const EVENT_TYPE_HEADER: &str = "X-Event-Type";
pub const EVENT_STREAM_HEADER: &str = "X-Event-Stream";
pub const EVENT_ID_HEADER: &str = "X-Event-ID";

/// `User-Agent` sent with every delivery.
pub const USER_AGENT: &str = concat!("streamhook-webhook/", env!("CARGO_PKG_VERSION"));

/// JSON body POSTed to an endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub event_id: String,
    pub event_type: String,
    pub stream_id: String,
    pub source: String,
    pub data: Payload,
    /// RFC 3339, UTC.
    pub timestamp: String,
    pub sequence_number: u64,
}

impl WebhookPayload {
    pub fn from_event(event: &Event) -> Self {
        Self {
            event_id: event.id.to_string(),
            event_type: event.event_type.clone(),
            stream_id: event.stream_id.to_string(),
            source: event.source.clone(),
            data: event.data.clone(),
            timestamp: event.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            sequence_number: event.sequence_number,
        }
    }

    /// The exact bytes that are sent and signed.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Headers for delivering `event`, excluding `Content-Type`.
///
/// The signature header is present only when `signature` is.
pub fn delivery_headers(event: &Event, signature: Option<String>) -> Vec<(&'static str, String)> {
    let mut headers = vec![
        (EVENT_TYPE_HEADER, event.event_type.clone()),
        (EVENT_STREAM_HEADER, event.stream_id.to_string()),
        (EVENT_ID_HEADER, event.id.to_string()),
    ];
    if let Some(signature) = signature {
        headers.push((SIGNATURE_HEADER, signature));
    }
    headers
}
