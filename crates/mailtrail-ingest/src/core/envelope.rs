use serde_json::{Map, Value};
use thiserror::Error;

use super::event::Mail;

/// Transport wrapper the event detail arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    /// Event-bus envelope; the event lives under `detail`.
    EventBus,
    /// Pub/sub notification; the event is JSON text under `Message`.
    Notification,
    /// The body is the event itself.
    Bare,
}

impl EnvelopeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EventBus => "event_bus",
            Self::Notification => "notification",
            Self::Bare => "bare",
        }
    }
}

/// Event detail before classification: the discriminator is still a string
/// and event-specific sub-objects are untyped.
#[derive(Debug, Clone)]
pub struct RawEventDetail {
    pub event_type: String,
    pub mail: Mail,
    pub payloads: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub detail: RawEventDetail,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("empty message body")]
    EmptyBody,
    #[error("body is not valid json: {0}")]
    Json(#[source] serde_json::Error),
    #[error("event detail is not a json object")]
    NotAnObject,
    #[error("notification `Message` is not valid json: {0}")]
    NotificationMessage(#[source] serde_json::Error),
    #[error("event detail has no `eventType`")]
    MissingEventType,
    #[error("event detail has no `mail` object")]
    MissingMail,
    #[error("invalid `mail` object: {0}")]
    InvalidMail(#[source] serde_json::Error),
    #[error("`mail.messageId` is missing or empty")]
    MissingMessageId,
}

/// Decodes a raw queue message body and extracts the inner event detail.
pub fn parse_envelope(body: &str) -> Result<Envelope, ParseError> {
    let body = body.trim();
    if body.is_empty() {
        return Err(ParseError::EmptyBody);
    }

    let value: Value = serde_json::from_str(body).map_err(ParseError::Json)?;
    let (kind, detail) = unwrap_envelope(value)?;
    let detail = parse_detail(detail)?;

    Ok(Envelope { kind, detail })
}

fn unwrap_envelope(value: Value) -> Result<(EnvelopeKind, Map<String, Value>), ParseError> {
    let Value::Object(mut object) = value else {
        return Err(ParseError::NotAnObject);
    };

    if is_event_detail(&object) {
        return Ok((EnvelopeKind::Bare, object));
    }

    match object.remove("detail") {
        Some(Value::Object(detail)) => {
            return Ok((EnvelopeKind::EventBus, detail));
        }
        Some(_) => return Err(ParseError::NotAnObject),
        None => {}
    }

    if let Some(Value::String(message)) = object.remove("Message") {
        let inner: Value = serde_json::from_str(&message)
            .map_err(ParseError::NotificationMessage)?;
        let Value::Object(inner) = inner else {
            return Err(ParseError::NotAnObject);
        };
        return Ok((EnvelopeKind::Notification, inner));
    }

    Ok((EnvelopeKind::Bare, object))
}

fn is_event_detail(object: &Map<String, Value>) -> bool {
    object.contains_key("mail")
        && (object.contains_key("eventType")
            || object.contains_key("notificationType"))
}

fn parse_detail(mut object: Map<String, Value>) -> Result<RawEventDetail, ParseError> {
    let event_type = ["eventType", "notificationType"]
        .into_iter()
        .filter_map(|key| object.remove(key))
        .find_map(|value| match value {
            Value::String(text) if !text.trim().is_empty() => {
                Some(text.trim().to_string())
            }
            _ => None,
        })
        .ok_or(ParseError::MissingEventType)?;

    let mail = match object.remove("mail") {
        Some(value @ Value::Object(_)) => {
            serde_json::from_value::<Mail>(value).map_err(ParseError::InvalidMail)?
        }
        _ => return Err(ParseError::MissingMail),
    };

    if mail.message_id.trim().is_empty() {
        return Err(ParseError::MissingMessageId);
    }

    Ok(RawEventDetail { event_type, mail, payloads: object })
}
