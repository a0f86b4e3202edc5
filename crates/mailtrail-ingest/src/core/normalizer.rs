use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;

use super::envelope::RawEventDetail;
use super::event::{
    BouncedRecipient, DelayedRecipient, EpochMillis, EventDetail, EventKind,
    EventType, Mail, TopicPreferences, UnknownEventType,
};

/// The canonical record, before the writer stamps creation and expiry.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub message_id: String,
    pub event_type: EventType,
    pub from: String,
    pub to: BTreeSet<String>,
    pub subject: String,
    pub sent_at: EpochMillis,
    pub additional_data: AdditionalData,
}

/// Event-specific fields kept beside the mail metadata. Serialized as the
/// bare inner object; the record's `event_type` says which shape it is.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AdditionalData {
    Send(SendData),
    Delivery(DeliveryData),
    Bounce(BounceData),
    Complaint(ComplaintData),
    Open(OpenData),
    Click(ClickData),
    Reject(RejectData),
    RenderingFailure(RenderingFailureData),
    DeliveryDelay(DeliveryDelayData),
    Subscription(SubscriptionData),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SendData {}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryData {
    pub processing_time_millis: Option<u64>,
    pub recipients: Vec<String>,
    pub smtp_response: Option<String>,
    #[serde(rename = "reportingMTA")]
    pub reporting_mta: Option<String>,
    pub remote_mta_ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BounceData {
    pub bounce_type: String,
    pub bounce_sub_type: String,
    pub bounced_recipients: Vec<BouncedRecipient>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplaintData {
    pub feedback_id: Option<String>,
    pub complaint_feedback_type: Option<String>,
    pub complained_recipients: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenData {
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClickData {
    pub link: String,
    pub link_tags: BTreeMap<String, Vec<String>>,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectData {
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderingFailureData {
    pub error_message: Option<String>,
    pub template_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryDelayData {
    pub delay_type: String,
    pub expiration_time: Option<String>,
    pub delayed_recipients: Vec<DelayedRecipient>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionData {
    pub contact_list: Option<String>,
    pub old_topic_preferences: Option<TopicPreferences>,
    pub new_topic_preferences: Option<TopicPreferences>,
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error(transparent)]
    UnknownEventType(#[from] UnknownEventType),
    #[error("{event_type} event has no `{key}` object")]
    MissingPayload { event_type: EventType, key: &'static str },
    #[error("invalid `{key}` object for {event_type} event: {source}")]
    InvalidPayload {
        event_type: EventType,
        key: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0} event has no `mail.timestamp`")]
    MissingMailTimestamp(EventType),
}

/// Classifies and normalizes in one step.
pub fn normalize_raw(raw: RawEventDetail) -> Result<EventRecord, NormalizeError> {
    classify(raw).and_then(normalize)
}

/// Resolves the string discriminator into the closed [`EventKind`] set and
/// decodes the matching sub-object.
pub fn classify(raw: RawEventDetail) -> Result<EventDetail, NormalizeError> {
    let RawEventDetail { event_type, mail, mut payloads } = raw;
    let event_type: EventType = event_type.parse()?;

    let kind = match event_type {
        EventType::Send => EventKind::Send,
        EventType::Delivery => {
            EventKind::Delivery(required_payload(event_type, &mut payloads)?)
        }
        EventType::Bounce => {
            EventKind::Bounce(required_payload(event_type, &mut payloads)?)
        }
        EventType::Complaint => {
            EventKind::Complaint(required_payload(event_type, &mut payloads)?)
        }
        EventType::Open => {
            EventKind::Open(required_payload(event_type, &mut payloads)?)
        }
        EventType::Click => {
            EventKind::Click(required_payload(event_type, &mut payloads)?)
        }
        EventType::Reject => EventKind::Reject(
            optional_payload(event_type, &mut payloads)?.unwrap_or_default(),
        ),
        EventType::RenderingFailure => EventKind::RenderingFailure(
            optional_payload(event_type, &mut payloads)?.unwrap_or_default(),
        ),
        EventType::DeliveryDelay => {
            EventKind::DeliveryDelay(required_payload(event_type, &mut payloads)?)
        }
        EventType::Subscription => {
            EventKind::Subscription(required_payload(event_type, &mut payloads)?)
        }
    };

    Ok(EventDetail { mail, kind })
}

/// Maps a classified event into the canonical record.
///
/// `sent_at` is the event's own timestamp; only kinds without one (Send,
/// Reject, RenderingFailure) fall back to the mail timestamp.
pub fn normalize(detail: EventDetail) -> Result<EventRecord, NormalizeError> {
    let EventDetail { mail, kind } = detail;
    let event_type = kind.event_type();

    let (sent_at, additional_data) = match kind {
        EventKind::Send => {
            (mail_timestamp(&mail, event_type)?, AdditionalData::Send(SendData {}))
        }
        EventKind::Delivery(delivery) => (
            delivery.timestamp,
            AdditionalData::Delivery(DeliveryData {
                processing_time_millis: delivery.processing_time_millis,
                recipients: delivery.recipients,
                smtp_response: delivery.smtp_response,
                reporting_mta: delivery.reporting_mta,
                remote_mta_ip: delivery.remote_mta_ip,
            }),
        ),
        EventKind::Bounce(bounce) => (
            bounce.timestamp,
            AdditionalData::Bounce(BounceData {
                bounce_type: bounce.bounce_type,
                bounce_sub_type: bounce.bounce_sub_type,
                bounced_recipients: bounce.bounced_recipients,
            }),
        ),
        EventKind::Complaint(complaint) => (
            complaint.timestamp,
            AdditionalData::Complaint(ComplaintData {
                feedback_id: complaint.feedback_id,
                complaint_feedback_type: complaint.complaint_feedback_type,
                complained_recipients: complaint
                    .complained_recipients
                    .into_iter()
                    .map(|recipient| recipient.email_address)
                    .collect(),
            }),
        ),
        EventKind::Open(open) => (
            open.timestamp,
            AdditionalData::Open(OpenData {
                user_agent: open.user_agent,
                ip_address: open.ip_address,
            }),
        ),
        EventKind::Click(click) => (
            click.timestamp,
            AdditionalData::Click(ClickData {
                link: click.link,
                link_tags: click.link_tags,
                user_agent: click.user_agent,
                ip_address: click.ip_address,
            }),
        ),
        EventKind::Reject(reject) => (
            mail_timestamp(&mail, event_type)?,
            AdditionalData::Reject(RejectData { reason: reject.reason }),
        ),
        EventKind::RenderingFailure(failure) => (
            mail_timestamp(&mail, event_type)?,
            AdditionalData::RenderingFailure(RenderingFailureData {
                error_message: failure.error_message,
                template_name: failure.template_name,
            }),
        ),
        EventKind::DeliveryDelay(delay) => (
            delay.timestamp,
            AdditionalData::DeliveryDelay(DeliveryDelayData {
                delay_type: delay.delay_type,
                expiration_time: delay.expiration_time,
                delayed_recipients: delay.delayed_recipients,
            }),
        ),
        EventKind::Subscription(subscription) => (
            subscription.timestamp,
            AdditionalData::Subscription(SubscriptionData {
                contact_list: subscription.contact_list,
                old_topic_preferences: subscription.old_topic_preferences,
                new_topic_preferences: subscription.new_topic_preferences,
            }),
        ),
    };

    let subject = mail.subject().to_string();
    Ok(EventRecord {
        message_id: mail.message_id,
        event_type,
        from: mail.source,
        to: mail.destination.into_iter().collect(),
        subject,
        sent_at,
        additional_data,
    })
}

fn mail_timestamp(
    mail: &Mail,
    event_type: EventType,
) -> Result<EpochMillis, NormalizeError> {
    mail.timestamp.ok_or(NormalizeError::MissingMailTimestamp(event_type))
}

fn required_payload<T: DeserializeOwned>(
    event_type: EventType,
    payloads: &mut Map<String, Value>,
) -> Result<T, NormalizeError> {
    optional_payload(event_type, payloads)?.ok_or(NormalizeError::MissingPayload {
        event_type,
        key: event_type.payload_keys()[0],
    })
}

fn optional_payload<T: DeserializeOwned>(
    event_type: EventType,
    payloads: &mut Map<String, Value>,
) -> Result<Option<T>, NormalizeError> {
    for &key in event_type.payload_keys() {
        let Some(found) =
            payloads.keys().find(|name| name.eq_ignore_ascii_case(key)).cloned()
        else {
            continue;
        };
        let Some(value) = payloads.remove(&found) else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        return serde_json::from_value(value).map(Some).map_err(|source| {
            NormalizeError::InvalidPayload { event_type, key, source }
        });
    }
    Ok(None)
}
