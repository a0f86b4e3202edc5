use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Milliseconds since the unix epoch, the unit of every persisted timestamp.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
)]
#[serde(transparent)]
pub struct EpochMillis(i64);

impl EpochMillis {
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    pub fn now() -> Self {
        let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
        Self(i64::try_from(nanos / 1_000_000).unwrap_or(i64::MAX))
    }

    pub fn parse_rfc3339(value: &str) -> Result<Self, time::error::Parse> {
        let parsed = OffsetDateTime::parse(value.trim(), &Rfc3339)?;
        let millis = parsed.unix_timestamp_nanos() / 1_000_000;
        Ok(Self(i64::try_from(millis).unwrap_or(i64::MAX)))
    }

    pub const fn as_millis(self) -> i64 {
        self.0
    }

    pub fn saturating_add(
        self,
        window: Duration,
    ) -> Self {
        let window = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        Self(self.0.saturating_add(window))
    }
}

impl fmt::Display for EpochMillis {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for EpochMillis {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawTimestamp {
            Millis(i64),
            Text(String),
        }

        match RawTimestamp::deserialize(deserializer)? {
            RawTimestamp::Millis(millis) => Ok(Self::from_millis(millis)),
            RawTimestamp::Text(value) => {
                Self::parse_rfc3339(&value).map_err(D::Error::custom)
            }
        }
    }
}

/// The closed set of lifecycle notifications the pipeline understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Send,
    Delivery,
    Bounce,
    Complaint,
    Open,
    Click,
    Reject,
    RenderingFailure,
    DeliveryDelay,
    Subscription,
}

impl EventType {
    pub const ALL: [EventType; 10] = [
        Self::Send,
        Self::Delivery,
        Self::Bounce,
        Self::Complaint,
        Self::Open,
        Self::Click,
        Self::Reject,
        Self::RenderingFailure,
        Self::DeliveryDelay,
        Self::Subscription,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Send => "Send",
            Self::Delivery => "Delivery",
            Self::Bounce => "Bounce",
            Self::Complaint => "Complaint",
            Self::Open => "Open",
            Self::Click => "Click",
            Self::Reject => "Reject",
            Self::RenderingFailure => "RenderingFailure",
            Self::DeliveryDelay => "DeliveryDelay",
            Self::Subscription => "Subscription",
        }
    }

    /// Keys under which the event-specific sub-object may appear, preferred
    /// key first.
    pub fn payload_keys(self) -> &'static [&'static str] {
        match self {
            Self::Send => &["send"],
            Self::Delivery => &["delivery"],
            Self::Bounce => &["bounce"],
            Self::Complaint => &["complaint"],
            Self::Open => &["open"],
            Self::Click => &["click"],
            Self::Reject => &["reject"],
            Self::RenderingFailure => &["failure", "renderingFailure"],
            Self::DeliveryDelay => &["deliveryDelay"],
            Self::Subscription => &["subscription"],
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown event type `{0}`")]
pub struct UnknownEventType(pub String);

impl FromStr for EventType {
    type Err = UnknownEventType;

    /// Case-insensitive and blind to whitespace, so the provider's display
    /// spelling (`"Rendering Failure"`) resolves too.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        let compact: String =
            value.chars().filter(|c| !c.is_whitespace()).collect();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(&compact))
            .ok_or_else(|| UnknownEventType(value.to_string()))
    }
}

/// Provider-assigned metadata common to every event kind.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mail {
    #[serde(default, deserialize_with = "null_as_default")]
    pub message_id: String,
    #[serde(default)]
    pub timestamp: Option<EpochMillis>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub source: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub destination: Vec<String>,
    #[serde(default)]
    pub common_headers: Option<CommonHeaders>,
}

impl Mail {
    pub fn subject(&self) -> &str {
        self.common_headers
            .as_ref()
            .and_then(|headers| headers.subject.as_deref())
            .unwrap_or_default()
    }
}

/// Providers send `null` for empty mail metadata; treat it like an absent key.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommonHeaders {
    #[serde(default)]
    pub subject: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    pub timestamp: EpochMillis,
    #[serde(default)]
    pub processing_time_millis: Option<u64>,
    #[serde(default)]
    pub recipients: Vec<String>,
    #[serde(default)]
    pub smtp_response: Option<String>,
    #[serde(default, rename = "reportingMTA")]
    pub reporting_mta: Option<String>,
    #[serde(default)]
    pub remote_mta_ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BouncedRecipient {
    pub email_address: String,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub diagnostic_code: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bounce {
    pub timestamp: EpochMillis,
    pub bounce_type: String,
    #[serde(default)]
    pub bounce_sub_type: String,
    #[serde(default)]
    pub bounced_recipients: Vec<BouncedRecipient>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplainedRecipient {
    pub email_address: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Complaint {
    pub timestamp: EpochMillis,
    #[serde(default)]
    pub feedback_id: Option<String>,
    #[serde(default)]
    pub complaint_feedback_type: Option<String>,
    #[serde(default)]
    pub complained_recipients: Vec<ComplainedRecipient>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Open {
    pub timestamp: EpochMillis,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Click {
    pub timestamp: EpochMillis,
    pub link: String,
    #[serde(default)]
    pub link_tags: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reject {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderingFailure {
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub template_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelayedRecipient {
    pub email_address: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub diagnostic_code: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryDelay {
    pub timestamp: EpochMillis,
    pub delay_type: String,
    #[serde(default)]
    pub expiration_time: Option<String>,
    #[serde(default)]
    pub delayed_recipients: Vec<DelayedRecipient>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicSubscription {
    pub topic_name: String,
    pub subscription_status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicPreferences {
    #[serde(default)]
    pub unsubscribe_all: bool,
    #[serde(default)]
    pub topic_subscription_status: Vec<TopicSubscription>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub timestamp: EpochMillis,
    #[serde(default)]
    pub contact_list: Option<String>,
    #[serde(default)]
    pub old_topic_preferences: Option<TopicPreferences>,
    #[serde(default)]
    pub new_topic_preferences: Option<TopicPreferences>,
}

/// One event kind with its strongly typed sub-object.
#[derive(Debug, Clone)]
pub enum EventKind {
    Send,
    Delivery(Delivery),
    Bounce(Bounce),
    Complaint(Complaint),
    Open(Open),
    Click(Click),
    Reject(Reject),
    RenderingFailure(RenderingFailure),
    DeliveryDelay(DeliveryDelay),
    Subscription(Subscription),
}

impl EventKind {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::Send => EventType::Send,
            Self::Delivery(_) => EventType::Delivery,
            Self::Bounce(_) => EventType::Bounce,
            Self::Complaint(_) => EventType::Complaint,
            Self::Open(_) => EventType::Open,
            Self::Click(_) => EventType::Click,
            Self::Reject(_) => EventType::Reject,
            Self::RenderingFailure(_) => EventType::RenderingFailure,
            Self::DeliveryDelay(_) => EventType::DeliveryDelay,
            Self::Subscription(_) => EventType::Subscription,
        }
    }
}

/// A fully classified notification.
#[derive(Debug, Clone)]
pub struct EventDetail {
    pub mail: Mail,
    pub kind: EventKind,
}
