use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Text(String),
}

/// Accepts either a bare number of seconds or a humantime string (`"10m"`,
/// `"1h 30m"`). Blank strings deserialize to `None`.
pub fn deserialize_optional_duration<'de, D>(
    deserializer: D
) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<RawDuration>::deserialize(deserializer)? {
        None => Ok(None),
        Some(RawDuration::Seconds(secs)) => Ok(Some(Duration::from_secs(secs))),
        Some(RawDuration::Text(value)) => {
            let value = value.trim();
            if value.is_empty() {
                return Ok(None);
            }

            humantime::parse_duration(value).map(Some).map_err(D::Error::custom)
        }
    }
}

/// Same input forms as [`deserialize_optional_duration`] but the value is
/// mandatory once the key is present.
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_optional_duration(deserializer)?
        .ok_or_else(|| D::Error::custom("duration must not be blank"))
}
