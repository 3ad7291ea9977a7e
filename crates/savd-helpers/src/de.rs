use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

/// Accepts either plain integer seconds or a humantime string ("90s",
/// "5m") for interval keys in config files.
pub fn deserialize_duration<'de, D>(
    deserializer: D
) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawDuration {
        Seconds(u64),
        Text(String),
    }

    match RawDuration::deserialize(deserializer)? {
        RawDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
        RawDuration::Text(value) => {
            humantime::parse_duration(value.trim()).map_err(D::Error::custom)
        }
    }
}

pub fn deserialize_optional_duration<'de, D>(
    deserializer: D
) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawDuration {
        Seconds(u64),
        Text(String),
    }

    let raw = Option::<RawDuration>::deserialize(deserializer)?;
    match raw {
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

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Probe {
        #[serde(deserialize_with = "super::deserialize_duration")]
        interval: Duration,
        #[serde(
            default,
            deserialize_with = "super::deserialize_optional_duration"
        )]
        timeout: Option<Duration>,
    }

    #[test]
    fn integer_seconds_and_humantime_text_both_parse() {
        let probe: Probe =
            serde_yaml::from_str("interval: 60\ntimeout: 5m\n").unwrap();
        assert_eq!(probe.interval, Duration::from_secs(60));
        assert_eq!(probe.timeout, Some(Duration::from_secs(300)));
    }

    #[test]
    fn absent_optional_duration_is_none() {
        let probe: Probe = serde_yaml::from_str("interval: 2s\n").unwrap();
        assert_eq!(probe.interval, Duration::from_secs(2));
        assert!(probe.timeout.is_none());
    }
}
