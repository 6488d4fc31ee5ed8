use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

/// Wall-clock marks stamped by lifecycle transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timestamps {
    #[serde(with = "time_serde")]
    pub created: SystemTime,
    #[serde(with = "opt_time_serde", skip_serializing_if = "Option::is_none", default)]
    pub queued: Option<SystemTime>,
    #[serde(with = "opt_time_serde", skip_serializing_if = "Option::is_none", default)]
    pub started: Option<SystemTime>,
    #[serde(with = "opt_time_serde", skip_serializing_if = "Option::is_none", default)]
    pub ended: Option<SystemTime>,
}

impl Timestamps {
    pub fn new() -> Self {
        Self {
            created: SystemTime::now(),
            queued: None,
            started: None,
            ended: None,
        }
    }

    /// Run time: `started..ended`, or `started..now` while still running.
    ///
    /// `None` until the unit has started.
    pub fn duration(&self) -> Option<Duration> {
        let started = self.started?;
        let end = self.ended.unwrap_or_else(SystemTime::now);
        Some(end.duration_since(started).unwrap_or_default())
    }
}

impl Default for Timestamps {
    fn default() -> Self {
        Self::new()
    }
}

mod time_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    pub fn serialize<S>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let since_epoch = time
            .duration_since(UNIX_EPOCH)
            .map_err(serde::ser::Error::custom)?;
        (since_epoch.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SystemTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(UNIX_EPOCH + Duration::from_millis(millis))
    }
}

mod opt_time_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::SystemTime;

    pub fn serialize<S>(time: &Option<SystemTime>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match time {
            Some(t) => super::time_serde::serialize(t, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<SystemTime>, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(serde::Deserialize)]
        struct Wrap(#[serde(with = "super::time_serde")] SystemTime);

        Ok(Option::<Wrap>::deserialize(deserializer)?.map(|Wrap(t)| t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_is_none_before_start() {
        let ts = Timestamps::new();
        assert!(ts.duration().is_none());
    }

    #[test]
    fn duration_spans_start_to_end() {
        let mut ts = Timestamps::new();
        let start = SystemTime::now();
        ts.started = Some(start);
        ts.ended = Some(start + Duration::from_millis(1500));
        assert_eq!(ts.duration(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn unset_marks_are_omitted() {
        let ts = Timestamps::new();
        let json = serde_json::to_string(&ts).unwrap();
        assert!(json.contains("created"));
        assert!(!json.contains("started"));

        let back: Timestamps = serde_json::from_str(&json).unwrap();
        assert!(back.started.is_none());
    }
}
