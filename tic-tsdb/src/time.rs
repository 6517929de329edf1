use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// A point in time carried on the wire as whole seconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct UnixEpoch(pub DateTime<Utc>);

impl UnixEpoch {
    /// Returns None when the value is outside the range chrono can represent.
    pub fn from_seconds(seconds: i64) -> Option<Self> {
        DateTime::from_timestamp(seconds, 0).map(UnixEpoch)
    }

    pub fn seconds(&self) -> i64 {
        self.0.timestamp()
    }

    pub fn into_inner(self) -> DateTime<Utc> {
        self.0
    }
}

impl Serialize for UnixEpoch {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.seconds())
    }
}

impl<'de> Deserialize<'de> for UnixEpoch {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let seconds = i64::deserialize(deserializer)?;
        UnixEpoch::from_seconds(seconds).ok_or_else(|| {
            de::Error::invalid_value(
                de::Unexpected::Signed(seconds),
                &"a unix timestamp in seconds",
            )
        })
    }
}
