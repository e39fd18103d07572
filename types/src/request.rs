use serde::de::{self, Unexpected, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Fence value attached to a generation request and echoed on every response
/// message computed for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for RequestId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

struct RequestIdVisitor;

impl Visitor<'_> for RequestIdVisitor {
    type Value = RequestId;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a non-negative integer request id, as a number or a numeric string")
    }

    fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(RequestId(value))
    }

    fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        u64::try_from(value)
            .map(RequestId)
            .map_err(|_| E::invalid_value(Unexpected::Signed(value), &self))
    }

    // The backend echoes whatever it was sent, and older builds stringify it.
    fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        value
            .trim()
            .parse::<u64>()
            .map(RequestId)
            .map_err(|_| E::invalid_value(Unexpected::Str(value), &self))
    }
}

impl<'de> Deserialize<'de> for RequestId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(RequestIdVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_a_bare_number() {
        let json = serde_json::to_string(&RequestId::new(42)).unwrap();
        assert_eq!(json, "42");
    }

    #[test]
    fn accepts_numeric_strings() {
        let id: RequestId = serde_json::from_str("\"17\"").unwrap();
        assert_eq!(id, RequestId::new(17));
    }

    #[test]
    fn rejects_foreign_identifiers() {
        let result = serde_json::from_str::<RequestId>("\"3f2a-uuid\"");
        assert!(result.is_err());
        let negative = serde_json::from_str::<RequestId>("-1");
        assert!(negative.is_err());
    }
}
