//! Secret strings (SMTP passwords) that never leak into logs or re-serialized
//! configuration.

use bon::Builder;
use getset::Getters;
use serde::de::Visitor;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Debug, Formatter};
use std::result;
use zeroize::Zeroize;

pub static REDACTED: &str = "###REDACTED###";

#[derive(Clone, Zeroize, Builder, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct RedactedString {
    #[builder(into)]
    inner: String,
}

impl Debug for RedactedString {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(REDACTED)
    }
}

impl Serialize for RedactedString {
    fn serialize<S: Serializer>(&self, serializer: S) -> result::Result<S::Ok, S::Error> {
        serializer.serialize_str(REDACTED)
    }
}

impl<'de> Deserialize<'de> for RedactedString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> result::Result<Self, D::Error> {
        deserializer.deserialize_str(RedactedStringVisitor)
    }
}

impl Drop for RedactedString {
    fn drop(&mut self) {
        self.zeroize();
    }
}

struct RedactedStringVisitor;

impl Visitor<'_> for RedactedStringVisitor {
    type Value = RedactedString;

    fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
        formatter.write_str("a string")
    }

    fn visit_str<E>(self, v: &str) -> result::Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(RedactedString::builder().inner(v).build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_hides_value() {
        let secret = RedactedString::builder().inner("hunter22").build();
        let debug = format!("{:?}", secret);
        assert_eq!(debug, REDACTED);
        assert!(!debug.contains("hunter22"));
        assert_eq!(secret.inner(), "hunter22");
    }

    #[test]
    fn test_serialize_hides_value() {
        let secret = RedactedString::builder().inner("hunter22").build();
        let yaml = serde_yml::to_string(&secret).unwrap();
        assert!(yaml.contains(REDACTED));
        assert!(!yaml.contains("hunter22"));
    }

    #[test]
    fn test_deserialize_keeps_value() {
        let secret: RedactedString = serde_yml::from_str("hunter22").unwrap();
        assert_eq!(secret.inner(), "hunter22");
    }
}
