use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

use crate::Error;

/// A 20-byte SHA-1 digest, as used for chunk hashes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Id20(pub [u8; 20]);

impl Id20 {
    pub const fn new(from: [u8; 20]) -> Id20 {
        Id20(from)
    }

    pub fn as_string(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<[u8; 20]> for Id20 {
    fn from(value: [u8; 20]) -> Self {
        Id20(value)
    }
}

impl std::fmt::Debug for Id20 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x?}")?;
        }
        Ok(())
    }
}

impl std::fmt::Display for Id20 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

impl FromStr for Id20 {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 20];
        if s.len() != 40 {
            return Err(Error::BadHexLength(40));
        }
        hex::decode_to_slice(s, &mut out)?;
        Ok(Id20(out))
    }
}

impl Serialize for Id20 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.as_string())
    }
}

impl<'de> Deserialize<'de> for Id20 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Id20::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_str_roundtrips_through_display() {
        let s = "a9993e364706816aba3e25717850c26c9cd0d89d";
        let id = Id20::from_str(s).unwrap();
        assert_eq!(id.0[0], 0xa9);
        assert_eq!(id.to_string(), s);
    }

    #[test]
    fn test_from_str_bad_length() {
        assert!(matches!(
            Id20::from_str("abcd"),
            Err(Error::BadHexLength(40))
        ));
    }

    #[test]
    fn test_serde_as_hex() {
        let id = Id20::new([1; 20]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", "01".repeat(20)));
        let back: Id20 = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
