use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt::Display, str::FromStr};

/// A unique identifier for a project, node or link.
///
/// Ids are rendered in the familiar hyphenated UUID layout so that they can be
/// used directly as path segments in compute RPCs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(u128);

impl Id {
    /// Creates an ID with the given number.
    pub const fn new(id: u128) -> Self {
        Self(id)
    }

    /// Creates a pseudorandom ID.
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Gets the underlying ID number.
    pub fn into_inner(self) -> u128 {
        self.0
    }
}

impl From<u128> for Id {
    fn from(n: u128) -> Self {
        Self(n)
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hex = format!("{:032x}", self.0);
        write!(
            f,
            "{}-{}-{}-{}-{}",
            &hex[0..8],
            &hex[8..12],
            &hex[12..16],
            &hex[16..20],
            &hex[20..32]
        )
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[error("Not a valid identifier: {0:?}")]
pub struct ParseIdError(String);

impl FromStr for Id {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex: String = s.chars().filter(|c| *c != '-').collect();
        if hex.len() != 32 {
            return Err(ParseIdError(s.to_string()));
        }
        u128::from_str_radix(&hex, 16)
            .map(Self)
            .map_err(|_| ParseIdError(s.to_string()))
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_layout() {
        let id = Id::new(0x00010203_0405_0607_0809_0a0b0c0d0e0f);
        assert_eq!(id.to_string(), "00010203-0405-0607-0809-0a0b0c0d0e0f");
        assert_eq!("00010203-0405-0607-0809-0a0b0c0d0e0f".parse::<Id>(), Ok(id));
    }

    #[test]
    fn rejects_garbage() {
        assert!("not-an-id".parse::<Id>().is_err());
        assert!("0001020304050607080g0a0b0c0d0e0f".parse::<Id>().is_err());
    }
}
