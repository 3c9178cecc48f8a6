use crate::{Result, TroveError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Publication channels, ordered from most to least stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    Stable,
    Candidate,
    Beta,
    Edge,
    Unpublished,
}

impl Channel {
    pub const ORDERED: [Channel; 5] = [
        Channel::Stable,
        Channel::Candidate,
        Channel::Beta,
        Channel::Edge,
        Channel::Unpublished,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Stable => "stable",
            Channel::Candidate => "candidate",
            Channel::Beta => "beta",
            Channel::Edge => "edge",
            Channel::Unpublished => "unpublished",
        }
    }

    /// Parses a channel name. The legacy `development` channel is read as
    /// `edge`.
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stable" => Ok(Channel::Stable),
            "candidate" => Ok(Channel::Candidate),
            "beta" => Ok(Channel::Beta),
            "edge" | "development" => Ok(Channel::Edge),
            "unpublished" => Ok(Channel::Unpublished),
            other => Err(TroveError::InvalidRequest(format!(
                "unknown channel {:?}",
                other
            ))),
        }
    }

    /// Picks the most stable of the given channels. Falls back to
    /// `Unpublished` when nothing has been published.
    pub fn most_stable(channels: &[Channel]) -> Channel {
        channels.iter().copied().min().unwrap_or(Channel::Unpublished)
    }

    pub fn is_published(&self) -> bool {
        *self != Channel::Unpublished
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Channel {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Channel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Channel::parse(&raw).map_err(serde::de::Error::custom)
    }
}
