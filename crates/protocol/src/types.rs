use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Ordering marker the channel assigns to every message it accepts.
///
/// Positions are opaque apart from one property: a message sent later is
/// always found at a strictly greater position. They bound retrieval windows
/// and are never used to order chunk content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Position(pub u64);

impl Position {
    /// The position immediately before this one (saturating at zero).
    pub fn prev(self) -> Self {
        Self(self.0.saturating_sub(1))
    }

    /// The position immediately after this one (saturating at `u64::MAX`).
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Position {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(Self)
    }
}

/// A file attached to a channel message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub size: u64,
}

/// A message as enumerated from the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelItem {
    pub position: Position,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl ChannelItem {
    /// Returns `true` if the message carries at least one attachment.
    pub fn has_attachment(&self) -> bool {
        !self.attachments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_ordering() {
        assert!(Position(100) < Position(101));
        assert_eq!(Position(100).next(), Position(101));
        assert_eq!(Position(100).prev(), Position(99));
    }

    #[test]
    fn position_saturates() {
        assert_eq!(Position(0).prev(), Position(0));
        assert_eq!(Position(u64::MAX).next(), Position(u64::MAX));
    }

    #[test]
    fn position_parse() {
        assert_eq!(" 1234 ".parse::<Position>().unwrap(), Position(1234));
        assert!("abc".parse::<Position>().is_err());
        assert!("-1".parse::<Position>().is_err());
    }

    #[test]
    fn channel_item_json_skips_empty_fields() {
        let item = ChannelItem {
            position: Position(7),
            content: String::new(),
            attachments: vec![],
        };
        let json = serde_json::to_string(&item).unwrap();
        assert_eq!(json, r#"{"position":7}"#);
        let parsed: ChannelItem = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, item);
        assert!(!parsed.has_attachment());
    }
}
