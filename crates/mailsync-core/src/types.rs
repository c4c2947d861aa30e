//! Mailbox identifiers and envelope metadata.

use std::num::NonZeroU32;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

/// Unique identifier for a message within a mailbox.
///
/// UIDs are stable for as long as the mailbox's `UIDVALIDITY` does not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uid(pub NonZeroU32);

impl Uid {
    /// Creates a new UID.
    ///
    /// Returns `None` if the value is 0.
    #[must_use]
    pub fn new(n: u32) -> Option<Self> {
        NonZeroU32::new(n).map(Self)
    }

    /// Returns the underlying value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0.get()
    }
}

impl std::fmt::Display for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// UIDVALIDITY epoch of a mailbox.
///
/// If this value changes, all cached UIDs are invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UidValidity(pub NonZeroU32);

impl UidValidity {
    /// Creates a new UIDVALIDITY.
    #[must_use]
    pub fn new(n: u32) -> Option<Self> {
        NonZeroU32::new(n).map(Self)
    }

    /// Returns the underlying value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0.get()
    }
}

impl std::fmt::Display for UidValidity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the server reports when a mailbox is selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxStatus {
    /// Current UIDVALIDITY epoch.
    pub uid_validity: UidValidity,
    /// Number of messages in the mailbox.
    pub message_count: u32,
}

/// A message participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    /// Display name, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Email address.
    pub email: String,
}

impl Address {
    /// Creates an address without a display name.
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            name: None,
            email: email.into(),
        }
    }

    /// Creates an address with a display name.
    pub fn named(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            email: email.into(),
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) if !name.is_empty() => write!(f, "{name} <{}>", self.email),
            _ => write!(f, "{}", self.email),
        }
    }
}

/// Header-level metadata of one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Message UID.
    pub uid: Uid,
    /// `Message-ID` header.
    pub message_id: Option<String>,
    /// `In-Reply-To` header.
    pub in_reply_to: Option<String>,
    /// Message subject.
    pub subject: String,
    /// Senders.
    pub from: Vec<Address>,
    /// Primary recipients.
    pub to: Vec<Address>,
    /// CC recipients.
    pub cc: Vec<Address>,
    /// `Date` header.
    pub date: Option<DateTime<FixedOffset>>,
    /// Flags such as `\Seen` or `\Flagged`.
    pub flags: Vec<String>,
}

impl Envelope {
    /// Creates an envelope with only a UID and subject set.
    pub fn new(uid: Uid, subject: impl Into<String>) -> Self {
        Self {
            uid,
            message_id: None,
            in_reply_to: None,
            subject: subject.into(),
            from: Vec::new(),
            to: Vec::new(),
            cc: Vec::new(),
            date: None,
            flags: Vec::new(),
        }
    }
}

/// Highest UID in a batch of envelopes, or 0 for an empty batch.
pub(crate) fn max_uid(envelopes: &[Envelope]) -> u32 {
    envelopes.iter().map(|e| e.uid.get()).max().unwrap_or(0)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_uid_rejects_zero() {
        assert!(Uid::new(0).is_none());
        assert_eq!(Uid::new(42).unwrap().get(), 42);
        assert!(UidValidity::new(0).is_none());
    }

    #[test]
    fn test_uid_ordering() {
        let a = Uid::new(7).unwrap();
        let b = Uid::new(500).unwrap();
        assert!(a < b);
        assert_eq!(b.to_string(), "500");
    }

    #[test]
    fn test_address_display() {
        assert_eq!(
            Address::named("John Doe", "john@example.com").to_string(),
            "John Doe <john@example.com>"
        );
        assert_eq!(Address::new("jane@example.com").to_string(), "jane@example.com");
        let unnamed = Address {
            name: Some(String::new()),
            email: "x@example.com".into(),
        };
        assert_eq!(unnamed.to_string(), "x@example.com");
    }

    #[test]
    fn test_max_uid() {
        assert_eq!(max_uid(&[]), 0);
        let batch = [
            Envelope::new(Uid::new(9).unwrap(), "b"),
            Envelope::new(Uid::new(31).unwrap(), "c"),
            Envelope::new(Uid::new(2).unwrap(), "a"),
        ];
        assert_eq!(max_uid(&batch), 31);
    }
}
