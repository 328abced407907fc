//! Normalized email addresses.
//!
//! Every address entering the pipeline is normalized exactly once
//! (trimmed, lower-cased) and carried as an [`EmailAddress`] from then on.
//! Suppression lists key on the MD5 of the normalized form, so the
//! normalization here is the single definition the rest of the system
//! relies on.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::error::AddressError;

/// A syntactically plausible, normalized email address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EmailAddress(String);

impl EmailAddress {
    /// Parse and normalize an address.
    ///
    /// Normalization is trim + ASCII lowercase. Validation is deliberately
    /// shallow: exactly one `@`, a non-empty local part, and a domain
    /// containing at least one dot. Anything stricter belongs to the ESP.
    ///
    /// # Errors
    ///
    /// Returns [`AddressError`] when the input has no usable local part or
    /// domain.
    pub fn parse(raw: &str) -> Result<Self, AddressError> {
        let normalized = raw.trim().to_ascii_lowercase();

        let Some((local, domain)) = normalized.split_once('@') else {
            return Err(AddressError::MissingAt(raw.to_string()));
        };

        if local.is_empty() {
            return Err(AddressError::EmptyLocalPart(raw.to_string()));
        }

        if domain.is_empty() || !domain.contains('.') || domain.contains('@') {
            return Err(AddressError::InvalidDomain(raw.to_string()));
        }

        Ok(Self(normalized))
    }

    /// The normalized address as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The domain part, already lower-cased.
    #[must_use]
    pub fn domain(&self) -> &str {
        // Guaranteed by `parse`.
        self.0.rsplit('@').next().unwrap_or_default()
    }

    /// MD5 of the normalized address, rendered as lowercase hex.
    ///
    /// This is the key used for suppression-list membership.
    #[must_use]
    pub fn md5_hash(&self) -> String {
        format!("{:x}", md5::compute(self.0.as_bytes()))
    }
}

impl Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for EmailAddress {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<EmailAddress> for String {
    fn from(value: EmailAddress) -> Self {
        value.0
    }
}

impl AsRef<str> for EmailAddress {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_case_and_whitespace() {
        let addr = EmailAddress::parse("  User@Example.COM \n").unwrap();
        assert_eq!(addr.as_str(), "user@example.com");
        assert_eq!(addr.domain(), "example.com");
    }

    #[test]
    fn normalization_is_idempotent() {
        let once = EmailAddress::parse("MiXeD@Example.Com").unwrap();
        let twice = EmailAddress::parse(once.as_str()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(EmailAddress::parse("no-at-sign").is_err());
        assert!(EmailAddress::parse("@example.com").is_err());
        assert!(EmailAddress::parse("user@").is_err());
        assert!(EmailAddress::parse("user@nodot").is_err());
        assert!(EmailAddress::parse("a@b@c.com").is_err());
    }

    #[test]
    fn md5_matches_known_digest() {
        let addr = EmailAddress::parse("User@Example.com").unwrap();
        // md5("user@example.com")
        assert_eq!(addr.md5_hash(), "b58996c504c5638798eb6b511e6f49af");
    }

    #[test]
    fn serde_round_trip_normalizes() {
        let addr: EmailAddress = serde_json::from_str("\"A@B.Example.COM\"").unwrap();
        assert_eq!(addr.as_str(), "a@b.example.com");
        assert_eq!(
            serde_json::to_string(&addr).unwrap(),
            "\"a@b.example.com\""
        );
    }
}
