//! Migration identifiers
//!
//! Every migration is addressed by `<ordinal>_<slug>`, e.g. `0017_postgresql_9p6_to_11`.
//! The ordinal drives default ordering and short references on the command line.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::MigrationError;

/// Validated migration identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MigrationId {
    raw: String,
    ordinal: u32,
    split: usize,
}

impl MigrationId {
    /// Parse an identifier, checking the `^[0-9]+_[A-Za-z0-9_]+$` convention
    pub fn parse(raw: &str) -> Result<Self, MigrationError> {
        let invalid = |reason: &str| MigrationError::InvalidId {
            id: raw.to_string(),
            reason: reason.to_string(),
        };

        let split = raw
            .find('_')
            .ok_or_else(|| invalid("missing '_' between ordinal and name"))?;
        let (digits, rest) = (&raw[..split], &raw[split + 1..]);

        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid("ordinal prefix must be decimal digits"));
        }
        if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
            return Err(invalid("name must be non-empty and use [A-Za-z0-9_]"));
        }
        let ordinal = digits
            .parse::<u32>()
            .map_err(|_| invalid("ordinal prefix does not fit in 32 bits"))?;

        Ok(Self {
            raw: raw.to_string(),
            ordinal,
            split,
        })
    }

    /// Full identifier
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Integer ordering key
    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    /// Ordinal exactly as written (keeps leading zeros)
    pub fn ordinal_text(&self) -> &str {
        &self.raw[..self.split]
    }

    /// Everything after the first separator
    pub fn slug(&self) -> &str {
        &self.raw[self.split + 1..]
    }

    /// Does `target` name this migration by id, slug or ordinal?
    pub fn matches(&self, target: &str) -> bool {
        if target == self.raw || target == self.slug() || target == self.ordinal_text() {
            return true;
        }
        target.bytes().all(|b| b.is_ascii_digit())
            && target.parse::<u32>().is_ok_and(|n| n == self.ordinal)
    }
}

impl fmt::Display for MigrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for MigrationId {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for MigrationId {
    type Error = MigrationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<MigrationId> for String {
    fn from(id: MigrationId) -> Self {
        id.raw
    }
}

impl AsRef<str> for MigrationId {
    fn as_ref(&self) -> &str {
        &self.raw
    }
}
