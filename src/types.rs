//! Core data types for tickchain

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::EncodingError;

/// Discrete simulation time
pub type Tick = u64;

/// Stable identifier of a simulated entity
pub type EntityId = String;

/// Semantic version for operation rule sets
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    /// Create a new version
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// Check if this version is compatible with another version
    pub fn is_compatible_with(&self, other: &Version) -> bool {
        self.major == other.major
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// SHA-256 digest in its normalized form: 64 lowercase hex characters.
///
/// Parsing accepts the self-describing `sha256:` prefix and uppercase hex, so
/// hashes written by different producers compare equal once normalized.
/// Truncated forms (see [`ContentHash::short`]) are for display only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    /// Self-describing prefix some producers attach
    pub const PREFIX: &'static str = "sha256:";

    /// Wrap a raw 32-byte digest
    pub fn from_digest(digest: &[u8; 32]) -> Self {
        Self(hex::encode(digest))
    }

    /// Parse a hash, accepting the prefixed form and normalizing case
    pub fn parse(value: &str) -> Result<Self, EncodingError> {
        let bare = value.strip_prefix(Self::PREFIX).unwrap_or(value);
        if bare.len() != 64 || !bare.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(EncodingError::MalformedHash {
                value: value.to_string(),
            });
        }
        Ok(Self(bare.to_ascii_lowercase()))
    }

    /// Bare lowercase hex
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `sha256:`-prefixed form
    pub fn prefixed(&self) -> String {
        format!("{}{}", Self::PREFIX, self.0)
    }

    /// First twelve hex characters, for logs and display
    pub fn short(&self) -> &str {
        &self.0[..12]
    }

    /// Compare against a hash in any accepted textual form
    pub fn matches(&self, other: &str) -> bool {
        ContentHash::parse(other).map(|h| h == *self).unwrap_or(false)
    }

    /// Decode back into the raw digest bytes
    pub fn to_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        // Normalized on construction, so decoding cannot fail
        if hex::decode_to_slice(&self.0, &mut out).is_err() {
            out = [0u8; 32];
        }
        out
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ContentHash {
    type Error = EncodingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ContentHash::parse(&value)
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.0
    }
}

/// Whether debits raise or lower an account's balance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountClass {
    Asset,
    Liability,
    Equity,
    Revenue,
    Expense,
}

impl AccountClass {
    /// Debits increase assets; every other class is credit-normal
    pub fn is_debit_normal(&self) -> bool {
        matches!(self, AccountClass::Asset)
    }
}

/// Chart of accounts for double-entry bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Account {
    Cash,
    AccountsReceivable,
    Inventory,
    Equipment,
    AccountsPayable,
    LoansPayable,
    Equity,
    Revenue,
    Cogs,
    OperatingExpenses,
    InterestExpense,
}

impl Account {
    pub fn class(&self) -> AccountClass {
        match self {
            Account::Cash | Account::AccountsReceivable | Account::Inventory | Account::Equipment => {
                AccountClass::Asset
            }
            Account::AccountsPayable | Account::LoansPayable => AccountClass::Liability,
            Account::Equity => AccountClass::Equity,
            Account::Revenue => AccountClass::Revenue,
            Account::Cogs | Account::OperatingExpenses | Account::InterestExpense => {
                AccountClass::Expense
            }
        }
    }
}

/// Kind of financial transaction recorded in a ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    Revenue,
    Expense,
    Investment,
    Loan,
    LoanRepayment,
    Acquisition,
    Dividend,
    Tax,
    /// Genesis of a ledger reopened from a checkpoint
    OpeningBalance,
}
