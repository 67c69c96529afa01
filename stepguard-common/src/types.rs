//! Common types used across stepguard components.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A JSON document stored by the target node.
pub type Document = serde_json::Value;

/// Address of a target node (`host:port`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Endpoint(String);

impl Endpoint {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<std::net::SocketAddr> for Endpoint {
    fn from(addr: std::net::SocketAddr) -> Self {
        Self(addr.to_string())
    }
}

/// Fully qualified collection name (`db.collection`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Namespace {
    pub db: String,
    pub coll: String,
}

impl Namespace {
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

/// Error returned when a namespace string has no `db.` prefix or an empty part.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid namespace '{0}': expected <db>.<collection>")]
pub struct InvalidNamespace(pub String);

impl FromStr for Namespace {
    type Err = InvalidNamespace;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Collection names may contain dots; the database name may not.
        match s.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Self::new(db, coll)),
            _ => Err(InvalidNamespace(s.to_string())),
        }
    }
}

impl TryFrom<String> for Namespace {
    type Error = InvalidNamespace;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Namespace> for String {
    fn from(ns: Namespace) -> Self {
        ns.to_string()
    }
}

/// Server-issued identifier of an open cursor. `0` means exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CursorId(pub u64);

impl CursorId {
    pub const EXHAUSTED: Self = Self(0);

    pub fn is_exhausted(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for CursorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Replica-set member state as reported by `hello` and `replSetGetStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberState {
    Startup,
    Primary,
    Secondary,
}

impl Default for MemberState {
    fn default() -> Self {
        Self::Startup
    }
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Startup => write!(f, "STARTUP"),
            Self::Primary => write!(f, "PRIMARY"),
            Self::Secondary => write!(f, "SECONDARY"),
        }
    }
}

impl FromStr for MemberState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "STARTUP" => Ok(Self::Startup),
            "PRIMARY" => Ok(Self::Primary),
            "SECONDARY" => Ok(Self::Secondary),
            other => Err(format!("unknown member state '{other}'")),
        }
    }
}

/// Mode of a fail point.
///
/// `Times(n)` catches the next `n` operations reaching the checkpoint; a
/// caught operation stays paused until the fail point is turned off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailPointMode {
    Off,
    AlwaysOn,
    Times(u32),
}

impl FailPointMode {
    pub fn is_off(&self) -> bool {
        matches!(self, Self::Off)
    }
}

impl fmt::Display for FailPointMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Off => write!(f, "off"),
            Self::AlwaysOn => write!(f, "alwaysOn"),
            Self::Times(n) => write!(f, "times:{n}"),
        }
    }
}

impl FromStr for FailPointMode {
    type Err = String;

    /// Accepts `off`, `alwaysOn` and `times:N`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(count) = s.strip_prefix("times:") {
            return count
                .parse::<u32>()
                .map(Self::Times)
                .map_err(|_| format!("invalid fail point count '{count}'"));
        }
        match s {
            "off" => Ok(Self::Off),
            "alwaysOn" | "always_on" | "on" => Ok(Self::AlwaysOn),
            other => Err(format!(
                "unknown fail point mode '{other}' (expected off, alwaysOn or times:N)"
            )),
        }
    }
}

/// Number of members that must acknowledge a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteAck {
    Majority,
    Nodes(u32),
}

/// Durability requirement attached to a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteConcern {
    pub w: WriteAck,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wtimeout_ms: Option<u64>,
}

impl WriteConcern {
    pub fn majority() -> Self {
        Self {
            w: WriteAck::Majority,
            wtimeout_ms: None,
        }
    }

    pub fn with_timeout_ms(mut self, wtimeout_ms: u64) -> Self {
        self.wtimeout_ms = Some(wtimeout_ms);
        self
    }
}

/// Serialize documents with sorted keys so equal result sets compare equal
/// byte for byte.
pub fn canonical_batch(docs: &[Document]) -> String {
    // serde_json's default Map is a BTreeMap, so keys are emitted sorted.
    serde_json::to_string(docs).unwrap_or_default()
}
