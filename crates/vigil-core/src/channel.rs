//! Channel names.
//!
//! A channel is one of four forms:
//!
//! | Name | Meaning |
//! |---|---|
//! | `dashboard` | institution-wide dashboard statistics |
//! | `alerts:global` | every alert |
//! | `patient:<digits>` | one patient (numeric id fitting in `u32`) |
//! | `device:<token>` | one device (any non-empty token without `:`) |
//!
//! Names are matched by exact string equality everywhere. Nothing treats them
//! as paths or patterns.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Why a channel name was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// Empty string.
    #[error("channel name is empty")]
    Empty,
    /// Prefix is not one of the known channel types.
    #[error("unknown channel type: {0}")]
    UnknownPrefix(String),
    /// `patient:` with nothing after it.
    #[error("patient channel is missing an id")]
    MissingPatientId,
    /// `patient:` followed by something that is not a `u32`.
    #[error("invalid patient id: {0}")]
    InvalidPatientId(String),
    /// `device:` with nothing after it.
    #[error("device channel is missing an id")]
    MissingDeviceId,
    /// More colon-separated segments than the type allows.
    #[error("too many segments in channel name: {0}")]
    TooManySegments(String),
}

/// Parsed structure of a valid channel name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// `dashboard`
    Dashboard,
    /// `alerts:global`
    AlertsGlobal,
    /// `patient:<id>`
    Patient(u32),
    /// `device:<id>`
    Device(String),
}

/// A validated channel name.
///
/// Keeps the exact string the client sent so that `patient:007` and
/// `patient:7` stay distinct channels, as exact matching requires.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Channel {
    name: String,
    kind: ChannelKind,
}

impl Channel {
    /// Validate `name` against the channel grammar.
    pub fn parse(name: &str) -> Result<Self, ChannelError> {
        let kind = validate(name)?;
        Ok(Self {
            name: name.to_owned(),
            kind,
        })
    }

    /// The `dashboard` channel.
    #[must_use]
    pub fn dashboard() -> Self {
        Self {
            name: "dashboard".into(),
            kind: ChannelKind::Dashboard,
        }
    }

    /// The `alerts:global` channel.
    #[must_use]
    pub fn alerts_global() -> Self {
        Self {
            name: "alerts:global".into(),
            kind: ChannelKind::AlertsGlobal,
        }
    }

    /// `patient:<id>` in canonical form.
    #[must_use]
    pub fn patient(id: u32) -> Self {
        Self {
            name: format!("patient:{id}"),
            kind: ChannelKind::Patient(id),
        }
    }

    /// `device:<id>`. Fails on an empty id or one containing `:`.
    pub fn device(id: &str) -> Result<Self, ChannelError> {
        Self::parse(&format!("device:{id}"))
    }

    /// The exact channel string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// Structured view of the channel.
    #[must_use]
    pub fn kind(&self) -> &ChannelKind {
        &self.kind
    }

    /// Consume into the channel string.
    #[must_use]
    pub fn into_string(self) -> String {
        self.name
    }
}

/// Check `name` against the closed grammar, returning its structure.
pub fn validate(name: &str) -> Result<ChannelKind, ChannelError> {
    if name.is_empty() {
        return Err(ChannelError::Empty);
    }

    let mut parts = name.splitn(2, ':');
    let prefix = parts.next().unwrap_or_default();
    let rest = parts.next();

    match (prefix, rest) {
        ("dashboard", None) => Ok(ChannelKind::Dashboard),
        ("dashboard", Some(_)) => Err(ChannelError::TooManySegments(name.to_owned())),
        ("alerts", Some("global")) => Ok(ChannelKind::AlertsGlobal),
        ("alerts", Some(rest)) if rest.starts_with("global:") => {
            Err(ChannelError::TooManySegments(name.to_owned()))
        }
        ("patient", None | Some("")) => Err(ChannelError::MissingPatientId),
        ("patient", Some(id)) => {
            if id.contains(':') {
                return Err(ChannelError::TooManySegments(name.to_owned()));
            }
            // u32::from_str accepts a leading '+', so digits are checked first.
            if !id.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ChannelError::InvalidPatientId(id.to_owned()));
            }
            id.parse::<u32>()
                .map(ChannelKind::Patient)
                .map_err(|_| ChannelError::InvalidPatientId(id.to_owned()))
        }
        ("device", None | Some("")) => Err(ChannelError::MissingDeviceId),
        ("device", Some(id)) => {
            if id.contains(':') {
                return Err(ChannelError::TooManySegments(name.to_owned()));
            }
            Ok(ChannelKind::Device(id.to_owned()))
        }
        _ => Err(ChannelError::UnknownPrefix(name.to_owned())),
    }
}

impl FromStr for Channel {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl AsRef<str> for Channel {
    fn as_ref(&self) -> &str {
        &self.name
    }
}

impl Serialize for Channel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.name)
    }
}

impl<'de> Deserialize<'de> for Channel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
