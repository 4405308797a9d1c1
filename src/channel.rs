//! Channel identity types and the channel entity resolved per request.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RequestError;

/// Short code naming a protocol adapter family, e.g. `EX` or `TG`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelType(String);

impl ChannelType {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path segment used when mounting this type's routes.
    pub fn path_segment(&self) -> String {
        self.0.to_lowercase()
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelType {
    fn from(code: &str) -> Self {
        Self::new(code)
    }
}

/// Validated identifier of one configured channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelUuid(Uuid);

impl ChannelUuid {
    /// Parse a UUID taken from a request path.
    ///
    /// Only the hyphenated form is accepted; anything else is rejected as
    /// [`RequestError::InvalidUuid`] rather than treated as a lookup miss.
    pub fn parse(raw: &str) -> Result<Self, RequestError> {
        if raw.len() != 36 {
            return Err(RequestError::InvalidUuid(raw.to_string()));
        }
        Uuid::parse_str(raw)
            .map(Self)
            .map_err(|_| RequestError::InvalidUuid(raw.to_string()))
    }

    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for ChannelUuid {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for ChannelUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A configured integration instance as stored by the backend.
///
/// The gateway never caches channels: each request resolves its channel anew,
/// so configuration edits take effect on the next request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub uuid: ChannelUuid,
    pub channel_type: ChannelType,
    #[serde(default)]
    pub name: String,
    /// Provider-side address, e.g. a phone number or bot handle.
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub config: HashMap<String, serde_json::Value>,
}

impl Channel {
    pub fn new(uuid: ChannelUuid, channel_type: ChannelType, address: impl Into<String>) -> Self {
        Self {
            uuid,
            channel_type,
            name: String::new(),
            address: address.into(),
            country: None,
            config: HashMap::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    pub fn config_value(&self, key: &str) -> Option<&serde_json::Value> {
        self.config.get(key)
    }

    /// String config value, `None` when missing or not a string.
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }
}
