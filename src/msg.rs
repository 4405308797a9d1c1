//! Messages and delivery status updates produced by channel handlers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::channel::{Channel, ChannelType, ChannelUuid};

/// Identifier assigned to every inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MsgUuid(Uuid);

impl MsgUuid {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MsgUuid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MsgUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message received on a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Msg {
    pub uuid: MsgUuid,
    pub channel_uuid: ChannelUuid,
    pub channel_type: ChannelType,
    /// Contact address in URN form, e.g. `tel:+12065551212`.
    pub urn: String,
    pub text: String,
    pub attachments: Vec<String>,
    pub external_id: Option<String>,
    pub contact_name: Option<String>,
    pub received_on: DateTime<Utc>,
}

impl Msg {
    pub fn new(channel: &Channel, urn: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            uuid: MsgUuid::new(),
            channel_uuid: channel.uuid,
            channel_type: channel.channel_type.clone(),
            urn: urn.into(),
            text: text.into(),
            attachments: Vec::new(),
            external_id: None,
            contact_name: None,
            received_on: Utc::now(),
        }
    }

    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    pub fn with_contact_name(mut self, name: impl Into<String>) -> Self {
        self.contact_name = Some(name.into());
        self
    }

    pub fn with_attachment(mut self, url: impl Into<String>) -> Self {
        self.attachments.push(url.into());
        self
    }

    pub fn with_received_on(mut self, received_on: DateTime<Utc>) -> Self {
        self.received_on = received_on;
        self
    }
}

/// Delivery state of an outgoing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MsgStatus {
    #[serde(rename = "P")]
    Pending,
    #[serde(rename = "Q")]
    Queued,
    #[serde(rename = "W")]
    Wired,
    #[serde(rename = "S")]
    Sent,
    #[serde(rename = "D")]
    Delivered,
    #[serde(rename = "E")]
    Errored,
    #[serde(rename = "F")]
    Failed,
}

impl MsgStatus {
    /// Single-letter code used on the wire and in storage.
    pub fn code(&self) -> &'static str {
        match self {
            MsgStatus::Pending => "P",
            MsgStatus::Queued => "Q",
            MsgStatus::Wired => "W",
            MsgStatus::Sent => "S",
            MsgStatus::Delivered => "D",
            MsgStatus::Errored => "E",
            MsgStatus::Failed => "F",
        }
    }
}

impl fmt::Display for MsgStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for MsgStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "P" => Ok(MsgStatus::Pending),
            "Q" => Ok(MsgStatus::Queued),
            "W" => Ok(MsgStatus::Wired),
            "S" => Ok(MsgStatus::Sent),
            "D" => Ok(MsgStatus::Delivered),
            "E" => Ok(MsgStatus::Errored),
            "F" => Ok(MsgStatus::Failed),
            other => Err(format!("unknown message status: {other}")),
        }
    }
}

/// Identifies which message a status update refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgRef {
    /// Gateway-side numeric message id.
    Id(i64),
    /// Provider-side message id.
    ExternalId(String),
}

/// A delivery status transition reported by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgStatusUpdate {
    pub channel_uuid: ChannelUuid,
    pub channel_type: ChannelType,
    pub msg: MsgRef,
    pub status: MsgStatus,
    pub created_on: DateTime<Utc>,
}

impl MsgStatusUpdate {
    pub fn new(channel: &Channel, msg: MsgRef, status: MsgStatus) -> Self {
        Self {
            channel_uuid: channel.uuid,
            channel_type: channel.channel_type.clone(),
            msg,
            status,
            created_on: Utc::now(),
        }
    }
}
