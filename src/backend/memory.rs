//! In-process backend keeping everything in memory.
//!
//! Useful for local runs and tests. Channels can be seeded from a JSON file
//! holding an array of [`Channel`] objects.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::Backend;
use crate::channel::{Channel, ChannelType, ChannelUuid};
use crate::error::{BackendError, ConfigError};
use crate::msg::{Msg, MsgStatusUpdate};

/// Backend storing channels, messages and statuses in memory.
pub struct MemoryBackend {
    channels: RwLock<HashMap<ChannelUuid, Channel>>,
    msgs: RwLock<Vec<Msg>>,
    statuses: RwLock<Vec<MsgStatusUpdate>>,
    started: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            msgs: RwLock::new(Vec::new()),
            statuses: RwLock::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Add or replace a channel.
    pub async fn add_channel(&self, channel: Channel) {
        self.channels.write().await.insert(channel.uuid, channel);
    }

    pub async fn remove_channel(&self, uuid: &ChannelUuid) -> Option<Channel> {
        self.channels.write().await.remove(uuid)
    }

    /// Load channels from a JSON array file, returning how many were added.
    pub async fn load_channels(&self, path: &Path) -> Result<usize, ConfigError> {
        let raw = tokio::fs::read_to_string(path).await?;
        let channels: Vec<Channel> = serde_json::from_str(&raw)
            .map_err(|e| ConfigError::ParseError(format!("{}: {}", path.display(), e)))?;

        let count = channels.len();
        let mut map = self.channels.write().await;
        for channel in channels {
            map.insert(channel.uuid, channel);
        }
        Ok(count)
    }

    pub async fn msgs(&self) -> Vec<Msg> {
        self.msgs.read().await.clone()
    }

    pub async fn statuses(&self) -> Vec<MsgStatusUpdate> {
        self.statuses.read().await.clone()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn start(&self) -> Result<(), BackendError> {
        self.started.store(true, Ordering::SeqCst);
        tracing::info!(comp = "backend", backend = "memory", state = "started", "backend started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), BackendError> {
        self.started.store(false, Ordering::SeqCst);
        tracing::info!(comp = "backend", backend = "memory", state = "stopped", "backend stopped");
        Ok(())
    }

    async fn health(&self) -> String {
        format!(
            "memory: {} channels, {} msgs, {} statuses",
            self.channels.read().await.len(),
            self.msgs.read().await.len(),
            self.statuses.read().await.len()
        )
    }

    async fn get_channel(
        &self,
        channel_type: &ChannelType,
        uuid: &ChannelUuid,
    ) -> Result<Channel, BackendError> {
        // A channel only resolves through the handler of its own type.
        self.channels
            .read()
            .await
            .get(uuid)
            .filter(|c| &c.channel_type == channel_type)
            .cloned()
            .ok_or_else(|| BackendError::ChannelNotFound {
                channel_type: channel_type.clone(),
                uuid: *uuid,
            })
    }

    async fn write_msg(&self, msg: &Msg) -> Result<(), BackendError> {
        self.msgs.write().await.push(msg.clone());
        Ok(())
    }

    async fn write_msg_status(&self, status: &MsgStatusUpdate) -> Result<(), BackendError> {
        self.statuses.write().await.push(status.clone());
        Ok(())
    }
}
