//! Persistence backends.
//!
//! The gateway core only talks to storage through the [`Backend`] trait. A
//! backend owns its own connection handling and must be safe to share across
//! every in-flight request.

mod memory;

pub use memory::MemoryBackend;

use std::sync::Arc;

use async_trait::async_trait;

use crate::channel::{Channel, ChannelType, ChannelUuid};
use crate::config::GatewayConfig;
use crate::error::{BackendError, ConfigError};
use crate::msg::{Msg, MsgStatusUpdate};

/// Storage for channels, messages and status updates.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short name used in logs and configuration.
    fn name(&self) -> &str;

    /// Connect and verify the backend. An error here aborts server startup.
    async fn start(&self) -> Result<(), BackendError>;

    /// Flush and close. Errors are reported but never stop the shutdown.
    async fn stop(&self) -> Result<(), BackendError>;

    /// One-line health summary shown on the index page.
    async fn health(&self) -> String;

    async fn get_channel(
        &self,
        channel_type: &ChannelType,
        uuid: &ChannelUuid,
    ) -> Result<Channel, BackendError>;

    async fn write_msg(&self, msg: &Msg) -> Result<(), BackendError>;

    async fn write_msg_status(&self, status: &MsgStatusUpdate) -> Result<(), BackendError>;
}

/// Create the backend named by `config.backend`.
///
/// The memory backend is seeded from `config.channels_file` when one is set.
pub async fn create_backend(config: &GatewayConfig) -> Result<Arc<dyn Backend>, ConfigError> {
    match config.backend.as_str() {
        "memory" => {
            let backend = MemoryBackend::new();
            if let Some(path) = &config.channels_file {
                let count = backend.load_channels(path).await?;
                tracing::info!(comp = "backend", path = %path.display(), count, "channels loaded");
            }
            Ok(Arc::new(backend))
        }
        other => Err(ConfigError::UnknownBackend(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[tokio::test]
    async fn test_create_memory_backend() {
        let backend = create_backend(&GatewayConfig::default()).await.unwrap();
        assert_eq!(backend.name(), "memory");
        assert_eq!(backend.health().await, "memory: 0 channels, 0 msgs, 0 statuses");
    }

    #[tokio::test]
    async fn test_memory_backend_seeded_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"uuid":"dbc126ed-66bc-4e28-b67b-81dc3327c95d","channel_type":"EX","address":"2020"}}]"#
        )
        .unwrap();
        let config = GatewayConfig {
            channels_file: Some(file.path().to_path_buf()),
            ..GatewayConfig::default()
        };

        let backend = create_backend(&config).await.unwrap();
        let uuid = ChannelUuid::parse("dbc126ed-66bc-4e28-b67b-81dc3327c95d").unwrap();
        let channel = backend.get_channel(&ChannelType::new("EX"), &uuid).await.unwrap();
        assert_eq!(channel.address, "2020");
    }

    #[tokio::test]
    async fn test_unknown_backend_is_config_error() {
        let config = GatewayConfig {
            backend: "postgres".to_string(),
            ..GatewayConfig::default()
        };
        let err = create_backend(&config).await.err().unwrap();
        assert!(matches!(err, ConfigError::UnknownBackend(ref n) if n == "postgres"));
    }
}
