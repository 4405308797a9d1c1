//! Channel handler registry and activation policy.
//!
//! Every supported provider is a [`ChannelHandler`]. The entry point builds a
//! [`HandlerRegistry`] explicitly, in order, and the server initializes the
//! handlers the [`ActivationFilter`] lets through when it starts.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::channel::ChannelType;
use crate::config::GatewayConfig;
use crate::error::{HandlerError, RegistryError, StartupError};
use crate::gateway::Gateway;

/// A pluggable implementation of one channel type's webhook protocol.
pub trait ChannelHandler: Send + Sync {
    fn channel_type(&self) -> ChannelType;

    /// Human-readable name shown on the index page.
    fn channel_name(&self) -> &str;

    /// Register this handler's routes. Called once, before the listener binds.
    fn initialize(&self, gateway: &dyn Gateway) -> Result<(), HandlerError>;
}

/// Decides which registered handlers are activated.
///
/// A non-empty include list wins: only listed types are activated and the
/// exclude list is ignored. Otherwise every type not in the exclude list is
/// activated.
#[derive(Debug, Clone, Default)]
pub struct ActivationFilter {
    include: HashSet<String>,
    exclude: HashSet<String>,
}

impl ActivationFilter {
    pub fn new<I, E>(include: I, exclude: E) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
        E: IntoIterator,
        E::Item: Into<String>,
    {
        Self {
            include: include.into_iter().map(Into::into).collect(),
            exclude: exclude.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(
            config.include_channels.iter().cloned(),
            config.exclude_channels.iter().cloned(),
        )
    }

    pub fn is_active(&self, channel_type: &ChannelType) -> bool {
        if !self.include.is_empty() {
            return self.include.contains(channel_type.as_str());
        }
        !self.exclude.contains(channel_type.as_str())
    }
}

/// Ordered set of available handlers, unique by channel type.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn ChannelHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn ChannelHandler>) -> Result<(), RegistryError> {
        let channel_type = handler.channel_type();
        if self
            .handlers
            .iter()
            .any(|h| h.channel_type() == channel_type)
        {
            return Err(RegistryError::DuplicateChannelType(channel_type));
        }
        self.handlers.push(handler);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn channel_types(&self) -> Vec<ChannelType> {
        self.handlers.iter().map(|h| h.channel_type()).collect()
    }

    /// Handlers the filter activates, in registration order.
    pub fn activated<'a>(
        &'a self,
        filter: &'a ActivationFilter,
    ) -> impl Iterator<Item = &'a Arc<dyn ChannelHandler>> + 'a {
        self.handlers
            .iter()
            .filter(move |h| filter.is_active(&h.channel_type()))
    }

    /// Initialize every activated handler against `gateway`.
    ///
    /// Stops at the first failure: a handler that cannot initialize must not
    /// silently shrink the gateway's surface.
    pub fn initialize(
        &self,
        gateway: &dyn Gateway,
        filter: &ActivationFilter,
    ) -> Result<BTreeMap<ChannelType, Arc<dyn ChannelHandler>>, StartupError> {
        let mut active = BTreeMap::new();
        for handler in self.activated(filter) {
            let channel_type = handler.channel_type();
            handler
                .initialize(gateway)
                .map_err(|e| StartupError::HandlerInit {
                    channel_type: channel_type.clone(),
                    reason: e.to_string(),
                })?;

            tracing::info!(
                comp = "server",
                handler = handler.channel_name(),
                handler_type = %channel_type,
                "handler initialized"
            );
            active.insert(channel_type, Arc::clone(handler));
        }
        Ok(active)
    }
}
