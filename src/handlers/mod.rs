//! Built-in channel handlers.

pub mod external;

use std::sync::Arc;

use crate::error::RegistryError;
use crate::handler::HandlerRegistry;

pub use external::ExternalHandler;

/// Register every built-in handler, in a fixed order.
pub fn register_builtin(registry: &mut HandlerRegistry) -> Result<(), RegistryError> {
    registry.register(Arc::new(ExternalHandler::new()))?;
    Ok(())
}
