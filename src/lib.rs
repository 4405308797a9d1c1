//! Routing and lifecycle core of a multi-provider webhook message gateway.
//!
//! Channel handlers register per-provider actions at startup; the server
//! mounts them under `/c/<type>/{uuid}/<action>/`, resolves the addressed
//! channel for every request and hands it to the handler.

pub mod backend;
pub mod channel;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod handler;
pub mod handlers;
pub mod msg;
pub mod server;
pub mod spool;
pub mod worker;

pub use config::GatewayConfig;
pub use error::{Error, Result};
pub use gateway::Gateway;
pub use handler::{ChannelHandler, HandlerRegistry};
pub use server::{LifecycleState, Server};
