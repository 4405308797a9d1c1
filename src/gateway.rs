//! The narrow interface channel handlers use to reach the gateway.
//!
//! Handlers never see the server, the listener or the backend directly. They
//! register routes and read/write through [`Gateway`], which makes them easy
//! to test against a double implementing the same trait.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::Request;
use axum::http::Method;
use axum::response::Response;
use futures::future::BoxFuture;

use crate::channel::{Channel, ChannelType, ChannelUuid};
use crate::config::GatewayConfig;
use crate::error::{BackendError, HandlerError, RouteError};
use crate::handler::ChannelHandler;
use crate::msg::{Msg, MsgStatusUpdate};

/// Everything an action handler gets for one request.
pub struct ChannelRequest {
    /// The channel addressed by the request, freshly resolved.
    pub channel: Channel,
    pub gateway: Arc<dyn Gateway>,
    pub request: Request,
}

/// Result of a channel action. On success the handler owns the response.
pub type ActionResult = Result<Response, HandlerError>;

/// A registered channel action.
pub type ActionFn = Arc<dyn Fn(ChannelRequest) -> BoxFuture<'static, ActionResult> + Send + Sync>;

/// Wrap an async closure as an [`ActionFn`].
pub fn action<F, Fut>(f: F) -> ActionFn
where
    F: Fn(ChannelRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ActionResult> + Send + 'static,
{
    Arc::new(move |req| Box::pin(f(req)))
}

/// Gateway services available to channel handlers.
#[async_trait]
pub trait Gateway: Send + Sync {
    fn config(&self) -> &GatewayConfig;

    /// Register `func` for `method` on `/c/<type>/{uuid}/<action>/`.
    ///
    /// Only GET and POST are supported. Registering the same method and
    /// action twice for a channel type is an error.
    fn add_channel_route(
        &self,
        handler: &dyn ChannelHandler,
        method: Method,
        action: &str,
        func: ActionFn,
    ) -> Result<(), RouteError>;

    async fn get_channel(
        &self,
        channel_type: &ChannelType,
        uuid: &ChannelUuid,
    ) -> Result<Channel, BackendError>;

    /// Persist a received message. Transient backend failures are spooled
    /// and reported as success.
    async fn write_msg(&self, msg: Msg) -> Result<(), BackendError>;

    /// Persist a status update, spooling on transient backend failures.
    async fn write_msg_status(&self, status: MsgStatusUpdate) -> Result<(), BackendError>;
}
