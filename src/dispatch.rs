//! Channel route table and request dispatch.
//!
//! Handlers register actions while the server starts; the table is then
//! turned into an immutable axum [`Router`] mounted under [`CHANNEL_PREFIX`].
//! Every route shares the same dispatch envelope:
//!
//! ```text
//! /c/<type>/{uuid}/<action>/
//!        │
//!        ├─ parse uuid ───────────── invalid ──► 400
//!        ├─ gateway.get_channel ──── missing ──► 404 / backend ──► 500
//!        └─ action(ChannelRequest) ─ Err ──────► status of the error
//!                                    panic ────► 500
//!                                    Ok ───────► handler's response
//! ```

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::Router;
use axum::extract::rejection::PathRejection;
use axum::extract::{OriginalUri, Path, Request};
use axum::http::Method;
use axum::response::{IntoResponse, Response};
use axum::routing::{MethodFilter, MethodRouter};
use futures::FutureExt;

use crate::channel::{ChannelType, ChannelUuid};
use crate::error::{RequestError, RouteError};
use crate::gateway::{ActionFn, ChannelRequest, Gateway};
use crate::handler::ChannelHandler;

/// Path prefix all channel routes are mounted under.
pub const CHANNEL_PREFIX: &str = "/c";

/// One registered channel action.
#[derive(Clone)]
pub struct Route {
    pub method: Method,
    /// Full request path, prefix included.
    pub path: String,
    pub channel_type: ChannelType,
    pub handler_name: String,
    pub action: String,
    func: ActionFn,
}

impl Route {
    /// Line shown for this route on the index page.
    pub fn description(&self) -> String {
        format!("{:<20} - {} {}", self.path, self.handler_name, self.action)
    }

    fn sub_path(&self) -> &str {
        &self.path[CHANNEL_PREFIX.len()..]
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("channel_type", &self.channel_type)
            .field("action", &self.action)
            .finish()
    }
}

/// Routes collected during handler initialization.
#[derive(Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route. Nothing is added when an error is returned.
    pub fn add(
        &mut self,
        handler: &dyn ChannelHandler,
        method: Method,
        action: &str,
        func: ActionFn,
    ) -> Result<&Route, RouteError> {
        if method != Method::GET && method != Method::POST {
            return Err(RouteError::UnsupportedMethod(method));
        }
        if action.is_empty() || action.contains(['/', '{', '}']) {
            return Err(RouteError::InvalidAction(action.to_string()));
        }

        let channel_type = handler.channel_type();
        let path = format!(
            "{}/{}/{{uuid}}/{}/",
            CHANNEL_PREFIX,
            channel_type.path_segment(),
            action
        );
        if self
            .routes
            .iter()
            .any(|r| r.method == method && r.path == path)
        {
            return Err(RouteError::DuplicateRoute { method, path });
        }

        self.routes.push(Route {
            method,
            path,
            channel_type,
            handler_name: handler.channel_name().to_string(),
            action: action.to_string(),
            func,
        });
        Ok(&self.routes[self.routes.len() - 1])
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter()
    }

    /// Index page lines, sorted by path.
    pub fn descriptions(&self) -> Vec<String> {
        let mut lines: Vec<String> = self.routes.iter().map(Route::description).collect();
        lines.sort();
        lines
    }

    /// Build the channel router. Requests under the prefix that match no
    /// route get a structured 404.
    pub fn into_router(self, gateway: Arc<dyn Gateway>) -> Router {
        let mut by_path: BTreeMap<String, MethodRouter> = BTreeMap::new();

        for route in self.routes {
            let filter = if route.method == Method::GET {
                MethodFilter::GET
            } else {
                MethodFilter::POST
            };
            let sub_path = route.sub_path().to_string();
            let target = Arc::new(RouteTarget {
                channel_type: route.channel_type,
                action: route.action,
                func: route.func,
                gateway: Arc::clone(&gateway),
            });
            let handler = move |path: Result<Path<String>, PathRejection>, request: Request| {
                let target = Arc::clone(&target);
                async move { target.dispatch(path, request).await }
            };

            let method_router = by_path.remove(&sub_path).unwrap_or_else(MethodRouter::new);
            by_path.insert(sub_path, method_router.on(filter, handler));
        }

        let channels = by_path
            .into_iter()
            .fold(Router::new(), |router, (path, method_router)| {
                router.route(&path, method_router)
            })
            .fallback(route_not_found);

        Router::new().nest(CHANNEL_PREFIX, channels)
    }
}

/// Everything one route needs at request time.
struct RouteTarget {
    channel_type: ChannelType,
    action: String,
    func: ActionFn,
    gateway: Arc<dyn Gateway>,
}

impl RouteTarget {
    async fn dispatch(&self, path: Result<Path<String>, PathRejection>, request: Request) -> Response {
        match self.try_dispatch(path, request).await {
            Ok(response) => response,
            Err(err) => {
                if err.status().is_server_error() {
                    tracing::error!(
                        comp = "dispatch",
                        channel_type = %self.channel_type,
                        action = %self.action,
                        error = %err,
                        "request failed"
                    );
                } else {
                    tracing::debug!(
                        comp = "dispatch",
                        channel_type = %self.channel_type,
                        action = %self.action,
                        error = %err,
                        "request rejected"
                    );
                }
                err.into_response()
            }
        }
    }

    async fn try_dispatch(
        &self,
        path: Result<Path<String>, PathRejection>,
        request: Request,
    ) -> Result<Response, RequestError> {
        let raw = match path {
            Ok(Path(raw)) => raw,
            Err(rejection) => return Err(RequestError::InvalidUuid(rejection.body_text())),
        };
        let uuid = ChannelUuid::parse(&raw)?;
        let channel = self.gateway.get_channel(&self.channel_type, &uuid).await?;

        let ctx = ChannelRequest {
            channel,
            gateway: Arc::clone(&self.gateway),
            request,
        };
        let func = Arc::clone(&self.func);

        // The handler runs inside the envelope so a panic, even one raised
        // before its future is built, becomes a 500 for this request only.
        match AssertUnwindSafe(async move { func(ctx).await })
            .catch_unwind()
            .await
        {
            Ok(result) => Ok(result?),
            Err(payload) => Err(RequestError::Panicked(panic_message(payload.as_ref()))),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn route_not_found(method: Method, OriginalUri(uri): OriginalUri) -> Response {
    RequestError::RouteNotFound {
        method,
        path: uri.path().to_string(),
    }
    .into_response()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use axum::http::StatusCode;
    use pretty_assertions::assert_eq;
    use tokio::sync::Mutex;
    use tower::ServiceExt;

    use super::*;
    use crate::channel::Channel;
    use crate::config::GatewayConfig;
    use crate::error::{BackendError, HandlerError};
    use crate::gateway::{ActionResult, action};
    use crate::msg::{Msg, MsgStatusUpdate};

    struct NamedHandler(&'static str, &'static str);

    impl ChannelHandler for NamedHandler {
        fn channel_type(&self) -> ChannelType {
            ChannelType::new(self.0)
        }
        fn channel_name(&self) -> &str {
            self.1
        }
        fn initialize(&self, _gateway: &dyn Gateway) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    /// Gateway double with a fixed set of channels.
    #[derive(Default)]
    struct FixedGateway {
        config: GatewayConfig,
        channels: Vec<Channel>,
        fail_lookups: bool,
        msgs: Mutex<Vec<Msg>>,
    }

    #[async_trait]
    impl Gateway for FixedGateway {
        fn config(&self) -> &GatewayConfig {
            &self.config
        }
        fn add_channel_route(
            &self,
            _handler: &dyn ChannelHandler,
            _method: Method,
            _action: &str,
            _func: ActionFn,
        ) -> Result<(), RouteError> {
            Err(RouteError::RoutesFrozen)
        }
        async fn get_channel(
            &self,
            channel_type: &ChannelType,
            uuid: &ChannelUuid,
        ) -> Result<Channel, BackendError> {
            if self.fail_lookups {
                return Err(BackendError::Query("connection reset".into()));
            }
            self.channels
                .iter()
                .find(|c| &c.channel_type == channel_type && &c.uuid == uuid)
                .cloned()
                .ok_or_else(|| BackendError::ChannelNotFound {
                    channel_type: channel_type.clone(),
                    uuid: *uuid,
                })
        }
        async fn write_msg(&self, msg: Msg) -> Result<(), BackendError> {
            self.msgs.lock().await.push(msg);
            Ok(())
        }
        async fn write_msg_status(&self, _status: MsgStatusUpdate) -> Result<(), BackendError> {
            Ok(())
        }
    }

    fn counting_action(counter: Arc<AtomicUsize>) -> ActionFn {
        action(move |req: ChannelRequest| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, HandlerError>(format!("ok {}", req.channel.uuid).into_response())
            }
        })
    }

    async fn no_content(_req: ChannelRequest) -> ActionResult {
        Ok(StatusCode::NO_CONTENT.into_response())
    }

    async fn explode(_req: ChannelRequest) -> ActionResult {
        panic!("handler exploded")
    }

    fn noop() -> ActionFn {
        action(no_content)
    }

    async fn send(router: Router, method: Method, uri: &str) -> (StatusCode, String) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    fn ex_channel() -> Channel {
        Channel::new(
            ChannelUuid::parse("dbc126ed-66bc-4e28-b67b-81dc3327c95d").unwrap(),
            ChannelType::new("EX"),
            "2020",
        )
    }

    #[test]
    fn test_path_is_lowercased_and_prefixed() {
        let mut table = RouteTable::new();
        let route = table
            .add(&NamedHandler("EX", "External"), Method::POST, "receive", noop())
            .unwrap();
        assert_eq!(route.path, "/c/ex/{uuid}/receive/");
        assert_eq!(route.sub_path(), "/ex/{uuid}/receive/");
    }

    #[test]
    fn test_unsupported_methods_add_nothing() {
        let mut table = RouteTable::new();
        let handler = NamedHandler("EX", "External");
        for method in [Method::PUT, Method::DELETE, Method::PATCH, Method::HEAD] {
            let err = table.add(&handler, method.clone(), "receive", noop()).unwrap_err();
            assert!(matches!(err, RouteError::UnsupportedMethod(ref m) if *m == method));
        }
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_duplicate_method_and_action_conflicts() {
        let mut table = RouteTable::new();
        let handler = NamedHandler("EX", "External");
        table.add(&handler, Method::POST, "receive", noop()).unwrap();
        table.add(&handler, Method::GET, "receive", noop()).unwrap();

        let err = table
            .add(&handler, Method::POST, "receive", noop())
            .unwrap_err();
        assert!(matches!(err, RouteError::DuplicateRoute { .. }));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_invalid_action_names() {
        let mut table = RouteTable::new();
        let handler = NamedHandler("EX", "External");
        for action in ["", "a/b", "{uuid}"] {
            assert!(matches!(
                table.add(&handler, Method::GET, action, noop()),
                Err(RouteError::InvalidAction(_))
            ));
        }
        assert!(table.is_empty());
    }

    #[test]
    fn test_descriptions_sorted_regardless_of_registration_order() {
        let mut table = RouteTable::new();
        table
            .add(&NamedHandler("Y", "Yodel"), Method::POST, "status", noop())
            .unwrap();
        table
            .add(&NamedHandler("X", "Xylo"), Method::GET, "receive", noop())
            .unwrap();

        assert_eq!(
            table.descriptions(),
            vec![
                "/c/x/{uuid}/receive/ - Xylo receive".to_string(),
                "/c/y/{uuid}/status/ - Yodel status".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_dispatch_invokes_handler_with_resolved_channel() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut table = RouteTable::new();
        table
            .add(
                &NamedHandler("EX", "External"),
                Method::POST,
                "receive",
                counting_action(counter.clone()),
            )
            .unwrap();
        let gateway = Arc::new(FixedGateway {
            channels: vec![ex_channel()],
            ..FixedGateway::default()
        });
        let router = table.into_router(gateway);

        let (status, body) = send(
            router,
            Method::POST,
            "/c/ex/dbc126ed-66bc-4e28-b67b-81dc3327c95d/receive/",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok dbc126ed-66bc-4e28-b67b-81dc3327c95d");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_malformed_uuid_never_reaches_handler() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut table = RouteTable::new();
        table
            .add(
                &NamedHandler("EX", "External"),
                Method::GET,
                "receive",
                counting_action(counter.clone()),
            )
            .unwrap();
        let router = table.into_router(Arc::new(FixedGateway::default()));

        for bad in ["not-a-uuid", "1234", "dbc126ed-66bc-4e28-b67b-81dc3327c95"] {
            let (status, body) =
                send(router.clone(), Method::GET, &format!("/c/ex/{bad}/receive/")).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert!(body.contains("invalid_uuid"), "body was {body}");
        }
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_channel_is_not_found() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut table = RouteTable::new();
        table
            .add(
                &NamedHandler("EX", "External"),
                Method::GET,
                "receive",
                counting_action(counter.clone()),
            )
            .unwrap();
        let router = table.into_router(Arc::new(FixedGateway {
            channels: vec![ex_channel()],
            ..FixedGateway::default()
        }));

        let (status, body) = send(
            router,
            Method::GET,
            "/c/ex/8eb23e93-5ecb-45ba-b726-3b064e0c56ab/receive/",
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.contains("channel_not_found"));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_backend_lookup_failure_is_server_error() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut table = RouteTable::new();
        table
            .add(
                &NamedHandler("EX", "External"),
                Method::GET,
                "receive",
                counting_action(counter.clone()),
            )
            .unwrap();
        let router = table.into_router(Arc::new(FixedGateway {
            fail_lookups: true,
            ..FixedGateway::default()
        }));

        let (status, body) = send(
            router,
            Method::GET,
            "/c/ex/dbc126ed-66bc-4e28-b67b-81dc3327c95d/receive/",
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.contains("backend_error"));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_handler_error_keeps_partial_work() {
        let mut table = RouteTable::new();
        table
            .add(
                &NamedHandler("EX", "External"),
                Method::POST,
                "receive",
                action(|req: ChannelRequest| async move {
                    req.gateway
                        .write_msg(Msg::new(&req.channel, "tel:+1", "first"))
                        .await?;
                    Err::<Response, _>(HandlerError::BadRequest("missing text".into()))
                }),
            )
            .unwrap();
        let gateway = Arc::new(FixedGateway {
            channels: vec![ex_channel()],
            ..FixedGateway::default()
        });
        let router = table.into_router(gateway.clone());

        let (status, body) = send(
            router,
            Method::POST,
            "/c/ex/dbc126ed-66bc-4e28-b67b-81dc3327c95d/receive/",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("missing text"));
        assert_eq!(gateway.msgs.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_becomes_server_error() {
        let mut table = RouteTable::new();
        table
            .add(
                &NamedHandler("EX", "External"),
                Method::GET,
                "boom",
                action(explode),
            )
            .unwrap();
        table
            .add(&NamedHandler("EX", "External"), Method::GET, "fine", noop())
            .unwrap();
        let router = table.into_router(Arc::new(FixedGateway {
            channels: vec![ex_channel()],
            ..FixedGateway::default()
        }));

        let (status, body) = send(
            router.clone(),
            Method::GET,
            "/c/ex/dbc126ed-66bc-4e28-b67b-81dc3327c95d/boom/",
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!body.contains("exploded"));

        let (status, _) = send(
            router,
            Method::GET,
            "/c/ex/dbc126ed-66bc-4e28-b67b-81dc3327c95d/fine/",
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_get_and_post_share_a_path() {
        let get_count = Arc::new(AtomicUsize::new(0));
        let post_count = Arc::new(AtomicUsize::new(0));
        let handler = NamedHandler("EX", "External");
        let mut table = RouteTable::new();
        table
            .add(&handler, Method::GET, "receive", counting_action(get_count.clone()))
            .unwrap();
        table
            .add(&handler, Method::POST, "receive", counting_action(post_count.clone()))
            .unwrap();
        let router = table.into_router(Arc::new(FixedGateway {
            channels: vec![ex_channel()],
            ..FixedGateway::default()
        }));

        let uri = "/c/ex/dbc126ed-66bc-4e28-b67b-81dc3327c95d/receive/";
        send(router.clone(), Method::GET, uri).await;
        send(router.clone(), Method::POST, uri).await;
        send(router, Method::POST, uri).await;
        assert_eq!(get_count.load(Ordering::SeqCst), 1);
        assert_eq!(post_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_channel_route_is_structured_not_found() {
        let router = RouteTable::new().into_router(Arc::new(FixedGateway::default()));
        let (status, body) = send(router, Method::GET, "/c/zz/whatever/").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.contains("route_not_found"));
        assert!(body.contains("/c/zz/whatever/"));
    }
}
