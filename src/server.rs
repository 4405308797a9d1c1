//! Server lifecycle: backend, background workers, handlers and listener.
//!
//! ```text
//! Created ──start()──► Starting ──► Running ──stop()──► Stopping ──► Stopped
//!                         │
//!                         └── backend or handler failure ──► Failed
//! ```
//!
//! `start` brings things up in order: backend, background workers, handler
//! initialization (which fills the route table), then the listener. `stop`
//! stops the backend, cancels the shared shutdown token, lets the listener
//! drain and waits for every tracked task before returning.
//!
//! Every accepted connection, and every HTTP/2 stream on it, runs on the
//! server's [`TaskTracker`]. Requests still running when `shutdown_grace`
//! elapses are dropped, so nothing started by the server outlives `stop`.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::extract::State;
use axum::http::Method;
use axum::response::Html;
use axum::routing::get;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::{RequestBodyTimeoutLayer, TimeoutLayer};
use tower_http::trace::TraceLayer;

use crate::backend::{Backend, create_backend};
use crate::channel::{Channel, ChannelType, ChannelUuid};
use crate::config::GatewayConfig;
use crate::dispatch::RouteTable;
use crate::error::{BackendError, RouteError, ShutdownError, StartupError};
use crate::gateway::{ActionFn, Gateway};
use crate::handler::{ActivationFilter, ChannelHandler, HandlerRegistry};
use crate::handlers;
use crate::msg::{Msg, MsgStatusUpdate};
use crate::spool::{SpoolFlusher, SpooledWrite, WriteSpool};
use crate::worker::BackgroundWorker;

/// Where the server is in its lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    /// `start` aborted; the server cannot be started again.
    Failed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Created => "created",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Failed => "failed",
        };
        f.write_str(s)
    }
}

const SPLASH: &str = r"
  ___ __      __ (_) | |_  ___ | |__   _  _  __ _  _ _  __| |
 (_-< \ \ /\ / / | | |  _|/ __|| '_ \ | || |/ _` || '_|/ _` |
 /__/  \_/\_/    |_|  \__|\___||_||_|  \_, |\__,_||_|  \__,_|
                                       |__/   v";

struct ServerState {
    lifecycle: LifecycleState,
    stopped: bool,
    /// `None` once the routes are frozen into the router.
    routes: Option<RouteTable>,
    route_descriptions: Vec<String>,
    workers: Vec<Box<dyn BackgroundWorker>>,
    local_addr: Option<SocketAddr>,
}

struct ServerInner {
    config: GatewayConfig,
    backend: Arc<dyn Backend>,
    registry: HandlerRegistry,
    spool: Arc<WriteSpool>,
    state: Mutex<ServerState>,
    active: OnceLock<BTreeMap<ChannelType, Arc<dyn ChannelHandler>>>,
    shutdown: CancellationToken,
    /// Cancelled when the grace period runs out; drops in-flight requests.
    hard_stop: CancellationToken,
    tasks: TaskTracker,
    /// Held for the whole of `start` and `stop` so they never interleave.
    transition: tokio::sync::Mutex<()>,
}

/// The gateway server. Cheap to clone; clones share one lifecycle.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Create a server. Nothing is started until [`Server::start`].
    pub fn new(config: GatewayConfig, backend: Arc<dyn Backend>, registry: HandlerRegistry) -> Self {
        let spool = Arc::new(WriteSpool::new(config.spool.clone()));
        Self {
            inner: Arc::new(ServerInner {
                config,
                backend,
                registry,
                spool,
                state: Mutex::new(ServerState {
                    lifecycle: LifecycleState::Created,
                    stopped: false,
                    routes: Some(RouteTable::new()),
                    route_descriptions: Vec::new(),
                    workers: Vec::new(),
                    local_addr: None,
                }),
                active: OnceLock::new(),
                shutdown: CancellationToken::new(),
                hard_stop: CancellationToken::new(),
                tasks: TaskTracker::new(),
                transition: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Validate `config`, create the backend it names and register the
    /// built-in handlers.
    pub async fn from_config(config: GatewayConfig) -> crate::Result<Self> {
        config.validate()?;
        let backend = create_backend(&config).await?;

        let mut registry = HandlerRegistry::new();
        handlers::register_builtin(&mut registry)?;

        Ok(Self::new(config, backend, registry))
    }

    /// Queue an extra background worker, started alongside the spool flusher.
    pub fn add_worker(&self, worker: Box<dyn BackgroundWorker>) -> Result<(), StartupError> {
        let mut state = self.lock_state();
        if state.lifecycle != LifecycleState::Created {
            return Err(StartupError::InvalidState(state.lifecycle));
        }
        state.workers.push(worker);
        Ok(())
    }

    pub fn state(&self) -> LifecycleState {
        self.lock_state().lifecycle
    }

    /// Whether `stop` has begun signalling shutdown.
    pub fn stopped(&self) -> bool {
        self.lock_state().stopped
    }

    /// Address the listener is bound to, if binding succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock_state().local_addr
    }

    /// Token cancelled when the server stops. Long-running work spawned by
    /// handlers should watch it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Tracker `stop` waits on. Tasks spawned on it delay `stop` until done.
    pub fn task_tracker(&self) -> TaskTracker {
        self.inner.tasks.clone()
    }

    pub fn spool(&self) -> &Arc<WriteSpool> {
        &self.inner.spool
    }

    /// Sorted index page lines for every channel route.
    pub fn route_descriptions(&self) -> Vec<String> {
        let state = self.lock_state();
        match &state.routes {
            Some(table) => table.descriptions(),
            None => state.route_descriptions.clone(),
        }
    }

    /// Channel types whose handlers were initialized.
    pub fn active_channel_types(&self) -> Vec<ChannelType> {
        self.inner
            .active
            .get()
            .map(|active| active.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Start the backend, background workers, handlers and listener.
    ///
    /// A listener that fails to bind is logged and the server still runs,
    /// without an HTTP surface.
    pub async fn start(&self) -> Result<(), StartupError> {
        let _transition = self.inner.transition.lock().await;
        {
            let mut state = self.lock_state();
            if state.lifecycle != LifecycleState::Created {
                return Err(StartupError::InvalidState(state.lifecycle));
            }
            state.lifecycle = LifecycleState::Starting;
        }

        if let Err(e) = self.inner.backend.start().await {
            tracing::error!(
                comp = "server",
                backend = self.inner.backend.name(),
                error = %e,
                "backend failed to start"
            );
            self.set_lifecycle(LifecycleState::Failed);
            return Err(StartupError::Backend(e));
        }

        self.start_workers();

        let filter = ActivationFilter::from_config(&self.inner.config);
        let active = match self.inner.registry.initialize(self, &filter) {
            Ok(active) => active,
            Err(e) => {
                tracing::error!(comp = "server", error = %e, "handler initialization failed");
                self.abort_start().await;
                return Err(e);
            }
        };
        let handler_count = active.len();
        // Only start sets this, and start runs once.
        let _ = self.inner.active.set(active);

        let routes = self.freeze_routes();
        let router = self.build_router(routes);
        self.serve(router).await;

        self.set_lifecycle(LifecycleState::Running);

        tracing::info!(
            comp = "server",
            port = self.inner.config.port,
            state = "started",
            version = %self.inner.config.version,
            handlers = handler_count,
            "server listening on {}",
            self.inner.config.port
        );
        Ok(())
    }

    /// Stop the server, returning only after every tracked task has exited.
    ///
    /// A stop issued while `start` is running waits for it to finish first.
    /// A backend stop error does not interrupt the shutdown; it is returned
    /// once everything else has stopped.
    pub async fn stop(&self) -> Result<(), ShutdownError> {
        let _transition = self.inner.transition.lock().await;
        let previous = {
            let mut state = self.lock_state();
            let previous = state.lifecycle;
            match previous {
                LifecycleState::Created => {
                    state.lifecycle = LifecycleState::Stopped;
                    state.stopped = true;
                }
                LifecycleState::Starting | LifecycleState::Running => {
                    state.lifecycle = LifecycleState::Stopping;
                }
                LifecycleState::Stopping | LifecycleState::Stopped | LifecycleState::Failed => {}
            }
            previous
        };

        match previous {
            LifecycleState::Created => {
                self.inner.shutdown.cancel();
                self.inner.tasks.close();
                return Ok(());
            }
            LifecycleState::Stopping | LifecycleState::Stopped | LifecycleState::Failed => {
                return Ok(());
            }
            // Starting is only seen here when a start future was dropped midway.
            LifecycleState::Starting | LifecycleState::Running => {}
        }

        tracing::info!(comp = "server", state = "stopping", "stopping server");

        let backend_result = self.inner.backend.stop().await;
        if let Err(e) = &backend_result {
            tracing::error!(comp = "server", error = %e, "backend failed to stop");
        }

        self.lock_state().stopped = true;
        // Broadcasts to the listener and every worker; cancelling is idempotent.
        self.inner.shutdown.cancel();

        self.inner.tasks.close();
        let grace = self.inner.config.shutdown_grace;
        if tokio::time::timeout(grace, self.inner.tasks.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                comp = "server",
                ?grace,
                remaining = self.inner.tasks.len(),
                "shutdown grace period elapsed, dropping in-flight requests"
            );
            self.inner.hard_stop.cancel();
            self.inner.tasks.wait().await;
        }

        self.set_lifecycle(LifecycleState::Stopped);
        tracing::info!(comp = "server", state = "stopped", "server stopped");

        backend_result.map_err(ShutdownError::Backend)
    }

    fn lock_state(&self) -> MutexGuard<'_, ServerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_lifecycle(&self, lifecycle: LifecycleState) {
        self.lock_state().lifecycle = lifecycle;
    }

    fn start_workers(&self) {
        let mut workers: Vec<Box<dyn BackgroundWorker>> = vec![Box::new(SpoolFlusher::new(
            Arc::clone(&self.inner.spool),
            Arc::clone(&self.inner.backend),
        ))];
        workers.append(&mut self.lock_state().workers);

        for worker in workers {
            let name = worker.name().to_string();
            let shutdown = self.inner.shutdown.clone();
            tracing::debug!(comp = "server", worker = %name, "starting worker");
            self.inner.tasks.spawn(async move {
                worker.run(shutdown).await;
                tracing::debug!(comp = "server", worker = %name, "worker exited");
            });
        }
    }

    /// Undo a partial start: drain the workers and stop the backend.
    async fn abort_start(&self) {
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        if let Err(e) = self.inner.backend.stop().await {
            tracing::warn!(comp = "server", error = %e, "backend failed to stop after aborted start");
        }
        let mut state = self.lock_state();
        state.stopped = true;
        state.lifecycle = LifecycleState::Failed;
    }

    fn freeze_routes(&self) -> RouteTable {
        let mut state = self.lock_state();
        let routes = state.routes.take().unwrap_or_default();
        state.route_descriptions = routes.descriptions();
        routes
    }

    fn build_router(&self, routes: RouteTable) -> Router {
        let config = &self.inner.config;
        let gateway: Arc<dyn Gateway> = Arc::new(self.clone());

        Router::new()
            .route("/", get(index))
            .with_state(self.clone())
            .merge(routes.into_router(gateway))
            .layer(TimeoutLayer::new(config.write_timeout))
            .layer(RequestBodyTimeoutLayer::new(config.read_timeout))
            .layer(TraceLayer::new_for_http())
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
    }

    /// Bind the listener and spawn the tracked accept loop.
    async fn serve(&self, router: Router) {
        let addr = self.inner.config.addr();
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::warn!(
                    comp = "server",
                    %addr,
                    error = %e,
                    "failed to bind listener, running without HTTP"
                );
                return;
            }
        };
        self.lock_state().local_addr = listener.local_addr().ok();

        let server = self.clone();
        self.inner.tasks.spawn(async move {
            let shutdown = server.inner.shutdown.clone();
            loop {
                let (stream, remote) = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!(comp = "server", error = %e, "failed to accept connection");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    },
                };
                server.spawn_connection(stream, remote, router.clone());
            }
            tracing::debug!(comp = "server", state = "stopping", "listener closed");
        });
    }

    /// Serve one connection on the tracker. On shutdown the connection
    /// finishes its in-flight requests; on hard stop it is dropped.
    fn spawn_connection(&self, stream: TcpStream, remote: SocketAddr, router: Router) {
        let shutdown = self.inner.shutdown.clone();
        let hard_stop = self.inner.hard_stop.clone();
        let executor = TrackedExecutor {
            tasks: self.inner.tasks.clone(),
            hard_stop: hard_stop.clone(),
        };

        self.inner.tasks.spawn(async move {
            let builder = auto::Builder::new(executor);
            let conn = builder.serve_connection(TokioIo::new(stream), TowerToHyperService::new(router));
            tokio::pin!(conn);

            let result = tokio::select! {
                result = conn.as_mut() => result,
                _ = shutdown.cancelled() => {
                    conn.as_mut().graceful_shutdown();
                    tokio::select! {
                        result = conn.as_mut() => result,
                        _ = hard_stop.cancelled() => {
                            tracing::debug!(comp = "server", %remote, "connection dropped at hard stop");
                            return;
                        }
                    }
                }
            };
            if let Err(e) = result {
                tracing::debug!(comp = "server", %remote, error = %e, "connection error");
            }
        });
    }
}

/// Runs HTTP/2 streams on the server's tracker so `stop` waits for them.
#[derive(Clone)]
struct TrackedExecutor {
    tasks: TaskTracker,
    hard_stop: CancellationToken,
}

impl<F> hyper::rt::Executor<F> for TrackedExecutor
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn execute(&self, fut: F) {
        let hard_stop = self.hard_stop.clone();
        self.tasks.spawn(async move {
            tokio::select! {
                _ = fut => {}
                _ = hard_stop.cancelled() => {}
            }
        });
    }
}

#[async_trait]
impl Gateway for Server {
    fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    fn add_channel_route(
        &self,
        handler: &dyn ChannelHandler,
        method: Method,
        action: &str,
        func: ActionFn,
    ) -> Result<(), RouteError> {
        let mut state = self.lock_state();
        let table = state.routes.as_mut().ok_or(RouteError::RoutesFrozen)?;
        let route = table.add(handler, method, action, func)?;
        tracing::debug!(
            comp = "server",
            method = %route.method,
            path = %route.path,
            "channel route added"
        );
        Ok(())
    }

    async fn get_channel(
        &self,
        channel_type: &ChannelType,
        uuid: &ChannelUuid,
    ) -> Result<Channel, BackendError> {
        self.inner.backend.get_channel(channel_type, uuid).await
    }

    async fn write_msg(&self, msg: Msg) -> Result<(), BackendError> {
        let result = self.inner.backend.write_msg(&msg).await;
        match result {
            Err(e) if e.is_transient() => {
                tracing::warn!(comp = "server", msg_uuid = %msg.uuid, error = %e, "spooling msg");
                self.inner.spool.push(SpooledWrite::Msg(msg)).await;
                Ok(())
            }
            other => other,
        }
    }

    async fn write_msg_status(&self, status: MsgStatusUpdate) -> Result<(), BackendError> {
        let result = self.inner.backend.write_msg_status(&status).await;
        match result {
            Err(e) if e.is_transient() => {
                tracing::warn!(comp = "server", status = %status.status, error = %e, "spooling status");
                self.inner.spool.push(SpooledWrite::Status(status)).await;
                Ok(())
            }
            other => other,
        }
    }
}

async fn index(State(server): State<Server>) -> Html<String> {
    let health = server.inner.backend.health().await;
    let routes = server.route_descriptions();

    let mut page = String::from("<title>switchyard</title><body><pre>\n");
    page.push_str(SPLASH);
    page.push_str(&escape_html(&server.inner.config.version));
    page.push_str("\n\n");
    page.push_str(&escape_html(&health));
    page.push_str("\n\n");
    page.push_str(&escape_html(&routes.join("\n")));
    page.push_str("</pre></body>");
    Html(page)
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
