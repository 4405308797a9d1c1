//! Long-lived background workers started with the server.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// A task that runs from `Server::start` until shutdown is signalled.
///
/// `run` must return once `shutdown` is cancelled and must not perform any
/// further side effects after returning. The server awaits every worker
/// before `Server::stop` returns.
#[async_trait]
pub trait BackgroundWorker: Send + 'static {
    fn name(&self) -> &str;

    async fn run(self: Box<Self>, shutdown: CancellationToken);
}
