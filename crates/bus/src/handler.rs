//! Handler trait for inbound envelopes.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use alicia_protocol::Envelope;

use crate::service::ServiceHandle;

/// Context provided to every handler invocation.
#[derive(Clone)]
pub struct HandlerContext {
    /// Narrow publish/request capability; handlers never own the client.
    pub handle: ServiceHandle,
    /// Cancelled when the service begins stopping.
    pub cancel: CancellationToken,
}

/// An inbound-message handler registered under a topic filter.
///
/// Handlers run on spawned tasks, never on the MQTT I/O loop; anything
/// CPU-heavy still belongs on `spawn_blocking`. A returned error is
/// logged and counted, and the service stays `Ready`. Panics are caught
/// at the dispatch boundary.
#[async_trait]
pub trait BusHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        ctx: HandlerContext,
        topic: &str,
        envelope: Envelope,
    ) -> anyhow::Result<()>;
}

/// Adapt an async closure into a [`BusHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn BusHandler>
where
    F: Fn(HandlerContext, String, Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    struct FnHandler<F>(F);

    #[async_trait]
    impl<F, Fut> BusHandler for FnHandler<F>
    where
        F: Fn(HandlerContext, String, Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        async fn handle(
            &self,
            ctx: HandlerContext,
            topic: &str,
            envelope: Envelope,
        ) -> anyhow::Result<()> {
            (self.0)(ctx, topic.to_owned(), envelope).await
        }
    }

    Arc::new(FnHandler(f))
}
