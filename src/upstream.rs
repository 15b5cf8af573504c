//! Upstream relay boundary: subscriptions for reads, connections for writes.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::{error::Result, event::Event, filter::Filter};

/// Events streamed back from a subscription.
pub type EventStream = BoxStream<'static, Event>;

/// An open connection to a write destination.
#[async_trait]
pub trait Publisher: Send {
    /// Send the event and wait for the destination to acknowledge it.
    async fn publish(&mut self, event: &Event) -> Result<()>;
    /// Release the connection. Errors while closing are ignored.
    async fn close(&mut self);
}

/// Pool of upstream relays.
#[async_trait]
pub trait UpstreamSource: Send + Sync + 'static {
    type Connection: Publisher + 'static;

    /// Check that `url` is reachable. Callers treat failures as advisory.
    async fn ensure_connected(&self, url: &str) -> Result<()>;

    /// Subscribe to `filter` on every url. The stream ends once each source
    /// has signalled end-of-stored-events (or failed), or when `cancel`
    /// fires; cancellation releases every connection.
    fn subscribe(&self, urls: &[String], filter: &Filter, cancel: CancellationToken)
        -> EventStream;

    /// Open a connection used to publish to `url`.
    async fn connect(&self, url: &str) -> Result<Self::Connection>;
}
