//! Boundary operations the protocol layer calls: accept a write, accept a
//! read, run a merged query, save an accepted event.

use std::{sync::Arc, time::Duration};

use tokio_stream::wrappers::ReceiverStream;
use tracing::Span;

use crate::{
    access::{Access, AccessController},
    cache::{CacheBackend, LocalCache},
    error::Result,
    event::Event,
    fanout::WriteFanout,
    filter::Filter,
    merge::QueryMerger,
    pool::RelayPool,
    upstream::UpstreamSource,
};

/// The relay as wired up by `serve`: configured cache, websocket upstreams.
pub type ProxyRelay = Relay<CacheBackend, RelayPool>;

/// Knobs shared by the gate, the merger and the fanout.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub allowed: Vec<String>,
    pub read_relays: Vec<String>,
    pub write_relays: Vec<String>,
    pub query_timeout: Duration,
    pub publish_timeout: Duration,
    pub auth_required: bool,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            allowed: vec![],
            read_relays: vec![],
            write_relays: vec![],
            query_timeout: Duration::from_secs(120),
            publish_timeout: Duration::from_secs(10),
            auth_required: true,
        }
    }
}

pub struct Relay<C, U> {
    access: AccessController,
    merger: QueryMerger<C, U>,
    fanout: WriteFanout<C, U>,
    cache: Arc<C>,
    upstream: Arc<U>,
    read_relays: Vec<String>,
    query_timeout: Duration,
    auth_required: bool,
    span: Span,
}

impl<C: LocalCache, U: UpstreamSource> Relay<C, U> {
    pub fn new(cache: C, upstream: U, options: RelayOptions, span: Span) -> Self {
        let cache = Arc::new(cache);
        let upstream = Arc::new(upstream);
        let access = AccessController::new(
            &options.allowed,
            tracing::info_span!(parent: &span, "access"),
        );
        let merger = QueryMerger::new(
            cache.clone(),
            upstream.clone(),
            options.read_relays.clone(),
            tracing::info_span!(parent: &span, "merge"),
        );
        let fanout = WriteFanout::new(
            cache.clone(),
            upstream.clone(),
            options.write_relays,
            options.publish_timeout,
            tracing::info_span!(parent: &span, "fanout"),
        );
        Self {
            access,
            merger,
            fanout,
            cache,
            upstream,
            read_relays: options.read_relays,
            query_timeout: options.query_timeout,
            auth_required: options.auth_required,
            span,
        }
    }

    /// Prepare the cache and warm up upstream links. Only a cache failure is
    /// fatal; unreachable relays are logged and retried per operation.
    pub async fn init(&self) -> Result<()> {
        self.cache.init().await?;
        let mut urls: Vec<&String> = self.read_relays.iter().chain(self.fanout.destinations()).collect();
        urls.sort();
        urls.dedup();
        for url in urls {
            if let Err(e) = self.upstream.ensure_connected(url).await {
                tracing::warn!(parent: &self.span, %url, error = %e, "upstream not reachable");
            }
        }
        tracing::info!(
            parent: &self.span,
            read_relays = self.read_relays.len(),
            write_relays = self.fanout.destinations().len(),
            "relay ready"
        );
        Ok(())
    }

    pub async fn close(&self) {
        self.cache.close().await;
    }

    pub fn accept_write(&self, event: &Event) -> Access {
        self.access.can_write(&event.pubkey)
    }

    /// `authed` is the identity the client proved, if it proved one.
    pub fn accept_read(&self, authed: Option<&str>) -> Access {
        self.access.can_read(authed, self.auth_required)
    }

    pub fn query(&self, filter: Filter) -> ReceiverStream<Event> {
        self.merger.query(filter, self.query_timeout)
    }

    /// Like [`Relay::query`] with a caller-chosen deadline.
    pub fn query_with_timeout(&self, filter: Filter, timeout: Duration) -> ReceiverStream<Event> {
        self.merger.query(filter, timeout)
    }

    pub async fn save(&self, event: &Event) {
        self.fanout.save(event).await
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    pub fn auth_required(&self) -> bool {
        self.auth_required
    }

    pub fn restricts_writes(&self) -> bool {
        self.access.is_restricted()
    }
}
