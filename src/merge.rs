//! Merge local cache results with upstream relay results for one query.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use futures_util::StreamExt;
use tokio::{
    sync::mpsc,
    task::{JoinError, JoinHandle},
    time::Instant,
};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

use crate::{
    cache::LocalCache,
    dedup::SeenIds,
    error::Result,
    event::Event,
    filter::Filter,
    telemetry::{PRODUCER_PANICS, QUERIES_CLOSED, QUERIES_STARTED, QUERY_EVENTS, WRITE_BACKS},
    upstream::UpstreamSource,
};

const OUTPUT_CAPACITY: usize = 256;

/// Events each producer actually handed to the caller.
#[derive(Default)]
struct Emitted {
    local: AtomicUsize,
    upstream: AtomicUsize,
}

/// Runs queries against the local cache and the read relays at once.
///
/// Every query gets its own [`SeenIds`], cancellation token and deadline;
/// nothing is shared between in-flight queries apart from the backends.
pub struct QueryMerger<C, U> {
    cache: Arc<C>,
    upstream: Arc<U>,
    read_relays: Arc<[String]>,
    span: Span,
}

impl<C, U> Clone for QueryMerger<C, U> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            upstream: self.upstream.clone(),
            read_relays: self.read_relays.clone(),
            span: self.span.clone(),
        }
    }
}

impl<C: LocalCache, U: UpstreamSource> QueryMerger<C, U> {
    pub fn new(cache: Arc<C>, upstream: Arc<U>, read_relays: Vec<String>, span: Span) -> Self {
        Self {
            cache,
            upstream,
            read_relays: read_relays.into(),
            span,
        }
    }

    /// Start a query and return its result stream.
    ///
    /// The stream yields each event id at most once, in whatever order the
    /// two producers find them, and ends no later than `timeout` from now.
    pub fn query(&self, filter: Filter, timeout: Duration) -> ReceiverStream<Event> {
        let token = format!("{:08x}", rand::random::<u32>());
        let span = tracing::info_span!(parent: &self.span, "query", query = %token);
        let deadline = Instant::now() + timeout;
        let (tx, rx) = mpsc::channel(OUTPUT_CAPACITY);
        let seen = Arc::new(SeenIds::with_capacity(filter.limit.unwrap_or(64).min(1024)));
        let emitted = Arc::new(Emitted::default());
        let cancel = CancellationToken::new();
        let filter = Arc::new(filter);
        metrics::increment_counter!(QUERIES_STARTED);

        let local = tokio::spawn(
            local_producer(
                self.cache.clone(),
                filter.clone(),
                seen.clone(),
                tx.clone(),
                emitted.clone(),
            )
            .instrument(span.clone()),
        );

        let (save_tx, save_rx) = mpsc::unbounded_channel();
        let writeback = tokio::spawn(write_back(self.cache.clone(), save_rx).instrument(span.clone()));

        let upstream = tokio::spawn(
            upstream_producer(
                self.upstream.clone(),
                self.read_relays.clone(),
                filter.clone(),
                seen.clone(),
                tx.clone(),
                save_tx,
                emitted.clone(),
                cancel.clone(),
            )
            .instrument(span.clone()),
        );

        tracing::debug!(parent: &span, filter = %serde_json::Value::Object(filter.to_json()), "query started");
        tokio::spawn(
            coordinate(local, upstream, writeback, tx, emitted, cancel, deadline).instrument(span),
        );

        ReceiverStream::new(rx)
    }
}

async fn local_producer<C: LocalCache>(
    cache: Arc<C>,
    filter: Arc<Filter>,
    seen: Arc<SeenIds>,
    tx: mpsc::Sender<Event>,
    emitted: Arc<Emitted>,
) -> Result<()> {
    let events = cache.query(&filter).await?;
    for ev in events {
        if !seen.first_sighting(&ev.id) {
            continue;
        }
        if tx.send(ev).await.is_err() {
            break;
        }
        emitted.local.fetch_add(1, Ordering::Relaxed);
        metrics::increment_counter!(QUERY_EVENTS, "source" => "local");
    }
    Ok(())
}

async fn upstream_producer<U: UpstreamSource>(
    upstream: Arc<U>,
    urls: Arc<[String]>,
    filter: Arc<Filter>,
    seen: Arc<SeenIds>,
    tx: mpsc::Sender<Event>,
    save_tx: mpsc::UnboundedSender<Event>,
    emitted: Arc<Emitted>,
    cancel: CancellationToken,
) -> Result<()> {
    if urls.is_empty() {
        return Ok(());
    }
    let mut stream = upstream.subscribe(&urls, &filter, cancel);
    while let Some(ev) = stream.next().await {
        if let Err(e) = ev.validate_shape() {
            tracing::debug!(error = %e, "dropping upstream event");
            continue;
        }
        if !seen.first_sighting(&ev.id) {
            continue;
        }
        // the worker outlives this task, so a closed channel only means it panicked
        let _ = save_tx.send(ev.clone());
        if tx.send(ev).await.is_err() {
            break;
        }
        emitted.upstream.fetch_add(1, Ordering::Relaxed);
        metrics::increment_counter!(QUERY_EVENTS, "source" => "upstream");
    }
    Ok(())
}

async fn write_back<C: LocalCache>(cache: Arc<C>, mut rx: mpsc::UnboundedReceiver<Event>) {
    while let Some(ev) = rx.recv().await {
        match cache.save(&ev).await {
            Ok(()) => metrics::increment_counter!(WRITE_BACKS, "result" => "ok"),
            Err(e) => {
                metrics::increment_counter!(WRITE_BACKS, "result" => "failed");
                tracing::warn!(id = %ev.id, error = %e, "write-back failed");
            }
        }
    }
}

async fn join<T>(handle: &mut Option<JoinHandle<T>>) -> std::result::Result<T, JoinError> {
    match handle {
        Some(h) => h.await,
        None => std::future::pending().await,
    }
}

fn report(producer: &'static str, outcome: std::result::Result<Result<()>, JoinError>) {
    match outcome {
        Ok(Ok(())) => tracing::debug!(producer, "producer finished"),
        Ok(Err(e)) => tracing::warn!(producer, error = %e, "producer failed"),
        Err(e) if e.is_panic() => {
            metrics::increment_counter!(PRODUCER_PANICS, "producer" => producer);
            tracing::error!(producer, "panic recovered");
        }
        Err(_) => tracing::info!(producer, "producer abandoned at deadline"),
    }
}

/// Sole owner of closing the output: the last sender is dropped here once
/// both producers are done or the deadline has passed.
async fn coordinate(
    local: JoinHandle<Result<()>>,
    upstream: JoinHandle<Result<()>>,
    writeback: JoinHandle<()>,
    tx: mpsc::Sender<Event>,
    emitted: Arc<Emitted>,
    cancel: CancellationToken,
    deadline: Instant,
) {
    let started = Instant::now();
    let mut local = Some(local);
    let mut upstream = Some(upstream);
    let expiry = tokio::time::sleep_until(deadline);
    tokio::pin!(expiry);
    let mut expired = false;

    while local.is_some() || upstream.is_some() {
        tokio::select! {
            outcome = join(&mut local), if local.is_some() => {
                local = None;
                report("local", outcome);
            }
            outcome = join(&mut upstream), if upstream.is_some() => {
                upstream = None;
                report("upstream", outcome);
            }
            _ = &mut expiry => {
                expired = true;
                break;
            }
        }
    }

    cancel.cancel();
    for (producer, handle) in [("local", local), ("upstream", upstream)] {
        if let Some(handle) = handle {
            handle.abort();
            report(producer, handle.await);
        }
    }

    if !expired {
        match tokio::time::timeout_at(deadline, writeback).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_panic() => tracing::error!("write-back panic recovered"),
            Ok(Err(_)) => {}
            Err(_) => tracing::info!("write-back still running at deadline"),
        }
    }

    let outcome = if expired { "expired" } else { "complete" };
    metrics::increment_counter!(QUERIES_CLOSED, "outcome" => outcome);
    drop(tx);
    tracing::info!(
        local = emitted.local.load(Ordering::Relaxed),
        upstream = emitted.upstream.load(Ordering::Relaxed),
        expired,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "query closed"
    );
}
