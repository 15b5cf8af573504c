//! Best-effort broadcast of accepted events to the write relays.

use std::{sync::Arc, time::Duration};

use futures_util::future::join_all;
use tracing::Span;

use crate::{
    cache::LocalCache,
    error::{Error, Result},
    event::Event,
    telemetry::PUBLISHES,
    upstream::{Publisher, UpstreamSource},
};

/// Publishes to every write relay, then commits to the local cache.
///
/// Destination failures are logged and never reported to the caller; the
/// local commit happens whatever the destinations did.
pub struct WriteFanout<C, U> {
    cache: Arc<C>,
    upstream: Arc<U>,
    destinations: Vec<String>,
    publish_timeout: Duration,
    span: Span,
}

impl<C: LocalCache, U: UpstreamSource> WriteFanout<C, U> {
    pub fn new(
        cache: Arc<C>,
        upstream: Arc<U>,
        destinations: Vec<String>,
        publish_timeout: Duration,
        span: Span,
    ) -> Self {
        Self {
            cache,
            upstream,
            destinations,
            publish_timeout,
            span,
        }
    }

    pub fn destinations(&self) -> &[String] {
        &self.destinations
    }

    pub async fn save(&self, event: &Event) {
        let attempts = self.destinations.iter().map(|url| self.deliver(url, event));
        let delivered = join_all(attempts).await.into_iter().filter(|ok| *ok).count();
        tracing::info!(
            parent: &self.span,
            id = %event.id,
            delivered,
            destinations = self.destinations.len(),
            "fanout finished"
        );

        if let Err(e) = self.cache.save(event).await {
            tracing::error!(parent: &self.span, id = %event.id, error = %e, "local commit failed");
        }
    }

    async fn deliver(&self, url: &str, event: &Event) -> bool {
        let attempt = tokio::time::timeout(self.publish_timeout, self.publish_once(url, event)).await;
        let outcome = match attempt {
            Ok(res) => res,
            Err(_) => Err(Error::Timeout(self.publish_timeout)),
        };
        match outcome {
            Ok(()) => {
                metrics::increment_counter!(PUBLISHES, "relay" => url.to_string(), "result" => "ok");
                tracing::debug!(parent: &self.span, %url, id = %event.id, "published");
                true
            }
            Err(e) => {
                metrics::increment_counter!(PUBLISHES, "relay" => url.to_string(), "result" => "failed");
                tracing::warn!(parent: &self.span, %url, id = %event.id, error = %e, "publish failed");
                false
            }
        }
    }

    async fn publish_once(&self, url: &str, event: &Event) -> Result<()> {
        let mut conn = self.upstream.connect(url).await?;
        let res = conn.publish(event).await;
        conn.close().await;
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        event::tests::sample_event,
        testing::{Dest, MemoryCache, ScriptedUpstream},
    };
    use std::sync::atomic::Ordering;

    fn fanout(
        upstream: ScriptedUpstream,
        dests: &[&str],
    ) -> (WriteFanout<MemoryCache, ScriptedUpstream>, Arc<MemoryCache>, Arc<ScriptedUpstream>) {
        let cache = Arc::new(MemoryCache::default());
        let upstream = Arc::new(upstream);
        let fanout = WriteFanout::new(
            cache.clone(),
            upstream.clone(),
            dests.iter().map(|d| d.to_string()).collect(),
            Duration::from_secs(2),
            Span::none(),
        );
        (fanout, cache, upstream)
    }

    #[tokio::test]
    async fn every_destination_is_attempted_and_cache_commits() {
        let upstream = ScriptedUpstream::default()
            .dest("wss://ok.example", Dest::Accept)
            .dest("wss://down.example", Dest::RefuseConnect)
            .dest("wss://picky.example", Dest::RejectPublish);
        let (fanout, cache, upstream) = fanout(
            upstream,
            &["wss://ok.example", "wss://down.example", "wss://picky.example"],
        );
        let ev = sample_event('e', 'f', 1, 1);

        fanout.save(&ev).await;

        assert_eq!(upstream.connects.lock().unwrap().len(), 3);
        let mut published = upstream.published.lock().unwrap().clone();
        published.sort();
        assert_eq!(published, vec!["wss://ok.example", "wss://picky.example"]);
        assert_eq!(upstream.closed.load(Ordering::SeqCst), 2);
        assert!(cache.contains(&ev.id));
    }

    #[tokio::test]
    async fn unreachable_destinations_still_commit_locally() {
        let upstream = ScriptedUpstream::default().dest("wss://down.example", Dest::RefuseConnect);
        let (fanout, cache, _) = fanout(upstream, &["wss://down.example"]);
        let ev = sample_event('e', 'f', 1, 1);

        fanout.save(&ev).await;

        assert!(cache.contains(&ev.id));
    }

    #[tokio::test]
    async fn no_destinations_is_a_local_commit() {
        let (fanout, cache, upstream) = fanout(ScriptedUpstream::default(), &[]);
        let ev = sample_event('e', 'f', 1, 1);

        fanout.save(&ev).await;

        assert!(upstream.connects.lock().unwrap().is_empty());
        assert_eq!(cache.save_calls(), 1);
        assert!(cache.contains(&ev.id));
    }

    #[tokio::test]
    async fn saving_twice_keeps_one_copy() {
        let (fanout, cache, _) = fanout(ScriptedUpstream::default(), &[]);
        let ev = sample_event('e', 'f', 1, 1);

        fanout.save(&ev).await;
        fanout.save(&ev).await;

        assert_eq!(cache.len(), 1);
    }
}
