//! Local cache boundary and backend selection.

use async_trait::async_trait;

use crate::{
    error::{Error, Result},
    event::Event,
    filter::Filter,
    storage::Store,
};

/// Narrow interface the query and write paths use to reach the local cache.
///
/// `query` returns a finite result and `save` must be idempotent by event id.
#[async_trait]
pub trait LocalCache: Send + Sync + 'static {
    async fn init(&self) -> Result<()>;
    async fn close(&self) {}
    async fn query(&self, filter: &Filter) -> Result<Vec<Event>>;
    async fn save(&self, event: &Event) -> Result<()>;
}

/// Cache selected by configuration.
#[derive(Clone)]
pub enum CacheBackend {
    /// File-backed store rooted at `LOCAL_CACHE_PATH`.
    File(Store),
    /// `DISABLE_LOCAL_CACHE=1`: queries are empty and saves are dropped.
    Disabled,
}

#[async_trait]
impl LocalCache for CacheBackend {
    async fn init(&self) -> Result<()> {
        match self {
            CacheBackend::File(store) => {
                let store = store.clone();
                run_blocking(move || store.init()).await
            }
            CacheBackend::Disabled => Ok(()),
        }
    }

    async fn query(&self, filter: &Filter) -> Result<Vec<Event>> {
        match self {
            CacheBackend::File(store) => {
                let store = store.clone();
                let filter = filter.clone();
                run_blocking(move || store.query(&filter)).await
            }
            CacheBackend::Disabled => Ok(vec![]),
        }
    }

    async fn save(&self, event: &Event) -> Result<()> {
        match self {
            CacheBackend::File(store) => {
                let store = store.clone();
                let event = event.clone();
                run_blocking(move || store.save(&event)).await
            }
            CacheBackend::Disabled => Ok(()),
        }
    }
}

/// Run filesystem work off the async workers.
async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Cache(format!("cache task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::tests::sample_event;
    use tempfile::TempDir;

    #[tokio::test]
    async fn file_backend_round_trips_through_blocking_pool() {
        let dir = TempDir::new().unwrap();
        let cache = CacheBackend::File(Store::new(dir.path().to_path_buf()));
        cache.init().await.unwrap();
        let ev = sample_event('a', 'b', 1, 10);
        cache.save(&ev).await.unwrap();
        let filter = Filter {
            kinds: Some(vec![1]),
            ..Default::default()
        };
        assert_eq!(cache.query(&filter).await.unwrap(), vec![ev]);
    }

    #[tokio::test]
    async fn disabled_backend_is_empty_and_accepts_saves() {
        let cache = CacheBackend::Disabled;
        cache.init().await.unwrap();
        cache.save(&sample_event('a', 'b', 1, 10)).await.unwrap();
        assert!(cache.query(&Filter::default()).await.unwrap().is_empty());
    }
}
