//! In-memory cache and scripted upstream used by unit tests.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    task::Poll,
};

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::{
    cache::LocalCache,
    error::{Error, Result},
    event::Event,
    filter::Filter,
    upstream::{EventStream, Publisher, UpstreamSource},
};

#[derive(Default)]
pub(crate) struct MemoryCache {
    events: Mutex<BTreeMap<String, Event>>,
    fail_queries: bool,
    saves: AtomicUsize,
}

impl MemoryCache {
    pub(crate) fn with_events(events: Vec<Event>) -> Self {
        let cache = Self::default();
        {
            let mut map = cache.events.lock().unwrap();
            for ev in events {
                map.insert(ev.id.clone(), ev);
            }
        }
        cache
    }

    pub(crate) fn failing() -> Self {
        Self {
            fail_queries: true,
            ..Default::default()
        }
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.events.lock().unwrap().contains_key(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub(crate) fn save_calls(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocalCache for MemoryCache {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn query(&self, filter: &Filter) -> Result<Vec<Event>> {
        if self.fail_queries {
            return Err(Error::Cache("query failed".into()));
        }
        let map = self.events.lock().unwrap();
        Ok(map.values().filter(|ev| filter.matches(ev)).cloned().collect())
    }

    async fn save(&self, event: &Event) -> Result<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        event.validate_shape()?;
        self.events
            .lock()
            .unwrap()
            .entry(event.id.clone())
            .or_insert_with(|| event.clone());
        Ok(())
    }
}

/// Behaviour of a read source.
#[derive(Clone)]
pub(crate) enum Source {
    /// Yield these events, then end-of-stored-events.
    Stored(Vec<Event>),
    /// Never signal end-of-stored-events.
    Hang,
    /// Fault while the stream is being consumed.
    Panic,
}

/// Behaviour of a write destination.
#[derive(Clone, Copy)]
pub(crate) enum Dest {
    Accept,
    RefuseConnect,
    RejectPublish,
}

#[derive(Default)]
pub(crate) struct ScriptedUpstream {
    sources: HashMap<String, Source>,
    dests: HashMap<String, Dest>,
    pub(crate) connects: Mutex<Vec<String>>,
    pub(crate) published: Arc<Mutex<Vec<String>>>,
    pub(crate) closed: Arc<AtomicUsize>,
    pub(crate) cancelled: Arc<AtomicBool>,
}

impl ScriptedUpstream {
    pub(crate) fn source(mut self, url: &str, source: Source) -> Self {
        self.sources.insert(url.to_string(), source);
        self
    }

    pub(crate) fn dest(mut self, url: &str, dest: Dest) -> Self {
        self.dests.insert(url.to_string(), dest);
        self
    }
}

#[async_trait]
impl UpstreamSource for ScriptedUpstream {
    type Connection = ScriptedConnection;

    async fn ensure_connected(&self, url: &str) -> Result<()> {
        match self.dests.get(url) {
            Some(Dest::RefuseConnect) => Err(Error::upstream(url, "connection refused")),
            _ => Ok(()),
        }
    }

    fn subscribe(&self, urls: &[String], _filter: &Filter, cancel: CancellationToken) -> EventStream {
        let streams: Vec<EventStream> = urls
            .iter()
            .map(|url| match self.sources.get(url).cloned() {
                Some(Source::Stored(events)) => stream::iter(events).boxed(),
                None => stream::empty().boxed(),
                Some(Source::Hang) => {
                    let cancel = cancel.clone();
                    let flag = self.cancelled.clone();
                    tokio::spawn(async move {
                        cancel.cancelled().await;
                        flag.store(true, Ordering::SeqCst);
                    });
                    stream::pending().boxed()
                }
                Some(Source::Panic) => {
                    stream::poll_fn(|_| -> Poll<Option<Event>> { panic!("index out of range") })
                        .boxed()
                }
            })
            .collect();
        stream::select_all(streams).boxed()
    }

    async fn connect(&self, url: &str) -> Result<ScriptedConnection> {
        self.connects.lock().unwrap().push(url.to_string());
        let dest = self.dests.get(url).copied().unwrap_or(Dest::Accept);
        if matches!(dest, Dest::RefuseConnect) {
            return Err(Error::upstream(url, "connection refused"));
        }
        Ok(ScriptedConnection {
            url: url.to_string(),
            reject: matches!(dest, Dest::RejectPublish),
            published: self.published.clone(),
            closed: self.closed.clone(),
        })
    }
}

pub(crate) struct ScriptedConnection {
    url: String,
    reject: bool,
    published: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl Publisher for ScriptedConnection {
    async fn publish(&mut self, _event: &Event) -> Result<()> {
        self.published.lock().unwrap().push(self.url.clone());
        if self.reject {
            return Err(Error::upstream(&self.url, "rejected: blocked"));
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}
