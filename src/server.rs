//! HTTP endpoints for health checks, relay info, metrics and the recent feed.

use anyhow::Result;
use axum::{
    extract::{Query as AxumQuery, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, future::Future, net::SocketAddr, sync::Arc};
use tracing::Span;

use crate::{
    cache::LocalCache, config::RelayInfo, event::Event, filter::Filter, identity::decode_npub,
    relay::ProxyRelay, telemetry,
};

const RECENT_KINDS: [u32; 3] = [1, 6, 7];
const RECENT_LIMIT: usize = 25;

struct HttpState {
    relay: Arc<ProxyRelay>,
    info: RelayInfo,
    span: Span,
}

/// Response body for the `/healthz` endpoint.
#[derive(Serialize, Deserialize)]
struct Health {
    /// Always "ok" when the server is running.
    status: String,
}

/// Start an HTTP server exposing `/healthz`, `/metrics`, `/recent` and relay info.
pub async fn serve_http(
    addr: SocketAddr,
    relay: Arc<ProxyRelay>,
    info: RelayInfo,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    telemetry::install();
    let span = tracing::info_span!("http", %addr);
    tracing::info!(parent: &span, service_url = %info.url, "listening");
    let state = Arc::new(HttpState { relay, info, span });
    axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

fn router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/", get(relay_info))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_text))
        .route("/recent", get(recent))
        .with_state(state)
}

/// Health check endpoint.
async fn healthz() -> Json<Health> {
    Json(Health {
        status: "ok".to_string(),
    })
}

/// Prometheus text exposition.
async fn metrics_text() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        telemetry::render(),
    )
}

/// NIP-11 relay information document.
#[derive(Serialize, Deserialize)]
struct InfoDocument {
    name: String,
    description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pubkey: Option<String>,
    contact: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    icon: String,
    supported_nips: Vec<u32>,
    software: String,
    version: String,
    limitation: Limitation,
}

#[derive(Serialize, Deserialize)]
struct Limitation {
    auth_required: bool,
    restricted_writes: bool,
}

async fn relay_info(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let pubkey = state.info.npub.as_deref().and_then(|npub| match decode_npub(npub) {
        Ok(hex) => Some(hex),
        Err(e) => {
            tracing::warn!(parent: &state.span, %npub, error = %e, "RELAY_NPUB is not a valid npub");
            None
        }
    });
    (
        [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
        Json(InfoDocument {
            name: state.info.name.clone(),
            description: state.info.description.clone(),
            pubkey,
            contact: state.info.contact.clone(),
            icon: state.info.icon.clone(),
            supported_nips: vec![1, 11, 42],
            software: env!("CARGO_PKG_NAME").into(),
            version: env!("CARGO_PKG_VERSION").into(),
            limitation: Limitation {
                auth_required: state.relay.auth_required(),
                restricted_writes: state.relay.restricts_writes(),
            },
        }),
    )
}

/// Paging window for `/recent`. Unparseable values are ignored.
#[derive(Deserialize)]
struct RecentParams {
    since: Option<String>,
    until: Option<String>,
}

/// One line of the `/recent` feed.
#[derive(Serialize, Deserialize)]
struct FeedItem {
    event: Event,
    kind_name: String,
    author_name: String,
}

fn kind_name(kind: u32) -> String {
    match kind {
        1 => "posted".into(),
        6 => "reposted".into(),
        7 => "reacted".into(),
        9734 => "zapped".into(),
        other => format!("kind {other}"),
    }
}

fn short_pubkey(pubkey: &str) -> String {
    let head = pubkey.get(..8).unwrap_or(pubkey);
    let tail = pubkey.len().checked_sub(8).and_then(|i| pubkey.get(i..)).unwrap_or("");
    format!("{head}:{tail}")
}

/// `name` from the author's newest cached profile, if any.
async fn profile_name(cache: &impl LocalCache, pubkey: &str) -> Option<String> {
    let filter = Filter {
        authors: Some(vec![pubkey.to_string()]),
        kinds: Some(vec![0]),
        limit: Some(1),
        ..Default::default()
    };
    let profile = cache.query(&filter).await.ok()?.into_iter().next()?;
    let meta: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&profile.content).ok()?;
    meta.get("name")?.as_str().map(str::to_string)
}

/// Newest notes, reposts and reactions held by the local cache, as NDJSON.
async fn recent(
    State(state): State<Arc<HttpState>>,
    AxumQuery(params): AxumQuery<RecentParams>,
) -> Response {
    let filter = Filter {
        kinds: Some(RECENT_KINDS.to_vec()),
        since: params.since.and_then(|v| v.parse().ok()),
        until: params.until.and_then(|v| v.parse().ok()),
        limit: Some(RECENT_LIMIT),
        ..Default::default()
    };
    let cache = state.relay.cache();
    let events = match cache.query(&filter).await {
        Ok(events) => events,
        Err(e) => {
            tracing::error!(parent: &state.span, error = %e, "recent feed query failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };

    let mut names: HashMap<String, String> = HashMap::new();
    let mut lines = Vec::with_capacity(events.len());
    for event in events {
        let author_name = match names.get(&event.pubkey) {
            Some(name) => name.clone(),
            None => {
                let name = profile_name(cache, &event.pubkey)
                    .await
                    .unwrap_or_else(|| short_pubkey(&event.pubkey));
                names.insert(event.pubkey.clone(), name.clone());
                name
            }
        };
        let item = FeedItem {
            kind_name: kind_name(event.kind),
            author_name,
            event,
        };
        match serde_json::to_string(&item) {
            Ok(line) => lines.push(line),
            Err(e) => tracing::warn!(parent: &state.span, error = %e, "encode feed item"),
        }
    }
    tracing::debug!(parent: &state.span, events = lines.len(), "GET /recent");
    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        lines.join("\n"),
    )
        .into_response()
}
