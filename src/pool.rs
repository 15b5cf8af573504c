//! Websocket pool speaking NIP-01 to upstream relays.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::mpsc,
};
use tokio_socks::tcp::Socks5Stream;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::{
    client_async_tls,
    tungstenite::{client::IntoClientRequest, Message},
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::Span;
use url::Url;

use crate::{
    error::{Error, Result},
    event::Event,
    filter::Filter,
    upstream::{EventStream, Publisher, UpstreamSource},
};

/// Buffered events per subscription before upstream readers wait on the
/// consumer.
const SUBSCRIPTION_BUFFER: usize = 256;

type WsStream = WebSocketStream<MaybeTlsStream<Box<dyn AsyncReadWrite + Unpin + Send>>>;

/// Opens websocket connections to upstream relays, optionally through a
/// SOCKS5 proxy such as Tor.
#[derive(Clone)]
pub struct RelayPool {
    tor_socks: Option<String>,
    span: Span,
}

impl RelayPool {
    pub fn new(tor_socks: Option<String>, span: Span) -> Self {
        Self { tor_socks, span }
    }
}

#[async_trait]
impl UpstreamSource for RelayPool {
    type Connection = Connection;

    async fn ensure_connected(&self, url: &str) -> Result<()> {
        let mut ws = connect_ws(url, self.tor_socks.as_deref()).await?;
        let _ = ws.close(None).await;
        tracing::debug!(parent: &self.span, %url, "upstream reachable");
        Ok(())
    }

    fn subscribe(
        &self,
        urls: &[String],
        filter: &Filter,
        cancel: CancellationToken,
    ) -> EventStream {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let req_filter = Value::Object(filter.to_json());
        for url in urls {
            let url = url.clone();
            let tx = tx.clone();
            let filter = req_filter.clone();
            let cancel = cancel.clone();
            let tor_socks = self.tor_socks.clone();
            let span = self.span.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!(parent: &span, %url, "subscription cancelled");
                    }
                    res = fetch_stored(&url, tor_socks.as_deref(), filter, tx) => {
                        if let Err(e) = res {
                            tracing::warn!(parent: &span, %url, error = %e, "subscription failed");
                        }
                    }
                }
            });
        }
        Box::pin(ReceiverStream::new(rx))
    }

    async fn connect(&self, url: &str) -> Result<Connection> {
        let ws = connect_ws(url, self.tor_socks.as_deref()).await?;
        Ok(Connection {
            url: url.to_string(),
            ws,
        })
    }
}

/// Issue one `REQ` and forward stored events until `EOSE`.
async fn fetch_stored(
    url: &str,
    tor_socks: Option<&str>,
    filter: Value,
    tx: mpsc::Sender<Event>,
) -> Result<()> {
    let mut ws = connect_ws(url, tor_socks).await?;
    let sub_id = format!("proxy-{:08x}", rand::random::<u32>());
    let req = json!(["REQ", sub_id, filter]);
    ws.send(Message::Text(req.to_string())).await?;

    while let Some(msg) = ws.next().await {
        let txt = match msg? {
            Message::Text(txt) => txt,
            Message::Close(_) => break,
            _ => continue,
        };
        let Ok(Value::Array(arr)) = serde_json::from_str::<Value>(&txt) else {
            continue;
        };
        if arr.get(1).and_then(|v| v.as_str()) != Some(sub_id.as_str()) {
            continue;
        }
        match arr.first().and_then(|v| v.as_str()) {
            Some("EVENT") => {
                let Some(ev_val) = arr.get(2) else { continue };
                if let Ok(ev) = serde_json::from_value::<Event>(ev_val.clone()) {
                    if tx.send(ev).await.is_err() {
                        // Consumer went away.
                        break;
                    }
                }
            }
            Some("EOSE") => break,
            Some("CLOSED") => {
                let reason = arr.get(2).and_then(|v| v.as_str()).unwrap_or_default();
                return Err(Error::upstream(url, format!("subscription closed: {reason}")));
            }
            _ => {}
        }
    }

    let close = json!(["CLOSE", sub_id]);
    let _ = ws.send(Message::Text(close.to_string())).await;
    let _ = ws.close(None).await;
    Ok(())
}

/// Connection to a single write destination.
pub struct Connection {
    url: String,
    ws: WsStream,
}

#[async_trait]
impl Publisher for Connection {
    async fn publish(&mut self, event: &Event) -> Result<()> {
        let msg = json!(["EVENT", event]);
        self.ws.send(Message::Text(msg.to_string())).await?;
        while let Some(msg) = self.ws.next().await {
            let txt = match msg? {
                Message::Text(txt) => txt,
                Message::Close(_) => break,
                _ => continue,
            };
            let Ok(Value::Array(arr)) = serde_json::from_str::<Value>(&txt) else {
                continue;
            };
            if arr.first().and_then(|v| v.as_str()) != Some("OK")
                || arr.get(1).and_then(|v| v.as_str()) != Some(event.id.as_str())
            {
                continue;
            }
            let accepted = arr.get(2).and_then(|v| v.as_bool()).unwrap_or(false);
            if accepted {
                return Ok(());
            }
            let reason = arr.get(3).and_then(|v| v.as_str()).unwrap_or_default();
            return Err(Error::upstream(&self.url, format!("rejected: {reason}")));
        }
        Err(Error::upstream(&self.url, "connection closed before OK"))
    }

    async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}

/// Establish a WebSocket connection, optionally via a SOCKS5 proxy.
async fn connect_ws(relay: &str, tor_socks: Option<&str>) -> Result<WsStream> {
    let url = Url::parse(relay).map_err(|e| Error::upstream(relay, e))?;
    let host = url
        .host_str()
        .ok_or_else(|| Error::upstream(relay, "missing host"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| Error::upstream(relay, "missing port"))?;
    let req = relay.into_client_request()?;
    let stream: Box<dyn AsyncReadWrite + Unpin + Send> = if let Some(proxy) = tor_socks {
        Box::new(
            Socks5Stream::connect(proxy, (host, port))
                .await
                .map_err(|e| Error::upstream(relay, e))?,
        )
    } else {
        Box::new(TcpStream::connect((host, port)).await?)
    };
    let (ws, _) = client_async_tls(req, stream).await?;
    Ok(ws)
}

/// Blanket trait for boxed async read/write streams.
trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}
