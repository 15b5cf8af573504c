//! Command line interface for the relay proxy. Supports initialization,
//! serving the HTTP surface (health, relay info, metrics, recent feed),
//! running merged queries, publishing events through the write fanout, and
//! rebuilding cache indexes.

mod access;
mod cache;
mod config;
mod dedup;
mod error;
mod event;
mod fanout;
mod filter;
mod identity;
mod merge;
mod pool;
mod relay;
mod server;
mod storage;
mod telemetry;
#[cfg(test)]
mod testing;
mod upstream;

use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use config::Settings;
use futures_util::StreamExt;
use storage::Store;
use tracing_subscriber::EnvFilter;

use crate::{cache::CacheBackend, event::Event, filter::Filter, pool::RelayPool, relay::ProxyRelay};

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "nostr-relay-proxy",
    author,
    version,
    about = "Nostr relay proxy backed by a local event cache",
    short_flag = 'v',
    long_flag = "version"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the cache directory tree at `LOCAL_CACHE_PATH`.
    Init,
    /// Launch the HTTP service.
    Serve,
    /// Run a merged query and print matching events as NDJSON.
    Query {
        /// NIP-01 filter object.
        #[arg(long, default_value = "{}")]
        filter: String,
        /// Identity the caller is authenticated as (hex pubkey).
        #[arg(long)]
        pubkey: Option<String>,
        /// Override `QUERY_TIMEOUT_SECS`.
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Publish event files to the write relays and the local cache.
    Publish {
        /// Paths to JSON event files.
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// Rebuild cache indexes from stored events.
    Reindex,
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    init_logging(&cfg.log_level);
    match cli.command {
        Commands::Init => {
            Store::new(cfg.cache_root.clone()).init()?;
        }
        Commands::Reindex => {
            let count = Store::new(cfg.cache_root.clone()).reindex()?;
            tracing::info!(events = count, "reindexed");
        }
        Commands::Serve => {
            let http_addr: SocketAddr = cfg
                .bind_http
                .as_str()
                .parse()
                .with_context(|| format!("BIND_HTTP={}", cfg.bind_http))?;
            let relay = Arc::new(build_relay(&cfg));
            relay.init().await.context("initializing local cache")?;
            server::serve_http(http_addr, relay.clone(), cfg.info.clone(), shutdown_signal()).await?;
            relay.close().await;
        }
        Commands::Query {
            filter,
            pubkey,
            timeout,
        } => {
            let value: serde_json::Value = serde_json::from_str(&filter).context("parsing --filter")?;
            if !value.is_object() {
                bail!("--filter must be a JSON object");
            }
            let filter = Filter::from_value(&value);
            let relay = build_relay(&cfg);
            if let Some(reason) = relay.accept_read(pubkey.as_deref()).reason() {
                bail!("{reason}");
            }
            relay.init().await.context("initializing local cache")?;
            let mut events = match timeout {
                Some(secs) => relay.query_with_timeout(filter, Duration::from_secs(secs)),
                None => relay.query(filter),
            };
            while let Some(ev) = events.next().await {
                println!("{}", serde_json::to_string(&ev)?);
            }
            relay.close().await;
        }
        Commands::Publish { files } => {
            let relay = build_relay(&cfg);
            relay.init().await.context("initializing local cache")?;
            for f in files {
                let data = fs::read_to_string(&f).with_context(|| format!("reading {f}"))?;
                let ev: Event = serde_json::from_str(&data).with_context(|| format!("parsing {f}"))?;
                if let Err(e) = ev.validate_shape() {
                    eprintln!("{f}: {e}");
                    continue;
                }
                if let Some(reason) = relay.accept_write(&ev).reason() {
                    eprintln!("{f}: {reason}");
                    continue;
                }
                relay.save(&ev).await;
                println!("{}", ev.id);
            }
            relay.close().await;
        }
    }
    Ok(())
}

fn build_relay(cfg: &Settings) -> ProxyRelay {
    let cache = if cfg.disable_local_cache {
        CacheBackend::Disabled
    } else {
        CacheBackend::File(Store::new(cfg.cache_root.clone()))
    };
    let pool = RelayPool::new(cfg.tor_socks.clone(), tracing::info_span!("pool"));
    relay::Relay::new(cache, pool, cfg.relay_options(), tracing::info_span!("relay"))
}

/// Install the global subscriber once. `RUST_LOG` wins over `LOG_LEVEL`.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "installing ctrl-c handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let base_dir = match env_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    let cache_root = base_dir.join("proxy-cache");
    fs::write(env_path, config::default_env(&display_path(&cache_root)))?;
    Ok(())
}

fn display_path(path: &PathBuf) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    run(cli).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::{clear_env, ENV_MUTEX};
    use tempfile::TempDir;
    use tokio::{net::TcpListener, task};

    const HEX: &str = "7e7e9c42a91bfef19fa929e5fda1b72e0ebc1a4c1141673e2794234d86addf4e";

    fn write_env(dir: &TempDir, extra: &str) -> String {
        let env_path = dir.path().join(".env");
        let content = format!(
            "LOCAL_CACHE_PATH={}\nBIND_HTTP=127.0.0.1:0\nREAD_RELAYS=\nWRITE_RELAYS=\n{}",
            dir.path().join("cache").to_str().unwrap(),
            extra
        );
        fs::write(&env_path, content).unwrap();
        env_path.to_str().unwrap().into()
    }

    fn event_file(dir: &TempDir, name: &str, pubkey: &str) -> String {
        let ev = Event {
            id: "ab".repeat(32),
            pubkey: pubkey.into(),
            kind: 1,
            created_at: 1,
            tags: vec![],
            content: "hello".into(),
            sig: "cd".repeat(64),
        };
        let path = dir.path().join(name);
        fs::write(&path, serde_json::to_string(&ev).unwrap()).unwrap();
        path.to_str().unwrap().into()
    }

    #[tokio::test]
    async fn run_init_publish_query_reindex() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();
        let dir = TempDir::new().unwrap();
        let env_file = write_env(&dir, "DISABLE_AUTH=1\n");

        run(Cli {
            env: env_file.clone(),
            command: Commands::Init,
        })
        .await
        .unwrap();
        assert!(dir.path().join("cache/events").exists());

        let ev_path = event_file(&dir, "ev.json", HEX);
        run(Cli {
            env: env_file.clone(),
            command: Commands::Publish {
                files: vec![ev_path],
            },
        })
        .await
        .unwrap();
        let stored = Store::new(dir.path().join("cache"))
            .query(&Filter::default())
            .unwrap();
        assert_eq!(stored.len(), 1);

        run(Cli {
            env: env_file.clone(),
            command: Commands::Query {
                filter: format!(r#"{{"authors":["{HEX}"]}}"#),
                pubkey: Some(HEX.into()),
                timeout: Some(5),
            },
        })
        .await
        .unwrap();

        run(Cli {
            env: env_file,
            command: Commands::Reindex,
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn query_requires_authentication() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();
        let dir = TempDir::new().unwrap();
        let env_file = write_env(&dir, "");

        let err = run(Cli {
            env: env_file,
            command: Commands::Query {
                filter: "{}".into(),
                pubkey: None,
                timeout: None,
            },
        })
        .await
        .unwrap_err();
        assert!(err.to_string().starts_with("auth-required"));
    }

    #[tokio::test]
    async fn query_rejects_non_object_filter() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();
        let dir = TempDir::new().unwrap();
        let env_file = write_env(&dir, "DISABLE_AUTH=1\n");

        let res = run(Cli {
            env: env_file,
            command: Commands::Query {
                filter: "[1]".into(),
                pubkey: Some(HEX.into()),
                timeout: None,
            },
        })
        .await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn publish_skips_authors_outside_allow_list() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();
        let dir = TempDir::new().unwrap();
        let env_file = write_env(
            &dir,
            "ALLOWED_NPUBS=npub10elfcs4fr0l0r8af98jlmgdh9c8tcxjvz9qkw038js35mp4dma8qzvjptg\n",
        );
        let ev_path = event_file(&dir, "ev.json", &"ef".repeat(32));

        run(Cli {
            env: env_file,
            command: Commands::Publish {
                files: vec![ev_path],
            },
        })
        .await
        .unwrap();

        let stored = Store::new(dir.path().join("cache"))
            .query(&Filter::default())
            .unwrap();
        assert!(stored.is_empty());
    }

    #[tokio::test]
    async fn init_creates_default_env() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();
        let dir = TempDir::new().unwrap();
        let env_path = dir.path().join(".env");
        run(Cli {
            env: env_path.to_string_lossy().into_owned(),
            command: Commands::Init,
        })
        .await
        .unwrap();

        let data = fs::read_to_string(&env_path).unwrap();
        let expected_root = dir.path().join("proxy-cache");
        assert!(data.contains(&format!(
            "LOCAL_CACHE_PATH={}",
            expected_root.to_string_lossy()
        )));
        assert!(data.contains("BIND_HTTP=0.0.0.0:8001"));
        assert!(data.contains("QUERY_TIMEOUT_SECS=120"));
        assert!(expected_root.join("events").exists());
    }

    #[tokio::test]
    async fn run_serve_starts_http() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();
        let dir = TempDir::new().unwrap();
        let http_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let http_port = http_listener.local_addr().unwrap().port();
        drop(http_listener);
        let env_path = dir.path().join(".env");
        let content = format!(
            "LOCAL_CACHE_PATH={}\nBIND_HTTP=127.0.0.1:{}\nWRITE_RELAYS=ws://127.0.0.1:9\n",
            dir.path().to_str().unwrap(),
            http_port,
        );
        fs::write(&env_path, content).unwrap();

        let handle = task::spawn(run(Cli {
            env: env_path.to_str().unwrap().to_string(),
            command: Commands::Serve,
        }));
        let url = format!("http://127.0.0.1:{}/healthz", http_port);
        let mut ok = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if let Ok(resp) = reqwest::get(&url).await {
                ok = resp.status().is_success();
                break;
            }
        }
        assert!(ok);
        handle.abort();
    }
}
