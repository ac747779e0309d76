//! Proxy server: memcache listener plus the web API

use crate::common::protocol::{self, meta_query, Command, Frame};
use crate::common::{validate_key, Item, Result, METRICS};
use crate::proxy::buffer::Shard;
use crate::proxy::http::create_router;
use crate::proxy::Proxy;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufStream};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

pub struct ProxyServer {
    proxy: Arc<Proxy>,
}

impl ProxyServer {
    pub fn new(proxy: Arc<Proxy>) -> Self {
        Self { proxy }
    }

    /// Run both listeners until ctrl-c
    pub async fn serve(self) -> Result<()> {
        let config = self.proxy.config();
        tracing::info!("Starting beanproxy {}", crate::VERSION);
        tracing::info!("  memcache: {}", config.proxy.client_addr());
        tracing::info!("  web API: {}", config.proxy.web_addr());
        tracing::info!(
            "  quorum: N={} W={} R={}",
            config.dstore.n,
            config.dstore.w,
            config.dstore.r
        );

        let mc_listener = TcpListener::bind(config.proxy.client_addr()).await?;
        let web_listener = TcpListener::bind(config.proxy.web_addr()).await?;
        let web_server = axum::serve(web_listener, create_router(self.proxy.clone()));

        tracing::info!("✓ Proxy ready");

        tokio::select! {
            res = run_listener(self.proxy.clone(), mc_listener) => {
                if let Err(e) = res {
                    tracing::error!("memcache listener error: {}", e);
                }
            }
            res = web_server => {
                if let Err(e) = res {
                    tracing::error!("HTTP server error: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
            }
        }

        Ok(())
    }
}

/// Accept memcache connections, one task each
pub async fn run_listener(proxy: Arc<Proxy>, listener: TcpListener) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let proxy = proxy.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(proxy, stream, peer).await {
                debug!(%peer, error = %e, "connection closed with error");
            }
        });
    }
}

struct ActiveConnection;

impl ActiveConnection {
    fn open() -> Self {
        METRICS.active_connections.inc();
        Self
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        METRICS.active_connections.dec();
    }
}

async fn handle_connection(proxy: Arc<Proxy>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    let _active = ActiveConnection::open();
    stream.set_nodelay(true)?;
    let mut stream = BufStream::new(stream);
    let body_max = proxy.config().mc.body_max;

    loop {
        let frame = protocol::read_frame(&mut stream, body_max).await?;
        match frame {
            Frame::Eof => break,
            Frame::Unknown => protocol::write_line(&mut stream, "ERROR").await?,
            Frame::Rejected(e) => {
                debug!(%peer, error = %e, "request rejected");
                protocol::write_line(&mut stream, e.to_wire_reply()).await?;
            }
            Frame::Command(Command::Quit) => break,
            Frame::Command(cmd) => execute(&proxy, &mut stream, cmd).await?,
        }
        stream.flush().await?;
    }
    Ok(())
}

async fn execute(proxy: &Proxy, stream: &mut BufStream<TcpStream>, cmd: Command) -> Result<()> {
    let max_key_len = proxy.config().mc.max_key_len;
    let dispatcher = proxy.dispatcher();

    match cmd {
        Command::Get { keys, with_rev } => match lookup(proxy, &keys).await {
            Ok(values) => {
                for (key, item) in values {
                    let _held = proxy.buffers().hold(Shard::GetData, item.len());
                    protocol::write_value(stream, &key, &item, with_rev).await?;
                }
                protocol::write_line(stream, "END").await
            }
            Err(e) => {
                warn!(keys = keys.len(), error = %e, "get failed");
                protocol::write_line(stream, "SERVER_ERROR read failed").await
            }
        },
        Command::Set { key, item, noreply } => {
            let reply = match validate_key(&key, max_key_len) {
                Err(_) => "SERVER_ERROR write failed",
                Ok(()) => match dispatcher.set(&key, &item).await {
                    Ok(()) => "STORED",
                    Err(e) => {
                        warn!(key = %key, error = %e, "set failed");
                        e.to_wire_reply()
                    }
                },
            };
            if noreply {
                return Ok(());
            }
            protocol::write_line(stream, reply).await
        }
        Command::Delete { key, noreply } => {
            let reply = match validate_key(&key, max_key_len) {
                Err(_) => "NOT_FOUND",
                Ok(()) => match dispatcher.delete(&key).await {
                    Ok(true) => "DELETED",
                    Ok(false) => "NOT_FOUND",
                    Err(e) => {
                        warn!(key = %key, error = %e, "delete failed");
                        e.to_wire_reply()
                    }
                },
            };
            if noreply {
                return Ok(());
            }
            protocol::write_line(stream, reply).await
        }
        Command::Version => {
            protocol::write_line(stream, &format!("VERSION {}", crate::VERSION)).await
        }
        Command::Quit => Ok(()),
    }
}

/// Resolve a `get` line; invalid keys and misses are left out
async fn lookup(proxy: &Proxy, keys: &[String]) -> Result<Vec<(String, Item)>> {
    let max_key_len = proxy.config().mc.max_key_len;
    let dispatcher = proxy.dispatcher();

    let mut plain = Vec::new();
    let mut metas = HashMap::new();
    for requested in keys {
        match meta_query(requested) {
            Some(key) => {
                if validate_key(key, max_key_len).is_ok() {
                    if let Some(meta) = dispatcher.get_meta(key).await? {
                        let item = Item::new(0, meta.to_string()).with_rev(meta.rev);
                        metas.insert(requested.clone(), item);
                    }
                }
            }
            None => {
                if validate_key(requested, max_key_len).is_ok() {
                    plain.push(requested.clone());
                }
            }
        }
    }

    let mut found: HashMap<String, Item> = match plain.as_slice() {
        [] => HashMap::new(),
        [key] => dispatcher
            .get(key)
            .await?
            .map(|item| (key.clone(), item))
            .into_iter()
            .collect(),
        _ => dispatcher.get_multi(&plain).await?.into_iter().collect(),
    };
    found.extend(metas);

    Ok(keys
        .iter()
        .filter_map(|key| found.get(key).map(|item| (key.clone(), item.clone())))
        .collect())
}

/// Bind the memcache listener on an explicit address, returning the bound one
pub async fn spawn_listener(proxy: Arc<Proxy>, addr: &str) -> Result<SocketAddr> {
    let listener = TcpListener::bind(addr).await?;
    let bound = listener.local_addr()?;
    tokio::spawn(async move {
        if let Err(e) = run_listener(proxy, listener).await {
            tracing::error!("memcache listener error: {}", e);
        }
    });
    Ok(bound)
}
