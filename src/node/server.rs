//! Storage node server

use crate::common::protocol::{self, meta_query, Command, Frame};
use crate::common::{format_bytes, validate_key, Item, NodeConfig, ProtocolConfig, Result};
use crate::node::http::create_router;
use crate::node::{lock, RecordStore, SharedStore};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncWriteExt, BufStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

pub struct NodeServer {
    config: NodeConfig,
    store: SharedStore,
}

impl NodeServer {
    pub fn new(config: NodeConfig) -> Self {
        Self::with_store(config, Arc::new(Mutex::new(RecordStore::new())))
    }

    /// Serve an existing store, e.g. to bring a stopped node back with its data
    pub fn with_store(config: NodeConfig, store: SharedStore) -> Self {
        Self { config, store }
    }

    /// Bind the listeners and start serving in the background
    pub async fn start(self) -> Result<NodeHandle> {
        let (shutdown, rx) = watch::channel(false);
        let mut tasks = Vec::new();

        let listener = TcpListener::bind(&self.config.bind).await?;
        let addr = listener.local_addr()?;
        tasks.push(tokio::spawn(accept_loop(
            listener,
            self.store.clone(),
            self.config.mc.clone(),
            rx.clone(),
        )));

        let web_addr = match &self.config.web {
            Some(web) => {
                let listener = TcpListener::bind(web).await?;
                let web_addr = listener.local_addr()?;
                let router = create_router(self.store.clone(), self.config.mc.clone());
                let mut rx = rx.clone();
                tasks.push(tokio::spawn(async move {
                    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
                        let _ = rx.changed().await;
                    });
                    if let Err(e) = server.await {
                        tracing::error!("HTTP server error: {}", e);
                    }
                }));
                Some(web_addr)
            }
            None => None,
        };

        Ok(NodeHandle {
            addr,
            web_addr,
            store: self.store,
            shutdown,
            tasks,
        })
    }

    /// Run until ctrl-c
    pub async fn serve(self) -> Result<()> {
        let body_max = self.config.mc.body_max;
        let handle = self.start().await?;
        tracing::info!("Starting storage node");
        tracing::info!("  memcache: {}", handle.addr());
        if let Some(web) = handle.web_addr() {
            tracing::info!("  REST API: {}", web);
        }
        tracing::info!("  max value: {}", format_bytes(body_max as u64));
        tracing::info!("✓ Node ready");

        tokio::signal::ctrl_c().await?;
        tracing::info!("Shutting down");
        handle.stop().await;
        Ok(())
    }
}

/// A running node
pub struct NodeHandle {
    addr: SocketAddr,
    web_addr: Option<SocketAddr>,
    store: SharedStore,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl NodeHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn web_addr(&self) -> Option<SocketAddr> {
        self.web_addr
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Stop listening and drop every open connection; returns the store
    pub async fn stop(self) -> SharedStore {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        self.store
    }
}

async fn accept_loop(
    listener: TcpListener,
    store: SharedStore,
    mc: ProtocolConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let store = store.clone();
                    let mc = mc.clone();
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(stream, store, mc).await {
                            tracing::debug!(%peer, error = %e, "connection closed with error");
                        }
                    });
                }
                Err(e) => tracing::warn!("accept failed: {}", e),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown.changed() => break,
        }
    }
    connections.shutdown().await;
}

async fn handle_connection(stream: TcpStream, store: SharedStore, mc: ProtocolConfig) -> Result<()> {
    stream.set_nodelay(true)?;
    let mut stream = BufStream::new(stream);

    loop {
        match protocol::read_frame(&mut stream, mc.body_max).await? {
            Frame::Eof | Frame::Command(Command::Quit) => break,
            Frame::Unknown => protocol::write_line(&mut stream, "ERROR").await?,
            Frame::Rejected(e) => protocol::write_line(&mut stream, e.to_wire_reply()).await?,
            Frame::Command(cmd) => execute(&mut stream, &store, &mc, cmd).await?,
        }
        stream.flush().await?;
    }
    Ok(())
}

async fn execute(
    stream: &mut BufStream<TcpStream>,
    store: &SharedStore,
    mc: &ProtocolConfig,
    cmd: Command,
) -> Result<()> {
    match cmd {
        Command::Get { keys, with_rev } => {
            let values: Vec<(String, Item)> = {
                let store = lock(store);
                keys.iter()
                    .filter_map(|requested| {
                        let item = match meta_query(requested) {
                            Some(key) => store
                                .get_meta(key)
                                .map(|meta| Item::new(0, meta.to_string()).with_rev(meta.rev)),
                            None if with_rev => store.get_versioned(requested),
                            None => store.get(requested),
                        }?;
                        Some((requested.clone(), item))
                    })
                    .collect()
            };
            for (key, item) in &values {
                protocol::write_value(stream, key, item, with_rev).await?;
            }
            protocol::write_line(stream, "END").await
        }
        Command::Set { key, item, noreply } => {
            let reply = match validate_key(&key, mc.max_key_len) {
                Err(_) => "SERVER_ERROR write failed",
                Ok(()) => match lock(store).set(&key, &item) {
                    Ok(_) => "STORED",
                    Err(e) => e.to_wire_reply(),
                },
            };
            if noreply {
                return Ok(());
            }
            protocol::write_line(stream, reply).await
        }
        Command::Delete { key, noreply } => {
            let found = lock(store).delete(&key);
            if noreply {
                return Ok(());
            }
            protocol::write_line(stream, if found { "DELETED" } else { "NOT_FOUND" }).await
        }
        Command::Version => {
            protocol::write_line(stream, &format!("VERSION {}", crate::VERSION)).await
        }
        Command::Quit => Ok(()),
    }
}
