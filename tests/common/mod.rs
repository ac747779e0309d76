//! Shared harness: in-process storage nodes, a proxy and a memcache client

#![allow(dead_code)]

use beanproxy::common::protocol::{self, Command, Frame};
use beanproxy::common::{NodeConfig, ProxyConfig, RouteConfig};
use beanproxy::node::{NodeHandle, NodeServer};
use beanproxy::proxy::server::spawn_listener;
use beanproxy::Proxy;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::{TcpListener, TcpStream};

pub async fn start_node(web: bool) -> NodeHandle {
    NodeServer::new(NodeConfig {
        bind: "127.0.0.1:0".into(),
        web: web.then(|| "127.0.0.1:0".to_string()),
        ..Default::default()
    })
    .start()
    .await
    .unwrap()
}

/// A node that answers every write only after `delay`
pub async fn spawn_slow_node(delay: Duration) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        while let Ok((sock, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut stream = BufStream::new(sock);
                while let Ok(frame) = protocol::read_frame(&mut stream, 1024 * 1024).await {
                    let reply = match frame {
                        Frame::Eof | Frame::Command(Command::Quit) => break,
                        Frame::Command(Command::Set { .. }) => {
                            tokio::time::sleep(delay).await;
                            "STORED"
                        }
                        Frame::Command(Command::Delete { .. }) => {
                            tokio::time::sleep(delay).await;
                            "NOT_FOUND"
                        }
                        Frame::Command(Command::Get { .. }) => "END",
                        _ => "ERROR",
                    };
                    if protocol::write_line(&mut stream, reply).await.is_err()
                        || stream.flush().await.is_err()
                    {
                        break;
                    }
                }
            });
        }
    });
    addr
}

/// Poll `check` for up to 5 seconds
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Three mains and one backup serving a single bucket
pub struct Cluster {
    pub mains: Vec<Option<NodeHandle>>,
    pub backup: NodeHandle,
    pub proxy: Arc<Proxy>,
    pub addr: SocketAddr,
}

impl Cluster {
    /// `extra` is appended to the generated `proxy.toml`
    pub async fn start(extra: &str) -> Self {
        Self::start_with(extra, 3, &[]).await
    }

    /// `nodes` in-process mains followed by `foreign` mains served elsewhere
    pub async fn start_with(extra: &str, nodes: usize, foreign: &[String]) -> Self {
        let mut mains = Vec::new();
        for _ in 0..nodes {
            mains.push(Some(start_node(false).await));
        }
        let backup = start_node(false).await;

        let mut route = String::from("numbucket = 1\n");
        route += &format!("backup = [\"{}\"]\n", backup.addr());
        let addrs = mains
            .iter()
            .flatten()
            .map(|node| node.addr().to_string())
            .chain(foreign.iter().cloned());
        for addr in addrs {
            route += &format!("[[main]]\naddr = \"{}\"\nbuckets = [\"0\"]\n", addr);
        }

        let config = ProxyConfig::from_toml(extra).unwrap();
        let route = RouteConfig::from_toml(&route).unwrap();
        let proxy = Proxy::build(config, &route).unwrap();
        let addr = spawn_listener(proxy.clone(), "127.0.0.1:0").await.unwrap();

        Self {
            mains,
            backup,
            proxy,
            addr,
        }
    }

    pub async fn stop_main(&mut self, idx: usize) {
        if let Some(node) = self.mains[idx].take() {
            node.stop().await;
        }
    }

    pub async fn client(&self) -> Client {
        Client::connect(self.addr).await
    }

    /// Wait for detached replica writes to finish
    pub async fn wait_drained(&self) -> bool {
        for _ in 0..50 {
            if self.proxy.buffers().is_drained() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }
}

/// Minimal memcache text client
pub struct Client {
    stream: BufStream<TcpStream>,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: BufStream::new(TcpStream::connect(addr).await.unwrap()),
        }
    }

    pub async fn send(&mut self, raw: &[u8]) {
        self.stream.write_all(raw).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    pub async fn line(&mut self) -> String {
        let mut line = String::new();
        self.stream.read_line(&mut line).await.unwrap();
        line.trim_end_matches(['\r', '\n']).to_string()
    }

    /// Send a raw request and read one reply line
    pub async fn request(&mut self, raw: &[u8]) -> String {
        self.send(raw).await;
        self.line().await
    }

    pub async fn set(&mut self, key: &str, value: &[u8]) -> String {
        self.set_rev(key, value, 0).await
    }

    pub async fn set_rev(&mut self, key: &str, value: &[u8], rev: i64) -> String {
        let mut raw = format!("set {} 0 {} {}\r\n", key, rev, value.len()).into_bytes();
        raw.extend_from_slice(value);
        raw.extend_from_slice(b"\r\n");
        self.request(&raw).await
    }

    pub async fn delete(&mut self, key: &str) -> String {
        self.request(format!("delete {}\r\n", key).as_bytes()).await
    }

    /// `Err` carries an error line such as `SERVER_ERROR read failed`
    pub async fn get_multi(&mut self, keys: &[&str]) -> Result<Vec<(String, Vec<u8>)>, String> {
        self.send(format!("get {}\r\n", keys.join(" ")).as_bytes())
            .await;
        let mut values = Vec::new();
        loop {
            let line = self.line().await;
            if line == "END" {
                return Ok(values);
            }
            let parts: Vec<&str> = line.split(' ').collect();
            if parts[0] != "VALUE" {
                return Err(line);
            }
            let size: usize = parts[3].parse().unwrap();
            let mut body = vec![0u8; size + 2];
            self.stream.read_exact(&mut body).await.unwrap();
            body.truncate(size);
            values.push((parts[1].to_string(), body));
        }
    }

    pub async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, String> {
        Ok(self.get_multi(&[key]).await?.pop().map(|(_, v)| v))
    }

    /// `(revision, chunk id, offset)` from the `??key` metadata line
    pub async fn meta(&mut self, key: &str) -> Option<(i64, u32, u64)> {
        let meta = self.get(&format!("??{}", key)).await.unwrap()?;
        let meta = String::from_utf8(meta).unwrap();
        let fields: Vec<&str> = meta.split_whitespace().collect();
        assert_eq!(fields.len(), 7, "bad meta line {:?}", meta);
        Some((
            fields[0].parse().unwrap(),
            fields[5].parse().unwrap(),
            fields[6].parse().unwrap(),
        ))
    }
}
