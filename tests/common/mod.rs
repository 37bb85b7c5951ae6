//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::http::{HeaderMap, HeaderValue, Request, StatusCode};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use caching_mitm_proxy::cache::MemoryCache;
use caching_mitm_proxy::config::{
    CachePolicy, PolicyHandle, ProxyConfig, TlsConfig, UpstreamConfig,
};
use caching_mitm_proxy::http::{
    CachedRequestInfo, CachingProcessor, HttpServer, HttpUpstream, Upstream, UpstreamError,
    UpstreamResponse,
};
use caching_mitm_proxy::lifecycle::Shutdown;
use caching_mitm_proxy::net::Listener;
use caching_mitm_proxy::tls::PemDirectoryAuthority;

pub type TestCache = MemoryCache<CachedRequestInfo>;

/// A request as seen by the mock origin.
#[derive(Debug, Clone)]
pub struct OriginRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
}

/// A canned origin response.
#[derive(Debug, Clone)]
pub struct OriginResponse {
    pub status: u16,
    pub headers: Vec<(&'static str, String)>,
    pub body: String,
}

impl OriginResponse {
    pub fn ok(body: &str) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: body.to_string(),
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: &'static str, value: &str) -> Self {
        self.headers.push((name, value.to_string()));
        self
    }
}

/// Start a programmable mock origin. Every request it sees is recorded.
pub async fn start_programmable_origin<F>(f: F) -> (SocketAddr, Arc<Mutex<Vec<OriginRequest>>>)
where
    F: Fn(&OriginRequest) -> OriginResponse + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let f = Arc::new(f);

    let log = Arc::clone(&seen);
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let f = Arc::clone(&f);
            let log = Arc::clone(&log);
            tokio::spawn(async move {
                let Some(request) = read_origin_request(&mut socket).await else {
                    return;
                };
                let response = f(&request);
                let is_head = request.method == "HEAD";
                log.lock().unwrap().push(request);

                let mut head = format!(
                    "HTTP/1.1 {} {}\r\n",
                    response.status,
                    StatusCode::from_u16(response.status)
                        .ok()
                        .and_then(|s| s.canonical_reason())
                        .unwrap_or("Unknown")
                );
                for (name, value) in &response.headers {
                    head.push_str(&format!("{}: {}\r\n", name, value));
                }
                if response.status != 304 {
                    head.push_str(&format!("Content-Length: {}\r\n", response.body.len()));
                }
                head.push_str("Connection: close\r\n\r\n");

                let _ = socket.write_all(head.as_bytes()).await;
                if !is_head && response.status != 304 {
                    let _ = socket.write_all(response.body.as_bytes()).await;
                }
                let _ = socket.shutdown().await;
            });
        }
    });

    (addr, seen)
}

async fn read_origin_request(socket: &mut TcpStream) -> Option<OriginRequest> {
    let head = read_head(socket).await?;
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split(' ');
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();

    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect();

    Some(OriginRequest {
        method,
        path,
        headers,
    })
}

/// Read byte by byte up to the blank line that ends an HTTP head.
pub async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> Option<String> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await.ok()? == 0 {
            return None;
        }
        head.push(byte[0]);
    }
    String::from_utf8(head).ok()
}

pub fn fixtures() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

/// A running proxy under test.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub cache: Arc<TestCache>,
    pub shutdown: Shutdown,
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

pub fn test_config(always_cache: bool) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.listener.drain_timeout_secs = 1;
    config.cache.always_cache = always_cache;
    config.cache.default_ttl_secs = 300;
    config.tls = TlsConfig {
        cert_dir: fixtures(),
        default_cert: None,
        default_key: None,
    };
    config
}

/// Start the proxy on an ephemeral port with the given origin client.
pub async fn start_proxy_with<U>(config: ProxyConfig, upstream: U) -> TestProxy
where
    U: Upstream + 'static,
{
    let cache = Arc::new(TestCache::new());
    let processor = Arc::new(CachingProcessor::new(
        Arc::clone(&cache),
        upstream,
        PolicyHandle::new(CachePolicy::from(&config.cache)),
    ));
    let authority = Arc::new(PemDirectoryAuthority::new(&config.tls));

    let listener = Listener::bind(&config.listener).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = Shutdown::new();

    let server = HttpServer::new(&config, processor, authority);
    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = server.run(listener, server_shutdown).await;
    });

    TestProxy {
        addr,
        cache,
        shutdown,
    }
}

/// Start the proxy with the real, non-pooled origin client.
pub async fn start_proxy(always_cache: bool) -> TestProxy {
    let upstream = HttpUpstream::new(&UpstreamConfig {
        connect_timeout_secs: 2,
        request_timeout_secs: 5,
    })
    .unwrap();
    start_proxy_with(test_config(always_cache), upstream).await
}

/// A reqwest client that sends plain HTTP through the proxy.
pub fn proxied_client(proxy: SocketAddr) -> reqwest::Client {
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(format!("http://{}", proxy)).unwrap())
        .pool_max_idle_per_host(0)
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

/// Origin stand-in for tunnel tests, where the target host is not reachable.
#[derive(Clone, Default)]
pub struct CountingUpstream {
    pub seen: Arc<Mutex<Vec<String>>>,
}

impl Upstream for CountingUpstream {
    async fn send(&self, request: Request<Bytes>) -> Result<UpstreamResponse, UpstreamError> {
        let uri = request.uri().to_string();
        self.seen.lock().unwrap().push(uri.clone());

        let body = format!("body of {}", request.uri().path());
        let mut headers = HeaderMap::new();
        headers.insert("content-length", HeaderValue::from(body.len()));
        headers.insert("etag", HeaderValue::from_static("\"v1\""));
        Ok(UpstreamResponse {
            status: StatusCode::OK,
            headers,
            body: Box::new(std::io::Cursor::new(body.into_bytes())),
        })
    }
}
