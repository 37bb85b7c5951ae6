//! HTTP server setup and request dispatch.
//!
//! # Responsibilities
//! - Accept client connections under the connection limit
//! - Serve each connection with hyper HTTP/1.1, upgrades enabled
//! - Dispatch CONNECT to the tunnel controller, everything else to the axum router
//! - Wire up middleware (tracing, request ID, timeout) on the plain path
//! - Stop accepting and drain connections on shutdown

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{Method, Request, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tower::ServiceExt;
use tower_http::{
    request_id::{PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::cache::Cache;
use crate::config::ProxyConfig;
use crate::http::processor::{CachedRequestInfo, CachingProcessor};
use crate::http::request::MakeRequestUuid;
use crate::http::upstream::Upstream;
use crate::http::writer::ChannelWriter;
use crate::lifecycle::Shutdown;
use crate::net::{ConnectionHandle, ConnectionTracker, Listener, ListenerError};
use crate::tls::CertAuthority;
use crate::tunnel::TunnelController;

/// Application state injected into the plain-proxy handler.
pub struct AppState<C, U> {
    pub processor: Arc<CachingProcessor<C, U>>,
    pub max_body_bytes: usize,
}

impl<C, U> Clone for AppState<C, U> {
    fn clone(&self) -> Self {
        Self {
            processor: Arc::clone(&self.processor),
            max_body_bytes: self.max_body_bytes,
        }
    }
}

/// HTTP server for the caching proxy.
pub struct HttpServer<C, U, A> {
    router: Router,
    tunnels: TunnelController<C, U, A>,
    drain_timeout: Duration,
}

impl<C, U, A> HttpServer<C, U, A>
where
    C: Cache<CachedRequestInfo> + 'static,
    U: Upstream + 'static,
    A: CertAuthority + 'static,
{
    pub fn new(config: &ProxyConfig, processor: Arc<CachingProcessor<C, U>>, authority: Arc<A>) -> Self {
        let max_body_bytes = config.cache.max_request_body_bytes;
        let state = AppState {
            processor: Arc::clone(&processor),
            max_body_bytes,
        };

        Self {
            router: Self::build_router(config, state),
            tunnels: TunnelController::new(processor, authority, max_body_bytes),
            drain_timeout: Duration::from_secs(config.listener.drain_timeout_secs),
        }
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(config: &ProxyConfig, state: AppState<C, U>) -> Router {
        Router::new()
            .fallback(proxy_handler::<C, U>)
            .with_state(state)
            .layer(TimeoutLayer::new(Duration::from_secs(config.upstream.request_timeout_secs)))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(TraceLayer::new_for_http())
    }

    /// Run the accept loop until `shutdown` fires, then drain open connections.
    pub async fn run(self, listener: Listener, shutdown: Shutdown) -> Result<(), ListenerError> {
        let tracker = ConnectionTracker::new();
        let mut shutdown_rx = shutdown.subscribe();

        tracing::info!(
            address = ?listener.local_addr().ok(),
            max_connections = listener.max_connections(),
            "HTTP server starting"
        );

        loop {
            let accepted = tokio::select! {
                _ = shutdown_rx.recv() => break,
                accepted = listener.accept() => accepted,
            };

            let (stream, peer_addr, permit) = match accepted {
                Ok(accepted) => accepted,
                Err(ListenerError::Accept(e)) => {
                    tracing::warn!(error = %e, "Accept failed");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let connection = ConnectionHandle::new(tracker.track(), Some(permit));
            tracing::debug!(connection_id = %connection.id(), peer_addr = %peer_addr, "Serving connection");
            self.spawn_connection(TokioIo::new(stream), connection, shutdown.subscribe());
        }

        tracing::info!(active = tracker.active_count(), "Stopped accepting, draining connections");
        if !tracker.drain(self.drain_timeout).await {
            tracing::warn!(
                remaining = tracker.active_count(),
                "Drain timeout elapsed with connections still open"
            );
        }
        tracing::info!("HTTP server stopped");
        Ok(())
    }

    fn spawn_connection(
        &self,
        io: TokioIo<tokio::net::TcpStream>,
        connection: ConnectionHandle,
        mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
    ) {
        let router = self.router.clone();
        let tunnels = self.tunnels.clone();
        let connection_id = connection.id();

        let service = service_fn(move |req: Request<Incoming>| {
            let router = router.clone();
            let tunnels = tunnels.clone();
            let connection = connection.clone();
            async move {
                if req.method() == Method::CONNECT {
                    Ok::<_, Infallible>(tunnels.handle_connect(req, connection).await)
                } else {
                    router.oneshot(req).await
                }
            }
        });

        tokio::spawn(async move {
            let conn = http1::Builder::new()
                .serve_connection(io, service)
                .with_upgrades();
            tokio::pin!(conn);

            let result = tokio::select! {
                result = conn.as_mut() => result,
                _ = shutdown_rx.recv() => {
                    conn.as_mut().graceful_shutdown();
                    conn.await
                }
            };
            if let Err(e) = result {
                tracing::debug!(connection_id = %connection_id, error = %e, "Connection ended with error");
            }
        });
    }
}

/// Plain (non-CONNECT) proxy requests.
///
/// The body is buffered, the processor runs on its own task and the response
/// head is returned as soon as the channel writer produces it.
async fn proxy_handler<C, U>(State(state): State<AppState<C, U>>, request: Request<Body>) -> Response
where
    C: Cache<CachedRequestInfo> + 'static,
    U: Upstream + 'static,
{
    if request.uri().scheme().is_none() || request.uri().authority().is_none() {
        return (
            StatusCode::BAD_REQUEST,
            "proxy requests must use an absolute request target\n",
        )
            .into_response();
    }

    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, state.max_body_bytes).await {
        Ok(body) => body,
        Err(e) => {
            tracing::debug!(error = %e, uri = %parts.uri, "Rejecting request body");
            return (StatusCode::PAYLOAD_TOO_LARGE, format!("{}\n", e)).into_response();
        }
    };

    let (mut writer, response_rx) = ChannelWriter::new();
    let request = Request::from_parts(parts, body);
    let processor = Arc::clone(&state.processor);
    tokio::spawn(async move {
        // Failures are already logged and reported through the writer.
        let _ = processor.process(&mut writer, request).await;
    });

    match response_rx.await {
        Ok(response) => response,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}
