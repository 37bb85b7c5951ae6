//! MITM tunnel controller.
//!
//! # Data Flow
//! ```text
//! CONNECT host:port
//!     → Hijacking     (take the upgrade handle from the request)
//!     → CertFetch     (leaf certificate for host from the CertAuthority)
//!     → HandshakeAck  (200 returned to the HTTP server)
//!     → TlsTerminate  (rustls server handshake on the upgraded socket)
//!     → RequestLoop   (decode, process, write raw; one request at a time)
//!     → Closed
//! ```
//!
//! # Design Decisions
//! - Setup failures before the ack are answered with a 500 on the CONNECT
//! - Failures after the ack can only be logged; the socket is dropped
//! - Requests on one tunnel are strictly sequential; tunnels are independent tasks

pub mod request_loop;
pub mod state;

use std::sync::Arc;

use axum::body::Body;
use axum::http::uri::Authority;
use axum::http::{Request, Response, StatusCode};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio_rustls::TlsAcceptor;

use crate::cache::Cache;
use crate::http::codec::DecodeError;
use crate::http::processor::{CachedRequestInfo, CachingProcessor};
use crate::http::upstream::Upstream;
use crate::http::writer::{ChannelWriter, ResponseWriter};
use crate::net::ConnectionHandle;
use crate::tls::{self, CertAuthority, CertError};

pub use request_loop::run_request_loop;
pub use state::{TunnelLifecycle, TunnelState};

/// Errors that end a CONNECT tunnel.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("CONNECT target {0:?} is not host:port")]
    InvalidTarget(String),

    #[error("connection hijacking is not supported for this request")]
    HijackUnsupported,

    #[error("connection upgrade failed: {0}")]
    Upgrade(#[from] hyper::Error),

    #[error("certificate unavailable: {0}")]
    Certificate(#[from] CertError),

    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] std::io::Error),

    #[error("failed to decode tunneled request: {0}")]
    Decode(#[from] DecodeError),
}

/// Terminates CONNECT tunnels and feeds their requests to the processor.
pub struct TunnelController<C, U, A> {
    processor: Arc<CachingProcessor<C, U>>,
    authority: Arc<A>,
    max_body_bytes: usize,
}

impl<C, U, A> Clone for TunnelController<C, U, A> {
    fn clone(&self) -> Self {
        Self {
            processor: Arc::clone(&self.processor),
            authority: Arc::clone(&self.authority),
            max_body_bytes: self.max_body_bytes,
        }
    }
}

impl<C, U, A> TunnelController<C, U, A>
where
    C: Cache<CachedRequestInfo> + 'static,
    U: Upstream + 'static,
    A: CertAuthority + 'static,
{
    pub fn new(
        processor: Arc<CachingProcessor<C, U>>,
        authority: Arc<A>,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            processor,
            authority,
            max_body_bytes,
        }
    }

    /// Answer a CONNECT request.
    ///
    /// On success the returned 200 completes the handshake ack; the TLS side of
    /// the tunnel then runs on its own task once the server hands over the socket.
    pub async fn handle_connect<B>(&self, mut req: Request<B>, connection: ConnectionHandle) -> Response<Body> {
        let connection_id = connection.id();
        let Some(target) = req.uri().authority().cloned() else {
            let err = TunnelError::InvalidTarget(req.uri().to_string());
            let mut lifecycle = TunnelLifecycle::new(req.uri().to_string());
            lifecycle.fail(&err);
            return error_response(&err, StatusCode::BAD_REQUEST).await;
        };
        let mut lifecycle = TunnelLifecycle::new(target.as_str());
        tracing::info!(connection_id = %connection_id, target_host = %target, "CONNECT received");

        let Some(on_upgrade) = req.extensions_mut().remove::<OnUpgrade>() else {
            let err = TunnelError::HijackUnsupported;
            lifecycle.fail(&err);
            return error_response(&err, StatusCode::INTERNAL_SERVER_ERROR).await;
        };
        lifecycle.advance();

        let server_config = match self.server_config_for(target.host()).await {
            Ok(config) => config,
            Err(err) => {
                lifecycle.fail(&err);
                return error_response(&err, StatusCode::INTERNAL_SERVER_ERROR).await;
            }
        };
        lifecycle.advance();

        let controller = self.clone();
        tokio::spawn(async move {
            controller
                .run_tunnel(on_upgrade, TlsAcceptor::from(server_config), target, lifecycle, connection)
                .await;
        });

        Response::new(Body::empty())
    }

    async fn server_config_for(&self, host: &str) -> Result<Arc<rustls::ServerConfig>, TunnelError> {
        let certificate = self.authority.certificate_for_host(host).await?;
        Ok(tls::server_config(&certificate)?)
    }

    async fn run_tunnel(
        self,
        on_upgrade: OnUpgrade,
        acceptor: TlsAcceptor,
        target: Authority,
        mut lifecycle: TunnelLifecycle,
        connection: ConnectionHandle,
    ) {
        let connection_id = connection.id();
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                lifecycle.fail(&TunnelError::Upgrade(e));
                return;
            }
        };
        lifecycle.advance();

        let tls_stream = match acceptor.accept(TokioIo::new(upgraded)).await {
            Ok(stream) => stream,
            Err(e) => {
                lifecycle.fail(&TunnelError::Handshake(e));
                return;
            }
        };
        lifecycle.advance();
        tracing::debug!(connection_id = %connection_id, target_host = %target, "Client TLS handshake complete");

        match run_request_loop(tls_stream, &target, &self.processor, self.max_body_bytes).await {
            Ok(()) => lifecycle.close(),
            Err(err) => lifecycle.fail(&err),
        }
        tracing::info!(connection_id = %connection_id, target_host = %target, "Tunnel closed");
    }
}

async fn error_response(err: &TunnelError, status: StatusCode) -> Response<Body> {
    let (mut writer, response_rx) = ChannelWriter::new();
    writer.error(err, status).await;
    response_rx.await.unwrap_or_else(|_| {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = status;
        response
    })
}
