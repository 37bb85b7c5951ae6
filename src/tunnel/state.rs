//! Tunnel lifecycle state machine.
//!
//! ```text
//! Hijacking → CertFetch → HandshakeAck → TlsTerminate → RequestLoop → Closed
//!     └────────────┴────────────┴──────────────┴────────────┴──────→ Closed
//! ```
//!
//! Every state may fall straight through to `Closed` on failure; otherwise a
//! tunnel only ever moves one step forward.

use std::fmt;

use crate::observability::metrics;

/// Stage of a CONNECT tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// Taking the client socket away from the HTTP server.
    Hijacking,
    /// Obtaining a leaf certificate for the target host.
    CertFetch,
    /// Acknowledging the CONNECT with a 200.
    HandshakeAck,
    /// Running the TLS server handshake with the client.
    TlsTerminate,
    /// Decoding and answering requests off the decrypted stream.
    RequestLoop,
    Closed,
}

impl TunnelState {
    /// The state reached when this one succeeds.
    pub fn next(self) -> TunnelState {
        match self {
            TunnelState::Hijacking => TunnelState::CertFetch,
            TunnelState::CertFetch => TunnelState::HandshakeAck,
            TunnelState::HandshakeAck => TunnelState::TlsTerminate,
            TunnelState::TlsTerminate => TunnelState::RequestLoop,
            TunnelState::RequestLoop | TunnelState::Closed => TunnelState::Closed,
        }
    }

    pub fn can_transition_to(self, to: TunnelState) -> bool {
        self != TunnelState::Closed && (to == self.next() || to == TunnelState::Closed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TunnelState::Hijacking => "hijacking",
            TunnelState::CertFetch => "cert_fetch",
            TunnelState::HandshakeAck => "handshake_ack",
            TunnelState::TlsTerminate => "tls_terminate",
            TunnelState::RequestLoop => "request_loop",
            TunnelState::Closed => "closed",
        }
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks one tunnel's progress and logs every transition.
#[derive(Debug)]
pub struct TunnelLifecycle {
    target: String,
    state: TunnelState,
}

impl TunnelLifecycle {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            state: TunnelState::Hijacking,
        }
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Move to the next state on the success path.
    pub fn advance(&mut self) -> TunnelState {
        self.transition(self.state.next());
        self.state
    }

    /// Close after a failure in the current state.
    pub fn fail(&mut self, reason: &dyn std::error::Error) {
        if self.state == TunnelState::Closed {
            return;
        }
        tracing::warn!(
            target_host = %self.target,
            state = %self.state,
            error = %reason,
            "Tunnel failed"
        );
        metrics::record_tunnel(self.state.as_str());
        self.transition(TunnelState::Closed);
    }

    /// Close after a clean end of stream.
    pub fn close(&mut self) {
        if self.state == TunnelState::Closed {
            return;
        }
        metrics::record_tunnel("completed");
        self.transition(TunnelState::Closed);
    }

    fn transition(&mut self, to: TunnelState) {
        debug_assert!(self.state.can_transition_to(to), "{} -> {}", self.state, to);
        tracing::debug!(target_host = %self.target, from = %self.state, to = %to, "Tunnel transition");
        self.state = to;
    }
}
