//! # Responder Handshake
//!
//! Per-connection state machine for the responder:
//!
//! ```text
//! Listening -> Accepted -> SentPk -> AwaitingCt -> Decapsulated -> SentSs -> Closed
//!                  \          \           \              \
//!                   +----------+-----------+--------------+--> Failed -> Closed
//! ```
//!
//! Each accepted connection gets a fresh [`ResponderHandshake`]. The only
//! state it shares with other connections is the read-only key pair and KEM
//! capability it was constructed with.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::crypto::{Kem, KeyPair};
use crate::error::{ProtocolError, ProtocolResult};
use crate::frame::{read_ciphertext, write_public_key, write_shared_secret, CiphertextFraming};
use crate::transport::Transport;
use crate::{PK_LEN, SS_LEN};

/// Responder connection states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponderState {
    /// Accept loop waiting for a connection
    Listening,
    /// Connection accepted, nothing sent yet
    Accepted,
    /// Public key message sent
    SentPk,
    /// Waiting for the ciphertext message
    AwaitingCt,
    /// Ciphertext decapsulated
    Decapsulated,
    /// Shared secret sent
    SentSs,
    /// Connection shut down and released
    Closed,
    /// Handshake aborted
    Failed,
}

impl ResponderState {
    /// Whether `next` is a legal successor of `self`
    pub fn can_transition_to(self, next: ResponderState) -> bool {
        use ResponderState::*;
        match (self, next) {
            (Listening, Accepted)
            | (Accepted, SentPk)
            | (SentPk, AwaitingCt)
            | (AwaitingCt, Decapsulated)
            | (Decapsulated, SentSs)
            | (SentSs, Closed)
            | (Failed, Closed) => true,
            (Closed, _) | (Failed, _) => false,
            (_, Failed) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == ResponderState::Closed
    }
}

impl std::fmt::Display for ResponderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Listening => write!(f, "Listening"),
            Self::Accepted => write!(f, "Accepted"),
            Self::SentPk => write!(f, "SentPk"),
            Self::AwaitingCt => write!(f, "AwaitingCt"),
            Self::Decapsulated => write!(f, "Decapsulated"),
            Self::SentSs => write!(f, "SentSs"),
            Self::Closed => write!(f, "Closed"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// What a successful responder handshake produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponderSummary {
    /// Framing detected on the received ciphertext
    pub ciphertext_framing: CiphertextFraming,
    /// Hex fingerprint of the decapsulated secret
    pub secret_fingerprint: String,
}

/// Outcome of one responder connection
#[derive(Debug)]
pub struct ConnectionReport {
    /// Peer address, when known
    pub peer: Option<SocketAddr>,
    /// Every state visited, in order
    pub trace: Vec<ResponderState>,
    /// Summary on success, the per-connection error otherwise
    pub result: ProtocolResult<ResponderSummary>,
}

impl ConnectionReport {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Last state reached; always `Closed` for a finished connection
    pub fn final_state(&self) -> ResponderState {
        self.trace.last().copied().unwrap_or(ResponderState::Listening)
    }
}

/// Responder side of one handshake
pub struct ResponderHandshake<K: Kem + ?Sized> {
    state: ResponderState,
    trace: Vec<ResponderState>,
    keypair: Arc<KeyPair>,
    kem: Arc<K>,
}

impl<K: Kem + ?Sized> ResponderHandshake<K> {
    /// Create the handler for a freshly accepted connection
    pub fn new(keypair: Arc<KeyPair>, kem: Arc<K>) -> Self {
        Self {
            state: ResponderState::Accepted,
            trace: vec![ResponderState::Listening, ResponderState::Accepted],
            keypair,
            kem,
        }
    }

    /// Get current state
    pub fn state(&self) -> ResponderState {
        self.state
    }

    /// States visited so far
    pub fn trace(&self) -> &[ResponderState] {
        &self.trace
    }

    fn advance(&mut self, next: ResponderState) -> ProtocolResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(ProtocolError::InvalidStateTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        debug!(from = %self.state, to = %next, "responder state");
        self.state = next;
        self.trace.push(next);
        Ok(())
    }

    /// Run the handshake over `transport`, then always close it
    pub async fn run<S>(mut self, mut transport: Transport<S>, peer: Option<SocketAddr>) -> ConnectionReport
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let result = match self.exchange(&mut transport).await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                // Failed is reachable from every non-terminal state.
                self.state = ResponderState::Failed;
                self.trace.push(ResponderState::Failed);
                Err(e)
            }
        };

        if let Err(e) = transport.shutdown().await {
            debug!("shutdown after handshake: {}", e);
        }
        drop(transport);
        self.state = ResponderState::Closed;
        self.trace.push(ResponderState::Closed);

        match &result {
            Ok(summary) => info!(
                peer = ?peer,
                framing = %summary.ciphertext_framing,
                "shared secret sent ({} bytes), connection closed",
                SS_LEN
            ),
            Err(e) => warn!(peer = ?peer, kind = e.category(), "handshake failed: {}", e),
        }

        ConnectionReport {
            peer,
            trace: self.trace,
            result,
        }
    }

    async fn exchange<S>(&mut self, transport: &mut Transport<S>) -> ProtocolResult<ResponderSummary>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        write_public_key(transport, self.keypair.public()).await?;
        self.advance(ResponderState::SentPk)?;
        debug!("public key sent ({} bytes + 2-byte header)", PK_LEN);

        self.advance(ResponderState::AwaitingCt)?;
        let (ciphertext, framing) = read_ciphertext(transport).await?;

        // A primitive failure ends the connection without a reply; the
        // initiator sees the stream close instead of a secret.
        let secret = self.kem.decapsulate(&ciphertext, self.keypair.secret())?;
        drop(ciphertext);
        self.advance(ResponderState::Decapsulated)?;
        debug!(ss = %secret.fingerprint(), "responder ss[0..3]");

        write_shared_secret(transport, &secret).await?;
        self.advance(ResponderState::SentSs)?;

        Ok(ResponderSummary {
            ciphertext_framing: framing,
            secret_fingerprint: secret.fingerprint(),
        })
    }
}
