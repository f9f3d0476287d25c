//! # Initiator
//!
//! One-shot client side of the handshake, doubling as a negative-testing
//! harness: it can flip a bit in the public key before encapsulating or in
//! the transmitted ciphertext, then checks whether the two independently
//! derived secrets still agree.

use std::fmt;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use crate::crypto::{Ciphertext, Kem, PublicKey, SharedSecret};
use crate::error::{ProtocolError, ProtocolResult};
use crate::frame::{read_public_key, read_shared_secret, write_ciphertext, CiphertextFraming};
use crate::transport::Transport;
use crate::{CT_LEN, DEFAULT_PORT, PK_LEN};

/// Exit status for a matching handshake
pub const EXIT_MATCH: u8 = 0;
/// Exit status for I/O, connection and protocol errors
pub const EXIT_FAILURE: u8 = 1;
/// Exit status for invalid command-line usage
pub const EXIT_USAGE: u8 = 2;
/// Exit status for a completed handshake whose secrets differ
pub const EXIT_MISMATCH: u8 = 3;

/// Which protocol field to tamper with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum CorruptionTarget {
    /// Leave everything intact
    #[default]
    None,
    /// Flip a bit in the transmitted ciphertext
    #[value(name = "ct")]
    Ciphertext,
    /// Flip a bit in the received public key before encapsulating
    #[value(name = "pk")]
    PublicKey,
}

impl fmt::Display for CorruptionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Ciphertext => write!(f, "ct"),
            Self::PublicKey => write!(f, "pk"),
        }
    }
}

/// Deliberate single-bit corruption
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CorruptionSpec {
    pub target: CorruptionTarget,
    /// Byte to flip, taken modulo the length of the target field
    pub byte_index: usize,
}

impl CorruptionSpec {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn new(target: CorruptionTarget, byte_index: usize) -> Self {
        Self { target, byte_index }
    }

    pub fn is_active(&self) -> bool {
        self.target != CorruptionTarget::None
    }

    /// Flip bit 0 of the public key if it is the target; returns the index touched
    pub fn apply_to_public_key(&self, public: &mut PublicKey) -> Option<usize> {
        if self.target != CorruptionTarget::PublicKey {
            return None;
        }
        let index = self.byte_index % PK_LEN;
        public.as_bytes_mut()[index] ^= 0x01;
        Some(index)
    }

    /// Flip bit 0 of the ciphertext if it is the target; returns the index touched
    pub fn apply_to_ciphertext(&self, ciphertext: &mut Ciphertext) -> Option<usize> {
        if self.target != CorruptionTarget::Ciphertext {
            return None;
        }
        let index = self.byte_index % CT_LEN;
        ciphertext.as_bytes_mut()[index] ^= 0x01;
        Some(index)
    }
}

/// Initiator settings
#[derive(Debug, Clone)]
pub struct InitiatorConfig {
    pub host: String,
    pub port: u16,
    /// Whether to send the optional ciphertext length header
    pub ciphertext_framing: CiphertextFraming,
    pub corruption: CorruptionSpec,
    pub connect_timeout: Option<Duration>,
    /// Deadline applied to every send and receive
    pub io_timeout: Option<Duration>,
}

impl Default for InitiatorConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            ciphertext_framing: CiphertextFraming::Bare,
            corruption: CorruptionSpec::none(),
            connect_timeout: Some(Duration::from_secs(10)),
            io_timeout: Some(Duration::from_secs(10)),
        }
    }
}

impl InitiatorConfig {
    /// Reject settings that cannot complete a handshake
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.host.trim().is_empty() {
            return Err(ProtocolError::Config("host must not be empty".to_string()));
        }
        if self.connect_timeout == Some(Duration::ZERO) {
            return Err(ProtocolError::Config("connect timeout must be positive".to_string()));
        }
        if self.io_timeout == Some(Duration::ZERO) {
            return Err(ProtocolError::Config("I/O timeout must be positive".to_string()));
        }
        Ok(())
    }
}

/// Result of the secret comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Match,
    Mismatch,
}

impl Outcome {
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Match => EXIT_MATCH,
            Self::Mismatch => EXIT_MISMATCH,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Match => write!(f, "MATCH"),
            Self::Mismatch => write!(f, "MISMATCH"),
        }
    }
}

/// What a completed initiator handshake observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeReport {
    pub outcome: Outcome,
    /// Fingerprint of the secret derived by encapsulation
    pub local_fingerprint: String,
    /// Fingerprint of the secret the responder sent back
    pub peer_fingerprint: String,
    pub corruption: CorruptionSpec,
    /// Byte actually flipped, after reduction modulo the field length
    pub corrupted_index: Option<usize>,
    pub framing: CiphertextFraming,
}

impl HandshakeReport {
    /// A mismatch that the configured corruption was expected to cause
    pub fn mismatch_was_induced(&self) -> bool {
        self.outcome == Outcome::Mismatch && self.corruption.is_active()
    }
}

/// Exit status for a failed handshake
///
/// Invalid settings are a usage error; everything else is an I/O,
/// connection or protocol failure.
pub fn exit_code_for_error(err: &ProtocolError) -> u8 {
    match err {
        ProtocolError::Config(_) => EXIT_USAGE,
        _ => EXIT_FAILURE,
    }
}

/// Client side of one handshake
pub struct Initiator<K: Kem> {
    config: InitiatorConfig,
    kem: K,
}

impl<K: Kem> Initiator<K> {
    pub fn new(config: InitiatorConfig, kem: K) -> Self {
        Self { config, kem }
    }

    /// Connect and run one handshake
    pub async fn run(&self) -> ProtocolResult<HandshakeReport> {
        self.config.validate()?;

        let mut transport =
            Transport::connect(&self.config.host, self.config.port, self.config.connect_timeout)
                .await?
                .with_timeouts(self.config.io_timeout, self.config.io_timeout);
        info!("Connected to {}:{}", self.config.host, self.config.port);

        let result = self.exchange(&mut transport).await;
        if let Some(stats) = transport.stats() {
            debug!("{}", stats);
        }
        close(&mut transport).await;
        result
    }

    /// Run one handshake over an established transport, then close it
    pub async fn run_on<S>(&self, mut transport: Transport<S>) -> ProtocolResult<HandshakeReport>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.config.validate()?;
        let result = self.exchange(&mut transport).await;
        close(&mut transport).await;
        result
    }

    async fn exchange<S>(&self, transport: &mut Transport<S>) -> ProtocolResult<HandshakeReport>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let corruption = self.config.corruption;
        let framing = self.config.ciphertext_framing;

        let mut public = read_public_key(transport).await?;
        debug!("received public key ({} bytes)", PK_LEN);

        let pk_index = corruption.apply_to_public_key(&mut public);
        if let Some(i) = pk_index {
            info!("Corrupted public key byte {} before encapsulation", i);
        }

        let (ciphertext, local) = self.kem.encapsulate(&public)?;

        // Only the transmitted copy is tampered with; `local` stays as derived.
        let mut outgoing = ciphertext.clone();
        let ct_index = corruption.apply_to_ciphertext(&mut outgoing);
        if let Some(i) = ct_index {
            info!("Corrupted ciphertext byte {} before sending", i);
        }

        write_ciphertext(transport, &outgoing, framing).await?;
        debug!(%framing, "ciphertext sent");

        let remote = read_shared_secret(transport).await?;
        Ok(compare(&local, &remote, corruption, pk_index.or(ct_index), framing))
    }
}

async fn close<S>(transport: &mut Transport<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(e) = transport.shutdown().await {
        debug!("shutdown after handshake: {}", e);
    }
}

fn compare(
    local: &SharedSecret,
    remote: &SharedSecret,
    corruption: CorruptionSpec,
    corrupted_index: Option<usize>,
    framing: CiphertextFraming,
) -> HandshakeReport {
    let outcome = if local.ct_eq(remote) {
        Outcome::Match
    } else {
        Outcome::Mismatch
    };
    debug!(local = %local.fingerprint(), peer = %remote.fingerprint(), %outcome, "secrets compared");

    HandshakeReport {
        outcome,
        local_fingerprint: local.fingerprint(),
        peer_fingerprint: remote.fingerprint(),
        corruption,
        corrupted_index,
        framing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConcurrencyMode, ConnectionConfig, ListenConfig, ServerConfig};
    use crate::crypto::testing::{FailingDecapKem, XorKem};
    use crate::crypto::MlKem768Kem;
    use crate::error::MessageKind;
    use crate::responder::Responder;
    use std::sync::Arc;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn loopback_server_config(max_connections: u64) -> ServerConfig {
        ServerConfig {
            listen: ListenConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
            },
            connection: ConnectionConfig {
                concurrency: ConcurrencyMode::Serial,
                max_connections: Some(max_connections),
                read_timeout_secs: Some(10),
                write_timeout_secs: Some(10),
            },
        }
    }

    fn client_config(port: u16, framing: CiphertextFraming, corruption: CorruptionSpec) -> InitiatorConfig {
        InitiatorConfig {
            port,
            ciphertext_framing: framing,
            corruption,
            ..InitiatorConfig::default()
        }
    }

    async fn run_against_responder<K: Kem + 'static>(
        kem: K,
        framing: CiphertextFraming,
        corruption: CorruptionSpec,
    ) -> ProtocolResult<HandshakeReport> {
        let responder = Responder::bind(loopback_server_config(1), kem).await.unwrap();
        let port = responder.local_addr().port();
        let server = tokio::spawn(async move { responder.run().await });

        let result = Initiator::new(client_config(port, framing, corruption), MlKem768Kem)
            .run()
            .await;
        server.await.unwrap();
        result
    }

    #[test]
    fn test_corruption_index_wraps() {
        let mut ct = Ciphertext([0u8; CT_LEN]);
        let corruption = CorruptionSpec::new(CorruptionTarget::Ciphertext, CT_LEN + 5);
        assert_eq!(corruption.apply_to_ciphertext(&mut ct), Some(5));
        assert_eq!(ct.as_bytes()[5], 0x01);

        let mut pk = PublicKey([0xFFu8; PK_LEN]);
        assert_eq!(corruption.apply_to_public_key(&mut pk), None);
        let corruption = CorruptionSpec::new(CorruptionTarget::PublicKey, 2 * PK_LEN);
        assert_eq!(corruption.apply_to_public_key(&mut pk), Some(0));
        assert_eq!(pk.as_bytes()[0], 0xFE);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(Outcome::Match.exit_code(), 0);
        assert_eq!(Outcome::Mismatch.exit_code(), 3);
        let err = ProtocolError::ShortRead {
            expected: 32,
            received: 0,
        };
        assert_eq!(exit_code_for_error(&err), 1);
        let err = ProtocolError::Timeout(Duration::from_secs(1));
        assert_eq!(exit_code_for_error(&err), 1);
        let err = ProtocolError::Config("bad".to_string());
        assert_eq!(exit_code_for_error(&err), 2);
    }

    #[test]
    fn test_zero_timeouts_are_invalid() {
        assert!(InitiatorConfig::default().validate().is_ok());

        let config = InitiatorConfig {
            io_timeout: Some(Duration::ZERO),
            ..InitiatorConfig::default()
        };
        assert!(matches!(config.validate(), Err(ProtocolError::Config(_))));

        let config = InitiatorConfig {
            connect_timeout: Some(Duration::ZERO),
            ..InitiatorConfig::default()
        };
        assert!(matches!(config.validate(), Err(ProtocolError::Config(_))));

        let config = InitiatorConfig {
            connect_timeout: None,
            io_timeout: None,
            ..InitiatorConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_zero_timeout_fails_as_usage_error_before_connecting() {
        let listener = crate::transport::TransportListener::bind("127.0.0.1:0")
            .await
            .unwrap();
        let config = InitiatorConfig {
            port: listener.local_addr().port(),
            connect_timeout: Some(Duration::ZERO),
            io_timeout: Some(Duration::ZERO),
            ..InitiatorConfig::default()
        };

        let err = Initiator::new(config, MlKem768Kem).run().await.unwrap_err();
        assert!(matches!(err, ProtocolError::Config(_)));
        assert_eq!(exit_code_for_error(&err), EXIT_USAGE);
    }

    #[tokio::test]
    async fn test_public_key_short_read() {
        let (a, mut b) = duplex(8192);
        let initiator = Initiator::new(InitiatorConfig::default(), XorKem::default());
        let client = tokio::spawn(async move { initiator.run_on(Transport::new(a)).await });

        // Valid prefix, then only three payload bytes before the close.
        b.write_all(&[0x04, 0xA0, 1, 2, 3]).await.unwrap();
        drop(b);

        let err = client.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::ShortRead {
                expected: PK_LEN,
                received: 3
            }
        ));
        assert_eq!(err.category(), "short-read");
        assert_eq!(exit_code_for_error(&err), EXIT_FAILURE);
    }

    #[tokio::test]
    async fn test_match_without_header() {
        let report = run_against_responder(MlKem768Kem, CiphertextFraming::Bare, CorruptionSpec::none())
            .await
            .unwrap();
        assert_eq!(report.outcome, Outcome::Match);
        assert_eq!(report.local_fingerprint, report.peer_fingerprint);
        assert_eq!(report.corrupted_index, None);
    }

    #[tokio::test]
    async fn test_match_with_header() {
        let report = run_against_responder(MlKem768Kem, CiphertextFraming::Prefixed, CorruptionSpec::none())
            .await
            .unwrap();
        assert_eq!(report.outcome, Outcome::Match);
        assert_eq!(report.framing, CiphertextFraming::Prefixed);
    }

    #[tokio::test]
    async fn test_ciphertext_corruption_is_a_mismatch() {
        let corruption = CorruptionSpec::new(CorruptionTarget::Ciphertext, 10);
        let report = run_against_responder(MlKem768Kem, CiphertextFraming::Bare, corruption)
            .await
            .unwrap();
        assert_eq!(report.outcome, Outcome::Mismatch);
        assert_eq!(report.corrupted_index, Some(10));
        assert!(report.mismatch_was_induced());
        assert_eq!(report.outcome.exit_code(), 3);
    }

    #[tokio::test]
    async fn test_public_key_corruption_is_a_mismatch() {
        let corruption = CorruptionSpec::new(CorruptionTarget::PublicKey, 0);
        let report = run_against_responder(MlKem768Kem, CiphertextFraming::Prefixed, corruption)
            .await
            .unwrap();
        assert_eq!(report.outcome, Outcome::Mismatch);
        assert_eq!(report.corrupted_index, Some(0));
    }

    #[tokio::test]
    async fn test_decapsulation_failure_is_short_read_not_mismatch() {
        let err = run_against_responder(FailingDecapKem, CiphertextFraming::Bare, CorruptionSpec::none())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::ShortRead {
                expected: 32,
                received: 0
            }
        ));
        assert_eq!(exit_code_for_error(&err), 1);
    }

    #[tokio::test]
    async fn test_wrong_public_key_prefix_aborts_before_sending() {
        let (a, mut b) = duplex(8192);
        let initiator = Initiator::new(InitiatorConfig::default(), XorKem::default());
        let client = tokio::spawn(async move { initiator.run_on(Transport::new(a)).await });

        let mut message = vec![0u8; 2 + PK_LEN];
        message[..2].copy_from_slice(&1000u16.to_be_bytes());
        b.write_all(&message).await.unwrap();

        let err = client.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Framing {
                message: MessageKind::PublicKey,
                declared: 1000,
                expected: PK_LEN
            }
        ));

        // The initiator only shut down its side; nothing else arrived.
        let mut rest = Vec::new();
        b.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_same_ciphertext_bytes_same_outcome_either_framing() {
        // Deterministic KEM: both framings carry identical ciphertext bytes.
        let kem = Arc::new(XorKem { seed: 9 });
        let keypair = Arc::new(kem.keypair().unwrap());
        let mut fingerprints = Vec::new();

        for framing in [CiphertextFraming::Bare, CiphertextFraming::Prefixed] {
            let (a, b) = duplex(8192);
            let handler = crate::handshake::ResponderHandshake::new(keypair.clone(), kem.clone());
            let server = tokio::spawn(handler.run(Transport::new(b), None));

            let config = InitiatorConfig {
                ciphertext_framing: framing,
                ..InitiatorConfig::default()
            };
            let report = Initiator::new(config, XorKem { seed: 9 })
                .run_on(Transport::new(a))
                .await
                .unwrap();
            assert_eq!(report.outcome, Outcome::Match);

            let summary = server.await.unwrap().result.unwrap();
            assert_eq!(summary.ciphertext_framing, framing);
            fingerprints.push(summary.secret_fingerprint);
        }
        assert_eq!(fingerprints[0], fingerprints[1]);
    }
}
