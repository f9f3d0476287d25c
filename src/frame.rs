//! # Message Framing
//!
//! Byte layouts for the three handshake messages. All integers are
//! big-endian.
//!
//! ```text
//! Public key     +----------+------------------+
//!                | len (2)  | public key (1184)|   len always present, == 1184
//!                +----------+------------------+
//!
//! Ciphertext     +----------+------------------+
//!                | len (2)? | ciphertext (1088)|   len optional, == 1088 if present
//!                +----------+------------------+
//!
//! Shared secret  +------------------+
//!                | secret (32)      |            never prefixed
//!                +------------------+
//! ```
//!
//! ## Ciphertext prefix detection
//!
//! The receiver peeks at the first two pending bytes. If they read as
//! `CT_LEN` they are consumed as a header; otherwise they are the start of
//! the ciphertext. A bare ciphertext that happens to begin with `0x04 0x40`
//! is therefore misread as prefixed and comes out shifted by two bytes.
//! The wire format keeps this ambiguity for compatibility with existing
//! initiators.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::crypto::{Ciphertext, PublicKey, SharedSecret};
use crate::error::{MessageKind, ProtocolError, ProtocolResult};
use crate::transport::Transport;
use crate::{CT_LEN, LENGTH_PREFIX_LEN, PK_LEN, SS_LEN};

/// Public key message size on the wire
pub const PUBLIC_KEY_MESSAGE_LEN: usize = LENGTH_PREFIX_LEN + PK_LEN;

/// How the ciphertext message is (or was detected to be) framed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CiphertextFraming {
    /// Preceded by a 2-byte length header
    Prefixed,
    /// Raw ciphertext bytes only
    #[default]
    Bare,
}

impl CiphertextFraming {
    /// Total bytes this framing puts on the wire
    pub fn wire_len(self) -> usize {
        match self {
            Self::Prefixed => LENGTH_PREFIX_LEN + CT_LEN,
            Self::Bare => CT_LEN,
        }
    }
}

impl fmt::Display for CiphertextFraming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prefixed => write!(f, "prefixed"),
            Self::Bare => write!(f, "bare"),
        }
    }
}

/// Encode a big-endian length prefix
pub fn encode_length_prefix(len: usize) -> [u8; LENGTH_PREFIX_LEN] {
    (len as u16).to_be_bytes()
}

/// Decode a big-endian length prefix
pub fn decode_length_prefix(prefix: [u8; LENGTH_PREFIX_LEN]) -> u16 {
    u16::from_be_bytes(prefix)
}

/// Serialize the public key message
pub fn encode_public_key(public: &PublicKey) -> BytesMut {
    let mut buf = BytesMut::with_capacity(PUBLIC_KEY_MESSAGE_LEN);
    buf.put_u16(PK_LEN as u16);
    buf.put_slice(public.as_bytes());
    buf
}

/// Validate a received public key prefix
pub fn check_public_key_prefix(prefix: [u8; LENGTH_PREFIX_LEN]) -> ProtocolResult<()> {
    let declared = decode_length_prefix(prefix);
    if declared as usize != PK_LEN {
        return Err(ProtocolError::Framing {
            message: MessageKind::PublicKey,
            declared,
            expected: PK_LEN,
        });
    }
    Ok(())
}

/// Serialize the ciphertext message
pub fn encode_ciphertext(ciphertext: &Ciphertext, framing: CiphertextFraming) -> BytesMut {
    let mut buf = BytesMut::with_capacity(framing.wire_len());
    if framing == CiphertextFraming::Prefixed {
        buf.put_u16(CT_LEN as u16);
    }
    buf.put_slice(ciphertext.as_bytes());
    buf
}

/// Classify the first two pending bytes of a ciphertext message
pub fn detect_ciphertext_framing(peeked: [u8; LENGTH_PREFIX_LEN]) -> CiphertextFraming {
    if decode_length_prefix(peeked) as usize == CT_LEN {
        CiphertextFraming::Prefixed
    } else {
        CiphertextFraming::Bare
    }
}

/// Serialize the shared secret message
pub fn encode_shared_secret(secret: &SharedSecret) -> Bytes {
    Bytes::copy_from_slice(secret.as_bytes())
}

/// Send the public key message
pub async fn write_public_key<S>(transport: &mut Transport<S>, public: &PublicKey) -> ProtocolResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    transport.send_all(&encode_public_key(public)).await
}

/// Receive the public key message, verifying its mandatory prefix
///
/// A prefix mismatch aborts before the payload is read.
pub async fn read_public_key<S>(transport: &mut Transport<S>) -> ProtocolResult<PublicKey>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let prefix = transport.recv_array::<LENGTH_PREFIX_LEN>().await?;
    check_public_key_prefix(prefix)?;
    Ok(PublicKey(transport.recv_array::<PK_LEN>().await?))
}

/// Send the ciphertext message with the requested framing
pub async fn write_ciphertext<S>(
    transport: &mut Transport<S>,
    ciphertext: &Ciphertext,
    framing: CiphertextFraming,
) -> ProtocolResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    transport.send_all(&encode_ciphertext(ciphertext, framing)).await
}

/// Receive the ciphertext message, sniffing for the optional prefix
pub async fn read_ciphertext<S>(
    transport: &mut Transport<S>,
) -> ProtocolResult<(Ciphertext, CiphertextFraming)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut peeked = [0u8; LENGTH_PREFIX_LEN];
    peeked.copy_from_slice(transport.peek(LENGTH_PREFIX_LEN).await?);

    let framing = detect_ciphertext_framing(peeked);
    match framing {
        CiphertextFraming::Prefixed => {
            transport.consume(LENGTH_PREFIX_LEN);
            debug!(header = decode_length_prefix(peeked), "ciphertext: consumed 2-byte header");
        }
        CiphertextFraming::Bare => {
            debug!(peek = %hex_pair(peeked), "ciphertext: no header");
        }
    }

    Ok((Ciphertext(transport.recv_array::<CT_LEN>().await?), framing))
}

/// Send the shared secret message
pub async fn write_shared_secret<S>(
    transport: &mut Transport<S>,
    secret: &SharedSecret,
) -> ProtocolResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    transport.send_all(&encode_shared_secret(secret)).await
}

/// Receive the shared secret message
pub async fn read_shared_secret<S>(transport: &mut Transport<S>) -> ProtocolResult<SharedSecret>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    Ok(SharedSecret(transport.recv_array::<SS_LEN>().await?))
}

fn hex_pair(bytes: [u8; LENGTH_PREFIX_LEN]) -> String {
    format!("0x{:02x}{:02x}", bytes[0], bytes[1])
}
