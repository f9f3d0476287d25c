//! # ML-KEM Handshake over TCP
//!
//! This crate implements a post-quantum key-encapsulation handshake:
//! - A responder that owns one long-lived ML-KEM-768 key pair
//! - An initiator harness with deliberate corruption for negative testing
//! - Fixed-size framing with an optional, sniffed ciphertext length prefix
//! - Reliable exact-length stream I/O with non-consuming look-ahead
//!
//! ## Protocol Overview
//!
//! ```text
//! Initiator                                 Responder
//!   |                                           |
//!   |<------ [u16 = 1184][public key] ----------|
//!   |                                           |
//!   |  encapsulate(pk) -> (ct, ss)              |
//!   |                                           |
//!   |------- [u16 = 1088]?[ciphertext] -------->|
//!   |                                           |  decapsulate(ct, sk) -> ss'
//!   |<------ [shared secret, 32 bytes] ---------|
//!   |                                           |
//!   |  compare ss == ss'                      close
//! ```
//!
//! ## Security Properties
//!
//! - The responder's public key is not authenticated
//! - A tampered ciphertext decapsulates to a different secret, it is not rejected
//! - Secrets are zeroized on drop and compared in constant time

pub mod config;
pub mod crypto;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod initiator;
pub mod responder;
pub mod transport;

pub use config::*;
pub use crypto::*;
pub use error::*;
pub use frame::*;
pub use handshake::*;
pub use initiator::*;
pub use responder::*;
pub use transport::*;

/// ML-KEM-768 encapsulation (public) key size
pub const PK_LEN: usize = 1184;

/// ML-KEM-768 decapsulation (secret) key size
pub const SK_LEN: usize = 2400;

/// ML-KEM-768 ciphertext size
pub const CT_LEN: usize = 1088;

/// Shared secret size
pub const SS_LEN: usize = 32;

/// Size of a big-endian length prefix
pub const LENGTH_PREFIX_LEN: usize = 2;

/// Default responder TCP port
pub const DEFAULT_PORT: u16 = 8081;

// Prefixed lengths travel as u16.
const _: () = assert!(PK_LEN <= u16::MAX as usize);
const _: () = assert!(CT_LEN <= u16::MAX as usize);
const _: () = assert!(PK_LEN != CT_LEN);
