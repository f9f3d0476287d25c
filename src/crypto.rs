//! # KEM Capability
//!
//! The key-encapsulation primitive is consumed as a black box with three
//! operations and fixed-size outputs. [`Kem`] is the seam; [`MlKem768Kem`]
//! is the production implementation backed by the `ml-kem` crate.
//!
//! ## Security Considerations
//!
//! - Secret keys and shared secrets are zeroized on drop
//! - `Debug` output never prints key or secret material
//! - Shared secrets are compared in constant time

use std::fmt;

use ml_kem::kem::{Decapsulate, Encapsulate};
use ml_kem::{Ciphertext as MlKemCiphertext, Encoded, EncodedSizeUser, KemCore, MlKem768};
use rand::rngs::OsRng;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{KemOperation, ProtocolError, ProtocolResult};
use crate::{CT_LEN, PK_LEN, SK_LEN, SS_LEN};

type EncapsulationKey = <MlKem768 as KemCore>::EncapsulationKey;
type DecapsulationKey = <MlKem768 as KemCore>::DecapsulationKey;

/// Encapsulation key as sent on the wire
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey(pub [u8; PK_LEN]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; PK_LEN] {
        &self.0
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; PK_LEN] {
        &mut self.0
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}..)", hex::encode(&self.0[..4]))
    }
}

/// Decapsulation key; never leaves the responder process
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey(pub [u8; SK_LEN]);

impl SecretKey {
    pub fn as_bytes(&self) -> &[u8; SK_LEN] {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey(..)")
    }
}

/// Encapsulation output transmitted to the responder
#[derive(Clone, PartialEq, Eq)]
pub struct Ciphertext(pub [u8; CT_LEN]);

impl Ciphertext {
    pub fn as_bytes(&self) -> &[u8; CT_LEN] {
        &self.0
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; CT_LEN] {
        &mut self.0
    }
}

impl fmt::Debug for Ciphertext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ciphertext({}..)", hex::encode(&self.0[..4]))
    }
}

/// Secret derived independently by each side
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret(pub [u8; SS_LEN]);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; SS_LEN] {
        &self.0
    }

    /// First four bytes in hex, the only form in which secrets are logged
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Constant-time equality
    pub fn ct_eq(&self, other: &SharedSecret) -> bool {
        constant_time_eq::constant_time_eq_32(&self.0, &other.0)
    }
}

impl PartialEq for SharedSecret {
    fn eq(&self, other: &Self) -> bool {
        self.ct_eq(other)
    }
}

impl Eq for SharedSecret {}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedSecret({}..)", self.fingerprint())
    }
}

/// Long-lived responder key pair
///
/// Generated once, never mutated. Shared read-only between connection
/// handlers behind an `Arc`.
pub struct KeyPair {
    public: PublicKey,
    secret: SecretKey,
}

impl KeyPair {
    pub fn from_parts(public: PublicKey, secret: SecretKey) -> Self {
        Self { public, secret }
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    pub fn secret(&self) -> &SecretKey {
        &self.secret
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .field("secret", &self.secret)
            .finish()
    }
}

/// Black-box key-encapsulation capability
///
/// Implementations must be shareable across connection tasks.
pub trait Kem: Send + Sync {
    /// Generate a fresh key pair
    fn keypair(&self) -> ProtocolResult<KeyPair>;

    /// Encapsulate against `public`, producing the ciphertext and the local secret
    fn encapsulate(&self, public: &PublicKey) -> ProtocolResult<(Ciphertext, SharedSecret)>;

    /// Recover the shared secret from `ciphertext` with `secret`
    fn decapsulate(&self, ciphertext: &Ciphertext, secret: &SecretKey)
        -> ProtocolResult<SharedSecret>;
}

/// ML-KEM-768 (FIPS 203) backed by the `ml-kem` crate and the OS entropy source
#[derive(Debug, Clone, Copy, Default)]
pub struct MlKem768Kem;

impl MlKem768Kem {
    pub fn new() -> Self {
        Self
    }
}

fn copy_exact<const N: usize>(src: &[u8], operation: KemOperation, what: &str) -> ProtocolResult<[u8; N]> {
    src.try_into().map_err(|_| {
        ProtocolError::primitive(
            operation,
            format!("{} is {} bytes, expected {}", what, src.len(), N),
        )
    })
}

impl Kem for MlKem768Kem {
    fn keypair(&self) -> ProtocolResult<KeyPair> {
        let (dk, ek) = MlKem768::generate(&mut OsRng);

        // Startup size validation: the primitive's encodings must match the
        // protocol constants exactly.
        let public = copy_exact::<PK_LEN>(
            ek.as_bytes().as_slice(),
            KemOperation::KeyGeneration,
            "encapsulation key",
        )?;
        let mut dk_bytes = dk.as_bytes();
        let secret = copy_exact::<SK_LEN>(
            dk_bytes.as_slice(),
            KemOperation::KeyGeneration,
            "decapsulation key",
        );
        dk_bytes.as_mut_slice().zeroize();

        Ok(KeyPair::from_parts(PublicKey(public), SecretKey(secret?)))
    }

    fn encapsulate(&self, public: &PublicKey) -> ProtocolResult<(Ciphertext, SharedSecret)> {
        let encoded = Encoded::<EncapsulationKey>::try_from(&public.0[..]).map_err(|_| {
            ProtocolError::primitive(KemOperation::Encapsulation, "malformed encapsulation key")
        })?;
        let ek = EncapsulationKey::from_bytes(&encoded);

        let (ct, ss) = ek.encapsulate(&mut OsRng).map_err(|_| {
            ProtocolError::primitive(KemOperation::Encapsulation, "encapsulation rejected")
        })?;

        let ct = copy_exact::<CT_LEN>(ct.as_slice(), KemOperation::Encapsulation, "ciphertext")?;
        let ss = copy_exact::<SS_LEN>(ss.as_slice(), KemOperation::Encapsulation, "shared secret")?;
        Ok((Ciphertext(ct), SharedSecret(ss)))
    }

    fn decapsulate(
        &self,
        ciphertext: &Ciphertext,
        secret: &SecretKey,
    ) -> ProtocolResult<SharedSecret> {
        let mut encoded = Encoded::<DecapsulationKey>::try_from(&secret.0[..]).map_err(|_| {
            ProtocolError::primitive(KemOperation::Decapsulation, "malformed decapsulation key")
        })?;
        let dk = DecapsulationKey::from_bytes(&encoded);
        encoded.as_mut_slice().zeroize();

        let ct = MlKemCiphertext::<MlKem768>::try_from(&ciphertext.0[..]).map_err(|_| {
            ProtocolError::primitive(KemOperation::Decapsulation, "malformed ciphertext")
        })?;

        let ss = dk.decapsulate(&ct).map_err(|_| {
            ProtocolError::primitive(KemOperation::Decapsulation, "decapsulation rejected")
        })?;

        let ss = copy_exact::<SS_LEN>(ss.as_slice(), KemOperation::Decapsulation, "shared secret")?;
        Ok(SharedSecret(ss))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Deterministic stand-ins for the KEM capability.

    use super::*;

    /// Toy KEM: the secret key embeds the public key, the ciphertext is the
    /// secret XORed with a public-key-derived pad. Not secure; it only keeps
    /// the "tampering changes the secret" property that tests rely on.
    #[derive(Debug, Default)]
    pub struct XorKem {
        pub seed: u8,
    }

    fn pad(public: &[u8; PK_LEN]) -> [u8; CT_LEN] {
        let mut pad = [0u8; CT_LEN];
        for (i, b) in pad.iter_mut().enumerate() {
            *b = public[i % PK_LEN].wrapping_add(public[(i * 7 + 3) % PK_LEN]);
        }
        pad
    }

    fn derive(ct: &[u8; CT_LEN]) -> [u8; SS_LEN] {
        let mut ss = [0u8; SS_LEN];
        for (i, b) in ct.iter().enumerate() {
            let slot = &mut ss[i % SS_LEN];
            *slot = slot.rotate_left(3) ^ b.wrapping_mul(31).wrapping_add(i as u8);
        }
        ss
    }

    impl Kem for XorKem {
        fn keypair(&self) -> ProtocolResult<KeyPair> {
            let mut pk = [0u8; PK_LEN];
            for (i, b) in pk.iter_mut().enumerate() {
                *b = (i as u8).wrapping_mul(13).wrapping_add(self.seed);
            }
            let mut sk = [0u8; SK_LEN];
            sk[..PK_LEN].copy_from_slice(&pk);
            Ok(KeyPair::from_parts(PublicKey(pk), SecretKey(sk)))
        }

        fn encapsulate(&self, public: &PublicKey) -> ProtocolResult<(Ciphertext, SharedSecret)> {
            let mut plain = [0u8; CT_LEN];
            for (i, b) in plain.iter_mut().enumerate() {
                *b = (i as u8) ^ 0x5A;
            }
            let pad = pad(&public.0);
            let mut ct = [0u8; CT_LEN];
            for i in 0..CT_LEN {
                ct[i] = plain[i] ^ pad[i];
            }
            Ok((Ciphertext(ct), SharedSecret(derive(&plain))))
        }

        fn decapsulate(
            &self,
            ciphertext: &Ciphertext,
            secret: &SecretKey,
        ) -> ProtocolResult<SharedSecret> {
            let mut public = [0u8; PK_LEN];
            public.copy_from_slice(&secret.0[..PK_LEN]);
            let pad = pad(&public);
            let mut plain = [0u8; CT_LEN];
            for i in 0..CT_LEN {
                plain[i] = ciphertext.0[i] ^ pad[i];
            }
            Ok(SharedSecret(derive(&plain)))
        }
    }

    /// Delegates to ML-KEM-768 but fails every decapsulation
    #[derive(Debug, Default)]
    pub struct FailingDecapKem;

    impl Kem for FailingDecapKem {
        fn keypair(&self) -> ProtocolResult<KeyPair> {
            MlKem768Kem.keypair()
        }

        fn encapsulate(&self, public: &PublicKey) -> ProtocolResult<(Ciphertext, SharedSecret)> {
            MlKem768Kem.encapsulate(public)
        }

        fn decapsulate(&self, _: &Ciphertext, _: &SecretKey) -> ProtocolResult<SharedSecret> {
            Err(ProtocolError::primitive(
                KemOperation::Decapsulation,
                "injected failure",
            ))
        }
    }

    /// Fails key generation, modelling a broken entropy source
    #[derive(Debug, Default)]
    pub struct FailingKeygenKem;

    impl Kem for FailingKeygenKem {
        fn keypair(&self) -> ProtocolResult<KeyPair> {
            Err(ProtocolError::primitive(
                KemOperation::KeyGeneration,
                "entropy source unavailable",
            ))
        }

        fn encapsulate(&self, _: &PublicKey) -> ProtocolResult<(Ciphertext, SharedSecret)> {
            Err(ProtocolError::primitive(KemOperation::Encapsulation, "unused"))
        }

        fn decapsulate(&self, _: &Ciphertext, _: &SecretKey) -> ProtocolResult<SharedSecret> {
            Err(ProtocolError::primitive(KemOperation::Decapsulation, "unused"))
        }
    }
}
