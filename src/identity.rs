//! # Keys, Fingerprints and Time
//!
//! This module defines the primitive identity types every token is built from:
//!
//! - [`Keypair`]: Ed25519 signing keypair (secret seed + public key)
//! - [`Fingerprint`]: 32-byte content-derived digest, the token's address in the
//!   distributed identifier space
//! - [`now_secs`]: the verifier clock, seconds since the Unix epoch as `f64`
//!
//! ## Fingerprints vs. Public Keys
//!
//! Unlike a plain peer identity, a token's address is NOT its public key. The
//! same key may back many tokens (node, handshake, message intents), so the
//! address is derived from the full token content instead. See
//! [`crate::fingerprint`] for how it is computed.
//!
//! ## Security Invariants
//!
//! - P1: `Fingerprint::from_hex(fp.to_hex()) == fp`
//! - P2: Secret key bytes never appear in `Debug` output

use ed25519_dalek::{Signature, Signer, SigningKey};
use rand::rngs::OsRng;
use std::time::{SystemTime, UNIX_EPOCH};

/// Length of an Ed25519 public key.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Length of an Ed25519 secret seed.
pub const SECRET_KEY_LEN: usize = 32;

/// Length of a detached Ed25519 signature.
pub const SIGNATURE_LEN: usize = 64;

/// Length of a fingerprint / digest.
pub const FINGERPRINT_LEN: usize = 32;

/// Current time as (fractional) seconds since the Unix epoch.
///
/// Token timestamps travel as doubles on the wire, so the clock is kept in
/// the same unit to avoid lossy conversions at comparison time.
#[inline]
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; SECRET_KEY_LEN]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn secret_key_bytes(&self) -> [u8; SECRET_KEY_LEN] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &hex::encode(self.public_key_bytes()))
            .finish_non_exhaustive()
    }
}

/// Content-derived address of a token.
///
/// Fingerprints are used as map keys (key cache, routing) and are never secret.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    #[inline]
    pub fn from_bytes(bytes: [u8; FINGERPRINT_LEN]) -> Self {
        Self(bytes)
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != FINGERPRINT_LEN {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; FINGERPRINT_LEN];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<blake3::Hash> for Fingerprint {
    fn from(hash: blake3::Hash) -> Self {
        Self(*hash.as_bytes())
    }
}
