//! # Cryptographic Infrastructure
//!
//! This module provides the primitives the token subsystem is built on:
//!
//! - **Digests**: domain-separated BLAKE3, 32 bytes
//! - **Signatures**: domain-separated detached Ed25519 signing and verification
//!
//! ## Security Properties
//!
//! - Only Ed25519 signatures are accepted, verified with `verify_strict`
//!   (rejects small-order keys and non-canonical signatures)
//! - Domain separation prevents a core signature from being replayed as an
//!   attribute signature or a co-signature, and vice versa

use ed25519_dalek::{Signature, VerifyingKey};

use crate::identity::{Keypair, PUBLIC_KEY_LEN, SIGNATURE_LEN};

// ============================================================================
// Signature Error Types
// ============================================================================

/// Error type for signature verification failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is missing (empty).
    Missing,
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    InvalidLength,
    /// Cryptographic verification failed.
    VerificationFailed,
    /// The public key is not a valid Ed25519 point.
    InvalidPublicKey,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for SignatureError {}

// ============================================================================
// Domain Separation Prefixes
// ============================================================================
//
// Every digest and signature kind gets its own prefix so that a value produced
// for one purpose can never verify for another.

/// Digest over a token's core identity fields.
pub const CORE_DIGEST_DOMAIN: &[u8] = b"aaatoken-core-v1:";

/// Digest over a token's attribute block chained to its core signature.
pub const ATTRIBUTE_DIGEST_DOMAIN: &[u8] = b"aaatoken-attributes-v1:";

/// Fingerprint (address) derivation.
pub const FINGERPRINT_DOMAIN: &[u8] = b"aaatoken-fingerprint-v1:";

/// Signature over the core digest.
pub const CORE_SIGNATURE_DOMAIN: &[u8] = b"aaatoken-sig-core-v1:";

/// Signature over the attribute digest.
pub const ATTRIBUTE_SIGNATURE_DOMAIN: &[u8] = b"aaatoken-sig-attributes-v1:";

/// Third-party co-signature over an existing core signature.
pub const COSIGN_SIGNATURE_DOMAIN: &[u8] = b"aaatoken-sig-cosign-v1:";

// ============================================================================
// Digest Helpers
// ============================================================================

/// Start a BLAKE3 hasher primed with a domain prefix.
#[inline]
pub fn domain_hasher(domain: &[u8]) -> blake3::Hasher {
    let mut hasher = blake3::Hasher::new();
    hasher.update(domain);
    hasher
}

// ============================================================================
// Domain-Separated Signature Helpers
// ============================================================================

/// Sign data with domain separation.
///
/// Prepends the domain prefix to the data before signing.
pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], data: &[u8]) -> [u8; SIGNATURE_LEN] {
    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);
    keypair.sign(&prefixed).to_bytes()
}

/// Verify a signature with domain separation.
///
/// Reconstructs the prefixed data and verifies the Ed25519 signature against
/// the raw public key.
pub fn verify_with_domain(
    public_key: &[u8; PUBLIC_KEY_LEN],
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    if signature.len() != SIGNATURE_LEN {
        return Err(SignatureError::InvalidLength);
    }

    let verifying_key =
        VerifyingKey::from_bytes(public_key).map_err(|_| SignatureError::InvalidPublicKey)?;

    let sig_bytes: [u8; SIGNATURE_LEN] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;
    let sig = Signature::from_bytes(&sig_bytes);

    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);

    verifying_key
        .verify_strict(&prefixed, &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}
