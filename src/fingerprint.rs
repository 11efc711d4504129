//! # Digests and Fingerprints
//!
//! Three hashes are derived from a token:
//!
//! - **core digest**: every identity field, in a fixed order. The token type
//!   and the attribute block are not part of it, so a token may change role
//!   without changing its core signature.
//! - **attribute digest**: the raw attribute block chained to the core
//!   signature, so an attribute block cannot be moved to another token.
//! - **fingerprint**: `H(core_digest || signature [|| attribute_digest])`,
//!   the token's address in the identifier space.
//!
//! Text fields are length-prefixed so that field boundaries are unambiguous.

use std::sync::PoisonError;

use crate::crypto::{
    ATTRIBUTE_DIGEST_DOMAIN, CORE_DIGEST_DOMAIN, FINGERPRINT_DOMAIN, domain_hasher,
};
use crate::identity::{Fingerprint, PUBLIC_KEY_LEN, SIGNATURE_LEN};
use crate::token::Token;

/// A 32-byte BLAKE3 digest.
pub type Digest = [u8; 32];

fn update_str(hasher: &mut blake3::Hasher, field: &str) {
    hasher.update(&(field.len() as u32).to_le_bytes());
    hasher.update(field.as_bytes());
}

/// Digest over an attribute block chained to the core signature it belongs to.
pub(crate) fn digest_attribute_block(block: &[u8], core_signature: &[u8; SIGNATURE_LEN]) -> Digest {
    let mut hasher = domain_hasher(ATTRIBUTE_DIGEST_DOMAIN);
    hasher.update(&(block.len() as u32).to_le_bytes());
    hasher.update(block);
    hasher.update(core_signature);
    *hasher.finalize().as_bytes()
}

impl Token {
    /// Digest over uuid, realm, issuer, subject, audience, public key,
    /// expires_at, issued_at and not_before, in that order.
    pub fn core_digest(&self) -> Digest {
        let mut hasher = domain_hasher(CORE_DIGEST_DOMAIN);
        update_str(&mut hasher, &self.uuid);
        update_str(&mut hasher, &self.realm);
        update_str(&mut hasher, &self.issuer);
        update_str(&mut hasher, &self.subject);
        update_str(&mut hasher, &self.audience);
        hasher.update(&self.public_key.unwrap_or([0u8; PUBLIC_KEY_LEN]));
        hasher.update(&self.expires_at.to_le_bytes());
        hasher.update(&self.issued_at.to_le_bytes());
        hasher.update(&self.not_before.to_le_bytes());
        *hasher.finalize().as_bytes()
    }

    pub fn attribute_digest(&self) -> Digest {
        let sealed = self.sealed.read().unwrap_or_else(PoisonError::into_inner);
        digest_attribute_block(sealed.store.as_bytes(), &self.signature)
    }

    /// Content address of this token.
    ///
    /// With `include_attributes == false` the fingerprint only depends on the
    /// core and its signature; it stays stable while attributes change and is
    /// the form used as the key-cache key and in `issuer` references.
    pub fn fingerprint(&self, include_attributes: bool) -> Fingerprint {
        let mut hasher = domain_hasher(FINGERPRINT_DOMAIN);
        hasher.update(&self.core_digest());
        hasher.update(&self.signature);
        if include_attributes {
            hasher.update(&self.attribute_digest());
        }
        Fingerprint::from(hasher.finalize())
    }
}
