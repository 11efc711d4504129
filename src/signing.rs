//! # Token Signing
//!
//! Core signatures, attribute signatures and third-party co-signatures.
//!
//! ## Security Invariants
//!
//! - The attribute block and its signature are only ever replaced together,
//!   under one write lock ([`Token::update_attributes`])
//! - A new core signature always refreshes the attribute signature, because the
//!   attribute digest chains to the core signature
//! - Signing without reachable key material is a programming error and panics
//!
//! A co-signature is stored as an attribute keyed by the signee's core-only
//! fingerprint (hex). Its value is `signee_public_key || signature`, where the
//! signature covers the token's existing core signature.

use std::sync::PoisonError;
use std::sync::atomic::Ordering;

use tracing::trace;

use crate::attributes::{AttributeError, AttributeStore, AttributeValue};
use crate::crypto::{
    ATTRIBUTE_SIGNATURE_DOMAIN, CORE_SIGNATURE_DOMAIN, COSIGN_SIGNATURE_DOMAIN, SignatureError,
    sign_with_domain, verify_with_domain,
};
use crate::fingerprint::digest_attribute_block;
use crate::identity::{Fingerprint, Keypair, PUBLIC_KEY_LEN, SIGNATURE_LEN};
use crate::token::{Scope, Token};

/// Length of a stored co-signature: public key followed by signature.
pub const COSIGNATURE_LEN: usize = PUBLIC_KEY_LEN + SIGNATURE_LEN;

fn sign_block(
    keypair: &Keypair,
    store: &AttributeStore,
    core_signature: &[u8; SIGNATURE_LEN],
) -> [u8; SIGNATURE_LEN] {
    let digest = digest_attribute_block(store.as_bytes(), core_signature);
    sign_with_domain(keypair, ATTRIBUTE_SIGNATURE_DOMAIN, &digest)
}

impl Token {
    fn attribute_signer(&self) -> &Keypair {
        match (self.scope(), self.signing_keypair()) {
            (Scope::Private | Scope::PrivateAvailable, Some(keypair)) => keypair,
            (scope, _) => panic!(
                "token ({}) with scope {scope:?} cannot sign its attributes",
                self.uuid
            ),
        }
    }

    /// Sign the core digest with the token's own or its issuer's private key,
    /// then refresh the attribute signature.
    ///
    /// # Panics
    /// If no private key is reachable.
    pub fn sign_self(&mut self) {
        let Some(keypair) = self.signing_keypair().cloned() else {
            panic!("token ({}) has no private key to sign with", self.uuid);
        };

        let digest = self.core_digest();
        self.signature = sign_with_domain(&keypair, CORE_SIGNATURE_DOMAIN, &digest);
        self.signature_verified.store(false, Ordering::Release);

        let core_signature = self.signature;
        let sealed = self.sealed_mut();
        let signature = sign_block(&keypair, &sealed.store, &core_signature);
        sealed.signature = Some(signature);
        self.attributes_signature_verified.store(false, Ordering::Release);

        trace!(uuid = %self.uuid, "signed token");
    }

    /// Recompute the attribute signature over the current block.
    ///
    /// # Panics
    /// If the token's scope is above [`Scope::PrivateAvailable`].
    pub fn sign_attributes(&self) {
        let keypair = self.attribute_signer();
        let mut sealed = self.sealed.write().unwrap_or_else(PoisonError::into_inner);
        let signature = sign_block(keypair, &sealed.store, &self.signature);
        sealed.signature = Some(signature);
    }

    /// Mutate the attribute block and re-sign it as one critical section.
    ///
    /// `f` works on a copy; if it fails, the token is left untouched. No
    /// reader ever observes a block without its matching signature.
    ///
    /// # Panics
    /// If the token's scope is above [`Scope::PrivateAvailable`].
    pub fn update_attributes<R>(
        &self,
        f: impl FnOnce(&mut AttributeStore) -> Result<R, AttributeError>,
    ) -> Result<R, AttributeError> {
        let keypair = self.attribute_signer();
        let mut sealed = self.sealed.write().unwrap_or_else(PoisonError::into_inner);

        let mut next = sealed.store.clone();
        let out = f(&mut next)?;
        let signature = sign_block(keypair, &next, &self.signature);
        sealed.store = next;
        sealed.signature = Some(signature);
        self.attributes_signature_verified.store(false, Ordering::Release);
        Ok(out)
    }

    /// Attach `signee`'s co-signature over this token's core signature.
    ///
    /// # Panics
    /// If `signee`'s core-only fingerprint is not this token's issuer, if
    /// `signee` holds no private key, or if this token cannot re-sign its
    /// attributes.
    pub fn co_sign(&self, signee: &Token) -> Result<(), AttributeError> {
        let signee_fp = signee.fingerprint(false).to_hex();
        assert_eq!(
            signee_fp, self.issuer,
            "co-signee is not the issuer of token ({})",
            self.uuid
        );
        let Some(keypair) = signee.signing_keypair() else {
            panic!("co-signee ({}) has no private key", signee.uuid);
        };

        let signature = sign_with_domain(keypair, COSIGN_SIGNATURE_DOMAIN, &self.signature);
        let mut value = Vec::with_capacity(COSIGNATURE_LEN);
        value.extend_from_slice(&keypair.public_key_bytes());
        value.extend_from_slice(&signature);

        self.update_attributes(|store| store.set(&signee_fp, AttributeValue::Bin(value)))?;
        trace!(uuid = %self.uuid, signee = %signee_fp, "co-signed token");
        Ok(())
    }

    /// Check the co-signature stored under `signee` against this token's
    /// current core signature.
    pub fn verify_co_signature(&self, signee: &Fingerprint) -> Result<(), SignatureError> {
        let value = self
            .attributes()
            .get_bin(&signee.to_hex())
            .ok_or(SignatureError::Missing)?;
        if value.len() != COSIGNATURE_LEN {
            return Err(SignatureError::InvalidLength);
        }
        let (public_key, signature) = value.split_at(PUBLIC_KEY_LEN);
        let public_key: [u8; PUBLIC_KEY_LEN] = public_key
            .try_into()
            .map_err(|_| SignatureError::InvalidLength)?;
        verify_with_domain(&public_key, COSIGN_SIGNATURE_DOMAIN, &self.signature, signature)
    }
}
