//! # Token Validation
//!
//! Validation runs a fixed sequence of checkpoints and stops at the first
//! failure:
//!
//! 1. type (bitmask inclusion)
//! 2. expiry
//! 3. core signature (received tokens only, cached once verified)
//! 4. attribute signature (received tokens only, cached once verified)
//!
//! The verification caches are dropped whenever a core field is changed.
//! 5. impersonation (node tokens only, against the key cache)
//! 6. message threshold (message-intent tokens only)
//!
//! Success sets [`TokenState::VALID`]; any failure clears it and leaves the
//! other state bits alone. The [`InvalidReason`] returned tells the caller
//! which recovery applies.
//!
//! Self-issued tokens (scope private or private-available) skip the signature
//! checks: this process produced those signatures itself.

use std::sync::PoisonError;
use std::sync::atomic::Ordering;

use tracing::{debug, warn};

use crate::cache::KeyCache;
use crate::crypto::{ATTRIBUTE_SIGNATURE_DOMAIN, CORE_SIGNATURE_DOMAIN, verify_with_domain};
use crate::fingerprint::digest_attribute_block;
use crate::identity::now_secs;
use crate::token::{MAX_THRESHOLD_KEY, MSG_THRESHOLD_KEY, Scope, Token, TokenState, TokenType};

/// Why a token failed validation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InvalidReason {
    WrongType { expected: TokenType, actual: TokenType },
    Expired { expires_at: f64, now: f64 },
    BadSignature,
    BadAttributeSignature,
    Impersonation,
    ThresholdExceeded { msg_threshold: u32, max_threshold: u32 },
}

/// What a caller should do with a token that failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Request or issue a fresh token.
    Refresh,
    /// Raise a security alert and drop the connection.
    Alert,
    /// Drop the token. Retrying cannot succeed.
    Discard,
}

impl InvalidReason {
    pub fn recovery(&self) -> Recovery {
        match self {
            InvalidReason::Expired { .. } | InvalidReason::ThresholdExceeded { .. } => {
                Recovery::Refresh
            }
            InvalidReason::Impersonation => Recovery::Alert,
            InvalidReason::WrongType { .. }
            | InvalidReason::BadSignature
            | InvalidReason::BadAttributeSignature => Recovery::Discard,
        }
    }

    /// Short checkpoint name for logs and metrics labels.
    pub fn checkpoint(&self) -> &'static str {
        match self {
            InvalidReason::WrongType { .. } => "type",
            InvalidReason::Expired { .. } => "expiry",
            InvalidReason::BadSignature => "signature",
            InvalidReason::BadAttributeSignature => "attribute_signature",
            InvalidReason::Impersonation => "impersonation",
            InvalidReason::ThresholdExceeded { .. } => "threshold",
        }
    }
}

impl std::fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidReason::WrongType { expected, actual } => {
                write!(f, "wrong token type: expected {expected}, got {actual}")
            }
            InvalidReason::Expired { expires_at, now } => {
                write!(f, "token expired at {expires_at:.3} (now {now:.3})")
            }
            InvalidReason::BadSignature => write!(f, "core signature verification failed"),
            InvalidReason::BadAttributeSignature => {
                write!(f, "attribute signature verification failed")
            }
            InvalidReason::Impersonation => {
                write!(f, "fingerprint is pinned to a different public key")
            }
            InvalidReason::ThresholdExceeded {
                msg_threshold,
                max_threshold,
            } => write!(f, "message threshold exceeded: {msg_threshold} > {max_threshold}"),
        }
    }
}

impl std::error::Error for InvalidReason {}

impl Token {
    /// Validate against the current clock.
    pub fn validate(&self, expected: TokenType, cache: &dyn KeyCache) -> Result<(), InvalidReason> {
        self.validate_at(expected, cache, now_secs())
    }

    /// Validate against an explicit clock reading.
    pub fn validate_at(
        &self,
        expected: TokenType,
        cache: &dyn KeyCache,
        now: f64,
    ) -> Result<(), InvalidReason> {
        match self.run_checkpoints(expected, cache, now) {
            Ok(()) => {
                self.set_state_bits(TokenState::VALID);
                debug!(uuid = %self.uuid, subject = %self.subject, "token is valid");
                Ok(())
            }
            Err(reason) => {
                self.clear_state_bits(TokenState::VALID);
                if reason == InvalidReason::Impersonation {
                    warn!(
                        uuid = %self.uuid,
                        subject = %self.subject,
                        security = true,
                        "token rejected: {reason}"
                    );
                } else {
                    warn!(
                        uuid = %self.uuid,
                        subject = %self.subject,
                        checkpoint = reason.checkpoint(),
                        "token rejected: {reason}"
                    );
                }
                Err(reason)
            }
        }
    }

    fn run_checkpoints(
        &self,
        expected: TokenType,
        cache: &dyn KeyCache,
        now: f64,
    ) -> Result<(), InvalidReason> {
        if !self.token_type.contains(expected) {
            return Err(InvalidReason::WrongType {
                expected,
                actual: self.token_type,
            });
        }

        // NaN on either side counts as expired.
        if now.partial_cmp(&self.expires_at).is_none_or(|o| o.is_gt()) {
            return Err(InvalidReason::Expired {
                expires_at: self.expires_at,
                now,
            });
        }

        if self.scope() > Scope::PrivateAvailable {
            self.check_core_signature()?;
            self.check_attribute_signature()?;
        }

        if self.token_type.is_node() {
            self.check_impersonation(cache)?;
        }

        if self.token_type.is_message_intent() {
            self.check_threshold()?;
        }

        Ok(())
    }

    fn check_core_signature(&self) -> Result<(), InvalidReason> {
        if self.signature_verified.load(Ordering::Acquire) {
            return Ok(());
        }
        let public_key = self.public_key.ok_or(InvalidReason::BadSignature)?;
        verify_with_domain(&public_key, CORE_SIGNATURE_DOMAIN, &self.core_digest(), &self.signature)
            .map_err(|_| InvalidReason::BadSignature)?;
        self.signature_verified.store(true, Ordering::Release);
        Ok(())
    }

    fn check_attribute_signature(&self) -> Result<(), InvalidReason> {
        if self.attributes_signature_verified.load(Ordering::Acquire) {
            return Ok(());
        }
        let public_key = self.public_key.ok_or(InvalidReason::BadAttributeSignature)?;

        // Block and signature are read under one guard so a concurrent update
        // cannot pair one with the other's predecessor.
        let sealed = self.sealed.read().unwrap_or_else(PoisonError::into_inner);
        let signature = sealed.signature.ok_or(InvalidReason::BadAttributeSignature)?;
        let digest = digest_attribute_block(sealed.store.as_bytes(), &self.signature);
        verify_with_domain(&public_key, ATTRIBUTE_SIGNATURE_DOMAIN, &digest, &signature)
            .map_err(|_| InvalidReason::BadAttributeSignature)?;
        self.attributes_signature_verified.store(true, Ordering::Release);
        Ok(())
    }

    fn check_impersonation(&self, cache: &dyn KeyCache) -> Result<(), InvalidReason> {
        let fingerprint = self.fingerprint(false);
        let Some(known) = cache.lookup(&fingerprint) else {
            return Ok(());
        };
        if !std::ptr::eq(known.as_ref(), self)
            && known.token_type().is_handshake()
            && known.public_key() != self.public_key()
        {
            return Err(InvalidReason::Impersonation);
        }
        Ok(())
    }

    fn check_threshold(&self) -> Result<(), InvalidReason> {
        let attributes = self.attributes();
        match (
            attributes.get_u32(MAX_THRESHOLD_KEY),
            attributes.get_u32(MSG_THRESHOLD_KEY),
        ) {
            (Some(max_threshold), Some(msg_threshold)) => {
                if msg_threshold > max_threshold {
                    return Err(InvalidReason::ThresholdExceeded {
                        msg_threshold,
                        max_threshold,
                    });
                }
                Ok(())
            }
            _ => {
                warn!(
                    uuid = %self.uuid,
                    subject = %self.subject,
                    "message intent carries no usable threshold attributes"
                );
                Ok(())
            }
        }
    }
}
