//! # aaatoken - Signed Trust Tokens
//!
//! aaatoken implements the trust token at the core of a mesh node's
//! authentication, authorization and accounting (AAA) layer:
//!
//! - **Tokens**: one signed structure for node identities, application
//!   identities, handshakes and message intents
//! - **Attributes**: a bounded, typed key/value block with its own signature
//! - **Fingerprints**: content-derived 32-byte addresses in the identifier space
//! - **Validation**: a checkpointed state machine reporting why a token failed
//! - **Export/Import**: moving an owned identity, private key included, between
//!   processes
//!
//! ## Security Model
//!
//! - Ed25519 signatures, domain-separated per purpose, verified strictly
//! - The core signature covers the identity fields; the attribute signature
//!   covers the attribute block chained to the core signature
//! - Received tokens are always re-verified; verification results are cached
//!   per token, never carried across processes
//! - A node fingerprint pinned to a key by an earlier handshake cannot be
//!   claimed by another key
//! - All decoders are size-bounded
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `token` | `Token` structure, lifecycle, encode/decode, export/import |
//! | `attributes` | Bounded attribute block |
//! | `fingerprint` | Core digest, attribute digest, fingerprint |
//! | `signing` | Core, attribute and co-signatures |
//! | `validate` | Validation checkpoints and failure reasons |
//! | `cache` | Key cache consulted for impersonation checks |
//! | `document` | Generic wire document and its bincode encoding |
//! | `identity` | Keypairs, fingerprints, clock |
//! | `crypto` | Domain-separated digests and signatures |
//! | `config` | Token issuance configuration |

mod attributes;
mod cache;
mod config;
mod crypto;
mod document;
mod fingerprint;
mod identity;
mod signing;
mod token;
mod validate;

pub use attributes::{
    ATTRIBUTE_BLOCK_CAPACITY, AttributeError, AttributeStore, AttributeType, AttributeValue,
    MAX_ATTRIBUTE_KEY_LEN,
};
pub use cache::{KEY_CACHE_MAX_ENTRIES, KeyCache, MemoryKeyCache, NoKeyCache};
pub use config::{ConfigError, DEFAULT_MAX_LIFETIME, DEFAULT_MIN_LIFETIME, TokenConfig};
pub use crypto::SignatureError;
pub use document::{Document, MAX_DOCUMENT_SIZE, Value};
pub use fingerprint::Digest;
pub use identity::{Fingerprint, Keypair, PUBLIC_KEY_LEN, SIGNATURE_LEN, now_secs};
pub use signing::COSIGNATURE_LEN;
pub use token::{
    DecodeError, FieldTooLong, MAX_FIELD_LEN, MAX_ISSUER_LEN, MAX_THRESHOLD_KEY, MAX_UUID_LEN,
    MSG_THRESHOLD_KEY, PARTNER_FP_KEY, Scope, Token, TokenState, TokenType, keys,
};
pub use validate::{InvalidReason, Recovery};
