//! # Trust Tokens
//!
//! A [`Token`] is a signed bundle of identity fields, a validity window and an
//! extensible attribute block. The same structure serves every role in the
//! system (node identity, application identity, handshake, message intent);
//! [`TokenType`] tells them apart.
//!
//! ## Mutability Model
//!
//! Tokens are shared as `Arc<Token>` between the node-identity slot, the key
//! cache and in-flight messages. Content is treated as immutable once shared,
//! with three exceptions:
//!
//! - the attribute block and its signature, which sit behind one `RwLock` and
//!   are only ever replaced together (see [`Token::update_attributes`])
//! - the two verified flags, caches stored as atomics and cleared by every
//!   core setter
//! - the AAA state bits, stored as an atomic bitmask
//!
//! Core fields are changed through `&mut self` setters before a token is
//! shared. Every core change must be followed by [`Token::sign_self`].
//!
//! ## Wire Mapping
//!
//! | Key | Field | Value |
//! |-----|-------|-------|
//! | `np.t.type` | type bitmask | ushort |
//! | `np.t.u` | uuid | string |
//! | `np.t.r` | realm | string |
//! | `np.t.i` | issuer | string |
//! | `np.t.s` | subject | string |
//! | `np.t.a` | audience | string |
//! | `np.t.p` | public key | bin(32) |
//! | `np.t.ex` | expires_at | double |
//! | `np.t.ia` | issued_at | double |
//! | `np.t.nb` | not_before | double |
//! | `np.t.si` | signature | bin(64) |
//! | `np.t.e` | attribute block | bin |
//! | `np.t.sie` | attribute signature | bin(64) |
//! | `np.t.sk` | private key (export only) | bin(32) |

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{PoisonError, RwLock};

use rand::RngCore;
use rand::rngs::OsRng;
use tracing::debug;

use crate::attributes::{AttributeError, AttributeStore, AttributeValue};
use crate::config::TokenConfig;
use crate::document::{Document, Value};
use crate::identity::{
    Fingerprint, Keypair, PUBLIC_KEY_LEN, SECRET_KEY_LEN, SIGNATURE_LEN, now_secs,
};

// ============================================================================
// Wire Keys and Limits
// ============================================================================

pub mod keys {
    pub const TYPE: &str = "np.t.type";
    pub const UUID: &str = "np.t.u";
    pub const REALM: &str = "np.t.r";
    pub const ISSUER: &str = "np.t.i";
    pub const SUBJECT: &str = "np.t.s";
    pub const AUDIENCE: &str = "np.t.a";
    pub const PUBLIC_KEY: &str = "np.t.p";
    pub const EXPIRES_AT: &str = "np.t.ex";
    pub const ISSUED_AT: &str = "np.t.ia";
    pub const NOT_BEFORE: &str = "np.t.nb";
    pub const SIGNATURE: &str = "np.t.si";
    pub const ATTRIBUTES: &str = "np.t.e";
    pub const ATTRIBUTES_SIGNATURE: &str = "np.t.sie";
    pub const SECRET_KEY: &str = "np.t.sk";
}

pub const MAX_UUID_LEN: usize = 36;
/// Issuers are referenced by hex fingerprint or hex public key.
pub const MAX_ISSUER_LEN: usize = 64;
pub const MAX_FIELD_LEN: usize = 255;

/// Attribute carrying the advertised message capacity of an intent token.
pub const MAX_THRESHOLD_KEY: &str = "max_threshold";
/// Attribute carrying the number of messages already accounted.
pub const MSG_THRESHOLD_KEY: &str = "msg_threshold";
/// Attribute carrying the fingerprint of the token's partner.
pub const PARTNER_FP_KEY: &str = "_np.partner_fp";

// ============================================================================
// Token Type / State / Scope
// ============================================================================

/// Role bitmask. A token may carry several roles at once (e.g. a node token
/// that is also the process identity).
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TokenType(u16);

impl TokenType {
    pub const UNDEFINED: Self = Self(0x00);
    pub const HANDSHAKE: Self = Self(0x01);
    pub const IDENTITY: Self = Self(0x02);
    pub const NODE: Self = Self(0x04);
    pub const MESSAGE_INTENT: Self = Self(0x08);

    #[inline]
    pub fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    #[inline]
    pub fn bits(self) -> u16 {
        self.0
    }

    /// Bitmask inclusion: every bit of `other` is set in `self`.
    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_handshake(self) -> bool {
        self.contains(Self::HANDSHAKE)
    }

    pub fn is_identity(self) -> bool {
        self.contains(Self::IDENTITY)
    }

    pub fn is_node(self) -> bool {
        self.contains(Self::NODE)
    }

    pub fn is_message_intent(self) -> bool {
        self.contains(Self::MESSAGE_INTENT)
    }
}

impl std::ops::BitOr for TokenType {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::fmt::Debug for TokenType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TokenType({self})")
    }
}

impl std::fmt::Display for TokenType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0 == 0 {
            return write!(f, "undefined");
        }
        let names = [
            (Self::HANDSHAKE, "handshake"),
            (Self::IDENTITY, "identity"),
            (Self::NODE, "node"),
            (Self::MESSAGE_INTENT, "message_intent"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        let unknown = self.0 & !0x0f;
        if unknown != 0 {
            if !first {
                write!(f, "|")?;
            }
            write!(f, "{unknown:#x}")?;
        }
        Ok(())
    }
}

/// AAA state bitmask.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenState(u8);

impl TokenState {
    pub const UNKNOWN: Self = Self(0x00);
    pub const VALID: Self = Self(0x01);
    pub const AUTHENTICATED: Self = Self(0x02);
    pub const AUTHORIZED: Self = Self(0x04);
    pub const ACCOUNTING: Self = Self(0x08);

    #[inline]
    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self.0 & Self::VALID.0 != 0
    }

    pub fn is_authenticated(self) -> bool {
        self.0 & Self::AUTHENTICATED.0 != 0
    }

    pub fn is_authorized(self) -> bool {
        self.0 & Self::AUTHORIZED.0 != 0
    }

    pub fn is_accounting(self) -> bool {
        self.0 & Self::ACCOUNTING.0 != 0
    }
}

impl std::fmt::Debug for TokenState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenState")
            .field("valid", &self.is_valid())
            .field("authenticated", &self.is_authenticated())
            .field("authorized", &self.is_authorized())
            .field("accounting", &self.is_accounting())
            .finish()
    }
}

/// Whether this process can (re-)sign a token. Ordered from most to least
/// privileged; verification is only required for scopes above
/// [`Scope::PrivateAvailable`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Scope {
    /// The token carries its own private key.
    Private,
    /// The private key of the issuing identity is reachable.
    PrivateAvailable,
    /// Verification only.
    Public,
    /// No key material assigned yet.
    Undefined,
}

/// Where the signing key for a token comes from.
///
/// Replaces a back-pointer to the issuer token: the issuer's keypair is
/// resolved once, when the issuer is assigned.
#[derive(Clone)]
pub(crate) enum KeySource {
    None,
    Own(Keypair),
    Issuer(Keypair),
}

// ============================================================================
// Errors
// ============================================================================

/// A bounded text field was given a value that does not fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldTooLong {
    pub field: &'static str,
    pub len: usize,
    pub max: usize,
}

impl std::fmt::Display for FieldTooLong {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} is {} bytes, maximum is {}", self.field, self.len, self.max)
    }
}

impl std::error::Error for FieldTooLong {}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// A mandatory wire field is absent.
    MissingField(&'static str),
    /// A field has the wrong kind, the wrong length or malformed content.
    Corrupt(String),
    /// The byte buffer is not a valid document.
    Serialization(String),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingField(name) => write!(f, "missing mandatory field: {name}"),
            Self::Corrupt(msg) => write!(f, "corrupt token: {msg}"),
            Self::Serialization(msg) => write!(f, "serialization error: {msg}"),
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<FieldTooLong> for DecodeError {
    fn from(e: FieldTooLong) -> Self {
        DecodeError::Corrupt(e.to_string())
    }
}

impl From<AttributeError> for DecodeError {
    fn from(e: AttributeError) -> Self {
        DecodeError::Corrupt(e.to_string())
    }
}

// ============================================================================
// Token
// ============================================================================

/// Attribute block and the signature over it. Always replaced together.
pub(crate) struct SealedAttributes {
    pub(crate) store: AttributeStore,
    pub(crate) signature: Option<[u8; SIGNATURE_LEN]>,
}

pub struct Token {
    pub(crate) uuid: String,
    pub(crate) realm: String,
    pub(crate) issuer: String,
    pub(crate) subject: String,
    pub(crate) audience: String,

    pub(crate) issued_at: f64,
    pub(crate) not_before: f64,
    pub(crate) expires_at: f64,

    pub(crate) token_type: TokenType,
    pub(crate) public_key: Option<[u8; PUBLIC_KEY_LEN]>,
    pub(crate) key_source: KeySource,
    pub(crate) signature: [u8; SIGNATURE_LEN],

    pub(crate) sealed: RwLock<SealedAttributes>,
    pub(crate) signature_verified: AtomicBool,
    pub(crate) attributes_signature_verified: AtomicBool,
    pub(crate) state: AtomicU8,
}

fn new_uuid() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    // RFC 4122 version 4, variant 1
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    let h = hex::encode(bytes);
    format!("{}-{}-{}-{}-{}", &h[0..8], &h[8..12], &h[12..16], &h[16..20], &h[20..32])
}

fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), FieldTooLong> {
    if value.len() > max {
        return Err(FieldTooLong {
            field,
            len: value.len(),
            max,
        });
    }
    Ok(())
}

impl Token {
    /// Create an unsigned token with a fresh uuid and a jittered lifetime.
    pub fn new(token_type: TokenType) -> Self {
        Self::with_config(token_type, &TokenConfig::default())
    }

    pub fn with_config(token_type: TokenType, config: &TokenConfig) -> Self {
        let issued_at = now_secs();
        let lifetime = config.draw_lifetime_secs();
        debug!(lifetime_secs = lifetime, token_type = %token_type, "new token");

        Self {
            uuid: new_uuid(),
            realm: String::new(),
            issuer: String::new(),
            subject: String::new(),
            audience: String::new(),
            issued_at,
            not_before: issued_at,
            expires_at: issued_at + lifetime,
            token_type,
            public_key: None,
            key_source: KeySource::None,
            signature: [0u8; SIGNATURE_LEN],
            sealed: RwLock::new(SealedAttributes {
                store: AttributeStore::new(),
                signature: None,
            }),
            signature_verified: AtomicBool::new(false),
            attributes_signature_verified: AtomicBool::new(false),
            state: AtomicU8::new(TokenState::UNKNOWN.bits()),
        }
    }

    /// Re-initialize every field as [`Token::new`] would, keeping only the type.
    pub fn reset(&mut self) {
        *self = Self::new(self.token_type);
    }

    // ------------------------------------------------------------------------
    // Factories
    // ------------------------------------------------------------------------

    fn self_issued(
        token_type: TokenType,
        keypair: Keypair,
        subject: &str,
        config: &TokenConfig,
    ) -> Result<Self, FieldTooLong> {
        let mut token = Self::with_config(token_type, config);
        token.set_subject(subject)?;
        token.set_issuer(&hex::encode(keypair.public_key_bytes()))?;
        token.set_keypair(keypair);
        token.sign_self();
        Ok(token)
    }

    /// Long-lived application identity, signed with its own key.
    pub fn identity(
        keypair: Keypair,
        subject: &str,
        config: &TokenConfig,
    ) -> Result<Self, FieldTooLong> {
        Self::self_issued(TokenType::IDENTITY, keypair, subject, config)
    }

    /// Node identity token.
    pub fn node(keypair: Keypair, subject: &str) -> Result<Self, FieldTooLong> {
        Self::self_issued(TokenType::NODE, keypair, subject, &TokenConfig::default())
    }

    /// Ephemeral handshake token. [`Token::to_type`] turns it into the full
    /// node token later without changing its core-only fingerprint.
    pub fn handshake(keypair: Keypair, subject: &str) -> Result<Self, FieldTooLong> {
        Self::self_issued(TokenType::HANDSHAKE, keypair, subject, &TokenConfig::default())
    }

    /// Message-intent token issued (and signed) by `issuer`, advertising
    /// capacity for `max_threshold` messages on `subject`.
    ///
    /// # Panics
    /// If `issuer` holds no private key.
    pub fn message_intent(
        issuer: &Token,
        subject: &str,
        max_threshold: u32,
    ) -> Result<Self, FieldTooLong> {
        let mut token = Self::new(TokenType::MESSAGE_INTENT);
        token.set_subject(subject)?;
        token.set_realm(&issuer.realm)?;
        token.set_issuer_token(issuer);

        let store = &mut token.sealed_mut().store;
        for (key, value) in [(MAX_THRESHOLD_KEY, max_threshold), (MSG_THRESHOLD_KEY, 0)] {
            // Two small fixed-size entries always fit an empty block.
            if let Err(e) = store.set(key, AttributeValue::UnsignedInt(value)) {
                unreachable!("threshold attributes must fit: {e}");
            }
        }

        token.sign_self();
        Ok(token)
    }

    /// Copy of this token carrying a different role. Core fields, signature
    /// and attributes are kept, so the core-only fingerprint is unchanged.
    pub fn to_type(&self, token_type: TokenType) -> Token {
        let mut copy = self.clone();
        copy.token_type = token_type;
        copy
    }

    // ------------------------------------------------------------------------
    // Key material
    // ------------------------------------------------------------------------

    /// Give this token its own keypair; it becomes self-signing.
    pub fn set_keypair(&mut self, keypair: Keypair) {
        self.public_key = Some(keypair.public_key_bytes());
        self.key_source = KeySource::Own(keypair);
        self.core_changed();
    }

    /// Make `issuer` the signing identity of this token.
    ///
    /// Copies the issuer's public key, records the issuer's core-only
    /// fingerprint in the `issuer` field and resolves the issuer's private key
    /// as the signing source.
    ///
    /// # Panics
    /// If `issuer` holds no private key.
    pub fn set_issuer_token(&mut self, issuer: &Token) {
        let Some(keypair) = issuer.signing_keypair().cloned() else {
            panic!(
                "token ({}) cannot be issued by ({}) without a private key",
                self.uuid, issuer.uuid
            );
        };
        self.issuer = issuer.fingerprint(false).to_hex();
        self.public_key = Some(keypair.public_key_bytes());
        self.key_source = KeySource::Issuer(keypair);
        self.core_changed();
    }

    /// Name `issuer` as this token's issuer without changing key material.
    /// This is the relation [`Token::co_sign`] checks.
    pub fn set_issuer_identity(&mut self, issuer: &Token) {
        self.issuer = issuer.fingerprint(false).to_hex();
        self.core_changed();
    }

    pub(crate) fn signing_keypair(&self) -> Option<&Keypair> {
        match &self.key_source {
            KeySource::Own(kp) | KeySource::Issuer(kp) => Some(kp),
            KeySource::None => None,
        }
    }

    pub fn scope(&self) -> Scope {
        match (&self.key_source, self.public_key) {
            (KeySource::Own(_), _) => Scope::Private,
            (KeySource::Issuer(_), _) => Scope::PrivateAvailable,
            (KeySource::None, Some(_)) => Scope::Public,
            (KeySource::None, None) => Scope::Undefined,
        }
    }

    pub fn has_private_key(&self) -> bool {
        matches!(self.key_source, KeySource::Own(_))
    }

    pub fn public_key(&self) -> Option<&[u8; PUBLIC_KEY_LEN]> {
        self.public_key.as_ref()
    }

    // ------------------------------------------------------------------------
    // Core fields
    // ------------------------------------------------------------------------

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn audience(&self) -> &str {
        &self.audience
    }

    pub fn issued_at(&self) -> f64 {
        self.issued_at
    }

    pub fn not_before(&self) -> f64 {
        self.not_before
    }

    pub fn expires_at(&self) -> f64 {
        self.expires_at
    }

    pub fn token_type(&self) -> TokenType {
        self.token_type
    }

    pub fn signature(&self) -> &[u8; SIGNATURE_LEN] {
        &self.signature
    }

    pub fn set_realm(&mut self, realm: &str) -> Result<(), FieldTooLong> {
        check_len("realm", realm, MAX_FIELD_LEN)?;
        self.realm = realm.to_string();
        self.core_changed();
        Ok(())
    }

    pub fn set_issuer(&mut self, issuer: &str) -> Result<(), FieldTooLong> {
        check_len("issuer", issuer, MAX_ISSUER_LEN)?;
        self.issuer = issuer.to_string();
        self.core_changed();
        Ok(())
    }

    pub fn set_subject(&mut self, subject: &str) -> Result<(), FieldTooLong> {
        check_len("subject", subject, MAX_FIELD_LEN)?;
        self.subject = subject.to_string();
        self.core_changed();
        Ok(())
    }

    pub fn set_audience(&mut self, audience: &str) -> Result<(), FieldTooLong> {
        check_len("audience", audience, MAX_FIELD_LEN)?;
        self.audience = audience.to_string();
        self.core_changed();
        Ok(())
    }

    pub fn set_issued_at(&mut self, at: f64) {
        self.issued_at = at;
        self.core_changed();
    }

    pub fn set_not_before(&mut self, at: f64) {
        self.not_before = at;
        self.core_changed();
    }

    pub fn set_expires_at(&mut self, at: f64) {
        self.expires_at = at;
        self.core_changed();
    }

    /// The issuer field parsed as a fingerprint, if it is one.
    pub fn issuer_fingerprint(&self) -> Option<Fingerprint> {
        Fingerprint::from_hex(&self.issuer).ok()
    }

    // ------------------------------------------------------------------------
    // State and verification caches
    // ------------------------------------------------------------------------

    pub fn state(&self) -> TokenState {
        TokenState(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state_bits(&self, bits: TokenState) {
        self.state.fetch_or(bits.0, Ordering::AcqRel);
    }

    pub(crate) fn clear_state_bits(&self, bits: TokenState) {
        self.state.fetch_and(!bits.0, Ordering::AcqRel);
    }

    /// A core field changed: cached verification results and validity no
    /// longer describe this content.
    fn core_changed(&mut self) {
        *self.signature_verified.get_mut() = false;
        *self.attributes_signature_verified.get_mut() = false;
        *self.state.get_mut() &= !TokenState::VALID.bits();
    }

    pub fn mark_authenticated(&self) {
        self.set_state_bits(TokenState::AUTHENTICATED);
    }

    pub fn mark_authorized(&self) {
        self.set_state_bits(TokenState::AUTHORIZED);
    }

    pub fn mark_accounting(&self) {
        self.set_state_bits(TokenState::ACCOUNTING);
    }

    pub fn signature_verified(&self) -> bool {
        self.signature_verified.load(Ordering::Acquire)
    }

    pub fn attributes_signature_verified(&self) -> bool {
        self.attributes_signature_verified.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------------
    // Attributes
    // ------------------------------------------------------------------------

    pub(crate) fn sealed_mut(&mut self) -> &mut SealedAttributes {
        self.sealed.get_mut().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the attribute block.
    pub fn attributes(&self) -> AttributeStore {
        self.attributes_snapshot().0
    }

    pub fn attributes_signature(&self) -> Option<[u8; SIGNATURE_LEN]> {
        self.attributes_snapshot().1
    }

    /// Attribute block together with the signature covering it, read under
    /// one lock so the pair is always consistent.
    pub fn attributes_snapshot(&self) -> (AttributeStore, Option<[u8; SIGNATURE_LEN]>) {
        let sealed = self.sealed.read().unwrap_or_else(PoisonError::into_inner);
        (sealed.store.clone(), sealed.signature)
    }

    pub fn attribute(&self, key: &str) -> Option<AttributeValue> {
        let sealed = self.sealed.read().unwrap_or_else(PoisonError::into_inner);
        sealed.store.get(key)
    }

    /// Set one attribute and re-sign the block.
    ///
    /// # Panics
    /// If the token cannot be signed by this process.
    pub fn set_attribute(&self, key: &str, value: AttributeValue) -> Result<(), AttributeError> {
        self.update_attributes(|store| store.set(key, value))
    }

    pub fn remove_attribute(&self, key: &str) -> Option<AttributeValue> {
        self.update_attributes(|store| Ok(store.remove(key))).ok().flatten()
    }

    pub fn set_partner_fp(&self, partner: &Fingerprint) -> Result<(), AttributeError> {
        self.set_attribute(PARTNER_FP_KEY, AttributeValue::Str(partner.to_hex()))
    }

    /// Partner fingerprint, falling back to the issuer fingerprint.
    pub fn partner_fp(&self) -> Option<Fingerprint> {
        match self.attribute(PARTNER_FP_KEY) {
            Some(AttributeValue::Str(s)) => Fingerprint::from_hex(&s).ok(),
            _ => self.issuer_fingerprint(),
        }
    }

    /// Account one more message against this intent token's threshold.
    /// Returns the new `msg_threshold`.
    pub fn record_message(&self) -> Result<u32, AttributeError> {
        self.update_attributes(|store| {
            let next = store.get_u32(MSG_THRESHOLD_KEY).unwrap_or(0).saturating_add(1);
            store.set(MSG_THRESHOLD_KEY, AttributeValue::UnsignedInt(next))?;
            Ok(next)
        })
    }

    // ------------------------------------------------------------------------
    // Encoding
    // ------------------------------------------------------------------------

    /// Map this token onto a wire document.
    ///
    /// Re-signs the attribute block first when this process is able to.
    pub fn encode(&self) -> Document {
        if self.scope() <= Scope::PrivateAvailable {
            self.sign_attributes();
        }

        let mut doc = Document::new();
        doc.replace(keys::TYPE, Value::UShort(self.token_type.bits()));
        doc.replace(keys::UUID, Value::Str(self.uuid.clone()));
        if !self.realm.is_empty() {
            doc.replace(keys::REALM, Value::Str(self.realm.clone()));
        }
        doc.replace(keys::ISSUER, Value::Str(self.issuer.clone()));
        doc.replace(keys::SUBJECT, Value::Str(self.subject.clone()));
        if !self.audience.is_empty() {
            doc.replace(keys::AUDIENCE, Value::Str(self.audience.clone()));
        }
        if let Some(pk) = self.public_key {
            doc.replace(keys::PUBLIC_KEY, Value::Bin(pk.to_vec()));
        }
        doc.replace(keys::EXPIRES_AT, Value::Double(self.expires_at));
        if self.issued_at != 0.0 {
            doc.replace(keys::ISSUED_AT, Value::Double(self.issued_at));
        }
        if self.not_before != 0.0 {
            doc.replace(keys::NOT_BEFORE, Value::Double(self.not_before));
        }
        doc.replace(keys::SIGNATURE, Value::Bin(self.signature.to_vec()));

        let (store, attributes_signature) = self.attributes_snapshot();
        if let Some(sig) = attributes_signature {
            doc.replace(keys::ATTRIBUTES, Value::Bin(store.as_bytes().to_vec()));
            doc.replace(keys::ATTRIBUTES_SIGNATURE, Value::Bin(sig.to_vec()));
        }

        doc
    }

    /// Rebuild a received token. The result is always public scope with both
    /// verified flags cleared.
    pub fn decode(doc: &Document) -> Result<Token, DecodeError> {
        let uuid = required(read_str(doc, keys::UUID, "uuid", MAX_UUID_LEN)?, "uuid")?;
        let token_type = match doc.get(keys::TYPE) {
            Some(Value::UShort(bits)) => TokenType::from_bits(*bits),
            Some(other) => return Err(wrong_kind("type", other)),
            None => return Err(DecodeError::MissingField("type")),
        };
        let realm = read_str(doc, keys::REALM, "realm", MAX_FIELD_LEN)?.unwrap_or_default();
        let issuer = required(read_str(doc, keys::ISSUER, "issuer", MAX_ISSUER_LEN)?, "issuer")?;
        let subject = required(read_str(doc, keys::SUBJECT, "subject", MAX_FIELD_LEN)?, "subject")?;
        let audience =
            read_str(doc, keys::AUDIENCE, "audience", MAX_FIELD_LEN)?.unwrap_or_default();
        let public_key: [u8; PUBLIC_KEY_LEN] =
            required(read_fixed(doc, keys::PUBLIC_KEY, "public_key")?, "public_key")?;
        let expires_at = required(read_double(doc, keys::EXPIRES_AT, "expires_at")?, "expires_at")?;
        let issued_at = read_double(doc, keys::ISSUED_AT, "issued_at")?.unwrap_or(0.0);
        let not_before = read_double(doc, keys::NOT_BEFORE, "not_before")?.unwrap_or(0.0);
        let signature: [u8; SIGNATURE_LEN] =
            required(read_fixed(doc, keys::SIGNATURE, "signature")?, "signature")?;

        let (store, attributes_signature) = match doc.get(keys::ATTRIBUTES) {
            Some(Value::Bin(block)) => {
                let store = AttributeStore::from_bytes(block)?;
                let sig: [u8; SIGNATURE_LEN] = required(
                    read_fixed(doc, keys::ATTRIBUTES_SIGNATURE, "attributes_signature")?,
                    "attributes_signature",
                )?;
                (store, Some(sig))
            }
            Some(other) => return Err(wrong_kind("attributes", other)),
            None => (AttributeStore::new(), None),
        };

        Ok(Token {
            uuid,
            realm,
            issuer,
            subject,
            audience,
            issued_at,
            not_before,
            expires_at,
            token_type,
            public_key: Some(public_key),
            key_source: KeySource::None,
            signature,
            sealed: RwLock::new(SealedAttributes {
                store,
                signature: attributes_signature,
            }),
            signature_verified: AtomicBool::new(false),
            attributes_signature_verified: AtomicBool::new(false),
            state: AtomicU8::new(TokenState::UNKNOWN.bits()),
        })
    }

    /// Serialize this token including its private key, for moving an identity
    /// this process owns to another process.
    ///
    /// # Panics
    /// If the token does not carry its own private key.
    pub fn export(&self) -> Result<Vec<u8>, bincode::Error> {
        let KeySource::Own(keypair) = &self.key_source else {
            panic!("token ({}) cannot be exported without its own private key", self.uuid);
        };
        let mut doc = self.encode();
        doc.replace(keys::SECRET_KEY, Value::Bin(keypair.secret_key_bytes().to_vec()));
        debug!(uuid = %self.uuid, subject = %self.subject, "exporting identity");
        doc.to_bytes()
    }

    /// Inverse of [`Token::export`]. The result has scope [`Scope::Private`].
    pub fn import(bytes: &[u8]) -> Result<Token, DecodeError> {
        let doc = Document::from_bytes(bytes)
            .map_err(|e| DecodeError::Serialization(e.to_string()))?;
        let mut token = Token::decode(&doc)?;

        let secret: [u8; SECRET_KEY_LEN] =
            required(read_fixed(&doc, keys::SECRET_KEY, "secret_key")?, "secret_key")?;
        let keypair = Keypair::from_secret_key_bytes(&secret);
        if token.public_key != Some(keypair.public_key_bytes()) {
            return Err(DecodeError::Corrupt(
                "secret key does not match public key".to_string(),
            ));
        }
        token.key_source = KeySource::Own(keypair);
        debug!(uuid = %token.uuid, subject = %token.subject, "imported identity");
        Ok(token)
    }
}

fn required<T>(value: Option<T>, name: &'static str) -> Result<T, DecodeError> {
    value.ok_or(DecodeError::MissingField(name))
}

fn wrong_kind(name: &str, value: &Value) -> DecodeError {
    DecodeError::Corrupt(format!("{name} has unexpected kind {}", value.kind()))
}

fn read_str(
    doc: &Document,
    key: &str,
    name: &'static str,
    max: usize,
) -> Result<Option<String>, DecodeError> {
    match doc.get(key) {
        Some(Value::Str(s)) => {
            check_len(name, s, max)?;
            Ok(Some(s.clone()))
        }
        Some(other) => Err(wrong_kind(name, other)),
        None => Ok(None),
    }
}

fn read_double(
    doc: &Document,
    key: &str,
    name: &'static str,
) -> Result<Option<f64>, DecodeError> {
    match doc.get(key) {
        Some(Value::Double(d)) if d.is_finite() => Ok(Some(*d)),
        Some(Value::Double(d)) => {
            Err(DecodeError::Corrupt(format!("{name} is not finite: {d}")))
        }
        Some(other) => Err(wrong_kind(name, other)),
        None => Ok(None),
    }
}

fn read_fixed<const N: usize>(
    doc: &Document,
    key: &str,
    name: &'static str,
) -> Result<Option<[u8; N]>, DecodeError> {
    match doc.get(key) {
        Some(Value::Bin(bytes)) => {
            let arr: [u8; N] = bytes.as_slice().try_into().map_err(|_| {
                DecodeError::Corrupt(format!("{name} is {} bytes, expected {N}", bytes.len()))
            })?;
            Ok(Some(arr))
        }
        Some(other) => Err(wrong_kind(name, other)),
        None => Ok(None),
    }
}

impl Clone for Token {
    fn clone(&self) -> Self {
        let (store, attributes_signature) = self.attributes_snapshot();
        Self {
            uuid: self.uuid.clone(),
            realm: self.realm.clone(),
            issuer: self.issuer.clone(),
            subject: self.subject.clone(),
            audience: self.audience.clone(),
            issued_at: self.issued_at,
            not_before: self.not_before,
            expires_at: self.expires_at,
            token_type: self.token_type,
            public_key: self.public_key,
            key_source: self.key_source.clone(),
            signature: self.signature,
            sealed: RwLock::new(SealedAttributes {
                store,
                signature: attributes_signature,
            }),
            signature_verified: AtomicBool::new(self.signature_verified()),
            attributes_signature_verified: AtomicBool::new(self.attributes_signature_verified()),
            state: AtomicU8::new(self.state().bits()),
        }
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("uuid", &self.uuid)
            .field("type", &self.token_type)
            .field("subject", &self.subject)
            .field("issuer", &self.issuer)
            .field("scope", &self.scope())
            .field("expires_at", &self.expires_at)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> Token {
        Token::identity(Keypair::generate(), "alice", &TokenConfig::default()).unwrap()
    }

    #[test]
    fn new_token_defaults() {
        let token = Token::new(TokenType::NODE);

        assert_eq!(token.uuid().len(), 36);
        assert_eq!(token.issued_at(), token.not_before());
        let lifetime = token.expires_at() - token.issued_at();
        assert!((10.0..=30.0).contains(&lifetime), "lifetime {lifetime}");
        assert_eq!(token.state(), TokenState::UNKNOWN);
        assert_eq!(token.scope(), Scope::Undefined);
        assert!(token.attributes().is_empty());
    }

    #[test]
    fn uuids_are_unique() {
        let a = Token::new(TokenType::NODE);
        let b = Token::new(TokenType::NODE);

        assert_ne!(a.uuid(), b.uuid());
    }

    #[test]
    fn reset_keeps_type_and_clears_everything_else() {
        let mut token = identity();
        let old_uuid = token.uuid().to_string();
        token.reset();

        assert_eq!(token.token_type(), TokenType::IDENTITY);
        assert_ne!(token.uuid(), old_uuid);
        assert!(token.subject().is_empty());
        assert_eq!(token.scope(), Scope::Undefined);
        assert_eq!(token.signature(), &[0u8; SIGNATURE_LEN]);
    }

    #[test]
    fn setters_enforce_bounds() {
        let mut token = Token::new(TokenType::NODE);

        assert!(token.set_subject(&"s".repeat(MAX_FIELD_LEN)).is_ok());
        let err = token.set_subject(&"s".repeat(MAX_FIELD_LEN + 1)).unwrap_err();
        assert_eq!(err.field, "subject");
        assert!(token.set_issuer(&"i".repeat(MAX_ISSUER_LEN + 1)).is_err());
    }

    #[test]
    fn token_type_bitmask_semantics() {
        let both = TokenType::NODE | TokenType::IDENTITY;

        assert!(both.contains(TokenType::NODE));
        assert!(both.contains(TokenType::IDENTITY));
        assert!(!TokenType::NODE.contains(both));
        assert!(both.is_node() && both.is_identity());
        assert!(!both.is_handshake());
        assert_eq!(both.to_string(), "identity|node");
        assert_eq!(TokenType::UNDEFINED.to_string(), "undefined");
    }

    #[test]
    fn scope_follows_key_source() {
        let id = identity();
        assert_eq!(id.scope(), Scope::Private);

        let intent = Token::message_intent(&id, "chat", 5).unwrap();
        assert_eq!(intent.scope(), Scope::PrivateAvailable);
        assert_eq!(intent.public_key(), id.public_key());
        assert_eq!(intent.issuer(), id.fingerprint(false).to_hex());

        let received = Token::decode(&intent.encode()).unwrap();
        assert_eq!(received.scope(), Scope::Public);
    }

    #[test]
    #[should_panic(expected = "without a private key")]
    fn issuing_from_public_token_panics() {
        let id = identity();
        let public = Token::decode(&id.encode()).unwrap();
        let _ = Token::message_intent(&public, "chat", 5);
    }

    #[test]
    fn encode_writes_mandatory_and_attribute_fields() {
        let doc = identity().encode();

        for key in [
            keys::TYPE,
            keys::UUID,
            keys::ISSUER,
            keys::SUBJECT,
            keys::PUBLIC_KEY,
            keys::EXPIRES_AT,
            keys::SIGNATURE,
            keys::ATTRIBUTES,
            keys::ATTRIBUTES_SIGNATURE,
        ] {
            assert!(doc.contains(key), "missing {key}");
        }
        assert!(!doc.contains(keys::REALM));
        assert!(!doc.contains(keys::SECRET_KEY));
    }

    #[test]
    fn decode_reproduces_fields() {
        let mut token = Token::new(TokenType::NODE);
        token.set_keypair(Keypair::generate());
        token.set_realm("realm").unwrap();
        token.set_issuer("issuer").unwrap();
        token.set_subject("subject").unwrap();
        token.set_audience("audience").unwrap();
        token.sign_self();

        let decoded = Token::decode(&token.encode()).unwrap();
        assert_eq!(decoded.uuid(), token.uuid());
        assert_eq!(decoded.realm(), "realm");
        assert_eq!(decoded.issuer(), "issuer");
        assert_eq!(decoded.subject(), "subject");
        assert_eq!(decoded.audience(), "audience");
        assert_eq!(decoded.public_key(), token.public_key());
        assert_eq!(decoded.expires_at(), token.expires_at());
        assert_eq!(decoded.issued_at(), token.issued_at());
        assert_eq!(decoded.not_before(), token.not_before());
        assert_eq!(decoded.signature(), token.signature());
        assert_eq!(decoded.token_type(), TokenType::NODE);
        assert!(!decoded.signature_verified());
        assert!(!decoded.attributes_signature_verified());
    }

    #[test]
    fn decode_reports_each_missing_mandatory_field() {
        let doc = identity().encode();
        let cases = [
            (keys::UUID, "uuid"),
            (keys::TYPE, "type"),
            (keys::ISSUER, "issuer"),
            (keys::SUBJECT, "subject"),
            (keys::PUBLIC_KEY, "public_key"),
            (keys::EXPIRES_AT, "expires_at"),
            (keys::SIGNATURE, "signature"),
            (keys::ATTRIBUTES_SIGNATURE, "attributes_signature"),
        ];
        for (key, name) in cases {
            let mut stripped = doc.clone();
            stripped.remove(key);
            assert_eq!(
                Token::decode(&stripped).unwrap_err(),
                DecodeError::MissingField(name),
                "removing {key}"
            );
        }
    }

    #[test]
    fn decode_defaults_optional_fields() {
        let mut doc = identity().encode();
        doc.remove(keys::ISSUED_AT);
        doc.remove(keys::NOT_BEFORE);
        doc.remove(keys::ATTRIBUTES);
        doc.remove(keys::ATTRIBUTES_SIGNATURE);

        let token = Token::decode(&doc).unwrap();
        assert_eq!(token.realm(), "");
        assert_eq!(token.audience(), "");
        assert_eq!(token.issued_at(), 0.0);
        assert_eq!(token.not_before(), 0.0);
        assert!(token.attributes().is_empty());
        assert_eq!(token.attributes_signature(), None);
    }

    #[test]
    fn decode_rejects_wrong_kinds_and_lengths() {
        let doc = identity().encode();

        let mut bad_kind = doc.clone();
        bad_kind.replace(keys::EXPIRES_AT, Value::Str("tomorrow".into()));
        assert!(matches!(Token::decode(&bad_kind), Err(DecodeError::Corrupt(_))));

        let mut short_key = doc.clone();
        short_key.replace(keys::PUBLIC_KEY, Value::Bin(vec![0u8; 31]));
        assert!(matches!(Token::decode(&short_key), Err(DecodeError::Corrupt(_))));

        let mut long_subject = doc.clone();
        long_subject.replace(keys::SUBJECT, Value::Str("x".repeat(MAX_FIELD_LEN + 1)));
        assert!(matches!(Token::decode(&long_subject), Err(DecodeError::Corrupt(_))));

        let mut bad_block = doc;
        bad_block.replace(keys::ATTRIBUTES, Value::Bin(vec![0xff; 8]));
        assert!(matches!(Token::decode(&bad_block), Err(DecodeError::Corrupt(_))));
    }

    #[test]
    fn export_import_restores_private_scope() {
        let id = identity();
        let bytes = id.export().unwrap();
        let imported = Token::import(&bytes).unwrap();

        assert_eq!(imported.scope(), Scope::Private);
        assert_eq!(imported.uuid(), id.uuid());
        assert_eq!(imported.public_key(), id.public_key());
        assert_eq!(imported.fingerprint(true), id.fingerprint(true));
    }

    #[test]
    fn import_rejects_mismatched_secret() {
        let id = identity();
        let mut doc = id.encode();
        doc.replace(
            keys::SECRET_KEY,
            Value::Bin(Keypair::generate().secret_key_bytes().to_vec()),
        );
        let bytes = doc.to_bytes().unwrap();

        assert!(matches!(Token::import(&bytes), Err(DecodeError::Corrupt(_))));
    }

    #[test]
    fn import_requires_secret_key() {
        let bytes = identity().encode().to_bytes().unwrap();

        assert_eq!(
            Token::import(&bytes).unwrap_err(),
            DecodeError::MissingField("secret_key")
        );
    }

    #[test]
    fn import_rejects_garbage() {
        assert!(matches!(
            Token::import(&[1, 2, 3]),
            Err(DecodeError::Serialization(_))
        ));
    }

    #[test]
    #[should_panic(expected = "cannot be exported")]
    fn export_of_public_token_panics() {
        let public = Token::decode(&identity().encode()).unwrap();
        let _ = public.export();
    }

    #[test]
    fn partner_fp_falls_back_to_issuer() {
        let id = identity();
        let intent = Token::message_intent(&id, "chat", 5).unwrap();
        assert_eq!(intent.partner_fp(), Some(id.fingerprint(false)));

        let partner = Fingerprint::from_bytes([7u8; 32]);
        intent.set_partner_fp(&partner).unwrap();
        assert_eq!(intent.partner_fp(), Some(partner));
    }

    #[test]
    fn record_message_increments_threshold() {
        let id = identity();
        let intent = Token::message_intent(&id, "chat", 5).unwrap();

        assert_eq!(intent.record_message().unwrap(), 1);
        assert_eq!(intent.record_message().unwrap(), 2);
        assert_eq!(intent.attributes().get_u32(MSG_THRESHOLD_KEY), Some(2));
    }

    #[test]
    fn state_bits_accumulate() {
        let token = identity();
        token.mark_authenticated();
        token.mark_authorized();

        let state = token.state();
        assert!(state.is_authenticated() && state.is_authorized());
        assert!(!state.is_valid() && !state.is_accounting());
    }

    #[test]
    fn to_type_keeps_core() {
        let hs = Token::handshake(Keypair::generate(), "node-1").unwrap();
        let node = hs.to_type(TokenType::NODE);

        assert_eq!(node.token_type(), TokenType::NODE);
        assert_eq!(node.fingerprint(false), hs.fingerprint(false));
        assert_eq!(node.signature(), hs.signature());
    }

    #[test]
    fn decode_rejects_non_finite_timestamps() {
        let doc = identity().encode();

        for key in [keys::EXPIRES_AT, keys::ISSUED_AT, keys::NOT_BEFORE] {
            for value in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
                let mut bad = doc.clone();
                bad.replace(key, Value::Double(value));
                assert!(
                    matches!(Token::decode(&bad), Err(DecodeError::Corrupt(_))),
                    "{key} = {value} accepted"
                );
            }
        }
    }
}
