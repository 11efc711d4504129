//! Integration tests for the public token API.
//!
//! Tokens cross a process boundary as bincode'd documents, so most tests here
//! encode on one side and decode on the other before validating.

use std::sync::Arc;
use std::time::Duration;

use aaatoken::{
    AttributeValue, DecodeError, Document, Fingerprint, InvalidReason, Keypair, MemoryKeyCache,
    NoKeyCache, Recovery, Scope, SignatureError, Token, TokenConfig, TokenType, Value, keys,
};

fn identity(subject: &str) -> Token {
    Token::identity(
        Keypair::generate(),
        subject,
        &TokenConfig::with_lifetime(Duration::from_secs(3600)),
    )
    .unwrap()
}

/// Encode, serialize, deserialize and decode, as a remote peer would see it.
fn over_the_wire(token: &Token) -> Token {
    let bytes = token.encode().to_bytes().unwrap();
    Token::decode(&Document::from_bytes(&bytes).unwrap()).unwrap()
}

#[test]
fn fingerprint_is_deterministic_across_the_wire() {
    let token = identity("alice");
    token
        .set_attribute("role", AttributeValue::Str("admin".into()))
        .unwrap();

    let received = over_the_wire(&token);

    assert_eq!(received.fingerprint(false), token.fingerprint(false));
    assert_eq!(received.fingerprint(true), token.fingerprint(true));
    assert_eq!(received.core_digest(), token.core_digest());
    assert_eq!(received.attribute_digest(), token.attribute_digest());
}

#[test]
fn received_token_validates() {
    let received = over_the_wire(&identity("alice"));

    assert_eq!(received.scope(), Scope::Public);
    assert!(received.validate(TokenType::IDENTITY, &NoKeyCache).is_ok());
    assert!(received.state().is_valid());
}

#[test]
fn tampered_core_fields_break_signature() {
    let token = identity("alice");
    let doc = token.encode();

    let tampered: Vec<(&str, Value)> = vec![
        (keys::SUBJECT, Value::Str("mallory".into())),
        (keys::ISSUER, Value::Str("someone-else".into())),
        (keys::REALM, Value::Str("other-realm".into())),
        (keys::AUDIENCE, Value::Str("anyone".into())),
        (keys::EXPIRES_AT, Value::Double(token.expires_at() + 1000.0)),
        (keys::NOT_BEFORE, Value::Double(token.not_before() - 1.0)),
        (keys::UUID, Value::Str("00000000-0000-4000-8000-000000000000".into())),
    ];

    for (key, value) in tampered {
        let mut doc = doc.clone();
        doc.replace(key, value);
        let received = Token::decode(&doc).unwrap();
        assert_eq!(
            received.validate(TokenType::IDENTITY, &NoKeyCache),
            Err(InvalidReason::BadSignature),
            "tampering {key} went unnoticed"
        );
    }
}

#[test]
fn flipped_public_key_bit_breaks_signature() {
    let doc = identity("alice").encode();

    for bit in [0usize, 7, 100, 255] {
        let mut doc = doc.clone();
        let Some(Value::Bin(mut pk)) = doc.get(keys::PUBLIC_KEY).cloned() else {
            panic!("public key missing");
        };
        pk[bit / 8] ^= 1 << (bit % 8);
        doc.replace(keys::PUBLIC_KEY, Value::Bin(pk));

        let received = Token::decode(&doc).unwrap();
        assert_eq!(
            received.validate(TokenType::IDENTITY, &NoKeyCache),
            Err(InvalidReason::BadSignature)
        );
    }
}

#[test]
fn flipped_signature_bit_breaks_signature() {
    let mut doc = identity("alice").encode();
    let Some(Value::Bin(mut sig)) = doc.get(keys::SIGNATURE).cloned() else {
        panic!("signature missing");
    };
    sig[10] ^= 0x80;
    doc.replace(keys::SIGNATURE, Value::Bin(sig));

    let received = Token::decode(&doc).unwrap();
    assert_eq!(
        received.validate(TokenType::IDENTITY, &NoKeyCache),
        Err(InvalidReason::BadSignature)
    );
}

#[test]
fn tampered_attribute_block_breaks_attribute_signature() {
    let token = identity("alice");
    token
        .set_attribute("quota", AttributeValue::UnsignedInt(10))
        .unwrap();
    let doc = token.encode();

    let Some(Value::Bin(mut block)) = doc.get(keys::ATTRIBUTES).cloned() else {
        panic!("attribute block missing");
    };
    // Last byte is the high byte of the u32 value.
    let last = block.len() - 1;
    block[last] ^= 0x01;

    let mut doc = doc;
    doc.replace(keys::ATTRIBUTES, Value::Bin(block));
    let received = Token::decode(&doc).unwrap();

    assert_eq!(
        received.validate(TokenType::IDENTITY, &NoKeyCache),
        Err(InvalidReason::BadAttributeSignature)
    );
}

#[test]
fn attribute_block_cannot_be_moved_between_tokens() {
    let a = identity("alice");
    let b = identity("bob");
    a.set_attribute("role", AttributeValue::Str("admin".into())).unwrap();

    let a_doc = a.encode();
    let mut b_doc = b.encode();
    for key in [keys::ATTRIBUTES, keys::ATTRIBUTES_SIGNATURE] {
        b_doc.replace(key, a_doc.get(key).cloned().unwrap());
    }

    let received = Token::decode(&b_doc).unwrap();
    assert_eq!(
        received.validate(TokenType::IDENTITY, &NoKeyCache),
        Err(InvalidReason::BadAttributeSignature)
    );
}

#[test]
fn expiry_is_inclusive() {
    let received = over_the_wire(&identity("alice"));
    let expires_at = received.expires_at();

    assert!(received
        .validate_at(TokenType::IDENTITY, &NoKeyCache, expires_at)
        .is_ok());

    let err = received
        .validate_at(TokenType::IDENTITY, &NoKeyCache, expires_at + 1e-3)
        .unwrap_err();
    assert!(matches!(err, InvalidReason::Expired { .. }));
    assert_eq!(err.recovery(), Recovery::Refresh);
}

#[test]
fn message_threshold_ten_of_ten() {
    let issuer = identity("alice");
    let intent = Token::message_intent(&issuer, "chat", 10).unwrap();

    for _ in 0..10 {
        intent.record_message().unwrap();
    }
    let received = over_the_wire(&intent);
    assert!(received
        .validate(TokenType::MESSAGE_INTENT, &NoKeyCache)
        .is_ok());

    intent.record_message().unwrap();
    let received = over_the_wire(&intent);
    assert_eq!(
        received.validate(TokenType::MESSAGE_INTENT, &NoKeyCache),
        Err(InvalidReason::ThresholdExceeded {
            msg_threshold: 11,
            max_threshold: 10
        })
    );
}

#[test]
fn message_intent_is_signed_by_issuer() {
    let issuer = identity("alice");
    let intent = Token::message_intent(&issuer, "chat", 3).unwrap();

    assert_eq!(intent.scope(), Scope::PrivateAvailable);
    assert_eq!(intent.issuer_fingerprint(), Some(issuer.fingerprint(false)));
    assert_eq!(intent.partner_fp(), Some(issuer.fingerprint(false)));

    let received = over_the_wire(&intent);
    assert_eq!(received.public_key(), issuer.public_key());
    assert!(received
        .validate(TokenType::MESSAGE_INTENT, &NoKeyCache)
        .is_ok());
}

#[test]
fn impersonation_of_pinned_fingerprint() {
    let node = Token::node(Keypair::generate(), "node-1").unwrap();
    let received = over_the_wire(&node);

    // A handshake with a different key previously pinned this address.
    let cache = MemoryKeyCache::default();
    cache.insert(
        node.fingerprint(false),
        Arc::new(Token::handshake(Keypair::generate(), "node-1").unwrap()),
    );

    let err = received.validate(TokenType::NODE, &cache).unwrap_err();
    assert_eq!(err, InvalidReason::Impersonation);
    assert_eq!(err.recovery(), Recovery::Alert);
    assert!(!received.state().is_valid());
}

#[test]
fn same_key_handshake_is_not_impersonation() {
    let keypair = Keypair::generate();
    let node = Token::node(keypair.clone(), "node-1").unwrap();
    let received = over_the_wire(&node);

    let cache = MemoryKeyCache::default();
    cache.insert(
        node.fingerprint(false),
        Arc::new(Token::handshake(keypair, "node-1").unwrap()),
    );

    assert!(received.validate(TokenType::NODE, &cache).is_ok());
}

#[test]
fn handshake_then_node_token_flow() {
    let handshake = Arc::new(Token::handshake(Keypair::generate(), "node-1").unwrap());
    let remote_view = Arc::new(over_the_wire(&handshake));
    assert!(remote_view
        .validate(TokenType::HANDSHAKE, &NoKeyCache)
        .is_ok());

    let cache = MemoryKeyCache::default();
    cache.insert_token(remote_view.clone());

    let node = over_the_wire(&handshake.to_type(TokenType::NODE));
    assert_eq!(node.fingerprint(false), remote_view.fingerprint(false));
    assert!(node.validate(TokenType::NODE, &cache).is_ok());
}

#[test]
fn co_signature_integrity() {
    let authority = identity("authority");
    let mut node = Token::node(Keypair::generate(), "node-1").unwrap();
    node.set_issuer_identity(&authority);
    node.sign_self();
    node.co_sign(&authority).unwrap();

    let authority_fp = authority.fingerprint(false);
    let received = over_the_wire(&node);
    assert!(received.validate(TokenType::NODE, &NoKeyCache).is_ok());
    assert!(received.verify_co_signature(&authority_fp).is_ok());

    // Re-signing the core (e.g. to extend expiry) orphans the co-signature.
    node.set_expires_at(node.expires_at() + 3600.0);
    node.sign_self();
    let received = over_the_wire(&node);
    assert!(received.validate(TokenType::NODE, &NoKeyCache).is_ok());
    assert_eq!(
        received.verify_co_signature(&authority_fp),
        Err(SignatureError::VerificationFailed)
    );
}

#[test]
fn export_import_preserves_identity() {
    let token = identity("alice");
    token
        .set_attribute("role", AttributeValue::Str("admin".into()))
        .unwrap();

    let imported = Token::import(&token.export().unwrap()).unwrap();

    assert_eq!(imported.scope(), Scope::Private);
    assert_eq!(imported.fingerprint(true), token.fingerprint(true));
    assert_eq!(imported.attributes(), token.attributes());

    // The imported identity can keep issuing.
    let intent = Token::message_intent(&imported, "chat", 1).unwrap();
    assert_eq!(intent.public_key(), token.public_key());
}

#[test]
fn encode_never_leaks_private_key() {
    let doc = identity("alice").encode();
    assert!(!doc.contains(keys::SECRET_KEY));

    let bytes = doc.to_bytes().unwrap();
    assert_eq!(
        Token::import(&bytes).unwrap_err(),
        DecodeError::MissingField("secret_key")
    );
}

#[test]
fn attribute_block_without_signature_is_rejected() {
    let token = identity("alice");
    token.set_attribute("k", AttributeValue::Int(1)).unwrap();
    let mut doc = token.encode();
    doc.remove(keys::ATTRIBUTES_SIGNATURE);

    assert_eq!(
        Token::decode(&doc).unwrap_err(),
        DecodeError::MissingField("attributes_signature")
    );
}

#[test]
fn concurrent_attribute_updates_never_tear() {
    let token = Arc::new(identity("alice"));
    let public_key = *token.public_key().unwrap();

    std::thread::scope(|s| {
        for writer in 0..4u32 {
            let token = &token;
            s.spawn(move || {
                for i in 0..50u32 {
                    token
                        .set_attribute("counter", AttributeValue::UnsignedInt(writer * 1000 + i))
                        .unwrap();
                }
            });
        }

        for _ in 0..4 {
            let token = &token;
            s.spawn(move || {
                for _ in 0..50 {
                    let received = over_the_wire(token);
                    assert_eq!(received.public_key(), Some(&public_key));
                    assert!(received
                        .validate(TokenType::IDENTITY, &NoKeyCache)
                        .is_ok());
                }
            });
        }
    });

    let received = over_the_wire(&token);
    assert!(received.validate(TokenType::IDENTITY, &NoKeyCache).is_ok());
}

#[test]
fn partner_fingerprint_round_trips() {
    let token = identity("alice");
    let partner = Fingerprint::from_bytes([0x42; 32]);
    token.set_partner_fp(&partner).unwrap();

    assert_eq!(over_the_wire(&token).partner_fp(), Some(partner));
}

#[test]
fn state_bits_survive_revalidation() {
    let received = over_the_wire(&identity("alice"));
    received.validate(TokenType::IDENTITY, &NoKeyCache).unwrap();
    received.mark_authenticated();
    received.mark_authorized();

    received.validate(TokenType::IDENTITY, &NoKeyCache).unwrap();
    let state = received.state();
    assert!(state.is_valid() && state.is_authenticated() && state.is_authorized());
    assert!(!state.is_accounting());
}

#[test]
fn changing_a_received_token_after_validation_is_detected() {
    let mut received = over_the_wire(&Token::node(Keypair::generate(), "node-1").unwrap());
    assert!(received.validate(TokenType::NODE, &NoKeyCache).is_ok());

    received.set_subject("mallory").unwrap();

    assert!(!received.state().is_valid());
    assert_eq!(
        received.validate(TokenType::NODE, &NoKeyCache),
        Err(InvalidReason::BadSignature)
    );
}

#[test]
fn non_finite_expiry_is_rejected_on_decode() {
    let mut doc = identity("alice").encode();
    doc.replace(keys::EXPIRES_AT, Value::Double(f64::NAN));

    assert!(matches!(Token::decode(&doc), Err(DecodeError::Corrupt(_))));
}
