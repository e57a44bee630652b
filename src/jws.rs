//! RFC 7515 flattened JSON serialization signer (spec §4.4). Grounded in
//! the `sign_request`/`jwk` pair of `examples/aicers-bootroot`'s
//! `acme/client.rs`, generalized from ES256/EC to RS256/RSA and from a
//! fixed header shape to the `jwk`-or-`kid` split spec §4.4 requires.

use openssl::pkey::{PKey, Private};
use serde::Serialize;
use serde_json::Value;

use crate::crypto;
use crate::error::Result;

const ALG_RS256: &str = "RS256";

/// Either the anonymous account-key JWK, or the account's `kid` URL for
/// account-bound requests — mutually exclusive per spec §4.4.
pub enum KeyId {
    Jwk,
    Kid(String),
}

#[derive(Serialize)]
struct Jwk {
    kty: &'static str,
    e: String,
    n: String,
}

#[derive(Serialize)]
struct ProtectedHeader {
    alg: &'static str,
    nonce: String,
    url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    jwk: Option<Jwk>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
}

/// Signs `payload` (already-serialized JSON, or empty for a POST-as-GET)
/// into the flattened JWS body `{protected, payload, signature}`.
pub fn sign(key: &PKey<Private>, url: &str, nonce: &str, key_id: &KeyId, payload: &[u8]) -> Result<Value> {
    let (jwk, kid) = match key_id {
        KeyId::Jwk => {
            let (e, n) = crypto::rsa_public_components(key)?;
            (Some(Jwk { kty: "RSA", e, n }), None)
        }
        KeyId::Kid(url) => (None, Some(url.clone())),
    };

    let protected = ProtectedHeader {
        alg: ALG_RS256,
        nonce: nonce.to_string(),
        url: url.to_string(),
        jwk,
        kid,
    };

    let protected_json = serde_json::to_vec(&protected)?;
    let protected_b64 = crypto::base64url_encode(&protected_json);
    let payload_b64 = crypto::base64url_encode(payload);

    let signing_input = format!("{protected_b64}.{payload_b64}");
    let signature_b64 = crypto::sign_sha256(key, signing_input.as_bytes())?;

    Ok(serde_json::json!({
        "protected": protected_b64,
        "payload": payload_b64,
        "signature": signature_b64,
    }))
}

/// Computes the canonical JWK thumbprint used for the key-authorization
/// string (spec §4.8, GLOSSARY "key authorization"): SHA-256 over the
/// JWK's members sorted lexicographically by key name.
pub fn jwk_thumbprint(key: &PKey<Private>) -> Result<Vec<u8>> {
    let (e, n) = crypto::rsa_public_components(key)?;
    let mut map = std::collections::BTreeMap::new();
    map.insert("e", e);
    map.insert("kty", "RSA".to_string());
    map.insert("n", n);
    let canonical = serde_json::to_vec(&map)?;
    crypto::sha256(&canonical)
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::sign::Verifier;

    #[test]
    fn sign_embeds_jwk_and_verifies() {
        let key = crypto::generate_rsa(2048).unwrap();
        let body = sign(&key, "https://ca.test/acme/new-acct", "nonce-1", &KeyId::Jwk, b"{}").unwrap();

        let protected_b64 = body["protected"].as_str().unwrap();
        let payload_b64 = body["payload"].as_str().unwrap();
        let signature_b64 = body["signature"].as_str().unwrap();

        let protected_json = crypto::base64url_decode(protected_b64).unwrap();
        let protected: Value = serde_json::from_slice(&protected_json).unwrap();
        assert_eq!(protected["alg"], "RS256");
        assert_eq!(protected["nonce"], "nonce-1");
        assert!(protected["jwk"].is_object());
        assert!(protected["kid"].is_null());

        let signing_input = format!("{protected_b64}.{payload_b64}");
        let signature = crypto::base64url_decode(signature_b64).unwrap();
        let mut verifier = Verifier::new(openssl::hash::MessageDigest::sha256(), &key).unwrap();
        verifier.update(signing_input.as_bytes()).unwrap();
        assert!(verifier.verify(&signature).unwrap());

        let _ = payload_b64;
    }

    #[test]
    fn sign_with_kid_omits_jwk() {
        let key = crypto::generate_rsa(2048).unwrap();
        let body = sign(
            &key,
            "https://ca.test/acme/order",
            "nonce-2",
            &KeyId::Kid("https://ca.test/acct/1".to_string()),
            b"{}",
        )
        .unwrap();
        let protected_json = crypto::base64url_decode(body["protected"].as_str().unwrap()).unwrap();
        let protected: Value = serde_json::from_slice(&protected_json).unwrap();
        assert_eq!(protected["kid"], "https://ca.test/acct/1");
        assert!(protected["jwk"].is_null());
    }

    #[test]
    fn jwk_thumbprint_is_deterministic() {
        let key = crypto::generate_rsa(2048).unwrap();
        let a = jwk_thumbprint(&key).unwrap();
        let b = jwk_thumbprint(&key).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }
}
