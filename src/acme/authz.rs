//! The authorization subsystem (spec §4.8): per-domain authz
//! create/poll/respond, HTTP-01 key authorization computation, and the
//! single-document-per-MD `AuthorizationSet` persistence. Grounded in
//! the deleted `acme/http01.rs`/`acme/types.rs` state shape, generalized
//! from the teacher's EAB/ECDSA authorization flow to the plain-RSA,
//! HTTP-01-only flow this specification covers.

use openssl::pkey::{PKey, Private};

use crate::acme::transport::{AcmeClient, Resource};
use crate::crypto;
use crate::error::{AcmeMdError, Result};
use crate::json::{Format, Json, Path};
use crate::jws::{self, KeyId};
use crate::model::{Authorization, AuthorizationSet, AuthzState, Identifier};
use crate::store::{Group, Store, StoreValue, VType};

const ASPECT_AUTHZ: &str = "authz.json";
const ASPECT_HTTP01: &str = "http-01";

pub async fn load_set(store: &dyn Store, md_name: &str) -> Result<Option<AuthorizationSet>> {
    match store.load(Group::Domains, md_name, ASPECT_AUTHZ, VType::Json).await {
        Ok(value) => {
            let json = value.into_json().ok_or_else(|| AcmeMdError::Corruption {
                path: std::path::PathBuf::from(md_name),
                detail: "authz.json did not decode as JSON".to_string(),
            })?;
            Ok(Some(json.to_typed()?))
        }
        Err(AcmeMdError::NotFound(_)) => Ok(None),
        Err(err) => Err(err),
    }
}

pub async fn save_set(store: &dyn Store, md_name: &str, set: &AuthorizationSet) -> Result<()> {
    let json = Json::from_typed(set)?;
    store
        .save(Group::Domains, md_name, ASPECT_AUTHZ, StoreValue::Json(json), false)
        .await
}

/// Registers a fresh authorization for `domain`: POSTs `new-authz`,
/// captures `Location`, stores the response body as `resource`.
pub async fn register(
    acme: &mut AcmeClient,
    key: &PKey<Private>,
    key_id: &KeyId,
    domain: &str,
) -> Result<Authorization> {
    let url = acme
        .resource_url(Resource::NewAuthz)
        .ok_or_else(|| AcmeMdError::General("directory is missing new-authz".to_string()))?;

    let identifier = Identifier {
        kind: "dns".to_string(),
        value: domain.to_string(),
    };
    let mut body = Json::new();
    body.set(&Path::single("identifier"), serde_json::to_value(&identifier)?);
    let payload_bytes = body.write(Format::Compact).into_bytes();

    let resp = acme.req_do(&url, key, key_id, &payload_bytes).await?;
    let location = resp
        .location
        .ok_or_else(|| AcmeMdError::General("new-authz response carried no Location".to_string()))?;

    Ok(Authorization {
        domain: domain.to_string(),
        location,
        state: state_from_resource(&resp.body),
        expires: resp.body.get_string(&Path::single("expires")),
        resource: resp.body.into_value(),
    })
}

/// Refreshes `authz.resource`/`authz.state` from a plain GET of its
/// `location`.
pub async fn update(acme: &mut AcmeClient, authz: &mut Authorization) -> Result<()> {
    let resp = acme.get(&authz.location).await?;
    authz.state = state_from_resource(&resp.body);
    authz.expires = resp.body.get_string(&Path::single("expires"));
    authz.resource = resp.body.into_value();
    Ok(())
}

fn state_from_resource(resource: &Json) -> AuthzState {
    match resource.get_string(&Path::single("status")).as_deref() {
        Some("valid") => AuthzState::Valid,
        Some("invalid") => AuthzState::Invalid,
        Some("revoked") => AuthzState::Revoked,
        _ => AuthzState::Pending,
    }
}

/// Selects the HTTP-01 challenge, writes the key authorization into the
/// store, then POSTs it back to the CA to trigger validation.
pub async fn respond(
    store: &dyn Store,
    acme: &mut AcmeClient,
    key: &PKey<Private>,
    key_id: &KeyId,
    authz: &Authorization,
) -> Result<()> {
    let challenges = authz
        .resource
        .get("challenges")
        .and_then(serde_json::Value::as_array)
        .cloned()
        .unwrap_or_default();

    let http01 = challenges
        .iter()
        .find(|c| c.get("type").and_then(serde_json::Value::as_str) == Some("http-01"))
        .ok_or_else(|| {
            AcmeMdError::NotImplemented(format!(
                "no http-01 challenge offered for {}; only http-01 is supported",
                authz.domain
            ))
        })?;

    let token = http01
        .get("token")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| AcmeMdError::General("http-01 challenge carried no token".to_string()))?;
    let challenge_url = http01
        .get("uri")
        .or_else(|| http01.get("url"))
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| AcmeMdError::General("http-01 challenge carried no URL".to_string()))?;

    let key_authorization = key_authorization(key, token)?;

    store
        .save(
            Group::Challenges,
            &authz.domain,
            ASPECT_HTTP01,
            StoreValue::Text(key_authorization.clone()),
            false,
        )
        .await?;

    let mut payload = Json::new();
    payload.set_string(&Path::single("keyAuthorization"), &key_authorization);
    let payload_bytes = payload.write(Format::Compact).into_bytes();
    acme.req_do(challenge_url, key, key_id, &payload_bytes).await?;
    Ok(())
}

/// `token || '.' || base64url(JWK thumbprint)` (GLOSSARY "key authorization").
fn key_authorization(key: &PKey<Private>, token: &str) -> Result<String> {
    let thumbprint = jws::jwk_thumbprint(key)?;
    Ok(format!("{token}.{}", crypto::base64url_encode(&thumbprint)))
}
