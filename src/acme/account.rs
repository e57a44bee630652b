//! The account subsystem (spec §4.7): registration, ToS agreement,
//! validation, persistence under `accounts/<id>`. Grounded in the same
//! deleted `acme/client.rs` registration flow, generalized from
//! ECDSA/EAB to a plain RSA JWK-bound `new-reg`.

use openssl::pkey::{PKey, Private};

use crate::acme::transport::{AcmeClient, Resource};
use crate::crypto;
use crate::error::{AcmeMdError, Result};
use crate::json::{Format, Json, Path};
use crate::jws::KeyId;
use crate::model::Account;
use crate::store::{Group, Store, VType};

const ASPECT_META: &str = "acct.json";
const ASPECT_KEY: &str = "acct.pem";

/// Registers a brand-new account: generates its key, POSTs `new-reg`
/// with a JWK-embedded protected header, and persists key + metadata
/// under a freshly assigned local id.
pub async fn register(
    store: &dyn Store,
    acme: &mut AcmeClient,
    contacts: &[String],
    agreement: Option<&str>,
) -> Result<Account> {
    if contacts.is_empty() {
        return Err(AcmeMdError::InvalidArgument(
            "registering an account requires at least one contact".to_string(),
        ));
    }

    acme.setup().await?;
    let key = crypto::generate_rsa(crypto::DEFAULT_RSA_BITS)?;
    let url = acme
        .resource_url(Resource::NewReg)
        .ok_or_else(|| AcmeMdError::General("directory is missing new-reg".to_string()))?;

    let mut payload = Json::new();
    payload.set_string_array(&Path::single("contact"), contacts);
    if let Some(agreement) = agreement {
        payload.set_string(&Path::single("agreement"), agreement);
    }
    let payload_bytes = payload.write(Format::Compact).into_bytes();

    let resp = acme.req_do(&url, &key, &KeyId::Jwk, &payload_bytes).await?;
    let account_url = resp
        .location
        .ok_or_else(|| AcmeMdError::General("new-reg response carried no Location".to_string()))?;
    let agreement_uri = resp.links.get("terms-of-service").cloned();

    let id = local_id_for(&account_url);
    let account = Account {
        id: id.clone(),
        url: account_url,
        ca_url: acme.ca_url().to_string(),
        contacts: contacts.to_vec(),
        agreement: agreement_uri,
        disabled: false,
    };

    save(store, &account, &key).await?;
    Ok(account)
}

/// Derives a filesystem-safe local id from the CA-assigned account URL:
/// the final path segment, falling back to a hash if it is empty or
/// carries characters unsafe for a store name.
fn local_id_for(account_url: &str) -> String {
    let candidate = account_url
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or("");
    let safe: String = candidate
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if safe.is_empty() {
        crypto::base64url_encode(account_url.as_bytes())
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .take(16)
            .collect()
    } else {
        safe
    }
}

async fn save(store: &dyn Store, account: &Account, key: &PKey<Private>) -> Result<()> {
    let meta = Json::from_typed(account)?;
    store
        .save(
            Group::Accounts,
            &account.id,
            ASPECT_META,
            crate::store::StoreValue::Json(meta),
            false,
        )
        .await?;
    store
        .save(
            Group::Accounts,
            &account.id,
            ASPECT_KEY,
            crate::store::StoreValue::Pkey(clone_key(key)?),
            false,
        )
        .await
}

fn clone_key(key: &PKey<Private>) -> Result<PKey<Private>> {
    crypto::decode_private_key(&crypto::encode_private_key(key)?)
}

pub async fn load(store: &dyn Store, id: &str) -> Result<(Account, PKey<Private>)> {
    let meta = store
        .load(Group::Accounts, id, ASPECT_META, VType::Json)
        .await?
        .into_json()
        .ok_or_else(|| AcmeMdError::Corruption {
            path: std::path::PathBuf::from(id),
            detail: "accounts/*/acct.json did not decode as JSON".to_string(),
        })?;
    let account: Account = meta.to_typed()?;
    let key = store
        .load(Group::Accounts, id, ASPECT_KEY, VType::Pkey)
        .await?
        .into_pkey()
        .ok_or_else(|| AcmeMdError::Corruption {
            path: std::path::PathBuf::from(id),
            detail: "accounts/*/acct.pem did not decode as a private key".to_string(),
        })?;
    Ok((account, key))
}

/// Finds the first stored, non-disabled account whose `ca_url` matches.
pub async fn find(store: &dyn Store, ca_url: &str) -> Result<Option<(Account, PKey<Private>)>> {
    let mut found = None;
    let mut ids = Vec::new();
    store
        .iterate(
            Group::Accounts,
            "*",
            ASPECT_META,
            VType::Json,
            &mut |name, value| {
                if let Some(json) = value.as_json() {
                    if json.get_string(&Path::single("ca_url")).as_deref() == Some(ca_url)
                        && !json.get_bool(&Path::single("disabled")).unwrap_or(false)
                    {
                        ids.push(name.to_string());
                    }
                }
                crate::store::IterControl::Continue
            },
        )
        .await?;

    for id in ids {
        let (account, key) = load(store, &id).await?;
        if account.ca_url == ca_url && !account.disabled {
            found = Some((account, key));
            break;
        }
    }
    Ok(found)
}

/// Validates an account against the CA: POSTs the account URL with a
/// no-op payload. 200 means valid; 403/404 means the CA deleted it.
pub async fn validate(acme: &mut AcmeClient, account: &Account, key: &PKey<Private>) -> Result<()> {
    acme.req_do(&account.url, key, &KeyId::Kid(account.url.clone()), b"{}")
        .await?;
    Ok(())
}

/// Posts an update accepting `tos_uri`, then persists on success.
pub async fn agree(
    store: &dyn Store,
    acme: &mut AcmeClient,
    account: &mut Account,
    key: &PKey<Private>,
    tos_uri: &str,
) -> Result<()> {
    let mut payload = Json::new();
    payload.set_string(&Path::single("agreement"), tos_uri);
    let payload_bytes = payload.write(Format::Compact).into_bytes();
    acme.req_do(&account.url, key, &KeyId::Kid(account.url.clone()), &payload_bytes)
        .await?;
    account.agreement = Some(tos_uri.to_string());
    save(store, account, key).await
}

/// Ensures `account.agreement == required_tos`, agreeing if it differs.
pub async fn check_agreement(
    store: &dyn Store,
    acme: &mut AcmeClient,
    account: &mut Account,
    key: &PKey<Private>,
    required_tos: &str,
) -> Result<()> {
    if account.agreement.as_deref() == Some(required_tos) {
        return Ok(());
    }
    agree(store, acme, account, key, required_tos).await
}

/// Marks the account disabled in the store, without deleting it.
pub async fn disable(store: &dyn Store, account: &mut Account, key: &PKey<Private>) -> Result<()> {
    account.disabled = true;
    save(store, account, key).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FsStore;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn directory_server() -> MockServer {
        let server = MockServer::start().await;
        let body = serde_json::json!({
            "new-reg": format!("{}/new-reg", server.uri()),
            "new-authz": format!("{}/new-authz", server.uri()),
            "new-cert": format!("{}/new-cert", server.uri()),
            "revoke-cert": format!("{}/revoke-cert", server.uri()),
        });
        Mock::given(method("GET"))
            .and(path("/directory"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/new-reg"))
            .respond_with(ResponseTemplate::new(200).insert_header("replay-nonce", "nonce-0"))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn register_persists_account_and_key() {
        let server = directory_server().await;
        Mock::given(method("POST"))
            .and(path("/new-reg"))
            .respond_with(
                ResponseTemplate::new(201)
                    .insert_header("replay-nonce", "nonce-1")
                    .insert_header("location", format!("{}/acct/1", server.uri()))
                    .insert_header(
                        "link",
                        format!("<{}/terms>; rel=\"terms-of-service\"", server.uri()),
                    ),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).await.unwrap();
        let mut acme = AcmeClient::new(format!("{}/directory", server.uri()));

        let account = register(&store, &mut acme, &["mailto:a@example.org".to_string()], None)
            .await
            .unwrap();
        assert_eq!(account.id, "1");
        assert!(account.agreement.unwrap().ends_with("/terms"));

        let (loaded, _) = load(&store, &account.id).await.unwrap();
        assert_eq!(loaded.url, account.url);
    }

    #[tokio::test]
    async fn register_rejects_empty_contacts() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).await.unwrap();
        let mut acme = AcmeClient::new("https://ca.test/directory".to_string());
        let err = register(&store, &mut acme, &[], None).await.unwrap_err();
        assert!(matches!(err, AcmeMdError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn find_ignores_disabled_accounts() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).await.unwrap();
        let key = crypto::generate_rsa(2048).unwrap();
        let mut account = Account {
            id: "acc-1".to_string(),
            url: "https://ca.test/acct/1".to_string(),
            ca_url: "https://ca.test/directory".to_string(),
            contacts: vec!["mailto:a@example.org".to_string()],
            agreement: None,
            disabled: false,
        };
        save(&store, &account, &key).await.unwrap();
        assert!(find(&store, "https://ca.test/directory").await.unwrap().is_some());

        disable(&store, &mut account, &key).await.unwrap();
        assert!(find(&store, "https://ca.test/directory").await.unwrap().is_none());
    }
}
