//! End-to-end drive scenarios against a fake ACME CA, covering the
//! testable properties this crate's scope names: fresh registration,
//! resuming with an already-registered account, and replacing an
//! invalid prior authorization.

use std::sync::atomic::{AtomicUsize, Ordering};

use acmemd::acme::authz;
use acmemd::crypto;
use acmemd::drive::{self, DriveSettings};
use acmemd::json::Json;
use acmemd::model::{Account, Authorization, AuthorizationSet, AuthzState, ManagedDomain};
use acmemd::store::{FsStore, Group, Store, StoreValue, VType};
use openssl::asn1::Asn1Time;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::x509::{X509, X509NameBuilder};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

struct Sequence(Vec<ResponseTemplate>, AtomicUsize);

impl Sequence {
    fn new(responses: Vec<ResponseTemplate>) -> Self {
        Self(responses, AtomicUsize::new(0))
    }
}

impl Respond for Sequence {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let i = self.1.fetch_add(1, Ordering::SeqCst);
        self.0[i.min(self.0.len() - 1)].clone()
    }
}

fn self_signed(key: &PKey<Private>, days: u32) -> X509 {
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", "example.org").unwrap();
    let name = name.build();

    let mut builder = X509::builder().unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(key).unwrap();
    builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    builder.set_not_after(&Asn1Time::days_from_now(days).unwrap()).unwrap();
    builder.sign(key, MessageDigest::sha256()).unwrap();
    builder.build()
}

/// Mounts a directory + new-reg + new-authz + challenge + new-cert +
/// issuer-chain fake CA that completes a full issuance for `domain` in
/// one pass. Every signed POST succeeds; the lone authorization goes
/// pending -> valid after its first poll.
async fn mount_completing_ca(server: &MockServer, domain: &str) {
    let leaf_key = crypto::generate_rsa(2048).unwrap();
    let leaf = self_signed(&leaf_key, 90);
    let issuer_key = crypto::generate_rsa(2048).unwrap();
    let issuer = self_signed(&issuer_key, 365);

    let body = serde_json::json!({
        "new-reg": format!("{}/new-reg", server.uri()),
        "new-authz": format!("{}/new-authz", server.uri()),
        "new-cert": format!("{}/new-cert", server.uri()),
        "revoke-cert": format!("{}/revoke-cert", server.uri()),
    });
    Mock::given(method("GET")).and(path("/directory"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server).await;
    Mock::given(method("HEAD")).and(path("/new-reg"))
        .respond_with(ResponseTemplate::new(200).insert_header("replay-nonce", "n0"))
        .mount(server).await;
    Mock::given(method("POST")).and(path("/new-reg"))
        .respond_with(
            ResponseTemplate::new(201)
                .insert_header("replay-nonce", "n1")
                .insert_header("location", format!("{}/acct/new", server.uri())),
        )
        .mount(server).await;

    let challenge_body = serde_json::json!({
        "status": "pending",
        "challenges": [{"type": "http-01", "token": "token-1", "uri": format!("{}/challenge/1", server.uri())}],
    });
    Mock::given(method("POST")).and(path("/new-authz"))
        .respond_with(
            ResponseTemplate::new(201)
                .insert_header("replay-nonce", "n2")
                .insert_header("location", format!("{}/authz/1", server.uri()))
                .insert_header("content-type", "application/json")
                .set_body_json(challenge_body.clone()),
        )
        .mount(server).await;

    let pending = ResponseTemplate::new(200)
        .insert_header("content-type", "application/json")
        .set_body_json(challenge_body);
    let valid = ResponseTemplate::new(200)
        .insert_header("content-type", "application/json")
        .set_body_json(serde_json::json!({"status": "valid"}));
    Mock::given(method("GET")).and(path("/authz/1"))
        .respond_with(Sequence::new(vec![pending, valid]))
        .mount(server).await;

    Mock::given(method("POST")).and(path("/challenge/1"))
        .respond_with(ResponseTemplate::new(200).insert_header("replay-nonce", "n3"))
        .mount(server).await;

    Mock::given(method("POST")).and(path("/new-cert"))
        .respond_with(
            ResponseTemplate::new(201)
                .insert_header("replay-nonce", "n4")
                .insert_header("location", format!("{}/cert/1", server.uri())),
        )
        .mount(server).await;
    Mock::given(method("GET")).and(path("/cert/1"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("link", format!("<{}/issuer>; rel=\"up\"", server.uri()))
                .set_body_bytes(leaf.to_der().unwrap()),
        )
        .mount(server).await;
    Mock::given(method("GET")).and(path("/issuer"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(issuer.to_der().unwrap()))
        .mount(server).await;

    let _ = domain;
}

async fn fresh_store() -> (tempfile::TempDir, FsStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = FsStore::open(dir.path()).await.unwrap();
    (dir, store)
}

async fn seed_account(store: &FsStore, id: &str, url: &str, ca_url: &str, disabled: bool) -> PKey<Private> {
    let key = crypto::generate_rsa(2048).unwrap();
    let account = Account {
        id: id.to_string(),
        url: url.to_string(),
        ca_url: ca_url.to_string(),
        contacts: vec!["mailto:admin@example.org".to_string()],
        agreement: None,
        disabled,
    };
    let meta = Json::from_typed(&account).unwrap();
    store.save(Group::Accounts, id, "acct.json", StoreValue::Json(meta), false).await.unwrap();
    let pem = crypto::encode_private_key(&key).unwrap();
    let stored_key = crypto::decode_private_key(&pem).unwrap();
    store.save(Group::Accounts, id, "acct.pem", StoreValue::Pkey(stored_key), false).await.unwrap();
    key
}

async fn count_accounts(store: &FsStore) -> usize {
    let mut n = 0;
    store
        .iterate(Group::Accounts, "*", "acct.json", VType::Json, &mut |_name, _value| {
            n += 1;
            acmemd::store::IterControl::Continue
        })
        .await
        .unwrap();
    n
}

#[tokio::test]
async fn fresh_registration_completes_full_drive_cycle() {
    let server = MockServer::start().await;
    mount_completing_ca(&server, "example.org").await;

    let (_dir, store) = fresh_store().await;
    let mut md = ManagedDomain::new(
        vec!["example.org".to_string()],
        format!("{}/directory", server.uri()),
        vec!["mailto:admin@example.org".to_string()],
        false,
    )
    .unwrap();

    let settings = DriveSettings::default();
    drive::drive(&store, &mut md, &settings, None).await.unwrap();

    assert!(md.ca.account.is_some());
    assert_eq!(count_accounts(&store).await, 1);

    let cert = store
        .load(Group::Domains, "example.org", "cert.pem", VType::Cert)
        .await
        .unwrap();
    assert!(cert.into_cert().is_some());
    let chain = store
        .load(Group::Domains, "example.org", "chain.pem", VType::Chain)
        .await
        .unwrap();
    assert_eq!(chain.into_chain().unwrap().len(), 1);
    let pkey = store
        .load(Group::Domains, "example.org", "pkey.pem", VType::Pkey)
        .await
        .unwrap();
    assert!(pkey.into_pkey().is_some());

    // staging is cleared after promotion
    assert!(store
        .load(Group::Staging, "example.org", "cert.pem", VType::Cert)
        .await
        .is_err());
}

#[tokio::test]
async fn resuming_with_existing_account_does_not_register_a_second_one() {
    let server = MockServer::start().await;
    mount_completing_ca(&server, "example.org").await;
    // make validate() against the pre-existing account succeed
    Mock::given(method("POST"))
        .and(path("/acct/pre-existing"))
        .respond_with(ResponseTemplate::new(200).insert_header("replay-nonce", "nv"))
        .mount(&server)
        .await;

    let (_dir, store) = fresh_store().await;
    let ca_url = format!("{}/directory", server.uri());
    let account_url = format!("{}/acct/pre-existing", server.uri());
    seed_account(&store, "pre-existing", &account_url, &ca_url, false).await;

    let mut md = ManagedDomain::new(
        vec!["example.org".to_string()],
        ca_url,
        vec!["mailto:admin@example.org".to_string()],
        false,
    )
    .unwrap();
    md.ca.account = Some("pre-existing".to_string());

    let settings = DriveSettings::default();
    drive::drive(&store, &mut md, &settings, None).await.unwrap();

    assert_eq!(md.ca.account.as_deref(), Some("pre-existing"));
    assert_eq!(count_accounts(&store).await, 1);
}

#[tokio::test]
async fn invalid_prior_authorization_is_replaced_before_driving_to_completion() {
    let server = MockServer::start().await;
    mount_completing_ca(&server, "example.org").await;
    Mock::given(method("POST"))
        .and(path("/acct/pre-existing"))
        .respond_with(ResponseTemplate::new(200).insert_header("replay-nonce", "nv"))
        .mount(&server)
        .await;
    // the stale authz's own location must report INVALID when polled
    Mock::given(method("GET"))
        .and(path("/authz/stale"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/json")
                .set_body_json(serde_json::json!({"status": "invalid"})),
        )
        .mount(&server)
        .await;

    let (_dir, store) = fresh_store().await;
    let ca_url = format!("{}/directory", server.uri());
    let account_url = format!("{}/acct/pre-existing", server.uri());
    seed_account(&store, "pre-existing", &account_url, &ca_url, false).await;

    let stale_set = AuthorizationSet {
        account: "pre-existing".to_string(),
        authorizations: vec![Authorization {
            domain: "example.org".to_string(),
            location: format!("{}/authz/stale", server.uri()),
            resource: serde_json::json!({"status": "invalid"}),
            expires: None,
            state: AuthzState::Invalid,
        }],
    };
    authz::save_set(&store, "example.org", &stale_set).await.unwrap();

    let mut md = ManagedDomain::new(
        vec!["example.org".to_string()],
        ca_url,
        vec!["mailto:admin@example.org".to_string()],
        false,
    )
    .unwrap();
    md.ca.account = Some("pre-existing".to_string());

    let settings = DriveSettings::default();
    drive::drive(&store, &mut md, &settings, None).await.unwrap();

    let final_set = authz::load_set(&store, "example.org").await.unwrap().unwrap();
    assert_eq!(final_set.authorizations.len(), 1);
    assert_eq!(final_set.authorizations[0].state, AuthzState::Valid);
    assert_ne!(final_set.authorizations[0].location, format!("{}/authz/stale", server.uri()));
}

#[tokio::test]
async fn deleted_account_is_disabled_and_replaced_with_a_fresh_one() {
    let server = MockServer::start().await;
    mount_completing_ca(&server, "example.org").await;
    // the CA has forgotten this account: any signed POST to it now 404s
    Mock::given(method("POST"))
        .and(path("/acct/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let (_dir, store) = fresh_store().await;
    let ca_url = format!("{}/directory", server.uri());
    let account_url = format!("{}/acct/gone", server.uri());
    seed_account(&store, "gone", &account_url, &ca_url, false).await;

    let mut md = ManagedDomain::new(
        vec!["example.org".to_string()],
        ca_url,
        vec!["mailto:admin@example.org".to_string()],
        false,
    )
    .unwrap();
    md.ca.account = Some("gone".to_string());

    let settings = DriveSettings::default();
    drive::drive(&store, &mut md, &settings, None).await.unwrap();

    // the stale account stays on disk, disabled, and a new one replaces it
    assert_ne!(md.ca.account.as_deref(), Some("gone"));
    assert_eq!(count_accounts(&store).await, 2);
    let stale = store
        .load(Group::Accounts, "gone", "acct.json", VType::Json)
        .await
        .unwrap()
        .into_json()
        .unwrap();
    assert_eq!(stale.get_bool(&acmemd::json::Path::single("disabled")), Some(true));
}
