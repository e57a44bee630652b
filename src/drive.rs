//! The per-MD drive state machine (spec §4.9): eight sequential,
//! idempotent, resumable phases from "known names" to "valid certificate
//! on disk". Grounded in the deleted `acme/flow.rs`'s `issue_certificate`
//! orchestration, generalized to the RSA/non-EAB account model and
//! restructured around the ACME/account/authz modules.

use std::time::Duration;

use openssl::x509::X509;

use crate::acme::transport::{AcmeClient, Resource};
use crate::acme::{account, authz};
use crate::crypto;
use crate::error::{AcmeMdError, Result};
use crate::json::{Format, Json, Path};
use crate::jws::KeyId;
use crate::model::{AuthorizationSet, AuthzState, ManagedDomain};
use crate::store::{Group, Store, StoreValue, VType};
use crate::util::{backoff_schedule, parse_link_header};

const ASPECT_MD: &str = "md.json";
const ASPECT_PKEY: &str = "pkey.pem";
const ASPECT_CERT: &str = "cert.pem";
const ASPECT_CHAIN: &str = "chain.pem";

/// Polling parameters for the monitor-challenges and certificate-issuance
/// phases (spec §4.9, SPEC_FULL Open Question 2): 1s→2s→4s backoff
/// capped at 30s, 300s total timeout, all configurable.
#[derive(Debug, Clone, Copy)]
pub struct DriveSettings {
    pub poll_floor: Duration,
    pub poll_cap: Duration,
    pub poll_timeout: Duration,
}

impl Default for DriveSettings {
    fn default() -> Self {
        Self {
            poll_floor: Duration::from_secs(1),
            poll_cap: Duration::from_secs(30),
            poll_timeout: Duration::from_secs(300),
        }
    }
}

/// Drives `md` through every phase. `default_agreement` substitutes for
/// `md.ca.agreement` when the MD names none (spec §4.9 phase 3).
pub async fn drive(
    store: &dyn Store,
    md: &mut ManagedDomain,
    settings: &DriveSettings,
    default_agreement: Option<&str>,
) -> Result<()> {
    tracing::info!(md = %md.name, step = "acme-setup", "starting drive");
    let mut acme = AcmeClient::new(md.ca.url.clone());
    acme.setup().await.map_err(|err| step_error("acme-setup", err))?;

    tracing::info!(md = %md.name, step = "choose-account", "selecting account");
    let (mut acc, key) = choose_account(store, md, &mut acme)
        .await
        .map_err(|err| step_error("choose-account", err))?;

    tracing::info!(md = %md.name, step = "check-agreement", "checking ToS agreement");
    if let Some(required) = md.ca.agreement.as_deref().or(default_agreement) {
        account::check_agreement(store, &mut acme, &mut acc, &key, required)
            .await
            .map_err(|err| step_error("check-agreement", err))?;
        md.ca.agreement = Some(required.to_string());
    }

    tracing::info!(md = %md.name, step = "setup-authorizations", "reconciling authorizations");
    let mut set = setup_authorizations(store, md, &mut acme, &acc.id, &key)
        .await
        .map_err(|err| step_error("setup-authorizations", err))?;

    tracing::info!(md = %md.name, step = "start-challenges", "starting challenges");
    start_challenges(store, md, &mut acme, &key, &mut set)
        .await
        .map_err(|err| step_error("start-challenges", err))?;

    tracing::info!(md = %md.name, step = "monitor-challenges", "polling for validation");
    monitor_challenges(&mut acme, md, &mut set, settings)
        .await
        .map_err(|err| step_error("monitor-challenges", err))?;
    authz::save_set(store, &md.name, &set)
        .await
        .map_err(|err| step_error("monitor-challenges", err))?;

    tracing::info!(md = %md.name, step = "setup-certificate", "issuing certificate");
    setup_certificate(store, md, &mut acme, &key, settings)
        .await
        .map_err(|err| step_error("setup-certificate", err))?;

    tracing::info!(md = %md.name, step = "promote", "promoting staging to domains");
    promote(store, md).await.map_err(|err| step_error("promote", err))?;

    Ok(())
}

fn step_error(step: &'static str, err: AcmeMdError) -> AcmeMdError {
    match err {
        AcmeMdError::General(msg) => AcmeMdError::General(format!("[{step}] {msg}")),
        other => other,
    }
}

async fn choose_account(
    store: &dyn Store,
    md: &mut ManagedDomain,
    acme: &mut AcmeClient,
) -> Result<(crate::model::Account, openssl::pkey::PKey<openssl::pkey::Private>)> {
    if let Some(id) = md.ca.account.clone() {
        let (acc, key) = account::load(store, &id).await?;
        match account::validate(acme, &acc, &key).await {
            Ok(()) => return Ok((acc, key)),
            Err(AcmeMdError::AccessDenied(_) | AcmeMdError::NotFound(_)) => {
                let mut acc = acc;
                account::disable(store, &mut acc, &key).await?;
                md.ca.account = None;
            }
            Err(err) => return Err(err),
        }
    }

    if let Some((acc, key)) = account::find(store, &md.ca.url).await? {
        if account::validate(acme, &acc, &key).await.is_ok() {
            md.ca.account = Some(acc.id.clone());
            return Ok((acc, key));
        }
    }

    let acc = account::register(store, acme, &md.contacts, md.ca.agreement.as_deref()).await?;
    let (_, key) = account::load(store, &acc.id).await?;
    md.ca.account = Some(acc.id.clone());
    Ok((acc, key))
}

async fn setup_authorizations(
    store: &dyn Store,
    md: &ManagedDomain,
    acme: &mut AcmeClient,
    acct_id: &str,
    key: &openssl::pkey::PKey<openssl::pkey::Private>,
) -> Result<AuthorizationSet> {
    let mut set = authz::load_set(store, &md.name)
        .await?
        .unwrap_or_else(|| AuthorizationSet::new(acct_id.to_string()));
    set.account = acct_id.to_string();

    for domain in &md.domains {
        if let Some(existing) = set.find(domain).cloned() {
            let mut existing = existing;
            authz::update(acme, &mut existing).await?;
            if existing.state == AuthzState::Invalid || existing.state == AuthzState::Revoked {
                set.remove(domain);
            } else {
                set.replace(existing);
                continue;
            }
        }

        let fresh = authz::register(acme, key, &KeyId::Kid(acct_id.to_string()), domain).await?;
        set.replace(fresh);
        authz::save_set(store, &md.name, &set).await?;
    }

    authz::save_set(store, &md.name, &set).await?;
    Ok(set)
}

async fn start_challenges(
    store: &dyn Store,
    md: &ManagedDomain,
    acme: &mut AcmeClient,
    key: &openssl::pkey::PKey<openssl::pkey::Private>,
    set: &mut AuthorizationSet,
) -> Result<()> {
    let acct_id = set.account.clone();
    for domain in &md.domains {
        let mut authz = set
            .find(domain)
            .cloned()
            .ok_or_else(|| AcmeMdError::General(format!("no authorization registered for {domain}")))?;

        authz::update(acme, &mut authz).await?;
        match authz.state {
            AuthzState::Valid => {}
            AuthzState::Pending => {
                authz::respond(store, acme, key, &KeyId::Kid(acct_id.clone()), &authz).await?;
            }
            AuthzState::Invalid | AuthzState::Revoked => {
                return Err(AcmeMdError::General(format!(
                    "authorization for {domain} is {:?}, cannot start challenge",
                    authz.state
                )));
            }
        }
        set.replace(authz);
    }
    authz::save_set(store, &md.name, set).await
}

async fn monitor_challenges(
    acme: &mut AcmeClient,
    md: &ManagedDomain,
    set: &mut AuthorizationSet,
    settings: &DriveSettings,
) -> Result<()> {
    let schedule = backoff_schedule(settings.poll_floor, settings.poll_cap, settings.poll_timeout);
    let mut pending: Vec<String> = md.domains.clone();

    for delay in std::iter::once(Duration::ZERO).chain(schedule.into_iter()) {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut still_pending = Vec::new();
        for domain in &pending {
            let mut authz = set
                .find(domain)
                .cloned()
                .ok_or_else(|| AcmeMdError::General(format!("no authorization for {domain}")))?;
            authz::update(acme, &mut authz).await?;
            match authz.state {
                AuthzState::Valid => {}
                AuthzState::Invalid | AuthzState::Revoked => {
                    set.replace(authz);
                    return Err(AcmeMdError::General(format!(
                        "authorization for {domain} became invalid while polling"
                    )));
                }
                AuthzState::Pending => still_pending.push(domain.clone()),
            }
            set.replace(authz);
        }
        pending = still_pending;
        if pending.is_empty() {
            return Ok(());
        }
    }

    Err(AcmeMdError::Timeout(format!(
        "authorizations for {:?} did not become valid within {:?}",
        pending, settings.poll_timeout
    )))
}

async fn setup_certificate(
    store: &dyn Store,
    md: &ManagedDomain,
    acme: &mut AcmeClient,
    key: &openssl::pkey::PKey<openssl::pkey::Private>,
    settings: &DriveSettings,
) -> Result<()> {
    let service_key = load_or_generate_service_key(store, md).await?;
    let der = crypto::build_csr(md, &service_key)?;

    let new_cert_url = acme
        .resource_url(Resource::NewCert)
        .ok_or_else(|| AcmeMdError::General("directory is missing new-cert".to_string()))?;

    let mut payload = Json::new();
    payload.set_string(&Path::single("csr"), &crypto::base64url_encode(&der));
    let payload_bytes = payload.write(Format::Compact).into_bytes();

    let acct_id = md
        .ca
        .account
        .clone()
        .ok_or_else(|| AcmeMdError::General("no account chosen before certificate issuance".to_string()))?;
    let resp = acme
        .req_do(&new_cert_url, key, &KeyId::Kid(acct_id), &payload_bytes)
        .await?;
    let cert_location = resp
        .location
        .ok_or_else(|| AcmeMdError::General("new-cert response carried no Location".to_string()))?;

    let schedule = backoff_schedule(settings.poll_floor, settings.poll_cap, settings.poll_timeout);
    let mut cert_bytes: Option<Vec<u8>> = None;
    let mut issuer_link: Option<String> = None;

    for delay in std::iter::once(Duration::ZERO).chain(schedule.into_iter()) {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let resp = acme.get_raw(&cert_location).await?;
        if resp.is_success() {
            issuer_link = resp.header("link").map(parse_link_header).and_then(|l| l.get("up").cloned());
            cert_bytes = Some(resp.body);
            break;
        }
    }

    let cert_bytes = cert_bytes.ok_or_else(|| {
        AcmeMdError::Timeout(format!(
            "certificate at {cert_location} was not issued within {:?}",
            settings.poll_timeout
        ))
    })?;
    let cert = decode_cert_body(&cert_bytes)?;

    let chain = if let Some(issuer_url) = issuer_link {
        let resp = acme.get_raw(&issuer_url).await?;
        if resp.is_success() {
            vec![decode_cert_body(&resp.body)?]
        } else {
            Vec::new()
        }
    } else {
        Vec::new()
    };

    store
        .save(Group::Staging, &md.name, ASPECT_PKEY, StoreValue::Pkey(service_key), false)
        .await?;
    store
        .save(Group::Staging, &md.name, ASPECT_CERT, StoreValue::Cert(cert), false)
        .await?;
    store
        .save(Group::Staging, &md.name, ASPECT_CHAIN, StoreValue::Chain(chain), false)
        .await?;
    Ok(())
}

/// The CA may return the certificate body as DER or as PEM depending on
/// `Accept` negotiation; try DER first, fall back to PEM.
fn decode_cert_body(bytes: &[u8]) -> Result<X509> {
    X509::from_der(bytes)
        .or_else(|_| crypto::decode_certificate(bytes))
        .map_err(|err| AcmeMdError::General(format!("could not decode certificate body: {err}")))
}

async fn load_or_generate_service_key(
    store: &dyn Store,
    md: &ManagedDomain,
) -> Result<openssl::pkey::PKey<openssl::pkey::Private>> {
    match store.load(Group::Staging, &md.name, ASPECT_PKEY, VType::Pkey).await {
        Ok(value) => Ok(value.into_pkey().expect("VType::Pkey decodes to StoreValue::Pkey")),
        Err(AcmeMdError::NotFound(_)) => crypto::generate_rsa(crypto::DEFAULT_RSA_BITS),
        Err(err) => Err(err),
    }
}

async fn promote(store: &dyn Store, md: &ManagedDomain) -> Result<()> {
    let pkey = store
        .load(Group::Staging, &md.name, ASPECT_PKEY, VType::Pkey)
        .await?
        .into_pkey()
        .expect("VType::Pkey decodes to StoreValue::Pkey");
    let cert = store
        .load(Group::Staging, &md.name, ASPECT_CERT, VType::Cert)
        .await?
        .into_cert()
        .expect("VType::Cert decodes to StoreValue::Cert");
    let chain = store
        .load(Group::Staging, &md.name, ASPECT_CHAIN, VType::Chain)
        .await?
        .into_chain()
        .expect("VType::Chain decodes to StoreValue::Chain");

    store
        .save(Group::Domains, &md.name, ASPECT_PKEY, StoreValue::Pkey(pkey), false)
        .await?;
    store
        .save(Group::Domains, &md.name, ASPECT_CERT, StoreValue::Cert(cert), false)
        .await?;
    store
        .save(Group::Domains, &md.name, ASPECT_CHAIN, StoreValue::Chain(chain), false)
        .await?;
    let md_json = Json::from_typed(md)?;
    store
        .save(Group::Domains, &md.name, ASPECT_MD, StoreValue::Json(md_json), false)
        .await?;
    store.purge(Group::Staging, &md.name).await
}

/// `needs_renewal(cert)`, the injectable predicate from SPEC_FULL Open
/// Question 1.
pub trait RenewalPolicy: Send + Sync {
    fn needs_renewal(&self, cert: &X509) -> bool;
}

pub struct DefaultRenewalPolicy {
    pub renew_within: Duration,
}

impl Default for DefaultRenewalPolicy {
    fn default() -> Self {
        Self::from_days(30)
    }
}

impl DefaultRenewalPolicy {
    #[must_use]
    pub fn from_days(days: u32) -> Self {
        Self {
            renew_within: Duration::from_secs(u64::from(days) * 24 * 3600),
        }
    }
}

impl RenewalPolicy for DefaultRenewalPolicy {
    fn needs_renewal(&self, cert: &X509) -> bool {
        let not_after = cert.not_after();
        let now = openssl::asn1::Asn1Time::days_from_now(0).expect("day offset 0 is always valid");
        let Ok(remaining) = now.diff(not_after) else {
            return true;
        };
        if remaining.days < 0 {
            return true;
        }
        let remaining_secs = i64::from(remaining.days) * 86_400 + i64::from(remaining.secs);
        remaining_secs <= i64::try_from(self.renew_within.as_secs()).unwrap_or(i64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_renewal_policy_flags_near_expiry_certificates() {
        let key = crypto::generate_rsa(2048).unwrap();
        let md = ManagedDomain::new_for_test("example.org", &["example.org"]);
        let der = crypto::build_csr(&md, &key).unwrap();
        let req = openssl::x509::X509Req::from_der(&der).unwrap();

        let mut builder = openssl::x509::X509::builder().unwrap();
        builder.set_subject_name(req.subject_name()).unwrap();
        builder.set_pubkey(&key).unwrap();
        let not_before = openssl::asn1::Asn1Time::days_from_now(0).unwrap();
        let soon = openssl::asn1::Asn1Time::days_from_now(5).unwrap();
        builder.set_not_before(&not_before).unwrap();
        builder.set_not_after(&soon).unwrap();
        builder.sign(&key, openssl::hash::MessageDigest::sha256()).unwrap();
        let cert = builder.build();

        let policy = DefaultRenewalPolicy::default();
        assert!(policy.needs_renewal(&cert));

        let far = openssl::asn1::Asn1Time::days_from_now(300).unwrap();
        let mut builder2 = openssl::x509::X509::builder().unwrap();
        builder2.set_subject_name(req.subject_name()).unwrap();
        builder2.set_pubkey(&key).unwrap();
        builder2.set_not_before(&not_before).unwrap();
        builder2.set_not_after(&far).unwrap();
        builder2.sign(&key, openssl::hash::MessageDigest::sha256()).unwrap();
        let cert2 = builder2.build();
        assert!(!policy.needs_renewal(&cert2));
    }
}
