//! The ACME transport (spec §4.6): directory fetch, single-slot nonce
//! pool, JWS-signed POST, RFC 7807 problem translation. Grounded in
//! `examples/aicers-bootroot`'s deleted `acme/client.rs` `AcmeClient`,
//! generalized from RFC 8555's `newAccount`/`newOrder` resource names to
//! the `new-reg`/`new-authz`/`new-cert`/`revoke-cert` directory this
//! specification names, and from EC/ES256 signing to RSA/RS256.
//!
//! Single-in-flight-request discipline (spec §4.6, §5) falls out of
//! `&mut self` on every method here: the borrow checker already forbids
//! two signed requests sharing one `AcmeClient`'s nonce slot.

use std::collections::HashMap;

use openssl::pkey::{PKey, Private};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{AcmeMdError, Result};
use crate::http::HttpClient;
use crate::json::Json;
use crate::jws::{self, KeyId};
use crate::util::parse_link_header;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    NewReg,
    NewAuthz,
    NewCert,
    RevokeCert,
}

#[derive(Debug, Clone, Deserialize)]
struct Directory {
    #[serde(rename = "new-reg")]
    new_reg: String,
    #[serde(rename = "new-authz")]
    new_authz: String,
    #[serde(rename = "new-cert")]
    new_cert: String,
    #[serde(rename = "revoke-cert")]
    revoke_cert: String,
}

impl Directory {
    fn url(&self, resource: Resource) -> &str {
        match resource {
            Resource::NewReg => &self.new_reg,
            Resource::NewAuthz => &self.new_authz,
            Resource::NewCert => &self.new_cert,
            Resource::RevokeCert => &self.revoke_cert,
        }
    }
}

/// The outcome of a transport call: status, `Location`/`Link` headers,
/// and the parsed JSON body (empty object if the response carried none).
#[derive(Debug, Clone)]
pub struct AcmeResponse {
    pub status: u16,
    pub location: Option<String>,
    pub links: HashMap<String, String>,
    pub body: Json,
}

pub struct AcmeClient {
    http: HttpClient,
    directory_url: String,
    directory: Option<Directory>,
    nonce: Option<String>,
}

impl AcmeClient {
    #[must_use]
    pub fn new(directory_url: String) -> Self {
        Self {
            http: HttpClient::new(),
            directory_url,
            directory: None,
            nonce: None,
        }
    }

    #[must_use]
    pub fn ca_url(&self) -> &str {
        &self.directory_url
    }

    /// Fetches and caches the ACME directory. Fails if any of the four
    /// resources this crate needs is missing.
    pub async fn setup(&mut self) -> Result<()> {
        if self.directory.is_some() {
            return Ok(());
        }
        let resp = self.http.get(&self.directory_url).await?;
        self.capture_nonce(&resp);
        if !resp.is_success() {
            return Err(AcmeMdError::General(format!(
                "directory fetch failed with status {}",
                resp.status
            )));
        }
        let directory: Directory = serde_json::from_slice(&resp.body).map_err(|err| {
            AcmeMdError::General(format!("directory response missing a required resource: {err}"))
        })?;
        self.directory = Some(directory);
        Ok(())
    }

    fn directory_ref(&self) -> Result<&Directory> {
        self.directory
            .as_ref()
            .ok_or_else(|| AcmeMdError::General("ACME directory not fetched yet".to_string()))
    }

    #[must_use]
    pub fn resource_url(&self, resource: Resource) -> Option<String> {
        self.directory.as_ref().map(|d| d.url(resource).to_string())
    }

    async fn ensure_nonce(&mut self) -> Result<()> {
        if self.nonce.is_some() {
            return Ok(());
        }
        let new_reg = self.directory_ref()?.new_reg.clone();
        let resp = self.http.head(&new_reg).await?;
        let nonce = resp
            .header("replay-nonce")
            .ok_or_else(|| AcmeMdError::General("server did not supply a nonce".to_string()))?
            .to_string();
        self.nonce = Some(nonce);
        Ok(())
    }

    fn capture_nonce(&mut self, resp: &crate::http::Response) {
        if let Some(nonce) = resp.header("replay-nonce") {
            self.nonce = Some(nonce.to_string());
        }
    }

    /// Issues a plain, unsigned GET (used for `authz.location` polling and
    /// certificate/chain retrieval, spec §4.8/§4.9).
    pub async fn get(&mut self, url: &str) -> Result<AcmeResponse> {
        let resp = self.http.get(url).await?;
        self.capture_nonce(&resp);
        self.to_acme_response(resp)
    }

    /// A plain, unsigned GET that returns the raw response untouched by
    /// JSON coercion — used for the DER certificate/chain bodies the
    /// `new-cert` location and its issuer `Link` return (spec §4.9 phase
    /// 7), which are not JSON documents.
    pub async fn get_raw(&mut self, url: &str) -> Result<crate::http::Response> {
        let resp = self.http.get(url).await?;
        self.capture_nonce(&resp);
        Ok(resp)
    }

    /// Executes a JWS-signed POST against `url` per spec §4.6's
    /// `req_do`: ensures directory and nonce, signs `payload` with `key`
    /// under `key_id`, clears the consumed nonce immediately, and maps
    /// non-2xx `application/problem+json` bodies via the RFC 7807 table.
    pub async fn req_do(
        &mut self,
        url: &str,
        key: &PKey<Private>,
        key_id: &KeyId,
        payload: &[u8],
    ) -> Result<AcmeResponse> {
        self.setup().await?;
        self.ensure_nonce().await?;
        let nonce = self.nonce.take().expect("ensure_nonce just populated it");

        let body = jws::sign(key, url, &nonce, key_id, payload)?;
        let body_bytes = serde_json::to_vec(&body)?;

        let resp = self.http.post(url, "application/json", body_bytes).await?;
        self.capture_nonce(&resp);

        if resp.is_success() {
            return self.to_acme_response(resp);
        }

        if (300..400).contains(&resp.status) {
            let location = resp.header("location").unwrap_or("none");
            return Err(AcmeMdError::General(format!(
                "unexpected redirect (status {}) from signed request to {url}, Location: {location}",
                resp.status
            )));
        }

        if resp.content_type().is_some_and(|ct| ct.starts_with("application/problem+json")) {
            let problem: Value = serde_json::from_slice(&resp.body).unwrap_or(Value::Null);
            let problem_type = problem.get("type").and_then(Value::as_str).unwrap_or("");
            let detail = problem
                .get("detail")
                .and_then(Value::as_str)
                .unwrap_or("ACME server returned a problem document")
                .to_string();
            return Err(map_problem(problem_type, detail));
        }

        Err(map_status(resp.status))
    }

    fn to_acme_response(&self, resp: crate::http::Response) -> Result<AcmeResponse> {
        let location = resp.header("location").map(str::to_string);
        let links = resp.header("link").map(parse_link_header).unwrap_or_default();
        let body = if resp.body.is_empty() {
            Json::new()
        } else if resp
            .content_type()
            .is_some_and(|ct| ct.starts_with("application/json"))
        {
            Json::parse(&resp.body)?
        } else {
            Json::new()
        };
        Ok(AcmeResponse {
            status: resp.status,
            location,
            links,
            body,
        })
    }
}

/// Maps an RFC 7807 `type` URI to the local error taxonomy per spec
/// §4.6's table: strips the `urn:ietf:params:` then `urn:` prefixes and
/// matches case-insensitively; unknown types map to `General`.
fn map_problem(problem_type: &str, detail: String) -> AcmeMdError {
    let stripped = problem_type
        .strip_prefix("urn:ietf:params:")
        .unwrap_or(problem_type);
    let stripped = stripped.strip_prefix("urn:").unwrap_or(stripped);
    let stripped = stripped.strip_prefix("acme:error:").unwrap_or(stripped);
    let lower = stripped.to_lowercase();

    match lower.as_str() {
        "badcsr" | "badsignaturealgorithm" | "malformed" | "badrevocationreason" => {
            AcmeMdError::InvalidArgument(detail)
        }
        "badnonce" | "serverinternal" | "caa" | "dns" | "connection" | "tls" | "incorrectresponse"
        | "unsupportedcontact" => AcmeMdError::General(detail),
        "invalidcontact" | "ratelimited" | "rejectedidentifier" | "unsupportedidentifier" => {
            AcmeMdError::BadArgument(detail)
        }
        "unauthorized" => AcmeMdError::AccessDenied(detail),
        "useractionrequired" => AcmeMdError::RetryLater(detail),
        _ => AcmeMdError::General(detail),
    }
}

fn map_status(status: u16) -> AcmeMdError {
    match status {
        400 => AcmeMdError::InvalidArgument(format!("ACME server returned status {status}")),
        403 => AcmeMdError::AccessDenied(format!("ACME server returned status {status}")),
        404 => AcmeMdError::NotFound(format!("ACME server returned status {status}")),
        _ => AcmeMdError::General(format!("ACME server returned status {status}")),
    }
}
