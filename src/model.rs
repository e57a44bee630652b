//! The data model shared by the store, the registry, and the drive state
//! machine: `ManagedDomain` (MD), `Account`, and the per-MD
//! `AuthorizationSet`. Mirrors the JSON schemas in spec §6.

use serde::{Deserialize, Serialize};

/// `state` is derived for display purposes only; on-disk credentials are
/// the authority for whether an MD has a usable certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MdState {
    Unknown,
    Incomplete,
    Complete,
    Expired,
    Error,
}

impl Default for MdState {
    fn default() -> Self {
        MdState::Unknown
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaRef {
    pub url: String,
    #[serde(default = "default_proto")]
    pub proto: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agreement: Option<String>,
}

fn default_proto() -> String {
    "ACME".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedDomain {
    pub name: String,
    pub domains: Vec<String>,
    pub ca: CaRef,
    #[serde(default)]
    pub contacts: Vec<String>,
    #[serde(default)]
    pub must_staple: bool,
    #[serde(default)]
    pub state: MdState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defn_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defn_line_number: Option<u32>,
}

impl ManagedDomain {
    /// Builds a new MD from a declared domain list: lowercases and
    /// deduplicates `domains` while preserving first-seen order, and
    /// defaults `name` to the first listed name.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if `domains` is empty.
    pub fn new(
        domains: Vec<String>,
        ca_url: String,
        contacts: Vec<String>,
        must_staple: bool,
    ) -> crate::error::Result<Self> {
        let mut seen = std::collections::BTreeSet::new();
        let mut normalized = Vec::new();
        for d in domains {
            let lowered = d.to_lowercase();
            if seen.insert(lowered.clone()) {
                normalized.push(lowered);
            }
        }
        if normalized.is_empty() {
            return Err(crate::error::AcmeMdError::InvalidArgument(
                "a managed domain needs at least one DNS name".to_string(),
            ));
        }
        let name = normalized[0].clone();
        let contacts = contacts
            .into_iter()
            .map(|c| schemify_contact(&c))
            .collect();
        Ok(Self {
            name,
            domains: normalized,
            ca: CaRef {
                url: ca_url,
                proto: default_proto(),
                account: None,
                agreement: None,
            },
            contacts,
            must_staple,
            state: MdState::Unknown,
            defn_name: None,
            defn_line_number: None,
        })
    }

    #[must_use]
    pub fn contains_domain(&self, domain: &str) -> bool {
        let lowered = domain.to_lowercase();
        self.domains.iter().any(|d| *d == lowered)
    }

    /// True if `self.domains` shares at least one name with `other.domains`.
    #[must_use]
    pub fn overlaps(&self, other: &ManagedDomain) -> bool {
        self.domains.iter().any(|d| other.contains_domain(d))
    }

    #[cfg(test)]
    #[must_use]
    pub fn new_for_test(name: &str, domains: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            domains: domains.iter().map(|d| d.to_lowercase()).collect(),
            ca: CaRef {
                url: "https://ca.test/acme".to_string(),
                proto: default_proto(),
                account: None,
                agreement: None,
            },
            contacts: vec!["mailto:admin@example.org".to_string()],
            must_staple: false,
            state: MdState::Unknown,
            defn_name: None,
            defn_line_number: None,
        }
    }
}

/// Defaults the scheme to `mailto:` when the contact URI carries none.
#[must_use]
pub fn schemify_contact(contact: &str) -> String {
    if contact.contains(':') {
        contact.to_string()
    } else {
        format!("mailto:{contact}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub url: String,
    pub ca_url: String,
    #[serde(default, rename = "contact")]
    pub contacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agreement: Option<String>,
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuthzState {
    Pending,
    Valid,
    Invalid,
    Revoked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Authorization {
    pub domain: String,
    pub location: String,
    #[serde(default)]
    pub resource: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<String>,
    pub state: AuthzState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationSet {
    pub account: String,
    #[serde(default)]
    pub authorizations: Vec<Authorization>,
}

impl AuthorizationSet {
    #[must_use]
    pub fn new(account: String) -> Self {
        Self {
            account,
            authorizations: Vec::new(),
        }
    }

    #[must_use]
    pub fn find(&self, domain: &str) -> Option<&Authorization> {
        self.authorizations.iter().find(|a| a.domain == domain)
    }

    pub fn replace(&mut self, authz: Authorization) {
        self.authorizations.retain(|a| a.domain != authz.domain);
        self.authorizations.push(authz);
    }

    pub fn remove(&mut self, domain: &str) {
        self.authorizations.retain(|a| a.domain != domain);
    }

    #[must_use]
    pub fn all_valid(&self, domains: &[String]) -> bool {
        domains.iter().all(|d| {
            self.find(d)
                .is_some_and(|a| a.state == AuthzState::Valid)
        })
    }
}
