//! The content-addressed store: keyed by `(group, name, aspect)`, typed
//! values, atomic replace. Contract follows
//! `examples/original_source/mod_md/md_store.h`; `fs` is the filesystem
//! backing implementation described in spec §4.1/§6.

mod fs;

pub use fs::FsStore;

use openssl::pkey::{PKey, Private};
use openssl::x509::X509;

use crate::error::Result;
use crate::json::Json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Group {
    Accounts,
    Challenges,
    Domains,
    Staging,
}

impl Group {
    #[must_use]
    pub fn dir_name(self) -> &'static str {
        match self {
            Group::Accounts => "accounts",
            Group::Challenges => "challenges",
            Group::Domains => "domains",
            Group::Staging => "staging",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VType {
    Text,
    Json,
    Cert,
    Pkey,
    Chain,
}

pub enum StoreValue {
    Text(String),
    Json(Json),
    Cert(X509),
    Pkey(PKey<Private>),
    Chain(Vec<X509>),
}

impl StoreValue {
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            StoreValue::Text(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn into_text(self) -> Option<String> {
        match self {
            StoreValue::Text(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_json(&self) -> Option<&Json> {
        match self {
            StoreValue::Json(j) => Some(j),
            _ => None,
        }
    }

    #[must_use]
    pub fn into_json(self) -> Option<Json> {
        match self {
            StoreValue::Json(j) => Some(j),
            _ => None,
        }
    }

    #[must_use]
    pub fn into_pkey(self) -> Option<PKey<Private>> {
        match self {
            StoreValue::Pkey(k) => Some(k),
            _ => None,
        }
    }

    #[must_use]
    pub fn into_cert(self) -> Option<X509> {
        match self {
            StoreValue::Cert(c) => Some(c),
            _ => None,
        }
    }

    #[must_use]
    pub fn into_chain(self) -> Option<Vec<X509>> {
        match self {
            StoreValue::Chain(c) => Some(c),
            _ => None,
        }
    }
}

pub enum IterControl {
    Continue,
    Stop,
}

/// The store contract. `fs::FsStore` is the only implementation in this
/// crate, but the trait keeps the drive state machine and registry
/// decoupled from the filesystem layout, as spec §4.1 describes.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    async fn load(&self, group: Group, name: &str, aspect: &str, vtype: VType) -> Result<StoreValue>;

    async fn save(
        &self,
        group: Group,
        name: &str,
        aspect: &str,
        value: StoreValue,
        create_only: bool,
    ) -> Result<()>;

    async fn remove(&self, group: Group, name: &str, aspect: &str, force: bool) -> Result<()>;

    async fn purge(&self, group: Group, name: &str) -> Result<()>;

    /// Streams every name under `group` matching `name_pattern` (`*` is
    /// the only wildcard) that has the given `aspect`, loaded as `vtype`.
    /// `inspect` returning `IterControl::Stop` halts iteration cleanly.
    async fn iterate(
        &self,
        group: Group,
        name_pattern: &str,
        aspect: &str,
        vtype: VType,
        inspect: &mut (dyn FnMut(&str, &StoreValue) -> IterControl + Send),
    ) -> Result<()>;
}

#[must_use]
pub fn name_matches(pattern: &str, name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return name.starts_with(prefix);
    }
    pattern == name
}
