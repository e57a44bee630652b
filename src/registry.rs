//! The registry (spec §4.10): reconciles administrator-declared MDs
//! with the store, rejecting domain overlap, and dispatches `drive` by
//! `ca.proto` through a string-keyed table. Grounded in the deleted
//! `daemon.rs`'s registry-scan loop, restructured around `ManagedDomain`
//! persistence rather than ad hoc config-file iteration.

use std::collections::BTreeMap;

use crate::drive::{self, DriveSettings};
use crate::error::{AcmeMdError, Result};
use crate::json::Json;
use crate::model::ManagedDomain;
use crate::store::{Group, IterControl, Store, StoreValue, VType};

const ASPECT_MD: &str = "md.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Domains,
    CaUrl,
    CaAccount,
    Contacts,
    Agreement,
}

/// "ACME" is the only registered protocol today; the table exists so a
/// future protocol can be added without touching `drive`/`sync` call
/// sites (spec §4.10, §9 "string-keyed protocol dispatch").
pub struct Registry {
    drivers: BTreeMap<String, DriveSettings>,
}

impl Default for Registry {
    fn default() -> Self {
        let mut drivers = BTreeMap::new();
        drivers.insert("ACME".to_string(), DriveSettings::default());
        Self { drivers }
    }
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_protocol(&mut self, proto: &str, settings: DriveSettings) {
        self.drivers.insert(proto.to_string(), settings);
    }

    /// Adds a newly declared MD, failing if its domains overlap any MD
    /// already present.
    pub async fn add(&self, store: &dyn Store, md: &ManagedDomain) -> Result<()> {
        self.reject_overlap(store, md, None).await?;
        save(store, md).await
    }

    pub async fn get(&self, store: &dyn Store, name: &str) -> Result<ManagedDomain> {
        let value = store.load(Group::Domains, name, ASPECT_MD, VType::Json).await?;
        let json = value.into_json().ok_or_else(|| AcmeMdError::Corruption {
            path: std::path::PathBuf::from(name),
            detail: "md.json did not decode as JSON".to_string(),
        })?;
        json.to_typed()
    }

    /// Streams every declared MD, in store iteration order.
    pub async fn iterate(
        &self,
        store: &dyn Store,
        mut callback: impl FnMut(&ManagedDomain) -> bool,
    ) -> Result<()> {
        let mut err = None;
        store
            .iterate(Group::Domains, "*", ASPECT_MD, VType::Json, &mut |_name, value| {
                let Some(json) = value.as_json() else {
                    return IterControl::Continue;
                };
                match json.to_typed::<ManagedDomain>() {
                    Ok(md) => {
                        if callback(&md) {
                            IterControl::Continue
                        } else {
                            IterControl::Stop
                        }
                    }
                    Err(e) => {
                        err = Some(e);
                        IterControl::Stop
                    }
                }
            })
            .await?;
        match err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Writes only the fields named in `fields`; changing `Domains`
    /// re-runs the overlap check against every other MD.
    pub async fn update(
        &self,
        store: &dyn Store,
        name: &str,
        new_md: &ManagedDomain,
        fields: &[Field],
    ) -> Result<()> {
        let mut current = self.get(store, name).await?;
        for field in fields {
            match field {
                Field::Domains => current.domains = new_md.domains.clone(),
                Field::CaUrl => current.ca.url = new_md.ca.url.clone(),
                Field::CaAccount => current.ca.account = new_md.ca.account.clone(),
                Field::Contacts => current.contacts = new_md.contacts.clone(),
                Field::Agreement => current.ca.agreement = new_md.ca.agreement.clone(),
            }
        }

        if fields.contains(&Field::Domains) {
            self.reject_overlap(store, &current, Some(name)).await?;
        }
        save(store, &current).await
    }

    /// Reconciles a freshly computed configuration: adds new MDs,
    /// updates MDs whose declaration changed, leaves unchanged MDs
    /// alone, never deletes orphans (returned for the caller to report).
    pub async fn sync(&self, store: &dyn Store, declared: &[ManagedDomain]) -> Result<Vec<String>> {
        let mut existing_names = Vec::new();
        self.iterate(store, |md| {
            existing_names.push(md.name.clone());
            true
        })
        .await?;

        for md in declared {
            match self.get(store, &md.name).await {
                Ok(current) => {
                    if !same_definition(&current, md) {
                        self.reject_overlap(store, md, Some(&md.name)).await?;
                        save(store, md).await?;
                    }
                }
                Err(AcmeMdError::NotFound(_)) => {
                    self.add(store, md).await?;
                }
                Err(err) => return Err(err),
            }
        }

        let declared_names: std::collections::BTreeSet<&str> =
            declared.iter().map(|m| m.name.as_str()).collect();
        let orphans = existing_names
            .into_iter()
            .filter(|n| !declared_names.contains(n.as_str()))
            .collect();
        Ok(orphans)
    }

    /// Looks up `md.ca.proto` in the dispatch table and drives it.
    pub async fn drive(&self, store: &dyn Store, md: &mut ManagedDomain, default_agreement: Option<&str>) -> Result<()> {
        let settings = self
            .drivers
            .get(&md.ca.proto)
            .ok_or_else(|| AcmeMdError::NotImplemented(format!("no driver registered for protocol {}", md.ca.proto)))?;
        drive::drive(store, md, settings, default_agreement).await?;
        save(store, md).await
    }

    async fn reject_overlap(&self, store: &dyn Store, md: &ManagedDomain, skip: Option<&str>) -> Result<()> {
        let mut conflict = None;
        self.iterate(store, |other| {
            if Some(other.name.as_str()) == skip {
                return true;
            }
            if other.overlaps(md) {
                conflict = Some(other.name.clone());
                return false;
            }
            true
        })
        .await?;

        if let Some(other_name) = conflict {
            return Err(AcmeMdError::InvalidArgument(format!(
                "domains of {} overlap already-managed domain {other_name}",
                md.name
            )));
        }
        Ok(())
    }
}

fn same_definition(a: &ManagedDomain, b: &ManagedDomain) -> bool {
    a.domains == b.domains
        && a.ca.url == b.ca.url
        && a.contacts == b.contacts
        && a.must_staple == b.must_staple
}

async fn save(store: &dyn Store, md: &ManagedDomain) -> Result<()> {
    let json = Json::from_typed(md)?;
    store
        .save(Group::Domains, &md.name, ASPECT_MD, StoreValue::Json(json), false)
        .await
}
