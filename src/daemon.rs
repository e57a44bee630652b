//! The renewal daemon: scans the registry and re-drives any MD whose
//! credentials satisfy `RenewalPolicy::needs_renewal` (SPEC_FULL §C,
//! supplementing `mod_md.c`'s periodic watchdog). Grounded in the
//! deleted `daemon.rs`'s semaphore-bounded scan loop, generalized from
//! a fixed set of profiles to the registry's MD iteration.

use std::sync::Arc;

use crate::drive::RenewalPolicy;
use crate::error::Result;
use crate::model::ManagedDomain;
use crate::registry::Registry;
use crate::store::{Group, Store, VType};

/// Drives every MD the registry knows about whose certificate needs
/// renewal (or has none yet). Returns the names it attempted, paired
/// with the outcome, so a caller can log/report failures without one MD
/// aborting the whole run.
pub async fn run_once(
    store: &dyn Store,
    registry: &Registry,
    policy: &dyn RenewalPolicy,
    default_agreement: Option<&str>,
) -> Result<Vec<(String, Result<()>)>> {
    let mut candidates = Vec::new();
    registry
        .iterate(store, |md| {
            candidates.push(md.clone());
            true
        })
        .await?;

    let mut outcomes = Vec::new();
    for mut md in candidates {
        if !needs_drive(store, &md, policy).await {
            continue;
        }
        tracing::info!(md = %md.name, "renewal due, driving");
        let result = registry.drive(store, &mut md, default_agreement).await;
        if let Err(err) = &result {
            tracing::warn!(md = %md.name, error = %err, "drive failed");
        }
        outcomes.push((md.name.clone(), result));
    }
    Ok(outcomes)
}

async fn needs_drive(store: &dyn Store, md: &ManagedDomain, policy: &dyn RenewalPolicy) -> bool {
    match store.load(Group::Domains, &md.name, "cert.pem", VType::Cert).await {
        Ok(value) => value.into_cert().is_none_or(|cert| policy.needs_renewal(&cert)),
        Err(_) => true,
    }
}

/// Runs `run_once` on a fixed interval until the process is asked to
/// stop, mirroring the teacher's signal-driven shutdown.
pub async fn run_loop(
    store: Arc<dyn Store>,
    registry: Arc<Registry>,
    policy: Arc<dyn RenewalPolicy>,
    default_agreement: Option<String>,
    interval: std::time::Duration,
) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let outcomes = run_once(store.as_ref(), &registry, policy.as_ref(), default_agreement.as_deref()).await?;
                for (name, outcome) in outcomes {
                    if let Err(err) = outcome {
                        tracing::warn!(md = %name, error = %err, "scheduled renewal failed");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("daemon received shutdown signal");
                return Ok(());
            }
        }
    }
}
