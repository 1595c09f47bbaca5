//! Publishing VM address records in the shared DNS zone.

use std::collections::BTreeMap;
use std::fmt;

use clouddns_api::{CreateChangeRequest, ResourceRecordSet};
use tracing::debug;

use crate::{ProviderRegistry, Result, Vm};

/// TTL of published address records, in seconds.
pub const RECORD_TTL: u32 = 60;

/// Outcome of a refresh attempt that didn't fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsRefresh {
    Refreshed { records: usize },
    Skipped(SkipReason),
}

/// Why the known VM set can't be proven complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NoCapableProvider,
    Inactive(crate::ProviderName),
    NoZoneOwner,
    DefaultProjectNotCovered(crate::ProviderName),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoCapableProvider => f.write_str("no provider publishes DNS records"),
            Self::Inactive(p) => write!(f, "{p} is not active, the VM list may be incomplete"),
            Self::NoZoneOwner => f.write_str("no provider hosts the DNS zone"),
            Self::DefaultProjectNotCovered(p) => {
                write!(f, "{p} did not list the default project")
            }
        }
    }
}

/// Republish records for `vms` when the listing is provably complete.
///
/// Every DNS-capable provider must be active. The provider hosting the zone
/// must also cover the default project; the others only need to be active.
/// VMs of providers that don't publish into the zone, such as the local
/// cluster, are left out.
pub async fn maybe_refresh(registry: &ProviderRegistry, vms: &[Vm]) -> Result<DnsRefresh> {
    let capable: Vec<_> = registry.all().filter(|p| p.dns_capable()).collect();
    if capable.is_empty() {
        return Ok(DnsRefresh::Skipped(SkipReason::NoCapableProvider));
    }
    if let Some(inactive) = capable.iter().find(|p| !p.active()) {
        return Ok(DnsRefresh::Skipped(SkipReason::Inactive(inactive.name())));
    }
    let Some(owner) = capable.iter().find(|p| p.owns_default_dns_zone()) else {
        return Ok(DnsRefresh::Skipped(SkipReason::NoZoneOwner));
    };
    if !owner.covers_default_project() {
        return Ok(DnsRefresh::Skipped(SkipReason::DefaultProjectNotCovered(
            owner.name(),
        )));
    }

    let published = publishable(registry, vms);
    debug!(provider = %owner.name(), vms = published.len(), "refreshing DNS entries");
    owner.sync_dns(&published).await?;
    Ok(DnsRefresh::Refreshed {
        records: published.iter().filter(|v| !v.public_ip.is_empty()).count(),
    })
}

/// The subset of `vms` whose provider publishes into the shared zone.
pub fn publishable(registry: &ProviderRegistry, vms: &[Vm]) -> Vec<Vm> {
    vms.iter()
        .filter(|vm| registry.get(vm.provider).is_some_and(|p| p.dns_capable()))
        .cloned()
        .collect()
}

/// Fully qualified record name for `vm_name`.
pub fn record_name(vm_name: &str, subdomain: &str) -> String {
    format!("{vm_name}.{}.", subdomain.trim_end_matches('.'))
}

/// Changes that make the `A` records under `subdomain` match `vms` exactly.
///
/// Records outside the subdomain are never touched. Unchanged records are
/// left alone.
pub fn plan_changes(
    existing: &[ResourceRecordSet],
    vms: &[Vm],
    subdomain: &str,
) -> CreateChangeRequest {
    let suffix = format!(".{}.", subdomain.trim_end_matches('.'));

    let desired: BTreeMap<String, ResourceRecordSet> = vms
        .iter()
        .filter(|vm| !vm.public_ip.is_empty())
        .map(|vm| {
            let name = record_name(&vm.name, subdomain);
            (
                name.clone(),
                ResourceRecordSet::a_record(name, vm.public_ip.clone(), RECORD_TTL),
            )
        })
        .collect();

    let mut change = CreateChangeRequest::default();
    let mut kept = Vec::new();
    for rr in existing
        .iter()
        .filter(|rr| rr.record_type == "A" && rr.name.ends_with(&suffix))
    {
        match desired.get(&rr.name) {
            Some(want) if want == rr => kept.push(rr.name.clone()),
            _ => change.deletions.push(rr.clone()),
        }
    }
    change.additions = desired
        .into_values()
        .filter(|rr| !kept.contains(&rr.name))
        .collect();
    change
}
