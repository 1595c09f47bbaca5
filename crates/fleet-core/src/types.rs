use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, ProviderName, Result};

/// Reserved name of the cluster backed by the local pseudo-provider.
pub const LOCAL_CLUSTER: &str = "local";

/// One provisioned machine, as reported by its provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vm {
    /// `<cluster>-<NNNN>`.
    pub name: String,
    pub provider: ProviderName,
    /// Provider-side identifier (instance id, resource id, ...).
    pub provider_id: String,
    pub public_ip: String,
    /// Resolved lazily when the provider doesn't report it.
    pub private_ip: Option<String>,
    pub created_at: DateTime<Utc>,
    pub lifetime: Duration,
    pub locality: String,
    /// Owning account.
    pub account: String,
    pub remote_user: String,
    /// GCE project, AWS region or Azure resource group.
    pub project: String,
    pub zone: String,
    pub machine_type: String,
    /// Problems the provider reported for this VM.
    #[serde(default)]
    pub errors: Vec<String>,
}

impl Vm {
    pub fn expires_at(&self) -> DateTime<Utc> {
        add_lifetime(self.created_at, self.lifetime)
    }

    /// The cluster this VM belongs to, derived from its name.
    pub fn cluster_name(&self) -> Option<&str> {
        cluster_name_of(&self.name)
    }
}

/// Name of the VM at 1-based position `node` of `cluster`.
pub fn vm_name(cluster: &str, node: usize) -> String {
    format!("{cluster}-{node:04}")
}

/// Strip the `-NNNN` node suffix from a VM name.
pub fn cluster_name_of(vm_name: &str) -> Option<&str> {
    let (cluster, node) = vm_name.rsplit_once('-')?;
    if cluster.is_empty() || node.is_empty() || !node.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(cluster)
}

/// A named, ordered collection of VMs: index `i` is node `i + 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,
    /// Owner prefix of the name.
    pub user: String,
    pub vms: Vec<Vm>,
    /// Earliest VM creation time.
    pub created_at: DateTime<Utc>,
    /// Shortest VM lifetime.
    pub lifetime: Duration,
}

impl Cluster {
    pub fn is_local(&self) -> bool {
        self.name == LOCAL_CLUSTER
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        add_lifetime(self.created_at, self.lifetime)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at() <= now
    }

    /// Human-readable summary, one line per VM.
    pub fn details(&self, now: DateTime<Utc>) -> String {
        let remaining = self.expires_at() - now;
        let mut out = if remaining > chrono::Duration::zero() {
            format!(
                "{}: [{}] {} (expires in {}m)",
                self.name,
                self.providers_label(),
                self.vms.len(),
                remaining.num_minutes()
            )
        } else {
            format!(
                "{}: [{}] {} (expired)",
                self.name,
                self.providers_label(),
                self.vms.len()
            )
        };
        for vm in &self.vms {
            out.push_str(&format!(
                "\n  {}\t{}\t{}\t{}",
                vm.name,
                vm.public_ip,
                vm.private_ip.as_deref().unwrap_or("-"),
                vm.locality
            ));
        }
        out
    }

    fn providers_label(&self) -> String {
        let mut names: Vec<&str> = self.vms.iter().map(|v| v.provider.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        names.join(",")
    }
}

/// Snapshot of every cluster visible to the current credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cloud {
    pub clusters: BTreeMap<String, Cluster>,
    /// VMs that reported errors or could not be attributed to a cluster.
    #[serde(default)]
    pub bad_instances: Vec<Vm>,
    pub synced_at: Option<DateTime<Utc>>,
}

impl Cloud {
    /// Group a flat VM inventory into clusters.
    pub fn from_vms(vms: Vec<Vm>, synced_at: DateTime<Utc>) -> Self {
        let mut cloud = Cloud {
            synced_at: Some(synced_at),
            ..Default::default()
        };

        for vm in vms {
            if !vm.errors.is_empty() {
                cloud.bad_instances.push(vm);
                continue;
            }
            let name = vm.cluster_name().map(str::to_string);
            let Some(name) = name else {
                let mut vm = vm;
                vm.errors.push("name does not identify a cluster".into());
                cloud.bad_instances.push(vm);
                continue;
            };

            let cluster = cloud.clusters.entry(name.clone()).or_insert_with(|| Cluster {
                user: name.split('-').next().unwrap_or_default().to_string(),
                name,
                vms: Vec::new(),
                created_at: vm.created_at,
                lifetime: vm.lifetime,
            });
            if vm.created_at < cluster.created_at {
                cluster.created_at = vm.created_at;
            }
            if vm.lifetime < cluster.lifetime {
                cluster.lifetime = vm.lifetime;
            }
            cluster.vms.push(vm);
        }

        for cluster in cloud.clusters.values_mut() {
            cluster.vms.sort_by(|a, b| a.name.cmp(&b.name));
        }
        cloud
    }

    /// Every VM of every cluster.
    pub fn vms(&self) -> impl Iterator<Item = &Vm> {
        self.clusters.values().flat_map(|c| c.vms.iter())
    }

    /// A copy holding only the clusters whose names match `pattern`.
    pub fn filtered(&self, pattern: &Regex) -> Cloud {
        Cloud {
            clusters: self
                .clusters
                .iter()
                .filter(|(name, _)| pattern.is_match(name))
                .map(|(name, c)| (name.clone(), c.clone()))
                .collect(),
            bad_instances: self.bad_instances.clone(),
            synced_at: self.synced_at,
        }
    }
}

/// Filesystem used to format node data disks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileSystem {
    #[default]
    Ext4,
    Zfs,
}

impl FileSystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ext4 => "ext4",
            Self::Zfs => "zfs",
        }
    }
}

impl fmt::Display for FileSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileSystem {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ext4" => Ok(Self::Ext4),
            "zfs" => Ok(Self::Zfs),
            other => Err(Error::InvalidInput(format!("unknown filesystem {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SsdOpts {
    pub use_local_ssd: bool,
    pub file_system: FileSystem,
}

/// Options for provisioning the VMs of a cluster.
#[derive(Debug, Clone)]
pub struct CreateOpts {
    /// Filled in by the lifecycle manager after name resolution.
    pub cluster_name: String,
    pub providers: Vec<ProviderName>,
    pub lifetime: Duration,
    pub machine_type: Option<String>,
    /// Zones to spread nodes over; provider default when empty.
    pub zones: Vec<String>,
    pub ssd: SsdOpts,
}

impl Default for CreateOpts {
    fn default() -> Self {
        Self {
            cluster_name: String::new(),
            providers: vec![ProviderName::Gce],
            lifetime: Duration::from_secs(12 * 3600),
            machine_type: None,
            zones: Vec::new(),
            ssd: SsdOpts::default(),
        }
    }
}

/// Render a lifetime the way it is stored in provider labels, e.g. `12h0m0s`.
pub fn format_lifetime(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Parse lifetimes such as `12h`, `90m`, `1h30m` or `12h0m0s`.
pub fn parse_lifetime(s: &str) -> Result<Duration> {
    let invalid = || Error::InvalidInput(format!("invalid lifetime {s:?}"));
    if s.is_empty() {
        return Err(invalid());
    }

    let mut total: u64 = 0;
    let mut digits = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let unit = match c {
            'h' => 3600,
            'm' => 60,
            's' => 1,
            _ => return Err(invalid()),
        };
        let n: u64 = digits.parse().map_err(|_| invalid())?;
        total = n
            .checked_mul(unit)
            .and_then(|v| total.checked_add(v))
            .ok_or_else(invalid)?;
        digits.clear();
    }
    if !digits.is_empty() {
        return Err(invalid());
    }
    Ok(Duration::from_secs(total))
}

fn add_lifetime(t: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| t.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
