//! VM provider backends.
//!
//! The cloud backends drive their vendor CLI with JSON output; the local
//! backend keeps a small inventory file in the state directory.

pub mod aws;
pub mod azure;
pub mod gce;
pub mod local;

use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

use crate::types::{parse_lifetime, FileSystem, SsdOpts};
use crate::ProviderName;

/// Label or tag marking a VM as managed by this tool.
pub const MANAGED_LABEL: &str = "fleet";

/// Comma-separated env var, falling back to `default` when unset or empty.
pub(crate) fn env_list(var: &str, default: &[&str]) -> Vec<String> {
    let parsed: Vec<String> = env::var(var)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if parsed.is_empty() {
        default.iter().map(|s| s.to_string()).collect()
    } else {
        parsed
    }
}

/// `FLEET_<PROVIDER>_DISABLED` set to a truthy value.
pub(crate) fn disabled(name: ProviderName) -> bool {
    let var = format!("FLEET_{}_DISABLED", name.as_str().to_ascii_uppercase());
    matches!(
        env::var(var).as_deref().map(str::to_ascii_lowercase).as_deref(),
        Ok("1" | "true" | "yes")
    )
}

/// Spread `names` over `zones` round-robin, keyed by zone.
pub(crate) fn spread_over_zones(names: &[String], zones: &[String]) -> BTreeMap<String, Vec<String>> {
    let mut by_zone: BTreeMap<String, Vec<String>> = BTreeMap::new();
    if zones.is_empty() {
        return by_zone;
    }
    for (i, name) in names.iter().enumerate() {
        by_zone
            .entry(zones[i % zones.len()].clone())
            .or_default()
            .push(name.clone());
    }
    by_zone
}

/// Owner prefix of a cluster or VM name.
pub(crate) fn owner_of(name: &str) -> &str {
    name.split('-').next().unwrap_or_default()
}

/// Lifetime from a label value, recording a problem on the VM when absent
/// or malformed.
pub(crate) fn lifetime_label(value: Option<&str>, errors: &mut Vec<String>) -> Duration {
    match value.map(parse_lifetime) {
        Some(Ok(d)) => d,
        Some(Err(e)) => {
            errors.push(e.to_string());
            Duration::ZERO
        }
        None => {
            errors.push("missing lifetime label".into());
            Duration::ZERO
        }
    }
}

/// Boot script that formats and mounts the node data disk.
pub(crate) fn startup_script(ssd: &SsdOpts, device_glob: &str) -> String {
    let mkfs = match ssd.file_system {
        FileSystem::Ext4 => "mkfs.ext4 -q -F \"$disk\" && mount -o discard,defaults \"$disk\" /mnt/data1".to_string(),
        FileSystem::Zfs => "apt-get install -qy zfsutils-linux && zpool create -f data1 -m /mnt/data1 \"$disk\"".to_string(),
    };
    let disks = if ssd.use_local_ssd {
        device_glob.to_string()
    } else {
        String::new()
    };

    format!(
        r#"#!/usr/bin/env bash
set -x
mkdir -p /mnt/data1
for disk in {disks}; do
  [ -b "$disk" ] || continue
  {mkfs}
  break
done
chmod 777 /mnt/data1
echo "fleet: data disk ready" > /var/log/fleet-startup.log
"#
    )
}

/// Locality label in the `key=value,...` form nodes are started with.
pub(crate) fn locality(cloud: ProviderName, region: &str, zone: &str) -> String {
    format!("cloud={cloud},region={region},zone={zone}")
}
