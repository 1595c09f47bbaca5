use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{MANAGED_LABEL, disabled, env_list, lifetime_label, locality, owner_of, spread_over_zones, startup_script};
use crate::command;
use crate::types::format_lifetime;
use crate::{CreateOpts, Error, ProviderName, Result, Vm, VmProvider};

const AZ: &str = "az";

/// Microsoft Azure, driven through the `az` CLI.
///
/// Each cluster gets one resource group per location, named
/// `fleet-<cluster>-<location>`. The group holds the VMs together with their
/// NICs, public IPs, disks and networks, so destroying VMs deletes their
/// groups.
pub struct AzureProvider {
    locations: Vec<String>,
    machine_type: String,
    image: String,
    public_key_path: PathBuf,
    active: bool,
}

impl AzureProvider {
    /// Create from env vars:
    ///
    /// - `FLEET_AZURE_LOCATIONS` (comma-separated, default: `eastus`)
    /// - `FLEET_AZURE_MACHINE_TYPE` (default: `Standard_D4_v3`)
    /// - `FLEET_AZURE_IMAGE` (default: Ubuntu 22.04 LTS URN)
    /// - `FLEET_AZURE_PUBLIC_KEY` (default: `$HOME/.ssh/id_rsa.pub`)
    /// - `FLEET_AZURE_DISABLED`
    ///
    /// Inactive when the `az` CLI isn't installed.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let home = std::env::var("HOME").unwrap_or_default();
        Self {
            locations: env_list("FLEET_AZURE_LOCATIONS", &["eastus"]),
            machine_type: std::env::var("FLEET_AZURE_MACHINE_TYPE")
                .unwrap_or_else(|_| "Standard_D4_v3".into()),
            image: std::env::var("FLEET_AZURE_IMAGE").unwrap_or_else(|_| {
                "Canonical:0001-com-ubuntu-server-jammy:22_04-lts-gen2:latest".into()
            }),
            public_key_path: std::env::var_os("FLEET_AZURE_PUBLIC_KEY")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(home).join(".ssh").join("id_rsa.pub")),
            active: !disabled(ProviderName::Azure) && command::on_path(AZ),
        }
    }

    async fn create_in(
        &self,
        location: &str,
        names: Vec<String>,
        opts: &CreateOpts,
        custom_data: &str,
    ) -> Result<()> {
        let group = resource_group(&opts.cluster_name, location);
        let group_tags = format!("{MANAGED_LABEL}=true");
        command::run(
            AZ,
            &[
                "group",
                "create",
                "--name",
                group.as_str(),
                "--location",
                location,
                "--tags",
                group_tags.as_str(),
                "--output",
                "none",
            ],
        )
        .await?;

        let size = opts.machine_type.as_deref().unwrap_or(self.machine_type.as_str());
        let key = self.public_key_path.display().to_string();
        let tags = [
            format!("{MANAGED_LABEL}=true"),
            format!("lifetime={}", format_lifetime(opts.lifetime)),
            format!("owner={}", owner_of(&opts.cluster_name)),
            format!("created={}", Utc::now().to_rfc3339()),
        ];

        let results = join_all(names.iter().map(|name| {
            let mut args: Vec<String> = [
                "vm",
                "create",
                "--resource-group",
                group.as_str(),
                "--name",
                name.as_str(),
                "--location",
                location,
                "--image",
                self.image.as_str(),
                "--size",
                size,
                "--admin-username",
                "ubuntu",
                "--ssh-key-values",
                key.as_str(),
                "--custom-data",
                custom_data,
                "--output",
                "none",
                "--tags",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect();
            args.extend(tags.iter().cloned());
            async move { command::run(AZ, &args).await.map(drop) }
        }))
        .await;

        match Error::combine(results.into_iter().filter_map(Result::err)) {
            Some(err) => {
                // Nothing lists a group whose VMs all failed, so drop it here.
                if let Err(e) = command::run(AZ, &group_delete_args(&group)).await {
                    warn!(group = %group, error = %e, "azure: failed to remove resource group");
                }
                Err(err)
            }
            None => Ok(()),
        }
    }

    async fn on_ids(&self, args: &[&str], vms: &[Vm]) -> Result<()> {
        if vms.is_empty() {
            return Ok(());
        }
        let mut full: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        full.push("--ids".into());
        full.extend(vms.iter().map(|v| v.provider_id.clone()));
        command::run(AZ, &full).await.map(drop)
    }
}

fn resource_group(cluster: &str, location: &str) -> String {
    format!("fleet-{cluster}-{location}")
}

/// Distinct resource groups holding `vms`.
fn resource_groups(vms: &[Vm]) -> BTreeSet<String> {
    vms.iter()
        .map(|vm| vm.project.clone())
        .filter(|g| !g.is_empty())
        .collect()
}

fn group_delete_args(group: &str) -> Vec<String> {
    ["group", "delete", "--name", group, "--yes", "--output", "none"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VirtualMachine {
    id: String,
    name: String,
    location: String,
    resource_group: String,
    hardware_profile: HardwareProfile,
    #[serde(default)]
    public_ips: String,
    #[serde(default)]
    private_ips: String,
    #[serde(default)]
    tags: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HardwareProfile {
    vm_size: String,
}

#[derive(Debug, Deserialize)]
struct AccountShow {
    user: AccountUser,
}

#[derive(Debug, Deserialize)]
struct AccountUser {
    name: String,
}

/// `az` reports multiple addresses comma-separated.
fn first_address(list: &str) -> Option<String> {
    list.split(',')
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

impl VirtualMachine {
    fn into_vm(self) -> Vm {
        let mut errors = Vec::new();
        let lifetime = lifetime_label(self.tags.get("lifetime").map(String::as_str), &mut errors);
        let created_at = match self.tags.get("created").map(|s| DateTime::parse_from_rfc3339(s)) {
            Some(Ok(t)) => t.with_timezone(&Utc),
            _ => {
                errors.push("missing or malformed created tag".into());
                DateTime::<Utc>::UNIX_EPOCH
            }
        };
        let public_ip = first_address(&self.public_ips).unwrap_or_default();
        if public_ip.is_empty() {
            errors.push("no public IP".into());
        }

        Vm {
            provider: ProviderName::Azure,
            provider_id: self.id,
            public_ip,
            private_ip: first_address(&self.private_ips),
            created_at,
            lifetime,
            locality: locality(ProviderName::Azure, &self.location, &self.location),
            account: self
                .tags
                .get("owner")
                .cloned()
                .unwrap_or_else(|| owner_of(&self.name).to_string()),
            remote_user: "ubuntu".into(),
            project: self.resource_group,
            zone: self.location,
            machine_type: self.hardware_profile.vm_size,
            name: self.name,
            errors,
        }
    }
}

#[async_trait]
impl VmProvider for AzureProvider {
    fn name(&self) -> ProviderName {
        ProviderName::Azure
    }

    fn active(&self) -> bool {
        self.active
    }

    async fn find_active_account(&self) -> Result<Option<String>> {
        let account: AccountShow = command::json(AZ, &["account", "show", "--output", "json"]).await?;
        Ok(Some(account.user.name).filter(|n| !n.is_empty()))
    }

    async fn list(&self) -> Result<Vec<Vm>> {
        let query = format!("[?tags.{MANAGED_LABEL}=='true']");
        let vms: Vec<VirtualMachine> = command::json(
            AZ,
            &["vm", "list", "--show-details", "--query", query.as_str(), "--output", "json"],
        )
        .await?;
        debug!(count = vms.len(), "azure: listed virtual machines");
        Ok(vms.into_iter().map(VirtualMachine::into_vm).collect())
    }

    async fn create(&self, names: &[String], opts: &CreateOpts) -> Result<()> {
        let locations = if opts.zones.is_empty() {
            self.locations.iter().take(1).cloned().collect()
        } else {
            opts.zones.clone()
        };
        let custom_data = std::env::temp_dir().join(format!("fleet-azure-init-{}.sh", uuid::Uuid::new_v4()));
        tokio::fs::write(&custom_data, startup_script(&opts.ssd, "/dev/sdb")).await?;
        let custom_data_arg = custom_data.display().to_string();
        let custom_data_arg = custom_data_arg.as_str();

        let results = join_all(
            spread_over_zones(names, &locations)
                .into_iter()
                .map(|(location, names)| async move {
                    self.create_in(&location, names, opts, custom_data_arg).await
                }),
        )
        .await;
        let _ = tokio::fs::remove_file(&custom_data).await;

        match Error::combine(results.into_iter().filter_map(Result::err)) {
            Some(err) => Err(err),
            None => {
                info!(cluster = %opts.cluster_name, nodes = names.len(), "azure: virtual machines created");
                Ok(())
            }
        }
    }

    async fn delete(&self, vms: &[Vm]) -> Result<()> {
        let groups = resource_groups(vms);
        let results = join_all(
            groups
                .iter()
                .map(|group| async move { command::run(AZ, &group_delete_args(group)).await.map(drop) }),
        )
        .await;

        match Error::combine(results.into_iter().filter_map(Result::err)) {
            Some(err) => Err(err),
            None => {
                info!(count = vms.len(), groups = groups.len(), "azure: resource groups deleted");
                Ok(())
            }
        }
    }

    async fn reset(&self, vms: &[Vm]) -> Result<()> {
        self.on_ids(&["vm", "restart", "--output", "none"], vms).await
    }

    async fn extend(&self, vms: &[Vm], lifetime: Duration) -> Result<()> {
        let set = format!("tags.lifetime={}", format_lifetime(lifetime));
        self.on_ids(&["vm", "update", "--output", "none", "--set", set.as_str()], vms)
            .await
    }
}
