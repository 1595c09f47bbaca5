use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clouddns_api::CloudDnsClient;
use futures_util::future::join_all;
use serde::Deserialize;
use tracing::{debug, info};

use super::{MANAGED_LABEL, disabled, env_list, lifetime_label, locality, owner_of, spread_over_zones, startup_script};
use crate::command;
use crate::config::DnsConfig;
use crate::dns::plan_changes;
use crate::types::{FileSystem, format_lifetime};
use crate::{CreateOpts, Error, ProviderName, Result, Vm, VmProvider};

const GCLOUD: &str = "gcloud";

/// Google Compute Engine, driven through `gcloud`.
///
/// Hosts the shared DNS zone and is the only backend that can format data
/// disks with ZFS.
pub struct GceProvider {
    projects: Vec<String>,
    zones: Vec<String>,
    machine_type: String,
    image_family: String,
    image_project: String,
    dns: DnsConfig,
    active: bool,
}

impl GceProvider {
    /// Create from env vars:
    ///
    /// - `FLEET_GCE_PROJECTS` (comma-separated, default: the DNS project)
    /// - `FLEET_GCE_ZONES` (comma-separated, default: `us-east1-b`)
    /// - `FLEET_GCE_MACHINE_TYPE` (default: `n2-standard-4`)
    /// - `FLEET_GCE_IMAGE_FAMILY` (default: `ubuntu-2204-lts`)
    /// - `FLEET_GCE_IMAGE_PROJECT` (default: `ubuntu-os-cloud`)
    /// - `FLEET_GCE_DISABLED`
    ///
    /// Inactive when `gcloud` isn't installed.
    pub fn from_env(dns: &DnsConfig) -> Self {
        dotenvy::dotenv().ok();

        Self {
            projects: env_list("FLEET_GCE_PROJECTS", &[dns.project.as_str()]),
            zones: env_list("FLEET_GCE_ZONES", &["us-east1-b"]),
            machine_type: std::env::var("FLEET_GCE_MACHINE_TYPE")
                .unwrap_or_else(|_| "n2-standard-4".into()),
            image_family: std::env::var("FLEET_GCE_IMAGE_FAMILY")
                .unwrap_or_else(|_| "ubuntu-2204-lts".into()),
            image_project: std::env::var("FLEET_GCE_IMAGE_PROJECT")
                .unwrap_or_else(|_| "ubuntu-os-cloud".into()),
            dns: dns.clone(),
            active: !disabled(ProviderName::Gce) && command::on_path(GCLOUD),
        }
    }

    pub fn projects(&self) -> &[String] {
        &self.projects
    }

    /// Project new VMs are created in.
    fn create_project(&self) -> &str {
        self.projects
            .first()
            .map(String::as_str)
            .unwrap_or(self.dns.project.as_str())
    }

    async fn list_project(&self, project: &str) -> Result<Vec<Vm>> {
        let filter = format!("labels.{MANAGED_LABEL}=true");
        let instances: Vec<Instance> = command::json(
            GCLOUD,
            &[
                "compute",
                "instances",
                "list",
                "--project",
                project,
                "--filter",
                filter.as_str(),
                "--format",
                "json",
            ],
        )
        .await?;
        Ok(instances
            .into_iter()
            .map(|i| i.into_vm(project))
            .collect())
    }

    /// Run `gcloud compute instances <verb>` once per project and zone.
    async fn per_zone(&self, verb: &str, vms: &[Vm], extra: &[String]) -> Result<()> {
        let mut groups: BTreeMap<(String, String), Vec<String>> = BTreeMap::new();
        for vm in vms {
            groups
                .entry((vm.project.clone(), vm.zone.clone()))
                .or_default()
                .push(vm.name.clone());
        }

        let results = join_all(groups.into_iter().map(|((project, zone), names)| {
            let mut args: Vec<String> = vec!["compute".into(), "instances".into(), verb.into()];
            args.extend(names);
            args.extend(extra.iter().cloned());
            args.extend(["--project".into(), project, "--zone".into(), zone, "--quiet".into()]);
            async move { command::run(GCLOUD, &args).await.map(drop) }
        }))
        .await;

        match Error::combine(results.into_iter().filter_map(Result::err)) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn access_token(&self) -> Result<String> {
        let token = command::run(GCLOUD, &["auth", "print-access-token"]).await?;
        Ok(token.trim().to_string())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Instance {
    id: String,
    name: String,
    zone: String,
    machine_type: String,
    creation_timestamp: DateTime<Utc>,
    #[serde(default)]
    labels: HashMap<String, String>,
    #[serde(default)]
    network_interfaces: Vec<NetworkInterface>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkInterface {
    #[serde(rename = "networkIP")]
    network_ip: Option<String>,
    #[serde(default)]
    access_configs: Vec<AccessConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccessConfig {
    #[serde(rename = "natIP")]
    nat_ip: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AuthAccount {
    account: String,
    status: String,
}

/// Last path segment of a GCE resource URL.
fn last_segment(url: &str) -> &str {
    url.rsplit('/').next().unwrap_or(url)
}

fn region_of(zone: &str) -> &str {
    zone.rsplit_once('-').map_or(zone, |(region, _)| region)
}

impl Instance {
    fn into_vm(self, project: &str) -> Vm {
        let mut errors = Vec::new();
        let lifetime = lifetime_label(self.labels.get("lifetime").map(String::as_str), &mut errors);
        let nic = self.network_interfaces.first();
        let public_ip = nic
            .and_then(|n| n.access_configs.first())
            .and_then(|a| a.nat_ip.clone())
            .unwrap_or_default();
        if public_ip.is_empty() {
            errors.push("no public IP".into());
        }
        let zone = last_segment(&self.zone).to_string();

        Vm {
            provider: ProviderName::Gce,
            provider_id: self.id,
            public_ip,
            private_ip: nic.and_then(|n| n.network_ip.clone()),
            created_at: self.creation_timestamp,
            lifetime,
            locality: locality(ProviderName::Gce, region_of(&zone), &zone),
            account: self
                .labels
                .get("owner")
                .cloned()
                .unwrap_or_else(|| owner_of(&self.name).to_string()),
            remote_user: "ubuntu".into(),
            project: project.to_string(),
            machine_type: last_segment(&self.machine_type).to_string(),
            zone,
            name: self.name,
            errors,
        }
    }
}

#[async_trait]
impl VmProvider for GceProvider {
    fn name(&self) -> ProviderName {
        ProviderName::Gce
    }

    fn active(&self) -> bool {
        self.active
    }

    async fn find_active_account(&self) -> Result<Option<String>> {
        let accounts: Vec<AuthAccount> =
            command::json(GCLOUD, &["auth", "list", "--format", "json"]).await?;
        Ok(accounts
            .into_iter()
            .find(|a| a.status == "ACTIVE")
            .map(|a| a.account))
    }

    async fn list(&self) -> Result<Vec<Vm>> {
        let results = join_all(self.projects.iter().map(|p| self.list_project(p))).await;
        let mut vms = Vec::new();
        for result in results {
            vms.extend(result?);
        }
        debug!(count = vms.len(), "gce: listed instances");
        Ok(vms)
    }

    async fn create(&self, names: &[String], opts: &CreateOpts) -> Result<()> {
        let zones = if opts.zones.is_empty() {
            self.zones.iter().take(1).cloned().collect()
        } else {
            opts.zones.clone()
        };
        let machine_type = opts.machine_type.as_deref().unwrap_or(&self.machine_type);
        let labels = format!(
            "{MANAGED_LABEL}=true,lifetime={},owner={}",
            format_lifetime(opts.lifetime),
            owner_of(&opts.cluster_name)
        );

        let script_path =
            std::env::temp_dir().join(format!("fleet-gce-startup-{}.sh", uuid::Uuid::new_v4()));
        tokio::fs::write(&script_path, startup_script(&opts.ssd, "/dev/disk/by-id/google-local-*"))
            .await?;
        let metadata = format!("startup-script={}", script_path.display());

        let results = join_all(spread_over_zones(names, &zones).into_iter().map(|(zone, names)| {
            let mut args: Vec<String> = vec!["compute".into(), "instances".into(), "create".into()];
            args.extend(names);
            args.extend([
                "--project".into(),
                self.create_project().to_string(),
                "--zone".into(),
                zone,
                "--machine-type".into(),
                machine_type.to_string(),
                "--image-family".into(),
                self.image_family.clone(),
                "--image-project".into(),
                self.image_project.clone(),
                "--labels".into(),
                labels.clone(),
                "--metadata-from-file".into(),
                metadata.clone(),
                "--format".into(),
                "json".into(),
            ]);
            if opts.ssd.use_local_ssd {
                args.extend(["--local-ssd".into(), "interface=NVME".into()]);
            }
            async move { command::run(GCLOUD, &args).await.map(drop) }
        }))
        .await;
        let _ = tokio::fs::remove_file(&script_path).await;

        match Error::combine(results.into_iter().filter_map(Result::err)) {
            Some(err) => Err(err),
            None => {
                info!(cluster = %opts.cluster_name, nodes = names.len(), "gce: instances created");
                Ok(())
            }
        }
    }

    async fn delete(&self, vms: &[Vm]) -> Result<()> {
        self.per_zone("delete", vms, &[]).await?;
        info!(count = vms.len(), "gce: instances deleted");
        Ok(())
    }

    async fn reset(&self, vms: &[Vm]) -> Result<()> {
        self.per_zone("reset", vms, &[]).await
    }

    async fn extend(&self, vms: &[Vm], lifetime: Duration) -> Result<()> {
        let labels = vec![
            "--labels".to_string(),
            format!("lifetime={}", format_lifetime(lifetime)),
        ];
        self.per_zone("add-labels", vms, &labels).await
    }

    async fn clean_ssh(&self) -> Result<()> {
        for project in &self.projects {
            command::run(
                GCLOUD,
                &["compute", "config-ssh", "--project", project.as_str(), "--quiet", "--remove"],
            )
            .await?;
        }
        Ok(())
    }

    async fn config_ssh(&self) -> Result<()> {
        for project in &self.projects {
            command::run(GCLOUD, &["compute", "config-ssh", "--project", project.as_str(), "--quiet"])
                .await?;
        }
        Ok(())
    }

    fn dns_capable(&self) -> bool {
        true
    }

    fn owns_default_dns_zone(&self) -> bool {
        true
    }

    fn covers_default_project(&self) -> bool {
        self.projects.iter().any(|p| *p == self.dns.project)
    }

    async fn sync_dns(&self, vms: &[Vm]) -> Result<()> {
        let client = CloudDnsClient::new(self.access_token().await?, &self.dns.project, &self.dns.zone);
        let existing = client.list_record_sets().await?;
        let change = plan_changes(&existing, vms, &self.dns.subdomain);
        if change.is_empty() {
            debug!(zone = client.zone(), "gce: DNS records up to date");
            return Ok(());
        }
        let applied = client.create_change(&change).await?;
        info!(
            zone = client.zone(),
            change = %applied.id,
            additions = change.additions.len(),
            deletions = change.deletions.len(),
            "gce: DNS change submitted"
        );
        Ok(())
    }

    fn supports_filesystem(&self, _fs: FileSystem) -> bool {
        true
    }
}
