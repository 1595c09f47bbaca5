use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Deserialize;
use tracing::{debug, info};

use super::{MANAGED_LABEL, disabled, env_list, lifetime_label, locality, owner_of, startup_script};
use crate::command;
use crate::types::format_lifetime;
use crate::{CreateOpts, Error, ProviderName, Result, Vm, VmProvider};

const AWS: &str = "aws";

/// Prefix of key pairs this tool imports; only these are garbage collected.
const KEY_PAIR_PREFIX: &str = "fleet-";

/// Amazon EC2, driven through the `aws` CLI.
pub struct AwsProvider {
    regions: Vec<String>,
    ami: Option<String>,
    machine_type: String,
    key_name: String,
    public_key_path: PathBuf,
    active: bool,
}

impl AwsProvider {
    /// Create from env vars:
    ///
    /// - `FLEET_AWS_REGIONS` (comma-separated, default: `us-east-2`)
    /// - `FLEET_AWS_AMI` (required to create instances)
    /// - `FLEET_AWS_MACHINE_TYPE` (default: `m5.xlarge`)
    /// - `FLEET_AWS_KEY_NAME` (default: `fleet-$USER`)
    /// - `FLEET_AWS_PUBLIC_KEY` (default: `$HOME/.ssh/id_rsa.pub`)
    /// - `FLEET_AWS_DISABLED`
    ///
    /// Inactive when the `aws` CLI isn't installed.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let user = std::env::var("USER").unwrap_or_else(|_| "unknown".into());
        let home = std::env::var("HOME").unwrap_or_default();

        Self {
            regions: env_list("FLEET_AWS_REGIONS", &["us-east-2"]),
            ami: std::env::var("FLEET_AWS_AMI").ok().filter(|s| !s.is_empty()),
            machine_type: std::env::var("FLEET_AWS_MACHINE_TYPE")
                .unwrap_or_else(|_| "m5.xlarge".into()),
            key_name: std::env::var("FLEET_AWS_KEY_NAME")
                .unwrap_or_else(|_| format!("{KEY_PAIR_PREFIX}{user}")),
            public_key_path: std::env::var_os("FLEET_AWS_PUBLIC_KEY")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(home).join(".ssh").join("id_rsa.pub")),
            active: !disabled(ProviderName::Aws) && command::on_path(AWS),
        }
    }

    async fn describe_instances(&self, region: &str, managed_only: bool) -> Result<Vec<Instance>> {
        let mut args = vec![
            "ec2".to_string(),
            "describe-instances".into(),
            "--region".into(),
            region.into(),
            "--output".into(),
            "json".into(),
            "--filters".into(),
            "Name=instance-state-name,Values=pending,running,stopping,stopped".into(),
        ];
        if managed_only {
            args.push(format!("Name=tag:{MANAGED_LABEL},Values=true"));
        }
        let resp: DescribeInstances = command::json(AWS, &args).await?;
        Ok(resp
            .reservations
            .into_iter()
            .flat_map(|r| r.instances)
            .collect())
    }

    /// Run an `ec2` subcommand once per region over the VMs' instance ids.
    async fn per_region(&self, subcommand: &str, vms: &[Vm], extra: &[String]) -> Result<()> {
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for vm in vms {
            groups
                .entry(vm.project.clone())
                .or_default()
                .push(vm.provider_id.clone());
        }

        let results = join_all(groups.into_iter().map(|(region, ids)| {
            let mut args: Vec<String> = vec!["ec2".into(), subcommand.into(), "--region".into(), region];
            match subcommand {
                "create-tags" => args.push("--resources".into()),
                _ => args.push("--instance-ids".into()),
            }
            args.extend(ids);
            args.extend(extra.iter().cloned());
            async move { command::run(AWS, &args).await.map(drop) }
        }))
        .await;

        match Error::combine(results.into_iter().filter_map(Result::err)) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn create_one(&self, name: &str, zone: &str, opts: &CreateOpts, user_data: &str) -> Result<()> {
        let ami = self
            .ami
            .as_deref()
            .ok_or_else(|| Error::InvalidInput("FLEET_AWS_AMI is not set".into()))?;
        let tags = format!(
            "ResourceType=instance,Tags=[{{Key=Name,Value={name}}},{{Key={MANAGED_LABEL},Value=true}},{{Key=Lifetime,Value={}}},{{Key=Owner,Value={}}}]",
            format_lifetime(opts.lifetime),
            owner_of(name)
        );
        let placement = format!("AvailabilityZone={zone}");
        let args = [
            "ec2",
            "run-instances",
            "--region",
            region_of(zone),
            "--placement",
            placement.as_str(),
            "--image-id",
            ami,
            "--instance-type",
            opts.machine_type.as_deref().unwrap_or(self.machine_type.as_str()),
            "--key-name",
            self.key_name.as_str(),
            "--count",
            "1",
            "--tag-specifications",
            tags.as_str(),
            "--user-data",
            user_data,
            "--output",
            "json",
        ];
        command::run(AWS, &args).await.map(drop)
    }

    async fn key_pairs(&self, region: &str) -> Result<Vec<String>> {
        let resp: DescribeKeyPairs = command::json(
            AWS,
            &["ec2", "describe-key-pairs", "--region", region, "--output", "json"],
        )
        .await?;
        Ok(resp.key_pairs.into_iter().map(|k| k.key_name).collect())
    }
}

fn region_of(zone: &str) -> &str {
    // us-east-2a -> us-east-2
    match zone.as_bytes().last() {
        Some(b) if b.is_ascii_alphabetic() => &zone[..zone.len() - 1],
        _ => zone,
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstances {
    #[serde(default)]
    reservations: Vec<Reservation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    #[serde(default)]
    instances: Vec<Instance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Instance {
    instance_id: String,
    instance_type: String,
    launch_time: DateTime<Utc>,
    public_ip_address: Option<String>,
    private_ip_address: Option<String>,
    key_name: Option<String>,
    placement: Placement,
    #[serde(default)]
    tags: Vec<Tag>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Placement {
    availability_zone: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Tag {
    key: String,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CallerIdentity {
    arn: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeKeyPairs {
    #[serde(default)]
    key_pairs: Vec<KeyPair>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KeyPair {
    key_name: String,
}

impl Instance {
    fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.key == key)
            .map(|t| t.value.as_str())
    }

    fn into_vm(self) -> Vm {
        let mut errors = Vec::new();
        let lifetime = lifetime_label(self.tag("Lifetime"), &mut errors);
        let name = match self.tag("Name") {
            Some(n) => n.to_string(),
            None => {
                errors.push("missing Name tag".into());
                self.instance_id.clone()
            }
        };
        let account = self
            .tag("Owner")
            .map(str::to_string)
            .unwrap_or_else(|| owner_of(&name).to_string());
        let zone = self.placement.availability_zone;
        let region = region_of(&zone).to_string();
        let public_ip = self.public_ip_address.unwrap_or_default();
        if public_ip.is_empty() {
            errors.push("no public IP".into());
        }

        Vm {
            name,
            provider: ProviderName::Aws,
            provider_id: self.instance_id,
            public_ip,
            private_ip: self.private_ip_address,
            created_at: self.launch_time,
            lifetime,
            locality: locality(ProviderName::Aws, &region, &zone),
            account,
            remote_user: "ubuntu".into(),
            project: region,
            zone,
            machine_type: self.instance_type,
            errors,
        }
    }
}

#[async_trait]
impl VmProvider for AwsProvider {
    fn name(&self) -> ProviderName {
        ProviderName::Aws
    }

    fn active(&self) -> bool {
        self.active
    }

    async fn find_active_account(&self) -> Result<Option<String>> {
        let identity: CallerIdentity =
            command::json(AWS, &["sts", "get-caller-identity", "--output", "json"]).await?;
        // arn:aws:iam::123456789012:user/alice
        Ok(identity
            .arn
            .rsplit('/')
            .next()
            .filter(|u| !u.is_empty() && !u.contains(':'))
            .map(str::to_string))
    }

    async fn list(&self) -> Result<Vec<Vm>> {
        let results = join_all(self.regions.iter().map(|r| self.describe_instances(r, true))).await;
        let mut vms = Vec::new();
        for result in results {
            vms.extend(result?.into_iter().map(Instance::into_vm));
        }
        debug!(count = vms.len(), "aws: listed instances");
        Ok(vms)
    }

    async fn create(&self, names: &[String], opts: &CreateOpts) -> Result<()> {
        let zones: Vec<String> = if opts.zones.is_empty() {
            self.regions.iter().take(1).map(|r| format!("{r}a")).collect()
        } else {
            opts.zones.clone()
        };
        if zones.is_empty() {
            return Err(Error::InvalidInput("no AWS zone to create in".into()));
        }
        let user_data = startup_script(&opts.ssd, "/dev/nvme[1-9]n1");

        let results = join_all(names.iter().enumerate().map(|(i, name)| {
            let zone = &zones[i % zones.len()];
            self.create_one(name, zone, opts, &user_data)
        }))
        .await;

        match Error::combine(results.into_iter().filter_map(Result::err)) {
            Some(err) => Err(err),
            None => {
                info!(cluster = %opts.cluster_name, nodes = names.len(), "aws: instances launched");
                Ok(())
            }
        }
    }

    async fn delete(&self, vms: &[Vm]) -> Result<()> {
        self.per_region("terminate-instances", vms, &[]).await?;
        info!(count = vms.len(), "aws: instances terminated");
        Ok(())
    }

    async fn reset(&self, vms: &[Vm]) -> Result<()> {
        self.per_region("reboot-instances", vms, &[]).await
    }

    async fn extend(&self, vms: &[Vm], lifetime: Duration) -> Result<()> {
        let tags = vec![
            "--tags".to_string(),
            format!("Key=Lifetime,Value={}", format_lifetime(lifetime)),
        ];
        self.per_region("create-tags", vms, &tags).await
    }

    /// Import the local public key as a key pair in every region lacking it.
    async fn config_ssh(&self) -> Result<()> {
        let material = format!("fileb://{}", self.public_key_path.display());
        for region in &self.regions {
            if self.key_pairs(region).await?.contains(&self.key_name) {
                continue;
            }
            command::run(
                AWS,
                &[
                    "ec2",
                    "import-key-pair",
                    "--region",
                    region.as_str(),
                    "--key-name",
                    self.key_name.as_str(),
                    "--public-key-material",
                    material.as_str(),
                ],
            )
            .await?;
            info!(region = %region, key = %self.key_name, "aws: key pair imported");
        }
        Ok(())
    }

    fn dns_capable(&self) -> bool {
        true
    }

    fn covers_default_project(&self) -> bool {
        true
    }

    async fn gc_key_pairs(&self, dry_run: bool) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for region in &self.regions {
            let in_use: BTreeSet<String> = self
                .describe_instances(region, false)
                .await?
                .into_iter()
                .filter_map(|i| i.key_name)
                .collect();
            let unused = unused_key_pairs(self.key_pairs(region).await?, &in_use);
            for key in unused {
                if dry_run {
                    info!(region = %region, key = %key, "aws: would delete unused key pair");
                } else {
                    command::run(
                        AWS,
                        &["ec2", "delete-key-pair", "--region", region.as_str(), "--key-name", key.as_str()],
                    )
                    .await?;
                    info!(region = %region, key = %key, "aws: deleted unused key pair");
                }
                removed.push(format!("{region}/{key}"));
            }
        }
        Ok(removed)
    }
}

/// Key pairs created by this tool that no instance references.
fn unused_key_pairs(keys: Vec<String>, in_use: &BTreeSet<String>) -> Vec<String> {
    keys.into_iter()
        .filter(|k| k.starts_with(KEY_PAIR_PREFIX) && !in_use.contains(k))
        .collect()
}
