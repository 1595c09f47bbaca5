use std::io;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::vm_name;
use crate::{CreateOpts, Error, LOCAL_CLUSTER, ProviderName, Result, Vm, VmProvider};

const LOCALHOST: &str = "127.0.0.1";

#[derive(Debug, Default, Serialize, Deserialize)]
struct Inventory {
    vms: Vec<Vm>,
}

/// Pseudo-provider whose "VMs" are directories on this machine.
///
/// The inventory is a JSON file in the state directory; it exists exactly
/// while the local cluster does.
pub struct LocalProvider {
    inventory: PathBuf,
}

impl LocalProvider {
    pub fn new(inventory: PathBuf) -> Self {
        Self { inventory }
    }

    async fn read(&self) -> Result<Inventory> {
        match tokio::fs::read(&self.inventory).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Inventory::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, inventory: &Inventory) -> Result<()> {
        if inventory.vms.is_empty() {
            return match tokio::fs::remove_file(&self.inventory).await {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            };
        }
        if let Some(parent) = self.inventory.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.inventory, serde_json::to_vec_pretty(inventory)?).await?;
        Ok(())
    }
}

fn local_user() -> String {
    std::env::var("USER").unwrap_or_else(|_| "root".into())
}

#[async_trait]
impl VmProvider for LocalProvider {
    fn name(&self) -> ProviderName {
        ProviderName::Local
    }

    fn active(&self) -> bool {
        true
    }

    async fn find_active_account(&self) -> Result<Option<String>> {
        Ok(None)
    }

    async fn list(&self) -> Result<Vec<Vm>> {
        Ok(self.read().await?.vms)
    }

    async fn create(&self, names: &[String], opts: &CreateOpts) -> Result<()> {
        let mut inventory = self.read().await?;
        if !inventory.vms.is_empty() {
            return Err(Error::AlreadyExists(LOCAL_CLUSTER.into()));
        }

        let now = Utc::now();
        let user = local_user();
        for (i, name) in names.iter().enumerate() {
            if *name != vm_name(LOCAL_CLUSTER, i + 1) {
                return Err(Error::InvalidInput(format!(
                    "local node {name} is not named after the local cluster"
                )));
            }
            inventory.vms.push(Vm {
                name: name.clone(),
                provider: ProviderName::Local,
                provider_id: name.clone(),
                public_ip: LOCALHOST.into(),
                private_ip: Some(LOCALHOST.into()),
                created_at: now,
                lifetime: opts.lifetime,
                locality: "region=local,zone=local".into(),
                account: user.clone(),
                remote_user: user.clone(),
                project: LOCAL_CLUSTER.into(),
                zone: LOCAL_CLUSTER.into(),
                machine_type: LOCAL_CLUSTER.into(),
                errors: Vec::new(),
            });
        }
        self.write(&inventory).await?;
        info!(nodes = names.len(), "local: cluster registered");
        Ok(())
    }

    async fn delete(&self, vms: &[Vm]) -> Result<()> {
        let mut inventory = self.read().await?;
        inventory
            .vms
            .retain(|v| !vms.iter().any(|gone| gone.name == v.name));
        self.write(&inventory).await?;
        info!(nodes = vms.len(), "local: nodes removed");
        Ok(())
    }

    async fn reset(&self, _vms: &[Vm]) -> Result<()> {
        Ok(())
    }

    async fn extend(&self, vms: &[Vm], lifetime: Duration) -> Result<()> {
        let mut inventory = self.read().await?;
        for vm in inventory
            .vms
            .iter_mut()
            .filter(|v| vms.iter().any(|x| x.name == v.name))
        {
            vm.lifetime = lifetime;
        }
        self.write(&inventory).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    fn names(n: usize) -> Vec<String> {
        (1..=n).map(|i| vm_name(LOCAL_CLUSTER, i)).collect()
    }

    #[tokio::test]
    async fn test_create_list_delete() {
        let dir = tempfile::tempdir().unwrap();
        let local = LocalProvider::new(dir.path().join("local-cluster.json"));
        assert!(local.list().await.unwrap().is_empty());

        local.create(&names(3), &CreateOpts::default()).await.unwrap();
        let vms = local.list().await.unwrap();
        assert_eq!(vms.len(), 3);
        assert_eq!(vms[2].name, "local-0003");
        assert_eq!(vms[0].public_ip, LOCALHOST);

        let err = local.create(&names(1), &CreateOpts::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        local.extend(&vms[..1], Duration::from_secs(60)).await.unwrap();
        assert_eq!(local.list().await.unwrap()[0].lifetime, Duration::from_secs(60));

        local.delete(&vms).await.unwrap();
        assert!(local.list().await.unwrap().is_empty());
        assert!(!dir.path().join("local-cluster.json").exists());
    }

    #[tokio::test]
    async fn test_rejects_foreign_names() {
        let dir = tempfile::tempdir().unwrap();
        let local = LocalProvider::new(dir.path().join("inv.json"));
        let err = local
            .create(&["alice-x-0001".to_string()], &CreateOpts::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}
