//! Cluster lifecycle: create, destroy, extend, reset and garbage collection.

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterOpts, SyncedCluster, split_selector};
use crate::gc::{self, GcReport};
use crate::nodes;
use crate::notify::SlackNotifier;
use crate::parallel;
use crate::remote::{NodeRunner, SshRunner};
use crate::state::StateStore;
use crate::types::vm_name;
use crate::{
    Cloud, Cluster, CreateOpts, Error, FleetConfig, LOCAL_CLUSTER, ProviderName, ProviderRegistry,
    Result, build_providers,
};

/// Largest cluster `create` accepts.
pub const MAX_NODES: usize = 999;

/// How long SSH bootstrap waits for new VMs to accept connections.
pub const SSH_WAIT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Entry point for every cluster-level operation.
///
/// Owns the provider registry, the state store and the node transport, and
/// is passed explicitly to whatever needs them.
#[derive(Clone)]
pub struct Fleet {
    config: FleetConfig,
    registry: ProviderRegistry,
    store: StateStore,
    runner: Arc<dyn NodeRunner>,
    ssh_wait: Duration,
}

impl Fleet {
    pub fn new(config: FleetConfig, registry: ProviderRegistry, runner: Arc<dyn NodeRunner>) -> Self {
        let store = StateStore::new(&config, registry.clone());
        Self {
            config,
            registry,
            store,
            runner,
            ssh_wait: SSH_WAIT_TIMEOUT,
        }
    }

    /// Configuration and providers from the environment, SSH transport.
    pub fn from_env() -> Result<Self> {
        let config = FleetConfig::from_env()?;
        let registry = build_providers(&config);
        Ok(Self::new(config, registry, Arc::new(SshRunner::new())))
    }

    /// Override how long SSH bootstrap waits for nodes.
    pub fn with_ssh_wait(mut self, timeout: Duration) -> Self {
        self.ssh_wait = timeout;
        self
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn runner(&self) -> &dyn NodeRunner {
        self.runner.as_ref()
    }

    pub async fn sync(&self, quiet: bool) -> Result<Cloud> {
        self.store.synchronize(quiet).await
    }

    /// Synchronize, then keep the clusters matching `pattern`, or the
    /// caller's own clusters when `mine` is set.
    pub async fn list(&self, quiet: bool, mine: bool, pattern: Option<&str>) -> Result<Cloud> {
        let pattern = match pattern.filter(|p| !p.is_empty()) {
            Some(_) if mine => {
                return Err(Error::InvalidInput(
                    "'mine' option cannot be combined with 'pattern'".into(),
                ));
            }
            Some(p) => Some(Regex::new(p).map_err(|e| {
                Error::InvalidInput(format!("could not compile regex pattern {p}: {e}"))
            })?),
            None if mine => Some(self.registry.ownership_pattern().await?),
            None => None,
        };

        let cloud = self.store.synchronize(quiet).await?;
        Ok(match pattern {
            Some(p) => cloud.filtered(&p),
            None => cloud,
        })
    }

    /// Cluster names from the cache, without contacting any provider. The
    /// cluster `prefix` starts with is expanded to its `name:N` hosts.
    pub fn cached_hosts(&self, prefix: &str) -> Result<Vec<String>> {
        let cloud = self.store.load()?;
        Ok(cloud
            .clusters
            .values()
            .map(|c| {
                let mut line = c.name.clone();
                if prefix.starts_with(&c.name) {
                    for i in 1..=c.vms.len() {
                        line.push_str(&format!(" {}:{i}", c.name));
                    }
                }
                line
            })
            .collect())
    }

    /// Look up the cluster `opts.name` selects in the cache.
    pub fn resolve_cluster(&self, opts: &ClusterOpts) -> Result<SyncedCluster> {
        let (name, nodes) = split_selector(&opts.name)?;
        let cloud = self.store.load()?;
        let Some(cluster) = cloud.clusters.get(name) else {
            let known: Vec<&str> = cloud.clusters.keys().map(String::as_str).collect();
            return Err(Error::NotFound(format!(
                "unknown cluster: {name}\nknown clusters: [{}]\nrun `fleetctl sync` if the cluster was created elsewhere",
                known.join(" ")
            )));
        };
        let opts = ClusterOpts {
            name: name.to_string(),
            ..opts.clone()
        };
        SyncedCluster::new(cluster.clone(), nodes, opts, &self.config.local_root)
    }

    /// Provision a cluster of `node_count` VMs named `opts.name`.
    ///
    /// A failure after provisioning started destroys whatever was created,
    /// unless the cluster already existed. The original error is returned
    /// whatever the cleanup outcome.
    pub async fn create(
        &self,
        node_count: usize,
        username: Option<&str>,
        mut create: CreateOpts,
        opts: &ClusterOpts,
    ) -> Result<()> {
        if !(1..=MAX_NODES).contains(&node_count) {
            return Err(Error::InvalidInput(format!(
                "number of nodes must be in [1..{MAX_NODES}]"
            )));
        }

        let name = self.registry.verify_cluster_name(&opts.name, username).await?;
        let is_local = name == LOCAL_CLUSTER;
        create.cluster_name = name.clone();
        if is_local {
            create.providers = vec![ProviderName::Local];
        }
        self.check_providers(&create)?;

        let exists = if is_local {
            self.store.load()?.clusters.contains_key(&name)
        } else {
            self.store.synchronize(opts.quiet).await?.clusters.contains_key(&name)
        };
        if exists {
            return Err(Error::AlreadyExists(name));
        }

        info!(cluster = %name, nodes = node_count, "creating cluster");
        let result = match self.provision(node_count, &create).await {
            Ok(()) if is_local => self.finish_local_create(node_count).await,
            Ok(()) => {
                let opts = ClusterOpts {
                    name: name.clone(),
                    ..opts.clone()
                };
                self.setup_ssh(&opts, username).await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = &result
            && !is_local
            && !e.is_already_exists()
        {
            self.cleanup_failed_create(&name, e).await;
        }
        result
    }

    fn check_providers(&self, create: &CreateOpts) -> Result<()> {
        if create.providers.is_empty() {
            return Err(Error::InvalidInput("no VM providers selected".into()));
        }
        for &name in &create.providers {
            let provider = self.registry.require(name)?;
            if !provider.active() {
                return Err(Error::InvalidInput(format!("provider {name} is not active")));
            }
            if !provider.supports_filesystem(create.ssd.file_system) {
                return Err(Error::InvalidInput(format!(
                    "creating a node with --filesystem={} is not supported on {name}",
                    create.ssd.file_system
                )));
            }
        }
        Ok(())
    }

    async fn provision(&self, node_count: usize, create: &CreateOpts) -> Result<()> {
        let placement = place_nodes(&create.cluster_name, node_count, &create.providers);
        let providers: Vec<ProviderName> = placement.keys().copied().collect();
        self.registry
            .providers_parallel(&providers, |p| {
                let names = placement.get(&p.name()).cloned().unwrap_or_default();
                async move { p.create(&names, create).await }
            })
            .await
    }

    async fn finish_local_create(&self, node_count: usize) -> Result<()> {
        for node in 1..=node_count {
            tokio::fs::create_dir_all(self.config.local_node_dir(node)).await?;
        }
        let vms = self.registry.require(ProviderName::Local)?.list().await?;
        let now = Utc::now();
        self.store
            .update(move |cloud| {
                if let Some(local) = Cloud::from_vms(vms, now).clusters.remove(LOCAL_CLUSTER) {
                    cloud.clusters.insert(LOCAL_CLUSTER.to_string(), local);
                }
            })
            .await?;
        info!(nodes = node_count, "local cluster created");
        Ok(())
    }

    async fn cleanup_failed_create(&self, name: &str, cause: &Error) {
        warn!(cluster = %name, error = %cause, "cleaning up partially-created cluster");
        let cleanup = async {
            let cloud = Cloud::from_vms(self.registry.list_all_vms().await?, Utc::now());
            let Some(cluster) = cloud.clusters.get(name) else {
                return Ok::<_, Error>(false);
            };
            self.destroy_cluster(cluster).await?;
            Ok(true)
        };
        match cleanup.await {
            Ok(true) => info!(cluster = %name, "cleanup complete"),
            Ok(false) => debug!(cluster = %name, "no VMs were created, nothing to clean up"),
            Err(e) => warn!(cluster = %name, error = %e, "cleanup of partially-created cluster failed"),
        }
    }

    /// Clear stale host keys, wait for every VM to accept connections and
    /// install the configured authorized keys.
    pub async fn setup_ssh(&self, opts: &ClusterOpts, username: Option<&str>) -> Result<()> {
        let (name, _) = split_selector(&opts.name)?;
        let name = self.registry.verify_cluster_name(name, username).await?;
        let cloud = self.store.synchronize(opts.quiet).await?;
        let cluster = cloud
            .clusters
            .get(&name)
            .ok_or_else(|| Error::NotFound(format!("could not find {name} in list of clusters")))?;
        info!("{}", cluster.details(Utc::now()));

        // Addresses get recycled; a stale key would fail strict checking.
        for vm in &cluster.vms {
            if let Err(e) = self.runner.clear_host_key(&vm.public_ip).await {
                warn!(host = %vm.public_ip, error = %e, "could not clear ssh host key");
            }
        }

        // The sync above rewrote the cache.
        let c = self.resolve_cluster(&ClusterOpts {
            name: name.clone(),
            ..opts.clone()
        })?;
        nodes::wait(self.runner.as_ref(), &c, self.ssh_wait).await?;

        match tokio::fs::read_to_string(&self.config.authorized_keys_path).await {
            Ok(keys) => nodes::authorize_keys(self.runner.as_ref(), &c, &keys).await,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(
                    path = %self.config.authorized_keys_path.display(),
                    "no authorized keys to propagate"
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Destroy the named clusters, or every cluster the caller owns.
    ///
    /// The local cluster is torn down inline; remote clusters are destroyed
    /// concurrently and every failure is reported.
    pub async fn destroy(&self, names: &[String], all_mine: bool, username: Option<&str>) -> Result<()> {
        match (names.is_empty(), all_mine) {
            (true, false) => Err(Error::InvalidInput("no cluster name provided".into())),
            (false, true) => Err(Error::InvalidInput(
                "--all-mine cannot be combined with cluster names".into(),
            )),
            (true, true) => {
                let pattern = self.registry.ownership_pattern().await?;
                let cloud = self.store.synchronize(true).await?;
                let mine: Vec<String> = cloud
                    .clusters
                    .keys()
                    .filter(|name| pattern.is_match(name))
                    .cloned()
                    .collect();
                self.destroy_remote(&cloud, &mine).await
            }
            (false, false) => {
                let mut verified = Vec::with_capacity(names.len());
                for selector in names {
                    let (name, _) = split_selector(selector)?;
                    verified.push(self.registry.verify_cluster_name(name, username).await?);
                }

                let mut remote = Vec::new();
                for name in verified {
                    if name == LOCAL_CLUSTER {
                        self.destroy_local().await?;
                    } else {
                        remote.push(name);
                    }
                }
                if remote.is_empty() {
                    return Ok(());
                }
                let cloud = self.store.synchronize(true).await?;
                self.destroy_remote(&cloud, &remote).await
            }
        }
    }

    async fn destroy_local(&self) -> Result<()> {
        let cloud = self.store.load()?;
        let Some(cluster) = cloud.clusters.get(LOCAL_CLUSTER) else {
            return Err(Error::NotFound(format!("cluster {LOCAL_CLUSTER} does not exist")));
        };
        let opts = ClusterOpts {
            max_concurrency: self.config.max_concurrency,
            ..ClusterOpts::named(LOCAL_CLUSTER)
        };
        let c = SyncedCluster::new(cluster.clone(), "all", opts, &self.config.local_root)?;
        if let Err(e) = nodes::wipe(self.runner.as_ref(), &c, false).await {
            warn!(error = %e, "failed to wipe local nodes");
        }

        for &node in &c.nodes {
            match tokio::fs::remove_dir_all(self.config.local_node_dir(node)).await {
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }
        self.registry
            .require(ProviderName::Local)?
            .delete(&cluster.vms)
            .await?;
        self.store
            .update(|cloud| {
                cloud.clusters.remove(LOCAL_CLUSTER);
            })
            .await?;
        info!("local cluster destroyed");
        Ok(())
    }

    /// Destroy `names` from `cloud` concurrently, one worker per cluster.
    async fn destroy_remote(&self, cloud: &Cloud, names: &[String]) -> Result<()> {
        self.destroy_clusters(cloud, names).await.map_err(|(_, e)| e)
    }

    /// Like [`Self::destroy_remote`], also naming the clusters that were not
    /// destroyed when anything fails.
    async fn destroy_clusters(
        &self,
        cloud: &Cloud,
        names: &[String],
    ) -> std::result::Result<(), (Vec<String>, Error)> {
        if names.is_empty() {
            return Ok(());
        }
        let result = parallel::run("destroying clusters", names.len(), names.len(), |i| async move {
            let name = &names[i];
            let cluster = cloud
                .clusters
                .get(name)
                .ok_or_else(|| Error::NotFound(format!("cluster {name} does not exist")))?;
            self.destroy_cluster(cluster)
                .await
                .map_err(|e| Error::cluster(name.as_str(), e))?;
            Ok(Vec::new())
        })
        .await;

        let failed: Vec<String> = match &result {
            Ok(_) => Vec::new(),
            Err(p) => p.failures.iter().map(|f| names[f.index].clone()).collect(),
        };
        let destroyed: Vec<&String> = names.iter().filter(|name| !failed.contains(*name)).collect();
        if !destroyed.is_empty()
            && let Err(e) = self
                .store
                .update(|cloud| {
                    for name in &destroyed {
                        cloud.clusters.remove(name.as_str());
                    }
                })
                .await
        {
            return Err((failed, e));
        }

        result
            .map(drop)
            .map_err(|p| (failed, parallel::PartialFailure::into_combined(p)))
    }

    async fn destroy_cluster(&self, cluster: &Cluster) -> Result<()> {
        info!(cluster = %cluster.name, nodes = cluster.vms.len(), "destroying cluster");
        self.registry
            .fan_out(&cluster.vms, |p, vms| async move { p.delete(&vms).await })
            .await
    }

    /// Push the expiry of `name` out by `extension` and return the
    /// re-synchronized cluster.
    pub async fn extend(&self, name: &str, extension: Duration) -> Result<Cluster> {
        let not_found = || Error::NotFound(format!("cluster {name} does not exist"));

        let cloud = self.store.synchronize(true).await?;
        let cluster = cloud.clusters.get(name).ok_or_else(not_found)?;
        let lifetime = cluster.lifetime.saturating_add(extension);
        self.registry
            .fan_out(&cluster.vms, |p, vms| async move { p.extend(&vms, lifetime).await })
            .await?;

        let cloud = self.store.synchronize(true).await?;
        let cluster = cloud.clusters.get(name).cloned().ok_or_else(not_found)?;
        info!("{}", cluster.details(Utc::now()));
        Ok(cluster)
    }

    /// Power-cycle every VM of `name`. The local cluster has nothing to reset.
    pub async fn reset(&self, name: &str, username: Option<&str>) -> Result<()> {
        let (name, _) = split_selector(name)?;
        let name = self.registry.verify_cluster_name(name, username).await?;
        if name == LOCAL_CLUSTER {
            return Ok(());
        }

        let cloud = self.store.synchronize(true).await?;
        let cluster = cloud
            .clusters
            .get(&name)
            .ok_or_else(|| Error::NotFound(format!("cluster {name} not found")))?;
        self.registry
            .fan_out(&cluster.vms, |p, vms| async move { p.reset(&vms).await })
            .await?;
        info!(cluster = %name, "cluster reset");
        Ok(())
    }

    /// Destroy expired clusters and unused key pairs.
    ///
    /// The cluster pass and the key-pair pass are independent: both always
    /// run and their errors are combined. A dry run computes the report but
    /// destroys nothing.
    pub async fn gc(&self, dry_run: bool, slack_token: Option<&str>) -> Result<GcReport> {
        let mut errors = Vec::new();

        let mut report = match self.store.synchronize(true).await {
            Ok(cloud) => {
                let mut report = gc::classify(&cloud, Utc::now(), dry_run);
                if !dry_run {
                    let expired: Vec<String> = report.destroy.iter().map(|c| c.name.clone()).collect();
                    if let Err((failed, e)) = self.destroy_clusters(&cloud, &expired).await {
                        report.failed = failed;
                        errors.push(e);
                    }
                }
                report
            }
            Err(e) => {
                errors.push(e);
                GcReport {
                    dry_run,
                    ..Default::default()
                }
            }
        };

        for provider in self.registry.active() {
            match provider.gc_key_pairs(dry_run).await {
                Ok(keys) => report.key_pairs.extend(keys),
                Err(e) => errors.push(Error::provider(provider.name(), e)),
            }
        }

        self.report_gc(&report, slack_token).await;
        match Error::combine(errors) {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    async fn report_gc(&self, report: &GcReport, slack_token: Option<&str>) {
        if !report.is_noteworthy() && report.key_pairs.is_empty() {
            debug!(healthy = report.good.len(), "gc: nothing to report");
            return;
        }
        let text = report.summary(Utc::now());
        match slack_token.filter(|t| !t.is_empty()) {
            Some(token) if !report.dry_run => {
                let notifier = SlackNotifier::new(token, &self.config.slack_channel);
                if let Err(e) = notifier.post(&text).await {
                    warn!(error = %e, "gc: failed to post report");
                }
            }
            _ => info!("gc report:\n{text}"),
        }
    }
}

/// Assign node names round-robin over `providers`, in the order given.
pub fn place_nodes(
    cluster: &str,
    node_count: usize,
    providers: &[ProviderName],
) -> BTreeMap<ProviderName, Vec<String>> {
    let mut order: Vec<ProviderName> = Vec::with_capacity(providers.len());
    for p in providers {
        if !order.contains(p) {
            order.push(*p);
        }
    }

    let mut placement: BTreeMap<ProviderName, Vec<String>> = BTreeMap::new();
    if order.is_empty() {
        return placement;
    }
    for node in 1..=node_count {
        let provider = order[(node - 1) % order.len()];
        placement.entry(provider).or_default().push(vm_name(cluster, node));
    }
    placement
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_place_nodes_round_robin() {
        let placement = place_nodes(
            "alice-x",
            5,
            &[ProviderName::Gce, ProviderName::Aws, ProviderName::Gce],
        );
        assert_eq!(
            placement[&ProviderName::Gce],
            vec!["alice-x-0001", "alice-x-0003", "alice-x-0005"]
        );
        assert_eq!(placement[&ProviderName::Aws], vec!["alice-x-0002", "alice-x-0004"]);
        assert!(place_nodes("alice-x", 3, &[]).is_empty());
    }
}
