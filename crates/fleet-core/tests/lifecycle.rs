use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_core::cluster::ClusterOpts;
use fleet_core::parallel::UnitError;
use fleet_core::providers::local::LocalProvider;
use fleet_core::remote::{NodeRunner, NodeTarget};
use fleet_core::{
    CreateOpts, Error, ErrorKind, Fleet, FleetConfig, ProviderName, ProviderRegistry, Result, Vm,
    VmProvider,
};

/// In-memory provider. Optionally fails `create` after creating some VMs,
/// fails listing, deletion or key-pair collection, or slows `list` down to
/// widen race windows.
struct FakeProvider {
    account: String,
    vms: Mutex<Vec<Vm>>,
    fail_create_after: Option<usize>,
    fail_list: bool,
    fail_delete: bool,
    fail_key_pairs: bool,
    /// `dry_run` of every key-pair collection, in call order.
    key_pair_runs: Mutex<Vec<bool>>,
    list_delay: Duration,
    lists: AtomicUsize,
    listing: AtomicUsize,
    peak_listing: AtomicUsize,
    creates: AtomicUsize,
    deletes: AtomicUsize,
    extends: AtomicUsize,
}

impl FakeProvider {
    fn new(account: &str) -> Self {
        Self {
            account: account.into(),
            vms: Mutex::new(Vec::new()),
            fail_create_after: None,
            fail_list: false,
            fail_delete: false,
            fail_key_pairs: false,
            key_pair_runs: Mutex::new(Vec::new()),
            list_delay: Duration::ZERO,
            lists: AtomicUsize::new(0),
            listing: AtomicUsize::new(0),
            peak_listing: AtomicUsize::new(0),
            creates: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            extends: AtomicUsize::new(0),
        }
    }

    fn with_cluster(self, name: &str, nodes: usize, created_at: DateTime<Utc>, lifetime: Duration) -> Self {
        {
            let mut vms = self.vms.lock().unwrap();
            for i in 1..=nodes {
                vms.push(fake_vm(&format!("{name}-{i:04}"), created_at, lifetime));
            }
        }
        self
    }

    fn vm_names(&self) -> Vec<String> {
        self.vms.lock().unwrap().iter().map(|v| v.name.clone()).collect()
    }
}

fn fake_vm(name: &str, created_at: DateTime<Utc>, lifetime: Duration) -> Vm {
    Vm {
        name: name.into(),
        provider: ProviderName::Gce,
        provider_id: format!("fake/{name}"),
        public_ip: "198.51.100.1".into(),
        private_ip: Some("10.0.0.1".into()),
        created_at,
        lifetime,
        locality: "cloud=gce,region=us-east1,zone=us-east1-b".into(),
        account: name.split('-').next().unwrap_or_default().into(),
        remote_user: "ubuntu".into(),
        project: "fake".into(),
        zone: "us-east1-b".into(),
        machine_type: "n2-standard-4".into(),
        errors: Vec::new(),
    }
}

#[async_trait]
impl VmProvider for FakeProvider {
    fn name(&self) -> ProviderName {
        ProviderName::Gce
    }

    fn active(&self) -> bool {
        true
    }

    async fn find_active_account(&self) -> Result<Option<String>> {
        Ok(Some(self.account.clone()))
    }

    async fn list(&self) -> Result<Vec<Vm>> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        let now = self.listing.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_listing.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.list_delay).await;
        let vms = self.vms.lock().unwrap().clone();
        self.listing.fetch_sub(1, Ordering::SeqCst);
        if self.fail_list {
            return Err(Error::InvalidInput("listing denied".into()));
        }
        Ok(vms)
    }

    async fn create(&self, names: &[String], opts: &CreateOpts) -> Result<()> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let made = self.fail_create_after.unwrap_or(names.len()).min(names.len());
        {
            let mut vms = self.vms.lock().unwrap();
            for name in &names[..made] {
                vms.push(fake_vm(name, Utc::now(), opts.lifetime));
            }
        }
        if made < names.len() {
            return Err(Error::InvalidInput("quota exceeded".into()));
        }
        Ok(())
    }

    async fn delete(&self, vms: &[Vm]) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if self.fail_delete {
            return Err(Error::InvalidInput("delete refused".into()));
        }
        self.vms
            .lock()
            .unwrap()
            .retain(|v| !vms.iter().any(|gone| gone.name == v.name));
        Ok(())
    }

    async fn reset(&self, _vms: &[Vm]) -> Result<()> {
        Ok(())
    }

    async fn extend(&self, vms: &[Vm], lifetime: Duration) -> Result<()> {
        self.extends.fetch_add(1, Ordering::SeqCst);
        for vm in self.vms.lock().unwrap().iter_mut() {
            if vms.iter().any(|v| v.name == vm.name) {
                vm.lifetime = lifetime;
            }
        }
        Ok(())
    }

    async fn gc_key_pairs(&self, dry_run: bool) -> Result<Vec<String>> {
        self.key_pair_runs.lock().unwrap().push(dry_run);
        if self.fail_key_pairs {
            return Err(Error::InvalidInput("key pairs unavailable".into()));
        }
        Ok(vec!["fleet-stale".into()])
    }
}

/// Records every script and host-key reset; every node is reachable.
#[derive(Default)]
struct RecordingRunner {
    scripts: Mutex<Vec<(String, usize, String)>>,
    cleared: Mutex<Vec<String>>,
}

impl RecordingRunner {
    fn scripts_containing(&self, needle: &str) -> usize {
        self.scripts
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, _, s)| s.contains(needle))
            .count()
    }
}

#[async_trait]
impl NodeRunner for RecordingRunner {
    async fn run(&self, target: &NodeTarget, script: &str) -> std::result::Result<Vec<u8>, UnitError> {
        self.scripts
            .lock()
            .unwrap()
            .push((target.cluster.clone(), target.node, script.to_string()));
        Ok(Vec::new())
    }

    async fn clear_host_key(&self, host: &str) -> Result<()> {
        self.cleared.lock().unwrap().push(host.to_string());
        Ok(())
    }
}

struct Harness {
    fleet: Fleet,
    provider: Arc<FakeProvider>,
    runner: Arc<RecordingRunner>,
    config: FleetConfig,
    _home: tempfile::TempDir,
}

fn harness(provider: FakeProvider) -> Harness {
    let home = tempfile::tempdir().unwrap();
    let config = FleetConfig::with_home(home.path());
    let provider = Arc::new(provider);
    let runner = Arc::new(RecordingRunner::default());
    let registry = ProviderRegistry::new(vec![
        provider.clone() as Arc<dyn VmProvider>,
        Arc::new(LocalProvider::new(config.local_inventory_path())) as Arc<dyn VmProvider>,
    ]);
    let fleet = Fleet::new(config.clone(), registry, runner.clone()).with_ssh_wait(Duration::from_secs(1));
    Harness {
        fleet,
        provider,
        runner,
        config,
        _home: home,
    }
}

fn gce_create() -> CreateOpts {
    CreateOpts {
        providers: vec![ProviderName::Gce],
        lifetime: Duration::from_secs(3600),
        ..Default::default()
    }
}

const HOUR: Duration = Duration::from_secs(3600);

#[tokio::test]
async fn test_create_rejects_node_count_before_any_provider_call() {
    let h = harness(FakeProvider::new("alice"));
    for count in [0, 1000] {
        let err = h
            .fleet
            .create(count, None, gce_create(), &ClusterOpts::named("alice-perf"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
    assert_eq!(h.provider.lists.load(Ordering::SeqCst), 0);
    assert_eq!(h.provider.creates.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_create_provisions_and_bootstraps_ssh() {
    let h = harness(FakeProvider::new("alice"));
    std::fs::write(&h.config.authorized_keys_path, "ssh-ed25519 AAAAtest alice@laptop\n").unwrap();

    h.fleet
        .create(5, None, gce_create(), &ClusterOpts::named("alice-perf"))
        .await
        .unwrap();

    assert_eq!(h.provider.vm_names().len(), 5);
    assert_eq!(h.runner.cleared.lock().unwrap().len(), 5);
    assert_eq!(h.runner.scripts_containing("authorized_keys"), 5);
    let cached = h.fleet.store().load().unwrap();
    assert_eq!(cached.clusters["alice-perf"].vms.len(), 5);
}

#[tokio::test]
async fn test_create_existing_cluster_skips_cleanup() {
    let h = harness(FakeProvider::new("alice").with_cluster("alice-perf", 2, Utc::now(), HOUR));

    let err = h
        .fleet
        .create(3, None, gce_create(), &ClusterOpts::named("alice-perf"))
        .await
        .unwrap_err();

    assert!(err.is_already_exists());
    assert_eq!(h.provider.creates.load(Ordering::SeqCst), 0);
    assert_eq!(h.provider.deletes.load(Ordering::SeqCst), 0);
    assert_eq!(h.provider.vm_names().len(), 2);
}

#[tokio::test]
async fn test_failed_create_is_cleaned_up_once() {
    let mut provider = FakeProvider::new("alice");
    provider.fail_create_after = Some(2);
    let h = harness(provider);

    let err = h
        .fleet
        .create(4, None, gce_create(), &ClusterOpts::named("alice-perf"))
        .await
        .unwrap_err();

    assert_eq!(err.root().kind(), ErrorKind::InvalidInput);
    assert!(err.to_string().contains("quota exceeded"));
    assert_eq!(h.provider.deletes.load(Ordering::SeqCst), 1);
    assert!(h.provider.vm_names().is_empty());
}

#[tokio::test]
async fn test_create_rejects_zfs_on_unsupported_provider() {
    let h = harness(FakeProvider::new("alice"));
    let mut create = gce_create();
    create.ssd.file_system = fleet_core::FileSystem::Zfs;

    let err = h
        .fleet
        .create(1, None, create, &ClusterOpts::named("alice-perf"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert_eq!(h.provider.lists.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_destroy_rejects_names_with_all_mine_before_sync() {
    let h = harness(FakeProvider::new("alice").with_cluster("alice-a", 1, Utc::now(), HOUR));

    let err = h
        .fleet
        .destroy(&["alice-a".to_string()], true, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    let err = h.fleet.destroy(&[], false, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    assert_eq!(h.provider.lists.load(Ordering::SeqCst), 0);
    assert_eq!(h.provider.deletes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_destroy_reports_missing_clusters_and_destroys_the_rest() {
    let h = harness(FakeProvider::new("alice").with_cluster("alice-a", 3, Utc::now(), HOUR));

    let err = h
        .fleet
        .destroy(&["alice-a".to_string(), "alice-missing".to_string()], false, None)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(err.to_string().contains("alice-missing"));
    assert_eq!(h.provider.deletes.load(Ordering::SeqCst), 1);
    assert!(h.provider.vm_names().is_empty());
    assert!(!h.fleet.store().load().unwrap().clusters.contains_key("alice-a"));
}

#[tokio::test]
async fn test_destroy_all_mine_leaves_other_owners_alone() {
    let now = Utc::now();
    let h = harness(
        FakeProvider::new("alice")
            .with_cluster("alice-a", 1, now, HOUR)
            .with_cluster("alice-b", 2, now, HOUR)
            .with_cluster("bob-c", 1, now, HOUR),
    );

    h.fleet.destroy(&[], true, None).await.unwrap();

    assert_eq!(h.provider.deletes.load(Ordering::SeqCst), 2);
    assert_eq!(h.provider.vm_names(), vec!["bob-c-0001"]);
}

#[tokio::test]
async fn test_gc_dry_run_never_destroys() {
    let h = harness(
        FakeProvider::new("alice")
            .with_cluster("alice-old", 2, Utc::now() - chrono::Duration::hours(3), HOUR)
            .with_cluster("alice-new", 1, Utc::now(), 12 * HOUR),
    );

    let report = h.fleet.gc(true, None).await.unwrap();
    assert_eq!(report.destroy.len(), 1);
    assert_eq!(report.destroy[0].name, "alice-old");
    assert_eq!(h.provider.deletes.load(Ordering::SeqCst), 0);
    assert_eq!(h.provider.vm_names().len(), 3);

    let report = h.fleet.gc(false, None).await.unwrap();
    assert_eq!(report.destroy.len(), 1);
    assert_eq!(h.provider.deletes.load(Ordering::SeqCst), 1);
    assert_eq!(h.provider.vm_names(), vec!["alice-new-0001"]);
}

#[tokio::test]
async fn test_gc_passes_dry_run_to_key_pair_collection() {
    let h = harness(FakeProvider::new("alice"));

    let report = h.fleet.gc(true, None).await.unwrap();
    assert_eq!(report.key_pairs, vec!["fleet-stale"]);
    h.fleet.gc(false, None).await.unwrap();

    assert_eq!(*h.provider.key_pair_runs.lock().unwrap(), vec![true, false]);
}

#[tokio::test]
async fn test_gc_collects_key_pairs_even_when_listing_fails() {
    let expired_at = Utc::now() - chrono::Duration::hours(3);
    let mut provider = FakeProvider::new("alice").with_cluster("alice-old", 1, expired_at, HOUR);
    provider.fail_list = true;
    provider.fail_key_pairs = true;
    let h = harness(provider);

    let err = h.fleet.gc(false, None).await.unwrap_err();

    assert_eq!(*h.provider.key_pair_runs.lock().unwrap(), vec![false]);
    assert_eq!(h.provider.deletes.load(Ordering::SeqCst), 0);
    let Error::Combined(combined) = &err else {
        panic!("expected combined error, got {err:?}");
    };
    assert_eq!(combined.errors.len(), 2);
    let text = err.to_string();
    assert!(text.contains("listing denied"), "{text}");
    assert!(text.contains("key pairs unavailable"), "{text}");
}

#[tokio::test]
async fn test_gc_combines_destroy_and_key_pair_failures() {
    let expired_at = Utc::now() - chrono::Duration::hours(3);
    let mut provider = FakeProvider::new("alice").with_cluster("alice-old", 2, expired_at, HOUR);
    provider.fail_delete = true;
    provider.fail_key_pairs = true;
    let h = harness(provider);

    let err = h.fleet.gc(false, None).await.unwrap_err();

    let Error::Combined(combined) = &err else {
        panic!("expected combined error, got {err:?}");
    };
    assert_eq!(combined.errors.len(), 2);
    let text = err.to_string();
    assert!(text.contains("cluster alice-old: gce: delete refused"), "{text}");
    assert!(text.contains("key pairs unavailable"), "{text}");
    assert_eq!(h.provider.key_pair_runs.lock().unwrap().len(), 1);
    // The failed cluster stays in the cache.
    assert!(h.fleet.store().load().unwrap().clusters.contains_key("alice-old"));
}

#[tokio::test]
async fn test_destroy_failures_name_their_cluster() {
    let now = Utc::now();
    let mut provider = FakeProvider::new("alice")
        .with_cluster("alice-a", 1, now, HOUR)
        .with_cluster("alice-b", 1, now, HOUR);
    provider.fail_delete = true;
    let h = harness(provider);

    let err = h
        .fleet
        .destroy(&["alice-a".to_string(), "alice-b".to_string()], false, None)
        .await
        .unwrap_err();

    let text = err.to_string();
    assert!(text.contains("cluster alice-a: gce: delete refused"), "{text}");
    assert!(text.contains("cluster alice-b: gce: delete refused"), "{text}");
    assert_eq!(h.provider.vm_names().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_syncs_do_not_interleave() {
    let mut provider = FakeProvider::new("alice").with_cluster("alice-a", 4, Utc::now(), HOUR);
    provider.list_delay = Duration::from_millis(150);
    let h = harness(provider);

    let (a, b) = tokio::join!(h.fleet.sync(true), h.fleet.sync(true));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(h.provider.lists.load(Ordering::SeqCst), 2);
    assert_eq!(h.provider.peak_listing.load(Ordering::SeqCst), 1);
    assert_eq!(a.clusters["alice-a"].vms.len(), 4);
    assert_eq!(b.clusters["alice-a"].vms.len(), 4);
    assert_eq!(h.fleet.store().load().unwrap().clusters["alice-a"].vms.len(), 4);
    assert!(!h.config.lock_path().exists());
}

#[tokio::test]
async fn test_extend_adds_to_lifetime() {
    let h = harness(FakeProvider::new("alice").with_cluster("alice-a", 2, Utc::now(), HOUR));

    let cluster = h.fleet.extend("alice-a", 2 * HOUR).await.unwrap();
    assert_eq!(cluster.lifetime, 3 * HOUR);
    assert_eq!(h.provider.extends.load(Ordering::SeqCst), 1);

    let err = h.fleet.extend("alice-zzz", HOUR).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_local_cluster_lifecycle() {
    let h = harness(FakeProvider::new("alice"));
    let opts = ClusterOpts::named("local");

    h.fleet.create(3, None, CreateOpts::default(), &opts).await.unwrap();
    for node in 1..=3 {
        assert!(h.config.local_node_dir(node).is_dir());
    }
    assert_eq!(h.fleet.store().load().unwrap().clusters["local"].vms.len(), 3);
    // No SSH bootstrap for local nodes.
    assert!(h.runner.cleared.lock().unwrap().is_empty());
    assert_eq!(h.provider.creates.load(Ordering::SeqCst), 0);

    let err = h
        .fleet
        .create(1, None, CreateOpts::default(), &opts)
        .await
        .unwrap_err();
    assert!(err.is_already_exists());

    let c = h.fleet.resolve_cluster(&ClusterOpts::named("local:2-3")).unwrap();
    assert_eq!(c.nodes, vec![2, 3]);
    assert!(c.target(2).unwrap().is_local());

    h.fleet.destroy(&["local".to_string()], false, None).await.unwrap();
    for node in 1..=3 {
        assert!(!h.config.local_node_dir(node).exists());
    }
    assert!(!h.fleet.store().load().unwrap().clusters.contains_key("local"));
    assert!(!h.config.local_inventory_path().exists());
}

#[tokio::test]
async fn test_resolve_unknown_cluster_lists_known_ones() {
    let h = harness(FakeProvider::new("alice").with_cluster("alice-a", 1, Utc::now(), HOUR));
    h.fleet.sync(true).await.unwrap();

    let err = h
        .fleet
        .resolve_cluster(&ClusterOpts::named("alice-b"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(err.to_string().contains("[alice-a]"));

    let hosts = h.fleet.cached_hosts("alice-a").unwrap();
    assert_eq!(hosts, vec!["alice-a alice-a:1"]);
}

#[tokio::test]
async fn test_list_filters() {
    let now = Utc::now();
    let h = harness(
        FakeProvider::new("alice")
            .with_cluster("alice-a", 1, now, HOUR)
            .with_cluster("bob-b", 1, now, HOUR),
    );

    let mine = h.fleet.list(true, true, None).await.unwrap();
    assert_eq!(mine.clusters.keys().collect::<Vec<_>>(), vec!["alice-a"]);

    let bobs = h.fleet.list(true, false, Some("^bob")).await.unwrap();
    assert_eq!(bobs.clusters.keys().collect::<Vec<_>>(), vec!["bob-b"]);

    let err = h.fleet.list(true, true, Some("x")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}
