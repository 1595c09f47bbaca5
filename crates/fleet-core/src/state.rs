//! The cloud state store: a lock-guarded on-disk snapshot of every cluster.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::dns::{self, DnsRefresh};
use crate::{Cloud, Error, FleetConfig, ProviderRegistry, Result};

/// Exclusive advisory lock over the state directory.
///
/// Held for the whole list, persist and DNS refresh cycle. Dropping the guard
/// removes the lock file and releases the lock.
#[derive(Debug)]
pub struct StateLock {
    file: Option<File>,
    path: PathBuf,
}

impl StateLock {
    /// Block until the lock at `path` is held by this process.
    pub async fn acquire(path: &Path) -> Result<Self> {
        let path = path.to_path_buf();
        let locked = path.clone();
        tokio::task::spawn_blocking(move || acquire_blocking(&locked))
            .await
            .map_err(|e| Error::Lock {
                path: path.clone(),
                source: io::Error::other(e),
            })?
            .map_err(|source| Error::Lock {
                path: path.clone(),
                source,
            })
            .map(|file| Self {
                file: Some(file),
                path,
            })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        // Unlink before closing so a waiter that wins the old inode notices
        // the file it locked is gone and retries on a fresh one.
        if let Err(e) = fs::remove_file(&self.path)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %e, "failed to remove lock file");
        }
        drop(self.file.take());
    }
}

fn acquire_blocking(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    loop {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;
        flock_exclusive(&file)?;
        if still_linked(&file, path)? {
            return Ok(file);
        }
        debug!(path = %path.display(), "lock file replaced while waiting, retrying");
    }
}

/// Blocking `flock(LOCK_EX)`.
fn flock_exclusive(file: &File) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        loop {
            // SAFETY: fd is a valid descriptor owned by `file` for the
            // duration of the call.
            #[allow(unsafe_code)]
            let rc = unsafe { libc::flock(fd, libc::LOCK_EX) };
            if rc == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = file;
        Ok(())
    }
}

/// Whether `file` is still the inode at `path`.
fn still_linked(file: &File, path: &Path) -> io::Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        let held = file.metadata()?;
        match fs::metadata(path) {
            Ok(current) => Ok(held.dev() == current.dev() && held.ino() == current.ino()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (file, path);
        Ok(true)
    }
}

/// Owner of the cached [`Cloud`] snapshot and of the lock guarding it.
#[derive(Clone)]
pub struct StateStore {
    registry: ProviderRegistry,
    lock_path: PathBuf,
    cache_path: PathBuf,
}

impl StateStore {
    pub fn new(config: &FleetConfig, registry: ProviderRegistry) -> Self {
        Self {
            registry,
            lock_path: config.lock_path(),
            cache_path: config.cache_path(),
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub async fn lock(&self) -> Result<StateLock> {
        StateLock::acquire(&self.lock_path).await
    }

    /// Rebuild the snapshot from the providers and persist it.
    ///
    /// Holds the lock for the whole pass. A provider that can't be listed
    /// aborts the pass and leaves the previous snapshot in place. DNS refresh
    /// is best effort.
    pub async fn synchronize(&self, quiet: bool) -> Result<Cloud> {
        if quiet {
            debug!("syncing");
        } else {
            info!("syncing");
        }
        let _lock = self.lock().await?;

        let vms = self.registry.list_all_vms().await?;
        let cloud = Cloud::from_vms(vms, Utc::now());
        self.persist(&cloud)?;

        let vms: Vec<_> = cloud.vms().cloned().collect();
        match dns::maybe_refresh(&self.registry, &vms).await {
            Ok(DnsRefresh::Refreshed { records }) => {
                info!(records, "refreshed DNS entries");
            }
            Ok(DnsRefresh::Skipped(reason)) => {
                if quiet {
                    debug!(%reason, "not refreshing DNS entries");
                } else {
                    info!(%reason, "not refreshing DNS entries");
                }
            }
            Err(e) => warn!(error = %e, "failed to update DNS"),
        }

        let names = self.registry.all_provider_names();
        self.registry
            .providers_sequential(&names, |p| async move { p.clean_ssh().await })
            .await?;
        self.registry
            .providers_sequential(&names, |p| async move { p.config_ssh().await })
            .await?;

        info!(
            clusters = cloud.clusters.len(),
            bad_instances = cloud.bad_instances.len(),
            "sync complete"
        );
        Ok(cloud)
    }

    /// Read the last persisted snapshot without contacting any provider.
    /// An absent cache is an empty cloud.
    pub fn load(&self) -> Result<Cloud> {
        match fs::read(&self.cache_path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Cloud::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Apply `f` to the persisted snapshot under the lock.
    pub async fn update<F>(&self, f: F) -> Result<Cloud>
    where
        F: FnOnce(&mut Cloud),
    {
        let _lock = self.lock().await?;
        let mut cloud = self.load()?;
        f(&mut cloud);
        self.persist(&cloud)?;
        Ok(cloud)
    }

    /// Write `cloud` to a temporary sibling and rename it over the cache, so
    /// readers never observe a partial file.
    fn persist(&self, cloud: &Cloud) -> Result<()> {
        if let Some(parent) = self.cache_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self
            .cache_path
            .with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4()));
        let written = (|| -> Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(&serde_json::to_vec_pretty(cloud)?)?;
            file.sync_all()?;
            fs::rename(&tmp, &self.cache_path)?;
            Ok(())
        })();
        if written.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        written
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::types::tests::vm;
    use crate::{CreateOpts, ErrorKind, ProviderName, Vm, VmProvider};

    /// Active provider whose listing always fails.
    struct Unreachable;

    #[async_trait]
    impl VmProvider for Unreachable {
        fn name(&self) -> ProviderName {
            ProviderName::Aws
        }
        fn active(&self) -> bool {
            true
        }
        async fn find_active_account(&self) -> Result<Option<String>> {
            Ok(None)
        }
        async fn list(&self) -> Result<Vec<Vm>> {
            Err(Error::Command {
                program: "aws ec2 describe-instances".into(),
                status: "exit status: 255".into(),
                stderr: "could not connect".into(),
            })
        }
        async fn create(&self, _: &[String], _: &CreateOpts) -> Result<()> {
            Ok(())
        }
        async fn delete(&self, _: &[Vm]) -> Result<()> {
            Ok(())
        }
        async fn reset(&self, _: &[Vm]) -> Result<()> {
            Ok(())
        }
        async fn extend(&self, _: &[Vm], _: Duration) -> Result<()> {
            Ok(())
        }
    }

    fn store(dir: &Path) -> StateStore {
        let config = FleetConfig::with_home(dir);
        StateStore::new(&config, ProviderRegistry::new(Vec::new()))
    }

    #[test]
    fn test_cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        assert_eq!(store.load().unwrap(), Cloud::default());

        let now = Utc::now();
        let mut a = vm("alice-perf-0001", ProviderName::Gce, now);
        a.locality = "cloud=gce,region=us-east1,zone=us-east1-b".into();
        let mut b = vm("alice-perf-0002", ProviderName::Aws, now);
        b.private_ip = None;
        b.public_ip = "198.51.100.7".into();
        let cloud = Cloud::from_vms(vec![a, b, vm("bob-x-0001", ProviderName::Local, now)], now);

        store.persist(&cloud).unwrap();
        let back = store.load().unwrap();
        assert_eq!(back, cloud);
        let names: Vec<_> = back.clusters.keys().cloned().collect();
        assert_eq!(names, vec!["alice-perf", "bob-x"]);
        assert_eq!(back.clusters["alice-perf"].vms[1].public_ip, "198.51.100.7");
        assert_eq!(back.clusters["alice-perf"].vms[1].private_ip, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_lock_is_exclusive_and_removed_on_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("LOCK");

        let first = StateLock::acquire(&path).await.unwrap();
        assert!(path.exists());

        let acquired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let waiter = {
            let path = path.clone();
            let acquired = acquired.clone();
            tokio::spawn(async move {
                let lock = StateLock::acquire(&path).await.unwrap();
                acquired.store(true, std::sync::atomic::Ordering::SeqCst);
                drop(lock);
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!acquired.load(std::sync::atomic::Ordering::SeqCst));

        drop(first);
        waiter.await.unwrap();
        assert!(acquired.load(std::sync::atomic::Ordering::SeqCst));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_update_applies_under_lock() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let now = Utc::now();

        store
            .update(|cloud| {
                *cloud = Cloud::from_vms(vec![vm("local-0001", ProviderName::Local, now)], now);
            })
            .await
            .unwrap();
        assert!(store.load().unwrap().clusters.contains_key("local"));
        assert!(!dir.path().join("LOCK").exists());
    }

    #[tokio::test]
    async fn test_failed_listing_keeps_previous_snapshot_and_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        let config = FleetConfig::with_home(dir.path());
        let store = StateStore::new(
            &config,
            ProviderRegistry::new([Arc::new(Unreachable) as Arc<dyn VmProvider>]),
        );

        let now = Utc::now();
        let previous = Cloud::from_vms(vec![vm("alice-perf-0001", ProviderName::Aws, now)], now);
        store.persist(&previous).unwrap();

        let err = store.synchronize(true).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Provider);
        assert!(err.to_string().contains("could not connect"), "{err}");

        assert_eq!(store.load().unwrap(), previous);
        assert!(!config.lock_path().exists());
        store.lock().await.unwrap();
    }
}
