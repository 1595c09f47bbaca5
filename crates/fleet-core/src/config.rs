use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::parse_lifetime;
use crate::{Error, Result};

/// Default cap on concurrent per-node operations.
pub const DEFAULT_MAX_CONCURRENCY: usize = 32;

/// Settings of the shared DNS zone VM names are published in.
#[derive(Debug, Clone)]
pub struct DnsConfig {
    /// Project hosting the zone, also the provider's "default project".
    pub project: String,
    pub zone: String,
    /// Records are `<vm>.<subdomain>`.
    pub subdomain: String,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            project: "fleet-ephemeral".into(),
            zone: "fleet".into(),
            subdomain: "fleet.internal".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// State directory: lock file, cloud cache, local inventory.
    pub home: PathBuf,
    /// Parent of the local cluster's per-node directories.
    pub local_root: PathBuf,
    pub default_lifetime: Duration,
    pub max_concurrency: usize,
    pub authorized_keys_path: PathBuf,
    pub dns: DnsConfig,
    pub slack_channel: String,
}

impl FleetConfig {
    /// Load from env vars:
    ///
    /// - `FLEET_HOME` (default: `$HOME/.fleet`)
    /// - `FLEET_LOCAL_ROOT` (default: `$HOME/local`)
    /// - `FLEET_DEFAULT_LIFETIME` (default: `12h`)
    /// - `FLEET_MAX_CONCURRENCY` (default: `32`)
    /// - `FLEET_AUTHORIZED_KEYS` (default: `$HOME/.ssh/id_rsa.pub`)
    /// - `FLEET_DNS_PROJECT`, `FLEET_DNS_ZONE`, `FLEET_DNS_SUBDOMAIN`
    /// - `FLEET_SLACK_CHANNEL` (default: `fleet-gc`)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let user_home = env::var_os("HOME")
            .map(PathBuf::from)
            .ok_or_else(|| Error::InvalidInput("HOME is not set".into()))?;

        let home = env::var_os("FLEET_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| user_home.join(".fleet"));
        let local_root = env::var_os("FLEET_LOCAL_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| user_home.join("local"));

        let default_lifetime = match env::var("FLEET_DEFAULT_LIFETIME") {
            Ok(s) => parse_lifetime(&s)?,
            Err(_) => Duration::from_secs(12 * 3600),
        };

        let max_concurrency = match env::var("FLEET_MAX_CONCURRENCY") {
            Ok(s) => s.parse::<usize>().map_err(|_| {
                Error::InvalidInput(format!("FLEET_MAX_CONCURRENCY must be an integer, got {s:?}"))
            })?,
            Err(_) => DEFAULT_MAX_CONCURRENCY,
        };

        let authorized_keys_path = env::var_os("FLEET_AUTHORIZED_KEYS")
            .map(PathBuf::from)
            .unwrap_or_else(|| user_home.join(".ssh").join("id_rsa.pub"));

        let defaults = DnsConfig::default();
        let dns = DnsConfig {
            project: env::var("FLEET_DNS_PROJECT").unwrap_or(defaults.project),
            zone: env::var("FLEET_DNS_ZONE").unwrap_or(defaults.zone),
            subdomain: env::var("FLEET_DNS_SUBDOMAIN").unwrap_or(defaults.subdomain),
        };

        Ok(Self {
            home,
            local_root,
            default_lifetime,
            max_concurrency,
            authorized_keys_path,
            dns,
            slack_channel: env::var("FLEET_SLACK_CHANNEL").unwrap_or_else(|_| "fleet-gc".into()),
        })
    }

    /// Configuration rooted at `home`, with defaults everywhere else.
    pub fn with_home(home: impl AsRef<Path>) -> Self {
        let home = home.as_ref().to_path_buf();
        Self {
            local_root: home.join("local"),
            authorized_keys_path: home.join("authorized_keys"),
            home,
            default_lifetime: Duration::from_secs(12 * 3600),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            dns: DnsConfig::default(),
            slack_channel: "fleet-gc".into(),
        }
    }

    pub fn lock_path(&self) -> PathBuf {
        self.home.join("LOCK")
    }

    pub fn cache_path(&self) -> PathBuf {
        self.home.join("cloud.json")
    }

    pub fn local_inventory_path(&self) -> PathBuf {
        self.home.join("local-cluster.json")
    }

    /// Working directory of local node `node` (1-based).
    pub fn local_node_dir(&self, node: usize) -> PathBuf {
        self.local_root.join(node.to_string())
    }
}
