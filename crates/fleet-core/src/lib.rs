pub mod cluster;
pub mod command;
pub mod config;
pub mod dns;
pub mod fanout;
pub mod gc;
pub mod lifecycle;
pub mod names;
pub mod nodes;
pub mod notify;
pub mod parallel;
pub mod pprof;
pub mod providers;
pub mod remote;
pub mod state;
pub mod types;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use config::FleetConfig;
pub use lifecycle::Fleet;
pub use parallel::{IndexedError, PartialFailure};
pub use types::{Cloud, Cluster, CreateOpts, FileSystem, LOCAL_CLUSTER, Vm};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    NotFound(String),

    #[error("cluster {0} already exists")]
    AlreadyExists(String),

    #[error("lock {}: {source}", .path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{provider}: {source}")]
    Provider {
        provider: ProviderName,
        #[source]
        source: Box<Error>,
    },

    #[error("cluster {cluster}: {source}")]
    Cluster {
        cluster: String,
        #[source]
        source: Box<Error>,
    },

    #[error(transparent)]
    Partial(#[from] PartialFailure),

    #[error(transparent)]
    Combined(#[from] CombinedError),

    #[error("`{program}` failed ({status}): {stderr}")]
    Command {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("cloud dns error: {0}")]
    Dns(#[from] clouddns_api::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`], for callers that branch on the
/// failure rather than render it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    AlreadyExists,
    Lock,
    Provider,
    PartialFailure,
    Combined,
    Transport,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::Lock { .. } => ErrorKind::Lock,
            Self::Provider { .. } => ErrorKind::Provider,
            Self::Cluster { source, .. } => source.kind(),
            Self::Partial(_) => ErrorKind::PartialFailure,
            Self::Combined(_) => ErrorKind::Combined,
            Self::Command { .. }
            | Self::Dns(_)
            | Self::Http(_)
            | Self::Io(_)
            | Self::Json(_) => ErrorKind::Transport,
        }
    }

    /// Attribute a backend failure to the provider that produced it.
    pub fn provider(provider: ProviderName, source: Error) -> Self {
        match source {
            // Already attributed (e.g. nested fan-out).
            Self::Provider { .. } => source,
            other => Self::Provider {
                provider,
                source: Box::new(other),
            },
        }
    }

    /// Attribute a failure to the cluster it happened on.
    pub fn cluster(cluster: impl Into<String>, source: Error) -> Self {
        Self::Cluster {
            cluster: cluster.into(),
            source: Box::new(source),
        }
    }

    /// The underlying error, with any provider or cluster attribution
    /// removed.
    pub fn root(&self) -> &Error {
        match self {
            Self::Provider { source, .. } | Self::Cluster { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether a create collided with an existing cluster, directly or
    /// through a provider.
    pub fn is_already_exists(&self) -> bool {
        self.root().kind() == ErrorKind::AlreadyExists
    }

    /// Fold independent failures into one error. `None` when nothing failed.
    pub fn combine(errors: impl IntoIterator<Item = Error>) -> Option<Error> {
        let mut errors: Vec<Error> = errors.into_iter().collect();
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Error::Combined(CombinedError { errors })),
        }
    }
}

/// Several independent failures reported together.
#[derive(Debug)]
pub struct CombinedError {
    pub errors: Vec<Error>,
}

impl fmt::Display for CombinedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors occurred:", self.errors.len())?;
        for err in &self.errors {
            write!(f, "\n  * {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CombinedError {}

/// Known VM provider backends.
///
/// The declaration order is the fixed order used by sequential provider
/// passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderName {
    Aws,
    Azure,
    Gce,
    Local,
}

impl ProviderName {
    pub const ALL: [ProviderName; 4] = [Self::Aws, Self::Azure, Self::Gce, Self::Local];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aws => "aws",
            Self::Azure => "azure",
            Self::Gce => "gce",
            Self::Local => "local",
        }
    }
}

impl fmt::Display for ProviderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "aws" => Ok(Self::Aws),
            "azure" => Ok(Self::Azure),
            "gce" => Ok(Self::Gce),
            "local" => Ok(Self::Local),
            other => Err(Error::InvalidInput(format!("unknown provider: {other}"))),
        }
    }
}

/// Backend-agnostic interface for managing test-cluster VMs.
///
/// Each provider (AWS, Azure, GCE, local) implements this trait and owns its
/// own configuration, loaded from environment variables at construction.
#[async_trait]
pub trait VmProvider: Send + Sync + 'static {
    /// Provider identifier.
    fn name(&self) -> ProviderName;

    /// Whether credentials/tooling for this backend are present.
    fn active(&self) -> bool;

    /// The account the backend's credentials belong to, if it has one.
    async fn find_active_account(&self) -> Result<Option<String>>;

    /// Every VM this tool manages in the backend.
    async fn list(&self) -> Result<Vec<Vm>>;

    /// Create one VM per name.
    async fn create(&self, names: &[String], opts: &CreateOpts) -> Result<()>;

    /// Destroy the given VMs permanently.
    async fn delete(&self, vms: &[Vm]) -> Result<()>;

    /// Power-cycle the given VMs.
    async fn reset(&self, vms: &[Vm]) -> Result<()>;

    /// Push the VMs' expiry out to `lifetime` after creation.
    async fn extend(&self, vms: &[Vm], lifetime: Duration) -> Result<()>;

    /// Remove SSH client configuration this backend wrote previously.
    async fn clean_ssh(&self) -> Result<()> {
        Ok(())
    }

    /// Write SSH client configuration for the backend's VMs.
    async fn config_ssh(&self) -> Result<()> {
        Ok(())
    }

    /// Whether VMs of this backend are published in the shared DNS zone.
    fn dns_capable(&self) -> bool {
        false
    }

    /// Whether this backend hosts the shared DNS zone.
    fn owns_default_dns_zone(&self) -> bool {
        false
    }

    /// Whether this backend's account covers the default project or
    /// subscription, so its listing is complete.
    fn covers_default_project(&self) -> bool {
        false
    }

    /// Republish address records for `vms`. Only the zone owner supports this.
    async fn sync_dns(&self, _vms: &[Vm]) -> Result<()> {
        Err(Error::InvalidInput(format!(
            "{} does not host the DNS zone",
            self.name()
        )))
    }

    /// Remove SSH key pairs no VM references. Returns the affected key names.
    async fn gc_key_pairs(&self, _dry_run: bool) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn supports_filesystem(&self, fs: FileSystem) -> bool {
        fs == FileSystem::Ext4
    }
}

/// Registry of all known VM providers, built once at start-up and passed
/// explicitly to every component that needs it.
#[derive(Clone)]
pub struct ProviderRegistry {
    providers: BTreeMap<ProviderName, Arc<dyn VmProvider>>,
}

impl ProviderRegistry {
    pub fn new(providers: impl IntoIterator<Item = Arc<dyn VmProvider>>) -> Self {
        Self {
            providers: providers.into_iter().map(|p| (p.name(), p)).collect(),
        }
    }

    /// Look up a provider by name.
    pub fn get(&self, name: ProviderName) -> Option<&Arc<dyn VmProvider>> {
        self.providers.get(&name)
    }

    /// Look up a provider that an operation requires.
    pub fn require(&self, name: ProviderName) -> Result<&Arc<dyn VmProvider>> {
        self.get(name)
            .ok_or_else(|| Error::InvalidInput(format!("provider not registered: {name}")))
    }

    /// Names of every registered provider, in their fixed order.
    pub fn all_provider_names(&self) -> Vec<ProviderName> {
        self.providers.keys().copied().collect()
    }

    /// Every registered provider, active or not.
    pub fn all(&self) -> impl Iterator<Item = &Arc<dyn VmProvider>> {
        self.providers.values()
    }

    /// Providers whose credentials are present.
    pub fn active(&self) -> impl Iterator<Item = &Arc<dyn VmProvider>> {
        self.providers.values().filter(|p| p.active())
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Build every provider. Backends without tooling are registered inactive.
pub fn build_providers(config: &FleetConfig) -> ProviderRegistry {
    dotenvy::dotenv().ok();

    let mut providers: Vec<Arc<dyn VmProvider>> = Vec::new();

    let aws = providers::aws::AwsProvider::from_env();
    log_registration(ProviderName::Aws, aws.active());
    providers.push(Arc::new(aws));

    let azure = providers::azure::AzureProvider::from_env();
    log_registration(ProviderName::Azure, azure.active());
    providers.push(Arc::new(azure));

    let gce = providers::gce::GceProvider::from_env(&config.dns);
    log_registration(ProviderName::Gce, gce.active());
    providers.push(Arc::new(gce));

    let local = providers::local::LocalProvider::new(config.local_inventory_path());
    log_registration(ProviderName::Local, true);
    providers.push(Arc::new(local));

    ProviderRegistry::new(providers)
}

fn log_registration(name: ProviderName, active: bool) {
    if active {
        tracing::info!(provider = %name, "registered VM provider");
    } else {
        tracing::debug!(provider = %name, "registered inactive VM provider");
    }
}
