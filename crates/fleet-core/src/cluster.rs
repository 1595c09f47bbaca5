//! A cluster selected for node operations.

use std::path::{Path, PathBuf};

use crate::names::list_nodes;
use crate::remote::NodeTarget;
use crate::{Cluster, Error, Result, Vm};

/// SQL port of remote nodes; local nodes count up from here.
pub const BASE_PORT: u16 = 26257;

/// Options for operating on an existing cluster.
#[derive(Debug, Clone)]
pub struct ClusterOpts {
    /// `name` or `name:nodes`, e.g. `alice-perf:1-3`.
    pub name: String,
    pub secure: bool,
    pub certs_dir: PathBuf,
    /// `KEY=value` pairs exported before starting nodes.
    pub env: Vec<String>,
    /// Extra arguments passed to the node binary on start.
    pub args: Vec<String>,
    pub tag: String,
    /// Path of the node binary on each host.
    pub binary: String,
    pub num_racks: usize,
    pub max_concurrency: usize,
    pub quiet: bool,
}

impl Default for ClusterOpts {
    fn default() -> Self {
        Self {
            name: String::new(),
            secure: false,
            certs_dir: PathBuf::from("./certs"),
            env: Vec::new(),
            args: Vec::new(),
            tag: String::new(),
            binary: "./cockroach".into(),
            num_racks: 0,
            max_concurrency: crate::config::DEFAULT_MAX_CONCURRENCY,
            quiet: false,
        }
    }
}

impl ClusterOpts {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Split `name[:nodes]`.
pub fn split_selector(selector: &str) -> Result<(&str, &str)> {
    let mut parts = selector.split(':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(""), _, _) | (None, _, _) => Err(Error::InvalidInput("no cluster specified".into())),
        (Some(name), None, _) => Ok((name, "all")),
        (Some(name), Some(nodes), None) => Ok((name, nodes)),
        _ => Err(Error::InvalidInput(format!("invalid cluster name: {selector}"))),
    }
}

/// A cluster snapshot plus the selected nodes and per-node settings.
#[derive(Debug, Clone)]
pub struct SyncedCluster {
    pub cluster: Cluster,
    /// Selected 1-based node numbers, sorted.
    pub nodes: Vec<usize>,
    pub opts: ClusterOpts,
    /// Locality of every node, index `i` for node `i + 1`.
    pub localities: Vec<String>,
    local_root: PathBuf,
}

impl SyncedCluster {
    /// Select `nodes` of `cluster`. Rack labels are appended to the
    /// localities when `opts.num_racks` is set.
    pub fn new(cluster: Cluster, nodes: &str, opts: ClusterOpts, local_root: &Path) -> Result<Self> {
        let nodes = list_nodes(nodes, cluster.vms.len())?;
        let mut localities: Vec<String> = cluster.vms.iter().map(|v| v.locality.clone()).collect();
        if opts.num_racks > 0 {
            for (i, locality) in localities.iter_mut().enumerate() {
                if !locality.is_empty() {
                    locality.push(',');
                }
                locality.push_str(&format!("rack={}", i % opts.num_racks));
            }
        }
        Ok(Self {
            cluster,
            nodes,
            opts,
            localities,
            local_root: local_root.to_path_buf(),
        })
    }

    pub fn name(&self) -> &str {
        &self.cluster.name
    }

    pub fn is_local(&self) -> bool {
        self.cluster.is_local()
    }

    /// The VM behind 1-based `node`.
    pub fn vm(&self, node: usize) -> Result<&Vm> {
        node.checked_sub(1)
            .and_then(|i| self.cluster.vms.get(i))
            .ok_or_else(|| {
                Error::InvalidInput(format!(
                    "node {node} is out of range, {} has {} nodes",
                    self.cluster.name,
                    self.cluster.vms.len()
                ))
            })
    }

    pub fn node_port(&self, node: usize) -> u16 {
        if self.is_local() {
            let offset = u16::try_from(2 * node.saturating_sub(1)).unwrap_or(u16::MAX - BASE_PORT);
            BASE_PORT.saturating_add(offset)
        } else {
            BASE_PORT
        }
    }

    pub fn admin_port(&self, node: usize) -> u16 {
        self.node_port(node).saturating_add(1)
    }

    /// Data directory of `node` on its host.
    pub fn node_dir(&self, node: usize) -> PathBuf {
        if self.is_local() {
            self.local_root.join(node.to_string()).join("data")
        } else {
            PathBuf::from("/mnt/data1/cockroach")
        }
    }

    /// Where commands for `node` are sent.
    pub fn target(&self, node: usize) -> Result<NodeTarget> {
        let vm = self.vm(node)?;
        Ok(NodeTarget {
            cluster: self.cluster.name.clone(),
            node,
            host: vm.public_ip.clone(),
            user: vm.remote_user.clone(),
            local_dir: self
                .is_local()
                .then(|| self.local_root.join(node.to_string())),
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::types::tests::vm;
    use crate::{Cloud, ProviderName};

    fn cluster(name: &str, n: usize, provider: ProviderName) -> Cluster {
        let now = Utc::now();
        let vms = (1..=n)
            .map(|i| vm(&crate::types::vm_name(name, i), provider, now))
            .collect();
        Cloud::from_vms(vms, now).clusters.remove(name).unwrap()
    }

    #[test]
    fn test_split_selector() {
        assert_eq!(split_selector("alice-x").unwrap(), ("alice-x", "all"));
        assert_eq!(split_selector("alice-x:1-2").unwrap(), ("alice-x", "1-2"));
        assert!(split_selector("").is_err());
        assert!(split_selector("a:1:2").is_err());
    }

    #[test]
    fn test_racks_are_appended_to_localities() {
        let opts = ClusterOpts {
            num_racks: 2,
            ..Default::default()
        };
        let c = SyncedCluster::new(cluster("alice-x", 3, ProviderName::Gce), "all", opts, Path::new("/tmp")).unwrap();
        assert_eq!(c.localities, vec!["zone=a,rack=0", "zone=a,rack=1", "zone=a,rack=0"]);
    }

    #[test]
    fn test_ports_and_dirs() {
        let local = SyncedCluster::new(
            cluster("local", 3, ProviderName::Local),
            "2-3",
            ClusterOpts::default(),
            Path::new("/home/me/local"),
        )
        .unwrap();
        assert_eq!(local.nodes, vec![2, 3]);
        assert_eq!(local.node_port(1), 26257);
        assert_eq!(local.node_port(3), 26261);
        assert_eq!(local.admin_port(3), 26262);
        assert_eq!(local.node_dir(2), Path::new("/home/me/local/2/data"));
        assert_eq!(local.target(2).unwrap().local_dir.unwrap(), Path::new("/home/me/local/2"));

        let remote = SyncedCluster::new(
            cluster("alice-x", 2, ProviderName::Aws),
            "all",
            ClusterOpts::default(),
            Path::new("/unused"),
        )
        .unwrap();
        assert_eq!(remote.node_port(2), 26257);
        assert!(remote.target(2).unwrap().local_dir.is_none());
        assert!(remote.vm(3).is_err());
        assert!(remote.vm(0).is_err());
    }

    #[test]
    fn test_out_of_range_selection() {
        let err = SyncedCluster::new(
            cluster("alice-x", 2, ProviderName::Gce),
            "3",
            ClusterOpts::default(),
            Path::new("/tmp"),
        )
        .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidInput);
    }
}
