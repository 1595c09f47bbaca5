//! Classification of clusters by remaining lifetime.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};

use crate::{Cloud, Cluster};

/// Clusters expiring within this window are called out in the report.
pub const WARN_WINDOW: std::time::Duration = std::time::Duration::from_secs(2 * 3600);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSummary {
    pub name: String,
    pub user: String,
    pub nodes: usize,
    pub expires_at: DateTime<Utc>,
}

impl ClusterSummary {
    fn of(cluster: &Cluster) -> Self {
        Self {
            name: cluster.name.clone(),
            user: cluster.user.clone(),
            nodes: cluster.vms.len(),
            expires_at: cluster.expires_at(),
        }
    }
}

/// Outcome of one garbage-collection pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Expired; destroyed unless the pass is a dry run.
    pub destroy: Vec<ClusterSummary>,
    /// Names of expired clusters whose destroy failed.
    pub failed: Vec<String>,
    /// Expiring within [`WARN_WINDOW`].
    pub warn: Vec<ClusterSummary>,
    pub good: Vec<ClusterSummary>,
    /// Names of VMs that can't be attributed to a healthy cluster.
    pub bad_instances: Vec<String>,
    /// Key pairs no VM references, removed unless the pass is a dry run.
    pub key_pairs: Vec<String>,
    pub dry_run: bool,
}

/// Sort every remote cluster of `cloud` into destroy, warn or good.
///
/// The local cluster is never collected.
pub fn classify(cloud: &Cloud, now: DateTime<Utc>, dry_run: bool) -> GcReport {
    let window = chrono::Duration::from_std(WARN_WINDOW).unwrap_or_else(|_| chrono::Duration::zero());
    let mut report = GcReport {
        dry_run,
        ..Default::default()
    };
    for cluster in cloud.clusters.values().filter(|c| !c.is_local()) {
        let summary = ClusterSummary::of(cluster);
        if cluster.is_expired(now) {
            report.destroy.push(summary);
        } else if summary.expires_at - now <= window {
            report.warn.push(summary);
        } else {
            report.good.push(summary);
        }
    }
    report.bad_instances = cloud.bad_instances.iter().map(|v| v.name.clone()).collect();
    report
}

impl GcReport {
    /// Whether the report has anything worth telling anyone about.
    pub fn is_noteworthy(&self) -> bool {
        !self.destroy.is_empty() || !self.warn.is_empty() || !self.bad_instances.is_empty()
    }

    /// Plain-text rendering, suitable for a chat message.
    pub fn summary(&self, now: DateTime<Utc>) -> String {
        let mut out = String::new();
        let verb = if self.dry_run { "would destroy" } else { "destroyed" };
        let (failed, destroyed): (Vec<ClusterSummary>, Vec<ClusterSummary>) = self
            .destroy
            .iter()
            .cloned()
            .partition(|c| self.failed.contains(&c.name));
        let expired = |c: &ClusterSummary| {
            format!("{} ({} nodes, expired {}m ago)", c.name, c.nodes, (now - c.expires_at).num_minutes())
        };

        section(&mut out, &format!("{verb} {} expired clusters", destroyed.len()), &destroyed, &expired);
        section(
            &mut out,
            &format!("failed to destroy {} expired clusters", failed.len()),
            &failed,
            &expired,
        );
        section(&mut out, &format!("{} clusters expiring soon", self.warn.len()), &self.warn, |c| {
            format!("{} ({} nodes, {}m left)", c.name, c.nodes, (c.expires_at - now).num_minutes())
        });
        if !self.bad_instances.is_empty() {
            let _ = writeln!(out, "{} bad instances:", self.bad_instances.len());
            for name in &self.bad_instances {
                let _ = writeln!(out, "  {name}");
            }
        }
        if !self.key_pairs.is_empty() {
            let verb = if self.dry_run { "would remove" } else { "removed" };
            let _ = writeln!(out, "{verb} {} unused key pairs", self.key_pairs.len());
        }
        let _ = write!(out, "{} clusters healthy", self.good.len());
        out
    }
}

fn section(
    out: &mut String,
    heading: &str,
    clusters: &[ClusterSummary],
    line: impl Fn(&ClusterSummary) -> String,
) {
    if clusters.is_empty() {
        return;
    }
    let _ = writeln!(out, "{heading}:");
    for c in clusters {
        let _ = writeln!(out, "  {} [{}]", line(c), c.user);
    }
}
