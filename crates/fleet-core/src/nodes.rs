//! Operations on the selected nodes of a cluster.
//!
//! Every operation fans out over the selection through the parallel
//! executor; failures are reported per node number.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::cluster::SyncedCluster;
use crate::parallel::{self, PartialFailure, UnitError};
use crate::remote::{NodeRunner, shell_quote};
use crate::{Error, Result};

/// Output of one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeOutput {
    pub node: usize,
    pub output: String,
}

/// Run `f(node)` for every selected node, bounded by the cluster's
/// concurrency cap.
pub async fn for_each_node<F, Fut>(c: &SyncedCluster, description: &str, f: F) -> Result<Vec<NodeOutput>>
where
    F: Fn(usize) -> Fut,
    Fut: Future<Output = std::result::Result<Vec<u8>, UnitError>>,
{
    let nodes = &c.nodes;
    let outputs = parallel::run(description, nodes.len(), c.opts.max_concurrency, |i| f(nodes[i]))
        .await
        .map_err(|mut e: PartialFailure| {
            for failure in &mut e.failures {
                failure.index = nodes[failure.index];
            }
            Error::Partial(e)
        })?;
    Ok(nodes
        .iter()
        .zip(outputs)
        .map(|(&node, out)| NodeOutput {
            node,
            output: String::from_utf8_lossy(&out).into_owned(),
        })
        .collect())
}

async fn run_script(
    runner: &dyn NodeRunner,
    c: &SyncedCluster,
    node: usize,
    script: &str,
) -> std::result::Result<Vec<u8>, UnitError> {
    let target = c.target(node)?;
    runner.run(&target, script).await
}

/// Run `cmd` on every selected node.
pub async fn run(runner: &dyn NodeRunner, c: &SyncedCluster, cmd: &str) -> Result<Vec<NodeOutput>> {
    if cmd.trim().is_empty() {
        return Err(Error::InvalidInput("no command given".into()));
    }
    for_each_node(c, &format!("run {cmd}"), |node| run_script(runner, c, node, cmd)).await
}

fn pid_file(c: &SyncedCluster, node: usize) -> String {
    format!("{}/pid", c.node_dir(node).display())
}

/// Whether the node process is alive, e.g. `running pid=1234`.
pub async fn status(runner: &dyn NodeRunner, c: &SyncedCluster) -> Result<Vec<NodeOutput>> {
    let outputs = for_each_node(c, "status", |node| {
        let pid = pid_file(c, node);
        let script = format!(
            "if [ -f {pid} ] && kill -0 \"$(cat {pid})\" 2>/dev/null; then echo \"running pid=$(cat {pid})\"; else echo 'not running'; fi",
            pid = shell_quote(&pid)
        );
        async move { run_script(runner, c, node, &script).await }
    })
    .await?;
    Ok(outputs
        .into_iter()
        .map(|o| NodeOutput {
            node: o.node,
            output: o.output.trim().to_string(),
        })
        .collect())
}

/// One-shot health check: every selected node not running is an error.
pub async fn monitor(runner: &dyn NodeRunner, c: &SyncedCluster) -> Result<Vec<NodeOutput>> {
    let statuses = status(runner, c).await?;
    let dead: Vec<Error> = statuses
        .iter()
        .filter(|s| !s.output.starts_with("running"))
        .map(|s| Error::NotFound(format!("{}: node {} is dead", c.name(), s.node)))
        .collect();
    match Error::combine(dead) {
        Some(err) => Err(err),
        None => Ok(statuses),
    }
}

/// Placeholders available to start arguments.
fn expand_placeholders(template: &str, c: &SyncedCluster, node: usize, join: &str) -> String {
    template
        .replace("{node}", &node.to_string())
        .replace("{port}", &c.node_port(node).to_string())
        .replace("{admin_port}", &c.admin_port(node).to_string())
        .replace("{dir}", &c.node_dir(node).display().to_string())
        .replace("{locality}", c.localities.get(node - 1).map_or("", String::as_str))
        .replace("{join}", join)
}

/// Start script for one node.
pub fn start_script(c: &SyncedCluster, node: usize, join: &str) -> String {
    let dir = c.node_dir(node).display().to_string();
    let mut args = vec![
        format!("--store={dir}"),
        format!("--listen-addr=:{}", c.node_port(node)),
        format!("--http-addr=:{}", c.admin_port(node)),
        format!("--join={join}"),
    ];
    if c.opts.secure {
        args.push(format!("--certs-dir={}", c.opts.certs_dir.display()));
    } else {
        args.push("--insecure".into());
    }
    if let Some(locality) = c.localities.get(node - 1).filter(|l| !l.is_empty()) {
        args.push(format!("--locality={locality}"));
    }
    args.extend(c.opts.args.iter().map(|a| expand_placeholders(a, c, node, join)));

    let env: Vec<String> = c.opts.env.iter().map(|e| shell_quote(e)).collect();
    let env = if env.is_empty() {
        String::new()
    } else {
        format!("export {}; ", env.join(" "))
    };
    let quoted: Vec<String> = args.iter().map(|a| shell_quote(a)).collect();

    format!(
        "mkdir -p {dir} && {env}nohup {binary} start {args} > {log} 2>&1 < /dev/null & echo $! > {pid}",
        dir = shell_quote(&dir),
        binary = c.opts.binary,
        args = quoted.join(" "),
        log = shell_quote(&format!("{dir}/node.log")),
        pid = shell_quote(&pid_file(c, node)),
    )
}

/// Start the node process on every selected node, joined to node 1.
pub async fn start(runner: &dyn NodeRunner, c: &SyncedCluster) -> Result<()> {
    let first = c.vm(1)?;
    let join = format!("{}:{}", first.private_ip.as_deref().unwrap_or(&first.public_ip), c.node_port(1));
    for_each_node(c, "start", |node| {
        let script = start_script(c, node, &join);
        async move { run_script(runner, c, node, &script).await }
    })
    .await?;
    info!(cluster = %c.name(), nodes = c.nodes.len(), "nodes started");
    Ok(())
}

/// Signal the node process and optionally wait for it to exit.
pub async fn stop(runner: &dyn NodeRunner, c: &SyncedCluster, signal: i32, wait: bool) -> Result<()> {
    for_each_node(c, "stop", |node| {
        let pid = shell_quote(&pid_file(c, node));
        let wait_loop = if wait {
            "while kill -0 \"$p\" 2>/dev/null; do sleep 1; done; "
        } else {
            ""
        };
        let script = format!(
            "if [ -f {pid} ]; then p=\"$(cat {pid})\"; kill -{signal} \"$p\" 2>/dev/null; {wait_loop}rm -f {pid}; fi"
        );
        async move { run_script(runner, c, node, &script).await }
    })
    .await?;
    debug!(cluster = %c.name(), signal, "nodes stopped");
    Ok(())
}

/// Delay between reachability probes in [`wait`].
const WAIT_INTERVAL: Duration = Duration::from_secs(1);

/// Probe every selected node until it accepts commands. A node still
/// unreachable after `timeout` is reported with its last error.
pub async fn wait(runner: &dyn NodeRunner, c: &SyncedCluster, timeout: Duration) -> Result<()> {
    for_each_node(c, "waiting for nodes", |node| async move {
        let deadline = Instant::now() + timeout;
        loop {
            match run_script(runner, c, node, "true").await {
                Ok(_) => return Ok(Vec::new()),
                Err(e) if Instant::now() >= deadline => return Err(e),
                Err(e) => {
                    debug!(cluster = %c.name(), node, error = %e.error, "node not reachable yet");
                    tokio::time::sleep(WAIT_INTERVAL).await;
                }
            }
        }
    })
    .await?;
    debug!(cluster = %c.name(), "all nodes reachable");
    Ok(())
}

/// Append every key of `keys` missing from the remote user's
/// `authorized_keys`.
pub async fn authorize_keys(runner: &dyn NodeRunner, c: &SyncedCluster, keys: &str) -> Result<()> {
    let keys: Vec<&str> = keys.lines().map(str::trim).filter(|k| !k.is_empty()).collect();
    if keys.is_empty() {
        return Ok(());
    }
    let quoted: Vec<String> = keys.iter().map(|k| shell_quote(k)).collect();
    let script = format!(
        "mkdir -p ~/.ssh && chmod 700 ~/.ssh && touch ~/.ssh/authorized_keys && \
         for k in {}; do grep -qxF \"$k\" ~/.ssh/authorized_keys || echo \"$k\" >> ~/.ssh/authorized_keys; done && \
         chmod 600 ~/.ssh/authorized_keys",
        quoted.join(" ")
    );
    for_each_node(c, "authorizing keys", |node| {
        let script = &script;
        async move { run_script(runner, c, node, script).await }
    })
    .await?;
    info!(cluster = %c.name(), keys = keys.len(), "authorized keys propagated");
    Ok(())
}

/// Kill the node process and delete its data, keeping `certs` if asked.
pub async fn wipe(runner: &dyn NodeRunner, c: &SyncedCluster, preserve_certs: bool) -> Result<()> {
    stop(runner, c, 9, true).await?;
    for_each_node(c, "wipe", |node| {
        let dir = shell_quote(&c.node_dir(node).display().to_string());
        let script = if preserve_certs {
            format!("[ -d {dir} ] && find {dir} -mindepth 1 -maxdepth 1 ! -name certs -exec rm -rf {{}} +; true")
        } else {
            format!("rm -rf {dir}")
        };
        async move { run_script(runner, c, node, &script).await }
    })
    .await?;
    info!(cluster = %c.name(), "nodes wiped");
    Ok(())
}

/// Address of every selected node. Internal addresses the provider didn't
/// report are looked up on the node.
pub async fn ip(runner: &dyn NodeRunner, c: &SyncedCluster, external: bool) -> Result<Vec<NodeOutput>> {
    for_each_node(c, "ip", |node| async move {
        let vm = c.vm(node)?;
        if external {
            return Ok(vm.public_ip.clone().into_bytes());
        }
        if let Some(private) = &vm.private_ip {
            return Ok(private.clone().into_bytes());
        }
        let out = run_script(runner, c, node, "hostname -I | awk '{print $1}'").await?;
        let addr = String::from_utf8_lossy(&out).trim().to_string();
        if addr.is_empty() {
            return Err(Error::NotFound(format!("no internal address for node {node}")).into());
        }
        Ok(addr.into_bytes())
    })
    .await
}

/// Connection URL of every selected node.
pub async fn pg_url(runner: &dyn NodeRunner, c: &SyncedCluster, external: bool) -> Result<Vec<NodeOutput>> {
    let ips = ip(runner, c, external).await?;
    Ok(ips
        .into_iter()
        .map(|o| {
            let mut url = format!("postgresql://root@{}:{}?sslmode=", o.output, c.node_port(o.node));
            if c.opts.secure {
                let certs = c.opts.certs_dir.display();
                url.push_str(&format!(
                    "verify-full&sslrootcert={certs}/ca.crt&sslcert={certs}/client.root.crt&sslkey={certs}/client.root.key"
                ));
            } else {
                url.push_str("disable");
            }
            NodeOutput {
                node: o.node,
                output: url,
            }
        })
        .collect())
}

/// Admin UI URL of every selected node, with `path` appended.
pub async fn admin_url(
    runner: &dyn NodeRunner,
    c: &SyncedCluster,
    path: &str,
    external: bool,
) -> Result<Vec<NodeOutput>> {
    let scheme = if c.opts.secure { "https" } else { "http" };
    let path = if path.is_empty() || path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    let ips = ip(runner, c, external).await?;
    Ok(ips
        .into_iter()
        .map(|o| NodeOutput {
            node: o.node,
            output: format!("{scheme}://{}:{}{path}", o.output, c.admin_port(o.node)),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;
    use crate::cluster::ClusterOpts;
    use crate::remote::NodeTarget;
    use crate::types::tests::vm;
    use crate::{Cloud, ProviderName};

    /// Answers scripts from a fixed table; nodes listed in `down` fail.
    struct ScriptedRunner {
        down: Vec<usize>,
        reply: &'static str,
        seen: Mutex<Vec<(usize, String)>>,
    }

    #[async_trait]
    impl NodeRunner for ScriptedRunner {
        async fn run(&self, target: &NodeTarget, script: &str) -> std::result::Result<Vec<u8>, UnitError> {
            self.seen.lock().unwrap().push((target.node, script.to_string()));
            if self.down.contains(&target.node) {
                return Err(UnitError {
                    error: Error::InvalidInput("connection refused".into()),
                    output: b"ssh: connect".to_vec(),
                });
            }
            Ok(self.reply.as_bytes().to_vec())
        }

        async fn clear_host_key(&self, _host: &str) -> Result<()> {
            Ok(())
        }
    }

    fn runner(down: &[usize], reply: &'static str) -> ScriptedRunner {
        ScriptedRunner {
            down: down.to_vec(),
            reply,
            seen: Mutex::new(Vec::new()),
        }
    }

    fn synced(n: usize, nodes: &str, opts: ClusterOpts) -> SyncedCluster {
        let now = Utc::now();
        let mut vms: Vec<_> = (1..=n)
            .map(|i| vm(&crate::types::vm_name("alice-x", i), ProviderName::Gce, now))
            .collect();
        vms[1].private_ip = None;
        let cluster = Cloud::from_vms(vms, now).clusters.remove("alice-x").unwrap();
        SyncedCluster::new(cluster, nodes, opts, Path::new("/tmp")).unwrap()
    }

    #[tokio::test]
    async fn test_failures_are_reported_by_node_number() {
        let c = synced(4, "2-4", ClusterOpts::default());
        let r = runner(&[3], "ok");
        let err = run(&r, &c, "true").await.unwrap_err();
        let Error::Partial(p) = err else {
            panic!("expected partial failure");
        };
        assert_eq!(p.total, 3);
        assert_eq!(p.failures.len(), 1);
        assert_eq!(p.failures[0].index, 3);
        assert_eq!(r.seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_monitor_combines_dead_nodes() {
        let c = synced(3, "all", ClusterOpts::default());
        let err = monitor(&runner(&[], "not running"), &c).await.unwrap_err();
        match err {
            Error::Combined(e) => assert_eq!(e.errors.len(), 3),
            other => panic!("unexpected {other:?}"),
        }
        let ok = monitor(&runner(&[], "running pid=7\n"), &c).await.unwrap();
        assert_eq!(ok[0].output, "running pid=7");
    }

    #[tokio::test]
    async fn test_internal_ip_is_resolved_lazily() {
        let c = synced(2, "all", ClusterOpts::default());
        let r = runner(&[], "10.9.9.9\n");
        let ips = ip(&r, &c, false).await.unwrap();
        assert_eq!(ips[0].output, "10.0.0.10");
        assert_eq!(ips[1].output, "10.9.9.9");
        let seen = r.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, 2);
    }

    #[tokio::test]
    async fn test_urls() {
        let c = synced(1, "all", ClusterOpts::default());
        let r = runner(&[], "");
        let pg = pg_url(&r, &c, true).await.unwrap();
        assert_eq!(pg[0].output, "postgresql://root@203.0.113.10:26257?sslmode=disable");
        let admin = admin_url(&r, &c, "debug/pprof", true).await.unwrap();
        assert_eq!(admin[0].output, "http://203.0.113.10:26258/debug/pprof");
    }

    /// Fails the first `failures` calls, then succeeds.
    struct FlakyRunner {
        failures: Mutex<usize>,
    }

    #[async_trait]
    impl NodeRunner for FlakyRunner {
        async fn run(&self, _target: &NodeTarget, _script: &str) -> std::result::Result<Vec<u8>, UnitError> {
            let mut left = self.failures.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(Error::InvalidInput("connection refused".into()).into());
            }
            Ok(Vec::new())
        }

        async fn clear_host_key(&self, _host: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_wait_retries_until_reachable() {
        let c = synced(1, "all", ClusterOpts::default());
        let r = FlakyRunner {
            failures: Mutex::new(1),
        };
        wait(&r, &c, Duration::from_secs(60)).await.unwrap();
        assert_eq!(*r.failures.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_wait_gives_up_after_timeout() {
        let c = synced(2, "all", ClusterOpts::default());
        let err = wait(&runner(&[2], ""), &c, Duration::ZERO).await.unwrap_err();
        let Error::Partial(p) = err else {
            panic!("expected partial failure");
        };
        assert_eq!(p.failures.len(), 1);
        assert_eq!(p.failures[0].index, 2);
    }

    #[tokio::test]
    async fn test_authorize_keys_quotes_each_key() {
        let c = synced(2, "all", ClusterOpts::default());
        let r = runner(&[], "");
        authorize_keys(&r, &c, "ssh-ed25519 AAAA alice@host\n\nssh-rsa BBBB bob\n")
            .await
            .unwrap();
        {
            let seen = r.seen.lock().unwrap();
            assert_eq!(seen.len(), 2);
            assert!(seen[0].1.contains("'ssh-ed25519 AAAA alice@host' 'ssh-rsa BBBB bob'"));
        }

        authorize_keys(&r, &c, "\n").await.unwrap();
        assert_eq!(r.seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_start_script_expands_args() {
        let opts = ClusterOpts {
            args: vec!["--cache={node}GiB".into()],
            env: vec!["FOO=bar baz".into()],
            ..Default::default()
        };
        let c = synced(2, "all", opts);
        let script = start_script(&c, 2, "10.0.0.10:26257");
        assert!(script.contains("'--cache=2GiB'"));
        assert!(script.contains("'--join=10.0.0.10:26257'"));
        assert!(script.contains("'--insecure'"));
        assert!(script.starts_with("mkdir -p '/mnt/data1/cockroach' && export 'FOO=bar baz'; nohup ./cockroach start"));
    }
}
