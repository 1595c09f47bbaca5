use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use fleet_core::cluster::ClusterOpts;
use fleet_core::nodes::{self, NodeOutput};
use fleet_core::pprof::{self, PprofOpts, ProfileKind};
use fleet_core::types::{SsdOpts, parse_lifetime};
use fleet_core::{Cloud, CreateOpts, ErrorKind, FileSystem, Fleet, ProviderName};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fleetctl")]
#[command(about = "Create, operate and garbage-collect ephemeral test clusters")]
struct Cli {
    /// Lower progress messages to debug level.
    #[arg(long, short, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Provision a new cluster.
    Create {
        cluster: String,

        #[arg(long, short, default_value_t = 4)]
        nodes: usize,

        /// How long the cluster lives before gc destroys it, e.g. `12h`.
        #[arg(long, short, value_parser = lifetime)]
        lifetime: Option<Duration>,

        /// Providers to spread nodes over, round-robin.
        #[arg(long, value_delimiter = ',', default_value = "gce")]
        providers: Vec<ProviderName>,

        #[arg(long)]
        machine_type: Option<String>,

        #[arg(long, value_delimiter = ',')]
        zones: Vec<String>,

        #[arg(long)]
        local_ssd: bool,

        #[arg(long, default_value = "ext4")]
        filesystem: FileSystem,

        /// Owner prefix to validate the name against instead of the
        /// providers' accounts.
        #[arg(long)]
        username: Option<String>,
    },
    /// Destroy clusters.
    Destroy {
        clusters: Vec<String>,

        /// Destroy every cluster owned by the current accounts.
        #[arg(long)]
        all_mine: bool,

        #[arg(long)]
        username: Option<String>,
    },
    /// Refresh the local cache from every provider.
    Sync,
    /// List clusters, optionally filtered by a regex.
    List {
        pattern: Option<String>,

        #[arg(long)]
        mine: bool,

        /// Print every VM of every cluster.
        #[arg(long, short)]
        details: bool,
    },
    /// Cluster names from the cache, for shell completion.
    CachedHosts {
        #[arg(long, default_value = "")]
        cluster: String,
    },
    /// Whether the node process runs on each node.
    Status(ClusterArgs),
    /// Fail if any node process is dead.
    Monitor(ClusterArgs),
    /// Run a command on each node.
    Run {
        #[command(flatten)]
        target: ClusterArgs,

        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    /// Start the node process on each node.
    Start {
        #[command(flatten)]
        target: ClusterArgs,

        /// Extra arguments for the node binary.
        #[arg(long = "args", allow_hyphen_values = true)]
        args: Vec<String>,

        #[arg(long, default_value = "./cockroach")]
        binary: String,

        #[arg(long, default_value_t = 0)]
        racks: usize,
    },
    /// Signal the node process on each node.
    Stop {
        #[command(flatten)]
        target: ClusterArgs,

        #[arg(long, default_value_t = 9)]
        sig: i32,

        /// Wait for the process to exit.
        #[arg(long)]
        wait: bool,
    },
    /// Kill the node process and delete its data.
    Wipe {
        #[command(flatten)]
        target: ClusterArgs,

        #[arg(long)]
        preserve_certs: bool,
    },
    /// Push a cluster's expiry out.
    Extend {
        cluster: String,

        #[arg(long, short, value_parser = lifetime, default_value = "12h")]
        lifetime: Duration,
    },
    /// Power-cycle every VM of a cluster.
    Reset {
        cluster: String,

        #[arg(long)]
        username: Option<String>,
    },
    /// Clear host keys, wait for the VMs and install authorized keys.
    SetupSsh {
        cluster: String,

        #[arg(long)]
        username: Option<String>,
    },
    /// Destroy expired clusters and unused key pairs.
    Gc {
        #[arg(long)]
        dry_run: bool,

        /// Post the report to Slack.
        #[arg(long, env = "FLEET_SLACK_TOKEN", hide_env_values = true)]
        slack_token: Option<String>,
    },
    /// Node addresses.
    Ip {
        #[command(flatten)]
        target: ClusterArgs,

        #[arg(long)]
        external: bool,
    },
    /// Connection URLs.
    Pgurl {
        #[command(flatten)]
        target: ClusterArgs,

        #[arg(long)]
        external: bool,
    },
    /// Admin UI URLs.
    Adminurl {
        #[command(flatten)]
        target: ClusterArgs,

        #[arg(long, default_value = "/")]
        path: String,

        #[arg(long)]
        external: bool,
    },
    /// Capture a CPU or heap profile from each node.
    Pprof {
        #[command(flatten)]
        target: ClusterArgs,

        #[arg(long, value_parser = lifetime, default_value = "10s")]
        duration: Duration,

        #[arg(long)]
        heap: bool,

        #[arg(long, default_value = ".")]
        output_dir: PathBuf,
    },
}

/// Flags shared by every node operation.
#[derive(Args)]
struct ClusterArgs {
    /// `name` or `name:nodes`, e.g. `alice-perf:1-3`.
    cluster: String,

    #[arg(long)]
    secure: bool,

    #[arg(long, default_value = "./certs")]
    certs_dir: PathBuf,

    /// `KEY=value` exported before starting nodes.
    #[arg(long)]
    env: Vec<String>,

    /// Cap on concurrent per-node operations.
    #[arg(long)]
    max_concurrency: Option<usize>,
}

impl ClusterArgs {
    fn opts(&self, fleet: &Fleet, quiet: bool) -> ClusterOpts {
        ClusterOpts {
            name: self.cluster.clone(),
            secure: self.secure,
            certs_dir: self.certs_dir.clone(),
            env: self.env.clone(),
            max_concurrency: self
                .max_concurrency
                .unwrap_or(fleet.config().max_concurrency),
            quiet,
            ..Default::default()
        }
    }
}

fn lifetime(s: &str) -> Result<Duration, String> {
    parse_lifetime(s).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let default_level = if cli.quiet { "warn" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()))
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            match e.root().kind() {
                ErrorKind::InvalidInput => ExitCode::from(2),
                _ => ExitCode::from(1),
            }
        }
    }
}

async fn run(cli: Cli) -> fleet_core::Result<()> {
    let fleet = Fleet::from_env()?;
    let quiet = cli.quiet;

    match cli.command {
        Command::Create {
            cluster,
            nodes,
            lifetime,
            providers,
            machine_type,
            zones,
            local_ssd,
            filesystem,
            username,
        } => {
            let create = CreateOpts {
                cluster_name: String::new(),
                providers,
                lifetime: lifetime.unwrap_or(fleet.config().default_lifetime),
                machine_type,
                zones,
                ssd: SsdOpts {
                    use_local_ssd: local_ssd,
                    file_system: filesystem,
                },
            };
            let opts = ClusterOpts {
                quiet,
                max_concurrency: fleet.config().max_concurrency,
                ..ClusterOpts::named(&cluster)
            };
            fleet.create(nodes, username.as_deref(), create, &opts).await?;
            println!("OK");
        }
        Command::Destroy {
            clusters,
            all_mine,
            username,
        } => {
            fleet.destroy(&clusters, all_mine, username.as_deref()).await?;
            println!("OK");
        }
        Command::Sync => {
            let cloud = fleet.sync(quiet).await?;
            print_cloud(&cloud, false);
        }
        Command::List {
            pattern,
            mine,
            details,
        } => {
            let cloud = fleet.list(quiet, mine, pattern.as_deref()).await?;
            print_cloud(&cloud, details);
        }
        Command::CachedHosts { cluster } => {
            for line in fleet.cached_hosts(&cluster)? {
                println!("{line}");
            }
        }
        Command::Status(target) => {
            let c = fleet.resolve_cluster(&target.opts(&fleet, quiet))?;
            print_nodes(&nodes::status(fleet.runner(), &c).await?);
        }
        Command::Monitor(target) => {
            let c = fleet.resolve_cluster(&target.opts(&fleet, quiet))?;
            print_nodes(&nodes::monitor(fleet.runner(), &c).await?);
        }
        Command::Run { target, command } => {
            let c = fleet.resolve_cluster(&target.opts(&fleet, quiet))?;
            print_nodes(&nodes::run(fleet.runner(), &c, &command.join(" ")).await?);
        }
        Command::Start {
            target,
            args,
            binary,
            racks,
        } => {
            let opts = ClusterOpts {
                args,
                binary,
                num_racks: racks,
                ..target.opts(&fleet, quiet)
            };
            let c = fleet.resolve_cluster(&opts)?;
            nodes::start(fleet.runner(), &c).await?;
        }
        Command::Stop { target, sig, wait } => {
            let c = fleet.resolve_cluster(&target.opts(&fleet, quiet))?;
            nodes::stop(fleet.runner(), &c, sig, wait).await?;
        }
        Command::Wipe {
            target,
            preserve_certs,
        } => {
            let c = fleet.resolve_cluster(&target.opts(&fleet, quiet))?;
            nodes::wipe(fleet.runner(), &c, preserve_certs).await?;
        }
        Command::Extend { cluster, lifetime } => {
            let cluster = fleet.extend(&cluster, lifetime).await?;
            println!("{}", cluster.details(Utc::now()));
        }
        Command::Reset { cluster, username } => {
            fleet.reset(&cluster, username.as_deref()).await?;
        }
        Command::SetupSsh { cluster, username } => {
            let opts = ClusterOpts {
                quiet,
                ..ClusterOpts::named(&cluster)
            };
            fleet.setup_ssh(&opts, username.as_deref()).await?;
        }
        Command::Gc {
            dry_run,
            slack_token,
        } => {
            let report = fleet.gc(dry_run, slack_token.as_deref()).await?;
            if dry_run {
                println!("{}", report.summary(Utc::now()));
            }
        }
        Command::Ip { target, external } => {
            let c = fleet.resolve_cluster(&target.opts(&fleet, quiet))?;
            print_values(&nodes::ip(fleet.runner(), &c, external).await?);
        }
        Command::Pgurl { target, external } => {
            let c = fleet.resolve_cluster(&target.opts(&fleet, quiet))?;
            print_values(&nodes::pg_url(fleet.runner(), &c, external).await?);
        }
        Command::Adminurl {
            target,
            path,
            external,
        } => {
            let c = fleet.resolve_cluster(&target.opts(&fleet, quiet))?;
            print_values(&nodes::admin_url(fleet.runner(), &c, &path, external).await?);
        }
        Command::Pprof {
            target,
            duration,
            heap,
            output_dir,
        } => {
            let c = fleet.resolve_cluster(&target.opts(&fleet, quiet))?;
            let opts = PprofOpts {
                kind: if heap { ProfileKind::Heap } else { ProfileKind::Cpu },
                duration,
                output_dir,
            };
            for file in pprof::pprof(&c, &opts).await? {
                println!("{}", file.display());
            }
        }
    }
    Ok(())
}

fn print_cloud(cloud: &Cloud, details: bool) {
    let now = Utc::now();
    for cluster in cloud.clusters.values() {
        if details {
            println!("{}", cluster.details(now));
        } else {
            println!("{}:\t{} nodes", cluster.name, cluster.vms.len());
        }
    }
    if !cloud.bad_instances.is_empty() {
        println!("\nbad instances:");
        for vm in &cloud.bad_instances {
            println!("  {} ({}): {}", vm.name, vm.provider, vm.errors.join("; "));
        }
    }
}

fn print_nodes(outputs: &[NodeOutput]) {
    for o in outputs {
        println!("  {:2}: {}", o.node, o.output.trim_end());
    }
}

fn print_values(outputs: &[NodeOutput]) {
    for o in outputs {
        println!("{}", o.output);
    }
}
