//! lxdk CLI - Kubernetes clusters on LXD

use std::path::PathBuf;
use clap::{ArgAction, Parser, Subcommand};
use lxdk::{CreateOptions, DeleteOptions, Orchestrator, OrchestratorConfig, Result, Settings};
use tabled::{Table, Tabled};

#[derive(Parser)]
#[command(name = "lxdk")]
#[command(about = "Multi-node Kubernetes clusters on LXD")]
#[command(version)]
struct Cli {
    /// Path to the settings file
    #[arg(long, global = true, env = "LXDK_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding cluster state, certificates and kubeconfigs
    #[arg(long, global = true, env = "LXDK_CACHE")]
    cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct CreateArgs {
    /// Cluster name
    name: String,
    /// Driver for the cluster's own storage pool
    #[arg(long)]
    storage_driver: Option<String>,
    /// Use an existing storage pool
    #[arg(long)]
    storage_pool: Option<String>,
    /// Use an existing network
    #[arg(long)]
    network: Option<String>,
    /// Number of workers
    #[arg(short = 'n', long, default_value = "1")]
    num_workers: usize,
    /// Skip the image registry instance
    #[arg(long)]
    no_registry: bool,
}

impl CreateArgs {
    fn options(&self) -> CreateOptions {
        CreateOptions {
            name: self.name.clone(),
            num_workers: self.num_workers,
            storage_driver: self.storage_driver.clone(),
            storage_pool: self.storage_pool.clone(),
            network: self.network.clone(),
            registry: !self.no_registry,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Provision a new cluster
    Create(CreateArgs),
    /// Boot a cluster and bring Kubernetes up
    Start {
        name: String,
        /// Make the API reachable on the LXD remote's address
        #[arg(long)]
        use_remote_ip: bool,
    },
    /// Create and start in one go
    Up {
        #[command(flatten)]
        create: CreateArgs,
        #[arg(long)]
        use_remote_ip: bool,
    },
    /// Stop every instance of a cluster
    Stop { name: String },
    /// Destroy a cluster
    Delete {
        name: String,
        /// Delete the cluster's own storage pool
        #[arg(long, action = ArgAction::Set, default_value_t = true)]
        delete_storage: bool,
        /// Delete the cluster's own network
        #[arg(long, action = ArgAction::Set, default_value_t = true)]
        delete_network: bool,
    },
    /// List clusters
    List,
    /// Add a worker to a running cluster
    AddWorker { name: String },
    /// Print the kubectl environment for a cluster
    KubectlEnv { name: String },
    /// Print the etcdctl environment for a cluster
    EtcdEnv { name: String },
    /// Show which authority signed a certificate
    DebugCert {
        name: String,
        #[arg(long)]
        cert_path: PathBuf,
    },
}

#[derive(Tabled)]
struct ClusterRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Workers")]
    workers: usize,
    #[tabled(rename = "Registry")]
    registry: String,
    #[tabled(rename = "Network")]
    network: String,
    #[tabled(rename = "Storage")]
    storage: String,
}

fn main() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("lxdk=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let settings = Settings::load(cli.config.as_deref())?;
    let cache_dir = settings.cache_dir(cli.cache_dir)?;
    let orch = Orchestrator::with_config(OrchestratorConfig::new(cache_dir).settings(settings))?;

    match cli.command {
        Commands::Create(args) => {
            let record = orch.create(&args.options())?;
            println!("Created cluster '{}' ({} instances)", record.name, record.instances.len());
            println!("Run: lxdk start {}", record.name);
        }
        Commands::Start { name, use_remote_ip } => {
            orch.start(&name, use_remote_ip)?;
            println!("Cluster '{}' is running", name);
            println!("{}", orch.kubectl_env(&name)?);
        }
        Commands::Up { create, use_remote_ip } => {
            let record = orch.up(&create.options(), use_remote_ip)?;
            println!("Cluster '{}' is running", record.name);
            println!("{}", orch.kubectl_env(&record.name)?);
        }
        Commands::Stop { name } => {
            orch.stop(&name)?;
            println!("Cluster '{}' stopped", name);
        }
        Commands::Delete {
            name,
            delete_storage,
            delete_network,
        } => {
            orch.delete(
                &name,
                DeleteOptions {
                    delete_storage,
                    delete_network,
                },
            )?;
            println!("Cluster '{}' deleted", name);
        }
        Commands::List => {
            let clusters = orch.list()?;
            if clusters.is_empty() {
                println!("No clusters found.");
            } else {
                let rows: Vec<ClusterRow> = clusters
                    .into_iter()
                    .map(|c| ClusterRow {
                        state: c.state.to_string(),
                        workers: c.workers.len(),
                        registry: c.registry.unwrap_or_else(|| "-".into()),
                        network: c.network_id,
                        storage: c.storage_pool,
                        name: c.name,
                    })
                    .collect();
                println!("{}", Table::new(rows));
            }
        }
        Commands::AddWorker { name } => {
            let worker = orch.add_worker(&name)?;
            println!("Added worker {} to '{}'", worker, name);
        }
        Commands::KubectlEnv { name } => {
            println!("{}", orch.kubectl_env(&name)?);
        }
        Commands::EtcdEnv { name } => {
            for line in orch.etcd_env(&name)?.lines() {
                println!("export {}", line);
            }
        }
        Commands::DebugCert { name, cert_path } => {
            let report = orch.debug_cert(&name, &cert_path)?;
            println!("Signed by: {}", report.authority);
            println!("Subject:   {}", report.info.subject);
            println!("Issuer:    {}", report.info.issuer);
            println!("Expires:   {}", report.info.not_after);
            let mut sans: Vec<String> = report.info.ip_sans.iter().map(|ip| ip.to_string()).collect();
            sans.extend(report.info.dns_sans);
            println!("SANs:      {}", sans.join(", "));
        }
    }

    Ok(())
}
