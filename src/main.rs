use std::process;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use k3d::cli::{
    self, format_cluster_list, format_import_report, format_provision_report, Cli, Commands,
    CreateResource, DeleteResource, GetResource, LifecycleResource, LoadResource,
};
use k3d::config::{default_settings_path, load_settings_from, Settings};
use k3d::runtime::{get_runtime, Runtime};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let settings_path = cli.config.clone().unwrap_or_else(default_settings_path);
    let settings = load_settings_from(&settings_path)
        .with_context(|| format!("Failed to load settings '{}'", settings_path.display()))?;

    let kind = cli.runtime.unwrap_or(settings.runtime);
    let runtime = get_runtime(kind, &settings.docker.binary);
    info!("Using runtime '{}'", runtime.name());

    dispatch(cli, &settings, runtime.as_ref()).await
}

async fn dispatch(cli: Cli, settings: &Settings, runtime: &dyn Runtime) -> anyhow::Result<()> {
    let verbose = cli.verbose > 0;
    match cli.command {
        Commands::Create(args) => match args.resource {
            CreateResource::Cluster(args) => {
                let report = cli::create_cluster(runtime, settings, &args, verbose).await?;
                print!("{}", format_provision_report(&args.name, &report));
                let failed = report.failed_workers().count();
                if failed > 0 {
                    anyhow::bail!("{} worker(s) of cluster '{}' failed to start", failed, args.name);
                }
                info!("Cluster '{}' created", args.name);
            }
        },
        Commands::Delete(args) => match args.resource {
            DeleteResource::Cluster(selection) => {
                let deleted = cli::delete_clusters(runtime, settings, &selection).await?;
                if deleted.is_empty() {
                    warn!("No clusters found");
                }
                for name in deleted {
                    info!("Deleted cluster '{}'", name);
                }
            }
        },
        Commands::Start(args) => match args.resource {
            LifecycleResource::Cluster(selection) => {
                for name in cli::start_clusters(runtime, &selection).await? {
                    info!("Started cluster '{}'", name);
                }
            }
            LifecycleResource::Node { name } => {
                cli::start_node(runtime, &name).await?;
                info!("Started node '{}'", name);
            }
        },
        Commands::Stop(args) => match args.resource {
            LifecycleResource::Cluster(selection) => {
                for name in cli::stop_clusters(runtime, &selection).await? {
                    info!("Stopped cluster '{}'", name);
                }
            }
            LifecycleResource::Node { name } => {
                cli::stop_node(runtime, &name).await?;
                info!("Stopped node '{}'", name);
            }
        },
        Commands::Get(args) => match args.resource {
            GetResource::Clusters { names } => {
                let clusters = cli::list_clusters(runtime, &names).await?;
                print!("{}", format_cluster_list(&clusters));
            }
            GetResource::Kubeconfig(args) => {
                if let Some(path) = cli::get_kubeconfig(runtime, settings, &args).await? {
                    println!("{}", path.display());
                }
            }
        },
        Commands::Load(args) => match args.resource {
            LoadResource::Image(args) => {
                let report = cli::load_images(runtime, settings, &args).await?;
                print!("{}", format_import_report(&args.cluster, &report));
            }
        },
    }
    Ok(())
}
