//! nodeup CLI.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use nodeup::pipeline::{self, PipelinePaths, ProvisionOptions};
use nodeup::report::RunStatus;

#[derive(Parser, Debug)]
#[command(name = "nodeup", version, about = "Provision a containerized transcode worker node")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full provisioning pipeline.
    Provision {
        /// Config file path (default: ./nodeup.toml, /etc/nodeup/nodeup.toml).
        #[arg(long)]
        config: Option<PathBuf>,
        /// Apply without the consolidated confirmation prompt.
        #[arg(short = 'y', long = "yes")]
        yes: bool,
        /// Redeploy even when the manifest hash is unchanged.
        #[arg(long)]
        force_redeploy: bool,
        /// Stop after writing the manifest; do not touch the instance.
        #[arg(long)]
        skip_start: bool,
        /// Never install packages or engines; fail with remediation.
        #[arg(long)]
        no_auto_install: bool,
        /// Override the declared node identity.
        #[arg(long)]
        node_name: Option<String>,
        /// Override the declared server endpoint.
        #[arg(long)]
        server_url: Option<String>,
    },
    /// Compute and print the plan without mutating anything.
    Plan {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Remove the namespaced automount configuration and reload autofs.
    Rollback,
    /// Show the stored manifest hash and worker instance state.
    Status,
}

#[tokio::main]
async fn main() {
    // Default to info level if RUST_LOG not set
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .init();

    let args = Args::parse();
    let paths = PipelinePaths::system_default();

    let exit_code = match args.command {
        Command::Provision {
            config,
            yes,
            force_redeploy,
            skip_start,
            no_auto_install,
            node_name,
            server_url,
        } => {
            let opts = ProvisionOptions {
                config_path: config,
                assume_yes: yes,
                force_redeploy,
                skip_start,
                no_auto_install,
                node_name,
                server_url,
            };
            let report = pipeline::provision(opts, paths).await;
            println!("{}", report.render());
            match report.status() {
                RunStatus::Success | RunStatus::PartialSuccess => 0,
                RunStatus::Failure => 1,
            }
        }
        Command::Plan { config } => match plan_only(config).await {
            Ok(rendered) => {
                println!("{}", rendered);
                0
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                1
            }
        },
        Command::Rollback => match pipeline::rollback(paths).await {
            Ok(true) => {
                println!("Automount configuration removed and daemon reloaded.");
                0
            }
            Ok(false) => {
                println!("Nothing to roll back.");
                0
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                1
            }
        },
        Command::Status => {
            println!("{}", pipeline::status(paths).await);
            0
        }
    };

    std::process::exit(exit_code);
}

async fn plan_only(config_path: Option<PathBuf>) -> Result<String, nodeup::ProvisionError> {
    let config = nodeup::NodeConfig::load(config_path.as_deref())?;
    let profile = nodeup::probe::probe_host().await?;
    let installer = nodeup::pkg::installer_for(profile.family);
    let probe = nodeup::engine::HostEngineProbe;
    let plan = pipeline::compute_plan(&config, &profile, installer.as_ref(), &probe).await?;
    Ok(plan.render())
}
