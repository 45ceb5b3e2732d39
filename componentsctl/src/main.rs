use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::cleanup::CleanupArgs;
use commands::run::RunArgs;
use commands::service::ServiceCommand;
use commands::{Context, Runtime};
use std::path::PathBuf;
use tracing_subscriber::{fmt, EnvFilter};

mod commands;
mod manifest;

#[derive(Parser)]
#[command(name = "componentsctl", version, about = "Run component containers and clean up after them")]
struct Cli {
    /// Runtime host to drive
    #[arg(long, global = true, env = "COMPONENTS_RUNTIME", value_enum, default_value = "docker")]
    runtime: Runtime,

    /// Directory backing the blob and job stores
    #[arg(long, global = true, env = "COMPONENTS_STORE", default_value = ".components/store")]
    store: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a job manifest to completion and print the result as JSON
    Run(RunArgs),
    /// Remove every container and volume labeled with a job
    Cleanup(CleanupArgs),
    /// Manage long-running service sessions
    Service {
        #[command(subcommand)]
        cmd: ServiceCommand,
    },
    /// Print version and exit
    Version,
}

fn init_tracing(json: bool) {
    let builder = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.cmd {
        Commands::Run(args) => {
            let ctx = Context::load(cli.runtime, cli.store)?;
            let status = commands::run::run(&ctx, args).await?;
            if status != 0 {
                std::process::exit(status);
            }
        }
        Commands::Cleanup(args) => {
            let ctx = Context::load(cli.runtime, cli.store)?;
            commands::cleanup::run(&ctx, args).await?;
        }
        Commands::Service { cmd } => {
            let ctx = Context::load(cli.runtime, cli.store)?;
            commands::service::run(&ctx, cmd).await?;
        }
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
        }
    }
    Ok(())
}
