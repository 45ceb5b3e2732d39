//! Service commands - long-running sessions behind the reverse proxy

use super::Context;
use crate::manifest::{self, ServiceManifest};
use anyhow::{Context as _, Result};
use clap::Subcommand;
use components::{Connection, Service};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Subcommand, Debug)]
pub enum ServiceCommand {
    /// Start a service from a manifest and print its container name
    Start {
        #[arg(long, value_name = "FILE")]
        manifest: PathBuf,
    },
    /// Print the last lines of a service's logs
    Logs {
        #[arg(long, value_name = "FILE")]
        manifest: PathBuf,
    },
    /// Stop a service and remove everything labeled with its job
    Stop {
        #[arg(long, value_name = "FILE")]
        manifest: PathBuf,

        #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
        timeout: Duration,
    },
}

fn service(ctx: &Context, manifest: &ServiceManifest) -> Result<Service> {
    let connection = Connection::new(
        ctx.host.clone(),
        ctx.settings.clone(),
        manifest.job.job_ref()?,
        manifest.image.clone(),
        manifest.memory_limit_gb,
    );
    Ok(Service::new(connection))
}

pub async fn run(ctx: &Context, cmd: ServiceCommand) -> Result<()> {
    match cmd {
        ServiceCommand::Start { manifest } => {
            let manifest: ServiceManifest = manifest::load(&manifest)?;
            let service = service(ctx, &manifest)?;
            service
                .start(
                    ctx.blobs().as_ref(),
                    manifest.http_port,
                    manifest.websocket_port,
                    &manifest.hostname,
                    manifest.environment.clone(),
                )
                .await
                .with_context(|| format!("Failed to start service {}", manifest.hostname))?;
            println!("{}", service.container_name());
        }
        ServiceCommand::Logs { manifest } => {
            let manifest: ServiceManifest = manifest::load(&manifest)?;
            print!("{}", service(ctx, &manifest)?.logs().await);
        }
        ServiceCommand::Stop { manifest, timeout } => {
            let manifest: ServiceManifest = manifest::load(&manifest)?;
            let service = service(ctx, &manifest)?;
            service
                .stop_and_cleanup(timeout)
                .await
                .with_context(|| format!("Failed to stop {}", service.container_name()))?;
            println!("Stopped {}", service.container_name());
        }
    }
    Ok(())
}
