use super::Context;
use anyhow::{Context as _, Result};
use clap::Args;
use components::{Cleaner, JobClass, JobRef};
use std::time::Duration;

#[derive(Args, Debug)]
pub struct CleanupArgs {
    /// App label of the job's model, e.g. `algorithms`
    #[arg(long)]
    pub app: String,

    /// Model name of the job, e.g. `job`
    #[arg(long)]
    pub model: String,

    /// Job id
    #[arg(long)]
    pub id: String,

    /// How long to wait for running containers to stop
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    pub timeout: Duration,
}

/// Stops and removes everything labeled with one job.
pub async fn run(ctx: &Context, args: CleanupArgs) -> Result<()> {
    let job = JobRef::new(JobClass::new(args.app, args.model)?, args.id)?;
    Cleaner::new(ctx.host.clone(), &job)
        .stop_and_cleanup(args.timeout)
        .await
        .with_context(|| format!("Failed to clean up {}", job))?;
    println!("Cleaned up {}", job);
    Ok(())
}
