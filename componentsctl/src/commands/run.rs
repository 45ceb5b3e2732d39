//! Run command - execute one job manifest and report the result

use super::Context;
use crate::manifest::{self, JobManifest};
use anyhow::Result;
use clap::Args;
use components::{ComponentInterfaceValue, Connection, ExecutionResult, Executor, Outcome};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Job manifest (YAML or JSON)
    #[arg(long, value_name = "FILE")]
    pub manifest: PathBuf,

    /// How long to wait for containers to stop during cleanup
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    pub stop_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum Status {
    Succeeded,
    Failed,
    Errored,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RunReport<'a> {
    job: String,
    status: Status,
    exit_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    outputs: &'a [ComponentInterfaceValue],
    stdout: &'a str,
    stderr: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cleanup_error: Option<String>,
}

impl<'a> RunReport<'a> {
    fn new(job: String, result: &'a ExecutionResult) -> Self {
        let (status, code, message) = match &result.outcome {
            Outcome::Succeeded { .. } => (Status::Succeeded, None, None),
            Outcome::Failed(failure) => (
                Status::Failed,
                Some(failure.code()),
                Some(failure.to_string()),
            ),
            Outcome::Errored(error) => (
                Status::Errored,
                Some(error.code()),
                Some(error.to_string()),
            ),
        };
        Self {
            job,
            status,
            exit_code: result.exit_code,
            code,
            message,
            outputs: result.outputs(),
            stdout: &result.stdout,
            stderr: &result.stderr,
            cleanup_error: result.cleanup_error.as_ref().map(ToString::to_string),
        }
    }
}

/// Process exit status for an outcome: user-facing failures and platform
/// errors are told apart so callers can retry only the latter.
pub fn exit_status(outcome: &Outcome) -> i32 {
    match outcome {
        Outcome::Succeeded { .. } => 0,
        Outcome::Failed(_) => 1,
        Outcome::Errored(_) => 2,
    }
}

pub async fn run(ctx: &Context, args: RunArgs) -> Result<i32> {
    let manifest: JobManifest = manifest::load(&args.manifest)?;
    let job = manifest.job.job_ref()?;
    let label = job.label();

    let connection = Connection::new(
        ctx.host.clone(),
        ctx.settings.clone(),
        job,
        manifest.image.clone(),
        manifest.memory_limit_gb,
    );
    let (inputs, prefixes) = manifest.input_values();
    let mut executor = Executor::new(connection, ctx.blobs(), ctx.jobs())
        .inputs(inputs)
        .outputs(manifest.outputs.clone())
        .stop_timeout(args.stop_timeout);
    for (id, prefix) in prefixes {
        executor = executor.prefix(id, prefix);
    }

    info!(job = %label, "Running job");
    let result = executor.run().await;
    let report = RunReport::new(label, &result);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(exit_status(&result.outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use components::{ComponentFailure, InfrastructureError};

    fn result(outcome: Outcome) -> ExecutionResult {
        ExecutionResult {
            exit_code: Some(137),
            stdout: String::new(),
            stderr: "Killed".to_string(),
            outcome,
            cleanup_error: None,
        }
    }

    #[test]
    fn test_exit_status_separates_user_and_platform_failures() {
        let failed = Outcome::Failed(ComponentFailure::MemoryLimitExceeded { limit_gb: 2 });
        let errored = Outcome::Errored(InfrastructureError::ImageDigestMismatch {
            expected: "sha256:00".to_string(),
        });

        assert_eq!(exit_status(&Outcome::Succeeded { outputs: vec![] }), 0);
        assert_eq!(exit_status(&failed), 1);
        assert_eq!(exit_status(&errored), 2);
    }

    #[test]
    fn test_report_carries_failure_message() {
        let result = result(Outcome::Failed(ComponentFailure::MemoryLimitExceeded {
            limit_gb: 2,
        }));

        let report = serde_json::to_value(RunReport::new("algorithms-job-1".to_string(), &result))
            .unwrap();

        assert_eq!(report["status"], "failed");
        assert_eq!(report["exitCode"], 137);
        assert_eq!(
            report["message"],
            "The container was killed as it exceeded the memory limit of 2g."
        );
        assert!(report.get("cleanupError").is_none());
    }
}
