mod common;

use anyhow::Result;
use common::{Harness, IO_IMAGE};
use components::host::{ContainerSpec, ContainerState, Labels, VolumeMount};
use components::{Cleaner, InfrastructureError, JobClass, JobRef, RuntimeHost};
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(10);

/// Starts a long-running helper labeled with the harness job.
async fn start_running(harness: &Harness, suffix: &str) -> Result<String> {
    harness.host.add_image(IO_IMAGE);
    let connection = harness.connection(1);
    let name = format!("{}-{}", harness.label(), suffix);
    let spec = ContainerSpec::new(
        name.clone(),
        IO_IMAGE,
        connection.labels().clone(),
        connection.run_config().clone(),
    )
    .mount(VolumeMount::read_write(format!("{}-input", harness.label()), "/input/"))
    .tty();
    harness
        .host
        .create_volume(&format!("{}-input", harness.label()), connection.labels())
        .await?;
    harness.host.run_container(&spec).await?;
    Ok(name)
}

#[tokio::test]
async fn given_running_container_when_cleaned_up_then_it_is_stopped_and_removed() -> Result<()> {
    let harness = Harness::new("running");
    let name = start_running(&harness, "writer").await?;
    assert_eq!(harness.host.container_state(&name), Some(ContainerState::Running));

    harness.connection(1).stop_and_cleanup(TIMEOUT).await?;

    assert!(harness.host.containers().is_empty());
    assert!(harness.host.volumes().is_empty());
    Ok(())
}

#[tokio::test]
async fn given_cleaned_job_when_cleaned_again_then_nothing_fails() -> Result<()> {
    let harness = Harness::new("twice");
    start_running(&harness, "writer").await?;
    let connection = harness.connection(1);

    connection.stop_and_cleanup(TIMEOUT).await?;
    connection.stop_and_cleanup(TIMEOUT).await?;

    assert!(harness.host.containers().is_empty());
    Ok(())
}

#[tokio::test]
async fn given_other_jobs_when_cleaned_up_then_their_resources_remain() -> Result<()> {
    let harness = Harness::new("mine");
    start_running(&harness, "writer").await?;
    let other = JobRef::new(JobClass::evaluation(), "theirs")?;
    let other_labels = Labels::from([("job".to_string(), other.label())]);
    harness
        .host
        .create_volume(&format!("{}-output", other.label()), &other_labels)
        .await?;

    harness.connection(1).stop_and_cleanup(TIMEOUT).await?;

    assert_eq!(harness.host.volumes(), vec![format!("{}-output", other.label())]);
    Ok(())
}

#[tokio::test]
async fn given_job_without_image_when_cleaner_runs_then_resources_are_removed() -> Result<()> {
    let harness = Harness::new("no-image");
    start_running(&harness, "service").await?;

    Cleaner::new(harness.host.clone(), &harness.job)
        .stop_and_cleanup(TIMEOUT)
        .await?;

    assert!(harness.host.containers().is_empty());
    assert!(harness.host.volumes().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn given_transient_prune_conflicts_when_cleaned_up_then_prune_is_retried() -> Result<()> {
    let harness = Harness::new("conflict");
    start_running(&harness, "writer").await?;
    harness.host.fail_next_prunes(3);

    harness.connection(1).stop_and_cleanup(TIMEOUT).await?;

    assert_eq!(harness.host.prune_attempts(), 5);
    assert!(harness.host.volumes().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn given_persistent_prune_conflicts_when_cleaned_up_then_retries_are_exhausted() -> Result<()> {
    let harness = Harness::new("stuck");
    harness.host.fail_next_prunes(100);

    let error = harness
        .connection(1)
        .stop_and_cleanup(TIMEOUT)
        .await
        .unwrap_err();

    match error {
        InfrastructureError::PruneExhausted {
            resource, attempts, ..
        } => {
            assert_eq!(resource, "containers");
            assert_eq!(attempts, 10);
        }
        other => panic!("expected exhausted retries, got {:?}", other),
    }
    assert_eq!(harness.host.prune_attempts(), 10);
    Ok(())
}
