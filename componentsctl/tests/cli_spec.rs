use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const DIGEST_HEX: &str = "3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b3b";

/// A store holding a `docker save` archive of the job image, and an empty
/// config directory so schema defaults apply.
fn setup_test_environment() -> TempDir {
    let temp_dir = TempDir::new().unwrap();
    fs::create_dir_all(temp_dir.path().join("config")).unwrap();
    let images = temp_dir.path().join("store/images");
    fs::create_dir_all(&images).unwrap();

    let manifest = format!(
        r#"[{{"Config": "blobs/sha256/{}", "RepoTags": null, "Layers": []}}]"#,
        DIGEST_HEX
    );
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(manifest.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, "manifest.json", manifest.as_bytes())
        .unwrap();
    fs::write(images.join("algorithm.tar"), builder.into_inner().unwrap()).unwrap();

    temp_dir
}

fn write_manifest(dir: &Path, outputs: &str, blob: &str) -> String {
    let manifest = format!(
        r#"
job:
  app: algorithms
  model: job
  id: cli-1
image:
  digest: "sha256:{DIGEST_HEX}"
  blob: {blob}
memoryLimitGb: 2
inputs:
  - interface: {{slug: flag, title: Flag, kind: bool, relativePath: flag.json}}
    value: {{json: true}}
outputs: {outputs}
"#
    );
    let path = dir.join("job.yaml");
    fs::write(&path, manifest).unwrap();
    path.to_string_lossy().to_string()
}

fn componentsctl(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("componentsctl").unwrap();
    cmd.current_dir(dir)
        .env("CONFIG_DIR", dir.join("config"))
        .env("COMPONENTS_RUNTIME", "memory")
        .env("COMPONENTS_STORE", dir.join("store"));
    cmd
}

#[test]
fn given_job_without_outputs_when_run_then_success_report() {
    let temp_dir = setup_test_environment();
    let manifest = write_manifest(temp_dir.path(), "[]", "images/algorithm.tar");

    componentsctl(temp_dir.path())
        .args(["run", "--manifest", &manifest])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""status": "succeeded""#))
        .stdout(predicate::str::contains(r#""job": "algorithms-job-cli-1""#));
}

#[test]
fn given_output_that_is_never_written_when_run_then_user_failure_exit_code() {
    let temp_dir = setup_test_environment();
    let manifest = write_manifest(
        temp_dir.path(),
        "[{slug: result, title: Result, kind: bool, relativePath: result.json}]",
        "images/algorithm.tar",
    );

    componentsctl(temp_dir.path())
        .args(["run", "--manifest", &manifest])
        .assert()
        .code(1)
        .stdout(predicate::str::contains(r#""status": "failed""#))
        .stdout(predicate::str::contains(
            "File /output/result.json was not produced.",
        ));
}

#[test]
fn given_missing_image_archive_when_run_then_infrastructure_exit_code() {
    let temp_dir = setup_test_environment();
    let manifest = write_manifest(temp_dir.path(), "[]", "images/missing.tar");

    componentsctl(temp_dir.path())
        .args(["run", "--manifest", &manifest])
        .assert()
        .code(2)
        .stdout(predicate::str::contains(r#""status": "errored""#));
}

#[test]
fn given_malformed_manifest_when_run_then_error_names_the_file() {
    let temp_dir = setup_test_environment();
    let path = temp_dir.path().join("broken.yaml");
    fs::write(&path, "job: [").unwrap();

    componentsctl(temp_dir.path())
        .args(["run", "--manifest", &path.to_string_lossy()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to parse manifest"));
}

#[test]
fn given_job_label_when_cleanup_then_reports_cleanup() {
    let temp_dir = setup_test_environment();

    componentsctl(temp_dir.path())
        .args(["cleanup", "--app", "algorithms", "--model", "job", "--id", "cli-2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Cleaned up algorithms-job-cli-2"));
}

#[test]
fn given_dotted_hostname_when_service_started_then_rejected() {
    let temp_dir = setup_test_environment();
    let manifest = format!(
        r#"
job: {{app: workstations, model: session, id: s-1}}
image: {{digest: "sha256:{DIGEST_HEX}", blob: images/algorithm.tar}}
hostname: ws.example
httpPort: 8080
websocketPort: 4114
"#
    );
    let path = temp_dir.path().join("service.yaml");
    fs::write(&path, manifest).unwrap();

    componentsctl(temp_dir.path())
        .args(["service", "start", "--manifest", &path.to_string_lossy()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot contain a '.'"));
}

#[test]
fn given_valid_service_manifest_when_started_then_prints_container_name() {
    let temp_dir = setup_test_environment();
    let manifest = format!(
        r#"
job: {{app: workstations, model: session, id: s-2}}
image: {{digest: "sha256:{DIGEST_HEX}", blob: images/algorithm.tar}}
hostname: ws-2
httpPort: 8080
websocketPort: 4114
environment:
  GRAND_CHALLENGE_API_ROOT: https://gc.localhost/api/v1/
"#
    );
    let path = temp_dir.path().join("service.yaml");
    fs::write(&path, manifest).unwrap();

    componentsctl(temp_dir.path())
        .args(["service", "start", "--manifest", &path.to_string_lossy()])
        .assert()
        .success()
        .stdout(predicate::str::contains("workstations-session-s-2-service"));
}
