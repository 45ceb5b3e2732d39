use config_loader::{ConfigError, SettingsLoader, StaticEnv};
use serial_test::serial;
use std::fs;
use tempfile::TempDir;

fn loader_with(content: &str) -> (TempDir, SettingsLoader) {
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join("components.json"), content).unwrap();
    let loader = SettingsLoader::with_dir(temp_dir.path());
    (temp_dir, loader)
}

#[test]
fn given_valid_settings_file_when_load_then_values_are_used() {
    let (_temp_dir, loader) = loader_with(
        r#"{
            "memoryLimit": 32,
            "cpusetCpus": "0-7",
            "pidsLimit": 256,
            "ioImage": "alpine:3.18",
            "docker": { "runtime": "nvidia", "timeoutSecs": 60 }
        }"#,
    );

    let settings = loader.load_with_env(&StaticEnv::default()).unwrap();

    assert_eq!(settings.memory_limit, 32);
    assert_eq!(settings.cpuset_cpus.as_deref(), Some("0-7"));
    assert_eq!(settings.pids_limit, 256);
    assert_eq!(settings.io_image, "alpine:3.18");
    assert_eq!(settings.docker.runtime.as_deref(), Some("nvidia"));
    assert_eq!(settings.docker.timeout_secs, 60);
    assert_eq!(settings.cpu_shares, 1024);
}

#[test]
fn given_unknown_key_when_load_then_validation_fails_with_pointer() {
    let (_temp_dir, loader) = loader_with(r#"{ "memoryLimt": 8 }"#);

    let result = loader.load_with_env(&StaticEnv::default());

    match result {
        Err(ConfigError::ValidationFailed { errors }) => {
            assert!(!errors.is_empty());
            assert!(errors.iter().any(|e| e.message.contains("memoryLimt")));
        }
        other => panic!("expected validation failure, got {:?}", other),
    }
}

#[test]
fn given_malformed_cpuset_when_load_then_validation_fails() {
    let (_temp_dir, loader) = loader_with(r#"{ "cpusetCpus": "all of them" }"#);

    let result = loader.load_with_env(&StaticEnv::default());

    match result {
        Err(ConfigError::ValidationFailed { errors }) => {
            assert!(errors.iter().any(|e| e.json_pointer == "/cpusetCpus"));
        }
        other => panic!("expected validation failure, got {:?}", other),
    }
}

#[test]
fn given_zero_memory_limit_override_when_load_then_validation_fails() {
    let (_temp_dir, loader) = loader_with("{}");
    let env = StaticEnv::from_pairs(&[("COMPONENTS_MEMORY_LIMIT", "0")]);

    let result = loader.load_with_env(&env);

    assert!(matches!(result, Err(ConfigError::ValidationFailed { .. })));
}

#[test]
fn given_override_when_load_then_override_wins_over_file() {
    let (_temp_dir, loader) = loader_with(r#"{ "memoryLimit": 8, "debug": false }"#);
    let env = StaticEnv::from_pairs(&[
        ("COMPONENTS_MEMORY_LIMIT", "16"),
        ("COMPONENTS_DEBUG", "true"),
        ("COMPONENTS_NVIDIA_VISIBLE_DEVICES", "void"),
    ]);

    let settings = loader.load_with_env(&env).unwrap();

    assert_eq!(settings.memory_limit, 16);
    assert!(settings.debug);
    assert_eq!(settings.nvidia_visible_devices, "void");
}

#[test]
fn given_invalid_json_when_load_then_parsing_fails() {
    let (_temp_dir, loader) = loader_with("{ not json");

    let result = loader.load_with_env(&StaticEnv::default());

    assert!(matches!(result, Err(ConfigError::JsonParsingFailed { .. })));
}

#[test]
fn given_missing_file_when_validate_file_then_not_found() {
    let temp_dir = TempDir::new().unwrap();
    let loader = SettingsLoader::with_dir(temp_dir.path());

    let result = loader.validate_file(&temp_dir.path().join("missing.json"));

    assert!(matches!(
        result,
        Err(ConfigError::ConfigFileNotFound { .. })
    ));
}

#[test]
#[serial]
fn given_process_environment_when_load_then_overrides_apply() {
    let (_temp_dir, loader) = loader_with("{}");
    std::env::set_var("COMPONENTS_PIDS_LIMIT", "64");
    std::env::set_var("COMPONENTS_SERVICE_NETWORK", "workstations");

    let result = loader.load();

    std::env::remove_var("COMPONENTS_PIDS_LIMIT");
    std::env::remove_var("COMPONENTS_SERVICE_NETWORK");

    let settings = result.unwrap();
    assert_eq!(settings.pids_limit, 64);
    assert_eq!(settings.service.network, "workstations");
}

#[test]
#[serial]
fn given_config_dir_env_when_new_then_loader_uses_it() {
    let temp_dir = TempDir::new().unwrap();
    std::env::set_var("CONFIG_DIR", temp_dir.path());

    let loader = SettingsLoader::new();

    std::env::remove_var("CONFIG_DIR");
    assert_eq!(loader.config_dir(), temp_dir.path());
}
