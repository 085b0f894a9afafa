use ferrypack::config::{BundlerConfiguration, ConfigLoader, EnvConfig, Mode, RawConfig};
use pretty_assertions::assert_eq;
use serial_test::serial;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn fixture_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/try_elmish")
}

/// Loader isolated from the process environment and the user's own config files
fn hermetic(cwd: &Path) -> ConfigLoader {
    ConfigLoader::new(cwd)
        .with_env(EnvConfig::default())
        .with_global_configs(false)
}

fn load_fixture() -> BundlerConfiguration {
    let dir = fixture_dir();
    hermetic(&dir)
        .with_config_file("ferrypack.toml")
        .load()
        .expect("fixture config should load")
}

#[test]
fn test_fixture_dev_server_port_is_fixed() {
    let config = load_fixture();
    assert_eq!(config.dev_server.port, 8080);
    assert!(config.dev_server.port > 0);
    assert!(config.dev_server.history_fallback_enabled);
    assert_eq!(
        config.dev_server.static_content_root,
        fixture_dir().join("public")
    );
}

#[test]
fn test_fixture_entry_point_exists() {
    let config = load_fixture();
    assert_eq!(config.entry_point, fixture_dir().join("TryElmish.fsproj"));
    assert!(config.entry_point.is_file());
    assert!(config.entry_point.starts_with(&config.context));
}

#[test]
fn test_fixture_rules_are_complete() {
    let config = load_fixture();
    assert_eq!(config.module_rules.len(), 1);
    for rule in &config.module_rules {
        assert!(!rule.file_pattern.is_empty());
        assert!(!rule.loader_name.is_empty());
    }
    assert_eq!(config.module_rules[0].file_pattern, r"\.fs(x|proj)?$");
    assert_eq!(config.module_rules[0].loader_name, "fable-loader");
}

#[test]
fn test_fixture_output_directory_is_relative_to_config() {
    let config = load_fixture();
    assert_eq!(config.output.bundle_filename, "bundle.js");
    assert_eq!(config.output.output_directory, fixture_dir().join("public"));
    assert!(config.output.output_directory.is_dir());
}

#[test]
fn test_reloading_yields_identical_configuration() {
    assert_eq!(load_fixture(), load_fixture());

    // Discovered as the project config instead of passed explicitly
    let discovered = hermetic(&fixture_dir()).load().unwrap();
    assert_eq!(discovered, load_fixture());
}

#[test]
fn test_config_outside_cwd_resolves_against_its_own_directory() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let work = dir.path().join("work");
    let conf = dir.path().join("conf");
    fs::create_dir_all(&work)?;
    fs::create_dir_all(&conf)?;
    fs::write(
        conf.join("bundler.toml"),
        r#"
entry = "../app/main.js"

[output]
path = "./out"
"#,
    )?;

    let config = hermetic(&work)
        .with_config_file("../conf/bundler.toml")
        .load()?;

    assert_eq!(config.context, conf);
    assert_eq!(config.entry_point, dir.path().join("app/main.js"));
    assert_eq!(config.output.output_directory, conf.join("out"));

    // Writable once created
    fs::create_dir_all(&config.output.output_directory)?;
    fs::write(config.output.output_directory.join("write-check.txt"), "ok")?;
    Ok(())
}

#[test]
fn test_layer_precedence() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    fs::write(
        dir.path().join("ferrypack.toml"),
        r#"
mode = "development"

[dev_server]
port = 3000
host = "localhost"
history_api_fallback = false

[[rules]]
test = '\.txt$'
use = "raw-loader"
"#,
    )?;
    fs::write(
        dir.path().join("ci.toml"),
        r#"
[dev_server]
host = "0.0.0.0"

[[rules]]
test = '\.md$'
use = "raw-loader"
"#,
    )?;

    let env = EnvConfig {
        port: Some(4000),
        ..EnvConfig::default()
    };

    let config = hermetic(dir.path()).with_env(env.clone()).load()?;
    assert_eq!(config.dev_server.port, 4000);
    assert_eq!(config.dev_server.host, "localhost");
    assert_eq!(config.mode, Mode::Development);

    let overrides = RawConfig::from_toml_str("[dev_server]\nhistory_fallback_enabled = true")?;
    let config = hermetic(dir.path())
        .with_env(env)
        .with_config_file("ci.toml")
        .with_overrides(overrides)
        .load()?;
    assert_eq!(config.dev_server.port, 4000);
    assert_eq!(config.dev_server.host, "0.0.0.0");
    assert!(config.dev_server.history_fallback_enabled);
    assert_eq!(config.context, dir.path());

    // Rules from higher layers come first
    let patterns: Vec<_> = config
        .module_rules
        .iter()
        .map(|rule| rule.file_pattern.as_str())
        .collect();
    assert_eq!(patterns, vec![r"\.md$", r"\.txt$"]);
    Ok(())
}

#[test]
fn test_cli_overrides_resolve_against_cwd() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let overrides = RawConfig {
        entry_point: Some(PathBuf::from("src/app.js")),
        ..RawConfig::default()
    };

    let config = hermetic(dir.path()).with_overrides(overrides).load()?;
    assert_eq!(config.entry_point, dir.path().join("src/app.js"));
    Ok(())
}

#[test]
fn test_missing_config_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    let err = hermetic(dir.path())
        .with_config_file("nope.toml")
        .load()
        .unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
}

#[test]
fn test_malformed_config_reports_the_file() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    fs::write(dir.path().join("ferrypack.toml"), "[dev_server\nport = 1")?;

    let err = hermetic(dir.path()).load().unwrap_err();
    let message = format!("{err:#}");
    assert!(message.contains("Failed to parse config file"), "{message}");
    assert!(message.contains("ferrypack.toml"), "{message}");
    Ok(())
}

#[test]
fn test_invalid_port_is_rejected() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    fs::write(dir.path().join("ferrypack.toml"), "[dev_server]\nport = 0")?;

    let err = hermetic(dir.path()).load().unwrap_err();
    assert!(format!("{err:#}").contains("positive integer"));
    Ok(())
}

#[test]
fn test_resolved_configuration_prints_as_toml() {
    let printed = load_fixture().to_toml().unwrap();
    assert!(printed.contains("port = 8080"), "{printed}");
    assert!(printed.contains("bundle_filename = \"bundle.js\""), "{printed}");
    assert!(printed.contains("loader_name = \"fable-loader\""), "{printed}");

    // The printed form is itself a valid layer
    let reparsed = RawConfig::from_toml_str(&printed).unwrap();
    assert_eq!(reparsed.dev_server.port, Some(8080));
}

#[test]
#[serial]
fn test_process_environment_layer() -> anyhow::Result<()> {
    // Struct to ensure environment cleanup on panic
    struct EnvGuard {
        vars: Vec<&'static str>,
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for var in &self.vars {
                unsafe {
                    env::remove_var(var);
                }
            }
        }
    }

    let _guard = EnvGuard {
        vars: vec![
            "FERRYPACK_DEV_SERVER_PORT",
            "FERRYPACK_MODE",
            "FERRYPACK_OUTPUT_FILENAME",
        ],
    };

    unsafe {
        env::set_var("FERRYPACK_DEV_SERVER_PORT", "9100");
        env::set_var("FERRYPACK_MODE", "development");
        env::set_var("FERRYPACK_OUTPUT_FILENAME", "app.js");
    }

    let dir = TempDir::new()?;
    let config = ConfigLoader::new(dir.path())
        .with_global_configs(false)
        .load()?;

    assert_eq!(config.dev_server.port, 9100);
    assert_eq!(config.mode, Mode::Development);
    assert_eq!(config.output.bundle_filename, "app.js");
    Ok(())
}

#[test]
#[serial]
fn test_invalid_environment_value_fails_loading() {
    struct EnvGuard;

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            unsafe {
                env::remove_var("FERRYPACK_DEV_SERVER_PORT");
            }
        }
    }

    let _guard = EnvGuard;
    unsafe {
        env::set_var("FERRYPACK_DEV_SERVER_PORT", "eighty");
    }

    let dir = TempDir::new().unwrap();
    let err = ConfigLoader::new(dir.path())
        .with_global_configs(false)
        .load()
        .unwrap_err();
    assert!(format!("{err:#}").contains("FERRYPACK_DEV_SERVER_PORT"));
}
