//! Precedence of configuration sources: file, then environment, then CLI.
//!
//! Environment mutation is process-global, so every test here is serialized.

use std::path::PathBuf;

use clap::Parser;
use serial_test::serial;
use tierguard::cache::{CacheConfig, ClearScope};
use tierguard::config::{self, CliArgs, Command};

const ROOT_VAR: &str = "TIERGUARD__CACHE__ROOT";
const EDGE_PORT_VAR: &str = "TIERGUARD__EDGE__PORT";

fn write_config(dir: &std::path::Path) -> PathBuf {
    let path = dir.join("tierguard.toml");
    std::fs::write(
        &path,
        r#"
[cache]
root = "/srv/from-file"
page_lifetime_seconds = 120

[edge]
port = 7000
"#,
    )
    .expect("write config");
    path
}

fn clear_env() {
    // SAFETY: tests in this file are serialized, so no other thread reads the environment.
    unsafe {
        std::env::remove_var(ROOT_VAR);
        std::env::remove_var(EDGE_PORT_VAR);
    }
}

#[test]
#[serial]
fn file_values_apply_over_defaults() {
    clear_env();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_config(dir.path());

    let args = CliArgs::parse_from(["tierguard", "--config-file", path.to_str().unwrap()]);
    let settings = config::load(&args).expect("settings");

    assert_eq!(settings.cache.root, PathBuf::from("/srv/from-file"));
    assert_eq!(settings.cache.page_lifetime.as_secs(), 120);
    assert_eq!(settings.edge.port, 7000);

    let engine = CacheConfig::from(&settings.cache);
    assert_eq!(engine.html_root(), PathBuf::from("/srv/from-file/html"));
}

#[test]
#[serial]
fn environment_overrides_file() {
    clear_env();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_config(dir.path());
    // SAFETY: serialized test.
    unsafe {
        std::env::set_var(ROOT_VAR, "/srv/from-env");
        std::env::set_var(EDGE_PORT_VAR, "7100");
    }

    let args = CliArgs::parse_from(["tierguard", "--config-file", path.to_str().unwrap()]);
    let settings = config::load(&args);
    clear_env();
    let settings = settings.expect("settings");

    assert_eq!(settings.cache.root, PathBuf::from("/srv/from-env"));
    assert_eq!(settings.edge.port, 7100);
}

#[test]
#[serial]
fn cli_overrides_environment() {
    clear_env();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_config(dir.path());
    // SAFETY: serialized test.
    unsafe {
        std::env::set_var(ROOT_VAR, "/srv/from-env");
    }

    let args = CliArgs::parse_from([
        "tierguard",
        "--config-file",
        path.to_str().unwrap(),
        "clear",
        "--scope",
        "all",
        "--cache-root",
        "/srv/from-cli",
    ]);
    let settings = config::load(&args);
    clear_env();
    let settings = settings.expect("settings");

    assert_eq!(settings.cache.root, PathBuf::from("/srv/from-cli"));
    match args.command {
        Some(Command::Clear(clear)) => assert_eq!(ClearScope::from(clear.scope), ClearScope::All),
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
#[serial]
fn missing_explicit_config_file_is_an_error() {
    clear_env();
    let args = CliArgs::parse_from(["tierguard", "--config-file", "/nonexistent/tierguard.toml"]);
    assert!(config::load(&args).is_err());
}
