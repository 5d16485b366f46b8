// tests/config.rs
//
// Startup resolution against the real process environment. Serialized because
// it mutates env vars and the working directory.

use std::{env, fs};

use pulse_ingest::config::{AppConfig, ENV_CONFIG_PATH};
use pulse_ingest::{build_deps, start_ingest, ConfigError};

const TOUCHED: &[&str] = &[
    ENV_CONFIG_PATH,
    "PORT",
    "INGEST_SOURCES",
    "SSE_ENABLED",
    "JOBS_ENABLED",
];

fn clear_env() {
    for k in TOUCHED {
        env::remove_var(k);
    }
}

#[serial_test::serial]
#[test]
fn file_then_env_precedence() {
    let old = env::current_dir().unwrap();
    let tmp = tempfile::tempdir().unwrap();
    env::set_current_dir(tmp.path()).unwrap();
    clear_env();

    // 1) Nothing at all: defaults.
    let cfg = AppConfig::load().unwrap();
    assert_eq!(cfg.port, 8080);
    assert!(!cfg.jobs_enabled && !cfg.sse_enabled);

    // 2) Default path under ./config/.
    fs::create_dir_all(tmp.path().join("config")).unwrap();
    fs::write(
        tmp.path().join("config/pulse.toml"),
        "port = 9000\nsse_enabled = true\nsources = [\"bw\"]\n",
    )
    .unwrap();
    let cfg = AppConfig::load().unwrap();
    assert_eq!(cfg.port, 9000);
    assert!(cfg.sse_enabled);
    assert_eq!(cfg.sources, vec!["bw"]);

    // 3) Explicit path wins over the default one, env wins over both.
    let explicit = tmp.path().join("other.toml");
    fs::write(&explicit, "port = 9100\n").unwrap();
    env::set_var(ENV_CONFIG_PATH, &explicit);
    env::set_var("INGEST_SOURCES", "sec, fed");
    let cfg = AppConfig::load().unwrap();
    assert_eq!(cfg.port, 9100);
    assert_eq!(cfg.sources, vec!["sec", "fed"]);

    env::set_var("PORT", "7000");
    assert_eq!(AppConfig::load().unwrap().port, 7000);

    clear_env();
    env::set_current_dir(old).unwrap();
}

#[serial_test::serial]
#[test]
fn broken_files_are_config_errors() {
    clear_env();
    let tmp = tempfile::tempdir().unwrap();

    env::set_var(ENV_CONFIG_PATH, tmp.path().join("missing.toml"));
    assert!(matches!(AppConfig::load(), Err(ConfigError::Io { .. })));

    let bad = tmp.path().join("bad.toml");
    fs::write(&bad, "port = \"not a number\"\n").unwrap();
    env::set_var(ENV_CONFIG_PATH, &bad);
    assert!(matches!(AppConfig::load(), Err(ConfigError::Parse { .. })));

    clear_env();
}

#[tokio::test]
async fn unknown_source_refuses_ingest() {
    let cfg = AppConfig {
        sources: vec!["bw".into(), "reuters".into()],
        ..AppConfig::default()
    };
    let err = start_ingest(&cfg, build_deps(&cfg)).unwrap_err();
    let cfg_err = err.downcast_ref::<ConfigError>().expect("config error");
    assert_eq!(
        cfg_err.to_string(),
        "unknown sources in INGEST_SOURCES: reuters"
    );
}

#[tokio::test]
async fn empty_source_list_leaves_ingest_off() {
    let cfg = AppConfig::default();
    assert!(start_ingest(&cfg, build_deps(&cfg)).unwrap().is_none());

    // Only a source without a URL: nothing to schedule.
    let cfg = AppConfig {
        sources: vec!["gnw".into()],
        ..AppConfig::default()
    };
    assert!(start_ingest(&cfg, build_deps(&cfg)).unwrap().is_none());
}
