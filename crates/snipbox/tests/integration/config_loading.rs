use std::net::SocketAddr;

use snipbox::RuntimeRegistry;
use snipbox::config::Config;

use super::FIXTURES_PATH;

fn fixture(name: &str) -> String {
    format!("{FIXTURES_PATH}/configs/{name}")
}

#[test]
fn test_load_shipped_example() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/snipbox.example.toml");
    let config = Config::from_file(path).expect("Failed to load config");

    for id in ["python", "javascript", "bash", "c"] {
        assert!(config.languages.contains_key(id), "missing {id}");
    }
    assert!(config.languages["c"].is_compiled());

    let registry = RuntimeRegistry::from_config(&config).expect("Failed to build registry");
    assert_eq!(registry.resolve("node").unwrap().as_str(), "javascript");
    assert_eq!(registry.resolve("PY").unwrap().as_str(), "python");
}

#[test]
fn test_load_minimal_config_fills_defaults() {
    let config = Config::from_file(fixture("minimal.toml")).expect("Failed to load config");

    assert!(config.languages.contains_key("lua"));
    assert_eq!(config.pool.max_workers, Config::empty().pool.max_workers);
    assert_eq!(config.quota.burst, Config::empty().quota.burst);
}

#[test]
fn test_load_tuned_config() {
    let config = Config::from_file(fixture("tuned.toml")).expect("Failed to load config");

    assert_eq!(config.server.bind, "0.0.0.0:9000".parse::<SocketAddr>().unwrap());
    assert_eq!(config.pool.max_workers, 4);
    assert_eq!(config.pool.queue_capacity, 16);
    assert_eq!(config.quota.burst, 5);
    assert_eq!(config.quota.max_concurrent_per_session, 1);
    assert_eq!(config.default_limits.time_limit, Some(2.0));
    assert_eq!(config.default_limits.memory_limit, Some(65536));
}

#[test]
fn test_load_invalid_empty_name() {
    assert!(Config::from_file(fixture("invalid_empty_name.toml")).is_err());
}

#[test]
fn test_load_invalid_empty_run_command() {
    assert!(Config::from_file(fixture("invalid_empty_run_command.toml")).is_err());
}

#[test]
fn test_load_missing_file() {
    assert!(Config::from_file(fixture("does_not_exist.toml")).is_err());
}
