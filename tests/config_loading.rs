//! Configuration loading from disk

use reconciler::config::Config;
use reconciler::SubjectKey;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn loads_full_config_file() {
    let file = write_config(
        r#"
        [ledger]
        rpc_url = "http://10.0.0.5:8545"
        token_address = "0x1111111111111111111111111111111111111111"
        manager_address = "0x2222222222222222222222222222222222222222"
        confirmations = 2
        log_lookback_blocks = 64

        [reconciler]
        confirmation_timeout_secs = 60
        retention_secs = 120
        prune_interval_secs = 10

        [display]
        token_symbol = "RET"
        token_decimals = 6
        "#,
    );

    let config = Config::from_file(file.path()).unwrap();
    config.validate().unwrap();
    assert_eq!(config.ledger.rpc_url, "http://10.0.0.5:8545");
    assert_eq!(config.contracts().token, SubjectKey::from_bytes([0x11; 20]));
    assert_eq!(config.contracts().manager, SubjectKey::from_bytes([0x22; 20]));
    assert_eq!(config.confirmation_timeout(), Duration::from_secs(60));
    assert_eq!(config.retention(), Duration::from_secs(120));
    assert_eq!(config.prune_interval(), Duration::from_secs(10));
    assert_eq!(config.display.token_symbol, "RET");
    assert_eq!(config.display.token_decimals, 6);
}

#[test]
fn empty_file_uses_defaults() {
    let file = write_config("");
    let config = Config::from_file(file.path()).unwrap();
    assert_eq!(config.ledger.rpc_url, "http://127.0.0.1:8545");
    assert_eq!(config.confirmation_timeout(), Duration::from_secs(30));
    config.validate().unwrap();
}

#[test]
fn malformed_address_is_reported_with_path() {
    let file = write_config(
        r#"
        [ledger]
        token_address = "0x1234"
        manager_address = "0x2222222222222222222222222222222222222222"
        "#,
    );
    let err = Config::from_file(file.path()).unwrap_err();
    assert!(format!("{:#}", err).contains("Failed to parse config file"));
}

#[test]
fn missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = Config::from_file(dir.path().join("absent.toml")).unwrap_err();
    assert!(err.to_string().contains("Failed to read config file"));
}

#[test]
fn bundled_interface_descriptions_load() {
    // Default paths are relative to the crate root, where cargo runs tests
    let config = Config::default();
    let interface = config.load_interface().unwrap();
    assert!(interface.has_function("purchaseTokens"));
    assert!(interface.has_function("whitelistInvestor"));
    assert!(interface.event_topic("TokensPurchased").is_some());
    assert!(interface.event_topic("InvestorWhitelisted").is_some());
}
