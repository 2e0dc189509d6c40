use super::*;

use std::{
    collections::HashMap,
    env, fs,
    time::{SystemTime, UNIX_EPOCH},
};

#[test]
fn defaults_match_delivery_and_watchdog_policy() {
    let settings = ClientSettings::default();
    assert_eq!(settings.ack_timeout(), Duration::from_secs(5));
    assert_eq!(settings.watchdog_interval(), Duration::from_secs(5));
    assert_eq!(settings.max_delivery_attempts, 3);
    assert_eq!(settings.retry_base_delay(), Duration::from_secs(1));
    assert_eq!(settings.optimistic_match_window(), Duration::from_secs(30));
    assert_eq!(settings.dedup_ttl(), Duration::from_secs(300));
}

#[test]
fn realtime_url_is_derived_from_api_base() {
    let mut settings = ClientSettings {
        api_base_url: "https://chat.example.com/".into(),
        ..ClientSettings::default()
    };
    assert_eq!(
        settings.resolved_realtime_url().expect("url"),
        "wss://chat.example.com/socket"
    );

    settings.api_base_url = "ftp://chat.example.com".into();
    assert!(matches!(
        settings.resolved_realtime_url(),
        Err(ClientError::Config(_))
    ));

    settings.realtime_url = Some("ws://127.0.0.1:9000/rt".into());
    assert_eq!(
        settings.resolved_realtime_url().expect("url"),
        "ws://127.0.0.1:9000/rt"
    );
}

#[test]
fn settings_file_values_override_defaults() {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let path = env::temp_dir().join(format!("chat_client_settings_{suffix}.toml"));
    fs::write(
        &path,
        "api_base_url = \"https://api.example.com\"\nack_timeout_ms = 2500\nmax_delivery_attempts = 0\n",
    )
    .expect("write settings");

    let settings = load_settings_from(&path);
    assert_eq!(settings.api_base_url, "https://api.example.com");
    assert_eq!(settings.ack_timeout_ms, 2500);
    assert_eq!(settings.max_delivery_attempts, 1);

    fs::remove_file(path).expect("cleanup");
}

#[test]
fn missing_settings_file_keeps_defaults() {
    let settings = load_settings_from(Path::new("/nonexistent/client.toml"));
    assert_eq!(settings, ClientSettings::default());
}

#[test]
fn environment_overrides_take_precedence() {
    let env: HashMap<&str, &str> = HashMap::from([
        ("CHAT_API_URL", "http://first.example"),
        ("APP__API_BASE_URL", "http://second.example"),
        ("APP__CREDENTIALS_PATH", "/tmp/creds.json"),
        ("APP__WATCHDOG_INTERVAL_MS", "1000"),
        ("APP__HISTORY_LIMIT", "500"),
        ("APP__RETRY_BASE_DELAY_MS", "not-a-number"),
    ]);
    let mut settings = ClientSettings::default();
    apply_overrides(&mut settings, |key| env.get(key).map(|v| v.to_string()));

    assert_eq!(settings.api_base_url, "http://second.example");
    assert_eq!(settings.credentials_path.as_deref(), Some("/tmp/creds.json"));
    assert_eq!(settings.watchdog_interval_ms, 1000);
    assert_eq!(settings.history_limit, 100);
    assert_eq!(settings.retry_base_delay_ms, 1_000);
}
