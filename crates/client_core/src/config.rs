use std::{collections::HashMap, fs, path::Path, time::Duration};

use crate::error::{ClientError, ClientResult};

pub const DEFAULT_SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub api_base_url: String,
    /// Realtime endpoint. Derived from `api_base_url` when unset.
    pub realtime_url: Option<String>,
    /// Where the credential pair is persisted. In-memory only when unset.
    pub credentials_path: Option<String>,
    pub request_timeout_ms: u64,
    pub refresh_timeout_ms: u64,
    pub proactive_refresh_skew_secs: u64,
    pub watchdog_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub max_reconnect_attempts: u32,
    pub ack_timeout_ms: u64,
    pub max_delivery_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub optimistic_match_window_secs: u64,
    pub dedup_capacity: usize,
    pub dedup_ttl_secs: u64,
    pub history_limit: u32,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:4000".into(),
            realtime_url: None,
            credentials_path: None,
            request_timeout_ms: 15_000,
            refresh_timeout_ms: 10_000,
            proactive_refresh_skew_secs: 60,
            watchdog_interval_ms: 5_000,
            connect_timeout_ms: 10_000,
            max_reconnect_attempts: 10,
            ack_timeout_ms: 5_000,
            max_delivery_attempts: 3,
            retry_base_delay_ms: 1_000,
            optimistic_match_window_secs: 30,
            dedup_capacity: 1_000,
            dedup_ttl_secs: 300,
            history_limit: 50,
        }
    }
}

impl ClientSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.refresh_timeout_ms)
    }

    pub fn proactive_refresh_skew(&self) -> Duration {
        Duration::from_secs(self.proactive_refresh_skew_secs)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn optimistic_match_window(&self) -> Duration {
        Duration::from_secs(self.optimistic_match_window_secs)
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_secs)
    }

    /// Realtime URL, falling back to the API base with its scheme swapped
    /// for the websocket equivalent.
    pub fn resolved_realtime_url(&self) -> ClientResult<String> {
        if let Some(url) = &self.realtime_url {
            return Ok(url.clone());
        }
        let base = self.api_base_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(ClientError::Config(
                "api_base_url must start with http:// or https://".into(),
            ));
        };
        Ok(format!("{ws_base}/socket"))
    }
}

pub fn load_settings() -> ClientSettings {
    let mut settings = load_settings_from(Path::new(DEFAULT_SETTINGS_FILE));
    apply_overrides(&mut settings, |key| std::env::var(key).ok());
    settings
}

/// Reads a flat `key = "value"` settings file. Missing or malformed files
/// leave the defaults in place.
pub fn load_settings_from(path: &Path) -> ClientSettings {
    let mut settings = ClientSettings::default();
    if let Ok(raw) = fs::read_to_string(path) {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, toml::Value>>(&raw) {
            let lookup = |key: &str| {
                file_cfg.get(key).map(|value| match value {
                    toml::Value::String(text) => text.clone(),
                    other => other.to_string(),
                })
            };
            apply_file_values(&mut settings, lookup);
        }
    }
    settings
}

fn apply_file_values(settings: &mut ClientSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("api_base_url") {
        settings.api_base_url = v;
    }
    if let Some(v) = lookup("realtime_url") {
        settings.realtime_url = Some(v);
    }
    if let Some(v) = lookup("credentials_path") {
        settings.credentials_path = Some(v);
    }
    apply_numeric(settings, |key| lookup(key));
}

/// Environment overrides. `lookup` is `std::env::var` outside of tests.
pub fn apply_overrides(settings: &mut ClientSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("CHAT_API_URL") {
        settings.api_base_url = v;
    }
    if let Some(v) = lookup("APP__API_BASE_URL") {
        settings.api_base_url = v;
    }
    if let Some(v) = lookup("CHAT_REALTIME_URL") {
        settings.realtime_url = Some(v);
    }
    if let Some(v) = lookup("APP__REALTIME_URL") {
        settings.realtime_url = Some(v);
    }
    if let Some(v) = lookup("APP__CREDENTIALS_PATH") {
        settings.credentials_path = Some(v);
    }
    apply_numeric(settings, |key| lookup(&format!("APP__{}", key.to_ascii_uppercase())));
}

fn apply_numeric(settings: &mut ClientSettings, lookup: impl Fn(&str) -> Option<String>) {
    fn parse<T: std::str::FromStr>(raw: Option<String>) -> Option<T> {
        raw.and_then(|v| v.trim().parse::<T>().ok())
    }

    if let Some(v) = parse(lookup("request_timeout_ms")) {
        settings.request_timeout_ms = v;
    }
    if let Some(v) = parse(lookup("refresh_timeout_ms")) {
        settings.refresh_timeout_ms = v;
    }
    if let Some(v) = parse(lookup("proactive_refresh_skew_secs")) {
        settings.proactive_refresh_skew_secs = v;
    }
    if let Some(v) = parse(lookup("watchdog_interval_ms")) {
        settings.watchdog_interval_ms = v;
    }
    if let Some(v) = parse(lookup("connect_timeout_ms")) {
        settings.connect_timeout_ms = v;
    }
    if let Some(v) = parse(lookup("max_reconnect_attempts")) {
        settings.max_reconnect_attempts = v;
    }
    if let Some(v) = parse(lookup("ack_timeout_ms")) {
        settings.ack_timeout_ms = v;
    }
    if let Some(v) = parse::<u32>(lookup("max_delivery_attempts")) {
        settings.max_delivery_attempts = v.max(1);
    }
    if let Some(v) = parse(lookup("retry_base_delay_ms")) {
        settings.retry_base_delay_ms = v;
    }
    if let Some(v) = parse(lookup("optimistic_match_window_secs")) {
        settings.optimistic_match_window_secs = v;
    }
    if let Some(v) = parse::<usize>(lookup("dedup_capacity")) {
        settings.dedup_capacity = v.max(1);
    }
    if let Some(v) = parse(lookup("dedup_ttl_secs")) {
        settings.dedup_ttl_secs = v;
    }
    if let Some(v) = parse::<u32>(lookup("history_limit")) {
        settings.history_limit = v.clamp(1, 100);
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
