use crate::ingest::DebouncePolicy;
use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "/etc/telemetry-pipeline/config.json";
const DEFAULT_TOPICS: &str = "Sense/#,Elkem/Water/#";
const UNSPECIFIED_IP: &str = "0.0.0.0";

fn config_path() -> PathBuf {
    env_value("PIPELINE_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Trimmed, non-empty value of an environment variable.
fn env_value(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_value<T: FromStr>(key: &str, raw: Option<String>, default: T, warnings: &mut Vec<String>) -> T {
    let Some(raw) = raw else {
        return default;
    };
    match raw.parse::<T>() {
        Ok(value) => value,
        Err(_) => {
            warnings.push(format!("ignoring unparseable config value {key}={raw:?}"));
            default
        }
    }
}

/// Reads settings before tracing is up; problems are kept for the caller to
/// log once the subscriber is installed.
#[derive(Debug, Default)]
struct EnvReader {
    warnings: Vec<String>,
}

impl EnvReader {
    fn parse<T: FromStr>(&mut self, key: &str, default: T) -> T {
        parse_value(key, env_value(key), default, &mut self.warnings)
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    env_value(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    mqtt_host: Option<String>,
    #[serde(default)]
    mqtt_port: Option<u16>,
    #[serde(default)]
    mqtt_username: Option<String>,
    #[serde(default)]
    mqtt_password: Option<String>,
    #[serde(default)]
    mqtt_topics: Option<Vec<String>>,
    #[serde(default)]
    offline_threshold_seconds: Option<u64>,
    #[serde(default)]
    rule_refresh_ms: Option<u64>,
    #[serde(default)]
    enable_rollup: Option<bool>,
    #[serde(default)]
    fallback_ip: Option<String>,
}

fn load_config_overrides(warnings: &mut Vec<String>) -> Option<ConfigOverrides> {
    let path = config_path();
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            warnings.push(format!(
                "failed to read pipeline config file {}: {err}; using env defaults",
                path.display()
            ));
            return None;
        }
    };
    let mut bytes = contents.into_bytes();
    match parse_overrides(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            warnings.push(format!(
                "failed to parse pipeline config file {}: {err}; using env defaults",
                path.display()
            ));
            None
        }
    }
}

fn parse_overrides(bytes: &mut [u8]) -> Result<ConfigOverrides, simd_json::Error> {
    simd_json::serde::from_slice(bytes)
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Applies file values for every setting whose env var is unset.
fn apply_overrides(config: &mut Config, overrides: &ConfigOverrides, env_is_set: impl Fn(&str) -> bool) {
    if !env_is_set("PIPELINE_MQTT_HOST") {
        if let Some(host) = non_empty(overrides.mqtt_host.as_deref()) {
            config.mqtt_host = host;
        }
    }
    if !env_is_set("PIPELINE_MQTT_PORT") {
        if let Some(port) = overrides.mqtt_port.filter(|v| *v != 0) {
            config.mqtt_port = port;
        }
    }
    if !env_is_set("PIPELINE_MQTT_USERNAME") {
        if let Some(username) = overrides.mqtt_username.as_deref() {
            config.mqtt_username = non_empty(Some(username));
        }
    }
    if !env_is_set("PIPELINE_MQTT_PASSWORD") {
        if let Some(password) = overrides.mqtt_password.as_deref() {
            config.mqtt_password = non_empty(Some(password));
        }
    }
    if !env_is_set("PIPELINE_MQTT_TOPICS") {
        if let Some(topics) = overrides.mqtt_topics.as_ref() {
            let topics: Vec<String> = topics
                .iter()
                .filter_map(|topic| non_empty(Some(topic)))
                .collect();
            if !topics.is_empty() {
                config.mqtt_topics = topics;
            }
        }
    }
    if !env_is_set("PIPELINE_OFFLINE_THRESHOLD_SECONDS") {
        if let Some(value) = overrides.offline_threshold_seconds.filter(|v| *v != 0) {
            config.offline_threshold_seconds = value;
        }
    }
    if !env_is_set("PIPELINE_RULE_REFRESH_MS") {
        if let Some(value) = overrides.rule_refresh_ms.filter(|v| *v != 0) {
            config.rule_refresh_ms = value;
        }
    }
    if !env_is_set("PIPELINE_ENABLE_ROLLUP") {
        if let Some(value) = overrides.enable_rollup {
            config.enable_rollup = value;
        }
    }
    if !env_is_set("PIPELINE_FALLBACK_IP") {
        if let Some(ip) = non_empty(overrides.fallback_ip.as_deref()) {
            config.fallback_ip = ip;
        }
    }
}

fn parse_topics(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|topic| !topic.is_empty())
        .map(str::to_string)
        .collect()
}

/// First non-loopback IPv4 address of this host.
fn detect_local_ipv4() -> Option<String> {
    let interfaces = match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces,
        Err(err) => {
            tracing::debug!(error = %err, "failed to list network interfaces");
            return None;
        }
    };
    interfaces
        .into_iter()
        .filter(|iface| !iface.is_loopback())
        .find_map(|iface| match iface.ip() {
            IpAddr::V4(addr) => Some(addr.to_string()),
            IpAddr::V6(_) => None,
        })
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub db_pool_size: u32,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_topics: Vec<String>,
    pub mqtt_keepalive_secs: u64,
    pub mqtt_client_id: String,
    pub mqtt_reconnect_ms: u64,
    pub ingest_queue: usize,
    pub reading_flush_ms: u64,
    pub alert_flush_ms: u64,
    pub rule_refresh_ms: u64,
    pub offline_threshold_seconds: u64,
    pub fast_persist_ms: u64,
    pub slow_persist_ms: u64,
    pub high_frequency_gap_seconds: u64,
    pub arrival_window: usize,
    pub default_alert_interval_minutes: u32,
    pub enable_rollup: bool,
    pub rollup_interval_seconds: u64,
    pub rollup_window_seconds: u64,
    pub rollup_device_batch: usize,
    pub status_reconcile_ms: u64,
    pub fallback_ip: String,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    /// Loads the configuration along with warnings about ignored values, which
    /// the caller logs after tracing is initialised.
    pub fn from_env() -> Result<(Self, Vec<String>)> {
        dotenv().ok();

        let mut reader = EnvReader::default();
        let overrides = load_config_overrides(&mut reader.warnings);

        let database_url = env_value("PIPELINE_DATABASE_URL")
            .or_else(|| env_value("DATABASE_URL"))
            .or_else(|| {
                overrides
                    .as_ref()
                    .and_then(|ov| non_empty(ov.database_url.as_deref()))
            })
            .context("PIPELINE_DATABASE_URL or DATABASE_URL is required (or database_url in the config file)")?;
        let database_url = normalize_database_url(database_url);

        let mqtt_topics = parse_topics(
            &env_value("PIPELINE_MQTT_TOPICS").unwrap_or_else(|| DEFAULT_TOPICS.to_string()),
        );
        let fallback_ip = env_value("PIPELINE_FALLBACK_IP")
            .or_else(detect_local_ipv4)
            .unwrap_or_else(|| UNSPECIFIED_IP.to_string());

        let mut config = Self {
            database_url,
            db_pool_size: reader.parse("PIPELINE_DB_POOL_SIZE", 10),
            mqtt_host: env_value("PIPELINE_MQTT_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            mqtt_port: reader.parse("PIPELINE_MQTT_PORT", 1883),
            mqtt_username: env_value("PIPELINE_MQTT_USERNAME"),
            mqtt_password: env_value("PIPELINE_MQTT_PASSWORD"),
            mqtt_topics,
            mqtt_keepalive_secs: reader.parse("PIPELINE_MQTT_KEEPALIVE_SECS", 30),
            mqtt_client_id: env_value("PIPELINE_MQTT_CLIENT_ID")
                .unwrap_or_else(|| format!("telemetry-pipeline-{}", std::process::id())),
            mqtt_reconnect_ms: reader.parse("PIPELINE_MQTT_RECONNECT_MS", 5000),
            ingest_queue: reader.parse("PIPELINE_INGEST_QUEUE", 1024),
            reading_flush_ms: reader.parse("PIPELINE_READING_FLUSH_MS", 1000),
            alert_flush_ms: reader.parse("PIPELINE_ALERT_FLUSH_MS", 3000),
            rule_refresh_ms: reader.parse("PIPELINE_RULE_REFRESH_MS", 10_000),
            offline_threshold_seconds: reader.parse("PIPELINE_OFFLINE_THRESHOLD_SECONDS", 1800),
            fast_persist_ms: reader.parse("PIPELINE_FAST_PERSIST_MS", 1000),
            slow_persist_ms: reader.parse("PIPELINE_SLOW_PERSIST_MS", 60_000),
            high_frequency_gap_seconds: reader.parse("PIPELINE_HIGH_FREQUENCY_GAP_SECONDS", 30),
            arrival_window: reader.parse("PIPELINE_ARRIVAL_WINDOW", 5),
            default_alert_interval_minutes: reader.parse("PIPELINE_DEFAULT_ALERT_INTERVAL_MINUTES", 10),
            enable_rollup: env_flag("PIPELINE_ENABLE_ROLLUP", true),
            rollup_interval_seconds: reader.parse("PIPELINE_ROLLUP_INTERVAL_SECONDS", 1800),
            rollup_window_seconds: reader.parse("PIPELINE_ROLLUP_WINDOW_SECONDS", 1800),
            rollup_device_batch: reader.parse("PIPELINE_ROLLUP_DEVICE_BATCH", 500),
            status_reconcile_ms: reader.parse("PIPELINE_STATUS_RECONCILE_MS", 10_000),
            fallback_ip,
            otlp_endpoint: env_value("OTEL_EXPORTER_OTLP_ENDPOINT"),
        };

        if let Some(overrides) = overrides.as_ref() {
            apply_overrides(&mut config, overrides, |key| env_value(key).is_some());
        }
        if config.mqtt_topics.is_empty() {
            config.mqtt_topics = parse_topics(DEFAULT_TOPICS);
        }

        Ok((config, reader.warnings))
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs.max(5))
    }

    pub fn mqtt_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.mqtt_reconnect_ms.max(100))
    }

    pub fn reading_flush_interval(&self) -> Duration {
        Duration::from_millis(self.reading_flush_ms.max(1))
    }

    pub fn alert_flush_interval(&self) -> Duration {
        Duration::from_millis(self.alert_flush_ms.max(1))
    }

    pub fn rule_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.rule_refresh_ms.max(1))
    }

    pub fn rollup_interval(&self) -> Duration {
        Duration::from_secs(self.rollup_interval_seconds.max(1))
    }

    pub fn status_reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.status_reconcile_ms.max(1))
    }

    pub fn debounce_policy(&self) -> DebouncePolicy {
        DebouncePolicy {
            fast_interval: chrono::Duration::milliseconds(self.fast_persist_ms as i64),
            slow_interval: chrono::Duration::milliseconds(self.slow_persist_ms as i64),
            high_frequency_gap: chrono::Duration::seconds(self.high_frequency_gap_seconds as i64),
            arrival_window: self.arrival_window,
            offline_after: Duration::from_secs(self.offline_threshold_seconds.max(1)),
        }
    }
}

fn normalize_database_url(url: String) -> String {
    for prefix in ["postgresql+psycopg://", "postgresql+asyncpg://", "postgres+psycopg://"] {
        if let Some(stripped) = url.strip_prefix(prefix) {
            return format!("postgresql://{stripped}");
        }
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            database_url: "postgresql://localhost/telemetry".to_string(),
            db_pool_size: 10,
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_username: None,
            mqtt_password: None,
            mqtt_topics: parse_topics(DEFAULT_TOPICS),
            mqtt_keepalive_secs: 30,
            mqtt_client_id: "test".to_string(),
            mqtt_reconnect_ms: 5000,
            ingest_queue: 1024,
            reading_flush_ms: 1000,
            alert_flush_ms: 3000,
            rule_refresh_ms: 10_000,
            offline_threshold_seconds: 1800,
            fast_persist_ms: 1000,
            slow_persist_ms: 60_000,
            high_frequency_gap_seconds: 30,
            arrival_window: 5,
            default_alert_interval_minutes: 10,
            enable_rollup: true,
            rollup_interval_seconds: 1800,
            rollup_window_seconds: 1800,
            rollup_device_batch: 500,
            status_reconcile_ms: 10_000,
            fallback_ip: UNSPECIFIED_IP.to_string(),
            otlp_endpoint: None,
        }
    }

    #[test]
    fn topics_are_split_and_trimmed() {
        assert_eq!(
            parse_topics(" Sense/# , Elkem/Water/#,,"),
            vec!["Sense/#".to_string(), "Elkem/Water/#".to_string()]
        );
    }

    #[test]
    fn default_topics_cover_both_device_families() {
        assert_eq!(parse_topics(DEFAULT_TOPICS), vec!["Sense/#", "Elkem/Water/#"]);
    }

    #[test]
    fn unparseable_values_fall_back_and_are_reported() {
        let mut warnings = Vec::new();
        let port: u16 = parse_value("PIPELINE_MQTT_PORT", Some("18x3".to_string()), 1883, &mut warnings);
        assert_eq!(port, 1883);
        let size: u32 = parse_value("PIPELINE_DB_POOL_SIZE", Some("4".to_string()), 10, &mut warnings);
        assert_eq!(size, 4);
        let unset: u64 = parse_value("PIPELINE_ALERT_FLUSH_MS", None, 3000, &mut warnings);
        assert_eq!(unset, 3000);

        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("PIPELINE_MQTT_PORT"));
        assert!(warnings[0].contains("18x3"));
    }

    #[test]
    fn driver_prefixes_are_stripped() {
        assert_eq!(
            normalize_database_url("postgresql+asyncpg://u:p@db/app".to_string()),
            "postgresql://u:p@db/app"
        );
        assert_eq!(
            normalize_database_url("postgres://u@db/app".to_string()),
            "postgres://u@db/app"
        );
    }

    #[test]
    fn file_overrides_apply_only_where_env_is_unset() {
        let mut bytes = br#"{
            "mqtt_host": "broker.local",
            "mqtt_port": 8883,
            "mqtt_topics": ["Sense/#", " Elkem/Water/# "],
            "offline_threshold_seconds": 600,
            "enable_rollup": false
        }"#
        .to_vec();
        let overrides = parse_overrides(&mut bytes).expect("valid overrides");

        let mut config = base_config();
        apply_overrides(&mut config, &overrides, |key| key == "PIPELINE_MQTT_PORT");
        assert_eq!(config.mqtt_host, "broker.local");
        assert_eq!(config.mqtt_port, 1883);
        assert_eq!(config.mqtt_topics, vec!["Sense/#", "Elkem/Water/#"]);
        assert_eq!(config.offline_threshold_seconds, 600);
        assert!(!config.enable_rollup);
    }

    #[test]
    fn debounce_policy_reflects_config() {
        let mut config = base_config();
        config.slow_persist_ms = 30_000;
        let policy = config.debounce_policy();
        assert_eq!(policy.fast_interval, chrono::Duration::seconds(1));
        assert_eq!(policy.slow_interval, chrono::Duration::seconds(30));
        assert_eq!(policy.offline_after, Duration::from_secs(1800));
    }
}
