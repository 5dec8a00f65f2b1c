use camino::Utf8PathBuf;
use mqtt_link::LinkConfig;
use mqtt_link::TlsSettings;
use std::time::Duration;

pub const DEFAULT_QUEUE_STORAGE_DIR: &str = "./edge/gateway/data";
pub const QUEUE_DB_FILE: &str = "gateway_queue.db";

/// Gateway runtime configuration.
///
/// Built once from the process environment at startup and read-only
/// afterwards; every component receives the settings it needs explicitly.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub gateway_id: String,

    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_use_tls: bool,
    pub mqtt_ca_cert: Option<Utf8PathBuf>,
    pub mqtt_client_cert: Option<Utf8PathBuf>,
    pub mqtt_client_key: Option<Utf8PathBuf>,
    pub mqtt_tls_insecure: bool,
    pub mqtt_backoff_base: Duration,
    pub mqtt_backoff_max: Duration,

    pub queue_db_path: Utf8PathBuf,

    pub enable_udp_source: bool,
    pub udp_listen_host: String,
    pub udp_listen_port: u16,

    pub enable_lora_source: bool,
    pub lora_force_simulation: bool,

    pub health_port: u16,
    pub log_level: String,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {key}: expected a number")]
    InvalidNumber { key: &'static str, value: String },

    #[error("Invalid value {value:?} for {key}: expected a non-negative duration in seconds")]
    InvalidDuration { key: &'static str, value: String },
}

impl GatewayConfig {
    /// Load the configuration from the process environment.
    pub fn from_env() -> Result<GatewayConfig, ConfigError> {
        GatewayConfig::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load the configuration from an arbitrary key lookup.
    ///
    /// `from_env` delegates here; tests provide a map instead of mutating
    /// the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<GatewayConfig, ConfigError> {
        let string = |key: &'static str, default: &str| -> String {
            lookup(key).unwrap_or_else(|| default.to_string())
        };
        let optional = |key: &'static str| -> Option<String> {
            lookup(key).filter(|value| !value.is_empty())
        };
        let flag = |key: &'static str, default: bool| -> bool {
            match lookup(key) {
                Some(value) => parse_bool(&value),
                None => default,
            }
        };

        let queue_db_path = match optional("QUEUE_DB_PATH") {
            Some(path) => Utf8PathBuf::from(path),
            None => {
                let dir = string("QUEUE_STORAGE_DIR", DEFAULT_QUEUE_STORAGE_DIR);
                Utf8PathBuf::from(dir).join(QUEUE_DB_FILE)
            }
        };

        Ok(GatewayConfig {
            gateway_id: string("GATEWAY_ID", "vineguard-gateway"),
            mqtt_host: string("MQTT_HOST", "localhost"),
            mqtt_port: parse_number(&lookup, "MQTT_PORT", 8883)?,
            mqtt_username: optional("MQTT_USERNAME"),
            mqtt_password: optional("MQTT_PASSWORD"),
            mqtt_use_tls: flag("MQTT_USE_TLS", true),
            mqtt_ca_cert: optional("MQTT_CA_CERT").map(Utf8PathBuf::from),
            mqtt_client_cert: optional("MQTT_CLIENT_CERT").map(Utf8PathBuf::from),
            mqtt_client_key: optional("MQTT_CLIENT_KEY").map(Utf8PathBuf::from),
            mqtt_tls_insecure: flag("MQTT_TLS_INSECURE", false),
            mqtt_backoff_base: parse_duration(&lookup, "MQTT_BACKOFF_BASE", 1.0)?,
            mqtt_backoff_max: parse_duration(&lookup, "MQTT_BACKOFF_MAX", 32.0)?,
            queue_db_path,
            enable_udp_source: flag("ENABLE_UDP_SOURCE", true),
            udp_listen_host: string("UDP_LISTEN_HOST", "0.0.0.0"),
            udp_listen_port: parse_number(&lookup, "UDP_LISTEN_PORT", 1700)?,
            enable_lora_source: flag("ENABLE_LORA_SOURCE", true),
            lora_force_simulation: flag("LORA_FORCE_SIMULATION", false),
            health_port: parse_number(&lookup, "HEALTH_PORT", 8080)?,
            log_level: string("LOG_LEVEL", "INFO"),
        })
    }

    /// The MQTT link settings derived from this configuration.
    pub fn link_config(&self) -> LinkConfig {
        let mut config = LinkConfig::default()
            .with_host(&self.mqtt_host)
            .with_port(self.mqtt_port)
            .with_client_id(&self.gateway_id)
            .with_backoff(self.mqtt_backoff_base, self.mqtt_backoff_max);

        if let Some(username) = &self.mqtt_username {
            let password = self.mqtt_password.clone().unwrap_or_default();
            config = config.with_credentials(username, password);
        }

        if self.mqtt_use_tls {
            config = config.with_tls(TlsSettings {
                ca_cert: self.mqtt_ca_cert.clone(),
                client_cert: self.mqtt_client_cert.clone(),
                client_key: self.mqtt_client_key.clone(),
                danger_accept_invalid_certs: self.mqtt_tls_insecure,
            });
        }

        config
    }
}

/// `{1, true, yes, on}` (any case) are true; everything else is false.
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_number<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { key, value }),
        None => Ok(default),
    }
}

fn parse_duration(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default_secs: f64,
) -> Result<Duration, ConfigError> {
    let secs = match lookup(key) {
        Some(value) => match value.trim().parse::<f64>() {
            Ok(secs) if secs.is_finite() && secs >= 0.0 => secs,
            _ => return Err(ConfigError::InvalidDuration { key, value }),
        },
        None => default_secs,
    };
    Ok(Duration::from_secs_f64(secs))
}
