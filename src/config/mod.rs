pub mod commands;

use log::{debug, info};
use serde::{de, Deserialize, Deserializer};
use thiserror::Error;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::MeterProtocol;

/// Places searched when no config path is given on the command line
pub const CONFIG_SEARCH_PATHS: [&str; 2] = ["/data/options.json", "/etc/rtlamr2mqtt.yaml"];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("No config file found (searched {0})")]
    NotFound(String),
    #[error("Unable to read {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("Unsupported config format: {0}")]
    UnsupportedFormat(String),
    #[error("Invalid YAML: {0}")]
    Yaml(#[from] serde_yml::Error),
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn general_sleep_for_default() -> u64 { return 0 }
fn general_verbosity_default() -> String { return "info".to_string() }
fn general_device_id_default() -> String { return "single".to_string() }
fn general_rtltcp_server_default() -> String { return "127.0.0.1:1234".to_string() }
fn general_rtltcp_path_default() -> String { return "/usr/bin/rtl_tcp".to_string() }
fn general_rtlamr_path_default() -> String { return "/usr/bin/rtlamr".to_string() }
fn general_tuner_ready_timeout_default() -> u64 { return 10 }

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct GeneralConfig {
    /// Seconds to sleep between two complete cycles, 0 keeps listening
    #[serde(default="general_sleep_for_default")]
    pub sleep_for: u64,
    #[serde(default="general_verbosity_default")]
    pub verbosity: String,
    #[serde(default)]
    pub listen_only: bool,
    #[serde(default)]
    pub tickle_rtl_tcp: bool,
    /// `single` means let rtl_tcp pick the only dongle
    #[serde(default="general_device_id_default")]
    pub device_id: String,
    #[serde(default="general_rtltcp_server_default")]
    pub rtltcp_server: String,
    #[serde(default="general_rtltcp_path_default")]
    pub rtltcp_path: String,
    #[serde(default="general_rtlamr_path_default")]
    pub rtlamr_path: String,
    /// usbfs node (`/dev/bus/usb/001/004`) reset before rtl_tcp starts
    #[serde(default)]
    pub usb_reset: Option<String>,
    /// Seconds a cycle may wait for missing meters, 0 waits forever
    #[serde(default)]
    pub cycle_timeout: u64,
    #[serde(default="general_tuner_ready_timeout_default")]
    pub tuner_ready_timeout: u64,
    /// Message types reported in listen only mode, defaults to all
    #[serde(default)]
    pub msgtype: Option<String>,
}

fn mqtt_host_default() -> String { return "localhost".to_string() }
fn mqtt_port_default() -> u16 { return 1883 }
fn mqtt_tls_ca_default() -> String { return "/etc/ssl/certs/ca-certificates.crt".to_string() }
fn mqtt_base_topic_default() -> String { return "rtlamr".to_string() }
fn mqtt_ha_autodiscovery_default() -> bool { return true }
fn mqtt_ha_autodiscovery_topic_default() -> String { return "homeassistant".to_string() }
fn mqtt_qos_default() -> u8 { return 1 }
fn mqtt_keep_alive_default() -> u64 { return 30 }
fn mqtt_connect_timeout_default() -> u64 { return 10 }

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct MqttConfig {
    #[serde(default="mqtt_host_default")]
    pub host: String,
    #[serde(default="mqtt_port_default")]
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub tls_enabled: bool,
    #[serde(default="mqtt_tls_ca_default")]
    pub tls_ca: String,
    #[serde(default)]
    pub tls_cert: Option<String>,
    #[serde(default)]
    pub tls_keyfile: Option<String>,
    /// Accept any server certificate, for self signed brokers
    #[serde(default)]
    pub tls_insecure: bool,
    #[serde(default="mqtt_base_topic_default")]
    pub base_topic: String,
    #[serde(default="mqtt_ha_autodiscovery_default")]
    pub ha_autodiscovery: bool,
    #[serde(default="mqtt_ha_autodiscovery_topic_default")]
    pub ha_autodiscovery_topic: String,
    #[serde(default="mqtt_qos_default")]
    pub qos: u8,
    #[serde(default)]
    pub state_retain: bool,
    #[serde(default="mqtt_keep_alive_default")]
    pub keep_alive: u64,
    #[serde(default="mqtt_connect_timeout_default")]
    pub connect_timeout: u64,
}

impl MqttConfig {
    pub fn availability_topic(&self) -> String {
        return format!("{}/status", self.base_topic);
    }

    pub fn state_topic(&self, meter_id: &str) -> String {
        return format!("{}/{}/state", self.base_topic, meter_id);
    }

    pub fn discovery_topic(&self, meter_id: &str) -> String {
        return format!("{}/sensor/{}_{}/config", self.ha_autodiscovery_topic, self.base_topic, meter_id);
    }
}

fn custom_rtltcp_default() -> String { return "-s 2048000".to_string() }
fn custom_rtlamr_default() -> String { return "-unique=true".to_string() }

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct CustomParameters {
    #[serde(default="custom_rtltcp_default")]
    pub rtltcp: String,
    #[serde(default="custom_rtlamr_default")]
    pub rtlamr: String,
}

fn restart_initial_delay_default() -> u64 { return 2 }
fn restart_max_delay_default() -> u64 { return 60 }
fn restart_max_failures_default() -> u32 { return 5 }
fn restart_failure_window_default() -> u64 { return 300 }
fn restart_stop_timeout_default() -> u64 { return 5 }

/// How crashed subprocesses are brought back
#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RestartConfig {
    #[serde(default="restart_initial_delay_default")]
    pub initial_delay: u64,
    #[serde(default="restart_max_delay_default")]
    pub max_delay: u64,
    /// Failures inside `failure_window` that make a crash fatal
    #[serde(default="restart_max_failures_default")]
    pub max_failures: u32,
    #[serde(default="restart_failure_window_default")]
    pub failure_window: u64,
    #[serde(default="restart_stop_timeout_default")]
    pub stop_timeout: u64,
}

impl RestartConfig {
    pub fn initial_delay(&self) -> Duration {
        return Duration::from_secs(self.initial_delay);
    }

    pub fn max_delay(&self) -> Duration {
        return Duration::from_secs(self.max_delay);
    }

    pub fn failure_window(&self) -> Duration {
        return Duration::from_secs(self.failure_window);
    }

    pub fn stop_timeout(&self) -> Duration {
        return Duration::from_secs(self.stop_timeout);
    }
}

/// rtlamr prints ids as plain numbers, so numeric ids are normalized to that form
fn meter_id_from_any<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum AnyId {
        Number(u64),
        Text(String),
    }

    return match AnyId::deserialize(deserializer)? {
        AnyId::Number(n) => Ok(n.to_string()),
        AnyId::Text(s) => Ok(normalize_meter_id(&s)),
    };
}

pub fn normalize_meter_id(id: &str) -> String {
    let id = id.trim();
    match id.parse::<u64>() {
        Ok(n) => n.to_string(),
        Err(_) => id.to_string(),
    }
}

fn protocol_from_str<'de, D: Deserializer<'de>>(deserializer: D) -> Result<MeterProtocol, D::Error> {
    let s = String::deserialize(deserializer)?;
    return MeterProtocol::from_str(&s).ok_or_else(|| de::Error::custom(format!("unknown protocol '{s}'")));
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MeterConfig {
    #[serde(deserialize_with="meter_id_from_any")]
    pub id: String,
    #[serde(deserialize_with="protocol_from_str")]
    pub protocol: MeterProtocol,
    pub name: String,
    /// Digit mask like `#####.###`
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub unit_of_measurement: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub device_class: Option<String>,
    #[serde(default)]
    pub state_class: Option<String>,
}

fn general_default() -> GeneralConfig {
    return GeneralConfig {
        sleep_for: general_sleep_for_default(),
        verbosity: general_verbosity_default(),
        listen_only: false,
        tickle_rtl_tcp: false,
        device_id: general_device_id_default(),
        rtltcp_server: general_rtltcp_server_default(),
        rtltcp_path: general_rtltcp_path_default(),
        rtlamr_path: general_rtlamr_path_default(),
        usb_reset: None,
        cycle_timeout: 0,
        tuner_ready_timeout: general_tuner_ready_timeout_default(),
        msgtype: None,
    }
}

fn mqtt_default() -> MqttConfig {
    return MqttConfig {
        host: mqtt_host_default(),
        port: mqtt_port_default(),
        user: None,
        password: None,
        client_id: None,
        tls_enabled: false,
        tls_ca: mqtt_tls_ca_default(),
        tls_cert: None,
        tls_keyfile: None,
        tls_insecure: false,
        base_topic: mqtt_base_topic_default(),
        ha_autodiscovery: mqtt_ha_autodiscovery_default(),
        ha_autodiscovery_topic: mqtt_ha_autodiscovery_topic_default(),
        qos: mqtt_qos_default(),
        state_retain: false,
        keep_alive: mqtt_keep_alive_default(),
        connect_timeout: mqtt_connect_timeout_default(),
    }
}

fn custom_parameters_default() -> CustomParameters {
    return CustomParameters { rtltcp: custom_rtltcp_default(), rtlamr: custom_rtlamr_default() }
}

fn restart_default() -> RestartConfig {
    return RestartConfig {
        initial_delay: restart_initial_delay_default(),
        max_delay: restart_max_delay_default(),
        max_failures: restart_max_failures_default(),
        failure_window: restart_failure_window_default(),
        stop_timeout: restart_stop_timeout_default(),
    }
}

fn meters_default() -> Vec<MeterConfig> { return Vec::new() }

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default="general_default")]
    pub general: GeneralConfig,
    #[serde(default="mqtt_default")]
    pub mqtt: MqttConfig,
    #[serde(default="custom_parameters_default")]
    pub custom_parameters: CustomParameters,
    #[serde(default="restart_default")]
    pub restart: RestartConfig,
    #[serde(default="meters_default")]
    pub meters: Vec<MeterConfig>,
}

/// Switches taken from the environment, applied on top of the config file
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub listen_only: bool,
    pub msgtype: Option<String>,
    pub device_id: Option<String>,
    pub rtltcp_args: Option<String>,
    pub rtlamr_args: Option<String>,
    pub rtltcp_server: Option<String>,
}

fn is_truthy(value: &str) -> bool {
    return matches!(value.trim().to_lowercase().as_str(), "yes" | "true" | "1" | "on");
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        return Self::from_lookup(|key| std::env::var(key).ok());
    }

    pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        return EnvOverrides {
            listen_only: lookup("LISTEN_ONLY").map(|v| is_truthy(&v)).unwrap_or(false),
            msgtype: non_empty("msgtype"),
            device_id: non_empty("DEVICE_ID"),
            rtltcp_args: non_empty("RTLTCP_ARGS"),
            rtlamr_args: non_empty("RTLAMR_ARGS"),
            rtltcp_server: non_empty("RTLTCP_SERVER"),
        }
    }
}

impl Config {
    /// Loads, overrides and validates the configuration.
    ///
    /// With `LISTEN_ONLY` set no file is read at all, the defaults plus the
    /// environment are enough to start the decoder.
    pub fn load(path: Option<&Path>, env: &EnvOverrides) -> Result<Self, ConfigError> {
        let mut config = if env.listen_only {
            info!("Listen only mode requested by environment, not reading any config file");
            Config::defaults()
        } else {
            let path = match path {
                Some(p) => p.to_path_buf(),
                None => Self::find_config_file()?,
            };
            info!("Using config: {}", path.display());
            Self::from_file(&path)?
        };

        config.apply_overrides(env);
        config.validate()?;
        return Ok(config);
    }

    pub fn defaults() -> Self {
        return Config {
            general: general_default(),
            mqtt: mqtt_default(),
            custom_parameters: custom_parameters_default(),
            restart: restart_default(),
            meters: meters_default(),
        }
    }

    fn find_config_file() -> Result<PathBuf, ConfigError> {
        for candidate in CONFIG_SEARCH_PATHS {
            let p = Path::new(candidate);
            if p.exists() {
                return Ok(p.to_path_buf());
            }
            debug!("No config at {candidate}");
        }
        return Err(ConfigError::NotFound(CONFIG_SEARCH_PATHS.join(", ")));
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;

        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("").to_lowercase();
        return match extension.as_str() {
            "yaml" | "yml" => Ok(serde_yml::from_str(&contents)?),
            "json" | "js" => Ok(serde_json::from_str(&contents)?),
            _ => Err(ConfigError::UnsupportedFormat(path.display().to_string())),
        };
    }

    pub fn apply_overrides(&mut self, env: &EnvOverrides) {
        if env.listen_only {
            self.general.listen_only = true;
        }
        if let Some(msgtype) = &env.msgtype {
            self.general.msgtype = Some(msgtype.clone());
        }
        if let Some(device_id) = &env.device_id {
            self.general.device_id = device_id.clone();
        }
        if let Some(args) = &env.rtltcp_args {
            self.custom_parameters.rtltcp = args.clone();
        }
        if let Some(args) = &env.rtlamr_args {
            self.custom_parameters.rtlamr = args.clone();
        }
        if let Some(server) = &env.rtltcp_server {
            self.general.rtltcp_server = server.clone();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.general.rtltcp_address()?;

        if !self.general.listen_only && self.meters.is_empty() {
            return Err(ConfigError::Invalid("no meters configured".to_string()));
        }

        /* Cycles, topics and discovery are keyed by id alone */
        let mut seen = HashSet::new();
        for meter in &self.meters {
            if meter.id.is_empty() {
                return Err(ConfigError::Invalid(format!("meter '{}' has an empty id", meter.name)));
            }
            if !seen.insert(meter.id.clone()) {
                return Err(ConfigError::Invalid(format!("meter id {} ({}) configured more than once",
                                                        meter.id, meter.protocol.to_string())));
            }
            if let Some(mask) = &meter.format {
                validate_mask(mask).map_err(|e| ConfigError::Invalid(format!("meter {}: {e}", meter.id)))?;
            }
        }

        if self.mqtt.qos > 2 {
            return Err(ConfigError::Invalid(format!("mqtt qos {} out of range", self.mqtt.qos)));
        }
        if self.mqtt.tls_cert.is_some() != self.mqtt.tls_keyfile.is_some() {
            return Err(ConfigError::Invalid("tls_cert and tls_keyfile must be set together".to_string()));
        }
        if self.restart.max_failures == 0 {
            return Err(ConfigError::Invalid("restart.max_failures must be at least 1".to_string()));
        }

        return Ok(());
    }

    pub fn is_listen_only(&self) -> bool {
        return self.general.listen_only;
    }
}

impl GeneralConfig {
    /// Splits `rtltcp_server` into host and port
    pub fn rtltcp_address(&self) -> Result<(String, u16), ConfigError> {
        let invalid = || ConfigError::Invalid(format!("rtltcp_server '{}' is not host:port", self.rtltcp_server));
        let (host, port) = self.rtltcp_server.rsplit_once(':').ok_or_else(invalid)?;
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        if host.is_empty() {
            return Err(invalid());
        }
        return Ok((host.to_string(), port));
    }

    /// A remote rtl_tcp means we must not start our own tuner process
    pub fn rtltcp_is_local(&self) -> bool {
        return match self.rtltcp_address() {
            Ok((host, _)) => matches!(host.as_str(), "127.0.0.1" | "localhost" | "0.0.0.0" | "[::1]"),
            Err(_) => false,
        };
    }

    pub fn sleep_for(&self) -> Option<Duration> {
        if self.sleep_for == 0 {
            return None;
        }
        return Some(Duration::from_secs(self.sleep_for));
    }

    pub fn cycle_timeout(&self) -> Option<Duration> {
        if self.cycle_timeout == 0 {
            return None;
        }
        return Some(Duration::from_secs(self.cycle_timeout));
    }
}

fn validate_mask(mask: &str) -> Result<(), String> {
    if !mask.contains('#') {
        return Err(format!("format '{mask}' has no digit placeholder"));
    }
    if mask.matches('.').count() > 1 {
        return Err(format!("format '{mask}' has more than one decimal point"));
    }
    if let Some(c) = mask.chars().find(|c| *c != '#' && *c != '.') {
        return Err(format!("format '{mask}' contains unsupported character '{c}'"));
    }
    return Ok(());
}
