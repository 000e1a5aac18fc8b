//! Startup configuration.
//!
//! Everything is read once from CLI flags (falling back to environment variables) into [`Settings`],
//! then checked by [`Settings::validate`] into the typed configs each component is constructed with.

use std::{fmt, time::Duration};

use clap::Parser;
use rumqttc::{mqttbytes::valid_topic, MqttOptions};
use serde::{Deserialize, Serialize};

use crate::{modbus::UnitId, ConfigError};

#[derive(Parser, Debug, Clone)]
#[clap(
    name = "panel-bridge",
    version,
    author,
    about = "Drives solar panel outputs over Modbus TCP from MQTT commands"
)]
pub struct Settings {
    /// Modbus TCP host of the panel controller
    #[clap(long, env = "MODBUS_HOST")]
    pub modbus_host: Option<String>,

    #[clap(long, env = "MODBUS_PORT", default_value_t = 502)]
    pub modbus_port: u16,

    #[clap(long, env = "MODBUS_UNIT_ID", default_value_t = 1)]
    pub modbus_unit_id: UnitId,

    /// Upper bound for a single connect or write, e.g. "3s" or "500ms"
    #[clap(long, env = "MODBUS_TIMEOUT", default_value = "3s", value_parser = humantime::parse_duration)]
    pub modbus_timeout: Duration,

    #[clap(long, env = "MQTT_HOST")]
    pub mqtt_host: Option<String>,

    #[clap(long, env = "MQTT_PORT", default_value_t = 1883)]
    pub mqtt_port: u16,

    #[clap(long, env = "MQTT_USER", default_value = env!("CARGO_PKG_NAME"))]
    pub mqtt_user: String,

    #[clap(long, env = "MQTT_PASSWORD", hide_env_values = true)]
    pub mqtt_password: Option<String>,

    /// Commands are read from `<prefix>/command`, outcomes go to `<prefix>/status`
    #[clap(long, env = "MQTT_TOPIC_PREFIX", default_value = "solar_control")]
    pub mqtt_topic_prefix: String,

    #[clap(long, env = "MQTT_KEEP_ALIVE", default_value = "5s", value_parser = humantime::parse_duration)]
    pub mqtt_keep_alive: Duration,

    #[clap(long, env = "PANEL_COUNT", default_value_t = 4)]
    pub panel_count: u16,

    #[clap(long, env = "PANEL_MAX_POWER", default_value_t = 100)]
    pub panel_max_power: u16,

    #[clap(long, env = "PANEL_CONTROL_MODE", value_enum, default_value_t = ControlMode::Binary)]
    pub panel_control_mode: ControlMode,

    #[clap(long, env = "PANEL_BASE_COIL_ADDRESS", default_value_t = 0)]
    pub panel_base_coil_address: u16,

    #[clap(long, env = "PANEL_BASE_REGISTER_ADDRESS", default_value_t = 0)]
    pub panel_base_register_address: u16,

    /// Clamp out-of-range power levels into 0..=max instead of rejecting them
    #[clap(long, env = "PANEL_CLAMP_POWER")]
    pub panel_clamp_power: bool,

    #[clap(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Validated configuration, one part per component.
#[derive(Debug, Clone)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub panels: PanelConfig,
    pub mqtt: MqttConfig,
    pub log_level: tracing::Level,
}

impl Settings {
    pub fn validate(self) -> Result<Config, ConfigError> {
        let modbus_host = required("modbus_host", self.modbus_host)?;
        let mqtt_host = required("mqtt_host", self.mqtt_host)?;
        let mqtt_password = required("mqtt_password", self.mqtt_password)?;

        // Unit 0 is broadcast, which never answers a write.
        if self.modbus_unit_id == 0 {
            return Err(invalid("modbus_unit_id", "unit 0 is the broadcast address"));
        }
        if self.modbus_timeout.is_zero() {
            return Err(invalid("modbus_timeout", "must be greater than zero"));
        }
        if self.panel_count == 0 {
            return Err(invalid("panel_count", "at least one panel is required"));
        }
        if self.mqtt_topic_prefix.is_empty()
            || !valid_topic(&self.mqtt_topic_prefix)
            || self.mqtt_topic_prefix.contains(['+', '#'])
        {
            return Err(invalid("mqtt_topic_prefix", "not a valid topic"));
        }

        let log_level = self
            .log_level
            .parse()
            .map_err(|_| invalid("log_level", format!("unknown level {:?}", self.log_level)))?;

        Ok(Config {
            connection: ConnectionConfig {
                host: modbus_host,
                port: self.modbus_port,
                unit_id: self.modbus_unit_id,
                timeout: self.modbus_timeout,
            },
            panels: PanelConfig {
                count: self.panel_count,
                max_power: self.panel_max_power,
                control_mode: self.panel_control_mode,
                base_coil_address: self.panel_base_coil_address,
                base_register_address: self.panel_base_register_address,
                clamp_power: self.panel_clamp_power,
            },
            mqtt: MqttConfig {
                host: mqtt_host,
                port: self.mqtt_port,
                user: self.mqtt_user,
                password: mqtt_password,
                topic_prefix: self.mqtt_topic_prefix,
                keep_alive: self.mqtt_keep_alive,
            },
            log_level,
        })
    }
}

fn required(name: &'static str, value: Option<String>) -> Result<String, ConfigError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::Missing(name)),
    }
}

fn invalid(name: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        name,
        reason: reason.into(),
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub unit_id: UnitId,
    pub timeout: Duration,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_modbus_port(),
            unit_id: 1,
            timeout: Duration::from_secs(3),
        }
    }

    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub(crate) fn default_modbus_port() -> u16 {
    502
}

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum ControlMode {
    /// One coil per panel, on or off
    #[default]
    Binary,
    /// One holding register per panel carrying a power level
    Variable,
}

impl fmt::Display for ControlMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlMode::Binary => f.write_str("binary"),
            ControlMode::Variable => f.write_str("variable"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PanelConfig {
    pub count: u16,
    pub max_power: u16,
    pub control_mode: ControlMode,
    pub base_coil_address: u16,
    pub base_register_address: u16,
    pub clamp_power: bool,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            count: 4,
            max_power: 100,
            control_mode: ControlMode::Binary,
            base_coil_address: 0,
            base_register_address: 0,
            clamp_power: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub topic_prefix: String,
    pub keep_alive: Duration,
}

impl MqttConfig {
    pub fn topic(&self, suffix: &str) -> String {
        format!("{}/{}", self.topic_prefix, suffix)
    }

    pub fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(env!("CARGO_PKG_NAME"), self.host.as_str(), self.port);
        options.set_credentials(self.user.as_str(), self.password.as_str());
        options.set_keep_alive(self.keep_alive);
        options
    }
}
