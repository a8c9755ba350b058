//! Environment-driven configuration.
//!
//! All settings come from process environment variables with documented
//! defaults. Malformed values are collected and rejected at startup rather
//! than silently replaced.

use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Seconds to sleep between measurement cycles.
const DELAY_VAR: &str = "DELAY";
const INFLUX_HOST_VAR: &str = "INFLUXDB_HOST";
const INFLUX_PORT_VAR: &str = "INFLUXDB_PORT";
const INFLUX_DATABASE_VAR: &str = "INFLUXDB_DATABASE";
const INFLUX_MEASUREMENT_VAR: &str = "INFLUXDB_MEASUREMENT";
const INFLUX_USER_VAR: &str = "INFLUXDB_USR";
const INFLUX_PASSWORD_VAR: &str = "INFLUXDB_PWD";
const INFLUX_SSL_VAR: &str = "INFLUXDB_SSL";
const INFLUX_VERIFY_SSL_VAR: &str = "INFLUXDB_VERIFYSSL";
/// Comma-separated speed-test server ids; empty means auto-select.
const SERVERS_VAR: &str = "SPEEDTEST_SERVER";

/// A single rejected environment value.
#[derive(Debug, Error)]
pub enum EnvError {
    #[error("invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    #[error("value out of range for {var}: {value} (minimum {min})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
    },
}

/// Startup configuration failure carrying every rejected value.
#[derive(Debug, Error)]
#[error("rejected {} environment value(s)", .errors.len())]
pub struct ConfigError {
    pub errors: Vec<EnvError>,
}

/// Immutable process configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Sleep between measurement cycles.
    pub delay: Duration,
    /// Metrics sink connection parameters.
    pub influx: InfluxConfig,
    /// Explicit speed-test server ids, in order. Empty means one
    /// auto-selected test per cycle.
    pub servers: Vec<String>,
}

/// InfluxDB connection parameters.
#[derive(Debug, Clone)]
pub struct InfluxConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub measurement: String,
    pub username: String,
    pub password: String,
    pub ssl: bool,
    pub verify_ssl: bool,
}

impl InfluxConfig {
    /// Base URL of the InfluxDB HTTP API.
    pub fn base_url(&self) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&std::env::vars().collect())
    }

    /// Load configuration from an explicit variable map.
    ///
    /// A variable that is absent or set to the empty string takes its
    /// default. Malformed values are collected so every problem is reported
    /// in one pass.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut env = EnvReader::new(vars);

        let config = Config {
            delay: Duration::from_secs(env.get_u64(DELAY_VAR, 300, 1)),
            influx: InfluxConfig {
                host: env.get_string(INFLUX_HOST_VAR, "127.0.0.1"),
                port: env.get_u16(INFLUX_PORT_VAR, 8086),
                database: env.get_string(INFLUX_DATABASE_VAR, "speedtest"),
                measurement: env.get_string(INFLUX_MEASUREMENT_VAR, "speedtest"),
                username: env.get_string(INFLUX_USER_VAR, ""),
                password: env.get_string(INFLUX_PASSWORD_VAR, ""),
                ssl: env.get_bool(INFLUX_SSL_VAR, false),
                verify_ssl: env.get_bool(INFLUX_VERIFY_SSL_VAR, true),
            },
            servers: env.get_string_list(SERVERS_VAR),
        };

        if env.errors.is_empty() {
            Ok(config)
        } else {
            Err(ConfigError { errors: env.errors })
        }
    }
}

/// Typed reader over an environment variable map.
///
/// Collects errors during parsing so all issues can be reported at once.
struct EnvReader<'a> {
    vars: &'a HashMap<String, String>,
    errors: Vec<EnvError>,
}

impl<'a> EnvReader<'a> {
    fn new(vars: &'a HashMap<String, String>) -> Self {
        Self {
            vars,
            errors: Vec::new(),
        }
    }

    /// Raw value, with absent and empty treated the same.
    fn raw(&self, name: &str) -> Option<&'a str> {
        self.vars
            .get(name)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    fn get_string(&mut self, name: &str, default: &str) -> String {
        self.raw(name).unwrap_or(default).to_string()
    }

    fn get_u64(&mut self, name: &str, default: u64, min: u64) -> u64 {
        match self.raw(name) {
            Some(value) => match value.parse::<u64>() {
                Ok(n) if n >= min => n,
                Ok(n) => {
                    self.errors.push(EnvError::OutOfRange {
                        var: name.to_string(),
                        value: n.to_string(),
                        min: min.to_string(),
                    });
                    default
                }
                Err(_) => {
                    self.errors.push(EnvError::InvalidValue {
                        var: name.to_string(),
                        expected: "unsigned integer".to_string(),
                        value: value.to_string(),
                    });
                    default
                }
            },
            None => default,
        }
    }

    fn get_u16(&mut self, name: &str, default: u16) -> u16 {
        match self.raw(name) {
            Some(value) => match value.parse::<u16>() {
                Ok(n) => n,
                Err(_) => {
                    self.errors.push(EnvError::InvalidValue {
                        var: name.to_string(),
                        expected: "port number".to_string(),
                        value: value.to_string(),
                    });
                    default
                }
            },
            None => default,
        }
    }

    /// Accepts: 1, true, yes, on (for true)
    ///          0, false, no, off (for false)
    fn get_bool(&mut self, name: &str, default: bool) -> bool {
        match self.raw(name) {
            Some(value) => match value.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    self.errors.push(EnvError::InvalidValue {
                        var: name.to_string(),
                        expected: "boolean (true/false/1/0/yes/no)".to_string(),
                        value: value.to_string(),
                    });
                    default
                }
            },
            None => default,
        }
    }

    /// Comma-separated list; items are trimmed and empties dropped.
    fn get_string_list(&mut self, name: &str) -> Vec<String> {
        match self.raw(name) {
            Some(value) => value
                .split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = Config::from_vars(&HashMap::new()).unwrap();
        assert_eq!(config.delay, Duration::from_secs(300));
        assert_eq!(config.influx.host, "127.0.0.1");
        assert_eq!(config.influx.port, 8086);
        assert_eq!(config.influx.database, "speedtest");
        assert_eq!(config.influx.measurement, "speedtest");
        assert_eq!(config.influx.username, "");
        assert_eq!(config.influx.password, "");
        assert!(!config.influx.ssl);
        assert!(config.influx.verify_ssl);
        assert!(config.servers.is_empty());
    }

    #[test]
    fn defaults_apply_when_empty() {
        let config = Config::from_vars(&vars(&[
            (DELAY_VAR, ""),
            (INFLUX_HOST_VAR, ""),
            (INFLUX_SSL_VAR, ""),
            (SERVERS_VAR, ""),
        ]))
        .unwrap();
        assert_eq!(config.delay, Duration::from_secs(300));
        assert_eq!(config.influx.host, "127.0.0.1");
        assert!(!config.influx.ssl);
        assert!(config.servers.is_empty());
    }

    #[test]
    fn explicit_values_override_defaults() {
        let config = Config::from_vars(&vars(&[
            (DELAY_VAR, "60"),
            (INFLUX_HOST_VAR, "influx.lan"),
            (INFLUX_PORT_VAR, "9999"),
            (INFLUX_DATABASE_VAR, "netstats"),
            (INFLUX_MEASUREMENT_VAR, "wan"),
            (INFLUX_USER_VAR, "admin"),
            (INFLUX_PASSWORD_VAR, "secret"),
            (INFLUX_SSL_VAR, "true"),
            (INFLUX_VERIFY_SSL_VAR, "no"),
        ]))
        .unwrap();
        assert_eq!(config.delay, Duration::from_secs(60));
        assert_eq!(config.influx.host, "influx.lan");
        assert_eq!(config.influx.port, 9999);
        assert_eq!(config.influx.database, "netstats");
        assert_eq!(config.influx.measurement, "wan");
        assert_eq!(config.influx.username, "admin");
        assert_eq!(config.influx.password, "secret");
        assert!(config.influx.ssl);
        assert!(!config.influx.verify_ssl);
    }

    #[test]
    fn server_list_is_split_and_trimmed() {
        let config = Config::from_vars(&vars(&[(SERVERS_VAR, " 1234 , 5678 ,")])).unwrap();
        assert_eq!(config.servers, vec!["1234", "5678"]);
    }

    #[test]
    fn malformed_delay_is_rejected() {
        let err = Config::from_vars(&vars(&[(DELAY_VAR, "soon")])).unwrap_err();
        assert_eq!(err.errors.len(), 1);
        assert!(matches!(&err.errors[0], EnvError::InvalidValue { var, .. } if var == DELAY_VAR));
    }

    #[test]
    fn zero_delay_is_rejected() {
        let err = Config::from_vars(&vars(&[(DELAY_VAR, "0")])).unwrap_err();
        assert!(matches!(&err.errors[0], EnvError::OutOfRange { var, .. } if var == DELAY_VAR));
    }

    #[test]
    fn malformed_bool_is_rejected() {
        let err = Config::from_vars(&vars(&[(INFLUX_SSL_VAR, "maybe")])).unwrap_err();
        assert_eq!(err.errors.len(), 1);
    }

    #[test]
    fn malformed_port_is_rejected() {
        let err = Config::from_vars(&vars(&[(INFLUX_PORT_VAR, "70000")])).unwrap_err();
        assert_eq!(err.errors.len(), 1);
    }

    #[test]
    fn all_problems_are_collected() {
        let err = Config::from_vars(&vars(&[
            (DELAY_VAR, "x"),
            (INFLUX_PORT_VAR, "y"),
            (INFLUX_VERIFY_SSL_VAR, "z"),
        ]))
        .unwrap_err();
        assert_eq!(err.errors.len(), 3);
    }

    #[test]
    fn base_url_follows_ssl_flag() {
        let mut config = Config::from_vars(&HashMap::new()).unwrap();
        assert_eq!(config.influx.base_url(), "http://127.0.0.1:8086");
        config.influx.ssl = true;
        assert_eq!(config.influx.base_url(), "https://127.0.0.1:8086");
    }
}
