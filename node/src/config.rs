use anyhow::{Context, Result};
use config::{Config, File as ConfigFile};
use relay_circuit::RelayConfig;
use relay_p2p::{default_listen_address, Multiaddr, NodeConfig, DEFAULT_PORT};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::version::agent_version;

const DEFAULT_CONFIG_PATH: &str = "config/relay.toml";
const ENV_PREFIX: &str = "RELAY";

/// Process configuration: TOML file, then `RELAY_*` environment, then CLI.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub config_path: Option<PathBuf>,

    // Identity
    /// Serialized identity JSON, as printed by `relay-node keygen`.
    pub peer_id: Option<String>,
    pub identity_file: Option<PathBuf>,

    // Network
    pub port: u16,
    pub listen: Vec<Multiaddr>,
    pub announce: Vec<Multiaddr>,
    pub enable_tcp: bool,
    pub enable_websocket: bool,
    pub handshake_timeout_secs: u64,
    pub idle_connection_timeout_secs: u64,

    // Relay
    pub max_reservations: usize,
    pub reservation_ttl_secs: u64,
    pub enforce_transfer_limit: bool,
    pub max_circuit_bytes: u64,
    pub max_circuit_duration_secs: u64,

    // Logging
    pub log_level: String,
    pub log_format: String,
}

impl AppConfig {
    pub fn load(config_path_override: Option<&str>) -> Result<Self> {
        Self::load_from(
            config_path_override,
            config::Environment::with_prefix(ENV_PREFIX),
            std::env::var("PORT").ok(),
        )
    }

    /// `legacy_port` is the unprefixed `PORT` variable older deployments set.
    pub(crate) fn load_from(
        config_path_override: Option<&str>,
        environment: config::Environment,
        legacy_port: Option<String>,
    ) -> Result<Self> {
        let resolved_path = if let Some(path) = config_path_override {
            let path = PathBuf::from(path);
            if !path.exists() {
                anyhow::bail!(
                    "Configuration file {} not found (specified via --config)",
                    path.display()
                );
            }
            Some(path)
        } else {
            let path = PathBuf::from(DEFAULT_CONFIG_PATH);
            if path.exists() {
                Some(path)
            } else {
                None
            }
        };

        let mut builder = Config::builder();
        if let Some(path) = &resolved_path {
            builder = builder.add_source(ConfigFile::from(path.as_path()));
        }
        builder = builder.add_source(environment);
        let config = builder.build()?;

        let relay_defaults = RelayConfig::default();

        let port = match get_string_value(&config, &["port", "network.port"]).or(legacy_port) {
            Some(raw) => raw
                .trim()
                .parse::<u16>()
                .with_context(|| format!("invalid port `{raw}`"))?,
            None => DEFAULT_PORT,
        };

        let mut listen = parse_multiaddrs(&get_list(&config, &["listen", "network.listen"]), "listen");
        if listen.is_empty() {
            listen.push(default_listen_address(port));
        }
        let announce = parse_multiaddrs(
            &get_list(&config, &["announce", "network.announce"]),
            "announce",
        );

        Ok(Self {
            config_path: resolved_path,
            peer_id: get_string_value(&config, &["peer_id", "identity.peer_id"]),
            identity_file: get_string_value(&config, &["identity_file", "identity.file"])
                .map(PathBuf::from),
            port,
            listen,
            announce,
            enable_tcp: get_bool_value(&config, &["enable_tcp", "network.enable_tcp"], true),
            enable_websocket: get_bool_value(
                &config,
                &["enable_websocket", "network.enable_websocket"],
                true,
            ),
            handshake_timeout_secs: get_u64_value(
                &config,
                &["handshake_timeout_secs", "network.handshake_timeout_secs"],
                10,
            ),
            idle_connection_timeout_secs: get_u64_value(
                &config,
                &[
                    "idle_connection_timeout_secs",
                    "network.idle_connection_timeout_secs",
                ],
                60,
            ),
            max_reservations: get_u64_value(
                &config,
                &["max_reservations", "relay.max_reservations"],
                relay_defaults.max_reservations as u64,
            ) as usize,
            reservation_ttl_secs: get_u64_value(
                &config,
                &["reservation_ttl_secs", "relay.reservation_ttl_secs"],
                relay_defaults.reservation_ttl.as_secs(),
            ),
            enforce_transfer_limit: get_bool_value(
                &config,
                &["enforce_transfer_limit", "relay.enforce_transfer_limit"],
                relay_defaults.enforce_transfer_limit,
            ),
            max_circuit_bytes: get_u64_value(
                &config,
                &["max_circuit_bytes", "relay.max_circuit_bytes"],
                relay_defaults.max_circuit_bytes,
            ),
            max_circuit_duration_secs: get_u64_value(
                &config,
                &["max_circuit_duration_secs", "relay.max_circuit_duration_secs"],
                relay_defaults.max_circuit_duration.as_secs(),
            ),
            log_level: get_string_value(&config, &["log_level", "log.level"])
                .unwrap_or_else(|| "info".to_string()),
            log_format: get_string_value(&config, &["log_format", "log.format"])
                .unwrap_or_else(|| "pretty".to_string()),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_reservations == 0 {
            anyhow::bail!("MAX_RESERVATIONS must be greater than zero");
        }
        if self.reservation_ttl_secs == 0 {
            anyhow::bail!("RESERVATION_TTL_SECS must be greater than zero");
        }
        if self.listen.is_empty() {
            anyhow::bail!("At least one listen address is required");
        }
        if !self.enable_tcp && !self.enable_websocket {
            anyhow::bail!("At least one of ENABLE_TCP or ENABLE_WEBSOCKET must be set");
        }
        if self.enforce_transfer_limit && self.max_circuit_duration_secs == 0 {
            anyhow::bail!("MAX_CIRCUIT_DURATION_SECS must be greater than zero when limits are enforced");
        }
        Ok(())
    }

    /// Re-point every listen address still on the default port at `port`.
    pub fn set_port(&mut self, port: u16) {
        let previous = default_listen_address(self.port);
        for address in &mut self.listen {
            if *address == previous {
                *address = default_listen_address(port);
            }
        }
        self.port = port;
    }

    pub fn node_config(&self) -> NodeConfig {
        let defaults = NodeConfig::default();
        let mut transports = defaults.transports.clone();
        transports.tcp = self.enable_tcp;
        transports.websocket = self.enable_websocket;
        transports.handshake_timeout = Duration::from_secs(self.handshake_timeout_secs);

        NodeConfig {
            listen: self.listen.clone(),
            announce: self.announce.clone(),
            transports,
            relay: RelayConfig {
                max_reservations: self.max_reservations,
                reservation_ttl: Duration::from_secs(self.reservation_ttl_secs),
                enforce_transfer_limit: self.enforce_transfer_limit,
                max_circuit_bytes: self.max_circuit_bytes,
                max_circuit_duration: Duration::from_secs(self.max_circuit_duration_secs),
                ..RelayConfig::default()
            },
            agent_version: agent_version(),
            idle_connection_timeout: Duration::from_secs(self.idle_connection_timeout_secs),
            ..defaults
        }
    }
}

fn get_string_value(config: &Config, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        config
            .get_string(key)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

fn get_bool_value(config: &Config, keys: &[&str], default: bool) -> bool {
    for key in keys {
        if let Ok(value) = config.get_bool(key) {
            return value;
        }
        if let Ok(raw) = config.get_string(key) {
            if let Ok(parsed) = raw.parse::<bool>() {
                return parsed;
            }
        }
    }
    default
}

fn get_u64_value(config: &Config, keys: &[&str], default: u64) -> u64 {
    for key in keys {
        if let Ok(value) = config.get_int(key) {
            if let Ok(value) = u64::try_from(value) {
                return value;
            }
            warn!("Ignoring negative value for {}", key);
        }
    }
    default
}

/// A list from either a TOML array or a comma separated environment value.
fn get_list(config: &Config, keys: &[&str]) -> Vec<String> {
    for key in keys {
        if let Ok(values) = config.get_array(key) {
            return values
                .into_iter()
                .filter_map(|value| value.into_string().ok())
                .collect();
        }
        if let Some(raw) = get_string_value(config, &[key]) {
            return raw.split(',').map(|value| value.trim().to_string()).collect();
        }
    }
    Vec::new()
}

pub fn parse_multiaddrs(values: &[String], label: &str) -> Vec<Multiaddr> {
    values
        .iter()
        .filter_map(|value| {
            if value.is_empty() {
                return None;
            }
            match Multiaddr::from_str(value) {
                Ok(addr) => Some(addr),
                Err(err) => {
                    warn!("Invalid {} multiaddr {}: {}", label, value, err);
                    None
                }
            }
        })
        .collect()
}

pub fn resolve_config_path(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(vars: &[(&str, &str)]) -> config::Environment {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        config::Environment::with_prefix(ENV_PREFIX).source(Some(vars))
    }

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn empty_file_yields_defaults() {
        let file = write_config("");
        let config = AppConfig::load_from(file.path().to_str(), env(&[]), None).unwrap();

        assert_eq!(config.port, 9001);
        assert_eq!(
            config.listen,
            vec!["/ip4/0.0.0.0/tcp/9001/ws".parse::<Multiaddr>().unwrap()]
        );
        assert!(config.announce.is_empty());
        assert_eq!(config.max_reservations, 50);
        assert_eq!(config.reservation_ttl_secs, 600);
        assert!(!config.enforce_transfer_limit);
        assert!(config.peer_id.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn file_values_are_loaded() {
        let file = write_config(
            r#"
announce = ["/dns4/relay.example.com/tcp/443/wss"]

[relay]
max_reservations = 8
reservation_ttl_secs = 120
enforce_transfer_limit = true

[log]
level = "debug"
format = "compact"
"#,
        );
        let config = AppConfig::load_from(file.path().to_str(), env(&[]), None).unwrap();

        assert_eq!(config.announce.len(), 1);
        assert_eq!(config.max_reservations, 8);
        assert_eq!(config.reservation_ttl_secs, 120);
        assert!(config.enforce_transfer_limit);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.log_format, "compact");

        let node = config.node_config();
        assert_eq!(node.relay.max_reservations, 8);
        assert!(node.relay.circuit_limit().is_some());
    }

    #[test]
    fn environment_overrides_file() {
        let file = write_config("[relay]\nmax_reservations = 8\n");
        let config = AppConfig::load_from(
            file.path().to_str(),
            env(&[
                ("RELAY_MAX_RESERVATIONS", "3"),
                ("RELAY_LISTEN", "/ip4/127.0.0.1/tcp/4001,/ip4/127.0.0.1/tcp/4002/ws"),
            ]),
            None,
        )
        .unwrap();

        assert_eq!(config.max_reservations, 3);
        assert_eq!(config.listen.len(), 2);
    }

    #[test]
    fn legacy_port_variable_sets_listen_port() {
        let file = write_config("");
        let config =
            AppConfig::load_from(file.path().to_str(), env(&[]), Some("4100".to_string())).unwrap();

        assert_eq!(config.port, 4100);
        assert_eq!(
            config.listen,
            vec!["/ip4/0.0.0.0/tcp/4100/ws".parse::<Multiaddr>().unwrap()]
        );
    }

    #[test]
    fn set_port_moves_default_listener_only() {
        let file = write_config("");
        let mut config = AppConfig::load_from(file.path().to_str(), env(&[]), None).unwrap();
        config.listen.push("/ip4/127.0.0.1/tcp/7000".parse().unwrap());

        config.set_port(9100);
        assert_eq!(config.listen[0], default_listen_address(9100));
        assert_eq!(config.listen[1], "/ip4/127.0.0.1/tcp/7000".parse::<Multiaddr>().unwrap());
    }

    #[test]
    fn zero_reservations_are_rejected() {
        let file = write_config("[relay]\nmax_reservations = 0\n");
        let config = AppConfig::load_from(file.path().to_str(), env(&[]), None).unwrap();

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("MAX_RESERVATIONS"), "unexpected error: {err}");
    }

    #[test]
    fn missing_explicit_config_file_is_an_error() {
        let err = AppConfig::load_from(Some("/nonexistent/relay.toml"), env(&[]), None).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
