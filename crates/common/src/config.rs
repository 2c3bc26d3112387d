// Configuration structures for Tunnel Bridge
// Environment-style key/value settings, loaded once at process start

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::error::ConfigError;
use crate::network::{format_host_port, is_loopback_address, split_host_port};
use crate::types::ConnectRequest;

/// Local port the forwarded database stream is exposed on
pub const DEFAULT_RENDEZVOUS_PORT: u16 = 12345;

/// Default API listen address (loopback only)
pub const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1:3443";

const DEFAULT_SSH_PORT: u16 = 22;
const DEFAULT_MYSQL_PORT: u16 = 3306;
const DEFAULT_MYSQL_HOST: &str = "127.0.0.1";

/// How unknown or changed SSH host keys are treated
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// Only hosts already in known_hosts are accepted
    Strict,
    /// Unknown hosts are recorded on first use, changed keys are rejected
    #[default]
    AcceptNew,
    /// Every host key is accepted without verification
    AcceptAny,
}

impl FromStr for HostKeyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(HostKeyPolicy::Strict),
            "accept-new" | "accept_new" => Ok(HostKeyPolicy::AcceptNew),
            "accept-any" | "accept_any" | "none" => Ok(HostKeyPolicy::AcceptAny),
            other => Err(format!(
                "unknown policy '{}', expected strict, accept-new or accept-any",
                other
            )),
        }
    }
}

/// Credentials presented to the SSH server
#[derive(Clone)]
pub enum SshCredentials {
    Password(Zeroizing<String>),
    Key {
        path: PathBuf,
        passphrase: Option<Zeroizing<String>>,
    },
}

impl fmt::Debug for SshCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SshCredentials::Password(_) => f.write_str("Password(<redacted>)"),
            SshCredentials::Key { path, passphrase } => f
                .debug_struct("Key")
                .field("path", path)
                .field("has_passphrase", &passphrase.is_some())
                .finish(),
        }
    }
}

/// Fully resolved SSH endpoint
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credentials: SshCredentials,
}

impl SshTarget {
    pub fn endpoint(&self) -> String {
        format_host_port(&self.host, self.port)
    }
}

/// Fully resolved database endpoint, as reachable from the SSH server
#[derive(Clone)]
pub struct DatabaseTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Zeroizing<String>,
    pub database: Option<String>,
}

impl fmt::Debug for DatabaseTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("database", &self.database)
            .finish()
    }
}

/// Everything a tunnel connect needs
#[derive(Debug, Clone)]
pub struct TunnelTarget {
    pub ssh: SshTarget,
    pub database: DatabaseTarget,
}

/// Tunnel defaults from the environment; any field may be overridden per connect
#[derive(Clone, Default)]
pub struct TunnelSettings {
    pub ssh_host: Option<String>,
    pub ssh_port: Option<u16>,
    pub ssh_username: Option<String>,
    pub ssh_password: Option<Zeroizing<String>>,
    pub ssh_key_path: Option<PathBuf>,
    pub ssh_key_passphrase: Option<Zeroizing<String>>,
    pub mysql_host: Option<String>,
    pub mysql_port: Option<u16>,
    pub mysql_user: Option<String>,
    pub mysql_password: Option<Zeroizing<String>>,
    pub mysql_database: Option<String>,
}

impl fmt::Debug for TunnelSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelSettings")
            .field("ssh_host", &self.ssh_host)
            .field("ssh_port", &self.ssh_port)
            .field("ssh_username", &self.ssh_username)
            .field("has_ssh_password", &self.ssh_password.is_some())
            .field("ssh_key_path", &self.ssh_key_path)
            .field("mysql_host", &self.mysql_host)
            .field("mysql_port", &self.mysql_port)
            .field("mysql_user", &self.mysql_user)
            .field("mysql_database", &self.mysql_database)
            .finish()
    }
}

impl TunnelSettings {
    /// Merge per-request overrides over the environment defaults
    pub fn resolve(&self, request: &ConnectRequest) -> Result<TunnelTarget, ConfigError> {
        let host = pick(&request.ssh_host, &self.ssh_host).ok_or(ConfigError::Missing("SSH_HOST"))?;
        let username = pick(&request.ssh_username, &self.ssh_username)
            .ok_or(ConfigError::Missing("SSH_USERNAME"))?;

        // An explicit password in the request wins over anything configured
        let credentials = match non_empty_secret(&request.ssh_password) {
            Some(password) => SshCredentials::Password(password),
            None => match (&self.ssh_key_path, &self.ssh_password) {
                (Some(path), _) => SshCredentials::Key {
                    path: path.clone(),
                    passphrase: self.ssh_key_passphrase.clone(),
                },
                (None, Some(password)) => SshCredentials::Password(password.clone()),
                (None, None) => return Err(ConfigError::Missing("SSH_PASSWORD or SSH_KEY_PATH")),
            },
        };

        let ssh = SshTarget {
            host,
            port: request.ssh_port.or(self.ssh_port).unwrap_or(DEFAULT_SSH_PORT),
            username,
            credentials,
        };

        let database = DatabaseTarget {
            host: pick(&request.mysql_host, &self.mysql_host)
                .unwrap_or_else(|| DEFAULT_MYSQL_HOST.to_string()),
            port: request.mysql_port.or(self.mysql_port).unwrap_or(DEFAULT_MYSQL_PORT),
            user: pick(&request.mysql_user, &self.mysql_user)
                .ok_or(ConfigError::Missing("MYSQL_USER"))?,
            password: match non_empty_secret(&request.mysql_password) {
                Some(password) => password,
                None => self
                    .mysql_password
                    .clone()
                    .unwrap_or_else(|| Zeroizing::new(String::new())),
            },
            database: pick(&request.mysql_database, &self.mysql_database),
        };

        Ok(TunnelTarget { ssh, database })
    }
}

/// Bridge daemon configuration
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub tunnel: TunnelSettings,
    /// Local port the forwarded database stream is exposed on
    pub rendezvous_port: u16,
    /// API listen address, e.g. "127.0.0.1:3443"
    pub listen_address: String,
    pub known_hosts_path: PathBuf,
    pub host_key_policy: HostKeyPolicy,
    /// Unset means no timeout
    pub connect_timeout: Option<Duration>,
    /// Unset means no timeout
    pub query_timeout: Option<Duration>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            tunnel: TunnelSettings::default(),
            rendezvous_port: DEFAULT_RENDEZVOUS_PORT,
            listen_address: DEFAULT_LISTEN_ADDRESS.to_string(),
            known_hosts_path: default_known_hosts_path(),
            host_key_policy: HostKeyPolicy::default(),
            connect_timeout: None,
            query_timeout: None,
        }
    }
}

impl BridgeConfig {
    /// Load from the process environment, reading a `.env` file first if present
    pub fn from_env() -> Result<Self, ConfigError> {
        match dotenvy::dotenv() {
            Ok(path) => info!("Loaded environment from {}", path.display()),
            Err(e) => debug!("No .env file loaded: {}", e),
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; empty values count as unset
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let secret = |key: &str| get(key).map(Zeroizing::new);

        let tunnel = TunnelSettings {
            ssh_host: get("SSH_HOST"),
            ssh_port: parse_opt(&get, "SSH_PORT")?,
            ssh_username: get("SSH_USERNAME"),
            ssh_password: secret("SSH_PASSWORD"),
            ssh_key_path: get("SSH_KEY_PATH").map(PathBuf::from),
            ssh_key_passphrase: secret("SSH_KEY_PASSPHRASE"),
            mysql_host: get("MYSQL_HOST"),
            mysql_port: parse_opt(&get, "MYSQL_PORT")?,
            mysql_user: get("MYSQL_USER"),
            mysql_password: secret("MYSQL_PASSWORD"),
            mysql_database: get("MYSQL_DATABASE"),
        };

        let host_key_policy = match get("BRIDGE_HOST_KEY_POLICY") {
            Some(value) => value.parse().map_err(|reason| ConfigError::Invalid {
                key: "BRIDGE_HOST_KEY_POLICY",
                value,
                reason,
            })?,
            None => HostKeyPolicy::default(),
        };

        let config = Self {
            tunnel,
            rendezvous_port: parse_opt(&get, "BRIDGE_RENDEZVOUS_PORT")?
                .unwrap_or(DEFAULT_RENDEZVOUS_PORT),
            listen_address: get("BRIDGE_LISTEN")
                .unwrap_or_else(|| DEFAULT_LISTEN_ADDRESS.to_string()),
            known_hosts_path: get("BRIDGE_KNOWN_HOSTS")
                .map(PathBuf::from)
                .unwrap_or_else(default_known_hosts_path),
            host_key_policy,
            connect_timeout: parse_opt::<u64, _>(&get, "BRIDGE_CONNECT_TIMEOUT_SECS")?
                .map(Duration::from_secs),
            query_timeout: parse_opt::<u64, _>(&get, "BRIDGE_QUERY_TIMEOUT_SECS")?
                .map(Duration::from_secs),
        };

        config.validate()?;
        Ok(config)
    }

    /// The API carries credentials in plain HTTP, so it may only listen on loopback
    pub fn validate(&self) -> Result<(), ConfigError> {
        let (host, _) =
            split_host_port(&self.listen_address).ok_or_else(|| ConfigError::Invalid {
                key: "BRIDGE_LISTEN",
                value: self.listen_address.clone(),
                reason: "expected host:port".to_string(),
            })?;

        if !is_loopback_address(host) {
            return Err(ConfigError::Invalid {
                key: "BRIDGE_LISTEN",
                value: self.listen_address.clone(),
                reason: "the API is unencrypted and must bind a loopback address".to_string(),
            });
        }

        if self.rendezvous_port == 0 {
            return Err(ConfigError::Invalid {
                key: "BRIDGE_RENDEZVOUS_PORT",
                value: "0".to_string(),
                reason: "a fixed port is required".to_string(),
            });
        }

        for (key, timeout) in [
            ("BRIDGE_CONNECT_TIMEOUT_SECS", self.connect_timeout),
            ("BRIDGE_QUERY_TIMEOUT_SECS", self.query_timeout),
        ] {
            if timeout == Some(Duration::ZERO) {
                return Err(ConfigError::Invalid {
                    key,
                    value: "0".to_string(),
                    reason: "leave unset to disable the timeout".to_string(),
                });
            }
        }

        Ok(())
    }
}

fn default_known_hosts_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tunnel-bridge")
        .join("known_hosts")
}

fn pick(request: &Option<String>, configured: &Option<String>) -> Option<String> {
    non_empty(request).or_else(|| non_empty(configured))
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.trim().is_empty()).cloned()
}

fn non_empty_secret(value: &Option<Zeroizing<String>>) -> Option<Zeroizing<String>> {
    value.as_ref().filter(|v| !v.trim().is_empty()).cloned()
}

fn parse_opt<T, G>(get: &G, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::Invalid {
                key,
                value,
                reason: e.to_string(),
            }),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_from_empty_environment() {
        let config = BridgeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.rendezvous_port, DEFAULT_RENDEZVOUS_PORT);
        assert_eq!(config.listen_address, DEFAULT_LISTEN_ADDRESS);
        assert_eq!(config.host_key_policy, HostKeyPolicy::AcceptNew);
        assert!(config.connect_timeout.is_none());
        assert!(config.query_timeout.is_none());
    }

    #[test]
    fn test_invalid_port_is_rejected() {
        let err = BridgeConfig::from_lookup(lookup(&[("SSH_PORT", "twenty-two")])).unwrap_err();
        match err {
            ConfigError::Invalid { key, .. } => assert_eq!(key, "SSH_PORT"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_non_loopback_listen_rejected() {
        let err = BridgeConfig::from_lookup(lookup(&[("BRIDGE_LISTEN", "0.0.0.0:3443")]))
            .unwrap_err();
        assert!(err.to_string().contains("loopback"));

        assert!(BridgeConfig::from_lookup(lookup(&[("BRIDGE_LISTEN", "localhost:9000")])).is_ok());
    }

    #[test]
    fn test_policy_and_timeouts_parse() {
        let config = BridgeConfig::from_lookup(lookup(&[
            ("BRIDGE_HOST_KEY_POLICY", "strict"),
            ("BRIDGE_CONNECT_TIMEOUT_SECS", "15"),
        ]))
        .unwrap();
        assert_eq!(config.host_key_policy, HostKeyPolicy::Strict);
        assert_eq!(config.connect_timeout, Some(Duration::from_secs(15)));

        assert!(BridgeConfig::from_lookup(lookup(&[("BRIDGE_HOST_KEY_POLICY", "yolo")])).is_err());
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        for key in ["BRIDGE_CONNECT_TIMEOUT_SECS", "BRIDGE_QUERY_TIMEOUT_SECS"] {
            match BridgeConfig::from_lookup(lookup(&[(key, "0")])).unwrap_err() {
                ConfigError::Invalid { key: rejected, .. } => assert_eq!(rejected, key),
                other => panic!("unexpected error: {:?}", other),
            }
        }
    }

    #[test]
    fn test_resolve_from_environment() {
        let config = BridgeConfig::from_lookup(lookup(&[
            ("SSH_HOST", "bastion.example.com"),
            ("SSH_USERNAME", "deploy"),
            ("SSH_PASSWORD", "pw"),
            ("MYSQL_USER", "app"),
            ("MYSQL_DATABASE", "shop"),
        ]))
        .unwrap();

        let target = config.tunnel.resolve(&ConnectRequest::default()).unwrap();
        assert_eq!(target.ssh.endpoint(), "bastion.example.com:22");
        assert!(matches!(target.ssh.credentials, SshCredentials::Password(_)));
        assert_eq!(target.database.host, "127.0.0.1");
        assert_eq!(target.database.port, 3306);
        assert_eq!(target.database.database.as_deref(), Some("shop"));
    }

    #[test]
    fn test_resolve_prefers_request_overrides() {
        let config = BridgeConfig::from_lookup(lookup(&[
            ("SSH_HOST", "bastion.example.com"),
            ("SSH_USERNAME", "deploy"),
            ("SSH_KEY_PATH", "/home/deploy/.ssh/id_ed25519"),
            ("MYSQL_USER", "app"),
        ]))
        .unwrap();

        let request = ConnectRequest {
            ssh_host: Some("10.0.0.9".to_string()),
            ssh_port: Some(2222),
            ssh_password: Some(Zeroizing::new("override".to_string())),
            ..Default::default()
        };
        let target = config.tunnel.resolve(&request).unwrap();
        assert_eq!(target.ssh.endpoint(), "10.0.0.9:2222");
        match target.ssh.credentials {
            SshCredentials::Password(pw) => assert_eq!(pw.as_str(), "override"),
            other => panic!("expected password credentials, got {:?}", other),
        }

        let target = config.tunnel.resolve(&ConnectRequest::default()).unwrap();
        assert!(matches!(target.ssh.credentials, SshCredentials::Key { .. }));
    }

    #[test]
    fn test_resolve_missing_values() {
        let settings = TunnelSettings::default();
        assert_eq!(
            settings.resolve(&ConnectRequest::default()).unwrap_err(),
            ConfigError::Missing("SSH_HOST")
        );

        let settings = TunnelSettings {
            ssh_host: Some("h".to_string()),
            ssh_username: Some("u".to_string()),
            ..Default::default()
        };
        assert_eq!(
            settings.resolve(&ConnectRequest::default()).unwrap_err(),
            ConfigError::Missing("SSH_PASSWORD or SSH_KEY_PATH")
        );
    }
}
