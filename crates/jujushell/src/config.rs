//! Server configuration.
//!
//! Options are read from a YAML file whose path is the server's only
//! command line argument.

use std::path::{Path, PathBuf};

use log::LevelFilter;
use serde::Deserialize;
use thiserror::Error;

/// Path of the socket provided by snapped LXD.
const DEFAULT_LXD_SOCKET: &str = "/var/snap/lxd/common/lxd/unix.socket";

/// The server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Users allowed to use the service. An empty list admits every user
    /// who can authenticate against the controller. External user names
    /// carry the "@external" suffix.
    #[serde(rename = "allowed-users", default)]
    pub allowed_users: Vec<String>,

    /// DNS name for Let's Encrypt certificates, handled by the fronting
    /// TLS terminator.
    #[serde(rename = "dns-name", default)]
    pub dns_name: String,

    /// The LXD image to create containers from.
    #[serde(rename = "image-name", default)]
    pub image_name: String,

    /// Addresses of the current Juju controller.
    #[serde(rename = "juju-addrs", default)]
    pub juju_addrs: Vec<String>,

    /// CA certificate validating the controller's certificate, in PEM
    /// format.
    #[serde(rename = "juju-cert", default)]
    pub juju_cert: String,

    /// Logging level.
    #[serde(rename = "log-level", default)]
    pub log_level: LogLevel,

    /// Port the server listens on.
    #[serde(default)]
    pub port: u16,

    /// LXD profiles applied to new containers.
    #[serde(default)]
    pub profiles: Vec<String>,

    /// TLS material, consumed by the fronting TLS terminator.
    #[serde(rename = "tls-cert", default)]
    pub tls_cert: String,
    #[serde(rename = "tls-key", default)]
    pub tls_key: String,

    /// Minutes of inactivity after which containers are stopped; zero
    /// disables the idle stopper.
    #[serde(rename = "session-timeout", default)]
    pub session_timeout: u64,

    /// Optional message sent to clients when their session becomes ready.
    #[serde(rename = "welcome-message", default)]
    pub welcome_message: String,

    /// Path of the LXD daemon socket.
    #[serde(rename = "lxd-socket", default = "default_lxd_socket")]
    pub lxd_socket: PathBuf,

    /// Container garbage collection: maximum number of containers to keep
    /// (zero disables the cap rule) and days after which unconnected
    /// containers are removed (zero disables the age rule).
    #[serde(rename = "gc-cap", default)]
    pub gc_cap: usize,
    #[serde(rename = "gc-days", default)]
    pub gc_days: u32,
}

fn default_lxd_socket() -> PathBuf {
    PathBuf::from(DEFAULT_LXD_SOCKET)
}

/// Logging levels accepted in the configuration file.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_filter(self) -> LevelFilter {
        match self {
            LogLevel::Trace => LevelFilter::Trace,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Error => LevelFilter::Error,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot read {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("invalid configuration at {path:?}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

/// Read and validate the configuration at the given path.
pub fn read(path: &Path) -> Result<Config, Error> {
    let data = std::fs::read(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config: Config = serde_yaml::from_slice(&data).map_err(|source| Error::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    if let Err(reason) = validate(&config) {
        return Err(Error::Invalid {
            path: path.to_path_buf(),
            reason,
        });
    }
    Ok(config)
}

/// Validate the configuration options.
fn validate(config: &Config) -> Result<(), String> {
    let mut missing = Vec::new();
    if config.image_name.is_empty() {
        missing.push("image-name");
    }
    if config.juju_addrs.is_empty() {
        missing.push("juju-addrs");
    }
    if config.port == 0 {
        missing.push("port");
    }
    if config.profiles.is_empty() {
        missing.push("profiles");
    }
    if !missing.is_empty() {
        return Err(format!("missing fields: {}", missing.join(", ")));
    }
    if !config.dns_name.is_empty() {
        if !config.tls_cert.is_empty() || !config.tls_key.is_empty() {
            return Err(
                "cannot specify both DNS name for Let's Encrypt and TLS keys at the same time"
                    .to_string(),
            );
        }
        if config.port != 443 {
            return Err("cannot use a port different than 443 with Let's Encrypt".to_string());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        serde_yaml::from_str(
            concat!(
                "image-name: termserver\n",
                "juju-addrs: [1.2.3.4:17070]\n",
                "port: 8047\n",
                "profiles: [default, termserver-limited]\n",
            ),
        )
        .unwrap()
    }

    #[test]
    fn minimal_configuration_is_valid() {
        let config = base();
        assert!(validate(&config).is_ok());
        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(
            config.lxd_socket,
            PathBuf::from("/var/snap/lxd/common/lxd/unix.socket")
        );
        assert!(config.allowed_users.is_empty());
        assert_eq!(config.session_timeout, 0);
        assert_eq!(config.gc_cap, 0);
    }

    #[test]
    fn missing_fields_are_reported_together() {
        let config: Config = serde_yaml::from_str("log-level: debug\n").unwrap();
        let reason = validate(&config).unwrap_err();
        assert_eq!(
            reason,
            "missing fields: image-name, juju-addrs, port, profiles"
        );
    }

    #[test]
    fn dns_name_conflicts_with_tls_keys() {
        let mut config = base();
        config.dns_name = "shell.example.com".to_string();
        config.port = 443;
        config.tls_cert = "certificate".to_string();
        let reason = validate(&config).unwrap_err();
        assert!(reason.contains("cannot specify both"));
    }

    #[test]
    fn dns_name_requires_port_443() {
        let mut config = base();
        config.dns_name = "shell.example.com".to_string();
        let reason = validate(&config).unwrap_err();
        assert_eq!(
            reason,
            "cannot use a port different than 443 with Let's Encrypt"
        );

        config.port = 443;
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn full_configuration_round_trips() {
        let config: Config = serde_yaml::from_str(
            concat!(
                "allowed-users: [alice, bob@external]\n",
                "image-name: termserver\n",
                "juju-addrs: [1.2.3.4:17070, 4.3.2.1:17070]\n",
                "juju-cert: certificate\n",
                "log-level: debug\n",
                "port: 443\n",
                "profiles: [default]\n",
                "session-timeout: 20\n",
                "welcome-message: Welcome to the Juju shell.\n",
                "lxd-socket: /var/lib/lxd/unix.socket\n",
                "gc-cap: 100\n",
                "gc-days: 7\n",
            ),
        )
        .unwrap();
        assert!(validate(&config).is_ok());
        assert_eq!(config.allowed_users, vec!["alice", "bob@external"]);
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.session_timeout, 20);
        assert_eq!(config.welcome_message, "Welcome to the Juju shell.");
        assert_eq!(config.lxd_socket, PathBuf::from("/var/lib/lxd/unix.socket"));
        assert_eq!(config.gc_cap, 100);
        assert_eq!(config.gc_days, 7);
    }

    #[test]
    fn unknown_log_levels_are_rejected() {
        let result: Result<Config, _> = serde_yaml::from_str("log-level: loud\n");
        assert!(result.is_err());
    }

    #[test]
    fn read_reports_missing_files() {
        match read(Path::new("/nonexistent/jujushell.yaml")) {
            Err(Error::Io { path, .. }) => {
                assert_eq!(path, PathBuf::from("/nonexistent/jujushell.yaml"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
