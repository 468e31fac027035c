//! Configuration system using Figment.
//!
//! Strongly-typed configuration loading for the coordination core.
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. Environment variables (prefixed with `LAB_COORD_`)
//!
//! # Example
//! ```no_run
//! use lab_coord::config::CoordConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CoordConfig::load()?;
//! println!("Server: {}", config.server_addr());
//! # Ok(())
//! # }
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CoordError, CoordResult};

/// Top-level configuration for the coordination core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordConfig {
    /// Coordination server endpoint
    pub server: ServerConfig,
    /// Shared-storage layout for path translation
    pub storage: StorageConfig,
    /// Transport security policy
    pub security: SecurityConfig,
    /// Protocol timeouts
    pub timeouts: TimeoutConfig,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Coordination server endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host the coordination server runs on
    #[serde(default = "default_host")]
    pub host: String,
    /// TCP port of the coordination server
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Shared-storage layout for path translation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Local mount point of the shared store on this host
    #[serde(default = "default_shared_root")]
    pub shared_root: PathBuf,
    /// Host-agnostic prefix substituted for the local mount point
    #[serde(default = "default_agnostic_prefix")]
    pub agnostic_prefix: String,
}

/// Transport security policy.
///
/// The wire protocol carries no authentication; the secret gates whether a
/// deployment is allowed to run at all without a secured transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Shared secret material for the transport layer
    #[serde(default)]
    pub shared_secret: Option<String>,
    /// Permit running without a shared secret
    #[serde(default)]
    pub allow_insecure: bool,
}

/// Protocol timeouts, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Default window for a blocking acquire
    #[serde(default = "default_acquire_ms")]
    pub default_acquire_ms: u64,
    /// Window after which a silent client session is destroyed
    #[serde(default = "default_session_ms")]
    pub session_ms: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    7339
}

fn default_shared_root() -> PathBuf {
    PathBuf::from("/mnt/lab")
}

fn default_agnostic_prefix() -> String {
    "Z:\\".to_string()
}

fn default_acquire_ms() -> u64 {
    45_000
}

fn default_session_ms() -> u64 {
    30_000
}

impl Default for CoordConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: default_host(),
                port: default_port(),
            },
            storage: StorageConfig {
                shared_root: default_shared_root(),
                agnostic_prefix: default_agnostic_prefix(),
            },
            security: SecurityConfig {
                shared_secret: None,
                allow_insecure: false,
            },
            timeouts: TimeoutConfig {
                default_acquire_ms: default_acquire_ms(),
                session_ms: default_session_ms(),
            },
            log_level: default_log_level(),
        }
    }
}

impl CoordConfig {
    /// Load configuration from `config/lab_coord.toml` and environment
    /// variables.
    ///
    /// Environment variables override the file with prefix `LAB_COORD_`.
    /// Example: `LAB_COORD_SERVER_HOST=control-pc`
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from("config/lab_coord.toml")
    }

    /// Load configuration from a specific file path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(CoordConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("LAB_COORD_").split("_"))
            .extract()
    }

    /// `host:port` of the coordination server.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Enforce the security policy before opening any transport.
    ///
    /// Running with no shared secret is refused unless `allow_insecure` is
    /// set, in which case a warning is emitted once at startup.
    pub fn check_security(&self) -> CoordResult<()> {
        if self.security.shared_secret.is_none() {
            if !self.security.allow_insecure {
                return Err(CoordError::InsecureConfig);
            }
            tracing::warn!("running without a shared secret (allow_insecure = true)");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = CoordConfig::default();
        assert_eq!(config.server.port, 7339);
        assert_eq!(config.timeouts.default_acquire_ms, 45_000);
        assert_eq!(config.storage.agnostic_prefix, "Z:\\");
        assert!(!config.security.allow_insecure);
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [server]
            host = "control-pc"
            port = 9001

            [security]
            allow_insecure = true

            [timeouts]
            default_acquire_ms = 1000
            "#
        )
        .unwrap();

        let config = CoordConfig::load_from(file.path()).unwrap();
        assert_eq!(config.server_addr(), "control-pc:9001");
        assert_eq!(config.timeouts.default_acquire_ms, 1000);
        // untouched sections keep their defaults
        assert_eq!(config.timeouts.session_ms, 30_000);
    }

    #[test]
    fn test_insecure_config_refused() {
        let config = CoordConfig::default();
        assert!(matches!(
            config.check_security(),
            Err(CoordError::InsecureConfig)
        ));
    }

    #[test]
    fn test_secret_passes_security_check() {
        let mut config = CoordConfig::default();
        config.security.shared_secret = Some("s3cret".into());
        assert!(config.check_security().is_ok());
    }
}
