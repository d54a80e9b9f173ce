//! Configuration loader

use std::path::Path;

use hyper::header::HeaderValue;
use hyper::Method;
use syncgate_utils::{config_file, Result, SyncgateError};

use super::AppConfig;

const STANDARD_METHODS: [Method; 9] = [
    Method::GET,
    Method::HEAD,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::CONNECT,
    Method::OPTIONS,
    Method::TRACE,
    Method::PATCH,
];

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration
    ///
    /// An explicit `path` must exist. Without one the default location is
    /// tried, and defaults are used when nothing is there.
    pub fn load(path: Option<&Path>) -> Result<AppConfig> {
        match path {
            Some(path) if !path.exists() => Err(SyncgateError::ConfigNotFound(path.to_path_buf())),
            Some(path) => Self::load_from_path(path),
            None => {
                let path = config_file();
                if path.exists() {
                    Self::load_from_path(&path)
                } else {
                    Ok(AppConfig::default())
                }
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<AppConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| SyncgateError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;

        Self::parse(&content, path)
    }

    /// Parse configuration from string
    pub fn parse(content: &str, path: &Path) -> Result<AppConfig> {
        toml::from_str(content).map_err(|e| SyncgateError::ConfigInvalid {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Validate configuration
    pub fn validate(config: &AppConfig) -> Result<()> {
        config.server.listen_addr()?;

        if config.server.read_timeout_secs == 0 {
            return Err(SyncgateError::config("read_timeout_secs must be at least 1"));
        }

        if config.server.shutdown_timeout_secs == 0 {
            return Err(SyncgateError::config(
                "shutdown_timeout_secs must be at least 1",
            ));
        }

        // The upgrade verb must be a token no ordinary client would send
        let method = Method::from_bytes(config.upgrade.method.as_bytes()).map_err(|_| {
            SyncgateError::config(format!(
                "upgrade method '{}' is not a valid HTTP method",
                config.upgrade.method
            ))
        })?;
        if STANDARD_METHODS.contains(&method) {
            return Err(SyncgateError::config(format!(
                "upgrade method must not be a standard HTTP method, got {method}"
            )));
        }

        if config.upgrade.protocol.is_empty()
            || HeaderValue::from_str(&config.upgrade.protocol).is_err()
        {
            return Err(SyncgateError::config(
                "upgrade protocol must be a non-empty header value",
            ));
        }

        if config.daemon.program.as_os_str().is_empty() {
            return Err(SyncgateError::config("daemon program must not be empty"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_from_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        std::fs::write(
            &path,
            r#"
            [server]
            listen = "127.0.0.1:9000"
            shutdown_timeout_secs = 30

            [daemon]
            program = "/usr/bin/rsync"
            "#,
        )
        .unwrap();

        let config = ConfigLoader::load(Some(&path)).unwrap();
        ConfigLoader::validate(&config).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:9000");
        assert_eq!(config.server.shutdown_timeout_secs, 30);
        assert_eq!(config.server.read_timeout_secs, 15);
        assert_eq!(config.daemon.program, Path::new("/usr/bin/rsync"));
    }

    #[test]
    fn test_load_explicit_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.toml");

        let err = ConfigLoader::load(Some(&path)).unwrap_err();
        assert!(matches!(err, SyncgateError::ConfigNotFound(_)));
    }

    #[test]
    fn test_parse_invalid_toml() {
        let result = ConfigLoader::parse("invalid { toml", Path::new("test.toml"));
        assert!(matches!(result, Err(SyncgateError::ConfigInvalid { .. })));
    }

    #[test]
    fn test_validate_defaults() {
        assert!(ConfigLoader::validate(&AppConfig::default()).is_ok());
    }

    #[test]
    fn test_validate_rejects_standard_method() {
        let mut config = AppConfig::default();
        config.upgrade.method = "POST".into();

        let err = ConfigLoader::validate(&config).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_validate_rejects_invalid_method() {
        let mut config = AppConfig::default();
        config.upgrade.method = "RS YNC".into();

        assert!(ConfigLoader::validate(&config).is_err());
    }

    #[test]
    fn test_validate_accepts_custom_method() {
        let mut config = AppConfig::default();
        config.upgrade.method = "SYNC".into();

        assert!(ConfigLoader::validate(&config).is_ok());
    }

    #[test]
    fn test_validate_zero_timeouts() {
        let mut config = AppConfig::default();
        config.server.shutdown_timeout_secs = 0;
        assert!(ConfigLoader::validate(&config).is_err());

        let mut config = AppConfig::default();
        config.server.read_timeout_secs = 0;
        assert!(ConfigLoader::validate(&config).is_err());
    }

    #[test]
    fn test_validate_empty_program() {
        let mut config = AppConfig::default();
        config.daemon.program = "".into();
        assert!(ConfigLoader::validate(&config).is_err());
    }

    #[test]
    fn test_validate_bad_listen_address() {
        let mut config = AppConfig::default();
        config.server.listen = "not-an-address".into();

        let err = ConfigLoader::validate(&config).unwrap_err();
        assert!(matches!(err, SyncgateError::InvalidAddress { .. }));
    }
}
