use std::path::PathBuf;

/// Common CLI configuration shared by all service binaries.
///
/// Each binary parses these from command-line arguments or environment
/// variables, then passes them to storage layer initialization.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Directory holding all persistent state.
    pub data_dir: Option<PathBuf>,

    /// Path to the SQLite database file.
    /// Defaults to `{data_dir}/data.sqlite` if not specified.
    pub sqlite_path: Option<PathBuf>,

    /// Listen address for the HTTP server.
    pub listen: String,

    /// Externally reachable base URL of this service.
    ///
    /// When set, deferred work is dispatched through fire-and-forget HTTP
    /// requests against `{public_url}/queue/process/{guid}` instead of an
    /// in-process worker, so each unit runs in its own request lifecycle.
    pub public_url: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            sqlite_path: None,
            listen: "0.0.0.0:8080".to_string(),
            public_url: None,
        }
    }
}

impl ServiceConfig {
    /// Parse configuration from command-line arguments.
    ///
    /// Supported flags:
    /// - `--data-dir=PATH`
    /// - `--sqlite=PATH`
    /// - `--listen=ADDR`
    /// - `--public-url=URL`
    pub fn from_args(args: &[String]) -> Self {
        let mut config = ServiceConfig::default();

        for arg in args {
            if let Some(val) = arg.strip_prefix("--data-dir=") {
                config.data_dir = Some(PathBuf::from(val));
            } else if let Some(val) = arg.strip_prefix("--sqlite=") {
                config.sqlite_path = Some(PathBuf::from(val));
            } else if let Some(val) = arg.strip_prefix("--listen=") {
                config.listen = val.to_string();
            } else if let Some(val) = arg.strip_prefix("--public-url=") {
                config.public_url = Some(val.trim_end_matches('/').to_string());
            }
        }

        config
    }

    /// Resolve the SQLite database path, falling back to `{data_dir}/data.sqlite`.
    pub fn resolve_sqlite_path(&self) -> PathBuf {
        self.sqlite_path.clone().unwrap_or_else(|| {
            self.data_dir
                .as_ref()
                .map(|d| d.join("data.sqlite"))
                .unwrap_or_else(|| PathBuf::from("data.sqlite"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_args() {
        let args = vec![
            "--data-dir=/var/lib/shipsync".to_string(),
            "--listen=127.0.0.1:9090".to_string(),
            "--public-url=https://shop.example.com/shipsync/".to_string(),
        ];
        let config = ServiceConfig::from_args(&args);
        assert_eq!(config.data_dir, Some(PathBuf::from("/var/lib/shipsync")));
        assert_eq!(config.listen, "127.0.0.1:9090");
        assert_eq!(
            config.public_url.as_deref(),
            Some("https://shop.example.com/shipsync")
        );
    }

    #[test]
    fn test_resolve_defaults() {
        let config = ServiceConfig {
            data_dir: Some(PathBuf::from("/data")),
            ..Default::default()
        };
        assert_eq!(
            config.resolve_sqlite_path(),
            PathBuf::from("/data/data.sqlite")
        );

        let explicit = ServiceConfig {
            sqlite_path: Some(PathBuf::from("/elsewhere/q.sqlite")),
            ..Default::default()
        };
        assert_eq!(
            explicit.resolve_sqlite_path(),
            PathBuf::from("/elsewhere/q.sqlite")
        );
    }
}
