use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use thiserror::Error;

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_ROUTE: &str = "/app-debug.apk";
pub const DEFAULT_LOG_PATH: &str = "beacons.jsonl";
pub const DEFAULT_DOWNLOAD_PATH: &str =
    "../apps/locker-sim-android/app/build/outputs/apk/debug/app-debug.apk";

// The route is echoed into HTML attributes and headers.
const ROUTE_FORBIDDEN: &[char] = &['\'', '"', '<', '>', '&', '\\'];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid listen port {0}")]
    InvalidPort(u16),
    #[error("download route must start with '/', name a file and avoid whitespace, quotes, '<', '>', '&' and '\\': {0:?}")]
    InvalidRoute(String),
    #[error("log file path must not be empty")]
    EmptyLogPath,
    #[error("cannot resolve download path {path}: {source}")]
    DownloadPath { path: PathBuf, source: io::Error },
}

/// Process-wide host settings, fixed once the server starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub route: String,
    /// Absolute path of the served file; `None` disables the download route.
    pub download_path: Option<PathBuf>,
    pub log_path: PathBuf,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            route: DEFAULT_ROUTE.to_string(),
            download_path: None,
            log_path: PathBuf::from(DEFAULT_LOG_PATH),
        }
    }
}

impl HostConfig {
    /// Validates raw settings and makes the download path absolute. The file
    /// itself need not exist yet; availability is checked per request.
    pub fn resolve(
        bind: IpAddr,
        port: u16,
        route: &str,
        download_path: Option<&Path>,
        log_path: &Path,
    ) -> Result<Self, ConfigError> {
        if port == 0 {
            return Err(ConfigError::InvalidPort(port));
        }

        let route = route.trim();
        if !route.starts_with('/')
            || route.len() < 2
            || route.contains(|c: char| c.is_whitespace() || ROUTE_FORBIDDEN.contains(&c))
        {
            return Err(ConfigError::InvalidRoute(route.to_string()));
        }

        if log_path.as_os_str().is_empty() {
            return Err(ConfigError::EmptyLogPath);
        }

        let download_path = download_path
            .filter(|path| !path.as_os_str().is_empty())
            .map(|path| {
                std::path::absolute(path).map_err(|source| ConfigError::DownloadPath {
                    path: path.to_path_buf(),
                    source,
                })
            })
            .transpose()?;

        Ok(Self {
            bind,
            port,
            route: route.to_string(),
            download_path,
            log_path: log_path.to_path_buf(),
        })
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    /// True when `path` addresses the download route (prefix match, so query
    /// strings and cache-busting suffixes still hit it).
    pub fn is_download_path(&self, path: &str) -> bool {
        path.starts_with(&self.route)
    }

    /// The configured file, if the route is enabled. Whether it exists is up
    /// to the caller to check at request time.
    pub fn download_path(&self) -> Option<&Path> {
        self.download_path.as_deref()
    }

    /// File name offered to clients in `Content-Disposition`.
    pub fn download_filename(&self) -> &str {
        self.route
            .rsplit('/')
            .find(|segment| !segment.is_empty())
            .unwrap_or("download")
    }
}
