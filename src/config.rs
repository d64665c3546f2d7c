//! Server configuration.
//!
//! Every field is optional in a file: missing sections fall back to
//! [`Default`], and [`Config::normalized`] replaces zero or blank values with
//! the defaults too, so a half-filled struct literal behaves like a
//! half-filled file.
//!
//! ```toml
//! port = 8080
//! base_path = "/api/v1"
//! shutdown_timeout = "10s"
//!
//! [cors]
//! allowed_origins = ["https://*.example.com"]
//! allow_credentials = true
//! max_age = "10m"
//!
//! [request_timeout]
//! duration = "3s"
//! status = 504
//!
//! [log]
//! access_file = "logs/access.log"
//! error_file = "logs/error.log"
//! rotate_max_size = 10485760
//! rotate_backups = 5
//!
//! [auth]
//! access_cookie = "access_token"
//! enable_access_gate = true
//! ```

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::middleware::timeout::TimeoutPolicy;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_REQUEST_ID_HEADER: &str = "X-Request-Id";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listen port. `0` lets the OS pick one.
    pub port: u16,
    pub host: String,
    /// Prefix for application routes, e.g. `/api/v1`. System routes ignore it.
    pub base_path: String,
    /// Print the route table to stdout on start.
    pub print_routes: bool,
    pub cors: CorsSettings,
    pub timeouts: HttpTimeouts,
    pub request_timeout: RequestTimeoutSettings,
    pub log: LogSettings,
    pub auth: AuthSettings,
    /// Upper bound on draining in-flight requests at shutdown.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Translate SIGINT/SIGTERM into a shutdown request.
    pub handle_signals: bool,
    pub request_id_header: String,
    /// Reported by `/sys/info`.
    pub version: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            host: DEFAULT_HOST.to_string(),
            base_path: String::new(),
            print_routes: false,
            cors: CorsSettings::default(),
            timeouts: HttpTimeouts::default(),
            request_timeout: RequestTimeoutSettings::default(),
            log: LogSettings::default(),
            auth: AuthSettings::default(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            handle_signals: true,
            request_id_header: DEFAULT_REQUEST_ID_HEADER.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl Config {
    /// Loads a configuration file. The format follows the extension:
    /// `.toml` or `.json`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read config file {}: {e}", path.display())))?;

        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");
        match extension {
            "toml" => toml::from_str(&content).map_err(|e| Error::config(format!("invalid TOML: {e}"))),
            "json" => serde_json::from_str(&content).map_err(|e| Error::config(format!("invalid JSON: {e}"))),
            _ => Err(Error::config(format!("unsupported config format: {extension}"))),
        }
    }

    /// Applies `PORTICO_*` environment overrides. Unparseable values are
    /// ignored.
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `PORTICO_PORT` | `port` |
    /// | `PORTICO_HOST` | `host` |
    /// | `PORTICO_BASE_PATH` | `base_path` |
    /// | `PORTICO_REQUEST_TIMEOUT` | `request_timeout.duration` (e.g. `3s`, `250ms`) |
    /// | `PORTICO_SHUTDOWN_TIMEOUT` | `shutdown_timeout` |
    /// | `PORTICO_ACCESS_LOG` | `log.access_file` |
    /// | `PORTICO_ERROR_LOG` | `log.error_file` |
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(port) = var("PORTICO_PORT").and_then(|p| p.parse().ok()) {
            self.port = port;
        }
        if let Some(host) = var("PORTICO_HOST") {
            self.host = host;
        }
        if let Some(base) = var("PORTICO_BASE_PATH") {
            self.base_path = base;
        }
        if let Some(d) = var("PORTICO_REQUEST_TIMEOUT").and_then(|v| humantime_serde::parse_duration(&v).ok()) {
            self.request_timeout.duration = d;
        }
        if let Some(d) = var("PORTICO_SHUTDOWN_TIMEOUT").and_then(|v| humantime_serde::parse_duration(&v).ok()) {
            self.shutdown_timeout = d;
        }
        if let Some(path) = var("PORTICO_ACCESS_LOG") {
            self.log.access_file = Some(PathBuf::from(path));
        }
        if let Some(path) = var("PORTICO_ERROR_LOG") {
            self.log.error_file = Some(PathBuf::from(path));
        }
        self
    }

    /// Replaces zero or blank values with their defaults and canonicalises
    /// `base_path` (leading slash, no trailing slash, `/` becomes empty).
    #[must_use]
    pub fn normalized(mut self) -> Self {
        if self.host.trim().is_empty() {
            self.host = DEFAULT_HOST.to_string();
        }
        self.base_path = normalize_base_path(&self.base_path);
        self.timeouts = self.timeouts.normalized();
        self.request_timeout = self.request_timeout.normalized();
        self.auth = self.auth.normalized();
        if self.shutdown_timeout.is_zero() {
            self.shutdown_timeout = DEFAULT_SHUTDOWN_TIMEOUT;
        }
        if self.request_id_header.trim().is_empty() {
            self.request_id_header = DEFAULT_REQUEST_ID_HEADER.to_string();
        }
        if self.version.trim().is_empty() {
            self.version = env!("CARGO_PKG_VERSION").to_string();
        }
        self
    }

    /// Address to bind.
    pub fn socket_addr(&self) -> Result<SocketAddr, Error> {
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|e| Error::config(format!("invalid host {:?}: {e}", self.host)))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

fn normalize_base_path(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// Cross-origin settings. An empty `allowed_origins` allows nothing.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsSettings {
    pub allowed_origins: Vec<String>,
    /// Empty means `GET, POST, PUT, PATCH, DELETE, OPTIONS`.
    pub allowed_methods: Vec<String>,
    /// Empty means `Content-Type, Authorization, X-Requested-With`.
    pub allowed_headers: Vec<String>,
    pub exposed_headers: Vec<String>,
    pub allow_credentials: bool,
    /// Preflight cache lifetime; zero omits `Access-Control-Max-Age`.
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,
}

/// Connection-level limits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpTimeouts {
    /// Reading the request body.
    #[serde(with = "humantime_serde")]
    pub read: Duration,
    /// Reading the request head.
    #[serde(with = "humantime_serde")]
    pub read_header: Duration,
    /// Producing the whole response.
    #[serde(with = "humantime_serde")]
    pub write: Duration,
    /// How long a connection may sit with no request in flight before it
    /// is closed. Applies to HTTP/1.1 keep-alive and HTTP/2 alike.
    #[serde(with = "humantime_serde")]
    pub idle: Duration,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self {
            read: Duration::from_secs(10),
            read_header: Duration::from_secs(5),
            write: Duration::from_secs(15),
            idle: Duration::from_secs(60),
        }
    }
}

impl HttpTimeouts {
    fn normalized(self) -> Self {
        let defaults = Self::default();
        let or = |d: Duration, fallback: Duration| if d.is_zero() { fallback } else { d };
        Self {
            read: or(self.read, defaults.read),
            read_header: or(self.read_header, defaults.read_header),
            write: or(self.write, defaults.write),
            idle: or(self.idle, defaults.idle),
        }
    }
}

/// Per-request deadline. Zero disables it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestTimeoutSettings {
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Status returned when the deadline fires.
    pub status: u16,
}

impl Default for RequestTimeoutSettings {
    fn default() -> Self {
        Self { duration: Duration::ZERO, status: StatusCode::GATEWAY_TIMEOUT.as_u16() }
    }
}

impl RequestTimeoutSettings {
    fn normalized(mut self) -> Self {
        if !(400..=599).contains(&self.status) {
            self.status = StatusCode::GATEWAY_TIMEOUT.as_u16();
        }
        self
    }

    pub fn policy(&self) -> TimeoutPolicy {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::GATEWAY_TIMEOUT);
        TimeoutPolicy::new(self.duration).with_status(status)
    }
}

/// Access and error log destinations. A missing file means stdout (access)
/// or stderr (error).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub access_file: Option<PathBuf>,
    pub error_file: Option<PathBuf>,
    /// Rotate once a file would grow past this many bytes. Zero disables rotation.
    pub rotate_max_size: u64,
    /// Rotated files to keep.
    pub rotate_backups: usize,
}

/// Where credentials are read from and whether the base-path group is gated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    pub header: String,
    pub prefix: String,
    pub access_cookie: Option<String>,
    pub refresh_cookie: Option<String>,
    /// Require a valid access credential on every route under `base_path`.
    pub enable_access_gate: bool,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            header: "Authorization".to_string(),
            prefix: "Bearer ".to_string(),
            access_cookie: None,
            refresh_cookie: None,
            enable_access_gate: false,
        }
    }
}

impl AuthSettings {
    pub(crate) fn normalized(mut self) -> Self {
        let defaults = Self::default();
        if self.header.trim().is_empty() {
            self.header = defaults.header;
        }
        if self.prefix.is_empty() {
            self.prefix = defaults.prefix;
        }
        self.access_cookie = self.access_cookie.filter(|c| !c.trim().is_empty());
        self.refresh_cookie = self.refresh_cookie.filter(|c| !c.trim().is_empty());
        self
    }
}

/// Durations as `250ms`, `10s`, `5m`, `1h`, or a bare number of seconds.
mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = if duration.subsec_millis() == 0 {
            format!("{}s", duration.as_secs())
        } else {
            format!("{}ms", duration.as_millis())
        };
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Secs(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Secs(n) => Ok(Duration::from_secs(n)),
            Raw::Text(s) => parse_duration(&s).map_err(serde::de::Error::custom),
        }
    }

    pub(super) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let number = |digits: &str| digits.trim().parse::<u64>().map_err(|_| format!("invalid duration: {s:?}"));
        if let Some(n) = s.strip_suffix("ms") {
            Ok(Duration::from_millis(number(n)?))
        } else if let Some(n) = s.strip_suffix('s') {
            Ok(Duration::from_secs(number(n)?))
        } else if let Some(n) = s.strip_suffix('m') {
            Ok(Duration::from_secs(number(n)? * 60))
        } else if let Some(n) = s.strip_suffix('h') {
            Ok(Duration::from_secs(number(n)? * 3600))
        } else {
            Ok(Duration::from_secs(number(s)?))
        }
    }
}
