//! Runtime configuration

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use faas_runtime_sdk::StoreEndpoint;

use crate::error::RuntimeError;

/// Key-value store connection settings
#[derive(Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Store host
    pub host: String,
    /// Store port
    pub port: u16,
    /// Logical database index
    pub db: i64,
    /// Password (never logged)
    pub password: Option<String>,
}

impl StoreConfig {
    /// Connection URL including credentials
    pub fn connection_url(&self) -> String {
        match &self.password {
            Some(password) => format!("redis://:{}@{}:{}/{}", password, self.host, self.port, self.db),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }

    /// Credential-free descriptor handed to handlers
    pub fn endpoint(&self) -> StoreEndpoint {
        StoreEndpoint {
            host: self.host.clone(),
            port: self.port,
            db: self.db,
        }
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("db", &self.db)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Archive-packaged handler settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveConfig {
    /// Zip archive holding the handler and its companions
    pub path: PathBuf,
    /// Handler library path relative to the archive root
    pub entry: PathBuf,
    /// Directory the archive is extracted into
    pub target_dir: PathBuf,
}

/// Backoff policy for store failures during the polling loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive failures tolerated before giving up (0 = never give up)
    pub max_attempts: u32,
    /// Upper bound on the delay between attempts
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before the next tick after `failures` consecutive store failures
    pub fn delay(&self, interval: Duration, failures: u32) -> Duration {
        if failures == 0 {
            return interval;
        }
        let factor = 2u32.saturating_pow(failures.min(16));
        interval.saturating_mul(factor).min(self.max_backoff.max(interval))
    }

    /// Whether `failures` consecutive failures exhaust the policy
    pub fn exhausted(&self, failures: u32) -> bool {
        self.max_attempts > 0 && failures >= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// Runtime configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Store connection target
    pub store: StoreConfig,

    /// Key polled for input snapshots
    pub input_key: String,

    /// Key the handler result is written to (required)
    pub output_key: String,

    /// Delay between fetch attempts
    pub poll_interval: Duration,

    /// Symbol looked up in the handler library
    pub handler_name: String,

    /// Handler library location when archive mode is off
    pub module_path: PathBuf,

    /// Archive mode, when enabled
    pub archive: Option<ArchiveConfig>,

    /// Also run the handler when its library changes on disk
    pub reload_on_code_change: bool,

    /// Store failure policy during the loop
    pub retry: RetryPolicy,
}

impl RuntimeConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let archive_path = lookup("ZIP_FILE_PATH").unwrap_or_default();
        let archive_entry = lookup("ZIP_ENTRY_RELATIVE_FILE_PATH")
            .unwrap_or_else(|| format_library_name("main"));
        let archive = if !archive_path.is_empty() && !archive_entry.is_empty() {
            Some(ArchiveConfig {
                path: PathBuf::from(archive_path),
                entry: PathBuf::from(archive_entry),
                target_dir: lookup("ZIP_TARGET_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/opt/zip")),
            })
        } else {
            None
        };

        Self {
            store: StoreConfig {
                host: lookup("REDIS_HOST")
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| "127.0.0.1".to_string()),
                port: parse_var(&lookup, "REDIS_PORT").unwrap_or(6379),
                db: parse_var(&lookup, "REDIS_DB").unwrap_or(0),
                password: lookup("REDIS_PASSWORD").filter(|s| !s.is_empty()),
            },

            input_key: lookup("REDIS_INPUT_KEY").unwrap_or_else(|| "metrics".to_string()),

            output_key: lookup("REDIS_OUTPUT_KEY").unwrap_or_default(),

            poll_interval: Duration::from_secs(parse_var(&lookup, "REDIS_MONITOR_PERIOD").unwrap_or(5)),

            handler_name: lookup("USER_HANDLER_NAME")
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "handler".to_string()),

            module_path: lookup("USER_MODULE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/opt").join(format_library_name("usermodule"))),

            archive,

            reload_on_code_change: lookup("RELOAD_ON_CODE_CHANGE")
                .map(|s| matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
                .unwrap_or(false),

            retry: RetryPolicy {
                max_attempts: parse_var(&lookup, "STORE_RETRY_MAX_ATTEMPTS").unwrap_or(0),
                max_backoff: Duration::from_secs(parse_var(&lookup, "STORE_RETRY_MAX_BACKOFF_SECS").unwrap_or(60)),
            },
        }
    }

    /// Check settings that cannot describe a working loop
    ///
    /// The output key is checked by `Orchestrator::start`, after the handler
    /// source and store liveness checks.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.poll_interval.is_zero() {
            return Err(RuntimeError::Config(
                "REDIS_MONITOR_PERIOD must be at least 1 second".to_string(),
            ));
        }
        if self.handler_name.is_empty() {
            return Err(RuntimeError::Config("USER_HANDLER_NAME must not be empty".to_string()));
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key).and_then(|s| s.trim().parse().ok())
}

/// Format a shared library filename for the current platform
#[cfg(target_os = "windows")]
pub fn format_library_name(name: &str) -> String {
    format!("{}.dll", name.replace('-', "_"))
}

#[cfg(target_os = "macos")]
pub fn format_library_name(name: &str) -> String {
    format!("lib{}.dylib", name.replace('-', "_"))
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
pub fn format_library_name(name: &str) -> String {
    format!("lib{}.so", name.replace('-', "_"))
}
