use std::env;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::error::{ProxyScanError, Result};

/// Application configuration, resolved once from layered options
#[derive(Debug, Clone)]
pub struct Config {
    /// Proxy pool configuration
    pub pool: PoolConfig,
    /// Tunnel engine binaries and selection
    pub engine: EngineConfig,
    /// Subscription sources
    pub subscription: SubscriptionConfig,
    /// Probe target used for bring-up and health checks
    pub probe: ProbeConfig,
    /// Scan orchestrator tuning
    pub scan: ScanConfig,
    /// Persisted state store
    pub state: StateConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Build and maintain a proxy pool at all
    pub enabled: bool,
    /// Fail start-up when no usable proxy is found
    pub required: bool,
    /// Target number of running proxies
    pub size: usize,
    /// Start returns once this many proxies are usable
    pub min_ready: usize,
    /// Maximum number of candidates probed per queue build
    pub max_probe: usize,
    /// Concurrent bring-up workers
    pub workers: usize,
    /// Wait between spawning an engine and probing it
    pub startup_grace: Duration,
    pub refill_interval: Duration,
    /// Minimum spacing between two refill attempts
    pub refill_cooldown: Duration,
    pub health_interval: Duration,
    /// Consecutive failed health probes before eviction
    pub health_fail_threshold: u32,
    /// First local port handed to tunnel engines
    pub base_port: u16,
    /// Number of local ports available from `base_port`
    pub port_count: u16,
    /// Directory for engine configs and logs
    pub work_dir: PathBuf,
}

/// Operator override for tunnel engine selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineMode {
    /// Pick per node: basic when it can carry the node, advanced otherwise
    #[default]
    Auto,
    Basic,
    Advanced,
}

impl EngineMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineMode::Auto => "auto",
            EngineMode::Basic => "basic",
            EngineMode::Advanced => "advanced",
        }
    }
}

impl FromStr for EngineMode {
    type Err = ProxyScanError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(EngineMode::Auto),
            "basic" | "xray" => Ok(EngineMode::Basic),
            "advanced" | "mihomo" | "clash-meta" => Ok(EngineMode::Advanced),
            other => Err(ProxyScanError::InvalidConfig(format!(
                "unknown engine mode: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub mode: EngineMode,
    /// Xray-compatible binary for the basic engine
    pub xray_bin: Option<PathBuf>,
    /// Mihomo (Clash-Meta) binary for the advanced engine
    pub mihomo_bin: Option<PathBuf>,
}

impl EngineConfig {
    /// Fill unset binary paths by searching `path_var` (a `PATH`-style list)
    pub fn locate_binaries(&mut self, path_var: Option<&OsStr>) {
        let Some(path_var) = path_var else {
            return;
        };
        if self.xray_bin.is_none() {
            self.xray_bin = find_in_path("xray", path_var);
        }
        if self.mihomo_bin.is_none() {
            self.mihomo_bin =
                find_in_path("mihomo", path_var).or_else(|| find_in_path("clash-meta", path_var));
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    pub urls: Vec<String>,
    /// Attempts per URL
    pub retries: u32,
    /// First retry delay; doubled on every further attempt
    pub backoff_base: Duration,
    pub timeout: Duration,
    /// On-disk payload cache, disabled when unset
    pub cache_dir: Option<PathBuf>,
    /// Maximum age of a cached payload used as fallback
    pub cache_ttl: Duration,
    pub user_agent: String,
    /// User-Agent of the alternate fetch path
    pub alt_user_agent: String,
}

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub url: String,
    pub timeout: Duration,
    pub headers: Vec<(String, String)>,
    /// Statuses that prove the target API was reached
    pub ok_statuses: Vec<u16>,
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Namespace of persisted records and rate-limit buckets
    pub domain: String,
    pub max_workers: usize,
    pub fetch_timeout: Duration,
    /// Minimum spacing of requests through one proxy
    pub request_interval: Duration,
    /// Minimum spacing of requests without a proxy
    pub direct_interval: Duration,
    /// Upper bound of random jitter added to every reservation
    pub jitter: Duration,
    pub require_proxies: bool,
    pub proxy_max_consecutive_fails: u32,
    pub proxy_disable_for: Duration,
    pub breaker_max_consecutive_fails: u32,
    pub breaker_on_429: bool,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Floor of the retry-after recorded for a rate-limited item
    pub rate_limit_retry_after: Duration,
    pub failure_retry_after: Duration,
    /// Skip items that succeeded more recently than this; zero disables
    pub fresh_success_ttl: Duration,
    /// Statuses that mark an item permanently invalid
    pub permanent_statuses: Vec<u16>,
    /// Minimum spacing between two concurrency level changes
    pub adjust_cooldown: Duration,
    /// Sleep of a worker parked above the current concurrency level
    pub idle_poll: Duration,
}

#[derive(Debug, Clone)]
pub struct StateConfig {
    /// SQLite file path, or `:memory:`
    pub path: PathBuf,
    pub busy_timeout: Duration,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

macro_rules! config_options {
    ($($field:ident: $ty:ty => $env:literal),* $(,)?) => {
        /// One partial configuration layer
        ///
        /// Used for the file layer (deserialized by the caller), for call
        /// options and for the environment layer.
        #[derive(Debug, Clone, Default, PartialEq, Deserialize)]
        #[serde(default, deny_unknown_fields)]
        pub struct ConfigOptions {
            $(pub $field: Option<$ty>,)*
        }

        impl ConfigOptions {
            /// Apply `other` on top of `self`; fields set in `other` win
            pub fn overlay(mut self, other: ConfigOptions) -> Self {
                $(
                    if other.$field.is_some() {
                        self.$field = other.$field;
                    }
                )*
                self
            }

            /// Read the `PROXYSCAN_*` variables through `lookup`
            pub fn from_env_with<F>(lookup: F) -> Result<Self>
            where
                F: Fn(&str) -> Option<String>,
            {
                Ok(ConfigOptions {
                    $($field: env_value::<$ty, _>(&lookup, $env)?,)*
                })
            }

            /// Names of every variable read by [`ConfigOptions::from_env_with`]
            pub const ENV_KEYS: &'static [&'static str] = &[$($env),*];
        }
    };
}

config_options! {
    pool_enabled: bool => "PROXYSCAN_POOL_ENABLED",
    pool_required: bool => "PROXYSCAN_POOL_REQUIRED",
    pool_size: usize => "PROXYSCAN_POOL_SIZE",
    pool_min_ready: usize => "PROXYSCAN_POOL_MIN_READY",
    pool_max_probe: usize => "PROXYSCAN_POOL_MAX_PROBE",
    pool_workers: usize => "PROXYSCAN_POOL_WORKERS",
    pool_startup_grace_ms: u64 => "PROXYSCAN_POOL_STARTUP_GRACE_MS",
    pool_refill_interval_ms: u64 => "PROXYSCAN_POOL_REFILL_INTERVAL_MS",
    pool_refill_cooldown_ms: u64 => "PROXYSCAN_POOL_REFILL_COOLDOWN_MS",
    pool_health_interval_ms: u64 => "PROXYSCAN_POOL_HEALTH_INTERVAL_MS",
    pool_health_fail_threshold: u32 => "PROXYSCAN_POOL_HEALTH_FAIL_THRESHOLD",
    pool_base_port: u16 => "PROXYSCAN_POOL_BASE_PORT",
    pool_port_count: u16 => "PROXYSCAN_POOL_PORT_COUNT",
    pool_work_dir: PathBuf => "PROXYSCAN_POOL_WORK_DIR",
    engine_mode: EngineMode => "PROXYSCAN_ENGINE_MODE",
    engine_xray_bin: PathBuf => "PROXYSCAN_ENGINE_XRAY_BIN",
    engine_mihomo_bin: PathBuf => "PROXYSCAN_ENGINE_MIHOMO_BIN",
    subscription_urls: Vec<String> => "PROXYSCAN_SUBSCRIPTION_URLS",
    subscription_retries: u32 => "PROXYSCAN_SUBSCRIPTION_RETRIES",
    subscription_backoff_ms: u64 => "PROXYSCAN_SUBSCRIPTION_BACKOFF_MS",
    subscription_timeout_ms: u64 => "PROXYSCAN_SUBSCRIPTION_TIMEOUT_MS",
    subscription_cache_dir: PathBuf => "PROXYSCAN_SUBSCRIPTION_CACHE_DIR",
    subscription_cache_ttl_secs: u64 => "PROXYSCAN_SUBSCRIPTION_CACHE_TTL_SECS",
    subscription_user_agent: String => "PROXYSCAN_SUBSCRIPTION_USER_AGENT",
    subscription_alt_user_agent: String => "PROXYSCAN_SUBSCRIPTION_ALT_USER_AGENT",
    probe_url: String => "PROXYSCAN_PROBE_URL",
    probe_timeout_ms: u64 => "PROXYSCAN_PROBE_TIMEOUT_MS",
    probe_headers: Vec<String> => "PROXYSCAN_PROBE_HEADERS",
    probe_ok_statuses: Vec<u16> => "PROXYSCAN_PROBE_OK_STATUSES",
    probe_max_body_bytes: usize => "PROXYSCAN_PROBE_MAX_BODY_BYTES",
    scan_domain: String => "PROXYSCAN_SCAN_DOMAIN",
    scan_max_workers: usize => "PROXYSCAN_SCAN_MAX_WORKERS",
    scan_fetch_timeout_ms: u64 => "PROXYSCAN_SCAN_FETCH_TIMEOUT_MS",
    scan_request_interval_ms: u64 => "PROXYSCAN_SCAN_REQUEST_INTERVAL_MS",
    scan_direct_interval_ms: u64 => "PROXYSCAN_SCAN_DIRECT_INTERVAL_MS",
    scan_jitter_ms: u64 => "PROXYSCAN_SCAN_JITTER_MS",
    scan_require_proxies: bool => "PROXYSCAN_SCAN_REQUIRE_PROXIES",
    scan_proxy_max_consecutive_fails: u32 => "PROXYSCAN_SCAN_PROXY_MAX_CONSECUTIVE_FAILS",
    scan_proxy_disable_for_ms: u64 => "PROXYSCAN_SCAN_PROXY_DISABLE_FOR_MS",
    scan_breaker_max_consecutive_fails: u32 => "PROXYSCAN_SCAN_BREAKER_MAX_CONSECUTIVE_FAILS",
    scan_breaker_on_429: bool => "PROXYSCAN_SCAN_BREAKER_ON_429",
    scan_backoff_base_ms: u64 => "PROXYSCAN_SCAN_BACKOFF_BASE_MS",
    scan_backoff_max_ms: u64 => "PROXYSCAN_SCAN_BACKOFF_MAX_MS",
    scan_rate_limit_retry_after_ms: u64 => "PROXYSCAN_SCAN_RATE_LIMIT_RETRY_AFTER_MS",
    scan_failure_retry_after_ms: u64 => "PROXYSCAN_SCAN_FAILURE_RETRY_AFTER_MS",
    scan_fresh_success_ttl_secs: u64 => "PROXYSCAN_SCAN_FRESH_SUCCESS_TTL_SECS",
    scan_permanent_statuses: Vec<u16> => "PROXYSCAN_SCAN_PERMANENT_STATUSES",
    scan_adjust_cooldown_ms: u64 => "PROXYSCAN_SCAN_ADJUST_COOLDOWN_MS",
    scan_idle_poll_ms: u64 => "PROXYSCAN_SCAN_IDLE_POLL_MS",
    state_path: PathBuf => "PROXYSCAN_STATE_PATH",
    state_busy_timeout_ms: u64 => "PROXYSCAN_STATE_BUSY_TIMEOUT_MS",
    state_max_connections: u32 => "PROXYSCAN_STATE_MAX_CONNECTIONS",
    log_level: String => "PROXYSCAN_LOG_LEVEL",
    log_format: String => "PROXYSCAN_LOG_FORMAT",
}

const DEFAULT_ALT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

impl Config {
    /// Load configuration from `PROXYSCAN_*` environment variables
    ///
    /// Engine binaries that are not configured explicitly are looked up on `PATH`.
    pub fn from_env() -> Result<Self> {
        let env_layer = ConfigOptions::from_env_with(|key| env::var(key).ok())?;
        let mut config = Self::resolve(
            ConfigOptions::default(),
            ConfigOptions::default(),
            env_layer,
        )?;
        config
            .engine
            .locate_binaries(env::var_os("PATH").as_deref());
        Ok(config)
    }

    /// Merge the layers with precedence env > call > file > defaults
    pub fn resolve(file: ConfigOptions, call: ConfigOptions, env: ConfigOptions) -> Result<Self> {
        let merged = file.overlay(call).overlay(env);
        let config = Self::from_options(merged)?;
        config.validate()?;
        Ok(config)
    }

    fn from_options(o: ConfigOptions) -> Result<Self> {
        let pool_size = o.pool_size.unwrap_or(5);

        Ok(Config {
            pool: PoolConfig {
                enabled: o.pool_enabled.unwrap_or(false),
                required: o.pool_required.unwrap_or(false),
                size: pool_size,
                min_ready: o.pool_min_ready.unwrap_or(1),
                max_probe: o.pool_max_probe.unwrap_or(50),
                workers: o.pool_workers.unwrap_or(4),
                startup_grace: ms(o.pool_startup_grace_ms, 1_500),
                refill_interval: ms(o.pool_refill_interval_ms, 60_000),
                refill_cooldown: ms(o.pool_refill_cooldown_ms, 30_000),
                health_interval: ms(o.pool_health_interval_ms, 120_000),
                health_fail_threshold: o.pool_health_fail_threshold.unwrap_or(2),
                base_port: o.pool_base_port.unwrap_or(17_890),
                port_count: o.pool_port_count.unwrap_or(200),
                work_dir: o
                    .pool_work_dir
                    .unwrap_or_else(|| env::temp_dir().join("proxyscan")),
            },
            engine: EngineConfig {
                mode: o.engine_mode.unwrap_or_default(),
                xray_bin: o.engine_xray_bin,
                mihomo_bin: o.engine_mihomo_bin,
            },
            subscription: SubscriptionConfig {
                urls: o.subscription_urls.unwrap_or_default(),
                retries: o.subscription_retries.unwrap_or(3),
                backoff_base: ms(o.subscription_backoff_ms, 1_000),
                timeout: ms(o.subscription_timeout_ms, 20_000),
                cache_dir: o.subscription_cache_dir,
                cache_ttl: Duration::from_secs(o.subscription_cache_ttl_secs.unwrap_or(24 * 3600)),
                user_agent: o
                    .subscription_user_agent
                    .unwrap_or_else(|| "clash.meta".to_string()),
                alt_user_agent: o
                    .subscription_alt_user_agent
                    .unwrap_or_else(|| DEFAULT_ALT_USER_AGENT.to_string()),
            },
            probe: ProbeConfig {
                url: o.probe_url.unwrap_or_default(),
                timeout: ms(o.probe_timeout_ms, 10_000),
                headers: parse_headers(o.probe_headers.unwrap_or_default())?,
                ok_statuses: o.probe_ok_statuses.unwrap_or_else(|| vec![400, 403, 404, 424]),
                max_body_bytes: o.probe_max_body_bytes.unwrap_or(64 * 1024),
            },
            scan: ScanConfig {
                domain: o.scan_domain.unwrap_or_else(|| "default".to_string()),
                max_workers: o.scan_max_workers.unwrap_or(8),
                fetch_timeout: ms(o.scan_fetch_timeout_ms, 15_000),
                request_interval: ms(o.scan_request_interval_ms, 20_000),
                direct_interval: ms(o.scan_direct_interval_ms, 20_000),
                jitter: ms(o.scan_jitter_ms, 2_000),
                require_proxies: o.scan_require_proxies.unwrap_or(false),
                proxy_max_consecutive_fails: o.scan_proxy_max_consecutive_fails.unwrap_or(30),
                proxy_disable_for: ms(o.scan_proxy_disable_for_ms, 10 * 60_000),
                breaker_max_consecutive_fails: o.scan_breaker_max_consecutive_fails.unwrap_or(5),
                breaker_on_429: o.scan_breaker_on_429.unwrap_or(true),
                backoff_base: ms(o.scan_backoff_base_ms, 5_000),
                backoff_max: ms(o.scan_backoff_max_ms, 120_000),
                rate_limit_retry_after: ms(o.scan_rate_limit_retry_after_ms, 5 * 60_000),
                failure_retry_after: ms(o.scan_failure_retry_after_ms, 30 * 60_000),
                fresh_success_ttl: Duration::from_secs(o.scan_fresh_success_ttl_secs.unwrap_or(0)),
                permanent_statuses: o
                    .scan_permanent_statuses
                    .unwrap_or_else(|| vec![400, 403, 404]),
                adjust_cooldown: ms(o.scan_adjust_cooldown_ms, 5_000),
                idle_poll: ms(o.scan_idle_poll_ms, 250),
            },
            state: StateConfig {
                path: o
                    .state_path
                    .unwrap_or_else(|| PathBuf::from("proxyscan.db")),
                busy_timeout: ms(o.state_busy_timeout_ms, 5_000),
                max_connections: o.state_max_connections.unwrap_or(5),
            },
            log: LogConfig {
                level: o.log_level.unwrap_or_else(|| "info".to_string()),
                format: o.log_format.unwrap_or_else(|| "json".to_string()),
            },
        })
    }

    fn validate(&self) -> Result<()> {
        if self.pool.enabled {
            if self.pool.size == 0 {
                return Err(invalid("pool size must be at least 1"));
            }
            if self.pool.min_ready == 0 || self.pool.min_ready > self.pool.size {
                return Err(invalid("pool min_ready must be between 1 and the pool size"));
            }
            if self.pool.workers == 0 {
                return Err(invalid("pool workers must be at least 1"));
            }
            if usize::from(self.pool.port_count) < self.pool.size {
                return Err(invalid("pool port_count must cover the pool size"));
            }
            if self.subscription.urls.is_empty() {
                return Err(invalid(
                    "PROXYSCAN_SUBSCRIPTION_URLS is required when the pool is enabled",
                ));
            }
            if self.probe.url.is_empty() {
                return Err(invalid("PROXYSCAN_PROBE_URL is required when the pool is enabled"));
            }
        }

        if !self.probe.url.is_empty() {
            Url::parse(&self.probe.url)
                .map_err(|e| invalid(&format!("PROXYSCAN_PROBE_URL must be a valid URL: {}", e)))?;
        }
        for url in &self.subscription.urls {
            Url::parse(url).map_err(|e| {
                invalid(&format!("subscription URL {} is not a valid URL: {}", url, e))
            })?;
        }

        if self.scan.max_workers == 0 {
            return Err(invalid("scan max_workers must be at least 1"));
        }
        if self.scan.breaker_max_consecutive_fails == 0 {
            return Err(invalid("scan breaker threshold must be at least 1"));
        }
        if self.scan.backoff_max < self.scan.backoff_base {
            return Err(invalid("scan backoff_max must not be below backoff_base"));
        }

        match self.log.format.as_str() {
            "json" | "pretty" => Ok(()),
            other => Err(invalid(&format!("unknown log format: {}", other))),
        }
    }
}

fn invalid(msg: &str) -> ProxyScanError {
    ProxyScanError::InvalidConfig(msg.to_string())
}

fn ms(value: Option<u64>, default: u64) -> Duration {
    Duration::from_millis(value.unwrap_or(default))
}

/// Parse `Name: value` header entries
fn parse_headers(raw: Vec<String>) -> Result<Vec<(String, String)>> {
    raw.into_iter()
        .map(|entry| {
            let (name, value) = entry
                .split_once(':')
                .ok_or_else(|| invalid(&format!("probe header must be `Name: value`: {}", entry)))?;
            let name = name.trim();
            if name.is_empty() {
                return Err(invalid(&format!("probe header has an empty name: {}", entry)));
            }
            Ok((name.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// A value that can be read from one environment variable
trait EnvValue: Sized {
    fn parse_env(raw: &str) -> Option<Self>;
}

macro_rules! env_value_from_str {
    ($($ty:ty),*) => {
        $(
            impl EnvValue for $ty {
                fn parse_env(raw: &str) -> Option<Self> {
                    raw.trim().parse().ok()
                }
            }
        )*
    };
}

env_value_from_str!(u16, u32, u64, usize);

impl EnvValue for bool {
    fn parse_env(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        }
    }
}

impl EnvValue for String {
    fn parse_env(raw: &str) -> Option<Self> {
        Some(raw.trim().to_string())
    }
}

impl EnvValue for PathBuf {
    fn parse_env(raw: &str) -> Option<Self> {
        Some(PathBuf::from(raw.trim()))
    }
}

impl EnvValue for EngineMode {
    fn parse_env(raw: &str) -> Option<Self> {
        raw.parse().ok()
    }
}

// Comma-separated lists
impl EnvValue for Vec<String> {
    fn parse_env(raw: &str) -> Option<Self> {
        Some(
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        )
    }
}

impl EnvValue for Vec<u16> {
    fn parse_env(raw: &str) -> Option<Self> {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.parse().ok())
            .collect()
    }
}

fn env_value<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: EnvValue,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => T::parse_env(&raw).map(Some).ok_or_else(|| {
            ProxyScanError::InvalidConfig(format!("{} has an invalid value: {}", key, raw))
        }),
    }
}

/// Find an executable named `name` in a `PATH`-style list
pub fn find_in_path(name: &str, path_var: &OsStr) -> Option<PathBuf> {
    env::split_paths(path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
