//! Configuration
//!
//! Defaults work for an unmodified host. Each field can be overridden from
//! the environment, read once when the host calls [`Config::from_env`]:
//!
//! - `APF_RUNTIME_MODULE`: file name of the runtime image (`clr.dll`)
//! - `APF_RUNTIME_VERSION`: `major.minor.build` used for the channel name
//!   and for picking the detector variant
//! - `APF_RETRY_ATTEMPTS`, `APF_RETRY_INTERVAL_MS`: eviction retry budget,
//!   capped at [`MAX_RETRY_WAIT`] of total sleep
//! - `APF_SKIP_EVICTION`: only try to create the channel, never evict
//!
//! Values that fail to parse are logged and ignored.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Three-part runtime version, as embedded in the attach channel name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeVersion {
    pub major: u16,
    pub minor: u16,
    pub build: u32,
}

impl RuntimeVersion {
    pub const V2_0_50727: RuntimeVersion = RuntimeVersion::new(2, 0, 50727);
    pub const V4_0_30319: RuntimeVersion = RuntimeVersion::new(4, 0, 30319);

    pub const fn new(major: u16, minor: u16, build: u32) -> Self {
        Self { major, minor, build }
    }
}

impl fmt::Display for RuntimeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.build)
    }
}

impl FromStr for RuntimeVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().trim_start_matches(['v', 'V']);
        let mut parts = s.split('.');
        let (Some(major), Some(minor), Some(build), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(format!("expected major.minor.build, got '{}'", s));
        };
        let field = |p: &str| p.parse::<u32>().map_err(|e| format!("'{}': {}", p, e));
        let major = u16::try_from(field(major)?).map_err(|e| e.to_string())?;
        let minor = u16::try_from(field(minor)?).map_err(|e| e.to_string())?;
        Ok(Self::new(major, minor, field(build)?))
    }
}

/// Hard cap on the time the eviction loop may sleep.
pub const MAX_RETRY_WAIT: Duration = Duration::from_millis(500);

const DEFAULT_RETRY_ATTEMPTS: u32 = 50;
const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Runtime images this crate has signatures for.
pub const KNOWN_RUNTIMES: &[(&str, RuntimeVersion)] = &[
    ("clr.dll", RuntimeVersion::V4_0_30319),
    ("mscorwks.dll", RuntimeVersion::V2_0_50727),
];

/// The runtime image to inspect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeTarget {
    pub module: String,
    pub version: RuntimeVersion,
}

impl RuntimeTarget {
    pub fn new(module: impl Into<String>, version: RuntimeVersion) -> Self {
        Self {
            module: module.into(),
            version,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Runtime to inspect. `None` means autodetect from loaded modules.
    pub runtime: Option<RuntimeTarget>,
    /// Channel creation retries after the listener has been poked.
    pub retry_attempts: u32,
    /// Sleep between retries.
    pub retry_interval: Duration,
    /// Whether an existing listener may be evicted at all.
    pub allow_eviction: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            runtime: None,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            allow_eviction: true,
        }
    }
}

impl Config {
    /// Defaults overridden by `APF_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_runtime(mut self, target: RuntimeTarget) -> Self {
        self.runtime = Some(target);
        self
    }

    /// Attempts and interval the eviction loop actually uses. A zero interval
    /// falls back to the default, and attempts are cut so the total sleep
    /// stays within [`MAX_RETRY_WAIT`].
    pub fn retry_budget(&self) -> (u32, Duration) {
        let interval = match self.retry_interval {
            d if d.is_zero() => DEFAULT_RETRY_INTERVAL,
            d => d.min(MAX_RETRY_WAIT),
        };
        let most = MAX_RETRY_WAIT.as_nanos() / interval.as_nanos();
        let attempts = u32::try_from(most).map_or(self.retry_attempts, |most| self.retry_attempts.min(most));
        (attempts, interval)
    }

    /// Upper bound of time spent sleeping in the eviction retry loop.
    pub fn max_retry_wait(&self) -> Duration {
        let (attempts, interval) = self.retry_budget();
        interval.saturating_mul(attempts)
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let module = lookup("APF_RUNTIME_MODULE").filter(|m| !m.trim().is_empty());
        let version = lookup("APF_RUNTIME_VERSION").and_then(|v| match v.parse::<RuntimeVersion>() {
            Ok(version) => Some(version),
            Err(e) => {
                log::warn!("[CONFIG] Ignoring APF_RUNTIME_VERSION: {}", e);
                None
            }
        });

        self.runtime = match (module, version) {
            (Some(module), Some(version)) => Some(RuntimeTarget::new(module.trim(), version)),
            (Some(module), None) => known_version(module.trim()).map(|v| RuntimeTarget::new(module.trim(), v)),
            (None, Some(version)) => {
                known_module(version).map(|m| RuntimeTarget::new(m, version))
            }
            (None, None) => self.runtime,
        };

        if let Some(attempts) = parse_var(&lookup, "APF_RETRY_ATTEMPTS") {
            self.retry_attempts = attempts;
        }
        match parse_var::<u64>(&lookup, "APF_RETRY_INTERVAL_MS") {
            Some(0) => log::warn!("[CONFIG] Ignoring APF_RETRY_INTERVAL_MS=0"),
            Some(ms) => self.retry_interval = Duration::from_millis(ms),
            None => {}
        }
        if self.retry_interval.saturating_mul(self.retry_attempts) > MAX_RETRY_WAIT {
            let (attempts, interval) = self.retry_budget();
            log::warn!(
                "[CONFIG] Retry budget {} x {:?} exceeds {:?}; using {} x {:?}",
                self.retry_attempts,
                self.retry_interval,
                MAX_RETRY_WAIT,
                attempts,
                interval
            );
            self.retry_attempts = attempts;
            self.retry_interval = interval;
        }
        if lookup("APF_SKIP_EVICTION").is_some() {
            log::info!("[CONFIG] Eviction disabled via environment");
            self.allow_eviction = false;
        }
        self
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T::Err: fmt::Display,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(e) => {
            log::warn!("[CONFIG] Ignoring {}='{}': {}", key, raw, e);
            None
        }
    }
}

/// Version of a known runtime module, matched case-insensitively.
pub fn known_version(module: &str) -> Option<RuntimeVersion> {
    KNOWN_RUNTIMES
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(module))
        .map(|&(_, v)| v)
}

/// Module of a known runtime with the same major version.
pub fn known_module(version: RuntimeVersion) -> Option<&'static str> {
    KNOWN_RUNTIMES
        .iter()
        .find(|(_, v)| v.major == version.major)
        .map(|&(name, _)| name)
}
