use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::{Growth, RetryPolicy};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(8);

#[derive(Clone, Debug)]
pub struct Config {
    pub driver_id: String,
    pub listen_addr: SocketAddr,
    pub session_path: Option<PathBuf>,
    pub reconciler: ReconcilerConfig,
    pub queue: QueueConfig,
}

#[derive(Clone, Debug)]
pub struct ReconcilerConfig {
    pub request_timeout: Duration,
    pub fetch_attempts: u32,
    pub fetch_base_delay: Duration,
    pub feed_attempts: u32,
    pub feed_base_delay: Duration,
    /// Pause before checking confirmation after the server accepted.
    pub consistency_delay: Duration,
    pub load_retry_delay: Duration,
    pub error_banner: Duration,
    pub counter_banner: Duration,
    pub refresh_interval: Option<Duration>,
}

#[derive(Clone, Debug)]
pub struct QueueConfig {
    pub presentation_timeout: Duration,
    /// Longest the host may take to put an offer on screen.
    pub show_timeout: Duration,
    pub pacing_delay: Duration,
    pub debounce: Duration,
    pub alert_window: Duration,
}

#[derive(Clone, Debug)]
pub struct BackendConfig {
    pub api_base: String,
    pub api_key: String,
    /// How often the change feeds poll for new rows.
    pub poll_interval: Duration,
    pub request_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            driver_id: "driver-1".into(),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            session_path: None,
            reconciler: ReconcilerConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            fetch_attempts: 3,
            fetch_base_delay: Duration::from_secs(1),
            feed_attempts: 5,
            feed_base_delay: Duration::from_secs(5),
            consistency_delay: Duration::from_millis(500),
            load_retry_delay: Duration::from_secs(3),
            error_banner: Duration::from_secs(2),
            counter_banner: Duration::from_millis(1500),
            refresh_interval: None,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            presentation_timeout: Duration::from_secs(30),
            show_timeout: Duration::from_secs(5),
            pacing_delay: Duration::from_millis(500),
            debounce: Duration::from_millis(300),
            alert_window: Duration::from_secs(3),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let mut reconciler = ReconcilerConfig::default();
        reconciler.refresh_interval =
            env_parse::<u64>("REFRESH_INTERVAL_SECS").map(Duration::from_secs);

        let mut queue = QueueConfig::default();
        if let Some(secs) = env_parse::<u64>("PRESENTATION_TIMEOUT_SECS") {
            queue.presentation_timeout = Duration::from_secs(secs);
        }

        Self {
            driver_id: env::var("DRIVER_ID").unwrap_or(defaults.driver_id),
            listen_addr: env_parse("LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            session_path: env::var("SESSION_PATH").ok().map(PathBuf::from),
            reconciler,
            queue,
        }
    }
}

impl ReconcilerConfig {
    pub fn fetch_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.fetch_attempts,
            base_delay: self.fetch_base_delay,
            max_delay: self.request_timeout,
            timeout: self.request_timeout,
            growth: Growth::Exponential,
        }
    }

    pub fn feed_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.feed_attempts,
            base_delay: self.feed_base_delay,
            max_delay: self.feed_base_delay.saturating_mul(self.feed_attempts),
            timeout: self.request_timeout,
            growth: Growth::Linear,
        }
    }
}

impl BackendConfig {
    pub fn from_env() -> Result<Self, crate::error::Error> {
        Ok(Self {
            api_base: env::var("BACKEND_API_BASE")?,
            api_key: env::var("BACKEND_API_KEY")?,
            poll_interval: env_parse::<u64>("POLL_INTERVAL_MILLIS")
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_POLL_INTERVAL),
            request_timeout: env_parse::<u64>("REQUEST_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT),
        })
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}
