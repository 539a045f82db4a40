use std::ops::RangeInclusive;
use std::time::Duration;

/// Timing and sizing knobs for one peer link.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub polling: PollingConfig,
    pub delivery: DeliveryConfig,
    pub liveness: LivenessConfig,
    pub watchdog: WatchdogConfig,
    /// Upper bound for `PeerLink::wait_until_open`.
    pub establish_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PollingConfig {
    pub base_interval: Duration,
    pub max_interval: Duration,
    pub backoff_factor: f64,
    pub failure_threshold: u32,
    /// Polling gives up after this long if the peer never connects.
    pub unconnected_window: Duration,
    /// Cadence once connected, kept to pick up late renegotiation.
    pub connected_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub max_attempts: u32,
    pub answer_ack_timeout: Duration,
    pub standard_ack_timeout: Duration,
    pub retry_interval: Duration,
    pub ack_history: usize,
    pub inbound_history: usize,
}

#[derive(Debug, Clone)]
pub struct LivenessConfig {
    pub interval: Duration,
    pub disconnect_after: u32,
    /// How long the transport may keep failing to report `Connected` once
    /// liveness has declared the link down before recovery is forced.
    pub transport_grace: Duration,
}

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub check_interval: Duration,
    pub disconnected_threshold: Duration,
    pub connecting_threshold: Duration,
    /// Randomized delay before a recovery attempt, in milliseconds.
    pub jitter_ms: RangeInclusive<u64>,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_millis(1000),
            max_interval: Duration::from_millis(5000),
            backoff_factor: 1.5,
            failure_threshold: 5,
            unconnected_window: Duration::from_secs(10 * 60),
            connected_interval: Duration::from_secs(5),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            answer_ack_timeout: Duration::from_millis(1000),
            standard_ack_timeout: Duration::from_millis(3000),
            retry_interval: Duration::from_millis(1000),
            ack_history: 100,
            inbound_history: 1000,
        }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            disconnect_after: 3,
            transport_grace: Duration::from_secs(5),
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            disconnected_threshold: Duration::from_secs(12),
            connecting_threshold: Duration::from_secs(20),
            jitter_ms: 1000..=3000,
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        let polling = PollingConfig::default();
        let establish_timeout = polling.unconnected_window;
        Self {
            polling,
            delivery: DeliveryConfig::default(),
            liveness: LivenessConfig::default(),
            watchdog: WatchdogConfig::default(),
            establish_timeout,
        }
    }
}

impl LinkConfig {
    /// Defaults with `QUIZLINK_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ms) = env_millis("QUIZLINK_POLL_INTERVAL_MS") {
            config.polling.base_interval = ms;
        }
        if let Some(ms) = env_millis("QUIZLINK_POLL_MAX_INTERVAL_MS") {
            config.polling.max_interval = ms;
        }
        if let Some(secs) = env_u64("QUIZLINK_POLL_WINDOW_SECS") {
            config.polling.unconnected_window = Duration::from_secs(secs);
            config.establish_timeout = config.polling.unconnected_window;
        }
        if let Some(attempts) = env_u64("QUIZLINK_MAX_ATTEMPTS") {
            config.delivery.max_attempts = attempts.clamp(1, u32::MAX as u64) as u32;
        }
        if let Some(ms) = env_millis("QUIZLINK_HEARTBEAT_MS") {
            config.liveness.interval = ms;
        }
        if let Some(secs) = env_u64("QUIZLINK_ESTABLISH_TIMEOUT_SECS") {
            config.establish_timeout = Duration::from_secs(secs);
        }
        config
    }
}

fn env_u64(var: &str) -> Option<u64> {
    std::env::var(var)
        .ok()
        .and_then(|value| value.trim().parse().ok())
}

fn env_millis(var: &str) -> Option<Duration> {
    env_u64(var).filter(|ms| *ms > 0).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variable tests must not interleave.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_match_protocol_constants() {
        let config = LinkConfig::default();
        assert_eq!(config.polling.base_interval, Duration::from_millis(1000));
        assert_eq!(config.polling.max_interval, Duration::from_millis(5000));
        assert_eq!(config.delivery.max_attempts, 5);
        assert_eq!(config.delivery.ack_history, 100);
        assert_eq!(config.delivery.inbound_history, 1000);
        assert_eq!(config.liveness.interval, Duration::from_secs(3));
        assert_eq!(config.establish_timeout, Duration::from_secs(600));
    }

    #[test]
    fn env_overrides_apply() {
        let _lock = ENV_MUTEX.lock().unwrap();
        std::env::set_var("QUIZLINK_POLL_INTERVAL_MS", "250");
        std::env::set_var("QUIZLINK_MAX_ATTEMPTS", "0");
        let config = LinkConfig::from_env();
        std::env::remove_var("QUIZLINK_POLL_INTERVAL_MS");
        std::env::remove_var("QUIZLINK_MAX_ATTEMPTS");

        assert_eq!(config.polling.base_interval, Duration::from_millis(250));
        assert_eq!(config.delivery.max_attempts, 1);
    }
}
