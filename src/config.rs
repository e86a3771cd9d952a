//! Server configuration.
//!
//! Defaults are the live tuning; every knob can be overridden with a
//! `RUGPULL_*` environment variable. Unparseable values fall back to the
//! default with a warning.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::game::candle::{DEFAULT_GROUP_DURATION_MS, DEFAULT_MERGE_THRESHOLD};
use crate::game::crash::CrashParams;
use crate::network::hub::HubConfig;
use crate::network::protocol::Topic;

/// Crash game loop settings.
#[derive(Debug, Clone)]
pub struct CrashConfig {
    /// Delay between price ticks.
    pub tick_interval: Duration,
    /// Betting window before the first tick.
    pub countdown: Duration,
    /// Pause after a game ends.
    pub cooldown: Duration,
    /// Finished games kept for `crash_history`.
    pub history_len: usize,
    /// Smallest accepted stake.
    pub min_bet: f64,
    /// Largest accepted stake.
    pub max_bet: f64,
    /// Width of the first candles of a game.
    pub candle_duration_ms: i64,
    /// Completed candles before a pairwise merge.
    pub merge_threshold: usize,
    /// Price walk tuning.
    pub params: CrashParams,
}

impl Default for CrashConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(500),
            countdown: Duration::from_secs(5),
            cooldown: Duration::from_secs(10),
            history_len: 10,
            min_bet: 0.001,
            max_bet: 100.0,
            candle_duration_ms: DEFAULT_GROUP_DURATION_MS,
            merge_threshold: DEFAULT_MERGE_THRESHOLD,
            params: CrashParams::default(),
        }
    }
}

/// Candleflip batch settings.
#[derive(Debug, Clone)]
pub struct CandleflipConfig {
    /// Delay between room ticks.
    pub tick_interval: Duration,
    /// Pause between rooms of a batch.
    pub room_gap: Duration,
    /// How long a finished batch stays visible.
    pub linger: Duration,
    /// Most rooms a single batch may open.
    pub max_rooms: u32,
    /// Lobby refresh period.
    pub rooms_broadcast_interval: Duration,
}

impl Default for CandleflipConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            room_gap: Duration::from_millis(500),
            linger: Duration::from_secs(5),
            max_rooms: 10,
            rooms_broadcast_interval: Duration::from_millis(200),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections (`0` = unlimited).
    pub max_connections: usize,
    /// Outbound frames buffered per connection before drops start.
    pub mailbox_capacity: usize,
    /// Chat lines replayed to new subscribers.
    pub chat_history: usize,
    /// Directory for the JSON-lines ledger; in-memory when unset.
    pub ledger_dir: Option<PathBuf>,
    /// Deadline for persistence writes.
    pub side_effect_timeout: Duration,
    /// Deadline for payout calls.
    pub payout_timeout: Duration,
    /// Server version string.
    pub version: String,
    /// Crash settings.
    pub crash: CrashConfig,
    /// Candleflip settings.
    pub candleflip: CandleflipConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            mailbox_capacity: 256,
            chat_history: 100,
            ledger_dir: None,
            side_effect_timeout: Duration::from_secs(5),
            payout_timeout: Duration::from_secs(30),
            version: env!("CARGO_PKG_VERSION").to_string(),
            crash: CrashConfig::default(),
            candleflip: CandleflipConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let crash = CrashConfig {
            tick_interval: parse_millis(get("RUGPULL_CRASH_TICK_MS"), "RUGPULL_CRASH_TICK_MS", defaults.crash.tick_interval),
            countdown: parse_secs(get("RUGPULL_COUNTDOWN_SECS"), "RUGPULL_COUNTDOWN_SECS", defaults.crash.countdown),
            cooldown: parse_secs(get("RUGPULL_COOLDOWN_SECS"), "RUGPULL_COOLDOWN_SECS", defaults.crash.cooldown),
            history_len: parse_or(get("RUGPULL_CRASH_HISTORY"), "RUGPULL_CRASH_HISTORY", defaults.crash.history_len),
            ..defaults.crash
        };

        let candleflip = CandleflipConfig {
            tick_interval: parse_millis(
                get("RUGPULL_CANDLEFLIP_TICK_MS"),
                "RUGPULL_CANDLEFLIP_TICK_MS",
                defaults.candleflip.tick_interval,
            ),
            max_rooms: parse_or(get("RUGPULL_MAX_ROOMS"), "RUGPULL_MAX_ROOMS", defaults.candleflip.max_rooms),
            ..defaults.candleflip
        };

        let mut config = Self {
            bind_addr: parse_or(get("RUGPULL_BIND_ADDR"), "RUGPULL_BIND_ADDR", defaults.bind_addr),
            max_connections: parse_or(get("RUGPULL_MAX_CONNECTIONS"), "RUGPULL_MAX_CONNECTIONS", defaults.max_connections),
            mailbox_capacity: parse_or(get("RUGPULL_MAILBOX_CAPACITY"), "RUGPULL_MAILBOX_CAPACITY", defaults.mailbox_capacity)
                .max(1),
            chat_history: parse_or(get("RUGPULL_CHAT_HISTORY"), "RUGPULL_CHAT_HISTORY", defaults.chat_history),
            ledger_dir: get("RUGPULL_LEDGER_DIR").map(PathBuf::from),
            side_effect_timeout: parse_secs(
                get("RUGPULL_SIDE_EFFECT_TIMEOUT_SECS"),
                "RUGPULL_SIDE_EFFECT_TIMEOUT_SECS",
                defaults.side_effect_timeout,
            ),
            payout_timeout: parse_secs(
                get("RUGPULL_PAYOUT_TIMEOUT_SECS"),
                "RUGPULL_PAYOUT_TIMEOUT_SECS",
                defaults.payout_timeout,
            ),
            version: defaults.version,
            crash,
            candleflip,
        };

        // Chat has no snapshot frame, so the whole backlog must fit one mailbox.
        if config.chat_history > config.mailbox_capacity {
            warn!(
                "RUGPULL_CHAT_HISTORY={} exceeds mailbox capacity {}, clamping",
                config.chat_history, config.mailbox_capacity
            );
            config.chat_history = config.mailbox_capacity;
        }
        config
    }

    /// Hub settings derived from this config.
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            max_connections: self.max_connections,
            retained: vec![(Topic::Chat, self.chat_history.min(self.mailbox_capacity))],
        }
    }
}

fn parse_or<T: FromStr>(raw: Option<String>, key: &str, default: T) -> T {
    match raw {
        Some(value) => match value.trim().parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!("Ignoring invalid {}={:?}", key, value);
                default
            }
        },
        None => default,
    }
}

/// Tick periods must be non-zero: `tokio::time::interval` panics on zero.
fn parse_millis(raw: Option<String>, key: &str, default: Duration) -> Duration {
    match raw.map(|v| parse_or(Some(v), key, default.as_millis() as u64)) {
        Some(0) => {
            warn!("Ignoring zero {}, using {:?}", key, default);
            default
        }
        Some(ms) => Duration::from_millis(ms),
        None => default,
    }
}

fn parse_secs(raw: Option<String>, key: &str, default: Duration) -> Duration {
    raw.map(|v| Duration::from_secs(parse_or(Some(v), key, default.as_secs())))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.crash.tick_interval, Duration::from_millis(500));
        assert_eq!(config.crash.params.max_ticks, 5000);
        assert_eq!(config.candleflip.max_rooms, 10);
        assert!(config.ledger_dir.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("RUGPULL_BIND_ADDR", "127.0.0.1:9000"),
            ("RUGPULL_MAX_ROOMS", "4"),
            ("RUGPULL_CRASH_TICK_MS", "250"),
            ("RUGPULL_LEDGER_DIR", "/tmp/rugpull"),
            ("RUGPULL_CHAT_HISTORY", "20"),
        ]));
        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.candleflip.max_rooms, 4);
        assert_eq!(config.crash.tick_interval, Duration::from_millis(250));
        assert_eq!(config.ledger_dir, Some(PathBuf::from("/tmp/rugpull")));
        assert_eq!(config.hub_config().retained, vec![(Topic::Chat, 20)]);
    }

    #[test]
    fn test_bad_values_fall_back() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("RUGPULL_MAX_CONNECTIONS", "lots"),
            ("RUGPULL_COUNTDOWN_SECS", "-3"),
            ("RUGPULL_BIND_ADDR", ""),
        ]));
        let defaults = ServerConfig::default();
        assert_eq!(config.max_connections, defaults.max_connections);
        assert_eq!(config.crash.countdown, defaults.crash.countdown);
        assert_eq!(config.bind_addr, defaults.bind_addr);
    }

    #[test]
    fn test_zero_tick_intervals_fall_back() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("RUGPULL_CRASH_TICK_MS", "0"),
            ("RUGPULL_CANDLEFLIP_TICK_MS", "0"),
        ]));
        let defaults = ServerConfig::default();
        assert_eq!(config.crash.tick_interval, defaults.crash.tick_interval);
        assert_eq!(config.candleflip.tick_interval, defaults.candleflip.tick_interval);
        assert!(!config.crash.tick_interval.is_zero());
    }

    #[test]
    fn test_chat_history_fits_mailbox() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("RUGPULL_CHAT_HISTORY", "500"),
            ("RUGPULL_MAILBOX_CAPACITY", "64"),
        ]));
        assert_eq!(config.mailbox_capacity, 64);
        assert_eq!(config.chat_history, 64);
        assert_eq!(config.hub_config().retained, vec![(Topic::Chat, 64)]);

        let manual = ServerConfig {
            chat_history: 300,
            mailbox_capacity: 16,
            ..ServerConfig::default()
        };
        assert_eq!(manual.hub_config().retained, vec![(Topic::Chat, 16)]);
    }
}
