use std::time::Duration;

const MATCH_WINDOW_SECS: u64 = 15;
const POLL_INTERVAL_SECS: u64 = 15;
const GC_INTERVAL_SECS: u64 = 10;
const GC_MAX_AGE_SECS: u64 = 30;
const RECONNECT_SPACING_SECS: u64 = 1;
const PING_INTERVAL_SECS: u64 = 10;
const PONG_DEADLINE_SECS: u64 = 20;
const MAX_ORPHAN_RETRIES: u32 = 5;

/// Tunables of one sync engine. Every knob is independent; the defaults are
/// what production uses. All intervals must be nonzero.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SyncConfig {
    /// How far apart the local and server creation instants of a comment
    /// may be for an optimistic placeholder to still be matched.
    pub match_window: Duration,
    /// Spacing of full REST reads while the live feed is down.
    pub poll_interval: Duration,
    /// Spacing of garbage collection sweeps.
    pub gc_interval: Duration,
    /// Age past which an unconfirmed optimistic comment is swept.
    pub gc_max_age: Duration,
    /// Pause between losing the feed connection and the next attempt.
    pub reconnect_spacing: Duration,
    /// Spacing of keepalive pings on the live feed.
    pub ping_interval: Duration,
    /// Silence after which the feed connection is considered dead.
    pub pong_deadline: Duration,
    /// How many times a comment waiting for its parent is retried before
    /// being dropped.
    pub max_orphan_retries: u32,
}

impl Default for SyncConfig {
    fn default() -> SyncConfig {
        SyncConfig {
            match_window: Duration::from_secs(MATCH_WINDOW_SECS),
            poll_interval: Duration::from_secs(POLL_INTERVAL_SECS),
            gc_interval: Duration::from_secs(GC_INTERVAL_SECS),
            gc_max_age: Duration::from_secs(GC_MAX_AGE_SECS),
            reconnect_spacing: Duration::from_secs(RECONNECT_SPACING_SECS),
            ping_interval: Duration::from_secs(PING_INTERVAL_SECS),
            pong_deadline: Duration::from_secs(PONG_DEADLINE_SECS),
            max_orphan_retries: MAX_ORPHAN_RETRIES,
        }
    }
}

/// Widens a std duration into the chrono one used for timestamp math.
pub(crate) fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::max_value())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_the_documented_constants() {
        let cfg = SyncConfig::default();
        assert_eq!(cfg.match_window, Duration::from_secs(15));
        assert_eq!(cfg.poll_interval, Duration::from_secs(15));
        assert_eq!(cfg.gc_interval, Duration::from_secs(10));
        assert_eq!(cfg.gc_max_age, Duration::from_secs(30));
        assert_eq!(cfg.reconnect_spacing, Duration::from_secs(1));
    }

    #[test]
    fn chrono_widening_is_lossless_for_sane_values() {
        assert_eq!(chrono_duration(Duration::from_secs(15)), chrono::Duration::seconds(15));
    }
}
