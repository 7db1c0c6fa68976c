use chrono::{DateTime, Duration, Utc};

/// Buffer after a window's fire time before it is considered closed.
pub const DEFAULT_GRACE_PERIOD_MS: i64 = 3_000;

/// Why an instance may or may not fire right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    /// No event observed for the partition yet.
    NoWatermark,
    /// Watermark passed fire time by at least the grace period.
    Closed { gap_ms: i64 },
    /// Still inside the grace period, but the partition has been quiet longer
    /// than the allowed gap; fired anyway so the window does not starve.
    Stale { gap_ms: i64, idle_ms: i64 },
    /// Inside the grace period and the partition is still moving.
    Waiting { gap_ms: i64 },
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Eligibility::Closed { .. } | Eligibility::Stale { .. })
    }

    pub fn is_forced(&self) -> bool {
        matches!(self, Eligibility::Stale { .. })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FirePolicy {
    pub grace_period: Duration,
}

impl Default for FirePolicy {
    fn default() -> Self {
        Self {
            grace_period: Duration::milliseconds(DEFAULT_GRACE_PERIOD_MS),
        }
    }
}

impl FirePolicy {
    pub fn new(grace_period: Duration) -> Self {
        Self { grace_period }
    }

    /// Decides whether an instance with `fire_time` may fire at wall-clock `now`.
    ///
    /// `last_advanced_at` is when the partition watermark last moved forward;
    /// the staleness branch only applies when `max_gap_seconds` is configured.
    pub fn evaluate(
        &self,
        fire_time: DateTime<Utc>,
        watermark: Option<DateTime<Utc>>,
        last_advanced_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        max_gap_seconds: Option<u64>,
    ) -> Eligibility {
        let Some(watermark) = watermark else {
            return Eligibility::NoWatermark;
        };
        let gap_ms = (watermark - fire_time).num_milliseconds();
        if gap_ms >= self.grace_period.num_milliseconds() {
            return Eligibility::Closed { gap_ms };
        }
        if let (Some(last), Some(max_gap)) = (last_advanced_at, max_gap_seconds) {
            let idle_ms = (now - last).num_milliseconds();
            let allowed_ms = i64::try_from(max_gap).unwrap_or(i64::MAX / 1_000).saturating_mul(1_000);
            if idle_ms > allowed_ms {
                return Eligibility::Stale { gap_ms, idle_ms };
            }
        }
        Eligibility::Waiting { gap_ms }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn ms(n: i64) -> Duration {
        Duration::milliseconds(n)
    }

    #[test]
    fn unknown_watermark_never_fires() {
        let p = FirePolicy::default();
        let e = p.evaluate(t0(), None, Some(t0() - ms(60_000)), t0(), Some(1));
        assert_eq!(e, Eligibility::NoWatermark);
        assert!(!e.is_eligible());
    }

    #[test]
    fn grace_period_elapsed_fires() {
        let p = FirePolicy::default();
        let e = p.evaluate(t0(), Some(t0() + ms(3_000)), None, t0(), None);
        assert_eq!(e, Eligibility::Closed { gap_ms: 3_000 });
        assert!(e.is_eligible());
        assert!(!e.is_forced());
    }

    #[test]
    fn inside_grace_without_gap_config_waits() {
        let p = FirePolicy::default();
        let e = p.evaluate(t0(), Some(t0() + ms(1_000)), Some(t0()), t0() + ms(60_000), None);
        assert_eq!(e, Eligibility::Waiting { gap_ms: 1_000 });
    }

    #[test]
    fn quiet_partition_forces_fire() {
        let p = FirePolicy::default();
        let last = t0();
        let e = p.evaluate(t0(), Some(t0() + ms(1_000)), Some(last), last + ms(6_000), Some(5));
        assert_eq!(e, Eligibility::Stale { gap_ms: 1_000, idle_ms: 6_000 });
        assert!(e.is_eligible());
        assert!(e.is_forced());
    }

    #[test]
    fn idle_exactly_at_limit_still_waits() {
        let p = FirePolicy::default();
        let last = t0();
        let e = p.evaluate(t0(), Some(t0() + ms(1_000)), Some(last), last + ms(5_000), Some(5));
        assert!(!e.is_eligible());
    }

    #[test]
    fn watermark_behind_fire_time_waits() {
        let p = FirePolicy::default();
        let e = p.evaluate(t0(), Some(t0() - ms(500)), Some(t0()), t0(), Some(5));
        assert_eq!(e, Eligibility::Waiting { gap_ms: -500 });
    }

    #[test]
    fn custom_grace_period() {
        let p = FirePolicy::new(ms(0));
        assert!(p.evaluate(t0(), Some(t0()), None, t0(), None).is_eligible());
        assert!(!p.evaluate(t0(), Some(t0() - ms(1)), None, t0(), None).is_eligible());
    }
}
