use chrono::{DateTime, FixedOffset, Offset, Utc};
use log::{debug, warn};

/// Placeholder timestamp used until the first successful time sync.
pub const UNSYNCED_TIMESTAMP: &str = "--";

/// A network time source.
pub trait NetworkClock {
    fn start(&mut self) -> Result<(), crate::LinkError>;

    /// Returns true when the clock holds a synchronised time.
    fn update(&mut self) -> bool;

    /// Asks the source to resynchronise now.
    fn force_update(&mut self) -> bool;

    fn now_utc(&self) -> Option<DateTime<Utc>>;
}

/// Caches the day and time stamps applied to readings.
#[derive(Debug)]
pub struct TimeKeeper<C> {
    clock: C,
    offset: FixedOffset,
    refresh_ms: u64,
    last_refresh_ms: Option<u64>,
    day_stamp: Option<String>,
    time_stamp: Option<String>,
}

impl<C: NetworkClock> TimeKeeper<C> {
    pub fn new(clock: C, utc_offset_secs: i32, refresh_ms: u64) -> Self {
        let offset = FixedOffset::east_opt(utc_offset_secs).unwrap_or_else(|| {
            warn!("invalid utc offset {utc_offset_secs}s; using UTC");
            Utc.fix()
        });

        Self {
            clock,
            offset,
            refresh_ms,
            last_refresh_ms: None,
            day_stamp: None,
            time_stamp: None,
        }
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn clock_mut(&mut self) -> &mut C {
        &mut self.clock
    }

    pub fn start(&mut self) -> Result<(), crate::LinkError> {
        self.clock.start()
    }

    pub fn is_synced(&self) -> bool {
        self.day_stamp.is_some()
    }

    /// Updates the cached stamps at most once per refresh interval.
    ///
    /// A failed update gets exactly one forced retry. On failure the previous stamps
    /// are kept.
    pub fn refresh(&mut self, now_ms: u64) -> bool {
        if let Some(last) = self.last_refresh_ms {
            if now_ms.saturating_sub(last) < self.refresh_ms {
                return self.is_synced();
            }
        }
        self.last_refresh_ms = Some(now_ms);

        if !self.clock.update() {
            debug!("time update failed; forcing resync");
            if !self.clock.force_update() {
                return false;
            }
        }

        let Some(now) = self.clock.now_utc() else {
            return false;
        };

        let local = now.with_timezone(&self.offset);
        self.day_stamp = Some(local.format("%Y-%m-%d").to_string());
        self.time_stamp = Some(local.format("%H:%M:%S").to_string());
        true
    }

    pub fn timestamp(&self) -> String {
        match (&self.day_stamp, &self.time_stamp) {
            (Some(day), Some(time)) => format!("{day} {time}"),
            _ => UNSYNCED_TIMESTAMP.to_string(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    #[derive(Debug, Default)]
    pub(crate) struct FakeClock {
        pub started: bool,
        pub update_results: Vec<bool>,
        pub force_results: Vec<bool>,
        pub updates: u32,
        pub forced: u32,
        pub now: Option<DateTime<Utc>>,
    }

    impl FakeClock {
        pub(crate) fn synced_at(now: DateTime<Utc>) -> Self {
            Self {
                now: Some(now),
                ..Self::default()
            }
        }
    }

    impl NetworkClock for FakeClock {
        fn start(&mut self) -> Result<(), crate::LinkError> {
            self.started = true;
            Ok(())
        }

        fn update(&mut self) -> bool {
            self.updates += 1;
            if self.update_results.is_empty() {
                self.now.is_some()
            } else {
                self.update_results.remove(0)
            }
        }

        fn force_update(&mut self) -> bool {
            self.forced += 1;
            if self.force_results.is_empty() {
                self.now.is_some()
            } else {
                self.force_results.remove(0)
            }
        }

        fn now_utc(&self) -> Option<DateTime<Utc>> {
            self.now
        }
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 5).unwrap()
    }

    #[test]
    fn unsynced_clock_gives_placeholder() {
        let mut keeper = TimeKeeper::new(FakeClock::default(), 3_600, 1_000);

        assert!(!keeper.refresh(0));
        assert_eq!(keeper.timestamp(), "--");
    }

    #[test]
    fn stamps_apply_utc_offset() {
        let mut keeper = TimeKeeper::new(FakeClock::synced_at(noon()), 3_600, 1_000);

        assert!(keeper.refresh(0));
        assert_eq!(keeper.timestamp(), "2024-05-01 13:00:05");
    }

    #[test]
    fn failed_update_forces_exactly_one_retry() {
        let clock = FakeClock {
            update_results: vec![false],
            force_results: vec![true],
            ..FakeClock::synced_at(noon())
        };
        let mut keeper = TimeKeeper::new(clock, 0, 1_000);

        assert!(keeper.refresh(0));
        assert_eq!(keeper.clock().updates, 1);
        assert_eq!(keeper.clock().forced, 1);
        assert_eq!(keeper.timestamp(), "2024-05-01 12:00:05");
    }

    #[test]
    fn refresh_is_throttled() {
        let mut keeper = TimeKeeper::new(FakeClock::synced_at(noon()), 0, 1_000);

        keeper.refresh(0);
        keeper.refresh(500);
        keeper.refresh(999);
        assert_eq!(keeper.clock().updates, 1);

        keeper.refresh(1_000);
        assert_eq!(keeper.clock().updates, 2);
    }

    #[test]
    fn failed_refresh_keeps_previous_stamps() {
        let clock = FakeClock {
            update_results: vec![true, false],
            force_results: vec![false],
            ..FakeClock::synced_at(noon())
        };
        let mut keeper = TimeKeeper::new(clock, 0, 1_000);
        keeper.refresh(0);

        assert!(!keeper.refresh(2_000));
        assert_eq!(keeper.timestamp(), "2024-05-01 12:00:05");
    }
}
