use std::sync::{Arc, Mutex};

use log::{info, warn};

use crate::{
    clock::{NetworkClock, TimeKeeper},
    config::{LoggerSettings, NetworkConfig},
    connectivity::{ConnectionState, Connectivity, StationLink, Transition},
    datalog::DataLog,
    sampler::{Sampler, TemperatureProbe},
    store::ConfigStore,
    types::{LogEntry, Reading},
};

/// Push channel for freshly logged rows.
pub trait ReadingSink {
    fn subscriber_count(&self) -> usize;

    fn publish(&self, row: &str);
}

/// Most recent reading, shared with request handlers.
#[derive(Debug, Clone, Default)]
pub struct LatestReading(Arc<Mutex<Option<Reading>>>);

impl LatestReading {
    pub fn get(&self) -> Option<Reading> {
        self.0.lock().unwrap().clone()
    }

    fn set(&self, reading: Reading) {
        *self.0.lock().unwrap() = Some(reading);
    }
}

/// What the platform has to act on after one loop iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    Idle,
    /// Station joined; start the station-mode server.
    Connected,
    /// Access point is up; start the configuration server.
    AccessPoint,
    Sampled(Reading),
    RestartRequired,
}

/// Everything the device owns for its lifetime, built once at boot.
pub struct AppContext<L, P, C> {
    settings: LoggerSettings,
    store: ConfigStore,
    log: DataLog,
    network: NetworkConfig,
    connectivity: Connectivity,
    link: L,
    probe: P,
    time: TimeKeeper<C>,
    sampler: Option<Sampler>,
    latest: LatestReading,
    pending: Option<AppEvent>,
}

impl<L, P, C> AppContext<L, P, C>
where
    L: StationLink,
    P: TemperatureProbe,
    C: NetworkClock,
{
    /// Loads the stored network config, prepares the data log and starts connecting.
    pub fn boot(
        settings: LoggerSettings,
        store: ConfigStore,
        log: DataLog,
        mut link: L,
        probe: P,
        clock: C,
        now_ms: u64,
    ) -> Self {
        let network = store.load();

        if let Err(err) = log.initialize() {
            warn!("error opening data log: {err}");
        }

        let mut connectivity = Connectivity::new(&settings);
        let pending = match connectivity.begin(&network, &mut link, now_ms) {
            Transition::Fallback => Some(AppEvent::AccessPoint),
            _ => None,
        };

        let time = TimeKeeper::new(clock, settings.utc_offset_secs, settings.time_refresh_ms);

        Self {
            settings,
            store,
            log,
            network,
            connectivity,
            link,
            probe,
            time,
            sampler: None,
            latest: LatestReading::default(),
            pending,
        }
    }

    pub fn settings(&self) -> &LoggerSettings {
        &self.settings
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn data_log(&self) -> &DataLog {
        &self.log
    }

    pub fn network(&self) -> &NetworkConfig {
        &self.network
    }

    pub fn state(&self) -> ConnectionState {
        self.connectivity.state()
    }

    pub fn latest(&self) -> LatestReading {
        self.latest.clone()
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn is_sampling(&self) -> bool {
        self.sampler.is_some()
    }

    /// One iteration of the main loop.
    pub fn poll<S: ReadingSink + ?Sized>(&mut self, now_ms: u64, sink: &S) -> AppEvent {
        if let Some(event) = self.pending.take() {
            return event;
        }

        match self.connectivity.poll(&mut self.link, now_ms) {
            Transition::Connected => {
                self.on_connected(now_ms);
                return AppEvent::Connected;
            }
            Transition::Fallback => return AppEvent::AccessPoint,
            Transition::LinkLost => return AppEvent::RestartRequired,
            Transition::Unchanged => {}
        }

        if self.connectivity.state() != ConnectionState::Connected {
            return AppEvent::Idle;
        }

        self.time.refresh(now_ms);

        let Some(sampler) = self.sampler.as_mut() else {
            return AppEvent::Idle;
        };
        if !sampler.is_due(now_ms) {
            return AppEvent::Idle;
        }

        let reading = sampler.sample(&mut self.probe, self.time.timestamp(), now_ms);
        self.record(&reading, sink);
        AppEvent::Sampled(reading)
    }

    fn on_connected(&mut self, now_ms: u64) {
        if let Err(err) = self.time.start() {
            warn!("failed to start time sync: {err}");
        }
        self.time.refresh(now_ms);
        self.sampler = Some(Sampler::new(self.settings.sample_interval_ms, now_ms));
        info!(
            "sampling every {}ms into {}",
            self.settings.sample_interval_ms,
            self.log.path().display()
        );
    }

    fn record<S: ReadingSink + ?Sized>(&mut self, reading: &Reading, sink: &S) {
        if let Err(err) = self.log.append(&LogEntry::from(reading)) {
            warn!("error writing data log: {err}");
        }

        if sink.subscriber_count() > 0 {
            sink.publish(&reading.csv_row());
        }

        self.latest.set(reading.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::tests::FakeClock,
        config::{DATA_LOG_FILE, SENSOR_DISCONNECTED_C},
        connectivity::tests::{home_config, FakeLink},
        sampler::tests::FakeProbe,
        testutil::ScratchDir,
    };
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;

    #[derive(Default)]
    struct RecordingSink {
        subscribers: usize,
        rows: RefCell<Vec<String>>,
    }

    impl ReadingSink for RecordingSink {
        fn subscriber_count(&self) -> usize {
            self.subscribers
        }

        fn publish(&self, row: &str) {
            self.rows.borrow_mut().push(row.to_string());
        }
    }

    fn settings() -> LoggerSettings {
        LoggerSettings {
            utc_offset_secs: 0,
            ..LoggerSettings::default()
        }
    }

    fn clock() -> FakeClock {
        FakeClock::synced_at(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap())
    }

    fn boot(
        dir: &ScratchDir,
        link: FakeLink,
        probe: FakeProbe,
    ) -> AppContext<FakeLink, FakeProbe, FakeClock> {
        AppContext::boot(
            settings(),
            ConfigStore::new(dir.path()),
            DataLog::new(dir.path().join(DATA_LOG_FILE), None),
            link,
            probe,
            clock(),
            0,
        )
    }

    #[test]
    fn unconfigured_device_boots_into_access_point() {
        let dir = ScratchDir::new("app-unconfigured");
        let mut app = boot(&dir, FakeLink::joining_after(1), FakeProbe::default());
        let sink = RecordingSink::default();

        assert_eq!(app.poll(0, &sink), AppEvent::AccessPoint);
        assert_eq!(app.state(), ConnectionState::AccessPointFallback);
        assert!(app.link_mut().join_requests.is_empty());
        assert_eq!(app.poll(100_000, &sink), AppEvent::Idle);
        assert!(!app.is_sampling());
    }

    #[test]
    fn saved_config_joins_and_starts_sampler() {
        let dir = ScratchDir::new("app-join");
        ConfigStore::new(dir.path()).save_all(&home_config()).unwrap();
        let mut app = boot(&dir, FakeLink::joining_after(1), FakeProbe::default());
        let sink = RecordingSink::default();

        assert_eq!(app.network(), &home_config());
        assert_eq!(app.state(), ConnectionState::Connecting);
        assert_eq!(app.poll(500, &sink), AppEvent::Connected);
        assert_eq!(app.state(), ConnectionState::Connected);
        assert!(app.is_sampling());
    }

    #[test]
    fn join_timeout_reaches_access_point() {
        let dir = ScratchDir::new("app-timeout");
        ConfigStore::new(dir.path()).save_all(&home_config()).unwrap();
        let mut app = boot(&dir, FakeLink::never_joining(), FakeProbe::default());
        let sink = RecordingSink::default();
        let timeout = app.settings().join_timeout_ms;

        assert_eq!(app.poll(timeout - 1, &sink), AppEvent::Idle);
        assert_eq!(app.poll(timeout, &sink), AppEvent::AccessPoint);
    }

    #[test]
    fn one_reading_feeds_log_and_subscribers() {
        let dir = ScratchDir::new("app-sample");
        ConfigStore::new(dir.path()).save_all(&home_config()).unwrap();
        let mut app = boot(&dir, FakeLink::joining_after(1), FakeProbe::returning(&[22.5]));
        let sink = RecordingSink {
            subscribers: 1,
            ..RecordingSink::default()
        };
        app.poll(0, &sink);

        let interval = app.settings().sample_interval_ms;
        assert_eq!(app.poll(interval, &sink), AppEvent::Idle);
        let event = app.poll(interval + 1, &sink);

        let expected = Reading::new("2024-05-01 12:00:00", 22.5);
        assert_eq!(event, AppEvent::Sampled(expected.clone()));
        assert_eq!(
            app.data_log().read_all().unwrap(),
            "Time,Temperature\n2024-05-01 12:00:00,22.50\n"
        );
        assert_eq!(
            *sink.rows.borrow(),
            vec!["2024-05-01 12:00:00,22.50".to_string()]
        );
        assert_eq!(app.latest().get(), Some(expected));
    }

    #[test]
    fn sentinel_reading_is_logged_and_pushed() {
        let dir = ScratchDir::new("app-sentinel");
        ConfigStore::new(dir.path()).save_all(&home_config()).unwrap();
        let mut app = boot(
            &dir,
            FakeLink::joining_after(1),
            FakeProbe::returning(&[SENSOR_DISCONNECTED_C]),
        );
        let sink = RecordingSink {
            subscribers: 2,
            ..RecordingSink::default()
        };
        app.poll(0, &sink);

        app.poll(app.settings().sample_interval_ms + 1, &sink);

        let contents = app.data_log().read_all().unwrap();
        assert_eq!(contents.lines().last(), Some("2024-05-01 12:00:00,--"));
        assert_eq!(*sink.rows.borrow(), vec!["2024-05-01 12:00:00,--".to_string()]);
    }

    #[test]
    fn no_push_without_subscribers() {
        let dir = ScratchDir::new("app-nosubs");
        ConfigStore::new(dir.path()).save_all(&home_config()).unwrap();
        let mut app = boot(&dir, FakeLink::joining_after(1), FakeProbe::returning(&[20.0]));
        let sink = RecordingSink::default();
        app.poll(0, &sink);

        app.poll(app.settings().sample_interval_ms + 1, &sink);

        assert!(sink.rows.borrow().is_empty());
        assert_eq!(app.data_log().read_all().unwrap().lines().count(), 2);
    }

    #[test]
    fn lost_link_requests_restart() {
        let dir = ScratchDir::new("app-linklost");
        ConfigStore::new(dir.path()).save_all(&home_config()).unwrap();
        let mut app = boot(&dir, FakeLink::joining_after(1), FakeProbe::default());
        let sink = RecordingSink::default();
        app.poll(0, &sink);

        app.link_mut().joined_override = Some(false);
        let grace = app.settings().link_lost_grace_ms;
        app.poll(10, &sink);

        assert_eq!(app.poll(10 + grace, &sink), AppEvent::RestartRequired);
    }
}
