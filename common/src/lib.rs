pub mod app;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod datalog;
pub mod provisioning;
pub mod sampler;
pub mod store;
pub mod types;
pub mod web;

#[cfg(test)]
mod testutil;

pub use app::{AppContext, AppEvent, LatestReading, ReadingSink};
pub use clock::{NetworkClock, TimeKeeper, UNSYNCED_TIMESTAMP};
pub use config::{ConfigField, LoggerSettings, NetworkConfig};
pub use connectivity::{ConnectionState, Connectivity, LinkError, StationLink, Transition};
pub use datalog::{DataLog, LogError};
pub use provisioning::{apply_form, clear_and_restart, parse_form, ProvisioningForm, Restarter};
pub use sampler::{ProbeError, Sampler, TemperatureProbe};
pub use store::{ConfigStore, StoreError};
pub use types::{render_index, LatestReadingView, LogEntry, Reading};
pub use web::Reply;
