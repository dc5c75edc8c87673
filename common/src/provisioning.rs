use std::time::Duration;

use log::{info, warn};
use serde::Deserialize;

use crate::{
    config::ConfigField,
    store::{ConfigStore, StoreError},
};

/// Restarts the device after a delay, dropping any in-flight work.
pub trait Restarter {
    fn restart_after(&self, delay: Duration);
}

/// Fields posted by the access-point configuration page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProvisioningForm {
    #[serde(default)]
    pub ssid: Option<String>,
    #[serde(default)]
    pub pass: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub gateway: Option<String>,
}

impl ProvisioningForm {
    pub fn value(&self, field: ConfigField) -> Option<&str> {
        match field {
            ConfigField::NetworkName => self.ssid.as_deref(),
            ConfigField::Credential => self.pass.as_deref(),
            ConfigField::LocalAddress => self.ip.as_deref(),
            ConfigField::GatewayAddress => self.gateway.as_deref(),
        }
    }

    fn set(&mut self, field: ConfigField, value: String) {
        let slot = match field {
            ConfigField::NetworkName => &mut self.ssid,
            ConfigField::Credential => &mut self.pass,
            ConfigField::LocalAddress => &mut self.ip,
            ConfigField::GatewayAddress => &mut self.gateway,
        };
        *slot = Some(value);
    }
}

/// Decodes an `application/x-www-form-urlencoded` body. Unknown keys are ignored.
pub fn parse_form(body: &[u8]) -> ProvisioningForm {
    let mut form = ProvisioningForm::default();
    let body = String::from_utf8_lossy(body);

    for pair in body.split('&').filter(|pair| !pair.is_empty()) {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        if let Some(field) = ConfigField::from_form_param(&percent_decode(name)) {
            form.set(field, percent_decode(value));
        }
    }
    form
}

fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push((hi << 4) | lo);
                        i += 2;
                    }
                    _ => out.push(b'%'),
                }
            }
            other => out.push(other),
        }
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// Persists every field present in the form and returns the reply for the browser.
///
/// No plausibility check is made; the next boot decides whether the values work.
pub fn apply_form(store: &ConfigStore, form: &ProvisioningForm) -> Result<String, StoreError> {
    for field in ConfigField::ALL {
        if let Some(value) = form.value(field) {
            store.save(field, value)?;
        }
    }

    let ip = form.ip.as_deref().unwrap_or_default();
    info!("provisioning form stored; restart pending");
    Ok(format!(
        "Done. ESP will restart, connect to your router and go to IP address: {ip}"
    ))
}

/// Clears the stored network config and schedules a restart, even if clearing failed.
pub fn clear_and_restart<R: Restarter + ?Sized>(
    store: &ConfigStore,
    restarter: &R,
    delay: Duration,
) -> Result<(), StoreError> {
    let result = store.clear();
    if let Err(err) = &result {
        warn!("failed to clear network config: {err}");
    }
    restarter.restart_after(delay);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::NetworkConfig, testutil::ScratchDir};
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;

    #[derive(Default)]
    struct RecordingRestarter {
        delays: RefCell<Vec<Duration>>,
    }

    impl Restarter for RecordingRestarter {
        fn restart_after(&self, delay: Duration) {
            self.delays.borrow_mut().push(delay);
        }
    }

    #[test]
    fn parses_encoded_form_fields() {
        let form = parse_form(b"ssid=My+Home%21&pass=p%40ss%3Dword&ip=192.168.1.50&gateway=192.168.1.1&x=1");

        assert_eq!(
            form,
            ProvisioningForm {
                ssid: Some("My Home!".to_string()),
                pass: Some("p@ss=word".to_string()),
                ip: Some("192.168.1.50".to_string()),
                gateway: Some("192.168.1.1".to_string()),
            }
        );
    }

    #[test]
    fn malformed_escapes_are_kept_literally() {
        let form = parse_form(b"pass=100%&ssid=a%zzb&ip");

        assert_eq!(form.pass.as_deref(), Some("100%"));
        assert_eq!(form.ssid.as_deref(), Some("a%zzb"));
        assert_eq!(form.ip.as_deref(), Some(""));
        assert_eq!(form.gateway, None);
    }

    #[test]
    fn apply_saves_present_fields_only() {
        let dir = ScratchDir::new("provision-partial");
        let store = ConfigStore::new(dir.path());
        store.save(ConfigField::GatewayAddress, "10.0.0.1").unwrap();

        let reply = apply_form(
            &store,
            &ProvisioningForm {
                ssid: Some("Home".to_string()),
                ip: Some("10.0.0.9".to_string()),
                ..ProvisioningForm::default()
            },
        )
        .unwrap();

        assert_eq!(
            reply,
            "Done. ESP will restart, connect to your router and go to IP address: 10.0.0.9"
        );
        assert_eq!(
            store.load(),
            NetworkConfig {
                network_name: "Home".to_string(),
                credential: String::new(),
                local_address: "10.0.0.9".to_string(),
                gateway_address: "10.0.0.1".to_string(),
            }
        );
    }

    #[test]
    fn empty_values_are_stored_as_given() {
        let dir = ScratchDir::new("provision-empty");
        let store = ConfigStore::new(dir.path());

        apply_form(&store, &parse_form(b"ssid=&pass=&ip=&gateway=")).unwrap();

        assert!(!store.load().is_station_ready());
        assert!(store.path_for(ConfigField::NetworkName).exists());
    }

    #[test]
    fn clear_schedules_restart() {
        let dir = ScratchDir::new("provision-clear");
        let store = ConfigStore::new(dir.path());
        store.save(ConfigField::NetworkName, "Home").unwrap();
        let restarter = RecordingRestarter::default();

        clear_and_restart(&store, &restarter, Duration::from_millis(3_000)).unwrap();

        assert_eq!(*restarter.delays.borrow(), vec![Duration::from_millis(3_000)]);
        assert_eq!(store.load(), NetworkConfig::default());
    }
}
