use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// Value reported by the one-wire driver when no sensor answered.
pub const SENSOR_DISCONNECTED_C: f32 = -127.0;

pub const SUBNET_MASK: Ipv4Addr = Ipv4Addr::new(255, 255, 0, 0);
pub const DNS_SERVER: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);

pub const DATA_LOG_FILE: &str = "data.csv";
pub const DATA_LOG_HEADER: &str = "Time,Temperature";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggerSettings {
    pub sample_interval_ms: u64,
    pub join_timeout_ms: u64,
    pub restart_delay_ms: u64,
    pub link_lost_grace_ms: u64,
    pub time_refresh_ms: u64,
    pub utc_offset_secs: i32,
    pub ntp_server: String,
    pub ap_ssid: String,
    pub log_max_bytes: Option<u64>,
}

impl Default for LoggerSettings {
    fn default() -> Self {
        Self {
            sample_interval_ms: 30_000,
            join_timeout_ms: 10_000,
            restart_delay_ms: 3_000,
            link_lost_grace_ms: 300_000,
            time_refresh_ms: 1_000,
            utc_offset_secs: 3_600,
            ntp_server: "87.104.58.9".to_string(),
            ap_ssid: "TempLogger-AP".to_string(),
            log_max_bytes: Some(8 * 1024 * 1024),
        }
    }
}

/// The four persisted network strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub network_name: String,
    pub credential: String,
    pub local_address: String,
    pub gateway_address: String,
}

impl NetworkConfig {
    /// A client-mode join is only attempted with a network name and a local address.
    pub fn is_station_ready(&self) -> bool {
        !self.network_name.is_empty() && !self.local_address.is_empty()
    }

    pub fn get(&self, field: ConfigField) -> &str {
        match field {
            ConfigField::NetworkName => &self.network_name,
            ConfigField::Credential => &self.credential,
            ConfigField::LocalAddress => &self.local_address,
            ConfigField::GatewayAddress => &self.gateway_address,
        }
    }

    pub fn set(&mut self, field: ConfigField, value: String) {
        match field {
            ConfigField::NetworkName => self.network_name = value,
            ConfigField::Credential => self.credential = value,
            ConfigField::LocalAddress => self.local_address = value,
            ConfigField::GatewayAddress => self.gateway_address = value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigField {
    NetworkName,
    Credential,
    LocalAddress,
    GatewayAddress,
}

impl ConfigField {
    pub const ALL: [ConfigField; 4] = [
        Self::NetworkName,
        Self::Credential,
        Self::LocalAddress,
        Self::GatewayAddress,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            Self::NetworkName => "ssid.txt",
            Self::Credential => "pass.txt",
            Self::LocalAddress => "ip.txt",
            Self::GatewayAddress => "gateway.txt",
        }
    }

    /// Name of the matching field in the provisioning form.
    pub fn form_param(self) -> &'static str {
        match self {
            Self::NetworkName => "ssid",
            Self::Credential => "pass",
            Self::LocalAddress => "ip",
            Self::GatewayAddress => "gateway",
        }
    }

    pub fn from_form_param(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|field| field.form_param() == name)
    }

    pub fn is_secret(self) -> bool {
        matches!(self, Self::Credential)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn station_needs_name_and_address() {
        let mut config = NetworkConfig {
            network_name: "Home".to_string(),
            credential: String::new(),
            local_address: "192.168.1.50".to_string(),
            gateway_address: String::new(),
        };
        assert!(config.is_station_ready());

        config.local_address.clear();
        assert!(!config.is_station_ready());

        config.local_address = "192.168.1.50".to_string();
        config.network_name.clear();
        assert!(!config.is_station_ready());
    }

    #[test]
    fn whitespace_network_name_counts_as_set() {
        let config = NetworkConfig {
            network_name: "  ".to_string(),
            local_address: "192.168.1.50".to_string(),
            ..NetworkConfig::default()
        };

        assert!(config.is_station_ready());
    }

    #[test]
    fn form_params_map_back_to_fields() {
        for field in ConfigField::ALL {
            assert_eq!(ConfigField::from_form_param(field.form_param()), Some(field));
        }
        assert_eq!(ConfigField::from_form_param("dns"), None);
    }
}
