use std::net::Ipv4Addr;

use log::{info, warn};

use crate::config::{LoggerSettings, NetworkConfig, DNS_SERVER, SUBNET_MASK};

pub type LinkError = Box<dyn std::error::Error + Send + Sync>;

/// Radio operations the connectivity state machine drives.
pub trait StationLink {
    fn configure_static(
        &mut self,
        ip: Ipv4Addr,
        gateway: Ipv4Addr,
        mask: Ipv4Addr,
        dns: Ipv4Addr,
    ) -> Result<(), LinkError>;

    /// Starts a join attempt without waiting for it to complete.
    fn begin_join(&mut self, ssid: &str, credential: &str) -> Result<(), LinkError>;

    fn is_joined(&mut self) -> bool;

    /// Brings up an open access point.
    fn start_access_point(&mut self, ssid: &str) -> Result<(), LinkError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconfigured,
    Connecting,
    Connected,
    AccessPointFallback,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unconfigured => "UNCONFIGURED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::AccessPointFallback => "ACCESS_POINT",
        }
    }
}

/// Result of one step of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    Connected,
    Fallback,
    /// The station link has been down past the grace period; the device should restart.
    LinkLost,
}

#[derive(Debug, Clone)]
pub struct Connectivity {
    state: ConnectionState,
    join_timeout_ms: u64,
    link_lost_grace_ms: u64,
    ap_ssid: String,
    join_deadline_ms: Option<u64>,
    link_down_since_ms: Option<u64>,
}

impl Connectivity {
    pub fn new(settings: &LoggerSettings) -> Self {
        Self {
            state: ConnectionState::Unconfigured,
            join_timeout_ms: settings.join_timeout_ms,
            link_lost_grace_ms: settings.link_lost_grace_ms,
            ap_ssid: settings.ap_ssid.clone(),
            join_deadline_ms: None,
            link_down_since_ms: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn ap_ssid(&self) -> &str {
        &self.ap_ssid
    }

    /// Leaves `Unconfigured`, either by starting a join or by falling back to the AP.
    pub fn begin<L: StationLink>(
        &mut self,
        config: &NetworkConfig,
        link: &mut L,
        now_ms: u64,
    ) -> Transition {
        if self.state != ConnectionState::Unconfigured {
            return Transition::Unchanged;
        }

        if !config.is_station_ready() {
            warn!("undefined network name or local address");
            return self.fall_back(link);
        }

        let Ok(ip) = config.local_address.trim().parse::<Ipv4Addr>() else {
            warn!(
                "failed to configure: invalid address `{}`",
                config.local_address
            );
            return self.fall_back(link);
        };
        let gateway = parse_gateway(&config.gateway_address);

        if let Err(err) = link.configure_static(ip, gateway, SUBNET_MASK, DNS_SERVER) {
            warn!("failed to configure static addressing: {err}");
            return self.fall_back(link);
        }

        if let Err(err) = link.begin_join(&config.network_name, &config.credential) {
            warn!("failed to start join of `{}`: {err}", config.network_name);
            return self.fall_back(link);
        }

        info!(
            "connecting to `{}` as {ip} (gateway {gateway}), timeout {}ms",
            config.network_name, self.join_timeout_ms
        );
        self.state = ConnectionState::Connecting;
        self.join_deadline_ms = Some(now_ms.saturating_add(self.join_timeout_ms));
        Transition::Unchanged
    }

    pub fn poll<L: StationLink>(&mut self, link: &mut L, now_ms: u64) -> Transition {
        match self.state {
            ConnectionState::Connecting => {
                if link.is_joined() {
                    info!("station joined");
                    self.state = ConnectionState::Connected;
                    self.join_deadline_ms = None;
                    return Transition::Connected;
                }

                match self.join_deadline_ms {
                    Some(deadline) if now_ms >= deadline => {
                        warn!("failed to connect within {}ms", self.join_timeout_ms);
                        self.fall_back(link)
                    }
                    _ => Transition::Unchanged,
                }
            }
            ConnectionState::Connected => self.check_liveness(link, now_ms),
            ConnectionState::Unconfigured | ConnectionState::AccessPointFallback => {
                Transition::Unchanged
            }
        }
    }

    fn check_liveness<L: StationLink>(&mut self, link: &mut L, now_ms: u64) -> Transition {
        if link.is_joined() {
            if self.link_down_since_ms.take().is_some() {
                info!("station link restored");
            }
            return Transition::Unchanged;
        }

        match self.link_down_since_ms {
            Some(since) if now_ms.saturating_sub(since) >= self.link_lost_grace_ms => {
                warn!(
                    "station link down for {}s; restart required",
                    self.link_lost_grace_ms / 1000
                );
                Transition::LinkLost
            }
            Some(_) => Transition::Unchanged,
            None => {
                warn!("station link lost");
                self.link_down_since_ms = Some(now_ms);
                Transition::Unchanged
            }
        }
    }

    fn fall_back<L: StationLink>(&mut self, link: &mut L) -> Transition {
        self.state = ConnectionState::AccessPointFallback;
        self.join_deadline_ms = None;

        match link.start_access_point(&self.ap_ssid) {
            Ok(()) => info!("access point `{}` started", self.ap_ssid),
            Err(err) => warn!("failed to start access point `{}`: {err}", self.ap_ssid),
        }
        Transition::Fallback
    }
}

/// A missing or malformed gateway does not block the join; it is left unspecified.
fn parse_gateway(raw: &str) -> Ipv4Addr {
    raw.trim().parse().unwrap_or_else(|_| {
        warn!("invalid gateway `{raw}`; joining with 0.0.0.0");
        Ipv4Addr::UNSPECIFIED
    })
}
