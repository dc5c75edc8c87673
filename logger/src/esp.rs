use core::convert::TryInto;
use std::{
    ffi::CString,
    net::Ipv4Addr,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use ds18b20::{Ds18b20, Resolution};
use embedded_svc::{
    http::Method,
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
    ws::FrameType,
};
use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyIOPin, AnyOutputPin, IOPin, InputOutput, OutputPin, PinDriver, Pull},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    fs::fatfs::Fatfs,
    hal::{
        prelude::Peripherals,
        sd::{spi::SdSpiHostDriver, SdCardConfiguration, SdCardDriver},
        spi::{config::DriverConfig, Dma, SpiDriver, SPI3},
    },
    http::server::{
        ws::{EspHttpWsConnection, EspHttpWsDetachedSender},
        Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request,
    },
    io::vfs::MountedFatfs,
    ipv4::{
        ClientConfiguration as IpClientConfiguration, ClientSettings as IpClientSettings,
        Configuration as IpConfiguration, Mask, Subnet,
    },
    log::EspLogger,
    netif::{EspNetif, NetifConfiguration},
    nvs::EspDefaultNvsPartition,
    sntp::{EspSntp, SntpConf, SyncStatus},
    sys::EspError,
    wifi::EspWifi,
};
use log::{info, warn};
use one_wire_bus::{Address, OneWire};

use templog_common::{
    config::{DATA_LOG_FILE, SENSOR_DISCONNECTED_C},
    parse_form, web, AppContext, AppEvent, ConfigStore, DataLog, LatestReading, LinkError,
    LoggerSettings, NetworkClock, ProbeError, ReadingSink, Reply, Restarter, StationLink,
    TemperatureProbe,
};

use crate::assets;

const DS18B20_PIN: i32 = 4;

const SPIFFS_BASE: &str = "/spiffs";
const SD_CARD_BASE: &str = "/sdcard";
const SD_CARD_MAX_FILES: usize = 4;

const LOOP_PERIOD: Duration = Duration::from_millis(100);
const MAX_HTTP_BODY: usize = 1024;
const LOG_CHUNK_BYTES: usize = 1024;
const MAX_WS_FRAME: usize = 512;
const FORCE_SYNC_INTERVAL: Duration = Duration::from_secs(15);
// 2023-11-14; anything earlier means SNTP has not set the clock yet.
const MIN_VALID_EPOCH: i64 = 1_700_000_000;

/// Station link over the on-chip radio. Every call returns without waiting.
struct EspLink {
    wifi: EspWifi<'static>,
}

impl StationLink for EspLink {
    fn configure_static(
        &mut self,
        ip: Ipv4Addr,
        gateway: Ipv4Addr,
        mask: Ipv4Addr,
        dns: Ipv4Addr,
    ) -> Result<(), LinkError> {
        let mask = Mask::try_from(mask).map_err(|_| format!("invalid subnet mask: {mask}"))?;

        let mut conf = NetifConfiguration::wifi_default_client();
        conf.key = "WIFI_STA_STATIC"
            .try_into()
            .map_err(|_| "netif key too long")?;
        conf.ip_configuration = Some(IpConfiguration::Client(IpClientConfiguration::Fixed(
            IpClientSettings {
                ip,
                subnet: Subnet { gateway, mask },
                dns: Some(dns),
                secondary_dns: None,
            },
        )));

        let netif = EspNetif::new_with_conf(&conf)?;
        self.wifi.swap_netif_sta(netif)?;
        Ok(())
    }

    fn begin_join(&mut self, ssid: &str, credential: &str) -> Result<(), LinkError> {
        let auth_method = if credential.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        self.wifi
            .set_configuration(&Configuration::Client(ClientConfiguration {
                ssid: ssid.try_into().map_err(|_| "wifi ssid too long")?,
                password: credential
                    .try_into()
                    .map_err(|_| "wifi password too long")?,
                auth_method,
                ..Default::default()
            }))?;
        self.wifi.start()?;
        self.wifi.connect()?;
        Ok(())
    }

    fn is_joined(&mut self) -> bool {
        self.wifi.is_connected().unwrap_or(false) && self.wifi.sta_netif().is_up().unwrap_or(false)
    }

    fn start_access_point(&mut self, ssid: &str) -> Result<(), LinkError> {
        if self.wifi.is_started().unwrap_or(false) {
            let _ = self.wifi.disconnect();
            self.wifi.stop()?;
        }

        self.wifi
            .set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
                ssid: ssid.try_into().map_err(|_| "access point ssid too long")?,
                auth_method: AuthMethod::None,
                channel: 1,
                ..Default::default()
            }))?;
        self.wifi.start()?;
        Ok(())
    }
}

/// The first DS18B20 found on the one-wire bus.
struct Ds18b20Probe {
    one_wire: OneWire<PinDriver<'static, AnyIOPin, InputOutput>>,
    address: Option<Address>,
    delay: Ets,
}

impl Ds18b20Probe {
    fn new(pin: AnyIOPin) -> anyhow::Result<Self> {
        let mut one_wire_pin = PinDriver::input_output_od(pin)?;
        one_wire_pin.set_pull(Pull::Up)?;
        one_wire_pin.set_high()?;

        let one_wire = OneWire::new(one_wire_pin)
            .map_err(|err| anyhow!("failed to initialize one-wire bus: {err:?}"))?;

        let mut probe = Self {
            one_wire,
            address: None,
            delay: Ets,
        };
        probe.refresh_address();
        Ok(probe)
    }

    fn refresh_address(&mut self) {
        let mut found: Option<Address> = None;
        let mut device_count = 0_u32;

        for addr in self.one_wire.devices(false, &mut self.delay) {
            match addr {
                Ok(address) => {
                    device_count = device_count.saturating_add(1);
                    if found.is_none() && address.family_code() == ds18b20::FAMILY_CODE {
                        found = Some(address);
                    }
                }
                Err(err) => {
                    warn!("one-wire device scan failed: {err:?}");
                    break;
                }
            }
        }

        self.address = found;
        match self.address {
            Some(address) => info!(
                "DS18B20 ready on GPIO{} ({} one-wire device(s), using {:?})",
                DS18B20_PIN, device_count, address
            ),
            None => warn!(
                "no DS18B20 found on GPIO{} ({} one-wire device(s) detected)",
                DS18B20_PIN, device_count
            ),
        }
    }
}

impl TemperatureProbe for Ds18b20Probe {
    fn request_conversion(&mut self) -> Result<(), ProbeError> {
        if self.address.is_none() {
            self.refresh_address();
        }
        if self.address.is_none() {
            return Err(format!("no DS18B20 on GPIO{DS18B20_PIN}").into());
        }

        if let Err(err) =
            ds18b20::start_simultaneous_temp_measurement(&mut self.one_wire, &mut self.delay)
        {
            self.address = None;
            return Err(format!("failed to start DS18B20 conversion: {err:?}").into());
        }

        Resolution::Bits12.delay_for_measurement_time(&mut self.delay);
        Ok(())
    }

    fn read_celsius(&mut self) -> f32 {
        let Some(address) = self.address else {
            return SENSOR_DISCONNECTED_C;
        };

        let sensor = match Ds18b20::new::<core::convert::Infallible>(address) {
            Ok(sensor) => sensor,
            Err(err) => {
                warn!("invalid DS18B20 address {:?}: {err:?}", address);
                self.address = None;
                return SENSOR_DISCONNECTED_C;
            }
        };

        match sensor.read_data(&mut self.one_wire, &mut self.delay) {
            Ok(data) => data.temperature,
            Err(err) => {
                warn!("failed to read DS18B20 data: {err:?}");
                self.address = None;
                SENSOR_DISCONNECTED_C
            }
        }
    }
}

struct EspClock {
    server: String,
    sntp: Option<EspSntp<'static>>,
    last_forced: Option<Instant>,
}

impl EspClock {
    fn new(server: &str) -> Self {
        Self {
            server: server.to_string(),
            sntp: None,
            last_forced: None,
        }
    }
}

impl NetworkClock for EspClock {
    fn start(&mut self) -> Result<(), LinkError> {
        if self.sntp.is_some() {
            return Ok(());
        }

        let mut conf = SntpConf::default();
        conf.servers[0] = self.server.as_str();
        self.sntp = Some(EspSntp::new(&conf)?);
        info!("SNTP started against {}", self.server);
        Ok(())
    }

    fn update(&mut self) -> bool {
        match &self.sntp {
            Some(sntp) => sntp.get_sync_status() == SyncStatus::Completed || system_time_is_set(),
            None => false,
        }
    }

    fn force_update(&mut self) -> bool {
        if self.sntp.is_none() {
            return false;
        }

        let throttled = matches!(self.last_forced, Some(at) if at.elapsed() < FORCE_SYNC_INTERVAL);
        if !throttled {
            self.last_forced = Some(Instant::now());
            if !unsafe { esp_idf_svc::sys::esp_sntp_restart() } {
                warn!("failed to restart SNTP");
            }
        }
        system_time_is_set()
    }

    fn now_utc(&self) -> Option<DateTime<Utc>> {
        system_time_is_set().then(Utc::now)
    }
}

fn system_time_is_set() -> bool {
    Utc::now().timestamp() >= MIN_VALID_EPOCH
}

#[derive(Clone, Copy)]
struct EspRestarter;

impl Restarter for EspRestarter {
    fn restart_after(&self, delay: Duration) {
        let spawned = thread::Builder::new()
            .name("restart-request".into())
            .stack_size(4096)
            .spawn(move || {
                thread::sleep(delay);
                restart_now();
            });
        if let Err(err) = spawned {
            warn!("failed to spawn restart thread ({err}); restarting now");
            restart_now();
        }
    }
}

fn restart_now() {
    info!("restarting");
    thread::sleep(Duration::from_millis(100));
    unsafe { esp_idf_svc::sys::esp_restart() };
}

/// Open WebSocket sessions on `/ws`.
#[derive(Clone, Default)]
struct WsClients(Arc<Mutex<Vec<(i32, EspHttpWsDetachedSender)>>>);

impl WsClients {
    fn add(&self, session: i32, sender: EspHttpWsDetachedSender) {
        self.0.lock().unwrap().push((session, sender));
    }

    fn remove(&self, session: i32) {
        self.0.lock().unwrap().retain(|(id, _)| *id != session);
    }
}

impl ReadingSink for WsClients {
    fn subscriber_count(&self) -> usize {
        let mut clients = self.0.lock().unwrap();
        clients.retain(|(_, sender)| !sender.is_closed());
        clients.len()
    }

    fn publish(&self, row: &str) {
        let mut clients = self.0.lock().unwrap();
        clients.retain_mut(
            |(session, sender)| match sender.send(FrameType::Text(false), row.as_bytes()) {
                Ok(()) => true,
                Err(err) => {
                    warn!("dropping websocket session {session}: {err:?}");
                    false
                }
            },
        );
    }
}

/// What the request handlers share with the main loop.
#[derive(Clone)]
struct WebContext {
    store: ConfigStore,
    log: DataLog,
    latest: LatestReading,
    restart_delay: Duration,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let settings = LoggerSettings::default();
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals {
        modem, pins, spi3, ..
    } = Peripherals::take()?;

    if let Err(err) = mount_spiffs() {
        warn!("failed to mount SPIFFS: {err:#}");
    }

    let _sd_card = match mount_sd_card(
        spi3,
        pins.gpio18.downgrade_output(),
        pins.gpio23.downgrade_output(),
        pins.gpio19.downgrade(),
        pins.gpio5.downgrade_output(),
    ) {
        Ok(card) => Some(card),
        Err(err) => {
            warn!("card mount failed: {err:#}");
            None
        }
    };

    let probe = Ds18b20Probe::new(pins.gpio4.downgrade())
        .context("failed to initialize DS18B20 probe")?;
    let wifi = EspWifi::new(modem, sys_loop, Some(nvs_partition))?;

    let store = ConfigStore::new(SPIFFS_BASE);
    let log = DataLog::new(
        format!("{SD_CARD_BASE}/{DATA_LOG_FILE}"),
        settings.log_max_bytes,
    );
    let clients = WsClients::default();

    let started = Instant::now();
    let mut app = AppContext::boot(
        settings.clone(),
        store.clone(),
        log.clone(),
        EspLink { wifi },
        probe,
        EspClock::new(&settings.ntp_server),
        0,
    );

    let context = WebContext {
        store,
        log,
        latest: app.latest(),
        restart_delay: Duration::from_millis(settings.restart_delay_ms),
    };

    // Kept alive for the rest of the boot.
    let mut _server: Option<EspHttpServer<'static>> = None;

    loop {
        let now_ms = started.elapsed().as_millis() as u64;
        match app.poll(now_ms, &clients) {
            AppEvent::Connected => {
                disable_wifi_power_save();
                _server = Some(create_station_server(context.clone(), clients.clone())?);
            }
            AppEvent::AccessPoint => {
                _server = Some(create_provisioning_server(context.clone())?);
            }
            AppEvent::RestartRequired => restart_now(),
            AppEvent::Idle | AppEvent::Sampled(_) => {}
        }
        thread::sleep(LOOP_PERIOD);
    }
}

fn mount_spiffs() -> anyhow::Result<()> {
    let base_path = CString::new(SPIFFS_BASE)?;
    let conf = esp_idf_svc::sys::esp_vfs_spiffs_conf_t {
        base_path: base_path.as_ptr(),
        partition_label: core::ptr::null(),
        max_files: 5,
        format_if_mount_failed: true,
    };

    let rc = unsafe { esp_idf_svc::sys::esp_vfs_spiffs_register(&conf) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("SPIFFS mounted at {SPIFFS_BASE}");
        return Ok(());
    }
    Err(anyhow!("esp_vfs_spiffs_register failed with code {}", rc))
}

fn mount_sd_card(
    spi: SPI3,
    sclk: AnyOutputPin,
    mosi: AnyOutputPin,
    miso: AnyIOPin,
    cs: AnyOutputPin,
) -> anyhow::Result<impl Sized> {
    let spi_driver = SpiDriver::new(
        spi,
        sclk,
        mosi,
        Some(miso),
        &DriverConfig::default().dma(Dma::Auto(4096)),
    )?;

    let card = SdCardDriver::new_spi(
        SdSpiHostDriver::new(
            spi_driver,
            Some(cs),
            AnyIOPin::none(),
            AnyIOPin::none(),
            AnyIOPin::none(),
            None,
        )?,
        &SdCardConfiguration::new(),
    )?;

    let mounted = MountedFatfs::mount(Fatfs::new_sdcard(0, card)?, SD_CARD_BASE, SD_CARD_MAX_FILES)?;
    info!("SD card mounted at {SD_CARD_BASE}");
    Ok(mounted)
}

fn create_station_server(
    context: WebContext,
    clients: WsClients,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    {
        let latest = context.latest.clone();
        server.fn_handler::<anyhow::Error, _>("/", Method::Get, move |req| {
            write_reply(req, web::index(assets::INDEX_HTML, &latest))
        })?;
    }

    register_assets(&mut server)?;

    server.fn_handler::<anyhow::Error, _>("/index.js", Method::Get, |req| {
        write_reply(req, Reply::ok(web::CONTENT_JS, assets::INDEX_JS))
    })?;

    {
        let log = context.log.clone();
        server.fn_handler::<anyhow::Error, _>("/getdata", Method::Get, move |req| {
            stream_log(req, &log, false)
        })?;
    }

    {
        let log = context.log.clone();
        server.fn_handler::<anyhow::Error, _>("/download", Method::Get, move |req| {
            stream_log(req, &log, true)
        })?;
    }

    {
        let log = context.log.clone();
        server.fn_handler::<anyhow::Error, _>("/delete", Method::Get, move |req| {
            write_reply(req, web::delete(&log))
        })?;
    }

    {
        let store = context.store.clone();
        let delay = context.restart_delay;
        server.fn_handler::<anyhow::Error, _>("/clearconfig", Method::Get, move |req| {
            write_reply(req, web::clear_config(&store, &EspRestarter, delay))
        })?;
    }

    {
        let latest = context.latest.clone();
        server.fn_handler::<anyhow::Error, _>("/api/latest", Method::Get, move |req| {
            write_reply(req, web::latest_json(&latest))
        })?;
    }

    server.ws_handler("/ws", move |ws: &mut EspHttpWsConnection| -> Result<(), EspError> {
        if ws.is_new() {
            clients.add(ws.session(), ws.create_detached_sender()?);
            info!("websocket session {} opened", ws.session());
        } else if ws.is_closed() {
            clients.remove(ws.session());
            info!("websocket session {} closed", ws.session());
        } else {
            let (_frame_type, len) = ws.recv(&mut [])?;
            if len > MAX_WS_FRAME {
                warn!("ignoring {len} byte websocket frame");
                return Ok(());
            }
            let mut frame = vec![0_u8; len];
            ws.recv(&mut frame)?;
        }
        Ok(())
    })?;

    info!("station web server started");
    Ok(server)
}

fn create_provisioning_server(context: WebContext) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler::<anyhow::Error, _>("/", Method::Get, |req| {
        write_reply(req, Reply::ok(web::CONTENT_HTML, assets::WIFIMANAGER_HTML))
    })?;

    register_assets(&mut server)?;

    {
        let store = context.store.clone();
        let delay = context.restart_delay;
        server.fn_handler::<anyhow::Error, _>("/", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let form = parse_form(&body);
            write_reply(req, web::submit_form(&store, &EspRestarter, delay, &form))
        })?;
    }

    info!("provisioning web server started");
    Ok(server)
}

fn register_assets(server: &mut EspHttpServer<'static>) -> anyhow::Result<()> {
    server.fn_handler::<anyhow::Error, _>("/style.css", Method::Get, |req| {
        write_reply(req, Reply::ok(web::CONTENT_CSS, assets::STYLE_CSS))
    })?;
    Ok(())
}

fn read_request_body(req: &mut Request<&mut EspHttpConnection<'_>>) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_reply(req: Request<&mut EspHttpConnection<'_>>, reply: Reply) -> anyhow::Result<()> {
    let mut headers: Vec<(&str, &str)> = vec![("Content-Type", reply.content_type)];
    headers.extend(
        reply
            .headers
            .iter()
            .map(|(name, value)| (*name, value.as_str())),
    );

    req.into_response(reply.status, None, &headers)?
        .write_all(&reply.body)?;
    Ok(())
}

/// Sends the log a chunk at a time instead of buffering the whole file.
fn stream_log(
    req: Request<&mut EspHttpConnection<'_>>,
    log: &DataLog,
    attachment: bool,
) -> anyhow::Result<()> {
    let mut reader = match log.open_reader(LOG_CHUNK_BYTES) {
        Ok(reader) => reader,
        Err(err) => return write_reply(req, web::log_error_reply(err)),
    };

    let disposition = attachment.then(web::attachment_header);
    let mut headers: Vec<(&str, &str)> = vec![("Content-Type", web::CONTENT_CSV)];
    if let Some((name, value)) = &disposition {
        headers.push((*name, value.as_str()));
    }

    let mut response = req.into_response(200, None, &headers)?;
    while let Some(chunk) = reader.next_chunk()? {
        response.write_all(chunk)?;
    }
    Ok(())
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}
