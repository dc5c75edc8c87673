use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Form, State,
    },
    http::{header, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use tokio::{
    net::TcpListener,
    sync::{broadcast, Notify},
    task::JoinHandle,
};
use tower_http::services::ServeDir;
use tracing::{info, warn};

use templog_common::{
    config::{DATA_LOG_FILE, SENSOR_DISCONNECTED_C},
    web, AppContext, AppEvent, ConfigStore, DataLog, LatestReading, LinkError, LoggerSettings,
    NetworkClock, ProbeError, ProvisioningForm, ReadingSink, Reply, Restarter, StationLink,
    TemperatureProbe,
};

use crate::assets;

const LOOP_PERIOD: Duration = Duration::from_millis(100);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
const SIM_JOIN_POLLS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimSensor {
    Wave,
    Disconnected,
}

struct HostOptions {
    data_dir: PathBuf,
    http_port: u16,
    settings: LoggerSettings,
    sim_join: bool,
    sim_sensor: SimSensor,
}

impl HostOptions {
    fn from_env() -> Self {
        let mut settings = LoggerSettings::default();
        if let Some(interval) = std::env::var("TEMPLOG_SAMPLE_INTERVAL_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
        {
            settings.sample_interval_ms = interval;
        }

        let sim_join = std::env::var("TEMPLOG_SIM_JOIN")
            .map(|value| !matches!(value.trim(), "0" | "false" | "no"))
            .unwrap_or(true);
        let sim_sensor = match std::env::var("TEMPLOG_SIM_SENSOR").as_deref() {
            Ok("disconnected") => SimSensor::Disconnected,
            _ => SimSensor::Wave,
        };

        Self {
            data_dir: std::env::var("TEMPLOG_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("templog-data")),
            http_port: std::env::var("TEMPLOG_HTTP_PORT")
                .ok()
                .and_then(|value| value.parse::<u16>().ok())
                .unwrap_or(8080),
            settings,
            sim_join,
            sim_sensor,
        }
    }
}

#[derive(Clone)]
struct WebState {
    store: ConfigStore,
    log: DataLog,
    latest: LatestReading,
    readings: broadcast::Sender<String>,
    restarter: HostRestarter,
    restart_delay: Duration,
}

/// Ends the current boot after a delay, like a device reset.
#[derive(Clone)]
struct HostRestarter {
    notify: Arc<Notify>,
}

impl Restarter for HostRestarter {
    fn restart_after(&self, delay: Duration) {
        let notify = self.notify.clone();
        let spawned = thread::Builder::new()
            .name("restart-request".into())
            .spawn(move || {
                thread::sleep(delay);
                notify.notify_one();
            });
        if let Err(err) = spawned {
            warn!("failed to spawn restart thread ({err}); restarting now");
            self.notify.notify_one();
        }
    }
}

struct BroadcastSink(broadcast::Sender<String>);

impl ReadingSink for BroadcastSink {
    fn subscriber_count(&self) -> usize {
        self.0.receiver_count()
    }

    fn publish(&self, row: &str) {
        let _ = self.0.send(row.to_string());
    }
}

/// Station link that joins after a few polls, or never.
struct SimLink {
    joins: bool,
    join_requested: bool,
    polls: u32,
}

impl StationLink for SimLink {
    fn configure_static(
        &mut self,
        ip: Ipv4Addr,
        gateway: Ipv4Addr,
        mask: Ipv4Addr,
        dns: Ipv4Addr,
    ) -> Result<(), LinkError> {
        info!("sim link: static ip {ip} gateway {gateway} mask {mask} dns {dns}");
        Ok(())
    }

    fn begin_join(&mut self, ssid: &str, _credential: &str) -> Result<(), LinkError> {
        info!("sim link: joining `{ssid}`");
        self.join_requested = true;
        self.polls = 0;
        Ok(())
    }

    fn is_joined(&mut self) -> bool {
        if !self.joins || !self.join_requested {
            return false;
        }
        self.polls = self.polls.saturating_add(1);
        self.polls > SIM_JOIN_POLLS
    }

    fn start_access_point(&mut self, ssid: &str) -> Result<(), LinkError> {
        info!("sim link: open access point `{ssid}`");
        Ok(())
    }
}

struct SimProbe {
    mode: SimSensor,
    tick: u64,
}

impl TemperatureProbe for SimProbe {
    fn request_conversion(&mut self) -> Result<(), ProbeError> {
        self.tick = self.tick.saturating_add(1);
        Ok(())
    }

    fn read_celsius(&mut self) -> f32 {
        match self.mode {
            SimSensor::Wave => 21.0 + (self.tick % 8) as f32 * 0.25,
            SimSensor::Disconnected => SENSOR_DISCONNECTED_C,
        }
    }
}

#[derive(Default)]
struct SystemClock {
    started: bool,
}

impl NetworkClock for SystemClock {
    fn start(&mut self) -> Result<(), LinkError> {
        self.started = true;
        Ok(())
    }

    fn update(&mut self) -> bool {
        self.started
    }

    fn force_update(&mut self) -> bool {
        self.started
    }

    fn now_utc(&self) -> Option<DateTime<Utc>> {
        self.started.then(Utc::now)
    }
}

struct ServerHandle {
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    async fn stop(self) {
        self.shutdown.notify_one();
        let mut task = self.task;
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
            warn!("logger server still busy after shutdown; aborting");
            task.abort();
        }
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let options = HostOptions::from_env();
    info!(
        "simulated logger using {} (join={}, sensor={:?})",
        options.data_dir.display(),
        options.sim_join,
        options.sim_sensor
    );

    loop {
        boot(&options).await?;
        info!("restarting");
    }
}

/// One device lifetime: boot, run the main loop, return when a restart is due.
async fn boot(options: &HostOptions) -> anyhow::Result<()> {
    let settings = options.settings.clone();
    let store = ConfigStore::new(options.data_dir.join("spiffs"));
    let log = DataLog::new(
        options.data_dir.join("sdcard").join(DATA_LOG_FILE),
        settings.log_max_bytes,
    );

    let restart = Arc::new(Notify::new());
    let (readings, _) = broadcast::channel::<String>(32);
    let sink = BroadcastSink(readings.clone());

    let started = Instant::now();
    let mut app = AppContext::boot(
        settings.clone(),
        store.clone(),
        log.clone(),
        SimLink {
            joins: options.sim_join,
            join_requested: false,
            polls: 0,
        },
        SimProbe {
            mode: options.sim_sensor,
            tick: 0,
        },
        SystemClock::default(),
        0,
    );

    let state = WebState {
        store,
        log,
        latest: app.latest(),
        readings,
        restarter: HostRestarter {
            notify: restart.clone(),
        },
        restart_delay: Duration::from_millis(settings.restart_delay_ms),
    };

    let mut server: Option<ServerHandle> = None;
    let mut ticker = tokio::time::interval(LOOP_PERIOD);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = restart.notified() => break,
        }

        let now_ms = started.elapsed().as_millis() as u64;
        match app.poll(now_ms, &sink) {
            AppEvent::Connected => {
                server = Some(spawn_server(station_router(state.clone()), options.http_port).await?);
            }
            AppEvent::AccessPoint => {
                server = Some(
                    spawn_server(access_point_router(state.clone()), options.http_port).await?,
                );
            }
            AppEvent::RestartRequired => break,
            AppEvent::Idle | AppEvent::Sampled(_) => {}
        }
    }

    if let Some(server) = server {
        server.stop().await;
    }
    Ok(())
}

fn web_root() -> String {
    format!("{}/web", env!("CARGO_MANIFEST_DIR"))
}

fn station_router(state: WebState) -> Router {
    Router::new()
        .route("/", get(handle_index))
        .route("/style.css", get(handle_style))
        .route("/index.js", get(handle_script))
        .route("/getdata", get(handle_get_data))
        .route("/download", get(handle_download))
        .route("/delete", get(handle_delete))
        .route("/clearconfig", get(handle_clear_config))
        .route("/api/latest", get(handle_latest))
        .route("/ws", get(handle_ws))
        .fallback_service(ServeDir::new(web_root()))
        .with_state(state)
}

fn access_point_router(state: WebState) -> Router {
    Router::new()
        .route("/", get(handle_wifimanager).post(handle_submit_form))
        .route("/style.css", get(handle_style))
        .fallback_service(ServeDir::new(web_root()))
        .with_state(state)
}

async fn spawn_server(router: Router, port: u16) -> anyhow::Result<ServerHandle> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind logger server at {addr}"))?;
    info!("logger listening on http://{addr}");

    let shutdown = Arc::new(Notify::new());
    let signal = shutdown.clone();
    let task = tokio::spawn(async move {
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async move { signal.notified().await })
            .await;
        if let Err(err) = served {
            warn!("logger server error: {err}");
        }
    });

    Ok(ServerHandle { shutdown, task })
}

struct WebReply(Reply);

impl IntoResponse for WebReply {
    fn into_response(self) -> Response {
        let Reply {
            status,
            content_type,
            headers,
            body,
        } = self.0;
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = (status, body).into_response();

        let response_headers = response.headers_mut();
        response_headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        for (name, value) in headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                (Ok(name), Ok(value)) => {
                    response_headers.insert(name, value);
                }
                _ => warn!("dropping invalid response header `{name}`"),
            }
        }
        response
    }
}

/// Data log access is plain file I/O; keep it off the async workers.
async fn blocking<F>(handler: F) -> WebReply
where
    F: FnOnce() -> Reply + Send + 'static,
{
    match tokio::task::spawn_blocking(handler).await {
        Ok(reply) => WebReply(reply),
        Err(err) => WebReply(Reply::text(500, format!("request failed: {err}"))),
    }
}

async fn handle_index(State(state): State<WebState>) -> WebReply {
    WebReply(web::index(assets::INDEX_HTML, &state.latest))
}

async fn handle_wifimanager() -> WebReply {
    WebReply(Reply::ok(web::CONTENT_HTML, assets::WIFIMANAGER_HTML))
}

async fn handle_style() -> WebReply {
    WebReply(Reply::ok(web::CONTENT_CSS, assets::STYLE_CSS))
}

async fn handle_script() -> WebReply {
    WebReply(Reply::ok(web::CONTENT_JS, assets::INDEX_JS))
}

async fn handle_get_data(State(state): State<WebState>) -> WebReply {
    blocking(move || web::get_data(&state.log)).await
}

async fn handle_download(State(state): State<WebState>) -> WebReply {
    blocking(move || web::download(&state.log)).await
}

async fn handle_delete(State(state): State<WebState>) -> WebReply {
    blocking(move || web::delete(&state.log)).await
}

async fn handle_latest(State(state): State<WebState>) -> WebReply {
    WebReply(web::latest_json(&state.latest))
}

async fn handle_clear_config(State(state): State<WebState>) -> WebReply {
    blocking(move || web::clear_config(&state.store, &state.restarter, state.restart_delay)).await
}

async fn handle_submit_form(
    State(state): State<WebState>,
    Form(form): Form<ProvisioningForm>,
) -> WebReply {
    blocking(move || {
        web::submit_form(&state.store, &state.restarter, state.restart_delay, &form)
    })
    .await
}

async fn handle_ws(State(state): State<WebState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let readings = state.readings.subscribe();
    ws.on_upgrade(move |socket| stream_readings(socket, readings))
}

/// Pushes each logged row to one client. Inbound frames are read and dropped.
async fn stream_readings(mut socket: WebSocket, mut readings: broadcast::Receiver<String>) {
    loop {
        tokio::select! {
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            row = readings.recv() => match row {
                Ok(row) => {
                    if socket.send(Message::Text(row.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("websocket client lagging; {skipped} row(s) skipped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}
