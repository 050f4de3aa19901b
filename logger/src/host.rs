use std::{
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    net::{SocketAddr, TcpListener as StdTcpListener},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{rejection::FormRejection, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Router,
};
use chrono::{Local, NaiveDateTime, TimeDelta};
use serde_json::{Map, Value};
use tokio::{
    net::TcpListener,
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};

use templog_common::{
    boot, dispatch,
    form::{SetGpsForm, SetIntervalForm, SetTimeForm},
    memory::RetainedCell,
    Attached, BootOutcome, ClockError, Command, ControlSurface, DurableStore, KeyValueStore,
    LogStore, LoggerConfig, RecordTicker, Reply, SensorError, SensorIdentity, SleepRequest,
    Station, StoreError, TemperatureSensor, WakeCause, WallClock, ROUTE_DELETE, ROUTE_DOWNLOAD,
    ROUTE_INDEX, ROUTE_SET_GPS, ROUTE_SET_INTERVAL, ROUTE_SET_TIME, ROUTE_START, ROUTE_STATUS,
};

const SIMULATED_FLASH_BYTES: u64 = 1024 * 1024;
const SUSPEND_GRACE: Duration = Duration::from_millis(500);
const SIMULATED_ADDRESS: [u8; 8] = [0x28, 0x61, 0x64, 0x12, 0x3f, 0xa1, 0x0b, 0x4e];

type HostStation = Station<Attached<FsKv>, FsLog, SimulatedProbe, OffsetClock>;

#[derive(Clone)]
struct AppState {
    station: Arc<Mutex<HostStation>>,
    suspend: mpsc::UnboundedSender<SleepRequest>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("TEMPLOG_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.templog"));
    fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;

    let config = load_config(&data_dir).unwrap_or_else(|err| {
        warn!("failed to load logger config: {err:#}");
        LoggerConfig::default()
    });
    let port = std::env::var("TEMPLOG_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);

    // Survives simulated sleeps, reset only by restarting the process.
    let mut first_boot = RetainedCell::power_on(true);
    let clock = OffsetClock::default();
    let mut cause = WakeCause::PowerOn;

    loop {
        let mut station = open_station(
            &data_dir,
            SimulatedProbe::from_env(),
            clock.clone(),
            &config,
        );
        let mut surface = HttpSurface::new(port);

        let request = match boot(cause, &mut first_boot, &mut station, &mut surface) {
            BootOutcome::Suspended(request) => request,
            BootOutcome::Interactive => {
                match run_interactive(station, surface.listener.take(), &config).await? {
                    Some(request) => request,
                    None => {
                        info!("power removed, shutting down");
                        return Ok(());
                    }
                }
            }
        };

        cause = simulate_deep_sleep(request).await;
    }
}

/// Builds this boot's station. A store that fails to open leaves the boot
/// running with every slot reporting the failure.
fn open_station(
    data_dir: &Path,
    probe: SimulatedProbe,
    clock: OffsetClock,
    config: &LoggerConfig,
) -> HostStation {
    let store = DurableStore::new(
        Attached::from_open(FsKv::open(data_dir)),
        FsLog::open(data_dir),
    );
    Station::new(store, probe, clock, config.default_interval())
}

fn load_config(data_dir: &Path) -> anyhow::Result<LoggerConfig> {
    let path = data_dir.join("config.json");
    match fs::read_to_string(&path) {
        Ok(raw) => LoggerConfig::from_json(&raw)
            .with_context(|| format!("invalid config at {}", path.display())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(LoggerConfig::default()),
        Err(err) => Err(err.into()),
    }
}

/// Runs the control surface and the short record tick until a suspend is
/// requested (`Some`) or the process is interrupted (`None`).
async fn run_interactive(
    station: HostStation,
    listener: Option<StdTcpListener>,
    config: &LoggerConfig,
) -> anyhow::Result<Option<SleepRequest>> {
    let station = Arc::new(Mutex::new(station));
    let (suspend_tx, mut suspend_rx) = mpsc::unbounded_channel();

    let server = match listener {
        Some(listener) => Some(spawn_server(
            listener,
            AppState {
                station: station.clone(),
                suspend: suspend_tx,
            },
        )?),
        None => None,
    };

    let mut ticker = RecordTicker::new(config.interactive_record_period_ms, monotonic_ms());
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let outcome = loop {
        tokio::select! {
            _ = interval.tick() => {
                if ticker.due(monotonic_ms()) {
                    let _ = station.lock().await.record();
                }
            }
            Some(request) = suspend_rx.recv() => break Some(request),
            _ = &mut shutdown => break None,
        }
    };

    if outcome.is_some() {
        // Let the pending reply reach the client before the server goes away.
        tokio::time::sleep(SUSPEND_GRACE).await;
    }
    if let Some(server) = server {
        server.abort();
    }

    Ok(outcome)
}

fn spawn_server(listener: StdTcpListener, app_state: AppState) -> anyhow::Result<JoinHandle<()>> {
    let listener = TcpListener::from_std(listener).context("failed to adopt listener")?;

    let app = Router::new()
        .route(ROUTE_INDEX, get(handle_index))
        .route(ROUTE_STATUS, get(handle_status))
        .route(ROUTE_SET_TIME, post(handle_set_time))
        .route(ROUTE_SET_GPS, post(handle_set_gps))
        .route(ROUTE_SET_INTERVAL, post(handle_set_interval))
        .route(ROUTE_DOWNLOAD, get(handle_download))
        .route(ROUTE_DELETE, get(handle_delete))
        .route(ROUTE_START, get(handle_start))
        .with_state(app_state);

    Ok(tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            warn!("control surface server stopped: {err}");
        }
    }))
}

async fn simulate_deep_sleep(request: SleepRequest) -> WakeCause {
    let duration = std::env::var("TEMPLOG_SLEEP_SECONDS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(request.duration());

    info!(
        "simulated deep sleep for {}s, press Ctrl-C for the wake button",
        duration.as_secs()
    );

    tokio::select! {
        _ = tokio::time::sleep(duration) => WakeCause::Timer,
        _ = tokio::signal::ctrl_c() => WakeCause::ExternalSignal,
    }
}

struct HttpSurface {
    port: u16,
    listener: Option<StdTcpListener>,
}

impl HttpSurface {
    fn new(port: u16) -> Self {
        Self {
            port,
            listener: None,
        }
    }
}

impl ControlSurface for HttpSurface {
    type Error = std::io::Error;

    fn start(&mut self, identity: &SensorIdentity) -> Result<(), Self::Error> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = StdTcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;

        info!("control surface for sensor {identity} listening on http://{addr}");
        self.listener = Some(listener);
        Ok(())
    }
}

async fn handle_index(State(state): State<AppState>) -> Response {
    execute(&state, Command::Index).await
}

async fn handle_status(State(state): State<AppState>) -> Response {
    execute(&state, Command::Status).await
}

async fn handle_set_time(
    State(state): State<AppState>,
    form: Result<Form<SetTimeForm>, FormRejection>,
) -> Response {
    let form = form.map(|Form(form)| form).unwrap_or_default();
    execute(&state, form.into()).await
}

async fn handle_set_gps(
    State(state): State<AppState>,
    form: Result<Form<SetGpsForm>, FormRejection>,
) -> Response {
    let form = form.map(|Form(form)| form).unwrap_or_default();
    execute(&state, form.into()).await
}

async fn handle_set_interval(
    State(state): State<AppState>,
    form: Result<Form<SetIntervalForm>, FormRejection>,
) -> Response {
    let form = form.map(|Form(form)| form).unwrap_or_default();
    execute(&state, form.into()).await
}

async fn handle_download(State(state): State<AppState>) -> Response {
    execute(&state, Command::Download).await
}

async fn handle_delete(State(state): State<AppState>) -> Response {
    execute(&state, Command::Clear).await
}

async fn handle_start(State(state): State<AppState>) -> Response {
    execute(&state, Command::StartMeasurements).await
}

async fn execute(state: &AppState, command: Command) -> Response {
    let reply = {
        let mut station = state.station.lock().await;
        dispatch(&mut *station, command)
    };

    if let Some(request) = reply.suspend {
        if state.suspend.send(request).is_err() {
            warn!("suspend request dropped, session already ending");
        }
    }

    reply_response(reply)
}

fn reply_response(reply: Reply) -> Response {
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(reply.content_type),
    );
    for (name, value) in reply.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!("dropping invalid response header {name}"),
        }
    }

    (status, headers, reply.body).into_response()
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Named slots kept as one JSON object, written through on every change.
struct FsKv {
    path: PathBuf,
    entries: Map<String, Value>,
}

impl FsKv {
    fn open(data_dir: &Path) -> Result<Self, StoreError> {
        let path = data_dir.join("store.json");
        let entries = match fs::read(&path) {
            Ok(raw) => serde_json::from_slice::<Map<String, Value>>(&raw)
                .map_err(|err| StoreError::OpenFailed(format!("{}: {err}", path.display())))?,
            Err(err) if err.kind() == ErrorKind::NotFound => Map::new(),
            Err(err) => return Err(StoreError::OpenFailed(err.to_string())),
        };

        Ok(Self { path, entries })
    }

    fn flush(&self) -> Result<(), StoreError> {
        let payload = serde_json::to_vec_pretty(&self.entries)
            .map_err(|err| StoreError::WriteFailed(err.to_string()))?;
        let staging = self.path.with_extension("json.tmp");

        fs::write(&staging, payload)
            .and_then(|()| fs::rename(&staging, &self.path))
            .map_err(|err| StoreError::WriteFailed(err.to_string()))
    }
}

impl KeyValueStore for FsKv {
    fn get_str(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .entries
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    fn set_str(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries
            .insert(key.to_string(), Value::String(value.to_string()));
        self.flush()
    }

    fn get_u32(&self, key: &str) -> Result<Option<u32>, StoreError> {
        Ok(self
            .entries
            .get(key)
            .and_then(Value::as_u64)
            .and_then(|value| u32::try_from(value).ok()))
    }

    fn set_u32(&mut self, key: &str, value: u32) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), Value::from(value));
        self.flush()
    }
}

struct FsLog {
    path: PathBuf,
    capacity: u64,
}

impl FsLog {
    fn open(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join("data.txt"),
            capacity: SIMULATED_FLASH_BYTES,
        }
    }

    fn used_bytes(&self) -> u64 {
        fs::metadata(&self.path).map(|meta| meta.len()).unwrap_or(0)
    }
}

impl LogStore for FsLog {
    fn append(&mut self, line: &str) -> Result<(), StoreError> {
        if self.used_bytes() + line.len() as u64 > self.capacity {
            return Err(StoreError::WriteFailed("simulated flash full".to_string()));
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| StoreError::OpenFailed(err.to_string()))?;
        file.write_all(line.as_bytes())
            .map_err(|err| StoreError::WriteFailed(err.to_string()))
    }

    fn read_all(&self) -> Result<Vec<u8>, StoreError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(StoreError::NotFound),
            Err(err) => Err(StoreError::OpenFailed(err.to_string())),
        }
    }

    fn remove(&mut self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::WriteFailed(err.to_string())),
        }
    }

    fn free_bytes(&self) -> Option<u64> {
        Some(self.capacity.saturating_sub(self.used_bytes()))
    }
}

/// Stand-in for the DS18B20 when running off-target.
struct SimulatedProbe {
    tick: u64,
    disconnected: bool,
}

impl SimulatedProbe {
    fn from_env() -> Self {
        Self {
            tick: monotonic_ms() / 1_000,
            disconnected: std::env::var("TEMPLOG_SIM_DISCONNECTED").is_ok(),
        }
    }
}

impl TemperatureSensor for SimulatedProbe {
    fn identity(&mut self) -> SensorIdentity {
        if self.disconnected {
            return SensorIdentity::NotFound;
        }
        SensorIdentity::Address(SIMULATED_ADDRESS)
    }

    fn request_conversion(&mut self) -> Result<(), SensorError> {
        if self.disconnected {
            return Err(SensorError::Disconnected);
        }
        self.tick = self.tick.wrapping_add(1);
        Ok(())
    }

    fn read_celsius(&mut self) -> Result<f32, SensorError> {
        if self.disconnected {
            return Err(SensorError::Disconnected);
        }
        Ok(20.0 + (self.tick % 8) as f32 * 0.25)
    }
}

/// Host wall clock: system local time shifted by whatever the phone set.
#[derive(Clone, Default)]
struct OffsetClock {
    offset_ms: Arc<AtomicI64>,
}

impl WallClock for OffsetClock {
    fn now(&self) -> NaiveDateTime {
        let local = Local::now().naive_local();
        TimeDelta::try_milliseconds(self.offset_ms.load(Ordering::Relaxed))
            .and_then(|offset| local.checked_add_signed(offset))
            .unwrap_or(local)
    }

    fn set(&mut self, local: NaiveDateTime) -> Result<(), ClockError> {
        let delta = local - Local::now().naive_local();
        self.offset_ms
            .store(delta.num_milliseconds(), Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use templog_common::DurableAcrossPower;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("templog-{}-{name}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn fs_kv_persists_across_reopen() {
        let dir = scratch_dir("kv");

        let mut store = DurableStore::new(FsKv::open(&dir).unwrap(), FsLog::open(&dir));
        store.counter().save(&41).unwrap();
        store.increment_counter().unwrap();
        store.gps().save(&"48.85, 2.35".to_string()).unwrap();

        let mut reopened = DurableStore::new(FsKv::open(&dir).unwrap(), FsLog::open(&dir));
        assert_eq!(reopened.counter().load(), Ok(42));
        assert_eq!(reopened.gps().load(), Ok("48.85, 2.35".to_string()));

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn fs_kv_rejects_corrupt_file() {
        let dir = scratch_dir("corrupt");
        fs::write(dir.join("store.json"), b"{not json").unwrap();

        assert!(matches!(FsKv::open(&dir), Err(StoreError::OpenFailed(_))));

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn corrupt_store_still_reaches_sleep_on_timer_wake() {
        let dir = scratch_dir("corrupt-boot");
        fs::write(dir.join("store.json"), b"{not json").unwrap();

        let probe = SimulatedProbe {
            tick: 0,
            disconnected: false,
        };
        let mut station = open_station(
            &dir,
            probe,
            OffsetClock::default(),
            &LoggerConfig::default(),
        );
        let mut flag = RetainedCell::power_on(false);
        let mut surface = HttpSurface::new(0);

        let outcome = boot(WakeCause::Timer, &mut flag, &mut station, &mut surface);

        assert_eq!(
            outcome,
            BootOutcome::Suspended(SleepRequest::for_interval(
                LoggerConfig::default().default_interval()
            ))
        );
        assert!(surface.listener.is_none());
        assert_eq!(station.store().log().read_all(), Err(StoreError::NotFound));

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn fs_log_appends_and_removes() {
        let dir = scratch_dir("log");
        let mut log = FsLog::open(&dir);

        assert_eq!(log.read_all(), Err(StoreError::NotFound));
        log.append("20240101 10:00;21.50\n").unwrap();
        log.append("20240101 10:02;21.75\n").unwrap();
        assert_eq!(
            log.read_all().unwrap(),
            b"20240101 10:00;21.50\n20240101 10:02;21.75\n".to_vec()
        );
        assert_eq!(log.free_bytes(), Some(SIMULATED_FLASH_BYTES - 42));

        log.remove().unwrap();
        log.remove().unwrap();
        assert_eq!(log.read_all(), Err(StoreError::NotFound));

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn fs_log_refuses_to_overflow() {
        let dir = scratch_dir("full");
        let mut log = FsLog::open(&dir);
        log.capacity = 10;

        assert!(matches!(
            log.append("20240101 10:00;21.50\n"),
            Err(StoreError::WriteFailed(_))
        ));

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn offset_clock_follows_phone_time() {
        let mut clock = OffsetClock::default();
        let target = Local::now().naive_local() - TimeDelta::try_hours(5).unwrap();

        clock.set(target).unwrap();

        let drift = (clock.now() - target).num_seconds().abs();
        assert!(drift < 5);
    }

    #[test]
    fn reply_headers_are_carried_over() {
        let reply = Reply {
            status: 303,
            content_type: "text/plain",
            headers: vec![("Location", "/".to_string())],
            body: Vec::new(),
            suspend: None,
        };
        let response = reply_response(reply);

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers().get(header::LOCATION).unwrap(), "/");
    }
}
