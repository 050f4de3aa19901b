use std::{
    fs::{self, OpenOptions},
    io::{ErrorKind, Write as _},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::{NaiveDateTime, Utc};
use ds18b20::{Ds18b20, Resolution};
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, Configuration},
};
use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyIOPin, InputOutput, PinDriver, Pull},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use one_wire_bus::{Address, OneWire};

use templog_common::{
    boot, dispatch,
    form::{self, SetGpsForm, SetIntervalForm, SetTimeForm},
    AccessPointConfig, Attached, BootOutcome, ClockError, Command, ControlSurface, DurableStore, KeyValueStore, LogStore, LoggerConfig, RecordTicker, Reply,
    SensorError, SensorIdentity, SleepRequest, Station, StoreError, TemperatureSensor,
    VolatileAcrossSleep, WakeCause, WallClock, ROUTE_DELETE, ROUTE_DOWNLOAD, ROUTE_INDEX,
    ROUTE_SET_GPS, ROUTE_SET_INTERVAL, ROUTE_SET_TIME, ROUTE_START, ROUTE_STATUS,
};

const NVS_NAMESPACE: &str = "templog";
const NVS_CONFIG_KEY: &str = "config_json";
const NVS_VALUE_BUFFER: usize = 512;

const SPIFFS_LOG_PATH: &str = "/spiffs/data.txt";
const MAX_HTTP_BODY: usize = 4096;
const WATCHDOG_TIMEOUT_SEC: u32 = 90;
const SUSPEND_GRACE: Duration = Duration::from_millis(500);
const CRYSTAL_SETTLE: Duration = Duration::from_millis(200);

// RTC slow memory: kept through deep sleep, re-initialised on power-up.
#[link_section = ".rtc.data"]
static FIRST_EXECUTION: AtomicBool = AtomicBool::new(true);

type EspStation = Station<Attached<NvsSlots>, SpiffsLog, Ds18b20Probe, SystemClock>;
type SharedStation = Arc<Mutex<EspStation>>;

struct RtcBootFlag;

impl VolatileAcrossSleep<bool> for RtcBootFlag {
    fn get(&self) -> bool {
        FIRST_EXECUTION.load(Ordering::Relaxed)
    }

    fn set(&mut self, value: bool) {
        FIRST_EXECUTION.store(value, Ordering::Relaxed);
    }
}

struct NvsSlots {
    nvs: EspNvs<NvsDefault>,
}

struct SpiffsLog {
    path: PathBuf,
}

type OneWireBus = OneWire<PinDriver<'static, AnyIOPin, InputOutput>>;

struct Ds18b20Probe {
    /// `None` when the bus failed to come up; every read is then a disconnect.
    one_wire: Option<OneWireBus>,
    address: Option<Address>,
    pin: i32,
    delay: Ets,
}

#[derive(Clone, Copy)]
struct SystemClock;

struct EspSurface {
    modem: Option<Modem>,
    sys_loop: Option<EspSystemEventLoop>,
    nvs_partition: Option<EspDefaultNvsPartition>,
    access_point: AccessPointConfig,
    wifi: Option<EspWifi<'static>>,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let cause = read_wake_cause();

    // Nothing below may stop a timer wake from reaching the sleep call.
    let nvs_partition = EspDefaultNvsPartition::take()
        .map_err(|err| warn!("NVS partition unavailable: {err}"))
        .ok();
    let config = nvs_partition
        .as_ref()
        .map(load_config)
        .unwrap_or_else(|| Ok(LoggerConfig::default()))
        .unwrap_or_else(|err| {
            warn!("failed to load logger config from NVS: {err:#}");
            LoggerConfig::default()
        });

    configure_wake_pin(config.hardware.wake_pin);
    enable_rtc_crystal();
    if let Err(err) = mount_spiffs() {
        warn!("an error occurred while mounting SPIFFS: {err:#}");
    }

    let slots = nvs_partition
        .clone()
        .ok_or_else(|| anyhow!("no NVS partition"))
        .and_then(NvsSlots::open);
    let store = DurableStore::new(Attached::from_open(slots), SpiffsLog::new());
    let probe = Ds18b20Probe::new(config.hardware.one_wire_pin);
    let mut station = Station::new(store, probe, SystemClock, config.default_interval());

    let mut surface = EspSurface {
        modem: Peripherals::take()
            .map(|peripherals| peripherals.modem)
            .map_err(|err| warn!("peripherals unavailable: {err}"))
            .ok(),
        sys_loop: EspSystemEventLoop::take()
            .map_err(|err| warn!("system event loop unavailable: {err}"))
            .ok(),
        nvs_partition,
        access_point: config.access_point.clone(),
        wifi: None,
    };

    match boot(cause, &mut RtcBootFlag, &mut station, &mut surface) {
        BootOutcome::Suspended(request) => enter_deep_sleep(request, config.hardware.wake_pin),
        BootOutcome::Interactive => run_interactive(station, surface, &config),
    }
}

fn run_interactive(
    station: EspStation,
    surface: EspSurface,
    config: &LoggerConfig,
) -> anyhow::Result<()> {
    let station: SharedStation = Arc::new(Mutex::new(station));

    // Keep the access point and server alive for the rest of the session.
    let _wifi = surface.wifi;
    let _server = create_http_server(
        station.clone(),
        config.hardware.http_port,
        config.hardware.wake_pin,
    )
    .map_err(|err| warn!("control surface server not started: {err:#}"))
    .ok();

    let watchdog =
        init_watchdog(WATCHDOG_TIMEOUT_SEC).and_then(|()| add_current_task_to_watchdog());
    if let Err(err) = watchdog {
        warn!("task watchdog not armed: {err:#}");
    }

    let mut ticker = RecordTicker::new(config.interactive_record_period_ms, monotonic_ms());

    loop {
        feed_watchdog();

        if ticker.due(monotonic_ms()) {
            match station.lock() {
                Ok(mut station) => {
                    let _ = station.record();
                }
                Err(_) => warn!("station lock poisoned, skipping record"),
            }
        }

        thread::sleep(Duration::from_secs(1));
    }
}

fn load_config(partition: &EspDefaultNvsPartition) -> anyhow::Result<LoggerConfig> {
    let nvs = EspNvs::new(partition.clone(), NVS_NAMESPACE, true)?;
    let mut buffer = vec![0_u8; 2048];

    match nvs.get_str(NVS_CONFIG_KEY, &mut buffer)? {
        Some(value) => Ok(LoggerConfig::from_json(value)?),
        None => Ok(LoggerConfig::default()),
    }
}

fn read_wake_cause() -> WakeCause {
    use esp_idf_svc::sys;

    let cause = unsafe { sys::esp_sleep_get_wakeup_cause() };
    match cause {
        sys::esp_sleep_source_t_ESP_SLEEP_WAKEUP_UNDEFINED => WakeCause::PowerOn,
        sys::esp_sleep_source_t_ESP_SLEEP_WAKEUP_TIMER => WakeCause::Timer,
        sys::esp_sleep_source_t_ESP_SLEEP_WAKEUP_EXT0
        | sys::esp_sleep_source_t_ESP_SLEEP_WAKEUP_EXT1
        | sys::esp_sleep_source_t_ESP_SLEEP_WAKEUP_GPIO => WakeCause::ExternalSignal,
        other => WakeCause::Other(other),
    }
}

fn configure_wake_pin(pin: i32) {
    use esp_idf_svc::sys;

    let rc = unsafe {
        sys::gpio_set_direction(pin, sys::gpio_mode_t_GPIO_MODE_INPUT);
        sys::gpio_pullup_dis(pin);
        sys::gpio_pulldown_en(pin)
    };
    if rc != sys::ESP_OK {
        warn!("failed to configure wake pin GPIO{pin}: esp_err_t={rc}");
    }
}

fn enable_rtc_crystal() {
    unsafe { esp_idf_svc::sys::rtc_clk_32k_enable(true) };
    thread::sleep(CRYSTAL_SETTLE);

    if unsafe { esp_idf_svc::sys::rtc_clk_32k_enabled() } {
        info!("32.768 kHz crystal enabled for the RTC");
    } else {
        warn!("failed to enable the 32.768 kHz crystal, RTC stays on the internal oscillator");
    }
}

fn mount_spiffs() -> anyhow::Result<()> {
    let conf = esp_idf_svc::sys::esp_vfs_spiffs_conf_t {
        base_path: c"/spiffs".as_ptr(),
        partition_label: core::ptr::null(),
        max_files: 5,
        format_if_mount_failed: true,
    };

    let rc = unsafe { esp_idf_svc::sys::esp_vfs_spiffs_register(&conf) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_vfs_spiffs_register failed with code {}", rc))
}

fn enter_deep_sleep(request: SleepRequest, wake_pin: i32) -> ! {
    info!(
        "going to sleep for {}s, wake pin GPIO{wake_pin}",
        request.duration().as_secs()
    );

    let rc = unsafe { esp_idf_svc::sys::esp_sleep_enable_timer_wakeup(request.as_micros()) };
    if rc != esp_idf_svc::sys::ESP_OK {
        warn!(
            "timer wakeup rejected for {}us: esp_err_t={rc}",
            request.as_micros()
        );
    }

    let rc = unsafe { enable_wake_source(wake_pin) };
    if rc != esp_idf_svc::sys::ESP_OK {
        warn!("wake pin GPIO{wake_pin} not armed: esp_err_t={rc}");
    }

    unsafe { esp_idf_svc::sys::esp_deep_sleep_start() }
}

#[cfg(any(esp32, esp32s3))]
unsafe fn enable_wake_source(pin: i32) -> esp_idf_svc::sys::esp_err_t {
    use esp_idf_svc::sys;

    sys::rtc_gpio_pulldown_en(pin);
    sys::esp_sleep_enable_ext1_wakeup(
        1_u64 << pin,
        sys::esp_sleep_ext1_wakeup_mode_t_ESP_EXT1_WAKEUP_ANY_HIGH,
    )
}

#[cfg(not(any(esp32, esp32s3)))]
unsafe fn enable_wake_source(pin: i32) -> esp_idf_svc::sys::esp_err_t {
    use esp_idf_svc::sys;

    sys::esp_deep_sleep_enable_gpio_wakeup(
        1_u64 << pin,
        sys::esp_deepsleep_gpio_wake_up_mode_t_ESP_GPIO_WAKEUP_GPIO_HIGH,
    )
}

fn schedule_deep_sleep(request: SleepRequest, wake_pin: i32) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("deep-sleep".into())
        .spawn(move || {
            thread::sleep(SUSPEND_GRACE);
            enter_deep_sleep(request, wake_pin);
        })
        .context("failed to spawn deep sleep thread")?;
    Ok(())
}

impl ControlSurface for EspSurface {
    type Error = anyhow::Error;

    fn start(&mut self, identity: &SensorIdentity) -> anyhow::Result<()> {
        let modem = self
            .modem
            .take()
            .ok_or_else(|| anyhow!("wifi modem already in use"))?;

        let sys_loop = self
            .sys_loop
            .clone()
            .ok_or_else(|| anyhow!("system event loop unavailable"))?;

        let mut wifi = EspWifi::new(modem, sys_loop.clone(), self.nvs_partition.clone())?;
        start_access_point(
            &mut BlockingWifi::wrap(&mut wifi, sys_loop)?,
            &self.access_point,
        )?;

        let ip = wifi.ap_netif().get_ip_info()?.ip;
        info!("sensor {identity}: connect to the network and go to http://{ip}");

        self.wifi = Some(wifi);
        Ok(())
    }
}

fn start_access_point(
    wifi: &mut BlockingWifi<&mut EspWifi<'static>>,
    access_point: &AccessPointConfig,
) -> anyhow::Result<()> {
    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: access_point
            .ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("access point SSID too long"))?,
        password: access_point
            .password
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("access point password too long"))?,
        auth_method: AuthMethod::WPA2Personal,
        channel: access_point.channel,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.wait_netif_up()?;
    info!("access point started on `{}`", access_point.ssid);
    Ok(())
}

fn create_http_server(
    station: SharedStation,
    port: u16,
    wake_pin: i32,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        http_port: port,
        stack_size: 16 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    let routes: [(&str, Method, fn(&[u8]) -> Command); 8] = [
        (ROUTE_INDEX, Method::Get, |_| Command::Index),
        (ROUTE_STATUS, Method::Get, |_| Command::Status),
        (ROUTE_SET_TIME, Method::Post, |body| form::decode::<SetTimeForm>(body).into()),
        (ROUTE_SET_GPS, Method::Post, |body| form::decode::<SetGpsForm>(body).into()),
        (ROUTE_SET_INTERVAL, Method::Post, |body| form::decode::<SetIntervalForm>(body).into()),
        (ROUTE_DOWNLOAD, Method::Get, |_| Command::Download),
        (ROUTE_DELETE, Method::Get, |_| Command::Clear),
        (ROUTE_START, Method::Get, |_| Command::StartMeasurements),
    ];

    for (path, method, command) in routes {
        let station = station.clone();
        server.fn_handler::<anyhow::Error, _>(path, method, move |mut req| {
            let body = read_request_body(&mut req)?;

            let reply = {
                let mut station = station
                    .lock()
                    .map_err(|_| anyhow!("station lock poisoned"))?;
                dispatch(&mut *station, command(&body))
            };

            let suspend = reply.suspend;
            write_reply(req, reply)?;

            if let Some(request) = suspend {
                schedule_deep_sleep(request, wake_pin)?;
            }
            Ok(())
        })?;
    }

    Ok(server)
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Vec<u8>> {
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

fn write_reply(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    reply: Reply,
) -> anyhow::Result<()> {
    let mut headers = vec![("Content-Type", reply.content_type)];
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

impl NvsSlots {
    fn open(partition: EspDefaultNvsPartition) -> anyhow::Result<Self> {
        let nvs = EspNvs::new(partition, NVS_NAMESPACE, true)
            .context("failed to open NVS namespace")?;
        Ok(Self { nvs })
    }
}

impl KeyValueStore for NvsSlots {
    fn get_str(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut buffer = vec![0_u8; NVS_VALUE_BUFFER];
        self.nvs
            .get_str(key, &mut buffer)
            .map(|value| value.map(str::to_string))
            .map_err(|err| StoreError::OpenFailed(err.to_string()))
    }

    fn set_str(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.nvs
            .set_str(key, value)
            .map_err(|err| StoreError::WriteFailed(err.to_string()))
    }

    fn get_u32(&self, key: &str) -> Result<Option<u32>, StoreError> {
        self.nvs
            .get_u32(key)
            .map_err(|err| StoreError::OpenFailed(err.to_string()))
    }

    fn set_u32(&mut self, key: &str, value: u32) -> Result<(), StoreError> {
        self.nvs
            .set_u32(key, value)
            .map_err(|err| StoreError::WriteFailed(err.to_string()))
    }
}

impl SpiffsLog {
    fn new() -> Self {
        Self {
            path: PathBuf::from(SPIFFS_LOG_PATH),
        }
    }
}

impl LogStore for SpiffsLog {
    fn append(&mut self, line: &str) -> Result<(), StoreError> {
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
            Ok(()) => {
                info!("data deleted");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::WriteFailed(err.to_string())),
        }
    }

    fn free_bytes(&self) -> Option<u64> {
        let mut total = 0_usize;
        let mut used = 0_usize;
        let rc = unsafe {
            esp_idf_svc::sys::esp_spiffs_info(core::ptr::null(), &mut total, &mut used)
        };
        (rc == esp_idf_svc::sys::ESP_OK).then(|| total.saturating_sub(used) as u64)
    }
}

impl Ds18b20Probe {
    fn new(pin: i32) -> Self {
        let one_wire = open_one_wire(pin)
            .map_err(|err| warn!("DS18B20 bus on GPIO{pin} unavailable: {err:#}"))
            .ok();

        Self {
            one_wire,
            address: None,
            pin,
            delay: Ets,
        }
    }

    /// First DS18B20 on the bus, or the scan error that stopped the search.
    fn scan(&mut self) -> Result<Option<Address>, String> {
        let Some(one_wire) = self.one_wire.as_mut() else {
            self.address = None;
            return Ok(None);
        };
        let mut device_count = 0_u32;

        for addr in one_wire.devices(false, &mut self.delay) {
            match addr {
                Ok(address) => {
                    device_count = device_count.saturating_add(1);
                    if address.family_code() == ds18b20::FAMILY_CODE {
                        info!(
                            "DS18B20 ready on GPIO{} ({} one-wire device(s), using {:?})",
                            self.pin, device_count, address
                        );
                        self.address = Some(address);
                        return Ok(Some(address));
                    }
                }
                Err(err) => return Err(format!("{err:?}")),
            }
        }

        warn!(
            "no DS18B20 found on GPIO{} ({} one-wire device(s) detected)",
            self.pin, device_count
        );
        self.address = None;
        Ok(None)
    }
}

impl TemperatureSensor for Ds18b20Probe {
    fn identity(&mut self) -> SensorIdentity {
        match self.scan() {
            Ok(Some(address)) => SensorIdentity::Address(address.0.to_le_bytes()),
            Ok(None) => SensorIdentity::NotFound,
            Err(err) => {
                warn!("one-wire device scan failed: {err}");
                SensorIdentity::Unknown
            }
        }
    }

    fn request_conversion(&mut self) -> Result<(), SensorError> {
        if self.address.is_none() {
            if let Err(err) = self.scan() {
                warn!("one-wire device scan failed: {err}");
            }
        }
        let (Some(one_wire), Some(_)) = (self.one_wire.as_mut(), self.address) else {
            return Err(SensorError::Disconnected);
        };

        if let Err(err) = ds18b20::start_simultaneous_temp_measurement(one_wire, &mut self.delay) {
            warn!("failed to start DS18B20 conversion: {err:?}");
            self.address = None;
            return Err(SensorError::Disconnected);
        }

        Resolution::Bits12.delay_for_measurement_time(&mut self.delay);
        Ok(())
    }

    fn read_celsius(&mut self) -> Result<f32, SensorError> {
        let address = self.address.ok_or(SensorError::Disconnected)?;
        let one_wire = self.one_wire.as_mut().ok_or(SensorError::Disconnected)?;
        let sensor = Ds18b20::new::<core::convert::Infallible>(address).map_err(|err| {
            warn!("invalid DS18B20 address {:?}: {err:?}", address);
            SensorError::Disconnected
        })?;

        match sensor.read_data(one_wire, &mut self.delay) {
            Ok(data) => Ok(data.temperature),
            Err(err) => {
                warn!("failed to read DS18B20 data: {err:?}");
                self.address = None;
                Err(SensorError::Disconnected)
            }
        }
    }
}

fn open_one_wire(pin: i32) -> anyhow::Result<OneWireBus> {
    // The pin number comes from config; nothing else drives this GPIO.
    let mut one_wire_pin = PinDriver::input_output_od(unsafe { AnyIOPin::new(pin) })?;
    one_wire_pin.set_pull(Pull::Up)?;
    one_wire_pin.set_high()?;

    OneWire::new(one_wire_pin).map_err(|err| anyhow!("failed to initialize one-wire bus: {err:?}"))
}

impl WallClock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Utc::now().naive_utc()
    }

    fn set(&mut self, local: NaiveDateTime) -> Result<(), ClockError> {
        let tv = esp_idf_svc::sys::timeval {
            tv_sec: local.and_utc().timestamp() as _,
            tv_usec: 0,
        };

        let rc = unsafe { esp_idf_svc::sys::settimeofday(&tv, core::ptr::null()) };
        if rc == 0 {
            return Ok(());
        }
        Err(ClockError::Rejected(format!("settimeofday returned {rc}")))
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
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
