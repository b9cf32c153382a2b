use core::convert::TryInto;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
    ws::FrameType,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{gpio::AnyOutputPin, prelude::Peripherals},
    http::server::{
        ws::{EspHttpWsConnection, EspHttpWsDetachedSender},
        Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request,
    },
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    sys::EspError,
    timer::{EspTaskTimerService, EspTimer},
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, info, warn};
use serde::Serialize;

use poofer_common::{
    config::{NetworkConfig, MAX_WIFI_FORM_BYTES},
    Clock, CredentialStore, HandlerSlot, LinkSink, MonotonicClock, PooferController, PooferError,
    RuntimeConfig, SafetyTimers, TimerEvent, TimerHandler, TimerKind, WifiCredentials,
    MAX_CHANNELS, MAX_FRAME_BYTES,
};

use crate::led::Ws2812Strip;

const NVS_NAMESPACE: &str = "poofer";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const WATCHDOG_TIMEOUT_SEC: u32 = 5;
const STATION_RETRY_MS: u64 = 5_000;
// Frames past this are read off the socket and discarded; bigger ones close it.
const MAX_WS_DRAIN_BYTES: usize = 512;

const INDEX_HTML: &str = include_str!("../web/index.html");
const WIFI_HTML: &str = include_str!("../web/wifi.html");
const WIFI_SAVED_HTML: &str = include_str!("../web/wifi_saved.html");

type SharedWifi = Arc<Mutex<BlockingWifi<EspWifi<'static>>>>;

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

/// The one WebSocket session that receives status frames.
#[derive(Default)]
struct EspPeerLink {
    peer: Mutex<Option<(i32, EspHttpWsDetachedSender)>>,
}

struct TimerSlot {
    timer: Mutex<EspTimer<'static>>,
    pending: Arc<Mutex<Option<(TimerEvent, u64)>>>,
}

/// One preallocated one-shot timer per `(channel, kind)`.
///
/// Timers are never dropped after creation: cancel may be called from inside
/// the very callback being cancelled. The callback only delivers an event once
/// its deadline has passed, so a late expiry of an earlier arming cannot
/// deliver a freshly armed event early.
struct EspTimers {
    slots: HashMap<(usize, TimerKind), TimerSlot>,
    clock: Arc<MonotonicClock>,
    handler: Arc<HandlerSlot>,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err}");
        RuntimeConfig::default()
    });
    runtime.sanitize();

    info!(
        "NVS config loaded: ap=`{}`, station=`{}`, channels={}",
        runtime.network.ap_ssid,
        runtime
            .network
            .station
            .as_ref()
            .map_or("", |station| station.ssid.as_str()),
        runtime.channel_count,
    );

    let Peripherals { modem, rmt, .. } = Peripherals::take()?;
    let pixel_count = runtime.led.pixel_count();
    let strip = match Ws2812Strip::new(
        rmt.channel0,
        unsafe { AnyOutputPin::new(runtime.led.gpio) },
        pixel_count,
    ) {
        Ok(strip) => {
            info!("LED strip initialized on GPIO{}", runtime.led.gpio);
            strip
        }
        Err(err) => {
            warn!("failed to initialize LED strip, running disabled: {err:#}");
            Ws2812Strip::disabled(pixel_count)
        }
    };

    let timer_service = EspTaskTimerService::new()?;
    let timers = Arc::new(EspTimers::new(&timer_service, usize::from(runtime.channel_count))?);
    let link = Arc::new(EspPeerLink::default());
    let controller = Arc::new(PooferController::new(
        &runtime,
        timers.clone(),
        link.clone(),
        Box::new(strip),
        Arc::new(MonotonicClock::new()),
    ));
    let handler: Arc<dyn TimerHandler> = controller.clone();
    timers.handler.bind(Arc::downgrade(&handler));

    let wifi = start_wifi(modem, sys_loop, nvs_partition, &runtime.network)
        .context("wifi startup failed")?;
    controller.network_ready();

    let server = create_http_server(controller.clone(), link, nvs_store, wifi.clone())?;

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    spawn_reconciler(controller, wifi)?;

    // Keep services alive for the program lifetime.
    let _timer_service = timer_service;
    let _server = server;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn start_wifi(
    modem: esp_idf_svc::hal::modem::Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<SharedWifi> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    if let Err(err) = esp_wifi.sta_netif_mut().set_hostname(&network.hostname) {
        warn!("failed to set hostname `{}`: {err}", network.hostname);
    }

    let mut wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;
    wifi.set_configuration(&Configuration::Mixed(
        client_configuration(network.station.as_ref())?,
        access_point_configuration(network)?,
    ))?;
    wifi.start()?;
    info!(
        "access point `{}` started (max {} clients)",
        network.ap_ssid, network.ap_max_connections
    );

    if let Some(station) = &network.station {
        info!("connecting station to `{}`", station.ssid);
        if let Err(err) = wifi.wifi_mut().connect() {
            warn!("station connect request failed: {err}");
        }
    }

    Ok(Arc::new(Mutex::new(wifi)))
}

fn access_point_configuration(network: &NetworkConfig) -> anyhow::Result<AccessPointConfiguration> {
    let auth_method = if network.ap_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPA2Personal
    };

    Ok(AccessPointConfiguration {
        ssid: network
            .ap_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("AP ssid too long"))?,
        password: network
            .ap_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("AP password too long"))?,
        auth_method,
        max_connections: network.ap_max_connections,
        channel: 1,
        ..Default::default()
    })
}

fn client_configuration(station: Option<&WifiCredentials>) -> anyhow::Result<ClientConfiguration> {
    let Some(station) = station else {
        return Ok(ClientConfiguration::default());
    };

    let auth_method = if station.pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    Ok(ClientConfiguration {
        ssid: station
            .ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: station
            .pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    })
}

fn reconnect_station(wifi: &SharedWifi, credentials: &WifiCredentials) -> anyhow::Result<()> {
    let mut wifi = wifi.lock().unwrap_or_else(PoisonError::into_inner);
    let Configuration::Mixed(_, access_point) = wifi.get_configuration()? else {
        return Err(anyhow!("wifi is not in AP+STA mode"));
    };

    let _ = wifi.wifi_mut().disconnect();
    wifi.set_configuration(&Configuration::Mixed(
        client_configuration(Some(credentials))?,
        access_point,
    ))?;
    wifi.wifi_mut().connect()?;
    info!("station reconnecting to `{}`", credentials.ssid);
    Ok(())
}

fn create_http_server(
    controller: Arc<PooferController>,
    link: Arc<EspPeerLink>,
    nvs_store: NvsStore,
    wifi: SharedWifi,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 12 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler::<anyhow::Error, _>("/", Method::Get, move |req| {
        req.into_response(200, Some("OK"), &[("Content-Type", "text/html")])?
            .write_all(INDEX_HTML.as_bytes())?;
        Ok(())
    })?;

    server.fn_handler::<anyhow::Error, _>("/wifi", Method::Get, move |req| {
        req.into_response(200, Some("OK"), &[("Content-Type", "text/html")])?
            .write_all(WIFI_HTML.as_bytes())?;
        Ok(())
    })?;

    server.fn_handler::<anyhow::Error, _>("/wifi", Method::Post, move |mut req| {
        let body = match read_request_body(&mut req) {
            Ok(body) if !body.is_empty() => body,
            _ => return write_error(req, 400, "Invalid content"),
        };
        let Some(credentials) = WifiCredentials::from_form(&String::from_utf8_lossy(&body)) else {
            return write_error(req, 400, "SSID required");
        };

        if let Err(err) = nvs_store.save_credentials(&credentials) {
            warn!("failed to persist station credentials: {err}");
            return write_error(req, 500, "Failed to persist credentials");
        }
        if let Err(err) = reconnect_station(&wifi, &credentials) {
            warn!("station reconnect failed: {err:#}");
        }

        req.into_response(200, Some("OK"), &[("Content-Type", "text/html")])?
            .write_all(WIFI_SAVED_HTML.as_bytes())?;
        Ok(())
    })?;

    {
        let controller = controller.clone();
        server.fn_handler::<anyhow::Error, _>("/api/status", Method::Get, move |req| {
            match controller.status_frame() {
                Some(frame) => write_json(req, &frame),
                None => write_error(req, 503, "State busy, retry"),
            }
        })?;
    }

    server.ws_handler("/ws", move |ws: &mut EspHttpWsConnection| {
        handle_ws(&controller, &link, ws)
    })?;

    Ok(server)
}

fn handle_ws(
    controller: &PooferController,
    link: &EspPeerLink,
    ws: &mut EspHttpWsConnection,
) -> Result<(), EspError> {
    let session = ws.session();

    if ws.is_new() {
        link.attach(session, ws.create_detached_sender()?);
        info!("link peer {session} attached");
        controller.link_attached();
        return Ok(());
    }

    if ws.is_closed() {
        if link.detach(session) {
            controller.link_detached();
        }
        info!("link peer {session} closed");
        return Ok(());
    }

    let (frame_type, len) = ws.recv(&mut [])?;
    if len > MAX_WS_DRAIN_BYTES {
        warn!("link peer {session} sent {len} byte frame, closing");
        ws.send(FrameType::Close, &[])?;
        return Ok(());
    }

    let mut buffer = vec![0_u8; len];
    ws.recv(&mut buffer)?;

    match frame_type {
        FrameType::Text(_) | FrameType::Binary(_) => {
            if len > MAX_FRAME_BYTES {
                debug!("oversized link frame ({len} bytes) dropped");
                return Ok(());
            }
            controller.handle_text(&String::from_utf8_lossy(&buffer));
        }
        _ => {}
    }
    Ok(())
}

fn spawn_reconciler(controller: Arc<PooferController>, wifi: SharedWifi) -> anyhow::Result<()> {
    let interval = controller.reconcile_interval();
    let clock = MonotonicClock::new();

    thread::Builder::new()
        .name("reconciler".into())
        .stack_size(8 * 1024)
        .spawn(move || {
            if let Err(err) = add_current_task_to_watchdog() {
                warn!("failed to register reconciler with watchdog: {err:#}");
            }

            let mut last_station_retry_ms = 0_u64;
            loop {
                feed_watchdog();
                controller.reconcile();

                let now_ms = clock.now_ms();
                if now_ms.saturating_sub(last_station_retry_ms) >= STATION_RETRY_MS {
                    last_station_retry_ms = now_ms;
                    keep_station_connected(&wifi);
                }

                thread::sleep(interval);
            }
        })
        .context("failed to spawn reconciler thread")?;
    Ok(())
}

fn keep_station_connected(wifi: &SharedWifi) {
    // Never wait here; the reconciler must not stall behind the wifi driver.
    let Ok(mut wifi) = wifi.try_lock() else {
        return;
    };
    let station_configured = matches!(
        wifi.get_configuration(),
        Ok(Configuration::Mixed(client, _)) if !client.ssid.is_empty()
    );
    if !station_configured || matches!(wifi.is_connected(), Ok(true)) {
        return;
    }
    if let Err(err) = wifi.wifi_mut().connect() {
        debug!("station reconnect attempt failed: {err}");
    }
}

fn read_request_body(req: &mut Request<&mut EspHttpConnection<'_>>) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_WIFI_FORM_BYTES {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_json<T: Serialize>(
    req: Request<&mut EspHttpConnection<'_>>,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(
    req: Request<&mut EspHttpConnection<'_>>,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(&ErrorBody { error: message })?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

impl EspPeerLink {
    fn attach(&self, session: i32, sender: EspHttpWsDetachedSender) {
        let previous = self
            .peer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace((session, sender));
        if let Some((previous, _)) = previous {
            info!("link peer {previous} replaced by {session}");
        }
    }

    fn detach(&self, session: i32) -> bool {
        let mut peer = self.peer.lock().unwrap_or_else(PoisonError::into_inner);
        if peer.as_ref().is_some_and(|(current, _)| *current == session) {
            *peer = None;
            return true;
        }
        false
    }
}

impl LinkSink for EspPeerLink {
    fn send_text(&self, text: &str) -> Result<(), PooferError> {
        let mut peer = self.peer.lock().unwrap_or_else(PoisonError::into_inner);
        match peer.as_mut() {
            Some((_, sender)) => sender
                .send(FrameType::Text(false), text.as_bytes())
                .map_err(|err| PooferError::LinkSend(err.to_string())),
            None => {
                debug!("no link peer attached, status frame dropped");
                Ok(())
            }
        }
    }
}

impl EspTimers {
    fn new(service: &EspTaskTimerService, channel_count: usize) -> anyhow::Result<Self> {
        let clock = Arc::new(MonotonicClock::new());
        let handler = Arc::new(HandlerSlot::default());
        let mut slots = HashMap::new();

        for channel in 0..channel_count.min(MAX_CHANNELS) {
            for kind in TimerKind::ALL {
                let pending: Arc<Mutex<Option<(TimerEvent, u64)>>> = Arc::new(Mutex::new(None));
                let timer = {
                    let pending = pending.clone();
                    let clock = clock.clone();
                    let handler = handler.clone();
                    service.timer(move || {
                        let due = {
                            let mut pending = pending.lock().unwrap_or_else(PoisonError::into_inner);
                            match *pending {
                                Some((_, deadline_ms)) if clock.now_ms() >= deadline_ms => {
                                    pending.take().map(|(event, _)| event)
                                }
                                _ => None,
                            }
                        };
                        if let (Some(event), Some(handler)) = (due, handler.get()) {
                            handler.on_timer(event);
                        }
                    })?
                };
                slots.insert(
                    (channel, kind),
                    TimerSlot {
                        timer: Mutex::new(timer),
                        pending,
                    },
                );
            }
        }

        Ok(Self {
            slots,
            clock,
            handler,
        })
    }
}

impl SafetyTimers for EspTimers {
    fn arm(&self, event: TimerEvent, delay: Duration) -> Result<(), PooferError> {
        let arm_error = |reason: String| PooferError::TimerArm {
            channel: event.channel,
            kind: event.kind,
            reason,
        };
        let slot = self
            .slots
            .get(&(event.channel, event.kind))
            .ok_or_else(|| arm_error("no timer for channel".to_string()))?;

        let deadline_ms = self.clock.now_ms() + delay.as_millis() as u64;
        *slot.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some((event, deadline_ms));

        slot.timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .after(delay)
            .map_err(|err| arm_error(err.to_string()))
    }

    fn cancel(&self, channel: usize, kind: TimerKind) {
        let Some(slot) = self.slots.get(&(channel, kind)) else {
            return;
        };
        *slot.pending.lock().unwrap_or_else(PoisonError::into_inner) = None;
        if let Err(err) = slot
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel()
        {
            debug!("timer cancel for channel {channel} failed: {err}");
        }
    }
}

impl NvsStore {
    fn load_runtime_config(&self) -> Result<RuntimeConfig, PooferError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.read_runtime_config()
    }

    fn read_runtime_config(&self) -> Result<RuntimeConfig, PooferError> {
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)
            .map_err(|err| PooferError::Store(err.to_string()))?;
        let mut buffer = vec![0_u8; 2048];

        match nvs
            .get_str(NVS_RUNTIME_KEY, &mut buffer)
            .map_err(|err| PooferError::Store(err.to_string()))?
        {
            Some(value) => serde_json::from_str::<RuntimeConfig>(value)
                .map_err(|err| PooferError::Store(format!("corrupt runtime config: {err}"))),
            None => Ok(RuntimeConfig::default()),
        }
    }

    fn write_runtime_config(&self, runtime: &RuntimeConfig) -> Result<(), PooferError> {
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)
            .map_err(|err| PooferError::Store(err.to_string()))?;
        let payload =
            serde_json::to_string(runtime).map_err(|err| PooferError::Store(err.to_string()))?;
        nvs.set_str(NVS_RUNTIME_KEY, &payload)
            .map_err(|err| PooferError::Store(err.to_string()))
    }
}

impl CredentialStore for NvsStore {
    fn load_credentials(&self) -> Result<Option<WifiCredentials>, PooferError> {
        Ok(self.load_runtime_config()?.network.station)
    }

    fn save_credentials(&self, credentials: &WifiCredentials) -> Result<(), PooferError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut runtime = self.read_runtime_config()?;
        runtime.network.station = Some(credentials.clone());
        self.write_runtime_config(&runtime)
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
