use std::{
    collections::HashMap,
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use anyhow::Context;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::{
    net::TcpListener,
    runtime::Handle,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

use poofer_common::{
    config::MAX_WIFI_FORM_BYTES, CredentialStore, HandlerSlot, LedSink, LinkSink, MonotonicClock,
    PooferController, PooferError, Rgb, RuntimeConfig, SafetyTimers, TimerEvent, TimerHandler,
    TimerKind, WifiCredentials, MAX_FRAME_BYTES,
};

const INDEX_HTML: &str = include_str!("../web/index.html");
const WIFI_HTML: &str = include_str!("../web/wifi.html");
const WIFI_SAVED_HTML: &str = include_str!("../web/wifi_saved.html");

#[derive(Clone)]
struct AppState {
    controller: Arc<PooferController>,
    link: Arc<PeerLink>,
    store: AppStore,
}

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Single-peer outbound link. Attaching a new peer replaces the old one.
#[derive(Default)]
struct PeerLink {
    peer: Mutex<Option<(u64, UnboundedSender<String>)>>,
    next_id: AtomicU64,
}

/// Safety timers as aborted-on-cancel tokio tasks.
struct TokioTimers {
    runtime: Handle,
    tasks: Mutex<HashMap<(usize, TimerKind), JoinHandle<()>>>,
    handler: HandlerSlot,
}

/// Host builds have no strip; frames go to the debug log.
#[derive(Default)]
struct LogLeds {
    pixels: Vec<Rgb>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err}");
        RuntimeConfig::default()
    });
    runtime.sanitize();

    let timers = Arc::new(TokioTimers::new(Handle::current()));
    let link = Arc::new(PeerLink::default());
    let controller = Arc::new(PooferController::new(
        &runtime,
        timers.clone(),
        link.clone(),
        Box::new(LogLeds::default()),
        Arc::new(MonotonicClock::new()),
    ));
    let handler: Arc<dyn TimerHandler> = controller.clone();
    timers.handler.bind(Arc::downgrade(&handler));

    let app_state = AppState {
        controller: controller.clone(),
        link,
        store,
    };

    spawn_reconciler(controller.clone());

    let web_root = format!("{}/web", env!("CARGO_MANIFEST_DIR"));
    let app = Router::new()
        .route("/", get(handle_get_index))
        .route("/ws", get(handle_ws))
        .route("/wifi", get(handle_get_wifi).post(handle_post_wifi))
        .route("/api/status", get(handle_get_status))
        .fallback_service(ServeDir::new(web_root))
        .with_state(app_state);

    let port = std::env::var("POOFER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind poofer server at {addr}"))?;

    controller.network_ready();
    info!("poofer listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn spawn_reconciler(controller: Arc<PooferController>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(controller.reconcile_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            call_controller(&controller, PooferController::reconcile).await;
        }
    });
}

/// Runs a controller call off the async workers; the state lock may be held
/// for up to the bounded wait.
async fn call_controller<F>(controller: &Arc<PooferController>, op: F)
where
    F: FnOnce(&PooferController) + Send + 'static,
{
    let controller = controller.clone();
    if let Err(err) = tokio::task::spawn_blocking(move || op(&controller)).await {
        warn!("controller task failed: {err}");
    }
}

async fn handle_get_index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn handle_get_wifi() -> Html<&'static str> {
    Html(WIFI_HTML)
}

async fn handle_post_wifi(State(state): State<AppState>, body: String) -> axum::response::Response {
    if body.is_empty() || body.len() > MAX_WIFI_FORM_BYTES {
        return error_response(StatusCode::BAD_REQUEST, "Invalid content");
    }
    let Some(credentials) = WifiCredentials::from_form(&body) else {
        return error_response(StatusCode::BAD_REQUEST, "SSID required");
    };

    let store = state.store.clone();
    let ssid = credentials.ssid.clone();
    match tokio::task::spawn_blocking(move || store.save_credentials(&credentials)).await {
        Ok(Ok(())) => {
            info!(ssid = %ssid, "station credentials saved; host build has no radio to reconnect");
            Html(WIFI_SAVED_HTML).into_response()
        }
        Ok(Err(err)) => {
            warn!("failed to persist station credentials: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to persist credentials")
        }
        Err(err) => {
            warn!("credential store task failed: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to persist credentials")
        }
    }
}

async fn handle_get_status(State(state): State<AppState>) -> axum::response::Response {
    let controller = state.controller.clone();
    match tokio::task::spawn_blocking(move || controller.status_frame()).await {
        Ok(Some(frame)) => Json(frame).into_response(),
        Ok(None) => error_response(StatusCode::SERVICE_UNAVAILABLE, "State busy, retry"),
        Err(err) => {
            warn!("status task failed: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Status unavailable")
        }
    }
}

async fn handle_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_peer(state, socket))
}

async fn run_peer(state: AppState, mut socket: WebSocket) {
    let (peer_id, mut outbound) = state.link.attach();
    info!(peer_id, "link peer attached");
    call_controller(&state.controller, PooferController::link_attached).await;

    loop {
        tokio::select! {
            inbound = socket.recv() => {
                let text = match inbound {
                    Some(Ok(Message::Text(text))) => text.to_string(),
                    Some(Ok(Message::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        debug!(peer_id, "link receive failed: {err}");
                        break;
                    }
                };
                if text.len() > MAX_FRAME_BYTES {
                    debug!(peer_id, len = text.len(), "oversized link frame dropped");
                    continue;
                }
                call_controller(&state.controller, move |controller| controller.handle_text(&text)).await;
            }
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    // Replaced by a newer peer.
                    break;
                };
                if let Err(err) = socket.send(Message::Text(frame.into())).await {
                    debug!(peer_id, "link send failed: {err}");
                    break;
                }
            }
        }
    }

    if state.link.detach(peer_id) {
        call_controller(&state.controller, PooferController::link_detached).await;
    }
    info!(peer_id, "link peer closed");
}

impl PeerLink {
    fn attach(&self) -> (u64, UnboundedReceiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let previous = self
            .peer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace((id, tx));
        if let Some((previous_id, _)) = previous {
            info!(previous_id, "link peer replaced");
        }
        (id, rx)
    }

    /// Returns `false` when `id` was already replaced by a newer peer.
    fn detach(&self, id: u64) -> bool {
        let mut peer = self.peer.lock().unwrap_or_else(PoisonError::into_inner);
        if peer.as_ref().is_some_and(|(current, _)| *current == id) {
            *peer = None;
            return true;
        }
        false
    }
}

impl LinkSink for PeerLink {
    fn send_text(&self, text: &str) -> Result<(), PooferError> {
        let peer = self.peer.lock().unwrap_or_else(PoisonError::into_inner);
        match peer.as_ref() {
            Some((_, tx)) => tx
                .send(text.to_string())
                .map_err(|err| PooferError::LinkSend(err.to_string())),
            None => {
                debug!("no link peer attached, status frame dropped");
                Ok(())
            }
        }
    }
}

impl TokioTimers {
    fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            tasks: Mutex::new(HashMap::new()),
            handler: HandlerSlot::default(),
        }
    }
}

impl SafetyTimers for TokioTimers {
    fn arm(&self, event: TimerEvent, delay: Duration) -> Result<(), PooferError> {
        let Some(handler) = self.handler.get() else {
            return Err(PooferError::TimerArm {
                channel: event.channel,
                kind: event.kind,
                reason: "no timer handler bound".to_string(),
            });
        };

        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            // Detached so cancelling this key from inside the callback does
            // not abort the callback itself.
            drop(tokio::task::spawn_blocking(move || handler.on_timer(event)));
        });

        let previous = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((event.channel, event.kind), task);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(())
    }

    fn cancel(&self, channel: usize, kind: TimerKind) {
        let task = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(channel, kind));
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl LedSink for LogLeds {
    fn set(&mut self, index: usize, color: Rgb) {
        if self.pixels.len() <= index {
            self.pixels.resize(index + 1, Rgb::OFF);
        }
        self.pixels[index] = color;
    }

    fn flush(&mut self) -> Result<(), PooferError> {
        debug!(pixels = ?self.pixels, "led frame");
        Ok(())
    }
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("POOFER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.poofer"));

        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    fn load_runtime_config(&self) -> Result<RuntimeConfig, PooferError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.read_runtime_config()
    }

    fn read_runtime_config(&self) -> Result<RuntimeConfig, PooferError> {
        match std::fs::read(self.runtime_path.as_ref()) {
            Ok(raw) => serde_json::from_slice::<RuntimeConfig>(&raw)
                .map_err(|err| PooferError::Store(format!("corrupt runtime config: {err}"))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(PooferError::Store(err.to_string())),
        }
    }

    fn write_runtime_config(&self, runtime: &RuntimeConfig) -> Result<(), PooferError> {
        let path = self.runtime_path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| PooferError::Store(err.to_string()))?;
        }
        let payload = serde_json::to_vec_pretty(runtime)
            .map_err(|err| PooferError::Store(err.to_string()))?;
        std::fs::write(path, payload).map_err(|err| PooferError::Store(err.to_string()))
    }
}

impl CredentialStore for AppStore {
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

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}
