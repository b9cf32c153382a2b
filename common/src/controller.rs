use std::{
    sync::{Arc, OnceLock, Weak},
    time::{Duration, Instant},
};

use tracing::{debug, info, warn};

use crate::{
    config::{LedConfig, RuntimeConfig, WifiCredentials},
    engine::{EngineAction, PooferEngine, TimerEvent, TimerKind},
    error::PooferError,
    lock::StateLock,
    protocol::{parse_command, Command, MAX_FRAME_BYTES},
    status::PixelFrame,
    types::{Rgb, StatusFrame, SystemState},
};

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// One-shot, cancelable timers keyed by `(channel, kind)`.
///
/// Arming a key that is already pending replaces it. Expiries are delivered
/// to the bound [`TimerHandler`] from the driver's own context, never from
/// inside `arm`.
pub trait SafetyTimers: Send + Sync {
    fn arm(&self, event: TimerEvent, delay: Duration) -> Result<(), PooferError>;
    fn cancel(&self, channel: usize, kind: TimerKind);
}

pub trait TimerHandler: Send + Sync {
    fn on_timer(&self, event: TimerEvent);
}

/// Outbound half of the link. With no peer attached, frames are dropped and
/// `Ok` is returned.
pub trait LinkSink: Send + Sync {
    fn send_text(&self, text: &str) -> Result<(), PooferError>;
}

pub trait LedSink: Send {
    fn set(&mut self, index: usize, color: Rgb);
    fn flush(&mut self) -> Result<(), PooferError>;
}

pub trait CredentialStore: Send + Sync {
    fn load_credentials(&self) -> Result<Option<WifiCredentials>, PooferError>;
    fn save_credentials(&self, credentials: &WifiCredentials) -> Result<(), PooferError>;
}

/// Late-bound back reference from a timer driver to the controller that owns
/// it.
#[derive(Default)]
pub struct HandlerSlot {
    handler: OnceLock<Weak<dyn TimerHandler>>,
}

impl HandlerSlot {
    pub fn bind(&self, handler: Weak<dyn TimerHandler>) {
        if self.handler.set(handler).is_err() {
            warn!("timer handler already bound");
        }
    }

    pub fn get(&self) -> Option<Arc<dyn TimerHandler>> {
        self.handler.get().and_then(Weak::upgrade)
    }
}

struct Shared {
    engine: PooferEngine,
    leds: Box<dyn LedSink>,
    shown: Option<PixelFrame>,
}

impl Shared {
    fn refresh_pixels(&mut self, led: &LedConfig) -> Result<(), PooferError> {
        let frame = self.engine.pixels(led);
        if self.shown.as_ref() == Some(&frame) {
            return Ok(());
        }
        for (index, color) in frame.pixels.iter().enumerate() {
            self.leds.set(index, *color);
        }
        self.leds.flush()?;
        self.shown = Some(frame);
        Ok(())
    }
}

/// Every context (link handler, timer callbacks, reconciler) funnels through
/// here. Each call takes the state lock with a bounded wait and is skipped
/// when the wait runs out.
pub struct PooferController {
    shared: StateLock<Shared>,
    led_config: LedConfig,
    lock_timeout: Duration,
    reconcile_interval: Duration,
    timers: Arc<dyn SafetyTimers>,
    link: Arc<dyn LinkSink>,
    clock: Arc<dyn Clock>,
}

struct Outcome {
    before: SystemState,
    after: SystemState,
    frame: Option<StatusFrame>,
    failures: Vec<PooferError>,
}

impl PooferController {
    pub fn new(
        config: &RuntimeConfig,
        timers: Arc<dyn SafetyTimers>,
        link: Arc<dyn LinkSink>,
        leds: Box<dyn LedSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut config = config.clone();
        config.sanitize();

        let mut shared = Shared {
            engine: PooferEngine::new(config.safety.clone(), usize::from(config.channel_count)),
            leds,
            shown: None,
        };
        if let Err(err) = shared.refresh_pixels(&config.led) {
            warn!(error = %err, "initial led write failed");
        }

        Self {
            lock_timeout: Duration::from_millis(config.safety.lock_timeout_ms),
            reconcile_interval: Duration::from_millis(config.safety.reconcile_interval_ms),
            shared: StateLock::new(shared),
            led_config: config.led,
            timers,
            link,
            clock,
        }
    }

    pub fn reconcile_interval(&self) -> Duration {
        self.reconcile_interval
    }

    /// No peer can be attached before the network is up, so nothing is sent.
    pub fn network_ready(&self) {
        self.locked("network_ready", |engine, _| (engine.network_ready(), Vec::new()));
    }

    /// A new peer counts as inbound traffic and gets an immediate status frame.
    pub fn link_attached(&self) {
        self.run("link_attached", |engine, now_ms| {
            engine.link_rx(now_ms);
            (true, Vec::new())
        });
    }

    pub fn link_detached(&self) {
        let outcome = self.locked("link_detached", |engine, _| {
            engine.link_detached();
            (false, Vec::new())
        });
        if outcome.is_some() {
            info!("link peer detached");
        }
    }

    pub fn handle_text(&self, raw: &str) {
        if raw.len() > MAX_FRAME_BYTES {
            debug!(len = raw.len(), "oversized link frame dropped");
            return;
        }

        let command = parse_command(raw);
        if command.is_none() {
            debug!(frame = raw, "unrecognized link frame");
        }

        self.run("command", |engine, now_ms| {
            let mut changed = engine.link_rx(now_ms);
            let actions = match command {
                Some(Command::Activate(mask)) => {
                    let (activated, actions) = engine.activate(mask, now_ms);
                    changed |= activated;
                    actions
                }
                Some(Command::Release) => {
                    let (released, actions) = engine.release(now_ms);
                    changed |= released;
                    actions
                }
                Some(Command::Heartbeat) => {
                    changed = true;
                    Vec::new()
                }
                None => Vec::new(),
            };
            (changed, actions)
        });
    }

    /// One reconciler pass. Also retries an LED write that failed earlier.
    pub fn reconcile(&self) {
        self.run("reconcile", |engine, now_ms| engine.reconcile(now_ms));
    }

    pub fn status_frame(&self) -> Option<StatusFrame> {
        let shared = self.shared.try_lock_for(self.lock_timeout)?;
        Some(shared.engine.status_frame(self.clock.now_ms()))
    }

    pub fn inspect<R>(&self, read: impl FnOnce(&PooferEngine) -> R) -> Option<R> {
        let shared = self.shared.try_lock_for(self.lock_timeout)?;
        Some(read(&shared.engine))
    }

    fn run<F>(&self, context: &'static str, op: F)
    where
        F: FnOnce(&mut PooferEngine, u64) -> (bool, Vec<EngineAction>),
    {
        if let Some(frame) = self.locked(context, op) {
            self.publish(frame);
        }
    }

    /// Applies `op` under the lock and returns the status frame to publish,
    /// if any. Logging happens after the lock is released.
    fn locked<F>(&self, context: &'static str, op: F) -> Option<StatusFrame>
    where
        F: FnOnce(&mut PooferEngine, u64) -> (bool, Vec<EngineAction>),
    {
        let Some(mut guard) = self.shared.try_lock_for(self.lock_timeout) else {
            debug!(context, "state lock busy, update skipped");
            return None;
        };

        let shared = &mut *guard;
        let now_ms = self.clock.now_ms();
        let before = shared.engine.state();
        let (changed, actions) = op(&mut shared.engine, now_ms);

        let mut failures = self.apply(actions);
        if let Err(err) = shared.refresh_pixels(&self.led_config) {
            failures.push(err);
        }

        let outcome = Outcome {
            before,
            after: shared.engine.state(),
            frame: changed.then(|| shared.engine.status_frame(now_ms)),
            failures,
        };
        drop(guard);

        if outcome.before != outcome.after {
            info!(
                context,
                from = outcome.before.as_str(),
                to = outcome.after.as_str(),
                "state changed"
            );
        }
        for failure in &outcome.failures {
            warn!(context, error = %failure, "collaborator failure");
        }
        outcome.frame
    }

    fn apply(&self, actions: Vec<EngineAction>) -> Vec<PooferError> {
        let mut failures = Vec::new();
        for action in actions {
            match action {
                EngineAction::ArmTimer { event, delay_ms } => {
                    if let Err(err) = self.timers.arm(event, Duration::from_millis(delay_ms)) {
                        failures.push(err);
                    }
                }
                EngineAction::CancelTimer { channel, kind } => self.timers.cancel(channel, kind),
            }
        }
        failures
    }

    fn publish(&self, frame: StatusFrame) {
        let text = match frame.to_json() {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "status frame serialization failed");
                return;
            }
        };
        if let Err(err) = self.link.send_text(&text) {
            warn!(error = %err, "status frame send failed");
        }
    }
}

impl TimerHandler for PooferController {
    fn on_timer(&self, event: TimerEvent) {
        debug!(
            channel = event.channel,
            kind = event.kind.as_str(),
            "safety timer expired"
        );
        self.run("timer", |engine, _| {
            let (_, actions) = engine.on_timer(event);
            (true, actions)
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct NoTimers;

    impl SafetyTimers for NoTimers {
        fn arm(&self, _event: TimerEvent, _delay: Duration) -> Result<(), PooferError> {
            Ok(())
        }

        fn cancel(&self, _channel: usize, _kind: TimerKind) {}
    }

    #[derive(Default)]
    struct Outbox(Mutex<Vec<String>>);

    impl LinkSink for Outbox {
        fn send_text(&self, text: &str) -> Result<(), PooferError> {
            self.0.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    struct FailingLeds {
        writes: Arc<Mutex<u32>>,
    }

    impl LedSink for FailingLeds {
        fn set(&mut self, _index: usize, _color: Rgb) {}

        fn flush(&mut self) -> Result<(), PooferError> {
            *self.writes.lock().unwrap() += 1;
            Err(PooferError::LedWrite("rmt busy".to_string()))
        }
    }

    struct NullLeds;

    impl LedSink for NullLeds {
        fn set(&mut self, _index: usize, _color: Rgb) {}

        fn flush(&mut self) -> Result<(), PooferError> {
            Ok(())
        }
    }

    fn controller(leds: Box<dyn LedSink>) -> (PooferController, Arc<Outbox>) {
        let outbox = Arc::new(Outbox::default());
        let controller = PooferController::new(
            &RuntimeConfig::default(),
            Arc::new(NoTimers),
            outbox.clone(),
            leds,
            Arc::new(MonotonicClock::new()),
        );
        (controller, outbox)
    }

    #[test]
    fn busy_lock_skips_the_update() {
        let (controller, outbox) = controller(Box::new(NullLeds));
        controller.network_ready();

        {
            let _held = controller.shared.try_lock_for(Duration::from_millis(5)).unwrap();
            let started = Instant::now();
            controller.handle_text("ACTIVATE");
            assert!(started.elapsed() >= Duration::from_millis(50));
        }

        assert_eq!(
            controller.inspect(|engine| engine.state()),
            Some(SystemState::Disconnected)
        );
        assert!(outbox.0.lock().unwrap().is_empty());
    }

    #[test]
    fn oversized_frame_never_touches_state() {
        let (controller, outbox) = controller(Box::new(NullLeds));
        controller.network_ready();

        controller.handle_text(&"P".repeat(MAX_FRAME_BYTES + 1));

        assert_eq!(controller.inspect(|engine| engine.last_link_rx_ms()), Some(None));
        assert!(outbox.0.lock().unwrap().is_empty());
    }

    #[test]
    fn failed_led_write_is_retried() {
        let writes = Arc::new(Mutex::new(0));
        let (controller, _) = controller(Box::new(FailingLeds {
            writes: writes.clone(),
        }));
        assert_eq!(*writes.lock().unwrap(), 1);

        controller.reconcile();
        controller.reconcile();
        assert_eq!(*writes.lock().unwrap(), 3);
    }

    #[test]
    fn heartbeat_replies_with_status() {
        let (controller, outbox) = controller(Box::new(NullLeds));
        controller.network_ready();

        controller.handle_text("HEARTBEAT");

        let sent = outbox.0.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let frame: StatusFrame = serde_json::from_str(&sent[0]).unwrap();
        assert!(frame.ready);
        assert!(frame.connected);
    }
}
