use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use poofer_common::{
    status_color, ChannelMask, Clock, HandlerSlot, LedSink, LinkSink, PooferController,
    PooferError, Rgb, RuntimeConfig, SafetyTimers, StatusFrame, SystemState, TimerEvent,
    TimerHandler, TimerKind,
};
use pretty_assertions::assert_eq;

#[derive(Default)]
struct ManualClock(AtomicU64);

impl ManualClock {
    fn set(&self, now_ms: u64) {
        self.0.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    seq: u64,
    due_ms: u64,
    event: TimerEvent,
}

struct ManualTimers {
    clock: Arc<ManualClock>,
    pending: Mutex<Vec<Pending>>,
    armed: Mutex<Vec<(TimerEvent, Duration)>>,
    seq: AtomicU64,
    fail_arms: AtomicBool,
    handler: HandlerSlot,
}

impl ManualTimers {
    fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            clock,
            pending: Mutex::new(Vec::new()),
            armed: Mutex::new(Vec::new()),
            seq: AtomicU64::new(0),
            fail_arms: AtomicBool::new(false),
            handler: HandlerSlot::default(),
        }
    }

    fn next_due(&self) -> Option<u64> {
        self.pending
            .lock()
            .unwrap()
            .iter()
            .map(|pending| pending.due_ms)
            .min()
    }

    fn pop_due(&self, due_ms: u64) -> Option<TimerEvent> {
        let mut pending = self.pending.lock().unwrap();
        let index = pending
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.due_ms <= due_ms)
            .min_by_key(|(_, entry)| (entry.due_ms, entry.seq))
            .map(|(index, _)| index)?;
        Some(pending.remove(index).event)
    }

    fn is_pending(&self, channel: usize, kind: TimerKind) -> bool {
        self.pending
            .lock()
            .unwrap()
            .iter()
            .any(|entry| entry.event.channel == channel && entry.event.kind == kind)
    }

    fn armed_count(&self) -> usize {
        self.armed.lock().unwrap().len()
    }
}

impl SafetyTimers for ManualTimers {
    fn arm(&self, event: TimerEvent, delay: Duration) -> Result<(), PooferError> {
        if self.fail_arms.load(Ordering::SeqCst) {
            return Err(PooferError::TimerArm {
                channel: event.channel,
                kind: event.kind,
                reason: "no free timer".to_string(),
            });
        }
        self.cancel(event.channel, event.kind);
        self.armed.lock().unwrap().push((event, delay));
        self.pending.lock().unwrap().push(Pending {
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            due_ms: self.clock.now_ms() + delay.as_millis() as u64,
            event,
        });
        Ok(())
    }

    fn cancel(&self, channel: usize, kind: TimerKind) {
        self.pending
            .lock()
            .unwrap()
            .retain(|entry| !(entry.event.channel == channel && entry.event.kind == kind));
    }
}

#[derive(Default)]
struct RecordingLink {
    frames: Mutex<Vec<StatusFrame>>,
}

impl RecordingLink {
    fn count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    fn last(&self) -> Option<StatusFrame> {
        self.frames.lock().unwrap().last().cloned()
    }
}

impl LinkSink for RecordingLink {
    fn send_text(&self, text: &str) -> Result<(), PooferError> {
        let frame =
            serde_json::from_str(text).map_err(|err| PooferError::LinkSend(err.to_string()))?;
        self.frames.lock().unwrap().push(frame);
        Ok(())
    }
}

struct RecordingLeds {
    staged: Vec<Rgb>,
    flushed: Arc<Mutex<Vec<Vec<Rgb>>>>,
}

impl LedSink for RecordingLeds {
    fn set(&mut self, index: usize, color: Rgb) {
        if self.staged.len() <= index {
            self.staged.resize(index + 1, Rgb::OFF);
        }
        self.staged[index] = color;
    }

    fn flush(&mut self) -> Result<(), PooferError> {
        self.flushed.lock().unwrap().push(self.staged.clone());
        Ok(())
    }
}

struct Harness {
    clock: Arc<ManualClock>,
    timers: Arc<ManualTimers>,
    link: Arc<RecordingLink>,
    leds: Arc<Mutex<Vec<Vec<Rgb>>>>,
    controller: Arc<PooferController>,
    next_tick_ms: u64,
}

impl Harness {
    fn new() -> Self {
        let clock = Arc::new(ManualClock::default());
        let timers = Arc::new(ManualTimers::new(clock.clone()));
        let link = Arc::new(RecordingLink::default());
        let leds = Arc::new(Mutex::new(Vec::new()));

        let controller = Arc::new(PooferController::new(
            &RuntimeConfig::default(),
            timers.clone(),
            link.clone(),
            Box::new(RecordingLeds {
                staged: Vec::new(),
                flushed: leds.clone(),
            }),
            clock.clone(),
        ));
        let handler: Arc<dyn TimerHandler> = controller.clone();
        timers.handler.bind(Arc::downgrade(&handler));

        controller.network_ready();
        let next_tick_ms = controller.reconcile_interval().as_millis() as u64;
        Self {
            clock,
            timers,
            link,
            leds,
            controller,
            next_tick_ms,
        }
    }

    fn send(&self, text: &str) {
        self.controller.handle_text(text);
        self.assert_invariants();
    }

    /// Runs timers and reconciler ticks in time order up to `target_ms`.
    /// A timer due at the same instant as a tick fires first.
    fn advance_to(&mut self, target_ms: u64) {
        loop {
            let timer_due = self.timers.next_due().filter(|due| *due <= target_ms);
            let tick_due = Some(self.next_tick_ms).filter(|tick| *tick <= target_ms);

            match (timer_due, tick_due) {
                (Some(due), tick) if tick.map_or(true, |tick| due <= tick) => {
                    self.clock.set(due);
                    if let Some(event) = self.timers.pop_due(due) {
                        if let Some(handler) = self.timers.handler.get() {
                            handler.on_timer(event);
                        }
                    }
                }
                (_, Some(tick)) => {
                    self.clock.set(tick);
                    self.controller.reconcile();
                    self.next_tick_ms += self.controller.reconcile_interval().as_millis() as u64;
                }
                _ => {
                    self.clock.set(target_ms);
                    self.assert_invariants();
                    return;
                }
            }
            self.assert_invariants();
        }
    }

    /// Heartbeats every `period_ms` from the current time up to `target_ms`.
    fn keep_alive_until(&mut self, target_ms: u64, period_ms: u64) {
        let mut at = self.clock.now_ms() + period_ms;
        while at <= target_ms {
            self.advance_to(at);
            self.send("HEARTBEAT");
            at += period_ms;
        }
        self.advance_to(target_ms);
    }

    fn state(&self) -> SystemState {
        self.controller.inspect(|engine| engine.state()).unwrap()
    }

    fn active_mask(&self) -> ChannelMask {
        self.controller
            .inspect(|engine| engine.active_mask())
            .unwrap()
    }

    fn last_hold_ms(&self) -> u64 {
        self.controller
            .inspect(|engine| engine.last_hold_ms())
            .unwrap()
    }

    fn last_pixels(&self) -> Vec<Rgb> {
        self.leds.lock().unwrap().last().cloned().unwrap_or_default()
    }

    fn assert_invariants(&self) {
        assert!(self
            .controller
            .inspect(|engine| engine.invariants_hold())
            .unwrap());
    }
}

#[test]
fn early_release_holds_until_min_hold() {
    let mut harness = Harness::new();
    harness.send("ACTIVATE:1");
    assert_eq!(harness.state(), SystemState::Firing);

    harness.advance_to(100);
    harness.send("RELEASE");
    assert_eq!(harness.active_mask(), ChannelMask::from_bits(1));

    harness.advance_to(249);
    assert_eq!(harness.active_mask(), ChannelMask::from_bits(1));

    harness.advance_to(250);
    assert!(harness.active_mask().is_empty());
    assert_eq!(harness.state(), SystemState::Ready);
    assert_eq!(harness.last_hold_ms(), 250);

    let frame = harness.link.last().unwrap();
    assert_eq!(frame.firing, vec![false, false, false]);
    assert_eq!(frame.last_hold_ms, 250);
}

#[test]
fn max_hold_closes_all_and_suppresses_reactivation() {
    let mut harness = Harness::new();
    harness.send("ACTIVATE:7");
    assert_eq!(harness.active_mask(), ChannelMask::from_bits(7));

    harness.keep_alive_until(2_999, 500);
    assert_eq!(harness.active_mask(), ChannelMask::from_bits(7));

    harness.advance_to(3_000);
    assert!(harness.active_mask().is_empty());
    assert_eq!(harness.state(), SystemState::Ready);
    assert_eq!(harness.last_hold_ms(), 3_000);
    assert!(harness
        .controller
        .inspect(|engine| engine
            .channels()
            .iter()
            .all(|channel| channel.ignore_until_release))
        .unwrap());

    let frames_before = harness.link.count();
    let armed_before = harness.timers.armed_count();
    harness.advance_to(3_100);
    harness.send("ACTIVATE:7");

    assert!(harness.active_mask().is_empty());
    assert_eq!(harness.state(), SystemState::Ready);
    assert_eq!(harness.link.count(), frames_before);
    assert_eq!(harness.timers.armed_count(), armed_before);

    harness.send("RELEASE");
    harness.send("ACTIVATE:7");
    assert_eq!(harness.active_mask(), ChannelMask::from_bits(7));
}

#[test]
fn link_silence_closes_channels_and_disconnects() {
    let mut harness = Harness::new();
    harness.send("ACTIVATE:1");

    harness.advance_to(2_000);
    assert_eq!(harness.active_mask(), ChannelMask::from_bits(1));
    assert_eq!(harness.state(), SystemState::Firing);

    harness.advance_to(2_200);
    assert!(harness.active_mask().is_empty());
    assert_eq!(harness.state(), SystemState::Disconnected);
    for kind in TimerKind::ALL {
        assert!(!harness.timers.is_pending(0, kind));
    }

    let frame = harness.link.last().unwrap();
    assert!(!frame.connected);
    assert!(!frame.ready);
    assert_eq!(frame.firing, vec![false, false, false]);
    assert_eq!(harness.last_pixels()[0], status_color(SystemState::Disconnected));

    harness.send("PING");
    assert_eq!(harness.state(), SystemState::Ready);
    assert!(harness.link.last().unwrap().connected);
}

#[test]
fn every_mask_closes_within_max_hold_without_release() {
    for bits in 1..=7 {
        let mut harness = Harness::new();
        harness.send(&format!("ACTIVATE:{bits}"));
        assert_eq!(harness.active_mask(), ChannelMask::from_bits(bits));

        harness.keep_alive_until(3_000, 400);
        assert!(harness.active_mask().is_empty(), "mask {bits}");
    }
}

#[test]
fn reconciler_enforces_max_hold_when_timers_fail() {
    let mut harness = Harness::new();
    harness.timers.fail_arms.store(true, Ordering::SeqCst);

    harness.send("ACTIVATE");
    assert_eq!(harness.active_mask(), ChannelMask::from_bits(7));
    assert_eq!(harness.timers.next_due(), None);

    harness.keep_alive_until(2_800, 400);
    assert_eq!(harness.active_mask(), ChannelMask::from_bits(7));

    harness.advance_to(3_000);
    assert!(harness.active_mask().is_empty());
    assert_eq!(harness.state(), SystemState::Ready);
}

#[test]
fn release_when_idle_changes_nothing() {
    let mut harness = Harness::new();
    harness.send("HEARTBEAT");
    harness.advance_to(500);

    let frames = harness.link.count();
    let pixels = harness.leds.lock().unwrap().len();
    harness.send("RELEASE");
    harness.send("RELEASE");

    assert_eq!(harness.link.count(), frames);
    assert_eq!(harness.timers.armed_count(), 0);
    assert_eq!(harness.leds.lock().unwrap().len(), pixels);
    assert_eq!(harness.state(), SystemState::Ready);
}

#[test]
fn unknown_text_still_counts_as_link_traffic() {
    let mut harness = Harness::new();
    harness.send("HELLO");
    assert_eq!(harness.state(), SystemState::Ready);

    harness.advance_to(1_900);
    harness.send("garbage");
    harness.advance_to(3_000);
    assert_eq!(harness.state(), SystemState::Ready);
    assert_eq!(harness.timers.armed_count(), 0);
}

#[test]
fn pixels_follow_state_and_channel_levels() {
    let mut harness = Harness::new();
    assert_eq!(harness.last_pixels()[0], status_color(SystemState::Disconnected));

    harness.send("ACTIVATE:5");
    assert_eq!(
        harness.last_pixels(),
        vec![
            status_color(SystemState::Firing),
            Rgb::new(255, 0, 255),
            Rgb::new(255, 0, 255),
        ]
    );

    harness.advance_to(400);
    harness.send("RELEASE");
    assert_eq!(
        harness.last_pixels(),
        vec![status_color(SystemState::Ready), Rgb::OFF, Rgb::OFF]
    );
}

#[test]
fn attach_sends_status_and_detach_keeps_channels_open() {
    let mut harness = Harness::new();
    harness.controller.link_attached();
    let frame = harness.link.last().unwrap();
    assert!(frame.connected);
    assert!(frame.ready);

    harness.send("ACTIVATE:2");
    harness.controller.link_detached();
    assert_eq!(harness.active_mask(), ChannelMask::from_bits(2));
    assert!(!harness.controller.status_frame().unwrap().connected);

    harness.advance_to(2_200);
    assert!(harness.active_mask().is_empty());
    assert_eq!(harness.state(), SystemState::Disconnected);
}

#[test]
fn concurrent_contexts_keep_state_consistent() {
    let harness = Harness::new();
    let controller = harness.controller.clone();
    let timers = harness.timers.clone();
    let clock = harness.clock.clone();

    let commands = ["ACTIVATE", "ACTIVATE:1", "ACTIVATE:6", "RELEASE", "HEARTBEAT"];
    let mut workers = Vec::new();

    for worker in 0..3 {
        let controller = controller.clone();
        workers.push(thread::spawn(move || {
            for step in 0..300 {
                controller.handle_text(commands[(worker + step) % commands.len()]);
            }
        }));
    }

    {
        let controller = controller.clone();
        workers.push(thread::spawn(move || {
            for _ in 0..300 {
                controller.reconcile();
            }
        }));
    }

    workers.push(thread::spawn(move || {
        for step in 0..300_u64 {
            clock.set(step * 10);
            if let Some(event) = timers.pop_due(u64::MAX) {
                controller.on_timer(event);
            }
        }
    }));

    for worker in workers {
        worker.join().unwrap();
    }

    harness.assert_invariants();
    harness.controller.handle_text("RELEASE");
    harness.assert_invariants();
}

#[test]
fn reconciler_closes_released_channel_when_min_hold_callback_is_skipped() {
    let mut harness = Harness::new();
    harness.send("ACTIVATE:1");
    harness.advance_to(100);
    harness.send("RELEASE");
    assert!(harness.timers.is_pending(0, TimerKind::MinHold));

    // The expiry fires while another context holds the lock and gives up.
    harness.timers.cancel(0, TimerKind::MinHold);

    harness.advance_to(399);
    assert_eq!(harness.active_mask(), ChannelMask::from_bits(1));

    harness.advance_to(400);
    assert!(harness.active_mask().is_empty());
    assert_eq!(harness.state(), SystemState::Ready);
    assert_eq!(harness.last_hold_ms(), 250);
    assert!(!harness.timers.is_pending(0, TimerKind::MaxHold));
    assert!(!harness.link.last().unwrap().firing[0]);

    harness.send("ACTIVATE:1");
    assert_eq!(harness.active_mask(), ChannelMask::from_bits(1));
}

#[test]
fn every_timer_callback_sends_status() {
    let mut harness = Harness::new();
    harness.send("ACTIVATE:1");
    let frames = harness.link.count();

    harness.advance_to(50);
    assert_eq!(harness.link.count(), frames + 1);
    assert_eq!(harness.active_mask(), ChannelMask::from_bits(1));

    let generation = harness
        .controller
        .inspect(|engine| engine.channels()[0].generation)
        .unwrap();
    harness.controller.on_timer(TimerEvent {
        channel: 0,
        kind: TimerKind::MaxHold,
        generation: generation.wrapping_sub(1),
    });
    assert_eq!(harness.link.count(), frames + 2);
    assert_eq!(harness.active_mask(), ChannelMask::from_bits(1));
}
