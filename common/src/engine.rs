use crate::{
    config::{LedConfig, SafetyConfig},
    status::{status_color, PixelFrame},
    types::{Channel, ChannelMask, Rgb, StatusFrame, SystemState, MAX_CHANNELS},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    MaxHold,
    MinHold,
    Kick,
}

impl TimerKind {
    pub const ALL: [TimerKind; 3] = [Self::MaxHold, Self::MinHold, Self::Kick];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MaxHold => "max_hold",
            Self::MinHold => "min_hold",
            Self::Kick => "kick",
        }
    }
}

/// A one-shot timer expiry. `generation` ties it to the activation that armed
/// it so a late expiry from an earlier activation is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerEvent {
    pub channel: usize,
    pub kind: TimerKind,
    pub generation: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineAction {
    ArmTimer { event: TimerEvent, delay_ms: u64 },
    CancelTimer { channel: usize, kind: TimerKind },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    MinHoldElapsed,
    MaxHold,
    LinkLost,
}

#[derive(Debug, Clone)]
pub struct PooferEngine {
    pub config: SafetyConfig,

    state: SystemState,
    channels: Vec<Channel>,
    active_mask: ChannelMask,

    // Set by the first activation of an episode only. Per-channel start times
    // live on `Channel::activated_at_ms` and drive the hold bounds.
    activation_started_at_ms: Option<u64>,
    last_hold_ms: u64,

    last_link_rx_ms: Option<u64>,
    link_connected: bool,

    status_color: Rgb,
}

impl PooferEngine {
    pub fn new(mut config: SafetyConfig, channel_count: usize) -> Self {
        config.sanitize();
        let channel_count = channel_count.clamp(1, MAX_CHANNELS);
        Self {
            last_hold_ms: config.min_hold_ms,
            config,
            state: SystemState::Boot,
            channels: vec![Channel::default(); channel_count],
            active_mask: ChannelMask::EMPTY,
            activation_started_at_ms: None,
            last_link_rx_ms: None,
            link_connected: false,
            status_color: status_color(SystemState::Boot),
        }
    }

    pub fn state(&self) -> SystemState {
        self.state
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn active_mask(&self) -> ChannelMask {
        self.active_mask
    }

    pub fn last_hold_ms(&self) -> u64 {
        self.last_hold_ms
    }

    pub fn status_color(&self) -> Rgb {
        self.status_color
    }

    pub fn is_link_connected(&self) -> bool {
        self.link_connected
    }

    pub fn last_link_rx_ms(&self) -> Option<u64> {
        self.last_link_rx_ms
    }

    /// `active_mask` mirrors the channel flags and every idle channel is fully
    /// closed.
    pub fn invariants_hold(&self) -> bool {
        let mut union = ChannelMask::EMPTY;
        for (index, channel) in self.channels.iter().enumerate() {
            if channel.active {
                union.insert(index);
            } else if channel.level != 0 || channel.release_pending {
                return false;
            }
        }
        union == self.active_mask
    }

    pub fn elapsed_ms(&self, now_ms: u64) -> u64 {
        if self.active_mask.is_empty() {
            return 0;
        }
        self.activation_started_at_ms
            .map(|start| now_ms.saturating_sub(start))
            .unwrap_or(0)
    }

    pub fn status_frame(&self, now_ms: u64) -> StatusFrame {
        StatusFrame {
            ready: matches!(self.state, SystemState::Ready | SystemState::Firing),
            firing: self.channels.iter().map(|channel| channel.active).collect(),
            error: self.state == SystemState::Error,
            connected: self.link_connected,
            elapsed_ms: self.elapsed_ms(now_ms),
            last_hold_ms: self.last_hold_ms,
        }
    }

    pub fn pixels(&self, led: &LedConfig) -> PixelFrame {
        PixelFrame::compose(led, self.status_color, &self.channels)
    }

    /// `Boot -> Disconnected` once the network is up.
    pub fn network_ready(&mut self) -> bool {
        if self.state != SystemState::Boot {
            return false;
        }
        self.set_state(SystemState::Disconnected);
        true
    }

    /// Any inbound frame, recognised or not, proves the link is alive.
    pub fn link_rx(&mut self, now_ms: u64) -> bool {
        self.last_link_rx_ms = Some(now_ms);
        self.link_connected = true;
        if self.state == SystemState::Disconnected {
            self.set_state(SystemState::Ready);
            return true;
        }
        false
    }

    pub fn link_detached(&mut self) -> bool {
        std::mem::replace(&mut self.link_connected, false)
    }

    /// Opens every requested channel that is neither already open nor
    /// suppressed after a max-hold closure. `None` requests all channels.
    pub fn activate(
        &mut self,
        requested: Option<ChannelMask>,
        now_ms: u64,
    ) -> (bool, Vec<EngineAction>) {
        let mut actions = Vec::new();
        if self.state == SystemState::Error {
            return (false, actions);
        }

        let requested = requested
            .unwrap_or_else(|| ChannelMask::all(self.channels.len()))
            .limit_to(self.channels.len());

        let mut effective = ChannelMask::EMPTY;
        for channel in requested.channels() {
            let state = &self.channels[channel];
            if !state.active && !state.ignore_until_release {
                effective.insert(channel);
            }
        }

        if effective.is_empty() {
            return (false, actions);
        }

        if self.active_mask.is_empty() {
            self.activation_started_at_ms = Some(now_ms);
        }

        for channel in effective.channels() {
            let state = &mut self.channels[channel];
            state.active = true;
            state.release_pending = false;
            state.level = self.config.kick_level;
            state.activated_at_ms = Some(now_ms);
            state.generation = state.generation.wrapping_add(1);
            let generation = state.generation;

            actions.push(EngineAction::CancelTimer {
                channel,
                kind: TimerKind::MinHold,
            });
            actions.push(EngineAction::ArmTimer {
                event: TimerEvent {
                    channel,
                    kind: TimerKind::MaxHold,
                    generation,
                },
                delay_ms: self.config.max_hold_ms,
            });
            actions.push(EngineAction::ArmTimer {
                event: TimerEvent {
                    channel,
                    kind: TimerKind::Kick,
                    generation,
                },
                delay_ms: self.config.kick_delay_ms,
            });
        }

        self.recompute_mask();
        self.set_state(SystemState::Firing);
        (true, actions)
    }

    /// Release-all. Channels that have not yet reached the minimum hold stay
    /// open with `release_pending` and a min-hold timer for the remainder.
    pub fn release(&mut self, now_ms: u64) -> (bool, Vec<EngineAction>) {
        let mut actions = Vec::new();

        for channel in &mut self.channels {
            channel.ignore_until_release = false;
        }

        if self.active_mask.is_empty() {
            return (false, actions);
        }

        let episode_held_ms = self.elapsed_ms(now_ms);
        self.last_hold_ms = self.config.clamp_hold_ms(episode_held_ms);

        for channel in self.active_mask.channels() {
            let held_ms = self.channels[channel]
                .activated_at_ms
                .map_or(episode_held_ms, |start| now_ms.saturating_sub(start));

            if held_ms < self.config.min_hold_ms {
                let state = &mut self.channels[channel];
                state.release_pending = true;
                actions.push(EngineAction::ArmTimer {
                    event: TimerEvent {
                        channel,
                        kind: TimerKind::MinHold,
                        generation: state.generation,
                    },
                    delay_ms: self.config.min_hold_ms - held_ms,
                });
            } else {
                cancel_hold_timers(channel, &mut actions);
                self.close_channel(channel, &mut actions);
            }
        }

        self.settle(SystemState::Ready);
        (true, actions)
    }

    /// Closes one channel outside the normal release path.
    pub fn force_close(&mut self, channel: usize, reason: CloseReason) -> Vec<EngineAction> {
        let mut actions = Vec::new();
        let Some(state) = self.channels.get_mut(channel) else {
            return actions;
        };
        if !state.active {
            return actions;
        }

        if reason == CloseReason::MaxHold {
            state.ignore_until_release = true;
            self.last_hold_ms = self.config.max_hold_ms;
        }

        cancel_hold_timers(channel, &mut actions);
        self.close_channel(channel, &mut actions);

        let next = if reason == CloseReason::LinkLost {
            SystemState::Disconnected
        } else {
            SystemState::Ready
        };
        self.settle(next);
        actions
    }

    /// Applies a timer expiry. Returns whether the change warrants a status
    /// frame.
    pub fn on_timer(&mut self, event: TimerEvent) -> (bool, Vec<EngineAction>) {
        let Some(state) = self.channels.get(event.channel) else {
            return (false, Vec::new());
        };
        if !state.active || state.generation != event.generation {
            return (false, Vec::new());
        }

        match event.kind {
            TimerKind::MaxHold => (true, self.force_close(event.channel, CloseReason::MaxHold)),
            TimerKind::MinHold if state.release_pending => (
                true,
                self.force_close(event.channel, CloseReason::MinHoldElapsed),
            ),
            TimerKind::MinHold => (false, Vec::new()),
            TimerKind::Kick => {
                self.channels[event.channel].level = self.config.hold_level;
                (false, Vec::new())
            }
        }
    }

    /// Periodic re-check of the hard bounds, independent of timer delivery.
    pub fn reconcile(&mut self, now_ms: u64) -> (bool, Vec<EngineAction>) {
        let mut changed = false;
        let mut actions = Vec::new();

        // Released channels whose min-hold expiry never landed.
        let settled: Vec<usize> = self
            .active_mask
            .channels()
            .filter(|channel| {
                let state = &self.channels[*channel];
                state.release_pending
                    && state
                        .activated_at_ms
                        .is_some_and(|start| now_ms.saturating_sub(start) >= self.config.min_hold_ms)
            })
            .collect();
        for channel in settled {
            actions.extend(self.force_close(channel, CloseReason::MinHoldElapsed));
            changed = true;
        }

        let expired: Vec<usize> = self
            .active_mask
            .channels()
            .filter(|channel| {
                self.channels[*channel]
                    .activated_at_ms
                    .is_some_and(|start| now_ms.saturating_sub(start) >= self.config.max_hold_ms)
            })
            .collect();
        for channel in expired {
            actions.extend(self.force_close(channel, CloseReason::MaxHold));
            changed = true;
        }

        let link_silent = self
            .last_link_rx_ms
            .is_some_and(|rx| now_ms.saturating_sub(rx) > self.config.link_timeout_ms);
        if !link_silent {
            return (changed, actions);
        }

        if !self.active_mask.is_empty() {
            for channel in 0..self.channels.len() {
                for kind in TimerKind::ALL {
                    actions.push(EngineAction::CancelTimer { channel, kind });
                }
            }
            for channel in self.active_mask.channels() {
                actions.extend(self.force_close(channel, CloseReason::LinkLost));
            }
            changed = true;
        }

        if self.link_connected {
            self.link_connected = false;
            changed = true;
        }

        if !matches!(
            self.state,
            SystemState::Error | SystemState::Firing | SystemState::Disconnected
        ) {
            self.set_state(SystemState::Disconnected);
            changed = true;
        }

        (changed, actions)
    }

    fn close_channel(&mut self, channel: usize, actions: &mut Vec<EngineAction>) {
        let state = &mut self.channels[channel];
        state.active = false;
        state.release_pending = false;
        state.level = 0;
        state.activated_at_ms = None;
        actions.push(EngineAction::CancelTimer {
            channel,
            kind: TimerKind::Kick,
        });
        self.recompute_mask();
    }

    /// Leaves `Firing` once the last channel is closed.
    fn settle(&mut self, next: SystemState) {
        if !self.active_mask.is_empty() {
            return;
        }
        self.activation_started_at_ms = None;
        if self.state != SystemState::Error {
            self.set_state(next);
        }
    }

    fn recompute_mask(&mut self) {
        let mut mask = ChannelMask::EMPTY;
        for (index, channel) in self.channels.iter().enumerate() {
            if channel.active {
                mask.insert(index);
            }
        }
        self.active_mask = mask;
    }

    fn set_state(&mut self, state: SystemState) {
        self.state = state;
        self.status_color = status_color(state);
    }
}

fn cancel_hold_timers(channel: usize, actions: &mut Vec<EngineAction>) {
    actions.push(EngineAction::CancelTimer {
        channel,
        kind: TimerKind::MaxHold,
    });
    actions.push(EngineAction::CancelTimer {
        channel,
        kind: TimerKind::MinHold,
    });
}
