use crate::{
    config::LedConfig,
    types::{Channel, Rgb, StatusFrame, SystemState},
};

/// Fixed state→color table for the status pixel.
pub fn status_color(state: SystemState) -> Rgb {
    match state {
        SystemState::Boot => Rgb::new(122, 138, 160),
        SystemState::Ready => Rgb::new(29, 185, 84),
        SystemState::Firing => Rgb::new(255, 138, 0),
        SystemState::Disconnected => Rgb::new(0, 0, 255),
        SystemState::Error => Rgb::new(230, 57, 70),
    }
}

/// Full strip contents. The solenoid and firing pixels carry channel levels
/// in their R, G and B components, so the valve gate rides on the same write
/// as the status color.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelFrame {
    pub pixels: Vec<Rgb>,
}

impl PixelFrame {
    pub fn compose(led: &LedConfig, status: Rgb, channels: &[Channel]) -> Self {
        let level = |index: usize| channels.get(index).map_or(0, |channel| channel.level);
        let gates = Rgb::new(level(0), level(1), level(2));

        let mut pixels = vec![Rgb::OFF; led.pixel_count()];
        pixels[led.status_index] = status;
        pixels[led.solenoid_index] = gates;
        pixels[led.firing_index] = gates;
        Self { pixels }
    }
}

impl StatusFrame {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
