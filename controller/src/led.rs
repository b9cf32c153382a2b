use anyhow::anyhow;
use esp_idf_hal::{gpio::OutputPin, peripheral::Peripheral, rmt::RmtChannel};
use log::warn;
use smart_leds::{SmartLedsWrite, RGB8};
use ws2812_esp32_rmt_driver::Ws2812Esp32Rmt;

use poofer_common::{LedSink, PooferError, Rgb};

enum StripBackend {
    Rmt(Ws2812Esp32Rmt<'static>),
    Disabled,
}

/// Status and solenoid-gate pixels on one WS2812 chain.
pub struct Ws2812Strip {
    backend: StripBackend,
    pixels: Vec<RGB8>,
}

impl Ws2812Strip {
    pub fn new<C: RmtChannel>(
        channel: impl Peripheral<P = C> + 'static,
        pin: impl Peripheral<P = impl OutputPin> + 'static,
        pixel_count: usize,
    ) -> anyhow::Result<Self> {
        let driver = Ws2812Esp32Rmt::new(channel, pin)
            .map_err(|err| anyhow!("failed to init WS2812 RMT driver: {err:?}"))?;

        Ok(Self {
            backend: StripBackend::Rmt(driver),
            pixels: vec![RGB8::default(); pixel_count],
        })
    }

    pub fn disabled(pixel_count: usize) -> Self {
        Self {
            backend: StripBackend::Disabled,
            pixels: vec![RGB8::default(); pixel_count],
        }
    }
}

impl LedSink for Ws2812Strip {
    fn set(&mut self, index: usize, color: Rgb) {
        if let Some(pixel) = self.pixels.get_mut(index) {
            *pixel = RGB8::new(color.r, color.g, color.b);
        }
    }

    fn flush(&mut self) -> Result<(), PooferError> {
        let StripBackend::Rmt(driver) = &mut self.backend else {
            warn!("LED strip disabled, dropping frame of {} pixels", self.pixels.len());
            return Ok(());
        };

        driver
            .write(self.pixels.iter().copied())
            .map_err(|err| PooferError::LedWrite(format!("{err:?}")))
    }
}
