//! Drives the multiplexers, the ADC, and the encoder pins on behalf of the library's panel logic.

use bartleby_lib::{
    cc_config::POT_COUNT,
    controller::OCTAVE_ENCODER,
    panel::{
        Hardware, KeyChanges, KeyScanner, MuxBank, OctaveEncoder, PotChanges, PotFilter,
        PotReadings, SensorRoute, key_routes,
    },
};
use defmt::{debug, trace};
use embassy_stm32::{
    adc::{Adc, AnyAdcChannel},
    gpio::{Input, Level, Output},
    peripherals::ADC1,
};
use embassy_time::{Duration, Instant, block_for};

/// Time for a multiplexer output to settle after its select lines change.
const SETTLE: Duration = Duration::from_micros(100);

/// Minimum spacing between two pot scans.
const POT_SCAN_INTERVAL: Duration = Duration::from_millis(20);

/// A 16-channel analog multiplexer: four select lines and one signal line.
pub struct Mux {
    signal: AnyAdcChannel<ADC1>,
    select: [Output<'static>; 4],
}

impl Mux {
    pub fn new(signal: AnyAdcChannel<ADC1>, select: [Output<'static>; 4]) -> Self {
        Self { signal, select }
    }
}

/// Sets select lines to `channel`, least significant bit first.
fn select(lines: &mut [Output<'static>; 4], channel: u8) {
    for (bit, line) in lines.iter_mut().enumerate() {
        line.set_level(Level::from((channel >> bit) & 1 == 1));
    }
    block_for(SETTLE);
}

/// Scales a 12-bit conversion to the full 16-bit range the sensor math expects.
fn widen(raw: u16) -> u16 {
    (raw << 4) | (raw >> 8)
}

/// The keyboard, the pots, and the octave encoder.
pub struct Panel {
    adc: Adc<'static, ADC1>,
    keys_a: Mux,
    keys_b: Mux,
    /// Second-level selector feeding channel 0 of both key multiplexers.
    selector: [Output<'static>; 4],
    controls: Mux,
    clk: Input<'static>,
    dt: Input<'static>,
    scanner: KeyScanner,
    pots: PotFilter,
    encoder: OctaveEncoder,
    last_pot_scan: Option<Instant>,
}

impl Panel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        adc: Adc<'static, ADC1>,
        keys_a: Mux,
        keys_b: Mux,
        selector: [Output<'static>; 4],
        controls: Mux,
        clk: Input<'static>,
        dt: Input<'static>,
        octave_limit: i8,
    ) -> Self {
        Self {
            adc,
            keys_a,
            keys_b,
            selector,
            controls,
            clk,
            dt,
            scanner: KeyScanner::default(),
            pots: PotFilter::default(),
            encoder: OctaveEncoder::new(octave_limit),
            last_pot_scan: None,
        }
    }

    fn read_sensor(&mut self, route: SensorRoute) -> u16 {
        let (bank, channel) = match route {
            SensorRoute::Direct { bank, channel } => (bank, channel),
            SensorRoute::Selected { bank, channel } => {
                select(&mut self.selector, channel);
                (bank, 0)
            }
        };
        let mux = match bank {
            MuxBank::A => &mut self.keys_a,
            MuxBank::B => &mut self.keys_b,
        };
        select(&mut mux.select, channel);
        widen(self.adc.blocking_read(&mut mux.signal))
    }

    fn read_pot(&mut self, pot: u8) -> u16 {
        select(&mut self.controls.select, pot);
        widen(self.adc.blocking_read(&mut self.controls.signal))
    }

    fn poll_encoder(&mut self) {
        if let Some(position) = self.encoder.update(self.clk.is_high(), self.dt.is_high()) {
            debug!("Octave encoder at {}", position);
        }
    }
}

impl Hardware for Panel {
    fn read_changed_keys(&mut self) -> KeyChanges {
        self.poll_encoder();

        let mut changes = KeyChanges::new();
        for (key, left, right) in key_routes() {
            let left = self.read_sensor(left);
            let right = self.read_sensor(right);
            if let Some(change) = self.scanner.process(key, left, right) {
                trace!("Key {} changed: {}", key, change);
                // one entry per key, so this never overflows
                let _ = changes.push(change);
            }
        }
        changes
    }

    fn read_changed_pots(&mut self) -> PotChanges {
        let now = Instant::now();
        let mut changes = PotChanges::new();
        if self
            .last_pot_scan
            .is_some_and(|at| now.saturating_duration_since(at) < POT_SCAN_INTERVAL)
        {
            return changes;
        }
        self.last_pot_scan = Some(now);

        for pot in 0..POT_COUNT as u8 {
            let raw = self.read_pot(pot);
            if let Some(change) = self.pots.process(pot, raw) {
                let _ = changes.push(change);
            }
        }
        changes
    }

    fn read_all_pots(&mut self) -> PotReadings {
        let mut readings = PotReadings::new();
        for pot in 0..POT_COUNT as u8 {
            let raw = self.read_pot(pot);
            if let Some(reading) = self.pots.rebaseline(pot, raw) {
                let _ = readings.push(reading);
            }
        }
        readings
    }

    fn encoder_position(&self, index: usize) -> i8 {
        match index {
            OCTAVE_ENCODER => self.encoder.position(),
            _ => 0,
        }
    }
}
