//! The player-facing hardware: pressure-sensing keys, potentiometers, and the octave encoder.
//!
//! Everything here is signal processing on raw readings. Driving pins and converters is left to implementations of
//! [`Hardware`], so the same logic runs on the board and in host tests.

mod encoder;
pub use encoder::*;

mod keys;
pub use keys::*;

mod pots;
pub use pots::*;

use crate::cc_config::POT_COUNT;
use crate::mpe::KeyId;

/// Number of keys on the keyboard.
pub const KEY_COUNT: usize = 25;

/// A key whose readings changed since the last scan.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct KeyChange {
    /// Which key.
    pub key: KeyId,
    /// Lateral position of the touch, `-1.0` (left edge) to `1.0` (right edge).
    pub position: f32,
    /// Normalized pressure, `0.0..=1.0`. Zero means the key is released.
    pub pressure: f32,
    /// Pressure at the moment the key activated; present only on the activating reading.
    pub strike_velocity: Option<f32>,
}

/// A potentiometer that moved since the last scan.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PotChange {
    /// Which pot.
    pub pot: u8,
    /// Previously reported value, `0.0..=1.0`.
    pub previous: f32,
    /// New value, `0.0..=1.0`.
    pub value: f32,
}

/// A potentiometer's current value.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PotReading {
    /// Which pot.
    pub pot: u8,
    /// Current value, `0.0..=1.0`.
    pub value: f32,
}

/// Changed keys from one scan.
pub type KeyChanges = heapless::Vec<KeyChange, KEY_COUNT>;

/// Changed pots from one scan.
pub type PotChanges = heapless::Vec<PotChange, POT_COUNT>;

/// Every pot's value.
pub type PotReadings = heapless::Vec<PotReading, POT_COUNT>;

/// Access to the physical controls.
pub trait Hardware {
    /// Scans the keys and returns those whose readings changed.
    fn read_changed_keys(&mut self) -> KeyChanges;

    /// Scans the pots and returns those that moved.
    fn read_changed_pots(&mut self) -> PotChanges;

    /// Reads every pot, regardless of movement, and makes the readings the new baseline.
    fn read_all_pots(&mut self) -> PotReadings;

    /// Returns the clamped detent position of encoder `index`.
    fn encoder_position(&self, index: usize) -> i8;
}
