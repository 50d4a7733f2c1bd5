//! Key sensing. Each key rests on two force-sensitive resistors, one under each end, read through a voltage divider.
//! Their balance gives the lateral position of the touch and the firmer of the two gives its pressure.

use num_traits::Float;

use super::{KEY_COUNT, KeyChange};
use crate::mpe::KeyId;

const SUPPLY_VOLTAGE: f32 = 3.3;

/// Readings are scaled to 16 bits regardless of the converter's native resolution.
pub const ADC_FULL_SCALE: f32 = 65_535.0;

/// Electrical characteristics of the key sensors and the activation thresholds applied to them.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SensorCalibration {
    /// Divider voltage at or above which a sensor is considered untouched.
    pub rest_voltage: f32,
    /// Fixed divider resistance, in ohms.
    pub divider_resistance: f32,
    /// Sensor resistance at full pressure, in ohms.
    pub min_resistance: f32,
    /// Sensor resistance at the lightest detectable touch, in ohms.
    pub max_resistance: f32,
    /// Pressure an idle key must exceed to activate.
    pub activation_threshold: f32,
    /// Pressure an active key must drop below to deactivate.
    pub deactivation_threshold: f32,
}

impl Default for SensorCalibration {
    fn default() -> Self {
        Self {
            rest_voltage: 3.2,
            divider_resistance: 10_000.0,
            min_resistance: 1_000.0,
            max_resistance: 100_000.0,
            activation_threshold: 0.05,
            deactivation_threshold: 0.02,
        }
    }
}

impl SensorCalibration {
    /// Converts a raw reading into sensor resistance, or `None` if the sensor is untouched.
    pub fn resistance(&self, raw: u16) -> Option<f32> {
        let voltage = f32::from(raw) / ADC_FULL_SCALE * SUPPLY_VOLTAGE;
        if voltage >= self.rest_voltage {
            return None;
        }
        Some(self.divider_resistance * voltage / (SUPPLY_VOLTAGE - voltage))
    }

    /// Maps a resistance onto `0.0..=1.0` pressure.
    ///
    /// Resistance falls roughly exponentially with force, so the scale is logarithmic, then cubed to spread out the
    /// light-touch end.
    pub fn normalize(&self, resistance: Option<f32>) -> f32 {
        let Some(resistance) = resistance else {
            return 0.0;
        };
        if resistance >= self.max_resistance {
            return 0.0;
        }
        if resistance <= self.min_resistance {
            return 1.0;
        }

        let log_position =
            (resistance / self.min_resistance).ln() / (self.max_resistance / self.min_resistance).ln();
        (1.0 - log_position).powi(3).clamp(0.0, 1.0)
    }

    /// Converts a raw reading straight to normalized pressure.
    pub fn pressure(&self, raw: u16) -> f32 {
        self.normalize(self.resistance(raw))
    }
}

/// Lateral position of a touch from the two sides' pressures, `-1.0` (all left) to `1.0` (all right).
pub fn position(left: f32, right: f32) -> f32 {
    let total = left + right;
    if total == 0.0 {
        return 0.0;
    }
    (right - left) / total
}

/// Pressure of a touch: the firmer of the two sides.
pub fn pressure(left: f32, right: f32) -> f32 {
    left.max(right)
}

/// One of the two first-level key multiplexers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MuxBank {
    /// The multiplexer serving the lower keys.
    A,
    /// The multiplexer serving the upper keys.
    B,
}

/// How to reach one sensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SensorRoute {
    /// Wired straight to a first-level channel.
    Direct {
        /// First-level multiplexer.
        bank: MuxBank,
        /// First-level channel.
        channel: u8,
    },
    /// Behind the second-level selector, which feeds channel 0 of the first-level multiplexer.
    Selected {
        /// First-level multiplexer.
        bank: MuxBank,
        /// Selector channel.
        channel: u8,
    },
}

/// Where each key's left and right sensors are wired, in key order.
///
/// Channel 0 of each selector is unused, and sensors come in adjacent (left, right) pairs.
pub fn key_routes() -> impl Iterator<Item = (KeyId, SensorRoute, SensorRoute)> {
    let selected = |bank, channels: core::ops::Range<u8>| {
        channels.step_by(2).map(move |channel| {
            (
                SensorRoute::Selected { bank, channel },
                SensorRoute::Selected {
                    bank,
                    channel: channel + 1,
                },
            )
        })
    };
    let direct = |bank| {
        (1..15).step_by(2).map(move |channel| {
            (
                SensorRoute::Direct { bank, channel },
                SensorRoute::Direct {
                    bank,
                    channel: channel + 1,
                },
            )
        })
    };

    selected(MuxBank::A, 1..10)
        .chain(direct(MuxBank::A))
        .chain(direct(MuxBank::B))
        .chain(selected(MuxBank::B, 1..12))
        .enumerate()
        .map(|(key, (left, right))| (key as KeyId, left, right))
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct KeyState {
    active: bool,
    left: f32,
    right: f32,
}

/// Tracks every key between scans and reports the ones that changed.
///
/// Activation uses two thresholds so a key hovering around one value does not chatter on and off.
#[derive(Clone, Debug)]
pub struct KeyScanner {
    calibration: SensorCalibration,
    keys: [KeyState; KEY_COUNT],
}

impl Default for KeyScanner {
    fn default() -> Self {
        Self::new(SensorCalibration::default())
    }
}

impl KeyScanner {
    /// Creates a scanner with every key idle.
    pub fn new(calibration: SensorCalibration) -> Self {
        Self {
            calibration,
            keys: [KeyState::default(); KEY_COUNT],
        }
    }

    /// Returns `true` if the key is currently active.
    pub fn is_active(&self, key: KeyId) -> bool {
        self.keys.get(usize::from(key)).is_some_and(|state| state.active)
    }

    /// Processes one key's raw left and right readings.
    ///
    /// Active keys report every change. Idle keys report only the reading that deactivated them, with zero pressure.
    pub fn process(&mut self, key: KeyId, left_raw: u16, right_raw: u16) -> Option<KeyChange> {
        let calibration = self.calibration;
        let state = self.keys.get_mut(usize::from(key))?;
        let left = calibration.pressure(left_raw);
        let right = calibration.pressure(right_raw);
        let peak = pressure(left, right);

        let was_active = state.active;
        state.active = if was_active {
            peak >= calibration.deactivation_threshold
        } else {
            peak > calibration.activation_threshold
        };
        let changed = left != state.left || right != state.right;
        state.left = left;
        state.right = right;

        match (was_active, state.active) {
            (false, true) => {
                trace!("Key {} activated at {}", key, peak);
                Some(KeyChange {
                    key,
                    position: position(left, right),
                    pressure: peak,
                    strike_velocity: Some(peak),
                })
            }
            (true, false) => {
                trace!("Key {} deactivated", key);
                Some(KeyChange {
                    key,
                    position: position(left, right),
                    pressure: 0.0,
                    strike_velocity: None,
                })
            }
            (true, true) if changed => Some(KeyChange {
                key,
                position: position(left, right),
                pressure: peak,
                strike_velocity: None,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Raw reading that produces `resistance` through the default divider.
    fn raw_for(resistance: f32) -> u16 {
        let voltage = SUPPLY_VOLTAGE * resistance / (resistance + 10_000.0);
        (voltage / SUPPLY_VOLTAGE * ADC_FULL_SCALE).round() as u16
    }

    const REST: u16 = u16::MAX;

    #[test]
    fn untouched_sensor_reads_zero() {
        let calibration = SensorCalibration::default();
        assert_eq!(None, calibration.resistance(REST), "Expected left but got right");
        assert_eq!(0.0, calibration.pressure(REST), "Expected left but got right");
    }

    #[test]
    fn pressure_is_logarithmic_in_resistance() {
        let calibration = SensorCalibration::default();
        assert_eq!(1.0, calibration.normalize(Some(500.0)), "Expected left but got right");
        assert_eq!(0.0, calibration.normalize(Some(200_000.0)), "Expected left but got right");

        // 10k is halfway between 1k and 100k on a log scale
        let middle = calibration.normalize(Some(10_000.0));
        assert!((middle - 0.125).abs() < 1e-4, "Expected 0.125 but got {middle}");

        let firm = calibration.pressure(raw_for(2_000.0));
        let light = calibration.pressure(raw_for(50_000.0));
        assert!(firm > light, "Lower resistance should read as more pressure");
    }

    #[test]
    fn position_from_balance() {
        assert_eq!(0.0, position(0.0, 0.0), "Expected left but got right");
        assert_eq!(0.0, position(0.4, 0.4), "Expected left but got right");
        assert_eq!(1.0, position(0.0, 0.3), "Expected left but got right");
        assert_eq!(-1.0, position(0.3, 0.0), "Expected left but got right");
        assert_eq!(0.5, pressure(0.2, 0.5), "Expected left but got right");
    }

    #[test]
    fn routes_cover_every_key_once() {
        let routes: heapless::Vec<_, KEY_COUNT> = key_routes().collect();
        assert_eq!(KEY_COUNT, routes.len(), "Expected left but got right");
        assert_eq!(
            (
                0,
                SensorRoute::Selected {
                    bank: MuxBank::A,
                    channel: 1
                },
                SensorRoute::Selected {
                    bank: MuxBank::A,
                    channel: 2
                }
            ),
            routes[0],
            "Expected left but got right"
        );
        assert_eq!(
            (
                5,
                SensorRoute::Direct {
                    bank: MuxBank::A,
                    channel: 1
                },
                SensorRoute::Direct {
                    bank: MuxBank::A,
                    channel: 2
                }
            ),
            routes[5],
            "Expected left but got right"
        );
        assert_eq!(
            (
                24,
                SensorRoute::Selected {
                    bank: MuxBank::B,
                    channel: 11
                },
                SensorRoute::Selected {
                    bank: MuxBank::B,
                    channel: 12
                }
            ),
            routes[24],
            "Expected left but got right"
        );
    }

    #[test]
    fn activation_has_hysteresis() {
        let mut scanner = KeyScanner::default();
        let calibration = SensorCalibration::default();

        // light touch below the activation threshold
        let light = raw_for(80_000.0);
        assert!(calibration.pressure(light) < 0.05);
        assert_eq!(None, scanner.process(3, light, REST), "Expected left but got right");

        let firm = raw_for(5_000.0);
        let change = scanner.process(3, firm, REST).unwrap();
        assert!(scanner.is_active(3), "Key should activate");
        assert_eq!(-1.0, change.position, "Expected left but got right");
        assert_eq!(Some(change.pressure), change.strike_velocity, "Expected left but got right");

        // between thresholds: stays active
        let hover = raw_for(22_000.0);
        let hover_pressure = calibration.pressure(hover);
        assert!(hover_pressure > 0.02 && hover_pressure < 0.05, "Got {hover_pressure}");
        let change = scanner.process(3, hover, REST).unwrap();
        assert!(scanner.is_active(3), "Key should stay active between thresholds");
        assert_eq!(None, change.strike_velocity, "Expected left but got right");

        assert_eq!(
            None,
            scanner.process(3, hover, REST),
            "Unchanged readings should not be reported"
        );

        let change = scanner.process(3, REST, REST).unwrap();
        assert!(!scanner.is_active(3), "Key should deactivate");
        assert_eq!(0.0, change.pressure, "Expected left but got right");

        assert_eq!(None, scanner.process(3, light, REST), "Idle noise should not be reported");
    }

    #[test]
    fn out_of_range_key_is_ignored() {
        let mut scanner = KeyScanner::default();
        assert_eq!(None, scanner.process(KEY_COUNT as KeyId, 0, 0), "Expected left but got right");
    }
}
