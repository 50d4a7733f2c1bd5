use num_traits::Float;

use super::{PotChange, PotReading};
use crate::cc_config::POT_COUNT;

/// Noise handling for the potentiometers. Raw values are 16-bit.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PotCalibration {
    /// Lowest raw value the pots produce.
    pub adc_min: u16,
    /// Highest raw value the pots produce.
    pub adc_max: u16,
    /// Raw movement that wakes an idle pot; an active pot moving less than this goes idle.
    pub activity_threshold: u16,
    /// Raw movement an active pot must exceed to be reported.
    pub change_threshold: u16,
    /// Fraction of travel at the bottom that reads as `0.0`.
    pub lower_trim: f32,
    /// Fraction of travel at the top that reads as `1.0`.
    pub upper_trim: f32,
}

impl Default for PotCalibration {
    fn default() -> Self {
        Self {
            adc_min: 0,
            adc_max: u16::MAX,
            activity_threshold: 1_000,
            change_threshold: 500,
            lower_trim: 0.02,
            upper_trim: 0.02,
        }
    }
}

impl PotCalibration {
    /// Maps a raw reading onto `0.0..=1.0`, flattening the trimmed ends and rounding to three decimals.
    pub fn normalize(&self, raw: u16) -> f32 {
        let span = f32::from(self.adc_max.saturating_sub(self.adc_min).max(1));
        let clamped = raw.clamp(self.adc_min, self.adc_max);
        let normalized = f32::from(clamped - self.adc_min) / span;

        let trimmed = if normalized < self.lower_trim {
            0.0
        } else if normalized > 1.0 - self.upper_trim {
            1.0
        } else {
            (normalized - self.lower_trim) / (1.0 - self.lower_trim - self.upper_trim)
        };
        (trimmed * 1000.0).round() / 1000.0
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct PotState {
    raw: u16,
    value: f32,
    active: bool,
}

/// Decides which pot readings are movement and which are noise.
#[derive(Clone, Debug)]
pub struct PotFilter {
    calibration: PotCalibration,
    pots: [PotState; POT_COUNT],
}

impl Default for PotFilter {
    fn default() -> Self {
        Self::new(PotCalibration::default())
    }
}

impl PotFilter {
    /// Creates a filter with every pot idle at zero.
    pub fn new(calibration: PotCalibration) -> Self {
        Self {
            calibration,
            pots: [PotState::default(); POT_COUNT],
        }
    }

    /// Processes one pot's raw reading, returning a change if it moved.
    pub fn process(&mut self, pot: u8, raw: u16) -> Option<PotChange> {
        let calibration = self.calibration;
        let state = self.pots.get_mut(usize::from(pot))?;
        let value = calibration.normalize(raw);
        let movement = raw.abs_diff(state.raw);

        if state.active {
            if movement > calibration.change_threshold {
                return report(pot, state, raw, value);
            }
            if movement < calibration.activity_threshold {
                state.active = false;
            }
        } else if movement > calibration.activity_threshold {
            trace!("Pot {} active", pot);
            state.active = true;
            return report(pot, state, raw, value);
        }
        None
    }

    /// Takes `raw` as the pot's new baseline and marks it active.
    pub fn rebaseline(&mut self, pot: u8, raw: u16) -> Option<PotReading> {
        let value = self.calibration.normalize(raw);
        let state = self.pots.get_mut(usize::from(pot))?;
        *state = PotState {
            raw,
            value,
            active: true,
        };
        Some(PotReading { pot, value })
    }
}

fn report(pot: u8, state: &mut PotState, raw: u16, value: f32) -> Option<PotChange> {
    if value == state.value {
        return None;
    }
    let change = PotChange {
        pot,
        previous: state.value,
        value,
    };
    state.raw = raw;
    state.value = value;
    Some(change)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_trims_ends() {
        let calibration = PotCalibration::default();
        assert_eq!(0.0, calibration.normalize(0), "Expected left but got right");
        assert_eq!(0.0, calibration.normalize(1_000), "Expected left but got right");
        assert_eq!(1.0, calibration.normalize(u16::MAX), "Expected left but got right");
        assert_eq!(1.0, calibration.normalize(65_000), "Expected left but got right");
        assert_eq!(0.5, calibration.normalize(32_768), "Expected left but got right");
    }

    #[test]
    fn idle_pot_wakes_on_large_movement() {
        let mut filter = PotFilter::default();
        assert_eq!(None, filter.process(0, 800), "Small movement is noise");

        let change = filter.process(0, 32_768).unwrap();
        assert_eq!(
            PotChange {
                pot: 0,
                previous: 0.0,
                value: 0.5
            },
            change,
            "Expected left but got right"
        );
    }

    #[test]
    fn active_pot_reports_smaller_steps_then_settles() {
        let mut filter = PotFilter::default();
        filter.process(2, 32_768).unwrap();

        let change = filter.process(2, 33_468).unwrap();
        assert_eq!(0.5, change.previous, "Expected left but got right");
        assert!(change.value > 0.5, "Expected an increase but got {}", change.value);

        // jitter settles the pot, after which a change-sized step is not enough
        assert_eq!(None, filter.process(2, 33_500), "Expected left but got right");
        assert_eq!(None, filter.process(2, 34_168), "Settled pot should ignore small steps");
        assert!(filter.process(2, 40_000).is_some(), "Large movement should wake it again");
    }

    #[test]
    fn rebaseline_marks_active() {
        let mut filter = PotFilter::default();
        let reading = filter.rebaseline(4, 65_535).unwrap();
        assert_eq!(1.0, reading.value, "Expected left but got right");

        let change = filter.process(4, 65_000);
        assert_eq!(
            None, change,
            "Trimmed top end should not report a change; expected left but got right"
        );
        assert_eq!(None, filter.rebaseline(POT_COUNT as u8, 0), "Expected left but got right");
    }
}
