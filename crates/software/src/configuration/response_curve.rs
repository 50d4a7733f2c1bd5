use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::Float;

/// Shapes a normalized controller value before it is turned into MIDI.
///
/// Every curve passes through `0.0`, `0.5`, and `1.0`; steeper curves push values away from the center, so light and
/// heavy touches reach the extremes sooner.
#[derive(Debug, Default, Copy, Clone, ToPrimitive, FromPrimitive, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ResponseCurve {
    /// Values pass through unchanged.
    #[default]
    Linear,
    /// A gentle S-curve.
    Soft,
    /// A moderate S-curve.
    Medium,
    /// A pronounced S-curve.
    Hard,
}
impl super::CycleConfig for ResponseCurve {}

impl ResponseCurve {
    fn amount(&self) -> f32 {
        match self {
            Self::Linear => 0.0,
            Self::Soft => 0.25,
            Self::Medium => 0.5,
            Self::Hard => 1.0,
        }
    }

    /// Applies the curve to `value`, which is first clamped to `0.0..=1.0`.
    pub fn apply(&self, value: f32) -> f32 {
        let value = value.clamp(0.0, 1.0);
        if *self == Self::Linear {
            return value;
        }

        let power = 1.0 - self.amount() * 0.75;
        let offset = value - 0.5;
        let shaped = (offset.abs() * 2.0).powf(power) * 0.5;
        if offset < 0.0 {
            0.5 - shaped
        } else {
            0.5 + shaped
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::CycleConfig;

    const ALL: [ResponseCurve; 4] = [
        ResponseCurve::Linear,
        ResponseCurve::Soft,
        ResponseCurve::Medium,
        ResponseCurve::Hard,
    ];

    #[test]
    fn linear_is_identity() {
        for value in [0.0, 0.1, 0.33, 0.5, 0.9, 1.0] {
            assert_eq!(
                value,
                ResponseCurve::Linear.apply(value),
                "Expected left but got right"
            );
        }
    }

    #[test]
    fn fixed_points() {
        for curve in ALL {
            for value in [0.0, 0.5, 1.0] {
                assert!(
                    (curve.apply(value) - value).abs() < 1e-6,
                    "{curve:?} should map {value} onto itself"
                );
            }
        }
    }

    #[test]
    fn steeper_curves_push_away_from_center() {
        let soft = ResponseCurve::Soft.apply(0.75);
        let hard = ResponseCurve::Hard.apply(0.75);
        assert!(soft > 0.75, "Soft curve should lift values above center");
        assert!(hard > soft, "Hard curve should lift further than soft");
        assert!(
            (hard - 0.920_45).abs() < 1e-4,
            "Expected hard curve at 0.75 to be ~0.92045 but got {hard}"
        );

        let low = ResponseCurve::Hard.apply(0.25);
        assert!(
            (low - (1.0 - hard)).abs() < 1e-6,
            "Curve should be symmetric around the center"
        );
    }

    #[test]
    fn out_of_range_input_is_clamped() {
        assert_eq!(1.0, ResponseCurve::Medium.apply(1.7), "Expected left but got right");
        assert_eq!(0.0, ResponseCurve::Medium.apply(-0.2), "Expected left but got right");
    }

    #[test]
    fn cycles_through_every_curve() {
        let mut curve = ResponseCurve::Linear;
        for expected in ALL.iter().skip(1).chain(ALL.iter().take(1)) {
            curve = curve.cycle();
            assert_eq!(*expected, curve, "Expected left but got right");
        }
    }
}
