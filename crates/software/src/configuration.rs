//! User-facing settings and the traits that make them easier to work with in code.

mod response_curve;
pub use response_curve::*;

use embassy_time::Duration;
use num_traits::{FromPrimitive, ToPrimitive};
use wmidi::{Note, U7};

/// A trait which allows infinite cycling of an enum's variants.
///
/// Useful for pushbutton user interfaces, allowing presses to advance from the current to the next variant,
/// cycling back to the beginning when all variants have been exhausted.
pub trait CycleConfig {
    /// Return the next variant, cycling back to the beginning as needed.
    fn cycle(self) -> Self
    where
        Self: FromPrimitive + ToPrimitive + Sized + Copy,
    {
        self.to_u8()
            .and_then(|index| index.checked_add(1))
            .and_then(<Self as FromPrimitive>::from_u8)
            .or_else(|| <Self as FromPrimitive>::from_u8(0))
            .unwrap_or(self)
    }
}

/// Tunables for the control loop.
///
/// The defaults match the companion synthesizer's expectations; only the response curves are meant to change at
/// runtime.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Settings {
    /// The note produced by key 0 with no octave shift.
    pub root_note: Note,
    /// How many octaves the encoder may shift the keyboard in either direction.
    pub octave_limit: i8,
    /// Pitch-bend range, in semitones, announced for member channels.
    pub member_bend_range: U7,
    /// Pitch-bend range, in semitones, announced for the master channel.
    pub master_bend_range: U7,
    /// Shapes pressure before it is sent as channel pressure.
    pub pressure_curve: ResponseCurve,
    /// Shapes key position before it is sent as pitch bend.
    pub bend_curve: ResponseCurve,
    /// How long a touch is observed before its velocity is committed and the note starts.
    pub velocity_delay: Duration,
    /// How long the remote device may stay silent before the session falls back to standalone.
    pub communication_timeout: Duration,
    /// Minimum spacing between two outgoing text messages.
    pub message_gap: Duration,
    /// Average pressure decay rate (normalized units per second) below which a release is silent.
    pub release_threshold: f32,
    /// Multiplier from average decay rate to release velocity.
    pub release_scale: f32,
    /// How often the firmware runs the control loop.
    pub loop_period: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            root_note: Note::C4,
            octave_limit: 3,
            member_bend_range: U7::from_u8_lossy(48),
            master_bend_range: U7::from_u8_lossy(2),
            pressure_curve: ResponseCurve::default(),
            bend_curve: ResponseCurve::default(),
            velocity_delay: Duration::from_millis(10),
            communication_timeout: Duration::from_secs(5),
            message_gap: Duration::from_millis(50),
            release_threshold: 0.5,
            release_scale: 32.0,
            loop_period: Duration::from_millis(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_derive::{FromPrimitive, ToPrimitive};

    #[derive(Debug, Clone, Copy, ToPrimitive, FromPrimitive, PartialEq)]
    enum Alpha {
        A,
        B,
        C,
    }
    impl CycleConfig for Alpha {}

    #[test]
    fn cycle() {
        let config = Alpha::A.cycle();
        assert_eq!(
            Alpha::B,
            config,
            "Should advance to next variant; expected left but got right"
        );

        let config = config.cycle();
        assert_eq!(
            Alpha::C,
            config,
            "Should advance to next variant; expected left but got right"
        );

        let config = config.cycle();
        assert_eq!(
            Alpha::A,
            config,
            "Should wrap around to first variant; expected left but got right"
        );
    }

    #[test]
    fn default_settings() {
        let settings = Settings::default();
        assert_eq!(
            60,
            u8::from(settings.root_note),
            "Root note should be middle C; expected left but got right"
        );
        assert_eq!(
            48,
            u8::from(settings.member_bend_range),
            "Member channels should bend ±48 semitones; expected left but got right"
        );
    }
}
