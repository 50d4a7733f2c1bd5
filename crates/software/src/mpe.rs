//! MIDI Polyphonic Expression: channel allocation, note lifecycle, and the ordering rules that keep per-note
//! expression attached to the right note.
//!
//! Bartleby drives a single lower zone: channel 1 is the master channel (pots, zone-wide messages) and channels 2–15
//! are member channels, each carrying one sounding note with its own pressure and pitch bend.

mod channel_pool;
pub use channel_pool::*;

mod chime;
pub use chime::*;

mod notes;
pub use notes::*;

mod sequencer;
pub use sequencer::*;

use wmidi::{Channel, ControlFunction, MidiMessage, U7};

use crate::Error;
use crate::configuration::Settings;

/// Identifies a physical key (or a virtual one, see [`CHIME_KEY`]).
pub type KeyId = u8;

/// Number of key identifiers tracked. Keys at or above this are ignored.
pub const KEY_SLOTS: usize = 32;

/// Virtual key used to voice the greeting chime, out of reach of the physical keyboard.
pub const CHIME_KEY: KeyId = (KEY_SLOTS - 1) as KeyId;

/// The zone's master channel.
pub const MASTER_CHANNEL: Channel = Channel::Ch1;

/// Zero-based indices of the member channels (channels 2–15).
pub const MEMBER_CHANNELS: core::ops::RangeInclusive<u8> = 1..=14;

/// Number of member channels in the zone.
pub const MEMBER_CHANNEL_COUNT: u8 = 14;

/// Per-note timbre controller.
pub const TIMBRE: ControlFunction = ControlFunction(U7::from_u8_lossy(74));

/// Neutral timbre.
pub const TIMBRE_CENTER: U7 = U7::from_u8_lossy(64);

const RESET_ALL_CONTROLLERS: ControlFunction = ControlFunction(U7::from_u8_lossy(121));
const ALL_NOTES_OFF: ControlFunction = ControlFunction(U7::from_u8_lossy(123));
const RPN_MSB: ControlFunction = ControlFunction(U7::from_u8_lossy(101));
const RPN_LSB: ControlFunction = ControlFunction(U7::from_u8_lossy(100));
const DATA_ENTRY_MSB: ControlFunction = ControlFunction(U7::from_u8_lossy(6));
const DATA_ENTRY_LSB: ControlFunction = ControlFunction(U7::from_u8_lossy(38));

/// RPN 0/0: pitch-bend sensitivity.
const RPN_PITCH_BEND_SENSITIVITY: U7 = U7::from_u8_lossy(0);
/// RPN 0/6: MPE configuration message.
const RPN_MPE_CONFIGURATION: U7 = U7::from_u8_lossy(6);

const ZONE_SETUP_CAPACITY: usize = 64;

/// The messages that announce the zone layout, in the order they must be sent.
pub type ZoneSetup = heapless::Vec<MidiMessage<'static>, ZONE_SETUP_CAPACITY>;

/// Converts a zero-based member-channel index into a [`Channel`], falling back to the first member channel.
pub(crate) fn member_channel(index: u8) -> Channel {
    Channel::from_index(index).unwrap_or(Channel::Ch2)
}

/// Builds the startup sequence that resets the receiver and configures a lower zone with every member channel.
pub fn zone_setup(settings: &Settings) -> Result<ZoneSetup, Error> {
    let mut messages = ZoneSetup::new();
    let cc = |channel, function, value| MidiMessage::ControlChange(channel, function, value);
    let zero = U7::from_u8_lossy(0);

    let mut sequence = [
        cc(MASTER_CHANNEL, RESET_ALL_CONTROLLERS, zero),
        cc(MASTER_CHANNEL, ALL_NOTES_OFF, zero),
        cc(MASTER_CHANNEL, RPN_MSB, zero),
        cc(MASTER_CHANNEL, RPN_LSB, RPN_MPE_CONFIGURATION),
        cc(
            MASTER_CHANNEL,
            DATA_ENTRY_MSB,
            U7::from_u8_lossy(MEMBER_CHANNEL_COUNT),
        ),
        cc(MASTER_CHANNEL, RPN_MSB, zero),
        cc(MASTER_CHANNEL, RPN_LSB, RPN_PITCH_BEND_SENSITIVITY),
        cc(MASTER_CHANNEL, DATA_ENTRY_MSB, settings.master_bend_range),
        cc(MASTER_CHANNEL, DATA_ENTRY_LSB, zero),
    ]
    .into_iter()
    .chain(MEMBER_CHANNELS.map(member_channel).flat_map(|channel| {
        [
            cc(channel, RPN_MSB, zero),
            cc(channel, RPN_LSB, RPN_PITCH_BEND_SENSITIVITY),
            cc(channel, DATA_ENTRY_MSB, settings.member_bend_range),
        ]
    }));

    sequence.try_for_each(|message| messages.push(message).map_err(|_| Error::Exhausted))?;
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_setup_configures_every_member_channel() {
        let messages = zone_setup(&Settings::default()).unwrap();
        assert_eq!(9 + 14 * 3, messages.len(), "Expected left but got right");

        assert_eq!(
            MidiMessage::ControlChange(
                MASTER_CHANNEL,
                DATA_ENTRY_MSB,
                U7::from_u8_lossy(MEMBER_CHANNEL_COUNT)
            ),
            messages[4],
            "MCM should announce every member channel; expected left but got right"
        );

        let bend_ranges = messages
            .iter()
            .filter(|message| {
                matches!(message, MidiMessage::ControlChange(channel, function, value)
                    if *channel != MASTER_CHANNEL && *function == DATA_ENTRY_MSB && u8::from(*value) == 48)
            })
            .count();
        assert_eq!(14, bend_ranges, "Expected left but got right");

        assert_eq!(
            MidiMessage::ControlChange(Channel::Ch15, DATA_ENTRY_MSB, U7::from_u8_lossy(48)),
            messages[messages.len() - 1],
            "Expected left but got right"
        );
    }

    #[test]
    fn member_channel_indices() {
        assert_eq!(Channel::Ch2, member_channel(1), "Expected left but got right");
        assert_eq!(Channel::Ch15, member_channel(14), "Expected left but got right");
    }
}
