use embassy_time::Instant;
use num_traits::Float;
use wmidi::{Channel, ControlFunction, MidiMessage, Note, U7, U14};

use super::{
    CHIME_KEY, CHIME_PRESSURE, ChannelPool, ChimeStep, Expression, KEY_SLOTS, KeyId, MASTER_CHANNEL, NoteState,
    NoteTracker, PendingVelocity, TIMBRE, TIMBRE_CENTER,
};
use crate::cc_config::CcAssignments;
use crate::configuration::{ResponseCurve, Settings};
use crate::link::Transport;
use crate::panel::{KeyChange, PotChange};
use crate::{ConfigParseError, Error};

/// Maximum number of events a single [`Sequencer::sequence`] call may produce.
pub const EVENT_CAPACITY: usize = 128;

/// An ordered batch of events.
pub type Events = heapless::Vec<MidiEvent, EVENT_CAPACITY>;

/// Pitch bend for a key at rest.
pub const PITCH_BEND_CENTER: u16 = 8192;

/// [`PITCH_BEND_CENTER`] as a 14-bit value.
pub fn pitch_bend_center() -> U14 {
    U14::try_from(PITCH_BEND_CENTER).unwrap_or(U14::MAX)
}

const ALL_NOTES_OFF: ControlFunction = ControlFunction(U7::from_u8_lossy(123));

/// Where an event sits in a batch. A batch is always sent preamble first, then articulation, then expression.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EventClass {
    /// Per-channel state that must be in place before a note starts or stops.
    Preamble,
    /// Note-on and note-off.
    Articulation,
    /// Continuous changes to sounding notes, and pots.
    Expression,
}

/// A MIDI message addressed to a key rather than a channel.
///
/// Channels are resolved when the event is sent, so a batch stays correct even when allocating a channel for one key
/// steals it from another.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MidiEvent {
    /// Set the key's timbre before its note starts.
    TimbreInit {
        /// The key.
        key: KeyId,
        /// Timbre value.
        timbre: U7,
    },
    /// Set the key's channel pressure before its note starts.
    PressureInit {
        /// The key.
        key: KeyId,
        /// Channel pressure.
        pressure: U7,
    },
    /// Set the key's pitch bend before its note starts.
    PitchBendInit {
        /// The key.
        key: KeyId,
        /// Pitch bend.
        bend: U14,
    },
    /// Zero the key's channel pressure ahead of its note-off.
    PressureRelease {
        /// The key.
        key: KeyId,
    },
    /// Start a note.
    NoteOn {
        /// The key.
        key: KeyId,
        /// Pitch.
        note: Note,
        /// Strike velocity.
        velocity: U7,
        /// Initial expression, recorded with the note.
        expression: Expression,
    },
    /// Stop the key's note and return its channel.
    NoteOff {
        /// The key.
        key: KeyId,
        /// Release velocity.
        velocity: U7,
    },
    /// Move a sounding note to a new pitch on the same channel.
    Retrigger {
        /// The key.
        key: KeyId,
        /// New pitch.
        note: Note,
    },
    /// New channel pressure for a sounding note.
    PressureUpdate {
        /// The key.
        key: KeyId,
        /// Channel pressure.
        pressure: U7,
    },
    /// New pitch bend for a sounding note.
    PitchBendUpdate {
        /// The key.
        key: KeyId,
        /// Pitch bend.
        bend: U14,
    },
    /// A pot moved; sent on the master channel.
    ControlChange {
        /// Controller.
        control: ControlFunction,
        /// Value.
        value: U7,
    },
}

impl MidiEvent {
    /// Returns the event's place in a batch.
    pub fn class(&self) -> EventClass {
        match self {
            Self::TimbreInit { .. }
            | Self::PressureInit { .. }
            | Self::PitchBendInit { .. }
            | Self::PressureRelease { .. } => EventClass::Preamble,
            Self::NoteOn { .. } | Self::NoteOff { .. } | Self::Retrigger { .. } => EventClass::Articulation,
            Self::PressureUpdate { .. } | Self::PitchBendUpdate { .. } | Self::ControlChange { .. } => {
                EventClass::Expression
            }
        }
    }
}

fn push(events: &mut Events, event: MidiEvent) -> Result<(), Error> {
    events.push(event).map_err(|_| Error::Exhausted)
}

/// Turns key and pot changes into MPE messages.
///
/// The receiver must see a note's channel pressure and pitch bend before its note-on, and its pressure return to zero
/// before its note-off; otherwise the note starts or ends with the previous occupant's expression. Each call to
/// [`sequence`](Self::sequence) therefore collects events into the three [`EventClass`]es and emits them class by
/// class.
#[derive(Clone, Debug)]
pub struct Sequencer {
    settings: Settings,
    assignments: CcAssignments,
    pool: ChannelPool,
    notes: NoteTracker,
    octave: i8,
}

impl Sequencer {
    /// Creates a sequencer with nothing sounding.
    pub fn new(settings: Settings, assignments: CcAssignments) -> Self {
        Self {
            settings,
            assignments,
            pool: ChannelPool::new(),
            notes: NoteTracker::new(),
            octave: 0,
        }
    }

    /// Returns the note tracker.
    pub fn notes(&self) -> &NoteTracker {
        &self.notes
    }

    /// Returns the channel pool.
    pub fn pool(&self) -> &ChannelPool {
        &self.pool
    }

    /// Returns the current octave shift.
    pub fn octave(&self) -> i8 {
        self.octave
    }

    /// Returns `true` if a touch is waiting out its velocity window.
    pub fn has_pending(&self) -> bool {
        self.notes.has_pending()
    }

    /// Changes the curve applied to pressure.
    pub fn set_pressure_curve(&mut self, curve: ResponseCurve) {
        info!("Pressure curve: {}", curve);
        self.settings.pressure_curve = curve;
    }

    /// Changes the curve applied to pitch bend.
    pub fn set_bend_curve(&mut self, curve: ResponseCurve) {
        info!("Bend curve: {}", curve);
        self.settings.bend_curve = curve;
    }

    /// Applies a configuration message to the live CC table.
    pub fn apply_cc_config(&mut self, message: &str) -> Result<usize, ConfigParseError> {
        self.assignments.apply(message)
    }

    /// Restores the default CC for every pot.
    pub fn reset_cc_assignments(&mut self) {
        self.assignments.reset_to_defaults();
    }

    /// Returns the pitch a key plays at the current octave.
    pub fn midi_note(&self, key: KeyId) -> Note {
        let note = i16::from(u8::from(self.settings.root_note))
            + 12 * i16::from(self.octave)
            + i16::from(key);
        Note::from(U7::from_u8_lossy(note.clamp(0, 127) as u8))
    }

    fn pressure_value(&self, pressure: f32) -> U7 {
        U7::from_u8_lossy((self.settings.pressure_curve.apply(pressure) * 127.0) as u8)
    }

    fn bend_value(&self, position: f32) -> U14 {
        let normalized = (position.clamp(-1.0, 1.0) + 1.0) / 2.0;
        let bend = (self.settings.bend_curve.apply(normalized) * 16383.0).round();
        U14::try_from(bend as u16).unwrap_or(U14::MAX)
    }

    /// Turns a batch of hardware changes into ordered events.
    ///
    /// - A touch on an idle key opens a velocity window; readings during the window only update it.
    /// - A window that has been open for the velocity delay becomes a note: pressure and pitch-bend init, then
    ///   note-on.
    /// - A release with an open window closes it silently; a release of a sounding note zeroes its pressure, then
    ///   sends note-off with the estimated release velocity.
    /// - Readings on a sounding note become pressure and pitch-bend updates.
    /// - Pot changes become control changes on the master channel, after everything else.
    pub fn sequence(&mut self, keys: &[KeyChange], pots: &[PotChange], now: Instant) -> Result<Events, Error> {
        let mut preamble = Events::new();
        let mut articulation = Events::new();
        let mut expression = Events::new();

        for change in keys {
            let key = change.key;
            if usize::from(key) >= KEY_SLOTS || key == CHIME_KEY {
                warn!("Ignoring change on unknown key {}", key);
                continue;
            }

            if change.pressure > 0.0 {
                let pressure = self.pressure_value(change.pressure);
                let bend = self.bend_value(change.position);
                if let Some(state) = self.notes.active_mut(key) {
                    state.update_pressure(change.pressure, now);
                    push(&mut expression, MidiEvent::PressureUpdate { key, pressure })?;
                    push(&mut expression, MidiEvent::PitchBendUpdate { key, bend })?;
                } else if let Some(pending) = self.notes.pending_mut(key) {
                    pending.update(change.pressure, change.position);
                } else {
                    let note = self.midi_note(key);
                    trace!("Key {} touched; waiting for velocity", key);
                    self.notes
                        .hold(key, PendingVelocity::new(change.pressure, change.position, note, now));
                }
            } else {
                if self.notes.discard_pending(key).is_some() {
                    debug!("Key {} released within the velocity window", key);
                }
                if let Some(state) = self.notes.active(key) {
                    let velocity = state.release_velocity(self.settings.release_threshold, self.settings.release_scale);
                    push(&mut preamble, MidiEvent::PressureRelease { key })?;
                    push(&mut articulation, MidiEvent::NoteOff { key, velocity })?;
                }
            }
        }

        for key in 0..KEY_SLOTS as KeyId {
            let Some(pending) = self.notes.take_due(key, now, self.settings.velocity_delay) else {
                continue;
            };
            let pressure = self.pressure_value(pending.pressure);
            let bend = self.bend_value(pending.position);
            push(&mut preamble, MidiEvent::PressureInit { key, pressure })?;
            push(&mut preamble, MidiEvent::PitchBendInit { key, bend })?;
            push(
                &mut articulation,
                MidiEvent::NoteOn {
                    key,
                    note: pending.note,
                    velocity: pending.velocity(),
                    expression: Expression {
                        pressure: pending.pressure,
                        channel_pressure: pressure,
                        pitch_bend: bend,
                    },
                },
            )?;
        }

        for change in pots {
            let value = (change.value.clamp(0.0, 1.0) * 127.0) as u8;
            push(
                &mut expression,
                MidiEvent::ControlChange {
                    control: self.assignments.cc_for_pot(change.pot),
                    value: U7::from_u8_lossy(value),
                },
            )?;
        }

        let mut events = preamble;
        for event in articulation.into_iter().chain(expression) {
            push(&mut events, event)?;
        }
        Ok(events)
    }

    /// Moves the keyboard `direction` octaves, clamped to the octave limit, and re-articulates sounding notes.
    ///
    /// A shift that would leave the limit changes nothing and produces no events.
    pub fn shift_octave(&mut self, direction: i8) -> Result<Events, Error> {
        self.set_octave(self.octave.saturating_add(direction))
    }

    /// Jumps to an absolute octave shift, clamped to the octave limit, and re-articulates sounding notes.
    pub fn set_octave(&mut self, octave: i8) -> Result<Events, Error> {
        let limit = self.settings.octave_limit;
        let octave = octave.clamp(-limit, limit);
        if octave == self.octave {
            return Ok(Events::new());
        }
        info!("Octave shift: {}", octave);
        self.octave = octave;

        let mut events = Events::new();
        for state in self.notes.active_notes() {
            let key = state.key;
            push(
                &mut events,
                MidiEvent::PressureInit {
                    key,
                    pressure: state.channel_pressure,
                },
            )?;
            push(
                &mut events,
                MidiEvent::PitchBendInit {
                    key,
                    bend: state.pitch_bend,
                },
            )?;
            push(
                &mut events,
                MidiEvent::Retrigger {
                    key,
                    note: self.midi_note(key),
                },
            )?;
        }
        Ok(events)
    }

    /// Produces the events for one step of the greeting chime, voiced on [`CHIME_KEY`].
    pub fn chime(&self, step: ChimeStep) -> Result<Events, Error> {
        let key = CHIME_KEY;
        let mut events = Events::new();
        match step {
            ChimeStep::Strike { note, velocity } => {
                let pressure = U7::from_u8_lossy((CHIME_PRESSURE * 127.0) as u8);
                push(
                    &mut events,
                    MidiEvent::TimbreInit {
                        key,
                        timbre: TIMBRE_CENTER,
                    },
                )?;
                push(&mut events, MidiEvent::PressureInit { key, pressure })?;
                push(
                    &mut events,
                    MidiEvent::PitchBendInit {
                        key,
                        bend: pitch_bend_center(),
                    },
                )?;
                push(
                    &mut events,
                    MidiEvent::NoteOn {
                        key,
                        note,
                        velocity,
                        expression: Expression {
                            pressure: CHIME_PRESSURE,
                            channel_pressure: pressure,
                            pitch_bend: pitch_bend_center(),
                        },
                    },
                )?;
            }
            ChimeStep::Release => {
                push(&mut events, MidiEvent::PressureRelease { key })?;
                push(
                    &mut events,
                    MidiEvent::NoteOff {
                        key,
                        velocity: U7::from_u8_lossy(0),
                    },
                )?;
            }
        }
        Ok(events)
    }

    /// Sends events in order, resolving each key to its channel at the moment it is sent.
    pub fn transmit<T: Transport>(&mut self, events: &[MidiEvent], transport: &mut T, now: Instant) -> Result<(), Error> {
        for (i, event) in events.iter().enumerate() {
            if let Err(e) = self.dispatch(event, transport, now) {
                // a key reports its release only once, so the rest of the batch still gives up its channels
                for event in &events[i..] {
                    if let MidiEvent::NoteOff { key, .. } = *event {
                        self.pool.release(key, &mut self.notes);
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// [`sequence`](Self::sequence)s a batch and [`transmit`](Self::transmit)s it.
    pub fn update<T: Transport>(
        &mut self,
        keys: &[KeyChange],
        pots: &[PotChange],
        now: Instant,
        transport: &mut T,
    ) -> Result<Events, Error> {
        let events = self.sequence(keys, pots, now)?;
        self.transmit(&events, transport, now)?;
        Ok(events)
    }

    /// Stops every sounding note, drops open velocity windows, and tells the receiver to silence the zone.
    pub fn silence<T: Transport>(&mut self, transport: &mut T) -> Result<(), Error> {
        for key in 0..KEY_SLOTS as KeyId {
            self.notes.discard_pending(key);
            if let Some(state) = self.notes.active(key) {
                transport.send_midi(&MidiMessage::NoteOff(state.channel, state.note, U7::from_u8_lossy(0)))?;
            }
            self.pool.release(key, &mut self.notes);
        }
        transport.send_midi(&MidiMessage::ControlChange(
            MASTER_CHANNEL,
            ALL_NOTES_OFF,
            U7::from_u8_lossy(0),
        ))?;
        Ok(())
    }

    fn dispatch<T: Transport>(&mut self, event: &MidiEvent, transport: &mut T, now: Instant) -> Result<(), Error> {
        match *event {
            MidiEvent::TimbreInit { key, timbre } => {
                let channel = self.pool.allocate(key, &mut self.notes);
                transport.send_midi(&MidiMessage::ControlChange(channel, TIMBRE, timbre))?;
            }
            MidiEvent::PressureInit { key, pressure } => {
                let channel = self.pool.allocate(key, &mut self.notes);
                transport.send_midi(&MidiMessage::ChannelPressure(channel, pressure))?;
            }
            MidiEvent::PitchBendInit { key, bend } => {
                let channel = self.pool.allocate(key, &mut self.notes);
                transport.send_midi(&MidiMessage::PitchBendChange(channel, bend))?;
            }
            MidiEvent::NoteOn {
                key,
                note,
                velocity,
                expression,
            } => {
                let channel = self.pool.allocate(key, &mut self.notes);
                transport.send_midi(&MidiMessage::NoteOn(channel, note, velocity))?;
                self.notes
                    .activate(NoteState::new(key, note, channel, velocity, expression, now));
            }
            MidiEvent::PressureRelease { key } => {
                if let Some(state) = self.notes.active(key) {
                    transport.send_midi(&MidiMessage::ChannelPressure(state.channel, U7::from_u8_lossy(0)))?;
                }
            }
            MidiEvent::NoteOff { key, velocity } => {
                let sent = match self.notes.active(key) {
                    Some(state) => transport.send_midi(&MidiMessage::NoteOff(state.channel, state.note, velocity)),
                    None => Ok(()),
                };
                self.pool.release(key, &mut self.notes);
                sent?;
            }
            MidiEvent::Retrigger { key, note } => {
                if let Some(state) = self.notes.active_mut(key) {
                    retrigger(state, note, transport)?;
                }
            }
            MidiEvent::PressureUpdate { key, pressure } => {
                if let Some(state) = self.notes.active_mut(key) {
                    if state.channel_pressure != pressure {
                        transport.send_midi(&MidiMessage::ChannelPressure(state.channel, pressure))?;
                        state.channel_pressure = pressure;
                    }
                }
            }
            MidiEvent::PitchBendUpdate { key, bend } => {
                if let Some(state) = self.notes.active_mut(key) {
                    if state.pitch_bend != bend {
                        transport.send_midi(&MidiMessage::PitchBendChange(state.channel, bend))?;
                        state.pitch_bend = bend;
                    }
                }
            }
            MidiEvent::ControlChange { control, value } => {
                transport.send_midi(&MidiMessage::ControlChange(MASTER_CHANNEL, control, value))?;
            }
        }
        Ok(())
    }
}

/// Re-voices a sounding note at a new pitch, restoring its expression if the key is still pressed.
fn retrigger<T: Transport>(state: &mut NoteState, note: Note, transport: &mut T) -> Result<(), Error> {
    let channel: Channel = state.channel;
    transport.send_midi(&MidiMessage::NoteOff(channel, state.note, U7::from_u8_lossy(0)))?;
    transport.send_midi(&MidiMessage::NoteOn(channel, note, state.velocity))?;
    state.note = note;
    if state.pressure > 0.0 {
        transport.send_midi(&MidiMessage::ChannelPressure(channel, state.channel_pressure))?;
        transport.send_midi(&MidiMessage::PitchBendChange(channel, state.pitch_bend))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::tests::MockTransport;
    use embassy_time::Duration;

    fn at(ms: u64) -> Instant {
        Instant::from_millis(ms)
    }

    fn sequencer() -> Sequencer {
        Sequencer::new(Settings::default(), CcAssignments::default())
    }

    fn touch(key: KeyId, pressure: f32) -> KeyChange {
        KeyChange {
            key,
            position: 0.0,
            pressure,
            strike_velocity: None,
        }
    }

    /// Touches `key` and waits out the velocity window so the note sounds.
    fn strike(sequencer: &mut Sequencer, transport: &mut MockTransport, key: KeyId, now: Instant) -> Events {
        sequencer.update(&[touch(key, 0.5)], &[], now, transport).unwrap();
        sequencer
            .update(&[], &[], now + Duration::from_millis(10), transport)
            .unwrap()
    }

    fn assert_class_order(events: &[MidiEvent]) {
        assert!(
            events.windows(2).all(|pair| pair[0].class() <= pair[1].class()),
            "Events out of class order: {events:?}"
        );
    }

    #[test]
    fn touch_waits_for_velocity_window() {
        let mut sequencer = sequencer();
        let mut transport = MockTransport::default();

        let events = sequencer
            .update(&[touch(0, 0.2)], &[], at(0), &mut transport)
            .unwrap();
        assert!(events.is_empty(), "No note should start on first contact");
        assert!(sequencer.has_pending(), "Velocity window should be open");

        // a firmer reading inside the window sets the velocity
        sequencer
            .update(&[touch(0, 0.6)], &[], at(5), &mut transport)
            .unwrap();
        assert!(transport.sent.is_empty(), "Still inside the window");

        let events = sequencer.update(&[], &[], at(10), &mut transport).unwrap();
        assert_eq!(3, events.len(), "Expected left but got right");
        assert!(matches!(events[0], MidiEvent::PressureInit { key: 0, .. }));
        assert!(matches!(events[1], MidiEvent::PitchBendInit { key: 0, .. }));
        assert!(
            matches!(events[2], MidiEvent::NoteOn { key: 0, note: Note::C4, velocity, .. } if u8::from(velocity) == 76),
            "Expected a note-on at 76 but got {:?}",
            events[2]
        );

        assert_eq!(
            [0xD1, 76, 0xE1, 0x00, 0x40, 0x91, 60, 76].as_slice(),
            transport.sent.as_slice(),
            "Pressure and bend should precede the note-on; expected left but got right"
        );
        assert_eq!(1, sequencer.notes().active_count(), "Expected left but got right");
    }

    #[test]
    fn release_within_window_is_silent() {
        let mut sequencer = sequencer();
        let mut transport = MockTransport::default();

        sequencer
            .update(&[touch(4, 0.3)], &[], at(0), &mut transport)
            .unwrap();
        let events = sequencer
            .update(&[touch(4, 0.0)], &[], at(5), &mut transport)
            .unwrap();
        assert!(events.is_empty(), "Expected no events but got {events:?}");

        let events = sequencer.update(&[], &[], at(20), &mut transport).unwrap();
        assert!(events.is_empty(), "Discarded touch should never sound");
        assert!(transport.sent.is_empty(), "Nothing should have been sent");
        assert!(!sequencer.has_pending(), "Window should be closed");
    }

    #[test]
    fn release_zeroes_pressure_before_note_off() {
        let mut sequencer = sequencer();
        let mut transport = MockTransport::default();
        strike(&mut sequencer, &mut transport, 2, at(0));
        transport.take_sent();

        let events = sequencer
            .update(&[touch(2, 0.0)], &[], at(100), &mut transport)
            .unwrap();
        assert_eq!(
            [MidiEvent::PressureRelease { key: 2 }, MidiEvent::NoteOff {
                key: 2,
                velocity: U7::from_u8_lossy(0)
            }]
            .as_slice(),
            events.as_slice(),
            "Expected left but got right"
        );
        assert_eq!(
            [0xD1, 0, 0x81, 62, 0].as_slice(),
            transport.sent.as_slice(),
            "Expected left but got right"
        );
        assert_eq!(14, sequencer.pool().available(), "Channel should be returned");
    }

    #[test]
    fn failed_release_still_frees_channel() {
        let mut sequencer = sequencer();
        let mut transport = MockTransport::default();
        strike(&mut sequencer, &mut transport, 0, at(0));
        assert_eq!(13, sequencer.pool().available(), "Expected left but got right");

        transport.fail_writes = true;
        let result = sequencer.update(&[touch(0, 0.0)], &[], at(100), &mut transport);
        assert_eq!(
            Some(Error::Transport(crate::TransportError::Write)),
            result.err(),
            "Expected left but got right"
        );
        assert!(sequencer.notes().active(0).is_none(), "Released note should not stay active");
        assert_eq!(14, sequencer.pool().available(), "Channel should be returned; expected left but got right");

        transport.fail_writes = false;
        strike(&mut sequencer, &mut transport, 1, at(200));
        transport.fail_writes = true;
        let note_off = [MidiEvent::NoteOff {
            key: 1,
            velocity: U7::from_u8_lossy(0),
        }];
        assert!(
            sequencer.transmit(&note_off, &mut transport, at(300)).is_err(),
            "Failed write should still be reported"
        );
        assert!(sequencer.notes().active(1).is_none(), "Released note should not stay active");
        assert_eq!(14, sequencer.pool().available(), "Channel should be returned; expected left but got right");
    }

    #[test]
    fn fast_release_has_velocity() {
        let mut sequencer = sequencer();
        let mut transport = MockTransport::default();
        strike(&mut sequencer, &mut transport, 0, at(0));

        sequencer
            .update(&[touch(0, 0.8)], &[], at(20), &mut transport)
            .unwrap();
        sequencer
            .update(&[touch(0, 0.2)], &[], at(70), &mut transport)
            .unwrap();
        let events = sequencer
            .update(&[touch(0, 0.0)], &[], at(71), &mut transport)
            .unwrap();

        let Some(MidiEvent::NoteOff { velocity, .. }) = events.last() else {
            panic!("Expected a note-off but got {events:?}");
        };
        assert!(
            u8::from(*velocity) > 0,
            "A sharp release should have a non-zero velocity"
        );
    }

    #[test]
    fn steady_pressure_is_not_resent() {
        let mut sequencer = sequencer();
        let mut transport = MockTransport::default();
        strike(&mut sequencer, &mut transport, 0, at(0));
        transport.take_sent();

        sequencer
            .update(&[touch(0, 0.5)], &[], at(20), &mut transport)
            .unwrap();
        assert!(
            transport.sent.is_empty(),
            "Unchanged pressure and bend should not be sent again"
        );

        sequencer
            .update(&[touch(0, 0.7)], &[], at(30), &mut transport)
            .unwrap();
        assert_eq!(
            [0xD1, 88].as_slice(),
            transport.sent.as_slice(),
            "Only the changed pressure should be sent; expected left but got right"
        );
    }

    #[test]
    fn mixed_batch_is_ordered_by_class() {
        let mut sequencer = sequencer();
        let mut transport = MockTransport::default();
        strike(&mut sequencer, &mut transport, 0, at(0));
        strike(&mut sequencer, &mut transport, 1, at(0));
        sequencer
            .update(&[touch(2, 0.4)], &[], at(20), &mut transport)
            .unwrap();

        let events = sequencer
            .sequence(
                &[touch(0, 0.9), touch(1, 0.0)],
                &[PotChange {
                    pot: 0,
                    previous: 0.0,
                    value: 1.0,
                }],
                at(40),
            )
            .unwrap();
        assert_class_order(&events);
        assert_eq!(
            [
                EventClass::Preamble,
                EventClass::Preamble,
                EventClass::Preamble,
                EventClass::Articulation,
                EventClass::Articulation,
                EventClass::Expression,
                EventClass::Expression,
                EventClass::Expression,
            ]
            .as_slice(),
            events.iter().map(MidiEvent::class).collect::<heapless::Vec<_, 8>>().as_slice(),
            "Expected left but got right"
        );
        assert_eq!(
            Some(&MidiEvent::ControlChange {
                control: ControlFunction(U7::from_u8_lossy(74)),
                value: U7::from_u8_lossy(127)
            }),
            events.last(),
            "Pots should come last; expected left but got right"
        );
    }

    #[test]
    fn pots_follow_live_assignments() {
        let mut sequencer = sequencer();
        let mut transport = MockTransport::default();
        sequencer.apply_cc_config("cc:3=20:Drive").unwrap();

        sequencer
            .update(
                &[],
                &[PotChange {
                    pot: 3,
                    previous: 0.0,
                    value: 0.5,
                }],
                at(0),
                &mut transport,
            )
            .unwrap();
        assert_eq!(
            [0xB0, 20, 63].as_slice(),
            transport.sent.as_slice(),
            "Expected left but got right"
        );

        sequencer.reset_cc_assignments();
        transport.take_sent();
        sequencer
            .update(
                &[],
                &[PotChange {
                    pot: 3,
                    previous: 0.5,
                    value: 0.5,
                }],
                at(10),
                &mut transport,
            )
            .unwrap();
        assert_eq!(
            [0xB0, 75, 63].as_slice(),
            transport.sent.as_slice(),
            "Expected left but got right"
        );
    }

    #[test]
    fn octave_shift_retriggers_sounding_notes() {
        let mut sequencer = sequencer();
        let mut transport = MockTransport::default();
        strike(&mut sequencer, &mut transport, 0, at(0));
        transport.take_sent();

        let events = sequencer.shift_octave(1).unwrap();
        assert_eq!(1, sequencer.octave(), "Expected left but got right");
        assert_eq!(3, events.len(), "Expected left but got right");
        assert!(matches!(
            events[2],
            MidiEvent::Retrigger {
                key: 0,
                note: Note::C5
            }
        ));

        sequencer.transmit(&events, &mut transport, at(20)).unwrap();
        assert_eq!(
            [
                0xD1, 63, // pressure init
                0xE1, 0x00, 0x40, // bend init
                0x81, 60, 0, // old pitch off
                0x91, 72, 63, // new pitch on, same channel
                0xD1, 63, // pressure restored
                0xE1, 0x00, 0x40, // bend restored
            ]
            .as_slice(),
            transport.sent.as_slice(),
            "Expected left but got right"
        );
        assert_eq!(
            Note::C5,
            sequencer.notes().active(0).unwrap().note,
            "Expected left but got right"
        );
    }

    #[test]
    fn octave_shift_stops_at_limit() {
        let mut sequencer = sequencer();
        for _ in 0..3 {
            sequencer.shift_octave(-1).unwrap();
        }
        assert_eq!(-3, sequencer.octave(), "Expected left but got right");

        let mut transport = MockTransport::default();
        strike(&mut sequencer, &mut transport, 0, at(0));
        let events = sequencer.shift_octave(-1).unwrap();
        assert!(events.is_empty(), "Shifting past the limit should do nothing");
        assert_eq!(-3, sequencer.octave(), "Expected left but got right");
        assert_eq!(
            Note::C1,
            sequencer.midi_note(0),
            "Expected left but got right"
        );
    }

    #[test]
    fn absolute_octave_is_clamped() {
        let mut sequencer = sequencer();
        sequencer.set_octave(7).unwrap();
        assert_eq!(3, sequencer.octave(), "Expected left but got right");
    }

    #[test]
    fn fifteenth_note_reuses_oldest_channel() {
        let mut sequencer = sequencer();
        let mut transport = MockTransport::default();
        for key in 0..14 {
            strike(&mut sequencer, &mut transport, key, at(u64::from(key) * 20));
        }
        transport.take_sent();

        strike(&mut sequencer, &mut transport, 14, at(400));
        assert_eq!(
            [0xD1, 63, 0xE1, 0x00, 0x40, 0x91, 74, 63].as_slice(),
            transport.sent.as_slice(),
            "New note should take channel 2 from key 0; expected left but got right"
        );
        assert!(sequencer.notes().active(0).is_none(), "Key 0 should be stolen");
        assert_eq!(14, sequencer.notes().active_count(), "Expected left but got right");

        // the stolen key's release is a no-op on the wire
        transport.take_sent();
        sequencer
            .update(&[touch(0, 0.0)], &[], at(500), &mut transport)
            .unwrap();
        assert!(transport.sent.is_empty(), "Stolen note should not be released again");
    }

    #[test]
    fn chime_is_voiced_like_a_key() {
        let mut sequencer = sequencer();
        let mut transport = MockTransport::default();
        let events = sequencer
            .chime(ChimeStep::Strike {
                note: Note::C4,
                velocity: U7::from_u8_lossy(76),
            })
            .unwrap();
        assert_class_order(&events);
        sequencer.transmit(&events, &mut transport, at(0)).unwrap();
        assert_eq!(
            [0xB1, 74, 64, 0xD1, 95, 0xE1, 0x00, 0x40, 0x91, 60, 76].as_slice(),
            transport.take_sent().as_slice(),
            "Expected left but got right"
        );

        let events = sequencer.chime(ChimeStep::Release).unwrap();
        sequencer.transmit(&events, &mut transport, at(200)).unwrap();
        assert_eq!(
            [0xD1, 0, 0x81, 60, 0].as_slice(),
            transport.sent.as_slice(),
            "Expected left but got right"
        );
        assert_eq!(14, sequencer.pool().available(), "Expected left but got right");
    }

    #[test]
    fn silence_stops_everything() {
        let mut sequencer = sequencer();
        let mut transport = MockTransport::default();
        strike(&mut sequencer, &mut transport, 0, at(0));
        sequencer
            .update(&[touch(1, 0.4)], &[], at(20), &mut transport)
            .unwrap();
        transport.take_sent();

        sequencer.silence(&mut transport).unwrap();
        assert_eq!(
            [0x81, 60, 0, 0xB0, 123, 0].as_slice(),
            transport.sent.as_slice(),
            "Expected left but got right"
        );
        assert_eq!(0, sequencer.notes().active_count(), "Expected left but got right");
        assert!(!sequencer.has_pending(), "Open windows should be dropped");
        assert_eq!(14, sequencer.pool().available(), "Expected left but got right");
    }

    #[test]
    fn bend_follows_position_and_curve() {
        let mut sequencer = sequencer();
        assert_eq!(8192, u16::from(pitch_bend_center()), "Expected left but got right");
        assert_eq!(pitch_bend_center(), sequencer.bend_value(0.0), "Expected left but got right");
        assert_eq!(
            U14::MAX,
            sequencer.bend_value(1.0),
            "Expected left but got right"
        );
        assert_eq!(U14::MIN, sequencer.bend_value(-1.5), "Expected left but got right");

        let linear = u16::from(sequencer.bend_value(0.5));
        sequencer.set_bend_curve(ResponseCurve::Hard);
        let hard = u16::from(sequencer.bend_value(0.5));
        assert!(hard > linear, "A harder curve should bend further");
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let mut sequencer = sequencer();
        let events = sequencer
            .sequence(&[touch(KEY_SLOTS as KeyId, 0.5), touch(CHIME_KEY, 0.5)], &[], at(0))
            .unwrap();
        assert!(events.is_empty(), "Expected no events but got {events:?}");
        assert!(!sequencer.has_pending(), "Nothing should be pending");
    }
}
