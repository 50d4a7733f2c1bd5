//! Per-key note state, the pending-velocity window that precedes every note-on, and the release-velocity estimate
//! derived from how quickly pressure was decaying when a key let go.

use embassy_time::{Duration, Instant};
use num_traits::Float;
use tinyvec::ArrayVec;
use wmidi::{Channel, Note, U7, U14};

use super::{KEY_SLOTS, KeyId, TIMBRE_CENTER};

/// Number of pressure samples kept per note for release-velocity estimation.
pub const PRESSURE_HISTORY_SIZE: usize = 8;

/// One pressure reading and when it was taken.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PressureSample {
    /// Normalized pressure, `0.0..=1.0`.
    pub pressure: f32,
    /// When the reading was taken.
    pub at: Instant,
}

// tinyvec requires Default items
impl Default for PressureSample {
    fn default() -> Self {
        Self {
            pressure: 0.0,
            at: Instant::from_ticks(0),
        }
    }
}

/// The expression a note starts with.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Expression {
    /// Normalized pressure, `0.0..=1.0`.
    pub pressure: f32,
    /// Pressure as sent on the wire.
    pub channel_pressure: U7,
    /// Pitch bend as sent on the wire.
    pub pitch_bend: U14,
}

/// A sounding (or recently released) note.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NoteState {
    /// The key that played the note.
    pub key: KeyId,
    /// The pitch currently sounding.
    pub note: Note,
    /// The member channel carrying the note.
    pub channel: Channel,
    /// Note-on velocity.
    pub velocity: U7,
    /// When the note-on was sent.
    pub activated_at: Instant,
    /// Latest normalized pressure.
    pub pressure: f32,
    /// Last channel pressure sent.
    pub channel_pressure: U7,
    /// Last pitch bend sent.
    pub pitch_bend: U14,
    /// Last timbre sent.
    pub timbre: U7,
    active: bool,
    history: ArrayVec<[PressureSample; PRESSURE_HISTORY_SIZE]>,
}

impl NoteState {
    /// Creates an active note.
    pub fn new(
        key: KeyId,
        note: Note,
        channel: Channel,
        velocity: U7,
        expression: Expression,
        now: Instant,
    ) -> Self {
        Self {
            key,
            note,
            channel,
            velocity,
            activated_at: now,
            pressure: expression.pressure,
            channel_pressure: expression.channel_pressure,
            pitch_bend: expression.pitch_bend,
            timbre: TIMBRE_CENTER,
            active: true,
            history: ArrayVec::new(),
        }
    }

    /// Returns `true` until the note is released or stolen.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Returns the retained pressure samples, oldest first.
    pub fn history(&self) -> &[PressureSample] {
        &self.history
    }

    /// Records a new pressure reading, discarding the oldest once the window is full.
    pub fn update_pressure(&mut self, pressure: f32, now: Instant) {
        if self.history.len() == self.history.capacity() {
            self.history.remove(0);
        }
        self.history.push(PressureSample { pressure, at: now });
        self.pressure = pressure;
    }

    /// Estimates release velocity from the recent rate of pressure change.
    ///
    /// Rates between consecutive samples are averaged with weights `1 / (0.5 * n)` for the `n`th interval, so older
    /// intervals count more. Intervals with no elapsed time are ignored. Averages below `threshold` (normalized units
    /// per second) release silently; the rest are multiplied by `scale` and capped at 127.
    pub fn release_velocity(&self, threshold: f32, scale: f32) -> U7 {
        let (weighted, total_weight) = self.history.windows(2).enumerate().fold(
            (0.0, 0.0),
            |(weighted, total_weight), (i, pair)| {
                let elapsed =
                    pair[1].at.saturating_duration_since(pair[0].at).as_micros() as f32 / 1_000_000.0;
                if elapsed <= 0.0 {
                    return (weighted, total_weight);
                }
                let rate = (pair[1].pressure - pair[0].pressure).abs() / elapsed;
                let weight = 1.0 / ((i + 1) as f32 * 0.5);
                (weighted + rate * weight, total_weight + weight)
            },
        );

        if total_weight == 0.0 {
            return U7::from_u8_lossy(0);
        }
        let average = weighted / total_weight;
        if average < threshold {
            return U7::from_u8_lossy(0);
        }
        U7::from_u8_lossy((average * scale).round().min(127.0) as u8)
    }
}

/// A touch that has not yet become a note.
///
/// Sensor readings bounce for a few milliseconds after first contact, so the note-on waits for the velocity delay
/// and takes its velocity from the pressure at that point rather than the first reading.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PendingVelocity {
    /// Pressure at first contact.
    pub initial_pressure: f32,
    /// When first contact was made.
    pub started_at: Instant,
    /// The pitch the key played at first contact.
    pub note: Note,
    /// Latest normalized pressure.
    pub pressure: f32,
    /// Latest lateral position, `-1.0..=1.0`.
    pub position: f32,
}

impl PendingVelocity {
    /// Starts the velocity window for a new touch.
    pub fn new(pressure: f32, position: f32, note: Note, now: Instant) -> Self {
        Self {
            initial_pressure: pressure,
            started_at: now,
            note,
            pressure,
            position,
        }
    }

    /// Records a reading taken during the window.
    pub fn update(&mut self, pressure: f32, position: f32) {
        self.pressure = pressure;
        self.position = position;
    }

    /// Returns `true` once `delay` has elapsed since first contact.
    pub fn is_due(&self, now: Instant, delay: Duration) -> bool {
        now.saturating_duration_since(self.started_at) >= delay
    }

    /// Note-on velocity derived from the latest pressure. Never zero, which would read as a note-off.
    pub fn velocity(&self) -> U7 {
        let velocity = (self.pressure.clamp(0.0, 1.0) * 127.0) as u8;
        U7::from_u8_lossy(velocity.max(1))
    }
}

/// Note state for every key slot.
#[derive(Clone, Debug)]
pub struct NoteTracker {
    notes: [Option<NoteState>; KEY_SLOTS],
    pending: [Option<PendingVelocity>; KEY_SLOTS],
}

impl Default for NoteTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl NoteTracker {
    /// Creates a tracker with no notes.
    pub fn new() -> Self {
        Self {
            notes: [None; KEY_SLOTS],
            pending: [None; KEY_SLOTS],
        }
    }

    /// Starts tracking `state`, replacing whatever the key's slot held before.
    pub fn activate(&mut self, state: NoteState) {
        if let Some(slot) = self.notes.get_mut(usize::from(state.key)) {
            debug!(
                "Key {} on: note {}, channel {}",
                state.key,
                u8::from(state.note),
                state.channel.number()
            );
            *slot = Some(state);
        }
    }

    /// Marks the key's note as released. Its last state stays readable through [`get`](Self::get).
    pub fn deactivate(&mut self, key: KeyId) {
        if let Some(Some(state)) = self.notes.get_mut(usize::from(key)) {
            if state.active {
                debug!("Key {} off", key);
            }
            state.active = false;
        }
    }

    /// Returns the key's note, active or not.
    pub fn get(&self, key: KeyId) -> Option<&NoteState> {
        self.notes.get(usize::from(key)).and_then(Option::as_ref)
    }

    /// Returns the key's note if it is still active.
    pub fn active(&self, key: KeyId) -> Option<&NoteState> {
        self.get(key).filter(|state| state.active)
    }

    /// Returns the key's note mutably if it is still active.
    pub fn active_mut(&mut self, key: KeyId) -> Option<&mut NoteState> {
        self.notes
            .get_mut(usize::from(key))
            .and_then(Option::as_mut)
            .filter(|state| state.active)
    }

    /// Iterates over the active notes in key order.
    pub fn active_notes(&self) -> impl Iterator<Item = &NoteState> {
        self.notes.iter().flatten().filter(|state| state.active)
    }

    /// Returns the number of active notes.
    pub fn active_count(&self) -> usize {
        self.active_notes().count()
    }

    /// Opens a velocity window for the key, replacing any existing one.
    pub fn hold(&mut self, key: KeyId, pending: PendingVelocity) {
        if let Some(slot) = self.pending.get_mut(usize::from(key)) {
            *slot = Some(pending);
        }
    }

    /// Returns the key's open velocity window, if any.
    pub fn pending(&self, key: KeyId) -> Option<&PendingVelocity> {
        self.pending.get(usize::from(key)).and_then(Option::as_ref)
    }

    /// Returns the key's open velocity window mutably, if any.
    pub fn pending_mut(&mut self, key: KeyId) -> Option<&mut PendingVelocity> {
        self.pending.get_mut(usize::from(key)).and_then(Option::as_mut)
    }

    /// Closes the key's velocity window without producing a note.
    pub fn discard_pending(&mut self, key: KeyId) -> Option<PendingVelocity> {
        self.pending.get_mut(usize::from(key)).and_then(Option::take)
    }

    /// Closes and returns the key's velocity window if `delay` has elapsed.
    pub fn take_due(&mut self, key: KeyId, now: Instant, delay: Duration) -> Option<PendingVelocity> {
        let slot = self.pending.get_mut(usize::from(key))?;
        if slot.is_some_and(|pending| pending.is_due(now, delay)) {
            slot.take()
        } else {
            None
        }
    }

    /// Returns `true` if any key has an open velocity window.
    pub fn has_pending(&self) -> bool {
        self.pending.iter().any(Option::is_some)
    }
}
