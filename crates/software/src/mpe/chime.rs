use embassy_time::{Duration, Instant};
use wmidi::{Note, U7};

/// Pressure each chime note is voiced with.
pub const CHIME_PRESSURE: f32 = 0.75;

const CHIME_GAP: Duration = Duration::from_millis(50);

struct ChimeNote {
    note: Note,
    velocity: U7,
    hold: Duration,
}

/// A rising C major arpeggio, played once at startup so the player knows the link to the synthesizer works.
const CHIME: [ChimeNote; 4] = [
    ChimeNote {
        note: Note::C4,
        velocity: U7::from_u8_lossy(76),
        hold: Duration::from_millis(200),
    },
    ChimeNote {
        note: Note::E4,
        velocity: U7::from_u8_lossy(88),
        hold: Duration::from_millis(200),
    },
    ChimeNote {
        note: Note::G4,
        velocity: U7::from_u8_lossy(101),
        hold: Duration::from_millis(200),
    },
    ChimeNote {
        note: Note::C5,
        velocity: U7::from_u8_lossy(114),
        hold: Duration::from_millis(400),
    },
];

/// What the chime wants played right now.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ChimeStep {
    /// Start the next note.
    Strike {
        /// Pitch of the note.
        note: Note,
        /// Note-on velocity.
        velocity: U7,
    },
    /// Stop the sounding note.
    Release,
}

/// A not-before schedule for the greeting chime, polled from the control loop instead of sleeping.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Chime {
    next: usize,
    sounding: bool,
    due: Instant,
}

impl Chime {
    /// Schedules the chime to begin at `start`.
    pub fn new(start: Instant) -> Self {
        Self {
            next: 0,
            sounding: false,
            due: start,
        }
    }

    /// Returns the step to play, if one is due.
    pub fn poll(&mut self, now: Instant) -> Option<ChimeStep> {
        if self.is_finished() || now < self.due {
            return None;
        }

        let current = &CHIME[self.next];
        if self.sounding {
            self.sounding = false;
            self.next += 1;
            self.due = now + CHIME_GAP;
            Some(ChimeStep::Release)
        } else {
            self.sounding = true;
            self.due = now + current.hold;
            Some(ChimeStep::Strike {
                note: current.note,
                velocity: current.velocity,
            })
        }
    }

    /// Returns `true` once every note has been struck and released.
    pub fn is_finished(&self) -> bool {
        self.next >= CHIME.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plays_arpeggio_on_schedule() {
        let mut chime = Chime::new(Instant::from_millis(0));
        let mut now = Instant::from_millis(0);
        let mut struck = [Note::A0; 4];
        let mut strikes = 0;

        while !chime.is_finished() {
            match chime.poll(now) {
                Some(ChimeStep::Strike { note, .. }) => {
                    struck[strikes] = note;
                    strikes += 1;
                }
                Some(ChimeStep::Release) => {}
                None => {}
            }
            now += Duration::from_millis(1);
        }

        assert_eq!(
            [Note::C4, Note::E4, Note::G4, Note::C5],
            struck,
            "Expected left but got right"
        );
        // 200 + 200 + 200 + 400 ms held with three 50 ms gaps between
        assert_eq!(
            Instant::from_millis(1_151),
            now,
            "Expected left but got right"
        );
    }

    #[test]
    fn waits_until_due() {
        let mut chime = Chime::new(Instant::from_millis(100));
        assert_eq!(None, chime.poll(Instant::from_millis(99)), "Expected left but got right");
        assert!(
            matches!(chime.poll(Instant::from_millis(100)), Some(ChimeStep::Strike { .. })),
            "First note should strike once due"
        );
        assert_eq!(None, chime.poll(Instant::from_millis(299)), "Note should still be held");
        assert_eq!(
            Some(ChimeStep::Release),
            chime.poll(Instant::from_millis(300)),
            "Expected left but got right"
        );
    }
}
