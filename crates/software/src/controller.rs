//! The control loop: one [`Bartleby::tick`] per loop period moves data from the link and the panel through the
//! session and the sequencer.

use embassy_time::Instant;
use wmidi::{ControlFunction, MidiMessage, U7};

use crate::Error;
use crate::cc_config::CcAssignments;
use crate::configuration::{ResponseCurve, Settings};
use crate::link::{
    HANDSHAKE_CC, HANDSHAKE_VALUE, MessageFramer, MessageWriter, Operation, Session, Transport, WriteStatus,
};
use crate::mpe::{Chime, MASTER_CHANNEL, Sequencer, zone_setup};
use crate::panel::{Hardware, PotChange, PotChanges};

/// Index of the encoder that shifts octaves.
pub const OCTAVE_ENCODER: usize = 0;

const RECEIVE_CHUNK: usize = 64;

/// Upper bound on link reads per tick, so a flooded link cannot starve the keys.
const MAX_RECEIVE_CHUNKS: usize = 8;

/// The whole controller, generic over how it reaches the link and the panel.
pub struct Bartleby<T, H> {
    transport: T,
    hardware: H,
    settings: Settings,
    framer: MessageFramer,
    writer: MessageWriter,
    session: Session,
    sequencer: Sequencer,
    chime: Option<Chime>,
    encoder_position: i8,
}

impl<T: Transport, H: Hardware> Bartleby<T, H> {
    /// Assembles the controller. Nothing is sent until [`start`](Self::start).
    pub fn new(transport: T, hardware: H, settings: Settings, now: Instant) -> Self {
        Self {
            transport,
            hardware,
            settings,
            framer: MessageFramer::new(),
            writer: MessageWriter::new(settings.message_gap),
            session: Session::new(settings.communication_timeout, now),
            sequencer: Sequencer::new(settings, CcAssignments::default()),
            chime: None,
            encoder_position: 0,
        }
    }

    /// Returns the handshake session.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Returns the sequencer.
    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    /// Returns the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Returns the transport mutably.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Returns the hardware mutably.
    pub fn hardware_mut(&mut self) -> &mut H {
        &mut self.hardware
    }

    /// Returns `true` while the greeting chime is playing. Key input is held off until it finishes.
    pub fn is_chiming(&self) -> bool {
        self.chime.is_some()
    }

    /// Changes the curve applied to key pressure.
    pub fn set_pressure_curve(&mut self, curve: ResponseCurve) {
        self.settings.pressure_curve = curve;
        self.sequencer.set_pressure_curve(curve);
    }

    /// Announces the MPE zone and schedules the greeting chime.
    pub fn start(&mut self, now: Instant) -> Result<(), Error> {
        info!("Announcing MPE zone");
        for message in zone_setup(&self.settings)? {
            if let Err(e) = self.transport.send_midi(&message) {
                warn!("Zone setup interrupted: {}", e);
                break;
            }
        }
        self.encoder_position = self.hardware.encoder_position(OCTAVE_ENCODER);
        self.chime = Some(Chime::new(now));
        Ok(())
    }

    /// Runs one iteration of the control loop.
    ///
    /// Every fault except [`Error::Exhausted`] is logged and recovered from here; link faults drop the connection.
    pub fn tick(&mut self, now: Instant) -> Result<(), Error> {
        if self.play_chime(now)? {
            return Ok(());
        }

        if let Err(e) = self.session.check_timeout(now) {
            self.recover(e, now)?;
        }
        self.service_link(now)?;
        self.service_controls(now)
    }

    /// Writes a text message to the remote device, unless the previous one was too recent.
    pub fn send_text(&mut self, message: &str, now: Instant) -> Result<WriteStatus, Error> {
        Ok(self.writer.write(&mut self.transport, message, now)?)
    }

    /// Silences every note, drops the connection, and discards pending input.
    pub fn cleanup(&mut self, now: Instant) {
        info!("Cleaning up");
        if let Err(e) = self.sequencer.silence(&mut self.transport) {
            warn!("Could not silence notes: {}", e);
        }
        self.chime = None;
        self.reset_connection(now);
        self.framer.clear();
    }

    /// Logs a recoverable fault, resetting the connection if the link is implicated.
    fn recover(&mut self, error: Error, now: Instant) -> Result<(), Error> {
        match error {
            Error::Exhausted => {
                error!("{}", error);
                Err(error)
            }
            Error::Transport(_) | Error::Timeout => {
                warn!("{}; resetting connection", error);
                self.reset_connection(now);
                Ok(())
            }
            Error::Framing(_) | Error::ConfigParse(_) => {
                warn!("{}", error);
                Ok(())
            }
        }
    }

    fn reset_connection(&mut self, now: Instant) {
        let operation = self.session.reset(now);
        if operation.contains(Operation::FlushTransport) {
            self.transport.flush_input();
        }
        self.sequencer.reset_cc_assignments();
    }

    /// Plays any due chime step. Returns `true` while the chime is still running.
    fn play_chime(&mut self, now: Instant) -> Result<bool, Error> {
        let Some(chime) = self.chime.as_mut() else {
            return Ok(false);
        };
        let step = chime.poll(now);
        let finished = chime.is_finished();

        if let Some(step) = step {
            let events = self.sequencer.chime(step)?;
            if let Err(e) = self.sequencer.transmit(&events, &mut self.transport, now) {
                self.recover(e, now)?;
            }
        }
        if finished {
            debug!("Chime finished");
            self.chime = None;
        }
        Ok(!finished)
    }

    fn service_link(&mut self, now: Instant) -> Result<(), Error> {
        let mut chunk = [0_u8; RECEIVE_CHUNK];
        for _ in 0..MAX_RECEIVE_CHUNKS {
            let received = match self.transport.receive_available_bytes(&mut chunk) {
                Ok(received) => received,
                Err(e) => return self.recover(e.into(), now),
            };
            if received == 0 {
                break;
            }

            if let Err(e) = self.framer.push(&chunk[..received]) {
                self.recover(e.into(), now)?;
            }
            loop {
                match self.framer.next_message() {
                    Ok(Some(message)) => self.handle_message(&message, now)?,
                    Ok(None) => break,
                    Err(e) => self.recover(e.into(), now)?,
                }
            }

            if received < chunk.len() {
                break;
            }
        }
        Ok(())
    }

    fn handle_message(&mut self, message: &str, now: Instant) -> Result<(), Error> {
        let operation = self.session.handle_message(message, now);

        if operation.contains(Operation::FlushTransport) {
            self.transport.flush_input();
        }
        if operation.contains(Operation::SendHandshake) {
            if let Err(e) = self.send_handshake() {
                return self.recover(e, now);
            }
        }
        if operation.contains(Operation::ForwardConfig) {
            if let Err(e) = self.sequencer.apply_cc_config(message) {
                self.recover(e.into(), now)?;
            }
        }
        if operation.contains(Operation::PushSnapshot) {
            self.push_snapshot(now)?;
        }
        Ok(())
    }

    fn send_handshake(&mut self) -> Result<(), Error> {
        debug!("Sending handshake");
        self.transport.send_midi(&MidiMessage::ControlChange(
            MASTER_CHANNEL,
            ControlFunction(U7::from_u8_lossy(HANDSHAKE_CC)),
            U7::from_u8_lossy(HANDSHAKE_VALUE),
        ))?;
        Ok(())
    }

    /// Brings the remote device up to date: the announced mapping goes live, then every pot's value and the octave are
    /// sent.
    fn push_snapshot(&mut self, now: Instant) -> Result<(), Error> {
        info!("Sending controller snapshot");
        let config = self.session.cc_mapping().to_message()?;
        if let Err(e) = self.sequencer.apply_cc_config(&config) {
            self.recover(e.into(), now)?;
        }

        let pots: PotChanges = self
            .hardware
            .read_all_pots()
            .iter()
            .map(|reading| PotChange {
                pot: reading.pot,
                previous: 0.0,
                value: reading.value,
            })
            .collect();
        if let Err(e) = self.sequencer.update(&[], &pots, now, &mut self.transport) {
            return self.recover(e, now);
        }

        let position = self.hardware.encoder_position(OCTAVE_ENCODER);
        self.encoder_position = position;
        let result = self
            .sequencer
            .set_octave(position)
            .and_then(|events| self.sequencer.transmit(&events, &mut self.transport, now));
        if let Err(e) = result {
            self.recover(e, now)?;
        }
        Ok(())
    }

    fn service_controls(&mut self, now: Instant) -> Result<(), Error> {
        let position = self.hardware.encoder_position(OCTAVE_ENCODER);
        let delta = position.saturating_sub(self.encoder_position);
        if delta != 0 {
            self.encoder_position = position;
            let result = self
                .sequencer
                .shift_octave(delta)
                .and_then(|events| self.sequencer.transmit(&events, &mut self.transport, now));
            if let Err(e) = result {
                self.recover(e, now)?;
            }
        }

        let keys = self.hardware.read_changed_keys();
        let pots = self.hardware.read_changed_pots();
        if keys.is_empty() && pots.is_empty() && !self.sequencer.has_pending() {
            return Ok(());
        }
        if let Err(e) = self.sequencer.update(&keys, &pots, now, &mut self.transport) {
            self.recover(e, now)?;
        }
        Ok(())
    }
}
