use bitmask_enum::bitmask;
use embassy_time::{Duration, Instant};

use super::{HELLO, is_heartbeat};
use crate::Error;
use crate::cc_config::{CONFIG_PREFIX, CcMapping, ParseOutcome};

/// Where the handshake with the remote device stands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectionState {
    /// No remote device; the keyboard plays on its own.
    #[default]
    Standalone,
    /// A greeting arrived and was answered; waiting for the first configuration.
    Handshaking,
    /// The remote device has configured the pots and is sending heartbeats.
    Connected,
}

/// Side effects the caller must carry out after a [`Session`] update.
#[bitmask(u8)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Operation {
    /// Discard unread inbound bytes on the link.
    FlushTransport,
    /// Send the handshake reply (CC 119 = 42 on the master channel).
    SendHandshake,
    /// Send the current state of every pot and the octave position so the remote device catches up.
    PushSnapshot,
    /// Apply the configuration message just handled to the live CC table.
    ForwardConfig,
}

/// The presence and configuration handshake with the remote device.
///
/// ```text
/// Standalone --hello--> Handshaking --cc:…--> Connected
///      ^                     |                    |
///      +------ timeout ------+------ timeout -----+
/// ```
///
/// Any inbound message refreshes the timeout; a session that stays silent for longer than the communication timeout
/// falls back to standalone and forgets its mapping.
#[derive(Debug)]
pub struct Session {
    state: ConnectionState,
    last_message: Instant,
    timeout: Duration,
    cc_mapping: CcMapping,
}

impl Session {
    /// Creates a standalone session.
    pub fn new(timeout: Duration, now: Instant) -> Self {
        Self {
            state: ConnectionState::Standalone,
            last_message: now,
            timeout,
            cc_mapping: CcMapping::new(),
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Returns `true` if the handshake has completed.
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Returns the CC mapping most recently announced by the remote device.
    pub fn cc_mapping(&self) -> &CcMapping {
        &self.cc_mapping
    }

    /// Returns the instant the last message arrived (or the session was last reset).
    pub fn last_message(&self) -> Instant {
        self.last_message
    }

    /// Advances the state machine with an inbound text message.
    pub fn handle_message(&mut self, message: &str, now: Instant) -> Operation {
        let mut operation = Operation::none();
        if message.is_empty() {
            return operation;
        }
        self.last_message = now;

        if message.starts_with(HELLO) {
            match self.state {
                ConnectionState::Standalone => {
                    info!("Remote device said hello; starting handshake");
                    self.state = ConnectionState::Handshaking;
                    operation |= Operation::FlushTransport | Operation::SendHandshake;
                }
                ConnectionState::Handshaking => {
                    debug!("Repeated hello; answering again");
                    operation |= Operation::SendHandshake;
                }
                ConnectionState::Connected => debug!("Ignoring hello while connected"),
            }
        } else if message.starts_with(CONFIG_PREFIX) {
            match self.state {
                ConnectionState::Handshaking => {
                    self.apply_mapping(message);
                    info!("Connected; {} pots mapped", self.cc_mapping.len());
                    self.state = ConnectionState::Connected;
                    operation |= Operation::PushSnapshot;
                }
                ConnectionState::Connected => {
                    self.apply_mapping(message);
                    info!("Configuration updated; {} pots mapped", self.cc_mapping.len());
                    operation |= Operation::ForwardConfig | Operation::PushSnapshot;
                }
                ConnectionState::Standalone => debug!("Ignoring configuration before hello"),
            }
        } else if is_heartbeat(message) {
            trace!("Heartbeat");
        } else {
            debug!("Ignoring unexpected message: {}", message);
        }

        operation
    }

    /// Reports [`Error::Timeout`] once the remote device has been silent for longer than the timeout.
    ///
    /// Never times out while standalone. The caller is expected to [`reset`](Self::reset) in response.
    pub fn check_timeout(&self, now: Instant) -> Result<(), Error> {
        let silence = now.saturating_duration_since(self.last_message);
        if self.state != ConnectionState::Standalone && silence > self.timeout {
            warn!("No message for {} ms; dropping connection", silence.as_millis());
            return Err(Error::Timeout);
        }
        Ok(())
    }

    /// Returns to standalone, forgetting the mapping.
    pub fn reset(&mut self, now: Instant) -> Operation {
        if self.state != ConnectionState::Standalone {
            info!("Returning to standalone");
        }
        self.state = ConnectionState::Standalone;
        self.last_message = now;
        self.cc_mapping.clear();
        Operation::FlushTransport
    }

    fn apply_mapping(&mut self, message: &str) {
        match CcMapping::parse(message) {
            Ok((mapping, outcome)) => {
                if let ParseOutcome::PartiallyParsed(skipped) = outcome {
                    warn!("Skipped {} malformed CC assignments", skipped);
                }
                self.cc_mapping = mapping;
            }
            Err(e) => warn!("Rejected configuration: {}", e),
        }
    }
}
