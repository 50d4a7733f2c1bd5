//! Everything that travels over the shared serial line: the [`Transport`] abstraction, text framing, and the
//! handshake session.
//!
//! MIDI and text share one wire. Text messages are newline-terminated UTF-8 lines; the remote device tells them apart
//! from MIDI by the absence of status bytes.

mod framer;
pub use framer::*;

mod session;
pub use session::*;

use wmidi::MidiMessage;

use crate::TransportError;

/// Line rate of the link, in baud.
pub const BAUD_RATE: u32 = 31_250;

/// Greeting sent by the remote device to open a session.
pub const HELLO: &str = "hello";

/// Heartbeat markers the remote device sends to keep a session alive. Either may carry a variation selector.
pub const HEARTBEATS: [char; 2] = ['♥', '♡'];

/// Control number of the handshake reply.
pub const HANDSHAKE_CC: u8 = 119;

/// Value of the handshake reply.
pub const HANDSHAKE_VALUE: u8 = 42;

/// A bidirectional byte link to the remote device.
pub trait Transport {
    /// Writes `bytes` to the link.
    fn send_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Copies whatever bytes are already waiting into `buffer` without blocking, returning how many were copied.
    fn receive_available_bytes(&mut self, buffer: &mut [u8]) -> Result<usize, TransportError>;

    /// Discards any inbound bytes not yet read.
    fn flush_input(&mut self);

    /// Encodes `message` and writes it to the link.
    fn send_midi(&mut self, message: &MidiMessage<'_>) -> Result<(), TransportError> {
        let mut bytes = [0_u8; 3];
        let len = message
            .copy_to_slice(&mut bytes)
            .map_err(|_| TransportError::Encode)?;
        trace!("MIDI out: {}", &bytes[..len]);
        self.send_bytes(&bytes[..len])
    }
}

/// Returns `true` if `message` is one of the heartbeat markers.
pub fn is_heartbeat(message: &str) -> bool {
    message.starts_with(HEARTBEATS)
}
