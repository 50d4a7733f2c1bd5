use embassy_time::{Duration, Instant};

use super::Transport;
use crate::{FramingError, TransportError};

/// Byte that terminates a text message.
pub const DELIMITER: u8 = b'\n';

/// Maximum length of a single text message, in bytes.
pub const MESSAGE_CAPACITY: usize = 512;

/// Number of undelimited bytes the framer holds before giving up on them.
pub const FRAME_CAPACITY: usize = 2 * MESSAGE_CAPACITY;

/// A complete, trimmed text message.
pub type Message = heapless::String<MESSAGE_CAPACITY>;

/// Reassembles newline-delimited text messages from arbitrarily chunked link bytes.
#[derive(Debug, Default)]
pub struct MessageFramer {
    buffer: heapless::Vec<u8, FRAME_CAPACITY>,
}

impl MessageFramer {
    /// Creates an empty framer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends received bytes. If they do not fit, everything accumulated so far is dropped.
    pub fn push(&mut self, bytes: &[u8]) -> Result<(), FramingError> {
        if self.buffer.extend_from_slice(bytes).is_err() {
            warn!("Dropping {} buffered bytes on overflow", self.buffer.len());
            self.buffer.clear();
            return Err(FramingError::Overflow);
        }
        Ok(())
    }

    /// Pops the next complete message, if one has been delimited.
    ///
    /// Leading and trailing whitespace is trimmed and empty messages are skipped. Bytes after the delimiter stay
    /// buffered for the next call. If the message is not valid UTF-8 the whole buffer is dropped, so a corrupt
    /// stream resynchronizes on the next delimiter.
    pub fn next_message(&mut self) -> Result<Option<Message>, FramingError> {
        while let Some(end) = self.buffer.iter().position(|&byte| byte == DELIMITER) {
            let message = match core::str::from_utf8(&self.buffer[..end]) {
                Ok(text) => Message::try_from(text.trim()).map_err(|_| FramingError::Overflow),
                Err(_) => Err(FramingError::InvalidUtf8),
            };

            match message {
                Ok(message) => {
                    self.consume(end + 1);
                    if !message.is_empty() {
                        trace!("Text in: {}", message.as_str());
                        return Ok(Some(message));
                    }
                }
                Err(e) => {
                    warn!("Dropping {} buffered bytes: {}", self.buffer.len(), e);
                    self.buffer.clear();
                    return Err(e);
                }
            }
        }
        Ok(None)
    }

    /// Appends `bytes` and pops the next complete message, if any.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Option<Message>, FramingError> {
        self.push(bytes)?;
        self.next_message()
    }

    /// Returns the number of bytes waiting for a delimiter.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drops every buffered byte.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    fn consume(&mut self, len: usize) {
        let remaining = self.buffer.len() - len;
        self.buffer.rotate_left(len);
        self.buffer.truncate(remaining);
    }
}

/// Result of a throttled write attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WriteStatus {
    /// The message went out.
    Sent,
    /// The previous message was too recent; nothing was written. Try again at the given instant.
    NotBefore(Instant),
}

/// Writes text messages, keeping a minimum gap between consecutive writes so the remote parser is not overrun.
#[derive(Debug)]
pub struct MessageWriter {
    min_gap: Duration,
    last_write: Option<Instant>,
}

impl MessageWriter {
    /// Creates a writer that spaces messages at least `min_gap` apart.
    pub fn new(min_gap: Duration) -> Self {
        Self {
            min_gap,
            last_write: None,
        }
    }

    /// Returns the earliest instant the next message may go out.
    pub fn ready_at(&self) -> Option<Instant> {
        self.last_write.map(|at| at + self.min_gap)
    }

    /// Writes `message` followed by a [`DELIMITER`], unless the previous write was less than the minimum gap ago.
    pub fn write<T: Transport>(
        &mut self,
        transport: &mut T,
        message: &str,
        now: Instant,
    ) -> Result<WriteStatus, TransportError> {
        if let Some(ready_at) = self.ready_at().filter(|ready_at| now < *ready_at) {
            return Ok(WriteStatus::NotBefore(ready_at));
        }

        transport.send_bytes(message.as_bytes())?;
        if !message.as_bytes().ends_with(&[DELIMITER]) {
            transport.send_bytes(&[DELIMITER])?;
        }
        trace!("Text out: {}", message);
        self.last_write = Some(now);
        Ok(WriteStatus::Sent)
    }
}
