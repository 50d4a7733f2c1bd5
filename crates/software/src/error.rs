//! Faults the control loop can encounter.
//!
//! Apart from [`Error::Exhausted`], every variant is recoverable: the affected effect is skipped for the current
//! tick, the fault is logged, and the loop carries on.

use core::fmt;

/// Reasons a text message could not be reassembled from link bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FramingError {
    /// The bytes before a delimiter were not valid UTF-8. The entire accumulated buffer was discarded.
    InvalidUtf8,
    /// More bytes arrived than a message may hold. The entire accumulated buffer was discarded.
    Overflow,
}

/// Reasons a `cc:` configuration message, or one of its assignments, was rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigParseError {
    /// The message does not start with `cc:`.
    MissingPrefix,
    /// An assignment does not contain exactly one `=`.
    Arity,
    /// The pot index or CC number is not an integer.
    NotANumber,
    /// The pot index or CC number is outside the accepted range.
    OutOfRange,
    /// The display name does not fit in a [`CcName`](crate::cc_config::CcName).
    NameTooLong,
}

/// Reasons the link failed to move bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportError {
    /// Writing to the link failed.
    Write,
    /// Reading from the link failed.
    Read,
    /// A MIDI message could not be encoded into bytes.
    Encode,
}

/// Any fault surfaced by the control loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// See [`FramingError`].
    Framing(FramingError),
    /// See [`ConfigParseError`].
    ConfigParse(ConfigParseError),
    /// See [`TransportError`].
    Transport(TransportError),
    /// The remote device fell silent for longer than the communication timeout.
    Timeout,
    /// A fixed-capacity buffer overflowed. This is the one fault the control loop does not recover from.
    Exhausted,
}

impl From<FramingError> for Error {
    fn from(value: FramingError) -> Self {
        Self::Framing(value)
    }
}

impl From<ConfigParseError> for Error {
    fn from(value: ConfigParseError) -> Self {
        Self::ConfigParse(value)
    }
}

impl From<TransportError> for Error {
    fn from(value: TransportError) -> Self {
        Self::Transport(value)
    }
}

impl fmt::Display for FramingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidUtf8 => f.write_str("received non-UTF-8 data"),
            Self::Overflow => f.write_str("message exceeds buffer capacity"),
        }
    }
}

impl fmt::Display for ConfigParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingPrefix => f.write_str("missing `cc:` prefix"),
            Self::Arity => f.write_str("assignment must have the form pot=cc[:name]"),
            Self::NotANumber => f.write_str("pot and CC must be integers"),
            Self::OutOfRange => f.write_str("pot or CC out of range"),
            Self::NameTooLong => f.write_str("CC name too long"),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Write => f.write_str("link write failed"),
            Self::Read => f.write_str("link read failed"),
            Self::Encode => f.write_str("MIDI message could not be encoded"),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Framing(e) => write!(f, "framing error: {e}"),
            Self::ConfigParse(e) => write!(f, "config parse error: {e}"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Timeout => f.write_str("communication timeout"),
            Self::Exhausted => f.write_str("buffer capacity exhausted"),
        }
    }
}

impl core::error::Error for FramingError {}
impl core::error::Error for ConfigParseError {}
impl core::error::Error for TransportError {}
impl core::error::Error for Error {}
