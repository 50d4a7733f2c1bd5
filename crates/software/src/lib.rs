//! This crate contains architecture-agnostic logic for Bartleby, a split-keyboard controller that speaks
//! [MPE](https://midi.org/midi-polyphonic-expression-mpe-specification-adopted) to a companion synthesizer
//! ("Candide") over a single serial line. The same wire carries raw MIDI and a small line-oriented text protocol
//! used to negotiate presence and the potentiometer-to-CC mapping.
//!
//! The pieces, leaves first:
//! - [`link::MessageFramer`] reassembles text lines from link bytes; [`link::MessageWriter`] rate-limits text writes.
//! - [`cc_config`] parses and serializes the `cc:` assignment lists and holds the live CC table.
//! - [`mpe::ChannelPool`] hands out member channels, stealing the oldest when the zone is full.
//! - [`mpe::NoteTracker`] keeps per-key note state and estimates release velocity from pressure decay.
//! - [`mpe::Sequencer`] turns hardware deltas into correctly ordered MPE messages.
//! - [`link::Session`] runs the handshake state machine.
//! - [`panel`] turns raw key, pot, and encoder readings into changes.
//! - [`controller::Bartleby`] ties them together into one tick-driven control loop.

#![deny(missing_docs)]
#![no_std]

#[macro_use]
mod fmt;

mod error;
pub use error::*;

pub mod cc_config;
pub mod configuration;
pub mod controller;
pub mod link;
pub mod mpe;
pub mod panel;
