//! The `cc:` assignment protocol shared with the remote synthesizer, and the live table that decides which CC each
//! potentiometer sends.
//!
//! A configuration message looks like `cc:0=74:Cutoff,1=71,5=72:Resonance`: a comma-separated list of
//! `pot=cc[:name]` assignments behind a fixed prefix.

use core::fmt::Write;
use wmidi::{ControlFunction, U7};

use crate::ConfigParseError;
use crate::link::Message;

/// Prefix that marks a configuration message.
pub const CONFIG_PREFIX: &str = "cc:";

/// Number of potentiometers on the panel.
pub const POT_COUNT: usize = 14;

/// Maximum length of a CC display name, in bytes.
pub const CC_NAME_CAPACITY: usize = 24;

/// Human-readable label for a CC assignment.
pub type CcName = heapless::String<CC_NAME_CAPACITY>;

/// The CC each pot sends until the remote device says otherwise.
pub const DEFAULT_CC_ASSIGNMENTS: [ControlFunction; POT_COUNT] = [
    ControlFunction(U7::from_u8_lossy(74)), // brightness
    ControlFunction(U7::from_u8_lossy(71)), // harmonic content
    ControlFunction(U7::from_u8_lossy(73)), // attack
    ControlFunction(U7::from_u8_lossy(75)),
    ControlFunction(U7::from_u8_lossy(76)),
    ControlFunction(U7::from_u8_lossy(72)), // release
    ControlFunction(U7::from_u8_lossy(7)),  // volume
    ControlFunction(U7::from_u8_lossy(1)),  // modulation
    ControlFunction(U7::from_u8_lossy(20)),
    ControlFunction(U7::from_u8_lossy(21)),
    ControlFunction(U7::from_u8_lossy(22)),
    ControlFunction(U7::from_u8_lossy(23)),
    ControlFunction(U7::from_u8_lossy(24)),
    ControlFunction(U7::from_u8_lossy(25)),
];

/// How much of a configuration message was usable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParseOutcome {
    /// Every assignment was applied.
    Parsed,
    /// The given number of malformed assignments were skipped; the rest were applied.
    PartiallyParsed(usize),
}

impl ParseOutcome {
    fn from_skipped(skipped: usize) -> Self {
        match skipped {
            0 => Self::Parsed,
            n => Self::PartiallyParsed(n),
        }
    }
}

/// One pot's CC number and its display name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CcAssignment {
    /// The controller the pot drives.
    pub cc: U7,
    /// Label shown by the remote device. Defaults to `CC<n>`.
    pub name: CcName,
}

/// A parsed `pot=cc[:name]` assignment.
struct Assignment<'a> {
    pot: usize,
    cc: U7,
    name: Option<&'a str>,
}

/// Parses a single `pot=cc[:name]` assignment. The name is everything after the first `:`.
fn parse_assignment(assignment: &str) -> Result<Assignment<'_>, ConfigParseError> {
    let mut parts = assignment.split('=');
    let (Some(pot), Some(rest), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(ConfigParseError::Arity);
    };
    let (cc, name) = match rest.split_once(':') {
        Some((cc, name)) => (cc, Some(name)),
        None => (rest, None),
    };

    let pot: usize = pot
        .trim()
        .parse()
        .map_err(|_| ConfigParseError::NotANumber)?;
    let cc: u8 = cc.trim().parse().map_err(|_| ConfigParseError::NotANumber)?;
    if pot >= POT_COUNT {
        return Err(ConfigParseError::OutOfRange);
    }
    let cc = U7::new(cc).map_err(|_| ConfigParseError::OutOfRange)?;

    Ok(Assignment { pot, cc, name })
}

/// Splits a configuration message into its non-empty assignments.
fn assignments(message: &str) -> Result<impl Iterator<Item = &str>, ConfigParseError> {
    let body = message
        .strip_prefix(CONFIG_PREFIX)
        .ok_or(ConfigParseError::MissingPrefix)?;
    Ok(body.split(',').map(str::trim).filter(|a| !a.is_empty()))
}

/// The full pot → (CC, name) mapping as last announced by the remote device.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CcMapping {
    slots: [Option<CcAssignment>; POT_COUNT],
}

impl CcMapping {
    /// Creates an empty mapping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a mapping from a configuration message.
    ///
    /// Malformed assignments are skipped (and counted in the outcome) without affecting the others. Only a missing
    /// `cc:` prefix rejects the message as a whole.
    pub fn parse(message: &str) -> Result<(Self, ParseOutcome), ConfigParseError> {
        let mut mapping = Self::new();
        let mut skipped = 0;

        for assignment in assignments(message)? {
            let result = parse_assignment(assignment)
                .and_then(|parsed| mapping.insert(parsed.pot, parsed.cc, parsed.name));
            if let Err(e) = result {
                warn!("Skipping CC assignment {}: {}", assignment, e);
                skipped += 1;
            }
        }

        Ok((mapping, ParseOutcome::from_skipped(skipped)))
    }

    /// Assigns `cc` to `pot`, naming it `CC<n>` if no name is given.
    pub fn insert(&mut self, pot: usize, cc: U7, name: Option<&str>) -> Result<(), ConfigParseError> {
        let slot = self.slots.get_mut(pot).ok_or(ConfigParseError::OutOfRange)?;
        let name = match name {
            Some(name) => CcName::try_from(name).map_err(|_| ConfigParseError::NameTooLong)?,
            None => {
                let mut name = CcName::new();
                write!(name, "CC{}", u8::from(cc)).map_err(|_| ConfigParseError::NameTooLong)?;
                name
            }
        };
        *slot = Some(CcAssignment { cc, name });
        Ok(())
    }

    /// Returns the assignment for `pot`, if any.
    pub fn get(&self, pot: usize) -> Option<&CcAssignment> {
        self.slots.get(pot).and_then(Option::as_ref)
    }

    /// Iterates over the assigned pots in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &CcAssignment)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(pot, slot)| slot.as_ref().map(|assignment| (pot, assignment)))
    }

    /// Returns the number of assigned pots.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Returns `true` if no pot is assigned.
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Forgets every assignment.
    pub fn clear(&mut self) {
        self.slots = Default::default();
    }

    /// Renders the mapping as a configuration message, pots in ascending order.
    pub fn to_message(&self) -> Result<Message, crate::Error> {
        let mut message = Message::new();
        message
            .push_str(CONFIG_PREFIX)
            .map_err(|_| crate::Error::Exhausted)?;
        for (i, (pot, assignment)) in self.iter().enumerate() {
            if i > 0 {
                message.push(',').map_err(|_| crate::Error::Exhausted)?;
            }
            write!(message, "{}={}:{}", pot, u8::from(assignment.cc), assignment.name)
                .map_err(|_| crate::Error::Exhausted)?;
        }
        Ok(message)
    }
}

/// The live pot → CC table used when pots move.
///
/// Unlike [`CcMapping`], this table always has an entry for every pot: assignments the remote device has not
/// overridden keep their default.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CcAssignments {
    defaults: [ControlFunction; POT_COUNT],
    table: [ControlFunction; POT_COUNT],
}

impl Default for CcAssignments {
    fn default() -> Self {
        Self::new(DEFAULT_CC_ASSIGNMENTS)
    }
}

impl CcAssignments {
    /// Creates a table that starts out (and resets to) `defaults`.
    pub fn new(defaults: [ControlFunction; POT_COUNT]) -> Self {
        Self {
            defaults,
            table: defaults,
        }
    }

    /// Applies the assignments in a configuration message over the current table, ignoring names.
    ///
    /// Malformed or out-of-range assignments are skipped. Returns the number of assignments applied.
    pub fn apply(&mut self, message: &str) -> Result<usize, ConfigParseError> {
        let mut applied = 0;
        for assignment in assignments(message)? {
            match parse_assignment(assignment) {
                Ok(parsed) => {
                    self.table[parsed.pot] = ControlFunction(parsed.cc);
                    applied += 1;
                }
                Err(e) => debug!("Ignoring CC assignment {}: {}", assignment, e),
            }
        }
        info!("Applied {} CC assignments", applied);
        Ok(applied)
    }

    /// Returns the CC `pot` currently sends. Pots past the end of the table fall back to their own index.
    pub fn cc_for_pot(&self, pot: u8) -> ControlFunction {
        self.table
            .get(usize::from(pot))
            .copied()
            .unwrap_or(ControlFunction(U7::from_u8_lossy(pot)))
    }

    /// Restores every pot to its default CC.
    pub fn reset_to_defaults(&mut self) {
        self.table = self.defaults;
    }
}
