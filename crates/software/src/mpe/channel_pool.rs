use tinyvec::ArrayVec;
use wmidi::Channel;

use super::{KEY_SLOTS, KeyId, MEMBER_CHANNELS, NoteTracker, member_channel};

/// Hands out member channels to keys so each sounding note has a channel of its own.
///
/// When every member channel is taken, the key that was allocated longest ago loses its channel to the newcomer (its
/// note is deactivated in the [`NoteTracker`]). Allocation is idempotent: asking again for a key that already holds a
/// channel returns the same channel.
///
/// Channels are stored as zero-based indices because [`tinyvec`] requires that items implement [`Default`].
#[derive(Clone, Debug)]
pub struct ChannelPool {
    /// Free channels; the next allocation takes from the front.
    available: ArrayVec<[u8; 16]>,
    /// Keys holding a channel, oldest allocation first.
    allocation_order: ArrayVec<[KeyId; 16]>,
    /// The channel each key holds, if any.
    assigned: [Option<u8>; KEY_SLOTS],
}

impl Default for ChannelPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelPool {
    /// Creates a pool with every member channel free.
    pub fn new() -> Self {
        Self {
            available: MEMBER_CHANNELS.collect(),
            allocation_order: ArrayVec::new(),
            assigned: [None; KEY_SLOTS],
        }
    }

    /// Returns the channel held by `key`, allocating or stealing one if necessary.
    pub fn allocate(&mut self, key: KeyId, notes: &mut NoteTracker) -> Channel {
        let Some(&assigned) = self.assigned.get(usize::from(key)) else {
            error!("Key {} out of range; using the first member channel", key);
            return member_channel(*MEMBER_CHANNELS.start());
        };
        if let Some(index) = assigned {
            return member_channel(index);
        }

        let index = if self.available.is_empty() {
            self.steal(notes)
        } else {
            Some(self.available.remove(0))
        };

        match index {
            Some(index) => {
                self.assigned[usize::from(key)] = Some(index);
                self.allocation_order.push(key);
                member_channel(index)
            }
            None => {
                error!("No member channel available for key {}", key);
                member_channel(*MEMBER_CHANNELS.start())
            }
        }
    }

    /// Takes the channel from the key that has held one longest.
    fn steal(&mut self, notes: &mut NoteTracker) -> Option<u8> {
        while !self.allocation_order.is_empty() {
            let victim = self.allocation_order.remove(0);
            if let Some(index) = self.assigned[usize::from(victim)].take() {
                debug!("Stealing channel {} from key {}", index + 1, victim);
                notes.deactivate(victim);
                return Some(index);
            }
        }
        None
    }

    /// Returns the key's channel to the pool and deactivates its note.
    pub fn release(&mut self, key: KeyId, notes: &mut NoteTracker) {
        notes.deactivate(key);
        let Some(slot) = self.assigned.get_mut(usize::from(key)) else {
            return;
        };
        if let Some(index) = slot.take() {
            if !self.available.contains(&index) {
                self.available.push(index);
            }
            self.allocation_order.retain(|&k| k != key);
        }
    }

    /// Returns the channel held by `key`, if any.
    pub fn channel_of(&self, key: KeyId) -> Option<Channel> {
        self.assigned
            .get(usize::from(key))
            .copied()
            .flatten()
            .map(member_channel)
    }

    /// Returns the number of free member channels.
    pub fn available(&self) -> usize {
        self.available.len()
    }

    /// Returns the number of keys holding a channel.
    pub fn allocated(&self) -> usize {
        self.allocation_order.len()
    }
}
