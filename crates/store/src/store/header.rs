//! Dual-slot commit state file (`state.hdr`).
//!
//! # Layout
//!
//! ```text
//! Offset          Size        Field
//! ------          ----        -----
//! 0               8           Magic "QRYSTATE"
//! 8               2           Format version
//! 10              5           Reserved
//! 15              1           God byte (bit 0 = primary slot)
//! 16              slot        Slot 0
//! 16 + slot       slot        Slot 1
//!
//! slot = len u32 ‖ CommittedState ‖ xxh3-64(CommittedState)
//! ```
//!
//! A commit writes its state into the inactive slot, syncs, then flips the
//! god byte and syncs again. The flip is a single byte, so after any crash at
//! least one slot holds a complete state with a valid checksum. On open the
//! slot named by the god byte is tried first and the other is the fallback.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;

use crate::{
    backend::StorageBackend,
    error::{Error, Result},
    params::FORMAT_VERSION,
    txn::CommittedState,
};

const MAGIC: &[u8; 8] = b"QRYSTATE";
const HEADER_LEN: usize = 16;
const GOD_BYTE_OFFSET: usize = 15;
const SLOT_MASK: u8 = 0x01;

/// The on-disk pointer to the latest committed generation.
pub(crate) struct StateFile {
    backend: Arc<dyn StorageBackend>,
    tree_count: usize,
    god_byte: Mutex<u8>,
}

impl StateFile {
    /// Opens the state file, initializing it if empty, and returns the
    /// committed state it records.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMagic`] or [`Error::UnsupportedVersion`] for a
    /// foreign file, and [`Error::Corrupted`] if neither slot is valid or the
    /// state describes a different number of trees.
    pub(crate) fn open(
        backend: Arc<dyn StorageBackend>,
        tree_count: usize,
    ) -> Result<(Self, CommittedState)> {
        let file = Self { backend, tree_count, god_byte: Mutex::new(0) };

        if file.backend.is_empty()? {
            let state = CommittedState::empty(tree_count);
            let slot = file.encode_slot(&state);
            let mut buf = vec![0u8; HEADER_LEN + 2 * file.slot_len()];
            buf[0..8].copy_from_slice(MAGIC);
            LittleEndian::write_u16(&mut buf[8..10], FORMAT_VERSION);
            buf[HEADER_LEN..HEADER_LEN + slot.len()].copy_from_slice(&slot);
            buf[HEADER_LEN + file.slot_len()..].copy_from_slice(&slot);
            file.backend.write_at(0, &buf)?;
            file.backend.sync()?;
            return Ok((file, state));
        }

        let mut header = [0u8; HEADER_LEN];
        file.backend.read_exact_at(0, &mut header).map_err(|_| Error::Corrupted {
            reason: format!("{}: header truncated", file.backend.name()),
        })?;
        if &header[0..8] != MAGIC {
            return Err(Error::InvalidMagic { file: file.backend.name().to_string() });
        }
        let version = LittleEndian::read_u16(&header[8..10]);
        if version != FORMAT_VERSION {
            return Err(Error::UnsupportedVersion { version });
        }

        let god_byte = header[GOD_BYTE_OFFSET];
        let primary = usize::from(god_byte & SLOT_MASK);
        let state = match file.read_slot(primary) {
            Some(state) => state,
            None => {
                tracing::warn!(
                    file = file.backend.name(),
                    slot = primary,
                    "Primary commit slot is invalid; using the previous commit"
                );
                file.read_slot(1 - primary).ok_or_else(|| Error::Corrupted {
                    reason: format!("{}: both commit slots are invalid", file.backend.name()),
                })?
            },
        };
        if state.trees.len() != tree_count {
            return Err(Error::Corrupted {
                reason: format!(
                    "{}: commit state has {} trees, store has {tree_count}",
                    file.backend.name(),
                    state.trees.len()
                ),
            });
        }

        *file.god_byte.lock() = god_byte;
        Ok((file, state))
    }

    /// Makes `state` the committed state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if a write or sync fails. A failure before the
    /// god byte flip leaves the previous state in effect.
    pub(crate) fn store(&self, state: &CommittedState) -> Result<()> {
        let mut god_byte = self.god_byte.lock();
        let inactive = 1 - usize::from(*god_byte & SLOT_MASK);
        self.backend.write_at(self.slot_offset(inactive), &self.encode_slot(state))?;
        self.backend.sync()?;

        let flipped = *god_byte ^ SLOT_MASK;
        self.backend.write_at(GOD_BYTE_OFFSET as u64, &[flipped])?;
        self.backend.sync()?;
        *god_byte = flipped;
        Ok(())
    }

    /// Index of the slot holding the current state.
    #[cfg(test)]
    pub(crate) fn primary_slot(&self) -> usize {
        usize::from(*self.god_byte.lock() & SLOT_MASK)
    }

    fn slot_len(&self) -> usize {
        4 + CommittedState::encoded_len(self.tree_count) + 8
    }

    fn slot_offset(&self, slot: usize) -> u64 {
        (HEADER_LEN + slot * self.slot_len()) as u64
    }

    fn encode_slot(&self, state: &CommittedState) -> Vec<u8> {
        let encoded = state.encode();
        let mut slot = vec![0u8; self.slot_len()];
        LittleEndian::write_u32(&mut slot[0..4], encoded.len() as u32);
        slot[4..4 + encoded.len()].copy_from_slice(&encoded);
        let checksum = xxhash_rust::xxh3::xxh3_64(&encoded);
        LittleEndian::write_u64(&mut slot[4 + encoded.len()..12 + encoded.len()], checksum);
        slot
    }

    /// Decodes a slot, or `None` if it is torn or damaged.
    fn read_slot(&self, slot: usize) -> Option<CommittedState> {
        let mut buf = vec![0u8; self.slot_len()];
        self.backend.read_exact_at(self.slot_offset(slot), &mut buf).ok()?;
        let len = LittleEndian::read_u32(&buf[0..4]) as usize;
        if 12 + len > buf.len() {
            return None;
        }
        let encoded = &buf[4..4 + len];
        let checksum = LittleEndian::read_u64(&buf[4 + len..12 + len]);
        if xxhash_rust::xxh3::xxh3_64(encoded) != checksum {
            return None;
        }
        CommittedState::decode(encoded).ok()
    }
}
