//! Session ID allocation.
//!
//! A session ID is a 32-bit integer: the top byte is this proxy's server ID
//! (1..=255), the rest is a per-process index whose width depends on the
//! chain family. Upstreams built with pre-allocated-session-ID support echo
//! the ID back during subscribe, which is how both sides agree on the
//! miner's Extranonce1 before any share is submitted.

use std::sync::Mutex;

use crate::error::{Result, SwitcherError};

/// The allocation cursor starts here rather than at zero so that an upstream
/// that ignores our pre-allocated IDs produces a conformity mismatch on the
/// very first session instead of appearing to work.
const INITIAL_ALLOC_INDEX: u32 = 128;

#[derive(Debug)]
struct Inner {
    bits: Vec<u64>,
    count: u32,
    alloc_idx: u32,
    alloc_interval: u32,
}

impl Inner {
    fn test(&self, idx: u32) -> bool {
        self.bits[(idx / 64) as usize] & (1u64 << (idx % 64)) != 0
    }

    fn set(&mut self, idx: u32) {
        self.bits[(idx / 64) as usize] |= 1u64 << (idx % 64);
    }

    fn clear(&mut self, idx: u32) {
        self.bits[(idx / 64) as usize] &= !(1u64 << (idx % 64));
    }
}

/// Thread-safe session ID allocator.
#[derive(Debug)]
pub struct SessionIdManager {
    server_id_prefix: u32,
    index_mask: u32,
    inner: Mutex<Inner>,
}

impl SessionIdManager {
    pub fn new(server_id: u8, index_bits: u8) -> Result<Self> {
        if index_bits > 24 {
            return Err(SwitcherError::Config(format!(
                "indexBits should not > 24, but it = {index_bits}"
            )));
        }
        if server_id == 0 {
            return Err(SwitcherError::Config(
                "serverID not set (serverID = 0)".into(),
            ));
        }

        let index_mask = (1u32 << index_bits) - 1;
        let words = (index_mask as usize + 1).div_ceil(64);
        Ok(Self {
            server_id_prefix: (server_id as u32) << index_bits,
            index_mask,
            inner: Mutex::new(Inner {
                bits: vec![0; words],
                count: 0,
                alloc_idx: INITIAL_ALLOC_INDEX & index_mask,
                alloc_interval: 0,
            }),
        })
    }

    /// Reserves spacing between allocations. Used on Ethereum so a NiceHash
    /// client constrained to a 2-byte extranonce cannot collide with the
    /// mining space of a neighboring session.
    pub fn set_alloc_interval(&self, interval: u32) {
        self.inner.lock().unwrap().alloc_interval = interval;
    }

    pub fn is_full(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.count > self.index_mask
    }

    /// Allocates a fresh session ID, or fails when every index is in use.
    pub fn alloc(&self) -> Result<u32> {
        let mut inner = self.inner.lock().unwrap();

        if inner.count > self.index_mask {
            return Err(SwitcherError::SessionIdFull);
        }

        // The count check above guarantees a clear bit exists.
        while inner.test(inner.alloc_idx) {
            inner.alloc_idx = (inner.alloc_idx + 1) & self.index_mask;
        }

        let idx = inner.alloc_idx;
        inner.set(idx);
        inner.count += 1;
        inner.alloc_idx = (idx + inner.alloc_interval) & self.index_mask;

        Ok(self.server_id_prefix | idx)
    }

    /// Reclaims a previously allocated ID during an upgrade resume. Fails if
    /// the index is already taken.
    pub fn resume(&self, session_id: u32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let idx = session_id & self.index_mask;

        if inner.test(idx) {
            return Err(SwitcherError::SessionIdOccupied);
        }

        inner.set(idx);
        inner.count += 1;

        if inner.alloc_idx <= idx {
            inner.alloc_idx = (idx + inner.alloc_interval) & self.index_mask;
        }
        Ok(())
    }

    /// Releases a session ID. Freeing an ID that is not allocated is a no-op.
    pub fn free(&self, session_id: u32) {
        let mut inner = self.inner.lock().unwrap();
        let idx = session_id & self.index_mask;

        if !inner.test(idx) {
            return;
        }
        inner.clear(idx);
        inner.count -= 1;
    }
}
