//! Outbound packet buffer with header headroom.
//!
//! Layers build a packet inside-out: the payload is appended first, then
//! each layer pushes its header backwards into the reserved headroom (UDP or
//! TCP, then IPv4, then Ethernet). One buffer, no copies between layers, and
//! the buffer owns its memory for its whole life: dropping it releases the
//! allocation on every exit path.
//!
//! Acquisition is fallible: the backing storage comes from the kernel heap
//! through the global allocator, and exhaustion surfaces as
//! [`NetError::OutOfMemory`] so the caller can drop the packet instead of
//! panicking.

use alloc::vec::Vec;

use crate::types::NetError;

/// Headroom reserved for link/network/transport headers (14 + 20 + 20 with
/// slack).
pub const HEADROOM: usize = 64;

pub struct PacketBuf {
    data: Vec<u8>,
    head: usize,
    tail: usize,
}

impl PacketBuf {
    /// Allocate a buffer able to carry `payload_cap` bytes after the
    /// headroom.
    pub fn alloc(payload_cap: usize) -> Result<Self, NetError> {
        let total = HEADROOM + payload_cap;
        let mut data = Vec::new();
        data.try_reserve_exact(total)
            .map_err(|_| NetError::OutOfMemory)?;
        data.resize(total, 0);
        Ok(Self {
            data,
            head: HEADROOM,
            tail: HEADROOM,
        })
    }

    /// Append bytes at the tail.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), NetError> {
        if self.tail + bytes.len() > self.data.len() {
            return Err(NetError::Error);
        }
        self.data[self.tail..self.tail + bytes.len()].copy_from_slice(bytes);
        self.tail += bytes.len();
        Ok(())
    }

    /// Claim `len` bytes of headroom in front of the current payload and
    /// return them for the caller to fill.
    pub fn push_header(&mut self, len: usize) -> Result<&mut [u8], NetError> {
        if len > self.head {
            return Err(NetError::Error);
        }
        self.head -= len;
        Ok(&mut self.data[self.head..self.head + len])
    }

    /// Everything between the outermost pushed header and the tail.
    pub fn payload(&self) -> &[u8] {
        &self.data[self.head..self.tail]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.head..self.tail]
    }

    pub fn len(&self) -> usize {
        self.tail - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }
}
