//! The guest-memory boundary. IPC marshaling reads and writes command
//! buffers exclusively through this trait; nothing above it sees host
//! pointers.

use parking_lot::Mutex;

use crate::result::{KResult, KernelError};

/// Byte-addressable guest virtual memory.
pub trait GuestMemory: Send + Sync {
    /// Copy `out.len()` bytes out of guest memory at `address`.
    fn read_block(&self, address: u64, out: &mut [u8]) -> KResult<()>;

    /// Copy `data` into guest memory at `address`.
    fn write_block(&self, address: u64, data: &[u8]) -> KResult<()>;

    /// Whether `[address, address + len)` is entirely mapped.
    fn is_valid_range(&self, address: u64, len: u64) -> bool;

    fn read_u32(&self, address: u64) -> KResult<u32> {
        let mut buf = [0u8; 4];
        self.read_block(address, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn write_u32(&self, address: u64, value: u32) -> KResult<()> {
        self.write_block(address, &value.to_le_bytes())
    }

    fn read_u64(&self, address: u64) -> KResult<u64> {
        let mut buf = [0u8; 8];
        self.read_block(address, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_u64(&self, address: u64, value: u64) -> KResult<()> {
        self.write_block(address, &value.to_le_bytes())
    }
}

/// Flat in-memory backing used by tests and the HLE harness: one
/// contiguous region starting at `base`.
pub struct ArrayMemory {
    base: u64,
    data: Mutex<Vec<u8>>,
}

impl ArrayMemory {
    pub fn new(base: u64, size: usize) -> Self {
        ArrayMemory {
            base,
            data: Mutex::new(vec![0; size]),
        }
    }

    fn range(&self, address: u64, len: usize) -> KResult<std::ops::Range<usize>> {
        let start = address
            .checked_sub(self.base)
            .ok_or(KernelError::InvalidAddress)? as usize;
        let end = start
            .checked_add(len)
            .ok_or(KernelError::InvalidAddress)?;
        if end > self.data.lock().len() {
            return Err(KernelError::InvalidAddress);
        }
        Ok(start..end)
    }
}

impl GuestMemory for ArrayMemory {
    fn read_block(&self, address: u64, out: &mut [u8]) -> KResult<()> {
        let range = self.range(address, out.len())?;
        out.copy_from_slice(&self.data.lock()[range]);
        Ok(())
    }

    fn write_block(&self, address: u64, data: &[u8]) -> KResult<()> {
        let range = self.range(address, data.len())?;
        self.data.lock()[range].copy_from_slice(data);
        Ok(())
    }

    fn is_valid_range(&self, address: u64, len: u64) -> bool {
        self.range(address, len as usize).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_the_base_offset() {
        let mem = ArrayMemory::new(0x1000, 0x100);
        mem.write_u32(0x1010, 0xdead_beef).unwrap();
        assert_eq!(mem.read_u32(0x1010).unwrap(), 0xdead_beef);
        mem.write_u64(0x1020, 0x0123_4567_89ab_cdef).unwrap();
        assert_eq!(mem.read_u64(0x1020).unwrap(), 0x0123_4567_89ab_cdef);
    }

    #[test]
    fn rejects_out_of_range_accesses() {
        let mem = ArrayMemory::new(0x1000, 0x100);
        assert!(matches!(
            mem.read_u32(0xfff),
            Err(KernelError::InvalidAddress)
        ));
        assert!(matches!(
            mem.write_u32(0x10fe, 0),
            Err(KernelError::InvalidAddress)
        ));
        assert!(mem.is_valid_range(0x1000, 0x100));
        assert!(!mem.is_valid_range(0x1000, 0x101));
    }
}
