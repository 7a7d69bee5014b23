//! Native memory access for pointer-following decodes.

use crate::error::{MarshalError, MarshalResult};

/// Read access to native memory referenced by decoded pointers
pub trait Memory: Send + Sync {
    /// Copy `len` bytes starting at `addr`
    fn read(&self, addr: usize, len: usize) -> MarshalResult<Vec<u8>>;

    /// Copy `unit`-sized elements starting at `addr` up to (not including)
    /// the first all-zero unit, scanning at most `max_units`
    fn read_terminated(&self, addr: usize, unit: usize, max_units: usize) -> MarshalResult<Vec<u8>> {
        let mut bytes = Vec::new();
        for i in 0..max_units {
            let chunk = self.read(addr + i * unit, unit)?;
            if chunk.iter().all(|&b| b == 0) {
                return Ok(bytes);
            }
            bytes.extend_from_slice(&chunk);
        }
        log::warn!(
            "[memory] no terminator within {} units at {:#x}, truncating",
            max_units,
            addr
        );
        Ok(bytes)
    }
}

/// Reads the current process's memory through raw pointers
#[derive(Debug)]
pub struct ProcessMemory {
    _private: (),
}

impl ProcessMemory {
    /// # Safety
    ///
    /// Every non-null address later passed to this reader must reference
    /// readable memory of the requested length for the duration of the read.
    /// Native callees and call arenas uphold this for the span of one call.
    pub unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl Memory for ProcessMemory {
    fn read(&self, addr: usize, len: usize) -> MarshalResult<Vec<u8>> {
        if addr == 0 {
            return Err(MarshalError::InvalidAddress { addr });
        }
        let mut bytes = vec![0u8; len];
        // Safety: guaranteed by the contract of `ProcessMemory::new`
        unsafe {
            std::ptr::copy_nonoverlapping(addr as *const u8, bytes.as_mut_ptr(), len);
        }
        Ok(bytes)
    }

    fn read_terminated(&self, addr: usize, unit: usize, max_units: usize) -> MarshalResult<Vec<u8>> {
        if addr == 0 {
            return Err(MarshalError::InvalidAddress { addr });
        }
        let mut len = 0usize;
        // Safety: guaranteed by the contract of `ProcessMemory::new`
        unsafe {
            let base = addr as *const u8;
            while len < max_units {
                let unit_ptr = base.add(len * unit);
                if (0..unit).all(|i| *unit_ptr.add(i) == 0) {
                    break;
                }
                len += 1;
            }
        }
        if len == max_units {
            log::warn!(
                "[memory] no terminator within {} units at {:#x}, truncating",
                max_units,
                addr
            );
        }
        self.read(addr, len * unit)
    }
}
