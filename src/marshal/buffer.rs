//! Native byte regions
//!
//! `NativeBuffer` is an 8-byte aligned, fixed-address byte region. A
//! `CallArena` owns every buffer allocated on behalf of one native call and
//! keeps their addresses valid until it is dropped.

use crate::descriptor::ByteOrder;
use crate::error::{MarshalError, MarshalResult};

/// Aligned, fixed-size byte region
pub struct NativeBuffer {
    /// Word storage gives 8-byte alignment; the heap block never moves
    words: Vec<u64>,
    len: usize,
}

impl NativeBuffer {
    pub fn zeroed(len: usize) -> Self {
        let words = len.div_ceil(8).max(1);
        Self {
            words: vec![0u64; words],
            len,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut buffer = Self::zeroed(bytes.len());
        buffer.as_mut_bytes().copy_from_slice(bytes);
        buffer
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        // Safety: `words` holds at least `len` initialized bytes
        unsafe { std::slice::from_raw_parts(self.words.as_ptr() as *const u8, self.len) }
    }

    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        // Safety: as above, and `&mut self` guarantees exclusivity
        unsafe { std::slice::from_raw_parts_mut(self.words.as_mut_ptr() as *mut u8, self.len) }
    }

    /// Address handed to native code
    pub fn address(&self) -> usize {
        self.words.as_ptr() as usize
    }

    /// Low eight bytes as a little-endian register value
    pub fn to_register(&self) -> u64 {
        let mut raw = [0u8; 8];
        let n = self.len.min(8);
        raw[..n].copy_from_slice(&self.as_bytes()[..n]);
        u64::from_le_bytes(raw)
    }
}

impl std::fmt::Debug for NativeBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NativeBuffer({} bytes: {})", self.len, hex::encode(self.as_bytes()))
    }
}

/// Per-call scratch allocations. Dropping the arena releases them all.
#[derive(Default)]
pub struct CallArena {
    blocks: Vec<NativeBuffer>,
}

impl CallArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a zeroed block, returning its index and native address
    pub fn alloc(&mut self, len: usize) -> (usize, usize) {
        let block = NativeBuffer::zeroed(len);
        let address = block.address();
        self.blocks.push(block);
        (self.blocks.len() - 1, address)
    }

    /// Take ownership of an already-filled buffer, returning its address
    pub fn adopt(&mut self, buffer: NativeBuffer) -> usize {
        let address = buffer.address();
        self.blocks.push(buffer);
        address
    }

    /// Copy bytes into a fresh block
    pub fn alloc_bytes(&mut self, bytes: &[u8]) -> usize {
        let (index, address) = self.alloc(bytes.len());
        self.blocks[index].as_mut_bytes().copy_from_slice(bytes);
        address
    }

    pub fn block(&self, index: usize) -> Option<&NativeBuffer> {
        self.blocks.get(index)
    }

    pub fn block_mut(&mut self, index: usize) -> Option<&mut NativeBuffer> {
        self.blocks.get_mut(index)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Total bytes held for the call
    pub fn allocated_bytes(&self) -> usize {
        self.blocks.iter().map(NativeBuffer::len).sum()
    }
}

fn check_range(region_len: usize, offset: usize, width: usize) -> MarshalResult<()> {
    let required = offset.checked_add(width).ok_or(MarshalError::BufferTooSmall {
        required: usize::MAX,
        available: region_len,
    })?;
    if required > region_len {
        return Err(MarshalError::BufferTooSmall {
            required,
            available: region_len,
        });
    }
    Ok(())
}

/// Write the low `width` bytes of `bits` at `offset`
pub fn write_uint(
    region: &mut [u8],
    offset: usize,
    width: usize,
    bits: u64,
    order: ByteOrder,
) -> MarshalResult<()> {
    check_range(region.len(), offset, width)?;
    let target = &mut region[offset..offset + width];
    match order {
        ByteOrder::Native => target.copy_from_slice(&bits.to_le_bytes()[..width]),
        ByteOrder::Big => target.copy_from_slice(&bits.to_be_bytes()[8 - width..]),
    }
    Ok(())
}

/// Read `width` bytes at `offset`, zero-extended
pub fn read_uint(region: &[u8], offset: usize, width: usize, order: ByteOrder) -> MarshalResult<u64> {
    check_range(region.len(), offset, width)?;
    let source = &region[offset..offset + width];
    let mut raw = [0u8; 8];
    Ok(match order {
        ByteOrder::Native => {
            raw[..width].copy_from_slice(source);
            u64::from_le_bytes(raw)
        }
        ByteOrder::Big => {
            raw[8 - width..].copy_from_slice(source);
            u64::from_be_bytes(raw)
        }
    })
}

pub fn zero_fill(region: &mut [u8], offset: usize, len: usize) -> MarshalResult<()> {
    check_range(region.len(), offset, len)?;
    region[offset..offset + len].fill(0);
    Ok(())
}

/// NUL-terminated UTF-16LE bytes
pub fn encode_wide(s: &str) -> Vec<u8> {
    s.encode_utf16()
        .chain(std::iter::once(0))
        .flat_map(u16::to_le_bytes)
        .collect()
}

/// NUL-terminated ANSI bytes
pub fn encode_ansi(s: &str) -> Vec<u8> {
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    bytes
}

/// UTF-16LE bytes to a string, stopping at the first NUL unit
pub fn decode_wide(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .take_while(|&unit| unit != 0)
        .collect();
    match String::from_utf16(&units) {
        Ok(s) => s,
        Err(_) => {
            log::debug!("[buffer] unpaired surrogate in wide string, replacing");
            String::from_utf16_lossy(&units)
        }
    }
}

/// ANSI bytes to a string, stopping at the first NUL
pub fn decode_ansi(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
