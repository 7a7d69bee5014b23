//! Marshalling between managed value trees and native memory
//!
//! # Architecture
//!
//! ```text
//! ManagedValue ──Encoder──▶ NativeBuffer / CallArena ──▶ native callee
//!                                                           │
//! ManagedValue ◀──Decoder── bytes (+ Memory for pointers) ◀─┘
//! ```
//!
//! Encoding is driven entirely by a `TypeDescriptor`. Decoding is too,
//! except where a struct carries counted extents (resolved in a second
//! pass) or the caller selects the shape by discriminant (`VariantTable`).

mod buffer;
mod decode;
mod encode;
mod memory;
mod variant;

pub use buffer::{
    decode_ansi, decode_wide, encode_ansi, encode_wide, read_uint, write_uint, CallArena,
    NativeBuffer,
};
pub use decode::Decoder;
pub use encode::{encoded_size, Encoder};
pub use memory::{Memory, ProcessMemory};
pub use variant::{PostProcess, RawDecode, VariantShape, VariantTable};

pub(crate) use encode::{array_element, primitive_bits};

#[cfg(test)]
mod tests;
