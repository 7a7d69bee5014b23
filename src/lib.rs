//! nativecall - Typed marshalling for C-ABI calls
//!
//! Describes native memory layouts declaratively and moves strongly-typed
//! values across the native boundary: encode before a call, decode after it,
//! including trailing data whose length is only known once the buffer has
//! been read.
//!
//! # Features
//!
//! - **Type descriptors**: primitives, pointers, fixed arrays, structs,
//!   unions, opaque handles and function prototypes, composed freely
//! - **C layout**: natural alignment, cached per struct
//! - **Counted extents**: capacity masking, pointer + count, inline tails
//! - **Discriminant tables**: one buffer, many shapes, chosen by an input
//! - **Directional calls**: `In` / `Out` / `InOut` parameters with per-call
//!   buffer lifetimes
//! - **Callbacks**: managed closures behind stable native thunk addresses
//!
//! # Example
//!
//! ```rust
//! use nativecall::descriptor::TypeDescriptor;
//! use nativecall::marshal::{CallArena, Decoder, Encoder};
//! use nativecall::value::ManagedValue;
//!
//! let point = TypeDescriptor::structure("POINT")
//!     .field("x", TypeDescriptor::i32())
//!     .field("y", TypeDescriptor::i32())
//!     .build()
//!     .unwrap();
//!
//! let value = ManagedValue::record([("x", 10i32.into()), ("y", (-5i32).into())]);
//! let mut arena = CallArena::new();
//! let buffer = Encoder::new(&mut arena).encode_to_buffer(&value, &point).unwrap();
//! assert_eq!(buffer.as_bytes(), &[0x0A, 0, 0, 0, 0xFB, 0xFF, 0xFF, 0xFF]);
//!
//! let decoded = Decoder::detached().decode(buffer.as_bytes(), &point, 0).unwrap();
//! assert_eq!(decoded, value);
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │ TypeDescriptor  │  Shapes + cached layouts
//! └────────┬────────┘
//!          │
//!     ┌────┴────┐
//!     ▼         ▼
//! ┌───────┐  ┌─────────┐
//! │Encoder│  │ Decoder │  ManagedValue <-> bytes
//! └───┬───┘  └────▲────┘
//!     │           │
//!     ▼           │
//! ┌─────────────────────┐
//! │ CallBinder          │  One native call per invoke
//! └─────────────────────┘
//! ```

#![allow(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod descriptor;
pub mod error;
pub mod ffi;
pub mod marshal;
pub mod value;
pub mod win32;

// Re-export commonly used types
pub use config::{ConfigError, MarshalConfig};
pub use descriptor::{
    ByteOrder, ExtentStrategy, Layout, LayoutCalculator, PrimitiveKind, TypeDescriptor, TypeKind,
};
pub use error::{DescriptorError, FieldPath, MarshalError, MarshalResult};
pub use ffi::{
    BindingTable, BoundCallable, CallBinder, CallOutcome, CallState, Direction,
    DirectionQualifier, DynamicLibrary, HandleRegistry, LibraryLoader, SuccessPredicate,
};
pub use marshal::{CallArena, Decoder, Encoder, NativeBuffer, VariantTable};
pub use value::{Callback, Handle, HandleKind, ManagedValue, RawHandle};
