//! FFI Module
//!
//! Loads C-ABI shared libraries, binds their symbols to type descriptors
//! and performs marshalled calls.
//!
//! # Architecture
//!
//! ```text
//! CallBinder::invoke(callable, args)
//!       │
//!       ▼
//! Encoder (args -> register words, out buffers in a CallArena)
//!       │
//!       ▼
//! BoundCallable (entry resolved once via DynamicLibrary / libloading)
//!       │
//!       ▼
//! Trampoline (native call)
//!       │
//!       ▼
//! Decoder (out buffers + return value -> ManagedValue)
//! ```
//!
//! Callbacks passed as arguments are registered with a [`HandleRegistry`]
//! and reach native code as addresses of compiled thunks.
//!
//! # Example
//!
//! ```ignore
//! let loader = LibraryLoader::new();
//! let table = BindingTable::new(loader.load("c")?);
//! let strlen = table.bind(
//!     "strlen",
//!     TypeDescriptor::usize(),
//!     vec![DirectionQualifier::input(TypeDescriptor::ansi_string())],
//! );
//! let outcome = unsafe { CallBinder::new().invoke(&strlen, &["hello".into()])? };
//! ```

mod binder;
mod handles;
mod loader;
mod trampoline;

pub use binder::{
    BindingTable, BoundCallable, CallBinder, CallOutcome, CallResults, CallState, Direction,
    DirectionQualifier, SuccessPredicate,
};
pub use handles::{
    CallbackGuard, HandleRegistry, HandleScope, NativeAllocation, CALLBACK_SLOTS,
    MAX_CALLBACK_ARGS,
};
pub use loader::{default_search_paths, library_filename, DynamicLibrary, LibraryLoader, PinnedLibrary};
pub use trampoline::{NativeFunctionPointer, RegisterTrampoline, Trampoline, MAX_REGISTER_ARGS};
