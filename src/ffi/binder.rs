//! Call Binder
//!
//! Binds a native symbol to its parameter and return descriptors and drives
//! a single call through its states:
//!
//! ```text
//! Idle -> Encoding -> Invoking -> Decoding -> Done
//!            │           │           │
//!            └───────────┴───────────┴──────> Failed
//! ```
//!
//! Encoding failures abort before native code runs. Every buffer allocated
//! for the call lives in one `CallArena` that is dropped when `invoke`
//! returns, on every path.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::config::DecodeConfig;
use crate::descriptor::{TypeDescriptor, TypeKind};
use crate::error::{FieldPath, MarshalError, MarshalResult};
use crate::marshal::{CallArena, Decoder, Encoder, ProcessMemory};
use crate::value::ManagedValue;

use super::handles::HandleRegistry;
use super::loader::DynamicLibrary;
use super::trampoline::{NativeFunctionPointer, RegisterTrampoline, Trampoline};

/// Data flow of a parameter across the call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
    InOut,
}

/// A parameter descriptor plus its direction
#[derive(Debug, Clone, PartialEq)]
pub struct DirectionQualifier {
    inner: TypeDescriptor,
    direction: Direction,
}

impl DirectionQualifier {
    pub fn input(inner: TypeDescriptor) -> Self {
        Self {
            inner,
            direction: Direction::In,
        }
    }

    /// Output parameter. The descriptor must be a pointer; the binder
    /// allocates its pointee and decodes it after the call.
    pub fn output(inner: TypeDescriptor) -> MarshalResult<Self> {
        Self::pointer_qualified(inner, Direction::Out)
    }

    pub fn in_out(inner: TypeDescriptor) -> MarshalResult<Self> {
        Self::pointer_qualified(inner, Direction::InOut)
    }

    fn pointer_qualified(inner: TypeDescriptor, direction: Direction) -> MarshalResult<Self> {
        if !inner.is_pointer() {
            return Err(MarshalError::UnsupportedSignature(format!(
                "{:?} parameter of non-pointer type {}",
                direction, inner
            )));
        }
        Ok(Self { inner, direction })
    }

    pub fn inner(&self) -> &TypeDescriptor {
        &self.inner
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_output(&self) -> bool {
        self.direction != Direction::In
    }

    fn pointee(&self) -> Option<&TypeDescriptor> {
        match self.inner.resolved().kind() {
            TypeKind::Pointer(pointee) => Some(pointee),
            _ => None,
        }
    }
}

/// How a binding recognizes success in its return value
#[derive(Clone)]
pub enum SuccessPredicate {
    /// Every return value is success
    Always,
    /// Win32 `BOOL` convention
    NonZero,
    /// `ERROR_SUCCESS` / errno-style status codes
    Zero,
    /// Handle or pointer returns
    NotNull,
    Custom(Arc<dyn Fn(&ManagedValue) -> bool + Send + Sync>),
}

impl SuccessPredicate {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&ManagedValue) -> bool + Send + Sync + 'static,
    {
        SuccessPredicate::Custom(Arc::new(f))
    }

    pub fn holds(&self, value: &ManagedValue) -> bool {
        let is_zero = || match value {
            ManagedValue::Bool(b) => !b,
            ManagedValue::Int(v) => *v == 0,
            ManagedValue::UInt(v) => *v == 0,
            ManagedValue::Null => true,
            ManagedValue::Pointer(addr) => *addr == 0,
            ManagedValue::Handle(handle) => handle.is_null(),
            _ => false,
        };
        match self {
            SuccessPredicate::Always => true,
            SuccessPredicate::NonZero | SuccessPredicate::NotNull => !is_zero(),
            SuccessPredicate::Zero => is_zero(),
            SuccessPredicate::Custom(f) => f(value),
        }
    }
}

impl fmt::Debug for SuccessPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuccessPredicate::Always => f.write_str("Always"),
            SuccessPredicate::NonZero => f.write_str("NonZero"),
            SuccessPredicate::Zero => f.write_str("Zero"),
            SuccessPredicate::NotNull => f.write_str("NotNull"),
            SuccessPredicate::Custom(_) => f.write_str("Custom"),
        }
    }
}

enum EntrySource {
    Library(Arc<DynamicLibrary>),
    Address(NativeFunctionPointer),
}

/// A native symbol bound to its signature. The entry point is resolved on
/// first invocation and reused afterwards.
pub struct BoundCallable {
    symbol: String,
    return_type: TypeDescriptor,
    parameters: Vec<DirectionQualifier>,
    success: SuccessPredicate,
    source: EntrySource,
    entry: OnceCell<NativeFunctionPointer>,
}

impl BoundCallable {
    pub fn new(
        library: Arc<DynamicLibrary>,
        symbol: impl Into<String>,
        return_type: TypeDescriptor,
        parameters: Vec<DirectionQualifier>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            return_type,
            parameters,
            success: SuccessPredicate::Always,
            source: EntrySource::Library(library),
            entry: OnceCell::new(),
        }
    }

    /// Bind an entry point obtained elsewhere (e.g. a returned function pointer)
    pub fn from_address(
        symbol: impl Into<String>,
        entry: NativeFunctionPointer,
        return_type: TypeDescriptor,
        parameters: Vec<DirectionQualifier>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            return_type,
            parameters,
            success: SuccessPredicate::Always,
            source: EntrySource::Address(entry),
            entry: OnceCell::with_value(entry),
        }
    }

    pub fn with_success(mut self, success: SuccessPredicate) -> Self {
        self.success = success;
        self
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn return_type(&self) -> &TypeDescriptor {
        &self.return_type
    }

    pub fn parameters(&self) -> &[DirectionQualifier] {
        &self.parameters
    }

    pub fn success(&self) -> &SuccessPredicate {
        &self.success
    }

    /// Entry point if already resolved
    pub fn resolved_entry(&self) -> Option<NativeFunctionPointer> {
        self.entry.get().copied()
    }
}

impl fmt::Debug for BoundCallable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundCallable")
            .field("symbol", &self.symbol)
            .field("return_type", &self.return_type)
            .field("parameters", &self.parameters)
            .field("entry", &self.entry.get())
            .finish()
    }
}

/// Bound callables of one library, indexed by symbol
pub struct BindingTable {
    library: Arc<DynamicLibrary>,
    bound: Mutex<HashMap<String, Arc<BoundCallable>>>,
}

impl BindingTable {
    pub fn new(library: Arc<DynamicLibrary>) -> Self {
        Self {
            library,
            bound: Mutex::new(HashMap::new()),
        }
    }

    pub fn library(&self) -> &Arc<DynamicLibrary> {
        &self.library
    }

    /// Bind `symbol`, or return the binding made by an earlier call
    pub fn bind(
        &self,
        symbol: &str,
        return_type: TypeDescriptor,
        parameters: Vec<DirectionQualifier>,
    ) -> Arc<BoundCallable> {
        self.bind_checked(symbol, return_type, parameters, SuccessPredicate::Always)
    }

    pub fn bind_checked(
        &self,
        symbol: &str,
        return_type: TypeDescriptor,
        parameters: Vec<DirectionQualifier>,
        success: SuccessPredicate,
    ) -> Arc<BoundCallable> {
        let mut bound = self.bound.lock();
        let callable = bound.entry(symbol.to_string()).or_insert_with(|| {
            log::debug!("[binder] bound {}!{}", self.library.name(), symbol);
            Arc::new(
                BoundCallable::new(Arc::clone(&self.library), symbol, return_type, parameters)
                    .with_success(success),
            )
        });
        Arc::clone(callable)
    }

    pub fn get(&self, symbol: &str) -> Option<Arc<BoundCallable>> {
        self.bound.lock().get(symbol).cloned()
    }

    pub fn len(&self) -> usize {
        self.bound.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bound.lock().is_empty()
    }
}

/// Per-call state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Encoding,
    Invoking,
    Decoding,
    Done,
    Failed,
}

struct CallTrace<'a> {
    symbol: &'a str,
    state: CallState,
}

impl<'a> CallTrace<'a> {
    fn new(symbol: &'a str) -> Self {
        Self {
            symbol,
            state: CallState::Idle,
        }
    }

    fn enter(&mut self, next: CallState) {
        log::debug!("[binder] {}: {:?} -> {:?}", self.symbol, self.state, next);
        self.state = next;
    }

    fn fail<T>(&mut self, err: MarshalError) -> MarshalResult<T> {
        self.enter(CallState::Failed);
        Err(err)
    }
}

/// Result of one native invocation
#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub symbol: String,
    pub return_value: MarshalResult<ManagedValue>,
    /// One entry per parameter; `None` for input-only parameters
    pub outputs: Vec<Option<MarshalResult<ManagedValue>>>,
    pub state: CallState,
    success: SuccessPredicate,
}

impl CallOutcome {
    pub fn succeeded(&self) -> bool {
        self.state == CallState::Done
    }

    /// Apply the binding's success predicate and surface the first
    /// decode error
    pub fn checked(self) -> MarshalResult<CallResults> {
        let return_value = self.return_value?;
        if !self.success.holds(&return_value) {
            return Err(MarshalError::NativeCallFailure {
                symbol: self.symbol,
                returned: format!("{:?}", return_value),
            });
        }
        let mut outputs = Vec::with_capacity(self.outputs.len());
        for output in self.outputs {
            outputs.push(output.transpose()?);
        }
        Ok(CallResults {
            return_value,
            outputs,
        })
    }
}

/// Decoded values of a successful call
#[derive(Debug, Clone, PartialEq)]
pub struct CallResults {
    pub return_value: ManagedValue,
    pub outputs: Vec<Option<ManagedValue>>,
}

impl CallResults {
    /// Output parameter `index`, if it was one
    pub fn output(&self, index: usize) -> Option<&ManagedValue> {
        self.outputs.get(index).and_then(Option::as_ref)
    }
}

struct OutSlot {
    addr: usize,
    ty: TypeDescriptor,
}

/// Drives calls through a trampoline
pub struct CallBinder {
    trampoline: Arc<dyn Trampoline>,
    callbacks: Arc<HandleRegistry>,
    limits: DecodeConfig,
}

impl CallBinder {
    pub fn new() -> Self {
        Self {
            trampoline: Arc::new(RegisterTrampoline::new()),
            callbacks: Arc::new(HandleRegistry::new()),
            limits: DecodeConfig::default(),
        }
    }

    pub fn with_trampoline(mut self, trampoline: impl Trampoline + 'static) -> Self {
        self.trampoline = Arc::new(trampoline);
        self
    }

    pub fn with_registry(mut self, callbacks: Arc<HandleRegistry>) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn with_limits(mut self, limits: DecodeConfig) -> Self {
        self.limits = limits;
        self
    }

    /// Registry receiving callbacks passed as arguments
    pub fn callbacks(&self) -> &Arc<HandleRegistry> {
        &self.callbacks
    }

    /// Invoke `callable` exactly once with `args`.
    ///
    /// Returns `Err` when the native function was never called (bad
    /// arguments, unsupported signature, unresolvable symbol). Once native
    /// code has run, decode errors are reported per value in the outcome.
    ///
    /// # Safety
    ///
    /// The bound descriptors must match the native function's real
    /// signature, and pointers passed as raw `Pointer` values must be valid
    /// for whatever the function does with them.
    pub unsafe fn invoke(
        &self,
        callable: &BoundCallable,
        args: &[ManagedValue],
    ) -> MarshalResult<CallOutcome> {
        let mut trace = CallTrace::new(&callable.symbol);
        trace.enter(CallState::Encoding);

        if args.len() != callable.parameters.len() {
            return trace.fail(MarshalError::mismatch(
                &FieldPath::root(),
                format!("{} arguments", callable.parameters.len()),
                args.len().to_string(),
            ));
        }
        let param_types: Vec<TypeDescriptor> =
            callable.parameters.iter().map(|p| p.inner.clone()).collect();
        if let Err(e) = self.trampoline.supports(&callable.return_type, &param_types) {
            return trace.fail(e);
        }

        let mut arena = CallArena::new();
        let (words, slots) = match self.encode_arguments(callable, args, &mut arena) {
            Ok(encoded) => encoded,
            Err(e) => return trace.fail(e),
        };

        trace.enter(CallState::Invoking);
        let pinned = match &callable.source {
            EntrySource::Library(library) => match library.pin() {
                Ok(pinned) => Some(pinned),
                Err(e) => return trace.fail(e),
            },
            EntrySource::Address(_) => None,
        };
        let entry = match (&pinned, callable.entry.get()) {
            (_, Some(entry)) => *entry,
            (Some(pinned), None) => {
                match callable.entry.get_or_try_init(|| pinned.resolve(&callable.symbol)) {
                    Ok(entry) => *entry,
                    Err(e) => return trace.fail(e),
                }
            }
            (None, None) => {
                return trace.fail(MarshalError::Symbol {
                    library: String::new(),
                    symbol: callable.symbol.clone(),
                    reason: "no entry point".to_string(),
                })
            }
        };
        let raw = match self.trampoline.invoke(entry, &words, &callable.return_type) {
            Ok(raw) => raw,
            Err(e) => return trace.fail(e),
        };

        trace.enter(CallState::Decoding);
        let memory = ProcessMemory::new();
        let decoder = Decoder::new(&memory).with_limits(&self.limits);
        let outputs: Vec<Option<MarshalResult<ManagedValue>>> = slots
            .into_iter()
            .map(|slot| {
                slot.map(|slot| match slot.addr {
                    0 => Ok(ManagedValue::Null),
                    addr => decoder.decode_address(addr, &slot.ty),
                })
            })
            .collect();
        let return_value = if callable.return_type.is_void() {
            Ok(ManagedValue::Null)
        } else {
            decoder.decode(raw.as_bytes(), &callable.return_type, 0)
        };
        drop(pinned);

        let clean = return_value.is_ok() && outputs.iter().flatten().all(Result::is_ok);
        trace.enter(if clean { CallState::Done } else { CallState::Failed });

        Ok(CallOutcome {
            symbol: callable.symbol.clone(),
            return_value,
            outputs,
            state: trace.state,
            success: callable.success.clone(),
        })
    }

    /// Encode every argument to a register word. Output parameters get an
    /// arena block for their pointee.
    #[allow(clippy::type_complexity)]
    fn encode_arguments(
        &self,
        callable: &BoundCallable,
        args: &[ManagedValue],
        arena: &mut CallArena,
    ) -> MarshalResult<(Vec<u64>, Vec<Option<OutSlot>>)> {
        let mut encoder = Encoder::new(arena).with_callbacks(&self.callbacks);
        let mut words = Vec::with_capacity(args.len());
        let mut slots = Vec::with_capacity(args.len());
        let single = ManagedValue::Capacity(1);

        for (i, (param, value)) in callable.parameters.iter().zip(args).enumerate() {
            let path = FieldPath::param(i);
            let value = match (param.direction, value) {
                (Direction::Out, ManagedValue::Null) => &single,
                (_, value) => value,
            };

            let mut word = [0u8; 8];
            encoder.encode_at(value, &param.inner, &mut word, 0, &path)?;
            let word = u64::from_le_bytes(word);
            words.push(word);

            if !param.is_output() {
                slots.push(None);
                continue;
            }
            let pointee = param
                .pointee()
                .ok_or_else(|| MarshalError::mismatch(&path, "pointer", param.inner.to_string()))?;
            let ty = match value {
                ManagedValue::Capacity(n) if *n != 1 => TypeDescriptor::array(pointee.clone(), *n)?,
                _ => pointee.clone(),
            };
            slots.push(Some(OutSlot {
                addr: word as usize,
                ty,
            }));
        }
        Ok((words, slots))
    }
}

impl Default for CallBinder {
    fn default() -> Self {
        Self::new()
    }
}
