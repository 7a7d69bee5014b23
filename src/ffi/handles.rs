//! Callback and Handle Registry
//!
//! Native code can only call plain function pointers, so managed callbacks
//! are exposed through a fixed pool of compiled `extern "C"` thunks. Each
//! thunk owns one slot; registering a callback binds it to a free slot and
//! hands out that thunk's address.
//!
//! ```text
//! native caller ──▶ thunk::<N>(a..f) ──▶ SLOTS[N] ──▶ decode args
//!                                                     ──▶ Callback::call
//!                                                     ──▶ encode return
//! ```
//!
//! Slots stay bound until explicitly unregistered (or their registry is
//! dropped). Freed slots go to the back of a FIFO quarantine and are only
//! reused once every never-used slot is gone. The most recently freed slot
//! is withheld until another slot is freed behind it.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};

use crate::config::CallbackConfig;
use crate::descriptor::{FunctionPrototype, TypeDescriptor, TypeKind};
use crate::error::{FieldPath, MarshalError, MarshalResult};
use crate::marshal::{primitive_bits, Decoder, ProcessMemory};
use crate::value::{Callback, ManagedValue, RawHandle};

/// Number of compiled callback thunks
pub const CALLBACK_SLOTS: usize = 32;

/// Integer-class arguments a callback thunk receives
pub const MAX_CALLBACK_ARGS: usize = 6;

type ThunkFn = extern "C" fn(u64, u64, u64, u64, u64, u64) -> u64;

extern "C" fn thunk<const SLOT: usize>(a: u64, b: u64, c: u64, d: u64, e: u64, f: u64) -> u64 {
    dispatch(SLOT, [a, b, c, d, e, f])
}

macro_rules! thunk_table {
    ($($slot:literal)*) => {
        static THUNKS: [ThunkFn; CALLBACK_SLOTS] = [$(thunk::<$slot>),*];
    };
}

thunk_table!(
    0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15
    16 17 18 19 20 21 22 23 24 25 26 27 28 29 30 31
);

struct SlotEntry {
    callback: Callback,
    prototype: FunctionPrototype,
}

static SLOTS: Lazy<RwLock<Vec<Option<Arc<SlotEntry>>>>> =
    Lazy::new(|| RwLock::new(vec![None; CALLBACK_SLOTS]));

#[derive(Default)]
pub(super) struct SlotPool {
    /// Next never-used slot
    fresh: usize,
    /// Released slots, oldest first
    quarantine: VecDeque<usize>,
    /// Most recent release, withheld while it is the only candidate
    last_released: Option<usize>,
}

impl SlotPool {
    /// Never-used slots first, then the oldest released slot outside
    /// `avoid`. The slot released last is never handed out next.
    pub(super) fn acquire(&mut self, avoid: &[usize]) -> Option<usize> {
        if self.fresh < CALLBACK_SLOTS {
            self.fresh += 1;
            return Some(self.fresh - 1);
        }
        let pos = self
            .quarantine
            .iter()
            .position(|s| Some(*s) != self.last_released && !avoid.contains(s))?;
        self.quarantine.remove(pos)
    }

    pub(super) fn release(&mut self, slot: usize) {
        self.quarantine.push_back(slot);
        self.last_released = Some(slot);
    }
}

static POOL: Lazy<Mutex<SlotPool>> = Lazy::new(|| Mutex::new(SlotPool::default()));

fn acquire_slot(avoid: &[usize]) -> Option<usize> {
    POOL.lock().acquire(avoid)
}

fn release_slot(slot: usize) {
    SLOTS.write()[slot] = None;
    POOL.lock().release(slot);
}

fn thunk_address(slot: usize) -> usize {
    THUNKS[slot] as usize
}

/// Entry point shared by every thunk
fn dispatch(slot: usize, words: [u64; MAX_CALLBACK_ARGS]) -> u64 {
    let entry = SLOTS.read().get(slot).cloned().flatten();
    let Some(entry) = entry else {
        log::warn!("[callbacks] revoked slot {} invoked by native code, returning 0", slot);
        return 0;
    };

    // Unwinding into native frames is undefined behavior
    match catch_unwind(AssertUnwindSafe(|| entry.invoke(&words))) {
        Ok(Ok(bits)) => bits,
        Ok(Err(e)) => {
            log::warn!("[callbacks] slot {} failed: {}", slot, e);
            0
        }
        Err(_) => {
            log::warn!("[callbacks] slot {} panicked, returning 0", slot);
            0
        }
    }
}

impl SlotEntry {
    fn invoke(&self, words: &[u64; MAX_CALLBACK_ARGS]) -> MarshalResult<u64> {
        // Safety: pointer arguments come from the native caller and are
        // valid for the duration of the callback.
        let memory = unsafe { ProcessMemory::new() };
        let decoder = Decoder::new(&memory);

        let mut args = Vec::with_capacity(self.prototype.param_types.len());
        for (word, ty) in words.iter().zip(&self.prototype.param_types) {
            args.push(decoder.decode(&word.to_le_bytes(), ty, 0)?);
        }
        let result = self.callback.call(&args);
        return_bits(&result, &self.prototype.return_type)
    }
}

fn return_bits(value: &ManagedValue, ty: &TypeDescriptor) -> MarshalResult<u64> {
    let root = FieldPath::root();
    match ty.resolved().kind() {
        TypeKind::Void => Ok(0),
        TypeKind::Primitive(kind, _) => primitive_bits(value, *kind, &root),
        TypeKind::Pointer(_) => match value {
            ManagedValue::Null => Ok(0),
            ManagedValue::Pointer(addr) => Ok(*addr as u64),
            ManagedValue::Handle(handle) => Ok(handle.raw as u64),
            other => Err(MarshalError::mismatch(&root, ty.to_string(), other.type_name())),
        },
        _ => Err(MarshalError::UnsupportedSignature(format!(
            "callback return type {}",
            ty
        ))),
    }
}

/// Validate a prototype for thunk dispatch
fn check_prototype(prototype: &TypeDescriptor) -> MarshalResult<FunctionPrototype> {
    let TypeKind::Function(proto) = prototype.resolved().kind() else {
        return Err(MarshalError::UnsupportedSignature(format!(
            "{} is not a function prototype",
            prototype
        )));
    };
    if proto.param_types.len() > MAX_CALLBACK_ARGS {
        return Err(MarshalError::UnsupportedSignature(format!(
            "callback with {} parameters (max {})",
            proto.param_types.len(),
            MAX_CALLBACK_ARGS
        )));
    }
    let register_class = |ty: &TypeDescriptor| match ty.resolved().kind() {
        TypeKind::Primitive(kind, _) => !kind.is_float(),
        TypeKind::Pointer(_) => true,
        _ => false,
    };
    if let Some(param) = proto.param_types.iter().find(|p| !register_class(p)) {
        return Err(MarshalError::UnsupportedSignature(format!(
            "callback parameter of type {}",
            param
        )));
    }
    if !proto.return_type.is_void() && !register_class(&proto.return_type) {
        return Err(MarshalError::UnsupportedSignature(format!(
            "callback return type {}",
            proto.return_type
        )));
    }
    Ok(proto.clone())
}

struct Registration {
    callback: Callback,
    prototype: TypeDescriptor,
    slot: usize,
}

/// Managed callback -> native thunk address mapping
pub struct HandleRegistry {
    registrations: Mutex<Vec<Registration>>,
    /// Slots previously held by revoked callbacks, newest last
    retired: Mutex<VecDeque<(Callback, usize)>>,
    max_slots: usize,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::with_config(&CallbackConfig::default())
    }

    pub fn with_config(config: &CallbackConfig) -> Self {
        Self {
            registrations: Mutex::new(Vec::new()),
            retired: Mutex::new(VecDeque::new()),
            max_slots: config.max_slots.min(CALLBACK_SLOTS),
        }
    }

    /// Native address for `callback` under `prototype`.
    ///
    /// Registering the same callback for the same prototype again returns
    /// the address handed out the first time.
    pub fn register(&self, callback: &Callback, prototype: &TypeDescriptor) -> MarshalResult<usize> {
        let mut registrations = self.registrations.lock();
        if let Some(existing) = registrations
            .iter()
            .find(|r| r.callback == *callback && r.prototype == *prototype)
        {
            return Ok(thunk_address(existing.slot));
        }

        let checked = check_prototype(prototype)?;
        if registrations.len() >= self.max_slots {
            return Err(MarshalError::CallbackSlotsExhausted {
                capacity: self.max_slots,
            });
        }
        let slot = {
            let mut retired = self.retired.lock();
            let avoid: Vec<usize> = retired
                .iter()
                .filter(|(cb, _)| cb == callback)
                .map(|(_, slot)| *slot)
                .collect();
            let slot = acquire_slot(&avoid).ok_or(MarshalError::CallbackSlotsExhausted {
                capacity: CALLBACK_SLOTS,
            })?;
            retired.retain(|(cb, _)| cb != callback);
            slot
        };

        SLOTS.write()[slot] = Some(Arc::new(SlotEntry {
            callback: callback.clone(),
            prototype: checked,
        }));
        registrations.push(Registration {
            callback: callback.clone(),
            prototype: prototype.clone(),
            slot,
        });
        let addr = thunk_address(slot);
        log::debug!("[callbacks] registered {:?} in slot {} at {:#x}", callback, slot, addr);
        Ok(addr)
    }

    /// Revoke every registration of `callback`. Returns whether any existed.
    pub fn unregister(&self, callback: &Callback) -> bool {
        let mut registrations = self.registrations.lock();
        let mut retired = self.retired.lock();
        let before = registrations.len();
        registrations.retain(|r| {
            if r.callback == *callback {
                release_slot(r.slot);
                if retired.len() == CALLBACK_SLOTS {
                    retired.pop_front();
                }
                retired.push_back((callback.clone(), r.slot));
                log::debug!("[callbacks] revoked {:?} from slot {}", callback, r.slot);
                false
            } else {
                true
            }
        });
        registrations.len() != before
    }

    /// Address currently bound to `callback` under `prototype`
    pub fn address_of(&self, callback: &Callback, prototype: &TypeDescriptor) -> Option<usize> {
        self.registrations
            .lock()
            .iter()
            .find(|r| r.callback == *callback && r.prototype == *prototype)
            .map(|r| thunk_address(r.slot))
    }

    /// Register for the lifetime of the returned guard
    pub fn register_scoped<'r>(
        &'r self,
        callback: &Callback,
        prototype: &TypeDescriptor,
    ) -> MarshalResult<CallbackGuard<'r>> {
        let address = self.register(callback, prototype)?;
        Ok(CallbackGuard {
            registry: self,
            callback: callback.clone(),
            address,
        })
    }

    pub fn len(&self) -> usize {
        self.registrations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.lock().is_empty()
    }
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HandleRegistry {
    fn drop(&mut self) {
        for registration in self.registrations.get_mut().drain(..) {
            release_slot(registration.slot);
        }
    }
}

/// Unregisters its callback when dropped
pub struct CallbackGuard<'r> {
    registry: &'r HandleRegistry,
    callback: Callback,
    address: usize,
}

impl CallbackGuard<'_> {
    pub fn address(&self) -> usize {
        self.address
    }
}

impl Drop for CallbackGuard<'_> {
    fn drop(&mut self) {
        self.registry.unregister(&self.callback);
    }
}

type Closer = Box<dyn FnOnce(&RawHandle) + Send>;

/// Closes adopted native handles in reverse order when dropped
#[derive(Default)]
pub struct HandleScope {
    handles: Vec<(RawHandle, Closer)>,
}

impl HandleScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `handle`; `close` runs when the scope ends.
    /// Null handles are returned without being tracked.
    pub fn adopt<F>(&mut self, handle: RawHandle, close: F) -> RawHandle
    where
        F: FnOnce(&RawHandle) + Send + 'static,
    {
        if !handle.is_null() {
            self.handles.push((handle.clone(), Box::new(close)));
        }
        handle
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Drop for HandleScope {
    fn drop(&mut self) {
        while let Some((handle, close)) = self.handles.pop() {
            log::debug!("[handles] closing {} {:#x}", handle.kind, handle.raw);
            close(&handle);
        }
    }
}

/// Memory the native side allocated and handed back through an out pointer
pub struct NativeAllocation {
    addr: usize,
    len: Option<usize>,
    release: Option<Box<dyn FnOnce(usize) + Send>>,
}

impl NativeAllocation {
    /// Own `addr`, releasing it with `release` (e.g. `LocalFree`) on drop
    pub fn new<F>(addr: usize, len: Option<usize>, release: F) -> Self
    where
        F: FnOnce(usize) + Send + 'static,
    {
        Self {
            addr,
            len,
            release: Some(Box::new(release)),
        }
    }

    /// Own memory from the C runtime heap (`malloc`, `strdup`, ...)
    pub fn from_malloc(addr: usize, len: Option<usize>) -> Self {
        Self::new(addr, len, |addr| {
            // Safety: the constructor's caller hands over a live malloc block
            unsafe { libc::free(addr as *mut libc::c_void) }
        })
    }

    pub fn addr(&self) -> usize {
        self.addr
    }

    /// Size in bytes, when the native API reports it
    pub fn len(&self) -> Option<usize> {
        self.len
    }

    pub fn is_null(&self) -> bool {
        self.addr == 0
    }

    /// Give up ownership without releasing
    pub fn into_raw(mut self) -> usize {
        self.release = None;
        self.addr
    }
}

impl std::fmt::Debug for NativeAllocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NativeAllocation({:#x}, {:?})", self.addr, self.len)
    }
}

impl Drop for NativeAllocation {
    fn drop(&mut self) {
        if self.addr == 0 {
            return;
        }
        if let Some(release) = self.release.take() {
            release(self.addr);
        }
    }
}
