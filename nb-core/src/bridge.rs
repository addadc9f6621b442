use std::cell::{Cell, OnceCell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use tracing::debug;

use crate::abi::{Abi, ClassifiedSignature, classify};
use crate::arena::{ArenaWatermark, CallArena};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::frame::{self, CallbackBinder};
use crate::marshal::{MarshalContext, decode_value, read_image};
use crate::native::Invoker;
use crate::result::demarshal_return;
use crate::signature::{SignatureDescriptor, TypeDescriptor};
use crate::trampoline::{Binding, CallbackEntry, SlotState, TrampolinePool, callback_entry};
use crate::value::{ManagedCallable, Value};

/// A signature classified once for the bridge's ABI.
#[derive(Clone, Debug)]
pub struct PreparedCall {
    classified: Arc<ClassifiedSignature>,
}

impl PreparedCall {
    pub fn signature(&self) -> &Arc<SignatureDescriptor> {
        &self.classified.signature
    }

    pub fn classified(&self) -> &ClassifiedSignature {
        &self.classified
    }
}

/// One native call in flight.
struct CallLevel {
    generation: u64,
    slots: Vec<usize>,
    pending: Option<BridgeError>,
    /// Storage handed to native code by callbacks of this call.
    retained: Vec<Box<[u64]>>,
}

pub(crate) struct BridgeShared {
    abi: Abi,
    config: BridgeConfig,
    arena: CallArena,
    invoker: Invoker,
    pool: OnceCell<TrampolinePool>,
    levels: RefCell<Vec<CallLevel>>,
    generation: Cell<u64>,
    prototypes: RefCell<HashMap<usize, Arc<ClassifiedSignature>>>,
}

impl BridgeShared {
    pub(crate) fn arena(&self) -> &CallArena {
        &self.arena
    }

    pub(crate) fn pool(&self) -> BridgeResult<&TrampolinePool> {
        self.pool
            .get()
            .ok_or_else(|| BridgeError::Native("trampoline pool is not initialised".to_string()))
    }

    pub(crate) fn is_live(&self, generation: u64) -> bool {
        self.levels
            .borrow()
            .iter()
            .any(|level| level.generation == generation)
    }

    pub(crate) fn has_pending(&self) -> bool {
        self.levels
            .borrow()
            .last()
            .is_some_and(|level| level.pending.is_some())
    }

    /// Keep the first error raised while the innermost call is running.
    pub(crate) fn record_pending(&self, error: BridgeError) {
        if let Some(level) = self.levels.borrow_mut().last_mut() {
            if level.pending.is_none() {
                level.pending = Some(error);
            }
        }
    }

    fn classify_prototype(
        &self,
        prototype: &Arc<SignatureDescriptor>,
    ) -> BridgeResult<Arc<ClassifiedSignature>> {
        let key = Arc::as_ptr(prototype) as usize;
        if let Some(classified) = self.prototypes.borrow().get(&key) {
            return Ok(classified.clone());
        }
        let classified = Arc::new(classify(self.abi, prototype.clone())?);
        self.prototypes.borrow_mut().insert(key, classified.clone());
        Ok(classified)
    }

    fn reserve(
        &self,
        callable: &Rc<dyn ManagedCallable>,
        prototype: &Arc<SignatureDescriptor>,
    ) -> BridgeResult<(usize, usize)> {
        let classified = self.classify_prototype(prototype)?;
        self.pool()?.reserve(Binding {
            callable: callable.clone(),
            classified,
        })
    }

    fn release_slots(&self, slots: &[usize]) {
        if let Ok(pool) = self.pool() {
            for slot in slots {
                pool.release(*slot);
            }
        }
    }

    fn begin_level(&self, slots: Vec<usize>) -> u64 {
        let generation = self.generation.get() + 1;
        self.generation.set(generation);
        if let Ok(pool) = self.pool() {
            for slot in &slots {
                pool.arm(*slot, generation);
            }
        }
        self.levels.borrow_mut().push(CallLevel {
            generation,
            slots,
            pending: None,
            retained: Vec::new(),
        });
        generation
    }

    fn end_level(&self) -> Option<CallLevel> {
        let level = self.levels.borrow_mut().pop()?;
        self.release_slots(&level.slots);
        Some(level)
    }
}

/// Storage for values a callback returns to native code. It stays valid
/// until the call that invoked the callback returns.
impl MarshalContext for BridgeShared {
    fn store(&self, bytes: &[u8], _align: usize) -> BridgeResult<usize> {
        let mut words = vec![0u64; bytes.len().div_ceil(8).max(1)].into_boxed_slice();
        let address = words.as_mut_ptr() as usize;
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len()) };
        let mut levels = self.levels.borrow_mut();
        let level = levels.last_mut().ok_or_else(|| {
            BridgeError::Native("callback storage requested outside a native call".to_string())
        })?;
        level.retained.push(words);
        Ok(address)
    }

    fn bind_callback(
        &self,
        callable: &Rc<dyn ManagedCallable>,
        prototype: &Arc<SignatureDescriptor>,
    ) -> BridgeResult<usize> {
        let (slot, address) = self.reserve(callable, prototype)?;
        let mut levels = self.levels.borrow_mut();
        let Some(level) = levels.last_mut() else {
            drop(levels);
            self.release_slots(&[slot]);
            return Err(BridgeError::Native(
                "callback bound outside a native call".to_string(),
            ));
        };
        level.slots.push(slot);
        let generation = level.generation;
        drop(levels);
        self.pool()?.arm(slot, generation);
        Ok(address)
    }
}

/// Collects the trampolines reserved while one frame is built.
struct FrameBinder<'b> {
    shared: &'b BridgeShared,
    reserved: RefCell<Vec<usize>>,
}

impl CallbackBinder for FrameBinder<'_> {
    fn bind(
        &self,
        callable: &Rc<dyn ManagedCallable>,
        prototype: &Arc<SignatureDescriptor>,
    ) -> BridgeResult<usize> {
        let (slot, address) = self.shared.reserve(callable, prototype)?;
        self.reserved.borrow_mut().push(slot);
        Ok(address)
    }
}

/// Native call context for the host ABI: call arena, invoker stubs and the
/// callback trampoline pool. Re-entrant through callbacks but bound to the
/// thread that created it.
#[derive(Clone)]
pub struct Bridge {
    shared: Rc<BridgeShared>,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> BridgeResult<Self> {
        let abi = Abi::host().ok_or_else(|| {
            BridgeError::UnsupportedHost(format!(
                "no ABI support for {}",
                std::env::consts::ARCH
            ))
        })?;
        let invoker = Invoker::new(abi)?;
        let arena = CallArena::new(&config)?;
        let capacity = config.trampoline_capacity();
        let shared = Rc::new(BridgeShared {
            abi,
            config,
            arena,
            invoker,
            pool: OnceCell::new(),
            levels: RefCell::new(Vec::new()),
            generation: Cell::new(0),
            prototypes: RefCell::new(HashMap::new()),
        });

        let entry: CallbackEntry = callback_entry;
        let pool = TrampolinePool::new(abi, capacity, Rc::as_ptr(&shared) as usize, entry as usize)?;
        if shared.pool.set(pool).is_err() {
            return Err(BridgeError::Native("trampoline pool initialised twice".to_string()));
        }
        debug!(
            abi = abi.name(),
            stack = shared.arena.stack_capacity(),
            heap = shared.arena.heap_capacity(),
            trampolines = capacity,
            "bridge ready"
        );
        Ok(Self { shared })
    }

    /// Reconstruct a handle from the address embedded in the thunks.
    ///
    /// # Safety
    /// `shared` must come from `Rc::as_ptr` of a live bridge.
    pub(crate) unsafe fn from_raw_shared(shared: *const BridgeShared) -> Self {
        unsafe {
            Rc::increment_strong_count(shared);
            Self {
                shared: Rc::from_raw(shared),
            }
        }
    }

    pub(crate) fn shared(&self) -> &BridgeShared {
        &self.shared
    }

    pub fn abi(&self) -> Abi {
        self.shared.abi
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.shared.config
    }

    /// Classify `signature` once; callback prototypes of its parameters are
    /// classified and cached as well.
    pub fn prepare(&self, signature: Arc<SignatureDescriptor>) -> BridgeResult<PreparedCall> {
        for slot in signature.parameters() {
            if let Some(prototype) = slot.ty.prototype() {
                self.shared.classify_prototype(prototype)?;
            }
        }
        let classified = classify(self.shared.abi, signature)?;
        Ok(PreparedCall {
            classified: Arc::new(classified),
        })
    }

    /// Call `target` with `args` marshaled per `prepared`.
    ///
    /// # Safety
    /// `target` must be the address of a native function whose C signature
    /// matches `prepared`, and every pointer passed as a value must be valid
    /// for the accesses the function performs.
    pub unsafe fn call(
        &self,
        prepared: &PreparedCall,
        target: usize,
        args: &[Value],
    ) -> BridgeResult<Value> {
        unsafe { self.invoke(&prepared.classified, target, args) }
    }

    /// Call a variadic function. `extra` lists the arguments after the
    /// fixed parameters together with their types; default argument
    /// promotions are applied.
    ///
    /// # Safety
    /// Same contract as [`Bridge::call`].
    pub unsafe fn call_variadic(
        &self,
        prepared: &PreparedCall,
        target: usize,
        args: &[Value],
        extra: &[(Arc<TypeDescriptor>, Value)],
    ) -> BridgeResult<Value> {
        let types: Vec<Arc<TypeDescriptor>> = extra.iter().map(|(ty, _)| ty.clone()).collect();
        let signature = prepared.signature().with_variadic_args(&types)?;
        let classified = classify(self.shared.abi, signature)?;
        let mut values = args.to_vec();
        values.extend(extra.iter().map(|(_, value)| value.clone()));
        unsafe { self.invoke(&classified, target, &values) }
    }

    unsafe fn invoke(
        &self,
        classified: &ClassifiedSignature,
        target: usize,
        args: &[Value],
    ) -> BridgeResult<Value> {
        let shared = &*self.shared;
        if classified.abi != shared.invoker.abi() {
            return Err(BridgeError::UnsupportedHost(format!(
                "signature classified for {} cannot run on {}",
                classified.abi,
                shared.invoker.abi()
            )));
        }
        if target == 0 {
            return Err(BridgeError::Native("call target is null".to_string()));
        }

        let scope = shared.arena.scope();
        let binder = FrameBinder {
            shared,
            reserved: RefCell::new(Vec::new()),
        };
        let frame = match frame::build(classified, args, &scope, &binder) {
            Ok(frame) => frame,
            Err(err) => {
                shared.release_slots(&binder.reserved.borrow());
                return Err(err);
            }
        };

        let mut block = frame.block.clone();
        let generation = shared.begin_level(binder.reserved.into_inner());
        unsafe {
            shared
                .invoker
                .invoke(classified.forward_fp, target, frame.stack_area(), &mut block);
        }
        let level = shared.end_level();
        debug_assert!(level.as_ref().is_none_or(|level| level.generation == generation));

        for writeback in &frame.writebacks {
            let image = unsafe { read_image(writeback.address, writeback.ty.size()) };
            let value = decode_value(&writeback.ty, &image, writeback.dispose);
            *writeback.cell.borrow_mut() = value;
        }
        if let Some(error) = level.and_then(|level| level.pending) {
            return Err(error);
        }
        Ok(demarshal_return(classified, &block, frame.hidden_result()))
    }

    /// Current marks of the call arena; equal before and after any call.
    pub fn arena_watermark(&self) -> ArenaWatermark {
        self.shared.arena.watermark()
    }

    /// Trampolines currently reserved or armed.
    pub fn live_trampolines(&self) -> usize {
        self.shared.pool().map(TrampolinePool::live).unwrap_or(0)
    }

    pub fn trampoline_capacity(&self) -> usize {
        self.shared.pool().map(TrampolinePool::capacity).unwrap_or(0)
    }

    pub fn trampoline_state(&self, slot: usize) -> Option<SlotState> {
        self.shared.pool().ok().and_then(|pool| pool.state(slot))
    }

    /// Depth of live call levels, zero outside any native call.
    pub fn call_depth(&self) -> usize {
        self.shared.levels.borrow().len()
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("abi", &self.shared.abi)
            .field("depth", &self.call_depth())
            .field("live_trampolines", &self.live_trampolines())
            .finish()
    }
}
