use std::cell::{Cell, RefCell};
use std::panic::AssertUnwindSafe;
use std::rc::Rc;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::abi::{Abi, ClassifiedSignature};
use crate::bridge::{Bridge, BridgeShared};
use crate::error::{BridgeError, BridgeResult};
use crate::native::{ExecutableMemory, RegisterBlock, emit_thunk};
use crate::result::{incoming_hidden_pointer, read_arguments, write_return, zero_return};
use crate::value::ManagedCallable;

/// Upper bound on live callback trampolines per bridge.
pub const MAX_TRAMPOLINES: usize = 32;

const THUNK_ALIGN: usize = 16;

pub(crate) type CallbackEntry = extern "C" fn(*const BridgeShared, usize, *mut RegisterBlock);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Free,
    /// Bound while the owning call frame is being built.
    Reserved,
    /// Callable during the call that carries this generation.
    Armed(u64),
}

#[derive(Clone)]
pub(crate) struct Binding {
    pub callable: Rc<dyn ManagedCallable>,
    pub classified: Arc<ClassifiedSignature>,
}

struct TrampolineSlot {
    /// Thunk addresses: FP-avoiding first, then the variant forwarding
    /// vector registers.
    entries: [usize; 2],
    state: SlotState,
    binding: Option<Binding>,
    /// Kept after release so a stale x86 caller still gets its stack fixed.
    callee_pop: u32,
}

/// Snapshot of a slot taken by the dispatcher before running the callable.
pub(crate) struct SlotView {
    pub state: SlotState,
    pub binding: Option<Binding>,
    pub callee_pop: u32,
}

/// Fixed set of callback thunks in one executable region. Every thunk
/// embeds the bridge's shared state address and its own slot index.
pub(crate) struct TrampolinePool {
    _memory: ExecutableMemory,
    slots: RefCell<Vec<TrampolineSlot>>,
    cursor: Cell<usize>,
}

impl TrampolinePool {
    pub(crate) fn new(abi: Abi, capacity: usize, shared: usize, entry: usize) -> BridgeResult<Self> {
        let mut code = Vec::new();
        let mut offsets = Vec::with_capacity(capacity);
        for slot in 0..capacity {
            let mut pair = [0usize; 2];
            for (variant, forward_fp) in [false, true].into_iter().enumerate() {
                while code.len() % THUNK_ALIGN != 0 {
                    code.push(0);
                }
                pair[variant] = code.len();
                code.extend(emit_thunk(abi, forward_fp, shared as u64, slot as u64, entry as u64));
            }
            offsets.push(pair);
        }
        let memory = ExecutableMemory::from_code(&code)?;
        let slots = offsets
            .into_iter()
            .map(|pair| TrampolineSlot {
                entries: [memory.addr_at(pair[0]), memory.addr_at(pair[1])],
                state: SlotState::Free,
                binding: None,
                callee_pop: 0,
            })
            .collect();
        debug!(abi = abi.name(), capacity, bytes = code.len(), "trampoline pool ready");
        Ok(Self {
            _memory: memory,
            slots: RefCell::new(slots),
            cursor: Cell::new(0),
        })
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.borrow().len()
    }

    /// Bind `binding` to the next free slot, round-robin, returning the
    /// slot index and the thunk address native code should call.
    pub(crate) fn reserve(&self, binding: Binding) -> BridgeResult<(usize, usize)> {
        let mut slots = self.slots.borrow_mut();
        let capacity = slots.len();
        let start = self.cursor.get();
        let index = (0..capacity)
            .map(|step| (start + step) % capacity)
            .find(|index| slots[*index].state == SlotState::Free)
            .ok_or(BridgeError::TrampolinesExhausted { capacity })?;
        self.cursor.set((index + 1) % capacity);

        let slot = &mut slots[index];
        let forward_fp = binding.classified.forward_fp;
        slot.callee_pop = binding.classified.callee_pop;
        slot.state = SlotState::Reserved;
        slot.binding = Some(binding);
        let address = slot.entries[usize::from(forward_fp)];
        debug!(slot = index, forward_fp, "reserved callback trampoline");
        Ok((index, address))
    }

    pub(crate) fn arm(&self, index: usize, generation: u64) {
        if let Some(slot) = self.slots.borrow_mut().get_mut(index) {
            slot.state = SlotState::Armed(generation);
        }
    }

    pub(crate) fn release(&self, index: usize) {
        if let Some(slot) = self.slots.borrow_mut().get_mut(index) {
            slot.state = SlotState::Free;
            slot.binding = None;
            debug!(slot = index, "released callback trampoline");
        }
    }

    pub(crate) fn view(&self, index: usize) -> Option<SlotView> {
        self.slots.borrow().get(index).map(|slot| SlotView {
            state: slot.state,
            binding: slot.binding.clone(),
            callee_pop: slot.callee_pop,
        })
    }

    pub(crate) fn state(&self, index: usize) -> Option<SlotState> {
        self.slots.borrow().get(index).map(|slot| slot.state)
    }

    pub(crate) fn live(&self) -> usize {
        self.slots
            .borrow()
            .iter()
            .filter(|slot| slot.state != SlotState::Free)
            .count()
    }
}

/// Target of every thunk. Never unwinds into native code.
pub(crate) extern "C" fn callback_entry(
    shared: *const BridgeShared,
    slot: usize,
    block: *mut RegisterBlock,
) {
    if shared.is_null() || block.is_null() {
        return;
    }
    // The thunks only exist while the pool, and so the shared state, is alive.
    let bridge = unsafe { Bridge::from_raw_shared(shared) };
    let block = unsafe { &mut *block };
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| dispatch(&bridge, slot, block)));
    if let Err(payload) = outcome {
        let message = panic_message(payload.as_ref());
        warn!(slot, %message, "callback panicked");
        zero_return(block);
        bridge.shared().record_pending(BridgeError::Managed(format!("callback panicked: {message}")));
    }
}

fn dispatch(bridge: &Bridge, slot: usize, block: &mut RegisterBlock) {
    let shared = bridge.shared();
    let Some(view) = shared.pool().ok().and_then(|pool| pool.view(slot)) else {
        zero_return(block);
        return;
    };
    block.callee_pop = u64::from(view.callee_pop);

    let live = match view.state {
        SlotState::Armed(generation) => shared.is_live(generation),
        SlotState::Free | SlotState::Reserved => false,
    };
    let binding = match view.binding {
        Some(binding) if live => binding,
        _ => {
            warn!(slot, state = ?view.state, "stale callback invocation");
            zero_return(block);
            shared.record_pending(BridgeError::StaleCallbackInvocation { slot });
            return;
        }
    };
    if shared.has_pending() {
        zero_return(block);
        return;
    }

    let _scope = shared.arena().scope();
    let classified = &binding.classified;
    let args = unsafe { read_arguments(classified, block) };
    let hidden = unsafe { incoming_hidden_pointer(classified, block) };
    let outcome = binding
        .callable
        .call(bridge, &args)
        .and_then(|value| write_return(classified, block, &value, hidden, shared));
    if let Err(err) = outcome {
        warn!(slot, error = %err, "callback failed");
        zero_return(block);
        shared.record_pending(err);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
