use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::config::BridgeConfig;
use crate::error::{ArenaRegion, BridgeError, BridgeResult};
use crate::signature::MAX_ALIGN;

const REGION_ALIGN: usize = MAX_ALIGN;

struct Region {
    kind: ArenaRegion,
    base: NonNull<u8>,
    layout: Layout,
    capacity: usize,
    mark: Cell<usize>,
}

impl Region {
    fn new(kind: ArenaRegion, size: usize, reserved: usize) -> BridgeResult<Self> {
        let layout = Layout::from_size_align(size.max(REGION_ALIGN), REGION_ALIGN).map_err(|err| {
            BridgeError::Native(format!("invalid {} region layout: {err}", kind.name()))
        })?;
        let base = NonNull::new(unsafe { alloc_zeroed(layout) }).ok_or_else(|| {
            BridgeError::Native(format!(
                "failed to allocate {} bytes for the arena {} region",
                layout.size(),
                kind.name()
            ))
        })?;
        Ok(Self {
            kind,
            base,
            layout,
            capacity: size.saturating_sub(reserved),
            mark: Cell::new(0),
        })
    }

    fn available(&self) -> usize {
        self.capacity.saturating_sub(self.mark.get())
    }

    fn allocate(&self, size: usize, align: usize) -> BridgeResult<NonNull<u8>> {
        let align = align.clamp(1, REGION_ALIGN);
        let start = self.mark.get().div_ceil(align) * align;
        let end = start.checked_add(size).filter(|end| *end <= self.capacity);
        let Some(end) = end else {
            return Err(BridgeError::ArenaExhausted {
                region: self.kind,
                requested: size,
                available: self.available(),
            });
        };
        self.mark.set(end);
        let ptr = unsafe { self.base.as_ptr().add(start) };
        unsafe { std::ptr::write_bytes(ptr, 0, size) };
        // `base` is non-null and `start` stays inside the allocation.
        Ok(unsafe { NonNull::new_unchecked(ptr) })
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

/// Both high-water marks of a [`CallArena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArenaWatermark {
    pub stack: usize,
    pub heap: usize,
}

/// Scratch memory for call frames: a stack region for staged stack
/// arguments and a heap region for strings, by-reference records and out
/// cells. Allocation happens through LIFO [`ArenaScope`]s.
pub struct CallArena {
    stack: Region,
    heap: Region,
    heap_headroom: usize,
    depth: Cell<usize>,
}

impl CallArena {
    pub fn new(config: &BridgeConfig) -> BridgeResult<Self> {
        Ok(Self {
            stack: Region::new(ArenaRegion::Stack, config.stack_size, config.redzone)?,
            heap: Region::new(ArenaRegion::Heap, config.heap_size, 0)?,
            heap_headroom: config.heap_headroom,
            depth: Cell::new(0),
        })
    }

    pub fn scope(&self) -> ArenaScope<'_> {
        let depth = self.depth.get() + 1;
        self.depth.set(depth);
        ArenaScope {
            arena: self,
            saved: self.watermark(),
            depth,
            standalone: RefCell::new(Vec::new()),
        }
    }

    pub fn watermark(&self) -> ArenaWatermark {
        ArenaWatermark {
            stack: self.stack.mark.get(),
            heap: self.heap.mark.get(),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth.get()
    }

    pub fn stack_capacity(&self) -> usize {
        self.stack.capacity
    }

    pub fn heap_capacity(&self) -> usize {
        self.heap.capacity
    }
}

/// Marks saved at acquire time are restored when the scope is dropped.
pub struct ArenaScope<'a> {
    arena: &'a CallArena,
    saved: ArenaWatermark,
    depth: usize,
    standalone: RefCell<Vec<Box<[u8]>>>,
}

impl<'a> ArenaScope<'a> {
    pub fn arena(&self) -> &'a CallArena {
        self.arena
    }

    fn ensure_innermost(&self) -> BridgeResult<()> {
        if self.arena.depth.get() != self.depth {
            return Err(BridgeError::ArenaScopeViolation);
        }
        Ok(())
    }

    pub fn stack_alloc(&self, size: usize, align: usize) -> BridgeResult<ArenaSlice<'_>> {
        self.ensure_innermost()?;
        let ptr = self.arena.stack.allocate(size, align)?;
        Ok(ArenaSlice::new(ptr, size))
    }

    pub fn heap_alloc(&self, size: usize, align: usize) -> BridgeResult<ArenaSlice<'_>> {
        self.ensure_innermost()?;
        let ptr = self.arena.heap.allocate(size, align)?;
        Ok(ArenaSlice::new(ptr, size))
    }

    /// Scratch for a NUL-terminated string; long strings get a standalone
    /// buffer owned by this scope instead of eating the heap headroom.
    pub fn string_alloc(&self, size: usize, align: usize) -> BridgeResult<ArenaSlice<'_>> {
        self.ensure_innermost()?;
        let headroom = self.arena.heap_headroom;
        if self.arena.heap.available() >= size.saturating_add(headroom) {
            return self.heap_alloc(size, align);
        }
        // Box<[u8]> is only byte aligned; over-allocate so wide strings fit.
        let mut buffer = vec![0u8; size + align.max(1)].into_boxed_slice();
        let base = buffer.as_mut_ptr();
        let offset = base.align_offset(align.max(1));
        let ptr = unsafe { base.add(offset) };
        self.standalone.borrow_mut().push(buffer);
        NonNull::new(ptr)
            .map(|ptr| ArenaSlice::new(ptr, size))
            .ok_or_else(|| BridgeError::Native("standalone string buffer is null".to_string()))
    }

    pub fn watermark(&self) -> ArenaWatermark {
        self.arena.watermark()
    }
}

impl Drop for ArenaScope<'_> {
    fn drop(&mut self) {
        self.arena.stack.mark.set(self.saved.stack);
        self.arena.heap.mark.set(self.saved.heap);
        self.arena.depth.set(self.depth - 1);
    }
}

/// Zero-initialised bytes inside an arena region, valid while the owning
/// scope is alive.
#[derive(Clone, Copy, Debug)]
pub struct ArenaSlice<'s> {
    ptr: NonNull<u8>,
    len: usize,
    _scope: PhantomData<&'s ()>,
}

impl ArenaSlice<'_> {
    fn new(ptr: NonNull<u8>, len: usize) -> Self {
        Self {
            ptr,
            len,
            _scope: PhantomData,
        }
    }

    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn write_at(&self, offset: usize, bytes: &[u8]) -> BridgeResult<()> {
        if offset.checked_add(bytes.len()).is_none_or(|end| end > self.len) {
            return Err(BridgeError::Native(format!(
                "write of {} bytes at offset {offset} overruns a {}-byte arena slice",
                bytes.len(),
                self.len
            )));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.as_ptr().add(offset), bytes.len());
        }
        Ok(())
    }

    pub fn to_vec(&self) -> Vec<u8> {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }.to_vec()
    }
}
