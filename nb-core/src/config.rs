use crate::trampoline::MAX_TRAMPOLINES;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Bytes available for staged stack arguments across nested calls.
    pub stack_size: usize,
    /// Bytes of scratch for strings, by-reference records and out cells.
    pub heap_size: usize,
    /// Tail of the stack region that allocations never touch.
    pub redzone: usize,
    /// Heap bytes kept free for marshaling; longer strings get their own buffer.
    pub heap_headroom: usize,
    pub max_trampolines: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            stack_size: 256 * 1024,
            heap_size: 1024 * 1024,
            redzone: 512,
            heap_headroom: 64 * 1024,
            max_trampolines: MAX_TRAMPOLINES,
        }
    }
}

impl BridgeConfig {
    pub(crate) fn trampoline_capacity(&self) -> usize {
        self.max_trampolines.clamp(1, MAX_TRAMPOLINES)
    }
}
