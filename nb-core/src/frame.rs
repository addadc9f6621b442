use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use tracing::trace;

use crate::abi::{Abi, ClassifiedSignature, Extend, Location, Piece};
use crate::arena::{ArenaScope, ArenaSlice};
use crate::error::{BridgeError, BridgeResult};
use crate::marshal::{MarshalContext, encode_value};
use crate::native::{RegisterBlock, write_register_bytes};
use crate::signature::{Direction, SignatureDescriptor, TypeDescriptor};
use crate::value::{ManagedCallable, Value};

/// Hands out native entry points for managed callables passed as
/// `Callback` arguments.
pub trait CallbackBinder {
    fn bind(
        &self,
        callable: &Rc<dyn ManagedCallable>,
        prototype: &Arc<SignatureDescriptor>,
    ) -> BridgeResult<usize>;
}

/// Out/InOut cell whose native contents are copied back after the call.
pub(crate) struct Writeback {
    pub cell: Rc<RefCell<Value>>,
    pub ty: Arc<TypeDescriptor>,
    pub address: usize,
    /// Out values are native-owned and go through the dispose hook.
    pub dispose: bool,
}

/// Staged registers, stack bytes and postprocessing for one native call.
/// Arena memory referenced by the frame lives as long as the scope.
pub struct CallFrame<'s> {
    pub(crate) block: RegisterBlock,
    pub(crate) stack: Option<ArenaSlice<'s>>,
    pub(crate) hidden: Option<ArenaSlice<'s>>,
    pub(crate) writebacks: Vec<Writeback>,
}

impl CallFrame<'_> {
    pub fn registers(&self) -> &RegisterBlock {
        &self.block
    }

    /// Staged outgoing stack arguments.
    pub fn stack_bytes(&self) -> Vec<u8> {
        self.stack.map(|slice| slice.to_vec()).unwrap_or_default()
    }

    /// Address of the buffer receiving a hidden-pointer result.
    pub fn hidden_result(&self) -> Option<usize> {
        self.hidden.map(|slice| slice.addr())
    }

    pub fn writeback_count(&self) -> usize {
        self.writebacks.len()
    }

    /// `(address, len)` of the staged stack area for the invoker.
    pub(crate) fn stack_area(&self) -> (usize, usize) {
        self.stack
            .map(|slice| (slice.addr(), slice.len()))
            .unwrap_or((0, 0))
    }
}

/// Arena backed storage used while encoding arguments.
struct FrameContext<'a, 's, 'b> {
    scope: &'s ArenaScope<'a>,
    binder: &'b dyn CallbackBinder,
}

impl MarshalContext for FrameContext<'_, '_, '_> {
    fn store(&self, bytes: &[u8], align: usize) -> BridgeResult<usize> {
        let slice = self.scope.heap_alloc(bytes.len().max(1), align)?;
        slice.write_at(0, bytes)?;
        Ok(slice.addr())
    }

    fn store_string(&self, bytes: &[u8], align: usize) -> BridgeResult<usize> {
        let slice = self.scope.string_alloc(bytes.len(), align)?;
        slice.write_at(0, bytes)?;
        Ok(slice.addr())
    }

    fn bind_callback(
        &self,
        callable: &Rc<dyn ManagedCallable>,
        prototype: &Arc<SignatureDescriptor>,
    ) -> BridgeResult<usize> {
        self.binder.bind(callable, prototype)
    }
}

/// Marshal `values` into a call frame for `classified`. Nothing is
/// allocated when the argument count is wrong.
pub fn build<'s>(
    classified: &ClassifiedSignature,
    values: &[Value],
    scope: &'s ArenaScope<'_>,
    binder: &dyn CallbackBinder,
) -> BridgeResult<CallFrame<'s>> {
    let signature = &classified.signature;
    let expected = signature.parameters().len();
    if values.len() != expected {
        return Err(BridgeError::ArgumentCount {
            expected,
            got: values.len(),
        });
    }

    let abi = classified.abi;
    let ctx = FrameContext { scope, binder };
    let stack = match classified.stack_args_size {
        0 => None,
        size => Some(scope.stack_alloc(size as usize, 16)?),
    };
    let mut frame = CallFrame {
        block: RegisterBlock::default(),
        stack,
        hidden: None,
        writebacks: Vec::new(),
    };
    frame.block.vector_hint = classified.vector_hint.map(u64::from).unwrap_or(0);

    if let Some(location) = classified.ret.hidden {
        let ret = &signature.ret().ty;
        let buffer = scope.heap_alloc(ret.size().max(1), 16)?;
        let address = pointer_image(abi, buffer.addr());
        let piece = Piece::new(0, address.len(), location);
        scatter(abi, &mut frame, &piece, &address)?;
        frame.hidden = Some(buffer);
    }

    for (index, (slot, value)) in signature.parameters().iter().zip(values).enumerate() {
        let class = &classified.params[index];
        let ty = &slot.ty;
        let mut image = vec![0u8; ty.size()];
        match (slot.direction, value) {
            (Direction::Out | Direction::InOut, Value::Ref(cell)) => {
                let pointee = ty.pointee().ok_or_else(|| {
                    BridgeError::mismatch(index, ty.describe(), value.kind_name())
                })?;
                let target = scope.heap_alloc(pointee.size().max(1), pointee.align())?;
                if slot.direction == Direction::InOut {
                    let contents = cell.borrow().clone();
                    let mut initial = vec![0u8; pointee.size()];
                    encode_value(index, pointee, &contents, &mut initial, &ctx)?;
                    target.write_at(0, &initial)?;
                }
                image = pointer_image(abi, target.addr());
                frame.writebacks.push(Writeback {
                    cell: cell.clone(),
                    ty: pointee.clone(),
                    address: target.addr(),
                    dispose: slot.direction == Direction::Out,
                });
            }
            _ => encode_value(index, ty, value, &mut image, &ctx)?,
        }

        if class.by_reference {
            let copy = scope.heap_alloc(image.len().max(1), 16)?;
            copy.write_at(0, &image)?;
            image = pointer_image(abi, copy.addr());
        }

        for piece in &class.pieces {
            scatter(abi, &mut frame, piece, &image)?;
        }
        trace!(
            index,
            ty = %ty.describe(),
            pieces = class.pieces.len(),
            by_reference = class.by_reference,
            "staged argument"
        );
    }

    trace!(
        stack_bytes = classified.stack_args_size,
        writebacks = frame.writebacks.len(),
        "call frame built"
    );
    Ok(frame)
}

/// Native image of an address at the ABI's pointer width.
pub(crate) fn pointer_image(abi: Abi, address: usize) -> Vec<u8> {
    let bytes = (address as u64).to_le_bytes();
    bytes[..abi.pointer_size()].to_vec()
}

/// Bytes of `piece` taken from `image`, widened to `width` when the piece
/// carries an extension.
pub(crate) fn piece_bytes(piece: &Piece, image: &[u8], width: usize) -> Vec<u8> {
    let start = piece.offset as usize;
    let size = piece.size as usize;
    let mut bytes = vec![0u8; size];
    if start < image.len() {
        let end = (start + size).min(image.len());
        bytes[..end - start].copy_from_slice(&image[start..end]);
    }
    match piece.extend {
        Extend::None => bytes,
        Extend::Zero => {
            bytes.resize(width.max(size), 0);
            bytes
        }
        Extend::Sign => {
            let negative = bytes.last().is_some_and(|byte| byte & 0x80 != 0);
            bytes.resize(width.max(size), if negative { 0xff } else { 0 });
            bytes
        }
        Extend::NanBox => {
            bytes.resize(8, 0xff);
            bytes
        }
    }
}

/// Byte offset of a location inside the register staging arrays.
pub(crate) fn register_offset(abi: Abi, location: Location) -> Option<usize> {
    match location {
        Location::Gpr(index) => Some(usize::from(index) * 8),
        Location::Vec { index, width } => Some(abi.vector_byte_offset(index, width)),
        Location::IndirectResult => Some(8 * 8),
        Location::Stack(_) => None,
    }
}

fn scatter(abi: Abi, frame: &mut CallFrame<'_>, piece: &Piece, image: &[u8]) -> BridgeResult<()> {
    let bytes = piece_bytes(piece, image, abi.pointer_size());
    match piece.location {
        Location::Gpr(_) | Location::IndirectResult => {
            let offset = register_offset(abi, piece.location).unwrap_or(0);
            write_register_bytes(&mut frame.block.gpr, offset, &bytes);
        }
        Location::Vec { .. } => {
            let offset = register_offset(abi, piece.location).unwrap_or(0);
            write_register_bytes(&mut frame.block.vec, offset, &bytes);
        }
        Location::Stack(offset) => {
            let stack = frame.stack.as_ref().ok_or_else(|| {
                BridgeError::Native(format!(
                    "stack piece at offset {offset} without a staged stack area"
                ))
            })?;
            stack.write_at(offset as usize, &bytes)?;
        }
    }
    Ok(())
}
