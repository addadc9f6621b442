use crate::abi::{ClassifiedSignature, Location};
use crate::error::BridgeResult;
use crate::frame::{piece_bytes, pointer_image, register_offset};
use crate::marshal::{MarshalContext, decode_value, encode_value, read_image, read_uint};
use crate::native::{RegisterBlock, read_register_bytes, write_register_bytes};
use crate::signature::TypeKind;
use crate::value::Value;

/// Convert the raw return registers of a finished call into a value.
/// `hidden` is the result buffer passed for hidden-pointer returns.
pub(crate) fn demarshal_return(
    classified: &ClassifiedSignature,
    block: &RegisterBlock,
    hidden: Option<usize>,
) -> Value {
    let ty = &classified.signature.ret().ty;
    if ty.kind() == TypeKind::Void {
        return Value::Null;
    }
    if let Some(address) = hidden {
        let image = unsafe { read_image(address, ty.size()) };
        return decode_value(ty, &image, true);
    }
    if classified.ret.x87 {
        return Value::Float(f64::from_bits(block.ret_vec[0]));
    }

    let mut image = vec![0u8; ty.size()];
    for piece in &classified.ret.pieces {
        let Some(offset) = register_offset(classified.abi, piece.location) else {
            continue;
        };
        let bytes = match piece.location {
            Location::Vec { .. } => read_register_bytes(&block.ret_vec, offset, piece.size as usize),
            _ => read_register_bytes(&block.ret_gpr, offset, piece.size as usize),
        };
        copy_into(&mut image, piece.offset as usize, &bytes);
    }
    decode_value(ty, &image, true)
}

/// Decode the arguments a native caller passed to a callback thunk.
///
/// # Safety
/// `block.stack_ptr` must address the caller's stack arguments and
/// by-reference pointers must be valid for their pointee size.
pub(crate) unsafe fn read_arguments(
    classified: &ClassifiedSignature,
    block: &RegisterBlock,
) -> Vec<Value> {
    let abi = classified.abi;
    let stack_ptr = block.stack_ptr as usize;
    let mut values = Vec::with_capacity(classified.params.len());
    for (slot, class) in classified.signature.parameters().iter().zip(&classified.params) {
        let ty = &slot.ty;
        let width = if class.by_reference {
            abi.pointer_size()
        } else {
            ty.size()
        };
        let mut image = vec![0u8; width];
        for piece in &class.pieces {
            let size = piece.size as usize;
            let bytes = match piece.location {
                Location::Stack(offset) => unsafe { read_image(stack_ptr + offset as usize, size) },
                Location::Vec { .. } => {
                    let offset = register_offset(abi, piece.location).unwrap_or(0);
                    read_register_bytes(&block.vec, offset, size)
                }
                Location::Gpr(_) | Location::IndirectResult => {
                    let offset = register_offset(abi, piece.location).unwrap_or(0);
                    read_register_bytes(&block.gpr, offset, size)
                }
            };
            copy_into(&mut image, piece.offset as usize, &bytes);
        }
        if class.by_reference {
            let address = read_uint(&image) as usize;
            image = unsafe { read_image(address, ty.size()) };
        }
        values.push(decode_value(ty, &image, false));
    }
    values
}

/// Address of the caller's result buffer for hidden-pointer returns.
///
/// # Safety
/// `block.stack_ptr` must address the caller's stack arguments.
pub(crate) unsafe fn incoming_hidden_pointer(
    classified: &ClassifiedSignature,
    block: &RegisterBlock,
) -> Option<usize> {
    let abi = classified.abi;
    let location = classified.ret.hidden?;
    let size = abi.pointer_size();
    let bytes = match location {
        Location::Stack(offset) => unsafe { read_image(block.stack_ptr as usize + offset as usize, size) },
        other => read_register_bytes(&block.gpr, register_offset(abi, other).unwrap_or(0), size),
    };
    Some(read_uint(&bytes) as usize)
}

/// Encode a callback's return value into the return registers, or into
/// the caller's buffer when the result travels through a hidden pointer.
pub(crate) fn write_return(
    classified: &ClassifiedSignature,
    block: &mut RegisterBlock,
    value: &Value,
    hidden: Option<usize>,
    ctx: &dyn MarshalContext,
) -> BridgeResult<()> {
    zero_return(block);
    let abi = classified.abi;
    let ty = &classified.signature.ret().ty;
    if ty.kind() == TypeKind::Void {
        return Ok(());
    }
    let mut image = vec![0u8; ty.size()];
    encode_value(0, ty, value, &mut image, ctx)?;

    if let Some(address) = hidden {
        unsafe { std::ptr::copy_nonoverlapping(image.as_ptr(), address as *mut u8, image.len()) };
        // The callee hands the buffer address back in the first return register.
        write_register_bytes(&mut block.ret_gpr, 0, &pointer_image(abi, address));
        return Ok(());
    }
    if classified.ret.x87 {
        let number = match ty.kind() {
            TypeKind::Float32 => f64::from(f32::from_bits(read_uint(&image) as u32)),
            _ => f64::from_bits(read_uint(&image)),
        };
        block.ret_vec[0] = number.to_bits();
        return Ok(());
    }
    for piece in &classified.ret.pieces {
        let Some(offset) = register_offset(abi, piece.location) else {
            continue;
        };
        let bytes = piece_bytes(piece, &image, abi.pointer_size());
        match piece.location {
            Location::Vec { .. } => write_register_bytes(&mut block.ret_vec, offset, &bytes),
            _ => write_register_bytes(&mut block.ret_gpr, offset, &bytes),
        }
    }
    Ok(())
}

pub(crate) fn zero_return(block: &mut RegisterBlock) {
    block.ret_gpr = [0; 2];
    block.ret_vec = [0; 4];
}

fn copy_into(image: &mut [u8], offset: usize, bytes: &[u8]) {
    if offset >= image.len() {
        return;
    }
    let len = bytes.len().min(image.len() - offset);
    image[offset..offset + len].copy_from_slice(&bytes[..len]);
}
