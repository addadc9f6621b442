use super::{ArgClass, Location, Lowering, Piece, ReturnClass, is_integer_class, scalar_extend};
use crate::error::BridgeResult;
use crate::signature::{SignatureDescriptor, TypeDescriptor, TypeKind};

const REGISTER_SLOTS: usize = 4;
const SHADOW_SPACE: usize = 32;

fn register_sized(size: usize) -> bool {
    matches!(size, 1 | 2 | 4 | 8)
}

pub(super) fn lower(signature: &SignatureDescriptor) -> BridgeResult<Lowering> {
    let ret = lower_return(&signature.ret().ty);
    let mut slot = usize::from(ret.hidden.is_some());

    let mut params = Vec::with_capacity(signature.parameters().len());
    for parameter in signature.parameters() {
        params.push(lower_param(&parameter.ty, slot, parameter.variadic));
        slot += 1;
    }

    let stack_slots = slot.saturating_sub(REGISTER_SLOTS);
    Ok(Lowering {
        params,
        ret,
        stack_used: SHADOW_SPACE + stack_slots * 8,
        callee_pop: 0,
        vector_hint: None,
    })
}

fn slot_location(slot: usize) -> Location {
    if slot < REGISTER_SLOTS {
        Location::Gpr(slot as u8)
    } else {
        Location::Stack((SHADOW_SPACE + (slot - REGISTER_SLOTS) * 8) as u32)
    }
}

fn lower_param(ty: &TypeDescriptor, slot: usize, variadic: bool) -> ArgClass {
    let kind = ty.kind();
    if kind == TypeKind::Record && !register_sized(ty.size()) {
        return ArgClass::by_reference(slot_location(slot), 8);
    }

    if kind.is_float() && slot < REGISTER_SLOTS {
        let mut pieces = vec![Piece::new(
            0,
            ty.size(),
            Location::Vec {
                index: slot as u8,
                width: ty.size() as u8,
            },
        )];
        // Variadic callees spill from the integer registers.
        if variadic {
            pieces.push(Piece::new(0, ty.size(), Location::Gpr(slot as u8)));
        }
        return ArgClass::from_pieces(pieces);
    }

    let extend = if is_integer_class(kind) {
        scalar_extend(kind)
    } else {
        super::Extend::None
    };
    ArgClass::from_pieces(vec![Piece::extended(0, ty.size(), slot_location(slot), extend)])
}

fn lower_return(ty: &TypeDescriptor) -> ReturnClass {
    let kind = ty.kind();
    match kind {
        TypeKind::Void => ReturnClass::void(),
        _ if kind.is_float() => ReturnClass::pieces(vec![Piece::new(
            0,
            ty.size(),
            Location::Vec {
                index: 0,
                width: ty.size() as u8,
            },
        )]),
        _ if register_sized(ty.size()) => {
            ReturnClass::pieces(vec![Piece::new(0, ty.size(), Location::Gpr(0))])
        }
        _ => ReturnClass::hidden(Location::Gpr(0)),
    }
}
