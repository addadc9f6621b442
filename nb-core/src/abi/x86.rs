use super::{
    Abi, ArgClass, Location, Lowering, Piece, ReturnClass, StackCursor, is_integer_class,
    scalar_extend,
};
use crate::error::BridgeResult;
use crate::signature::{CallingConvention, SignatureDescriptor, TypeDescriptor, TypeKind, align_up};

pub(super) fn lower(signature: &SignatureDescriptor, msvc: bool) -> BridgeResult<Lowering> {
    let convention = signature.convention();
    let gpr_budget = Abi::X86 { msvc }.gpr_budget(convention);
    let mut gpr = 0usize;
    let mut stack = StackCursor::default();

    let ret = lower_return(&signature.ret().ty, msvc);
    if ret.hidden.is_some() {
        stack.take(4, 4, 4);
    }

    let mut params = Vec::with_capacity(signature.parameters().len());
    for slot in signature.parameters() {
        let ty = &slot.ty;
        let kind = ty.kind();
        if gpr < gpr_budget && is_integer_class(kind) && ty.size() <= 4 {
            params.push(ArgClass::from_pieces(vec![Piece::extended(
                0,
                ty.size(),
                Location::Gpr(gpr as u8),
                scalar_extend(kind),
            )]));
            gpr += 1;
            continue;
        }
        let offset = stack.take(ty.size(), 4, 4) as u32;
        let extend = if is_integer_class(kind) && ty.size() < 4 {
            scalar_extend(kind)
        } else {
            super::Extend::None
        };
        params.push(ArgClass::from_pieces(vec![Piece::extended(
            0,
            ty.size(),
            Location::Stack(offset),
            extend,
        )]));
    }

    let callee_cleans = !signature.is_variadic()
        && match convention {
            CallingConvention::Stdcall | CallingConvention::Fastcall => true,
            CallingConvention::Thiscall => msvc,
            _ => false,
        };
    let callee_pop = if callee_cleans {
        stack.offset
    } else if ret.hidden.is_some() && !msvc {
        4
    } else {
        0
    };

    Ok(Lowering {
        params,
        ret,
        stack_used: stack.offset,
        callee_pop,
        vector_hint: None,
    })
}

fn lower_return(ty: &TypeDescriptor, msvc: bool) -> ReturnClass {
    let kind = ty.kind();
    match kind {
        TypeKind::Void => ReturnClass::void(),
        _ if kind.is_float() => ReturnClass {
            x87: true,
            ..ReturnClass::default()
        },
        TypeKind::Int64 | TypeKind::UInt64 => ReturnClass::pieces(vec![
            Piece::new(0, 4, Location::Gpr(0)),
            Piece::new(4, 4, Location::Gpr(1)),
        ]),
        _ if is_integer_class(kind) => {
            ReturnClass::pieces(vec![Piece::new(0, ty.size(), Location::Gpr(0))])
        }
        _ if msvc && matches!(ty.size(), 1 | 2 | 4) => {
            ReturnClass::pieces(vec![Piece::new(0, ty.size(), Location::Gpr(0))])
        }
        _ if msvc && ty.size() == 8 => ReturnClass::pieces(vec![
            Piece::new(0, 4, Location::Gpr(0)),
            Piece::new(4, 4, Location::Gpr(1)),
        ]),
        _ => ReturnClass::hidden(Location::Stack(0)),
    }
}

/// Linker name of an x86 function: `_name` for cdecl, `_name@N` for
/// stdcall and `@name@N` for fastcall, N being the argument bytes. Other
/// ABIs and conventions leave the name alone.
pub fn decorate_symbol(
    name: &str,
    convention: CallingConvention,
    signature: &SignatureDescriptor,
    abi: Abi,
) -> String {
    if !matches!(abi, Abi::X86 { .. }) {
        return name.to_string();
    }
    let bytes: usize = signature
        .parameters()
        .iter()
        .map(|slot| align_up(slot.ty.size(), 4))
        .sum();
    match convention {
        CallingConvention::Default | CallingConvention::Cdecl => format!("_{name}"),
        CallingConvention::Stdcall => format!("_{name}@{bytes}"),
        CallingConvention::Fastcall => format!("@{name}@{bytes}"),
        CallingConvention::Thiscall => name.to_string(),
    }
}
