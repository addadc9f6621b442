use super::{
    ArgClass, Location, Lowering, Piece, ReturnClass, StackCursor, is_integer_class, scalar_extend,
};
use crate::error::BridgeResult;
use crate::signature::{SignatureDescriptor, TypeDescriptor, TypeKind};

const GPR_ARGS: usize = 6;
const SSE_ARGS: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EightbyteClass {
    NoClass,
    Integer,
    Sse,
}

/// Eightbyte classes of an aggregate, or `None` when it is passed in memory.
pub(crate) fn classify_eightbytes(ty: &TypeDescriptor) -> Option<Vec<EightbyteClass>> {
    if ty.size() > 16 || ty.has_unaligned_fields() {
        return None;
    }
    let mut classes = vec![EightbyteClass::NoClass; ty.size().div_ceil(8)];
    for field in ty.flatten() {
        let slot = classes.get_mut(field.offset / 8)?;
        let class = if field.kind.is_float() {
            EightbyteClass::Sse
        } else {
            EightbyteClass::Integer
        };
        *slot = match (*slot, class) {
            (EightbyteClass::Integer, _) | (_, EightbyteClass::Integer) => EightbyteClass::Integer,
            _ => EightbyteClass::Sse,
        };
    }
    Some(classes)
}

struct Budget {
    gpr: usize,
    sse: usize,
}

pub(super) fn lower(signature: &SignatureDescriptor) -> BridgeResult<Lowering> {
    let mut budget = Budget { gpr: 0, sse: 0 };
    let mut stack = StackCursor::default();

    let ret = lower_return(&signature.ret().ty);
    if ret.hidden.is_some() {
        budget.gpr = 1;
    }

    let mut params = Vec::with_capacity(signature.parameters().len());
    for slot in signature.parameters() {
        params.push(lower_param(&slot.ty, &mut budget, &mut stack));
    }

    let vector_hint = signature.is_variadic().then_some(budget.sse as u8);
    Ok(Lowering {
        params,
        ret,
        stack_used: stack.offset,
        callee_pop: 0,
        vector_hint,
    })
}

fn lower_param(ty: &TypeDescriptor, budget: &mut Budget, stack: &mut StackCursor) -> ArgClass {
    let kind = ty.kind();
    if is_integer_class(kind) {
        if budget.gpr < GPR_ARGS {
            budget.gpr += 1;
            return ArgClass::from_pieces(vec![Piece::extended(
                0,
                ty.size(),
                Location::Gpr(budget.gpr as u8 - 1),
                scalar_extend(kind),
            )]);
        }
        let offset = stack.take(ty.size(), 8, 8);
        return ArgClass::from_pieces(vec![Piece::extended(
            0,
            ty.size(),
            Location::Stack(offset as u32),
            scalar_extend(kind),
        )]);
    }
    if kind.is_float() {
        if budget.sse < SSE_ARGS {
            budget.sse += 1;
            return ArgClass::from_pieces(vec![Piece::new(
                0,
                ty.size(),
                Location::Vec {
                    index: budget.sse as u8 - 1,
                    width: ty.size() as u8,
                },
            )]);
        }
        let offset = stack.take(ty.size(), 8, 8);
        return ArgClass::from_pieces(vec![Piece::new(0, ty.size(), Location::Stack(offset as u32))]);
    }

    if let Some(classes) = classify_eightbytes(ty) {
        let gprs = classes
            .iter()
            .filter(|class| **class == EightbyteClass::Integer)
            .count();
        let sses = classes
            .iter()
            .filter(|class| **class == EightbyteClass::Sse)
            .count();
        if budget.gpr + gprs <= GPR_ARGS && budget.sse + sses <= SSE_ARGS {
            let pieces = eightbyte_pieces(ty.size(), &classes, |class| match class {
                EightbyteClass::Sse => {
                    budget.sse += 1;
                    Location::Vec {
                        index: budget.sse as u8 - 1,
                        width: 8,
                    }
                }
                _ => {
                    budget.gpr += 1;
                    Location::Gpr(budget.gpr as u8 - 1)
                }
            });
            return ArgClass::from_pieces(pieces);
        }
    }

    let offset = stack.take(ty.size(), ty.align().max(8), 8);
    ArgClass::from_pieces(vec![Piece::new(0, ty.size(), Location::Stack(offset as u32))])
}

fn lower_return(ty: &TypeDescriptor) -> ReturnClass {
    let kind = ty.kind();
    match kind {
        TypeKind::Void => ReturnClass::void(),
        _ if is_integer_class(kind) => {
            ReturnClass::pieces(vec![Piece::new(0, ty.size(), Location::Gpr(0))])
        }
        _ if kind.is_float() => ReturnClass::pieces(vec![Piece::new(
            0,
            ty.size(),
            Location::Vec {
                index: 0,
                width: ty.size() as u8,
            },
        )]),
        _ => match classify_eightbytes(ty) {
            Some(classes) => {
                let mut gpr = 0u8;
                let mut sse = 0u8;
                ReturnClass::pieces(eightbyte_pieces(ty.size(), &classes, |class| match class {
                    EightbyteClass::Sse => {
                        sse += 1;
                        Location::Vec {
                            index: sse - 1,
                            width: 8,
                        }
                    }
                    _ => {
                        gpr += 1;
                        Location::Gpr(gpr - 1)
                    }
                }))
            }
            None => ReturnClass::hidden(Location::Gpr(0)),
        },
    }
}

fn eightbyte_pieces(
    size: usize,
    classes: &[EightbyteClass],
    mut assign: impl FnMut(EightbyteClass) -> Location,
) -> Vec<Piece> {
    classes
        .iter()
        .enumerate()
        .filter(|(_, class)| **class != EightbyteClass::NoClass)
        .map(|(index, class)| {
            let offset = index * 8;
            Piece::new(offset, (size - offset).min(8), assign(*class))
        })
        .collect()
}
