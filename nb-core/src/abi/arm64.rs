use super::{
    ArgClass, Extend, Location, Lowering, Piece, ReturnClass, StackCursor, is_integer_class,
    scalar_extend,
};
use crate::error::BridgeResult;
use crate::signature::{SignatureDescriptor, TypeDescriptor, TypeKind, is_homogeneous_aggregate};

const GPR_ARGS: usize = 8;
const VECTOR_ARGS: usize = 8;

fn hfa_shape(ty: &TypeDescriptor) -> Option<(usize, usize)> {
    let member = is_homogeneous_aggregate(ty, 1, 4)?;
    let width = if member == TypeKind::Float32 { 4 } else { 8 };
    Some((ty.size() / width, width))
}

struct State {
    ngrn: usize,
    nsrn: usize,
    stack: StackCursor,
    apple: bool,
}

impl State {
    /// Named stack arguments: 8-byte slots, or natural packing on Darwin.
    fn stack_piece(&mut self, ty: &TypeDescriptor, extend: Extend) -> Piece {
        if self.apple {
            let offset = self.stack.take(ty.size(), ty.align(), 1);
            return Piece::new(0, ty.size(), Location::Stack(offset as u32));
        }
        let offset = self.stack.take(ty.size(), ty.align().max(8), 8);
        Piece::extended(0, ty.size(), Location::Stack(offset as u32), extend)
    }

    fn slot_piece(&mut self, size: usize, extend: Extend) -> Piece {
        let offset = self.stack.take(size, 8, 8);
        Piece::extended(0, size, Location::Stack(offset as u32), extend)
    }
}

pub(super) fn lower(signature: &SignatureDescriptor, apple: bool) -> BridgeResult<Lowering> {
    let mut state = State {
        ngrn: 0,
        nsrn: 0,
        stack: StackCursor::default(),
        apple,
    };
    let ret = lower_return(&signature.ret().ty);

    let mut params = Vec::with_capacity(signature.parameters().len());
    for slot in signature.parameters() {
        let ty = &slot.ty;
        let class = if apple && slot.variadic {
            lower_apple_variadic(ty, &mut state)
        } else {
            lower_param(ty, &mut state)
        };
        params.push(class);
    }

    Ok(Lowering {
        params,
        ret,
        stack_used: state.stack.offset,
        callee_pop: 0,
        vector_hint: None,
    })
}

fn lower_apple_variadic(ty: &TypeDescriptor, state: &mut State) -> ArgClass {
    let kind = ty.kind();
    if kind == TypeKind::Record && ty.size() > 16 {
        let piece = state.slot_piece(8, Extend::None);
        return ArgClass {
            by_reference: true,
            ..ArgClass::from_pieces(vec![piece])
        };
    }
    let extend = if is_integer_class(kind) {
        scalar_extend(kind)
    } else {
        Extend::None
    };
    ArgClass::from_pieces(vec![state.slot_piece(ty.size(), extend)])
}

fn lower_param(ty: &TypeDescriptor, state: &mut State) -> ArgClass {
    let kind = ty.kind();

    if kind.is_float() {
        if state.nsrn < VECTOR_ARGS {
            state.nsrn += 1;
            return ArgClass::from_pieces(vec![Piece::new(
                0,
                ty.size(),
                Location::Vec {
                    index: state.nsrn as u8 - 1,
                    width: ty.size() as u8,
                },
            )]);
        }
        return ArgClass::from_pieces(vec![state.stack_piece(ty, Extend::None)]);
    }

    if is_integer_class(kind) {
        if state.ngrn < GPR_ARGS {
            state.ngrn += 1;
            return ArgClass::from_pieces(vec![Piece::extended(
                0,
                ty.size(),
                Location::Gpr(state.ngrn as u8 - 1),
                scalar_extend(kind),
            )]);
        }
        return ArgClass::from_pieces(vec![state.stack_piece(ty, scalar_extend(kind))]);
    }

    if let Some((count, width)) = hfa_shape(ty) {
        if state.nsrn + count <= VECTOR_ARGS {
            let first = state.nsrn;
            state.nsrn += count;
            let pieces = (0..count)
                .map(|member| {
                    Piece::new(
                        member * width,
                        width,
                        Location::Vec {
                            index: (first + member) as u8,
                            width: width as u8,
                        },
                    )
                })
                .collect();
            return ArgClass::from_pieces(pieces);
        }
        state.nsrn = VECTOR_ARGS;
        return ArgClass::from_pieces(vec![state.stack_piece(ty, Extend::None)]);
    }

    if ty.size() > 16 {
        if state.ngrn < GPR_ARGS {
            state.ngrn += 1;
            return ArgClass::by_reference(Location::Gpr(state.ngrn as u8 - 1), 8);
        }
        let piece = state.slot_piece(8, Extend::None);
        return ArgClass {
            by_reference: true,
            ..ArgClass::from_pieces(vec![piece])
        };
    }

    let words = ty.size().div_ceil(8);
    if ty.align() == 16 {
        state.ngrn = state.ngrn.next_multiple_of(2);
    }
    if state.ngrn + words <= GPR_ARGS {
        let first = state.ngrn;
        state.ngrn += words;
        let pieces = (0..words)
            .map(|word| {
                let offset = word * 8;
                Piece::new(
                    offset,
                    (ty.size() - offset).min(8),
                    Location::Gpr((first + word) as u8),
                )
            })
            .collect();
        return ArgClass::from_pieces(pieces);
    }
    state.ngrn = GPR_ARGS;
    ArgClass::from_pieces(vec![state.stack_piece(ty, Extend::None)])
}

fn lower_return(ty: &TypeDescriptor) -> ReturnClass {
    let kind = ty.kind();
    if kind == TypeKind::Void {
        return ReturnClass::void();
    }
    if kind.is_float() {
        return ReturnClass::pieces(vec![Piece::new(
            0,
            ty.size(),
            Location::Vec {
                index: 0,
                width: ty.size() as u8,
            },
        )]);
    }
    if is_integer_class(kind) {
        return ReturnClass::pieces(vec![Piece::new(0, ty.size(), Location::Gpr(0))]);
    }
    if let Some((count, width)) = hfa_shape(ty) {
        return ReturnClass::pieces(
            (0..count)
                .map(|member| {
                    Piece::new(
                        member * width,
                        width,
                        Location::Vec {
                            index: member as u8,
                            width: width as u8,
                        },
                    )
                })
                .collect(),
        );
    }
    if ty.size() > 16 {
        return ReturnClass::hidden(Location::IndirectResult);
    }
    ReturnClass::pieces(
        (0..ty.size().div_ceil(8))
            .map(|word| {
                let offset = word * 8;
                Piece::new(offset, (ty.size() - offset).min(8), Location::Gpr(word as u8))
            })
            .collect(),
    )
}
