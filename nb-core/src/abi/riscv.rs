use super::{
    ArgClass, Extend, Location, Lowering, Piece, ReturnClass, StackCursor, is_integer_class,
    scalar_extend,
};
use crate::error::BridgeResult;
use crate::signature::{FlatField, SignatureDescriptor, TypeDescriptor, TypeKind};

const ARG_REGS: usize = 8;
const FLEN: usize = 8;

/// Flattened record shape eligible for the hardware floating-point rules.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FpShape {
    One(FlatField),
    Two(FlatField, FlatField),
    /// One integer and one floating field, in field order.
    Mixed(FlatField, FlatField),
}

fn fp_shape(ty: &TypeDescriptor, xlen: usize) -> Option<FpShape> {
    if ty.kind() != TypeKind::Record && ty.kind() != TypeKind::Array {
        return None;
    }
    let fields = ty.flatten();
    let fits = |field: &FlatField| {
        if field.kind.is_float() {
            field.size <= FLEN
        } else {
            field.size <= xlen
        }
    };
    match fields.as_slice() {
        [only] if only.kind.is_float() && fits(only) => Some(FpShape::One(*only)),
        [first, second] if fits(first) && fits(second) => {
            match (first.kind.is_float(), second.kind.is_float()) {
                (true, true) => Some(FpShape::Two(*first, *second)),
                (true, false) | (false, true) => Some(FpShape::Mixed(*first, *second)),
                (false, false) => None,
            }
        }
        _ => None,
    }
}

struct State {
    xlen: usize,
    gpr: usize,
    fpr: usize,
    stack: StackCursor,
}

impl State {
    fn fpr_piece(&mut self, field: FlatField) -> Piece {
        let index = self.fpr as u8;
        self.fpr += 1;
        float_piece(field.offset, field.size, index)
    }

    fn gpr_piece(&mut self, offset: usize, size: usize, extend: Extend) -> Piece {
        let index = self.gpr as u8;
        self.gpr += 1;
        Piece::extended(offset, size, Location::Gpr(index), extend)
    }

    fn stack_piece(&mut self, offset: usize, size: usize, align: usize, extend: Extend) -> Piece {
        let at = self.stack.take(size, align.max(self.xlen), self.xlen);
        Piece::extended(offset, size, Location::Stack(at as u32), extend)
    }

    /// Integer calling convention for `size` bytes: registers, then a
    /// register/stack split, then the stack.
    fn integer_pieces(&mut self, ty: &TypeDescriptor, aligned_pair: bool) -> Vec<Piece> {
        let xlen = self.xlen;
        let size = ty.size();
        let kind = ty.kind();
        let extend = if is_integer_class(kind) && size <= xlen {
            integer_extend(kind, xlen)
        } else {
            Extend::None
        };

        if size <= xlen {
            if self.gpr < ARG_REGS {
                return vec![self.gpr_piece(0, size, extend)];
            }
            return vec![self.stack_piece(0, size, ty.align(), extend)];
        }

        if aligned_pair && ty.align() == 2 * xlen {
            self.gpr = self.gpr.next_multiple_of(2);
        }
        match ARG_REGS.saturating_sub(self.gpr) {
            0 => vec![self.stack_piece(0, size, ty.align(), Extend::None)],
            1 => {
                let low = self.gpr_piece(0, xlen, Extend::None);
                let high = self.stack_piece(xlen, size - xlen, xlen, Extend::None);
                vec![low, high]
            }
            _ => {
                let low = self.gpr_piece(0, xlen, Extend::None);
                let high = self.gpr_piece(xlen, size - xlen, Extend::None);
                vec![low, high]
            }
        }
    }
}

fn float_piece(offset: usize, size: usize, index: u8) -> Piece {
    if size == 4 {
        Piece::extended(
            offset,
            4,
            Location::Vec { index, width: 4 },
            Extend::NanBox,
        )
    } else {
        Piece::new(offset, size, Location::Vec { index, width: 8 })
    }
}

/// RV64 keeps 32-bit values sign-extended in registers, unsigned included.
fn integer_extend(kind: TypeKind, xlen: usize) -> Extend {
    if xlen == 8 && matches!(kind, TypeKind::UInt32) {
        Extend::Sign
    } else {
        scalar_extend(kind)
    }
}

pub(super) fn lower(signature: &SignatureDescriptor, xlen: usize) -> BridgeResult<Lowering> {
    let mut state = State {
        xlen,
        gpr: 0,
        fpr: 0,
        stack: StackCursor::default(),
    };

    let ret = lower_return(&signature.ret().ty, xlen);
    if ret.hidden.is_some() {
        state.gpr = 1;
    }

    let mut params = Vec::with_capacity(signature.parameters().len());
    for slot in signature.parameters() {
        let class = if slot.variadic {
            lower_integer_only(&slot.ty, &mut state, true)
        } else {
            lower_param(&slot.ty, &mut state)
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

fn lower_integer_only(ty: &TypeDescriptor, state: &mut State, aligned_pair: bool) -> ArgClass {
    if ty.size() > 2 * state.xlen {
        if state.gpr < ARG_REGS {
            let piece = state.gpr_piece(0, state.xlen, Extend::None);
            return ArgClass {
                by_reference: true,
                ..ArgClass::from_pieces(vec![piece])
            };
        }
        let piece = state.stack_piece(0, state.xlen, state.xlen, Extend::None);
        return ArgClass {
            by_reference: true,
            ..ArgClass::from_pieces(vec![piece])
        };
    }
    ArgClass::from_pieces(state.integer_pieces(ty, aligned_pair))
}

fn lower_param(ty: &TypeDescriptor, state: &mut State) -> ArgClass {
    let kind = ty.kind();

    if kind.is_float() && ty.size() <= FLEN && state.fpr < ARG_REGS {
        let field = FlatField {
            offset: 0,
            size: ty.size(),
            kind,
        };
        return ArgClass::from_pieces(vec![state.fpr_piece(field)]);
    }

    if let Some(shape) = fp_shape(ty, state.xlen) {
        match shape {
            FpShape::One(field) if state.fpr < ARG_REGS => {
                return ArgClass::from_pieces(vec![state.fpr_piece(field)]);
            }
            FpShape::Two(first, second) if state.fpr + 2 <= ARG_REGS => {
                let pieces = vec![state.fpr_piece(first), state.fpr_piece(second)];
                return ArgClass::from_pieces(pieces);
            }
            FpShape::Mixed(first, second) if state.fpr < ARG_REGS && state.gpr < ARG_REGS => {
                let pieces = [first, second]
                    .into_iter()
                    .map(|field| {
                        if field.kind.is_float() {
                            state.fpr_piece(field)
                        } else {
                            let extend = integer_extend(field.kind, state.xlen);
                            state.gpr_piece(field.offset, field.size, extend)
                        }
                    })
                    .collect();
                return ArgClass::from_pieces(pieces);
            }
            _ => {}
        }
    }

    lower_integer_only(ty, state, false)
}

fn lower_return(ty: &TypeDescriptor, xlen: usize) -> ReturnClass {
    let kind = ty.kind();
    if kind == TypeKind::Void {
        return ReturnClass::void();
    }
    if kind.is_float() && ty.size() <= FLEN {
        return ReturnClass::pieces(vec![float_piece(0, ty.size(), 0)]);
    }
    if let Some(shape) = fp_shape(ty, xlen) {
        let pieces = match shape {
            FpShape::One(field) => vec![float_piece(field.offset, field.size, 0)],
            FpShape::Two(first, second) => vec![
                float_piece(first.offset, first.size, 0),
                float_piece(second.offset, second.size, 1),
            ],
            FpShape::Mixed(first, second) => [first, second]
                .into_iter()
                .map(|field| {
                    if field.kind.is_float() {
                        float_piece(field.offset, field.size, 0)
                    } else {
                        Piece::new(field.offset, field.size, Location::Gpr(0))
                    }
                })
                .collect(),
        };
        return ReturnClass::pieces(pieces);
    }
    if ty.size() > 2 * xlen {
        return ReturnClass::hidden(Location::Gpr(0));
    }
    ReturnClass::pieces(
        (0..ty.size().div_ceil(xlen))
            .map(|word| {
                let offset = word * xlen;
                Piece::new(offset, (ty.size() - offset).min(xlen), Location::Gpr(word as u8))
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_float_record_uses_mixed_shape() {
        let record = TypeDescriptor::record(
            "Sample",
            vec![
                ("count", TypeDescriptor::int32()),
                ("value", TypeDescriptor::float64()),
            ],
        )
        .expect("record");
        assert!(matches!(fp_shape(&record, 8), Some(FpShape::Mixed(_, _))));
    }

    #[test]
    fn three_floats_are_not_fp_eligible() {
        let record = TypeDescriptor::record(
            "Vec3",
            vec![
                ("x", TypeDescriptor::float32()),
                ("y", TypeDescriptor::float32()),
                ("z", TypeDescriptor::float32()),
            ],
        )
        .expect("record");
        assert_eq!(fp_shape(&record, 8), None);
    }
}
