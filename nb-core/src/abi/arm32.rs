use super::{
    ArgClass, Location, Lowering, Piece, ReturnClass, StackCursor, is_integer_class, is_record,
    scalar_extend,
};
use crate::error::BridgeResult;
use crate::signature::{SignatureDescriptor, TypeDescriptor, TypeKind, is_homogeneous_aggregate};

const CORE_REGS: usize = 4;
const VFP_SINGLES: usize = 16;

/// Floating-point shape of a VFP candidate: member count and member width.
fn vfp_candidate(ty: &TypeDescriptor) -> Option<(usize, usize)> {
    let kind = ty.kind();
    if kind.is_float() {
        return Some((1, ty.size()));
    }
    let member = is_homogeneous_aggregate(ty, 1, 4)?;
    let width = if member == TypeKind::Float32 { 4 } else { 8 };
    Some((ty.size() / width, width))
}

/// s0-s15 allocation with single-precision back-filling.
struct VfpFile {
    used: [bool; VFP_SINGLES],
    closed: bool,
}

impl VfpFile {
    fn new() -> Self {
        Self {
            used: [false; VFP_SINGLES],
            closed: false,
        }
    }

    /// First register (in units of `width`) of `count` consecutive free ones.
    fn allocate(&mut self, count: usize, width: usize) -> Option<usize> {
        if self.closed {
            return None;
        }
        let units = width / 4;
        let total = VFP_SINGLES / units;
        let start = (0..=total.checked_sub(count)?).find(|first| {
            (first * units..(first + count) * units).all(|single| !self.used[single])
        })?;
        for single in start * units..(start + count) * units {
            self.used[single] = true;
        }
        Some(start)
    }

    fn close(&mut self) {
        self.closed = true;
        self.used = [true; VFP_SINGLES];
    }
}

pub(super) fn lower(signature: &SignatureDescriptor, hard_float: bool) -> BridgeResult<Lowering> {
    // Variadic functions use the base standard for every argument.
    let hard = hard_float && !signature.is_variadic();
    let mut ncrn = 0usize;
    let mut started_stack = false;
    let mut vfp = VfpFile::new();
    let mut stack = StackCursor::default();

    let ret = lower_return(&signature.ret().ty, hard);
    if ret.hidden.is_some() {
        ncrn = 1;
    }

    let mut params = Vec::with_capacity(signature.parameters().len());
    for slot in signature.parameters() {
        let ty = &slot.ty;

        let candidate = if hard { vfp_candidate(ty) } else { None };
        if let Some((count, width)) = candidate {
            if let Some(first) = vfp.allocate(count, width) {
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
                params.push(ArgClass::from_pieces(pieces));
                continue;
            }
            vfp.close();
            let offset = stack.take(ty.size(), ty.align().max(4), 4);
            params.push(ArgClass::from_pieces(vec![Piece::new(
                0,
                ty.size(),
                Location::Stack(offset as u32),
            )]));
            continue;
        }

        let words = ty.size().div_ceil(4);
        if ty.align() >= 8 {
            ncrn = ncrn.next_multiple_of(2);
        }

        if !started_stack && ncrn + words <= CORE_REGS {
            let kind = ty.kind();
            let pieces = if words == 1 && is_integer_class(kind) {
                vec![Piece::extended(
                    0,
                    ty.size(),
                    Location::Gpr(ncrn as u8),
                    scalar_extend(kind),
                )]
            } else {
                word_pieces(ty.size(), 0, ncrn, words)
            };
            ncrn += words;
            params.push(ArgClass::from_pieces(pieces));
            continue;
        }

        // A record may straddle r3 and the stack while nothing is stacked yet.
        if !started_stack && ncrn < CORE_REGS && stack.offset == 0 && is_record(ty) {
            let in_regs = CORE_REGS - ncrn;
            let mut pieces = word_pieces(in_regs * 4, 0, ncrn, in_regs);
            let rest = ty.size() - in_regs * 4;
            let offset = stack.take(rest, 4, 4);
            pieces.push(Piece::new(in_regs * 4, rest, Location::Stack(offset as u32)));
            ncrn = CORE_REGS;
            params.push(ArgClass::from_pieces(pieces));
            continue;
        }

        ncrn = CORE_REGS;
        started_stack = true;
        let align = if ty.align() >= 8 { 8 } else { 4 };
        let offset = stack.take(ty.size(), align, 4) as u32;
        let kind = ty.kind();
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

    Ok(Lowering {
        params,
        ret,
        stack_used: stack.offset,
        callee_pop: 0,
        vector_hint: None,
    })
}

fn word_pieces(size: usize, offset: usize, first_reg: usize, words: usize) -> Vec<Piece> {
    (0..words)
        .map(|word| {
            let start = offset + word * 4;
            Piece::new(start, (size - word * 4).min(4), Location::Gpr((first_reg + word) as u8))
        })
        .collect()
}

fn lower_return(ty: &TypeDescriptor, hard: bool) -> ReturnClass {
    let kind = ty.kind();
    if kind == TypeKind::Void {
        return ReturnClass::void();
    }
    let candidate = if hard { vfp_candidate(ty) } else { None };
    if let Some((count, width)) = candidate {
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
    if is_record(ty) && ty.size() > 4 {
        return ReturnClass::hidden(Location::Gpr(0));
    }
    ReturnClass::pieces(word_pieces(ty.size(), 0, 0, ty.size().div_ceil(4)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn singles_back_fill_after_a_double() {
        let mut vfp = VfpFile::new();
        assert_eq!(vfp.allocate(1, 4), Some(0));
        assert_eq!(vfp.allocate(1, 8), Some(1));
        assert_eq!(vfp.allocate(1, 4), Some(1));
        assert_eq!(vfp.allocate(1, 4), Some(4));
    }

    #[test]
    fn closed_file_rejects_everything() {
        let mut vfp = VfpFile::new();
        vfp.close();
        assert_eq!(vfp.allocate(1, 4), None);
    }
}
