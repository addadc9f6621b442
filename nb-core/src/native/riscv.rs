use super::{
    BLOCK_SIZE, GPR_OFFSET, NativeBackend, RET_GPR_OFFSET, RET_VEC_OFFSET, STACK_LEN_OFFSET,
    STACK_PTR_OFFSET, TARGET_OFFSET, VEC_OFFSET,
};

const ZERO: u32 = 0;
const RA: u32 = 1;
const SP: u32 = 2;
const T0: u32 = 5;
const T1: u32 = 6;
const T2: u32 = 7;
const S0: u32 = 8;
const S1: u32 = 9;
const A0: u32 = 10;
const T3: u32 = 28;
const FA0: u32 = 10;

const OP_LOAD: u32 = 0x03;
const OP_LOAD_FP: u32 = 0x07;
const OP_IMM: u32 = 0x13;
const OP_AUIPC: u32 = 0x17;
const OP_STORE: u32 = 0x23;
const OP_STORE_FP: u32 = 0x27;
const OP_REG: u32 = 0x33;
const OP_BRANCH: u32 = 0x63;
const OP_JALR: u32 = 0x67;
const OP_JAL: u32 = 0x6F;

pub(super) struct RiscV32Backend;
pub(super) struct RiscV64Backend;

impl NativeBackend for RiscV32Backend {
    fn emit_invoker(forward_fp: bool) -> Vec<u8> {
        Emitter::new(4).invoker(forward_fp)
    }

    fn emit_thunk(forward_fp: bool, shared: u64, slot: u64, entry: u64) -> Vec<u8> {
        Emitter::new(4).thunk(forward_fp, shared, slot, entry)
    }
}

impl NativeBackend for RiscV64Backend {
    fn emit_invoker(forward_fp: bool) -> Vec<u8> {
        Emitter::new(8).invoker(forward_fp)
    }

    fn emit_thunk(forward_fp: bool, shared: u64, slot: u64, entry: u64) -> Vec<u8> {
        Emitter::new(8).thunk(forward_fp, shared, slot, entry)
    }
}

/// Both register widths share one instruction stream; `xlen` picks the
/// integer load and store widths. Floating point moves are always `fld`/`fsd`.
struct Emitter {
    xlen: u32,
    code: Vec<u8>,
}

impl Emitter {
    fn new(xlen: u32) -> Self {
        Self {
            xlen,
            code: Vec::with_capacity(256),
        }
    }

    fn invoker(mut self, forward_fp: bool) -> Vec<u8> {
        self.addi(SP, SP, -32);
        self.store(RA, SP, 24);
        self.store(S0, SP, 16);
        self.store(S1, SP, 8);
        self.addi(S0, SP, 32);
        self.addi(S1, A0, 0); // mv s1, a0

        self.load(T0, S1, STACK_LEN_OFFSET as i32);
        self.sub(SP, SP, T0);
        self.load(T1, S1, STACK_PTR_OFFSET as i32);
        self.addi(T2, SP, 0); // mv t2, sp
        let loop_start = self.code.len();
        self.emit(0); // beqz t0, done
        self.load(T3, T1, 0);
        self.store(T3, T2, 0);
        let step = self.xlen as i32;
        self.addi(T1, T1, step);
        self.addi(T2, T2, step);
        self.addi(T0, T0, -step);
        let back = loop_start as i32 - self.code.len() as i32;
        self.emit(j_type(OP_JAL, ZERO, back));
        let exit = self.code.len() as i32 - loop_start as i32;
        self.patch(loop_start, b_type(OP_BRANCH, 0, T0, ZERO, exit));

        if forward_fp {
            for reg in 0..8u32 {
                let offset = (VEC_OFFSET + reg * 8) as i32;
                self.emit(i_type(OP_LOAD_FP, 3, FA0 + reg, S1, offset));
            }
        }
        for reg in 0..8u32 {
            self.load(A0 + reg, S1, (GPR_OFFSET + reg * 8) as i32);
        }
        self.load(T0, S1, TARGET_OFFSET as i32);
        self.emit(i_type(OP_JALR, 0, RA, T0, 0));
        self.store(A0, S1, RET_GPR_OFFSET as i32);
        self.store(A0 + 1, S1, (RET_GPR_OFFSET + 8) as i32);
        if forward_fp {
            for reg in 0..2u32 {
                let offset = (RET_VEC_OFFSET + reg * 8) as i32;
                self.emit(s_type(OP_STORE_FP, 3, S1, FA0 + reg, offset));
            }
        }
        self.addi(SP, S0, -32);
        self.load(RA, SP, 24);
        self.load(S0, SP, 16);
        self.load(S1, SP, 8);
        self.addi(SP, SP, 32);
        self.emit(i_type(OP_JALR, 0, ZERO, RA, 0)); // ret
        self.code
    }

    /// The register block sits at the bottom of a frame that also saves
    /// `ra` and `s0`. Dispatch constants are loaded pc-relative from a
    /// literal pool following the code.
    fn thunk(mut self, forward_fp: bool, shared: u64, slot: u64, entry: u64) -> Vec<u8> {
        let frame = (BLOCK_SIZE + 16) as i32;
        let saved_ra = BLOCK_SIZE as i32 + 8;
        let saved_s0 = BLOCK_SIZE as i32;
        self.addi(SP, SP, -frame);
        self.store(RA, SP, saved_ra);
        self.store(S0, SP, saved_s0);
        self.addi(S0, SP, frame);
        for reg in 0..8u32 {
            self.store(A0 + reg, SP, (GPR_OFFSET + reg * 8) as i32);
        }
        if forward_fp {
            for reg in 0..8u32 {
                let offset = (VEC_OFFSET + reg * 8) as i32;
                self.emit(s_type(OP_STORE_FP, 3, SP, FA0 + reg, offset));
            }
        }
        self.store(S0, SP, STACK_PTR_OFFSET as i32);
        let anchor = self.code.len();
        self.emit((T0 << 7) | OP_AUIPC); // auipc t0, 0
        let literal_loads = [self.code.len(), self.code.len() + 4, self.code.len() + 8];
        self.emit(0); // load a0, shared
        self.emit(0); // load a1, slot
        self.emit(0); // load t1, entry
        self.addi(A0 + 2, SP, 0); // mv a2, sp
        self.emit(i_type(OP_JALR, 0, RA, T1, 0));
        self.load(A0, SP, RET_GPR_OFFSET as i32);
        self.load(A0 + 1, SP, (RET_GPR_OFFSET + 8) as i32);
        if forward_fp {
            for reg in 0..2u32 {
                let offset = (RET_VEC_OFFSET + reg * 8) as i32;
                self.emit(i_type(OP_LOAD_FP, 3, FA0 + reg, SP, offset));
            }
        }
        self.load(RA, SP, saved_ra);
        self.load(S0, SP, saved_s0);
        self.addi(SP, SP, frame);
        self.emit(i_type(OP_JALR, 0, ZERO, RA, 0)); // ret

        while self.code.len() % 8 != 0 {
            self.emit(i_type(OP_IMM, 0, ZERO, ZERO, 0)); // nop
        }
        let targets = [A0, A0 + 1, T1];
        for ((load, rd), value) in literal_loads.iter().zip(targets).zip([shared, slot, entry]) {
            let offset = (self.code.len() - anchor) as i32;
            let funct3 = self.width_funct3();
            self.patch(*load, i_type(OP_LOAD, funct3, rd, T0, offset));
            if self.xlen == 8 {
                self.code.extend_from_slice(&value.to_le_bytes());
            } else {
                self.code.extend_from_slice(&(value as u32).to_le_bytes());
            }
        }
        self.code
    }

    fn width_funct3(&self) -> u32 {
        if self.xlen == 8 { 3 } else { 2 }
    }

    fn emit(&mut self, insn: u32) {
        self.code.extend_from_slice(&insn.to_le_bytes());
    }

    fn patch(&mut self, at: usize, insn: u32) {
        self.code[at..at + 4].copy_from_slice(&insn.to_le_bytes());
    }

    fn addi(&mut self, rd: u32, rs1: u32, imm: i32) {
        self.emit(i_type(OP_IMM, 0, rd, rs1, imm));
    }

    fn sub(&mut self, rd: u32, rs1: u32, rs2: u32) {
        self.emit((0x20 << 25) | (rs2 << 20) | (rs1 << 15) | (rd << 7) | OP_REG);
    }

    fn load(&mut self, rd: u32, rs1: u32, offset: i32) {
        let funct3 = self.width_funct3();
        self.emit(i_type(OP_LOAD, funct3, rd, rs1, offset));
    }

    fn store(&mut self, rs2: u32, rs1: u32, offset: i32) {
        let funct3 = self.width_funct3();
        self.emit(s_type(OP_STORE, funct3, rs1, rs2, offset));
    }
}

fn i_type(opcode: u32, funct3: u32, rd: u32, rs1: u32, imm: i32) -> u32 {
    (((imm as u32) & 0xFFF) << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
}

fn s_type(opcode: u32, funct3: u32, rs1: u32, rs2: u32, imm: i32) -> u32 {
    let imm = imm as u32;
    (((imm >> 5) & 0x7F) << 25)
        | (rs2 << 20)
        | (rs1 << 15)
        | (funct3 << 12)
        | ((imm & 0x1F) << 7)
        | opcode
}

fn b_type(opcode: u32, funct3: u32, rs1: u32, rs2: u32, imm: i32) -> u32 {
    let imm = imm as u32;
    (((imm >> 12) & 1) << 31)
        | (((imm >> 5) & 0x3F) << 25)
        | (rs2 << 20)
        | (rs1 << 15)
        | (funct3 << 12)
        | (((imm >> 1) & 0xF) << 8)
        | (((imm >> 11) & 1) << 7)
        | opcode
}

fn j_type(opcode: u32, rd: u32, imm: i32) -> u32 {
    let imm = imm as u32;
    (((imm >> 20) & 1) << 31)
        | (((imm >> 1) & 0x3FF) << 21)
        | (((imm >> 11) & 1) << 20)
        | (((imm >> 12) & 0xFF) << 12)
        | (rd << 7)
        | opcode
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(code: &[u8]) -> Vec<u32> {
        code.chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    #[test]
    fn base_formats_match_assembler_output() {
        assert_eq!(i_type(OP_IMM, 0, SP, SP, -32), 0xFE010113); // addi sp, sp, -32
        assert_eq!(s_type(OP_STORE, 3, SP, RA, 24), 0x00113C23); // sd ra, 24(sp)
        assert_eq!(i_type(OP_JALR, 0, ZERO, RA, 0), 0x00008067); // ret
        assert_eq!(i_type(OP_LOAD, 3, A0, S1, 0), 0x0004B503); // ld a0, 0(s1)
    }

    #[test]
    fn copy_loop_offsets_are_patched() {
        let insns = words(&RiscV64Backend::emit_invoker(false));
        let beqz = insns
            .iter()
            .position(|insn| insn & 0x7F == OP_BRANCH)
            .expect("branch present");
        assert_eq!(insns[beqz], b_type(OP_BRANCH, 0, T0, ZERO, 28));
        assert_eq!(insns[beqz + 6], j_type(OP_JAL, ZERO, -24));
    }

    #[test]
    fn rv32_uses_word_transfers() {
        let insns = words(&RiscV32Backend::emit_invoker(false));
        assert!(insns.contains(&i_type(OP_LOAD, 2, A0, S1, 0)));
        assert!(!insns.contains(&i_type(OP_LOAD, 3, A0, S1, 0)));
    }

    #[test]
    fn thunk_literals_follow_aligned_code() {
        let code = RiscV64Backend::emit_thunk(true, 0xDEAD_BEEF_0000, 4, 0x1234_5678);
        let tail = &code[code.len() - 24..];
        assert_eq!(&tail[..8], &0xDEAD_BEEF_0000u64.to_le_bytes());
        assert_eq!(&tail[8..16], &4u64.to_le_bytes());
        assert_eq!(&tail[16..], &0x1234_5678u64.to_le_bytes());
        assert_eq!((code.len() - 24) % 8, 0);
    }

    #[test]
    fn fp_avoiding_variants_have_no_fp_transfers() {
        let insns = words(&RiscV64Backend::emit_thunk(false, 1, 2, 3));
        assert!(
            !insns
                .iter()
                .any(|insn| matches!(insn & 0x7F, OP_LOAD_FP | OP_STORE_FP))
        );
    }
}
