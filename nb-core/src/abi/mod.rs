use std::sync::Arc;

use tracing::debug;

use crate::error::{BridgeError, BridgeResult};
use crate::signature::{CallingConvention, SignatureDescriptor, TypeDescriptor, TypeKind, align_up};

mod arm32;
mod arm64;
mod riscv;
mod x64_sysv;
mod x64_win;
mod x86;

pub use x86::decorate_symbol;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Abi {
    /// 32-bit x86; `msvc` selects the Microsoft record return rules.
    X86 { msvc: bool },
    X86_64SysV,
    Win64,
    Arm32 { hard_float: bool },
    /// AAPCS64; `apple` selects the Darwin variadic and stack packing rules.
    Arm64 { apple: bool },
    RiscV32,
    RiscV64,
}

impl Abi {
    pub const ALL: [Abi; 10] = [
        Abi::X86 { msvc: false },
        Abi::X86 { msvc: true },
        Abi::X86_64SysV,
        Abi::Win64,
        Abi::Arm32 { hard_float: true },
        Abi::Arm32 { hard_float: false },
        Abi::Arm64 { apple: false },
        Abi::Arm64 { apple: true },
        Abi::RiscV32,
        Abi::RiscV64,
    ];

    /// ABI of the running process, if it is one the bridge knows.
    pub fn host() -> Option<Abi> {
        if cfg!(all(target_arch = "x86_64", windows)) {
            Some(Abi::Win64)
        } else if cfg!(target_arch = "x86_64") {
            Some(Abi::X86_64SysV)
        } else if cfg!(target_arch = "x86") {
            Some(Abi::X86 {
                msvc: cfg!(target_env = "msvc"),
            })
        } else if cfg!(target_arch = "aarch64") {
            Some(Abi::Arm64 {
                apple: cfg!(target_vendor = "apple"),
            })
        } else if cfg!(target_arch = "arm") {
            Some(Abi::Arm32 {
                hard_float: cfg!(target_abi = "eabihf"),
            })
        } else if cfg!(target_arch = "riscv64") {
            Some(Abi::RiscV64)
        } else if cfg!(target_arch = "riscv32") {
            Some(Abi::RiscV32)
        } else {
            None
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Abi::X86 { msvc: false } => "x86",
            Abi::X86 { msvc: true } => "x86-msvc",
            Abi::X86_64SysV => "x86_64-sysv",
            Abi::Win64 => "win64",
            Abi::Arm32 { hard_float: true } => "arm32-hf",
            Abi::Arm32 { hard_float: false } => "arm32-soft",
            Abi::Arm64 { apple: false } => "arm64",
            Abi::Arm64 { apple: true } => "arm64-apple",
            Abi::RiscV32 => "riscv32",
            Abi::RiscV64 => "riscv64",
        }
    }

    pub fn parse(name: &str) -> Option<Abi> {
        Abi::ALL.into_iter().find(|abi| abi.name() == name)
    }

    pub fn pointer_size(self) -> usize {
        match self {
            Abi::X86 { .. } | Abi::Arm32 { .. } | Abi::RiscV32 => 4,
            Abi::X86_64SysV | Abi::Win64 | Abi::Arm64 { .. } | Abi::RiscV64 => 8,
        }
    }

    /// Argument registers available for integer-class values.
    pub fn gpr_budget(self, convention: CallingConvention) -> usize {
        match self {
            Abi::X86 { .. } => match convention {
                CallingConvention::Fastcall => 2,
                CallingConvention::Thiscall => 1,
                _ => 0,
            },
            Abi::X86_64SysV => 6,
            Abi::Win64 | Abi::Arm32 { .. } => 4,
            Abi::Arm64 { .. } | Abi::RiscV32 | Abi::RiscV64 => 8,
        }
    }

    /// Argument registers available for floating values, in 4-byte units on
    /// ARM32 (s0-s15) and whole registers elsewhere.
    pub fn vector_budget(self) -> usize {
        match self {
            Abi::X86 { .. } | Abi::Arm32 { hard_float: false } => 0,
            Abi::X86_64SysV | Abi::Arm64 { .. } | Abi::RiscV32 | Abi::RiscV64 => 8,
            Abi::Win64 => 4,
            Abi::Arm32 { hard_float: true } => 16,
        }
    }

    pub fn is_host(self) -> bool {
        Abi::host() == Some(self)
    }

    /// Byte offset of a vector register inside the staged vector file.
    pub fn vector_byte_offset(self, index: u8, width: u8) -> usize {
        match self {
            // s<n> and d<n> alias the same bank: s<2n>/s<2n+1> form d<n>.
            Abi::Arm32 { .. } => usize::from(index) * usize::from(width),
            _ => usize::from(index) * 8,
        }
    }
}

impl std::fmt::Display for Abi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Location {
    Gpr(u8),
    Vec { index: u8, width: u8 },
    /// Offset from the stack pointer at the call instruction.
    Stack(u32),
    /// AArch64 x8.
    IndirectResult,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Extend {
    None,
    Zero,
    Sign,
    /// Single-precision value in a double-width register, upper half all ones.
    NanBox,
}

/// Bytes `offset..offset + size` of a value's native image placed at
/// `location`. Extended pieces are widened to the register width.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Piece {
    pub offset: u32,
    pub size: u32,
    pub location: Location,
    pub extend: Extend,
}

impl Piece {
    pub fn new(offset: usize, size: usize, location: Location) -> Self {
        Self {
            offset: offset as u32,
            size: size as u32,
            location,
            extend: Extend::None,
        }
    }

    pub fn extended(offset: usize, size: usize, location: Location, extend: Extend) -> Self {
        Self {
            extend,
            ..Self::new(offset, size, location)
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ArgClass {
    pub pieces: Vec<Piece>,
    pub gpr_count: u8,
    pub vector_count: u8,
    pub use_memory: bool,
    pub by_reference: bool,
    pub gpr_first: bool,
}

impl ArgClass {
    pub(crate) fn from_pieces(pieces: Vec<Piece>) -> Self {
        let gpr_count = pieces
            .iter()
            .filter(|piece| matches!(piece.location, Location::Gpr(_)))
            .count() as u8;
        let vector_count = pieces
            .iter()
            .filter(|piece| matches!(piece.location, Location::Vec { .. }))
            .count() as u8;
        let use_memory = pieces
            .iter()
            .any(|piece| matches!(piece.location, Location::Stack(_)));
        let gpr_first = pieces
            .first()
            .is_some_and(|piece| matches!(piece.location, Location::Gpr(_)));
        Self {
            pieces,
            gpr_count,
            vector_count,
            use_memory,
            by_reference: false,
            gpr_first,
        }
    }

    pub(crate) fn by_reference(location: Location, pointer_size: usize) -> Self {
        Self {
            by_reference: true,
            ..Self::from_pieces(vec![Piece::new(0, pointer_size, location)])
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReturnClass {
    pub pieces: Vec<Piece>,
    /// Where the caller passes the address of the result buffer.
    pub hidden: Option<Location>,
    /// Floating result left in x87 ST0.
    pub x87: bool,
}

impl ReturnClass {
    pub(crate) fn void() -> Self {
        Self::default()
    }

    pub(crate) fn pieces(pieces: Vec<Piece>) -> Self {
        Self {
            pieces,
            ..Self::default()
        }
    }

    pub(crate) fn hidden(location: Location) -> Self {
        Self {
            hidden: Some(location),
            ..Self::default()
        }
    }

    pub fn uses_vector(&self) -> bool {
        self.x87
            || self
                .pieces
                .iter()
                .any(|piece| matches!(piece.location, Location::Vec { .. }))
    }
}

/// Output of a per-ABI classifier before the signature level fields are
/// derived.
pub(crate) struct Lowering {
    pub params: Vec<ArgClass>,
    pub ret: ReturnClass,
    pub stack_used: usize,
    pub callee_pop: usize,
    pub vector_hint: Option<u8>,
}

#[derive(Clone, Debug)]
pub struct ClassifiedSignature {
    pub abi: Abi,
    pub signature: Arc<SignatureDescriptor>,
    pub params: Vec<ArgClass>,
    pub ret: ReturnClass,
    /// Outgoing stack argument bytes, rounded up to 16.
    pub stack_args_size: u32,
    /// Some vector register carries an argument or the result.
    pub forward_fp: bool,
    /// Bytes the callee removes from the stack on return (x86 only).
    pub callee_pop: u32,
    /// SysV `%al` for variadic calls.
    pub vector_hint: Option<u8>,
}

impl ClassifiedSignature {
    pub fn gprs_used(&self) -> usize {
        self.params.iter().map(|class| usize::from(class.gpr_count)).sum()
    }

    pub fn vectors_used(&self) -> usize {
        self.params
            .iter()
            .map(|class| usize::from(class.vector_count))
            .sum()
    }
}

pub fn classify(abi: Abi, signature: Arc<SignatureDescriptor>) -> BridgeResult<ClassifiedSignature> {
    validate_for_abi(abi, &signature)?;

    let lowering = match abi {
        Abi::X86 { msvc } => x86::lower(&signature, msvc)?,
        Abi::X86_64SysV => x64_sysv::lower(&signature)?,
        Abi::Win64 => x64_win::lower(&signature)?,
        Abi::Arm32 { hard_float } => arm32::lower(&signature, hard_float)?,
        Abi::Arm64 { apple } => arm64::lower(&signature, apple)?,
        Abi::RiscV32 => riscv::lower(&signature, 4)?,
        Abi::RiscV64 => riscv::lower(&signature, 8)?,
    };

    let forward_fp = lowering.ret.uses_vector()
        || lowering.params.iter().any(|class| class.vector_count > 0);
    let stack_args_size = u32::try_from(align_up(lowering.stack_used, 16))
        .map_err(|_| BridgeError::unsupported("stack argument area too large"))?;

    debug!(
        abi = abi.name(),
        name = signature.name().unwrap_or("<anonymous>"),
        params = lowering.params.len(),
        stack_args_size,
        forward_fp,
        "classified signature"
    );

    Ok(ClassifiedSignature {
        abi,
        params: lowering.params,
        ret: lowering.ret,
        stack_args_size,
        forward_fp,
        callee_pop: lowering.callee_pop as u32,
        vector_hint: lowering.vector_hint,
        signature,
    })
}

fn validate_for_abi(abi: Abi, signature: &SignatureDescriptor) -> BridgeResult<()> {
    let is_x86 = matches!(abi, Abi::X86 { .. });
    match signature.convention() {
        CallingConvention::Fastcall | CallingConvention::Thiscall if !is_x86 => {
            return Err(BridgeError::unsupported(format!(
                "{} calling convention is not available on {abi}",
                signature.convention().name()
            )));
        }
        _ => {}
    }

    let pointer_size = abi.pointer_size();
    let types = signature
        .parameters()
        .iter()
        .map(|slot| &slot.ty)
        .chain(std::iter::once(&signature.ret().ty));
    for ty in types {
        let width = ty.pointer_width().unwrap_or(pointer_size);
        if width != pointer_size {
            return Err(BridgeError::unsupported(format!(
                "{} was built for {width}-byte pointers but {abi} uses {pointer_size}",
                ty.describe()
            )));
        }
    }
    Ok(())
}

/// Sign or zero extension applied to an integer-class scalar.
pub(crate) fn scalar_extend(kind: TypeKind) -> Extend {
    if kind.is_signed() {
        Extend::Sign
    } else if kind.is_integer() {
        Extend::Zero
    } else {
        Extend::None
    }
}

/// Integer-class kinds that travel in general purpose registers.
pub(crate) fn is_integer_class(kind: TypeKind) -> bool {
    kind.is_integer() || kind.is_pointer_like()
}

pub(crate) fn is_record(ty: &TypeDescriptor) -> bool {
    ty.kind() == TypeKind::Record
}

/// Running offset into the outgoing stack area.
#[derive(Default)]
pub(crate) struct StackCursor {
    pub offset: usize,
}

impl StackCursor {
    /// Reserve `size` bytes aligned to `align`, advancing by `size` rounded
    /// up to `slot`.
    pub fn take(&mut self, size: usize, align: usize, slot: usize) -> usize {
        let start = align_up(self.offset, align);
        self.offset = start + align_up(size.max(1), slot);
        start
    }
}
