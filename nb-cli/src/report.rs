use nbridge::abi::Extend;
use nbridge::native::{emit_invoker, emit_thunk};
use nbridge::{Abi, ClassifiedSignature, Location, Piece, decorate_symbol};
use serde::Serialize;

use crate::logging;

#[derive(Debug, Serialize)]
pub struct ClassificationReport {
    pub abi: &'static str,
    pub signature: String,
    /// Linker name when the convention decorates it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    pub params: Vec<ParamReport>,
    pub returns: ReturnReport,
    pub stack_args_size: u32,
    pub callee_pop: u32,
    pub forward_fp: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_hint: Option<u8>,
}

#[derive(Debug, Serialize)]
pub struct ParamReport {
    pub index: usize,
    #[serde(rename = "type")]
    pub ty: String,
    pub by_reference: bool,
    pub pieces: Vec<PieceReport>,
}

#[derive(Debug, Serialize)]
pub struct ReturnReport {
    #[serde(rename = "type")]
    pub ty: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hidden: Option<String>,
    pub x87: bool,
    pub pieces: Vec<PieceReport>,
}

#[derive(Debug, Serialize)]
pub struct PieceReport {
    pub offset: u32,
    pub size: u32,
    pub location: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extend: Option<&'static str>,
}

impl ClassificationReport {
    pub fn new(classified: &ClassifiedSignature) -> Self {
        let abi = classified.abi;
        let signature = &classified.signature;
        let params = signature
            .parameters()
            .iter()
            .zip(&classified.params)
            .enumerate()
            .map(|(index, (slot, class))| ParamReport {
                index,
                ty: slot.ty.describe(),
                by_reference: class.by_reference,
                pieces: class
                    .pieces
                    .iter()
                    .map(|piece| piece_report(abi, piece, Role::Argument))
                    .collect(),
            })
            .collect();
        let returns = ReturnReport {
            ty: signature.ret().ty.describe(),
            hidden: classified
                .ret
                .hidden
                .map(|location| location_name(abi, location, Role::Argument)),
            x87: classified.ret.x87,
            pieces: classified
                .ret
                .pieces
                .iter()
                .map(|piece| piece_report(abi, piece, Role::Result))
                .collect(),
        };
        let symbol = signature.name().and_then(|name| {
            let decorated = decorate_symbol(name, signature.convention(), signature, abi);
            (decorated != name).then_some(decorated)
        });
        Self {
            abi: abi.name(),
            signature: describe_signature(classified),
            symbol,
            params,
            returns,
            stack_args_size: classified.stack_args_size,
            callee_pop: classified.callee_pop,
            forward_fp: classified.forward_fp,
            vector_hint: classified.vector_hint,
        }
    }

    pub fn render(&self) -> String {
        let mut out = format!("{} {}\n", logging::abi_label(self.abi), self.signature);
        if let Some(symbol) = &self.symbol {
            out.push_str(&format!("  symbol {symbol}\n"));
        }
        for param in &self.params {
            let by_reference = if param.by_reference { " (by reference)" } else { "" };
            out.push_str(&format!(
                "  arg{:<2} {:<28} {}{by_reference}\n",
                param.index,
                param.ty,
                render_pieces(&param.pieces)
            ));
        }
        let placement = if let Some(hidden) = &self.returns.hidden {
            format!("memory, buffer address in {hidden}")
        } else if self.returns.x87 {
            "st0".to_string()
        } else if self.returns.pieces.is_empty() {
            "-".to_string()
        } else {
            render_pieces(&self.returns.pieces)
        };
        out.push_str(&format!("  ret   {:<28} {placement}\n", self.returns.ty));
        out.push_str(&format!("  stack {} bytes", self.stack_args_size));
        if self.callee_pop > 0 {
            out.push_str(&format!(", callee pops {}", self.callee_pop));
        }
        if let Some(hint) = self.vector_hint {
            out.push_str(&format!(", al={hint}"));
        }
        if self.forward_fp {
            out.push_str(", fp stub");
        }
        out.push('\n');
        out
    }
}

fn describe_signature(classified: &ClassifiedSignature) -> String {
    let signature = &classified.signature;
    let mut params: Vec<String> = signature
        .parameters()
        .iter()
        .map(|slot| slot.ty.describe())
        .collect();
    if signature.is_variadic() {
        params.push("...".to_string());
    }
    format!(
        "{} {}({}) [{}]",
        signature.ret().ty.describe(),
        signature.name().unwrap_or("fn"),
        params.join(", "),
        signature.convention().name()
    )
}

fn piece_report(abi: Abi, piece: &Piece, role: Role) -> PieceReport {
    PieceReport {
        offset: piece.offset,
        size: piece.size,
        location: location_name(abi, piece.location, role),
        extend: match piece.extend {
            Extend::None => None,
            Extend::Zero => Some("zext"),
            Extend::Sign => Some("sext"),
            Extend::NanBox => Some("nanbox"),
        },
    }
}

fn render_pieces(pieces: &[PieceReport]) -> String {
    pieces
        .iter()
        .map(|piece| {
            let extend = piece.extend.map(|name| format!(" {name}")).unwrap_or_default();
            format!(
                "{}[{}..{}]{extend}",
                logging::location_label(&piece.location),
                piece.offset,
                piece.offset + piece.size
            )
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whether a placement feeds the callee or carries its result back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Argument,
    Result,
}

/// Assembler name of a placement on `abi`.
pub fn location_name(abi: Abi, location: Location, role: Role) -> String {
    match location {
        Location::Stack(offset) => format!("[sp+{offset}]"),
        Location::IndirectResult => "x8".to_string(),
        Location::Gpr(index) => gpr_name(abi, index, role),
        Location::Vec { index, width } => vector_name(abi, index, width),
    }
}

fn gpr_name(abi: Abi, index: u8, role: Role) -> String {
    let index = usize::from(index);
    let table: &[&str] = match (abi, role) {
        (Abi::X86 { .. }, Role::Argument) => &["ecx", "edx"],
        (Abi::X86 { .. }, Role::Result) => &["eax", "edx"],
        (Abi::X86_64SysV, Role::Argument) => &["rdi", "rsi", "rdx", "rcx", "r8", "r9"],
        (Abi::Win64, Role::Argument) => &["rcx", "rdx", "r8", "r9"],
        (Abi::X86_64SysV | Abi::Win64, Role::Result) => &["rax", "rdx"],
        (Abi::Arm32 { .. }, _) => &["r0", "r1", "r2", "r3"],
        (Abi::Arm64 { .. }, _) => return format!("x{index}"),
        (Abi::RiscV32 | Abi::RiscV64, _) => return format!("a{index}"),
    };
    table
        .get(index)
        .map(|name| name.to_string())
        .unwrap_or_else(|| format!("gpr{index}"))
}

fn vector_name(abi: Abi, index: u8, width: u8) -> String {
    match abi {
        Abi::X86_64SysV | Abi::Win64 | Abi::X86 { .. } => format!("xmm{index}"),
        Abi::Arm32 { .. } if width == 4 => format!("s{index}"),
        Abi::Arm32 { .. } => format!("d{index}"),
        Abi::Arm64 { .. } if width == 4 => format!("s{index}"),
        Abi::Arm64 { .. } => format!("d{index}"),
        Abi::RiscV32 | Abi::RiscV64 => format!("fa{index}"),
    }
}

/// Hex listing of the invoker and one callback thunk for `abi`.
pub fn stub_listing(abi: Abi) -> String {
    let mut out = String::new();
    for forward_fp in [false, true] {
        let variant = if forward_fp { "fp" } else { "int" };
        out.push_str(&hex_block(
            &format!("{} invoker ({variant})", logging::abi_label(abi.name())),
            &emit_invoker(abi, forward_fp),
        ));
        out.push_str(&hex_block(
            &format!("{} thunk ({variant})", logging::abi_label(abi.name())),
            &emit_thunk(abi, forward_fp, 0, 0, 0),
        ));
    }
    out
}

fn hex_block(title: &str, code: &[u8]) -> String {
    let mut out = format!("{title}: {} bytes\n", code.len());
    for (row, chunk) in code.chunks(16).enumerate() {
        let bytes = chunk
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect::<Vec<_>>()
            .join(" ");
        out.push_str(&format!("  {:04x}  {bytes}\n", row * 16));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use nbridge::{SignatureBuilder, TypeDescriptor, classify};

    #[test]
    fn names_follow_the_abi_register_file() {
        let arg = Role::Argument;
        assert_eq!(location_name(Abi::X86_64SysV, Location::Gpr(3), arg), "rcx");
        assert_eq!(location_name(Abi::X86_64SysV, Location::Gpr(0), Role::Result), "rax");
        assert_eq!(location_name(Abi::Win64, Location::Gpr(0), arg), "rcx");
        assert_eq!(
            location_name(
                Abi::Arm32 { hard_float: true },
                Location::Vec { index: 1, width: 4 },
                arg
            ),
            "s1"
        );
        assert_eq!(
            location_name(Abi::RiscV64, Location::Vec { index: 0, width: 8 }, arg),
            "fa0"
        );
        assert_eq!(
            location_name(Abi::Arm64 { apple: false }, Location::Stack(16), arg),
            "[sp+16]"
        );
    }

    #[test]
    fn report_lists_every_parameter() {
        let signature = SignatureBuilder::new(TypeDescriptor::int32())
            .name("add")
            .param(TypeDescriptor::int32())
            .param(TypeDescriptor::int8())
            .build()
            .expect("signature");
        let classified = classify(Abi::X86_64SysV, signature).expect("classify");
        let report = ClassificationReport::new(&classified);
        assert_eq!(report.params.len(), 2);
        assert_eq!(report.params[1].pieces[0].location, "rsi");
        assert_eq!(report.params[1].pieces[0].extend, Some("sext"));
        let json = serde_json::to_value(&report).expect("json");
        assert_eq!(json["abi"], "x86_64-sysv");
        assert_eq!(json["returns"]["pieces"][0]["location"], "rax");
    }

    #[test]
    fn stdcall_symbols_are_decorated_on_x86() {
        let signature = SignatureBuilder::new(TypeDescriptor::void())
            .name("Run")
            .convention(nbridge::CallingConvention::Stdcall)
            .param(TypeDescriptor::int32())
            .param(TypeDescriptor::float64())
            .build()
            .expect("signature");
        let x86 = classify(Abi::X86 { msvc: true }, signature.clone()).expect("classify");
        assert_eq!(ClassificationReport::new(&x86).symbol.as_deref(), Some("_Run@12"));
        let sysv = classify(Abi::X86_64SysV, signature).expect("classify");
        assert_eq!(ClassificationReport::new(&sysv).symbol, None);
    }

    #[test]
    fn stub_listing_covers_both_variants() {
        let listing = stub_listing(Abi::Arm64 { apple: false });
        assert_eq!(listing.matches("invoker").count(), 2);
        assert_eq!(listing.matches("thunk").count(), 2);
        assert!(listing.contains("  0000  "));
    }
}
