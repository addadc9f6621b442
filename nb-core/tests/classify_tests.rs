mod common;
use common::*;

use nbridge::abi::{Extend, Piece};
use nbridge::signature::is_homogeneous_aggregate;

fn locations(classified: &ClassifiedSignature, index: usize) -> Vec<Location> {
    classified.params[index]
        .pieces
        .iter()
        .map(|piece| piece.location)
        .collect()
}

fn repeated(ty: Arc<TypeDescriptor>, count: usize) -> Arc<SignatureDescriptor> {
    (0..count)
        .fold(SignatureBuilder::new(TypeDescriptor::void()), |builder, _| {
            builder.param(ty.clone())
        })
        .build()
        .expect("signature")
}

#[test]
fn add_uses_two_gprs_and_returns_in_rax() {
    let signature = SignatureBuilder::new(TypeDescriptor::int32())
        .name("Add")
        .param(TypeDescriptor::int32())
        .param(TypeDescriptor::int32())
        .build()
        .expect("signature");
    let classified = classify(Abi::X86_64SysV, signature).expect("classify");

    assert_eq!(locations(&classified, 0), vec![Location::Gpr(0)]);
    assert_eq!(locations(&classified, 1), vec![Location::Gpr(1)]);
    assert_eq!(classified.params[0].pieces[0].extend, Extend::Sign);
    assert_eq!(classified.ret.pieces, vec![Piece::new(0, 4, Location::Gpr(0))]);
    assert_eq!(classified.stack_args_size, 0);
    assert!(!classified.forward_fp);
}

#[test]
fn twenty_byte_record_is_passed_in_memory_on_sysv() {
    let signature = SignatureBuilder::new(wide_record())
        .param(wide_record())
        .build()
        .expect("signature");
    let classified = classify(Abi::X86_64SysV, signature).expect("classify");

    let class = &classified.params[0];
    assert!(class.use_memory);
    assert_eq!(class.pieces, vec![Piece::new(0, 20, Location::Stack(0))]);
    assert_eq!(classified.ret.hidden, Some(Location::Gpr(0)));
    assert_eq!(classified.stack_args_size, 32);
}

#[test]
fn variadic_tail_spills_to_the_stack_in_order() {
    let signature = SignatureBuilder::new(TypeDescriptor::int32())
        .convention(CallingConvention::Cdecl)
        .param(TypeDescriptor::int32())
        .variadic()
        .build()
        .expect("signature");
    let extra = vec![TypeDescriptor::int32(); 7];
    let expanded = signature.with_variadic_args(&extra).expect("expand");
    assert_eq!(expanded.parameters().len(), 8);
    assert!(expanded.parameters()[7].variadic);

    let classified = classify(Abi::X86_64SysV, expanded).expect("classify");
    for index in 0..6 {
        assert_eq!(locations(&classified, index), vec![Location::Gpr(index as u8)]);
    }
    assert_eq!(locations(&classified, 6), vec![Location::Stack(0)]);
    assert_eq!(locations(&classified, 7), vec![Location::Stack(8)]);
    assert_eq!(classified.vector_hint, Some(0));
}

#[test]
fn variadic_promotions_widen_small_kinds() {
    let signature = SignatureBuilder::new(TypeDescriptor::int32())
        .param(TypeDescriptor::string())
        .variadic()
        .build()
        .expect("signature");
    let expanded = signature
        .with_variadic_args(&[
            TypeDescriptor::float32(),
            TypeDescriptor::int8(),
            TypeDescriptor::uint16(),
        ])
        .expect("expand");
    let kinds: Vec<TypeKind> = expanded
        .parameters()
        .iter()
        .map(|slot| slot.ty.kind())
        .collect();
    assert_eq!(
        kinds,
        vec![TypeKind::String, TypeKind::Float64, TypeKind::Int32, TypeKind::UInt32]
    );

    let classified = classify(Abi::X86_64SysV, expanded).expect("classify");
    assert_eq!(classified.vector_hint, Some(1));
}

#[test]
fn homogeneous_aggregates_are_recognised() {
    assert_eq!(
        is_homogeneous_aggregate(&point_record(), 1, 4),
        Some(TypeKind::Float64)
    );
    let mixed = TypeDescriptor::record(
        "Mixed",
        vec![("x", TypeDescriptor::float32()), ("y", TypeDescriptor::float64())],
    )
    .expect("record");
    assert_eq!(is_homogeneous_aggregate(&mixed, 1, 4), None);
    let five = TypeDescriptor::array(TypeDescriptor::float32(), 5).expect("array");
    let holder = TypeDescriptor::record("Five", vec![("values", five)]).expect("record");
    assert_eq!(is_homogeneous_aggregate(&holder, 1, 4), None);
    assert_eq!(is_homogeneous_aggregate(&TypeDescriptor::float64(), 1, 4), None);
}

#[test]
fn sysv_sixteen_byte_records_use_two_eightbytes() {
    let record = TypeDescriptor::record(
        "Twelve",
        vec![
            ("a", TypeDescriptor::int32()),
            ("b", TypeDescriptor::int32()),
            ("c", TypeDescriptor::float32()),
        ],
    )
    .expect("record");
    let signature = SignatureBuilder::new(TypeDescriptor::void())
        .param(record)
        .build()
        .expect("signature");
    let classified = classify(Abi::X86_64SysV, signature).expect("classify");
    assert_eq!(
        classified.params[0].pieces,
        vec![
            Piece::new(0, 8, Location::Gpr(0)),
            Piece::new(8, 4, Location::Vec { index: 0, width: 8 }),
        ]
    );
}

#[test]
fn sysv_large_records_go_to_memory() {
    let big = TypeDescriptor::array(TypeDescriptor::int64(), 9).expect("array");
    let record = TypeDescriptor::record("Big", vec![("values", big)]).expect("record");
    let signature = SignatureBuilder::new(TypeDescriptor::void())
        .param(TypeDescriptor::int32())
        .param(record)
        .param(TypeDescriptor::int32())
        .build()
        .expect("signature");
    let classified = classify(Abi::X86_64SysV, signature).expect("classify");
    assert!(classified.params[1].use_memory);
    assert_eq!(locations(&classified, 2), vec![Location::Gpr(1)]);
    assert_eq!(classified.stack_args_size, 80);
}

#[test]
fn register_budgets_are_never_exceeded() {
    let ints = repeated(TypeDescriptor::int32(), 12);
    let doubles = repeated(TypeDescriptor::float64(), 12);
    for abi in Abi::ALL {
        let classified = classify(abi, ints.clone()).expect("ints");
        assert!(
            classified.gprs_used() <= abi.gpr_budget(CallingConvention::Default),
            "{abi}: {} gprs",
            classified.gprs_used()
        );
        let classified = classify(abi, doubles.clone()).expect("doubles");
        assert!(
            classified.vectors_used() <= abi.vector_budget(),
            "{abi}: {} vectors",
            classified.vectors_used()
        );
        for class in &classified.params {
            for piece in &class.pieces {
                if let Location::Gpr(index) = piece.location {
                    assert!(usize::from(index) < 8, "{abi}");
                }
            }
        }
    }
}

#[test]
fn win64_passes_odd_sized_records_by_reference() {
    let triple = TypeDescriptor::record(
        "Triple",
        vec![
            ("a", TypeDescriptor::int32()),
            ("b", TypeDescriptor::int32()),
            ("c", TypeDescriptor::int32()),
        ],
    )
    .expect("record");
    let signature = SignatureBuilder::new(TypeDescriptor::float64())
        .param(triple)
        .param(TypeDescriptor::float64())
        .param(TypeDescriptor::int32())
        .param(TypeDescriptor::int32())
        .param(TypeDescriptor::int64())
        .build()
        .expect("signature");
    let classified = classify(Abi::Win64, signature).expect("classify");

    assert!(classified.params[0].by_reference);
    assert_eq!(locations(&classified, 0), vec![Location::Gpr(0)]);
    assert_eq!(
        locations(&classified, 1),
        vec![Location::Vec { index: 1, width: 8 }]
    );
    assert_eq!(locations(&classified, 4), vec![Location::Stack(32)]);
    assert_eq!(classified.stack_args_size, 48);
    assert_eq!(
        classified.ret.pieces,
        vec![Piece::new(0, 8, Location::Vec { index: 0, width: 8 })]
    );
}

#[test]
fn x86_stdcall_and_fastcall_report_callee_cleanup() {
    let build = |convention| {
        SignatureBuilder::new(TypeDescriptor::int32())
            .convention(convention)
            .param(TypeDescriptor::int32())
            .param(TypeDescriptor::int16())
            .param(TypeDescriptor::float64())
            .build()
            .expect("signature")
    };
    let abi = Abi::X86 { msvc: true };

    let stdcall = classify(abi, build(CallingConvention::Stdcall)).expect("stdcall");
    assert_eq!(locations(&stdcall, 0), vec![Location::Stack(0)]);
    assert_eq!(locations(&stdcall, 2), vec![Location::Stack(8)]);
    assert_eq!(stdcall.callee_pop, 16);

    let fastcall = classify(abi, build(CallingConvention::Fastcall)).expect("fastcall");
    assert_eq!(locations(&fastcall, 0), vec![Location::Gpr(0)]);
    assert_eq!(locations(&fastcall, 1), vec![Location::Gpr(1)]);
    assert_eq!(locations(&fastcall, 2), vec![Location::Stack(0)]);
    assert_eq!(fastcall.callee_pop, 8);

    let cdecl = classify(abi, build(CallingConvention::Cdecl)).expect("cdecl");
    assert_eq!(cdecl.callee_pop, 0);
}

#[test]
fn x86_float_results_use_x87() {
    let signature = SignatureBuilder::new(TypeDescriptor::float64())
        .param(TypeDescriptor::float64())
        .build()
        .expect("signature");
    let classified = classify(Abi::X86 { msvc: false }, signature).expect("classify");
    assert!(classified.ret.x87);
    assert!(classified.forward_fp);
}

#[test]
fn x86_record_returns_depend_on_msvc_rules() {
    let pair = TypeDescriptor::record(
        "Pair",
        vec![("a", TypeDescriptor::int32()), ("b", TypeDescriptor::int32())],
    )
    .expect("record");
    let signature = SignatureBuilder::new(pair).build().expect("signature");

    let msvc = classify(Abi::X86 { msvc: true }, signature.clone()).expect("msvc");
    assert_eq!(msvc.ret.hidden, None);
    assert_eq!(msvc.ret.pieces.len(), 2);

    let sysv = classify(Abi::X86 { msvc: false }, signature).expect("sysv");
    assert_eq!(sysv.ret.hidden, Some(Location::Stack(0)));
    assert_eq!(sysv.callee_pop, 4);
}

#[test]
fn fastcall_is_rejected_outside_x86() {
    let signature = SignatureBuilder::new(TypeDescriptor::void())
        .convention(CallingConvention::Fastcall)
        .build()
        .expect("signature");
    let err = classify(Abi::X86_64SysV, signature).expect_err("fastcall on sysv");
    assert!(matches!(err, BridgeError::UnsupportedSignature(_)));

    let stdcall = SignatureBuilder::new(TypeDescriptor::void())
        .convention(CallingConvention::Stdcall)
        .param(TypeDescriptor::int32())
        .build()
        .expect("signature");
    let classified = classify(Abi::Win64, stdcall).expect("stdcall is accepted");
    assert_eq!(classified.callee_pop, 0);
}

#[test]
fn arm32_hard_float_back_fills_singles() {
    let signature = SignatureBuilder::new(TypeDescriptor::void())
        .param(TypeDescriptor::float32())
        .param(TypeDescriptor::float64())
        .param(TypeDescriptor::float32())
        .build()
        .expect("signature");
    let classified = classify(Abi::Arm32 { hard_float: true }, signature.clone()).expect("hf");
    assert_eq!(locations(&classified, 0), vec![Location::Vec { index: 0, width: 4 }]);
    assert_eq!(locations(&classified, 1), vec![Location::Vec { index: 1, width: 8 }]);
    assert_eq!(locations(&classified, 2), vec![Location::Vec { index: 1, width: 4 }]);
    assert_eq!(Abi::Arm32 { hard_float: true }.vector_byte_offset(1, 4), 4);

    let soft = classify(Abi::Arm32 { hard_float: false }, signature).expect("soft");
    assert_eq!(locations(&soft, 0), vec![Location::Gpr(0)]);
    assert_eq!(locations(&soft, 1), vec![Location::Gpr(2), Location::Gpr(3)]);
    assert_eq!(locations(&soft, 2), vec![Location::Stack(0)]);
}

#[test]
fn arm32_records_split_between_registers_and_stack() {
    let signature = SignatureBuilder::new(TypeDescriptor::void())
        .param(TypeDescriptor::int32())
        .param(TypeDescriptor::int32())
        .param(wide_record())
        .build()
        .expect("signature");
    let classified = classify(Abi::Arm32 { hard_float: false }, signature).expect("classify");
    assert_eq!(
        locations(&classified, 2),
        vec![Location::Gpr(2), Location::Gpr(3), Location::Stack(0)]
    );
    assert_eq!(classified.params[2].pieces[2].size, 12);
}

#[test]
fn arm64_hfa_and_large_record_placement() {
    let signature = SignatureBuilder::new(wide_record())
        .param(point_record())
        .param(wide_record())
        .build()
        .expect("signature");
    let classified = classify(Abi::Arm64 { apple: false }, signature).expect("classify");
    assert_eq!(
        locations(&classified, 0),
        vec![
            Location::Vec { index: 0, width: 8 },
            Location::Vec { index: 1, width: 8 }
        ]
    );
    assert!(classified.params[1].by_reference);
    assert_eq!(locations(&classified, 1), vec![Location::Gpr(0)]);
    assert_eq!(classified.ret.hidden, Some(Location::IndirectResult));
}

#[test]
fn apple_arm64_sends_variadic_arguments_to_the_stack() {
    let signature = SignatureBuilder::new(TypeDescriptor::int32())
        .param(TypeDescriptor::string())
        .variadic()
        .build()
        .expect("signature")
        .with_variadic_args(&[TypeDescriptor::int32(), TypeDescriptor::float64()])
        .expect("expand");

    let apple = classify(Abi::Arm64 { apple: true }, signature.clone()).expect("apple");
    assert_eq!(locations(&apple, 0), vec![Location::Gpr(0)]);
    assert_eq!(locations(&apple, 1), vec![Location::Stack(0)]);
    assert_eq!(locations(&apple, 2), vec![Location::Stack(8)]);

    let generic = classify(Abi::Arm64 { apple: false }, signature).expect("generic");
    assert_eq!(locations(&generic, 1), vec![Location::Gpr(1)]);
    assert_eq!(locations(&generic, 2), vec![Location::Vec { index: 0, width: 8 }]);
}

#[test]
fn riscv_mixed_records_use_one_gpr_and_one_fpr() {
    let record = TypeDescriptor::record(
        "Sample",
        vec![("count", TypeDescriptor::int32()), ("value", TypeDescriptor::float32())],
    )
    .expect("record");
    let signature = SignatureBuilder::new(TypeDescriptor::float32())
        .param(record)
        .build()
        .expect("signature");
    let classified = classify(Abi::RiscV64, signature).expect("classify");
    let class = &classified.params[0];
    assert!(class.gpr_first);
    assert_eq!(class.gpr_count, 1);
    assert_eq!(class.vector_count, 1);
    assert_eq!(class.pieces[1].extend, Extend::NanBox);
    assert_eq!(classified.ret.pieces[0].extend, Extend::NanBox);
}

#[test]
fn riscv32_splits_wide_integers_into_pairs() {
    let signature = SignatureBuilder::new(TypeDescriptor::int64())
        .param(TypeDescriptor::int32())
        .param(TypeDescriptor::int64())
        .build()
        .expect("signature");
    let classified = classify(Abi::RiscV32, signature).expect("classify");
    assert_eq!(locations(&classified, 1), vec![Location::Gpr(1), Location::Gpr(2)]);
    assert_eq!(
        classified.ret.pieces,
        vec![Piece::new(0, 4, Location::Gpr(0)), Piece::new(4, 4, Location::Gpr(1))]
    );
}

#[test]
fn pointer_width_must_match_the_abi() {
    let narrow = TypeDescriptor::pointer_for(4, None).expect("4-byte pointer");
    let signature = SignatureBuilder::new(TypeDescriptor::void())
        .param(narrow)
        .build()
        .expect("signature");
    assert!(classify(Abi::X86 { msvc: false }, signature.clone()).is_ok());
    let err = classify(Abi::X86_64SysV, signature).expect_err("width mismatch");
    assert!(matches!(err, BridgeError::UnsupportedSignature(_)));
}

#[test]
fn classification_is_deterministic() {
    let signature = SignatureBuilder::new(point_record())
        .param(point_record())
        .param(TypeDescriptor::float32())
        .param(wide_record())
        .build()
        .expect("signature");
    for abi in Abi::ALL {
        let first = classify(abi, signature.clone()).expect("first");
        let second = classify(abi, signature.clone()).expect("second");
        assert_eq!(first.params, second.params, "{abi}");
        assert_eq!(first.ret, second.ret, "{abi}");
        assert_eq!(first.stack_args_size % 16, 0, "{abi}");
    }
}

#[test]
fn x86_symbols_are_decorated() {
    let signature = SignatureBuilder::new(TypeDescriptor::void())
        .param(TypeDescriptor::int8())
        .param(TypeDescriptor::int64())
        .build()
        .expect("signature");
    let abi = Abi::X86 { msvc: true };
    assert_eq!(
        nbridge::decorate_symbol("Run", CallingConvention::Stdcall, &signature, abi),
        "_Run@12"
    );
}
