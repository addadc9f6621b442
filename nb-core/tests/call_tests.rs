mod common;
use common::*;

fn size_type() -> Arc<TypeDescriptor> {
    if cfg!(target_pointer_width = "64") {
        TypeDescriptor::uint64()
    } else {
        TypeDescriptor::uint32()
    }
}

fn prepare(bridge: &Bridge, builder: SignatureBuilder) -> PreparedCall {
    bridge
        .prepare(builder.build().expect("signature"))
        .expect("prepare")
}

#[test]
fn integer_round_trips() {
    let Some(bridge) = host_bridge() else {
        return;
    };
    let add = prepare(
        &bridge,
        SignatureBuilder::new(TypeDescriptor::int32())
            .name("add_i32")
            .param(TypeDescriptor::int32())
            .param(TypeDescriptor::int32()),
    );
    let negate = prepare(
        &bridge,
        SignatureBuilder::new(TypeDescriptor::int8()).param(TypeDescriptor::int8()),
    );
    let widen = prepare(
        &bridge,
        SignatureBuilder::new(TypeDescriptor::uint64()).param(TypeDescriptor::uint16()),
    );
    let odd = prepare(
        &bridge,
        SignatureBuilder::new(TypeDescriptor::bool()).param(TypeDescriptor::uint32()),
    );

    unsafe {
        assert_eq!(
            bridge.call(&add, add_i32 as *const () as usize, &[Value::Int(2), Value::Int(40)]),
            Ok(Value::Int(42))
        );
        assert_eq!(
            bridge.call(&add, add_i32 as *const () as usize, &[Value::Int(-7), Value::Int(3)]),
            Ok(Value::Int(-4))
        );
        assert_eq!(
            bridge.call(&negate, negate_i8 as *const () as usize, &[Value::Int(5)]),
            Ok(Value::Int(-5))
        );
        assert_eq!(
            bridge.call(&widen, widen_u16 as *const () as usize, &[Value::UInt(65535)]),
            Ok(Value::UInt(196_605))
        );
        assert_eq!(
            bridge.call(&odd, is_odd as *const () as usize, &[Value::UInt(7)]),
            Ok(Value::Bool(true))
        );
        assert_eq!(
            bridge.call(&odd, is_odd as *const () as usize, &[Value::UInt(10)]),
            Ok(Value::Bool(false))
        );
    }
}

#[test]
fn mixed_scalars_keep_their_widths() {
    let Some(bridge) = host_bridge() else {
        return;
    };
    let mix = prepare(
        &bridge,
        SignatureBuilder::new(TypeDescriptor::float64())
            .param(TypeDescriptor::int8())
            .param(TypeDescriptor::uint16())
            .param(TypeDescriptor::float32())
            .param(TypeDescriptor::float64())
            .param(TypeDescriptor::int64()),
    );
    let half = prepare(
        &bridge,
        SignatureBuilder::new(TypeDescriptor::float32()).param(TypeDescriptor::float32()),
    );

    let args = [
        Value::Int(-3),
        Value::UInt(60_000),
        Value::Float(0.5),
        Value::Float(1.25),
        Value::Int(1 << 40),
    ];
    let expected = -3.0 + 60_000.0 + 0.5 + 1.25 + (1u64 << 40) as f64;
    unsafe {
        assert_eq!(
            bridge.call(&mix, mix_scalars as *const () as usize, &args),
            Ok(Value::Float(expected))
        );
        assert_eq!(
            bridge.call(&half, half_f32 as *const () as usize, &[Value::Float(3.0)]),
            Ok(Value::Float(1.5))
        );
    }
}

#[test]
fn arguments_beyond_the_registers_spill_to_the_stack() {
    let Some(bridge) = host_bridge() else {
        return;
    };
    let ints = prepare(
        &bridge,
        (0..10).fold(SignatureBuilder::new(TypeDescriptor::int64()), |builder, _| {
            builder.param(TypeDescriptor::int64())
        }),
    );
    let doubles = prepare(
        &bridge,
        (0..10).fold(SignatureBuilder::new(TypeDescriptor::float64()), |builder, _| {
            builder.param(TypeDescriptor::float64())
        }),
    );

    let int_args: Vec<Value> = (1..=10).map(Value::Int).collect();
    let double_args: Vec<Value> = (1..=10).map(|n| Value::Float(f64::from(n) * 0.5)).collect();
    unsafe {
        assert_eq!(
            bridge.call(&ints, sum_ten as *const () as usize, &int_args),
            Ok(Value::Int(55))
        );
        assert_eq!(
            bridge.call(&doubles, sum_doubles as *const () as usize, &double_args),
            Ok(Value::Float(27.5))
        );
    }
}

#[test]
fn records_pass_and_return_by_value() {
    let Some(bridge) = host_bridge() else {
        return;
    };
    let scale = prepare(
        &bridge,
        SignatureBuilder::new(point_record())
            .param(point_record())
            .param(TypeDescriptor::float64()),
    );
    let sum = prepare(
        &bridge,
        SignatureBuilder::new(TypeDescriptor::int64()).param(wide_record()),
    );
    let make = prepare(
        &bridge,
        SignatureBuilder::new(wide_record()).param(TypeDescriptor::int32()),
    );

    let point = Value::record([("x", Value::Float(1.5)), ("y", Value::Float(-2.0))]);
    unsafe {
        assert_eq!(
            bridge.call(&scale, point_scale as *const () as usize, &[point, Value::Float(2.0)]),
            Ok(Value::record([("x", Value::Float(3.0)), ("y", Value::Float(-4.0))]))
        );
        assert_eq!(
            bridge.call(&sum, wide_sum as *const () as usize, &[wide_value(10)]),
            Ok(Value::Int(60))
        );
        assert_eq!(
            bridge.call(&make, wide_make as *const () as usize, &[Value::Int(7)]),
            Ok(wide_value(7))
        );
    }
}

#[test]
fn strings_are_marshaled_both_ways() {
    let Some(bridge) = host_bridge() else {
        return;
    };
    let length = prepare(
        &bridge,
        SignatureBuilder::new(size_type()).param(TypeDescriptor::string()),
    );
    let echo = prepare(
        &bridge,
        SignatureBuilder::new(TypeDescriptor::string()).param(TypeDescriptor::string()),
    );
    let wide = prepare(
        &bridge,
        SignatureBuilder::new(size_type()).param(TypeDescriptor::wide_string()),
    );

    unsafe {
        assert_eq!(
            bridge.call(&length, string_length as *const () as usize, &[Value::string("hello")]),
            Ok(Value::UInt(5))
        );
        assert_eq!(
            bridge.call(&length, string_length as *const () as usize, &[Value::Null]),
            Ok(Value::UInt(usize::MAX as u64))
        );
        assert_eq!(
            bridge.call(&echo, echo_string as *const () as usize, &[Value::string("round trip")]),
            Ok(Value::string("round trip"))
        );
        assert_eq!(
            bridge.call(&wide, wide_length as *const () as usize, &[Value::wide_string("wïde")]),
            Ok(Value::UInt(4))
        );
    }
}

#[test]
fn long_strings_do_not_exhaust_the_arena() {
    let config = BridgeConfig {
        heap_size: 4096,
        heap_headroom: 1024,
        ..BridgeConfig::default()
    };
    let Some(bridge) = host_bridge_with(config) else {
        return;
    };
    let length = prepare(
        &bridge,
        SignatureBuilder::new(size_type()).param(TypeDescriptor::string()),
    );
    let text = "x".repeat(20_000);
    let result = unsafe { bridge.call(&length, string_length as *const () as usize, &[Value::string(text)]) };
    assert_eq!(result, Ok(Value::UInt(20_000)));
}

#[test]
fn out_and_inout_cells_are_written_back() {
    let Some(bridge) = host_bridge() else {
        return;
    };
    let int_ptr = TypeDescriptor::pointer(TypeDescriptor::int32());
    let divide_call = prepare(
        &bridge,
        SignatureBuilder::new(TypeDescriptor::int32())
            .param(TypeDescriptor::int32())
            .param(TypeDescriptor::int32())
            .param_with_direction(int_ptr, Direction::Out),
    );
    let counter_ptr = TypeDescriptor::pointer(TypeDescriptor::int64());
    let increment_call = prepare(
        &bridge,
        SignatureBuilder::new(TypeDescriptor::void())
            .param_with_direction(counter_ptr, Direction::InOut),
    );

    let remainder = Value::cell(Value::Null);
    let counter = Value::cell(Value::Int(41));
    unsafe {
        assert_eq!(
            bridge.call(
                &divide_call,
                divide as *const () as usize,
                &[Value::Int(17), Value::Int(5), remainder.clone()]
            ),
            Ok(Value::Int(3))
        );
        assert_eq!(
            bridge.call(&increment_call, increment as *const () as usize, &[counter.clone()]),
            Ok(Value::Null)
        );
    }
    assert_eq!(remainder.load(), Some(Value::Int(2)));
    assert_eq!(counter.load(), Some(Value::Int(42)));
}

#[cfg(unix)]
#[test]
fn variadic_calls_format_through_snprintf() {
    let Some(bridge) = host_bridge() else {
        return;
    };
    let snprintf = prepare(
        &bridge,
        SignatureBuilder::new(TypeDescriptor::int32())
            .name("snprintf")
            .convention(CallingConvention::Cdecl)
            .param(TypeDescriptor::opaque_pointer())
            .param(size_type())
            .param(TypeDescriptor::string())
            .variadic(),
    );
    let mut buffer = vec![0u8; 64];
    let fixed = [
        Value::Pointer(buffer.as_mut_ptr() as usize),
        Value::UInt(buffer.len() as u64),
        Value::string("%d-%s-%.2f-%c"),
    ];
    let extra = [
        (TypeDescriptor::int32(), Value::Int(42)),
        (TypeDescriptor::string(), Value::string("abc")),
        (TypeDescriptor::float32(), Value::Float(2.5)),
        (TypeDescriptor::int8(), Value::Int(i64::from(b'z'))),
    ];
    let written = unsafe { bridge.call_variadic(&snprintf, libc::snprintf as *const () as usize, &fixed, &extra) };
    assert_eq!(written, Ok(Value::Int(13)));
    assert_eq!(&buffer[..14], b"42-abc-2.50-z\0");
}

#[test]
fn failed_calls_leave_the_bridge_clean() {
    let Some(bridge) = host_bridge() else {
        return;
    };
    let add = prepare(
        &bridge,
        SignatureBuilder::new(TypeDescriptor::int32())
            .param(TypeDescriptor::int32())
            .param(TypeDescriptor::int32()),
    );
    let before = bridge.arena_watermark();

    let err = unsafe { bridge.call(&add, add_i32 as *const () as usize, &[Value::Int(1)]) };
    assert_eq!(err, Err(BridgeError::ArgumentCount { expected: 2, got: 1 }));
    let err = unsafe { bridge.call(&add, add_i32 as *const () as usize, &[Value::Int(1), Value::string("2")]) };
    assert!(matches!(err, Err(BridgeError::ArgumentTypeMismatch { index: 1, .. })));
    let err = unsafe { bridge.call(&add, 0, &[Value::Int(1), Value::Int(2)]) };
    assert!(matches!(err, Err(BridgeError::Native(_))));

    assert_eq!(bridge.arena_watermark(), before);
    assert_eq!(bridge.call_depth(), 0);
}

#[test]
fn repeated_calls_do_not_grow_the_arena() {
    let Some(bridge) = host_bridge() else {
        return;
    };
    let make = prepare(
        &bridge,
        SignatureBuilder::new(wide_record()).param(TypeDescriptor::int32()),
    );
    let length = prepare(
        &bridge,
        SignatureBuilder::new(size_type()).param(TypeDescriptor::string()),
    );
    let before = bridge.arena_watermark();
    for round in 0..100 {
        unsafe {
            bridge
                .call(&make, wide_make as *const () as usize, &[Value::Int(round)])
                .expect("wide_make");
            bridge
                .call(&length, string_length as *const () as usize, &[Value::string("abcdef")])
                .expect("string_length");
        }
    }
    assert_eq!(bridge.arena_watermark(), before);
}
