#![allow(dead_code, unused_imports)]

use std::ffi::c_char;
use std::sync::atomic::{AtomicUsize, Ordering};

pub use nbridge::{
    Abi, ArenaRegion, ArenaWatermark, Bridge, BridgeConfig, BridgeError, CallArena,
    CallingConvention, ClassifiedSignature, Direction, Location, ManagedCallable, PreparedCall,
    SignatureBuilder, SignatureDescriptor, TypeDescriptor, TypeKind, Value, classify,
};
pub use std::sync::Arc;

/// Bridge for the running host, or `None` where stubs cannot execute.
pub fn host_bridge() -> Option<Bridge> {
    host_bridge_with(BridgeConfig::default())
}

pub fn host_bridge_with(config: BridgeConfig) -> Option<Bridge> {
    if !nbridge::native::runtime_supported() {
        return None;
    }
    Some(Bridge::new(config).expect("bridge for a supported host"))
}

pub fn point_record() -> Arc<TypeDescriptor> {
    TypeDescriptor::record(
        "Point",
        vec![("x", TypeDescriptor::float64()), ("y", TypeDescriptor::float64())],
    )
    .expect("point record")
}

/// Five Int32 members: 20 bytes, passed in memory on x86-64 SysV.
pub fn wide_record() -> Arc<TypeDescriptor> {
    TypeDescriptor::record(
        "Wide",
        ["a", "b", "c", "d", "e"]
            .into_iter()
            .map(|name| (name, TypeDescriptor::int32()))
            .collect(),
    )
    .expect("wide record")
}

pub fn wide_value(seed: i64) -> Value {
    Value::record([
        ("a", Value::Int(seed)),
        ("b", Value::Int(seed + 1)),
        ("c", Value::Int(seed + 2)),
        ("d", Value::Int(seed + 3)),
        ("e", Value::Int(seed + 4)),
    ])
}

/// `Int32 (*)(Int32)`
pub fn unary_prototype() -> Arc<SignatureDescriptor> {
    SignatureBuilder::new(TypeDescriptor::int32())
        .param(TypeDescriptor::int32())
        .build()
        .expect("unary prototype")
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Wide {
    pub a: i32,
    pub b: i32,
    pub c: i32,
    pub d: i32,
    pub e: i32,
}

pub extern "C" fn add_i32(a: i32, b: i32) -> i32 {
    a.wrapping_add(b)
}

pub extern "C" fn negate_i8(value: i8) -> i8 {
    value.wrapping_neg()
}

pub extern "C" fn widen_u16(value: u16) -> u64 {
    u64::from(value) * 3
}

pub extern "C" fn mix_scalars(a: i8, b: u16, c: f32, d: f64, e: i64) -> f64 {
    f64::from(a) + f64::from(b) + f64::from(c) + d + e as f64
}

pub extern "C" fn half_f32(value: f32) -> f32 {
    value / 2.0
}

pub extern "C" fn is_odd(value: u32) -> bool {
    value % 2 == 1
}

pub extern "C" fn sum_ten(
    a: i64,
    b: i64,
    c: i64,
    d: i64,
    e: i64,
    f: i64,
    g: i64,
    h: i64,
    i: i64,
    j: i64,
) -> i64 {
    a + b + c + d + e + f + g + h + i + j
}

pub extern "C" fn sum_doubles(
    a: f64,
    b: f64,
    c: f64,
    d: f64,
    e: f64,
    f: f64,
    g: f64,
    h: f64,
    i: f64,
    j: f64,
) -> f64 {
    a + b + c + d + e + f + g + h + i + j
}

pub extern "C" fn point_scale(point: Point, factor: f64) -> Point {
    Point {
        x: point.x * factor,
        y: point.y * factor,
    }
}

pub extern "C" fn wide_sum(value: Wide) -> i64 {
    i64::from(value.a)
        + i64::from(value.b)
        + i64::from(value.c)
        + i64::from(value.d)
        + i64::from(value.e)
}

pub extern "C" fn wide_make(seed: i32) -> Wide {
    Wide {
        a: seed,
        b: seed + 1,
        c: seed + 2,
        d: seed + 3,
        e: seed + 4,
    }
}

pub extern "C" fn string_length(text: *const c_char) -> usize {
    if text.is_null() {
        return usize::MAX;
    }
    unsafe { std::ffi::CStr::from_ptr(text) }.to_bytes().len()
}

pub extern "C" fn echo_string(text: *const c_char) -> *const c_char {
    text
}

pub extern "C" fn wide_length(text: *const u16) -> usize {
    let mut len = 0;
    while unsafe { *text.add(len) } != 0 {
        len += 1;
    }
    len
}

pub extern "C" fn divide(a: i32, b: i32, remainder: *mut i32) -> i32 {
    unsafe { *remainder = a % b };
    a / b
}

pub extern "C" fn increment(counter: *mut i64) {
    unsafe { *counter += 1 };
}

pub extern "C" fn apply_twice(callback: extern "C" fn(i32) -> i32, value: i32) -> i32 {
    callback(callback(value))
}

pub extern "C" fn apply_point(callback: extern "C" fn(Point) -> Point, point: Point) -> f64 {
    let result = callback(point);
    result.x + result.y
}

pub extern "C" fn call_string_source(callback: extern "C" fn() -> *const c_char) -> usize {
    string_length(callback())
}

static STORED_CALLBACK: AtomicUsize = AtomicUsize::new(0);

pub extern "C" fn store_callback(callback: extern "C" fn(i32) -> i32) {
    STORED_CALLBACK.store(callback as usize, Ordering::SeqCst);
}

pub extern "C" fn invoke_stored(value: i32) -> i32 {
    let address = STORED_CALLBACK.load(Ordering::SeqCst);
    let callback: extern "C" fn(i32) -> i32 = unsafe { std::mem::transmute(address) };
    callback(value)
}
