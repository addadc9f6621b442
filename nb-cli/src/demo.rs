use nbridge::{
    Bridge, BridgeConfig, BridgeError, BridgeResult, SignatureBuilder, TypeDescriptor, Value,
};
use tracing::{info, warn};

use crate::logging;

#[repr(C)]
struct Extent {
    width: f64,
    height: f64,
}

extern "C" fn extent_area(extent: Extent, scale: f64) -> f64 {
    extent.width * extent.height * scale
}

extern "C" fn apply_to_range(callback: extern "C" fn(i32) -> i32, count: i32) -> i32 {
    (0..count).map(|n| callback(n)).sum()
}

struct DemoCase {
    name: &'static str,
    run: fn(&Bridge) -> BridgeResult<(Value, Value)>,
}

const CASES: &[DemoCase] = &[
    DemoCase {
        name: "record by value",
        run: record_by_value,
    },
    DemoCase {
        name: "managed callback",
        run: managed_callback,
    },
    #[cfg(unix)]
    DemoCase {
        name: "libc strlen",
        run: libc_cases::strlen,
    },
    #[cfg(unix)]
    DemoCase {
        name: "libc abs",
        run: libc_cases::abs,
    },
    #[cfg(unix)]
    DemoCase {
        name: "libc snprintf (variadic)",
        run: libc_cases::snprintf,
    },
    #[cfg(unix)]
    DemoCase {
        name: "libc qsort (callback)",
        run: libc_cases::qsort,
    },
];

/// Run every self-test against the host ABI, returning the failure count.
pub fn run(config: BridgeConfig) -> Result<usize, BridgeError> {
    if !nbridge::native::runtime_supported() {
        return Err(BridgeError::UnsupportedHost(format!(
            "stubs cannot execute on {}",
            std::env::consts::ARCH
        )));
    }
    let bridge = Bridge::new(config)?;
    info!(abi = %bridge.abi(), cases = CASES.len(), "running host self-test");

    let mut failures = 0usize;
    for case in CASES {
        let before = bridge.arena_watermark();
        let outcome = (case.run)(&bridge);
        let clean = bridge.arena_watermark() == before && bridge.live_trampolines() == 0;
        let passed = match &outcome {
            Ok((got, expected)) => got == expected && clean,
            Err(_) => false,
        };
        let detail = match &outcome {
            Ok((got, _)) => format!("{got:?}"),
            Err(err) => err.to_string(),
        };
        println!(
            "{} {:<28} {} {detail}",
            logging::category_demo(),
            case.name,
            logging::outcome_label(passed)
        );
        if !passed {
            failures += 1;
            warn!(case = case.name, clean, "self-test case failed");
        }
    }
    Ok(failures)
}

fn record_by_value(bridge: &Bridge) -> BridgeResult<(Value, Value)> {
    let extent = TypeDescriptor::record(
        "Extent",
        vec![
            ("width", TypeDescriptor::float64()),
            ("height", TypeDescriptor::float64()),
        ],
    )?;
    let prepared = bridge.prepare(
        SignatureBuilder::new(TypeDescriptor::float64())
            .name("extent_area")
            .param(extent)
            .param(TypeDescriptor::float64())
            .build()?,
    )?;
    let value = Value::record([("width", Value::Float(3.0)), ("height", Value::Float(4.5))]);
    let got = unsafe { bridge.call(&prepared, extent_area as *const () as usize, &[value, Value::Float(2.0)])? };
    Ok((got, Value::Float(27.0)))
}

fn managed_callback(bridge: &Bridge) -> BridgeResult<(Value, Value)> {
    let prototype = SignatureBuilder::new(TypeDescriptor::int32())
        .param(TypeDescriptor::int32())
        .build()?;
    let prepared = bridge.prepare(
        SignatureBuilder::new(TypeDescriptor::int32())
            .name("apply_to_range")
            .param(TypeDescriptor::callback(prototype)?)
            .param(TypeDescriptor::int32())
            .build()?,
    )?;
    let square = Value::callable(|_bridge, args| {
        let value = args.first().and_then(Value::as_i64).unwrap_or_default();
        Ok(Value::Int(value * value))
    });
    let got = unsafe { bridge.call(&prepared, apply_to_range as *const () as usize, &[square, Value::Int(5)])? };
    Ok((got, Value::Int(30)))
}

#[cfg(unix)]
mod libc_cases {
    use std::cell::Cell;
    use std::rc::Rc;
    use std::sync::Arc;

    use super::*;

    fn size_type() -> Arc<TypeDescriptor> {
        if cfg!(target_pointer_width = "64") {
            TypeDescriptor::uint64()
        } else {
            TypeDescriptor::uint32()
        }
    }

    pub(super) fn strlen(bridge: &Bridge) -> BridgeResult<(Value, Value)> {
        let prepared = bridge.prepare(
            SignatureBuilder::new(size_type())
                .name("strlen")
                .param(TypeDescriptor::string())
                .build()?,
        )?;
        let text = Value::string("native bridge");
        let got = unsafe { bridge.call(&prepared, libc::strlen as usize, &[text])? };
        Ok((got, Value::UInt(13)))
    }

    pub(super) fn abs(bridge: &Bridge) -> BridgeResult<(Value, Value)> {
        let prepared = bridge.prepare(
            SignatureBuilder::new(TypeDescriptor::int32())
                .name("abs")
                .param(TypeDescriptor::int32())
                .build()?,
        )?;
        let got = unsafe { bridge.call(&prepared, libc::abs as *const () as usize, &[Value::Int(-1234)])? };
        Ok((got, Value::Int(1234)))
    }

    pub(super) fn snprintf(bridge: &Bridge) -> BridgeResult<(Value, Value)> {
        let prepared = bridge.prepare(
            SignatureBuilder::new(TypeDescriptor::int32())
                .name("snprintf")
                .param(TypeDescriptor::opaque_pointer())
                .param(size_type())
                .param(TypeDescriptor::string())
                .variadic()
                .build()?,
        )?;
        let mut buffer = vec![0u8; 64];
        let fixed = [
            Value::Pointer(buffer.as_mut_ptr() as usize),
            Value::UInt(buffer.len() as u64),
            Value::string("%s=%d (%.1f)"),
        ];
        let extra = [
            (TypeDescriptor::string(), Value::string("answer")),
            (TypeDescriptor::int32(), Value::Int(42)),
            (TypeDescriptor::float64(), Value::Float(0.5)),
        ];
        let written =
            unsafe { bridge.call_variadic(&prepared, libc::snprintf as *const () as usize, &fixed, &extra)? };
        let len = written.as_i64().unwrap_or_default().clamp(0, 63) as usize;
        let text = String::from_utf8_lossy(&buffer[..len]).into_owned();
        Ok((Value::String(text), Value::string("answer=42 (0.5)")))
    }

    pub(super) fn qsort(bridge: &Bridge) -> BridgeResult<(Value, Value)> {
        let comparator = SignatureBuilder::new(TypeDescriptor::int32())
            .param(TypeDescriptor::opaque_pointer())
            .param(TypeDescriptor::opaque_pointer())
            .build()?;
        let prepared = bridge.prepare(
            SignatureBuilder::new(TypeDescriptor::void())
                .name("qsort")
                .param(TypeDescriptor::opaque_pointer())
                .param(size_type())
                .param(size_type())
                .param(TypeDescriptor::callback(comparator)?)
                .build()?,
        )?;
        let comparisons = Rc::new(Cell::new(0u32));
        let counter = comparisons.clone();
        let compare = Value::callable(move |_bridge, args| {
            counter.set(counter.get() + 1);
            let read = |value: Option<&Value>| match value {
                Some(Value::Pointer(address)) => unsafe { *(*address as *const i32) },
                _ => 0,
            };
            let ordering = read(args.first()).cmp(&read(args.get(1)));
            Ok(Value::Int(ordering as i64))
        });

        let mut numbers = vec![9i32, -4, 17, 0, 3];
        let args = [
            Value::Pointer(numbers.as_mut_ptr() as usize),
            Value::UInt(numbers.len() as u64),
            Value::UInt(std::mem::size_of::<i32>() as u64),
            compare,
        ];
        unsafe { bridge.call(&prepared, libc::qsort as *const () as usize, &args)? };
        info!(comparisons = comparisons.get(), "qsort finished");
        let sorted = numbers.iter().map(|n| Value::Int(i64::from(*n))).collect();
        let expected = [-4, 0, 3, 9, 17].into_iter().map(Value::Int).collect();
        Ok((Value::Array(sorted), Value::Array(expected)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_self_test_case_passes_on_the_host() {
        if !nbridge::native::runtime_supported() {
            return;
        }
        let failures = run(BridgeConfig::default()).expect("bridge should start");
        assert_eq!(failures, 0);
    }
}
