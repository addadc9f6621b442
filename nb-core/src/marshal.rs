use std::rc::Rc;
use std::sync::Arc;

use crate::error::{BridgeError, BridgeResult};
use crate::signature::{SignatureDescriptor, TypeDescriptor, TypeKind};
use crate::value::{ManagedCallable, Value};

/// Storage and trampoline services needed while encoding a value.
pub(crate) trait MarshalContext {
    /// Stable copy of `bytes`, returning its address.
    fn store(&self, bytes: &[u8], align: usize) -> BridgeResult<usize>;

    /// Like [`MarshalContext::store`] for NUL-terminated string images.
    fn store_string(&self, bytes: &[u8], align: usize) -> BridgeResult<usize> {
        self.store(bytes, align)
    }

    /// Native entry point bound to `callable` for the given prototype.
    fn bind_callback(
        &self,
        callable: &Rc<dyn ManagedCallable>,
        prototype: &Arc<SignatureDescriptor>,
    ) -> BridgeResult<usize>;
}

pub(crate) fn write_uint(out: &mut [u8], value: u64) {
    let bytes = value.to_le_bytes();
    let len = out.len().min(8);
    out[..len].copy_from_slice(&bytes[..len]);
}

pub(crate) fn read_uint(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let len = bytes.len().min(8);
    buf[..len].copy_from_slice(&bytes[..len]);
    u64::from_le_bytes(buf)
}

pub(crate) fn sign_extend(raw: u64, size: usize) -> i64 {
    if size >= 8 || size == 0 {
        return raw as i64;
    }
    let shift = 64 - size * 8;
    ((raw << shift) as i64) >> shift
}

/// Native image of a NUL-terminated string for `kind`.
pub(crate) fn string_image(kind: TypeKind, value: &Value) -> Option<(Vec<u8>, usize)> {
    match (kind, value) {
        (TypeKind::String, Value::String(text)) => {
            let mut bytes = Vec::with_capacity(text.len() + 1);
            bytes.extend_from_slice(text.as_bytes());
            bytes.push(0);
            Some((bytes, 1))
        }
        (TypeKind::WideString, Value::WideString(units)) => Some((wide_image(units.iter().copied()), 2)),
        (TypeKind::WideString, Value::String(text)) => Some((wide_image(text.encode_utf16()), 2)),
        _ => None,
    }
}

fn wide_image(units: impl Iterator<Item = u16>) -> Vec<u8> {
    let mut bytes: Vec<u8> = units.flat_map(u16::to_le_bytes).collect();
    bytes.extend_from_slice(&[0, 0]);
    bytes
}

/// Encode `value` as the native image of `ty` into `out` (`ty.size()` bytes).
pub(crate) fn encode_value(
    index: usize,
    ty: &TypeDescriptor,
    value: &Value,
    out: &mut [u8],
    ctx: &dyn MarshalContext,
) -> BridgeResult<()> {
    let kind = ty.kind();
    let mismatch = || BridgeError::mismatch(index, ty.describe(), value.kind_name());
    match kind {
        TypeKind::Void => Ok(()),
        TypeKind::Bool => match value {
            Value::Bool(flag) => {
                write_uint(out, u64::from(*flag));
                Ok(())
            }
            _ => Err(mismatch()),
        },
        _ if kind.is_integer() => {
            let raw = match value {
                Value::Int(number) => *number as u64,
                Value::UInt(number) => *number,
                _ => return Err(mismatch()),
            };
            write_uint(out, raw);
            Ok(())
        }
        TypeKind::Float32 | TypeKind::Float64 => {
            let number = match value {
                Value::Float(number) => *number,
                Value::Int(number) => *number as f64,
                Value::UInt(number) => *number as f64,
                _ => return Err(mismatch()),
            };
            if kind == TypeKind::Float32 {
                write_uint(out, u64::from((number as f32).to_bits()));
            } else {
                write_uint(out, number.to_bits());
            }
            Ok(())
        }
        TypeKind::String | TypeKind::WideString => {
            let address = match value {
                Value::Null => 0,
                Value::Pointer(address) => *address,
                _ => {
                    let (image, align) = string_image(kind, value).ok_or_else(mismatch)?;
                    ctx.store_string(&image, align)?
                }
            };
            write_uint(out, address as u64);
            Ok(())
        }
        TypeKind::Pointer => {
            let address = match value {
                Value::Null => 0,
                Value::Pointer(address) => *address,
                Value::Ref(cell) => {
                    let pointee = ty.pointee().ok_or_else(mismatch)?;
                    let contents = cell.borrow().clone();
                    store_encoded(index, pointee, &contents, ctx)?
                }
                Value::Record(_) | Value::Array(_) => {
                    let pointee = ty.pointee().ok_or_else(mismatch)?;
                    store_encoded(index, pointee, value, ctx)?
                }
                _ => return Err(mismatch()),
            };
            write_uint(out, address as u64);
            Ok(())
        }
        TypeKind::Callback => {
            let address = match value {
                Value::Null => 0,
                Value::Pointer(address) => *address,
                Value::Callable(callable) => {
                    let prototype = ty.prototype().ok_or_else(mismatch)?;
                    ctx.bind_callback(callable, prototype)?
                }
                _ => return Err(mismatch()),
            };
            write_uint(out, address as u64);
            Ok(())
        }
        TypeKind::Record => {
            let Value::Record(fields) = value else {
                return Err(mismatch());
            };
            for member in ty.members() {
                let field = fields
                    .iter()
                    .find(|(name, _)| *name == member.name)
                    .map(|(_, field)| field)
                    .ok_or_else(|| {
                        BridgeError::mismatch(
                            index,
                            format!("{} member '{}'", ty.describe(), member.name),
                            "missing field",
                        )
                    })?;
                let end = member.offset + member.ty.size();
                encode_value(index, &member.ty, field, &mut out[member.offset..end], ctx)?;
            }
            Ok(())
        }
        TypeKind::Array => {
            let Some((element, len)) = ty.element() else {
                return Err(mismatch());
            };
            let Value::Array(items) = value else {
                return Err(mismatch());
            };
            if items.len() != len {
                return Err(BridgeError::mismatch(
                    index,
                    ty.describe(),
                    "array of a different length",
                ));
            }
            let stride = element.size();
            for (position, item) in items.iter().enumerate() {
                let start = position * stride;
                encode_value(index, element, item, &mut out[start..start + stride], ctx)?;
            }
            Ok(())
        }
        _ => Err(mismatch()),
    }
}

fn store_encoded(
    index: usize,
    ty: &TypeDescriptor,
    value: &Value,
    ctx: &dyn MarshalContext,
) -> BridgeResult<usize> {
    let mut image = vec![0u8; ty.size()];
    encode_value(index, ty, value, &mut image, ctx)?;
    ctx.store(&image, ty.align())
}

/// Convert the native image `bytes` of `ty` into a managed value. With
/// `dispose` set, pointer-like values are handed to the type's dispose hook
/// once converted.
pub(crate) fn decode_value(ty: &TypeDescriptor, bytes: &[u8], dispose: bool) -> Value {
    let kind = ty.kind();
    let raw = read_uint(&bytes[..ty.size().min(bytes.len())]);
    let value = match kind {
        TypeKind::Void => Value::Null,
        TypeKind::Bool => Value::Bool(raw & 0xff != 0),
        _ if kind.is_signed() => Value::Int(sign_extend(raw, ty.size())),
        _ if kind.is_integer() => Value::UInt(raw),
        TypeKind::Float32 => Value::Float(f64::from(f32::from_bits(raw as u32))),
        TypeKind::Float64 => Value::Float(f64::from_bits(raw)),
        TypeKind::String if raw != 0 => Value::String(unsafe { read_c_string(raw as usize) }),
        TypeKind::WideString if raw != 0 => Value::WideString(unsafe { read_wide_string(raw as usize) }),
        TypeKind::Pointer | TypeKind::Callback if raw != 0 => Value::Pointer(raw as usize),
        TypeKind::String | TypeKind::WideString | TypeKind::Pointer | TypeKind::Callback => {
            Value::Null
        }
        TypeKind::Record => Value::Record(
            ty.members()
                .iter()
                .map(|member| {
                    let end = member.offset + member.ty.size();
                    (
                        member.name.clone(),
                        decode_value(&member.ty, &bytes[member.offset..end], dispose),
                    )
                })
                .collect(),
        ),
        TypeKind::Array => match ty.element() {
            Some((element, len)) => Value::Array(
                (0..len)
                    .map(|position| {
                        let start = position * element.size();
                        decode_value(element, &bytes[start..start + element.size()], dispose)
                    })
                    .collect(),
            ),
            None => Value::Null,
        },
        _ => Value::Null,
    };

    if dispose && kind.is_pointer_like() && raw != 0 {
        if let Some(hook) = ty.dispose() {
            hook(raw as usize);
        }
    }
    value
}

/// Read the native image of `ty` stored at `address`.
///
/// # Safety
/// `address` must point to `ty.size()` readable bytes.
pub(crate) unsafe fn read_image(address: usize, size: usize) -> Vec<u8> {
    unsafe { std::slice::from_raw_parts(address as *const u8, size) }.to_vec()
}

unsafe fn read_c_string(address: usize) -> String {
    let text = unsafe { std::ffi::CStr::from_ptr(address as *const std::ffi::c_char) };
    text.to_string_lossy().into_owned()
}

unsafe fn read_wide_string(address: usize) -> Vec<u16> {
    let start = address as *const u16;
    let mut units = Vec::new();
    let mut cursor = 0usize;
    loop {
        let unit = unsafe { start.add(cursor).read_unaligned() };
        if unit == 0 {
            break;
        }
        units.push(unit);
        cursor += 1;
    }
    units
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct OwnedScratch {
        buffers: RefCell<Vec<Box<[u8]>>>,
    }

    impl MarshalContext for OwnedScratch {
        fn store(&self, bytes: &[u8], _align: usize) -> BridgeResult<usize> {
            let buffer: Box<[u8]> = bytes.into();
            let address = buffer.as_ptr() as usize;
            self.buffers.borrow_mut().push(buffer);
            Ok(address)
        }

        fn bind_callback(
            &self,
            _callable: &Rc<dyn ManagedCallable>,
            _prototype: &Arc<SignatureDescriptor>,
        ) -> BridgeResult<usize> {
            Err(BridgeError::Native("no trampolines in this test".to_string()))
        }
    }

    #[test]
    fn record_members_land_at_their_offsets() {
        let record = TypeDescriptor::record(
            "Pair",
            vec![("tag", TypeDescriptor::int8()), ("value", TypeDescriptor::int32())],
        )
        .expect("record");
        let value = Value::record([("tag", Value::Int(-1)), ("value", Value::Int(258))]);
        let mut image = vec![0u8; record.size()];
        encode_value(0, &record, &value, &mut image, &OwnedScratch::default()).expect("encode");
        assert_eq!(image, vec![0xff, 0, 0, 0, 2, 1, 0, 0]);
        assert_eq!(decode_value(&record, &image, false), value);
    }

    #[test]
    fn strings_are_nul_terminated_copies() {
        let scratch = OwnedScratch::default();
        let ty = TypeDescriptor::string();
        let mut image = vec![0u8; ty.size()];
        encode_value(0, &ty, &Value::string("hello"), &mut image, &scratch).expect("encode");
        assert_eq!(decode_value(&ty, &image, false), Value::string("hello"));
        let stored = scratch.buffers.borrow();
        assert_eq!(&stored[0][..], b"hello\0");
    }

    #[test]
    fn wrong_kind_reports_argument_index() {
        let ty = TypeDescriptor::int32();
        let mut image = vec![0u8; 4];
        let err = encode_value(3, &ty, &Value::string("x"), &mut image, &OwnedScratch::default())
            .expect_err("string for int must fail");
        assert_eq!(
            err,
            BridgeError::ArgumentTypeMismatch {
                index: 3,
                expected: "Int32".to_string(),
                found: "string",
            }
        );
    }

    #[test]
    fn missing_record_member_is_a_mismatch() {
        let record = TypeDescriptor::record("One", vec![("a", TypeDescriptor::int32())])
            .expect("record");
        let mut image = vec![0u8; 4];
        let err = encode_value(
            0,
            &record,
            &Value::record([("b", Value::Int(1))]),
            &mut image,
            &OwnedScratch::default(),
        )
        .expect_err("missing member");
        assert!(matches!(err, BridgeError::ArgumentTypeMismatch { .. }));
    }

    #[test]
    fn dispose_hook_sees_the_native_address() {
        let seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let hook_seen = seen.clone();
        let ty = TypeDescriptor::with_dispose(
            &TypeDescriptor::opaque_pointer(),
            Arc::new(move |address| {
                hook_seen.store(address, std::sync::atomic::Ordering::SeqCst);
            }),
        );
        let image = 0x1234usize.to_le_bytes();
        assert_eq!(decode_value(&ty, &image, true), Value::Pointer(0x1234));
        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 0x1234);
    }
}
