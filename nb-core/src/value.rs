use std::cell::RefCell;
use std::rc::Rc;

use crate::bridge::Bridge;
use crate::error::BridgeResult;

/// Managed function exposed to native code through a callback trampoline.
pub trait ManagedCallable {
    fn call(&self, bridge: &Bridge, args: &[Value]) -> BridgeResult<Value>;
}

impl<F> ManagedCallable for F
where
    F: Fn(&Bridge, &[Value]) -> BridgeResult<Value>,
{
    fn call(&self, bridge: &Bridge, args: &[Value]) -> BridgeResult<Value> {
        self(bridge, args)
    }
}

#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    WideString(Vec<u16>),
    Pointer(usize),
    Record(Vec<(String, Value)>),
    Array(Vec<Value>),
    Ref(Rc<RefCell<Value>>),
    Callable(Rc<dyn ManagedCallable>),
}

impl Value {
    pub fn string(text: impl Into<String>) -> Self {
        Value::String(text.into())
    }

    pub fn wide_string(text: &str) -> Self {
        Value::WideString(text.encode_utf16().collect())
    }

    pub fn record<'a>(fields: impl IntoIterator<Item = (&'a str, Value)>) -> Self {
        Value::Record(
            fields
                .into_iter()
                .map(|(name, value)| (name.to_string(), value))
                .collect(),
        )
    }

    /// Shared cell for Out/InOut pointer parameters.
    pub fn cell(initial: Value) -> Self {
        Value::Ref(Rc::new(RefCell::new(initial)))
    }

    pub fn callable<F>(callable: F) -> Self
    where
        F: Fn(&Bridge, &[Value]) -> BridgeResult<Value> + 'static,
    {
        Value::Callable(Rc::new(callable))
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::UInt(_) => "uint",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::WideString(_) => "wide string",
            Value::Pointer(_) => "pointer",
            Value::Record(_) => "record",
            Value::Array(_) => "array",
            Value::Ref(_) => "ref",
            Value::Callable(_) => "callable",
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            Value::UInt(value) => i64::try_from(*value).ok(),
            Value::Bool(value) => Some(i64::from(*value)),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(value) => Some(*value),
            Value::Int(value) => u64::try_from(*value).ok(),
            Value::Bool(value) => Some(u64::from(*value)),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(text) => Some(text),
            _ => None,
        }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Record(fields) => fields
                .iter()
                .find(|(field, _)| field == name)
                .map(|(_, value)| value),
            _ => None,
        }
    }

    /// Current contents of a `Ref` cell.
    pub fn load(&self) -> Option<Value> {
        match self {
            Value::Ref(cell) => Some(cell.borrow().clone()),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(value) => write!(f, "Bool({value})"),
            Value::Int(value) => write!(f, "Int({value})"),
            Value::UInt(value) => write!(f, "UInt({value})"),
            Value::Float(value) => write!(f, "Float({value})"),
            Value::String(text) => write!(f, "String({text:?})"),
            Value::WideString(units) => {
                write!(f, "WideString({:?})", String::from_utf16_lossy(units))
            }
            Value::Pointer(address) => write!(f, "Pointer({address:#x})"),
            Value::Record(fields) => f.debug_map().entries(fields.iter().map(|(k, v)| (k, v))).finish(),
            Value::Array(items) => f.debug_list().entries(items).finish(),
            Value::Ref(cell) => write!(f, "Ref({:?})", cell.borrow()),
            Value::Callable(callable) => {
                write!(f, "Callable({:p})", Rc::as_ptr(callable) as *const ())
            }
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::UInt(a), Value::UInt(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::WideString(a), Value::WideString(b)) => a == b,
            (Value::Pointer(a), Value::Pointer(b)) => a == b,
            (Value::Record(a), Value::Record(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Ref(a), Value::Ref(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Value::Callable(a), Value::Callable(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::UInt(u64::from(value))
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::UInt(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}
