#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArenaRegion {
    Stack,
    Heap,
}

impl ArenaRegion {
    pub fn name(self) -> &'static str {
        match self {
            ArenaRegion::Stack => "stack",
            ArenaRegion::Heap => "heap",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum BridgeError {
    ArgumentTypeMismatch {
        index: usize,
        expected: String,
        found: &'static str,
    },
    ArgumentCount {
        expected: usize,
        got: usize,
    },
    ArenaExhausted {
        region: ArenaRegion,
        requested: usize,
        available: usize,
    },
    ArenaScopeViolation,
    StaleCallbackInvocation {
        slot: usize,
    },
    UnsupportedSignature(String),
    TrampolinesExhausted {
        capacity: usize,
    },
    UnsupportedHost(String),
    Managed(String),
    Native(String),
}

impl BridgeError {
    pub(crate) fn mismatch(index: usize, expected: impl Into<String>, found: &'static str) -> Self {
        BridgeError::ArgumentTypeMismatch {
            index,
            expected: expected.into(),
            found,
        }
    }

    pub(crate) fn unsupported(message: impl Into<String>) -> Self {
        BridgeError::UnsupportedSignature(message.into())
    }
}

impl std::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeError::ArgumentTypeMismatch {
                index,
                expected,
                found,
            } => write!(
                f,
                "argument {index} type mismatch: expected {expected}, got {found}"
            ),
            BridgeError::ArgumentCount { expected, got } => {
                write!(f, "expected {expected} arguments, got {got}")
            }
            BridgeError::ArenaExhausted {
                region,
                requested,
                available,
            } => write!(
                f,
                "call arena {} region exhausted: requested {requested} bytes, {available} available",
                region.name()
            ),
            BridgeError::ArenaScopeViolation => {
                write!(f, "arena allocation through a scope that is not the innermost")
            }
            BridgeError::StaleCallbackInvocation { slot } => write!(
                f,
                "callback trampoline {slot} invoked after its owning call returned"
            ),
            BridgeError::UnsupportedSignature(message) => {
                write!(f, "unsupported signature: {message}")
            }
            BridgeError::TrampolinesExhausted { capacity } => {
                write!(f, "all {capacity} callback trampolines are in use")
            }
            BridgeError::UnsupportedHost(message) => write!(f, "unsupported host: {message}"),
            BridgeError::Managed(message) => write!(f, "managed callback error: {message}"),
            BridgeError::Native(message) => write!(f, "native code error: {message}"),
        }
    }
}

impl std::error::Error for BridgeError {}

pub type BridgeResult<T> = Result<T, BridgeError>;
