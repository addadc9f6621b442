//! Cross-architecture native call bridge.
//!
//! A [`SignatureDescriptor`] is classified for an [`Abi`] into register and
//! stack placements. A [`Bridge`] marshals managed [`Value`]s into a call
//! frame following that classification, runs the native function through a
//! small machine-code invoker and converts the raw result back. Managed
//! callables passed as `Callback` arguments are exposed to native code
//! through trampolines that re-enter the bridge.

pub mod abi;
pub mod arena;
pub mod bridge;
pub mod config;
pub mod error;
pub mod frame;
mod marshal;
pub mod native;
mod result;
pub mod signature;
pub mod trampoline;
pub mod value;

pub use abi::{Abi, ArgClass, ClassifiedSignature, Location, Piece, ReturnClass, classify, decorate_symbol};
pub use arena::{ArenaWatermark, CallArena};
pub use bridge::{Bridge, PreparedCall};
pub use config::BridgeConfig;
pub use error::{ArenaRegion, BridgeError, BridgeResult};
pub use signature::{
    CallingConvention, Direction, SignatureBuilder, SignatureDescriptor, TypeDescriptor, TypeKind,
};
pub use value::{ManagedCallable, Value};
