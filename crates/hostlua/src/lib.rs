// Host/script value bridge
// Exposes Rust records, sequences and maps to embedded Lua scripts as live
// foreign handles, and host functions as callable globals.

#[cfg(test)]
mod test;

extern crate self as hostlua;

pub mod bridge;
pub mod convert;
pub mod decode;
pub mod engine;
pub mod error;
pub mod exporter;
pub mod names;
pub mod options;
mod protocol;
pub mod reflect;
pub mod registry;
pub mod value;

pub use bridge::Bridge;
pub use convert::{FromHost, IntoHost};
pub use decode::TableDecoder;
pub use engine::{MULTRET, ScriptEngine};
pub use error::{BridgeError, BridgeResult};
pub use exporter::{CallFrame, FunctionGroup, HostFunction, HostModule, host_fn};
pub use names::{NameCache, NameMapping, NameResolver};
pub use options::{BridgeOptions, Stdlib};
pub use reflect::{
    Describe, FieldDescriptor, HostObject, Mapping, MethodDescriptor, MethodProvider, OpaqueValue,
    Record, ReferenceMode, Sequence, ShapeKind, TypeDescriptor,
};
pub use registry::{ObjectRegistry, PairStyle, RegisteredObject};
pub use value::{HostRef, HostValue, ScriptValue, Shared};

pub use hostlua_derive::{HostRecord, host_methods};
