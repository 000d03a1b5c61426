// Conversions between Rust values, bridge values and interpreter values.
//
// `IntoHost` / `FromHost` move between concrete Rust types and the tagged
// `HostValue`; the functions at the bottom move between `HostValue` and the
// interpreter's own `mlua::Value`, registering composites in the object
// registry on the way in and resolving foreign handles on the way out.

use std::collections::{BTreeMap, HashMap};
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;

use mlua::{Lua, Value};
use smol_str::SmolStr;

use crate::error::{BridgeError, BridgeResult};
use crate::exporter::HostFunction;
use crate::protocol::{self, BridgeContext};
use crate::reflect::{HostObject, OpaqueValue};
use crate::registry::Payload;
use crate::value::{HostRef, HostValue, ScriptValue, Shared};

pub trait IntoHost {
    fn into_host(self) -> HostValue;

    /// The live composite behind this value, when a record field of this
    /// type should be reached in place rather than copied.
    fn as_host_object(&self) -> Option<&dyn HostObject> {
        None
    }

    fn as_host_object_mut(&mut self) -> Option<&mut dyn HostObject> {
        None
    }
}

pub trait FromHost: Sized {
    fn from_host(value: HostValue) -> BridgeResult<Self>;
}

// ==================== Numbers ====================

fn parse_number(s: &str) -> Option<HostValue> {
    let s = s.trim();
    if let Ok(i) = s.parse::<i64>() {
        return Some(HostValue::Int(i));
    }
    s.parse::<f64>().ok().map(HostValue::Float)
}

macro_rules! impl_signed {
    ($($t:ty),*) => {$(
        impl IntoHost for $t {
            fn into_host(self) -> HostValue {
                HostValue::Int(self as i64)
            }
        }

        impl FromHost for $t {
            fn from_host(value: HostValue) -> BridgeResult<Self> {
                match value {
                    HostValue::Int(i) => Ok(i as $t),
                    HostValue::UInt(u) => Ok(u as $t),
                    HostValue::Float(f) => Ok(f as $t),
                    HostValue::Str(ref s) => match parse_number(s) {
                        Some(n) => <$t>::from_host(n),
                        None => Err(BridgeError::type_mismatch(stringify!($t), "string")),
                    },
                    other => Err(BridgeError::type_mismatch(stringify!($t), other.type_name())),
                }
            }
        }
    )*};
}

macro_rules! impl_unsigned {
    ($($t:ty),*) => {$(
        impl IntoHost for $t {
            fn into_host(self) -> HostValue {
                HostValue::UInt(self as u64)
            }
        }

        impl FromHost for $t {
            fn from_host(value: HostValue) -> BridgeResult<Self> {
                match value {
                    HostValue::Int(i) => Ok(i as $t),
                    HostValue::UInt(u) => Ok(u as $t),
                    HostValue::Float(f) => Ok(f as $t),
                    HostValue::Str(ref s) => match parse_number(s) {
                        Some(n) => <$t>::from_host(n),
                        None => Err(BridgeError::type_mismatch(stringify!($t), "string")),
                    },
                    other => Err(BridgeError::type_mismatch(stringify!($t), other.type_name())),
                }
            }
        }
    )*};
}

impl_signed!(i8, i16, i32, i64, isize);
impl_unsigned!(u8, u16, u32, u64, usize);

macro_rules! impl_float {
    ($($t:ty),*) => {$(
        impl IntoHost for $t {
            fn into_host(self) -> HostValue {
                HostValue::Float(self as f64)
            }
        }

        impl FromHost for $t {
            fn from_host(value: HostValue) -> BridgeResult<Self> {
                match value {
                    HostValue::Int(i) => Ok(i as $t),
                    HostValue::UInt(u) => Ok(u as $t),
                    HostValue::Float(f) => Ok(f as $t),
                    HostValue::Str(ref s) => match parse_number(s) {
                        Some(n) => <$t>::from_host(n),
                        None => Err(BridgeError::type_mismatch(stringify!($t), "string")),
                    },
                    other => Err(BridgeError::type_mismatch(stringify!($t), other.type_name())),
                }
            }
        }
    )*};
}

impl_float!(f32, f64);

// ==================== Booleans and strings ====================

impl IntoHost for bool {
    fn into_host(self) -> HostValue {
        HostValue::Bool(self)
    }
}

/// Script truthiness: only nil and false are false.
impl FromHost for bool {
    fn from_host(value: HostValue) -> BridgeResult<Self> {
        Ok(match value {
            HostValue::Nil => false,
            HostValue::Bool(b) => b,
            _ => true,
        })
    }
}

impl IntoHost for String {
    fn into_host(self) -> HostValue {
        HostValue::Str(self)
    }
}

impl IntoHost for &str {
    fn into_host(self) -> HostValue {
        HostValue::Str(self.to_owned())
    }
}

impl IntoHost for SmolStr {
    fn into_host(self) -> HostValue {
        HostValue::Str(self.to_string())
    }
}

/// Numbers are formatted the way the interpreter prints them; nil is "".
impl FromHost for String {
    fn from_host(value: HostValue) -> BridgeResult<Self> {
        match value {
            HostValue::Nil => Ok(String::new()),
            HostValue::Str(s) => Ok(s),
            HostValue::Int(i) => Ok(i.to_string()),
            HostValue::UInt(u) => Ok(u.to_string()),
            HostValue::Float(f) => Ok(format_float(f)),
            other => Err(BridgeError::type_mismatch("string", other.type_name())),
        }
    }
}

impl FromHost for SmolStr {
    fn from_host(value: HostValue) -> BridgeResult<Self> {
        String::from_host(value).map(SmolStr::from)
    }
}

pub(crate) fn format_float(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 {
        format!("{f:.1}")
    } else {
        f.to_string()
    }
}

// ==================== Options and bridge values ====================

impl<T: IntoHost> IntoHost for Option<T> {
    fn into_host(self) -> HostValue {
        match self {
            Some(value) => value.into_host(),
            None => HostValue::Nil,
        }
    }
}

impl<T: FromHost> FromHost for Option<T> {
    fn from_host(value: HostValue) -> BridgeResult<Self> {
        match value {
            HostValue::Nil => Ok(None),
            other => T::from_host(other).map(Some),
        }
    }
}

impl IntoHost for () {
    fn into_host(self) -> HostValue {
        HostValue::Nil
    }
}

impl IntoHost for HostValue {
    fn into_host(self) -> HostValue {
        self
    }
}

impl FromHost for HostValue {
    fn from_host(value: HostValue) -> BridgeResult<Self> {
        Ok(value)
    }
}

impl IntoHost for HostRef {
    fn into_host(self) -> HostValue {
        HostValue::Object(self)
    }
}

impl FromHost for HostRef {
    fn from_host(value: HostValue) -> BridgeResult<Self> {
        match value {
            HostValue::Object(obj) => Ok(obj),
            other => Err(BridgeError::type_mismatch("host object", other.type_name())),
        }
    }
}

impl IntoHost for Arc<dyn HostFunction> {
    fn into_host(self) -> HostValue {
        HostValue::Function(self)
    }
}

impl FromHost for Arc<dyn HostFunction> {
    fn from_host(value: HostValue) -> BridgeResult<Self> {
        match value {
            HostValue::Function(func) => Ok(func),
            other => Err(BridgeError::type_mismatch("function", other.type_name())),
        }
    }
}

// ==================== Composites ====================

impl<T: HostObject> IntoHost for Shared<T> {
    fn into_host(self) -> HostValue {
        HostValue::Object(self.to_host_ref())
    }
}

/// Satisfied by the registered payload itself, never by a copy.
impl<T: HostObject> FromHost for Shared<T> {
    fn from_host(value: HostValue) -> BridgeResult<Self> {
        match value {
            HostValue::Object(obj) => obj
                .downcast::<T>()
                .ok_or_else(|| BridgeError::type_mismatch(std::any::type_name::<T>(), obj.type_name())),
            other => Err(BridgeError::type_mismatch(std::any::type_name::<T>(), other.type_name())),
        }
    }
}

impl<T: Send + 'static> IntoHost for OpaqueValue<T> {
    fn into_host(self) -> HostValue {
        HostValue::Object(HostRef::by_value(self))
    }
}

/// Copy a registered composite back out by value.
fn clone_out<T: HostObject + Clone>(value: HostValue) -> BridgeResult<T> {
    let shared = Shared::<T>::from_host(value)?;
    let copy = shared.lock().clone();
    Ok(copy)
}

impl<T> IntoHost for Vec<T>
where
    T: IntoHost + FromHost + Clone + Send + 'static,
{
    fn into_host(self) -> HostValue {
        HostValue::Object(HostRef::by_value(self))
    }

    fn as_host_object(&self) -> Option<&dyn HostObject> {
        Some(self)
    }

    fn as_host_object_mut(&mut self) -> Option<&mut dyn HostObject> {
        Some(self)
    }
}

impl<T> FromHost for Vec<T>
where
    T: IntoHost + FromHost + Clone + Send + 'static,
{
    fn from_host(value: HostValue) -> BridgeResult<Self> {
        clone_out(value)
    }
}

impl<K, V, S> IntoHost for HashMap<K, V, S>
where
    K: IntoHost + FromHost + Clone + Eq + Hash + Send + 'static,
    V: IntoHost + FromHost + Clone + Send + 'static,
    S: BuildHasher + Send + 'static,
{
    fn into_host(self) -> HostValue {
        HostValue::Object(HostRef::by_value(self))
    }

    fn as_host_object(&self) -> Option<&dyn HostObject> {
        Some(self)
    }

    fn as_host_object_mut(&mut self) -> Option<&mut dyn HostObject> {
        Some(self)
    }
}

impl<K, V, S> FromHost for HashMap<K, V, S>
where
    K: IntoHost + FromHost + Clone + Eq + Hash + Send + 'static,
    V: IntoHost + FromHost + Clone + Send + 'static,
    S: BuildHasher + Clone + Send + 'static,
{
    fn from_host(value: HostValue) -> BridgeResult<Self> {
        clone_out(value)
    }
}

impl<K, V> IntoHost for BTreeMap<K, V>
where
    K: IntoHost + FromHost + Clone + Ord + Send + 'static,
    V: IntoHost + FromHost + Clone + Send + 'static,
{
    fn into_host(self) -> HostValue {
        HostValue::Object(HostRef::by_value(self))
    }

    fn as_host_object(&self) -> Option<&dyn HostObject> {
        Some(self)
    }

    fn as_host_object_mut(&mut self) -> Option<&mut dyn HostObject> {
        Some(self)
    }
}

impl<K, V> FromHost for BTreeMap<K, V>
where
    K: IntoHost + FromHost + Clone + Ord + Send + 'static,
    V: IntoHost + FromHost + Clone + Send + 'static,
{
    fn from_host(value: HostValue) -> BridgeResult<Self> {
        clone_out(value)
    }
}

// ==================== Interpreter values ====================

/// Convert a host value into an interpreter value, registering composites.
pub(crate) fn host_to_lua<'lua>(
    lua: &'lua Lua,
    ctx: &BridgeContext,
    value: HostValue,
) -> BridgeResult<Value<'lua>> {
    Ok(match value {
        HostValue::Nil => Value::Nil,
        HostValue::Bool(b) => Value::Boolean(b),
        HostValue::Int(i) => Value::Integer(i),
        HostValue::UInt(u) => match i64::try_from(u) {
            Ok(i) => Value::Integer(i),
            Err(_) => Value::Number(u as f64),
        },
        HostValue::Float(f) => Value::Number(f),
        HostValue::Str(s) => Value::String(lua.create_string(&s)?),
        HostValue::Object(obj) => {
            let id = ctx.registry.register(Payload::Object(obj))?;
            Value::UserData(protocol::materialize(lua, ctx, id)?)
        }
        HostValue::Function(func) => {
            let id = ctx.registry.register(Payload::Function(func))?;
            Value::UserData(protocol::materialize(lua, ctx, id)?)
        }
    })
}

/// Convert an interpreter value into a host value.
///
/// Foreign handles resolve to their registered payload, and handles bound to
/// a record field to a copy of that field; script tables, closures and
/// coroutines have no host counterpart.
pub(crate) fn lua_to_host(ctx: &BridgeContext, value: Value<'_>) -> BridgeResult<HostValue> {
    match value {
        Value::Nil => Ok(HostValue::Nil),
        Value::Boolean(b) => Ok(HostValue::Bool(b)),
        Value::Integer(i) => Ok(HostValue::Int(i)),
        Value::Number(n) => Ok(HostValue::Float(n)),
        Value::String(s) => Ok(HostValue::Str(s.to_string_lossy().into_owned())),
        Value::UserData(ud) => {
            let id = protocol::handle_id(&ud)
                .ok_or_else(|| BridgeError::type_mismatch("host value", "userdata"))?;
            let entry = ctx.registry.lookup(id).ok_or(BridgeError::StaleHandle(id))?;
            match &entry.payload {
                Payload::Object(obj) => Ok(obj.detach()),
                Payload::Function(func) => Ok(HostValue::Function(Arc::clone(func))),
                _ => Err(BridgeError::type_mismatch("host value", entry.type_name.as_str())),
            }
        }
        other => Err(BridgeError::type_mismatch("host value", other.type_name())),
    }
}

pub(crate) fn lua_to_script(value: &Value<'_>) -> BridgeResult<ScriptValue> {
    match value {
        Value::Nil => Ok(ScriptValue::Nil),
        Value::Boolean(b) => Ok(ScriptValue::Bool(*b)),
        Value::Integer(i) => Ok(ScriptValue::Number(*i as f64)),
        Value::Number(n) => Ok(ScriptValue::Number(*n)),
        Value::String(s) => Ok(ScriptValue::String(s.to_string_lossy().into_owned())),
        Value::UserData(ud) => protocol::handle_id(ud)
            .map(ScriptValue::Foreign)
            .ok_or_else(|| BridgeError::type_mismatch("script value", "userdata")),
        other => Err(BridgeError::type_mismatch("script value", other.type_name())),
    }
}

pub(crate) fn script_to_lua<'lua>(lua: &'lua Lua, value: &ScriptValue) -> BridgeResult<Value<'lua>> {
    Ok(match value {
        ScriptValue::Nil => Value::Nil,
        ScriptValue::Bool(b) => Value::Boolean(*b),
        ScriptValue::Number(n) => Value::Number(*n),
        ScriptValue::String(s) => Value::String(lua.create_string(s)?),
        ScriptValue::Foreign(id) => Value::UserData(protocol::existing_handle(lua, *id)?),
    })
}

/// Resolve a script value against the registry.
pub(crate) fn script_to_host(ctx: &BridgeContext, value: ScriptValue) -> BridgeResult<HostValue> {
    match value {
        ScriptValue::Nil => Ok(HostValue::Nil),
        ScriptValue::Bool(b) => Ok(HostValue::Bool(b)),
        ScriptValue::Number(n) => Ok(HostValue::Float(n)),
        ScriptValue::String(s) => Ok(HostValue::Str(s)),
        ScriptValue::Foreign(id) => {
            let entry = ctx.registry.lookup(id).ok_or(BridgeError::StaleHandle(id))?;
            match &entry.payload {
                Payload::Object(obj) => Ok(obj.detach()),
                Payload::Function(func) => Ok(HostValue::Function(Arc::clone(func))),
                _ => Err(BridgeError::type_mismatch("host value", entry.type_name.as_str())),
            }
        }
    }
}
