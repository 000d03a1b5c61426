// Metatable dispatch for foreign handles.
//
// A foreign handle is a userdata carrying a registry id. Its metamethods are
// the interpreter's callback entry points into the bridge: every member
// read, member write, length query, iteration start and call made by a
// script against a handle arrives here, is resolved through the registry
// and the name resolver, and is carried out on the host object. Dropping
// the userdata (the interpreter's finalizer) releases the registry entry.

use std::sync::Arc;

use mlua::{AnyUserData, Function, Lua, MetaMethod, MultiValue, Table, UserData, UserDataMethods, Value};

use crate::convert::{host_to_lua, lua_to_host};
use crate::error::{BridgeError, BridgeResult};
use crate::exporter::{invoke_function, module_read, not_callable};
use crate::names::NameResolver;
use crate::reflect::{Record, ShapeKind, TypeDescriptor};
use crate::registry::{
    IterationCursor, MethodInvoker, ObjectRegistry, PairStyle, Payload, RegisteredObject,
};
use crate::value::{HostRef, HostValue};

const HANDLE_CACHE: &str = "hostlua.handles";
const STOCK_IPAIRS: &str = "hostlua.ipairs";

/// Per-interpreter state reachable from every callback.
pub(crate) struct BridgeContext {
    pub registry: Arc<ObjectRegistry>,
    pub names: NameResolver,
    pub strict_writes: bool,
}

pub(crate) fn context(lua: &Lua) -> mlua::Result<Arc<BridgeContext>> {
    lua.app_data_ref::<Arc<BridgeContext>>()
        .map(|ctx| Arc::clone(&*ctx))
        .ok_or_else(|| mlua::Error::runtime("no bridge state found"))
}

/// Attach the bridge to an interpreter: context, handle cache and `ipairs`.
pub(crate) fn install(lua: &Lua, ctx: Arc<BridgeContext>) -> BridgeResult<()> {
    lua.set_app_data(ctx);

    let cache = lua.create_table()?;
    let weak = lua.create_table()?;
    weak.set("__mode", "v")?;
    cache.set_metatable(Some(weak));
    lua.set_named_registry_value(HANDLE_CACHE, cache)?;

    let globals = lua.globals();
    let stock: Value = globals.get("ipairs")?;
    lua.set_named_registry_value(STOCK_IPAIRS, stock)?;
    let ipairs = lua.create_function(|lua, args: MultiValue| {
        let args = args.into_vec();
        if let Some(Value::UserData(ud)) = args.first() {
            if ud.is::<ForeignHandle>() {
                let ctx = context(lua)?;
                return Ok(iterate_start(lua, &ctx, ud.clone(), PairStyle::Indexed)?);
            }
        }
        let stock: Function = lua.named_registry_value(STOCK_IPAIRS)?;
        stock.call::<_, MultiValue>(MultiValue::from_vec(args))
    })?;
    globals.set("ipairs", ipairs)?;
    Ok(())
}

// ==================== Foreign handles ====================

pub(crate) struct ForeignHandle {
    id: u64,
    registry: Arc<ObjectRegistry>,
}

impl Drop for ForeignHandle {
    fn drop(&mut self) {
        self.registry.release(self.id);
    }
}

impl UserData for ForeignHandle {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_meta_function(MetaMethod::Index, |lua, (ud, key): (AnyUserData, Value)| {
            let ctx = context(lua)?;
            Ok(read(lua, &ctx, ud, key)?)
        });

        methods.add_meta_method(MetaMethod::NewIndex, |lua, this, (key, value): (Value, Value)| {
            let ctx = context(lua)?;
            write(&ctx, this.id, key, value)?;
            Ok(())
        });

        methods.add_meta_method(MetaMethod::Len, |lua, this, ()| {
            let ctx = context(lua)?;
            Ok(length(&ctx, this.id)?)
        });

        methods.add_meta_function(MetaMethod::Call, |lua, (ud, args): (AnyUserData, MultiValue)| {
            let ctx = context(lua)?;
            Ok(call(lua, ctx, &ud, args)?)
        });

        methods.add_meta_function(MetaMethod::Pairs, |lua, ud: AnyUserData| {
            let ctx = context(lua)?;
            Ok(iterate_start(lua, &ctx, ud, PairStyle::Keyed)?)
        });

        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(match this.registry.lookup(this.id) {
                Some(entry) => format!("{}({})", entry.type_name, this.id),
                None => format!("released({})", this.id),
            })
        });

        methods.add_meta_method(MetaMethod::Eq, |_, this, other: AnyUserData| {
            let Some(other) = handle_id(&other) else {
                return Ok(false);
            };
            Ok(this.id == other || same_target(&this.registry, this.id, other))
        });
    }
}

/// Two handles are equal when they stand for the same host value.
fn same_target(registry: &ObjectRegistry, a: u64, b: u64) -> bool {
    let (Some(a), Some(b)) = (registry.lookup(a), registry.lookup(b)) else {
        return false;
    };
    match (&a.payload, &b.payload) {
        (Payload::Object(x), Payload::Object(y)) => x.ptr_eq(y),
        (Payload::Function(x), Payload::Function(y)) => Arc::ptr_eq(x, y),
        (Payload::Module(x), Payload::Module(y)) => Arc::ptr_eq(x, y),
        _ => false,
    }
}

pub(crate) fn handle_id(ud: &AnyUserData<'_>) -> Option<u64> {
    ud.borrow::<ForeignHandle>().ok().map(|handle| handle.id)
}

fn cache_key(id: u64) -> mlua::Integer {
    id as mlua::Integer
}

/// Create the userdata standing for registry entry `id`.
///
/// If the userdata cannot be created the handle is dropped on the spot,
/// which releases the entry again.
pub(crate) fn materialize<'lua>(lua: &'lua Lua, ctx: &BridgeContext, id: u64) -> BridgeResult<AnyUserData<'lua>> {
    let handle = ForeignHandle {
        id,
        registry: Arc::clone(&ctx.registry),
    };
    let ud = lua.create_userdata(handle)?;
    let cache: Table = lua.named_registry_value(HANDLE_CACHE)?;
    cache.raw_set(cache_key(id), &ud)?;
    Ok(ud)
}

/// The live userdata for `id`; an id is never materialized twice.
pub(crate) fn existing_handle<'lua>(lua: &'lua Lua, id: u64) -> BridgeResult<AnyUserData<'lua>> {
    let cache: Table = lua.named_registry_value(HANDLE_CACHE)?;
    match cache.raw_get::<_, Option<AnyUserData>>(cache_key(id))? {
        Some(ud) => Ok(ud),
        None => {
            tracing::warn!(id, "no live handle for registry id");
            Err(BridgeError::StaleHandle(id))
        }
    }
}

fn lookup(ctx: &BridgeContext, id: u64) -> BridgeResult<Arc<RegisteredObject>> {
    ctx.registry.lookup(id).ok_or_else(|| {
        tracing::warn!(id, "dispatch against a released handle");
        BridgeError::StaleHandle(id)
    })
}

fn key_display(key: &Value<'_>) -> String {
    match key {
        Value::String(s) => s.to_string_lossy().into_owned(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.type_name().to_string(),
    }
}

/// Sequence index carried by a key, if it is an integral number.
fn integer_key(key: &Value<'_>) -> Option<i64> {
    match key {
        Value::Integer(i) => Some(*i),
        Value::Number(n) if n.fract() == 0.0 => Some(*n as i64),
        _ => None,
    }
}

// ==================== Record access ====================

fn record_descriptor(obj: &HostRef) -> BridgeResult<&'static TypeDescriptor> {
    obj.with(|object| object.as_record().map(|record| record.descriptor()))
        .flatten()
        .ok_or_else(|| BridgeError::ContractViolation(format!("{} is not a record", obj.type_name())))
}

fn unreachable_object(obj: &HostRef) -> BridgeError {
    BridgeError::ContractViolation(format!("{} is no longer reachable", obj.type_name()))
}

pub(crate) fn read_path(record: &dyn Record, path: &[usize]) -> Option<HostValue> {
    let (last, parents) = path.split_last()?;
    let mut current = record;
    for &index in parents {
        current = current.embedded(index)?;
    }
    current.get_field(*last)
}

pub(crate) fn descend_mut<'a>(record: &'a mut dyn Record, path: &[usize]) -> BridgeResult<&'a mut dyn Record> {
    let mut current = record;
    for &index in path {
        let type_name = current.descriptor().type_name;
        current = current.embedded_mut(index).ok_or_else(|| {
            BridgeError::ContractViolation(format!("{type_name} has no embedded record at {index}"))
        })?;
    }
    Ok(current)
}

pub(crate) fn write_path(record: &mut dyn Record, path: &[usize], value: HostValue) -> BridgeResult<()> {
    let Some((last, parents)) = path.split_last() else {
        return Err(BridgeError::ContractViolation("empty field path".to_string()));
    };
    descend_mut(record, parents)?.set_field(*last, value)
}

/// Unknown or read-only writes are dropped unless the bridge is strict.
fn refuse_write(ctx: &BridgeContext, err: BridgeError) -> BridgeResult<()> {
    if ctx.strict_writes {
        Err(err)
    } else {
        tracing::debug!(%err, "ignoring script write");
        Ok(())
    }
}

// ==================== Read ====================

fn read<'lua>(lua: &'lua Lua, ctx: &BridgeContext, ud: AnyUserData<'lua>, key: Value<'lua>) -> BridgeResult<Value<'lua>> {
    let id = handle_id(&ud).ok_or_else(|| BridgeError::type_mismatch("foreign handle", "userdata"))?;
    let entry = lookup(ctx, id)?;
    match &entry.payload {
        Payload::Object(obj) => match entry.shape {
            ShapeKind::Record => read_record(lua, ctx, id, obj, key),
            ShapeKind::Sequence => read_sequence(lua, ctx, obj, key),
            ShapeKind::Mapping => read_mapping(lua, ctx, obj, key),
            ShapeKind::Callable => Ok(Value::Nil),
        },
        Payload::Module(module) => match &key {
            Value::String(name) => module_read(lua, ctx, &ud, module, name.to_str()?),
            _ => Ok(Value::Nil),
        },
        _ => Err(BridgeError::no_such_member(entry.type_name.as_str(), key_display(&key))),
    }
}

fn read_record<'lua>(
    lua: &'lua Lua,
    ctx: &BridgeContext,
    id: u64,
    obj: &HostRef,
    key: Value<'lua>,
) -> BridgeResult<Value<'lua>> {
    let Value::String(name) = &key else {
        return Err(BridgeError::no_such_member(obj.type_name(), key_display(&key)));
    };
    let name = name.to_str()?;
    let mapping = ctx.names.mapping(record_descriptor(obj)?);

    if let Some(field) = mapping.field(name) {
        // composites stored in the field are handed out in place
        if let Some(nested) = obj.field(Arc::clone(&field.path)) {
            let nested_id = ctx.registry.register(Payload::Object(nested))?;
            return Ok(Value::UserData(materialize(lua, ctx, nested_id)?));
        }
        let value = obj
            .with(|object| object.as_record().and_then(|record| read_path(record, &field.path)))
            .flatten();
        return match value {
            Some(value) => host_to_lua(lua, ctx, value),
            None => Ok(Value::Nil),
        };
    }

    if let Some(method) = mapping.method(name) {
        let invoker = MethodInvoker::new(id, obj.clone(), method.clone());
        let invoker_id = ctx.registry.register(Payload::Method(invoker))?;
        return Ok(Value::UserData(materialize(lua, ctx, invoker_id)?));
    }

    Err(BridgeError::no_such_member(obj.type_name(), name))
}

fn read_sequence<'lua>(lua: &'lua Lua, ctx: &BridgeContext, obj: &HostRef, key: Value<'lua>) -> BridgeResult<Value<'lua>> {
    let Some(index) = integer_key(&key) else {
        return Ok(Value::Nil);
    };
    let value = obj
        .with(|object| {
            object.as_sequence().and_then(|seq| {
                if index >= 1 && (index as u64) <= seq.len() as u64 {
                    seq.item(index as usize - 1)
                } else {
                    None
                }
            })
        })
        .flatten();
    match value {
        Some(value) => host_to_lua(lua, ctx, value),
        None => Ok(Value::Nil),
    }
}

fn read_mapping<'lua>(lua: &'lua Lua, ctx: &BridgeContext, obj: &HostRef, key: Value<'lua>) -> BridgeResult<Value<'lua>> {
    let Ok(key) = lua_to_host(ctx, key) else {
        return Ok(Value::Nil);
    };
    let value = obj.with(|object| object.as_mapping().and_then(|map| map.lookup(key))).flatten();
    match value {
        Some(value) => host_to_lua(lua, ctx, value),
        None => Ok(Value::Nil),
    }
}

// ==================== Write ====================

fn write(ctx: &BridgeContext, id: u64, key: Value<'_>, value: Value<'_>) -> BridgeResult<()> {
    let entry = lookup(ctx, id)?;
    let Payload::Object(obj) = &entry.payload else {
        return Err(BridgeError::no_such_member(entry.type_name.as_str(), key_display(&key)));
    };
    match entry.shape {
        ShapeKind::Record => write_record(ctx, obj, key, value),
        ShapeKind::Sequence => write_sequence(ctx, obj, key, value),
        ShapeKind::Mapping => write_mapping(ctx, obj, key, value),
        ShapeKind::Callable => Err(BridgeError::no_such_member(obj.type_name(), key_display(&key))),
    }
}

fn write_record(ctx: &BridgeContext, obj: &HostRef, key: Value<'_>, value: Value<'_>) -> BridgeResult<()> {
    let Value::String(name) = &key else {
        return refuse_write(ctx, BridgeError::no_such_member(obj.type_name(), key_display(&key)));
    };
    let name = name.to_str()?;
    let mapping = ctx.names.mapping(record_descriptor(obj)?);
    let field = match mapping.field(name) {
        Some(field) if !field.readonly => field,
        Some(field) => {
            return refuse_write(
                ctx,
                BridgeError::ReadOnly {
                    type_name: obj.type_name().to_string(),
                    member: field.name.to_string(),
                },
            );
        }
        None => return refuse_write(ctx, BridgeError::no_such_member(obj.type_name(), name)),
    };

    let value = lua_to_host(ctx, value)?;
    obj.with_mut(|object| {
        let record = object
            .as_record_mut()
            .ok_or_else(|| BridgeError::ContractViolation(format!("{} is not a record", obj.type_name())))?;
        write_path(record, &field.path, value)
    })
    .unwrap_or_else(|| Err(unreachable_object(obj)))
}

/// Only existing slots can be assigned; sequences never grow from scripts.
fn write_sequence(ctx: &BridgeContext, obj: &HostRef, key: Value<'_>, value: Value<'_>) -> BridgeResult<()> {
    let index = integer_key(&key).ok_or_else(|| BridgeError::type_mismatch("integer index", key.type_name()))?;
    let value = lua_to_host(ctx, value)?;
    obj.with_mut(|object| {
        let seq = object
            .as_sequence_mut()
            .ok_or_else(|| BridgeError::ContractViolation(format!("{} is not a sequence", obj.type_name())))?;
        let len = seq.len();
        if index < 1 || index as u64 > len as u64 {
            return Err(BridgeError::IndexOutOfRange { index, len });
        }
        seq.set_item(index as usize - 1, value)
    })
    .unwrap_or_else(|| Err(unreachable_object(obj)))
}

/// Upsert; assigning nil removes the key, even for maps whose values
/// could hold a nil.
fn write_mapping(ctx: &BridgeContext, obj: &HostRef, key: Value<'_>, value: Value<'_>) -> BridgeResult<()> {
    let key = lua_to_host(ctx, key)?;
    let value = lua_to_host(ctx, value)?;
    obj.with_mut(|object| {
        let map = object
            .as_mapping_mut()
            .ok_or_else(|| BridgeError::ContractViolation(format!("{} is not a mapping", obj.type_name())))?;
        if value.is_nil() {
            map.delete(key)
        } else {
            map.upsert(key, value)
        }
    })
    .unwrap_or_else(|| Err(unreachable_object(obj)))
}

// ==================== Length ====================

fn length(ctx: &BridgeContext, id: u64) -> BridgeResult<usize> {
    let entry = lookup(ctx, id)?;
    let Payload::Object(obj) = &entry.payload else {
        return Ok(0);
    };
    Ok(match entry.shape {
        ShapeKind::Sequence => obj
            .with(|object| object.as_sequence().map_or(0, |seq| seq.len()))
            .unwrap_or(0),
        ShapeKind::Mapping => obj
            .with(|object| object.as_mapping().map_or(0, |map| map.len()))
            .unwrap_or(0),
        ShapeKind::Record => ctx.names.mapping(record_descriptor(obj)?).field_count(),
        ShapeKind::Callable => 0,
    })
}

// ==================== Iteration ====================

/// Produce `(iterator, handle, nil)` for a generic `for` loop.
pub(crate) fn iterate_start<'lua>(
    lua: &'lua Lua,
    ctx: &BridgeContext,
    ud: AnyUserData<'lua>,
    style: PairStyle,
) -> BridgeResult<MultiValue<'lua>> {
    let id = handle_id(&ud).ok_or_else(|| BridgeError::type_mismatch("foreign handle", "userdata"))?;
    let entry = lookup(ctx, id)?;
    let Payload::Object(obj) = &entry.payload else {
        return Err(BridgeError::Host(format!("cannot iterate over {}", entry.type_name)));
    };

    let (keys, fields) = match entry.shape {
        ShapeKind::Mapping => {
            let keys = obj
                .with(|object| object.as_mapping().map(|map| map.key_list()))
                .flatten()
                .unwrap_or_default();
            (keys, None)
        }
        ShapeKind::Record => (Vec::new(), Some(ctx.names.mapping(record_descriptor(obj)?))),
        _ => (Vec::new(), None),
    };

    let cursor = IterationCursor::new(id, obj.clone(), entry.shape, style, keys, fields);
    let cursor_id = ctx.registry.register(Payload::Cursor(cursor))?;
    let iterator = materialize(lua, ctx, cursor_id)?;
    Ok(MultiValue::from_vec(vec![
        Value::UserData(iterator),
        Value::UserData(ud),
        Value::Nil,
    ]))
}

fn step_cursor<'lua>(lua: &'lua Lua, ctx: &BridgeContext, cursor: &IterationCursor) -> BridgeResult<MultiValue<'lua>> {
    let next = match cursor.shape {
        ShapeKind::Sequence => {
            let position = cursor.advance();
            cursor
                .target
                .with(|object| {
                    object
                        .as_sequence()
                        .filter(|seq| position < seq.len())
                        .and_then(|seq| seq.item(position))
                })
                .flatten()
                .map(|value| (position, value))
        }
        ShapeKind::Mapping => loop {
            let position = cursor.advance();
            let Some(key) = cursor.keys.get(position) else {
                break None;
            };
            let value = cursor
                .target
                .with(|object| object.as_mapping().and_then(|map| map.lookup(key.clone())))
                .flatten();
            // entries removed since the loop started are skipped
            if let Some(value) = value {
                break Some((position, value));
            }
        },
        ShapeKind::Record => {
            let position = cursor.advance();
            let field = cursor.fields.as_ref().and_then(|fields| fields.fields().get(position));
            field.map(|field| {
                let value = cursor
                    .target
                    .with(|object| object.as_record().and_then(|record| read_path(record, &field.path)))
                    .flatten()
                    .unwrap_or(HostValue::Nil);
                (position, value)
            })
        }
        ShapeKind::Callable => None,
    };

    let Some((position, value)) = next else {
        return Ok(MultiValue::from_vec(vec![Value::Nil]));
    };

    let key = match (cursor.style, cursor.shape) {
        (PairStyle::Indexed, _) => HostValue::Int(cursor.emit()),
        (PairStyle::Keyed, ShapeKind::Mapping) => cursor.keys[position].clone(),
        (PairStyle::Keyed, ShapeKind::Record) => {
            let name = cursor
                .fields
                .as_ref()
                .and_then(|fields| fields.fields().get(position))
                .map_or("", |field| field.script_name);
            HostValue::Str(name.to_string())
        }
        (PairStyle::Keyed, _) => HostValue::Int(position as i64 + 1),
    };

    let key = host_to_lua(lua, ctx, key)?;
    let value = host_to_lua(lua, ctx, value)?;
    Ok(MultiValue::from_vec(vec![key, value]))
}

// ==================== Call ====================

fn call<'lua>(
    lua: &'lua Lua,
    ctx: Arc<BridgeContext>,
    ud: &AnyUserData<'lua>,
    args: MultiValue<'lua>,
) -> BridgeResult<MultiValue<'lua>> {
    let id = handle_id(ud).ok_or_else(|| BridgeError::type_mismatch("foreign handle", "userdata"))?;
    let entry = lookup(&ctx, id)?;
    if !entry.is_function {
        return Err(not_callable(&entry.type_name));
    }
    match &entry.payload {
        Payload::Function(func) => invoke_function(lua, Arc::clone(&ctx), func, args.into_vec()),
        Payload::Method(invoker) => {
            if !invoker.consume() {
                return Err(BridgeError::StaleHandle(id));
            }
            let result = call_method(lua, &ctx, invoker, args.into_vec());
            ctx.registry.release(id);
            result
        }
        Payload::Cursor(cursor) => step_cursor(lua, &ctx, cursor),
        _ => Err(not_callable(&entry.type_name)),
    }
}

fn refers_to(ctx: &BridgeContext, value: &Value<'_>, target: &HostRef) -> bool {
    let Value::UserData(ud) = value else {
        return false;
    };
    handle_id(ud)
        .and_then(|id| ctx.registry.lookup(id))
        .is_some_and(|entry| matches!(&entry.payload, Payload::Object(obj) if obj.ptr_eq(target)))
}

fn call_method<'lua>(
    lua: &'lua Lua,
    ctx: &BridgeContext,
    invoker: &MethodInvoker,
    mut args: Vec<Value<'lua>>,
) -> BridgeResult<MultiValue<'lua>> {
    let method = &invoker.method;

    // obj:method(...) passes the receiver first
    if args.first().is_some_and(|first| refers_to(ctx, first, &invoker.target)) {
        args.remove(0);
    }
    if args.len() < method.arity {
        return Err(BridgeError::ArityMismatch {
            method: method.name.to_string(),
            expected: method.arity,
            supplied: args.len(),
        });
    }
    args.truncate(method.arity);

    let mut host_args = Vec::with_capacity(args.len());
    for (position, arg) in args.into_iter().enumerate() {
        let value = lua_to_host(ctx, arg).map_err(|err| err.in_argument(method.name, position + 1))?;
        if matches!(&value, HostValue::Object(obj) if obj.shares_owner(&invoker.target)) {
            return Err(BridgeError::Host(format!(
                "{} cannot be passed to its own method '{}'",
                invoker.target.type_name(),
                method.name
            )));
        }
        host_args.push(value);
    }

    tracing::trace!(type_name = invoker.target.type_name(), method = method.name, "invoking host method");
    let results = invoker
        .target
        .with_mut(|object| {
            let record = object.as_record_mut().ok_or_else(|| {
                BridgeError::ContractViolation(format!("{} is not a record", invoker.target.type_name()))
            })?;
            descend_mut(record, &method.path)?.invoke(method.index, host_args)
        })
        .unwrap_or_else(|| Err(unreachable_object(&invoker.target)))?;

    let values = results
        .into_iter()
        .map(|value| host_to_lua(lua, ctx, value))
        .collect::<BridgeResult<Vec<_>>>()?;
    Ok(MultiValue::from_vec(values))
}
