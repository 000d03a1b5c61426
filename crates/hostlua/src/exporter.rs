// Host functions and function groups callable from scripts

use std::sync::Arc;

use mlua::{AnyUserData, Lua, MultiValue, Table, Value};
use smol_str::SmolStr;

use crate::convert::{FromHost, IntoHost, host_to_lua, lua_to_host};
use crate::error::{BridgeError, BridgeResult};
use crate::protocol::{self, BridgeContext};
use crate::registry::Payload;
use crate::value::{HostValue, ScriptValue};

/// A host function exposed to scripts.
///
/// `invoke` reads its arguments from the frame, pushes its results onto it
/// and returns how many of the pushed values are results.
pub trait HostFunction: Send + Sync {
    fn name(&self) -> &str;

    fn invoke(&self, frame: &mut CallFrame<'_>) -> BridgeResult<usize>;
}

/// A named group of host functions, exposed to scripts as one global.
pub trait HostModule: Send + Sync {
    fn name(&self) -> &str;

    fn exported_functions(&self) -> Vec<Arc<dyn HostFunction>>;
}

// ==================== Call frames ====================

/// Arguments and results of one host function invocation.
///
/// Argument indices are 1-based; reading past the last argument yields nil.
pub struct CallFrame<'lua> {
    lua: &'lua Lua,
    ctx: Arc<BridgeContext>,
    args: Vec<Value<'lua>>,
    results: Vec<Value<'lua>>,
}

impl<'lua> CallFrame<'lua> {
    pub(crate) fn new(lua: &'lua Lua, ctx: Arc<BridgeContext>, args: Vec<Value<'lua>>) -> Self {
        Self {
            lua,
            ctx,
            args,
            results: Vec::new(),
        }
    }

    pub fn lua(&self) -> &'lua Lua {
        self.lua
    }

    /// Number of arguments.
    pub fn get_top(&self) -> usize {
        self.args.len()
    }

    fn raw(&self, index: usize) -> Option<&Value<'lua>> {
        index.checked_sub(1).and_then(|i| self.args.get(i))
    }

    pub fn is_nil(&self, index: usize) -> bool {
        self.raw(index).is_none_or(Value::is_nil)
    }

    pub fn arg(&self, index: usize) -> BridgeResult<HostValue> {
        match self.raw(index) {
            Some(value) => lua_to_host(&self.ctx, value.clone()),
            None => Ok(HostValue::Nil),
        }
    }

    pub fn script_arg(&self, index: usize) -> BridgeResult<ScriptValue> {
        match self.raw(index) {
            Some(value) => crate::convert::lua_to_script(value),
            None => Ok(ScriptValue::Nil),
        }
    }

    pub fn to_host<T: FromHost>(&self, index: usize) -> BridgeResult<T> {
        T::from_host(self.arg(index)?)
    }

    /// Integer value of the argument, 0 when it has none.
    pub fn to_integer(&self, index: usize) -> i64 {
        match self.raw(index) {
            Some(Value::Integer(i)) => *i,
            Some(Value::Number(n)) if n.fract() == 0.0 => *n as i64,
            Some(Value::String(s)) => s.to_str().ok().and_then(|s| s.trim().parse().ok()).unwrap_or(0),
            _ => 0,
        }
    }

    /// Numeric value of the argument, 0.0 when it has none.
    pub fn to_number(&self, index: usize) -> f64 {
        match self.raw(index) {
            Some(Value::Integer(i)) => *i as f64,
            Some(Value::Number(n)) => *n,
            Some(Value::String(s)) => s.to_str().ok().and_then(|s| s.trim().parse().ok()).unwrap_or(0.0),
            _ => 0.0,
        }
    }

    /// String value of the argument; numbers are formatted, anything else is "".
    pub fn to_string(&self, index: usize) -> String {
        match self.raw(index) {
            Some(Value::String(s)) => s.to_string_lossy().into_owned(),
            Some(Value::Integer(i)) => i.to_string(),
            Some(Value::Number(n)) => String::from_host(HostValue::Float(*n)).unwrap_or_default(),
            _ => String::new(),
        }
    }

    pub fn to_bool(&self, index: usize) -> bool {
        !matches!(self.raw(index), None | Some(Value::Nil) | Some(Value::Boolean(false)))
    }

    pub fn push<T: IntoHost>(&mut self, value: T) -> BridgeResult<()> {
        let value = host_to_lua(self.lua, &self.ctx, value.into_host())?;
        self.results.push(value);
        Ok(())
    }

    pub fn push_nil(&mut self) {
        self.results.push(Value::Nil);
    }

    pub fn push_value(&mut self, value: &ScriptValue) -> BridgeResult<()> {
        let value = crate::convert::script_to_lua(self.lua, value)?;
        self.results.push(value);
        Ok(())
    }

    /// The last `count` pushed values, padded with nil if fewer were pushed.
    fn into_results(mut self, count: usize) -> MultiValue<'lua> {
        let pushed = self.results.len();
        let mut out = self.results.split_off(pushed.saturating_sub(count));
        out.resize(count, Value::Nil);
        MultiValue::from_vec(out)
    }
}

// ==================== Closures ====================

struct ClosureFunction<F> {
    name: SmolStr,
    func: F,
}

impl<F> HostFunction for ClosureFunction<F>
where
    F: Fn(&mut CallFrame<'_>) -> BridgeResult<usize> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, frame: &mut CallFrame<'_>) -> BridgeResult<usize> {
        (self.func)(frame)
    }
}

/// Build a host function from a closure.
pub fn host_fn<F>(name: impl Into<SmolStr>, func: F) -> Arc<dyn HostFunction>
where
    F: Fn(&mut CallFrame<'_>) -> BridgeResult<usize> + Send + Sync + 'static,
{
    Arc::new(ClosureFunction {
        name: name.into(),
        func,
    })
}

/// A module assembled from individual functions.
pub struct FunctionGroup {
    name: SmolStr,
    functions: Vec<Arc<dyn HostFunction>>,
}

impl FunctionGroup {
    pub fn new(name: impl Into<SmolStr>) -> Self {
        Self {
            name: name.into(),
            functions: Vec::new(),
        }
    }

    pub fn with(mut self, func: Arc<dyn HostFunction>) -> Self {
        self.functions.push(func);
        self
    }
}

impl HostModule for FunctionGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn exported_functions(&self) -> Vec<Arc<dyn HostFunction>> {
        self.functions.clone()
    }
}

// ==================== Export and dispatch ====================

pub(crate) fn export_function(lua: &Lua, ctx: &BridgeContext, func: Arc<dyn HostFunction>) -> BridgeResult<()> {
    let name = func.name().to_string();
    let id = ctx.registry.register(Payload::Function(func))?;
    let handle = protocol::materialize(lua, ctx, id)?;
    lua.globals().set(name.as_str(), handle)?;
    tracing::debug!(id, name = %name, "exported host function");
    Ok(())
}

pub(crate) fn export_module(lua: &Lua, ctx: &BridgeContext, module: Arc<dyn HostModule>) -> BridgeResult<()> {
    let name = module.name().to_string();
    let id = ctx.registry.register(Payload::Module(module))?;
    let handle = protocol::materialize(lua, ctx, id)?;
    lua.globals().set(name.as_str(), handle)?;
    tracing::debug!(id, name = %name, "exported host module");
    Ok(())
}

pub(crate) fn invoke_function<'lua>(
    lua: &'lua Lua,
    ctx: Arc<BridgeContext>,
    func: &Arc<dyn HostFunction>,
    args: Vec<Value<'lua>>,
) -> BridgeResult<MultiValue<'lua>> {
    let mut frame = CallFrame::new(lua, ctx, args);
    let count = func.invoke(&mut frame)?;
    Ok(frame.into_results(count))
}

const MODULE_EXPORTS: &str = "exports";

/// Look up `name` among a module's functions, registering it on first use.
///
/// Resolved functions are cached on the module handle so later reads reuse
/// the same foreign handle. An unknown name reads as nil.
pub(crate) fn module_read<'lua>(
    lua: &'lua Lua,
    ctx: &BridgeContext,
    handle: &AnyUserData<'lua>,
    module: &Arc<dyn HostModule>,
    name: &str,
) -> BridgeResult<Value<'lua>> {
    let exports: Table<'lua> = match handle.named_user_value::<Option<Table>>(MODULE_EXPORTS)? {
        Some(table) => table,
        None => {
            let table = lua.create_table()?;
            handle.set_named_user_value(MODULE_EXPORTS, &table)?;
            table
        }
    };

    let cached: Value = exports.raw_get(name)?;
    if !cached.is_nil() {
        return Ok(cached);
    }

    let Some(func) = module.exported_functions().into_iter().find(|f| f.name() == name) else {
        return Ok(Value::Nil);
    };
    let id = ctx.registry.register(Payload::Function(func))?;
    let member = protocol::materialize(lua, ctx, id)?;
    exports.raw_set(name, &member)?;
    tracing::trace!(module = module.name(), name, id, "registered module function");
    Ok(Value::UserData(member))
}

/// Reject calls on registered objects that are not functions.
pub(crate) fn not_callable(type_name: &str) -> BridgeError {
    BridgeError::Host(format!("attempt to call a {type_name} value"))
}
