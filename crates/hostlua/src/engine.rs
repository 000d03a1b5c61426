// Stack-style facade over the embedded interpreter.
//
// Host code talks to the interpreter the way a C embedder would: values are
// pushed onto an operand stack, addressed by 1-based index from the bottom
// or negative index from the top, and consumed by calls and global
// assignment. The stack holds registry keys so values stay rooted while
// they sit on it.

use std::cell::RefCell;

use mlua::{Function, Lua, LuaOptions, MetaMethod, MultiValue, RegistryKey, Value};

use crate::convert::format_float;
use crate::error::{BridgeError, BridgeResult};
use crate::options::BridgeOptions;
use crate::protocol;

/// Pass to `protected_call` to keep every result.
pub const MULTRET: Option<usize> = None;

pub struct ScriptEngine {
    lua: Lua,
    stack: RefCell<Vec<RegistryKey>>,
}

impl ScriptEngine {
    pub(crate) fn new(options: &BridgeOptions) -> BridgeResult<Self> {
        let lua = Lua::new_with(options.std_flags(), LuaOptions::default())
            .map_err(|err| BridgeError::Initialization(err.to_string()))?;
        if let Some(limit) = options.memory_limit {
            lua.set_memory_limit(limit)
                .map_err(|err| BridgeError::Initialization(err.to_string()))?;
        }
        Ok(Self {
            lua,
            stack: RefCell::new(Vec::new()),
        })
    }

    /// The underlying interpreter.
    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    // ===== Stack addressing =====

    /// Zero-based slot for a stack index (`lua_absindex` + bounds check).
    fn slot(&self, index: i32) -> Option<usize> {
        let top = self.stack.borrow().len() as i64;
        let index = index as i64;
        let absolute = match index {
            0 => return None,
            i if i > 0 => i,
            i => top + i + 1,
        };
        (absolute >= 1 && absolute <= top).then(|| absolute as usize - 1)
    }

    pub(crate) fn push_lua(&self, value: Value<'_>) -> BridgeResult<()> {
        let key = self.lua.create_registry_value(value)?;
        self.stack.borrow_mut().push(key);
        Ok(())
    }

    /// Value at `index`; an empty slot reads as nil.
    pub(crate) fn value_at(&self, index: i32) -> BridgeResult<Value<'_>> {
        let Some(slot) = self.slot(index) else {
            return Ok(Value::Nil);
        };
        let stack = self.stack.borrow();
        Ok(self.lua.registry_value(&stack[slot])?)
    }

    pub(crate) fn pop_lua(&self) -> BridgeResult<Value<'_>> {
        let key = self.stack.borrow_mut().pop();
        match key {
            Some(key) => {
                let value = self.lua.registry_value(&key)?;
                self.lua.remove_registry_value(key)?;
                Ok(value)
            }
            None => Ok(Value::Nil),
        }
    }

    fn pop_many(&self, count: usize) -> BridgeResult<Vec<Value<'_>>> {
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(self.pop_lua()?);
        }
        values.reverse();
        Ok(values)
    }

    pub fn get_top(&self) -> usize {
        self.stack.borrow().len()
    }

    /// Grow the stack with nils or drop values above `index`.
    pub fn set_top(&self, index: i32) {
        let top = self.get_top() as i64;
        let new_top = if index >= 0 {
            index as i64
        } else {
            (top + index as i64 + 1).max(0)
        } as usize;

        let mut stack = self.stack.borrow_mut();
        if new_top < stack.len() {
            // dropped keys are reclaimed by the interpreter on reuse or collection
            stack.truncate(new_top);
            return;
        }
        drop(stack);
        while self.get_top() < new_top {
            if self.push_lua(Value::Nil).is_err() {
                break;
            }
        }
    }

    pub fn pop(&self, count: usize) {
        let top = self.get_top();
        self.set_top(top.saturating_sub(count) as i32);
    }

    // ===== Loading and calling =====

    /// Compile `source` and push the resulting function.
    pub fn load_code(&self, source: &str, chunk_name: &str) -> BridgeResult<()> {
        let func = self
            .lua
            .load(source)
            .set_name(chunk_name)
            .into_function()
            .map_err(|err| match err {
                mlua::Error::SyntaxError { message, .. } => BridgeError::Load(message),
                other => BridgeError::Load(other.to_string()),
            })?;
        self.push_lua(Value::Function(func))
    }

    /// Call the function sitting below the top `nargs` values.
    ///
    /// The function and its arguments are popped; results are pushed,
    /// adjusted to `nresults` unless it is [`MULTRET`]. On failure nothing is
    /// pushed and the error carries the interpreter's message and traceback.
    pub fn protected_call(&self, nargs: usize, nresults: Option<usize>) -> BridgeResult<usize> {
        if self.get_top() < nargs + 1 {
            return Err(BridgeError::ContractViolation(format!(
                "protected call needs {} stack values, found {}",
                nargs + 1,
                self.get_top()
            )));
        }
        let args = self.pop_many(nargs)?;
        let callee = self.pop_lua()?;

        let results = call_value(callee, MultiValue::from_vec(args)).map_err(BridgeError::from_lua_failure)?;
        let mut results = results.into_vec();
        if let Some(wanted) = nresults {
            results.resize(wanted, Value::Nil);
        }
        let count = results.len();
        for value in results {
            self.push_lua(value)?;
        }
        Ok(count)
    }

    // ===== Push =====

    pub fn push_nil(&self) -> BridgeResult<()> {
        self.push_lua(Value::Nil)
    }

    pub fn push_bool(&self, value: bool) -> BridgeResult<()> {
        self.push_lua(Value::Boolean(value))
    }

    pub fn push_number(&self, value: f64) -> BridgeResult<()> {
        self.push_lua(Value::Number(value))
    }

    pub fn push_integer(&self, value: i64) -> BridgeResult<()> {
        self.push_lua(Value::Integer(value))
    }

    pub fn push_string(&self, value: &str) -> BridgeResult<()> {
        let value = self.lua.create_string(value)?;
        self.push_lua(Value::String(value))
    }

    /// Push the live handle for registry entry `id`.
    pub fn push_foreign_handle(&self, id: u64) -> BridgeResult<()> {
        let handle = protocol::existing_handle(&self.lua, id)?;
        self.push_lua(Value::UserData(handle))
    }

    /// Push a copy of the value at `index` (`lua_pushvalue`).
    pub fn push_copy(&self, index: i32) -> BridgeResult<()> {
        let value = self.value_at(index)?;
        self.push_lua(value)
    }

    // ===== Type predicates =====

    pub fn is_none(&self, index: i32) -> bool {
        self.slot(index).is_none()
    }

    fn check(&self, index: i32, pred: impl FnOnce(&Value<'_>) -> bool) -> bool {
        self.slot(index).is_some() && self.value_at(index).is_ok_and(|value| pred(&value))
    }

    pub fn is_nil(&self, index: i32) -> bool {
        self.is_none(index) || self.check(index, |v| v.is_nil())
    }

    pub fn is_bool(&self, index: i32) -> bool {
        self.check(index, |v| matches!(v, Value::Boolean(_)))
    }

    /// Numbers and strings convertible to numbers.
    pub fn is_number(&self, index: i32) -> bool {
        self.to_number(index).is_some()
    }

    /// Strings and numbers.
    pub fn is_string(&self, index: i32) -> bool {
        self.check(index, |v| matches!(v, Value::String(_) | Value::Integer(_) | Value::Number(_)))
    }

    pub fn is_table(&self, index: i32) -> bool {
        self.check(index, |v| matches!(v, Value::Table(_)))
    }

    pub fn is_function(&self, index: i32) -> bool {
        self.check(index, |v| matches!(v, Value::Function(_)))
    }

    pub fn is_foreign_handle(&self, index: i32) -> bool {
        self.to_foreign_handle_id(index).is_some()
    }

    pub fn type_name(&self, index: i32) -> &'static str {
        if self.is_none(index) {
            return "no value";
        }
        self.value_at(index).map_or("no value", |value| value.type_name())
    }

    // ===== Read =====

    /// Truthiness: only nil and false are false.
    pub fn to_bool(&self, index: i32) -> bool {
        !matches!(self.value_at(index), Ok(Value::Nil | Value::Boolean(false)) | Err(_))
    }

    pub fn to_number(&self, index: i32) -> Option<f64> {
        match self.value_at(index).ok()? {
            Value::Integer(i) => Some(i as f64),
            Value::Number(n) => Some(n),
            Value::String(s) => s.to_str().ok()?.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn to_integer(&self, index: i32) -> Option<i64> {
        match self.value_at(index).ok()? {
            Value::Integer(i) => Some(i),
            Value::Number(n) if n.fract() == 0.0 => Some(n as i64),
            Value::String(s) => {
                let s = s.to_str().ok()?.trim().to_string();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().filter(|n| n.fract() == 0.0).map(|n| n as i64))
            }
            _ => None,
        }
    }

    /// Strings, and numbers formatted the way the interpreter prints them.
    pub fn to_string(&self, index: i32) -> Option<String> {
        match self.value_at(index).ok()? {
            Value::String(s) => Some(s.to_string_lossy().into_owned()),
            Value::Integer(i) => Some(i.to_string()),
            Value::Number(n) => Some(format_float(n)),
            _ => None,
        }
    }

    pub fn to_foreign_handle_id(&self, index: i32) -> Option<u64> {
        match self.value_at(index).ok()? {
            Value::UserData(ud) => protocol::handle_id(&ud),
            _ => None,
        }
    }

    // ===== Globals and tables =====

    /// Pop the top value into global `name`.
    pub fn set_global(&self, name: &str) -> BridgeResult<()> {
        let value = self.pop_lua()?;
        self.lua.globals().set(name, value)?;
        Ok(())
    }

    pub fn get_global(&self, name: &str) -> BridgeResult<()> {
        let value: Value = self.lua.globals().get(name)?;
        self.push_lua(value)
    }

    pub fn new_table(&self) -> BridgeResult<()> {
        let table = self.lua.create_table()?;
        self.push_lua(Value::Table(table))
    }

    /// Push `t[name]` for the table or foreign handle at `index`.
    pub fn get_field(&self, index: i32, name: &str) -> BridgeResult<()> {
        let target = self.value_at(index)?;
        let key = Value::String(self.lua.create_string(name)?);
        let value = index_value(target, key).map_err(BridgeError::from_lua_failure)?;
        self.push_lua(value)
    }

    /// Pop the top value into `t[name]` for the table or handle at `index`.
    pub fn set_field(&self, index: i32, name: &str) -> BridgeResult<()> {
        let target = self.value_at(index)?;
        let value = self.pop_lua()?;
        let key = Value::String(self.lua.create_string(name)?);
        assign_value(target, key, value).map_err(BridgeError::from_lua_failure)
    }

    /// Pop a key and push `t[key]` (`lua_gettable`).
    pub fn get_table(&self, index: i32) -> BridgeResult<()> {
        let target = self.value_at(index)?;
        let key = self.pop_lua()?;
        let value = index_value(target, key).map_err(BridgeError::from_lua_failure)?;
        self.push_lua(value)
    }

    /// Pop a value and a key and assign `t[key] = value` (`lua_settable`).
    pub fn set_table(&self, index: i32) -> BridgeResult<()> {
        let target = self.value_at(index)?;
        let value = self.pop_lua()?;
        let key = self.pop_lua()?;
        assign_value(target, key, value).map_err(BridgeError::from_lua_failure)
    }

    /// Pop a table (or nil) and install it as the metatable of the table at `index`.
    ///
    /// Foreign handles keep the bridge's metatable.
    pub fn set_metatable(&self, index: i32) -> BridgeResult<()> {
        let target = self.value_at(index)?;
        let metatable = self.pop_lua()?;
        let table = match target {
            Value::Table(table) => table,
            other => return Err(BridgeError::type_mismatch("table", other.type_name())),
        };
        match metatable {
            Value::Nil => table.set_metatable(None),
            Value::Table(mt) => table.set_metatable(Some(mt)),
            other => return Err(BridgeError::type_mismatch("table or nil", other.type_name())),
        }
        Ok(())
    }

    /// Push the metatable of the table at `index`; returns false (pushing
    /// nothing) when it has none.
    pub fn get_metatable(&self, index: i32) -> BridgeResult<bool> {
        let Value::Table(table) = self.value_at(index)? else {
            return Ok(false);
        };
        match table.get_metatable() {
            Some(mt) => {
                self.push_lua(Value::Table(mt))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Run a full collection cycle, finalizing unreachable foreign handles.
    pub fn gc_collect(&self) -> BridgeResult<()> {
        self.lua.expire_registry_values();
        self.lua.gc_collect()?;
        Ok(())
    }
}

fn call_value<'lua>(callee: Value<'lua>, args: MultiValue<'lua>) -> mlua::Result<MultiValue<'lua>> {
    match callee {
        Value::Function(func) => func.call(args),
        Value::UserData(ud) => {
            let call: Function = ud.get_metatable()?.get(MetaMethod::Call)?;
            let mut full = args.into_vec();
            full.insert(0, Value::UserData(ud));
            call.call(MultiValue::from_vec(full))
        }
        other => Err(mlua::Error::runtime(format!("attempt to call a {} value", other.type_name()))),
    }
}

fn index_value<'lua>(target: Value<'lua>, key: Value<'lua>) -> mlua::Result<Value<'lua>> {
    match target {
        Value::Table(table) => table.get(key),
        Value::UserData(ud) => {
            let index: Function = ud.get_metatable()?.get(MetaMethod::Index)?;
            index.call((ud, key))
        }
        other => Err(mlua::Error::runtime(format!("attempt to index a {} value", other.type_name()))),
    }
}

fn assign_value<'lua>(target: Value<'lua>, key: Value<'lua>, value: Value<'lua>) -> mlua::Result<()> {
    match target {
        Value::Table(table) => table.set(key, value),
        Value::UserData(ud) => {
            let new_index: Function = ud.get_metatable()?.get(MetaMethod::NewIndex)?;
            new_index.call((ud, key, value))
        }
        other => Err(mlua::Error::runtime(format!("attempt to index a {} value", other.type_name()))),
    }
}
