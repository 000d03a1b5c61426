// Host-facing entry point: one interpreter plus the bridge state wired into it

use std::sync::Arc;

use mlua::Value;

use crate::convert::{self, FromHost, IntoHost, host_to_lua, lua_to_host, lua_to_script};
use crate::decode::TableDecoder;
use crate::engine::{MULTRET, ScriptEngine};
use crate::error::{BridgeError, BridgeResult};
use crate::exporter::{self, HostFunction, HostModule};
use crate::names::{NameCache, NameResolver};
use crate::options::BridgeOptions;
use crate::protocol::{self, BridgeContext};
use crate::reflect::Record;
use crate::registry::ObjectRegistry;
use crate::value::{HostValue, ScriptValue};

/// A script interpreter with host values, functions and modules bridged in.
///
/// A bridge is meant to be driven from one thread at a time. Several bridges
/// may share an [`ObjectRegistry`] (see [`BridgeOptions::with_registry`]) and
/// run on different threads.
pub struct Bridge {
    engine: ScriptEngine,
    ctx: Arc<BridgeContext>,
    default_chunk_name: String,
}

impl Bridge {
    pub fn new(load_default_libs: bool) -> BridgeResult<Self> {
        Self::with_options(BridgeOptions::with_default_libs(load_default_libs))
    }

    pub fn with_options(options: BridgeOptions) -> BridgeResult<Self> {
        let engine = ScriptEngine::new(&options)?;
        let registry = options.registry.clone().unwrap_or_default();
        let names = NameResolver::new(options.names.clone().unwrap_or_else(NameCache::global));
        let ctx = Arc::new(BridgeContext {
            registry,
            names,
            strict_writes: options.strict_writes,
        });
        protocol::install(engine.lua(), Arc::clone(&ctx))?;

        tracing::debug!(
            libs = ?options.libs,
            memory_limit = ?options.memory_limit,
            strict_writes = options.strict_writes,
            "bridge created"
        );
        Ok(Self {
            engine,
            ctx,
            default_chunk_name: options.default_chunk_name,
        })
    }

    pub fn engine(&self) -> &ScriptEngine {
        &self.engine
    }

    pub fn registry(&self) -> &Arc<ObjectRegistry> {
        &self.ctx.registry
    }

    pub fn names(&self) -> &NameResolver {
        &self.ctx.names
    }

    // ==================== Values ====================

    /// Push a host value; composites are registered and pushed as foreign handles.
    pub fn push_value(&self, value: impl IntoHost) -> BridgeResult<()> {
        let value = host_to_lua(self.engine.lua(), &self.ctx, value.into_host())?;
        self.engine.push_lua(value)
    }

    /// Push a composite host value. Anything else is a contract violation.
    pub fn push_object(&self, value: impl IntoHost) -> BridgeResult<()> {
        match value.into_host() {
            value @ HostValue::Object(_) => self.push_value(value),
            other => {
                tracing::warn!(found = other.type_name(), "refusing to push a non-composite as a host object");
                Err(BridgeError::ContractViolation(format!(
                    "a {} is not a record, sequence or mapping",
                    other.type_name()
                )))
            }
        }
    }

    pub fn read_value(&self, index: i32) -> BridgeResult<HostValue> {
        lua_to_host(&self.ctx, self.engine.value_at(index)?)
    }

    pub fn read_as<T: FromHost>(&self, index: i32) -> BridgeResult<T> {
        T::from_host(self.read_value(index)?)
    }

    pub fn script_to_host(&self, value: ScriptValue) -> BridgeResult<HostValue> {
        convert::script_to_host(&self.ctx, value)
    }

    /// Convert a host value to its script form.
    ///
    /// The converted value is pushed and left on the stack, so a foreign
    /// handle produced here stays reachable until the caller pops it.
    pub fn host_to_script(&self, value: impl IntoHost) -> BridgeResult<ScriptValue> {
        self.push_value(value)?;
        lua_to_script(&self.engine.value_at(-1)?)
    }

    // ==================== Exports ====================

    /// Bind `func` to the global named by `func.name()`.
    pub fn export_function(&self, func: Arc<dyn HostFunction>) -> BridgeResult<()> {
        exporter::export_function(self.engine.lua(), &self.ctx, func)
    }

    /// Bind `module` to the global named by `module.name()`.
    pub fn export_module(&self, module: Arc<dyn HostModule>) -> BridgeResult<()> {
        exporter::export_module(self.engine.lua(), &self.ctx, module)
    }

    // ==================== Running scripts ====================

    /// Load and run a chunk, leaving its results on the stack.
    ///
    /// Returns the number of results. An empty `chunk_name` falls back to
    /// the configured default.
    pub fn load_and_run(&self, source: &str, chunk_name: &str) -> BridgeResult<usize> {
        let chunk_name = if chunk_name.is_empty() {
            self.default_chunk_name.as_str()
        } else {
            chunk_name
        };
        self.engine.load_code(source, chunk_name)?;
        let results = self.engine.protected_call(0, MULTRET)?;
        tracing::trace!(chunk = chunk_name, results, "chunk finished");
        Ok(results)
    }

    /// Call the global function `name` and collect its results.
    ///
    /// The stack is left as it was found.
    pub fn call_global(&self, name: &str, args: Vec<HostValue>) -> BridgeResult<Vec<HostValue>> {
        let base = self.engine.get_top();
        let result = self.call_global_at(base, name, args);
        self.engine.set_top(base as i32);
        result
    }

    fn call_global_at(&self, base: usize, name: &str, args: Vec<HostValue>) -> BridgeResult<Vec<HostValue>> {
        self.engine.get_global(name)?;
        let nargs = args.len();
        for arg in args {
            self.push_value(arg)?;
        }
        let count = self.engine.protected_call(nargs, MULTRET)?;
        (1..=count)
            .map(|i| self.read_value((base + i) as i32))
            .collect()
    }

    // ==================== Decoding ====================

    /// Decode the table at `index` with a host-implemented decoder.
    pub fn read_into_record<T: TableDecoder + ?Sized>(&self, target: &mut T, index: i32) -> BridgeResult<()> {
        if !self.engine.is_table(index) {
            return Err(BridgeError::type_mismatch("table", self.engine.type_name(index)));
        }
        let base = self.engine.get_top();
        self.engine.push_copy(index)?;
        let result = target.decode_table(&self.engine);
        self.engine.set_top(base as i32);
        result
    }

    /// Copy the entries of the table at `index` into the fields of `target`.
    ///
    /// Keys are resolved like script member names. Keys naming no writable
    /// field are skipped.
    pub fn read_into<R: Record>(&self, target: &mut R, index: i32) -> BridgeResult<()> {
        let table = match self.engine.value_at(index)? {
            Value::Table(table) => table,
            other => return Err(BridgeError::type_mismatch("table", other.type_name())),
        };
        let mapping = self.ctx.names.mapping(target.descriptor());

        for pair in table.pairs::<Value, Value>() {
            let (key, value) = pair?;
            let Value::String(key) = key else {
                continue;
            };
            let key = key.to_str()?;
            let Some(field) = mapping.field(key).filter(|field| !field.readonly) else {
                tracing::debug!(type_name = mapping.type_name(), key, "skipping table entry");
                continue;
            };
            let value = lua_to_host(&self.ctx, value).map_err(|err| match err {
                BridgeError::TypeMismatch { expected, found } => BridgeError::TypeMismatch {
                    expected: format!("{expected} for field '{}'", field.name),
                    found,
                },
                other => other,
            })?;
            protocol::write_path(&mut *target, &field.path, value)?;
        }
        Ok(())
    }

    /// Deserialize the value at `index` through serde.
    #[cfg(feature = "serde")]
    pub fn read_serde<T: serde::de::DeserializeOwned>(&self, index: i32) -> BridgeResult<T> {
        use mlua::LuaSerdeExt;

        let value = self.engine.value_at(index)?;
        Ok(self.engine.lua().from_value(value)?)
    }
}
