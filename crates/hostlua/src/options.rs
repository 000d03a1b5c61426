// Bridge configuration

use std::sync::Arc;

use mlua::StdLib;

use crate::names::NameCache;
use crate::registry::ObjectRegistry;

/// Standard libraries that can be opened in a bridge's interpreter.
///
/// The base library is always present. The debug library is never opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stdlib {
    Io,
    Os,
    Math,
    String,
    Table,
    Basic,
    Package,
    Utf8,
    Coroutine,

    All,
}

impl Stdlib {
    pub(crate) fn to_flags(self) -> StdLib {
        match self {
            Stdlib::Io => StdLib::IO,
            Stdlib::Os => StdLib::OS,
            Stdlib::Math => StdLib::MATH,
            Stdlib::String => StdLib::STRING,
            Stdlib::Table => StdLib::TABLE,
            Stdlib::Basic => StdLib::NONE,
            Stdlib::Package => StdLib::PACKAGE,
            Stdlib::Utf8 => StdLib::UTF8,
            Stdlib::Coroutine => StdLib::COROUTINE,
            Stdlib::All => StdLib::ALL_SAFE,
        }
    }
}

#[derive(Clone)]
pub struct BridgeOptions {
    pub libs: Vec<Stdlib>,
    /// Interpreter memory limit in bytes
    pub memory_limit: Option<usize>,
    /// Reject writes to unknown or read-only record fields instead of ignoring them.
    pub strict_writes: bool,
    /// Registry shared with other bridges; a private one is created when absent.
    pub registry: Option<Arc<ObjectRegistry>>,
    /// Name cache; the process-wide cache is used when absent.
    pub names: Option<Arc<NameCache>>,
    /// Chunk name used by `load_and_run` when the caller passes an empty one.
    pub default_chunk_name: String,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            libs: vec![Stdlib::All],
            memory_limit: None,
            strict_writes: false,
            registry: None,
            names: None,
            default_chunk_name: "chunk".to_string(),
        }
    }
}

impl BridgeOptions {
    /// Options matching `Bridge::new(load_default_libs)`.
    pub fn with_default_libs(load_default_libs: bool) -> Self {
        let libs = if load_default_libs {
            vec![Stdlib::All]
        } else {
            vec![Stdlib::Basic]
        };
        Self {
            libs,
            ..Self::default()
        }
    }

    pub fn with_libs(mut self, libs: &[Stdlib]) -> Self {
        self.libs = libs.to_vec();
        self
    }

    pub fn with_memory_limit(mut self, limit: usize) -> Self {
        self.memory_limit = Some(limit);
        self
    }

    pub fn with_strict_writes(mut self, strict: bool) -> Self {
        self.strict_writes = strict;
        self
    }

    pub fn with_registry(mut self, registry: Arc<ObjectRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_names(mut self, names: Arc<NameCache>) -> Self {
        self.names = Some(names);
        self
    }

    pub(crate) fn std_flags(&self) -> StdLib {
        self.libs
            .iter()
            .fold(StdLib::NONE, |flags, lib| flags | lib.to_flags())
    }
}
