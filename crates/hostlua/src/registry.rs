// ============ Object registry ============
//
// Id-indexed table of every host value currently reachable from script
// space. The interpreter's collector cannot see host ownership, so each
// entry holds a strong reference until the foreign handle standing for it
// is finalized.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use ahash::RandomState;
use parking_lot::Mutex;
use smol_str::SmolStr;

use crate::error::{BridgeError, BridgeResult};
use crate::exporter::{HostFunction, HostModule};
use crate::names::{MethodRef, NameMapping};
use crate::reflect::{ReferenceMode, ShapeKind, validate_shape};
use crate::value::{HostRef, HostValue};

/// Traversal mode requested by `pairs` (keyed) or `ipairs` (indexed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairStyle {
    Keyed,
    Indexed,
}

/// A reflected method bound to one registered object. Usable once.
pub struct MethodInvoker {
    pub target_id: u64,
    pub target: HostRef,
    pub method: MethodRef,
    consumed: AtomicBool,
}

impl MethodInvoker {
    pub fn new(target_id: u64, target: HostRef, method: MethodRef) -> Self {
        Self {
            target_id,
            target,
            method,
            consumed: AtomicBool::new(false),
        }
    }

    /// Mark the invoker used; returns false if it already was.
    pub fn consume(&self) -> bool {
        !self.consumed.swap(true, Ordering::AcqRel)
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed.load(Ordering::Acquire)
    }
}

/// Position of a running `pairs`/`ipairs` loop over a registered object.
pub struct IterationCursor {
    pub target_id: u64,
    pub target: HostRef,
    pub mode: ReferenceMode,
    pub shape: ShapeKind,
    pub style: PairStyle,
    /// Mapping keys captured when the loop started
    pub keys: Vec<HostValue>,
    /// Field layout for record traversal
    pub fields: Option<Arc<NameMapping>>,
    position: AtomicUsize,
    emitted: AtomicUsize,
}

impl IterationCursor {
    pub fn new(
        target_id: u64,
        target: HostRef,
        shape: ShapeKind,
        style: PairStyle,
        keys: Vec<HostValue>,
        fields: Option<Arc<NameMapping>>,
    ) -> Self {
        let mode = target.mode();
        Self {
            target_id,
            target,
            mode,
            shape,
            style,
            keys,
            fields,
            position: AtomicUsize::new(0),
            emitted: AtomicUsize::new(0),
        }
    }

    /// Current zero-based position, advancing the cursor by one.
    pub fn advance(&self) -> usize {
        self.position.fetch_add(1, Ordering::AcqRel)
    }

    /// 1-based running count of produced pairs.
    pub fn emit(&self) -> i64 {
        self.emitted.fetch_add(1, Ordering::AcqRel) as i64 + 1
    }
}

pub enum Payload {
    Object(HostRef),
    Function(Arc<dyn HostFunction>),
    Module(Arc<dyn HostModule>),
    Method(MethodInvoker),
    Cursor(IterationCursor),
}

pub struct RegisteredObject {
    pub id: u64,
    pub payload: Payload,
    pub type_name: SmolStr,
    pub shape: ShapeKind,
    pub reference_mode: ReferenceMode,
    pub is_function: bool,
}

struct RegistryInner {
    next_id: u64,
    entries: HashMap<u64, Arc<RegisteredObject>, RandomState>,
}

/// Shared by every bridge that was handed the same `Arc`.
pub struct ObjectRegistry {
    inner: Mutex<RegistryInner>,
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                next_id: 1,
                entries: HashMap::with_hasher(RandomState::new()),
            }),
        }
    }

    /// Store `payload` under a fresh id.
    ///
    /// Host objects whose declared shape is not backed by the matching view
    /// are rejected before anything is stored.
    pub fn register(&self, payload: Payload) -> BridgeResult<u64> {
        let (type_name, shape, reference_mode, is_function) = describe_payload(&payload)?;

        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id = inner
            .next_id
            .checked_add(1)
            .ok_or_else(|| BridgeError::ContractViolation("registry ids exhausted".to_string()))?;
        inner.entries.insert(
            id,
            Arc::new(RegisteredObject {
                id,
                payload,
                type_name: type_name.clone(),
                shape,
                reference_mode,
                is_function,
            }),
        );
        drop(inner);

        tracing::trace!(id, %type_name, ?shape, "registered host object");
        Ok(id)
    }

    pub fn lookup(&self, id: u64) -> Option<Arc<RegisteredObject>> {
        self.inner.lock().entries.get(&id).cloned()
    }

    /// Drop the entry for `id`. Releasing an unknown id is a no-op.
    ///
    /// Returns whether an entry was removed. The payload itself is dropped
    /// after the registry lock is released.
    pub fn release(&self, id: u64) -> bool {
        let removed = self.inner.lock().entries.remove(&id);
        match removed {
            Some(entry) => {
                tracing::trace!(id, type_name = %entry.type_name, "released host object");
                drop(entry);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: u64) -> bool {
        self.inner.lock().entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn describe_payload(payload: &Payload) -> BridgeResult<(SmolStr, ShapeKind, ReferenceMode, bool)> {
    Ok(match payload {
        Payload::Object(obj) => {
            let shape = obj.with(|object| validate_shape(object)).unwrap_or_else(|| {
                Err(BridgeError::ContractViolation(format!(
                    "{} is no longer reachable",
                    obj.type_name()
                )))
            })?;
            (SmolStr::new(obj.type_name()), shape, obj.mode(), false)
        }
        Payload::Function(func) => (
            SmolStr::new(func.name()),
            ShapeKind::Callable,
            ReferenceMode::ByReference,
            true,
        ),
        Payload::Module(module) => (
            SmolStr::new(module.name()),
            ShapeKind::Callable,
            ReferenceMode::ByReference,
            false,
        ),
        Payload::Method(invoker) => (
            SmolStr::new(invoker.method.name),
            ShapeKind::Callable,
            invoker.target.mode(),
            true,
        ),
        Payload::Cursor(cursor) => (
            SmolStr::new_static("iterator"),
            ShapeKind::Callable,
            cursor.mode,
            true,
        ),
    })
}
