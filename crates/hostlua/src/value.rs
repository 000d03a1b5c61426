// Values exchanged between host code and scripts

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::exporter::HostFunction;
use crate::protocol::read_path;
use crate::reflect::{HostObject, ReferenceMode, object_at, object_at_mut};

/// A host value on its way into, or out of, script space.
#[derive(Clone)]
pub enum HostValue {
    Nil,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    Object(HostRef),
    Function(Arc<dyn HostFunction>),
}

impl HostValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            HostValue::Nil => "nil",
            HostValue::Bool(_) => "boolean",
            HostValue::Int(_) | HostValue::UInt(_) | HostValue::Float(_) => "number",
            HostValue::Str(_) => "string",
            HostValue::Object(obj) => obj.type_name(),
            HostValue::Function(_) => "function",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, HostValue::Nil)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HostValue::Int(i) => Some(*i),
            HostValue::UInt(u) => Some(*u as i64),
            HostValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HostValue::Int(i) => Some(*i as f64),
            HostValue::UInt(u) => Some(*u as f64),
            HostValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&HostRef> {
        match self {
            HostValue::Object(obj) => Some(obj),
            _ => None,
        }
    }
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostValue::Nil => write!(f, "Nil"),
            HostValue::Bool(b) => write!(f, "Bool({b})"),
            HostValue::Int(i) => write!(f, "Int({i})"),
            HostValue::UInt(u) => write!(f, "UInt({u})"),
            HostValue::Float(n) => write!(f, "Float({n})"),
            HostValue::Str(s) => write!(f, "Str({s:?})"),
            HostValue::Object(obj) => write!(f, "Object({})", obj.type_name()),
            HostValue::Function(func) => write!(f, "Function({})", func.name()),
        }
    }
}

/// Primitives compare by value (all numeric kinds compare numerically),
/// objects and functions by identity.
impl PartialEq for HostValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (HostValue::Nil, HostValue::Nil) => true,
            (HostValue::Bool(a), HostValue::Bool(b)) => a == b,
            (HostValue::Str(a), HostValue::Str(b)) => a == b,
            (HostValue::Object(a), HostValue::Object(b)) => a.ptr_eq(b),
            (HostValue::Function(a), HostValue::Function(b)) => {
                std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
            }
            (HostValue::Int(a), HostValue::Int(b)) => a == b,
            (HostValue::UInt(a), HostValue::UInt(b)) => a == b,
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
        }
    }
}

/// The script-visible union. Every numeric kind collapses into `Number`.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptValue {
    Nil,
    Bool(bool),
    Number(f64),
    String(String),
    Foreign(u64),
}

// ==================== Shared host objects ====================

/// A host value shared with scripts by reference.
///
/// Script writes through a handle to a `Shared<T>` are visible to every
/// clone held by the host.
pub struct Shared<T>(Arc<Mutex<T>>);

impl<T> Shared<T> {
    pub fn new(value: T) -> Self {
        Shared(Arc::new(Mutex::new(value)))
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.0.lock()
    }

    pub fn ptr_eq(&self, other: &Shared<T>) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Shared(Arc::clone(&self.0))
    }
}

impl<T: fmt::Debug> fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Shared").field(&*self.0.lock()).finish()
    }
}

impl<T: HostObject> Shared<T> {
    pub fn to_host_ref(&self) -> HostRef {
        HostRef::from_arc(Arc::clone(&self.0), ReferenceMode::ByReference)
    }
}

/// Field paths leading from a registered root to a composite stored inside it.
type Route = Arc<[Arc<[usize]>]>;

/// Type-erased handle to a host object living in the object registry.
///
/// A ref either stands for a whole registered object or, when it carries a
/// route, for a sequence, mapping or record stored in one of that object's
/// fields. Field refs lock the owner and walk the route on every access, so
/// script writes through them land in the owner.
#[derive(Clone)]
pub struct HostRef {
    object: Arc<Mutex<dyn HostObject>>,
    typed: Arc<dyn Any + Send + Sync>,
    mode: ReferenceMode,
    type_name: &'static str,
    route: Route,
}

impl HostRef {
    /// Move `value` into a new shared cell owned by whoever holds the ref.
    pub fn by_value<T: HostObject>(value: T) -> Self {
        Self::from_arc(Arc::new(Mutex::new(value)), ReferenceMode::ByValue)
    }

    pub fn by_reference<T: HostObject>(shared: &Shared<T>) -> Self {
        shared.to_host_ref()
    }

    fn from_arc<T: HostObject>(cell: Arc<Mutex<T>>, mode: ReferenceMode) -> Self {
        let type_name = cell.lock().type_name();
        let typed: Arc<dyn Any + Send + Sync> = cell.clone();
        HostRef {
            object: cell,
            typed,
            mode,
            type_name,
            route: Arc::from(Vec::new()),
        }
    }

    /// A ref to the composite stored in the field at `path` of this record.
    ///
    /// `None` when the field holds no sequence, mapping or record in place.
    pub(crate) fn field(&self, path: Arc<[usize]>) -> Option<HostRef> {
        let route: Route = self.route.iter().cloned().chain(std::iter::once(path)).collect();
        let type_name = {
            let guard = self.object.lock();
            locate(&*guard, &route)?.type_name()
        };
        Some(HostRef {
            object: Arc::clone(&self.object),
            typed: Arc::clone(&self.typed),
            mode: self.mode,
            type_name,
            route,
        })
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn mode(&self) -> ReferenceMode {
        self.mode
    }

    /// Whether this ref stands for a value stored in a field of another object.
    pub fn is_field(&self) -> bool {
        !self.route.is_empty()
    }

    /// Run `f` against the object while holding its lock.
    ///
    /// Returns `None` if the object can no longer be reached. Never call back
    /// into the interpreter from `f`.
    pub fn with<R>(&self, f: impl FnOnce(&dyn HostObject) -> R) -> Option<R> {
        let guard = self.object.lock();
        locate(&*guard, &self.route).map(f)
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut dyn HostObject) -> R) -> Option<R> {
        let mut guard = self.object.lock();
        locate_mut(&mut *guard, &self.route).map(f)
    }

    /// The value this ref stands for, as host code should receive it.
    ///
    /// Field refs are resolved to a by-value copy of the field, since their
    /// storage belongs to the owner.
    pub fn detach(&self) -> HostValue {
        let Some((last, parents)) = self.route.split_last() else {
            return HostValue::Object(self.clone());
        };
        let guard = self.object.lock();
        locate(&*guard, parents)
            .and_then(|owner| owner.as_record())
            .and_then(|record| read_path(record, last))
            .unwrap_or(HostValue::Nil)
    }

    pub fn ptr_eq(&self, other: &HostRef) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.object), Arc::as_ptr(&other.object)) && *self.route == *other.route
    }

    /// Whether both refs reach into the same underlying object.
    pub(crate) fn shares_owner(&self, other: &HostRef) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.object), Arc::as_ptr(&other.object))
    }

    pub fn is<T: HostObject>(&self) -> bool {
        !self.is_field() && self.typed.is::<Mutex<T>>()
    }

    /// Recover the typed cell, sharing it rather than copying it.
    ///
    /// Field refs have no cell of their own and never downcast.
    pub fn downcast<T: HostObject>(&self) -> Option<Shared<T>> {
        if self.is_field() {
            return None;
        }
        Arc::clone(&self.typed)
            .downcast::<Mutex<T>>()
            .ok()
            .map(Shared)
    }
}

fn locate<'a>(object: &'a dyn HostObject, route: &[Arc<[usize]>]) -> Option<&'a dyn HostObject> {
    match route.split_first() {
        None => Some(object),
        Some((path, rest)) => locate(object_at(object.as_record()?, path)?, rest),
    }
}

fn locate_mut<'a>(object: &'a mut dyn HostObject, route: &[Arc<[usize]>]) -> Option<&'a mut dyn HostObject> {
    match route.split_first() {
        None => Some(object),
        Some((path, rest)) => locate_mut(object_at_mut(object.as_record_mut()?, path)?, rest),
    }
}

impl fmt::Debug for HostRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostRef")
            .field("type_name", &self.type_name)
            .field("mode", &self.mode)
            .field("route", &self.route)
            .finish()
    }
}
