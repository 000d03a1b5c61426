// Shape model for host values exposed to scripts.
//
// Every host value that crosses into script space as a foreign handle
// describes itself through `HostObject`: one of the closed set of shapes
// below, plus the view that implements it. Records carry static metadata
// (`TypeDescriptor`) generated by `#[derive(HostRecord)]` and
// `#[host_methods]`; sequences and maps are implemented here for the
// standard collections.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::hash::{BuildHasher, Hash};

use crate::convert::{FromHost, IntoHost};
use crate::error::{BridgeError, BridgeResult};
use crate::value::HostValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShapeKind {
    Record,
    Sequence,
    Mapping,
    Callable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceMode {
    /// The registry owns a moved value; script writes are not seen by the host.
    ByValue,
    /// The registry shares the host's value; script writes are visible to the host.
    ByReference,
}

// ==================== Static metadata ====================

#[derive(Debug)]
pub struct FieldDescriptor {
    /// Declared field name
    pub name: &'static str,
    /// Tag-provided alternate name, matched verbatim
    pub alias: Option<&'static str>,
    pub readonly: bool,
    /// Descriptor of an embedded record whose fields are promoted into this one
    pub flatten: Option<fn() -> &'static TypeDescriptor>,
}

#[derive(Debug)]
pub struct MethodDescriptor {
    pub name: &'static str,
    pub alias: Option<&'static str>,
    /// Number of parameters, receiver excluded
    pub arity: usize,
}

#[derive(Debug)]
pub struct TypeDescriptor {
    pub type_name: &'static str,
    pub fields: &'static [FieldDescriptor],
    pub methods: fn() -> &'static [MethodDescriptor],
}

impl TypeDescriptor {
    pub fn methods(&self) -> &'static [MethodDescriptor] {
        (self.methods)()
    }
}

/// Static access to a record's descriptor, generated by `#[derive(HostRecord)]`.
pub trait Describe {
    fn describe() -> &'static TypeDescriptor;
}

/// Fallback for records without a `#[host_methods]` block.
///
/// `#[host_methods]` generates inherent functions with the same names, which
/// take precedence over these defaults when the derive calls `Self::__host_*`.
#[doc(hidden)]
pub trait MethodProvider {
    fn __host_methods() -> &'static [MethodDescriptor] {
        &[]
    }

    fn __host_invoke(&mut self, method: usize, _args: Vec<HostValue>) -> BridgeResult<Vec<HostValue>> {
        Err(BridgeError::Host(format!("no method with index {method}")))
    }
}

impl<T> MethodProvider for T {}

// ==================== Shape views ====================

pub trait Record {
    fn descriptor(&self) -> &'static TypeDescriptor;

    /// Read the field at `index` in `descriptor().fields`.
    fn get_field(&self, index: usize) -> Option<HostValue>;

    fn set_field(&mut self, index: usize, value: HostValue) -> BridgeResult<()>;

    /// The embedded record behind a flattened field.
    fn embedded(&self, _index: usize) -> Option<&dyn Record> {
        None
    }

    fn embedded_mut(&mut self, _index: usize) -> Option<&mut dyn Record> {
        None
    }

    /// The sequence, mapping or record stored in place in the field at `index`.
    ///
    /// Scripts reach such fields through handles bound to this record, so
    /// their writes land here instead of in a copy.
    fn field_object(&self, _index: usize) -> Option<&dyn HostObject> {
        None
    }

    fn field_object_mut(&mut self, _index: usize) -> Option<&mut dyn HostObject> {
        None
    }

    /// Invoke the method at `method` in `descriptor().methods()`.
    fn invoke(&mut self, method: usize, args: Vec<HostValue>) -> BridgeResult<Vec<HostValue>>;
}

pub trait Sequence {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Zero-based read.
    fn item(&self, index: usize) -> Option<HostValue>;

    /// Zero-based write; `index` must be below `len()`.
    fn set_item(&mut self, index: usize, value: HostValue) -> BridgeResult<()>;
}

/// Key/value view of a map.
///
/// Scripts delete entries by assigning nil, so a stored value that converts
/// to nil (a `None` in a map of `Option`s) cannot be written from a script;
/// the assignment removes the key instead.
pub trait Mapping {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Absent keys, and keys that do not convert to the key type, yield `None`.
    fn lookup(&self, key: HostValue) -> Option<HostValue>;

    fn upsert(&mut self, key: HostValue, value: HostValue) -> BridgeResult<()>;

    fn delete(&mut self, key: HostValue) -> BridgeResult<()>;

    /// Snapshot of the current keys, in the map's own iteration order.
    fn key_list(&self) -> Vec<HostValue>;
}

/// The composite stored in the field at `path`, walking flattened records first.
pub(crate) fn object_at<'a>(record: &'a dyn Record, path: &[usize]) -> Option<&'a dyn HostObject> {
    let (last, parents) = path.split_last()?;
    let mut current = record;
    for &index in parents {
        current = current.embedded(index)?;
    }
    current.field_object(*last)
}

pub(crate) fn object_at_mut<'a>(record: &'a mut dyn Record, path: &[usize]) -> Option<&'a mut dyn HostObject> {
    let (last, parents) = path.split_last()?;
    let mut current = record;
    for &index in parents {
        current = current.embedded_mut(index)?;
    }
    current.field_object_mut(*last)
}

/// A host value that can be handed to scripts as a foreign handle.
pub trait HostObject: Any + Send {
    fn type_name(&self) -> &'static str;

    fn shape(&self) -> ShapeKind;

    fn as_record(&self) -> Option<&dyn Record> {
        None
    }

    fn as_record_mut(&mut self) -> Option<&mut dyn Record> {
        None
    }

    fn as_sequence(&self) -> Option<&dyn Sequence> {
        None
    }

    fn as_sequence_mut(&mut self) -> Option<&mut dyn Sequence> {
        None
    }

    fn as_mapping(&self) -> Option<&dyn Mapping> {
        None
    }

    fn as_mapping_mut(&mut self) -> Option<&mut dyn Mapping> {
        None
    }

    fn as_any(&self) -> &dyn Any;
}

/// Check that an object's declared shape is backed by the matching view.
pub(crate) fn validate_shape(object: &dyn HostObject) -> BridgeResult<ShapeKind> {
    let shape = object.shape();
    let backed = match shape {
        ShapeKind::Record => object.as_record().is_some(),
        ShapeKind::Sequence => object.as_sequence().is_some(),
        ShapeKind::Mapping => object.as_mapping().is_some(),
        ShapeKind::Callable => false,
    };
    if backed {
        Ok(shape)
    } else {
        tracing::warn!(type_name = object.type_name(), ?shape, "rejecting malformed host object");
        Err(BridgeError::ContractViolation(format!(
            "{} declares shape {:?} without providing it",
            object.type_name(),
            shape
        )))
    }
}

// ==================== Opaque values ====================

static OPAQUE_DESCRIPTOR: TypeDescriptor = TypeDescriptor {
    type_name: "opaque",
    fields: &[],
    methods: no_methods,
};

fn no_methods() -> &'static [MethodDescriptor] {
    &[]
}

/// Wraps any host value as a record without members, so it can travel
/// through scripts untouched and come back to the host.
pub struct OpaqueValue<T>(pub T);

impl<T: Send + 'static> Record for OpaqueValue<T> {
    fn descriptor(&self) -> &'static TypeDescriptor {
        &OPAQUE_DESCRIPTOR
    }

    fn get_field(&self, _index: usize) -> Option<HostValue> {
        None
    }

    fn set_field(&mut self, index: usize, _value: HostValue) -> BridgeResult<()> {
        Err(BridgeError::no_such_member(std::any::type_name::<T>(), index.to_string()))
    }

    fn invoke(&mut self, method: usize, _args: Vec<HostValue>) -> BridgeResult<Vec<HostValue>> {
        Err(BridgeError::no_such_member(std::any::type_name::<T>(), method.to_string()))
    }
}

impl<T: Send + 'static> HostObject for OpaqueValue<T> {
    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn shape(&self) -> ShapeKind {
        ShapeKind::Record
    }

    fn as_record(&self) -> Option<&dyn Record> {
        Some(self)
    }

    fn as_record_mut(&mut self) -> Option<&mut dyn Record> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ==================== Sequences ====================

impl<T> Sequence for Vec<T>
where
    T: IntoHost + FromHost + Clone,
{
    fn len(&self) -> usize {
        Vec::len(self)
    }

    fn item(&self, index: usize) -> Option<HostValue> {
        self.as_slice().get(index).cloned().map(IntoHost::into_host)
    }

    fn set_item(&mut self, index: usize, value: HostValue) -> BridgeResult<()> {
        let len = Vec::len(self);
        match self.get_mut(index) {
            Some(slot) => {
                *slot = T::from_host(value)?;
                Ok(())
            }
            None => Err(BridgeError::IndexOutOfRange {
                index: index as i64 + 1,
                len,
            }),
        }
    }
}

impl<T> HostObject for Vec<T>
where
    T: IntoHost + FromHost + Clone + Send + 'static,
{
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    fn shape(&self) -> ShapeKind {
        ShapeKind::Sequence
    }

    fn as_sequence(&self) -> Option<&dyn Sequence> {
        Some(self)
    }

    fn as_sequence_mut(&mut self) -> Option<&mut dyn Sequence> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ==================== Mappings ====================

impl<K, V, S> Mapping for HashMap<K, V, S>
where
    K: IntoHost + FromHost + Clone + Eq + Hash,
    V: IntoHost + FromHost + Clone,
    S: BuildHasher,
{
    fn len(&self) -> usize {
        HashMap::len(self)
    }

    fn lookup(&self, key: HostValue) -> Option<HostValue> {
        let key = K::from_host(key).ok()?;
        HashMap::get(self, &key).cloned().map(IntoHost::into_host)
    }

    fn upsert(&mut self, key: HostValue, value: HostValue) -> BridgeResult<()> {
        HashMap::insert(self, K::from_host(key)?, V::from_host(value)?);
        Ok(())
    }

    fn delete(&mut self, key: HostValue) -> BridgeResult<()> {
        HashMap::remove(self, &K::from_host(key)?);
        Ok(())
    }

    fn key_list(&self) -> Vec<HostValue> {
        HashMap::keys(self).cloned().map(IntoHost::into_host).collect()
    }
}

impl<K, V, S> HostObject for HashMap<K, V, S>
where
    K: IntoHost + FromHost + Clone + Eq + Hash + Send + 'static,
    V: IntoHost + FromHost + Clone + Send + 'static,
    S: BuildHasher + Send + 'static,
{
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    fn shape(&self) -> ShapeKind {
        ShapeKind::Mapping
    }

    fn as_mapping(&self) -> Option<&dyn Mapping> {
        Some(self)
    }

    fn as_mapping_mut(&mut self) -> Option<&mut dyn Mapping> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl<K, V> Mapping for BTreeMap<K, V>
where
    K: IntoHost + FromHost + Clone + Ord,
    V: IntoHost + FromHost + Clone,
{
    fn len(&self) -> usize {
        BTreeMap::len(self)
    }

    fn lookup(&self, key: HostValue) -> Option<HostValue> {
        let key = K::from_host(key).ok()?;
        BTreeMap::get(self, &key).cloned().map(IntoHost::into_host)
    }

    fn upsert(&mut self, key: HostValue, value: HostValue) -> BridgeResult<()> {
        BTreeMap::insert(self, K::from_host(key)?, V::from_host(value)?);
        Ok(())
    }

    fn delete(&mut self, key: HostValue) -> BridgeResult<()> {
        BTreeMap::remove(self, &K::from_host(key)?);
        Ok(())
    }

    fn key_list(&self) -> Vec<HostValue> {
        BTreeMap::keys(self).cloned().map(IntoHost::into_host).collect()
    }
}

impl<K, V> HostObject for BTreeMap<K, V>
where
    K: IntoHost + FromHost + Clone + Ord + Send + 'static,
    V: IntoHost + FromHost + Clone + Send + 'static,
{
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    fn shape(&self) -> ShapeKind {
        ShapeKind::Mapping
    }

    fn as_mapping(&self) -> Option<&dyn Mapping> {
        Some(self)
    }

    fn as_mapping_mut(&mut self) -> Option<&mut dyn Mapping> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
