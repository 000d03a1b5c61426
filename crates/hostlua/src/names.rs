// Script-name to host-member resolution.
//
// A `NameMapping` is built once per record type from its static descriptor
// and cached for the life of the process. Fields of flattened records are
// promoted into the outer mapping; on a name collision the shallower member
// wins, and an explicit alias always beats a structural match.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use ahash::RandomState;
use parking_lot::RwLock;

use crate::reflect::TypeDescriptor;

/// A resolved field: the chain of field indices from the outer record.
///
/// All but the last index select flattened records via `Record::embedded`.
#[derive(Debug, Clone)]
pub struct FieldRef {
    pub name: &'static str,
    /// Name reported to scripts during iteration
    pub script_name: &'static str,
    pub path: Arc<[usize]>,
    pub readonly: bool,
    depth: usize,
}

#[derive(Debug, Clone)]
pub struct MethodRef {
    pub name: &'static str,
    alias: Option<&'static str>,
    /// Flattened records to walk through before invoking
    pub path: Arc<[usize]>,
    pub index: usize,
    pub arity: usize,
    depth: usize,
}

#[derive(Debug)]
pub struct NameMapping {
    type_name: &'static str,
    fields: Vec<FieldRef>,
    field_aliases: HashMap<&'static str, usize, RandomState>,
    field_names: HashMap<String, usize, RandomState>,
    methods: Vec<MethodRef>,
    method_aliases: HashMap<&'static str, usize, RandomState>,
    method_names: HashMap<String, usize, RandomState>,
}

impl NameMapping {
    pub fn build(desc: &'static TypeDescriptor) -> Self {
        let mut mapping = NameMapping {
            type_name: desc.type_name,
            fields: Vec::new(),
            field_aliases: HashMap::with_hasher(RandomState::new()),
            field_names: HashMap::with_hasher(RandomState::new()),
            methods: Vec::new(),
            method_aliases: HashMap::with_hasher(RandomState::new()),
            method_names: HashMap::with_hasher(RandomState::new()),
        };
        mapping.collect(desc, &[]);
        mapping.index();
        mapping
    }

    fn collect(&mut self, desc: &'static TypeDescriptor, prefix: &[usize]) {
        let depth = prefix.len();
        for (i, field) in desc.fields.iter().enumerate() {
            let mut path = prefix.to_vec();
            path.push(i);
            if let Some(embedded) = field.flatten {
                self.collect(embedded(), &path);
                continue;
            }
            self.fields.push(FieldRef {
                name: field.name,
                script_name: field.alias.unwrap_or(field.name),
                path: path.into(),
                readonly: field.readonly,
                depth,
            });
        }
        for (index, method) in desc.methods().iter().enumerate() {
            self.methods.push(MethodRef {
                name: method.name,
                alias: method.alias,
                path: prefix.into(),
                index,
                arity: method.arity,
                depth,
            });
        }
    }

    fn index(&mut self) {
        for (slot, field) in self.fields.iter().enumerate() {
            let depth = field.depth;
            if field.script_name != field.name {
                claim(&mut self.field_aliases, field.script_name, slot, depth, &self.fields, |f| f.depth);
            }
            claim(
                &mut self.field_names,
                field.name.to_uppercase(),
                slot,
                depth,
                &self.fields,
                |f| f.depth,
            );
        }
        for (slot, method) in self.methods.iter().enumerate() {
            if let Some(alias) = method.alias {
                claim(&mut self.method_aliases, alias, slot, method.depth, &self.methods, |m| m.depth);
            }
            claim(
                &mut self.method_names,
                method.name.to_uppercase(),
                slot,
                method.depth,
                &self.methods,
                |m| m.depth,
            );
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Fields in declaration order, flattened records expanded in place.
    pub fn fields(&self) -> &[FieldRef] {
        &self.fields
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn methods(&self) -> &[MethodRef] {
        &self.methods
    }

    /// Alias first, then case-insensitive declared name, then the
    /// snake_case form of a camelCase script name.
    pub fn field(&self, script_name: &str) -> Option<&FieldRef> {
        if let Some(&slot) = self.field_aliases.get(script_name) {
            return Some(&self.fields[slot]);
        }
        lookup_folded(&self.field_names, script_name).map(|slot| &self.fields[slot])
    }

    pub fn method(&self, script_name: &str) -> Option<&MethodRef> {
        if let Some(&slot) = self.method_aliases.get(script_name) {
            return Some(&self.methods[slot]);
        }
        if let Some(method) = self.methods.iter().find(|m| m.name == script_name) {
            return Some(method);
        }
        lookup_folded(&self.method_names, script_name).map(|slot| &self.methods[slot])
    }
}

/// Insert `key -> slot` unless a shallower (or equally deep, earlier) entry holds it.
fn claim<K, T>(
    map: &mut HashMap<K, usize, RandomState>,
    key: K,
    slot: usize,
    depth: usize,
    entries: &[T],
    depth_of: impl Fn(&T) -> usize,
) where
    K: std::hash::Hash + Eq,
{
    match map.get(&key) {
        Some(&existing) if depth_of(&entries[existing]) <= depth => {}
        _ => {
            map.insert(key, slot);
        }
    }
}

fn lookup_folded(map: &HashMap<String, usize, RandomState>, script_name: &str) -> Option<usize> {
    map.get(&script_name.to_uppercase())
        .or_else(|| map.get(&to_snake_case(script_name).to_uppercase()))
        .copied()
}

/// `itemCount` / `ItemCount` -> `item_count`.
pub fn to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;
    for ch in name.chars() {
        if ch.is_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
            prev_lower = false;
        } else {
            out.push(ch);
            prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
        }
    }
    out
}

// ==================== Process-wide cache ====================

/// Lazily populated, never invalidated store of name mappings.
///
/// Readers only take a shared lock; a mapping is built outside any lock and
/// the first writer to insert it wins.
pub struct NameCache {
    mappings: RwLock<HashMap<usize, Arc<NameMapping>, RandomState>>,
}

impl Default for NameCache {
    fn default() -> Self {
        Self::new()
    }
}

impl NameCache {
    pub fn new() -> Self {
        Self {
            mappings: RwLock::new(HashMap::with_hasher(RandomState::new())),
        }
    }

    pub fn global() -> Arc<NameCache> {
        static GLOBAL: OnceLock<Arc<NameCache>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(NameCache::new())))
    }

    pub fn mapping(&self, desc: &'static TypeDescriptor) -> Arc<NameMapping> {
        let key = desc as *const TypeDescriptor as usize;
        if let Some(found) = self.mappings.read().get(&key) {
            return Arc::clone(found);
        }

        let built = NameMapping::build(desc);
        tracing::trace!(type_name = desc.type_name, fields = built.field_count(), "built name mapping");

        let mut mappings = self.mappings.write();
        Arc::clone(mappings.entry(key).or_insert_with(|| Arc::new(built)))
    }

    pub fn len(&self) -> usize {
        self.mappings.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolves script member names against host record types.
#[derive(Clone)]
pub struct NameResolver {
    cache: Arc<NameCache>,
}

impl NameResolver {
    pub fn new(cache: Arc<NameCache>) -> Self {
        Self { cache }
    }

    pub fn mapping(&self, desc: &'static TypeDescriptor) -> Arc<NameMapping> {
        self.cache.mapping(desc)
    }

    pub fn resolve_field(&self, desc: &'static TypeDescriptor, script_name: &str) -> Option<FieldRef> {
        self.mapping(desc).field(script_name).cloned()
    }

    pub fn resolve_method(&self, desc: &'static TypeDescriptor, script_name: &str) -> Option<MethodRef> {
        self.mapping(desc).method(script_name).cloned()
    }
}
