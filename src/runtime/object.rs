//! The runtime object model.
//!
//! The VM requires one uniform capability contract from every object:
//! property get/set/delete, callability, constructibility, and a private
//! field table. It never special-cases concrete built-in shapes beyond
//! arrays (which back `for-of`, `arguments`, and array literals).

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use super::value::Value;

/// A shared handle to a heap object.
///
/// Handles are `Send + Sync`; the single-threaded-per-VM execution
/// discipline, not the lock, is what keeps mutation races away.
#[derive(Debug, Clone)]
pub struct ObjRef(Arc<RwLock<JsObject>>);

impl ObjRef {
    /// Allocates a plain object.
    pub fn new(proto: Option<ObjRef>) -> Self {
        ObjRef(Arc::new(RwLock::new(JsObject {
            props: OrderedProps::default(),
            proto,
            kind: ObjectKind::Plain,
            private: FxHashMap::default(),
        })))
    }

    /// Allocates an array backed by the given elements.
    pub fn array(elements: Vec<Value>) -> Self {
        ObjRef(Arc::new(RwLock::new(JsObject {
            props: OrderedProps::default(),
            proto: None,
            kind: ObjectKind::Array(elements),
            private: FxHashMap::default(),
        })))
    }

    /// Identity comparison.
    pub fn ptr_eq(&self, other: &ObjRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Whether this object is array-backed.
    pub fn is_array(&self) -> bool {
        matches!(self.0.read().kind, ObjectKind::Array(_))
    }

    /// Reads a property, walking the prototype chain. Array indexes and
    /// `length` resolve against the element backing first.
    pub fn get(&self, key: &str) -> Option<Value> {
        let guard = self.0.read();
        if let ObjectKind::Array(elements) = &guard.kind {
            if key == "length" {
                return Some(Value::Number(elements.len() as f64));
            }
            if let Some(index) = array_index(key) {
                return Some(elements.get(index).cloned().unwrap_or(Value::Undefined));
            }
        }
        if let Some(value) = guard.props.get(key) {
            return Some(value);
        }
        let proto = guard.proto.clone();
        drop(guard);
        proto.and_then(|p| p.get(key))
    }

    /// Writes an own property (or array element).
    pub fn set(&self, key: &str, value: Value) {
        let mut guard = self.0.write();
        if let ObjectKind::Array(elements) = &mut guard.kind {
            if let Some(index) = array_index(key) {
                if index >= elements.len() {
                    elements.resize(index + 1, Value::Undefined);
                }
                elements[index] = value;
                return;
            }
        }
        guard.props.set(key, value);
    }

    /// Deletes an own property; returns whether the property is gone.
    pub fn delete(&self, key: &str) -> bool {
        let mut guard = self.0.write();
        if let ObjectKind::Array(elements) = &mut guard.kind {
            if let Some(index) = array_index(key) {
                if index < elements.len() {
                    elements[index] = Value::Undefined;
                }
                return true;
            }
        }
        guard.props.delete(key);
        true
    }

    /// `in`-operator membership: own properties or anywhere on the
    /// prototype chain.
    pub fn has_property(&self, key: &str) -> bool {
        let guard = self.0.read();
        if let ObjectKind::Array(elements) = &guard.kind {
            if key == "length" {
                return true;
            }
            if let Some(index) = array_index(key) {
                return index < elements.len();
            }
        }
        if guard.props.get(key).is_some() {
            return true;
        }
        let proto = guard.proto.clone();
        drop(guard);
        proto.is_some_and(|p| p.has_property(key))
    }

    /// Own enumerable keys in insertion order; array indexes first.
    pub fn own_keys(&self) -> Vec<String> {
        let guard = self.0.read();
        let mut keys = Vec::new();
        if let ObjectKind::Array(elements) = &guard.kind {
            for i in 0..elements.len() {
                keys.push(i.to_string());
            }
        }
        keys.extend(guard.props.keys());
        keys
    }

    /// The prototype link.
    pub fn proto(&self) -> Option<ObjRef> {
        self.0.read().proto.clone()
    }

    /// The array elements, cloned, when array-backed.
    pub fn elements(&self) -> Option<Vec<Value>> {
        match &self.0.read().kind {
            ObjectKind::Array(elements) => Some(elements.clone()),
            ObjectKind::Plain => None,
        }
    }

    /// Element access by index for array-backed objects.
    pub fn element(&self, index: usize) -> Option<Value> {
        match &self.0.read().kind {
            ObjectKind::Array(elements) => elements.get(index).cloned(),
            ObjectKind::Plain => None,
        }
    }

    /// Array length, when array-backed.
    pub fn len(&self) -> Option<usize> {
        match &self.0.read().kind {
            ObjectKind::Array(elements) => Some(elements.len()),
            ObjectKind::Plain => None,
        }
    }

    /// Joins array elements with commas (Array#toString behavior).
    pub fn join_elements(&self) -> String {
        match &self.0.read().kind {
            ObjectKind::Array(elements) => elements
                .iter()
                .map(|v| if v.is_nullish() { String::new() } else { v.to_js_string() })
                .collect::<Vec<_>>()
                .join(","),
            ObjectKind::Plain => String::new(),
        }
    }

    /// Reads a private field by its (class brand, slot) key.
    pub fn private_get(&self, key: (u64, u16)) -> Option<Value> {
        self.0.read().private.get(&key).cloned()
    }

    /// Defines or overwrites a private field.
    pub fn private_set(&self, key: (u64, u16), value: Value) {
        self.0.write().private.insert(key, value);
    }

    /// Whether the object carries the private field (brand check).
    pub fn private_has(&self, key: (u64, u16)) -> bool {
        self.0.read().private.contains_key(&key)
    }
}

/// The object payload behind an [`ObjRef`].
#[derive(Debug)]
pub struct JsObject {
    props: OrderedProps,
    proto: Option<ObjRef>,
    kind: ObjectKind,
    /// Private fields, keyed by (environment serial, field index).
    private: FxHashMap<(u64, u16), Value>,
}

/// The backing shape of an object.
#[derive(Debug)]
enum ObjectKind {
    /// An ordinary property bag.
    Plain,
    /// Indexed element storage (arrays, `arguments`).
    Array(Vec<Value>),
}

/// A property map preserving insertion order for enumeration.
#[derive(Debug, Default)]
struct OrderedProps {
    entries: Vec<Option<(String, Value)>>,
    index: FxHashMap<String, usize>,
}

impl OrderedProps {
    fn get(&self, key: &str) -> Option<Value> {
        let &slot = self.index.get(key)?;
        self.entries[slot].as_ref().map(|(_, v)| v.clone())
    }

    fn set(&mut self, key: &str, value: Value) {
        if let Some(&slot) = self.index.get(key) {
            self.entries[slot] = Some((key.to_string(), value));
        } else {
            self.index.insert(key.to_string(), self.entries.len());
            self.entries.push(Some((key.to_string(), value)));
        }
    }

    fn delete(&mut self, key: &str) {
        if let Some(slot) = self.index.remove(key) {
            self.entries[slot] = None;
        }
    }

    fn keys(&self) -> impl Iterator<Item = String> + '_ {
        self.entries.iter().flatten().map(|(k, _)| k.clone())
    }
}

/// Parses a canonical array index.
fn array_index(key: &str) -> Option<usize> {
    if key.is_empty() || (key.len() > 1 && key.starts_with('0')) {
        return None;
    }
    key.parse::<usize>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_set_delete() {
        let obj = ObjRef::new(None);
        assert_eq!(obj.get("x"), None);
        obj.set("x", Value::Number(1.0));
        assert_eq!(obj.get("x"), Some(Value::Number(1.0)));
        obj.delete("x");
        assert_eq!(obj.get("x"), None);
    }

    #[test]
    fn test_prototype_chain_lookup() {
        let proto = ObjRef::new(None);
        proto.set("shared", Value::Number(7.0));
        let obj = ObjRef::new(Some(proto));
        assert_eq!(obj.get("shared"), Some(Value::Number(7.0)));
        assert!(obj.has_property("shared"));
        // Writes stay own.
        obj.set("shared", Value::Number(8.0));
        assert_eq!(obj.get("shared"), Some(Value::Number(8.0)));
        assert_eq!(obj.proto().unwrap().get("shared"), Some(Value::Number(7.0)));
    }

    #[test]
    fn test_array_elements_and_length() {
        let arr = ObjRef::array(vec![Value::Number(1.0), Value::Number(2.0)]);
        assert_eq!(arr.get("0"), Some(Value::Number(1.0)));
        assert_eq!(arr.get("length"), Some(Value::Number(2.0)));
        arr.set("4", Value::Number(5.0));
        assert_eq!(arr.get("length"), Some(Value::Number(5.0)));
        assert_eq!(arr.get("2"), Some(Value::Undefined));
    }

    #[test]
    fn test_own_keys_insertion_order() {
        let obj = ObjRef::new(None);
        obj.set("b", Value::Number(1.0));
        obj.set("a", Value::Number(2.0));
        obj.set("c", Value::Number(3.0));
        obj.delete("a");
        assert_eq!(obj.own_keys(), vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_private_fields_keyed_by_brand() {
        let obj = ObjRef::new(None);
        obj.private_set((1, 0), Value::Number(42.0));
        assert!(obj.private_has((1, 0)));
        assert!(!obj.private_has((2, 0)));
        assert_eq!(obj.private_get((1, 0)), Some(Value::Number(42.0)));
    }

    #[test]
    fn test_array_index_rejects_noncanonical() {
        assert_eq!(array_index("0"), Some(0));
        assert_eq!(array_index("10"), Some(10));
        assert_eq!(array_index("01"), None);
        assert_eq!(array_index("x"), None);
    }
}
