//! Heap-resident variable frames (stashes) and private-name environments.
//!
//! A stash backs the bindings of one scope activation that outlive or escape
//! their call frame. Stashes form a chain through `outer`; a closure captures
//! only the chain head at its creation, so captured variables are shared by
//! reference across every closure and invocation that can reach them. A
//! `with` scope contributes a slotless stash backed by an object, making the
//! whole region resolvable only by name at runtime.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::compiler::{PrivateTemplate, StashTemplate};
use crate::runtime::object::ObjRef;
use crate::runtime::value::Value;

/// Shared handle to one stash. Ownership belongs to whoever can still reach
/// it (live closures or active frames), not to the call stack.
pub type StashRef = Arc<RwLock<Stash>>;

/// One heap-resident variable frame.
#[derive(Debug)]
pub struct Stash {
    /// Slot storage; slots are born uninitialized.
    values: Vec<Value>,
    /// Slot layout, shared with the compiled program.
    template: Option<Arc<StashTemplate>>,
    /// For `with` scopes: the object that backs name resolution instead of
    /// slots.
    with_object: Option<ObjRef>,
    /// The enclosing stash.
    pub outer: Option<StashRef>,
}

impl Stash {
    /// Creates a slotted stash from a compile-time template.
    pub fn from_template(template: Arc<StashTemplate>, outer: Option<StashRef>) -> StashRef {
        Arc::new(RwLock::new(Stash {
            values: vec![Value::Uninit; template.size as usize],
            template: Some(template),
            with_object: None,
            outer,
        }))
    }

    /// Creates a dynamic stash backed by a `with` object.
    pub fn with_object(object: ObjRef, outer: Option<StashRef>) -> StashRef {
        Arc::new(RwLock::new(Stash {
            values: Vec::new(),
            template: None,
            with_object: Some(object),
            outer,
        }))
    }

    /// Reads a slot.
    pub fn get(&self, idx: u16) -> Value {
        self.values[idx as usize].clone()
    }

    /// Writes a slot.
    pub fn set(&mut self, idx: u16, value: Value) {
        self.values[idx as usize] = value;
    }

    /// The backing object, for dynamic scopes.
    pub fn backing_object(&self) -> Option<ObjRef> {
        self.with_object.clone()
    }

    /// Finds a named slot in this stash alone.
    pub fn slot_of(&self, name: &str) -> Option<u16> {
        self.template.as_ref().and_then(|t| t.names.get(name).copied())
    }
}

/// Where a name-keyed (dynamic) lookup landed.
#[derive(Debug, Clone)]
pub enum DynamicSlot {
    /// A slot in a regular stash.
    Stash(StashRef, u16),
    /// A property of a `with` object.
    With(ObjRef),
}

/// Resolves `name` through the stash chain at runtime: `with` objects are
/// consulted by property lookup (prototype chain included), slotted stashes
/// by their template's name table. Returns `None` when only the global
/// environment remains.
pub fn dynamic_lookup(head: &Option<StashRef>, name: &str) -> Option<DynamicSlot> {
    let mut cursor = head.clone();
    while let Some(stash) = cursor {
        let guard = stash.read();
        if let Some(object) = guard.backing_object() {
            if object.has_property(name) {
                return Some(DynamicSlot::With(object));
            }
        } else if let Some(idx) = guard.slot_of(name) {
            drop(guard);
            return Some(DynamicSlot::Stash(stash, idx));
        }
        let outer = guard.outer.clone();
        drop(guard);
        cursor = outer;
    }
    None
}

/// One link of the private-environment chain, created per class evaluation.
/// The serial number is the class's brand: private fields on instances are
/// keyed by (serial, slot), so two evaluations of the same class literal
/// produce distinct brands.
#[derive(Debug)]
pub struct PrivateEnv {
    /// The names declared by the class body.
    pub template: Arc<PrivateTemplate>,
    /// The brand of this class evaluation.
    pub serial: u64,
    /// The enclosing class's environment.
    pub outer: Option<PrivateEnvRef>,
}

/// Shared handle to a private environment.
pub type PrivateEnvRef = Arc<PrivateEnv>;

impl PrivateEnv {
    /// Walks `level` links out from `head`.
    pub fn at_level(head: &Option<PrivateEnvRef>, level: u16) -> Option<PrivateEnvRef> {
        let mut cursor = head.clone();
        for _ in 0..level {
            cursor = cursor.and_then(|env| env.outer.clone());
        }
        cursor
    }

    /// The declared name of a slot, for error messages.
    pub fn name_of(&self, idx: u16) -> String {
        self.template
            .names
            .iter()
            .find_map(|(name, &slot)| (slot == idx).then(|| name.clone()))
            .unwrap_or_else(|| "?".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashMap;

    fn template(names: &[&str]) -> Arc<StashTemplate> {
        let mut map = FxHashMap::default();
        for (i, name) in names.iter().enumerate() {
            map.insert(name.to_string(), i as u16);
        }
        Arc::new(StashTemplate { names: map, size: names.len() as u16 })
    }

    #[test]
    fn test_slots_start_uninitialized() {
        let stash = Stash::from_template(template(&["x"]), None);
        assert!(matches!(stash.read().get(0), Value::Uninit));
        stash.write().set(0, Value::Number(1.0));
        assert_eq!(stash.read().get(0), Value::Number(1.0));
    }

    #[test]
    fn test_dynamic_lookup_walks_chain() {
        let outer = Stash::from_template(template(&["x"]), None);
        outer.write().set(0, Value::Number(1.0));
        let inner = Stash::from_template(template(&["y"]), Some(outer.clone()));
        let head = Some(inner);
        match dynamic_lookup(&head, "x") {
            Some(DynamicSlot::Stash(stash, idx)) => {
                assert_eq!(stash.read().get(idx), Value::Number(1.0));
            }
            other => panic!("expected a stash slot, got {other:?}"),
        }
        assert!(dynamic_lookup(&head, "zz").is_none());
    }

    #[test]
    fn test_with_object_shadows_outer_slots() {
        let outer = Stash::from_template(template(&["x"]), None);
        let object = ObjRef::new(None);
        object.set("x", Value::Number(9.0));
        let with = Stash::with_object(object, Some(outer));
        match dynamic_lookup(&Some(with), "x") {
            Some(DynamicSlot::With(obj)) => {
                assert_eq!(obj.get("x"), Some(Value::Number(9.0)));
            }
            other => panic!("expected the with object, got {other:?}"),
        }
    }

    #[test]
    fn test_private_env_levels() {
        let outer = Arc::new(PrivateEnv {
            template: Arc::new(PrivateTemplate::default()),
            serial: 1,
            outer: None,
        });
        let inner = Arc::new(PrivateEnv {
            template: Arc::new(PrivateTemplate::default()),
            serial: 2,
            outer: Some(outer),
        });
        let head = Some(inner);
        assert_eq!(PrivateEnv::at_level(&head, 0).unwrap().serial, 2);
        assert_eq!(PrivateEnv::at_level(&head, 1).unwrap().serial, 1);
        assert!(PrivateEnv::at_level(&head, 2).is_none());
    }
}
