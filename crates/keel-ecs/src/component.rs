//! The [`Component`] contract and the per-entity [`ComponentStore`].
//!
//! A store maps each held [`KindId`] to exactly one boxed component and keeps
//! the held kinds in attach order, so generic consumers (serializers,
//! debuggers) can walk an entity without knowing its concrete types.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;

use serde_json::{Map, Value};

use crate::kind::{AsAny, KindId};

// ---------------------------------------------------------------------------
// Component
// ---------------------------------------------------------------------------

/// Data attached to an entity.
///
/// Implementing the trait is usually a one-liner (`impl Component for Foo {}`).
/// Override [`attributes`](Component::attributes) to expose name/value pairs
/// to introspection tools; [`attributes_of`] does the work for any
/// `serde::Serialize` type.
pub trait Component: AsAny + fmt::Debug {
    /// The kind identifier of the concrete type.
    fn kind(&self) -> KindId {
        KindId::of::<Self>()
    }

    /// Attribute name/value pairs for debugging or serialization, if the
    /// component exposes any.
    fn attributes(&self) -> Option<Map<String, Value>> {
        None
    }

    /// Human-readable rendering used in logs and entity descriptions.
    fn debug_string(&self) -> String {
        format!("{self:?}")
    }
}

/// Build an attribute map from a serializable value.
///
/// Structs become their field map; any other shape is stored under a single
/// `"value"` key. Returns `None` if serialization fails.
pub fn attributes_of<T: serde::Serialize + ?Sized>(value: &T) -> Option<Map<String, Value>> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Some(map),
        Ok(other) => {
            let mut map = Map::new();
            map.insert("value".to_owned(), other);
            Some(map)
        }
        Err(err) => {
            tracing::debug!(error = %err, "component attributes are not serializable");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// ComponentStore
// ---------------------------------------------------------------------------

/// Heterogeneous per-entity component storage.
///
/// Holds at most one component per kind. Attaching a kind that is already
/// present replaces the previous instance in place and keeps its position in
/// the kind list.
#[derive(Default)]
pub struct ComponentStore {
    /// Held kinds, in first-attach order.
    kinds: Vec<KindId>,
    components: HashMap<KindId, Box<dyn Component>>,
}

impl fmt::Debug for ComponentStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter().map(|(_, c)| c)).finish()
    }
}

impl ComponentStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `component`, replacing any previous component of the same kind,
    /// and return a mutable reference to the stored value.
    pub fn attach<T: Component>(&mut self, component: T) -> &mut T {
        let kind = KindId::of::<T>();
        let slot = match self.components.entry(kind) {
            Entry::Occupied(mut entry) => {
                tracing::trace!(%kind, "replacing component");
                entry.insert(Box::new(component));
                entry.into_mut()
            }
            Entry::Vacant(entry) => {
                self.kinds.push(kind);
                entry.insert(Box::new(component))
            }
        };
        (**slot)
            .as_any_mut()
            .downcast_mut::<T>()
            .expect("component stored under its own kind")
    }

    /// Remove the component of kind `T`, returning it if it was present.
    pub fn detach<T: Component>(&mut self) -> Option<T> {
        let boxed = self.remove_kind(KindId::of::<T>())?;
        boxed.into_any().downcast::<T>().ok().map(|b| *b)
    }

    /// Remove whatever component is stored under `kind`.
    pub fn remove_kind(&mut self, kind: KindId) -> Option<Box<dyn Component>> {
        let removed = self.components.remove(&kind)?;
        self.kinds.retain(|k| *k != kind);
        Some(removed)
    }

    /// Shared reference to the component of kind `T`.
    pub fn get<T: Component>(&self) -> Option<&T> {
        self.get_dyn(KindId::of::<T>())?.as_any().downcast_ref::<T>()
    }

    /// Mutable reference to the component of kind `T`.
    pub fn get_mut<T: Component>(&mut self) -> Option<&mut T> {
        let boxed = self.components.get_mut(&KindId::of::<T>())?;
        (**boxed).as_any_mut().downcast_mut::<T>()
    }

    /// Type-erased access by kind identifier.
    pub fn get_dyn(&self, kind: KindId) -> Option<&dyn Component> {
        self.components.get(&kind).map(|c| &**c)
    }

    /// Whether a component of kind `T` is held.
    pub fn has<T: Component>(&self) -> bool {
        self.contains(KindId::of::<T>())
    }

    /// Whether a component of the given kind is held.
    pub fn contains(&self, kind: KindId) -> bool {
        self.components.contains_key(&kind)
    }

    /// Held kinds, in first-attach order.
    pub fn kinds(&self) -> &[KindId] {
        &self.kinds
    }

    /// Iterate `(kind, component)` pairs in first-attach order.
    pub fn iter(&self) -> impl Iterator<Item = (KindId, &dyn Component)> + '_ {
        self.kinds
            .iter()
            .filter_map(move |kind| self.get_dyn(*kind).map(|c| (*kind, c)))
    }

    /// Number of held components.
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    /// Whether the store holds nothing.
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
