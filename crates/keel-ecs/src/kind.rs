//! Stable identifiers for component, message and system kinds.
//!
//! Every Rust type that takes part in the kernel (a component stored on an
//! entity, a message routed through the bus, a system owned by the scheduler)
//! is named by a [`KindId`]. Identifiers are handed out monotonically the
//! first time a type is seen and never change for the rest of the process.
//!
//! The process-wide table behind [`KindId::of`] is created lazily on first
//! registration and lives until process exit. Code that needs an isolated
//! table (tests, tools) builds its own [`KindRegistry`] instead.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

use parking_lot::RwLock;

// ---------------------------------------------------------------------------
// KindId
// ---------------------------------------------------------------------------

/// Opaque, lightweight identifier for one component, message or system type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KindId(pub(crate) u32);

impl KindId {
    /// The identifier of `T` in the process-wide kind table.
    ///
    /// Assigns a fresh identifier the first time `T` is seen; every later call
    /// returns the same value.
    pub fn of<T: ?Sized + 'static>() -> Self {
        let table = global_kinds();
        if let Some(id) = table.read().lookup::<T>() {
            return id;
        }
        // Another thread may have registered `T` between the two locks;
        // `register` is idempotent so the race is harmless.
        table.write().register::<T>()
    }

    /// Raw numeric value, dense from zero in registration order.
    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }

    /// Type name recorded for this identifier in the process-wide table.
    ///
    /// Returns `"<unregistered>"` for identifiers minted by a private
    /// [`KindRegistry`] that the global table has never seen.
    pub fn name(self) -> &'static str {
        global_kinds()
            .read()
            .info(self)
            .map(|info| info.name)
            .unwrap_or("<unregistered>")
    }
}

impl fmt::Debug for KindId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KindId({})", self.0)
    }
}

impl fmt::Display for KindId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", short_name(self.name()), self.0)
    }
}

/// Strip the module path from a `std::any::type_name` string, keeping
/// generic arguments readable (`alloc::vec::Vec<u8>` -> `Vec<u8>`).
pub fn short_name(full: &str) -> &str {
    let head = full.split('<').next().unwrap_or(full);
    match head.rfind("::") {
        Some(pos) => &full[pos + 2..],
        None => full,
    }
}

// ---------------------------------------------------------------------------
// KindInfo
// ---------------------------------------------------------------------------

/// Metadata recorded for a registered kind.
#[derive(Debug, Clone)]
pub struct KindInfo {
    /// Identifier assigned at registration time.
    pub id: KindId,
    /// `std::any::type_name::<T>()`
    pub name: &'static str,
    /// Rust `TypeId` used for deduplication.
    pub type_id: TypeId,
}

// ---------------------------------------------------------------------------
// KindRegistry
// ---------------------------------------------------------------------------

/// Table mapping Rust types to [`KindId`]s.
///
/// A type is registered at most once; registering it again returns the
/// existing identifier.
#[derive(Debug, Default)]
pub struct KindRegistry {
    by_type: HashMap<TypeId, KindId>,
    /// Indexed by `KindId.0`.
    infos: Vec<KindInfo>,
}

impl KindRegistry {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T`, or return its identifier if it is already known.
    pub fn register<T: ?Sized + 'static>(&mut self) -> KindId {
        let type_id = TypeId::of::<T>();
        if let Some(&existing) = self.by_type.get(&type_id) {
            return existing;
        }
        let id = KindId(self.infos.len() as u32);
        self.infos.push(KindInfo {
            id,
            name: std::any::type_name::<T>(),
            type_id,
        });
        self.by_type.insert(type_id, id);
        id
    }

    /// Look up `T` without registering it.
    pub fn lookup<T: ?Sized + 'static>(&self) -> Option<KindId> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    /// Metadata for an identifier minted by this table.
    pub fn info(&self, id: KindId) -> Option<&KindInfo> {
        self.infos.get(id.0 as usize)
    }

    /// Number of registered kinds.
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    /// Whether no kind has been registered yet.
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Forget every registration. Identifiers handed out earlier become
    /// meaningless for this table, so only call this on a private registry
    /// whose identifiers are no longer stored anywhere.
    pub fn clear(&mut self) {
        self.by_type.clear();
        self.infos.clear();
    }
}

fn global_kinds() -> &'static RwLock<KindRegistry> {
    static KINDS: OnceLock<RwLock<KindRegistry>> = OnceLock::new();
    KINDS.get_or_init(|| RwLock::new(KindRegistry::new()))
}

// ---------------------------------------------------------------------------
// AsAny
// ---------------------------------------------------------------------------

/// Upcast helper shared by every trait object the kernel stores.
///
/// Implemented for all `'static` types. Call it on the trait object itself
/// (`(**boxed).as_any()`), not on the `Box`, or the box is what gets erased.
pub trait AsAny: Any {
    /// `&self` as `&dyn Any`.
    fn as_any(&self) -> &dyn Any;
    /// `&mut self` as `&mut dyn Any`.
    fn as_any_mut(&mut self) -> &mut dyn Any;
    /// `Box<Self>` as `Box<dyn Any>`.
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
