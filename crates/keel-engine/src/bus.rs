//! The message bus.
//!
//! A [`Mediator`] routes plain Rust values between modules. Every module
//! declares, once, which message kinds it handles (see [`Module::subscriptions`]);
//! the bus keeps a subscription table from [`KindId`] to module and delivers
//! synchronously. Sending itself happens through a
//! [`Context`](crate::context::Context), which also gives handlers access to
//! the entity registry.
//!
//! Module values live inside the bus. While a module's work or one of its
//! handlers runs, its value is taken out of its slot and put back afterwards;
//! a delivery that reaches a module whose value is out is skipped.

use std::any::{type_name, Any};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use keel_ecs::kind::short_name;
use keel_ecs::prelude::*;

use crate::context::Context;
use crate::system::System;

// ---------------------------------------------------------------------------
// ModuleId
// ---------------------------------------------------------------------------

/// Handle of a module registered with a [`Mediator`]. Never reused.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct ModuleId(u64);

impl ModuleId {
    /// The raw counter value.
    pub fn to_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModuleId({})", self.0)
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "module#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Module / Query
// ---------------------------------------------------------------------------

/// A participant on the bus.
///
/// The only thing a module states is which messages it handles. The set is
/// collected once when the module is added and never changes afterwards.
///
/// ```
/// use keel_engine::prelude::*;
///
/// struct Ping(u32);
///
/// #[derive(Default)]
/// struct Counter { seen: u32 }
///
/// impl Module for Counter {
///     fn subscriptions(subs: &mut Subscriptions<Self>) {
///         subs.on(|counter: &mut Counter, _ctx, ping: &Ping| {
///             counter.seen += ping.0;
///             Ok(())
///         });
///     }
/// }
///
/// let mut engine = Engine::new();
/// let id = engine.add_module(Counter::default());
/// engine.send(Ping(3));
/// engine.send(Ping(4));
/// assert_eq!(engine.module::<Counter>(id).unwrap().seen, 7);
/// ```
pub trait Module: Any {
    /// Declare the message kinds this module handles.
    fn subscriptions(_subs: &mut Subscriptions<Self>)
    where
        Self: Sized,
    {
    }
}

/// A message that expects a reply.
///
/// A query carries the id of whoever asked; the module handling it answers
/// with [`Context::send_to`](crate::context::Context::send_to) addressed to
/// that id. [`Context::query`](crate::context::Context::query) fills the
/// sender in and collects the reply.
pub trait Query: Any {
    /// The reply message.
    type Response: Clone + 'static;

    /// Record who is asking.
    fn set_sender(&mut self, sender: ModuleId);
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

/// Type-erased message handler: `(module value, context, message)`.
pub(crate) type ErasedHandler = dyn Fn(&mut dyn Any, &mut Context<'_>, &dyn Any) -> anyhow::Result<()>;

pub(crate) type HandlerTable = HashMap<KindId, Rc<ErasedHandler>>;

fn erase<F>(handler: F) -> Rc<ErasedHandler>
where
    F: Fn(&mut dyn Any, &mut Context<'_>, &dyn Any) -> anyhow::Result<()> + 'static,
{
    Rc::new(handler)
}

/// Builder for the handler table of a module of type `M`.
pub struct Subscriptions<M> {
    handlers: HandlerTable,
    _marker: PhantomData<fn(&mut M)>,
}

impl<M: Any> Subscriptions<M> {
    pub(crate) fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            _marker: PhantomData,
        }
    }

    /// Handle messages of kind `T`. A second handler for the same kind
    /// replaces the first.
    pub fn on<T, F>(&mut self, handler: F) -> &mut Self
    where
        T: Any,
        F: Fn(&mut M, &mut Context<'_>, &T) -> anyhow::Result<()> + 'static,
    {
        let erased = erase(move |module, ctx, message| {
            let (Some(module), Some(message)) = (module.downcast_mut::<M>(), message.downcast_ref::<T>()) else {
                anyhow::bail!("handler for {} got a mismatched module or message", type_name::<M>());
            };
            handler(module, ctx, message)
        });
        self.handlers.insert(KindId::of::<T>(), erased);
        self
    }

    /// Number of message kinds handled.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no message kind is handled.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub(crate) fn into_handlers(self) -> HandlerTable {
        self.handlers
    }
}

/// The handler table `M` declares.
pub(crate) fn handlers_of<M: Module>() -> HandlerTable {
    let mut subs = Subscriptions::<M>::new();
    M::subscriptions(&mut subs);
    subs.into_handlers()
}

// ---------------------------------------------------------------------------
// Module storage
// ---------------------------------------------------------------------------

/// The value behind a module id.
pub(crate) enum ModuleBody {
    System(Box<dyn System>),
    Plain(Box<dyn Any>),
}

impl ModuleBody {
    pub(crate) fn as_any(&self) -> &dyn Any {
        match self {
            ModuleBody::System(system) => (**system).as_any(),
            ModuleBody::Plain(value) => &**value,
        }
    }

    pub(crate) fn as_any_mut(&mut self) -> &mut dyn Any {
        match self {
            ModuleBody::System(system) => (**system).as_any_mut(),
            ModuleBody::Plain(value) => &mut **value,
        }
    }

    pub(crate) fn into_any(self) -> Box<dyn Any> {
        match self {
            ModuleBody::System(system) => system.into_any(),
            ModuleBody::Plain(value) => value,
        }
    }
}

struct ModuleEntry {
    name: String,
    kind: KindId,
    handlers: HandlerTable,
    /// Owned by the scheduler's schedule.
    system: bool,
    /// `None` while the module is running.
    body: Option<ModuleBody>,
}

// ---------------------------------------------------------------------------
// Mediator
// ---------------------------------------------------------------------------

/// Subscription table plus the modules it routes to.
#[derive(Default)]
pub struct Mediator {
    modules: BTreeMap<ModuleId, ModuleEntry>,
    /// kind -> subscribers, in registration order.
    subscriptions: HashMap<KindId, Vec<ModuleId>>,
    next_id: u64,
}

impl fmt::Debug for Mediator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mediator")
            .field("modules", &self.modules.values().map(|m| &m.name).collect::<Vec<_>>())
            .field("kinds", &self.subscriptions.len())
            .finish()
    }
}

impl Mediator {
    /// An empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    // -- membership -----------------------------------------------------------

    /// Add a module and subscribe it to every kind it declares.
    pub fn add_module<M: Module>(&mut self, module: M) -> ModuleId {
        let handlers = handlers_of::<M>();
        self.insert(
            short_name(type_name::<M>()).to_owned(),
            KindId::of::<M>(),
            handlers,
            ModuleBody::Plain(Box::new(module)),
        )
    }

    pub(crate) fn insert(&mut self, name: String, kind: KindId, handlers: HandlerTable, body: ModuleBody) -> ModuleId {
        let id = ModuleId(self.next_id);
        self.next_id += 1;

        let mut kinds: Vec<KindId> = handlers.keys().copied().collect();
        kinds.sort();
        for kind in kinds {
            self.subscriptions.entry(kind).or_default().push(id);
        }
        tracing::debug!(module = %id, %name, handlers = handlers.len(), "module added");
        self.modules.insert(
            id,
            ModuleEntry {
                name,
                kind,
                handlers,
                system: matches!(body, ModuleBody::System(_)),
                body: Some(body),
            },
        );
        id
    }

    /// Drop a module and every subscription it held. Returns whether the
    /// module was removed.
    ///
    /// System ids are refused: systems leave the bus through
    /// [`Scheduler::remove_system`](crate::scheduler::Scheduler::remove_system)
    /// so the schedule and the bus stay in step.
    pub fn remove_module(&mut self, id: ModuleId) -> bool {
        if self.is_system(id) {
            tracing::warn!(module = %id, "refusing to remove a system from the bus directly");
            return false;
        }
        self.take_module(id).is_some()
    }

    /// Remove a module and hand back its value (`None` if the id is unknown
    /// or the value is currently out).
    pub(crate) fn take_module(&mut self, id: ModuleId) -> Option<Option<ModuleBody>> {
        let entry = self.modules.remove(&id)?;
        self.subscriptions.retain(|_, subscribers| {
            subscribers.retain(|m| *m != id);
            !subscribers.is_empty()
        });
        tracing::debug!(module = %id, name = %entry.name, "module removed");
        Some(entry.body)
    }

    /// Whether `id` is a live module.
    pub fn contains(&self, id: ModuleId) -> bool {
        self.modules.contains_key(&id)
    }

    /// Whether `id` is a module registered as a system.
    pub fn is_system(&self, id: ModuleId) -> bool {
        self.modules.get(&id).is_some_and(|m| m.system)
    }

    /// Number of live modules, systems included.
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Whether no module is registered.
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Display name of a module.
    pub fn name_of(&self, id: ModuleId) -> Option<&str> {
        self.modules.get(&id).map(|m| m.name.as_str())
    }

    /// Modules subscribed to `kind`, in the order deliveries visit them.
    pub fn subscribers(&self, kind: KindId) -> &[ModuleId] {
        self.subscriptions.get(&kind).map(Vec::as_slice).unwrap_or_default()
    }

    /// Number of modules subscribed to messages of type `T`.
    pub fn subscriber_count<T: Any>(&self) -> usize {
        self.subscribers(KindId::of::<T>()).len()
    }

    /// First module whose value is of kind `kind`.
    pub(crate) fn module_of_kind(&self, kind: KindId) -> Option<ModuleId> {
        self.modules
            .iter()
            .find(|(_, entry)| entry.kind == kind)
            .map(|(id, _)| *id)
    }

    // -- typed access ---------------------------------------------------------

    /// The value of module `id`, if it is an `M` and not currently running.
    pub fn module<M: Any>(&self, id: ModuleId) -> Option<&M> {
        self.body(id)?.as_any().downcast_ref()
    }

    /// The value of module `id`, mutably.
    pub fn module_mut<M: Any>(&mut self, id: ModuleId) -> Option<&mut M> {
        self.body_mut(id)?.as_any_mut().downcast_mut()
    }

    pub(crate) fn body(&self, id: ModuleId) -> Option<&ModuleBody> {
        self.modules.get(&id)?.body.as_ref()
    }

    pub(crate) fn body_mut(&mut self, id: ModuleId) -> Option<&mut ModuleBody> {
        self.modules.get_mut(&id)?.body.as_mut()
    }

    // -- delivery support -----------------------------------------------------

    /// Handler of module `id` for `kind`. `Err(())` if the module is gone,
    /// `Ok(None)` if it does not handle the kind.
    pub(crate) fn handler(&self, id: ModuleId, kind: KindId) -> Result<Option<Rc<ErasedHandler>>, ()> {
        let entry = self.modules.get(&id).ok_or(())?;
        Ok(entry.handlers.get(&kind).cloned())
    }

    /// Take a module's value out for the duration of a call.
    pub(crate) fn take_body(&mut self, id: ModuleId) -> Option<ModuleBody> {
        self.modules.get_mut(&id)?.body.take()
    }

    /// Put a value taken with [`take_body`](Self::take_body) back. If the
    /// module was removed meanwhile the value is dropped.
    pub(crate) fn restore_body(&mut self, id: ModuleId, body: ModuleBody) {
        if let Some(entry) = self.modules.get_mut(&id) {
            entry.body = Some(body);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    struct Ping;
    struct Pong;

    #[derive(Default)]
    struct Both {
        pings: u32,
    }

    impl Module for Both {
        fn subscriptions(subs: &mut Subscriptions<Self>) {
            subs.on(|m: &mut Both, _ctx, _: &Ping| {
                m.pings += 1;
                Ok(())
            })
            .on(|_: &mut Both, _ctx, _: &Pong| Ok(()));
        }
    }

    struct Silent;
    impl Module for Silent {}

    #[test]
    fn add_module_subscribes_declared_kinds() {
        let mut bus = Mediator::new();
        let a = bus.add_module(Both::default());
        let b = bus.add_module(Both::default());
        bus.add_module(Silent);

        assert_eq!(bus.subscribers(KindId::of::<Ping>()), &[a, b]);
        assert_eq!(bus.subscriber_count::<Pong>(), 2);
        assert_eq!(bus.subscriber_count::<u8>(), 0);
        assert_eq!(bus.len(), 3);
        assert_eq!(bus.name_of(a), Some("Both"));
    }

    #[test]
    fn remove_module_drops_subscriptions() {
        let mut bus = Mediator::new();
        let a = bus.add_module(Both::default());
        let b = bus.add_module(Both::default());

        assert!(bus.remove_module(a));
        assert!(!bus.remove_module(a));
        assert!(!bus.contains(a));
        assert_eq!(bus.subscribers(KindId::of::<Ping>()), &[b]);

        bus.remove_module(b);
        assert_eq!(bus.subscriber_count::<Ping>(), 0);
    }

    #[test]
    fn system_ids_are_refused() {
        struct Idle;
        impl Module for Idle {}
        impl System for Idle {
            fn execute(&mut self, _ctx: &mut Context<'_>) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let mut bus = Mediator::new();
        let id = bus.insert(
            "Idle".to_owned(),
            KindId::of::<Idle>(),
            HandlerTable::new(),
            ModuleBody::System(Box::new(Idle)),
        );
        assert!(bus.is_system(id));
        assert!(!bus.remove_module(id));
        assert!(bus.contains(id));
        assert!(bus.take_module(id).is_some());
    }

    #[test]
    fn ids_are_not_reused() {
        let mut bus = Mediator::new();
        let a = bus.add_module(Silent);
        bus.remove_module(a);
        let b = bus.add_module(Silent);
        assert_ne!(a, b);
    }

    #[test]
    fn typed_access_fails_while_taken() {
        let mut bus = Mediator::new();
        let id = bus.add_module(Both { pings: 4 });
        assert_eq!(bus.module::<Both>(id).unwrap().pings, 4);
        assert!(bus.module::<Silent>(id).is_none());

        let body = bus.take_body(id).unwrap();
        assert!(bus.module::<Both>(id).is_none());
        assert!(bus.take_body(id).is_none());
        bus.restore_body(id, body);

        bus.module_mut::<Both>(id).unwrap().pings = 9;
        assert_eq!(bus.module::<Both>(id).unwrap().pings, 9);
    }

    #[test]
    fn handler_lookup_distinguishes_missing_module() {
        let mut bus = Mediator::new();
        let id = bus.add_module(Both::default());
        assert!(bus.handler(id, KindId::of::<Ping>()).unwrap().is_some());
        assert!(bus.handler(id, KindId::of::<u64>()).unwrap().is_none());
        bus.remove_module(id);
        assert!(bus.handler(id, KindId::of::<Ping>()).is_err());
    }
}
