//! Per-dispatch execution context.
//!
//! Every system call, entity hook and message handler receives a
//! [`Context`]. It lends out the entity registry and the message bus for
//! the duration of the call and is the only way to send messages, so a
//! handler that sends from inside another handler simply nests contexts on
//! the same stack.

use std::any::{type_name, Any};
use std::time::Duration;

use keel_ecs::prelude::*;

use crate::bus::{Mediator, ModuleBody, ModuleId, Query};
use crate::scheduler::Scheduler;
use crate::system::{isolate, Stage, System};
use crate::EngineError;

/// Work deferred until the current system's call has returned.
pub type AfterSystemFn = Box<dyn FnOnce(&mut EntityRegistry, &mut Scheduler)>;

/// A queued [`AfterSystemFn`] with the name of the module that queued it.
pub(crate) struct Deferred {
    pub(crate) owner: String,
    pub(crate) callback: AfterSystemFn,
}

/// Borrowed engine state handed to systems and handlers.
pub struct Context<'a> {
    world: &'a mut EntityRegistry,
    bus: &'a mut Mediator,
    after: &'a mut Vec<Deferred>,
    delta: Duration,
    current: Option<ModuleId>,
    catch_panics: bool,
}

impl<'a> Context<'a> {
    pub(crate) fn new(
        world: &'a mut EntityRegistry,
        bus: &'a mut Mediator,
        after: &'a mut Vec<Deferred>,
        delta: Duration,
        current: Option<ModuleId>,
        catch_panics: bool,
    ) -> Self {
        Self {
            world,
            bus,
            after,
            delta,
            current,
            catch_panics,
        }
    }

    /// A context for a call into `module`, borrowing from this one.
    fn nested(&mut self, module: ModuleId) -> Context<'_> {
        Context {
            world: &mut *self.world,
            bus: &mut *self.bus,
            after: &mut *self.after,
            delta: self.delta,
            current: Some(module),
            catch_panics: self.catch_panics,
        }
    }

    // -- state ----------------------------------------------------------------

    /// The entity registry.
    pub fn world(&self) -> &EntityRegistry {
        self.world
    }

    /// The entity registry, mutably. Lifecycle events raised here reach
    /// systems once the current call returns.
    pub fn world_mut(&mut self) -> &mut EntityRegistry {
        self.world
    }

    /// The message bus.
    pub fn bus(&self) -> &Mediator {
        self.bus
    }

    /// Scaled time since the running system last executed. Zero inside
    /// hooks and handlers called outside a frame.
    pub fn delta_time(&self) -> Duration {
        self.delta
    }

    /// [`delta_time`](Self::delta_time) in seconds.
    pub fn delta_seconds(&self) -> f32 {
        self.delta.as_secs_f32()
    }

    /// The module this context was created for, `None` at the top level.
    pub fn current_module(&self) -> Option<ModuleId> {
        self.current
    }

    /// Another registered system.
    ///
    /// # Errors
    ///
    /// [`EngineError::SystemNotFound`] if `S` is not registered, or is the
    /// system currently running.
    pub fn system<S: System>(&self) -> Result<&S, EngineError> {
        self.bus
            .module_of_kind(KindId::of::<S>())
            .and_then(|id| self.bus.module::<S>(id))
            .ok_or(EngineError::SystemNotFound {
                system: type_name::<S>(),
            })
    }

    /// Another registered system, mutably.
    pub fn system_mut<S: System>(&mut self) -> Result<&mut S, EngineError> {
        let not_found = || EngineError::SystemNotFound {
            system: type_name::<S>(),
        };
        let id = self.bus.module_of_kind(KindId::of::<S>()).ok_or_else(not_found)?;
        self.bus.module_mut::<S>(id).ok_or_else(not_found)
    }

    /// Queue `f` to run once the current system call has returned, with
    /// full access to the scheduler. `f` runs behind the same isolation
    /// boundary as the system that queued it.
    pub fn run_after_system<F>(&mut self, f: F)
    where
        F: FnOnce(&mut EntityRegistry, &mut Scheduler) + 'static,
    {
        let owner = self
            .current
            .and_then(|id| self.bus.name_of(id))
            .unwrap_or("engine")
            .to_owned();
        self.after.push(Deferred {
            owner,
            callback: Box::new(f),
        });
    }

    // -- messaging ------------------------------------------------------------

    /// Deliver `message` to every module subscribed to its kind, in
    /// subscription order. Returns once every handler has run. Sending a
    /// kind nobody subscribes to does nothing.
    pub fn send<T: Any>(&mut self, message: T) {
        let kind = KindId::of::<T>();
        let targets = self.bus.subscribers(kind).to_vec();
        tracing::trace!(%kind, subscribers = targets.len(), "broadcast");
        for target in targets {
            if let Err(err) = self.deliver(target, kind, &message) {
                // Removed by an earlier handler of the same broadcast.
                tracing::trace!(%kind, %err, "subscriber vanished mid-broadcast");
            }
        }
    }

    /// Deliver `message` to `target` only, whether or not it subscribes to
    /// the kind through the table. A target without a handler for the kind
    /// ignores the message.
    ///
    /// # Errors
    ///
    /// [`EngineError::ModuleNotFound`] if `target` does not exist.
    pub fn send_to<T: Any>(&mut self, target: ModuleId, message: T) -> Result<(), EngineError> {
        self.deliver(target, KindId::of::<T>(), &message)
    }

    /// Ask a question and wait for the answer.
    ///
    /// A short-lived module subscribed to `Q::Response` is set as the
    /// query's sender and the query is broadcast; whichever module handles
    /// it replies with [`send_to`](Self::send_to) during the broadcast.
    ///
    /// # Errors
    ///
    /// [`EngineError::NoResponse`] if no handler replied.
    pub fn query<Q: Query>(&mut self, mut query: Q) -> Result<Q::Response, EngineError> {
        let asker = self.bus.insert(
            format!("query<{}>", keel_ecs::kind::short_name(type_name::<Q>())),
            KindId::of::<Option<Q::Response>>(),
            response_handler::<Q::Response>(),
            ModuleBody::Plain(Box::new(None::<Q::Response>)),
        );
        query.set_sender(asker);
        self.send(query);

        let answer = self
            .bus
            .take_module(asker)
            .flatten()
            .and_then(|body| body.into_any().downcast::<Option<Q::Response>>().ok())
            .and_then(|slot| *slot);
        answer.ok_or_else(|| {
            tracing::warn!(query = type_name::<Q>(), "query received no response");
            EngineError::NoResponse {
                query: type_name::<Q>(),
            }
        })
    }

    fn deliver(&mut self, target: ModuleId, kind: KindId, message: &dyn Any) -> Result<(), EngineError> {
        let handler = self
            .bus
            .handler(target, kind)
            .map_err(|()| EngineError::ModuleNotFound { module: target })?;
        let name = self.bus.name_of(target).unwrap_or_default().to_owned();
        let Some(handler) = handler else {
            tracing::warn!(module = %name, %kind, "module has no handler for message kind");
            return Ok(());
        };
        let Some(mut body) = self.bus.take_body(target) else {
            tracing::debug!(module = %name, %kind, "skipping re-entrant delivery");
            return Ok(());
        };

        let catch_panics = self.catch_panics;
        {
            let mut ctx = self.nested(target);
            // Failures are logged by `isolate` and never reach the sender.
            let _ = isolate(&name, Stage::Message(kind), catch_panics, || {
                handler(body.as_any_mut(), &mut ctx, message)
            });
        }
        self.bus.restore_body(target, body);
        Ok(())
    }
}

/// Handler table of the short-lived module behind [`Context::query`].
fn response_handler<R: Clone + 'static>() -> crate::bus::HandlerTable {
    let mut subs = crate::bus::Subscriptions::<Option<R>>::new();
    subs.on(|slot: &mut Option<R>, _ctx, response: &R| {
        *slot = Some(response.clone());
        Ok(())
    });
    subs.into_handlers()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Module, Subscriptions};

    #[derive(Debug, Clone, PartialEq)]
    struct Add(i32, i32);

    #[derive(Debug, Clone, PartialEq)]
    struct Sum(i32);

    struct AskSum {
        a: i32,
        b: i32,
        sender: Option<ModuleId>,
    }

    impl Query for AskSum {
        type Response = Sum;

        fn set_sender(&mut self, sender: ModuleId) {
            self.sender = Some(sender);
        }
    }

    #[derive(Default)]
    struct Calculator {
        adds: Vec<i32>,
    }

    impl Module for Calculator {
        fn subscriptions(subs: &mut Subscriptions<Self>) {
            subs.on(|calc: &mut Calculator, _ctx, add: &Add| {
                calc.adds.push(add.0 + add.1);
                Ok(())
            })
            .on(|_: &mut Calculator, ctx, ask: &AskSum| {
                let sender = ask.sender.ok_or_else(|| anyhow::anyhow!("no sender"))?;
                ctx.send_to(sender, Sum(ask.a + ask.b))?;
                Ok(())
            });
        }
    }

    /// Forwards every `Add` as a doubled `Add` to itself via broadcast.
    #[derive(Default)]
    struct Echo {
        seen: u32,
    }

    impl Module for Echo {
        fn subscriptions(subs: &mut Subscriptions<Self>) {
            subs.on(|echo: &mut Echo, ctx, add: &Add| {
                echo.seen += 1;
                ctx.send(Add(add.0 * 2, add.1 * 2));
                Ok(())
            });
        }
    }

    struct Harness {
        world: EntityRegistry,
        bus: Mediator,
        after: Vec<Deferred>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                world: EntityRegistry::new(),
                bus: Mediator::new(),
                after: Vec::new(),
            }
        }

        fn ctx(&mut self) -> Context<'_> {
            Context::new(&mut self.world, &mut self.bus, &mut self.after, Duration::ZERO, None, true)
        }
    }

    #[test]
    fn send_without_subscribers_is_noop() {
        let mut h = Harness::new();
        h.ctx().send(Add(1, 2));
        assert!(h.bus.is_empty());
    }

    #[test]
    fn send_reaches_every_subscriber_once() {
        let mut h = Harness::new();
        let a = h.bus.add_module(Calculator::default());
        let b = h.bus.add_module(Calculator::default());
        h.ctx().send(Add(2, 3));
        assert_eq!(h.bus.module::<Calculator>(a).unwrap().adds, vec![5]);
        assert_eq!(h.bus.module::<Calculator>(b).unwrap().adds, vec![5]);
    }

    #[test]
    fn send_to_targets_one_module() {
        let mut h = Harness::new();
        let a = h.bus.add_module(Calculator::default());
        let b = h.bus.add_module(Calculator::default());
        h.ctx().send_to(b, Add(1, 1)).unwrap();
        assert!(h.bus.module::<Calculator>(a).unwrap().adds.is_empty());
        assert_eq!(h.bus.module::<Calculator>(b).unwrap().adds, vec![2]);

        h.bus.remove_module(b);
        assert!(matches!(
            h.ctx().send_to(b, Add(1, 1)),
            Err(EngineError::ModuleNotFound { module }) if module == b
        ));
    }

    #[test]
    fn query_returns_handler_response() {
        let mut h = Harness::new();
        h.bus.add_module(Calculator::default());
        let before = h.bus.len();

        let sum = h
            .ctx()
            .query(AskSum {
                a: 20,
                b: 22,
                sender: None,
            })
            .unwrap();
        assert_eq!(sum, Sum(42));
        assert_eq!(h.bus.len(), before);
        assert_eq!(h.bus.subscriber_count::<Sum>(), 0);
    }

    #[test]
    fn query_without_responder_fails() {
        let mut h = Harness::new();
        let err = h
            .ctx()
            .query(AskSum {
                a: 1,
                b: 1,
                sender: None,
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::NoResponse { .. }));
        assert!(h.bus.is_empty());
    }

    #[test]
    fn reentrant_delivery_is_skipped() {
        let mut h = Harness::new();
        let echo = h.bus.add_module(Echo::default());
        let calc = h.bus.add_module(Calculator::default());
        h.ctx().send(Add(1, 2));

        // Echo ran once; its nested broadcast skipped itself and reached
        // the calculator before the outer broadcast did.
        assert_eq!(h.bus.module::<Echo>(echo).unwrap().seen, 1);
        assert_eq!(h.bus.module::<Calculator>(calc).unwrap().adds, vec![6, 3]);
    }

    #[test]
    fn failing_handler_does_not_stop_broadcast() {
        struct Grumpy;
        impl Module for Grumpy {
            fn subscriptions(subs: &mut Subscriptions<Self>) {
                subs.on(|_: &mut Grumpy, _ctx, _: &Add| anyhow::bail!("no"));
            }
        }

        let mut h = Harness::new();
        h.bus.add_module(Grumpy);
        let calc = h.bus.add_module(Calculator::default());
        h.ctx().send(Add(1, 1));
        assert_eq!(h.bus.module::<Calculator>(calc).unwrap().adds, vec![2]);
    }

    #[test]
    fn run_after_system_queues_callback() {
        let mut h = Harness::new();
        h.ctx().run_after_system(|world, _| {
            world.create_entity(Some("late"), |_| {}).unwrap();
        });
        assert_eq!(h.after.len(), 1);
        assert_eq!(h.after[0].owner, "engine");
    }
}
