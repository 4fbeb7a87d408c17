//! The [`Engine`] facade.
//!
//! Bundles the entity registry with the scheduler and routes every registry
//! change through the scheduler, so systems hear about entities as soon as
//! the call that created, changed or removed them returns.
//!
//! ```
//! use keel_engine::prelude::*;
//!
//! #[derive(Debug)]
//! struct Health(u32);
//! impl Component for Health {}
//!
//! #[derive(Default)]
//! struct Census { alive: usize }
//! impl Module for Census {}
//! impl System for Census {
//!     fn execute(&mut self, ctx: &mut Context<'_>) -> anyhow::Result<()> {
//!         self.alive = ctx.world().get_entities::<(Health,)>().count();
//!         Ok(())
//!     }
//! }
//!
//! let mut engine = Engine::new();
//! engine.register_system(Census::default()).unwrap();
//! engine.create_entity(Some("hero"), |e| { e.attach(Health(10)); }).unwrap();
//! engine.execute();
//! assert_eq!(engine.system::<Census>().unwrap().alive, 1);
//! ```

use keel_ecs::prelude::*;

use crate::bus::{Mediator, Module, ModuleId, Query};
use crate::clock::Clock;
use crate::context::Context;
use crate::scheduler::{EngineConfig, Scheduler};
use crate::system::{System, SystemFactory};
use crate::task::{self, TaskHandle};
use crate::EngineError;

/// Entity registry plus scheduler.
#[derive(Debug, Default)]
pub struct Engine {
    world: EntityRegistry,
    scheduler: Scheduler,
}

impl Engine {
    /// An empty engine with the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty engine on wall-clock time with `config`.
    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            world: EntityRegistry::new(),
            scheduler: Scheduler::new(config),
        }
    }

    /// An engine reading time from `clock`.
    pub fn with_clock(config: EngineConfig, clock: impl Clock + 'static) -> Self {
        Self {
            world: EntityRegistry::new(),
            scheduler: Scheduler::with_clock(config, clock),
        }
    }

    // -- parts ----------------------------------------------------------------

    /// The entity registry.
    pub fn world(&self) -> &EntityRegistry {
        &self.world
    }

    /// Direct registry access. Lifecycle events raised through it reach
    /// systems at the next facade call or frame.
    pub fn world_mut(&mut self) -> &mut EntityRegistry {
        &mut self.world
    }

    /// The scheduler.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// The scheduler, mutably, e.g. to change speed.
    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    /// The message bus.
    pub fn bus(&self) -> &Mediator {
        self.scheduler.bus()
    }

    // -- frame ----------------------------------------------------------------

    /// Run one frame.
    pub fn execute(&mut self) {
        self.scheduler.execute(&mut self.world);
    }

    /// Frames executed so far.
    pub fn tick_count(&self) -> u64 {
        self.scheduler.tick_count()
    }

    // -- entities -------------------------------------------------------------

    /// Create an entity and announce it to every system.
    ///
    /// # Errors
    ///
    /// [`EcsError::AlreadyExists`] if `name` is taken.
    pub fn create_entity<F>(&mut self, name: Option<&str>, post_create: F) -> Result<EntityId, EngineError>
    where
        F: FnOnce(&mut Entity),
    {
        let id = self.world.create_entity(name, post_create)?;
        self.scheduler.flush_events(&mut self.world);
        Ok(id)
    }

    /// Announce the removal of entity `id` to every system, then drop it.
    pub fn remove_entity(&mut self, id: EntityId) -> Result<(), EngineError> {
        self.world.remove_entity(id)?;
        self.scheduler.flush_events(&mut self.world);
        Ok(())
    }

    /// Remove the entity called `name`.
    pub fn remove_entity_named(&mut self, name: &str) -> Result<EntityId, EngineError> {
        let id = self.world.remove_entity_named(name)?;
        self.scheduler.flush_events(&mut self.world);
        Ok(id)
    }

    /// The entity with identifier `id`.
    pub fn entity(&self, id: EntityId) -> Result<&Entity, EngineError> {
        Ok(self.world.entity(id)?)
    }

    /// The entity called `name`.
    pub fn entity_named(&self, name: &str) -> Result<&Entity, EngineError> {
        Ok(self.world.entity_named(name)?)
    }

    /// Attach `component` to `id` and let systems re-evaluate the entity.
    pub fn attach_component<T: Component>(&mut self, id: EntityId, component: T) -> Result<(), EngineError> {
        self.world.attach_component(id, component)?;
        self.scheduler.flush_events(&mut self.world);
        Ok(())
    }

    /// Detach the `T` of `id` and let systems re-evaluate the entity.
    pub fn detach_component<T: Component>(&mut self, id: EntityId) -> Result<T, EngineError> {
        let component = self.world.detach_component::<T>(id)?;
        self.scheduler.flush_events(&mut self.world);
        Ok(component)
    }

    /// Make `parent` the parent of `child`.
    pub fn add_link(&mut self, parent: EntityId, child: EntityId) -> Result<(), EngineError> {
        Ok(self.world.add_link(parent, child)?)
    }

    /// The parent recorded for `child`.
    pub fn parent_of(&self, child: EntityId) -> Result<&Entity, EngineError> {
        Ok(self.world.parent_of(child)?)
    }

    // -- systems --------------------------------------------------------------

    /// Register `system`. See [`Scheduler::register`].
    pub fn register_system<S: System>(&mut self, system: S) -> Result<ModuleId, EngineError> {
        self.scheduler.register(system)
    }

    /// Build and register one system per factory, in order. Stops at the
    /// first failure; entities created by the factories that ran are
    /// announced either way.
    pub fn load_systems(&mut self, factories: &[SystemFactory]) -> Result<Vec<ModuleId>, EngineError> {
        let mut ids = Vec::with_capacity(factories.len());
        let mut outcome = Ok(());
        for factory in factories {
            let boxed = factory(&mut self.world);
            tracing::debug!(system = boxed.name(), "loading system from factory");
            match self.scheduler.register_boxed(boxed) {
                Ok(id) => ids.push(id),
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            }
        }
        self.scheduler.flush_events(&mut self.world);
        outcome.map(|()| ids)
    }

    /// Unregister system `S`. See [`Scheduler::remove_system`].
    pub fn remove_system<S: System>(&mut self) -> Result<(), EngineError> {
        self.scheduler.remove_system::<S>()
    }

    /// Whether system `S` is registered.
    pub fn has_system<S: System>(&self) -> bool {
        self.scheduler.has_system::<S>()
    }

    /// The registered instance of `S`.
    pub fn system<S: System>(&self) -> Result<&S, EngineError> {
        self.scheduler.system::<S>()
    }

    /// The registered instance of `S`, mutably.
    pub fn system_mut<S: System>(&mut self) -> Result<&mut S, EngineError> {
        self.scheduler.system_mut::<S>()
    }

    // -- modules and messages -------------------------------------------------

    /// Add a non-system module to the bus.
    pub fn add_module<M: Module>(&mut self, module: M) -> ModuleId {
        self.scheduler.bus_mut().add_module(module)
    }

    /// Remove a module. A system's id unregisters the system. See
    /// [`Scheduler::remove_module`].
    pub fn remove_module(&mut self, id: ModuleId) -> bool {
        self.scheduler.remove_module(id)
    }

    /// The value of module `id`, if it is an `M`.
    pub fn module<M: Module>(&self, id: ModuleId) -> Option<&M> {
        self.scheduler.bus().module::<M>(id)
    }

    /// The value of module `id`, mutably.
    pub fn module_mut<M: Module>(&mut self, id: ModuleId) -> Option<&mut M> {
        self.scheduler.bus_mut().module_mut::<M>(id)
    }

    /// Broadcast `message`. See [`Context::send`].
    pub fn send<T: 'static>(&mut self, message: T) {
        self.with_context(|ctx| ctx.send(message));
    }

    /// Deliver `message` to `target`. See [`Context::send_to`].
    pub fn send_to<T: 'static>(&mut self, target: ModuleId, message: T) -> Result<(), EngineError> {
        self.with_context(|ctx| ctx.send_to(target, message))
    }

    /// Ask `query` and return the reply. See [`Context::query`].
    pub fn query<Q: Query>(&mut self, query: Q) -> Result<Q::Response, EngineError> {
        self.with_context(|ctx| ctx.query(query))
    }

    /// Run `f` with a top-level [`Context`].
    pub fn with_context<R>(&mut self, f: impl FnOnce(&mut Context<'_>) -> R) -> R {
        self.scheduler.with_context(&mut self.world, f)
    }

    // -- background work ------------------------------------------------------

    /// Run `work` on a background thread named `name`. Poll the handle from
    /// the frame loop to bring its result back.
    pub fn run_async<T, F>(&self, name: &str, work: F) -> Result<TaskHandle<T>, EngineError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        task::spawn(name, work)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
